pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

pub const CHUNKS_TABLE: &str = "chunks";
pub const SOURCES_TABLE: &str = "sources";
