pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod similarity;
pub mod stores;
pub mod synthesis;
pub mod traits;

pub use chunking::{build_chunks, chunk_text, normalize_whitespace, ChunkingConfig};
pub use config::RagConfig;
pub use embeddings::{
    Embedder, HttpEmbeddingLoader, LazyEmbedder, NgramModel, DEFAULT_EMBEDDING_BATCH_SIZE,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{GenerationError, RagError, Result};
pub use generation::ChatCompletionsGenerator;
pub use index::VectorIndex;
pub use ingest::{
    discover_text_files, process_document, read_documents_best_effort, source_checksum,
    IngestionReport, SkippedFile, TextDocument,
};
pub use models::{
    ChatMessage, ChatRole, Chunk, ChunkMetadata, IndexStats, SearchOptions, SearchResult,
    SourceRecord, SourceStatus,
};
pub use orchestrator::NotebookCoordinator;
pub use retrieval::Retriever;
pub use similarity::cosine_similarity;
pub use stores::{MemoryBackend, SqliteBackend};
pub use synthesis::{AnswerSynthesizer, Citation, SynthesizedAnswer};
pub use traits::{EmbeddingModel, Generator, ModelLoader, PersistenceBackend};
