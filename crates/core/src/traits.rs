use crate::error::{GenerationError, RagError};
use crate::models::ChatMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A loaded sentence-embedding model.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Returns exactly one vector per input, in input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

/// Expensive one-time construction of an [`EmbeddingModel`].
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, RagError>;
}

/// Key-value durability sink organised in named tables.
///
/// Records are JSON values keyed by id; new tables can be introduced at any
/// time without touching existing ones.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn put_all(&self, table: &str, records: Vec<(String, Value)>) -> Result<(), RagError>;

    async fn delete_all(&self, table: &str, ids: &[String]) -> Result<(), RagError>;

    async fn load_all(&self, table: &str) -> Result<Vec<(String, Value)>, RagError>;

    async fn clear(&self, table: &str) -> Result<(), RagError>;
}

/// Chat-style text generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, GenerationError>;
}
