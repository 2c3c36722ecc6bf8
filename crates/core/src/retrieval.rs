use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::index::VectorIndex;
use crate::models::{SearchOptions, SearchResult};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_RETRIEVAL_TOP_K: usize = 8;
pub const DEFAULT_RETRIEVAL_MIN_SCORE: f32 = 0.3;

/// Embeds a question and searches the index within the enabled sources.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    top_k: usize,
    min_score: f32,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>) -> Self {
        Self {
            embedder,
            index,
            top_k: DEFAULT_RETRIEVAL_TOP_K,
            min_score: DEFAULT_RETRIEVAL_MIN_SCORE,
        }
    }

    pub fn with_limits(mut self, top_k: usize, min_score: f32) -> Self {
        self.top_k = top_k;
        self.min_score = min_score;
        self
    }

    pub async fn retrieve(
        &self,
        query: &str,
        enabled_source_ids: &HashSet<String>,
    ) -> Result<Vec<SearchResult>, RagError> {
        self.retrieve_with(query, enabled_source_ids, self.top_k, self.min_score)
            .await
    }

    /// No enabled sources means no results, and the embedder is not called.
    pub async fn retrieve_with(
        &self,
        query: &str,
        enabled_source_ids: &HashSet<String>,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>, RagError> {
        if enabled_source_ids.is_empty() {
            return Ok(Vec::new());
        }
        if query.trim().is_empty() {
            return Err(RagError::InvalidArgument("query is empty".to_string()));
        }

        let query_embedding = self.embedder.embed(query).await?;
        let mut source_ids = enabled_source_ids.iter().cloned().collect::<Vec<_>>();
        source_ids.sort_unstable();

        let results = self.index.search(
            &query_embedding,
            &SearchOptions {
                top_k,
                source_ids,
                min_score,
            },
        )?;
        debug!(
            query_len = query.len(),
            sources = enabled_source_ids.len(),
            hits = results.len(),
            "retrieved passages"
        );
        Ok(results)
    }
}
