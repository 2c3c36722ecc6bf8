use crate::chunking::ChunkingConfig;
use crate::embeddings::DEFAULT_EMBEDDING_BATCH_SIZE;
use crate::error::RagError;
use crate::retrieval::{DEFAULT_RETRIEVAL_MIN_SCORE, DEFAULT_RETRIEVAL_TOP_K};
use crate::synthesis::{ANSWER_TEMPERATURE, DEFAULT_HISTORY_TURNS, SUGGESTION_TEMPERATURE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Every tunable of the retrieval pipeline. Missing fields in a config file
/// fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub embedding_batch_size: usize,
    pub retrieval_top_k: usize,
    pub retrieval_min_score: f32,
    pub history_turns: usize,
    pub answer_temperature: f32,
    pub suggestion_temperature: f32,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            embedding_batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            retrieval_top_k: DEFAULT_RETRIEVAL_TOP_K,
            retrieval_min_score: DEFAULT_RETRIEVAL_MIN_SCORE,
            history_turns: DEFAULT_HISTORY_TURNS,
            answer_temperature: ANSWER_TEMPERATURE,
            suggestion_temperature: SUGGESTION_TEMPERATURE,
        }
    }
}

impl RagConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, RagError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RagError> {
        self.chunking.validate()?;
        if self.embedding_batch_size == 0 {
            return Err(RagError::InvalidArgument(
                "embedding_batch_size must be greater than zero".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.retrieval_min_score) {
            return Err(RagError::InvalidArgument(format!(
                "retrieval_min_score {} is outside [-1, 1]",
                self.retrieval_min_score
            )));
        }
        Ok(())
    }
}
