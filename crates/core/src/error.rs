use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("incompatible vector dimensions: expected {expected}, got {actual}")]
    IncompatibleDimensions { expected: usize, actual: usize },

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("source was removed while it was being indexed: {0}")]
    SourceRemoved(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Failures of the answer generation backend.
///
/// The display strings are shown to the end user as the chat error state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("the generation backend is not configured: set an API key")]
    NotConfigured,

    #[error("the generation backend rejected the API key")]
    Unauthorized,

    #[error("the generation backend quota is exhausted or payment is required")]
    QuotaExceeded,

    #[error("generation failed: {0}")]
    Unknown(String),
}

impl RagError {
    pub fn embedding(error: impl std::fmt::Display) -> Self {
        Self::EmbeddingFailed(error.to_string())
    }

    pub fn persistence(error: impl std::fmt::Display) -> Self {
        Self::PersistenceUnavailable(error.to_string())
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
