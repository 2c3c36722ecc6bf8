use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// A unit of retrievable text owned by exactly one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    pub source_name: String,
    pub content: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn make_id(source_id: &str, chunk_index: usize) -> String {
        format!("{source_id}-chunk-{chunk_index}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Allow-list of source ids. Empty means every source participates.
    pub source_ids: Vec<String>,
    pub min_score: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            source_ids: Vec::new(),
            min_score: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub total_chunks: usize,
    pub total_sources: usize,
    pub average_chunks_per_source: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SourceStatus {
    Processing,
    Indexed,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub source_id: String,
    pub source_name: String,
    pub checksum: String,
    pub status: SourceStatus,
    pub chunk_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn is_indexed(&self) -> bool {
        self.status == SourceStatus::Indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_derived_from_source_and_position() {
        assert_eq!(Chunk::make_id("doc1", 0), "doc1-chunk-0");
        assert_eq!(Chunk::make_id("doc1", 2), "doc1-chunk-2");
    }

    #[test]
    fn chunk_without_embedding_deserializes() {
        let raw = r#"{
            "id": "a-chunk-0",
            "sourceId": "a",
            "sourceName": "A",
            "content": "text",
            "metadata": { "chunkIndex": 0, "totalChunks": 1 }
        }"#;
        let chunk: Chunk = serde_json::from_str(raw).expect("chunk should parse");
        assert!(chunk.embedding.is_none());
        assert_eq!(chunk.metadata.total_chunks, 1);
    }
}
