use crate::error::RagError;
use crate::models::{Chunk, ChunkMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// Terminal punctuation run followed by whitespace.
static SENTENCE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+\s+").expect("sentence boundary pattern is valid"));

/// Chunk sizing, measured in characters. `overlap` is measured in words.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            overlap: 50,
            min_chunk_size: 100,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), RagError> {
        if self.max_chunk_size == 0 {
            return Err(RagError::InvalidChunkConfig(
                "max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(RagError::InvalidChunkConfig(format!(
                "min_chunk_size {} exceeds max_chunk_size {}",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapses whitespace inside every paragraph and joins paragraphs with a
/// single `\n`. Runs of blank lines count as one paragraph break.
pub fn normalize_document(text: &str) -> String {
    let mut paragraphs = Vec::new();
    let mut current = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(normalize_whitespace(&current.join(" ")));
                current.clear();
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        paragraphs.push(normalize_whitespace(&current.join(" ")));
    }

    paragraphs.join("\n")
}

/// Splits after `.`, `!` or `?` when followed by whitespace.
pub fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for boundary in SENTENCE_BOUNDARY.find_iter(paragraph) {
        let end = boundary.start() + boundary.as_str().trim_end().len();
        let sentence = paragraph[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = boundary.end();
    }

    let rest = paragraph[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let normalized = normalize_document(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    if char_len(&normalized) <= config.max_chunk_size {
        return vec![normalize_whitespace(&normalized)];
    }

    let mut builder = ChunkBuilder::new(config);
    for paragraph in normalized.split('\n') {
        if char_len(paragraph) > config.max_chunk_size {
            for sentence in split_sentences(paragraph) {
                builder.push(sentence);
            }
        } else {
            builder.push(paragraph);
        }
    }

    builder
        .finish()
        .into_iter()
        .map(|chunk| normalize_whitespace(&chunk))
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

/// Splits `text` and wraps every piece as a [`Chunk`] owned by `source_id`.
/// Embeddings are left empty.
pub fn build_chunks(
    source_id: &str,
    source_name: &str,
    text: &str,
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, RagError> {
    config.validate()?;
    if source_id.trim().is_empty() {
        return Err(RagError::InvalidArgument("source id is empty".to_string()));
    }

    let pieces = chunk_text(text, config);
    let total_chunks = pieces.len();

    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(chunk_index, content)| Chunk {
            id: Chunk::make_id(source_id, chunk_index),
            source_id: source_id.to_string(),
            source_name: source_name.to_string(),
            content,
            embedding: None,
            metadata: ChunkMetadata {
                chunk_index,
                total_chunks,
            },
        })
        .collect())
}

struct ChunkBuilder {
    config: ChunkingConfig,
    buffer: String,
    buffer_len: usize,
    chunks: Vec<String>,
}

impl ChunkBuilder {
    fn new(config: ChunkingConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            buffer_len: 0,
            chunks: Vec::new(),
        }
    }

    fn push(&mut self, piece: &str) {
        let piece = piece.trim();
        if piece.is_empty() {
            return;
        }

        let piece_len = char_len(piece);
        let fits = self.buffer_len + 1 + piece_len <= self.config.max_chunk_size;

        if self.buffer.is_empty() || fits || self.buffer_len < self.config.min_chunk_size {
            self.append(piece, piece_len);
            return;
        }

        let completed = std::mem::take(&mut self.buffer);
        let seed = tail_words(&completed, self.config.overlap);
        self.chunks.push(completed);
        self.buffer_len = char_len(&seed);
        self.buffer = seed;
        self.append(piece, piece_len);
    }

    fn append(&mut self, piece: &str, piece_len: usize) {
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
            self.buffer_len += 1;
        }
        self.buffer.push_str(piece);
        self.buffer_len += piece_len;
    }

    // The trailing buffer always holds text no earlier chunk contains, so it
    // is kept even when it is shorter than `min_chunk_size`.
    fn finish(mut self) -> Vec<String> {
        if !self.buffer.trim().is_empty() {
            self.chunks.push(self.buffer);
        }
        self.chunks
    }
}

fn tail_words(text: &str, count: usize) -> String {
    let words = text.split_whitespace().collect::<Vec<_>>();
    words[words.len().saturating_sub(count)..].join(" ")
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
