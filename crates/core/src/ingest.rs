use crate::chunking::{build_chunks, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::models::Chunk;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const TEXT_EXTENSIONS: [&str; 3] = ["txt", "md", "markdown"];

/// Chunks `raw_text` and attaches an embedding to every chunk.
///
/// Chunk ids depend only on `source_id` and position, so processing the same
/// text twice yields the same chunks.
pub async fn process_document(
    embedder: &dyn Embedder,
    source_id: &str,
    source_name: &str,
    raw_text: &str,
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, RagError> {
    let mut chunks = build_chunks(source_id, source_name, raw_text, config)?;
    if chunks.is_empty() {
        return Ok(chunks);
    }

    let contents = chunks
        .iter()
        .map(|chunk| chunk.content.clone())
        .collect::<Vec<_>>();
    let embeddings = embedder.embed_batch(&contents).await?;
    if embeddings.len() != chunks.len() {
        return Err(RagError::EmbeddingFailed(format!(
            "embedding count {} doesn't match chunk count {}",
            embeddings.len(),
            chunks.len()
        )));
    }

    for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
        chunk.embedding = Some(embedding);
    }
    Ok(chunks)
}

pub fn source_checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn source_id_for_path(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn discover_text_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_text = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                TEXT_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });

        if is_text {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone)]
pub struct TextDocument {
    pub source_id: String,
    pub source_name: String,
    pub path: PathBuf,
    pub text: String,
}

pub fn read_document(path: &Path) -> Result<TextDocument, RagError> {
    let text = fs::read_to_string(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            RagError::InvalidArgument(format!("path has no file name: {}", path.display()))
        })?;

    Ok(TextDocument {
        source_id: source_id_for_path(path),
        source_name: name.to_string(),
        path: path.to_path_buf(),
        text,
    })
}

pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

pub struct IngestionReport {
    pub documents: Vec<TextDocument>,
    pub skipped_files: Vec<SkippedFile>,
}

/// Reads every text document under `folder`. Unreadable files are reported
/// instead of failing the whole folder.
pub fn read_documents_best_effort(folder: &Path) -> Result<IngestionReport, RagError> {
    let files = discover_text_files(folder);

    if files.is_empty() {
        return Err(RagError::InvalidArgument(format!(
            "no text documents found in {}",
            folder.display()
        )));
    }

    let mut documents = Vec::new();
    let mut skipped_files = Vec::new();

    for path in files {
        match read_document(&path) {
            Ok(document) => documents.push(document),
            Err(error) => skipped_files.push(SkippedFile {
                path,
                reason: error.to_string(),
            }),
        }
    }

    Ok(IngestionReport {
        documents,
        skipped_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{LazyEmbedder, NgramModel};
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn sample_text() -> String {
        (0..40)
            .map(|n| format!("Reading note {n} summarises chapter {n} of the astronomy course."))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[tokio::test]
    async fn processed_chunks_carry_embeddings() {
        let embedder = LazyEmbedder::new(NgramModel::default());
        let chunks = process_document(
            &embedder,
            "doc1",
            "Course notes",
            &sample_text(),
            ChunkingConfig::default(),
        )
        .await
        .unwrap();

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let embedding = chunk.embedding.as_ref().unwrap();
            assert_eq!(embedding.len(), 384);
            assert!(!chunk.content.is_empty());
        }
    }

    #[tokio::test]
    async fn processing_is_idempotent() {
        let embedder = LazyEmbedder::new(NgramModel::default());
        let text = sample_text();
        let config = ChunkingConfig::default();

        let first = process_document(&embedder, "doc1", "Course notes", &text, config)
            .await
            .unwrap();
        let second = process_document(&embedder, "doc1", "Course notes", &text, config)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn blank_documents_produce_no_chunks() {
        let embedder = LazyEmbedder::new(NgramModel::default());
        let chunks = process_document(&embedder, "doc", "Empty", "  \n ", ChunkingConfig::default())
            .await
            .unwrap();
        assert!(chunks.is_empty());
        assert!(!embedder.is_loaded());
    }

    #[test]
    fn checksum_is_reproducible() {
        assert_eq!(source_checksum("abc"), source_checksum("abc"));
        assert_ne!(source_checksum("abc"), source_checksum("abd"));
    }

    #[test]
    fn discover_text_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.txt")).and_then(|mut file| file.write_all(b"alpha"))?;
        File::create(nested.join("b.MD")).and_then(|mut file| file.write_all(b"beta"))?;
        File::create(base.join("c.pdf")).and_then(|mut file| file.write_all(b"%PDF"))?;

        let files = discover_text_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn reading_fails_without_documents() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        assert!(read_documents_best_effort(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn best_effort_skips_unreadable_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("good.txt"), "readable text")?;
        fs::write(dir.path().join("binary.txt"), [0xff, 0xfe, 0x00, 0x9f])?;

        let report = read_documents_best_effort(dir.path())?;

        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].source_name, "good.txt");
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("binary.txt")
        );
        Ok(())
    }
}
