//! Notebook-level facade: source lifecycle, question answering and diagnostics.
//!
//! A source moves through `Processing` to `Indexed` or `Failed`. Its chunks are
//! in the index before it is reported as `Indexed`, and a source removed while
//! its embeddings were computed never gets its chunks back.

use crate::config::RagConfig;
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::index::VectorIndex;
use crate::ingest::{process_document, source_checksum};
use crate::models::{ChatMessage, Chunk, IndexStats, SearchResult, SourceRecord, SourceStatus};
use crate::retrieval::Retriever;
use crate::stores::SOURCES_TABLE;
use crate::synthesis::{AnswerSynthesizer, SynthesizedAnswer};
use crate::traits::{Generator, PersistenceBackend};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const MAX_SUGGESTION_SOURCES: usize = 5;
const INTERRUPTED_REASON: &str = "indexing was interrupted before it finished";
const MISSING_CHUNKS_REASON: &str = "indexed chunks were not found in the store";

struct TrackedSource {
    record: SourceRecord,
    /// Bumped on every (re)index so a late run can tell it was superseded.
    generation: u64,
}

pub struct NotebookCoordinator {
    config: RagConfig,
    backend: Arc<dyn PersistenceBackend>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    retriever: Retriever,
    synthesizer: AnswerSynthesizer,
    sources: RwLock<HashMap<String, TrackedSource>>,
    next_generation: AtomicU64,
    initialized: OnceCell<()>,
}

impl NotebookCoordinator {
    pub fn new(
        backend: Arc<dyn PersistenceBackend>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        config: RagConfig,
    ) -> Self {
        let index = Arc::new(VectorIndex::new(backend.clone()));
        Self::with_index(backend, index, embedder, generator, config)
    }

    /// Uses an index built by the caller, e.g. one with a failure observer.
    pub fn with_index(
        backend: Arc<dyn PersistenceBackend>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        config: RagConfig,
    ) -> Self {
        let retriever = Retriever::new(embedder.clone(), index.clone())
            .with_limits(config.retrieval_top_k, config.retrieval_min_score);
        let synthesizer = AnswerSynthesizer::new(generator)
            .with_history_turns(config.history_turns)
            .with_temperatures(config.answer_temperature, config.suggestion_temperature);

        Self {
            config,
            backend,
            index,
            embedder,
            retriever,
            synthesizer,
            sources: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            initialized: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Loads persisted chunks and source records. Safe to call repeatedly.
    pub async fn initialize(&self) {
        self.index.initialize().await;
        self.initialized
            .get_or_init(|| async { self.load_sources().await })
            .await;
    }

    /// Chunks, embeds and indexes `raw_text` as the content of `source_id`.
    ///
    /// Re-indexing text whose checksum matches an indexed record returns that
    /// record without embedding again.
    pub async fn index_source(
        &self,
        source_id: &str,
        source_name: &str,
        raw_text: &str,
    ) -> Result<SourceRecord, RagError> {
        if source_id.trim().is_empty() {
            return Err(RagError::InvalidArgument("source id is empty".to_string()));
        }

        let checksum = source_checksum(raw_text);
        if let Some(record) = self.unchanged(source_id, source_name, &checksum) {
            debug!(source_id, "source unchanged, skipping re-index");
            return Ok(record);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let processing = SourceRecord {
            source_id: source_id.to_string(),
            source_name: source_name.to_string(),
            checksum,
            status: SourceStatus::Processing,
            chunk_count: 0,
            updated_at: Utc::now(),
        };
        self.write_sources().insert(
            source_id.to_string(),
            TrackedSource {
                record: processing.clone(),
                generation,
            },
        );
        self.persist_record(&processing).await;
        if !self.is_current(source_id, generation) {
            info!(source_id, "source removed before indexing started");
            return Err(RagError::SourceRemoved(source_id.to_string()));
        }
        info!(source_id, source_name, "indexing source");

        let chunks = match process_document(
            self.embedder.as_ref(),
            source_id,
            source_name,
            raw_text,
            self.config.chunking,
        )
        .await
        {
            Ok(chunks) => chunks,
            Err(error) => {
                self.mark_failed(source_id, generation, &error).await;
                return Err(error);
            }
        };

        if !self.is_current(source_id, generation) {
            info!(source_id, "source removed while indexing, dropping its chunks");
            return Err(RagError::SourceRemoved(source_id.to_string()));
        }

        let chunk_count = chunks.len();
        if let Err(error) = self.index.replace_source_chunks(source_id, chunks).await {
            self.mark_failed(source_id, generation, &error).await;
            return Err(error);
        }

        // The source can still disappear while the replace waits for the writer.
        let indexed = {
            let mut sources = self.write_sources();
            match sources.get_mut(source_id) {
                Some(tracked) if tracked.generation == generation => {
                    tracked.record.status = SourceStatus::Indexed;
                    tracked.record.chunk_count = chunk_count;
                    tracked.record.updated_at = Utc::now();
                    Some(tracked.record.clone())
                }
                Some(_) => return Err(RagError::SourceRemoved(source_id.to_string())),
                None => None,
            }
        };
        let Some(record) = indexed else {
            self.index.remove_chunks_by_source_id(source_id).await;
            return Err(RagError::SourceRemoved(source_id.to_string()));
        };

        self.persist_record(&record).await;
        info!(source_id, chunks = chunk_count, "source indexed");
        Ok(record)
    }

    /// Forgets the source and deletes its chunks. Returns the number of chunks removed.
    pub async fn remove_source(&self, source_id: &str) -> usize {
        let known = self.write_sources().remove(source_id).is_some();
        let removed = self.index.remove_chunks_by_source_id(source_id).await;

        if known {
            if let Err(error) = self
                .backend
                .delete_all(SOURCES_TABLE, &[source_id.to_string()])
                .await
            {
                warn!(source_id, error = %error, "cannot delete persisted source record");
            }
        }
        info!(source_id, chunks = removed, "source removed");
        removed
    }

    /// Every known source, ordered by name.
    pub fn sources(&self) -> Vec<SourceRecord> {
        let mut records = self
            .read_sources()
            .values()
            .map(|tracked| tracked.record.clone())
            .collect::<Vec<_>>();
        records.sort_by(|left, right| {
            left.source_name
                .cmp(&right.source_name)
                .then_with(|| left.source_id.cmp(&right.source_id))
        });
        records
    }

    pub fn source(&self, source_id: &str) -> Option<SourceRecord> {
        self.read_sources()
            .get(source_id)
            .map(|tracked| tracked.record.clone())
    }

    pub fn indexed_source_ids(&self) -> HashSet<String> {
        self.read_sources()
            .values()
            .filter(|tracked| tracked.record.is_indexed())
            .map(|tracked| tracked.record.source_id.clone())
            .collect()
    }

    pub async fn search(
        &self,
        query: &str,
        enabled_source_ids: &HashSet<String>,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>, RagError> {
        self.retriever
            .retrieve_with(query, enabled_source_ids, top_k, min_score)
            .await
    }

    /// Retrieves passages from the enabled sources and answers from them.
    ///
    /// With no enabled sources the answer is a fixed notice and neither the
    /// embedder nor the generator is called.
    pub async fn ask_question(
        &self,
        query: &str,
        enabled_source_ids: &HashSet<String>,
        history: &[ChatMessage],
    ) -> Result<SynthesizedAnswer, RagError> {
        if enabled_source_ids.is_empty() {
            debug!("question asked with no enabled sources");
            return Ok(SynthesizedAnswer::no_sources());
        }

        let results = self.retriever.retrieve(query, enabled_source_ids).await?;
        let answer = self.synthesizer.synthesize(query, results, history).await?;
        Ok(answer)
    }

    pub async fn suggest_questions(
        &self,
        enabled_source_ids: &HashSet<String>,
        count: usize,
    ) -> Result<Vec<String>, RagError> {
        let mut source_ids = enabled_source_ids.iter().cloned().collect::<Vec<_>>();
        source_ids.sort_unstable();

        let leading = self
            .index
            .get_chunks_by_source_ids(&source_ids)
            .into_iter()
            .filter(|chunk| chunk.metadata.chunk_index == 0)
            .take(MAX_SUGGESTION_SOURCES)
            .collect::<Vec<Chunk>>();

        Ok(self.synthesizer.suggest_questions(&leading, count).await?)
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.get_stats()
    }

    pub async fn clear(&self) {
        self.index.clear().await;
        self.write_sources().clear();
        if let Err(error) = self.backend.clear(SOURCES_TABLE).await {
            warn!(error = %error, "cannot clear persisted source records");
        }
    }

    async fn load_sources(&self) {
        let records = match self.backend.load_all(SOURCES_TABLE).await {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "source registry unavailable, starting empty");
                return;
            }
        };

        let mut repaired = Vec::new();
        {
            let mut sources = self.write_sources();
            for (id, value) in records {
                let mut record = match serde_json::from_value::<SourceRecord>(value) {
                    Ok(record) => record,
                    Err(error) => {
                        warn!(source_id = %id, error = %error, "skipping unreadable source record");
                        continue;
                    }
                };

                let reason = match record.status {
                    SourceStatus::Processing => Some(INTERRUPTED_REASON),
                    SourceStatus::Indexed
                        if record.chunk_count > 0
                            && !self.index.contains_source(&record.source_id) =>
                    {
                        Some(MISSING_CHUNKS_REASON)
                    }
                    _ => None,
                };
                if let Some(reason) = reason {
                    warn!(source_id = %record.source_id, reason, "source needs re-indexing");
                    record.status = SourceStatus::Failed {
                        reason: reason.to_string(),
                    };
                    record.chunk_count = 0;
                    record.updated_at = Utc::now();
                    repaired.push(record.clone());
                }

                let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                sources.insert(
                    record.source_id.clone(),
                    TrackedSource { record, generation },
                );
            }
            info!(sources = sources.len(), "source registry loaded");
        }

        for record in &repaired {
            self.index
                .remove_chunks_by_source_id(&record.source_id)
                .await;
            self.persist_record(record).await;
        }
    }

    fn unchanged(&self, source_id: &str, source_name: &str, checksum: &str) -> Option<SourceRecord> {
        self.read_sources()
            .get(source_id)
            .map(|tracked| &tracked.record)
            .filter(|record| {
                record.is_indexed()
                    && record.checksum == checksum
                    && record.source_name == source_name
            })
            .cloned()
    }

    fn is_current(&self, source_id: &str, generation: u64) -> bool {
        self.read_sources()
            .get(source_id)
            .is_some_and(|tracked| tracked.generation == generation)
    }

    async fn mark_failed(&self, source_id: &str, generation: u64, error: &RagError) {
        warn!(source_id, error = %error, "indexing source failed");
        let failed = {
            let mut sources = self.write_sources();
            match sources.get_mut(source_id) {
                Some(tracked) if tracked.generation == generation => {
                    tracked.record.status = SourceStatus::Failed {
                        reason: error.to_string(),
                    };
                    tracked.record.chunk_count = 0;
                    tracked.record.updated_at = Utc::now();
                    Some(tracked.record.clone())
                }
                _ => None,
            }
        };
        let Some(record) = failed else {
            return;
        };

        // Chunks of an earlier successful run must not outlive the failed status.
        if self.is_current(source_id, generation) {
            let removed = self.index.remove_chunks_by_source_id(source_id).await;
            if removed > 0 {
                info!(source_id, chunks = removed, "dropped chunks of the previous index run");
            }
        }
        self.persist_record(&record).await;
    }

    async fn persist_record(&self, record: &SourceRecord) {
        let value = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(error) => {
                warn!(source_id = %record.source_id, error = %error, "cannot serialize source record");
                return;
            }
        };
        if let Err(error) = self
            .backend
            .put_all(SOURCES_TABLE, vec![(record.source_id.clone(), value)])
            .await
        {
            warn!(source_id = %record.source_id, error = %error, "cannot persist source record");
            return;
        }

        // A removal can land while the write is in flight.
        if !self.read_sources().contains_key(&record.source_id) {
            debug!(source_id = %record.source_id, "source removed during write, deleting its record");
            if let Err(error) = self
                .backend
                .delete_all(SOURCES_TABLE, &[record.source_id.clone()])
                .await
            {
                warn!(source_id = %record.source_id, error = %error, "cannot delete persisted source record");
            }
        }
    }

    fn read_sources(&self) -> RwLockReadGuard<'_, HashMap<String, TrackedSource>> {
        self.sources.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sources(&self) -> RwLockWriteGuard<'_, HashMap<String, TrackedSource>> {
        self.sources.write().unwrap_or_else(PoisonError::into_inner)
    }
}
