//! In-memory vector index with write-behind persistence.
//!
//! The maps held here are authoritative for the running process. Every
//! mutation is applied in memory first, so searches see it immediately, and is
//! then written to the [`PersistenceBackend`]. Persistence failures are logged
//! and handed to the optional failure observer; they never fail the caller.

use crate::error::RagError;
use crate::models::{Chunk, IndexStats, SearchOptions, SearchResult};
use crate::similarity::cosine_similarity;
use crate::stores::CHUNKS_TABLE;
use crate::traits::PersistenceBackend;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

pub type FailureObserver = Arc<dyn Fn(&RagError) + Send + Sync>;

struct IndexedChunk {
    sequence: u64,
    chunk: Chunk,
}

#[derive(Default)]
struct IndexState {
    chunks: HashMap<String, IndexedChunk>,
    by_source: HashMap<String, Vec<String>>,
    dimensions: Option<usize>,
    next_sequence: u64,
}

impl IndexState {
    /// Upsert. An overwritten chunk keeps its original position.
    fn insert(&mut self, chunk: Chunk) {
        if self.dimensions.is_none() {
            self.dimensions = chunk.embedding.as_ref().map(Vec::len);
        }

        if let Some(existing) = self.chunks.get_mut(&chunk.id) {
            if existing.chunk.source_id != chunk.source_id {
                let old_source = existing.chunk.source_id.clone();
                detach(&mut self.by_source, &old_source, &chunk.id);
                self.by_source
                    .entry(chunk.source_id.clone())
                    .or_default()
                    .push(chunk.id.clone());
            }
            existing.chunk = chunk;
            return;
        }

        self.by_source
            .entry(chunk.source_id.clone())
            .or_default()
            .push(chunk.id.clone());
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.chunks
            .insert(chunk.id.clone(), IndexedChunk { sequence, chunk });
    }

    fn remove_source(&mut self, source_id: &str) -> Vec<String> {
        let ids = self.by_source.remove(source_id).unwrap_or_default();
        for id in &ids {
            self.chunks.remove(id);
        }
        if self.chunks.is_empty() {
            self.dimensions = None;
        }
        ids
    }
}

fn check_dimensions(mut expected: Option<usize>, chunks: &[Chunk]) -> Result<(), RagError> {
    for chunk in chunks {
        let embedding = chunk.embedding.as_ref().ok_or_else(|| {
            RagError::InvalidArgument(format!("chunk {} has no embedding", chunk.id))
        })?;
        match expected {
            Some(dimensions) if dimensions != embedding.len() => {
                return Err(RagError::IncompatibleDimensions {
                    expected: dimensions,
                    actual: embedding.len(),
                });
            }
            Some(_) => {}
            None => expected = Some(embedding.len()),
        }
    }
    Ok(())
}

fn detach(by_source: &mut HashMap<String, Vec<String>>, source_id: &str, chunk_id: &str) {
    if let Some(ids) = by_source.get_mut(source_id) {
        ids.retain(|id| id != chunk_id);
        if ids.is_empty() {
            by_source.remove(source_id);
        }
    }
}

pub struct VectorIndex {
    state: RwLock<IndexState>,
    backend: Arc<dyn PersistenceBackend>,
    writer: Mutex<()>,
    initialized: OnceCell<()>,
    on_failure: Option<FailureObserver>,
}

impl VectorIndex {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            backend,
            writer: Mutex::new(()),
            initialized: OnceCell::new(),
            on_failure: None,
        }
    }

    pub fn with_failure_observer(
        mut self,
        observer: impl Fn(&RagError) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Arc::new(observer));
        self
    }

    /// Loads persisted chunks once. Later calls are no-ops. An unreadable
    /// store is treated as empty.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                let records = match self.backend.load_all(CHUNKS_TABLE).await {
                    Ok(records) => records,
                    Err(error) => {
                        self.report(error);
                        return;
                    }
                };

                let mut loaded = 0usize;
                let mut state = self.write_state();
                for (id, value) in records {
                    match serde_json::from_value::<Chunk>(value) {
                        Ok(chunk) => {
                            let Some(embedding) = &chunk.embedding else {
                                warn!(chunk_id = %id, "skipping persisted chunk without embedding");
                                continue;
                            };
                            if state.dimensions.is_some_and(|dimensions| embedding.len() != dimensions) {
                                warn!(chunk_id = %id, "skipping persisted chunk with foreign dimensionality");
                                continue;
                            }
                            state.insert(chunk);
                            loaded += 1;
                        }
                        Err(error) => {
                            warn!(chunk_id = %id, error = %error, "skipping unreadable persisted chunk");
                        }
                    }
                }
                info!(chunks = loaded, sources = state.by_source.len(), "vector index loaded");
            })
            .await;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Upserts `chunks` by id. Every chunk must carry an embedding of the
    /// index's dimensionality.
    pub async fn add_chunks(&self, chunks: Vec<Chunk>) -> Result<(), RagError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;

        let records = {
            let mut state = self.write_state();
            check_dimensions(state.dimensions, &chunks)?;
            let records = to_records(&chunks);
            for chunk in chunks {
                state.insert(chunk);
            }
            records
        };

        self.persist_put(records).await;
        Ok(())
    }

    /// Replaces every chunk of `source_id` with `chunks` in one step: a
    /// concurrent search sees either the old set or the new one.
    /// Returns the number of chunks that were replaced.
    pub async fn replace_source_chunks(
        &self,
        source_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<usize, RagError> {
        if let Some(stray) = chunks.iter().find(|chunk| chunk.source_id != source_id) {
            return Err(RagError::InvalidArgument(format!(
                "chunk {} belongs to {}, not {source_id}",
                stray.id, stray.source_id
            )));
        }
        let _writer = self.writer.lock().await;

        let (stale, replaced, records) = {
            let mut state = self.write_state();
            let previous = state.by_source.get(source_id).cloned().unwrap_or_default();
            // A source that is alone in the index may change dimensionality.
            let expected = if previous.len() == state.chunks.len() {
                None
            } else {
                state.dimensions
            };
            check_dimensions(expected, &chunks)?;

            let fresh: HashSet<&str> = chunks.iter().map(|chunk| chunk.id.as_str()).collect();
            let stale = state
                .remove_source(source_id)
                .into_iter()
                .filter(|id| !fresh.contains(id.as_str()))
                .collect::<Vec<_>>();
            let records = to_records(&chunks);
            for chunk in chunks {
                state.insert(chunk);
            }
            (stale, previous.len(), records)
        };

        self.persist_delete(&stale).await;
        self.persist_put(records).await;
        Ok(replaced)
    }

    /// Removes every chunk owned by `source_id` and returns how many were removed.
    pub async fn remove_chunks_by_source_id(&self, source_id: &str) -> usize {
        let _writer = self.writer.lock().await;
        let removed = self.write_state().remove_source(source_id);
        if removed.is_empty() {
            return 0;
        }

        debug!(source_id, removed = removed.len(), "removed source chunks");
        self.persist_delete(&removed).await;
        removed.len()
    }

    /// Linear cosine scan over the candidate chunks.
    ///
    /// Results are sorted by descending score; equal scores keep insertion
    /// order. Candidates without an embedding are skipped.
    pub fn search(
        &self,
        query_embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, RagError> {
        if options.top_k == 0 {
            return Ok(Vec::new());
        }
        let state = self.read_state();

        let candidates: Vec<&IndexedChunk> = if options.source_ids.is_empty() {
            state.chunks.values().collect()
        } else {
            let allowed: HashSet<&str> = options.source_ids.iter().map(String::as_str).collect();
            allowed
                .into_iter()
                .filter_map(|source_id| state.by_source.get(source_id))
                .flatten()
                .filter_map(|id| state.chunks.get(id))
                .collect()
        };

        let mut scored = Vec::new();
        for candidate in candidates {
            let Some(embedding) = candidate.chunk.embedding.as_deref() else {
                continue;
            };
            let score = cosine_similarity(query_embedding, embedding)?;
            if score >= options.min_score {
                scored.push((score, candidate));
            }
        }

        scored.sort_by(|(left_score, left), (right_score, right)| {
            right_score
                .total_cmp(left_score)
                .then(left.sequence.cmp(&right.sequence))
        });

        Ok(scored
            .into_iter()
            .take(options.top_k)
            .map(|(score, candidate)| SearchResult {
                chunk: candidate.chunk.clone(),
                score,
            })
            .collect())
    }

    /// All chunks of the given sources, grouped by source in the order given.
    pub fn get_chunks_by_source_ids(&self, source_ids: &[String]) -> Vec<Chunk> {
        let state = self.read_state();
        let mut seen = HashSet::new();
        source_ids
            .iter()
            .filter(|source_id| seen.insert(source_id.as_str()))
            .filter_map(|source_id| state.by_source.get(source_id))
            .flatten()
            .filter_map(|id| state.chunks.get(id))
            .map(|indexed| indexed.chunk.clone())
            .collect()
    }

    pub fn contains_source(&self, source_id: &str) -> bool {
        self.read_state().by_source.contains_key(source_id)
    }

    pub fn get_stats(&self) -> IndexStats {
        let state = self.read_state();
        let total_chunks = state.chunks.len();
        let total_sources = state.by_source.len();
        let average_chunks_per_source = if total_sources == 0 {
            0.0
        } else {
            total_chunks as f64 / total_sources as f64
        };

        IndexStats {
            total_chunks,
            total_sources,
            average_chunks_per_source,
        }
    }

    /// Drops every chunk from memory and from the persisted store.
    pub async fn clear(&self) {
        let _writer = self.writer.lock().await;
        *self.write_state() = IndexState::default();
        info!("vector index cleared");
        if let Err(error) = self.backend.clear(CHUNKS_TABLE).await {
            self.report(error);
        }
    }

    async fn persist_put(&self, records: Vec<(String, Value)>) {
        if records.is_empty() {
            return;
        }
        if let Err(error) = self.backend.put_all(CHUNKS_TABLE, records).await {
            self.report(error);
        }
    }

    async fn persist_delete(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(error) = self.backend.delete_all(CHUNKS_TABLE, ids).await {
            self.report(error);
        }
    }

    fn report(&self, error: RagError) {
        let error = match error {
            RagError::PersistenceUnavailable(_) => error,
            other => RagError::persistence(other),
        };
        warn!(error = %error, "vector index persistence failed, keeping in-memory state");
        if let Some(observer) = &self.on_failure {
            observer(&error);
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_records(chunks: &[Chunk]) -> Vec<(String, Value)> {
    chunks
        .iter()
        .filter_map(|chunk| match serde_json::to_value(chunk) {
            Ok(value) => Some((chunk.id.clone(), value)),
            Err(error) => {
                warn!(chunk_id = %chunk.id, error = %error, "cannot serialize chunk");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use crate::stores::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UnavailableBackend;

    #[async_trait]
    impl PersistenceBackend for UnavailableBackend {
        async fn put_all(&self, _table: &str, _records: Vec<(String, Value)>) -> Result<(), RagError> {
            Err(RagError::persistence("disk gone"))
        }

        async fn delete_all(&self, _table: &str, _ids: &[String]) -> Result<(), RagError> {
            Err(RagError::persistence("disk gone"))
        }

        async fn load_all(&self, _table: &str) -> Result<Vec<(String, Value)>, RagError> {
            Err(RagError::persistence("disk gone"))
        }

        async fn clear(&self, _table: &str) -> Result<(), RagError> {
            Err(RagError::persistence("disk gone"))
        }
    }

    fn chunk(source_id: &str, index: usize, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: Chunk::make_id(source_id, index),
            source_id: source_id.to_string(),
            source_name: format!("{source_id}.txt"),
            content: format!("content {index} of {source_id}"),
            embedding: Some(embedding),
            metadata: ChunkMetadata {
                chunk_index: index,
                total_chunks: 3,
            },
        }
    }

    fn options(top_k: usize, source_ids: &[&str], min_score: f32) -> SearchOptions {
        SearchOptions {
            top_k,
            source_ids: source_ids.iter().map(|id| id.to_string()).collect(),
            min_score,
        }
    }

    async fn two_source_index() -> (VectorIndex, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let index = VectorIndex::new(backend.clone());
        index.initialize().await;
        index
            .add_chunks(vec![
                chunk("a", 0, vec![1.0, 0.0, 0.0]),
                chunk("a", 1, vec![0.8, 0.6, 0.0]),
                chunk("a", 2, vec![0.0, 1.0, 0.0]),
                chunk("b", 0, vec![0.9, 0.1, 0.0]),
                chunk("b", 1, vec![0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();
        (index, backend)
    }

    #[tokio::test]
    async fn search_sorts_by_descending_score() {
        let (index, _) = two_source_index().await;
        let results = index.search(&[1.0, 0.0, 0.0], &options(10, &[], 0.0)).unwrap();

        assert_eq!(results[0].chunk.id, "a-chunk-0");
        assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[tokio::test]
    async fn search_respects_source_filter() {
        let (index, _) = two_source_index().await;
        let results = index.search(&[1.0, 0.0, 0.0], &options(10, &["a"], -1.0)).unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|result| result.chunk.source_id == "a"));
    }

    #[tokio::test]
    async fn search_respects_threshold_and_top_k() {
        let (index, _) = two_source_index().await;
        let results = index.search(&[1.0, 0.0, 0.0], &options(10, &[], 0.9)).unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|result| result.score >= 0.9));

        let results = index.search(&[1.0, 0.0, 0.0], &options(2, &[], 0.0)).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn nothing_above_threshold_is_an_empty_result() {
        let (index, _) = two_source_index().await;
        let results = index.search(&[-1.0, -1.0, -1.0], &SearchOptions::default()).unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn equal_scores_keep_insertion_order() {
        let index = VectorIndex::new(Arc::new(MemoryBackend::new()));
        index
            .add_chunks(vec![
                chunk("s", 0, vec![0.0, 1.0]),
                chunk("s", 1, vec![0.0, 2.0]),
                chunk("s", 2, vec![0.0, 3.0]),
            ])
            .await
            .unwrap();
        index.add_chunks(vec![chunk("s", 0, vec![0.0, 4.0])]).await.unwrap();

        let ids = index
            .search(&[0.0, 1.0], &options(3, &[], 0.0))
            .unwrap()
            .into_iter()
            .map(|result| result.chunk.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["s-chunk-0", "s-chunk-1", "s-chunk-2"]);
    }

    #[tokio::test]
    async fn re_adding_a_chunk_overwrites_it() {
        let (index, backend) = two_source_index().await;
        let mut updated = chunk("a", 0, vec![1.0, 0.0, 0.0]);
        updated.content = "rewritten".to_string();

        index.add_chunks(vec![updated]).await.unwrap();

        assert_eq!(index.get_stats().total_chunks, 5);
        let chunks = index.get_chunks_by_source_ids(&["a".to_string()]);
        assert_eq!(chunks[0].content, "rewritten");
        assert_eq!(backend.record_count(CHUNKS_TABLE).await, 5);
    }

    #[tokio::test]
    async fn removing_a_source_leaves_others_untouched() {
        let (index, backend) = two_source_index().await;
        let before = index.get_stats().total_chunks;

        let removed = index.remove_chunks_by_source_id("a").await;

        assert_eq!(removed, 3);
        assert_eq!(index.get_stats().total_chunks, before - removed);
        assert_eq!(backend.record_count(CHUNKS_TABLE).await, 2);
        let results = index.search(&[0.9, 0.1, 0.0], &options(5, &["b"], 0.5)).unwrap();
        assert_eq!(results[0].chunk.id, "b-chunk-0");
        assert_eq!(index.remove_chunks_by_source_id("a").await, 0);
    }

    #[tokio::test]
    async fn replacing_a_source_drops_stale_chunks() {
        let (index, backend) = two_source_index().await;

        let replaced = index
            .replace_source_chunks("a", vec![chunk("a", 0, vec![0.0, 1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(replaced, 3);
        assert_eq!(index.get_chunks_by_source_ids(&["a".to_string()]).len(), 1);
        assert_eq!(backend.record_count(CHUNKS_TABLE).await, 3);

        let foreign = index
            .replace_source_chunks("a", vec![chunk("b", 7, vec![0.0, 1.0, 0.0])])
            .await;
        assert!(matches!(foreign, Err(RagError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn stats_average_chunks_per_source() {
        let index = VectorIndex::new(Arc::new(MemoryBackend::new()));
        assert_eq!(
            index.get_stats(),
            IndexStats {
                total_chunks: 0,
                total_sources: 0,
                average_chunks_per_source: 0.0,
            }
        );

        let (index, _) = two_source_index().await;
        let stats = index.get_stats();
        assert_eq!(stats.total_sources, 2);
        assert!((stats.average_chunks_per_source - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn dimension_mismatches_are_rejected() {
        let (index, _) = two_source_index().await;

        let result = index.add_chunks(vec![chunk("c", 0, vec![1.0, 0.0])]).await;
        assert!(matches!(
            result,
            Err(RagError::IncompatibleDimensions {
                expected: 3,
                actual: 2
            })
        ));
        assert!(!index.contains_source("c"));

        let result = index.search(&[1.0, 0.0], &SearchOptions::default());
        assert!(matches!(result, Err(RagError::IncompatibleDimensions { .. })));
    }

    #[tokio::test]
    async fn chunks_without_embeddings_are_not_inserted() {
        let index = VectorIndex::new(Arc::new(MemoryBackend::new()));
        let mut pending = chunk("a", 0, vec![1.0]);
        pending.embedding = None;

        let result = index.add_chunks(vec![pending]).await;
        assert!(matches!(result, Err(RagError::InvalidArgument(_))));
        assert_eq!(index.get_stats().total_chunks, 0);
    }

    #[tokio::test]
    async fn initialize_loads_persisted_chunks_once() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let seed = VectorIndex::new(backend.clone());
            seed.add_chunks(vec![chunk("a", 0, vec![1.0, 0.0]), chunk("a", 1, vec![0.0, 1.0])])
                .await
                .unwrap();
        }
        let mut unembedded = chunk("z", 0, vec![1.0, 0.0]);
        unembedded.embedding = None;
        backend
            .put_all(
                CHUNKS_TABLE,
                vec![
                    (unembedded.id.clone(), serde_json::to_value(&unembedded).unwrap()),
                    ("garbage".to_string(), json!({"not": "a chunk"})),
                ],
            )
            .await
            .unwrap();

        let index = VectorIndex::new(backend.clone());
        index.initialize().await;
        index.initialize().await;

        assert!(index.is_initialized());
        assert_eq!(index.get_stats().total_chunks, 2);
        assert_eq!(index.get_stats().total_sources, 1);
        assert!(!index.contains_source("z"));
        let results = index.search(&[1.0, 0.0], &options(10, &[], -1.0)).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| result.chunk.source_id == "a"));
    }

    #[tokio::test]
    async fn unavailable_persistence_degrades_to_memory() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let index = VectorIndex::new(Arc::new(UnavailableBackend)).with_failure_observer(
            move |error| {
                assert!(matches!(error, RagError::PersistenceUnavailable(_)));
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        index.initialize().await;
        assert!(index.is_initialized());

        index.add_chunks(vec![chunk("a", 0, vec![1.0, 0.0])]).await.unwrap();
        let results = index.search(&[1.0, 0.0], &SearchOptions::default()).unwrap();
        assert_eq!(results.len(), 1);

        assert_eq!(index.remove_chunks_by_source_id("a").await, 1);
        index.clear().await;
        assert_eq!(failures.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn clear_empties_memory_and_store() {
        let (index, backend) = two_source_index().await;
        index.clear().await;

        assert_eq!(index.get_stats().total_chunks, 0);
        assert_eq!(backend.record_count(CHUNKS_TABLE).await, 0);
        index.add_chunks(vec![chunk("c", 0, vec![1.0, 0.0])]).await.unwrap();
        assert_eq!(index.get_stats().total_sources, 1);
    }
}
