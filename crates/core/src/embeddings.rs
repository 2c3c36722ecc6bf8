use crate::error::RagError;
use crate::traits::{EmbeddingModel, ModelLoader};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 10;

/// Maps text to unit-length dense vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError>;

    /// Order-preserving: one vector per input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

/// Embedder that loads its model on first use and keeps it for the rest of
/// the process. Concurrent first calls share a single load.
pub struct LazyEmbedder {
    loader: Arc<dyn ModelLoader>,
    model: OnceCell<Arc<dyn EmbeddingModel>>,
    batch_size: usize,
}

impl LazyEmbedder {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
            model: OnceCell::new(),
            batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn model(&self) -> Result<&Arc<dyn EmbeddingModel>, RagError> {
        self.model
            .get_or_try_init(|| async {
                info!("loading embedding model");
                let model = self.loader.load().await?;
                info!(dimensions = model.dimensions(), "embedding model ready");
                Ok::<_, RagError>(model)
            })
            .await
    }
}

#[async_trait]
impl Embedder for LazyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::EmbeddingFailed("model returned no vector".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(position) = texts.iter().position(|text| text.trim().is_empty()) {
            return Err(RagError::EmbeddingFailed(format!(
                "input {position} is empty"
            )));
        }

        let model = self.model().await?;
        let dimensions = model.dimensions();
        let mut output = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            debug!(batch_len = batch.len(), "embedding batch");
            let vectors = model.embed_texts(batch).await?;
            if vectors.len() != batch.len() {
                return Err(RagError::EmbeddingFailed(format!(
                    "model returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }

            for mut vector in vectors {
                if vector.len() != dimensions {
                    return Err(RagError::EmbeddingFailed(format!(
                        "model returned a {}-dimension vector, expected {dimensions}",
                        vector.len()
                    )));
                }
                l2_normalize(&mut vector);
                output.push(vector);
            }
        }

        Ok(output)
    }
}

pub fn l2_normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

/// Offline model hashing character trigrams into fixed buckets.
#[derive(Debug, Clone, Copy)]
pub struct NgramModel {
    pub dimensions: usize,
}

impl Default for NgramModel {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl NgramModel {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingModel for NgramModel {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[async_trait]
impl ModelLoader for NgramModel {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, RagError> {
        Ok(Arc::new(*self))
    }
}

/// Loads an OpenAI-compatible `/embeddings` endpoint. Loading embeds one
/// sample text to learn the vector dimensionality.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingLoader {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[async_trait]
impl ModelLoader for HttpEmbeddingLoader {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, RagError> {
        let endpoint = url::Url::parse(&format!(
            "{}/embeddings",
            self.base_url.trim_end_matches('/')
        ))
        .map_err(|error| RagError::embedding(format!("invalid embeddings url: {error}")))?;
        let mut model = HttpEmbeddingModel {
            client: Client::new(),
            endpoint,
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            dimensions: 0,
        };

        let sample = model.request(&["dimension check".to_string()]).await?;
        model.dimensions = sample.first().map(Vec::len).unwrap_or_default();
        if model.dimensions == 0 {
            return Err(RagError::EmbeddingFailed(
                "embedding endpoint returned an empty sample vector".to_string(),
            ));
        }
        Ok(Arc::new(model))
    }
}

pub struct HttpEmbeddingModel {
    client: Client,
    endpoint: url::Url,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingModel {
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.trim());
        }

        let response = request.send().await.map_err(RagError::embedding)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::EmbeddingFailed(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }

        let mut parsed: EmbeddingResponse = response.json().await.map_err(RagError::embedding)?;
        parsed.data.sort_by_key(|entry| entry.index);
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbeddingModel {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        self.request(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingModel {
        batches: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl EmbeddingModel for RecordingModel {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            self.batches.lock().unwrap().push(texts.len());
            texts
                .iter()
                .map(|text| {
                    let value = text.parse::<f32>().map_err(RagError::embedding)?;
                    Ok(vec![1.0, value])
                })
                .collect()
        }
    }

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        batches: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, RagError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Arc::new(RecordingModel {
                batches: Arc::clone(&self.batches),
            }))
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl ModelLoader for FailingLoader {
        async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, RagError> {
            Err(RagError::EmbeddingFailed("weights missing".to_string()))
        }
    }

    fn counting_embedder() -> (LazyEmbedder, Arc<AtomicUsize>, Arc<Mutex<Vec<usize>>>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let embedder = LazyEmbedder::new(CountingLoader {
            loads: Arc::clone(&loads),
            batches: Arc::clone(&batches),
        });
        (embedder, loads, batches)
    }

    #[test]
    fn ngram_model_is_deterministic() {
        let model = NgramModel::default();
        let first = model.embed_one("Orbital period of the comet");
        let second = model.embed_one("Orbital period of the comet");
        assert_eq!(first, second);
    }

    #[test]
    fn ngram_model_outputs_expected_length() {
        let model = NgramModel { dimensions: 32 };
        assert_eq!(model.embed_one("abc").len(), 32);
        assert_eq!(NgramModel::default().embed_one("abc").len(), 384);
    }

    #[tokio::test]
    async fn model_loads_once_for_concurrent_callers() {
        let (embedder, loads, _) = counting_embedder();
        assert!(!embedder.is_loaded());

        let (a, b, c) = tokio::join!(
            embedder.embed("1"),
            embedder.embed("2"),
            embedder.embed("3")
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        embedder.embed("4").await.unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(embedder.is_loaded());
    }

    #[tokio::test]
    async fn batches_are_split_and_reassembled_in_order() {
        let (embedder, _, batches) = counting_embedder();
        let inputs = (0..23).map(|n| n.to_string()).collect::<Vec<_>>();

        let vectors = embedder.embed_batch(&inputs).await.unwrap();

        assert_eq!(*batches.lock().unwrap(), vec![10, 10, 3]);
        assert_eq!(vectors.len(), 23);
        for (position, vector) in vectors.iter().enumerate() {
            let ratio = vector[1] / vector[0];
            assert!((ratio - position as f32).abs() < 1e-3);
        }
    }

    #[tokio::test]
    async fn vectors_are_unit_length() {
        let (embedder, _, _) = counting_embedder();
        let vector = embedder.embed("7").await.unwrap();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn failures_surface_as_embedding_failed() {
        let embedder = LazyEmbedder::new(FailingLoader);
        let result = embedder.embed("anything").await;
        assert!(matches!(result, Err(RagError::EmbeddingFailed(_))));

        let (embedder, _, _) = counting_embedder();
        let result = embedder.embed("not a number").await;
        assert!(matches!(result, Err(RagError::EmbeddingFailed(_))));
    }

    #[tokio::test]
    async fn malformed_endpoint_url_is_an_embedding_failure() {
        let embedder = LazyEmbedder::new(HttpEmbeddingLoader {
            base_url: "not a url".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: None,
        });
        let result = embedder.embed("lecture notes").await;
        assert!(matches!(result, Err(RagError::EmbeddingFailed(_))));
        assert!(!embedder.is_loaded());
    }

    #[tokio::test]
    async fn empty_input_is_rejected_before_loading() {
        let (embedder, loads, _) = counting_embedder();
        let result = embedder.embed("   ").await;
        assert!(matches!(result, Err(RagError::EmbeddingFailed(_))));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }
}
