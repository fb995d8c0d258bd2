//! Embedder (L4, spec §4.4): wraps the external encoder, applies the
//! content-addressed cache, and batches with adaptive sizing under memory
//! pressure.

pub mod cache;

pub use cache::EmbeddingCache;

use std::sync::Mutex;

use crate::config::EmbeddingConfig;
use crate::error::{Result, SmartForkError};
use crate::types::Embedding;

/// The external encoder contract (spec §4.4 and "Out of scope"): a pure
/// function `encode([text], {normalize: true}) -> [vector]`.
pub trait Encoder: Send + Sync {
    fn encode(&self, texts: &[&str]) -> Result<Vec<Embedding>>;
    fn dimension(&self) -> usize;
    fn model_name(&self) -> &str;
}

/// Deterministic fallback encoder used when no remote embedding backend is
/// configured. Hashes shingles of the input text into a fixed-width bag of
/// buckets and L2-normalises the result — not a trained model, but
/// satisfies the `encode` contract so the rest of the pipeline is fully
/// exercisable offline.
pub struct HashingEncoder {
    dimension: usize,
}

impl HashingEncoder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Encoder for HashingEncoder {
    fn encode(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dimension)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hashing-fallback"
    }
}

fn hash_embed(text: &str, dimension: usize) -> Embedding {
    use std::hash::{Hash, Hasher};

    let mut vector = vec![0f32; dimension];
    for token in text.split_whitespace() {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        token.hash(&mut hasher);
        let bucket = (hasher.finish() as usize) % dimension;
        vector[bucket] += 1.0;
    }
    normalize(&mut vector);
    vector
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cosine similarity over unit-normalised vectors: dot product suffices
/// (spec §4.5 "Similarity").
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// OpenAI-compatible embeddings backend, used when `config.model` names a
/// hosted model rather than the offline hashing fallback. Blocks on the
/// current Tokio runtime so it satisfies the synchronous [`Encoder`]
/// contract the rest of the pipeline assumes.
#[cfg(feature = "openai")]
pub struct OpenAiEncoder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
}

#[cfg(feature = "openai")]
impl OpenAiEncoder {
    pub fn new(api_key: String, model: String, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            dimension,
        }
    }

    async fn encode_async(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "input": texts,
                "model": self.model,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SmartForkError::Embedding(format!(
                "OpenAI embeddings request failed ({status}): {body}"
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let entries = data["data"]
            .as_array()
            .ok_or_else(|| SmartForkError::Embedding("unexpected response shape".to_string()))?;

        let mut vectors: Vec<Embedding> = entries
            .iter()
            .map(|entry| {
                entry["embedding"]
                    .as_array()
                    .map(|values| values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                    .unwrap_or_default()
            })
            .collect();

        for vector in &mut vectors {
            normalize(vector);
        }

        Ok(vectors)
    }
}

#[cfg(feature = "openai")]
impl Encoder for OpenAiEncoder {
    fn encode(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.encode_async(texts))
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Pick a batch size by piecewise-linear interpolation between
/// `min_batch` and `max_batch` based on available memory (spec §4.4
/// "Adaptive batching"): at or below `threshold_mb` use the minimum, at or
/// above `2*threshold_mb` use the maximum, otherwise interpolate linearly.
pub fn adaptive_batch_size(
    available_mb: usize,
    threshold_mb: usize,
    min_batch: usize,
    max_batch: usize,
) -> usize {
    if threshold_mb == 0 || available_mb <= threshold_mb {
        return min_batch;
    }
    let ceiling = threshold_mb.saturating_mul(2);
    if available_mb >= ceiling {
        return max_batch;
    }
    let span = (ceiling - threshold_mb) as f64;
    let position = (available_mb - threshold_mb) as f64 / span;
    let interpolated = min_batch as f64 + position * (max_batch as f64 - min_batch as f64);
    interpolated.round() as usize
}

/// Rough estimate of currently available system memory, in megabytes.
/// Falls back to a generous constant when the platform doesn't expose
/// `/proc/meminfo` (matching the "advisory, never load-bearing" posture
/// the rest of the adaptive-batching logic assumes).
pub fn available_memory_mb() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Ok(contents) = std::fs::read_to_string("/proc/meminfo") {
            for line in contents.lines() {
                if let Some(rest) = line.strip_prefix("MemAvailable:") {
                    let kb: usize = rest
                        .trim()
                        .trim_end_matches(" kB")
                        .parse()
                        .unwrap_or(0);
                    return kb / 1024;
                }
            }
        }
    }
    4096
}

/// Wraps an [`Encoder`] with the content-addressed cache, batching, and
/// the lazy load/unload lifecycle spec §4.4 calls for.
pub struct Embedder {
    encoder: Mutex<Option<Box<dyn Encoder>>>,
    cache: EmbeddingCache,
    config: EmbeddingConfig,
    /// Memory level (MB) below which batches shrink to `min_batch`; taken
    /// from `MemoryConfig::max_memory_mb` at construction (spec §4.4).
    memory_threshold_mb: usize,
    factory: Box<dyn Fn() -> Box<dyn Encoder> + Send + Sync>,
}

impl Embedder {
    pub fn new(
        config: EmbeddingConfig,
        memory_threshold_mb: usize,
        cache: EmbeddingCache,
        factory: Box<dyn Fn() -> Box<dyn Encoder> + Send + Sync>,
    ) -> Self {
        Self {
            encoder: Mutex::new(None),
            cache,
            config,
            memory_threshold_mb,
            factory,
        }
    }

    /// Lazily construct the encoder on first use; idempotent on repeat calls.
    fn ensure_loaded(&self) -> Result<()> {
        let mut guard = self
            .encoder
            .lock()
            .map_err(|_| SmartForkError::Internal("embedder lock poisoned".to_string()))?;
        if guard.is_none() {
            *guard = Some((self.factory)());
        }
        Ok(())
    }

    /// Unload the underlying encoder, freeing any resources it holds.
    /// Safe to call repeatedly; the next `embed` call reloads it.
    pub fn unload(&self) -> Result<()> {
        let mut guard = self
            .encoder
            .lock()
            .map_err(|_| SmartForkError::Internal("embedder lock poisoned".to_string()))?;
        *guard = None;
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Embed a batch of texts, consulting the cache first: only misses are
    /// sent to the encoder, results are stitched back in the original
    /// order, and misses are written back to the cache (spec §4.4 "Cache
    /// integration"). The encoder is never invoked for a wholly-cached batch.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let (cached, miss_indices) = self.cache.get_batch(&text_refs);

        let mut results: Vec<Option<Embedding>> = cached;

        if !miss_indices.is_empty() {
            self.ensure_loaded()?;

            let available = available_memory_mb();
            let batch_size = adaptive_batch_size(
                available,
                self.memory_threshold_mb,
                self.config.min_batch,
                self.config.max_batch,
            );

            for chunk in miss_indices.chunks(batch_size.max(1)) {
                let chunk_texts: Vec<&str> = chunk.iter().map(|&i| text_refs[i]).collect();

                let encoded = {
                    let guard = self.encoder.lock().map_err(|_| {
                        SmartForkError::Internal("embedder lock poisoned".to_string())
                    })?;
                    let encoder = guard
                        .as_ref()
                        .ok_or_else(|| SmartForkError::Internal("encoder not loaded".to_string()))?;
                    encoder.encode(&chunk_texts)?
                };

                for (&index, embedding) in chunk.iter().zip(encoded.into_iter()) {
                    self.cache.put(text_refs[index].to_string(), embedding.clone());
                    results[index] = Some(embedding);
                }

                request_gc_hint();
            }
        }

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| SmartForkError::Embedding("missing embedding result".to_string())))
            .collect()
    }

    pub fn embed_one(&self, text: &str) -> Result<Embedding> {
        let vectors = self.embed_batch(std::slice::from_ref(&text.to_string()))?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| SmartForkError::Embedding("encoder returned no vector".to_string()))
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

/// Build the configured encoder (spec §4.4, §6.4 `embedding.model`): `"openai"`
/// requires an API key and talks to the hosted API, anything else falls back
/// to the offline hashing encoder so the crate always works without one.
pub fn create_encoder(config: &EmbeddingConfig, api_key: Option<String>) -> Result<Box<dyn Encoder>> {
    #[cfg(feature = "openai")]
    if config.model == "openai" {
        let api_key = api_key
            .ok_or_else(|| SmartForkError::Config("embedding.model = \"openai\" requires an API key".to_string()))?;
        return Ok(Box::new(OpenAiEncoder::new(api_key, "text-embedding-3-small".to_string(), config.dimension)));
    }
    #[cfg(not(feature = "openai"))]
    let _ = api_key;

    Ok(Box::new(HashingEncoder::new(config.dimension)))
}

/// Request an allocator-hint collection to bound peak RSS between batches
/// (spec §4.4). Rust has no managed heap to collect; this is a no-op hook
/// kept so the batching loop's shape mirrors the spec 1:1.
fn request_gc_hint() {}
