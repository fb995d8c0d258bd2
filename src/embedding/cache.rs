//! Embedding Cache (L3, spec §4.3): a content-addressed, persistent,
//! write-once mapping `digest(text) -> vector`.
//!
//! Unlike the teacher's LRU/bytes-capacity cache, this cache never evicts
//! and never overwrites: the digest is a fingerprint of the exact bytes of
//! the text, and the first writer for a given digest wins (spec §9 "The
//! embedding cache is write-once per key").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::Embedding;

#[derive(Debug, Clone)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

struct CacheState {
    entries: HashMap<String, Embedding>,
}

/// Content-addressed, persistent embedding cache.
pub struct EmbeddingCache {
    state: Mutex<CacheState>,
    path: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn digest_of(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

impl EmbeddingCache {
    /// Open (or lazily create) a cache backed by `cache.json` at `path`.
    /// A corrupted file at open time yields an empty cache plus a warning
    /// — the cache is an advisory accelerator, never a source of truth
    /// (spec §4.3, §7 "Corruption").
    pub fn open(path: &Path) -> Self {
        let entries = if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<HashMap<String, Embedding>>(&raw) {
                    Ok(map) => map,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "corrupt embedding cache, starting empty");
                        HashMap::new()
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "could not read embedding cache, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Self {
            state: Mutex::new(CacheState { entries }),
            path: path.to_path_buf(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up the cached vector for `text`'s exact content.
    pub fn get(&self, text: &str) -> Option<Embedding> {
        let digest = digest_of(text);
        let state = self.state.lock().expect("embedding cache lock poisoned");
        let hit = state.entries.get(&digest).cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Batch lookup: returns a per-text `Option<Embedding>` slot plus the
    /// indices that missed (spec §4.3 `get_batch`).
    pub fn get_batch(&self, texts: &[&str]) -> (Vec<Option<Embedding>>, Vec<usize>) {
        let mut results = Vec::with_capacity(texts.len());
        let mut misses = Vec::new();
        for (index, text) in texts.iter().enumerate() {
            let hit = self.get(text);
            if hit.is_none() {
                misses.push(index);
            }
            results.push(hit);
        }
        (results, misses)
    }

    /// Write `embedding` under `text`'s digest. Write-once: if the digest
    /// already holds a value, the put is ignored (first-writer wins).
    pub fn put(&self, text: String, embedding: Embedding) {
        let digest = digest_of(&text);
        let mut state = self.state.lock().expect("embedding cache lock poisoned");
        state.entries.entry(digest).or_insert(embedding);
    }

    pub fn put_batch(&self, items: Vec<(String, Embedding)>) {
        for (text, embedding) in items {
            self.put(text, embedding);
        }
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let entries = self.state.lock().expect("embedding cache lock poisoned").entries.len();
        EmbeddingCacheStats {
            hits,
            misses,
            entries,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    /// Persist the in-memory map atomically (write-temp-then-rename). The
    /// in-memory map is authoritative between flushes (spec §4.3).
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock().expect("embedding cache lock poisoned");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string(&state.entries)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Drop all entries and reset statistics. Does not touch the file on
    /// disk until the next `flush`.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("embedding cache lock poisoned");
        state.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
