//! Configuration record for Smart-Fork (spec §6.4).
//!
//! Mirrors the teacher crate's approach: a serde-derived record with a
//! `Default` impl carrying the documented defaults, loadable from a TOML
//! file and overlaid with CLI/env values by the binaries. Loading and CLI
//! parsing themselves are out of the core's scope (spec §1) — this module
//! only owns the record and its validation.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmartForkError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimension: usize,
    pub min_batch: usize,
    pub max_batch: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "offline-hash".to_string(),
            dimension: 768,
            min_batch: 8,
            max_batch: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub k_chunks: usize,
    pub top_n_sessions: usize,
    pub preview_length: usize,
    pub similarity_threshold: f32,
    pub recency_weight: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k_chunks: 200,
            top_n_sessions: 5,
            preview_length: 200,
            similarity_threshold: 0.3,
            recency_weight: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 750,
            overlap_tokens: 150,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub debounce_seconds: f64,
    pub checkpoint_interval: usize,
    pub enabled: bool,
    pub max_workers: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: 5.0,
            checkpoint_interval: 15,
            enabled: true,
            max_workers: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8741,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_memory_mb: usize,
    pub gc_between_batches: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 2000,
            gc_between_batches: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartForkConfig {
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub chunking: ChunkingConfig,
    pub indexing: IndexingConfig,
    pub server: ServerConfig,
    pub memory: MemoryConfig,
    pub storage_dir: String,
}

impl Default for SmartForkConfig {
    fn default() -> Self {
        let storage_dir = dirs::home_dir()
            .map(|h| h.join(".smart-fork").to_string_lossy().to_string())
            .unwrap_or_else(|| "~/.smart-fork".to_string());

        Self {
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            chunking: ChunkingConfig::default(),
            indexing: IndexingConfig::default(),
            server: ServerConfig::default(),
            memory: MemoryConfig::default(),
            storage_dir,
        }
    }
}

impl SmartForkConfig {
    /// Load from a TOML file, falling back to defaults for absent fields.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| SmartForkError::Config(e.to_string()))
    }

    /// Expand `storage_dir` (which may carry a leading `~`) to an absolute path.
    pub fn storage_dir_expanded(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(shellexpand::tilde(&self.storage_dir).to_string())
    }

    /// Validate against spec §6.4's rules.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(SmartForkError::Config(
                "embedding.dimension must be > 0".to_string(),
            ));
        }
        if self.embedding.min_batch == 0 || self.embedding.min_batch > self.embedding.max_batch {
            return Err(SmartForkError::Config(
                "embedding.min_batch must be >= 1 and <= max_batch".to_string(),
            ));
        }
        if self.search.k_chunks == 0 {
            return Err(SmartForkError::Config(
                "search.k_chunks must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.search.similarity_threshold) {
            return Err(SmartForkError::Config(
                "search.similarity_threshold must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.search.recency_weight) {
            return Err(SmartForkError::Config(
                "search.recency_weight must be within [0, 1]".to_string(),
            ));
        }
        if self.chunking.target_tokens > self.chunking.max_tokens {
            return Err(SmartForkError::Config(
                "chunking.target_tokens must be <= chunking.max_tokens".to_string(),
            ));
        }
        if self.server.port < 1024 {
            return Err(SmartForkError::Config(
                "server.port must be in the unprivileged range".to_string(),
            ));
        }
        if self.memory.max_memory_mb == 0 {
            return Err(SmartForkError::Config(
                "memory.max_memory_mb must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        let config = SmartForkConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_batch_bounds() {
        let mut config = SmartForkConfig::default();
        config.embedding.min_batch = 200;
        config.embedding.max_batch = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_target_above_max_tokens() {
        let mut config = SmartForkConfig::default();
        config.chunking.target_tokens = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_privileged_port() {
        let mut config = SmartForkConfig::default();
        config.server.port = 80;
        assert!(config.validate().is_err());
    }
}
