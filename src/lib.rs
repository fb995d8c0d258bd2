//! Smart-Fork - local conversational session archive indexer and search.
//!
//! Turns a tree of append-only session transcripts into a searchable
//! index: parsing, chunking, embedding, and ranking are all local and
//! offline, with a background watcher that keeps the index current as
//! sessions grow.

pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod scorer;
pub mod setup;
pub mod storage;
pub mod types;

pub use config::SmartForkConfig;
pub use error::{Result, SmartForkError};
pub use storage::{Storage, VectorIndex};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
