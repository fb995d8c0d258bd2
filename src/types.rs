//! Core data model shared across Smart-Fork's components (spec §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of salience markers a chunk can carry (spec §3, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SalienceMarker {
    Pattern,
    WorkingSolution,
    Waiting,
}

impl SalienceMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            SalienceMarker::Pattern => "PATTERN",
            SalienceMarker::WorkingSolution => "WORKING_SOLUTION",
            SalienceMarker::Waiting => "WAITING",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "PATTERN" => Some(SalienceMarker::Pattern),
            "WORKING_SOLUTION" => Some(SalienceMarker::WorkingSolution),
            "WAITING" => Some(SalienceMarker::Waiting),
            _ => None,
        }
    }

    /// Additive boost contributed by this marker towards the scorer's
    /// `memory_boost` term (spec §4.7).
    pub fn boost(&self) -> f32 {
        match self {
            SalienceMarker::Pattern => 0.05,
            SalienceMarker::WorkingSolution => 0.08,
            SalienceMarker::Waiting => 0.02,
        }
    }
}

impl std::fmt::Display for SalienceMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dialog turn (spec §3 "Message").
///
/// `content` is always a materialised string: the parser pushes all
/// shape-dispatch (string vs. list-of-blocks vs. alternate field names)
/// into itself, so nothing downstream ever branches on payload shape
/// (spec §9 "Dynamic message payloads").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the speaker. Invariant: non-empty.
    pub role: String,
    /// Materialised textual content.
    pub content: String,
    /// Absolute instant the message was produced, if the record carried one.
    pub timestamp: Option<DateTime<Utc>>,
    /// Opaque extra fields preserved from the source record (spec §6.1).
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn is_valid(&self) -> bool {
        !self.role.is_empty()
    }
}

/// A contiguous message window, the unit of embedding and retrieval
/// (spec §3 "Chunk").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Concatenation of `"[role]: content"` for every message in the window.
    pub content: String,
    /// Inclusive message-index range into the source session.
    pub start: usize,
    pub end: usize,
    /// Cheap token estimate (chars / 4, spec §4.2).
    pub token_estimate: usize,
    /// Sorted, deduplicated salience markers detected in `content`.
    pub markers: Vec<SalienceMarker>,
}

/// A unit-normalised fixed-length embedding vector.
pub type Embedding = Vec<f32>;

/// The persisted shape inside the vector index (spec §3 "Stored Chunk Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunkRecord {
    pub id: String,
    pub session_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub embedding: Embedding,
    pub memory_types: Vec<SalienceMarker>,
    pub project: Option<String>,
}

/// A chunk hit returned from a k-NN sweep, before per-session aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub id: String,
    pub session_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub memory_types: Vec<SalienceMarker>,
    pub project: Option<String>,
    pub similarity: f32,
}

/// Equality-conjunction filter over stored-record metadata (spec §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub session_id: Option<String>,
    pub project: Option<String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.project.is_none()
    }

    pub fn matches(&self, session_id: &str, project: Option<&str>) -> bool {
        if let Some(ref sid) = self.session_id {
            if sid != session_id {
                return false;
            }
        }
        if let Some(ref p) = self.project {
            if project != Some(p.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Registry entry keyed by session identifier (spec §3 "Session Metadata").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    /// Canonicalised working-directory tag (absolute path, `/` replaced with `-`).
    pub project: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_indexed: Option<DateTime<Utc>>,
    pub chunk_count: usize,
    pub message_count: usize,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Per-session score breakdown produced by the Scorer (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionScore {
    pub session_id: String,
    pub best_similarity: f32,
    pub avg_similarity: f32,
    pub chunk_ratio: f32,
    pub recency: f32,
    pub chain_quality: f32,
    pub memory_boost: f32,
    pub memory_types: Vec<SalienceMarker>,
    pub final_score: f32,
    pub num_chunks_matched: usize,
}

/// One ranked result from the Search Orchestrator (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSearchResult {
    pub session_id: String,
    pub score: SessionScore,
    pub metadata: Option<SessionMetadata>,
    pub preview: String,
    pub matched_chunks: Vec<ChunkHit>,
    pub resume_terminal_cmd: String,
    pub resume_in_session_cmd: String,
}

/// Transient in-memory record tracking one file awaiting (re-)indexing
/// (spec §3 "Indexing Task").
#[derive(Debug, Clone)]
pub struct IndexingTask {
    pub path: std::path::PathBuf,
    pub last_modified: std::time::SystemTime,
    pub message_count: usize,
    pub last_indexed_count: usize,
    pub last_event: std::time::Instant,
    pub error_count: u32,
}

impl IndexingTask {
    pub fn needs_indexing(&self) -> bool {
        self.message_count > self.last_indexed_count
    }
}

/// Durable sidecar for the initial one-shot scan (spec §3 "Setup State").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupState {
    pub total_files: usize,
    pub processed: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}
