//! Search Orchestrator (L9, spec §4.9): the query-time composition of the
//! embedder, vector index, registry, and scorer into a ranked slate.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::SearchConfig;
use crate::embedding::Embedder;
use crate::error::{Result, SmartForkError};
use crate::registry::SessionRegistry;
use crate::scorer::{rank_sessions, Scorer, ScoringInput};
use crate::storage::VectorIndex;
use crate::types::{ChunkHit, MetadataFilter, SessionMetadata, SessionSearchResult};

/// Terminal-style "resume by id" command template (spec §10.5, grounded in
/// the original's `fork_generator.py` fixtures).
pub fn resume_terminal_command(session_id: &str) -> String {
    format!("claude --resume {session_id}")
}

/// In-session "fork by id" command template (spec §10.5).
pub fn resume_in_session_command(session_id: &str) -> String {
    format!("/fork {session_id}")
}

/// Truncate `text` to at most `max_len` characters, breaking at the
/// nearest whitespace to the right boundary rather than mid-word (spec
/// §4.9 step 7).
pub fn truncate_preview(text: &str, max_len: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }

    let truncated: String = trimmed.chars().take(max_len).collect();
    match truncated.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => truncated[..idx].trim_end().to_string(),
        _ => truncated,
    }
}

/// Optional filter accepted at the query surface (spec §4.9 "Inputs").
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub project: Option<String>,
}

pub struct SearchOrchestrator {
    embedder: Embedder,
    vector_index: VectorIndex,
    registry: Arc<SessionRegistry>,
    scorer: Scorer,
    config: SearchConfig,
}

impl SearchOrchestrator {
    /// `registry` is an `Arc` so the orchestrator can share the exact same
    /// in-memory registry instance the background indexer writes to,
    /// rather than a second copy that would drift (spec §4.9 "the
    /// orchestrator always reads a live index").
    pub fn new(
        embedder: Embedder,
        vector_index: VectorIndex,
        registry: Arc<SessionRegistry>,
        scorer: Scorer,
        config: SearchConfig,
    ) -> Self {
        Self {
            embedder,
            vector_index,
            registry,
            scorer,
            config,
        }
    }

    /// Run the full query → embed → k-NN → group-by-session → score →
    /// top-N pipeline (spec §4.9 "Algorithm").
    ///
    /// Fails fast on an empty query ("please provide a query"); all other
    /// failures surface as `SmartForkError` for the caller to render as a
    /// single-line "error: <message>" (spec §4.9 "Failure", §7).
    pub fn search(
        &self,
        query: &str,
        top_n: Option<usize>,
        filter: QueryFilter,
    ) -> Result<Vec<SessionSearchResult>> {
        if query.trim().is_empty() {
            return Err(SmartForkError::InvalidInput(
                "please provide a query".to_string(),
            ));
        }

        let top_n = top_n.unwrap_or(self.config.top_n_sessions);
        if top_n == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_one(query)?;

        let metadata_filter = MetadataFilter {
            session_id: None,
            project: filter.project.clone(),
        };

        let hits = self
            .vector_index
            .search(&query_vector, self.config.k_chunks, &metadata_filter)?;

        if hits.is_empty() {
            return Ok(Vec::new());
        }

        // Group by session: similarities plus the matched chunk records.
        let mut by_session: HashMap<String, Vec<ChunkHit>> = HashMap::new();
        for hit in hits {
            by_session.entry(hit.session_id.clone()).or_default().push(hit);
        }

        let now = Utc::now();
        let mut scored: Vec<(crate::types::SessionScore, Option<SessionMetadata>, Vec<ChunkHit>)> =
            Vec::with_capacity(by_session.len());

        for (session_id, mut chunk_hits) in by_session {
            // Highest-similarity chunk first, for the preview synthesis below.
            chunk_hits.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let metadata = self.registry.get(&session_id);
            if metadata.is_none() {
                tracing::warn!(session_id = %session_id, "session has no registry entry; scoring as orphan");
            }

            let similarities: Vec<f32> = chunk_hits.iter().map(|h| h.similarity).collect();
            let total_chunk_count = metadata.as_ref().map(|m| m.chunk_count).unwrap_or(1);
            // An orphan session (no registry entry) scores zero recency,
            // not full recency (spec §4.9 step 4) — push its nominal
            // last-modified instant outside the recency window rather
            // than defaulting to `now`.
            let last_modified = metadata
                .as_ref()
                .map(|m| m.last_modified)
                .unwrap_or_else(|| now - Duration::days(crate::scorer::RECENCY_WINDOW_DAYS as i64));
            let mut memory_types: Vec<_> = chunk_hits
                .iter()
                .flat_map(|h| h.memory_types.iter().copied())
                .collect();
            memory_types.sort();
            memory_types.dedup();

            let input = ScoringInput {
                session_id: &session_id,
                similarities: &similarities,
                total_chunk_count,
                last_modified,
                memory_types,
            };
            let score = self.scorer.score(&input, now);

            scored.push((score, metadata, chunk_hits));
        }

        let (scores_and_meta, chunk_hits_by_index): (Vec<_>, Vec<_>) = scored
            .into_iter()
            .map(|(score, meta, hits)| ((score, meta), hits))
            .unzip();

        // rank_sessions sorts (score, meta) pairs; keep chunk hits aligned
        // by re-deriving the permutation via session_id after ranking.
        let hits_by_session: HashMap<String, Vec<ChunkHit>> = scores_and_meta
            .iter()
            .map(|(score, _)| score.session_id.clone())
            .zip(chunk_hits_by_index)
            .collect();

        let ranked = rank_sessions(scores_and_meta);

        let mut results = Vec::with_capacity(top_n.min(ranked.len()));
        for (score, metadata) in ranked.into_iter().take(top_n) {
            let chunk_hits = hits_by_session.get(&score.session_id).cloned().unwrap_or_default();
            let preview = chunk_hits
                .first()
                .map(|h| truncate_preview(&h.text, self.config.preview_length))
                .unwrap_or_default();

            results.push(SessionSearchResult {
                resume_terminal_cmd: resume_terminal_command(&score.session_id),
                resume_in_session_cmd: resume_in_session_command(&score.session_id),
                session_id: score.session_id.clone(),
                score,
                metadata,
                preview,
                matched_chunks: chunk_hits,
            });
        }

        Ok(results)
    }
}
