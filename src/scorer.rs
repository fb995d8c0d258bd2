//! Scorer (L7, spec §4.7): combines per-chunk similarities from a k-NN
//! sweep with registry metadata into a per-session score breakdown.

use chrono::{DateTime, Utc};

use crate::config::SearchConfig;
use crate::types::{SalienceMarker, SessionMetadata, SessionScore};

/// Recency half-window in days (spec §4.7): `recency = max(0, 1 - Δdays/D)`.
pub const RECENCY_WINDOW_DAYS: f64 = 30.0;

/// `chain_quality` is a placeholder reserved for future turn-graph analysis
/// (spec §4.7, §9 "Open questions"). Held constant until that analysis is
/// specified.
pub const DEFAULT_CHAIN_QUALITY: f32 = 0.5;

/// The composite weight vector (spec §4.7). Configuration surface: these
/// are the documented defaults, summing to 1.00 before the additive
/// `memory_boost` term.
#[derive(Debug, Clone, Copy)]
pub struct ScorerWeights {
    pub best_similarity: f32,
    pub avg_similarity: f32,
    pub chunk_ratio: f32,
    pub recency: f32,
    pub chain_quality: f32,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            best_similarity: 0.35,
            avg_similarity: 0.15,
            chunk_ratio: 0.10,
            recency: 0.25,
            chain_quality: 0.15,
        }
    }
}

impl ScorerWeights {
    /// Build the weight vector from configuration (spec §6.4
    /// `search.recency_weight`), the one weight the spec exposes outside
    /// the scorer's own defaults. The other four terms are scaled down
    /// from their documented defaults proportionally so the vector still
    /// sums to 1.00 (spec §4.7) whatever `recency_weight` is set to.
    pub fn from_search_config(config: &SearchConfig) -> Self {
        let defaults = Self::default();
        let other_default_sum =
            defaults.best_similarity + defaults.avg_similarity + defaults.chunk_ratio + defaults.chain_quality;
        let recency = config.recency_weight.clamp(0.0, 1.0);
        let remaining = (1.0 - recency).max(0.0);
        let scale = if other_default_sum > 0.0 { remaining / other_default_sum } else { 0.0 };

        Self {
            best_similarity: defaults.best_similarity * scale,
            avg_similarity: defaults.avg_similarity * scale,
            chunk_ratio: defaults.chunk_ratio * scale,
            recency,
            chain_quality: defaults.chain_quality * scale,
        }
    }
}

/// One candidate session's inputs to the scorer (spec §4.7 "Inputs per
/// candidate session").
pub struct ScoringInput<'a> {
    pub session_id: &'a str,
    /// Similarities of this session's chunks appearing in the k-NN result
    /// set. Not necessarily sorted, may be empty.
    pub similarities: &'a [f32],
    /// Total chunk count in this session, from the registry.
    pub total_chunk_count: usize,
    /// Session last-modified instant, from the registry.
    pub last_modified: DateTime<Utc>,
    /// Union of salience markers across the matched chunks.
    pub memory_types: Vec<SalienceMarker>,
}

pub struct Scorer {
    weights: ScorerWeights,
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScorerWeights::default())
    }
}

impl Scorer {
    pub fn new(weights: ScorerWeights) -> Self {
        Self { weights }
    }

    /// Build a scorer whose weight vector honours `search.recency_weight`
    /// (spec §6.4), rather than the hardcoded defaults.
    pub fn from_search_config(config: &SearchConfig) -> Self {
        Self::new(ScorerWeights::from_search_config(config))
    }

    /// Compute the full score breakdown for one candidate session (spec
    /// §4.7 "Sub-scores" and "Composite"). Deterministic: identical inputs
    /// always produce an identical breakdown.
    pub fn score(&self, input: &ScoringInput<'_>, now: DateTime<Utc>) -> SessionScore {
        let num_chunks_matched = input.similarities.len();

        let best_similarity = input
            .similarities
            .iter()
            .copied()
            .fold(0.0f32, |acc, v| acc.max(v));

        let avg_similarity = if num_chunks_matched == 0 {
            0.0
        } else {
            input.similarities.iter().sum::<f32>() / num_chunks_matched as f32
        };

        let chunk_ratio = if input.total_chunk_count == 0 {
            0.0
        } else {
            (num_chunks_matched as f32 / input.total_chunk_count as f32).clamp(0.0, 1.0)
        };

        let delta_days = (now - input.last_modified).num_seconds() as f64 / 86_400.0;
        let recency = (1.0 - delta_days / RECENCY_WINDOW_DAYS).max(0.0) as f32;

        let chain_quality = DEFAULT_CHAIN_QUALITY;

        let memory_boost: f32 = input.memory_types.iter().map(SalienceMarker::boost).sum();

        let composite = self.weights.best_similarity * best_similarity
            + self.weights.avg_similarity * avg_similarity
            + self.weights.chunk_ratio * chunk_ratio
            + self.weights.recency * recency
            + self.weights.chain_quality * chain_quality
            + memory_boost;

        let mut memory_types = input.memory_types.clone();
        memory_types.sort();
        memory_types.dedup();

        SessionScore {
            session_id: input.session_id.to_string(),
            best_similarity,
            avg_similarity,
            chunk_ratio,
            recency,
            chain_quality,
            memory_boost,
            memory_types,
            final_score: composite.clamp(0.0, 1.0),
            num_chunks_matched,
        }
    }
}

/// Sort scored sessions descending by `final_score`, tie-broken by
/// descending `best_similarity`, then descending last-modified instant,
/// then ascending `session_id` (spec §4.7 "Ranking").
pub fn rank_sessions(mut scored: Vec<(SessionScore, Option<SessionMetadata>)>) -> Vec<(SessionScore, Option<SessionMetadata>)> {
    scored.sort_by(|(a_score, a_meta), (b_score, b_meta)| {
        b_score
            .final_score
            .partial_cmp(&a_score.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b_score
                    .best_similarity
                    .partial_cmp(&a_score.best_similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                let a_last = a_meta.as_ref().map(|m| m.last_modified);
                let b_last = b_meta.as_ref().map(|m| m.last_modified);
                b_last.cmp(&a_last)
            })
            .then_with(|| a_score.session_id.cmp(&b_score.session_id))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_weights_from_config_use_configured_recency_and_sum_to_one() {
        let mut search_config = SearchConfig::default();
        search_config.recency_weight = 0.5;
        let weights = ScorerWeights::from_search_config(&search_config);

        assert_eq!(weights.recency, 0.5);
        let total = weights.best_similarity
            + weights.avg_similarity
            + weights.chunk_ratio
            + weights.recency
            + weights.chain_quality;
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_default_search_config_reproduces_default_weights() {
        let weights = ScorerWeights::from_search_config(&SearchConfig::default());
        let defaults = ScorerWeights::default();
        assert!((weights.best_similarity - defaults.best_similarity).abs() < 1e-6);
        assert!((weights.recency - defaults.recency).abs() < 1e-6);
    }

    fn meta(id: &str, last_modified: DateTime<Utc>) -> SessionMetadata {
        SessionMetadata {
            session_id: id.to_string(),
            project: None,
            created_at: last_modified,
            last_modified,
            last_indexed: None,
            chunk_count: 4,
            message_count: 10,
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_final_score_within_unit_interval() {
        let now = Utc::now();
        let scorer = Scorer::default();
        let input = ScoringInput {
            session_id: "s1",
            similarities: &[0.9, 0.8, 0.95],
            total_chunk_count: 4,
            last_modified: now - Duration::days(2),
            memory_types: vec![SalienceMarker::Pattern, SalienceMarker::WorkingSolution],
        };
        let score = scorer.score(&input, now);
        assert!(score.final_score >= 0.0 && score.final_score <= 1.0);
        assert_eq!(score.num_chunks_matched, 3);
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let now = Utc::now();
        let scorer = Scorer::default();
        let input = ScoringInput {
            session_id: "s1",
            similarities: &[0.5, 0.6],
            total_chunk_count: 2,
            last_modified: now,
            memory_types: vec![],
        };
        let a = scorer.score(&input, now);
        let b = scorer.score(&input, now);
        assert_eq!(a.final_score, b.final_score);
    }

    #[test]
    fn test_recency_dominance_one_day_vs_sixty_days() {
        // Scenario 2 (spec §8): identical content/similarity, different age.
        let now = Utc::now();
        let scorer = Scorer::default();

        let recent = ScoringInput {
            session_id: "recent",
            similarities: &[0.8],
            total_chunk_count: 1,
            last_modified: now - Duration::days(1),
            memory_types: vec![],
        };
        let old = ScoringInput {
            session_id: "old",
            similarities: &[0.8],
            total_chunk_count: 1,
            last_modified: now - Duration::days(60),
            memory_types: vec![],
        };

        let recent_score = scorer.score(&recent, now);
        let old_score = scorer.score(&old, now);

        assert!((recent_score.recency - 0.967).abs() < 0.01);
        assert_eq!(old_score.recency, 0.0);
        assert!(recent_score.final_score > old_score.final_score);
    }

    #[test]
    fn test_memory_boost_ordering_exact_delta() {
        // Scenario 3 (spec §8): identical similarity/recency, boost differs
        // by exactly PATTERN (0.05) + WORKING_SOLUTION (0.08) = 0.13.
        let now = Utc::now();
        let scorer = Scorer::default();

        let with_markers = ScoringInput {
            session_id: "a",
            similarities: &[0.7],
            total_chunk_count: 1,
            last_modified: now,
            memory_types: vec![SalienceMarker::Pattern, SalienceMarker::WorkingSolution],
        };
        let without_markers = ScoringInput {
            session_id: "b",
            similarities: &[0.7],
            total_chunk_count: 1,
            last_modified: now,
            memory_types: vec![],
        };

        let a = scorer.score(&with_markers, now);
        let b = scorer.score(&without_markers, now);
        assert!((a.final_score - b.final_score - 0.13).abs() < 1e-4);
    }

    #[test]
    fn test_ranking_tie_breaks_by_best_similarity_then_recency_then_id() {
        let now = Utc::now();
        let a = SessionScore {
            session_id: "b".to_string(),
            best_similarity: 0.9,
            avg_similarity: 0.9,
            chunk_ratio: 1.0,
            recency: 1.0,
            chain_quality: 0.5,
            memory_boost: 0.0,
            memory_types: vec![],
            final_score: 0.5,
            num_chunks_matched: 1,
        };
        let mut b = a.clone();
        b.session_id = "a".to_string();

        let ranked = rank_sessions(vec![
            (a.clone(), Some(meta("b", now))),
            (b.clone(), Some(meta("a", now))),
        ]);
        // Equal everything except session_id: ascending id wins the tie.
        assert_eq!(ranked[0].0.session_id, "a");
    }

    #[test]
    fn test_empty_similarities_yields_zero_best_and_avg() {
        let now = Utc::now();
        let scorer = Scorer::default();
        let input = ScoringInput {
            session_id: "empty",
            similarities: &[],
            total_chunk_count: 5,
            last_modified: now,
            memory_types: vec![],
        };
        let score = scorer.score(&input, now);
        assert_eq!(score.best_similarity, 0.0);
        assert_eq!(score.avg_similarity, 0.0);
        assert_eq!(score.num_chunks_matched, 0);
    }
}
