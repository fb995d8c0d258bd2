//! Chunker (L2, spec §4.2).
//!
//! Groups parsed messages into overlapping, token-bounded windows and tags
//! each with detected salience markers. Also offers a secondary text-mode
//! entry point for chunking free-form documents outside normal sessions.

use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::config::ChunkingConfig;
use crate::types::{Chunk, Message, SalienceMarker};

/// Cheap, deterministic token-estimate proxy (spec §4.2): characters ÷ 4.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Keyword groups behind `{PATTERN, WORKING_SOLUTION, WAITING}` detection,
/// reproduced verbatim from the original's fixtures (spec §10.5).
static PATTERN_KEYWORDS: &[&str] = &[
    r"\bpattern\b",
    r"\bdesign pattern\b",
    r"\barchitectural pattern\b",
    r"\bsolution pattern\b",
    r"\bapproach\b",
    r"\bstrategy\b",
    r"\barchitecture\b",
];

static WORKING_SOLUTION_KEYWORDS: &[&str] = &[
    r"\bworking solution\b",
    r"\bproven implementation\b",
    r"\bsuccessful\b",
    r"\btested\b",
    r"\bverified\b",
    r"\bworks correctly\b",
    r"\bimplementation complete\b",
    r"\ball tests pass\b",
];

static WAITING_KEYWORDS: &[&str] = &[
    r"\bwaiting\b",
    r"\bpending\b",
    r"\bto be completed\b",
    r"\bresume later\b",
    r"\bin progress\b",
    r"\bto do\b",
    r"\btodo\b",
    r"\bblocked\b",
];

struct MarkerSets {
    pattern: RegexSet,
    working_solution: RegexSet,
    waiting: RegexSet,
}

static MARKER_SETS: Lazy<MarkerSets> = Lazy::new(|| MarkerSets {
    pattern: RegexSet::new(PATTERN_KEYWORDS.iter().map(|k| format!("(?i){k}"))).unwrap(),
    working_solution: RegexSet::new(
        WORKING_SOLUTION_KEYWORDS.iter().map(|k| format!("(?i){k}")),
    )
    .unwrap(),
    waiting: RegexSet::new(WAITING_KEYWORDS.iter().map(|k| format!("(?i){k}"))).unwrap(),
});

/// Detect salience markers in `text`, sorted for determinism (spec §4.2, §9).
pub fn detect_markers(text: &str) -> Vec<SalienceMarker> {
    let mut markers = Vec::new();
    if MARKER_SETS.pattern.is_match(text) {
        markers.push(SalienceMarker::Pattern);
    }
    if MARKER_SETS.working_solution.is_match(text) {
        markers.push(SalienceMarker::WorkingSolution);
    }
    if MARKER_SETS.waiting.is_match(text) {
        markers.push(SalienceMarker::Waiting);
    }
    markers.sort();
    markers
}

fn format_message(message: &Message) -> String {
    format!("[{}]: {}", message.role, message.content)
}

/// A non-user role marks the end of a turn (spec §4.2 "boundary preference").
fn is_non_user_role(role: &str) -> bool {
    !role.eq_ignore_ascii_case("user")
}

/// Chunk an ordered message sequence into overlapping, token-bounded
/// windows (spec §4.2).
///
/// Invariants upheld (verified by property tests in `tests/property_tests.rs`):
/// `chunks[0].start == 0`; `chunks.last().end == messages.len() - 1`; for
/// every adjacent pair `next.start > prev.start`; every non-single-message
/// chunk's token estimate never exceeds `config.max_tokens`.
pub fn chunk_messages(messages: &[Message], config: &ChunkingConfig) -> Vec<Chunk> {
    if messages.is_empty() {
        return Vec::new();
    }

    let target = config.target_tokens;
    let max = config.max_tokens;
    let overlap_budget = config.overlap_tokens;

    let formatted: Vec<String> = messages.iter().map(format_message).collect();
    let token_estimates: Vec<usize> = formatted.iter().map(|s| estimate_tokens(s)).collect();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < messages.len() {
        // A single oversized message is forced into its own chunk, unsplit.
        if token_estimates[start] > max {
            let content = formatted[start].clone();
            chunks.push(Chunk {
                markers: detect_markers(&content),
                content,
                start,
                end: start,
                token_estimate: token_estimates[start],
            });
            start += 1;
            continue;
        }

        let mut end = start;
        let mut running = 0usize;
        let mut last_good_boundary: Option<usize> = None;

        loop {
            let next_running = running + token_estimates[end];
            if next_running > target && end > start {
                // Prefer to stop at the last non-user-role boundary we
                // already passed while still inside [T, M].
                if let Some(boundary) = last_good_boundary {
                    if running >= target {
                        end = boundary;
                        break;
                    }
                }
                if next_running > max {
                    break;
                }
            }
            running = next_running;
            if is_non_user_role(&messages[end].role) && running >= target && running <= max {
                last_good_boundary = Some(end);
            }
            if running >= target || end + 1 >= messages.len() {
                if end + 1 >= messages.len() {
                    break;
                }
                if running >= max {
                    break;
                }
                // Look one more message ahead only if still under target.
                if running < target {
                    end += 1;
                    continue;
                }
                break;
            }
            end += 1;
        }

        let range_end = end.min(messages.len() - 1);
        let content = formatted[start..=range_end].join("\n\n");
        let token_estimate = estimate_tokens(&content);
        let markers = detect_markers(&content);

        chunks.push(Chunk {
            content,
            start,
            end: range_end,
            token_estimate,
            markers,
        });

        if range_end + 1 >= messages.len() {
            break;
        }

        // Replay a tail of prior messages whose token count sums to <= overlap_budget.
        let mut overlap_start = range_end + 1;
        let mut overlap_tokens = 0usize;
        let mut cursor = range_end;
        loop {
            let candidate_tokens = token_estimates[cursor];
            if overlap_tokens + candidate_tokens > overlap_budget {
                break;
            }
            overlap_tokens += candidate_tokens;
            overlap_start = cursor;
            if cursor == start {
                break;
            }
            cursor -= 1;
        }

        // Forward progress guaranteed: next start must exceed this chunk's start.
        start = if overlap_start > start {
            overlap_start
        } else {
            range_end + 1
        };
    }

    chunks
}

/// Text-mode chunking for free documents outside normal sessions (spec
/// §4.2 "Text-mode chunking"): never splits inside a fenced code region,
/// prefers paragraph boundaries, and allows chunks up to `~3*max_tokens`.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let hard_limit = config.max_tokens.saturating_mul(3).max(1);
    let paragraphs = split_paragraphs_respecting_fences(text);

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for paragraph in paragraphs {
        let paragraph_tokens = estimate_tokens(&paragraph);

        if !current.is_empty() && current_tokens + paragraph_tokens > hard_limit {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }

        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&paragraph);
        current_tokens += paragraph_tokens;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Split `text` into paragraphs (blank-line separated), keeping any fenced
/// code block (delimited by a line starting with ` ``` `) intact as part
/// of whichever paragraph it opened in.
fn split_paragraphs_respecting_fences(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current_lines: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        let is_fence_delimiter = line.trim_start().starts_with("```");
        if is_fence_delimiter {
            in_fence = !in_fence;
            current_lines.push(line);
            continue;
        }

        if line.trim().is_empty() && !in_fence {
            if !current_lines.is_empty() {
                paragraphs.push(current_lines.join("\n"));
                current_lines.clear();
            }
            continue;
        }

        current_lines.push(line);
    }

    if !current_lines.is_empty() {
        paragraphs.push(current_lines.join("\n"));
    }

    paragraphs
}
