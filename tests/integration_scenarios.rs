//! End-to-end scenarios against the full stack (embedder, vector index,
//! registry, indexer, orchestrator), covering the literal scenarios
//! enumerated in spec §8 that need more than one component wired together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use smart_fork::config::{ChunkingConfig, EmbeddingConfig, IndexingConfig, SearchConfig};
use smart_fork::embedding::{create_encoder, Embedder, EmbeddingCache, HashingEncoder};
use smart_fork::indexer::BackgroundIndexer;
use smart_fork::orchestrator::{QueryFilter, SearchOrchestrator};
use smart_fork::registry::SessionRegistry;
use smart_fork::scorer::Scorer;
use smart_fork::storage::VectorIndex;
use smart_fork::types::SessionMetadata;

const TEST_DIM: usize = 32;

fn write_session(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(format!("{name}.jsonl"));
    let body: String = lines
        .iter()
        .map(|line| format!("{{\"role\": \"user\", \"content\": \"{line}\"}}\n"))
        .collect();
    std::fs::write(&path, body).unwrap();
    path
}

struct Stack {
    indexer: Arc<BackgroundIndexer>,
    vector_index: Arc<VectorIndex>,
    registry: Arc<SessionRegistry>,
}

fn build_stack(storage_dir: &Path) -> Stack {
    build_stack_with(storage_dir, IndexingConfig::default())
}

fn build_stack_with(storage_dir: &Path, indexing: IndexingConfig) -> Stack {
    let embedder = Arc::new(Embedder::new(
        EmbeddingConfig::default(),
        2000,
        EmbeddingCache::open(&storage_dir.join("embedding_cache/cache.json")),
        Box::new(|| Box::new(HashingEncoder::new(TEST_DIM))),
    ));
    let vector_index = Arc::new(VectorIndex::open(storage_dir, TEST_DIM).unwrap());
    let registry = Arc::new(SessionRegistry::open(&storage_dir.join("session-registry.json")));
    let indexer = Arc::new(BackgroundIndexer::new(
        embedder,
        vector_index.clone(),
        registry.clone(),
        ChunkingConfig::default(),
        indexing,
    ));
    Stack {
        indexer,
        vector_index,
        registry,
    }
}

fn orchestrator_for(stack: &Stack, storage_dir: &Path) -> SearchOrchestrator {
    let embedder = Embedder::new(
        EmbeddingConfig::default(),
        2000,
        EmbeddingCache::open(&storage_dir.join("embedding_cache/cache.json")),
        Box::new(|| Box::new(HashingEncoder::new(TEST_DIM))),
    );
    let vector_index = VectorIndex::open(storage_dir, TEST_DIM).unwrap();
    SearchOrchestrator::new(
        embedder,
        vector_index,
        stack.registry.clone(),
        Scorer::default(),
        SearchConfig::default(),
    )
}

/// Scenario 1 (spec §8): ten sessions of varying ages, cold-start setup.
/// `registry.stats.total_sessions == 10`; `vector_index.stats.total_chunks
/// == Σ chunk_count`.
#[test]
fn scenario_cold_start_indexing_ten_sessions() {
    let session_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let stack = build_stack(storage_dir.path());

    let ages_days = [0, 1, 2, 3, 5, 10, 15, 20, 45, 90];
    for (i, age) in ages_days.iter().enumerate() {
        let path = write_session(
            session_dir.path(),
            &format!("session-{i}"),
            &[&format!("conversation turn at age {age}"), "a reply"],
        );
        let modified = Utc::now() - ChronoDuration::days(*age);
        let file_time: std::time::SystemTime = modified.into();
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(file_time).unwrap();
    }

    let setup = smart_fork::setup::SetupEngine::new(storage_dir.path().to_path_buf());
    let interrupt = smart_fork::setup::InterruptFlag::new();
    let outcome = setup
        .run(&stack.indexer, session_dir.path(), &interrupt, |_, _| {})
        .unwrap();
    assert_eq!(outcome.processed_files, 10);

    let registry_stats = stack.registry.stats();
    assert_eq!(registry_stats.total_sessions, 10);

    let index_stats = stack.vector_index.stats().unwrap();
    assert_eq!(index_stats.total_chunks, registry_stats.total_chunks);
}

/// Scenario 5 (spec §8): sessions tagged into two projects; a project
/// filter excludes the other project's sessions even when their raw
/// similarity would otherwise outrank the filtered set.
#[test]
fn scenario_project_filter_excludes_other_project() {
    let storage_dir = tempfile::tempdir().unwrap();
    let stack = build_stack(storage_dir.path());

    let p1_dir = tempfile::tempdir().unwrap();
    let p2_dir = tempfile::tempdir().unwrap();

    for i in 0..3 {
        let path = write_session(p1_dir.path(), &format!("p1-{i}"), &["database migration notes"]);
        let project = smart_fork::indexer::derive_project_tag(&path);
        stack.indexer.index_session(&path, project.as_deref()).unwrap();
    }
    for i in 0..3 {
        let path = write_session(p2_dir.path(), &format!("p2-{i}"), &["database migration notes"]);
        let project = smart_fork::indexer::derive_project_tag(&path);
        stack.indexer.index_session(&path, project.as_deref()).unwrap();
    }

    let orchestrator = orchestrator_for(&stack, storage_dir.path());
    let p1_project = smart_fork::indexer::derive_project_tag(&p1_dir.path().join("p1-0.jsonl")).unwrap();

    let results = orchestrator
        .search(
            "database migration",
            Some(10),
            QueryFilter {
                project: Some(p1_project.clone()),
            },
        )
        .unwrap();

    assert!(!results.is_empty());
    for result in &results {
        assert_eq!(result.metadata.as_ref().and_then(|m| m.project.clone()), Some(p1_project.clone()));
    }
}

/// Scenario 6 (spec §8), end-to-end through `search`: re-indexing a
/// session with no content change produces the same registry chunk
/// count and the same number of stored vectors (idempotence).
#[test]
fn reindexing_unchanged_session_is_idempotent() {
    let session_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let stack = build_stack(storage_dir.path());

    let path = write_session(
        session_dir.path(),
        "stable",
        &["hello there", "a longer reply describing a working solution"],
    );

    let first = stack.indexer.index_file(&path).unwrap();
    let second = stack.indexer.index_file(&path).unwrap();

    assert_eq!(first.chunks_added, second.chunks_added);
    let meta = stack.registry.get(&first.session_id).unwrap();
    assert_eq!(meta.chunk_count, first.chunks_added);

    let stored = stack.vector_index.get_session(&first.session_id).unwrap();
    assert_eq!(stored.len(), meta.chunk_count);
}

/// Quantified invariant 1 (spec §8): after a successful index, the
/// registry's chunk count matches the number of vectors actually stored
/// for that session.
#[test]
fn registry_chunk_count_matches_stored_vectors() {
    let session_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let stack = build_stack(storage_dir.path());

    let path = write_session(session_dir.path(), "s", &["one", "two", "three", "four"]);
    let outcome = stack.indexer.index_file(&path).unwrap();

    let meta = stack.registry.get(&outcome.session_id).unwrap();
    let stored = stack.vector_index.get_session(&outcome.session_id).unwrap();
    assert_eq!(meta.chunk_count, stored.len());
}

/// Boundary behaviour (spec §8): an empty session file yields zero
/// chunks, zero embeddings, and a registry entry with both counters at 0.
#[test]
fn empty_session_file_yields_zero_chunk_registry_entry() {
    let session_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let stack = build_stack(storage_dir.path());

    let path = session_dir.path().join("empty.jsonl");
    std::fs::write(&path, "").unwrap();

    let outcome = stack.indexer.index_file(&path).unwrap();
    assert_eq!(outcome.chunks_added, 0);
    assert_eq!(outcome.message_count, 0);

    let meta = stack.registry.get(&outcome.session_id).unwrap();
    assert_eq!(meta.chunk_count, 0);
    assert_eq!(meta.message_count, 0);

    let stored = stack.vector_index.get_session(&outcome.session_id).unwrap();
    assert!(stored.is_empty());
}

/// Boundary behaviour (spec §8): `top_n = 0` yields an empty slate, not
/// an error, even with matching sessions indexed.
#[test]
fn top_n_zero_yields_empty_slate_without_error() {
    let session_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let stack = build_stack(storage_dir.path());

    let path = write_session(session_dir.path(), "s", &["something searchable"]);
    stack.indexer.index_file(&path).unwrap();

    let orchestrator = orchestrator_for(&stack, storage_dir.path());
    let results = orchestrator
        .search("something", Some(0), QueryFilter::default())
        .unwrap();
    assert!(results.is_empty());
}

/// Boundary behaviour (spec §8): a query against an empty index returns
/// an empty slate rather than an error.
#[test]
fn query_with_no_indexed_sessions_yields_empty_slate() {
    let storage_dir = tempfile::tempdir().unwrap();
    let stack = build_stack(storage_dir.path());

    let orchestrator = orchestrator_for(&stack, storage_dir.path());
    let results = orchestrator
        .search("anything at all", None, QueryFilter::default())
        .unwrap();
    assert!(results.is_empty());
}

/// Scenario 4 (spec §8): three writes to the same file within one
/// debounce window coalesce into exactly one re-index.
#[test]
fn scenario_debounce_coalesces_rapid_writes_into_one_index() {
    let session_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();

    let indexing = IndexingConfig {
        debounce_seconds: 1.0,
        checkpoint_interval: 10_000,
        enabled: true,
        max_workers: 1,
    };
    let stack = build_stack_with(storage_dir.path(), indexing);

    stack.indexer.start(session_dir.path().to_path_buf()).unwrap();

    let path = session_dir.path().join("live.jsonl");
    for i in 0..3 {
        let mut existing = std::fs::read_to_string(&path).unwrap_or_default();
        existing.push_str(&format!("{{\"role\": \"user\", \"content\": \"turn {i}\"}}\n"));
        std::fs::write(&path, existing).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(500));
    }

    std::thread::sleep(std::time::Duration::from_secs(3));

    assert_eq!(stack.indexer.get_pending_count(), 0);
    let stats = stack.indexer.get_stats();
    assert_eq!(stats.files_indexed, 1);

    stack.indexer.stop();
}

/// `create_encoder` falls back to the offline hashing encoder whenever
/// the configured model isn't `"openai"` (spec §4.4).
#[test]
fn create_encoder_defaults_to_hashing_encoder() {
    let config = EmbeddingConfig::default();
    let encoder = create_encoder(&config, None).unwrap();
    assert_eq!(encoder.dimension(), config.dimension);
    let vectors = encoder.encode(&["hello", "world"]).unwrap();
    assert_eq!(vectors.len(), 2);
}

/// Registry round-trip (spec §8): `add; flush/persist; reopen; get`
/// returns the record verbatim.
#[test]
fn registry_round_trips_through_reopen() {
    let storage_dir = tempfile::tempdir().unwrap();
    let path = storage_dir.path().join("session-registry.json");

    let registry = SessionRegistry::open(&path);
    let now = Utc::now();
    registry
        .add(SessionMetadata {
            session_id: "abc".to_string(),
            project: Some("proj-a".to_string()),
            created_at: now,
            last_modified: now,
            last_indexed: Some(now),
            chunk_count: 3,
            message_count: 7,
            tags: vec!["x".to_string()],
        })
        .unwrap();

    let reopened = SessionRegistry::open(&path);
    let fetched = reopened.get("abc").unwrap();
    assert_eq!(fetched.session_id, "abc");
    assert_eq!(fetched.chunk_count, 3);
    assert_eq!(fetched.message_count, 7);
    assert_eq!(fetched.project.as_deref(), Some("proj-a"));
}
