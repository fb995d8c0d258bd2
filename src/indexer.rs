//! Background Indexer (L8, spec §4.8): a file-system watcher plus a
//! debounced worker pool that keeps the Vector Index and Session Registry
//! in sync with the on-disk session tree.
//!
//! Three concurrency roles, each its own thread (spec §9 "Implicit async
//! in source"): one watcher thread, one debounce-monitor thread, and
//! `max_workers` worker threads pulled from a shared work queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::chunker::chunk_messages;
use crate::config::{ChunkingConfig, IndexingConfig};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::parser::{self, ParseMode};
use crate::registry::SessionRegistry;
use crate::storage::VectorIndex;
use crate::types::{IndexingTask, SessionMetadata};

/// Suffix filter for eligible session files (spec §4.10 "suffix filter").
pub const SESSION_FILE_SUFFIX: &str = ".jsonl";

const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct IndexerStats {
    pub files_indexed: u64,
    pub chunks_added: u64,
    pub errors: u64,
    pub last_index_time: Option<chrono::DateTime<Utc>>,
}

/// One file's in-flight indexing state plus the bookkeeping the debounce
/// monitor needs that isn't part of the spec's literal data model.
struct PendingEntry {
    task: IndexingTask,
    /// Already handed to a worker; not re-dispatched until that attempt
    /// finishes (success or failure).
    dispatched: bool,
    project: Option<String>,
}

/// Enumerate every eligible file under `root`, without touching any
/// indexer's pending-tasks map (spec §4.10 "Enumerate every eligible
/// file under the session root").
pub fn list_eligible_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    walk_dir(root).into_iter().filter(|p| is_eligible_file(p)).collect()
}

fn is_eligible_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()) == SESSION_FILE_SUFFIX)
        .unwrap_or(false)
}

/// Canonicalise a session file's parent directory into a project tag:
/// absolute path with the path separator replaced by `-` (spec §3
/// "Session Metadata").
pub fn derive_project_tag(session_path: &Path) -> Option<String> {
    let dir = session_path.parent()?;
    let absolute = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let text = absolute.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "-");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Count non-blank lines as a cheap proxy for message count without a
/// full parse, used by the debounce monitor to detect growth.
fn count_non_blank_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

struct Handles {
    watcher: RecommendedWatcher,
    monitor: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Keeps the Vector Index and Session Registry current with the on-disk
/// session tree (spec §4.8).
pub struct BackgroundIndexer {
    embedder: Arc<Embedder>,
    vector_index: Arc<VectorIndex>,
    registry: Arc<SessionRegistry>,
    chunking: ChunkingConfig,
    indexing: IndexingConfig,
    pending: Arc<Mutex<HashMap<PathBuf, PendingEntry>>>,
    session_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    stats: Arc<Mutex<IndexerStats>>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handles: Mutex<Option<Handles>>,
}

impl BackgroundIndexer {
    pub fn new(
        embedder: Arc<Embedder>,
        vector_index: Arc<VectorIndex>,
        registry: Arc<SessionRegistry>,
        chunking: ChunkingConfig,
        indexing: IndexingConfig,
    ) -> Self {
        Self {
            embedder,
            vector_index,
            registry,
            chunking,
            indexing,
            pending: Arc::new(Mutex::new(HashMap::new())),
            session_locks: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(IndexerStats::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    pub fn get_stats(&self) -> IndexerStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Enumerate every eligible file under `root` for initial population
    /// of the pending map (spec §4.8 `scan_directory`, §4.10 "Protocol").
    pub fn scan_directory(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if !root.exists() {
            return Ok(found);
        }
        for entry in walk_dir(root) {
            if is_eligible_file(&entry) {
                self.register_task(&entry);
                found.push(entry);
            }
        }
        Ok(found)
    }

    fn register_task(&self, path: &Path) {
        let message_count = count_non_blank_lines(path);
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::now());
        let project = derive_project_tag(path);

        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending
            .entry(path.to_path_buf())
            .and_modify(|entry| {
                entry.task.message_count = message_count;
                entry.task.last_modified = modified;
                entry.task.last_event = Instant::now();
            })
            .or_insert_with(|| PendingEntry {
                task: IndexingTask {
                    path: path.to_path_buf(),
                    last_modified: modified,
                    message_count,
                    last_indexed_count: 0,
                    last_event: Instant::now(),
                    error_count: 0,
                },
                dispatched: false,
                project,
            });
    }

    /// Start the watcher, debounce monitor, and worker pool. A second
    /// call while already running is a no-op (spec §9 "Global state").
    pub fn start(self: &Arc<Self>, root: PathBuf) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);

        self.scan_directory(&root)?;

        let (event_tx, event_rx) = mpsc::channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    if is_eligible_file(&path) {
                        let _ = event_tx.send(path);
                    }
                }
            }
        })
        .map_err(|e| crate::error::SmartForkError::Internal(format!("watcher init failed: {e}")))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| crate::error::SmartForkError::Internal(format!("watch failed: {e}")))?;

        // Drain filesystem events into the pending map (part of the
        // watcher role; runs on the monitor thread's own channel reader).
        let watch_listener_indexer = self.clone();
        std::thread::spawn(move || {
            while let Ok(path) = event_rx.recv() {
                watch_listener_indexer.register_task(&path);
            }
        });

        let (work_tx, work_rx) = mpsc::channel::<PathBuf>();
        let work_rx = Arc::new(Mutex::new(work_rx));

        let monitor = {
            let indexer = self.clone();
            let work_tx = work_tx.clone();
            std::thread::spawn(move || indexer.debounce_monitor_loop(work_tx))
        };

        let mut workers = Vec::with_capacity(self.indexing.max_workers.max(1));
        for _ in 0..self.indexing.max_workers.max(1) {
            let indexer = self.clone();
            let work_rx = work_rx.clone();
            workers.push(std::thread::spawn(move || indexer.worker_loop(work_rx)));
        }

        *self.handles.lock().expect("handles lock poisoned") = Some(Handles {
            watcher,
            monitor,
            workers,
        });

        Ok(())
    }

    fn debounce_monitor_loop(&self, work_tx: mpsc::Sender<PathBuf>) {
        let debounce = Duration::from_secs_f64(self.indexing.debounce_seconds.max(0.0));
        while !self.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(MONITOR_POLL_INTERVAL);

            let mut to_dispatch = Vec::new();
            {
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                for (path, entry) in pending.iter_mut() {
                    if entry.dispatched {
                        continue;
                    }

                    // Re-observe growth even with no filesystem event
                    // (checkpoint reindex, spec §4.8).
                    let current_count = count_non_blank_lines(path);
                    if current_count != entry.task.message_count {
                        entry.task.message_count = current_count;
                        entry.task.last_event = Instant::now();
                    }

                    let debounce_elapsed = entry.task.last_event.elapsed() >= debounce;
                    let needs_indexing = entry.task.needs_indexing();
                    let checkpoint_due = entry
                        .task
                        .message_count
                        .saturating_sub(entry.task.last_indexed_count)
                        >= self.indexing.checkpoint_interval;

                    if (debounce_elapsed && needs_indexing) || checkpoint_due {
                        entry.dispatched = true;
                        to_dispatch.push(path.clone());
                    }
                }
            }

            for path in to_dispatch {
                if work_tx.send(path).is_err() {
                    return;
                }
            }
        }
    }

    fn worker_loop(&self, work_rx: Arc<Mutex<mpsc::Receiver<PathBuf>>>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let path = {
                let rx = work_rx.lock().expect("work queue lock poisoned");
                match rx.recv_timeout(MONITOR_POLL_INTERVAL) {
                    Ok(path) => path,
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => return,
                }
            };

            let project = self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .get(&path)
                .and_then(|e| e.project.clone());

            match self.index_session(&path, project.as_deref()) {
                Ok(outcome) => {
                    let mut pending = self.pending.lock().expect("pending lock poisoned");
                    if let Some(entry) = pending.get_mut(&path) {
                        entry.task.last_indexed_count = outcome.message_count;
                        entry.dispatched = false;
                    }
                    let mut stats = self.stats.lock().expect("stats lock poisoned");
                    stats.files_indexed += 1;
                    stats.chunks_added += outcome.chunks_added as u64;
                    stats.last_index_time = Some(Utc::now());
                }
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "indexing task failed");
                    let mut pending = self.pending.lock().expect("pending lock poisoned");
                    if let Some(entry) = pending.get_mut(&path) {
                        entry.dispatched = false;
                        entry.task.error_count += 1;
                    }
                    let mut stats = self.stats.lock().expect("stats lock poisoned");
                    stats.errors += 1;
                }
            }
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().expect("session locks poisoned");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Synchronously re-index one session file: parse, chunk, embed,
    /// delete-then-insert under the per-session mutex, then update the
    /// registry (spec §4.8 "Workers", the six numbered steps).
    pub fn index_session(&self, path: &Path, project: Option<&str>) -> Result<IndexOutcome> {
        let parsed = parser::parse(path, ParseMode::Lenient)?;
        let chunks = chunk_messages(&parsed.messages, &self.chunking);

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;

        let session_id = parsed.session_id.clone();
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().expect("session mutex poisoned");

        self.vector_index.delete_session(&session_id)?;

        if !chunks.is_empty() {
            let chunk_indices: Vec<usize> = (0..chunks.len()).collect();
            let memory_types: Vec<_> = chunks.iter().map(|c| c.markers.clone()).collect();
            self.vector_index.add(
                texts,
                embeddings,
                &session_id,
                chunk_indices,
                memory_types,
                project,
                None,
            )?;
        }

        let now = Utc::now();
        let last_modified: chrono::DateTime<Utc> = parsed
            .file_metadata
            .modified
            .into();

        if self.registry.get(&session_id).is_none() {
            self.registry.add(SessionMetadata {
                session_id: session_id.clone(),
                project: project.map(str::to_string),
                created_at: last_modified,
                last_modified,
                last_indexed: Some(now),
                chunk_count: chunks.len(),
                message_count: parsed.messages.len(),
                tags: Vec::new(),
            })?;
        } else {
            self.registry.update(&session_id, |meta| {
                meta.last_modified = last_modified;
                meta.last_indexed = Some(now);
                meta.chunk_count = chunks.len();
                meta.message_count = parsed.messages.len();
                if meta.project.is_none() {
                    meta.project = project.map(str::to_string);
                }
            })?;
        }

        Ok(IndexOutcome {
            session_id,
            chunks_added: chunks.len(),
            message_count: parsed.messages.len(),
        })
    }

    /// Public synchronous entry point used by the CLI and the Setup Engine
    /// (spec §4.8 `index_file`).
    pub fn index_file(&self, path: &Path) -> Result<IndexOutcome> {
        let project = derive_project_tag(path);
        self.index_session(path, project.as_deref())
    }

    /// Stop the watcher, monitor, and workers; flush the embedding cache
    /// (spec §4.8 "Workers" stop semantics, §5 "Cancellation").
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handles) = self.handles.lock().expect("handles lock poisoned").take() {
            drop(handles.watcher);
            let _ = handles.monitor.join();
            for worker in handles.workers {
                let _ = worker.join();
            }
        }

        let _ = self.embedder.cache().flush();
    }
}

#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub session_id: String,
    pub chunks_added: usize,
    pub message_count: usize,
}

fn walk_dir(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, EmbeddingConfig, IndexingConfig};
    use crate::embedding::{EmbeddingCache, Embedder, HashingEncoder};

    fn write_session(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(format!("{name}.jsonl"));
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn make_indexer(storage_dir: &Path) -> Arc<BackgroundIndexer> {
        let embedder = Arc::new(Embedder::new(
            EmbeddingConfig::default(),
            2000,
            EmbeddingCache::open(&storage_dir.join("embedding_cache/cache.json")),
            Box::new(|| Box::new(HashingEncoder::new(32))),
        ));
        let vector_index = Arc::new(VectorIndex::open(storage_dir, 32).unwrap());
        let registry = Arc::new(SessionRegistry::open(&storage_dir.join("session-registry.json")));
        Arc::new(BackgroundIndexer::new(
            embedder,
            vector_index,
            registry,
            ChunkingConfig::default(),
            IndexingConfig::default(),
        ))
    }

    #[test]
    fn test_index_file_populates_registry_and_vector_index() {
        let session_dir = tempfile::tempdir().unwrap();
        let storage_dir = tempfile::tempdir().unwrap();
        let path = write_session(
            session_dir.path(),
            "sess-1",
            &[
                r#"{"role": "user", "content": "how do I parse jsonl"}"#,
                r#"{"role": "assistant", "content": "use serde_json line by line"}"#,
            ],
        );

        let indexer = make_indexer(storage_dir.path());
        let outcome = indexer.index_file(&path).unwrap();

        assert_eq!(outcome.session_id, "sess-1");
        assert_eq!(outcome.chunks_added, indexer.vector_index.get_session("sess-1").unwrap().len());

        let meta = indexer.registry.get("sess-1").unwrap();
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.chunk_count, outcome.chunks_added);
    }

    #[test]
    fn test_reindexing_same_file_is_idempotent_on_chunk_count() {
        let session_dir = tempfile::tempdir().unwrap();
        let storage_dir = tempfile::tempdir().unwrap();
        let path = write_session(
            session_dir.path(),
            "sess-2",
            &[r#"{"role": "user", "content": "hello there"}"#],
        );

        let indexer = make_indexer(storage_dir.path());
        indexer.index_file(&path).unwrap();
        let first_count = indexer.vector_index.get_session("sess-2").unwrap().len();
        indexer.index_file(&path).unwrap();
        let second_count = indexer.vector_index.get_session("sess-2").unwrap().len();

        assert_eq!(first_count, second_count);
    }

    #[test]
    fn test_empty_session_file_yields_zero_chunks() {
        let session_dir = tempfile::tempdir().unwrap();
        let storage_dir = tempfile::tempdir().unwrap();
        let path = write_session(session_dir.path(), "sess-empty", &[]);

        let indexer = make_indexer(storage_dir.path());
        let outcome = indexer.index_file(&path).unwrap();

        assert_eq!(outcome.chunks_added, 0);
        assert_eq!(indexer.registry.get("sess-empty").unwrap().chunk_count, 0);
    }

    #[test]
    fn test_scan_directory_only_picks_up_eligible_suffix() {
        let session_dir = tempfile::tempdir().unwrap();
        write_session(session_dir.path(), "sess-a", &[r#"{"role":"user","content":"x"}"#]);
        std::fs::write(session_dir.path().join("notes.txt"), "not a session").unwrap();

        let storage_dir = tempfile::tempdir().unwrap();
        let indexer = make_indexer(storage_dir.path());
        let found = indexer.scan_directory(session_dir.path()).unwrap();

        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("sess-a.jsonl"));
    }

    #[test]
    fn test_derive_project_tag_replaces_separators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sess.jsonl");
        std::fs::write(&path, "").unwrap();
        let tag = derive_project_tag(&path).unwrap();
        assert!(!tag.contains(std::path::MAIN_SEPARATOR));
    }
}
