//! Setup Engine (L10, spec §4.10): the one-shot initial scan used on
//! first run or when the index is empty, with resumable state so an
//! interrupted run picks up where it left off.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::indexer::{list_eligible_files, BackgroundIndexer};
use crate::types::SetupState;

const SETUP_STATE_FILE: &str = "setup_state.json";

#[derive(Debug, Clone, Default)]
pub struct SetupOutcome {
    pub total_files: usize,
    pub processed_files: usize,
    pub interrupted: bool,
}

/// Cooperative interrupt flag: `stop()` sets it, the current file still
/// completes before the loop exits (spec §4.10 "On a user interrupt").
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SetupEngine {
    storage_dir: PathBuf,
}

impl SetupEngine {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self { storage_dir }
    }

    fn sidecar_path(&self) -> PathBuf {
        self.storage_dir.join(SETUP_STATE_FILE)
    }

    fn load_state(&self) -> Option<SetupState> {
        let path = self.sidecar_path();
        if !path.exists() {
            return None;
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn save_state(&self, state: &SetupState) -> Result<()> {
        std::fs::create_dir_all(&self.storage_dir)?;
        let serialized = serde_json::to_string_pretty(state)?;
        let tmp = self.sidecar_path().with_extension("json.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, self.sidecar_path())?;
        Ok(())
    }

    fn delete_state(&self) -> Result<()> {
        let path = self.sidecar_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Run (or resume) the initial scan over `session_root` (spec §4.10
    /// "Protocol", "Idempotence").
    ///
    /// `progress` is invoked after each file with `(processed, total)`.
    /// `interrupt` is polled between files; when set, the current file
    /// still completes, the sidecar is left in place, and the call
    /// returns with `interrupted: true`.
    pub fn run(
        &self,
        indexer: &BackgroundIndexer,
        session_root: &Path,
        interrupt: &InterruptFlag,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<SetupOutcome> {
        let files = list_eligible_files(session_root);

        let mut state = self.load_state().unwrap_or_else(|| SetupState {
            total_files: files.len(),
            processed: Vec::new(),
            started_at: Utc::now(),
            last_update: Utc::now(),
        });

        // Resume: an unchanged on-disk set of files keeps the recorded
        // total; a changed set (new sessions appeared) re-baselines it.
        if state.total_files < files.len() {
            state.total_files = files.len();
        }

        self.save_state(&state)?;

        let already_processed: std::collections::HashSet<String> =
            state.processed.iter().cloned().collect();

        let mut interrupted = false;

        for file in &files {
            let key = file.to_string_lossy().to_string();
            if already_processed.contains(&key) {
                continue;
            }

            indexer.index_file(file)?;

            state.processed.push(key);
            state.last_update = Utc::now();
            self.save_state(&state)?;

            progress(state.processed.len(), state.total_files);

            if interrupt.is_set() {
                interrupted = true;
                break;
            }
        }

        if !interrupted {
            self.delete_state()?;
        }

        Ok(SetupOutcome {
            total_files: state.total_files,
            processed_files: state.processed.len(),
            interrupted,
        })
    }

    /// Whether a prior run was interrupted and left resumable state
    /// (spec §3 "Setup State": "its presence at startup signals resume").
    pub fn has_pending_resume(&self) -> bool {
        self.sidecar_path().exists()
    }
}
