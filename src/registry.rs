//! Session Registry (L6, spec §4.6): a durable keyed map
//! `session_id -> Session Metadata`, backed by one JSON sidecar file and
//! guarded by a single process-wide mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::SessionMetadata;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDocument {
    sessions: HashMap<String, SessionMetadata>,
    last_updated: chrono::DateTime<Utc>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub total_messages: usize,
    pub total_chunks: usize,
}

pub struct SessionRegistry {
    path: PathBuf,
    document: Mutex<RegistryDocument>,
}

impl SessionRegistry {
    /// Open (or create) the registry sidecar at `path`. A corrupt sidecar
    /// at open time yields an empty in-memory registry and a warning; the
    /// file is overwritten on the next write (spec §4.6, §7 "Corruption").
    pub fn open(path: &Path) -> Self {
        let document = if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<RegistryDocument>(&raw) {
                    Ok(doc) => doc,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "corrupt session registry, starting empty");
                        RegistryDocument::default()
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "could not read session registry, starting empty");
                    RegistryDocument::default()
                }
            }
        } else {
            RegistryDocument::default()
        };

        Self {
            path: path.to_path_buf(),
            document: Mutex::new(document),
        }
    }

    pub fn add(&self, meta: SessionMetadata) -> Result<()> {
        {
            let mut document = self.document.lock().expect("registry lock poisoned");
            document.sessions.insert(meta.session_id.clone(), meta);
            document.last_updated = Utc::now();
        }
        self.persist()
    }

    pub fn get(&self, id: &str) -> Option<SessionMetadata> {
        self.document
            .lock()
            .expect("registry lock poisoned")
            .sessions
            .get(id)
            .cloned()
    }

    /// Apply `mutator` to the entry for `id`, persisting if present.
    pub fn update<F>(&self, id: &str, mutator: F) -> Result<Option<SessionMetadata>>
    where
        F: FnOnce(&mut SessionMetadata),
    {
        let updated = {
            let mut document = self.document.lock().expect("registry lock poisoned");
            match document.sessions.get_mut(id) {
                Some(meta) => {
                    mutator(meta);
                    document.last_updated = Utc::now();
                    Some(meta.clone())
                }
                None => None,
            }
        };

        if updated.is_some() {
            self.persist()?;
        }
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut document = self.document.lock().expect("registry lock poisoned");
            let removed = document.sessions.remove(id).is_some();
            if removed {
                document.last_updated = Utc::now();
            }
            removed
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// List sessions, optionally filtered by project and/or the presence
    /// of every requested tag.
    pub fn list(&self, project: Option<&str>, tags: Option<&[String]>) -> Vec<SessionMetadata> {
        let document = self.document.lock().expect("registry lock poisoned");
        document
            .sessions
            .values()
            .filter(|meta| match project {
                Some(p) => meta.project.as_deref() == Some(p),
                None => true,
            })
            .filter(|meta| match tags {
                Some(requested) => requested.iter().all(|t| meta.tags.contains(t)),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn set_last_synced(&self, id: &str, when: Option<chrono::DateTime<Utc>>) -> Result<()> {
        self.update(id, |meta| meta.last_indexed = Some(when.unwrap_or_else(Utc::now)))?;
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        let document = self.document.lock().expect("registry lock poisoned");
        let total_sessions = document.sessions.len();
        let total_messages = document.sessions.values().map(|m| m.message_count).sum();
        let total_chunks = document.sessions.values().map(|m| m.chunk_count).sum();
        RegistryStats {
            total_sessions,
            total_messages,
            total_chunks,
        }
    }

    pub fn clear(&self) -> Result<()> {
        {
            let mut document = self.document.lock().expect("registry lock poisoned");
            document.sessions.clear();
            document.last_updated = Utc::now();
        }
        self.persist()
    }

    /// Persist atomically (write-temp-then-rename); every write completes
    /// this before returning (spec §4.6 "Concurrency").
    fn persist(&self) -> Result<()> {
        let document = self.document.lock().expect("registry lock poisoned");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(&*document)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
