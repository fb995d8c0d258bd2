//! Vector Index (L5, spec §4.5): a persistent k-nearest-neighbour store
//! over `(embedding, text, metadata)` triples, backed by SQLite + the
//! `sqlite-vec` virtual table for the ANN sweep and a companion metadata
//! table for everything the store needs to filter and materialise on read.

use std::path::Path;

use rusqlite::params;
use uuid::Uuid;

use crate::error::{Result, SmartForkError};
use crate::storage::connection::Storage;
use crate::types::{ChunkHit, MetadataFilter, SalienceMarker, StoredChunkRecord};

#[derive(Debug, Clone, Default)]
pub struct VectorIndexStats {
    pub total_chunks: usize,
    pub total_sessions: usize,
}

pub struct VectorIndex {
    storage: Storage,
    dimension: usize,
}

/// Pack a unit-normalised f32 vector into the little-endian byte layout
/// `sqlite-vec`'s `vec0` virtual table expects.
fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn encode_memory_types(types: &[SalienceMarker]) -> String {
    serde_json::to_string(types).unwrap_or_else(|_| "[]".to_string())
}

fn decode_memory_types(raw: &str) -> Vec<SalienceMarker> {
    serde_json::from_str(raw).unwrap_or_default()
}

impl VectorIndex {
    /// Open (or create) the index under `storage_dir`'s exclusively-owned
    /// `vector_db/` directory (spec §6.2).
    pub fn open(storage_dir: &Path, dimension: usize) -> Result<Self> {
        let db_path = storage_dir.join("vector_db").join("index.sqlite");
        let storage = Storage::open(&db_path)?;
        let index = Self { storage, dimension };
        index.ensure_schema()?;
        Ok(index)
    }

    #[cfg(test)]
    pub fn open_in_memory(dimension: usize) -> Result<Self> {
        let storage = Storage::open_in_memory()?;
        let index = Self { storage, dimension };
        index.ensure_schema()?;
        Ok(index)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS chunk_meta (
                    rowid INTEGER PRIMARY KEY,
                    id TEXT UNIQUE NOT NULL,
                    session_id TEXT NOT NULL,
                    chunk_index INTEGER NOT NULL,
                    text TEXT NOT NULL,
                    memory_types TEXT NOT NULL,
                    project TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_chunk_meta_session ON chunk_meta(session_id);",
            )?;
            conn.execute(
                &format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS chunk_vectors USING vec0(embedding float[{}] distance_metric=cosine)",
                    self.dimension
                ),
                [],
            )?;
            Ok(())
        })
    }

    /// Insert a batch of chunks, returning the assigned ids (spec §4.5 `add`).
    pub fn add(
        &self,
        texts: Vec<String>,
        vectors: Vec<Vec<f32>>,
        session_id: &str,
        chunk_indices: Vec<usize>,
        memory_types: Vec<Vec<SalienceMarker>>,
        project: Option<&str>,
        ids: Option<Vec<String>>,
    ) -> Result<Vec<String>> {
        if texts.len() != vectors.len() || texts.len() != chunk_indices.len() {
            return Err(SmartForkError::InvalidInput(
                "add() requires texts, vectors, and chunk_indices of equal length".to_string(),
            ));
        }

        let ids = ids.unwrap_or_else(|| (0..texts.len()).map(|_| Uuid::new_v4().to_string()).collect());

        self.storage.with_transaction(|tx| {
            for i in 0..texts.len() {
                tx.execute(
                    "INSERT INTO chunk_meta (id, session_id, chunk_index, text, memory_types, project)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        ids[i],
                        session_id,
                        chunk_indices[i] as i64,
                        texts[i],
                        encode_memory_types(&memory_types[i]),
                        project,
                    ],
                )?;
                let rowid = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO chunk_vectors(rowid, embedding) VALUES (?1, ?2)",
                    params![rowid, vector_to_blob(&vectors[i])],
                )?;
            }
            Ok(())
        })?;

        Ok(ids)
    }

    /// k-NN sweep over cosine similarity, optionally filtered by metadata
    /// equality (spec §4.5 `search`). `chunk_vectors` is declared with
    /// `distance_metric=cosine`, so the `distance` column is cosine
    /// distance (`1 - cosine_similarity`) rather than `sqlite-vec`'s
    /// default L2; `similarity = 1.0 - distance` below is exactly cosine
    /// similarity. Because `sqlite-vec`'s MATCH does not itself understand
    /// our metadata filter, candidates are oversampled and filtered
    /// in-process; results are re-truncated to `k` after filtering.
    pub fn search(&self, query: &[f32], k: usize, filter: &MetadataFilter) -> Result<Vec<ChunkHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let oversample = if filter.is_empty() { k } else { (k * 5).max(k) };

        let rows: Vec<(i64, f32)> = self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid, distance FROM chunk_vectors
                 WHERE embedding MATCH ?1 AND k = ?2
                 ORDER BY distance",
            )?;
            let rows = stmt
                .query_map(params![vector_to_blob(query), oversample as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, f32>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut hits = Vec::with_capacity(rows.len());
        self.storage.with_connection(|conn| {
            for (rowid, distance) in &rows {
                let maybe_row = conn
                    .query_row(
                        "SELECT id, session_id, chunk_index, text, memory_types, project
                         FROM chunk_meta WHERE rowid = ?1",
                        params![rowid],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, Option<String>>(5)?,
                            ))
                        },
                    )
                    .ok();

                if let Some((id, session_id, chunk_index, text, memory_types_raw, project_field)) = maybe_row {
                    if !filter.matches(&session_id, project_field.as_deref()) {
                        continue;
                    }
                    hits.push(ChunkHit {
                        id,
                        session_id,
                        chunk_index: chunk_index as usize,
                        text,
                        memory_types: decode_memory_types(&memory_types_raw),
                        project: project_field,
                        similarity: 1.0 - distance,
                    });
                }
            }
            Ok(())
        })?;

        hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Delete every record for `session_id`, returning the count removed
    /// (spec §4.5 `delete_session`). Mandatory for idempotent re-indexing.
    pub fn delete_session(&self, session_id: &str) -> Result<usize> {
        self.storage.with_transaction(|tx| {
            let rowids: Vec<i64> = {
                let mut stmt = tx.prepare("SELECT rowid FROM chunk_meta WHERE session_id = ?1")?;
                stmt.query_map(params![session_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            for rowid in &rowids {
                tx.execute("DELETE FROM chunk_vectors WHERE rowid = ?1", params![rowid])?;
            }
            let removed = tx.execute("DELETE FROM chunk_meta WHERE session_id = ?1", params![session_id])?;
            Ok(removed)
        })
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<StoredChunkRecord>> {
        self.storage.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT m.session_id, m.chunk_index, m.text, m.memory_types, m.project, v.embedding
                     FROM chunk_meta m JOIN chunk_vectors v ON m.rowid = v.rowid
                     WHERE m.id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Vec<u8>>(5)?,
                        ))
                    },
                )
                .ok();

            Ok(row.map(|(session_id, chunk_index, text, memory_types_raw, project, embedding_blob)| {
                StoredChunkRecord {
                    id: id.to_string(),
                    session_id,
                    chunk_index: chunk_index as usize,
                    text,
                    embedding: blob_to_vector(&embedding_blob),
                    memory_types: decode_memory_types(&memory_types_raw),
                    project,
                }
            }))
        })
    }

    /// All chunks for a session, ordered by `chunk_index` (spec §4.5 `get_session`).
    pub fn get_session(&self, session_id: &str) -> Result<Vec<StoredChunkRecord>> {
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.chunk_index, m.text, m.memory_types, m.project, v.embedding
                 FROM chunk_meta m JOIN chunk_vectors v ON m.rowid = v.rowid
                 WHERE m.session_id = ?1
                 ORDER BY m.chunk_index ASC",
            )?;
            let records = stmt
                .query_map(params![session_id], |row| {
                    Ok(StoredChunkRecord {
                        id: row.get::<_, String>(0)?,
                        session_id: session_id.to_string(),
                        chunk_index: row.get::<_, i64>(1)? as usize,
                        text: row.get::<_, String>(2)?,
                        memory_types: decode_memory_types(&row.get::<_, String>(3)?),
                        project: row.get::<_, Option<String>>(4)?,
                        embedding: blob_to_vector(&row.get::<_, Vec<u8>>(5)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    pub fn stats(&self) -> Result<VectorIndexStats> {
        self.storage.with_connection(|conn| {
            let total_chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunk_meta", [], |row| row.get(0))?;
            let total_sessions: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT session_id) FROM chunk_meta",
                [],
                |row| row.get(0),
            )?;
            Ok(VectorIndexStats {
                total_chunks: total_chunks as usize,
                total_sessions: total_sessions as usize,
            })
        })
    }

    pub fn reset(&self) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.execute_batch("DELETE FROM chunk_meta; DELETE FROM chunk_vectors;")?;
            Ok(())
        })
    }
}
