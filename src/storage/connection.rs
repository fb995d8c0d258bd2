//! SQLite connection management with WAL-mode pragmas (spec §4.5
//! "Persistence": reopening the same directory must reproduce the prior
//! state byte-equivalently).

use std::path::Path;
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use rusqlite::{ffi::sqlite3_auto_extension, Connection, OpenFlags};

use crate::error::Result;

static REGISTER_VEC_EXTENSION: Once = Once::new();

/// Register the `sqlite-vec` loadable extension as an auto-extension so
/// every connection opened afterwards gets `vec0` virtual tables. Safe to
/// call repeatedly; only the first call takes effect.
fn ensure_vec_extension_registered() {
    REGISTER_VEC_EXTENSION.call_once(|| unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// A thread-safe SQLite connection handle, owned exclusively by whichever
/// component opens it (spec §3 "Ownership summary").
pub struct Storage {
    path: String,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) a database file at `path` under the vector index's
    /// owned directory, applying the teacher's WAL-mode pragma set.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        ensure_vec_extension_registered();
        let conn = Connection::open_with_flags(path, flags)?;
        Self::configure_pragmas(&conn)?;

        Ok(Self {
            path: path.to_string_lossy().to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        ensure_vec_extension_registered();
        let conn = Connection::open_in_memory()?;
        Self::configure_pragmas(&conn)?;
        Ok(Self {
            path: ":memory:".to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-64000;
            PRAGMA temp_store=MEMORY;
            PRAGMA mmap_size=268435456;
            PRAGMA foreign_keys=ON;
            "#,
        )?;
        Ok(())
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            conn: self.conn.clone(),
        }
    }
}
