//! SQLite-backed local cache transport.
//!
//! One content-addressed `objects` table in a WAL-mode database. Writes go
//! straight to the connection, so the durability barrier is trivially
//! satisfied; idempotency comes from `INSERT OR IGNORE` on the hash key.

use crate::object::ObjectId;
use crate::transport::{
    OnProgress, OnTotalChildren, Result, Transport, TransportError, copy_closure_from_store,
};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Default cache database location: `<cache dir>/tessera/objects.db`.
pub fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tessera")
        .join("objects.db")
}

pub struct SqliteTransport {
    name: String,
    path: PathBuf,
    conn: Mutex<Connection>,
    saved: AtomicU64,
    cancellation: Mutex<CancellationToken>,
    on_progress: Mutex<Option<OnProgress>>,
}

impl SqliteTransport {
    /// Open or create a cache database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TransportError::Database(format!("failed to open {:?}: {}", path, e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| TransportError::Database(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| TransportError::Database(e.to_string()))?;
        conn.pragma_update(None, "temp_store", "MEMORY")
            .map_err(|e| TransportError::Database(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS objects (
                hash TEXT PRIMARY KEY,
                content TEXT NOT NULL
            ) WITHOUT ROWID;",
        )
        .map_err(|e| TransportError::Database(e.to_string()))?;

        Ok(Self {
            name: "SQLite".to_string(),
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            saved: AtomicU64::new(0),
            cancellation: Mutex::new(CancellationToken::new()),
            on_progress: Mutex::new(None),
        })
    }

    /// Open the standard local cache.
    pub fn open_default() -> Result<Self> {
        Self::open(&default_cache_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| TransportError::Database("connection mutex poisoned".to_string()))?;
        f(&conn).map_err(|e| TransportError::Database(e.to_string()))
    }

    fn cancelled(&self) -> bool {
        self.cancellation
            .lock()
            .map(|token| token.is_cancelled())
            .unwrap_or(true)
    }

    fn report_progress(&self, count: u64) {
        if let Ok(guard) = self.on_progress.lock() {
            if let Some(callback) = guard.as_ref() {
                callback(&self.name, count);
            }
        }
    }
}

#[async_trait]
impl Transport for SqliteTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_object(&self, id: ObjectId, json: &str) -> Result<()> {
        if self.cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO objects (hash, content) VALUES (?1, ?2)",
                rusqlite::params![id.to_hex(), json],
            )
        })?;
        let count = self.saved.fetch_add(1, Ordering::Relaxed) + 1;
        self.report_progress(count);
        Ok(())
    }

    async fn get_object(&self, id: ObjectId) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT content FROM objects WHERE hash = ?1",
                rusqlite::params![id.to_hex()],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
    }

    async fn copy_object_and_children(
        &self,
        id: ObjectId,
        target: &dyn Transport,
        on_total_children: Option<OnTotalChildren>,
    ) -> Result<String> {
        let cancellation = self
            .cancellation
            .lock()
            .map(|token| token.clone())
            .unwrap_or_default();
        copy_closure_from_store(
            &self.name,
            |child| self.get_object(child),
            id,
            target,
            on_total_children,
            &cancellation,
        )
        .await
    }

    async fn write_complete(&self) -> Result<()> {
        // Every save committed synchronously; nothing left in flight.
        Ok(())
    }

    fn set_cancellation(&self, token: CancellationToken) {
        if let Ok(mut guard) = self.cancellation.lock() {
            *guard = token;
        }
    }

    fn set_progress(&self, on_progress: Option<OnProgress>) {
        if let Ok(mut guard) = self.on_progress.lock() {
            *guard = on_progress;
        }
    }
}
