//! Per-stream object stores.
//!
//! Each stream gets its own store, created lazily on first use: a SQLite
//! database under the data directory when one is configured, an in-memory
//! store otherwise (useful for tests and throwaway instances).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tessera_core::{MemoryTransport, SqliteTransport, Transport, TransportError};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Root directory for per-stream databases. `None` keeps everything in
    /// memory.
    pub data_dir: Option<PathBuf>,
    /// Static bearer token required on every request when set.
    pub auth_token: Option<String>,
    /// Verify each uploaded object's hash against its content before
    /// accepting it.
    pub verify_hashes: bool,
}

impl ServerConfig {
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            auth_token: None,
            verify_hashes: true,
        }
    }
}

/// Shared server state: configuration plus the lazily created stream stores.
pub struct ServerState {
    pub config: ServerConfig,
    streams: RwLock<HashMap<String, Arc<dyn Transport>>>,
    /// Object upload requests served, for diagnostics.
    pub post_requests: AtomicU64,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
            post_requests: AtomicU64::new(0),
        }
    }

    /// Fetch or create the store for a stream.
    pub async fn stream(&self, stream_id: &str) -> Result<Arc<dyn Transport>, TransportError> {
        {
            let streams = self.streams.read().await;
            if let Some(store) = streams.get(stream_id) {
                return Ok(store.clone());
            }
        }

        let mut streams = self.streams.write().await;
        // another request may have created it while we waited for the lock
        if let Some(store) = streams.get(stream_id) {
            return Ok(store.clone());
        }

        let store: Arc<dyn Transport> = match &self.config.data_dir {
            Some(data_dir) => {
                let path = data_dir.join("streams").join(format!("{}.db", stream_id));
                Arc::new(SqliteTransport::open(&path)?)
            }
            None => Arc::new(MemoryTransport::named(format!("Stream/{}", stream_id))),
        };
        streams.insert(stream_id.to_string(), store.clone());
        tracing::info!(stream = stream_id, "opened stream store");
        Ok(store)
    }
}
