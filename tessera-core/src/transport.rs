//! Transport abstraction.
//!
//! A uniform async write/read surface so the send/receive operations do not
//! care whether they are talking to an in-memory store, the local SQLite
//! cache, or a remote server. Objects are immutable once stored: saving an
//! id a transport already holds is a no-op, and `write_complete` is the
//! durability barrier for everything queued before it.

use crate::object::ObjectId;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("malformed object stream: {0}")]
    MalformedStream(String),

    #[error("transport backend error: {0}")]
    Backend(String),

    #[error("transport operation cancelled")]
    Cancelled,
}

/// Named-counter progress callback: `(counter, cumulative count)`.
/// Transports report under their own name.
pub type OnProgress = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Invoked once per bulk fetch, as soon as the expected total object count
/// (root plus closure) is known, before the rest of the stream has been
/// read.
pub type OnTotalChildren = Arc<dyn Fn(u64) + Send + Sync>;

/// Invoked when an asynchronous flush fails: `(transport name, message)`.
pub type OnError = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Uniform store contract implemented by every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name used in progress counters and error reports.
    fn name(&self) -> &str;

    /// Queue or persist an object under its hash. Idempotent per id.
    async fn save_object(&self, id: ObjectId, json: &str) -> Result<()>;

    /// Copy variant: pull the payload from another transport first.
    async fn save_object_from(&self, id: ObjectId, source: &dyn Transport) -> Result<()> {
        let json = source
            .get_object(id)
            .await?
            .ok_or(TransportError::NotFound(id))?;
        self.save_object(id, &json).await
    }

    /// Fetch one object. `Ok(None)` means this transport does not hold the
    /// id; callers fall back to another transport, it is not a fault.
    async fn get_object(&self, id: ObjectId) -> Result<Option<String>>;

    /// Bulk fetch: copy the object and its full closure into `target`,
    /// reporting the expected total count as soon as it is known. Returns
    /// the root's JSON document.
    async fn copy_object_and_children(
        &self,
        id: ObjectId,
        target: &dyn Transport,
        on_total_children: Option<OnTotalChildren>,
    ) -> Result<String>;

    /// Durability barrier: resolves only once every write queued before the
    /// call is acknowledged, and surfaces any asynchronous flush failure.
    async fn write_complete(&self) -> Result<()>;

    /// Install the cooperative cancellation token. Once signalled, pending
    /// queued work is discarded at the next batching boundary.
    fn set_cancellation(&self, token: CancellationToken);

    /// Install the progress callback.
    fn set_progress(&self, on_progress: Option<OnProgress>);
}

/// Walk a stored root document's closure and copy root plus descendants
/// into `target`. Shared by the store-backed transports, which hold the
/// whole closure locally.
pub(crate) async fn copy_closure_from_store<S, F>(
    source_name: &str,
    fetch: F,
    root: ObjectId,
    target: &dyn Transport,
    on_total_children: Option<OnTotalChildren>,
    cancellation: &CancellationToken,
) -> Result<String>
where
    F: Fn(ObjectId) -> S,
    S: std::future::Future<Output = Result<Option<String>>>,
{
    use crate::object::{Closure, KEY_CLOSURE};

    let root_json = fetch(root).await?.ok_or(TransportError::NotFound(root))?;

    let document: serde_json::Value = serde_json::from_str(&root_json)
        .map_err(|e| TransportError::MalformedStream(format!("root {}: {}", root, e)))?;
    let closure = match document.get(KEY_CLOSURE) {
        Some(value) => Closure::from_json(value)
            .map_err(|e| TransportError::MalformedStream(format!("closure of {}: {}", root, e)))?,
        None => Closure::new(),
    };

    if let Some(callback) = &on_total_children {
        callback(closure.len() as u64 + 1);
    }

    target.save_object(root, &root_json).await?;
    for (child, _depth) in closure.iter() {
        if cancellation.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let json = fetch(*child).await?.ok_or_else(|| {
            tracing::warn!(%child, source = source_name, "closure member missing from store");
            TransportError::NotFound(*child)
        })?;
        target.save_object(*child, &json).await?;
    }

    Ok(root_json)
}
