//! Send and receive, the two public verbs.
//!
//! Send serializes a graph and fans every produced document out to every
//! registered transport, returning the root hash only once every transport's
//! durability barrier has resolved. Receive is local-first: the local cache
//! is consulted before the remote store, and a remote fetch copies the whole
//! closure into the local cache before deserializing from it, so repeated
//! receives of overlapping graphs stay cheap.

use crate::base::Base;
use crate::deserializer::{Deserializer, DeserializeError};
use crate::object::ObjectId;
use crate::registry::TypeRegistry;
use crate::serializer::{SerializeError, Serialized, Serializer};
use crate::sqlite_transport::SqliteTransport;
use crate::transport::{OnProgress, OnTotalChildren, Transport, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("nothing to write to: the default cache is disabled and no transport was supplied")]
    NoWriteTargets,

    #[error("object {0} not found locally and no remote transport to fall back to")]
    NotFound(ObjectId),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Serialize(SerializeError),

    #[error(transparent)]
    Deserialize(DeserializeError),

    #[error("operation cancelled")]
    Cancelled,
}

// Cancellation is a first-class outcome: collapse every nested cancelled
// variant into OperationError::Cancelled so callers can distinguish "I
// cancelled" from "it broke" with one match arm.

impl From<TransportError> for OperationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => OperationError::Cancelled,
            other => OperationError::Transport(other),
        }
    }
}

impl From<SerializeError> for OperationError {
    fn from(e: SerializeError) -> Self {
        match e {
            SerializeError::Cancelled => OperationError::Cancelled,
            other => OperationError::Serialize(other),
        }
    }
}

impl From<DeserializeError> for OperationError {
    fn from(e: DeserializeError) -> Self {
        match e {
            DeserializeError::Cancelled
            | DeserializeError::Transport(TransportError::Cancelled) => {
                OperationError::Cancelled
            }
            other => OperationError::Deserialize(other),
        }
    }
}

pub struct SendOptions {
    /// Prepend the standard SQLite cache to the write targets.
    pub use_default_cache: bool,
    pub cancellation: CancellationToken,
    pub on_progress: Option<OnProgress>,
    /// Typed detachment rules, on top of the `@` key convention.
    pub registry: Option<Arc<TypeRegistry>>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            use_default_cache: true,
            cancellation: CancellationToken::new(),
            on_progress: None,
            registry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub root_id: ObjectId,
    pub object_count: usize,
}

#[derive(Default)]
pub struct ReceiveOptions {
    pub cancellation: CancellationToken,
    pub on_progress: Option<OnProgress>,
    /// Reported once, as soon as the expected total object count is known.
    pub on_total_children: Option<OnTotalChildren>,
}

/// Serialize without writing anywhere.
pub fn serialize(root: &Base) -> Result<Serialized, OperationError> {
    Ok(Serializer::new().serialize(root)?)
}

/// Rebuild a graph from an inline document. Reference tokens cannot be
/// resolved here; use [`receive`] for decomposed graphs.
pub async fn deserialize(json: &str) -> Result<Base, OperationError> {
    Ok(Deserializer::new().deserialize(json).await?)
}

/// Serialize `root` and store it on every transport, returning the root
/// hash once all of them have acknowledged durability.
pub async fn send(
    root: &Base,
    transports: Vec<Arc<dyn Transport>>,
    options: SendOptions,
) -> Result<SendResult, OperationError> {
    let mut targets = transports;
    if options.use_default_cache {
        targets.insert(0, Arc::new(SqliteTransport::open_default()?));
    }
    if targets.is_empty() {
        return Err(OperationError::NoWriteTargets);
    }

    for target in &targets {
        target.set_cancellation(options.cancellation.clone());
        target.set_progress(options.on_progress.clone());
    }

    let registry = options.registry.clone();
    let mut serializer = Serializer::new().with_cancellation(options.cancellation.clone());
    if let Some(registry) = registry.as_deref() {
        serializer = serializer.with_registry(registry);
    }
    let serialized = serializer.serialize(root)?;

    for (id, json) in &serialized.objects {
        if options.cancellation.is_cancelled() {
            return Err(OperationError::Cancelled);
        }
        for target in &targets {
            target.save_object(*id, json).await?;
        }
    }

    for target in &targets {
        target.write_complete().await?;
    }
    if options.cancellation.is_cancelled() {
        return Err(OperationError::Cancelled);
    }

    tracing::info!(
        root = %serialized.root_id,
        objects = serialized.objects.len(),
        transports = targets.len(),
        "send complete"
    );
    Ok(SendResult {
        root_id: serialized.root_id,
        object_count: serialized.objects.len(),
    })
}

/// Fetch a graph by root hash: local cache first, remote fallback copying
/// the full closure into the local cache before deserializing.
pub async fn receive(
    id: ObjectId,
    remote: Option<Arc<dyn Transport>>,
    local: Option<Arc<dyn Transport>>,
    options: ReceiveOptions,
) -> Result<Base, OperationError> {
    let local: Arc<dyn Transport> = match local {
        Some(local) => local,
        None => Arc::new(SqliteTransport::open_default()?),
    };

    local.set_cancellation(options.cancellation.clone());
    local.set_progress(options.on_progress.clone());
    if let Some(remote) = &remote {
        remote.set_cancellation(options.cancellation.clone());
        remote.set_progress(options.on_progress.clone());
    }

    if let Some(json) = local.get_object(id).await? {
        tracing::debug!(root = %id, "local cache hit, no remote round-trip");
        let mut deserializer = Deserializer::new()
            .with_transport(&*local)
            .with_cancellation(options.cancellation.clone());
        return Ok(deserializer.deserialize(&json).await?);
    }

    let remote = remote.ok_or(OperationError::NotFound(id))?;
    let root_json = remote
        .copy_object_and_children(id, &*local, options.on_total_children.clone())
        .await?;
    local.write_complete().await?;

    let mut deserializer = Deserializer::new()
        .with_transport(&*local)
        .with_cancellation(options.cancellation.clone());
    let base = deserializer.deserialize(&root_json).await?;
    tracing::info!(root = %id, source = remote.name(), "receive complete");
    Ok(base)
}
