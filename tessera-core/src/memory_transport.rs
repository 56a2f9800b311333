//! In-memory transport.
//!
//! Immediate durability, no batching. The reference store for tests and the
//! default backend of the standalone server when no data directory is
//! configured.

use crate::object::ObjectId;
use crate::transport::{
    OnProgress, OnTotalChildren, Result, Transport, TransportError, copy_closure_from_store,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub struct MemoryTransport {
    name: String,
    objects: RwLock<HashMap<ObjectId, String>>,
    saved: AtomicU64,
    cancellation: Mutex<CancellationToken>,
    on_progress: Mutex<Option<OnProgress>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::named("Memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
            saved: AtomicU64::new(0),
            cancellation: Mutex::new(CancellationToken::new()),
            on_progress: Mutex::new(None),
        }
    }

    /// Number of distinct objects held.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
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

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_object(&self, id: ObjectId, json: &str) -> Result<()> {
        if self.cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.objects
            .write()
            .await
            .entry(id)
            .or_insert_with(|| json.to_string());
        let count = self.saved.fetch_add(1, Ordering::Relaxed) + 1;
        self.report_progress(count);
        Ok(())
    }

    async fn get_object(&self, id: ObjectId) -> Result<Option<String>> {
        Ok(self.objects.read().await.get(&id).cloned())
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
        // Writes are immediately durable.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_get() {
        let transport = MemoryTransport::new();
        let id = ObjectId::from_data(b"x");
        transport.save_object(id, "{\"a\":1}").await.unwrap();

        assert_eq!(
            transport.get_object(id).await.unwrap(),
            Some("{\"a\":1}".to_string())
        );
        assert_eq!(
            transport.get_object(ObjectId::from_data(b"y")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let transport = MemoryTransport::new();
        let id = ObjectId::from_data(b"x");
        transport.save_object(id, "{\"a\":1}").await.unwrap();
        transport.save_object(id, "{\"a\":1}").await.unwrap();
        assert_eq!(transport.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_save_is_rejected() {
        let transport = MemoryTransport::new();
        let token = CancellationToken::new();
        transport.set_cancellation(token.clone());
        token.cancel();

        let id = ObjectId::from_data(b"x");
        let result = transport.save_object(id, "{}").await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert!(transport.is_empty().await);
    }

    #[tokio::test]
    async fn test_progress_reports_cumulative_count() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicU64;

        let transport = MemoryTransport::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        transport.set_progress(Some(Arc::new(move |_, count| {
            seen_clone.store(count, Ordering::SeqCst);
        })));

        transport
            .save_object(ObjectId::from_data(b"a"), "{}")
            .await
            .unwrap();
        transport
            .save_object(ObjectId::from_data(b"b"), "{}")
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_save_object_from_missing_source() {
        let a = MemoryTransport::new();
        let b = MemoryTransport::new();
        let id = ObjectId::from_data(b"x");
        let result = b.save_object_from(id, &a).await;
        assert!(matches!(result, Err(TransportError::NotFound(_))));
    }
}
