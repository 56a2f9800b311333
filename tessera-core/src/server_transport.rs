//! HTTP server transport.
//!
//! A transport backed by a remote object store, optimized for the
//! many-small-object write pattern of decomposed graphs: saves enqueue on an
//! in-process channel and a background flush task owned by this instance
//! coalesces them into multipart `POST /objects/{stream}` requests, bounded
//! by a per-part byte cap and a per-request part count, with optional gzip
//! per part. A transport-level failure drops the entire pending queue: a
//! partial batch retry could leave the store claiming hashes it cannot
//! serve in full.
//!
//! Receive side: `GET /objects/{stream}/{id}/single` for one object,
//! `GET /objects/{stream}/{id}` for a newline-delimited `hash\tjson` stream
//! of an object and its full closure, pushed into the target transport line
//! by line as it arrives.

use crate::object::{Closure, KEY_CLOSURE, ObjectId};
use crate::transport::{
    OnError, OnProgress, OnTotalChildren, Result, Transport, TransportError,
};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::StreamExt;
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Tuning knobs for the background flush task. All of them are constructor
/// parameters; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct ServerTransportOptions {
    /// How often the flush task drains the queue.
    pub flush_interval: Duration,
    /// Byte cap per multipart part.
    pub max_part_bytes: usize,
    /// Part cap per HTTP request.
    pub max_parts_per_request: usize,
    /// Gzip part bodies before transmission.
    pub compress: bool,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    /// Poll interval of the `write_complete` barrier.
    pub poll_interval: Duration,
}

impl Default for ServerTransportOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            max_part_bytes: 1_000_000,
            max_parts_per_request: 8,
            compress: true,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// One queued write.
#[derive(Debug, Clone)]
struct QueuedObject {
    id: ObjectId,
    json: String,
}

/// State shared between the caller-facing transport and its flush task.
struct SharedState {
    name: String,
    pending: AtomicUsize,
    in_flight: AtomicBool,
    last_error: Mutex<Option<String>>,
    cancellation: Mutex<CancellationToken>,
    on_progress: Mutex<Option<OnProgress>>,
    on_error: Mutex<Option<OnError>>,
    sent: AtomicU64,
    fetched: AtomicU64,
}

impl SharedState {
    fn cancellation(&self) -> CancellationToken {
        self.cancellation
            .lock()
            .map(|token| token.clone())
            .unwrap_or_default()
    }

    fn record_error(&self, message: String) {
        tracing::warn!(transport = %self.name, error = %message, "dropping pending queue");
        if let Ok(mut guard) = self.last_error.lock() {
            guard.get_or_insert(message.clone());
        }
        if let Ok(guard) = self.on_error.lock() {
            if let Some(callback) = guard.as_ref() {
                callback(&self.name, &message);
            }
        }
    }

    fn error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    fn report_progress(&self, count: u64) {
        if let Ok(guard) = self.on_progress.lock() {
            if let Some(callback) = guard.as_ref() {
                callback(&self.name, count);
            }
        }
    }
}

pub struct ServerTransport {
    base_url: String,
    stream_id: String,
    token: Option<String>,
    client: reqwest::Client,
    options: ServerTransportOptions,
    queue: mpsc::UnboundedSender<QueuedObject>,
    state: Arc<SharedState>,
    shutdown: CancellationToken,
}

impl ServerTransport {
    /// Create a transport for one stream on one server and start its flush
    /// task. Must be called from within a tokio runtime.
    pub fn new(server_url: &str, stream_id: &str, token: Option<String>) -> Result<Self> {
        Self::with_options(server_url, stream_id, token, ServerTransportOptions::default())
    }

    pub fn with_options(
        server_url: &str,
        stream_id: &str,
        token: Option<String>,
        options: ServerTransportOptions,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {}", e)))?;

        let state = Arc::new(SharedState {
            name: format!("Server/{}", stream_id),
            pending: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
            last_error: Mutex::new(None),
            cancellation: Mutex::new(CancellationToken::new()),
            on_progress: Mutex::new(None),
            on_error: Mutex::new(None),
            sent: AtomicU64::new(0),
            fetched: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(run_flush_loop(
            rx,
            state.clone(),
            client.clone(),
            post_url(server_url, stream_id),
            token.clone(),
            options.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            stream_id: stream_id.to_string(),
            token,
            client,
            options,
            queue: tx,
            state,
            shutdown,
        })
    }

    /// Install a callback invoked when an asynchronous flush fails.
    pub fn set_on_error(&self, on_error: Option<OnError>) {
        if let Ok(mut guard) = self.state.on_error.lock() {
            *guard = on_error;
        }
    }

    fn single_url(&self, id: ObjectId) -> String {
        format!(
            "{}/objects/{}/{}/single",
            self.base_url,
            self.stream_id,
            id.to_hex()
        )
    }

    fn stream_url(&self, id: ObjectId) -> String {
        format!("{}/objects/{}/{}", self.base_url, self.stream_id, id.to_hex())
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for ServerTransport {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn save_object(&self, id: ObjectId, json: &str) -> Result<()> {
        if self.state.cancellation().is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if let Some(message) = self.state.error() {
            return Err(TransportError::Backend(message));
        }
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if self
            .queue
            .send(QueuedObject {
                id,
                json: json.to_string(),
            })
            .is_err()
        {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Backend("flush task stopped".to_string()));
        }
        Ok(())
    }

    async fn get_object(&self, id: ObjectId) -> Result<Option<String>> {
        let response = self
            .authorized(self.client.get(self.single_url(id)))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(TransportError::Http {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let count = self.state.fetched.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.report_progress(count);
        Ok(Some(body))
    }

    async fn copy_object_and_children(
        &self,
        id: ObjectId,
        target: &dyn Transport,
        on_total_children: Option<OnTotalChildren>,
    ) -> Result<String> {
        let cancellation = self.state.cancellation();
        let response = self
            .authorized(self.client.get(self.stream_url(id)))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Http {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut root_json: Option<String> = None;
        let mut received = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Network(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            while let Some(line) = take_line(&mut buffer) {
                if cancellation.is_cancelled() {
                    return Err(TransportError::Cancelled);
                }
                if line.is_empty() {
                    continue;
                }
                let (line_id, json) = parse_stream_line(&line)?;
                if root_json.is_none() {
                    if line_id != id {
                        return Err(TransportError::MalformedStream(format!(
                            "stream started with {} instead of requested {}",
                            line_id, id
                        )));
                    }
                    if let Some(callback) = &on_total_children {
                        callback(expected_total(&json)?);
                    }
                    root_json = Some(json.clone());
                }
                target.save_object(line_id, &json).await?;
                received += 1;
                self.state.report_progress(received);
            }
        }

        if !buffer.is_empty() {
            let line = std::mem::take(&mut buffer);
            let (line_id, json) = parse_stream_line(&line)?;
            if root_json.is_none() {
                if let Some(callback) = &on_total_children {
                    callback(expected_total(&json)?);
                }
                root_json = Some(json.clone());
            }
            target.save_object(line_id, &json).await?;
        }

        root_json.ok_or_else(|| {
            TransportError::MalformedStream(format!("empty response for {}", id))
        })
    }

    async fn write_complete(&self) -> Result<()> {
        loop {
            if let Some(message) = self.state.error() {
                return Err(TransportError::Backend(message));
            }
            if self.state.cancellation().is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if self.state.pending.load(Ordering::SeqCst) == 0
                && !self.state.in_flight.load(Ordering::SeqCst)
            {
                return Ok(());
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    fn set_cancellation(&self, token: CancellationToken) {
        if let Ok(mut guard) = self.state.cancellation.lock() {
            *guard = token;
        }
    }

    fn set_progress(&self, on_progress: Option<OnProgress>) {
        if let Ok(mut guard) = self.state.on_progress.lock() {
            *guard = on_progress;
        }
    }
}

fn post_url(server_url: &str, stream_id: &str) -> String {
    format!("{}/objects/{}", server_url.trim_end_matches('/'), stream_id)
}

/// Pull one `\n`-terminated line off the front of the buffer.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    Some(line)
}

/// Parse one `hash\tjson` line.
fn parse_stream_line(line: &[u8]) -> Result<(ObjectId, String)> {
    let text = std::str::from_utf8(line)
        .map_err(|e| TransportError::MalformedStream(format!("non-UTF-8 line: {}", e)))?;
    let (hex, json) = text
        .split_once('\t')
        .ok_or_else(|| TransportError::MalformedStream("line without tab separator".to_string()))?;
    let id = ObjectId::from_hex(hex)
        .map_err(|e| TransportError::MalformedStream(format!("bad hash {}: {}", hex, e)))?;
    Ok((id, json.to_string()))
}

/// Expected object count of a bulk fetch: the root's closure size plus the
/// root itself. A root that does not parse as a JSON object is a hard
/// error; a root without a closure is a single-object graph.
fn expected_total(root_json: &str) -> Result<u64> {
    let document: serde_json::Value = serde_json::from_str(root_json)
        .map_err(|e| TransportError::MalformedStream(format!("unparseable root: {}", e)))?;
    if !document.is_object() {
        return Err(TransportError::MalformedStream(
            "root line is not a JSON object".to_string(),
        ));
    }
    let closure_len = match document.get(KEY_CLOSURE) {
        Some(value) => Closure::from_json(value)
            .map_err(|e| TransportError::MalformedStream(format!("bad closure: {}", e)))?
            .len(),
        None => 0,
    };
    Ok(closure_len as u64 + 1)
}

/// Split a drained queue into parts, each under the byte cap. An object
/// larger than the cap gets a part of its own, it cannot be split.
fn pack_parts(objects: Vec<QueuedObject>, max_part_bytes: usize) -> Vec<Vec<QueuedObject>> {
    // per-pair overhead: hex hash + JSON punctuation
    const PAIR_OVERHEAD: usize = 64 + 8;

    let mut parts = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    for object in objects {
        let size = object.json.len() + PAIR_OVERHEAD;
        if !current.is_empty() && current_bytes + size > max_part_bytes {
            parts.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(object);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Encode one part body: a JSON array of `[hash, json]` pairs, optionally
/// gzipped.
fn encode_part(objects: &[QueuedObject], compress: bool) -> Result<Vec<u8>> {
    let pairs: Vec<(String, &str)> = objects
        .iter()
        .map(|o| (o.id.to_hex(), o.json.as_str()))
        .collect();
    let json =
        serde_json::to_vec(&pairs).map_err(|e| TransportError::Backend(e.to_string()))?;
    if !compress {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// POST one drained batch, split into capped parts and capped requests.
async fn post_batch(
    client: &reqwest::Client,
    url: &str,
    token: &Option<String>,
    options: &ServerTransportOptions,
    cancellation: &CancellationToken,
    batch: Vec<QueuedObject>,
) -> Result<()> {
    let parts = pack_parts(batch, options.max_part_bytes);

    for request_parts in parts.chunks(options.max_parts_per_request) {
        if cancellation.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let mut form = reqwest::multipart::Form::new();
        for (index, part) in request_parts.iter().enumerate() {
            let body = encode_part(part, options.compress)?;
            let mime = if options.compress {
                "application/gzip"
            } else {
                "application/json"
            };
            let part = reqwest::multipart::Part::bytes(body)
                .file_name(format!("batch-{}", index))
                .mime_str(mime)
                .map_err(|e| TransportError::Backend(e.to_string()))?;
            form = form.part(format!("batch-{}", index), part);
        }

        let mut request = client.post(url).multipart(form);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Http {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
    }
    Ok(())
}

/// The background flush loop. Single consumer of the write queue; exits when
/// the owning transport is dropped.
async fn run_flush_loop(
    mut rx: mpsc::UnboundedReceiver<QueuedObject>,
    state: Arc<SharedState>,
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    options: ServerTransportOptions,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(options.flush_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buffer: Vec<QueuedObject> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                discard_queue(&state, &mut buffer, &mut rx);
                return;
            }
            received = rx.recv() => {
                match received {
                    Some(object) => buffer.push(object),
                    None => return,
                }
            }
            _ = interval.tick() => {
                while let Ok(object) = rx.try_recv() {
                    buffer.push(object);
                }

                let cancellation = state.cancellation();
                if cancellation.is_cancelled() {
                    discard_queue(&state, &mut buffer, &mut rx);
                    continue;
                }
                if buffer.is_empty() {
                    continue;
                }

                let batch = std::mem::take(&mut buffer);
                let batch_len = batch.len();
                state.in_flight.store(true, Ordering::SeqCst);
                let result =
                    post_batch(&client, &url, &token, &options, &cancellation, batch).await;
                match result {
                    Ok(()) => {
                        state.pending.fetch_sub(batch_len, Ordering::SeqCst);
                        let sent = state.sent.fetch_add(batch_len as u64, Ordering::Relaxed)
                            + batch_len as u64;
                        state.report_progress(sent);
                        tracing::debug!(
                            transport = %state.name,
                            objects = batch_len,
                            "flushed batch"
                        );
                    }
                    Err(e) => {
                        state.record_error(e.to_string());
                        discard_queue(&state, &mut buffer, &mut rx);
                    }
                }
                state.in_flight.store(false, Ordering::SeqCst);
            }
        }
    }
}

/// Drop everything not yet durably sent.
fn discard_queue(
    state: &SharedState,
    buffer: &mut Vec<QueuedObject>,
    rx: &mut mpsc::UnboundedReceiver<QueuedObject>,
) {
    buffer.clear();
    while rx.try_recv().is_ok() {}
    state.pending.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn queued(id_seed: &[u8], json: &str) -> QueuedObject {
        QueuedObject {
            id: ObjectId::from_data(id_seed),
            json: json.to_string(),
        }
    }

    #[test]
    fn test_pack_parts_respects_byte_cap() {
        let objects: Vec<QueuedObject> = (0..10)
            .map(|i| queued(&[i], &"x".repeat(100)))
            .collect();

        // each object weighs ~172 bytes; a 400-byte cap fits two per part
        let parts = pack_parts(objects, 400);
        assert!(parts.len() >= 2);
        for part in &parts {
            let size: usize = part.iter().map(|o| o.json.len() + 72).sum();
            assert!(size <= 400);
        }
        let total: usize = parts.iter().map(Vec::len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_pack_parts_oversized_object_gets_own_part() {
        let objects = vec![
            queued(b"a", "small"),
            queued(b"b", &"y".repeat(2000)),
            queued(b"c", "small"),
        ];
        let parts = pack_parts(objects, 500);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 1);
    }

    #[test]
    fn test_encode_part_gzip_roundtrip() {
        let objects = vec![queued(b"a", "{\"x\":1}"), queued(b"b", "{\"y\":2}")];
        let encoded = encode_part(&objects, true).unwrap();

        let mut decoder = GzDecoder::new(&encoded[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();

        let pairs: Vec<(String, String)> = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, objects[0].id.to_hex());
        assert_eq!(pairs[0].1, "{\"x\":1}");
    }

    #[test]
    fn test_parse_stream_line() {
        let id = ObjectId::from_data(b"obj");
        let line = format!("{}\t{{\"a\":1}}", id.to_hex());
        let (parsed_id, json) = parse_stream_line(line.as_bytes()).unwrap();
        assert_eq!(parsed_id, id);
        assert_eq!(json, "{\"a\":1}");

        assert!(parse_stream_line(b"no-tab-here").is_err());
        assert!(parse_stream_line(b"nothex\t{}").is_err());
    }

    #[test]
    fn test_expected_total_from_closure() {
        let child = ObjectId::from_data(b"child");
        let root = format!(
            "{{\"speckle_type\":\"Model\",\"__closure\":{{\"{}\":1}}}}",
            child.to_hex()
        );
        assert_eq!(expected_total(&root).unwrap(), 2);
        assert_eq!(expected_total("{\"speckle_type\":\"Point\"}").unwrap(), 1);
        assert!(expected_total("not json").is_err());
        assert!(expected_total("[1,2]").is_err());
    }

    #[test]
    fn test_take_line_framing() {
        let mut buffer = b"one\ntwo\nthr".to_vec();
        assert_eq!(take_line(&mut buffer), Some(b"one".to_vec()));
        assert_eq!(take_line(&mut buffer), Some(b"two".to_vec()));
        assert_eq!(take_line(&mut buffer), None);
        assert_eq!(buffer, b"thr");
    }
}
