//! HTTP handlers for the object store endpoints.
//!
//! Endpoints:
//!   POST /objects/{stream}             → multipart object upload
//!   GET  /objects/{stream}/{id}/single → one raw object document
//!   GET  /objects/{stream}/{id}        → object + full closure as
//!                                        newline-delimited `hash\tjson`
//!
//! Upload parts are JSON arrays of `[hash, json]` pairs, optionally
//! gzip-compressed. Every object's hash is verified against its content
//! before acceptance (unless disabled): a store must never claim a hash it
//! cannot serve the full, correct object for.

use crate::store::ServerState;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::Full;
use hyper::Response;
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tessera_core::object::KEY_CLOSURE;
use tessera_core::{Closure, ObjectId, verify_stored_document};

/// Route a request. `path` is the full request path; the caller passes the
/// `Content-Type` and `Authorization` header values when present.
pub async fn handle_request(
    method: &str,
    path: &str,
    content_type: Option<&str>,
    authorization: Option<&str>,
    body: &[u8],
    state: &Arc<ServerState>,
) -> Response<Full<Bytes>> {
    if let Some(expected) = &state.config.auth_token {
        let ok = authorization == Some(format!("Bearer {}", expected).as_str());
        if !ok {
            return json_error(401, "missing or invalid bearer token");
        }
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        ("POST", ["objects", stream_id]) => {
            handle_save(state, stream_id, content_type, body).await
        }
        ("GET", ["objects", stream_id, id, "single"]) => {
            handle_single(state, stream_id, id).await
        }
        ("GET", ["objects", stream_id, id]) => handle_stream(state, stream_id, id).await,
        _ => json_error(404, &format!("no route for {} {}", method, path)),
    }
}

// ─────────────────────────────────────────────────────
// POST /objects/{stream}
// ─────────────────────────────────────────────────────

async fn handle_save(
    state: &Arc<ServerState>,
    stream_id: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    state.post_requests.fetch_add(1, Ordering::Relaxed);

    if !valid_stream_id(stream_id) {
        return json_error(400, "invalid stream id");
    }
    let Some(boundary) = content_type.and_then(multipart_boundary) else {
        return json_error(400, "expected multipart/form-data with a boundary");
    };

    let parts = match parse_multipart(body, &boundary) {
        Ok(parts) => parts,
        Err(e) => return json_error(400, &format!("malformed multipart body: {}", e)),
    };
    if parts.is_empty() {
        return json_error(400, "empty upload");
    }

    let store = match state.stream(stream_id).await {
        Ok(store) => store,
        Err(e) => return json_error(500, &e.to_string()),
    };

    let mut saved = 0usize;
    for part in parts {
        let decoded = match decode_part(&part) {
            Ok(decoded) => decoded,
            Err(e) => return json_error(400, &format!("undecodable part: {}", e)),
        };
        let pairs: Vec<(String, String)> = match serde_json::from_slice(&decoded) {
            Ok(pairs) => pairs,
            Err(e) => return json_error(400, &format!("part is not a pair array: {}", e)),
        };

        for (hex, object_json) in pairs {
            let id = match ObjectId::from_hex(&hex) {
                Ok(id) => id,
                Err(e) => return json_error(400, &format!("bad object id {}: {}", hex, e)),
            };
            if state.config.verify_hashes {
                match verify_stored_document(&object_json) {
                    Ok(computed) if computed == id => {}
                    Ok(computed) => {
                        return json_error(
                            400,
                            &format!("hash mismatch: declared {}, computed {}", hex, computed),
                        );
                    }
                    Err(e) => {
                        return json_error(400, &format!("unverifiable object {}: {}", hex, e));
                    }
                }
            }
            if let Err(e) = store.save_object(id, &object_json).await {
                return json_error(500, &e.to_string());
            }
            saved += 1;
        }
    }

    tracing::debug!(stream = stream_id, objects = saved, "stored batch");
    json_ok(&json!({ "savedCount": saved }))
}

// ─────────────────────────────────────────────────────
// GET /objects/{stream}/{id}/single
// ─────────────────────────────────────────────────────

async fn handle_single(
    state: &Arc<ServerState>,
    stream_id: &str,
    id: &str,
) -> Response<Full<Bytes>> {
    let Ok(id) = ObjectId::from_hex(id) else {
        return json_error(400, "bad object id");
    };
    let store = match state.stream(stream_id).await {
        Ok(store) => store,
        Err(e) => return json_error(500, &e.to_string()),
    };
    match store.get_object(id).await {
        Ok(Some(object_json)) => text_response(200, "application/json", object_json),
        Ok(None) => json_error(404, &format!("object {} not found", id)),
        Err(e) => json_error(500, &e.to_string()),
    }
}

// ─────────────────────────────────────────────────────
// GET /objects/{stream}/{id}
// ─────────────────────────────────────────────────────

async fn handle_stream(
    state: &Arc<ServerState>,
    stream_id: &str,
    id: &str,
) -> Response<Full<Bytes>> {
    let Ok(root) = ObjectId::from_hex(id) else {
        return json_error(400, "bad object id");
    };
    let store = match state.stream(stream_id).await {
        Ok(store) => store,
        Err(e) => return json_error(500, &e.to_string()),
    };

    let root_json = match store.get_object(root).await {
        Ok(Some(object_json)) => object_json,
        Ok(None) => return json_error(404, &format!("object {} not found", root)),
        Err(e) => return json_error(500, &e.to_string()),
    };

    let closure = match closure_of(&root_json) {
        Ok(closure) => closure,
        Err(e) => return json_error(500, &format!("stored root {} unreadable: {}", root, e)),
    };

    let mut lines = String::with_capacity(root_json.len() + 64);
    lines.push_str(&root.to_hex());
    lines.push('\t');
    lines.push_str(&root_json);
    lines.push('\n');

    for (child, _depth) in closure.iter() {
        match store.get_object(*child).await {
            Ok(Some(object_json)) => {
                lines.push_str(&child.to_hex());
                lines.push('\t');
                lines.push_str(&object_json);
                lines.push('\n');
            }
            Ok(None) => {
                return json_error(
                    500,
                    &format!("closure member {} missing from stream {}", child, stream_id),
                );
            }
            Err(e) => return json_error(500, &e.to_string()),
        }
    }

    text_response(200, "text/plain", lines)
}

// ─────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────

fn closure_of(root_json: &str) -> Result<Closure, String> {
    let document: serde_json::Value =
        serde_json::from_str(root_json).map_err(|e| e.to_string())?;
    match document.get(KEY_CLOSURE) {
        Some(value) => Closure::from_json(value).map_err(|e| e.to_string()),
        None => Ok(Closure::new()),
    }
}

fn valid_stream_id(stream_id: &str) -> bool {
    !stream_id.is_empty()
        && stream_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extract the boundary parameter from a `multipart/form-data` content type.
fn multipart_boundary(content_type: &str) -> Option<String> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))?;
    Some(boundary.trim_matches('"').to_string())
}

/// Split a multipart body into its part bodies. Headers of each part are
/// skipped; the payload format is carried by the bytes themselves.
fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<Vec<u8>>, String> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();
    let mut pos = find_subsequence(body, &delimiter)
        .ok_or_else(|| "boundary not found".to_string())?
        + delimiter.len();

    loop {
        if body[pos..].starts_with(b"--") {
            break; // closing delimiter
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let header_end = find_subsequence(&body[pos..], b"\r\n\r\n")
            .ok_or_else(|| "part without header terminator".to_string())?;
        let content_start = pos + header_end + 4;

        let next = find_subsequence(&body[content_start..], &delimiter)
            .ok_or_else(|| "unterminated part".to_string())?;
        let mut part = &body[content_start..content_start + next];
        if part.ends_with(b"\r\n") {
            part = &part[..part.len() - 2];
        }
        parts.push(part.to_vec());

        pos = content_start + next + delimiter.len();
    }

    Ok(parts)
}

/// Gunzip a part body when it carries the gzip magic, pass it through
/// otherwise.
fn decode_part(part: &[u8]) -> Result<Vec<u8>, String> {
    if part.len() >= 2 && part[0] == 0x1f && part[1] == 0x8b {
        let mut decoder = GzDecoder::new(part);
        let mut decoded = Vec::new();
        decoder
            .read_to_end(&mut decoded)
            .map_err(|e| e.to_string())?;
        Ok(decoded)
    } else {
        Ok(part.to_vec())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn json_ok(value: &serde_json::Value) -> Response<Full<Bytes>> {
    text_response(200, "application/json", value.to_string())
}

pub(crate) fn json_error(status: u16, message: &str) -> Response<Full<Bytes>> {
    text_response(
        status,
        "application/json",
        json!({ "error": message }).to_string(),
    )
}

fn text_response(status: u16, content_type: &str, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_boundary_extraction() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"quoted\"; charset=utf-8"),
            Some("quoted".to_string())
        );
        assert_eq!(multipart_boundary("application/json"), None);
    }

    #[test]
    fn test_parse_multipart_two_parts() {
        let body = b"--b1\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nfirst\r\n--b1\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\nsecond\r\n--b1--\r\n";
        let parts = parse_multipart(body, "b1").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], b"first");
        assert_eq!(parts[1], b"second");
    }

    #[test]
    fn test_parse_multipart_rejects_garbage() {
        assert!(parse_multipart(b"no delimiters here", "b1").is_err());
    }

    #[test]
    fn test_decode_part_passthrough_and_gzip() {
        assert_eq!(decode_part(b"plain").unwrap(), b"plain");

        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let gz = encoder.finish().unwrap();
        assert_eq!(decode_part(&gz).unwrap(), b"compressed payload");
    }

    #[test]
    fn test_valid_stream_id() {
        assert!(valid_stream_id("job-42_a"));
        assert!(!valid_stream_id(""));
        assert!(!valid_stream_id("../escape"));
        assert!(!valid_stream_id("a/b"));
    }
}
