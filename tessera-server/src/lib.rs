//! Tessera object store server.
//!
//! A self-hostable content-addressed object store speaking the transport
//! wire protocol: multipart batch upload, single-object fetch, and the
//! object-plus-closure stream. Library surface so the accept loop can be
//! driven both by the `tesserad` binary and by in-process integration tests.

pub mod handlers;
pub mod store;

pub use store::{ServerConfig, ServerState};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::error;

/// Accept connections forever, dispatching each request to the handlers.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| dispatch(req, state.clone())))
                .await
            {
                error!("Error serving connection: {:?}", e);
            }
        });
    }
}

async fn dispatch(
    request: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let content_type = header_value(&request, "content-type");
    let authorization = header_value(&request, "authorization");

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(handlers::json_error(
                400,
                &format!("failed to read request body: {}", e),
            ));
        }
    };

    Ok(handlers::handle_request(
        &method,
        &path,
        content_type.as_deref(),
        authorization.as_deref(),
        &body,
        &state,
    )
    .await)
}

fn header_value(request: &Request<Incoming>, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
