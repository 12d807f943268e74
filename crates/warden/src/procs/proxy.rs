//! HTTP proxy to a worker's unix socket.
//!
//! Each request gets its own connection and a single HTTP/1.1 exchange; no
//! pooling, so a replaced worker is never reached through a stale
//! connection.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, Uri, Version, header};
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("connecting to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {} timed out after {timeout:?}", .path.display())]
    ConnectTimeout { path: PathBuf, timeout: Duration },

    #[error("HTTP handshake with worker failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("forwarding request to worker: {0}")]
    Request(#[source] hyper::Error),

    #[error("building worker request: {0}")]
    Build(#[from] axum::http::Error),
}

/// Forward `req` to the worker listening on `socket_path` and return its
/// response with the body streamed through.
///
/// Any error here happens before a status line was received. Failures while
/// streaming the body afterwards are only logged.
pub async fn forward(
    socket_path: &Path,
    req: Request<Body>,
    dial_timeout: Duration,
) -> Result<Response<Body>, ProxyError> {
    let stream = match timeout(dial_timeout, UnixStream::connect(socket_path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ProxyError::Connect {
                path: socket_path.to_path_buf(),
                source,
            });
        }
        Err(_) => {
            return Err(ProxyError::ConnectTimeout {
                path: socket_path.to_path_buf(),
                timeout: dial_timeout,
            });
        }
    };

    let (mut sender, conn) = http1::handshake::<_, Body>(TokioIo::new(stream))
        .await
        .map_err(ProxyError::Handshake)?;

    let socket = socket_path.display().to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Worker connection {} closed with error: {}", socket, e);
        }
    });

    let outbound = outbound_request(req)?;
    debug!("Proxying {} {} to worker", outbound.method(), outbound.uri());

    let response = sender
        .send_request(outbound)
        .await
        .map_err(ProxyError::Request)?;

    let (parts, body) = response.into_parts();
    let body = body.map_err(|e| {
        warn!("Worker response body failed mid-stream: {}", e);
        e
    });
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Rebuild the inbound request for the worker: same method, path, query,
/// headers and body, framed as HTTP/1.1 with an origin-form URI.
fn outbound_request(req: Request<Body>) -> Result<Request<Body>, ProxyError> {
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = path_and_query
        .parse()
        .map_err(|e: axum::http::uri::InvalidUri| ProxyError::Build(e.into()))?;

    let mut outbound = Request::builder()
        .method(parts.method)
        .uri(uri)
        .version(Version::HTTP_11)
        .body(body)?;
    *outbound.headers_mut() = parts.headers;

    if !outbound.headers().contains_key(header::HOST) {
        outbound
            .headers_mut()
            .insert(header::HOST, HeaderValue::from_static("localhost"));
    }

    Ok(outbound)
}
