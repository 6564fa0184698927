//! Stage backend clients.
//!
//! Every stage talks to its external inference service through the narrow
//! [`Backend`] interface: one call, bounded timeouts, a byte stream back.
//! The chain does not care how a backend authenticates or what wire format
//! it speaks.

pub mod http;
pub mod mock;

use crate::error::{Result, VoxpipeError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

pub use http::HttpBackend;
pub use mock::MockBackend;

/// Raw response bytes from a backend, produced incrementally.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A stream of newline-delimited frames decoded from a [`ByteStream`].
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Client for one stage's external inference service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Sends one request payload and returns the response as a byte
    /// stream. Connect and read timeouts are bounded by construction.
    async fn send(&self, user: &str, body: serde_json::Value) -> Result<ByteStream>;

    /// Lightweight liveness probe, used by the heartbeat route.
    async fn alive(&self) -> bool;
}

/// Sends a request with bounded retries on transient failures.
///
/// Non-transient errors (4xx, malformed input) fail immediately. Only the
/// initial request is retried; a stream that breaks mid-read is not.
pub async fn send_with_retry(
    backend: &dyn Backend,
    user: &str,
    body: serde_json::Value,
    retries: u32,
    delay: Duration,
) -> Result<ByteStream> {
    let mut attempt = 0;
    loop {
        match backend.send(user, body.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                log::warn!(
                    "backend request for {} failed ({}), retry {}/{}",
                    user,
                    e,
                    attempt,
                    retries
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Splits a backend byte stream into newline-delimited frames.
///
/// Backends stream one JSON object per line; this re-frames arbitrary
/// byte chunks into complete lines for the stages to parse.
pub fn lines(stream: ByteStream) -> LineStream {
    let io_stream = stream.map_err(std::io::Error::other);
    let reader = StreamReader::new(io_stream);
    let framed = FramedRead::new(reader, LinesCodec::new());
    Box::pin(framed.map(|item| {
        item.map_err(|e| VoxpipeError::Backend {
            message: format!("malformed backend stream: {}", e),
        })
    }))
}
