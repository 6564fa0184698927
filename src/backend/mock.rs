//! Scripted backend for tests and offline development.

use crate::backend::{Backend, ByteStream};
use crate::error::{Result, VoxpipeError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Backend that replays scripted response lines.
///
/// Supports failure injection (`with_failures`, `with_status_failure`) and
/// artificially slow streaming (`with_chunk_delay`) for cancellation and
/// retry tests.
pub struct MockBackend {
    lines: Vec<String>,
    chunk_delay: Option<Duration>,
    fail_times: AtomicU32,
    fail_status: Option<u16>,
    alive: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<(String, serde_json::Value)>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            chunk_delay: None,
            fail_times: AtomicU32::new(0),
            fail_status: None,
            alive: true,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Response lines to stream back, one per frame.
    pub fn with_lines(mut self, lines: Vec<String>) -> Self {
        self.lines = lines;
        self
    }

    /// Fail the first `n` sends with a transient error.
    pub fn with_failures(self, n: u32) -> Self {
        self.fail_times.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every send with the given HTTP status (non-transient for 4xx).
    pub fn with_status_failure(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    /// Sleep between streamed frames, simulating a slow inference service.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Report the backend as down on liveness probes.
    pub fn with_down(mut self) -> Self {
        self.alive = false;
        self
    }

    /// Number of `send` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Request bodies received so far, in order.
    pub fn requests(&self) -> Vec<(String, serde_json::Value)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn send(&self, user: &str, body: serde_json::Value) -> Result<ByteStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((user.to_string(), body));
        }

        if let Some(status) = self.fail_status {
            return Err(VoxpipeError::BackendStatus {
                status,
                message: "scripted failure".to_string(),
            });
        }

        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            return Err(VoxpipeError::Backend {
                message: "scripted transient failure".to_string(),
            });
        }

        let frames: Vec<Result<Bytes>> = self
            .lines
            .iter()
            .map(|line| Ok(Bytes::from(format!("{}\n", line))))
            .collect();
        let delay = self.chunk_delay;
        let stream = futures::stream::iter(frames).then(move |frame| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            frame
        });
        Ok(Box::pin(stream))
    }

    async fn alive(&self) -> bool {
        self.alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::lines;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_streams_scripted_lines() {
        let backend = MockBackend::new().with_lines(vec!["a".to_string(), "b".to_string()]);
        let stream = backend.send("u1", json!({"q": 1})).await.unwrap();
        let collected: Vec<String> = lines(stream).map(|l| l.unwrap()).collect().await;
        assert_eq!(collected, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let backend = MockBackend::new();
        backend.send("u1", json!({"text": "hi"})).await.unwrap();
        backend.send("u2", json!({"text": "yo"})).await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "u1");
        assert_eq!(requests[1].1["text"], "yo");
    }

    #[tokio::test]
    async fn test_mock_failure_injection_is_bounded() {
        let backend = MockBackend::new().with_failures(1);
        assert!(backend.send("u1", json!({})).await.is_err());
        assert!(backend.send("u1", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_down_backend() {
        let backend = MockBackend::new().with_down();
        assert!(!backend.alive().await);
    }
}
