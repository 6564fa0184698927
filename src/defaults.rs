//! Default configuration constants for voxpipe.
//!
//! This module provides shared constants used across different configuration types
//! to ensure consistency and eliminate duplication.

use std::time::Duration;

/// Default bind address for the API server.
pub const HOST: &str = "0.0.0.0";

/// Default port for the API server.
pub const PORT: u16 = 8000;

/// Default cap on simultaneously admitted requests.
///
/// One chain instance runs per concurrent user; this bounds total worker
/// growth under load. Requests beyond the cap wait for a permit.
pub const MAX_SESSIONS: usize = 5;

/// Default idle timeout for the response stream, in seconds.
///
/// The drain loop ends the client stream when no chunk has arrived within
/// this window and the user's chain is no longer active, so a chain that
/// died without posting its terminal marker cannot block a response forever.
pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 30;

/// Interval at which the drain loop re-checks liveness while waiting.
pub const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-request timeout for stage backend HTTP calls, in seconds.
pub const BACKEND_TIMEOUT_SECS: u64 = 30;

/// Default connect timeout for stage backend HTTP calls, in seconds.
pub const BACKEND_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default number of retries for transient backend failures.
pub const BACKEND_RETRIES: u32 = 2;

/// Default fixed delay between backend retries, in milliseconds.
pub const BACKEND_RETRY_DELAY_MS: u64 = 200;

/// Default watchdog limit on a single stage's processing time, in seconds.
///
/// When exceeded, the watchdog cancels the worker's token; the stage is
/// still expected to observe cancellation promptly on its own.
pub const STAGE_MAX_DURATION_SECS: u64 = 120;

/// Timeout for a stage's backend liveness probe.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);
