//! Per-worker execution context handed to [`Stage::process`].
//!
//! The context is the only bridge a stage has to the rest of the chain:
//! `emit` posts client-visible chunks to the output multiplexer, `forward`
//! hands payloads to the next stage, and the cancellation token is checked
//! cooperatively. Stages never reach into other stages.
//!
//! [`Stage::process`]: crate::stage::Stage::process

use crate::error::Result;
use crate::payload::{Chunk, Payload};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receiver of client-visible chunks (implemented by the output
/// multiplexer). The queue id pins pushes to one request instance so a
/// slow worker from a superseded request can never post into its
/// successor's queue.
pub trait EmitPort: Send + Sync {
    /// Appends a chunk to the user's queue. No-op when the user is
    /// disconnected or `queue_id` no longer identifies the live queue.
    /// Returns whether the chunk was accepted.
    fn push(&self, user: &str, queue_id: u64, chunk: Chunk) -> bool;
}

/// Receiver of downstream payloads (implemented by the chain).
#[async_trait]
pub trait ForwardPort: Send + Sync {
    /// Hands a payload to the next stage, starting its worker if needed.
    async fn forward(&self, payload: Payload) -> Result<()>;

    /// Signals end-of-input downstream. Idempotent; the chain guarantees
    /// the client-facing terminal marker is delivered exactly once per
    /// request by cascading this call to the end of the chain.
    fn close(&self);
}

/// Execution context for one (stage, user) worker.
pub struct StageContext {
    streaming: bool,
    user: String,
    queue_id: u64,
    cancel: CancellationToken,
    emitter: Arc<dyn EmitPort>,
    forwarder: Arc<dyn ForwardPort>,
}

impl StageContext {
    pub fn new(
        streaming: bool,
        user: impl Into<String>,
        queue_id: u64,
        cancel: CancellationToken,
        emitter: Arc<dyn EmitPort>,
        forwarder: Arc<dyn ForwardPort>,
    ) -> Self {
        Self {
            streaming,
            user: user.into(),
            queue_id,
            cancel,
            emitter,
            forwarder,
        }
    }

    /// Whether the client asked for incremental output.
    pub fn streaming(&self) -> bool {
        self.streaming
    }

    /// The user this worker serves.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Level-triggered cancellation check. Once true, stays true for this
    /// request instance.
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The worker's cancellation token, for `select!`-style waits.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Posts a client-visible chunk. Dropped silently after cancellation
    /// or disconnect.
    pub fn emit(&self, chunk: Chunk) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.emitter.push(&self.user, self.queue_id, chunk);
    }

    /// Hands a payload to the next stage. Dropped silently after
    /// cancellation.
    pub async fn forward(&self, payload: Payload) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.forwarder.forward(payload).await
    }

    pub(crate) fn forwarder(&self) -> &Arc<dyn ForwardPort> {
        &self.forwarder
    }
}
