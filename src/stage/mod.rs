//! Stage abstraction: one named unit of work in the processing chain.
//!
//! A stage consumes one input payload per worker run, emits client-visible
//! chunks into the output multiplexer, forwards payloads to the next stage,
//! and cooperates with cancellation at every suspension point. Stage
//! instances are created once at process start and reused across users;
//! per-user state lives in [`worker::StageWorkers`], keyed by user id.

pub mod context;
pub mod worker;

pub use context::{EmitPort, ForwardPort, StageContext};
pub use worker::{FeedResult, StageWorkers};

use crate::error::Result;
use crate::payload::{Payload, PayloadKind};
use crate::protocol::ApiRequest;
use async_trait::async_trait;

/// What happens when work is started for a (stage, user) pair that already
/// has an active worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// The second start is rejected without side effects. Used for stages
    /// that must not overlap (LLM, TTS).
    Reject,
    /// The old worker's cancellation token is signalled and the new worker
    /// proceeds. Used where a later utterance supersedes an earlier
    /// partial one (ASR).
    Supersede,
}

/// One link in the processing chain.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name for logging, diagnostics, and per-stage routes.
    fn name(&self) -> &'static str;

    /// Declared input contract, validated against the previous stage's
    /// output at chain construction.
    fn input_kind(&self) -> PayloadKind;

    /// Declared output contract.
    fn output_kind(&self) -> PayloadKind;

    /// Policy for a second start while a worker is active.
    fn overlap(&self) -> OverlapPolicy {
        OverlapPolicy::Reject
    }

    /// Pure transform from the wire request into this stage's input.
    /// Called once per request, before the chain starts; no side effects.
    fn handle_input(&self, request: &ApiRequest) -> Result<Payload>;

    /// Consumes one input: emit zero or more chunks via `ctx.emit`,
    /// forward downstream payloads via `ctx.forward`, and return when done.
    ///
    /// Must check `ctx.cancelled()` at every natural suspension point
    /// (after a blocking call, inside any loop over response chunks) and
    /// stop promptly; no chunk may be emitted after cancellation is
    /// observed. The terminal marker is delivered by the worker when the
    /// stage's work for the user is finished, success or failure.
    async fn process(&self, ctx: &StageContext, input: Payload) -> Result<()>;

    /// Lightweight backend liveness probe.
    async fn heartbeat(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_policy_is_comparable() {
        assert_eq!(OverlapPolicy::Reject, OverlapPolicy::Reject);
        assert_ne!(OverlapPolicy::Reject, OverlapPolicy::Supersede);
    }
}
