//! The stage chain: an ordered, immutable-after-construction list of
//! stages validated once for type compatibility, plus the per-user
//! machinery that runs them.
//!
//! Serving a request always starts from a clean slate: any prior in-flight
//! chain for the user is force-cleaned (token cancelled, bookkeeping
//! dropped, queue removed) before new state is allocated, so a slow old
//! worker can never post into a new request's queue. Results flow back
//! through the per-user output multiplexer, drained by a single consumer.

pub mod mux;
pub mod session;

pub use mux::OutputMux;
pub use session::{Session, SessionSupervisor};

use crate::defaults;
use crate::error::{Result, VoxpipeError};
use crate::payload::{Chunk, Payload, StreamItem};
use crate::protocol::ApiRequest;
use crate::stage::context::{EmitPort, ForwardPort, StageContext};
use crate::stage::worker::{FeedResult, StageWorkers};
use crate::stage::Stage;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

/// Builds a [`Chain`], validating stage contracts at construction.
pub struct ChainBuilder {
    stages: Vec<(Arc<dyn Stage>, Duration)>,
    idle_timeout: Duration,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            idle_timeout: Duration::from_secs(defaults::STREAM_IDLE_TIMEOUT_SECS),
        }
    }

    /// Appends a stage with its watchdog limit.
    pub fn stage(mut self, stage: Arc<dyn Stage>, max_duration: Duration) -> Self {
        self.stages.push((stage, max_duration));
        self
    }

    /// Idle timeout for response streams (see [`Chain::drain`]).
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Validates adjacent stage contracts and builds the chain.
    ///
    /// An empty chain or a type mismatch between adjacent stages is a
    /// fatal configuration error: it fails here, before the server accepts
    /// traffic, never at request time.
    pub fn build(self) -> Result<Chain> {
        if self.stages.is_empty() {
            return Err(VoxpipeError::ChainEmpty);
        }
        for pair in self.stages.windows(2) {
            let (current, _) = &pair[0];
            let (next, _) = &pair[1];
            if !next.input_kind().accepts(current.output_kind()) {
                return Err(VoxpipeError::ChainTypeMismatch {
                    from: current.name().to_string(),
                    to: next.name().to_string(),
                    output: current.output_kind().to_string(),
                    input: next.input_kind().to_string(),
                });
            }
        }
        let slots = self
            .stages
            .into_iter()
            .map(|(stage, max_duration)| StageSlot {
                stage,
                workers: StageWorkers::new(),
                max_duration,
            })
            .collect();
        Ok(Chain {
            inner: Arc::new(ChainInner {
                slots,
                mux: Arc::new(OutputMux::new()),
                sessions: SessionSupervisor::new(),
                idle_timeout: self.idle_timeout,
            }),
        })
    }
}

struct StageSlot {
    stage: Arc<dyn Stage>,
    workers: StageWorkers,
    max_duration: Duration,
}

struct ChainInner {
    slots: Vec<StageSlot>,
    mux: Arc<OutputMux>,
    sessions: SessionSupervisor,
    idle_timeout: Duration,
}

/// The validated, ordered sequence of stages serving one request type.
#[derive(Clone)]
pub struct Chain {
    inner: Arc<ChainInner>,
}

impl Chain {
    /// "name(in->out) -> name(in->out)" summary for startup logging.
    pub fn describe(&self) -> String {
        self.inner
            .slots
            .iter()
            .map(|slot| {
                format!(
                    "{}({}->{})",
                    slot.stage.name(),
                    slot.stage.input_kind(),
                    slot.stage.output_kind()
                )
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Names of all stages, in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.inner.slots.iter().map(|s| s.stage.name()).collect()
    }

    /// Adapts the wire request into the entry stage's input payload.
    pub fn handle_input(&self, request: &ApiRequest) -> Result<Payload> {
        let slot = self.inner.slots.get(request.entry).ok_or(
            VoxpipeError::EntryOutOfRange {
                entry: request.entry,
                len: self.inner.slots.len(),
            },
        )?;
        slot.stage.handle_input(request)
    }

    /// Starts a chain run for the user and returns immediately; results
    /// are consumed via [`Chain::drain`], not a return value.
    ///
    /// Any prior in-flight request for this user is force-cleaned first —
    /// a new request always starts from a clean slate, at the cost of
    /// discarding whatever the previous request was doing.
    pub fn serve(&self, streaming: bool, user: &str, entry: usize, input: Payload) -> Result<()> {
        let inner = &self.inner;
        let len = inner.slots.len();
        if entry >= len {
            return Err(VoxpipeError::EntryOutOfRange { entry, len });
        }
        let slot = &inner.slots[entry];
        if !slot.stage.input_kind().accepts(input.kind()) {
            return Err(VoxpipeError::InputRejected {
                stage: slot.stage.name().to_string(),
                message: format!(
                    "expected {} input, got {}",
                    slot.stage.input_kind(),
                    input.kind()
                ),
            });
        }

        log::info!("starting chain for user {} at stage {}", user, slot.stage.name());
        // Cleanup must fully apply (token set) before any new state is
        // allocated for the superseding request.
        inner.force_cleanup(user);
        let session = inner.sessions.begin(user);
        let queue_id = inner.mux.open(user);

        start_stage(inner, entry, streaming, user, queue_id, &session, input)?;
        // One entry payload per request: close the entry stage's input so
        // its worker unwinds the chain when done.
        inner.slots[entry].workers.close_input(user, session.id());
        Ok(())
    }

    /// Lazy stream of the user's client-visible chunks.
    ///
    /// Ends on the terminal marker, or when no chunk has arrived within
    /// the idle timeout while the chain is no longer active. On exit, for
    /// any reason (completion, error, or the consumer dropping the
    /// stream), the user is marked disconnected and cleanup runs.
    pub fn drain(&self, user: &str) -> Pin<Box<dyn Stream<Item = Chunk> + Send>> {
        let Some((queue_id, rx)) = self.inner.mux.take_receiver(user) else {
            return Box::pin(futures::stream::empty());
        };

        let state = DrainState {
            rx,
            last: Instant::now(),
            _guard: DrainGuard {
                inner: self.inner.clone(),
                user: user.to_string(),
                queue_id,
            },
        };
        let inner = self.inner.clone();
        let user = user.to_string();
        let idle_timeout = self.inner.idle_timeout;

        Box::pin(futures::stream::unfold(state, move |mut state| {
            let inner = inner.clone();
            let user = user.clone();
            async move {
                loop {
                    match tokio::time::timeout(defaults::STREAM_POLL_INTERVAL, state.rx.recv())
                        .await
                    {
                        Ok(Some(StreamItem::Chunk(chunk))) => {
                            state.last = Instant::now();
                            return Some((chunk, state));
                        }
                        Ok(Some(StreamItem::End)) | Ok(None) => return None,
                        Err(_) => {
                            // Nothing arrived this tick. A chain that died
                            // without posting its terminal must not block
                            // the response forever.
                            if !inner.mux.is_active(&user) && state.last.elapsed() >= idle_timeout
                            {
                                log::warn!(
                                    "response stream for {} idle and inactive, ending",
                                    user
                                );
                                return None;
                            }
                        }
                    }
                }
            }
        }))
    }

    /// Cancels and tears down all per-user state across every stage and
    /// the multiplexer. Idempotent; unknown users are a no-op.
    pub fn force_cleanup(&self, user: &str) {
        self.inner.force_cleanup(user);
    }

    /// Whether a chain run is currently active for the user.
    pub fn is_active(&self, user: &str) -> bool {
        self.inner.mux.is_active(user)
    }

    /// Whether the user's current session completed normally.
    pub fn is_completed(&self, user: &str) -> bool {
        self.inner
            .sessions
            .get(user)
            .map(|s| s.is_completed())
            .unwrap_or(false)
    }

    /// Aggregated backend liveness, one entry per stage.
    pub async fn heartbeat(&self) -> serde_json::Value {
        let mut stages = serde_json::Map::new();
        for slot in &self.inner.slots {
            let status = if slot.stage.heartbeat().await {
                "ok"
            } else {
                "unreachable"
            };
            stages.insert(slot.stage.name().to_string(), serde_json::json!(status));
        }
        serde_json::json!({ "stages": stages })
    }

    /// Liveness of one stage's backend, by stage name.
    pub async fn stage_alive(&self, name: &str) -> Option<bool> {
        for slot in &self.inner.slots {
            if slot.stage.name() == name {
                return Some(slot.stage.heartbeat().await);
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn mux(&self) -> &Arc<OutputMux> {
        &self.inner.mux
    }
}

fn start_stage(
    inner: &Arc<ChainInner>,
    idx: usize,
    streaming: bool,
    user: &str,
    queue_id: u64,
    session: &Arc<Session>,
    input: Payload,
) -> Result<()> {
    // A superseded session quiesces instead of allocating workers.
    if session.cancel_token().is_cancelled() {
        return Ok(());
    }
    let slot = &inner.slots[idx];
    let forwarder: Arc<dyn ForwardPort> = Arc::new(ChainForward {
        inner: inner.clone(),
        next: idx + 1,
        streaming,
        user: user.to_string(),
        queue_id,
        session: session.clone(),
    });
    let ctx = StageContext::new(
        streaming,
        user,
        queue_id,
        session.worker_token(),
        inner.mux.clone() as Arc<dyn EmitPort>,
        forwarder,
    );
    slot.workers
        .start(slot.stage.clone(), ctx, session.id(), slot.max_duration, input)
}

/// Propagates end-of-input from stage `from` to the end of the chain.
/// Stages that never started are skipped; past the last stage the user's
/// queue is completed, delivering the single terminal marker.
fn close_input_from(inner: &Arc<ChainInner>, from: usize, user: &str, queue_id: u64, session_id: u64) {
    let mut idx = from;
    loop {
        if idx >= inner.slots.len() {
            inner.mux.mark_complete(user, queue_id);
            if let Some(session) = inner.sessions.get(user)
                && session.id() == session_id
            {
                session.mark_completed();
            }
            return;
        }
        if inner.slots[idx].workers.close_input(user, session_id) {
            // An active worker will cascade the close itself.
            return;
        }
        idx += 1;
    }
}

impl ChainInner {
    fn force_cleanup(&self, user: &str) {
        if let Some(session) = self.sessions.remove(user) {
            session.cancel_token().cancel();
        }
        // Per-stage bookkeeping is dropped without waiting for workers; a
        // cooperative token check is their only termination mechanism.
        for slot in &self.slots {
            slot.workers.cleanup(user);
        }
        self.mux.remove(user);
    }
}

/// Forward port wired from stage `next - 1` into stage `next`.
struct ChainForward {
    inner: Arc<ChainInner>,
    next: usize,
    streaming: bool,
    user: String,
    queue_id: u64,
    session: Arc<Session>,
}

#[async_trait]
impl ForwardPort for ChainForward {
    async fn forward(&self, payload: Payload) -> Result<()> {
        if self.session.cancel_token().is_cancelled() {
            return Ok(());
        }
        if self.next >= self.inner.slots.len() {
            log::debug!("last stage output for {} has no downstream, dropped", self.user);
            return Ok(());
        }
        let slot = &self.inner.slots[self.next];
        match slot
            .workers
            .feed(&self.user, self.session.id(), payload)
        {
            FeedResult::Fed | FeedResult::Stale => Ok(()),
            FeedResult::Closed => {
                log::warn!(
                    "stage {}: input for {} already closed, payload dropped",
                    slot.stage.name(),
                    self.user
                );
                Ok(())
            }
            FeedResult::NoWorker(payload) => start_stage(
                &self.inner,
                self.next,
                self.streaming,
                &self.user,
                self.queue_id,
                &self.session,
                payload,
            ),
        }
    }

    fn close(&self) {
        close_input_from(
            &self.inner,
            self.next,
            &self.user,
            self.queue_id,
            self.session.id(),
        );
    }
}

/// Ends the consuming side of a request: marks the user disconnected and
/// triggers the same cleanup routine as a superseding request.
struct DrainGuard {
    inner: Arc<ChainInner>,
    user: String,
    queue_id: u64,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        // Only tear down our own request instance; a superseding request
        // may already have replaced the queue.
        if self.inner.mux.current_id(&self.user) == Some(self.queue_id) {
            self.inner.mux.disconnect(&self.user, self.queue_id);
            self.inner.force_cleanup(&self.user);
        }
    }
}

struct DrainState {
    rx: UnboundedReceiver<StreamItem>,
    last: Instant,
    _guard: DrainGuard,
}
