//! Per-(stage, user) worker lifecycle.
//!
//! Each admitted input runs on its own tokio task. Bookkeeping lives in a
//! concurrent map keyed by user id: the pending-input sender, the worker's
//! cancellation token, and a generation number so a superseded worker can
//! never tear down its successor's state. At most one worker is active per
//! (stage, user); a second start obeys the stage's [`OverlapPolicy`].

use crate::error::{Result, VoxpipeError};
use crate::payload::{Chunk, Payload};
use crate::stage::context::StageContext;
use crate::stage::{OverlapPolicy, Stage};
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

/// Outcome of feeding a payload to an existing worker.
#[derive(Debug, PartialEq)]
pub enum FeedResult {
    /// Queued on the active worker.
    Fed,
    /// The worker's input was already closed; the payload was dropped.
    Closed,
    /// No worker is active for this user; the payload is handed back so
    /// the caller can start one.
    NoWorker(Payload),
    /// The active worker belongs to a different (superseded) session.
    Stale,
}

struct WorkerEntry {
    /// Pending-input queue; `None` once end-of-input was signalled.
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Payload>>>,
    cancel: CancellationToken,
    generation: u64,
    session_id: u64,
}

/// Concurrent per-user worker bookkeeping for one stage.
pub struct StageWorkers {
    entries: Arc<DashMap<String, Arc<WorkerEntry>>>,
    generations: AtomicU64,
}

impl Default for StageWorkers {
    fn default() -> Self {
        Self::new()
    }
}

impl StageWorkers {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Whether a worker is currently booked for this user.
    pub fn is_active(&self, user: &str) -> bool {
        self.entries.contains_key(user)
    }

    /// Starts a worker for `ctx.user()` processing `input`.
    ///
    /// If a worker is already active for the user: `Reject` stages fail
    /// with [`VoxpipeError::UserBusy`] and no side effects; `Supersede`
    /// stages cancel the old worker's token and proceed. An entry left
    /// over from an older session is always superseded.
    pub fn start(
        &self,
        stage: Arc<dyn Stage>,
        ctx: StageContext,
        session_id: u64,
        max_duration: Duration,
        input: Payload,
    ) -> Result<()> {
        let user = ctx.user().to_string();

        if let Some(existing) = self.entries.get(&user).map(|e| e.value().clone()) {
            if existing.session_id == session_id && stage.overlap() == OverlapPolicy::Reject {
                return Err(VoxpipeError::UserBusy {
                    stage: stage.name().to_string(),
                    user,
                });
            }
            log::debug!(
                "stage {}: superseding active worker for {}",
                stage.name(),
                user
            );
            existing.cancel.cancel();
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        // The channel was just created; the send cannot fail.
        let _ = tx.send(input);

        let entry = Arc::new(WorkerEntry {
            tx: std::sync::Mutex::new(Some(tx)),
            cancel: ctx.cancel_token().clone(),
            generation,
            session_id,
        });
        self.entries.insert(user.clone(), entry);

        let entries = Arc::clone(&self.entries);
        tokio::spawn(run_worker(
            stage,
            ctx,
            rx,
            entries,
            user,
            generation,
            max_duration,
        ));
        Ok(())
    }

    /// Queues a payload on the user's active worker.
    pub fn feed(&self, user: &str, session_id: u64, payload: Payload) -> FeedResult {
        let Some(entry) = self.entries.get(user).map(|e| e.value().clone()) else {
            return FeedResult::NoWorker(payload);
        };
        if entry.session_id != session_id {
            return FeedResult::Stale;
        }
        match entry.tx.lock() {
            Ok(guard) => {
                if let Some(tx) = guard.as_ref() {
                    if tx.send(payload).is_ok() {
                        FeedResult::Fed
                    } else {
                        FeedResult::Closed
                    }
                } else {
                    FeedResult::Closed
                }
            }
            Err(_) => FeedResult::Closed,
        }
    }

    /// Signals end-of-input to the user's active worker. Returns true when
    /// a worker of this session exists and will unwind the chain itself.
    pub fn close_input(&self, user: &str, session_id: u64) -> bool {
        let Some(entry) = self.entries.get(user).map(|e| e.value().clone()) else {
            return false;
        };
        if entry.session_id != session_id {
            return false;
        }
        if let Ok(mut guard) = entry.tx.lock() {
            guard.take();
        }
        true
    }

    /// Drops the user's bookkeeping without waiting for the worker task.
    /// Cooperative cancellation is the only termination mechanism; the
    /// task notices its token and exits on its own.
    pub fn cleanup(&self, user: &str) {
        self.entries.remove(user);
    }
}

enum ExitReason {
    /// Input queue closed and drained.
    Finished,
    /// External cancellation (disconnect or supersede): stop silently.
    Cancelled,
    /// Watchdog expired; token was cancelled, chain still unwinds.
    Watchdog,
    /// The stage failed or panicked.
    Failed(String),
}

async fn run_worker(
    stage: Arc<dyn Stage>,
    ctx: StageContext,
    mut rx: UnboundedReceiver<Payload>,
    entries: Arc<DashMap<String, Arc<WorkerEntry>>>,
    user: String,
    generation: u64,
    max_duration: Duration,
) {
    let cancel = ctx.cancel_token().clone();
    let mut reason = ExitReason::Finished;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                reason = ExitReason::Cancelled;
                break;
            }
            next = rx.recv() => next,
        };
        let Some(input) = next else {
            // End of input: work for this user is finished.
            break;
        };

        let work = AssertUnwindSafe(stage.process(&ctx, input)).catch_unwind();
        tokio::select! {
            _ = cancel.cancelled() => {
                reason = ExitReason::Cancelled;
                break;
            }
            outcome = tokio::time::timeout(max_duration, work) => match outcome {
                Err(_) => {
                    log::warn!(
                        "stage {}: watchdog expired for {} after {:?}",
                        stage.name(),
                        user,
                        max_duration
                    );
                    cancel.cancel();
                    reason = ExitReason::Watchdog;
                    break;
                }
                Ok(Err(_panic)) => {
                    log::error!("stage {}: worker for {} panicked", stage.name(), user);
                    reason = ExitReason::Failed(format!(
                        "stage {} failed unexpectedly",
                        stage.name()
                    ));
                    break;
                }
                Ok(Ok(Err(e))) => {
                    if cancel.is_cancelled() {
                        reason = ExitReason::Cancelled;
                    } else {
                        log::warn!("stage {}: {} for user {}", stage.name(), e, user);
                        reason = ExitReason::Failed(e.to_string());
                    }
                    break;
                }
                Ok(Ok(Ok(()))) => {
                    // Input handled; drain any further queued inputs.
                }
            }
        }
    }

    // Own bookkeeping cleanup. A superseding worker may already have
    // replaced this entry; the generation check keeps its state intact.
    let still_owner = entries
        .remove_if(&user, |_, e| e.generation == generation)
        .is_some();

    match reason {
        ExitReason::Cancelled => {
            // Silent stop: no error chunk, the multiplexer is torn down
            // by the cleanup path that cancelled us.
        }
        ExitReason::Failed(message) => {
            ctx.emit(Chunk::Error(message));
            if still_owner {
                ctx.forwarder().close();
            }
        }
        ExitReason::Finished | ExitReason::Watchdog => {
            if still_owner {
                ctx.forwarder().close();
            }
        }
    }
}
