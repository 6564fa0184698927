//! Per-user output multiplexer.
//!
//! Decouples stage-produced chunks from the HTTP response generator: any
//! worker may push, exactly one consumer drains. Each `open` creates a new
//! queue with a fresh id; pushes carry the id of the queue they were aimed
//! at, so a slow worker from a superseded request can never land a chunk in
//! its successor's queue.

use crate::payload::{Chunk, StreamItem};
use crate::stage::context::EmitPort;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

struct UserQueue {
    id: u64,
    tx: UnboundedSender<StreamItem>,
    rx: Mutex<Option<UnboundedReceiver<StreamItem>>>,
    active: AtomicBool,
    disconnected: AtomicBool,
    completed: AtomicBool,
    accepted: AtomicUsize,
}

/// Thread-safe per-user chunk queues with completion and disconnect flags.
pub struct OutputMux {
    queues: DashMap<String, Arc<UserQueue>>,
    ids: AtomicU64,
}

impl Default for OutputMux {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputMux {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            ids: AtomicU64::new(0),
        }
    }

    /// Creates a fresh queue for the user, replacing any previous one, and
    /// returns its id. A replaced queue's consumer sees end-of-stream.
    pub fn open(&self, user: &str) -> u64 {
        let id = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(UserQueue {
            id,
            tx,
            rx: Mutex::new(Some(rx)),
            active: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
        });
        self.queues.insert(user.to_string(), queue);
        id
    }

    fn current(&self, user: &str) -> Option<Arc<UserQueue>> {
        self.queues.get(user).map(|q| q.value().clone())
    }

    /// Id of the user's live queue, if any.
    pub fn current_id(&self, user: &str) -> Option<u64> {
        self.current(user).map(|q| q.id)
    }

    /// Appends a chunk. No-op when the user has no queue, the queue id is
    /// stale, or the user is disconnected. Returns acceptance.
    pub fn push(&self, user: &str, queue_id: u64, chunk: Chunk) -> bool {
        let Some(queue) = self.current(user) else {
            return false;
        };
        if queue.id != queue_id || queue.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        if queue.tx.send(StreamItem::Chunk(chunk)).is_ok() {
            queue.accepted.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Marks the request complete: clears the active flag and delivers the
    /// terminal marker. Idempotent; exactly one `End` per queue.
    pub fn mark_complete(&self, user: &str, queue_id: u64) {
        let Some(queue) = self.current(user) else {
            return;
        };
        if queue.id != queue_id {
            return;
        }
        queue.active.store(false, Ordering::SeqCst);
        if !queue.completed.swap(true, Ordering::SeqCst) {
            let _ = queue.tx.send(StreamItem::End);
        }
    }

    /// Marks the user disconnected: all subsequent pushes become no-ops.
    pub fn disconnect(&self, user: &str, queue_id: u64) {
        if let Some(queue) = self.current(user)
            && queue.id == queue_id
        {
            queue.disconnected.store(true, Ordering::SeqCst);
            queue.active.store(false, Ordering::SeqCst);
        }
    }

    /// Whether the user's chain is still considered active.
    pub fn is_active(&self, user: &str) -> bool {
        self.current(user)
            .map(|q| q.active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Takes the consumer half of the user's queue. One consumer per
    /// request; a second take returns `None`.
    pub fn take_receiver(&self, user: &str) -> Option<(u64, UnboundedReceiver<StreamItem>)> {
        let queue = self.current(user)?;
        let rx = queue.rx.lock().ok()?.take()?;
        Some((queue.id, rx))
    }

    /// Number of chunks accepted into the user's live queue.
    pub fn accepted_count(&self, user: &str) -> usize {
        self.current(user)
            .map(|q| q.accepted.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Drops the user's queue entirely. Pending items are discarded and
    /// the consumer sees end-of-stream.
    pub fn remove(&self, user: &str) {
        self.queues.remove(user);
    }

    #[cfg(test)]
    pub(crate) fn force_inactive(&self, user: &str) {
        if let Some(queue) = self.current(user) {
            queue.active.store(false, Ordering::SeqCst);
        }
    }
}

impl EmitPort for OutputMux {
    fn push(&self, user: &str, queue_id: u64, chunk: Chunk) -> bool {
        OutputMux::push(self, user, queue_id, chunk)
    }
}
