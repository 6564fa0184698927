//! Per-user session lifecycle and cancellation.
//!
//! A session is one request instance for one user. Its token carries two
//! monotonic signals: cancellation (client gone, or superseded by a newer
//! request) and completion (chain exhausted normally). Tokens are replaced,
//! never reused: force-cleanup cancels the old token before a superseding
//! request creates a new one, so the old chain quiesces first.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// One request instance for one user.
pub struct Session {
    id: u64,
    cancel: CancellationToken,
    completed: AtomicBool,
}

impl Session {
    fn new(id: u64) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            completed: AtomicBool::new(false),
        }
    }

    /// Identity of this request instance. Strictly increasing across the
    /// process lifetime; stale workers compare against it.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The session's root cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Derives a token for one worker. Cancelling the session cancels
    /// every worker; a superseding start can cancel one worker alone.
    pub fn worker_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Whether the chain exhausted normally for this session.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Marks normal completion. Monotonic; never unset.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }
}

/// Per-user session registry.
pub struct SessionSupervisor {
    sessions: DashMap<String, Arc<Session>>,
    ids: AtomicU64,
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            ids: AtomicU64::new(0),
        }
    }

    /// Creates a fresh session for the user. The caller must have removed
    /// and cancelled any prior session first (force-cleanup ordering).
    pub fn begin(&self, user: &str) -> Arc<Session> {
        let id = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session::new(id));
        self.sessions.insert(user.to_string(), session.clone());
        session
    }

    /// The user's current session, if any.
    pub fn get(&self, user: &str) -> Option<Arc<Session>> {
        self.sessions.get(user).map(|s| s.value().clone())
    }

    /// Removes the user's session. Returns it for the caller to cancel.
    pub fn remove(&self, user: &str) -> Option<Arc<Session>> {
        self.sessions.remove(user).map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_assigns_increasing_ids() {
        let supervisor = SessionSupervisor::new();
        let a = supervisor.begin("u1");
        let b = supervisor.begin("u1");
        assert!(b.id() > a.id());
    }

    #[test]
    fn begin_replaces_current_session() {
        let supervisor = SessionSupervisor::new();
        let old = supervisor.begin("u1");
        let new = supervisor.begin("u1");
        let current = supervisor.get("u1").unwrap();
        assert_eq!(current.id(), new.id());
        assert_ne!(current.id(), old.id());
    }

    #[test]
    fn remove_unknown_user_is_noop() {
        let supervisor = SessionSupervisor::new();
        assert!(supervisor.remove("ghost").is_none());
        assert!(supervisor.remove("ghost").is_none());
    }

    #[test]
    fn worker_token_follows_session_cancel() {
        let supervisor = SessionSupervisor::new();
        let session = supervisor.begin("u1");
        let worker = session.worker_token();
        assert!(!worker.is_cancelled());

        session.cancel_token().cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn worker_token_can_cancel_alone() {
        let supervisor = SessionSupervisor::new();
        let session = supervisor.begin("u1");
        let old_worker = session.worker_token();
        let new_worker = session.worker_token();

        old_worker.cancel();
        assert!(old_worker.is_cancelled());
        assert!(!new_worker.is_cancelled());
        assert!(!session.cancel_token().is_cancelled());
    }

    #[test]
    fn completion_is_monotonic() {
        let supervisor = SessionSupervisor::new();
        let session = supervisor.begin("u1");
        assert!(!session.is_completed());
        session.mark_completed();
        session.mark_completed();
        assert!(session.is_completed());
    }
}
