use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock,
    },
    time::Duration,
};

use bson::Document;
use tokio::sync::Mutex;

use super::server_session::ServerSession;

/// A pool of server sessions available for reuse.
///
/// Sessions are stored most-recently-used first: the server expires sessions
/// by idleness, so handing out the freshest one minimizes the chance of
/// racing its expiry. Sessions within a minute of their server-side TTL are
/// discarded rather than reused.
#[derive(Debug, Default)]
pub struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,

    /// The number of sessions currently checked out.
    in_use_count: AtomicUsize,

    /// The server's advertised session TTL, from the most recent view of the
    /// cluster.
    logical_session_timeout: RwLock<Option<Duration>>,
}

impl ServerSessionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the session TTL advertised by the cluster. Future expiry
    /// checks use this value.
    pub fn update_logical_session_timeout(&self, timeout: Option<Duration>) {
        *self.logical_session_timeout.write().unwrap() = timeout;
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        *self.logical_session_timeout.read().unwrap()
    }

    /// The number of sessions currently checked out of the pool.
    pub fn in_use_count(&self) -> usize {
        self.in_use_count.load(Ordering::SeqCst)
    }

    /// Checks out a session, preferring the most recently used. Sessions
    /// about to expire are discarded along the way; if none survive, a fresh
    /// session (with a fresh client-generated id) is created.
    pub async fn check_out(&self) -> ServerSession {
        let timeout = self.logical_session_timeout();
        self.in_use_count.fetch_add(1, Ordering::SeqCst);

        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Returns a session to the pool. Dirty sessions and sessions about to
    /// expire are discarded instead.
    pub async fn check_in(&self, session: ServerSession) {
        let timeout = self.logical_session_timeout();
        self.in_use_count.fetch_sub(1, Ordering::SeqCst);

        let mut pool = self.pool.lock().await;

        // Lazily drop pooled sessions that expired while waiting.
        while let Some(pooled) = pool.back() {
            if pooled.is_about_to_expire(timeout) {
                pool.pop_back();
            } else {
                break;
            }
        }

        if !session.is_dirty() && !session.is_about_to_expire(timeout) {
            pool.push_front(session);
        }
    }

    /// Empties the pool, returning the `lsid` documents of all drained
    /// sessions for a best-effort `endSessions` command.
    pub async fn drain(&self) -> Vec<Document> {
        let mut pool = self.pool.lock().await;
        pool.drain(..).map(|session| session.into_id()).collect()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &Document) -> bool {
        self.pool.lock().await.iter().any(|s| s.id() == id)
    }

    #[cfg(test)]
    pub(crate) async fn available_count(&self) -> usize {
        self.pool.lock().await.len()
    }
}
