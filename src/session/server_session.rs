use std::time::{Duration, Instant};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use uuid::Uuid;

/// A server session: a client-generated opaque identifier plus the counters
/// the server associates with it. Server sessions outlive individual
/// operations and are pooled for reuse across client sessions.
#[derive(Clone, Debug)]
pub struct ServerSession {
    /// The session id document, `{ id: <binary uuid> }`.
    id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was observed while this session was in use.
    /// Dirty sessions are discarded rather than returned to the pool.
    dirty: bool,

    /// A monotonically increasing transaction number.
    txn_number: i64,

    /// The statement counter for the current retryable batch.
    stmt_id: i64,
}

impl ServerSession {
    /// Creates a new session with a client-side generated id.
    pub(crate) fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
            stmt_id: 0,
        }
    }

    /// The session's `lsid` document.
    pub fn id(&self) -> &Document {
        &self.id
    }

    pub(crate) fn into_id(self) -> Document {
        self.id
    }

    /// Records that an operation was just sent with this session.
    pub(crate) fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    /// The current transaction number.
    pub(crate) fn txn_number(&self) -> i64 {
        self.txn_number
    }

    /// Increments the transaction number and returns the new value. Values
    /// issued by this method only ever increase.
    pub(crate) fn advance_transaction_number(&mut self) -> i64 {
        self.txn_number += 1;
        self.txn_number
    }

    /// Adds `count` to the statement counter and returns the new value.
    pub(crate) fn advance_statement_id(&mut self, count: i64) -> i64 {
        self.stmt_id += count;
        self.stmt_id
    }

    /// Permanently marks this session as having observed a network error.
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether this session will hit its server-side TTL within the next
    /// minute, making reuse a race against expiry.
    pub(crate) fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let Some(timeout) = logical_session_timeout else {
            return false;
        };
        let expiration = self.last_use + timeout;
        expiration < Instant::now() + Duration::from_secs(60)
    }

    #[cfg(test)]
    pub(crate) fn set_last_use(&mut self, last_use: Instant) {
        self.last_use = last_use;
    }
}
