//! The narrow session surface a command dispatcher consumes.
//!
//! Two implementations exist because two dispatch paths exist: the explicit
//! path is fully transaction-aware, while the implicit path drives sessions
//! the driver created itself and never reports an active transaction. The
//! caller selects which one wraps its session.

use bson::{Document, Timestamp};

use super::{ClientSession, ClusterTime};
use crate::{error::Result, options::ReadConcern};

/// What a command dispatcher needs to know about (and report back into) a
/// session while assembling and completing a single command.
pub trait SessionContext {
    /// Whether a session is associated at all.
    fn has_session(&self) -> bool;

    /// Whether the session was created implicitly by the driver.
    fn is_implicit(&self) -> bool;

    /// The `lsid` to attach to the command.
    fn session_id(&self) -> Option<&Document>;

    /// The current transaction number.
    fn txn_number(&self) -> Option<i64>;

    /// Increments and returns the transaction number.
    fn advance_txn_number(&mut self) -> Result<i64>;

    /// Called after the command's bytes are handed to the transport.
    fn notify_message_sent(&mut self);

    /// The highest operation time the session has observed.
    fn operation_time(&self) -> Option<Timestamp>;

    /// Merges an operation time from a reply.
    fn advance_operation_time(&mut self, to: Timestamp);

    /// The highest cluster time the session has observed.
    fn cluster_time(&self) -> Option<ClusterTime>;

    /// Merges a cluster time from a reply.
    fn advance_cluster_time(&mut self, to: &ClusterTime);

    /// Whether the session reads from a pinned snapshot.
    fn is_snapshot(&self) -> bool;

    /// The pinned snapshot timestamp, if one is set.
    fn snapshot_timestamp(&self) -> Option<Timestamp>;

    /// Whether a transaction is currently active on the session.
    fn has_active_transaction(&self) -> bool;

    /// The read concern the command should carry, if any.
    fn read_concern(&self) -> Option<ReadConcern>;

    /// The transaction recovery token to resend on commit retries.
    fn recovery_token(&self) -> Option<&Document>;

    /// Captures a recovery token from a reply.
    fn set_recovery_token(&mut self, token: Document);

    /// Releases the transaction context and unpins the session.
    fn clear_transaction_context(&mut self);

    /// Marks the session dirty after a network error.
    fn mark_dirty(&mut self);

    /// Whether the session has observed a network error.
    fn is_dirty(&self) -> bool;
}

/// The transaction-aware context used when dispatching commands on an
/// application-provided session.
pub struct ExplicitSessionContext<'a> {
    session: &'a mut ClientSession,
}

impl<'a> ExplicitSessionContext<'a> {
    /// Wraps a session for one dispatch.
    pub fn new(session: &'a mut ClientSession) -> Self {
        Self { session }
    }
}

/// The context used when dispatching commands on a driver-created session;
/// implicit sessions never run transactions, so this implementation reports
/// none regardless of the underlying state.
pub struct ImplicitSessionContext<'a> {
    session: &'a mut ClientSession,
}

impl<'a> ImplicitSessionContext<'a> {
    /// Wraps a session for one dispatch.
    pub fn new(session: &'a mut ClientSession) -> Self {
        Self { session }
    }
}

macro_rules! delegate_session_context {
    () => {
        fn has_session(&self) -> bool {
            self.session.id().is_some()
        }

        fn is_implicit(&self) -> bool {
            self.session.is_implicit()
        }

        fn session_id(&self) -> Option<&Document> {
            self.session.id()
        }

        fn txn_number(&self) -> Option<i64> {
            self.session.txn_number()
        }

        fn advance_txn_number(&mut self) -> Result<i64> {
            self.session.advance_transaction_number()
        }

        fn notify_message_sent(&mut self) {
            self.session.notify_message_sent();
        }

        fn operation_time(&self) -> Option<Timestamp> {
            self.session.operation_time()
        }

        fn advance_operation_time(&mut self, to: Timestamp) {
            self.session.advance_operation_time(to);
        }

        fn cluster_time(&self) -> Option<ClusterTime> {
            self.session.cluster_time().cloned()
        }

        fn advance_cluster_time(&mut self, to: &ClusterTime) {
            self.session.advance_cluster_time(to);
        }

        fn is_snapshot(&self) -> bool {
            self.session.is_snapshot()
        }

        fn snapshot_timestamp(&self) -> Option<Timestamp> {
            self.session.snapshot_timestamp()
        }

        fn read_concern(&self) -> Option<ReadConcern> {
            self.session.command_read_concern()
        }

        fn recovery_token(&self) -> Option<&Document> {
            self.session.recovery_token()
        }

        fn set_recovery_token(&mut self, token: Document) {
            self.session.set_recovery_token(token);
        }

        fn clear_transaction_context(&mut self) {
            self.session.clear_transaction_context();
        }

        fn mark_dirty(&mut self) {
            self.session.mark_dirty();
        }

        fn is_dirty(&self) -> bool {
            self.session.is_dirty()
        }
    };
}

impl SessionContext for ExplicitSessionContext<'_> {
    delegate_session_context!();

    fn has_active_transaction(&self) -> bool {
        self.session.in_transaction()
    }
}

impl SessionContext for ImplicitSessionContext<'_> {
    delegate_session_context!();

    fn has_active_transaction(&self) -> bool {
        false
    }
}
