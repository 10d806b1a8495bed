//! Client and server sessions, their reuse pool, and the cluster-clock types
//! used for causal consistency.

mod cluster_time;
mod context;
mod pool;
mod server_session;
#[cfg(test)]
mod test;

use std::{any::Any, sync::Arc};

use bson::{doc, Document, Timestamp};

pub use self::{
    cluster_time::{ClusterClock, ClusterTime},
    context::{ExplicitSessionContext, ImplicitSessionContext, SessionContext},
    pool::ServerSessionPool,
    server_session::ServerSession,
};
use crate::{
    conn::Command,
    error::{ErrorKind, Result},
    options::{ReadConcern, ServerAddress, SessionOptions, TransactionOptions},
};

/// Builds the best-effort `endSessions` command sent at shutdown for the
/// given drained session ids.
pub fn end_sessions_command(session_ids: Vec<Document>) -> Command {
    Command::new("endSessions", "admin", doc! { "endSessions": session_ids })
}

/// A logical session, tying together the server session identity, causal
/// consistency state, and transaction context threaded through every command
/// dispatched with it.
///
/// Sessions are not thread safe and may only be used by one operation at a
/// time.
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,

    operation_time: Option<Timestamp>,

    /// Present until the session is closed; returned to the pool then.
    server_session: Option<ServerSession>,

    session_pool: Arc<ServerSessionPool>,

    is_implicit: bool,

    options: Option<SessionOptions>,

    /// Set at most once per session, by the first snapshot read.
    snapshot_timestamp: Option<Timestamp>,

    pub(crate) transaction: Transaction,

    closed: bool,
}

/// The transaction state carried by a session.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) pinned_server: Option<ServerAddress>,
    pub(crate) recovery_token: Option<Document>,
    pub(crate) context: Option<TransactionContext>,
}

impl Transaction {
    fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.recovery_token = None;
    }

    fn commit(&mut self) {
        self.state = TransactionState::Committed;
    }

    fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned_server = None;
        self.context = None;
    }

    fn reset(&mut self) {
        self.state = TransactionState::None;
        self.options = None;
        self.pinned_server = None;
        self.recovery_token = None;
        self.context = None;
    }
}

/// The lifecycle states of a transaction on a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransactionState {
    /// No transaction has been started.
    #[default]
    None,
    /// A transaction was started but no command has been sent in it yet.
    Starting,
    /// At least one command has been sent in the transaction.
    InProgress,
    /// The transaction was committed.
    Committed,
    /// The transaction was aborted.
    Aborted,
}

/// An opaque, reference-counted payload attached to a session for the
/// duration of a transaction. Higher layers use it to carry whatever routing
/// state follow-up transaction commands need; the session only retains and
/// releases it.
#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<dyn Any + Send + Sync>,
}

impl TransactionContext {
    /// Wraps a value in a counted handle.
    pub fn new(value: impl Any + Send + Sync) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Borrows the contained value, if it has the expected type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    /// The number of live handles to this context.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("references", &self.reference_count())
            .finish()
    }
}

impl ClientSession {
    /// Starts a session, acquiring a server session from the pool. Never
    /// blocks on the network.
    pub async fn start(
        session_pool: Arc<ServerSessionPool>,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Result<Self> {
        if let Some(ref options) = options {
            options.validate()?;
        }
        let server_session = session_pool.check_out().await;
        Ok(Self {
            cluster_time: None,
            operation_time: None,
            server_session: Some(server_session),
            session_pool,
            is_implicit,
            options,
            snapshot_timestamp: None,
            transaction: Transaction::default(),
            closed: false,
        })
    }

    /// The session's `lsid` document, or `None` once the session is closed.
    pub fn id(&self) -> Option<&Document> {
        self.server_session.as_ref().map(|s| s.id())
    }

    /// Whether the driver created this session on the application's behalf.
    pub fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// The options this session was started with.
    pub fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// Whether commands on this session assert causal consistency. Defaults
    /// to true except for snapshot sessions.
    pub fn causally_consistent(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|o| o.causal_consistency)
            .unwrap_or(!self.is_snapshot())
    }

    /// Whether reads on this session observe a single snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|o| o.snapshot)
            .unwrap_or(false)
    }

    /// The highest cluster time this session has seen.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Merges `to` into the session's cluster time, keeping the greater.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time.as_ref().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// The highest operation time this session has seen.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Merges `to` into the session's operation time, keeping the greater.
    pub fn advance_operation_time(&mut self, to: Timestamp) {
        let advance = match self.operation_time {
            Some(current) => (current.time, current.increment) < (to.time, to.increment),
            None => true,
        };
        if advance {
            self.operation_time = Some(to);
        }
    }

    /// The snapshot timestamp pinned by the first snapshot read, if any.
    pub fn snapshot_timestamp(&self) -> Option<Timestamp> {
        self.snapshot_timestamp
    }

    /// Pins the snapshot timestamp. A session's snapshot timestamp can be set
    /// only once; setting a different value is a client error.
    pub fn set_snapshot_timestamp(&mut self, timestamp: Timestamp) -> Result<()> {
        match self.snapshot_timestamp {
            Some(current) if current != timestamp => Err(ErrorKind::InvalidArgument {
                message: format!(
                    "session snapshot timestamp already set to {:?}, cannot change it to {:?}",
                    current, timestamp
                ),
            }
            .into()),
            _ => {
                self.snapshot_timestamp = Some(timestamp);
                Ok(())
            }
        }
    }

    /// The session's current transaction number.
    pub fn txn_number(&self) -> Option<i64> {
        self.server_session.as_ref().map(|s| s.txn_number())
    }

    /// Increments the transaction number, returning the new value.
    pub fn advance_transaction_number(&mut self) -> Result<i64> {
        self.active_server_session_mut()
            .map(ServerSession::advance_transaction_number)
    }

    /// Adds `count` to the statement counter, returning the new value.
    pub fn advance_statement_id(&mut self, count: i64) -> Result<i64> {
        self.active_server_session_mut()
            .map(|s| s.advance_statement_id(count))
    }

    fn active_server_session_mut(&mut self) -> Result<&mut ServerSession> {
        self.server_session.as_mut().ok_or_else(|| {
            ErrorKind::Internal {
                message: "attempted to use a closed session".to_string(),
            }
            .into()
        })
    }

    /// Marks the session (and its server session) dirty; the server session
    /// will be discarded rather than pooled.
    pub fn mark_dirty(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.mark_dirty();
        }
    }

    /// Whether this session observed a network error.
    pub fn is_dirty(&self) -> bool {
        self.server_session
            .as_ref()
            .map(|s| s.is_dirty())
            .unwrap_or(false)
    }

    /// Records that a command was just sent with this session; refreshes the
    /// TTL bookkeeping and moves a starting transaction into progress.
    pub fn notify_message_sent(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.update_last_use();
        }
        if self.transaction.state == TransactionState::Starting {
            self.transaction.state = TransactionState::InProgress;
        }
    }

    /// Whether a transaction is active (started or in progress).
    pub fn in_transaction(&self) -> bool {
        matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// The transaction's current state.
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction.state
    }

    /// Starts a transaction on this session. The given options are merged
    /// over the session's default transaction options.
    pub fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        if self.is_snapshot() {
            return Err(ErrorKind::Transaction {
                message: "transactions are not supported in snapshot sessions".to_string(),
            }
            .into());
        }
        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".to_string(),
                }
                .into());
            }
            TransactionState::Committed => {
                // A committed transaction leaves the session unpinned for the
                // next one.
                self.transaction.reset();
            }
            _ => {}
        }

        let options = options.into().or_else(|| {
            self.options
                .as_ref()
                .and_then(|o| o.default_transaction_options.clone())
        });

        if let Some(ref options) = options {
            if let Some(ref write_concern) = options.write_concern {
                if !write_concern.is_acknowledged() {
                    return Err(ErrorKind::Transaction {
                        message: "transactions do not support unacknowledged write concerns"
                            .to_string(),
                    }
                    .into());
                }
            }
        }

        self.advance_transaction_number()?;
        self.transaction.start(options);
        Ok(())
    }

    /// Transitions the transaction to committed. Dispatching the actual
    /// `commitTransaction` command is the caller's responsibility.
    pub fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot commit after calling abortTransaction".to_string(),
            }
            .into()),
            _ => {
                self.transaction.commit();
                Ok(())
            }
        }
    }

    /// Transitions the transaction to aborted, releasing the transaction
    /// context and unpinning. Dispatching the actual `abortTransaction`
    /// command is the caller's responsibility.
    pub fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Committed => Err(ErrorKind::Transaction {
                message: "cannot abort after calling commitTransaction".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot abort a transaction twice".to_string(),
            }
            .into()),
            _ => {
                self.transaction.abort();
                Ok(())
            }
        }
    }

    /// Pins the session to `address` and retains the given transaction
    /// context. Follow-up commands in the transaction must be routed to the
    /// pinned server.
    pub fn set_transaction_context(&mut self, address: ServerAddress, context: TransactionContext) {
        self.transaction.pinned_server = Some(address);
        self.transaction.context = Some(context);
    }

    /// The retained transaction context, if any.
    pub fn transaction_context(&self) -> Option<&TransactionContext> {
        self.transaction.context.as_ref()
    }

    /// The server this session's transaction is pinned to, if any.
    pub fn pinned_server(&self) -> Option<&ServerAddress> {
        self.transaction.pinned_server.as_ref()
    }

    /// Releases the transaction context and unpins the session.
    pub fn clear_transaction_context(&mut self) {
        self.transaction.pinned_server = None;
        self.transaction.context = None;
    }

    /// The opaque recovery token captured from transaction replies.
    pub fn recovery_token(&self) -> Option<&Document> {
        self.transaction.recovery_token.as_ref()
    }

    pub(crate) fn set_recovery_token(&mut self, token: Document) {
        self.transaction.recovery_token = Some(token);
    }

    /// The read concern commands dispatched with this session should carry,
    /// derived from snapshot and causal-consistency state.
    pub(crate) fn command_read_concern(&self) -> Option<ReadConcern> {
        if self.is_snapshot() {
            let mut concern = ReadConcern::snapshot();
            concern.at_cluster_time = self.snapshot_timestamp;
            Some(concern)
        } else if self.in_transaction() {
            self.transaction
                .options
                .as_ref()
                .and_then(|o| o.read_concern.clone())
        } else if self.causally_consistent() {
            self.operation_time.map(|operation_time| ReadConcern {
                level: None,
                at_cluster_time: None,
                after_cluster_time: Some(operation_time),
            })
        } else {
            None
        }
    }

    /// Closes the session: the transaction context is released and the server
    /// session goes back to its pool (where dirty sessions are discarded).
    /// Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.clear_transaction_context();
        if let Some(server_session) = self.server_session.take() {
            self.session_pool.check_in(server_session).await;
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(server_session) = self.server_session.take() {
            let pool = self.session_pool.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.check_in(server_session).await;
                });
            }
        }
    }
}
