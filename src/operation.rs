//! The per-operation context threaded through every command dispatch.

use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::{Duration, Instant},
};

use crate::{options::ServerApi, session::ClientSession, ClusterClock};

static OPERATION_ID: AtomicI32 = AtomicI32::new(1);

fn next_operation_id() -> i32 {
    OPERATION_ID
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
            Some(if id == i32::MAX { 1 } else { id + 1 })
        })
        .unwrap_or(1)
}

/// Everything a single command dispatch carries besides the command itself:
/// the deadline, the session, the cluster-clock view, and the declared server
/// API. The deadline is consulted at every suspension point; expiry closes
/// the connection the operation is blocked on.
pub struct OperationContext<'a> {
    operation_id: i32,

    deadline: Option<Instant>,

    /// The session this operation runs under, if any.
    pub session: Option<&'a mut ClientSession>,

    clock: ClusterClock,

    server_api: Option<ServerApi>,
}

impl<'a> OperationContext<'a> {
    /// Creates a context observing the given cluster clock, with no deadline
    /// and no session.
    pub fn new(clock: ClusterClock) -> Self {
        Self {
            operation_id: next_operation_id(),
            deadline: None,
            session: None,
            clock,
            server_api: None,
        }
    }

    /// Bounds the operation by an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Bounds the operation by a timeout measured from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Associates a session with the operation.
    pub fn with_session(mut self, session: &'a mut ClientSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Declares a server API version for the operation.
    pub fn with_server_api(mut self, server_api: ServerApi) -> Self {
        self.server_api = Some(server_api);
        self
    }

    /// The driver-generated id tying together the events of this operation.
    pub fn operation_id(&self) -> i32 {
        self.operation_id
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining until the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }

    pub(crate) fn clock(&self) -> &ClusterClock {
        &self.clock
    }

    pub(crate) fn server_api(&self) -> Option<&ServerApi> {
        self.server_api.as_ref()
    }
}
