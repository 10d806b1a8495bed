//! A blocking facade over the async core.
//!
//! The async implementation is the only state machine; these wrappers drive
//! it to completion on a shared runtime so synchronous callers get the same
//! pool, connection, and session behavior without duplicating any logic.

use std::{future::Future, sync::Arc, sync::LazyLock, time::Instant};

use crate::{
    auth::Credential,
    conn::{pooled::PooledConnection, Command, CommandResponse},
    error::Result,
    operation::OperationContext,
    options::{ServerAddress, SessionOptions},
    pool::{ConnectionPoolOptions, EstablisherOptions},
    session::{ClientSession, ServerSessionPool},
};

static RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to initialize the blocking-facade runtime")
});

fn block_on<F: Future>(future: F) -> F::Output {
    RUNTIME.block_on(future)
}

/// A blocking wrapper around [`crate::ConnectionPool`].
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: crate::ConnectionPool,
}

impl ConnectionPool {
    /// Creates a pool. See [`crate::ConnectionPool::new`].
    pub fn new(
        address: ServerAddress,
        establisher_options: EstablisherOptions,
        credential: Option<Credential>,
        options: Option<ConnectionPoolOptions>,
    ) -> Result<Self> {
        // The worker task must be spawned from within the runtime.
        let _guard = RUNTIME.enter();
        Ok(Self {
            inner: crate::ConnectionPool::new(address, establisher_options, credential, options)?,
        })
    }

    /// The async pool this wraps.
    pub fn async_pool(&self) -> &crate::ConnectionPool {
        &self.inner
    }

    /// Checks out a connection, blocking until one is available or the wait
    /// deadline passes.
    pub fn check_out(&self, deadline: Option<Instant>) -> Result<PooledConnection> {
        block_on(self.inner.check_out(deadline))
    }

    /// Increments the pool's generation. See [`crate::ConnectionPool::clear`].
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Shuts the pool down, blocking until it has quiesced.
    pub fn close(&self) {
        block_on(self.inner.close());
    }
}

/// A blocking wrapper around [`crate::CommandExecutor`].
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    inner: crate::CommandExecutor,
}

impl CommandExecutor {
    /// Wraps an async executor.
    pub fn new(inner: crate::CommandExecutor) -> Self {
        Self { inner }
    }

    /// Dispatches one command, blocking until its reply is decoded or the
    /// context's deadline interrupts it.
    pub fn execute(
        &self,
        cmd: Command,
        connection: &PooledConnection,
        ctx: &mut OperationContext<'_>,
    ) -> Result<CommandResponse> {
        block_on(self.inner.execute(cmd, connection, ctx))
    }
}

/// Starts a session against the given session pool, blocking on the (purely
/// in-process) acquisition.
pub fn start_session(
    session_pool: Arc<ServerSessionPool>,
    options: Option<SessionOptions>,
    is_implicit: bool,
) -> Result<ClientSession> {
    block_on(ClientSession::start(session_pool, options, is_implicit))
}

/// Closes a session, blocking until its server session has returned to the
/// pool.
pub fn close_session(mut session: ClientSession) {
    block_on(session.close());
}
