pub(crate) mod establish;
mod manager;
mod options;
mod requester;
mod status;
#[cfg(test)]
mod test;
mod worker;

use std::time::{Duration, Instant};

use derive_where::derive_where;

pub use self::{establish::EstablisherOptions, options::ConnectionPoolOptions,
    status::PoolGenerationSubscriber};
pub(crate) use self::manager::PoolManager;
use self::{
    establish::ConnectionEstablisher,
    requester::{ConnectionRequester, ConnectionRequestResult},
    worker::ConnectionPoolWorker,
};
use crate::{
    auth::Credential,
    conn::pooled::PooledConnection,
    error::{Error, Result},
    event::pool::{
        ConnectionCheckoutFailedEvent, ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent, PoolCreatedEvent, PoolEventEmitter,
    },
    options::ServerAddress,
};

/// A bounded pool of connections to one server.
///
/// All state lives in a worker task; this handle talks to it over channels and
/// can be cloned cheaply. The pool shuts down when every handle is dropped or
/// when [`close`](ConnectionPool::close) is called explicitly.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct ConnectionPool {
    address: ServerAddress,

    manager: PoolManager,

    connection_requester: ConnectionRequester,

    generation_subscriber: PoolGenerationSubscriber,

    #[derive_where(skip)]
    event_emitter: PoolEventEmitter,

    max_wait_time: Option<Duration>,
}

impl ConnectionPool {
    /// Creates a pool for the given server address. Connections authenticate
    /// with `credential` when one is supplied.
    pub fn new(
        address: ServerAddress,
        establisher_options: EstablisherOptions,
        credential: Option<Credential>,
        options: Option<ConnectionPoolOptions>,
    ) -> Result<Self> {
        let establisher = ConnectionEstablisher::new(establisher_options)?;
        Ok(Self::new_inner(address, establisher, credential, options))
    }

    pub(crate) fn new_inner(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        credential: Option<Credential>,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let event_emitter =
            PoolEventEmitter::new(options.as_ref().and_then(|o| o.event_handler.clone()));
        let max_wait_time = options.as_ref().and_then(|o| o.max_wait_time);

        let (manager, connection_requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            establisher,
            credential,
            event_emitter.clone(),
            options.as_ref(),
        );

        event_emitter.emit_event(|| {
            PoolCreatedEvent {
                address: address.clone(),
                options,
            }
            .into()
        });

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            event_emitter,
            max_wait_time,
        }
    }

    /// The address this pool's connections connect to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Checks a connection out of the pool, waiting until one is available,
    /// handed over, or newly established. The wait is bounded by the pool's
    /// `max_wait_time` and by `deadline`, whichever comes first; expiry fails
    /// with a pool-timeout error and has no effect on other checkouts.
    pub async fn check_out(&self, deadline: Option<Instant>) -> Result<PooledConnection> {
        let time_started = Instant::now();
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let wait_deadline = self.max_wait_time.map(|wait| time_started + wait);
        let effective_deadline = match (wait_deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let result = match effective_deadline {
            Some(effective_deadline) => {
                let remaining = effective_deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, self.acquire_connection()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::pool_timeout(&self.address)),
                }
            }
            None => self.acquire_connection().await,
        };

        match result {
            Ok(connection) => {
                self.event_emitter
                    .emit_event(|| connection.checked_out_event(time_started).into());
                Ok(connection)
            }
            Err(error) => {
                let reason = if error.is_pool_timeout() {
                    ConnectionCheckoutFailedReason::Timeout
                } else if matches!(*error.kind, crate::error::ErrorKind::PoolClosed { .. }) {
                    ConnectionCheckoutFailedReason::PoolClosed
                } else {
                    ConnectionCheckoutFailedReason::ConnectionError
                };
                self.event_emitter.emit_event(|| {
                    ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                        duration: Instant::now() - time_started,
                    }
                    .into()
                });
                Err(error)
            }
        }
    }

    async fn acquire_connection(&self) -> Result<PooledConnection> {
        match self.connection_requester.request().await {
            Some(ConnectionRequestResult::Pooled(connection)) => Ok(*connection),
            Some(ConnectionRequestResult::Establishing(handle)) => handle.await?,
            Some(ConnectionRequestResult::Closed(error)) => Err(error),
            None => Err(Error::pool_closed(&self.address)),
        }
    }

    /// Increments the pool's generation. Checked-in connections from earlier
    /// generations are discarded on their next touch; in-flight connections
    /// are not interrupted but will be discarded at check-in.
    pub fn clear(&self) {
        self.manager.clear();
    }

    /// A subscriber for observing generation changes.
    pub fn generation_subscriber(&self) -> PoolGenerationSubscriber {
        self.generation_subscriber.clone()
    }

    /// Shuts the pool down: parked checkouts fail, available connections are
    /// closed, and the call returns once every checked-out connection has
    /// been returned.
    pub async fn close(&self) {
        self.manager
            .shutdown()
            .wait_for_acknowledgment()
            .await;
    }
}
