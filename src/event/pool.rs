//! Events describing the behavior of connection pools and the connections
//! they manage.

use std::{sync::Arc, time::Duration};

use derive_where::derive_where;

use crate::{options::ServerAddress, pool::ConnectionPoolOptions};

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server the pool's connections will connect to.
    pub address: ServerAddress,

    /// The options the pool was created with.
    pub options: Option<ConnectionPoolOptions>,
}

/// Event emitted when a connection pool is invalidated, marking all of its
/// current connections stale.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server the pool's connections connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server the pool's connections connected to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created. Creation precedes the TCP
/// connect; the connection is not usable until its ready event.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// Event emitted when a connection finishes its handshake and authentication
/// and becomes usable.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time between the connection's creation and it becoming ready.
    pub duration: Duration,
}

/// The reasons a connection may be closed by its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection sat idle in the pool longer than the configured maximum
    /// idle time.
    Idle,

    /// The connection outlived the configured maximum connection lifetime.
    Expired,

    /// The connection belongs to an older generation than the pool.
    Stale,

    /// The connection observed an error on its stream.
    Error,

    /// The connection was returned in an unusable state (e.g. with replies
    /// still outstanding).
    Dropped,

    /// The pool the connection belongs to was closed.
    PoolClosed,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// Why the connection was closed.
    pub reason: ConnectionClosedReason,
}

/// Event emitted when a thread begins checking out a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server the checkout targets.
    pub address: ServerAddress,
}

/// The reasons a checkout attempt can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The wait deadline elapsed before a connection became available.
    Timeout,

    /// Establishing a new connection failed.
    ConnectionError,

    /// The pool was closed before the checkout could complete.
    PoolClosed,
}

/// Event emitted when a checkout attempt fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server the checkout targeted.
    pub address: ServerAddress,

    /// Why the checkout failed.
    pub reason: ConnectionCheckoutFailedReason,

    /// How long the checkout attempt ran before failing.
    pub duration: Duration,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// How long the checkout took.
    pub duration: Duration,
}

/// Event emitted when a connection is checked back into its pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// The aggregate of every pool-related event.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PoolEvent {
    /// See [`PoolCreatedEvent`].
    PoolCreated(PoolCreatedEvent),
    /// See [`PoolClearedEvent`].
    PoolCleared(PoolClearedEvent),
    /// See [`PoolClosedEvent`].
    PoolClosed(PoolClosedEvent),
    /// See [`ConnectionCreatedEvent`].
    ConnectionCreated(ConnectionCreatedEvent),
    /// See [`ConnectionReadyEvent`].
    ConnectionReady(ConnectionReadyEvent),
    /// See [`ConnectionClosedEvent`].
    ConnectionClosed(ConnectionClosedEvent),
    /// See [`ConnectionCheckoutStartedEvent`].
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    /// See [`ConnectionCheckoutFailedEvent`].
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    /// See [`ConnectionCheckedOutEvent`].
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    /// See [`ConnectionCheckedInEvent`].
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

macro_rules! pool_event_from {
    ($variant:ident, $event:ty) => {
        impl From<$event> for PoolEvent {
            fn from(event: $event) -> Self {
                PoolEvent::$variant(event)
            }
        }
    };
}

pool_event_from!(PoolCreated, PoolCreatedEvent);
pool_event_from!(PoolCleared, PoolClearedEvent);
pool_event_from!(PoolClosed, PoolClosedEvent);
pool_event_from!(ConnectionCreated, ConnectionCreatedEvent);
pool_event_from!(ConnectionReady, ConnectionReadyEvent);
pool_event_from!(ConnectionClosed, ConnectionClosedEvent);
pool_event_from!(ConnectionCheckoutStarted, ConnectionCheckoutStartedEvent);
pool_event_from!(ConnectionCheckoutFailed, ConnectionCheckoutFailedEvent);
pool_event_from!(ConnectionCheckedOut, ConnectionCheckedOutEvent);
pool_event_from!(ConnectionCheckedIn, ConnectionCheckedInEvent);

/// Applications implement this trait to observe pool behavior.
pub trait PoolEventHandler: Send + Sync {
    /// Called for every pool-related event.
    fn handle_pool_event(&self, _event: PoolEvent) {}
}

/// Fans pool events out to the registered handler, if any.
#[derive(Clone, Default)]
#[derive_where(Debug)]
pub(crate) struct PoolEventEmitter {
    #[derive_where(skip)]
    handler: Option<Arc<dyn PoolEventHandler>>,
}

impl PoolEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn PoolEventHandler>>) -> Self {
        Self { handler }
    }

    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> PoolEvent) {
        if let Some(ref handler) = self.handler {
            handler.handle_pool_event(generate_event());
        }
    }
}
