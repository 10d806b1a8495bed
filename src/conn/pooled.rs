use std::{
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, Mutex};

use super::{ConnectionInfo, InternalConnection, PendingConnection};
use crate::{
    error::{Error, Result},
    event::pool::{
        ConnectionCheckedInEvent, ConnectionCheckedOutEvent, ConnectionClosedEvent,
        ConnectionClosedReason, ConnectionReadyEvent, PoolEventEmitter,
    },
    pool::PoolManager,
    runtime::AsyncStream,
};

/// A connection that belongs to a connection pool. Dereferences to
/// [`InternalConnection`]; dropping a checked-out handle returns the
/// connection to its pool.
#[derive(Debug)]
pub struct PooledConnection {
    connection: InternalConnection,

    event_emitter: PoolEventEmitter,

    state: PooledConnectionState,
}

/// The pool-side state of a connection.
#[derive(Debug)]
enum PooledConnectionState {
    /// The connection is sitting in the pool's idle queue.
    CheckedIn { available_time: Instant },

    /// The connection is checked out for an operation.
    CheckedOut { pool_manager: PoolManager },

    /// The connection is pinned to a transaction or cursor and cycles between
    /// its pinner and operations rather than through the pool.
    Pinned {
        pinned_state: PinnedState,
        pool_manager: PoolManager,
    },
}

#[derive(Clone, Debug)]
enum PinnedState {
    /// The pinned connection is currently in use by an operation. Dropping it
    /// sends it back to the pinner.
    InUse {
        pinned_sender: mpsc::Sender<PooledConnection>,
    },

    /// The pinned connection is parked with its pinner.
    Returned { returned_time: Instant },
}

impl Deref for PooledConnection {
    type Target = InternalConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl PooledConnection {
    /// Creates a new pooled connection in the checked-in state.
    pub(crate) fn new(pending: PendingConnection, stream: AsyncStream) -> Self {
        let event_emitter = pending.event_emitter.clone();
        Self {
            connection: InternalConnection::new(pending, stream),
            event_emitter,
            state: PooledConnectionState::CheckedIn {
                available_time: Instant::now(),
            },
        }
    }

    /// A test-only connection with no live socket behind it.
    #[cfg(test)]
    pub(crate) fn new_testing(pending: PendingConnection) -> Self {
        let address = pending.address.clone();
        let conn = Self::new(pending, AsyncStream::Null);
        conn.connection
            .mark_opened(super::ConnectionDescription::new_testing(address));
        conn
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        self.connection.info()
    }

    /// Marks the connection as checked into the pool, recording the time it
    /// became available for idleness tracking.
    pub(crate) fn mark_checked_in(&mut self) {
        if !matches!(self.state, PooledConnectionState::CheckedIn { .. }) {
            let available_time = match self.state {
                PooledConnectionState::Pinned {
                    pinned_state: PinnedState::Returned { returned_time },
                    ..
                } => returned_time,
                _ => Instant::now(),
            };
            self.state = PooledConnectionState::CheckedIn { available_time };
        }
    }

    /// Marks the connection as checked out of the pool, attaching the manager
    /// used to return it on drop.
    pub(crate) fn mark_checked_out(&mut self, pool_manager: PoolManager) {
        self.state = PooledConnectionState::CheckedOut { pool_manager };
    }

    /// Whether the connection has been sitting available longer than
    /// `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        let Some(max_idle_time) = max_idle_time else {
            return false;
        };
        let available_time = match self.state {
            PooledConnectionState::CheckedIn { available_time } => available_time,
            PooledConnectionState::Pinned {
                pinned_state: PinnedState::Returned { returned_time },
                ..
            } => returned_time,
            _ => return false,
        };
        Instant::now().duration_since(available_time) >= max_idle_time
    }

    /// Whether the connection has outlived `max_life_time`.
    pub(crate) fn is_expired(&self, max_life_time: Option<Duration>) -> bool {
        match max_life_time {
            Some(max_life_time) => self.time_created.elapsed() >= max_life_time,
            None => false,
        }
    }

    /// Whether the connection was created under an older pool generation.
    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Pins the connection, returning a handle its pinner can use to retrieve
    /// it once the current operation drops it.
    pub(crate) fn pin(&mut self) -> Result<PinnedConnectionHandle> {
        let receiver = match &mut self.state {
            PooledConnectionState::CheckedIn { .. } => {
                return Err(Error::internal(format!(
                    "cannot pin a checked-in connection (id = {})",
                    self.id
                )))
            }
            PooledConnectionState::CheckedOut { pool_manager } => {
                let (sender, receiver) = mpsc::channel(1);
                self.state = PooledConnectionState::Pinned {
                    pinned_state: PinnedState::InUse {
                        pinned_sender: sender,
                    },
                    pool_manager: pool_manager.clone(),
                };
                receiver
            }
            PooledConnectionState::Pinned { pinned_state, .. } => match pinned_state {
                PinnedState::InUse { .. } => {
                    return Err(Error::internal(format!(
                        "cannot pin an already-pinned connection (id = {})",
                        self.id
                    )))
                }
                PinnedState::Returned { .. } => {
                    let (sender, receiver) = mpsc::channel(1);
                    *pinned_state = PinnedState::InUse {
                        pinned_sender: sender,
                    };
                    receiver
                }
            },
        };
        Ok(PinnedConnectionHandle {
            id: self.id,
            receiver: Arc::new(Mutex::new(receiver)),
        })
    }

    /// Moves the inner connection into a fresh handle with the given state,
    /// leaving a closed placeholder behind. Used by the drop path, which only
    /// has `&mut self`.
    fn take(&mut self, new_state: PooledConnectionState) -> PooledConnection {
        let placeholder = InternalConnection::new(
            PendingConnection {
                id: self.connection.id,
                address: self.connection.address.clone(),
                generation: self.connection.generation,
                event_emitter: self.event_emitter.clone(),
                time_created: self.connection.time_created,
            },
            AsyncStream::Null,
        );
        placeholder.close();
        PooledConnection {
            connection: std::mem::replace(&mut self.connection, placeholder),
            event_emitter: self.event_emitter.clone(),
            state: new_state,
        }
    }

    /// Closes the underlying connection and emits a closed event with the
    /// supplied reason.
    pub(crate) fn close_and_drop(self, reason: ConnectionClosedReason) {
        self.connection.close();
        self.emit_closed_event(reason);
    }

    pub(crate) fn emit_closed_event(&self, reason: ConnectionClosedReason) {
        self.event_emitter.emit_event(|| {
            ConnectionClosedEvent {
                address: self.connection.address.clone(),
                connection_id: self.connection.id,
                reason,
            }
            .into()
        });
    }

    pub(crate) fn checked_out_event(&self, time_started: Instant) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            duration: Instant::now() - time_started,
        }
    }

    pub(crate) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
        }
    }

    pub(crate) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            duration: Instant::now() - self.connection.time_created,
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let result = match &self.state {
            // A checked-in connection is owned by the pool; nothing to do.
            PooledConnectionState::CheckedIn { .. } => Ok(()),
            // A checked-out connection is returned to its pool.
            PooledConnectionState::CheckedOut { pool_manager } => {
                let pool_manager = pool_manager.clone();
                let dropped = self.take(PooledConnectionState::CheckedIn {
                    available_time: Instant::now(),
                });
                pool_manager.check_in(dropped)
            }
            // A pinned connection goes back to its pinner; if the pinner is
            // gone, it goes back to the pool.
            PooledConnectionState::Pinned {
                pinned_state,
                pool_manager,
            } => {
                let pool_manager = pool_manager.clone();
                match pinned_state {
                    PinnedState::InUse { pinned_sender } => {
                        let pinned_sender = pinned_sender.clone();
                        let dropped = self.take(PooledConnectionState::Pinned {
                            pinned_state: PinnedState::Returned {
                                returned_time: Instant::now(),
                            },
                            pool_manager: pool_manager.clone(),
                        });
                        match pinned_sender.try_send(dropped) {
                            Ok(()) => Ok(()),
                            // The pinner hung up; check the connection back in.
                            Err(mpsc::error::TrySendError::Closed(mut conn)) => {
                                conn.mark_checked_in();
                                pool_manager.check_in(conn)
                            }
                            // The pin buffer already holds a connection. This
                            // cannot happen outside a driver bug; recover by
                            // returning the connection to the pool.
                            Err(mpsc::error::TrySendError::Full(mut conn)) => {
                                debug_assert!(false, "pinned connection buffer full");
                                conn.mark_checked_in();
                                pool_manager.check_in(conn)
                            }
                        }
                    }
                    PinnedState::Returned { .. } => {
                        pool_manager.check_in(self.take(PooledConnectionState::CheckedIn {
                            available_time: Instant::now(),
                        }))
                    }
                }
            }
        };

        // Check-in failed because the pool has shut down; close the connection
        // here and account for it with an event.
        if let Err(mut returned) = result {
            returned.mark_checked_in();
            returned.connection.close();
            returned.emit_closed_event(ConnectionClosedReason::PoolClosed);
        }
    }
}

/// A handle to a pinned connection. The connection itself is retrieved (or
/// allowed to return to the pool) through this handle.
#[derive(Debug)]
pub(crate) struct PinnedConnectionHandle {
    id: u32,
    receiver: Arc<Mutex<mpsc::Receiver<PooledConnection>>>,
}

impl PinnedConnectionHandle {
    /// Makes a new handle referring to the same pinned connection. Use only
    /// when lending the handle in a way a normal borrow cannot express.
    pub(crate) fn replicate(&self) -> Self {
        Self {
            id: self.id,
            receiver: self.receiver.clone(),
        }
    }

    /// Retrieves the pinned connection, waiting until the operation currently
    /// using it finishes. Fails if the connection has been unpinned.
    pub(crate) async fn take_connection(&self) -> Result<PooledConnection> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or_else(|| {
            Error::internal(format!(
                "cannot take connection after unpin (id = {})",
                self.id
            ))
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}
