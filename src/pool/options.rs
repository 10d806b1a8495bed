use std::{sync::Arc, time::Duration};

use derive_where::derive_where;
use typed_builder::TypedBuilder;

use crate::event::pool::PoolEventHandler;

/// Options for configuring a [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Clone, Default, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The maximum number of connections the pool manages at one time,
    /// including connections currently checked out. Defaults to 10.
    pub max_size: Option<u32>,

    /// The minimum number of connections the pool keeps established.
    /// Maintenance opens new connections until this floor is met.
    pub min_size: Option<u32>,

    /// How long a checkout may wait for a connection before failing with a
    /// pool-timeout error. `None` waits indefinitely.
    pub max_wait_time: Option<Duration>,

    /// Connections older than this are closed rather than reused, regardless
    /// of activity. `None` disables lifetime pruning.
    pub max_connection_life_time: Option<Duration>,

    /// Connections idle in the pool longer than this are closed rather than
    /// reused. `None` disables idle pruning.
    pub max_connection_idle_time: Option<Duration>,

    /// How long after pool creation the first maintenance pass runs.
    pub maintenance_initial_delay: Option<Duration>,

    /// The interval between maintenance passes. Defaults to 500ms.
    pub maintenance_frequency: Option<Duration>,

    /// The maximum number of connections that may be establishing
    /// concurrently. Defaults to 2. While all open permits are held, parked
    /// checkouts make progress only through check-in hand-over.
    pub max_connecting: Option<u32>,

    /// Handler notified of pool and connection lifecycle events.
    #[derive_where(skip)]
    pub event_handler: Option<Arc<dyn PoolEventHandler>>,
}
