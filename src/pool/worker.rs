use std::{collections::VecDeque, time::Duration};

use tracing::{debug, warn};

use super::{
    establish::ConnectionEstablisher,
    manager,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    requester,
    requester::{ConnectionRequest, ConnectionRequestReceiver, ConnectionRequestResult},
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    ConnectionPoolOptions,
};
use crate::{
    auth::Credential,
    conn::pooled::PooledConnection,
    error::Error,
    event::pool::{ConnectionClosedEvent, ConnectionClosedReason, PoolClearedEvent,
        PoolClosedEvent, PoolEventEmitter},
    options::ServerAddress,
    runtime::{self, AcknowledgmentSender, WorkerHandleListener},
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;
const DEFAULT_MAX_CONNECTING: u32 = 2;
const DEFAULT_MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// The worker task that owns all shared state of a pool. The state machine is
/// single threaded: checkouts, check-ins, invalidation, and maintenance are
/// all processed by one task, with check-ins and other management requests
/// taking priority over new checkouts.
pub(super) struct ConnectionPoolWorker {
    address: ServerAddress,

    /// The total number of connections managed by the pool, including
    /// connections currently checked out or not yet established.
    total_connection_count: u32,

    /// The number of connections currently being established. Bounded by
    /// `max_connecting`.
    pending_connection_count: u32,

    /// The number of connections currently checked out for operations.
    /// Shutdown waits for this to reach zero.
    checked_out_count: u32,

    /// The ID assigned to the next connection created by the pool.
    next_connection_id: u32,

    /// The current generation. Incremented on invalidation; connections from
    /// earlier generations are discarded on sight.
    generation: u32,

    /// Established connections awaiting reuse, ordered oldest-available
    /// first. Checkout pops from the back (most recently used).
    available_connections: VecDeque<PooledConnection>,

    establisher: ConnectionEstablisher,

    credential: Option<Credential>,

    event_emitter: PoolEventEmitter,

    maintenance_initial_delay: Duration,

    maintenance_frequency: Duration,

    max_idle_time: Option<Duration>,

    max_life_time: Option<Duration>,

    min_pool_size: Option<u32>,

    max_pool_size: u32,

    max_connecting: u32,

    /// Resolves once every checkout requester has been dropped, at which
    /// point the worker shuts down.
    handle_listener: WorkerHandleListener,

    request_receiver: ConnectionRequestReceiver,

    /// Checkouts parked waiting for a connection, oldest first.
    wait_queue: VecDeque<ConnectionRequest>,

    management_receiver: ManagementRequestReceiver,

    generation_publisher: PoolGenerationPublisher,

    manager: PoolManager,

    /// Set once an explicit shutdown request arrives.
    shutting_down: bool,

    shutdown_ack: Option<AcknowledgmentSender<()>>,
}

impl ConnectionPoolWorker {
    /// Starts a worker, returning the handles used to talk to it. The worker
    /// runs until all requesters are dropped or it is explicitly shut down.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        credential: Option<Credential>,
        event_emitter: PoolEventEmitter,
        options: Option<&ConnectionPoolOptions>,
    ) -> (
        PoolManager,
        requester::ConnectionRequester,
        PoolGenerationSubscriber,
    ) {
        // A zero idle time means connections are never closed for idleness.
        let mut max_idle_time = options.and_then(|opts| opts.max_connection_idle_time);
        if max_idle_time == Some(Duration::ZERO) {
            max_idle_time = None;
        }
        let mut max_life_time = options.and_then(|opts| opts.max_connection_life_time);
        if max_life_time == Some(Duration::ZERO) {
            max_life_time = None;
        }

        let max_pool_size = options
            .and_then(|opts| opts.max_size)
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let max_connecting = options
            .and_then(|opts| opts.max_connecting)
            .unwrap_or(DEFAULT_MAX_CONNECTING);
        let min_pool_size = options.and_then(|opts| opts.min_size);
        let maintenance_frequency = options
            .and_then(|opts| opts.maintenance_frequency)
            .unwrap_or(DEFAULT_MAINTENANCE_FREQUENCY);
        let maintenance_initial_delay = options
            .and_then(|opts| opts.maintenance_initial_delay)
            .unwrap_or(maintenance_frequency);

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = requester::channel(handle);
        let (manager, management_receiver) = manager::channel();
        let (generation_publisher, generation_subscriber) = status::channel();

        let worker = ConnectionPoolWorker {
            address,
            total_connection_count: 0,
            pending_connection_count: 0,
            checked_out_count: 0,
            next_connection_id: 1,
            generation: 0,
            available_connections: VecDeque::new(),
            establisher,
            credential,
            event_emitter,
            maintenance_initial_delay,
            maintenance_frequency,
            max_idle_time,
            max_life_time,
            min_pool_size,
            max_pool_size,
            max_connecting,
            handle_listener,
            request_receiver,
            wait_queue: VecDeque::new(),
            management_receiver,
            generation_publisher,
            manager: manager.clone(),
            shutting_down: false,
            shutdown_ack: None,
        };

        runtime::spawn(async move {
            worker.execute().await;
        });

        (manager, connection_requester, generation_subscriber)
    }

    async fn execute(mut self) {
        let mut maintenance_interval =
            runtime::interval(self.maintenance_initial_delay, self.maintenance_frequency);

        loop {
            let task = tokio::select! {
                // Poll in order: check-ins, invalidation, and shutdown always
                // take priority over checkout requests, and the pool exiting
                // takes priority over everything.
                biased;

                Some(request) = self.management_receiver.recv() => {
                    PoolTask::Management(request)
                },
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    // No requesters remain, so no new checkouts can arrive.
                    break;
                },
                Some(request) = self.request_receiver.recv(), if !self.shutting_down => {
                    PoolTask::CheckOut(request)
                },
                _ = maintenance_interval.tick(), if !self.shutting_down => {
                    PoolTask::Maintenance
                },
                else => break,
            };

            match task {
                PoolTask::CheckOut(request) => {
                    self.wait_queue.push_back(request);
                }
                PoolTask::Management(request) => match request {
                    PoolManagementRequest::CheckIn(connection) => {
                        self.check_in(*connection);
                    }
                    PoolManagementRequest::Clear => {
                        self.clear();
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(result) => {
                        self.handle_connection_succeeded(result);
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed();
                    }
                    PoolManagementRequest::Shutdown(message) => {
                        let ((), ack) = message.into_parts();
                        self.begin_shutdown(ack);
                    }
                },
                PoolTask::Maintenance => {
                    self.perform_maintenance();
                }
            }

            while self.can_service_connection_request() {
                match self.wait_queue.pop_front() {
                    Some(request) => self.check_out(request),
                    None => break,
                }
            }

            if self.shutting_down && self.checked_out_count == 0 {
                break;
            }
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        debug!(address = %self.address, "connection pool closed");

        if let Some(ack) = self.shutdown_ack.take() {
            ack.acknowledge(());
        }
    }

    fn below_max_connections(&self) -> bool {
        self.total_connection_count < self.max_pool_size
    }

    fn can_service_connection_request(&self) -> bool {
        if self.shutting_down {
            return false;
        }

        if !self.available_connections.is_empty() {
            return true;
        }

        self.below_max_connections() && self.pending_connection_count < self.max_connecting
    }

    fn check_out(&mut self, request: ConnectionRequest) {
        // Reuse the most recently used available connection.
        while let Some(mut conn) = self.available_connections.pop_back() {
            if conn.is_stale(self.generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
                continue;
            }

            if conn.is_expired(self.max_life_time) {
                self.close_connection(conn, ConnectionClosedReason::Expired);
                continue;
            }

            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn, ConnectionClosedReason::Idle);
                continue;
            }

            conn.mark_checked_out(self.manager.clone());
            self.checked_out_count += 1;

            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // The checking-out task stopped listening, meaning it hit its
                // wait deadline; the connection goes back into the pool.
                let mut connection = result.unwrap_pooled_connection();
                connection.mark_checked_in();
                self.checked_out_count -= 1;
                self.available_connections.push_back(connection);
            }

            return;
        }

        // No warm connection; open a new one for this request.
        if self.below_max_connections() && self.pending_connection_count < self.max_connecting {
            let event_emitter = self.event_emitter.clone();
            let establisher = self.establisher.clone();
            let pending_connection = self.create_pending_connection();
            let manager = self.manager.clone();
            let credential = self.credential.clone();

            let handle = runtime::spawn(async move {
                let connection_id = pending_connection.id;
                let address = pending_connection.address.clone();

                match establisher
                    .establish_connection(pending_connection, credential.as_ref())
                    .await
                {
                    Err(error) => {
                        warn!(
                            address = %address,
                            connection_id,
                            error = %error,
                            "connection establishment failed",
                        );
                        event_emitter.emit_event(|| {
                            ConnectionClosedEvent {
                                address,
                                connection_id,
                                reason: ConnectionClosedReason::Error,
                            }
                            .into()
                        });
                        manager.handle_connection_failed();
                        Err(error)
                    }
                    Ok(mut connection) => {
                        event_emitter.emit_event(|| connection.ready_event().into());
                        connection.mark_checked_out(manager.clone());
                        manager.handle_connection_succeeded(ConnectionSucceeded::Used);
                        Ok(connection)
                    }
                }
            });

            // This only fails if the requester stopped listening, in which
            // case the connection finishes establishing in the background and
            // is checked in by its drop implementation.
            let _: std::result::Result<_, _> =
                request.fulfill(ConnectionRequestResult::Establishing(handle));
        } else {
            // Capacity was exhausted between servicing and here; park the
            // request back at the front so it stays oldest.
            self.wait_queue.push_front(request);
        }
    }

    fn create_pending_connection(&mut self) -> crate::conn::PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = crate::conn::PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation,
            event_emitter: self.event_emitter.clone(),
            time_created: std::time::Instant::now(),
        };
        self.next_connection_id += 1;
        self.event_emitter
            .emit_event(|| pending_connection.created_event().into());

        pending_connection
    }

    fn handle_connection_failed(&mut self) {
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    fn handle_connection_succeeded(&mut self, result: ConnectionSucceeded) {
        self.pending_connection_count -= 1;
        match result {
            ConnectionSucceeded::Used => {
                self.checked_out_count += 1;
            }
            ConnectionSucceeded::ForPool(connection) => {
                let mut connection = *connection;
                connection.mark_checked_in();
                self.available_connections.push_back(connection);
            }
        }
    }

    fn check_in(&mut self, mut conn: PooledConnection) {
        self.event_emitter
            .emit_event(|| conn.checked_in_event().into());

        conn.mark_checked_in();
        self.checked_out_count = self.checked_out_count.saturating_sub(1);

        if conn.has_errored() || conn.is_closed() {
            self.close_connection(conn, ConnectionClosedReason::Error);
        } else if conn.is_stale(self.generation) {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else if conn.is_streaming() || conn.has_outstanding_requests() {
            self.close_connection(conn, ConnectionClosedReason::Dropped);
        } else if self.shutting_down {
            self.close_connection(conn, ConnectionClosedReason::PoolClosed);
        } else if let Some(request) = self.wait_queue.pop_front() {
            // Hand the connection directly to the oldest waiter, bypassing
            // the idle queue. When every open permit is held, this is the only
            // path by which parked checkouts make progress.
            conn.mark_checked_out(self.manager.clone());
            self.checked_out_count += 1;
            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                let mut connection = result.unwrap_pooled_connection();
                connection.mark_checked_in();
                self.checked_out_count -= 1;
                self.available_connections.push_back(connection);
            }
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self) {
        self.generation += 1;
        self.generation_publisher.publish(self.generation);

        debug!(
            address = %self.address,
            generation = self.generation,
            "connection pool cleared",
        );

        self.event_emitter.emit_event(|| {
            PoolClearedEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn begin_shutdown(&mut self, ack: AcknowledgmentSender<()>) {
        self.shutting_down = true;
        self.shutdown_ack = Some(ack);

        let waiters: Vec<_> = self.wait_queue.drain(..).collect();
        for request in waiters {
            // An error means the waiter hung up, which is fine since we were
            // failing it anyway.
            let _: std::result::Result<_, _> = request.fulfill(
                ConnectionRequestResult::Closed(Error::pool_closed(&self.address)),
            );
        }

        while let Some(connection) = self.available_connections.pop_front() {
            self.close_connection(connection, ConnectionClosedReason::PoolClosed);
        }
    }

    /// Close a connection, emit the event for it, and decrement the total
    /// connection count.
    fn close_connection(&mut self, connection: PooledConnection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    /// Ensure all pooled connections are still usable and that the pool
    /// manages at least `min_size` connections.
    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        self.ensure_min_connections();
    }

    /// Remove connections from the idle queue that are stale, expired, or
    /// idle. The queue is ordered by availability time, so pruning stops at
    /// the first connection that is neither expired nor idle.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.is_stale(self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_expired(self.max_life_time) {
                self.close_connection(connection, ConnectionClosedReason::Expired);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else {
                self.available_connections.push_front(connection);
                break;
            }
        }
    }

    /// Open connections until the pool manages `min_size`, bounded by the
    /// `max_connecting` open permits.
    fn ensure_min_connections(&mut self) {
        if let Some(min_pool_size) = self.min_pool_size {
            while self.total_connection_count < min_pool_size
                && self.pending_connection_count < self.max_connecting
            {
                let pending_connection = self.create_pending_connection();
                let event_emitter = self.event_emitter.clone();
                let manager = self.manager.clone();
                let establisher = self.establisher.clone();
                let credential = self.credential.clone();

                runtime::spawn(async move {
                    let connection_id = pending_connection.id;
                    let address = pending_connection.address.clone();

                    match establisher
                        .establish_connection(pending_connection, credential.as_ref())
                        .await
                    {
                        Ok(connection) => {
                            event_emitter.emit_event(|| connection.ready_event().into());
                            manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(
                                Box::new(connection),
                            ));
                        }
                        Err(error) => {
                            debug!(
                                address = %address,
                                connection_id,
                                error = %error,
                                "maintenance connection establishment failed",
                            );
                            event_emitter.emit_event(|| {
                                ConnectionClosedEvent {
                                    address,
                                    connection_id,
                                    reason: ConnectionClosedReason::Error,
                                }
                                .into()
                            });
                            manager.handle_connection_failed();
                        }
                    }
                });
            }
        }
    }
}

/// A unit of work processed by the worker loop.
enum PoolTask {
    Management(PoolManagementRequest),
    CheckOut(ConnectionRequest),
    Maintenance,
}
