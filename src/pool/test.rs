use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::future::join_all;

use super::{establish::ConnectionEstablisher, ConnectionPool, ConnectionPoolOptions};
use crate::{
    conn::pooled::PooledConnection,
    error::ErrorKind,
    options::ServerAddress,
};

struct MockFactory {
    /// Completed establishments.
    created: Arc<AtomicU32>,
    /// While set, establishment parks indefinitely.
    hang: Arc<AtomicBool>,
}

impl MockFactory {
    fn new() -> Self {
        Self {
            created: Arc::new(AtomicU32::new(0)),
            hang: Arc::new(AtomicBool::new(false)),
        }
    }

    fn establisher(&self) -> ConnectionEstablisher {
        let created = self.created.clone();
        let hang = self.hang.clone();
        ConnectionEstablisher::new_mocked(Arc::new(move |pending| {
            let created = created.clone();
            let hang = hang.clone();
            Box::pin(async move {
                if hang.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                created.fetch_add(1, Ordering::SeqCst);
                Ok(PooledConnection::new_testing(pending))
            })
        }))
    }

    fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

fn address() -> ServerAddress {
    ServerAddress::new("pool.test", 27017)
}

fn pool_with(factory: &MockFactory, options: ConnectionPoolOptions) -> ConnectionPool {
    ConnectionPool::new_inner(address(), factory.establisher(), None, Some(options))
}

/// With every open permit parked indefinitely, hand-over from check-ins is
/// the only path to progress, and it must serve every parked checkout within
/// the wait deadline without creating new connections.
#[tokio::test]
async fn hand_over_makes_progress_while_open_permits_are_exhausted() {
    let factory = MockFactory::new();
    let pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder()
            .max_size(Some(7))
            .max_connecting(Some(2))
            .max_wait_time(Some(Duration::from_secs(5)))
            .build(),
    );

    // Warm up five connections.
    let mut warm = Vec::new();
    for _ in 0..5 {
        warm.push(pool.check_out(None).await.unwrap());
    }
    assert_eq!(factory.created(), 5);

    // Park both open permits on establishments that never finish.
    factory.hang.store(true, Ordering::SeqCst);
    let parked_opens: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.check_out(None).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Five more checkouts can only be satisfied by hand-over.
    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.check_out(None).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    for conn in warm.drain(..) {
        drop(conn);
    }

    let start = Instant::now();
    for waiter in waiters {
        let conn = waiter.await.unwrap().unwrap();
        assert!(conn.id <= 5, "hand-over delivered a new connection");
    }
    assert!(start.elapsed() < Duration::from_secs(5));

    // No establishment completed beyond the original five.
    assert_eq!(factory.created(), 5);

    for parked in parked_opens {
        parked.abort();
    }
}

/// Invalidation bumps the generation; both old-generation connections are
/// discarded at check-in and the next checkout opens a new-generation one.
#[tokio::test]
async fn invalidation_discards_prior_generation_connections() {
    let factory = MockFactory::new();
    let pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder().max_size(Some(5)).build(),
    );

    let first = pool.check_out(None).await.unwrap();
    let second = pool.check_out(None).await.unwrap();
    assert_eq!(first.generation, 0);
    assert_eq!(second.generation, 0);

    let mut subscriber = pool.generation_subscriber();
    pool.clear();
    assert_eq!(
        subscriber
            .wait_for_generation_change(Duration::from_secs(1))
            .await,
        Some(1)
    );

    drop(first);
    drop(second);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fresh = pool.check_out(None).await.unwrap();
    assert_eq!(fresh.generation, 1);
    assert_eq!(factory.created(), 3);
}

/// An idle connection is pruned by maintenance, so the next checkout creates
/// a fresh one.
#[tokio::test]
async fn maintenance_prunes_idle_connections() {
    let factory = MockFactory::new();
    let pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder()
            .max_size(Some(5))
            .max_connection_idle_time(Some(Duration::from_millis(50)))
            .maintenance_initial_delay(Some(Duration::from_millis(10)))
            .maintenance_frequency(Some(Duration::from_millis(10)))
            .build(),
    );

    let conn = pool.check_out(None).await.unwrap();
    let first_id = conn.id;
    drop(conn);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let conn = pool.check_out(None).await.unwrap();
    assert_ne!(conn.id, first_id);
    assert!(factory.created() >= 2);
}

/// Lifetime pruning retires connections regardless of activity.
#[tokio::test]
async fn checkout_discards_connections_past_their_lifetime() {
    let factory = MockFactory::new();
    let pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder()
            .max_size(Some(5))
            .max_connection_life_time(Some(Duration::from_millis(50)))
            // Keep maintenance out of the way so the checkout path does the
            // pruning.
            .maintenance_initial_delay(Some(Duration::from_secs(3600)))
            .build(),
    );

    let conn = pool.check_out(None).await.unwrap();
    let first_id = conn.id;
    drop(conn);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let conn = pool.check_out(None).await.unwrap();
    assert_ne!(conn.id, first_id);
    assert_eq!(factory.created(), 2);
}

/// Maintenance pre-opens connections up to `min_size`.
#[tokio::test]
async fn maintenance_populates_up_to_min_size() {
    let factory = MockFactory::new();
    let _pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder()
            .max_size(Some(10))
            .min_size(Some(3))
            .maintenance_initial_delay(Some(Duration::from_millis(10)))
            .maintenance_frequency(Some(Duration::from_millis(10)))
            .build(),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(factory.created(), 3);
}

/// The pool never exceeds `max_size` connections even under churn, and every
/// checkout completes.
#[tokio::test]
async fn total_connections_stay_within_max_size_under_churn() {
    let factory = MockFactory::new();
    let pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder()
            .max_size(Some(3))
            .max_wait_time(Some(Duration::from_secs(5)))
            .build(),
    );

    let tasks: Vec<_> = (0..30)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let conn = pool.check_out(None).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(conn);
            })
        })
        .collect();
    for task in join_all(tasks).await {
        task.unwrap();
    }

    assert!(factory.created() <= 3, "created {}", factory.created());
}

/// A checkout that cannot be satisfied within the wait deadline fails with
/// the pool-timeout kind and leaves other checkouts untouched.
#[tokio::test]
async fn checkout_times_out_with_pool_timeout() {
    let factory = MockFactory::new();
    let pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder()
            .max_size(Some(1))
            .max_connecting(Some(1))
            .max_wait_time(Some(Duration::from_millis(100)))
            .build(),
    );

    let held = pool.check_out(None).await.unwrap();

    let err = pool.check_out(None).await.unwrap_err();
    assert!(
        matches!(err.kind.as_ref(), ErrorKind::PoolTimeout { .. }),
        "{:?}",
        err
    );

    // The held connection is unaffected and can be returned and reused.
    drop(held);
    let conn = pool.check_out(None).await.unwrap();
    assert_eq!(conn.id, 1);
}

/// Closing the pool fails parked checkouts and subsequent ones with the
/// pool-closed kind.
#[tokio::test]
async fn close_fails_pending_and_future_checkouts() {
    let factory = MockFactory::new();
    let pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder()
            .max_size(Some(1))
            .max_connecting(Some(1))
            .build(),
    );

    let held = pool.check_out(None).await.unwrap();

    let parked = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.check_out(None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.close().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = parked.await.unwrap().unwrap_err();
    assert!(
        matches!(err.kind.as_ref(), ErrorKind::PoolClosed { .. }),
        "{:?}",
        err
    );

    // Close waits for the held connection to come back.
    drop(held);
    closer.await.unwrap();

    let err = pool.check_out(None).await.unwrap_err();
    assert!(
        matches!(err.kind.as_ref(), ErrorKind::PoolClosed { .. }),
        "{:?}",
        err
    );
}

/// A pinned connection cycles through its pinner rather than the idle queue,
/// and finds its way back to the pool once unpinned.
#[tokio::test]
async fn pinned_connections_return_to_their_pinner() {
    let factory = MockFactory::new();
    let pool = pool_with(
        &factory,
        ConnectionPoolOptions::builder().max_size(Some(2)).build(),
    );

    let mut conn = pool.check_out(None).await.unwrap();
    let pinned_id = conn.id;
    let handle = conn.pin().unwrap();
    assert_eq!(handle.id(), pinned_id);

    // Dropping the in-use connection sends it to the pinner, not the pool.
    drop(conn);
    let conn = handle.take_connection().await.unwrap();
    assert_eq!(conn.id, pinned_id);

    // Once the pinner is done with it, the connection returns to the pool.
    drop(conn);
    drop(handle);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let conn = pool.check_out(None).await.unwrap();
    assert_eq!(conn.id, pinned_id);
    assert_eq!(factory.created(), 1);
}

/// A connect that cannot complete within the connect timeout must fail and
/// release its socket rather than blocking establishment forever.
#[tokio::test]
async fn connect_timeout_interrupts_establishment() {
    use crate::{
        conn::PendingConnection, event::pool::PoolEventEmitter, options::SocketOptions,
        pool::establish::EstablisherOptions,
    };

    let establisher = ConnectionEstablisher::new(EstablisherOptions {
        socket_options: SocketOptions::builder()
            .connect_timeout(Duration::from_millis(500))
            .build(),
        ..Default::default()
    })
    .unwrap();

    // A blackholed address; depending on the network this surfaces as a
    // connect timeout or an unreachable error, never as a hang.
    let pending = PendingConnection {
        id: 1,
        address: ServerAddress::new("10.255.255.1", 65333),
        generation: 0,
        event_emitter: PoolEventEmitter::new(None),
        time_created: Instant::now(),
    };

    let started = Instant::now();
    let err = establisher
        .establish_connection(pending, None)
        .await
        .unwrap_err();

    assert!(err.is_timeout() || err.is_network_error(), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(10));
}
