use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::Timestamp;

use super::{
    ClientSession, ClusterClock, ClusterTime, ServerSessionPool, TransactionContext,
    TransactionState,
};
use crate::{
    error::ErrorKind,
    options::{ServerAddress, SessionOptions},
    session::{ExplicitSessionContext, ImplicitSessionContext, SessionContext},
};

fn ts(time: u32, increment: u32) -> Timestamp {
    Timestamp { time, increment }
}

fn pool_with_timeout(minutes: u64) -> Arc<ServerSessionPool> {
    let pool = Arc::new(ServerSessionPool::new());
    pool.update_logical_session_timeout(Some(Duration::from_secs(minutes * 60)));
    pool
}

async fn session(pool: &Arc<ServerSessionPool>) -> ClientSession {
    ClientSession::start(pool.clone(), None, false).await.unwrap()
}

#[tokio::test]
async fn pool_reuses_the_most_recently_used_session() {
    let pool = pool_with_timeout(30);

    let first = pool.check_out().await;
    let second = pool.check_out().await;
    let first_id = first.id().clone();
    let second_id = second.id().clone();
    assert_ne!(first_id, second_id);

    pool.check_in(first).await;
    pool.check_in(second).await;

    // The session released last comes back first.
    let reused = pool.check_out().await;
    assert_eq!(reused.id(), &second_id);
}

#[tokio::test]
async fn pool_drops_sessions_near_their_ttl() {
    let pool = pool_with_timeout(30);

    let mut session = pool.check_out().await;
    let old_id = session.id().clone();
    session.set_last_use(Instant::now() - Duration::from_secs(30 * 60));
    pool.check_in(session).await;

    // The expiring session never made it into the pool.
    assert!(!pool.contains(&old_id).await);

    let fresh = pool.check_out().await;
    assert_ne!(fresh.id(), &old_id);
}

#[tokio::test]
async fn pool_prunes_expiring_sessions_at_acquisition() {
    let pool = pool_with_timeout(30);

    let mut stale = pool.check_out().await;
    let stale_id = stale.id().clone();
    // Fresh enough to pass the check-in prune, but past it once we advance.
    stale.set_last_use(Instant::now() - Duration::from_secs(28 * 60));
    pool.check_in(stale).await;
    assert!(pool.contains(&stale_id).await);

    pool.update_logical_session_timeout(Some(Duration::from_secs(28 * 60)));
    let fresh = pool.check_out().await;
    assert_ne!(fresh.id(), &stale_id);
}

#[tokio::test]
async fn dirty_sessions_are_discarded_on_release() {
    let pool = pool_with_timeout(30);

    let mut session = session(&pool).await;
    let id = session.id().unwrap().clone();
    session.mark_dirty();
    session.close().await;

    assert!(!pool.contains(&id).await);
    assert_eq!(pool.in_use_count(), 0);
}

#[tokio::test]
async fn close_returns_the_server_session_and_is_idempotent() {
    let pool = pool_with_timeout(30);

    let mut session = session(&pool).await;
    let id = session.id().unwrap().clone();
    assert_eq!(pool.in_use_count(), 1);

    session.close().await;
    session.close().await;

    assert!(session.id().is_none());
    assert!(pool.contains(&id).await);
    assert_eq!(pool.in_use_count(), 0);
}

#[tokio::test]
async fn drain_returns_all_pooled_lsids() {
    let pool = pool_with_timeout(30);

    let first = pool.check_out().await;
    let second = pool.check_out().await;
    pool.check_in(first).await;
    pool.check_in(second).await;

    let drained = pool.drain().await;
    assert_eq!(drained.len(), 2);
    assert_eq!(pool.available_count().await, 0);

    let command = super::end_sessions_command(drained);
    assert_eq!(command.name(), "endSessions");
    assert_eq!(
        command.body.get_array("endSessions").unwrap().len(),
        2
    );
}

#[tokio::test]
async fn cluster_clock_keeps_the_maximum() {
    let clock = ClusterClock::new();
    let forty_two = ClusterTime::new_testing(42, 0);
    let hundred = ClusterTime::new_testing(100, 0);
    let fifty = ClusterTime::new_testing(50, 0);

    clock.advance(&forty_two);
    assert_eq!(clock.current().unwrap().timestamp(), ts(42, 0));

    clock.advance(&hundred);
    assert_eq!(clock.current().unwrap().timestamp(), ts(100, 0));

    clock.advance(&fifty);
    assert_eq!(clock.current().unwrap().timestamp(), ts(100, 0));
}

#[tokio::test]
async fn cluster_clock_merge_is_order_independent() {
    let a = ClusterTime::new_testing(7, 3);
    let b = ClusterTime::new_testing(7, 9);

    let forward = ClusterClock::new();
    forward.advance(&a);
    forward.advance(&b);

    let backward = ClusterClock::new();
    backward.advance(&b);
    backward.advance(&a);

    assert_eq!(forward.current(), backward.current());
    assert_eq!(forward.current().unwrap().timestamp(), ts(7, 9));
}

#[tokio::test]
async fn session_operation_time_merge_keeps_the_maximum() {
    let pool = pool_with_timeout(30);
    let mut session = session(&pool).await;

    session.advance_operation_time(ts(10, 1));
    session.advance_operation_time(ts(5, 7));
    assert_eq!(session.operation_time(), Some(ts(10, 1)));

    session.advance_operation_time(ts(10, 2));
    assert_eq!(session.operation_time(), Some(ts(10, 2)));
}

#[tokio::test]
async fn session_cluster_time_merge_keeps_the_maximum() {
    let pool = pool_with_timeout(30);
    let mut session = session(&pool).await;

    session.advance_cluster_time(&ClusterTime::new_testing(3, 0));
    session.advance_cluster_time(&ClusterTime::new_testing(1, 0));
    assert_eq!(
        session.cluster_time().unwrap().timestamp(),
        ts(3, 0)
    );
}

#[tokio::test]
async fn transaction_numbers_only_increase() {
    let pool = pool_with_timeout(30);
    let mut session = session(&pool).await;

    let first = session.advance_transaction_number().unwrap();
    let second = session.advance_transaction_number().unwrap();
    assert!(second > first);

    session.start_transaction(None).unwrap();
    let in_txn = session.txn_number().unwrap();
    assert!(in_txn > second);
}

#[tokio::test]
async fn statement_ids_accumulate() {
    let pool = pool_with_timeout(30);
    let mut session = session(&pool).await;

    assert_eq!(session.advance_statement_id(3).unwrap(), 3);
    assert_eq!(session.advance_statement_id(2).unwrap(), 5);
}

#[tokio::test]
async fn snapshot_timestamp_is_set_once() {
    let pool = pool_with_timeout(30);
    let options = SessionOptions::builder().snapshot(Some(true)).build();
    let mut session = ClientSession::start(pool, Some(options), false)
        .await
        .unwrap();

    session.set_snapshot_timestamp(ts(8, 0)).unwrap();
    // Re-setting the identical value is allowed.
    session.set_snapshot_timestamp(ts(8, 0)).unwrap();

    let err = session.set_snapshot_timestamp(ts(9, 0)).unwrap_err();
    assert!(
        matches!(err.kind.as_ref(), ErrorKind::InvalidArgument { .. }),
        "{:?}",
        err
    );
    assert_eq!(session.snapshot_timestamp(), Some(ts(8, 0)));
}

#[tokio::test]
async fn causal_consistency_defaults_on_except_for_snapshots() {
    let pool = pool_with_timeout(30);

    let session = session(&pool).await;
    assert!(session.causally_consistent());

    let snapshot_options = SessionOptions::builder().snapshot(Some(true)).build();
    let snapshot_session = ClientSession::start(pool.clone(), Some(snapshot_options), false)
        .await
        .unwrap();
    assert!(!snapshot_session.causally_consistent());

    let conflicting = SessionOptions::builder()
        .snapshot(Some(true))
        .causal_consistency(Some(true))
        .build();
    assert!(ClientSession::start(pool, Some(conflicting), false)
        .await
        .is_err());
}

#[tokio::test]
async fn transaction_context_is_retained_until_cleared() {
    let pool = pool_with_timeout(30);
    let mut session = session(&pool).await;

    let context = TransactionContext::new("routing state".to_string());
    assert_eq!(context.reference_count(), 1);

    session.set_transaction_context(ServerAddress::new("router", 27017), context.clone());
    assert_eq!(context.reference_count(), 2);
    assert_eq!(
        session.pinned_server(),
        Some(&ServerAddress::new("router", 27017))
    );
    assert_eq!(
        session
            .transaction_context()
            .and_then(|c| c.downcast_ref::<String>())
            .map(String::as_str),
        Some("routing state")
    );

    session.clear_transaction_context();
    assert_eq!(context.reference_count(), 1);
    assert!(session.pinned_server().is_none());
    assert!(session.transaction_context().is_none());
}

#[tokio::test]
async fn closing_a_session_releases_the_transaction_context() {
    let pool = pool_with_timeout(30);
    let mut session = session(&pool).await;

    let context = TransactionContext::new(7_u64);
    session.set_transaction_context(ServerAddress::new("router", 27017), context.clone());
    assert_eq!(context.reference_count(), 2);

    session.close().await;
    assert_eq!(context.reference_count(), 1);
}

#[tokio::test]
async fn transaction_state_transitions_are_validated() {
    let pool = pool_with_timeout(30);
    let mut session = session(&pool).await;

    assert!(session.commit_transaction().is_err());
    assert!(session.abort_transaction().is_err());

    session.start_transaction(None).unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Starting);
    assert!(session.start_transaction(None).is_err());

    session.notify_message_sent();
    assert_eq!(session.transaction_state(), TransactionState::InProgress);

    session.commit_transaction().unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Committed);
    assert!(session.abort_transaction().is_err());

    // A new transaction can start after a commit.
    session.start_transaction(None).unwrap();
    session.abort_transaction().unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Aborted);
    assert!(session.abort_transaction().is_err());
}

#[tokio::test]
async fn implicit_context_reports_no_active_transaction() {
    let pool = pool_with_timeout(30);

    let mut explicit = ClientSession::start(pool.clone(), None, false)
        .await
        .unwrap();
    explicit.start_transaction(None).unwrap();
    assert!(ExplicitSessionContext::new(&mut explicit).has_active_transaction());

    let mut implicit = ClientSession::start(pool, None, true).await.unwrap();
    implicit.start_transaction(None).unwrap();
    assert!(!ImplicitSessionContext::new(&mut implicit).has_active_transaction());
}

#[tokio::test]
async fn session_context_surfaces_dirty_state() {
    let pool = pool_with_timeout(30);
    let mut session = session(&pool).await;

    {
        let mut ctx = ExplicitSessionContext::new(&mut session);
        assert!(!ctx.is_dirty());
        ctx.mark_dirty();
    }
    assert!(session.is_dirty());
}
