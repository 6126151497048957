mod common;

use common::{pool, Recorder};
use idle_tx_pool::{ConnectionState, MonitorState};
use std::time::Duration;

#[tokio::test]
async fn test_caller_observer_owns_checked_out_errors() {
    let p = pool(1, 0);
    let defaults = Recorder::default();
    let caller = Recorder::default();
    p.on_error(defaults.observer());

    let conn = p.acquire_with(caller.observer()).await.unwrap();
    p.transport.emit_error(conn.id().0, "socket reset");
    assert_eq!(caller.count(), 1);
    assert_eq!(defaults.count(), 0);
    assert_eq!(conn.state(), ConnectionState::Closing);
    assert_eq!(p.error_count(), 1);
}

#[tokio::test]
async fn test_custody_returns_to_pool_on_release() {
    let p = pool(1, 0);
    let defaults = Recorder::default();
    let caller = Recorder::default();
    p.on_error(defaults.observer());

    let id = p.acquire_with(caller.observer()).await.unwrap().id();
    p.transport.emit_error(id.0, "server shutting down");
    assert_eq!(caller.count(), 0);
    assert_eq!(defaults.count(), 1);
}

#[tokio::test]
async fn test_plain_acquire_falls_back_to_default() {
    let p = pool(1, 0);
    let defaults = Recorder::default();
    p.on_error(defaults.observer());

    let conn = p.acquire().await.unwrap();
    p.transport.emit_error(conn.id().0, "socket reset");
    assert_eq!(defaults.count(), 1);
}

#[tokio::test]
async fn test_transport_sees_one_callback_per_session() {
    let p = pool(1, 0);
    let caller = Recorder::default();
    for _ in 0..5 {
        let conn = p.acquire().await.unwrap();
        assert_eq!(p.transport.observer_count(conn.id().0), 1);
        drop(conn);
        assert_eq!(p.transport.observer_count(1), 1);
        let conn = p.acquire_with(caller.observer()).await.unwrap();
        assert_eq!(p.transport.observer_count(conn.id().0), 1);
    }
    p.transport.emit_error(1, "boom");
    assert_eq!(caller.count(), 0);
    let conn = p.acquire().await.unwrap();
    assert_eq!(p.transport.observer_count(1), 0);
    assert_eq!(p.transport.observer_count(conn.id().0), 1);
}

#[tokio::test]
async fn test_duplicate_ambient_errors_count_once() {
    let p = pool(1, 0);
    let defaults = Recorder::default();
    p.on_error(defaults.observer());

    let conn = p.acquire().await.unwrap();
    let id = conn.id().0;
    p.transport
        .emit_error(id, "terminating connection due to idle-in-transaction timeout");
    p.transport.emit_error(id, "Connection terminated unexpectedly");
    drop(conn);
    assert_eq!(p.error_count(), 1);
    assert_eq!(defaults.count(), 1);
    assert_eq!(p.reset_error_count(), 1);
    assert_eq!(p.error_count(), 0);
}

#[tokio::test]
async fn test_errors_counted_without_observer() {
    let p = pool(1, 0);
    let conn = p.acquire().await.unwrap();
    p.transport.emit_error(conn.id().0, "socket reset");
    assert_eq!(p.error_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_delivered_to_caller_observer() {
    let p = pool(1, 0);
    let defaults = Recorder::default();
    let caller = Recorder::default();
    p.on_error(defaults.observer());

    let mut conn = p.acquire_with(caller.observer()).await.unwrap();
    conn.set_idle_in_transaction_timeout(Some(Duration::from_millis(100)))
        .await
        .unwrap();
    conn.begin().await.unwrap();
    assert_eq!(conn.monitor_state(), MonitorState::Armed);
    assert!(conn.deadline().is_some());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(conn.timed_out());
    assert_eq!(conn.deadline(), None);
    assert_eq!(caller.count(), 1);
    assert_eq!(defaults.count(), 0);
    assert!(conn.rollback().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_release_then_deadline_does_not_fire() {
    let p = pool(1, 0);
    let mut conn = p.acquire().await.unwrap();
    conn.set_idle_in_transaction_timeout(Some(Duration::from_millis(100)))
        .await
        .unwrap();
    conn.begin().await.unwrap();
    conn.commit().await.unwrap();
    assert_eq!(conn.monitor_state(), MonitorState::Disarmed);
    drop(conn);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(p.error_count(), 0);
    assert_eq!(p.state().idle, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_racing_deadline_counts_once() {
    let p = pool(8, 0);
    let mut handles = vec![];
    for _ in 0..64 {
        let p = p.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = p.acquire().await.unwrap();
            conn.set_idle_in_transaction_timeout(Some(Duration::from_millis(2)))
                .await
                .unwrap();
            conn.begin().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
            // dropped mid-transaction, right around the deadline
            drop(conn);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    // let abandoned-transaction rollbacks finish
    tokio::time::sleep(Duration::from_millis(50)).await;

    // every fired deadline retires exactly one connection and counts once
    assert_eq!(p.error_count(), p.transport.closed());
    let state = p.state();
    assert_eq!(state.in_use, 0);
    assert_eq!(state.closing, 0);
    assert_eq!(state.idle, state.connections);
}
