//! End-to-end engine behavior: dispatch, admission, supervision timers,
//! and graceful stop, driven through the public `App` surface with a
//! scripted isolation backend and paused time.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, Instant};

use appvisor::{EnqueueError, EngineState, EventKind, SessionError, StopOutcome, UpstreamFrame};

use common::{next_frame, open_session, test_app, wait_for, WorkerMode};

fn small_profile() -> serde_json::Value {
    json!({
        "pool-limit": 1,
        "queue-limit": 10,
        "grow-threshold": 1,
        "startup-timeout": 5.0,
        "heartbeat-timeout": 5.0,
        "idle-timeout": 5.0,
        "termination-timeout": 5.0,
    })
}

#[tokio::test(start_paused = true)]
async fn happy_path_single_slave() {
    let bed = test_app(small_profile(), WorkerMode::Echo).await;
    let mut events = bed.bus.subscribe();

    let (session, mut rx) = open_session(&bed.app, None).await;
    session.write(b"hi".to_vec()).await.unwrap();
    session.choke().await.unwrap();

    assert_eq!(next_frame(&mut rx).await, UpstreamFrame::Chunk(b"hi".to_vec()));
    assert_eq!(next_frame(&mut rx).await, UpstreamFrame::Choke);
    wait_for(&mut events, EventKind::SessionCompleted).await;

    let info = bed.app.info().await;
    let engine = info.engine.unwrap();
    assert_eq!(engine.state, EngineState::Running);
    assert_eq!(engine.pool.size, 1);
    assert_eq!(engine.sessions.accepted, 1);
    assert_eq!(engine.sessions.completed, 1);
    assert_eq!(engine.sessions.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn queue_overflow_rejects_the_fourth_session() {
    let profile = json!({
        "pool-limit": 1,
        "queue-limit": 2,
        "grow-threshold": 1,
        "startup-timeout": 60.0,
    });
    // Mute workers never handshake, so nothing is dispatched.
    let bed = test_app(profile, WorkerMode::Mute).await;

    let (_s1, _rx1) = open_session(&bed.app, None).await;
    let (_s2, _rx2) = open_session(&bed.app, None).await;
    let (_s3, _rx3) = open_session(&bed.app, None).await;

    let (tx, _rx4) = tokio::sync::mpsc::unbounded_channel();
    let err = bed.app.enqueue("ping", tx, None).await.unwrap_err();
    assert_eq!(err, EnqueueError::Overflow);

    let engine = bed.app.info().await.engine.unwrap();
    assert_eq!(engine.sessions.accepted, 3);
    assert_eq!(engine.sessions.rejected, 1);
    assert_eq!(engine.queue.depth, 3);
}

#[tokio::test(start_paused = true)]
async fn slave_death_closes_the_session_and_respawn_follows() {
    let bed = test_app(small_profile(), WorkerMode::Busy).await;
    let mut events = bed.bus.subscribe();

    let (_session, mut rx) = open_session(&bed.app, None).await;
    wait_for(&mut events, EventKind::SessionAssigned).await;

    bed.isolate.kill_all();

    assert_eq!(
        next_frame(&mut rx).await,
        UpstreamFrame::Error(SessionError::SlaveLost)
    );
    wait_for(&mut events, EventKind::SlaveDead).await;

    let engine = bed.app.info().await.engine.unwrap();
    assert_eq!(engine.pool.size, 0);
    assert_eq!(engine.sessions.failed, 1);

    // The next enqueue grows a fresh slave.
    let (_s2, _rx2) = open_session(&bed.app, None).await;
    wait_for(&mut events, EventKind::SlaveSpawning).await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_loss_kills_the_slave() {
    let profile = json!({
        "pool-limit": 1,
        "queue-limit": 10,
        "grow-threshold": 1,
        "startup-timeout": 10.0,
        "heartbeat-timeout": 1.0,
    });
    let bed = test_app(profile, WorkerMode::NoHeartbeat).await;
    let mut events = bed.bus.subscribe();

    let (_session, mut rx) = open_session(&bed.app, None).await;
    wait_for(&mut events, EventKind::SessionAssigned).await;

    sleep(Duration::from_millis(1500)).await;

    let dead = wait_for(&mut events, EventKind::SlaveDead).await;
    assert_eq!(dead.reason, Some("slave_heartbeat_lost"));
    assert_eq!(
        next_frame(&mut rx).await,
        UpstreamFrame::Error(SessionError::SlaveLost)
    );
}

#[tokio::test(start_paused = true)]
async fn queued_session_past_deadline_is_never_assigned() {
    let profile = json!({
        "pool-limit": 1,
        "queue-limit": 100,
        "grow-threshold": 1,
        "heartbeat-timeout": 60.0,
        "idle-timeout": 60.0,
    });
    let bed = test_app(profile, WorkerMode::Busy).await;
    let mut events = bed.bus.subscribe();

    // Occupies the only slave forever.
    let (_s1, _rx1) = open_session(&bed.app, None).await;
    wait_for(&mut events, EventKind::SessionAssigned).await;

    let deadline = Instant::now() + Duration::from_millis(500);
    let (s2, mut rx2) = open_session(&bed.app, Some(deadline)).await;
    sleep(Duration::from_millis(600)).await;

    assert_eq!(
        next_frame(&mut rx2).await,
        UpstreamFrame::Error(SessionError::DeadlineExceeded)
    );

    // No assignment ever happened for the expired session.
    let mut assigned_to_s2 = false;
    while let Ok(ev) = events.try_recv() {
        if ev.kind == EventKind::SessionAssigned && ev.session == Some(s2.id()) {
            assigned_to_s2 = true;
        }
    }
    assert!(!assigned_to_s2);
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_drains_busy_slaves() {
    let profile = json!({
        "pool-limit": 3,
        "queue-limit": 10,
        "grow-threshold": 1,
        "heartbeat-timeout": 60.0,
        "idle-timeout": 60.0,
        "termination-timeout": 5.0,
    });
    let bed = test_app(profile, WorkerMode::BusyFinishOnTerminate).await;
    let mut events = bed.bus.subscribe();

    let (_s1, mut rx1) = open_session(&bed.app, None).await;
    let (_s2, mut rx2) = open_session(&bed.app, None).await;
    let (_s3, mut rx3) = open_session(&bed.app, None).await;
    for _ in 0..3 {
        wait_for(&mut events, EventKind::SessionAssigned).await;
    }

    let outcome = bed.app.stop().await;
    assert_eq!(outcome, StopOutcome::Drained);

    for rx in [&mut rx1, &mut rx2, &mut rx3] {
        assert_eq!(next_frame(rx).await, UpstreamFrame::Choke);
    }

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let err = bed.app.enqueue("ping", tx, None).await.unwrap_err();
    assert_eq!(err, EnqueueError::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_force_kills_slaves_that_outlive_the_grace() {
    let profile = json!({
        "pool-limit": 2,
        "queue-limit": 10,
        "grow-threshold": 1,
        "heartbeat-timeout": 60.0,
        "idle-timeout": 60.0,
        "termination-timeout": 0.5,
    });
    // Busy workers ignore polite termination entirely.
    let bed = test_app(profile, WorkerMode::Busy).await;
    let mut events = bed.bus.subscribe();

    let (_s1, mut rx1) = open_session(&bed.app, None).await;
    let (_s2, mut rx2) = open_session(&bed.app, None).await;
    for _ in 0..2 {
        wait_for(&mut events, EventKind::SessionAssigned).await;
    }

    let outcome = bed.app.stop().await;
    assert_eq!(outcome, StopOutcome::DrainTimeout { killed: 2 });

    for rx in [&mut rx1, &mut rx2] {
        assert_eq!(
            next_frame(rx).await,
            UpstreamFrame::Error(SessionError::SlaveLost)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn zero_queue_limit_rejects_without_idle_slave() {
    let profile = json!({
        "pool-limit": 1,
        "queue-limit": 0,
        "grow-threshold": 1,
    });
    let bed = test_app(profile, WorkerMode::Echo).await;

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let err = bed.app.enqueue("ping", tx, None).await.unwrap_err();
    assert_eq!(err, EnqueueError::Overflow);

    let engine = bed.app.info().await.engine.unwrap();
    assert_eq!(engine.pool.size, 0);
    assert_eq!(engine.sessions.rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn single_slave_serializes_sessions_in_fifo_order() {
    let bed = test_app(small_profile(), WorkerMode::Echo).await;
    let mut events = bed.bus.subscribe();

    let (a, mut rx_a) = open_session(&bed.app, None).await;
    let (b, mut rx_b) = open_session(&bed.app, None).await;
    a.write(b"first".to_vec()).await.unwrap();
    a.choke().await.unwrap();
    b.write(b"second".to_vec()).await.unwrap();
    b.choke().await.unwrap();

    let first = wait_for(&mut events, EventKind::SessionAssigned).await;
    assert_eq!(first.session, Some(a.id()));
    let second = wait_for(&mut events, EventKind::SessionAssigned).await;
    assert_eq!(second.session, Some(b.id()));

    assert_eq!(
        next_frame(&mut rx_a).await,
        UpstreamFrame::Chunk(b"first".to_vec())
    );
    assert_eq!(next_frame(&mut rx_a).await, UpstreamFrame::Choke);
    assert_eq!(
        next_frame(&mut rx_b).await,
        UpstreamFrame::Chunk(b"second".to_vec())
    );
    assert_eq!(next_frame(&mut rx_b).await, UpstreamFrame::Choke);

    // One slave served both.
    assert_eq!(bed.isolate.spawn_count(), 1);
    let engine = bed.app.info().await.engine.unwrap();
    assert_eq!(engine.pool.size, 1);
    assert_eq!(engine.sessions.completed, 2);
}

#[tokio::test(start_paused = true)]
async fn grow_threshold_above_queue_limit_never_grows() {
    let profile = json!({
        "pool-limit": 4,
        "queue-limit": 2,
        "grow-threshold": 5,
        "startup-timeout": 60.0,
    });
    let bed = test_app(profile, WorkerMode::Echo).await;

    let (_s1, _rx1) = open_session(&bed.app, None).await;
    let (_s2, _rx2) = open_session(&bed.app, None).await;
    sleep(Duration::from_millis(500)).await;

    let engine = bed.app.info().await.engine.unwrap();
    assert_eq!(engine.pool.size, 0);
    assert_eq!(engine.queue.depth, 2);
    assert_eq!(bed.isolate.spawn_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent_and_frees_the_slave() {
    let profile = json!({
        "pool-limit": 1,
        "queue-limit": 10,
        "grow-threshold": 1,
        "heartbeat-timeout": 60.0,
        "idle-timeout": 60.0,
    });
    let bed = test_app(profile, WorkerMode::Busy).await;
    let mut events = bed.bus.subscribe();

    let (s1, mut rx1) = open_session(&bed.app, None).await;
    wait_for(&mut events, EventKind::SessionAssigned).await;

    s1.cancel().await;
    s1.cancel().await;
    wait_for(&mut events, EventKind::SessionCancelled).await;

    // The slave is idle again: a second session gets assigned to it.
    let (s2, _rx2) = open_session(&bed.app, None).await;
    let assigned = wait_for(&mut events, EventKind::SessionAssigned).await;
    assert_eq!(assigned.session, Some(s2.id()));

    let engine = bed.app.info().await.engine.unwrap();
    assert_eq!(engine.sessions.cancelled, 1);
    // The cancelled caller heard nothing.
    assert!(rx1.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn pre_dispatch_buffer_overflow_closes_the_session() {
    let profile = json!({
        "pool-limit": 1,
        "queue-limit": 10,
        "grow-threshold": 1,
        "startup-timeout": 60.0,
    });
    // Never handshakes, so the session stays queued and buffers writes.
    let bed = test_app(profile, WorkerMode::Mute).await;

    let (session, mut rx) = open_session(&bed.app, None).await;
    // Default pending cap is 128 frames; one more trips backpressure.
    for _ in 0..128 {
        session.write(vec![0u8; 8]).await.unwrap();
    }
    session.write(vec![0u8; 8]).await.unwrap();

    match next_frame(&mut rx).await {
        UpstreamFrame::Error(SessionError::BackpressureExceeded { cap }) => {
            assert_eq!(cap, 128);
        }
        other => panic!("expected backpressure close, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn pause_refuses_new_sessions_and_resume_recovers() {
    let bed = test_app(small_profile(), WorkerMode::Echo).await;

    bed.app.pause().await;
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let err = bed.app.enqueue("ping", tx, None).await.unwrap_err();
    assert_eq!(err, EnqueueError::Stopped);
    assert_eq!(
        bed.app.info().await.engine.unwrap().state,
        EngineState::Paused
    );

    bed.app.start().await;
    let (session, mut rx) = open_session(&bed.app, None).await;
    session.write(b"back".to_vec()).await.unwrap();
    session.choke().await.unwrap();
    assert_eq!(
        next_frame(&mut rx).await,
        UpstreamFrame::Chunk(b"back".to_vec())
    );
    assert_eq!(next_frame(&mut rx).await, UpstreamFrame::Choke);
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_drains_the_slave() {
    let profile = json!({
        "pool-limit": 1,
        "queue-limit": 10,
        "grow-threshold": 1,
        "heartbeat-timeout": 60.0,
        "idle-timeout": 1.0,
        "termination-timeout": 5.0,
    });
    let bed = test_app(profile, WorkerMode::Echo).await;
    let mut events = bed.bus.subscribe();

    let (session, mut rx) = open_session(&bed.app, None).await;
    session.choke().await.unwrap();
    assert_eq!(next_frame(&mut rx).await, UpstreamFrame::Choke);

    // Idle for longer than idle_timeout: the slave drains and exits.
    wait_for(&mut events, EventKind::SlaveDraining).await;
    let dead = wait_for(&mut events, EventKind::SlaveDead).await;
    assert_eq!(dead.reason, Some("slave_exited"));

    let engine = bed.app.info().await.engine.unwrap();
    assert_eq!(engine.pool.size, 0);
}
