use super::*;
use crate::gateway::testing;
use messages::ErrorCode;
use tokio::time::Duration as TokioDuration;

fn token_expired(frame: &ServerMessage) -> bool {
    matches!(
        frame,
        ServerMessage::Error { error, .. } if error.code == ErrorCode::TokenExpired
    )
}

// =============================================================================
// SAFE SEND
// =============================================================================

#[tokio::test]
async fn safe_send_preserves_enqueue_order() {
    let (handle, mut rx) = test_handle();
    handle.safe_send(ServerMessage::Ping).await;
    handle
        .safe_send(ServerMessage::error(ErrorCode::Internal, "second", None))
        .await;

    assert_eq!(rx.recv().await, Some(ServerMessage::Ping));
    assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
}

#[tokio::test]
async fn safe_send_is_silent_once_the_client_is_gone() {
    let (handle, rx) = test_handle();
    drop(rx);
    // Must neither panic nor hang.
    handle.safe_send(ServerMessage::Ping).await;
}

#[tokio::test(start_paused = true)]
async fn safe_send_drops_after_bounded_retries_when_queue_is_full() {
    let (handle, mut rx) = test_handle();
    for _ in 0..OUTBOUND_CAPACITY {
        handle.safe_send(ServerMessage::Ping).await;
    }

    // Queue is full and nothing drains it: the backoff loop must give up.
    handle
        .safe_send(ServerMessage::error(ErrorCode::Internal, "overflow", None))
        .await;

    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, OUTBOUND_CAPACITY, "the overflow frame must be dropped");
}

// =============================================================================
// AUTH EPOCHS + EXPIRY
// =============================================================================

#[tokio::test(start_paused = true)]
async fn expired_epoch_sends_token_expired_and_clears_identity() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;
    let user = Uuid::new_v4();

    fixture.gateway.presence_enter(user);
    assert!(fixture.gateway.presence().is_online(user));

    // Expiry in the past: the timer fires immediately on attach.
    handle.install_epoch(
        &fixture.gateway,
        testing::user_accountability(user),
        Some(now_secs() - 1),
    );

    let frame = tokio::time::timeout(TokioDuration::from_secs(60), rx.recv())
        .await
        .expect("expiry frame should arrive")
        .expect("channel open");
    assert!(token_expired(&frame), "expected TOKEN_EXPIRED, got {frame:?}");
    assert!(handle.accountability().is_none());
    assert!(
        !fixture.gateway.presence().is_online(user),
        "an expired epoch no longer counts toward presence"
    );
}

#[tokio::test(start_paused = true)]
async fn grace_window_without_reauth_closes_non_public_connections() {
    let fixture = testing::gateway(); // handshake mode by default
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    handle.install_epoch(
        &fixture.gateway,
        testing::user_accountability(Uuid::new_v4()),
        Some(now_secs() + 1),
    );

    let frame = tokio::time::timeout(TokioDuration::from_secs(60), rx.recv())
        .await
        .expect("expiry frame")
        .expect("channel open");
    assert!(token_expired(&frame));

    tokio::time::timeout(TokioDuration::from_secs(120), handle.shutdown_notified())
        .await
        .expect("connection must be asked to close after the grace window");
}

#[tokio::test(start_paused = true)]
async fn public_mode_stays_open_with_null_identity_after_expiry() {
    let mut config = crate::config::Config::default();
    config.auth_mode = AuthMode::Public;
    let fixture = testing::gateway_with_config(config);
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    handle.install_epoch(
        &fixture.gateway,
        testing::user_accountability(Uuid::new_v4()),
        Some(now_secs() - 1),
    );

    let frame = tokio::time::timeout(TokioDuration::from_secs(60), rx.recv())
        .await
        .expect("expiry frame")
        .expect("channel open");
    assert!(token_expired(&frame));

    // Well past the grace window: still no shutdown request.
    tokio::select! {
        () = handle.shutdown_notified() => panic!("public connections must survive expiry"),
        () = tokio::time::sleep(TokioDuration::from_secs(300)) => {}
    }
    assert!(handle.accountability().is_none());
}

#[tokio::test(start_paused = true)]
async fn reauth_during_grace_cancels_the_close() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    handle.install_epoch(
        &fixture.gateway,
        testing::user_accountability(Uuid::new_v4()),
        Some(now_secs() - 1),
    );
    let frame = tokio::time::timeout(TokioDuration::from_secs(60), rx.recv())
        .await
        .expect("expiry frame")
        .expect("channel open");
    assert!(token_expired(&frame));

    // Re-authenticate before the grace window lapses.
    handle.install_epoch(&fixture.gateway, testing::user_accountability(Uuid::new_v4()), None);

    tokio::select! {
        () = handle.shutdown_notified() => panic!("re-authenticated connection must stay open"),
        () = tokio::time::sleep(TokioDuration::from_secs(300)) => {}
    }
    assert!(handle.accountability().is_some());
}

#[tokio::test(start_paused = true)]
async fn replacing_the_epoch_cancels_the_previous_timer() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    handle.install_epoch(
        &fixture.gateway,
        testing::user_accountability(Uuid::new_v4()),
        Some(now_secs() + 5),
    );
    // Replace with a never-expiring epoch before the first timer fires.
    handle.install_epoch(&fixture.gateway, testing::user_accountability(Uuid::new_v4()), None);

    tokio::select! {
        frame = rx.recv() => panic!("no frame expected after timer cancellation, got {frame:?}"),
        () = tokio::time::sleep(TokioDuration::from_secs(300)) => {}
    }
    assert!(handle.accountability().is_some());
}

// =============================================================================
// PRESENCE RECOMPUTE ON TEARDOWN
// =============================================================================

#[tokio::test]
async fn presence_exit_recomputes_from_the_shrunk_live_set() {
    let fixture = testing::gateway();
    let user = Uuid::new_v4();

    let (tab_one, _rx_one) = testing::register_client(&fixture.gateway).await;
    testing::install_identity(&fixture.gateway, &tab_one, testing::user_accountability(user));
    let (tab_two, _rx_two) = testing::register_client(&fixture.gateway).await;
    testing::install_identity(&fixture.gateway, &tab_two, testing::user_accountability(user));
    fixture.gateway.presence_enter(user);

    // Teardown order: the live set shrinks before the recompute, so the
    // surviving tab keeps the user online.
    fixture.gateway.remove_client(tab_one.id()).await;
    fixture.gateway.presence_exit_if_last(user, tab_one.id()).await;
    assert!(fixture.gateway.presence().is_online(user), "second tab still holds the user");

    fixture.gateway.remove_client(tab_two.id()).await;
    fixture.gateway.presence_exit_if_last(user, tab_two.id()).await;
    assert!(
        !fixture.gateway.presence().is_online(user),
        "closing the last tab must take the user offline immediately"
    );
}

// =============================================================================
// HEARTBEAT BOOKKEEPING
// =============================================================================

#[test]
fn ping_bookkeeping_flags_unanswered_pings() {
    let (handle, _rx) = test_handle();

    assert!(handle.begin_ping(), "first ping is always allowed");
    assert!(!handle.begin_ping(), "unanswered ping must be flagged");

    handle.mark_pong();
    assert!(handle.begin_ping(), "pong resets the flag");
}
