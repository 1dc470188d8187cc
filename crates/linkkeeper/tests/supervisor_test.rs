//! Integration tests for session supervision and recovery.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use linkkeeper::recovery::ErrorCode;
use linkkeeper::session::SessionStatus;
use linkkeeper::store::{AuthStore, TenantStatus};
use linkkeeper::supervisor::{SessionEnded, SupervisorError};
use linkkeeper_protocol::{
    ConnectionCommand, ConnectionEvent, DisconnectReason, Failure, WireMessage,
};

use common::{EXPECT_WITHIN, Harness, eventually, tenant};

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn open_marks_tenant_connected() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    assert_eq!(pending.handle().id(), "s1");
    h.wait_for_status("s1", TenantStatus::Opening).await;

    let conn = h.next_connection().await;
    assert_eq!(conn.request.session_id, "s1");
    assert_eq!(conn.request.tenant_id, "tenant-1");
    assert!(conn.request.credentials.is_none());

    conn.emit(ConnectionEvent::Connecting).await;
    conn.open("5511999").await;
    let handle = pending.opened().await.unwrap();
    assert_eq!(handle.status(), SessionStatus::Open);

    let record = h.wait_for_status("s1", TenantStatus::Connected).await;
    assert_eq!(record.number.as_deref(), Some("5511999"));
    assert_eq!(record.qr_code, "");
    assert_eq!(record.retries, 0);
    assert_eq!(record.name, "s1 line");

    assert_eq!(h.supervisor.get_session("s1"), Some(handle));
    let metrics = &h.supervisor.get_metrics(Some("s1"))["s1"];
    assert_eq!(metrics.connection_attempts, 1);
    assert_eq!(metrics.successful_connections, 1);
    assert!(metrics.last_connected_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn qr_code_is_published_on_the_tenant() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;

    conn.qr("qr-data-1").await;
    let record = h.wait_for_status("s1", TenantStatus::Qrcode).await;
    assert_eq!(record.qr_code, "qr-data-1");
    assert_eq!(pending.handle().status(), SessionStatus::QrWait);

    conn.open("5511").await;
    pending.opened().await.unwrap();
    let record = h.wait_for_status("s1", TenantStatus::Connected).await;
    assert_eq!(record.qr_code, "");
}

#[tokio::test(start_paused = true)]
async fn stored_credentials_are_handed_to_the_connection() {
    let mut h = Harness::new();
    h.seed_credentials("s1", json!({"me": {"id": "5511"}})).await;

    h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;

    let credentials = conn.request.credentials.expect("credentials");
    assert_eq!(credentials.as_value()["me"]["id"], "5511");
}

#[tokio::test(start_paused = true)]
async fn invalid_stored_credentials_are_discarded() {
    let mut h = Harness::new();
    h.seed_credentials("s1", json!({})).await;

    h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;

    assert!(conn.request.credentials.is_none());
    assert!(h.auth.load("s1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn credential_updates_are_persisted() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;

    conn.emit(ConnectionEvent::CredsUpdate {
        creds: json!({"me": {"id": "5511"}, "keys": {}}),
    })
    .await;
    conn.open("5511").await;
    pending.opened().await.unwrap();

    let stored = h.auth.load("s1").await.unwrap().expect("credentials");
    assert_eq!(stored.as_value()["me"]["id"], "5511");
}

#[tokio::test(start_paused = true)]
async fn connect_failure_fails_start() {
    let mut h = Harness::new();
    h.connector.reject(true);

    let result = h.supervisor.start_session(&tenant("s1")).await;
    assert!(matches!(result, Err(SupervisorError::Connect(_))));
    assert!(h.supervisor.get_session("s1").is_none());
    assert_eq!(h.tenant("s1").await.status, TenantStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn second_start_supersedes_the_first() {
    let mut h = Harness::new();
    let first = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let mut conn1 = h.next_connection().await;

    let second = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn2 = h.next_connection().await;

    assert!(matches!(conn1.next_command().await, ConnectionCommand::Close));
    assert_eq!(first.opened().await.unwrap_err(), SessionEnded::Superseded);

    conn2.open("5511").await;
    let handle = second.opened().await.unwrap();
    assert_eq!(h.supervisor.get_session("s1"), Some(handle));
    assert_eq!(h.supervisor.registry().len(), 1);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn connection_closed_schedules_bounded_reconnect() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let first = h.next_connection().await;
    first.open("5511").await;
    pending.opened().await.unwrap();

    let closed_at = Instant::now();
    first.close(DisconnectReason::ConnectionClosed).await;
    let second = h.next_connection().await;
    let waited = closed_at.elapsed();

    assert!(waited >= Duration::from_millis(2_000), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(33_000), "waited {waited:?}");
    assert_eq!(second.request.session_id, "s1");

    let state = h.supervisor.recovery().get("s1").unwrap();
    assert_eq!(state.retry_count, 1);
    assert_eq!(state.last_error_code, Some(ErrorCode::ConnectionClosed));
    assert!(!state.recovery_in_progress);

    let metrics = &h.supervisor.get_metrics(Some("s1"))["s1"];
    assert_eq!(metrics.connection_attempts, 2);
    assert_eq!(metrics.failed_connections, 1);
    assert_eq!(metrics.reconnections, 1);
    assert_eq!(metrics.last_error, Some(ErrorCode::ConnectionClosed));
}

#[tokio::test(start_paused = true)]
async fn close_before_open_fails_the_pending_session() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;

    conn.close(DisconnectReason::TimedOut).await;
    assert_eq!(
        pending.opened().await.unwrap_err(),
        SessionEnded::Closed(ErrorCode::ConnectionTimeout)
    );

    // Recovery still runs.
    let retry = h.next_connection().await;
    assert_eq!(retry.request.session_id, "s1");
}

#[tokio::test(start_paused = true)]
async fn unscanned_qr_codes_disconnect_the_tenant() {
    let mut h = Harness::new();
    h.seed_credentials("s1", json!({"me": {"id": "5511"}})).await;
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let mut conn = h.next_connection().await;

    conn.qr("qr-1").await;
    conn.qr("qr-2").await;
    conn.qr("qr-3").await;

    assert_eq!(
        pending.opened().await.unwrap_err(),
        SessionEnded::QrAttemptsExhausted(3)
    );
    let record = h.tenant("s1").await;
    assert_eq!(record.status, TenantStatus::Disconnected);
    assert_eq!(record.qr_code, "");
    assert!(h.auth.load("s1").await.unwrap().is_none());
    assert!(h.supervisor.get_session("s1").is_none());
    assert!(h.supervisor.recovery().get("s1").is_none());
    assert!(matches!(conn.next_command().await, ConnectionCommand::Close));

    h.expect_no_connection(EXPECT_WITHIN).await;
    assert_eq!(h.supervisor.get_metrics(Some("s1"))["s1"].qr_codes_issued, 3);
}

#[tokio::test(start_paused = true)]
async fn repeated_logout_gives_up_after_one_credential_reset() {
    let mut h = Harness::new();
    h.seed_credentials("s1", json!({"me": {"id": "5511"}})).await;
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let first = h.next_connection().await;
    first.open("5511").await;
    pending.opened().await.unwrap();

    first.close(DisconnectReason::LoggedOut).await;
    let second = h.next_connection().await;
    assert!(second.request.credentials.is_none());
    assert!(h.auth.load("s1").await.unwrap().is_none());
    assert_eq!(h.tenant("s1").await.status, TenantStatus::Pending);

    second.close(DisconnectReason::LoggedOut).await;
    h.expect_no_connection(EXPECT_WITHIN).await;

    assert_eq!(h.connector.attempts(), 2);
    assert!(h.supervisor.get_session("s1").is_none());
    assert!(h.supervisor.recovery().get("s1").is_none());
    assert_eq!(h.tenant("s1").await.status, TenantStatus::Pending);
    assert_eq!(h.supervisor.get_metrics(Some("s1"))["s1"].failed_connections, 2);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failures_are_terminal() {
    for failure in [
        Failure::protocol(DisconnectReason::ConnectionReplaced),
        Failure::transport(426),
        Failure::text("unsupported feature requested"),
    ] {
        let mut h = Harness::new();
        let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
        let conn = h.next_connection().await;
        conn.open("5511").await;
        pending.opened().await.unwrap();

        conn.emit(ConnectionEvent::Close { failure }).await;
        h.wait_for_status("s1", TenantStatus::Pending).await;
        h.expect_no_connection(EXPECT_WITHIN).await;
        assert!(h.supervisor.get_session("s1").is_none());
        assert!(h.supervisor.recovery().get("s1").is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn session_conflict_needs_manual_intervention() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();

    conn.emit(ConnectionEvent::Close {
        failure: Failure::transport(409),
    })
    .await;
    let record = h.wait_for_status("s1", TenantStatus::Pending).await;
    assert_eq!(record.retries, 1);

    h.expect_no_connection(EXPECT_WITHIN).await;
    assert!(h.supervisor.get_session("s1").is_none());
    assert!(h.supervisor.recovery().get("s1").is_none());
}

#[tokio::test(start_paused = true)]
async fn restart_required_resets_tenant_then_reconnects() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();

    conn.close(DisconnectReason::RestartRequired).await;
    h.wait_for_status("s1", TenantStatus::Pending).await;
    let retry = h.next_connection().await;
    retry.open("5511").await;
    h.wait_for_status("s1", TenantStatus::Connected).await;
    assert_eq!(h.supervisor.recovery().get("s1").unwrap().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_reinitialization_is_terminal() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();
    h.wait_for_status("s1", TenantStatus::Connected).await;

    h.connector.reject(true);
    conn.close(DisconnectReason::ConnectionLost).await;
    h.wait_for_status("s1", TenantStatus::Pending).await;

    assert_eq!(h.connector.attempts(), 2);
    assert!(h.supervisor.get_session("s1").is_none());
    assert!(h.supervisor.recovery().get("s1").is_none());
}

#[tokio::test(start_paused = true)]
async fn event_stream_ending_counts_as_lost_connection() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();

    drop(conn);
    let retry = h.next_connection().await;
    assert_eq!(retry.request.session_id, "s1");
    assert_eq!(
        h.supervisor.recovery().get("s1").unwrap().last_error_code,
        Some(ErrorCode::ConnectionLost)
    );
}

#[tokio::test(start_paused = true)]
async fn qr_ceiling_spans_reconnects_until_open() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let first = h.next_connection().await;

    first.qr("qr-1").await;
    first.qr("qr-2").await;
    first.close(DisconnectReason::TimedOut).await;
    assert_eq!(
        pending.opened().await.unwrap_err(),
        SessionEnded::Closed(ErrorCode::ConnectionTimeout)
    );

    let mut retry = h.next_connection().await;
    retry.qr("qr-3").await;
    let record = h.wait_for_status("s1", TenantStatus::Disconnected).await;
    assert_eq!(record.qr_code, "");
    assert!(h.supervisor.get_session("s1").is_none());
    assert!(h.supervisor.recovery().get("s1").is_none());
    assert!(matches!(retry.next_command().await, ConnectionCommand::Close));

    h.expect_no_connection(EXPECT_WITHIN).await;
    assert_eq!(h.supervisor.get_metrics(Some("s1"))["s1"].qr_codes_issued, 3);
}

#[tokio::test(start_paused = true)]
async fn open_resets_the_qr_count() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let first = h.next_connection().await;
    first.qr("qr-1").await;
    first.qr("qr-2").await;
    first.open("5511").await;
    pending.opened().await.unwrap();
    h.wait_for_status("s1", TenantStatus::Connected).await;

    first.close(DisconnectReason::ConnectionLost).await;
    let retry = h.next_connection().await;
    retry.qr("qr-3").await;
    assert_eq!(h.wait_for_status("s1", TenantStatus::Qrcode).await.qr_code, "qr-3");
    retry.qr("qr-4").await;
    assert_eq!(h.wait_for_status("s1", TenantStatus::Qrcode).await.qr_code, "qr-4");
    assert!(h.supervisor.get_session("s1").is_some());
}

#[tokio::test(start_paused = true)]
async fn credential_reset_failure_stops_recovery() {
    let mut h = Harness::new();
    h.seed_credentials("s1", json!({"me": {"id": "5511"}})).await;
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();
    h.wait_for_status("s1", TenantStatus::Connected).await;

    h.auth.fail_writes(true);
    conn.close(DisconnectReason::LoggedOut).await;

    let supervisor = h.supervisor.clone();
    eventually(|| {
        supervisor.get_session("s1").is_none() && supervisor.recovery().get("s1").is_none()
    })
    .await;
    h.expect_no_connection(EXPECT_WITHIN).await;
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn tenant_write_failure_stops_recovery() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();
    h.wait_for_status("s1", TenantStatus::Connected).await;

    h.tenants.fail_writes(true);
    conn.close(DisconnectReason::RestartRequired).await;

    let supervisor = h.supervisor.clone();
    eventually(|| {
        supervisor.get_session("s1").is_none() && supervisor.recovery().get("s1").is_none()
    })
    .await;
    h.expect_no_connection(EXPECT_WITHIN).await;
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.tenant("s1").await.status, TenantStatus::Connected);
}

// ============================================================================
// Removal and Restart
// ============================================================================

#[tokio::test(start_paused = true)]
async fn removal_cancels_scheduled_retry() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();

    conn.close(DisconnectReason::ConnectionLost).await;
    let supervisor = h.supervisor.clone();
    eventually(|| {
        supervisor
            .recovery()
            .get("s1")
            .is_some_and(|state| state.recovery_in_progress)
    })
    .await;

    // The closed session was already detached by recovery.
    assert!(!h.supervisor.remove_session("s1", false).await);
    h.expect_no_connection(EXPECT_WITHIN).await;
    assert_eq!(h.tenant("s1").await.status, TenantStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn removal_with_logout_signs_off() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let mut conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();

    assert!(h.supervisor.remove_session("s1", true).await);
    assert!(matches!(conn.next_command().await, ConnectionCommand::Logout));
    assert!(matches!(conn.next_command().await, ConnectionCommand::Close));
    assert!(h.supervisor.get_session("s1").is_none());
    assert_eq!(h.tenant("s1").await.status, TenantStatus::Disconnected);

    // The provider's close for the removed connection is ignored.
    conn.close(DisconnectReason::LoggedOut).await;
    h.expect_no_connection(EXPECT_WITHIN).await;

    assert!(!h.supervisor.remove_session("s1", true).await);
}

#[tokio::test(start_paused = true)]
async fn restart_closes_tenant_sessions_and_recovers() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let mut conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();
    h.wait_for_status("s1", TenantStatus::Connected).await;

    assert_eq!(h.supervisor.restart_session("tenant-1").await, 1);
    assert_eq!(h.supervisor.restart_session("other-tenant").await, 0);
    assert!(matches!(conn.next_command().await, ConnectionCommand::Close));

    conn.close(DisconnectReason::ConnectionClosed).await;
    let retry = h.next_connection().await;
    retry.open("5511").await;
    h.wait_for_status("s1", TenantStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_scheduled_retries() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();

    conn.close(DisconnectReason::ConnectionClosed).await;
    let supervisor = h.supervisor.clone();
    eventually(|| {
        supervisor
            .recovery()
            .get("s1")
            .is_some_and(|state| state.recovery_in_progress)
    })
    .await;

    h.supervisor.shutdown().await;
    h.expect_no_connection(EXPECT_WITHIN).await;
    assert!(matches!(
        h.supervisor.start_session(&tenant("s1")).await,
        Err(SupervisorError::ShuttingDown)
    ));
}

// ============================================================================
// Messages
// ============================================================================

#[tokio::test(start_paused = true)]
async fn incoming_messages_are_cached_except_ignored_chats() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let conn = h.next_connection().await;
    conn.open("5511").await;
    pending.opened().await.unwrap();

    let message = |id: &str, jid: &str| WireMessage {
        id: id.to_string(),
        remote_jid: jid.to_string(),
        from_me: false,
        timestamp: None,
        payload: json!({"conversation": "hello"}),
    };
    conn.emit(ConnectionEvent::Messages {
        messages: vec![
            message("m1", "5511@s.whatsapp.net"),
            message("m2", "status@broadcast"),
            message("m3", "1203@newsletter"),
        ],
    })
    .await;

    let supervisor = h.supervisor.clone();
    eventually(|| supervisor.get_metrics(Some("s1"))["s1"].messages_received == 1).await;

    let cached: WireMessage = h.supervisor.cache().get_json("m1").await.unwrap();
    assert_eq!(cached.payload["conversation"], "hello");
    assert!(h.supervisor.cache().get("m2").await.is_none());
    assert!(h.supervisor.cache().get("m3").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn send_message_caches_and_forwards() {
    let mut h = Harness::new();
    let pending = h.supervisor.start_session(&tenant("s1")).await.unwrap();
    let mut conn = h.next_connection().await;

    // Not open yet.
    let early = h
        .supervisor
        .send_message("s1", "5511@s.whatsapp.net", json!({"text": "hi"}))
        .await;
    assert!(matches!(early, Err(SupervisorError::NotOpen { .. })));

    conn.open("5511").await;
    pending.opened().await.unwrap();

    let message_id = h
        .supervisor
        .send_message("s1", "5511@s.whatsapp.net", json!({"text": "hi"}))
        .await
        .unwrap();

    match conn.next_command().await {
        ConnectionCommand::SendMessage {
            message_id: sent_id,
            to,
            payload,
            ..
        } => {
            assert_eq!(sent_id, message_id);
            assert_eq!(to, "5511@s.whatsapp.net");
            assert_eq!(payload["text"], "hi");
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cached: WireMessage = h.supervisor.cache().get_json(&message_id).await.unwrap();
    assert!(cached.from_me);
    assert_eq!(h.supervisor.get_metrics(Some("s1"))["s1"].messages_sent, 1);

    let missing = h
        .supervisor
        .send_message("nope", "5511@s.whatsapp.net", json!({}))
        .await;
    assert!(matches!(missing, Err(SupervisorError::SessionNotFound(_))));
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test(start_paused = true)]
async fn metrics_can_be_read_and_reset_per_session() {
    let mut h = Harness::new();
    for id in ["s1", "s2"] {
        let pending = h.supervisor.start_session(&tenant(id)).await.unwrap();
        let conn = h.next_connection().await;
        conn.open("5511").await;
        pending.opened().await.unwrap();
    }

    let all = h.supervisor.get_metrics(None);
    assert_eq!(all.keys().collect::<Vec<_>>(), vec!["s1", "s2"]);
    assert_eq!(h.supervisor.metrics_totals().successful_connections, 2);
    assert!(h.supervisor.get_metrics(Some("unknown")).is_empty());

    h.supervisor.reset_metrics(Some("s1"));
    assert!(h.supervisor.get_metrics(Some("s1")).is_empty());
    assert_eq!(h.supervisor.get_metrics(None).len(), 1);

    h.supervisor.reset_metrics(None);
    assert!(h.supervisor.get_metrics(None).is_empty());
}
