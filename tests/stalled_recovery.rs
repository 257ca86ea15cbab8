//! Keepalive stall detection and session recovery timing.
//!
//! Runs under paused time: the keepalive budget (keepalive + stalled
//! timeout) must expire exactly before `STALLED` shows, and the reconnect
//! timeout after that must produce a `recover` request carrying the last
//! received progressive.

mod support;

use std::time::Duration;

use pushstream_client::ClientStatus;
use pushstream_client::transport::TransportEvent;

use support::{client_with_fakes, establish_ws_session, wait_conn, wait_line, wait_status};

#[tokio::test(start_paused = true)]
async fn stall_then_recovery_carries_progressive() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    client.set_keepalive_interval(Duration::from_secs(5));
    client.set_stalled_timeout(Duration::from_secs(2));
    client.set_reconnect_timeout(Duration::from_secs(3));

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S31", 0, 0).await;

    // One data notification advances the recovery progressive, then the
    // server goes silent.
    let started = wait_status(&client, ClientStatus::WsStreaming).await;
    socket.emit_line("U,9,1,42");

    // keepalive (5s) + stalled timeout (2s): STALLED at t+7s.
    let stalled_at = wait_status(&client, ClientStatus::Stalled).await;
    let elapsed = stalled_at - started;
    assert!(
        elapsed >= Duration::from_millis(6_800) && elapsed <= Duration::from_millis(7_500),
        "stalled after {elapsed:?}"
    );

    // reconnect timeout (3s) later the session is abandoned and recovery
    // starts: t+10s.
    let recovering_at = wait_status(&client, ClientStatus::DisconnectedTryingRecovery).await;
    let elapsed = recovering_at - started;
    assert!(
        elapsed >= Duration::from_millis(9_800) && elapsed <= Duration::from_millis(10_500),
        "recovery after {elapsed:?}"
    );

    // The recovery session opens a fresh socket and sends a recover request
    // from the last received progressive.
    let recovery_socket = wait_conn(&ws, 1).await;
    recovery_socket.emit(TransportEvent::Opened);
    let recover = wait_line(&recovery_socket, "recover").await;
    assert!(recover.contains("session=S31"), "{recover}");
    assert!(recover.contains("recovery_from=1"), "{recover}");

    // The server resumes; the client is streaming again.
    recovery_socket.emit_line("CONOK,S31,50000,5000,*");
    wait_status(&client, ClientStatus::WsStreaming).await;
}

#[tokio::test(start_paused = true)]
async fn recovery_disabled_falls_back_to_retry() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    client.set_session_recovery_timeout(Duration::ZERO);
    client.set_retry_delay(Duration::from_millis(200));

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S32", 0, 0).await;

    socket.emit(TransportEvent::Closed {
        reason: "broken pipe".to_string(),
    });
    wait_status(&client, ClientStatus::DisconnectedWillRetry).await;

    // After the retry delay a fresh create (not a recover) goes out.
    let create = wait_conn(&http, 1).await;
    let line = wait_line(&create, "create_session").await;
    assert!(!line.contains("recover"), "{line}");
}

#[tokio::test(start_paused = true)]
async fn sync_error_on_recover_forces_fresh_create() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    client.set_retry_delay(Duration::from_millis(100));

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S33", 0, 0).await;

    socket.emit(TransportEvent::Closed {
        reason: "broken pipe".to_string(),
    });
    wait_status(&client, ClientStatus::DisconnectedTryingRecovery).await;

    let recovery_socket = wait_conn(&ws, 1).await;
    recovery_socket.emit(TransportEvent::Opened);
    wait_line(&recovery_socket, "recover").await;

    // The server refuses to resume: the next attempt is a fresh create.
    recovery_socket.emit_line("CONERR,41,sync error");
    wait_status(&client, ClientStatus::DisconnectedWillRetry).await;

    let create = wait_conn(&http, 1).await;
    wait_line(&create, "create_session").await;
}
