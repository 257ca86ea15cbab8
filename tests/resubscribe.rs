//! Subscription lifecycle across session turnover.

mod support;

use std::sync::Arc;
use std::time::Duration;

use pushstream_client::transport::TransportEvent;
use pushstream_client::{ClientStatus, Subscription, SubscriptionMode};

use support::{
    SubRecorder, client_with_fakes, establish_ws_session, wait_conn, wait_line, wait_status,
    wait_until,
};

fn req_id_of(line: &str) -> String {
    line.split('&')
        .find_map(|p| p.strip_prefix("req_id="))
        .expect("line carries a req_id")
        .to_string()
}

#[tokio::test(start_paused = true)]
async fn resubscribe_with_fresh_sub_id_after_turnover() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    client.set_session_recovery_timeout(Duration::ZERO);
    client.set_retry_delay(Duration::from_millis(100));

    let recorder = Arc::new(SubRecorder::default());
    let sub = Subscription::with_item_group(SubscriptionMode::Merge, "items", "quote_fields")
        .unwrap();
    sub.add_listener(recorder.clone());
    client.subscribe(&sub).unwrap();

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S41", 0, 0).await;

    // First session: the subscription goes out with sub_id=1.
    let add1 = wait_line(&socket, "op=add").await;
    assert!(add1.contains("sub_id=1"), "{add1}");
    assert!(add1.contains("mode=MERGE"), "{add1}");
    assert!(add1.contains("group=items"), "{add1}");
    socket.emit_line(&format!("REQOK,{}", req_id_of(&add1)));
    socket.emit_line("SUBOK,1,1,2");
    wait_until(|| recorder.snapshot() == ["subscribed"], "first SUBOK").await;
    assert!(sub.is_subscribed());

    // An update flows through with resolved fields.
    socket.emit_line("U,1,1,100|200");
    wait_until(
        || recorder.snapshot().last().is_some_and(|e| e == "update:1:100|200"),
        "merged update",
    )
    .await;

    // Kill the transport; the next session re-issues the subscription with
    // a fresh id and the same parameters.
    socket.emit(TransportEvent::Closed {
        reason: "killed".to_string(),
    });
    wait_status(&client, ClientStatus::DisconnectedWillRetry).await;

    let socket2 = establish_ws_session(&client, &ws, &http, "S42", 1, 1).await;
    let add2 = wait_line(&socket2, "op=add").await;
    assert!(add2.contains("sub_id=2"), "{add2}");
    assert!(add2.contains("mode=MERGE"), "{add2}");
    assert!(add2.contains("group=items"), "{add2}");
    socket2.emit_line(&format!("REQOK,{}", req_id_of(&add2)));
    socket2.emit_line("SUBOK,2,1,2");

    // on_subscription fires once per session.
    wait_until(
        || {
            recorder
                .snapshot()
                .iter()
                .filter(|e| *e == "subscribed")
                .count()
                == 2
        },
        "second SUBOK",
    )
    .await;
}

#[tokio::test]
async fn reqerr_is_a_subscription_failure_and_never_resent() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    let recorder = Arc::new(SubRecorder::default());
    let sub =
        Subscription::with_item_list(SubscriptionMode::Merge, &["item1"], &["bid", "ask"]).unwrap();
    sub.add_listener(recorder.clone());
    client.subscribe(&sub).unwrap();

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S43", 0, 0).await;
    let add = wait_line(&socket, "op=add").await;
    socket.emit_line(&format!("REQERR,{},19,invalid group", req_id_of(&add)));

    wait_until(
        || recorder.snapshot() == ["error:19:invalid group"],
        "subscription error",
    )
    .await;
    assert!(!sub.is_active());
    let adds_sent = socket
        .sent_lines()
        .iter()
        .filter(|l| l.contains("op=add"))
        .count();
    assert_eq!(adds_sent, 1);
}

#[tokio::test]
async fn unsubscribe_releases_server_id() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    let recorder = Arc::new(SubRecorder::default());
    let sub =
        Subscription::with_item_list(SubscriptionMode::Merge, &["item1"], &["bid"]).unwrap();
    sub.add_listener(recorder.clone());
    client.subscribe(&sub).unwrap();

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S44", 0, 0).await;
    let add = wait_line(&socket, "op=add").await;
    socket.emit_line(&format!("REQOK,{}", req_id_of(&add)));
    socket.emit_line("SUBOK,1,1,1");
    wait_until(|| sub.is_subscribed(), "subscribed").await;

    client.unsubscribe(&sub).unwrap();
    let delete = wait_line(&socket, "op=delete").await;
    assert!(delete.contains("sub_id=1"), "{delete}");
    wait_until(
        || recorder.snapshot().contains(&"unsubscribed".to_string()),
        "unsubscription event",
    )
    .await;

    // UNSUB for an id removed before SUBOK (or already released) is ignored.
    socket.emit_line("UNSUB,1");
    socket.emit_line("UNSUB,99");
    socket.emit_line("PROBE");
    assert_eq!(client.status(), ClientStatus::WsStreaming);
}

#[tokio::test]
async fn command_mode_delete_then_add_are_distinct_events() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    let recorder = Arc::new(SubRecorder::default());
    let sub = Subscription::with_item_list(
        SubscriptionMode::Command,
        &["book"],
        &["key", "command", "qty"],
    )
    .unwrap();
    sub.set_requested_snapshot(false).unwrap();
    sub.add_listener(recorder.clone());
    client.subscribe(&sub).unwrap();

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S45", 0, 0).await;
    let add = wait_line(&socket, "op=add").await;
    assert!(add.contains("mode=COMMAND"), "{add}");
    socket.emit_line(&format!("REQOK,{}", req_id_of(&add)));
    socket.emit_line("SUBCMD,1,1,3,1,2");
    wait_until(|| sub.is_subscribed(), "subscribed").await;

    socket.emit_line("U,1,1,k1|ADD|10");
    socket.emit_line("U,1,1,k1|DELETE|#");
    socket.emit_line("U,1,1,k1|ADD|25");

    wait_until(|| recorder.snapshot().len() == 4, "three command events").await;
    let events = recorder.snapshot();
    assert_eq!(events[1], "update:1:Add:k1:k1|ADD|10");
    assert_eq!(events[2], "update:1:Delete:k1:k1|DELETE|<null>");
    // The re-added row does not inherit pre-delete state and arrives as its
    // own ADD event.
    assert_eq!(events[3], "update:1:Add:k1:k1|ADD|25");
}
