//! Sequenced message pipeline: ordering, failure handling, and the
//! enqueue-while-disconnected contract.

mod support;

use std::sync::Arc;
use std::time::Duration;

use pushstream_client::ClientStatus;
use pushstream_client::protocol::{MessageRequest, Request};

use support::{MsgRecorder, client_with_fakes, establish_ws_session, wait_line, wait_until};

fn parse_msg(line: &str) -> MessageRequest {
    match Request::parse(line).expect("valid request line") {
        Request::Message(message) => message,
        other => panic!("expected msg request, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_progressive_does_not_block_successors() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    let recorder = Arc::new(MsgRecorder::default());

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S51", 0, 0).await;

    for text in ["m1", "m2", "m3"] {
        client
            .send_message_with(text, Some("s"), None, Some(recorder.clone()), false)
            .unwrap();
    }

    // All three go out immediately with contiguous progressives; ordering
    // is the server's job.
    wait_until(
        || {
            socket
                .sent_lines()
                .iter()
                .filter(|l| l.starts_with("msg&"))
                .count()
                == 3
        },
        "three msg requests",
    )
    .await;
    let sent: Vec<MessageRequest> = socket
        .sent_lines()
        .iter()
        .filter(|l| l.starts_with("msg&"))
        .map(|l| parse_msg(l))
        .collect();
    assert_eq!(sent[0].prog, Some(1));
    assert_eq!(sent[1].prog, Some(2));
    assert_eq!(sent[2].prog, Some(3));
    assert!(sent.iter().all(|m| m.sequence == "s" && m.needs_ack));

    // m2 times out server-side; m3 is processed regardless.
    socket.emit_line("MSGDONE,s,1");
    socket.emit_line("MSGFAIL,s,2,39,timeout exceeded");
    socket.emit_line("MSGDONE,s,3");

    wait_until(|| recorder.snapshot().len() == 3, "three outcomes").await;
    assert_eq!(
        recorder.snapshot(),
        vec!["processed:m1", "discarded:m2", "processed:m3"]
    );
}

#[tokio::test]
async fn adapter_denial_reaches_the_listener() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    let recorder = Arc::new(MsgRecorder::default());

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S52", 0, 0).await;

    client
        .send_message_with("order", Some("s"), None, Some(recorder.clone()), false)
        .unwrap();
    wait_line(&socket, "msg&").await;
    socket.emit_line("MSGFAIL,s,1,-5,insufficient funds");

    wait_until(
        || recorder.snapshot() == ["deny:order:-5:insufficient funds"],
        "denial",
    )
    .await;
}

#[tokio::test]
async fn disconnected_messages_abort_unless_flagged() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    let rejected = Arc::new(MsgRecorder::default());
    let queued = Arc::new(MsgRecorder::default());

    // Without the flag the message is rejected locally while disconnected.
    client
        .send_message_with("nope", Some("s"), None, Some(rejected.clone()), false)
        .unwrap();
    wait_until(|| rejected.snapshot() == ["abort:nope:false"], "local abort").await;

    // With the flag it waits for the next receiving session.
    client
        .send_message_with("later", Some("s"), None, Some(queued.clone()), true)
        .unwrap();

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S53", 0, 0).await;
    let line = wait_line(&socket, "msg&").await;
    let message = parse_msg(&line);
    assert_eq!(message.text, "later");
    socket.emit_line(&format!("MSGDONE,s,{}", message.prog.unwrap()));
    wait_until(|| queued.snapshot() == ["processed:later"], "processed").await;
}

#[tokio::test(start_paused = true)]
async fn delay_timeout_discards_exactly_once() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");
    let recorder = Arc::new(MsgRecorder::default());

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S54", 0, 0).await;

    client
        .send_message_with(
            "slow",
            Some("s"),
            Some(Duration::from_secs(2)),
            Some(recorder.clone()),
            false,
        )
        .unwrap();
    wait_line(&socket, "msg&").await;

    // No MSGDONE within the delay timeout: abandoned locally.
    wait_until(|| recorder.snapshot() == ["discarded:slow"], "discard").await;

    // A late MSGDONE for the abandoned progressive is a no-op.
    socket.emit_line("MSGDONE,s,1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.snapshot(), vec!["discarded:slow"]);
    assert_eq!(client.status(), ClientStatus::WsStreaming);
}

#[tokio::test]
async fn unordered_without_listener_is_fire_and_forget() {
    let (client, ws, http) = client_with_fakes("http://push.test:8080");

    client.connect();
    let socket = establish_ws_session(&client, &ws, &http, "S55", 0, 0).await;

    client.send_message("ping");
    let line = wait_line(&socket, "msg&").await;
    let message = parse_msg(&line);
    assert_eq!(message.sequence, "UNORDERED_MESSAGES");
    assert_eq!(message.prog, None);
    assert!(!message.needs_ack);
}
