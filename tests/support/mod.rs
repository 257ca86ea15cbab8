//! Shared test harness: scripted transports and recording listeners.
//!
//! Tests drive the client through [`FakeFactory`] transports: every
//! connection the core opens is captured as a [`FakeConn`] whose outbound
//! lines can be inspected and whose inbound events are injected by the
//! test, playing the server's side of the protocol.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pushstream_client::client::{ClientListener, MessageListener, SubscriptionListener};
use pushstream_client::transport::{
    ConnectTarget, EventSink, Transport, TransportEvent, TransportFactory,
};
use pushstream_client::{ClientStatus, ConnectionDetails, ItemUpdate, PushClient};

/// One captured connection: the client's outbound lines plus the sink for
/// injecting the server's side.
pub struct FakeConn {
    pub url: String,
    sink: EventSink,
    pub sent: Mutex<Vec<String>>,
    pub aborted: AtomicBool,
}

impl FakeConn {
    /// Inject one server line.
    pub fn emit_line(&self, line: &str) {
        (self.sink)(TransportEvent::Line(line.to_string()));
    }

    /// Inject an arbitrary transport event.
    pub fn emit(&self, event: TransportEvent) {
        (self.sink)(event);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

struct FakeHandle {
    conn: Arc<FakeConn>,
}

impl Transport for FakeHandle {
    fn send(&self, line: String) {
        self.conn.sent.lock().unwrap().push(line);
    }

    fn close(&self) {
        self.conn.aborted.store(true, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.conn.aborted.store(true, Ordering::SeqCst);
    }
}

/// Scripted transport factory. With `auto_open` the connection reports
/// `Opened` immediately (matching the real HTTP provider); otherwise the
/// test decides when, and whether, the handshake succeeds.
pub struct FakeFactory {
    auto_open: bool,
    conns: Mutex<Vec<Arc<FakeConn>>>,
}

impl FakeFactory {
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            auto_open: false,
            conns: Mutex::new(Vec::new()),
        })
    }

    pub fn auto() -> Arc<Self> {
        Arc::new(Self {
            auto_open: true,
            conns: Mutex::new(Vec::new()),
        })
    }

    pub fn conn_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn conn(&self, index: usize) -> Option<Arc<FakeConn>> {
        self.conns.lock().unwrap().get(index).cloned()
    }
}

impl TransportFactory for FakeFactory {
    fn open(&self, target: ConnectTarget, sink: EventSink) -> Box<dyn Transport> {
        if self.auto_open {
            sink(TransportEvent::Opened);
        }
        let conn = Arc::new(FakeConn {
            url: target.url.to_string(),
            sink,
            sent: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
        });
        self.conns.lock().unwrap().push(Arc::clone(&conn));
        Box::new(FakeHandle { conn })
    }
}

/// Client wired to fake transports: `(client, ws factory, http factory)`.
pub fn client_with_fakes(address: &str) -> (PushClient, Arc<FakeFactory>, Arc<FakeFactory>) {
    let details = ConnectionDetails::new(address, "DEMO").unwrap();
    let ws = FakeFactory::manual();
    let http = FakeFactory::auto();
    let client = PushClient::with_transports(
        details,
        Arc::clone(&ws) as Arc<dyn TransportFactory>,
        Arc::clone(&http) as Arc<dyn TransportFactory>,
    )
    .unwrap();
    (client, ws, http)
}

const POLL: Duration = Duration::from_millis(2);
const DEADLINE: Duration = Duration::from_secs(10);

/// Wait until the factory has opened its `index`-th connection.
pub async fn wait_conn(factory: &FakeFactory, index: usize) -> Arc<FakeConn> {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        if let Some(conn) = factory.conn(index) {
            return conn;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection {index} never opened"
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Wait for the first outbound line containing `needle`.
pub async fn wait_line(conn: &FakeConn, needle: &str) -> String {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        if let Some(line) = conn
            .sent
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.contains(needle))
        {
            return line.clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no line containing {needle:?}; sent so far: {:?}",
            conn.sent_lines()
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Wait for the observable status to become `status`; returns the moment it
/// was first observed.
pub async fn wait_status(client: &PushClient, status: ClientStatus) -> tokio::time::Instant {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        if client.status() == status {
            return tokio::time::Instant::now();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "status never became {status}, still {}",
            client.status()
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Wait until `check` returns true.
pub async fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        if check() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(POLL).await;
    }
}

/// Drive a fresh client through create and WebSocket bind to
/// `CONNECTED:WS-STREAMING`. Returns the bound socket.
pub async fn establish_ws_session(
    client: &PushClient,
    ws: &FakeFactory,
    http: &FakeFactory,
    session_id: &str,
    http_index: usize,
    ws_index: usize,
) -> Arc<FakeConn> {
    let create = wait_conn(http, http_index).await;
    wait_line(&create, "create_session").await;
    let socket = wait_conn(ws, ws_index).await;
    create.emit_line(&format!("CONOK,{session_id},50000,5000,*"));
    create.emit_line("LOOP,0");
    create.emit(TransportEvent::StreamEnd);
    socket.emit(TransportEvent::Opened);
    wait_line(&socket, "bind_session").await;
    socket.emit_line(&format!("CONOK,{session_id},50000,5000,*"));
    wait_status(client, ClientStatus::WsStreaming).await;
    socket
}

// =============================================================================
// Recording listeners
// =============================================================================

/// Records every status change in order.
#[derive(Default)]
pub struct StatusRecorder {
    pub statuses: Mutex<Vec<ClientStatus>>,
}

impl ClientListener for StatusRecorder {
    fn on_status_change(&self, status: ClientStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

impl StatusRecorder {
    pub fn snapshot(&self) -> Vec<ClientStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

/// Records subscription lifecycle events and updates as strings.
#[derive(Default)]
pub struct SubRecorder {
    pub events: Mutex<Vec<String>>,
}

impl SubRecorder {
    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl SubscriptionListener for SubRecorder {
    fn on_subscription(&self) {
        self.push("subscribed".to_string());
    }

    fn on_subscription_error(&self, code: u32, message: &str) {
        self.push(format!("error:{code}:{message}"));
    }

    fn on_unsubscription(&self) {
        self.push("unsubscribed".to_string());
    }

    fn on_item_update(&self, update: &ItemUpdate) {
        let values: Vec<String> = (1..=update.num_fields())
            .map(|pos| update.value(pos).unwrap_or("<null>").to_string())
            .collect();
        let command = update
            .command()
            .map(|c| format!("{c:?}:{}:", update.key().unwrap_or("")))
            .unwrap_or_default();
        self.push(format!(
            "update:{}:{}{}",
            update.item_pos(),
            command,
            values.join("|")
        ));
    }

    fn on_end_of_snapshot(&self, item_pos: u64, _item_name: Option<&str>) {
        self.push(format!("eos:{item_pos}"));
    }
}

/// Records message outcomes as `outcome:text` strings.
#[derive(Default)]
pub struct MsgRecorder {
    pub events: Mutex<Vec<String>>,
}

impl MsgRecorder {
    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl MessageListener for MsgRecorder {
    fn on_processed(&self, text: &str) {
        self.push(format!("processed:{text}"));
    }

    fn on_discarded(&self, text: &str) {
        self.push(format!("discarded:{text}"));
    }

    fn on_deny(&self, text: &str, code: i32, message: &str) {
        self.push(format!("deny:{text}:{code}:{message}"));
    }

    fn on_error(&self, text: &str) {
        self.push(format!("error:{text}"));
    }

    fn on_abort(&self, text: &str, sent: bool) {
        self.push(format!("abort:{text}:{sent}"));
    }
}
