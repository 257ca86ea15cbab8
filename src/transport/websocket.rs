//! WebSocket transport provider.
//!
//! One connection per transport: the handshake runs in a dedicated task and
//! the handle is returned immediately, which is what makes early WS open
//! possible (the session core opens the socket while the create round-trip
//! is still in flight and binds over it later). Aborting during the
//! handshake resolves to [`TransportEvent::Aborted`] without an `Opened`.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_util::sync::CancellationToken;

use super::{ConnectTarget, EventSink, Transport, TransportEvent, TransportFactory, frame_lines};
use crate::environment;

/// Factory for WebSocket connections.
#[derive(Debug, Default)]
pub struct WsTransportFactory;

impl WsTransportFactory {
    /// Create the factory.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for WsTransportFactory {
    fn open(&self, target: ConnectTarget, sink: EventSink) -> Box<dyn Transport> {
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();
        tokio::spawn(run_connection(target, sink, line_rx, cancel.clone()));
        Box::new(WsTransport { line_tx, cancel })
    }
}

/// Handle over a live (or opening) WebSocket connection.
struct WsTransport {
    line_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Transport for WsTransport {
    fn send(&self, line: String) {
        // Dropped when the connection task has already exited; the sink has
        // reported Closed by then.
        let _ = self.line_tx.send(line);
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn abort(&self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    target: ConnectTarget,
    sink: EventSink,
    mut line_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let env = environment::current();
    let mut request = match target.url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            sink(TransportEvent::OpenFailed {
                reason: e.to_string(),
            });
            return;
        }
    };
    if let Some(cookies) = env.cookie_header(&target.url) {
        if let Ok(value) = cookies.parse() {
            request.headers_mut().insert(COOKIE, value);
        }
    }

    tracing::debug!(url = %target.url, "opening WebSocket connection");
    let connector = Connector::Rustls(env.ws_tls());
    let handshake =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector));

    let ws_stream = tokio::select! {
        () = cancel.cancelled() => {
            tracing::debug!(url = %target.url, "WebSocket open aborted");
            sink(TransportEvent::Aborted);
            return;
        }
        result = handshake => match result {
            Ok((stream, _response)) => stream,
            Err(e) => {
                tracing::warn!(url = %target.url, error = %e, "WebSocket open failed");
                sink(TransportEvent::OpenFailed { reason: e.to_string() });
                return;
            }
        }
    };

    sink(TransportEvent::Opened);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                sink(TransportEvent::Aborted);
                return;
            }
            outbound = line_rx.recv() => {
                match outbound {
                    Some(line) => {
                        if let Err(e) = write.send(Message::Text(line.into())).await {
                            sink(TransportEvent::Closed { reason: e.to_string() });
                            return;
                        }
                    }
                    // Handle dropped without close(): shut down quietly.
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        for line in frame_lines(&text) {
                            sink(TransportEvent::Line(line));
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        sink(TransportEvent::Closed { reason: "server close frame".to_string() });
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        sink(TransportEvent::Closed { reason: e.to_string() });
                        return;
                    }
                    None => {
                        sink(TransportEvent::Closed { reason: "stream ended".to_string() });
                        return;
                    }
                }
            }
        }
    }
}
