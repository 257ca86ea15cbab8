//! Transport providers.
//!
//! The session core consumes transports through the [`Transport`] /
//! [`TransportFactory`] contracts: a factory opens a connection toward a
//! target and immediately returns a handle, reporting progress through an
//! event sink ([`TransportEvent::Opened`], inbound [`TransportEvent::Line`]s,
//! termination). `abort` on an in-flight open resolves to
//! [`TransportEvent::Aborted`] without ever producing an `Opened` callback.
//!
//! Two providers ship with the crate: WebSocket ([`websocket`]) and HTTP
//! ([`http`]). Tests inject their own factories to script server behavior.

use url::Url;

pub mod http;
pub mod websocket;

pub use http::HttpTransportFactory;
pub use websocket::WsTransportFactory;

/// Errors produced by the transport providers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// WebSocket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP-level failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The connection closed while still in use.
    #[error("connection closed")]
    Closed,
}

/// Progress and data reported by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is established and writable.
    Opened,
    /// One inbound protocol line.
    Line(String),
    /// One HTTP exchange's response body finished cleanly. Never emitted by
    /// the WebSocket provider.
    StreamEnd,
    /// The connection failed or was closed by the peer.
    Closed {
        /// Human-readable cause.
        reason: String,
    },
    /// The connection attempt failed before `Opened`.
    OpenFailed {
        /// Human-readable cause.
        reason: String,
    },
    /// The connection or attempt was aborted locally.
    Aborted,
}

/// Callback receiving [`TransportEvent`]s; posts onto the session thread.
pub type EventSink = Box<dyn Fn(TransportEvent) + Send + Sync>;

/// Where a transport should connect.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Full endpoint URL, scheme already matched to the provider.
    pub url: Url,
    /// Declare explicit `Content-Length` on session requests (HTTP only).
    pub content_length_required: bool,
}

/// An open (or opening) connection.
///
/// `send` is non-blocking: the line is queued and written by the provider's
/// own task, and delivery failures come back through the event sink.
pub trait Transport: Send + Sync {
    /// Queue one request line for delivery.
    fn send(&self, line: String);
    /// Close gracefully. No further events are meaningful to the caller.
    fn close(&self);
    /// Tear down immediately, aborting an in-flight open if any.
    fn abort(&self);
}

/// Opens connections of one flavor (WebSocket or HTTP).
pub trait TransportFactory: Send + Sync {
    /// Start opening a connection and return its handle immediately.
    ///
    /// The sink receives `Opened` once writable (immediately for HTTP),
    /// `OpenFailed` or `Aborted` otherwise.
    fn open(&self, target: ConnectTarget, sink: EventSink) -> Box<dyn Transport>;
}

/// Path every session endpoint lives under.
const PUSH_PATH: &str = "/push";

/// Build the endpoint URL for a provider from the configured base address.
///
/// The base may carry any of the four schemes; it is re-mapped to `ws(s)` or
/// `http(s)` according to `websocket`, preserving TLS-ness.
#[must_use]
pub fn endpoint_url(base: &Url, websocket: bool) -> Url {
    let mut url = base.clone();
    let secure = matches!(base.scheme(), "https" | "wss");
    let scheme = match (websocket, secure) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    };
    // Scheme swaps between the four supported values cannot fail.
    let _ = url.set_scheme(scheme);
    url.set_path(PUSH_PATH);
    url
}

/// Re-target a URL at the control link returned by the server, keeping
/// scheme and path.
#[must_use]
pub fn apply_control_link(base: &Url, link: &str) -> Url {
    let mut url = base.clone();
    let (host, port) = match link.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (link, None),
        },
        None => (link, None),
    };
    if url.set_host(Some(host)).is_err() {
        return base.clone();
    }
    let _ = url.set_port(port);
    url
}

/// Accumulates byte chunks and yields complete lines.
///
/// Lines are `\n`-terminated with an optional preceding `\r`; a partial
/// trailing line is buffered until its terminator (or [`LineAssembler::finish`])
/// arrives.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }

    /// Drain a trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }
}

/// Split a WebSocket text frame into protocol lines.
#[must_use]
pub(crate) fn frame_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_maps_schemes() {
        let base = Url::parse("http://h:8080").unwrap();
        assert_eq!(endpoint_url(&base, true).as_str(), "ws://h:8080/push");
        assert_eq!(endpoint_url(&base, false).as_str(), "http://h:8080/push");

        let secure = Url::parse("wss://h").unwrap();
        assert_eq!(endpoint_url(&secure, false).scheme(), "https");
        assert_eq!(endpoint_url(&secure, true).scheme(), "wss");
    }

    #[test]
    fn control_link_replaces_host_and_port() {
        let base = Url::parse("ws://origin.example.com:8080/push").unwrap();
        let moved = apply_control_link(&base, "control.example.com");
        assert_eq!(moved.host_str(), Some("control.example.com"));
        assert_eq!(moved.port(), None);

        let with_port = apply_control_link(&base, "control.example.com:9090");
        assert_eq!(with_port.host_str(), Some("control.example.com"));
        assert_eq!(with_port.port(), Some(9090));
        assert_eq!(with_port.path(), "/push");
    }

    #[test]
    fn assembler_splits_and_buffers() {
        let mut assembler = LineAssembler::new();
        assert_eq!(
            assembler.push(b"CONOK,S1,50000,5000,*\r\nLOO"),
            vec!["CONOK,S1,50000,5000,*".to_string()]
        );
        assert_eq!(assembler.push(b"P,0\r\n"), vec!["LOOP,0".to_string()]);
        assert!(assembler.push(b"").is_empty());
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn assembler_tolerates_bare_newlines_and_blanks() {
        let mut assembler = LineAssembler::new();
        assert_eq!(
            assembler.push(b"PROBE\n\nPROBE\n"),
            vec!["PROBE".to_string(), "PROBE".to_string()]
        );
    }

    #[test]
    fn assembler_finish_flushes_partial() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.push(b"END,31,shutting down").is_empty());
        assert_eq!(assembler.finish(), Some("END,31,shutting down".to_string()));
    }

    #[test]
    fn frame_lines_splits_batched_frames() {
        assert_eq!(
            frame_lines("PROBE\r\nU,1,1,42\r\n"),
            vec!["PROBE".to_string(), "U,1,1,42".to_string()]
        );
        assert_eq!(frame_lines("PROBE"), vec!["PROBE".to_string()]);
    }
}
