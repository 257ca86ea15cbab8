//! HTTP transport provider.
//!
//! Every `send` is one request/response exchange against the session
//! endpoint; the response body is consumed as a chunked stream and sliced
//! into protocol lines. A streaming bind holds its exchange open for the
//! session's lifetime, a polling bind or a control request completes
//! quickly with [`TransportEvent::StreamEnd`]. The handle reports `Opened`
//! immediately since there is no standing connection to establish.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    ConnectTarget, EventSink, LineAssembler, Transport, TransportError, TransportEvent,
    TransportFactory,
};
use crate::environment;

/// Factory for HTTP exchanges sharing one connection pool and cookie jar.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    /// Build the factory, applying the process-wide environment.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Http`] when the underlying client cannot be
    /// constructed.
    pub fn new() -> Result<Self, TransportError> {
        let env = environment::current();
        let mut builder = reqwest::Client::builder().cookie_provider(env.cookie_jar());
        if env.accept_invalid_certs() {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn open(&self, target: ConnectTarget, sink: EventSink) -> Box<dyn Transport> {
        sink(TransportEvent::Opened);
        let sink = Arc::new(sink);
        Box::new(HttpTransport {
            client: self.client.clone(),
            target,
            sink,
            cancel: CancellationToken::new(),
        })
    }
}

/// Handle multiplexing request/response exchanges toward one endpoint.
struct HttpTransport {
    client: reqwest::Client,
    target: ConnectTarget,
    sink: Arc<EventSink>,
    cancel: CancellationToken,
}

impl Transport for HttpTransport {
    fn send(&self, line: String) {
        let client = self.client.clone();
        let target = self.target.clone();
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => (*sink)(TransportEvent::Aborted),
                () = run_exchange(client, target, line, sink.as_ref()) => {}
            }
        });
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn abort(&self) {
        self.cancel.cancel();
    }
}

async fn run_exchange(
    client: reqwest::Client,
    target: ConnectTarget,
    line: String,
    sink: &EventSink,
) {
    let mut request = client
        .post(target.url.clone())
        .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if target.content_length_required {
        request = request.header(reqwest::header::CONTENT_LENGTH, line.len());
    }

    let response = match request.body(line).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %target.url, error = %e, "HTTP exchange failed");
            sink(TransportEvent::Closed {
                reason: e.to_string(),
            });
            return;
        }
    };
    if !response.status().is_success() {
        sink(TransportEvent::Closed {
            reason: format!("http status {}", response.status()),
        });
        return;
    }

    let mut assembler = LineAssembler::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for line in assembler.push(&bytes) {
                    sink(TransportEvent::Line(line));
                }
            }
            Err(e) => {
                sink(TransportEvent::Closed {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
    if let Some(trailing) = assembler.finish() {
        sink(TransportEvent::Line(trailing));
    }
    sink(TransportEvent::StreamEnd);
}
