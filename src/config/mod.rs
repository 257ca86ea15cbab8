//! Connection configuration.
//!
//! [`ConnectionDetails`] identifies the server and the credentials presented
//! at session creation; [`ConnectionOptions`] collects every tunable the
//! session core consults at runtime. Option setters on the client post the
//! new value to the session thread, so a change takes effect on the next
//! decision point rather than mid-transition.

use std::time::Duration;

use url::Url;

use crate::error::ClientError;

/// Transport imposed by the application, bypassing stream-sense.
///
/// The two-level variants (`Ws`, `Http`) pin the transport but leave the
/// streaming-vs-polling decision to the client; the four specific variants
/// pin both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedTransport {
    /// WebSocket, streaming or polling as the client prefers.
    Ws,
    /// WebSocket streaming only.
    WsStreaming,
    /// WebSocket polling only.
    WsPolling,
    /// HTTP, streaming or polling as the client prefers.
    Http,
    /// HTTP streaming only.
    HttpStreaming,
    /// HTTP polling only.
    HttpPolling,
}

impl ForcedTransport {
    /// Parse the textual form used by the public setter.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] on an unrecognized name.
    pub fn parse(s: &str) -> Result<Self, ClientError> {
        match s {
            "WS" => Ok(Self::Ws),
            "WS-STREAMING" => Ok(Self::WsStreaming),
            "WS-POLLING" => Ok(Self::WsPolling),
            "HTTP" => Ok(Self::Http),
            "HTTP-STREAMING" => Ok(Self::HttpStreaming),
            "HTTP-POLLING" => Ok(Self::HttpPolling),
            other => Err(ClientError::Argument(format!(
                "unknown forced transport: {other}"
            ))),
        }
    }

    /// Textual form, matching the public setter values.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "WS",
            Self::WsStreaming => "WS-STREAMING",
            Self::WsPolling => "WS-POLLING",
            Self::Http => "HTTP",
            Self::HttpStreaming => "HTTP-STREAMING",
            Self::HttpPolling => "HTTP-POLLING",
        }
    }
}

/// Server identity and credentials for session creation.
#[derive(Clone)]
pub struct ConnectionDetails {
    /// Base server address (`http(s)://` or `ws(s)://`, host and optional
    /// port; no path).
    pub server_address: Url,
    /// Adapter set requested at session creation.
    pub adapter_set: String,
    /// Optional user name.
    pub user: Option<String>,
    /// Optional password, sent with `create_session` only.
    pub password: Option<String>,
}

impl ConnectionDetails {
    /// Validate and build connection details from a textual address.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if the address is not an absolute
    /// `http(s)`/`ws(s)` URL with a host, or if the adapter set is empty.
    pub fn new(server_address: &str, adapter_set: &str) -> Result<Self, ClientError> {
        let url = Url::parse(server_address)
            .map_err(|e| ClientError::Argument(format!("invalid server address: {e}")))?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(ClientError::Argument(format!(
                    "unsupported server address scheme: {other}"
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(ClientError::Argument(
                "server address has no host".to_string(),
            ));
        }
        if adapter_set.is_empty() {
            return Err(ClientError::Argument("empty adapter set".to_string()));
        }
        Ok(Self {
            server_address: url,
            adapter_set: adapter_set.to_string(),
            user: None,
            password: None,
        })
    }
}

impl std::fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("server_address", &self.server_address.as_str())
            .field("adapter_set", &self.adapter_set)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Runtime tunables consulted by the session core.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Transport imposed by the application; `None` enables stream-sense.
    pub forced_transport: Option<ForcedTransport>,
    /// Open the WebSocket handshake while the create round-trip is still in
    /// flight.
    pub early_ws_open_enabled: bool,
    /// Declare an explicit `Content-Length` on HTTP session requests, for
    /// intermediaries that reject chunked uploads.
    pub content_length_required: bool,
    /// Send a `heartbeat` control request when the upstream channel has been
    /// idle for this long. `None` disables reverse heartbeats.
    pub reverse_heartbeat_interval: Option<Duration>,
    /// Bandwidth cap requested from the server, in kilobits per second.
    /// `None` means unlimited.
    pub requested_max_bandwidth: Option<f64>,
    /// Maximum time the server may hold a polling request open waiting for
    /// data.
    pub idle_timeout: Duration,
    /// Expected interval between bytes on a healthy streaming connection.
    /// Overwritten by the value the server grants in `CONOK`.
    pub keepalive_interval: Duration,
    /// Extra silence tolerated beyond the keepalive interval before the
    /// status turns `STALLED`.
    pub stalled_timeout: Duration,
    /// Silence tolerated while `STALLED` before the connection is abandoned.
    pub reconnect_timeout: Duration,
    /// Pause between polling cycles.
    pub polling_interval: Duration,
    /// Base delay before recreating a session after a failure; grows
    /// exponentially up to [`ConnectionOptions::retry_delay_max`].
    pub retry_delay: Duration,
    /// Ceiling for the grown retry delay.
    pub retry_delay_max: Duration,
    /// Maximum wait for stream data after a bind before stream-sense steps
    /// down to polling.
    pub first_retry_max_delay: Duration,
    /// Time budget for resuming an interrupted session from the last
    /// received progressive. Zero disables recovery.
    pub session_recovery_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            forced_transport: None,
            early_ws_open_enabled: true,
            content_length_required: false,
            reverse_heartbeat_interval: None,
            requested_max_bandwidth: None,
            idle_timeout: Duration::from_secs(19),
            keepalive_interval: Duration::from_secs(5),
            stalled_timeout: Duration::from_secs(2),
            reconnect_timeout: Duration::from_secs(3),
            polling_interval: Duration::ZERO,
            retry_delay: Duration::from_secs(4),
            retry_delay_max: Duration::from_secs(60),
            first_retry_max_delay: Duration::from_millis(100),
            session_recovery_timeout: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_accepts_http_and_ws_schemes() {
        for addr in [
            "http://push.example.com",
            "https://push.example.com:8443",
            "ws://push.example.com:8080",
            "wss://push.example.com",
        ] {
            assert!(ConnectionDetails::new(addr, "DEMO").is_ok(), "{addr}");
        }
    }

    #[test]
    fn details_rejects_bad_addresses() {
        assert!(ConnectionDetails::new("ftp://example.com", "DEMO").is_err());
        assert!(ConnectionDetails::new("not a url", "DEMO").is_err());
        assert!(ConnectionDetails::new("http://example.com", "").is_err());
    }

    #[test]
    fn details_debug_redacts_password() {
        let mut details = ConnectionDetails::new("http://h:80", "DEMO").unwrap();
        details.password = Some("hunter2".to_string());
        let debug = format!("{details:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn forced_transport_round_trip() {
        for name in [
            "WS",
            "WS-STREAMING",
            "WS-POLLING",
            "HTTP",
            "HTTP-STREAMING",
            "HTTP-POLLING",
        ] {
            assert_eq!(ForcedTransport::parse(name).unwrap().as_str(), name);
        }
        assert!(ForcedTransport::parse("SMOKE-SIGNALS").is_err());
    }

    #[test]
    fn default_options() {
        let options = ConnectionOptions::default();
        assert!(options.forced_transport.is_none());
        assert!(options.early_ws_open_enabled);
        assert_eq!(options.retry_delay, Duration::from_secs(4));
        assert_eq!(options.session_recovery_timeout, Duration::from_secs(15));
    }
}
