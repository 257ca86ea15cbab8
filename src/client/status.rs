//! Observable client status.

/// Connection status observable through
/// [`PushClient::status`](crate::client::PushClient::status).
///
/// Exactly one status is active at any time and transitions are totally
/// ordered within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// No connection and none pending.
    Disconnected,
    /// Connection lost; a new attempt is scheduled.
    DisconnectedWillRetry,
    /// Connection lost; a recovery attempt is in progress.
    DisconnectedTryingRecovery,
    /// Session creation in progress.
    Connecting,
    /// Session created; transport still being probed.
    StreamSensing,
    /// Receiving over WebSocket streaming.
    WsStreaming,
    /// Receiving over HTTP streaming.
    HttpStreaming,
    /// Receiving over WebSocket polling.
    WsPolling,
    /// Receiving over HTTP polling.
    HttpPolling,
    /// Connected but no data within the keepalive budget.
    Stalled,
}

impl ClientStatus {
    /// Textual form matching the published status strings.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::DisconnectedWillRetry => "DISCONNECTED:WILL-RETRY",
            Self::DisconnectedTryingRecovery => "DISCONNECTED:TRYING-RECOVERY",
            Self::Connecting => "CONNECTING",
            Self::StreamSensing => "CONNECTED:STREAM-SENSING",
            Self::WsStreaming => "CONNECTED:WS-STREAMING",
            Self::HttpStreaming => "CONNECTED:HTTP-STREAMING",
            Self::WsPolling => "CONNECTED:WS-POLLING",
            Self::HttpPolling => "CONNECTED:HTTP-POLLING",
            Self::Stalled => "STALLED",
        }
    }

    /// Whether this is one of the `DISCONNECTED*` statuses.
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::DisconnectedWillRetry | Self::DisconnectedTryingRecovery
        )
    }

    /// Whether a session is established and delivering (or expected to
    /// deliver) data.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::StreamSensing
                | Self::WsStreaming
                | Self::HttpStreaming
                | Self::WsPolling
                | Self::HttpPolling
                | Self::Stalled
        )
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(ClientStatus::Disconnected.as_str(), "DISCONNECTED");
        assert_eq!(
            ClientStatus::DisconnectedWillRetry.as_str(),
            "DISCONNECTED:WILL-RETRY"
        );
        assert_eq!(
            ClientStatus::DisconnectedTryingRecovery.as_str(),
            "DISCONNECTED:TRYING-RECOVERY"
        );
        assert_eq!(ClientStatus::StreamSensing.as_str(), "CONNECTED:STREAM-SENSING");
        assert_eq!(ClientStatus::WsStreaming.as_str(), "CONNECTED:WS-STREAMING");
        assert_eq!(ClientStatus::Stalled.as_str(), "STALLED");
    }

    #[test]
    fn classification() {
        assert!(ClientStatus::Disconnected.is_disconnected());
        assert!(ClientStatus::DisconnectedTryingRecovery.is_disconnected());
        assert!(!ClientStatus::Connecting.is_disconnected());
        assert!(ClientStatus::WsStreaming.is_connected());
        assert!(ClientStatus::Stalled.is_connected());
        assert!(!ClientStatus::Connecting.is_connected());
    }
}
