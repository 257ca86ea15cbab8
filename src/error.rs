//! Error taxonomy for the client.
//!
//! Recoverable conditions (transport drops, retryable server codes) never
//! surface as errors from public methods; they are absorbed by the retry and
//! recovery machinery. Public methods fail synchronously only on programmer
//! errors, and fatal server conditions reach the application through
//! [`ClientListener::on_server_error`](crate::client::ClientListener::on_server_error).

/// Errors returned synchronously by the public API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An argument was malformed (bad server address, empty item list,
    /// invalid sequence name).
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The call is not legal in the object's current state (subscribing an
    /// already-active subscription, mutating an active subscription).
    #[error("illegal state: {0}")]
    Usage(String),

    /// The process-wide environment was already configured, or a client has
    /// already been constructed.
    #[error("environment already configured")]
    EnvironmentLocked,
}

/// A fatal condition reported by the server.
///
/// Delivered through `ClientListener::on_server_error`; the client moves to
/// `DISCONNECTED` and schedules no retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Server-assigned error code.
    pub code: u32,
    /// Human-readable message from the server.
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let err = ServerError {
            code: 7,
            message: "licensed maximum exceeded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "server error 7: licensed maximum exceeded"
        );
    }

    #[test]
    fn client_error_display() {
        let err = ClientError::Argument("empty item list".to_string());
        assert_eq!(err.to_string(), "invalid argument: empty item list");
    }
}
