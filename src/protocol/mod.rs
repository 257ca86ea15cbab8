//! Wire protocol codec.
//!
//! The server speaks a line-oriented text protocol: each client request is a
//! single line of `name=value` parameters joined by `&`, each server
//! notification is a single line of `,`-separated fields introduced by a
//! directive name. Reserved characters travel percent-escaped; update fields
//! are `|`-separated with `#` for null, `$` for the empty string, and an
//! empty slot meaning "unchanged".
//!
//! The codec is stateless between sessions: every line maps to exactly one
//! typed value, and encoding is the exact inverse of decoding for canonical
//! input.

pub mod escape;
pub mod notification;
pub mod request;

pub use notification::{FieldValue, Notification};
pub use request::{
    BindSessionRequest, ControlOp, ControlRequest, CreateSessionRequest, MessageRequest,
    PollingParams, RecoverRequest, Request,
};

/// Client identifier sent with `create_session`.
pub const CLIENT_CID: &str = concat!("pushstream-client/", env!("CARGO_PKG_VERSION"));

/// Codec errors.
///
/// An unknown directive is recoverable at the session level (the session is
/// abandoned and recreated); every other variant indicates a malformed line.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Empty input line.
    #[error("empty line")]
    Empty,

    /// Inbound directive name not known to this client.
    #[error("unknown directive: {0}")]
    UnknownDirective(String),

    /// Request verb not known to this client.
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    /// A required field or parameter was absent.
    #[error("{directive}: missing {field}")]
    MissingField {
        /// Directive or request verb.
        directive: &'static str,
        /// Name of the absent field.
        field: &'static str,
    },

    /// A field was present but unparseable.
    #[error("{directive}: invalid {field}")]
    InvalidField {
        /// Directive or request verb.
        directive: &'static str,
        /// Name of the offending field.
        field: &'static str,
    },

    /// A percent escape did not decode to valid UTF-8.
    #[error("invalid escape sequence")]
    InvalidEscape,
}
