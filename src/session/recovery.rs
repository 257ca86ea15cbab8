//! Session recovery state.

/// What an outgoing session leaves behind for its successor.
///
/// Produced when a session with a server id dies unexpectedly; the incoming
/// session uses it to decide between resuming (`recover` with the remembered
/// progressive), re-binding the same id on another transport, and a fresh
/// `create_session`.
#[derive(Debug, Clone)]
pub(crate) struct RecoveryBean {
    /// The server-assigned session id being carried over.
    pub session_id: String,
    /// Progressive of the last data notification received.
    pub progressive: u64,
    /// Whether the successor should replay missed events (`recover`) rather
    /// than just re-bind the id on a new channel.
    pub recovery: bool,
}

impl RecoveryBean {
    /// Bean for a transport switch: same session, new channel, no replay.
    pub(crate) fn rebind(session_id: String) -> Self {
        Self {
            session_id,
            progressive: 0,
            recovery: false,
        }
    }

    /// Bean for true recovery: replay from the given progressive.
    pub(crate) fn recover(session_id: String, progressive: u64) -> Self {
        Self {
            session_id,
            progressive,
            recovery: true,
        }
    }
}
