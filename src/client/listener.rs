//! Listener traits.
//!
//! Listeners are invoked on a dedicated events task, never on the session
//! thread, so application callbacks cannot stall the protocol. Invocation
//! order is preserved per listener object. All methods default to no-ops;
//! implement the ones of interest.

use crate::client::status::ClientStatus;
use crate::error::ServerError;
use crate::subscription::ItemUpdate;

/// Receives client-level lifecycle events.
pub trait ClientListener: Send + Sync {
    /// The observable status changed.
    fn on_status_change(&self, _status: ClientStatus) {}

    /// The server reported a fatal condition; no retry is scheduled.
    fn on_server_error(&self, _error: &ServerError) {}

    /// A server-controlled connection property changed (for example the
    /// granted keepalive interval).
    fn on_property_change(&self, _property: &str) {}
}

/// Receives events for one subscription.
pub trait SubscriptionListener: Send + Sync {
    /// The subscription is active on the server.
    ///
    /// Fires once per session holding it; a session turnover that
    /// re-subscribes fires it again.
    fn on_subscription(&self) {}

    /// The subscription request was refused.
    fn on_subscription_error(&self, _code: u32, _message: &str) {}

    /// The subscription is no longer active on the server.
    fn on_unsubscription(&self) {}

    /// An item update arrived.
    fn on_item_update(&self, _update: &ItemUpdate) {}

    /// The snapshot for an item is complete.
    fn on_end_of_snapshot(&self, _item_pos: u64, _item_name: Option<&str>) {}

    /// The server invalidated the current state of an item.
    fn on_clear_snapshot(&self, _item_pos: u64, _item_name: Option<&str>) {}

    /// The server dropped updates for a slow consumer.
    fn on_item_lost_updates(&self, _item_pos: u64, _lost: u64) {}

    /// The effective update frequency granted by the server; `None` means
    /// unlimited.
    fn on_real_max_frequency(&self, _frequency: Option<f64>) {}
}

/// Receives the outcome of one sent message.
pub trait MessageListener: Send + Sync {
    /// The Metadata Adapter processed the message.
    fn on_processed(&self, _text: &str) {}

    /// The message was abandoned: its delivery window expired, locally or
    /// server-side. Fires exactly once per abandoned message.
    fn on_discarded(&self, _text: &str) {}

    /// The Metadata Adapter refused the message. Negative codes come from
    /// the adapter itself.
    fn on_deny(&self, _text: &str, _code: i32, _message: &str) {}

    /// The request failed in a way that leaves the outcome unknown.
    fn on_error(&self, _text: &str) {}

    /// The message was dropped before reaching the server, typically
    /// because the client is disconnected.
    fn on_abort(&self, _text: &str, _sent: bool) {}
}
