//! Public façade.
//!
//! [`PushClient`] is the application's handle: thread-safe, cheap to share,
//! and fully asynchronous underneath. Every call that touches server-visible
//! state is posted as a message to the session thread; the façade itself
//! holds locks only around its own copies of options, the listener list and
//! the subscription array. Listener callbacks arrive on a dedicated events
//! task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{ConnectionDetails, ConnectionOptions, ForcedTransport};
use crate::error::ClientError;
use crate::message::{MessageManager, OutgoingMessage, UNORDERED_SEQUENCE};
use crate::scheduler::{
    self, ClientCommand, Core, CoreCtx, CoreEvent, EventDispatcher, OptionChange, SharedListeners,
    StatusOwner, Timers,
};
use crate::subscription::Subscription;
use crate::subscription::manager::SubscriptionManager;
use crate::transport::{HttpTransportFactory, TransportFactory, WsTransportFactory};

pub mod listener;
pub mod status;

pub use listener::{ClientListener, MessageListener, SubscriptionListener};
pub use status::ClientStatus;

struct ClientInner {
    details: Mutex<ConnectionDetails>,
    options: Mutex<ConnectionOptions>,
    listeners: SharedListeners,
    subscriptions: Mutex<Vec<Subscription>>,
    status_rx: watch::Receiver<ClientStatus>,
    cmd_tx: mpsc::UnboundedSender<CoreEvent>,
    handles: Mutex<Option<(tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>)>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Stops the session thread if the application never called
        // disconnect_and_join.
        let (done, _) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(CoreEvent::Command(ClientCommand::Shutdown { done }));
    }
}

/// Client of one push server.
///
/// Must be constructed inside a tokio runtime: the session and events tasks
/// are spawned at construction time.
#[derive(Clone)]
pub struct PushClient {
    inner: Arc<ClientInner>,
}

impl PushClient {
    /// Build a client for the given server address and adapter set, using
    /// the built-in WebSocket and HTTP transports.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] for a malformed address or empty
    /// adapter set, or when the HTTP client cannot be constructed.
    pub fn new(server_address: &str, adapter_set: &str) -> Result<Self, ClientError> {
        let details = ConnectionDetails::new(server_address, adapter_set)?;
        let ws_factory: Arc<dyn TransportFactory> = Arc::new(WsTransportFactory::new());
        let http_factory: Arc<dyn TransportFactory> = Arc::new(
            HttpTransportFactory::new()
                .map_err(|e| ClientError::Argument(format!("http transport: {e}")))?,
        );
        Self::with_transports(details, ws_factory, http_factory)
    }

    /// Build a client over custom transport factories.
    ///
    /// The normal entry point is [`PushClient::new`]; this one exists for
    /// environments with their own socket stacks, and for tests injecting
    /// scripted transports.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the signature aligned with
    /// [`PushClient::new`].
    pub fn with_transports(
        details: ConnectionDetails,
        ws_factory: Arc<dyn TransportFactory>,
        http_factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ClientError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel::<CoreEvent>();
        let (status_tx, status_rx) = watch::channel(ClientStatus::Disconnected);
        let listeners: SharedListeners = Arc::new(RwLock::new(Vec::new()));
        let (dispatcher, events_handle) = EventDispatcher::spawn();

        let ctx = CoreCtx {
            details: details.clone(),
            options: ConnectionOptions::default(),
            subscriptions: SubscriptionManager::new(),
            messages: MessageManager::new(),
            dispatcher,
            timers: Timers::new(),
            status: StatusOwner::new(status_tx, Arc::clone(&listeners)),
            ws_factory,
            http_factory,
            events_tx: events_tx.clone(),
            next_req_id: 0,
            pending: HashMap::new(),
        };
        let core_handle = tokio::spawn(scheduler::run(Core::new(ctx), events_rx));

        Ok(Self {
            inner: Arc::new(ClientInner {
                details: Mutex::new(details),
                options: Mutex::new(ConnectionOptions::default()),
                listeners,
                subscriptions: Mutex::new(Vec::new()),
                status_rx,
                cmd_tx: events_tx,
                handles: Mutex::new(Some((core_handle, events_handle))),
            }),
        })
    }

    fn send(&self, command: ClientCommand) {
        // Fails only after shutdown; commands are then meaningless.
        let _ = self.inner.cmd_tx.send(CoreEvent::Command(command));
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open (or keep open) a session. Idempotent.
    pub fn connect(&self) {
        self.send(ClientCommand::Connect);
    }

    /// Close the session and stop retrying. Idempotent; the client can
    /// connect again later.
    pub fn disconnect(&self) {
        self.send(ClientCommand::Disconnect { done: None });
    }

    /// Disconnect, stop both internal tasks, and wait until they have
    /// drained. The client is unusable afterwards.
    pub async fn disconnect_and_join(&self) {
        let (done, done_rx) = oneshot::channel();
        self.send(ClientCommand::Shutdown { done });
        let _ = done_rx.await;
        let handles = self.inner.handles.lock().take();
        if let Some((core, events)) = handles {
            let _ = core.await;
            let _ = events.await;
        }
    }

    /// The current observable status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        *self.inner.status_rx.borrow()
    }

    /// Register a client listener.
    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Remove a client listener (matched by identity).
    pub fn remove_listener(&self, listener: &Arc<dyn ClientListener>) {
        self.inner
            .listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Set the user name presented at session creation.
    pub fn set_user(&self, user: Option<String>) {
        let mut details = self.inner.details.lock();
        details.user = user;
        self.send(ClientCommand::Credentials {
            user: details.user.clone(),
            password: details.password.clone(),
        });
    }

    /// Set the password presented at session creation.
    pub fn set_password(&self, password: Option<String>) {
        let mut details = self.inner.details.lock();
        details.password = password;
        self.send(ClientCommand::Credentials {
            user: details.user.clone(),
            password: details.password.clone(),
        });
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Activate a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Usage`] if the subscription is already active
    /// (here or on another client).
    pub fn subscribe(&self, subscription: &Subscription) -> Result<(), ClientError> {
        if !subscription.mark_registered() {
            return Err(ClientError::Usage(
                "subscription is already active".to_string(),
            ));
        }
        self.inner.subscriptions.lock().push(subscription.clone());
        self.send(ClientCommand::Subscribe(subscription.clone()));
        Ok(())
    }

    /// Deactivate a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Usage`] if the subscription is not active.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<(), ClientError> {
        if !subscription.mark_unregistered() {
            return Err(ClientError::Usage("subscription is not active".to_string()));
        }
        self.inner
            .subscriptions
            .lock()
            .retain(|s| !s.same_as(subscription));
        self.send(ClientCommand::Unsubscribe(subscription.clone()));
        Ok(())
    }

    /// The subscriptions currently registered with this client.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Send a fire-and-forget message: unordered, unacknowledged, dropped
    /// if the client is disconnected.
    pub fn send_message(&self, text: &str) {
        self.send(ClientCommand::SendMessage(OutgoingMessage {
            text: text.to_string(),
            sequence: UNORDERED_SEQUENCE.to_string(),
            delay_timeout: None,
            listener: None,
            enqueue_while_disconnected: false,
        }));
    }

    /// Send a message with full control over sequencing and outcome
    /// reporting.
    ///
    /// `sequence: None` selects the unordered pipeline. A named sequence
    /// guarantees in-order processing by the Metadata Adapter;
    /// `delay_timeout` bounds how long delivery (and server-side
    /// reordering) may take before the message is abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] for an invalid sequence name
    /// (letters, digits and underscores only).
    pub fn send_message_with(
        &self,
        text: &str,
        sequence: Option<&str>,
        delay_timeout: Option<Duration>,
        listener: Option<Arc<dyn MessageListener>>,
        enqueue_while_disconnected: bool,
    ) -> Result<(), ClientError> {
        let sequence = match sequence {
            None => UNORDERED_SEQUENCE.to_string(),
            Some(name) => {
                if name.is_empty()
                    || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(ClientError::Argument(format!(
                        "invalid sequence name: {name:?}"
                    )));
                }
                name.to_string()
            }
        };
        self.send(ClientCommand::SendMessage(OutgoingMessage {
            text: text.to_string(),
            sequence,
            delay_timeout,
            listener,
            enqueue_while_disconnected,
        }));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Options
    // -------------------------------------------------------------------------

    /// Impose a transport, or restore stream-sense with `None`. Takes
    /// effect immediately, switching the transport of a live session.
    pub fn set_forced_transport(&self, forced: Option<ForcedTransport>) {
        self.inner.options.lock().forced_transport = forced;
        self.send(ClientCommand::Option(OptionChange::ForcedTransport(forced)));
    }

    /// Overlap the WebSocket handshake with the create round-trip.
    pub fn set_early_ws_open_enabled(&self, enabled: bool) {
        self.inner.options.lock().early_ws_open_enabled = enabled;
        self.send(ClientCommand::Option(OptionChange::EarlyWsOpen(enabled)));
    }

    /// Declare explicit `Content-Length` on HTTP session requests.
    pub fn set_content_length_required(&self, required: bool) {
        self.inner.options.lock().content_length_required = required;
        self.send(ClientCommand::Option(OptionChange::ContentLengthRequired(
            required,
        )));
    }

    /// Keep an idle upstream channel alive with periodic heartbeats.
    pub fn set_reverse_heartbeat_interval(&self, interval: Option<Duration>) {
        self.inner.options.lock().reverse_heartbeat_interval = interval;
        self.send(ClientCommand::Option(OptionChange::ReverseHeartbeat(
            interval,
        )));
    }

    /// Cap the session bandwidth, in kilobits per second; `None` for
    /// unlimited. Applied to a live session via a constrain request.
    pub fn set_requested_max_bandwidth(&self, bandwidth: Option<f64>) {
        self.inner.options.lock().requested_max_bandwidth = bandwidth;
        self.send(ClientCommand::Option(OptionChange::MaxBandwidth(bandwidth)));
    }

    /// Longest the server may hold a polling request open.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.inner.options.lock().idle_timeout = timeout;
        self.send(ClientCommand::Option(OptionChange::IdleTimeout(timeout)));
    }

    /// Expected interval between bytes on a healthy streaming connection.
    pub fn set_keepalive_interval(&self, interval: Duration) {
        self.inner.options.lock().keepalive_interval = interval;
        self.send(ClientCommand::Option(OptionChange::KeepaliveInterval(
            interval,
        )));
    }

    /// Extra silence tolerated before the status turns `STALLED`.
    pub fn set_stalled_timeout(&self, timeout: Duration) {
        self.inner.options.lock().stalled_timeout = timeout;
        self.send(ClientCommand::Option(OptionChange::StalledTimeout(timeout)));
    }

    /// Silence tolerated while `STALLED` before the connection is dropped.
    pub fn set_reconnect_timeout(&self, timeout: Duration) {
        self.inner.options.lock().reconnect_timeout = timeout;
        self.send(ClientCommand::Option(OptionChange::ReconnectTimeout(
            timeout,
        )));
    }

    /// Pause between polling cycles.
    pub fn set_polling_interval(&self, interval: Duration) {
        self.inner.options.lock().polling_interval = interval;
        self.send(ClientCommand::Option(OptionChange::PollingInterval(
            interval,
        )));
    }

    /// Base delay before recreating a session after a failure.
    pub fn set_retry_delay(&self, delay: Duration) {
        self.inner.options.lock().retry_delay = delay;
        self.send(ClientCommand::Option(OptionChange::RetryDelay(delay)));
    }

    /// Wait budget for stream data after a bind before stream-sense steps
    /// down to polling.
    pub fn set_first_retry_max_delay(&self, delay: Duration) {
        self.inner.options.lock().first_retry_max_delay = delay;
        self.send(ClientCommand::Option(OptionChange::FirstRetryMaxDelay(
            delay,
        )));
    }

    /// Time budget for resuming an interrupted session. Zero disables
    /// recovery.
    pub fn set_session_recovery_timeout(&self, timeout: Duration) {
        self.inner.options.lock().session_recovery_timeout = timeout;
        self.send(ClientCommand::Option(OptionChange::SessionRecoveryTimeout(
            timeout,
        )));
    }

    /// Snapshot of the current options, as last set through this façade.
    #[must_use]
    pub fn options(&self) -> ConnectionOptions {
        self.inner.options.lock().clone()
    }
}

impl std::fmt::Debug for PushClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushClient")
            .field("status", &self.status())
            .field("details", &*self.inner.details.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionMode;

    #[tokio::test]
    async fn double_subscribe_fails_synchronously() {
        let client = PushClient::new("http://localhost:8080", "DEMO").unwrap();
        let sub =
            Subscription::with_item_list(SubscriptionMode::Merge, &["item1"], &["bid"]).unwrap();
        client.subscribe(&sub).unwrap();
        assert!(matches!(
            client.subscribe(&sub),
            Err(ClientError::Usage(_))
        ));
        client.unsubscribe(&sub).unwrap();
        assert!(matches!(
            client.unsubscribe(&sub),
            Err(ClientError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn invalid_sequence_name_is_rejected() {
        let client = PushClient::new("http://localhost:8080", "DEMO").unwrap();
        assert!(matches!(
            client.send_message_with("m", Some("bad seq"), None, None, false),
            Err(ClientError::Argument(_))
        ));
        client
            .send_message_with("m", Some("orders_1"), None, None, false)
            .unwrap();
    }

    #[tokio::test]
    async fn starts_disconnected_and_lists_subscriptions() {
        let client = PushClient::new("http://localhost:8080", "DEMO").unwrap();
        assert_eq!(client.status(), ClientStatus::Disconnected);
        assert!(client.subscriptions().is_empty());
        let sub =
            Subscription::with_item_list(SubscriptionMode::Merge, &["item1"], &["bid"]).unwrap();
        client.subscribe(&sub).unwrap();
        assert_eq!(client.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn bad_address_fails_synchronously() {
        assert!(PushClient::new("not a url", "DEMO").is_err());
        assert!(PushClient::new("http://localhost:8080", "").is_err());
    }
}
