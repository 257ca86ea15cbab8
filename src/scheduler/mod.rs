//! Session thread and events thread.
//!
//! All state of the session core (sessions, subscriptions, messages) lives
//! on one logical "session thread": a single task draining a FIFO of
//! commands, transport events and expired timers. Nothing in the core takes
//! a lock; stale work is defeated by phase checks instead (every timer and
//! transport callback carries the phase it was registered under and is
//! dropped on mismatch).
//!
//! Listener callbacks run on a separate events task so application code can
//! never stall the protocol. Dispatch order is preserved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::time::DelayQueue;

use crate::client::listener::ClientListener;
use crate::client::status::ClientStatus;
use crate::config::{ConnectionDetails, ConnectionOptions, ForcedTransport};
use crate::error::ServerError;
use crate::message::{MessageManager, OutgoingMessage};
use crate::session::manager::SessionManager;
use crate::subscription::Subscription;
use crate::subscription::manager::SubscriptionManager;
use crate::transport::{TransportEvent, TransportFactory};

// =============================================================================
// Events entering the session thread
// =============================================================================

/// Identifies the registration a transport event belongs to.
///
/// `channel` advances every time a session attaches a new connection, so
/// events from an abandoned connection can never be mistaken for the
/// current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransportTag {
    pub object_id: u64,
    pub channel: u64,
}

/// Everything the session thread reacts to.
pub(crate) enum CoreEvent {
    /// A call posted by the façade.
    Command(ClientCommand),
    /// A transport reported progress or data.
    Transport {
        tag: TransportTag,
        event: TransportEvent,
    },
}

/// Calls posted by the façade.
pub(crate) enum ClientCommand {
    Connect,
    Disconnect { done: Option<oneshot::Sender<()>> },
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    SendMessage(OutgoingMessage),
    Option(OptionChange),
    Credentials {
        user: Option<String>,
        password: Option<String>,
    },
    Shutdown { done: oneshot::Sender<()> },
}

/// One mutated connection option.
pub(crate) enum OptionChange {
    ForcedTransport(Option<ForcedTransport>),
    EarlyWsOpen(bool),
    ContentLengthRequired(bool),
    ReverseHeartbeat(Option<Duration>),
    MaxBandwidth(Option<f64>),
    IdleTimeout(Duration),
    KeepaliveInterval(Duration),
    StalledTimeout(Duration),
    ReconnectTimeout(Duration),
    PollingInterval(Duration),
    RetryDelay(Duration),
    FirstRetryMaxDelay(Duration),
    SessionRecoveryTimeout(Duration),
}

/// What an outstanding `req_id` was for; routes `REQOK`/`REQERR`.
#[derive(Debug, Clone)]
pub(crate) enum PendingRequest {
    SubscriptionAdd { sub_id: u64 },
    SubscriptionDelete { sub_id: u64 },
    Constrain,
    Heartbeat,
    Message { sequence: String, prog: Option<u64> },
    Destroy,
}

// =============================================================================
// Timers
// =============================================================================

/// Payload of a delayed task. Phase fields are checked on expiry;
/// cancellation is advisory only.
#[derive(Debug, Clone)]
pub(crate) enum TimerPayload {
    Session {
        object_id: u64,
        phase: u64,
        kind: SessionTimer,
    },
    Manager {
        handler_phase: u64,
        kind: ManagerTimer,
    },
    MessageTimeout {
        sequence: String,
        prog: u64,
    },
}

/// Session-scoped delayed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionTimer {
    /// A paused session is due to rebind.
    Rebind,
    /// Keepalive budget check.
    Stalled,
    /// Stalled session gives up.
    Reconnect,
    /// Stream produced no data after bind; step down to polling.
    NoDataAfterBind,
    /// Idle upstream channel needs a reverse heartbeat.
    ReverseHeartbeat,
}

/// Manager-scoped delayed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManagerTimer {
    /// Create a fresh session after the retry backoff.
    Retry,
    /// Launch the next recovery attempt.
    Recover,
}

/// Delayed tasks sharing the session thread's FIFO.
pub(crate) struct Timers {
    queue: DelayQueue<TimerPayload>,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
        }
    }

    pub(crate) fn schedule(&mut self, delay: Duration, payload: TimerPayload) {
        self.queue.insert(payload, delay);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) async fn next_expired(&mut self) -> Option<TimerPayload> {
        futures_util::future::poll_fn(|cx| self.queue.poll_expired(cx))
            .await
            .map(tokio_util::time::delay_queue::Expired::into_inner)
    }
}

// =============================================================================
// Events thread
// =============================================================================

type Callback = Box<dyn FnOnce() + Send>;

/// Hands listener invocations to the events task, preserving order.
#[derive(Clone)]
pub(crate) struct EventDispatcher {
    tx: mpsc::UnboundedSender<Callback>,
}

impl EventDispatcher {
    /// Spawn the events task and return its dispatcher and join handle.
    pub(crate) fn spawn() -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback>();
        let handle = tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback();
            }
        });
        (Self { tx }, handle)
    }

    /// Queue one listener invocation.
    pub(crate) fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        // Send only fails after shutdown, when listeners are gone anyway.
        let _ = self.tx.send(Box::new(f));
    }
}

// =============================================================================
// Status ownership
// =============================================================================

/// Shared, read-only view of the client listener list.
pub(crate) type SharedListeners = Arc<RwLock<Vec<Arc<dyn ClientListener>>>>;

/// The single writer of the observable status.
pub(crate) struct StatusOwner {
    current: ClientStatus,
    tx: watch::Sender<ClientStatus>,
    listeners: SharedListeners,
}

impl StatusOwner {
    pub(crate) fn new(tx: watch::Sender<ClientStatus>, listeners: SharedListeners) -> Self {
        Self {
            current: ClientStatus::Disconnected,
            tx,
            listeners,
        }
    }

    pub(crate) fn current(&self) -> ClientStatus {
        self.current
    }

    pub(crate) fn set(&mut self, status: ClientStatus, dispatcher: &EventDispatcher) {
        if status == self.current {
            return;
        }
        tracing::info!(from = %self.current, to = %status, "status change");
        self.current = status;
        self.tx.send_replace(status);
        let listeners = self.listeners.read().clone();
        dispatcher.dispatch(move || {
            for listener in &listeners {
                listener.on_status_change(status);
            }
        });
    }

    pub(crate) fn server_error(&self, error: ServerError, dispatcher: &EventDispatcher) {
        let listeners = self.listeners.read().clone();
        dispatcher.dispatch(move || {
            for listener in &listeners {
                listener.on_server_error(&error);
            }
        });
    }

    pub(crate) fn property_change(&self, property: &'static str, dispatcher: &EventDispatcher) {
        let listeners = self.listeners.read().clone();
        dispatcher.dispatch(move || {
            for listener in &listeners {
                listener.on_property_change(property);
            }
        });
    }
}

// =============================================================================
// Core
// =============================================================================

/// Everything on the session thread except the session manager itself.
///
/// Split out so manager methods can borrow the context mutably alongside
/// their own state.
pub(crate) struct CoreCtx {
    pub details: ConnectionDetails,
    pub options: ConnectionOptions,
    pub subscriptions: SubscriptionManager,
    pub messages: MessageManager,
    pub dispatcher: EventDispatcher,
    pub timers: Timers,
    pub status: StatusOwner,
    pub ws_factory: Arc<dyn TransportFactory>,
    pub http_factory: Arc<dyn TransportFactory>,
    pub events_tx: mpsc::UnboundedSender<CoreEvent>,
    pub next_req_id: u64,
    pub pending: HashMap<u64, PendingRequest>,
}

impl CoreCtx {
    /// Sink delivering a transport's events back to the session thread,
    /// stamped with its registration tag.
    pub(crate) fn sink_for(&self, tag: TransportTag) -> crate::transport::EventSink {
        let tx = self.events_tx.clone();
        Box::new(move |event| {
            let _ = tx.send(CoreEvent::Transport { tag, event });
        })
    }

    pub(crate) fn allocate_req_id(&mut self) -> u64 {
        self.next_req_id += 1;
        self.next_req_id
    }
}

/// The session thread's state: one session manager plus its context.
pub(crate) struct Core {
    manager: SessionManager,
    ctx: CoreCtx,
}

impl Core {
    pub(crate) fn new(ctx: CoreCtx) -> Self {
        Self {
            manager: SessionManager::new(),
            ctx,
        }
    }

    fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect => self.manager.connect(&mut self.ctx),
            ClientCommand::Disconnect { done } => {
                self.manager.disconnect(&mut self.ctx);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            ClientCommand::Subscribe(sub) => {
                let CoreCtx {
                    subscriptions,
                    pending,
                    next_req_id,
                    ..
                } = &mut self.ctx;
                let mut chan = self.manager.request_channel(pending, next_req_id);
                subscriptions.register(sub, chan.as_mut());
            }
            ClientCommand::Unsubscribe(sub) => {
                let CoreCtx {
                    subscriptions,
                    pending,
                    next_req_id,
                    dispatcher,
                    ..
                } = &mut self.ctx;
                let mut chan = self.manager.request_channel(pending, next_req_id);
                subscriptions.deactivate(&sub, chan.as_mut(), dispatcher);
            }
            ClientCommand::SendMessage(message) => {
                let disconnected = self.ctx.status.current().is_disconnected();
                let CoreCtx {
                    messages,
                    pending,
                    next_req_id,
                    timers,
                    dispatcher,
                    ..
                } = &mut self.ctx;
                let mut chan = self.manager.request_channel(pending, next_req_id);
                messages.submit(message, disconnected, chan.as_mut(), timers, dispatcher);
            }
            ClientCommand::Option(change) => self.apply_option(change),
            ClientCommand::Credentials { user, password } => {
                self.ctx.details.user = user;
                self.ctx.details.password = password;
            }
            // Shutdown is intercepted by the run loop.
            ClientCommand::Shutdown { .. } => {}
        }
    }

    fn apply_option(&mut self, change: OptionChange) {
        match change {
            OptionChange::ForcedTransport(forced) => {
                self.ctx.options.forced_transport = forced;
                self.manager.on_forced_transport_changed(&mut self.ctx);
            }
            OptionChange::EarlyWsOpen(enabled) => {
                self.ctx.options.early_ws_open_enabled = enabled;
            }
            OptionChange::ContentLengthRequired(required) => {
                self.ctx.options.content_length_required = required;
            }
            OptionChange::ReverseHeartbeat(interval) => {
                self.ctx.options.reverse_heartbeat_interval = interval;
                self.manager.on_reverse_heartbeat_changed(&mut self.ctx);
            }
            OptionChange::MaxBandwidth(bandwidth) => {
                self.ctx.options.requested_max_bandwidth = bandwidth;
                self.manager.on_bandwidth_changed(&mut self.ctx);
            }
            OptionChange::IdleTimeout(timeout) => self.ctx.options.idle_timeout = timeout,
            OptionChange::KeepaliveInterval(interval) => {
                self.ctx.options.keepalive_interval = interval;
            }
            OptionChange::StalledTimeout(timeout) => self.ctx.options.stalled_timeout = timeout,
            OptionChange::ReconnectTimeout(timeout) => {
                self.ctx.options.reconnect_timeout = timeout;
            }
            OptionChange::PollingInterval(interval) => {
                self.ctx.options.polling_interval = interval;
            }
            OptionChange::RetryDelay(delay) => self.ctx.options.retry_delay = delay,
            OptionChange::FirstRetryMaxDelay(delay) => {
                self.ctx.options.first_retry_max_delay = delay;
            }
            OptionChange::SessionRecoveryTimeout(timeout) => {
                self.ctx.options.session_recovery_timeout = timeout;
            }
        }
    }

    fn handle_timer(&mut self, payload: TimerPayload) {
        match payload {
            TimerPayload::Session {
                object_id,
                phase,
                kind,
            } => self
                .manager
                .on_session_timer(&mut self.ctx, object_id, phase, kind),
            TimerPayload::Manager {
                handler_phase,
                kind,
            } => self
                .manager
                .on_manager_timer(&mut self.ctx, handler_phase, kind),
            TimerPayload::MessageTimeout { sequence, prog } => {
                let CoreCtx {
                    messages,
                    dispatcher,
                    ..
                } = &mut self.ctx;
                messages.on_timeout(&sequence, prog, dispatcher);
            }
        }
    }

    fn shutdown(&mut self) {
        self.manager.shutdown(&mut self.ctx);
    }
}

/// Session thread main loop.
pub(crate) async fn run(mut core: Core, mut rx: mpsc::UnboundedReceiver<CoreEvent>) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(CoreEvent::Command(ClientCommand::Shutdown { done })) => {
                    core.shutdown();
                    let _ = done.send(());
                    break;
                }
                Some(CoreEvent::Command(command)) => core.handle_command(command),
                Some(CoreEvent::Transport { tag, event }) => {
                    core.manager.on_transport_event(&mut core.ctx, tag, event);
                }
                None => break,
            },
            Some(payload) = core.ctx.timers.next_expired(), if !core.ctx.timers.is_empty() => {
                core.handle_timer(payload);
            }
        }
    }
}
