//! One session attempt.
//!
//! A [`Session`] drives a single logical conversation with the server, from
//! `create_session` (or `recover`, or a re-bind of an inherited id) through
//! bound streaming or polling, to its terminal state. Sessions are never
//! reused: every failure path funnels into `Sleep`, where the
//! [`manager`](crate::session::manager) decides between retry, recovery and
//! destruction.
//!
//! Every material change increments the session phase. Timers and transport
//! callbacks carry the phase (and channel id) they were registered under and
//! are dropped on mismatch; that check is the sole defense against stale
//! work, and it is what makes lock-free single-threaded sequencing safe.

use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::config::ConnectionOptions;
use crate::error::ServerError;
use crate::protocol::{
    BindSessionRequest, CodecError, ControlOp, ControlRequest, CreateSessionRequest,
    MessageRequest, Notification, PollingParams, RecoverRequest, Request, CLIENT_CID,
};
use crate::scheduler::{
    CoreCtx, PendingRequest, SessionTimer, TimerPayload, TransportTag,
};
use crate::transport::{ConnectTarget, Transport, TransportEvent, apply_control_link, endpoint_url};

pub(crate) mod manager;
pub(crate) mod recovery;
pub(crate) mod state;
pub(crate) mod stream_sense;

use recovery::RecoveryBean;
use state::SessionState;
use stream_sense::{BindRoute, StreamSense, TransportFlavor, WsPhase};

/// Response size limit requested when the HTTP environment demands an
/// explicit content length.
const CONTENT_LENGTH_LIMIT: u64 = 50_000_000;

// =============================================================================
// Outcomes
// =============================================================================

/// What a session event means to the manager.
#[derive(Debug)]
pub(crate) enum SessionOutcome {
    /// The session reached its receiving state for the first time.
    Receiving {
        /// Whether server state survived (recovery or re-bind).
        recovered: bool,
    },
    /// A data notification for the subscription or message managers.
    Data(Notification),
    /// The session is dead.
    Closed {
        cause: String,
        /// Retrying (or recovering) makes sense; `false` means the failure
        /// was fatal-to-the-client and the manager must stop.
        recoverable: bool,
        /// The server may still hold the session; a `recover` is worth
        /// attempting.
        allow_recovery: bool,
    },
    /// Fatal server condition; surface and stop.
    Fatal(ServerError),
    /// This transport cannot carry the session; switch to the alternate.
    SwitchTransport { cause: String },
}

// =============================================================================
// Session
// =============================================================================

/// A connection attached to a session, identified by a channel id that is
/// never reused within the session.
struct Channel {
    id: u64,
    transport: Box<dyn Transport>,
}

/// One session attempt. See the module docs.
pub(crate) struct Session {
    object_id: u64,
    handler_phase: u64,
    phase: u64,
    state: SessionState,
    flavor: TransportFlavor,
    forced: bool,
    session_id: Option<String>,
    keepalive: Duration,
    base_url: Url,
    control_link: Option<String>,
    seed: Option<RecoveryBean>,
    recovered: bool,
    data_progressive: u64,
    create_channel: Option<Channel>,
    bind_channel: Option<Channel>,
    next_channel: u64,
    sense: StreamSense,
    notified_receiving: bool,
    last_activity: Instant,
    last_request: Instant,
}

impl Session {
    pub(crate) fn new(
        object_id: u64,
        handler_phase: u64,
        flavor: TransportFlavor,
        forced: bool,
        base_url: Url,
        seed: Option<RecoveryBean>,
        options: &ConnectionOptions,
    ) -> Self {
        Self {
            object_id,
            handler_phase,
            phase: 0,
            state: SessionState::Off,
            flavor,
            forced,
            session_id: seed.as_ref().map(|bean| bean.session_id.clone()),
            keepalive: options.keepalive_interval,
            base_url,
            control_link: None,
            seed,
            recovered: false,
            data_progressive: 0,
            create_channel: None,
            bind_channel: None,
            next_channel: 0,
            sense: StreamSense::new(),
            notified_receiving: false,
            last_activity: Instant::now(),
            last_request: Instant::now(),
        }
    }

    pub(crate) fn object_id(&self) -> u64 {
        self.object_id
    }

    pub(crate) fn handler_phase(&self) -> u64 {
        self.handler_phase
    }

    pub(crate) fn phase(&self) -> u64 {
        self.phase
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn flavor(&self) -> TransportFlavor {
        self.flavor
    }

    pub(crate) fn is_polling(&self) -> bool {
        !self.flavor.is_streaming()
    }

    /// Recovery state this session would leave behind.
    pub(crate) fn leave_behind(&self, replay: bool) -> Option<RecoveryBean> {
        let session_id = self.session_id.clone()?;
        Some(if replay {
            RecoveryBean::recover(session_id, self.data_progressive)
        } else {
            RecoveryBean::rebind(session_id)
        })
    }

    /// Whether an event tagged with `channel` belongs to a live channel.
    fn channel_is_current(&self, channel: u64) -> bool {
        self.create_channel.as_ref().map(|c| c.id) == Some(channel)
            || self.bind_channel.as_ref().map(|c| c.id) == Some(channel)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Begin the attempt: a fresh create, a recover, or a re-bind of an
    /// inherited session id.
    pub(crate) fn start(&mut self, ctx: &mut CoreCtx) -> Vec<SessionOutcome> {
        self.advance(SessionState::Creating);
        match &self.seed {
            None => {
                ctx.status
                    .set(crate::client::status::ClientStatus::Connecting, &ctx.dispatcher);
                self.open_create_channel(ctx);
                Vec::new()
            }
            Some(bean) => {
                // The server already knows this session; skip the create
                // round-trip and go straight to the (re)bind or recover.
                self.data_progressive = bean.progressive;
                self.advance(SessionState::Created);
                self.initiate_bind(ctx).into_iter().collect()
            }
        }
    }

    /// Abort every channel and leave the state machine. Used on destroy and
    /// on transport switches.
    pub(crate) fn dispose(&mut self) {
        self.phase += 1;
        if let Some(channel) = self.create_channel.take() {
            channel.transport.abort();
        }
        if let Some(channel) = self.bind_channel.take() {
            channel.transport.abort();
        }
        if self.state != SessionState::Off {
            if self.state != SessionState::Sleep {
                self.advance(SessionState::Sleep);
            }
            self.advance(SessionState::Off);
        }
    }

    /// Politely tell the server the session is over, then tear down.
    pub(crate) fn destroy(&mut self, ctx: &mut CoreCtx) {
        if self.state.is_established() {
            if let Some(session_id) = self.session_id.clone() {
                let req_id = ctx.allocate_req_id();
                ctx.pending.insert(req_id, PendingRequest::Destroy);
                let line = Request::Control(ControlRequest {
                    req_id,
                    op: ControlOp::Destroy {
                        session_id,
                        cause: "api".to_string(),
                    },
                })
                .encode();
                self.send_request_line(line);
            }
        }
        self.dispose();
    }

    // -------------------------------------------------------------------------
    // Transport events
    // -------------------------------------------------------------------------

    pub(crate) fn on_transport_event(
        &mut self,
        ctx: &mut CoreCtx,
        tag: TransportTag,
        event: TransportEvent,
    ) -> Vec<SessionOutcome> {
        if !self.channel_is_current(tag.channel) {
            tracing::trace!(
                object_id = self.object_id,
                channel = tag.channel,
                "event from stale channel dropped"
            );
            return Vec::new();
        }
        let on_create = self.create_channel.as_ref().map(|c| c.id) == Some(tag.channel);
        if on_create {
            self.on_create_event(ctx, event)
        } else {
            self.on_bind_event(ctx, event)
        }
    }

    fn on_create_event(&mut self, ctx: &mut CoreCtx, event: TransportEvent) -> Vec<SessionOutcome> {
        match event {
            TransportEvent::Opened => {
                self.send_create(ctx);
                Vec::new()
            }
            TransportEvent::Line(line) => match Notification::parse(&line) {
                Ok(notification) => self.on_create_notification(ctx, notification),
                Err(error) => self.on_protocol_error(&line, &error),
            },
            TransportEvent::StreamEnd | TransportEvent::Closed { .. }
                if self.state == SessionState::Creating =>
            {
                self.advance(SessionState::Sleep);
                vec![SessionOutcome::Closed {
                    cause: "create channel broken".to_string(),
                    recoverable: true,
                    allow_recovery: false,
                }]
            }
            TransportEvent::OpenFailed { reason } if self.state == SessionState::Creating => {
                self.advance(SessionState::Sleep);
                vec![SessionOutcome::Closed {
                    cause: format!("create connect failed: {reason}"),
                    recoverable: true,
                    allow_recovery: false,
                }]
            }
            TransportEvent::StreamEnd
            | TransportEvent::Closed { .. }
            | TransportEvent::OpenFailed { .. } => {
                // Create exchange tail after CONOK; the session has moved on.
                self.create_channel = None;
                Vec::new()
            }
            TransportEvent::Aborted => Vec::new(),
        }
    }

    fn on_create_notification(
        &mut self,
        ctx: &mut CoreCtx,
        notification: Notification,
    ) -> Vec<SessionOutcome> {
        self.last_activity = Instant::now();
        match notification {
            Notification::ConOk {
                session_id,
                keepalive_millis,
                control_link,
                ..
            } => {
                if self.state != SessionState::Creating {
                    return Vec::new();
                }
                tracing::info!(object_id = self.object_id, %session_id, "session created");
                self.session_id = Some(session_id);
                self.apply_keepalive(ctx, keepalive_millis);
                if let Some(link) = control_link {
                    self.change_control_link(ctx, link);
                }
                if !self.forced {
                    ctx.status.set(
                        crate::client::status::ClientStatus::StreamSensing,
                        &ctx.dispatcher,
                    );
                }
                self.advance(SessionState::Created);
                self.initiate_bind(ctx).into_iter().collect()
            }
            Notification::ConErr { code, message } => {
                self.advance(SessionState::Sleep);
                vec![self.refusal_outcome(code, message)]
            }
            Notification::End { code, message } => {
                self.advance(SessionState::Sleep);
                vec![self.termination_outcome(code, message)]
            }
            // The create exchange may trail padding or a LOOP; the bind
            // channel is authoritative from here on.
            _ => Vec::new(),
        }
    }

    fn on_bind_event(&mut self, ctx: &mut CoreCtx, event: TransportEvent) -> Vec<SessionOutcome> {
        match event {
            TransportEvent::Opened => {
                self.sense.ws = WsPhase::Connected;
                if self.sense.pending_bind {
                    self.sense.pending_bind = false;
                    self.send_bind_request(ctx);
                }
                Vec::new()
            }
            TransportEvent::OpenFailed { reason } => {
                tracing::warn!(object_id = self.object_id, %reason, "WebSocket unusable");
                self.sense.ws = WsPhase::Broken;
                self.bind_channel = None;
                if self.sense.pending_bind {
                    self.sense.pending_bind = false;
                    return vec![self.escalate_or_close("ws.unavailable")];
                }
                Vec::new()
            }
            TransportEvent::Line(line) => match Notification::parse(&line) {
                Ok(notification) => self.on_bind_notification(ctx, notification),
                Err(error) => self.on_protocol_error(&line, &error),
            },
            TransportEvent::StreamEnd | TransportEvent::Closed { .. } => {
                if self.state.is_binding() || self.state.is_established() {
                    self.advance(SessionState::Sleep);
                    return vec![SessionOutcome::Closed {
                        cause: "transport broken".to_string(),
                        recoverable: true,
                        allow_recovery: true,
                    }];
                }
                Vec::new()
            }
            TransportEvent::Aborted => Vec::new(),
        }
    }

    fn on_bind_notification(
        &mut self,
        ctx: &mut CoreCtx,
        notification: Notification,
    ) -> Vec<SessionOutcome> {
        self.last_activity = Instant::now();
        let mut outcomes = Vec::new();
        if self.state == SessionState::Stalled {
            self.advance(SessionState::Receiving);
            ctx.status.set(self.flavor.status(), &ctx.dispatcher);
            self.arm_stall_timer(ctx);
        }
        match notification {
            Notification::ConOk {
                session_id,
                keepalive_millis,
                control_link,
                ..
            } => {
                self.session_id = Some(session_id);
                self.apply_keepalive(ctx, keepalive_millis);
                if let Some(link) = control_link {
                    self.control_link = Some(link);
                }
                if self.seed.as_ref().is_some_and(|bean| bean.recovery) {
                    self.recovered = true;
                }
                outcomes.extend(self.enter_receiving(ctx));
            }
            Notification::Loop {
                expected_delay_millis,
            } => {
                let target = if self.state == SessionState::FirstBinding {
                    SessionState::FirstPause
                } else {
                    SessionState::Pause
                };
                if self.state.is_binding() || self.state.is_established() {
                    self.advance(target);
                    let mut delay = Duration::from_millis(expected_delay_millis);
                    if self.is_polling() {
                        delay = delay.max(ctx.options.polling_interval);
                    }
                    self.schedule(ctx, delay, SessionTimer::Rebind);
                }
            }
            Notification::ConErr { code, message } => {
                self.advance(SessionState::Sleep);
                outcomes.push(self.refusal_outcome(code, message));
            }
            Notification::End { code, message } => {
                self.advance(SessionState::Sleep);
                outcomes.push(self.termination_outcome(code, message));
            }
            Notification::Probe => {
                outcomes.extend(self.enter_receiving(ctx));
            }
            Notification::Sync { .. }
            | Notification::ServName { .. }
            | Notification::ClientIp { .. }
            | Notification::Noop { .. } => {
                outcomes.extend(self.enter_receiving(ctx));
            }
            data => {
                outcomes.extend(self.enter_receiving(ctx));
                if counts_for_recovery(&data) {
                    self.data_progressive += 1;
                }
                outcomes.push(SessionOutcome::Data(data));
            }
        }
        outcomes
    }

    fn on_protocol_error(&mut self, line: &str, error: &CodecError) -> Vec<SessionOutcome> {
        tracing::warn!(
            object_id = self.object_id,
            line,
            %error,
            "protocol error, abandoning session"
        );
        self.advance(SessionState::Sleep);
        vec![SessionOutcome::Closed {
            cause: format!("protocol error: {error}"),
            recoverable: true,
            allow_recovery: false,
        }]
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    pub(crate) fn on_timer(&mut self, ctx: &mut CoreCtx, kind: SessionTimer) -> Vec<SessionOutcome> {
        match kind {
            SessionTimer::Rebind => {
                if self.state.is_paused() {
                    return self.initiate_bind(ctx).into_iter().collect();
                }
                Vec::new()
            }
            SessionTimer::Stalled => {
                if self.state != SessionState::Receiving {
                    return Vec::new();
                }
                let budget = self.keepalive + ctx.options.stalled_timeout;
                let elapsed = self.last_activity.elapsed();
                if elapsed >= budget {
                    tracing::warn!(object_id = self.object_id, "connection stalled");
                    self.advance(SessionState::Stalled);
                    ctx.status
                        .set(crate::client::status::ClientStatus::Stalled, &ctx.dispatcher);
                    self.schedule(ctx, ctx.options.reconnect_timeout, SessionTimer::Reconnect);
                } else {
                    // Data arrived since arming; measure the remainder.
                    let remaining = budget - elapsed;
                    self.schedule(ctx, remaining, SessionTimer::Stalled);
                }
                Vec::new()
            }
            SessionTimer::Reconnect => {
                if self.state != SessionState::Stalled {
                    return Vec::new();
                }
                self.advance(SessionState::Sleep);
                vec![SessionOutcome::Closed {
                    cause: "stalled".to_string(),
                    recoverable: true,
                    allow_recovery: true,
                }]
            }
            SessionTimer::NoDataAfterBind => {
                if !self.state.is_binding() {
                    return Vec::new();
                }
                if self.flavor.may_downgrade(ctx.options.forced_transport) {
                    tracing::info!(
                        object_id = self.object_id,
                        "no stream data, stepping down to polling"
                    );
                    self.flavor = self.flavor.polling_variant();
                    self.phase += 1;
                    if !self.flavor.is_ws() {
                        // A fresh exchange is needed; the streaming one is
                        // still pending on the old channel.
                        self.open_http_bind_channel(ctx);
                    }
                    self.send_bind_request(ctx);
                    Vec::new()
                } else {
                    vec![self.escalate_or_close("streamsense")]
                }
            }
            SessionTimer::ReverseHeartbeat => {
                // Handled by the manager, which owns the request channel.
                Vec::new()
            }
        }
    }

    /// Time since the last request line left this session.
    pub(crate) fn request_idle(&self) -> Duration {
        self.last_request.elapsed()
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    fn send_create(&mut self, ctx: &mut CoreCtx) {
        let request = Request::CreateSession(CreateSessionRequest {
            cid: CLIENT_CID.to_string(),
            adapter_set: ctx.details.adapter_set.clone(),
            user: ctx.details.user.clone(),
            password: ctx.details.password.clone(),
            keepalive_millis: millis(ctx.options.keepalive_interval),
            requested_max_bandwidth: ctx.options.requested_max_bandwidth,
        });
        let line = request.encode();
        if let Some(channel) = &self.create_channel {
            channel.transport.send(line);
            self.last_request = Instant::now();
        }
        // Overlap the WebSocket handshake with the create round-trip.
        if self.flavor.is_ws()
            && ctx.options.early_ws_open_enabled
            && self.sense.ws == WsPhase::NotConnected
        {
            self.open_ws_channel(ctx);
        }
    }

    /// Route the bind according to transport flavor and WebSocket substate.
    fn initiate_bind(&mut self, ctx: &mut CoreCtx) -> Option<SessionOutcome> {
        if !self.flavor.is_ws() {
            if self.bind_channel.is_none() {
                self.open_http_bind_channel(ctx);
            }
            self.send_bind_request(ctx);
            return None;
        }
        match self.sense.bind_route(self.flavor) {
            BindRoute::SendNow => {
                self.send_bind_request(ctx);
                None
            }
            BindRoute::AwaitOpen => {
                self.sense.pending_bind = true;
                None
            }
            BindRoute::OpenFirst => {
                self.open_ws_channel(ctx);
                self.sense.pending_bind = true;
                None
            }
            BindRoute::Escalate => Some(self.escalate_or_close("ws.broken")),
        }
    }

    fn send_bind_request(&mut self, ctx: &mut CoreCtx) {
        let Some(session_id) = self.session_id.clone() else {
            debug_assert!(false, "bind without session id");
            return;
        };
        let polling = self.is_polling().then(|| PollingParams {
            polling_millis: millis(ctx.options.polling_interval),
            idle_millis: millis(ctx.options.idle_timeout),
        });
        let recover = self
            .seed
            .as_ref()
            .is_some_and(|bean| bean.recovery && !self.notified_receiving && !self.recovered);
        let request = if recover {
            Request::Recover(RecoverRequest {
                session_id,
                recovery_from: self.data_progressive,
                keepalive_millis: millis(self.keepalive),
                polling,
            })
        } else {
            Request::BindSession(BindSessionRequest {
                session_id,
                keepalive_millis: millis(self.keepalive),
                polling,
                content_length: (!self.flavor.is_ws() && ctx.options.content_length_required)
                    .then_some(CONTENT_LENGTH_LIMIT),
            })
        };
        let line = request.encode();
        if let Some(channel) = &self.bind_channel {
            channel.transport.send(line);
            self.last_request = Instant::now();
        } else {
            debug_assert!(false, "bind without a channel");
            return;
        }
        match self.state {
            SessionState::Created => self.advance(SessionState::FirstBinding),
            SessionState::FirstPause | SessionState::Pause => self.advance(SessionState::Binding),
            // Re-issued bind (polling step-down) keeps the binding state.
            _ => {}
        }
        if self.flavor.is_streaming() {
            self.schedule(
                ctx,
                ctx.options.first_retry_max_delay,
                SessionTimer::NoDataAfterBind,
            );
        }
    }

    /// Send an already-encoded request line on the session's channel.
    pub(crate) fn send_request_line(&mut self, line: String) {
        if let Some(channel) = &self.bind_channel {
            channel.transport.send(line);
            self.last_request = Instant::now();
        } else {
            tracing::debug!(object_id = self.object_id, "request dropped, no channel");
        }
    }

    // -------------------------------------------------------------------------
    // Channels
    // -------------------------------------------------------------------------

    fn open_create_channel(&mut self, ctx: &mut CoreCtx) {
        let tag = self.allocate_tag();
        let target = ConnectTarget {
            url: endpoint_url(&self.base_url, false),
            content_length_required: ctx.options.content_length_required,
        };
        let transport = ctx.http_factory.open(target, ctx.sink_for(tag));
        self.create_channel = Some(Channel {
            id: tag.channel,
            transport,
        });
    }

    fn open_ws_channel(&mut self, ctx: &mut CoreCtx) {
        if let Some(old) = self.bind_channel.take() {
            old.transport.abort();
        }
        let tag = self.allocate_tag();
        let target = ConnectTarget {
            url: endpoint_url(&self.bind_base(), true),
            content_length_required: false,
        };
        let transport = ctx.ws_factory.open(target, ctx.sink_for(tag));
        self.sense.ws = WsPhase::Connecting;
        self.bind_channel = Some(Channel {
            id: tag.channel,
            transport,
        });
    }

    fn open_http_bind_channel(&mut self, ctx: &mut CoreCtx) {
        if let Some(old) = self.bind_channel.take() {
            old.transport.abort();
        }
        let tag = self.allocate_tag();
        let target = ConnectTarget {
            url: endpoint_url(&self.bind_base(), false),
            content_length_required: ctx.options.content_length_required,
        };
        let transport = ctx.http_factory.open(target, ctx.sink_for(tag));
        self.bind_channel = Some(Channel {
            id: tag.channel,
            transport,
        });
    }

    /// The server may redirect to a control link mid-create; a socket opened
    /// early against the original address must be abandoned and reopened.
    fn change_control_link(&mut self, ctx: &mut CoreCtx, link: String) {
        tracing::info!(object_id = self.object_id, %link, "control link changed");
        self.control_link = Some(link);
        match self.sense.ws {
            WsPhase::Connecting | WsPhase::Connected => {
                let pending = self.sense.pending_bind;
                self.open_ws_channel(ctx);
                self.sense.pending_bind = pending;
            }
            WsPhase::NotConnected | WsPhase::Broken => {}
        }
    }

    fn bind_base(&self) -> Url {
        match &self.control_link {
            Some(link) => apply_control_link(&self.base_url, link),
            None => self.base_url.clone(),
        }
    }

    fn allocate_tag(&mut self) -> TransportTag {
        self.next_channel += 1;
        TransportTag {
            object_id: self.object_id,
            channel: self.next_channel,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn enter_receiving(&mut self, ctx: &mut CoreCtx) -> Option<SessionOutcome> {
        if self.state.is_binding() {
            self.advance(SessionState::Receiving);
            ctx.status.set(self.flavor.status(), &ctx.dispatcher);
            self.arm_stall_timer(ctx);
        }
        if self.state == SessionState::Receiving && !self.notified_receiving {
            self.notified_receiving = true;
            return Some(SessionOutcome::Receiving {
                recovered: self.recovered || self.seed.as_ref().is_some_and(|b| !b.recovery),
            });
        }
        None
    }

    fn arm_stall_timer(&mut self, ctx: &mut CoreCtx) {
        let budget = self.keepalive + ctx.options.stalled_timeout;
        self.schedule(ctx, budget, SessionTimer::Stalled);
    }

    fn apply_keepalive(&mut self, ctx: &mut CoreCtx, keepalive_millis: u64) {
        let granted = Duration::from_millis(keepalive_millis);
        if granted != self.keepalive && keepalive_millis > 0 {
            self.keepalive = granted;
            ctx.status.property_change("keepalive_interval", &ctx.dispatcher);
        }
    }

    fn refusal_outcome(&mut self, code: u32, message: String) -> SessionOutcome {
        if fatal_server_code(code) {
            SessionOutcome::Fatal(ServerError { code, message })
        } else {
            tracing::warn!(object_id = self.object_id, code, %message, "session refused");
            // Refusals invalidate any remembered id; only a fresh create can
            // follow.
            self.session_id = None;
            SessionOutcome::Closed {
                cause: format!("conerr.{code}"),
                recoverable: true,
                allow_recovery: false,
            }
        }
    }

    fn termination_outcome(&mut self, code: u32, message: String) -> SessionOutcome {
        if fatal_server_code(code) {
            SessionOutcome::Fatal(ServerError { code, message })
        } else {
            tracing::info!(object_id = self.object_id, code, %message, "session ended by server");
            self.session_id = None;
            SessionOutcome::Closed {
                cause: format!("end.{code}"),
                recoverable: true,
                allow_recovery: false,
            }
        }
    }

    fn escalate_or_close(&mut self, cause: &str) -> SessionOutcome {
        if !self.forced {
            SessionOutcome::SwitchTransport {
                cause: cause.to_string(),
            }
        } else {
            self.advance(SessionState::Sleep);
            SessionOutcome::Closed {
                cause: cause.to_string(),
                recoverable: true,
                allow_recovery: false,
            }
        }
    }

    fn schedule(&self, ctx: &mut CoreCtx, delay: Duration, kind: SessionTimer) {
        ctx.timers.schedule(
            delay,
            TimerPayload::Session {
                object_id: self.object_id,
                phase: self.phase,
                kind,
            },
        );
    }

    fn advance(&mut self, to: SessionState) {
        debug_assert!(
            self.state.can_move_to(to),
            "illegal session transition {:?} -> {to:?}",
            self.state
        );
        if !self.state.can_move_to(to) {
            tracing::error!(
                object_id = self.object_id,
                from = ?self.state,
                to = ?to,
                "illegal session transition"
            );
        }
        tracing::debug!(object_id = self.object_id, from = ?self.state, to = ?to, "session state");
        self.state = to;
        self.phase += 1;
    }
}

// =============================================================================
// Request channel
// =============================================================================

/// Writer handle over the current session for the subscription and message
/// managers: allocates request ids, records what each one was for, and puts
/// the line on the wire.
pub(crate) struct RequestChannel<'a> {
    pub session: &'a mut Session,
    pub pending: &'a mut std::collections::HashMap<u64, PendingRequest>,
    pub next_req_id: &'a mut u64,
}

impl RequestChannel<'_> {
    pub(crate) fn send_control(&mut self, op: ControlOp, origin: PendingRequest) -> u64 {
        *self.next_req_id += 1;
        let req_id = *self.next_req_id;
        self.pending.insert(req_id, origin);
        let line = Request::Control(ControlRequest { req_id, op }).encode();
        self.session.send_request_line(line);
        req_id
    }

    pub(crate) fn send_message(
        &mut self,
        sequence: &str,
        prog: Option<u64>,
        timeout_millis: Option<u64>,
        needs_ack: bool,
        text: String,
    ) -> u64 {
        *self.next_req_id += 1;
        let req_id = *self.next_req_id;
        self.pending.insert(
            req_id,
            PendingRequest::Message {
                sequence: sequence.to_string(),
                prog,
            },
        );
        let line = Request::Message(MessageRequest {
            req_id,
            sequence: sequence.to_string(),
            prog,
            timeout_millis,
            needs_ack,
            text,
        })
        .encode();
        self.session.send_request_line(line);
        req_id
    }
}

// =============================================================================
// Policy helpers
// =============================================================================

/// Codes the server contract defines as fatal to the client: bad
/// credentials, adapter set unavailable, license restrictions.
fn fatal_server_code(code: u32) -> bool {
    matches!(code, 1 | 2 | 7 | 8 | 60)
}

/// Whether a notification advances the recovery progressive.
fn counts_for_recovery(notification: &Notification) -> bool {
    matches!(
        notification,
        Notification::Update { .. }
            | Notification::MsgDone { .. }
            | Notification::MsgFail { .. }
            | Notification::EndOfSnapshot { .. }
            | Notification::ClearSnapshot { .. }
            | Notification::Overflow { .. }
    )
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes_match_server_contract() {
        for code in [1, 2, 7, 8, 60] {
            assert!(fatal_server_code(code), "{code}");
        }
        for code in [4, 41, 48, 31, 39] {
            assert!(!fatal_server_code(code), "{code}");
        }
    }

    #[test]
    fn recovery_counting_covers_data_notifications() {
        assert!(counts_for_recovery(&Notification::Update {
            sub_id: 1,
            item: 1,
            fields: vec![],
        }));
        assert!(counts_for_recovery(&Notification::MsgDone {
            sequence: "s".to_string(),
            prog: 1,
        }));
        assert!(!counts_for_recovery(&Notification::Probe));
        assert!(!counts_for_recovery(&Notification::SubOk {
            sub_id: 1,
            num_items: 1,
            num_fields: 1,
        }));
    }
}
