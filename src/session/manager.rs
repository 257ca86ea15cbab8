//! Session ownership and turnover.
//!
//! The manager owns at most one [`Session`] at a time and decides what a
//! dead one is replaced with: an immediate transport switch (stream-sense),
//! a recovery attempt replaying from the last progressive, or a fresh create
//! after backoff. Its own phase guards against stale children: a switch or
//! timer carrying an old handler phase is ignored.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::client::status::ClientStatus;
use crate::config::ConnectionOptions;
use crate::error::ServerError;
use crate::protocol::{ControlOp, Notification};
use crate::scheduler::{
    CoreCtx, ManagerTimer, PendingRequest, SessionTimer, TimerPayload, TransportTag,
};
use crate::transport::TransportEvent;

use super::recovery::RecoveryBean;
use super::stream_sense::TransportFlavor;
use super::{RequestChannel, Session, SessionOutcome};

// =============================================================================
// Retry backoff
// =============================================================================

/// Exponential backoff with jitter for session re-creation.
///
/// Grows by doubling from the configured base delay up to the ceiling, with
/// ±10 % randomization so a server restart does not get a thundering herd.
pub(crate) struct RetryPolicy {
    current: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            current: options.retry_delay,
            max: options.retry_delay_max,
        }
    }

    /// Delay to observe before the next attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = apply_jitter(self.current);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the base delay after a healthy session.
    pub(crate) fn reset(&mut self, options: &ConnectionOptions) {
        self.current = options.retry_delay;
        self.max = options.retry_delay_max;
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn apply_jitter(duration: Duration) -> Duration {
    let base = duration.as_millis() as f64;
    if base <= 0.0 {
        return Duration::ZERO;
    }
    let jitter_range = base * 0.1;
    let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
    Duration::from_millis((base + jitter).max(0.0) as u64)
}

// =============================================================================
// Session manager
// =============================================================================

/// Owns the current session and drives creation, recovery and switches.
pub(crate) struct SessionManager {
    phase: u64,
    session: Option<Session>,
    retry: RetryPolicy,
    desired_connected: bool,
    recovery_deadline: Option<Instant>,
    pending_recovery: Option<(RecoveryBean, TransportFlavor)>,
    next_object_id: u64,
}

impl SessionManager {
    pub(crate) fn new() -> Self {
        Self {
            phase: 0,
            session: None,
            retry: RetryPolicy {
                current: Duration::from_secs(4),
                max: Duration::from_secs(60),
            },
            desired_connected: false,
            recovery_deadline: None,
            pending_recovery: None,
            next_object_id: 0,
        }
    }

    /// Request channel over the current session, when one is receiving.
    pub(crate) fn request_channel<'a>(
        &'a mut self,
        pending: &'a mut std::collections::HashMap<u64, PendingRequest>,
        next_req_id: &'a mut u64,
    ) -> Option<RequestChannel<'a>> {
        let session = self.session.as_mut()?;
        if !session.state().is_established() {
            return None;
        }
        Some(RequestChannel {
            session,
            pending,
            next_req_id,
        })
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Idempotent: a second connect while one is pending or established is
    /// a no-op.
    pub(crate) fn connect(&mut self, ctx: &mut CoreCtx) {
        if self.desired_connected && self.session.is_some() {
            tracing::debug!("connect ignored, already connecting or connected");
            return;
        }
        self.desired_connected = true;
        self.phase += 1;
        self.retry.reset(&ctx.options);
        self.recovery_deadline = None;
        let flavor = TransportFlavor::initial(ctx.options.forced_transport);
        self.open_session(ctx, flavor, None, "api");
    }

    /// Idempotent: disconnecting a disconnected client is a no-op.
    pub(crate) fn disconnect(&mut self, ctx: &mut CoreCtx) {
        if !self.desired_connected && self.session.is_none() {
            return;
        }
        self.desired_connected = false;
        self.phase += 1;
        self.recovery_deadline = None;
        self.pending_recovery = None;
        if let Some(mut session) = self.session.take() {
            session.destroy(ctx);
        }
        ctx.subscriptions.on_session_close();
        ctx.messages.on_disconnect(&ctx.dispatcher);
        ctx.status.set(ClientStatus::Disconnected, &ctx.dispatcher);
    }

    pub(crate) fn shutdown(&mut self, ctx: &mut CoreCtx) {
        self.disconnect(ctx);
    }

    /// `ForcedTransport` changed: dispose the current session and re-bind
    /// its id (when it has one) on the newly mandated transport.
    pub(crate) fn on_forced_transport_changed(&mut self, ctx: &mut CoreCtx) {
        if !self.desired_connected {
            return;
        }
        self.phase += 1;
        let seed = self.session.as_ref().and_then(|s| s.leave_behind(false));
        if let Some(mut session) = self.session.take() {
            session.dispose();
        }
        ctx.subscriptions.on_session_close();
        let flavor = TransportFlavor::initial(ctx.options.forced_transport);
        tracing::info!(?flavor, "forced transport changed, switching");
        self.open_session(ctx, flavor, seed, "api.forced");
    }

    /// Requested bandwidth changed: constrain the live session.
    pub(crate) fn on_bandwidth_changed(&mut self, ctx: &mut CoreCtx) {
        let max_bandwidth = ctx.options.requested_max_bandwidth;
        let CoreCtx {
            pending,
            next_req_id,
            ..
        } = ctx;
        if let Some(mut chan) = self.request_channel(pending, next_req_id) {
            chan.send_control(
                ControlOp::Constrain { max_bandwidth },
                PendingRequest::Constrain,
            );
        }
    }

    /// Reverse heartbeat interval changed: arm the timer on a live session.
    pub(crate) fn on_reverse_heartbeat_changed(&mut self, ctx: &mut CoreCtx) {
        let Some(interval) = ctx.options.reverse_heartbeat_interval else {
            return;
        };
        if let Some(session) = self.session.as_ref() {
            if session.state().is_established() {
                ctx.timers.schedule(
                    interval,
                    TimerPayload::Session {
                        object_id: session.object_id(),
                        phase: session.phase(),
                        kind: SessionTimer::ReverseHeartbeat,
                    },
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Transport events and timers
    // -------------------------------------------------------------------------

    pub(crate) fn on_transport_event(
        &mut self,
        ctx: &mut CoreCtx,
        tag: TransportTag,
        event: TransportEvent,
    ) {
        let Some(session) = self.session.as_mut() else {
            tracing::trace!(?tag, "transport event without session dropped");
            return;
        };
        if session.object_id() != tag.object_id {
            tracing::trace!(?tag, "transport event for old session dropped");
            return;
        }
        let outcomes = session.on_transport_event(ctx, tag, event);
        self.handle_outcomes(ctx, outcomes);
    }

    pub(crate) fn on_session_timer(
        &mut self,
        ctx: &mut CoreCtx,
        object_id: u64,
        phase: u64,
        kind: SessionTimer,
    ) {
        if kind == SessionTimer::ReverseHeartbeat {
            self.on_reverse_heartbeat_timer(ctx, object_id);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.object_id() != object_id || session.phase() != phase {
            tracing::trace!(object_id, phase, ?kind, "stale session timer dropped");
            return;
        }
        let outcomes = session.on_timer(ctx, kind);
        self.handle_outcomes(ctx, outcomes);
    }

    pub(crate) fn on_manager_timer(
        &mut self,
        ctx: &mut CoreCtx,
        handler_phase: u64,
        kind: ManagerTimer,
    ) {
        if handler_phase != self.phase {
            tracing::trace!(handler_phase, ?kind, "stale manager timer dropped");
            return;
        }
        if !self.desired_connected {
            return;
        }
        match kind {
            ManagerTimer::Retry => {
                let flavor = TransportFlavor::initial(ctx.options.forced_transport);
                self.open_session(ctx, flavor, None, "retry");
            }
            ManagerTimer::Recover => {
                let Some((bean, flavor)) = self.pending_recovery.take() else {
                    return;
                };
                self.open_session(ctx, flavor, Some(bean), "recovery");
            }
        }
    }

    /// Reverse heartbeats are advisory; they track the session object, not
    /// its phase, so routine transitions do not silence them.
    fn on_reverse_heartbeat_timer(&mut self, ctx: &mut CoreCtx, object_id: u64) {
        let Some(interval) = ctx.options.reverse_heartbeat_interval else {
            return;
        };
        let CoreCtx {
            pending,
            next_req_id,
            timers,
            ..
        } = ctx;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.object_id() != object_id || !session.state().is_established() {
            return;
        }
        let idle = session.request_idle();
        let rearm = if idle >= interval {
            let mut chan = RequestChannel {
                session: &mut *session,
                pending,
                next_req_id,
            };
            chan.send_control(ControlOp::Heartbeat, PendingRequest::Heartbeat);
            interval
        } else {
            interval - idle
        };
        timers.schedule(
            rearm,
            TimerPayload::Session {
                object_id: session.object_id(),
                phase: session.phase(),
                kind: SessionTimer::ReverseHeartbeat,
            },
        );
    }

    /// A child reports its transport cannot carry the session. Accepted
    /// only from the current handler phase; stale children are ignored.
    pub(crate) fn stream_sense_switch(&mut self, ctx: &mut CoreCtx, handler_phase: u64, cause: &str) {
        if handler_phase != self.phase {
            tracing::debug!(handler_phase, cause, "stale stream-sense switch ignored");
            return;
        }
        let Some(mut session) = self.session.take() else {
            return;
        };
        let flavor = session.flavor().alternate();
        let seed = session.leave_behind(false);
        session.dispose();
        self.phase += 1;
        tracing::info!(cause, ?flavor, "stream-sense transport switch");
        self.open_session(ctx, flavor, seed, cause);
    }

    // -------------------------------------------------------------------------
    // Outcome handling
    // -------------------------------------------------------------------------

    fn handle_outcomes(&mut self, ctx: &mut CoreCtx, outcomes: Vec<SessionOutcome>) {
        for outcome in outcomes {
            match outcome {
                SessionOutcome::Receiving { recovered } => self.on_receiving(ctx, recovered),
                SessionOutcome::Data(notification) => self.on_data(ctx, notification),
                SessionOutcome::Closed {
                    cause,
                    recoverable,
                    allow_recovery,
                } => {
                    self.on_session_closed(ctx, &cause, recoverable, allow_recovery);
                    break;
                }
                SessionOutcome::Fatal(error) => {
                    self.on_fatal(ctx, error);
                    break;
                }
                SessionOutcome::SwitchTransport { cause } => {
                    let handler_phase = self
                        .session
                        .as_ref()
                        .map_or(self.phase, Session::handler_phase);
                    self.stream_sense_switch(ctx, handler_phase, &cause);
                    break;
                }
            }
        }
    }

    fn on_receiving(&mut self, ctx: &mut CoreCtx, recovered: bool) {
        self.retry.reset(&ctx.options);
        self.recovery_deadline = None;
        self.pending_recovery = None;

        let constrain = ctx.options.requested_max_bandwidth;
        let CoreCtx {
            subscriptions,
            messages,
            pending,
            next_req_id,
            ..
        } = ctx;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut chan = RequestChannel {
            session,
            pending,
            next_req_id,
        };
        subscriptions.on_session_start(recovered, &mut chan);
        messages.on_session_start(&mut chan);
        if let Some(max_bandwidth) = constrain {
            chan.send_control(
                ControlOp::Constrain {
                    max_bandwidth: Some(max_bandwidth),
                },
                PendingRequest::Constrain,
            );
        }
        self.on_reverse_heartbeat_changed(ctx);
    }

    fn on_data(&mut self, ctx: &mut CoreCtx, notification: Notification) {
        match notification {
            Notification::ReqOk { req_id } => match ctx.pending.remove(&req_id) {
                Some(PendingRequest::SubscriptionAdd { .. }) => ctx.subscriptions.on_reqok(req_id),
                Some(_) => {}
                None => tracing::debug!(req_id, "REQOK for unknown request"),
            },
            Notification::ReqErr {
                req_id,
                code,
                message,
            } => match ctx.pending.remove(&req_id) {
                Some(PendingRequest::SubscriptionAdd { .. }) => {
                    ctx.subscriptions
                        .on_reqerr(req_id, code, &message, &ctx.dispatcher);
                }
                Some(PendingRequest::Message { sequence, prog }) => {
                    ctx.messages
                        .on_request_error(&sequence, prog, &ctx.dispatcher);
                }
                Some(PendingRequest::Constrain) => {
                    tracing::warn!(code, %message, "bandwidth constrain refused");
                }
                Some(
                    PendingRequest::SubscriptionDelete { .. }
                    | PendingRequest::Heartbeat
                    | PendingRequest::Destroy,
                ) => {
                    tracing::debug!(req_id, code, %message, "control request refused");
                }
                None => tracing::debug!(req_id, "REQERR for unknown request"),
            },
            Notification::MsgDone { sequence, prog } => {
                ctx.messages.on_msgdone(&sequence, prog, &ctx.dispatcher);
            }
            Notification::MsgFail {
                sequence,
                prog,
                code,
                message,
            } => {
                let CoreCtx {
                    messages,
                    pending,
                    next_req_id,
                    dispatcher,
                    ..
                } = ctx;
                let mut chan = self.request_channel(pending, next_req_id);
                messages.on_msgfail(&sequence, prog, code, &message, chan.as_mut(), dispatcher);
            }
            Notification::Error { code, message } => {
                self.on_fatal(ctx, ServerError { code, message });
            }
            other => {
                if !ctx.subscriptions.on_notification(&other, &ctx.dispatcher) {
                    tracing::trace!(?other, "unrouted notification");
                }
            }
        }
    }

    fn on_session_closed(
        &mut self,
        ctx: &mut CoreCtx,
        cause: &str,
        recoverable: bool,
        allow_recovery: bool,
    ) {
        tracing::info!(cause, recoverable, "session closed");
        let closed = self.session.take();
        let (bean, flavor) = match closed {
            Some(mut session) => {
                let bean = session.leave_behind(true);
                let flavor = session.flavor();
                session.dispose();
                (bean, flavor)
            }
            None => (None, TransportFlavor::initial(ctx.options.forced_transport)),
        };
        ctx.subscriptions.on_session_close();

        if !self.desired_connected {
            ctx.status.set(ClientStatus::Disconnected, &ctx.dispatcher);
            return;
        }
        if !recoverable {
            self.desired_connected = false;
            ctx.messages.on_disconnect(&ctx.dispatcher);
            ctx.status.set(ClientStatus::Disconnected, &ctx.dispatcher);
            return;
        }

        let recovery_enabled = ctx.options.session_recovery_timeout > Duration::ZERO;
        if allow_recovery && recovery_enabled {
            if let Some(bean) = bean {
                let first_attempt = self.recovery_deadline.is_none();
                let deadline = *self
                    .recovery_deadline
                    .get_or_insert_with(|| Instant::now() + ctx.options.session_recovery_timeout);
                if Instant::now() < deadline {
                    self.phase += 1;
                    ctx.status
                        .set(ClientStatus::DisconnectedTryingRecovery, &ctx.dispatcher);
                    if first_attempt {
                        self.open_session(ctx, flavor, Some(bean), "recovery");
                    } else {
                        self.pending_recovery = Some((bean, flavor));
                        let delay = self.retry.next_delay();
                        ctx.timers.schedule(
                            delay,
                            TimerPayload::Manager {
                                handler_phase: self.phase,
                                kind: ManagerTimer::Recover,
                            },
                        );
                    }
                    return;
                }
                tracing::info!("session recovery budget exhausted");
            }
        }

        // Fresh create after backoff.
        self.recovery_deadline = None;
        self.pending_recovery = None;
        self.phase += 1;
        ctx.messages.on_disconnect(&ctx.dispatcher);
        ctx.status
            .set(ClientStatus::DisconnectedWillRetry, &ctx.dispatcher);
        let delay = self.retry.next_delay();
        tracing::info!(delay_ms = delay.as_millis(), "retrying with a fresh session");
        ctx.timers.schedule(
            delay,
            TimerPayload::Manager {
                handler_phase: self.phase,
                kind: ManagerTimer::Retry,
            },
        );
    }

    fn on_fatal(&mut self, ctx: &mut CoreCtx, error: ServerError) {
        tracing::error!(code = error.code, message = %error.message, "fatal server error");
        if let Some(mut session) = self.session.take() {
            session.dispose();
        }
        self.desired_connected = false;
        self.phase += 1;
        self.recovery_deadline = None;
        self.pending_recovery = None;
        ctx.subscriptions.on_session_close();
        ctx.messages.on_disconnect(&ctx.dispatcher);
        ctx.status.set(ClientStatus::Disconnected, &ctx.dispatcher);
        ctx.status.server_error(error, &ctx.dispatcher);
    }

    fn open_session(
        &mut self,
        ctx: &mut CoreCtx,
        flavor: TransportFlavor,
        seed: Option<RecoveryBean>,
        cause: &str,
    ) {
        self.next_object_id += 1;
        tracing::info!(
            object_id = self.next_object_id,
            ?flavor,
            cause,
            recovery = seed.as_ref().is_some_and(|b| b.recovery),
            "opening session"
        );
        let mut session = Session::new(
            self.next_object_id,
            self.phase,
            flavor,
            ctx.options.forced_transport.is_some(),
            ctx.details.server_address.clone(),
            seed,
            &ctx.options,
        );
        let outcomes = session.start(ctx);
        self.session = Some(session);
        self.handle_outcomes(ctx, outcomes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectionOptions {
        ConnectionOptions::default()
    }

    #[test]
    fn retry_policy_doubles_up_to_ceiling() {
        let mut opts = options();
        opts.retry_delay = Duration::from_millis(100);
        opts.retry_delay_max = Duration::from_millis(350);
        let mut policy = RetryPolicy::from_options(&opts);

        let d1 = policy.next_delay();
        assert!(d1 >= Duration::from_millis(90) && d1 <= Duration::from_millis(110));
        let d2 = policy.next_delay();
        assert!(d2 >= Duration::from_millis(180) && d2 <= Duration::from_millis(220));
        let d3 = policy.next_delay();
        assert!(d3 <= Duration::from_millis(385), "capped, got {d3:?}");
    }

    #[test]
    fn retry_policy_reset_restores_base() {
        let mut opts = options();
        opts.retry_delay = Duration::from_millis(200);
        let mut policy = RetryPolicy::from_options(&opts);
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset(&opts);
        let delay = policy.next_delay();
        assert!(delay >= Duration::from_millis(180) && delay <= Duration::from_millis(220));
    }
}
