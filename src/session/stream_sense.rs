//! Transport selection ("stream-sense").
//!
//! The default policy tries WebSocket streaming, steps down to polling on
//! the same transport when streaming yields no data in time, and asks the
//! session manager to switch to the HTTP flavor when the WebSocket side is
//! broken outright. A forced transport short-circuits all of it.
//!
//! The WebSocket substate machine runs alongside the session states: the
//! socket may be opened early (while the create round-trip is in flight),
//! re-targeted when the server redirects to a control link mid-create, or
//! found broken exactly when the bind needs it.

use crate::client::status::ClientStatus;
use crate::config::ForcedTransport;

/// Concrete transport + delivery mode of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportFlavor {
    WsStreaming,
    WsPolling,
    HttpStreaming,
    HttpPolling,
}

impl TransportFlavor {
    /// The flavor a fresh connect starts with.
    pub(crate) fn initial(forced: Option<ForcedTransport>) -> Self {
        match forced {
            None | Some(ForcedTransport::Ws | ForcedTransport::WsStreaming) => Self::WsStreaming,
            Some(ForcedTransport::WsPolling) => Self::WsPolling,
            Some(ForcedTransport::Http | ForcedTransport::HttpStreaming) => Self::HttpStreaming,
            Some(ForcedTransport::HttpPolling) => Self::HttpPolling,
        }
    }

    pub(crate) fn is_ws(self) -> bool {
        matches!(self, Self::WsStreaming | Self::WsPolling)
    }

    pub(crate) fn is_streaming(self) -> bool {
        matches!(self, Self::WsStreaming | Self::HttpStreaming)
    }

    /// Same transport, polling delivery.
    pub(crate) fn polling_variant(self) -> Self {
        match self {
            Self::WsStreaming | Self::WsPolling => Self::WsPolling,
            Self::HttpStreaming | Self::HttpPolling => Self::HttpPolling,
        }
    }

    /// The other transport, same delivery mode.
    pub(crate) fn alternate(self) -> Self {
        match self {
            Self::WsStreaming => Self::HttpStreaming,
            Self::WsPolling => Self::HttpPolling,
            Self::HttpStreaming => Self::WsStreaming,
            Self::HttpPolling => Self::WsPolling,
        }
    }

    /// Status published once this flavor is receiving.
    pub(crate) fn status(self) -> ClientStatus {
        match self {
            Self::WsStreaming => ClientStatus::WsStreaming,
            Self::WsPolling => ClientStatus::WsPolling,
            Self::HttpStreaming => ClientStatus::HttpStreaming,
            Self::HttpPolling => ClientStatus::HttpPolling,
        }
    }

    /// Whether stream-sense may step this flavor down to polling.
    pub(crate) fn may_downgrade(self, forced: Option<ForcedTransport>) -> bool {
        self.is_streaming()
            && !matches!(
                forced,
                Some(ForcedTransport::WsStreaming | ForcedTransport::HttpStreaming)
            )
    }

}

/// WebSocket handshake substate, maintained in parallel with the session
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WsPhase {
    /// No socket opened yet.
    NotConnected,
    /// Handshake in flight.
    Connecting,
    /// Socket open and writable.
    Connected,
    /// Handshake failed; the socket cannot carry this session.
    Broken,
}

/// Where a bind request can go right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindRoute {
    /// Channel is open: send the bind.
    SendNow,
    /// Handshake already in flight: bind when it completes.
    AwaitOpen,
    /// No socket yet: open one, then bind.
    OpenFirst,
    /// Socket broken: the manager must switch transports.
    Escalate,
}

/// Stream-sense bookkeeping carried by each session.
#[derive(Debug)]
pub(crate) struct StreamSense {
    pub ws: WsPhase,
    /// A bind is waiting for the WebSocket handshake to finish.
    pub pending_bind: bool,
}

impl StreamSense {
    pub(crate) fn new() -> Self {
        Self {
            ws: WsPhase::NotConnected,
            pending_bind: false,
        }
    }

    /// Route a bind request according to the WebSocket substate.
    pub(crate) fn bind_route(&self, flavor: TransportFlavor) -> BindRoute {
        if !flavor.is_ws() {
            return BindRoute::SendNow;
        }
        match self.ws {
            WsPhase::Connected => BindRoute::SendNow,
            WsPhase::Connecting => BindRoute::AwaitOpen,
            WsPhase::NotConnected => BindRoute::OpenFirst,
            WsPhase::Broken => BindRoute::Escalate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_flavor_honors_forced_transport() {
        assert_eq!(TransportFlavor::initial(None), TransportFlavor::WsStreaming);
        assert_eq!(
            TransportFlavor::initial(Some(ForcedTransport::HttpPolling)),
            TransportFlavor::HttpPolling
        );
        assert_eq!(
            TransportFlavor::initial(Some(ForcedTransport::Http)),
            TransportFlavor::HttpStreaming
        );
    }

    #[test]
    fn alternate_swaps_transport_not_mode() {
        assert_eq!(
            TransportFlavor::WsStreaming.alternate(),
            TransportFlavor::HttpStreaming
        );
        assert_eq!(
            TransportFlavor::HttpPolling.alternate(),
            TransportFlavor::WsPolling
        );
    }

    #[test]
    fn downgrade_policy() {
        assert!(TransportFlavor::WsStreaming.may_downgrade(None));
        assert!(TransportFlavor::WsStreaming.may_downgrade(Some(ForcedTransport::Ws)));
        assert!(!TransportFlavor::WsStreaming.may_downgrade(Some(ForcedTransport::WsStreaming)));
        assert!(!TransportFlavor::WsPolling.may_downgrade(None));
    }

    #[test]
    fn bind_routing_follows_ws_phase() {
        let mut sense = StreamSense::new();
        assert_eq!(
            sense.bind_route(TransportFlavor::WsStreaming),
            BindRoute::OpenFirst
        );
        sense.ws = WsPhase::Connecting;
        assert_eq!(
            sense.bind_route(TransportFlavor::WsStreaming),
            BindRoute::AwaitOpen
        );
        sense.ws = WsPhase::Connected;
        assert_eq!(
            sense.bind_route(TransportFlavor::WsStreaming),
            BindRoute::SendNow
        );
        sense.ws = WsPhase::Broken;
        assert_eq!(
            sense.bind_route(TransportFlavor::WsStreaming),
            BindRoute::Escalate
        );
        // HTTP flavors never depend on the socket substate.
        assert_eq!(
            sense.bind_route(TransportFlavor::HttpStreaming),
            BindRoute::SendNow
        );
    }
}
