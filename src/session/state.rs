//! Session lifecycle states.
//!
//! One session attempt moves through these states exactly once; SLEEP is the
//! terminal gathering point for every failure path, and OFF is reached only
//! through destruction. Transitions outside the table are programming
//! errors, asserted in debug builds and logged in release builds.

/// State of one session attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Not started or already destroyed.
    Off,
    /// Create (or recover) request in flight.
    Creating,
    /// Server answered `CONOK`; no channel bound yet.
    Created,
    /// First bind of this session in flight.
    FirstBinding,
    /// Server looped the first bind; rebind scheduled.
    FirstPause,
    /// A rebind is in flight.
    Binding,
    /// The bound channel is delivering.
    Receiving,
    /// No data within the keepalive budget.
    Stalled,
    /// Server looped an established channel; rebind scheduled.
    Pause,
    /// Dead; awaiting retry, recovery or destruction.
    Sleep,
}

impl SessionState {
    /// Whether `self → to` is a legal transition.
    pub(crate) fn can_move_to(self, to: Self) -> bool {
        use SessionState::{
            Binding, Created, Creating, FirstBinding, FirstPause, Off, Pause, Receiving, Sleep,
            Stalled,
        };
        matches!(
            (self, to),
            (Off, Creating)
                | (Creating, Created | Sleep)
                | (Created, FirstBinding | Sleep)
                | (FirstBinding, FirstPause | Receiving | Sleep)
                | (FirstPause, Binding | Sleep)
                | (Binding, Pause | Receiving | Sleep)
                | (Receiving, Stalled | Pause | Sleep)
                | (Stalled, Receiving | Sleep)
                | (Pause, Binding | Sleep)
                | (Sleep, Creating | Off)
        )
    }

    /// Whether a bind (or rebind) is currently in flight.
    pub(crate) fn is_binding(self) -> bool {
        matches!(self, Self::FirstBinding | Self::Binding)
    }

    /// Whether the session holds a delivering channel.
    pub(crate) fn is_established(self) -> bool {
        matches!(self, Self::Receiving | Self::Stalled)
    }

    /// Whether the session is waiting between binds.
    pub(crate) fn is_paused(self) -> bool {
        matches!(self, Self::FirstPause | Self::Pause)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::{
        Binding, Created, Creating, FirstBinding, FirstPause, Off, Pause, Receiving, Sleep, Stalled,
    };

    #[test]
    fn happy_path_is_legal() {
        let path = [
            Off,
            Creating,
            Created,
            FirstBinding,
            Receiving,
            Pause,
            Binding,
            Receiving,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_move_to(pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn stall_and_recovery_path_is_legal() {
        assert!(Receiving.can_move_to(Stalled));
        assert!(Stalled.can_move_to(Receiving));
        assert!(Stalled.can_move_to(Sleep));
        assert!(Sleep.can_move_to(Creating));
        assert!(Sleep.can_move_to(Off));
    }

    #[test]
    fn loop_during_first_bind_pauses() {
        assert!(FirstBinding.can_move_to(FirstPause));
        assert!(FirstPause.can_move_to(Binding));
    }

    #[test]
    fn illegal_moves_are_rejected() {
        assert!(!Off.can_move_to(Receiving));
        assert!(!Receiving.can_move_to(Creating));
        assert!(!Created.can_move_to(Receiving));
        assert!(!Pause.can_move_to(Receiving));
        assert!(!Sleep.can_move_to(Receiving));
    }
}
