//! Flash session state machine.
//!
//! The session walks a fixed path across two re-enumerations:
//!
//! ```text
//! Idle -> ConnectingStage1 -> WaitingDisconnect -> PromptRefresh1 -> [reload]
//!      -> (ConnectingStage2 | PromptConnectStage2 -> ConnectingStage2)
//!      -> WaitingStable -> PromptRefresh2 -> [reload]
//!      -> (ConnectingFlash | PromptConnectFlash -> ConnectingFlash)
//!      -> Flashing -> FlashComplete -> Idle
//! ```
//!
//! `Error` is reachable from every state and is left only by a user reset.

use std::fmt;
use std::str::FromStr;

use crate::dfu::DfuDevice;
use crate::transport::UsbDevice;

/// Persisted phase of a flash session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlashState {
    #[default]
    Idle,
    ConnectingStage1,
    WaitingDisconnect,
    PromptRefresh1,
    PromptConnectStage2,
    ConnectingStage2,
    WaitingStable,
    PromptRefresh2,
    PromptConnectFlash,
    ConnectingFlash,
    Flashing,
    FlashComplete,
    Error,
}

/// Unknown state tag read from the session store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown flash state '{0}'")]
pub struct UnknownState(pub String);

impl FlashState {
    pub const ALL: [FlashState; 13] = [
        FlashState::Idle,
        FlashState::ConnectingStage1,
        FlashState::WaitingDisconnect,
        FlashState::PromptRefresh1,
        FlashState::PromptConnectStage2,
        FlashState::ConnectingStage2,
        FlashState::WaitingStable,
        FlashState::PromptRefresh2,
        FlashState::PromptConnectFlash,
        FlashState::ConnectingFlash,
        FlashState::Flashing,
        FlashState::FlashComplete,
        FlashState::Error,
    ];

    /// Tag written to the session store.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashState::Idle => "idle",
            FlashState::ConnectingStage1 => "connecting_stage1",
            FlashState::WaitingDisconnect => "waiting_disconnect",
            FlashState::PromptRefresh1 => "prompt_refresh_1",
            FlashState::PromptConnectStage2 => "prompt_connect_stage2",
            FlashState::ConnectingStage2 => "connecting_stage2",
            FlashState::WaitingStable => "waiting_stable",
            FlashState::PromptRefresh2 => "prompt_refresh_2",
            FlashState::PromptConnectFlash => "prompt_connect_flash",
            FlashState::ConnectingFlash => "connecting_flash",
            FlashState::Flashing => "flashing",
            FlashState::FlashComplete => "flash_complete",
            FlashState::Error => "error",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: FlashState) -> bool {
        use FlashState::*;

        if next == Error {
            return *self != Error;
        }
        matches!(
            (*self, next),
            (Idle, ConnectingStage1)
                | (ConnectingStage1, WaitingDisconnect | Idle)
                | (WaitingDisconnect, PromptRefresh1)
                | (PromptRefresh1, ConnectingStage2 | PromptConnectStage2)
                | (PromptConnectStage2, ConnectingStage2)
                | (ConnectingStage2, WaitingStable | PromptConnectStage2)
                | (WaitingStable, PromptRefresh2)
                | (PromptRefresh2, ConnectingFlash | PromptConnectFlash)
                | (PromptConnectFlash, ConnectingFlash)
                | (ConnectingFlash, Flashing | PromptConnectFlash)
                | (Flashing, FlashComplete)
                | (FlashComplete, Idle)
                | (Error, Idle)
        )
    }

    /// States that are meaningless without the serial of the device in flight.
    pub fn requires_serial(&self) -> bool {
        !matches!(
            self,
            FlashState::Idle
                | FlashState::ConnectingStage1
                | FlashState::FlashComplete
                | FlashState::Error
        )
    }

    /// State to resume from when this one is loaded after a reload.
    ///
    /// Work that was in flight is repeated from the last point that did not
    /// need a live device handle.
    pub fn restore_checkpoint(&self) -> FlashState {
        match self {
            FlashState::Idle | FlashState::ConnectingStage1 | FlashState::FlashComplete => {
                FlashState::Idle
            }
            FlashState::WaitingDisconnect
            | FlashState::ConnectingStage2
            | FlashState::WaitingStable => FlashState::PromptRefresh1,
            FlashState::ConnectingFlash | FlashState::Flashing => FlashState::PromptRefresh2,
            other => *other,
        }
    }

    /// Whether a user action is acted upon in this state.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            FlashState::Idle
                | FlashState::PromptConnectStage2
                | FlashState::PromptConnectFlash
                | FlashState::Error
        )
    }

    /// States in which the current device may leave the bus without harm.
    pub fn tolerates_disconnect(&self) -> bool {
        matches!(
            self,
            FlashState::Idle
                | FlashState::Error
                | FlashState::FlashComplete
                | FlashState::WaitingDisconnect
                | FlashState::PromptRefresh1
                | FlashState::PromptRefresh2
                | FlashState::PromptConnectStage2
                | FlashState::PromptConnectFlash
        )
    }

    /// Whether the session waits for a reload in this state.
    pub fn awaits_reload(&self) -> bool {
        matches!(self, FlashState::PromptRefresh1 | FlashState::PromptRefresh2)
    }

    /// User-facing description of the state.
    pub fn prompt(&self) -> &'static str {
        match self {
            FlashState::Idle => "Ready to connect",
            FlashState::ConnectingStage1
            | FlashState::ConnectingStage2
            | FlashState::ConnectingFlash => "Connecting... confirm the device selection",
            FlashState::WaitingDisconnect => "Stage 1 connected. Switching device mode...",
            FlashState::PromptRefresh1 => "Stage 1 done! Restart the flasher now",
            FlashState::PromptConnectStage2 => "Grant permission to connect stage 2",
            FlashState::WaitingStable => "Stage 2 connected. Stabilizing...",
            FlashState::PromptRefresh2 => "Stage 2 ready! Restart the flasher again",
            FlashState::PromptConnectFlash => "Grant permission to connect for flashing",
            FlashState::Flashing => "Flashing firmware... do not disconnect!",
            FlashState::FlashComplete => "Update complete! The device is rebooting",
            FlashState::Error => "An error occurred. Reset to start over",
        }
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlashState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// Runtime state of one flash session.
pub struct SessionContext<D: UsbDevice> {
    pub state: FlashState,
    /// Serial of the device in flight; empty until stage 1 captured it.
    pub serial: String,
    /// Device currently bound to the session.
    pub device: Option<DfuDevice<D>>,
}

impl<D: UsbDevice> SessionContext<D> {
    pub fn new(state: FlashState, serial: String) -> Self {
        Self {
            state,
            serial,
            device: None,
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: FlashState) {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for state in FlashState::ALL {
            assert_eq!(state.as_str().parse::<FlashState>(), Ok(state));
        }
        assert_eq!(
            "bogus".parse::<FlashState>(),
            Err(UnknownState("bogus".into()))
        );
    }

    #[test]
    fn test_happy_path_is_legal() {
        use FlashState::*;
        let path = [
            Idle,
            ConnectingStage1,
            WaitingDisconnect,
            PromptRefresh1,
            ConnectingStage2,
            WaitingStable,
            PromptRefresh2,
            PromptConnectFlash,
            ConnectingFlash,
            Flashing,
            FlashComplete,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_illegal_moves_rejected() {
        use FlashState::*;
        assert!(!Idle.can_transition_to(Flashing));
        assert!(!PromptRefresh1.can_transition_to(WaitingStable));
        assert!(!Flashing.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Error));
        assert!(!Error.can_transition_to(ConnectingStage1));
        // Stage 1 cancellation returns to idle, later stages return to their prompt.
        assert!(ConnectingStage1.can_transition_to(Idle));
        assert!(!ConnectingStage2.can_transition_to(Idle));
        assert!(ConnectingStage2.can_transition_to(PromptConnectStage2));
    }

    #[test]
    fn test_every_state_can_fail() {
        for state in FlashState::ALL {
            if state != FlashState::Error {
                assert!(state.can_transition_to(FlashState::Error));
            }
        }
    }

    #[test]
    fn test_serial_requirements() {
        let without: Vec<_> = FlashState::ALL
            .into_iter()
            .filter(|s| !s.requires_serial())
            .collect();
        assert_eq!(
            without,
            vec![
                FlashState::Idle,
                FlashState::ConnectingStage1,
                FlashState::FlashComplete,
                FlashState::Error
            ]
        );
    }

    #[test]
    fn test_checkpoints() {
        use FlashState::*;
        assert_eq!(WaitingDisconnect.restore_checkpoint(), PromptRefresh1);
        assert_eq!(ConnectingStage2.restore_checkpoint(), PromptRefresh1);
        assert_eq!(WaitingStable.restore_checkpoint(), PromptRefresh1);
        assert_eq!(Flashing.restore_checkpoint(), PromptRefresh2);
        assert_eq!(ConnectingFlash.restore_checkpoint(), PromptRefresh2);
        assert_eq!(ConnectingStage1.restore_checkpoint(), Idle);
        assert_eq!(FlashComplete.restore_checkpoint(), Idle);
        assert_eq!(PromptConnectFlash.restore_checkpoint(), PromptConnectFlash);
        assert_eq!(Error.restore_checkpoint(), Error);
    }
}
