//! Connection lifecycle state machine.
//!
//! State only advances through [`SessionState::next`]. Events that make no
//! sense in the current state are ignored, except [`SessionEvent::LinkDown`]
//! which moves every live state to [`SessionState::Disconnected`].

use crate::status::{Status, StatusSender};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Discovering,
    Connecting,
    DiscoveringServices,
    ReadingDeviceInfo,
    ArmingMeasurement,
    AwaitingMeasurement,
    Disconnected,
}

/// Protocol milestones that advance the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Scan produced a peripheral matching the name filter
    PeripheralMatched,
    /// Link reported connected
    LinkUp,
    /// GATT database read and the Blood Pressure service is present
    ServicesDiscovered,
    /// Device Information reads finished
    IdentityRead,
    /// Arming delay elapsed and the start command was attempted
    Armed,
    /// Link lost, connect failed, or the caller stopped the session
    LinkDown,
}

impl SessionState {
    /// Transition function. `None` means the event does not apply.
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Disconnected, _) => None,
            (_, E::LinkDown) => Some(S::Disconnected),
            (S::Discovering, E::PeripheralMatched) => Some(S::Connecting),
            (S::Connecting, E::LinkUp) => Some(S::DiscoveringServices),
            (S::DiscoveringServices, E::ServicesDiscovered) => Some(S::ReadingDeviceInfo),
            (S::ReadingDeviceInfo, E::IdentityRead) => Some(S::ArmingMeasurement),
            (S::ArmingMeasurement, E::Armed) => Some(S::AwaitingMeasurement),
            _ => None,
        }
    }

    /// Indications are enabled and measurement packets are expected.
    pub fn accepts_measurements(self) -> bool {
        matches!(
            self,
            SessionState::ArmingMeasurement | SessionState::AwaitingMeasurement
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Discovering => "discovering",
            SessionState::Connecting => "connecting",
            SessionState::DiscoveringServices => "discovering services",
            SessionState::ReadingDeviceInfo => "reading device info",
            SessionState::ArmingMeasurement => "arming measurement",
            SessionState::AwaitingMeasurement => "awaiting measurement",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Single owner of the current [`SessionState`]; publishes every transition.
#[derive(Debug)]
pub struct Lifecycle {
    state: SessionState,
    status: StatusSender,
}

impl Lifecycle {
    pub fn new(status: StatusSender) -> Self {
        status.emit(Status::StateChanged(SessionState::Discovering));
        Self {
            state: SessionState::Discovering,
            status,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> &StatusSender {
        &self.status
    }

    /// Apply `event`, returning whether the state changed.
    pub fn apply(&mut self, event: SessionEvent) -> bool {
        match self.state.next(event) {
            Some(next) => {
                info!(from = %self.state, to = %next, "session state");
                self.state = next;
                self.status.emit(Status::StateChanged(next));
                true
            }
            None => {
                debug!(state = %self.state, ?event, "event ignored");
                false
            }
        }
    }
}
