use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProcessState {
    /// Not running. The initial state.
    Stopped = 0,
    /// Launched, waiting for the health check to pass
    Starting = 1,
    /// Healthy and accepting requests
    Ready = 2,
    /// Being shut down
    Stopping = 3,
    /// Failed to launch or never became healthy
    Failed = 4,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Stopping => "stopping",
            ProcessState::Failed => "failed",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessState::Starting,
            2 => ProcessState::Ready,
            3 => ProcessState::Stopping,
            4 => ProcessState::Failed,
            _ => ProcessState::Stopped,
        }
    }

    /// Whether the transition table allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped | Failed, Starting)
                | (Starting, Ready | Failed | Stopping | Stopped)
                | (Ready, Stopping | Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Whether the process holds an OS child in this state.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Ready | ProcessState::Stopping
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
