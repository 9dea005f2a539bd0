//! Device session states and the events that drive them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PollFailure, TransportError};
use crate::status::DeviceStatus;

/// Lifecycle state of one managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not managed; no handle, no policy state
    #[default]
    Idle,
    /// Waiting for a compatible device to show up
    Discovering,
    /// Opening the handle and reading the first status
    Connecting,
    /// Polling normally
    Connected,
    /// Recent polls failed but the device has not gone away
    Degraded,
    /// Retries exhausted or device detached; waiting for it to reappear
    Disconnected,
}

impl SessionState {
    /// Whether the session holds an open handle it is polling.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Events that can trigger session state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    // Enumerator events
    Attached,
    Detached,
    ScanRequested,

    // Transport results
    Opened,
    OpenFailed(TransportError),

    // Poll results
    PollSucceeded(DeviceStatus),
    PollFailed(PollFailure),

    // Control events
    Teardown,
}
