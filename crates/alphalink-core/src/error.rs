//! Error types for Alphalink core.
//!
//! Every failure the hardware can produce is converted into one of these
//! typed values at the boundary where it occurs. None of them abort the
//! session loop; they feed its retry policy instead.

use thiserror::Error;

use crate::codec::DecodeError;

/// Failure while listing HID devices. Always transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnumerationError {
    #[error("HID subsystem unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied while listing HID devices - check udev rules")]
    PermissionDenied,
}

/// Failure while opening, writing or reading a HID handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Permission denied opening {0} - install the udev rule for this headset")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("HID I/O error: {0}")]
    IoError(String),

    #[error("HID operation timed out")]
    Timeout,

    #[error("Device disconnected")]
    Disconnected,
}

impl TransportError {
    /// Whether this failure means the device is physically gone.
    #[must_use]
    pub fn implies_detach(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Disconnected)
    }
}

/// A status poll failed, either on the wire or while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid status response: {0}")]
    Decode(#[from] DecodeError),
}

impl PollFailure {
    /// Whether this failure means the device is physically gone.
    #[must_use]
    pub fn implies_detach(&self) -> bool {
        match self {
            Self::Transport(e) => e.implies_detach(),
            Self::Decode(_) => false,
        }
    }

    /// Whether the headset simply did not answer in time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout))
    }

    /// Whether this is a wire failure other than a timeout.
    #[must_use]
    pub fn is_hard_io(&self) -> bool {
        matches!(self, Self::Transport(e) if *e != TransportError::Timeout)
    }
}

/// Failure surfaced to whoever submitted a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Command was not acknowledged by the headset")]
    Unacknowledged,

    #[error("No active headset")]
    NoActiveDevice,

    #[error("Command queue full ({limit} pending), dropping command")]
    QueueFull { limit: usize },
}

/// Failure reading or writing persisted preferences.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Preferences I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Preferences format error: {0}")]
    Format(String),
}

/// Result type for preference storage.
pub type SettingsResult<T> = std::result::Result<T, SettingsError>;
