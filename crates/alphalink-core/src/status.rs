//! Decoded headset state.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Capabilities a firmware variant exposes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FeatureFlags: u8 {
        const SLEEP_TIMER = 0b0000_0001;
        const VOICE_PROMPT = 0b0000_0010;
        const MIC_MONITOR = 0b0000_0100;
        /// Firmware answers the mic-monitor state query
        const MIC_MONITOR_QUERY = 0b0000_1000;
    }
}

/// Headset auto-off timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepTimer {
    Minutes10,
    Minutes20,
    Minutes30,
    Off,
}

impl SleepTimer {
    /// Wire value (minutes, zero for off).
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Minutes10 => 0x0a,
            Self::Minutes20 => 0x14,
            Self::Minutes30 => 0x1e,
            Self::Off => 0x00,
        }
    }

    /// Parse a wire value.
    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x0a => Some(Self::Minutes10),
            0x14 => Some(Self::Minutes20),
            0x1e => Some(Self::Minutes30),
            0x00 => Some(Self::Off),
            _ => None,
        }
    }
}

/// One immutable snapshot of headset state, produced by a successful poll.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Headset linked to its dongle
    pub connected: bool,
    /// Battery level, known only while connected
    pub battery_percent: Option<u8>,
    pub mic_monitor_enabled: bool,
    /// Whether the headset has reported its mic monitor state since it
    /// came online; `mic_monitor_enabled` is a default until it has
    pub mic_monitor_known: bool,
    pub voice_prompt_enabled: bool,
    pub sleep_timer: Option<SleepTimer>,
    pub features: FeatureFlags,
}

/// Stable identity of one physical device.
///
/// Uses the serial number when the device exposes one, so a re-plug that
/// lands on a different hidraw node maps to the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Build an identity from what enumeration reported.
    #[must_use]
    pub fn new(serial: Option<&str>, path: &str) -> Self {
        match serial.map(str::trim).filter(|s| !s.is_empty()) {
            Some(serial) => Self(format!("serial:{serial}")),
            None => Self(format!("path:{path}")),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
