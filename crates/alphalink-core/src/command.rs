//! Control commands for the headset.
//!
//! Commands are submitted to the session manager and owned by the device
//! session until the headset confirms them or they time out.

use serde::{Deserialize, Serialize};

use crate::status::{DeviceStatus, SleepTimer};

/// A command waiting to be applied to the headset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum PendingCommand {
    /// Set the auto-off timer
    SetSleepTimer(SleepTimer),
    /// Turn voice prompts on or off
    ToggleVoicePrompt(bool),
    /// Turn microphone monitoring (sidetone) on or off
    ToggleMicMonitor(bool),
}

impl PendingCommand {
    /// Whether `status` shows this command took effect.
    #[must_use]
    pub fn is_reflected_in(&self, status: &DeviceStatus) -> bool {
        match *self {
            Self::SetSleepTimer(timer) => status.sleep_timer == Some(timer),
            Self::ToggleVoicePrompt(on) => status.voice_prompt_enabled == on,
            Self::ToggleMicMonitor(on) => status.mic_monitor_known && status.mic_monitor_enabled == on,
        }
    }
}
