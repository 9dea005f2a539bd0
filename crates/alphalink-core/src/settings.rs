//! User preferences shared with the UI.
//!
//! The core only knows this key-value shape and the [`SettingsStore`]
//! contract; how and where preferences are stored is up to the
//! implementation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SettingsResult;

/// Which notification kinds the user wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    #[serde(default = "default_true")]
    pub connection_alerts: bool,
    #[serde(default = "default_true")]
    pub battery_alerts: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self { connection_alerts: true, battery_alerts: true }
    }
}

fn default_true() -> bool {
    true
}

/// Persisted user preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    /// Device the user picked last time
    #[serde(default)]
    pub selected_device_id: Option<String>,
    /// Desired mic monitoring state; unset until the user toggles it once
    #[serde(default)]
    pub mic_monitor_enabled: Option<bool>,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub notifications: NotificationPreferences,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            selected_device_id: None,
            mic_monitor_enabled: None,
            theme: default_theme(),
            notifications: NotificationPreferences::default(),
        }
    }
}

fn default_theme() -> String {
    "system".to_string()
}

/// Loads and saves [`Preferences`].
pub trait SettingsStore: Send {
    /// Load preferences, or defaults when nothing has been saved yet.
    ///
    /// # Errors
    /// Returns an error if stored preferences exist but cannot be read.
    fn load(&self) -> SettingsResult<Preferences>;

    /// Persist preferences.
    ///
    /// # Errors
    /// Returns an error if the preferences cannot be written.
    fn save(&self, preferences: &Preferences) -> SettingsResult<()>;
}

/// Store that keeps preferences in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Preferences>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(preferences: Preferences) -> Self {
        Self { inner: Mutex::new(preferences) }
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> SettingsResult<Preferences> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, preferences: &Preferences) -> SettingsResult<()> {
        *self.inner.lock() = preferences.clone();
        Ok(())
    }
}
