//! TOML-file preferences store.

use std::path::PathBuf;

use alphalink_core::error::SettingsResult;
use alphalink_core::{Preferences, SettingsError, SettingsStore};
use tracing::{debug, warn};

/// Preferences kept in a TOML file.
///
/// A missing, unreadable or corrupt file loads as defaults; the next save
/// replaces it.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> SettingsResult<Preferences> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No saved preferences");
                return Ok(Preferences::default());
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to read preferences, using defaults");
                return Ok(Preferences::default());
            }
        };

        Ok(toml::from_str(&content).unwrap_or_else(|e| {
            warn!(path = ?self.path, error = %e, "Corrupt preferences file, using defaults");
            Preferences::default()
        }))
    }

    fn save(&self, preferences: &Preferences) -> SettingsResult<()> {
        let content = toml::to_string_pretty(preferences).map_err(|e| SettingsError::Format(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write beside the target and rename so a crash never leaves a
        // truncated file
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = ?self.path, "Preferences saved");
        Ok(())
    }
}
