//! Session manager.
//!
//! Owns one session per physical device, routes enumerator events and
//! commands to them, picks the active device, and publishes a combined
//! status on a watch channel. All methods are synchronous and cheap; the
//! blocking work happens on the session and enumerator threads.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use alphalink_core::{
    CommandError, CompatibleModel, DeviceId, DeviceStatus, FeatureFlags, NotificationSink, PendingCommand,
    PolicyConfig, Preferences, SessionConfig, SessionState, SettingsStore,
};
use alphalink_hid::{EnumeratorEvent, EnumeratorHandle, Transport};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{Config, DriverTiming};
use crate::session::{
    CommandReply, SessionControl, SessionDriver, SessionHandle, SessionParams, SessionUpdate, UpdateKind,
};

/// Combined view of the managed devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub active_device: Option<DeviceId>,
    pub model: Option<&'static CompatibleModel>,
    pub state: SessionState,
    pub status: Option<DeviceStatus>,
    /// Compatible devices currently listed by the enumerator
    pub attached_count: usize,
    pub enumeration_degraded: bool,
}

impl Default for ManagerStatus {
    fn default() -> Self {
        Self {
            active_device: None,
            model: None,
            state: SessionState::Discovering,
            status: None,
            attached_count: 0,
            enumeration_degraded: false,
        }
    }
}

struct SessionEntry {
    handle: SessionHandle,
    generation: u64,
    path: String,
    model: &'static CompatibleModel,
    state: SessionState,
    status: Option<DeviceStatus>,
}

/// Coordinates device sessions.
pub struct SessionManager<T: Transport + Clone + 'static> {
    transport: T,
    store: Box<dyn SettingsStore>,
    preferences: Preferences,
    session_config: SessionConfig,
    policy_config: PolicyConfig,
    timing: DriverTiming,
    sink: Arc<dyn NotificationSink + Sync>,
    sessions: BTreeMap<DeviceId, SessionEntry>,
    /// Enumerated paths and the device behind each
    attached: BTreeMap<String, (DeviceId, &'static CompatibleModel)>,
    updates_tx: mpsc::Sender<SessionUpdate>,
    status_tx: watch::Sender<ManagerStatus>,
    enumerator: Option<EnumeratorHandle>,
    enumeration_degraded: bool,
    next_generation: u64,
    /// Devices whose saved mic setting was checked since they came online
    mic_synced: HashSet<DeviceId>,
}

impl<T: Transport + Clone + 'static> SessionManager<T> {
    /// Create a manager. Session updates arrive on the returned receiver
    /// and must be fed back through [`handle_session_update`](Self::handle_session_update).
    pub fn new(
        transport: T,
        store: Box<dyn SettingsStore>,
        config: &Config,
        sink: Arc<dyn NotificationSink + Sync>,
    ) -> (Self, mpsc::Receiver<SessionUpdate>) {
        let preferences = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load preferences, using defaults");
            Preferences::default()
        });
        debug!(selected = ?preferences.selected_device_id, "Preferences loaded");

        let (updates_tx, updates_rx) = mpsc::channel(256);
        let (status_tx, _) = watch::channel(ManagerStatus::default());

        let manager = Self {
            transport,
            store,
            session_config: config.session_config(),
            policy_config: config.policy_config(&preferences.notifications),
            timing: config.driver_timing(),
            preferences,
            sink,
            sessions: BTreeMap::new(),
            attached: BTreeMap::new(),
            updates_tx,
            status_tx,
            enumerator: None,
            enumeration_degraded: false,
            next_generation: 1,
            mic_synced: HashSet::new(),
        };
        (manager, updates_rx)
    }

    /// Hand over the running enumerator so scans and shutdown reach it.
    pub fn attach_enumerator(&mut self, enumerator: EnumeratorHandle) {
        self.enumerator = Some(enumerator);
    }

    /// Subscribe to the combined status.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ManagerStatus> {
        self.status_tx.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        self.status_tx.borrow().clone()
    }

    #[must_use]
    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    /// Number of live session threads.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The device commands go to: the saved selection if it is attached,
    /// otherwise the first attached device.
    #[must_use]
    pub fn active_device(&self) -> Option<&DeviceId> {
        let mut attached = self.attached.values().map(|(id, _)| id);
        let selected = self.preferences.selected_device_id.as_deref();
        attached
            .clone()
            .find(|id| Some(id.as_str()) == selected)
            .or_else(|| attached.next())
    }

    pub fn handle_enumerator_event(&mut self, event: EnumeratorEvent) {
        match event {
            EnumeratorEvent::Attached { path, id, model } => {
                self.attached.insert(path.clone(), (id.clone(), model));
                if !self.sessions.contains_key(&id) {
                    self.spawn_session(&id, model, &path);
                }
                if let Some(entry) = self.sessions.get_mut(&id) {
                    entry.path.clone_from(&path);
                }
                self.send(&id, SessionControl::Attached { path });
            }
            EnumeratorEvent::Detached { path, id } => {
                self.attached.remove(&path);
                let current = self.sessions.get(&id).is_some_and(|entry| entry.path == path);
                if current {
                    self.send(&id, SessionControl::Detached);
                } else {
                    debug!(device = %id, %path, "Ignoring detach of a stale path");
                }
            }
            EnumeratorEvent::EnumerationDegraded(e) => {
                if !self.enumeration_degraded {
                    warn!(error = %e, "Device discovery degraded");
                }
                self.enumeration_degraded = true;
            }
            EnumeratorEvent::EnumerationRestored => {
                if self.enumeration_degraded {
                    info!("Device discovery restored");
                }
                self.enumeration_degraded = false;
            }
        }
        self.publish();
    }

    pub fn handle_session_update(&mut self, update: SessionUpdate) {
        let SessionUpdate { id, generation, kind } = update;
        let Some(entry) = self.sessions.get_mut(&id) else {
            debug!(device = %id, "Update from unknown session");
            return;
        };
        if entry.generation != generation {
            debug!(device = %id, generation, "Update from replaced session");
            return;
        }

        match kind {
            UpdateKind::StateChanged { to, .. } => {
                entry.state = to;
                if to == SessionState::Connected {
                    self.persist_fallback_selection();
                } else if !to.is_live() {
                    entry.status = None;
                    self.mic_synced.remove(&id);
                }
            }
            UpdateKind::StatusChanged(status) => {
                let online = status.connected;
                entry.status = Some(status.clone());
                if online {
                    self.restore_mic_monitor(&id, &status);
                } else {
                    self.mic_synced.remove(&id);
                }
            }
            UpdateKind::CommandApplied(PendingCommand::ToggleMicMonitor(on)) => {
                if self.preferences.mic_monitor_enabled != Some(on) {
                    self.preferences.mic_monitor_enabled = Some(on);
                    self.save_preferences();
                }
            }
            UpdateKind::CommandApplied(_) => {}
            UpdateKind::Finished => {
                if let Some(entry) = self.sessions.remove(&id) {
                    entry.handle.join();
                }
                self.mic_synced.remove(&id);
                debug!(device = %id, "Session ended");

                // The device came back while the session was tearing down
                let revived = self
                    .attached
                    .iter()
                    .find(|(_, (attached_id, _))| *attached_id == id)
                    .map(|(path, (_, model))| (path.clone(), *model));
                if let Some((path, model)) = revived {
                    self.spawn_session(&id, model, &path);
                    self.send(&id, SessionControl::Attached { path });
                }
            }
        }
        self.publish();
    }

    /// Make `id` the active device and remember the choice.
    ///
    /// # Errors
    /// Returns [`CommandError::NoActiveDevice`] if `id` is not attached.
    pub fn select_device(&mut self, id: &DeviceId) -> Result<(), CommandError> {
        if !self.attached.values().any(|(a, _)| a == id) {
            return Err(CommandError::NoActiveDevice);
        }
        info!(device = %id, "Device selected");
        self.preferences.selected_device_id = Some(id.as_str().to_string());
        self.save_preferences();
        self.publish();
        Ok(())
    }

    /// Queue a command for the active device.
    ///
    /// # Errors
    /// Returns [`CommandError::NoActiveDevice`] if no device is active or
    /// the active device is not connected.
    pub fn submit_command(
        &mut self,
        command: PendingCommand,
    ) -> Result<oneshot::Receiver<Result<DeviceStatus, CommandError>>, CommandError> {
        let id = self.active_device().cloned().ok_or(CommandError::NoActiveDevice)?;
        let live = self.sessions.get(&id).is_some_and(|entry| entry.state.is_live());
        if !live {
            return Err(CommandError::NoActiveDevice);
        }

        let (tx, rx) = oneshot::channel();
        self.dispatch_command(&id, command, Some(tx))?;
        Ok(rx)
    }

    /// Run an extra enumeration and retry disconnected sessions.
    pub fn scan_now(&mut self) {
        info!("Manual device scan requested");
        if let Some(enumerator) = &self.enumerator {
            enumerator.scan_now();
        }
        let disconnected: Vec<DeviceId> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.state == SessionState::Disconnected)
            .map(|(id, _)| id.clone())
            .collect();
        for id in disconnected {
            self.send(&id, SessionControl::Scan);
        }
    }

    /// Stop the enumerator and every session, waiting for their threads.
    ///
    /// Drop the update receiver first so no session blocks reporting.
    pub fn shutdown(mut self) {
        info!(sessions = self.sessions.len(), "Shutting down sessions");
        if let Some(enumerator) = self.enumerator.take() {
            enumerator.shutdown();
        }
        for entry in self.sessions.values() {
            let _ = entry.handle.send(SessionControl::Shutdown);
        }
        for (id, entry) in std::mem::take(&mut self.sessions) {
            entry.handle.join();
            debug!(device = %id, "Session stopped");
        }
    }

    fn spawn_session(&mut self, id: &DeviceId, model: &'static CompatibleModel, path: &str) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let params = SessionParams {
            id: id.clone(),
            generation,
            model,
            path: path.to_string(),
            session: self.session_config.clone(),
            policy: self.policy_config.clone(),
            timing: self.timing,
        };
        let driver = SessionDriver::new(params, self.transport.clone(), Arc::clone(&self.sink));
        match SessionHandle::spawn(driver, self.updates_tx.clone()) {
            Ok(handle) => {
                info!(device = %id, %path, %model, "Session started");
                self.sessions.insert(
                    id.clone(),
                    SessionEntry {
                        handle,
                        generation,
                        path: path.to_string(),
                        model,
                        state: SessionState::Idle,
                        status: None,
                    },
                );
            }
            Err(e) => error!(device = %id, error = %e, "Failed to start session thread"),
        }
    }

    /// Send to a session, replacing it if its thread already exited.
    fn send(&mut self, id: &DeviceId, control: SessionControl) {
        let Some(entry) = self.sessions.get(id) else {
            return;
        };
        let Err(control) = entry.handle.send(control) else {
            return;
        };

        debug!(device = %id, "Session thread gone, restarting");
        let (path, model) = (entry.path.clone(), entry.model);
        if let Some(stale) = self.sessions.remove(id) {
            stale.handle.join();
        }
        self.spawn_session(id, model, &path);
        if let Some(entry) = self.sessions.get(id) {
            let _ = entry.handle.send(control);
        }
    }

    fn dispatch_command(
        &mut self,
        id: &DeviceId,
        command: PendingCommand,
        reply: Option<CommandReply>,
    ) -> Result<(), CommandError> {
        let entry = self.sessions.get(id).ok_or(CommandError::NoActiveDevice)?;
        entry
            .handle
            .send(SessionControl::Command { command, reply })
            .map_err(|_| CommandError::NoActiveDevice)
    }

    /// Re-apply the saved mic monitor setting once per online period.
    ///
    /// Sent whenever the headset has not reported its mic state, since it
    /// cannot then be known to match.
    fn restore_mic_monitor(&mut self, id: &DeviceId, status: &DeviceStatus) {
        if self.active_device() != Some(id) || !self.mic_synced.insert(id.clone()) {
            return;
        }
        let Some(wanted) = self.preferences.mic_monitor_enabled else {
            return;
        };
        if !status.features.contains(FeatureFlags::MIC_MONITOR)
            || (status.mic_monitor_known && status.mic_monitor_enabled == wanted)
        {
            return;
        }
        info!(device = %id, enabled = wanted, "Restoring saved mic monitor setting");
        if let Err(e) = self.dispatch_command(id, PendingCommand::ToggleMicMonitor(wanted), None) {
            warn!(device = %id, error = %e, "Could not restore mic monitor setting");
        }
    }

    /// Replace a saved selection that is not attached with the active
    /// device. Nothing is saved when the user never picked one.
    fn persist_fallback_selection(&mut self) {
        let Some(saved) = self.preferences.selected_device_id.as_deref() else {
            return;
        };
        let Some(active) = self.active_device().cloned() else {
            return;
        };
        if saved != active.as_str() {
            info!(saved, device = %active, "Saved device not attached, selecting fallback");
            self.preferences.selected_device_id = Some(active.as_str().to_string());
            self.save_preferences();
        }
    }

    fn save_preferences(&self) {
        if let Err(e) = self.store.save(&self.preferences) {
            warn!(error = %e, "Failed to save preferences");
        }
    }

    fn publish(&self) {
        let active = self.active_device().cloned();
        let entry = active.as_ref().and_then(|id| self.sessions.get(id));
        let next = ManagerStatus {
            model: entry.map(|e| e.model),
            state: entry.map_or(SessionState::Discovering, |e| e.state),
            status: entry.and_then(|e| e.status.clone()),
            active_device: active,
            attached_count: self.attached.len(),
            enumeration_degraded: self.enumeration_degraded,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
