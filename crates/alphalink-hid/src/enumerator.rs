//! Hotplug detection by periodic enumeration.
//!
//! The enumerator lists HID interfaces, keeps the compatible ones, and
//! reports the difference against the previous listing as attach/detach
//! events. A failed listing leaves the known set untouched so a transient
//! error never looks like every device being unplugged.

use std::collections::BTreeMap;
use std::io;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use alphalink_core::registry::{self, CompatibleModel};
use alphalink_core::{DeviceId, EnumerationError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One HID interface as listed by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceEntry {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Negative when the platform does not report one
    pub interface_number: i32,
    pub serial_number: Option<String>,
    /// Product name from the USB descriptor, for logs
    pub product_string: Option<String>,
}

/// Lists HID interfaces.
pub trait DeviceScanner: Send + 'static {
    /// List every HID interface currently present.
    ///
    /// # Errors
    /// Returns an [`EnumerationError`] if the listing failed.
    fn scan(&self) -> Result<Vec<HidDeviceEntry>, EnumerationError>;
}

/// Changes in the set of compatible devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumeratorEvent {
    Attached { path: String, id: DeviceId, model: &'static CompatibleModel },
    Detached { path: String, id: DeviceId },
    /// Listing started failing; sent once per failure streak
    EnumerationDegraded(EnumerationError),
    /// Listing works again after a failure streak
    EnumerationRestored,
}

#[derive(Debug, Clone)]
struct Known {
    id: DeviceId,
    model: &'static CompatibleModel,
    product: Option<String>,
}

/// Diffs successive listings into [`EnumeratorEvent`]s.
pub struct Enumerator<S> {
    scanner: S,
    known: BTreeMap<String, Known>,
    degraded: bool,
}

impl<S: DeviceScanner> Enumerator<S> {
    #[must_use]
    pub fn new(scanner: S) -> Self {
        Self { scanner, known: BTreeMap::new(), degraded: false }
    }

    /// Run one listing and return what changed since the last one.
    ///
    /// Detaches are reported before attaches so a device that moved to a
    /// new path is seen leaving before it reappears.
    pub fn tick(&mut self) -> Vec<EnumeratorEvent> {
        let entries = match self.scanner.scan() {
            Ok(entries) => entries,
            Err(e) => {
                if self.degraded {
                    debug!(error = %e, "HID enumeration still failing");
                    return Vec::new();
                }
                warn!(error = %e, "HID enumeration failed");
                self.degraded = true;
                return vec![EnumeratorEvent::EnumerationDegraded(e)];
            }
        };

        let mut events = Vec::new();
        if self.degraded {
            info!("HID enumeration restored");
            self.degraded = false;
            events.push(EnumeratorEvent::EnumerationRestored);
        }

        let current: BTreeMap<String, Known> = entries
            .into_iter()
            .filter_map(|entry| {
                let model = registry::candidate(entry.vendor_id, entry.product_id, entry.interface_number)?;
                let id = DeviceId::new(entry.serial_number.as_deref(), &entry.path);
                Some((entry.path, Known { id, model, product: entry.product_string }))
            })
            .collect();

        for (path, known) in &self.known {
            if !current.contains_key(path) {
                info!(%path, id = %known.id, "Headset detached");
                events.push(EnumeratorEvent::Detached { path: path.clone(), id: known.id.clone() });
            }
        }
        for (path, known) in &current {
            if !self.known.contains_key(path) {
                info!(
                    %path,
                    id = %known.id,
                    model = %known.model,
                    product = known.product.as_deref().unwrap_or("unknown"),
                    "Headset attached"
                );
                events.push(EnumeratorEvent::Attached {
                    path: path.clone(),
                    id: known.id.clone(),
                    model: known.model,
                });
            }
        }

        self.known = current;
        events
    }

    /// Number of compatible interfaces seen by the last successful listing.
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.known.len()
    }
}

enum Control {
    ScanNow,
    Stop,
}

/// When the next periodic listing is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Schedule {
    next: Instant,
    interval: Duration,
}

impl Schedule {
    /// First listing due at `start`.
    fn new(start: Instant, interval: Duration) -> Self {
        Self { next: start, interval }
    }

    fn wait(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Handle a wake-up of the thread at `now`. Returns whether to list.
    ///
    /// Only the periodic tick moves the schedule; a missed tick is skipped
    /// rather than run back to back.
    fn on_wake(&mut self, woke: &Result<Control, std_mpsc::RecvTimeoutError>, now: Instant) -> bool {
        match woke {
            Ok(Control::ScanNow) => true,
            Ok(Control::Stop) | Err(std_mpsc::RecvTimeoutError::Disconnected) => false,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                self.next += self.interval;
                if self.next < now {
                    self.next = now + self.interval;
                }
                true
            }
        }
    }
}

/// Handle to a running enumerator thread.
pub struct EnumeratorHandle {
    control: std_mpsc::Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl EnumeratorHandle {
    /// Spawn the enumerator on its own thread.
    ///
    /// The first listing runs immediately, then every `interval`. Events
    /// are delivered on the returned channel.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<S: DeviceScanner>(
        enumerator: Enumerator<S>,
        interval: Duration,
    ) -> io::Result<(Self, mpsc::Receiver<EnumeratorEvent>)> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = std_mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("alphalink-enumerator".to_string())
            .spawn(move || run_enumerator(enumerator, interval, &control_rx, &event_tx))?;

        Ok((Self { control: control_tx, thread: Some(thread) }, event_rx))
    }

    /// Request an extra listing now. The periodic schedule is unaffected.
    pub fn scan_now(&self) {
        let _ = self.control.send(Control::ScanNow);
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Enumerator thread panicked");
        }
    }
}

impl Drop for EnumeratorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_enumerator<S: DeviceScanner>(
    mut enumerator: Enumerator<S>,
    interval: Duration,
    control: &std_mpsc::Receiver<Control>,
    events: &mpsc::Sender<EnumeratorEvent>,
) {
    debug!(?interval, "Enumerator thread started");
    let mut schedule = Schedule::new(Instant::now(), interval);

    loop {
        let woke = control.recv_timeout(schedule.wait(Instant::now()));
        if !schedule.on_wake(&woke, Instant::now()) {
            break;
        }

        for event in enumerator.tick() {
            if events.blocking_send(event).is_err() {
                debug!("Enumerator event receiver dropped");
                return;
            }
        }
    }

    debug!("Enumerator thread stopped");
}
