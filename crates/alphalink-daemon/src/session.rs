//! Device session driver.
//!
//! Each managed device gets one driver running on its own thread. The
//! driver owns the device handle, feeds I/O results into the core
//! [`SessionMachine`], carries out the effects it returns, and runs the
//! device's [`NotificationPolicy`]. Every deadline (retry, poll, timeout
//! backoff, debounce, command expiry, linger) is tracked explicitly and handled in
//! [`SessionDriver::on_timer`], which takes the current time as a parameter.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use alphalink_core::{
    CommandError, CompatibleModel, DeviceId, DeviceStatus, Effect, NotificationPolicy, NotificationSink,
    PendingCommand, PolicyConfig, SessionConfig, SessionEvent, SessionMachine, SessionState, TimeoutBackoff,
    TransportError,
};
use alphalink_hid::exchange::{self, Timeouts};
use alphalink_hid::{DeviceIo, Transport};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::DriverTiming;

/// Wait used when no deadline is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Where a command's outcome is reported.
pub type CommandReply = oneshot::Sender<Result<DeviceStatus, CommandError>>;

/// Requests from the manager to a session.
#[derive(Debug)]
pub enum SessionControl {
    /// The enumerator sees the device at `path`
    Attached { path: String },
    Detached,
    /// Manual scan; retries a disconnected session
    Scan,
    Command { command: PendingCommand, reply: Option<CommandReply> },
    Shutdown,
}

/// What a session reports back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    StateChanged { from: SessionState, to: SessionState },
    StatusChanged(DeviceStatus),
    /// A command was confirmed by the headset
    CommandApplied(PendingCommand),
    /// The session tore down and its thread is exiting
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub id: DeviceId,
    /// Distinguishes a respawned session from the one it replaced
    pub generation: u64,
    pub kind: UpdateKind,
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: DeviceId,
    pub generation: u64,
    pub model: &'static CompatibleModel,
    pub path: String,
    pub session: SessionConfig,
    pub policy: PolicyConfig,
    pub timing: DriverTiming,
}

struct QueuedCommand {
    command: PendingCommand,
    reply: Option<CommandReply>,
    deadline: Instant,
}

impl QueuedCommand {
    fn respond(self, result: Result<DeviceStatus, CommandError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

/// Drives one device session.
pub struct SessionDriver<T: Transport> {
    id: DeviceId,
    generation: u64,
    model: &'static CompatibleModel,
    path: String,
    transport: T,
    machine: SessionMachine,
    policy: NotificationPolicy,
    sink: Arc<dyn NotificationSink + Sync>,
    timing: DriverTiming,
    io: Option<T::Io>,
    next_open: Option<Instant>,
    next_poll: Option<Instant>,
    linger_until: Option<Instant>,
    backoff: TimeoutBackoff,
    commands: VecDeque<QueuedCommand>,
    outbox: Vec<SessionUpdate>,
    last_error: Option<String>,
    finished: bool,
}

impl<T: Transport> SessionDriver<T> {
    #[must_use]
    pub fn new(params: SessionParams, transport: T, sink: Arc<dyn NotificationSink + Sync>) -> Self {
        Self {
            policy: NotificationPolicy::new(params.id.clone(), params.policy),
            machine: SessionMachine::new(params.session),
            backoff: TimeoutBackoff::new(params.timing.tx_backoff_initial, params.timing.tx_backoff_max),
            id: params.id,
            generation: params.generation,
            model: params.model,
            path: params.path,
            transport,
            sink,
            timing: params.timing,
            io: None,
            next_open: None,
            next_poll: None,
            linger_until: None,
            commands: VecDeque::new(),
            outbox: Vec::new(),
            last_error: None,
            finished: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Whether the session has torn down for good.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Updates produced since the last call.
    pub fn take_updates(&mut self) -> Vec<SessionUpdate> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest pending deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.next_open,
            self.next_poll,
            self.linger_until,
            self.policy.next_deadline(),
            self.commands.iter().map(|c| c.deadline).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle_control(&mut self, control: SessionControl, now: Instant) {
        match control {
            SessionControl::Attached { path } => {
                if self.io.is_none() && path != self.path {
                    info!(device = %self.id, from = %self.path, to = %path, "Device moved to a new path");
                    self.path = path;
                }
                self.apply(SessionEvent::Attached, now);
            }
            SessionControl::Detached => self.apply(SessionEvent::Detached, now),
            SessionControl::Scan => self.apply(SessionEvent::ScanRequested, now),
            SessionControl::Command { command, reply } => self.enqueue(command, reply, now),
            SessionControl::Shutdown => self.teardown(now),
        }
    }

    /// Handle every deadline that has passed at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        if self.next_open.is_some_and(|t| t <= now) {
            self.next_open = None;
            self.open(now);
        }
        if self.next_poll.is_some_and(|t| t <= now) {
            self.next_poll = None;
            self.poll(now);
        }
        self.expire_commands(now);
        self.flush_notifications(now);
        if self.linger_until.is_some_and(|t| t <= now) {
            self.linger_until = None;
            info!(device = %self.id, "Device did not return, ending session");
            self.teardown(now);
        }
    }

    fn enqueue(&mut self, command: PendingCommand, reply: Option<CommandReply>, now: Instant) {
        let limit = self.timing.command_queue_limit;
        if self.commands.len() >= limit {
            warn!(device = %self.id, ?command, limit, "Command queue full, dropping command");
            if let Some(reply) = reply {
                let _ = reply.send(Err(CommandError::QueueFull { limit }));
            }
            return;
        }

        let queued = QueuedCommand { command, reply, deadline: now + self.timing.command_timeout };
        match self.machine.state() {
            SessionState::Idle | SessionState::Discovering | SessionState::Disconnected => {
                debug!(device = %self.id, ?command, "Rejecting command, device not connected");
                queued.respond(Err(CommandError::NoActiveDevice));
            }
            SessionState::Connecting | SessionState::Connected | SessionState::Degraded => {
                debug!(device = %self.id, ?command, "Queued command");
                self.commands.push_back(queued);
                if self.io.is_some() && self.machine.state().is_live() {
                    self.next_poll = Some(self.backoff.hold(now));
                }
            }
        }
    }

    fn open(&mut self, now: Instant) {
        match self.transport.open(&self.path) {
            Ok(io) => {
                info!(device = %self.id, path = %self.path, model = %self.model, "Device opened");
                self.io = Some(io);
                self.apply(SessionEvent::Opened, now);
            }
            Err(e) => {
                self.log_failure("Failed to open device", &e.to_string());
                if matches!(e, TransportError::PermissionDenied(_)) {
                    warn!(
                        device = %self.id,
                        "Grant access with a udev rule matching idVendor={:04x} idProduct={:04x}",
                        self.model.vendor_id,
                        self.model.product_id
                    );
                }
                self.apply(SessionEvent::OpenFailed(e), now);
            }
        }
    }

    fn poll(&mut self, now: Instant) {
        let Some(io) = self.io.as_mut() else {
            return;
        };
        let timeouts = Timeouts { read: self.timing.read_timeout, mic_query: self.timing.mic_query_timeout };

        let command = self.commands.pop_front();
        let result = match &command {
            Some(queued) => {
                debug!(device = %self.id, command = ?queued.command, "Applying command");
                exchange::send_command(io, self.model, &queued.command, timeouts)
            }
            None => exchange::poll_status(io, self.model, timeouts),
        };

        match result {
            Ok(status) => {
                if self.last_error.take().is_some() {
                    info!(device = %self.id, "Device responding again");
                }
                if self.backoff.clear() {
                    info!(device = %self.id, "Control channel recovered");
                }
                self.apply(SessionEvent::PollSucceeded(status.clone()), now);
                if let Some(queued) = command {
                    // Judge against the status with carried-over fields filled in
                    let confirmed = self.machine.last_status().cloned().unwrap_or(status);
                    self.finish_command(queued, &confirmed);
                }
                if !self.commands.is_empty() && self.io.is_some() {
                    self.next_poll = Some(now);
                }
            }
            Err(failure) => {
                // Keep the command for the next attempt; expiry bounds it
                if let Some(queued) = command {
                    self.commands.push_front(queued);
                }
                if failure.is_timeout() {
                    let pause = self.backoff.on_timeout(now);
                    warn!(device = %self.id, ?pause, "Control channel timed out, pausing polls");
                }
                self.log_failure("Status poll failed", &failure.to_string());
                self.apply(SessionEvent::PollFailed(failure), now);
            }
        }
    }

    fn finish_command(&mut self, queued: QueuedCommand, status: &DeviceStatus) {
        if queued.command.is_reflected_in(status) {
            info!(device = %self.id, command = ?queued.command, "Command applied");
            self.push(UpdateKind::CommandApplied(queued.command));
            queued.respond(Ok(status.clone()));
        } else {
            warn!(device = %self.id, command = ?queued.command, "Command not acknowledged by headset");
            queued.respond(Err(CommandError::Unacknowledged));
        }
    }

    fn expire_commands(&mut self, now: Instant) {
        while self.commands.front().is_some_and(|c| c.deadline <= now) {
            if let Some(queued) = self.commands.pop_front() {
                warn!(device = %self.id, command = ?queued.command, "Command timed out");
                queued.respond(Err(CommandError::Unacknowledged));
            }
        }
    }

    fn fail_commands(&mut self) {
        for queued in self.commands.drain(..) {
            queued.respond(Err(CommandError::Unacknowledged));
        }
    }

    fn apply(&mut self, event: SessionEvent, now: Instant) {
        for effect in self.machine.handle(event) {
            match effect {
                Effect::Open => self.open(now),
                Effect::Close => self.close(),
                Effect::RetryAfter(delay) => {
                    debug!(device = %self.id, ?delay, "Retrying open after backoff");
                    self.next_poll = None;
                    self.next_open = Some(now + delay);
                }
                Effect::PollAfter(delay) => self.next_poll = Some(self.backoff.hold(now + delay)),
                Effect::StateChanged { from, to } => self.state_changed(from, to, now),
                Effect::StatusChanged(status) => self.status_changed(status, now),
            }
        }
        self.policy.observe_presence(self.machine.is_online(), now);
        self.flush_notifications(now);
    }

    fn state_changed(&mut self, from: SessionState, to: SessionState, now: Instant) {
        info!(device = %self.id, %from, %to, "Session state changed");
        self.push(UpdateKind::StateChanged { from, to });

        match to {
            SessionState::Disconnected => {
                self.fail_commands();
                self.next_open = None;
                self.next_poll = None;
                self.linger_until = Some(now + self.timing.linger);
            }
            SessionState::Idle => {
                self.fail_commands();
                self.next_open = None;
                self.next_poll = None;
                self.linger_until = None;
            }
            _ => self.linger_until = None,
        }
    }

    fn status_changed(&mut self, status: DeviceStatus, now: Instant) {
        debug!(
            device = %self.id,
            connected = status.connected,
            battery = ?status.battery_percent,
            mic_monitor = status.mic_monitor_enabled,
            voice_prompt = status.voice_prompt_enabled,
            sleep_timer = ?status.sleep_timer,
            "Status changed"
        );
        if status.connected
            && let Some(percent) = status.battery_percent
            && let Some(event) = self.policy.observe_battery(percent, now)
        {
            self.sink.deliver(event);
        }
        self.push(UpdateKind::StatusChanged(status));
    }

    fn flush_notifications(&mut self, now: Instant) {
        for event in self.policy.poll(now) {
            self.sink.deliver(event);
        }
    }

    fn close(&mut self) {
        self.backoff.clear();
        if let Some(io) = self.io.take() {
            debug!(device = %self.id, path = io.path(), "Closing device");
        }
    }

    fn teardown(&mut self, now: Instant) {
        self.apply(SessionEvent::Teardown, now);
        self.close();
        self.fail_commands();
        self.flush_notifications(now);
        self.policy.reset();
        if !self.finished {
            self.finished = true;
            self.push(UpdateKind::Finished);
        }
    }

    /// Log a failure once per distinct message.
    fn log_failure(&mut self, what: &str, message: &str) {
        if self.last_error.as_deref() == Some(message) {
            debug!(device = %self.id, error = %message, "{what}");
        } else {
            warn!(device = %self.id, path = %self.path, error = %message, "{what}");
            self.last_error = Some(message.to_string());
        }
    }

    fn push(&mut self, kind: UpdateKind) {
        self.outbox.push(SessionUpdate { id: self.id.clone(), generation: self.generation, kind });
    }
}

/// Handle to a session thread.
pub struct SessionHandle {
    control: std_mpsc::Sender<SessionControl>,
    thread: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Run `driver` on a dedicated thread, reporting to `updates`.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<T: Transport + 'static>(
        driver: SessionDriver<T>,
        updates: mpsc::Sender<SessionUpdate>,
    ) -> io::Result<Self> {
        let (control_tx, control_rx) = std_mpsc::channel();
        let name = format!("alphalink-session-{}", driver.generation);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_session(driver, &control_rx, &updates))?;
        Ok(Self { control: control_tx, thread: Some(thread) })
    }

    /// Send a request to the session.
    ///
    /// # Errors
    /// Gives the request back if the session thread has exited.
    pub fn send(&self, control: SessionControl) -> Result<(), SessionControl> {
        self.control.send(control).map_err(|e| e.0)
    }

    /// Wait for the thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Session thread panicked");
        }
    }
}

fn run_session<T: Transport>(
    mut driver: SessionDriver<T>,
    control: &std_mpsc::Receiver<SessionControl>,
    updates: &mpsc::Sender<SessionUpdate>,
) {
    debug!(device = %driver.id, "Session thread started");

    loop {
        driver.on_timer(Instant::now());

        for update in driver.take_updates() {
            if updates.blocking_send(update).is_err() {
                debug!(device = %driver.id, "Session update receiver dropped");
                return;
            }
        }
        if driver.is_finished() {
            break;
        }

        let wait = driver
            .next_deadline()
            .map_or(IDLE_WAIT, |deadline| deadline.saturating_duration_since(Instant::now()));
        match control.recv_timeout(wait) {
            Ok(request) => driver.handle_control(request, Instant::now()),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                driver.handle_control(SessionControl::Shutdown, Instant::now());
            }
        }
    }

    debug!(device = %driver.id, "Session thread stopped");
}

#[cfg(test)]
mod tests {
    use alphalink_core::registry::lookup;
    use alphalink_core::session::{PollIntervals, RetryPolicy};
    use alphalink_core::{NotificationEvent, NotificationKind, SleepTimer};
    use alphalink_hid::fake::{FakeHeadset, HeadsetState};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct CollectSink(Arc<Mutex<Vec<NotificationEvent>>>);

    impl NotificationSink for CollectSink {
        fn deliver(&self, event: NotificationEvent) {
            self.0.lock().push(event);
        }
    }

    impl CollectSink {
        fn kinds(&self) -> Vec<NotificationKind> {
            self.0.lock().iter().map(|e| e.kind).collect()
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn params() -> SessionParams {
        SessionParams {
            id: DeviceId::new(Some("ABC"), "/dev/hidraw3"),
            generation: 1,
            model: lookup(0x03f0, 0x098d).unwrap(),
            path: "/dev/hidraw3".to_string(),
            session: SessionConfig {
                retry: RetryPolicy {
                    connect_attempts: 3,
                    degraded_attempts: 2,
                    backoff_initial: ms(100),
                    backoff_max: ms(400),
                    transient_failure_limit: 2,
                },
                intervals: PollIntervals { online: ms(30_000), offline: ms(5000), degraded: ms(1000) },
            },
            policy: PolicyConfig { debounce: ms(3000), ..PolicyConfig::default() },
            timing: DriverTiming {
                read_timeout: ms(10),
                mic_query_timeout: ms(10),
                command_timeout: ms(5000),
                tx_backoff_initial: ms(4000),
                tx_backoff_max: ms(60_000),
                command_queue_limit: 64,
                linger: ms(60_000),
            },
        }
    }

    fn driver(headset: &FakeHeadset) -> (SessionDriver<FakeHeadset>, CollectSink) {
        let sink = CollectSink::default();
        let driver = SessionDriver::new(params(), headset.clone(), Arc::new(sink.clone()));
        (driver, sink)
    }

    /// Attach and run the first poll.
    fn connect(driver: &mut SessionDriver<FakeHeadset>, t0: Instant) {
        driver.handle_control(SessionControl::Attached { path: "/dev/hidraw3".to_string() }, t0);
        assert_eq!(driver.next_deadline(), Some(t0));
        driver.on_timer(t0);
        assert_eq!(driver.state(), SessionState::Connected);
    }

    fn transitions(updates: &[SessionUpdate]) -> Vec<(SessionState, SessionState)> {
        updates
            .iter()
            .filter_map(|u| match u.kind {
                UpdateKind::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_attach_connects_and_announces() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, sink) = driver(&headset);
        let t0 = Instant::now();

        connect(&mut driver, t0);
        let updates = driver.take_updates();
        assert_eq!(
            transitions(&updates),
            vec![
                (SessionState::Idle, SessionState::Connecting),
                (SessionState::Connecting, SessionState::Connected)
            ]
        );
        assert!(updates.iter().any(|u| matches!(&u.kind, UpdateKind::StatusChanged(s) if s.battery_percent == Some(80))));

        // Connected is announced once the debounce window has passed
        assert!(sink.kinds().is_empty());
        driver.on_timer(t0 + ms(3000));
        assert_eq!(sink.kinds(), vec![NotificationKind::Connected]);
        assert_eq!(driver.next_deadline(), Some(t0 + ms(30_000)));
    }

    #[test]
    fn test_open_failures_exhaust_then_linger_teardown() {
        let headset = FakeHeadset::new(HeadsetState::default());
        headset.fail_opens(TransportError::Busy("/dev/hidraw3".to_string()), 10);
        let (mut driver, _sink) = driver(&headset);
        let t0 = Instant::now();

        driver.handle_control(SessionControl::Attached { path: "/dev/hidraw3".to_string() }, t0);
        assert_eq!(driver.next_deadline(), Some(t0 + ms(100)));
        driver.on_timer(t0 + ms(100));
        assert_eq!(driver.next_deadline(), Some(t0 + ms(300)));
        driver.on_timer(t0 + ms(300));

        assert_eq!(driver.state(), SessionState::Disconnected);
        assert_eq!(headset.open_count(), 3);
        let updates = driver.take_updates();
        assert_eq!(
            transitions(&updates)
                .into_iter()
                .filter(|(_, to)| *to == SessionState::Disconnected)
                .count(),
            1
        );

        assert_eq!(driver.next_deadline(), Some(t0 + ms(60_300)));
        driver.on_timer(t0 + ms(60_300));
        assert!(driver.is_finished());
        assert_eq!(driver.state(), SessionState::Idle);
        assert!(driver.take_updates().iter().any(|u| u.kind == UpdateKind::Finished));
    }

    #[test]
    fn test_reattach_cancels_linger() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, _sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);

        driver.handle_control(SessionControl::Detached, t0 + ms(10));
        assert_eq!(driver.state(), SessionState::Disconnected);
        assert!(!driver.is_open());

        driver.handle_control(SessionControl::Attached { path: "/dev/hidraw5".to_string() }, t0 + ms(20));
        driver.on_timer(t0 + ms(20));
        assert_eq!(driver.state(), SessionState::Connected);
        driver.on_timer(t0 + ms(61_000));
        assert!(!driver.is_finished());
    }

    #[test]
    fn test_timeout_degrades_and_recovers() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);

        headset.fail_reads(1);
        driver.on_timer(t0 + ms(30_000));
        assert_eq!(driver.state(), SessionState::Degraded);
        // The timeout pause outlasts the degraded interval
        assert_eq!(driver.next_deadline(), Some(t0 + ms(34_000)));

        // A command sent during the pause waits for it
        let (tx, mut rx) = oneshot::channel();
        let command = PendingCommand::ToggleVoicePrompt(false);
        driver.handle_control(SessionControl::Command { command, reply: Some(tx) }, t0 + ms(30_100));
        assert_eq!(driver.next_deadline(), Some(t0 + ms(34_000)));

        driver.on_timer(t0 + ms(34_000));
        assert_eq!(driver.state(), SessionState::Connected);
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(driver.next_deadline(), Some(t0 + ms(64_000)));
        // Degraded never flipped presence
        assert_eq!(sink.kinds(), vec![NotificationKind::Connected]);
    }

    #[test]
    fn test_repeated_timeouts_double_the_pause() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let mut patient = params();
        patient.session.retry.degraded_attempts = 5;
        let mut driver = SessionDriver::new(patient, headset.clone(), Arc::new(CollectSink::default()));
        let t0 = Instant::now();
        connect(&mut driver, t0);

        headset.fail_reads(3);
        driver.on_timer(t0 + ms(30_000));
        assert_eq!(driver.next_deadline(), Some(t0 + ms(34_000)));
        driver.on_timer(t0 + ms(34_000));
        assert_eq!(driver.next_deadline(), Some(t0 + ms(42_000)));
        driver.on_timer(t0 + ms(42_000));
        assert_eq!(driver.next_deadline(), Some(t0 + ms(58_000)));
        assert_eq!(driver.state(), SessionState::Degraded);

        // Recovery clears the pause; the next timeout starts over
        driver.on_timer(t0 + ms(58_000));
        assert_eq!(driver.state(), SessionState::Connected);
        assert_eq!(driver.next_deadline(), Some(t0 + ms(88_000)));
        headset.fail_reads(1);
        driver.on_timer(t0 + ms(88_000));
        assert_eq!(driver.next_deadline(), Some(t0 + ms(92_000)));
    }

    #[test]
    fn test_unplug_disconnects_and_notifies() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);
        driver.on_timer(t0 + ms(3000));

        headset.unplug();
        driver.on_timer(t0 + ms(30_000));
        assert_eq!(driver.state(), SessionState::Disconnected);
        assert!(!driver.is_open());

        driver.on_timer(t0 + ms(33_000));
        assert_eq!(sink.kinds(), vec![NotificationKind::Connected, NotificationKind::Disconnected]);
    }

    #[test]
    fn test_headset_power_off_is_presence_offline() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);
        driver.on_timer(t0 + ms(3000));

        headset.update(|s| s.linked = false);
        driver.on_timer(t0 + ms(30_000));
        assert_eq!(driver.state(), SessionState::Connected);
        assert_eq!(driver.next_deadline(), Some(t0 + ms(33_000)));

        driver.on_timer(t0 + ms(33_000));
        assert_eq!(sink.kinds(), vec![NotificationKind::Connected, NotificationKind::Disconnected]);
    }

    #[test]
    fn test_command_applied() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, _sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);
        driver.take_updates();

        let (tx, mut rx) = oneshot::channel();
        let command = PendingCommand::SetSleepTimer(SleepTimer::Minutes30);
        driver.handle_control(SessionControl::Command { command, reply: Some(tx) }, t0 + ms(100));
        assert_eq!(driver.next_deadline(), Some(t0 + ms(100)));
        driver.on_timer(t0 + ms(100));

        let status = rx.try_recv().unwrap().unwrap();
        assert_eq!(status.sleep_timer, Some(SleepTimer::Minutes30));
        assert_eq!(headset.state().sleep_timer, SleepTimer::Minutes30);
        assert!(driver.take_updates().iter().any(|u| u.kind == UpdateKind::CommandApplied(command)));
    }

    #[test]
    fn test_ignored_command_is_unacknowledged() {
        let headset = FakeHeadset::new(HeadsetState::default());
        headset.ignore_commands(true);
        let (mut driver, _sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);

        let (tx, mut rx) = oneshot::channel();
        let command = PendingCommand::ToggleVoicePrompt(false);
        driver.handle_control(SessionControl::Command { command, reply: Some(tx) }, t0);
        driver.on_timer(t0);

        assert_eq!(rx.try_recv().unwrap(), Err(CommandError::Unacknowledged));
        assert_eq!(driver.state(), SessionState::Connected);
    }

    #[test]
    fn test_full_queue_refuses_commands() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, _sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);

        let mut replies = Vec::new();
        for _ in 0..64 {
            let (tx, rx) = oneshot::channel();
            driver.handle_control(
                SessionControl::Command { command: PendingCommand::ToggleVoicePrompt(false), reply: Some(tx) },
                t0 + ms(10),
            );
            replies.push(rx);
        }
        assert!(replies.iter_mut().all(|rx| rx.try_recv().is_err()));

        let (tx, mut rx) = oneshot::channel();
        driver.handle_control(
            SessionControl::Command { command: PendingCommand::ToggleMicMonitor(true), reply: Some(tx) },
            t0 + ms(10),
        );
        assert_eq!(rx.try_recv().unwrap(), Err(CommandError::QueueFull { limit: 64 }));

        // Draining one slot makes room again
        driver.on_timer(t0 + ms(10));
        assert!(replies[0].try_recv().unwrap().is_ok());
        let (tx, mut rx) = oneshot::channel();
        driver.handle_control(
            SessionControl::Command { command: PendingCommand::ToggleMicMonitor(true), reply: Some(tx) },
            t0 + ms(20),
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_mic_command_confirmed_when_polls_skip_mic_state() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let mut legacy = params();
        legacy.model = lookup(0x0951, 0x1743).unwrap();
        let mut driver = SessionDriver::new(legacy, headset.clone(), Arc::new(CollectSink::default()));
        let t0 = Instant::now();
        connect(&mut driver, t0);

        let (tx, mut rx) = oneshot::channel();
        driver.handle_control(
            SessionControl::Command { command: PendingCommand::ToggleMicMonitor(true), reply: Some(tx) },
            t0 + ms(100),
        );
        driver.on_timer(t0 + ms(100));
        assert!(rx.try_recv().unwrap().unwrap().mic_monitor_enabled);
        driver.take_updates();

        // A plain poll cannot see the mic state; it stays as the echo reported
        headset.update(|s| s.battery = 70);
        driver.on_timer(t0 + ms(30_100));
        let statuses: Vec<_> = driver
            .take_updates()
            .into_iter()
            .filter_map(|u| match u.kind {
                UpdateKind::StatusChanged(status) => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].battery_percent, Some(70));
        assert!(statuses[0].mic_monitor_enabled);
    }

    #[test]
    fn test_command_rejected_when_disconnected() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, _sink) = driver(&headset);
        let (tx, mut rx) = oneshot::channel();

        driver.handle_control(
            SessionControl::Command { command: PendingCommand::ToggleMicMonitor(true), reply: Some(tx) },
            Instant::now(),
        );
        assert_eq!(rx.try_recv().unwrap(), Err(CommandError::NoActiveDevice));
    }

    #[test]
    fn test_queued_command_expires() {
        let headset = FakeHeadset::new(HeadsetState::default());
        headset.fail_opens(TransportError::Timeout, 1);
        let mut slow = params();
        slow.session.retry.backoff_initial = ms(10_000);
        slow.session.retry.backoff_max = ms(10_000);
        let mut driver = SessionDriver::new(slow, headset.clone(), Arc::new(CollectSink::default()));
        let t0 = Instant::now();

        driver.handle_control(SessionControl::Attached { path: "/dev/hidraw3".to_string() }, t0);
        assert_eq!(driver.state(), SessionState::Connecting);

        let (tx, mut rx) = oneshot::channel();
        driver.handle_control(
            SessionControl::Command { command: PendingCommand::ToggleMicMonitor(true), reply: Some(tx) },
            t0,
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(driver.next_deadline(), Some(t0 + ms(5000)));

        driver.on_timer(t0 + ms(5000));
        assert_eq!(rx.try_recv().unwrap(), Err(CommandError::Unacknowledged));
        assert_eq!(driver.state(), SessionState::Connecting);
    }

    #[test]
    fn test_pending_commands_fail_on_disconnect() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, _sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);

        let (tx, mut rx) = oneshot::channel();
        driver.handle_control(
            SessionControl::Command { command: PendingCommand::ToggleMicMonitor(true), reply: Some(tx) },
            t0,
        );
        driver.handle_control(SessionControl::Detached, t0);
        assert_eq!(rx.try_recv().unwrap(), Err(CommandError::Unacknowledged));
    }

    #[test]
    fn test_low_battery_notifies_on_status_change() {
        let headset = FakeHeadset::new(HeadsetState { battery: 18, ..HeadsetState::default() });
        let (mut driver, sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);

        // Held briefly in case further alerts follow
        assert!(sink.kinds().is_empty());
        assert_eq!(driver.next_deadline(), Some(t0 + ms(1800)));
        driver.on_timer(t0 + ms(1800));
        assert_eq!(sink.kinds(), vec![NotificationKind::LowBattery]);

        headset.update(|s| s.battery = 4);
        driver.on_timer(t0 + ms(30_000));
        let events = sink.0.lock();
        assert!(
            events
                .iter()
                .any(|e| e.kind == NotificationKind::CriticalBattery && e.battery_percent == Some(4))
        );
    }

    #[test]
    fn test_replugged_headset_reconnects() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);
        driver.on_timer(t0 + ms(3000));

        headset.unplug();
        driver.on_timer(t0 + ms(30_000));
        assert_eq!(driver.state(), SessionState::Disconnected);

        headset.replug();
        driver.handle_control(SessionControl::Attached { path: "/dev/hidraw3".to_string() }, t0 + ms(31_000));
        driver.on_timer(t0 + ms(31_000));
        assert_eq!(driver.state(), SessionState::Connected);
        assert_eq!(headset.open_count(), 2);

        // Back before the debounce window closed, so nothing to announce
        driver.on_timer(t0 + ms(40_000));
        assert_eq!(sink.kinds(), vec![NotificationKind::Connected]);
    }

    #[test]
    fn test_shutdown_closes_handle() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (mut driver, _sink) = driver(&headset);
        let t0 = Instant::now();
        connect(&mut driver, t0);

        driver.handle_control(SessionControl::Shutdown, t0);
        assert!(!driver.is_open());
        assert!(driver.is_finished());
        assert_eq!(driver.state(), SessionState::Idle);
        assert!(driver.next_deadline().is_none());
    }

    #[tokio::test]
    async fn test_thread_reports_updates() {
        let headset = FakeHeadset::new(HeadsetState::default());
        let (driver, _sink) = driver(&headset);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = SessionHandle::spawn(driver, tx).unwrap();

        handle.send(SessionControl::Attached { path: "/dev/hidraw3".to_string() }).unwrap();
        let mut connected = false;
        while let Ok(Some(update)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            if update.kind == (UpdateKind::StateChanged { from: SessionState::Connecting, to: SessionState::Connected }) {
                connected = true;
                break;
            }
        }
        assert!(connected);

        handle.send(SessionControl::Shutdown).unwrap();
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();
    }
}
