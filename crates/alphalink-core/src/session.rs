//! Device session state machine.
//!
//! The machine is a pure function of `(state, event) -> (state, effects)`.
//! It never touches a handle or a clock itself; the driver interprets the
//! returned [`Effect`]s, performs the I/O, and feeds results back in as
//! [`SessionEvent`]s.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::PollFailure;
use crate::state::{SessionEvent, SessionState};
use crate::status::DeviceStatus;

/// Bounded retry and backoff limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive open/poll failures tolerated while connecting (N)
    pub connect_attempts: u32,
    /// Consecutive poll failures tolerated while degraded (M)
    pub degraded_attempts: u32,
    /// Consecutive hard I/O failures (anything but a timeout) tolerated
    /// while live
    pub transient_failure_limit: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before the retry that follows the `failures`-th failure.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff_initial.saturating_mul(1 << exponent).min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            degraded_attempts: 3,
            transient_failure_limit: 2,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Poll cadence per situation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollIntervals {
    /// Headset linked and answering
    pub online: Duration,
    /// Dongle answering but headset off or out of range
    pub offline: Duration,
    /// Recovering from failed polls; faster than the others
    pub degraded: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            online: Duration::from_secs(30),
            offline: Duration::from_secs(5),
            degraded: Duration::from_secs(2),
        }
    }
}

/// Session timing configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub retry: RetryPolicy,
    pub intervals: PollIntervals,
}

/// Pause applied to all traffic while the headset keeps timing out.
///
/// Each timeout doubles the pause, starting at `initial` and capped at
/// `max`; any answer clears it.
#[derive(Debug, Clone)]
pub struct TimeoutBackoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
    until: Option<Instant>,
}

impl TimeoutBackoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: None, until: None }
    }

    /// Record a timeout at `now` and return the new pause.
    pub fn on_timeout(&mut self, now: Instant) -> Duration {
        let pause = self.current.map_or(self.initial, |d| d.saturating_mul(2).min(self.max));
        self.current = Some(pause);
        self.until = Some(now + pause);
        pause
    }

    /// Forget past timeouts. Returns whether a pause was in effect.
    pub fn clear(&mut self) -> bool {
        self.until = None;
        self.current.take().is_some()
    }

    /// End of the current pause, if one is still running at `now`.
    #[must_use]
    pub fn paused_until(&self, now: Instant) -> Option<Instant> {
        self.until.filter(|until| *until > now)
    }

    /// Push `at` past the end of the current pause.
    #[must_use]
    pub fn hold(&self, at: Instant) -> Instant {
        self.until.map_or(at, |until| at.max(until))
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open the device handle now
    Open,
    /// Close the device handle
    Close,
    /// Reopen after a backoff delay
    RetryAfter(Duration),
    /// Poll status after a delay
    PollAfter(Duration),
    /// The session moved to a new state
    StateChanged { from: SessionState, to: SessionState },
    /// A poll produced a status different from the previous one
    StatusChanged(DeviceStatus),
}

/// State machine for one device session.
#[derive(Debug)]
pub struct SessionMachine {
    config: SessionConfig,
    state: SessionState,
    failures: u32,
    hard_failures: u32,
    handle_open: bool,
    last_status: Option<DeviceStatus>,
}

impl SessionMachine {
    /// Create a machine in [`SessionState::Idle`].
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            failures: 0,
            hard_failures: 0,
            handle_open: false,
            last_status: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Latest status forwarded, with carried-over fields filled in.
    #[must_use]
    pub fn last_status(&self) -> Option<&DeviceStatus> {
        self.last_status.as_ref()
    }

    /// Whether the headset is reachable and linked, from the user's view.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state.is_live() && self.last_status.as_ref().is_some_and(|s| s.connected)
    }

    /// Apply an event and return the effects to carry out, in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        match (self.state, event) {
            (_, SessionEvent::Teardown) => {
                if self.state != SessionState::Idle {
                    self.close(&mut effects);
                    self.last_status = None;
                    self.failures = 0;
                    self.hard_failures = 0;
                    self.enter(SessionState::Idle, &mut effects);
                }
            }

            (
                SessionState::Idle | SessionState::Discovering | SessionState::Disconnected,
                SessionEvent::Attached | SessionEvent::ScanRequested,
            ) => {
                self.failures = 0;
                self.enter(SessionState::Connecting, &mut effects);
                effects.push(Effect::Open);
            }

            (SessionState::Connecting, SessionEvent::Opened) => {
                self.handle_open = true;
                effects.push(Effect::PollAfter(Duration::ZERO));
            }

            (SessionState::Connecting, SessionEvent::OpenFailed(e)) => {
                if e.implies_detach() {
                    self.disconnect(&mut effects);
                } else {
                    self.connect_failed(&mut effects);
                }
            }

            (
                SessionState::Connecting | SessionState::Connected | SessionState::Degraded,
                SessionEvent::PollSucceeded(status),
            ) => {
                self.failures = 0;
                self.hard_failures = 0;
                let status = self.carry_forward(status);
                self.enter(SessionState::Connected, &mut effects);
                let interval = if status.connected {
                    self.config.intervals.online
                } else {
                    self.config.intervals.offline
                };
                if self.last_status.as_ref() != Some(&status) {
                    self.last_status = Some(status.clone());
                    effects.push(Effect::StatusChanged(status));
                }
                effects.push(Effect::PollAfter(interval));
            }

            (SessionState::Connecting, SessionEvent::PollFailed(f)) => {
                if f.implies_detach() {
                    self.disconnect(&mut effects);
                } else {
                    self.connect_failed(&mut effects);
                }
            }

            (SessionState::Connected, SessionEvent::PollFailed(f)) => {
                self.count_hard_failure(&f);
                if f.implies_detach() || self.hard_failures >= self.config.retry.transient_failure_limit {
                    self.disconnect(&mut effects);
                } else {
                    self.failures = 0;
                    self.enter(SessionState::Degraded, &mut effects);
                    effects.push(Effect::PollAfter(self.config.intervals.degraded));
                }
            }

            (SessionState::Degraded, SessionEvent::PollFailed(f)) => {
                self.failures += 1;
                self.count_hard_failure(&f);
                if f.implies_detach()
                    || self.failures >= self.config.retry.degraded_attempts
                    || self.hard_failures >= self.config.retry.transient_failure_limit
                {
                    self.disconnect(&mut effects);
                } else {
                    effects.push(Effect::PollAfter(self.config.intervals.degraded));
                }
            }

            (
                SessionState::Connecting | SessionState::Connected | SessionState::Degraded,
                SessionEvent::Detached,
            ) => self.disconnect(&mut effects),

            (state, event) => {
                debug!(%state, ?event, "Event ignored in current state");
            }
        }

        effects
    }

    /// Timeouts reset the count; decode failures leave it alone.
    fn count_hard_failure(&mut self, failure: &PollFailure) {
        if failure.is_hard_io() {
            self.hard_failures += 1;
        } else if failure.is_timeout() {
            self.hard_failures = 0;
        }
    }

    /// Keep the last reported mic state while the headset stays linked and
    /// a poll did not ask for it.
    fn carry_forward(&self, mut status: DeviceStatus) -> DeviceStatus {
        if status.connected
            && !status.mic_monitor_known
            && let Some(last) = self.last_status.as_ref().filter(|s| s.connected && s.mic_monitor_known)
        {
            status.mic_monitor_enabled = last.mic_monitor_enabled;
            status.mic_monitor_known = true;
        }
        status
    }

    fn enter(&mut self, to: SessionState, effects: &mut Vec<Effect>) {
        let from = self.state;
        if from != to {
            self.state = to;
            effects.push(Effect::StateChanged { from, to });
        }
    }

    fn close(&mut self, effects: &mut Vec<Effect>) {
        if self.handle_open {
            self.handle_open = false;
            effects.push(Effect::Close);
        }
    }

    fn connect_failed(&mut self, effects: &mut Vec<Effect>) {
        self.failures += 1;
        self.close(effects);
        if self.failures >= self.config.retry.connect_attempts {
            self.disconnect(effects);
        } else {
            effects.push(Effect::RetryAfter(self.config.retry.backoff(self.failures)));
        }
    }

    fn disconnect(&mut self, effects: &mut Vec<Effect>) {
        self.close(effects);
        self.failures = 0;
        self.hard_failures = 0;
        self.last_status = None;
        self.enter(SessionState::Disconnected, effects);
    }
}

/// Convenience for drivers that only have a poll failure.
impl From<PollFailure> for SessionEvent {
    fn from(failure: PollFailure) -> Self {
        Self::PollFailed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodeError;
    use crate::error::TransportError;

    fn online(battery: u8) -> DeviceStatus {
        DeviceStatus { connected: true, battery_percent: Some(battery), ..DeviceStatus::default() }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            retry: RetryPolicy {
                connect_attempts: 3,
                degraded_attempts: 2,
                transient_failure_limit: 2,
                backoff_initial: Duration::from_millis(100),
                backoff_max: Duration::from_millis(300),
            },
            intervals: PollIntervals {
                online: Duration::from_secs(30),
                offline: Duration::from_secs(5),
                degraded: Duration::from_secs(1),
            },
        }
    }

    fn connected_machine() -> SessionMachine {
        let mut m = SessionMachine::new(config());
        m.handle(SessionEvent::Attached);
        m.handle(SessionEvent::Opened);
        m.handle(SessionEvent::PollSucceeded(online(80)));
        assert_eq!(m.state(), SessionState::Connected);
        m
    }

    fn transitions(effects: &[Effect]) -> Vec<(SessionState, SessionState)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::StateChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    fn timeout() -> SessionEvent {
        SessionEvent::PollFailed(PollFailure::Transport(TransportError::Timeout))
    }

    fn io_error() -> SessionEvent {
        SessionEvent::PollFailed(PollFailure::Transport(TransportError::IoError("EPROTO".to_string())))
    }

    fn forwarded(effects: &[Effect]) -> Vec<DeviceStatus> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::StatusChanged(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = config().retry;
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(300));
        assert_eq!(retry.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_connect_happy_path() {
        let mut m = SessionMachine::new(config());
        assert_eq!(
            m.handle(SessionEvent::Attached),
            vec![
                Effect::StateChanged { from: SessionState::Idle, to: SessionState::Connecting },
                Effect::Open
            ]
        );
        assert_eq!(m.handle(SessionEvent::Opened), vec![Effect::PollAfter(Duration::ZERO)]);

        let effects = m.handle(SessionEvent::PollSucceeded(online(80)));
        assert_eq!(
            effects,
            vec![
                Effect::StateChanged { from: SessionState::Connecting, to: SessionState::Connected },
                Effect::StatusChanged(online(80)),
                Effect::PollAfter(Duration::from_secs(30)),
            ]
        );
        assert!(m.is_online());
    }

    #[test]
    fn test_retry_exhaustion_transitions_once() {
        let mut m = SessionMachine::new(config());
        m.handle(SessionEvent::Attached);

        let mut all = Vec::new();
        for _ in 0..3 {
            all.extend(m.handle(SessionEvent::OpenFailed(TransportError::Timeout)));
        }
        // Late results after exhaustion must not produce another transition
        all.extend(m.handle(SessionEvent::OpenFailed(TransportError::Timeout)));
        all.extend(m.handle(timeout()));

        let to_disconnected: Vec<_> =
            transitions(&all).into_iter().filter(|(_, to)| *to == SessionState::Disconnected).collect();
        assert_eq!(to_disconnected, vec![(SessionState::Connecting, SessionState::Disconnected)]);
        assert_eq!(m.state(), SessionState::Disconnected);

        let retries: Vec<_> = all.iter().filter(|e| matches!(e, Effect::RetryAfter(_))).collect();
        assert_eq!(retries, vec![&Effect::RetryAfter(Duration::from_millis(100)), &Effect::RetryAfter(Duration::from_millis(200))]);
    }

    #[test]
    fn test_poll_failures_while_connecting_close_and_retry() {
        let mut m = SessionMachine::new(config());
        m.handle(SessionEvent::Attached);
        m.handle(SessionEvent::Opened);

        let effects = m.handle(SessionEvent::PollFailed(PollFailure::Decode(DecodeError::Incomplete)));
        assert_eq!(effects, vec![Effect::Close, Effect::RetryAfter(Duration::from_millis(100))]);
        assert_eq!(m.state(), SessionState::Connecting);
    }

    #[test]
    fn test_single_timeout_degrades_then_recovers() {
        let mut m = connected_machine();

        let effects = m.handle(timeout());
        assert_eq!(
            effects,
            vec![
                Effect::StateChanged { from: SessionState::Connected, to: SessionState::Degraded },
                Effect::PollAfter(Duration::from_secs(1)),
            ]
        );
        assert!(m.is_online());

        // Same status as before: no StatusChanged, back to Connected
        let effects = m.handle(SessionEvent::PollSucceeded(online(80)));
        assert_eq!(
            effects,
            vec![
                Effect::StateChanged { from: SessionState::Degraded, to: SessionState::Connected },
                Effect::PollAfter(Duration::from_secs(30)),
            ]
        );
    }

    #[test]
    fn test_degraded_exhaustion_disconnects() {
        let mut m = connected_machine();
        m.handle(timeout());
        assert!(transitions(&m.handle(timeout())).is_empty());
        let effects = m.handle(timeout());
        assert_eq!(
            effects,
            vec![
                Effect::Close,
                Effect::StateChanged { from: SessionState::Degraded, to: SessionState::Disconnected },
            ]
        );
        assert!(!m.is_online());
    }

    #[test]
    fn test_detach_implied_by_transport_disconnects_immediately() {
        let mut m = connected_machine();
        let effects =
            m.handle(SessionEvent::PollFailed(PollFailure::Transport(TransportError::Disconnected)));
        assert_eq!(transitions(&effects), vec![(SessionState::Connected, SessionState::Disconnected)]);
    }

    #[test]
    fn test_detached_event_from_degraded() {
        let mut m = connected_machine();
        m.handle(timeout());
        let effects = m.handle(SessionEvent::Detached);
        assert_eq!(transitions(&effects), vec![(SessionState::Degraded, SessionState::Disconnected)]);
    }

    #[test]
    fn test_attached_while_connected_is_noop() {
        let mut m = connected_machine();
        assert!(m.handle(SessionEvent::Attached).is_empty());
        assert!(m.handle(SessionEvent::ScanRequested).is_empty());
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn test_reattach_after_disconnect_reconnects() {
        let mut m = connected_machine();
        m.handle(SessionEvent::Detached);
        let effects = m.handle(SessionEvent::Attached);
        assert_eq!(
            effects,
            vec![
                Effect::StateChanged { from: SessionState::Disconnected, to: SessionState::Connecting },
                Effect::Open
            ]
        );
        m.handle(SessionEvent::Opened);
        // Status is republished after a reconnect even when unchanged
        let effects = m.handle(SessionEvent::PollSucceeded(online(80)));
        assert!(effects.contains(&Effect::StatusChanged(online(80))));
    }

    #[test]
    fn test_headset_offline_uses_offline_interval() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::PollSucceeded(DeviceStatus::default()));
        assert_eq!(
            effects,
            vec![Effect::StatusChanged(DeviceStatus::default()), Effect::PollAfter(Duration::from_secs(5))]
        );
        assert_eq!(m.state(), SessionState::Connected);
        assert!(!m.is_online());
    }

    #[test]
    fn test_teardown_from_any_state() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::Teardown);
        assert_eq!(
            effects,
            vec![Effect::Close, Effect::StateChanged { from: SessionState::Connected, to: SessionState::Idle }]
        );
        assert!(m.handle(SessionEvent::Teardown).is_empty());
    }

    #[test]
    fn test_two_hard_io_failures_disconnect() {
        let mut m = connected_machine();
        assert_eq!(transitions(&m.handle(io_error())), vec![(SessionState::Connected, SessionState::Degraded)]);
        let effects = m.handle(io_error());
        assert_eq!(transitions(&effects), vec![(SessionState::Degraded, SessionState::Disconnected)]);
        assert!(effects.contains(&Effect::Close));
    }

    #[test]
    fn test_timeout_resets_hard_failure_count() {
        let mut config = config();
        config.retry.degraded_attempts = 5;
        let mut m = SessionMachine::new(config);
        m.handle(SessionEvent::Attached);
        m.handle(SessionEvent::Opened);
        m.handle(SessionEvent::PollSucceeded(online(80)));

        m.handle(io_error());
        m.handle(timeout());
        assert!(transitions(&m.handle(io_error())).is_empty());
        assert_eq!(m.state(), SessionState::Degraded);
        assert_eq!(transitions(&m.handle(io_error())), vec![(SessionState::Degraded, SessionState::Disconnected)]);
    }

    #[test]
    fn test_success_resets_hard_failure_count() {
        let mut m = connected_machine();
        m.handle(io_error());
        m.handle(SessionEvent::PollSucceeded(online(80)));
        assert_eq!(transitions(&m.handle(io_error())), vec![(SessionState::Connected, SessionState::Degraded)]);
    }

    #[test]
    fn test_mic_state_carried_across_polls_that_skip_it() {
        let mut m = connected_machine();
        let echoed = DeviceStatus { mic_monitor_enabled: true, mic_monitor_known: true, ..online(80) };
        assert_eq!(forwarded(&m.handle(SessionEvent::PollSucceeded(echoed.clone()))), vec![echoed.clone()]);

        // A plain poll on firmware that cannot be asked for mic state
        let effects = m.handle(SessionEvent::PollSucceeded(online(80)));
        assert!(forwarded(&effects).is_empty());
        assert_eq!(m.last_status(), Some(&echoed));

        let effects = m.handle(SessionEvent::PollSucceeded(online(79)));
        assert_eq!(forwarded(&effects), vec![DeviceStatus { battery_percent: Some(79), ..echoed }]);
    }

    #[test]
    fn test_mic_state_forgotten_when_headset_goes_offline() {
        let mut m = connected_machine();
        let echoed = DeviceStatus { mic_monitor_enabled: true, mic_monitor_known: true, ..online(80) };
        m.handle(SessionEvent::PollSucceeded(echoed));
        m.handle(SessionEvent::PollSucceeded(DeviceStatus::default()));

        m.handle(SessionEvent::PollSucceeded(online(80)));
        assert_eq!(m.last_status(), Some(&online(80)));
    }

    #[test]
    fn test_timeout_backoff_doubles_and_clears() {
        let t0 = Instant::now();
        let mut backoff = TimeoutBackoff::new(Duration::from_secs(4), Duration::from_secs(10));
        assert!(backoff.paused_until(t0).is_none());
        assert_eq!(backoff.hold(t0), t0);

        assert_eq!(backoff.on_timeout(t0), Duration::from_secs(4));
        assert_eq!(backoff.on_timeout(t0), Duration::from_secs(8));
        assert_eq!(backoff.on_timeout(t0), Duration::from_secs(10));
        assert_eq!(backoff.paused_until(t0), Some(t0 + Duration::from_secs(10)));
        assert_eq!(backoff.hold(t0 + Duration::from_secs(2)), t0 + Duration::from_secs(10));
        assert!(backoff.paused_until(t0 + Duration::from_secs(10)).is_none());

        assert!(backoff.clear());
        assert!(!backoff.clear());
        assert_eq!(backoff.on_timeout(t0), Duration::from_secs(4));
    }
}
