//! Notification policy engine.
//!
//! Turns the raw stream of presence changes and battery samples coming out
//! of a device session into the few notifications a user should see:
//!
//! - connect/disconnect changes are held for a debounce window and dropped
//!   entirely if reversed inside it; a change announced after several others
//!   in a short window is reported once as an unstable connection;
//! - battery alerts fire once per level (low, any warning levels, critical)
//!   as the battery drops through them. Low and warning alerts are held
//!   briefly so close ones merge, and repeat only after a cooldown.
//!   Critical goes out at once;
//! - rising back above a level re-arms it.
//!
//! Time is never read from a clock here. Callers pass `now`, and drive
//! pending deadlines with [`NotificationPolicy::poll`] at
//! [`NotificationPolicy::next_deadline`].

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::status::DeviceId;

/// Thresholds and windows for the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub debounce: Duration,
    pub low_battery_percent: u8,
    /// Extra alert levels between low and critical
    pub battery_warning_levels: Vec<u8>,
    pub critical_battery_percent: u8,
    /// Minimum spacing between alerts for the same level
    pub battery_cooldown: Duration,
    /// How long a battery alert is held so alerts close together merge
    pub battery_batch: Duration,
    /// Window over which presence changes are counted
    pub instability_window: Duration,
    /// Changes within the window that make an announcement "unstable"
    pub instability_changes: u32,
    pub connection_alerts: bool,
    pub battery_alerts: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            low_battery_percent: 20,
            battery_warning_levels: vec![10],
            critical_battery_percent: 5,
            battery_cooldown: Duration::from_secs(30 * 60),
            battery_batch: Duration::from_millis(1800),
            instability_window: Duration::from_secs(20),
            instability_changes: 3,
            connection_alerts: true,
            battery_alerts: true,
        }
    }
}

impl PolicyConfig {
    /// Every battery alert level, highest first.
    #[must_use]
    pub fn battery_levels(&self) -> Vec<u8> {
        let mut levels: Vec<u8> = self
            .battery_warning_levels
            .iter()
            .copied()
            .chain([self.low_battery_percent, self.critical_battery_percent])
            .collect();
        levels.sort_unstable_by(|a, b| b.cmp(a));
        levels.dedup();
        levels
    }
}

/// Kinds of user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Connected,
    Disconnected,
    /// Several presence changes in a short window; `online` is where it
    /// settled
    ConnectionUnstable { online: bool },
    LowBattery,
    CriticalBattery,
}

/// A notification ready for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub device: DeviceId,
    pub kind: NotificationKind,
    /// Battery level for battery notifications
    pub battery_percent: Option<u8>,
    /// Raw alerts or presence changes folded into this one
    pub count: u32,
    pub timestamp: Instant,
}

/// Receives notifications. Implementations must not block.
pub trait NotificationSink: Send {
    fn deliver(&self, event: NotificationEvent);
}

#[derive(Debug, Clone, Copy)]
struct PendingPresence {
    online: bool,
    deadline: Instant,
}

/// Low-battery alerts waiting to go out together.
#[derive(Debug, Clone, Copy)]
struct BatteryBatch {
    /// Lowest level reached
    level: u8,
    /// Lowest sample seen
    percent: u8,
    count: u32,
    deadline: Instant,
}

/// Per-device notification policy state.
#[derive(Debug)]
pub struct NotificationPolicy {
    device: DeviceId,
    config: PolicyConfig,
    levels: Vec<u8>,
    /// Last presence announced to the user; offline until the first connect
    announced_online: bool,
    /// Last presence observed, announced or not
    observed_online: bool,
    pending: Option<PendingPresence>,
    presence_changes: VecDeque<Instant>,
    /// Battery levels already alerted, and when
    notified: BTreeMap<u8, Instant>,
    batch: Option<BatteryBatch>,
}

impl NotificationPolicy {
    #[must_use]
    pub fn new(device: DeviceId, config: PolicyConfig) -> Self {
        Self {
            device,
            levels: config.battery_levels(),
            config,
            announced_online: false,
            observed_online: false,
            pending: None,
            presence_changes: VecDeque::new(),
            notified: BTreeMap::new(),
            batch: None,
        }
    }

    /// Record the current presence of the headset.
    ///
    /// Nothing is emitted here; a change becomes a notification only when
    /// [`poll`](Self::poll) runs after it has held for the debounce window.
    pub fn observe_presence(&mut self, online: bool, now: Instant) {
        if online != self.observed_online {
            self.observed_online = online;
            self.presence_changes.push_back(now);
            self.prune_changes(now);
        }

        if online == self.announced_online {
            if self.pending.take().is_some() {
                debug!(device = %self.device, online, "Presence change reversed within debounce window");
            }
            return;
        }
        if self.pending.is_some_and(|p| p.online == online) {
            return;
        }
        self.pending = Some(PendingPresence { online, deadline: now + self.config.debounce });
    }

    /// Record a battery sample.
    ///
    /// Returns a critical alert right away; other alerts are batched and
    /// come out of [`poll`](Self::poll).
    pub fn observe_battery(&mut self, percent: u8, now: Instant) -> Option<NotificationEvent> {
        self.notified.retain(|level, _| percent <= *level);
        if self.batch.is_some_and(|b| percent > b.level) {
            debug!(device = %self.device, percent, "Battery recovered before alert went out");
            self.batch = None;
        }

        // Lowest level the sample is at or below
        let level = self.levels.iter().rev().copied().find(|level| percent <= *level)?;
        let critical = level == self.config.critical_battery_percent;

        if let Some(at) = self.notified.get(&level)
            && (critical || now.saturating_duration_since(*at) < self.config.battery_cooldown)
        {
            return None;
        }
        for above in self.levels.iter().filter(|l| **l >= level) {
            self.notified.insert(*above, now);
        }

        if critical {
            self.batch = None;
            return self.event(NotificationKind::CriticalBattery, Some(percent), 1, now, self.config.battery_alerts);
        }

        let deadline = now + self.config.battery_batch;
        self.batch = Some(match self.batch {
            Some(b) => BatteryBatch {
                level: b.level.min(level),
                percent: b.percent.min(percent),
                count: b.count + 1,
                deadline,
            },
            None => BatteryBatch { level, percent, count: 1, deadline },
        });
        None
    }

    /// Emit everything whose window has elapsed at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<NotificationEvent> {
        let mut events = Vec::new();

        if let Some(pending) = self.pending
            && now >= pending.deadline
        {
            self.pending = None;
            self.announced_online = pending.online;
            self.prune_changes(now);
            let changes = u32::try_from(self.presence_changes.len()).unwrap_or(u32::MAX);
            let (kind, count) = if changes >= self.config.instability_changes {
                (NotificationKind::ConnectionUnstable { online: pending.online }, changes)
            } else if pending.online {
                (NotificationKind::Connected, 1)
            } else {
                (NotificationKind::Disconnected, 1)
            };
            events.extend(self.event(kind, None, count, now, self.config.connection_alerts));
        }

        if let Some(batch) = self.batch
            && now >= batch.deadline
        {
            self.batch = None;
            events.extend(self.event(
                NotificationKind::LowBattery,
                Some(batch.percent),
                batch.count,
                now,
                self.config.battery_alerts,
            ));
        }

        events
    }

    /// When [`poll`](Self::poll) next needs to run.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.pending.map(|p| p.deadline), self.batch.map(|b| b.deadline)]
            .into_iter()
            .flatten()
            .min()
    }

    /// Forget everything; used when the session returns to idle.
    pub fn reset(&mut self) {
        self.announced_online = false;
        self.observed_online = false;
        self.pending = None;
        self.presence_changes.clear();
        self.notified.clear();
        self.batch = None;
    }

    fn prune_changes(&mut self, now: Instant) {
        let window = self.config.instability_window;
        while self.presence_changes.front().is_some_and(|at| now.saturating_duration_since(*at) > window) {
            self.presence_changes.pop_front();
        }
    }

    fn event(
        &self,
        kind: NotificationKind,
        battery_percent: Option<u8>,
        count: u32,
        now: Instant,
        enabled: bool,
    ) -> Option<NotificationEvent> {
        enabled.then(|| NotificationEvent {
            device: self.device.clone(),
            kind,
            battery_percent,
            count,
            timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> NotificationPolicy {
        NotificationPolicy::new(DeviceId::new(Some("TEST"), "/dev/hidraw0"), PolicyConfig::default())
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn kinds(events: &[NotificationEvent]) -> Vec<NotificationKind> {
        events.iter().map(|e| e.kind).collect()
    }

    /// Feed battery samples one minute apart, polling after each batch window.
    fn drain_battery(p: &mut NotificationPolicy, t0: Instant, samples: &[u8]) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        for (i, pct) in samples.iter().enumerate() {
            let at = t0 + secs(60 * i as u64);
            events.extend(p.observe_battery(*pct, at));
            events.extend(p.poll(at + ms(1800)));
        }
        events
    }

    /// Policy that has already announced the headset as connected.
    fn connected_policy(t0: Instant) -> NotificationPolicy {
        let mut p = policy();
        p.observe_presence(true, t0);
        assert_eq!(kinds(&p.poll(t0 + secs(3))), vec![NotificationKind::Connected]);
        p
    }

    #[test]
    fn test_first_connect_notifies_after_debounce() {
        let t0 = Instant::now();
        let mut p = policy();
        p.observe_presence(true, t0);
        assert_eq!(p.next_deadline(), Some(t0 + secs(3)));
        assert!(p.poll(t0 + secs(2)).is_empty());
        assert_eq!(kinds(&p.poll(t0 + secs(3))), vec![NotificationKind::Connected]);
        assert!(p.next_deadline().is_none());
    }

    #[test]
    fn test_flap_within_window_is_suppressed() {
        let t0 = Instant::now();
        let mut p = connected_policy(t0);
        let start = t0 + secs(30);

        p.observe_presence(false, start);
        assert!(p.poll(start + secs(1)).is_empty());
        p.observe_presence(true, start + secs(2));

        let mut events = Vec::new();
        for s in 0..20 {
            events.extend(p.poll(start + secs(s)));
        }
        assert!(events.is_empty());
        assert!(p.next_deadline().is_none());
    }

    #[test]
    fn test_held_disconnect_notifies_once() {
        let t0 = Instant::now();
        let mut p = connected_policy(t0);
        let start = t0 + secs(30);

        p.observe_presence(false, start);
        let mut events = Vec::new();
        for s in 0..10 {
            // Repeated observations of the same state do not restart the window
            p.observe_presence(false, start + secs(s));
            events.extend(p.poll(start + secs(s)));
        }
        p.observe_presence(true, start + secs(11));
        events.extend(p.poll(start + secs(12)));

        assert_eq!(kinds(&events), vec![NotificationKind::Disconnected]);
        assert_eq!(events[0].count, 1);
    }

    #[test]
    fn test_repeated_changes_report_unstable_connection() {
        let t0 = Instant::now();
        let mut p = connected_policy(t0);
        let start = t0 + secs(60);

        // off, on, off inside the window; only the last one holds
        p.observe_presence(false, start);
        p.observe_presence(true, start + secs(1));
        p.observe_presence(false, start + secs(2));
        assert!(p.poll(start + secs(4)).is_empty());

        let events = p.poll(start + secs(5));
        assert_eq!(kinds(&events), vec![NotificationKind::ConnectionUnstable { online: false }]);
        assert_eq!(events[0].count, 3);
    }

    #[test]
    fn test_old_changes_fall_out_of_instability_window() {
        let t0 = Instant::now();
        let mut p = connected_policy(t0);

        p.observe_presence(false, t0 + secs(30));
        assert_eq!(kinds(&p.poll(t0 + secs(33))), vec![NotificationKind::Disconnected]);
        p.observe_presence(true, t0 + secs(60));
        assert_eq!(kinds(&p.poll(t0 + secs(63))), vec![NotificationKind::Connected]);
    }

    #[test]
    fn test_low_battery_grouping_and_rate_limit() {
        let t0 = Instant::now();
        let mut p = policy();

        let emitted = drain_battery(&mut p, t0, &[25, 18, 15, 12, 19, 14]);
        assert_eq!(kinds(&emitted), vec![NotificationKind::LowBattery]);
        assert_eq!(emitted[0].battery_percent, Some(18));
    }

    #[test]
    fn test_alerts_close_together_are_batched() {
        let t0 = Instant::now();
        let mut p = policy();

        assert!(p.observe_battery(18, t0).is_none());
        assert_eq!(p.next_deadline(), Some(t0 + ms(1800)));
        assert!(p.observe_battery(9, t0 + ms(500)).is_none());
        assert!(p.poll(t0 + ms(2000)).is_empty());

        let events = p.poll(t0 + ms(2300));
        assert_eq!(kinds(&events), vec![NotificationKind::LowBattery]);
        assert_eq!(events[0].battery_percent, Some(9));
        assert_eq!(events[0].count, 2);
    }

    #[test]
    fn test_each_level_alerts_once_on_the_way_down() {
        let t0 = Instant::now();
        let mut p = policy();

        let emitted = drain_battery(&mut p, t0, &[19, 16, 10, 8, 6, 5, 3]);
        assert_eq!(
            kinds(&emitted),
            vec![NotificationKind::LowBattery, NotificationKind::LowBattery, NotificationKind::CriticalBattery]
        );
        let levels: Vec<_> = emitted.iter().map(|e| e.battery_percent).collect();
        assert_eq!(levels, vec![Some(19), Some(10), Some(5)]);
    }

    #[test]
    fn test_rising_above_threshold_rearms() {
        let t0 = Instant::now();
        let mut p = policy();
        let emitted = drain_battery(&mut p, t0, &[18, 17, 21, 19]);
        assert_eq!(kinds(&emitted), vec![NotificationKind::LowBattery, NotificationKind::LowBattery]);
    }

    #[test]
    fn test_recovery_before_batch_flush_cancels_alert() {
        let t0 = Instant::now();
        let mut p = policy();
        p.observe_battery(20, t0);
        p.observe_battery(22, t0 + ms(500));
        assert!(p.next_deadline().is_none());
        assert!(p.poll(t0 + secs(5)).is_empty());
    }

    #[test]
    fn test_low_battery_repeats_after_cooldown() {
        let t0 = Instant::now();
        let mut p = policy();
        p.observe_battery(18, t0);
        assert_eq!(p.poll(t0 + ms(1800)).len(), 1);

        assert!(p.observe_battery(17, t0 + secs(29 * 60)).is_none());
        assert!(p.next_deadline().is_none());

        p.observe_battery(16, t0 + secs(30 * 60));
        assert_eq!(kinds(&p.poll(t0 + secs(30 * 60) + ms(1800))), vec![NotificationKind::LowBattery]);
    }

    #[test]
    fn test_critical_overrides_cooldown() {
        let t0 = Instant::now();
        let mut p = policy();
        p.observe_battery(15, t0);
        assert_eq!(kinds(&p.poll(t0 + ms(1800))), vec![NotificationKind::LowBattery]);

        let critical = p.observe_battery(4, t0 + secs(60)).unwrap();
        assert_eq!(critical.kind, NotificationKind::CriticalBattery);
        assert_eq!(critical.battery_percent, Some(4));

        // Further samples at or below critical stay quiet
        assert!(p.observe_battery(3, t0 + secs(120)).is_none());
    }

    #[test]
    fn test_critical_rearms_after_partial_recovery() {
        let t0 = Instant::now();
        let mut p = policy();

        let emitted = drain_battery(&mut p, t0, &[15, 4, 7, 8, 3]);
        let critical: Vec<_> = emitted
            .iter()
            .filter(|e| e.kind == NotificationKind::CriticalBattery)
            .map(|e| e.battery_percent)
            .collect();
        assert_eq!(critical, vec![Some(4), Some(3)]);
    }

    #[test]
    fn test_critical_supersedes_pending_low_alert() {
        let t0 = Instant::now();
        let mut p = policy();
        assert!(p.observe_battery(15, t0).is_none());
        let critical = p.observe_battery(4, t0 + ms(300));
        assert_eq!(critical.map(|e| e.kind), Some(NotificationKind::CriticalBattery));
        assert!(p.next_deadline().is_none());
    }

    #[test]
    fn test_first_sample_below_critical_is_critical_only() {
        let t0 = Instant::now();
        let mut p = policy();
        assert_eq!(p.observe_battery(2, t0).map(|e| e.kind), Some(NotificationKind::CriticalBattery));
        assert!(p.observe_battery(10, t0 + secs(1)).is_none());
        assert!(p.poll(t0 + secs(5)).is_empty());
    }

    #[test]
    fn test_battery_levels_sorted_and_deduplicated() {
        let config = PolicyConfig { battery_warning_levels: vec![5, 15, 10, 15], ..PolicyConfig::default() };
        assert_eq!(config.battery_levels(), vec![20, 15, 10, 5]);
    }

    #[test]
    fn test_disabled_alerts_are_silent_but_tracked() {
        let t0 = Instant::now();
        let config = PolicyConfig { battery_alerts: false, connection_alerts: false, ..PolicyConfig::default() };
        let mut p = NotificationPolicy::new(DeviceId::new(None, "/dev/hidraw1"), config);

        assert!(p.observe_battery(10, t0).is_none());
        assert!(p.observe_battery(3, t0).is_none());
        p.observe_presence(true, t0);
        assert!(p.poll(t0 + secs(5)).is_empty());
        assert!(p.next_deadline().is_none());
    }

    #[test]
    fn test_reset_clears_state() {
        let t0 = Instant::now();
        let mut p = connected_policy(t0);
        p.observe_battery(10, t0);
        p.observe_presence(false, t0 + secs(5));

        p.reset();
        assert!(p.next_deadline().is_none());
        p.observe_battery(10, t0 + secs(6));
        assert_eq!(kinds(&p.poll(t0 + secs(8))), vec![NotificationKind::LowBattery]);
    }
}
