//! Notification delivery.
//!
//! Sessions hand events to a [`ChannelSink`], which never blocks. A single
//! task drains the channel, so events from one session keep their order.

use alphalink_core::{NotificationEvent, NotificationKind, NotificationSink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Sink that forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn deliver(&self, event: NotificationEvent) {
        if self.tx.send(event).is_err() {
            warn!("Notification receiver closed, dropping event");
        }
    }
}

/// Human-readable summary of an event.
#[must_use]
pub fn describe(event: &NotificationEvent) -> String {
    let text = match (event.kind, event.battery_percent) {
        (NotificationKind::Connected, _) => "Headset connected".to_string(),
        (NotificationKind::Disconnected, _) => "Headset disconnected".to_string(),
        (NotificationKind::ConnectionUnstable { online }, _) => format!(
            "Headset connection unstable ({} changes), now {}",
            event.count,
            if online { "connected" } else { "disconnected" }
        ),
        (NotificationKind::LowBattery, Some(p)) => format!("Headset battery low ({p}%)"),
        (NotificationKind::CriticalBattery, Some(p)) => format!("Headset battery critical ({p}%)"),
        (NotificationKind::LowBattery, None) => "Headset battery low".to_string(),
        (NotificationKind::CriticalBattery, None) => "Headset battery critical".to_string(),
    };
    match event.kind {
        NotificationKind::LowBattery | NotificationKind::CriticalBattery if event.count > 1 => {
            format!("{text} (grouped alerts)")
        }
        _ => text,
    }
}

/// Spawn the task that presents notifications by logging them.
pub fn spawn_logger(mut rx: mpsc::UnboundedReceiver<NotificationEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            info!(
                device = %event.device,
                kind = ?event.kind,
                battery = ?event.battery_percent,
                count = event.count,
                "{}",
                describe(&event)
            );
        }
    })
}
