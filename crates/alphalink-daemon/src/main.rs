//! Alphalink daemon - HyperX Cloud Alpha Wireless headset manager.
//!
//! Watches for compatible USB dongles, keeps a session per device that
//! polls battery and settings, and raises notifications on connection
//! and battery changes.

use std::sync::Arc;

use alphalink_core::registry;
use alphalink_daemon::config::LogFormat;
use alphalink_daemon::signals::{self, SignalAction};
use alphalink_daemon::{ChannelSink, FileSettingsStore, SessionManager, config, notify};
use alphalink_hid::{Enumerator, EnumeratorHandle, HidBackend};
use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so its log level applies
    let config = config::load_config().context("Failed to load configuration")?;

    // Initialize logging; RUST_LOG overrides the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(&config.daemon.log_level)
            .add_directive("alphalink_daemon=debug".parse()?)
            .add_directive(format!("alphalink_hid={}", config.daemon.log_level).parse()?)
            .add_directive(format!("alphalink_core={}", config.daemon.log_level).parse()?),
    };
    match config.daemon.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Alphalink daemon");

    let preferences_path = config::preferences_path()?;
    info!(path = ?preferences_path, "Using preferences file");
    let store = FileSettingsStore::new(preferences_path);

    let (sink, notification_rx) = ChannelSink::new();
    let notifier = notify::spawn_logger(notification_rx);

    let backend = HidBackend::new().context("Failed to initialize HID access")?;
    for model in registry::compatible_models() {
        debug!(%model, "Watching for headset");
    }

    let (mut manager, mut update_rx) = SessionManager::new(backend.clone(), Box::new(store), &config, Arc::new(sink));
    let mut status_rx = manager.subscribe();

    info!(interval = ?config.scan_interval(), "Starting device enumerator");
    let (enumerator, mut enumerator_rx) = EnumeratorHandle::spawn(Enumerator::new(backend), config.scan_interval())
        .context("Failed to start enumerator thread")?;
    manager.attach_enumerator(enumerator);

    let mut signal_rx = signals::setup_signal_handlers();

    info!("Daemon running. Press Ctrl+C to exit.");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = enumerator_rx.recv() => {
                debug!(?event, "Enumerator event");
                manager.handle_enumerator_event(event);
            }

            Some(update) = update_rx.recv() => {
                manager.handle_session_update(update);
            }

            Ok(()) = status_rx.changed() => {
                let status = status_rx.borrow_and_update().clone();
                info!(
                    device = ?status.active_device.as_ref().map(ToString::to_string),
                    state = ?status.state,
                    battery = ?status.status.as_ref().and_then(|s| s.battery_percent),
                    attached = status.attached_count,
                    degraded = status.enumeration_degraded,
                    "Status changed"
                );
            }

            action = signal_rx.recv() => match action {
                Some(SignalAction::Rescan) => manager.scan_now(),
                Some(SignalAction::Shutdown) | None => {
                    info!("Shutdown signal received");
                    break;
                }
            },
        }
    }

    // Cleanup
    info!("Shutting down...");
    drop(update_rx);
    drop(enumerator_rx);
    tokio::task::spawn_blocking(move || manager.shutdown())
        .await
        .context("Session shutdown panicked")?;
    notifier.abort();

    info!("Alphalink daemon stopped");
    Ok(())
}
