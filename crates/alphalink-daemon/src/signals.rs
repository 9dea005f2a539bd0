//! Signal handling for graceful shutdown and rescans.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What a received signal asks the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown,
    /// SIGHUP: enumerate now and retry disconnected devices
    Rescan,
}

/// Set up signal handlers.
///
/// Returns a receiver that gets [`SignalAction::Shutdown`] on SIGTERM or
/// SIGINT and [`SignalAction::Rescan`] on every SIGHUP.
pub fn setup_signal_handlers() -> mpsc::Receiver<SignalAction> {
    let (tx, rx) = mpsc::channel(4);

    // Handle SIGTERM
    let tx_term = tx.clone();
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM");
                let _ = tx_term.send(SignalAction::Shutdown).await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    });

    // Handle SIGHUP, repeatedly
    let tx_hup = tx.clone();
    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };
        while stream.recv().await.is_some() {
            info!("Received SIGHUP");
            if tx_hup.send(SignalAction::Rescan).await.is_err() {
                break;
            }
        }
    });

    // Handle SIGINT (Ctrl+C)
    let tx_int = tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT");
            let _ = tx_int.send(SignalAction::Shutdown).await;
        }
    });

    rx
}
