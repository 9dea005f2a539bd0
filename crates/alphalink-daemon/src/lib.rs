//! Alphalink daemon library.
//!
//! Everything a front end needs to drive the headset: configuration,
//! the [`SessionManager`](manager::SessionManager) that accepts commands and
//! publishes status, and the stock preferences store and notification sink.
//! The `alphalink-daemon` binary wires these together.

pub mod config;
pub mod manager;
pub mod notify;
pub mod session;
pub mod settings;
pub mod signals;

pub use config::Config;
pub use manager::{ManagerStatus, SessionManager};
pub use notify::ChannelSink;
pub use settings::FileSettingsStore;
