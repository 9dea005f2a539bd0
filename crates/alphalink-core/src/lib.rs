//! Alphalink Core - Protocol, session state and notification policy.
//!
//! This crate contains the hardware-independent half of headset control:
//! which devices are supported, how their HID reports are framed, how a
//! device session reacts to I/O results, and which notifications reach the
//! user. Nothing in here performs I/O or reads a clock.

pub mod codec;
pub mod command;
pub mod error;
pub mod policy;
pub mod registry;
pub mod session;
pub mod settings;
pub mod state;
pub mod status;

pub use codec::DecodeError;
pub use command::PendingCommand;
pub use error::{CommandError, EnumerationError, PollFailure, SettingsError, TransportError};
pub use policy::{NotificationEvent, NotificationKind, NotificationPolicy, NotificationSink, PolicyConfig};
pub use registry::{CompatibleModel, ReportLayout};
pub use session::{Effect, SessionConfig, SessionMachine, TimeoutBackoff};
pub use settings::{Preferences, SettingsStore};
pub use state::{SessionEvent, SessionState};
pub use status::{DeviceId, DeviceStatus, FeatureFlags, SleepTimer};
