//! Alphalink HID - hidraw transport and hotplug enumeration.
//!
//! This crate owns every blocking call into the HID stack: listing
//! interfaces, opening handles, and the query/response exchanges that turn
//! raw reports into a [`DeviceStatus`](alphalink_core::DeviceStatus).

pub mod device;
pub mod enumerator;
pub mod error;
pub mod exchange;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use device::{HidBackend, HidHandle};
pub use enumerator::{DeviceScanner, Enumerator, EnumeratorEvent, EnumeratorHandle, HidDeviceEntry};
pub use transport::{DeviceIo, Transport};
