//! Blocking report I/O over a HID handle.
//!
//! This is the only layer that talks to the operating system. Handles are
//! owned by exactly one device session and are closed when dropped.

use std::time::Duration;

use alphalink_core::TransportError;

/// An open handle to one HID interface.
pub trait DeviceIo: Send {
    /// Path the handle was opened from.
    fn path(&self) -> &str;

    /// Write one output report.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the report could not be written in
    /// full.
    fn write(&mut self, report: &[u8]) -> Result<(), TransportError>;

    /// Read one input report, waiting at most `timeout`.
    ///
    /// # Errors
    /// Returns [`TransportError::Timeout`] when nothing arrives in time, or
    /// another variant when the read itself fails.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// Opens handles by device path.
pub trait Transport: Send + Sync {
    type Io: DeviceIo + 'static;

    /// Open the HID interface at `path`.
    ///
    /// # Errors
    /// Returns a [`TransportError`] describing why the device could not be
    /// opened.
    fn open(&self, path: &str) -> Result<Self::Io, TransportError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    type Io = T::Io;

    fn open(&self, path: &str) -> Result<Self::Io, TransportError> {
        (**self).open(path)
    }
}

/// Saturating conversion for APIs that take a millisecond count.
#[must_use]
pub fn timeout_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}
