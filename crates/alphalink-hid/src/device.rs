//! hidapi-backed device listing and handles.

use std::ffi::CString;
use std::sync::Arc;
use std::time::Duration;

use alphalink_core::codec::INPUT_REPORT_CAPACITY;
use alphalink_core::{EnumerationError, TransportError};
use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::enumerator::{DeviceScanner, HidDeviceEntry};
use crate::error::{Operation, classify, classify_enumeration};
use crate::transport::{DeviceIo, Transport, timeout_millis};

/// Shared hidapi context.
///
/// hidapi keeps one device list per context, so listing and opening are
/// serialized through a single lock. Reads and writes on open handles do
/// not take it.
#[derive(Clone)]
pub struct HidBackend {
    api: Arc<Mutex<HidApi>>,
}

impl HidBackend {
    /// Initialize hidapi.
    ///
    /// # Errors
    /// Returns an error if the HID subsystem cannot be initialized.
    pub fn new() -> Result<Self, EnumerationError> {
        let api = HidApi::new().map_err(|e| classify_enumeration(&e))?;
        info!("HID backend initialized");
        Ok(Self { api: Arc::new(Mutex::new(api)) })
    }
}

impl DeviceScanner for HidBackend {
    fn scan(&self) -> Result<Vec<HidDeviceEntry>, EnumerationError> {
        let mut api = self.api.lock();
        api.refresh_devices().map_err(|e| classify_enumeration(&e))?;

        Ok(api
            .device_list()
            .map(|info| HidDeviceEntry {
                path: info.path().to_string_lossy().into_owned(),
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                interface_number: info.interface_number(),
                serial_number: info.serial_number().filter(|s| !s.is_empty()).map(str::to_string),
                product_string: info.product_string().map(str::to_string),
            })
            .collect())
    }
}

impl Transport for HidBackend {
    type Io = HidHandle;

    fn open(&self, path: &str) -> Result<HidHandle, TransportError> {
        let c_path = CString::new(path).map_err(|_| TransportError::NotFound(path.to_string()))?;
        let device = self
            .api
            .lock()
            .open_path(&c_path)
            .map_err(|e| classify(&e, path, Operation::Open))?;

        debug!(path, "Opened HID device");
        Ok(HidHandle { device, path: path.to_string() })
    }
}

/// An open hidraw handle.
pub struct HidHandle {
    device: HidDevice,
    path: String,
}

impl DeviceIo for HidHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, report: &[u8]) -> Result<(), TransportError> {
        let written = self.device.write(report).map_err(|e| classify(&e, &self.path, Operation::Io))?;
        if written != report.len() {
            return Err(TransportError::IoError(format!(
                "short write: {written} of {} bytes",
                report.len()
            )));
        }
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; INPUT_REPORT_CAPACITY];
        let len = self
            .device
            .read_timeout(&mut buf, timeout_millis(timeout))
            .map_err(|e| classify(&e, &self.path, Operation::Io))?;
        if len == 0 {
            return Err(TransportError::Timeout);
        }
        Ok(buf[..len].to_vec())
    }
}

impl Drop for HidHandle {
    fn drop(&mut self) {
        debug!(path = %self.path, "Closed HID device");
    }
}
