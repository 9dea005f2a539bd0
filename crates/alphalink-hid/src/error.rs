//! Mapping of hidapi failures onto the typed core errors.
//!
//! hidapi reports most failures as either a wrapped `std::io::Error` (the
//! native hidraw backend) or a free-form message (the C backends), so both
//! shapes are classified here.

use std::io;

use alphalink_core::{EnumerationError, TransportError};
use hidapi::HidError;

const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const ESHUTDOWN: i32 = 108;

/// Message fragments that mean the operation merely ran out of time.
const TIMEOUT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "resource temporarily unavailable",
    "would block",
];

/// Which operation failed; open failures and I/O failures on an already
/// open handle read the same errno differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    Io,
}

/// Classify a hidapi error raised while opening or using `path`.
#[must_use]
pub fn classify(error: &HidError, path: &str, op: Operation) -> TransportError {
    match error {
        HidError::IoError { error } => classify_io(error, path, op),
        other => classify_message(&other.to_string(), path, op),
    }
}

fn classify_io(error: &io::Error, path: &str, op: Operation) -> TransportError {
    match (error.kind(), error.raw_os_error()) {
        (io::ErrorKind::PermissionDenied, _) => TransportError::PermissionDenied(path.to_string()),
        (io::ErrorKind::NotFound, _) => TransportError::NotFound(path.to_string()),
        (io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock, _) => TransportError::Timeout,
        (_, Some(EBUSY)) => TransportError::Busy(path.to_string()),
        (_, Some(ENODEV | ESHUTDOWN)) => match op {
            Operation::Open => TransportError::NotFound(path.to_string()),
            Operation::Io => TransportError::Disconnected,
        },
        _ => classify_message(&error.to_string(), path, op),
    }
}

/// Classify by error text; used for backends that only hand back a string.
#[must_use]
pub fn classify_message(message: &str, path: &str, op: Operation) -> TransportError {
    let lower = message.to_ascii_lowercase();

    if TIMEOUT_MARKERS.iter().any(|m| lower.contains(m)) {
        TransportError::Timeout
    } else if lower.contains("permission denied") {
        TransportError::PermissionDenied(path.to_string())
    } else if lower.contains("resource busy") || lower.contains("device busy") {
        TransportError::Busy(path.to_string())
    } else if lower.contains("no such device") || lower.contains("no such file") {
        match op {
            Operation::Open => TransportError::NotFound(path.to_string()),
            Operation::Io => TransportError::Disconnected,
        }
    } else {
        TransportError::IoError(message.to_string())
    }
}

/// Classify a failure to list devices.
#[must_use]
pub fn classify_enumeration(error: &HidError) -> EnumerationError {
    let message = error.to_string();
    let permission = match error {
        HidError::IoError { error } => error.kind() == io::ErrorKind::PermissionDenied,
        _ => message.to_ascii_lowercase().contains("permission denied"),
    };
    if permission { EnumerationError::PermissionDenied } else { EnumerationError::Unavailable(message) }
}
