//! HID report encoding and decoding.
//!
//! Every report on the vendor interface has the shape
//! `[0x21, 0xBB, code, value, padding...]`. The host sends queries and set
//! commands; the headset answers queries with a report carrying the same
//! code, echoes set commands back, and pushes `0x24` on connection changes.
//!
//! Everything here is pure: no I/O, no state.

use thiserror::Error;

use crate::command::PendingCommand;
use crate::registry::CompatibleModel;
use crate::status::{DeviceStatus, SleepTimer};

/// Report codes.
pub mod code {
    pub const CONNECTION: u8 = 0x03;
    pub const SLEEP_TIMER: u8 = 0x07;
    pub const VOICE_PROMPT: u8 = 0x09;
    pub const MIC_MONITOR: u8 = 0x0a;
    pub const BATTERY: u8 = 0x0b;
    pub const SET_SLEEP_TIMER: u8 = 0x12;
    pub const SET_VOICE_PROMPT: u8 = 0x13;
    pub const SET_MIC_MONITOR: u8 = 0x22;
    pub const CONNECTION_CHANGED: u8 = 0x24;
}

const HEADSET_DISCONNECTED: u8 = 0x01;
const HEADSET_CONNECTED: u8 = 0x02;

/// Size of the buffer used for input reports.
pub const INPUT_REPORT_CAPACITY: usize = 32;

/// Why a response could not be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("report too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("bad report marker {found:02x?}")]
    BadMarker { found: [u8; 2] },

    #[error("unknown firmware variant: code {code:#04x} value {value:#04x}")]
    UnknownFirmwareVariant { code: u8, value: u8 },

    #[error("battery value {raw} out of range (clamped to {clamped})")]
    OutOfRange { raw: u8, clamped: u8 },

    #[error("status response incomplete: no connection report")]
    Incomplete,
}

/// State queries the host can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    Connection,
    SleepTimer,
    VoicePrompt,
    MicMonitor,
    Battery,
}

impl Query {
    const fn code(self) -> u8 {
        match self {
            Self::Connection => code::CONNECTION,
            Self::SleepTimer => code::SLEEP_TIMER,
            Self::VoicePrompt => code::VOICE_PROMPT,
            Self::MicMonitor => code::MIC_MONITOR,
            Self::Battery => code::BATTERY,
        }
    }
}

/// One decoded input report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// Headset link state (query answer or unsolicited change)
    Connection(bool),
    Battery(u8),
    SleepTimer(SleepTimer),
    VoicePrompt(bool),
    MicMonitor(bool),
    /// Well-formed report with a code this crate does not interpret
    Unrecognized { code: u8, value: u8 },
}

impl Report {
    /// Whether this report answers `query`.
    #[must_use]
    pub fn answers(&self, query: Query) -> bool {
        matches!(
            (self, query),
            (Self::Connection(_), Query::Connection)
                | (Self::Battery(_), Query::Battery)
                | (Self::SleepTimer(_), Query::SleepTimer)
                | (Self::VoicePrompt(_), Query::VoicePrompt)
                | (Self::MicMonitor(_), Query::MicMonitor)
        )
    }
}

fn frame(model: &CompatibleModel, code: u8, value: u8) -> Vec<u8> {
    let mut report = vec![0u8; model.layout.output_report_len()];
    let [m0, m1] = model.layout.marker();
    report[0] = m0;
    report[1] = m1;
    report[2] = code;
    report[3] = value;
    report
}

/// Encode a state query.
#[must_use]
pub fn encode_query(query: Query, model: &CompatibleModel) -> Vec<u8> {
    frame(model, query.code(), 0)
}

/// Encode a control command into a fixed-length output report.
#[must_use]
pub fn encode_command(command: &PendingCommand, model: &CompatibleModel) -> Vec<u8> {
    match *command {
        PendingCommand::SetSleepTimer(timer) => frame(model, code::SET_SLEEP_TIMER, timer.to_wire()),
        PendingCommand::ToggleVoicePrompt(on) => frame(model, code::SET_VOICE_PROMPT, u8::from(on)),
        PendingCommand::ToggleMicMonitor(on) => frame(model, code::SET_MIC_MONITOR, u8::from(on)),
    }
}

/// Queries that follow a connection query once the headset is known to be
/// linked, in the order they are sent.
#[must_use]
pub fn follow_up_queries(model: &CompatibleModel) -> Vec<Query> {
    let mut queries = vec![Query::Battery, Query::SleepTimer, Query::VoicePrompt];
    if model.features().contains(crate::status::FeatureFlags::MIC_MONITOR_QUERY) {
        queries.push(Query::MicMonitor);
    }
    queries
}

fn flag(code: u8, value: u8) -> Result<bool, DecodeError> {
    match value {
        0x00 => Ok(false),
        0x01 => Ok(true),
        _ => Err(DecodeError::UnknownFirmwareVariant { code, value }),
    }
}

/// Validate and decode one input report.
///
/// # Errors
/// Returns a [`DecodeError`] if the report is too short, carries the wrong
/// marker, or holds a value the model's firmware should never send.
pub fn decode_report(bytes: &[u8], model: &CompatibleModel) -> Result<Report, DecodeError> {
    let min = model.layout.min_report_len();
    if bytes.len() < min {
        return Err(DecodeError::TooShort { len: bytes.len(), min });
    }
    let found = [bytes[0], bytes[1]];
    if found != model.layout.marker() {
        return Err(DecodeError::BadMarker { found });
    }

    let (code, value) = (bytes[2], bytes[3]);
    let report = match code {
        code::CONNECTION | code::CONNECTION_CHANGED => match value {
            HEADSET_DISCONNECTED => Report::Connection(false),
            HEADSET_CONNECTED => Report::Connection(true),
            _ => return Err(DecodeError::UnknownFirmwareVariant { code, value }),
        },
        code::BATTERY => {
            if value > 100 {
                return Err(DecodeError::OutOfRange { raw: value, clamped: 100 });
            }
            Report::Battery(value)
        }
        code::SLEEP_TIMER | code::SET_SLEEP_TIMER => SleepTimer::from_wire(value)
            .map(Report::SleepTimer)
            .ok_or(DecodeError::UnknownFirmwareVariant { code, value })?,
        code::VOICE_PROMPT | code::SET_VOICE_PROMPT => Report::VoicePrompt(flag(code, value)?),
        code::MIC_MONITOR => Report::MicMonitor(flag(code, value)?),
        // The echo reports any non-zero level as enabled
        code::SET_MIC_MONITOR => Report::MicMonitor(value > 0),
        _ => Report::Unrecognized { code, value },
    };
    Ok(report)
}

/// Fold the reports read during one poll into a status snapshot.
///
/// Reports are applied in order, so a later report of the same kind wins.
/// Either every report validates and a complete snapshot is returned, or the
/// first failure is returned and nothing else.
///
/// # Errors
/// Returns the first report's [`DecodeError`], or
/// [`DecodeError::Incomplete`] when no connection report was seen.
pub fn decode_status<R: AsRef<[u8]>>(
    reports: &[R],
    model: &CompatibleModel,
) -> Result<DeviceStatus, DecodeError> {
    let mut connected = None;
    let mut status = DeviceStatus { features: model.features(), ..DeviceStatus::default() };

    for raw in reports {
        match decode_report(raw.as_ref(), model)? {
            Report::Connection(c) => connected = Some(c),
            Report::Battery(p) => status.battery_percent = Some(p),
            Report::SleepTimer(t) => status.sleep_timer = Some(t),
            Report::VoicePrompt(on) => status.voice_prompt_enabled = on,
            Report::MicMonitor(on) => {
                status.mic_monitor_enabled = on;
                status.mic_monitor_known = true;
            }
            Report::Unrecognized { .. } => {}
        }
    }

    match connected {
        Some(true) => {
            status.connected = true;
            Ok(status)
        }
        // Anything else reported alongside a dead link is stale
        Some(false) => Ok(DeviceStatus { features: model.features(), ..DeviceStatus::default() }),
        None => Err(DecodeError::Incomplete),
    }
}
