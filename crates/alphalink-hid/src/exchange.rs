//! Query/response exchanges with the headset.
//!
//! A status poll asks for the link state first and only asks for the rest
//! when the headset is linked. Every raw report read along the way is kept
//! and folded into one snapshot at the end, so an unsolicited link change
//! that arrives mid-poll still wins.

use std::time::Duration;

use alphalink_core::codec::{self, Query, Report};
use alphalink_core::{CompatibleModel, DeviceStatus, PendingCommand, PollFailure, TransportError};
use tracing::{debug, trace};

use crate::transport::DeviceIo;

/// Reports read while waiting for one answer before giving up.
const MAX_REPORTS_PER_QUERY: usize = 8;

/// Read timeouts for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    /// Wait for the mic monitor answer, which some firmware never sends
    pub mic_query: Duration,
}

impl Timeouts {
    #[must_use]
    pub const fn uniform(timeout: Duration) -> Self {
        Self { read: timeout, mic_query: timeout }
    }
}

fn echo_query(command: &PendingCommand) -> Query {
    match command {
        PendingCommand::SetSleepTimer(_) => Query::SleepTimer,
        PendingCommand::ToggleVoicePrompt(_) => Query::VoicePrompt,
        PendingCommand::ToggleMicMonitor(_) => Query::MicMonitor,
    }
}

/// Read until a report answering `query` arrives, appending every report
/// read to `reports`.
fn read_answer<I: DeviceIo + ?Sized>(
    io: &mut I,
    model: &CompatibleModel,
    query: Query,
    timeout: Duration,
    reports: &mut Vec<Vec<u8>>,
) -> Result<(), PollFailure> {
    for _ in 0..MAX_REPORTS_PER_QUERY {
        let raw = io.read(timeout)?;
        let report = codec::decode_report(&raw, model)?;
        trace!(?report, "Read report");
        reports.push(raw);
        if report.answers(query) {
            return Ok(());
        }
    }
    Err(TransportError::Timeout.into())
}

fn ask<I: DeviceIo + ?Sized>(
    io: &mut I,
    model: &CompatibleModel,
    query: Query,
    timeout: Duration,
    reports: &mut Vec<Vec<u8>>,
) -> Result<(), PollFailure> {
    io.write(&codec::encode_query(query, model))?;
    read_answer(io, model, query, timeout, reports)
}

fn poll_into<I: DeviceIo + ?Sized>(
    io: &mut I,
    model: &CompatibleModel,
    timeouts: Timeouts,
    mut reports: Vec<Vec<u8>>,
) -> Result<DeviceStatus, PollFailure> {
    ask(io, model, Query::Connection, timeouts.read, &mut reports)?;

    let linked = reports
        .iter()
        .rev()
        .find_map(|raw| match codec::decode_report(raw, model) {
            Ok(Report::Connection(c)) => Some(c),
            _ => None,
        })
        .unwrap_or(false);

    if linked {
        for query in codec::follow_up_queries(model) {
            if query != Query::MicMonitor {
                ask(io, model, query, timeouts.read, &mut reports)?;
                continue;
            }
            match ask(io, model, query, timeouts.mic_query, &mut reports) {
                Ok(()) => {}
                // Status stays valid; the mic state is just unknown
                Err(PollFailure::Transport(TransportError::Timeout)) => {
                    debug!(path = io.path(), "Mic monitor query unanswered");
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(codec::decode_status(&reports, model)?)
}

/// Run one full status poll.
///
/// An unanswered mic monitor query is tolerated and leaves
/// [`DeviceStatus::mic_monitor_known`] unset.
///
/// # Errors
/// Returns a [`PollFailure`] if any other query fails or any report is
/// invalid; no partial status is ever returned.
pub fn poll_status<I: DeviceIo + ?Sized>(
    io: &mut I,
    model: &CompatibleModel,
    timeouts: Timeouts,
) -> Result<DeviceStatus, PollFailure> {
    poll_into(io, model, timeouts, Vec::new())
}

/// Send a command and poll the resulting status.
///
/// The echo the headset sends back is folded into the status before the
/// confirming poll, so models that cannot be queried for a setting still
/// report it. Whether the command took effect is for the caller to judge
/// from the returned status.
///
/// # Errors
/// Returns a [`PollFailure`] if the write or the confirming poll fails.
pub fn send_command<I: DeviceIo + ?Sized>(
    io: &mut I,
    model: &CompatibleModel,
    command: &PendingCommand,
    timeouts: Timeouts,
) -> Result<DeviceStatus, PollFailure> {
    io.write(&codec::encode_command(command, model))?;

    let mut reports = Vec::new();
    match read_answer(io, model, echo_query(command), timeouts.read, &mut reports) {
        Ok(()) | Err(PollFailure::Transport(TransportError::Timeout)) => {}
        Err(e) => return Err(e),
    }

    poll_into(io, model, timeouts, reports)
}
