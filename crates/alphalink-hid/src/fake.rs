//! In-memory headset and device bus for tests.
//!
//! [`FakeHeadset`] answers queries and applies commands the way the real
//! firmware does, and can be told to misbehave: fail opens, swallow reads,
//! ignore queries or commands, or vanish and come back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use alphalink_core::codec::{INPUT_REPORT_CAPACITY, code};
use alphalink_core::{EnumerationError, SleepTimer, TransportError};
use parking_lot::Mutex;

use crate::enumerator::{DeviceScanner, HidDeviceEntry};
use crate::transport::{DeviceIo, Transport};

const MARKER: [u8; 2] = [0x21, 0xbb];

/// What the simulated headset currently reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadsetState {
    pub linked: bool,
    pub battery: u8,
    pub sleep_timer: SleepTimer,
    pub voice_prompt: bool,
    pub mic_monitor: bool,
}

impl Default for HeadsetState {
    fn default() -> Self {
        Self {
            linked: true,
            battery: 80,
            sleep_timer: SleepTimer::Minutes20,
            voice_prompt: true,
            mic_monitor: false,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: HeadsetState,
    pending: VecDeque<Vec<u8>>,
    open_failures: VecDeque<TransportError>,
    read_failures: u32,
    unplugged: bool,
    ignore_commands: bool,
    ignore_mic_query: bool,
    writes: Vec<Vec<u8>>,
    opens: u32,
}

fn report(code: u8, value: u8) -> Vec<u8> {
    let mut raw = vec![0u8; INPUT_REPORT_CAPACITY];
    raw[..2].copy_from_slice(&MARKER);
    raw[2] = code;
    raw[3] = value;
    raw
}

impl Shared {
    fn respond(&mut self, out: &[u8]) {
        if out.len() < 4 || out[..2] != MARKER {
            return;
        }
        let (c, value) = (out[2], out[3]);
        if c == code::MIC_MONITOR && self.ignore_mic_query {
            return;
        }
        let s = &mut self.state;
        let answer = match c {
            code::CONNECTION => Some(if s.linked { 0x02 } else { 0x01 }),
            code::BATTERY => Some(s.battery),
            code::SLEEP_TIMER => Some(s.sleep_timer.to_wire()),
            code::VOICE_PROMPT => Some(u8::from(s.voice_prompt)),
            code::MIC_MONITOR => Some(u8::from(s.mic_monitor)),
            _ => None,
        };
        if let Some(answer) = answer {
            self.pending.push_back(report(c, answer));
            return;
        }

        if self.ignore_commands {
            return;
        }
        let applied = match c {
            code::SET_SLEEP_TIMER => SleepTimer::from_wire(value).map(|t| s.sleep_timer = t).is_some(),
            code::SET_VOICE_PROMPT => {
                s.voice_prompt = value != 0;
                true
            }
            code::SET_MIC_MONITOR => {
                s.mic_monitor = value != 0;
                true
            }
            _ => false,
        };
        if applied {
            self.pending.push_back(report(c, value));
        }
    }
}

/// A scripted headset. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeHeadset {
    path: String,
    shared: Arc<Mutex<Shared>>,
}

impl FakeHeadset {
    #[must_use]
    pub fn new(state: HeadsetState) -> Self {
        Self::at("/dev/hidraw3", state)
    }

    #[must_use]
    pub fn at(path: &str, state: HeadsetState) -> Self {
        let shared = Shared { state, ..Shared::default() };
        Self { path: path.to_string(), shared: Arc::new(Mutex::new(shared)) }
    }

    /// A handle that bypasses [`Transport::open`].
    #[must_use]
    pub fn io(&self) -> FakeIo {
        FakeIo { path: self.path.clone(), shared: Arc::clone(&self.shared) }
    }

    #[must_use]
    pub fn state(&self) -> HeadsetState {
        self.shared.lock().state.clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut HeadsetState)) {
        f(&mut self.shared.lock().state);
    }

    /// Push an unsolicited link-change report.
    pub fn announce_link(&self, linked: bool) {
        let mut shared = self.shared.lock();
        shared.state.linked = linked;
        shared.pending.push_back(report(code::CONNECTION_CHANGED, if linked { 0x02 } else { 0x01 }));
    }

    /// Fail the next opens with `error`, `count` times.
    pub fn fail_opens(&self, error: TransportError, count: usize) {
        let mut shared = self.shared.lock();
        shared.open_failures.extend(std::iter::repeat_n(error, count));
    }

    /// Time out the next `count` reads.
    pub fn fail_reads(&self, count: u32) {
        self.shared.lock().read_failures = count;
    }

    pub fn ignore_commands(&self, ignore: bool) {
        self.shared.lock().ignore_commands = ignore;
    }

    /// Leave mic monitor queries unanswered, as some firmware does.
    pub fn ignore_mic_query(&self, ignore: bool) {
        self.shared.lock().ignore_mic_query = ignore;
    }

    /// Make every open, read and write fail as if the device was removed.
    pub fn unplug(&self) {
        let mut shared = self.shared.lock();
        shared.unplugged = true;
        shared.pending.clear();
    }

    /// Undo [`unplug`](Self::unplug).
    pub fn replug(&self) {
        self.shared.lock().unplugged = false;
    }

    /// Every report written so far.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.lock().writes.clone()
    }

    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.shared.lock().opens
    }
}

impl Transport for FakeHeadset {
    type Io = FakeIo;

    fn open(&self, path: &str) -> Result<FakeIo, TransportError> {
        let mut shared = self.shared.lock();
        shared.opens += 1;
        if shared.unplugged {
            return Err(TransportError::NotFound(path.to_string()));
        }
        if let Some(error) = shared.open_failures.pop_front() {
            return Err(error);
        }
        shared.pending.clear();
        Ok(FakeIo { path: path.to_string(), shared: Arc::clone(&self.shared) })
    }
}

/// Open handle to a [`FakeHeadset`].
#[derive(Debug)]
pub struct FakeIo {
    path: String,
    shared: Arc<Mutex<Shared>>,
}

impl DeviceIo for FakeIo {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, report: &[u8]) -> Result<(), TransportError> {
        let mut shared = self.shared.lock();
        if shared.unplugged {
            return Err(TransportError::Disconnected);
        }
        shared.writes.push(report.to_vec());
        shared.respond(report);
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut shared = self.shared.lock();
        if shared.unplugged {
            return Err(TransportError::Disconnected);
        }
        if shared.read_failures > 0 {
            shared.read_failures -= 1;
            return Err(TransportError::Timeout);
        }
        shared.pending.pop_front().ok_or(TransportError::Timeout)
    }
}

/// A device bus whose listing is set by the test.
#[derive(Debug, Clone)]
pub struct FakeBus {
    listing: Arc<Mutex<Result<Vec<HidDeviceEntry>, EnumerationError>>>,
}

impl Default for FakeBus {
    fn default() -> Self {
        Self { listing: Arc::new(Mutex::new(Ok(Vec::new()))) }
    }
}

impl FakeBus {
    /// A Cloud Alpha Wireless dongle entry on its control interface.
    #[must_use]
    pub fn alpha_entry(path: &str, serial: Option<&str>) -> HidDeviceEntry {
        HidDeviceEntry {
            path: path.to_string(),
            vendor_id: 0x03f0,
            product_id: 0x098d,
            interface_number: 3,
            serial_number: serial.map(str::to_string),
            product_string: Some("HyperX Cloud Alpha Wireless".to_string()),
        }
    }

    pub fn set(&self, entries: Vec<HidDeviceEntry>) {
        *self.listing.lock() = Ok(entries);
    }

    pub fn fail(&self, error: EnumerationError) {
        *self.listing.lock() = Err(error);
    }
}

impl DeviceScanner for FakeBus {
    fn scan(&self) -> Result<Vec<HidDeviceEntry>, EnumerationError> {
        self.listing.lock().clone()
    }
}
