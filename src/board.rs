//! Wire-protocol driver for the photoresistor board.
//!
//! The board answers single-byte commands with newline-framed ASCII:
//! `?` returns one CSV line of 64 ADC values, `!` returns the configured
//! threshold(s) (one value in global mode, 64 in per-channel mode), `c`
//! enters calibration mode and expects a threshold payload line, and `q`
//! toggles quiet mode (suppression of unsolicited periodic broadcasts).
//!
//! Retry policy lives here: each request resets the input buffer, resends
//! the command, and reads until a well-formed line arrives or the attempt
//! times out. Malformed lines are discarded without consuming an attempt;
//! only a full timeout does.

use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;

use crate::errors::{CalError, Result};
use crate::transport::Transport;
use crate::{CancelToken, Snapshot, CHANNEL_COUNT};

pub const CMD_SNAPSHOT: u8 = b'?';
pub const CMD_THRESHOLDS: u8 = b'!';
pub const CMD_CALIBRATE: u8 = b'c';
pub const CMD_QUIET: u8 = b'q';

/// Delay after entering calibration mode before the payload is sent.
const CALIBRATE_SETTLE: Duration = Duration::from_millis(100);

/// Delay after the payload for the device to apply and persist it.
const CALIBRATE_APPLY: Duration = Duration::from_millis(200);

/// Upper bound on a single blocking read, so cancellation is noticed
/// while waiting out an attempt timeout.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Which threshold scheme the firmware is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    /// One threshold shared by all 64 channels.
    Global,
    /// 64 independent thresholds.
    PerChannel,
}

/// Threshold(s) as reported by or pushed to the device, tagged with the
/// mode that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThresholdSet {
    Global(u16),
    PerChannel([u16; CHANNEL_COUNT]),
}

impl ThresholdSet {
    pub fn mode(&self) -> Mode {
        match self {
            ThresholdSet::Global(_) => Mode::Global,
            ThresholdSet::PerChannel(_) => Mode::PerChannel,
        }
    }
}

/// Retry budget for request/response exchanges.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a request fails with a timeout error.
    pub attempts: u32,
    /// How long one attempt waits for a well-formed line.
    pub attempt_timeout: Duration,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Board driver. Owns the transport exclusively for the session.
pub struct Board<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl<T: Transport> Board<T> {
    pub fn new(transport: T) -> Self {
        Self::with_policy(transport, RetryPolicy::default())
    }

    pub fn with_policy(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            cancel: CancelToken::new(),
        }
    }

    /// Share a cancellation token so blocking waits can be aborted.
    pub fn set_cancel(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    /// Request one 64-value ADC snapshot.
    pub fn request_snapshot(&mut self) -> Result<Snapshot> {
        let attempts = self.policy.attempts;
        for attempt in 1..=attempts {
            match self.exchange(CMD_SNAPSHOT, |n| n == CHANNEL_COUNT) {
                Ok(Some(values)) => {
                    let mut snapshot = [0u16; CHANNEL_COUNT];
                    snapshot.copy_from_slice(&values);
                    return Ok(snapshot);
                }
                Ok(None) => {}
                Err(CalError::Cancelled) => return Err(CalError::Cancelled),
                Err(e) => warn!("transient serial error during snapshot: {e}"),
            }
            if attempt < attempts {
                warn!("snapshot attempt {attempt}/{attempts} timed out, retrying");
                self.cancel.sleep(self.policy.retry_delay)?;
            }
        }
        Err(CalError::SnapshotTimeout { attempts })
    }

    /// Request the currently configured threshold(s). The field count of the
    /// response signals the firmware mode: 1 value means global, 64 mean
    /// per-channel. Any other count is discarded as malformed.
    pub fn request_thresholds(&mut self) -> Result<ThresholdSet> {
        let attempts = self.policy.attempts;
        for attempt in 1..=attempts {
            match self.exchange(CMD_THRESHOLDS, |n| n == 1 || n == CHANNEL_COUNT) {
                Ok(Some(values)) => {
                    if values.len() == 1 {
                        return Ok(ThresholdSet::Global(values[0]));
                    }
                    let mut thresholds = [0u16; CHANNEL_COUNT];
                    thresholds.copy_from_slice(&values);
                    return Ok(ThresholdSet::PerChannel(thresholds));
                }
                Ok(None) => {}
                Err(CalError::Cancelled) => return Err(CalError::Cancelled),
                Err(e) => warn!("transient serial error during threshold read: {e}"),
            }
            if attempt < attempts {
                warn!("threshold read attempt {attempt}/{attempts} timed out, retrying");
                self.cancel.sleep(self.policy.retry_delay)?;
            }
        }
        Err(CalError::ThresholdReadTimeout { attempts })
    }

    /// Enter calibration mode and write a single global threshold.
    pub fn push_global(&mut self, value: u16) -> Result<()> {
        self.enter_calibration()?;
        self.transport.send(format!("{value}\n").as_bytes())?;
        std::thread::sleep(CALIBRATE_APPLY);
        debug!("pushed global threshold {value}");
        Ok(())
    }

    /// Enter calibration mode and write all 64 per-channel thresholds as one
    /// comma-separated line.
    pub fn push_individual(&mut self, values: &[u16; CHANNEL_COUNT]) -> Result<()> {
        self.enter_calibration()?;
        let line = values
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.transport.send(format!("{line}\n").as_bytes())?;
        std::thread::sleep(CALIBRATE_APPLY);
        debug!("pushed {CHANNEL_COUNT} per-channel thresholds");
        Ok(())
    }

    /// Toggle suppression of unsolicited periodic broadcasts. No response is
    /// expected.
    pub fn toggle_quiet(&mut self) -> Result<()> {
        self.transport.send(&[CMD_QUIET])
    }

    fn enter_calibration(&mut self) -> Result<()> {
        self.transport.reset_input_buffer()?;
        self.transport.send(&[CMD_CALIBRATE])?;
        std::thread::sleep(CALIBRATE_SETTLE);
        Ok(())
    }

    /// One request/response attempt: reset stale input, send the command,
    /// read lines until one parses with an accepted field count or the
    /// attempt timeout expires. `Ok(None)` means the attempt timed out.
    fn exchange(&mut self, cmd: u8, accept: fn(usize) -> bool) -> Result<Option<Vec<u16>>> {
        self.cancel.check()?;
        self.transport.reset_input_buffer()?;
        self.transport.send(&[cmd])?;

        let deadline = Instant::now() + self.policy.attempt_timeout;
        loop {
            self.cancel.check()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.transport.read_line(remaining.min(READ_SLICE)) {
                Ok(Some(line)) => match parse_csv(&line, accept) {
                    Some(values) => return Ok(Some(values)),
                    None => debug!("discarding malformed response: {line:?}"),
                },
                Ok(None) => {}
                Err(e) => warn!("read error while waiting for response: {e}"),
            }
        }
    }
}

/// Parse a CSV line of unsigned values, or `None` if the field count is not
/// accepted or any token fails to parse.
fn parse_csv(line: &str, accept: fn(usize) -> bool) -> Option<Vec<u16>> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    if !accept(fields.len()) {
        return None;
    }
    fields
        .iter()
        .map(|f| f.trim().parse::<u16>().ok())
        .collect()
}
