//! Occupancy-threshold calibration for photoresistor-array chessboards.
//!
//! A 64-channel board (one photoresistor per square) is reachable over a
//! serial link and answers single-byte commands with newline-framed CSV.
//! This crate drives a calibration session against it: average an empty
//! baseline, capture one occupied reading per channel (operator-prompted or
//! auto-detected by light drop), compute per-channel midpoint thresholds,
//! and push them back in whichever mode the firmware is running.
//!
//! The session is single-threaded and fully blocking; a [`CancelToken`] is
//! threaded through every blocking wait so a supervisor can abort mid-run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod board;
pub mod errors;
pub mod logging;
pub mod session;
pub mod square;
pub mod threshold;
pub mod transport;

pub use board::{Board, Mode, RetryPolicy, ThresholdSet};
pub use errors::{CalError, Result};
pub use session::{
    average_baseline, AutoDetectParams, CalibrationReport, CalibrationSession, DetectionStrategy,
    FeedbackCue, Prompter, SessionConfig, SessionState,
};
pub use square::{parse_square_list, Square};
pub use transport::{SerialTransport, Transport};

/// Number of sensor channels, one per board square.
pub const CHANNEL_COUNT: usize = 64;

/// One atomic ADC reading of all channels, produced by a single exchange.
pub type Snapshot = [u16; CHANNEL_COUNT];

/// Sleep granularity for cancellable waits.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag shared with whatever supervises a session.
///
/// Retry sleeps, settle windows and removal polling all check the token, so
/// an operator can abort without waiting out the full retry budget.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CalError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep in short slices so a cancel is noticed promptly.
    pub(crate) fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}
