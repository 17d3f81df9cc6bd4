//! Calibration session: baseline averaging, occupancy capture, threshold
//! computation and push, driven as one linear state machine.
//!
//! The session owns the board driver (and through it the transport) for its
//! whole lifetime. Operator interaction goes through the injected
//! [`Prompter`] and [`FeedbackCue`] capabilities; the session itself never
//! reads the console or owns playback state.

use std::io;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::board::{Board, Mode, ThresholdSet};
use crate::errors::{CalError, Result};
use crate::square::Square;
use crate::threshold;
use crate::transport::Transport;
use crate::{CancelToken, Snapshot, CHANNEL_COUNT};

/// Operator confirmation gate. Each call blocks until the operator
/// acknowledges the message.
pub trait Prompter {
    fn confirm(&mut self, message: &str) -> io::Result<()>;
}

/// Signalled after each completed capture so the surrounding tool can give
/// audible or visual feedback. The session never owns playback state.
pub trait FeedbackCue {
    fn capture_complete(&mut self);
}

/// How one occupied reading per channel is obtained.
#[derive(Debug, Clone)]
pub enum DetectionStrategy {
    /// The operator confirms placement; one snapshot is taken per group.
    Manual,
    /// Placement is detected by the ADC drop below baseline; channels are
    /// worked one at a time.
    Auto(AutoDetectParams),
}

/// Tuning for automatic drop detection.
#[derive(Debug, Clone)]
pub struct AutoDetectParams {
    /// ADC drop below baseline that counts as a placed piece.
    pub drop_threshold: u16,
    /// How long to keep sampling after detection, tracking the minimum.
    pub settle_window: Duration,
    /// Pause between polling snapshots.
    pub poll_interval: Duration,
    /// ADC distance from baseline under which the channel counts as cleared.
    pub removal_tolerance: u16,
}

impl Default for AutoDetectParams {
    fn default() -> Self {
        Self {
            drop_threshold: 50,
            settle_window: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            removal_tolerance: 30,
        }
    }
}

/// Session parameters, owned by the CLI layer and passed in.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Snapshots averaged into the baseline.
    pub samples: u32,
    /// Delay between baseline snapshots, to avoid flooding the device.
    pub sample_delay: Duration,
    /// Squares to calibrate; empty means the whole board, rank by rank.
    pub restrict: Vec<Square>,
    pub strategy: DetectionStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            samples: 15,
            sample_delay: Duration::from_millis(50),
            restrict: Vec::new(),
            strategy: DetectionStrategy::Manual,
        }
    }
}

/// Where a session currently is. `Done` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    QuietModeOn,
    BaselineCapture,
    AwaitPlacement,
    Capture,
    AwaitRemoval,
    Calibrated,
    Push,
    QuietModeOff,
    Done,
    Aborted,
}

/// Everything a finished session learned, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub mode: Mode,
    pub baseline: Vec<u16>,
    pub occupied: Vec<u16>,
    pub thresholds: Vec<u16>,
    /// Aggregate pushed to the device in global mode.
    pub global: Option<u16>,
}

/// Average `samples` snapshots into a per-channel baseline. The mean is
/// truncated toward zero, not rounded; the firmware expects exactly this.
pub fn average_baseline<T: Transport>(
    board: &mut Board<T>,
    samples: u32,
    delay: Duration,
    cancel: &CancelToken,
) -> Result<Snapshot> {
    if samples == 0 {
        return Err(CalError::Config(
            "baseline sample count must be at least 1".into(),
        ));
    }
    let mut sums = [0u64; CHANNEL_COUNT];
    for _ in 0..samples {
        let snapshot = board.request_snapshot()?;
        for (sum, value) in sums.iter_mut().zip(snapshot.iter()) {
            *sum += u64::from(*value);
        }
        cancel.sleep(delay)?;
    }
    let mut baseline = [0u16; CHANNEL_COUNT];
    for (value, sum) in baseline.iter_mut().zip(sums.iter()) {
        *value = (sum / u64::from(samples)) as u16;
    }
    Ok(baseline)
}

/// Poll until the reading on `index` drops below baseline by more than the
/// drop threshold, then keep sampling for the settle window and return the
/// minimum seen. The minimum captures the strongest occlusion while the
/// piece settles, not just the detection instant.
pub fn detect_occupied<T: Transport>(
    board: &mut Board<T>,
    index: usize,
    baseline: u16,
    params: &AutoDetectParams,
    cancel: &CancelToken,
) -> Result<u16> {
    let mut value = loop {
        let snapshot = board.request_snapshot()?;
        let v = snapshot[index];
        if baseline.saturating_sub(v) > params.drop_threshold {
            debug!("channel {index}: piece detected at {v} (baseline {baseline})");
            break v;
        }
        cancel.sleep(params.poll_interval)?;
    };

    let deadline = Instant::now() + params.settle_window;
    while Instant::now() < deadline {
        let snapshot = board.request_snapshot()?;
        value = value.min(snapshot[index]);
        cancel.sleep(params.poll_interval)?;
    }
    Ok(value)
}

/// Block until the reading on `index` returns to within the removal
/// tolerance of baseline, i.e. the operator cleared the channel.
pub fn wait_for_removal<T: Transport>(
    board: &mut Board<T>,
    index: usize,
    baseline: u16,
    params: &AutoDetectParams,
    cancel: &CancelToken,
) -> Result<()> {
    loop {
        let snapshot = board.request_snapshot()?;
        if snapshot[index].abs_diff(baseline) < params.removal_tolerance {
            return Ok(());
        }
        cancel.sleep(params.poll_interval)?;
    }
}

/// One calibration run against one board.
pub struct CalibrationSession<'a, T: Transport> {
    board: Board<T>,
    config: SessionConfig,
    cancel: CancelToken,
    prompter: &'a mut dyn Prompter,
    cue: &'a mut dyn FeedbackCue,
    state: SessionState,
}

impl<'a, T: Transport> CalibrationSession<'a, T> {
    pub fn new(
        mut board: Board<T>,
        config: SessionConfig,
        cancel: CancelToken,
        prompter: &'a mut dyn Prompter,
        cue: &'a mut dyn FeedbackCue,
    ) -> Self {
        board.set_cancel(cancel.clone());
        Self {
            board,
            config,
            cancel,
            prompter,
            cue,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn board(&self) -> &Board<T> {
        &self.board
    }

    /// Run the whole session. Fatal errors abort and leave the transport to
    /// drop with the session; quiet-mode toggles and the final push are
    /// best-effort and only warn.
    pub fn run(&mut self) -> Result<CalibrationReport> {
        self.transition(SessionState::QuietModeOn);
        if let Err(e) = self.board.toggle_quiet() {
            warn!("could not enable quiet mode: {e}");
        }

        match self.calibrate() {
            Ok(report) => {
                self.transition(SessionState::QuietModeOff);
                if let Err(e) = self.board.toggle_quiet() {
                    warn!("could not disable quiet mode: {e}");
                }
                self.transition(SessionState::Done);
                Ok(report)
            }
            Err(e) => {
                self.transition(SessionState::Aborted);
                Err(e)
            }
        }
    }

    fn calibrate(&mut self) -> Result<CalibrationReport> {
        let (mode, seed) = self.negotiate()?;
        let strategy = self.config.strategy.clone();
        let plan = self.capture_plan(&strategy);

        self.transition(SessionState::BaselineCapture);
        self.prompter
            .confirm("Make sure the board is completely empty, then press Enter...")?;
        info!("collecting baseline readings");
        let baseline = average_baseline(
            &mut self.board,
            self.config.samples,
            self.config.sample_delay,
            &self.cancel,
        )?;
        self.cue.capture_complete();

        let mut occupied = [0u16; CHANNEL_COUNT];
        // A restricted per-channel run keeps the device's current values on
        // untouched channels so the push does not zero them.
        let mut thresholds = match seed {
            Some(current) if !self.config.restrict.is_empty() => current,
            _ => [0u16; CHANNEL_COUNT],
        };

        for group in &plan {
            self.transition(SessionState::AwaitPlacement);
            match &strategy {
                DetectionStrategy::Manual => {
                    self.prompter.confirm(&placement_message(group))?;
                    self.transition(SessionState::Capture);
                    let snapshot = self.board.request_snapshot()?;
                    for &index in group {
                        occupied[index] = snapshot[index];
                    }
                    self.cue.capture_complete();
                    self.log_group(group, &baseline, &occupied);
                    self.transition(SessionState::AwaitRemoval);
                    self.prompter
                        .confirm("Remove the piece(s), then press Enter to continue...")?;
                }
                DetectionStrategy::Auto(params) => {
                    // Auto detection works one channel at a time.
                    let index = group[0];
                    let square = Square::from_index(index).expect("index in range");
                    info!("waiting for a piece on {square}");
                    self.transition(SessionState::Capture);
                    occupied[index] =
                        detect_occupied(&mut self.board, index, baseline[index], params, &self.cancel)?;
                    self.cue.capture_complete();
                    self.log_group(group, &baseline, &occupied);
                    self.transition(SessionState::AwaitRemoval);
                    info!("remove the piece from {square}");
                    wait_for_removal(&mut self.board, index, baseline[index], params, &self.cancel)?;
                }
            }
            for &index in group {
                thresholds[index] = threshold::midpoint(baseline[index], occupied[index]);
            }
        }
        self.transition(SessionState::Calibrated);

        let (set, global) = match mode {
            Mode::Global => {
                let value = threshold::global_from_per_channel(&thresholds)?;
                (ThresholdSet::Global(value), Some(value))
            }
            Mode::PerChannel => (ThresholdSet::PerChannel(thresholds), None),
        };

        self.transition(SessionState::Push);
        let push_result = match &set {
            ThresholdSet::Global(value) => {
                info!("pushing global threshold {value}");
                self.board.push_global(*value)
            }
            ThresholdSet::PerChannel(values) => {
                info!("pushing {CHANNEL_COUNT} per-channel thresholds");
                self.board.push_individual(values)
            }
        };
        // A failed push leaves the measurement intact; only the device's
        // state is unconfirmed.
        if let Err(e) = push_result {
            warn!("failed to push thresholds to board: {e}");
        }

        Ok(CalibrationReport {
            mode,
            baseline: baseline.to_vec(),
            occupied: occupied.to_vec(),
            thresholds: thresholds.to_vec(),
            global,
        })
    }

    /// One threshold query decides the calibration mode. Global firmware
    /// cannot honor a partial recalibration, so a restricted request is
    /// rejected here, before any snapshot is taken.
    fn negotiate(&mut self) -> Result<(Mode, Option<[u16; CHANNEL_COUNT]>)> {
        let current = self.board.request_thresholds()?;
        let mode = current.mode();
        info!("device reports {mode:?} threshold mode");
        if mode == Mode::Global && !self.config.restrict.is_empty() {
            return Err(CalError::UnsupportedModeRequest);
        }
        let seed = match current {
            ThresholdSet::PerChannel(values) => Some(values),
            ThresholdSet::Global(_) => None,
        };
        Ok((mode, seed))
    }

    /// Channel groups in capture order: singleton groups for a restricted
    /// list or auto detection, whole ranks for a full manual run.
    fn capture_plan(&self, strategy: &DetectionStrategy) -> Vec<Vec<usize>> {
        if !self.config.restrict.is_empty() {
            return self
                .config
                .restrict
                .iter()
                .map(|square| vec![square.index()])
                .collect();
        }
        match strategy {
            DetectionStrategy::Manual => (0..8)
                .map(|rank| (rank * 8..(rank + 1) * 8).collect())
                .collect(),
            DetectionStrategy::Auto(_) => (0..CHANNEL_COUNT).map(|index| vec![index]).collect(),
        }
    }

    fn log_group(&self, group: &[usize], baseline: &Snapshot, occupied: &Snapshot) {
        for &index in group {
            let square = Square::from_index(index).expect("index in range");
            info!(
                "{square}: empty {:>4} | occupied {:>4}",
                baseline[index], occupied[index]
            );
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("session state: {:?} -> {next:?}", self.state);
        self.state = next;
    }
}

fn placement_message(group: &[usize]) -> String {
    let first = Square::from_index(group[0]).expect("index in range");
    if group.len() == 1 {
        format!("Place a piece on {first}, then press Enter to capture...")
    } else {
        let last = Square::from_index(group[group.len() - 1]).expect("index in range");
        format!("Place pieces on {first}-{last}, then press Enter to capture...")
    }
}
