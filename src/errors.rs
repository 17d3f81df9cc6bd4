use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("no valid snapshot after {attempts} attempts")]
    SnapshotTimeout { attempts: u32 },
    #[error("no valid threshold response after {attempts} attempts")]
    ThresholdReadTimeout { attempts: u32 },
    #[error("no positive thresholds collected to compute a global value")]
    NoThresholdsCollected,
    #[error("device uses a single global threshold; cannot calibrate a subset of squares")]
    UnsupportedModeRequest,
    #[error("invalid square: {0}")]
    InvalidSquare(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("calibration cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, CalError>;
