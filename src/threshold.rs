//! Threshold arithmetic.
//!
//! Two different roundings live here on purpose: the per-channel midpoint
//! truncates while the global aggregate rounds to nearest. The firmware was
//! calibrated against exactly these values, so neither is unified with the
//! other.

use crate::errors::{CalError, Result};
use crate::CHANNEL_COUNT;

/// Midpoint between a baseline and an occupied reading, truncated:
/// `floor((max + min) / 2)`. Symmetric in its arguments, and
/// `midpoint(x, x) == x`.
pub fn midpoint(a: u16, b: u16) -> u16 {
    ((a as u32 + b as u32) / 2) as u16
}

/// Derive a single global threshold from a per-channel set: the mean of all
/// strictly positive entries, rounded to nearest. Zero entries mark channels
/// that were never calibrated and are excluded; if every entry is zero there
/// is nothing to aggregate.
pub fn global_from_per_channel(thresholds: &[u16; CHANNEL_COUNT]) -> Result<u16> {
    let positive: Vec<u32> = thresholds
        .iter()
        .filter(|&&t| t > 0)
        .map(|&t| t as u32)
        .collect();
    if positive.is_empty() {
        return Err(CalError::NoThresholdsCollected);
    }
    let mean = positive.iter().sum::<u32>() as f64 / positive.len() as f64;
    Ok(mean.round() as u16)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn midpoint_is_symmetric() {
        for (a, b) in [(0u16, 1023u16), (300, 120), (1, 2), (0, 0)] {
            assert_eq!(midpoint(a, b), midpoint(b, a));
        }
    }

    #[test]
    fn midpoint_of_equal_inputs_is_that_value() {
        for x in [0u16, 1, 511, 1023] {
            assert_eq!(midpoint(x, x), x);
        }
    }

    #[test]
    fn midpoint_truncates() {
        assert_eq!(midpoint(300, 121), 210); // 421 / 2
        assert_eq!(midpoint(0, 1), 0);
    }

    #[test]
    fn global_ignores_zero_entries_and_rounds() {
        let mut thresholds = [0u16; CHANNEL_COUNT];
        thresholds[1] = 40;
        thresholds[3] = 60;
        assert_eq!(global_from_per_channel(&thresholds).unwrap(), 50);

        thresholds[5] = 51; // mean 50.333 rounds down
        assert_eq!(global_from_per_channel(&thresholds).unwrap(), 50);
    }

    #[test]
    fn global_of_all_zeros_is_an_error() {
        match global_from_per_channel(&[0u16; CHANNEL_COUNT]) {
            Err(CalError::NoThresholdsCollected) => {}
            other => panic!("expected NoThresholdsCollected, got {other:?}"),
        }
    }
}
