//! Channel-to-square mapping.
//!
//! Channels are indexed 0..64 in rank-major order: A1, B1, ..., H1, A2, ...,
//! H8. The mapping is fixed for a session; baseline capture, occupancy
//! detection and threshold push all address the same physical square through
//! the same index.

use std::fmt;
use std::str::FromStr;

use crate::errors::{CalError, Result};
use crate::CHANNEL_COUNT;

pub const FILES: [char; 8] = ['A', 'B', 'C', 'D', 'E', 'F', 'G', 'H'];

/// One board square, file 0..8 (A..H) and rank 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square {
    file: u8,
    rank: u8,
}

impl Square {
    pub fn new(file: u8, rank: u8) -> Option<Self> {
        if file < 8 && (1..=8).contains(&rank) {
            Some(Self { file, rank })
        } else {
            None
        }
    }

    /// Rank-major channel index: `(rank - 1) * 8 + file`.
    pub fn index(self) -> usize {
        (self.rank as usize - 1) * 8 + self.file as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        if index < CHANNEL_COUNT {
            Some(Self {
                file: (index % 8) as u8,
                rank: (index / 8 + 1) as u8,
            })
        } else {
            None
        }
    }

}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", FILES[self.file as usize], self.rank)
    }
}

impl FromStr for Square {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CalError::InvalidSquare(s.to_string());
        let mut chars = s.trim().chars();
        let file_char = chars.next().ok_or_else(invalid)?.to_ascii_uppercase();
        let file = FILES
            .iter()
            .position(|&f| f == file_char)
            .ok_or_else(invalid)? as u8;
        let rank: u8 = chars.as_str().parse().map_err(|_| invalid())?;
        Square::new(file, rank).ok_or_else(invalid)
    }
}

/// Parse a comma-separated square list like `a1,c4,d5`, dropping duplicates
/// while preserving first-seen order.
pub fn parse_square_list(raw: &str) -> Result<Vec<Square>> {
    let mut squares: Vec<Square> = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let square: Square = token.parse()?;
        if !squares.contains(&square) {
            squares.push(square);
        }
    }
    Ok(squares)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn index_is_a_bijection_over_all_squares() {
        let mut seen = HashSet::new();
        for rank in 1..=8u8 {
            for file in 0..8u8 {
                let square = Square::new(file, rank).unwrap();
                let index = square.index();
                assert!(index < CHANNEL_COUNT);
                assert!(seen.insert(index), "index {index} mapped twice");
                assert_eq!(Square::from_index(index), Some(square));
            }
        }
        assert_eq!(seen.len(), CHANNEL_COUNT);
    }

    #[test]
    fn rank_major_order() {
        assert_eq!("A1".parse::<Square>().unwrap().index(), 0);
        assert_eq!("H1".parse::<Square>().unwrap().index(), 7);
        assert_eq!("A2".parse::<Square>().unwrap().index(), 8);
        assert_eq!("H8".parse::<Square>().unwrap().index(), 63);
    }

    #[test]
    fn parses_lower_and_upper_case() {
        assert_eq!(
            "c4".parse::<Square>().unwrap(),
            "C4".parse::<Square>().unwrap()
        );
        assert_eq!("c4".parse::<Square>().unwrap().to_string(), "C4");
    }

    #[test]
    fn rejects_invalid_squares() {
        for bad in ["", "i1", "a0", "a9", "a", "11", "a1b"] {
            assert!(bad.parse::<Square>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn list_parsing_dedups_preserving_order() {
        let squares = parse_square_list("a1, c4 ,A1,d5,").unwrap();
        let labels: Vec<String> = squares.iter().map(Square::to_string).collect();
        assert_eq!(labels, vec!["A1", "C4", "D5"]);
    }

    #[test]
    fn list_parsing_rejects_bad_tokens() {
        assert!(parse_square_list("a1,z9").is_err());
    }
}
