use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::PlayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    pub fn from_start_end(start: u64, end_inclusive: u64) -> Self {
        Self {
            offset: start,
            length: Some(end_inclusive.saturating_sub(start) + 1),
        }
    }

    pub fn end_inclusive(&self) -> Option<u64> {
        self.length.map(|length| self.offset + length - 1)
    }

    pub fn to_http_range(&self) -> String {
        format!("bytes={self}")
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end_inclusive() {
            Some(end) => write!(f, "{}-{}", self.offset, end),
            None => write!(f, "{}-", self.offset),
        }
    }
}

/// Parses a single `first-last` byte-range-spec (RFC 7233, 2.1). The last byte position may be
/// omitted.
impl FromStr for ByteRange {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PlayerError::MpdParsing(format!("Invalid byte range: {s}"));
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;

        let first_byte_pos = start.parse::<u64>().map_err(|_| invalid())?;
        let last_byte_pos = match end {
            "" => None,
            end => Some(end.parse::<u64>().map_err(|_| invalid())?),
        };
        if matches!(last_byte_pos, Some(last) if last < first_byte_pos) {
            return Err(invalid());
        }

        Ok(ByteRange {
            offset: first_byte_pos,
            // 0 - 500 means 501 bytes
            length: last_byte_pos.map(|last_byte_pos| last_byte_pos - first_byte_pos + 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_http_range() {
        let range = ByteRange::new(10, Some(10));
        assert_eq!(range.to_http_range(), "bytes=10-19");

        let range = ByteRange::new(10, None);
        assert_eq!(range.to_http_range(), "bytes=10-");
    }

    #[test]
    fn test_parse() {
        let range: ByteRange = "0-500".parse().unwrap();
        assert_eq!(range, ByteRange::new(0, Some(501)));
        let range: ByteRange = "862-".parse().unwrap();
        assert_eq!(range, ByteRange::new(862, None));
        assert!("abc".parse::<ByteRange>().is_err());
        assert!("10-5".parse::<ByteRange>().is_err());
    }
}
