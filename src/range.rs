//! `Range` request header parsing.
//!
//! Only a single `bytes=<start>-[<end>]` range is understood.

use std::str::FromStr;

use crate::Error;

/// A single byte range as requested by a client. `end` is inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Number of bytes the client asked for against an archive of `size` bytes,
    /// before any clamping to the archive's end.
    pub fn requested_len(&self, size: u64) -> u64 {
        match self.end {
            Some(end) => end.saturating_sub(self.start).saturating_add(1),
            None => size.saturating_sub(self.start),
        }
    }
}

impl FromStr for ByteRange {
    type Err = Error;

    fn from_str(header: &str) -> Result<ByteRange, Error> {
        let malformed = || Error::MalformedRangeHeader(header.to_string());

        let byte_range = header.trim().strip_prefix("bytes=").ok_or_else(malformed)?;
        let (start, end) = byte_range.split_once('-').ok_or_else(malformed)?;

        let start = parse_position(start).ok_or_else(malformed)?;
        let end = match end.trim() {
            "" => None,
            end => Some(parse_position(end).ok_or_else(malformed)?),
        };
        if matches!(end, Some(end) if end < start) {
            return Err(malformed());
        }

        Ok(ByteRange { start, end })
    }
}

// Digits only: no signs, no suffix ranges, no range lists.
fn parse_position(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(header: &str) -> Result<ByteRange, Error> {
        header.parse()
    }

    #[test]
    fn test_parse_bounded_range() {
        let range = parse("bytes=0-99").unwrap();
        assert_eq!(ByteRange { start: 0, end: Some(99) }, range);
        assert_eq!(100, range.requested_len(1000));

        let range = parse("bytes=990-1020").unwrap();
        assert_eq!(31, range.requested_len(1000));
    }

    #[test]
    fn test_parse_open_range() {
        let range = parse("bytes=500-").unwrap();
        assert_eq!(ByteRange { start: 500, end: None }, range);
        assert_eq!(500, range.requested_len(1000));
        assert_eq!(0, range.requested_len(100));
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        assert_eq!(
            ByteRange { start: 5, end: Some(9) },
            parse(" bytes=5 - 9 ").unwrap()
        );
    }

    #[test]
    fn test_parse_malformed() {
        for header in [
            "bytes=invalid",
            "bytes=",
            "bytes=-",
            "bytes=-500",
            "bytes=10-5",
            "bytes=0-1,5-6",
            "bytes=+1-2",
            "bytes=-1-2",
            "items=0-10",
            "0-10",
            "bytes=18446744073709551616-",
        ] {
            match parse(header) {
                Err(Error::MalformedRangeHeader(value)) => assert_eq!(header, value),
                other => panic!("{:?} should be malformed, got {:?}", header, other),
            }
        }
    }
}
