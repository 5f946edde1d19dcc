//!
//! Human-readable duration strings (`"60s"`, `"5m"`, `"1h"`, `"2d"`), as
//! accepted by the reference implementation anywhere a `period` is
//! configured. Kept as an optional convenience alongside the primary
//! `std::time::Duration`-typed configuration fields (SPEC_FULL.md §3).
use std::time::Duration;

use crate::error::Error;
use crate::result::Result;

/// Parses a suffixed duration string: a non-negative integer followed by
/// one of `s` (seconds), `m` (minutes), `h` (hours) or `d` (days).
pub fn parse_period(input: &str) -> Result<Duration> {
    let input = input.trim();
    let (digits, suffix) = input.split_at(input.len().saturating_sub(1));
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::PacketError(format!("invalid duration `{input}`: expected a number followed by s/m/h/d")))?;

    let seconds = match suffix {
        "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        "d" => value * 60 * 60 * 24,
        other => {
            return Err(Error::PacketError(format!("invalid duration suffix `{other}`: expected one of s, m, h, d")));
        }
    };

    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_suffix() {
        assert_eq!(parse_period("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_period("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_period("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_period("2d").unwrap(), Duration::from_secs(172_800));
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_period("5x").is_err());
    }
}
