// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Byte and duration units used by the status-line protocol.
//!
//! Parsing is best-effort: telemetry that cannot be read degrades to zero
//! instead of failing the caller.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Size units a worker may print after a byte count (1024-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteUnit {
    B,
    KB,
    MB,
    GB,
    TB,
    PB,
    EB,
}

impl ByteUnit {
    const ALL: [ByteUnit; 7] = [
        Self::B,
        Self::KB,
        Self::MB,
        Self::GB,
        Self::TB,
        Self::PB,
        Self::EB,
    ];

    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::B => "B",
            Self::KB => "KB",
            Self::MB => "MB",
            Self::GB => "GB",
            Self::TB => "TB",
            Self::PB => "PB",
            Self::EB => "EB",
        }
    }

    /// Power of 1024 this unit stands for.
    pub const fn exponent(&self) -> u32 {
        match self {
            Self::B => 0,
            Self::KB => 1,
            Self::MB => 2,
            Self::GB => 3,
            Self::TB => 4,
            Self::PB => 5,
            Self::EB => 6,
        }
    }

    pub fn multiplier(&self) -> f64 {
        1024f64.powi(self.exponent() as i32)
    }
}

impl FromStr for ByteUnit {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|unit| unit.symbol() == s)
            .ok_or(())
    }
}

impl fmt::Display for ByteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Convert a number and unit token into a byte count.
///
/// Unknown units scale by 1. A malformed number yields 0. Results saturate
/// at the `i64` bounds.
pub fn parse_byte_value(number: &str, unit: &str) -> i64 {
    let Ok(value) = number.trim().parse::<f64>() else {
        return 0;
    };
    if !value.is_finite() {
        return 0;
    }
    let multiplier = unit
        .trim()
        .parse::<ByteUnit>()
        .map(|u| u.multiplier())
        .unwrap_or(1.0);
    (value * multiplier) as i64
}

/// Parse a plain non-negative counter ("7"), returning `None` when malformed.
pub fn parse_count(token: &str) -> Option<u64> {
    token.trim().parse::<u64>().ok()
}

/// Render a byte count the way workers print it: `"512 B"`, `"1.5 MB"`.
pub fn format_bytes(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp + 1 < ByteUnit::ALL.len() - 1 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1} {}",
        bytes as f64 / div as f64,
        ByteUnit::ALL[exp + 1].symbol()
    )
}

/// Render an uptime as `1h2m3s`, `2m3s` or `3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scales_by_power_of_1024() {
        assert_eq!(parse_byte_value("12", "B"), 12);
        assert_eq!(parse_byte_value("1.5", "MB"), 1_572_864);
        assert_eq!(parse_byte_value("2", "GB"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_byte_value("1", "EB"), 1i64 << 60);
    }

    #[test]
    fn test_parse_unknown_unit_truncates() {
        assert_eq!(parse_byte_value("12.9", "XB"), 12);
        assert_eq!(parse_byte_value("7", ""), 7);
    }

    #[test]
    fn test_parse_malformed_number_is_zero() {
        assert_eq!(parse_byte_value("abc", "MB"), 0);
        assert_eq!(parse_byte_value("", "KB"), 0);
        assert_eq!(parse_byte_value("inf", "KB"), 0);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let first = parse_byte_value("3.25", "KB");
        let second = parse_byte_value("3.25", "KB");
        assert_eq!(first, second);
        assert_eq!(first, 3328);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("7"), Some(7));
        assert_eq!(parse_count("-1"), None);
        assert_eq!(parse_count("x"), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1_572_864), "1.5 MB");
        assert_eq!(format_bytes(i64::MAX), "8.0 EB");
    }

    #[test]
    fn test_format_bytes_reads_back_through_parser() {
        let text = format_bytes(3 * 1024 * 1024 * 1024);
        let (number, unit) = text.split_once(' ').unwrap();
        assert_eq!(parse_byte_value(number, unit), 3 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m5s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h2m3s");
    }
}
