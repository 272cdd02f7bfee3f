//! Human-readable size string parsing.
//!
//! Partition sizes in recipes are written as `"300mb"`, `"7gb"`, or a bare
//! byte count. Suffixes are binary multiples (1 kb = 1024 bytes). Percentage
//! and `max` sizes are not handled here; they are recognized at the
//! `PartitionSpec` level.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::FlashwrightError;

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^([0-9]+)\s*(kb|mb|gb|tb)?$").expect("size pattern must compile")
    })
}

/// Parses a human-readable size string into a byte count.
///
/// Accepts a bare integer (bytes) or an integer followed by an optional
/// whitespace and a `kb`/`mb`/`gb`/`tb` suffix (case-insensitive, binary
/// multiples). Anything else is rejected with
/// [`FlashwrightError::InvalidSizeFormat`] carrying the offending string.
pub fn parse_size(s: &str) -> Result<u64, FlashwrightError> {
    let captures = size_pattern()
        .captures(s.trim())
        .ok_or_else(|| FlashwrightError::InvalidSizeFormat(s.to_string()))?;

    let number: u64 = captures[1]
        .parse()
        .map_err(|_| FlashwrightError::InvalidSizeFormat(s.to_string()))?;

    let multiplier: u64 = match captures.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1,
        Some(suffix) => match suffix.as_str() {
            "kb" => 1024,
            "mb" => 1024 * 1024,
            "gb" => 1024 * 1024 * 1024,
            "tb" => 1024u64 * 1024 * 1024 * 1024,
            _ => unreachable!("suffix is constrained by the pattern"),
        },
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| FlashwrightError::InvalidSizeFormat(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_bytes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_size("300kb").unwrap(), 300 * 1024);
        assert_eq!(parse_size("512mb").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("7gb").unwrap(), 7 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("2tb").unwrap(), 2 * 1024u64.pow(4));
    }

    #[test]
    fn suffix_is_case_insensitive() {
        assert_eq!(parse_size("300KB").unwrap(), 300 * 1024);
        assert_eq!(parse_size("300Kb").unwrap(), 300 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn allows_whitespace_before_suffix() {
        assert_eq!(parse_size("300 mb").unwrap(), 300 * 1024 * 1024);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["abc", "12xb", "mb", "-5mb", "1.5gb", "12%", "max", ""] {
            let err = parse_size(bad).unwrap_err();
            assert!(
                matches!(&err, FlashwrightError::InvalidSizeFormat(s) if s == bad),
                "expected InvalidSizeFormat for {:?}, got {}",
                bad,
                err
            );
        }
    }

    #[test]
    fn rejects_overflow() {
        let err = parse_size("99999999999tb").unwrap_err();
        assert!(matches!(err, FlashwrightError::InvalidSizeFormat(_)));
    }
}
