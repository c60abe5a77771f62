//! Human-readable durations such as `30s`, `5m` or `1h30m`.

use crate::errors::{NodeStateError, Result};
use std::time::Duration;

const NANOS_PER_UNIT: &[(&str, f64)] = &[
    ("ns", 1.0),
    ("us", 1e3),
    ("µs", 1e3),
    ("ms", 1e6),
    ("s", 1e9),
    ("m", 60e9),
    ("h", 3600e9),
];

/// Parses a sequence of decimal numbers with unit suffixes.
///
/// Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`; a bare `0`
/// is also accepted. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let text = input.trim();
    let invalid = |reason: &str| {
        NodeStateError::validation(format!("invalid duration '{input}': {reason}"))
    };
    if text.is_empty() {
        return Err(invalid("empty"));
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.starts_with('-') {
        return Err(invalid("negative"));
    }

    let mut rest = text.strip_prefix('+').unwrap_or(text);
    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        if number.is_empty() || number == "." {
            return Err(invalid("expected a number"));
        }
        let value: f64 = number.parse().map_err(|_| invalid("bad number"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        if unit.is_empty() {
            return Err(invalid("missing unit"));
        }
        let scale = NANOS_PER_UNIT
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(|| invalid(&format!("unknown unit '{unit}'")))?;

        total_nanos += value * scale;
        rest = tail;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_single_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_compound_and_fractional() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2m3s").unwrap(), Duration::from_secs(123));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "5", "m", "5d", "-5m", "1h-2m", "five minutes"] {
            let err = parse_duration(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad}");
        }
    }
}
