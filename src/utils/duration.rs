//! Duration strings made of `<number><unit>` pairs, such as `1h`, `1h30m` or `1.5s`.
//!
//! Supported units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`.

use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    #[error("unknown unit {unit:?} in duration {duration:?}")]
    UnknownUnit { unit: String, duration: String },
}

fn unit_nanos(unit: &str) -> Option<f64> {
    let nanos = match unit {
        "ns" => 1.0,
        "us" | "µs" | "μs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60.0 * 1e9,
        "h" => 60.0 * 60.0 * 1e9,
        _ => return None,
    };
    Some(nanos)
}

pub fn parse(s: &str) -> Result<Duration, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Empty);
    }
    // A lone zero needs no unit.
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut nanos = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(Error::Invalid(s.to_string()));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| Error::Invalid(s.to_string()))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(Error::MissingUnit(s.to_string()));
        }
        let unit = &rest[..unit_len];
        let multiplier = unit_nanos(unit).ok_or_else(|| Error::UnknownUnit {
            unit: unit.to_string(),
            duration: s.to_string(),
        })?;
        rest = &rest[unit_len..];

        nanos += number * multiplier;
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(Error::Invalid(s.to_string()));
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}
