//! Human readable byte quantities, such as `100MB`, `1.5GiB` or `4096`.
//!
//! Decimal units (`KB`, `MB`, `GB`, `TB`) are powers of 1000, binary units (`KiB`, `MiB`, `GiB`,
//! `TiB`) powers of 1024. Units are case insensitive and a bare number is a count of bytes.

use thiserror::Error as ThisError;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("empty size")]
    Empty,
    #[error("invalid size {0:?}")]
    Invalid(String),
    #[error("unknown size unit {0:?}")]
    UnknownUnit(String),
    #[error("size {0:?} is out of range")]
    OutOfRange(String),
}

const UNITS: &[(&str, u64)] = &[
    ("b", 1),
    ("kb", 1_000),
    ("mb", 1_000_000),
    ("gb", 1_000_000_000),
    ("tb", 1_000_000_000_000),
    ("kib", 1 << 10),
    ("mib", 1 << 20),
    ("gib", 1 << 30),
    ("tib", 1 << 40),
];

pub fn parse(s: &str) -> Result<u64, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Empty);
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| Error::Invalid(s.to_string()))?;

    let unit = unit.trim().to_lowercase();
    let multiplier = if unit.is_empty() {
        1
    } else {
        UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, multiplier)| *multiplier)
            .ok_or_else(|| Error::UnknownUnit(unit.clone()))?
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(Error::OutOfRange(s.to_string()));
    }

    Ok(bytes as u64)
}
