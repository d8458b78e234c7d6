//! Fixed-point price representation (8 decimal places).
//!
//! Prices are integer units of 1e-8 USD so merge comparisons and storage
//! never depend on float formatting.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Units per whole currency unit.
pub const PRICE_SCALE: i64 = 100_000_000;

const PRICE_DECIMALS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PriceE8(i64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    Empty,
    Negative,
    Invalid(String),
    Overflow(String),
}

impl fmt::Display for PriceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceError::Empty => write!(f, "price is empty"),
            PriceError::Negative => write!(f, "negative price not allowed"),
            PriceError::Invalid(raw) => write!(f, "invalid decimal price: '{raw}'"),
            PriceError::Overflow(raw) => write!(f, "price out of range: '{raw}'"),
        }
    }
}

impl std::error::Error for PriceError {}

impl PriceE8 {
    pub const fn from_units(units: i64) -> Self {
        Self(units)
    }

    pub const fn units(&self) -> i64 {
        self.0
    }

    /// Parse a decimal string into 1e-8 units.
    ///
    /// Rules:
    /// - optional leading `+`; a leading `-` is rejected
    /// - digits with at most one `.`; no exponents, no separators
    /// - more than 8 fractional digits are rounded half away from zero
    pub fn parse_decimal(s: &str) -> Result<Self, PriceError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PriceError::Empty);
        }
        if s.starts_with('-') {
            return Err(PriceError::Negative);
        }
        let digits = s.strip_prefix('+').unwrap_or(s);

        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
        {
            return Err(PriceError::Invalid(s.to_string()));
        }

        let int_val: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| PriceError::Overflow(s.to_string()))?
        };

        let (kept, rest) = if frac_part.len() > PRICE_DECIMALS {
            frac_part.split_at(PRICE_DECIMALS)
        } else {
            (frac_part, "")
        };
        let mut frac_padded = kept.to_string();
        while frac_padded.len() < PRICE_DECIMALS {
            frac_padded.push('0');
        }
        let frac_val: i64 = frac_padded
            .parse()
            .map_err(|_| PriceError::Invalid(s.to_string()))?;
        let round_up = rest.as_bytes().first().is_some_and(|d| *d >= b'5');

        int_val
            .checked_mul(PRICE_SCALE)
            .and_then(|v| v.checked_add(frac_val))
            .and_then(|v| v.checked_add(i64::from(round_up)))
            .map(PriceE8)
            .ok_or_else(|| PriceError::Overflow(s.to_string()))
    }

    /// Convert a finite, non-negative float via its shortest round-trip
    /// decimal rendering, then apply the same rules as [`parse_decimal`].
    ///
    /// [`parse_decimal`]: PriceE8::parse_decimal
    pub fn from_f64(v: f64) -> Result<Self, PriceError> {
        if !v.is_finite() {
            return Err(PriceError::Invalid(v.to_string()));
        }
        if v < 0.0 {
            return Err(PriceError::Negative);
        }
        Self::parse_decimal(&v.to_string())
    }

    /// Lossy float view for consumers that need one (display, charts).
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }
}

impl fmt::Display for PriceE8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = PRICE_SCALE as u64;
        write!(
            f,
            "{sign}{}.{:0width$}",
            abs / scale,
            abs % scale,
            width = PRICE_DECIMALS
        )
    }
}

impl FromStr for PriceE8 {
    type Err = PriceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_decimal(s)
    }
}

impl Serialize for PriceE8 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PriceE8 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PriceE8::parse_decimal(&s).map_err(serde::de::Error::custom)
    }
}
