//! Kubernetes resource quantity grammar.
//!
//! ```text
//! <quantity>        ::= <signedNumber><suffix>
//! <signedNumber>    ::= <number> | +<number> | -<number>
//! <number>          ::= <digits> | <digits>.<digits> | <digits>. | .<digits>
//! <suffix>          ::= <binarySI> | <decimalExponent> | <decimalSI>
//! <binarySI>        ::= Ki | Mi | Gi | Ti | Pi | Ei
//! <decimalSI>       ::= m | "" | k | M | G | T | P | E
//! <decimalExponent> ::= "e" <signedNumber> | "E" <signedNumber>
//! ```
//!
//! Only validation is needed here; values are handed to the API verbatim.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const BINARY_SUFFIXES: &[&str] = &["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
const DECIMAL_SUFFIXES: &[&str] = &["m", "", "k", "M", "G", "T", "P", "E"];

/// Quantity parse errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity cannot be empty")]
    Empty,

    #[error("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$': {0}")]
    Format(String),

    #[error("unable to parse quantity's suffix: {0}")]
    Suffix(String),
}

/// A validated quantity string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Quantity {
    raw: String,
    negative: bool,
    zero: bool,
}

impl Quantity {
    pub fn parse(raw: &str) -> Result<Self, QuantityError> {
        if raw.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, unsigned) = match raw.as_bytes()[0] {
            b'-' => (true, &raw[1..]),
            b'+' => (false, &raw[1..]),
            _ => (false, raw),
        };

        let number_len = unsigned
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);
        validate_number(number).map_err(|_| QuantityError::Format(raw.to_string()))?;
        validate_suffix(suffix).map_err(|_| QuantityError::Suffix(raw.to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            negative,
            zero: number.chars().all(|c| c == '0' || c == '.'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the numeric part is zero, whatever the suffix.
    pub fn is_zero(&self) -> bool {
        self.zero
    }

    pub fn is_negative(&self) -> bool {
        self.negative && !self.zero
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn validate_number(number: &str) -> Result<(), ()> {
    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or("");
    let fraction = parts.next();

    let digits_ok = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    match fraction {
        None if !whole.is_empty() && digits_ok(whole) => Ok(()),
        // "1.", ".5" and "1.5" are all accepted, "." is not
        Some(fraction)
            if digits_ok(whole)
                && digits_ok(fraction)
                && !(whole.is_empty() && fraction.is_empty()) =>
        {
            Ok(())
        }
        _ => Err(()),
    }
}

fn validate_suffix(suffix: &str) -> Result<(), ()> {
    if BINARY_SUFFIXES.contains(&suffix) || DECIMAL_SUFFIXES.contains(&suffix) {
        return Ok(());
    }

    let exponent = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))
        .ok_or(())?;
    let digits = exponent
        .strip_prefix('+')
        .or_else(|| exponent.strip_prefix('-'))
        .unwrap_or(exponent);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(())
    }
}
