//! Kubernetes resource quantities
//!
//! Quantities like `"250m"`, `"1"`, `"128Mi"` or `"1e3"` are compared on their
//! parsed value, so `"1"` and `"1000m"` describe the same CPU amount and
//! `"1Gi"` and `"1024Mi"` the same memory amount. Values are held in
//! nano-units and rounded up, matching how the API server canonicalises
//! sub-nano fractions.

use crate::error::{OperatorError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Splits a quantity into sign, decimal number and suffix
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-]?)([0-9]+(?:\.[0-9]*)?|\.[0-9]+)([a-zA-Z]*|[eE][+-]?[0-9]+)$")
        .expect("quantity pattern is a valid regex")
});

/// Nano-units per whole unit
const NANOS: i128 = 1_000_000_000;

/// Longest mantissa accepted before overflow becomes possible
const MAX_DIGITS: usize = 24;

/// A quantity reduced to a single canonical number of nano-units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalQuantity {
    nanos: i128,
}

impl CanonicalQuantity {
    /// Parse a quantity string
    pub fn parse(value: &str) -> Result<Self> {
        value.parse()
    }

    /// Value in nano-units
    pub fn as_nanos(&self) -> i128 {
        self.nanos
    }

    /// Value in milli-units, rounded up (millicores for CPU)
    pub fn as_millis(&self) -> i128 {
        div_ceil(self.nanos, 1_000_000)
    }
}

impl FromStr for CanonicalQuantity {
    type Err = OperatorError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || OperatorError::InvalidQuantity(format!("'{}'", value));

        let caps = QUANTITY_REGEX.captures(value.trim()).ok_or_else(invalid)?;
        let negative = &caps[1] == "-";
        let number = &caps[2];
        let suffix = &caps[3];

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.len() + fraction.len() > MAX_DIGITS {
            return Err(OperatorError::InvalidQuantity(format!(
                "'{}' has too many digits",
                value
            )));
        }
        let digits = format!("{}{}", whole, fraction);
        let mantissa: i128 = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(|_| invalid())?
        };
        let fraction_len = fraction.len() as i32;

        let nanos = match Multiplier::from_suffix(suffix).ok_or_else(invalid)? {
            Multiplier::Decimal(exponent) => exponent
                .checked_add(9)
                .and_then(|s| s.checked_sub(fraction_len))
                .and_then(|scale| {
                    if scale >= 0 {
                        pow10(scale).and_then(|p| mantissa.checked_mul(p))
                    } else {
                        scale
                            .checked_neg()
                            .and_then(pow10)
                            .map(|p| div_ceil(mantissa, p))
                    }
                }),
            Multiplier::Binary(shift) => 1i128
                .checked_shl(shift)
                .and_then(|p| p.checked_mul(NANOS))
                .and_then(|p| mantissa.checked_mul(p))
                .and_then(|n| pow10(fraction_len).map(|d| div_ceil(n, d))),
        }
        .ok_or_else(|| OperatorError::InvalidQuantity(format!("'{}' is out of range", value)))?;

        Ok(Self {
            nanos: if negative { -nanos } else { nanos },
        })
    }
}

impl fmt::Display for CanonicalQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos % NANOS == 0 {
            write!(f, "{}", self.nanos / NANOS)
        } else if self.nanos % 1_000_000 == 0 {
            write!(f, "{}m", self.nanos / 1_000_000)
        } else {
            write!(f, "{}n", self.nanos)
        }
    }
}

impl TryFrom<&Quantity> for CanonicalQuantity {
    type Error = OperatorError;

    fn try_from(quantity: &Quantity) -> Result<Self> {
        quantity.0.parse()
    }
}

/// Compare a live quantity with a desired quantity string by parsed value
pub fn same_quantity(live: &Quantity, desired: &str) -> Result<bool> {
    Ok(CanonicalQuantity::try_from(live)? == desired.parse::<CanonicalQuantity>()?)
}

enum Multiplier {
    /// Power of ten
    Decimal(i32),
    /// Power of two
    Binary(u32),
}

impl Multiplier {
    fn from_suffix(suffix: &str) -> Option<Self> {
        let multiplier = match suffix {
            "" => Multiplier::Decimal(0),
            "n" => Multiplier::Decimal(-9),
            "u" => Multiplier::Decimal(-6),
            "m" => Multiplier::Decimal(-3),
            "k" => Multiplier::Decimal(3),
            "M" => Multiplier::Decimal(6),
            "G" => Multiplier::Decimal(9),
            "T" => Multiplier::Decimal(12),
            "P" => Multiplier::Decimal(15),
            "E" => Multiplier::Decimal(18),
            "Ki" => Multiplier::Binary(10),
            "Mi" => Multiplier::Binary(20),
            "Gi" => Multiplier::Binary(30),
            "Ti" => Multiplier::Binary(40),
            "Pi" => Multiplier::Binary(50),
            "Ei" => Multiplier::Binary(60),
            exp if exp.starts_with(['e', 'E']) => Multiplier::Decimal(exp[1..].parse().ok()?),
            _ => return None,
        };
        Some(multiplier)
    }
}

fn pow10(exponent: i32) -> Option<i128> {
    10i128.checked_pow(u32::try_from(exponent).ok()?)
}

fn div_ceil(n: i128, d: i128) -> i128 {
    let q = n / d;
    if n % d > 0 {
        q + 1
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> CanonicalQuantity {
        CanonicalQuantity::parse(s).unwrap()
    }

    #[test]
    fn test_cpu_spellings_are_equal() {
        assert_eq!(q("1"), q("1000m"));
        assert_eq!(q("0.5"), q("500m"));
        assert_eq!(q(".25"), q("250m"));
        assert_eq!(q("100m").as_millis(), 100);
        assert_ne!(q("250m"), q("100m"));
    }

    #[test]
    fn test_memory_spellings_are_equal() {
        assert_eq!(q("1Gi"), q("1024Mi"));
        assert_eq!(q("1Ki"), q("1024"));
        assert_eq!(q("1k"), q("1000"));
        assert_eq!(q("0.5Gi"), q("512Mi"));
        assert_ne!(q("1G"), q("1Gi"));
    }

    #[test]
    fn test_exponent_notation() {
        assert_eq!(q("1e3"), q("1k"));
        assert_eq!(q("1E3"), q("1k"));
        assert_eq!(q("5e-3"), q("5m"));
        assert_eq!(q("1E"), q("1e18"));
    }

    #[test]
    fn test_rounds_up_sub_nano_fractions() {
        assert_eq!(q("0.1n").as_nanos(), 1);
        assert_eq!(q("1.5n").as_nanos(), 2);
    }

    #[test]
    fn test_negative_and_signed() {
        assert_eq!(q("-1").as_nanos(), -NANOS);
        assert_eq!(q("+1"), q("1"));
    }

    #[test]
    fn test_invalid_quantities() {
        for bad in ["", "abc", "1Xi", "m", "1.2.3", "Mi", "1 Gi", "1ee3"] {
            assert!(
                matches!(
                    CanonicalQuantity::parse(bad),
                    Err(OperatorError::InvalidQuantity(_))
                ),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_out_of_range() {
        assert!(CanonicalQuantity::parse("999999999999Ei").is_err());
        assert!(CanonicalQuantity::parse("1234567890123456789012345").is_err());
        assert!(matches!(
            CanonicalQuantity::parse("1e2147483647"),
            Err(OperatorError::InvalidQuantity(_))
        ));
        assert!(CanonicalQuantity::parse("1.5e2147483647").is_err());
        assert!(CanonicalQuantity::parse("1e-2147483648").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(q("1000m").to_string(), "1");
        assert_eq!(q("250m").to_string(), "250m");
        assert_eq!(q("1Ki").to_string(), "1024");
    }

    #[test]
    fn test_same_quantity() {
        let live = Quantity("256Mi".to_string());
        assert!(same_quantity(&live, "268435456").unwrap());
        assert!(!same_quantity(&live, "128Mi").unwrap());
        assert!(same_quantity(&live, "bogus").is_err());
    }
}
