//! Value objects: compared by value, never mutated in place.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Marker for immutable, value-compared domain types.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// VAT rate in hundredths of a percent (`2100` is 21.00 %).
///
/// Serialized as a two-decimal string (`"21.00"`); numbers are accepted on input.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VatRate(u32);

impl ValueObject for VatRate {}

impl VatRate {
    pub const MAX_HUNDREDTHS: u32 = 100_00;

    pub fn from_hundredths(hundredths: u32) -> DomainResult<Self> {
        if hundredths > Self::MAX_HUNDREDTHS {
            return Err(DomainError::validation(format!(
                "vat rate must be between 0 and 100, got {hundredths}/100"
            )));
        }
        Ok(Self(hundredths))
    }

    /// Compile-time constructor for known-good rates.
    pub const fn percent(whole: u32) -> Self {
        Self(whole * 100)
    }

    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Parse `"21"`, `"21.5"` or `"21.00"`.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let invalid = || DomainError::validation(format!("invalid vat rate '{raw}'"));
        let raw_trimmed = raw.trim();
        let (whole, frac) = match raw_trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (raw_trimmed, ""),
        };
        if whole.is_empty()
            || frac.len() > 2
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: u32 = whole.parse().map_err(|_| invalid())?;
        let frac: u32 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u32>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };
        let hundredths = whole.checked_mul(100).and_then(|w| w.checked_add(frac)).ok_or_else(invalid)?;
        Self::from_hundredths(hundredths)
    }

    /// VAT owed on `amount` cents, rounded half away from zero.
    pub fn apply(self, amount: i64) -> i64 {
        let scaled = i128::from(amount) * i128::from(self.0);
        let quotient = scaled / 10_000;
        let remainder = scaled % 10_000;
        let rounded = if remainder.abs() * 2 >= 10_000 { quotient + scaled.signum() } else { quotient };
        rounded as i64
    }
}

impl core::fmt::Display for VatRate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for VatRate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VatRate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => VatRate::parse(&s).map_err(serde::de::Error::custom),
            Repr::Number(n) if n.is_finite() && n >= 0.0 => {
                VatRate::from_hundredths((n * 100.0).round() as u32).map_err(serde::de::Error::custom)
            }
            Repr::Number(n) => Err(serde::de::Error::custom(format!("invalid vat rate {n}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn vat_rate_parses_and_displays_two_decimals() {
        assert_eq!(VatRate::parse("21").unwrap().to_string(), "21.00");
        assert_eq!(VatRate::parse("5.5").unwrap().hundredths(), 550);
        assert!(VatRate::parse("21.123").is_err());
        assert!(VatRate::parse("101").is_err());
        assert!(VatRate::parse("-1").is_err());
    }

    #[test]
    fn vat_rate_accepts_strings_and_numbers() {
        let a: VatRate = serde_json::from_str("\"20.00\"").unwrap();
        let b: VatRate = serde_json::from_str("20").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"20.00\"");
    }

    #[test]
    fn vat_rounds_half_away_from_zero() {
        let rate = VatRate::percent(21);
        assert_eq!(rate.apply(100_000), 21_000);
        // 0.21 * 50 = 10.5
        assert_eq!(rate.apply(50), 11);
        assert_eq!(rate.apply(-50), -11);
        assert_eq!(VatRate::percent(20).apply(12), 2);
    }

    proptest! {
        #[test]
        fn vat_never_exceeds_amount(amount in 0i64..10_000_000_000, hundredths in 0u32..=10_000) {
            let vat = VatRate::from_hundredths(hundredths).unwrap().apply(amount);
            prop_assert!(vat >= 0);
            prop_assert!(vat <= amount);
        }
    }
}
