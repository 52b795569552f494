use core::str::FromStr;

use serde::{Deserialize, Serialize};

use engage_core::{DomainError, DomainResult};

/// Direction of a billing relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    /// The platform bills a division.
    HexekoToDivision,
    /// A division bills one of its financers.
    DivisionToFinancer,
}

impl InvoiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceType::HexekoToDivision => "hexeko_to_division",
            InvoiceType::DivisionToFinancer => "division_to_financer",
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            InvoiceType::HexekoToDivision => "HEXEKO_TO_DIVISION",
            InvoiceType::DivisionToFinancer => "DIVISION_TO_FINANCER",
        }
    }
}

impl core::fmt::Display for InvoiceType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hexeko_to_division" => Ok(InvoiceType::HexekoToDivision),
            "division_to_financer" => Ok(InvoiceType::DivisionToFinancer),
            other => Err(DomainError::validation(format!("unknown invoice type '{other}'"))),
        }
    }
}

/// Largest sequence that fits the six-digit counter.
pub const MAX_SEQUENCE: u32 = 999_999;

/// Human-facing invoice number: `PREFIX-YYYY-NNNNNN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InvoiceNumber(String);

impl InvoiceNumber {
    pub fn next(invoice_type: InvoiceType, year: i32, sequence: u32) -> DomainResult<Self> {
        if !(0..=9999).contains(&year) {
            return Err(DomainError::validation(format!("invoice year out of range: {year}")));
        }
        if sequence == 0 || sequence > MAX_SEQUENCE {
            return Err(DomainError::invariant(format!(
                "invoice sequence out of range: {sequence}"
            )));
        }
        Ok(Self(format!("{}-{year:04}-{sequence:06}", invoice_type.prefix())))
    }

    pub fn parse(raw: &str) -> DomainResult<Self> {
        let invalid = || DomainError::validation(format!("invalid invoice number '{raw}'"));

        let mut parts = raw.rsplitn(3, '-');
        let (Some(sequence), Some(year), Some(prefix)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let prefix_ok = !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_');
        let year_ok = year.len() == 4 && year.chars().all(|c| c.is_ascii_digit());
        let sequence_ok = sequence.len() == 6 && sequence.chars().all(|c| c.is_ascii_digit());
        if !(prefix_ok && year_ok && sequence_ok) {
            return Err(invalid());
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn year(&self) -> Option<i32> {
        self.0.rsplitn(3, '-').nth(1).and_then(|y| y.parse().ok())
    }

    pub fn sequence(&self) -> Option<u32> {
        self.0.rsplit('-').next().and_then(|s| s.parse().ok())
    }
}

impl core::fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for InvoiceNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InvoiceNumber> for String {
    fn from(value: InvoiceNumber) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_prefix_year_and_padded_sequence() {
        let n = InvoiceNumber::next(InvoiceType::DivisionToFinancer, 2025, 42).unwrap();
        assert_eq!(n.as_str(), "DIVISION_TO_FINANCER-2025-000042");
        assert_eq!(n.year(), Some(2025));
        assert_eq!(n.sequence(), Some(42));
    }

    #[test]
    fn parse_validates_shape() {
        assert!(InvoiceNumber::parse("HEXEKO_TO_DIVISION-2024-000001").is_ok());
        for bad in ["hexeko-2024-000001", "HEXEKO-24-000001", "HEXEKO-2024-1", "-2024-000001", "HEXEKO2024000001"] {
            assert!(InvoiceNumber::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn sequence_must_fit_six_digits() {
        assert!(InvoiceNumber::next(InvoiceType::HexekoToDivision, 2025, 0).is_err());
        assert!(InvoiceNumber::next(InvoiceType::HexekoToDivision, 2025, MAX_SEQUENCE + 1).is_err());
    }

    #[test]
    fn serde_goes_through_validation() {
        let json = serde_json::to_string(&InvoiceType::HexekoToDivision).unwrap();
        assert_eq!(json, "\"hexeko_to_division\"");
        assert!(serde_json::from_str::<InvoiceNumber>("\"nope\"").is_err());
    }
}
