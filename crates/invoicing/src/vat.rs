//! Country VAT defaults for invoices.

use engage_core::VatRate;

/// Rate used when the country has no entry.
pub const FALLBACK_RATE: VatRate = VatRate::percent(20);

/// Standard VAT rate of a division's country (ISO alpha-2, case-insensitive).
pub fn country_rate(country: &str) -> VatRate {
    match country.trim().to_ascii_uppercase().as_str() {
        "BE" => VatRate::percent(21),
        "FR" => VatRate::percent(20),
        "LU" => VatRate::percent(17),
        "NL" => VatRate::percent(21),
        "DE" => VatRate::percent(19),
        _ => FALLBACK_RATE,
    }
}

/// The division override wins over the country rate.
pub fn resolve_rate(division_override: Option<VatRate>, country: &str) -> VatRate {
    division_override.unwrap_or_else(|| country_rate(country))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_countries_have_their_rate() {
        assert_eq!(country_rate("BE").to_string(), "21.00");
        assert_eq!(country_rate("lu").to_string(), "17.00");
        assert_eq!(country_rate("DE").to_string(), "19.00");
        assert_eq!(country_rate("ES"), FALLBACK_RATE);
    }

    #[test]
    fn override_wins() {
        let custom = VatRate::parse("5.5").unwrap();
        assert_eq!(resolve_rate(Some(custom), "BE"), custom);
        assert_eq!(resolve_rate(None, "NL"), VatRate::percent(21));
    }
}
