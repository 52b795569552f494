//! Day-based prorata of contracts, modules and beneficiaries over a billing period.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use engage_core::{DomainError, DomainResult, UserId};
use engage_organizations::{BeneficiaryMembership, ModuleSubscription};

use crate::period::{BillingPeriod, days_inclusive};

/// A share of a billing period in hundredths (`0..=100`).
///
/// Serialized as a JSON number with two decimals (`0.5`, `1.0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProrataPercentage(u8);

impl ProrataPercentage {
    pub const ZERO: ProrataPercentage = ProrataPercentage(0);
    pub const FULL: ProrataPercentage = ProrataPercentage(100);

    pub fn from_hundredths(hundredths: u8) -> DomainResult<Self> {
        if hundredths > 100 {
            return Err(DomainError::validation(format!(
                "prorata must be between 0 and 1, got {hundredths}/100"
            )));
        }
        Ok(Self(hundredths))
    }

    pub const fn hundredths(self) -> u8 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 100.0
    }

    /// `amount × share`, rounded half away from zero.
    pub fn apply(self, amount: i128) -> i128 {
        let scaled = amount * i128::from(self.0);
        let quotient = scaled / 100;
        if (scaled % 100).abs() * 2 >= 100 { quotient + scaled.signum() } else { quotient }
    }
}

impl Default for ProrataPercentage {
    fn default() -> Self {
        Self::FULL
    }
}

impl core::fmt::Display for ProrataPercentage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for ProrataPercentage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for ProrataPercentage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = f64::deserialize(deserializer)?;
        if !raw.is_finite() || !(0.0..=1.0).contains(&raw) {
            return Err(serde::de::Error::custom(format!("prorata must be between 0 and 1, got {raw}")));
        }
        Ok(Self((raw * 100.0).round() as u8))
    }
}

/// `num / den`, truncated to six decimals, rounded half up to two and clamped to `[0, 1]`.
pub fn ratio(numerator: i64, denominator: i64) -> ProrataPercentage {
    if denominator <= 0 || numerator <= 0 {
        return ProrataPercentage::ZERO;
    }
    let micros = i128::from(numerator) * 1_000_000 / i128::from(denominator);
    let hundredths = (micros + 5_000) / 10_000;
    ProrataPercentage(hundredths.clamp(0, 100) as u8)
}

/// Detail of one prorata computation, as shown on invoice items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrataCalculation {
    pub percentage: ProrataPercentage,
    pub days: i64,
    pub total_days: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub activation_date: Option<NaiveDate>,
    pub deactivation_date: Option<NaiveDate>,
}

impl ProrataCalculation {
    fn zero(period: &BillingPeriod) -> Self {
        Self {
            percentage: ProrataPercentage::ZERO,
            days: 0,
            total_days: period.total_days(),
            period_start: period.start(),
            period_end: period.end(),
            activation_date: None,
            deactivation_date: None,
        }
    }
}

/// Share of the period covered by a contract starting on `contract_start`.
pub fn contract_prorata(contract_start: NaiveDate, period: &BillingPeriod) -> ProrataPercentage {
    if contract_start <= period.start() {
        return ProrataPercentage::FULL;
    }
    if contract_start > period.end() {
        return ProrataPercentage::ZERO;
    }
    ratio(days_inclusive(contract_start, period.end()), period.total_days())
}

/// Contract prorata with its reporting detail. No contract date bills the full period.
///
/// Days are reported as the full period length; only the percentage is prorated.
pub fn contract_calculation(
    contract_start: Option<NaiveDate>,
    period: &BillingPeriod,
) -> ProrataCalculation {
    let percentage = contract_start
        .map(|start| contract_prorata(start, period))
        .unwrap_or(ProrataPercentage::FULL);
    let activation = contract_start.map_or(period.start(), |start| start.max(period.start()));

    ProrataCalculation {
        percentage,
        days: period.total_days(),
        total_days: period.total_days(),
        period_start: period.start(),
        period_end: period.end(),
        activation_date: Some(activation),
        deactivation_date: None,
    }
}

/// Share of the period a module subscription was active.
pub fn module_prorata(subscription: &ModuleSubscription, period: &BillingPeriod) -> ProrataCalculation {
    let (start, end) = (period.start(), period.end());

    let activation = subscription
        .first_activation_between(start, end)
        .or_else(|| (subscription.subscribed_on <= start).then_some(start));
    let deactivation = subscription.last_deactivation_between(start, end);

    let effective_start = match activation {
        Some(date) => date.max(start),
        None if subscription.active => start,
        None => {
            return ProrataCalculation { deactivation_date: deactivation, ..ProrataCalculation::zero(period) };
        }
    };
    let effective_end = deactivation.map_or(end, |date| date.min(end));

    if effective_start > effective_end {
        return ProrataCalculation {
            activation_date: activation,
            deactivation_date: deactivation,
            ..ProrataCalculation::zero(period)
        };
    }

    let days = days_inclusive(effective_start, effective_end);
    ProrataCalculation {
        percentage: ratio(days, period.total_days()),
        days,
        total_days: period.total_days(),
        period_start: start,
        period_end: end,
        activation_date: Some(effective_start),
        deactivation_date: deactivation.map(|_| effective_end),
    }
}

/// Per-beneficiary share of the period, keyed (and so ordered) by user id.
pub fn beneficiary_prorata<'a, I>(memberships: I, period: &BillingPeriod) -> BTreeMap<UserId, ProrataPercentage>
where
    I: IntoIterator<Item = &'a BeneficiaryMembership>,
{
    let total_days = period.total_days();
    memberships
        .into_iter()
        .filter_map(|m| {
            let (from, to) = period.clamp(m.from, m.to)?;
            Some((m.user_id, ratio(days_inclusive(from, to), total_days)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_organizations::{ModuleId, ModuleToggle};
    use proptest::prelude::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn march() -> BillingPeriod {
        BillingPeriod::from_month_year("2025-03").unwrap()
    }

    fn subscription(subscribed_on: NaiveDate, toggles: &[(NaiveDate, bool)]) -> ModuleSubscription {
        let toggles: Vec<ModuleToggle> =
            toggles.iter().map(|(on, active)| ModuleToggle { on: *on, active: *active }).collect();
        ModuleSubscription {
            module_id: ModuleId::generate(),
            active: toggles.last().is_some_and(|t| t.active),
            price_per_beneficiary: None,
            subscribed_on,
            toggles,
        }
    }

    #[test]
    fn ratio_truncates_then_rounds() {
        assert_eq!(ratio(16, 31).hundredths(), 52);
        assert_eq!(ratio(1, 8).hundredths(), 13);
        assert_eq!(ratio(31, 31), ProrataPercentage::FULL);
        assert_eq!(ratio(5, 0), ProrataPercentage::ZERO);
        assert_eq!(ratio(40, 31), ProrataPercentage::FULL);
    }

    #[test]
    fn contract_prorata_boundaries() {
        let p = march();
        assert_eq!(contract_prorata(d(2025, 1, 1), &p), ProrataPercentage::FULL);
        assert_eq!(contract_prorata(d(2025, 3, 1), &p), ProrataPercentage::FULL);
        assert_eq!(contract_prorata(d(2025, 4, 1), &p), ProrataPercentage::ZERO);
        // 16 of 31 days
        assert_eq!(contract_prorata(d(2025, 3, 16), &p).hundredths(), 52);
    }

    #[test]
    fn contract_calculation_reports_full_period_days() {
        let calc = contract_calculation(Some(d(2025, 3, 16)), &march());
        assert_eq!(calc.days, 31);
        assert_eq!(calc.total_days, 31);
        assert_eq!(calc.activation_date, Some(d(2025, 3, 16)));

        let open = contract_calculation(None, &march());
        assert_eq!(open.percentage, ProrataPercentage::FULL);
        assert_eq!(open.activation_date, Some(d(2025, 3, 1)));
    }

    #[test]
    fn module_active_all_period_is_full() {
        let sub = subscription(d(2025, 1, 1), &[(d(2025, 1, 1), true)]);
        let calc = module_prorata(&sub, &march());
        assert_eq!(calc.percentage, ProrataPercentage::FULL);
        assert_eq!(calc.days, 31);
        assert_eq!(calc.deactivation_date, None);
    }

    #[test]
    fn module_activated_mid_period() {
        let sub = subscription(d(2025, 3, 11), &[(d(2025, 3, 11), true)]);
        let calc = module_prorata(&sub, &march());
        assert_eq!(calc.days, 21);
        assert_eq!(calc.activation_date, Some(d(2025, 3, 11)));
        assert_eq!(calc.percentage, ratio(21, 31));
    }

    #[test]
    fn module_deactivated_mid_period_reports_clipped_end() {
        let sub = subscription(d(2025, 1, 1), &[(d(2025, 1, 1), true), (d(2025, 3, 10), false)]);
        let calc = module_prorata(&sub, &march());
        assert_eq!(calc.days, 10);
        assert_eq!(calc.deactivation_date, Some(d(2025, 3, 10)));
        assert_eq!(calc.percentage.hundredths(), 32);
    }

    #[test]
    fn inactive_module_without_activation_is_zero() {
        let sub = subscription(d(2025, 4, 2), &[(d(2025, 4, 2), true), (d(2025, 4, 3), false)]);
        let calc = module_prorata(&sub, &march());
        assert_eq!(calc.percentage, ProrataPercentage::ZERO);
        assert_eq!(calc.days, 0);
    }

    #[test]
    fn beneficiaries_are_clamped_to_the_period() {
        let a = BeneficiaryMembership { user_id: UserId::new(), from: d(2025, 2, 1), to: None };
        let b = BeneficiaryMembership { user_id: UserId::new(), from: d(2025, 3, 17), to: Some(d(2025, 3, 31)) };
        let gone = BeneficiaryMembership { user_id: UserId::new(), from: d(2025, 1, 1), to: Some(d(2025, 2, 28)) };

        let result = beneficiary_prorata([&a, &b, &gone], &march());
        assert_eq!(result.len(), 2);
        assert_eq!(result[&a.user_id], ProrataPercentage::FULL);
        assert_eq!(result[&b.user_id], ratio(15, 31));
    }

    #[test]
    fn percentage_serializes_as_decimal() {
        assert_eq!(serde_json::to_string(&ratio(1, 2)).unwrap(), "0.5");
        let back: ProrataPercentage = serde_json::from_str("0.52").unwrap();
        assert_eq!(back.hundredths(), 52);
        assert!(serde_json::from_str::<ProrataPercentage>("1.5").is_err());
    }

    proptest! {
        #[test]
        fn ratio_stays_within_unit_interval(num in -1_000i64..1_000, den in -10i64..1_000) {
            let r = ratio(num, den);
            prop_assert!(r.hundredths() <= 100);
        }

        #[test]
        fn contract_prorata_is_monotonic_in_start_date(a in 0u32..40, b in 0u32..40) {
            let p = march();
            let base = d(2025, 2, 20);
            let (early, late) = if a <= b { (a, b) } else { (b, a) };
            let early = contract_prorata(base + chrono::Days::new(early.into()), &p);
            let late = contract_prorata(base + chrono::Days::new(late.into()), &p);
            prop_assert!(early >= late);
        }

        #[test]
        fn applying_prorata_never_exceeds_amount(amount in 0i128..1_000_000_000, h in 0u8..=100) {
            let p = ProrataPercentage::from_hundredths(h).unwrap();
            prop_assert!(p.apply(amount) <= amount);
        }
    }
}
