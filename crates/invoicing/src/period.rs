use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use engage_core::{DomainError, DomainResult};

/// Payment term applied when an invoice carries no explicit due date.
pub const DEFAULT_PAYMENT_TERM_DAYS: u64 = 30;

/// An inclusive date range invoices are computed over (usually a calendar month).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    start: NaiveDate,
    end: NaiveDate,
}

impl BillingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> DomainResult<Self> {
        if start > end {
            return Err(DomainError::validation(format!(
                "billing period start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse a `YYYY-MM` month into the first and last day of that month.
    pub fn from_month_year(input: &str) -> DomainResult<Self> {
        let invalid = || DomainError::validation(format!("Invalid month-year format: {input}"));

        let bytes = input.as_bytes();
        let well_formed = bytes.len() == 7
            && bytes[4] == b'-'
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[5..].iter().all(u8::is_ascii_digit);
        if !well_formed {
            return Err(invalid());
        }

        let year: i32 = input[..4].parse().map_err(|_| invalid())?;
        let month: u32 = input[5..].parse().map_err(|_| invalid())?;
        let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
        let end = last_day_of_month(start).ok_or_else(invalid)?;

        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of days in the period, both ends included.
    pub fn total_days(&self) -> i64 {
        days_inclusive(self.start, self.end)
    }

    pub fn default_due_date(&self) -> NaiveDate {
        self.end.checked_add_days(Days::new(DEFAULT_PAYMENT_TERM_DAYS)).unwrap_or(self.end)
    }

    /// `YYYY-MM` of the period start.
    pub fn month_year(&self) -> String {
        format!("{:04}-{:02}", self.start.year(), self.start.month())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Intersection with `[from, to]`, if any (open `to` means unbounded).
    pub fn clamp(&self, from: NaiveDate, to: Option<NaiveDate>) -> Option<(NaiveDate, NaiveDate)> {
        let start = from.max(self.start);
        let end = to.map_or(self.end, |t| t.min(self.end));
        (start <= end).then_some((start, end))
    }
}

impl core::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

pub(crate) fn days_inclusive(start: NaiveDate, end: NaiveDate) -> i64 {
    if start > end {
        return 0;
    }
    (end - start).num_days() + 1
}

fn last_day_of_month(first: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.pred_opt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn month_year_covers_whole_month() {
        let p = BillingPeriod::from_month_year("2024-02").unwrap();
        assert_eq!(p.start(), d(2024, 2, 1));
        assert_eq!(p.end(), d(2024, 2, 29));
        assert_eq!(p.total_days(), 29);
        assert_eq!(p.month_year(), "2024-02");

        let december = BillingPeriod::from_month_year("2025-12").unwrap();
        assert_eq!(december.end(), d(2025, 12, 31));
        assert_eq!(december.default_due_date(), d(2026, 1, 30));
    }

    #[test]
    fn malformed_month_year_is_rejected() {
        for input in ["2025-13", "2025-00", "2025-1", "25-01", "2025/01", "2025-01-01", ""] {
            let err = BillingPeriod::from_month_year(input).unwrap_err();
            assert_eq!(
                err,
                DomainError::Validation(format!("Invalid month-year format: {input}")),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(BillingPeriod::new(d(2025, 3, 2), d(2025, 3, 1)).is_err());
        assert_eq!(BillingPeriod::new(d(2025, 3, 1), d(2025, 3, 1)).unwrap().total_days(), 1);
    }

    #[test]
    fn clamp_intersects_windows() {
        let p = BillingPeriod::from_month_year("2025-03").unwrap();
        assert_eq!(p.clamp(d(2025, 2, 1), None), Some((d(2025, 3, 1), d(2025, 3, 31))));
        assert_eq!(
            p.clamp(d(2025, 3, 10), Some(d(2025, 3, 20))),
            Some((d(2025, 3, 10), d(2025, 3, 20)))
        );
        assert_eq!(p.clamp(d(2025, 4, 1), None), None);
        assert_eq!(p.clamp(d(2025, 1, 1), Some(d(2025, 2, 28))), None);
    }
}
