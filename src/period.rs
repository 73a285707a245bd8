//! Calendar periods that metrics are computed and stored for.
//!
//! A period is an inclusive range of calendar dates. Every row that feeds a
//! metric (appointment, conversation, payment) belongs to the period that
//! contains its timestamp, bucketed in UTC.

use crate::errors::AppError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Longest relative window accepted by `MetricPeriod::parse` (e.g. `366d`).
pub const MAX_TRAILING_DAYS: u32 = 366;

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl MetricPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, AppError> {
        if start > end {
            return Err(AppError::BadRequest(format!(
                "Period start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// The whole calendar month `year-month`.
    pub fn month(year: i32, month: u32) -> Result<Self, AppError> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| AppError::BadRequest(format!("Invalid month {}-{:02}", year, month)))?;
        let end = last_day_of_month(start)
            .ok_or_else(|| AppError::BadRequest(format!("Invalid month {}-{:02}", year, month)))?;
        Ok(Self { start, end })
    }

    /// The calendar month containing `today`.
    pub fn current_month(today: NaiveDate) -> Self {
        let start = today.with_day(1).unwrap_or(today);
        let end = last_day_of_month(start).unwrap_or(today);
        Self { start, end }
    }

    /// `days` calendar days ending on (and including) `today`.
    pub fn trailing_days(days: u32, today: NaiveDate) -> Result<Self, AppError> {
        if days == 0 || days > MAX_TRAILING_DAYS {
            return Err(AppError::BadRequest(format!(
                "Trailing window must be between 1 and {} days",
                MAX_TRAILING_DAYS
            )));
        }
        let start = today - Duration::days(i64::from(days) - 1);
        Ok(Self { start, end: today })
    }

    /// Parses `YYYY-MM`, `YYYY-MM-DD..YYYY-MM-DD` or `<N>d` (relative to `today`).
    pub fn parse(input: &str, today: NaiveDate) -> Result<Self, AppError> {
        let input = input.trim();
        let patterns = period_patterns()?;

        if let Some(caps) = patterns.month.captures(input) {
            let year: i32 = caps[1].parse().map_err(|_| invalid_period(input))?;
            let month: u32 = caps[2].parse().map_err(|_| invalid_period(input))?;
            return Self::month(year, month);
        }

        if let Some(caps) = patterns.range.captures(input) {
            let start = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d")
                .map_err(|_| invalid_period(input))?;
            let end = NaiveDate::parse_from_str(&caps[2], "%Y-%m-%d")
                .map_err(|_| invalid_period(input))?;
            return Self::new(start, end);
        }

        if let Some(caps) = patterns.trailing.captures(input) {
            let days: u32 = caps[1].parse().map_err(|_| invalid_period(input))?;
            return Self::trailing_days(days, today);
        }

        Err(invalid_period(input))
    }

    /// True when the period covers exactly one calendar month.
    pub fn is_calendar_month(&self) -> bool {
        self.start.day() == 1 && last_day_of_month(self.start) == Some(self.end)
    }

    /// Stable string key: `YYYY-MM` for calendar months, otherwise `start_end`.
    pub fn key(&self) -> String {
        if self.is_calendar_month() {
            self.start.format("%Y-%m").to_string()
        } else {
            format!(
                "{}_{}",
                self.start.format("%Y-%m-%d"),
                self.end.format("%Y-%m-%d")
            )
        }
    }

    /// Half-open UTC bounds `[start 00:00, end + 1 day 00:00)`.
    pub fn utc_bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let from = Utc.from_utc_datetime(&self.start.and_time(NaiveTime::MIN));
        let until = Utc.from_utc_datetime(&(self.end + Duration::days(1)).and_time(NaiveTime::MIN));
        (from, until)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let day = at.date_naive();
        day >= self.start && day <= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for MetricPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

struct PeriodPatterns {
    month: Regex,
    range: Regex,
    trailing: Regex,
}

impl PeriodPatterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            month: Regex::new(r"^(\d{4})-(\d{2})$")?,
            range: Regex::new(r"^(\d{4}-\d{2}-\d{2})\.\.(\d{4}-\d{2}-\d{2})$")?,
            trailing: Regex::new(r"^(\d{1,3})d$")?,
        })
    }
}

fn period_patterns() -> Result<&'static PeriodPatterns, AppError> {
    static PATTERNS: OnceLock<Result<PeriodPatterns, regex::Error>> = OnceLock::new();
    PATTERNS
        .get_or_init(PeriodPatterns::compile)
        .as_ref()
        .map_err(|e| AppError::InternalError(format!("Period patterns failed to compile: {}", e)))
}

fn invalid_period(input: &str) -> AppError {
    AppError::BadRequest(format!(
        "Invalid period '{}': expected YYYY-MM, YYYY-MM-DD..YYYY-MM-DD or <N>d",
        input
    ))
}

fn last_day_of_month(first: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).and_then(|next| next.pred_opt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_month_bounds() {
        let feb = MetricPeriod::month(2024, 2).unwrap();
        assert_eq!(feb.start, date(2024, 2, 1));
        assert_eq!(feb.end, date(2024, 2, 29));
        assert_eq!(feb.days(), 29);

        let dec = MetricPeriod::month(2025, 12).unwrap();
        assert_eq!(dec.end, date(2025, 12, 31));

        assert!(MetricPeriod::month(2025, 13).is_err());
    }

    #[test]
    fn test_parse_formats() {
        let today = date(2025, 8, 9);

        let month = MetricPeriod::parse("2025-07", today).unwrap();
        assert_eq!(month.key(), "2025-07");

        let range = MetricPeriod::parse("2025-08-01..2025-08-09", today).unwrap();
        assert_eq!(range.key(), "2025-08-01_2025-08-09");
        assert_eq!(range.days(), 9);

        let trailing = MetricPeriod::parse("7d", today).unwrap();
        assert_eq!(trailing.start, date(2025, 8, 3));
        assert_eq!(trailing.end, today);

        assert!(MetricPeriod::parse("last-month", today).is_err());
        assert!(MetricPeriod::parse("0d", today).is_err());
        assert!(MetricPeriod::parse("2025-08-09..2025-08-01", today).is_err());
    }

    #[test]
    fn test_range_covering_month_uses_month_key() {
        let today = date(2025, 8, 9);
        let range = MetricPeriod::parse("2025-06-01..2025-06-30", today).unwrap();
        assert!(range.is_calendar_month());
        assert_eq!(range.key(), "2025-06");
    }

    #[test]
    fn test_utc_bounds_are_half_open() {
        let period = MetricPeriod::month(2025, 8).unwrap();
        let (from, until) = period.utc_bounds();

        assert_eq!(from.to_rfc3339(), "2025-08-01T00:00:00+00:00");
        assert_eq!(until.to_rfc3339(), "2025-09-01T00:00:00+00:00");
        assert!(period.contains(from));
        assert!(!period.contains(until));
        assert!(period.contains(until - Duration::seconds(1)));
    }

    #[test]
    fn test_period_patterns_compile() {
        let patterns = period_patterns().unwrap();
        assert!(patterns.month.is_match("2025-08"));
        assert!(patterns.range.is_match("2025-08-01..2025-08-09"));
        assert!(patterns.trailing.is_match("30d"));
        assert!(!patterns.trailing.is_match("1000d"));
    }

    #[test]
    fn test_current_month() {
        let period = MetricPeriod::current_month(date(2025, 8, 9));
        assert_eq!(period.key(), "2025-08");
    }
}
