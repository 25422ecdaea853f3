use chrono::{Datelike, Duration, NaiveDate};
use std::fmt;
use std::str::FromStr;

/// A closed calendar month, identified as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportingPeriod {
    year: i32,
    month: u32,
}

impl ReportingPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// The month preceding the month of `today`.
    pub fn preceding(today: NaiveDate) -> Self {
        // Last day of the previous month: first of this month minus one day.
        let last_day = today.with_day(1).unwrap_or(today) - Duration::days(1);
        Self {
            year: last_day.year(),
            month: last_day.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for ReportingPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got \"{}\"", s))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(format!("expected YYYY-MM, got \"{}\"", s));
        }
        let year: i32 = year.parse().map_err(|_| format!("invalid year in \"{}\"", s))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in \"{}\"", s))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range in \"{}\"", s))
    }
}
