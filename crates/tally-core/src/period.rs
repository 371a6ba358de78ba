use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("invalid month {0:?}: expected YYYY-MM or YYYY-MM-DD")]
    InvalidMonth(String),
    #[error("month arithmetic overflow from {month} by {months} months")]
    Overflow { month: String, months: u32 },
}

/// A calendar month, always stored as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Month(NaiveDate);

impl Month {
    pub fn from_ymd(year: i32, month: u32) -> Result<Self, PeriodError> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or_else(|| PeriodError::InvalidMonth(format!("{year:04}-{month:02}")))
    }

    pub fn containing(date: NaiveDate) -> Self {
        // day 1 always exists for a valid date's year/month
        Self(date.with_day(1).unwrap_or(date))
    }

    pub fn start(&self) -> NaiveDate {
        self.0
    }

    /// Last calendar day of the month (inclusive end).
    pub fn last_day(&self) -> NaiveDate {
        self.next()
            .map(|next| next.0.pred_opt().unwrap_or(next.0))
            .unwrap_or(self.0)
    }

    /// First day of the following month (exclusive end).
    pub fn next_start(&self) -> NaiveDate {
        self.next().map(|next| next.0).unwrap_or(self.0)
    }

    pub fn next(&self) -> Result<Self, PeriodError> {
        self.plus_months(1)
    }

    pub fn prev(&self) -> Result<Self, PeriodError> {
        self.minus_months(1)
    }

    pub fn plus_months(&self, months: u32) -> Result<Self, PeriodError> {
        self.0
            .checked_add_months(Months::new(months))
            .map(Self)
            .ok_or_else(|| PeriodError::Overflow {
                month: self.as_ymd(),
                months,
            })
    }

    pub fn minus_months(&self, months: u32) -> Result<Self, PeriodError> {
        self.0
            .checked_sub_months(Months::new(months))
            .map(Self)
            .ok_or_else(|| PeriodError::Overflow {
                month: self.as_ymd(),
                months,
            })
    }

    pub fn as_ymd(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_ymd())
    }
}

impl FromStr for Month {
    type Err = PeriodError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let parsed = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d"))
            .map_err(|_| PeriodError::InvalidMonth(input.to_string()))?;
        if parsed.day() != 1 {
            return Err(PeriodError::InvalidMonth(input.to_string()));
        }
        Ok(Self(parsed))
    }
}

impl TryFrom<String> for Month {
    type Error = PeriodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Month> for String {
    fn from(value: Month) -> Self {
        value.as_ymd()
    }
}

/// Scope of one aggregation job and of the partition it produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey {
    pub month: Month,
    #[serde(default)]
    pub state_id: Option<String>,
}

impl PeriodKey {
    pub fn month(month: Month) -> Self {
        Self {
            month,
            state_id: None,
        }
    }

    pub fn month_state(month: Month, state_id: impl Into<String>) -> Self {
        Self {
            month,
            state_id: Some(state_id.into()),
        }
    }

    pub fn shifted_back(&self, months: u32) -> Result<Self, PeriodError> {
        Ok(Self {
            month: self.month.minus_months(months)?,
            state_id: self.state_id.clone(),
        })
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state_id {
            Some(state) => write!(f, "{}/{}", self.month, state),
            None => write!(f, "{}", self.month),
        }
    }
}
