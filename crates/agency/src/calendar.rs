//! ISO year-week keys (`2026-W42`) used to label settlements and guard the
//! auto-pilot against running twice in one week.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use studio_core::DomainError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekKey(String);

impl WeekKey {
    pub fn from_date(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self(format!("{}-W{:02}", iso.year(), iso.week()))
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::validation(format!("week key must look like 2026-W07: {value}"));
        let (year, week) = value.split_once("-W").ok_or_else(invalid)?;
        if year.len() != 4 || week.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let week: u32 = week.parse().map_err(|_| invalid())?;
        if NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon).is_none() {
            return Err(invalid());
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WeekKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
