//! Calendar period keys
//!
//! A [`PeriodKey`] records the calendar period a shard was created in. Shard
//! names always carry day precision; the boundary check compares only the
//! parts the active rotation mode cares about.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RotationMode;
use crate::error::{Error, Result};

/// Calendar period a shard belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodKey {
    pub year: i32,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.month, self.day) {
            (Some(month), Some(day)) => write!(f, "{:04}-{:02}-{:02}", self.year, month, day),
            (Some(month), None) => write!(f, "{:04}-{:02}", self.year, month),
            _ => write!(f, "{:04}", self.year),
        }
    }
}

impl PeriodKey {
    /// Create a year-only key
    pub fn year(year: i32) -> Self {
        Self {
            year,
            month: None,
            day: None,
        }
    }

    /// Create a year and month key
    pub fn month(year: i32, month: u32) -> Self {
        Self {
            year,
            month: Some(month),
            day: None,
        }
    }

    /// Create a key with day precision
    pub fn day(year: i32, month: u32, day: u32) -> Self {
        Self {
            year,
            month: Some(month),
            day: Some(day),
        }
    }

    /// Day-precision key of a timestamp
    pub fn from_timestamp(timestamp: &DateTime<Utc>) -> Self {
        Self::day(timestamp.year(), timestamp.month(), timestamp.day())
    }

    /// Parse `YYYY`, `YYYY-MM`, `YYYY_MM` or `YYYY-MM-DD`
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || Error::validation(format!("Invalid period key: {}", text));

        let parts: Vec<&str> = text.split(|c| c == '-' || c == '_').collect();
        if parts.iter().any(|part| part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit())) {
            return Err(invalid());
        }
        if parts[0].len() != 4 {
            return Err(invalid());
        }

        let year: i32 = parts[0].parse().map_err(|_| invalid())?;
        let key = match parts.len() {
            1 => Self::year(year),
            2 => {
                let month: u32 = parts[1].parse().map_err(|_| invalid())?;
                if !(1..=12).contains(&month) {
                    return Err(invalid());
                }
                Self::month(year, month)
            }
            3 => {
                let month: u32 = parts[1].parse().map_err(|_| invalid())?;
                let day: u32 = parts[2].parse().map_err(|_| invalid())?;
                NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
                Self::day(year, month, day)
            }
            _ => return Err(invalid()),
        };

        Ok(key)
    }

    /// Find a period inside a shard name such as `shard_2024-05-17` or `db_2023`
    pub fn from_shard_name(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            if bytes[start].is_ascii_digit() && (start == 0 || !bytes[start - 1].is_ascii_digit()) {
                let end = name[start..]
                    .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '_'))
                    .map(|offset| start + offset)
                    .unwrap_or(name.len());
                let candidate = name[start..end].trim_end_matches(|c| c == '-' || c == '_');
                if let Ok(key) = Self::parse(candidate) {
                    return Some(key);
                }
            }
            start += 1;
        }
        None
    }

    /// Whether `now` lies in a later period than this key under `mode`
    ///
    /// A key without a month is treated as earlier than any month of its year.
    pub fn boundary_crossed(&self, now: &DateTime<Utc>, mode: RotationMode) -> bool {
        match mode {
            RotationMode::Yearly => now.year() > self.year,
            RotationMode::Monthly => {
                match now.year().cmp(&self.year) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => match self.month {
                        Some(month) => now.month() > month,
                        None => true,
                    },
                }
            }
            RotationMode::Manual => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_key_display() {
        assert_eq!(PeriodKey::year(2024).to_string(), "2024");
        assert_eq!(PeriodKey::month(2024, 5).to_string(), "2024-05");
        assert_eq!(PeriodKey::day(2024, 5, 7).to_string(), "2024-05-07");

        let timestamp = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(PeriodKey::from_timestamp(&timestamp), PeriodKey::day(2023, 12, 31));
    }

    #[test]
    fn test_period_key_parsing() -> Result<()> {
        assert_eq!(PeriodKey::parse("2024")?, PeriodKey::year(2024));
        assert_eq!(PeriodKey::parse("2024-05")?, PeriodKey::month(2024, 5));
        assert_eq!(PeriodKey::parse("2024_05")?, PeriodKey::month(2024, 5));
        assert_eq!(PeriodKey::parse("2024-05-17")?, PeriodKey::day(2024, 5, 17));

        for bad in ["", "24", "2024-13", "2024-02-30", "2024--01", "abcd", "2024-05-17-01"] {
            assert!(PeriodKey::parse(bad).is_err(), "{} should not parse", bad);
        }
        Ok(())
    }

    #[test]
    fn test_period_from_shard_name() {
        assert_eq!(
            PeriodKey::from_shard_name("shard_2024-05-17"),
            Some(PeriodKey::day(2024, 5, 17))
        );
        assert_eq!(PeriodKey::from_shard_name("db_2023_04"), Some(PeriodKey::month(2023, 4)));
        assert_eq!(PeriodKey::from_shard_name("archive2022"), Some(PeriodKey::year(2022)));
        assert_eq!(PeriodKey::from_shard_name("default"), None);
        assert_eq!(PeriodKey::from_shard_name("node_12"), None);
    }

    #[test]
    fn test_boundary_by_mode() {
        let key = PeriodKey::day(2024, 5, 17);
        let same_month = Utc.with_ymd_and_hms(2024, 5, 30, 0, 0, 0).unwrap();
        let next_month = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let next_year = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        assert!(!key.boundary_crossed(&same_month, RotationMode::Monthly));
        assert!(key.boundary_crossed(&next_month, RotationMode::Monthly));
        assert!(!key.boundary_crossed(&next_month, RotationMode::Yearly));
        assert!(key.boundary_crossed(&next_year, RotationMode::Yearly));
        assert!(!key.boundary_crossed(&next_year, RotationMode::Manual));

        assert!(PeriodKey::year(2024).boundary_crossed(&same_month, RotationMode::Monthly));
        let earlier = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert!(!key.boundary_crossed(&earlier, RotationMode::Monthly));
    }
}
