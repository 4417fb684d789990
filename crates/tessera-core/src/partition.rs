//! Month-bucketed partition keys.
//!
//! A [`PartitionKey`] is the sole sharding unit of the system: every dataset
//! is stored, fingerprinted and processed one calendar month at a time.
//!
//! # Canonical Encodings
//!
//! ```text
//! month id   ::= YYYY "-" MM              e.g. 2024-03
//! hive path  ::= "year=" YYYY "/month=" MM  e.g. year=2024/month=03
//! ```
//!
//! Both encodings are zero-padded so that lexicographic order of the encoded
//! strings equals the `(year, month)` order of the keys.
//!
//! # Examples
//!
//! ```rust
//! use tessera_core::partition::PartitionKey;
//!
//! let key: PartitionKey = "2024-02".parse().expect("valid month id");
//! assert_eq!(key.days_in_month(), 29);
//! assert_eq!(PartitionKey::parse_hive_path("year=2024/month=02"), Ok(key));
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Largest year representable in the four-digit hive encoding.
const MAX_YEAR: i32 = 9999;

/// A `(year, month)` partition key.
///
/// Ordering is total and follows `(year, month)`; field order matters for the
/// derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPartitionKey", into = "RawPartitionKey")]
pub struct PartitionKey {
    year: i32,
    month: u32,
}

#[derive(Serialize, Deserialize)]
struct RawPartitionKey {
    year: i32,
    month: u32,
}

impl TryFrom<RawPartitionKey> for PartitionKey {
    type Error = PartitionKeyParseError;

    fn try_from(raw: RawPartitionKey) -> Result<Self, Self::Error> {
        Self::new(raw.year, raw.month)
    }
}

impl From<PartitionKey> for RawPartitionKey {
    fn from(key: PartitionKey) -> Self {
        Self {
            year: key.year,
            month: key.month,
        }
    }
}

impl PartitionKey {
    /// Creates a partition key, validating the month and year ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if `month` is outside `1..=12` or `year` outside `0..=9999`.
    pub fn new(year: i32, month: u32) -> Result<Self, PartitionKeyParseError> {
        if !(1..=12).contains(&month) {
            return Err(PartitionKeyParseError::InvalidMonth(month.to_string()));
        }
        if !(0..=MAX_YEAR).contains(&year) {
            return Err(PartitionKeyParseError::InvalidYear(year.to_string()));
        }
        Ok(Self { year, month })
    }

    /// Returns the partition key containing the given date.
    ///
    /// # Errors
    ///
    /// Returns an error if the date's year is outside `0..=9999`.
    pub fn containing(date: NaiveDate) -> Result<Self, PartitionKeyParseError> {
        Self::new(date.year(), date.month())
    }

    /// Returns the calendar year.
    #[must_use]
    pub const fn year(&self) -> i32 {
        self.year
    }

    /// Returns the calendar month (1-12).
    #[must_use]
    pub const fn month(&self) -> u32 {
        self.month
    }

    /// Returns the following month.
    #[must_use]
    pub const fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Returns the preceding month.
    #[must_use]
    pub const fn prev(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Returns the first day of the month.
    #[must_use]
    pub fn first_day(&self) -> NaiveDate {
        // Month and year are validated at construction.
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Returns the number of days in the month.
    #[must_use]
    pub fn days_in_month(&self) -> u32 {
        let next = self.next().first_day();
        let days = next.signed_duration_since(self.first_day()).num_days();
        u32::try_from(days).unwrap_or(0)
    }

    /// Returns every date of the month in ascending order.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        self.first_day().iter_days().take(self.days_in_month() as usize)
    }

    /// Returns true if the date falls inside this month.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// Returns the `YYYY-MM` month id.
    #[must_use]
    pub fn month_id(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Returns the hive-style path segment `year=YYYY/month=MM`.
    #[must_use]
    pub fn hive_path(&self) -> String {
        format!("year={:04}/month={:02}", self.year, self.month)
    }

    /// Returns every month from `start` to `end`, both inclusive.
    ///
    /// Returns an empty vector when `end < start`.
    #[must_use]
    pub fn range_inclusive(start: Self, end: Self) -> Vec<Self> {
        let mut months = Vec::new();
        let mut current = start;
        while current <= end {
            months.push(current);
            current = current.next();
        }
        months
    }

    /// Parses a `year=YYYY/month=MM` hive path segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is malformed.
    pub fn parse_hive_path(s: &str) -> Result<Self, PartitionKeyParseError> {
        let (year_part, month_part) = s
            .split_once('/')
            .ok_or_else(|| PartitionKeyParseError::Malformed(s.to_string()))?;
        let year = year_part
            .strip_prefix("year=")
            .ok_or_else(|| PartitionKeyParseError::Malformed(s.to_string()))?;
        let month = month_part
            .strip_prefix("month=")
            .ok_or_else(|| PartitionKeyParseError::Malformed(s.to_string()))?;
        Self::from_parts(year, month)
    }

    fn from_parts(year: &str, month: &str) -> Result<Self, PartitionKeyParseError> {
        if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
            return Err(PartitionKeyParseError::InvalidYear(year.to_string()));
        }
        if month.len() != 2 || !month.chars().all(|c| c.is_ascii_digit()) {
            return Err(PartitionKeyParseError::InvalidMonth(month.to_string()));
        }
        let year: i32 = year
            .parse()
            .map_err(|_| PartitionKeyParseError::InvalidYear(year.to_string()))?;
        let month: u32 = month
            .parse()
            .map_err(|_| PartitionKeyParseError::InvalidMonth(month.to_string()))?;
        Self::new(year, month)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for PartitionKey {
    type Err = PartitionKeyParseError;

    /// Parses a `YYYY-MM` month id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| PartitionKeyParseError::Malformed(s.to_string()))?;
        Self::from_parts(year, month)
    }
}

/// Errors that can occur when constructing or parsing a partition key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionKeyParseError {
    /// The string does not follow either canonical encoding.
    #[error("malformed partition key: {0}")]
    Malformed(String),
    /// The year is not a four-digit value.
    #[error("invalid year: {0}")]
    InvalidYear(String),
    /// The month is not in `01..=12`.
    #[error("invalid month: {0}")]
    InvalidMonth(String),
}
