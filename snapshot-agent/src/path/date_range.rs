//! Instant intervals used to bound manifest and incremental searches.

use crate::path::backup_path::{format_millis, format_v1_time, parse_v1_time};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(BackupError::Config(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The window of length `window` ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, window: Duration) -> Self {
        Self {
            start: end - window,
            end,
        }
    }

    /// Everything up to `end`.
    pub fn until(end: DateTime<Utc>) -> Self {
        Self {
            start: DateTime::<Utc>::UNIX_EPOCH,
            end,
        }
    }

    pub fn contains(&self, instant: &DateTime<Utc>) -> bool {
        *instant >= self.start && *instant <= self.end
    }

    /// Longest common prefix of both ends in V1 `yyyyMMddHHmm` form, usable as
    /// a remote listing filter.
    pub fn v1_match(&self) -> String {
        common_prefix(&format_v1_time(&self.start), &format_v1_time(&self.end))
    }

    /// Longest common prefix of both ends as fixed-width epoch millis.
    pub fn millis_match(&self) -> String {
        common_prefix(&format_millis(&self.start), &format_millis(&self.end))
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", format_v1_time(&self.start), format_v1_time(&self.end))
    }
}

/// Parses `yyyyMMddHHmm,yyyyMMddHHmm`.
impl FromStr for DateRange {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once(',')
            .ok_or_else(|| BackupError::Config(format!("invalid date range {s}")))?;
        let parse = |v: &str| {
            parse_v1_time(v.trim())
                .ok_or_else(|| BackupError::Config(format!("invalid date {v} in range {s}")))
        };
        DateRange::new(parse(start)?, parse(end)?)
    }
}

fn common_prefix(a: &str, b: &str) -> String {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}
