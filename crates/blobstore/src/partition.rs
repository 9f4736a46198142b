//! Date partitions used to lay blobs out on disk and in object storage.
//!
//! Every blob lives under a `YYYY/MM/DD/hh/mm` directory derived from its
//! creation minute (UTC).

use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Number of directory levels in a date partition.
pub const PARTITION_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatePath {
    pub year: u32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl DatePath {
    pub fn from_datetime(at: &DateTime<Utc>) -> Self {
        Self {
            year: at.year().max(0) as u32,
            month: at.month(),
            day: at.day(),
            hour: at.hour(),
            minute: at.minute(),
        }
    }

    /// Parse the compact `YYYYMMDDhhmm` stamp embedded in generated blob ids.
    pub fn from_stamp(stamp: &str) -> Option<Self> {
        if stamp.len() != 12 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let field = |range: std::ops::Range<usize>| stamp[range].parse::<u32>().ok();
        let path = Self {
            year: field(0..4)?,
            month: field(4..6)?,
            day: field(6..8)?,
            hour: field(8..10)?,
            minute: field(10..12)?,
        };
        path.is_plausible().then_some(path)
    }

    pub fn stamp(&self) -> String {
        format!(
            "{:04}{:02}{:02}{:02}{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }

    /// Numeric segments, coarsest first.
    pub fn segments(&self) -> [u32; PARTITION_DEPTH] {
        [self.year, self.month, self.day, self.hour, self.minute]
    }

    fn is_plausible(&self) -> bool {
        (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour < 24
            && self.minute < 60
    }
}

impl fmt::Display for DatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}/{:02}/{:02}/{:02}/{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}
