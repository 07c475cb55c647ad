//! Window assignment for time-bucketed aggregation.
//!
//! Every sample is placed in the closed-open window `[start, start + interval)`
//! whose start is the sample timestamp truncated down to a multiple of the
//! interval, measured from the Unix epoch in UTC. The functions here are pure;
//! a zero interval is reported as an error and never defaulted.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Named bucket granularity carried on an aggregation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketLevel {
    Second,
    Minute,
    Hour,
    Day,
}

impl BucketLevel {
    // ---
    /// Length of one bucket at this granularity, in seconds.
    pub fn seconds(self) -> u32 {
        match self {
            BucketLevel::Second => 1,
            BucketLevel::Minute => 60,
            BucketLevel::Hour => 3_600,
            BucketLevel::Day => 86_400,
        }
    }
}

/// A closed-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BucketWindow {
    // ---
    /// True once wall-clock time has reached the window end.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }
}

/// Truncate `ts` down to the nearest multiple of `interval_secs`.
pub fn bucket_start(ts: DateTime<Utc>, interval_secs: u32) -> Result<DateTime<Utc>> {
    // ---
    if interval_secs == 0 {
        bail!("bucket interval must be greater than zero");
    }

    let width_ms = i64::from(interval_secs) * 1_000;
    let start_ms = ts.timestamp_millis().div_euclid(width_ms) * width_ms;

    DateTime::from_timestamp_millis(start_ms)
        .ok_or_else(|| anyhow!("bucket start {start_ms}ms is out of range"))
}

/// The window that contains `ts` for the given interval.
pub fn window_for(ts: DateTime<Utc>, interval_secs: u32) -> Result<BucketWindow> {
    // ---
    let start = bucket_start(ts, interval_secs)?;
    let end = start
        .checked_add_signed(Duration::seconds(i64::from(interval_secs)))
        .ok_or_else(|| anyhow!("bucket end after {start} is out of range"))?;

    Ok(BucketWindow { start, end })
}
