//! Data models for the telemetry aggregator.
//!
//! Samples enter through [`parse_message`], rules through
//! [`AggregationRule::try_from`], and buckets live as [`AggregateState`]
//! until they are turned into a [`MetricRow`] at flush time.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::window::{self, BucketLevel, BucketWindow};

// ---

/// A parsed telemetry sample. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    // ---
    pub tenant_id: String,
    pub device_id: Option<String>,
    pub machine_id: Option<String>,
    pub core_1: f64,
    pub core_2: f64,
    pub core_3: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub data: Value,
    pub lot_id: Option<String>,
}

/// Sample record as it arrives on the wire.
///
/// Channel readings are kept as raw JSON values because producers send them
/// as either numbers or numeric strings.
#[derive(Debug, Deserialize)]
pub struct RawSample {
    // ---
    pub tenant_id: Option<String>,
    pub device_id: Option<String>,
    pub machine_id: Option<String>,
    pub core_1: Option<Value>,
    pub core_2: Option<Value>,
    pub core_3: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub data: Option<Value>,
    pub lot_id: Option<String>,
}

impl RawSample {
    // ---
    /// Validate and convert into a [`Sample`], stamping `received_at` when
    /// the producer did not supply a creation time.
    pub fn into_sample(self, received_at: DateTime<Utc>) -> Result<Sample> {
        // ---
        let tenant_id = non_empty(self.tenant_id).ok_or_else(|| anyhow!("missing tenant_id"))?;
        let device_id = non_empty(self.device_id);
        let machine_id = non_empty(self.machine_id);

        if device_id.is_none() && machine_id.is_none() {
            bail!("sample for tenant {tenant_id} has neither device_id nor machine_id");
        }

        let core_1 = parse_reading(self.core_1.as_ref())
            .context("core_1")?
            .ok_or_else(|| anyhow!("missing core_1"))?;
        let core_2 = parse_reading(self.core_2.as_ref())
            .context("core_2")?
            .ok_or_else(|| anyhow!("missing core_2"))?;
        let core_3 = parse_reading(self.core_3.as_ref()).context("core_3")?;

        Ok(Sample {
            tenant_id,
            device_id,
            machine_id,
            core_1,
            core_2,
            core_3,
            created_at: self.created_at.unwrap_or(received_at),
            data: self
                .data
                .filter(|d| !d.is_null())
                .unwrap_or_else(|| Value::Object(Default::default())),
            lot_id: non_empty(self.lot_id),
        })
    }
}

/// Parse one inbound message.
///
/// Bridges wrap the record in a `payload` field, either as a nested object
/// or as a JSON-encoded string; bare records are accepted as well.
pub fn parse_message(message: Value, received_at: DateTime<Utc>) -> Result<Sample> {
    // ---
    let record = match message {
        Value::Object(mut obj) if obj.contains_key("payload") => {
            match obj.remove("payload").unwrap_or(Value::Null) {
                Value::String(text) => {
                    serde_json::from_str(&text).context("payload is not valid JSON")?
                }
                inner => inner,
            }
        }
        other => other,
    };

    let raw: RawSample = serde_json::from_value(record).context("malformed sample record")?;
    raw.into_sample(received_at)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_reading(value: Option<&Value>) -> Result<Option<f64>> {
    // ---
    let reading = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match reading {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => bail!("reading {:?} is not a finite number", value),
    }
}

// ---

/// Aggregation method tag. Only [`AggregationMethod::Fast`] is handled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    Realtime,
    Fast,
    Hourly,
    Event,
}

impl AggregationMethod {
    // ---
    /// Fully-qualified table that receives this method's rows.
    pub fn table_name(self) -> &'static str {
        match self {
            AggregationMethod::Realtime => "analytics.realtime_metrics",
            AggregationMethod::Fast => "analytics.fast_metrics",
            AggregationMethod::Hourly => "analytics.hourly_metrics",
            AggregationMethod::Event => "analytics.event_metrics",
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            AggregationMethod::Realtime => "realtime",
            AggregationMethod::Fast => "fast",
            AggregationMethod::Hourly => "hourly",
            AggregationMethod::Event => "event",
        };
        f.write_str(tag)
    }
}

/// Rule row as stored in `metric_method_config`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleRecord {
    // ---
    pub id: i64,
    pub tenant_id: String,
    pub entity_id: String,
    pub method: AggregationMethod,
    pub interval_seconds: Option<i64>,
    pub bucket_level: Option<BucketLevel>,
    pub is_active: bool,
}

/// A validated aggregation rule. Never mutated; reloads replace the whole
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRule {
    // ---
    pub id: i64,
    pub tenant_id: String,
    pub entity_id: String,
    pub method: AggregationMethod,
    pub interval: NonZeroU32,
    pub bucket_level: Option<BucketLevel>,
    pub is_active: bool,
}

/// Where a rule's window length came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalSource {
    Explicit,
    BucketLevel,
}

impl AggregationRule {
    // ---
    /// Validate a record, reporting whether the window length had to fall
    /// back to the bucket granularity.
    pub fn from_record(record: RuleRecord) -> Result<(Self, IntervalSource)> {
        // ---
        let explicit = record
            .interval_seconds
            .filter(|s| *s > 0)
            .map(|s| u32::try_from(s).with_context(|| format!("interval {s}s is too large")))
            .transpose()?
            .and_then(NonZeroU32::new);

        let (interval, source) = match (explicit, record.bucket_level) {
            (Some(secs), _) => (secs, IntervalSource::Explicit),
            (None, Some(level)) => (
                NonZeroU32::new(level.seconds())
                    .ok_or_else(|| anyhow!("bucket level {level:?} has no length"))?,
                IntervalSource::BucketLevel,
            ),
            (None, None) => bail!(
                "rule {} has no interval_seconds and no bucket_level",
                record.id
            ),
        };

        let rule = AggregationRule {
            id: record.id,
            tenant_id: record.tenant_id,
            entity_id: record.entity_id,
            method: record.method,
            interval,
            bucket_level: record.bucket_level,
            is_active: record.is_active,
        };
        Ok((rule, source))
    }

    /// True when the sample's device or machine id equals this rule's entity.
    pub fn matches(&self, sample: &Sample) -> bool {
        // ---
        sample.device_id.as_deref() == Some(self.entity_id.as_str())
            || sample.machine_id.as_deref() == Some(self.entity_id.as_str())
    }

    /// Window containing the sample under this rule's interval.
    pub fn window_of(&self, sample: &Sample) -> Result<BucketWindow> {
        window::window_for(sample.created_at, self.interval.get())
    }

    /// Bucket key of the sample under this rule.
    pub fn key_of(&self, sample: &Sample) -> Result<(BucketKey, BucketWindow)> {
        // ---
        let window = self.window_of(sample)?;
        let key = BucketKey {
            tenant_id: sample.tenant_id.clone(),
            entity_id: self.entity_id.clone(),
            bucket_start: window.start,
        };
        Ok((key, window))
    }

    pub fn storage_target(&self) -> &'static str {
        self.method.table_name()
    }
}

impl TryFrom<RuleRecord> for AggregationRule {
    type Error = anyhow::Error;

    fn try_from(record: RuleRecord) -> Result<Self> {
        Self::from_record(record).map(|(rule, _)| rule)
    }
}

// ---

/// Identity of one bucket within a rule's aggregate namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BucketKey {
    pub tenant_id: String,
    pub entity_id: String,
    pub bucket_start: DateTime<Utc>,
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.tenant_id,
            self.entity_id,
            self.bucket_start.to_rfc3339()
        )
    }
}

/// Running accumulator for one bucket.
///
/// Only counts and sums are kept; averages are computed once in
/// [`AggregateState::to_row`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateState {
    // ---
    pub tenant_id: String,
    pub entity_id: String,
    pub device_id: Option<String>,
    pub machine_id: Option<String>,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub count: u64,
    pub sum1: f64,
    pub sum2: f64,
    pub sum3: f64,
    /// Samples that carried a third channel reading.
    pub count3: u64,
    pub data: Value,
    pub lot_id: Option<String>,
}

/// A detached set of buckets handed to the flush pipeline.
pub type Batch = HashMap<BucketKey, AggregateState>;

impl AggregateState {
    // ---
    /// Empty accumulator seeded with the identity fields of its first sample.
    pub fn new(key: &BucketKey, window: BucketWindow, first: &Sample) -> Self {
        // ---
        AggregateState {
            tenant_id: key.tenant_id.clone(),
            entity_id: key.entity_id.clone(),
            device_id: first.device_id.clone(),
            machine_id: first.machine_id.clone(),
            bucket_start: window.start,
            bucket_end: window.end,
            count: 0,
            sum1: 0.0,
            sum2: 0.0,
            sum3: 0.0,
            count3: 0,
            data: first.data.clone(),
            lot_id: first.lot_id.clone(),
        }
    }

    pub fn add(&mut self, sample: &Sample) {
        // ---
        self.count += 1;
        self.sum1 += sample.core_1;
        self.sum2 += sample.core_2;
        if let Some(c3) = sample.core_3 {
            self.sum3 += c3;
            self.count3 += 1;
        }
        if self.lot_id.is_none() {
            self.lot_id = sample.lot_id.clone();
        }
    }

    /// Fold another accumulator for the same bucket into this one.
    pub fn absorb(&mut self, other: AggregateState) {
        // ---
        self.count += other.count;
        self.sum1 += other.sum1;
        self.sum2 += other.sum2;
        self.sum3 += other.sum3;
        self.count3 += other.count3;
        if self.lot_id.is_none() {
            self.lot_id = other.lot_id;
        }
    }

    pub fn key(&self) -> BucketKey {
        BucketKey {
            tenant_id: self.tenant_id.clone(),
            entity_id: self.entity_id.clone(),
            bucket_start: self.bucket_start,
        }
    }

    /// Compute the persisted row. A bucket with no samples cannot exist, so
    /// a zero count is an error rather than a zero average.
    pub fn to_row(&self) -> Result<MetricRow> {
        // ---
        if self.count == 0 {
            bail!("bucket {} has a zero sample count", self.key());
        }
        let n = self.count as f64;

        Ok(MetricRow {
            tenant_id: self.tenant_id.clone(),
            entity_id: self.entity_id.clone(),
            device_id: self.device_id.clone(),
            machine_id: self.machine_id.clone(),
            bucket_start: self.bucket_start,
            avg_core_1: self.sum1 / n,
            avg_core_2: self.sum2 / n,
            avg_core_3: (self.count3 > 0).then(|| self.sum3 / self.count3 as f64),
            data: self.data.clone(),
            lot_id: self.lot_id.clone(),
        })
    }
}

/// One persisted aggregate row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    // ---
    pub tenant_id: String,
    pub entity_id: String,
    pub device_id: Option<String>,
    pub machine_id: Option<String>,
    pub bucket_start: DateTime<Utc>,
    pub avg_core_1: f64,
    pub avg_core_2: f64,
    pub avg_core_3: Option<f64>,
    pub data: Value,
    pub lot_id: Option<String>,
}

impl MetricRow {
    pub fn key(&self) -> BucketKey {
        BucketKey {
            tenant_id: self.tenant_id.clone(),
            entity_id: self.entity_id.clone(),
            bucket_start: self.bucket_start,
        }
    }
}
