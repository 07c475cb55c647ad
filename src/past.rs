//! Reconciliation of samples whose window already closed.
//!
//! Backfill is aggregated into a batch-local map, checked against the store
//! (the authoritative de-dup boundary across restarts), and flushed with the
//! overwrite policy. The in-memory `handled` set only short-circuits repeat
//! work within one process lifetime.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::flush::{FlushMode, FlushPipeline, FlushReport};
use crate::models::{AggregateState, AggregationRule, Batch, BucketKey, Sample};

// ---

/// A backfill batch whose keys are marked in flight until settled.
#[derive(Debug, Clone)]
pub struct PastBatch {
    pub id: Uuid,
    pub batch: Batch,
}

impl PastBatch {
    pub fn keys(&self) -> Vec<BucketKey> {
        self.batch.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PastReport {
    /// Keys dropped because the store already had a row for them.
    pub already_persisted: Vec<BucketKey>,
    /// Keys written by this reconciliation.
    pub flushed: Vec<BucketKey>,
    pub flush: Option<FlushReport>,
}

pub struct PastAggregator {
    /// Handled key -> bucket start, used for pruning.
    handled: HashMap<BucketKey, DateTime<Utc>>,
    in_flight: HashSet<BucketKey>,
}

impl Default for PastAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl PastAggregator {
    // ---
    pub fn new() -> Self {
        Self {
            handled: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    /// Build a batch from the closed-window samples that are neither handled
    /// nor already in flight. Returns `None` when there is nothing to do.
    pub fn prepare(
        &mut self,
        rule: &AggregationRule,
        samples: &[Sample],
        now: DateTime<Utc>,
    ) -> Result<Option<PastBatch>> {
        // ---
        if !rule.is_active || samples.is_empty() {
            return Ok(None);
        }

        let mut batch = Batch::new();
        for sample in samples {
            let (key, window) = rule.key_of(sample)?;
            if !window.is_closed(now) {
                tracing::debug!(rule_id = rule.id, bucket = %key, "Skipping sample with open window");
                continue;
            }
            if self.handled.contains_key(&key) || self.in_flight.contains(&key) {
                continue;
            }
            batch
                .entry(key)
                .or_insert_with_key(|key| AggregateState::new(key, window, sample))
                .add(sample);
        }

        if batch.is_empty() {
            return Ok(None);
        }

        self.in_flight.extend(batch.keys().cloned());
        Ok(Some(PastBatch {
            id: Uuid::new_v4(),
            batch,
        }))
    }

    /// Record the outcome of a reconciliation started by [`Self::prepare`].
    ///
    /// Only keys that were settled (already persisted, or flushed here) are
    /// marked handled; a failed batch can be retried by later backfill.
    pub fn settle(&mut self, keys: &[BucketKey], report: Option<&PastReport>) {
        // ---
        for key in keys {
            self.in_flight.remove(key);
        }
        if let Some(report) = report {
            for key in report.already_persisted.iter().chain(report.flushed.iter()) {
                self.handled.insert(key.clone(), key.bucket_start);
            }
        }
    }

    /// Prepare, reconcile and settle in one call.
    pub async fn aggregate(
        &mut self,
        pipeline: &FlushPipeline,
        rule: &AggregationRule,
        samples: &[Sample],
        now: DateTime<Utc>,
    ) -> Result<PastReport> {
        // ---
        let Some(batch) = self.prepare(rule, samples, now)? else {
            return Ok(PastReport {
                already_persisted: Vec::new(),
                flushed: Vec::new(),
                flush: None,
            });
        };

        let keys = batch.keys();
        let result = reconcile(pipeline, rule, batch).await;
        self.settle(&keys, result.as_ref().ok());
        result
    }

    pub fn is_handled(&self, key: &BucketKey) -> bool {
        self.handled.contains_key(key)
    }

    pub fn handled_len(&self) -> usize {
        self.handled.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget handled keys whose bucket started more than `retention` ago.
    /// The store check still guards them afterwards.
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) {
        // ---
        let horizon = now - retention;
        self.handled.retain(|_, start| *start > horizon);
    }
}

/// Drop keys the store already has, then flush the rest with overwrite.
///
/// A failed existence check fails the whole batch: nothing is written.
pub async fn reconcile(
    pipeline: &FlushPipeline,
    rule: &AggregationRule,
    past: PastBatch,
) -> Result<PastReport> {
    // ---
    let mut batch = past.batch;
    let candidates: Vec<BucketKey> = batch.keys().cloned().collect();

    let existing = match pipeline
        .store()
        .existing_buckets(rule.storage_target(), &candidates)
        .await
    {
        Ok(existing) => existing,
        Err(e) => {
            pipeline.metrics().record_failed_batch();
            return Err(e).with_context(|| format!("existence check for rule {} failed", rule.id));
        }
    };

    let mut already_persisted = Vec::with_capacity(existing.len());
    for key in existing {
        if batch.remove(&key).is_some() {
            already_persisted.push(key);
        }
    }

    if batch.is_empty() {
        tracing::debug!(
            rule_id = rule.id,
            skipped = already_persisted.len(),
            "All backfill buckets already persisted"
        );
        return Ok(PastReport {
            already_persisted,
            flushed: Vec::new(),
            flush: None,
        });
    }

    let report = pipeline.flush(&batch, rule, FlushMode::Past).await?;
    tracing::debug!(
        rule_id = rule.id,
        flushed = report.records,
        skipped = already_persisted.len(),
        "Reconciled backfill"
    );

    Ok(PastReport {
        already_persisted,
        flushed: batch.into_keys().collect(),
        flush: Some(report),
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::flush::RetryPolicy;
    use crate::metrics::FlushMetrics;
    use crate::models::AggregationMethod;
    use crate::store::{Fault, MemoryStore, MetricStore};
    use chrono::TimeZone;
    use serde_json::json;
    use std::num::NonZeroU32;
    use std::sync::Arc;

    fn create_test_rule() -> AggregationRule {
        // ---
        AggregationRule {
            id: 3,
            tenant_id: "T1".to_string(),
            entity_id: "E1".to_string(),
            method: AggregationMethod::Fast,
            interval: NonZeroU32::new(10).unwrap(),
            bucket_level: None,
            is_active: true,
        }
    }

    fn at(s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap() + Duration::seconds(s)
    }

    fn create_test_sample(c1: f64, secs: i64) -> Sample {
        // ---
        Sample {
            tenant_id: "T1".to_string(),
            device_id: Some("E1".to_string()),
            machine_id: None,
            core_1: c1,
            core_2: c1 * 2.0,
            core_3: None,
            created_at: at(secs),
            data: json!({}),
            lot_id: None,
        }
    }

    fn create_test_pipeline(store: Arc<MemoryStore>) -> FlushPipeline {
        // ---
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
        };
        FlushPipeline::new(store, policy, FlushMetrics::new())
    }

    fn key_at(secs: i64) -> BucketKey {
        BucketKey {
            tenant_id: "T1".to_string(),
            entity_id: "E1".to_string(),
            bucket_start: at(secs),
        }
    }

    #[tokio::test]
    async fn test_backfill_is_flushed_with_overwrite() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let mut past = PastAggregator::new();

        let samples = [create_test_sample(2.0, 1), create_test_sample(4.0, 5)];
        let report = past.aggregate(&pipeline, &rule, &samples, at(60)).await.unwrap();

        assert_eq!(report.flushed, vec![key_at(0)]);
        assert!(report.already_persisted.is_empty());
        assert!(past.is_handled(&key_at(0)));
        let row = store.row(rule.storage_target(), &key_at(0)).unwrap();
        assert_eq!(row.avg_core_1, 3.0);
        assert_eq!(pipeline.metrics().totals().past, 1);
    }

    #[tokio::test]
    async fn test_already_persisted_bucket_is_dropped_without_write() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let mut past = PastAggregator::new();

        let seed = create_test_sample(1.0, 2);
        let (key, window) = rule.key_of(&seed).unwrap();
        let mut state = AggregateState::new(&key, window, &seed);
        state.add(&seed);
        store.insert_row(rule.storage_target(), state.to_row().unwrap());

        let report = past
            .aggregate(&pipeline, &rule, &[create_test_sample(50.0, 7)], at(60))
            .await
            .unwrap();

        assert_eq!(report.already_persisted, vec![key_at(0)]);
        assert!(report.flushed.is_empty());
        assert_eq!(store.upsert_attempts(), 0);
        assert!(past.is_handled(&key_at(0)));
        assert_eq!(store.row(rule.storage_target(), &key_at(0)).unwrap().avg_core_1, 1.0);
    }

    #[tokio::test]
    async fn test_handled_keys_short_circuit_store() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let mut past = PastAggregator::new();

        past.aggregate(&pipeline, &rule, &[create_test_sample(1.0, 1)], at(60))
            .await
            .unwrap();
        assert_eq!(store.existence_checks(), 1);

        let report = past
            .aggregate(&pipeline, &rule, &[create_test_sample(9.0, 3)], at(61))
            .await
            .unwrap();

        assert!(report.flush.is_none());
        assert_eq!(store.existence_checks(), 1);
        assert_eq!(store.upsert_attempts(), 1);
    }

    #[tokio::test]
    async fn test_existence_failure_fails_closed() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.fail_existence_checks(&[Fault::Transient]);
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let mut past = PastAggregator::new();

        let result = past
            .aggregate(&pipeline, &rule, &[create_test_sample(1.0, 1)], at(60))
            .await;

        assert!(result.is_err());
        assert_eq!(store.upsert_attempts(), 0);
        assert!(!past.is_handled(&key_at(0)));
        assert_eq!(past.in_flight_len(), 0);
        assert_eq!(pipeline.metrics().totals().failed_batches, 1);
    }

    #[tokio::test]
    async fn test_empty_or_inactive_is_noop() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = create_test_pipeline(store.clone());
        let mut rule = create_test_rule();
        let mut past = PastAggregator::new();

        past.aggregate(&pipeline, &rule, &[], at(60)).await.unwrap();

        rule.is_active = false;
        past.aggregate(&pipeline, &rule, &[create_test_sample(1.0, 1)], at(60))
            .await
            .unwrap();

        assert_eq!(store.existence_checks(), 0);
        assert_eq!(store.upsert_attempts(), 0);
    }

    #[test]
    fn test_open_window_and_in_flight_samples_are_skipped() {
        // ---
        let rule = create_test_rule();
        let mut past = PastAggregator::new();

        let open = past.prepare(&rule, &[create_test_sample(1.0, 55)], at(56)).unwrap();
        assert!(open.is_none());

        let first = past
            .prepare(&rule, &[create_test_sample(1.0, 1)], at(60))
            .unwrap()
            .unwrap();
        assert_eq!(past.in_flight_len(), 1);

        let second = past.prepare(&rule, &[create_test_sample(2.0, 2)], at(60)).unwrap();
        assert!(second.is_none());

        past.settle(&first.keys(), None);
        assert_eq!(past.in_flight_len(), 0);
        assert!(!past.is_handled(&key_at(0)));
    }

    #[tokio::test]
    async fn test_prune_falls_back_to_store_check() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let mut past = PastAggregator::new();

        past.aggregate(&pipeline, &rule, &[create_test_sample(1.0, 1)], at(60))
            .await
            .unwrap();
        past.prune(at(7_200), Duration::hours(1));
        assert_eq!(past.handled_len(), 0);

        let report = past
            .aggregate(&pipeline, &rule, &[create_test_sample(5.0, 1)], at(7_200))
            .await
            .unwrap();
        assert_eq!(report.already_persisted, vec![key_at(0)]);
        assert_eq!(store.upsert_attempts(), 1);
        assert!(store.ping().await.is_ok());
    }
}
