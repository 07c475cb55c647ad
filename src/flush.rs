//! Transactional flush of aggregated buckets.
//!
//! A batch is written in a single transaction, wrapped in an exponential
//! backoff retry loop. Unique violations outside the conflict target are
//! surfaced after the first attempt; every other failure is retried until
//! the attempt budget is spent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::metrics::FlushMetrics;
use crate::models::{AggregationRule, Batch, MetricRow};
use crate::store::{self, MetricStore};

// ---

/// Which path produced a batch; decides conflict handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Window just closed; insert-only, first writer wins.
    Live,
    /// Backfill; overwrites an existing row.
    Past,
}

impl FlushMode {
    pub fn overwrites(self) -> bool {
        matches!(self, FlushMode::Past)
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlushMode::Live => "live",
            FlushMode::Past => "past",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Outcome of a committed flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub flush_id: Uuid,
    pub records: usize,
    pub mode: FlushMode,
    pub attempts: u32,
}

/// Shared by the live and past paths of every rule worker.
#[derive(Clone)]
pub struct FlushPipeline {
    store: Arc<dyn MetricStore>,
    policy: RetryPolicy,
    metrics: FlushMetrics,
}

impl FlushPipeline {
    // ---
    pub fn new(store: Arc<dyn MetricStore>, policy: RetryPolicy, metrics: FlushMetrics) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetricStore> {
        &self.store
    }

    pub fn metrics(&self) -> &FlushMetrics {
        &self.metrics
    }

    /// Persist `batch` for `rule`. Empty batches are a no-op reported as
    /// zero records.
    pub async fn flush(
        &self,
        batch: &Batch,
        rule: &AggregationRule,
        mode: FlushMode,
    ) -> Result<FlushReport> {
        // ---
        let flush_id = Uuid::new_v4();
        if batch.is_empty() {
            return Ok(FlushReport {
                flush_id,
                records: 0,
                mode,
                attempts: 0,
            });
        }

        let rows = batch
            .values()
            .map(|state| state.to_row())
            .collect::<Result<Vec<MetricRow>>>()?;
        let target = rule.storage_target();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .store
                .upsert_batch(target, &rows, mode.overwrites())
                .await;

            match result {
                Ok(()) => {
                    tracing::debug!(
                        rule_id = rule.id,
                        %flush_id,
                        %mode,
                        records = rows.len(),
                        attempt,
                        "Flushed aggregated records"
                    );
                    self.metrics.record_flush(rows.len(), mode);
                    return Ok(FlushReport {
                        flush_id,
                        records: rows.len(),
                        mode,
                        attempts: attempt,
                    });
                }
                Err(e) if !store::is_retryable(&e) => {
                    tracing::error!(
                        rule_id = rule.id,
                        %flush_id,
                        %mode,
                        error = %e,
                        "Flush hit a non-retryable conflict"
                    );
                    self.metrics.record_failed_batch();
                    return Err(e).context(format!("{mode} flush for rule {} rejected", rule.id));
                }
                Err(e) if attempt >= self.policy.max_attempts => {
                    tracing::error!(
                        rule_id = rule.id,
                        %flush_id,
                        %mode,
                        attempts = attempt,
                        error = %e,
                        "All flush retries failed"
                    );
                    self.metrics.record_failed_batch();
                    return Err(e).context(format!(
                        "{mode} flush for rule {} failed after {attempt} attempts",
                        rule.id
                    ));
                }
                Err(e) => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        rule_id = rule.id,
                        %flush_id,
                        %mode,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Flush attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{AggregateState, AggregationMethod, Sample};
    use crate::store::{Fault, MemoryStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::num::NonZeroU32;

    fn create_test_rule() -> AggregationRule {
        // ---
        AggregationRule {
            id: 7,
            tenant_id: "T1".to_string(),
            entity_id: "E1".to_string(),
            method: AggregationMethod::Fast,
            interval: NonZeroU32::new(10).unwrap(),
            bucket_level: None,
            is_active: true,
        }
    }

    fn create_test_batch(rule: &AggregationRule, values: &[(f64, f64)]) -> Batch {
        // ---
        let mut batch = Batch::new();
        for (c1, c2) in values {
            let sample = Sample {
                tenant_id: "T1".to_string(),
                device_id: Some("E1".to_string()),
                machine_id: None,
                core_1: *c1,
                core_2: *c2,
                core_3: None,
                created_at: Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 3).unwrap(),
                data: json!({}),
                lot_id: None,
            };
            let (key, window) = rule.key_of(&sample).unwrap();
            batch
                .entry(key.clone())
                .or_insert_with(|| AggregateState::new(&key, window, &sample))
                .add(&sample);
        }
        batch
    }

    fn create_test_pipeline(store: Arc<MemoryStore>) -> FlushPipeline {
        // ---
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
        };
        FlushPipeline::new(store, policy, FlushMetrics::new())
    }

    #[test]
    fn test_backoff_doubles() {
        // ---
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn test_mode_conflict_policy() {
        // ---
        assert!(!FlushMode::Live.overwrites());
        assert!(FlushMode::Past.overwrites());
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = create_test_pipeline(store.clone());

        let report = pipeline
            .flush(&Batch::new(), &create_test_rule(), FlushMode::Live)
            .await
            .unwrap();

        assert_eq!(report.records, 0);
        assert_eq!(store.upsert_attempts(), 0);
    }

    #[tokio::test]
    async fn test_flush_persists_averages() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let batch = create_test_batch(&rule, &[(1.0, 2.0), (3.0, 4.0), (5.0, 6.0)]);
        let key = batch.keys().next().unwrap().clone();

        let report = pipeline.flush(&batch, &rule, FlushMode::Live).await.unwrap();

        assert_eq!(report.records, 1);
        assert_eq!(report.attempts, 1);
        let row = store.row(rule.storage_target(), &key).unwrap();
        assert_eq!(row.avg_core_1, 3.0);
        assert_eq!(row.avg_core_2, 4.0);
        assert_eq!(pipeline.metrics().totals().live, 1);
    }

    #[tokio::test]
    async fn test_transient_faults_are_retried() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.fail_upserts(&[Fault::Transient, Fault::Transient]);
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let batch = create_test_batch(&rule, &[(1.0, 1.0)]);

        let report = pipeline.flush(&batch, &rule, FlushMode::Live).await.unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(store.upsert_attempts(), 3);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.fail_upserts(&[Fault::Conflict]);
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let batch = create_test_batch(&rule, &[(1.0, 1.0)]);

        let result = pipeline.flush(&batch, &rule, FlushMode::Past).await;

        assert!(result.is_err());
        assert!(!store::is_retryable(&result.unwrap_err()));
        assert_eq!(store.upsert_attempts(), 1);
        assert_eq!(pipeline.metrics().totals().failed_batches, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.fail_upserts(&[Fault::Transient; 4]);
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let batch = create_test_batch(&rule, &[(1.0, 1.0)]);

        let result = pipeline.flush(&batch, &rule, FlushMode::Live).await;

        assert!(result.is_err());
        assert_eq!(store.upsert_attempts(), 4);
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_live_does_not_overwrite_but_past_does() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = create_test_pipeline(store.clone());
        let rule = create_test_rule();
        let first = create_test_batch(&rule, &[(1.0, 1.0)]);
        let second = create_test_batch(&rule, &[(9.0, 9.0)]);
        let key = first.keys().next().unwrap().clone();

        pipeline.flush(&first, &rule, FlushMode::Live).await.unwrap();
        pipeline.flush(&second, &rule, FlushMode::Live).await.unwrap();
        assert_eq!(store.row(rule.storage_target(), &key).unwrap().avg_core_1, 1.0);

        pipeline.flush(&second, &rule, FlushMode::Past).await.unwrap();
        assert_eq!(store.row(rule.storage_target(), &key).unwrap().avg_core_1, 9.0);
    }
}
