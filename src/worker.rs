//! One worker task per aggregation rule.
//!
//! The worker is the single writer of its rule's live buffer and handled
//! set. Samples arrive through a bounded mailbox; a fixed-cadence tick
//! selects closed buckets and queued backfill; flushes run as detached
//! tasks so the mailbox keeps draining while a transaction is in flight.
//! Their results come back to the worker, which confirms, restores or
//! dead-letters the affected buckets.
//!
//! A key has one accumulator at a time. A late sample for a closed bucket
//! that is still open in the live buffer merges there; one for a bucket
//! whose live flush is in flight waits for that flush to settle.

use std::future::Future;
use std::mem;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::flush::{FlushMode, FlushPipeline, FlushReport};
use crate::live::{LiveBuffer, MergeOutcome, PendingFlush};
use crate::models::{AggregationRule, Batch, BucketKey, Sample};
use crate::past::{self, PastAggregator, PastReport};
use crate::router::Route;
use crate::store;

// ---

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Cadence of the closed-bucket scan.
    pub poll_interval: Duration,
    /// Queued backfill samples that trigger an early reconciliation.
    pub past_batch_max: usize,
    /// Failed live flushes a bucket survives before it is dead-lettered.
    pub max_restores: u32,
    /// How long selected and handled keys are remembered.
    pub retention: chrono::Duration,
    pub queue_depth: usize,
    /// Bound on the final flush when the mailbox closes without a
    /// shutdown message.
    pub drain_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            past_batch_max: 500,
            max_restores: 3,
            retention: chrono::Duration::hours(24),
            queue_depth: 10_000,
            drain_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub enum WorkerMessage {
    Sample { sample: Sample, route: Route },
    /// Flush everything, waiting at most `grace` before dead-lettering.
    Shutdown { grace: Duration },
}

/// Sending side of a worker's mailbox.
#[derive(Debug, Clone)]
pub struct RuleWorkerHandle {
    pub rule_id: i64,
    tx: mpsc::Sender<WorkerMessage>,
}

impl RuleWorkerHandle {
    // ---
    /// Queue a sample without waiting. Fails when the mailbox is full or
    /// the worker is gone.
    pub fn try_send(
        &self,
        sample: Sample,
        route: Route,
    ) -> Result<(), mpsc::error::TrySendError<WorkerMessage>> {
        self.tx.try_send(WorkerMessage::Sample { sample, route })
    }

    /// Ask the worker to stop intake, flush everything and exit.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.tx.send(WorkerMessage::Shutdown { grace }).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct SpawnedWorker {
    pub handle: RuleWorkerHandle,
    pub task: JoinHandle<()>,
}

/// Start the worker task for `rule`.
pub fn spawn(rule: AggregationRule, pipeline: FlushPipeline, settings: WorkerSettings) -> SpawnedWorker {
    // ---
    let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
    let handle = RuleWorkerHandle {
        rule_id: rule.id,
        tx,
    };

    let worker = RuleWorker {
        live: LiveBuffer::new(settings.max_restores),
        past: PastAggregator::new(),
        past_queue: Vec::new(),
        deferred: Vec::new(),
        in_flight: JoinSet::new(),
        rule,
        pipeline,
        settings,
    };
    let task = tokio::spawn(worker.run(rx));

    SpawnedWorker { handle, task }
}

enum FlushDone {
    Live {
        id: Uuid,
        result: Result<FlushReport>,
    },
    Past {
        keys: Vec<BucketKey>,
        result: Result<PastReport>,
    },
}

struct RuleWorker {
    rule: AggregationRule,
    pipeline: FlushPipeline,
    settings: WorkerSettings,
    live: LiveBuffer,
    past: PastAggregator,
    past_queue: Vec<Sample>,
    /// Late samples for buckets whose live flush has not settled.
    deferred: Vec<Sample>,
    in_flight: JoinSet<FlushDone>,
}

/// Run `fut` on its own task so a panic comes back as an error instead of
/// losing track of the batch. Dropping the caller aborts the task.
async fn run_isolated<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    // ---
    struct AbortOnDrop<T>(JoinHandle<T>);

    impl<T> Drop for AbortOnDrop<T> {
        fn drop(&mut self) {
            self.0.abort();
        }
    }

    let mut task = AbortOnDrop(tokio::spawn(fut));
    match (&mut task.0).await {
        Ok(result) => result,
        Err(e) => Err(anyhow!("flush task failed: {e}")),
    }
}

impl RuleWorker {
    // ---
    async fn run(mut self, mut inbox: mpsc::Receiver<WorkerMessage>) {
        // ---
        tracing::info!(rule_id = self.rule.id, entity_id = %self.rule.entity_id, "Started worker");

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let grace = loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(WorkerMessage::Sample { sample, route }) => self.accept(sample, route),
                    Some(WorkerMessage::Shutdown { grace }) => break grace,
                    None => break self.settings.drain_grace,
                },
                _ = ticker.tick() => self.on_tick(),
                Some(done) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.on_done(done);
                }
            }
        };

        inbox.close();
        while let Ok(WorkerMessage::Sample { sample, route }) = inbox.try_recv() {
            self.accept(sample, route);
        }
        self.drain(grace).await;
        tracing::info!(rule_id = self.rule.id, "Stopped worker");
    }

    fn accept(&mut self, sample: Sample, route: Route) {
        // ---
        let key = match self.rule.key_of(&sample) {
            Ok((key, _)) => key,
            Err(e) => {
                tracing::warn!(rule_id = self.rule.id, error = %e, "Dropping unbucketable sample");
                self.pipeline.metrics().record_rejected_sample();
                return;
            }
        };

        if self.live.is_pending(&key) {
            tracing::debug!(rule_id = self.rule.id, bucket = %key, "Holding sample until live flush settles");
            self.deferred.push(sample);
            return;
        }
        if route == Route::Past && !self.live.contains(&key) {
            self.queue_past(sample);
            return;
        }

        match self.live.merge(&self.rule, &sample) {
            Ok(MergeOutcome::Merged) => {}
            Ok(MergeOutcome::AlreadySelected) => self.queue_past(sample),
            Err(e) => {
                tracing::warn!(rule_id = self.rule.id, error = %e, "Dropping unbucketable sample");
                self.pipeline.metrics().record_rejected_sample();
            }
        }
    }

    /// Re-route held samples once the flush they waited on has settled:
    /// restored buckets take them live, confirmed ones send them to backfill.
    fn release_deferred(&mut self) {
        // ---
        for sample in mem::take(&mut self.deferred) {
            self.accept(sample, Route::Past);
        }
    }

    fn queue_past(&mut self, sample: Sample) {
        // ---
        self.past_queue.push(sample);
        if self.past_queue.len() >= self.settings.past_batch_max {
            self.start_past();
        }
    }

    fn on_tick(&mut self) {
        // ---
        let now = Utc::now();
        if let Some(pending) = self.live.collect_closed(now) {
            self.start_live(pending);
        }
        if !self.past_queue.is_empty() {
            self.start_past();
        }
        self.live.prune_selected(now, self.settings.retention);
        self.past.prune(now, self.settings.retention);
    }

    fn start_live(&mut self, pending: PendingFlush) {
        // ---
        let pipeline = self.pipeline.clone();
        let rule = self.rule.clone();
        let PendingFlush { id, batch } = pending;
        self.in_flight.spawn(async move {
            let result = run_isolated(async move {
                pipeline.flush(&batch, &rule, FlushMode::Live).await
            })
            .await;
            FlushDone::Live { id, result }
        });
    }

    fn start_past(&mut self) {
        // ---
        let samples = mem::take(&mut self.past_queue);
        let batch = match self.past.prepare(&self.rule, &samples, Utc::now()) {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(rule_id = self.rule.id, error = %e, "Dropping backfill samples");
                return;
            }
        };

        let pipeline = self.pipeline.clone();
        let rule = self.rule.clone();
        let keys = batch.keys();
        self.in_flight.spawn(async move {
            let result = run_isolated(async move {
                past::reconcile(&pipeline, &rule, batch).await
            })
            .await;
            FlushDone::Past { keys, result }
        });
    }

    fn on_done(&mut self, done: Result<FlushDone, JoinError>) {
        // ---
        match done {
            Err(e) => {
                tracing::error!(rule_id = self.rule.id, error = %e, "Flush task aborted");
                self.pipeline.metrics().record_failed_batch();
            }
            Ok(FlushDone::Live { id, result: Ok(report) }) => {
                self.live.confirm(id);
                tracing::info!(
                    rule_id = self.rule.id,
                    flush_id = %report.flush_id,
                    records = report.records,
                    "Flushed live buckets"
                );
                self.release_deferred();
            }
            Ok(FlushDone::Live { id, result: Err(e) }) => {
                let dead = if store::is_retryable(&e) {
                    tracing::warn!(rule_id = self.rule.id, error = %e, "Live flush failed, returning buckets to buffer");
                    self.live.restore(id)
                } else {
                    self.live.abandon(id)
                };
                self.dead_letter(dead, &e.to_string());
                self.release_deferred();
            }
            Ok(FlushDone::Past { keys, result: Ok(report) }) => {
                self.past.settle(&keys, Some(&report));
            }
            Ok(FlushDone::Past { keys, result: Err(e) }) => {
                self.past.settle(&keys, None);
                tracing::error!(
                    rule_id = self.rule.id,
                    buckets = keys.len(),
                    error = %e,
                    "Dropping backfill batch"
                );
            }
        }
    }

    /// Log rows that will not be retried so they can be replayed by hand.
    fn dead_letter(&self, batch: Batch, reason: &str) {
        // ---
        if batch.is_empty() {
            return;
        }
        for state in batch.values() {
            let row = state
                .to_row()
                .ok()
                .and_then(|row| serde_json::to_string(&row).ok())
                .unwrap_or_else(|| state.key().to_string());
            tracing::error!(rule_id = self.rule.id, %reason, row = %row, "Dead-lettered bucket");
        }
        self.pipeline.metrics().record_dead_lettered(batch.len());
    }

    /// Final pass on shutdown: flush every remaining bucket once, bounded
    /// by `grace`, and dead-letter whatever is still unflushed.
    async fn drain(&mut self, grace: Duration) {
        // ---
        if tokio::time::timeout(grace, self.final_flush()).await.is_err() {
            tracing::warn!(
                rule_id = self.rule.id,
                grace_ms = grace.as_millis() as u64,
                "Final flush exceeded the shutdown grace period"
            );
            self.in_flight.abort_all();

            let samples = self.past_queue.len() + self.deferred.len();
            if samples > 0 || self.past.in_flight_len() > 0 {
                tracing::error!(
                    rule_id = self.rule.id,
                    samples,
                    buckets = self.past.in_flight_len(),
                    "Abandoning unflushed backfill"
                );
            }
            for _ in 0..samples {
                self.pipeline.metrics().record_dropped_sample();
            }
            if self.past.in_flight_len() > 0 {
                self.pipeline.metrics().record_failed_batch();
            }
        }

        let mut leftover = Batch::new();
        if let Some(pending) = self.live.drain_all() {
            leftover.extend(self.live.abandon(pending.id));
        }
        for pending in self.live.take_pending() {
            leftover.extend(pending.batch);
        }
        self.dead_letter(leftover, "shutdown");
    }

    async fn final_flush(&mut self) {
        // ---
        while let Some(done) = self.in_flight.join_next().await {
            self.on_done(done);
        }
        self.release_deferred();

        if !self.past_queue.is_empty() {
            self.start_past();
        }
        if let Some(pending) = self.live.drain_all() {
            tracing::info!(
                rule_id = self.rule.id,
                buckets = pending.batch.len(),
                "Final flush of live buckets"
            );
            self.start_live(pending);
        }

        while let Some(done) = self.in_flight.join_next().await {
            self.on_done(done);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::flush::RetryPolicy;
    use crate::metrics::FlushMetrics;
    use crate::models::AggregationMethod;
    use crate::store::{Fault, MemoryStore};
    use chrono::{DateTime, Duration as ChronoDuration};
    use serde_json::json;
    use std::num::NonZeroU32;
    use std::sync::Arc;

    const GRACE: Duration = Duration::from_secs(5);

    fn create_test_rule(interval: u32) -> AggregationRule {
        // ---
        AggregationRule {
            id: 11,
            tenant_id: "T1".to_string(),
            entity_id: "E1".to_string(),
            method: AggregationMethod::Fast,
            interval: NonZeroU32::new(interval).unwrap(),
            bucket_level: None,
            is_active: true,
        }
    }

    fn create_test_sample(c1: f64, c2: f64, created_at: DateTime<Utc>) -> Sample {
        // ---
        Sample {
            tenant_id: "T1".to_string(),
            device_id: Some("E1".to_string()),
            machine_id: None,
            core_1: c1,
            core_2: c2,
            core_3: None,
            created_at,
            data: json!({}),
            lot_id: None,
        }
    }

    fn create_test_settings() -> WorkerSettings {
        // ---
        WorkerSettings {
            poll_interval: Duration::from_millis(20),
            past_batch_max: 100,
            max_restores: 3,
            retention: ChronoDuration::hours(1),
            queue_depth: 64,
            drain_grace: GRACE,
        }
    }

    fn create_test_pipeline(store: Arc<MemoryStore>) -> FlushPipeline {
        // ---
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        FlushPipeline::new(store, policy, FlushMetrics::new())
    }

    fn key_for(rule: &AggregationRule, sample: &Sample) -> BucketKey {
        rule.key_of(sample).unwrap().0
    }

    /// Sleep into the first few milliseconds of the next wall-clock second.
    async fn start_of_fresh_second() {
        // ---
        let ms = u64::from(Utc::now().timestamp_subsec_millis().min(999));
        tokio::time::sleep(Duration::from_millis(1_000 - ms + 20)).await;
    }

    async fn sleep_past_window(rule: &AggregationRule, sample: &Sample) {
        // ---
        let end = rule.window_of(sample).unwrap().end;
        let left = (end - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(left + Duration::from_millis(50)).await;
    }

    async fn wait_for_rows(store: &MemoryStore, n: usize) {
        // ---
        for _ in 0..200 {
            if store.row_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {n} rows, found {}", store.row_count());
    }

    #[tokio::test]
    async fn test_live_bucket_flushes_after_window_closes() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let rule = create_test_rule(1);
        let worker = spawn(rule.clone(), create_test_pipeline(store.clone()), create_test_settings());

        let now = Utc::now();
        let samples = [
            create_test_sample(1.0, 2.0, now),
            create_test_sample(3.0, 4.0, now),
            create_test_sample(5.0, 6.0, now),
        ];
        for s in &samples {
            worker.handle.try_send(s.clone(), Route::Live).unwrap();
        }

        wait_for_rows(&store, 1).await;
        let row = store.row(rule.storage_target(), &key_for(&rule, &samples[0])).unwrap();
        assert_eq!(row.avg_core_1, 3.0);
        assert_eq!(row.avg_core_2, 4.0);

        worker.handle.shutdown(GRACE).await;
        worker.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_past_sample_is_reconciled() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let rule = create_test_rule(10);
        let worker = spawn(rule.clone(), create_test_pipeline(store.clone()), create_test_settings());

        let old = Utc::now() - ChronoDuration::minutes(5);
        let sample = create_test_sample(7.0, 8.0, old);
        worker.handle.try_send(sample.clone(), Route::Past).unwrap();

        wait_for_rows(&store, 1).await;
        let row = store.row(rule.storage_target(), &key_for(&rule, &sample)).unwrap();
        assert_eq!(row.avg_core_1, 7.0);

        worker.handle.shutdown(GRACE).await;
        worker.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_windows() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let rule = create_test_rule(3_600);
        let worker = spawn(rule.clone(), create_test_pipeline(store.clone()), create_test_settings());

        worker
            .handle
            .try_send(create_test_sample(2.0, 2.0, Utc::now()), Route::Live)
            .unwrap();
        worker.handle.shutdown(GRACE).await;
        worker.task.await.unwrap();

        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_live_flush_is_retried_on_next_scan() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.fail_upserts(&[Fault::Transient, Fault::Transient]);
        let rule = create_test_rule(1);
        let pipeline = create_test_pipeline(store.clone());
        let metrics = pipeline.metrics().clone();
        let worker = spawn(rule.clone(), pipeline, create_test_settings());

        worker
            .handle
            .try_send(create_test_sample(4.0, 4.0, Utc::now()), Route::Live)
            .unwrap();

        wait_for_rows(&store, 1).await;
        assert_eq!(store.commits(), 1);
        assert_eq!(metrics.totals().failed_batches, 1);
        assert_eq!(metrics.totals().dead_lettered, 0);

        worker.handle.shutdown(GRACE).await;
        worker.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_dead_letters_without_retry() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.fail_upserts(&[Fault::Conflict]);
        let rule = create_test_rule(3_600);
        let pipeline = create_test_pipeline(store.clone());
        let metrics = pipeline.metrics().clone();
        let worker = spawn(rule, pipeline, create_test_settings());

        worker
            .handle
            .try_send(create_test_sample(1.0, 1.0, Utc::now()), Route::Live)
            .unwrap();
        worker.handle.shutdown(GRACE).await;
        worker.task.await.unwrap();

        assert_eq!(store.upsert_attempts(), 1);
        assert_eq!(store.row_count(), 0);
        assert_eq!(metrics.totals().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_late_sample_joins_closed_bucket_before_scan() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let rule = create_test_rule(1);
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(1_500),
            past_batch_max: 1,
            ..create_test_settings()
        };

        start_of_fresh_second().await;
        let worker = spawn(rule.clone(), create_test_pipeline(store.clone()), settings);

        let now = Utc::now();
        for _ in 0..3 {
            worker
                .handle
                .try_send(create_test_sample(10.0, 1.0, now), Route::Live)
                .unwrap();
        }
        let late = create_test_sample(100.0, 1.0, now);
        sleep_past_window(&rule, &late).await;
        worker.handle.try_send(late.clone(), Route::Past).unwrap();

        wait_for_rows(&store, 1).await;
        worker.handle.shutdown(GRACE).await;
        worker.task.await.unwrap();

        let row = store.row(rule.storage_target(), &key_for(&rule, &late)).unwrap();
        assert_eq!(row.avg_core_1, 32.5);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.existence_checks(), 0);
    }

    #[tokio::test]
    async fn test_late_sample_waits_for_in_flight_live_flush() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.set_upsert_delay(Duration::from_millis(300));
        let rule = create_test_rule(1);

        start_of_fresh_second().await;
        let worker = spawn(rule.clone(), create_test_pipeline(store.clone()), create_test_settings());

        let now = Utc::now();
        for _ in 0..3 {
            worker
                .handle
                .try_send(create_test_sample(10.0, 1.0, now), Route::Live)
                .unwrap();
        }
        for _ in 0..200 {
            if store.upsert_attempts() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.row_count(), 0);

        let late = create_test_sample(100.0, 1.0, now);
        worker.handle.try_send(late.clone(), Route::Past).unwrap();

        for _ in 0..200 {
            if store.existence_checks() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        worker.handle.shutdown(GRACE).await;
        worker.task.await.unwrap();

        // The live row was committed first; the backfill found it and wrote nothing.
        let row = store.row(rule.storage_target(), &key_for(&rule, &late)).unwrap();
        assert_eq!(row.avg_core_1, 10.0);
        assert_eq!(store.existence_checks(), 1);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn test_stalled_store_is_dead_lettered_after_grace() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.fail_upserts(&[Fault::Stall]);
        let rule = create_test_rule(3_600);
        let pipeline = create_test_pipeline(store.clone());
        let metrics = pipeline.metrics().clone();
        let worker = spawn(rule, pipeline, create_test_settings());

        worker
            .handle
            .try_send(create_test_sample(1.0, 1.0, Utc::now()), Route::Live)
            .unwrap();
        worker.handle.shutdown(Duration::from_millis(100)).await;
        tokio::time::timeout(GRACE, worker.task)
            .await
            .expect("worker must exit once the grace period elapses")
            .unwrap();

        assert_eq!(store.row_count(), 0);
        assert_eq!(metrics.totals().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_panicking_flush_comes_back_as_error() {
        // ---
        let result = run_isolated(async {
            if store::is_retryable(&anyhow!("transient")) {
                panic!("flush exploded");
            }
            Ok(1)
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("flush task failed"));
        assert!(store::is_retryable(&err));
    }
}
