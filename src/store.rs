//! Durable store for aggregated rows.
//!
//! [`MetricStore`] is the only interface the engine needs: a batched
//! existence check, a transactional upsert with insert-only or overwrite
//! conflict handling, and a liveness probe. [`PgMetricStore`] is the
//! Postgres implementation; [`MemoryStore`] keeps rows in process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{BucketKey, MetricRow};

// ---

#[async_trait]
pub trait MetricStore: Send + Sync {
    // ---
    /// Return the subset of `keys` that already have a row in `target`.
    async fn existing_buckets(&self, target: &str, keys: &[BucketKey])
        -> Result<HashSet<BucketKey>>;

    /// Write `rows` to `target` in one transaction. On a
    /// `(tenant_id, entity_id, bucket_start)` conflict the existing row is
    /// kept when `overwrite` is false and replaced when it is true.
    async fn upsert_batch(&self, target: &str, rows: &[MetricRow], overwrite: bool) -> Result<()>;

    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<()>;
}

/// A unique constraint other than the declared conflict target rejected a
/// row. Retrying cannot fix it.
#[derive(Debug, Clone)]
pub struct UniqueViolation {
    pub constraint: Option<String>,
    pub message: String,
}

impl fmt::Display for UniqueViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "unique violation on {c}: {}", self.message),
            None => write!(f, "unique violation: {}", self.message),
        }
    }
}

impl std::error::Error for UniqueViolation {}

/// Whether a failed flush attempt may be retried.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    // ---
    if err.downcast_ref::<UniqueViolation>().is_some() {
        return false;
    }
    !matches!(
        err.downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error()),
        Some(db) if db.is_unique_violation()
    )
}

/// Wrap a sqlx error, promoting unique violations to [`UniqueViolation`].
fn classify(err: sqlx::Error) -> anyhow::Error {
    // ---
    if let Some(db) = err.as_database_error() {
        if db.is_unique_violation() {
            return anyhow!(UniqueViolation {
                constraint: db.constraint().map(str::to_owned),
                message: db.message().to_owned(),
            });
        }
    }
    anyhow!(err)
}

// ---

/// Postgres-backed store over a shared, size-capped pool.
#[derive(Clone)]
pub struct PgMetricStore {
    pool: PgPool,
}

impl PgMetricStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn upsert_sql(target: &str, overwrite: bool) -> String {
        // ---
        let on_conflict = if overwrite {
            r#"DO UPDATE SET
                device_id  = EXCLUDED.device_id,
                machine_id = EXCLUDED.machine_id,
                avg_core_1 = EXCLUDED.avg_core_1,
                avg_core_2 = EXCLUDED.avg_core_2,
                avg_core_3 = EXCLUDED.avg_core_3,
                data       = EXCLUDED.data,
                lot_id     = EXCLUDED.lot_id"#
        } else {
            "DO NOTHING"
        };

        format!(
            r#"
            INSERT INTO {target} (
                tenant_id, entity_id, device_id, machine_id, bucket_start,
                avg_core_1, avg_core_2, avg_core_3, data, lot_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tenant_id, entity_id, bucket_start)
            {on_conflict}
            "#
        )
    }

    async fn write_rows(
        tx: &mut Transaction<'static, Postgres>,
        sql: &str,
        rows: &[MetricRow],
    ) -> Result<()> {
        // ---
        for row in rows {
            sqlx::query(sql)
                .bind(&row.tenant_id)
                .bind(&row.entity_id)
                .bind(&row.device_id)
                .bind(&row.machine_id)
                .bind(row.bucket_start)
                .bind(row.avg_core_1)
                .bind(row.avg_core_2)
                .bind(row.avg_core_3)
                .bind(sqlx::types::Json(&row.data))
                .bind(&row.lot_id)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetricStore for PgMetricStore {
    // ---
    async fn existing_buckets(
        &self,
        target: &str,
        keys: &[BucketKey],
    ) -> Result<HashSet<BucketKey>> {
        // ---
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let tenants: Vec<String> = keys.iter().map(|k| k.tenant_id.clone()).collect();
        let entities: Vec<String> = keys.iter().map(|k| k.entity_id.clone()).collect();
        let starts: Vec<DateTime<Utc>> = keys.iter().map(|k| k.bucket_start).collect();

        let sql = format!(
            r#"
            SELECT DISTINCT m.tenant_id, m.entity_id, m.bucket_start
            FROM {target} m
            JOIN UNNEST($1::text[], $2::text[], $3::timestamptz[])
                AS k(tenant_id, entity_id, bucket_start)
              ON m.tenant_id = k.tenant_id
             AND m.entity_id = k.entity_id
             AND m.bucket_start = k.bucket_start
            "#
        );

        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(&sql)
            .bind(tenants)
            .bind(entities)
            .bind(starts)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("existence check against {target} failed"))?;

        Ok(rows
            .into_iter()
            .map(|(tenant_id, entity_id, bucket_start)| BucketKey {
                tenant_id,
                entity_id,
                bucket_start,
            })
            .collect())
    }

    async fn upsert_batch(&self, target: &str, rows: &[MetricRow], overwrite: bool) -> Result<()> {
        // ---
        if rows.is_empty() {
            return Ok(());
        }

        let sql = Self::upsert_sql(target, overwrite);
        let mut tx = self.pool.begin().await.map_err(classify)?;

        if let Err(e) = Self::write_rows(&mut tx, &sql, rows).await {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback after failed upsert also failed");
            }
            return Err(e);
        }

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        // ---
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ---

/// Injected failure for [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection-style error; retryable.
    Transient,
    /// Unique violation outside the conflict target; not retryable.
    Conflict,
    /// The call never returns.
    Stall,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<(String, BucketKey), MetricRow>,
    upsert_faults: VecDeque<Fault>,
    existence_faults: VecDeque<Fault>,
    upsert_attempts: usize,
    commits: usize,
    existence_checks: usize,
    ping_fails: bool,
    upsert_delay: Option<std::time::Duration>,
}

/// In-process store with the same conflict semantics as Postgres, plus
/// scripted faults.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue faults returned by the next upsert attempts, in order.
    pub fn fail_upserts(&self, faults: &[Fault]) {
        self.lock().upsert_faults.extend(faults.iter().copied());
    }

    /// Queue faults returned by the next existence checks, in order.
    pub fn fail_existence_checks(&self, faults: &[Fault]) {
        self.lock().existence_faults.extend(faults.iter().copied());
    }

    /// Hold every upsert for `delay` before it commits.
    pub fn set_upsert_delay(&self, delay: std::time::Duration) {
        self.lock().upsert_delay = Some(delay);
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.lock().ping_fails = fails;
    }

    /// Seed a row as if an earlier flush had written it.
    pub fn insert_row(&self, target: &str, row: MetricRow) {
        self.lock().rows.insert((target.to_string(), row.key()), row);
    }

    pub fn row(&self, target: &str, key: &BucketKey) -> Option<MetricRow> {
        self.lock().rows.get(&(target.to_string(), key.clone())).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn upsert_attempts(&self) -> usize {
        self.lock().upsert_attempts
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn existence_checks(&self) -> usize {
        self.lock().existence_checks
    }

    fn fault_error(fault: Fault, what: &str) -> anyhow::Error {
        // ---
        match fault {
            Fault::Transient => anyhow!("{what}: connection reset by peer"),
            Fault::Conflict => anyhow!(UniqueViolation {
                constraint: Some("fast_metrics_pkey".to_string()),
                message: format!("{what}: duplicate key value violates unique constraint"),
            }),
            Fault::Stall => anyhow!("{what}: stalled"),
        }
    }

    /// Resolve a scripted fault. A stall never resolves.
    async fn inject(fault: Option<Fault>, what: &str) -> Result<()> {
        // ---
        match fault {
            None => Ok(()),
            Some(Fault::Stall) => std::future::pending::<Result<()>>().await,
            Some(fault) => Err(Self::fault_error(fault, what)),
        }
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    // ---
    async fn existing_buckets(
        &self,
        target: &str,
        keys: &[BucketKey],
    ) -> Result<HashSet<BucketKey>> {
        // ---
        let fault = {
            let mut state = self.lock();
            state.existence_checks += 1;
            state.existence_faults.pop_front()
        };
        Self::inject(fault, "existence check").await?;

        let state = self.lock();

        Ok(keys
            .iter()
            .filter(|k| state.rows.contains_key(&(target.to_string(), (*k).clone())))
            .cloned()
            .collect())
    }

    async fn upsert_batch(&self, target: &str, rows: &[MetricRow], overwrite: bool) -> Result<()> {
        // ---
        let (fault, delay) = {
            let mut state = self.lock();
            state.upsert_attempts += 1;
            (state.upsert_faults.pop_front(), state.upsert_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Self::inject(fault, "upsert").await?;

        let mut state = self.lock();

        for row in rows {
            let slot = (target.to_string(), row.key());
            if overwrite || !state.rows.contains_key(&slot) {
                state.rows.insert(slot, row.clone());
            }
        }
        state.commits += 1;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        // ---
        if self.lock().ping_fails {
            return Err(anyhow!("store unreachable"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const TARGET: &str = "analytics.fast_metrics";

    fn create_test_row(avg: f64) -> MetricRow {
        // ---
        MetricRow {
            tenant_id: "T1".to_string(),
            entity_id: "E1".to_string(),
            device_id: Some("E1".to_string()),
            machine_id: None,
            bucket_start: Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap(),
            avg_core_1: avg,
            avg_core_2: avg,
            avg_core_3: None,
            data: json!({}),
            lot_id: None,
        }
    }

    #[test]
    fn test_unique_violation_is_not_retryable() {
        // ---
        let err = anyhow!(UniqueViolation {
            constraint: Some("other_key".to_string()),
            message: "duplicate".to_string(),
        });
        assert!(!is_retryable(&err));

        let wrapped = err.context("flush failed");
        assert!(!is_retryable(&wrapped));
    }

    #[test]
    fn test_other_errors_are_retryable() {
        // ---
        assert!(is_retryable(&anyhow!("timeout")));
        assert!(is_retryable(&anyhow!(sqlx::Error::PoolTimedOut)));
    }

    #[test]
    fn test_upsert_sql_conflict_clauses() {
        // ---
        let insert_only = PgMetricStore::upsert_sql(TARGET, false);
        assert!(insert_only.contains("INSERT INTO analytics.fast_metrics"));
        assert!(insert_only.contains("ON CONFLICT (tenant_id, entity_id, bucket_start)"));
        assert!(insert_only.contains("DO NOTHING"));

        let overwrite = PgMetricStore::upsert_sql(TARGET, true);
        assert!(overwrite.contains("DO UPDATE SET"));
        assert!(overwrite.contains("avg_core_3 = EXCLUDED.avg_core_3"));
        assert!(!overwrite.contains("DO NOTHING"));
    }

    #[tokio::test]
    async fn test_memory_store_conflict_semantics() {
        // ---
        let store = MemoryStore::new();
        let key = create_test_row(1.0).key();

        store.upsert_batch(TARGET, &[create_test_row(1.0)], false).await.unwrap();
        store.upsert_batch(TARGET, &[create_test_row(2.0)], false).await.unwrap();
        assert_eq!(store.row(TARGET, &key).unwrap().avg_core_1, 1.0);

        store.upsert_batch(TARGET, &[create_test_row(3.0)], true).await.unwrap();
        assert_eq!(store.row(TARGET, &key).unwrap().avg_core_1, 3.0);
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_scripted_faults() {
        // ---
        let store = MemoryStore::new();
        store.fail_upserts(&[Fault::Transient, Fault::Conflict]);

        let first = store.upsert_batch(TARGET, &[create_test_row(1.0)], false).await;
        assert!(is_retryable(&first.unwrap_err()));

        let second = store.upsert_batch(TARGET, &[create_test_row(1.0)], false).await;
        assert!(!is_retryable(&second.unwrap_err()));

        store.upsert_batch(TARGET, &[create_test_row(1.0)], false).await.unwrap();
        assert_eq!(store.upsert_attempts(), 3);
        assert_eq!(store.commits(), 1);
    }
}
