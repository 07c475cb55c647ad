//! Database schema bootstrap for `telemetry-aggregator`.
//!
//! Ensures the `fast` metrics table and its bucket-identity constraint exist.
//! Only applied when `DB_ENSURE_SCHEMA` is set; production databases are
//! expected to be provisioned separately.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create the analytics schema and the `fast_metrics` table (idempotent).
///
/// The `UNIQUE (tenant_id, entity_id, bucket_start)` constraint is what the
/// flush pipeline's `ON CONFLICT` clauses target, so it must exist for any
/// table a rule writes into.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query("CREATE SCHEMA IF NOT EXISTS analytics;")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analytics.fast_metrics (
            id            BIGSERIAL PRIMARY KEY,
            tenant_id     TEXT             NOT NULL,
            entity_id     TEXT             NOT NULL,
            device_id     TEXT,
            machine_id    TEXT,
            bucket_start  TIMESTAMPTZ      NOT NULL,
            avg_core_1    DOUBLE PRECISION NOT NULL,
            avg_core_2    DOUBLE PRECISION NOT NULL,
            avg_core_3    DOUBLE PRECISION,
            data          JSONB            NOT NULL DEFAULT '{}'::jsonb,
            lot_id        TEXT,
            created_at    TIMESTAMPTZ      NOT NULL DEFAULT now(),
            CONSTRAINT fast_metrics_bucket_key
                UNIQUE (tenant_id, entity_id, bucket_start)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Dashboards read recent buckets per tenant
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_fast_metrics_tenant_bucket
            ON analytics.fast_metrics (tenant_id, bucket_start DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!("Ensured analytics.fast_metrics schema");
    Ok(())
}
