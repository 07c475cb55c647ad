//! Configuration loader for the `telemetry-aggregator` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Engine settings are derived from the loaded
//! [`Config`] here so that the engine modules never read the environment.
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::flush::RetryPolicy;
use crate::router::RouterSettings;
use crate::worker::WorkerSettings;

/// Upper bound for `HANDLED_RETENTION_SECS` (ten years).
const MAX_RETENTION_SECS: u64 = 10 * 365 * 86_400;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional 64-bit integer environment variable with a default value.
macro_rules! parse_env_u64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean environment variable (`1|true|yes`, `0|false|no`).
macro_rules! parse_env_bool {
    ($var_name:expr, $default:expr) => {
        match env::var($var_name).ok().as_deref().map(str::to_ascii_lowercase).as_deref() {
            None => $default,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => return Err(anyhow!("Invalid {}: {}", $var_name, other)),
        }
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,
    pub db_acquire_timeout_secs: u64,
    pub db_idle_timeout_secs: u64,

    /// Startup connectivity probe attempts and first delay.
    pub db_connect_retries: u32,
    pub db_connect_retry_delay_ms: u64,

    /// Create the metrics table on startup.
    pub db_ensure_schema: bool,

    /// PostgREST base URL serving `metric_method_config`.
    pub rules_api_url: String,
    pub rules_api_key: String,
    pub rules_refresh_secs: u64,

    pub http_port: u16,

    pub flush_poll_ms: u64,
    pub flush_max_attempts: u32,
    pub flush_base_delay_ms: u64,
    pub flush_max_restores: u32,

    pub past_batch_max: u32,
    pub worker_queue_depth: u32,
    pub handled_retention_secs: u64,
    pub worker_max_restarts: u32,

    pub log_summary_minutes: u64,
    pub shutdown_grace_secs: u64,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
/// - `RULES_API_URL` – PostgREST base URL for rule snapshots
/// - `RULES_API_KEY` – API key for the rule endpoint
///
/// Everything else is optional; see [`Config`] for the full list.
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let rules_api_url = require_env!("RULES_API_URL");
    let rules_api_key = require_env!("RULES_API_KEY");

    let http_port = parse_env_u32!("HTTP_PORT", 8080);
    let http_port =
        u16::try_from(http_port).map_err(|_| anyhow!("Invalid HTTP_PORT: {}", http_port))?;

    let cfg = Config {
        db_url,
        db_pool_max: parse_env_u32!("DB_POOL_MAX", 20),
        db_acquire_timeout_secs: parse_env_u64!("DB_ACQUIRE_TIMEOUT_SECS", 10),
        db_idle_timeout_secs: parse_env_u64!("DB_IDLE_TIMEOUT_SECS", 30),
        db_connect_retries: parse_env_u32!("DB_CONNECT_RETRIES", 5),
        db_connect_retry_delay_ms: parse_env_u64!("DB_CONNECT_RETRY_DELAY_MS", 5_000),
        db_ensure_schema: parse_env_bool!("DB_ENSURE_SCHEMA", false),
        rules_api_url,
        rules_api_key,
        rules_refresh_secs: parse_env_u64!("RULES_REFRESH_SECS", 30),
        http_port,
        flush_poll_ms: parse_env_u64!("FLUSH_POLL_MS", 1_000),
        flush_max_attempts: parse_env_u32!("FLUSH_MAX_ATTEMPTS", 4),
        flush_base_delay_ms: parse_env_u64!("FLUSH_BASE_DELAY_MS", 1_000),
        flush_max_restores: parse_env_u32!("FLUSH_MAX_RESTORES", 3),
        past_batch_max: parse_env_u32!("PAST_BATCH_MAX", 500),
        worker_queue_depth: parse_env_u32!("WORKER_QUEUE_DEPTH", 10_000),
        handled_retention_secs: parse_env_u64!("HANDLED_RETENTION_SECS", 86_400),
        worker_max_restarts: parse_env_u32!("WORKER_MAX_RESTARTS", 5),
        log_summary_minutes: parse_env_u64!("LOG_SUMMARY_MINUTES", 1),
        shutdown_grace_secs: parse_env_u64!("SHUTDOWN_GRACE_SECS", 30),
    };

    if cfg.flush_max_attempts == 0 {
        return Err(anyhow!("FLUSH_MAX_ATTEMPTS must be at least 1"));
    }
    if cfg.flush_poll_ms == 0 || cfg.rules_refresh_secs == 0 || cfg.log_summary_minutes == 0 {
        return Err(anyhow!(
            "FLUSH_POLL_MS, RULES_REFRESH_SECS and LOG_SUMMARY_MINUTES must be non-zero"
        ));
    }
    Ok(cfg)
}

impl Config {
    // ---
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.flush_max_attempts,
            base_delay: Duration::from_millis(self.flush_base_delay_ms),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        // ---
        WorkerSettings {
            poll_interval: Duration::from_millis(self.flush_poll_ms),
            past_batch_max: self.past_batch_max.max(1) as usize,
            max_restores: self.flush_max_restores,
            retention: chrono::Duration::seconds(
                self.handled_retention_secs.min(MAX_RETENTION_SECS) as i64,
            ),
            queue_depth: self.worker_queue_depth.max(1) as usize,
            drain_grace: self.shutdown_grace(),
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            worker: self.worker_settings(),
            max_restarts: self.worker_max_restarts,
            ..RouterSettings::default()
        }
    }

    pub fn rules_refresh(&self) -> Duration {
        Duration::from_secs(self.rules_refresh_secs)
    }

    pub fn summary_period(&self) -> Duration {
        Duration::from_secs(self.log_summary_minutes * 60)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the database password and the rules API key.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL           : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX            : {}", self.db_pool_max);
        tracing::info!("  DB_ACQUIRE_TIMEOUT_SECS: {}", self.db_acquire_timeout_secs);
        tracing::info!("  DB_IDLE_TIMEOUT_SECS   : {}", self.db_idle_timeout_secs);
        tracing::info!("  DB_ENSURE_SCHEMA       : {}", self.db_ensure_schema);
        tracing::info!("  RULES_API_URL          : {}", self.rules_api_url);
        tracing::info!("  RULES_API_KEY          : {}", mask_secret(&self.rules_api_key));
        tracing::info!("  RULES_REFRESH_SECS     : {}", self.rules_refresh_secs);
        tracing::info!("  HTTP_PORT              : {}", self.http_port);
        tracing::info!("  FLUSH_POLL_MS          : {}", self.flush_poll_ms);
        tracing::info!("  FLUSH_MAX_ATTEMPTS     : {}", self.flush_max_attempts);
        tracing::info!("  FLUSH_BASE_DELAY_MS    : {}", self.flush_base_delay_ms);
        tracing::info!("  FLUSH_MAX_RESTORES     : {}", self.flush_max_restores);
        tracing::info!("  PAST_BATCH_MAX         : {}", self.past_batch_max);
        tracing::info!("  WORKER_QUEUE_DEPTH     : {}", self.worker_queue_depth);
        tracing::info!("  WORKER_MAX_RESTARTS    : {}", self.worker_max_restarts);
        tracing::info!("  SHUTDOWN_GRACE_SECS    : {}", self.shutdown_grace_secs);
    }
}

/// Replace the password in a connection string with `****`.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // `scheme://host` has no credentials, only the scheme colon.
            if !db_url[colon_pos..at_pos].starts_with("://") {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}

fn mask_secret(secret: &str) -> String {
    let shown: String = secret.chars().take(4).collect();
    format!("{shown}****")
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_mask_db_url_hides_password() {
        // ---
        assert_eq!(
            mask_db_url("postgres://agg:s3cret@db:5432/metrics"),
            "postgres://agg:****@db:5432/metrics"
        );
        assert_eq!(
            mask_db_url("postgres://db:5432/metrics"),
            "postgres://db:5432/metrics"
        );
    }

    #[test]
    fn test_mask_secret_keeps_prefix() {
        assert_eq!(mask_secret("eyJhbGciOi"), "eyJh****");
        assert_eq!(mask_secret("ab"), "ab****");
    }
}
