//! Application entry point for the `telemetry-aggregator` service.
//!
//! This binary orchestrates the startup sequence for the aggregation engine:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a size-capped PostgreSQL pool and probing connectivity
//! - Optionally creating the metrics table
//! - Loading the rule snapshot and starting one worker per rule
//! - Serving the ingest, reload and health endpoints via the `routes` gateway
//! - Draining every worker on SIGINT/SIGTERM
//!
//! # Environment Variables
//! - `DATABASE_URL`, `RULES_API_URL`, `RULES_API_KEY` (**required**)
//! - `AGG_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `AGG_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the remaining tuning knobs.
use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use telemetry_aggregator::flush::FlushPipeline;
use telemetry_aggregator::routes::{self, AppState};
use telemetry_aggregator::rules::{self, RulesClient};
use telemetry_aggregator::store::PgMetricStore;
use telemetry_aggregator::{config, router, schema, Config, FlushMetrics, RuleSource};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let pool = connect_with_retry(&cfg).await?;
    if cfg.db_ensure_schema {
        schema::create_schema(&pool).await?;
    }

    let store = Arc::new(PgMetricStore::new(pool));
    let metrics = FlushMetrics::new();
    let pipeline = FlushPipeline::new(store.clone(), cfg.retry_policy(), metrics.clone());

    let source: Arc<dyn RuleSource> =
        Arc::new(RulesClient::new(&cfg.rules_api_url, &cfg.rules_api_key)?);
    let initial = source
        .fetch_rules()
        .await
        .context("Failed to load initial rule snapshot")?;
    tracing::info!(rules = initial.len(), "Loaded initial rule snapshot");

    let (router, router_task) = router::spawn(initial, pipeline, cfg.router_settings());
    let refresher = rules::spawn_refresher(source.clone(), router.clone(), cfg.rules_refresh());
    let reporter = metrics.spawn_reporter(cfg.summary_period());

    // Build app from routes gateway
    let app = routes::router(AppState {
        store,
        router: router.clone(),
        rules: source,
        metrics: metrics.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP intake stopped, draining workers");
    refresher.abort();
    if let Err(e) = router.shutdown(cfg.shutdown_grace()).await {
        tracing::error!(error = %e, "Router did not confirm shutdown");
    }
    let _ = router_task.await;
    reporter.abort();
    metrics.log_final();

    Ok(())
}

// ---

/// Build the pool and run `SELECT 1` until it succeeds, doubling the delay
/// between attempts.
async fn connect_with_retry(cfg: &Config) -> Result<PgPool> {
    // ---
    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .acquire_timeout(Duration::from_secs(cfg.db_acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(cfg.db_idle_timeout_secs))
        .connect_lazy(&cfg.db_url)
        .context("Invalid DATABASE_URL")?;

    let attempts = cfg.db_connect_retries.max(1);
    let mut delay = Duration::from_millis(cfg.db_connect_retry_delay_ms);
    let mut attempt = 1;

    loop {
        match sqlx::query("SELECT 1").execute(&pool).await {
            Ok(_) => {
                tracing::info!("Successfully connected to database");
                return Ok(pool);
            }
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Database not reachable, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                return Err(e).context(format!(
                    "Failed to connect to database after {attempts} attempts"
                ));
            }
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AGG_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, else the `AGG_LOG_LEVEL` env var
fn init_tracing() {
    // ---
    let span_events = match env::var("AGG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AGG_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
