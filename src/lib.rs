//! Windowed telemetry aggregation engine.
//!
//! Samples are partitioned by rule ([`router`]), accumulated per fixed
//! window ([`live`]), reconciled when they arrive late ([`past`]) and
//! written through a retrying transactional pipeline ([`flush`]) into a
//! [`store::MetricStore`]. The binary in `main.rs` wires these to Postgres,
//! the PostgREST rule endpoint and an axum HTTP surface ([`routes`]).

pub mod config;
pub mod flush;
pub mod live;
pub mod metrics;
pub mod models;
pub mod past;
pub mod router;
pub mod routes;
pub mod rules;
pub mod schema;
pub mod store;
pub mod window;
pub mod worker;

pub use config::Config;

// Re-exported so routes/*.rs only depend on the crate root, not on the
// engine module layout.
pub use metrics::FlushMetrics;
pub use models::{parse_message, Sample};
pub use router::{RouterHandle, RouterStatus};
pub use rules::RuleSource;
pub use store::MetricStore;
