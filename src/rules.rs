//! Aggregation rule snapshots.
//!
//! Rules live in the `metric_method_config` table and are read through its
//! PostgREST endpoint. Every fetch returns the full active set; the router
//! treats it as a wholesale replacement of the previous snapshot.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::models::{AggregationMethod, AggregationRule, IntervalSource, RuleRecord};
use crate::router::RouterHandle;

// ---

#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Fetch the full list of active, validated rules.
    async fn fetch_rules(&self) -> Result<Vec<AggregationRule>>;
}

/// Validate raw records into the rules this service aggregates.
///
/// Inactive and non-`fast` rules are skipped. A rule without an explicit
/// interval falls back to its bucket granularity; a rule with neither is
/// rejected.
pub fn validate_snapshot(records: Vec<RuleRecord>) -> Vec<AggregationRule> {
    // ---
    let mut rules = Vec::with_capacity(records.len());
    for record in records {
        if !record.is_active || record.method != AggregationMethod::Fast {
            continue;
        }
        let id = record.id;
        match AggregationRule::from_record(record) {
            Ok((rule, IntervalSource::Explicit)) => rules.push(rule),
            Ok((rule, IntervalSource::BucketLevel)) => {
                tracing::warn!(
                    rule_id = id,
                    interval_secs = rule.interval.get(),
                    "Rule has no interval_seconds, using its bucket level"
                );
                rules.push(rule);
            }
            Err(e) => tracing::warn!(rule_id = id, error = %e, "Rejecting invalid rule"),
        }
    }
    rules
}

/// Reads rules from PostgREST.
#[derive(Clone)]
pub struct RulesClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RulesClient {
    // ---
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        // ---
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build rules HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/rest/v1/metric_method_config?select=*&is_active=eq.true&method=eq.fast&order=tenant_id,entity_id",
            self.base_url
        )
    }
}

#[async_trait]
impl RuleSource for RulesClient {
    // ---
    async fn fetch_rules(&self) -> Result<Vec<AggregationRule>> {
        // ---
        let url = self.url();
        tracing::debug!("Fetching rules from: {}", url);

        let records: Vec<RuleRecord> = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("rules request failed")?
            .error_for_status()
            .context("rules endpoint returned an error")?
            .json()
            .await
            .context("rules response is not a rule list")?;

        let rules = validate_snapshot(records);
        tracing::info!("Loaded {} active metric configurations", rules.len());
        Ok(rules)
    }
}

/// Fixed rule set.
#[derive(Debug, Clone, Default)]
pub struct StaticRules {
    rules: Vec<AggregationRule>,
}

impl StaticRules {
    pub fn new(rules: Vec<AggregationRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl RuleSource for StaticRules {
    async fn fetch_rules(&self) -> Result<Vec<AggregationRule>> {
        Ok(self.rules.clone())
    }
}

/// Fetch a fresh snapshot and hand it to the router. A failed fetch keeps
/// the router on its previous snapshot.
pub async fn reload(source: &dyn RuleSource, router: &RouterHandle) -> Result<usize> {
    // ---
    let rules = source.fetch_rules().await?;
    let count = rules.len();
    router.reload(rules).await?;
    Ok(count)
}

/// Poll the source every `period` and push each snapshot to the router.
pub fn spawn_refresher(
    source: std::sync::Arc<dyn RuleSource>,
    router: RouterHandle,
    period: Duration,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = reload(source.as_ref(), &router).await {
                tracing::error!(error = %e, "Rule refresh failed, keeping previous snapshot");
            }
        }
    })
}
