//! Rule routing and work partitioning.
//!
//! The router owns the current rule snapshot and one worker per active
//! rule. It runs as its own task: samples, snapshot reloads and shutdown
//! arrive as commands on one channel, so the snapshot and the worker map
//! have a single owner. A supervision tick restarts crashed workers and
//! marks a rule degraded once it has crashed too often.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::flush::FlushPipeline;
use crate::models::{AggregationRule, Sample};
use crate::worker::{self, RuleWorkerHandle, WorkerSettings};

// ---

/// Extra time the router waits past the workers' own drain bound so that
/// they can dead-letter what they could not flush.
const WORKER_EXIT_MARGIN: Duration = Duration::from_secs(2);

/// Which path a sample takes for one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Window still open: merge into the live buffer.
    Live,
    /// Window already closed: reconcile as backfill.
    Past,
}

/// Active rules whose entity matches the sample's device or machine id.
pub fn matching_rules<'a>(
    rules: &'a [AggregationRule],
    sample: &'a Sample,
) -> impl Iterator<Item = &'a AggregationRule> + 'a {
    rules.iter().filter(move |rule| rule.is_active && rule.matches(sample))
}

/// Decide live vs. past for `sample` under `rule` at `now`.
pub fn classify(rule: &AggregationRule, sample: &Sample, now: DateTime<Utc>) -> Result<Route> {
    // ---
    let window = rule.window_of(sample)?;
    Ok(if window.is_closed(now) {
        Route::Past
    } else {
        Route::Live
    })
}

/// Router state published for readiness checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatus {
    pub running: bool,
    pub workers: usize,
    pub degraded_rules: Vec<i64>,
}

pub struct RouterSettings {
    pub worker: WorkerSettings,
    /// Crash restarts allowed before a rule is marked degraded.
    pub max_restarts: u32,
    pub supervise_interval: Duration,
    pub command_depth: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            max_restarts: 5,
            supervise_interval: Duration::from_secs(5),
            command_depth: 10_000,
        }
    }
}

enum Command {
    Sample(Sample),
    Reload(Vec<AggregationRule>),
    Shutdown {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the router task.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<RouterStatus>,
}

impl RouterHandle {
    // ---
    /// Queue a parsed sample, waiting if the router is backed up.
    pub async fn submit(&self, sample: Sample) -> Result<()> {
        self.tx
            .send(Command::Sample(sample))
            .await
            .map_err(|_| anyhow!("router is not running"))
    }

    /// Replace the rule snapshot.
    pub async fn reload(&self, rules: Vec<AggregationRule>) -> Result<()> {
        self.tx
            .send(Command::Reload(rules))
            .await
            .map_err(|_| anyhow!("router is not running"))
    }

    /// Stop every worker, waiting at most `grace` for their final flushes.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        // ---
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { grace, done })
            .await
            .map_err(|_| anyhow!("router is not running"))?;
        wait.await.map_err(|_| anyhow!("router stopped before confirming shutdown"))
    }

    pub fn status(&self) -> RouterStatus {
        self.status.borrow().clone()
    }
}

struct WorkerSlot {
    rule: AggregationRule,
    handle: RuleWorkerHandle,
    task: JoinHandle<()>,
    restarts: u32,
}

pub struct Router {
    rules: Arc<Vec<AggregationRule>>,
    workers: HashMap<i64, WorkerSlot>,
    degraded: BTreeSet<i64>,
    retiring: Vec<JoinHandle<()>>,
    pipeline: FlushPipeline,
    settings: RouterSettings,
    status: watch::Sender<RouterStatus>,
}

/// Start the router task with an initial snapshot.
pub fn spawn(
    rules: Vec<AggregationRule>,
    pipeline: FlushPipeline,
    settings: RouterSettings,
) -> (RouterHandle, JoinHandle<()>) {
    // ---
    let (tx, rx) = mpsc::channel(settings.command_depth.max(1));
    let (status_tx, status_rx) = watch::channel(RouterStatus::default());

    let mut router = Router::new(pipeline, settings, status_tx);
    router.apply_snapshot(rules);

    let task = tokio::spawn(router.run(rx));
    (
        RouterHandle {
            tx,
            status: status_rx,
        },
        task,
    )
}

impl Router {
    // ---
    fn new(
        pipeline: FlushPipeline,
        settings: RouterSettings,
        status: watch::Sender<RouterStatus>,
    ) -> Self {
        Self {
            rules: Arc::new(Vec::new()),
            workers: HashMap::new(),
            degraded: BTreeSet::new(),
            retiring: Vec::new(),
            pipeline,
            settings,
            status,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        // ---
        let mut supervise = tokio::time::interval(self.settings.supervise_interval);
        supervise.tick().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Sample(sample)) => {
                        self.route(sample, Utc::now());
                    }
                    Some(Command::Reload(rules)) => self.apply_snapshot(rules),
                    Some(Command::Shutdown { grace, done }) => {
                        commands.close();
                        self.shutdown(grace).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        let grace = self.settings.worker.drain_grace;
                        self.shutdown(grace).await;
                        return;
                    }
                },
                _ = supervise.tick() => self.supervise(),
            }
        }
    }

    /// Send `sample` to every matching rule's worker. Returns how many
    /// workers accepted it.
    pub fn route(&mut self, sample: Sample, now: DateTime<Utc>) -> usize {
        // ---
        let rules = Arc::clone(&self.rules);
        let mut routed = 0;

        for rule in matching_rules(&rules, &sample) {
            let route = match classify(rule, &sample, now) {
                Ok(route) => route,
                Err(e) => {
                    tracing::warn!(rule_id = rule.id, error = %e, "Cannot bucket sample");
                    self.pipeline.metrics().record_rejected_sample();
                    continue;
                }
            };

            if self.degraded.contains(&rule.id) {
                tracing::warn!(rule_id = rule.id, "Rule is degraded, dropping sample");
                self.pipeline.metrics().record_dropped_sample();
                continue;
            }

            if !self.workers.contains_key(&rule.id) {
                self.start_worker(rule.clone(), 0);
            }
            let Some(slot) = self.workers.get(&rule.id) else {
                continue;
            };

            match slot.handle.try_send(sample.clone(), route) {
                Ok(()) => routed += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(rule_id = rule.id, "Worker mailbox full, dropping sample");
                    self.pipeline.metrics().record_dropped_sample();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::error!(rule_id = rule.id, "Worker is gone, restarting");
                    self.restart(rule.id);
                    let retried = self
                        .workers
                        .get(&rule.id)
                        .map(|slot| slot.handle.try_send(sample.clone(), route));
                    match retried {
                        Some(Ok(())) => routed += 1,
                        _ => self.pipeline.metrics().record_dropped_sample(),
                    }
                }
            }
        }

        if routed == 0 {
            tracing::debug!(tenant_id = %sample.tenant_id, "Sample was not routed to any worker");
        }
        routed
    }

    /// Replace the snapshot: start workers for new rules, retire workers for
    /// removed rules, and replace workers whose rule definition changed.
    pub fn apply_snapshot(&mut self, rules: Vec<AggregationRule>) {
        // ---
        let next: HashMap<i64, &AggregationRule> = rules
            .iter()
            .filter(|r| r.is_active)
            .map(|r| (r.id, r))
            .collect();

        let stale: Vec<i64> = self
            .workers
            .iter()
            .filter(|(id, slot)| next.get(*id).map_or(true, |rule| **rule != slot.rule))
            .map(|(id, _)| *id)
            .collect();
        let grace = self.settings.worker.drain_grace;
        for id in stale {
            self.retire(id, grace);
        }
        self.degraded.retain(|id| next.contains_key(id));

        for (id, rule) in &next {
            if !self.workers.contains_key(id) && !self.degraded.contains(id) {
                self.start_worker((*rule).clone(), 0);
            }
        }

        tracing::info!(rules = next.len(), "Applied rule snapshot");
        self.rules = Arc::new(rules);
        self.publish(true);
    }

    /// Detect crashed workers and restart them, or mark their rule degraded.
    pub fn supervise(&mut self) {
        // ---
        let crashed: Vec<i64> = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.task.is_finished() || slot.handle.is_closed())
            .map(|(id, _)| *id)
            .collect();

        for id in crashed {
            self.restart(id);
        }
        self.retiring.retain(|task| !task.is_finished());
        self.publish(true);
    }

    fn start_worker(&mut self, rule: AggregationRule, restarts: u32) {
        // ---
        let id = rule.id;
        let spawned = worker::spawn(
            rule.clone(),
            self.pipeline.clone(),
            self.settings.worker.clone(),
        );
        self.workers.insert(
            id,
            WorkerSlot {
                rule,
                handle: spawned.handle,
                task: spawned.task,
                restarts,
            },
        );
    }

    fn restart(&mut self, id: i64) {
        // ---
        let Some(slot) = self.workers.remove(&id) else {
            return;
        };
        slot.task.abort();

        if slot.restarts >= self.settings.max_restarts {
            tracing::error!(
                rule_id = id,
                restarts = slot.restarts,
                "Worker keeps crashing, marking rule degraded"
            );
            self.degraded.insert(id);
        } else {
            tracing::warn!(rule_id = id, restarts = slot.restarts + 1, "Restarting crashed worker");
            self.start_worker(slot.rule, slot.restarts + 1);
        }
        self.publish(true);
    }

    /// Ask a worker to drain within `grace` and stop, without waiting for it.
    fn retire(&mut self, id: i64, grace: Duration) {
        // ---
        if let Some(slot) = self.workers.remove(&id) {
            tracing::info!(rule_id = id, "Retiring worker");
            let handle = slot.handle;
            let task = slot.task;
            self.retiring.push(tokio::spawn(async move {
                handle.shutdown(grace).await;
                let _ = task.await;
            }));
        }
    }

    async fn shutdown(&mut self, grace: Duration) {
        // ---
        tracing::info!(workers = self.workers.len(), "Shutting down workers");
        let ids: Vec<i64> = self.workers.keys().copied().collect();
        for id in ids {
            self.retire(id, grace);
        }

        let retiring = std::mem::take(&mut self.retiring);
        let all_done = async {
            for task in retiring {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace + WORKER_EXIT_MARGIN, all_done)
            .await
            .is_err()
        {
            tracing::warn!(grace_secs = grace.as_secs(), "Shutdown grace period elapsed");
        }
        self.publish(false);
    }

    fn publish(&self, running: bool) {
        // ---
        let status = RouterStatus {
            running,
            workers: self.workers.len(),
            degraded_rules: self.degraded.iter().copied().collect(),
        };
        self.status.send_replace(status);
    }
}
