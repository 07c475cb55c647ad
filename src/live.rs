//! Live buffer: in-memory aggregates for windows that are still open.
//!
//! One `LiveBuffer` belongs to one rule worker, which is its only writer.
//! A bucket moves through three places:
//!
//! - `entries`: open, still accepting samples;
//! - `pending`: selected for flush, held until the flush is confirmed;
//! - `selected`: remembered after selection so it is never picked twice.
//!
//! A failed flush returns its buckets to `entries` so the next scan picks
//! them up again; after `max_restores` failures a bucket is dead-lettered.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{AggregateState, AggregationRule, Batch, BucketKey, Sample};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The bucket was already selected for flush; the caller should treat
    /// the sample as backfill.
    AlreadySelected,
}

/// A detached copy of selected buckets, ready for the flush pipeline.
#[derive(Debug, Clone)]
pub struct PendingFlush {
    pub id: Uuid,
    pub batch: Batch,
}

pub struct LiveBuffer {
    entries: HashMap<BucketKey, AggregateState>,
    pending: HashMap<Uuid, Batch>,
    /// Selected key -> bucket end, used for pruning.
    selected: HashMap<BucketKey, DateTime<Utc>>,
    restores: HashMap<BucketKey, u32>,
    max_restores: u32,
}

impl LiveBuffer {
    // ---
    pub fn new(max_restores: u32) -> Self {
        Self {
            entries: HashMap::new(),
            pending: HashMap::new(),
            selected: HashMap::new(),
            restores: HashMap::new(),
            max_restores,
        }
    }

    /// Add a sample to its bucket, creating the bucket on first sight.
    pub fn merge(&mut self, rule: &AggregationRule, sample: &Sample) -> Result<MergeOutcome> {
        // ---
        let (key, window) = rule.key_of(sample)?;
        if self.selected.contains_key(&key) {
            return Ok(MergeOutcome::AlreadySelected);
        }

        self.entries
            .entry(key)
            .or_insert_with_key(|key| AggregateState::new(key, window, sample))
            .add(sample);
        Ok(MergeOutcome::Merged)
    }

    /// Move every bucket whose window ended at or before `now` into the
    /// pending area and return a copy for flushing.
    pub fn collect_closed(&mut self, now: DateTime<Utc>) -> Option<PendingFlush> {
        // ---
        let closed: Vec<BucketKey> = self
            .entries
            .iter()
            .filter(|(key, state)| state.bucket_end <= now && !self.selected.contains_key(*key))
            .map(|(key, _)| key.clone())
            .collect();

        self.select(closed)
    }

    /// Select every bucket regardless of its window. Used for the final
    /// flush on shutdown.
    pub fn drain_all(&mut self) -> Option<PendingFlush> {
        // ---
        let keys: Vec<BucketKey> = self.entries.keys().cloned().collect();
        self.select(keys)
    }

    fn select(&mut self, keys: Vec<BucketKey>) -> Option<PendingFlush> {
        // ---
        if keys.is_empty() {
            return None;
        }

        let mut batch = Batch::with_capacity(keys.len());
        for key in keys {
            if let Some(state) = self.entries.remove(&key) {
                self.selected.insert(key.clone(), state.bucket_end);
                batch.insert(key, state);
            }
        }

        let id = Uuid::new_v4();
        self.pending.insert(id, batch.clone());
        Some(PendingFlush { id, batch })
    }

    /// The flush for `id` committed; release its buckets for good.
    pub fn confirm(&mut self, id: Uuid) -> usize {
        // ---
        match self.pending.remove(&id) {
            Some(batch) => {
                for key in batch.keys() {
                    self.restores.remove(key);
                }
                batch.len()
            }
            None => 0,
        }
    }

    /// The flush for `id` failed. Buckets with restores left go back to the
    /// live map; the rest are returned for dead-lettering.
    pub fn restore(&mut self, id: Uuid) -> Batch {
        // ---
        let mut dead = Batch::new();
        let Some(batch) = self.pending.remove(&id) else {
            return dead;
        };

        for (key, state) in batch {
            let restores = self.restores.entry(key.clone()).or_insert(0);
            *restores += 1;
            if *restores > self.max_restores {
                self.restores.remove(&key);
                dead.insert(key, state);
                continue;
            }

            self.selected.remove(&key);
            match self.entries.get_mut(&key) {
                Some(existing) => existing.absorb(state),
                None => {
                    self.entries.insert(key, state);
                }
            }
        }
        dead
    }

    /// Give up on `id` without retrying, e.g. after a non-retryable error.
    pub fn abandon(&mut self, id: Uuid) -> Batch {
        // ---
        let batch = self.pending.remove(&id).unwrap_or_default();
        for key in batch.keys() {
            self.restores.remove(key);
        }
        batch
    }

    /// Take every batch still waiting for a flush result.
    pub fn take_pending(&mut self) -> Vec<PendingFlush> {
        self.pending
            .drain()
            .map(|(id, batch)| PendingFlush { id, batch })
            .collect()
    }

    /// Forget selected keys whose window ended more than `retention` ago.
    pub fn prune_selected(&mut self, now: DateTime<Utc>, retention: Duration) {
        // ---
        let horizon = now - retention;
        self.selected.retain(|_, end| *end > horizon);
    }

    /// True while `key` is an open (unselected) bucket.
    pub fn contains(&self, key: &BucketKey) -> bool {
        self.entries.contains_key(key)
    }

    /// True while `key` sits in a batch whose flush has not settled.
    pub fn is_pending(&self, key: &BucketKey) -> bool {
        self.pending.values().any(|batch| batch.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, key: &BucketKey) -> Option<&AggregateState> {
        self.entries.get(key)
    }
}
