//! The offloading-manager contract shared by every replacement policy.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::Serialize;
use tracing::debug;

use crate::cache::block::{
    BlockHash, EventKind, LoadStoreSpec, Medium, OffloadingEvent, PrepareStoreOutput,
};

/// Operations a model-execution loop drives against an offloading policy.
///
/// Every `prepare_load` must be paired with a `complete_load` and every
/// `prepare_store` with a `complete_store`; an unpaired call leaves blocks
/// pinned forever.
pub trait OffloadingManager: Send + Sync {
    /// Number of consecutive hashes, from the front, that are resident and ready.
    fn lookup(&self, hashes: &[BlockHash]) -> usize;

    /// Pin the blocks for reading and describe the load.
    ///
    /// # Panics
    /// Panics if any hash is not resident or not ready.
    fn prepare_load(&self, hashes: &[BlockHash]) -> LoadStoreSpec;

    /// Recency/frequency bookkeeping. Hashes are processed last to first so
    /// that the first block of a prefix ends up most recently touched.
    fn touch(&self, hashes: &[BlockHash]);

    /// Unpin blocks pinned by `prepare_load`.
    ///
    /// # Panics
    /// Panics if any hash is not resident or not pinned.
    fn complete_load(&self, hashes: &[BlockHash]);

    /// Make room for and allocate the hashes that are not yet resident.
    ///
    /// Returns `None` when not enough blocks can be evicted; the caller
    /// should retry later or reject the request. State is unchanged in
    /// that case.
    fn prepare_store(&self, hashes: &[BlockHash]) -> Option<PrepareStoreOutput>;

    /// Mark stored blocks ready for loading.
    fn complete_store(&self, hashes: &[BlockHash]);

    /// Drain the audit trail of store and eviction events.
    fn take_events(&self) -> Vec<OffloadingEvent>;

    /// Snapshot of the policy's counters.
    fn stats(&self) -> OffloadingStats;
}

/// Optional pruning signal consulted during eviction.
pub trait ImportancePruner: Send {
    /// Per-token (or per-head) importance scores for a block's hidden states.
    fn get_importance_scores(&self, hidden_states: &[f32]) -> Vec<f32>;

    /// Blocks scoring below this are evicted ahead of the replacement order.
    fn threshold(&self) -> f32;
}

/// Serializable snapshot of a manager.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OffloadingStats {
    pub policy: &'static str,
    pub medium: Option<Medium>,
    pub cache_capacity: usize,
    pub free_blocks: usize,
    pub t1_len: usize,
    pub t2_len: usize,
    pub b1_len: usize,
    pub b2_len: usize,
    pub target_t1_size: f64,
    pub adaptation_speed: f64,
    pub lookups: u64,
    pub lookup_hits: u64,
    pub lookup_blocks: u64,
    pub stored_blocks: u64,
    pub evicted_blocks: u64,
    pub backpressure: u64,
}

impl OffloadingStats {
    /// Fraction of looked-up blocks that hit.
    pub fn hit_rate(&self) -> f64 {
        if self.lookup_blocks == 0 {
            return 0.0;
        }
        self.lookup_hits as f64 / self.lookup_blocks as f64
    }
}

/// Counters common to all policies.
#[derive(Debug, Clone, Default)]
pub(crate) struct PolicyCounters {
    pub lookups: u64,
    pub lookup_hits: u64,
    pub lookup_blocks: u64,
    pub stored_blocks: u64,
    pub evicted_blocks: u64,
    pub backpressure: u64,
}

impl PolicyCounters {
    pub fn record_lookup(&mut self, hits: usize, requested: usize) {
        self.lookups += 1;
        self.lookup_hits += hits as u64;
        self.lookup_blocks += requested as u64;
    }

    pub fn fill(&self, stats: &mut OffloadingStats) {
        stats.lookups = self.lookups;
        stats.lookup_hits = self.lookup_hits;
        stats.lookup_blocks = self.lookup_blocks;
        stats.stored_blocks = self.stored_blocks;
        stats.evicted_blocks = self.evicted_blocks;
        stats.backpressure = self.backpressure;
    }
}

/// Most recent events kept when nobody drains the log.
const EVENT_LOG_CAPACITY: usize = 1024;

/// Bounded audit trail of store and eviction events.
#[derive(Debug, Default)]
pub(crate) struct EventLog {
    events: VecDeque<OffloadingEvent>,
}

impl EventLog {
    pub fn record(&mut self, kind: EventKind, hashes: Vec<BlockHash>, block_size: usize, medium: Medium) {
        if hashes.is_empty() {
            return;
        }
        debug!(?kind, count = hashes.len(), %medium, "Offloading event");
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(OffloadingEvent {
            kind,
            hashes,
            block_size,
            medium,
            timestamp: SystemTime::now(),
        });
    }

    pub fn drain(&mut self) -> Vec<OffloadingEvent> {
        self.events.drain(..).collect()
    }
}
