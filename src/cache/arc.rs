//! Adaptive Replacement Cache (ARC) offloading policy.
//!
//! Resident blocks live in one of two lists:
//! - T1 holds blocks seen once (recency),
//! - T2 holds blocks touched again after becoming ready (frequency).
//!
//! Two ghost lists keep only the hashes of recent victims: B1 for blocks
//! evicted from T1, B2 for blocks evicted from T2. A touch that hits a ghost
//! list means the eviction was a mistake and shifts `target_t1_size`, the
//! share of the cache the recency list is allowed to keep:
//!
//! ```text
//! hit in B1:  target = min(target + speed * max(1, |B2| / |B1|), capacity)
//! hit in B2:  target = max(target - speed * max(1, |B1| / |B2|), 0)
//! ```
//!
//! Victims are chosen from the least recently touched end of T1 while
//! `|T1| >= target`, else from T2. Pinned or pending blocks are skipped.

use std::collections::HashSet;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::backend::Backend;
use crate::cache::block::{
    BlockHash, BlockState, BlockStatus, EventKind, LoadStoreSpec, OffloadingEvent, PrepareStoreOutput,
    TransferKind,
};
use crate::cache::manager::{
    EventLog, ImportancePruner, OffloadingManager, OffloadingStats, PolicyCounters,
};
use crate::config::ArcConfig;

/// Resident list a victim is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResidentList {
    T1,
    T2,
}

/// Unlocked ARC state. Wrapped by [`ArcOffloadingManager`] and by the
/// adaptive manager, which adds its own bookkeeping under the same lock.
pub(crate) struct ArcCore<B> {
    backend: B,
    t1: LruCache<BlockHash, BlockStatus>,
    t2: LruCache<BlockHash, BlockStatus>,
    b1: LruCache<BlockHash, ()>,
    b2: LruCache<BlockHash, ()>,
    target_t1_size: f64,
    cache_capacity: usize,
    adaptation_speed: f64,
    pruner: Option<Box<dyn ImportancePruner>>,
    events: EventLog,
    counters: PolicyCounters,
}

impl<B: Backend> ArcCore<B> {
    pub fn new(backend: B, adaptation_speed: f64) -> Self {
        let cache_capacity = backend.num_free_blocks();
        Self {
            backend,
            t1: LruCache::unbounded(),
            t2: LruCache::unbounded(),
            b1: LruCache::unbounded(),
            b2: LruCache::unbounded(),
            target_t1_size: 0.0,
            cache_capacity,
            adaptation_speed,
            pruner: None,
            events: EventLog::default(),
            counters: PolicyCounters::default(),
        }
    }

    pub fn set_importance_pruner(&mut self, pruner: Option<Box<dyn ImportancePruner>>) {
        self.pruner = pruner;
    }

    pub fn adaptation_speed(&self) -> f64 {
        self.adaptation_speed
    }

    pub fn set_adaptation_speed(&mut self, speed: f64) {
        self.adaptation_speed = speed;
    }

    fn resident(&self, hash: &BlockHash) -> Option<&BlockStatus> {
        self.t1.peek(hash).or_else(|| self.t2.peek(hash))
    }

    fn resident_mut(&mut self, hash: &BlockHash) -> Option<&mut BlockStatus> {
        match self.t1.peek_mut(hash) {
            Some(block) => Some(block),
            None => self.t2.peek_mut(hash),
        }
    }

    pub fn is_resident(&self, hash: &BlockHash) -> bool {
        self.t1.contains(hash) || self.t2.contains(hash)
    }

    pub fn lookup(&mut self, hashes: &[BlockHash]) -> usize {
        let hits = hashes
            .iter()
            .take_while(|hash| self.resident(hash).is_some_and(BlockStatus::is_ready))
            .count();
        self.counters.record_lookup(hits, hashes.len());
        hits
    }

    pub fn prepare_load(&mut self, hashes: &[BlockHash]) -> LoadStoreSpec {
        // Validate everything before pinning anything.
        let mut block_ids = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let block = self
                .resident(hash)
                .unwrap_or_else(|| panic!("prepare_load of block {hash} that is not cached"));
            assert!(
                block.is_ready(),
                "prepare_load of block {hash} in state {:?}",
                block.state()
            );
            block_ids.push(block.block_id);
        }

        for hash in hashes {
            if let Some(block) = self.resident_mut(hash) {
                block.acquire();
            }
        }
        self.backend.load_store_spec(TransferKind::Load, hashes, &block_ids)
    }

    pub fn touch(&mut self, hashes: &[BlockHash]) {
        for hash in hashes.iter().rev() {
            if let Some(ready) = self.t1.peek(hash).map(BlockStatus::is_ready) {
                if ready {
                    // Second access after the store landed: frequency, not recency.
                    if let Some(mut block) = self.t1.pop(hash) {
                        block.touch();
                        self.t2.put(*hash, block);
                    }
                } else {
                    self.t1.promote(hash);
                    if let Some(block) = self.t1.peek_mut(hash) {
                        block.touch();
                    }
                }
            } else if self.t2.contains(hash) {
                self.t2.promote(hash);
                if let Some(block) = self.t2.peek_mut(hash) {
                    block.touch();
                }
            } else if self.b1.contains(hash) {
                let ratio = self.b2.len() as f64 / self.b1.len() as f64;
                let delta = self.adaptation_speed * ratio.max(1.0);
                self.target_t1_size = (self.target_t1_size + delta).min(self.cache_capacity as f64);
                self.b1.promote(hash);
                debug!(%hash, target = self.target_t1_size, "Ghost hit in B1");
            } else if self.b2.contains(hash) {
                let ratio = self.b1.len() as f64 / self.b2.len() as f64;
                let delta = self.adaptation_speed * ratio.max(1.0);
                self.target_t1_size = (self.target_t1_size - delta).max(0.0);
                self.b2.promote(hash);
                debug!(%hash, target = self.target_t1_size, "Ghost hit in B2");
            }
        }
    }

    pub fn complete_load(&mut self, hashes: &[BlockHash]) {
        for hash in hashes {
            let block = self
                .resident(hash)
                .unwrap_or_else(|| panic!("complete_load of block {hash} that is not cached"));
            assert!(
                block.ref_count() > 0,
                "complete_load of block {hash} that was never loaded"
            );
        }
        let mut stale = Vec::new();
        for hash in hashes {
            if let Some(block) = self.resident_mut(hash) {
                block.release();
                if block.ref_count() == 0 && block.state() == BlockState::Invalid {
                    stale.push(*hash);
                }
            }
        }
        self.discard(stale);
    }

    /// Pick one victim without mutating anything.
    ///
    /// `excluded` holds victims already chosen in this pass and `t1_len` is
    /// the size T1 will have once they are gone. Only hashes accepted by
    /// `accept` are considered.
    fn select_victim(
        &self,
        excluded: &HashSet<BlockHash>,
        t1_len: usize,
        accept: &dyn Fn(&BlockHash) -> bool,
    ) -> Option<(BlockHash, ResidentList)> {
        let evictable = |hash: &BlockHash, block: &BlockStatus| {
            block.can_evict() && !excluded.contains(hash) && accept(hash)
        };
        let oldest = |list: &LruCache<BlockHash, BlockStatus>| {
            list.iter()
                .rev()
                .find(|(hash, block)| evictable(*hash, *block))
                .map(|(hash, _)| *hash)
        };

        if let Some(pruner) = &self.pruner {
            let threshold = pruner.threshold();
            let low = |hash: &BlockHash, block: &BlockStatus| {
                evictable(hash, block) && block.importance.is_some_and(|score| score < threshold)
            };
            if let Some((hash, _)) = self.t1.iter().rev().find(|(hash, block)| low(*hash, *block)) {
                return Some((*hash, ResidentList::T1));
            }
            if let Some((hash, _)) = self.t2.iter().rev().find(|(hash, block)| low(*hash, *block)) {
                return Some((*hash, ResidentList::T2));
            }
        }

        let from_t1 = oldest(&self.t1).map(|hash| (hash, ResidentList::T1));
        let from_t2 = oldest(&self.t2).map(|hash| (hash, ResidentList::T2));

        let preferred = if t1_len as f64 >= self.target_t1_size {
            from_t1
        } else {
            from_t2
        };
        preferred.or(from_t2).or(from_t1)
    }

    fn select_victim_biased(
        &self,
        excluded: &HashSet<BlockHash>,
        t1_len: usize,
        prefer: Option<&dyn Fn(&BlockHash) -> bool>,
    ) -> Option<(BlockHash, ResidentList)> {
        if let Some(prefer) = prefer {
            if let Some(victim) = self.select_victim(excluded, t1_len, prefer) {
                return Some(victim);
            }
        }
        self.select_victim(excluded, t1_len, &|_| true)
    }

    /// Store preparation with an optional victim preference, tried before
    /// the plain ARC order for each victim.
    ///
    /// Returns `None` when room cannot be made. If the backend refuses the
    /// allocation after victims were already freed, those evictions stand:
    /// they are recorded in the event log and ghost lists like any other.
    pub fn prepare_store_with(
        &mut self,
        hashes: &[BlockHash],
        prefer: Option<&dyn Fn(&BlockHash) -> bool>,
    ) -> Option<PrepareStoreOutput> {
        let mut seen = HashSet::with_capacity(hashes.len());
        let to_store: Vec<BlockHash> = hashes
            .iter()
            .copied()
            .filter(|hash| !self.is_resident(hash) && seen.insert(*hash))
            .collect();

        let need = to_store.len().saturating_sub(self.backend.num_free_blocks());

        // Choose every victim first so that a failed pass leaves no trace.
        let mut chosen = HashSet::with_capacity(need);
        let mut victims = Vec::with_capacity(need);
        let mut t1_len = self.t1.len();
        for _ in 0..need {
            match self.select_victim_biased(&chosen, t1_len, prefer) {
                Some((hash, list)) => {
                    if list == ResidentList::T1 {
                        t1_len -= 1;
                    }
                    chosen.insert(hash);
                    victims.push((hash, list));
                }
                None => {
                    warn!(
                        requested = to_store.len(),
                        need,
                        evictable = victims.len(),
                        "Cannot make room for store"
                    );
                    self.counters.backpressure += 1;
                    return None;
                }
            }
        }

        let evicted = self.evict(victims);

        let blocks = match self.backend.allocate_blocks(&to_store) {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!(
                    %err,
                    requested = to_store.len(),
                    evicted = evicted.len(),
                    "Backend allocation failed"
                );
                self.counters.backpressure += 1;
                return None;
            }
        };

        let block_ids: Vec<_> = blocks.iter().map(|block| block.block_id).collect();
        for (hash, block) in to_store.iter().zip(blocks) {
            // A hash returning from a ghost list starts over in T1.
            self.b1.pop(hash);
            self.b2.pop(hash);
            self.t1.put(*hash, block);
        }
        self.counters.stored_blocks += to_store.len() as u64;

        let store_spec = self
            .backend
            .load_store_spec(TransferKind::Store, &to_store, &block_ids);
        self.events.record(
            EventKind::Stored,
            to_store.clone(),
            self.backend.block_size(),
            self.backend.medium(),
        );

        Some(PrepareStoreOutput {
            to_store,
            store_spec,
            evicted,
        })
    }

    fn evict(&mut self, victims: Vec<(BlockHash, ResidentList)>) -> Vec<BlockHash> {
        let mut evicted = Vec::with_capacity(victims.len());
        for (hash, list) in victims {
            let block = match list {
                ResidentList::T1 => self.t1.pop(&hash),
                ResidentList::T2 => self.t2.pop(&hash),
            };
            let Some(mut block) = block else {
                continue;
            };
            match list {
                ResidentList::T1 => self.b1.put(hash, ()),
                ResidentList::T2 => self.b2.put(hash, ()),
            };

            debug!(%hash, block_id = block.block_id, ?list, "Evicted block");
            block.mark_evicting();
            self.backend.free(block);
            evicted.push(hash);
        }

        while self.b1.len() > self.cache_capacity {
            self.b1.pop_lru();
        }
        while self.b2.len() > self.cache_capacity {
            self.b2.pop_lru();
        }

        if !evicted.is_empty() {
            self.counters.evicted_blocks += evicted.len() as u64;
            info!(
                evicted = evicted.len(),
                t1 = self.t1.len(),
                t2 = self.t2.len(),
                target = self.target_t1_size,
                "Eviction round complete"
            );
            self.events.record(
                EventKind::Evicted,
                evicted.clone(),
                self.backend.block_size(),
                self.backend.medium(),
            );
        }
        evicted
    }

    /// Force blocks to be refreshed.
    ///
    /// Unpinned blocks are freed at once and leave no ghost. Pinned blocks
    /// stop answering lookups and are freed when their last load completes.
    /// Either way the hash can be stored again. Returns the number freed now.
    pub fn invalidate(&mut self, hashes: &[BlockHash]) -> usize {
        let mut stale = Vec::new();
        for hash in hashes {
            if let Some(block) = self.resident_mut(hash) {
                block.invalidate();
                if block.ref_count() == 0 {
                    stale.push(*hash);
                }
            }
        }
        self.discard(stale)
    }

    fn discard(&mut self, hashes: Vec<BlockHash>) -> usize {
        let mut discarded = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let Some(block) = self.t1.pop(&hash).or_else(|| self.t2.pop(&hash)) else {
                continue;
            };
            debug!(%hash, block_id = block.block_id, "Discarded invalid block");
            self.backend.free(block);
            discarded.push(hash);
        }
        if discarded.is_empty() {
            return 0;
        }
        self.counters.evicted_blocks += discarded.len() as u64;
        let count = discarded.len();
        self.events.record(
            EventKind::Evicted,
            discarded,
            self.backend.block_size(),
            self.backend.medium(),
        );
        count
    }

    pub fn complete_store(&mut self, hashes: &[BlockHash]) {
        for hash in hashes {
            if let Some(block) = self.resident_mut(hash) {
                block.mark_ready();
            }
        }
    }

    /// Refresh a resident block's importance from its hidden states.
    pub fn update_block_importance(&mut self, hash: &BlockHash, hidden_states: &[f32]) {
        let Some(pruner) = &self.pruner else {
            return;
        };
        let scores = pruner.get_importance_scores(hidden_states);
        if scores.is_empty() {
            return;
        }
        let score = scores.iter().sum::<f32>() / scores.len() as f32;
        if let Some(block) = self.resident_mut(hash) {
            block.importance = Some(score);
        }
    }

    /// Free every unpinned resident block and forget all ghosts.
    ///
    /// Returns the number of blocks freed. Pinned blocks stay resident.
    pub fn clear(&mut self) -> usize {
        let mut freed = 0;
        for list in [&mut self.t1, &mut self.t2] {
            let unpinned: Vec<BlockHash> = list
                .iter()
                .filter(|(_, block)| block.ref_count() == 0)
                .map(|(hash, _)| *hash)
                .collect();
            for hash in unpinned {
                if let Some(block) = list.pop(&hash) {
                    self.backend.free(block);
                    freed += 1;
                }
            }
        }
        self.b1.clear();
        self.b2.clear();
        self.target_t1_size = 0.0;
        info!(freed, pinned = self.t1.len() + self.t2.len(), "Cleared cache");
        freed
    }

    pub fn take_events(&mut self) -> Vec<OffloadingEvent> {
        self.events.drain()
    }

    pub fn stats(&self, policy: &'static str) -> OffloadingStats {
        let mut stats = OffloadingStats {
            policy,
            medium: Some(self.backend.medium()),
            cache_capacity: self.cache_capacity,
            free_blocks: self.backend.num_free_blocks(),
            t1_len: self.t1.len(),
            t2_len: self.t2.len(),
            b1_len: self.b1.len(),
            b2_len: self.b2.len(),
            target_t1_size: self.target_t1_size,
            adaptation_speed: self.adaptation_speed,
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    pub fn contents(&self) -> ArcContents {
        let keys = |list: &LruCache<BlockHash, BlockStatus>| {
            list.iter().rev().map(|(hash, _)| *hash).collect()
        };
        let ghosts = |list: &LruCache<BlockHash, ()>| {
            list.iter().rev().map(|(hash, _)| *hash).collect()
        };
        ArcContents {
            t1: keys(&self.t1),
            t2: keys(&self.t2),
            b1: ghosts(&self.b1),
            b2: ghosts(&self.b2),
            target_t1_size: self.target_t1_size,
            cache_capacity: self.cache_capacity,
        }
    }
}

/// Copy of the four lists, each ordered least to most recently touched.
#[derive(Debug, Clone, PartialEq)]
pub struct ArcContents {
    pub t1: Vec<BlockHash>,
    pub t2: Vec<BlockHash>,
    pub b1: Vec<BlockHash>,
    pub b2: Vec<BlockHash>,
    pub target_t1_size: f64,
    pub cache_capacity: usize,
}

/// Thread-safe ARC offloading manager over a single backend.
pub struct ArcOffloadingManager<B> {
    inner: Mutex<ArcCore<B>>,
}

impl<B: Backend> ArcOffloadingManager<B> {
    /// Create a manager whose capacity is the backend's current free-block count.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, &ArcConfig::default())
    }

    pub fn with_config(backend: B, config: &ArcConfig) -> Self {
        Self {
            inner: Mutex::new(ArcCore::new(backend, config.adaptation_speed)),
        }
    }

    /// Attach (or detach) the importance pruner.
    pub fn set_importance_pruner(&self, pruner: Option<Box<dyn ImportancePruner>>) {
        self.inner.lock().set_importance_pruner(pruner);
    }

    pub fn update_block_importance(&self, hash: &BlockHash, hidden_states: &[f32]) {
        self.inner.lock().update_block_importance(hash, hidden_states);
    }

    pub fn clear(&self) -> usize {
        self.inner.lock().clear()
    }

    /// Mark blocks stale. Returns how many were freed immediately.
    pub fn invalidate(&self, hashes: &[BlockHash]) -> usize {
        self.inner.lock().invalidate(hashes)
    }

    pub fn target_t1_size(&self) -> f64 {
        self.inner.lock().target_t1_size
    }

    pub fn cache_capacity(&self) -> usize {
        self.inner.lock().cache_capacity
    }

    /// Snapshot of T1, T2, B1 and B2.
    pub fn contents(&self) -> ArcContents {
        self.inner.lock().contents()
    }
}

impl<B: Backend> OffloadingManager for ArcOffloadingManager<B> {
    fn lookup(&self, hashes: &[BlockHash]) -> usize {
        self.inner.lock().lookup(hashes)
    }

    fn prepare_load(&self, hashes: &[BlockHash]) -> LoadStoreSpec {
        self.inner.lock().prepare_load(hashes)
    }

    fn touch(&self, hashes: &[BlockHash]) {
        self.inner.lock().touch(hashes)
    }

    fn complete_load(&self, hashes: &[BlockHash]) {
        self.inner.lock().complete_load(hashes)
    }

    fn prepare_store(&self, hashes: &[BlockHash]) -> Option<PrepareStoreOutput> {
        self.inner.lock().prepare_store_with(hashes, None)
    }

    fn complete_store(&self, hashes: &[BlockHash]) {
        self.inner.lock().complete_store(hashes)
    }

    fn take_events(&self) -> Vec<OffloadingEvent> {
        self.inner.lock().take_events()
    }

    fn stats(&self) -> OffloadingStats {
        self.inner.lock().stats("arc")
    }
}
