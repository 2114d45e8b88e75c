//! Plain LRU offloading policy, the baseline ARC is measured against.

use std::collections::HashSet;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::backend::Backend;
use crate::cache::block::{
    BlockHash, BlockStatus, EventKind, LoadStoreSpec, OffloadingEvent, PrepareStoreOutput,
    TransferKind,
};
use crate::cache::manager::{EventLog, OffloadingManager, OffloadingStats, PolicyCounters};

struct LruState<B> {
    backend: B,
    blocks: LruCache<BlockHash, BlockStatus>,
    cache_capacity: usize,
    events: EventLog,
    counters: PolicyCounters,
}

/// Single-list LRU manager over one backend.
pub struct LruOffloadingManager<B> {
    inner: Mutex<LruState<B>>,
}

impl<B: Backend> LruOffloadingManager<B> {
    pub fn new(backend: B) -> Self {
        let cache_capacity = backend.num_free_blocks();
        Self {
            inner: Mutex::new(LruState {
                backend,
                blocks: LruCache::unbounded(),
                cache_capacity,
                events: EventLog::default(),
                counters: PolicyCounters::default(),
            }),
        }
    }

    /// Resident hashes, least recently touched first.
    pub fn resident(&self) -> Vec<BlockHash> {
        let state = self.inner.lock();
        state.blocks.iter().rev().map(|(hash, _)| *hash).collect()
    }
}

impl<B: Backend> OffloadingManager for LruOffloadingManager<B> {
    fn lookup(&self, hashes: &[BlockHash]) -> usize {
        let mut state = self.inner.lock();
        let hits = hashes
            .iter()
            .take_while(|hash| state.blocks.peek(*hash).is_some_and(BlockStatus::is_ready))
            .count();
        state.counters.record_lookup(hits, hashes.len());
        hits
    }

    fn prepare_load(&self, hashes: &[BlockHash]) -> LoadStoreSpec {
        let mut state = self.inner.lock();
        let mut block_ids = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let block = state
                .blocks
                .peek(hash)
                .unwrap_or_else(|| panic!("prepare_load of block {hash} that is not cached"));
            assert!(
                block.is_ready(),
                "prepare_load of block {hash} in state {:?}",
                block.state()
            );
            block_ids.push(block.block_id);
        }
        for hash in hashes {
            if let Some(block) = state.blocks.peek_mut(hash) {
                block.acquire();
            }
        }
        state.backend.load_store_spec(TransferKind::Load, hashes, &block_ids)
    }

    fn touch(&self, hashes: &[BlockHash]) {
        let mut state = self.inner.lock();
        for hash in hashes.iter().rev() {
            if let Some(block) = state.blocks.get_mut(hash) {
                block.touch();
            }
        }
    }

    fn complete_load(&self, hashes: &[BlockHash]) {
        let mut state = self.inner.lock();
        for hash in hashes {
            let block = state
                .blocks
                .peek(hash)
                .unwrap_or_else(|| panic!("complete_load of block {hash} that is not cached"));
            assert!(
                block.ref_count() > 0,
                "complete_load of block {hash} that was never loaded"
            );
        }
        for hash in hashes {
            if let Some(block) = state.blocks.peek_mut(hash) {
                block.release();
            }
        }
    }

    fn prepare_store(&self, hashes: &[BlockHash]) -> Option<PrepareStoreOutput> {
        let mut state = self.inner.lock();
        let state = &mut *state;

        let mut seen = HashSet::with_capacity(hashes.len());
        let to_store: Vec<BlockHash> = hashes
            .iter()
            .copied()
            .filter(|hash| !state.blocks.contains(hash) && seen.insert(*hash))
            .collect();
        let need = to_store.len().saturating_sub(state.backend.num_free_blocks());

        let victims: Vec<BlockHash> = state
            .blocks
            .iter()
            .rev()
            .filter(|(_, block)| block.can_evict())
            .map(|(hash, _)| *hash)
            .take(need)
            .collect();
        if victims.len() < need {
            warn!(need, evictable = victims.len(), "Cannot make room for store");
            state.counters.backpressure += 1;
            return None;
        }

        for hash in &victims {
            if let Some(mut block) = state.blocks.pop(hash) {
                debug!(%hash, block_id = block.block_id, "Evicted block");
                block.mark_evicting();
                state.backend.free(block);
            }
        }
        state.counters.evicted_blocks += victims.len() as u64;
        state.events.record(
            EventKind::Evicted,
            victims.clone(),
            state.backend.block_size(),
            state.backend.medium(),
        );

        let blocks = match state.backend.allocate_blocks(&to_store) {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!(%err, "Backend allocation failed");
                state.counters.backpressure += 1;
                return None;
            }
        };
        let block_ids: Vec<_> = blocks.iter().map(|block| block.block_id).collect();
        for (hash, block) in to_store.iter().zip(blocks) {
            state.blocks.put(*hash, block);
        }
        state.counters.stored_blocks += to_store.len() as u64;
        state.events.record(
            EventKind::Stored,
            to_store.clone(),
            state.backend.block_size(),
            state.backend.medium(),
        );

        let store_spec = state
            .backend
            .load_store_spec(TransferKind::Store, &to_store, &block_ids);
        Some(PrepareStoreOutput {
            to_store,
            store_spec,
            evicted: victims,
        })
    }

    fn complete_store(&self, hashes: &[BlockHash]) {
        let mut state = self.inner.lock();
        for hash in hashes {
            if let Some(block) = state.blocks.peek_mut(hash) {
                block.mark_ready();
            }
        }
    }

    fn take_events(&self) -> Vec<OffloadingEvent> {
        self.inner.lock().events.drain()
    }

    fn stats(&self) -> OffloadingStats {
        let state = self.inner.lock();
        let mut stats = OffloadingStats {
            policy: "lru",
            medium: Some(state.backend.medium()),
            cache_capacity: state.cache_capacity,
            free_blocks: state.backend.num_free_blocks(),
            t1_len: state.blocks.len(),
            ..Default::default()
        };
        state.counters.fill(&mut stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::SimulatedBackend;
    use crate::cache::block::Medium;

    fn h(n: u128) -> BlockHash {
        BlockHash::from_raw(n)
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let m = LruOffloadingManager::new(SimulatedBackend::new(Medium::Cpu, 3, 64));
        m.prepare_store(&[h(1), h(2), h(3)]).unwrap();
        m.complete_store(&[h(1), h(2), h(3)]);
        m.touch(&[h(1)]);

        let out = m.prepare_store(&[h(4)]).unwrap();
        assert_eq!(out.evicted, vec![h(2)]);
        assert_eq!(m.resident(), vec![h(3), h(1), h(4)]);
    }

    #[test]
    fn test_backpressure_when_everything_pinned() {
        let m = LruOffloadingManager::new(SimulatedBackend::new(Medium::Cpu, 1, 64));
        m.prepare_store(&[h(1)]).unwrap();
        m.complete_store(&[h(1)]);
        m.prepare_load(&[h(1)]);

        assert!(m.prepare_store(&[h(2)]).is_none());
        assert_eq!(m.stats().backpressure, 1);
        m.complete_load(&[h(1)]);
        assert!(m.prepare_store(&[h(2)]).is_some());
    }
}
