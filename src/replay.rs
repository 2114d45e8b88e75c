//! Synthetic workload driver.
//!
//! Replays a deterministic request stream against an offloading service and
//! a paged cache manager. Requests share prompt prefixes drawn from a small
//! pool with a skewed distribution, and every fifth request carries a
//! one-off prefix that is never seen again (a scan). Each request:
//!
//! 1. allocates paged blocks for its tokens, swapping the oldest active
//!    request out to the CPU pools when the GPU pools are short;
//! 2. looks up its block hashes in the offload tier and loads the hit prefix;
//! 3. stores the blocks that missed.
//!
//! At most [`MAX_ACTIVE_REQUESTS`] requests stay active; older ones retire,
//! freeing their paged blocks and offload affinity.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::adaptive::AdaptiveArcManager;
use crate::cache::backend::SimulatedBackend;
use crate::cache::block::BlockHash;
use crate::cache::manager::OffloadingStats;
use crate::cache::service::{AsyncOffloadingManager, OffloadingHandle, ServiceError};
use crate::config::ReplayConfig;
use crate::paged::allocator::Device;
use crate::paged::manager::{KvCacheError, SharedCacheManager};

pub const MAX_ACTIVE_REQUESTS: usize = 4;

/// Token id offset separating request suffixes from prefix tokens.
const SUFFIX_TOKEN_BASE: u32 = 0x8000_0000;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Cache(#[from] KvCacheError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub requests: usize,

    /// Blocks asked for across all lookups.
    pub lookup_blocks: usize,

    /// Blocks served from the offload tier.
    pub hit_blocks: usize,
    pub stored_blocks: usize,
    pub evicted_blocks: usize,

    /// `prepare_store` calls that found no room.
    pub backpressure: usize,

    /// Requests that got fewer paged blocks than they needed.
    pub partial_allocations: usize,
    pub swapped_out_blocks: usize,
    pub pressure_notifications: usize,
    pub events: usize,
    pub offload: OffloadingStats,
}

impl ReplayReport {
    pub fn hit_rate(&self) -> f64 {
        if self.lookup_blocks == 0 {
            return 0.0;
        }
        self.hit_blocks as f64 / self.lookup_blocks as f64
    }
}

/// Tokens of one request: its prefix followed by a unique suffix.
pub fn request_tokens(config: &ReplayConfig, index: usize, block_size: usize) -> Vec<u32> {
    let prefix = if index % 5 == 4 {
        config.prefix_pool + index
    } else {
        (index * index + index / 3) % config.prefix_pool
    };
    let prefix_len = config.prefix_blocks * block_size;
    let suffix_len = config.suffix_blocks * block_size;

    let mut tokens = Vec::with_capacity(prefix_len + suffix_len);
    tokens.extend((0..prefix_len).map(|j| (prefix as u32).wrapping_mul(1_000_003).wrapping_add(j as u32)));
    tokens.extend(
        (0..suffix_len).map(|j| SUFFIX_TOKEN_BASE | ((index * suffix_len + j) as u32 & !SUFFIX_TOKEN_BASE)),
    );
    tokens
}

pub struct Replay {
    config: ReplayConfig,
    offload: OffloadingHandle,
    cache: SharedCacheManager,
    affinity: Option<Arc<AdaptiveArcManager<SimulatedBackend>>>,
}

impl Replay {
    pub fn new(config: ReplayConfig, offload: OffloadingHandle, cache: SharedCacheManager) -> Self {
        Self {
            config,
            offload,
            cache,
            affinity: None,
        }
    }

    /// Register each request's hit blocks with an adaptive manager.
    pub fn with_affinity(mut self, manager: Arc<AdaptiveArcManager<SimulatedBackend>>) -> Self {
        self.affinity = Some(manager);
        self
    }

    pub async fn run(&self) -> Result<ReplayReport, ReplayError> {
        let block_size = self.cache.read().await.block_size();
        let mut active: VecDeque<String> = VecDeque::with_capacity(MAX_ACTIVE_REQUESTS + 1);
        let mut report = ReplayReport {
            requests: 0,
            lookup_blocks: 0,
            hit_blocks: 0,
            stored_blocks: 0,
            evicted_blocks: 0,
            backpressure: 0,
            partial_allocations: 0,
            swapped_out_blocks: 0,
            pressure_notifications: 0,
            events: 0,
            offload: OffloadingStats::default(),
        };

        for index in 0..self.config.requests {
            let request_id = Uuid::new_v4().to_string();
            let tokens = request_tokens(&self.config, index, block_size);
            let hashes = BlockHash::chain(&tokens, block_size);

            self.allocate(&request_id, tokens.len(), &active, &mut report).await?;
            self.offload_cycle(&request_id, &hashes, &mut report).await?;

            active.push_back(request_id);
            if active.len() > MAX_ACTIVE_REQUESTS {
                if let Some(retired) = active.pop_front() {
                    self.retire(&retired).await?;
                }
            }
            report.requests += 1;
        }
        for request_id in active.drain(..) {
            self.retire(&request_id).await?;
        }

        let (offload, events) = futures::try_join!(self.offload.stats(), self.offload.take_events())?;
        report.events = events.len();
        report.offload = offload;
        info!(
            requests = report.requests,
            hit_rate = report.hit_rate(),
            stored = report.stored_blocks,
            evicted = report.evicted_blocks,
            backpressure = report.backpressure,
            "Replay complete"
        );
        Ok(report)
    }

    async fn allocate(
        &self,
        request_id: &str,
        num_tokens: usize,
        active: &VecDeque<String>,
        report: &mut ReplayReport,
    ) -> Result<(), ReplayError> {
        let mut cache = self.cache.write().await;
        let needed = num_tokens.div_ceil(cache.block_size());
        if cache.get_num_free_blocks(Device::Gpu) < needed {
            cache.notify_memory_pressure();
            report.pressure_notifications += 1;
            if let Some(oldest) = active.front() {
                match cache.swap_out_request(oldest) {
                    Ok(moved) => report.swapped_out_blocks += moved,
                    Err(err) => warn!(%err, request_id = %oldest, "Swap out failed"),
                }
            }
        }
        let allocation = cache.allocate(request_id, num_tokens)?;
        if allocation.partial {
            report.partial_allocations += 1;
        }
        Ok(())
    }

    async fn offload_cycle(
        &self,
        request_id: &str,
        hashes: &[BlockHash],
        report: &mut ReplayReport,
    ) -> Result<(), ReplayError> {
        let hits = self.offload.lookup(hashes.to_vec()).await?;
        report.lookup_blocks += hashes.len();
        report.hit_blocks += hits;

        if hits > 0 {
            let hit = hashes[..hits].to_vec();
            if let Some(affinity) = &self.affinity {
                affinity.register_request_blocks(request_id, &hit);
            }
            self.offload.prepare_load(hit.clone()).await?;
            self.offload.touch(hit.clone()).await?;
            self.offload.complete_load(hit).await?;
        }

        match self.offload.prepare_store(hashes[hits..].to_vec()).await? {
            Some(output) => {
                report.stored_blocks += output.to_store.len();
                report.evicted_blocks += output.evicted.len();
                self.offload.complete_store(output.to_store).await?;
            }
            None => {
                report.backpressure += 1;
                debug!(request_id, blocks = hashes.len() - hits, "Store rejected");
            }
        }
        Ok(())
    }

    async fn retire(&self, request_id: &str) -> Result<(), ReplayError> {
        if let Some(affinity) = &self.affinity {
            affinity.release_request(request_id);
        }
        self.cache.write().await.free(request_id)?;
        Ok(())
    }
}
