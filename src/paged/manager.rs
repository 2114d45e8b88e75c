//! Paged KV cache facade.
//!
//! Composes the paged allocator, the block storage and the transfer helper,
//! and keeps a registry of memory-pressure callbacks. Pressure is reported
//! only when the caller asks for it through
//! [`KvCacheManager::notify_memory_pressure`]; allocation failures do not
//! fire callbacks on their own.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cache::block::BlockId;
use crate::config::AllocatorConfig;
use crate::paged::allocator::{
    Allocation, AllocatorError, BlockTable, Device, LogicalBlock, PagedBlockAllocator,
};
use crate::transfer::storage::{KvStorage, TransferError};
use crate::transfer::swap::{TransferHelper, TransferStats};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvCacheError {
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Snapshot handed to memory-pressure callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureEvent {
    /// Fraction of physical blocks in use.
    pub usage: f64,
    pub free_gpu_blocks: usize,
    pub free_cpu_blocks: usize,
    pub num_requests: usize,
}

pub type PressureCallback = Box<dyn Fn(&PressureEvent) + Send + Sync>;

/// Shared handle to the cache manager.
pub type SharedCacheManager = Arc<RwLock<KvCacheManager>>;

pub fn new_shared_cache_manager(config: &AllocatorConfig) -> SharedCacheManager {
    Arc::new(RwLock::new(KvCacheManager::new(config)))
}

pub struct KvCacheManager {
    allocator: PagedBlockAllocator,
    storage: KvStorage,
    transfer: TransferHelper,
    pressure_callbacks: Vec<PressureCallback>,
}

impl KvCacheManager {
    pub fn new(config: &AllocatorConfig) -> Self {
        info!(
            num_layers = config.num_layers,
            gpu_blocks = config.gpu_blocks,
            cpu_blocks = config.cpu_blocks,
            block_bytes = config.block_bytes,
            "KV cache manager initialized"
        );
        Self {
            allocator: PagedBlockAllocator::new(config),
            storage: KvStorage::new(
                config.num_layers,
                config.gpu_blocks,
                config.cpu_blocks,
                config.block_bytes,
            ),
            transfer: TransferHelper::new(),
            pressure_callbacks: Vec::new(),
        }
    }

    pub fn allocate(&mut self, request_id: &str, num_tokens: usize) -> Result<Allocation, KvCacheError> {
        Ok(self.allocator.allocate_for_request(request_id, num_tokens)?)
    }

    pub fn extend(&mut self, request_id: &str, num_tokens: usize) -> Result<Allocation, KvCacheError> {
        Ok(self.allocator.extend_allocation(request_id, num_tokens)?)
    }

    /// Release a request. Returns how many logical blocks went back to the pools.
    pub fn free(&mut self, request_id: &str) -> Result<usize, KvCacheError> {
        Ok(self.allocator.free_request(request_id)?)
    }

    /// Share `parent`'s blocks with a new request.
    pub fn fork(&mut self, parent: &str, child: &str) -> Result<(), KvCacheError> {
        Ok(self.allocator.fork(parent, child)?)
    }

    pub fn get_block_table(&self, request_id: &str) -> Option<&BlockTable> {
        self.allocator.block_table(request_id)
    }

    /// Whether a new request of `num_tokens` would get every block it needs.
    pub fn can_allocate(&self, num_tokens: usize) -> bool {
        let free = self.allocator.num_free_blocks(Device::Gpu)
            + self.allocator.num_free_blocks(Device::Cpu);
        free >= self.allocator.blocks_needed(num_tokens)
    }

    pub fn usage(&self) -> f64 {
        self.allocator.usage()
    }

    pub fn get_num_free_blocks(&self, device: Device) -> usize {
        self.allocator.num_free_blocks(device)
    }

    pub fn on_memory_pressure(&mut self, callback: PressureCallback) {
        self.pressure_callbacks.push(callback);
    }

    /// Invoke every registered pressure callback. Returns how many ran.
    pub fn notify_memory_pressure(&self) -> usize {
        let event = PressureEvent {
            usage: self.usage(),
            free_gpu_blocks: self.get_num_free_blocks(Device::Gpu),
            free_cpu_blocks: self.get_num_free_blocks(Device::Cpu),
            num_requests: self.allocator.num_requests(),
        };
        debug!(usage = event.usage, callbacks = self.pressure_callbacks.len(), "Memory pressure");
        for callback in &self.pressure_callbacks {
            callback(&event);
        }
        self.pressure_callbacks.len()
    }

    /// Move a request's GPU blocks to the CPU pools. Returns blocks moved.
    pub fn swap_out_request(&mut self, request_id: &str) -> Result<usize, KvCacheError> {
        self.swap_request(request_id, Device::Gpu, Device::Cpu)
    }

    /// Move a request's CPU blocks back to the GPU pools. Returns blocks moved.
    pub fn swap_in_request(&mut self, request_id: &str) -> Result<usize, KvCacheError> {
        self.swap_request(request_id, Device::Cpu, Device::Gpu)
    }

    fn swap_request(&mut self, request_id: &str, from: Device, to: Device) -> Result<usize, KvCacheError> {
        let table = self
            .allocator
            .block_table(request_id)
            .ok_or_else(|| AllocatorError::UnknownRequest(request_id.to_string()))?;
        let moving: Vec<(usize, LogicalBlock)> = table
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.device == from)
            .map(|(index, block)| (index, block.clone()))
            .collect();
        if moving.is_empty() {
            return Ok(0);
        }
        if self.allocator.num_free_blocks(to) < moving.len() {
            return Err(AllocatorError::OutOfBlocks {
                device: to,
                request_id: request_id.to_string(),
            }
            .into());
        }

        let mut replacements = Vec::with_capacity(moving.len());
        for _ in &moving {
            let block = self.allocator.allocate_block(to).ok_or_else(|| AllocatorError::OutOfBlocks {
                device: to,
                request_id: request_id.to_string(),
            })?;
            replacements.push(block);
        }

        // Pools on a device move in lockstep, so layer 0's id names the block in every layer.
        let pairs: Vec<(BlockId, BlockId)> = moving
            .iter()
            .zip(&replacements)
            .map(|((_, old), new)| (old.layer_blocks[0], new.layer_blocks[0]))
            .collect();
        let copied = match from {
            Device::Gpu => self.transfer.swap_out(&mut self.storage, &pairs),
            Device::Cpu => self.transfer.swap_in(&mut self.storage, &pairs),
        };
        if let Err(err) = copied {
            for block in &replacements {
                self.allocator.free_block(block);
            }
            return Err(err.into());
        }

        for (_, old) in &moving {
            self.allocator.free_block(old);
        }
        if let Some(table) = self.allocator.block_table_mut(request_id) {
            for ((index, _), new) in moving.iter().zip(replacements) {
                table.blocks[*index] = new;
            }
        }
        debug!(request_id, blocks = moving.len(), from = %from, to = %to, "Swapped request");
        Ok(moving.len())
    }

    pub fn storage(&self) -> &KvStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut KvStorage {
        &mut self.storage
    }

    pub fn transfer_stats(&self) -> &TransferStats {
        self.transfer.stats()
    }

    pub fn block_size(&self) -> usize {
        self.allocator.block_size()
    }
}
