//! Paged block allocator for per-request KV cache.
//!
//! Each (layer, device) pair owns a pool of fixed-size blocks managed by a
//! free list with O(1) alloc/free. A request's logical block takes one
//! physical block from every layer's pool on the same device, so layer pools
//! on a device always move in lockstep.
//!
//! Physical blocks carry a holder count: forking a request shares its
//! blocks, and a block returns to its pool only when the last holder frees it.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::block::BlockId;
use crate::config::AllocatorConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Request {0} already has an allocation")]
    RequestExists(String),

    #[error("Unknown request {0}")]
    UnknownRequest(String),

    #[error("No free {device} block for request {request_id}")]
    OutOfBlocks { device: Device, request_id: String },
}

/// Device a paged block lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Gpu,
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Gpu => write!(f, "GPU"),
            Device::Cpu => write!(f, "CPU"),
        }
    }
}

/// One physical block per layer, all on the same device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalBlock {
    pub device: Device,

    /// `layer_blocks[layer]` is the physical block in that layer's pool.
    pub layer_blocks: Vec<BlockId>,
}

/// Blocks held by one request, in token order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    pub request_id: String,

    pub blocks: Vec<LogicalBlock>,

    /// Tokens stored so far.
    pub num_tokens: usize,

    /// Tokens per block.
    pub block_size: usize,
}

impl BlockTable {
    fn new(request_id: &str, block_size: usize) -> Self {
        Self {
            request_id: request_id.to_string(),
            blocks: Vec::new(),
            num_tokens: 0,
            block_size,
        }
    }

    /// Tokens the current blocks can hold.
    pub fn capacity_tokens(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    /// Logical block covering a token position.
    pub fn block_for_token(&self, token_pos: usize) -> Option<&LogicalBlock> {
        if token_pos >= self.num_tokens {
            return None;
        }
        self.blocks.get(token_pos / self.block_size)
    }

    /// Physical block ids of one layer, in token order.
    pub fn layer_block_ids(&self, layer: usize) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter_map(|block| block.layer_blocks.get(layer).copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Outcome of growing a request's footprint.
///
/// `partial` is set when memory ran out before `requested` blocks were
/// obtained; the blocks that were obtained stay allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub new_blocks: Vec<LogicalBlock>,
    pub requested: usize,
    pub partial: bool,
}

impl Allocation {
    pub fn allocated(&self) -> usize {
        self.new_blocks.len()
    }
}

/// Free list for one (layer, device) pool.
#[derive(Debug)]
struct BlockPool {
    /// Free block ids.
    free_list: VecDeque<BlockId>,

    /// `holders[id]` is the number of block tables referring to the block.
    holders: Vec<u32>,
}

impl BlockPool {
    fn new(num_blocks: usize) -> Self {
        Self {
            free_list: (0..num_blocks as BlockId).collect(),
            holders: vec![0; num_blocks],
        }
    }

    fn allocate(&mut self) -> Option<BlockId> {
        let id = self.free_list.pop_front()?;
        self.holders[id as usize] = 1;
        Some(id)
    }

    fn retain(&mut self, id: BlockId) {
        self.holders[id as usize] += 1;
    }

    /// Drop one holder. Returns true when the block went back to the free list.
    fn release(&mut self, id: BlockId) -> bool {
        let holders = &mut self.holders[id as usize];
        assert!(*holders > 0, "release of free block {id}");
        *holders -= 1;
        if *holders == 0 {
            self.free_list.push_back(id);
            true
        } else {
            false
        }
    }

    fn num_blocks(&self) -> usize {
        self.holders.len()
    }
}

/// Per-(layer, device) paged allocator.
pub struct PagedBlockAllocator {
    pools: HashMap<(usize, Device), BlockPool>,
    tables: HashMap<String, BlockTable>,
    num_layers: usize,
    block_size: usize,
}

impl PagedBlockAllocator {
    pub fn new(config: &AllocatorConfig) -> Self {
        let mut pools = HashMap::with_capacity(config.num_layers * 2);
        for layer in 0..config.num_layers {
            pools.insert((layer, Device::Gpu), BlockPool::new(config.gpu_blocks));
            pools.insert((layer, Device::Cpu), BlockPool::new(config.cpu_blocks));
        }
        Self {
            pools,
            tables: HashMap::new(),
            num_layers: config.num_layers,
            block_size: config.block_size_tokens,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// `ceil(num_tokens / block_size)`.
    pub fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Logical blocks that can still be allocated on `device`.
    pub fn num_free_blocks(&self, device: Device) -> usize {
        (0..self.num_layers)
            .filter_map(|layer| self.pools.get(&(layer, device)))
            .map(|pool| pool.free_list.len())
            .min()
            .unwrap_or(0)
    }

    /// Logical blocks on `device`, free or not.
    pub fn total_blocks(&self, device: Device) -> usize {
        self.pools
            .get(&(0, device))
            .map_or(0, BlockPool::num_blocks)
    }

    /// Fraction of physical blocks in use across every pool.
    pub fn usage(&self) -> f64 {
        let (used, total) = self.pools.values().fold((0, 0), |(used, total), pool| {
            (
                used + pool.num_blocks() - pool.free_list.len(),
                total + pool.num_blocks(),
            )
        });
        if total == 0 {
            return 0.0;
        }
        used as f64 / total as f64
    }

    /// Take one logical block on `device`, or nothing if any layer is full.
    pub fn allocate_block(&mut self, device: Device) -> Option<LogicalBlock> {
        if self.num_free_blocks(device) == 0 {
            return None;
        }
        let mut layer_blocks = Vec::with_capacity(self.num_layers);
        for layer in 0..self.num_layers {
            let pool = self.pools.get_mut(&(layer, device))?;
            layer_blocks.push(pool.allocate()?);
        }
        Some(LogicalBlock {
            device,
            layer_blocks,
        })
    }

    fn allocate_gpu_first(&mut self) -> Option<LogicalBlock> {
        self.allocate_block(Device::Gpu)
            .or_else(|| self.allocate_block(Device::Cpu))
    }

    /// Drop one holder of every layer block. Returns true when the blocks
    /// went back to their pools.
    pub fn free_block(&mut self, block: &LogicalBlock) -> bool {
        let mut returned = false;
        for (layer, id) in block.layer_blocks.iter().enumerate() {
            if let Some(pool) = self.pools.get_mut(&(layer, block.device)) {
                returned |= pool.release(*id);
            }
        }
        returned
    }

    fn grow(&mut self, request_id: &str, count: usize) -> Allocation {
        let mut new_blocks = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_gpu_first() {
                Some(block) => new_blocks.push(block),
                None => break,
            }
        }
        let partial = new_blocks.len() < count;
        if partial {
            warn!(
                request_id,
                requested = count,
                allocated = new_blocks.len(),
                "Out of KV blocks, partial allocation"
            );
        }
        if let Some(table) = self.tables.get_mut(request_id) {
            table.blocks.extend(new_blocks.iter().cloned());
        }
        Allocation {
            new_blocks,
            requested: count,
            partial,
        }
    }

    /// Allocate blocks for a new request holding `num_tokens` tokens.
    ///
    /// Blocks come from the GPU pools first, falling back to the CPU pools
    /// per block. Running out of both yields a partial allocation.
    pub fn allocate_for_request(
        &mut self,
        request_id: &str,
        num_tokens: usize,
    ) -> Result<Allocation, AllocatorError> {
        if self.tables.contains_key(request_id) {
            return Err(AllocatorError::RequestExists(request_id.to_string()));
        }
        self.tables
            .insert(request_id.to_string(), BlockTable::new(request_id, self.block_size));

        let needed = self.blocks_needed(num_tokens);
        let allocation = self.grow(request_id, needed);
        if let Some(table) = self.tables.get_mut(request_id) {
            table.num_tokens = num_tokens.min(table.capacity_tokens());
        }
        debug!(
            request_id,
            num_tokens,
            blocks = allocation.allocated(),
            "Allocated request"
        );
        Ok(allocation)
    }

    /// Grow a request to hold `num_tokens` tokens in total.
    ///
    /// Allocates only when the current blocks cannot hold them.
    pub fn extend_allocation(
        &mut self,
        request_id: &str,
        num_tokens: usize,
    ) -> Result<Allocation, AllocatorError> {
        let table = self
            .tables
            .get(request_id)
            .ok_or_else(|| AllocatorError::UnknownRequest(request_id.to_string()))?;
        let missing = self.blocks_needed(num_tokens).saturating_sub(table.len());

        let allocation = self.grow(request_id, missing);
        if let Some(table) = self.tables.get_mut(request_id) {
            table.num_tokens = table.num_tokens.max(num_tokens.min(table.capacity_tokens()));
        }
        Ok(allocation)
    }

    /// Share every block of `parent` with a new request `child`.
    pub fn fork(&mut self, parent: &str, child: &str) -> Result<(), AllocatorError> {
        if self.tables.contains_key(child) {
            return Err(AllocatorError::RequestExists(child.to_string()));
        }
        let table = self
            .tables
            .get(parent)
            .ok_or_else(|| AllocatorError::UnknownRequest(parent.to_string()))?;

        let mut forked = table.clone();
        forked.request_id = child.to_string();
        for block in &forked.blocks {
            for (layer, id) in block.layer_blocks.iter().enumerate() {
                if let Some(pool) = self.pools.get_mut(&(layer, block.device)) {
                    pool.retain(*id);
                }
            }
        }
        self.tables.insert(child.to_string(), forked);
        Ok(())
    }

    /// Release every block of a request. Returns how many logical blocks
    /// went back to their pools.
    pub fn free_request(&mut self, request_id: &str) -> Result<usize, AllocatorError> {
        let table = self
            .tables
            .remove(request_id)
            .ok_or_else(|| AllocatorError::UnknownRequest(request_id.to_string()))?;
        let returned = table
            .blocks
            .iter()
            .filter(|block| self.free_block(block))
            .count();
        debug!(request_id, blocks = table.len(), returned, "Freed request");
        Ok(returned)
    }

    pub fn block_table(&self, request_id: &str) -> Option<&BlockTable> {
        self.tables.get(request_id)
    }

    pub(crate) fn block_table_mut(&mut self, request_id: &str) -> Option<&mut BlockTable> {
        self.tables.get_mut(request_id)
    }

    /// Number of holders of a logical block's first-layer block.
    pub fn holders(&self, block: &LogicalBlock) -> u32 {
        block
            .layer_blocks
            .first()
            .and_then(|id| {
                self.pools
                    .get(&(0, block.device))
                    .map(|pool| pool.holders[*id as usize])
            })
            .unwrap_or(0)
    }

    pub fn num_requests(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(gpu_blocks: usize, cpu_blocks: usize) -> PagedBlockAllocator {
        PagedBlockAllocator::new(&AllocatorConfig {
            num_layers: 2,
            block_size_tokens: 16,
            gpu_blocks,
            cpu_blocks,
            block_bytes: 64,
        })
    }

    #[test]
    fn test_allocate_rounds_up() {
        let mut alloc = allocator(8, 0);
        let allocation = alloc.allocate_for_request("a", 33).unwrap();
        assert_eq!(allocation.allocated(), 3);
        assert!(!allocation.partial);

        let table = alloc.block_table("a").unwrap();
        assert_eq!(table.num_tokens, 33);
        assert_eq!(table.blocks[0].layer_blocks.len(), 2);
        assert_eq!(alloc.num_free_blocks(Device::Gpu), 5);
    }

    #[test]
    fn test_falls_back_to_cpu_then_partial() {
        let mut alloc = allocator(2, 1);
        let allocation = alloc.allocate_for_request("a", 16 * 4).unwrap();
        assert_eq!(allocation.requested, 4);
        assert_eq!(allocation.allocated(), 3);
        assert!(allocation.partial);

        let devices: Vec<_> = allocation.new_blocks.iter().map(|b| b.device).collect();
        assert_eq!(devices, vec![Device::Gpu, Device::Gpu, Device::Cpu]);
        assert_eq!(alloc.block_table("a").unwrap().num_tokens, 48);
    }

    #[test]
    fn test_extend_only_when_needed() {
        let mut alloc = allocator(8, 0);
        alloc.allocate_for_request("a", 10).unwrap();

        let grown = alloc.extend_allocation("a", 16).unwrap();
        assert_eq!(grown.allocated(), 0);
        assert_eq!(alloc.block_table("a").unwrap().num_tokens, 16);

        let grown = alloc.extend_allocation("a", 17).unwrap();
        assert_eq!(grown.allocated(), 1);
        assert_eq!(alloc.block_table("a").unwrap().len(), 2);
    }

    #[test]
    fn test_forked_blocks_return_after_last_holder() {
        let mut alloc = allocator(4, 0);
        alloc.allocate_for_request("parent", 32).unwrap();
        alloc.fork("parent", "child").unwrap();

        let block = alloc.block_table("child").unwrap().blocks[0].clone();
        assert_eq!(alloc.holders(&block), 2);

        assert_eq!(alloc.free_request("parent").unwrap(), 0);
        assert_eq!(alloc.num_free_blocks(Device::Gpu), 2);
        assert_eq!(alloc.free_request("child").unwrap(), 2);
        assert_eq!(alloc.num_free_blocks(Device::Gpu), 4);
    }

    #[test]
    fn test_duplicate_and_unknown_requests() {
        let mut alloc = allocator(4, 0);
        alloc.allocate_for_request("a", 1).unwrap();
        assert_eq!(
            alloc.allocate_for_request("a", 1),
            Err(AllocatorError::RequestExists("a".to_string()))
        );
        assert_eq!(
            alloc.extend_allocation("b", 1),
            Err(AllocatorError::UnknownRequest("b".to_string()))
        );
    }

    #[test]
    fn test_usage() {
        let mut alloc = allocator(4, 4);
        assert_eq!(alloc.usage(), 0.0);
        alloc.allocate_for_request("a", 32).unwrap();
        assert!((alloc.usage() - 0.25).abs() < 1e-12);
    }
}
