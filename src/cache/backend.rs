//! Storage backends for offloaded blocks.
//!
//! A backend owns the physical block pool of one medium. Managers ask it for
//! blocks, return blocks to it, and have it describe transfers; they never
//! touch the bytes themselves.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::debug;

use crate::cache::block::{BlockHash, BlockId, BlockStatus, LoadStoreSpec, Medium, TransferKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Out of {medium} blocks: requested {requested}, {available} free")]
    OutOfBlocks {
        medium: Medium,
        requested: usize,
        available: usize,
    },
}

/// A block pool on one medium.
pub trait Backend: Send {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Medium this backend stores blocks on.
    fn medium(&self) -> Medium;

    /// Number of blocks that can be allocated right now.
    fn num_free_blocks(&self) -> usize;

    /// Allocate exactly one block per hash.
    ///
    /// Allocation is all-or-nothing: on error no block has been taken from
    /// the pool.
    fn allocate_blocks(&mut self, hashes: &[BlockHash]) -> Result<Vec<BlockStatus>, BackendError>;

    /// Return a block to the pool.
    fn free(&mut self, block: BlockStatus);

    /// Describe a batch transfer of the given blocks.
    fn load_store_spec(
        &self,
        kind: TransferKind,
        hashes: &[BlockHash],
        block_ids: &[BlockId],
    ) -> LoadStoreSpec {
        let (source, target) = match kind {
            TransferKind::Load => (self.medium(), Medium::Gpu),
            TransferKind::Store => (Medium::Gpu, self.medium()),
        };
        LoadStoreSpec {
            kind,
            hashes: hashes.to_vec(),
            block_ids: block_ids.to_vec(),
            source,
            target,
            block_size: self.block_size(),
        }
    }
}

/// In-memory backend with a fixed number of blocks.
///
/// Models any medium: block ids are handed out from a free list, no bytes
/// are kept. Used by the replay driver and tests, and as the accounting
/// layer under real transports.
#[derive(Debug)]
pub struct SimulatedBackend {
    medium: Medium,

    /// Block size in bytes.
    block_size: usize,

    /// Free block ids, allocated from the front.
    free_list: VecDeque<BlockId>,

    /// `in_use[id]` is set while the block is handed out.
    in_use: Vec<bool>,
}

impl SimulatedBackend {
    pub fn new(medium: Medium, num_blocks: usize, block_size: usize) -> Self {
        Self {
            medium,
            block_size,
            free_list: (0..num_blocks as BlockId).collect(),
            in_use: vec![false; num_blocks],
        }
    }

    /// Total number of blocks in the pool.
    pub fn num_blocks(&self) -> usize {
        self.in_use.len()
    }
}

impl Backend for SimulatedBackend {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn medium(&self) -> Medium {
        self.medium
    }

    fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    fn allocate_blocks(&mut self, hashes: &[BlockHash]) -> Result<Vec<BlockStatus>, BackendError> {
        if hashes.len() > self.free_list.len() {
            return Err(BackendError::OutOfBlocks {
                medium: self.medium,
                requested: hashes.len(),
                available: self.free_list.len(),
            });
        }

        let blocks: Vec<BlockStatus> = self
            .free_list
            .drain(..hashes.len())
            .map(|id| BlockStatus::new(id, self.medium, self.block_size))
            .collect();
        for block in &blocks {
            self.in_use[block.block_id as usize] = true;
        }

        debug!(
            medium = %self.medium,
            count = blocks.len(),
            free = self.free_list.len(),
            "Allocated blocks"
        );
        Ok(blocks)
    }

    fn free(&mut self, block: BlockStatus) {
        let id = block.block_id as usize;
        assert!(
            id < self.in_use.len(),
            "block {id} does not belong to this {} pool",
            self.medium
        );
        assert!(self.in_use[id], "double free of {} block {id}", self.medium);

        self.in_use[id] = false;
        self.free_list.push_back(block.block_id);
    }
}
