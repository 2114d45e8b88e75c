//! Block movement between GPU and host memory.
//!
//! Swaps copy every layer of a logical block between devices; copies
//! duplicate blocks within one device (copy-on-write for forked requests).
//! Each operation validates all block ids before touching any slot, so a
//! failed call leaves storage unchanged.

use std::collections::HashSet;

use tracing::debug;

use crate::cache::block::BlockId;
use crate::paged::allocator::Device;
use crate::transfer::storage::{KvStorage, TransferError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub total_d2h_bytes: u64,
    pub total_h2d_bytes: u64,
    pub total_d2h_transfers: u64,
    pub total_h2d_transfers: u64,
    pub total_copies: u64,
}

#[derive(Debug, Default)]
pub struct TransferHelper {
    stats: TransferStats,
}

impl TransferHelper {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(
        storage: &KvStorage,
        pairs: &[(BlockId, BlockId)],
        src: Device,
        dst: Device,
    ) -> Result<(), TransferError> {
        for layer in 0..storage.num_layers() {
            for (from, to) in pairs {
                storage.check(src, layer, *from)?;
                storage.check(dst, layer, *to)?;
            }
        }
        Ok(())
    }

    fn move_blocks(
        storage: &mut KvStorage,
        pairs: &[(BlockId, BlockId)],
        src: Device,
        dst: Device,
    ) -> Result<u64, TransferError> {
        Self::validate(storage, pairs, src, dst)?;
        let mut bytes = 0u64;
        for layer in 0..storage.num_layers() {
            for (from, to) in pairs {
                bytes += storage.copy_slot(layer, (src, *from), (dst, *to))? as u64;
            }
        }
        Ok(bytes)
    }

    /// Copy `(gpu_block, cpu_block)` pairs from GPU to host, all layers.
    pub fn swap_out(
        &mut self,
        storage: &mut KvStorage,
        pairs: &[(BlockId, BlockId)],
    ) -> Result<u64, TransferError> {
        let bytes = Self::move_blocks(storage, pairs, Device::Gpu, Device::Cpu)?;
        self.stats.total_d2h_bytes += bytes;
        self.stats.total_d2h_transfers += pairs.len() as u64;
        debug!(blocks = pairs.len(), bytes, "D2H swap");
        Ok(bytes)
    }

    /// Copy `(cpu_block, gpu_block)` pairs from host to GPU, all layers.
    pub fn swap_in(
        &mut self,
        storage: &mut KvStorage,
        pairs: &[(BlockId, BlockId)],
    ) -> Result<u64, TransferError> {
        let bytes = Self::move_blocks(storage, pairs, Device::Cpu, Device::Gpu)?;
        self.stats.total_h2d_bytes += bytes;
        self.stats.total_h2d_transfers += pairs.len() as u64;
        debug!(blocks = pairs.len(), bytes, "H2D swap");
        Ok(bytes)
    }

    /// Duplicate `(src, dst)` pairs within one device, all layers.
    ///
    /// A block may not be copied onto itself, and no destination may also be
    /// a source in the same batch.
    pub fn copy_blocks(
        &mut self,
        storage: &mut KvStorage,
        device: Device,
        pairs: &[(BlockId, BlockId)],
    ) -> Result<u64, TransferError> {
        let sources: HashSet<BlockId> = pairs.iter().map(|(src, _)| *src).collect();
        if let Some((_, dst)) = pairs.iter().find(|(_, dst)| sources.contains(dst)) {
            return Err(TransferError::OverlappingCopy(*dst));
        }
        let bytes = Self::move_blocks(storage, pairs, device, device)?;
        self.stats.total_copies += pairs.len() as u64;
        Ok(bytes)
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> KvStorage {
        let mut storage = KvStorage::new(2, 4, 4, 16);
        for layer in 0..2 {
            storage
                .write(Device::Gpu, layer, 1, &[layer as u8 + 1; 16], 16, 0)
                .unwrap();
        }
        storage
    }

    #[test]
    fn test_swap_out_then_in() {
        let mut storage = storage();
        let mut helper = TransferHelper::new();

        assert_eq!(helper.swap_out(&mut storage, &[(1, 3)]).unwrap(), 32);
        assert_eq!(storage.slot(Device::Cpu, 1, 3).unwrap().data, vec![2; 16]);

        helper.swap_in(&mut storage, &[(3, 0)]).unwrap();
        assert_eq!(storage.slot(Device::Gpu, 0, 0).unwrap().data, vec![1; 16]);

        let stats = helper.stats();
        assert_eq!(stats.total_d2h_transfers, 1);
        assert_eq!(stats.total_h2d_bytes, 32);
    }

    #[test]
    fn test_invalid_swap_leaves_storage_untouched() {
        let mut storage = storage();
        let mut helper = TransferHelper::new();

        let err = helper.swap_out(&mut storage, &[(1, 0), (1, 9)]).unwrap_err();
        assert!(matches!(err, TransferError::BlockOutOfRange { block: 9, .. }));
        assert_eq!(storage.slot(Device::Cpu, 0, 0).unwrap().data, vec![0; 16]);
        assert_eq!(helper.stats(), &TransferStats::default());
    }

    #[test]
    fn test_copy_rejects_overlap() {
        let mut storage = storage();
        let mut helper = TransferHelper::new();

        assert_eq!(
            helper.copy_blocks(&mut storage, Device::Gpu, &[(1, 1)]),
            Err(TransferError::OverlappingCopy(1))
        );
        assert_eq!(
            helper.copy_blocks(&mut storage, Device::Gpu, &[(1, 2), (2, 3)]),
            Err(TransferError::OverlappingCopy(2))
        );

        helper.copy_blocks(&mut storage, Device::Gpu, &[(1, 2)]).unwrap();
        assert_eq!(storage.slot(Device::Gpu, 1, 2).unwrap().data, vec![2; 16]);
        assert_eq!(helper.stats().total_copies, 1);
    }
}
