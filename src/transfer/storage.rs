//! Host-side backing store for paged KV blocks.
//!
//! One slot per (device, layer, block). The GPU side is simulated in host
//! memory so swaps and copies can be exercised without a device.

use thiserror::Error;

use crate::cache::block::BlockId;
use crate::paged::allocator::Device;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("{device} block {block} out of range in layer {layer}")]
    BlockOutOfRange {
        device: Device,
        layer: usize,
        block: BlockId,
    },

    #[error("Layer {0} out of range")]
    LayerOutOfRange(usize),

    #[error("Block size mismatch: source {src} bytes, destination {dst} bytes")]
    SizeMismatch { src: usize, dst: usize },

    #[error("Block {0} is both a copy source and a copy destination")]
    OverlappingCopy(BlockId),

    #[error("Data too large: {len} bytes into a {capacity}-byte block")]
    DataTooLarge { len: usize, capacity: usize },
}

/// Contents of one physical block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSlot {
    pub data: Vec<u8>,

    /// Tokens written into the block.
    pub token_count: usize,

    /// Position of the first token in its sequence.
    pub position: usize,
}

impl BlockSlot {
    fn empty(block_bytes: usize) -> Self {
        Self {
            data: vec![0u8; block_bytes],
            token_count: 0,
            position: 0,
        }
    }
}

pub struct KvStorage {
    /// `gpu[layer][block]`.
    gpu: Vec<Vec<BlockSlot>>,

    /// `cpu[layer][block]`.
    cpu: Vec<Vec<BlockSlot>>,

    block_bytes: usize,
}

impl KvStorage {
    pub fn new(num_layers: usize, gpu_blocks: usize, cpu_blocks: usize, block_bytes: usize) -> Self {
        let layers = |blocks: usize| -> Vec<Vec<BlockSlot>> {
            (0..num_layers)
                .map(|_| (0..blocks).map(|_| BlockSlot::empty(block_bytes)).collect())
                .collect()
        };
        Self {
            gpu: layers(gpu_blocks),
            cpu: layers(cpu_blocks),
            block_bytes,
        }
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub fn num_layers(&self) -> usize {
        self.gpu.len()
    }

    fn layers(&self, device: Device) -> &Vec<Vec<BlockSlot>> {
        match device {
            Device::Gpu => &self.gpu,
            Device::Cpu => &self.cpu,
        }
    }

    fn layers_mut(&mut self, device: Device) -> &mut Vec<Vec<BlockSlot>> {
        match device {
            Device::Gpu => &mut self.gpu,
            Device::Cpu => &mut self.cpu,
        }
    }

    /// Fail unless `(device, layer, block)` names an existing slot.
    pub fn check(&self, device: Device, layer: usize, block: BlockId) -> Result<(), TransferError> {
        let blocks = self
            .layers(device)
            .get(layer)
            .ok_or(TransferError::LayerOutOfRange(layer))?;
        if (block as usize) < blocks.len() {
            Ok(())
        } else {
            Err(TransferError::BlockOutOfRange {
                device,
                layer,
                block,
            })
        }
    }

    pub fn slot(&self, device: Device, layer: usize, block: BlockId) -> Result<&BlockSlot, TransferError> {
        self.check(device, layer, block)?;
        Ok(&self.layers(device)[layer][block as usize])
    }

    pub fn slot_mut(
        &mut self,
        device: Device,
        layer: usize,
        block: BlockId,
    ) -> Result<&mut BlockSlot, TransferError> {
        self.check(device, layer, block)?;
        Ok(&mut self.layers_mut(device)[layer][block as usize])
    }

    /// Overwrite the start of a block and record its token metadata.
    pub fn write(
        &mut self,
        device: Device,
        layer: usize,
        block: BlockId,
        data: &[u8],
        token_count: usize,
        position: usize,
    ) -> Result<(), TransferError> {
        let capacity = self.block_bytes;
        if data.len() > capacity {
            return Err(TransferError::DataTooLarge {
                len: data.len(),
                capacity,
            });
        }
        let slot = self.slot_mut(device, layer, block)?;
        slot.data[..data.len()].copy_from_slice(data);
        slot.token_count = token_count;
        slot.position = position;
        Ok(())
    }

    /// Copy one slot to another, possibly across devices.
    pub fn copy_slot(
        &mut self,
        layer: usize,
        src: (Device, BlockId),
        dst: (Device, BlockId),
    ) -> Result<usize, TransferError> {
        let source = self.slot(src.0, layer, src.1)?.clone();
        let target = self.slot_mut(dst.0, layer, dst.1)?;
        if source.data.len() != target.data.len() {
            return Err(TransferError::SizeMismatch {
                src: source.data.len(),
                dst: target.data.len(),
            });
        }
        let bytes = source.data.len();
        *target = source;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_copy_across_devices() {
        let mut storage = KvStorage::new(2, 2, 2, 8);
        storage.write(Device::Gpu, 1, 0, &[7, 7, 7], 3, 32).unwrap();

        let bytes = storage.copy_slot(1, (Device::Gpu, 0), (Device::Cpu, 1)).unwrap();
        assert_eq!(bytes, 8);

        let slot = storage.slot(Device::Cpu, 1, 1).unwrap();
        assert_eq!(&slot.data[..4], &[7, 7, 7, 0]);
        assert_eq!(slot.token_count, 3);
        assert_eq!(slot.position, 32);
    }

    #[test]
    fn test_out_of_range() {
        let mut storage = KvStorage::new(1, 2, 1, 8);
        assert_eq!(
            storage.slot(Device::Cpu, 0, 1).unwrap_err(),
            TransferError::BlockOutOfRange {
                device: Device::Cpu,
                layer: 0,
                block: 1
            }
        );
        assert_eq!(
            storage.slot(Device::Gpu, 3, 0).unwrap_err(),
            TransferError::LayerOutOfRange(3)
        );
        assert!(matches!(
            storage.write(Device::Gpu, 0, 0, &[0; 9], 1, 0),
            Err(TransferError::DataTooLarge { len: 9, capacity: 8 })
        ));
    }
}
