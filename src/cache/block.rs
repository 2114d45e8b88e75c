//! Block hash, block status and transfer descriptor types.
//!
//! A block covers a fixed number of token positions. Its logical content is
//! identified by a [`BlockHash`]; the physical slot holding that content on
//! some medium is tracked by a [`BlockStatus`].

use std::fmt;
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

/// Storage medium a block lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    /// GPU VRAM (where attention runs).
    Gpu,
    /// Host RAM.
    Cpu,
    /// Local disk.
    Disk,
    /// Remote store reached through an external connector.
    Remote,
}

impl Medium {
    /// Returns the numeric level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Medium::Gpu => 0,
            Medium::Cpu => 1,
            Medium::Disk => 2,
            Medium::Remote => 3,
        }
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Medium::Gpu => write!(f, "GPU"),
            Medium::Cpu => write!(f, "CPU"),
            Medium::Disk => write!(f, "DISK"),
            Medium::Remote => write!(f, "REMOTE"),
        }
    }
}

/// Unique identifier of a physical block within one backend pool.
pub type BlockId = u64;

/// Content-derived key identifying a block's logical content.
///
/// A 128-bit xxh3 digest. Hashes are chained: the hash of block `i` of a
/// sequence covers the hash of block `i - 1`, so the same tokens under a
/// different prefix produce a different key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash(u128);

impl BlockHash {
    /// Wrap a precomputed hash value.
    pub const fn from_raw(value: u128) -> Self {
        Self(value)
    }

    /// The raw 128-bit value.
    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Hash an arbitrary byte string.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(xxh3_128(bytes))
    }

    /// Hash one block of token ids, chained on the parent block's hash.
    pub fn from_tokens(parent: Option<BlockHash>, tokens: &[u32]) -> Self {
        let mut buf = Vec::with_capacity(16 + tokens.len() * 4);
        if let Some(parent) = parent {
            buf.extend_from_slice(&parent.0.to_le_bytes());
        }
        for token in tokens {
            buf.extend_from_slice(&token.to_le_bytes());
        }
        Self::from_bytes(&buf)
    }

    /// Hashes for every full block of a token sequence, in order.
    ///
    /// A trailing partial block is not hashed: its content is still growing
    /// and cannot be shared.
    pub fn chain(tokens: &[u32], block_size: usize) -> Vec<BlockHash> {
        let mut parent = None;
        tokens
            .chunks_exact(block_size)
            .map(|chunk| {
                let hash = BlockHash::from_tokens(parent, chunk);
                parent = Some(hash);
                hash
            })
            .collect()
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({:032x})", self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Lifecycle state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    /// A store or load is in flight.
    Pending,
    /// Content is usable.
    Ready,
    /// Being reclaimed.
    Evicting,
    /// Content must be refreshed before use.
    Invalid,
}

/// Mutable record of one physical block.
///
/// Owned by whichever resident list holds its hash, or by the backend pool
/// once freed. Created only by [`Backend::allocate_blocks`].
///
/// [`Backend::allocate_blocks`]: crate::cache::backend::Backend::allocate_blocks
#[derive(Debug)]
pub struct BlockStatus {
    /// Block id within its backend pool.
    pub block_id: BlockId,

    /// Medium the block lives on.
    pub medium: Medium,

    /// Size of the block in bytes.
    pub size_bytes: usize,

    /// Importance score; blocks scoring lowest are pruned first.
    pub importance: Option<f32>,

    /// Timestamp of last access.
    pub last_access: Instant,

    /// Whether the stored bytes are compressed.
    pub compressed: bool,

    state: BlockState,
    ref_count: u32,
}

impl BlockStatus {
    /// Create a freshly allocated block in the `Pending` state.
    pub fn new(block_id: BlockId, medium: Medium, size_bytes: usize) -> Self {
        Self {
            block_id,
            medium,
            size_bytes,
            importance: None,
            last_access: Instant::now(),
            compressed: false,
            state: BlockState::Pending,
            ref_count: 0,
        }
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn is_ready(&self) -> bool {
        self.state == BlockState::Ready
    }

    /// A block may be evicted only when nobody holds it and no store is in flight.
    pub fn can_evict(&self) -> bool {
        self.ref_count == 0 && matches!(self.state, BlockState::Ready | BlockState::Invalid)
    }

    /// `Pending -> Ready`. Other states are left alone.
    pub fn mark_ready(&mut self) {
        if self.state == BlockState::Pending {
            self.state = BlockState::Ready;
        }
    }

    pub fn mark_evicting(&mut self) {
        self.state = BlockState::Evicting;
    }

    /// Force a refresh; reachable from any state.
    pub fn invalidate(&mut self) {
        self.state = BlockState::Invalid;
    }

    /// Pin the block for an in-flight load.
    pub fn acquire(&mut self) {
        self.ref_count += 1;
    }

    /// Unpin the block.
    ///
    /// # Panics
    /// Panics if the block is not pinned; that means a load was completed
    /// twice or never prepared.
    pub fn release(&mut self) {
        assert!(
            self.ref_count > 0,
            "release of block {} whose ref_count is already zero",
            self.block_id
        );
        self.ref_count -= 1;
    }

    /// Record an access.
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

/// Direction of a batch transfer, seen from the compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Backend medium -> GPU.
    Load,
    /// GPU -> backend medium.
    Store,
}

/// Immutable descriptor of a batch load or store.
///
/// Produced by a backend and handed to an external transport; the cache
/// engine never interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStoreSpec {
    pub kind: TransferKind,
    pub hashes: Vec<BlockHash>,
    pub block_ids: Vec<BlockId>,
    pub source: Medium,
    pub target: Medium,
    pub block_size: usize,
}

impl LoadStoreSpec {
    pub fn len(&self) -> usize {
        self.block_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Total bytes moved by this transfer.
    pub fn total_bytes(&self) -> usize {
        self.block_ids.len() * self.block_size
    }
}

/// What an [`OffloadingEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Stored,
    Evicted,
}

/// Audit record of blocks added to or evicted from a manager.
#[derive(Debug, Clone)]
pub struct OffloadingEvent {
    pub kind: EventKind,
    pub hashes: Vec<BlockHash>,
    pub block_size: usize,
    pub medium: Medium,
    pub timestamp: SystemTime,
}

/// Result of a successful store preparation.
#[derive(Debug, Clone)]
pub struct PrepareStoreOutput {
    /// Hashes that need storing; already-resident hashes are excluded.
    pub to_store: Vec<BlockHash>,

    /// Descriptor for writing `to_store`.
    pub store_spec: LoadStoreSpec,

    /// Hashes evicted to make room.
    pub evicted: Vec<BlockHash>,
}
