//! kv-arc-offload: KV-cache block allocation and ARC-driven offloading.
//!
//! Two halves:
//!   - [`cache`]: offloading managers deciding which content-addressed
//!     blocks stay on an offload medium (ARC, adaptive ARC, LRU)
//!   - [`paged`]: per-request paged allocation over GPU and CPU pools,
//!     with [`transfer`] moving block contents between them

pub mod cache;
pub mod config;
pub mod paged;
pub mod replay;
pub mod transfer;
