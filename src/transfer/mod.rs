//! Data movement for paged KV blocks.
//!
//! - [`storage`]: per-device, per-layer block slots
//! - [`swap`]: GPU ↔ host swaps and same-device block copies

pub mod storage;
pub mod swap;
