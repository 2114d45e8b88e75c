//! Paged per-request KV cache.
//!
//! - [`allocator`]: per-(layer, device) block pools and block tables
//! - [`manager`]: facade combining allocation, swaps and pressure callbacks

pub mod allocator;
pub mod manager;
