//! Offloaded KV block caching.
//!
//! - [`block`]: block hashes, per-block status and transfer descriptors
//! - [`backend`]: storage backends handing out block ids on one medium
//! - [`manager`]: the load/store contract every policy implements
//! - [`arc`]: Adaptive Replacement Cache policy
//! - [`adaptive`]: ARC with request affinity and self-tuning speed
//! - [`lru_policy`]: plain LRU baseline
//! - [`service`]: async worker in front of a manager

pub mod adaptive;
pub mod arc;
pub mod backend;
pub mod block;
pub mod lru_policy;
pub mod manager;
pub mod service;
