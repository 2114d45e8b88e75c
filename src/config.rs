//! Runtime configuration for kv-arc-offload.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file only overrides what it names.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::block::Medium;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-arc-offload", about = "Replay a synthetic workload against the KV offloading engine")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the number of replayed requests.
    #[arg(long)]
    pub requests: Option<usize>,

    /// Override the offloading policy (arc, adaptive, lru).
    #[arg(long)]
    pub policy: Option<Policy>,

    /// Emit logs as JSON.
    #[arg(long)]
    pub json_logs: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("adaptation speed bounds are inverted: min {min} > max {max}")]
    InvertedSpeedBounds { min: f64, max: f64 },

    #[error("adaptation speed {speed} is outside [{min}, {max}]")]
    SpeedOutOfBounds { speed: f64, min: f64, max: f64 },

    #[error("recent window {recent} must be shorter than the hit-rate window {window}")]
    RecentWindowTooLarge { recent: usize, window: usize },
}

/// Replacement policy of the offloading manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Arc,
    Adaptive,
    Lru,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Offloading backend and policy.
    pub offload: OffloadConfig,

    /// ARC tuning.
    pub arc: ArcConfig,

    /// Paged allocator sizing.
    pub allocator: AllocatorConfig,

    /// Synthetic workload for the replay driver.
    pub replay: ReplayConfig,
}

/// Offloaded tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub policy: Policy,

    /// Medium of the offload backend.
    pub medium: Medium,

    /// Number of blocks in the offload backend.
    pub num_blocks: usize,

    /// Size of one offloaded block in bytes.
    pub block_size_bytes: usize,

    /// Depth of the request queue in front of the offloading worker.
    pub queue_depth: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            policy: Policy::Adaptive,
            medium: Medium::Cpu,
            num_blocks: 1024,
            block_size_bytes: 2 * 1024 * 1024,
            queue_depth: 256,
        }
    }
}

/// ARC adaptation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArcConfig {
    /// Step applied to `target_t1_size` on a ghost hit.
    pub adaptation_speed: f64,

    /// Lower bound for self-tuned adaptation speed.
    pub min_adaptation_speed: f64,

    /// Upper bound for self-tuned adaptation speed.
    pub max_adaptation_speed: f64,

    /// Number of hit-rate samples kept.
    pub hit_rate_window: usize,

    /// Number of most recent samples compared against the whole window.
    pub recent_window: usize,
}

impl Default for ArcConfig {
    fn default() -> Self {
        Self {
            adaptation_speed: 1.0,
            min_adaptation_speed: 0.1,
            max_adaptation_speed: 10.0,
            hit_rate_window: 100,
            recent_window: 10,
        }
    }
}

/// Paged allocator sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Number of transformer layers (one pool per layer and device).
    pub num_layers: usize,

    /// Tokens per block.
    pub block_size_tokens: usize,

    /// Blocks per layer on the GPU.
    pub gpu_blocks: usize,

    /// Blocks per layer on the CPU.
    pub cpu_blocks: usize,

    /// Bytes per block per layer.
    pub block_bytes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            num_layers: 4,
            block_size_tokens: 16,
            gpu_blocks: 256,
            cpu_blocks: 512,
            block_bytes: 4096,
        }
    }
}

/// Synthetic workload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Number of requests to replay.
    pub requests: usize,

    /// Number of distinct shared prompt prefixes.
    pub prefix_pool: usize,

    /// Blocks in each shared prefix.
    pub prefix_blocks: usize,

    /// Unique blocks each request appends after its prefix.
    pub suffix_blocks: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            requests: 500,
            prefix_pool: 16,
            prefix_blocks: 8,
            suffix_blocks: 4,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when it is absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject sizes and bounds the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("offload.num_blocks", self.offload.num_blocks),
            ("offload.block_size_bytes", self.offload.block_size_bytes),
            ("offload.queue_depth", self.offload.queue_depth),
            ("arc.hit_rate_window", self.arc.hit_rate_window),
            ("arc.recent_window", self.arc.recent_window),
            ("allocator.num_layers", self.allocator.num_layers),
            ("allocator.block_size_tokens", self.allocator.block_size_tokens),
            ("allocator.block_bytes", self.allocator.block_bytes),
            ("replay.prefix_pool", self.replay.prefix_pool),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }

        let arc = &self.arc;
        if arc.min_adaptation_speed > arc.max_adaptation_speed {
            return Err(ConfigError::InvertedSpeedBounds {
                min: arc.min_adaptation_speed,
                max: arc.max_adaptation_speed,
            });
        }
        if !(arc.min_adaptation_speed..=arc.max_adaptation_speed).contains(&arc.adaptation_speed) {
            return Err(ConfigError::SpeedOutOfBounds {
                speed: arc.adaptation_speed,
                min: arc.min_adaptation_speed,
                max: arc.max_adaptation_speed,
            });
        }
        if arc.recent_window >= arc.hit_rate_window {
            return Err(ConfigError::RecentWindowTooLarge {
                recent: arc.recent_window,
                window: arc.hit_rate_window,
            });
        }
        Ok(())
    }

    /// Bytes held by one logical block across all layers.
    pub fn logical_block_bytes(&self) -> usize {
        self.allocator.block_bytes * self.allocator.num_layers
    }
}
