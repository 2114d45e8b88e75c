//! ARC with request affinity and self-tuning adaptation speed.
//!
//! Two additions on top of [`ArcCore`]:
//!
//! - **Affinity.** Requests register the blocks they are serving. When a
//!   victim is needed, blocks no in-flight request refers to are tried
//!   first; the plain ARC order is used only if every candidate has
//!   affinity.
//! - **Adaptation speed.** Lookup hit rates feed a rolling window. When the
//!   recent average falls clearly below the window average the ghost-list
//!   step grows (retune faster); when it rises clearly above, the step
//!   shrinks (settle down).

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::arc::{ArcContents, ArcCore};
use crate::cache::backend::Backend;
use crate::cache::block::{BlockHash, LoadStoreSpec, OffloadingEvent, PrepareStoreOutput};
use crate::cache::manager::{ImportancePruner, OffloadingManager, OffloadingStats};
use crate::config::ArcConfig;

/// Relative change between the recent and overall hit rate that triggers retuning.
const ADJUST_MARGIN: f64 = 0.1;
const SPEED_UP: f64 = 1.1;
const SLOW_DOWN: f64 = 0.9;

struct AdaptiveState<B> {
    core: ArcCore<B>,

    /// Blocks each in-flight request refers to.
    request_blocks: HashMap<String, HashSet<BlockHash>>,

    /// Inverse of `request_blocks`.
    block_requests: HashMap<BlockHash, HashSet<String>>,

    /// Most recent hit-rate samples, oldest first.
    hit_rates: VecDeque<f64>,

    samples_since_adjust: usize,
    config: ArcConfig,
}

impl<B: Backend> AdaptiveState<B> {
    fn affinity_count(&self, hash: &BlockHash) -> usize {
        self.block_requests.get(hash).map_or(0, HashSet::len)
    }

    fn record_hit_rate(&mut self, rate: f64) {
        while self.hit_rates.len() >= self.config.hit_rate_window {
            self.hit_rates.pop_front();
        }
        self.hit_rates.push_back(rate.clamp(0.0, 1.0));
        self.samples_since_adjust += 1;

        if self.samples_since_adjust >= self.config.recent_window {
            self.adjust_adaptation_speed();
        }
    }

    fn adjust_adaptation_speed(&mut self) -> f64 {
        self.samples_since_adjust = 0;
        let speed = self.core.adaptation_speed();
        let recent_window = self.config.recent_window;
        if recent_window == 0 || self.hit_rates.len() < recent_window {
            return speed;
        }

        let overall = self.hit_rates.iter().sum::<f64>() / self.hit_rates.len() as f64;
        let recent = self.hit_rates.iter().rev().take(recent_window).sum::<f64>() / recent_window as f64;
        if overall <= 0.0 {
            return speed;
        }

        let adjusted = if recent <= overall * (1.0 - ADJUST_MARGIN) {
            speed * SPEED_UP
        } else if recent >= overall * (1.0 + ADJUST_MARGIN) {
            speed * SLOW_DOWN
        } else {
            speed
        };
        let adjusted = adjusted.clamp(
            self.config.min_adaptation_speed,
            self.config.max_adaptation_speed,
        );

        if adjusted != speed {
            debug!(recent, overall, from = speed, to = adjusted, "Adjusted adaptation speed");
        }
        self.core.set_adaptation_speed(adjusted);
        adjusted
    }
}

/// ARC manager biased against evicting blocks that in-flight requests use.
pub struct AdaptiveArcManager<B> {
    inner: Mutex<AdaptiveState<B>>,
}

impl<B: Backend> AdaptiveArcManager<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, ArcConfig::default())
    }

    /// Window sizes are normalized so that the rolling window is bounded and
    /// the recent span is strictly shorter than it.
    pub fn with_config(backend: B, mut config: ArcConfig) -> Self {
        config.hit_rate_window = config.hit_rate_window.max(2);
        config.recent_window = config.recent_window.clamp(1, config.hit_rate_window - 1);
        let speed = config
            .adaptation_speed
            .clamp(config.min_adaptation_speed, config.max_adaptation_speed);
        Self {
            inner: Mutex::new(AdaptiveState {
                core: ArcCore::new(backend, speed),
                request_blocks: HashMap::new(),
                block_requests: HashMap::new(),
                hit_rates: VecDeque::with_capacity(config.hit_rate_window),
                samples_since_adjust: 0,
                config,
            }),
        }
    }

    /// Record that `request_id` is serving the given blocks.
    pub fn register_request_blocks(&self, request_id: &str, hashes: &[BlockHash]) {
        let mut state = self.inner.lock();
        let state = &mut *state;
        let owned = state.request_blocks.entry(request_id.to_string()).or_default();
        for hash in hashes {
            if owned.insert(*hash) {
                state
                    .block_requests
                    .entry(*hash)
                    .or_default()
                    .insert(request_id.to_string());
            }
        }
    }

    /// Drop every affinity held by `request_id`. Returns how many blocks it held.
    pub fn release_request(&self, request_id: &str) -> usize {
        let mut state = self.inner.lock();
        let Some(hashes) = state.request_blocks.remove(request_id) else {
            return 0;
        };
        for hash in &hashes {
            if let Some(requests) = state.block_requests.get_mut(hash) {
                requests.remove(request_id);
                if requests.is_empty() {
                    state.block_requests.remove(hash);
                }
            }
        }
        hashes.len()
    }

    /// Number of in-flight requests referring to `hash`.
    pub fn affinity_count(&self, hash: &BlockHash) -> usize {
        self.inner.lock().affinity_count(hash)
    }

    /// Add a hit-rate sample; retunes every `recent_window` samples.
    pub fn record_hit_rate(&self, rate: f64) {
        self.inner.lock().record_hit_rate(rate);
    }

    /// Retune the adaptation speed now. Returns the resulting speed.
    pub fn adjust_adaptation_speed(&self) -> f64 {
        self.inner.lock().adjust_adaptation_speed()
    }

    pub fn adaptation_speed(&self) -> f64 {
        self.inner.lock().core.adaptation_speed()
    }

    pub fn set_importance_pruner(&self, pruner: Option<Box<dyn ImportancePruner>>) {
        self.inner.lock().core.set_importance_pruner(pruner);
    }

    pub fn update_block_importance(&self, hash: &BlockHash, hidden_states: &[f32]) {
        self.inner.lock().core.update_block_importance(hash, hidden_states);
    }

    pub fn clear(&self) -> usize {
        self.inner.lock().core.clear()
    }

    pub fn invalidate(&self, hashes: &[BlockHash]) -> usize {
        self.inner.lock().core.invalidate(hashes)
    }

    pub fn contents(&self) -> ArcContents {
        self.inner.lock().core.contents()
    }
}

impl<B: Backend> OffloadingManager for AdaptiveArcManager<B> {
    fn lookup(&self, hashes: &[BlockHash]) -> usize {
        let mut state = self.inner.lock();
        let hits = state.core.lookup(hashes);
        if !hashes.is_empty() {
            state.record_hit_rate(hits as f64 / hashes.len() as f64);
        }
        hits
    }

    fn prepare_load(&self, hashes: &[BlockHash]) -> LoadStoreSpec {
        self.inner.lock().core.prepare_load(hashes)
    }

    fn touch(&self, hashes: &[BlockHash]) {
        self.inner.lock().core.touch(hashes)
    }

    fn complete_load(&self, hashes: &[BlockHash]) {
        self.inner.lock().core.complete_load(hashes)
    }

    fn prepare_store(&self, hashes: &[BlockHash]) -> Option<PrepareStoreOutput> {
        let mut state = self.inner.lock();
        let state = &mut *state;
        let affinity = &state.block_requests;
        let unreferenced: &dyn Fn(&BlockHash) -> bool = &|hash| !affinity.contains_key(hash);
        state.core.prepare_store_with(hashes, Some(unreferenced))
    }

    fn complete_store(&self, hashes: &[BlockHash]) {
        self.inner.lock().core.complete_store(hashes)
    }

    fn take_events(&self) -> Vec<OffloadingEvent> {
        self.inner.lock().core.take_events()
    }

    fn stats(&self) -> OffloadingStats {
        self.inner.lock().core.stats("adaptive-arc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::SimulatedBackend;
    use crate::cache::block::Medium;

    fn h(n: u128) -> BlockHash {
        BlockHash::from_raw(n)
    }

    fn manager(capacity: usize) -> AdaptiveArcManager<SimulatedBackend> {
        AdaptiveArcManager::new(SimulatedBackend::new(Medium::Cpu, capacity, 64))
    }

    #[test]
    fn test_affinity_maps_stay_inverse() {
        let m = manager(4);
        m.register_request_blocks("a", &[h(1), h(2)]);
        m.register_request_blocks("b", &[h(2)]);
        m.register_request_blocks("b", &[h(2)]);

        assert_eq!(m.affinity_count(&h(1)), 1);
        assert_eq!(m.affinity_count(&h(2)), 2);

        assert_eq!(m.release_request("a"), 2);
        assert_eq!(m.affinity_count(&h(1)), 0);
        assert_eq!(m.affinity_count(&h(2)), 1);
        assert_eq!(m.release_request("a"), 0);
    }

    #[test]
    fn test_falls_back_when_all_candidates_referenced() {
        let m = manager(2);
        m.prepare_store(&[h(1), h(2)]).unwrap();
        m.complete_store(&[h(1), h(2)]);
        m.register_request_blocks("r", &[h(1), h(2)]);

        let out = m.prepare_store(&[h(3)]).unwrap();
        assert_eq!(out.evicted, vec![h(1)]);
    }

    #[test]
    fn test_speed_grows_when_recent_hit_rate_drops() {
        let m = manager(4);
        for _ in 0..90 {
            m.record_hit_rate(0.8);
        }
        let before = m.adaptation_speed();
        for _ in 0..10 {
            m.record_hit_rate(0.1);
        }
        assert!((m.adaptation_speed() - before * 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_speed_shrinks_when_recent_hit_rate_improves() {
        let m = manager(4);
        for _ in 0..90 {
            m.record_hit_rate(0.2);
        }
        let before = m.adaptation_speed();
        for _ in 0..10 {
            m.record_hit_rate(0.9);
        }
        assert!((m.adaptation_speed() - before * 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_speed_is_clamped() {
        let config = ArcConfig {
            adaptation_speed: 1.0,
            min_adaptation_speed: 0.5,
            max_adaptation_speed: 1.05,
            ..ArcConfig::default()
        };
        let m = AdaptiveArcManager::with_config(SimulatedBackend::new(Medium::Cpu, 4, 64), config);
        for _ in 0..50 {
            m.record_hit_rate(0.9);
        }
        for _ in 0..50 {
            m.record_hit_rate(0.0);
        }
        assert_eq!(m.adaptation_speed(), 1.05);
    }

    #[test]
    fn test_zero_window_stays_bounded() {
        let config = ArcConfig {
            hit_rate_window: 0,
            recent_window: 0,
            ..ArcConfig::default()
        };
        let m = AdaptiveArcManager::with_config(SimulatedBackend::new(Medium::Cpu, 4, 64), config);
        for i in 0..500 {
            m.record_hit_rate((i % 3) as f64 / 2.0);
        }
        assert_eq!(m.inner.lock().hit_rates.len(), 2);
        let speed = m.adaptation_speed();
        assert!((0.1..=10.0).contains(&speed));
    }

    #[test]
    fn test_oversized_recent_window_still_retunes() {
        let config = ArcConfig {
            hit_rate_window: 5,
            recent_window: 50,
            ..ArcConfig::default()
        };
        let m = AdaptiveArcManager::with_config(SimulatedBackend::new(Medium::Cpu, 4, 64), config);
        for _ in 0..5 {
            m.record_hit_rate(0.9);
        }
        assert_eq!(m.adaptation_speed(), 1.0);
        for _ in 0..3 {
            m.record_hit_rate(0.0);
        }
        assert!((m.adaptation_speed() - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_feeds_hit_rate_window() {
        let m = manager(4);
        m.prepare_store(&[h(1)]).unwrap();
        m.complete_store(&[h(1)]);
        for _ in 0..10 {
            m.lookup(&[h(1), h(2)]);
        }
        assert_eq!(m.inner.lock().hit_rates.len(), 10);
        m.lookup(&[]);
        assert_eq!(m.inner.lock().hit_rates.len(), 10);
    }
}
