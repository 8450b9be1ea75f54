//! Arena heap and incremental garbage collector
//!
//! Every heap object lives in a slot of a single arena and is referenced by
//! a generation-checked [`Handle`]. The collector is an incremental
//! tri-color mark and sweep:
//!
//! 1. `Idle`: wait until live bytes cross the threshold
//! 2. `Marking`: gray roots, then traverse gray objects a budget at a time
//! 3. `Atomic`: re-mark roots, re-traverse threads, purge dead interned
//!    strings, flip the current white
//! 4. `Sweeping`: free slots still holding the old white, a batch at a time
//!
//! Stores into black objects while marking go through [`Heap::barrier`],
//! which grays the stored value (a forward barrier).

mod collector;
mod heap;

pub use heap::{Handle, Heap};

use serde::{Deserialize, Serialize};

/// Collector pacing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Next cycle starts when the heap reaches `live * pause_percent / 100`
    pub pause_percent: usize,
    /// Work done per step, as a percentage of the bytes allocated since the last step
    pub step_multiplier_percent: usize,
    /// Allocation debt that triggers a step
    pub step_size_bytes: usize,
    /// Lower bound for the cycle threshold
    pub min_threshold_bytes: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            pause_percent: 200,
            step_multiplier_percent: 200,
            step_size_bytes: 8 * 1024,
            min_threshold_bytes: 64 * 1024,
        }
    }
}

/// Collector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GcPhase {
    #[default]
    Idle,
    Marking,
    Atomic,
    Sweeping,
}

/// Statistics about garbage collection
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Completed collection cycles
    pub cycles: usize,
    /// Bytes allocated over the heap's lifetime
    pub bytes_allocated: usize,
    /// Bytes currently held by live (or not yet swept) objects
    pub live_bytes: usize,
    /// Objects freed over the heap's lifetime
    pub objects_freed: usize,
    /// Objects currently in the arena
    pub objects: usize,
    /// Heap size that starts the next cycle
    pub threshold: usize,
    pub phase: GcPhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GcConfig::default();
        assert_eq!(config.pause_percent, 200);
        assert_eq!(config.step_size_bytes, 8192);
    }

    #[test]
    fn test_partial_config_from_toml() {
        let config: GcConfig = toml::from_str("pause_percent = 150").unwrap();
        assert_eq!(config.pause_percent, 150);
        assert_eq!(config.min_threshold_bytes, 64 * 1024);
    }
}
