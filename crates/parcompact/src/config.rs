//! Collector configuration.

use std::num::NonZeroUsize;

use crate::error::SetupError;

/// Tuning knobs of the parallel compacting collector.
///
/// Percentages are whole numbers (`50` means one half), matching how the
/// limiter constants are usually quoted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactConfig {
    /// Log2 of the region size in words.
    pub log2_region_words: u32,
    /// Log2 of the block size in words.
    pub log2_block_words: u32,
    /// Worker threads used by parallel phases. 0 means available parallelism.
    pub parallel_gc_threads: usize,
    /// Density (percent) at which the dead-wood limiter peaks.
    pub dead_wood_limiter_mean: u32,
    /// Standard deviation (percent) of the dead-wood limiter.
    pub dead_wood_limiter_std_dev: u32,
    /// Dead space (percent of capacity) always tolerated in a dense prefix.
    pub mark_sweep_dead_ratio: u32,
    /// Collections between forced maximum compactions.
    pub heap_maximum_compaction_interval: u32,
    /// The collection number at which the first maximum compaction is forced.
    pub heap_first_maximum_compaction_count: u32,
    /// Whether an explicit collection request compacts everything.
    pub use_maximum_compaction_on_system_gc: bool,
    /// Dense-prefix update tasks per worker.
    pub dense_prefix_update_stripes: usize,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            log2_region_words: 16,
            log2_block_words: 7,
            parallel_gc_threads: 0,
            dead_wood_limiter_mean: 50,
            dead_wood_limiter_std_dev: 80,
            mark_sweep_dead_ratio: 5,
            heap_maximum_compaction_interval: 20,
            heap_first_maximum_compaction_count: 3,
            use_maximum_compaction_on_system_gc: true,
            dense_prefix_update_stripes: 1,
        }
    }
}

impl CompactConfig {
    /// Configuration with the given worker count.
    #[must_use]
    pub fn new(parallel_gc_threads: usize) -> Self {
        Self {
            parallel_gc_threads,
            ..Default::default()
        }
    }

    /// Words per region.
    #[must_use]
    pub const fn region_words(&self) -> usize {
        1 << self.log2_region_words
    }

    /// Words per block.
    #[must_use]
    pub const fn block_words(&self) -> usize {
        1 << self.log2_block_words
    }

    /// Number of workers parallel phases actually use.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.parallel_gc_threads == 0 {
            std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
        } else {
            self.parallel_gc_threads
        }
    }

    /// Whether parallel phases run on more than one thread.
    #[must_use]
    pub fn use_parallel(&self) -> bool {
        self.effective_workers() > 1
    }

    /// Set the region and block sizes.
    #[must_use]
    pub const fn with_region_size(mut self, log2_region_words: u32, log2_block_words: u32) -> Self {
        self.log2_region_words = log2_region_words;
        self.log2_block_words = log2_block_words;
        self
    }

    /// Set the number of worker threads.
    pub const fn set_parallel_gc_threads(&mut self, workers: usize) {
        self.parallel_gc_threads = workers;
    }

    /// Set the dead-wood limiter shape.
    pub const fn set_dead_wood_limiter(&mut self, mean: u32, std_dev: u32) {
        self.dead_wood_limiter_mean = mean;
        self.dead_wood_limiter_std_dev = std_dev;
    }

    /// Set the tolerated dead ratio.
    pub const fn set_mark_sweep_dead_ratio(&mut self, percent: u32) {
        self.mark_sweep_dead_ratio = percent;
    }

    /// Set the maximum-compaction cadence.
    pub const fn set_maximum_compaction(&mut self, interval: u32, first_count: u32) {
        self.heap_maximum_compaction_interval = interval;
        self.heap_first_maximum_compaction_count = first_count;
    }

    /// Enable or disable maximum compaction on explicit requests.
    pub const fn set_use_maximum_compaction_on_system_gc(&mut self, enabled: bool) {
        self.use_maximum_compaction_on_system_gc = enabled;
    }

    /// Set how many dense-prefix update tasks each worker gets.
    pub const fn set_dense_prefix_update_stripes(&mut self, stripes: usize) {
        self.dense_prefix_update_stripes = stripes;
    }

    /// Check the configuration for inconsistent values.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.log2_region_words == 0 || self.log2_region_words > 30 {
            return Err(SetupError::InvalidConfig(format!(
                "log2_region_words {} out of range 1..=30",
                self.log2_region_words
            )));
        }
        if self.log2_block_words > self.log2_region_words {
            return Err(SetupError::InvalidConfig(format!(
                "block size 2^{} exceeds region size 2^{}",
                self.log2_block_words, self.log2_region_words
            )));
        }
        if self.dead_wood_limiter_mean > 100 {
            return Err(SetupError::InvalidConfig(format!(
                "dead_wood_limiter_mean {} exceeds 100",
                self.dead_wood_limiter_mean
            )));
        }
        if self.dead_wood_limiter_std_dev == 0 || self.dead_wood_limiter_std_dev > 100 {
            return Err(SetupError::InvalidConfig(format!(
                "dead_wood_limiter_std_dev {} out of range 1..=100",
                self.dead_wood_limiter_std_dev
            )));
        }
        if self.mark_sweep_dead_ratio > 100 {
            return Err(SetupError::InvalidConfig(format!(
                "mark_sweep_dead_ratio {} exceeds 100",
                self.mark_sweep_dead_ratio
            )));
        }
        if self.dense_prefix_update_stripes == 0 {
            return Err(SetupError::InvalidConfig(
                "dense_prefix_update_stripes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
