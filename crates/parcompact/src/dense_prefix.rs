//! Dense-prefix planning.
//!
//! The dense prefix of a space is the leading part that is left where it is.
//! Regions there are already (nearly) full, so moving them would cost more
//! than the dead space it recovers. Dead space that remains in the prefix is
//! covered by filler objects instead.
//!
//! How much dead space may be left behind depends on how full the space is.
//! [`DeadWoodLimiter`] shapes that tolerance with a normal density function
//! centred on a configurable density: half-full spaces keep the most dead
//! wood, while nearly empty and nearly full spaces are compacted hard.

use std::f64::consts::PI;

use crate::config::CompactConfig;
use crate::heap::{HeapWord, MutableSpace};
use crate::summary::SummaryData;

/// Tolerated dead-space fraction as a function of space density.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadWoodLimiter {
    mean: f64,
    std_dev: f64,
    first_term: f64,
    adjustment: f64,
}

impl DeadWoodLimiter {
    /// Limiter peaking at `mean_percent` with the given standard deviation.
    #[must_use]
    pub fn new(mean_percent: u32, std_dev_percent: u32) -> Self {
        let mean = f64::from(mean_percent) / 100.0;
        let std_dev = f64::from(std_dev_percent) / 100.0;
        let first_term = 1.0 / ((2.0 * PI).sqrt() * std_dev);
        let mut limiter = Self {
            mean,
            std_dev,
            first_term,
            adjustment: 0.0,
        };
        limiter.adjustment = limiter.normal_distribution(1.0);
        limiter
    }

    /// Normal density at `density`.
    #[must_use]
    pub fn normal_distribution(&self, density: f64) -> f64 {
        let squared_term = (density - self.mean) / self.std_dev;
        self.first_term * (-0.5 * squared_term * squared_term).exp()
    }

    /// Fraction of capacity that may stay dead in a space of `density`.
    ///
    /// Shifted so that a completely full space tolerates exactly
    /// `min_percent`, and never negative.
    #[must_use]
    pub fn limit(&self, density: f64, min_percent: u32) -> f64 {
        let raw_limit = self.normal_distribution(density);
        let min = f64::from(min_percent) / 100.0;
        (raw_limit - self.adjustment + min).max(0.0)
    }
}

/// Chooses the dense prefix of each space.
#[derive(Debug, Clone)]
pub struct DensePrefixPlanner {
    limiter: DeadWoodLimiter,
    min_percent_free: u32,
    maximum_compaction_interval: u64,
    first_maximum_compaction_count: u64,
    maximum_compaction_gc_num: u64,
}

impl DensePrefixPlanner {
    /// Planner tuned by `config`.
    #[must_use]
    pub fn new(config: &CompactConfig) -> Self {
        Self {
            limiter: DeadWoodLimiter::new(
                config.dead_wood_limiter_mean,
                config.dead_wood_limiter_std_dev,
            ),
            min_percent_free: config.mark_sweep_dead_ratio,
            maximum_compaction_interval: u64::from(config.heap_maximum_compaction_interval),
            first_maximum_compaction_count: u64::from(config.heap_first_maximum_compaction_count),
            maximum_compaction_gc_num: 0,
        }
    }

    /// The limiter in use.
    #[must_use]
    pub const fn limiter(&self) -> &DeadWoodLimiter {
        &self.limiter
    }

    /// Collection number of the last maximum compaction.
    #[must_use]
    pub const fn maximum_compaction_gc_num(&self) -> u64 {
        self.maximum_compaction_gc_num
    }

    /// Pick the end of the dense prefix of `space`.
    ///
    /// `sd` must hold the space summarized into itself and `new_top` the end
    /// of that summary. `total_invocations` is the number of the current
    /// collection. The result is region aligned and lies in
    /// `[space.bottom(), space.top()]` (rounded up to a region).
    pub fn compute_dense_prefix(
        &mut self,
        sd: &SummaryData,
        space: &MutableSpace,
        new_top: HeapWord,
        total_invocations: u64,
        maximum_compaction: bool,
    ) -> HeapWord {
        let bottom = space.bottom();
        let top = space.top();
        if top == bottom {
            return bottom;
        }

        let beg_region = sd.addr_to_region_idx(bottom);
        let top_region = sd.addr_to_region_idx(sd.region_align_up(top));

        // Full regions at the start of the space are necessarily part of the
        // dense prefix.
        let full_region = first_dead_space_region(sd, beg_region, top_region);
        debug_assert!(
            full_region == top_region
                || sd.region(full_region).destination() == sd.region_to_addr(full_region),
            "no dead space allowed to the left"
        );

        // The collection number is saved whenever a maximum compaction is
        // done, so successive maximum compactions for different reasons
        // count as one.
        debug_assert!(total_invocations >= self.maximum_compaction_gc_num);
        let gcs_since_max = total_invocations - self.maximum_compaction_gc_num;
        let interval_ended = gcs_since_max > self.maximum_compaction_interval
            || total_invocations == self.first_maximum_compaction_count;
        if maximum_compaction || full_region == top_region || interval_ended {
            self.maximum_compaction_gc_num = total_invocations;
            return sd.region_to_addr(full_region);
        }

        let space_live = new_top.delta(bottom);
        let space_used = space.used_in_words();
        let space_capacity = space.capacity_in_words();

        #[allow(clippy::cast_precision_loss)]
        let density = space_live as f64 / space_capacity as f64;
        let limiter = self.limiter.limit(density, self.min_percent_free);
        let dead_wood_max = space_used - space_live;
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let dead_wood_limit = ((space_capacity as f64 * limiter) as usize).min(dead_wood_max);

        let limit_region = dead_wood_limit_region(sd, full_region, top_region, dead_wood_limit);

        // Walk left from the limit region while moving the boundary keeps
        // improving the reclaimed ratio.
        let mut best_region = limit_region;
        let mut best_ratio = reclaimed_ratio(sd, limit_region, bottom, top, new_top);
        for cur in (full_region..limit_region).rev() {
            let ratio = reclaimed_ratio(sd, cur, bottom, top, new_top);
            if ratio <= best_ratio {
                break;
            }
            best_ratio = ratio;
            best_region = cur;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            space = space.id().name(),
            density,
            dead_wood_limit,
            full_region,
            limit_region,
            best_region,
            best_ratio,
            "dense_prefix"
        );

        sd.region_to_addr(best_region)
    }
}

fn region_is_full(sd: &SummaryData, idx: usize) -> bool {
    let region = sd.region(idx);
    region.destination() == sd.region_to_addr(idx) && region.data_size() == sd.region_words()
}

/// First region in `[beg, end)` that is not full and in place, or `end`.
///
/// Once a region has dead space every region after it moves left, so the
/// predicate is monotone and a binary search applies.
#[must_use]
pub fn first_dead_space_region(sd: &SummaryData, beg: usize, end: usize) -> usize {
    let (mut left, mut right) = (beg, end);
    while left < right {
        let middle = left + (right - left) / 2;
        if region_is_full(sd, middle) {
            left = middle + 1;
        } else {
            right = middle;
        }
    }
    left
}

/// Region in `[beg, end)` whose dead words to the left first reach
/// `dead_words`.
#[must_use]
pub fn dead_wood_limit_region(sd: &SummaryData, beg: usize, end: usize, dead_words: usize) -> usize {
    let mut left = beg;
    let mut right = if end > beg { end - 1 } else { beg };
    while left < right {
        let middle = left + (right - left) / 2;
        let dest = sd.region(middle).destination();
        let dead_to_left = sd.region_to_addr(middle).delta(dest);
        if middle > left && dead_to_left > dead_words {
            right = middle - 1;
        } else if middle < right && dead_to_left < dead_words {
            left = middle + 1;
        } else {
            return middle;
        }
    }
    left
}

/// Dead words recovered by compacting from region `idx` on, relative to the
/// live words that stay put plus a penalty on the words that move.
#[must_use]
pub fn reclaimed_ratio(
    sd: &SummaryData,
    idx: usize,
    bottom: HeapWord,
    top: HeapWord,
    new_top: HeapWord,
) -> f64 {
    let destination = sd.region(idx).destination();
    let dense_prefix_live = destination.delta(bottom);
    let compacted_region_live = new_top.delta(destination);
    let compacted_region_used = top.delta(sd.region_to_addr(idx));
    let reclaimable = compacted_region_used - compacted_region_live;
    #[allow(clippy::cast_precision_loss)]
    {
        let divisor = 1.25f64.mul_add(compacted_region_live as f64, dense_prefix_live as f64);
        reclaimable as f64 / divisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::ParMarkBitmap;
    use crate::heap::{Heap, HeapLayout, SpaceId};
    use crate::split_info::SplitInfo;
    use crate::summary::SummarizeOutcome;

    const R: usize = 64;

    struct Fixture {
        heap: Heap,
        sd: SummaryData,
        bm: ParMarkBitmap,
    }

    impl Fixture {
        fn new(regions: usize) -> Self {
            let heap = Heap::new(HeapLayout::old_only(regions * R), R).unwrap();
            let sd = SummaryData::new(heap.base(), heap.capacity_in_words(), 6, 3).unwrap();
            let bm = ParMarkBitmap::new(heap.base(), heap.capacity_in_words()).unwrap();
            Self { heap, sd, bm }
        }

        fn allocate(&self, words: usize, live: bool) -> HeapWord {
            let addr = self.heap.allocate(SpaceId::Old, words).unwrap();
            if live {
                assert!(self.bm.mark_obj(addr, words));
                self.sd.add_obj(addr, words);
            }
            addr
        }

        fn quick_summary(&self) -> HeapWord {
            let old = self.heap.space(SpaceId::Old);
            let mut split = SplitInfo::default();
            match self
                .sd
                .summarize(&mut split, old.bottom(), old.top(), old.bottom(), old.end())
            {
                SummarizeOutcome::Complete { target_next } => target_next,
                SummarizeOutcome::Split { .. } => panic!("space must fit into itself"),
            }
        }

        fn planner() -> DensePrefixPlanner {
            DensePrefixPlanner::new(&CompactConfig::default())
        }
    }

    #[test]
    fn test_limiter_shape() {
        let limiter = DeadWoodLimiter::new(50, 80);
        // Minimum tolerance at full density.
        assert!((limiter.limit(1.0, 5) - 0.05).abs() < 1e-12);
        // Symmetric around the mean and peaked there.
        let lo = limiter.limit(0.3, 5);
        let hi = limiter.limit(0.7, 5);
        assert!((lo - hi).abs() < 1e-12);
        assert!(limiter.limit(0.5, 5) > lo);
        assert!(limiter.limit(1.4, 0) >= 0.0);
    }

    #[test]
    fn test_full_prefix_then_dead_region() {
        let f = Fixture::new(4);
        for _ in 0..3 {
            f.allocate(R, true);
        }
        f.allocate(R, false);
        let new_top = f.quick_summary();
        assert_eq!(new_top, f.heap.base() + 3 * R);

        let mut planner = Fixture::planner();
        let old = f.heap.space(SpaceId::Old);
        let prefix = planner.compute_dense_prefix(&f.sd, old, new_top, 1, false);
        assert_eq!(prefix, f.heap.base() + 3 * R);
    }

    #[test]
    fn test_empty_space_returns_bottom() {
        let f = Fixture::new(2);
        let mut planner = Fixture::planner();
        let old = f.heap.space(SpaceId::Old);
        let prefix = planner.compute_dense_prefix(&f.sd, old, old.bottom(), 1, false);
        assert_eq!(prefix, old.bottom());
    }

    #[test]
    fn test_maximum_compaction_stops_at_first_hole() {
        let f = Fixture::new(8);
        f.allocate(R, true);
        f.allocate(10, false);
        f.allocate(R - 10, true);
        for _ in 0..4 {
            f.allocate(R, true);
        }
        let new_top = f.quick_summary();
        let mut planner = Fixture::planner();
        let old = f.heap.space(SpaceId::Old);
        let prefix = planner.compute_dense_prefix(&f.sd, old, new_top, 1, true);
        assert_eq!(prefix, f.heap.base() + R);
        assert_eq!(planner.maximum_compaction_gc_num(), 1);
    }

    #[test]
    fn test_first_maximum_compaction_count_forces_compaction() {
        let f = Fixture::new(8);
        f.allocate(R, true);
        f.allocate(4, false);
        f.allocate(3 * R, true);
        let new_top = f.quick_summary();
        let mut planner = Fixture::planner();
        let old = f.heap.space(SpaceId::Old);
        let prefix = planner.compute_dense_prefix(&f.sd, old, new_top, 3, false);
        assert_eq!(prefix, f.heap.base() + R);
        assert_eq!(planner.maximum_compaction_gc_num(), 3);
    }

    #[test]
    fn test_clustered_live_data_prefix_bounds() {
        let f = Fixture::new(16);
        // Live data clustered in the first half with small holes, then
        // dead data up to top.
        f.allocate(2 * R, true);
        for _ in 0..6 {
            f.allocate(R - 4, true);
            f.allocate(4, false);
        }
        f.allocate(4 * R, false);
        let new_top = f.quick_summary();
        let mut planner = Fixture::planner();
        let old = f.heap.space(SpaceId::Old);
        let prefix = planner.compute_dense_prefix(&f.sd, old, new_top, 1, false);
        assert!(prefix >= f.heap.base() + 2 * R);
        assert!(prefix <= f.sd.region_align_up(old.top()));
        assert!(f.sd.is_region_aligned(prefix));
        // The result is a local optimum of the reclaimed ratio.
        let idx = f.sd.addr_to_region_idx(prefix);
        if idx > 2 {
            let here = reclaimed_ratio(&f.sd, idx, old.bottom(), old.top(), new_top);
            let left = reclaimed_ratio(&f.sd, idx - 1, old.bottom(), old.top(), new_top);
            assert!(left <= here);
        }
    }

    #[test]
    fn test_first_dead_space_region_search() {
        let f = Fixture::new(6);
        f.allocate(R, true);
        f.allocate(R, true);
        f.allocate(R, false);
        f.allocate(R, true);
        let _ = f.quick_summary();
        let beg = f.sd.addr_to_region_idx(f.heap.base());
        assert_eq!(first_dead_space_region(&f.sd, beg, beg + 4), beg + 2);
        assert_eq!(first_dead_space_region(&f.sd, beg, beg + 2), beg + 2);
    }
}
