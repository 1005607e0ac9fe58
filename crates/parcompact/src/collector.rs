//! The parallel compacting collector.
//!
//! A collection runs four stop-the-world phases in strict order:
//!
//! 1. **Mark**: trace from the roots, setting begin/end bits and
//!    accumulating per-region live words. Weak references are processed once
//!    strong marking is done.
//! 2. **Summary**: assign every region a destination. The old space keeps a
//!    dense prefix in place; young spaces compact into the old space as far as
//!    it has room, and into themselves otherwise.
//! 3. **Adjust**: rewrite every root and every reference slot of every live
//!    object to its referent's post-compaction address.
//! 4. **Compact**: move objects. Destination regions are filled in parallel,
//!    each one as soon as every region that still had to read from it is done.
//!
//! Per-collection state (mark bitmap, summary table, split records) belongs to
//! the collector and is cleared at the end of every collection.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use crate::bitmap::ParMarkBitmap;
use crate::config::CompactConfig;
use crate::dense_prefix::DensePrefixPlanner;
use crate::error::SetupError;
use crate::heap::{Heap, HeapWord, SpaceId};
use crate::locker::GcLocker;
use crate::metrics::{self, CollectionKind, CompactionMetrics, PhaseTimer};
use crate::object::ObjectModel;
use crate::roots::{NoReferenceProcessing, ReferenceProcessor, RootProvider};
use crate::split_info::SplitInfo;
use crate::start_array::{ObjectStartArray, StartArray};
use crate::summary::{SummarizeOutcome, SummaryData};
use crate::workgang::WorkGang;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, log_phase_start, next_gc_id, trace_gc_collection, trace_phase, GcPhase};

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// An allocation could not be satisfied.
    AllocationFailure,
    /// The application asked for a collection.
    Explicit,
    /// A previous collection did not free enough; soft references are
    /// cleared.
    LastDitch,
}

/// Where the collector is within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    /// No collection in progress.
    Idle,
    /// Tracing live objects.
    Marking,
    /// Computing destinations.
    Summarizing,
    /// Rewriting references.
    Adjusting,
    /// Moving objects.
    Compacting,
}

impl CollectorPhase {
    /// Whether a collection may move from `self` to `next`.
    #[must_use]
    pub const fn is_valid_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Marking)
                | (Self::Marking, Self::Summarizing)
                | (Self::Summarizing, Self::Adjusting)
                | (Self::Adjusting, Self::Compacting)
                | (Self::Compacting, Self::Idle)
        )
    }
}

/// Per-space compaction state.
pub struct SpaceInfo {
    id: SpaceId,
    pub(crate) dense_prefix: HeapWord,
    pub(crate) new_top: HeapWord,
    pub(crate) split_info: SplitInfo,
    start_array: Option<Arc<dyn StartArray>>,
}

impl SpaceInfo {
    fn new(id: SpaceId, bottom: HeapWord, start_array: Option<Arc<dyn StartArray>>) -> Self {
        Self {
            id,
            dense_prefix: bottom,
            new_top: bottom,
            split_info: SplitInfo::default(),
            start_array,
        }
    }

    /// The space described.
    #[must_use]
    pub const fn id(&self) -> SpaceId {
        self.id
    }

    /// End of the region-aligned prefix left in place by the last collection.
    #[must_use]
    pub const fn dense_prefix(&self) -> HeapWord {
        self.dense_prefix
    }

    /// Top of the space once compaction completes.
    #[must_use]
    pub const fn new_top(&self) -> HeapWord {
        self.new_top
    }

    /// Split of this space's data, if the summary had to split it.
    #[must_use]
    pub const fn split_info(&self) -> &SplitInfo {
        &self.split_info
    }

    /// Start array notified of objects ending up in this space.
    #[must_use]
    pub fn start_array(&self) -> Option<&dyn StartArray> {
        self.start_array.as_deref()
    }
}

impl std::fmt::Debug for SpaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceInfo")
            .field("id", &self.id)
            .field("dense_prefix", &self.dense_prefix)
            .field("new_top", &self.new_top)
            .field("split_info", &self.split_info)
            .field("has_start_array", &self.start_array.is_some())
            .finish()
    }
}

/// Parallel mark-sweep-compact collector over a [`Heap`].
pub struct ParallelCompact<M: ObjectModel> {
    pub(crate) heap: Heap,
    pub(crate) model: M,
    config: CompactConfig,
    pub(crate) gang: WorkGang,
    pub(crate) mark_bitmap: ParMarkBitmap,
    pub(crate) summary_data: SummaryData,
    pub(crate) space_info: [SpaceInfo; SpaceId::COUNT],
    planner: DensePrefixPlanner,
    pub(crate) ref_processor: Box<dyn ReferenceProcessor>,
    gc_locker: Arc<GcLocker>,
    phase: CollectorPhase,
    total_invocations: u64,
    last_metrics: CompactionMetrics,
}

impl<M: ObjectModel> ParallelCompact<M> {
    /// Build a collector for `heap`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if the configuration is invalid, the heap was
    /// laid out with a different region size, or the side tables cannot be
    /// allocated.
    pub fn new(heap: Heap, model: M, config: CompactConfig) -> Result<Self, SetupError> {
        config.validate()?;
        if heap.region_words() != config.region_words() {
            return Err(SetupError::RegionSizeMismatch {
                heap: heap.region_words(),
                config: config.region_words(),
            });
        }

        let mark_bitmap = ParMarkBitmap::new(heap.base(), heap.capacity_in_words())?;
        let summary_data = SummaryData::new(
            heap.base(),
            heap.capacity_in_words(),
            config.log2_region_words,
            config.log2_block_words,
        )?;

        let old = heap.space(SpaceId::Old);
        let old_start_array: Arc<dyn StartArray> =
            Arc::new(ObjectStartArray::new(old.bottom(), old.capacity_in_words()));
        let space_info = SpaceId::ALL.map(|id| {
            let start_array = (id == SpaceId::Old).then(|| Arc::clone(&old_start_array));
            SpaceInfo::new(id, heap.space(id).bottom(), start_array)
        });

        Ok(Self {
            gang: WorkGang::new(config.effective_workers()),
            planner: DensePrefixPlanner::new(&config),
            heap,
            model,
            config,
            mark_bitmap,
            summary_data,
            space_info,
            ref_processor: Box::new(NoReferenceProcessing),
            gc_locker: Arc::new(GcLocker::new()),
            phase: CollectorPhase::Idle,
            total_invocations: 0,
            last_metrics: CompactionMetrics::new(),
        })
    }

    /// Use `rp` for weak and soft references.
    #[must_use]
    pub fn with_reference_processor(mut self, rp: Box<dyn ReferenceProcessor>) -> Self {
        self.ref_processor = rp;
        self
    }

    /// Notify `start_array` of old-space object starts instead of the
    /// built-in [`ObjectStartArray`].
    #[must_use]
    pub fn with_start_array(mut self, start_array: Arc<dyn StartArray>) -> Self {
        self.space_info[SpaceId::Old.index()].start_array = Some(start_array);
        self
    }

    /// Share `locker` with other components.
    #[must_use]
    pub fn with_gc_locker(mut self, locker: Arc<GcLocker>) -> Self {
        self.gc_locker = locker;
        self
    }

    /// The collected heap.
    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The object model.
    #[must_use]
    pub const fn model(&self) -> &M {
        &self.model
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &CompactConfig {
        &self.config
    }

    /// The mark bitmap (clear between collections).
    #[must_use]
    pub const fn mark_bitmap(&self) -> &ParMarkBitmap {
        &self.mark_bitmap
    }

    /// The summary table (clear between collections).
    #[must_use]
    pub const fn summary_data(&self) -> &SummaryData {
        &self.summary_data
    }

    /// Compaction state of space `id`.
    #[must_use]
    pub const fn space_info(&self, id: SpaceId) -> &SpaceInfo {
        &self.space_info[id.index()]
    }

    /// The GC locker consulted before every collection.
    #[must_use]
    pub const fn gc_locker(&self) -> &Arc<GcLocker> {
        &self.gc_locker
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> CollectorPhase {
        self.phase
    }

    /// Collections run so far.
    #[must_use]
    pub const fn total_invocations(&self) -> u64 {
        self.total_invocations
    }

    /// Metrics of the last completed collection.
    #[must_use]
    pub const fn last_metrics(&self) -> CompactionMetrics {
        self.last_metrics
    }

    fn transition(&mut self, next: CollectorPhase) {
        assert!(
            self.phase.is_valid_transition(next),
            "invalid collector phase transition {:?} -> {next:?}",
            self.phase
        );
        self.phase = next;
    }

    /// Run a full collection, applying the soft-reference policy for `cause`.
    ///
    /// Returns `false` if the collection was skipped because a critical
    /// section is active.
    pub fn invoke<R: RootProvider>(
        &mut self,
        roots: &R,
        cause: GcCause,
        maximum_heap_compaction: bool,
    ) -> bool {
        let clear_all_soft_refs = cause == GcCause::LastDitch;
        self.invoke_no_policy(roots, cause, clear_all_soft_refs || maximum_heap_compaction)
    }

    /// Run a full collection.
    ///
    /// `maximum_heap_compaction` compacts every space completely (no dense
    /// prefix) and clears soft references. Returns `false` if the collection
    /// was skipped because a critical section is active.
    ///
    /// # Panics
    ///
    /// Panics if called while a collection is already in progress.
    pub fn invoke_no_policy<R: RootProvider>(
        &mut self,
        roots: &R,
        cause: GcCause,
        maximum_heap_compaction: bool,
    ) -> bool {
        assert_eq!(
            self.phase,
            CollectorPhase::Idle,
            "collection already in progress"
        );
        if self.gc_locker.check_active_before_gc() {
            metrics::record_skipped();
            #[cfg(feature = "tracing")]
            tracing::debug!(?cause, "collection skipped, GC locker active");
            return false;
        }

        let start = Instant::now();
        let mut timer = PhaseTimer::new();
        let words_before = self.heap.used_in_words();
        let maximum_compaction = maximum_heap_compaction
            || (self.config.use_maximum_compaction_on_system_gc && cause == GcCause::Explicit);

        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection("parallel", next_gc_id());
        #[cfg(feature = "tracing")]
        tracing::debug!(?cause, maximum_compaction, words_before, "collection_start");

        self.pre_compact();
        self.ref_processor.setup_policy(maximum_heap_compaction);

        self.transition(CollectorPhase::Marking);
        timer.start();
        let live_words = self.marking_phase(roots);
        timer.end_mark();

        self.transition(CollectorPhase::Summarizing);
        timer.start();
        self.summary_phase(maximum_compaction);
        timer.end_summary();
        let dense_prefix_words = self
            .space_info
            .iter()
            .map(|info| info.dense_prefix.delta(self.heap.space(info.id).bottom()))
            .sum();
        let splits = self
            .space_info
            .iter()
            .filter(|info| info.split_info.is_valid())
            .count();

        self.transition(CollectorPhase::Adjusting);
        timer.start();
        self.adjust_roots(roots);
        self.adjust_pointers();
        timer.end_adjust();

        self.transition(CollectorPhase::Compacting);
        timer.start();
        let regions_filled = self.compact();
        timer.end_compact();

        self.post_compact();
        self.transition(CollectorPhase::Idle);
        self.gc_locker.clear_needs_gc();

        let mut m = CompactionMetrics::new();
        m.set_phases(&timer);
        m.duration = start.elapsed();
        m.words_before = words_before;
        m.live_words = live_words;
        m.words_reclaimed = words_before.saturating_sub(self.heap.used_in_words());
        m.regions_filled = regions_filled;
        m.dense_prefix_words = dense_prefix_words;
        m.splits = splits;
        m.kind = CollectionKind::Parallel;
        m.maximum_compaction = maximum_compaction;
        m.total_collections = usize::try_from(self.total_invocations).unwrap_or(usize::MAX);
        self.last_metrics = m;
        metrics::record_metrics(m);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            live_words,
            words_reclaimed = m.words_reclaimed,
            regions_filled,
            "collection_end"
        );
        true
    }

    fn pre_compact(&mut self) {
        self.total_invocations += 1;
        if cfg!(debug_assertions) {
            self.mark_bitmap.verify_clear();
            self.summary_data.verify_clear();
            for info in &self.space_info {
                assert!(info.split_info.is_clear(), "split info not cleared");
            }
        }
        // Every object in the old space is registered again by the
        // compaction phase.
        for info in &self.space_info {
            if let Some(start_array) = info.start_array() {
                start_array.reset();
            }
        }
    }

    /// Summarize every space into itself without splitting and without a
    /// dense prefix.
    pub(crate) fn summarize_spaces_quick(&mut self) {
        for id in SpaceId::ALL {
            let space = self.heap.space(id);
            let info = &mut self.space_info[id.index()];
            let outcome = self.summary_data.summarize(
                &mut info.split_info,
                space.bottom(),
                space.top(),
                space.bottom(),
                space.end(),
            );
            match outcome {
                SummarizeOutcome::Complete { target_next } => info.new_top = target_next,
                SummarizeOutcome::Split { .. } => {
                    panic!("{} space does not fit into itself", id.name())
                }
            }
            info.dense_prefix = space.bottom();
        }
    }

    /// Compute the destination of every region.
    pub(crate) fn summary_phase(&mut self, maximum_compaction: bool) {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Summary);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Summary, self.heap.used_in_words());

        self.summarize_spaces_quick();

        // Live data that would end up in the old space if everything fits.
        let old_space_total_live: usize = SpaceId::ALL
            .iter()
            .map(|&id| self.space_info[id.index()].new_top.delta(self.heap.space(id).bottom()))
            .sum();
        let old_capacity = self.heap.space(SpaceId::Old).capacity_in_words();
        let maximum_compaction = maximum_compaction || old_space_total_live > old_capacity;

        self.summarize_space(SpaceId::Old, maximum_compaction);

        // Young spaces go to the old space while it has room. A space that
        // does not fit is split: the rest of it compacts into itself, and it
        // becomes the target for the spaces after it.
        let mut dst_id = SpaceId::Old;
        for id in [SpaceId::Eden, SpaceId::From, SpaceId::To] {
            let space = self.heap.space(id);
            if self.space_info[id.index()].new_top == space.bottom() {
                continue;
            }
            let dst_next = self.space_info[dst_id.index()].new_top;
            let dst_end = self.heap.space(dst_id).end();
            let outcome = self.summary_data.summarize(
                &mut self.space_info[id.index()].split_info,
                space.bottom(),
                space.top(),
                dst_next,
                dst_end,
            );
            match outcome {
                SummarizeOutcome::Complete { target_next } => {
                    self.space_info[dst_id.index()].new_top = target_next;
                    self.space_info[id.index()].new_top = space.bottom();
                }
                SummarizeOutcome::Split {
                    source_next,
                    target_next,
                } => {
                    self.space_info[dst_id.index()].new_top = target_next;
                    dst_id = id;
                    let info = &mut self.space_info[id.index()];
                    let rest = self.summary_data.summarize(
                        &mut info.split_info,
                        source_next,
                        space.top(),
                        space.bottom(),
                        space.end(),
                    );
                    match rest {
                        SummarizeOutcome::Complete { target_next } => info.new_top = target_next,
                        SummarizeOutcome::Split { .. } => {
                            panic!("{} space does not fit into itself", id.name())
                        }
                    }
                    debug_assert!(info.new_top <= space.top(), "usage must not grow");
                }
            }
        }

        for info in &self.space_info {
            let space = self.heap.space(info.id);
            debug_assert!(
                space.bottom() <= info.dense_prefix
                    && info.dense_prefix <= info.new_top
                    && info.new_top <= space.end(),
                "bad summary for {} space: {info:?}",
                info.id.name()
            );
        }

        #[cfg(feature = "tracing")]
        log_phase_end(
            GcPhase::Summary,
            self.space_info.iter().map(|i| i.new_top.delta(self.heap.space(i.id).bottom())).sum(),
        );
    }

    fn summarize_space(&mut self, id: SpaceId, maximum_compaction: bool) {
        let space = self.heap.space(id);
        debug_assert_eq!(self.space_info[id.index()].dense_prefix, space.bottom());
        let new_top = self.space_info[id.index()].new_top;
        if new_top == space.bottom() {
            return;
        }

        let dense_prefix_end = self.planner.compute_dense_prefix(
            &self.summary_data,
            space,
            new_top,
            self.total_invocations,
            maximum_compaction,
        );
        self.space_info[id.index()].dense_prefix = dense_prefix_end;

        // If everything is compacted, the quick summary already describes it.
        if maximum_compaction || dense_prefix_end == space.bottom() {
            return;
        }

        // Dead space crossing the boundary is filled before destinations are
        // recomputed, so no dead fragment too small to fill is left behind.
        self.fill_dense_prefix_end(id, dense_prefix_end);

        self.summary_data
            .summarize_dense_prefix(space.bottom(), dense_prefix_end);
        let info = &mut self.space_info[id.index()];
        let outcome = self.summary_data.summarize(
            &mut info.split_info,
            dense_prefix_end,
            space.top(),
            dense_prefix_end,
            space.end(),
        );
        match outcome {
            SummarizeOutcome::Complete { target_next } => info.new_top = target_next,
            SummarizeOutcome::Split { .. } => {
                panic!("{} space does not fit into itself", id.name())
            }
        }
    }

    /// Whether dead space crosses onto region `region_idx` from the left: no
    /// partial object, no object starting at the region's first word and no
    /// object ending at the last word of the previous region.
    pub(crate) fn dead_space_crosses_boundary(&self, region_idx: usize) -> bool {
        let addr = self.summary_data.region_to_addr(region_idx);
        debug_assert!(addr > self.heap.base(), "no region before the first one");
        self.summary_data.region(region_idx).partial_obj_size() == 0
            && self.mark_bitmap.is_unmarked(addr)
            && !self.mark_bitmap.is_obj_end(addr - 1)
    }

    /// Turn dead space just left of `dense_prefix_end` into a live filler
    /// object, so the dead space remaining in the prefix can always be
    /// filled.
    ///
    /// With `d` dead words before the boundary and `min` the smallest filler:
    /// at least `2 * min` dead words get a `min`-word filler at the boundary,
    /// fewer than that but at least `min` get one filler covering all of them,
    /// and fewer than `min` get a filler that extends past the boundary.
    pub(crate) fn fill_dense_prefix_end(&self, id: SpaceId, dense_prefix_end: HeapWord) {
        let space = self.heap.space(id);
        if dense_prefix_end >= space.top() {
            return;
        }
        let region_idx = self.summary_data.addr_to_region_idx(dense_prefix_end);
        if !self.dead_space_crosses_boundary(region_idx) {
            return;
        }

        let min = self.model.min_fill_size();
        let limit = 2 * min;
        let mut dead = 0;
        while dead < limit
            && dense_prefix_end.delta(space.bottom()) > dead
            && !self.mark_bitmap.is_obj_end(dense_prefix_end - (dead + 1))
        {
            dead += 1;
        }

        let (obj_beg, obj_len) = if dead >= limit {
            (dense_prefix_end - min, min)
        } else if dead >= min {
            (dense_prefix_end - dead, dead)
        } else {
            (dense_prefix_end - dead, min)
        };
        debug_assert!(
            obj_beg + obj_len <= self.mark_bitmap.find_obj_beg(dense_prefix_end, space.top()),
            "filler overlaps a live object"
        );

        self.model.fill_with_object(&self.heap, obj_beg, obj_len);
        self.mark_bitmap.mark_obj(obj_beg, obj_len);
        self.summary_data.add_obj(obj_beg, obj_len);
        if let Some(start_array) = self.space_info[id.index()].start_array() {
            start_array.allocate_block(obj_beg);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%obj_beg, obj_len, dead, "fill_dense_prefix_end");
    }

    fn post_compact(&mut self) {
        for id in SpaceId::ALL {
            self.clear_data_covering_space(id);
            // Published only after the tables are cleared, since clearing
            // uses the old top.
            self.heap
                .space(id)
                .set_top(self.space_info[id.index()].new_top);
        }
    }

    /// Clear the mark bitmap, summary data and split record of space `id`.
    ///
    /// Called with the pre-compaction top still in place: the bitmap is
    /// cleared up to the top, the summary data up to the larger of top and
    /// new top. Clearing twice is harmless.
    pub fn clear_data_covering_space(&mut self, id: SpaceId) {
        let space = self.heap.space(id);
        let info = &mut self.space_info[id.index()];
        let top = space.top();
        let max_top = top.max(info.new_top);

        self.mark_bitmap.clear_range(space.bottom(), top);
        self.summary_data.clear_range_addrs(space.bottom(), max_top);
        info.split_info.clear();
    }

    /// Visit every root slot and every slot held by the reference processor.
    pub(crate) fn for_each_root_slot<R: RootProvider>(&self, roots: &R, mut visitor: impl FnMut(&AtomicU64)) {
        roots.process_roots(&mut visitor);
        self.ref_processor.adjust_slots(&mut visitor);
    }
}

impl<M: ObjectModel + std::fmt::Debug> std::fmt::Debug for ParallelCompact<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelCompact")
            .field("heap", &self.heap)
            .field("model", &self.model)
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("total_invocations", &self.total_invocations)
            .field("space_info", &self.space_info)
            .finish_non_exhaustive()
    }
}
