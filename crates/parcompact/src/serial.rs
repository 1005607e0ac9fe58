//! Serial four-phase mark-compact.
//!
//! 1. Mark everything reachable from the roots.
//! 2. Walk live objects in address order and hand each one the next free
//!    address of a [`CompactPoint`] that advances through the spaces from the
//!    bottom of the old space. The forwarding address is stored in the
//!    object's mark word; marks that carry state are saved first.
//! 3. Rewrite every root and interior reference through the forwarding
//!    addresses.
//! 4. Move objects in ascending address order and restore the saved marks.
//!
//! A destination never lies above its source, so moving in address order
//! never overwrites an object that has not moved yet.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bitmap::ParMarkBitmap;
use crate::collector::GcCause;
use crate::error::SetupError;
use crate::heap::{Heap, HeapWord, SpaceId};
use crate::locker::GcLocker;
use crate::metrics::{self, CollectionKind, CompactionMetrics, PhaseTimer};
use crate::object::ObjectModel;
use crate::preserved::PreservedMarks;
use crate::roots::{NoReferenceProcessing, ReferenceProcessor, RootProvider};
use crate::start_array::{ObjectStartArray, StartArray};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_phase_end, log_phase_start, next_gc_id, trace_gc_collection, trace_phase, GcPhase,
};

/// Low mark-word bits tagging a forwarding address.
const FORWARDED_TAG: u64 = 0b11;
const FORWARDED_SHIFT: u32 = 2;

const fn encode_forwardee(addr: HeapWord) -> u64 {
    addr.to_bits() << FORWARDED_SHIFT | FORWARDED_TAG
}

#[allow(clippy::cast_possible_truncation)]
const fn decode_forwardee(mark: u64) -> Option<HeapWord> {
    if mark & FORWARDED_TAG == FORWARDED_TAG {
        Some(HeapWord::new((mark >> FORWARDED_SHIFT) as usize))
    } else {
        None
    }
}

/// Where the next live object is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactPoint {
    /// Space being filled.
    pub space: SpaceId,
    /// Next free word in that space.
    pub compaction_top: HeapWord,
}

impl CompactPoint {
    /// A point at the bottom of the old space.
    #[must_use]
    pub const fn new(heap: &Heap) -> Self {
        Self {
            space: SpaceId::Old,
            compaction_top: heap.space(SpaceId::Old).bottom(),
        }
    }

    /// Reserve `words` words, moving on to later spaces while they do not
    /// fit. `limit` bounds the search: an object is never placed above its
    /// own address.
    ///
    /// # Panics
    ///
    /// Panics if no space below `limit` has room.
    pub fn forward(&mut self, heap: &Heap, words: usize, limit: HeapWord) -> HeapWord {
        loop {
            let end = heap.space(self.space).end();
            if end.delta(self.compaction_top) >= words {
                let dest = self.compaction_top;
                assert!(dest <= limit, "forwarding {limit} upwards to {dest}");
                self.compaction_top += words;
                return dest;
            }
            let next = self
                .space
                .next()
                .unwrap_or_else(|| panic!("no space left to compact {words} words into"));
            self.space = next;
            self.compaction_top = heap.space(next).bottom();
        }
    }
}

/// Serial mark-sweep-compact collector.
///
/// # Example
///
/// ```
/// use parcompact::{GcCause, HeaderLayout, Heap, HeapLayout, MarkSweepCompact, RootSet, SpaceId};
///
/// let heap = Heap::new(HeapLayout::old_only(256), 64).unwrap();
/// let mut msc = MarkSweepCompact::new(&heap, HeaderLayout).unwrap();
///
/// let _garbage = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 10).unwrap();
/// let live = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 2).unwrap();
/// let roots = RootSet::new();
/// let idx = roots.push(live);
///
/// assert!(msc.invoke(&heap, &roots, GcCause::Explicit));
/// assert_eq!(roots.get(idx), heap.space(SpaceId::Old).bottom());
/// assert_eq!(heap.space(SpaceId::Old).used_in_words(), 4);
/// ```
pub struct MarkSweepCompact<M: ObjectModel> {
    model: M,
    bitmap: ParMarkBitmap,
    preserved: PreservedMarks,
    new_tops: [HeapWord; SpaceId::COUNT],
    start_array: Option<Arc<dyn StartArray>>,
    ref_processor: Box<dyn ReferenceProcessor>,
    gc_locker: Arc<GcLocker>,
    total_invocations: u64,
    last_metrics: CompactionMetrics,
}

impl<M: ObjectModel> MarkSweepCompact<M> {
    /// Build a collector for `heap`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Reserve`] if the mark bitmap cannot be
    /// allocated.
    pub fn new(heap: &Heap, model: M) -> Result<Self, SetupError> {
        let bitmap = ParMarkBitmap::new(heap.base(), heap.capacity_in_words())?;
        let old = heap.space(SpaceId::Old);
        let start_array: Arc<dyn StartArray> =
            Arc::new(ObjectStartArray::new(old.bottom(), old.capacity_in_words()));
        Ok(Self {
            model,
            bitmap,
            preserved: PreservedMarks::new(),
            new_tops: SpaceId::ALL.map(|id| heap.space(id).bottom()),
            start_array: Some(start_array),
            ref_processor: Box::new(NoReferenceProcessing),
            gc_locker: Arc::new(GcLocker::new()),
            total_invocations: 0,
            last_metrics: CompactionMetrics::new(),
        })
    }

    /// Use `rp` for reference processing.
    #[must_use]
    pub fn with_reference_processor(mut self, rp: Box<dyn ReferenceProcessor>) -> Self {
        self.ref_processor = rp;
        self
    }

    /// Report old-space object starts to `start_array`.
    #[must_use]
    pub fn with_start_array(mut self, start_array: Arc<dyn StartArray>) -> Self {
        self.start_array = Some(start_array);
        self
    }

    /// Share `locker` with the mutator.
    #[must_use]
    pub fn with_gc_locker(mut self, locker: Arc<GcLocker>) -> Self {
        self.gc_locker = locker;
        self
    }

    /// The GC locker consulted before each collection.
    #[must_use]
    pub const fn gc_locker(&self) -> &Arc<GcLocker> {
        &self.gc_locker
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

    /// Collect `heap` completely.
    ///
    /// Returns `false` if the collection was skipped because a critical
    /// section is active.
    ///
    /// # Panics
    ///
    /// Panics if `heap` is not the heap the collector was built for.
    pub fn invoke<R: RootProvider>(&mut self, heap: &Heap, roots: &R, cause: GcCause) -> bool {
        assert!(
            heap.base() == self.bitmap.region_start() && heap.end() == self.bitmap.region_end(),
            "collector built for a different heap"
        );
        if self.gc_locker.check_active_before_gc() {
            metrics::record_skipped();
            #[cfg(feature = "tracing")]
            tracing::debug!(?cause, "collection skipped, GC locker active");
            return false;
        }

        let start = Instant::now();
        let mut timer = PhaseTimer::new();
        let words_before = heap.used_in_words();
        self.total_invocations += 1;

        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection("serial", next_gc_id());
        #[cfg(feature = "tracing")]
        tracing::debug!(?cause, words_before, "collection_start");

        if let Some(start_array) = &self.start_array {
            start_array.reset();
        }
        self.ref_processor.setup_policy(cause == GcCause::LastDitch);

        timer.start();
        let live_words = self.mark_phase(heap, roots);
        timer.end_mark();

        timer.start();
        self.prepare_for_compaction(heap);
        timer.end_summary();

        timer.start();
        self.adjust_pointers(heap, roots);
        timer.end_adjust();

        timer.start();
        self.compact(heap);
        timer.end_compact();

        self.gc_locker.clear_needs_gc();

        let mut m = CompactionMetrics::new();
        m.set_phases(&timer);
        m.duration = start.elapsed();
        m.words_before = words_before;
        m.live_words = live_words;
        m.words_reclaimed = words_before.saturating_sub(heap.used_in_words());
        m.kind = CollectionKind::Serial;
        m.maximum_compaction = true;
        m.total_collections = usize::try_from(self.total_invocations).unwrap_or(usize::MAX);
        self.last_metrics = m;
        metrics::record_metrics(m);

        #[cfg(feature = "tracing")]
        tracing::debug!(live_words, words_reclaimed = m.words_reclaimed, "collection_end");
        true
    }

    fn mark_obj(&self, heap: &Heap, obj: HeapWord) -> bool {
        !self.bitmap.is_marked(obj) && self.bitmap.mark_obj(obj, self.model.size_of(heap, obj))
    }

    fn follow_stack(&self, heap: &Heap, stack: &mut Vec<HeapWord>) {
        while let Some(obj) = stack.pop() {
            self.model.oop_iterate(heap, obj, |slot| {
                let referent = heap.load_ref(slot);
                if !referent.is_null() && self.mark_obj(heap, referent) {
                    stack.push(referent);
                }
            });
        }
    }

    fn mark_phase<R: RootProvider>(&mut self, heap: &Heap, roots: &R) -> usize {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Mark);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Mark, heap.used_in_words());

        let mut stack = Vec::new();
        roots.process_roots(|slot| {
            let obj = HeapWord::from_bits(slot.load(Ordering::Relaxed));
            if !obj.is_null() && self.mark_obj(heap, obj) {
                stack.push(obj);
            }
        });
        self.follow_stack(heap, &mut stack);

        // The callbacks are `Fn`, so the stack is shared through a RefCell.
        let mut rp = std::mem::replace(&mut self.ref_processor, Box::new(NoReferenceProcessing));
        let stack = RefCell::new(stack);
        let this = &*self;
        let is_alive = |obj: HeapWord| this.bitmap.is_marked(obj);
        let keep_alive = |obj: HeapWord| {
            if this.mark_obj(heap, obj) {
                stack.borrow_mut().push(obj);
            }
        };
        let follow = || this.follow_stack(heap, &mut stack.borrow_mut());
        let stats = rp.process_discovered_references(&is_alive, &keep_alive, &follow);
        follow();
        rp.unlink_dead(&is_alive);
        self.ref_processor = rp;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            discovered = stats.discovered,
            cleared = stats.cleared,
            kept_alive = stats.kept_alive,
            "reference_processing"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = stats;

        let live_words = heap
            .spaces()
            .iter()
            .map(|space| self.bitmap.live_words_in_range(space.bottom(), space.top()))
            .sum();
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Mark, live_words);
        live_words
    }

    /// Compute the forwarding address of every live object and record the new
    /// top of every space.
    fn prepare_for_compaction(&mut self, heap: &Heap) {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Summary);

        let mut cp = CompactPoint::new(heap);
        self.new_tops = SpaceId::ALL.map(|id| heap.space(id).bottom());
        for space in heap.spaces() {
            let top = space.top();
            let mut obj = self.bitmap.find_obj_beg(space.bottom(), top);
            while obj < top {
                let size = self.bitmap.obj_size(obj);
                let dest = cp.forward(heap, size, obj);
                self.new_tops[cp.space.index()] = cp.compaction_top;

                let mark = self.model.mark(heap, obj);
                debug_assert!(decode_forwardee(mark).is_none(), "{obj} already forwarded");
                if self.model.must_be_preserved(mark) {
                    self.preserved.push(obj, mark);
                }
                self.model.set_mark(heap, obj, encode_forwardee(dest));
                obj = self.bitmap.find_obj_beg(obj + size, top);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            space = cp.space.name(),
            compaction_top = %cp.compaction_top,
            preserved = self.preserved.len(),
            "prepare_for_compaction"
        );
    }

    fn forwardee(&self, heap: &Heap, obj: HeapWord) -> HeapWord {
        decode_forwardee(self.model.mark(heap, obj))
            .unwrap_or_else(|| panic!("live object {obj} is not forwarded"))
    }

    fn adjust_slot(&self, heap: &Heap, slot: &AtomicU64) {
        let obj = HeapWord::from_bits(slot.load(Ordering::Relaxed));
        if !obj.is_null() {
            slot.store(self.forwardee(heap, obj).to_bits(), Ordering::Relaxed);
        }
    }

    fn adjust_pointers<R: RootProvider>(&mut self, heap: &Heap, roots: &R) {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Adjust);

        roots.process_roots(|slot| self.adjust_slot(heap, slot));
        self.ref_processor
            .adjust_slots(&mut |slot| self.adjust_slot(heap, slot));

        for space in heap.spaces() {
            let top = space.top();
            let mut obj = self.bitmap.find_obj_beg(space.bottom(), top);
            while obj < top {
                self.model
                    .oop_iterate(heap, obj, |slot| self.adjust_slot(heap, heap.word(slot)));
                obj = self.bitmap.find_obj_beg(obj + self.bitmap.obj_size(obj), top);
            }
        }

        let mut preserved = std::mem::take(&mut self.preserved);
        preserved.adjust(|obj| self.forwardee(heap, obj));
        self.preserved = preserved;
    }

    fn compact(&mut self, heap: &Heap) {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Compact);

        let prototype = self.model.prototype_mark();
        let old = heap.space(SpaceId::Old);
        let mut moved = 0usize;
        for space in heap.spaces() {
            let top = space.top();
            let mut obj = self.bitmap.find_obj_beg(space.bottom(), top);
            while obj < top {
                let size = self.bitmap.obj_size(obj);
                let dest = self.forwardee(heap, obj);
                if dest != obj {
                    heap.copy_conjoint(obj, dest, size);
                    moved += 1;
                }
                self.model.set_mark(heap, dest, prototype);
                if old.contains(dest) {
                    if let Some(start_array) = &self.start_array {
                        start_array.allocate_block(dest);
                    }
                }
                obj = self.bitmap.find_obj_beg(obj + size, top);
            }
        }
        self.preserved.restore(heap, &self.model);

        for space in heap.spaces() {
            self.bitmap.clear_range(space.bottom(), space.top());
            space.set_top(self.new_tops[space.id().index()]);
        }

        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Compact, moved);
        #[cfg(not(feature = "tracing"))]
        let _ = moved;
    }
}

impl<M: ObjectModel + std::fmt::Debug> std::fmt::Debug for MarkSweepCompact<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkSweepCompact")
            .field("model", &self.model)
            .field("total_invocations", &self.total_invocations)
            .field("has_start_array", &self.start_array.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapLayout;
    use crate::object::HeaderLayout;
    use crate::roots::RootSet;

    const R: usize = 64;

    fn heap(layout: HeapLayout) -> Heap {
        Heap::new(layout, R).unwrap()
    }

    #[test]
    fn test_forwarding_encoding() {
        let addr = HeapWord::new(4096);
        assert_eq!(decode_forwardee(encode_forwardee(addr)), Some(addr));
        assert_eq!(decode_forwardee(HeaderLayout::PROTOTYPE_MARK), None);
    }

    #[test]
    fn test_compact_point_moves_to_next_space() {
        let heap = heap(HeapLayout::old_only(2 * R).with_young(R, 0, 0));
        let mut cp = CompactPoint::new(&heap);
        let limit = heap.end();
        assert_eq!(cp.forward(&heap, 100, limit), heap.base());
        assert_eq!(cp.forward(&heap, 40, limit), heap.space(SpaceId::Eden).bottom());
        assert_eq!(cp.space, SpaceId::Eden);
        assert_eq!(cp.compaction_top, heap.space(SpaceId::Eden).bottom() + 40);
    }

    #[test]
    fn test_slides_live_objects_down() {
        let heap = heap(HeapLayout::old_only(4 * R));
        let mut msc = MarkSweepCompact::new(&heap, HeaderLayout).unwrap();
        let _dead = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 20).unwrap();
        let a = HeaderLayout::allocate(&heap, SpaceId::Old, 1, 3).unwrap();
        let _dead = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 70).unwrap();
        let b = HeaderLayout::allocate(&heap, SpaceId::Old, 1, 0).unwrap();
        HeaderLayout::set_ref(&heap, a, 0, b);
        HeaderLayout::set_ref(&heap, b, 0, a);
        HeaderLayout::set_data(&heap, a, 2, 99);

        let roots = RootSet::new();
        let idx = roots.push(b);
        assert!(msc.invoke(&heap, &roots, GcCause::AllocationFailure));

        let base = heap.base();
        let new_a = base;
        let new_b = base + 6;
        assert_eq!(roots.get(idx), new_b);
        assert_eq!(HeaderLayout::get_ref(&heap, new_a, 0), new_b);
        assert_eq!(HeaderLayout::get_ref(&heap, new_b, 0), new_a);
        assert_eq!(HeaderLayout::get_data(&heap, new_a, 2), 99);
        assert_eq!(heap.space(SpaceId::Old).top(), base + 9);
        assert_eq!(msc.last_metrics().live_words, 9);
        assert_eq!(msc.last_metrics().kind, CollectionKind::Serial);
        assert!(msc.bitmap.is_clear());
    }

    #[test]
    fn test_hash_survives_move() {
        let heap = heap(HeapLayout::old_only(2 * R));
        let mut msc = MarkSweepCompact::new(&heap, HeaderLayout).unwrap();
        let _dead = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 10).unwrap();
        let a = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 1).unwrap();
        let b = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 1).unwrap();
        HeaderLayout::set_hash(&heap, a, 0xbeef);

        let roots = RootSet::new();
        let ia = roots.push(a);
        let ib = roots.push(b);
        assert!(msc.invoke(&heap, &roots, GcCause::Explicit));

        assert_eq!(HeaderLayout::hash(&heap, roots.get(ia)), Some(0xbeef));
        assert_eq!(HeaderLayout::hash(&heap, roots.get(ib)), None);
        assert_eq!(HeaderLayout.mark(&heap, roots.get(ib)), HeaderLayout::PROTOTYPE_MARK);
    }

    #[test]
    fn test_young_objects_fill_old_then_eden() {
        let heap = heap(HeapLayout::old_only(2 * R).with_young(2 * R, 0, 0));
        let mut msc = MarkSweepCompact::new(&heap, HeaderLayout).unwrap();
        let old_obj = HeaderLayout::allocate(&heap, SpaceId::Old, 2, 98).unwrap();
        let _dead = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 18).unwrap();
        let small = HeaderLayout::allocate(&heap, SpaceId::Eden, 0, 6).unwrap();
        let large = HeaderLayout::allocate(&heap, SpaceId::Eden, 0, 38).unwrap();
        HeaderLayout::set_ref(&heap, old_obj, 0, small);
        HeaderLayout::set_ref(&heap, old_obj, 1, large);

        let roots = RootSet::new();
        roots.push(old_obj);
        assert!(msc.invoke(&heap, &roots, GcCause::AllocationFailure));

        // 102 + 8 words fit into the old space, the 40-word object does not.
        let eden_bottom = heap.space(SpaceId::Eden).bottom();
        assert_eq!(heap.space(SpaceId::Old).used_in_words(), 110);
        assert_eq!(HeaderLayout::get_ref(&heap, old_obj, 0), heap.base() + 102);
        assert_eq!(HeaderLayout::get_ref(&heap, old_obj, 1), eden_bottom);
        assert_eq!(heap.space(SpaceId::Eden).used_in_words(), 40);
    }

    #[test]
    fn test_skipped_while_locked() {
        let heap = heap(HeapLayout::old_only(R));
        let mut msc = MarkSweepCompact::new(&heap, HeaderLayout).unwrap();
        let locker = Arc::clone(msc.gc_locker());
        let guard = locker.enter();
        assert!(!msc.invoke(&heap, &RootSet::new(), GcCause::Explicit));
        assert!(locker.needs_gc());
        drop(guard);
        assert!(msc.invoke(&heap, &RootSet::new(), GcCause::Explicit));
        assert!(!locker.needs_gc());
        assert_eq!(msc.total_invocations(), 1);
    }
}
