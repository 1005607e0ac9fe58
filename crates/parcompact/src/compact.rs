//! Parallel compaction.
//!
//! Objects move region by region. A destination region may only be filled
//! once every other destination that reads from it has finished, which is
//! what a region's destination count tracks: it starts at the number of other
//! regions its data goes to and drops as each of them completes. Regions
//! whose count is zero at the start are handed out to the workers up front;
//! the rest become ready during compaction and are pushed by whichever worker
//! decremented their count to zero.
//!
//! Pointers were already adjusted, so a move is a plain word copy. The only
//! bookkeeping left is registering object starts with the old space's start
//! array, which for an object whose header lands in a different destination
//! region than its tail is deferred until all regions are filled.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::bitmap::{IterationStatus, ParMarkBitmap, ParMarkBitmapClosure};
use crate::collector::ParallelCompact;
use crate::heap::{Heap, HeapWord, SpaceId};
use crate::manager::CompactionManager;
use crate::object::ObjectModel;
use crate::start_array::StartArray;
use crate::workgang::TaskTerminator;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, log_phase_start, trace_phase, GcPhase};

/// Copies live objects from a source range into one destination region.
pub struct MoveAndUpdateClosure<'a> {
    heap: &'a Heap,
    bitmap: &'a ParMarkBitmap,
    start_array: Option<&'a dyn StartArray>,
    source: HeapWord,
    destination: HeapWord,
    words_remaining: usize,
}

impl<'a> MoveAndUpdateClosure<'a> {
    /// Closure that fills `words` words at `destination`.
    #[must_use]
    pub fn new(
        heap: &'a Heap,
        bitmap: &'a ParMarkBitmap,
        start_array: Option<&'a dyn StartArray>,
        destination: HeapWord,
        words: usize,
    ) -> Self {
        Self {
            heap,
            bitmap,
            start_array,
            source: HeapWord::NULL,
            destination,
            words_remaining: words,
        }
    }

    /// Next word to copy.
    #[must_use]
    pub const fn source(&self) -> HeapWord {
        self.source
    }

    /// Where the next word goes.
    #[must_use]
    pub const fn destination(&self) -> HeapWord {
        self.destination
    }

    /// Words still to copy into the destination region.
    #[must_use]
    pub const fn words_remaining(&self) -> usize {
        self.words_remaining
    }

    /// Whether the destination region is full.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.words_remaining == 0
    }

    fn update_state(&mut self, words: usize) {
        debug_assert!(words <= self.words_remaining);
        self.words_remaining -= words;
        self.source += words;
        self.destination += words;
    }

    fn copy(&self, words: usize) {
        if self.source != self.destination {
            self.heap.copy_conjoint(self.source, self.destination, words);
        }
    }

    /// Copy the rest of the object `source` points into, or as much of it as
    /// fits.
    pub fn copy_partial_obj(&mut self) {
        let mut words = self.words_remaining;
        let range_end = (self.source + words).min(self.bitmap.region_end());
        let end_addr = self.bitmap.find_obj_end(self.source, range_end);
        if end_addr < range_end {
            words = end_addr.delta(self.source) + 1;
        }
        self.copy(words);
        self.update_state(words);
    }

    /// Copy from `source` until the destination region is full.
    pub fn copy_until_full(&mut self) -> IterationStatus {
        let words = self.words_remaining;
        self.copy(words);
        self.update_state(words);
        IterationStatus::Full
    }
}

impl ParMarkBitmapClosure for MoveAndUpdateClosure<'_> {
    fn do_addr(&mut self, addr: HeapWord, words: usize) -> IterationStatus {
        debug_assert_eq!(self.bitmap.obj_size(addr), words, "bad object size");
        self.source = addr;
        if words > self.words_remaining {
            return IterationStatus::WouldOverflow;
        }
        // Registered even if the object does not move.
        if let Some(start_array) = self.start_array {
            start_array.allocate_block(self.destination);
        }
        self.copy(words);
        self.update_state(words);
        if self.is_full() {
            IterationStatus::Full
        } else {
            IterationStatus::Incomplete
        }
    }

    fn set_source(&mut self, addr: HeapWord) {
        self.source = addr;
    }
}

impl std::fmt::Debug for MoveAndUpdateClosure<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveAndUpdateClosure")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("words_remaining", &self.words_remaining)
            .finish_non_exhaustive()
    }
}

/// A stripe of dense-prefix regions `[beg_region, end_region)` of one space.
#[derive(Debug, Clone, Copy)]
struct DensePrefixTask {
    space: SpaceId,
    beg_region: usize,
    end_region: usize,
}

impl<M: ObjectModel> ParallelCompact<M> {
    fn space_id(&self, addr: HeapWord) -> SpaceId {
        self.heap
            .space_containing(addr)
            .unwrap_or_else(|| panic!("address {addr} outside the heap"))
    }

    /// Move every object to its destination. Returns the number of regions
    /// filled.
    pub(crate) fn compact(&self) -> usize {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Compact);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Compact, self.heap.used_in_words());

        let (managers, steal) = CompactionManager::create(self.gang.active_workers());
        self.enqueue_region_draining_tasks(&managers);
        let dense_prefix_tasks = self.enqueue_dense_prefix_tasks(managers.len());

        let filled = AtomicUsize::new(0);
        let terminator = TaskTerminator::new(managers.len());
        self.gang.run_with(managers, |_, cm| loop {
            while let Some(region_idx) = cm.pop_region() {
                self.fill_region(&cm, region_idx);
                filled.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(task) = dense_prefix_tasks.pop() {
                self.update_and_deadwood_in_dense_prefix(task.space, task.beg_region, task.end_region);
                continue;
            }
            if let Some(region_idx) = cm.steal_region(&steal) {
                self.fill_region(&cm, region_idx);
                filled.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if terminator.offer_termination(|| {
                steal.has_region_work() || !dense_prefix_tasks.is_empty()
            }) {
                break;
            }
        });

        for id in SpaceId::ALL {
            self.update_deferred_objects(id);
        }
        if cfg!(debug_assertions) {
            for id in SpaceId::ALL {
                self.verify_complete(id);
            }
        }

        let filled = filled.into_inner();
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Compact, filled);
        filled
    }

    /// Claim every region that can be filled right away and deal them out to
    /// the workers, highest address first so each worker pops them in
    /// ascending order.
    fn enqueue_region_draining_tasks(&self, managers: &[CompactionManager]) {
        let sd = &self.summary_data;
        let mut which = 0;
        let mut fillable = 0usize;
        for id in SpaceId::ALL.into_iter().rev() {
            let info = &self.space_info[id.index()];
            let beg_region = sd.addr_to_region_idx(info.dense_prefix);
            let end_region = sd.addr_to_region_idx(sd.region_align_up(info.new_top));
            for cur in (beg_region..end_region).rev() {
                if sd.region(cur).claim_unsafe() {
                    managers[which].push_region(cur);
                    which = (which + 1) % managers.len();
                    fillable += 1;
                }
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(fillable, "enqueue_region_draining_tasks");
        #[cfg(not(feature = "tracing"))]
        let _ = fillable;
    }

    /// Split each dense prefix into stripes of whole regions.
    fn enqueue_dense_prefix_tasks(&self, workers: usize) -> SegQueue<DensePrefixTask> {
        let tasks = SegQueue::new();
        let sd = &self.summary_data;
        let task_count = workers * self.config().dense_prefix_update_stripes;
        for info in &self.space_info {
            let space = self.heap.space(info.id());
            let beg = sd.addr_to_region_idx(space.bottom());
            let end = sd.addr_to_region_idx(info.dense_prefix);
            if beg == end {
                continue;
            }
            let stripe = (end - beg).div_ceil(task_count).max(1);
            let mut cur = beg;
            while cur < end {
                let next = (cur + stripe).min(end);
                tasks.push(DensePrefixTask {
                    space: info.id(),
                    beg_region: cur,
                    end_region: next,
                });
                cur = next;
            }
        }
        tasks
    }

    /// Register the live objects of dense-prefix regions
    /// `[beg_region, end_region)` with the start array and turn the dead
    /// space between them into filler objects. The regions are then
    /// complete.
    pub(crate) fn update_and_deadwood_in_dense_prefix(
        &self,
        space_id: SpaceId,
        beg_region: usize,
        end_region: usize,
    ) {
        let sd = &self.summary_data;
        let bitmap = &self.mark_bitmap;
        let info = &self.space_info[space_id.index()];
        let space = self.heap.space(space_id);
        let dense_prefix_end = info.dense_prefix;
        let end_addr = sd.region_to_addr(end_region);
        debug_assert!(end_addr <= dense_prefix_end, "not in the dense prefix");

        for idx in beg_region..end_region {
            let claimed = sd.region(idx).claim();
            debug_assert!(claimed, "dense prefix region {idx} already claimed");
        }

        // An object or dead run crossing onto the first region belongs to
        // the stripe on the left.
        let mut addr = sd.region_to_addr(beg_region);
        if addr != space.bottom() {
            if sd.region(beg_region).partial_obj_size() != 0 {
                addr = sd.partial_obj_end(beg_region);
            } else if self.dead_space_crosses_boundary(beg_region) {
                addr = bitmap.find_obj_beg(addr, end_addr);
            }
        }

        let start_array = info.start_array();
        while addr < end_addr {
            if bitmap.is_marked(addr) {
                if let Some(start_array) = start_array {
                    start_array.allocate_block(addr);
                }
                addr += bitmap.obj_size(addr);
            } else {
                let next = bitmap.find_obj_beg(addr + 1, dense_prefix_end);
                self.fill_with_objects(start_array, addr, next.delta(addr));
                addr = next;
            }
        }

        for idx in beg_region..end_region {
            sd.region(idx).set_completed();
        }
    }

    fn fill_with_objects(&self, start_array: Option<&dyn StartArray>, addr: HeapWord, words: usize) {
        debug_assert!(
            words >= self.model.min_fill_size(),
            "dead space of {words} words at {addr} cannot be filled"
        );
        self.model.fill_with_object(&self.heap, addr, words);
        if let Some(start_array) = start_array {
            start_array.allocate_block(addr);
        }
    }

    /// Register objects whose header was copied into a region other than the
    /// one that completed them.
    pub(crate) fn update_deferred_objects(&self, id: SpaceId) {
        let info = &self.space_info[id.index()];
        let Some(start_array) = info.start_array() else {
            return;
        };
        let sd = &self.summary_data;
        let beg_region = sd.addr_to_region_idx(info.dense_prefix);
        let end_region = sd.addr_to_region_idx(sd.region_align_up(info.new_top));
        for idx in beg_region..end_region {
            let addr = sd.region(idx).deferred_obj_addr();
            if !addr.is_null() {
                start_array.allocate_block(addr);
            }
        }
    }

    /// Assert that every region below the new top is complete and every
    /// region between the new top and the old top has no readers left.
    ///
    /// # Panics
    ///
    /// Panics on the first region in the wrong state.
    pub(crate) fn verify_complete(&self, id: SpaceId) {
        let sd = &self.summary_data;
        let info = &self.space_info[id.index()];
        let space = self.heap.space(id);
        let beg_region = sd.addr_to_region_idx(space.bottom());
        let new_top_region = sd.addr_to_region_idx(sd.region_align_up(info.new_top));
        let old_top_region = sd.addr_to_region_idx(sd.region_align_up(space.top()));
        for idx in beg_region..new_top_region {
            assert!(
                sd.region(idx).completed(),
                "{} space region {idx} not completed",
                id.name()
            );
        }
        for idx in new_top_region..old_top_region.max(new_top_region) {
            assert!(
                sd.region(idx).available(),
                "{} space region {idx} still has readers",
                id.name()
            );
        }
    }

    /// Address of the first word copied into the destination region at
    /// `dest_addr` from source region `src_region_idx`.
    pub(crate) fn first_src_addr(&self, dest_addr: HeapWord, src_space_id: SpaceId, src_region_idx: usize) -> HeapWord {
        let sd = &self.summary_data;
        debug_assert!(sd.is_region_aligned(dest_addr), "not aligned");

        let split_info = &self.space_info[src_space_id.index()].split_info;
        if split_info.dest_region_addr() == dest_addr {
            // The partial object ending at the split point holds the first
            // word copied to dest_addr.
            return split_info.first_src_addr();
        }

        let bitmap = &self.mark_bitmap;
        let src_region = sd.region(src_region_idx);
        let partial_obj_size = src_region.partial_obj_size();
        let src_region_destination = src_region.destination();
        debug_assert!(dest_addr >= src_region_destination, "wrong source region");
        debug_assert!(src_region.data_size() > 0, "source region cannot be empty");

        let src_region_beg = sd.region_to_addr(src_region_idx);
        let src_region_end = src_region_beg + sd.region_words();

        let mut addr = src_region_beg;
        if dest_addr == src_region_destination {
            // The first live word of the source region.
            if partial_obj_size == 0 {
                addr = bitmap.find_obj_beg(addr, src_region_end);
                debug_assert!(addr < src_region_end, "no object starts in the source region");
            }
            return addr;
        }

        // Some live data of the source region went to earlier destinations.
        let mut words_to_skip = dest_addr.delta(src_region_destination);
        debug_assert!(src_region.data_size() > words_to_skip, "wrong source region");

        if partial_obj_size >= words_to_skip {
            addr += words_to_skip;
            if partial_obj_size == words_to_skip {
                addr = bitmap.find_obj_beg(addr, src_region_end);
                debug_assert!(addr < src_region_end, "wrong source region");
            }
            return addr;
        }

        if partial_obj_size != 0 {
            words_to_skip -= partial_obj_size;
            addr += partial_obj_size;
        }

        let addr = self.skip_live_words(addr, src_region_end, words_to_skip);
        debug_assert!(addr < src_region_end, "wrong source region");
        addr
    }

    /// The address `count` live words past `beg`, counting only objects that
    /// start in `[beg, end)`. Landing just past an object yields the start of
    /// the next one.
    pub(crate) fn skip_live_words(&self, beg: HeapWord, end: HeapWord, count: usize) -> HeapWord {
        debug_assert!(count > 0);
        let bitmap = &self.mark_bitmap;
        let search_end = bitmap.region_end();
        let mut to_skip = count;
        let mut cur_beg = beg;
        loop {
            cur_beg = bitmap.find_obj_beg(cur_beg, end);
            debug_assert!(cur_beg < end, "ran out of objects to skip");
            let cur_end = bitmap.find_obj_end(cur_beg, search_end);
            let obj_words = cur_end.delta(cur_beg) + 1;
            if obj_words > to_skip {
                return cur_beg + to_skip;
            }
            to_skip -= obj_words;
            cur_beg = cur_end + 1;
            if to_skip == 0 {
                break;
            }
        }
        let next = bitmap.find_obj_beg(cur_beg, end);
        debug_assert!(next < end, "not in range");
        next
    }

    /// Note that a destination region finished reading source regions from
    /// `beg_region` up to the one containing `end_addr - 1`. Regions whose
    /// count drops to zero and that are themselves destinations are claimed
    /// and pushed.
    fn decrement_destination_counts(
        &self,
        cm: &CompactionManager,
        src_space_id: SpaceId,
        beg_region: usize,
        end_addr: HeapWord,
    ) {
        let sd = &self.summary_data;
        let new_top = self.space_info[src_space_id.index()].new_top;
        let enqueue_end = sd.addr_to_region_idx(sd.region_align_up(new_top));
        let end_region = sd.addr_to_region_idx(sd.region_align_up(end_addr));
        for cur in beg_region..end_region {
            let region = sd.region(cur);
            debug_assert!(region.data_size() > 0, "region {cur} must have live data");
            region.decrement_destination_count();
            if cur < enqueue_end && region.available() && region.claim() {
                cm.push_region(cur);
            }
        }
    }

    /// Advance to the next source region holding live data, possibly in a
    /// later space. Updates `src_space_id`, `src_space_top` and the closure's
    /// source.
    fn next_src_region(
        &self,
        closure: &mut MoveAndUpdateClosure<'_>,
        src_space_id: &mut SpaceId,
        src_space_top: &mut HeapWord,
        end_addr: HeapWord,
    ) -> usize {
        let sd = &self.summary_data;

        // Skip empty regions up to the top of the current space.
        let mut src_region = sd.addr_to_region_idx(sd.region_align_up(end_addr));
        let top_region = sd.addr_to_region_idx(sd.region_align_up(*src_space_top));
        while src_region < top_region && sd.region(src_region).data_size() == 0 {
            src_region += 1;
        }
        if src_region < top_region {
            let src_region_addr = sd.region_to_addr(src_region);
            if src_region_addr > closure.source() {
                closure.set_source(src_region_addr);
            }
            return src_region;
        }

        // Switch to the next space that does not compact into itself.
        let destination = closure.destination();
        let mut next_space = src_space_id.next();
        while let Some(id) = next_space {
            let space = self.heap.space(id);
            let bottom = space.bottom();
            let bottom_region = sd.addr_to_region_idx(bottom);
            if space.top() > bottom && sd.region(bottom_region).destination() != bottom {
                let top_region = sd.addr_to_region_idx(sd.region_align_up(space.top()));
                for idx in bottom_region..top_region {
                    let region = sd.region(idx);
                    if region.live_obj_size() > 0 {
                        debug_assert_eq!(
                            region.destination(),
                            destination,
                            "first live object in the space must match the destination"
                        );
                        debug_assert_eq!(region.partial_obj_size(), 0, "a space cannot begin with a partial object");
                        *src_space_id = id;
                        *src_space_top = space.top();
                        closure.set_source(sd.region_to_addr(idx));
                        return idx;
                    }
                    debug_assert_eq!(region.data_size(), 0);
                }
            }
            next_space = id.next();
        }
        panic!("no source region found for destination {destination}");
    }

    /// Fill destination region `region_idx` from its source regions.
    ///
    /// # Panics
    ///
    /// Panics if the region still has readers or has no source region.
    pub(crate) fn fill_region(&self, cm: &CompactionManager, region_idx: usize) {
        let sd = &self.summary_data;
        let bitmap = &self.mark_bitmap;
        let region = sd.region(region_idx);
        debug_assert_eq!(region.destination_count(), 0, "region {region_idx} still has readers");

        let dest_addr = sd.region_to_addr(region_idx);
        let dest_space_id = self.space_id(dest_addr);
        let dest_info = &self.space_info[dest_space_id.index()];
        let new_top = dest_info.new_top;
        debug_assert!(dest_addr < new_top);
        let words = new_top.delta(dest_addr).min(sd.region_words());

        let mut src_region_idx = region
            .source_region()
            .unwrap_or_else(|| panic!("region {region_idx} has no source region"));
        let mut src_space_id = self.space_id(sd.region_to_addr(src_region_idx));
        let mut src_space_top = self.heap.space(src_space_id).top();

        let mut closure =
            MoveAndUpdateClosure::new(&self.heap, bitmap, dest_info.start_array(), dest_addr, words);
        closure.set_source(self.first_src_addr(dest_addr, src_space_id, src_region_idx));

        // A region copied into itself does not count itself as a destination.
        if src_region_idx == region_idx {
            src_region_idx += 1;
        }

        if bitmap.is_unmarked(closure.source()) {
            // The first source word is inside an object; its header went to
            // an earlier destination.
            let old_src_addr = closure.source();
            closure.copy_partial_obj();
            if closure.is_full() {
                self.decrement_destination_counts(cm, src_space_id, src_region_idx, closure.source());
                region.set_deferred_obj_addr(HeapWord::NULL);
                region.set_completed();
                return;
            }

            let end_addr = sd.region_align_down(closure.source());
            if sd.region_align_down(old_src_addr) != end_addr {
                // The partial object spanned more than one source region.
                self.decrement_destination_counts(cm, src_space_id, src_region_idx, end_addr);
                src_region_idx =
                    self.next_src_region(&mut closure, &mut src_space_id, &mut src_space_top, end_addr);
            }
        }

        loop {
            let cur_addr = closure.source();
            let end_addr = sd.region_align_up(cur_addr + 1).min(src_space_top);
            let mut status = bitmap.iterate(&mut closure, cur_addr, end_addr);

            if status == IterationStatus::Incomplete {
                // The last object that starts in the source region ends
                // beyond it.
                let obj_beg = closure.source();
                let range_end = (obj_beg + closure.words_remaining()).min(src_space_top);
                let obj_end = bitmap.find_obj_end(obj_beg, range_end);
                if obj_end < range_end {
                    status = closure.do_addr(obj_beg, obj_end.delta(obj_beg) + 1);
                    debug_assert_ne!(status, IterationStatus::WouldOverflow);
                } else {
                    debug_assert!(range_end < src_space_top, "object cannot cross a space boundary");
                    status = IterationStatus::WouldOverflow;
                }
            }

            match status {
                IterationStatus::WouldOverflow => {
                    // The object's header lands here but its tail does not fit.
                    region.set_deferred_obj_addr(closure.destination());
                    closure.copy_until_full();
                    self.decrement_destination_counts(cm, src_space_id, src_region_idx, closure.source());
                    region.set_completed();
                    return;
                }
                IterationStatus::Full => {
                    self.decrement_destination_counts(cm, src_space_id, src_region_idx, closure.source());
                    region.set_deferred_obj_addr(HeapWord::NULL);
                    region.set_completed();
                    return;
                }
                IterationStatus::Complete | IterationStatus::Incomplete => {}
            }

            self.decrement_destination_counts(cm, src_space_id, src_region_idx, end_addr);
            src_region_idx =
                self.next_src_region(&mut closure, &mut src_space_id, &mut src_space_top, end_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{HeapLayout, SpaceId};
    use crate::object::HeaderLayout;

    #[test]
    fn test_closure_copies_and_reports_full() {
        let heap = Heap::new(HeapLayout::old_only(256), 64).unwrap();
        let bitmap = ParMarkBitmap::new(heap.base(), 256).unwrap();
        let _dead = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 4).unwrap();
        let a = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 2).unwrap();
        HeaderLayout::set_data(&heap, a, 1, 42);
        let b = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 4).unwrap();
        bitmap.mark_obj(a, 4);
        bitmap.mark_obj(b, 6);

        let dest = heap.base();
        let mut closure = MoveAndUpdateClosure::new(&heap, &bitmap, None, dest, 8);
        let status = bitmap.iterate(&mut closure, heap.base(), heap.base() + 64);
        assert_eq!(status, IterationStatus::WouldOverflow);
        assert_eq!(closure.source(), b);
        assert_eq!(closure.words_remaining(), 4);
        assert_eq!(HeaderLayout::get_data(&heap, dest, 1), 42);

        assert_eq!(closure.copy_until_full(), IterationStatus::Full);
        assert!(closure.is_full());
        assert_eq!(closure.source(), b + 4);
    }

    #[test]
    fn test_copy_partial_obj_stops_at_object_end() {
        let heap = Heap::new(HeapLayout::old_only(256), 64).unwrap();
        let bitmap = ParMarkBitmap::new(heap.base(), 256).unwrap();
        let a = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 8).unwrap();
        bitmap.mark_obj(a, 10);
        let mut closure = MoveAndUpdateClosure::new(&heap, &bitmap, None, heap.base() + 100, 20);
        closure.set_source(a + 4);
        closure.copy_partial_obj();
        assert_eq!(closure.words_remaining(), 14);
        assert_eq!(closure.source(), a + 10);
        assert_eq!(closure.destination(), heap.base() + 106);
    }
}
