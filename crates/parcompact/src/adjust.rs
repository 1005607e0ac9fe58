//! Pointer adjustment.
//!
//! Runs after the summary phase and before anything moves: every root slot
//! and every reference slot of every live object is rewritten to the
//! post-compaction address of its referent. Objects are then moved as plain
//! words.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;

use crate::collector::ParallelCompact;
use crate::heap::HeapWord;
use crate::object::ObjectModel;
use crate::roots::RootProvider;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, log_phase_start, trace_phase, GcPhase};

impl<M: ObjectModel> ParallelCompact<M> {
    fn new_location(&self, obj: HeapWord) -> HeapWord {
        self.summary_data.calc_new_pointer(obj, &self.mark_bitmap)
    }

    fn adjust_slot(&self, slot: &AtomicU64) {
        let obj = HeapWord::from_bits(slot.load(Ordering::Relaxed));
        if !obj.is_null() {
            slot.store(self.new_location(obj).to_bits(), Ordering::Relaxed);
        }
    }

    /// Rewrite the root slots and the slots held by the reference processor.
    pub(crate) fn adjust_roots<R: RootProvider>(&self, roots: &R) {
        self.for_each_root_slot(roots, |slot| self.adjust_slot(slot));
    }

    /// Rewrite the reference slots of every live object that starts in
    /// `[beg, end)`.
    fn adjust_range(&self, beg: HeapWord, end: HeapWord) {
        let mut obj = self.mark_bitmap.find_obj_beg(beg, end);
        while obj < end {
            self.model.oop_iterate(&self.heap, obj, |slot| {
                self.adjust_slot(self.heap.word(slot));
            });
            let size = self.mark_bitmap.obj_size(obj);
            obj = self.mark_bitmap.find_obj_beg(obj + size, end);
        }
    }

    /// Rewrite every interior reference in the heap, one region per task.
    pub(crate) fn adjust_pointers(&self) {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Adjust);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Adjust, self.heap.used_in_words());

        let tasks = SegQueue::new();
        let region_words = self.summary_data.region_words();
        for space in self.heap.spaces() {
            let mut beg = space.bottom();
            let top = space.top();
            while beg < top {
                let end = (beg + region_words).min(top);
                tasks.push((beg, end));
                beg = end;
            }
        }
        let task_count = tasks.len();
        self.gang
            .execute_and_wait(tasks, |_, (beg, end)| self.adjust_range(beg, end));

        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Adjust, task_count);
        #[cfg(not(feature = "tracing"))]
        let _ = task_count;
    }
}
