//! Parallel marking.
//!
//! The calling thread marks the objects referenced from roots and seeds them
//! into the shared injector. Every worker then traces from its own deque,
//! steals when it runs dry, and stops once all workers agree there is nothing
//! left. Marking an object sets its begin/end bits and adds its size to the
//! summary table in the same step, so the table's live counts are complete
//! when tracing ends.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bitmap::ParMarkBitmap;
use crate::collector::ParallelCompact;
use crate::heap::{Heap, HeapWord};
use crate::manager::{CompactionManager, StealSet};
use crate::object::ObjectModel;
use crate::roots::RootProvider;
use crate::summary::SummaryData;
use crate::workgang::TaskTerminator;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, log_phase_start, trace_phase, GcPhase};

struct MarkContext<'a, M> {
    heap: &'a Heap,
    model: &'a M,
    bitmap: &'a ParMarkBitmap,
    summary: &'a SummaryData,
    live_words: AtomicUsize,
}

impl<M: ObjectModel> MarkContext<'_, M> {
    /// Mark `obj`; true if this call marked it.
    fn mark_obj(&self, obj: HeapWord) -> bool {
        if self.bitmap.is_marked(obj) {
            return false;
        }
        let size = self.model.size_of(self.heap, obj);
        if self.bitmap.mark_obj(obj, size) {
            self.summary.add_obj(obj, size);
            self.live_words.fetch_add(size, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn mark_and_push(&self, cm: &CompactionManager, obj: HeapWord) {
        if self.mark_obj(obj) {
            cm.push_obj(obj);
        }
    }

    fn follow_contents(&self, cm: &CompactionManager, obj: HeapWord) {
        self.model.oop_iterate(self.heap, obj, |slot| {
            let referent = self.heap.load_ref(slot);
            if !referent.is_null() {
                self.mark_and_push(cm, referent);
            }
        });
    }

    fn follow_marking_stack(&self, cm: &CompactionManager) {
        while let Some(obj) = cm.pop_obj() {
            self.follow_contents(cm, obj);
        }
    }

    fn drain_and_steal(&self, cm: &CompactionManager, steal: &StealSet, terminator: &TaskTerminator) {
        loop {
            self.follow_marking_stack(cm);
            if let Some(obj) = cm.steal_obj(steal) {
                self.follow_contents(cm, obj);
                continue;
            }
            if terminator.offer_termination(|| steal.has_marking_work()) {
                break;
            }
        }
    }
}

impl<M: ObjectModel> ParallelCompact<M> {
    /// Mark everything reachable from `roots`, process references and unlink
    /// dead weak entries. Returns the live words found.
    pub(crate) fn marking_phase<R: RootProvider>(&mut self, roots: &R) -> usize {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(GcPhase::Mark);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Mark, self.heap.used_in_words());

        let ctx = MarkContext {
            heap: &self.heap,
            model: &self.model,
            bitmap: &self.mark_bitmap,
            summary: &self.summary_data,
            live_words: AtomicUsize::new(0),
        };
        let (managers, steal) = CompactionManager::create(self.gang.active_workers());

        roots.process_roots(|slot| {
            let obj = HeapWord::from_bits(slot.load(Ordering::Relaxed));
            if !obj.is_null() && ctx.mark_obj(obj) {
                steal.inject(obj);
            }
        });

        let terminator = TaskTerminator::new(managers.len());
        let managers = self.gang.run_with(managers, |_, cm| {
            ctx.drain_and_steal(&cm, &steal, &terminator);
            cm
        });

        // Reference processing is serial; whatever it keeps alive is traced
        // on the first worker's deque.
        let cm = &managers[0];
        let bitmap = &self.mark_bitmap;
        let is_alive = |obj: HeapWord| bitmap.is_marked(obj);
        let stats = self.ref_processor.process_discovered_references(
            &is_alive,
            &|obj| ctx.mark_and_push(cm, obj),
            &|| ctx.follow_marking_stack(cm),
        );
        ctx.follow_marking_stack(cm);
        self.ref_processor.unlink_dead(&is_alive);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            discovered = stats.discovered,
            cleared = stats.cleared,
            kept_alive = stats.kept_alive,
            "reference_processing"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = stats;

        let live_words = ctx.live_words.load(Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Mark, live_words);
        live_words
    }
}
