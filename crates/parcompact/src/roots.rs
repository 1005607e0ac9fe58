//! Root enumeration and reference processing collaborators.
//!
//! Roots are slots outside the heap that hold heap addresses (or 0 for null).
//! The collector visits each slot once during marking and once more during
//! pointer adjustment, when the slot is rewritten to the post-compaction
//! address of its referent.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::heap::HeapWord;

/// Source of root slots.
pub trait RootProvider: Sync {
    /// Call `visitor` once for every root slot.
    fn process_roots<F: FnMut(&AtomicU64)>(&self, visitor: F);
}

/// A growable table of root slots.
///
/// # Example
///
/// ```
/// use parcompact::{HeapWord, RootSet};
///
/// let roots = RootSet::new();
/// let idx = roots.push(HeapWord::new(128));
/// assert_eq!(roots.get(idx), HeapWord::new(128));
/// roots.set(idx, HeapWord::NULL);
/// assert!(roots.get(idx).is_null());
/// ```
#[derive(Debug, Default)]
pub struct RootSet {
    slots: RwLock<Vec<AtomicU64>>,
}

impl RootSet {
    /// An empty root set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Add a root and return its index.
    pub fn push(&self, addr: HeapWord) -> usize {
        let mut slots = self.slots.write();
        slots.push(AtomicU64::new(addr.to_bits()));
        slots.len() - 1
    }

    /// The address held by root `idx`.
    #[must_use]
    pub fn get(&self, idx: usize) -> HeapWord {
        HeapWord::from_bits(self.slots.read()[idx].load(Ordering::Relaxed))
    }

    /// Overwrite root `idx`.
    pub fn set(&self, idx: usize, addr: HeapWord) {
        self.slots.read()[idx].store(addr.to_bits(), Ordering::Relaxed);
    }

    /// Number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether there are no roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl RootProvider for RootSet {
    fn process_roots<F: FnMut(&AtomicU64)>(&self, mut visitor: F) {
        for slot in self.slots.read().iter() {
            visitor(slot);
        }
    }
}

impl<T: RootProvider> RootProvider for &T {
    fn process_roots<F: FnMut(&AtomicU64)>(&self, visitor: F) {
        (**self).process_roots(visitor);
    }
}

// ============================================================================
// Reference processing
// ============================================================================

/// Counts reported by [`ReferenceProcessor::process_discovered_references`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    /// References examined.
    pub discovered: usize,
    /// References whose referent was dead and got cleared.
    pub cleared: usize,
    /// Referents kept alive by policy.
    pub kept_alive: usize,
}

/// Weak/soft reference policy, consumed as a black box.
///
/// The collector calls [`process_discovered_references`] once strong marking
/// is complete. `keep_alive` marks an object (and queues it for tracing);
/// `follow` traces everything queued so far. Afterwards [`unlink_dead`]
/// drops entries of weak tables whose referents died, and during pointer
/// adjustment [`adjust_slots`] exposes every slot the processor still holds.
///
/// [`process_discovered_references`]: ReferenceProcessor::process_discovered_references
/// [`unlink_dead`]: ReferenceProcessor::unlink_dead
/// [`adjust_slots`]: ReferenceProcessor::adjust_slots
pub trait ReferenceProcessor: Send + Sync {
    /// Choose whether soft references are cleared this cycle.
    fn setup_policy(&mut self, clear_all_soft_refs: bool);

    /// Process the references discovered so far.
    fn process_discovered_references(
        &mut self,
        is_alive: &dyn Fn(HeapWord) -> bool,
        keep_alive: &dyn Fn(HeapWord),
        follow: &dyn Fn(),
    ) -> ReferenceStats;

    /// Remove weak entries whose referents are dead.
    fn unlink_dead(&mut self, is_alive: &dyn Fn(HeapWord) -> bool);

    /// Call `visitor` for every slot the processor holds.
    fn adjust_slots(&self, visitor: &mut dyn FnMut(&AtomicU64));
}

/// Reference processor that has nothing to process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReferenceProcessing;

impl ReferenceProcessor for NoReferenceProcessing {
    fn setup_policy(&mut self, _clear_all_soft_refs: bool) {}

    fn process_discovered_references(
        &mut self,
        _is_alive: &dyn Fn(HeapWord) -> bool,
        _keep_alive: &dyn Fn(HeapWord),
        _follow: &dyn Fn(),
    ) -> ReferenceStats {
        ReferenceStats::default()
    }

    fn unlink_dead(&mut self, _is_alive: &dyn Fn(HeapWord) -> bool) {}

    fn adjust_slots(&self, _visitor: &mut dyn FnMut(&AtomicU64)) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_set_visits_every_slot() {
        let roots = RootSet::new();
        assert!(roots.is_empty());
        roots.push(HeapWord::new(64));
        roots.push(HeapWord::NULL);
        roots.push(HeapWord::new(96));
        let mut seen = Vec::new();
        roots.process_roots(|slot| seen.push(slot.load(Ordering::Relaxed)));
        assert_eq!(seen, vec![64, 0, 96]);
        assert_eq!(roots.len(), 3);
    }

    #[test]
    fn test_no_reference_processing_reports_nothing() {
        let mut rp = NoReferenceProcessing;
        rp.setup_policy(true);
        let stats = rp.process_discovered_references(&|_| true, &|_| {}, &|| {});
        assert_eq!(stats, ReferenceStats::default());
        let mut visited = 0;
        rp.adjust_slots(&mut |_| visited += 1);
        assert_eq!(visited, 0);
    }
}
