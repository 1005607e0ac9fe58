//! GC locker.
//!
//! Code that holds raw heap addresses outside of root slots enters a critical
//! section; while any critical section is active a collection must not move
//! objects. A collection requested in the meantime is skipped and remembered
//! in [`GcLocker::needs_gc`] so the caller can retry once the last critical
//! section exits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Counts active critical sections.
#[derive(Debug, Default)]
pub struct GcLocker {
    active: AtomicUsize,
    needs_gc: AtomicBool,
}

impl GcLocker {
    /// A locker with no active critical section.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            needs_gc: AtomicBool::new(false),
        }
    }

    /// Enter a critical section that lasts until the guard is dropped.
    #[must_use = "the critical section ends when the guard is dropped"]
    pub fn enter(&self) -> CriticalGuard<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        CriticalGuard { locker: self }
    }

    /// Whether any critical section is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    /// Number of active critical sections.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Called at the start of a collection. Returns `true` (and records that
    /// a collection is pending) if the collection must be skipped.
    pub fn check_active_before_gc(&self) -> bool {
        if self.is_active() {
            self.needs_gc.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Whether a collection was skipped since the last successful one.
    #[must_use]
    pub fn needs_gc(&self) -> bool {
        self.needs_gc.load(Ordering::Acquire)
    }

    /// Forget a pending collection request.
    pub fn clear_needs_gc(&self) {
        self.needs_gc.store(false, Ordering::Release);
    }
}

/// Guard of an active critical section.
#[derive(Debug)]
pub struct CriticalGuard<'a> {
    locker: &'a GcLocker,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.locker.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_critical_sections() {
        let locker = GcLocker::new();
        assert!(!locker.check_active_before_gc());
        {
            let _a = locker.enter();
            let _b = locker.enter();
            assert_eq!(locker.active_count(), 2);
            assert!(locker.check_active_before_gc());
        }
        assert!(!locker.is_active());
        assert!(locker.needs_gc());
        locker.clear_needs_gc();
        assert!(!locker.needs_gc());
    }
}
