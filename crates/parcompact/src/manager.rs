//! Per-worker work queues.
//!
//! Each worker owns a [`CompactionManager`] with two LIFO deques: objects
//! whose contents still need tracing, and destination regions ready to be
//! filled. Other workers steal from the far end through the shared
//! [`StealSet`]. Root objects are seeded into a global injector that every
//! worker drains.

use std::cell::Cell;

use crossbeam::deque::{Injector, Steal, Stealer, Worker};

use crate::heap::HeapWord;

/// The stealing side of every worker's queues.
#[derive(Debug)]
pub struct StealSet {
    marking: Vec<Stealer<HeapWord>>,
    regions: Vec<Stealer<usize>>,
    injector: Injector<HeapWord>,
}

impl StealSet {
    /// Queue an object for any worker to trace.
    pub fn inject(&self, obj: HeapWord) {
        self.injector.push(obj);
    }

    /// Whether any marking work can be stolen.
    #[must_use]
    pub fn has_marking_work(&self) -> bool {
        !self.injector.is_empty() || self.marking.iter().any(|s| !s.is_empty())
    }

    /// Whether any region can be stolen.
    #[must_use]
    pub fn has_region_work(&self) -> bool {
        self.regions.iter().any(|s| !s.is_empty())
    }
}

/// Queues of one worker.
pub struct CompactionManager {
    id: usize,
    marking: Worker<HeapWord>,
    regions: Worker<usize>,
    seed: Cell<u64>,
}

impl CompactionManager {
    /// Create the managers for `workers` workers and the shared steal set.
    #[must_use]
    pub fn create(workers: usize) -> (Vec<Self>, StealSet) {
        let workers = workers.max(1);
        let managers: Vec<Self> = (0..workers)
            .map(|id| Self {
                id,
                marking: Worker::new_lifo(),
                regions: Worker::new_lifo(),
                seed: Cell::new(0x9E37_79B9_7F4A_7C15 ^ (id as u64 + 1)),
            })
            .collect();
        let steal = StealSet {
            marking: managers.iter().map(|m| m.marking.stealer()).collect(),
            regions: managers.iter().map(|m| m.regions.stealer()).collect(),
            injector: Injector::new(),
        };
        (managers, steal)
    }

    /// Push an object whose contents must be traced.
    pub fn push_obj(&self, obj: HeapWord) {
        self.marking.push(obj);
    }

    /// Pop the most recently pushed object.
    pub fn pop_obj(&self) -> Option<HeapWord> {
        self.marking.pop()
    }

    /// Push a region that is ready to be filled.
    pub fn push_region(&self, region_idx: usize) {
        self.regions.push(region_idx);
    }

    /// Pop the most recently pushed region.
    pub fn pop_region(&self) -> Option<usize> {
        self.regions.pop()
    }

    // xorshift64
    fn next_random(&self) -> u64 {
        let mut x = self.seed.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed.set(x);
        x
    }

    #[allow(clippy::cast_possible_truncation)]
    fn steal_from<T>(&self, stealers: &[Stealer<T>]) -> Option<T> {
        let n = stealers.len();
        if n < 2 {
            return None;
        }
        let start = (self.next_random() % n as u64) as usize;
        for k in 0..n {
            let victim = (start + k) % n;
            if victim == self.id {
                continue;
            }
            loop {
                match stealers[victim].steal() {
                    Steal::Success(item) => return Some(item),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }

    /// Take marking work from the injector or a random victim.
    pub fn steal_obj(&self, steal: &StealSet) -> Option<HeapWord> {
        loop {
            match steal.injector.steal_batch_and_pop(&self.marking) {
                Steal::Success(obj) => return Some(obj),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
        self.steal_from(&steal.marking)
    }

    /// Take a region from a random victim.
    pub fn steal_region(&self, steal: &StealSet) -> Option<usize> {
        self.steal_from(&steal.regions)
    }
}

impl std::fmt::Debug for CompactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionManager")
            .field("id", &self.id)
            .field("marking", &self.marking.len())
            .field("regions", &self.regions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_queues_are_lifo() {
        let (managers, _) = CompactionManager::create(1);
        let cm = &managers[0];
        cm.push_region(1);
        cm.push_region(2);
        assert_eq!(cm.pop_region(), Some(2));
        assert_eq!(cm.pop_region(), Some(1));
        assert_eq!(cm.pop_region(), None);
    }

    #[test]
    fn test_steal_from_other_worker() {
        let (managers, steal) = CompactionManager::create(2);
        managers[0].push_obj(HeapWord::new(64));
        assert!(steal.has_marking_work());
        assert_eq!(managers[1].steal_obj(&steal), Some(HeapWord::new(64)));
        assert!(!steal.has_marking_work());
        // Never steals from itself.
        managers[1].push_region(7);
        assert_eq!(managers[1].steal_region(&steal), None);
        assert_eq!(managers[0].steal_region(&steal), Some(7));
    }

    #[test]
    fn test_injected_work_reaches_any_worker() {
        let (managers, steal) = CompactionManager::create(3);
        steal.inject(HeapWord::new(128));
        steal.inject(HeapWord::new(256));
        let mut got = Vec::new();
        while let Some(obj) = managers[2].steal_obj(&steal).or_else(|| managers[2].pop_obj()) {
            got.push(obj.raw());
        }
        got.sort_unstable();
        assert_eq!(got, vec![128, 256]);
    }
}
