//! Fork-join worker gang and termination protocol.
//!
//! Every parallel phase is "hand out work, run it on N threads, wait for all
//! of them". Threads are scoped to the phase, so workers may borrow the heap
//! and the collector tables directly. Phases that drain shared work-stealing
//! queues end through a [`TaskTerminator`].

use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam::utils::Backoff;
use crossbeam_queue::SegQueue;

/// Counting termination barrier.
///
/// A worker that runs out of work offers termination. It then waits until
/// either every worker has offered (the phase is over) or it sees stealable
/// work, in which case it withdraws its offer and goes back to stealing.
#[derive(Debug)]
pub struct TaskTerminator {
    n_threads: usize,
    offered: AtomicUsize,
}

impl TaskTerminator {
    /// Terminator for `n_threads` workers.
    #[must_use]
    pub const fn new(n_threads: usize) -> Self {
        Self {
            n_threads,
            offered: AtomicUsize::new(0),
        }
    }

    /// Offer to terminate.
    ///
    /// Returns `true` once all workers have offered. Returns `false` if
    /// `peek_work` reported work while waiting; the offer is withdrawn and
    /// the caller must try to steal again.
    ///
    /// A worker may only offer when its own queue is empty, and no worker
    /// pushes while it is offering, so once the count reaches `n_threads`
    /// no queue holds work and the count never drops again.
    pub fn offer_termination<F: Fn() -> bool>(&self, peek_work: F) -> bool {
        self.offered.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self.offered.load(Ordering::Acquire) == self.n_threads {
                return true;
            }
            if peek_work() {
                self.offered.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}

/// A fixed number of workers for fork-join phases.
#[derive(Debug, Clone, Copy)]
pub struct WorkGang {
    workers: usize,
}

impl WorkGang {
    /// A gang of `workers` threads (at least one).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Number of workers.
    #[must_use]
    pub const fn active_workers(&self) -> usize {
        self.workers
    }

    /// Run `f(worker_id, state)` once per state, each on its own thread,
    /// and wait for all of them. The calling thread runs worker 0.
    ///
    /// A panic in any worker is propagated once every worker has stopped.
    pub fn run_with<S, R, F>(&self, states: Vec<S>, f: F) -> Vec<R>
    where
        S: Send,
        R: Send,
        F: Fn(usize, S) -> R + Sync,
    {
        let mut states = states.into_iter();
        let Some(first) = states.next() else {
            return Vec::new();
        };
        if states.len() == 0 {
            return vec![f(0, first)];
        }
        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = states
                .enumerate()
                .map(|(i, state)| scope.spawn(move || f(i + 1, state)))
                .collect();
            let mut results = Vec::with_capacity(handles.len() + 1);
            results.push(f(0, first));
            for handle in handles {
                match handle.join() {
                    Ok(result) => results.push(result),
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            results
        })
    }

    /// Run `f(worker_id)` on every worker.
    pub fn run<R, F>(&self, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync,
    {
        self.run_with(vec![(); self.workers], |id, ()| f(id))
    }

    /// Drain `tasks` with all workers; each task runs exactly once.
    pub fn execute_and_wait<T, F>(&self, tasks: SegQueue<T>, f: F)
    where
        T: Send,
        F: Fn(usize, T) + Sync,
    {
        let workers = self.workers.min(tasks.len()).max(1);
        let tasks = &tasks;
        Self::new(workers).run(|id| {
            while let Some(task) = tasks.pop() {
                f(id, task);
            }
        });
    }
}
