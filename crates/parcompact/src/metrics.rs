//! Collection metrics and statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistics from one full collection.
#[derive(Debug, Clone, Copy)]
pub struct CompactionMetrics {
    /// Duration of the whole collection.
    pub duration: Duration,
    /// Duration of the mark phase.
    pub mark_duration: Duration,
    /// Duration of the summary phase (or forwarding-address computation for
    /// the serial collector).
    pub summary_duration: Duration,
    /// Duration of the pointer adjustment phase.
    pub adjust_duration: Duration,
    /// Duration of the compaction phase.
    pub compact_duration: Duration,
    /// Words in use before the collection.
    pub words_before: usize,
    /// Live words found by marking.
    pub live_words: usize,
    /// Words freed by the collection.
    pub words_reclaimed: usize,
    /// Destination regions filled by the compaction phase.
    pub regions_filled: usize,
    /// Words left in place in dense prefixes.
    pub dense_prefix_words: usize,
    /// Spaces whose data had to be split across two targets.
    pub splits: usize,
    /// Kind of collection.
    pub kind: CollectionKind,
    /// Whether every space was compacted without a dense prefix.
    pub maximum_compaction: bool,
    /// Collections run by the collector that produced these metrics.
    pub total_collections: usize,
}

impl Default for CompactionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactionMetrics {
    /// Zeroed metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            summary_duration: Duration::ZERO,
            adjust_duration: Duration::ZERO,
            compact_duration: Duration::ZERO,
            words_before: 0,
            live_words: 0,
            words_reclaimed: 0,
            regions_filled: 0,
            dense_prefix_words: 0,
            splits: 0,
            kind: CollectionKind::None,
            maximum_compaction: false,
            total_collections: 0,
        }
    }

    /// Copy the phase durations out of `timer`.
    pub const fn set_phases(&mut self, timer: &PhaseTimer) {
        self.mark_duration = timer.mark;
        self.summary_duration = timer.summary;
        self.adjust_duration = timer.adjust;
        self.compact_duration = timer.compact;
    }
}

/// Which collector ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionKind {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Parallel region-based compaction.
    Parallel = 1,
    /// Serial sliding compaction.
    Serial = 2,
}

/// Timer for measuring individual phases.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Mark phase.
    pub mark: Duration,
    /// Summary phase.
    pub summary: Duration,
    /// Adjust phase.
    pub adjust: Duration,
    /// Compact phase.
    pub compact: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// A timer with every phase at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            summary: Duration::ZERO,
            adjust: Duration::ZERO,
            compact: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End the mark phase.
    pub fn end_mark(&mut self) {
        self.mark = self.take();
    }

    /// End the summary phase.
    pub fn end_summary(&mut self) {
        self.summary = self.take();
    }

    /// End the adjust phase.
    pub fn end_adjust(&mut self) {
        self.adjust = self.take();
    }

    /// End the compact phase.
    pub fn end_compact(&mut self) {
        self.compact = self.take();
    }

    /// Sum of all phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.mark + self.summary + self.adjust + self.compact
    }
}

/// Process-wide counters over every collector instance.
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    parallel_collections: AtomicUsize,
    serial_collections: AtomicUsize,
    skipped_collections: AtomicUsize,
    words_reclaimed: AtomicUsize,
    regions_filled: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            parallel_collections: AtomicUsize::new(0),
            serial_collections: AtomicUsize::new(0),
            skipped_collections: AtomicUsize::new(0),
            words_reclaimed: AtomicUsize::new(0),
            regions_filled: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Completed collections.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Completed parallel collections.
    #[inline]
    #[must_use]
    pub fn total_parallel_collections(&self) -> usize {
        self.parallel_collections.load(Ordering::Relaxed)
    }

    /// Completed serial collections.
    #[inline]
    #[must_use]
    pub fn total_serial_collections(&self) -> usize {
        self.serial_collections.load(Ordering::Relaxed)
    }

    /// Collections skipped because the GC locker was held.
    #[inline]
    #[must_use]
    pub fn total_skipped_collections(&self) -> usize {
        self.skipped_collections.load(Ordering::Relaxed)
    }

    /// Words reclaimed by all collections.
    #[inline]
    #[must_use]
    pub fn total_words_reclaimed(&self) -> usize {
        self.words_reclaimed.load(Ordering::Relaxed)
    }

    /// Destination regions filled by all parallel collections.
    #[inline]
    #[must_use]
    pub fn total_regions_filled(&self) -> usize {
        self.regions_filled.load(Ordering::Relaxed)
    }

    /// Total pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// The process-wide counters.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

const HISTORY_SIZE: usize = 64;

/// Bounded history of recent collections.
#[derive(Debug, Default)]
pub struct CompactionHistory {
    entries: Mutex<VecDeque<CompactionMetrics>>,
    total: AtomicUsize,
}

impl CompactionHistory {
    /// An empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
        }
    }

    fn push(&self, metrics: CompactionMetrics) {
        let mut entries = self.entries.lock();
        if entries.len() == HISTORY_SIZE {
            entries.pop_front();
        }
        entries.push_back(metrics);
        self.total.fetch_add(1, Ordering::Release);
    }

    /// Collections ever recorded.
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Up to `n` most recent entries, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<CompactionMetrics> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).copied().collect()
    }

    /// Mean pause over the last `n` collections.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = recent.iter().map(|m| m.duration).sum();
        total / u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    /// Longest pause over the last `n` collections.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

static HISTORY: CompactionHistory = CompactionHistory::new();

/// The process-wide collection history.
#[must_use]
pub fn compaction_history() -> &'static CompactionHistory {
    &HISTORY
}

/// Publish the metrics of a finished collection.
pub fn record_metrics(metrics: CompactionMetrics) {
    let g = global_metrics();
    g.collections.fetch_add(1, Ordering::Relaxed);
    g.words_reclaimed
        .fetch_add(metrics.words_reclaimed, Ordering::Relaxed);
    g.regions_filled
        .fetch_add(metrics.regions_filled, Ordering::Relaxed);
    g.pause_ns.fetch_add(
        metrics.duration.as_nanos().try_into().unwrap_or(u64::MAX),
        Ordering::Relaxed,
    );
    match metrics.kind {
        CollectionKind::Parallel => {
            g.parallel_collections.fetch_add(1, Ordering::Relaxed);
        }
        CollectionKind::Serial => {
            g.serial_collections.fetch_add(1, Ordering::Relaxed);
        }
        CollectionKind::None => {}
    }
    HISTORY.push(metrics);
}

/// Count a collection skipped by the GC locker.
pub fn record_skipped() {
    global_metrics()
        .skipped_collections
        .fetch_add(1, Ordering::Relaxed);
}
