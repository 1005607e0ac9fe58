//! A stop-the-world, parallel mark-sweep-compact garbage collector core.
//!
//! `parcompact` collects a word-addressed [`Heap`] made of four contiguous
//! spaces (old, eden, from, to). A full collection runs four phases:
//!
//! 1. **Mark**: trace from the roots in parallel, recording the first and
//!    last word of every live object in a [`ParMarkBitmap`] and summing live
//!    words per fixed-size region.
//! 2. **Summary**: pick a dense prefix per space that is left in place,
//!    then assign every region a destination. Young spaces compact into the
//!    old space, splitting at an object boundary when they do not fit.
//! 3. **Adjust**: rewrite every root and interior reference to the new
//!    address of its referent.
//! 4. **Compact**: move objects region by region. A destination region is
//!    filled only once every region it overwrites has been read.
//!
//! A simpler serial collector, [`MarkSweepCompact`], slides everything down
//! using forwarding addresses stored in mark words.
//!
//! The collector never interprets objects itself. Object layout, roots,
//! reference processing and old-space block starts are supplied through
//! [`ObjectModel`], [`RootProvider`], [`ReferenceProcessor`] and
//! [`StartArray`].
//!
//! # Quick Start
//!
//! ```
//! use parcompact::{CompactConfig, GcCause, HeaderLayout, Heap, HeapLayout, ParallelCompact, RootSet, SpaceId};
//!
//! // 64-word regions, four of them in the old space.
//! let config = CompactConfig::new(2).with_region_size(6, 3);
//! let heap = Heap::new(HeapLayout::old_only(4 * 64), 64).unwrap();
//! let mut pc = ParallelCompact::new(heap, HeaderLayout, config).unwrap();
//!
//! let heap = pc.heap();
//! let _garbage = HeaderLayout::allocate(heap, SpaceId::Old, 0, 40).unwrap();
//! let list = HeaderLayout::allocate(heap, SpaceId::Old, 1, 0).unwrap();
//! let tail = HeaderLayout::allocate(heap, SpaceId::Old, 0, 4).unwrap();
//! HeaderLayout::set_ref(heap, list, 0, tail);
//!
//! let roots = RootSet::new();
//! let root = roots.push(list);
//! assert!(pc.invoke(&roots, GcCause::Explicit, false));
//!
//! let heap = pc.heap();
//! let list = roots.get(root);
//! assert_eq!(list, heap.base());
//! assert_eq!(HeaderLayout::get_ref(heap, list, 0), heap.base() + 3);
//! assert_eq!(heap.space(SpaceId::Old).used_in_words(), 9);
//! ```
//!
//! # Tracing
//!
//! With the `tracing` feature, each collection runs inside a `gc_collect`
//! span and each phase inside a `gc_phase` span, with `debug!` events for
//! phase boundaries, dense-prefix choices and splits.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod adjust;
mod collector;
mod compact;
mod config;
mod error;
mod locker;
mod manager;
mod mark;
mod metrics;
mod object;
mod preserved;
mod roots;
mod serial;
mod tracing;
mod workgang;

/// Begin/end mark bitmap.
///
/// Public for tests and tools that inspect the collector's side tables.
pub mod bitmap;

/// Dense-prefix selection.
pub mod dense_prefix;

/// Heap words, spaces and the heap itself.
pub mod heap;

/// Region and block summary table.
pub mod summary;

/// Bookkeeping for a space whose live data is split between two targets.
pub mod split_info;

/// Old-space object start tracking.
pub mod start_array;

pub use bitmap::{IterationStatus, ParMarkBitmap, ParMarkBitmapClosure};
pub use collector::{CollectorPhase, GcCause, ParallelCompact, SpaceInfo};
pub use config::CompactConfig;
pub use error::SetupError;
pub use heap::{Heap, HeapLayout, HeapWord, MutableSpace, SpaceId};
pub use locker::{CriticalGuard, GcLocker};
pub use metrics::{
    compaction_history, global_metrics, CollectionKind, CompactionHistory, CompactionMetrics,
    GlobalMetrics, PhaseTimer,
};
pub use object::{HeaderLayout, ObjectModel};
pub use preserved::PreservedMarks;
pub use roots::{NoReferenceProcessing, ReferenceProcessor, ReferenceStats, RootProvider, RootSet};
pub use serial::{CompactPoint, MarkSweepCompact};
pub use start_array::{ObjectStartArray, StartArray};
pub use summary::{ClaimState, RegionData, SummaryData};
pub use tracing::GcId;
