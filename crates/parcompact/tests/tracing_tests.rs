//! Integration tests for the `tracing` feature.
//!
//! A recording layer captures span names and event messages emitted on the
//! collecting thread.

#![cfg(feature = "tracing")]

mod common;

use std::fmt;
use std::sync::Arc;

use common::{Graph, R};
use parcompact::{
    CompactConfig, GcCause, HeaderLayout, Heap, HeapLayout, MarkSweepCompact, ParallelCompact,
    RootSet, SpaceId,
};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{span, Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn count(&self, name: &str) -> usize {
        self.0.lock().iter().filter(|s| *s == name).count()
    }

    fn contains(&self, name: &str) -> bool {
        self.count(name) > 0
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for Recorder {
    fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: Context<'_, S>) {
        self.0.lock().push(attrs.metadata().name().to_string());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.0.lock().push(visitor.0);
    }
}

fn with_recorder(f: impl FnOnce()) -> Recorder {
    let recorder = Recorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());
    tracing::subscriber::with_default(subscriber, f);
    recorder
}

#[test]
fn test_parallel_collection_spans() {
    let heap = Heap::new(HeapLayout::old_only(8 * R), R).unwrap();
    let mut pc =
        ParallelCompact::new(heap, HeaderLayout, CompactConfig::new(2).with_region_size(6, 3)).unwrap();
    let mut graph = Graph::default();
    let roots = RootSet::new();
    for i in 0..20 {
        let id = graph.alloc(pc.heap(), SpaceId::Old, 0, 10).unwrap();
        if i % 2 == 0 {
            graph.root(&roots, id);
        }
    }

    let recorder = with_recorder(|| {
        assert!(pc.invoke(&roots, GcCause::Explicit, false));
    });

    assert_eq!(recorder.count("gc_collect"), 1);
    assert_eq!(recorder.count("gc_phase"), 4);
    assert_eq!(recorder.count("phase_start"), 4);
    assert_eq!(recorder.count("phase_end"), 4);
    assert!(recorder.contains("collection_start"));
    assert!(recorder.contains("collection_end"));
    assert!(recorder.contains("reference_processing"));
    assert!(recorder.contains("enqueue_region_draining_tasks"));
}

#[test]
fn test_dense_prefix_choice_is_logged() {
    let mut config = CompactConfig::new(1).with_region_size(6, 3);
    config.set_maximum_compaction(20, 0);
    let heap = Heap::new(HeapLayout::old_only(8 * R), R).unwrap();
    let mut pc = ParallelCompact::new(heap, HeaderLayout, config).unwrap();
    let mut graph = Graph::default();
    let roots = RootSet::new();
    for i in 0..64 {
        let id = graph.alloc(pc.heap(), SpaceId::Old, 0, 6).unwrap();
        if i % 4 != 3 {
            graph.root(&roots, id);
        }
    }

    let recorder = with_recorder(|| {
        assert!(pc.invoke(&roots, GcCause::AllocationFailure, false));
    });
    assert!(recorder.contains("dense_prefix"));
}

#[test]
fn test_skipped_collection_is_logged() {
    let heap = Heap::new(HeapLayout::old_only(2 * R), R).unwrap();
    let mut pc =
        ParallelCompact::new(heap, HeaderLayout, CompactConfig::new(1).with_region_size(6, 3)).unwrap();
    let locker = Arc::clone(pc.gc_locker());
    let _guard = locker.enter();

    let recorder = with_recorder(|| {
        assert!(!pc.invoke(&RootSet::new(), GcCause::Explicit, false));
    });
    assert!(recorder.contains("collection skipped, GC locker active"));
    assert!(!recorder.contains("gc_collect"));
}

#[test]
fn test_serial_collection_spans() {
    let heap = Heap::new(HeapLayout::old_only(4 * R), R).unwrap();
    let mut msc = MarkSweepCompact::new(&heap, HeaderLayout).unwrap();
    let mut graph = Graph::default();
    let roots = RootSet::new();
    let _garbage = graph.alloc(&heap, SpaceId::Old, 0, 30).unwrap();
    let live = graph.alloc(&heap, SpaceId::Old, 0, 3).unwrap();
    graph.root(&roots, live);

    let recorder = with_recorder(|| {
        assert!(msc.invoke(&heap, &roots, GcCause::Explicit));
    });
    assert_eq!(recorder.count("gc_collect"), 1);
    assert_eq!(recorder.count("gc_phase"), 4);
    assert!(recorder.contains("prepare_for_compaction"));
    assert!(recorder.contains("collection_end"));
}
