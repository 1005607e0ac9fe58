//! Loom tests for the region claim protocol.
//!
//! A destination region becomes fillable when the last region reading from
//! it decrements its destination count. Whoever sees the count reach zero
//! may try to claim it; exactly one claim must succeed.
//!
//! The region table uses `std` atomics, which loom does not instrument, so
//! each model runs a single schedule chosen by the OS. These tests check the
//! protocol under real thread scheduling; they do not enumerate interleavings.

use std::sync::Arc;

use parcompact::{HeapWord, ParMarkBitmap, SummaryData};

fn table() -> SummaryData {
    SummaryData::new(HeapWord::new(64), 256, 6, 3).unwrap()
}

/// Two readers finish concurrently; the region is claimed exactly once.
#[test]
#[ignore = "loom test - run with cargo test --test loom_claim -- --ignored"]
fn test_last_decrement_claims_once() {
    loom::model(|| {
        let sd = Arc::new(table());
        sd.region(1).set_destination_count(2);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let sd = Arc::clone(&sd);
                loom::thread::spawn(move || {
                    let region = sd.region(1);
                    region.decrement_destination_count();
                    region.available() && region.claim()
                })
            })
            .collect();

        let claims = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&claimed| claimed)
            .count();
        assert_eq!(claims, 1);
        assert!(sd.region(1).claimed());
    });
}

/// A region still being read cannot be claimed.
#[test]
#[ignore = "loom test - run with cargo test --test loom_claim -- --ignored"]
fn test_claim_waits_for_readers() {
    loom::model(|| {
        let sd = Arc::new(table());
        sd.region(2).set_destination_count(1);

        let reader = loom::thread::spawn({
            let sd = Arc::clone(&sd);
            move || {
                sd.region(2).decrement_destination_count();
            }
        });
        let claimer = loom::thread::spawn({
            let sd = Arc::clone(&sd);
            move || sd.region(2).claim()
        });

        reader.join().unwrap();
        let claimed = claimer.join().unwrap();
        // Either the claim came after the decrement, or it failed and the
        // region is still up for grabs.
        assert_eq!(sd.region(2).claimed(), claimed);
        assert!(sd.region(2).available());
    });
}

/// Racing block-table fills write identical offsets.
#[test]
#[ignore = "loom test - run with cargo test --test loom_claim -- --ignored"]
fn test_concurrent_fill_blocks() {
    loom::model(|| {
        let sd = Arc::new(table());
        let bitmap = Arc::new(ParMarkBitmap::new(HeapWord::new(64), 256).unwrap());
        let region = 1;
        let beg = sd.region_to_addr(region);
        for (offset, size) in [(0, 5), (9, 3), (20, 12)] {
            bitmap.mark_obj(beg + offset, size);
            sd.add_obj(beg + offset, size);
        }

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let sd = Arc::clone(&sd);
                let bitmap = Arc::clone(&bitmap);
                loom::thread::spawn(move || sd.fill_blocks(region, &bitmap))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let blocks_per_region = 1 << (6 - 3);
        let first_block = region * blocks_per_region;
        assert_eq!(sd.block(first_block).offset(), 0);
        assert_eq!(sd.block(first_block + 1).offset(), 5);
        assert_eq!(sd.block(first_block + 2).offset(), 8);
    });
}
