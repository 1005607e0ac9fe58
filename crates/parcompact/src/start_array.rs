//! Object start array for the old space.
//!
//! The start array lets code outside the collector find the object covering
//! an arbitrary old-space address (for example to scan a dirty card). The
//! collector only writes to it: every object that ends up in the old space
//! after compaction is registered with [`StartArray::allocate_block`].

use std::sync::atomic::{AtomicU8, Ordering};

use crate::heap::{Heap, HeapWord};
use crate::object::ObjectModel;

/// Receiver of object-start notifications.
pub trait StartArray: Send + Sync {
    /// An object now starts at `addr`.
    fn allocate_block(&self, addr: HeapWord);

    /// Forget every recorded start.
    fn reset(&self);
}

/// Log2 of the words covered by one card.
pub const CARD_SHIFT: u32 = 6;
const CARD_WORDS: usize = 1 << CARD_SHIFT;

/// Card-based start array.
///
/// Each card records the offset of the first object start within it, stored
/// as `CARD_WORDS - offset` so that zero means no object starts in the card
/// and a larger entry means an earlier start.
pub struct ObjectStartArray {
    covered_beg: HeapWord,
    covered_words: usize,
    cards: Box<[AtomicU8]>,
}

impl ObjectStartArray {
    /// A start array covering `[covered_beg, covered_beg + covered_words)`.
    #[must_use]
    pub fn new(covered_beg: HeapWord, covered_words: usize) -> Self {
        let cards = (0..covered_words.div_ceil(CARD_WORDS))
            .map(|_| AtomicU8::new(0))
            .collect();
        Self {
            covered_beg,
            covered_words,
            cards,
        }
    }

    fn card_index(&self, addr: HeapWord) -> usize {
        debug_assert!(
            addr.delta(self.covered_beg) < self.covered_words,
            "address {addr} not covered"
        );
        addr.delta(self.covered_beg) >> CARD_SHIFT
    }

    fn card_start(&self, idx: usize) -> HeapWord {
        self.covered_beg + (idx << CARD_SHIFT)
    }

    /// First object start recorded in the card containing `addr`, if any.
    #[must_use]
    pub fn recorded_start(&self, addr: HeapWord) -> Option<HeapWord> {
        let idx = self.card_index(addr);
        self.recorded_start_in(idx)
    }

    fn recorded_start_in(&self, idx: usize) -> Option<HeapWord> {
        match self.cards[idx].load(Ordering::Relaxed) {
            0 => None,
            entry => Some(self.card_start(idx) + (CARD_WORDS - usize::from(entry))),
        }
    }

    /// Start of the object that covers `addr`, found by walking object sizes
    /// forward from the nearest recorded start at or before `addr`.
    #[must_use]
    pub fn object_start<M: ObjectModel>(&self, heap: &Heap, model: &M, addr: HeapWord) -> Option<HeapWord> {
        let mut idx = self.card_index(addr);
        let mut scroll_forward = loop {
            match self.recorded_start_in(idx) {
                Some(start) if start <= addr => break start,
                _ if idx == 0 => return None,
                _ => idx -= 1,
            }
        };
        let mut next = scroll_forward;
        while next <= addr {
            scroll_forward = next;
            next += model.size_of(heap, next);
        }
        Some(scroll_forward)
    }

    /// Whether no object start is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.iter().all(|c| c.load(Ordering::Relaxed) == 0)
    }
}

impl StartArray for ObjectStartArray {
    fn allocate_block(&self, addr: HeapWord) {
        let idx = self.card_index(addr);
        #[allow(clippy::cast_possible_truncation)]
        let entry = (CARD_WORDS - addr.delta(self.card_start(idx))) as u8;
        // Starts may be registered out of order by different workers; the
        // lowest offset wins.
        self.cards[idx].fetch_max(entry, Ordering::Relaxed);
    }

    fn reset(&self) {
        for card in &*self.cards {
            card.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for ObjectStartArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStartArray")
            .field("covered_beg", &self.covered_beg)
            .field("covered_words", &self.covered_words)
            .finish_non_exhaustive()
    }
}
