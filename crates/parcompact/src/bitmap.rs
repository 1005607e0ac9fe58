//! Mark bitmap.
//!
//! Two bits per heap word: a begin bit set on the first word of every live
//! object and an end bit set on its last word. Object sizes, live-word counts
//! and object boundaries are all recovered from the bitmap alone, without
//! reading object headers, which is what lets the compaction phase copy
//! objects in pieces and in any order.

use std::sync::atomic::{AtomicU64, Ordering};

use vspace::WordStorage;

use crate::error::SetupError;
use crate::heap::HeapWord;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Result of [`ParMarkBitmap::iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    /// An object starting in the range ends beyond it; the closure's source is
    /// set to that object.
    Incomplete,
    /// Every object starting in the range was visited.
    Complete,
    /// The closure's destination budget is exactly used up.
    Full,
    /// The next object does not fit in the closure's remaining budget.
    WouldOverflow,
}

/// Visitor driven by [`ParMarkBitmap::iterate`].
pub trait ParMarkBitmapClosure {
    /// Visit the live object at `addr` of `words` words.
    ///
    /// Returning anything other than [`IterationStatus::Incomplete`] stops
    /// the iteration with that status.
    fn do_addr(&mut self, addr: HeapWord, words: usize) -> IterationStatus;

    /// Record where iteration stopped.
    fn set_source(&mut self, addr: HeapWord);
}

/// Begin/end mark bitmap covering a contiguous address range.
///
/// # Example
///
/// ```
/// use parcompact::{HeapWord, ParMarkBitmap};
///
/// let bitmap = ParMarkBitmap::new(HeapWord::new(64), 1024).unwrap();
/// let obj = HeapWord::new(100);
/// assert!(bitmap.mark_obj(obj, 5));
/// assert!(!bitmap.mark_obj(obj, 5));
/// assert_eq!(bitmap.obj_size(obj), 5);
/// assert_eq!(bitmap.find_obj_beg(HeapWord::new(64), HeapWord::new(200)), obj);
/// ```
pub struct ParMarkBitmap {
    covered_beg: HeapWord,
    covered_words: usize,
    beg_bits: WordStorage,
    end_bits: WordStorage,
}

impl ParMarkBitmap {
    /// Reserve a bitmap covering `[covered_beg, covered_beg + covered_words)`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Reserve`] if the backing memory cannot be
    /// committed.
    pub fn new(covered_beg: HeapWord, covered_words: usize) -> Result<Self, SetupError> {
        let words = covered_words.div_ceil(BITS_PER_WORD).max(1);
        let beg_bits =
            WordStorage::new(words).map_err(|e| SetupError::reserve("mark bitmap", e))?;
        let end_bits =
            WordStorage::new(words).map_err(|e| SetupError::reserve("mark bitmap", e))?;
        Ok(Self {
            covered_beg,
            covered_words,
            beg_bits,
            end_bits,
        })
    }

    /// First covered address.
    #[must_use]
    pub const fn region_start(&self) -> HeapWord {
        self.covered_beg
    }

    /// One past the last covered address.
    #[must_use]
    pub fn region_end(&self) -> HeapWord {
        self.covered_beg + self.covered_words
    }

    fn addr_to_bit(&self, addr: HeapWord) -> usize {
        let bit = addr.delta(self.covered_beg);
        debug_assert!(bit <= self.covered_words, "address {addr} not covered");
        bit
    }

    fn bit_to_addr(&self, bit: usize) -> HeapWord {
        self.covered_beg + bit
    }

    fn test(bits: &[AtomicU64], bit: usize) -> bool {
        bits[bit / BITS_PER_WORD].load(Ordering::Relaxed) & (1 << (bit % BITS_PER_WORD)) != 0
    }

    /// Index of the first set bit in `[beg, end)`, or `end`.
    fn find_next(bits: &[AtomicU64], beg: usize, end: usize) -> usize {
        if beg >= end {
            return end;
        }
        let mut idx = beg / BITS_PER_WORD;
        let mut word = bits[idx].load(Ordering::Relaxed) & (u64::MAX << (beg % BITS_PER_WORD));
        loop {
            if word != 0 {
                let bit = idx * BITS_PER_WORD + word.trailing_zeros() as usize;
                return bit.min(end);
            }
            idx += 1;
            if idx * BITS_PER_WORD >= end {
                return end;
            }
            word = bits[idx].load(Ordering::Relaxed);
        }
    }

    /// Mark the object `[addr, addr + size)` live.
    ///
    /// Returns `true` only for the caller that set the begin bit, so exactly
    /// one marker accounts for each object.
    pub fn mark_obj(&self, addr: HeapWord, size: usize) -> bool {
        debug_assert!(size > 0, "zero-sized object");
        let beg = self.addr_to_bit(addr);
        let mask = 1u64 << (beg % BITS_PER_WORD);
        let prev = self.beg_bits[beg / BITS_PER_WORD].fetch_or(mask, Ordering::AcqRel);
        if prev & mask != 0 {
            return false;
        }
        let end = beg + size - 1;
        self.end_bits[end / BITS_PER_WORD]
            .fetch_or(1u64 << (end % BITS_PER_WORD), Ordering::AcqRel);
        true
    }

    /// Whether a live object begins at `addr`.
    #[must_use]
    pub fn is_marked(&self, addr: HeapWord) -> bool {
        Self::test(&self.beg_bits, self.addr_to_bit(addr))
    }

    /// Whether no live object begins at `addr`.
    #[must_use]
    pub fn is_unmarked(&self, addr: HeapWord) -> bool {
        !self.is_marked(addr)
    }

    /// Whether a live object ends at `addr`.
    #[must_use]
    pub fn is_obj_end(&self, addr: HeapWord) -> bool {
        Self::test(&self.end_bits, self.addr_to_bit(addr))
    }

    /// First live object start in `[beg, end)`, or `end` if there is none.
    #[must_use]
    pub fn find_obj_beg(&self, beg: HeapWord, end: HeapWord) -> HeapWord {
        let bit = Self::find_next(&self.beg_bits, self.addr_to_bit(beg), self.addr_to_bit(end));
        self.bit_to_addr(bit)
    }

    /// First live object end in `[beg, end)`, or `end` if there is none.
    #[must_use]
    pub fn find_obj_end(&self, beg: HeapWord, end: HeapWord) -> HeapWord {
        let bit = Self::find_next(&self.end_bits, self.addr_to_bit(beg), self.addr_to_bit(end));
        self.bit_to_addr(bit)
    }

    /// Size of the live object starting at `addr`.
    #[must_use]
    pub fn obj_size(&self, addr: HeapWord) -> usize {
        let end = self.find_obj_end(addr, self.region_end());
        debug_assert!(end < self.region_end(), "object at {addr} has no end bit");
        end.delta(addr) + 1
    }

    /// Live words of objects that start in `[beg, end_obj)`.
    ///
    /// `beg` may point into the middle of an object; that object is not
    /// counted.
    #[must_use]
    pub fn live_words_in_range(&self, beg: HeapWord, end_obj: HeapWord) -> usize {
        let search_end = self.addr_to_bit(self.region_end());
        let range_end = self.addr_to_bit(end_obj);
        let mut live = 0;
        let mut beg_bit = Self::find_next(&self.beg_bits, self.addr_to_bit(beg), range_end);
        while beg_bit < range_end {
            let end_bit = Self::find_next(&self.end_bits, beg_bit, search_end);
            debug_assert!(end_bit < search_end, "live object without an end bit");
            live += end_bit - beg_bit + 1;
            beg_bit = Self::find_next(&self.beg_bits, end_bit + 1, range_end);
        }
        live
    }

    /// Visit every live object that starts in `[beg, end)`.
    pub fn iterate<C: ParMarkBitmapClosure>(
        &self,
        closure: &mut C,
        beg: HeapWord,
        end: HeapWord,
    ) -> IterationStatus {
        let range_end = self.addr_to_bit(end);
        let mut cur_beg = Self::find_next(&self.beg_bits, self.addr_to_bit(beg), range_end);
        while cur_beg < range_end {
            let cur_end = Self::find_next(&self.end_bits, cur_beg, range_end);
            if cur_end >= range_end {
                closure.set_source(self.bit_to_addr(cur_beg));
                return IterationStatus::Incomplete;
            }
            let status = closure.do_addr(self.bit_to_addr(cur_beg), cur_end - cur_beg + 1);
            if status != IterationStatus::Incomplete {
                debug_assert!(
                    matches!(status, IterationStatus::Full | IterationStatus::WouldOverflow),
                    "unexpected status {status:?}"
                );
                return status;
            }
            cur_beg = Self::find_next(&self.beg_bits, cur_end + 1, range_end);
        }
        closure.set_source(end);
        IterationStatus::Complete
    }

    fn clear_bits(bits: &[AtomicU64], beg: usize, end: usize) {
        let mut bit = beg;
        while bit < end {
            let idx = bit / BITS_PER_WORD;
            let offset = bit % BITS_PER_WORD;
            if offset == 0 && bit + BITS_PER_WORD <= end {
                bits[idx].store(0, Ordering::Relaxed);
                bit += BITS_PER_WORD;
            } else {
                let stop = end.min((idx + 1) * BITS_PER_WORD);
                let len = stop - bit;
                let mask = if len == BITS_PER_WORD {
                    u64::MAX
                } else {
                    ((1u64 << len) - 1) << offset
                };
                bits[idx].fetch_and(!mask, Ordering::Relaxed);
                bit = stop;
            }
        }
    }

    /// Clear begin and end bits for `[beg, end)`.
    pub fn clear_range(&self, beg: HeapWord, end: HeapWord) {
        let (b, e) = (self.addr_to_bit(beg), self.addr_to_bit(end));
        Self::clear_bits(&self.beg_bits, b, e);
        Self::clear_bits(&self.end_bits, b, e);
    }

    /// Whether no bit is set anywhere.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.beg_bits
            .iter()
            .chain(self.end_bits.iter())
            .all(|w| w.load(Ordering::Relaxed) == 0)
    }

    /// Assert that no bit is set anywhere.
    ///
    /// # Panics
    ///
    /// Panics if a mark survived the last clear.
    pub fn verify_clear(&self) {
        assert!(self.is_clear(), "mark bitmap is not clear");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn bitmap() -> ParMarkBitmap {
        ParMarkBitmap::new(HeapWord::new(64), 512).unwrap()
    }

    fn at(offset: usize) -> HeapWord {
        HeapWord::new(64 + offset)
    }

    struct Collect {
        seen: Vec<(HeapWord, usize)>,
        budget: usize,
        source: HeapWord,
    }

    impl ParMarkBitmapClosure for Collect {
        fn do_addr(&mut self, addr: HeapWord, words: usize) -> IterationStatus {
            if words > self.budget {
                return IterationStatus::WouldOverflow;
            }
            self.budget -= words;
            self.seen.push((addr, words));
            if self.budget == 0 {
                IterationStatus::Full
            } else {
                IterationStatus::Incomplete
            }
        }

        fn set_source(&mut self, addr: HeapWord) {
            self.source = addr;
        }
    }

    #[test]
    fn test_find_across_words() {
        let bm = bitmap();
        bm.mark_obj(at(3), 2);
        bm.mark_obj(at(130), 70);
        assert_eq!(bm.find_obj_beg(at(0), at(512)), at(3));
        assert_eq!(bm.find_obj_beg(at(4), at(512)), at(130));
        assert_eq!(bm.find_obj_beg(at(131), at(512)), at(512));
        assert_eq!(bm.find_obj_end(at(130), at(512)), at(199));
        assert_eq!(bm.find_obj_end(at(130), at(150)), at(150));
        assert_eq!(bm.obj_size(at(130)), 70);
        assert!(bm.is_obj_end(at(4)));
        assert!(bm.is_unmarked(at(4)));
    }

    #[test]
    fn test_live_words_skip_partial_object() {
        let bm = bitmap();
        bm.mark_obj(at(0), 10);
        bm.mark_obj(at(10), 4);
        bm.mark_obj(at(20), 6);
        assert_eq!(bm.live_words_in_range(at(0), at(20)), 14);
        // Starting inside the first object only counts later starts.
        assert_eq!(bm.live_words_in_range(at(5), at(20)), 4);
        assert_eq!(bm.live_words_in_range(at(5), at(21)), 10);
        assert_eq!(bm.live_words_in_range(at(0), at(0)), 0);
    }

    #[test]
    fn test_iterate_statuses() {
        let bm = bitmap();
        bm.mark_obj(at(0), 4);
        bm.mark_obj(at(8), 4);
        bm.mark_obj(at(14), 10);

        let mut c = Collect { seen: Vec::new(), budget: 100, source: HeapWord::NULL };
        assert_eq!(bm.iterate(&mut c, at(0), at(20)), IterationStatus::Incomplete);
        assert_eq!(c.seen, vec![(at(0), 4), (at(8), 4)]);
        assert_eq!(c.source, at(14));

        let mut c = Collect { seen: Vec::new(), budget: 100, source: HeapWord::NULL };
        assert_eq!(bm.iterate(&mut c, at(0), at(30)), IterationStatus::Complete);
        assert_eq!(c.seen.len(), 3);
        assert_eq!(c.source, at(30));

        let mut c = Collect { seen: Vec::new(), budget: 8, source: HeapWord::NULL };
        assert_eq!(bm.iterate(&mut c, at(0), at(30)), IterationStatus::Full);

        let mut c = Collect { seen: Vec::new(), budget: 10, source: HeapWord::NULL };
        assert_eq!(bm.iterate(&mut c, at(0), at(30)), IterationStatus::WouldOverflow);
        assert_eq!(c.seen.len(), 2);
    }

    #[test]
    fn test_clear_range_partial_words() {
        let bm = bitmap();
        bm.mark_obj(at(1), 2);
        bm.mark_obj(at(63), 3);
        bm.mark_obj(at(200), 100);
        bm.clear_range(at(60), at(320));
        assert!(bm.is_marked(at(1)));
        assert!(bm.is_unmarked(at(63)));
        assert!(bm.is_unmarked(at(200)));
        assert!(!bm.is_obj_end(at(299)));
        bm.clear_range(at(0), at(512));
        assert!(bm.is_clear());
        bm.verify_clear();
    }

    #[test]
    fn test_concurrent_mark_single_winner() {
        let bm = Arc::new(bitmap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bm = Arc::clone(&bm);
                thread::spawn(move || (0..64).filter(|i| bm.mark_obj(at(i * 8), 8)).count())
            })
            .collect();
        let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(wins, 64);
        assert_eq!(bm.live_words_in_range(at(0), at(512)), 512);
    }
}
