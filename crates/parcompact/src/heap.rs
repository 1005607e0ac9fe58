//! Word-addressed heap and its spaces.
//!
//! The heap is one contiguous range of words split into four spaces laid out
//! in address order: old, eden, from, to. Addresses are word indices
//! ([`HeapWord`]); the heap starts at a nonzero, region-aligned address so that
//! address 0 can serve as null.
//!
//! Every word is an [`AtomicU64`]. Collector phases hand out disjoint address
//! ranges to workers, so `Relaxed` loads and stores are sufficient for heap
//! contents; cross-thread ordering comes from the region claim protocol and
//! from joining worker threads between phases.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use vspace::WordStorage;

use crate::error::SetupError;

// ============================================================================
// HeapWord
// ============================================================================

/// The address of a heap word, in words.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct HeapWord(usize);

impl HeapWord {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Create an address from a raw word index.
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw word index.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Whether this is the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Number of words from `lower` up to `self`.
    ///
    /// # Panics
    ///
    /// Panics if `lower > self`.
    #[must_use]
    pub const fn delta(self, lower: Self) -> usize {
        assert!(lower.0 <= self.0, "negative pointer delta");
        self.0 - lower.0
    }

    /// Encode as a reference value stored in a heap slot.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0 as u64
    }

    /// Decode a reference value read from a heap slot.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits as usize)
    }
}

impl Add<usize> for HeapWord {
    type Output = Self;

    fn add(self, words: usize) -> Self {
        Self(self.0 + words)
    }
}

impl AddAssign<usize> for HeapWord {
    fn add_assign(&mut self, words: usize) {
        self.0 += words;
    }
}

impl Sub<usize> for HeapWord {
    type Output = Self;

    fn sub(self, words: usize) -> Self {
        Self(self.0 - words)
    }
}

impl fmt::Debug for HeapWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapWord({:#x})", self.0)
    }
}

impl fmt::Display for HeapWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ============================================================================
// Spaces
// ============================================================================

/// Identifies one of the four heap spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SpaceId {
    /// The old generation.
    Old = 0,
    /// Young generation allocation space.
    Eden = 1,
    /// Young generation survivor space currently holding survivors.
    From = 2,
    /// Young generation survivor space, normally empty.
    To = 3,
}

impl SpaceId {
    /// Number of spaces.
    pub const COUNT: usize = 4;

    /// All spaces in address (and summary) order.
    pub const ALL: [Self; Self::COUNT] = [Self::Old, Self::Eden, Self::From, Self::To];

    /// Position in [`SpaceId::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The space following this one in address order.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Old => Some(Self::Eden),
            Self::Eden => Some(Self::From),
            Self::From => Some(Self::To),
            Self::To => None,
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Old => "old",
            Self::Eden => "eden",
            Self::From => "from",
            Self::To => "to",
        }
    }
}

/// A contiguous space `[bottom, end)` with an allocation top.
#[derive(Debug)]
pub struct MutableSpace {
    id: SpaceId,
    bottom: HeapWord,
    end: HeapWord,
    top: AtomicUsize,
}

impl MutableSpace {
    fn new(id: SpaceId, bottom: HeapWord, end: HeapWord) -> Self {
        Self {
            id,
            bottom,
            end,
            top: AtomicUsize::new(bottom.raw()),
        }
    }

    /// Which space this is.
    #[must_use]
    pub const fn id(&self) -> SpaceId {
        self.id
    }

    /// First word of the space.
    #[must_use]
    pub const fn bottom(&self) -> HeapWord {
        self.bottom
    }

    /// One past the last word of the space.
    #[must_use]
    pub const fn end(&self) -> HeapWord {
        self.end
    }

    /// One past the last allocated word.
    #[must_use]
    pub fn top(&self) -> HeapWord {
        HeapWord(self.top.load(Ordering::Acquire))
    }

    /// Publish a new allocation top.
    ///
    /// # Panics
    ///
    /// Panics if `top` lies outside `[bottom, end]`.
    pub fn set_top(&self, top: HeapWord) {
        assert!(
            self.bottom <= top && top <= self.end,
            "top {top} outside {} space [{}, {}]",
            self.id.name(),
            self.bottom,
            self.end
        );
        self.top.store(top.raw(), Ordering::Release);
    }

    /// Words in `[bottom, top)`.
    #[must_use]
    pub fn used_in_words(&self) -> usize {
        self.top().delta(self.bottom)
    }

    /// Words in `[bottom, end)`.
    #[must_use]
    pub const fn capacity_in_words(&self) -> usize {
        self.end.0 - self.bottom.0
    }

    /// Words in `[top, end)`.
    #[must_use]
    pub fn free_in_words(&self) -> usize {
        self.end.delta(self.top())
    }

    /// Whether nothing is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Whether `addr` lies in `[bottom, end)`.
    #[must_use]
    pub fn contains(&self, addr: HeapWord) -> bool {
        self.bottom <= addr && addr < self.end
    }

    /// Bump-allocate `words` words.
    pub fn allocate(&self, words: usize) -> Option<HeapWord> {
        let end = self.end.raw();
        self.top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                top.checked_add(words).filter(|&new_top| new_top <= end)
            })
            .ok()
            .map(HeapWord)
    }
}

// ============================================================================
// HeapLayout
// ============================================================================

/// Sizes, in words, of the four spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    /// Old generation size.
    pub old_words: usize,
    /// Eden size.
    pub eden_words: usize,
    /// From-space size.
    pub from_words: usize,
    /// To-space size.
    pub to_words: usize,
}

impl HeapLayout {
    /// A heap with only an old space.
    #[must_use]
    pub const fn old_only(old_words: usize) -> Self {
        Self {
            old_words,
            eden_words: 0,
            from_words: 0,
            to_words: 0,
        }
    }

    /// Set the young generation space sizes.
    #[must_use]
    pub const fn with_young(mut self, eden_words: usize, from_words: usize, to_words: usize) -> Self {
        self.eden_words = eden_words;
        self.from_words = from_words;
        self.to_words = to_words;
        self
    }

    const fn words(&self, id: SpaceId) -> usize {
        match id {
            SpaceId::Old => self.old_words,
            SpaceId::Eden => self.eden_words,
            SpaceId::From => self.from_words,
            SpaceId::To => self.to_words,
        }
    }

    /// Total heap size in words.
    #[must_use]
    pub const fn total_words(&self) -> usize {
        self.old_words + self.eden_words + self.from_words + self.to_words
    }
}

// ============================================================================
// Heap
// ============================================================================

/// The collected heap.
pub struct Heap {
    storage: WordStorage,
    base: HeapWord,
    region_words: usize,
    spaces: [MutableSpace; SpaceId::COUNT],
}

impl Heap {
    /// Reserve and commit a heap with the given layout.
    ///
    /// `region_words` must be the region size the collector will run with;
    /// every space size must be a multiple of it.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if a space is misaligned, the old space is
    /// empty, or the backing memory cannot be reserved.
    pub fn new(layout: HeapLayout, region_words: usize) -> Result<Self, SetupError> {
        if !region_words.is_power_of_two() {
            return Err(SetupError::InvalidConfig(format!(
                "region size {region_words} is not a power of two"
            )));
        }
        if layout.old_words == 0 {
            return Err(SetupError::EmptyOldSpace);
        }
        for id in SpaceId::ALL {
            let words = layout.words(id);
            if words % region_words != 0 {
                return Err(SetupError::MisalignedSpace {
                    space: id.name(),
                    words,
                    region_words,
                });
            }
        }

        let storage = WordStorage::new(layout.total_words())
            .map_err(|e| SetupError::reserve("heap", e))?;

        let base = HeapWord(region_words);
        let mut bottom = base;
        let spaces = SpaceId::ALL.map(|id| {
            let end = bottom + layout.words(id);
            let space = MutableSpace::new(id, bottom, end);
            bottom = end;
            space
        });

        Ok(Self {
            storage,
            base,
            region_words,
            spaces,
        })
    }

    /// Lowest heap address.
    #[must_use]
    pub const fn base(&self) -> HeapWord {
        self.base
    }

    /// One past the highest heap address.
    #[must_use]
    pub fn end(&self) -> HeapWord {
        self.base + self.storage.len()
    }

    /// Heap size in words.
    #[must_use]
    pub fn capacity_in_words(&self) -> usize {
        self.storage.len()
    }

    /// Region size the heap was laid out with.
    #[must_use]
    pub const fn region_words(&self) -> usize {
        self.region_words
    }

    /// Whether `addr` lies inside the heap.
    #[must_use]
    pub fn contains(&self, addr: HeapWord) -> bool {
        self.base <= addr && addr < self.end()
    }

    /// The space with the given id.
    #[must_use]
    pub const fn space(&self, id: SpaceId) -> &MutableSpace {
        &self.spaces[id.index()]
    }

    /// All spaces in address order.
    #[must_use]
    pub const fn spaces(&self) -> &[MutableSpace; SpaceId::COUNT] {
        &self.spaces
    }

    /// The space containing `addr`, if any.
    #[must_use]
    pub fn space_containing(&self, addr: HeapWord) -> Option<SpaceId> {
        self.spaces.iter().find(|s| s.contains(addr)).map(MutableSpace::id)
    }

    /// Total words allocated across all spaces.
    #[must_use]
    pub fn used_in_words(&self) -> usize {
        self.spaces.iter().map(MutableSpace::used_in_words).sum()
    }

    /// The atomic cell backing the word at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the heap.
    #[must_use]
    pub fn word(&self, addr: HeapWord) -> &AtomicU64 {
        &self.storage[addr.delta(self.base)]
    }

    /// Read the word at `addr`.
    #[must_use]
    pub fn load(&self, addr: HeapWord) -> u64 {
        self.word(addr).load(Ordering::Relaxed)
    }

    /// Write the word at `addr`.
    pub fn store(&self, addr: HeapWord, value: u64) {
        self.word(addr).store(value, Ordering::Relaxed);
    }

    /// Read the reference held in slot `slot`.
    #[must_use]
    pub fn load_ref(&self, slot: HeapWord) -> HeapWord {
        HeapWord::from_bits(self.load(slot))
    }

    /// Write a reference into slot `slot`.
    pub fn store_ref(&self, slot: HeapWord, target: HeapWord) {
        self.store(slot, target.to_bits());
    }

    /// Copy `words` words from `from` to `to`; the ranges may overlap.
    pub fn copy_conjoint(&self, from: HeapWord, to: HeapWord, words: usize) {
        if from == to || words == 0 {
            return;
        }
        let src = &self.storage[from.delta(self.base)..from.delta(self.base) + words];
        let dst = &self.storage[to.delta(self.base)..to.delta(self.base) + words];
        if to < from {
            for (d, s) in dst.iter().zip(src) {
                d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        } else {
            for (d, s) in dst.iter().zip(src).rev() {
                d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        }
    }

    /// Bump-allocate `words` words in space `id`.
    pub fn allocate(&self, id: SpaceId, words: usize) -> Option<HeapWord> {
        self.space(id).allocate(words)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("words", &self.storage.len())
            .field("spaces", &self.spaces)
            .finish()
    }
}
