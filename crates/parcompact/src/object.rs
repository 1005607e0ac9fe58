//! Object model.
//!
//! The collector never interprets object contents itself. It asks an
//! [`ObjectModel`] for an object's size, for the addresses of its reference
//! slots, and for access to its mark word. The model also creates filler
//! objects over dead space so the heap stays parsable.
//!
//! Mark words whose two low bits are `0b11` are reserved for the collector:
//! the serial collector stores forwarding addresses there while it runs.
//!
//! [`HeaderLayout`] is the model used by the tests and benchmarks:
//!
//! ```text
//! word 0      mark word
//! word 1      layout: size in words (low 32 bits) | reference count (high 32 bits)
//! word 2..    reference slots, then plain data
//! ```

use crate::heap::{Heap, HeapWord, SpaceId};

/// Capability interface over object layout.
pub trait ObjectModel: Send + Sync {
    /// Size of the object at `obj` in words.
    fn size_of(&self, heap: &Heap, obj: HeapWord) -> usize;

    /// Call `f` with the address of each reference slot of `obj`.
    fn oop_iterate<F: FnMut(HeapWord)>(&self, heap: &Heap, obj: HeapWord, f: F);

    /// The mark word of `obj`.
    fn mark(&self, heap: &Heap, obj: HeapWord) -> u64 {
        heap.load(obj)
    }

    /// Overwrite the mark word of `obj`.
    fn set_mark(&self, heap: &Heap, obj: HeapWord, mark: u64) {
        heap.store(obj, mark);
    }

    /// The mark word of a freshly initialized object.
    fn prototype_mark(&self) -> u64;

    /// Whether `mark` carries state that must survive the mark word being
    /// overwritten.
    fn must_be_preserved(&self, mark: u64) -> bool {
        mark != self.prototype_mark()
    }

    /// Smallest object the model can represent.
    fn min_fill_size(&self) -> usize;

    /// Format `[addr, addr + words)` as a dead filler object.
    fn fill_with_object(&self, heap: &Heap, addr: HeapWord, words: usize);
}

const SIZE_MASK: u64 = 0xffff_ffff;
const REFS_SHIFT: u32 = 32;
const HASH_SHIFT: u32 = 8;

/// Two-word header object model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderLayout;

impl HeaderLayout {
    /// Header words preceding the reference slots.
    pub const HEADER_WORDS: usize = 2;

    /// Mark word of an unlocked object without an identity hash.
    pub const PROTOTYPE_MARK: u64 = 0b01;

    /// Words needed for an object with `refs` references and `data` data words.
    #[must_use]
    pub const fn object_words(refs: usize, data: usize) -> usize {
        Self::HEADER_WORDS + refs + data
    }

    /// Write a header for an object of `refs` null references and `data` zeroed
    /// data words at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the object would not fit the layout word.
    pub fn init(heap: &Heap, addr: HeapWord, refs: usize, data: usize) {
        let size = Self::object_words(refs, data);
        assert!(
            u32::try_from(size).is_ok() && u32::try_from(refs).is_ok(),
            "object too large"
        );
        heap.store(addr, Self::PROTOTYPE_MARK);
        heap.store(addr + 1, (refs as u64) << REFS_SHIFT | size as u64);
        for i in Self::HEADER_WORDS..size {
            heap.store(addr + i, 0);
        }
    }

    /// Allocate and initialize an object in `space`.
    pub fn allocate(heap: &Heap, space: SpaceId, refs: usize, data: usize) -> Option<HeapWord> {
        let addr = heap.allocate(space, Self::object_words(refs, data))?;
        Self::init(heap, addr, refs, data);
        Some(addr)
    }

    /// Number of reference slots of `obj`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn ref_count(heap: &Heap, obj: HeapWord) -> usize {
        (heap.load(obj + 1) >> REFS_SHIFT) as usize
    }

    /// Address of reference slot `index` of `obj`.
    #[must_use]
    pub const fn ref_slot(obj: HeapWord, index: usize) -> HeapWord {
        HeapWord::new(obj.raw() + Self::HEADER_WORDS + index)
    }

    /// Read reference `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn get_ref(heap: &Heap, obj: HeapWord, index: usize) -> HeapWord {
        assert!(index < Self::ref_count(heap, obj), "reference index out of bounds");
        heap.load_ref(Self::ref_slot(obj, index))
    }

    /// Store `target` into reference `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set_ref(heap: &Heap, obj: HeapWord, index: usize, target: HeapWord) {
        assert!(index < Self::ref_count(heap, obj), "reference index out of bounds");
        heap.store_ref(Self::ref_slot(obj, index), target);
    }

    fn data_slot(heap: &Heap, obj: HeapWord, index: usize) -> HeapWord {
        let refs = Self::ref_count(heap, obj);
        let size = Self::size(heap, obj);
        assert!(
            Self::HEADER_WORDS + refs + index < size,
            "data index out of bounds"
        );
        obj + Self::HEADER_WORDS + refs + index
    }

    /// Read data word `index` of `obj`.
    #[must_use]
    pub fn get_data(heap: &Heap, obj: HeapWord, index: usize) -> u64 {
        heap.load(Self::data_slot(heap, obj, index))
    }

    /// Write data word `index` of `obj`.
    pub fn set_data(heap: &Heap, obj: HeapWord, index: usize, value: u64) {
        heap.store(Self::data_slot(heap, obj, index), value);
    }

    /// Install an identity hash in the mark word of `obj`.
    pub fn set_hash(heap: &Heap, obj: HeapWord, hash: u32) {
        heap.store(obj, u64::from(hash) << HASH_SHIFT | Self::PROTOTYPE_MARK);
    }

    /// The identity hash of `obj`, if one was installed.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn hash(heap: &Heap, obj: HeapWord) -> Option<u32> {
        let hash = (heap.load(obj) >> HASH_SHIFT) as u32;
        (hash != 0).then_some(hash)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn size(heap: &Heap, obj: HeapWord) -> usize {
        (heap.load(obj + 1) & SIZE_MASK) as usize
    }
}

impl ObjectModel for HeaderLayout {
    fn size_of(&self, heap: &Heap, obj: HeapWord) -> usize {
        Self::size(heap, obj)
    }

    fn oop_iterate<F: FnMut(HeapWord)>(&self, heap: &Heap, obj: HeapWord, mut f: F) {
        for i in 0..Self::ref_count(heap, obj) {
            f(Self::ref_slot(obj, i));
        }
    }

    fn prototype_mark(&self) -> u64 {
        Self::PROTOTYPE_MARK
    }

    fn min_fill_size(&self) -> usize {
        Self::HEADER_WORDS
    }

    fn fill_with_object(&self, heap: &Heap, addr: HeapWord, words: usize) {
        assert!(words >= Self::HEADER_WORDS, "filler of {words} words is too small");
        heap.store(addr, Self::PROTOTYPE_MARK);
        heap.store(addr + 1, words as u64);
    }
}
