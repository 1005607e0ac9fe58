//! Side table of mark words that must survive forwarding.
//!
//! The serial collector overwrites the mark word of every live object with
//! its forwarding address. Marks carrying state (an identity hash, say) are
//! saved here first, follow their object to its new address, and are written
//! back once every object has moved.

use crate::heap::{Heap, HeapWord};
use crate::object::ObjectModel;

/// Saved `(object, mark)` pairs.
#[derive(Debug, Default)]
pub struct PreservedMarks {
    entries: Vec<(HeapWord, u64)>,
}

impl PreservedMarks {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Save `mark` for `obj`.
    pub fn push(&mut self, obj: HeapWord, mark: u64) {
        self.entries.push((obj, mark));
    }

    /// Number of saved marks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite each saved object address with `new_location`.
    pub fn adjust<F: FnMut(HeapWord) -> HeapWord>(&mut self, mut new_location: F) {
        for (obj, _) in &mut self.entries {
            *obj = new_location(*obj);
        }
    }

    /// Write every saved mark back and empty the table.
    pub fn restore<M: ObjectModel>(&mut self, heap: &Heap, model: &M) {
        for (obj, mark) in self.entries.drain(..) {
            model.set_mark(heap, obj, mark);
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{HeapLayout, SpaceId};
    use crate::object::HeaderLayout;

    #[test]
    fn test_restore_at_adjusted_address() {
        let heap = Heap::new(HeapLayout::old_only(128), 64).unwrap();
        let a = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 2).unwrap();
        let b = HeaderLayout::allocate(&heap, SpaceId::Old, 0, 2).unwrap();
        HeaderLayout::set_hash(&heap, b, 77);
        let mark = HeaderLayout.mark(&heap, b);

        let mut preserved = PreservedMarks::new();
        preserved.push(b, mark);
        heap.copy_conjoint(b, a, 4);
        preserved.adjust(|obj| if obj == b { a } else { obj });
        HeaderLayout.set_mark(&heap, a, HeaderLayout::PROTOTYPE_MARK);

        preserved.restore(&heap, &HeaderLayout);
        assert!(preserved.is_empty());
        assert_eq!(HeaderLayout::hash(&heap, a), Some(77));
    }
}
