//! Bookkeeping for a source region whose data was split between two
//! destination areas.
//!
//! When the data of a source region does not fit in what is left of the target
//! space, the summary phase splits it right after the partial object that
//! crosses onto the region. The partial object is copied to the first target;
//! everything after it goes elsewhere. [`SplitInfo`] remembers where the partial
//! object goes so the fill of the destination region that receives it can find
//! its first source word.

use crate::heap::HeapWord;
use crate::summary::SummaryData;

/// Record of one split per space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitInfo {
    src_region_idx: Option<usize>,
    partial_obj_size: usize,
    destination: HeapWord,
    destination_count: u32,
    dest_region_addr: HeapWord,
    first_src_addr: HeapWord,
}

impl SplitInfo {
    /// Record that the `partial_obj_size` words at the start of region
    /// `src_region_idx` are copied to `destination`.
    ///
    /// # Panics
    ///
    /// Panics if a split is already recorded or `partial_obj_size` is zero.
    pub fn record(
        &mut self,
        sd: &SummaryData,
        src_region_idx: usize,
        partial_obj_size: usize,
        destination: HeapWord,
    ) {
        assert!(partial_obj_size != 0, "a split needs a partial object");
        assert!(!destination.is_null(), "a split needs a destination");
        assert!(self.is_clear(), "split already recorded");

        self.src_region_idx = Some(src_region_idx);
        self.partial_obj_size = partial_obj_size;
        self.destination = destination;

        let last_word = destination + partial_obj_size - 1;
        let beg_region_addr = sd.region_align_down(destination);
        let end_region_addr = sd.region_align_down(last_word);

        if beg_region_addr == end_region_addr {
            self.destination_count = 1;
            if end_region_addr == destination {
                // The partial object is the first data copied to its
                // destination region.
                self.dest_region_addr = end_region_addr;
                self.first_src_addr = sd.region_to_addr(src_region_idx);
            }
        } else {
            // The partial object crosses a destination region boundary; some
            // word inside it is the first one copied to the second region.
            self.destination_count = 2;
            self.dest_region_addr = end_region_addr;
            let ofs = end_region_addr.delta(destination);
            debug_assert!(ofs < partial_obj_size);
            self.first_src_addr = sd.region_to_addr(src_region_idx) + ofs;
        }
    }

    /// Whether a split is recorded.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.src_region_idx.is_some()
    }

    /// Whether `region_idx` is the split source region.
    #[must_use]
    pub fn is_split(&self, region_idx: usize) -> bool {
        self.src_region_idx == Some(region_idx)
    }

    /// Source region of the split.
    #[must_use]
    pub const fn src_region_idx(&self) -> Option<usize> {
        self.src_region_idx
    }

    /// Size of the partial object moved to the first target.
    #[must_use]
    pub const fn partial_obj_size(&self) -> usize {
        self.partial_obj_size
    }

    /// Where the partial object is copied.
    #[must_use]
    pub const fn destination(&self) -> HeapWord {
        self.destination
    }

    /// Destination regions touched by the partial object (1 or 2).
    #[must_use]
    pub const fn destination_count(&self) -> u32 {
        self.destination_count
    }

    /// Destination region whose first word comes from inside the partial
    /// object, or null.
    #[must_use]
    pub const fn dest_region_addr(&self) -> HeapWord {
        self.dest_region_addr
    }

    /// Source address of the first word copied to
    /// [`dest_region_addr`](Self::dest_region_addr), or null.
    #[must_use]
    pub const fn first_src_addr(&self) -> HeapWord {
        self.first_src_addr
    }

    /// Forget the split.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether every field is zero.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}
