//! Region and block summary table.
//!
//! The covered heap is divided into fixed-size regions, and each region into
//! blocks. Marking records, per region, how many live words start in it and
//! which object (if any) crosses onto it from the left. The summary phase then
//! assigns every region a destination, and `calc_new_pointer` turns any live
//! address into its post-compaction address from that information plus the
//! mark bitmap, without ever storing a forwarding pointer per object.
//!
//! Every field is atomic. During marking, regions are updated concurrently by
//! the threads that win the mark of an object; during compaction the claim
//! state and destination counts drive the fill protocol. Summarizing is
//! single-threaded.

use std::collections::TryReserveError;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::bitmap::ParMarkBitmap;
use crate::error::SetupError;
use crate::heap::HeapWord;
use crate::split_info::SplitInfo;

// ============================================================================
// RegionData
// ============================================================================

/// Fill state of a destination region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClaimState {
    /// Nobody has taken the region yet.
    Unclaimed = 0,
    /// A worker owns the region and is filling it.
    Claimed = 1,
    /// The region holds its final contents.
    Completed = 2,
}

impl ClaimState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unclaimed,
            1 => Self::Claimed,
            _ => Self::Completed,
        }
    }
}

/// Per-region summary.
#[derive(Debug, Default)]
pub struct RegionData {
    destination: AtomicUsize,
    // Region index plus one; zero means none.
    source_region: AtomicUsize,
    partial_obj_addr: AtomicUsize,
    partial_obj_size: AtomicUsize,
    live_obj_size: AtomicUsize,
    destination_count: AtomicU32,
    claim: AtomicU8,
    blocks_filled: AtomicBool,
    deferred_obj_addr: AtomicUsize,
}

impl RegionData {
    /// Where the first live word of this region is copied.
    #[must_use]
    pub fn destination(&self) -> HeapWord {
        HeapWord::new(self.destination.load(Ordering::Relaxed))
    }

    /// Set the destination.
    pub fn set_destination(&self, addr: HeapWord) {
        self.destination.store(addr.raw(), Ordering::Relaxed);
    }

    /// The leftmost source region copied into this region.
    #[must_use]
    pub fn source_region(&self) -> Option<usize> {
        self.source_region.load(Ordering::Relaxed).checked_sub(1)
    }

    /// Set or clear the source region.
    pub fn set_source_region(&self, region: Option<usize>) {
        self.source_region
            .store(region.map_or(0, |r| r + 1), Ordering::Relaxed);
    }

    /// Start of the object that crosses onto this region from the left.
    #[must_use]
    pub fn partial_obj_addr(&self) -> HeapWord {
        HeapWord::new(self.partial_obj_addr.load(Ordering::Relaxed))
    }

    /// Words of the crossing object that lie in this region.
    #[must_use]
    pub fn partial_obj_size(&self) -> usize {
        self.partial_obj_size.load(Ordering::Relaxed)
    }

    /// Set the crossing object size.
    pub fn set_partial_obj_size(&self, words: usize) {
        self.partial_obj_size.store(words, Ordering::Relaxed);
    }

    fn set_partial_obj_addr(&self, addr: HeapWord) {
        self.partial_obj_addr.store(addr.raw(), Ordering::Relaxed);
    }

    /// Live words of objects that start in this region.
    #[must_use]
    pub fn live_obj_size(&self) -> usize {
        self.live_obj_size.load(Ordering::Relaxed)
    }

    /// Overwrite the live word count.
    pub fn set_live_obj_size(&self, words: usize) {
        self.live_obj_size.store(words, Ordering::Relaxed);
    }

    /// Add to the live word count.
    pub fn add_live_obj(&self, words: usize) {
        self.live_obj_size.fetch_add(words, Ordering::Relaxed);
    }

    /// Words this region contributes to its destination.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.partial_obj_size() + self.live_obj_size()
    }

    /// Destination regions (other than itself) this region still feeds.
    #[must_use]
    pub fn destination_count(&self) -> u32 {
        self.destination_count.load(Ordering::Acquire)
    }

    /// Set the destination count.
    ///
    /// A split source region can feed up to four destination regions: two
    /// for its partial object and two for the rest of its data.
    pub fn set_destination_count(&self, count: u32) {
        debug_assert!(count <= 4, "destination count {count} out of range");
        self.destination_count.store(count, Ordering::Release);
    }

    /// Note that one destination region finished reading from this region.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn decrement_destination_count(&self) -> u32 {
        let prev = self.destination_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "destination count underflow");
        prev - 1
    }

    /// Whether every region reading from this one is done with it.
    #[must_use]
    pub fn available(&self) -> bool {
        self.destination_count() == 0
    }

    /// Current claim state.
    #[must_use]
    pub fn claim_state(&self) -> ClaimState {
        ClaimState::from_u8(self.claim.load(Ordering::Acquire))
    }

    /// Whether a worker has claimed or completed the region.
    #[must_use]
    pub fn claimed(&self) -> bool {
        self.claim_state() != ClaimState::Unclaimed
    }

    /// Whether the region holds its final contents.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.claim_state() == ClaimState::Completed
    }

    /// Claim an available region; only valid while a single thread runs.
    pub fn claim_unsafe(&self) -> bool {
        if self.available() && self.claim_state() == ClaimState::Unclaimed {
            self.claim.store(ClaimState::Claimed as u8, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Atomically claim an available region.
    ///
    /// Fails if the region still has readers or someone else claimed it.
    pub fn claim(&self) -> bool {
        self.available()
            && self
                .claim
                .compare_exchange(
                    ClaimState::Unclaimed as u8,
                    ClaimState::Claimed as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    /// Mark the region filled.
    ///
    /// # Panics
    ///
    /// Panics if regions still read from this region.
    pub fn set_completed(&self) {
        assert_eq!(
            self.destination_count(),
            0,
            "completed region still has a nonzero destination count"
        );
        self.claim.store(ClaimState::Completed as u8, Ordering::Release);
    }

    /// Whether the block table of this region is populated.
    #[must_use]
    pub fn blocks_filled(&self) -> bool {
        self.blocks_filled.load(Ordering::Acquire)
    }

    fn set_blocks_filled(&self) {
        self.blocks_filled.store(true, Ordering::Release);
    }

    /// Destination of the object that straddles the end of this region, or null.
    #[must_use]
    pub fn deferred_obj_addr(&self) -> HeapWord {
        HeapWord::new(self.deferred_obj_addr.load(Ordering::Relaxed))
    }

    /// Set or clear the deferred object.
    pub fn set_deferred_obj_addr(&self, addr: HeapWord) {
        self.deferred_obj_addr.store(addr.raw(), Ordering::Relaxed);
    }

    fn reset(&self) {
        self.destination.store(0, Ordering::Relaxed);
        self.source_region.store(0, Ordering::Relaxed);
        self.partial_obj_addr.store(0, Ordering::Relaxed);
        self.partial_obj_size.store(0, Ordering::Relaxed);
        self.live_obj_size.store(0, Ordering::Relaxed);
        self.destination_count.store(0, Ordering::Relaxed);
        self.claim.store(0, Ordering::Relaxed);
        self.blocks_filled.store(false, Ordering::Relaxed);
        self.deferred_obj_addr.store(0, Ordering::Relaxed);
    }

    fn is_clear(&self) -> bool {
        self.destination.load(Ordering::Relaxed) == 0
            && self.source_region.load(Ordering::Relaxed) == 0
            && self.partial_obj_addr.load(Ordering::Relaxed) == 0
            && self.partial_obj_size() == 0
            && self.live_obj_size() == 0
            && self.destination_count() == 0
            && self.claim_state() == ClaimState::Unclaimed
            && !self.blocks_filled()
            && self.deferred_obj_addr().is_null()
    }
}

/// Per-block summary: live words in the region to the left of the first
/// object that starts in the block.
#[derive(Debug, Default)]
pub struct BlockData {
    offset: AtomicU32,
}

impl BlockData {
    /// The recorded offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Relaxed) as usize
    }

    fn set_offset(&self, words: usize) {
        let words = u32::try_from(words).unwrap_or(u32::MAX);
        self.offset.store(words, Ordering::Relaxed);
    }
}

// ============================================================================
// SummaryData
// ============================================================================

/// Result of [`SummaryData::summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeOutcome {
    /// The whole source range fit; the target's next free word.
    Complete {
        /// Next free word in the target.
        target_next: HeapWord,
    },
    /// The source range was split; summarizing must resume at `source_next`
    /// in another target.
    Split {
        /// First source word that still needs a destination.
        source_next: HeapWord,
        /// Next free word in the target after the split part.
        target_next: HeapWord,
    },
}

fn table_error(what: &'static str, err: &TryReserveError) -> SetupError {
    SetupError::reserve(what, io::Error::new(io::ErrorKind::OutOfMemory, err.to_string()))
}

fn allocate_table<T: Default>(what: &'static str, len: usize) -> Result<Box<[T]>, SetupError> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|e| table_error(what, &e))?;
    table.resize_with(len, T::default);
    Ok(table.into_boxed_slice())
}

/// The summary table over a contiguous, region-aligned address range.
pub struct SummaryData {
    region_start: HeapWord,
    region_end: HeapWord,
    log2_region_words: u32,
    log2_block_words: u32,
    regions: Box<[RegionData]>,
    blocks: Box<[BlockData]>,
}

impl SummaryData {
    /// Build a table covering `[region_start, region_start + covered_words)`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if the range is not region aligned, blocks do
    /// not divide regions, or the table cannot be allocated.
    pub fn new(
        region_start: HeapWord,
        covered_words: usize,
        log2_region_words: u32,
        log2_block_words: u32,
    ) -> Result<Self, SetupError> {
        if log2_block_words > log2_region_words {
            return Err(SetupError::InvalidConfig(
                "blocks must not be larger than regions".into(),
            ));
        }
        let region_words = 1usize << log2_region_words;
        if region_start.raw() % region_words != 0 || covered_words % region_words != 0 {
            return Err(SetupError::InvalidConfig(
                "summary table range must be region aligned".into(),
            ));
        }
        let region_count = covered_words >> log2_region_words;
        let block_count = covered_words >> log2_block_words;
        Ok(Self {
            region_start,
            region_end: region_start + covered_words,
            log2_region_words,
            log2_block_words,
            regions: allocate_table("region table", region_count)?,
            blocks: allocate_table("block table", block_count)?,
        })
    }

    /// Words per region.
    #[must_use]
    pub const fn region_words(&self) -> usize {
        1 << self.log2_region_words
    }

    /// Words per block.
    #[must_use]
    pub const fn block_words(&self) -> usize {
        1 << self.log2_block_words
    }

    /// Number of regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// First covered address.
    #[must_use]
    pub const fn region_start(&self) -> HeapWord {
        self.region_start
    }

    /// One past the last covered address.
    #[must_use]
    pub const fn region_end(&self) -> HeapWord {
        self.region_end
    }

    /// Region `idx`.
    #[must_use]
    pub fn region(&self, idx: usize) -> &RegionData {
        &self.regions[idx]
    }

    /// Block `idx`.
    #[must_use]
    pub fn block(&self, idx: usize) -> &BlockData {
        &self.blocks[idx]
    }

    /// Index of the region containing `addr`; `region_end()` maps to
    /// `region_count()`.
    #[must_use]
    pub fn addr_to_region_idx(&self, addr: HeapWord) -> usize {
        let idx = addr.delta(self.region_start) >> self.log2_region_words;
        debug_assert!(idx <= self.regions.len(), "address {addr} not covered");
        idx
    }

    /// First word of region `idx`.
    #[must_use]
    pub fn region_to_addr(&self, idx: usize) -> HeapWord {
        self.region_start + (idx << self.log2_region_words)
    }

    /// Offset of `addr` within its region.
    #[must_use]
    pub fn region_offset(&self, addr: HeapWord) -> usize {
        addr.delta(self.region_start) & (self.region_words() - 1)
    }

    /// Round `addr` down to a region boundary.
    #[must_use]
    pub fn region_align_down(&self, addr: HeapWord) -> HeapWord {
        addr - self.region_offset(addr)
    }

    /// Round `addr` up to a region boundary.
    #[must_use]
    pub fn region_align_up(&self, addr: HeapWord) -> HeapWord {
        self.region_align_down(addr + (self.region_words() - 1))
    }

    /// Whether `addr` is the first word of a region.
    #[must_use]
    pub fn is_region_aligned(&self, addr: HeapWord) -> bool {
        self.region_offset(addr) == 0
    }

    /// Index of the block containing `addr`.
    #[must_use]
    pub fn addr_to_block_idx(&self, addr: HeapWord) -> usize {
        addr.delta(self.region_start) >> self.log2_block_words
    }

    /// Round `addr` down to a block boundary.
    #[must_use]
    pub fn block_align_down(&self, addr: HeapWord) -> HeapWord {
        addr - (addr.delta(self.region_start) & (self.block_words() - 1))
    }

    /// Record a live object found by marking.
    pub fn add_obj(&self, addr: HeapWord, len: usize) {
        let beg_region = self.addr_to_region_idx(addr);
        let end_region = self.addr_to_region_idx(addr + (len - 1));

        if beg_region == end_region {
            self.regions[beg_region].add_live_obj(len);
            return;
        }

        // First region.
        let beg_ofs = self.region_offset(addr);
        self.regions[beg_region].add_live_obj(self.region_words() - beg_ofs);

        // Middle regions, completely spanned by this object.
        for region in &self.regions[beg_region + 1..end_region] {
            region.set_partial_obj_size(self.region_words());
            region.set_partial_obj_addr(addr);
        }

        // Last region.
        let end_ofs = self.region_offset(addr + (len - 1));
        self.regions[end_region].set_partial_obj_size(end_ofs + 1);
        self.regions[end_region].set_partial_obj_addr(addr);
    }

    /// End of the object (possibly spanning several regions) that crosses
    /// onto region `region_idx`.
    #[must_use]
    pub fn partial_obj_end(&self, region_idx: usize) -> HeapWord {
        let mut result = self.region_to_addr(region_idx);
        let last = self.regions.len() - 1;
        let mut cur = region_idx;
        if cur < last {
            loop {
                let partial = self.regions[cur].partial_obj_size();
                result += partial;
                cur += 1;
                if partial != self.region_words() || cur >= last {
                    break;
                }
            }
        }
        result
    }

    /// Reset regions `[beg_region, end_region)` and their blocks.
    pub fn clear_range(&self, beg_region: usize, end_region: usize) {
        for region in &self.regions[beg_region..end_region] {
            region.reset();
        }
        let shift = self.log2_region_words - self.log2_block_words;
        for block in &self.blocks[beg_region << shift..end_region << shift] {
            block.offset.store(0, Ordering::Relaxed);
        }
    }

    /// Reset every region overlapping `[beg, end)`.
    pub fn clear_range_addrs(&self, beg: HeapWord, end: HeapWord) {
        let beg_region = self.addr_to_region_idx(beg);
        let end_region = self.addr_to_region_idx(self.region_align_up(end));
        self.clear_range(beg_region, end_region);
    }

    /// Whether every region and block is zero.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.regions.iter().all(RegionData::is_clear)
            && self.blocks.iter().all(|b| b.offset() == 0)
    }

    /// Assert that every region and block is zero.
    ///
    /// # Panics
    ///
    /// Panics if summary data survived the last clear.
    pub fn verify_clear(&self) {
        assert!(self.is_clear(), "summary data is not clear");
    }

    /// Mark `[beg, end)` as a dense prefix: every region maps to itself and
    /// appears completely full.
    pub fn summarize_dense_prefix(&self, beg: HeapWord, end: HeapWord) {
        debug_assert!(self.is_region_aligned(beg) && self.is_region_aligned(end));
        let mut addr = beg;
        for idx in self.addr_to_region_idx(beg)..self.addr_to_region_idx(end) {
            let region = &self.regions[idx];
            region.set_destination(addr);
            region.set_destination_count(0);
            region.set_source_region(Some(idx));
            region.set_live_obj_size(self.region_words() - region.partial_obj_size());
            addr += self.region_words();
        }
    }

    /// Assign destinations in `[target_beg, target_end)` to the regions of
    /// `[source_beg, source_end)`, in region order.
    ///
    /// When a region's data does not fit, the source is split (see
    /// [`SplitInfo`]) and [`SummarizeOutcome::Split`] says where to resume.
    pub fn summarize(
        &self,
        split_info: &mut SplitInfo,
        source_beg: HeapWord,
        source_end: HeapWord,
        target_beg: HeapWord,
        target_end: HeapWord,
    ) -> SummarizeOutcome {
        let end_region = self.addr_to_region_idx(self.region_align_up(source_end));
        let mut dest_addr = target_beg;

        for cur in self.addr_to_region_idx(source_beg)..end_region {
            let region = &self.regions[cur];
            // The destination must be set even if the region has no data.
            region.set_destination(dest_addr);

            let words = region.data_size();
            if words == 0 {
                continue;
            }

            if dest_addr + words > target_end {
                let (source_next, target_next) =
                    self.summarize_split_space(cur, split_info, dest_addr, target_end);
                return SummarizeOutcome::Split {
                    source_next,
                    target_next,
                };
            }

            // A region compacting into itself does not count itself, so a
            // zero count always means the region may be claimed and filled.
            let mut destination_count = 0;
            if split_info.is_split(cur) {
                destination_count = split_info.destination_count();
                let split_dest = split_info.dest_region_addr();
                if !split_dest.is_null() {
                    self.regions[self.addr_to_region_idx(split_dest)].set_source_region(Some(cur));
                }
            }

            let dest_region_1 = self.addr_to_region_idx(dest_addr);
            let dest_region_2 = self.addr_to_region_idx(dest_addr + (words - 1));

            if cur != dest_region_2 {
                destination_count += 1;
            }
            if dest_region_1 != dest_region_2 {
                destination_count += 1;
                self.regions[dest_region_2].set_source_region(Some(cur));
            } else if self.is_region_aligned(dest_addr) {
                self.regions[dest_region_1].set_source_region(Some(cur));
            }

            region.set_destination_count(destination_count);
            dest_addr += words;
        }

        SummarizeOutcome::Complete {
            target_next: dest_addr,
        }
    }

    /// Split the source at region `src_region`, which does not fit at
    /// `destination`. Returns `(source_next, target_next)`.
    fn summarize_split_space(
        &self,
        src_region: usize,
        split_info: &mut SplitInfo,
        destination: HeapWord,
        target_end: HeapWord,
    ) -> (HeapWord, HeapWord) {
        debug_assert!(destination <= target_end);

        let mut split_region = src_region;
        let mut split_destination = destination;
        let mut partial_obj_size = self.regions[src_region].partial_obj_size();

        if destination + partial_obj_size > target_end {
            // The object crossing onto src_region overflows the target too.
            // Split just after the partial object in the region where that
            // object starts.
            let overflow_obj = self.regions[src_region].partial_obj_addr();
            split_region = self.addr_to_region_idx(overflow_obj);

            // Destination regions whose first word came from data after the
            // split point must not be filled from this source any more.
            let sr = &self.regions[split_region];
            let beg_idx =
                self.addr_to_region_idx(self.region_align_up(sr.destination() + sr.partial_obj_size()));
            let end_idx = self.addr_to_region_idx(target_end);
            for region in self.regions.get(beg_idx..end_idx).unwrap_or_default() {
                region.set_source_region(None);
            }

            split_destination = sr.destination();
            partial_obj_size = sr.partial_obj_size();
        }

        // Only a partial object needs to be remembered.
        if partial_obj_size != 0 {
            self.regions[split_region].set_partial_obj_size(0);
            split_info.record(self, split_region, partial_obj_size, split_destination);
        }

        let target_next = split_destination + partial_obj_size;
        let source_next = self.region_to_addr(split_region) + partial_obj_size;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            split_region,
            partial_obj_size,
            %source_next,
            %target_next,
            "summarize_split_space"
        );

        (source_next, target_next)
    }

    /// Populate the block table of region `region_idx`.
    ///
    /// Each block whose range contains an object start gets the live words
    /// of the region to the left of its first object. Racing fills write
    /// identical values.
    pub fn fill_blocks(&self, region_idx: usize, bitmap: &ParMarkBitmap) {
        let partial_obj_size = self.regions[region_idx].partial_obj_size();
        if partial_obj_size >= self.region_words() {
            // No object starts in this region.
            return;
        }

        let region_beg = self.region_to_addr(region_idx);
        let region_end = region_beg + self.region_words();
        let mut cur_block = usize::MAX;
        let mut live = partial_obj_size;
        let mut beg = bitmap.find_obj_beg(region_beg + partial_obj_size, region_end);
        while beg < region_end {
            let block = self.addr_to_block_idx(beg);
            if block != cur_block {
                cur_block = block;
                self.blocks[block].set_offset(live);
            }
            let end = bitmap.find_obj_end(beg, region_end);
            if end >= region_end - 1 {
                return;
            }
            live += end.delta(beg) + 1;
            beg = bitmap.find_obj_beg(end + 1, region_end);
        }
    }

    /// Post-compaction address of the live object at `addr`.
    #[must_use]
    pub fn calc_new_pointer(&self, addr: HeapWord, bitmap: &ParMarkBitmap) -> HeapWord {
        debug_assert!(!addr.is_null(), "null reference");
        let region_idx = self.addr_to_region_idx(addr);
        let region = &self.regions[region_idx];
        let destination = region.destination();

        // Completely live regions (including the dense prefix) keep the
        // relative offset of every object.
        if region.data_size() == self.region_words() {
            return destination + self.region_offset(addr);
        }

        if !region.blocks_filled() {
            self.fill_blocks(region_idx, bitmap);
            region.set_blocks_filled();
        }

        let search_start = self.block_align_down(addr);
        let block_offset = self.blocks[self.addr_to_block_idx(addr)].offset();
        let live = bitmap.live_words_in_range(search_start, addr);
        destination + block_offset + live
    }
}

impl std::fmt::Debug for SummaryData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryData")
            .field("region_start", &self.region_start)
            .field("region_end", &self.region_end)
            .field("region_words", &self.region_words())
            .field("block_words", &self.block_words())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R: usize = 64;

    // Eight 64-word regions over [64, 576), 8-word blocks.
    fn setup() -> (SummaryData, ParMarkBitmap) {
        let sd = SummaryData::new(HeapWord::new(R), 8 * R, 6, 3).unwrap();
        let bm = ParMarkBitmap::new(HeapWord::new(R), 8 * R).unwrap();
        (sd, bm)
    }

    fn at(offset: usize) -> HeapWord {
        HeapWord::new(R + offset)
    }

    fn mark(sd: &SummaryData, bm: &ParMarkBitmap, offset: usize, len: usize) {
        assert!(bm.mark_obj(at(offset), len));
        sd.add_obj(at(offset), len);
    }

    #[test]
    fn test_add_obj_spanning_regions() {
        let (sd, bm) = setup();
        mark(&sd, &bm, R - 5, 2 * R + 10);
        assert_eq!(sd.region(0).live_obj_size(), 5);
        assert_eq!(sd.region(1).partial_obj_size(), R);
        assert_eq!(sd.region(1).partial_obj_addr(), at(R - 5));
        assert_eq!(sd.region(2).partial_obj_size(), R);
        assert_eq!(sd.region(3).partial_obj_size(), 5);
        assert_eq!(sd.partial_obj_end(1), at(3 * R + 5));
        assert_eq!(sd.partial_obj_end(3), at(3 * R + 5));
        assert_eq!(sd.partial_obj_end(4), at(4 * R));
    }

    #[test]
    fn test_summarize_into_self_compacts_left() {
        let (sd, bm) = setup();
        mark(&sd, &bm, 10, 20);
        mark(&sd, &bm, R + 4, 8);
        mark(&sd, &bm, 2 * R + 60, 10);

        let mut split = SplitInfo::default();
        // The last object runs 6 words into region 3.
        let outcome = sd.summarize(&mut split, at(0), at(4 * R), at(0), at(8 * R));
        assert_eq!(outcome, SummarizeOutcome::Complete { target_next: at(38) });
        assert_eq!(sd.region(0).destination(), at(0));
        assert_eq!(sd.region(1).destination(), at(20));
        assert_eq!(sd.region(2).destination(), at(28));
        assert_eq!(sd.region(3).destination(), at(32));
        // Region 0 compacts into itself.
        assert_eq!(sd.region(0).destination_count(), 0);
        assert_eq!(sd.region(1).destination_count(), 1);
        assert_eq!(sd.region(0).source_region(), Some(0));

        assert_eq!(sd.calc_new_pointer(at(10), &bm), at(0));
        assert_eq!(sd.calc_new_pointer(at(R + 4), &bm), at(20));
        assert_eq!(sd.calc_new_pointer(at(2 * R + 60), &bm), at(28));
        assert!(!split.is_valid());
    }

    #[test]
    fn test_calc_new_pointer_uses_blocks() {
        let (sd, bm) = setup();
        // Several objects per block, some blocks without starts.
        for (ofs, len) in [(0, 3), (5, 2), (9, 4), (30, 12), (50, 3)] {
            mark(&sd, &bm, R + ofs, len);
        }
        let mut split = SplitInfo::default();
        let _ = sd.summarize(&mut split, at(R), at(2 * R), at(0), at(8 * R));
        assert_eq!(sd.calc_new_pointer(at(R), &bm), at(0));
        assert_eq!(sd.calc_new_pointer(at(R + 5), &bm), at(3));
        assert_eq!(sd.calc_new_pointer(at(R + 9), &bm), at(5));
        assert_eq!(sd.calc_new_pointer(at(R + 30), &bm), at(9));
        assert_eq!(sd.calc_new_pointer(at(R + 50), &bm), at(21));
        assert!(sd.region(1).blocks_filled());
        // Idempotent refill.
        sd.fill_blocks(1, &bm);
        assert_eq!(sd.calc_new_pointer(at(R + 50), &bm), at(21));
    }

    #[test]
    fn test_full_region_fast_path() {
        let (sd, bm) = setup();
        mark(&sd, &bm, 0, R);
        mark(&sd, &bm, R, 10);
        let mut split = SplitInfo::default();
        let _ = sd.summarize(&mut split, at(0), at(2 * R), at(0), at(8 * R));
        assert_eq!(sd.region(0).data_size(), R);
        assert_eq!(sd.calc_new_pointer(at(0), &bm), at(0));
        assert!(!sd.region(0).blocks_filled());
    }

    #[test]
    fn test_dense_prefix_maps_to_self() {
        let (sd, bm) = setup();
        mark(&sd, &bm, 3, 4);
        mark(&sd, &bm, 20, 50);
        sd.summarize_dense_prefix(at(0), at(2 * R));
        assert_eq!(sd.region(0).data_size(), R);
        assert_eq!(sd.region(1).data_size(), R);
        assert_eq!(sd.region(1).destination(), at(R));
        assert_eq!(sd.region(1).source_region(), Some(1));
        assert_eq!(sd.calc_new_pointer(at(20), &bm), at(20));
    }

    #[test]
    fn test_object_larger_than_target_moves_whole() {
        let (sd, bm) = setup();
        // Regions 4..8: 5 words in region 4, then R, R and 5 words.
        mark(&sd, &bm, 5 * R - 5, 2 * R + 10);

        let mut split = SplitInfo::default();
        let outcome = sd.summarize(&mut split, at(4 * R), at(8 * R), at(0), at(R + 5));
        // The head and region 5 fit, region 6 does not. The object cannot be
        // split, so nothing from the region where it starts stays in the
        // first target.
        assert_eq!(
            outcome,
            SummarizeOutcome::Split {
                source_next: at(4 * R),
                target_next: at(0),
            }
        );
        assert!(!split.is_valid());
        assert_eq!(split.partial_obj_size(), 0);

        // Resume in a second target: the object is laid out contiguously.
        let outcome = sd.summarize(&mut split, at(4 * R), at(8 * R), at(4 * R), at(8 * R));
        assert_eq!(outcome, SummarizeOutcome::Complete { target_next: at(6 * R + 10) });
        assert_eq!(sd.region(4).destination(), at(4 * R));
        assert_eq!(sd.region(5).destination(), at(4 * R + 5));
        assert_eq!(sd.region(6).destination(), at(5 * R + 5));
        assert_eq!(sd.region(7).destination(), at(6 * R + 5));
        assert_eq!(sd.region(7).destination_count(), 1);
        assert_eq!(sd.calc_new_pointer(at(5 * R - 5), &bm), at(4 * R));
    }

    #[test]
    fn test_split_partial_object_straddling_destinations() {
        let (sd, bm) = setup();
        mark(&sd, &bm, 4 * R, 20);
        // 10 words in region 4, a 20-word partial object in region 5.
        mark(&sd, &bm, 5 * R - 10, 30);
        mark(&sd, &bm, 5 * R + 20, 40);

        let mut split = SplitInfo::default();
        let outcome = sd.summarize(&mut split, at(4 * R), at(8 * R), at(R - 40), at(R + 10));
        assert_eq!(
            outcome,
            SummarizeOutcome::Split {
                source_next: at(5 * R + 20),
                target_next: at(R + 10),
            }
        );
        assert!(split.is_split(5));
        assert_eq!(split.partial_obj_size(), 20);
        assert_eq!(split.destination(), at(R - 10));
        // The partial object crosses into destination region 1.
        assert_eq!(split.destination_count(), 2);
        assert_eq!(split.dest_region_addr(), at(R));
        assert_eq!(split.first_src_addr(), at(5 * R + 10));
        assert_eq!(sd.region(5).partial_obj_size(), 0);
        assert_eq!(sd.region(4).destination_count(), 1);

        // The rest of region 5 straddles regions 2 and 3 of the second target.
        let outcome = sd.summarize(&mut split, at(5 * R + 20), at(8 * R), at(2 * R + 40), at(4 * R));
        assert_eq!(outcome, SummarizeOutcome::Complete { target_next: at(2 * R + 80) });
        assert_eq!(sd.region(5).destination(), at(2 * R + 40));
        assert_eq!(sd.region(5).destination_count(), 4);
        assert_eq!(sd.region(1).source_region(), Some(5));
        assert_eq!(sd.region(3).source_region(), Some(5));

        // Every reader must finish before the region can be claimed.
        let region = sd.region(5);
        for _ in 0..3 {
            let _ = region.decrement_destination_count();
            assert!(!region.claim());
        }
        assert_eq!(region.decrement_destination_count(), 0);
        assert!(region.claim());
    }

    #[test]
    fn test_claim_protocol() {
        let (sd, _) = setup();
        let region = sd.region(2);
        region.set_destination_count(1);
        assert!(!region.claim());
        assert_eq!(region.decrement_destination_count(), 0);
        assert!(region.claim());
        assert!(!region.claim());
        assert!(region.claimed());
        region.set_completed();
        assert!(region.completed());
        assert!(!region.claim_unsafe());
    }

    #[test]
    fn test_clear_range_is_idempotent() {
        let (sd, bm) = setup();
        mark(&sd, &bm, R - 5, 2 * R);
        let mut split = SplitInfo::default();
        let _ = sd.summarize(&mut split, at(0), at(4 * R), at(0), at(8 * R));
        let _ = sd.calc_new_pointer(at(R - 5), &bm);
        assert!(!sd.is_clear());
        sd.clear_range_addrs(at(0), at(4 * R));
        sd.clear_range_addrs(at(0), at(4 * R));
        sd.verify_clear();
    }
}
