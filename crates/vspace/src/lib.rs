//! Reserved and committed virtual memory.
//!
//! A [`VirtualSpace`] reserves a contiguous range of address space up front
//! and commits it in page-granular steps. Collector heaps and side tables
//! reserve their backing once at startup; a failed reservation is reported
//! to the caller as an [`io::Error`].
//!
//! Committed memory reads as zero, so it can be viewed directly as a slice of
//! atomic words with [`VirtualSpace::committed_words`]. [`WordStorage`] wraps
//! the common case of reserving and committing a fixed number of words.

use std::io;
use std::ops::Deref;
use std::sync::atomic::AtomicU64;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Size in bytes of one heap word.
pub const WORD_BYTES: usize = std::mem::size_of::<u64>();

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Reservations are rounded up to this granularity.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// A reserved range of address space with a committed prefix.
///
/// The whole range is released when the space is dropped.
pub struct VirtualSpace {
    reservation: os::Reservation,
    committed: usize,
}

impl VirtualSpace {
    /// Reserve `bytes` of address space without committing any of it.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is zero or the operating system refuses the
    /// reservation.
    pub fn reserve(bytes: usize) -> io::Result<Self> {
        if bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation size must be greater than 0",
            ));
        }
        let len = align_up(bytes, allocation_granularity());
        let reservation = unsafe { os::Reservation::reserve(len)? };
        Ok(Self {
            reservation,
            committed: 0,
        })
    }

    /// Commit the next `bytes` of the reservation.
    ///
    /// The request is rounded up to the page size.
    ///
    /// # Errors
    ///
    /// Returns an error if the request would exceed the reservation or the
    /// commit itself fails.
    pub fn expand_by(&mut self, bytes: usize) -> io::Result<()> {
        let bytes = align_up(bytes, page_size());
        let new_committed = self.committed + bytes;
        if new_committed > self.reservation.len() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "commit exceeds reserved space",
            ));
        }
        // SAFETY: `[committed, new_committed)` lies inside the reservation
        // and has not been committed yet.
        unsafe {
            self.reservation.commit(self.committed, bytes)?;
        }
        self.committed = new_committed;
        Ok(())
    }

    /// Lowest address of the reservation.
    #[must_use]
    pub fn low(&self) -> *mut u8 {
        self.reservation.ptr()
    }

    /// Bytes reserved.
    #[must_use]
    pub fn reserved_size(&self) -> usize {
        self.reservation.len()
    }

    /// Bytes committed, always a prefix of the reservation.
    #[must_use]
    pub const fn committed_size(&self) -> usize {
        self.committed
    }

    /// The committed prefix viewed as atomic words.
    #[must_use]
    pub fn committed_words(&self) -> &[AtomicU64] {
        let len = self.committed / WORD_BYTES;
        if len == 0 {
            return &[];
        }
        // SAFETY: the committed prefix is readable and writable, page aligned
        // (so aligned for `AtomicU64`), zero-initialized by the OS, and lives
        // as long as `self`. All access goes through atomics.
        unsafe { std::slice::from_raw_parts(self.low().cast::<AtomicU64>(), len) }
    }
}

// SAFETY: the mapping is owned by the space and only exposed through atomics.
unsafe impl Send for VirtualSpace {}
unsafe impl Sync for VirtualSpace {}

/// A fixed number of committed, zero-initialized atomic words.
///
/// # Example
///
/// ```
/// use std::sync::atomic::Ordering;
/// use vspace::WordStorage;
///
/// let words = WordStorage::new(1024).unwrap();
/// assert_eq!(words.len(), 1024);
/// assert_eq!(words[17].load(Ordering::Relaxed), 0);
/// ```
pub struct WordStorage {
    space: VirtualSpace,
    len: usize,
}

impl WordStorage {
    /// Reserve and commit `words` words.
    ///
    /// # Errors
    ///
    /// Returns an error if the memory cannot be reserved or committed.
    pub fn new(words: usize) -> io::Result<Self> {
        let bytes = words.checked_mul(WORD_BYTES).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "word count overflows")
        })?;
        let mut space = VirtualSpace::reserve(bytes)?;
        space.expand_by(bytes)?;
        Ok(Self { space, len: words })
    }

    /// Number of usable words.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the storage holds no words.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for WordStorage {
    type Target = [AtomicU64];

    fn deref(&self) -> &[AtomicU64] {
        &self.space.committed_words()[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_reserve_then_commit() {
        let mut space = VirtualSpace::reserve(4 * page_size()).expect("reserve");
        assert_eq!(space.committed_size(), 0);
        assert!(space.committed_words().is_empty());

        space.expand_by(1).expect("commit");
        assert_eq!(space.committed_size(), page_size());
        let words = space.committed_words();
        assert_eq!(words.len(), page_size() / WORD_BYTES);
        words[0].store(42, Ordering::Relaxed);
        assert_eq!(words[0].load(Ordering::Relaxed), 42);

        space.expand_by(page_size()).expect("commit");
        assert_eq!(space.committed_words()[0].load(Ordering::Relaxed), 42);
    }

    #[test]
    fn test_commit_beyond_reservation_fails() {
        let mut space = VirtualSpace::reserve(page_size()).expect("reserve");
        let reserved = space.reserved_size();
        assert!(space.expand_by(reserved + 1).is_err());
        assert_eq!(space.committed_size(), 0);
    }

    #[test]
    fn test_zero_reservation_rejected() {
        assert!(VirtualSpace::reserve(0).is_err());
    }

    #[test]
    fn test_word_storage_zeroed() {
        let words = WordStorage::new(10_000).expect("storage");
        assert_eq!(words.len(), 10_000);
        assert!(words.iter().all(|w| w.load(Ordering::Relaxed) == 0));
        words[9_999].store(7, Ordering::Relaxed);
        assert_eq!(words[9_999].load(Ordering::Relaxed), 7);
    }
}
