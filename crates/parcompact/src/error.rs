//! Setup errors.
//!
//! Collections themselves never fail with an error value: a collection either
//! runs to completion or is skipped (see [`crate::GcLocker`]), and internal
//! invariant violations panic. Only building a heap or a collector can fail.

use std::io;

use thiserror::Error;

/// Failure to construct a heap or a collector.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The backing memory for the heap or a side table could not be
    /// reserved or committed.
    #[error("unable to reserve {what}: {source}")]
    Reserve {
        /// Which structure was being allocated.
        what: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A space size is not a multiple of the region size.
    #[error("{space} size of {words} words is not a multiple of the region size ({region_words} words)")]
    MisalignedSpace {
        /// Name of the offending space.
        space: &'static str,
        /// Requested size in words.
        words: usize,
        /// Region size in words.
        region_words: usize,
    },

    /// The old space must not be empty.
    #[error("the old space must hold at least one region")]
    EmptyOldSpace,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The heap was built with a region size different from the collector's.
    #[error("heap region size {heap} words does not match configured region size {config} words")]
    RegionSizeMismatch {
        /// Region size the heap was laid out with.
        heap: usize,
        /// Region size from the collector configuration.
        config: usize,
    },
}

impl SetupError {
    pub(crate) const fn reserve(what: &'static str, source: io::Error) -> Self {
        Self::Reserve { what, source }
    }
}
