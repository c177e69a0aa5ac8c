//! Error types shared by every allocation technique.

use derive_more::{Display, IsVariant};
use snafu::{Location, Snafu};

use crate::arena::Offset;

/// Errors reported by [`Allocator::alloc`](crate::Allocator::alloc) and
/// [`Allocator::free`](crate::Allocator::free).
#[derive(Debug, Snafu, IsVariant)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    /// No block, size class or contiguous run can serve the request.
    #[snafu(display("out of memory: cannot serve a request of {size} bytes"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The offset handed to `free` is not a live allocation of this allocator.
    #[snafu(display("invalid free at {offset}: {fault}"))]
    InvalidFree {
        offset: Offset,
        fault: FreeFault,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns the reason a free was rejected, if this is an invalid free.
    #[must_use]
    pub fn free_fault(&self) -> Option<FreeFault> {
        match self {
            Self::InvalidFree { fault, .. } => Some(*fault),
            Self::OutOfMemory { .. } => None,
        }
    }
}

/// Why a free was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IsVariant)]
pub enum FreeFault {
    #[display("offset lies outside the managed region")]
    OutOfBounds,
    #[display("offset is not on a block boundary")]
    Misaligned,
    #[display("block is already free")]
    AlreadyFree,
    #[display("no allocation starts at this block")]
    NotAllocated,
    #[display("block lies inside an allocation but does not start it")]
    NotAllocationStart,
}

/// Errors reported while building an allocator over an arena.
#[derive(Debug, Snafu, IsVariant)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("arena must not be empty"))]
    EmptyArena {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block size {block_size} cannot hold a free-run header of {min} bytes"))]
    BlockTooSmall {
        block_size: usize,
        min: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block size {size} is not a power of two"))]
    NotPowerOfTwo {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("largest block {largest} is smaller than smallest block {smallest}"))]
    InvalidSizeClasses {
        largest: usize,
        smallest: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena of {arena_len} bytes cannot hold a block of {block_size} bytes"))]
    ArenaTooSmall {
        arena_len: usize,
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region of {blocks} blocks exceeds the bitmask capacity of {max}"))]
    TooManyBlocks {
        blocks: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
}
