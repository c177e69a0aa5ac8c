//! Block allocators over a fixed, statically reserved byte region.
//!
//! Every allocator in this crate borrows one [`Arena`] and hands out
//! [`Offset`]s into it. No OS heap is used for the blocks themselves; free-run
//! bookkeeping lives inside the free blocks.
//!
//! # Available Allocators
//!
//! ## [`FreeList`]
//!
//! A single-size-class allocator keeping a chain of free runs. The chain is
//! either unordered ([`FreeList::new`]) or kept in address order with
//! neighbouring runs merged on every free ([`FreeList::coalescing`]).
//!
//! **Performance**: O(1) allocation. O(1) unordered frees, O(n) coalescing
//! frees where n is the number of free runs.
//!
//! ## [`BuddyAllocator`]
//!
//! A variable-size allocator with one free-run pool per power-of-two size
//! class. Blocks are split on allocation and merged with their buddies on
//! free.
//!
//! **Performance**: O(levels) splitting, O(levels * n) merging.
//!
//! ## [`FreeBits`]
//!
//! A first-fit contiguous-run allocator over two 32-bit masks, for regions of
//! at most 32 blocks.
//!
//! **Performance**: O(blocks) allocation and deallocation.
//!
//! # Usage Example
//!
//! ```rust
//! use arena_alloc::{Allocator, Arena, BuddyAllocator};
//!
//! fn fill<A: Allocator>(allocator: &mut A, size: usize, byte: u8) -> arena_alloc::Offset {
//!     let offset = allocator.alloc(size).unwrap();
//!     allocator.payload_mut(offset, size).fill(byte);
//!     offset
//! }
//!
//! let mut heap = [0u8; 1024];
//! let arena = Arena::new(&mut heap).unwrap();
//! let mut buddy = BuddyAllocator::new(arena, 512, 16).unwrap();
//!
//! let a = fill(&mut buddy, 40, 0xaa);
//! let b = fill(&mut buddy, 200, 0xbb);
//! assert!(buddy.arena().bytes(a, 40).iter().all(|&byte| byte == 0xaa));
//!
//! buddy.free(a).unwrap();
//! buddy.free(b).unwrap();
//! assert!(buddy.free(b).unwrap_err().free_fault().is_some());
//! ```
//!
//! # Design Considerations
//!
//! The allocators are single-threaded. Exclusive access to the region is
//! enforced by the `&mut [u8]` borrow held by the [`Arena`]; an allocator is
//! `Send` whenever the buffer is.
//!
//! None of the allocators reads or writes the payload of a live allocation.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod arena;
pub mod buddy;
pub mod chain;
pub mod error;
pub mod free_bits;
pub mod free_list;

pub use self::{
    arena::{Arena, Offset},
    buddy::BuddyAllocator,
    chain::{ChainOrder, FreeRun, RUN_HEADER_SIZE},
    error::{AllocError, ConfigError, FreeFault},
    free_bits::FreeBits,
    free_list::FreeList,
};

/// The capability shared by every allocation technique.
pub trait Allocator {
    /// Allocates a block of at least `size` bytes.
    ///
    /// A zero-byte request is served with the smallest block the allocator
    /// hands out.
    fn alloc(&mut self, size: usize) -> Result<Offset, AllocError>;

    /// Releases the allocation starting at `offset`.
    ///
    /// Offsets that are not the start of a live allocation are rejected with
    /// [`AllocError::InvalidFree`] and leave the allocator unchanged.
    fn free(&mut self, offset: Offset) -> Result<(), AllocError>;

    /// The region the allocator carves blocks from.
    fn arena(&self) -> &Arena<'_>;

    /// Mutable access to `len` payload bytes at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not inside the arena.
    fn payload_mut(&mut self, offset: Offset, len: usize) -> &mut [u8];
}
