//! Fixed-block-size allocator over a chain of free runs.
//!
//! A [`FreeList`] serves exactly one block size. Allocation takes the first
//! block of the first run in O(1); how a freed block re-enters the chain is
//! decided by its [`ChainOrder`]:
//!
//! - [`ChainOrder::Unordered`] ([`FreeList::new`]) pushes a one-block run at
//!   the head. Frees are O(1) but runs never merge.
//! - [`ChainOrder::AddressOrdered`] ([`FreeList::coalescing`]) inserts the
//!   block at its address position and merges it with touching neighbours.
//!   Frees are O(number of runs).
//!
//! # Usage Example
//!
//! ```rust
//! use arena_alloc::{Allocator as _, Arena, FreeList};
//!
//! let mut heap = [0u8; 1024];
//! let arena = Arena::new(&mut heap).unwrap();
//! let mut list = FreeList::coalescing(arena, 16, true).unwrap();
//!
//! let a = list.alloc(16).unwrap();
//! let b = list.alloc(10).unwrap();
//! assert_eq!(b.get() - a.get(), 16);
//!
//! list.free(a).unwrap();
//! list.free(b).unwrap();
//! assert_eq!(list.runs().count(), 1);
//! ```

use alloc::string::String;

use snafu::{OptionExt as _, ensure};

use crate::{
    Allocator,
    arena::{Arena, Offset},
    chain::{ChainOrder, FreeRun, Pool},
    error::{AllocError, ConfigError, InvalidFreeSnafu, OutOfMemorySnafu},
};

/// Allocator handing out blocks of a single fixed size.
#[derive(Debug)]
pub struct FreeList<'a> {
    arena: Arena<'a>,
    pool: Pool,
}

impl<'a> FreeList<'a> {
    /// Creates an unordered, non-coalescing free list.
    ///
    /// `block_size` must be at least [`RUN_HEADER_SIZE`](crate::RUN_HEADER_SIZE)
    /// bytes. With `start_free` every block of the arena starts free;
    /// otherwise the list is empty until blocks are freed into it.
    pub fn new(arena: Arena<'a>, block_size: usize, start_free: bool) -> Result<Self, ConfigError> {
        Self::with_order(arena, block_size, start_free, ChainOrder::Unordered)
    }

    /// Creates an address-ordered free list that coalesces on every free.
    pub fn coalescing(
        arena: Arena<'a>,
        block_size: usize,
        start_free: bool,
    ) -> Result<Self, ConfigError> {
        Self::with_order(arena, block_size, start_free, ChainOrder::AddressOrdered)
    }

    /// Creates a free list with an explicit chain order.
    pub fn with_order(
        mut arena: Arena<'a>,
        block_size: usize,
        start_free: bool,
        order: ChainOrder,
    ) -> Result<Self, ConfigError> {
        let pool = Pool::new(&mut arena, block_size, start_free, order)?;
        log::debug!(
            "FreeList::new(len={}, block_size={block_size}, blocks={}, {order:?})",
            arena.len(),
            pool.block_count(),
        );
        Ok(Self { arena, pool })
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.pool.block_count()
    }

    #[must_use]
    pub const fn order(&self) -> ChainOrder {
        self.pool.order()
    }

    /// Returns `true` if at least one block is free.
    #[must_use]
    pub const fn can_alloc(&self) -> bool {
        self.pool.can_alloc()
    }

    /// Number of free blocks.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.pool.free_blocks(&self.arena)
    }

    /// The free runs, in chain order.
    pub fn runs(&self) -> impl Iterator<Item = FreeRun> + '_ {
        self.pool.runs(&self.arena)
    }

    /// One character per block: `#` used, `+` start of a free run, `-` free.
    #[must_use]
    pub fn memory_map(&self) -> String {
        self.pool.memory_map(&self.arena)
    }
}

impl Allocator for FreeList<'_> {
    /// Takes the first free block.
    ///
    /// Fails if `size` exceeds the block size: matching requests to size
    /// classes is the caller's job.
    fn alloc(&mut self, size: usize) -> Result<Offset, AllocError> {
        ensure!(size <= self.pool.block_size(), OutOfMemorySnafu { size });
        let block = self
            .pool
            .alloc_block(&mut self.arena)
            .context(OutOfMemorySnafu { size })?;
        Ok(Offset::new(block))
    }

    fn free(&mut self, offset: Offset) -> Result<(), AllocError> {
        self.pool
            .check_allocated(&self.arena, offset.get())
            .map_err(|fault| InvalidFreeSnafu { offset, fault }.build())?;
        self.pool.release(&mut self.arena, offset.get());
        Ok(())
    }

    fn arena(&self) -> &Arena<'_> {
        &self.arena
    }

    fn payload_mut(&mut self, offset: Offset, len: usize) -> &mut [u8] {
        self.arena.bytes_mut(offset, len)
    }
}
