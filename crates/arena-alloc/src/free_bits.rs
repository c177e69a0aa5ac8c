//! Contiguous-run allocator over a pair of 32-bit occupancy masks.
//!
//! The arena is split into at most 32 equally sized blocks. Bit `i` of the
//! `used` mask is set while block `i` belongs to an allocation, and bit `i`
//! of the `start` mask marks the first block of each allocation, so a free
//! only needs the first block to find where the allocation ends.
//!
//! Allocation is a linear first-fit search for enough consecutive clear bits.

use alloc::string::String;

use snafu::{OptionExt as _, ensure};

use crate::{
    Allocator,
    arena::{Arena, Offset},
    error::{
        AllocError, ArenaTooSmallSnafu, BlockTooSmallSnafu, ConfigError, FreeFault,
        InvalidFreeSnafu, OutOfMemorySnafu, TooManyBlocksSnafu,
    },
};

/// Number of blocks a pair of masks can describe.
pub const MAX_BLOCKS: usize = u32::BITS as usize;

const fn bit(index: usize) -> u32 {
    1 << index
}

/// Bitmask allocator handing out runs of whole blocks.
///
/// # Usage Example
///
/// ```rust
/// use arena_alloc::{Allocator as _, Arena, FreeBits};
///
/// let mut heap = [0u8; 512];
/// let arena = Arena::new(&mut heap).unwrap();
/// let mut bits = FreeBits::new(arena, 16).unwrap();
///
/// let a = bits.alloc(64).unwrap();
/// let b = bits.alloc(96).unwrap();
/// assert_eq!((a.get(), b.get()), (0, 64));
/// assert_eq!(bits.avail_blocks(), 22);
///
/// bits.free(a).unwrap();
/// assert_eq!(bits.memory_map(), format!("+---######+{}", "-".repeat(21)));
/// ```
#[derive(Debug)]
pub struct FreeBits<'a> {
    arena: Arena<'a>,
    block_size: usize,
    block_count: usize,
    used: u32,
    start: u32,
}

impl<'a> FreeBits<'a> {
    /// Creates a bitmask allocator with every block free.
    ///
    /// The arena must hold between 1 and [`MAX_BLOCKS`] whole blocks; bytes
    /// past the last whole block are never handed out.
    pub fn new(arena: Arena<'a>, block_size: usize) -> Result<Self, ConfigError> {
        ensure!(block_size > 0, BlockTooSmallSnafu { block_size, min: 1_usize });
        let block_count = arena.len() / block_size;
        ensure!(
            block_count > 0,
            ArenaTooSmallSnafu {
                arena_len: arena.len(),
                block_size,
            }
        );
        ensure!(
            block_count <= MAX_BLOCKS,
            TooManyBlocksSnafu {
                blocks: block_count,
                max: MAX_BLOCKS,
            }
        );

        log::debug!(
            "FreeBits::new(len={}, block_size={block_size}, blocks={block_count})",
            arena.len(),
        );

        Ok(Self {
            arena,
            block_size,
            block_count,
            used: 0,
            start: 0,
        })
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.block_count
    }

    const fn is_used(&self, index: usize) -> bool {
        self.used & bit(index) != 0
    }

    const fn is_start(&self, index: usize) -> bool {
        self.start & bit(index) != 0
    }

    fn find_run(&self, blocks: usize) -> Option<usize> {
        let mut run = 0;
        for index in 0..self.block_count {
            if self.is_used(index) {
                run = 0;
            } else {
                run += 1;
            }
            if run == blocks {
                return Some(index + 1 - blocks);
            }
        }
        None
    }

    fn mark(&mut self, first: usize, blocks: usize) {
        self.start |= bit(first);
        for index in first..first + blocks {
            self.used |= bit(index);
        }
    }

    /// Allocates `blocks` consecutive blocks and returns the index of the
    /// first one.
    ///
    /// The lowest-addressed run that fits wins. A request for zero blocks is
    /// served as one block.
    pub fn alloc_blocks(&mut self, blocks: usize) -> Result<usize, AllocError> {
        let blocks = blocks.max(1);
        let first = self.find_run(blocks).context(OutOfMemorySnafu {
            size: blocks.saturating_mul(self.block_size),
        })?;
        self.mark(first, blocks);
        log::trace!("free-bits: alloc_blocks({blocks}) -> {first}");
        Ok(first)
    }

    /// Releases the allocation starting at block `first`.
    ///
    /// Fails unless `first` is the first block of a live allocation.
    pub fn free_blocks(&mut self, first: usize) -> Result<(), AllocError> {
        let offset = Offset::new(first.saturating_mul(self.block_size));
        let fault = |fault: FreeFault| InvalidFreeSnafu { offset, fault }.build();
        if first >= self.block_count {
            return Err(fault(FreeFault::OutOfBounds));
        }
        if !self.is_start(first) {
            return Err(fault(FreeFault::NotAllocationStart));
        }

        self.start &= !bit(first);
        let mut index = first;
        while index < self.block_count && self.is_used(index) && !self.is_start(index) {
            self.used &= !bit(index);
            index += 1;
        }
        log::trace!("free-bits: free_blocks({first}) released {}", index - first);
        Ok(())
    }

    /// Number of free blocks.
    #[must_use]
    pub fn avail_blocks(&self) -> usize {
        (0..self.block_count)
            .filter(|&index| !self.is_used(index))
            .count()
    }

    /// Number of free bytes.
    #[must_use]
    pub fn avail_bytes(&self) -> usize {
        self.avail_blocks() * self.block_size
    }

    /// One character per block: `#` used, `+` first free block after a used
    /// one, `-` free.
    #[must_use]
    pub fn memory_map(&self) -> String {
        (0..self.block_count)
            .map(|index| {
                if self.is_used(index) {
                    '#'
                } else if index == 0 || self.is_used(index - 1) {
                    '+'
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl Allocator for FreeBits<'_> {
    /// Allocates enough whole blocks to hold `size` bytes.
    fn alloc(&mut self, size: usize) -> Result<Offset, AllocError> {
        let blocks = size.div_ceil(self.block_size).max(1);
        let first = self
            .find_run(blocks)
            .context(OutOfMemorySnafu { size })?;
        self.mark(first, blocks);
        log::trace!("free-bits: alloc({size}) -> block {first}");
        Ok(Offset::new(first * self.block_size))
    }

    fn free(&mut self, offset: Offset) -> Result<(), AllocError> {
        let offset_bytes = offset.get();
        if offset_bytes >= self.block_count * self.block_size {
            return InvalidFreeSnafu {
                offset,
                fault: FreeFault::OutOfBounds,
            }
            .fail();
        }
        ensure!(
            offset_bytes.is_multiple_of(self.block_size),
            InvalidFreeSnafu {
                offset,
                fault: FreeFault::Misaligned,
            }
        );
        self.free_blocks(offset_bytes / self.block_size)
    }

    fn arena(&self) -> &Arena<'_> {
        &self.arena
    }

    fn payload_mut(&mut self, offset: Offset, len: usize) -> &mut [u8] {
        self.arena.bytes_mut(offset, len)
    }
}
