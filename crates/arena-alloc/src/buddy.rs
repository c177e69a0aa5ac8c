//! Binary buddy allocator built from one free-run pool per size class.
//!
//! The pools all view the same arena at different granularities: level 0
//! uses the largest block size and starts with every block free, each finer
//! level halves the block size and starts empty.
//!
//! ```text
//! level 0 (512) │               +---------------│
//! level 1 (256) │       #       │       #       │
//! level 2 (128) │   #   │   #   │   #   │   #   │
//! ```
//!
//! Allocation picks the finest level that both fits the request and has a
//! free block, then splits the block down while its size is at least twice
//! the request, releasing each upper half into the next finer pool. Freeing
//! climbs back up, absorbing the buddy from the same level for as long as it
//! is free, and releases the merged block into the level where merging
//! stopped.

use alloc::{format, string::String, vec::Vec};

use arrayvec::ArrayVec;
use snafu::{OptionExt as _, ensure};

use crate::{
    Allocator,
    arena::{Arena, Offset},
    chain::{ChainOrder, FreeRun, Pool},
    error::{
        AllocError, ConfigError, FreeFault, InvalidFreeSnafu, InvalidSizeClassesSnafu,
        NotPowerOfTwoSnafu, OutOfMemorySnafu,
    },
};

/// Upper bound on the number of size classes.
const MAX_LEVELS: usize = usize::BITS as usize;

/// Variable-size allocator using power-of-two buddy blocks.
///
/// # Usage Example
///
/// ```rust
/// use arena_alloc::{Allocator as _, Arena, BuddyAllocator};
///
/// let mut heap = [0u8; 512];
/// let arena = Arena::new(&mut heap).unwrap();
/// let mut buddy = BuddyAllocator::new(arena, 512, 16).unwrap();
///
/// let a = buddy.alloc(32).unwrap();
/// let b = buddy.alloc(100).unwrap();
/// buddy.free(a).unwrap();
/// buddy.free(b).unwrap();
/// assert_eq!(buddy.memory_map(), format!("+{}", "-".repeat(31)));
/// ```
#[derive(Debug)]
pub struct BuddyAllocator<'a> {
    arena: Arena<'a>,
    /// Index 0 is the largest block size, the last entry the smallest.
    pools: ArrayVec<Pool, MAX_LEVELS>,
    /// Level serving the live allocation that starts at each finest block.
    alloc_levels: Vec<Option<u8>>,
}

impl<'a> BuddyAllocator<'a> {
    /// Creates a buddy allocator whose pools use unordered chains.
    ///
    /// Both sizes must be powers of two with `smallest <= largest <=
    /// arena.len()`, and `smallest` must hold a run header.
    pub fn new(arena: Arena<'a>, largest: usize, smallest: usize) -> Result<Self, ConfigError> {
        Self::with_order(arena, largest, smallest, ChainOrder::Unordered)
    }

    /// Creates a buddy allocator whose pools use the given chain order.
    pub fn with_order(
        mut arena: Arena<'a>,
        largest: usize,
        smallest: usize,
        order: ChainOrder,
    ) -> Result<Self, ConfigError> {
        ensure!(largest.is_power_of_two(), NotPowerOfTwoSnafu { size: largest });
        ensure!(smallest.is_power_of_two(), NotPowerOfTwoSnafu { size: smallest });
        ensure!(
            smallest <= largest,
            InvalidSizeClassesSnafu { largest, smallest }
        );

        let levels = (largest / smallest).ilog2() as usize + 1;
        let mut pools = ArrayVec::new();
        for level in 0..levels {
            pools.push(Pool::new(&mut arena, largest >> level, level == 0, order)?);
        }
        let finest_blocks = pools.last().map_or(0, Pool::block_count);

        log::debug!(
            "BuddyAllocator::new(len={}, largest={largest}, smallest={smallest}, levels={levels})",
            arena.len(),
        );

        Ok(Self {
            arena,
            pools,
            alloc_levels: alloc::vec![None; finest_blocks],
        })
    }

    /// Number of size classes.
    #[must_use]
    pub fn levels(&self) -> usize {
        self.pools.len()
    }

    /// Block size of `level`; level 0 is the largest.
    ///
    /// # Panics
    ///
    /// Panics if `level >= self.levels()`.
    #[must_use]
    pub fn block_size(&self, level: usize) -> usize {
        self.pools[level].block_size()
    }

    /// The free runs of `level`, in chain order.
    ///
    /// # Panics
    ///
    /// Panics if `level >= self.levels()`.
    pub fn level_runs(&self, level: usize) -> impl Iterator<Item = FreeRun> + '_ {
        self.pools[level].runs(&self.arena)
    }

    /// Free bytes summed over every level.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| pool.free_blocks(&self.arena) * pool.block_size())
            .sum()
    }

    fn finest(&self) -> &Pool {
        &self.pools[self.pools.len() - 1]
    }

    /// Composite map with one character per finest block.
    ///
    /// Every level's free runs are painted over the finest map, coarse levels
    /// first, so each free block shows up at its own granularity.
    #[must_use]
    pub fn memory_map(&self) -> String {
        let finest_size = self.finest().block_size();
        let mut map = alloc::vec![b'#'; self.finest().block_count()];
        for pool in &self.pools {
            let zoom = pool.block_size() / finest_size;
            for (index, mark) in pool.memory_map(&self.arena).bytes().enumerate() {
                if mark != b'#' {
                    let first = index * zoom;
                    map[first] = mark;
                    map[first + 1..first + zoom].fill(b'-');
                }
            }
        }
        map.into_iter().map(char::from).collect()
    }

    /// One map per level, coarsest first, each followed by its block size.
    #[must_use]
    pub fn level_memory_maps(&self) -> Vec<String> {
        self.pools
            .iter()
            .map(|pool| format!("{} {}", pool.memory_map(&self.arena), pool.block_size()))
            .collect()
    }
}

impl Allocator for BuddyAllocator<'_> {
    fn alloc(&mut self, size: usize) -> Result<Offset, AllocError> {
        let request = size.max(1);
        let finest = self.pools.len() - 1;
        let mut level = (0..=finest)
            .rev()
            .find(|&level| {
                let pool = &self.pools[level];
                pool.block_size() >= request && pool.can_alloc()
            })
            .context(OutOfMemorySnafu { size })?;
        let block = self.pools[level]
            .alloc_block(&mut self.arena)
            .context(OutOfMemorySnafu { size })?;

        while level < finest && self.pools[level].block_size() / 2 >= request {
            level += 1;
            let pool = &mut self.pools[level];
            let upper_half = block + pool.block_size();
            pool.release(&mut self.arena, upper_half);
        }

        let index = block / self.finest().block_size();
        #[expect(clippy::cast_possible_truncation, reason = "levels never exceed usize::BITS")]
        let stored = level as u8;
        self.alloc_levels[index] = Some(stored);
        log::trace!("buddy: alloc({size}) -> {block:#x} at level {level}");
        Ok(Offset::new(block))
    }

    fn free(&mut self, offset: Offset) -> Result<(), AllocError> {
        let finest = self.finest();
        let (finest_size, finest_count) = (finest.block_size(), finest.block_count());
        let fault = |fault: FreeFault| InvalidFreeSnafu { offset, fault }.build();

        let mut chunk = offset.get();
        if chunk >= finest_count * finest_size {
            return Err(fault(FreeFault::OutOfBounds));
        }
        if !chunk.is_multiple_of(finest_size) {
            return Err(fault(FreeFault::Misaligned));
        }
        let mut level = self.alloc_levels[chunk / finest_size]
            .take()
            .map(usize::from)
            .ok_or_else(|| fault(FreeFault::NotAllocated))?;

        while level > 0 {
            let pool = &mut self.pools[level];
            let block_size = pool.block_size();
            let merged = if chunk & block_size == 0 {
                pool.extend_right(&mut self.arena, chunk)
            } else {
                let merged = pool.extend_left(&mut self.arena, chunk);
                if merged {
                    chunk -= block_size;
                }
                merged
            };
            if !merged {
                break;
            }
            level -= 1;
        }

        log::trace!("buddy: free({offset}) -> {chunk:#x} at level {level}");
        self.pools[level].release(&mut self.arena, chunk);
        Ok(())
    }

    fn arena(&self) -> &Arena<'_> {
        &self.arena
    }

    fn payload_mut(&mut self, offset: Offset, len: usize) -> &mut [u8] {
        self.arena.bytes_mut(offset, len)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn with_buddy<F>(len: usize, largest: usize, smallest: usize, test_fn: F)
    where
        F: FnOnce(&mut BuddyAllocator<'_>),
    {
        let mut heap = alloc::vec![0u8; len];
        let arena = Arena::new(&mut heap).unwrap();
        let mut buddy = BuddyAllocator::new(arena, largest, smallest).unwrap();
        test_fn(&mut buddy);
    }

    fn whole(len: usize) -> String {
        format!("+{}", "-".repeat(len - 1))
    }

    #[test]
    fn test_configuration_errors() {
        let mut heap = [0u8; 512];

        let err = BuddyAllocator::new(Arena::new(&mut heap).unwrap(), 500, 16).unwrap_err();
        assert!(err.is_not_power_of_two());
        let err = BuddyAllocator::new(Arena::new(&mut heap).unwrap(), 512, 24).unwrap_err();
        assert!(err.is_not_power_of_two());
        let err = BuddyAllocator::new(Arena::new(&mut heap).unwrap(), 16, 32).unwrap_err();
        assert!(err.is_invalid_size_classes());
        let err = BuddyAllocator::new(Arena::new(&mut heap).unwrap(), 1024, 16).unwrap_err();
        assert!(err.is_arena_too_small());
        let err = BuddyAllocator::new(Arena::new(&mut heap).unwrap(), 512, 8).unwrap_err();
        assert!(err.is_block_too_small());
    }

    #[test]
    fn test_levels() {
        with_buddy(512, 512, 16, |buddy| {
            assert_eq!(buddy.levels(), 6);
            let sizes: Vec<_> = (0..buddy.levels()).map(|l| buddy.block_size(l)).collect();
            assert_eq!(sizes, [512, 256, 128, 64, 32, 16]);
            assert_eq!(buddy.free_bytes(), 512);
        });
    }

    #[test]
    fn test_split_and_recombine() {
        with_buddy(512, 512, 16, |buddy| {
            let a = buddy.alloc(32).unwrap();
            let b = buddy.alloc(32).unwrap();
            let c = buddy.alloc(64).unwrap();
            let d = buddy.alloc(64).unwrap();
            assert_eq!([a, b, c, d].map(Offset::get), [0, 32, 64, 128]);
            assert_eq!(buddy.free_bytes(), 512 - 2 * 32 - 2 * 64);

            buddy.free(a).unwrap();
            buddy.free(b).unwrap();
            buddy.free(d).unwrap();
            buddy.free(c).unwrap();

            assert_eq!(buddy.memory_map(), whole(32));
            assert_eq!(buddy.level_runs(0).count(), 1);
            assert_eq!(buddy.free_bytes(), 512);
        });
    }

    #[test]
    fn test_level_memory_maps() {
        with_buddy(512, 512, 16, |buddy| {
            buddy.alloc(200).unwrap();
            let maps = buddy.level_memory_maps();
            assert_eq!(maps[0], "# 512");
            assert_eq!(maps[1], "#+ 256");
            assert_eq!(maps[5], format!("{} 16", "#".repeat(32)));
            assert_eq!(buddy.memory_map(), format!("{}{}", "#".repeat(16), whole(16)));
        });
    }

    #[test]
    fn test_prefers_finest_available_class() {
        with_buddy(512, 512, 16, |buddy| {
            let a = buddy.alloc(16).unwrap();
            // The split left one free block at every finer level.
            let b = buddy.alloc(100).unwrap();
            assert_eq!(b.get(), 128);
            let c = buddy.alloc(16).unwrap();
            assert_eq!(c.get(), a.get() + 16);
        });
    }

    #[test]
    fn test_out_of_memory() {
        with_buddy(512, 512, 16, |buddy| {
            assert!(buddy.alloc(513).unwrap_err().is_out_of_memory());
            let all = buddy.alloc(512).unwrap();
            assert!(buddy.alloc(1).unwrap_err().is_out_of_memory());
            buddy.free(all).unwrap();
            assert!(buddy.alloc(256).is_ok());
        });
    }

    #[test]
    fn test_multiple_top_level_blocks() {
        with_buddy(4096, 512, 16, |buddy| {
            let blocks: Vec<_> = (0..8).map(|_| buddy.alloc(300).unwrap()).collect();
            assert!(buddy.alloc(16).unwrap_err().is_out_of_memory());
            for block in blocks {
                buddy.free(block).unwrap();
            }
            assert_eq!(buddy.free_bytes(), 4096);
        });
    }

    #[test]
    fn test_invalid_frees_are_rejected() {
        with_buddy(512, 512, 16, |buddy| {
            let a = buddy.alloc(64).unwrap();
            fn fault(buddy: &mut BuddyAllocator<'_>, offset: usize) -> Option<FreeFault> {
                buddy.free(Offset::new(offset)).unwrap_err().free_fault()
            }

            assert_eq!(fault(buddy, 512), Some(FreeFault::OutOfBounds));
            assert_eq!(fault(buddy, 4), Some(FreeFault::Misaligned));
            assert_eq!(fault(buddy, 16), Some(FreeFault::NotAllocated));
            assert_eq!(fault(buddy, 64), Some(FreeFault::NotAllocated));

            buddy.free(a).unwrap();
            assert_eq!(fault(buddy, 0), Some(FreeFault::NotAllocated));
            assert_eq!(buddy.memory_map(), whole(32));
        });
    }

    #[test]
    fn test_zero_sized_request_takes_smallest_block() {
        with_buddy(512, 512, 16, |buddy| {
            let a = buddy.alloc(0).unwrap();
            let b = buddy.alloc(0).unwrap();
            assert_eq!(b.get() - a.get(), 16);
        });
    }

    #[test]
    fn test_coalescing_pools() {
        let mut heap = [0u8; 1024];
        let arena = Arena::new(&mut heap).unwrap();
        let mut buddy =
            BuddyAllocator::with_order(arena, 1024, 16, ChainOrder::AddressOrdered).unwrap();

        let blocks: Vec<_> = (0..64).map(|_| buddy.alloc(16).unwrap()).collect();
        for block in blocks.iter().rev() {
            buddy.free(*block).unwrap();
        }
        assert_eq!(buddy.memory_map(), whole(64));
    }
}
