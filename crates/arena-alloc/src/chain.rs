//! Chains of free runs stored inside the arena.
//!
//! A *run* is a maximal span of contiguous free blocks. Its first block holds a
//! [`RunHeader`] with the run length and the offset of the next run, so a pool
//! needs no storage outside the arena beyond the offset of the first run.
//!
//! ```text
//! block:   0      1      2      3      4      5      6      7
//!        ┌──────┬──────┬──────┬──────┬──────┬──────┬──────┬──────┐
//!        │ used │ 3, ─────────────────────┐│ used │ 2, nil      │
//!        │      │ next │      │      │    ││      │      │      │
//!        └──────┴──────┴──────┴──────┴────┼─┴──────┴──────┴──────┘
//!                                          └──────────▶ block 6
//! ```
//!
//! The chain is either unordered (frees prepend a one-block run) or kept in
//! address order, in which case every free also merges address-adjacent runs.

use alloc::string::String;

use dataview::Pod;
use derive_more::IsVariant;
use snafu::ensure;

use crate::{
    arena::{Arena, Offset},
    error::{ArenaTooSmallSnafu, BlockTooSmallSnafu, ConfigError, FreeFault},
};

/// Encodes "no next run" inside a stored header.
const NIL: usize = usize::MAX;

/// Header written into the first block of every free run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
#[repr(C)]
pub(crate) struct RunHeader {
    /// Length of the run in blocks.
    blocks: usize,
    /// Offset of the next run in the chain, or [`NIL`].
    next: usize,
}

/// The smallest block that can host its own run header while free.
pub const RUN_HEADER_SIZE: usize = size_of::<RunHeader>();

impl RunHeader {
    fn new(blocks: usize, next: Option<usize>) -> Self {
        Self {
            blocks,
            next: next.unwrap_or(NIL),
        }
    }

    fn next(self) -> Option<usize> {
        (self.next != NIL).then_some(self.next)
    }
}

/// How a pool orders its chain of free runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IsVariant)]
pub enum ChainOrder {
    /// Freed blocks are pushed at the head; runs are never merged.
    #[default]
    Unordered,
    /// Runs are kept sorted by offset and merged whenever they touch.
    AddressOrdered,
}

/// A free run as seen by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRun {
    /// Offset of the first free block.
    pub offset: Offset,
    /// Number of contiguous free blocks.
    pub blocks: usize,
}

/// One visited chain node together with its predecessor.
#[derive(Debug, Clone, Copy)]
struct Link {
    prev: Option<usize>,
    at: usize,
    header: RunHeader,
}

/// Iterator over the chain of a [`Pool`].
struct Walk<'s, 'a> {
    arena: &'s Arena<'a>,
    prev: Option<usize>,
    cursor: Option<usize>,
}

impl Iterator for Walk<'_, '_> {
    type Item = Link;

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.cursor?;
        let header = self.arena.read::<RunHeader>(at);
        let link = Link {
            prev: self.prev,
            at,
            header,
        };
        self.prev = Some(at);
        self.cursor = header.next();
        Some(link)
    }
}

/// A single size class: a block size, the number of such blocks covering the
/// arena, and the chain of free runs among them.
#[derive(Debug)]
pub(crate) struct Pool {
    block_size: usize,
    block_count: usize,
    head: Option<usize>,
    order: ChainOrder,
}

impl Pool {
    /// Builds a pool of `block_size` blocks over `arena`.
    ///
    /// With `start_free` the whole pool begins as a single run.
    pub(crate) fn new(
        arena: &mut Arena<'_>,
        block_size: usize,
        start_free: bool,
        order: ChainOrder,
    ) -> Result<Self, ConfigError> {
        ensure!(
            block_size >= RUN_HEADER_SIZE,
            BlockTooSmallSnafu {
                block_size,
                min: RUN_HEADER_SIZE,
            }
        );
        let block_count = arena.len() / block_size;
        ensure!(
            block_count > 0,
            ArenaTooSmallSnafu {
                arena_len: arena.len(),
                block_size,
            }
        );

        let head = start_free.then(|| {
            arena.write(0, &RunHeader::new(block_count, None));
            0
        });

        Ok(Self {
            block_size,
            block_count,
            head,
            order,
        })
    }

    pub(crate) const fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) const fn block_count(&self) -> usize {
        self.block_count
    }

    pub(crate) const fn order(&self) -> ChainOrder {
        self.order
    }

    pub(crate) const fn can_alloc(&self) -> bool {
        self.head.is_some()
    }

    fn walk<'s, 'a>(&self, arena: &'s Arena<'a>) -> Walk<'s, 'a> {
        Walk {
            arena,
            prev: None,
            cursor: self.head,
        }
    }

    /// Iterates over the free runs in chain order.
    pub(crate) fn runs<'s>(&self, arena: &'s Arena<'_>) -> impl Iterator<Item = FreeRun> + 's {
        self.walk(arena).map(|link| FreeRun {
            offset: Offset::new(link.at),
            blocks: link.header.blocks,
        })
    }

    /// Total number of free blocks in the chain.
    pub(crate) fn free_blocks(&self, arena: &Arena<'_>) -> usize {
        self.walk(arena).map(|link| link.header.blocks).sum()
    }

    const fn run_end(&self, link: &Link) -> usize {
        link.at + link.header.blocks * self.block_size
    }

    /// Points `prev` (or the head when `prev` is `None`) at `target`.
    fn relink(&mut self, arena: &mut Arena<'_>, prev: Option<usize>, target: Option<usize>) {
        match prev {
            Some(prev) => {
                let header = arena.read::<RunHeader>(prev);
                arena.write(prev, &RunHeader::new(header.blocks, target));
            }
            None => self.head = target,
        }
    }

    /// Drops the first block of the run at `run` and returns what replaces it
    /// in the chain.
    ///
    /// A multi-block run is shrunk by writing a new header into the block that
    /// follows, keeping the same `next`; the other blocks are not touched.
    fn forward_one(&self, arena: &mut Arena<'_>, run: usize) -> Option<usize> {
        let header = arena.read::<RunHeader>(run);
        if header.blocks == 1 {
            return header.next();
        }
        let rest = run + self.block_size;
        arena.write(rest, &RunHeader::new(header.blocks - 1, header.next()));
        Some(rest)
    }

    /// Takes the first block of the first run.
    pub(crate) fn alloc_block(&mut self, arena: &mut Arena<'_>) -> Option<usize> {
        let block = self.head?;
        self.head = self.forward_one(arena, block);
        log::trace!(
            "pool[{}]: alloc block #{} @ {:#x}",
            self.block_size,
            block / self.block_size,
            block
        );
        Some(block)
    }

    /// Returns `block` to the chain without validating it.
    pub(crate) fn release(&mut self, arena: &mut Arena<'_>, block: usize) {
        log::trace!(
            "pool[{}]: free block #{} @ {:#x}",
            self.block_size,
            block / self.block_size,
            block
        );
        match self.order {
            ChainOrder::Unordered => {
                arena.write(block, &RunHeader::new(1, self.head));
                self.head = Some(block);
            }
            ChainOrder::AddressOrdered => {
                let prev = self
                    .walk(arena)
                    .take_while(|link| link.at < block)
                    .last()
                    .map(|link| link.at);
                let next = match prev {
                    Some(prev) => arena.read::<RunHeader>(prev).next(),
                    None => self.head,
                };
                arena.write(block, &RunHeader::new(1, next));
                self.relink(arena, prev, Some(block));

                self.coalesce(arena, block);
                if let Some(prev) = prev {
                    self.coalesce(arena, prev);
                }
            }
        }
    }

    /// Absorbs the successor of `run` if it starts where `run` ends.
    fn coalesce(&self, arena: &mut Arena<'_>, run: usize) -> bool {
        let header = arena.read::<RunHeader>(run);
        let Some(next) = header.next() else {
            return false;
        };
        if run + header.blocks * self.block_size != next {
            return false;
        }
        let next_header = arena.read::<RunHeader>(next);
        arena.write(
            run,
            &RunHeader::new(header.blocks + next_header.blocks, next_header.next()),
        );
        true
    }

    /// Claims the free block directly after `block`, if there is one.
    ///
    /// `block` itself must not be free in this pool.
    pub(crate) fn extend_right(&mut self, arena: &mut Arena<'_>, block: usize) -> bool {
        let target = block + self.block_size;
        let ordered = self.order.is_address_ordered();
        let found = self
            .walk(arena)
            .take_while(|link| !ordered || link.at <= target)
            .find(|link| link.at == target);
        let Some(link) = found else {
            return false;
        };
        let replacement = self.forward_one(arena, link.at);
        self.relink(arena, link.prev, replacement);
        log::trace!("pool[{}]: extend {block:#x} right", self.block_size);
        true
    }

    /// Claims the free block directly before `block`, if there is one.
    ///
    /// On success the merged block starts one block below `block`. `block`
    /// itself must not be free in this pool.
    pub(crate) fn extend_left(&mut self, arena: &mut Arena<'_>, block: usize) -> bool {
        let ordered = self.order.is_address_ordered();
        let found = self
            .walk(arena)
            .take_while(|link| !ordered || link.at < block)
            .find(|link| self.run_end(link) == block);
        let Some(link) = found else {
            return false;
        };
        if link.header.blocks == 1 {
            self.relink(arena, link.prev, link.header.next());
        } else {
            arena.write(
                link.at,
                &RunHeader::new(link.header.blocks - 1, link.header.next()),
            );
        }
        log::trace!("pool[{}]: extend {block:#x} left", self.block_size);
        true
    }

    /// Checks that `offset` names a block of this pool that is not free.
    pub(crate) fn check_allocated(&self, arena: &Arena<'_>, offset: usize) -> Result<(), FreeFault> {
        if offset >= self.block_count * self.block_size {
            return Err(FreeFault::OutOfBounds);
        }
        if !offset.is_multiple_of(self.block_size) {
            return Err(FreeFault::Misaligned);
        }
        if self
            .walk(arena)
            .any(|link| link.at <= offset && offset < self.run_end(&link))
        {
            return Err(FreeFault::AlreadyFree);
        }
        Ok(())
    }

    /// Renders one character per block: `#` used, `+` run start, `-` free.
    pub(crate) fn memory_map(&self, arena: &Arena<'_>) -> String {
        let mut map = alloc::vec![b'#'; self.block_count];
        for link in self.walk(arena) {
            let first = link.at / self.block_size;
            map[first] = b'+';
            map[first + 1..first + link.header.blocks].fill(b'-');
        }
        map.into_iter().map(char::from).collect()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    const BS: usize = 16;

    fn runs(pool: &Pool, arena: &Arena<'_>) -> Vec<(usize, usize)> {
        pool.runs(arena)
            .map(|run| (run.offset.get(), run.blocks))
            .collect()
    }

    #[test]
    fn test_block_must_hold_header() {
        let mut buffer = [0u8; 128];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let err = Pool::new(&mut arena, RUN_HEADER_SIZE - 1, true, ChainOrder::Unordered)
            .unwrap_err();
        assert!(err.is_block_too_small());
    }

    #[test]
    fn test_arena_must_hold_a_block() {
        let mut buffer = [0u8; 24];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let err = Pool::new(&mut arena, 32, true, ChainOrder::Unordered).unwrap_err();
        assert!(err.is_arena_too_small());
    }

    #[test]
    fn test_start_free_covers_every_block() {
        let mut buffer = [0u8; 8 * BS];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let pool = Pool::new(&mut arena, BS, true, ChainOrder::Unordered).unwrap();
        assert_eq!(runs(&pool, &arena), [(0, 8)]);
        assert_eq!(pool.memory_map(&arena), "+-------");

        let empty = Pool::new(&mut arena, BS, false, ChainOrder::Unordered).unwrap();
        assert!(!empty.can_alloc());
        assert_eq!(empty.memory_map(&arena), "########");
    }

    #[test]
    fn test_forward_one_keeps_next() {
        let mut buffer = [0u8; 8 * BS];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let mut pool = Pool::new(&mut arena, BS, false, ChainOrder::AddressOrdered).unwrap();
        for block in [0, 1, 2, 6] {
            pool.release(&mut arena, block * BS);
        }
        assert_eq!(runs(&pool, &arena), [(0, 3), (6 * BS, 1)]);

        assert_eq!(pool.alloc_block(&mut arena), Some(0));
        assert_eq!(runs(&pool, &arena), [(BS, 2), (6 * BS, 1)]);
        assert_eq!(
            arena.read::<RunHeader>(BS),
            RunHeader::new(2, Some(6 * BS))
        );
    }

    #[test]
    fn test_unordered_free_prepends() {
        let mut buffer = [0u8; 4 * BS];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let mut pool = Pool::new(&mut arena, BS, false, ChainOrder::Unordered).unwrap();
        pool.release(&mut arena, 0);
        pool.release(&mut arena, BS);
        assert_eq!(runs(&pool, &arena), [(BS, 1), (0, 1)]);
        assert_eq!(pool.memory_map(&arena), "++##");
    }

    #[test]
    fn test_ordered_free_coalesces_both_sides() {
        let mut buffer = [0u8; 4 * BS];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let mut pool = Pool::new(&mut arena, BS, false, ChainOrder::AddressOrdered).unwrap();
        pool.release(&mut arena, 2 * BS);
        pool.release(&mut arena, 0);
        assert_eq!(runs(&pool, &arena), [(0, 1), (2 * BS, 1)]);

        pool.release(&mut arena, BS);
        assert_eq!(runs(&pool, &arena), [(0, 3)]);
        assert_eq!(pool.memory_map(&arena), "+--#");
    }

    #[test]
    fn test_extend_right() {
        for order in [ChainOrder::Unordered, ChainOrder::AddressOrdered] {
            let mut buffer = [0u8; 4 * BS];
            let mut arena = Arena::new(&mut buffer).unwrap();
            let mut pool = Pool::new(&mut arena, BS, false, order).unwrap();
            pool.release(&mut arena, 3 * BS);
            pool.release(&mut arena, BS);

            assert!(pool.extend_right(&mut arena, 0));
            assert_eq!(runs(&pool, &arena), [(3 * BS, 1)]);
            assert!(!pool.extend_right(&mut arena, BS));
            assert!(pool.extend_right(&mut arena, 2 * BS));
            assert!(!pool.can_alloc());
        }
    }

    #[test]
    fn test_extend_right_shrinks_long_run() {
        let mut buffer = [0u8; 4 * BS];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let mut pool = Pool::new(&mut arena, BS, true, ChainOrder::Unordered).unwrap();
        assert_eq!(pool.alloc_block(&mut arena), Some(0));

        assert!(pool.extend_right(&mut arena, 0));
        assert_eq!(runs(&pool, &arena), [(2 * BS, 2)]);
    }

    #[test]
    fn test_extend_left() {
        for order in [ChainOrder::Unordered, ChainOrder::AddressOrdered] {
            let mut buffer = [0u8; 4 * BS];
            let mut arena = Arena::new(&mut buffer).unwrap();
            let mut pool = Pool::new(&mut arena, BS, false, order).unwrap();
            pool.release(&mut arena, 0);
            pool.release(&mut arena, 2 * BS);

            assert!(pool.extend_left(&mut arena, 3 * BS));
            assert_eq!(runs(&pool, &arena), [(0, 1)]);
            assert!(!pool.extend_left(&mut arena, 2 * BS));
            assert!(pool.extend_left(&mut arena, BS));
            assert!(!pool.can_alloc());
        }
    }

    #[test]
    fn test_extend_left_shortens_run_end() {
        let mut buffer = [0u8; 4 * BS];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let mut pool = Pool::new(&mut arena, BS, false, ChainOrder::AddressOrdered).unwrap();
        pool.release(&mut arena, 0);
        pool.release(&mut arena, BS);
        pool.release(&mut arena, 2 * BS);

        assert!(pool.extend_left(&mut arena, 3 * BS));
        assert_eq!(runs(&pool, &arena), [(0, 2)]);
    }

    #[test]
    fn test_check_allocated() {
        let mut buffer = [0u8; 4 * BS];
        let mut arena = Arena::new(&mut buffer).unwrap();
        let mut pool = Pool::new(&mut arena, BS, true, ChainOrder::Unordered).unwrap();
        let block = pool.alloc_block(&mut arena).unwrap();

        assert_eq!(pool.check_allocated(&arena, block), Ok(()));
        assert_eq!(pool.check_allocated(&arena, block + 1), Err(FreeFault::Misaligned));
        assert_eq!(pool.check_allocated(&arena, 2 * BS), Err(FreeFault::AlreadyFree));
        assert_eq!(pool.check_allocated(&arena, 4 * BS), Err(FreeFault::OutOfBounds));
    }
}
