//! The fixed backing region every allocator carves its blocks from.
//!
//! An [`Arena`] borrows a statically reserved byte buffer for the lifetime of
//! the allocator built on top of it. Blocks are addressed by [`Offset`]s
//! relative to the start of the buffer; free-run bookkeeping is stored inside
//! the free blocks themselves through a [`DataView`] over the buffer.

use dataview::{DataView, Pod};
use derive_more::{Display, From, Into};
use snafu::ensure;

use crate::error::{ConfigError, EmptyArenaSnafu};

/// A byte offset into an [`Arena`].
///
/// This is the allocators' notion of a pointer: [`Allocator::alloc`] returns
/// one and [`Allocator::free`] takes it back.
///
/// [`Allocator::alloc`]: crate::Allocator::alloc
/// [`Allocator::free`]: crate::Allocator::free
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[display("{_0:#x}")]
pub struct Offset(usize);

impl Offset {
    #[must_use]
    pub const fn new(offset: usize) -> Self {
        Self(offset)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// A contiguous, never-resized byte region.
#[derive(Debug)]
pub struct Arena<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Arena<'a> {
    /// Wraps `bytes` as an arena.
    pub fn new(bytes: &'a mut [u8]) -> Result<Self, ConfigError> {
        ensure!(!bytes.is_empty(), EmptyArenaSnafu);
        Ok(Self { bytes })
    }

    /// Size of the region in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the address of the byte at `offset`.
    ///
    /// This is plain address arithmetic; the caller keeps `offset` inside
    /// `0..len()`.
    #[must_use]
    pub fn at(&self, offset: Offset) -> *const u8 {
        self.bytes.as_ptr().wrapping_add(offset.get())
    }

    /// Returns the offset of `address`, or `None` if it lies outside the
    /// region.
    #[must_use]
    pub fn offset_of(&self, address: *const u8) -> Option<Offset> {
        let offset = address.addr().checked_sub(self.bytes.as_ptr().addr())?;
        (offset < self.len()).then_some(Offset(offset))
    }

    /// Payload bytes `offset..offset + len`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not inside the region.
    #[must_use]
    pub fn bytes(&self, offset: Offset, len: usize) -> &[u8] {
        &self.bytes[offset.get()..][..len]
    }

    /// Mutable payload bytes `offset..offset + len`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not inside the region.
    pub fn bytes_mut(&mut self, offset: Offset, len: usize) -> &mut [u8] {
        &mut self.bytes[offset.get()..][..len]
    }

    pub(crate) fn read<T: Pod>(&self, offset: usize) -> T {
        DataView::from(&*self.bytes).read(offset)
    }

    pub(crate) fn write<T: Pod>(&mut self, offset: usize, value: &T) {
        DataView::from_mut(&mut *self.bytes).write(offset, value);
    }
}
