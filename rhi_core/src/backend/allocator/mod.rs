//! Sub-allocators that carve resource regions out of a single device memory page.
//!
//! Offsets and sizes are in bytes of device memory, so they are always `u64` regardless of the
//! host pointer width.

mod buddy;

use std::num::NonZeroU64;

pub use buddy::BuddyAllocator;

pub trait Allocator {
    /// Allocates a [`Region`] of at least `size` bytes whose offset is a multiple of `align`.
    ///
    /// Returns `None` if no free region can hold the request.
    fn alloc(&mut self, size: NonZeroU64, align: NonZeroU64) -> Option<Region>;

    /// Returns a [`Region`] back to the allocator.
    ///
    /// # Safety
    ///
    /// `region` must have been returned by [`alloc`] on the same allocator and must only be
    /// deallocated once.
    ///
    /// [`alloc`]: Self::alloc
    unsafe fn dealloc(&mut self, region: Region);
}

/// A byte range inside a memory page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    offset: u64,
    size: u64,
}

impl Region {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub const fn start(&self) -> u64 {
        self.offset
    }

    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn overlaps(&self, other: &Region) -> bool {
        self.start() < other.end() && other.start() < self.end()
    }
}
