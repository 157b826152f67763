use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;
use slab::Slab;

/// Counters shared by all components of a [`Device`].
///
/// [`Device`]: crate::Device
#[derive(Debug, Default)]
pub struct Statistics {
    pub memory: RwLock<MemoryStatistics>,
    pub pipelines_created: Counter,
    pub render_passes_created: Counter,
    pub framebuffers_created: Counter,
    pub samplers_created: Counter,
    pub descriptor_heaps_created: Counter,
    pub command_buffers_allocated: Counter,
    pub submissions: Counter,
    /// Total size of all staging blocks.
    pub staging_allocated: Counter,
    /// Bytes of staging memory handed out and not yet released.
    pub staging_used: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStatistics {
    pub blocks: Slab<MemoryBlock>,
}

impl MemoryStatistics {
    /// Returns the total size of all memory blocks.
    pub fn allocated(&self) -> u64 {
        self.blocks.iter().map(|(_, block)| block.size).sum()
    }

    /// Returns the number of bytes in use across all memory blocks.
    pub fn used(&self) -> u64 {
        self.blocks.iter().map(|(_, block)| block.used).sum()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryBlock {
    pub size: u64,
    pub used: u64,
    pub allocs: HashMap<u64, MemoryAlloc>,
    pub memory_type: u32,
    pub dedicated: bool,
    pub device_local: bool,
    pub host_visible: bool,
}

#[derive(Clone, Debug)]
pub struct MemoryAlloc {
    pub offset: u64,
    pub size: u64,
    pub kind: AllocationKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    Buffer,
    Texture,
    Staging,
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn sub(&self, n: u64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    pub(crate) fn increment(&self) {
        self.add(1);
    }
}
