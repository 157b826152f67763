use std::num::NonZeroU64;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use rhi_tracing::trace_span;
use slab::Slab;

use crate::backend::allocator::{Allocator, BuddyAllocator, Region};
use crate::backend::{
    AdapterMemoryProperties, BackendError, Driver, MemoryRequirements, MemoryType,
    MemoryTypeFlags, RawMemory,
};
use crate::config::MemoryConfig;
use crate::error::Error;
use crate::statistics::{AllocationKind, MemoryAlloc, MemoryBlock, Statistics};

const GROWTH_FACTOR: NonZeroU64 = NonZeroU64::new(2).unwrap();

/// How the CPU and GPU access a resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeviceAccess {
    /// Only read by the GPU. Contents are written through copies.
    #[default]
    GpuRead,
    GpuReadWrite,
    /// Written by the GPU and read back on the CPU.
    CpuRead,
    /// Written by the CPU, only used as a copy source.
    CpuWrite,
    /// Written by the CPU and read by the GPU directly.
    GpuReadCpuWrite,
}

impl DeviceAccess {
    pub const fn is_host_visible(&self) -> bool {
        matches!(self, Self::CpuRead | Self::CpuWrite | Self::GpuReadCpuWrite)
    }

    /// Returns the memory properties a memory type must have for this access.
    pub fn required_flags(&self) -> MemoryTypeFlags {
        match self {
            Self::GpuRead | Self::GpuReadWrite => MemoryTypeFlags::DEVICE_LOCAL,
            Self::CpuRead | Self::CpuWrite | Self::GpuReadCpuWrite => {
                MemoryTypeFlags::HOST_VISIBLE | MemoryTypeFlags::HOST_COHERENT
            }
        }
    }

    /// Returns the properties used when no memory type has the [`required_flags`].
    ///
    /// [`required_flags`]: Self::required_flags
    pub fn relaxed_flags(&self) -> MemoryTypeFlags {
        self.required_flags() - MemoryTypeFlags::HOST_COHERENT
    }
}

/// Returns the memory types usable for `access` out of `candidates` in order of preference.
///
/// Memory types with all [`required_flags`] come first. If none exists the coherency
/// requirement is dropped once. Returns `None` if no memory type qualifies after that.
///
/// [`required_flags`]: DeviceAccess::required_flags
pub fn select_memory_types(
    types: &[MemoryType],
    candidates: &[u32],
    access: DeviceAccess,
) -> Option<MemorySelection> {
    let filter = |required: MemoryTypeFlags| {
        let mut ids: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|id| types[*id as usize].flags.contains(required))
            .collect();

        // Highest weight first. The sort is stable so driver order breaks ties.
        ids.sort_by_key(|id| std::cmp::Reverse(weight(types[*id as usize].flags, access)));
        ids
    };

    let memory_types = filter(access.required_flags());
    if !memory_types.is_empty() {
        return Some(MemorySelection {
            memory_types,
            relaxed: false,
        });
    }

    let memory_types = filter(access.relaxed_flags());
    if !memory_types.is_empty() {
        return Some(MemorySelection {
            memory_types,
            relaxed: true,
        });
    }

    None
}

fn weight(flags: MemoryTypeFlags, access: DeviceAccess) -> u8 {
    // Preference as follows:
    // GPU access:
    // 1. Memory that is exactly `DEVICE_LOCAL` and nothing else.
    // 2. Memory that is not `HOST_VISIBLE` (not taking away from mappable memory).
    // CPU reads:
    // 1. Memory that is `HOST_CACHED`.
    // 2. Memory that is not `DEVICE_LOCAL`, reading over PCIe is slow.
    // CPU writes:
    // 1. Memory that is not `HOST_CACHED` (write-combined).
    let prefs: &[fn(MemoryTypeFlags) -> bool] = match access {
        DeviceAccess::GpuRead | DeviceAccess::GpuReadWrite => &[
            |flags| flags == MemoryTypeFlags::DEVICE_LOCAL,
            |flags| !flags.contains(MemoryTypeFlags::HOST_VISIBLE),
        ],
        DeviceAccess::CpuRead => &[
            |flags| flags.contains(MemoryTypeFlags::HOST_CACHED),
            |flags| !flags.contains(MemoryTypeFlags::DEVICE_LOCAL),
        ],
        DeviceAccess::CpuWrite | DeviceAccess::GpuReadCpuWrite => {
            &[|flags| !flags.contains(MemoryTypeFlags::HOST_CACHED)]
        }
    };

    prefs
        .iter()
        .enumerate()
        .map(|(index, f)| u8::from(f(flags)) << (prefs.len() - index))
        .sum()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemorySelection {
    pub memory_types: Vec<u32>,
    /// Whether the coherency requirement had to be dropped.
    pub relaxed: bool,
}

/// Allocates device memory for resources.
///
/// Small allocations are packed into pages of a [`PagePool`] per memory type, large ones get a
/// dedicated memory block.
#[derive(Debug)]
pub struct MemoryAllocator {
    driver: Arc<dyn Driver>,
    properties: AdapterMemoryProperties,
    pages: Mutex<HashMap<u32, PagePool>>,
    statistics: Arc<Statistics>,
    min_page_size: NonZeroU64,
    dedicated_threshold: u64,
}

impl MemoryAllocator {
    pub fn new(driver: Arc<dyn Driver>, config: &MemoryConfig, statistics: Arc<Statistics>) -> Self {
        let properties = driver.memory_properties();

        let min_page_size = NonZeroU64::new(config.min_page_size.max(1))
            .and_then(|size| size.checked_next_power_of_two())
            .unwrap_or(NonZeroU64::MIN);

        Self {
            pages: Mutex::new(HashMap::with_capacity(properties.types.len())),
            driver,
            properties,
            statistics,
            min_page_size,
            dedicated_threshold: config.dedicated_threshold,
        }
    }

    pub fn properties(&self) -> &AdapterMemoryProperties {
        &self.properties
    }

    /// Allocates memory for a resource with the given requirements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if no suitable memory type exists or all suitable memory
    /// types are exhausted.
    pub fn alloc(
        &self,
        req: &MemoryRequirements,
        access: DeviceAccess,
        kind: AllocationKind,
    ) -> Result<MemoryAllocation, Error> {
        let _span = trace_span!("MemoryAllocator::alloc").entered();

        let out_of_memory = Error::OutOfMemory {
            size: req.size.get(),
            access,
        };

        let Some(selection) = select_memory_types(&self.properties.types, &req.memory_types, access)
        else {
            tracing::error!(
                "no memory type for {:?} with {:?} access (candidates {:?})",
                req,
                access,
                req.memory_types,
            );
            return Err(out_of_memory);
        };

        if selection.relaxed {
            tracing::warn!(
                "no host-coherent memory for {:?} access, falling back to non-coherent memory",
                access,
            );
        }

        let host_visible = access.is_host_visible();
        let use_dedicated = req.size.get() >= self.dedicated_threshold
            || req.size > self.properties.max_allocation_size;

        for &memory_type in &selection.memory_types {
            let result = if use_dedicated {
                self.alloc_dedicated(req, memory_type, host_visible, kind)
            } else {
                self.alloc_paged(req, memory_type, host_visible, kind)
            };

            match result {
                Ok(allocation) => return Ok(allocation),
                Err(BackendError::DeviceLost) => return Err(Error::DeviceLost),
                Err(err) => {
                    tracing::error!(
                        "allocation of {:?} for memory type {} failed: {}",
                        req,
                        memory_type,
                        err,
                    );
                }
            }
        }

        Err(out_of_memory)
    }

    fn alloc_dedicated(
        &self,
        req: &MemoryRequirements,
        memory_type: u32,
        host_visible: bool,
        kind: AllocationKind,
    ) -> Result<MemoryAllocation, BackendError> {
        let memory = self.driver.allocate_memory(req.size, memory_type)?;

        let ptr = if host_visible {
            match self.driver.map_memory(memory) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    unsafe {
                        self.driver.free_memory(memory);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let flags = self.properties.types[memory_type as usize].flags;

        let mut stats = self.statistics.memory.write();
        let stats_block_index = stats.blocks.insert(MemoryBlock {
            size: req.size.get(),
            used: 0,
            allocs: HashMap::new(),
            memory_type,
            dedicated: true,
            device_local: flags.contains(MemoryTypeFlags::DEVICE_LOCAL),
            host_visible,
        });
        record_alloc(&mut stats.blocks[stats_block_index], 0, req.size.get(), kind);

        Ok(MemoryAllocation {
            memory,
            memory_type,
            strategy: Strategy::Dedicated,
            region: Region::new(0, req.size.get()),
            ptr,
            flags,
            stats_block_index,
            size: req.size.get(),
        })
    }

    fn alloc_paged(
        &self,
        req: &MemoryRequirements,
        memory_type: u32,
        host_visible: bool,
        kind: AllocationKind,
    ) -> Result<MemoryAllocation, BackendError> {
        let mut pages = self.pages.lock();
        let pool = pages.entry(memory_type).or_insert_with(|| PagePool {
            pages: Slab::new(),
            memory_type,
            next_page_size: self.min_page_size,
        });

        let allocation = pool.alloc(
            self.driver.as_ref(),
            &self.properties,
            req,
            host_visible,
            &self.statistics,
        )?;

        let mut stats = self.statistics.memory.write();
        record_alloc(
            &mut stats.blocks[allocation.stats_block_index],
            allocation.region.start(),
            req.size.get(),
            kind,
        );

        Ok(MemoryAllocation {
            memory: allocation.memory,
            memory_type,
            strategy: Strategy::PagePool {
                page_index: allocation.page_index,
            },
            region: allocation.region,
            ptr: allocation.ptr,
            flags: self.properties.types[memory_type as usize].flags,
            stats_block_index: allocation.stats_block_index,
            size: req.size.get(),
        })
    }

    /// Returns an allocation back to the allocator.
    ///
    /// # Safety
    ///
    /// The allocation must have been returned by [`alloc`] of this allocator and no resource
    /// bound to it may still be in use by the GPU.
    ///
    /// [`alloc`]: Self::alloc
    pub unsafe fn dealloc(&self, allocation: MemoryAllocation) {
        let _span = trace_span!("MemoryAllocator::dealloc").entered();

        {
            let mut stats = self.statistics.memory.write();
            let block = &mut stats.blocks[allocation.stats_block_index];
            block.used -= allocation.size;
            block.allocs.remove(&(allocation.region.start()));
        }

        match allocation.strategy {
            Strategy::Dedicated => {
                self.statistics
                    .memory
                    .write()
                    .blocks
                    .remove(allocation.stats_block_index);

                // SAFETY: The caller guarantees that the memory is no longer used.
                unsafe {
                    self.driver.free_memory(allocation.memory);
                }
            }
            Strategy::PagePool { page_index } => {
                let mut pages = self.pages.lock();
                let pool = pages
                    .get_mut(&allocation.memory_type)
                    .expect("page pool for allocation does not exist");

                // SAFETY: The caller guarantees that the allocation is valid.
                unsafe {
                    pool.dealloc(
                        self.driver.as_ref(),
                        &self.statistics,
                        page_index,
                        allocation.region,
                    );
                }
            }
        }
    }

    /// Returns the number of pages currently allocated for `memory_type`.
    pub fn page_count(&self, memory_type: u32) -> usize {
        self.pages
            .lock()
            .get(&memory_type)
            .map(|pool| pool.pages.len())
            .unwrap_or(0)
    }
}

fn record_alloc(block: &mut MemoryBlock, offset: u64, size: u64, kind: AllocationKind) {
    block.used += size;
    block.allocs.insert(offset, MemoryAlloc { offset, size, kind });
}

/// A region of device memory bound to a single resource.
#[derive(Debug)]
pub struct MemoryAllocation {
    memory: RawMemory,
    memory_type: u32,
    strategy: Strategy,
    region: Region,
    ptr: Option<NonNull<u8>>,
    flags: MemoryTypeFlags,
    stats_block_index: usize,
    size: u64,
}

// SAFETY: `ptr` points into persistently mapped memory that is only freed through
// `MemoryAllocator::dealloc`, which consumes the allocation.
unsafe impl Send for MemoryAllocation {}
unsafe impl Sync for MemoryAllocation {}

impl MemoryAllocation {
    pub fn memory(&self) -> RawMemory {
        self.memory
    }

    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// Returns the offset of the allocation inside its memory block.
    pub fn offset(&self) -> u64 {
        self.region.start()
    }

    /// Returns the requested size of the allocation.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn flags(&self) -> MemoryTypeFlags {
        self.flags
    }

    pub fn is_dedicated(&self) -> bool {
        matches!(self.strategy, Strategy::Dedicated)
    }

    /// Returns a pointer to the start of the allocation if the memory is host visible.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    /// Returns the range the allocation covers in its memory block.
    pub fn memory_range(&self) -> Range<u64> {
        self.offset()..self.offset() + self.size
    }
}

/// Allocation strategy.
#[derive(Copy, Clone, Debug)]
enum Strategy {
    Dedicated,
    PagePool { page_index: usize },
}

#[derive(Debug)]
struct PagePool {
    pages: Slab<Page>,
    memory_type: u32,
    next_page_size: NonZeroU64,
}

impl PagePool {
    fn alloc(
        &mut self,
        driver: &dyn Driver,
        props: &AdapterMemoryProperties,
        req: &MemoryRequirements,
        host_visible: bool,
        stats: &Statistics,
    ) -> Result<PagePoolAllocation, BackendError> {
        for (page_index, page) in &mut self.pages {
            let Some(region) = page.allocator.alloc(req.size, req.align) else {
                continue;
            };

            // SAFETY: The region lies within the mapped page.
            let ptr = page.ptr.map(|ptr| unsafe { ptr.add(region.start() as usize) });

            page.num_allocs += 1;
            return Ok(PagePoolAllocation {
                memory: page.memory,
                page_index,
                region,
                ptr,
                stats_block_index: page.stats_block_index,
            });
        }

        let size_padded = req
            .size
            .get()
            .checked_next_multiple_of(req.align.get())
            .and_then(NonZeroU64::new)
            .ok_or(BackendError::OutOfDeviceMemory)?;
        let page_size = self
            .next_page_size
            .max(size_padded)
            .checked_next_power_of_two()
            .ok_or(BackendError::OutOfDeviceMemory)?;

        let max_size_pow2 = prev_power_of_two(props.max_allocation_size);
        if page_size > max_size_pow2 {
            return Err(BackendError::OutOfDeviceMemory);
        }
        self.next_page_size = page_size.saturating_mul(GROWTH_FACTOR).min(max_size_pow2);

        let memory = driver.allocate_memory(page_size, self.memory_type)?;
        let ptr = if host_visible {
            match driver.map_memory(memory) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    unsafe {
                        driver.free_memory(memory);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        tracing::debug!(
            "new {} byte page for memory type {}",
            page_size,
            self.memory_type
        );

        let flags = props.types[self.memory_type as usize].flags;
        let stats_block_index = stats.memory.write().blocks.insert(MemoryBlock {
            size: page_size.get(),
            used: 0,
            allocs: HashMap::new(),
            memory_type: self.memory_type,
            dedicated: false,
            device_local: flags.contains(MemoryTypeFlags::DEVICE_LOCAL),
            host_visible,
        });

        let mut allocator = BuddyAllocator::new(Region::new(0, page_size.get()));
        // A fresh page is at least as large as the padded request.
        let region = allocator
            .alloc(req.size, req.align)
            .ok_or(BackendError::OutOfDeviceMemory)?;

        let page_index = self.pages.insert(Page {
            memory,
            allocator,
            num_allocs: 1,
            ptr,
            stats_block_index,
        });

        Ok(PagePoolAllocation {
            memory,
            page_index,
            region,
            ptr: ptr.map(|ptr| unsafe { ptr.add(region.start() as usize) }),
            stats_block_index,
        })
    }

    /// Deallocates an allocation made in this `PagePool`.
    ///
    /// Pages without any remaining allocations are released back to the driver.
    ///
    /// # Safety
    ///
    /// The given `page_index` and `region` must have previously been returned by [`alloc`]. Every
    /// allocation must only be deallocated once.
    ///
    /// [`alloc`]: Self::alloc
    unsafe fn dealloc(
        &mut self,
        driver: &dyn Driver,
        stats: &Statistics,
        page_index: usize,
        region: Region,
    ) {
        let page = &mut self.pages[page_index];

        // SAFETY: The caller guarantees that the region was previously
        // allocated in this page.
        unsafe {
            page.allocator.dealloc(region);
        }

        debug_assert_ne!(page.num_allocs, 0);
        page.num_allocs -= 1;

        if page.num_allocs == 0 {
            let page = self.pages.remove(page_index);
            stats.memory.write().blocks.remove(page.stats_block_index);

            // SAFETY: No allocations remain in the page.
            unsafe {
                driver.free_memory(page.memory);
            }
        }
    }
}

#[derive(Debug)]
struct Page {
    memory: RawMemory,
    allocator: BuddyAllocator,
    num_allocs: usize,
    ptr: Option<NonNull<u8>>,
    stats_block_index: usize,
}

// SAFETY: `ptr` is only dereferenced by the owners of allocations inside the page.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

#[derive(Copy, Clone, Debug)]
struct PagePoolAllocation {
    memory: RawMemory,
    page_index: usize,
    region: Region,
    ptr: Option<NonNull<u8>>,
    stats_block_index: usize,
}

/// Returns the previous power of two value.
fn prev_power_of_two(x: NonZeroU64) -> NonZeroU64 {
    // `x` is not zero, so `leading_zeros` is at most 63 and the shift is
    // always in range. A shifted one is never zero.
    NonZeroU64::new(1 << (u64::BITS - 1 - x.leading_zeros())).unwrap_or(NonZeroU64::MIN)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::sync::Arc;

    use crate::backend::null::{NullAdapter, NullDriver};
    use crate::backend::{MemoryRequirements, MemoryType, MemoryTypeFlags};
    use crate::config::MemoryConfig;
    use crate::error::Error;
    use crate::statistics::{AllocationKind, Statistics};

    use super::{prev_power_of_two, select_memory_types, DeviceAccess, MemoryAllocator};

    fn types(flags: &[MemoryTypeFlags]) -> Vec<MemoryType> {
        flags
            .iter()
            .enumerate()
            .map(|(id, flags)| MemoryType {
                id: id as u32,
                heap: 0,
                flags: *flags,
            })
            .collect()
    }

    fn req(size: u64, align: u64, memory_types: Vec<u32>) -> MemoryRequirements {
        MemoryRequirements {
            size: NonZeroU64::new(size).unwrap(),
            align: NonZeroU64::new(align).unwrap(),
            memory_types,
        }
    }

    fn allocator(adapter: NullAdapter) -> (MemoryAllocator, Arc<Statistics>) {
        let statistics = Arc::new(Statistics::default());
        let driver = Arc::new(NullDriver::new(adapter));
        let allocator = MemoryAllocator::new(driver, &MemoryConfig::default(), statistics.clone());
        (allocator, statistics)
    }

    #[test]
    fn select_prefers_pure_device_local() {
        let types = types(&[
            MemoryTypeFlags::DEVICE_LOCAL
                | MemoryTypeFlags::HOST_VISIBLE
                | MemoryTypeFlags::HOST_COHERENT,
            MemoryTypeFlags::HOST_VISIBLE | MemoryTypeFlags::HOST_COHERENT,
            MemoryTypeFlags::DEVICE_LOCAL,
        ]);

        let selection = select_memory_types(&types, &[0, 1, 2], DeviceAccess::GpuRead).unwrap();
        assert_eq!(selection.memory_types, [2, 0]);
        assert!(!selection.relaxed);
    }

    #[test]
    fn select_prefers_cached_for_readback() {
        let types = types(&[
            MemoryTypeFlags::HOST_VISIBLE | MemoryTypeFlags::HOST_COHERENT,
            MemoryTypeFlags::HOST_VISIBLE
                | MemoryTypeFlags::HOST_COHERENT
                | MemoryTypeFlags::HOST_CACHED,
        ]);

        let selection = select_memory_types(&types, &[0, 1], DeviceAccess::CpuRead).unwrap();
        assert_eq!(selection.memory_types, [1, 0]);

        let selection = select_memory_types(&types, &[0, 1], DeviceAccess::CpuWrite).unwrap();
        assert_eq!(selection.memory_types, [0, 1]);
    }

    #[test]
    fn select_relaxes_coherency_once() {
        let types = types(&[
            MemoryTypeFlags::DEVICE_LOCAL,
            MemoryTypeFlags::HOST_VISIBLE | MemoryTypeFlags::HOST_CACHED,
        ]);

        let selection =
            select_memory_types(&types, &[0, 1], DeviceAccess::GpuReadCpuWrite).unwrap();
        assert_eq!(selection.memory_types, [1]);
        assert!(selection.relaxed);
    }

    #[test]
    fn select_respects_candidates() {
        let types = types(&[
            MemoryTypeFlags::DEVICE_LOCAL,
            MemoryTypeFlags::HOST_VISIBLE | MemoryTypeFlags::HOST_COHERENT,
        ]);

        assert!(select_memory_types(&types, &[0], DeviceAccess::CpuWrite).is_none());
        assert!(select_memory_types(&types, &[1], DeviceAccess::GpuRead).is_none());
    }

    #[test]
    fn small_allocations_share_a_page() {
        let (allocator, statistics) = allocator(NullAdapter::default());

        let a = allocator
            .alloc(&req(256, 256, vec![0]), DeviceAccess::GpuRead, AllocationKind::Buffer)
            .unwrap();
        let b = allocator
            .alloc(&req(256, 256, vec![0]), DeviceAccess::GpuRead, AllocationKind::Buffer)
            .unwrap();

        assert_eq!(a.memory(), b.memory());
        assert_ne!(a.offset(), b.offset());
        assert!(!a.is_dedicated());
        assert_eq!(allocator.page_count(0), 1);
        assert_eq!(statistics.memory.read().used(), 512);

        unsafe {
            allocator.dealloc(a);
            allocator.dealloc(b);
        }

        // The empty page is released.
        assert_eq!(allocator.page_count(0), 0);
        assert_eq!(statistics.memory.read().blocks.len(), 0);
    }

    #[test]
    fn large_allocations_are_dedicated() {
        let (allocator, _) = allocator(NullAdapter::default());

        let size = MemoryConfig::default().dedicated_threshold;
        let allocation = allocator
            .alloc(&req(size, 256, vec![0]), DeviceAccess::GpuRead, AllocationKind::Texture)
            .unwrap();
        assert!(allocation.is_dedicated());
        assert_eq!(allocator.page_count(0), 0);

        unsafe {
            allocator.dealloc(allocation);
        }
    }

    #[test]
    fn host_visible_allocations_are_mapped() {
        let (allocator, _) = allocator(NullAdapter::default());

        let all_types: Vec<u32> = (0..allocator.properties().types.len() as u32).collect();
        let allocation = allocator
            .alloc(
                &req(64, 16, all_types),
                DeviceAccess::GpuReadCpuWrite,
                AllocationKind::Buffer,
            )
            .unwrap();

        assert!(allocation.mapped_ptr().is_some());
        assert!(allocation.flags().contains(MemoryTypeFlags::HOST_VISIBLE));

        unsafe {
            allocator.dealloc(allocation);
        }
    }

    #[test]
    fn exhaustion_is_reported() {
        let adapter = NullAdapter {
            heap_size: 1 << 20,
            ..NullAdapter::default()
        };
        let (allocator, _) = allocator(adapter);

        let err = allocator
            .alloc(
                &req(4 << 20, 256, vec![0]),
                DeviceAccess::GpuRead,
                AllocationKind::Buffer,
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::OutOfMemory {
                size: 4 << 20,
                access: DeviceAccess::GpuRead
            }
        );
    }

    #[test]
    fn prev_power_of_two_values() {
        let v = |x: u64| prev_power_of_two(NonZeroU64::new(x).unwrap()).get();
        assert_eq!(v(1), 1);
        assert_eq!(v(3), 2);
        assert_eq!(v(4096), 4096);
        assert_eq!(v(u64::MAX), 1 << 63);
    }
}
