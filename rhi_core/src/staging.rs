//! Host-visible scratch memory for uploads.
//!
//! Staging memory is handed out from blocks by bumping an offset. The block a worker is
//! currently allocating from is owned by that worker's [`StagingCursor`]; only blocks that are
//! full or whose cursor was dropped are shared through the pool. A shared block is reused once
//! none of its allocations are outstanding and every submission that read from it has
//! completed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rhi_tracing::trace_span;

use crate::config::StagingConfig;
use crate::device::DeviceShared;
use crate::error::Error;
use crate::memory::DeviceAccess;
use crate::queue::SubmissionIndex;
use crate::resource::{Buffer, BufferDescriptor, BufferUsage};
use crate::statistics::AllocationKind;

#[derive(Debug)]
struct StagingBlock {
    id: u64,
    buffer: Buffer,
    /// Allocations handed out from the block and not released yet.
    num_alloc: AtomicU32,
    /// Latest submission of every queue that read from the block.
    fences: Mutex<Vec<SubmissionIndex>>,
}

impl StagingBlock {
    fn size(&self) -> u64 {
        self.buffer.size()
    }

    fn record_fence(&self, index: SubmissionIndex) {
        let mut fences = self.fences.lock();
        match fences.iter_mut().find(|fence| fence.queue() == index.queue()) {
            Some(fence) => *fence = (*fence).max(index),
            None => fences.push(index),
        }
    }

    fn is_reusable(&self, shared: &DeviceShared) -> bool {
        self.num_alloc.load(Ordering::Acquire) == 0
            && self
                .fences
                .lock()
                .iter()
                .all(|fence| shared.queues.is_complete(*fence))
    }
}

/// The block a worker allocates from.
///
/// Dropping a cursor that still holds a block leaks nothing, but the block only returns to the
/// pool through [`StagingPool::retire`].
#[derive(Debug, Default)]
pub struct StagingCursor {
    block: Option<Arc<StagingBlock>>,
    offset: u64,
}

impl StagingCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of the block the cursor allocates from.
    pub fn block_id(&self) -> Option<u64> {
        self.block.as_ref().map(|block| block.id)
    }

    /// Returns the number of bytes left in the current block.
    pub fn remaining(&self) -> u64 {
        self.block
            .as_ref()
            .map_or(0, |block| block.size().saturating_sub(self.offset))
    }
}

/// A range of staging memory.
#[derive(Debug)]
pub struct StagingAllocation {
    block: Arc<StagingBlock>,
    offset: u64,
    size: u64,
}

impl StagingAllocation {
    /// Returns the id of the block the allocation lives in.
    pub fn block_id(&self) -> u64 {
        self.block.id
    }

    pub fn buffer(&self) -> &Buffer {
        &self.block.buffer
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copies `data` to the start of the allocation.
    ///
    /// Allocations of the same block can be written from different threads at the same time.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than the allocation.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        assert!(
            data.len() as u64 <= self.size,
            "{} bytes do not fit into a staging allocation of {} bytes",
            data.len(),
            self.size
        );

        // SAFETY: Allocations of a block never overlap and `&mut self` excludes other writes
        // to this one. The block is only handed out again after every submission reading it
        // has completed.
        unsafe { self.block.buffer.write_range(self.offset, data) }
    }
}

/// Shared staging blocks.
#[derive(Debug)]
pub struct StagingPool {
    shared: Arc<DeviceShared>,
    block_size: u64,
    alignment: u64,
    next_id: AtomicU64,
    /// Blocks ready for reuse.
    free: Mutex<Vec<Arc<StagingBlock>>>,
    /// Blocks no cursor owns that still have outstanding allocations or pending reads.
    retired: Mutex<Vec<Arc<StagingBlock>>>,
    /// Allocations released once their submission has completed.
    deferred: Mutex<Vec<(SubmissionIndex, StagingAllocation)>>,
}

impl StagingPool {
    pub(crate) fn new(shared: Arc<DeviceShared>, config: &StagingConfig) -> Self {
        let alignment = config.alignment.max(1).next_power_of_two();

        Self {
            shared,
            block_size: config.block_size.max(alignment),
            alignment,
            next_id: AtomicU64::new(0),
            free: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Allocates `size` bytes of staging memory.
    ///
    /// The allocation comes from the block of `cursor` if it has room left. Otherwise the
    /// block is retired and `cursor` takes the smallest free block that fits, or a new block of
    /// at least the default block size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn acquire(&self, cursor: &mut StagingCursor, size: u64) -> Result<StagingAllocation, Error> {
        let _span = trace_span!("StagingPool::acquire").entered();

        assert_ne!(size, 0, "cannot allocate zero bytes of staging memory");

        let fits = cursor.block.as_ref().is_some_and(|block| {
            align_up(cursor.offset, self.alignment)
                .checked_add(size)
                .is_some_and(|end| end <= block.size())
        });

        if !fits {
            self.retire(cursor);
            cursor.block = Some(self.take_block(size)?);
            cursor.offset = 0;
        }

        // The cursor holds a block at this point.
        let Some(block) = cursor.block.clone() else {
            unreachable!();
        };

        let offset = align_up(cursor.offset, self.alignment);
        cursor.offset = offset + size;
        block.num_alloc.fetch_add(1, Ordering::AcqRel);
        self.shared.statistics.staging_used.add(size);

        Ok(StagingAllocation {
            block,
            offset,
            size,
        })
    }

    fn take_block(&self, size: u64) -> Result<Arc<StagingBlock>, Error> {
        {
            let mut free = self.free.lock();
            let best = free
                .iter()
                .enumerate()
                .filter(|(_, block)| block.size() >= size)
                .min_by_key(|(_, block)| block.size())
                .map(|(index, _)| index);

            if let Some(index) = best {
                let block = free.swap_remove(index);
                debug_assert!(block.is_reusable(&self.shared));
                return Ok(block);
            }
        }

        let block_size = align_up(size.max(self.block_size), self.alignment);
        let buffer = self.shared.create_buffer(
            &BufferDescriptor {
                size: block_size,
                usage: BufferUsage::TRANSFER_SRC,
                access: DeviceAccess::CpuWrite,
            },
            AllocationKind::Staging,
        )?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        buffer.set_debug_name(&format!("staging block {}", id));

        tracing::debug!("new staging block {} with {} bytes", id, block_size);
        self.shared.statistics.staging_allocated.add(block_size);

        Ok(Arc::new(StagingBlock {
            id,
            buffer,
            num_alloc: AtomicU32::new(0),
            fences: Mutex::new(Vec::new()),
        }))
    }

    /// Gives up the block of `cursor`.
    pub fn retire(&self, cursor: &mut StagingCursor) {
        if let Some(block) = cursor.block.take() {
            self.retired.lock().push(block);
        }
        cursor.offset = 0;
    }

    /// Releases `allocation` once `fence` has completed.
    pub fn release_after(&self, allocation: StagingAllocation, fence: SubmissionIndex) {
        allocation.block.record_fence(fence);
        self.deferred.lock().push((fence, allocation));
    }

    /// Releases an allocation that no submission reads from.
    pub fn release(&self, allocation: StagingAllocation) {
        self.shared.statistics.staging_used.sub(allocation.size);
        allocation.block.num_alloc.fetch_sub(1, Ordering::AcqRel);
    }

    /// Releases all deferred allocations whose fence has completed and makes retired blocks
    /// without outstanding allocations available again.
    ///
    /// Returns the number of blocks that became free.
    pub fn sweep(&self) -> usize {
        let _span = trace_span!("StagingPool::sweep").entered();

        let released: Vec<StagingAllocation> = {
            let mut deferred = self.deferred.lock();
            let mut released = Vec::new();
            let mut index = 0;
            while index < deferred.len() {
                if self.shared.queues.is_complete(deferred[index].0) {
                    released.push(deferred.swap_remove(index).1);
                } else {
                    index += 1;
                }
            }
            released
        };

        for allocation in released {
            self.release(allocation);
        }

        let reusable: Vec<Arc<StagingBlock>> = {
            let mut retired = self.retired.lock();
            let mut reusable = Vec::new();
            let mut index = 0;
            while index < retired.len() {
                if retired[index].is_reusable(&self.shared) {
                    reusable.push(retired.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            reusable
        };

        let count = reusable.len();
        for block in &reusable {
            block.fences.lock().clear();
        }
        self.free.lock().extend(reusable);
        count
    }

    /// Destroys all free blocks.
    pub fn trim(&self) {
        let blocks = std::mem::take(&mut *self.free.lock());
        for block in blocks {
            self.shared.statistics.staging_allocated.sub(block.size());
        }
    }

    /// Returns the number of blocks ready for reuse.
    pub fn free_blocks(&self) -> usize {
        self.free.lock().len()
    }

    /// Returns the number of blocks waiting for their allocations to be released.
    pub fn retired_blocks(&self) -> usize {
        self.retired.lock().len()
    }

    /// Returns the total size of all staging blocks in bytes.
    pub fn allocated(&self) -> u64 {
        self.shared.statistics.staging_allocated.get()
    }

    /// Returns the number of bytes handed out and not yet released.
    pub fn used(&self) -> u64 {
        self.shared.statistics.staging_used.get()
    }
}

const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::null::{Completion, NullAdapter, NullDriver};
    use crate::queue::QueueType;
    use crate::{Device, DeviceConfig};

    use super::{align_up, StagingCursor};

    fn device() -> (Arc<NullDriver>, Device) {
        let driver = Arc::new(NullDriver::new(NullAdapter {
            completion: Completion::Manual,
            ..NullAdapter::integrated()
        }));
        let device = Device::with_driver(driver.clone(), DeviceConfig::default()).unwrap();
        (driver, device)
    }

    #[test]
    fn align() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 4), 260);
    }

    #[test]
    fn bump_allocation_is_aligned() {
        let (_, device) = device();
        let pool = device.upload().pool();
        let mut cursor = StagingCursor::new();

        let a = pool.acquire(&mut cursor, 10).unwrap();
        let b = pool.acquire(&mut cursor, 10).unwrap();
        assert_eq!(a.block_id(), b.block_id());
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 256);
        assert_eq!(pool.used(), 20);
        assert_eq!(pool.allocated(), 64 * 1024);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn large_requests_get_a_larger_block() {
        let (_, device) = device();
        let pool = device.upload().pool();
        let mut cursor = StagingCursor::new();

        let allocation = pool.acquire(&mut cursor, 100_000).unwrap();
        assert_eq!(allocation.buffer().size(), align_up(100_000, 256));
        assert_eq!(cursor.remaining(), align_up(100_000, 256) - 100_000);
    }

    #[test]
    fn blocks_wait_for_their_fence() {
        let (driver, device) = device();
        let pool = device.upload().pool();
        let queue = device.queue(QueueType::Graphics);
        let mut cursor = StagingCursor::new();

        let allocation = pool.acquire(&mut cursor, 64 * 1024).unwrap();
        let block = allocation.block_id();
        let fence = queue.submit(&[], &[]).unwrap();
        pool.release_after(allocation, fence);

        // The full block is retired by the next allocation.
        let other = pool.acquire(&mut cursor, 16).unwrap();
        assert_ne!(other.block_id(), block);
        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.retired_blocks(), 1);

        driver.complete_up_to(fence.queue(), fence.value());
        assert_eq!(pool.sweep(), 1);
        assert_eq!(pool.free_blocks(), 1);

        let mut second = StagingCursor::new();
        let reused = pool.acquire(&mut second, 1024).unwrap();
        assert_eq!(reused.block_id(), block);
    }
}
