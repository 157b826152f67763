use std::sync::{Arc, Barrier};
use std::thread;

use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rhi_core::backend::null::{Completion, NullAdapter, NullDriver};
use rhi_core::config::StagingConfig;
use rhi_core::staging::StagingCursor;
use rhi_core::{
    BufferDescriptor, BufferUsage, Device, DeviceAccess, DeviceConfig, QueueType,
    SubmissionIndex,
};

const BLOCK_SIZE: u64 = 4096;
const WORKERS: usize = 3;

fn device() -> (Arc<NullDriver>, Device) {
    let driver = Arc::new(NullDriver::new(NullAdapter {
        completion: Completion::Manual,
        ..NullAdapter::discrete()
    }));
    let config = DeviceConfig {
        staging: StagingConfig {
            block_size: BLOCK_SIZE,
            alignment: 256,
        },
        ..Default::default()
    };

    let device = Device::with_driver(driver.clone(), config).unwrap();
    (driver, device)
}

#[test]
fn blocks_are_not_reused_before_their_fences() {
    let (driver, device) = device();
    let pool = device.upload().pool().clone();

    let dst = device
        .create_buffer(&BufferDescriptor {
            size: BLOCK_SIZE,
            usage: BufferUsage::TRANSFER_DST,
            access: DeviceAccess::GpuRead,
        })
        .unwrap();

    let mut ctx = device.create_command_context(QueueType::Transfer).unwrap();
    let queue = ctx.queue().clone();
    let mut cursors: Vec<_> = (0..WORKERS).map(|_| StagingCursor::new()).collect();
    let mut current: Vec<Option<u64>> = vec![None; WORKERS];
    // Every submission that read from a block since it was last handed to a cursor.
    let mut readers: HashMap<u64, Vec<SubmissionIndex>> = HashMap::new();
    let mut reuses = 0;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..2000 {
        let worker = rng.gen_range(0..WORKERS);
        let size = rng.gen_range(1..=BLOCK_SIZE);

        let mut allocation = pool.acquire(&mut cursors[worker], size).unwrap();
        let block = allocation.block_id();
        assert!(allocation.offset() + allocation.size() <= allocation.buffer().size());

        if current[worker] != Some(block) {
            // The block was taken from the pool. Every earlier read must have completed.
            if let Some(fences) = readers.remove(&block) {
                reuses += 1;
                for fence in fences {
                    assert!(
                        queue.is_complete(fence),
                        "block {} reused before {:?} completed",
                        block,
                        fence
                    );
                }
            }
            current[worker] = Some(block);
        }

        allocation.write(&vec![worker as u8; size as usize]).unwrap();

        let copy = size.min(dst.size());
        ctx.primary().unwrap().copy_buffer(
            allocation.buffer(),
            allocation.offset(),
            &dst,
            0,
            copy,
        );
        let fence = ctx.submit().unwrap().unwrap();
        readers.entry(block).or_default().push(fence);
        pool.release_after(allocation, fence);

        match rng.gen_range(0..10) {
            0..=3 => {
                let last = queue.last_submitted().value();
                let value = rng.gen_range(0..=last);
                driver.complete_up_to(queue.raw(), value);
            }
            4 => {
                pool.retire(&mut cursors[worker]);
                current[worker] = None;
            }
            _ => (),
        }

        if rng.gen_bool(0.3) {
            pool.sweep();
        }
        ctx.reclaim();
    }

    assert!(reuses > 0, "no block was ever reused");

    for cursor in &mut cursors {
        pool.retire(cursor);
    }
    device.wait_idle().unwrap();
    pool.sweep();
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.retired_blocks(), 0);
}

#[test]
fn released_allocations_free_blocks_without_fences() {
    let (_, device) = device();
    let pool = device.upload().pool().clone();

    let mut cursor = StagingCursor::new();
    let first = pool.acquire(&mut cursor, BLOCK_SIZE).unwrap();
    let block = first.block_id();

    // A second request does not fit and moves the cursor to a new block.
    let second = pool.acquire(&mut cursor, 16).unwrap();
    assert_ne!(second.block_id(), block);
    assert_eq!(pool.retired_blocks(), 1);

    assert_eq!(pool.sweep(), 0);
    pool.release(first);
    assert_eq!(pool.sweep(), 1);
    assert_eq!(pool.free_blocks(), 1);

    pool.retire(&mut cursor);
    let third = pool.acquire(&mut cursor, 64).unwrap();
    assert_eq!(third.block_id(), block);

    pool.release(second);
    pool.release(third);
    pool.retire(&mut cursor);
    pool.sweep();
    assert_eq!(pool.used(), 0);
}

#[test]
fn allocations_of_one_block_are_written_concurrently() {
    let (_, device) = device();
    let pool = device.upload().pool().clone();

    let mut cursor = StagingCursor::new();
    let allocations: Vec<_> = (0..2)
        .map(|_| pool.acquire(&mut cursor, BLOCK_SIZE / 2).unwrap())
        .collect();
    assert_eq!(allocations[0].block_id(), allocations[1].block_id());

    let barrier = Barrier::new(allocations.len());
    let allocations = thread::scope(|scope| {
        let handles: Vec<_> = allocations
            .into_iter()
            .enumerate()
            .map(|(index, mut allocation)| {
                let barrier = &barrier;
                scope.spawn(move || {
                    let data = vec![index as u8 + 1; allocation.size() as usize];
                    barrier.wait();
                    for _ in 0..100 {
                        allocation.write(&data).unwrap();
                    }
                    allocation
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    let buffer = allocations[0].buffer().clone();
    let mapping = buffer.map().unwrap();
    for (index, allocation) in allocations.iter().enumerate() {
        let start = allocation.offset() as usize;
        let end = start + allocation.size() as usize;
        assert!(mapping[start..end].iter().all(|byte| *byte == index as u8 + 1));
    }
    drop(mapping);

    for allocation in allocations {
        pool.release(allocation);
    }
    pool.retire(&mut cursor);
    pool.sweep();
    assert_eq!(pool.used(), 0);
}
