//! Copies from host memory into device local resources.

use std::sync::Arc;

use bytemuck::Pod;
use rhi_tracing::trace_span;

use crate::backend::ImageDataLayout;
use crate::device::DeviceShared;
use crate::error::Error;
use crate::pool::CommandContext;
use crate::queue::{Queue, QueueType, SubmissionIndex};
use crate::resource::{Buffer, Texture};
use crate::staging::{StagingAllocation, StagingCursor, StagingPool};

/// Schedules uploads through staging memory.
///
/// Uploads are recorded on the transfer queue, or the graphics queue if the device has no
/// dedicated transfer queue. Work on another queue that reads an uploaded resource must wait
/// for the [`SubmissionIndex`] returned by [`UploadContext::flush`].
#[derive(Debug)]
pub struct UploadManager {
    pool: Arc<StagingPool>,
    shared: Arc<DeviceShared>,
}

impl UploadManager {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        let pool = Arc::new(StagingPool::new(shared.clone(), &shared.config.staging));
        Self { pool, shared }
    }

    pub fn pool(&self) -> &Arc<StagingPool> {
        &self.pool
    }

    /// Returns the queue uploads are submitted to.
    pub fn queue(&self) -> &Arc<Queue> {
        self.shared.queues.get(QueueType::Transfer)
    }

    /// Creates a context for a single worker.
    pub fn context(&self) -> Result<UploadContext, Error> {
        Ok(UploadContext {
            pool: self.pool.clone(),
            cursor: StagingCursor::new(),
            commands: CommandContext::new(self.shared.clone(), QueueType::Transfer)?,
            pending: Vec::new(),
        })
    }

    /// Copies `data` into `dst` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds for `dst` or `dst` lacks the `TRANSFER_DST` usage.
    pub fn upload_buffer(
        &self,
        ctx: &mut UploadContext,
        dst: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let _span = trace_span!("UploadManager::upload_buffer").entered();

        if data.is_empty() {
            return Ok(());
        }

        let allocation = ctx.stage(data)?;
        let result = ctx.commands.primary().map(|cmd| {
            cmd.copy_buffer(
                allocation.buffer(),
                allocation.offset(),
                dst,
                offset,
                data.len() as u64,
            );
        });

        ctx.track(allocation, result)
    }

    /// Copies a slice of plain values into `dst` at `offset`.
    pub fn upload_typed<T: Pod>(
        &self,
        ctx: &mut UploadContext,
        dst: &Buffer,
        offset: u64,
        data: &[T],
    ) -> Result<(), Error> {
        self.upload_buffer(ctx, dst, offset, bytemuck::cast_slice(data))
    }

    /// Copies tightly packed texels into one subresource of `dst`.
    ///
    /// # Panics
    ///
    /// Panics if the subresource does not exist, `data` does not cover the subresource exactly
    /// or `dst` lacks the `TRANSFER_DST` usage.
    pub fn upload_texture(
        &self,
        ctx: &mut UploadContext,
        dst: &Texture,
        mip_level: u32,
        array_layer: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let _span = trace_span!("UploadManager::upload_texture").entered();

        assert!(
            mip_level < dst.mip_levels() && array_layer < dst.array_layers(),
            "subresource (mip {}, layer {}) does not exist",
            mip_level,
            array_layer
        );

        let extent = dst.descriptor().mip_extent(mip_level);
        let layout = ImageDataLayout {
            bytes_per_row: extent.x * dst.format().bytes_per_texel(),
            rows_per_image: extent.y,
        };
        let size = u64::from(layout.bytes_per_row)
            * u64::from(layout.rows_per_image)
            * u64::from(extent.z);
        assert_eq!(
            data.len() as u64,
            size,
            "texture data size does not match subresource of extent {}",
            extent
        );

        let allocation = ctx.stage(data)?;
        let result = ctx.commands.primary().map(|cmd| {
            cmd.copy_buffer_to_texture(
                allocation.buffer(),
                allocation.offset(),
                layout,
                dst,
                mip_level,
                array_layer,
            );
        });

        ctx.track(allocation, result)
    }

    /// Releases staging memory of completed uploads.
    ///
    /// Returns the number of staging blocks that became free.
    pub fn sweep(&self) -> usize {
        self.pool.sweep()
    }

    /// Destroys staging blocks that are not in use.
    pub fn trim(&self) {
        self.pool.trim();
    }

    /// Returns the total size of all staging blocks in bytes.
    pub fn allocated_memory(&self) -> u64 {
        self.pool.allocated()
    }

    /// Returns the number of staging bytes in use.
    pub fn used_memory(&self) -> u64 {
        self.pool.used()
    }
}

/// The upload state of a single worker.
///
/// The context owns the staging block the worker allocates from and the command buffer the
/// copies are recorded into.
#[derive(Debug)]
pub struct UploadContext {
    pool: Arc<StagingPool>,
    cursor: StagingCursor,
    commands: CommandContext,
    /// Staging memory read by copies that were not submitted yet.
    pending: Vec<StagingAllocation>,
}

impl UploadContext {
    fn stage(&mut self, data: &[u8]) -> Result<StagingAllocation, Error> {
        let mut allocation = self.pool.acquire(&mut self.cursor, data.len() as u64)?;
        if let Err(err) = allocation.write(data) {
            self.pool.release(allocation);
            return Err(err);
        }

        Ok(allocation)
    }

    fn track(&mut self, allocation: StagingAllocation, result: Result<(), Error>) -> Result<(), Error> {
        match result {
            Ok(()) => {
                self.pending.push(allocation);
                Ok(())
            }
            Err(err) => {
                self.pool.release(allocation);
                Err(err)
            }
        }
    }

    /// Returns the type of the queue the copies run on.
    pub fn queue_type(&self) -> QueueType {
        self.commands.queue().ty()
    }

    /// Returns the command context the copies are recorded into.
    pub fn commands(&self) -> &CommandContext {
        &self.commands
    }

    /// Returns the number of recorded uploads that were not submitted yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Submits all recorded copies.
    ///
    /// The staging memory of the copies is released once the returned submission has
    /// completed. Returns `None` if nothing was recorded.
    pub fn flush(&mut self) -> Result<Option<SubmissionIndex>, Error> {
        let _span = trace_span!("UploadContext::flush").entered();

        let index = self.commands.submit()?;
        let pending = std::mem::take(&mut self.pending);

        match index {
            Some(index) => {
                for allocation in pending {
                    self.pool.release_after(allocation, index);
                }
            }
            None => {
                for allocation in pending {
                    self.pool.release(allocation);
                }
            }
        }

        self.commands.reclaim();
        Ok(index)
    }
}

impl Drop for UploadContext {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                "dropping upload context with {} unsubmitted uploads",
                self.pending.len()
            );
        }

        self.commands.discard();
        for allocation in self.pending.drain(..) {
            self.pool.release(allocation);
        }
        self.pool.retire(&mut self.cursor);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::null::{Completion, NullAdapter, NullDriver};
    use crate::backend::{Command, TextureFormat};
    use crate::memory::DeviceAccess;
    use crate::queue::QueueType;
    use crate::resource::{BufferDescriptor, BufferUsage, TextureDescriptor, TextureUsage};
    use crate::state::ResourceState;
    use crate::{Device, DeviceConfig};

    fn device(adapter: NullAdapter) -> (Arc<NullDriver>, Device) {
        let driver = Arc::new(NullDriver::new(NullAdapter {
            completion: Completion::Manual,
            ..adapter
        }));
        let device = Device::with_driver(driver.clone(), DeviceConfig::default()).unwrap();
        (driver, device)
    }

    #[test]
    fn uploads_use_the_transfer_queue() {
        let (driver, device) = device(NullAdapter::discrete());
        let upload = device.upload();
        let mut ctx = upload.context().unwrap();
        assert_eq!(ctx.queue_type(), QueueType::Transfer);

        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 64,
                usage: BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
                access: DeviceAccess::GpuRead,
            })
            .unwrap();

        upload
            .upload_typed(&mut ctx, &buffer, 0, &[1.0f32, 2.0, 3.0, 4.0])
            .unwrap();
        assert_eq!(ctx.pending(), 1);
        assert_eq!(upload.used_memory(), 16);

        let index = ctx.flush().unwrap().unwrap();
        assert_eq!(index.queue(), upload.queue().raw());
        assert_eq!(buffer.state(), ResourceState::CopyDst);

        let submissions = driver.submissions(upload.queue().raw());
        assert_eq!(submissions.len(), 1);
        let commands = driver.commands(submissions[0].command_buffers[0]);
        assert!(commands
            .iter()
            .any(|cmd| matches!(cmd, Command::CopyBuffer { dst, size: 16, .. } if *dst == buffer.raw())));

        // The staging memory stays in use until the copy has completed.
        upload.sweep();
        assert_eq!(upload.used_memory(), 16);

        driver.complete_all();
        upload.sweep();
        assert_eq!(upload.used_memory(), 0);
    }

    #[test]
    fn texture_upload() {
        let (driver, device) = device(NullAdapter::integrated());
        let upload = device.upload();
        let mut ctx = upload.context().unwrap();

        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                16,
                8,
                TextureFormat::Rgba8Unorm,
                TextureUsage::TEXTURE_BINDING | TextureUsage::TRANSFER_DST,
            ))
            .unwrap();

        upload
            .upload_texture(&mut ctx, &texture, 0, 0, &[0xff; 16 * 8 * 4])
            .unwrap();
        let index = ctx.flush().unwrap().unwrap();

        let submissions = driver.submissions(index.queue());
        let commands = driver.commands(submissions[0].command_buffers[0]);
        let copy = commands
            .iter()
            .find_map(|cmd| match cmd {
                Command::CopyBufferToTexture { layout, extent, .. } => Some((*layout, *extent)),
                _ => None,
            })
            .unwrap();
        assert_eq!(copy.0.bytes_per_row, 64);
        assert_eq!(copy.0.rows_per_image, 8);
        assert_eq!(copy.1.x, 16);
    }

    #[test]
    #[should_panic(expected = "texture data size")]
    fn texture_upload_size_mismatch() {
        let (_, device) = device(NullAdapter::integrated());
        let upload = device.upload();
        let mut ctx = upload.context().unwrap();

        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                4,
                4,
                TextureFormat::Rgba8Unorm,
                TextureUsage::TRANSFER_DST,
            ))
            .unwrap();

        let _ = upload.upload_texture(&mut ctx, &texture, 0, 0, &[0; 15]);
    }

    #[test]
    fn flush_without_uploads() {
        let (_, device) = device(NullAdapter::integrated());
        let mut ctx = device.upload().context().unwrap();
        assert_eq!(ctx.flush().unwrap(), None);
    }

    #[test]
    fn dropped_context_releases_staging_memory() {
        let (_, device) = device(NullAdapter::integrated());
        let upload = device.upload();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 256,
                usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
                access: DeviceAccess::GpuReadWrite,
            })
            .unwrap();

        let mut ctx = upload.context().unwrap();
        upload.upload_buffer(&mut ctx, &buffer, 0, &[7; 256]).unwrap();
        drop(ctx);

        assert_eq!(upload.used_memory(), 0);
        assert_eq!(upload.sweep(), 1);
        assert_eq!(upload.pool().free_blocks(), 1);
    }
}
