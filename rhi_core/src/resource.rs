//! Buffers and textures.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use glam::UVec3;
use parking_lot::{Mutex, MutexGuard};

use crate::backend::{MemoryTypeFlags, RawBuffer, RawObject, RawTexture, TextureFormat};
use crate::deletion::DeletionEvent;
use crate::device::DeviceShared;
use crate::error::Error;
use crate::memory::{DeviceAccess, MemoryAllocation};
use crate::state::{required_buffer_state, required_texture_state, ResourceState};

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const VERTEX = 1 << 4;
        const INDEX = 1 << 5;
        const INDIRECT = 1 << 6;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const RENDER_ATTACHMENT = 1 << 2;
        const TEXTURE_BINDING = 1 << 3;
        const STORAGE = 1 << 4;
    }
}

/// Identity of a buffer or texture, unique within a [`Device`].
///
/// [`Device`]: crate::Device
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
    pub access: DeviceAccess,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Width, height and depth of the first mip level. Depth must be `1` for non-3D textures.
    pub size: UVec3,
    pub dimension: TextureDimension,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    /// Returns the size of a 2D texture with a single mip level and array layer.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            size: UVec3::new(width, height, 1),
            dimension: TextureDimension::D2,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
        }
    }

    /// Returns the extent of the given mip level.
    pub fn mip_extent(&self, mip_level: u32) -> UVec3 {
        let extent = UVec3::new(
            self.size.x >> mip_level,
            self.size.y >> mip_level,
            if self.dimension == TextureDimension::D3 {
                self.size.z >> mip_level
            } else {
                1
            },
        );
        extent.max(UVec3::ONE)
    }
}

/// A GPU buffer.
///
/// Cloning a `Buffer` creates a new handle to the same buffer. The driver object is destroyed
/// once the last handle is dropped and all work submitted until then has completed.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub(crate) inner: Arc<BufferInner>,
}

#[derive(Debug)]
pub(crate) struct BufferInner {
    pub(crate) id: ResourceId,
    pub(crate) raw: RawBuffer,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
    pub(crate) access: DeviceAccess,
    pub(crate) allocation: Option<MemoryAllocation>,
    pub(crate) state: Mutex<ResourceState>,
    pub(crate) required_state: ResourceState,
    pub(crate) mapped: AtomicBool,
    pub(crate) name: Mutex<Option<String>>,
    pub(crate) shared: Arc<DeviceShared>,
}

impl Buffer {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        raw: RawBuffer,
        descriptor: &BufferDescriptor,
        allocation: MemoryAllocation,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: shared.next_id(),
                raw,
                size: descriptor.size,
                usage: descriptor.usage,
                access: descriptor.access,
                allocation: Some(allocation),
                state: Mutex::new(ResourceState::Undefined),
                required_state: required_buffer_state(descriptor.usage),
                mapped: AtomicBool::new(false),
                name: Mutex::new(None),
                shared,
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn raw(&self) -> RawBuffer {
        self.inner.raw
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn access(&self) -> DeviceAccess {
        self.inner.access
    }

    /// Returns the state the buffer is currently in.
    pub fn state(&self) -> ResourceState {
        *self.inner.state.lock()
    }

    /// Returns the state the buffer is expected to be in when used as declared by its usage.
    pub fn required_state(&self) -> ResourceState {
        self.inner.required_state
    }

    pub fn set_debug_name(&self, name: &str) {
        self.inner
            .shared
            .driver
            .set_debug_name(RawObject::Buffer(self.inner.raw), name);
        *self.inner.name.lock() = Some(name.to_owned());
    }

    pub fn debug_name(&self) -> Option<String> {
        self.inner.name.lock().clone()
    }

    pub(crate) fn state_lock(&self) -> MutexGuard<'_, ResourceState> {
        self.inner.state.lock()
    }

    pub(crate) fn downgrade(&self) -> Weak<BufferInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<BufferInner>) -> Self {
        Self { inner }
    }

    /// Maps the buffer into host memory.
    ///
    /// For buffers with [`DeviceAccess::CpuRead`] access this blocks until all work submitted
    /// so far has completed, so that the mapping observes previous GPU writes.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not host visible or is already mapped.
    pub fn map(&self) -> Result<BufferMapping<'_>, Error> {
        let allocation = self.allocation();
        let Some(ptr) = allocation.mapped_ptr() else {
            panic!(
                "cannot map buffer {:?} with {:?} access",
                self.inner.id, self.inner.access
            );
        };

        if self.inner.mapped.swap(true, Ordering::Acquire) {
            panic!("buffer {:?} is already mapped", self.inner.id);
        }

        if self.inner.access == DeviceAccess::CpuRead {
            let result = self.inner.shared.queues.wait_idle().and_then(|()| {
                if !allocation.flags().contains(MemoryTypeFlags::HOST_COHERENT) {
                    self.inner
                        .shared
                        .driver
                        .invalidate_memory(allocation.memory(), allocation.memory_range())?;
                }

                Ok(())
            });

            if let Err(err) = result {
                self.inner.mapped.store(false, Ordering::Release);
                return Err(err);
            }
        }

        Ok(BufferMapping {
            buffer: self,
            ptr,
            len: self.inner.size as usize,
        })
    }

    /// Writes `data` at `offset` into a host visible buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not host visible or the write is out of bounds.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.inner.size);
        assert!(
            end.is_some(),
            "write of {} bytes at offset {} is out of bounds for buffer of size {}",
            data.len(),
            offset,
            self.inner.size,
        );

        let mut mapping = self.map()?;
        mapping[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Writes `data` at `offset` through the persistent mapping without taking the exclusive
    /// mapping of [`map`].
    ///
    /// Only the written range is flushed.
    ///
    /// # Safety
    ///
    /// `offset..offset + data.len()` must be in bounds, must not be accessed by the host
    /// concurrently and must not be in use by the device.
    ///
    /// [`map`]: Self::map
    pub(crate) unsafe fn write_range(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let allocation = self.allocation();
        let Some(ptr) = allocation.mapped_ptr() else {
            panic!(
                "cannot write to buffer {:?} with {:?} access",
                self.inner.id, self.inner.access
            );
        };
        debug_assert!(offset + data.len() as u64 <= self.inner.size);

        // SAFETY: The caller guarantees that the range is in bounds and exclusively ours.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }

        if !allocation.flags().contains(MemoryTypeFlags::HOST_COHERENT) {
            let start = allocation.offset() + offset;
            self.inner
                .shared
                .driver
                .flush_memory(allocation.memory(), start..start + data.len() as u64)?;
        }

        Ok(())
    }

    fn allocation(&self) -> &MemoryAllocation {
        // Only dropping the buffer takes the allocation.
        match &self.inner.allocation {
            Some(allocation) => allocation,
            None => unreachable!(),
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Buffer {}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.shared.defer(DeletionEvent::Buffer {
            raw: self.raw,
            allocation: self.allocation.take(),
        });
    }
}

/// A host mapping of a [`Buffer`].
///
/// Host writes are made visible to the device when the mapping is dropped.
#[derive(Debug)]
pub struct BufferMapping<'a> {
    buffer: &'a Buffer,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a> BufferMapping<'a> {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Unmaps the buffer.
    pub fn unmap(self) {
        drop(self);
    }
}

impl<'a> Deref for BufferMapping<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: The allocation is host visible, at least `len` bytes long and mapped for the
        // lifetime of the buffer. The `mapped` flag guarantees exclusive access.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<'a> DerefMut for BufferMapping<'a> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: See `deref`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<'a> Drop for BufferMapping<'a> {
    fn drop(&mut self) {
        let allocation = self.buffer.allocation();
        if !allocation.flags().contains(MemoryTypeFlags::HOST_COHERENT) {
            if let Err(err) = self
                .buffer
                .inner
                .shared
                .driver
                .flush_memory(allocation.memory(), allocation.memory_range())
            {
                tracing::error!("failed to flush mapped memory: {}", err);
            }
        }

        self.buffer.inner.mapped.store(false, Ordering::Release);
    }
}

/// A GPU texture.
///
/// Like [`Buffer`], cloning creates a new handle to the same texture.
#[derive(Clone, Debug)]
pub struct Texture {
    pub(crate) inner: Arc<TextureInner>,
}

#[derive(Debug)]
pub(crate) struct TextureInner {
    pub(crate) id: ResourceId,
    pub(crate) raw: RawTexture,
    pub(crate) descriptor: TextureDescriptor,
    pub(crate) allocation: Option<MemoryAllocation>,
    /// Swapchain images are owned by their swapchain and not destroyed on drop.
    pub(crate) owned: bool,
    pub(crate) state: Mutex<ResourceState>,
    pub(crate) required_state: ResourceState,
    pub(crate) name: Mutex<Option<String>>,
    pub(crate) shared: Arc<DeviceShared>,
}

impl Texture {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        raw: RawTexture,
        descriptor: &TextureDescriptor,
        allocation: Option<MemoryAllocation>,
        owned: bool,
    ) -> Self {
        let required_state = if owned {
            required_texture_state(descriptor.usage, descriptor.format)
        } else {
            ResourceState::Present
        };

        Self {
            inner: Arc::new(TextureInner {
                id: shared.next_id(),
                raw,
                descriptor: *descriptor,
                allocation,
                owned,
                state: Mutex::new(ResourceState::Undefined),
                required_state,
                name: Mutex::new(None),
                shared,
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn raw(&self) -> RawTexture {
        self.inner.raw
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.inner.descriptor
    }

    pub fn size(&self) -> UVec3 {
        self.inner.descriptor.size
    }

    pub fn format(&self) -> TextureFormat {
        self.inner.descriptor.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.inner.descriptor.usage
    }

    pub fn mip_levels(&self) -> u32 {
        self.inner.descriptor.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.inner.descriptor.array_layers
    }

    /// Returns `true` if the texture is an image of a swapchain.
    pub fn is_swapchain_image(&self) -> bool {
        !self.inner.owned
    }

    pub fn state(&self) -> ResourceState {
        *self.inner.state.lock()
    }

    /// Returns the state the texture is expected to be in when used as declared by its usage.
    ///
    /// This is [`ResourceState::Present`] for swapchain images.
    pub fn required_state(&self) -> ResourceState {
        self.inner.required_state
    }

    pub fn set_debug_name(&self, name: &str) {
        self.inner
            .shared
            .driver
            .set_debug_name(RawObject::Texture(self.inner.raw), name);
        *self.inner.name.lock() = Some(name.to_owned());
    }

    pub fn debug_name(&self) -> Option<String> {
        self.inner.name.lock().clone()
    }

    pub(crate) fn state_lock(&self) -> MutexGuard<'_, ResourceState> {
        self.inner.state.lock()
    }

    pub(crate) fn downgrade(&self) -> Weak<TextureInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<TextureInner>) -> Self {
        Self { inner }
    }
}

impl PartialEq for Texture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Texture {}

impl Drop for TextureInner {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }

        self.shared.defer(DeletionEvent::Texture {
            raw: self.raw,
            allocation: self.allocation.take(),
        });
    }
}

#[cfg(test)]
mod tests {
    use glam::UVec3;

    use crate::backend::TextureFormat;
    use crate::memory::DeviceAccess;
    use crate::state::ResourceState;
    use crate::{Device, DeviceConfig};

    use super::{BufferDescriptor, BufferUsage, TextureDescriptor, TextureDimension, TextureUsage};

    fn device() -> Device {
        Device::new(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn new_buffer_is_undefined() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 1024,
                usage: BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
                access: DeviceAccess::GpuRead,
            })
            .unwrap();

        assert_eq!(buffer.state(), ResourceState::Undefined);
        assert_eq!(buffer.required_state(), ResourceState::VertexInput);
    }

    #[test]
    fn map_and_write() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 16,
                usage: BufferUsage::UNIFORM,
                access: DeviceAccess::GpuReadCpuWrite,
            })
            .unwrap();

        buffer.write(4, &[1, 2, 3, 4]).unwrap();

        let mapping = buffer.map().unwrap();
        assert!(!mapping.as_ptr().is_null());
        assert_eq!(&mapping[..8], &[0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "cannot map buffer")]
    fn map_gpu_only_buffer() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 16,
                usage: BufferUsage::STORAGE,
                access: DeviceAccess::GpuReadWrite,
            })
            .unwrap();

        let _ = buffer.map();
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn map_twice() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 16,
                usage: BufferUsage::UNIFORM,
                access: DeviceAccess::CpuWrite,
            })
            .unwrap();

        let _first = buffer.map().unwrap();
        let _second = buffer.map().unwrap();
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn write_out_of_bounds() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 16,
                usage: BufferUsage::UNIFORM,
                access: DeviceAccess::CpuWrite,
            })
            .unwrap();

        let _ = buffer.write(12, &[0; 8]);
    }

    #[test]
    fn debug_names() {
        let device = device();
        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                4,
                4,
                TextureFormat::Rgba8Unorm,
                TextureUsage::TEXTURE_BINDING,
            ))
            .unwrap();

        assert_eq!(texture.debug_name(), None);
        texture.set_debug_name("albedo");
        assert_eq!(texture.debug_name().as_deref(), Some("albedo"));
    }

    #[test]
    fn mip_extent() {
        let descriptor = TextureDescriptor {
            size: UVec3::new(64, 16, 8),
            dimension: TextureDimension::D3,
            mip_levels: 7,
            array_layers: 1,
            format: TextureFormat::R8Unorm,
            usage: TextureUsage::TEXTURE_BINDING,
        };

        assert_eq!(descriptor.mip_extent(0), UVec3::new(64, 16, 8));
        assert_eq!(descriptor.mip_extent(2), UVec3::new(16, 4, 2));
        assert_eq!(descriptor.mip_extent(6), UVec3::new(1, 1, 1));
    }

    #[test]
    fn dropped_resources_are_destroyed_by_maintain() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 64,
                usage: BufferUsage::STORAGE,
                access: DeviceAccess::GpuReadWrite,
            })
            .unwrap();
        let used = device.statistics().memory.read().used();
        assert_eq!(used, 64);

        drop(buffer);
        device.maintain();
        assert_eq!(device.statistics().memory.read().used(), 0);
    }
}
