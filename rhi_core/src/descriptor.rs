//! Binding layouts and GPU-visible descriptor tables.
//!
//! Descriptors live in large fixed-capacity heaps, one list of heaps per [`HeapKind`]. A
//! [`DescriptorTable`] owns a contiguous range of slots in a heap for as long as it is alive,
//! so the heap address a table was bound with never changes.

use std::ops::Range;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rhi_tracing::trace_span;

use crate::backend::{
    BackendError, Driver, RawBindingResource, RawDescriptorHeap, RawPipelineLayout,
};
use crate::deletion::DeletionEvent;
use crate::device::DeviceShared;
use crate::error::Error;
use crate::resource::{Buffer, BufferInner, BufferUsage, Texture, TextureInner, TextureUsage};
use crate::sampler::Sampler;
use crate::shader::{Shader, ShaderStages};
use crate::state::ResourceState;
use crate::statistics::Statistics;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeapKind {
    /// Buffers and textures.
    Resource,
    Sampler,
}

impl HeapKind {
    const fn index(self) -> usize {
        match self {
            Self::Resource => 0,
            Self::Sampler => 1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    SampledTexture,
    StorageTexture,
    Sampler,
}

impl BindingKind {
    pub const fn heap(self) -> HeapKind {
        match self {
            Self::Sampler => HeapKind::Sampler,
            _ => HeapKind::Resource,
        }
    }
}

/// A binding of a [`BindingLayout`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub slot: u32,
    pub kind: BindingKind,
    pub stages: ShaderStages,
    pub size: u64,
    /// Position of the binding inside the table of its heap.
    pub index: u32,
}

/// The merged bindings of all shader stages of a pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BindingLayout {
    bindings: Vec<LayoutBinding>,
    resource_count: u32,
    sampler_count: u32,
    push_constant_size: u32,
}

impl BindingLayout {
    /// Builds the layout from the reflected bindings of `shaders`.
    ///
    /// # Panics
    ///
    /// Panics if two stages declare different binding kinds for the same slot.
    pub fn new(shaders: &[&Shader]) -> Self {
        let mut bindings: Vec<LayoutBinding> = Vec::new();
        let mut push_constant_size = 0;

        for shader in shaders {
            push_constant_size = push_constant_size.max(shader.push_constant_size());

            for binding in shader.bindings() {
                match bindings.iter_mut().find(|b| b.slot == binding.slot) {
                    Some(existing) => {
                        assert_eq!(
                            existing.kind, binding.kind,
                            "conflicting binding kinds for slot {} ({})",
                            binding.slot, binding.name,
                        );

                        existing.stages |= shader.stage().stages();
                        existing.size = existing.size.max(binding.size);
                    }
                    None => bindings.push(LayoutBinding {
                        slot: binding.slot,
                        kind: binding.kind,
                        stages: shader.stage().stages(),
                        size: binding.size,
                        index: 0,
                    }),
                }
            }
        }

        bindings.sort_by_key(|binding| binding.slot);

        let mut resource_count = 0;
        let mut sampler_count = 0;
        for binding in &mut bindings {
            let counter = match binding.kind.heap() {
                HeapKind::Resource => &mut resource_count,
                HeapKind::Sampler => &mut sampler_count,
            };

            binding.index = *counter;
            *counter += 1;
        }

        Self {
            bindings,
            resource_count,
            sampler_count,
            push_constant_size,
        }
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, slot: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|binding| binding.slot == slot)
    }

    pub fn count(&self, kind: HeapKind) -> u32 {
        match kind {
            HeapKind::Resource => self.resource_count,
            HeapKind::Sampler => self.sampler_count,
        }
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    pub(crate) fn raw(&self) -> RawPipelineLayout {
        RawPipelineLayout {
            resource_table: self
                .bindings
                .iter()
                .filter(|binding| binding.kind.heap() == HeapKind::Resource)
                .map(|binding| binding.kind)
                .collect(),
            sampler_table: self.sampler_count,
            push_constant_size: self.push_constant_size,
        }
    }
}

/// A range of slots in a descriptor heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DescriptorRange {
    pub(crate) kind: HeapKind,
    pub(crate) heap: usize,
    pub(crate) raw: RawDescriptorHeap,
    pub(crate) range: Range<u32>,
}

/// Hands out slot ranges from growable lists of descriptor heaps.
#[derive(Debug)]
pub(crate) struct DescriptorAllocator {
    driver: Arc<dyn Driver>,
    statistics: Arc<Statistics>,
    capacities: [u32; 2],
    heaps: Mutex<[Vec<DescriptorHeap>; 2]>,
}

#[derive(Debug)]
struct DescriptorHeap {
    raw: RawDescriptorHeap,
    /// Free ranges sorted by start, never adjacent to each other.
    free: Vec<Range<u32>>,
}

impl DescriptorHeap {
    fn alloc(&mut self, count: u32) -> Option<Range<u32>> {
        let index = self
            .free
            .iter()
            .position(|range| range.end - range.start >= count)?;

        let range = &mut self.free[index];
        let start = range.start;
        range.start += count;
        if range.is_empty() {
            self.free.remove(index);
        }

        Some(start..start + count)
    }

    fn free(&mut self, range: Range<u32>) {
        let index = self.free.partition_point(|free| free.start < range.start);
        debug_assert!(index == 0 || self.free[index - 1].end <= range.start);
        debug_assert!(index == self.free.len() || range.end <= self.free[index].start);

        let merges_prev = index > 0 && self.free[index - 1].end == range.start;
        let merges_next = index < self.free.len() && self.free[index].start == range.end;

        match (merges_prev, merges_next) {
            (true, true) => {
                self.free[index - 1].end = self.free[index].end;
                self.free.remove(index);
            }
            (true, false) => self.free[index - 1].end = range.end,
            (false, true) => self.free[index].start = range.start,
            (false, false) => self.free.insert(index, range),
        }
    }
}

impl DescriptorAllocator {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        statistics: Arc<Statistics>,
        resource_capacity: u32,
        sampler_capacity: u32,
    ) -> Self {
        Self {
            driver,
            statistics,
            capacities: [resource_capacity, sampler_capacity],
            heaps: Mutex::new([Vec::new(), Vec::new()]),
        }
    }

    /// Allocates `count` consecutive slots in a heap of `kind`.
    ///
    /// A new heap is created if no existing heap has room.
    pub(crate) fn alloc(&self, kind: HeapKind, count: u32) -> Result<DescriptorRange, Error> {
        let _span = trace_span!("DescriptorAllocator::alloc").entered();

        let capacity = self.capacities[kind.index()];
        if count == 0 || count > capacity {
            return Err(Error::OutOfDescriptors { kind });
        }

        let mut heaps = self.heaps.lock();
        let heaps = &mut heaps[kind.index()];

        for (index, heap) in heaps.iter_mut().enumerate() {
            if let Some(range) = heap.alloc(count) {
                return Ok(DescriptorRange {
                    kind,
                    heap: index,
                    raw: heap.raw,
                    range,
                });
            }
        }

        let raw = match self.driver.create_descriptor_heap(kind, capacity) {
            Ok(raw) => raw,
            Err(BackendError::OutOfPoolMemory | BackendError::OutOfDeviceMemory) => {
                return Err(Error::OutOfDescriptors { kind });
            }
            Err(err) => return Err(err.into()),
        };

        tracing::debug!(
            "new {:?} descriptor heap with {} slots ({} heaps)",
            kind,
            capacity,
            heaps.len() + 1
        );
        self.statistics.descriptor_heaps_created.increment();

        let mut heap = DescriptorHeap {
            raw,
            free: vec![0..capacity],
        };
        let range = heap.alloc(count).ok_or(Error::OutOfDescriptors { kind })?;
        heaps.push(heap);

        Ok(DescriptorRange {
            kind,
            heap: heaps.len() - 1,
            raw,
            range,
        })
    }

    /// Returns slots back to their heap.
    pub(crate) fn free(&self, kind: HeapKind, heap: usize, range: Range<u32>) {
        let _span = trace_span!("DescriptorAllocator::free").entered();

        let mut heaps = self.heaps.lock();
        heaps[kind.index()][heap].free(range);
    }

    /// Writes a descriptor into a heap slot.
    ///
    /// # Safety
    ///
    /// `slot` must be part of a live [`DescriptorRange`] of `heap` and not be in use by the GPU.
    pub(crate) unsafe fn write(
        &self,
        heap: RawDescriptorHeap,
        slot: u32,
        resource: RawBindingResource,
    ) {
        // SAFETY: Guaranteed by the caller.
        unsafe {
            self.driver.write_descriptor(heap, slot, resource);
        }
    }

    pub(crate) fn heap_count(&self, kind: HeapKind) -> usize {
        self.heaps.lock()[kind.index()].len()
    }

    /// Returns the number of free slots over all heaps of `kind`.
    pub(crate) fn free_slots(&self, kind: HeapKind) -> u32 {
        self.heaps.lock()[kind.index()]
            .iter()
            .flat_map(|heap| &heap.free)
            .map(|range| range.end - range.start)
            .sum()
    }

    /// Destroys all heaps.
    ///
    /// # Safety
    ///
    /// No heap may be in use by the GPU.
    pub(crate) unsafe fn destroy(&self) {
        let mut heaps = self.heaps.lock();
        for heap in heaps.iter_mut().flat_map(|heaps| heaps.drain(..)) {
            // SAFETY: Guaranteed by the caller.
            unsafe {
                self.driver.destroy_descriptor_heap(heap.raw);
            }
        }
    }
}

/// A resource written into a [`DescriptorTable`].
#[derive(Copy, Clone, Debug)]
pub enum BindingResource<'a> {
    /// A range of a buffer. A `size` of `None` binds everything after `offset`.
    Buffer {
        buffer: &'a Buffer,
        offset: u64,
        size: Option<u64>,
    },
    Texture(&'a Texture),
    Sampler(&'a Sampler),
}

#[derive(Clone, Debug)]
enum BoundResource {
    Buffer(Weak<BufferInner>),
    Texture(Weak<TextureInner>),
    Sampler(Sampler),
}

/// A resource referenced by a [`DescriptorTable`] together with the state it is accessed in.
#[derive(Clone, Debug)]
pub(crate) enum TableResource {
    Buffer(Buffer, ResourceState),
    Texture(Texture, ResourceState),
}

/// A table of resource bindings matching a [`BindingLayout`].
///
/// Resources written into the table are not kept alive by it. Binding a table after one of its
/// resources was dropped is an error.
#[derive(Clone, Debug)]
pub struct DescriptorTable {
    pub(crate) inner: Arc<DescriptorTableInner>,
}

#[derive(Debug)]
pub(crate) struct DescriptorTableInner {
    layout: Arc<BindingLayout>,
    resources: Option<DescriptorRange>,
    samplers: Option<DescriptorRange>,
    bound: Mutex<Vec<Option<BoundResource>>>,
    shared: Arc<DeviceShared>,
}

impl DescriptorTable {
    pub(crate) fn new(shared: Arc<DeviceShared>, layout: Arc<BindingLayout>) -> Result<Self, Error> {
        let alloc = |kind| match layout.count(kind) {
            0 => Ok(None),
            count => shared.descriptors.alloc(kind, count).map(Some),
        };

        let resources = alloc(HeapKind::Resource)?;
        let samplers = match alloc(HeapKind::Sampler) {
            Ok(samplers) => samplers,
            Err(err) => {
                if let Some(range) = resources {
                    shared
                        .descriptors
                        .free(range.kind, range.heap, range.range);
                }
                return Err(err);
            }
        };

        Ok(Self {
            inner: Arc::new(DescriptorTableInner {
                bound: Mutex::new(vec![None; layout.bindings().len()]),
                layout,
                resources,
                samplers,
                shared,
            }),
        })
    }

    pub fn layout(&self) -> &Arc<BindingLayout> {
        &self.inner.layout
    }

    /// Returns the heap and the first slot of the table in that heap.
    ///
    /// The value stays the same for the lifetime of the table.
    pub fn heap_offset(&self, kind: HeapKind) -> Option<(RawDescriptorHeap, u32)> {
        let range = match kind {
            HeapKind::Resource => self.inner.resources.as_ref(),
            HeapKind::Sampler => self.inner.samplers.as_ref(),
        }?;

        Some((range.raw, range.range.start))
    }

    /// Writes `resource` into the binding at `slot`.
    ///
    /// Writing a slot that pending GPU work reads from changes what that work observes.
    ///
    /// # Panics
    ///
    /// Panics if the layout has no binding at `slot`, the resource does not match the kind of
    /// the binding, the resource lacks the usage required by the binding, or a buffer range is
    /// out of bounds.
    pub fn write(&self, slot: u32, resource: BindingResource<'_>) {
        let _span = trace_span!("DescriptorTable::write").entered();

        let Some(position) = self
            .inner
            .layout
            .bindings()
            .iter()
            .position(|binding| binding.slot == slot)
        else {
            panic!("descriptor table has no binding at slot {}", slot);
        };
        let binding = &self.inner.layout.bindings()[position];

        let (raw, bound) = match resource {
            BindingResource::Buffer {
                buffer,
                offset,
                size,
            } => {
                let size = size.unwrap_or_else(|| buffer.size().saturating_sub(offset));
                assert!(
                    offset.checked_add(size).is_some_and(|end| end <= buffer.size()),
                    "buffer range {}..{} out of bounds for buffer of size {}",
                    offset,
                    offset.saturating_add(size),
                    buffer.size(),
                );

                let raw = match binding.kind {
                    BindingKind::UniformBuffer => {
                        assert!(
                            buffer.usage().contains(BufferUsage::UNIFORM),
                            "buffer bound at uniform slot {} lacks UNIFORM usage",
                            slot
                        );
                        RawBindingResource::UniformBuffer {
                            buffer: buffer.raw(),
                            offset,
                            size,
                        }
                    }
                    BindingKind::StorageBuffer => {
                        assert!(
                            buffer.usage().contains(BufferUsage::STORAGE),
                            "buffer bound at storage slot {} lacks STORAGE usage",
                            slot
                        );
                        RawBindingResource::StorageBuffer {
                            buffer: buffer.raw(),
                            offset,
                            size,
                        }
                    }
                    kind => panic!("cannot bind a buffer to {:?} slot {}", kind, slot),
                };

                (raw, BoundResource::Buffer(buffer.downgrade()))
            }
            BindingResource::Texture(texture) => {
                let raw = match binding.kind {
                    BindingKind::SampledTexture => {
                        assert!(
                            texture.usage().contains(TextureUsage::TEXTURE_BINDING),
                            "texture bound at sampled slot {} lacks TEXTURE_BINDING usage",
                            slot
                        );
                        RawBindingResource::SampledTexture(texture.raw())
                    }
                    BindingKind::StorageTexture => {
                        assert!(
                            texture.usage().contains(TextureUsage::STORAGE),
                            "texture bound at storage slot {} lacks STORAGE usage",
                            slot
                        );
                        RawBindingResource::StorageTexture(texture.raw())
                    }
                    kind => panic!("cannot bind a texture to {:?} slot {}", kind, slot),
                };

                (raw, BoundResource::Texture(texture.downgrade()))
            }
            BindingResource::Sampler(sampler) => {
                assert_eq!(
                    binding.kind,
                    BindingKind::Sampler,
                    "cannot bind a sampler to {:?} slot {}",
                    binding.kind,
                    slot
                );

                (
                    RawBindingResource::Sampler(sampler.raw()),
                    BoundResource::Sampler(sampler.clone()),
                )
            }
        };

        let range = match binding.kind.heap() {
            HeapKind::Resource => self.inner.resources.as_ref(),
            HeapKind::Sampler => self.inner.samplers.as_ref(),
        };
        // The layout counted this binding, so the range exists.
        let Some(range) = range else {
            unreachable!();
        };

        // SAFETY: `binding.index` is less than the count the range was allocated with.
        unsafe {
            self.inner
                .shared
                .descriptors
                .write(range.raw, range.range.start + binding.index, raw);
        }

        self.inner.bound.lock()[position] = Some(bound);
    }

    /// Returns every buffer and texture in the table with the state its binding accesses it in.
    ///
    /// # Panics
    ///
    /// Panics if a slot was never written or its resource was dropped.
    pub(crate) fn resources(&self) -> Vec<TableResource> {
        let bound = self.inner.bound.lock();

        self.inner
            .layout
            .bindings()
            .iter()
            .zip(bound.iter())
            .filter_map(|(binding, bound)| {
                let Some(bound) = bound else {
                    panic!("descriptor table slot {} was never written", binding.slot);
                };

                match bound {
                    BoundResource::Buffer(buffer) => {
                        let Some(buffer) = buffer.upgrade() else {
                            panic!("buffer bound at slot {} was destroyed", binding.slot);
                        };

                        let state = match binding.kind {
                            BindingKind::StorageBuffer => ResourceState::UnorderedAccess,
                            _ => ResourceState::UniformRead,
                        };
                        Some(TableResource::Buffer(Buffer::from_inner(buffer), state))
                    }
                    BoundResource::Texture(texture) => {
                        let Some(texture) = texture.upgrade() else {
                            panic!("texture bound at slot {} was destroyed", binding.slot);
                        };
                        let texture = Texture::from_inner(texture);

                        let state = match binding.kind {
                            BindingKind::StorageTexture => ResourceState::UnorderedAccess,
                            _ if texture.format().is_depth() => ResourceState::DepthRead,
                            _ => ResourceState::ShaderRead,
                        };
                        Some(TableResource::Texture(texture, state))
                    }
                    BoundResource::Sampler(_) => None,
                }
            })
            .collect()
    }
}

impl Drop for DescriptorTableInner {
    fn drop(&mut self) {
        for range in [self.resources.take(), self.samplers.take()].into_iter().flatten() {
            self.shared.defer(DeletionEvent::Descriptors {
                kind: range.kind,
                heap: range.heap,
                range: range.range,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::null::{NullAdapter, NullDriver};
    use crate::backend::RawDescriptorHeap;
    use crate::error::Error;
    use crate::statistics::Statistics;

    use super::{DescriptorAllocator, DescriptorHeap, HeapKind};

    fn allocator(capacity: u32) -> DescriptorAllocator {
        DescriptorAllocator::new(
            Arc::new(NullDriver::new(NullAdapter::default())),
            Arc::new(Statistics::default()),
            capacity,
            capacity / 8,
        )
    }

    #[test]
    fn heap_free_coalesces() {
        let mut heap = DescriptorHeap {
            raw: RawDescriptorHeap(0),
            free: vec![0..16],
        };

        let a = heap.alloc(4).unwrap();
        let b = heap.alloc(4).unwrap();
        let c = heap.alloc(4).unwrap();
        assert_eq!(heap.free, [12..16]);

        heap.free(a);
        heap.free(c);
        assert_eq!(heap.free, [0..4, 8..16]);

        heap.free(b);
        assert_eq!(heap.free, [0..16]);
    }

    #[test]
    fn heap_first_fit() {
        let mut heap = DescriptorHeap {
            raw: RawDescriptorHeap(0),
            free: vec![0..16],
        };

        let a = heap.alloc(2).unwrap();
        let _b = heap.alloc(8).unwrap();
        heap.free(a);

        // The hole at the start is too small.
        assert_eq!(heap.alloc(4), Some(10..14));
        assert_eq!(heap.alloc(2), Some(0..2));
    }

    #[test]
    fn allocator_grows_by_appending_heaps() {
        let allocator = allocator(64);

        let a = allocator.alloc(HeapKind::Resource, 48).unwrap();
        let b = allocator.alloc(HeapKind::Resource, 48).unwrap();
        assert_ne!(a.heap, b.heap);
        assert_ne!(a.raw, b.raw);
        assert_eq!(allocator.heap_count(HeapKind::Resource), 2);
        assert_eq!(allocator.heap_count(HeapKind::Sampler), 0);

        // Freed space in the first heap is reused before growing again.
        allocator.free(a.kind, a.heap, a.range);
        let c = allocator.alloc(HeapKind::Resource, 64).unwrap();
        assert_eq!(c.heap, 0);
        assert_eq!(allocator.heap_count(HeapKind::Resource), 2);
    }

    #[test]
    fn oversized_request() {
        let allocator = allocator(64);

        assert_eq!(
            allocator.alloc(HeapKind::Sampler, 9),
            Err(Error::OutOfDescriptors {
                kind: HeapKind::Sampler
            })
        );
    }

    #[test]
    fn free_slots() {
        let allocator = allocator(64);

        let range = allocator.alloc(HeapKind::Resource, 10).unwrap();
        assert_eq!(allocator.free_slots(HeapKind::Resource), 54);
        allocator.free(range.kind, range.heap, range.range);
        assert_eq!(allocator.free_slots(HeapKind::Resource), 64);
    }
}
