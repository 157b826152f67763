//! Descriptor heaps on top of descriptor pools.
//!
//! Vulkan has no flat descriptor heaps. A heap keeps a host copy of every written slot and
//! materializes a descriptor set for a `(offset, layout)` pair the first time a table is bound.
//! Sets stay cached until one of their slots is written again.

use std::slice;

use ash::vk;

use crate::backend::{RawBindingResource, RawTexture};
use crate::descriptor::HeapKind;

use super::convert::descriptor_type;

#[derive(Copy, Clone, Debug)]
struct CachedSet {
    offset: u32,
    len: u32,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}

impl CachedSet {
    fn contains(&self, slot: u32) -> bool {
        slot >= self.offset && slot < self.offset + self.len
    }
}

#[derive(Debug)]
pub(super) struct DescriptorHeap {
    pub(super) pool: vk::DescriptorPool,
    kind: HeapKind,
    slots: Vec<Option<RawBindingResource>>,
    sets: Vec<CachedSet>,
}

impl DescriptorHeap {
    pub(super) fn new(
        device: &ash::Device,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<Self, vk::Result> {
        let types: &[vk::DescriptorType] = match kind {
            HeapKind::Resource => &[
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::SAMPLED_IMAGE,
                vk::DescriptorType::STORAGE_IMAGE,
            ],
            HeapKind::Sampler => &[vk::DescriptorType::SAMPLER],
        };

        let sizes: Vec<_> = types
            .iter()
            .map(|ty| {
                vk::DescriptorPoolSize::default()
                    .ty(*ty)
                    .descriptor_count(capacity)
            })
            .collect();

        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            // - `maxSets` must be greater than 0.
            .max_sets(capacity.max(1))
            .pool_sizes(&sizes);

        let pool = unsafe { device.create_descriptor_pool(&info, None)? };

        Ok(Self {
            pool,
            kind,
            slots: vec![None; capacity as usize],
            sets: Vec::new(),
        })
    }

    pub(super) fn kind(&self) -> HeapKind {
        self.kind
    }

    /// Stores `resource` in `slot` and returns the sets that contained the slot.
    ///
    /// The returned sets are no longer cached and must be freed once the GPU is done with
    /// them.
    pub(super) fn write(&mut self, slot: u32, resource: RawBindingResource) -> Vec<vk::DescriptorSet> {
        self.slots[slot as usize] = Some(resource);

        let mut stale = Vec::new();
        self.sets.retain(|cached| {
            if cached.contains(slot) {
                stale.push(cached.set);
                false
            } else {
                true
            }
        });

        stale
    }

    /// Returns the set for the `len` slots starting at `offset`, creating it if needed.
    ///
    /// `view` resolves the image view of a texture.
    pub(super) fn set(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
        offset: u32,
        len: u32,
        view: impl Fn(RawTexture) -> vk::ImageView,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        if let Some(cached) = self
            .sets
            .iter()
            .find(|cached| cached.offset == offset && cached.len == len && cached.layout == layout)
        {
            return Ok(cached.set);
        }

        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let set = unsafe { device.allocate_descriptor_sets(&info)?[0] };

        let mut buffers = Vec::new();
        let mut images = Vec::new();
        for (binding, slot) in (offset..offset + len).enumerate() {
            let Some(resource) = self.slots.get(slot as usize).copied().flatten() else {
                continue;
            };

            let binding = binding as u32;
            match resource {
                RawBindingResource::UniformBuffer {
                    buffer,
                    offset,
                    size,
                }
                | RawBindingResource::StorageBuffer {
                    buffer,
                    offset,
                    size,
                } => {
                    let info = vk::DescriptorBufferInfo::default()
                        .buffer(vk::Handle::from_raw(buffer.0))
                        .offset(offset)
                        .range(size);
                    buffers.push((binding, resource, info));
                }
                RawBindingResource::SampledTexture(texture) => {
                    let info = vk::DescriptorImageInfo::default()
                        .image_view(view(texture))
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                    images.push((binding, resource, info));
                }
                RawBindingResource::StorageTexture(texture) => {
                    let info = vk::DescriptorImageInfo::default()
                        .image_view(view(texture))
                        .image_layout(vk::ImageLayout::GENERAL);
                    images.push((binding, resource, info));
                }
                RawBindingResource::Sampler(sampler) => {
                    let info =
                        vk::DescriptorImageInfo::default().sampler(vk::Handle::from_raw(sampler.0));
                    images.push((binding, resource, info));
                }
            }
        }

        let writes: Vec<_> = buffers
            .iter()
            .map(|(binding, resource, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(descriptor_type(resource.kind()))
                    .buffer_info(slice::from_ref(info))
            })
            .chain(images.iter().map(|(binding, resource, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(descriptor_type(resource.kind()))
                    .image_info(slice::from_ref(info))
            }))
            .collect();

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }

        self.sets.push(CachedSet {
            offset,
            len,
            layout,
            set,
        });

        Ok(set)
    }

    /// Removes every cached set whose layout is `layout` and returns them.
    pub(super) fn forget_layout(&mut self, layout: vk::DescriptorSetLayout) -> Vec<vk::DescriptorSet> {
        let mut removed = Vec::new();
        self.sets.retain(|cached| {
            if cached.layout == layout {
                removed.push(cached.set);
                false
            } else {
                true
            }
        });

        removed
    }

    /// # Safety
    ///
    /// No set allocated from the heap may be in use by the GPU.
    pub(super) unsafe fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[derive(Debug)]
pub(super) struct RetiredSet {
    pub(super) pool: vk::DescriptorPool,
    pub(super) set: vk::DescriptorSet,
    /// Timeline value of every queue at the time the set was retired.
    pub(super) after: Vec<u64>,
}
