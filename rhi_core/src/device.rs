//! The device and its resource factory.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rhi_tracing::trace_span;

use crate::backend::null::{NullAdapter, NullDriver};
use crate::backend::{
    AdapterInfo, DeviceLimits, Driver, PipelineBindPoint, RawComputePipelineDescriptor,
    RawFramebufferDescriptor, RawGraphicsPipelineDescriptor, RawSurface, RenderPassLayout,
};
use crate::cache::{FramebufferCache, PipelineCache, RenderPassCache, SamplerCache};
use crate::config::{BackendKind, DeviceConfig};
use crate::deletion::{DeletionEvent, DeletionQueue};
use crate::descriptor::{BindingLayout, DescriptorAllocator, DescriptorTable};
use crate::error::{Error, LimitError};
use crate::memory::{DeviceAccess, MemoryAllocator};
use crate::pipeline::{
    AttachmentFormats, ComputePipelineDescriptor, GraphicsPipelineDescriptor, Pipeline,
};
use crate::pool::{CommandContext, PreparedSubmit};
use crate::queue::{DeviceCapabilities, Queue, QueueType, Queues, SubmissionIndex};
use crate::render_pass::{Framebuffer, FramebufferDescriptor, RenderPass};
use crate::resource::{
    Buffer, BufferDescriptor, ResourceId, Texture, TextureDescriptor, TextureDimension,
    TextureUsage,
};
use crate::sampler::{Sampler, SamplerDescriptor};
use crate::shader::{Shader, ShaderDescriptor, ShaderStage};
use crate::statistics::{AllocationKind, Statistics};
use crate::swapchain::{Swapchain, SwapchainConfig};
use crate::upload::UploadManager;

/// State shared by the device and every object created from it.
#[derive(Debug)]
pub(crate) struct DeviceShared {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) memory: MemoryAllocator,
    pub(crate) descriptors: DescriptorAllocator,
    pub(crate) queues: Queues,
    pub(crate) statistics: Arc<Statistics>,
    pub(crate) config: DeviceConfig,
    pub(crate) limits: DeviceLimits,
    deletion: DeletionQueue,
    next_id: AtomicU64,
}

impl DeviceShared {
    pub(crate) fn next_id(&self) -> ResourceId {
        ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Destroys the object once all work submitted until now has completed.
    pub(crate) fn defer(&self, event: DeletionEvent) {
        self.deletion.push(self.queues.last_submitted(), event);
    }

    /// Destroys all deferred objects whose submissions have completed.
    ///
    /// Returns the number of destroyed objects.
    pub(crate) fn maintain(&self) -> usize {
        let _span = trace_span!("DeviceShared::maintain").entered();

        let events = self.deletion.collect(|fence| self.queues.is_complete(fence));
        let count = events.len();
        for event in events {
            // SAFETY: Every submission that could use the object has completed.
            unsafe {
                self.destroy(event);
            }
        }

        count
    }

    /// # Safety
    ///
    /// The object must not be in use by the GPU.
    unsafe fn destroy(&self, event: DeletionEvent) {
        // SAFETY: Guaranteed by the caller.
        unsafe {
            match event {
                DeletionEvent::Buffer { raw, allocation } => {
                    self.driver.destroy_buffer(raw);
                    if let Some(allocation) = allocation {
                        self.memory.dealloc(allocation);
                    }
                }
                DeletionEvent::Texture { raw, allocation } => {
                    self.driver.destroy_texture(raw);
                    if let Some(allocation) = allocation {
                        self.memory.dealloc(allocation);
                    }
                }
                DeletionEvent::Sampler(raw) => self.driver.destroy_sampler(raw),
                DeletionEvent::ShaderModule(raw) => self.driver.destroy_shader_module(raw),
                DeletionEvent::Pipeline(raw) => self.driver.destroy_pipeline(raw),
                DeletionEvent::RenderPass(raw) => self.driver.destroy_render_pass(raw),
                DeletionEvent::Framebuffer(raw) => self.driver.destroy_framebuffer(raw),
                DeletionEvent::CommandPool(raw) => self.driver.destroy_command_pool(raw),
                DeletionEvent::Descriptors { kind, heap, range } => {
                    self.descriptors.free(kind, heap, range);
                }
            }
        }
    }

    /// Creates a buffer and binds memory to it.
    pub(crate) fn create_buffer(
        self: &Arc<Self>,
        descriptor: &BufferDescriptor,
        kind: AllocationKind,
    ) -> Result<Buffer, Error> {
        let Some(size) = NonZeroU64::new(descriptor.size) else {
            return Err(LimitError::ZeroSized.into());
        };

        let raw = self.driver.create_buffer(size, descriptor.usage)?;
        let req = self.driver.buffer_memory_requirements(raw);

        let allocation = match self.memory.alloc(&req, descriptor.access, kind) {
            Ok(allocation) => allocation,
            Err(err) => {
                // SAFETY: The buffer was never used.
                unsafe {
                    self.driver.destroy_buffer(raw);
                }
                return Err(err);
            }
        };

        // SAFETY: The allocation satisfies the requirements of the buffer.
        let res = unsafe {
            self.driver
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
        };
        if let Err(err) = res {
            // SAFETY: The buffer was never used.
            unsafe {
                self.driver.destroy_buffer(raw);
                self.memory.dealloc(allocation);
            }
            return Err(err.into());
        }

        Ok(Buffer::new(self.clone(), raw, descriptor, allocation))
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        if let Err(err) = self.queues.wait_idle() {
            tracing::error!("failed to wait for device idle: {}", err);
        }

        for event in self.deletion.drain() {
            // SAFETY: The device is idle.
            unsafe {
                self.destroy(event);
            }
        }

        // SAFETY: All descriptor tables were dropped and the device is idle.
        unsafe {
            self.descriptors.destroy();
        }
    }
}

/// A logical device.
///
/// The device creates all resources and owns the object caches. Resources keep the state they
/// need alive on their own, so they may outlive the `Device`.
#[derive(Debug)]
pub struct Device {
    shared: Arc<DeviceShared>,
    capabilities: DeviceCapabilities,
    adapter: AdapterInfo,
    pipelines: PipelineCache,
    render_passes: RenderPassCache,
    framebuffers: Arc<FramebufferCache>,
    samplers: SamplerCache,
    upload: UploadManager,
}

impl Device {
    /// Creates a device on the backend selected by `config`.
    ///
    /// The `Null` backend uses a default [`NullAdapter`]. The `Vulkan` backend is created
    /// without presentation support; use [`with_driver`] for a driver with a display.
    ///
    /// [`with_driver`]: Self::with_driver
    pub fn new(config: DeviceConfig) -> Result<Self, Error> {
        let driver: Arc<dyn Driver> = match config.backend {
            BackendKind::Null => Arc::new(NullDriver::new(NullAdapter::default())),
            #[cfg(feature = "vulkan")]
            BackendKind::Vulkan => Arc::new(crate::backend::vulkan::VulkanDriver::new(
                config.validation,
                None,
            )?),
            #[cfg(not(feature = "vulkan"))]
            BackendKind::Vulkan => {
                return Err(Error::Unsupported("built without the vulkan feature"));
            }
        };

        Self::with_driver(driver, config)
    }

    /// Creates a device on an existing driver.
    pub fn with_driver(driver: Arc<dyn Driver>, config: DeviceConfig) -> Result<Self, Error> {
        let _span = trace_span!("Device::with_driver").entered();

        let adapter = driver.adapter_info();
        let limits = driver.limits();
        let statistics = Arc::new(Statistics::default());
        let (queues, capabilities) = Queues::new(&driver, &statistics, &config)?;

        tracing::info!(
            "using adapter {} ({}, {:?})",
            adapter.name,
            adapter.vendor().name(),
            adapter.kind
        );
        tracing::info!(
            "async compute: {}, dedicated transfer queue: {}",
            capabilities.async_compute,
            capabilities.dedicated_transfer
        );

        let shared = Arc::new(DeviceShared {
            memory: MemoryAllocator::new(driver.clone(), &config.memory, statistics.clone()),
            descriptors: DescriptorAllocator::new(
                driver.clone(),
                statistics.clone(),
                config.descriptors.resource_heap_capacity,
                config.descriptors.sampler_heap_capacity,
            ),
            driver,
            queues,
            statistics,
            config,
            limits,
            deletion: DeletionQueue::default(),
            next_id: AtomicU64::new(0),
        });

        Ok(Self {
            upload: UploadManager::new(shared.clone()),
            shared,
            capabilities,
            adapter,
            pipelines: PipelineCache::default(),
            render_passes: RenderPassCache::default(),
            framebuffers: Arc::new(FramebufferCache::default()),
            samplers: SamplerCache::default(),
        })
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.shared.limits
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn statistics(&self) -> &Statistics {
        &self.shared.statistics
    }

    /// Returns the queue work of `ty` is submitted to.
    pub fn queue(&self, ty: QueueType) -> &Arc<Queue> {
        self.shared.queues.get(ty)
    }

    pub fn upload(&self) -> &UploadManager {
        &self.upload
    }

    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Buffer, Error> {
        let _span = trace_span!("Device::create_buffer").entered();

        if descriptor.size > self.shared.limits.max_buffer_size {
            return Err(LimitError::BufferSize {
                size: descriptor.size,
                max: self.shared.limits.max_buffer_size,
            }
            .into());
        }

        self.shared.create_buffer(descriptor, AllocationKind::Buffer)
    }

    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Texture, Error> {
        let _span = trace_span!("Device::create_texture").entered();

        validate_texture(descriptor, &self.shared.limits)?;

        let driver = &self.shared.driver;
        let raw = driver.create_texture(descriptor)?;
        let req = driver.texture_memory_requirements(raw);

        let allocation =
            match self
                .shared
                .memory
                .alloc(&req, DeviceAccess::GpuReadWrite, AllocationKind::Texture)
            {
                Ok(allocation) => allocation,
                Err(err) => {
                    // SAFETY: The texture was never used.
                    unsafe {
                        driver.destroy_texture(raw);
                    }
                    return Err(err);
                }
            };

        // SAFETY: The allocation satisfies the requirements of the texture.
        let res = unsafe { driver.bind_texture_memory(raw, allocation.memory(), allocation.offset()) };
        if let Err(err) = res {
            // SAFETY: The texture was never used.
            unsafe {
                driver.destroy_texture(raw);
                self.shared.memory.dealloc(allocation);
            }
            return Err(err.into());
        }

        Ok(Texture::new(
            self.shared.clone(),
            raw,
            descriptor,
            Some(allocation),
            true,
        ))
    }

    /// Returns a sampler for `descriptor`, creating it on first use.
    pub fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<Sampler, Error> {
        self.samplers.get_or_try_insert_with(*descriptor, || {
            let raw = self.shared.driver.create_sampler(descriptor)?;
            self.shared.statistics.samplers_created.increment();
            Ok(Sampler::new(self.shared.clone(), raw, *descriptor))
        })
    }

    pub fn create_shader(&self, descriptor: &ShaderDescriptor<'_>) -> Result<Shader, Error> {
        let _span = trace_span!("Device::create_shader").entered();

        let limits = &self.shared.limits;
        if descriptor.push_constant_size > limits.max_push_constant_size {
            return Err(LimitError::PushConstants {
                size: descriptor.push_constant_size,
                max: limits.max_push_constant_size,
            }
            .into());
        }

        if descriptor.bindings.len() as u32 > limits.max_bindings_per_table {
            return Err(LimitError::Bindings {
                count: descriptor.bindings.len() as u32,
                max: limits.max_bindings_per_table,
            }
            .into());
        }

        let raw = self
            .shared
            .driver
            .create_shader_module(descriptor.stage, descriptor.code)?;
        Ok(Shader::new(self.shared.clone(), raw, descriptor))
    }

    /// Returns a graphics pipeline for `descriptor`, creating it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the shaders do not match their stage or declare conflicting bindings.
    pub fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor<'_>,
    ) -> Result<Pipeline, Error> {
        let _span = trace_span!("Device::create_graphics_pipeline").entered();

        assert_eq!(descriptor.vertex.stage(), ShaderStage::Vertex);
        if let Some(fragment) = descriptor.fragment {
            assert_eq!(fragment.stage(), ShaderStage::Fragment);
        }

        let limits = &self.shared.limits;
        if descriptor.color_targets.len() as u32 > limits.max_color_attachments {
            return Err(LimitError::ColorAttachments {
                count: descriptor.color_targets.len() as u32,
                max: limits.max_color_attachments,
            }
            .into());
        }

        let attributes: usize = descriptor
            .vertex_buffers
            .iter()
            .map(|buffer| buffer.attributes.len())
            .sum();
        if attributes as u32 > limits.max_vertex_attributes {
            return Err(LimitError::VertexAttributes {
                count: attributes as u32,
                max: limits.max_vertex_attributes,
            }
            .into());
        }

        self.pipelines.get_or_try_insert_with(descriptor.key(), || {
            let layout = self.binding_layout(&descriptor.shaders())?;
            let render_pass = self.render_pass(&descriptor.render_pass_layout())?;
            let raw_layout = layout.raw();

            let raw = self.shared.driver.create_graphics_pipeline(
                &RawGraphicsPipelineDescriptor {
                    vertex: (descriptor.vertex.raw(), descriptor.vertex.entry()),
                    fragment: descriptor
                        .fragment
                        .map(|shader| (shader.raw(), shader.entry())),
                    vertex_buffers: descriptor.vertex_buffers,
                    topology: descriptor.topology,
                    cull_mode: descriptor.cull_mode,
                    front_face: descriptor.front_face,
                    color_targets: descriptor.color_targets,
                    depth_stencil: descriptor.depth_stencil,
                    sample_count: descriptor.sample_count,
                    render_pass: render_pass.raw(),
                    layout: &raw_layout,
                },
            )?;

            self.shared.statistics.pipelines_created.increment();
            tracing::debug!(
                "created graphics pipeline with {} bindings",
                layout.bindings().len()
            );

            Ok(Pipeline::new(
                self.shared.clone(),
                raw,
                PipelineBindPoint::Graphics,
                layout,
                Some(AttachmentFormats::from_layout(render_pass.layout())),
            ))
        })
    }

    /// Returns a compute pipeline for `descriptor`, creating it on first use.
    pub fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor<'_>,
    ) -> Result<Pipeline, Error> {
        let _span = trace_span!("Device::create_compute_pipeline").entered();

        assert_eq!(descriptor.shader.stage(), ShaderStage::Compute);

        self.pipelines.get_or_try_insert_with(descriptor.key(), || {
            let layout = self.binding_layout(&[descriptor.shader])?;
            let raw_layout = layout.raw();

            let raw = self
                .shared
                .driver
                .create_compute_pipeline(&RawComputePipelineDescriptor {
                    shader: (descriptor.shader.raw(), descriptor.shader.entry()),
                    layout: &raw_layout,
                })?;

            self.shared.statistics.pipelines_created.increment();
            Ok(Pipeline::new(
                self.shared.clone(),
                raw,
                PipelineBindPoint::Compute,
                layout,
                None,
            ))
        })
    }

    fn binding_layout(&self, shaders: &[&Shader]) -> Result<Arc<BindingLayout>, Error> {
        let layout = BindingLayout::new(shaders);
        let limits = &self.shared.limits;

        if layout.bindings().len() as u32 > limits.max_bindings_per_table {
            return Err(LimitError::Bindings {
                count: layout.bindings().len() as u32,
                max: limits.max_bindings_per_table,
            }
            .into());
        }

        if layout.push_constant_size() > limits.max_push_constant_size {
            return Err(LimitError::PushConstants {
                size: layout.push_constant_size(),
                max: limits.max_push_constant_size,
            }
            .into());
        }

        Ok(Arc::new(layout))
    }

    fn render_pass(&self, layout: &RenderPassLayout) -> Result<RenderPass, Error> {
        self.render_passes.get_or_try_insert_with(layout.clone(), || {
            let raw = self.shared.driver.create_render_pass(layout)?;
            self.shared.statistics.render_passes_created.increment();
            Ok(RenderPass::new(self.shared.clone(), raw, layout.clone()))
        })
    }

    /// Creates a descriptor table matching the binding layout of `pipeline`.
    pub fn create_descriptor_table(&self, pipeline: &Pipeline) -> Result<DescriptorTable, Error> {
        DescriptorTable::new(self.shared.clone(), pipeline.layout().clone())
    }

    /// Returns a framebuffer for the attachments, creating it on first use.
    ///
    /// # Panics
    ///
    /// Panics if there are no attachments, the attachments differ in size or an attachment
    /// lacks the `RENDER_ATTACHMENT` usage.
    pub fn create_framebuffer(
        &self,
        descriptor: &FramebufferDescriptor<'_>,
    ) -> Result<Framebuffer, Error> {
        let _span = trace_span!("Device::create_framebuffer").entered();

        let limits = &self.shared.limits;
        if descriptor.colors.len() as u32 > limits.max_color_attachments {
            return Err(LimitError::ColorAttachments {
                count: descriptor.colors.len() as u32,
                max: limits.max_color_attachments,
            }
            .into());
        }

        if descriptor.layers == 0 {
            return Err(LimitError::ZeroSized.into());
        }

        if descriptor.layers > limits.max_array_layers {
            return Err(LimitError::ArrayLayers {
                count: descriptor.layers,
                max: limits.max_array_layers,
            }
            .into());
        }

        for texture in descriptor.textures() {
            assert!(
                texture.usage().contains(TextureUsage::RENDER_ATTACHMENT),
                "texture {:?} lacks RENDER_ATTACHMENT usage",
                texture.id()
            );
        }

        self.framebuffers
            .get_or_try_insert_with(descriptor.key(), || {
                let render_pass = self.render_pass(&descriptor.layout())?;
                let attachments: Vec<_> = descriptor
                    .textures()
                    .iter()
                    .map(|texture| texture.raw())
                    .collect();
                let (width, height) = descriptor.extent();

                let raw = self
                    .shared
                    .driver
                    .create_framebuffer(&RawFramebufferDescriptor {
                        render_pass: render_pass.raw(),
                        attachments: &attachments,
                        width,
                        height,
                        layers: descriptor.layers,
                    })?;

                self.shared.statistics.framebuffers_created.increment();
                Ok(Framebuffer::new(
                    self.shared.clone(),
                    raw,
                    render_pass,
                    descriptor,
                ))
            })
    }

    pub fn create_swapchain(
        &self,
        surface: RawSurface,
        config: SwapchainConfig,
    ) -> Result<Swapchain, Error> {
        Swapchain::new(
            self.shared.clone(),
            self.framebuffers.clone(),
            surface,
            config,
        )
    }

    /// Creates a command context recording for the queue of `queue_type`.
    pub fn create_command_context(&self, queue_type: QueueType) -> Result<CommandContext, Error> {
        CommandContext::new(self.shared.clone(), queue_type)
    }

    /// Submits the recorded work of all `contexts`.
    ///
    /// Buffers of contexts sharing a queue are submitted in a single batch, in the order of
    /// `contexts`. Returns the submission of every queue that received work.
    pub fn submit(
        &self,
        contexts: &mut [&mut CommandContext],
    ) -> Result<Vec<SubmissionIndex>, Error> {
        let _span = trace_span!("Device::submit").entered();

        let mut batches: Vec<(Arc<Queue>, Vec<(usize, PreparedSubmit)>)> = Vec::new();
        for (index, ctx) in contexts.iter_mut().enumerate() {
            let prepared = ctx.prepare_submit()?;
            if prepared.is_empty() {
                continue;
            }

            let queue = ctx.queue();
            match batches
                .iter_mut()
                .find(|(batch_queue, _)| batch_queue.raw() == queue.raw())
            {
                Some((_, batch)) => batch.push((index, prepared)),
                None => batches.push((queue.clone(), vec![(index, prepared)])),
            }
        }

        let mut submissions = Vec::with_capacity(batches.len());
        for (queue, batch) in batches {
            let command_buffers: Vec<_> = batch
                .iter()
                .flat_map(|(_, prepared)| prepared.command_buffers.iter().copied())
                .collect();
            let mut waits: Vec<_> = batch
                .iter()
                .flat_map(|(_, prepared)| prepared.waits.iter().copied())
                .collect();
            waits.sort();
            waits.dedup();

            let submission = queue.submit(&command_buffers, &waits)?;
            for (index, prepared) in &batch {
                contexts[*index].finish_submit(prepared, submission);
            }

            submissions.push(submission);
        }

        Ok(submissions)
    }

    /// Destroys dropped objects whose submissions have completed, removes framebuffers with
    /// dropped attachments and releases staging memory of completed uploads.
    pub fn maintain(&self) {
        let _span = trace_span!("Device::maintain").entered();

        for queue in self.shared.queues.unique() {
            queue.retire();
        }

        let purged = self.framebuffers.purge_stale();
        if purged != 0 {
            tracing::trace!("purged {} stale framebuffers", purged);
        }

        self.upload.sweep();
        self.shared.maintain();
    }

    /// Blocks until all submitted work has completed.
    pub fn wait_idle(&self) -> Result<(), Error> {
        self.shared.queues.wait_idle()?;
        self.maintain();
        Ok(())
    }

    /// Drops all cached framebuffers using `texture`.
    ///
    /// Returns the number of dropped framebuffers.
    pub fn invalidate_texture(&self, texture: &Texture) -> usize {
        self.framebuffers.invalidate_texture(texture.id())
    }

    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn cached_render_passes(&self) -> usize {
        self.render_passes.len()
    }

    pub fn cached_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn cached_samplers(&self) -> usize {
        self.samplers.len()
    }

    /// Returns the number of dropped objects waiting for their submissions.
    pub fn pending_deletions(&self) -> usize {
        self.shared.deletion.len()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.framebuffers.clear();
        self.pipelines.clear();
        self.render_passes.clear();
        self.samplers.clear();
        self.upload.trim();
    }
}

fn validate_texture(descriptor: &TextureDescriptor, limits: &DeviceLimits) -> Result<(), LimitError> {
    let size = descriptor.size;
    if size.x == 0
        || size.y == 0
        || size.z == 0
        || descriptor.mip_levels == 0
        || descriptor.array_layers == 0
    {
        return Err(LimitError::ZeroSized);
    }

    let (max_dimension, max_depth) = match descriptor.dimension {
        TextureDimension::D3 => (limits.max_texture_dimension_3d, limits.max_texture_dimension_3d),
        TextureDimension::D1 | TextureDimension::D2 => (limits.max_texture_dimension_2d, 1),
    };

    for dimension in [size.x, size.y] {
        if dimension > max_dimension {
            return Err(LimitError::TextureDimension {
                size: dimension,
                max: max_dimension,
            });
        }
    }

    if size.z > max_depth {
        return Err(LimitError::TextureDimension {
            size: size.z,
            max: max_depth,
        });
    }

    if descriptor.array_layers > limits.max_array_layers {
        return Err(LimitError::ArrayLayers {
            count: descriptor.array_layers,
            max: limits.max_array_layers,
        });
    }

    // A full mip chain ends at a 1x1 level.
    let largest = size.x.max(size.y).max(size.z);
    let max_mip_levels = (u32::BITS - largest.leading_zeros()).min(limits.max_mip_levels);
    if descriptor.mip_levels > max_mip_levels {
        return Err(LimitError::MipLevels {
            count: descriptor.mip_levels,
            max: max_mip_levels,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::UVec3;

    use crate::backend::null::{Completion, NullAdapter, NullDriver};
    use crate::backend::{CommandBufferLevel, LoadOp, StoreOp, TextureFormat};
    use crate::config::{BackendKind, DeviceConfig};
    use crate::descriptor::BindingKind;
    use crate::error::{Error, LimitError};
    use crate::memory::DeviceAccess;
    use crate::pipeline::{
        ColorTargetState, ComputePipelineDescriptor, FrontFace, GraphicsPipelineDescriptor,
        PrimitiveTopology,
    };
    use crate::queue::QueueType;
    use crate::render_pass::{ColorAttachment, FramebufferDescriptor};
    use crate::resource::{
        BufferDescriptor, BufferUsage, TextureDescriptor, TextureDimension, TextureUsage,
    };
    use crate::sampler::SamplerDescriptor;
    use crate::shader::{ShaderBinding, ShaderDescriptor, ShaderStage};
    use crate::state::ResourceState;

    use super::{validate_texture, Device};

    fn device() -> Device {
        Device::new(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn capabilities_of_null_adapter() {
        let device = device();
        assert!(device.capabilities().async_compute);
        assert!(device.capabilities().dedicated_transfer);
        assert_eq!(device.adapter_info().name, "Null Adapter");
    }

    #[cfg(not(feature = "vulkan"))]
    #[test]
    fn vulkan_without_feature() {
        let config = DeviceConfig {
            backend: BackendKind::Vulkan,
            ..Default::default()
        };
        assert!(matches!(Device::new(config), Err(Error::Unsupported(_))));
    }

    #[test]
    fn buffer_limits() {
        let device = device();
        let descriptor = |size| BufferDescriptor {
            size,
            usage: BufferUsage::STORAGE,
            access: DeviceAccess::GpuReadWrite,
        };

        assert_eq!(
            device.create_buffer(&descriptor(0)).unwrap_err(),
            Error::LimitExceeded(LimitError::ZeroSized)
        );

        let max = device.limits().max_buffer_size;
        assert_eq!(
            device.create_buffer(&descriptor(max + 1)).unwrap_err(),
            Error::LimitExceeded(LimitError::BufferSize { size: max + 1, max })
        );
    }

    #[test]
    fn texture_limits() {
        let limits = Default::default();
        let descriptor = |size: UVec3, dimension, mip_levels, array_layers| TextureDescriptor {
            size,
            dimension,
            mip_levels,
            array_layers,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING,
        };

        let d2 = TextureDimension::D2;
        assert!(validate_texture(&descriptor(UVec3::new(256, 256, 1), d2, 9, 1), &limits).is_ok());
        assert_eq!(
            validate_texture(&descriptor(UVec3::new(256, 256, 1), d2, 10, 1), &limits),
            Err(LimitError::MipLevels { count: 10, max: 9 })
        );
        assert_eq!(
            validate_texture(&descriptor(UVec3::new(16385, 1, 1), d2, 1, 1), &limits),
            Err(LimitError::TextureDimension {
                size: 16385,
                max: 16384
            })
        );
        assert_eq!(
            validate_texture(&descriptor(UVec3::new(4, 4, 2), d2, 1, 1), &limits),
            Err(LimitError::TextureDimension { size: 2, max: 1 })
        );
        assert_eq!(
            validate_texture(&descriptor(UVec3::new(4, 4, 1), d2, 1, 4096), &limits),
            Err(LimitError::ArrayLayers {
                count: 4096,
                max: 2048
            })
        );
        assert_eq!(
            validate_texture(&descriptor(UVec3::new(4, 0, 1), d2, 1, 1), &limits),
            Err(LimitError::ZeroSized)
        );
        assert!(validate_texture(
            &descriptor(UVec3::new(64, 64, 64), TextureDimension::D3, 7, 1),
            &limits
        )
        .is_ok());
    }

    #[test]
    fn samplers_are_cached() {
        let device = device();
        let a = device.create_sampler(&SamplerDescriptor::default()).unwrap();
        let b = device.create_sampler(&SamplerDescriptor::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.statistics().samplers_created.get(), 1);
        assert_eq!(device.cached_samplers(), 1);
    }

    #[test]
    fn pipelines_are_cached() {
        let device = device();
        let bindings = [ShaderBinding {
            name: String::from("camera"),
            slot: 0,
            kind: BindingKind::UniformBuffer,
            size: 64,
        }];

        let vertex = device
            .create_shader(&ShaderDescriptor {
                stage: ShaderStage::Vertex,
                code: &[1, 2, 3, 4],
                entry: "main",
                bindings: &bindings,
                push_constant_size: 0,
            })
            .unwrap();
        // A second module with identical content.
        let vertex2 = device
            .create_shader(&ShaderDescriptor {
                stage: ShaderStage::Vertex,
                code: &[1, 2, 3, 4],
                entry: "main",
                bindings: &bindings,
                push_constant_size: 0,
            })
            .unwrap();

        let targets = [ColorTargetState {
            format: TextureFormat::Rgba8Unorm,
            blend: None,
        }];
        let descriptor = |vertex| GraphicsPipelineDescriptor {
            vertex,
            fragment: None,
            vertex_buffers: &[],
            topology: PrimitiveTopology::TriangleList,
            cull_mode: None,
            front_face: FrontFace::Ccw,
            color_targets: &targets,
            depth_stencil: None,
            sample_count: 1,
        };

        let a = device.create_graphics_pipeline(&descriptor(&vertex)).unwrap();
        let b = device.create_graphics_pipeline(&descriptor(&vertex2)).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.statistics().pipelines_created.get(), 1);
        assert_eq!(device.statistics().render_passes_created.get(), 1);
        assert_eq!(a.layout().bindings().len(), 1);
    }

    #[test]
    fn compute_pipeline_push_constant_limit() {
        let device = device();
        let max = device.limits().max_push_constant_size;

        let err = device
            .create_shader(&ShaderDescriptor {
                stage: ShaderStage::Compute,
                code: &[0; 4],
                entry: "main",
                bindings: &[],
                push_constant_size: max + 4,
            })
            .unwrap_err();
        assert_eq!(
            err,
            Error::LimitExceeded(LimitError::PushConstants { size: max + 4, max })
        );

        let shader = device
            .create_shader(&ShaderDescriptor {
                stage: ShaderStage::Compute,
                code: &[0; 4],
                entry: "main",
                bindings: &[],
                push_constant_size: max,
            })
            .unwrap();
        let pipeline = device
            .create_compute_pipeline(&ComputePipelineDescriptor { shader: &shader })
            .unwrap();
        assert_eq!(pipeline.layout().push_constant_size(), max);
    }

    #[test]
    fn framebuffers_are_cached_and_revalidated() {
        let device = device();
        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                32,
                32,
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_ATTACHMENT,
            ))
            .unwrap();

        let create = |texture| {
            device
                .create_framebuffer(&FramebufferDescriptor {
                    colors: &[ColorAttachment {
                        texture,
                        load_op: LoadOp::Clear,
                        store_op: StoreOp::Store,
                    }],
                    depth_stencil: None,
                    layers: 1,
                })
                .unwrap()
        };

        let a = create(&texture);
        let b = create(&texture);
        assert_eq!(a, b);
        assert_eq!(device.statistics().framebuffers_created.get(), 1);

        drop(texture);
        assert!(!a.is_valid());
        drop((a, b));
        device.maintain();
        assert_eq!(device.cached_framebuffers(), 0);
    }

    #[test]
    #[should_panic(expected = "RENDER_ATTACHMENT")]
    fn framebuffer_attachment_usage() {
        let device = device();
        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                4,
                4,
                TextureFormat::Rgba8Unorm,
                TextureUsage::TEXTURE_BINDING,
            ))
            .unwrap();

        let _ = device.create_framebuffer(&FramebufferDescriptor {
            colors: &[ColorAttachment {
                texture: &texture,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil: None,
            layers: 1,
        });
    }

    #[test]
    fn submit_groups_by_queue() {
        let driver = Arc::new(NullDriver::new(NullAdapter {
            completion: Completion::Manual,
            ..NullAdapter::integrated()
        }));
        let device = Device::with_driver(driver.clone(), DeviceConfig::default()).unwrap();

        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 64,
                usage: BufferUsage::STORAGE,
                access: DeviceAccess::GpuReadWrite,
            })
            .unwrap();

        // Without dedicated queues both contexts share the graphics queue.
        let mut graphics = device.create_command_context(QueueType::Graphics).unwrap();
        let mut compute = device.create_command_context(QueueType::Compute).unwrap();
        graphics
            .primary()
            .unwrap()
            .transition_buffer(&buffer, ResourceState::ShaderRead);
        compute
            .command_buffer(CommandBufferLevel::Primary)
            .unwrap()
            .transition_buffer(&buffer, ResourceState::UnorderedAccess);

        let submissions = device.submit(&mut [&mut graphics, &mut compute]).unwrap();
        assert_eq!(submissions.len(), 1);

        let batches = driver.submissions(submissions[0].queue());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].command_buffers.len(), 2);
    }

    #[test]
    fn dropped_objects_wait_for_submissions() {
        let driver = Arc::new(NullDriver::new(NullAdapter {
            completion: Completion::Manual,
            ..NullAdapter::default()
        }));
        let device = Device::with_driver(driver.clone(), DeviceConfig::default()).unwrap();

        let buffer = device
            .create_buffer(&BufferDescriptor {
                size: 64,
                usage: BufferUsage::STORAGE,
                access: DeviceAccess::GpuReadWrite,
            })
            .unwrap();

        let mut ctx = device.create_command_context(QueueType::Graphics).unwrap();
        ctx.primary()
            .unwrap()
            .transition_buffer(&buffer, ResourceState::UnorderedAccess);
        ctx.submit().unwrap();

        drop(buffer);
        device.maintain();
        // The submission may still read from the buffer.
        assert_eq!(device.pending_deletions(), 1);
        assert_eq!(device.statistics().memory.read().used(), 64);

        driver.complete_all();
        device.maintain();
        assert_eq!(device.pending_deletions(), 0);
        assert_eq!(device.statistics().memory.read().used(), 0);
    }
}
