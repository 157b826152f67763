//! A driver without a GPU.
//!
//! The null driver keeps enough bookkeeping to behave like a real device: memory heaps run out,
//! command buffers record into a command log, queues advance a timeline and swapchains hand out
//! images. Buffer copies are executed on submission so host visible results can be read back. Completion of submitted work is either immediate or driven by hand, which makes the
//! driver usable for deterministic tests of everything above the [`Driver`] trait.

use std::num::NonZeroU64;
use std::ops::Range;
use std::ptr::NonNull;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::descriptor::HeapKind;
use crate::resource::{BufferUsage, TextureDescriptor};
use crate::sampler::SamplerDescriptor;
use crate::shader::ShaderStage;
use crate::swapchain::SwapchainConfig;

use super::{
    AcquiredImage, AdapterInfo, AdapterKind, AdapterMemoryProperties, BackendError,
    CommandBufferLevel, Command, DeviceLimits, Driver, MemoryHeap, MemoryRequirements, MemoryType,
    MemoryTypeFlags, QueueCapabilities, QueueFamily, RawBindingResource, RawBuffer,
    RawCommandBuffer, RawCommandPool, RawComputePipelineDescriptor, RawDescriptorHeap,
    RawFramebuffer, RawFramebufferDescriptor, RawGraphicsPipelineDescriptor, RawMemory, RawObject,
    RawPipeline, RawQueue, RawRenderPass, RawSampler, RawShaderModule, RawSurface, RawSwapchain,
    RawTexture, RenderPassLayout, SubmitBatch, SurfaceError,
};

const BUFFER_ALIGNMENT: u64 = 256;
const TEXTURE_ALIGNMENT: u64 = 4096;

/// When submitted work completes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Completion {
    /// Every batch completes as soon as it is submitted.
    #[default]
    Immediate,
    /// Batches only complete through [`NullDriver::complete_up_to`], [`NullDriver::complete_all`]
    /// or by waiting on them.
    Manual,
}

/// The properties of the simulated adapter.
#[derive(Clone, Debug)]
pub struct NullAdapter {
    pub name: String,
    pub kind: AdapterKind,
    /// Flags of every memory type. Device local types live on heap 0, all others on heap 1.
    pub memory_types: Vec<MemoryTypeFlags>,
    /// Size of every memory heap in bytes.
    pub heap_size: u64,
    /// Capabilities of every queue family. Every family has a single queue.
    pub families: Vec<QueueCapabilities>,
    pub limits: DeviceLimits,
    pub completion: Completion,
}

impl NullAdapter {
    /// An adapter with separate compute and transfer queue families and dedicated video
    /// memory.
    pub fn discrete() -> Self {
        Self {
            name: String::from("Null Adapter"),
            kind: AdapterKind::DiscreteGpu,
            memory_types: vec![
                MemoryTypeFlags::DEVICE_LOCAL,
                MemoryTypeFlags::HOST_VISIBLE | MemoryTypeFlags::HOST_COHERENT,
                MemoryTypeFlags::HOST_VISIBLE
                    | MemoryTypeFlags::HOST_COHERENT
                    | MemoryTypeFlags::HOST_CACHED,
                MemoryTypeFlags::DEVICE_LOCAL
                    | MemoryTypeFlags::HOST_VISIBLE
                    | MemoryTypeFlags::HOST_COHERENT,
            ],
            heap_size: 1 << 30,
            families: vec![
                QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
                QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
                QueueCapabilities::TRANSFER,
            ],
            limits: DeviceLimits::default(),
            completion: Completion::Immediate,
        }
    }

    /// An adapter with a single queue family and unified memory.
    pub fn integrated() -> Self {
        Self {
            name: String::from("Null Adapter"),
            kind: AdapterKind::IntegratedGpu,
            memory_types: vec![
                MemoryTypeFlags::DEVICE_LOCAL,
                MemoryTypeFlags::DEVICE_LOCAL
                    | MemoryTypeFlags::HOST_VISIBLE
                    | MemoryTypeFlags::HOST_COHERENT,
                MemoryTypeFlags::DEVICE_LOCAL
                    | MemoryTypeFlags::HOST_VISIBLE
                    | MemoryTypeFlags::HOST_COHERENT
                    | MemoryTypeFlags::HOST_CACHED,
            ],
            heap_size: 1 << 30,
            families: vec![
                QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
            ],
            limits: DeviceLimits::default(),
            completion: Completion::Immediate,
        }
    }
}

impl Default for NullAdapter {
    fn default() -> Self {
        Self::discrete()
    }
}

/// A batch as it was handed to a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NullSubmission {
    pub command_buffers: Vec<RawCommandBuffer>,
    pub waits: Vec<(RawQueue, u64)>,
    pub signal: u64,
}

#[derive(Debug)]
pub struct NullDriver {
    adapter: NullAdapter,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    lost: bool,
    heap_usage: [u64; 2],
    memory: HashMap<RawMemory, Memory>,
    buffers: HashMap<RawBuffer, NullBuffer>,
    textures: HashMap<RawTexture, NullTexture>,
    samplers: HashMap<RawSampler, SamplerDescriptor>,
    shader_modules: HashMap<RawShaderModule, ShaderStage>,
    descriptor_heaps: HashMap<RawDescriptorHeap, DescriptorHeap>,
    render_passes: HashMap<RawRenderPass, RenderPassLayout>,
    framebuffers: HashMap<RawFramebuffer, Vec<RawTexture>>,
    pipelines: HashSet<RawPipeline>,
    command_pools: HashMap<RawCommandPool, u32>,
    command_buffers: HashMap<RawCommandBuffer, NullCommandBuffer>,
    queues: Vec<NullQueue>,
    surfaces: HashMap<RawSurface, NullSurface>,
    swapchains: HashMap<RawSwapchain, NullSwapchain>,
    presented: usize,
    debug_names: HashMap<RawObject, String>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn queue_mut(&mut self, raw: RawQueue) -> Result<&mut NullQueue, BackendError> {
        self.queues
            .iter_mut()
            .find(|queue| queue.raw == raw)
            .ok_or(BackendError::Unsupported("unknown queue"))
    }

    /// Appends the buffer copies of `buffer` and of the secondary buffers it executes.
    fn collect_copies(&self, buffer: RawCommandBuffer, copies: &mut Vec<Command>) {
        let Some(buffer) = self.command_buffers.get(&buffer) else {
            return;
        };

        for command in &buffer.commands {
            match command {
                Command::CopyBuffer { .. } => copies.push(command.clone()),
                Command::ExecuteSecondary { buffers } => {
                    for secondary in buffers {
                        self.collect_copies(*secondary, copies);
                    }
                }
                _ => (),
            }
        }
    }

    /// Returns the memory bytes backing `offset..offset + size` of a bound buffer.
    fn buffer_bytes(
        &self,
        buffer: RawBuffer,
        offset: u64,
        size: u64,
    ) -> Option<(RawMemory, Range<usize>)> {
        let buffer = self.buffers.get(&buffer)?;
        let (memory, base) = buffer.binding?;
        assert!(
            offset + size <= buffer.size,
            "copy of {} bytes at offset {} exceeds buffer of size {}",
            size,
            offset,
            buffer.size
        );

        let start = (base + offset) as usize;
        Some((memory, start..start + size as usize))
    }

    fn copy_buffer(
        &mut self,
        src: RawBuffer,
        src_offset: u64,
        dst: RawBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        let Some((src, src_range)) = self.buffer_bytes(src, src_offset, size) else {
            return;
        };
        let Some((dst, dst_range)) = self.buffer_bytes(dst, dst_offset, size) else {
            return;
        };

        let Some(data) = self.memory.get(&src).map(|block| block.data[src_range].to_vec()) else {
            return;
        };
        if let Some(block) = self.memory.get_mut(&dst) {
            block.data[dst_range].copy_from_slice(&data);
        }
    }
}

#[derive(Debug)]
struct Memory {
    data: Box<[u8]>,
    heap: usize,
    host_visible: bool,
}

#[derive(Debug)]
struct NullBuffer {
    size: u64,
    /// The memory and offset the buffer is bound to.
    binding: Option<(RawMemory, u64)>,
}

#[derive(Debug)]
struct NullTexture {
    size: u64,
    bound: bool,
    /// Images of a swapchain are destroyed together with the swapchain.
    swapchain: bool,
}

#[derive(Debug)]
struct DescriptorHeap {
    kind: HeapKind,
    slots: Vec<Option<RawBindingResource>>,
}

#[derive(Debug)]
struct NullCommandBuffer {
    pool: RawCommandPool,
    level: CommandBufferLevel,
    recording: bool,
    commands: Vec<Command>,
}

#[derive(Debug)]
struct NullQueue {
    raw: RawQueue,
    family: u32,
    submitted: u64,
    completed: u64,
    submissions: Vec<NullSubmission>,
}

#[derive(Debug)]
struct NullSurface {
    error: SurfaceError,
    failures: u32,
}

impl NullSurface {
    fn fail(&mut self) -> Result<(), SurfaceError> {
        if self.failures == 0 {
            return Ok(());
        }

        self.failures = self.failures.saturating_sub(1);
        Err(self.error)
    }
}

#[derive(Debug)]
struct NullSwapchain {
    surface: RawSurface,
    images: Vec<RawTexture>,
    next_image: u32,
}

impl NullDriver {
    pub fn new(adapter: NullAdapter) -> Self {
        let mut state = State::default();
        for (id, _) in adapter.families.iter().enumerate() {
            let raw = RawQueue(state.handle());
            state.queues.push(NullQueue {
                raw,
                family: id as u32,
                submitted: 0,
                completed: 0,
                submissions: Vec::new(),
            });
        }

        Self {
            adapter,
            state: Mutex::new(state),
        }
    }

    pub fn adapter(&self) -> &NullAdapter {
        &self.adapter
    }

    /// Completes all batches of `queue` with a signal value up to `value`.
    pub fn complete_up_to(&self, queue: RawQueue, value: u64) {
        let mut state = self.state.lock();
        if let Ok(queue) = state.queue_mut(queue) {
            queue.completed = queue.completed.max(value.min(queue.submitted));
        }
    }

    /// Completes every submitted batch on every queue.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        for queue in &mut state.queues {
            queue.completed = queue.submitted;
        }
    }

    /// Returns every batch submitted to `queue` in submission order.
    pub fn submissions(&self, queue: RawQueue) -> Vec<NullSubmission> {
        let state = self.state.lock();
        state
            .queues
            .iter()
            .find(|q| q.raw == queue)
            .map(|q| q.submissions.clone())
            .unwrap_or_default()
    }

    /// Returns the commands recorded into `buffer` since it was last begun.
    pub fn commands(&self, buffer: RawCommandBuffer) -> Vec<Command> {
        let state = self.state.lock();
        state
            .command_buffers
            .get(&buffer)
            .map(|buffer| buffer.commands.clone())
            .unwrap_or_default()
    }

    /// Returns the resource last written into a descriptor heap slot.
    pub fn descriptor(&self, heap: RawDescriptorHeap, slot: u32) -> Option<RawBindingResource> {
        let state = self.state.lock();
        state
            .descriptor_heaps
            .get(&heap)
            .and_then(|heap| heap.slots.get(slot as usize).copied().flatten())
    }

    pub fn debug_name(&self, object: RawObject) -> Option<String> {
        self.state.lock().debug_names.get(&object).cloned()
    }

    /// Returns the number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Returns the number of live textures, including swapchain images.
    pub fn texture_count(&self) -> usize {
        self.state.lock().textures.len()
    }

    /// Returns the number of bytes allocated from the heap.
    pub fn heap_usage(&self, heap: usize) -> u64 {
        self.state.lock().heap_usage[heap]
    }

    pub fn create_surface(&self) -> RawSurface {
        let mut state = self.state.lock();
        let surface = RawSurface(state.handle());
        state.surfaces.insert(
            surface,
            NullSurface {
                error: SurfaceError::OutOfDate,
                failures: 0,
            },
        );
        surface
    }

    /// Makes the next `count` acquisitions and presentations on `surface` fail with `error`.
    pub fn invalidate_surface(&self, surface: RawSurface, error: SurfaceError, count: u32) {
        let mut state = self.state.lock();
        if let Some(surface) = state.surfaces.get_mut(&surface) {
            surface.error = error;
            surface.failures = count;
        }
    }

    /// Returns the number of presented images.
    pub fn presented(&self) -> usize {
        self.state.lock().presented
    }

    /// Makes every following submission, wait and presentation fail with a lost device.
    pub fn lose_device(&self) {
        self.state.lock().lost = true;
    }

    fn heap_of(&self, memory_type: u32) -> usize {
        let flags = self.adapter.memory_types[memory_type as usize];
        if flags.contains(MemoryTypeFlags::DEVICE_LOCAL) {
            0
        } else {
            1
        }
    }

    fn check_lost(&self, state: &State) -> Result<(), BackendError> {
        if state.lost {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

impl Driver for NullDriver {
    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.adapter.name.clone(),
            vendor_id: 0,
            kind: self.adapter.kind,
        }
    }

    fn memory_properties(&self) -> AdapterMemoryProperties {
        AdapterMemoryProperties {
            heaps: vec![
                MemoryHeap {
                    id: 0,
                    size: self.adapter.heap_size,
                },
                MemoryHeap {
                    id: 1,
                    size: self.adapter.heap_size,
                },
            ],
            types: self
                .adapter
                .memory_types
                .iter()
                .enumerate()
                .map(|(id, flags)| MemoryType {
                    id: id as u32,
                    heap: self.heap_of(id as u32) as u32,
                    flags: *flags,
                })
                .collect(),
            max_allocation_size: NonZeroU64::new(self.adapter.heap_size)
                .unwrap_or(NonZeroU64::MIN),
        }
    }

    fn queue_families(&self) -> Vec<QueueFamily> {
        self.adapter
            .families
            .iter()
            .enumerate()
            .map(|(id, capabilities)| QueueFamily {
                id: id as u32,
                count: 1,
                capabilities: *capabilities,
            })
            .collect()
    }

    fn limits(&self) -> DeviceLimits {
        self.adapter.limits
    }

    fn queue(&self, family: u32) -> Result<RawQueue, BackendError> {
        let state = self.state.lock();
        state
            .queues
            .iter()
            .find(|queue| queue.family == family)
            .map(|queue| queue.raw)
            .ok_or(BackendError::Unsupported("unknown queue family"))
    }

    fn allocate_memory(
        &self,
        size: NonZeroU64,
        memory_type: u32,
    ) -> Result<RawMemory, BackendError> {
        let Some(flags) = self.adapter.memory_types.get(memory_type as usize) else {
            return Err(BackendError::Unsupported("unknown memory type"));
        };

        let heap = self.heap_of(memory_type);
        let mut state = self.state.lock();
        self.check_lost(&state)?;

        if state.heap_usage[heap] + size.get() > self.adapter.heap_size {
            return Err(BackendError::OutOfDeviceMemory);
        }

        let Ok(len) = usize::try_from(size.get()) else {
            return Err(BackendError::OutOfHostMemory);
        };

        state.heap_usage[heap] += size.get();
        let memory = RawMemory(state.handle());
        state.memory.insert(
            memory,
            Memory {
                data: vec![0; len].into_boxed_slice(),
                heap,
                host_visible: flags.contains(MemoryTypeFlags::HOST_VISIBLE),
            },
        );

        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: RawMemory) {
        let mut state = self.state.lock();
        if let Some(block) = state.memory.remove(&memory) {
            state.heap_usage[block.heap] -= block.data.len() as u64;
        }
    }

    fn map_memory(&self, memory: RawMemory) -> Result<NonNull<u8>, BackendError> {
        let mut state = self.state.lock();
        let Some(block) = state.memory.get_mut(&memory) else {
            return Err(BackendError::MemoryMapFailed);
        };

        if !block.host_visible {
            return Err(BackendError::MemoryMapFailed);
        }

        // The boxed slice never moves while the block exists.
        NonNull::new(block.data.as_mut_ptr()).ok_or(BackendError::MemoryMapFailed)
    }

    fn flush_memory(&self, memory: RawMemory, range: Range<u64>) -> Result<(), BackendError> {
        let state = self.state.lock();
        match state.memory.get(&memory) {
            Some(block) if range.end <= block.data.len() as u64 => Ok(()),
            _ => Err(BackendError::MemoryMapFailed),
        }
    }

    fn invalidate_memory(&self, memory: RawMemory, range: Range<u64>) -> Result<(), BackendError> {
        self.flush_memory(memory, range)
    }

    fn create_buffer(
        &self,
        size: NonZeroU64,
        _usage: BufferUsage,
    ) -> Result<RawBuffer, BackendError> {
        let mut state = self.state.lock();
        let buffer = RawBuffer(state.handle());
        state.buffers.insert(
            buffer,
            NullBuffer {
                size: size.get(),
                binding: None,
            },
        );
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: RawBuffer) -> MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer).map_or(1, |buffer| buffer.size);

        MemoryRequirements {
            size: NonZeroU64::new(size).unwrap_or(NonZeroU64::MIN),
            align: NonZeroU64::new(BUFFER_ALIGNMENT).unwrap_or(NonZeroU64::MIN),
            memory_types: (0..self.adapter.memory_types.len() as u32).collect(),
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: RawBuffer,
        memory: RawMemory,
        offset: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let Some(len) = state.memory.get(&memory).map(|block| block.data.len() as u64) else {
            return Err(BackendError::Unsupported("unknown memory"));
        };

        let Some(buffer) = state.buffers.get_mut(&buffer) else {
            return Err(BackendError::Unsupported("unknown buffer"));
        };

        assert!(buffer.binding.is_none(), "buffer is already bound");
        assert_eq!(offset % BUFFER_ALIGNMENT, 0, "misaligned buffer offset");
        assert!(offset + buffer.size <= len, "buffer exceeds its memory");
        buffer.binding = Some((memory, offset));
        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: RawBuffer) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<RawTexture, BackendError> {
        let texel_count: u64 = (0..descriptor.mip_levels)
            .map(|mip| {
                let extent = descriptor.mip_extent(mip);
                u64::from(extent.x) * u64::from(extent.y) * u64::from(extent.z)
            })
            .sum();
        let size = texel_count
            * u64::from(descriptor.array_layers)
            * u64::from(descriptor.format.bytes_per_texel());

        let mut state = self.state.lock();
        let texture = RawTexture(state.handle());
        state.textures.insert(
            texture,
            NullTexture {
                size,
                bound: false,
                swapchain: false,
            },
        );
        Ok(texture)
    }

    fn texture_memory_requirements(&self, texture: RawTexture) -> MemoryRequirements {
        let state = self.state.lock();
        let size = state.textures.get(&texture).map_or(1, |texture| texture.size);

        MemoryRequirements {
            size: NonZeroU64::new(size).unwrap_or(NonZeroU64::MIN),
            align: NonZeroU64::new(TEXTURE_ALIGNMENT).unwrap_or(NonZeroU64::MIN),
            memory_types: self
                .adapter
                .memory_types
                .iter()
                .enumerate()
                .filter(|(_, flags)| flags.contains(MemoryTypeFlags::DEVICE_LOCAL))
                .map(|(id, _)| id as u32)
                .collect(),
        }
    }

    unsafe fn bind_texture_memory(
        &self,
        texture: RawTexture,
        memory: RawMemory,
        offset: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let Some(len) = state.memory.get(&memory).map(|block| block.data.len() as u64) else {
            return Err(BackendError::Unsupported("unknown memory"));
        };

        let Some(texture) = state.textures.get_mut(&texture) else {
            return Err(BackendError::Unsupported("unknown texture"));
        };

        assert!(!texture.bound, "texture is already bound");
        assert_eq!(offset % TEXTURE_ALIGNMENT, 0, "misaligned texture offset");
        assert!(offset + texture.size <= len, "texture exceeds its memory");
        texture.bound = true;
        Ok(())
    }

    unsafe fn destroy_texture(&self, texture: RawTexture) {
        let mut state = self.state.lock();
        if let Some(entry) = state.textures.get(&texture) {
            assert!(!entry.swapchain, "swapchain images are owned by the swapchain");
            state.textures.remove(&texture);
        }
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<RawSampler, BackendError> {
        let mut state = self.state.lock();
        let sampler = RawSampler(state.handle());
        state.samplers.insert(sampler, *descriptor);
        Ok(sampler)
    }

    unsafe fn destroy_sampler(&self, sampler: RawSampler) {
        self.state.lock().samplers.remove(&sampler);
    }

    fn create_shader_module(
        &self,
        stage: ShaderStage,
        code: &[u8],
    ) -> Result<RawShaderModule, BackendError> {
        if code.is_empty() || code.len() % 4 != 0 {
            return Err(BackendError::Unsupported(
                "shader code must be a non-empty sequence of 32-bit words",
            ));
        }

        let mut state = self.state.lock();
        let module = RawShaderModule(state.handle());
        state.shader_modules.insert(module, stage);
        Ok(module)
    }

    unsafe fn destroy_shader_module(&self, module: RawShaderModule) {
        self.state.lock().shader_modules.remove(&module);
    }

    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<RawDescriptorHeap, BackendError> {
        let mut state = self.state.lock();
        let heap = RawDescriptorHeap(state.handle());
        state.descriptor_heaps.insert(
            heap,
            DescriptorHeap {
                kind,
                slots: vec![None; capacity as usize],
            },
        );
        Ok(heap)
    }

    unsafe fn destroy_descriptor_heap(&self, heap: RawDescriptorHeap) {
        self.state.lock().descriptor_heaps.remove(&heap);
    }

    unsafe fn write_descriptor(
        &self,
        heap: RawDescriptorHeap,
        slot: u32,
        resource: RawBindingResource,
    ) {
        let mut state = self.state.lock();
        let Some(heap) = state.descriptor_heaps.get_mut(&heap) else {
            panic!("write to unknown descriptor heap {:?}", heap);
        };

        let is_sampler = matches!(resource, RawBindingResource::Sampler(_));
        assert_eq!(
            is_sampler,
            heap.kind == HeapKind::Sampler,
            "{:?} written into {:?} heap",
            resource.kind(),
            heap.kind
        );
        heap.slots[slot as usize] = Some(resource);
    }

    fn create_render_pass(
        &self,
        layout: &RenderPassLayout,
    ) -> Result<RawRenderPass, BackendError> {
        let mut state = self.state.lock();
        let render_pass = RawRenderPass(state.handle());
        state.render_passes.insert(render_pass, layout.clone());
        Ok(render_pass)
    }

    unsafe fn destroy_render_pass(&self, render_pass: RawRenderPass) {
        self.state.lock().render_passes.remove(&render_pass);
    }

    fn create_framebuffer(
        &self,
        descriptor: &RawFramebufferDescriptor<'_>,
    ) -> Result<RawFramebuffer, BackendError> {
        let mut state = self.state.lock();

        let Some(layout) = state.render_passes.get(&descriptor.render_pass) else {
            return Err(BackendError::Unsupported("unknown render pass"));
        };

        let attachment_count = layout.colors.len() + usize::from(layout.depth_stencil.is_some());
        assert_eq!(
            attachment_count,
            descriptor.attachments.len(),
            "framebuffer does not match its render pass"
        );

        let framebuffer = RawFramebuffer(state.handle());
        state
            .framebuffers
            .insert(framebuffer, descriptor.attachments.to_vec());
        Ok(framebuffer)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: RawFramebuffer) {
        self.state.lock().framebuffers.remove(&framebuffer);
    }

    fn create_graphics_pipeline(
        &self,
        descriptor: &RawGraphicsPipelineDescriptor<'_>,
    ) -> Result<RawPipeline, BackendError> {
        let mut state = self.state.lock();
        if !state.render_passes.contains_key(&descriptor.render_pass) {
            return Err(BackendError::Unsupported("unknown render pass"));
        }

        let pipeline = RawPipeline(state.handle());
        state.pipelines.insert(pipeline);
        Ok(pipeline)
    }

    fn create_compute_pipeline(
        &self,
        _descriptor: &RawComputePipelineDescriptor<'_>,
    ) -> Result<RawPipeline, BackendError> {
        let mut state = self.state.lock();
        let pipeline = RawPipeline(state.handle());
        state.pipelines.insert(pipeline);
        Ok(pipeline)
    }

    unsafe fn destroy_pipeline(&self, pipeline: RawPipeline) {
        self.state.lock().pipelines.remove(&pipeline);
    }

    fn create_command_pool(&self, family: u32) -> Result<RawCommandPool, BackendError> {
        let mut state = self.state.lock();
        let pool = RawCommandPool(state.handle());
        state.command_pools.insert(pool, family);
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: RawCommandPool) {
        let mut state = self.state.lock();
        state.command_pools.remove(&pool);
        state.command_buffers.retain(|_, buffer| buffer.pool != pool);
    }

    fn allocate_command_buffer(
        &self,
        pool: RawCommandPool,
        level: CommandBufferLevel,
    ) -> Result<RawCommandBuffer, BackendError> {
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool) {
            return Err(BackendError::Unsupported("unknown command pool"));
        }

        let buffer = RawCommandBuffer(state.handle());
        state.command_buffers.insert(
            buffer,
            NullCommandBuffer {
                pool,
                level,
                recording: false,
                commands: Vec::new(),
            },
        );
        Ok(buffer)
    }

    unsafe fn reset_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let Some(buffer) = state.command_buffers.get_mut(&buffer) {
            buffer.recording = false;
            buffer.commands.clear();
        }
        Ok(())
    }

    unsafe fn begin_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let Some(buffer) = state.command_buffers.get_mut(&buffer) else {
            return Err(BackendError::Unsupported("unknown command buffer"));
        };

        // Beginning implicitly resets the buffer.
        buffer.recording = true;
        buffer.commands.clear();
        Ok(())
    }

    unsafe fn end_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let Some(buffer) = state.command_buffers.get_mut(&buffer) else {
            return Err(BackendError::Unsupported("unknown command buffer"));
        };

        buffer.recording = false;
        Ok(())
    }

    unsafe fn record(&self, buffer: RawCommandBuffer, command: &Command) {
        let mut state = self.state.lock();
        let Some(buffer) = state.command_buffers.get_mut(&buffer) else {
            panic!("record into unknown command buffer {:?}", buffer);
        };

        assert!(buffer.recording, "command buffer is not recording");
        if let Command::ExecuteSecondary { .. } = command {
            assert_eq!(buffer.level, CommandBufferLevel::Primary);
        }

        buffer.commands.push(command.clone());
    }

    fn submit(&self, queue: RawQueue, batch: &SubmitBatch<'_>) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        self.check_lost(&state)?;

        for buffer in batch.command_buffers {
            let Some(buffer) = state.command_buffers.get(buffer) else {
                return Err(BackendError::Unsupported("unknown command buffer"));
            };

            assert!(!buffer.recording, "submitted command buffer is still recording");
            assert_eq!(buffer.level, CommandBufferLevel::Primary);
        }

        let mut copies = Vec::new();
        for buffer in batch.command_buffers {
            state.collect_copies(*buffer, &mut copies);
        }
        for copy in copies {
            if let Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } = copy
            {
                state.copy_buffer(src, src_offset, dst, dst_offset, size);
            }
        }

        let completion = self.adapter.completion;
        let queue = state.queue_mut(queue)?;
        assert!(
            batch.signal > queue.submitted,
            "timeline values must increase ({} after {})",
            batch.signal,
            queue.submitted
        );

        queue.submitted = batch.signal;
        if completion == Completion::Immediate {
            queue.completed = batch.signal;
        }

        queue.submissions.push(NullSubmission {
            command_buffers: batch.command_buffers.to_vec(),
            waits: batch.waits.to_vec(),
            signal: batch.signal,
        });

        Ok(())
    }

    fn completed_value(&self, queue: RawQueue) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        self.check_lost(&state)?;
        Ok(state.queue_mut(queue)?.completed)
    }

    fn wait(&self, queue: RawQueue, value: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        self.check_lost(&state)?;

        // Nothing else would ever complete the work, so waiting completes it.
        let queue = state.queue_mut(queue)?;
        queue.completed = queue.completed.max(value.min(queue.submitted));
        Ok(())
    }

    fn wait_idle(&self, queue: RawQueue) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        self.check_lost(&state)?;

        let queue = state.queue_mut(queue)?;
        queue.completed = queue.submitted;
        Ok(())
    }

    fn create_swapchain(
        &self,
        surface: RawSurface,
        config: &SwapchainConfig,
        old: Option<RawSwapchain>,
    ) -> Result<(RawSwapchain, Vec<RawTexture>), SurfaceError> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(SurfaceError::DeviceLost);
        }

        if !state.surfaces.contains_key(&surface) {
            return Err(SurfaceError::Lost);
        }

        if let Some(old) = old {
            assert_eq!(
                state.swapchains.get(&old).map(|swapchain| swapchain.surface),
                Some(surface),
                "old swapchain belongs to a different surface"
            );
        }

        let images: Vec<_> = (0..config.image_count)
            .map(|_| {
                let texture = RawTexture(state.handle());
                state.textures.insert(
                    texture,
                    NullTexture {
                        size: 0,
                        bound: true,
                        swapchain: true,
                    },
                );
                texture
            })
            .collect();

        let swapchain = RawSwapchain(state.handle());
        state.swapchains.insert(
            swapchain,
            NullSwapchain {
                surface,
                images: images.clone(),
                next_image: 0,
            },
        );

        Ok((swapchain, images))
    }

    unsafe fn destroy_swapchain(&self, swapchain: RawSwapchain) {
        let mut state = self.state.lock();
        if let Some(swapchain) = state.swapchains.remove(&swapchain) {
            for image in swapchain.images {
                state.textures.remove(&image);
            }
        }
    }

    fn acquire_next_image(&self, swapchain: RawSwapchain) -> Result<AcquiredImage, SurfaceError> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(SurfaceError::DeviceLost);
        }

        let Some(surface) = state.swapchains.get(&swapchain).map(|s| s.surface) else {
            return Err(SurfaceError::Lost);
        };

        if let Some(surface) = state.surfaces.get_mut(&surface) {
            surface.fail()?;
        }

        let Some(swapchain) = state.swapchains.get_mut(&swapchain) else {
            return Err(SurfaceError::Lost);
        };

        let index = swapchain.next_image;
        swapchain.next_image = (index + 1) % swapchain.images.len().max(1) as u32;

        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(
        &self,
        queue: RawQueue,
        swapchain: RawSwapchain,
        index: u32,
    ) -> Result<(), SurfaceError> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(SurfaceError::DeviceLost);
        }

        if state.queue_mut(queue).is_err() {
            return Err(SurfaceError::Lost);
        }

        let Some((surface, image_count)) = state
            .swapchains
            .get(&swapchain)
            .map(|s| (s.surface, s.images.len()))
        else {
            return Err(SurfaceError::Lost);
        };

        assert!((index as usize) < image_count, "invalid swapchain image index");

        if let Some(surface) = state.surfaces.get_mut(&surface) {
            surface.fail()?;
        }

        state.presented += 1;
        Ok(())
    }

    fn set_debug_name(&self, object: RawObject, name: &str) {
        self.state
            .lock()
            .debug_names
            .insert(object, name.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use crate::backend::{
        Command, CommandBufferLevel, Driver, MemoryTypeFlags, RawQueue, SubmitBatch, SurfaceError,
    };
    use crate::resource::BufferUsage;
    use crate::swapchain::SwapchainConfig;

    use super::{Completion, NullAdapter, NullDriver};

    #[test]
    fn heap_exhaustion() {
        let driver = NullDriver::new(NullAdapter {
            heap_size: 1024,
            ..NullAdapter::discrete()
        });

        let size = NonZeroU64::new(768).unwrap();
        let memory = driver.allocate_memory(size, 0).unwrap();
        assert!(driver.allocate_memory(size, 0).is_err());
        // Host memory lives on a separate heap.
        assert!(driver.allocate_memory(size, 1).is_ok());

        unsafe {
            driver.free_memory(memory);
        }
        assert_eq!(driver.heap_usage(0), 0);
        assert!(driver.allocate_memory(size, 0).is_ok());
    }

    #[test]
    fn only_host_visible_memory_maps() {
        let driver = NullDriver::new(NullAdapter::discrete());
        assert_eq!(
            driver.adapter().memory_types[0],
            MemoryTypeFlags::DEVICE_LOCAL
        );

        let size = NonZeroU64::new(64).unwrap();
        let device_local = driver.allocate_memory(size, 0).unwrap();
        let host = driver.allocate_memory(size, 1).unwrap();
        assert!(driver.map_memory(device_local).is_err());

        let ptr = driver.map_memory(host).unwrap();
        unsafe {
            ptr.as_ptr().write(42);
            assert_eq!(driver.map_memory(host).unwrap().as_ptr().read(), 42);
        }
    }

    #[test]
    fn manual_completion() {
        let driver = NullDriver::new(NullAdapter {
            completion: Completion::Manual,
            ..NullAdapter::integrated()
        });
        let queue = driver.queue(0).unwrap();

        for signal in 1..=3 {
            driver
                .submit(
                    queue,
                    &SubmitBatch {
                        command_buffers: &[],
                        waits: &[],
                        signal,
                    },
                )
                .unwrap();
        }

        assert_eq!(driver.completed_value(queue).unwrap(), 0);
        driver.complete_up_to(queue, 2);
        assert_eq!(driver.completed_value(queue).unwrap(), 2);
        // Values past the last submission are clamped.
        driver.complete_up_to(queue, 10);
        assert_eq!(driver.completed_value(queue).unwrap(), 3);
        assert_eq!(driver.submissions(queue).len(), 3);
    }

    #[test]
    fn command_log_is_cleared_on_begin() {
        let driver = NullDriver::new(NullAdapter::default());
        let pool = driver.create_command_pool(0).unwrap();
        let buffer = driver
            .allocate_command_buffer(pool, CommandBufferLevel::Primary)
            .unwrap();

        unsafe {
            driver.begin_command_buffer(buffer).unwrap();
            driver.record(buffer, &Command::EndDebugMarker);
            driver.end_command_buffer(buffer).unwrap();
        }
        assert_eq!(driver.commands(buffer).len(), 1);

        unsafe {
            driver.begin_command_buffer(buffer).unwrap();
        }
        assert!(driver.commands(buffer).is_empty());
    }

    #[test]
    fn submit_executes_buffer_copies() {
        let driver = NullDriver::new(NullAdapter::discrete());
        let memory = driver
            .allocate_memory(NonZeroU64::new(1024).unwrap(), 1)
            .unwrap();
        let size = NonZeroU64::new(256).unwrap();
        let src = driver
            .create_buffer(size, BufferUsage::TRANSFER_SRC)
            .unwrap();
        let dst = driver
            .create_buffer(size, BufferUsage::TRANSFER_DST)
            .unwrap();

        let ptr = driver.map_memory(memory).unwrap();
        unsafe {
            driver.bind_buffer_memory(src, memory, 0).unwrap();
            driver.bind_buffer_memory(dst, memory, 512).unwrap();
            for i in 0..256 {
                ptr.as_ptr().add(i).write(i as u8);
            }
        }

        let pool = driver.create_command_pool(0).unwrap();
        let primary = driver
            .allocate_command_buffer(pool, CommandBufferLevel::Primary)
            .unwrap();
        let secondary = driver
            .allocate_command_buffer(pool, CommandBufferLevel::Secondary)
            .unwrap();

        unsafe {
            driver.begin_command_buffer(secondary).unwrap();
            driver.record(
                secondary,
                &Command::CopyBuffer {
                    src,
                    src_offset: 128,
                    dst,
                    dst_offset: 128,
                    size: 128,
                },
            );
            driver.end_command_buffer(secondary).unwrap();

            driver.begin_command_buffer(primary).unwrap();
            driver.record(
                primary,
                &Command::CopyBuffer {
                    src,
                    src_offset: 0,
                    dst,
                    dst_offset: 0,
                    size: 128,
                },
            );
            driver.record(
                primary,
                &Command::ExecuteSecondary {
                    buffers: vec![secondary],
                },
            );
            driver.end_command_buffer(primary).unwrap();
        }

        // Nothing is copied while recording.
        let copied = unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(512), 256) };
        assert!(copied.iter().all(|b| *b == 0));

        let queue = driver.queue(0).unwrap();
        driver
            .submit(
                queue,
                &SubmitBatch {
                    command_buffers: &[primary],
                    waits: &[],
                    signal: 1,
                },
            )
            .unwrap();

        let copied = unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(512), 256) };
        for (i, byte) in copied.iter().enumerate() {
            assert_eq!(*byte, i as u8, "byte {}", i);
        }
    }

    #[test]
    #[should_panic(expected = "not recording")]
    fn record_without_begin() {
        let driver = NullDriver::new(NullAdapter::default());
        let pool = driver.create_command_pool(0).unwrap();
        let buffer = driver
            .allocate_command_buffer(pool, CommandBufferLevel::Primary)
            .unwrap();

        unsafe {
            driver.record(buffer, &Command::EndDebugMarker);
        }
    }

    #[test]
    fn lost_device() {
        let driver = NullDriver::new(NullAdapter::default());
        let queue = driver.queue(0).unwrap();
        driver.lose_device();

        assert!(driver.completed_value(queue).is_err());
        assert!(driver.queue(0).is_ok());
        assert!(driver.completed_value(RawQueue(u64::MAX)).is_err());
    }

    #[test]
    fn surface_failures_are_counted() {
        let driver = NullDriver::new(NullAdapter::default());
        let surface = driver.create_surface();
        let (swapchain, images) = driver
            .create_swapchain(surface, &SwapchainConfig::default(), None)
            .unwrap();
        assert_eq!(images.len(), 3);

        driver.invalidate_surface(surface, SurfaceError::OutOfDate, 2);
        assert_eq!(
            driver.acquire_next_image(swapchain),
            Err(SurfaceError::OutOfDate)
        );
        assert_eq!(
            driver.acquire_next_image(swapchain),
            Err(SurfaceError::OutOfDate)
        );

        let image = driver.acquire_next_image(swapchain).unwrap();
        assert_eq!(image.index, 0);
        assert_eq!(driver.acquire_next_image(swapchain).unwrap().index, 1);

        let queue = driver.queue(0).unwrap();
        driver.present(queue, swapchain, image.index).unwrap();
        assert_eq!(driver.presented(), 1);

        unsafe {
            driver.destroy_swapchain(swapchain);
        }
        assert_eq!(driver.texture_count(), 0);
    }

    #[test]
    fn buffer_requirements() {
        let driver = NullDriver::new(NullAdapter::integrated());
        let buffer = driver
            .create_buffer(NonZeroU64::new(100).unwrap(), BufferUsage::UNIFORM)
            .unwrap();

        let req = driver.buffer_memory_requirements(buffer);
        assert_eq!(req.size.get(), 100);
        assert_eq!(req.memory_types.len(), 3);
        assert_eq!(driver.buffer_count(), 1);
    }
}
