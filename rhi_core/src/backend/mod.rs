//! The driver interface every backend implements.
//!
//! Everything above this module (pools, caches, barrier tracking, staging) only talks to a
//! backend through the object-safe [`Driver`] trait and the opaque `Raw*` handles defined here.

pub mod allocator;
pub mod null;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use std::fmt::Debug;
use std::num::NonZeroU64;
use std::ops::Range;
use std::ptr::NonNull;

use bitflags::bitflags;
use glam::UVec3;
use thiserror::Error;

use crate::descriptor::{BindingKind, HeapKind};
use crate::pipeline::{
    ColorTargetState, DepthStencilState, Face, FrontFace, PrimitiveTopology, VertexBufferLayout,
};
use crate::resource::{BufferUsage, TextureDescriptor};
use crate::sampler::SamplerDescriptor;
use crate::shader::ShaderStage;
use crate::state::ResourceState;
use crate::swapchain::SwapchainConfig;

macro_rules! raw_handle {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

raw_handle! {
    /// A backend memory block.
    RawMemory,
    RawBuffer,
    RawTexture,
    RawSampler,
    RawShaderModule,
    RawDescriptorHeap,
    RawPipeline,
    RawRenderPass,
    RawFramebuffer,
    RawCommandPool,
    RawCommandBuffer,
    RawQueue,
    RawSurface,
    RawSwapchain,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor_id: u32,
    pub kind: AdapterKind,
}

impl AdapterInfo {
    pub fn vendor(&self) -> Vendor {
        Vendor::from_id(self.vendor_id)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

/// PCI vendor of an adapter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Vendor {
    Amd,
    Nvidia,
    Intel,
    Arm,
    Qualcomm,
    ImgTec,
    Microsoft,
    Unknown(u32),
}

impl Vendor {
    pub const fn from_id(id: u32) -> Self {
        match id {
            0x1002 => Self::Amd,
            0x10DE => Self::Nvidia,
            0x8086 => Self::Intel,
            0x13B5 => Self::Arm,
            0x5143 => Self::Qualcomm,
            0x1010 => Self::ImgTec,
            0x1414 => Self::Microsoft,
            id => Self::Unknown(id),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Amd => "AMD",
            Self::Nvidia => "NVIDIA",
            Self::Intel => "Intel",
            Self::Arm => "ARM",
            Self::Qualcomm => "Qualcomm",
            Self::ImgTec => "ImgTec",
            Self::Microsoft => "Microsoft",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// Returns `true` if the vendor usually ships dedicated GPUs.
    pub const fn is_dedicated_vendor(&self) -> bool {
        matches!(self, Self::Amd | Self::Nvidia)
    }
}

#[derive(Clone, Debug)]
pub struct AdapterMemoryProperties {
    pub heaps: Vec<MemoryHeap>,
    pub types: Vec<MemoryType>,
    /// The largest single allocation the driver accepts.
    pub max_allocation_size: NonZeroU64,
}

#[derive(Copy, Clone, Debug)]
pub struct MemoryHeap {
    pub id: u32,
    pub size: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct MemoryType {
    pub id: u32,
    pub heap: u32,
    pub flags: MemoryTypeFlags,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryTypeFlags: u32 {
        /// Memory that is local the GPU.
        const DEVICE_LOCAL = 1 << 0;
        /// Memory that can be accessed by the CPU after mapping.
        const HOST_VISIBLE = 1 << 1;
        /// If not set the CPU needs to flush the host cache.
        const HOST_COHERENT = 1 << 2;
        /// Memory that is cached on the host. Reads from the CPU are fast.
        const HOST_CACHED = 1 << 3;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct QueueCapabilities: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFamily {
    pub id: u32,
    pub count: u32,
    pub capabilities: QueueCapabilities,
}

/// Limits a device places on resources created from it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_texture_dimension_2d: u32,
    pub max_texture_dimension_3d: u32,
    pub max_array_layers: u32,
    pub max_mip_levels: u32,
    pub max_color_attachments: u32,
    pub max_vertex_attributes: u32,
    pub max_bindings_per_table: u32,
    pub max_push_constant_size: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_buffer_size: 1 << 31,
            max_texture_dimension_2d: 16384,
            max_texture_dimension_3d: 2048,
            max_array_layers: 2048,
            max_mip_levels: 15,
            max_color_attachments: 8,
            max_vertex_attributes: 16,
            max_bindings_per_table: 1024,
            max_push_constant_size: 128,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: NonZeroU64,
    pub align: NonZeroU64,
    /// Indices of all memory types usable for the resource.
    pub memory_types: Vec<u32>,
}

/// Texel format of a texture.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    pub const fn is_srgb(&self) -> bool {
        matches!(self, Self::Bgra8UnormSrgb | Self::Rgba8UnormSrgb)
    }

    pub const fn is_depth(&self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24PlusStencil8)
    }

    pub const fn bytes_per_texel(&self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm => 2,
            Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::R32Float
            | Self::Depth32Float
            | Self::Depth24PlusStencil8 => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    /// Returns the number of bytes needed to represent an index.
    pub const fn size(&self) -> u8 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    Discard,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// Attachment formats and operations that define a render pass.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassLayout {
    pub colors: Vec<AttachmentLayout>,
    pub depth_stencil: Option<AttachmentLayout>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentLayout {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Clone, Debug)]
pub struct RawFramebufferDescriptor<'a> {
    pub render_pass: RawRenderPass,
    pub attachments: &'a [RawTexture],
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

/// A fully resolved graphics pipeline description in terms of raw handles.
#[derive(Clone, Debug)]
pub struct RawGraphicsPipelineDescriptor<'a> {
    pub vertex: (RawShaderModule, &'a str),
    pub fragment: Option<(RawShaderModule, &'a str)>,
    pub vertex_buffers: &'a [VertexBufferLayout],
    pub topology: PrimitiveTopology,
    pub cull_mode: Option<Face>,
    pub front_face: FrontFace,
    pub color_targets: &'a [ColorTargetState],
    pub depth_stencil: Option<DepthStencilState>,
    pub sample_count: u32,
    pub render_pass: RawRenderPass,
    pub layout: &'a RawPipelineLayout,
}

#[derive(Clone, Debug)]
pub struct RawComputePipelineDescriptor<'a> {
    pub shader: (RawShaderModule, &'a str),
    pub layout: &'a RawPipelineLayout,
}

/// Shape of the binding tables and push constants a pipeline consumes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawPipelineLayout {
    pub resource_table: Vec<BindingKind>,
    pub sampler_table: u32,
    pub push_constant_size: u32,
}

/// A resource written into a descriptor heap slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RawBindingResource {
    UniformBuffer {
        buffer: RawBuffer,
        offset: u64,
        size: u64,
    },
    StorageBuffer {
        buffer: RawBuffer,
        offset: u64,
        size: u64,
    },
    SampledTexture(RawTexture),
    StorageTexture(RawTexture),
    Sampler(RawSampler),
}

impl RawBindingResource {
    pub const fn kind(&self) -> BindingKind {
        match self {
            Self::UniformBuffer { .. } => BindingKind::UniformBuffer,
            Self::StorageBuffer { .. } => BindingKind::StorageBuffer,
            Self::SampledTexture(_) => BindingKind::SampledTexture,
            Self::StorageTexture(_) => BindingKind::StorageTexture,
            Self::Sampler(_) => BindingKind::Sampler,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: RawBuffer,
    pub src: ResourceState,
    pub dst: ResourceState,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TextureBarrier {
    pub texture: RawTexture,
    pub format: TextureFormat,
    pub src: ResourceState,
    pub dst: ResourceState,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageDataLayout {
    pub bytes_per_row: u32,
    pub rows_per_image: u32,
}

/// A single command recorded into a command buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    PipelineBarrier {
        buffers: Vec<BufferBarrier>,
        textures: Vec<TextureBarrier>,
    },
    CopyBuffer {
        src: RawBuffer,
        src_offset: u64,
        dst: RawBuffer,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: RawBuffer,
        src_offset: u64,
        layout: ImageDataLayout,
        dst: RawTexture,
        format: TextureFormat,
        mip_level: u32,
        array_layer: u32,
        extent: UVec3,
    },
    ClearTexture {
        texture: RawTexture,
        format: TextureFormat,
        value: ClearValue,
    },
    BeginRenderPass {
        render_pass: RawRenderPass,
        framebuffer: RawFramebuffer,
        width: u32,
        height: u32,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    BindPipeline {
        pipeline: RawPipeline,
        bind_point: PipelineBindPoint,
    },
    BindDescriptorTable {
        pipeline: RawPipeline,
        bind_point: PipelineBindPoint,
        kind: HeapKind,
        heap: RawDescriptorHeap,
        offset: u32,
    },
    BindVertexBuffer {
        slot: u32,
        buffer: RawBuffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: RawBuffer,
        offset: u64,
        format: IndexFormat,
    },
    PushConstants {
        pipeline: RawPipeline,
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    ExecuteSecondary {
        buffers: Vec<RawCommandBuffer>,
    },
    BeginDebugMarker {
        name: String,
    },
    EndDebugMarker,
}

/// A batch of command buffers submitted to a queue at once.
#[derive(Clone, Debug)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [RawCommandBuffer],
    /// Timeline values of other queues that must be reached before the batch starts.
    pub waits: &'a [(RawQueue, u64)],
    /// The timeline value the queue signals once the batch has completed.
    pub signal: u64,
}

/// An object that can carry a debug name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RawObject {
    Buffer(RawBuffer),
    Texture(RawTexture),
    Sampler(RawSampler),
    Pipeline(RawPipeline),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of descriptor pool memory")]
    OutOfPoolMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("memory map failed")]
    MemoryMapFailed,
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("unexpected backend result: {0}")]
    Unexpected(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
pub enum SurfaceError {
    /// The surface changed and the swapchain no longer matches it.
    #[error("swapchain out of date")]
    OutOfDate,
    /// The surface is no longer usable.
    #[error("surface lost")]
    Lost,
    /// The device was lost while presenting.
    #[error("device lost")]
    DeviceLost,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The swapchain still works but no longer matches the surface exactly.
    pub suboptimal: bool,
}

/// The interface table of a graphics backend.
///
/// All functions taking `&self` may be called from any thread. Functions operating on a
/// command buffer or command pool require external synchronization of that object, which the
/// pools guarantee through exclusive ownership.
pub trait Driver: Send + Sync + Debug {
    fn adapter_info(&self) -> AdapterInfo;

    fn memory_properties(&self) -> AdapterMemoryProperties;

    fn queue_families(&self) -> Vec<QueueFamily>;

    fn limits(&self) -> DeviceLimits;

    /// Returns the queue of the given family. Every family exposes exactly one queue.
    fn queue(&self, family: u32) -> Result<RawQueue, BackendError>;

    fn allocate_memory(&self, size: NonZeroU64, memory_type: u32)
        -> Result<RawMemory, BackendError>;

    /// # Safety
    ///
    /// No resource bound to `memory` may be in use by the GPU.
    unsafe fn free_memory(&self, memory: RawMemory);

    /// Maps the whole memory block and returns a pointer to its start.
    ///
    /// The mapping stays valid until [`free_memory`] is called.
    ///
    /// [`free_memory`]: Self::free_memory
    fn map_memory(&self, memory: RawMemory) -> Result<NonNull<u8>, BackendError>;

    /// Makes host writes in `range` visible to the device.
    fn flush_memory(&self, memory: RawMemory, range: Range<u64>) -> Result<(), BackendError>;

    /// Makes device writes in `range` visible to the host.
    fn invalidate_memory(&self, memory: RawMemory, range: Range<u64>)
        -> Result<(), BackendError>;

    fn create_buffer(&self, size: NonZeroU64, usage: BufferUsage)
        -> Result<RawBuffer, BackendError>;

    fn buffer_memory_requirements(&self, buffer: RawBuffer) -> MemoryRequirements;

    /// # Safety
    ///
    /// `offset` must satisfy the alignment of the buffer and the buffer must not be bound yet.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: RawBuffer,
        memory: RawMemory,
        offset: u64,
    ) -> Result<(), BackendError>;

    /// # Safety
    ///
    /// The buffer must not be in use by the GPU.
    unsafe fn destroy_buffer(&self, buffer: RawBuffer);

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<RawTexture, BackendError>;

    fn texture_memory_requirements(&self, texture: RawTexture) -> MemoryRequirements;

    /// # Safety
    ///
    /// `offset` must satisfy the alignment of the texture and the texture must not be bound yet.
    unsafe fn bind_texture_memory(
        &self,
        texture: RawTexture,
        memory: RawMemory,
        offset: u64,
    ) -> Result<(), BackendError>;

    /// # Safety
    ///
    /// The texture must not be in use by the GPU.
    unsafe fn destroy_texture(&self, texture: RawTexture);

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<RawSampler, BackendError>;

    /// # Safety
    ///
    /// The sampler must not be in use by the GPU.
    unsafe fn destroy_sampler(&self, sampler: RawSampler);

    fn create_shader_module(
        &self,
        stage: ShaderStage,
        code: &[u8],
    ) -> Result<RawShaderModule, BackendError>;

    /// # Safety
    ///
    /// No pipeline may be in the process of being created from the module.
    unsafe fn destroy_shader_module(&self, module: RawShaderModule);

    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<RawDescriptorHeap, BackendError>;

    /// # Safety
    ///
    /// No command referencing the heap may be in use by the GPU.
    unsafe fn destroy_descriptor_heap(&self, heap: RawDescriptorHeap);

    /// # Safety
    ///
    /// `slot` must be less than the capacity of the heap and the slot must not be in use by
    /// the GPU.
    unsafe fn write_descriptor(
        &self,
        heap: RawDescriptorHeap,
        slot: u32,
        resource: RawBindingResource,
    );

    fn create_render_pass(&self, layout: &RenderPassLayout)
        -> Result<RawRenderPass, BackendError>;

    /// # Safety
    ///
    /// No pipeline or framebuffer created with the render pass may still exist.
    unsafe fn destroy_render_pass(&self, render_pass: RawRenderPass);

    fn create_framebuffer(
        &self,
        descriptor: &RawFramebufferDescriptor<'_>,
    ) -> Result<RawFramebuffer, BackendError>;

    /// # Safety
    ///
    /// The framebuffer must not be in use by the GPU.
    unsafe fn destroy_framebuffer(&self, framebuffer: RawFramebuffer);

    fn create_graphics_pipeline(
        &self,
        descriptor: &RawGraphicsPipelineDescriptor<'_>,
    ) -> Result<RawPipeline, BackendError>;

    fn create_compute_pipeline(
        &self,
        descriptor: &RawComputePipelineDescriptor<'_>,
    ) -> Result<RawPipeline, BackendError>;

    /// # Safety
    ///
    /// The pipeline must not be in use by the GPU.
    unsafe fn destroy_pipeline(&self, pipeline: RawPipeline);

    fn create_command_pool(&self, family: u32) -> Result<RawCommandPool, BackendError>;

    /// # Safety
    ///
    /// No command buffer allocated from the pool may be pending execution.
    unsafe fn destroy_command_pool(&self, pool: RawCommandPool);

    fn allocate_command_buffer(
        &self,
        pool: RawCommandPool,
        level: CommandBufferLevel,
    ) -> Result<RawCommandBuffer, BackendError>;

    /// Resets the command buffer back to its initial state.
    ///
    /// # Safety
    ///
    /// The buffer must not be pending execution.
    unsafe fn reset_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError>;

    /// # Safety
    ///
    /// The buffer must be in the initial state.
    unsafe fn begin_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError>;

    /// # Safety
    ///
    /// The buffer must be recording.
    unsafe fn end_command_buffer(&self, buffer: RawCommandBuffer) -> Result<(), BackendError>;

    /// Records a single command.
    ///
    /// # Safety
    ///
    /// The buffer must be recording and every handle in `command` must be alive.
    unsafe fn record(&self, buffer: RawCommandBuffer, command: &Command);

    fn submit(&self, queue: RawQueue, batch: &SubmitBatch<'_>) -> Result<(), BackendError>;

    /// Returns the last timeline value the queue has completed.
    fn completed_value(&self, queue: RawQueue) -> Result<u64, BackendError>;

    /// Blocks until the queue has completed `value`.
    fn wait(&self, queue: RawQueue, value: u64) -> Result<(), BackendError>;

    fn wait_idle(&self, queue: RawQueue) -> Result<(), BackendError>;

    fn create_swapchain(
        &self,
        surface: RawSurface,
        config: &SwapchainConfig,
        old: Option<RawSwapchain>,
    ) -> Result<(RawSwapchain, Vec<RawTexture>), SurfaceError>;

    /// Destroys the swapchain and its images.
    ///
    /// # Safety
    ///
    /// No image of the swapchain may be in use by the GPU.
    unsafe fn destroy_swapchain(&self, swapchain: RawSwapchain);

    fn acquire_next_image(&self, swapchain: RawSwapchain) -> Result<AcquiredImage, SurfaceError>;

    fn present(
        &self,
        queue: RawQueue,
        swapchain: RawSwapchain,
        index: u32,
    ) -> Result<(), SurfaceError>;

    fn set_debug_name(&self, object: RawObject, name: &str);
}
