use ash::vk;

use crate::backend::{
    IndexFormat, LoadOp, MemoryTypeFlags, QueueCapabilities, StoreOp, TextureFormat,
};
use crate::descriptor::BindingKind;
use crate::pipeline::{
    BlendFactor, BlendOp, CompareOp, Face, FrontFace, PrimitiveTopology, VertexFormat,
    VertexStepMode,
};
use crate::resource::{BufferUsage, TextureDimension, TextureUsage};
use crate::sampler::{AddressMode, FilterMode};
use crate::state::ResourceState;
use crate::swapchain::PresentMode;

use super::BackendError;

impl From<vk::Result> for BackendError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::OutOfPoolMemory
            }
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            res => Self::Unexpected(format!("{:?}", res)),
        }
    }
}

/// Pipeline stages, access flags and image layout a resource is in while in a [`ResourceState`].
#[derive(Copy, Clone, Debug)]
pub(super) struct StateAccess {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

pub(super) fn state_access(state: ResourceState) -> StateAccess {
    const SHADERS: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
        vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
            | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
            | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
    );
    const DEPTH_TESTS: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
    );

    let (stages, access, layout) = match state {
        ResourceState::Undefined => (
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::ImageLayout::UNDEFINED,
        ),
        ResourceState::VertexInput => (
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            vk::ImageLayout::UNDEFINED,
        ),
        ResourceState::IndexInput => (
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::INDEX_READ,
            vk::ImageLayout::UNDEFINED,
        ),
        ResourceState::UniformRead => (
            SHADERS,
            vk::AccessFlags::UNIFORM_READ,
            vk::ImageLayout::UNDEFINED,
        ),
        ResourceState::ShaderRead => (
            SHADERS,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        ResourceState::UnorderedAccess => (
            SHADERS,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::ImageLayout::GENERAL,
        ),
        ResourceState::RenderTarget => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::DepthWrite => (
            DEPTH_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::DepthRead => (
            DEPTH_TESTS | vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        ResourceState::CopySrc => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ),
        ResourceState::CopyDst => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ),
        ResourceState::Present => (
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::ImageLayout::PRESENT_SRC_KHR,
        ),
    };

    StateAccess {
        stages,
        access,
        layout,
    }
}

/// Removes stages and accesses a queue of a family with `caps` cannot execute.
///
/// Returns `None` if nothing remains.
pub(super) fn restrict_to_queue(
    stages: vk::PipelineStageFlags,
    access: vk::AccessFlags,
    caps: QueueCapabilities,
) -> Option<(vk::PipelineStageFlags, vk::AccessFlags)> {
    if caps.contains(QueueCapabilities::GRAPHICS) {
        return Some((stages, access));
    }

    let (allowed_stages, allowed_access) = if caps.contains(QueueCapabilities::COMPUTE) {
        (
            vk::PipelineStageFlags::TOP_OF_PIPE
                | vk::PipelineStageFlags::BOTTOM_OF_PIPE
                | vk::PipelineStageFlags::DRAW_INDIRECT
                | vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::INDIRECT_COMMAND_READ
                | vk::AccessFlags::UNIFORM_READ
                | vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::TRANSFER_READ
                | vk::AccessFlags::TRANSFER_WRITE,
        )
    } else {
        (
            vk::PipelineStageFlags::TOP_OF_PIPE
                | vk::PipelineStageFlags::BOTTOM_OF_PIPE
                | vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
        )
    };

    let stages = stages & allowed_stages;
    if stages.is_empty() {
        None
    } else {
        Some((stages, access & allowed_access))
    }
}

pub(super) fn memory_type_flags(flags: vk::MemoryPropertyFlags) -> MemoryTypeFlags {
    let mut out = MemoryTypeFlags::empty();
    for (vk_flag, flag) in [
        (
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryTypeFlags::DEVICE_LOCAL,
        ),
        (
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            MemoryTypeFlags::HOST_VISIBLE,
        ),
        (
            vk::MemoryPropertyFlags::HOST_COHERENT,
            MemoryTypeFlags::HOST_COHERENT,
        ),
        (
            vk::MemoryPropertyFlags::HOST_CACHED,
            MemoryTypeFlags::HOST_CACHED,
        ),
    ] {
        if flags.contains(vk_flag) {
            out |= flag;
        }
    }

    out
}

pub(super) fn queue_capabilities(flags: vk::QueueFlags) -> QueueCapabilities {
    let mut capabilities = QueueCapabilities::empty();

    if flags.contains(vk::QueueFlags::GRAPHICS) {
        capabilities |= QueueCapabilities::GRAPHICS;
    }

    if flags.contains(vk::QueueFlags::COMPUTE) {
        capabilities |= QueueCapabilities::COMPUTE;
    }

    // Graphics and compute queues implicitly support transfer operations.
    if flags.intersects(vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    {
        capabilities |= QueueCapabilities::TRANSFER;
    }

    capabilities
}

pub(super) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (usage_flag, vk_flag) in [
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
    ] {
        if usage.contains(usage_flag) {
            flags |= vk_flag;
        }
    }

    flags
}

pub(super) fn texture_usage(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::TRANSFER_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::TRANSFER_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::TEXTURE_BINDING) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth() {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }

    flags
}

pub(super) fn image_type(dimension: TextureDimension) -> vk::ImageType {
    match dimension {
        TextureDimension::D1 => vk::ImageType::TYPE_1D,
        TextureDimension::D2 => vk::ImageType::TYPE_2D,
        TextureDimension::D3 => vk::ImageType::TYPE_3D,
    }
}

pub(super) fn view_type(dimension: TextureDimension, array_layers: u32) -> vk::ImageViewType {
    match (dimension, array_layers) {
        (TextureDimension::D1, 1) => vk::ImageViewType::TYPE_1D,
        (TextureDimension::D1, _) => vk::ImageViewType::TYPE_1D_ARRAY,
        (TextureDimension::D2, 1) => vk::ImageViewType::TYPE_2D,
        (TextureDimension::D2, _) => vk::ImageViewType::TYPE_2D_ARRAY,
        (TextureDimension::D3, _) => vk::ImageViewType::TYPE_3D,
    }
}

pub(super) fn aspect(format: TextureFormat) -> vk::ImageAspectFlags {
    match format {
        TextureFormat::Depth32Float => vk::ImageAspectFlags::DEPTH,
        TextureFormat::Depth24PlusStencil8 => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Converts a format. `depth_stencil` is the format chosen for
/// [`TextureFormat::Depth24PlusStencil8`] on the adapter.
pub(super) fn format(format: TextureFormat, depth_stencil: vk::Format) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24PlusStencil8 => depth_stencil,
    }
}

pub(super) fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
    }
}

pub(super) fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub(super) fn store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::Discard => vk::AttachmentStoreOp::DONT_CARE,
    }
}

impl From<IndexFormat> for vk::IndexType {
    fn from(value: IndexFormat) -> Self {
        match value {
            IndexFormat::U16 => Self::UINT16,
            IndexFormat::U32 => Self::UINT32,
        }
    }
}

impl From<PrimitiveTopology> for vk::PrimitiveTopology {
    fn from(value: PrimitiveTopology) -> Self {
        match value {
            PrimitiveTopology::PointList => Self::POINT_LIST,
            PrimitiveTopology::LineList => Self::LINE_LIST,
            PrimitiveTopology::LineStrip => Self::LINE_STRIP,
            PrimitiveTopology::TriangleList => Self::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => Self::TRIANGLE_STRIP,
        }
    }
}

impl From<FrontFace> for vk::FrontFace {
    fn from(value: FrontFace) -> Self {
        match value {
            FrontFace::Cw => Self::CLOCKWISE,
            FrontFace::Ccw => Self::COUNTER_CLOCKWISE,
        }
    }
}

pub(super) fn cull_mode(face: Option<Face>) -> vk::CullModeFlags {
    match face {
        Some(Face::Front) => vk::CullModeFlags::FRONT,
        Some(Face::Back) => vk::CullModeFlags::BACK,
        None => vk::CullModeFlags::NONE,
    }
}

impl From<CompareOp> for vk::CompareOp {
    fn from(value: CompareOp) -> Self {
        match value {
            CompareOp::Never => Self::NEVER,
            CompareOp::Less => Self::LESS,
            CompareOp::Equal => Self::EQUAL,
            CompareOp::LessEqual => Self::LESS_OR_EQUAL,
            CompareOp::Greater => Self::GREATER,
            CompareOp::NotEqual => Self::NOT_EQUAL,
            CompareOp::GreaterEqual => Self::GREATER_OR_EQUAL,
            CompareOp::Always => Self::ALWAYS,
        }
    }
}

impl From<BlendFactor> for vk::BlendFactor {
    fn from(value: BlendFactor) -> Self {
        match value {
            BlendFactor::Zero => Self::ZERO,
            BlendFactor::One => Self::ONE,
            BlendFactor::Src => Self::SRC_COLOR,
            BlendFactor::OneMinusSrc => Self::ONE_MINUS_SRC_COLOR,
            BlendFactor::SrcAlpha => Self::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => Self::ONE_MINUS_SRC_ALPHA,
            BlendFactor::Dst => Self::DST_COLOR,
            BlendFactor::OneMinusDst => Self::ONE_MINUS_DST_COLOR,
            BlendFactor::DstAlpha => Self::DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => Self::ONE_MINUS_DST_ALPHA,
        }
    }
}

impl From<BlendOp> for vk::BlendOp {
    fn from(value: BlendOp) -> Self {
        match value {
            BlendOp::Add => Self::ADD,
            BlendOp::Subtract => Self::SUBTRACT,
            BlendOp::ReverseSubtract => Self::REVERSE_SUBTRACT,
            BlendOp::Min => Self::MIN,
            BlendOp::Max => Self::MAX,
        }
    }
}

impl From<VertexFormat> for vk::Format {
    fn from(value: VertexFormat) -> Self {
        match value {
            VertexFormat::Float32 => Self::R32_SFLOAT,
            VertexFormat::Float32x2 => Self::R32G32_SFLOAT,
            VertexFormat::Float32x3 => Self::R32G32B32_SFLOAT,
            VertexFormat::Float32x4 => Self::R32G32B32A32_SFLOAT,
            VertexFormat::Uint32 => Self::R32_UINT,
            VertexFormat::Unorm8x4 => Self::R8G8B8A8_UNORM,
        }
    }
}

impl From<VertexStepMode> for vk::VertexInputRate {
    fn from(value: VertexStepMode) -> Self {
        match value {
            VertexStepMode::Vertex => Self::VERTEX,
            VertexStepMode::Instance => Self::INSTANCE,
        }
    }
}

impl From<FilterMode> for vk::Filter {
    fn from(value: FilterMode) -> Self {
        match value {
            FilterMode::Nearest => Self::NEAREST,
            FilterMode::Linear => Self::LINEAR,
        }
    }
}

impl From<FilterMode> for vk::SamplerMipmapMode {
    fn from(value: FilterMode) -> Self {
        match value {
            FilterMode::Nearest => Self::NEAREST,
            FilterMode::Linear => Self::LINEAR,
        }
    }
}

impl From<AddressMode> for vk::SamplerAddressMode {
    fn from(value: AddressMode) -> Self {
        match value {
            AddressMode::ClampToEdge => Self::CLAMP_TO_EDGE,
            AddressMode::Repeat => Self::REPEAT,
            AddressMode::MirrorRepeat => Self::MIRRORED_REPEAT,
        }
    }
}

impl From<PresentMode> for vk::PresentModeKHR {
    fn from(value: PresentMode) -> Self {
        match value {
            PresentMode::Fifo => Self::FIFO,
            PresentMode::Mailbox => Self::MAILBOX,
            PresentMode::Immediate => Self::IMMEDIATE,
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use crate::backend::QueueCapabilities;
    use crate::state::ResourceState;

    use super::{restrict_to_queue, state_access};

    #[test]
    fn copy_states_use_transfer_layouts() {
        assert_eq!(
            state_access(ResourceState::CopyDst).layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            state_access(ResourceState::CopySrc).layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
    }

    #[test]
    fn transfer_queue_drops_shader_stages() {
        let access = state_access(ResourceState::UniformRead);
        assert!(restrict_to_queue(access.stages, access.access, QueueCapabilities::TRANSFER)
            .is_none());

        let access = state_access(ResourceState::CopyDst);
        let (stages, flags) =
            restrict_to_queue(access.stages, access.access, QueueCapabilities::TRANSFER).unwrap();
        assert_eq!(stages, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(flags, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn compute_queue_keeps_compute_stage() {
        let access = state_access(ResourceState::ShaderRead);
        let (stages, _) = restrict_to_queue(
            access.stages,
            access.access,
            QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
        )
        .unwrap();
        assert_eq!(stages, vk::PipelineStageFlags::COMPUTE_SHADER);
    }
}
