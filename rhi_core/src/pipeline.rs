//! Pipeline state objects.

use std::sync::Arc;

use crate::backend::{
    AttachmentLayout, LoadOp, PipelineBindPoint, RawObject, RawPipeline, RenderPassLayout,
    StoreOp, TextureFormat,
};
use crate::deletion::DeletionEvent;
use crate::descriptor::BindingLayout;
use crate::device::DeviceShared;
use crate::shader::{Shader, ShaderKey};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    Ccw,
    Cw,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Face {
    Front,
    Back,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOp,
}

impl BlendComponent {
    pub const REPLACE: Self = Self {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::Zero,
        operation: BlendOp::Add,
    };

    pub const OVER: Self = Self {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::OneMinusSrcAlpha,
        operation: BlendOp::Add,
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub const REPLACE: Self = Self {
        color: BlendComponent::REPLACE,
        alpha: BlendComponent::REPLACE,
    };

    pub const ALPHA_BLENDING: Self = Self {
        color: BlendComponent {
            src_factor: BlendFactor::SrcAlpha,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            operation: BlendOp::Add,
        },
        alpha: BlendComponent::OVER,
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareOp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Unorm8x4,
}

impl VertexFormat {
    pub const fn size(&self) -> u32 {
        match self {
            Self::Float32 | Self::Uint32 | Self::Unorm8x4 => 4,
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 => 16,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum VertexStepMode {
    #[default]
    Vertex,
    Instance,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub stride: u32,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Copy, Clone, Debug)]
pub struct GraphicsPipelineDescriptor<'a> {
    pub vertex: &'a Shader,
    pub fragment: Option<&'a Shader>,
    pub vertex_buffers: &'a [VertexBufferLayout],
    pub topology: PrimitiveTopology,
    pub cull_mode: Option<Face>,
    pub front_face: FrontFace,
    pub color_targets: &'a [ColorTargetState],
    pub depth_stencil: Option<DepthStencilState>,
    pub sample_count: u32,
}

impl<'a> GraphicsPipelineDescriptor<'a> {
    pub(crate) fn shaders(&self) -> Vec<&'a Shader> {
        std::iter::once(self.vertex).chain(self.fragment).collect()
    }

    pub(crate) fn key(&self) -> PipelineKey {
        PipelineKey::Graphics(GraphicsPipelineKey {
            shaders: self.shaders().iter().map(|shader| shader.key()).collect(),
            vertex_buffers: self.vertex_buffers.to_vec(),
            topology: self.topology,
            cull_mode: self.cull_mode,
            front_face: self.front_face,
            color_targets: self.color_targets.to_vec(),
            depth_stencil: self.depth_stencil,
            sample_count: self.sample_count,
        })
    }

    /// Returns the render pass layout the pipeline is compatible with.
    ///
    /// Compatibility only depends on the attachment formats, so the load and store operations
    /// are fixed.
    pub(crate) fn render_pass_layout(&self) -> RenderPassLayout {
        let attachment = |format| AttachmentLayout {
            format,
            load_op: LoadOp::Load,
            store_op: StoreOp::Store,
        };

        RenderPassLayout {
            colors: self
                .color_targets
                .iter()
                .map(|target| attachment(target.format))
                .collect(),
            depth_stencil: self.depth_stencil.map(|state| attachment(state.format)),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ComputePipelineDescriptor<'a> {
    pub shader: &'a Shader,
}

impl<'a> ComputePipelineDescriptor<'a> {
    pub(crate) fn key(&self) -> PipelineKey {
        PipelineKey::Compute(self.shader.key())
    }
}

/// Everything that defines a pipeline, compared by content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum PipelineKey {
    Graphics(GraphicsPipelineKey),
    Compute(ShaderKey),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct GraphicsPipelineKey {
    shaders: Vec<ShaderKey>,
    vertex_buffers: Vec<VertexBufferLayout>,
    topology: PrimitiveTopology,
    cull_mode: Option<Face>,
    front_face: FrontFace,
    color_targets: Vec<ColorTargetState>,
    depth_stencil: Option<DepthStencilState>,
    sample_count: u32,
}

/// A compiled pipeline together with its binding layout.
#[derive(Clone, Debug)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

#[derive(Debug)]
struct PipelineInner {
    raw: RawPipeline,
    bind_point: PipelineBindPoint,
    layout: Arc<BindingLayout>,
    /// Attachment formats of graphics pipelines.
    attachments: Option<AttachmentFormats>,
    shared: Arc<DeviceShared>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct AttachmentFormats {
    pub(crate) colors: Vec<TextureFormat>,
    pub(crate) depth_stencil: Option<TextureFormat>,
}

impl AttachmentFormats {
    pub(crate) fn from_layout(layout: &RenderPassLayout) -> Self {
        Self {
            colors: layout.colors.iter().map(|color| color.format).collect(),
            depth_stencil: layout.depth_stencil.map(|depth| depth.format),
        }
    }
}

impl Pipeline {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        raw: RawPipeline,
        bind_point: PipelineBindPoint,
        layout: Arc<BindingLayout>,
        attachments: Option<AttachmentFormats>,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                raw,
                bind_point,
                layout,
                attachments,
                shared,
            }),
        }
    }

    pub fn raw(&self) -> RawPipeline {
        self.inner.raw
    }

    pub fn bind_point(&self) -> PipelineBindPoint {
        self.inner.bind_point
    }

    pub fn layout(&self) -> &Arc<BindingLayout> {
        &self.inner.layout
    }

    pub(crate) fn attachments(&self) -> Option<&AttachmentFormats> {
        self.inner.attachments.as_ref()
    }

    pub fn set_debug_name(&self, name: &str) {
        self.inner
            .shared
            .driver
            .set_debug_name(RawObject::Pipeline(self.inner.raw), name);
    }
}

impl PartialEq for Pipeline {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pipeline {}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        self.shared.defer(DeletionEvent::Pipeline(self.raw));
    }
}
