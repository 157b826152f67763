use std::sync::{Arc, Weak};

use crate::backend::{
    AttachmentLayout, LoadOp, RawFramebuffer, RawRenderPass, RenderPassLayout, StoreOp,
};
use crate::deletion::DeletionEvent;
use crate::device::DeviceShared;
use crate::resource::{ResourceId, Texture, TextureInner};

#[derive(Copy, Clone, Debug)]
pub struct ColorAttachment<'a> {
    pub texture: &'a Texture,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Copy, Clone, Debug)]
pub struct DepthStencilAttachment<'a> {
    pub texture: &'a Texture,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Copy, Clone, Debug)]
pub struct FramebufferDescriptor<'a> {
    pub colors: &'a [ColorAttachment<'a>],
    pub depth_stencil: Option<DepthStencilAttachment<'a>>,
    pub layers: u32,
}

impl<'a> FramebufferDescriptor<'a> {
    pub(crate) fn layout(&self) -> RenderPassLayout {
        RenderPassLayout {
            colors: self
                .colors
                .iter()
                .map(|color| AttachmentLayout {
                    format: color.texture.format(),
                    load_op: color.load_op,
                    store_op: color.store_op,
                })
                .collect(),
            depth_stencil: self.depth_stencil.map(|depth| AttachmentLayout {
                format: depth.texture.format(),
                load_op: depth.load_op,
                store_op: depth.store_op,
            }),
        }
    }

    /// Returns all attachment textures, colors first.
    pub(crate) fn textures(&self) -> Vec<&'a Texture> {
        self.colors
            .iter()
            .map(|color| color.texture)
            .chain(self.depth_stencil.map(|depth| depth.texture))
            .collect()
    }

    pub(crate) fn key(&self) -> FramebufferKey {
        let (width, height) = self.extent();

        FramebufferKey {
            width,
            height,
            layers: self.layers,
            attachments: self.textures().iter().map(|texture| texture.id()).collect(),
            layout: self.layout(),
        }
    }

    /// Returns the extent shared by all attachments.
    ///
    /// # Panics
    ///
    /// Panics if the framebuffer has no attachments or the attachments differ in size.
    pub(crate) fn extent(&self) -> (u32, u32) {
        let textures = self.textures();
        let Some(first) = textures.first() else {
            panic!("framebuffer has no attachments");
        };

        let size = first.size();
        for texture in &textures[1..] {
            assert_eq!(
                texture.size().truncate(),
                size.truncate(),
                "framebuffer attachments differ in size"
            );
        }

        (size.x, size.y)
    }
}

/// Identity of a framebuffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FramebufferKey {
    width: u32,
    height: u32,
    layers: u32,
    attachments: Vec<ResourceId>,
    layout: RenderPassLayout,
}

/// A render pass compatibility object.
#[derive(Clone, Debug)]
pub struct RenderPass {
    inner: Arc<RenderPassInner>,
}

#[derive(Debug)]
struct RenderPassInner {
    raw: RawRenderPass,
    layout: RenderPassLayout,
    shared: Arc<DeviceShared>,
}

impl RenderPass {
    pub(crate) fn new(shared: Arc<DeviceShared>, raw: RawRenderPass, layout: RenderPassLayout) -> Self {
        Self {
            inner: Arc::new(RenderPassInner {
                raw,
                layout,
                shared,
            }),
        }
    }

    pub fn raw(&self) -> RawRenderPass {
        self.inner.raw
    }

    pub fn layout(&self) -> &RenderPassLayout {
        &self.inner.layout
    }
}

impl PartialEq for RenderPass {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RenderPass {}

impl Drop for RenderPassInner {
    fn drop(&mut self) {
        self.shared.defer(DeletionEvent::RenderPass(self.raw));
    }
}

/// A set of attachments a render pass draws into.
///
/// The framebuffer does not keep its attachments alive.
#[derive(Clone, Debug)]
pub struct Framebuffer {
    inner: Arc<FramebufferInner>,
}

#[derive(Debug)]
struct FramebufferInner {
    raw: RawFramebuffer,
    render_pass: RenderPass,
    width: u32,
    height: u32,
    layers: u32,
    attachments: Vec<Weak<TextureInner>>,
    ids: Vec<ResourceId>,
    shared: Arc<DeviceShared>,
}

impl Framebuffer {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        raw: RawFramebuffer,
        render_pass: RenderPass,
        descriptor: &FramebufferDescriptor<'_>,
    ) -> Self {
        let (width, height) = descriptor.extent();
        let textures = descriptor.textures();

        Self {
            inner: Arc::new(FramebufferInner {
                raw,
                render_pass,
                width,
                height,
                layers: descriptor.layers,
                attachments: textures.iter().map(|texture| texture.downgrade()).collect(),
                ids: textures.iter().map(|texture| texture.id()).collect(),
                shared,
            }),
        }
    }

    pub fn raw(&self) -> RawFramebuffer {
        self.inner.raw
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.inner.render_pass
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn layers(&self) -> u32 {
        self.inner.layers
    }

    /// Returns `true` if all attachments are still alive.
    pub fn is_valid(&self) -> bool {
        self.inner
            .attachments
            .iter()
            .all(|texture| texture.strong_count() != 0)
    }

    /// Returns `true` if the texture is an attachment of this framebuffer.
    pub fn references(&self, id: ResourceId) -> bool {
        self.inner.ids.contains(&id)
    }

    /// Returns the attachment textures, colors first. Returns `None` if any attachment was
    /// dropped.
    pub fn attachments(&self) -> Option<Vec<Texture>> {
        self.inner
            .attachments
            .iter()
            .map(|texture| texture.upgrade().map(Texture::from_inner))
            .collect()
    }
}

impl PartialEq for Framebuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Framebuffer {}

impl Drop for FramebufferInner {
    fn drop(&mut self) {
        self.shared.defer(DeletionEvent::Framebuffer(self.raw));
    }
}
