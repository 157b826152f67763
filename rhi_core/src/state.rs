//! Access states a resource can be in.

use crate::backend::TextureFormat;
use crate::resource::{BufferUsage, TextureUsage};

/// The access mode a resource is currently prepared for.
///
/// A resource is always in exactly one state. Moving between states requires a barrier,
/// see [`BarrierBatch`].
///
/// [`BarrierBatch`]: crate::barrier::BarrierBatch
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Contents are undefined. This is the state of every resource after creation.
    #[default]
    Undefined,
    VertexInput,
    IndexInput,
    UniformRead,
    ShaderRead,
    UnorderedAccess,
    RenderTarget,
    DepthWrite,
    DepthRead,
    CopySrc,
    CopyDst,
    /// The resource is a swapchain image handed to the presentation engine.
    Present,
}

impl ResourceState {
    /// Returns `true` if the GPU may write to the resource in this state.
    pub const fn is_write(&self) -> bool {
        matches!(
            self,
            Self::UnorderedAccess | Self::RenderTarget | Self::DepthWrite | Self::CopyDst
        )
    }

    /// Returns `true` if the GPU only reads from the resource in this state.
    pub const fn is_read_only(&self) -> bool {
        !self.is_write() && !matches!(self, Self::Undefined)
    }

    /// Returns `true` if the state is valid for a buffer.
    pub const fn is_valid_for_buffer(&self) -> bool {
        matches!(
            self,
            Self::Undefined
                | Self::VertexInput
                | Self::IndexInput
                | Self::UniformRead
                | Self::ShaderRead
                | Self::UnorderedAccess
                | Self::CopySrc
                | Self::CopyDst
        )
    }

    /// Returns `true` if the state is valid for a texture.
    pub const fn is_valid_for_texture(&self) -> bool {
        !matches!(
            self,
            Self::VertexInput | Self::IndexInput | Self::UniformRead
        )
    }
}

/// Returns the state a buffer with the given usage is expected to be in when it is used.
///
/// If a buffer declares multiple usages the one the GPU is most likely to access it with during
/// rendering wins. Transfer usages only decide the state if nothing else is declared.
pub fn required_buffer_state(usage: BufferUsage) -> ResourceState {
    if usage.contains(BufferUsage::STORAGE) {
        ResourceState::UnorderedAccess
    } else if usage.contains(BufferUsage::UNIFORM) {
        ResourceState::UniformRead
    } else if usage.contains(BufferUsage::VERTEX) {
        ResourceState::VertexInput
    } else if usage.contains(BufferUsage::INDEX) {
        ResourceState::IndexInput
    } else if usage.contains(BufferUsage::INDIRECT) {
        ResourceState::ShaderRead
    } else if usage.contains(BufferUsage::TRANSFER_DST) {
        ResourceState::CopyDst
    } else if usage.contains(BufferUsage::TRANSFER_SRC) {
        ResourceState::CopySrc
    } else {
        ResourceState::Undefined
    }
}

/// Returns the state a texture with the given usage and format is expected to be in when it is
/// used.
pub fn required_texture_state(usage: TextureUsage, format: TextureFormat) -> ResourceState {
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth() {
            ResourceState::DepthWrite
        } else {
            ResourceState::RenderTarget
        }
    } else if usage.contains(TextureUsage::STORAGE) {
        ResourceState::UnorderedAccess
    } else if usage.contains(TextureUsage::TEXTURE_BINDING) {
        if format.is_depth() {
            ResourceState::DepthRead
        } else {
            ResourceState::ShaderRead
        }
    } else if usage.contains(TextureUsage::TRANSFER_DST) {
        ResourceState::CopyDst
    } else if usage.contains(TextureUsage::TRANSFER_SRC) {
        ResourceState::CopySrc
    } else {
        ResourceState::Undefined
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::TextureFormat;
    use crate::resource::{BufferUsage, TextureUsage};

    use super::{required_buffer_state, required_texture_state, ResourceState};

    #[test]
    fn uniform_buffer_requires_uniform_read() {
        let state = required_buffer_state(BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST);
        assert_eq!(state, ResourceState::UniformRead);
    }

    #[test]
    fn storage_wins_over_vertex() {
        let state = required_buffer_state(BufferUsage::STORAGE | BufferUsage::VERTEX);
        assert_eq!(state, ResourceState::UnorderedAccess);
    }

    #[test]
    fn depth_attachment_requires_depth_write() {
        let state = required_texture_state(
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            TextureFormat::Depth32Float,
        );
        assert_eq!(state, ResourceState::DepthWrite);

        let state =
            required_texture_state(TextureUsage::TEXTURE_BINDING, TextureFormat::Depth32Float);
        assert_eq!(state, ResourceState::DepthRead);
    }

    #[test]
    fn sampled_texture_requires_shader_read() {
        let state = required_texture_state(
            TextureUsage::TEXTURE_BINDING | TextureUsage::TRANSFER_DST,
            TextureFormat::Rgba8UnormSrgb,
        );
        assert_eq!(state, ResourceState::ShaderRead);
    }

    #[test]
    fn write_states() {
        assert!(ResourceState::CopyDst.is_write());
        assert!(ResourceState::UniformRead.is_read_only());
        assert!(!ResourceState::Undefined.is_read_only());
        assert!(!ResourceState::UniformRead.is_valid_for_texture());
        assert!(!ResourceState::RenderTarget.is_valid_for_buffer());
    }
}
