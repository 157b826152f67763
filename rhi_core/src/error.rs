use thiserror::Error;

use crate::backend::{BackendError, SurfaceError};
use crate::descriptor::HeapKind;
use crate::memory::DeviceAccess;

/// Errors returned from fallible device operations.
///
/// Incorrect use of the API, like recording into a closed command buffer, is not an error but
/// a panic.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("out of memory allocating {size} bytes with {access:?} access")]
    OutOfMemory { size: u64, access: DeviceAccess },
    #[error("out of descriptors in {kind:?} heap")]
    OutOfDescriptors { kind: HeapKind },
    #[error(transparent)]
    LimitExceeded(#[from] LimitError),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("device lost")]
    DeviceLost,
    /// The surface could not be recovered after recreating the swapchain.
    #[error("surface unavailable: {0}")]
    Surface(SurfaceError),
    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::DeviceLost => Self::DeviceLost,
            BackendError::Unsupported(what) => Self::Unsupported(what),
            err => Self::Backend(err),
        }
    }
}

/// A device limit that a resource description exceeds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("resource has a size of zero")]
    ZeroSized,
    #[error("buffer size {size} exceeds limit {max}")]
    BufferSize { size: u64, max: u64 },
    #[error("texture dimension {size} exceeds limit {max}")]
    TextureDimension { size: u32, max: u32 },
    #[error("array layer count {count} exceeds limit {max}")]
    ArrayLayers { count: u32, max: u32 },
    #[error("mip level count {count} exceeds limit {max}")]
    MipLevels { count: u32, max: u32 },
    #[error("{count} color attachments exceed limit {max}")]
    ColorAttachments { count: u32, max: u32 },
    #[error("{count} vertex attributes exceed limit {max}")]
    VertexAttributes { count: u32, max: u32 },
    #[error("{count} bindings exceed limit {max}")]
    Bindings { count: u32, max: u32 },
    #[error("push constant size {size} exceeds limit {max}")]
    PushConstants { size: u32, max: u32 },
}
