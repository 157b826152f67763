//! Resource and command lifecycle on top of an explicit graphics API.
//!
//! A [`Device`] creates resources, pipelines and command contexts. Resources track the state
//! they were last used in and command buffers insert the barriers needed to move them into the
//! state a command requires. Dropped objects are destroyed once every submission that could
//! still use them has completed, which happens in [`Device::maintain`].
//!
//! Backends implement the [`Driver`] trait. The [`NullDriver`] runs without a GPU and the
//! Vulkan driver is available behind the `vulkan` feature.
//!
//! [`Driver`]: backend::Driver
//! [`NullDriver`]: backend::null::NullDriver

pub mod backend;
pub mod barrier;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod render_pass;
pub mod resource;
pub mod sampler;
pub mod shader;
pub mod staging;
pub mod state;
pub mod statistics;
pub mod swapchain;
pub mod upload;

mod cache;
mod deletion;
mod device;

pub use command::{CommandBuffer, CommandBufferState};
pub use config::DeviceConfig;
pub use descriptor::{BindingResource, DescriptorTable};
pub use device::Device;
pub use error::{Error, LimitError};
pub use memory::DeviceAccess;
pub use pipeline::Pipeline;
pub use pool::CommandContext;
pub use queue::{Queue, QueueType, SubmissionIndex};
pub use render_pass::Framebuffer;
pub use resource::{Buffer, BufferDescriptor, BufferUsage, Texture, TextureDescriptor, TextureUsage};
pub use sampler::Sampler;
pub use shader::Shader;
pub use state::ResourceState;
pub use swapchain::{Swapchain, SwapchainConfig};
pub use upload::{UploadContext, UploadManager};
