//! Resource state transitions.
//!
//! Every access to a resource inside a command buffer first moves the resource into the state
//! the access requires. Transitions are collected in a [`BarrierBatch`] and flushed as a single
//! [`Command::PipelineBarrier`] before the next command that depends on them.

use crate::backend::{BufferBarrier, Command, TextureBarrier};
use crate::resource::{Buffer, Texture};
use crate::state::ResourceState;

/// Pending barriers of a command buffer.
#[derive(Clone, Debug, Default)]
pub struct BarrierBatch {
    buffers: Vec<BufferBarrier>,
    textures: Vec<TextureBarrier>,
    statistics: BarrierStatistics,
    /// Set while a render pass is active. Resources already in
    /// [`ResourceState::UnorderedAccess`] then stay in it without a hazard barrier.
    skip_hazards: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BarrierStatistics {
    /// Number of individual resource barriers recorded.
    pub barriers_emitted: u64,
    /// Number of driver barrier commands the barriers were flushed in.
    pub barrier_batches_flushed: u64,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables hazard barriers between unordered accesses.
    ///
    /// Barriers cannot be recorded inside a render pass, so unordered accesses of one pass are
    /// not ordered against each other. Their transition into
    /// [`ResourceState::UnorderedAccess`] must happen before the pass begins.
    pub(crate) fn set_skip_hazards(&mut self, skip: bool) {
        self.skip_hazards = skip;
    }

    fn needs_barrier(&self, src: ResourceState, dst: ResourceState) -> bool {
        if self.skip_hazards {
            src != dst
        } else {
            needs_barrier(src, dst)
        }
    }

    /// Moves `buffer` into `state`.
    ///
    /// Returns `true` if a barrier was added.
    ///
    /// # Panics
    ///
    /// Panics if `state` is not a valid buffer state.
    pub fn transition_buffer(&mut self, buffer: &Buffer, state: ResourceState) -> bool {
        assert!(
            state.is_valid_for_buffer(),
            "{:?} is not a valid buffer state",
            state
        );

        let mut current = buffer.state_lock();
        if !self.needs_barrier(*current, state) {
            return false;
        }

        let raw = buffer.raw();
        match self.buffers.iter().position(|barrier| barrier.buffer == raw) {
            // A second transition of the same resource before any command used the first one
            // collapses into a single barrier from the original state.
            Some(index) => {
                let barrier = &mut self.buffers[index];
                barrier.dst = state;
                if !needs_barrier(barrier.src, barrier.dst) {
                    self.buffers.swap_remove(index);
                    self.statistics.barriers_emitted -= 1;
                }
            }
            None => {
                self.buffers.push(BufferBarrier {
                    buffer: raw,
                    src: *current,
                    dst: state,
                });
                self.statistics.barriers_emitted += 1;
            }
        }

        *current = state;
        true
    }

    /// Moves `texture` into `state`.
    ///
    /// Returns `true` if a barrier was added.
    ///
    /// # Panics
    ///
    /// Panics if `state` is not a valid texture state or `state` is
    /// [`ResourceState::Present`]. Only presenting a swapchain image moves it into the
    /// `Present` state.
    pub fn transition_texture(&mut self, texture: &Texture, state: ResourceState) -> bool {
        assert_ne!(
            state,
            ResourceState::Present,
            "textures are only transitioned to Present by presenting them"
        );

        self.transition_texture_unchecked(texture, state)
    }

    /// Moves a swapchain image into the [`ResourceState::Present`] state.
    pub(crate) fn transition_for_present(&mut self, texture: &Texture) -> bool {
        debug_assert!(texture.is_swapchain_image());
        self.transition_texture_unchecked(texture, ResourceState::Present)
    }

    fn transition_texture_unchecked(&mut self, texture: &Texture, state: ResourceState) -> bool {
        assert!(
            state.is_valid_for_texture(),
            "{:?} is not a valid texture state",
            state
        );

        let mut current = texture.state_lock();
        if !self.needs_barrier(*current, state) {
            return false;
        }

        let raw = texture.raw();
        match self.textures.iter().position(|barrier| barrier.texture == raw) {
            Some(index) => {
                let barrier = &mut self.textures[index];
                barrier.dst = state;
                if !needs_barrier(barrier.src, barrier.dst) {
                    self.textures.swap_remove(index);
                    self.statistics.barriers_emitted -= 1;
                }
            }
            None => {
                self.textures.push(TextureBarrier {
                    texture: raw,
                    format: texture.format(),
                    src: *current,
                    dst: state,
                });
                self.statistics.barriers_emitted += 1;
            }
        }

        *current = state;
        true
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }

    /// Takes all pending barriers as a single command.
    ///
    /// Returns `None` if no barriers are pending.
    pub fn flush(&mut self) -> Option<Command> {
        if self.is_empty() {
            return None;
        }

        self.statistics.barrier_batches_flushed += 1;
        Some(Command::PipelineBarrier {
            buffers: std::mem::take(&mut self.buffers),
            textures: std::mem::take(&mut self.textures),
        })
    }

    pub fn statistics(&self) -> BarrierStatistics {
        self.statistics
    }

    pub(crate) fn reset_statistics(&mut self) {
        self.statistics = BarrierStatistics::default();
    }
}

/// Returns `true` if moving from `src` to `dst` requires a barrier.
///
/// Two unordered accesses can race even without a state change, so staying in
/// [`ResourceState::UnorderedAccess`] still requires a barrier.
pub fn needs_barrier(src: ResourceState, dst: ResourceState) -> bool {
    src != dst || dst == ResourceState::UnorderedAccess
}

#[cfg(test)]
mod tests {
    use crate::backend::{Command, TextureFormat};
    use crate::memory::DeviceAccess;
    use crate::resource::{Buffer, BufferDescriptor, BufferUsage, TextureDescriptor, TextureUsage};
    use crate::state::ResourceState;
    use crate::{Device, DeviceConfig};

    use super::{needs_barrier, BarrierBatch};

    fn device() -> Device {
        Device::new(DeviceConfig::default()).unwrap()
    }

    fn buffer(device: &Device, usage: BufferUsage) -> Buffer {
        device
            .create_buffer(&BufferDescriptor {
                size: 256,
                usage,
                access: DeviceAccess::GpuRead,
            })
            .unwrap()
    }

    #[test]
    fn same_state_is_noop() {
        assert!(!needs_barrier(ResourceState::ShaderRead, ResourceState::ShaderRead));
        assert!(needs_barrier(ResourceState::Undefined, ResourceState::ShaderRead));
        assert!(needs_barrier(
            ResourceState::UnorderedAccess,
            ResourceState::UnorderedAccess
        ));
    }

    #[test]
    fn consecutive_accesses_emit_one_barrier() {
        let device = device();
        let buffer = buffer(&device, BufferUsage::UNIFORM);
        let mut batch = BarrierBatch::new();

        assert!(batch.transition_buffer(&buffer, ResourceState::UniformRead));
        assert!(batch.flush().is_some());
        assert!(!batch.transition_buffer(&buffer, ResourceState::UniformRead));
        assert!(batch.flush().is_none());

        assert_eq!(batch.statistics().barriers_emitted, 1);
        assert_eq!(buffer.state(), ResourceState::UniformRead);
    }

    #[test]
    fn unordered_access_hazard() {
        let device = device();
        let buffer = buffer(&device, BufferUsage::STORAGE);
        let mut batch = BarrierBatch::new();

        assert!(batch.transition_buffer(&buffer, ResourceState::UnorderedAccess));
        batch.flush();
        assert!(batch.transition_buffer(&buffer, ResourceState::UnorderedAccess));

        let Some(Command::PipelineBarrier { buffers, .. }) = batch.flush() else {
            panic!("expected a barrier");
        };
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].src, ResourceState::UnorderedAccess);
        assert_eq!(buffers[0].dst, ResourceState::UnorderedAccess);
    }

    #[test]
    fn batched_barriers_flush_together() {
        let device = device();
        let a = buffer(&device, BufferUsage::VERTEX);
        let b = buffer(&device, BufferUsage::INDEX);
        let mut batch = BarrierBatch::new();

        batch.transition_buffer(&a, ResourceState::VertexInput);
        batch.transition_buffer(&b, ResourceState::IndexInput);
        assert_eq!(batch.len(), 2);

        let Some(Command::PipelineBarrier { buffers, textures }) = batch.flush() else {
            panic!("expected a barrier");
        };
        assert_eq!(buffers.len(), 2);
        assert!(textures.is_empty());
        assert_eq!(batch.statistics().barrier_batches_flushed, 1);
    }

    #[test]
    fn repeated_transition_collapses() {
        let device = device();
        let buffer = buffer(&device, BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST);
        let mut batch = BarrierBatch::new();

        batch.transition_buffer(&buffer, ResourceState::CopyDst);
        batch.transition_buffer(&buffer, ResourceState::UniformRead);

        let Some(Command::PipelineBarrier { buffers, .. }) = batch.flush() else {
            panic!("expected a barrier");
        };
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].src, ResourceState::Undefined);
        assert_eq!(buffers[0].dst, ResourceState::UniformRead);
    }

    #[test]
    fn transition_back_to_original_state_is_not_counted() {
        let device = device();
        let buffer = buffer(&device, BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST);
        let mut batch = BarrierBatch::new();

        batch.transition_buffer(&buffer, ResourceState::UniformRead);
        batch.flush();

        assert!(batch.transition_buffer(&buffer, ResourceState::CopyDst));
        assert!(batch.transition_buffer(&buffer, ResourceState::UniformRead));
        assert!(batch.is_empty());
        assert!(batch.flush().is_none());

        let statistics = batch.statistics();
        assert_eq!(statistics.barriers_emitted, 1);
        assert_eq!(statistics.barrier_batches_flushed, 1);
        assert_eq!(buffer.state(), ResourceState::UniformRead);
    }

    #[test]
    fn hazards_are_skipped_inside_render_pass() {
        let device = device();
        let buffer = buffer(&device, BufferUsage::STORAGE);
        let mut batch = BarrierBatch::new();

        assert!(batch.transition_buffer(&buffer, ResourceState::UnorderedAccess));
        batch.flush();

        batch.set_skip_hazards(true);
        assert!(!batch.transition_buffer(&buffer, ResourceState::UnorderedAccess));
        assert!(batch.is_empty());

        // Real state changes still need a barrier.
        assert!(batch.transition_buffer(&buffer, ResourceState::ShaderRead));

        batch.set_skip_hazards(false);
        batch.flush();
        assert!(batch.transition_buffer(&buffer, ResourceState::UnorderedAccess));
        assert!(batch.transition_buffer(&buffer, ResourceState::UnorderedAccess));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    #[should_panic(expected = "only transitioned to Present")]
    fn app_cannot_transition_to_present() {
        let device = device();
        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                4,
                4,
                TextureFormat::Bgra8UnormSrgb,
                TextureUsage::RENDER_ATTACHMENT,
            ))
            .unwrap();

        let mut batch = BarrierBatch::new();
        batch.transition_texture(&texture, ResourceState::Present);
    }

    #[test]
    #[should_panic(expected = "not a valid buffer state")]
    fn invalid_buffer_state() {
        let device = device();
        let buffer = buffer(&device, BufferUsage::UNIFORM);

        let mut batch = BarrierBatch::new();
        batch.transition_buffer(&buffer, ResourceState::RenderTarget);
    }
}
