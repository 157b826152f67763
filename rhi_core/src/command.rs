//! Command buffers and their lifecycle.
//!
//! ```text
//! Initial --Begin--> Recording --End--> Closed --Submit--> Pending --Complete--> Ready
//!    ^                   |                 |                                      |
//!    |                Discard           Discard                                 Begin
//!    |                   v                 v                                      v
//!    +------Reset---- NeedsReset <---------+                                  Recording
//! ```

use std::ops::Range;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::backend::{
    ClearValue, Command, CommandBufferLevel, Driver, ImageDataLayout, IndexFormat, LoadOp,
    PipelineBindPoint, RawCommandBuffer,
};
use crate::barrier::{BarrierBatch, BarrierStatistics};
use crate::descriptor::{DescriptorTable, HeapKind, TableResource};
use crate::error::Error;
use crate::pipeline::{AttachmentFormats, Pipeline};
use crate::queue::{QueueType, SubmissionIndex};
use crate::render_pass::Framebuffer;
use crate::resource::{Buffer, BufferUsage, ResourceId, Texture, TextureUsage};
use crate::state::ResourceState;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Allocated or reset, not recording.
    Initial,
    Recording,
    /// Recording has ended. The buffer waits for submission.
    Closed,
    /// Submitted, the GPU may still execute it.
    Pending,
    /// The submission has completed and the buffer can be recorded again.
    Ready,
    /// The buffer was discarded and must be reset before it can be used.
    NeedsReset,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferEvent {
    Begin,
    End,
    Submit,
    Complete,
    Discard,
    Reset,
}

impl CommandBufferState {
    /// Returns the state after `event`, or `None` if `event` is not allowed in this state.
    pub const fn next(self, event: CommandBufferEvent) -> Option<Self> {
        use CommandBufferEvent as E;
        use CommandBufferState as S;

        match (self, event) {
            (S::Initial | S::Ready | S::Closed, E::Begin) => Some(S::Recording),
            (S::Recording, E::End) => Some(S::Closed),
            (S::Closed, E::Submit) => Some(S::Pending),
            (S::Pending, E::Complete) => Some(S::Ready),
            (S::Recording | S::Closed, E::Discard) => Some(S::NeedsReset),
            (S::Initial | S::Closed | S::Ready | S::NeedsReset, E::Reset) => Some(S::Initial),
            _ => None,
        }
    }
}

/// A buffer of recorded GPU commands.
///
/// Command buffers are owned by a [`CommandContext`] and handed out for recording through
/// [`CommandContext::command_buffer`].
///
/// Every recording method panics if the buffer is not in the [`Recording`] state.
///
/// [`CommandContext`]: crate::pool::CommandContext
/// [`CommandContext::command_buffer`]: crate::pool::CommandContext::command_buffer
/// [`Recording`]: CommandBufferState::Recording
#[derive(Debug)]
pub struct CommandBuffer {
    raw: RawCommandBuffer,
    level: CommandBufferLevel,
    queue_type: QueueType,
    state: CommandBufferState,
    driver: Arc<dyn Driver>,
    batch_barriers: bool,
    barriers: BarrierBatch,
    submission: Option<SubmissionIndex>,
    waits: Vec<SubmissionIndex>,
    commands: u32,
    references: References,
    render_pass: Option<AttachmentFormats>,
    graphics_pipeline: Option<Pipeline>,
    compute_pipeline: Option<Pipeline>,
    last_bind_point: Option<PipelineBindPoint>,
    index_format: Option<IndexFormat>,
    debug_markers: u32,
    /// Secondary buffers of the same context executed by this primary buffer.
    pub(crate) secondaries: Vec<usize>,
    /// Set on secondary buffers once a primary buffer executes them.
    pub(crate) executed: bool,
}

/// Objects the recorded commands use. They are kept alive until the buffer has completed.
#[derive(Debug, Default)]
struct References {
    buffers: HashMap<ResourceId, Buffer>,
    textures: HashMap<ResourceId, Texture>,
    pipelines: Vec<Pipeline>,
    tables: Vec<DescriptorTable>,
    framebuffers: Vec<Framebuffer>,
}

impl References {
    fn clear(&mut self) {
        self.buffers.clear();
        self.textures.clear();
        self.pipelines.clear();
        self.tables.clear();
        self.framebuffers.clear();
    }
}

impl CommandBuffer {
    pub(crate) fn new(
        raw: RawCommandBuffer,
        level: CommandBufferLevel,
        queue_type: QueueType,
        driver: Arc<dyn Driver>,
        batch_barriers: bool,
    ) -> Self {
        Self {
            raw,
            level,
            queue_type,
            state: CommandBufferState::Initial,
            driver,
            batch_barriers,
            barriers: BarrierBatch::new(),
            submission: None,
            waits: Vec::new(),
            commands: 0,
            references: References::default(),
            render_pass: None,
            graphics_pipeline: None,
            compute_pipeline: None,
            last_bind_point: None,
            index_format: None,
            debug_markers: 0,
            secondaries: Vec::new(),
            executed: false,
        }
    }

    pub fn raw(&self) -> RawCommandBuffer {
        self.raw
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Returns the type of the hardware queue the buffer is submitted to.
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Returns the submission that executes this buffer, if it was submitted.
    pub fn submission(&self) -> Option<SubmissionIndex> {
        self.submission
    }

    /// Returns the number of commands recorded since the last [`Begin`].
    ///
    /// [`Begin`]: CommandBufferEvent::Begin
    pub fn command_count(&self) -> u32 {
        self.commands
    }

    pub fn barrier_statistics(&self) -> BarrierStatistics {
        self.barriers.statistics()
    }

    pub(crate) fn waits(&self) -> &[SubmissionIndex] {
        &self.waits
    }

    fn apply(&mut self, event: CommandBufferEvent) {
        match self.state.next(event) {
            Some(state) => self.state = state,
            None => panic!(
                "invalid command buffer event {:?} in state {:?}",
                event, self.state
            ),
        }
    }

    /// Starts recording. Buffers that were used before are reset first.
    pub(crate) fn begin(&mut self) -> Result<(), Error> {
        if matches!(
            self.state,
            CommandBufferState::Ready | CommandBufferState::Closed
        ) {
            self.reset()?;
        }
        debug_assert_eq!(self.state, CommandBufferState::Initial);

        // SAFETY: The buffer is in the initial state.
        unsafe {
            self.driver.begin_command_buffer(self.raw)?;
        }

        self.apply(CommandBufferEvent::Begin);
        Ok(())
    }

    /// Ends recording.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not recording, a render pass is still active or debug markers
    /// are unbalanced.
    pub fn end(&mut self) -> Result<(), Error> {
        self.assert_recording();
        assert!(
            self.render_pass.is_none(),
            "command buffer ended with an active render pass"
        );
        assert_eq!(
            self.debug_markers, 0,
            "command buffer ended with unbalanced debug markers"
        );

        self.flush_barriers();

        // SAFETY: The buffer is recording.
        unsafe {
            self.driver.end_command_buffer(self.raw)?;
        }

        self.apply(CommandBufferEvent::End);
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self, index: SubmissionIndex) {
        self.apply(CommandBufferEvent::Submit);
        self.submission = Some(index);
    }

    /// Moves a pending buffer to [`Ready`] if its submission has completed.
    ///
    /// [`Ready`]: CommandBufferState::Ready
    pub(crate) fn complete(&mut self) {
        self.apply(CommandBufferEvent::Complete);
        self.references.clear();
        self.waits.clear();
    }

    /// Abandons the recorded commands.
    ///
    /// Resource states changed by the recorded transitions are not rolled back.
    pub(crate) fn discard(&mut self) {
        self.apply(CommandBufferEvent::Discard);
        self.barriers = BarrierBatch::new();
        self.references.clear();
        self.waits.clear();
        self.render_pass = None;
        self.debug_markers = 0;
    }

    pub(crate) fn reset(&mut self) -> Result<(), Error> {
        debug_assert_ne!(self.state, CommandBufferState::Pending);

        // SAFETY: The buffer is not pending.
        unsafe {
            self.driver.reset_command_buffer(self.raw)?;
        }

        self.apply(CommandBufferEvent::Reset);
        self.barriers = BarrierBatch::new();
        self.submission = None;
        self.waits.clear();
        self.commands = 0;
        self.references.clear();
        self.render_pass = None;
        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.last_bind_point = None;
        self.index_format = None;
        self.debug_markers = 0;
        self.secondaries.clear();
        self.executed = false;
        Ok(())
    }

    fn assert_recording(&self) {
        assert_eq!(
            self.state,
            CommandBufferState::Recording,
            "command buffer is not recording"
        );
    }

    fn assert_graphics_queue(&self) {
        assert_eq!(
            self.queue_type,
            QueueType::Graphics,
            "graphics commands require a graphics queue"
        );
    }

    fn assert_compute_queue(&self) {
        assert_ne!(
            self.queue_type,
            QueueType::Transfer,
            "compute commands require a graphics or compute queue"
        );
    }

    fn flush_barriers(&mut self) {
        if let Some(command) = self.barriers.flush() {
            self.record_raw(&command);
        }
    }

    fn record_raw(&mut self, command: &Command) {
        // SAFETY: The buffer is recording and every handle in the command is kept alive by
        // `references` until the buffer has completed.
        unsafe {
            self.driver.record(self.raw, command);
        }
        self.commands += 1;
    }

    /// Records a command after all pending barriers.
    fn record(&mut self, command: Command) {
        self.flush_barriers();
        self.record_raw(&command);
    }

    /// Ends the active render pass before a command that is not allowed inside of one.
    fn leave_render_pass(&mut self) {
        if self.render_pass.is_some() {
            tracing::debug!("ending render pass implicitly before transfer command");
            self.end_render_pass();
        }
    }

    /// Moves `buffer` into `state` before the next command.
    ///
    /// # Panics
    ///
    /// Panics if a state change is required while a render pass is active.
    pub fn transition_buffer(&mut self, buffer: &Buffer, state: ResourceState) {
        self.assert_recording();

        self.references
            .buffers
            .entry(buffer.id())
            .or_insert_with(|| buffer.clone());

        if self.barriers.transition_buffer(buffer, state) {
            assert!(
                self.render_pass.is_none(),
                "cannot transition buffer {:?} to {:?} inside a render pass",
                buffer.id(),
                state
            );

            if !self.batch_barriers {
                self.flush_barriers();
            }
        }
    }

    /// Moves `texture` into `state` before the next command.
    ///
    /// # Panics
    ///
    /// Panics if `state` is [`ResourceState::Present`] or a state change is required while a
    /// render pass is active.
    pub fn transition_texture(&mut self, texture: &Texture, state: ResourceState) {
        self.assert_recording();
        self.track_texture(texture);

        if self.barriers.transition_texture(texture, state) {
            self.after_texture_barrier(texture, state);
        }
    }

    /// Moves a swapchain image into the `Present` state.
    pub(crate) fn transition_for_present(&mut self, texture: &Texture) {
        self.assert_recording();
        self.leave_render_pass();
        self.track_texture(texture);

        if self.barriers.transition_for_present(texture) {
            self.after_texture_barrier(texture, ResourceState::Present);
        }
    }

    fn track_texture(&mut self, texture: &Texture) {
        self.references
            .textures
            .entry(texture.id())
            .or_insert_with(|| texture.clone());
    }

    fn after_texture_barrier(&mut self, texture: &Texture, state: ResourceState) {
        assert!(
            self.render_pass.is_none(),
            "cannot transition texture {:?} to {:?} inside a render pass",
            texture.id(),
            state
        );

        if !self.batch_barriers {
            self.flush_barriers();
        }
    }

    /// Moves every resource of `table` into the state its binding accesses it in.
    fn transition_table(&mut self, table: &DescriptorTable) {
        for resource in table.resources() {
            match resource {
                TableResource::Buffer(buffer, state) => self.transition_buffer(&buffer, state),
                TableResource::Texture(texture, state) => {
                    self.transition_texture(&texture, state)
                }
            }
        }
    }

    /// Copies `size` bytes from `src` to `dst`.
    ///
    /// # Panics
    ///
    /// Panics if either range is out of bounds or the buffers lack the transfer usages.
    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        self.assert_recording();
        assert!(
            src.usage().contains(BufferUsage::TRANSFER_SRC),
            "copy source lacks TRANSFER_SRC usage"
        );
        assert!(
            dst.usage().contains(BufferUsage::TRANSFER_DST),
            "copy destination lacks TRANSFER_DST usage"
        );
        assert_in_bounds(src_offset, size, src.size());
        assert_in_bounds(dst_offset, size, dst.size());
        assert!(src != dst, "copy source and destination are the same buffer");

        if size == 0 {
            return;
        }

        self.leave_render_pass();
        self.transition_buffer(src, ResourceState::CopySrc);
        self.transition_buffer(dst, ResourceState::CopyDst);
        self.record(Command::CopyBuffer {
            src: src.raw(),
            src_offset,
            dst: dst.raw(),
            dst_offset,
            size,
        });
    }

    /// Copies texel data from `src` into a single subresource of `dst`.
    ///
    /// # Panics
    ///
    /// Panics if the subresource does not exist, the source range is out of bounds or the
    /// resources lack the transfer usages.
    pub fn copy_buffer_to_texture(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        layout: ImageDataLayout,
        dst: &Texture,
        mip_level: u32,
        array_layer: u32,
    ) {
        self.assert_recording();
        assert!(
            src.usage().contains(BufferUsage::TRANSFER_SRC),
            "copy source lacks TRANSFER_SRC usage"
        );
        assert!(
            dst.usage().contains(TextureUsage::TRANSFER_DST),
            "copy destination lacks TRANSFER_DST usage"
        );
        assert!(
            mip_level < dst.mip_levels() && array_layer < dst.array_layers(),
            "subresource (mip {}, layer {}) does not exist",
            mip_level,
            array_layer
        );

        let extent = dst.descriptor().mip_extent(mip_level);
        let row_size = extent.x * dst.format().bytes_per_texel();
        assert!(
            layout.bytes_per_row >= row_size && layout.rows_per_image >= extent.y,
            "image data layout {:?} is too small for extent {}",
            layout,
            extent
        );
        let size = u64::from(layout.bytes_per_row)
            * u64::from(layout.rows_per_image)
            * u64::from(extent.z);
        assert_in_bounds(src_offset, size, src.size());

        self.leave_render_pass();
        self.transition_buffer(src, ResourceState::CopySrc);
        self.transition_texture(dst, ResourceState::CopyDst);
        self.record(Command::CopyBufferToTexture {
            src: src.raw(),
            src_offset,
            layout,
            dst: dst.raw(),
            format: dst.format(),
            mip_level,
            array_layer,
            extent,
        });
    }

    /// Clears every subresource of `texture`.
    pub fn clear_texture(&mut self, texture: &Texture, value: ClearValue) {
        self.assert_recording();
        self.assert_compute_queue();
        assert!(
            texture.usage().contains(TextureUsage::TRANSFER_DST),
            "cleared texture lacks TRANSFER_DST usage"
        );
        assert_eq!(
            texture.format().is_depth(),
            matches!(value, ClearValue::DepthStencil { .. }),
            "clear value {:?} does not match format {:?}",
            value,
            texture.format()
        );

        self.leave_render_pass();
        self.transition_texture(texture, ResourceState::CopyDst);
        self.record(Command::ClearTexture {
            texture: texture.raw(),
            format: texture.format(),
            value,
        });
    }

    /// Begins a render pass drawing into `framebuffer`.
    ///
    /// `clear_values` holds one value per attachment, colors first. It may be empty if no
    /// attachment is cleared.
    ///
    /// # Panics
    ///
    /// Panics if a render pass is already active, the buffer is not a primary buffer or an
    /// attachment of the framebuffer was dropped.
    pub fn begin_render_pass(&mut self, framebuffer: &Framebuffer, clear_values: &[ClearValue]) {
        self.assert_recording();
        self.assert_graphics_queue();
        assert_eq!(
            self.level,
            CommandBufferLevel::Primary,
            "render passes can only begin in primary command buffers"
        );
        assert!(self.render_pass.is_none(), "render pass is already active");

        let Some(attachments) = framebuffer.attachments() else {
            panic!("framebuffer attachment was destroyed");
        };

        let layout = framebuffer.render_pass().layout();
        let clears = layout
            .colors
            .iter()
            .chain(&layout.depth_stencil)
            .any(|attachment| attachment.load_op == LoadOp::Clear);
        assert!(
            !clears || clear_values.len() == attachments.len(),
            "expected {} clear values, got {}",
            attachments.len(),
            clear_values.len()
        );

        for texture in &attachments {
            let state = if texture.format().is_depth() {
                ResourceState::DepthWrite
            } else {
                ResourceState::RenderTarget
            };
            self.transition_texture(texture, state);
        }

        self.record(Command::BeginRenderPass {
            render_pass: framebuffer.render_pass().raw(),
            framebuffer: framebuffer.raw(),
            width: framebuffer.width(),
            height: framebuffer.height(),
            clear_values: clear_values.to_vec(),
        });

        self.render_pass = Some(AttachmentFormats::from_layout(layout));
        self.barriers.set_skip_hazards(true);
        self.references.framebuffers.push(framebuffer.clone());
    }

    pub fn end_render_pass(&mut self) {
        self.assert_recording();
        assert!(self.render_pass.is_some(), "no render pass is active");

        self.record(Command::EndRenderPass);
        self.render_pass = None;
        self.barriers.set_skip_hazards(false);
    }

    pub fn bind_graphics_pipeline(&mut self, pipeline: &Pipeline) {
        self.assert_recording();
        self.assert_graphics_queue();
        assert_eq!(
            pipeline.bind_point(),
            PipelineBindPoint::Graphics,
            "not a graphics pipeline"
        );

        self.record(Command::BindPipeline {
            pipeline: pipeline.raw(),
            bind_point: PipelineBindPoint::Graphics,
        });
        self.graphics_pipeline = Some(pipeline.clone());
        self.last_bind_point = Some(PipelineBindPoint::Graphics);
        self.references.pipelines.push(pipeline.clone());
    }

    pub fn bind_compute_pipeline(&mut self, pipeline: &Pipeline) {
        self.assert_recording();
        self.assert_compute_queue();
        assert_eq!(
            pipeline.bind_point(),
            PipelineBindPoint::Compute,
            "not a compute pipeline"
        );

        self.record(Command::BindPipeline {
            pipeline: pipeline.raw(),
            bind_point: PipelineBindPoint::Compute,
        });
        self.compute_pipeline = Some(pipeline.clone());
        self.last_bind_point = Some(PipelineBindPoint::Compute);
        self.references.pipelines.push(pipeline.clone());
    }

    /// Binds `table` to the most recently bound pipeline.
    ///
    /// Every resource of the table is moved into the state its binding accesses it in. Tables
    /// referencing resources that need a transition must be bound before the render pass
    /// begins. Inside a render pass, storage resources that are already in
    /// [`ResourceState::UnorderedAccess`] get no hazard barrier, so draws of one pass are not
    /// ordered against each other.
    ///
    /// # Panics
    ///
    /// Panics if no pipeline is bound, the layout of the table does not match the pipeline, a
    /// slot of the table was never written or a written resource was dropped.
    pub fn bind_descriptor_table(&mut self, table: &DescriptorTable) {
        self.assert_recording();

        let pipeline = match self.last_bind_point {
            Some(PipelineBindPoint::Graphics) => self.graphics_pipeline.clone(),
            Some(PipelineBindPoint::Compute) => self.compute_pipeline.clone(),
            None => None,
        };
        let Some(pipeline) = pipeline else {
            panic!("no pipeline bound");
        };
        assert_eq!(
            **table.layout(),
            **pipeline.layout(),
            "descriptor table layout does not match the bound pipeline"
        );

        self.transition_table(table);

        for kind in [HeapKind::Resource, HeapKind::Sampler] {
            if let Some((heap, offset)) = table.heap_offset(kind) {
                self.record(Command::BindDescriptorTable {
                    pipeline: pipeline.raw(),
                    bind_point: pipeline.bind_point(),
                    kind,
                    heap,
                    offset,
                });
            }
        }

        self.references.tables.push(table.clone());
    }

    pub fn bind_vertex_buffer(&mut self, slot: u32, buffer: &Buffer, offset: u64) {
        self.assert_recording();
        self.assert_graphics_queue();
        assert!(
            buffer.usage().contains(BufferUsage::VERTEX),
            "vertex buffer lacks VERTEX usage"
        );
        assert!(offset < buffer.size(), "vertex buffer offset out of bounds");

        self.transition_buffer(buffer, ResourceState::VertexInput);
        self.record(Command::BindVertexBuffer {
            slot,
            buffer: buffer.raw(),
            offset,
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, format: IndexFormat) {
        self.assert_recording();
        self.assert_graphics_queue();
        assert!(
            buffer.usage().contains(BufferUsage::INDEX),
            "index buffer lacks INDEX usage"
        );
        assert!(offset < buffer.size(), "index buffer offset out of bounds");
        assert_eq!(
            offset % u64::from(format.size()),
            0,
            "index buffer offset is not aligned to the index size"
        );

        self.transition_buffer(buffer, ResourceState::IndexInput);
        self.record(Command::BindIndexBuffer {
            buffer: buffer.raw(),
            offset,
            format,
        });
        self.index_format = Some(format);
    }

    /// Updates push constants of the most recently bound pipeline.
    ///
    /// # Panics
    ///
    /// Panics if no pipeline is bound, `offset` or the length of `data` are not multiples of
    /// four or the range exceeds the push constant block of the pipeline.
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) {
        self.assert_recording();

        let pipeline = match self.last_bind_point {
            Some(PipelineBindPoint::Graphics) => self.graphics_pipeline.as_ref(),
            Some(PipelineBindPoint::Compute) => self.compute_pipeline.as_ref(),
            None => None,
        };
        let Some(pipeline) = pipeline else {
            panic!("no pipeline bound");
        };

        assert!(
            offset % 4 == 0 && data.len() % 4 == 0,
            "push constant range must be a multiple of 4 bytes"
        );
        let size = pipeline.layout().push_constant_size();
        assert!(
            u64::from(offset) + data.len() as u64 <= u64::from(size),
            "push constant range {}..{} exceeds block of {} bytes",
            offset,
            u64::from(offset) + data.len() as u64,
            size
        );

        let pipeline = pipeline.raw();
        self.record(Command::PushConstants {
            pipeline,
            offset,
            data: data.to_vec(),
        });
    }

    fn assert_can_draw(&self) {
        self.assert_recording();

        let Some(formats) = &self.render_pass else {
            panic!("draw outside of a render pass");
        };
        let Some(pipeline) = &self.graphics_pipeline else {
            panic!("draw without a graphics pipeline");
        };
        assert_eq!(
            pipeline.attachments(),
            Some(formats),
            "pipeline attachment formats do not match the render pass"
        );
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.assert_can_draw();
        self.record(Command::Draw {
            vertices,
            instances,
        });
    }

    pub fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.assert_can_draw();
        assert!(self.index_format.is_some(), "no index buffer bound");

        self.record(Command::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.assert_recording();
        self.assert_compute_queue();
        assert!(self.compute_pipeline.is_some(), "dispatch without a compute pipeline");

        self.leave_render_pass();
        self.record(Command::Dispatch { x, y, z });
    }

    pub fn begin_debug_marker(&mut self, name: &str) {
        self.assert_recording();
        self.record(Command::BeginDebugMarker {
            name: name.to_owned(),
        });
        self.debug_markers += 1;
    }

    pub fn end_debug_marker(&mut self) {
        self.assert_recording();
        assert!(self.debug_markers > 0, "no debug marker to end");

        self.record(Command::EndDebugMarker);
        self.debug_markers -= 1;
    }

    /// Delays the execution of this buffer until `index` has completed.
    ///
    /// This is required to consume results of another queue, like an upload on a dedicated
    /// transfer queue.
    pub fn wait_for(&mut self, index: SubmissionIndex) {
        self.assert_recording();
        if !self.waits.contains(&index) {
            self.waits.push(index);
        }
    }

    pub(crate) fn execute_secondaries(&mut self, buffers: Vec<RawCommandBuffer>) {
        self.assert_recording();
        assert_eq!(
            self.level,
            CommandBufferLevel::Primary,
            "only primary command buffers execute secondary buffers"
        );
        assert!(
            self.render_pass.is_none(),
            "secondary command buffers are executed outside of render passes"
        );

        self.record(Command::ExecuteSecondary { buffers });
    }

    pub(crate) fn add_waits(&mut self, waits: &[SubmissionIndex]) {
        for index in waits {
            if !self.waits.contains(index) {
                self.waits.push(*index);
            }
        }
    }
}

fn assert_in_bounds(offset: u64, size: u64, len: u64) {
    assert!(
        offset.checked_add(size).is_some_and(|end| end <= len),
        "range {}..{} out of bounds for buffer of size {}",
        offset,
        offset.saturating_add(size),
        len
    );
}

#[cfg(test)]
mod tests {
    use super::{CommandBufferEvent, CommandBufferState};

    #[test]
    fn lifecycle() {
        let mut state = CommandBufferState::Initial;
        for event in [
            CommandBufferEvent::Begin,
            CommandBufferEvent::End,
            CommandBufferEvent::Submit,
            CommandBufferEvent::Complete,
            CommandBufferEvent::Begin,
        ] {
            state = state.next(event).unwrap();
        }

        assert_eq!(state, CommandBufferState::Recording);
    }

    #[test]
    fn begin_only_from_initial_or_closed() {
        assert!(CommandBufferState::Initial
            .next(CommandBufferEvent::Begin)
            .is_some());
        assert!(CommandBufferState::Closed
            .next(CommandBufferEvent::Begin)
            .is_some());
        assert!(CommandBufferState::Recording
            .next(CommandBufferEvent::Begin)
            .is_none());
        assert!(CommandBufferState::Pending
            .next(CommandBufferEvent::Begin)
            .is_none());
        assert!(CommandBufferState::NeedsReset
            .next(CommandBufferEvent::Begin)
            .is_none());
    }

    #[test]
    fn pending_buffers_cannot_be_reset() {
        assert!(CommandBufferState::Pending
            .next(CommandBufferEvent::Reset)
            .is_none());
        assert!(CommandBufferState::Pending
            .next(CommandBufferEvent::Discard)
            .is_none());
    }

    #[test]
    fn discarded_buffers_need_reset() {
        let state = CommandBufferState::Recording
            .next(CommandBufferEvent::Discard)
            .unwrap();
        assert_eq!(state, CommandBufferState::NeedsReset);
        assert_eq!(
            state.next(CommandBufferEvent::Reset),
            Some(CommandBufferState::Initial)
        );
    }
}
