//! Per-worker command contexts.

use std::sync::Arc;

use rhi_tracing::trace_span;

use crate::backend::{CommandBufferLevel, RawCommandBuffer, RawCommandPool};
use crate::command::{CommandBuffer, CommandBufferState};
use crate::deletion::DeletionEvent;
use crate::device::DeviceShared;
use crate::error::Error;
use crate::queue::{Queue, QueueType, SubmissionIndex};

/// A pool of command buffers recording work for one queue.
///
/// A context is owned by a single worker at a time. Any number of contexts can record in
/// parallel. A context has at most one open buffer per [`CommandBufferLevel`].
#[derive(Debug)]
pub struct CommandContext {
    /// The queue type the context was requested for.
    queue_type: QueueType,
    queue: Arc<Queue>,
    pool: RawCommandPool,
    buffers: Vec<CommandBuffer>,
    open_primary: Option<usize>,
    open_secondary: Option<usize>,
    shared: Arc<DeviceShared>,
}

impl CommandContext {
    pub(crate) fn new(shared: Arc<DeviceShared>, queue_type: QueueType) -> Result<Self, Error> {
        let queue = shared.queues.get(queue_type).clone();
        let pool = shared.driver.create_command_pool(queue.family())?;

        Ok(Self {
            queue_type,
            queue,
            pool,
            buffers: Vec::new(),
            open_primary: None,
            open_secondary: None,
            shared,
        })
    }

    /// Returns the queue type the context was created for.
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Returns the queue the context submits to.
    ///
    /// This is the graphics queue if the device has no dedicated queue of the requested type.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Returns the number of command buffers allocated by this context.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Returns the number of buffers in `state`.
    pub fn count(&self, state: CommandBufferState) -> usize {
        self.buffers
            .iter()
            .filter(|buffer| buffer.state() == state)
            .count()
    }

    /// Returns a command buffer of `level` that is recording.
    ///
    /// In order of preference this returns the open buffer of the context, begins a buffer
    /// whose submission has completed, resets and begins a discarded buffer, or allocates a
    /// new buffer.
    pub fn command_buffer(&mut self, level: CommandBufferLevel) -> Result<&mut CommandBuffer, Error> {
        let _span = trace_span!("CommandContext::command_buffer").entered();

        if let Some(index) = self.open(level) {
            if self.buffers[index].state() == CommandBufferState::Recording {
                return Ok(&mut self.buffers[index]);
            }

            // The buffer was ended directly.
            *self.open_slot(level) = None;
        }

        self.reclaim();

        let index = match self.find(level, CommandBufferState::Ready) {
            Some(index) => index,
            None => match self.find(level, CommandBufferState::NeedsReset) {
                Some(index) => {
                    self.buffers[index].reset()?;
                    index
                }
                None => self.allocate(level)?,
            },
        };

        self.buffers[index].begin()?;
        *self.open_slot(level) = Some(index);
        Ok(&mut self.buffers[index])
    }

    /// Returns the open primary buffer, beginning one if necessary.
    pub fn primary(&mut self) -> Result<&mut CommandBuffer, Error> {
        self.command_buffer(CommandBufferLevel::Primary)
    }

    fn open(&self, level: CommandBufferLevel) -> Option<usize> {
        match level {
            CommandBufferLevel::Primary => self.open_primary,
            CommandBufferLevel::Secondary => self.open_secondary,
        }
    }

    fn open_slot(&mut self, level: CommandBufferLevel) -> &mut Option<usize> {
        match level {
            CommandBufferLevel::Primary => &mut self.open_primary,
            CommandBufferLevel::Secondary => &mut self.open_secondary,
        }
    }

    fn find(&self, level: CommandBufferLevel, state: CommandBufferState) -> Option<usize> {
        self.buffers
            .iter()
            .position(|buffer| buffer.level() == level && buffer.state() == state)
    }

    fn allocate(&mut self, level: CommandBufferLevel) -> Result<usize, Error> {
        let raw = self.shared.driver.allocate_command_buffer(self.pool, level)?;
        self.shared.statistics.command_buffers_allocated.increment();

        tracing::trace!(
            "allocated {:?} command buffer for {:?} queue ({} total)",
            level,
            self.queue.ty(),
            self.buffers.len() + 1
        );

        self.buffers.push(CommandBuffer::new(
            raw,
            level,
            self.queue.ty(),
            self.shared.driver.clone(),
            self.shared.config.batch_resource_barriers,
        ));
        Ok(self.buffers.len() - 1)
    }

    /// Moves all buffers whose submission has completed to the [`Ready`] state.
    ///
    /// Returns the number of reclaimed buffers.
    ///
    /// [`Ready`]: CommandBufferState::Ready
    pub fn reclaim(&mut self) -> usize {
        let mut count = 0;
        for buffer in &mut self.buffers {
            if buffer.state() != CommandBufferState::Pending {
                continue;
            }

            let Some(index) = buffer.submission() else {
                continue;
            };

            if self.queue.is_complete(index) {
                buffer.complete();
                count += 1;
            }
        }

        count
    }

    /// Ends the open secondary buffer and records its execution, together with all other
    /// closed secondary buffers, into the open primary buffer.
    pub fn execute_secondaries(&mut self) -> Result<(), Error> {
        if let Some(index) = self.open_secondary.take() {
            if self.buffers[index].state() == CommandBufferState::Recording {
                self.buffers[index].end()?;
            }
        }

        let secondaries: Vec<usize> = self
            .buffers
            .iter()
            .enumerate()
            .filter(|(_, buffer)| {
                buffer.level() == CommandBufferLevel::Secondary
                    && buffer.state() == CommandBufferState::Closed
                    && !buffer.executed
            })
            .map(|(index, _)| index)
            .collect();

        if secondaries.is_empty() {
            return Ok(());
        }

        let raw: Vec<RawCommandBuffer> = secondaries
            .iter()
            .map(|index| self.buffers[*index].raw())
            .collect();
        let waits: Vec<SubmissionIndex> = secondaries
            .iter()
            .flat_map(|index| self.buffers[*index].waits().to_vec())
            .collect();

        for index in &secondaries {
            self.buffers[*index].executed = true;
        }

        let primary = self.command_buffer(CommandBufferLevel::Primary)?;
        primary.execute_secondaries(raw);
        primary.add_waits(&waits);
        primary.secondaries.extend(secondaries);
        Ok(())
    }

    /// Ends all open buffers.
    ///
    /// Closed secondary buffers that no primary buffer executes are discarded on the next
    /// submission.
    pub fn close(&mut self) -> Result<(), Error> {
        for index in [self.open_primary.take(), self.open_secondary.take()]
            .into_iter()
            .flatten()
        {
            if self.buffers[index].state() == CommandBufferState::Recording {
                self.buffers[index].end()?;
            }
        }

        Ok(())
    }

    /// Closes the open buffers and returns the raw buffers and waits of everything ready for
    /// submission.
    ///
    /// Closed buffers without commands are discarded instead.
    pub(crate) fn prepare_submit(&mut self) -> Result<PreparedSubmit, Error> {
        self.close()?;

        let mut prepared = PreparedSubmit::default();
        for (index, buffer) in self.buffers.iter_mut().enumerate() {
            if buffer.state() != CommandBufferState::Closed {
                continue;
            }

            match buffer.level() {
                CommandBufferLevel::Primary if buffer.command_count() > 0 => {
                    prepared.command_buffers.push(buffer.raw());
                    prepared.waits.extend_from_slice(buffer.waits());
                    prepared.indices.push(index);
                }
                CommandBufferLevel::Secondary if buffer.executed => {}
                _ => buffer.discard(),
            }
        }

        prepared.waits.sort();
        prepared.waits.dedup();
        Ok(prepared)
    }

    pub(crate) fn finish_submit(&mut self, prepared: &PreparedSubmit, index: SubmissionIndex) {
        for buffer in &prepared.indices {
            let secondaries = std::mem::take(&mut self.buffers[*buffer].secondaries);
            self.buffers[*buffer].mark_submitted(index);

            for secondary in secondaries {
                self.buffers[secondary].mark_submitted(index);
            }
        }
    }

    /// Submits all closed buffers to the queue of the context.
    ///
    /// Open buffers are closed first. Returns `None` if nothing was recorded.
    pub fn submit(&mut self) -> Result<Option<SubmissionIndex>, Error> {
        let _span = trace_span!("CommandContext::submit").entered();

        let prepared = self.prepare_submit()?;
        if prepared.is_empty() {
            return Ok(None);
        }

        let index = self
            .queue
            .submit(&prepared.command_buffers, &prepared.waits)?;
        self.finish_submit(&prepared, index);
        Ok(Some(index))
    }

    /// Abandons all open and closed buffers that were not submitted.
    pub fn discard(&mut self) {
        self.open_primary = None;
        self.open_secondary = None;

        for buffer in &mut self.buffers {
            if matches!(
                buffer.state(),
                CommandBufferState::Recording | CommandBufferState::Closed
            ) {
                buffer.discard();
            }
        }
    }

    /// Blocks until every submission of this context has completed.
    pub fn wait(&mut self) -> Result<(), Error> {
        let last = self
            .buffers
            .iter()
            .filter(|buffer| buffer.state() == CommandBufferState::Pending)
            .filter_map(|buffer| buffer.submission())
            .max();

        if let Some(index) = last {
            self.queue.wait(index)?;
        }

        self.reclaim();
        Ok(())
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        // Pending buffers still reference the pool. Dropping the buffers releases their
        // references, the pool itself waits for the queues.
        self.buffers.clear();
        self.shared.defer(DeletionEvent::CommandPool(self.pool));
    }
}

/// Command buffers of one context collected for a single submission.
#[derive(Debug, Default)]
pub(crate) struct PreparedSubmit {
    pub(crate) command_buffers: Vec<RawCommandBuffer>,
    pub(crate) waits: Vec<SubmissionIndex>,
    indices: Vec<usize>,
}

impl PreparedSubmit {
    pub(crate) fn is_empty(&self) -> bool {
        self.command_buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::null::{Completion, NullAdapter, NullDriver};
    use crate::backend::CommandBufferLevel;
    use crate::command::CommandBufferState;
    use crate::queue::QueueType;
    use crate::{Device, DeviceConfig};

    fn manual_device() -> (Arc<NullDriver>, Device) {
        let driver = Arc::new(NullDriver::new(NullAdapter {
            completion: Completion::Manual,
            ..NullAdapter::default()
        }));
        let device = Device::with_driver(driver.clone(), DeviceConfig::default()).unwrap();
        (driver, device)
    }

    #[test]
    fn open_buffer_is_returned_again() {
        let (_, device) = manual_device();
        let mut context = device.create_command_context(QueueType::Graphics).unwrap();

        let first = context.primary().unwrap().raw();
        let second = context.primary().unwrap().raw();
        assert_eq!(first, second);
        assert_eq!(context.buffer_count(), 1);
    }

    #[test]
    fn completed_buffers_are_reused() {
        let (driver, device) = manual_device();
        let mut context = device.create_command_context(QueueType::Graphics).unwrap();

        let cmd = context.primary().unwrap();
        cmd.begin_debug_marker("frame");
        cmd.end_debug_marker();
        let raw = cmd.raw();
        context.submit().unwrap().unwrap();

        // Still pending, a new buffer is allocated.
        let other = context.primary().unwrap().raw();
        assert_ne!(raw, other);
        context.discard();

        driver.complete_all();
        let reused = context.primary().unwrap().raw();
        assert!(reused == raw || reused == other);
        assert_eq!(context.buffer_count(), 2);
    }

    #[test]
    fn empty_buffers_are_not_submitted() {
        let (_, device) = manual_device();
        let mut context = device.create_command_context(QueueType::Graphics).unwrap();

        context.primary().unwrap();
        assert_eq!(context.submit().unwrap(), None);
        assert_eq!(context.count(CommandBufferState::NeedsReset), 1);

        // The discarded buffer is reset and reused.
        context.primary().unwrap();
        assert_eq!(context.buffer_count(), 1);
    }

    #[test]
    fn secondaries_are_submitted_with_their_primary() {
        let (driver, device) = manual_device();
        let mut context = device.create_command_context(QueueType::Graphics).unwrap();

        let secondary = context.command_buffer(CommandBufferLevel::Secondary).unwrap();
        secondary.begin_debug_marker("secondary");
        secondary.end_debug_marker();
        context.execute_secondaries().unwrap();

        let index = context.submit().unwrap().unwrap();
        assert_eq!(context.count(CommandBufferState::Pending), 2);

        driver.complete_up_to(index.queue(), index.value());
        assert_eq!(context.reclaim(), 2);
        assert_eq!(context.count(CommandBufferState::Ready), 2);
    }

    #[test]
    #[should_panic(expected = "not recording")]
    fn recording_into_closed_buffer() {
        let (_, device) = manual_device();
        let mut context = device.create_command_context(QueueType::Graphics).unwrap();

        let cmd = context.primary().unwrap();
        cmd.end().unwrap();
        cmd.begin_debug_marker("too late");
    }
}
