use std::ops::Range;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::backend::{
    RawBuffer, RawCommandPool, RawFramebuffer, RawPipeline, RawRenderPass, RawSampler,
    RawShaderModule, RawTexture,
};
use crate::descriptor::HeapKind;
use crate::memory::MemoryAllocation;
use crate::queue::SubmissionIndex;

/// A driver object whose destruction is delayed until the GPU no longer uses it.
#[derive(Debug)]
pub(crate) enum DeletionEvent {
    Buffer {
        raw: RawBuffer,
        allocation: Option<MemoryAllocation>,
    },
    Texture {
        raw: RawTexture,
        allocation: Option<MemoryAllocation>,
    },
    Sampler(RawSampler),
    ShaderModule(RawShaderModule),
    Pipeline(RawPipeline),
    RenderPass(RawRenderPass),
    Framebuffer(RawFramebuffer),
    CommandPool(RawCommandPool),
    Descriptors {
        kind: HeapKind,
        heap: usize,
        range: Range<u32>,
    },
}

/// Objects waiting for the submissions that may still use them.
///
/// Pushing never blocks on the sweep: new events land in a lock-free queue and are only moved
/// into the pending list by [`collect`].
///
/// [`collect`]: Self::collect
#[derive(Debug, Default)]
pub(crate) struct DeletionQueue {
    incoming: SegQueue<Deferred>,
    pending: Mutex<Vec<Deferred>>,
}

#[derive(Debug)]
struct Deferred {
    fences: Vec<SubmissionIndex>,
    event: DeletionEvent,
}

impl DeletionQueue {
    /// Queues `event` until all `fences` are complete.
    pub(crate) fn push(&self, fences: Vec<SubmissionIndex>, event: DeletionEvent) {
        self.incoming.push(Deferred { fences, event });
    }

    /// Removes and returns all events whose fences are complete.
    pub(crate) fn collect<F>(&self, mut is_complete: F) -> Vec<DeletionEvent>
    where
        F: FnMut(SubmissionIndex) -> bool,
    {
        let mut pending = self.pending.lock();
        while let Some(deferred) = self.incoming.pop() {
            pending.push(deferred);
        }

        let mut ready = Vec::new();
        let mut index = 0;
        while index < pending.len() {
            if pending[index].fences.iter().all(|fence| is_complete(*fence)) {
                ready.push(pending.swap_remove(index).event);
            } else {
                index += 1;
            }
        }

        ready
    }

    /// Removes and returns all events regardless of their fences.
    pub(crate) fn drain(&self) -> Vec<DeletionEvent> {
        let mut events: Vec<_> = self.pending.lock().drain(..).map(|d| d.event).collect();
        while let Some(deferred) = self.incoming.pop() {
            events.push(deferred.event);
        }
        events
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len() + self.incoming.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{RawQueue, RawSampler};
    use crate::queue::SubmissionIndex;

    use super::{DeletionEvent, DeletionQueue};

    #[test]
    fn events_wait_for_all_fences() {
        let queue = DeletionQueue::default();
        let graphics = SubmissionIndex::new(RawQueue(0), 3);
        let transfer = SubmissionIndex::new(RawQueue(1), 7);

        queue.push(vec![graphics, transfer], DeletionEvent::Sampler(RawSampler(1)));
        queue.push(vec![graphics], DeletionEvent::Sampler(RawSampler(2)));
        queue.push(Vec::new(), DeletionEvent::Sampler(RawSampler(3)));

        let ready = queue.collect(|fence| fence.queue() == RawQueue(0) && fence.value() <= 3);
        let mut ready: Vec<_> = ready
            .into_iter()
            .map(|event| match event {
                DeletionEvent::Sampler(sampler) => sampler.0,
                _ => unreachable!(),
            })
            .collect();
        ready.sort();
        assert_eq!(ready, [2, 3]);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.collect(|_| true).len(), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn drain_ignores_fences() {
        let queue = DeletionQueue::default();
        queue.push(
            vec![SubmissionIndex::new(RawQueue(0), u64::MAX)],
            DeletionEvent::Sampler(RawSampler(1)),
        );

        assert!(queue.collect(|_| false).is_empty());
        assert_eq!(queue.drain().len(), 1);
    }
}
