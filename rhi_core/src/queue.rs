//! Hardware queues and their completion counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rhi_tracing::trace_span;

use crate::backend::{Driver, QueueCapabilities, RawCommandBuffer, RawQueue, SubmitBatch};
use crate::config::DeviceConfig;
use crate::error::Error;
use crate::statistics::Statistics;

/// The kind of work a queue is requested for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

/// A point on the timeline of a queue.
///
/// Becomes complete once the queue has signaled [`value`].
///
/// [`value`]: Self::value
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionIndex {
    queue: RawQueue,
    value: u64,
}

impl SubmissionIndex {
    pub const fn new(queue: RawQueue, value: u64) -> Self {
        Self { queue, value }
    }

    pub const fn queue(&self) -> RawQueue {
        self.queue
    }

    pub const fn value(&self) -> u64 {
        self.value
    }
}

/// Capabilities of a device that decide how work is spread over queues.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// The device has a compute queue separate from the graphics queue.
    pub async_compute: bool,
    /// The device has a transfer queue separate from the graphics queue.
    pub dedicated_transfer: bool,
}

/// A hardware queue.
///
/// Submissions are serialized: the timeline value of a batch is reserved and the batch is
/// handed to the driver under the same lock, so values reach the driver in increasing order.
#[derive(Debug)]
pub struct Queue {
    ty: QueueType,
    family: u32,
    raw: RawQueue,
    driver: Arc<dyn Driver>,
    statistics: Arc<Statistics>,
    submissions: Mutex<Submissions>,
    /// Highest value the queue is known to have signaled.
    signaled: AtomicU64,
    last_submitted: AtomicU64,
}

#[derive(Debug, Default)]
struct Submissions {
    next_value: u64,
    /// Submitted batches that have not been observed as complete.
    in_flight: VecDeque<InFlight>,
}

#[derive(Clone, Debug)]
struct InFlight {
    value: u64,
    command_buffers: Vec<RawCommandBuffer>,
}

impl Queue {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        statistics: Arc<Statistics>,
        ty: QueueType,
        family: u32,
    ) -> Result<Self, Error> {
        let raw = driver.queue(family)?;

        Ok(Self {
            ty,
            family,
            raw,
            driver,
            statistics,
            submissions: Mutex::new(Submissions {
                next_value: 1,
                in_flight: VecDeque::new(),
            }),
            signaled: AtomicU64::new(0),
            last_submitted: AtomicU64::new(0),
        })
    }

    /// Returns the type of the hardware queue.
    ///
    /// This is [`QueueType::Graphics`] for a queue that also serves transfer or compute requests
    /// because the device has no dedicated queue for them.
    pub fn ty(&self) -> QueueType {
        self.ty
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn raw(&self) -> RawQueue {
        self.raw
    }

    /// Submits a batch of closed command buffers.
    ///
    /// The batch will not start before every submission in `waits` has completed.
    pub fn submit(
        &self,
        command_buffers: &[RawCommandBuffer],
        waits: &[SubmissionIndex],
    ) -> Result<SubmissionIndex, Error> {
        let _span = trace_span!("Queue::submit").entered();

        // Work on the same queue is already ordered.
        let waits: Vec<(RawQueue, u64)> = waits
            .iter()
            .filter(|index| index.queue != self.raw)
            .map(|index| (index.queue, index.value))
            .collect();

        let mut submissions = self.submissions.lock();
        let value = submissions.next_value;

        self.driver.submit(
            self.raw,
            &SubmitBatch {
                command_buffers,
                waits: &waits,
                signal: value,
            },
        )?;

        submissions.next_value += 1;
        submissions.in_flight.push_back(InFlight {
            value,
            command_buffers: command_buffers.to_vec(),
        });
        self.last_submitted.store(value, Ordering::Release);
        self.statistics.submissions.increment();

        Ok(SubmissionIndex::new(self.raw, value))
    }

    /// Returns the highest value the queue has signaled.
    pub fn signaled(&self) -> u64 {
        match self.driver.completed_value(self.raw) {
            Ok(value) => {
                // The counter never goes backwards, even if the driver reports an older value
                // from a racing call.
                self.signaled.fetch_max(value, Ordering::AcqRel).max(value)
            }
            Err(err) => {
                tracing::error!("failed to query queue {:?} progress: {}", self.raw, err);
                self.signaled.load(Ordering::Acquire)
            }
        }
    }

    /// Returns `true` if the submission has completed.
    ///
    /// # Panics
    ///
    /// Panics if `index` belongs to a different queue.
    pub fn is_complete(&self, index: SubmissionIndex) -> bool {
        assert_eq!(
            index.queue, self.raw,
            "submission index belongs to a different queue"
        );

        if self.signaled.load(Ordering::Acquire) >= index.value {
            return true;
        }

        self.signaled() >= index.value
    }

    /// Returns the most recent submission, or a value of `0` if nothing was submitted yet.
    pub fn last_submitted(&self) -> SubmissionIndex {
        SubmissionIndex::new(self.raw, self.last_submitted.load(Ordering::Acquire))
    }

    /// Blocks until the submission has completed.
    pub fn wait(&self, index: SubmissionIndex) -> Result<(), Error> {
        let _span = trace_span!("Queue::wait").entered();

        if self.is_complete(index) {
            return Ok(());
        }

        self.driver.wait(self.raw, index.value)?;
        self.signaled.fetch_max(index.value, Ordering::AcqRel);
        Ok(())
    }

    /// Blocks until all submitted work has completed.
    pub fn wait_idle(&self) -> Result<(), Error> {
        let _span = trace_span!("Queue::wait_idle").entered();

        let last = self.last_submitted();
        self.driver.wait_idle(self.raw)?;
        self.signaled.fetch_max(last.value, Ordering::AcqRel);
        self.retire();
        Ok(())
    }

    /// Removes completed batches from the in-flight list.
    ///
    /// Returns the number of retired batches.
    pub fn retire(&self) -> usize {
        let signaled = self.signaled();

        let mut submissions = self.submissions.lock();
        let mut count = 0;
        while submissions
            .in_flight
            .front()
            .is_some_and(|batch| batch.value <= signaled)
        {
            submissions.in_flight.pop_front();
            count += 1;
        }

        count
    }

    /// Returns the number of command buffers in batches not yet observed as complete.
    pub fn in_flight(&self) -> usize {
        self.submissions
            .lock()
            .in_flight
            .iter()
            .map(|batch| batch.command_buffers.len())
            .sum()
    }
}

/// The queues of a device, one per [`QueueType`].
///
/// Queue types without a dedicated hardware queue share the graphics queue.
#[derive(Clone, Debug)]
pub(crate) struct Queues {
    graphics: Arc<Queue>,
    compute: Arc<Queue>,
    transfer: Arc<Queue>,
}

impl Queues {
    pub(crate) fn new(
        driver: &Arc<dyn Driver>,
        statistics: &Arc<Statistics>,
        config: &DeviceConfig,
    ) -> Result<(Self, DeviceCapabilities), Error> {
        let families = driver.queue_families();

        let Some(graphics_family) = families
            .iter()
            .find(|family| family.capabilities.contains(QueueCapabilities::GRAPHICS))
        else {
            return Err(Error::Unsupported("adapter has no graphics queue"));
        };

        let dedicated = |required: QueueCapabilities, excluded: QueueCapabilities| {
            families
                .iter()
                .filter(|family| family.id != graphics_family.id)
                .filter(|family| family.capabilities.contains(required))
                // Prefer the family with the fewest other capabilities, it is most likely to
                // be backed by dedicated hardware.
                .min_by_key(|family| (family.capabilities & excluded).bits().count_ones())
                .copied()
        };

        let compute_family = config
            .use_async_compute
            .then(|| dedicated(QueueCapabilities::COMPUTE, QueueCapabilities::GRAPHICS))
            .flatten();
        let transfer_family = config
            .use_transfer_queue
            .then(|| {
                dedicated(
                    QueueCapabilities::TRANSFER,
                    QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE,
                )
            })
            .flatten()
            .filter(|family| compute_family.map_or(true, |compute| compute.id != family.id));

        let graphics = Arc::new(Queue::new(
            driver.clone(),
            statistics.clone(),
            QueueType::Graphics,
            graphics_family.id,
        )?);

        let compute = match compute_family {
            Some(family) => Arc::new(Queue::new(
                driver.clone(),
                statistics.clone(),
                QueueType::Compute,
                family.id,
            )?),
            None => graphics.clone(),
        };

        let transfer = match transfer_family {
            Some(family) => Arc::new(Queue::new(
                driver.clone(),
                statistics.clone(),
                QueueType::Transfer,
                family.id,
            )?),
            None => graphics.clone(),
        };

        let capabilities = DeviceCapabilities {
            async_compute: compute_family.is_some(),
            dedicated_transfer: transfer_family.is_some(),
        };

        Ok((
            Self {
                graphics,
                compute,
                transfer,
            },
            capabilities,
        ))
    }

    pub(crate) fn get(&self, ty: QueueType) -> &Arc<Queue> {
        match ty {
            QueueType::Graphics => &self.graphics,
            QueueType::Compute => &self.compute,
            QueueType::Transfer => &self.transfer,
        }
    }

    /// Returns every distinct hardware queue once.
    pub(crate) fn unique(&self) -> impl Iterator<Item = &Arc<Queue>> + '_ {
        let compute = (!Arc::ptr_eq(&self.compute, &self.graphics)).then_some(&self.compute);
        let transfer = (!Arc::ptr_eq(&self.transfer, &self.graphics)
            && !Arc::ptr_eq(&self.transfer, &self.compute))
        .then_some(&self.transfer);

        std::iter::once(&self.graphics).chain(compute).chain(transfer)
    }

    pub(crate) fn find(&self, raw: RawQueue) -> Option<&Arc<Queue>> {
        self.unique().find(|queue| queue.raw == raw)
    }

    /// Returns `true` if the submission has completed. Indices of unknown queues are treated as
    /// complete.
    pub(crate) fn is_complete(&self, index: SubmissionIndex) -> bool {
        match self.find(index.queue) {
            Some(queue) => queue.is_complete(index),
            None => true,
        }
    }

    /// Returns the latest submission of every queue.
    pub(crate) fn last_submitted(&self) -> Vec<SubmissionIndex> {
        self.unique()
            .map(|queue| queue.last_submitted())
            .filter(|index| index.value != 0)
            .collect()
    }

    pub(crate) fn wait_idle(&self) -> Result<(), Error> {
        for queue in self.unique() {
            queue.wait_idle()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::null::{Completion, NullAdapter, NullDriver};
    use crate::backend::Driver;
    use crate::config::DeviceConfig;
    use crate::statistics::Statistics;

    use super::{QueueType, Queues};

    fn queues(adapter: NullAdapter, config: &DeviceConfig) -> (Arc<NullDriver>, Queues) {
        let driver = Arc::new(NullDriver::new(adapter));
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let (queues, _) =
            Queues::new(&dyn_driver, &Arc::new(Statistics::default()), config).unwrap();
        (driver, queues)
    }

    #[test]
    fn dedicated_queues() {
        let (_, queues) = queues(NullAdapter::discrete(), &DeviceConfig::default());

        assert_eq!(queues.get(QueueType::Graphics).ty(), QueueType::Graphics);
        assert_eq!(queues.get(QueueType::Compute).ty(), QueueType::Compute);
        assert_eq!(queues.get(QueueType::Transfer).ty(), QueueType::Transfer);
        assert_eq!(queues.unique().count(), 3);
    }

    #[test]
    fn missing_queues_fall_back_to_graphics() {
        let (_, queues) = queues(NullAdapter::integrated(), &DeviceConfig::default());

        assert_eq!(queues.get(QueueType::Transfer).ty(), QueueType::Graphics);
        assert_eq!(queues.get(QueueType::Compute).ty(), QueueType::Graphics);
        assert_eq!(queues.unique().count(), 1);
    }

    #[test]
    fn disabled_transfer_queue() {
        let config = DeviceConfig {
            use_transfer_queue: false,
            ..Default::default()
        };
        let (_, queues) = queues(NullAdapter::discrete(), &config);

        assert_eq!(queues.get(QueueType::Transfer).ty(), QueueType::Graphics);
        assert_eq!(queues.get(QueueType::Compute).ty(), QueueType::Compute);
    }

    #[test]
    fn signaled_counter_is_monotonic() {
        let adapter = NullAdapter {
            completion: Completion::Manual,
            ..NullAdapter::integrated()
        };
        let (driver, queues) = queues(adapter, &DeviceConfig::default());
        let queue = queues.get(QueueType::Graphics);

        let first = queue.submit(&[], &[]).unwrap();
        let second = queue.submit(&[], &[]).unwrap();
        assert!(first.value() < second.value());
        assert_eq!(queue.last_submitted(), second);

        assert!(!queue.is_complete(first));
        assert_eq!(queue.in_flight(), 0);

        driver.complete_up_to(queue.raw(), first.value());
        assert!(queue.is_complete(first));
        assert!(!queue.is_complete(second));
        assert_eq!(queue.retire(), 1);

        driver.complete_all();
        assert!(queue.is_complete(second));
        assert_eq!(queue.signaled(), second.value());
    }

    #[test]
    fn wait_idle_completes_everything() {
        let adapter = NullAdapter {
            completion: Completion::Manual,
            ..NullAdapter::integrated()
        };
        let (_, queues) = queues(adapter, &DeviceConfig::default());
        let queue = queues.get(QueueType::Graphics);

        let index = queue.submit(&[], &[]).unwrap();
        queues.wait_idle().unwrap();
        assert!(queue.is_complete(index));
    }
}
