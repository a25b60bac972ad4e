//! Dependency graphs of operations across queues.
//!
//! A builder in this module allocates the resources of a test, builds and records its
//! operations, and produces a [`SubmissionPlan`]: one [`PlannedSubmission`] per batch, with the
//! semaphore waits and signals that encode the expected ordering. The plan lists submissions in
//! dependency order; the [`schedule`] module decides the order in which they are actually handed
//! to the queues.
//!
//! [`schedule`]: crate::schedule

pub use self::{
    chain::Chain,
    fan_out::FanOut,
    implicit::{ImplicitShape, SubmitInfoCombinatorics},
};
use crate::{
    context::{Queue, TestContext},
    operation::{OperationName, OperationSupport, COPY_OPERATIONS},
    provider::{DependencyInfo, Provider},
    resource::{Resource, ResourceDescription, ResourceHandle},
    sync::{self, SemaphoreKind, SyncInfo, SynchronizationType},
    Result, TestError,
};
use ash::vk;
use foldhash::HashMap;
use smallvec::SmallVec;

pub mod chain;
pub mod fan_out;
pub mod implicit;

type NodeIndex = usize;

/// A wait or signal of one of the semaphores of a plan. `value` is 0 for binary semaphores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SemaphoreRef {
    pub semaphore: usize,
    pub value: u64,
}

impl SemaphoreRef {
    #[inline]
    pub const fn new(semaphore: usize, value: u64) -> Self {
        SemaphoreRef { semaphore, value }
    }
}

/// One batch of a plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedSubmission {
    pub queue: Queue,
    pub command_buffers: SmallVec<[vk::CommandBuffer; 1]>,
    pub waits: SmallVec<[SemaphoreRef; 2]>,
    pub signals: SmallVec<[SemaphoreRef; 2]>,
}

/// The submissions of a test, in dependency order, plus the values the host signals once
/// everything has been submitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmissionPlan {
    pub semaphore_kind: Option<SemaphoreKind>,
    pub submissions: Vec<PlannedSubmission>,
    pub host_signals: Vec<SemaphoreRef>,
}

impl SubmissionPlan {
    pub fn new(semaphore_kind: SemaphoreKind) -> Self {
        SubmissionPlan {
            semaphore_kind: Some(semaphore_kind),
            submissions: Vec::new(),
            host_signals: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.submissions.len()
    }

    /// Returns, for every submission, the submissions whose signals its waits are satisfied
    /// by.
    ///
    /// A binary wait depends on the submission that signals the same semaphore. A timeline wait
    /// for `v` depends on the submission with the smallest signal value that is at least `v`;
    /// if that signal comes from the host, the wait has no submission dependency.
    pub fn in_edges(&self) -> Vec<SmallVec<[NodeIndex; 2]>> {
        let mut signals: HashMap<usize, Vec<(u64, Option<NodeIndex>)>> = HashMap::default();

        for (index, submission) in self.submissions.iter().enumerate() {
            for signal in &submission.signals {
                signals
                    .entry(signal.semaphore)
                    .or_default()
                    .push((signal.value, Some(index)));
            }
        }

        for signal in &self.host_signals {
            signals
                .entry(signal.semaphore)
                .or_default()
                .push((signal.value, None));
        }

        self.submissions
            .iter()
            .enumerate()
            .map(|(index, submission)| {
                let mut in_edges = SmallVec::new();

                for wait in &submission.waits {
                    let Some(candidates) = signals.get(&wait.semaphore) else {
                        continue;
                    };

                    let producer = candidates
                        .iter()
                        .filter(|(value, _)| *value >= wait.value)
                        .min_by_key(|(value, _)| *value)
                        .and_then(|(_, producer)| *producer);

                    if let Some(producer) = producer {
                        if producer != index && !in_edges.contains(&producer) {
                            in_edges.push(producer);
                        }
                    }
                }

                in_edges
            })
            .collect()
    }

    /// Checks that every wait of the plan is satisfiable when the submissions are handed to
    /// the device in the listed order. A violation is a harness bug.
    ///
    /// Timeline plans need, for every wait, a signal of at least the waited value, and every
    /// submission must signal values greater than the ones it waits for on the same semaphore.
    /// Binary plans need exactly one signal per semaphore, submitted before its only wait.
    pub fn validate_edges(&self) -> Result {
        match self.semaphore_kind {
            Some(SemaphoreKind::Timeline) => self.validate_timeline_edges(),
            Some(SemaphoreKind::Binary) => self.validate_binary_edges(),
            None => Err(TestError::harness("a plan was built without a semaphore kind")),
        }
    }

    fn validate_timeline_edges(&self) -> Result {
        let mut max_signals: HashMap<usize, u64> = HashMap::default();
        let all_signals = self
            .submissions
            .iter()
            .flat_map(|submission| &submission.signals)
            .chain(&self.host_signals);

        for signal in all_signals {
            if signal.value == 0 {
                return Err(TestError::harness(format!(
                    "semaphore {} is signaled with timeline value 0",
                    signal.semaphore,
                )));
            }

            let max = max_signals.entry(signal.semaphore).or_default();
            *max = (*max).max(signal.value);
        }

        for (index, submission) in self.submissions.iter().enumerate() {
            for wait in &submission.waits {
                let max_signal = max_signals.get(&wait.semaphore).copied().unwrap_or(0);

                if wait.value == 0 || wait.value > max_signal {
                    return Err(TestError::harness(format!(
                        "submission {index} waits for value {} of semaphore {}, which is never \
                        signaled",
                        wait.value, wait.semaphore,
                    )));
                }

                for signal in &submission.signals {
                    if signal.semaphore == wait.semaphore && signal.value <= wait.value {
                        return Err(TestError::harness(format!(
                            "submission {index} signals value {} of semaphore {} after \
                            waiting for value {}",
                            signal.value, signal.semaphore, wait.value,
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_binary_edges(&self) -> Result {
        if !self.host_signals.is_empty() {
            return Err(TestError::harness("binary semaphores can't be signaled by the host"));
        }

        let mut signaled_by: HashMap<usize, NodeIndex> = HashMap::default();
        let mut waited_by: HashMap<usize, NodeIndex> = HashMap::default();

        for (index, submission) in self.submissions.iter().enumerate() {
            for wait in &submission.waits {
                if wait.value != 0 {
                    return Err(TestError::harness(format!(
                        "submission {index} waits for a binary semaphore with value {}",
                        wait.value,
                    )));
                }

                if !signaled_by.contains_key(&wait.semaphore) {
                    return Err(TestError::harness(format!(
                        "submission {index} waits for binary semaphore {} before it's signaled",
                        wait.semaphore,
                    )));
                }

                if let Some(other) = waited_by.insert(wait.semaphore, index) {
                    return Err(TestError::harness(format!(
                        "binary semaphore {} is waited for by submissions {other} and {index}",
                        wait.semaphore,
                    )));
                }
            }

            for signal in &submission.signals {
                if signal.value != 0 {
                    return Err(TestError::harness(format!(
                        "submission {index} signals a binary semaphore with value {}",
                        signal.value,
                    )));
                }

                if let Some(other) = signaled_by.insert(signal.semaphore, index) {
                    return Err(TestError::harness(format!(
                        "binary semaphore {} is signaled by submissions {other} and {index}",
                        signal.semaphore,
                    )));
                }
            }
        }

        Ok(())
    }
}

/// A resource handed from a producer operation to a consumer operation, possibly on another
/// queue family.
///
/// With exclusive sharing across families, the producer's command buffer releases ownership of
/// the resource and the consumer's command buffer acquires it. Otherwise a single barrier in
/// the producer's command buffer covers the dependency.
#[derive(Debug)]
pub(crate) struct Handoff<'a> {
    pub resource: &'a Resource,
    pub producer_out: SyncInfo,
    pub consumer_in: SyncInfo,
    pub src_family: u32,
    pub dst_family: u32,
    pub concurrent: bool,
}

impl Handoff<'_> {
    #[inline]
    fn transfers_ownership(&self) -> bool {
        self.src_family != self.dst_family && !self.concurrent
    }

    /// Records the producer side of the handoff.
    pub(crate) fn record_release(
        &self,
        provider: &dyn Provider,
        sync_type: SynchronizationType,
        command_buffer: vk::CommandBuffer,
    ) {
        if self.transfers_ownership() {
            let dst = SyncInfo {
                image_layout: self.consumer_in.image_layout,
                ..SyncInfo::EMPTY
            };

            self.record(
                provider,
                sync_type,
                command_buffer,
                &self.producer_out,
                &dst,
                (self.src_family, self.dst_family),
            );
        } else {
            self.record(
                provider,
                sync_type,
                command_buffer,
                &self.producer_out,
                &self.consumer_in,
                (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
            );
        }
    }

    /// Records the consumer side of the handoff. Does nothing unless ownership is transferred.
    pub(crate) fn record_acquire(
        &self,
        provider: &dyn Provider,
        sync_type: SynchronizationType,
        command_buffer: vk::CommandBuffer,
    ) {
        if self.transfers_ownership() {
            let src = SyncInfo {
                image_layout: self.producer_out.image_layout,
                ..SyncInfo::EMPTY
            };

            self.record(
                provider,
                sync_type,
                command_buffer,
                &src,
                &self.consumer_in,
                (self.src_family, self.dst_family),
            );
        }
    }

    fn record(
        &self,
        provider: &dyn Provider,
        sync_type: SynchronizationType,
        command_buffer: vk::CommandBuffer,
        src: &SyncInfo,
        dst: &SyncInfo,
        (src_family, dst_family): (u32, u32),
    ) {
        match self.resource.handle() {
            ResourceHandle::Buffer(buffer) => {
                let mut barrier = sync::buffer_barrier(src, dst, buffer);
                barrier.src_queue_family_index = src_family;
                barrier.dst_queue_family_index = dst_family;

                sync::cmd_pipeline_barrier(
                    provider,
                    sync_type,
                    command_buffer,
                    &DependencyInfo {
                        buffer_memory_barriers: &[barrier],
                        ..Default::default()
                    },
                );
            }
            ResourceHandle::Image(image) => {
                let mut barrier = sync::image_barrier(src, dst, image);
                barrier.src_queue_family_index = src_family;
                barrier.dst_queue_family_index = dst_family;

                sync::cmd_pipeline_barrier(
                    provider,
                    sync_type,
                    command_buffer,
                    &DependencyInfo {
                        image_memory_barriers: &[barrier],
                        ..Default::default()
                    },
                );
            }
        }
    }
}

/// Looks up a write or read operation for `desc` and checks that `queue` can run it.
pub(crate) fn support_on_queue(
    context: &TestContext,
    name: OperationName,
    desc: &ResourceDescription,
    queue: &Queue,
) -> Result<OperationSupport> {
    let support = name.support(desc)?;
    support.check_support(&**context.provider())?;

    if !queue.supports(support.queue_flags()) {
        return Err(TestError::not_supported(format!(
            "No queue supporting {:?} for `{name}`",
            support.queue_flags(),
        )));
    }

    Ok(support)
}

/// Picks the first copy operation, starting at `*next` and wrapping around, that can copy
/// `desc` on `queue`. On success `*next` is moved past the picked operation.
pub(crate) fn pick_copy_operation(
    context: &TestContext,
    desc: &ResourceDescription,
    queue: &Queue,
    next: &mut usize,
) -> Option<OperationSupport> {
    let count = COPY_OPERATIONS.len();

    for offset in 0..count {
        let index = (*next + offset) % count;
        let Ok(support) = COPY_OPERATIONS[index].support(desc) else {
            continue;
        };

        if queue.supports(support.queue_flags())
            && support.check_support(&**context.provider()).is_ok()
        {
            *next = (index + 1) % count;

            return Some(support);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn queue() -> Queue {
        Queue {
            handle: vk::Queue::null(),
            family_index: 0,
            index: 0,
            flags: vk::QueueFlags::GRAPHICS,
        }
    }

    fn submission(waits: &[(usize, u64)], signals: &[(usize, u64)]) -> PlannedSubmission {
        PlannedSubmission {
            queue: queue(),
            command_buffers: smallvec![vk::CommandBuffer::null()],
            waits: waits.iter().map(|&(s, v)| SemaphoreRef::new(s, v)).collect(),
            signals: signals.iter().map(|&(s, v)| SemaphoreRef::new(s, v)).collect(),
        }
    }

    #[test]
    fn timeline_chain_is_valid() {
        let mut plan = SubmissionPlan::new(SemaphoreKind::Timeline);
        plan.submissions = vec![
            submission(&[(0, 5)], &[(0, 12)]),
            submission(&[(0, 12)], &[(0, 40)]),
            submission(&[(0, 40)], &[]),
        ];
        plan.host_signals = vec![SemaphoreRef::new(0, 5)];

        assert_eq!(plan.validate_edges(), Ok(()));
        assert_eq!(
            plan.in_edges(),
            [smallvec![], smallvec![0], smallvec![1]] as [SmallVec<[usize; 2]>; 3],
        );
    }

    #[test]
    fn timeline_wait_without_signal() {
        let mut plan = SubmissionPlan::new(SemaphoreKind::Timeline);
        plan.submissions = vec![submission(&[(0, 5)], &[(0, 12)])];

        assert!(matches!(plan.validate_edges(), Err(TestError::Harness(_))));
    }

    #[test]
    fn timeline_signal_below_wait() {
        let mut plan = SubmissionPlan::new(SemaphoreKind::Timeline);
        plan.submissions = vec![submission(&[(0, 5)], &[(0, 5)])];
        plan.host_signals = vec![SemaphoreRef::new(0, 5)];

        assert!(matches!(plan.validate_edges(), Err(TestError::Harness(_))));
    }

    #[test]
    fn binary_signal_must_come_first() {
        let mut plan = SubmissionPlan::new(SemaphoreKind::Binary);
        plan.submissions = vec![submission(&[], &[(0, 0)]), submission(&[(0, 0)], &[])];

        assert_eq!(plan.validate_edges(), Ok(()));
        assert_eq!(plan.in_edges()[1].as_slice(), [0]);

        plan.submissions.reverse();

        assert!(matches!(plan.validate_edges(), Err(TestError::Harness(_))));
    }

    #[test]
    fn binary_semaphores_are_single_use() {
        let mut plan = SubmissionPlan::new(SemaphoreKind::Binary);
        plan.submissions = vec![
            submission(&[], &[(0, 0)]),
            submission(&[(0, 0)], &[]),
            submission(&[(0, 0)], &[]),
        ];

        assert!(matches!(plan.validate_edges(), Err(TestError::Harness(_))));
    }
}
