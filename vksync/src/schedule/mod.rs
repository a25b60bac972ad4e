//! Submission of built work to the device, and the test families that are mostly about
//! ordering.
//!
//! A [`SubmissionPlan`] lists its submissions in dependency order. [`SubmissionOrder`] decides
//! the order in which they are actually handed to the queues: forward, reversed (consumers
//! before producers, the wait-before-signal scenario) or a seeded shuffle in between. Any order
//! other than forward needs timeline semaphores, because a binary semaphore wait must be
//! submitted after its signal.
//!
//! Reordering never breaks a queue's FIFO: a submission is only handed to a queue once every
//! submission it transitively depends on and that runs on the same queue has been handed over,
//! and never when doing so would make the queue's order contradict a semaphore dependency.

use crate::{
    graph::{Handoff, PlannedSubmission, SemaphoreRef, SubmissionPlan},
    operation::{Operation, OperationContext, OperationSupport},
    provider::Provider,
    resource::Resource,
    sync::{self, Semaphore, SemaphoreKind, SynchronizationType, SynchronizationWrapper},
    verify, ProviderResultExt, Result, TestError,
};
use ash::vk;
use foldhash::HashMap;
use log::{debug, error};
use rand::{rngs::StdRng, Rng, SeedableRng};
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

pub mod device_host;
pub mod events;
pub mod signal_order;
pub mod timeline;

/// The order in which the submissions of a plan are handed to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubmissionOrder {
    /// Dependency order: every producer is submitted before its consumers.
    Forward,

    /// As close to the reverse of dependency order as the queues allow.
    Reverse,

    /// A seeded random order that respects the queues.
    Shuffled { seed: u64 },
}

impl SubmissionOrder {
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            SubmissionOrder::Forward => "forward",
            SubmissionOrder::Reverse => "reverse",
            SubmissionOrder::Shuffled { .. } => "shuffled",
        }
    }

    /// Returns the indices of the submissions of `plan` in the order they are to be submitted.
    pub fn arrange(self, plan: &SubmissionPlan) -> Result<Vec<usize>> {
        let len = plan.len();

        if self == SubmissionOrder::Forward {
            return Ok((0..len).collect());
        }

        if plan.semaphore_kind != Some(SemaphoreKind::Timeline) {
            return Err(TestError::harness(format!(
                "{} submission order needs timeline semaphores",
                self.name(),
            )));
        }

        let mut arranger = Arranger::new(plan);
        let mut rng = match self {
            SubmissionOrder::Shuffled { seed } => Some(StdRng::seed_from_u64(seed)),
            _ => None,
        };
        let mut order = Vec::with_capacity(len);
        let mut candidates = Vec::with_capacity(len);

        while order.len() < len {
            candidates.clear();
            candidates.extend((0..len).filter(|&index| arranger.is_admissible(index)));

            let picked = match (&mut rng, candidates.last()) {
                (_, None) => {
                    return Err(TestError::harness(format!(
                        "no submission can be handed to the device after {order:?} without \
                        deadlocking a queue",
                    )));
                }
                (Some(rng), Some(_)) => candidates[rng.gen_range(0..candidates.len())],
                (None, Some(&last)) => last,
            };

            arranger.emit(picked);
            order.push(picked);
        }

        Ok(order)
    }
}

impl fmt::Display for SubmissionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type QueueKey = (u32, u32);

// The state of an arrangement in progress.
struct Arranger {
    queues: Vec<QueueKey>,
    ancestors: Vec<Vec<usize>>,
    consumers: Vec<SmallVec<[usize; 2]>>,
    emitted: Vec<bool>,
    // For every emitted submission, the one emitted right after it on the same queue.
    fifo_successor: Vec<Option<usize>>,
    last_on_queue: HashMap<QueueKey, usize>,
}

impl Arranger {
    fn new(plan: &SubmissionPlan) -> Self {
        let len = plan.len();
        let in_edges = plan.in_edges();
        let mut consumers = vec![SmallVec::new(); len];

        for (consumer, producers) in in_edges.iter().enumerate() {
            for &producer in producers {
                consumers[producer].push(consumer);
            }
        }

        let ancestors = (0..len)
            .map(|index| {
                let mut visited = vec![false; len];
                let mut stack: Vec<usize> = in_edges[index].to_vec();
                let mut ancestors = Vec::new();

                while let Some(node) = stack.pop() {
                    if visited[node] || node == index {
                        continue;
                    }

                    visited[node] = true;
                    ancestors.push(node);
                    stack.extend_from_slice(&in_edges[node]);
                }

                ancestors
            })
            .collect();

        Arranger {
            queues: plan
                .submissions
                .iter()
                .map(|submission| (submission.queue.family_index, submission.queue.index))
                .collect(),
            ancestors,
            consumers,
            emitted: vec![false; len],
            fifo_successor: vec![None; len],
            last_on_queue: HashMap::default(),
        }
    }

    fn is_admissible(&self, index: usize) -> bool {
        if self.emitted[index] {
            return false;
        }

        let queue = self.queues[index];

        if self.ancestors[index]
            .iter()
            .any(|&ancestor| self.queues[ancestor] == queue && !self.emitted[ancestor])
        {
            return false;
        }

        // Queuing `index` behind the last submission of its queue makes that submission a
        // prerequisite of `index`, which deadlocks if `index` is a prerequisite of it.
        match self.last_on_queue.get(&queue) {
            Some(&last) => !self.reaches(index, last),
            None => true,
        }
    }

    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut visited = vec![false; self.emitted.len()];
        let mut stack = vec![from];

        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }

            if visited[node] {
                continue;
            }

            visited[node] = true;
            stack.extend_from_slice(&self.consumers[node]);
            stack.extend(self.fifo_successor[node]);
        }

        false
    }

    fn emit(&mut self, index: usize) {
        let queue = self.queues[index];

        if let Some(last) = self.last_on_queue.insert(queue, index) {
            self.fifo_successor[last] = Some(index);
        }

        self.emitted[index] = true;
    }
}

/// Hands every submission of `plan` to its queue in the given order, one `queue_submit` per
/// submission, then performs the plan's host signals.
///
/// `semaphores` is indexed by the semaphore numbers of the plan. The plan is validated first;
/// nothing is submitted if it's malformed.
pub fn submit_plan(
    provider: &Arc<dyn Provider>,
    sync_type: SynchronizationType,
    plan: &SubmissionPlan,
    semaphores: &[Semaphore],
    order: SubmissionOrder,
) -> Result {
    plan.validate_edges()?;

    let Some(kind) = plan.semaphore_kind else {
        return Err(TestError::harness("a plan was built without a semaphore kind"));
    };
    let is_timeline = kind.is_timeline();
    let arrangement = order.arrange(plan)?;

    debug!(
        "submitting {} submission(s) in {order} order: {arrangement:?}",
        plan.len(),
    );

    let mut wrapper = SynchronizationWrapper::new(provider, sync_type, is_timeline, 1)?;

    for index in arrangement {
        let submission = &plan.submissions[index];

        add_planned_submission(&mut wrapper, submission, semaphores, is_timeline)?;
        wrapper.queue_submit(submission.queue.handle, vk::Fence::null())?;
    }

    host_signals(plan, semaphores)
}

/// Hands every submission of `plan` to the device in one `queue_submit`, in the listed order,
/// then performs the plan's host signals. `fence` is signaled once all of them have executed.
///
/// All the submissions must be on the same queue.
pub fn submit_plan_batched(
    provider: &Arc<dyn Provider>,
    sync_type: SynchronizationType,
    plan: &SubmissionPlan,
    semaphores: &[Semaphore],
    fence: vk::Fence,
) -> Result {
    plan.validate_edges()?;

    let Some(kind) = plan.semaphore_kind else {
        return Err(TestError::harness("a plan was built without a semaphore kind"));
    };
    let Some(first) = plan.submissions.first() else {
        return Err(TestError::harness("a batched plan needs at least one submission"));
    };

    if plan.submissions.iter().any(|submission| submission.queue != first.queue) {
        return Err(TestError::harness(
            "the submissions of a batched plan must all be on one queue",
        ));
    }

    let is_timeline = kind.is_timeline();
    let mut wrapper =
        SynchronizationWrapper::new(provider, sync_type, is_timeline, plan.submissions.len())?;

    for submission in &plan.submissions {
        add_planned_submission(&mut wrapper, submission, semaphores, is_timeline)?;
    }

    debug!(
        "submitting {} submit info(s) in one batch",
        wrapper.submit_info_count(),
    );
    wrapper.queue_submit(first.queue.handle, fence)?;

    host_signals(plan, semaphores)
}

fn plan_semaphore(semaphores: &[Semaphore], index: usize) -> Result<&Semaphore> {
    semaphores.get(index).ok_or_else(|| {
        TestError::harness(format!(
            "the plan refers to semaphore {index} but only {} were created",
            semaphores.len(),
        ))
    })
}

fn add_planned_submission(
    wrapper: &mut SynchronizationWrapper,
    submission: &PlannedSubmission,
    semaphores: &[Semaphore],
    is_timeline: bool,
) -> Result {
    let semaphore_infos = |refs: &[SemaphoreRef]| {
        refs.iter()
            .map(|semaphore_ref| {
                Ok(sync::semaphore_submit_info(
                    plan_semaphore(semaphores, semaphore_ref.semaphore)?.handle(),
                    semaphore_ref.value,
                    vk::PipelineStageFlags2::ALL_COMMANDS,
                ))
            })
            .collect::<Result<SmallVec<[_; 2]>>>()
    };
    let command_buffers = submission
        .command_buffers
        .iter()
        .map(|&command_buffer| sync::command_buffer_submit_info(command_buffer))
        .collect::<SmallVec<[_; 1]>>();

    wrapper.add_submit_info(
        &semaphore_infos(&submission.waits)?,
        &command_buffers,
        &semaphore_infos(&submission.signals)?,
        is_timeline,
        is_timeline,
    )
}

fn host_signals(plan: &SubmissionPlan, semaphores: &[Semaphore]) -> Result {
    for signal in &plan.host_signals {
        debug!(
            "host signal of semaphore {} to {}",
            signal.semaphore, signal.value,
        );
        plan_semaphore(semaphores, signal.semaphore)?.signal(signal.value)?;
    }

    Ok(())
}

/// A write and a read operation on a resource of their own.
#[derive(Debug)]
pub(crate) struct ReadWritePair {
    pub write: Operation,
    pub read: Operation,
    pub resource: Resource,
}

impl ReadWritePair {
    /// Creates the resource with the usage both operations need, shared by `families`, and
    /// builds the operations against it.
    pub(crate) fn new(
        operations: &OperationContext,
        write: &OperationSupport,
        read: &OperationSupport,
        families: &[u32],
    ) -> Result<Self> {
        let resource = Resource::new(
            operations.provider(),
            write.resource(),
            write.out_usage() | read.in_usage(),
            families,
        )?;
        let write = write.build(operations, &resource)?;
        let read = read.build(operations, &resource)?;

        Ok(ReadWritePair {
            write,
            read,
            resource,
        })
    }

    /// Records the write, followed by a barrier that makes its result available to the read.
    pub(crate) fn record_write(
        &self,
        sync_type: SynchronizationType,
        command_buffer: vk::CommandBuffer,
    ) -> Result {
        self.write.record_commands(command_buffer)?;

        Handoff {
            resource: &self.resource,
            producer_out: self.write.out_sync_info(),
            consumer_in: self.read.in_sync_info(),
            src_family: vk::QUEUE_FAMILY_IGNORED,
            dst_family: vk::QUEUE_FAMILY_IGNORED,
            concurrent: true,
        }
        .record_release(&**self.resource.provider(), sync_type, command_buffer);

        Ok(())
    }

    /// Compares what the read observed with what the write wrote.
    pub(crate) fn verify(&self) -> Result {
        let expected = self.write.get_data()?;
        let actual = self.read.get_data()?;

        verify::compare(self.resource.kind(), &expected, &actual)?;

        Ok(())
    }
}

/// Returns `families` without duplicates, in order.
pub(crate) fn distinct_families(families: impl IntoIterator<Item = u32>) -> SmallVec<[u32; 4]> {
    let mut distinct = SmallVec::new();

    for family in families {
        if !distinct.contains(&family) {
            distinct.push(family);
        }
    }

    distinct
}

/// Waits for the device to go idle when dropped.
///
/// A test declares the guard after the objects it submits work against, so that the guard is
/// dropped first and nothing is destroyed while the device may still use it, including when
/// the test bails out early with an error.
#[must_use]
pub struct IdleGuard {
    provider: Arc<dyn Provider>,
}

impl IdleGuard {
    #[inline]
    pub fn new(provider: &Arc<dyn Provider>) -> Self {
        IdleGuard {
            provider: provider.clone(),
        }
    }

    /// Waits for the device to go idle now, reporting the error instead of logging it.
    #[inline]
    pub fn wait_idle(&self) -> Result {
        self.provider
            .device_wait_idle()
            .checked("vkDeviceWaitIdle")
    }
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        if let Err(result) = self.provider.device_wait_idle() {
            error!("`vkDeviceWaitIdle` failed during teardown: {result}");
        }
    }
}

impl fmt::Debug for IdleGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Queue;
    use smallvec::smallvec;

    fn queue(index: u32) -> Queue {
        Queue {
            handle: vk::Queue::null(),
            family_index: 0,
            index,
            flags: vk::QueueFlags::GRAPHICS,
        }
    }

    // A timeline chain where submission `i` waits for value `i + 1` and signals `i + 2`.
    fn chain(queues: &[u32]) -> SubmissionPlan {
        let mut plan = SubmissionPlan::new(SemaphoreKind::Timeline);

        for (index, &queue_index) in queues.iter().enumerate() {
            let value = index as u64 + 1;

            plan.submissions.push(PlannedSubmission {
                queue: queue(queue_index),
                command_buffers: smallvec![vk::CommandBuffer::null()],
                waits: [SemaphoreRef::new(0, value)].into_iter().collect(),
                signals: (index + 1 < queues.len())
                    .then_some(SemaphoreRef::new(0, value + 1))
                    .into_iter()
                    .collect(),
            });
        }

        plan.host_signals.push(SemaphoreRef::new(0, 1));

        plan
    }

    #[test]
    fn reverse_on_distinct_queues() {
        let plan = chain(&[0, 1, 2]);

        assert_eq!(SubmissionOrder::Forward.arrange(&plan), Ok(vec![0, 1, 2]));
        assert_eq!(SubmissionOrder::Reverse.arrange(&plan), Ok(vec![2, 1, 0]));
    }

    #[test]
    fn reverse_keeps_queue_order() {
        // Write and read share a queue, the copies each have their own.
        let plan = chain(&[0, 1, 2, 3, 0]);

        assert_eq!(
            SubmissionOrder::Reverse.arrange(&plan),
            Ok(vec![3, 2, 1, 0, 4]),
        );
    }

    #[test]
    fn single_queue_is_forward() {
        let plan = chain(&[0, 0, 0]);

        assert_eq!(SubmissionOrder::Reverse.arrange(&plan), Ok(vec![0, 1, 2]));
    }

    #[test]
    fn shuffle_is_seeded_and_valid() {
        let plan = chain(&[0, 1, 2, 3, 4, 0]);
        let order = SubmissionOrder::Shuffled { seed: 7 };
        let arrangement = order.arrange(&plan).unwrap();

        assert_eq!(order.arrange(&plan).unwrap(), arrangement);

        let mut sorted = arrangement.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, [0, 1, 2, 3, 4, 5]);

        let position = |index| arrangement.iter().position(|&i| i == index).unwrap();
        assert!(position(0) < position(5));
    }

    #[test]
    fn binary_plans_only_go_forward() {
        let mut plan = chain(&[0, 1]);
        plan.semaphore_kind = Some(SemaphoreKind::Binary);

        assert!(SubmissionOrder::Forward.arrange(&plan).is_ok());
        assert!(matches!(
            SubmissionOrder::Reverse.arrange(&plan),
            Err(TestError::Harness(_)),
        ));
    }
}
