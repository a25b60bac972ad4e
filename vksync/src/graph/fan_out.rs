//! One write fanned out to several branches, each verified on its own.

use super::{pick_copy_operation, support_on_queue, Handoff, PlannedSubmission, SemaphoreRef,
    SubmissionPlan};
use crate::{
    context::{Queue, TestContext, TestParams},
    operation::{Operation, OperationContext, OperationSupport},
    provider::Provider,
    resource::{Resource, ResourceKind, ResourceUsage},
    schedule::{self, distinct_families, IdleGuard, SubmissionOrder},
    sync::{CommandBuffer, Semaphore, SemaphoreKind, SyncInfo, SynchronizationType},
    verify, Mismatch, Result, TestError,
};
use ash::vk;
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;

#[derive(Debug)]
struct Branch {
    copy_queue: Queue,
    copy: Operation,
    read: Operation,
}

/// A write on the universal queue, copied into N branch resources by copy operations spread
/// over the queues of the device, each branch read back on the universal queue.
///
/// The copies all read the same resource and run one after the other. Every branch resource
/// has a single owner at a time: it's released by the queue family of its copy and acquired by
/// the universal queue family before the read.
pub struct FanOut {
    guard: IdleGuard,
    sync_type: SynchronizationType,
    kind: ResourceKind,
    write_queue: Queue,
    write: Operation,
    branches: Vec<Branch>,
    command_buffers: Vec<CommandBuffer>,
    write_resource: Resource,
    branch_resources: Vec<Resource>,
    semaphores: Vec<Semaphore>,
    plan: SubmissionPlan,
    provider: Arc<dyn Provider>,
}

impl FanOut {
    /// Builds a fan-out of `config.fan_out_width` branches.
    pub fn build(context: &TestContext, params: &TestParams) -> Result<Self> {
        let provider = context.provider();
        let desc = &params.resource;
        let width = context.config().fan_out_width;
        let universal = context.universal_queue()?;

        if width == 0 {
            return Err(TestError::harness("a fan-out needs at least one branch"));
        }

        if params.semaphore_kind.is_timeline() && !provider.enabled_features().timeline_semaphore
        {
            return Err(TestError::not_supported(
                "the `timeline_semaphore` feature is not supported",
            ));
        }

        let write_support = support_on_queue(context, params.write, desc, &universal)?;
        let read_support = support_on_queue(context, params.read, desc, &universal)?;
        let copies = assign_copies(context, params, width)?;

        let write_usage = copies
            .iter()
            .fold(write_support.out_usage(), |usage, (_, copy)| {
                usage | copy.in_usage()
            });
        let families = distinct_families(
            [universal.family_index]
                .into_iter()
                .chain(copies.iter().map(|(queue, _)| queue.family_index)),
        );
        let write_resource = Resource::new(provider, desc, write_usage, &families)?;

        let branch_resources = copies
            .iter()
            .map(|(_, copy)| {
                let usage: ResourceUsage = copy.out_usage() | read_support.in_usage();

                Resource::new(provider, desc, usage, &[])
            })
            .collect::<Result<Vec<_>>>()?;

        let operations = OperationContext::new(provider, params.sync_type, params.seed);
        let write = write_support.build(&operations, &write_resource)?;
        let branches = copies
            .iter()
            .zip(&branch_resources)
            .map(|((copy_queue, copy), resource)| {
                Ok(Branch {
                    copy_queue: *copy_queue,
                    copy: copy.build_copy(&operations, &write_resource, resource)?,
                    read: read_support.build(&operations, resource)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let size = write.get_data()?.len();
        write.set_data(&operations.random_data(desc, size))?;

        let command_buffers = record(
            provider,
            params.sync_type,
            &universal,
            &write,
            &branches,
            &write_resource,
            &branch_resources,
        )?;
        let handles = command_buffers
            .iter()
            .map(CommandBuffer::handle)
            .collect::<Vec<_>>();

        let (plan, semaphore_count) = match params.semaphore_kind {
            SemaphoreKind::Timeline => {
                let mut rng = StdRng::seed_from_u64(params.seed);
                let host_value = rng.gen_range(1..=1000);

                (
                    timeline_plan(&universal, &branches, &handles, host_value, &mut rng),
                    1,
                )
            }
            SemaphoreKind::Binary => (binary_plan(&universal, &branches, &handles), 2 * width),
        };

        plan.validate_edges()?;

        let semaphores = (0..semaphore_count)
            .map(|_| Semaphore::new(provider, params.semaphore_kind, 0))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "fan-out of {} branch(es), copies on {:?}",
            branches.len(),
            branches
                .iter()
                .map(|branch| (branch.copy.name(), branch.copy_queue.family_index))
                .collect::<Vec<_>>(),
        );

        Ok(FanOut {
            guard: IdleGuard::new(provider),
            sync_type: params.sync_type,
            kind: desc.kind,
            write_queue: universal,
            write,
            branches,
            command_buffers,
            write_resource,
            branch_resources,
            semaphores,
            plan,
            provider: provider.clone(),
        })
    }

    #[inline]
    pub fn plan(&self) -> &SubmissionPlan {
        &self.plan
    }

    /// Returns the number of branches.
    #[inline]
    pub fn width(&self) -> usize {
        self.branches.len()
    }

    /// Submits the fan-out in `order` and waits for the device to go idle.
    pub fn submit(&self, order: SubmissionOrder) -> Result {
        schedule::submit_plan(
            &self.provider,
            self.sync_type,
            &self.plan,
            &self.semaphores,
            order,
        )?;

        self.guard.wait_idle()
    }

    /// Returns what the write wrote.
    pub fn expected_data(&self) -> Result<Vec<u8>> {
        self.write.get_data()
    }

    /// Returns what every branch read, in branch order.
    pub fn branch_data(&self) -> Result<Vec<Vec<u8>>> {
        self.branches
            .iter()
            .map(|branch| branch.read.get_data())
            .collect()
    }

    /// Compares every entry of `branch_data` with what the write wrote, independently.
    pub fn compare_branches(&self, branch_data: &[Vec<u8>]) -> Result<Vec<Result<(), Mismatch>>> {
        let expected = self.expected_data()?;

        Ok(branch_data
            .iter()
            .enumerate()
            .map(|(index, actual)| {
                verify::compare(self.kind, &expected, actual)
                    .map_err(|mismatch| mismatch.in_branch(index))
            })
            .collect())
    }

    /// Verifies every branch on its own.
    pub fn verify_branches(&self) -> Result<Vec<Result<(), Mismatch>>> {
        self.compare_branches(&self.branch_data()?)
    }

    /// Fails with the first branch that doesn't match.
    pub fn verify(&self) -> Result {
        let branches = self.verify_branches()?;
        let failing = verify::failing_branches(&branches);

        if !failing.is_empty() {
            debug!("failing fan-out branches: {failing:?}");
        }

        verify::first_failure(&branches)?;

        Ok(())
    }

    /// Builds, submits and verifies a fan-out.
    pub fn run(context: &TestContext, params: &TestParams) -> Result {
        let fan_out = FanOut::build(context, params)?;
        fan_out.submit(SubmissionOrder::Forward)?;
        fan_out.verify()
    }
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("write_queue", &self.write_queue)
            .field("write", &self.write)
            .field("branches", &self.branches)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

/// Spreads `width` copies over the queues that can run one, in queue order and wrapping
/// around.
fn assign_copies(
    context: &TestContext,
    params: &TestParams,
    width: usize,
) -> Result<Vec<(Queue, OperationSupport)>> {
    let mut copies = Vec::with_capacity(width);
    let mut next_copy = 0;
    let queues = context.queues();

    while copies.len() < width {
        let before = copies.len();

        for queue in queues {
            if copies.len() == width {
                break;
            }

            if let Some(copy) =
                pick_copy_operation(context, &params.resource, queue, &mut next_copy)
            {
                copies.push((*queue, copy));
            }
        }

        if copies.len() == before {
            return Err(TestError::not_supported(format!(
                "No queue can copy {}",
                params.resource.name(),
            )));
        }
    }

    Ok(copies)
}

fn record(
    provider: &Arc<dyn Provider>,
    sync_type: SynchronizationType,
    universal: &Queue,
    write: &Operation,
    branches: &[Branch],
    write_resource: &Resource,
    branch_resources: &[Resource],
) -> Result<Vec<CommandBuffer>> {
    let mut command_buffers = Vec::with_capacity(1 + 2 * branches.len());

    let write_command_buffer = CommandBuffer::new(provider, universal.family_index)?;
    write_command_buffer.record(|cb| write.record_commands(cb))?;
    command_buffers.push(write_command_buffer);

    for (branch, resource) in branches.iter().zip(branch_resources) {
        let copy_in = branch.copy.in_sync_info();
        let write_out = write.out_sync_info();
        let command_buffer = CommandBuffer::new(provider, branch.copy_queue.family_index)?;

        command_buffer.record(|cb| {
            Handoff {
                resource: write_resource,
                producer_out: write_out,
                consumer_in: copy_in,
                src_family: universal.family_index,
                dst_family: branch.copy_queue.family_index,
                concurrent: true,
            }
            .record_release(&**provider, sync_type, cb);

            branch.copy.record_commands(cb)?;

            // Back to the layout the next copy expects.
            Handoff {
                resource: write_resource,
                producer_out: copy_in,
                consumer_in: SyncInfo {
                    image_layout: write_out.image_layout,
                    ..copy_in
                },
                src_family: branch.copy_queue.family_index,
                dst_family: branch.copy_queue.family_index,
                concurrent: true,
            }
            .record_release(&**provider, sync_type, cb);

            branch_handoff(branch, resource, universal)
                .record_release(&**provider, sync_type, cb);

            Ok(())
        })?;
        command_buffers.push(command_buffer);
    }

    for (branch, resource) in branches.iter().zip(branch_resources) {
        let command_buffer = CommandBuffer::new(provider, universal.family_index)?;

        command_buffer.record(|cb| {
            branch_handoff(branch, resource, universal)
                .record_acquire(&**provider, sync_type, cb);
            branch.read.record_commands(cb)
        })?;
        command_buffers.push(command_buffer);
    }

    Ok(command_buffers)
}

/// The branch resource goes from the copy to the read, across queue families if the copy ran
/// on another family.
fn branch_handoff<'a>(branch: &Branch, resource: &'a Resource, universal: &Queue) -> Handoff<'a> {
    Handoff {
        resource,
        producer_out: branch.copy.out_sync_info(),
        consumer_in: branch.read.in_sync_info(),
        src_family: branch.copy_queue.family_index,
        dst_family: universal.family_index,
        concurrent: false,
    }
}

fn timeline_plan(
    universal: &Queue,
    branches: &[Branch],
    command_buffers: &[vk::CommandBuffer],
    host_value: u64,
    rng: &mut impl Rng,
) -> SubmissionPlan {
    let mut plan = SubmissionPlan::new(SemaphoreKind::Timeline);
    let width = branches.len();
    let mut value = host_value;
    let mut next_value = || {
        value += rng.gen_range(1..=100);
        value
    };

    let write_value = next_value();
    plan.submissions.push(PlannedSubmission {
        queue: *universal,
        command_buffers: smallvec![command_buffers[0]],
        waits: smallvec![SemaphoreRef::new(0, host_value)],
        signals: smallvec![SemaphoreRef::new(0, write_value)],
    });

    let mut copy_values = Vec::with_capacity(width);

    for (index, branch) in branches.iter().enumerate() {
        let mut waits: SmallVec<[_; 2]> = smallvec![SemaphoreRef::new(0, write_value)];
        waits.extend(copy_values.last().map(|&previous| SemaphoreRef::new(0, previous)));

        let copy_value = next_value();
        copy_values.push(copy_value);

        plan.submissions.push(PlannedSubmission {
            queue: branch.copy_queue,
            command_buffers: smallvec![command_buffers[1 + index]],
            waits,
            signals: smallvec![SemaphoreRef::new(0, copy_value)],
        });
    }

    let mut previous_read = copy_values[width - 1];

    for (index, &copy_value) in copy_values.iter().enumerate() {
        let read_value = next_value();

        plan.submissions.push(PlannedSubmission {
            queue: *universal,
            command_buffers: smallvec![command_buffers[1 + width + index]],
            waits: smallvec![
                SemaphoreRef::new(0, copy_value),
                SemaphoreRef::new(0, previous_read),
            ],
            signals: smallvec![SemaphoreRef::new(0, read_value)],
        });
        previous_read = read_value;
    }

    plan.host_signals.push(SemaphoreRef::new(0, host_value));

    plan
}

/// Semaphore `0` goes from the write to the first copy, `i` from copy `i - 1` to copy `i`, and
/// `width + i` from copy `i` to read `i`.
fn binary_plan(
    universal: &Queue,
    branches: &[Branch],
    command_buffers: &[vk::CommandBuffer],
) -> SubmissionPlan {
    let mut plan = SubmissionPlan::new(SemaphoreKind::Binary);
    let width = branches.len();

    plan.submissions.push(PlannedSubmission {
        queue: *universal,
        command_buffers: smallvec![command_buffers[0]],
        waits: smallvec![],
        signals: smallvec![SemaphoreRef::new(0, 0)],
    });

    for (index, branch) in branches.iter().enumerate() {
        let mut signals: SmallVec<[_; 2]> = smallvec![SemaphoreRef::new(width + index, 0)];

        if index + 1 < width {
            signals.push(SemaphoreRef::new(index + 1, 0));
        }

        plan.submissions.push(PlannedSubmission {
            queue: branch.copy_queue,
            command_buffers: smallvec![command_buffers[1 + index]],
            waits: smallvec![SemaphoreRef::new(index, 0)],
            signals,
        });
    }

    for index in 0..width {
        plan.submissions.push(PlannedSubmission {
            queue: *universal,
            command_buffers: smallvec![command_buffers[1 + width + index]],
            waits: smallvec![SemaphoreRef::new(width + index, 0)],
            signals: smallvec![],
        });
    }

    plan
}
