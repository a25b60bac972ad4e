//! Linear chains: a write, copies across every other queue of the device, and a read.

use super::{
    pick_copy_operation, support_on_queue, Handoff, PlannedSubmission, SemaphoreRef,
    SubmissionPlan,
};
use crate::{
    context::{Queue, TestContext, TestParams},
    operation::{Operation, OperationContext, OperationSupport},
    provider::Provider,
    resource::{Resource, ResourceKind},
    schedule::{self, IdleGuard, SubmissionOrder},
    sync::{CommandBuffer, Semaphore, SemaphoreKind, SynchronizationType},
    verify, Result, TestError,
};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;

/// One link of a chain: an operation and the queue it runs on.
#[derive(Debug)]
struct Link {
    queue: Queue,
    operation: Operation,
}

/// A chain of operations, each handing its output to the next one through a resource of its
/// own.
///
/// The first operation writes, the last one reads and every one in between copies. By default
/// the write and the read run on the universal queue, with one copy for every other queue of
/// the device that can run a copy of the resource, so that the data crosses every queue (and
/// queue family) before it is read back. [`Chain::build_across`] places the links on queues
/// of the caller's choosing instead.
///
/// With timeline semaphores the whole chain shares one semaphore: the write waits for a value
/// that only the host signals, and every link signals a value greater than the one it waits
/// for. With binary semaphores every edge has its own semaphore and nothing waits on the host.
pub struct Chain {
    // Dropped first, so that nothing below is destroyed while the device may still use it.
    guard: IdleGuard,
    provider: Arc<dyn Provider>,
    sync_type: SynchronizationType,
    kind: ResourceKind,
    command_buffers: Vec<CommandBuffer>,
    links: Vec<Link>,
    resources: Vec<Resource>,
    semaphores: Vec<Semaphore>,
    plan: SubmissionPlan,
}

impl Chain {
    /// Builds a chain with a host value picked from the case seed.
    pub fn build(context: &TestContext, params: &TestParams) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let host_value = rng.gen_range(1..=1000);

        Chain::build_with(context, params, host_value, &mut rng)
    }

    /// Builds a chain whose write waits for `host_value`. The gaps between the values of the
    /// following links are drawn from `rng`.
    pub fn build_with(
        context: &TestContext,
        params: &TestParams,
        host_value: u64,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let desc = &params.resource;
        let universal = context.universal_queue()?;
        let write = support_on_queue(context, params.write, desc, &universal)?;
        let read = support_on_queue(context, params.read, desc, &universal)?;

        let mut supports: Vec<(Queue, OperationSupport)> = vec![(universal, write)];
        let mut next_copy = 0;

        for queue in context.queues() {
            if queue.family_index == universal.family_index && queue.index == universal.index {
                continue;
            }

            if let Some(copy) = pick_copy_operation(context, desc, queue, &mut next_copy) {
                supports.push((*queue, copy));
            }
        }

        supports.push((universal, read));

        Chain::from_supports(context, params, supports, host_value, rng)
    }

    /// Builds a chain that writes on the first of `queues`, reads on the last one and copies
    /// on every queue in between, in order. The write waits for `host_value`.
    pub fn build_across(
        context: &TestContext,
        params: &TestParams,
        queues: &[Queue],
        host_value: u64,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let desc = &params.resource;
        let [first, middle @ .., last] = queues else {
            return Err(TestError::harness("a chain needs at least two queues"));
        };

        let mut supports = vec![(*first, support_on_queue(context, params.write, desc, first)?)];
        let mut next_copy = 0;

        for queue in middle {
            let copy = pick_copy_operation(context, desc, queue, &mut next_copy).ok_or_else(|| {
                TestError::not_supported(format!(
                    "No copy of {} on queue family {}",
                    desc.name(),
                    queue.family_index,
                ))
            })?;
            supports.push((*queue, copy));
        }

        supports.push((*last, support_on_queue(context, params.read, desc, last)?));

        Chain::from_supports(context, params, supports, host_value, rng)
    }

    fn from_supports(
        context: &TestContext,
        params: &TestParams,
        supports: Vec<(Queue, OperationSupport)>,
        host_value: u64,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let provider = context.provider();
        let desc = &params.resource;

        if params.semaphore_kind.is_timeline() && !provider.enabled_features().timeline_semaphore
        {
            return Err(TestError::not_supported(
                "the `timeline_semaphore` feature is not supported",
            ));
        }

        debug!(
            "chain of {} operation(s): {:?}",
            supports.len(),
            supports
                .iter()
                .map(|(queue, support)| (support.name(), queue.family_index, queue.index))
                .collect::<Vec<_>>(),
        );

        // Resource `i` sits between operation `i` and operation `i + 1`.
        let resources = supports
            .windows(2)
            .map(|pair| {
                let usage = pair[0].1.out_usage() | pair[1].1.in_usage();

                Resource::new(provider, desc, usage, &[])
            })
            .collect::<Result<Vec<_>>>()?;

        let operations = OperationContext::new(provider, params.sync_type, params.seed);
        let last = supports.len() - 1;
        let links = supports
            .iter()
            .enumerate()
            .map(|(index, (queue, support))| {
                let operation = if index == 0 {
                    support.build(&operations, &resources[0])?
                } else if index == last {
                    support.build(&operations, &resources[last - 1])?
                } else {
                    support.build_copy(&operations, &resources[index - 1], &resources[index])?
                };

                Ok(Link {
                    queue: *queue,
                    operation,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let size = links[0].operation.get_data()?.len();
        links[0]
            .operation
            .set_data(&operations.random_data(desc, size))?;

        let command_buffers = record_links(provider, params.sync_type, &links, &resources)?;

        let (plan, semaphores) = match params.semaphore_kind {
            SemaphoreKind::Timeline => {
                let semaphore = Semaphore::new(provider, SemaphoreKind::Timeline, 0)?;
                let plan = timeline_plan(&links, &command_buffers, host_value, rng);

                (plan, vec![semaphore])
            }
            SemaphoreKind::Binary => {
                let semaphores = (0..links.len() - 1)
                    .map(|_| Semaphore::new(provider, SemaphoreKind::Binary, 0))
                    .collect::<Result<Vec<_>>>()?;
                let plan = binary_plan(&links, &command_buffers);

                (plan, semaphores)
            }
        };

        plan.validate_edges()?;

        Ok(Chain {
            guard: IdleGuard::new(provider),
            provider: provider.clone(),
            sync_type: params.sync_type,
            kind: desc.kind,
            command_buffers,
            links,
            resources,
            semaphores,
            plan,
        })
    }

    /// Returns the submissions of the chain, in dependency order.
    #[inline]
    pub fn plan(&self) -> &SubmissionPlan {
        &self.plan
    }

    /// Returns the names of the operations of the chain, in order.
    pub fn operation_names(&self) -> Vec<String> {
        self.links
            .iter()
            .map(|link| link.operation.name().to_string())
            .collect()
    }

    /// Submits the chain in `order` and waits for the device to go idle.
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

    /// Compares what the read observed with what the write wrote.
    pub fn verify(&self) -> Result {
        let (Some(first), Some(last)) = (self.links.first(), self.links.last()) else {
            return Err(TestError::harness("a chain has no operations"));
        };

        verify::compare(
            self.kind,
            &first.operation.get_data()?,
            &last.operation.get_data()?,
        )?;

        Ok(())
    }

    /// Builds, submits and verifies a chain.
    pub fn run(context: &TestContext, params: &TestParams, order: SubmissionOrder) -> Result {
        let chain = Chain::build(context, params)?;
        chain.submit(order)?;
        chain.verify()
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("links", &self.links)
            .field("command_buffers", &self.command_buffers.len())
            .field("resources", &self.resources.len())
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

fn record_links(
    provider: &Arc<dyn Provider>,
    sync_type: SynchronizationType,
    links: &[Link],
    resources: &[Resource],
) -> Result<Vec<CommandBuffer>> {
    let handoff = |index: usize| Handoff {
        resource: &resources[index],
        producer_out: links[index].operation.out_sync_info(),
        consumer_in: links[index + 1].operation.in_sync_info(),
        src_family: links[index].queue.family_index,
        dst_family: links[index + 1].queue.family_index,
        concurrent: false,
    };

    links
        .iter()
        .enumerate()
        .map(|(index, link)| {
            let command_buffer = CommandBuffer::new(provider, link.queue.family_index)?;

            command_buffer.record(|cb| {
                if index > 0 {
                    handoff(index - 1).record_acquire(&**provider, sync_type, cb);
                }

                link.operation.record_commands(cb)?;

                if index + 1 < links.len() {
                    handoff(index).record_release(&**provider, sync_type, cb);
                }

                Ok(())
            })?;

            Ok(command_buffer)
        })
        .collect()
}

fn timeline_plan(
    links: &[Link],
    command_buffers: &[CommandBuffer],
    host_value: u64,
    rng: &mut impl Rng,
) -> SubmissionPlan {
    let mut plan = SubmissionPlan::new(SemaphoreKind::Timeline);
    let mut value = host_value;

    for (link, command_buffer) in links.iter().zip(command_buffers) {
        let wait_value = value;
        value += rng.gen_range(1..=100);

        plan.submissions.push(PlannedSubmission {
            queue: link.queue,
            command_buffers: smallvec![command_buffer.handle()],
            waits: smallvec![SemaphoreRef::new(0, wait_value)],
            signals: smallvec![SemaphoreRef::new(0, value)],
        });
    }

    plan.host_signals.push(SemaphoreRef::new(0, host_value));

    plan
}

fn binary_plan(links: &[Link], command_buffers: &[CommandBuffer]) -> SubmissionPlan {
    let mut plan = SubmissionPlan::new(SemaphoreKind::Binary);
    let last = links.len() - 1;

    for (index, (link, command_buffer)) in links.iter().zip(command_buffers).enumerate() {
        let waits: SmallVec<[_; 2]> = index
            .checked_sub(1)
            .map(|edge| SemaphoreRef::new(edge, 0))
            .into_iter()
            .collect();
        let signals: SmallVec<[_; 2]> = (index < last)
            .then_some(SemaphoreRef::new(index, 0))
            .into_iter()
            .collect();

        plan.submissions.push(PlannedSubmission {
            queue: link.queue,
            command_buffers: smallvec![command_buffer.handle()],
            waits,
            signals,
        });
    }

    plan
}
