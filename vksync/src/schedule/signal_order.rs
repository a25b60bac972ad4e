//! Signal ordering of semaphores on one queue.
//!
//! A dozen writes are submitted to queue A, each in its own submit info signaling an ascending
//! value (or its own binary semaphore). All the reads are recorded into one command buffer on
//! queue B, which only waits for the *last* write. Because signal operations on a queue complete
//! in submission order, every write must be visible to the reads by then.

use super::{distinct_families, IdleGuard, ReadWritePair};
use crate::{
    context::{TestContext, TestParams},
    operation::OperationContext,
    sync::{self, CommandBuffer, Fence, Semaphore, SynchronizationWrapper},
    Result, TestError,
};
use ash::vk;
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use smallvec::{smallvec, SmallVec};

pub fn run(context: &TestContext, params: &TestParams) -> Result {
    let provider = context.provider();
    let config = context.config();
    let kind = params.semaphore_kind;
    let is_timeline = kind.is_timeline();

    if config.iterations == 0 {
        return Err(TestError::harness("signal ordering needs at least one write"));
    }

    let write_support = params.write.support(&params.resource)?;
    let read_support = params.read.support(&params.resource)?;
    write_support.check_support(&**provider)?;
    read_support.check_support(&**provider)?;

    let mut wrapper = SynchronizationWrapper::new(
        provider,
        params.sync_type,
        is_timeline,
        config.iterations,
    )?;

    let queue_a = context.find_queue(write_support.queue_flags(), None)?;
    let queue_b = context.find_queue(read_support.queue_flags(), Some(&queue_a))?;
    let families = distinct_families([queue_a.family_index, queue_b.family_index]);

    let operations = OperationContext::new(provider, params.sync_type, params.seed);
    let mut rng = StdRng::seed_from_u64(params.seed);

    let pairs = (0..config.iterations)
        .map(|_| ReadWritePair::new(&operations, &write_support, &read_support, &families))
        .collect::<Result<Vec<_>>>()?;

    // One timeline for all the writes, or one binary semaphore per write.
    let semaphores_a = if is_timeline {
        vec![Semaphore::new(provider, kind, 0)?]
    } else {
        (0..pairs.len())
            .map(|_| Semaphore::new(provider, kind, 0))
            .collect::<Result<Vec<_>>>()?
    };
    let semaphore_b = Semaphore::new(provider, kind, 0)?;
    let fence = Fence::new(provider, false)?;

    let mut values_a = Vec::with_capacity(pairs.len());
    let mut value = 2;

    for _ in &pairs {
        value += rng.gen_range(1..=100);
        values_a.push(value);
    }

    let last_value_a = values_a.last().copied().unwrap_or(2);
    let value_b = last_value_a + rng.gen_range(1..=100);

    let write_command_buffers = pairs
        .iter()
        .map(|pair| {
            let command_buffer = CommandBuffer::new(provider, queue_a.family_index)?;
            command_buffer.record(|cb| pair.record_write(params.sync_type, cb))?;

            Ok(command_buffer)
        })
        .collect::<Result<Vec<_>>>()?;

    let read_command_buffer = CommandBuffer::new(provider, queue_b.family_index)?;
    let mut read_stages = vk::PipelineStageFlags2::empty();
    read_command_buffer.record(|cb| {
        for pair in &pairs {
            read_stages |= pair.read.in_sync_info().stage_mask;
            pair.read.record_commands(cb)?;
        }

        Ok(())
    })?;

    let guard = IdleGuard::new(provider);

    // Submitted values: timeline values, or 0 for binary semaphores.
    let submitted = |value: u64| if is_timeline { value } else { 0 };
    let semaphore_a = |index: usize| &semaphores_a[if is_timeline { 0 } else { index }];

    for (index, (pair, command_buffer)) in pairs.iter().zip(&write_command_buffers).enumerate() {
        let stage_mask = pair.write.out_sync_info().stage_mask;
        // With binary semaphores the writes don't wait on anything; with a timeline they all
        // wait for a host signal that comes after every submission.
        let waits: SmallVec<[_; 1]> = if is_timeline {
            smallvec![sync::semaphore_submit_info(
                semaphores_a[0].handle(),
                1,
                stage_mask,
            )]
        } else {
            SmallVec::new()
        };

        wrapper.add_submit_info(
            &waits,
            &[sync::command_buffer_submit_info(command_buffer.handle())],
            &[sync::semaphore_submit_info(
                semaphore_a(index).handle(),
                submitted(values_a[index]),
                stage_mask,
            )],
            is_timeline,
            is_timeline,
        )?;
    }

    wrapper.queue_submit(queue_a.handle, vk::Fence::null())?;

    wrapper.add_submit_info(
        &[sync::semaphore_submit_info(
            semaphore_a(pairs.len() - 1).handle(),
            submitted(last_value_a),
            read_stages,
        )],
        &[sync::command_buffer_submit_info(read_command_buffer.handle())],
        &[sync::semaphore_submit_info(
            semaphore_b.handle(),
            submitted(value_b),
            read_stages,
        )],
        is_timeline,
        is_timeline,
    )?;
    wrapper.queue_submit(queue_b.handle, fence.handle())?;

    if is_timeline {
        debug!("unblocking {} writes", pairs.len());
        semaphores_a[0].signal(1)?;
        semaphore_b
            .wait(value_b, config.long_timeout())?
            .expect_signaled("vkWaitSemaphores")?;
    } else {
        fence
            .wait(config.long_timeout())?
            .expect_signaled("vkWaitForFences")?;
    }

    for pair in &pairs {
        pair.verify()?;
    }

    drop(guard);

    Ok(())
}
