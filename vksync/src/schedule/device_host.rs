//! A chain of device operations with a host copy between every link.
//!
//! Each iteration writes a resource on the device, reads it back on the device, and then a host
//! thread moves what was read into the next iteration's write. A single timeline semaphore
//! orders all of it:
//!
//! ```text
//! write[i] waits cpu[i-1], signals write[i]
//! read[i]  waits write[i], signals read[i]
//! host     waits read[i],  copies, signals cpu[i]
//! ```
//!
//! Every submission is handed to the device in one `queue_submit` before the host thread has
//! done anything, so the device has to wait for host signals that don't exist yet. The data
//! written by the first iteration must come out of the last one unchanged.

use super::{IdleGuard, ReadWritePair};
use crate::{
    context::{TestContext, TestParams},
    operation::{Operation, OperationContext},
    sync::{self, CommandBuffer, Semaphore, SemaphoreKind, SynchronizationWrapper},
    verify, ProviderResultExt, Result, TestError,
};
use ash::vk;
use log::{debug, trace};
use rand::{rngs::StdRng, Rng, SeedableRng};
use smallvec::SmallVec;
use std::{thread, time::Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TimelineValues {
    write: u64,
    read: u64,
    cpu: u64,
}

impl TimelineValues {
    fn after(last: u64, rng: &mut impl Rng) -> Self {
        let write = last + rng.gen_range(1..=100);
        let read = write + rng.gen_range(1..=100);
        let cpu = read + rng.gen_range(1..=100);

        TimelineValues { write, read, cpu }
    }
}

pub fn run(context: &TestContext, params: &TestParams) -> Result {
    let provider = context.provider();
    let config = context.config();

    if params.semaphore_kind != SemaphoreKind::Timeline {
        return Err(TestError::harness(
            "the device/host chain only exists for timeline semaphores",
        ));
    }

    let write_support = params.write.support(&params.resource)?;
    let read_support = params.read.support(&params.resource)?;
    write_support.check_support(&**provider)?;
    read_support.check_support(&**provider)?;

    let mut wrapper =
        SynchronizationWrapper::new(provider, params.sync_type, true, config.iterations * 2)?;
    let queue = context.universal_queue()?;

    if !queue.supports(write_support.queue_flags() | read_support.queue_flags()) {
        return Err(TestError::not_supported(format!(
            "No queue supporting {:?}",
            write_support.queue_flags() | read_support.queue_flags(),
        )));
    }

    let operations = OperationContext::new(provider, params.sync_type, params.seed);
    let mut rng = StdRng::seed_from_u64(params.seed);

    let pairs = (0..config.iterations)
        .map(|_| {
            ReadWritePair::new(
                &operations,
                &write_support,
                &read_support,
                &[queue.family_index],
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let mut values = Vec::with_capacity(pairs.len());
    let mut last = 0;

    for _ in &pairs {
        let next = TimelineValues::after(last, &mut rng);
        last = next.cpu;
        values.push(next);
    }

    let (Some(first), Some(last_pair)) = (pairs.first(), pairs.last()) else {
        return Err(TestError::harness("the device/host chain needs at least one iteration"));
    };

    let size = first.write.get_data()?.len();
    first
        .write
        .set_data(&operations.random_data(&params.resource, size))?;

    let semaphore = Semaphore::new(provider, SemaphoreKind::Timeline, 0)?;
    let mut command_buffers = Vec::with_capacity(pairs.len() * 2);

    for pair in &pairs {
        let write_command_buffer = CommandBuffer::new(provider, queue.family_index)?;
        write_command_buffer.record(|cb| pair.record_write(params.sync_type, cb))?;

        let read_command_buffer = CommandBuffer::new(provider, queue.family_index)?;
        read_command_buffer.record(|cb| pair.read.record_commands(cb))?;

        command_buffers.push((write_command_buffer, read_command_buffer));
    }

    let wait_stage = vk::PipelineStageFlags2::ALL_COMMANDS;
    let semaphore_info =
        |value: u64| sync::semaphore_submit_info(semaphore.handle(), value, wait_stage);

    for (index, (write_command_buffer, read_command_buffer)) in command_buffers.iter().enumerate()
    {
        let current = values[index];
        let waits: SmallVec<[_; 1]> = index
            .checked_sub(1)
            .map(|previous| semaphore_info(values[previous].cpu))
            .into_iter()
            .collect();

        wrapper.add_submit_info(
            &waits,
            &[sync::command_buffer_submit_info(write_command_buffer.handle())],
            &[semaphore_info(current.write)],
            true,
            true,
        )?;
        wrapper.add_submit_info(
            &[semaphore_info(current.write)],
            &[sync::command_buffer_submit_info(read_command_buffer.handle())],
            &[semaphore_info(current.read)],
            true,
            true,
        )?;
    }

    let guard = IdleGuard::new(provider);
    let timeout = config.long_timeout();

    thread::scope(|scope| {
        let host_copy = scope.spawn(|| host_copy(&semaphore, &pairs, &values, timeout));

        let submitted = wrapper.queue_submit(queue.handle, vk::Fence::null());
        let idle = submitted.and_then(|()| {
            provider
                .device_wait_idle()
                .checked("vkDeviceWaitIdle")
        });
        let copied = host_copy
            .join()
            .unwrap_or_else(|_| Err(TestError::harness("the host copy thread panicked")));

        idle.and(copied)
    })?;

    verify::compare(
        params.resource.kind,
        &first.write.get_data()?,
        &last_pair.read.get_data()?,
    )?;

    drop(guard);

    Ok(())
}

fn host_copy(
    semaphore: &Semaphore,
    pairs: &[ReadWritePair],
    values: &[TimelineValues],
    timeout: Duration,
) -> Result {
    for (index, (pair, current)) in pairs.iter().zip(values).enumerate() {
        semaphore
            .wait(current.read, timeout)?
            .expect_signaled("vkWaitSemaphores")?;

        if let Some(next) = pairs.get(index + 1) {
            copy_payload(&pair.read, &next.write)?;
        }

        trace!("host copy {index} done, signaling {}", current.cpu);
        semaphore.signal(current.cpu)?;
    }

    debug!("host copy thread finished {} iterations", pairs.len());

    Ok(())
}

#[inline]
fn copy_payload(from: &Operation, to: &Operation) -> Result {
    to.set_data(&from.get_data()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_interleaved() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut last = 0;

        for _ in 0..12 {
            let values = TimelineValues::after(last, &mut rng);

            assert!(last < values.write);
            assert!(values.write < values.read);
            assert!(values.read < values.cpu);
            assert!(values.cpu - last <= 300);

            last = values.cpu;
        }
    }
}
