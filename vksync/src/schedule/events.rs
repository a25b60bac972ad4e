//! Event dependencies inside one queue.

use super::{IdleGuard, ReadWritePair};
use crate::{
    context::{Queue, TestContext, TestParams},
    operation::OperationContext,
    provider::DependencyInfo,
    resource::{Resource, ResourceHandle},
    sync::{self, CommandBuffer, Event, Fence, SyncInfo, SynchronizationWrapper, WaitOutcome},
    Result, TestError,
};
use ash::vk;
use log::debug;

const HOST_WRITE: SyncInfo = SyncInfo::new(
    vk::PipelineStageFlags2::HOST,
    vk::AccessFlags2::HOST_WRITE,
    vk::ImageLayout::UNDEFINED,
);

const ALL_COMMANDS: SyncInfo = SyncInfo::new(
    vk::PipelineStageFlags2::ALL_COMMANDS,
    vk::AccessFlags2::from_raw(
        vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
    ),
    vk::ImageLayout::UNDEFINED,
);

/// The device waits on an event that the host sets only after the work was submitted.
///
/// Until the event is set the submission can't complete, which is checked with a short fence
/// wait that has to run out of time.
pub fn host_set_device_wait(context: &TestContext, params: &TestParams) -> Result {
    let provider = context.provider();
    let config = context.config();
    let (pair, queue) = build_pair(context, params)?;

    let mut wrapper = SynchronizationWrapper::new(provider, params.sync_type, false, 1)?;
    let event = Event::new(provider)?;
    let fence = Fence::new(provider, false)?;
    let command_buffer = CommandBuffer::new(provider, queue.family_index)?;

    command_buffer.record(|cb| {
        let barrier = sync::memory_barrier(&HOST_WRITE, &ALL_COMMANDS);

        wrapper.cmd_wait_events(
            cb,
            &[event.handle()],
            &[DependencyInfo {
                memory_barriers: &[barrier],
                ..Default::default()
            }],
        );
        pair.record_write(params.sync_type, cb)?;
        pair.read.record_commands(cb)
    })?;

    wrapper.add_submit_info(
        &[],
        &[sync::command_buffer_submit_info(command_buffer.handle())],
        &[],
        false,
        false,
    )?;

    let guard = IdleGuard::new(provider);
    wrapper.queue_submit(queue.handle, fence.handle())?;

    if fence.wait(config.short_timeout())? != WaitOutcome::TimedOut {
        // Unblock the device before teardown.
        event.set()?;

        return Err(TestError::conformance(
            "the submission completed before its event was set",
        ));
    }

    debug!("setting the event from the host");
    event.set()?;
    fence
        .wait(config.long_timeout())?
        .expect_signaled("vkWaitForFences")?;

    pair.verify()?;
    drop(guard);

    Ok(())
}

/// The write sets an event and the read waits on it, in the same command buffer.
pub fn device_set_device_wait(context: &TestContext, params: &TestParams) -> Result {
    let provider = context.provider();
    let config = context.config();
    let (pair, queue) = build_pair(context, params)?;

    let mut wrapper = SynchronizationWrapper::new(provider, params.sync_type, false, 1)?;
    let event = Event::new(provider)?;
    let fence = Fence::new(provider, false)?;
    let command_buffer = CommandBuffer::new(provider, queue.family_index)?;

    command_buffer.record(|cb| {
        pair.write.record_commands(cb)?;

        let src = pair.write.out_sync_info();
        let dst = pair.read.in_sync_info();

        with_dependency(&pair.resource, &src, &dst, |dependency_info| {
            wrapper.cmd_set_event(cb, event.handle(), dependency_info);
            wrapper.cmd_wait_events(cb, &[event.handle()], &[*dependency_info]);
        });

        pair.read.record_commands(cb)
    })?;

    wrapper.add_submit_info(
        &[],
        &[sync::command_buffer_submit_info(command_buffer.handle())],
        &[],
        false,
        false,
    )?;

    let guard = IdleGuard::new(provider);
    wrapper.queue_submit(queue.handle, fence.handle())?;
    fence
        .wait(config.long_timeout())?
        .expect_signaled("vkWaitForFences")?;

    if !event.is_set()? {
        return Err(TestError::conformance("the event isn't set after the device set it"));
    }

    pair.verify()?;
    drop(guard);

    Ok(())
}

fn build_pair(
    context: &TestContext,
    params: &TestParams,
) -> Result<(ReadWritePair, Queue)> {
    let provider = context.provider();
    let write_support = params.write.support(&params.resource)?;
    let read_support = params.read.support(&params.resource)?;
    write_support.check_support(&**provider)?;
    read_support.check_support(&**provider)?;

    let queue = context.universal_queue()?;
    let required = write_support.queue_flags() | read_support.queue_flags();

    if !queue.supports(required) {
        return Err(TestError::not_supported(format!(
            "No queue supporting {required:?}",
        )));
    }

    let operations = OperationContext::new(provider, params.sync_type, params.seed);
    let pair = ReadWritePair::new(
        &operations,
        &write_support,
        &read_support,
        &[queue.family_index],
    )?;

    Ok((pair, queue))
}

/// Calls `f` with a dependency from `src` to `dst` over the whole of `resource`.
fn with_dependency(
    resource: &Resource,
    src: &SyncInfo,
    dst: &SyncInfo,
    f: impl FnOnce(&DependencyInfo<'_>),
) {
    match resource.handle() {
        ResourceHandle::Buffer(buffer) => f(&DependencyInfo {
            buffer_memory_barriers: &[sync::buffer_barrier(src, dst, buffer)],
            ..Default::default()
        }),
        ResourceHandle::Image(image) => f(&DependencyInfo {
            image_memory_barriers: &[sync::image_barrier(src, dst, image)],
            ..Default::default()
        }),
    }
}
