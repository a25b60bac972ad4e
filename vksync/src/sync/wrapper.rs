use super::{
    cmd_pipeline_barrier, cmd_reset_event, cmd_set_event, cmd_wait_events, convert_stage_mask,
    SynchronizationType,
};
use crate::{
    provider::{
        CommandBufferSubmitInfo, DependencyInfo, Provider, SemaphoreSubmitInfo, SubmitInfo,
        SubmitInfo2, TimelineSemaphoreSubmitInfo,
    },
    ProviderResultExt, Result, TestError,
};
use ash::vk;
use log::debug;
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

/// Accumulates submit infos and hands them to a queue in one call, using either protocol.
///
/// A wrapper is created for one logical batch of submissions. Nothing reaches the device until
/// [`queue_submit`] is called, and every submit info added before that call is submitted in
/// the order it was added.
///
/// [`queue_submit`]: Self::queue_submit
pub struct SynchronizationWrapper {
    provider: Arc<dyn Provider>,
    sync_type: SynchronizationType,
    uses_timeline: bool,
    per_submits: Vec<PerSubmit>,
}

#[derive(Default)]
struct PerSubmit {
    wait_semaphore_infos: SmallVec<[SemaphoreSubmitInfo; 4]>,
    command_buffer_infos: SmallVec<[CommandBufferSubmitInfo; 1]>,
    signal_semaphore_infos: SmallVec<[SemaphoreSubmitInfo; 4]>,
    wait_is_timeline: bool,
    signal_is_timeline: bool,
}

// The legacy form of a `PerSubmit`, which the `SubmitInfo`s borrow from.
struct PerSubmitInfo {
    wait_semaphores_vk: SmallVec<[vk::Semaphore; 4]>,
    wait_values_vk: SmallVec<[u64; 4]>,
    wait_dst_stage_mask_vk: SmallVec<[vk::PipelineStageFlags; 4]>,
    command_buffers_vk: SmallVec<[vk::CommandBuffer; 1]>,
    signal_semaphores_vk: SmallVec<[vk::Semaphore; 4]>,
    signal_values_vk: SmallVec<[u64; 4]>,
    has_timeline: bool,
}

impl SynchronizationWrapper {
    /// Creates a wrapper for the given protocol.
    ///
    /// Returns a not-supported error if the device doesn't have the `synchronization2` feature
    /// and `sync_type` asks for it, or if `uses_timeline` is set and the device doesn't have
    /// timeline semaphores.
    pub fn new(
        provider: &Arc<dyn Provider>,
        sync_type: SynchronizationType,
        uses_timeline: bool,
        submit_info_count_hint: usize,
    ) -> Result<Self> {
        let features = provider.enabled_features();

        if sync_type == SynchronizationType::Synchronization2 && !features.synchronization2 {
            return Err(TestError::not_supported(
                "the `synchronization2` feature is not supported",
            ));
        }

        if uses_timeline && !features.timeline_semaphore {
            return Err(TestError::not_supported(
                "the `timeline_semaphore` feature is not supported",
            ));
        }

        Ok(SynchronizationWrapper {
            provider: provider.clone(),
            sync_type,
            uses_timeline,
            per_submits: Vec::with_capacity(submit_info_count_hint),
        })
    }

    #[inline]
    pub fn sync_type(&self) -> SynchronizationType {
        self.sync_type
    }

    /// Returns the number of submit infos that haven't been submitted yet.
    #[inline]
    pub fn submit_info_count(&self) -> usize {
        self.per_submits.len()
    }

    /// Appends one submit info. Nothing is submitted yet.
    ///
    /// The values of a list that isn't a timeline list must all be 0, and the values of a
    /// timeline list must all be non-zero. Anything else is a harness bug.
    pub fn add_submit_info(
        &mut self,
        wait_semaphore_infos: &[SemaphoreSubmitInfo],
        command_buffer_infos: &[CommandBufferSubmitInfo],
        signal_semaphore_infos: &[SemaphoreSubmitInfo],
        wait_is_timeline: bool,
        signal_is_timeline: bool,
    ) -> Result {
        if (wait_is_timeline || signal_is_timeline) && !self.uses_timeline {
            return Err(TestError::harness(
                "a timeline submit info was added to a wrapper created without timeline support",
            ));
        }

        validate_values("wait", wait_semaphore_infos, wait_is_timeline)?;
        validate_values("signal", signal_semaphore_infos, signal_is_timeline)?;

        self.per_submits.push(PerSubmit {
            wait_semaphore_infos: wait_semaphore_infos.into(),
            command_buffer_infos: command_buffer_infos.into(),
            signal_semaphore_infos: signal_semaphore_infos.into(),
            wait_is_timeline,
            signal_is_timeline,
        });

        Ok(())
    }

    /// Submits every accumulated submit info to `queue` in a single call, and clears them.
    ///
    /// `fence` may be `vk::Fence::null()`. The call returns as soon as the provider accepted
    /// the work; it doesn't wait for the work to execute.
    pub fn queue_submit(&mut self, queue: vk::Queue, fence: vk::Fence) -> Result {
        debug!(
            "submitting {} submit info(s) to {queue:?} ({}, fence: {fence:?})",
            self.per_submits.len(),
            self.sync_type,
        );

        match self.sync_type {
            SynchronizationType::Synchronization2 => self.submit2(queue, fence)?,
            SynchronizationType::Legacy => self.submit(queue, fence)?,
        }

        self.per_submits.clear();

        Ok(())
    }

    fn submit2(&self, queue: vk::Queue, fence: vk::Fence) -> Result {
        let mut submit_infos = SmallVec::<[_; 4]>::with_capacity(self.per_submits.len());
        submit_infos.extend(self.per_submits.iter().map(|per_submit| SubmitInfo2 {
            wait_semaphore_infos: &per_submit.wait_semaphore_infos,
            command_buffer_infos: &per_submit.command_buffer_infos,
            signal_semaphore_infos: &per_submit.signal_semaphore_infos,
        }));

        self.provider
            .queue_submit2(queue, &submit_infos, fence)
            .checked("vkQueueSubmit2")
    }

    fn submit(&self, queue: vk::Queue, fence: vk::Fence) -> Result {
        let per_submit_infos: SmallVec<[_; 4]> = self
            .per_submits
            .iter()
            .map(|per_submit| {
                // Binary semaphores ignore their entry in the value arrays, but the arrays must
                // have one entry per semaphore.
                PerSubmitInfo {
                    wait_semaphores_vk: per_submit
                        .wait_semaphore_infos
                        .iter()
                        .map(|info| info.semaphore)
                        .collect(),
                    wait_values_vk: per_submit
                        .wait_semaphore_infos
                        .iter()
                        .map(|info| info.value)
                        .collect(),
                    wait_dst_stage_mask_vk: per_submit
                        .wait_semaphore_infos
                        .iter()
                        .map(|info| {
                            let stage_mask = convert_stage_mask(info.stage_mask);

                            if stage_mask.is_empty() {
                                vk::PipelineStageFlags::TOP_OF_PIPE
                            } else {
                                stage_mask
                            }
                        })
                        .collect(),
                    command_buffers_vk: per_submit
                        .command_buffer_infos
                        .iter()
                        .map(|info| info.command_buffer)
                        .collect(),
                    signal_semaphores_vk: per_submit
                        .signal_semaphore_infos
                        .iter()
                        .map(|info| info.semaphore)
                        .collect(),
                    signal_values_vk: per_submit
                        .signal_semaphore_infos
                        .iter()
                        .map(|info| info.value)
                        .collect(),
                    has_timeline: per_submit.wait_is_timeline || per_submit.signal_is_timeline,
                }
            })
            .collect();

        let mut submit_infos = SmallVec::<[_; 4]>::with_capacity(per_submit_infos.len());
        submit_infos.extend(per_submit_infos.iter().map(|per_submit| SubmitInfo {
            wait_semaphores: &per_submit.wait_semaphores_vk,
            wait_dst_stage_mask: &per_submit.wait_dst_stage_mask_vk,
            command_buffers: &per_submit.command_buffers_vk,
            signal_semaphores: &per_submit.signal_semaphores_vk,
            timeline_semaphore_submit_info: per_submit.has_timeline.then(|| {
                TimelineSemaphoreSubmitInfo {
                    wait_semaphore_values: &per_submit.wait_values_vk,
                    signal_semaphore_values: &per_submit.signal_values_vk,
                }
            }),
        }));

        self.provider
            .queue_submit(queue, &submit_infos, fence)
            .checked("vkQueueSubmit")
    }

    /// Records a pipeline barrier with the protocol of this wrapper.
    #[inline]
    pub fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &DependencyInfo<'_>,
    ) {
        cmd_pipeline_barrier(&*self.provider, self.sync_type, command_buffer, dependency_info);
    }

    #[inline]
    pub fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        dependency_info: &DependencyInfo<'_>,
    ) {
        cmd_set_event(
            &*self.provider,
            self.sync_type,
            command_buffer,
            event,
            dependency_info,
        );
    }

    #[inline]
    pub fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stage_mask: vk::PipelineStageFlags2,
    ) {
        cmd_reset_event(&*self.provider, self.sync_type, command_buffer, event, stage_mask);
    }

    #[inline]
    pub fn cmd_wait_events(
        &self,
        command_buffer: vk::CommandBuffer,
        events: &[vk::Event],
        dependency_infos: &[DependencyInfo<'_>],
    ) {
        cmd_wait_events(
            &*self.provider,
            self.sync_type,
            command_buffer,
            events,
            dependency_infos,
        );
    }
}

impl fmt::Debug for SynchronizationWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizationWrapper")
            .field("sync_type", &self.sync_type)
            .field("uses_timeline", &self.uses_timeline)
            .field("submit_info_count", &self.per_submits.len())
            .finish_non_exhaustive()
    }
}

fn validate_values(list: &str, infos: &[SemaphoreSubmitInfo], is_timeline: bool) -> Result {
    for (index, info) in infos.iter().enumerate() {
        if is_timeline && info.value == 0 {
            return Err(TestError::harness(format!(
                "{list} {index} of a timeline {list} list has no timeline value",
            )));
        }

        if !is_timeline && info.value != 0 {
            return Err(TestError::harness(format!(
                "{list} {index} of a binary {list} list has timeline value {}",
                info.value,
            )));
        }
    }

    Ok(())
}
