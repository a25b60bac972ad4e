//! Owned synchronization primitives and command buffers.

use super::SemaphoreKind;
use crate::{
    provider::{Provider, SemaphoreCreateInfo, SemaphoreWaitInfo},
    ProviderResultExt, Result, TestError,
};
use ash::vk;
use smallvec::SmallVec;
use std::{fmt, sync::Arc, time::Duration};

/// The outcome of a host wait that is allowed to time out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

impl WaitOutcome {
    fn from_result(result: ash::prelude::VkResult<()>, call: &'static str) -> Result<Self> {
        match result {
            Ok(()) => Ok(WaitOutcome::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(WaitOutcome::TimedOut),
            Err(result) => Err(TestError::Provider { call, result }),
        }
    }

    /// Turns a timeout into an error, for waits that are expected to succeed.
    #[inline]
    pub fn expect_signaled(self, call: &'static str) -> Result {
        match self {
            WaitOutcome::Signaled => Ok(()),
            WaitOutcome::TimedOut => Err(TestError::Provider {
                call,
                result: vk::Result::TIMEOUT,
            }),
        }
    }
}

/// A binary or timeline semaphore, destroyed when dropped.
pub struct Semaphore {
    provider: Arc<dyn Provider>,
    handle: vk::Semaphore,
    kind: SemaphoreKind,
}

impl Semaphore {
    /// Creates a semaphore. `initial_value` is ignored for binary semaphores.
    pub fn new(
        provider: &Arc<dyn Provider>,
        kind: SemaphoreKind,
        initial_value: u64,
    ) -> Result<Self> {
        if kind.is_timeline() && !provider.enabled_features().timeline_semaphore {
            return Err(TestError::not_supported(
                "the `timeline_semaphore` feature is not supported",
            ));
        }

        let handle = provider
            .create_semaphore(&SemaphoreCreateInfo {
                semaphore_type: kind.to_vk(),
                initial_value: if kind.is_timeline() { initial_value } else { 0 },
            })
            .checked("vkCreateSemaphore")?;

        Ok(Semaphore {
            provider: provider.clone(),
            handle,
            kind,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    #[inline]
    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    /// Returns the current counter value of a timeline semaphore.
    #[inline]
    pub fn counter_value(&self) -> Result<u64> {
        self.provider
            .get_semaphore_counter_value(self.handle)
            .checked("vkGetSemaphoreCounterValue")
    }

    /// Signals a timeline semaphore from the host.
    #[inline]
    pub fn signal(&self, value: u64) -> Result {
        self.provider
            .signal_semaphore(self.handle, value)
            .checked("vkSignalSemaphore")
    }

    /// Waits on the host until a timeline semaphore reaches `value`.
    #[inline]
    pub fn wait(&self, value: u64, timeout: Duration) -> Result<WaitOutcome> {
        wait_semaphores(&*self.provider, &[self], &[value], false, timeout)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.provider.destroy_semaphore(self.handle);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Waits on the host until every semaphore (or, with `wait_any`, one of them) reaches its value.
pub fn wait_semaphores(
    provider: &dyn Provider,
    semaphores: &[&Semaphore],
    values: &[u64],
    wait_any: bool,
    timeout: Duration,
) -> Result<WaitOutcome> {
    if semaphores.len() != values.len() {
        return Err(TestError::harness(format!(
            "{} semaphores were waited on with {} values",
            semaphores.len(),
            values.len(),
        )));
    }

    let handles: SmallVec<[_; 4]> = semaphores
        .iter()
        .map(|semaphore| semaphore.handle)
        .collect();
    let wait_info = SemaphoreWaitInfo {
        flags: if wait_any {
            vk::SemaphoreWaitFlags::ANY
        } else {
            vk::SemaphoreWaitFlags::empty()
        },
        semaphores: &handles,
        values,
    };

    WaitOutcome::from_result(
        provider.wait_semaphores(&wait_info, timeout),
        "vkWaitSemaphores",
    )
}

/// A fence, destroyed when dropped.
pub struct Fence {
    provider: Arc<dyn Provider>,
    handle: vk::Fence,
}

impl Fence {
    pub fn new(provider: &Arc<dyn Provider>, signaled: bool) -> Result<Self> {
        let handle = provider.create_fence(signaled).checked("vkCreateFence")?;

        Ok(Fence {
            provider: provider.clone(),
            handle,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    #[inline]
    pub fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        WaitOutcome::from_result(
            self.provider.wait_for_fences(&[self.handle], true, timeout),
            "vkWaitForFences",
        )
    }

    #[inline]
    pub fn is_signaled(&self) -> Result<bool> {
        self.provider
            .get_fence_status(self.handle)
            .checked("vkGetFenceStatus")
    }

    #[inline]
    pub fn reset(&self) -> Result {
        self.provider
            .reset_fences(&[self.handle])
            .checked("vkResetFences")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.provider.destroy_fence(self.handle);
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// An event, destroyed when dropped.
pub struct Event {
    provider: Arc<dyn Provider>,
    handle: vk::Event,
}

impl Event {
    pub fn new(provider: &Arc<dyn Provider>) -> Result<Self> {
        let handle = provider.create_event().checked("vkCreateEvent")?;

        Ok(Event {
            provider: provider.clone(),
            handle,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Event {
        self.handle
    }

    /// Sets the event from the host.
    #[inline]
    pub fn set(&self) -> Result {
        self.provider.set_event(self.handle).checked("vkSetEvent")
    }

    #[inline]
    pub fn reset(&self) -> Result {
        self.provider.reset_event(self.handle).checked("vkResetEvent")
    }

    #[inline]
    pub fn is_set(&self) -> Result<bool> {
        self.provider
            .get_event_status(self.handle)
            .checked("vkGetEventStatus")
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.provider.destroy_event(self.handle);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// A primary command buffer allocated for one queue family, freed when dropped.
pub struct CommandBuffer {
    provider: Arc<dyn Provider>,
    handle: vk::CommandBuffer,
    queue_family_index: u32,
}

impl CommandBuffer {
    pub fn new(provider: &Arc<dyn Provider>, queue_family_index: u32) -> Result<Self> {
        let handle = provider
            .allocate_command_buffer(queue_family_index)
            .checked("vkAllocateCommandBuffers")?;

        Ok(CommandBuffer {
            provider: provider.clone(),
            handle,
            queue_family_index,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn begin(&self) -> Result {
        self.provider
            .begin_command_buffer(self.handle)
            .checked("vkBeginCommandBuffer")
    }

    #[inline]
    pub fn end(&self) -> Result {
        self.provider
            .end_command_buffer(self.handle)
            .checked("vkEndCommandBuffer")
    }

    /// Begins the command buffer, records into it with `f` and ends it.
    pub fn record(&self, f: impl FnOnce(vk::CommandBuffer) -> Result) -> Result {
        self.begin()?;
        f(self.handle)?;
        self.end()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.provider.free_command_buffer(self.handle);
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}
