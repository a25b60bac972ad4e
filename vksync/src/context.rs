//! The context shared by every case of a test group.

use crate::{
    config::Config,
    operation::OperationName,
    provider::Provider,
    resource::ResourceDescription,
    sync::{SemaphoreKind, SynchronizationType},
    ProviderResultExt, Result, SkipReason,
};
use ash::vk;
use log::warn;
use std::{fmt, sync::Arc};

/// A queue of the device, with the capabilities of its family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Queue {
    pub handle: vk::Queue,
    pub family_index: u32,
    pub index: u32,
    pub flags: vk::QueueFlags,
}

impl Queue {
    /// Returns whether the queue can execute work that needs `required`.
    #[inline]
    pub fn supports(&self, required: vk::QueueFlags) -> bool {
        queue_flags_support(self.flags, required)
    }
}

/// Returns whether a family with `flags` can execute work that needs `required`. Graphics and
/// compute families support transfers even when they don't advertise it.
pub fn queue_flags_support(flags: vk::QueueFlags, required: vk::QueueFlags) -> bool {
    let mut flags = flags;

    if flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE) {
        flags |= vk::QueueFlags::TRANSFER;
    }

    flags.contains(required)
}

/// What one case runs: a write and a read operation on a resource, with a protocol and a
/// semaphore kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestParams {
    pub sync_type: SynchronizationType,
    pub semaphore_kind: SemaphoreKind,
    pub write: OperationName,
    pub read: OperationName,
    pub resource: ResourceDescription,
    /// The seed of every random choice the case makes.
    pub seed: u64,
}

/// The device and configuration that cases run against.
///
/// The context is created once per test group and passed to every case by reference. Cases run
/// one after the other; a case owns every object it creates and destroys them before it
/// returns.
pub struct TestContext {
    provider: Arc<dyn Provider>,
    config: Config,
    queues: Vec<Queue>,
}

impl TestContext {
    pub fn new(provider: Arc<dyn Provider>, config: Config) -> Result<Self> {
        let mut queues = Vec::new();

        for (family_index, properties) in provider.queue_family_properties().iter().enumerate() {
            let family_index = family_index as u32;

            for index in 0..properties.queue_count {
                let handle = provider
                    .get_device_queue(family_index, index)
                    .checked("vkGetDeviceQueue")?;

                queues.push(Queue {
                    handle,
                    family_index,
                    index,
                    flags: properties.queue_flags,
                });
            }
        }

        Ok(TestContext {
            provider,
            config,
            queues,
        })
    }

    #[inline]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns every queue of the device, ordered by family and then by index.
    #[inline]
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Returns the first queue of the first family, which must support graphics and compute.
    pub fn universal_queue(&self) -> Result<Queue, SkipReason> {
        self.queues
            .first()
            .filter(|queue| {
                queue.family_index == 0
                    && queue.supports(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .copied()
            .ok_or_else(|| SkipReason::new("No universal queue"))
    }

    /// Returns the first queue that supports `required` and isn't `exclude`.
    pub fn find_queue(
        &self,
        required: vk::QueueFlags,
        exclude: Option<&Queue>,
    ) -> Result<Queue, SkipReason> {
        self.queues
            .iter()
            .find(|queue| queue.supports(required) && Some(*queue) != exclude)
            .copied()
            .ok_or_else(|| SkipReason::new(format!("No queue supporting {required:?}")))
    }

    /// Waits for the device to go idle and drains the validation messages the provider
    /// collected.
    pub fn teardown(&self) -> Result<Vec<String>> {
        self.provider
            .device_wait_idle()
            .checked("vkDeviceWaitIdle")?;

        let messages = self.provider.take_validation_messages();

        for message in &messages {
            warn!("validation: {message}");
        }

        Ok(messages)
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("device", &self.provider.properties().device_name)
            .field("config", &self.config)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_is_implied() {
        type F = vk::QueueFlags;

        assert!(queue_flags_support(F::GRAPHICS, F::TRANSFER));
        assert!(queue_flags_support(F::COMPUTE, F::TRANSFER));
        assert!(queue_flags_support(F::TRANSFER, F::TRANSFER));
        assert!(!queue_flags_support(F::TRANSFER, F::COMPUTE));
        assert!(!queue_flags_support(F::COMPUTE, F::GRAPHICS));
        assert!(queue_flags_support(F::GRAPHICS | F::COMPUTE, F::COMPUTE | F::TRANSFER));
    }
}
