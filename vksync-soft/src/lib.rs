//! A host-only device behind the `vksync` [`Provider`] trait.
//!
//! The soft device executes everything on the CPU. It has no shader compiler and no memory
//! heaps: buffers and images are byte vectors, a shader module is the name of one of a handful
//! of built-in [`Program`]s, and a queue is a list of pending batches. Work executes eagerly,
//! during the call that made it executable (a submission, a host signal, a host `vkSetEvent`),
//! so that waits on the host only ever wait for other host threads.
//!
//! What the device does check is the API contract that synchronization tests exercise:
//!
//! - semaphore waits (binary and timeline, including wait-before-signal) and signals,
//! - queue family ownership of exclusive resources,
//! - image layouts, as tracked through barriers and compared with the layouts commands name,
//! - buffer and image usage flags, and the queue capabilities commands need.
//!
//! Misuse is reported through [`Provider::take_validation_messages`] rather than with a panic.
//!
//! [`Faults`] can make the device misbehave on purpose, to check that a test notices.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use vksync::{config::Config, context::TestContext, provider::Provider};
//! use vksync_soft::{SoftDevice, SoftDeviceCreateInfo};
//!
//! let device = SoftDevice::new(SoftDeviceCreateInfo::default()).unwrap();
//! let provider: Arc<dyn Provider> = Arc::new(device);
//! let context = TestContext::new(provider, Config::default()).unwrap();
//!
//! assert_eq!(context.queues().len(), 4);
//! ```
//!
//! [`Provider`]: vksync::provider::Provider
//! [`Provider::take_validation_messages`]: vksync::provider::Provider::take_validation_messages

use self::{
    command::{Barriers, Command, Launch},
    engine::{Batch, Messages, QueueState, SemaphoreOp, State},
    object::{
        Buffer, CommandBuffer, CommandBufferState, Event, Fence, Image, Ownership, Pipeline,
        Semaphore, ShaderModule,
    },
    program::required_buffer_usage,
};
use ash::{prelude::VkResult, vk};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use vksync::{
    context::queue_flags_support,
    provider::{
        BufferCreateInfo, BufferMemoryBarrier, CommandBufferSubmitInfo, DependencyInfo,
        Features, ImageCreateInfo, ImageMemoryBarrier, MemoryBarrier, PipelineBinding,
        PipelineCreateInfo, Properties, Provider, QueueFamilyProperties, SemaphoreCreateInfo,
        SemaphoreSubmitInfo, SemaphoreWaitInfo, SubmitInfo, SubmitInfo2,
    },
    resource::texel_block_size,
};

pub use self::program::{BindingMismatch, Program, INDEX_SIZE, VERTEX_SIZE};

mod command;
mod engine;
mod object;
mod program;

/// Parameters to create a [`SoftDevice`]. Every field has a default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftDeviceCreateInfo {
    pub device_name: String,

    /// The queue families of the device, in family index order.
    ///
    /// The default is a universal family with two queues, a compute family and a transfer
    /// family.
    pub queue_families: Vec<QueueFamilyDesc>,

    /// The features the device reports as enabled.
    pub features: Features,

    /// The largest difference allowed between the counter of a timeline semaphore and a value
    /// it's signaled or waited with.
    pub max_timeline_semaphore_value_difference: u64,

    /// How long `vkQueueWaitIdle` and `vkDeviceWaitIdle` wait for blocked work before they
    /// consider the device hung, in milliseconds.
    pub hang_timeout_ms: u64,

    pub faults: Faults,
}

impl Default for SoftDeviceCreateInfo {
    fn default() -> Self {
        SoftDeviceCreateInfo {
            device_name: "vksync soft device".to_owned(),
            queue_families: vec![
                QueueFamilyDesc {
                    graphics: true,
                    compute: true,
                    transfer: true,
                    queue_count: 2,
                },
                QueueFamilyDesc {
                    graphics: false,
                    compute: true,
                    transfer: true,
                    queue_count: 1,
                },
                QueueFamilyDesc {
                    graphics: false,
                    compute: false,
                    transfer: true,
                    queue_count: 1,
                },
            ],
            features: Features::all(),
            max_timeline_semaphore_value_difference: i32::MAX as u64,
            hang_timeout_ms: 20_000,
            faults: Faults::default(),
        }
    }
}

/// One queue family of a [`SoftDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueFamilyDesc {
    #[serde(default)]
    pub graphics: bool,
    #[serde(default)]
    pub compute: bool,
    #[serde(default)]
    pub transfer: bool,
    pub queue_count: u32,
}

impl QueueFamilyDesc {
    /// Returns the flags the family advertises.
    pub fn queue_flags(&self) -> vk::QueueFlags {
        let mut flags = vk::QueueFlags::empty();

        if self.graphics {
            flags |= vk::QueueFlags::GRAPHICS;
        }

        if self.compute {
            flags |= vk::QueueFlags::COMPUTE;
        }

        if self.transfer {
            flags |= vk::QueueFlags::TRANSFER;
        }

        flags
    }
}

/// Deliberate misbehavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Faults {
    /// Execute batches without waiting for their semaphore wait operations.
    pub ignore_semaphore_waits: bool,

    /// Flip the first byte of every region copied by a transfer command.
    pub corrupt_copies: bool,
}

/// Error that can happen when creating a [`SoftDevice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SoftDeviceError {
    NoQueueFamilies,
    /// The queue family at this index has no queues.
    EmptyQueueFamily(u32),
    /// The queue family at this index supports neither graphics, compute nor transfers.
    NoQueueCapabilities(u32),
    ZeroMaxValueDifference,
}

impl fmt::Display for SoftDeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoQueueFamilies => f.write_str("a device needs at least one queue family"),
            Self::EmptyQueueFamily(index) => write!(f, "queue family {index} has no queues"),
            Self::NoQueueCapabilities(index) => {
                write!(f, "queue family {index} doesn't support any kind of work")
            }
            Self::ZeroMaxValueDifference => f.write_str(
                "`max_timeline_semaphore_value_difference` must be greater than zero",
            ),
        }
    }
}

impl Error for SoftDeviceError {}

/// A device that executes on the host.
pub struct SoftDevice {
    properties: Properties,
    features: Features,
    families: Vec<QueueFamilyProperties>,
    // Queue handles, indexed by family and then by queue index.
    queues: Vec<Vec<vk::Queue>>,
    hang_timeout: Duration,
    state: Mutex<State>,
    progress: Condvar,
    messages: Arc<Messages>,
}

impl SoftDevice {
    pub fn new(create_info: SoftDeviceCreateInfo) -> Result<Self, SoftDeviceError> {
        let SoftDeviceCreateInfo {
            device_name,
            queue_families,
            features,
            max_timeline_semaphore_value_difference,
            hang_timeout_ms,
            faults,
        } = create_info;

        if queue_families.is_empty() {
            return Err(SoftDeviceError::NoQueueFamilies);
        }

        if max_timeline_semaphore_value_difference == 0 {
            return Err(SoftDeviceError::ZeroMaxValueDifference);
        }

        let messages = Arc::new(Messages::default());
        let mut state = State::new(
            messages.clone(),
            faults,
            max_timeline_semaphore_value_difference,
        );
        let mut families = Vec::with_capacity(queue_families.len());
        let mut queues = Vec::with_capacity(queue_families.len());

        for (family_index, desc) in queue_families.iter().enumerate() {
            let family_index = family_index as u32;

            if desc.queue_count == 0 {
                return Err(SoftDeviceError::EmptyQueueFamily(family_index));
            }

            if desc.queue_flags().is_empty() {
                return Err(SoftDeviceError::NoQueueCapabilities(family_index));
            }

            families.push(QueueFamilyProperties {
                queue_flags: desc.queue_flags(),
                queue_count: desc.queue_count,
            });

            let family_queues = (0..desc.queue_count)
                .map(|_| {
                    let handle = state.new_handle();
                    state.queues.push(QueueState::new(handle, family_index));

                    handle
                })
                .collect();
            queues.push(family_queues);
        }

        if faults != Faults::default() {
            warn!("the soft device was created with faults: {faults:?}");
        }

        Ok(SoftDevice {
            properties: Properties {
                device_name,
                api_version: vk::API_VERSION_1_3,
                max_timeline_semaphore_value_difference,
            },
            features,
            families,
            queues,
            hang_timeout: Duration::from_millis(hang_timeout_ms),
            state: Mutex::new(state),
            progress: Condvar::new(),
            messages,
        })
    }

    /// Mutates the state, then executes whatever became executable and wakes up waiting host
    /// threads.
    fn update<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock();
        let result = f(&mut *state);
        state.progress();
        drop(state);

        self.progress.notify_all();

        result
    }

    /// Blocks until `ready` returns `true`, or returns `Err(vk::Result::TIMEOUT)` once `timeout`
    /// has elapsed.
    fn wait_until(
        &self,
        timeout: Duration,
        mut ready: impl FnMut(&State) -> VkResult<bool>,
    ) -> VkResult<()> {
        // A timeout too large to represent as an instant waits forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        loop {
            if ready(&*state)? {
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out() {
                        return if ready(&*state)? {
                            Ok(())
                        } else {
                            Err(vk::Result::TIMEOUT)
                        };
                    }
                }
                None => self.progress.wait(&mut state),
            }
        }
    }

    /// Waits for `queue`, or every queue if `None`, to go idle.
    ///
    /// Work that is still blocked after the hang timeout is dropped and the wait returns
    /// `ERROR_DEVICE_LOST`. The device stays usable afterwards.
    fn wait_idle(&self, queue: Option<vk::Queue>) -> VkResult<()> {
        let queue_index = match queue {
            Some(queue) => Some(self.state.lock().queue_index(queue)?),
            None => None,
        };

        let is_idle = |state: &State| {
            Ok(match queue_index {
                Some(index) => state.queues[index].is_idle(),
                None => state.is_idle(),
            })
        };

        match self.wait_until(self.hang_timeout, is_idle) {
            Err(vk::Result::TIMEOUT) => {
                let mut state = self.state.lock();
                let abandoned = state.abandon_pending_work();
                state.report(format!(
                    "the device hung with {abandoned} batch(es) blocked for {:?}; they were \
                    abandoned",
                    self.hang_timeout,
                ));

                Err(vk::Result::ERROR_DEVICE_LOST)
            }
            result => result,
        }
    }

    fn family_flags(&self, queue_family_index: u32) -> VkResult<vk::QueueFlags> {
        self.families
            .get(queue_family_index as usize)
            .map(|family| family.queue_flags)
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    /// Appends the command `f` returns to a command buffer in the recording state.
    ///
    /// `required` lists the queue capabilities of which the command needs any one.
    fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        command_name: &str,
        required: vk::QueueFlags,
        f: impl FnOnce(&State, &mut CommandBuffer) -> Option<Command>,
    ) {
        let mut state = self.state.lock();

        // Taken out of the map so that `f` can look at the rest of the state.
        let Some(mut recording) = state.command_buffers.remove(&command_buffer) else {
            state.report(format!(
                "{command_name} was recorded into {command_buffer:?}, which doesn't exist",
            ));
            return;
        };

        if recording.state != CommandBufferState::Recording {
            state.report(format!(
                "{command_name} was recorded into {command_buffer:?} in the {:?} state",
                recording.state,
            ));
        } else if !supports_any(recording.queue_flags, required) {
            state.report(format!(
                "{command_name} needs a queue supporting {required:?}, but {command_buffer:?} \
                belongs to a family with {:?}",
                recording.queue_flags,
            ));
        } else if let Some(command) = f(&*state, &mut recording) {
            trace!("{command_buffer:?}: recorded {}", command.name());
            recording.commands.push(command);
        }

        state.command_buffers.insert(command_buffer, recording);
    }

    fn record_launch(&self, command_buffer: vk::CommandBuffer, launch: Launch) {
        let required = if launch.is_dispatch() {
            vk::QueueFlags::COMPUTE
        } else {
            vk::QueueFlags::GRAPHICS
        };
        let command_name = launch.name();

        self.record(command_buffer, command_name, required, |state, recording| {
            let Some(pipeline) = recording.bound_pipeline else {
                state.report(format!("{command_name} was recorded without a bound pipeline"));
                return None;
            };

            let Some(bound) = state.pipelines.get(&pipeline) else {
                state.report(format!(
                    "{command_name} uses {pipeline:?}, which was destroyed",
                ));
                return None;
            };

            if bound.is_compute() != launch.is_dispatch() {
                state.report(format!(
                    "{command_name} was recorded with {pipeline:?} bound, which is a {} pipeline",
                    if bound.is_compute() { "compute" } else { "graphics" },
                ));
                return None;
            }

            if let Some(buffer) = launch.indirect_buffer() {
                check_buffer_usage(
                    state,
                    command_name,
                    buffer,
                    vk::BufferUsageFlags::INDIRECT_BUFFER,
                );
            }

            if matches!(
                launch,
                Launch::DrawIndexed { .. } | Launch::DrawIndexedIndirect { .. }
            ) && !bound
                .bindings
                .iter()
                .any(|binding| matches!(binding, PipelineBinding::IndexBuffer(_)))
            {
                state.report(format!("{command_name} was recorded without an index buffer"));
                return None;
            }

            Some(Command::Launch { pipeline, launch })
        });
    }

    fn require_synchronization2(&self, command_name: &str) -> bool {
        if !self.features.synchronization2 {
            self.messages.report(format!(
                "{command_name} needs the `synchronization2` feature, which isn't enabled",
            ));
        }

        self.features.synchronization2
    }
}

impl fmt::Debug for SoftDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftDevice")
            .field("properties", &self.properties)
            .field("features", &self.features)
            .field("families", &self.families)
            .field("hang_timeout", &self.hang_timeout)
            .finish_non_exhaustive()
    }
}

/// Returns whether a family with `flags` supports any of the capabilities in `required`, or
/// `true` if nothing is required.
fn supports_any(flags: vk::QueueFlags, required: vk::QueueFlags) -> bool {
    required.is_empty()
        || [
            vk::QueueFlags::GRAPHICS,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::TRANSFER,
        ]
        .into_iter()
        .any(|flag| required.contains(flag) && queue_flags_support(flags, flag))
}

fn check_buffer_usage(
    state: &State,
    command_name: &str,
    buffer: vk::Buffer,
    usage: vk::BufferUsageFlags,
) {
    match state.buffers.get(&buffer) {
        Some(object) if object.usage.contains(usage) => {}
        Some(object) => state.report(format!(
            "{command_name} uses {buffer:?} as {usage:?}, but it was created with {:?}",
            object.usage,
        )),
        None => state.report(format!("{command_name} uses {buffer:?}, which doesn't exist")),
    }
}

fn check_image_usage(
    state: &State,
    command_name: &str,
    image: vk::Image,
    usage: vk::ImageUsageFlags,
) {
    match state.images.get(&image) {
        Some(object) if object.usage.contains(usage) => {}
        Some(object) => state.report(format!(
            "{command_name} uses {image:?} as {usage:?}, but it was created with {:?}",
            object.usage,
        )),
        None => state.report(format!("{command_name} uses {image:?}, which doesn't exist")),
    }
}

fn check_events_exist(state: &State, command_name: &str, events: &[vk::Event]) -> bool {
    let missing = events
        .iter()
        .filter(|event| !state.events.contains_key(event))
        .inspect(|event| {
            state.report(format!("{command_name} uses {event:?}, which doesn't exist"));
        })
        .count();

    missing == 0
}

/// Returns the timeline values of a legacy batch, or `None` if the batch needs them and they're
/// missing or don't line up with its semaphores.
fn legacy_values<'a>(
    state: &State,
    submit: &SubmitInfo<'a>,
) -> Option<(&'a [u64], &'a [u64])> {
    let uses_timeline = submit
        .wait_semaphores
        .iter()
        .chain(submit.signal_semaphores)
        .any(|semaphore| {
            state
                .semaphores
                .get(semaphore)
                .is_some_and(Semaphore::is_timeline)
        });

    match submit.timeline_semaphore_submit_info {
        None if uses_timeline => {
            state.report(
                "vkQueueSubmit: a batch uses a timeline semaphore, but no \
                VkTimelineSemaphoreSubmitInfo is chained"
                    .to_owned(),
            );
            None
        }
        None => Some((Default::default(), Default::default())),
        Some(info) => {
            let waits_match = info.wait_semaphore_values.is_empty()
                || info.wait_semaphore_values.len() == submit.wait_semaphores.len();
            let signals_match = info.signal_semaphore_values.is_empty()
                || info.signal_semaphore_values.len() == submit.signal_semaphores.len();

            if uses_timeline && !(waits_match && signals_match) {
                state.report(format!(
                    "vkQueueSubmit: {} wait value(s) for {} wait semaphore(s) and {} signal \
                    value(s) for {} signal semaphore(s)",
                    info.wait_semaphore_values.len(),
                    submit.wait_semaphores.len(),
                    info.signal_semaphore_values.len(),
                    submit.signal_semaphores.len(),
                ));
                return None;
            }

            Some((info.wait_semaphore_values, info.signal_semaphore_values))
        }
    }
}

fn semaphore_ops(semaphores: &[vk::Semaphore], values: &[u64]) -> SmallVec<[SemaphoreOp; 4]> {
    semaphores
        .iter()
        .enumerate()
        .map(|(index, &semaphore)| SemaphoreOp {
            semaphore,
            value: values.get(index).copied().unwrap_or(0),
        })
        .collect()
}

fn semaphore_infos(state: &State, infos: &[SemaphoreSubmitInfo]) -> SmallVec<[SemaphoreOp; 4]> {
    infos
        .iter()
        .map(|info| {
            if info.device_index != 0 {
                state.report(format!(
                    "vkQueueSubmit2: {:?} uses device index {} on a single-device group",
                    info.semaphore, info.device_index,
                ));
            }

            SemaphoreOp {
                semaphore: info.semaphore,
                value: info.value,
            }
        })
        .collect()
}

fn command_buffer_infos(
    state: &State,
    infos: &[CommandBufferSubmitInfo],
) -> SmallVec<[vk::CommandBuffer; 1]> {
    infos
        .iter()
        .map(|info| {
            if info.device_mask > 1 {
                state.report(format!(
                    "vkQueueSubmit2: {:?} uses device mask {:#x} on a single-device group",
                    info.command_buffer, info.device_mask,
                ));
            }

            info.command_buffer
        })
        .collect()
}

impl Provider for SoftDevice {
    #[inline]
    fn properties(&self) -> &Properties {
        &self.properties
    }

    #[inline]
    fn enabled_features(&self) -> &Features {
        &self.features
    }

    #[inline]
    fn queue_family_properties(&self) -> &[QueueFamilyProperties] {
        &self.families
    }

    fn get_device_queue(&self, queue_family_index: u32, queue_index: u32) -> VkResult<vk::Queue> {
        self.queues
            .get(queue_family_index as usize)
            .and_then(|family| family.get(queue_index as usize))
            .copied()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn image_format_supported(&self, create_info: &ImageCreateInfo) -> VkResult<()> {
        let vk::Extent3D {
            width,
            height,
            depth,
        } = create_info.extent;

        let shape_supported = match create_info.image_type {
            vk::ImageType::TYPE_1D => height == 1 && depth == 1,
            vk::ImageType::TYPE_2D => depth == 1,
            vk::ImageType::TYPE_3D => true,
            _ => false,
        };

        if texel_block_size(create_info.format).is_none()
            || create_info.samples != vk::SampleCountFlags::TYPE_1
            || !shape_supported
            || width == 0
            || height == 0
            || depth == 0
        {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }

        Ok(())
    }

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> VkResult<vk::Buffer> {
        if create_info.size == 0 || create_info.usage.is_empty() {
            self.messages.report(format!(
                "vkCreateBuffer: a buffer needs a size and usage flags, got {} bytes and {:?}",
                create_info.size, create_info.usage,
            ));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let size =
            usize::try_from(create_info.size).map_err(|_| vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let mut state = self.state.lock();
        let handle = state.new_handle();

        state.buffers.insert(
            handle,
            Buffer {
                usage: create_info.usage,
                host_visible: create_info.host_visible,
                ownership: Ownership::new(create_info.sharing_mode),
                data: vec![0; size],
            },
        );

        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if buffer != vk::Buffer::null() && self.state.lock().buffers.remove(&buffer).is_none() {
            self.messages
                .report(format!("vkDestroyBuffer: {buffer:?} doesn't exist"));
        }
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let Some(object) = state.buffers.get_mut(&buffer) else {
            state.report(format!("a host write to {buffer:?}, which doesn't exist"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };

        if !object.host_visible {
            state.messages.report(format!(
                "a host write to {buffer:?}, which isn't host-visible",
            ));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let Some(range) = object.range(offset, data.len() as u64) else {
            state.messages.report(format!(
                "a host write of {} bytes at {offset} overruns {buffer:?}",
                data.len(),
            ));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };

        object.data[range].copy_from_slice(data);

        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<Vec<u8>> {
        let state = self.state.lock();

        let Some(object) = state.buffers.get(&buffer) else {
            state.report(format!("a host read of {buffer:?}, which doesn't exist"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };

        if !object.host_visible {
            state.report(format!("a host read of {buffer:?}, which isn't host-visible"));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        match object.range(offset, size) {
            Some(range) => Ok(object.data[range].to_vec()),
            None => {
                state.report(format!(
                    "a host read of {size} bytes at {offset} overruns {buffer:?}",
                ));
                Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
            }
        }
    }

    fn create_image(&self, create_info: &ImageCreateInfo) -> VkResult<vk::Image> {
        self.image_format_supported(create_info)?;

        if create_info.usage.is_empty() {
            self.messages
                .report("vkCreateImage: an image needs usage flags".to_owned());
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let texel_size = texel_block_size(create_info.format)
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;
        let vk::Extent3D {
            width,
            height,
            depth,
        } = create_info.extent;
        let size = u64::from(width) * u64::from(height) * u64::from(depth) * u64::from(texel_size);
        let size = usize::try_from(size).map_err(|_| vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        let mut state = self.state.lock();
        let handle = state.new_handle();

        state.images.insert(
            handle,
            Image {
                format: create_info.format,
                extent: create_info.extent,
                texel_size,
                usage: create_info.usage,
                layout: vk::ImageLayout::UNDEFINED,
                ownership: Ownership::new(create_info.sharing_mode),
                data: vec![0; size],
            },
        );

        Ok(handle)
    }

    fn destroy_image(&self, image: vk::Image) {
        if image != vk::Image::null() && self.state.lock().images.remove(&image).is_none() {
            self.messages
                .report(format!("vkDestroyImage: {image:?} doesn't exist"));
        }
    }

    fn create_semaphore(&self, create_info: &SemaphoreCreateInfo) -> VkResult<vk::Semaphore> {
        let semaphore_type = create_info.semaphore_type;

        if semaphore_type == vk::SemaphoreType::TIMELINE && !self.features.timeline_semaphore {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }

        let mut state = self.state.lock();
        let handle = state.new_handle();

        state.semaphores.insert(
            handle,
            Semaphore {
                semaphore_type,
                value: if semaphore_type == vk::SemaphoreType::TIMELINE {
                    create_info.initial_value
                } else {
                    0
                },
                signaled: false,
                unclaimed_signals: 0,
            },
        );

        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if semaphore == vk::Semaphore::null() {
            return;
        }

        let mut state = self.state.lock();

        if state.semaphore_in_use(semaphore) {
            state.report(format!(
                "vkDestroySemaphore: {semaphore:?} is used by a pending batch",
            ));
        }

        if state.semaphores.remove(&semaphore).is_none() {
            state.report(format!("vkDestroySemaphore: {semaphore:?} doesn't exist"));
        }
    }

    fn get_semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        let state = self.state.lock();

        match state.semaphores.get(&semaphore) {
            Some(object) if object.is_timeline() => Ok(object.value),
            Some(_) => {
                state.report(format!(
                    "vkGetSemaphoreCounterValue: {semaphore:?} is a binary semaphore",
                ));
                Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
            }
            None => {
                state.report(format!(
                    "vkGetSemaphoreCounterValue: {semaphore:?} doesn't exist",
                ));
                Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
            }
        }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        self.update(|state| state.host_signal(semaphore, value))
    }

    fn wait_semaphores(
        &self,
        wait_info: &SemaphoreWaitInfo<'_>,
        timeout: Duration,
    ) -> VkResult<()> {
        if wait_info.semaphores.len() != wait_info.values.len() {
            self.messages.report(format!(
                "vkWaitSemaphores: {} semaphore(s) but {} value(s)",
                wait_info.semaphores.len(),
                wait_info.values.len(),
            ));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let wait_any = wait_info.flags.contains(vk::SemaphoreWaitFlags::ANY);

        self.wait_until(timeout, |state| {
            let mut reached = wait_info
                .semaphores
                .iter()
                .zip(wait_info.values)
                .map(|(semaphore, &value)| match state.semaphores.get(semaphore) {
                    Some(object) if object.is_timeline() => Ok(object.value >= value),
                    _ => {
                        state.report(format!(
                            "vkWaitSemaphores: {semaphore:?} isn't a timeline semaphore",
                        ));
                        Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
                    }
                });

            if wait_any {
                reached.try_fold(false, |any, reached| Ok(any || reached?))
            } else {
                reached.try_fold(true, |all, reached| Ok(all && reached?))
            }
        })
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let handle = state.new_handle();
        state.fences.insert(handle, Fence { signaled });

        Ok(handle)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if fence == vk::Fence::null() {
            return;
        }

        let mut state = self.state.lock();

        if state.fence_in_use(fence) {
            state.report(format!("vkDestroyFence: {fence:?} is used by a pending batch"));
        }

        if state.fences.remove(&fence).is_none() {
            state.report(format!("vkDestroyFence: {fence:?} doesn't exist"));
        }
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout: Duration,
    ) -> VkResult<()> {
        self.wait_until(timeout, |state| {
            let mut signaled = fences.iter().map(|fence| match state.fences.get(fence) {
                Some(object) => Ok(object.signaled),
                None => {
                    state.report(format!("vkWaitForFences: {fence:?} doesn't exist"));
                    Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
                }
            });

            if wait_all {
                signaled.try_fold(true, |all, signaled| Ok(all && signaled?))
            } else {
                signaled.try_fold(false, |any, signaled| Ok(any || signaled?))
            }
        })
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.state.lock();

        for &fence in fences {
            if state.fence_in_use(fence) {
                state.report(format!("vkResetFences: {fence:?} is used by a pending batch"));
            }

            match state.fences.get_mut(&fence) {
                Some(object) => object.signaled = false,
                None => {
                    state.report(format!("vkResetFences: {fence:?} doesn't exist"));
                    return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                }
            }
        }

        Ok(())
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = self.state.lock();

        match state.fences.get(&fence) {
            Some(object) => Ok(object.signaled),
            None => {
                state.report(format!("vkGetFenceStatus: {fence:?} doesn't exist"));
                Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
            }
        }
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        let mut state = self.state.lock();
        let handle = state.new_handle();
        state.events.insert(handle, Event { set: false });

        Ok(handle)
    }

    fn destroy_event(&self, event: vk::Event) {
        if event != vk::Event::null() && self.state.lock().events.remove(&event).is_none() {
            self.messages
                .report(format!("vkDestroyEvent: {event:?} doesn't exist"));
        }
    }

    fn set_event(&self, event: vk::Event) -> VkResult<()> {
        self.update(|state| match state.events.get_mut(&event) {
            Some(object) => {
                trace!("host: {event:?} set");
                object.set = true;
                Ok(())
            }
            None => {
                state.report(format!("vkSetEvent: {event:?} doesn't exist"));
                Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
            }
        })
    }

    fn reset_event(&self, event: vk::Event) -> VkResult<()> {
        self.update(|state| match state.events.get_mut(&event) {
            Some(object) => {
                object.set = false;
                Ok(())
            }
            None => {
                state.report(format!("vkResetEvent: {event:?} doesn't exist"));
                Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
            }
        })
    }

    fn get_event_status(&self, event: vk::Event) -> VkResult<bool> {
        let state = self.state.lock();

        match state.events.get(&event) {
            Some(object) => Ok(object.set),
            None => {
                state.report(format!("vkGetEventStatus: {event:?} doesn't exist"));
                Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
            }
        }
    }

    fn create_shader_module(
        &self,
        name: &str,
        stage: vk::ShaderStageFlags,
    ) -> VkResult<vk::ShaderModule> {
        let Some(program) = Program::from_name(name) else {
            debug!("vkCreateShaderModule: there is no program named `{name}`");
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        };

        if !program.supports_stage(stage) {
            debug!("vkCreateShaderModule: `{program}` can't be compiled for {stage:?}");
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }

        let mut state = self.state.lock();
        let handle = state.new_handle();
        state
            .shader_modules
            .insert(handle, ShaderModule { program, stage });

        Ok(handle)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        if module != vk::ShaderModule::null()
            && self.state.lock().shader_modules.remove(&module).is_none()
        {
            self.messages
                .report(format!("vkDestroyShaderModule: {module:?} doesn't exist"));
        }
    }

    fn create_pipeline(&self, create_info: &PipelineCreateInfo<'_>) -> VkResult<vk::Pipeline> {
        type S = vk::ShaderStageFlags;

        let stage = create_info.stage;
        let features = &self.features;
        let feature_present = match stage {
            S::TESSELLATION_CONTROL | S::TESSELLATION_EVALUATION => {
                features.tessellation_shader && features.vertex_pipeline_stores_and_atomics
            }
            S::GEOMETRY => features.geometry_shader && features.vertex_pipeline_stores_and_atomics,
            S::VERTEX => features.vertex_pipeline_stores_and_atomics,
            S::FRAGMENT => features.fragment_stores_and_atomics,
            _ => true,
        };

        if !feature_present {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }

        let mut state = self.state.lock();

        let Some(module) = state.shader_modules.get(&create_info.module) else {
            state.report(format!(
                "vkCreatePipelines: {:?} doesn't exist",
                create_info.module,
            ));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };

        if module.stage != stage {
            state.report(format!(
                "vkCreatePipelines: {:?} was created for {:?}, not {stage:?}",
                create_info.module, module.stage,
            ));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let program = module.program;

        if let Err(err) = program.check_bindings(create_info.bindings) {
            state.report(format!("vkCreatePipelines: {err}"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        for binding in create_info.bindings {
            match *binding {
                PipelineBinding::StorageImage(image) => check_image_usage(
                    &state,
                    "vkCmdBindDescriptorSets",
                    image,
                    vk::ImageUsageFlags::STORAGE,
                ),
                PipelineBinding::StorageBuffer(buffer)
                | PipelineBinding::UniformBuffer(buffer)
                | PipelineBinding::VertexBuffer(buffer)
                | PipelineBinding::IndexBuffer(buffer) => check_buffer_usage(
                    &state,
                    "vkCmdBindDescriptorSets",
                    buffer,
                    required_buffer_usage(binding),
                ),
            }
        }

        let handle = state.new_handle();
        state.pipelines.insert(
            handle,
            Pipeline {
                program,
                stage,
                bindings: create_info.bindings.iter().copied().collect(),
            },
        );

        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        if pipeline != vk::Pipeline::null()
            && self.state.lock().pipelines.remove(&pipeline).is_none()
        {
            self.messages
                .report(format!("vkDestroyPipeline: {pipeline:?} doesn't exist"));
        }
    }

    fn allocate_command_buffer(&self, queue_family_index: u32) -> VkResult<vk::CommandBuffer> {
        let queue_flags = self.family_flags(queue_family_index)?;
        let mut state = self.state.lock();
        let handle = state.new_handle();
        state.command_buffers.insert(
            handle,
            CommandBuffer::new(queue_family_index, queue_flags),
        );

        Ok(handle)
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        if command_buffer == vk::CommandBuffer::null() {
            return;
        }

        let mut state = self.state.lock();

        match state.command_buffers.remove(&command_buffer) {
            Some(object) if object.pending != 0 => state.report(format!(
                "vkFreeCommandBuffers: {command_buffer:?} is still pending execution",
            )),
            Some(_) => {}
            None => state.report(format!(
                "vkFreeCommandBuffers: {command_buffer:?} doesn't exist",
            )),
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let Some(object) = state.command_buffers.get_mut(&command_buffer) else {
            state.report(format!("vkBeginCommandBuffer: {command_buffer:?} doesn't exist"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };

        if object.pending != 0 {
            state.messages.report(format!(
                "vkBeginCommandBuffer: {command_buffer:?} is still pending execution",
            ));
        }

        object.state = CommandBufferState::Recording;
        object.commands.clear();
        object.bound_pipeline = None;

        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let Some(object) = state.command_buffers.get_mut(&command_buffer) else {
            state.report(format!("vkEndCommandBuffer: {command_buffer:?} doesn't exist"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };

        if object.state != CommandBufferState::Recording {
            state.messages.report(format!(
                "vkEndCommandBuffer: {command_buffer:?} is in the {:?} state",
                object.state,
            ));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        object.recorded = std::mem::take(&mut object.commands).into();
        object.state = CommandBufferState::Executable;

        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        const NAME: &str = "vkCmdCopyBuffer";

        self.record(command_buffer, NAME, vk::QueueFlags::TRANSFER, |state, _| {
            check_buffer_usage(state, NAME, src_buffer, vk::BufferUsageFlags::TRANSFER_SRC);
            check_buffer_usage(state, NAME, dst_buffer, vk::BufferUsageFlags::TRANSFER_DST);

            Some(Command::CopyBuffer {
                src: src_buffer,
                dst: dst_buffer,
                regions: regions.into(),
            })
        });
    }

    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        const NAME: &str = "vkCmdCopyImage";

        self.record(command_buffer, NAME, vk::QueueFlags::TRANSFER, |state, _| {
            check_image_usage(state, NAME, src_image, vk::ImageUsageFlags::TRANSFER_SRC);
            check_image_usage(state, NAME, dst_image, vk::ImageUsageFlags::TRANSFER_DST);

            Some(Command::CopyImage {
                src: src_image,
                src_layout: src_image_layout,
                dst: dst_image,
                dst_layout: dst_image_layout,
                regions: regions.into(),
            })
        });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        const NAME: &str = "vkCmdCopyBufferToImage";

        self.record(command_buffer, NAME, vk::QueueFlags::TRANSFER, |state, _| {
            check_buffer_usage(state, NAME, src_buffer, vk::BufferUsageFlags::TRANSFER_SRC);
            check_image_usage(state, NAME, dst_image, vk::ImageUsageFlags::TRANSFER_DST);

            Some(Command::CopyBufferToImage {
                src: src_buffer,
                dst: dst_image,
                dst_layout: dst_image_layout,
                regions: regions.into(),
            })
        });
    }

    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        const NAME: &str = "vkCmdCopyImageToBuffer";

        self.record(command_buffer, NAME, vk::QueueFlags::TRANSFER, |state, _| {
            check_image_usage(state, NAME, src_image, vk::ImageUsageFlags::TRANSFER_SRC);
            check_buffer_usage(state, NAME, dst_buffer, vk::BufferUsageFlags::TRANSFER_DST);

            Some(Command::CopyImageToBuffer {
                src: src_image,
                src_layout: src_image_layout,
                dst: dst_buffer,
                regions: regions.into(),
            })
        });
    }

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        const NAME: &str = "vkCmdBlitImage";

        self.record(command_buffer, NAME, vk::QueueFlags::GRAPHICS, |state, _| {
            check_image_usage(state, NAME, src_image, vk::ImageUsageFlags::TRANSFER_SRC);
            check_image_usage(state, NAME, dst_image, vk::ImageUsageFlags::TRANSFER_DST);

            if filter != vk::Filter::NEAREST {
                state.report(format!("{NAME}: only nearest filtering is supported"));
            }

            Some(Command::BlitImage {
                src: src_image,
                src_layout: src_image_layout,
                dst: dst_image,
                dst_layout: dst_image_layout,
                regions: regions.into(),
            })
        });
    }

    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        const NAME: &str = "vkCmdFillBuffer";

        self.record(command_buffer, NAME, vk::QueueFlags::TRANSFER, |state, _| {
            check_buffer_usage(state, NAME, dst_buffer, vk::BufferUsageFlags::TRANSFER_DST);

            if dst_offset % 4 != 0 || (size != vk::WHOLE_SIZE && size % 4 != 0) {
                state.report(format!(
                    "{NAME}: the offset {dst_offset} and size {size} must be multiples of 4",
                ));
            }

            Some(Command::FillBuffer {
                dst: dst_buffer,
                offset: dst_offset,
                size,
                data,
            })
        });
    }

    fn cmd_update_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
        data: &[u8],
    ) {
        const NAME: &str = "vkCmdUpdateBuffer";

        self.record(command_buffer, NAME, vk::QueueFlags::TRANSFER, |state, _| {
            check_buffer_usage(state, NAME, dst_buffer, vk::BufferUsageFlags::TRANSFER_DST);

            if data.len() > 65536 || data.len() % 4 != 0 || dst_offset % 4 != 0 {
                state.report(format!(
                    "{NAME}: {} bytes at offset {dst_offset} can't be updated inline",
                    data.len(),
                ));
            }

            Some(Command::UpdateBuffer {
                dst: dst_buffer,
                offset: dst_offset,
                data: data.to_vec(),
            })
        });
    }

    fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        color: [u32; 4],
    ) {
        const NAME: &str = "vkCmdClearColorImage";
        let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

        self.record(command_buffer, NAME, required, |state, _| {
            check_image_usage(state, NAME, image, vk::ImageUsageFlags::TRANSFER_DST);

            Some(Command::ClearColorImage {
                image,
                layout: image_layout,
                color,
            })
        });
    }

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        const NAME: &str = "vkCmdBindPipeline";
        let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

        self.record(command_buffer, NAME, required, |state, recording| {
            match state.pipelines.get(&pipeline) {
                Some(object) => {
                    let bind_point = if object.is_compute() {
                        vk::QueueFlags::COMPUTE
                    } else {
                        vk::QueueFlags::GRAPHICS
                    };

                    if queue_flags_support(recording.queue_flags, bind_point) {
                        recording.bound_pipeline = Some(pipeline);
                    } else {
                        state.report(format!(
                            "{NAME}: {pipeline:?} can't be bound on a queue with {:?}",
                            recording.queue_flags,
                        ));
                    }
                }
                None => state.report(format!("{NAME}: {pipeline:?} doesn't exist")),
            }

            None
        });
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record_launch(command_buffer, Launch::Dispatch { x, y, z });
    }

    fn cmd_dispatch_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        self.record_launch(command_buffer, Launch::DispatchIndirect { buffer, offset });
    }

    fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        self.record_launch(
            command_buffer,
            Launch::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
    ) {
        self.record_launch(
            command_buffer,
            Launch::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        self.record_launch(command_buffer, Launch::DrawIndirect { buffer, offset });
    }

    fn cmd_draw_indexed_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        self.record_launch(command_buffer, Launch::DrawIndexedIndirect { buffer, offset });
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        _src_stage_mask: vk::PipelineStageFlags,
        _dst_stage_mask: vk::PipelineStageFlags,
        _dependency_flags: vk::DependencyFlags,
        _memory_barriers: &[MemoryBarrier],
        buffer_memory_barriers: &[BufferMemoryBarrier],
        image_memory_barriers: &[ImageMemoryBarrier],
    ) {
        let barriers = Barriers::from_legacy(buffer_memory_barriers, image_memory_barriers);

        self.record(
            command_buffer,
            "vkCmdPipelineBarrier",
            vk::QueueFlags::empty(),
            |_, _| Some(Command::Barrier(barriers)),
        );
    }

    fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &DependencyInfo<'_>,
    ) {
        const NAME: &str = "vkCmdPipelineBarrier2";

        if !self.require_synchronization2(NAME) {
            return;
        }

        let barriers = Barriers::from_dependency_infos(std::slice::from_ref(dependency_info));

        self.record(command_buffer, NAME, vk::QueueFlags::empty(), |_, _| {
            Some(Command::Barrier(barriers))
        });
    }

    fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        _stage_mask: vk::PipelineStageFlags,
    ) {
        const NAME: &str = "vkCmdSetEvent";

        self.record(command_buffer, NAME, vk::QueueFlags::empty(), |state, _| {
            check_events_exist(state, NAME, &[event]).then_some(Command::SetEvent(event))
        });
    }

    fn cmd_set_event2(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        // The barriers of a set-event dependency take effect at the matching wait.
        _dependency_info: &DependencyInfo<'_>,
    ) {
        const NAME: &str = "vkCmdSetEvent2";

        if !self.require_synchronization2(NAME) {
            return;
        }

        self.record(command_buffer, NAME, vk::QueueFlags::empty(), |state, _| {
            check_events_exist(state, NAME, &[event]).then_some(Command::SetEvent(event))
        });
    }

    fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        _stage_mask: vk::PipelineStageFlags,
    ) {
        const NAME: &str = "vkCmdResetEvent";

        self.record(command_buffer, NAME, vk::QueueFlags::empty(), |state, _| {
            check_events_exist(state, NAME, &[event]).then_some(Command::ResetEvent(event))
        });
    }

    fn cmd_reset_event2(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        _stage_mask: vk::PipelineStageFlags2,
    ) {
        const NAME: &str = "vkCmdResetEvent2";

        if !self.require_synchronization2(NAME) {
            return;
        }

        self.record(command_buffer, NAME, vk::QueueFlags::empty(), |state, _| {
            check_events_exist(state, NAME, &[event]).then_some(Command::ResetEvent(event))
        });
    }

    fn cmd_wait_events(
        &self,
        command_buffer: vk::CommandBuffer,
        events: &[vk::Event],
        _src_stage_mask: vk::PipelineStageFlags,
        _dst_stage_mask: vk::PipelineStageFlags,
        _memory_barriers: &[MemoryBarrier],
        buffer_memory_barriers: &[BufferMemoryBarrier],
        image_memory_barriers: &[ImageMemoryBarrier],
    ) {
        const NAME: &str = "vkCmdWaitEvents";
        let barriers = Barriers::from_legacy(buffer_memory_barriers, image_memory_barriers);

        self.record(command_buffer, NAME, vk::QueueFlags::empty(), |state, _| {
            check_events_exist(state, NAME, events).then(|| Command::WaitEvents {
                events: events.into(),
                barriers,
            })
        });
    }

    fn cmd_wait_events2(
        &self,
        command_buffer: vk::CommandBuffer,
        events: &[vk::Event],
        dependency_infos: &[DependencyInfo<'_>],
    ) {
        const NAME: &str = "vkCmdWaitEvents2";

        if !self.require_synchronization2(NAME) {
            return;
        }

        if events.len() != dependency_infos.len() {
            self.messages.report(format!(
                "{NAME}: {} event(s) but {} dependency info(s)",
                events.len(),
                dependency_infos.len(),
            ));
            return;
        }

        let barriers = Barriers::from_dependency_infos(dependency_infos);

        self.record(command_buffer, NAME, vk::QueueFlags::empty(), |state, _| {
            check_events_exist(state, NAME, events).then(|| Command::WaitEvents {
                events: events.into(),
                barriers,
            })
        });
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        debug!("vkQueueSubmit: {} batch(es) to {queue:?}", submits.len());

        self.update(|state| {
            let mut batches = Vec::with_capacity(submits.len());

            for submit in submits {
                if submit.wait_dst_stage_mask.len() != submit.wait_semaphores.len() {
                    state.report(format!(
                        "vkQueueSubmit: {} wait stage mask(s) for {} wait semaphore(s)",
                        submit.wait_dst_stage_mask.len(),
                        submit.wait_semaphores.len(),
                    ));
                    return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                }

                let (wait_values, signal_values) =
                    legacy_values(state, submit).ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;

                batches.push(Batch::new(
                    semaphore_ops(submit.wait_semaphores, wait_values),
                    submit.command_buffers.into(),
                    semaphore_ops(submit.signal_semaphores, signal_values),
                ));
            }

            state.submit(queue, batches, fence)
        })
    }

    fn queue_submit2(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        if !self.require_synchronization2("vkQueueSubmit2") {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        debug!("vkQueueSubmit2: {} batch(es) to {queue:?}", submits.len());

        self.update(|state| {
            let batches = submits
                .iter()
                .map(|submit| {
                    Batch::new(
                        semaphore_infos(state, submit.wait_semaphore_infos),
                        command_buffer_infos(state, submit.command_buffer_infos),
                        semaphore_infos(state, submit.signal_semaphore_infos),
                    )
                })
                .collect();

            state.submit(queue, batches, fence)
        })
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        self.wait_idle(Some(queue))
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.wait_idle(None)
    }

    fn take_validation_messages(&self) -> Vec<String> {
        self.messages.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    fn device() -> SoftDevice {
        let _ = env_logger::builder().is_test(true).try_init();

        SoftDevice::new(SoftDeviceCreateInfo {
            hang_timeout_ms: 200,
            ..Default::default()
        })
        .unwrap()
    }

    fn host_buffer(device: &SoftDevice, size: u64, usage: vk::BufferUsageFlags) -> vk::Buffer {
        device
            .create_buffer(&BufferCreateInfo {
                size,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                host_visible: true,
            })
            .unwrap()
    }

    fn timeline(device: &SoftDevice, initial_value: u64) -> vk::Semaphore {
        device
            .create_semaphore(&SemaphoreCreateInfo {
                semaphore_type: vk::SemaphoreType::TIMELINE,
                initial_value,
            })
            .unwrap()
    }

    fn binary(device: &SoftDevice) -> vk::Semaphore {
        device
            .create_semaphore(&SemaphoreCreateInfo {
                semaphore_type: vk::SemaphoreType::BINARY,
                initial_value: 0,
            })
            .unwrap()
    }

    fn recorded(
        device: &SoftDevice,
        family: u32,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> vk::CommandBuffer {
        let command_buffer = device.allocate_command_buffer(family).unwrap();
        device.begin_command_buffer(command_buffer).unwrap();
        record(command_buffer);
        device.end_command_buffer(command_buffer).unwrap();

        command_buffer
    }

    fn submit2(
        device: &SoftDevice,
        queue: vk::Queue,
        waits: &[SemaphoreSubmitInfo],
        command_buffers: &[vk::CommandBuffer],
        signals: &[SemaphoreSubmitInfo],
    ) -> VkResult<()> {
        let command_buffer_infos: Vec<_> = command_buffers
            .iter()
            .map(|&command_buffer| CommandBufferSubmitInfo {
                command_buffer,
                device_mask: 0,
            })
            .collect();

        device.queue_submit2(
            queue,
            &[SubmitInfo2 {
                wait_semaphore_infos: waits,
                command_buffer_infos: &command_buffer_infos,
                signal_semaphore_infos: signals,
            }],
            vk::Fence::null(),
        )
    }

    fn op(semaphore: vk::Semaphore, value: u64) -> SemaphoreSubmitInfo {
        SemaphoreSubmitInfo {
            semaphore,
            value,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            device_index: 0,
        }
    }

    #[test]
    fn copies_execute_on_submit() {
        let device = device();
        let queue = device.get_device_queue(0, 0).unwrap();
        let src = host_buffer(&device, 16, vk::BufferUsageFlags::TRANSFER_SRC);
        let dst = host_buffer(&device, 16, vk::BufferUsageFlags::TRANSFER_DST);
        device.write_buffer(src, 0, &[7; 16]).unwrap();

        let command_buffer = recorded(&device, 0, |cb| {
            device.cmd_copy_buffer(
                cb,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 16,
                }],
            );
        });

        let fence = device.create_fence(false).unwrap();
        device
            .queue_submit(
                queue,
                &[SubmitInfo {
                    command_buffers: &[command_buffer],
                    ..Default::default()
                }],
                fence,
            )
            .unwrap();

        assert!(device.get_fence_status(fence).unwrap());
        assert_eq!(device.read_buffer(dst, 0, 16).unwrap(), [7; 16]);
        assert!(device.take_validation_messages().is_empty());
    }

    #[test]
    fn wait_before_signal_resumes_on_host_signal() {
        let device = device();
        let queue = device.get_device_queue(0, 0).unwrap();
        let semaphore = timeline(&device, 0);
        let dst = host_buffer(&device, 4, vk::BufferUsageFlags::TRANSFER_DST);
        let command_buffer = recorded(&device, 0, |cb| {
            device.cmd_fill_buffer(cb, dst, 0, vk::WHOLE_SIZE, 0xdead_beef);
        });

        submit2(&device, queue, &[op(semaphore, 3)], &[command_buffer], &[]).unwrap();
        assert_eq!(device.read_buffer(dst, 0, 4).unwrap(), [0; 4]);

        device.signal_semaphore(semaphore, 2).unwrap();
        assert_eq!(device.read_buffer(dst, 0, 4).unwrap(), [0; 4]);

        device.signal_semaphore(semaphore, 3).unwrap();
        assert_eq!(
            device.read_buffer(dst, 0, 4).unwrap(),
            0xdead_beef_u32.to_ne_bytes(),
        );
        device.device_wait_idle().unwrap();
        assert!(device.take_validation_messages().is_empty());
    }

    #[test]
    fn host_waits_are_woken_by_other_threads() {
        let device = Arc::new(device());
        let semaphore = timeline(&device, 0);

        let signaler = thread::spawn({
            let device = device.clone();
            move || {
                thread::sleep(Duration::from_millis(10));
                device.signal_semaphore(semaphore, 5).unwrap();
            }
        });

        device
            .wait_semaphores(
                &SemaphoreWaitInfo {
                    flags: vk::SemaphoreWaitFlags::empty(),
                    semaphores: &[semaphore],
                    values: &[5],
                },
                Duration::from_secs(10),
            )
            .unwrap();
        signaler.join().unwrap();

        assert_eq!(device.get_semaphore_counter_value(semaphore).unwrap(), 5);
    }

    #[test]
    fn waits_time_out() {
        let device = device();
        let semaphores = [timeline(&device, 1), timeline(&device, 0)];
        let mut wait_info = SemaphoreWaitInfo {
            flags: vk::SemaphoreWaitFlags::empty(),
            semaphores: &semaphores,
            values: &[1, 1],
        };

        assert_eq!(
            device.wait_semaphores(&wait_info, Duration::from_millis(1)),
            Err(vk::Result::TIMEOUT),
        );

        wait_info.flags = vk::SemaphoreWaitFlags::ANY;
        assert_eq!(device.wait_semaphores(&wait_info, Duration::ZERO), Ok(()));
    }

    #[test]
    fn events_block_until_set_from_the_host() {
        let device = device();
        let queue = device.get_device_queue(0, 0).unwrap();
        let event = device.create_event().unwrap();
        let dst = host_buffer(&device, 4, vk::BufferUsageFlags::TRANSFER_DST);
        let command_buffer = recorded(&device, 0, |cb| {
            device.cmd_wait_events(
                cb,
                &[event],
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::TRANSFER,
                &[],
                &[],
                &[],
            );
            device.cmd_update_buffer(cb, dst, 0, &[1, 2, 3, 4]);
        });
        let fence = device.create_fence(false).unwrap();

        device
            .queue_submit(
                queue,
                &[SubmitInfo {
                    command_buffers: &[command_buffer],
                    ..Default::default()
                }],
                fence,
            )
            .unwrap();

        assert_eq!(
            device.wait_for_fences(&[fence], true, Duration::from_millis(1)),
            Err(vk::Result::TIMEOUT),
        );

        device.set_event(event).unwrap();

        assert_eq!(
            device.wait_for_fences(&[fence], true, Duration::from_millis(1)),
            Ok(()),
        );
        assert_eq!(device.read_buffer(dst, 0, 4).unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    fn legacy_timeline_submits_need_values() {
        let device = device();
        let queue = device.get_device_queue(0, 0).unwrap();
        let semaphore = timeline(&device, 0);

        let result = device.queue_submit(
            queue,
            &[SubmitInfo {
                signal_semaphores: &[semaphore],
                ..Default::default()
            }],
            vk::Fence::null(),
        );

        assert_eq!(result, Err(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        assert_eq!(device.take_validation_messages().len(), 1);
        assert_eq!(device.get_semaphore_counter_value(semaphore).unwrap(), 0);
    }

    #[test]
    fn binary_waits_need_a_pending_signal() {
        let device = device();
        let queue = device.get_device_queue(0, 0).unwrap();
        let semaphore = binary(&device);

        device
            .queue_submit(
                queue,
                &[SubmitInfo {
                    wait_semaphores: &[semaphore],
                    wait_dst_stage_mask: &[vk::PipelineStageFlags::ALL_COMMANDS],
                    ..Default::default()
                }],
                vk::Fence::null(),
            )
            .unwrap();

        let messages = device.take_validation_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("no signal operation"));

        // The wait never completes.
        assert_eq!(device.device_wait_idle(), Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(device.device_wait_idle().is_ok());
    }

    #[test]
    fn binary_semaphores_chain_queues() {
        let device = device();
        let first = device.get_device_queue(0, 0).unwrap();
        let second = device.get_device_queue(0, 1).unwrap();
        let semaphore = binary(&device);

        submit2(&device, first, &[], &[], &[op(semaphore, 0)]).unwrap();
        submit2(&device, second, &[op(semaphore, 0)], &[], &[]).unwrap();

        device.device_wait_idle().unwrap();
        assert!(device.take_validation_messages().is_empty());
    }

    #[test]
    fn exclusive_resources_need_ownership_transfers() {
        let device = device();
        let graphics = device.get_device_queue(0, 0).unwrap();
        let transfer = device.get_device_queue(2, 0).unwrap();
        let src = host_buffer(&device, 4, vk::BufferUsageFlags::TRANSFER_SRC);
        let dst = host_buffer(
            &device,
            4,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
        );
        let semaphore = timeline(&device, 0);

        let write = recorded(&device, 0, |cb| {
            device.cmd_copy_buffer(
                cb,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 4,
                }],
            );
        });
        let read = recorded(&device, 2, |cb| {
            device.cmd_fill_buffer(cb, dst, 0, 4, 0);
        });

        submit2(&device, graphics, &[], &[write], &[op(semaphore, 1)]).unwrap();
        submit2(&device, transfer, &[op(semaphore, 1)], &[read], &[]).unwrap();
        device.device_wait_idle().unwrap();

        let messages = device.take_validation_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("owns"));
    }

    #[test]
    fn recording_checks_usage_and_capabilities() {
        let device = device();
        let buffer = host_buffer(&device, 4, vk::BufferUsageFlags::TRANSFER_SRC);

        recorded(&device, 2, |cb| {
            // Missing `TRANSFER_DST`.
            device.cmd_fill_buffer(cb, buffer, 0, 4, 0);
            // Not a transfer command.
            device.cmd_dispatch(cb, 1, 1, 1);
        });

        let messages = device.take_validation_messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("TRANSFER_DST"));
        assert!(messages[1].contains("COMPUTE"));
    }

    #[test]
    fn invalid_create_infos() {
        let create_info = SoftDeviceCreateInfo {
            queue_families: Vec::new(),
            ..Default::default()
        };
        assert_eq!(
            SoftDevice::new(create_info).unwrap_err(),
            SoftDeviceError::NoQueueFamilies,
        );

        let create_info = SoftDeviceCreateInfo {
            queue_families: vec![QueueFamilyDesc {
                graphics: true,
                compute: false,
                transfer: false,
                queue_count: 0,
            }],
            ..Default::default()
        };
        assert_eq!(
            SoftDevice::new(create_info).unwrap_err(),
            SoftDeviceError::EmptyQueueFamily(0),
        );
    }

    #[test]
    fn shader_programs_need_their_features() {
        let device = SoftDevice::new(SoftDeviceCreateInfo {
            features: Features {
                vertex_pipeline_stores_and_atomics: false,
                ..Features::all()
            },
            ..Default::default()
        })
        .unwrap();
        let counter = host_buffer(&device, 4, vk::BufferUsageFlags::STORAGE_BUFFER);
        let module = device
            .create_shader_module("atomic_counter", vk::ShaderStageFlags::VERTEX)
            .unwrap();

        assert_eq!(
            device.create_pipeline(&PipelineCreateInfo {
                stage: vk::ShaderStageFlags::VERTEX,
                module,
                bindings: &[PipelineBinding::StorageBuffer(counter)],
            }),
            Err(vk::Result::ERROR_FEATURE_NOT_PRESENT),
        );
        assert_eq!(
            device.create_shader_module("index_fetch", vk::ShaderStageFlags::COMPUTE),
            Err(vk::Result::ERROR_INITIALIZATION_FAILED),
        );
    }

    #[test]
    fn dispatches_count_workgroups() {
        let device = device();
        let queue = device.get_device_queue(1, 0).unwrap();
        let counter = host_buffer(&device, 4, vk::BufferUsageFlags::STORAGE_BUFFER);
        let module = device
            .create_shader_module("atomic_counter", vk::ShaderStageFlags::COMPUTE)
            .unwrap();
        let pipeline = device
            .create_pipeline(&PipelineCreateInfo {
                stage: vk::ShaderStageFlags::COMPUTE,
                module,
                bindings: &[PipelineBinding::StorageBuffer(counter)],
            })
            .unwrap();
        let command_buffer = recorded(&device, 1, |cb| {
            device.cmd_bind_pipeline(cb, pipeline);
            device.cmd_dispatch(cb, 7, 2, 1);
            device.cmd_dispatch(cb, 1, 1, 1);
        });

        submit2(&device, queue, &[], &[command_buffer], &[]).unwrap();

        assert_eq!(device.read_buffer(counter, 0, 4).unwrap(), 15u32.to_ne_bytes());
        assert!(device.take_validation_messages().is_empty());
    }
}
