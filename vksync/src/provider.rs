//! The capability provider the engine is a client of.
//!
//! Everything the engine knows about a device goes through the [`Provider`] trait: queue family
//! properties, object creation, command recording and queue submission. The trait mirrors the
//! shape of the Vulkan entry points it stands for, but takes plain Rust structs instead of
//! `p_next` chains and raw pointers, so that a provider can be implemented without `unsafe`.
//!
//! Handles, flags, enums and result codes are the ones from [`ash::vk`]. Calls that can fail
//! return [`VkResult`], and a host wait that runs out of time returns `Err(vk::Result::TIMEOUT)`,
//! the same way `ash` reports it.
//!
//! Recording calls (`cmd_*`) don't return anything, like their Vulkan counterparts. A provider
//! that detects misuse while recording or executing reports it through
//! [`Provider::take_validation_messages`], which plays the role of a debug messenger.

use ash::{prelude::VkResult, vk};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Features that the engine checks before building a test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub timeline_semaphore: bool,
    pub synchronization2: bool,
    pub tessellation_shader: bool,
    pub geometry_shader: bool,
    pub vertex_pipeline_stores_and_atomics: bool,
    pub fragment_stores_and_atomics: bool,
}

impl Features {
    /// Returns a `Features` with every feature enabled.
    #[inline]
    pub const fn all() -> Self {
        Features {
            timeline_semaphore: true,
            synchronization2: true,
            tessellation_shader: true,
            geometry_shader: true,
            vertex_pipeline_stores_and_atomics: true,
            fragment_stores_and_atomics: true,
        }
    }
}

/// Properties of the device behind a provider.
#[derive(Clone, Debug)]
pub struct Properties {
    pub device_name: String,
    pub api_version: u32,
    pub max_timeline_semaphore_value_difference: u64,
}

/// Properties of one queue family.
#[derive(Clone, Copy, Debug)]
pub struct QueueFamilyProperties {
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferCreateInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub sharing_mode: vk::SharingMode,
    /// Whether the memory bound to the buffer can be read and written by the host.
    pub host_visible: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageCreateInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
}

#[derive(Clone, Copy, Debug)]
pub struct SemaphoreCreateInfo {
    pub semaphore_type: vk::SemaphoreType,
    /// Ignored for binary semaphores.
    pub initial_value: u64,
}

/// Parameters of a host-side wait on timeline semaphores.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreWaitInfo<'a> {
    /// `vk::SemaphoreWaitFlags::ANY` makes the wait return as soon as one value is reached.
    pub flags: vk::SemaphoreWaitFlags,
    pub semaphores: &'a [vk::Semaphore],
    pub values: &'a [u64],
}

/// Timeline values of a legacy submission.
///
/// This is chained onto a [`SubmitInfo`] whenever any of its semaphores is a timeline
/// semaphore. The value at index `i` belongs to the semaphore at index `i`; values that belong
/// to binary semaphores are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimelineSemaphoreSubmitInfo<'a> {
    pub wait_semaphore_values: &'a [u64],
    pub signal_semaphore_values: &'a [u64],
}

/// A legacy (`vkQueueSubmit`) batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_dst_stage_mask: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
    /// The extension structure chained onto this batch, if any.
    pub timeline_semaphore_submit_info: Option<TimelineSemaphoreSubmitInfo<'a>>,
}

/// One semaphore operation of a unified (`vkQueueSubmit2`) batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SemaphoreSubmitInfo {
    pub semaphore: vk::Semaphore,
    /// The timeline value; ignored for binary semaphores.
    pub value: u64,
    pub stage_mask: vk::PipelineStageFlags2,
    pub device_index: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandBufferSubmitInfo {
    pub command_buffer: vk::CommandBuffer,
    pub device_mask: u32,
}

/// A unified (`vkQueueSubmit2`) batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo2<'a> {
    pub wait_semaphore_infos: &'a [SemaphoreSubmitInfo],
    pub command_buffer_infos: &'a [CommandBufferSubmitInfo],
    pub signal_semaphore_infos: &'a [SemaphoreSubmitInfo],
}

/// A legacy global memory barrier. The stage masks are passed to the recording call.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryBarrier {
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BufferMemoryBarrier {
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ImageMemoryBarrier {
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub image: vk::Image,
    pub subresource_range: vk::ImageSubresourceRange,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryBarrier2 {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BufferMemoryBarrier2 {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ImageMemoryBarrier2 {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub image: vk::Image,
    pub subresource_range: vk::ImageSubresourceRange,
}

/// Dependency info for barriers in a pipeline barrier or event command.
///
/// Each barrier has a set of source/destination pipeline stages and source/destination memory
/// access types. The pipeline stages create an *execution dependency*, the access types a
/// *memory dependency* on top of it.
#[derive(Clone, Copy, Debug, Default)]
pub struct DependencyInfo<'a> {
    pub dependency_flags: vk::DependencyFlags,
    pub memory_barriers: &'a [MemoryBarrier2],
    pub buffer_memory_barriers: &'a [BufferMemoryBarrier2],
    pub image_memory_barriers: &'a [ImageMemoryBarrier2],
}

impl DependencyInfo<'_> {
    /// Returns `true` if `self` doesn't contain any barriers.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.memory_barriers.is_empty()
            && self.buffer_memory_barriers.is_empty()
            && self.image_memory_barriers.is_empty()
    }
}

/// A resource bound to a pipeline, in binding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineBinding {
    StorageBuffer(vk::Buffer),
    UniformBuffer(vk::Buffer),
    VertexBuffer(vk::Buffer),
    IndexBuffer(vk::Buffer),
    StorageImage(vk::Image),
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineCreateInfo<'a> {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub bindings: &'a [PipelineBinding],
}

/// An opaque Vulkan-like device.
///
/// Implementations must be usable from several threads at once: the engine polls semaphore
/// counters and signals semaphores from helper threads while the main thread submits work.
pub trait Provider: Send + Sync {
    fn properties(&self) -> &Properties;

    fn enabled_features(&self) -> &Features;

    fn queue_family_properties(&self) -> &[QueueFamilyProperties];

    fn get_device_queue(&self, queue_family_index: u32, queue_index: u32) -> VkResult<vk::Queue>;

    /// Returns `Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)` if an image with these parameters
    /// can't be created.
    fn image_format_supported(&self, create_info: &ImageCreateInfo) -> VkResult<()>;

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> VkResult<vk::Buffer>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Copies `data` into a host-visible buffer.
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8])
        -> VkResult<()>;

    /// Copies `size` bytes out of a host-visible buffer.
    fn read_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<Vec<u8>>;

    fn create_image(&self, create_info: &ImageCreateInfo) -> VkResult<vk::Image>;

    fn destroy_image(&self, image: vk::Image);

    fn create_semaphore(&self, create_info: &SemaphoreCreateInfo) -> VkResult<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn get_semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;

    /// Signals a timeline semaphore from the host.
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()>;

    fn wait_semaphores(&self, wait_info: &SemaphoreWaitInfo<'_>, timeout: Duration)
        -> VkResult<()>;

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: Duration)
        -> VkResult<()>;

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    /// Returns whether the fence is signaled.
    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    fn create_event(&self) -> VkResult<vk::Event>;

    fn destroy_event(&self, event: vk::Event);

    fn set_event(&self, event: vk::Event) -> VkResult<()>;

    fn reset_event(&self, event: vk::Event) -> VkResult<()>;

    /// Returns whether the event is set.
    fn get_event_status(&self, event: vk::Event) -> VkResult<bool>;

    /// Compiles the named program for the given stage.
    ///
    /// The engine never looks inside the module; it only cares whether creation succeeds.
    fn create_shader_module(
        &self,
        name: &str,
        stage: vk::ShaderStageFlags,
    ) -> VkResult<vk::ShaderModule>;

    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_pipeline(&self, create_info: &PipelineCreateInfo<'_>) -> VkResult<vk::Pipeline>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn allocate_command_buffer(&self, queue_family_index: u32) -> VkResult<vk::CommandBuffer>;

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer);

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );

    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    );

    fn cmd_update_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
        data: &[u8],
    );

    /// Clears a color image. `color` holds the `uint32` view of a `VkClearColorValue`.
    fn cmd_clear_color_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        color: [u32; 4],
    );

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline);

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);

    fn cmd_dispatch_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    );

    fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32);

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
    );

    fn cmd_draw_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    );

    fn cmd_draw_indexed_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    );

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[MemoryBarrier],
        buffer_memory_barriers: &[BufferMemoryBarrier],
        image_memory_barriers: &[ImageMemoryBarrier],
    );

    fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &DependencyInfo<'_>,
    );

    fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stage_mask: vk::PipelineStageFlags,
    );

    fn cmd_set_event2(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        dependency_info: &DependencyInfo<'_>,
    );

    fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stage_mask: vk::PipelineStageFlags,
    );

    fn cmd_reset_event2(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stage_mask: vk::PipelineStageFlags2,
    );

    fn cmd_wait_events(
        &self,
        command_buffer: vk::CommandBuffer,
        events: &[vk::Event],
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory_barriers: &[MemoryBarrier],
        buffer_memory_barriers: &[BufferMemoryBarrier],
        image_memory_barriers: &[ImageMemoryBarrier],
    );

    fn cmd_wait_events2(
        &self,
        command_buffer: vk::CommandBuffer,
        events: &[vk::Event],
        dependency_infos: &[DependencyInfo<'_>],
    );

    /// Hands the batches to the queue. This never waits for the batches to execute.
    ///
    /// `fence` may be `vk::Fence::null()`.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn queue_submit2(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    fn device_wait_idle(&self) -> VkResult<()>;

    /// Drains the messages the provider produced about misuse of its API.
    fn take_validation_messages(&self) -> Vec<String> {
        Vec::new()
    }
}
