//! One submit and barrier contract over both synchronization protocols.
//!
//! Everything in the engine records barriers and builds submissions in the `synchronization2`
//! vocabulary ([`DependencyInfo`], [`SemaphoreSubmitInfo`]). When the legacy protocol is
//! selected, the recording functions here and the [`SynchronizationWrapper`] translate that
//! down: stage and access masks are converted to their legacy equivalents, and timeline values
//! are moved into a chained [`TimelineSemaphoreSubmitInfo`].
//!
//! [`TimelineSemaphoreSubmitInfo`]: crate::provider::TimelineSemaphoreSubmitInfo

pub use self::{
    primitive::{wait_semaphores, CommandBuffer, Event, Fence, Semaphore, WaitOutcome},
    wrapper::SynchronizationWrapper,
};
use crate::{
    provider::{
        BufferMemoryBarrier, BufferMemoryBarrier2, CommandBufferSubmitInfo, DependencyInfo,
        ImageMemoryBarrier, ImageMemoryBarrier2, MemoryBarrier, MemoryBarrier2, Provider,
        SemaphoreSubmitInfo,
    },
    resource::{BufferResource, ImageResource},
};
use ash::vk;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

mod primitive;
mod wrapper;

/// The synchronization protocol used to record barriers and submit work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynchronizationType {
    /// `vkCmdPipelineBarrier` and `vkQueueSubmit`.
    Legacy,
    /// `vkCmdPipelineBarrier2` and `vkQueueSubmit2`.
    Synchronization2,
}

impl SynchronizationType {
    pub const ALL: [SynchronizationType; 2] =
        [SynchronizationType::Legacy, SynchronizationType::Synchronization2];

    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            SynchronizationType::Legacy => "legacy",
            SynchronizationType::Synchronization2 => "synchronization2",
        }
    }
}

impl fmt::Display for SynchronizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The kind of semaphore a test synchronizes with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemaphoreKind {
    Binary,
    Timeline,
}

impl SemaphoreKind {
    pub const ALL: [SemaphoreKind; 2] = [SemaphoreKind::Binary, SemaphoreKind::Timeline];

    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            SemaphoreKind::Binary => "binary_semaphore",
            SemaphoreKind::Timeline => "timeline_semaphore",
        }
    }

    #[inline]
    pub const fn is_timeline(self) -> bool {
        matches!(self, SemaphoreKind::Timeline)
    }

    #[inline]
    pub const fn to_vk(self) -> vk::SemaphoreType {
        match self {
            SemaphoreKind::Binary => vk::SemaphoreType::BINARY,
            SemaphoreKind::Timeline => vk::SemaphoreType::TIMELINE,
        }
    }
}

impl fmt::Display for SemaphoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The state of a resource at the boundary of an operation.
///
/// An operation's *in* info is the state the resource must be in before the operation reads
/// it; its *out* info is the state the operation leaves the resource in after writing it. A
/// dependency between two operations is built from the producer's out info (source) and the
/// consumer's in info (destination).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncInfo {
    pub stage_mask: vk::PipelineStageFlags2,
    pub access_mask: vk::AccessFlags2,
    pub image_layout: vk::ImageLayout,
}

impl SyncInfo {
    /// The info of a boundary that doesn't touch the resource.
    pub const EMPTY: SyncInfo = SyncInfo {
        stage_mask: vk::PipelineStageFlags2::NONE,
        access_mask: vk::AccessFlags2::NONE,
        image_layout: vk::ImageLayout::UNDEFINED,
    };

    #[inline]
    pub const fn new(
        stage_mask: vk::PipelineStageFlags2,
        access_mask: vk::AccessFlags2,
        image_layout: vk::ImageLayout,
    ) -> Self {
        SyncInfo {
            stage_mask,
            access_mask,
            image_layout,
        }
    }
}

impl Default for SyncInfo {
    #[inline]
    fn default() -> Self {
        SyncInfo::EMPTY
    }
}

/// Converts `synchronization2` stage flags to the closest legacy stage flags.
pub fn convert_stage_mask(stage_mask: vk::PipelineStageFlags2) -> vk::PipelineStageFlags {
    type Flags2 = vk::PipelineStageFlags2;
    type Flags = vk::PipelineStageFlags;

    // The first 32 bits have the same meaning in both protocols.
    let mut legacy = Flags::from_raw((stage_mask.as_raw() & u64::from(u32::MAX)) as u32);

    if stage_mask.intersects(Flags2::COPY | Flags2::BLIT | Flags2::RESOLVE | Flags2::CLEAR) {
        legacy |= Flags::TRANSFER;
    }

    if stage_mask.intersects(Flags2::INDEX_INPUT | Flags2::VERTEX_ATTRIBUTE_INPUT) {
        legacy |= Flags::VERTEX_INPUT;
    }

    if stage_mask.intersects(Flags2::PRE_RASTERIZATION_SHADERS) {
        legacy |= Flags::VERTEX_SHADER
            | Flags::TESSELLATION_CONTROL_SHADER
            | Flags::TESSELLATION_EVALUATION_SHADER
            | Flags::GEOMETRY_SHADER;
    }

    legacy
}

/// Converts `synchronization2` access flags to the closest legacy access flags.
pub fn convert_access_mask(access_mask: vk::AccessFlags2) -> vk::AccessFlags {
    type Flags2 = vk::AccessFlags2;
    type Flags = vk::AccessFlags;

    let mut legacy = Flags::from_raw((access_mask.as_raw() & u64::from(u32::MAX)) as u32);

    if access_mask.intersects(Flags2::SHADER_SAMPLED_READ | Flags2::SHADER_STORAGE_READ) {
        legacy |= Flags::SHADER_READ;
    }

    if access_mask.intersects(Flags2::SHADER_STORAGE_WRITE) {
        legacy |= Flags::SHADER_WRITE;
    }

    legacy
}

/// Returns a global memory barrier from `src` to `dst`.
#[inline]
pub fn memory_barrier(src: &SyncInfo, dst: &SyncInfo) -> MemoryBarrier2 {
    MemoryBarrier2 {
        src_stage_mask: src.stage_mask,
        src_access_mask: src.access_mask,
        dst_stage_mask: dst.stage_mask,
        dst_access_mask: dst.access_mask,
    }
}

/// Returns a barrier over a whole buffer resource, without a queue family ownership transfer.
#[inline]
pub fn buffer_barrier(
    src: &SyncInfo,
    dst: &SyncInfo,
    buffer: &BufferResource,
) -> BufferMemoryBarrier2 {
    BufferMemoryBarrier2 {
        src_stage_mask: src.stage_mask,
        src_access_mask: src.access_mask,
        dst_stage_mask: dst.stage_mask,
        dst_access_mask: dst.access_mask,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        buffer: buffer.handle,
        offset: buffer.offset,
        size: buffer.size,
    }
}

/// Returns a barrier over a whole image resource that transitions it from the layout of `src`
/// to the layout of `dst`.
#[inline]
pub fn image_barrier(
    src: &SyncInfo,
    dst: &SyncInfo,
    image: &ImageResource,
) -> ImageMemoryBarrier2 {
    ImageMemoryBarrier2 {
        src_stage_mask: src.stage_mask,
        src_access_mask: src.access_mask,
        dst_stage_mask: dst.stage_mask,
        dst_access_mask: dst.access_mask,
        old_layout: src.image_layout,
        new_layout: dst.image_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image: image.handle,
        subresource_range: image.subresource_range,
    }
}

/// Returns the wait or signal of a semaphore at `stage_mask`. `value` must be 0 for binary
/// semaphores.
#[inline]
pub fn semaphore_submit_info(
    semaphore: vk::Semaphore,
    value: u64,
    stage_mask: vk::PipelineStageFlags2,
) -> SemaphoreSubmitInfo {
    SemaphoreSubmitInfo {
        semaphore,
        value,
        stage_mask,
        device_index: 0,
    }
}

#[inline]
pub fn command_buffer_submit_info(command_buffer: vk::CommandBuffer) -> CommandBufferSubmitInfo {
    CommandBufferSubmitInfo {
        command_buffer,
        device_mask: 0,
    }
}

/// The legacy form of a [`DependencyInfo`].
#[derive(Default)]
struct LegacyDependency {
    src_stage_mask: vk::PipelineStageFlags,
    dst_stage_mask: vk::PipelineStageFlags,
    memory_barriers: SmallVec<[MemoryBarrier; 1]>,
    buffer_memory_barriers: SmallVec<[BufferMemoryBarrier; 1]>,
    image_memory_barriers: SmallVec<[ImageMemoryBarrier; 1]>,
}

impl LegacyDependency {
    fn add(&mut self, dependency_info: &DependencyInfo<'_>) {
        for barrier in dependency_info.memory_barriers {
            self.src_stage_mask |= convert_stage_mask(barrier.src_stage_mask);
            self.dst_stage_mask |= convert_stage_mask(barrier.dst_stage_mask);
            self.memory_barriers.push(MemoryBarrier {
                src_access_mask: convert_access_mask(barrier.src_access_mask),
                dst_access_mask: convert_access_mask(barrier.dst_access_mask),
            });
        }

        for barrier in dependency_info.buffer_memory_barriers {
            self.src_stage_mask |= convert_stage_mask(barrier.src_stage_mask);
            self.dst_stage_mask |= convert_stage_mask(barrier.dst_stage_mask);
            self.buffer_memory_barriers.push(BufferMemoryBarrier {
                src_access_mask: convert_access_mask(barrier.src_access_mask),
                dst_access_mask: convert_access_mask(barrier.dst_access_mask),
                src_queue_family_index: barrier.src_queue_family_index,
                dst_queue_family_index: barrier.dst_queue_family_index,
                buffer: barrier.buffer,
                offset: barrier.offset,
                size: barrier.size,
            });
        }

        for barrier in dependency_info.image_memory_barriers {
            self.src_stage_mask |= convert_stage_mask(barrier.src_stage_mask);
            self.dst_stage_mask |= convert_stage_mask(barrier.dst_stage_mask);
            self.image_memory_barriers.push(ImageMemoryBarrier {
                src_access_mask: convert_access_mask(barrier.src_access_mask),
                dst_access_mask: convert_access_mask(barrier.dst_access_mask),
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
                src_queue_family_index: barrier.src_queue_family_index,
                dst_queue_family_index: barrier.dst_queue_family_index,
                image: barrier.image,
                subresource_range: barrier.subresource_range,
            });
        }
    }

    /// Legacy barriers can't have empty stage masks.
    fn stage_masks(&self) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
        let src_stage_mask = if self.src_stage_mask.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            self.src_stage_mask
        };
        let dst_stage_mask = if self.dst_stage_mask.is_empty() {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        } else {
            self.dst_stage_mask
        };

        (src_stage_mask, dst_stage_mask)
    }
}

/// Records a pipeline barrier using the given protocol.
pub fn cmd_pipeline_barrier(
    provider: &dyn Provider,
    sync_type: SynchronizationType,
    command_buffer: vk::CommandBuffer,
    dependency_info: &DependencyInfo<'_>,
) {
    match sync_type {
        SynchronizationType::Synchronization2 => {
            provider.cmd_pipeline_barrier2(command_buffer, dependency_info);
        }
        SynchronizationType::Legacy => {
            let mut legacy = LegacyDependency::default();
            legacy.add(dependency_info);
            let (src_stage_mask, dst_stage_mask) = legacy.stage_masks();

            provider.cmd_pipeline_barrier(
                command_buffer,
                src_stage_mask,
                dst_stage_mask,
                dependency_info.dependency_flags,
                &legacy.memory_barriers,
                &legacy.buffer_memory_barriers,
                &legacy.image_memory_barriers,
            );
        }
    }
}

/// Records setting an event. With the legacy protocol only the source stages of the
/// dependency survive.
pub fn cmd_set_event(
    provider: &dyn Provider,
    sync_type: SynchronizationType,
    command_buffer: vk::CommandBuffer,
    event: vk::Event,
    dependency_info: &DependencyInfo<'_>,
) {
    match sync_type {
        SynchronizationType::Synchronization2 => {
            provider.cmd_set_event2(command_buffer, event, dependency_info);
        }
        SynchronizationType::Legacy => {
            let mut legacy = LegacyDependency::default();
            legacy.add(dependency_info);
            let (src_stage_mask, _) = legacy.stage_masks();

            provider.cmd_set_event(command_buffer, event, src_stage_mask);
        }
    }
}

pub fn cmd_reset_event(
    provider: &dyn Provider,
    sync_type: SynchronizationType,
    command_buffer: vk::CommandBuffer,
    event: vk::Event,
    stage_mask: vk::PipelineStageFlags2,
) {
    match sync_type {
        SynchronizationType::Synchronization2 => {
            provider.cmd_reset_event2(command_buffer, event, stage_mask);
        }
        SynchronizationType::Legacy => {
            let mut legacy = convert_stage_mask(stage_mask);
            if legacy.is_empty() {
                legacy = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
            }

            provider.cmd_reset_event(command_buffer, event, legacy);
        }
    }
}

/// Records a wait on `events`. `dependency_infos` holds one entry per event.
///
/// The legacy protocol has a single set of barriers and stage masks for all events, so the
/// dependencies are merged.
pub fn cmd_wait_events(
    provider: &dyn Provider,
    sync_type: SynchronizationType,
    command_buffer: vk::CommandBuffer,
    events: &[vk::Event],
    dependency_infos: &[DependencyInfo<'_>],
) {
    match sync_type {
        SynchronizationType::Synchronization2 => {
            provider.cmd_wait_events2(command_buffer, events, dependency_infos);
        }
        SynchronizationType::Legacy => {
            let mut legacy = LegacyDependency::default();

            for dependency_info in dependency_infos {
                legacy.add(dependency_info);
            }

            let (src_stage_mask, dst_stage_mask) = legacy.stage_masks();

            provider.cmd_wait_events(
                command_buffer,
                events,
                src_stage_mask,
                dst_stage_mask,
                &legacy.memory_barriers,
                &legacy.buffer_memory_barriers,
                &legacy.image_memory_barriers,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_mask_conversion() {
        type Flags2 = vk::PipelineStageFlags2;
        type Flags = vk::PipelineStageFlags;

        assert_eq!(convert_stage_mask(Flags2::COPY), Flags::TRANSFER);
        assert_eq!(convert_stage_mask(Flags2::BLIT | Flags2::CLEAR), Flags::TRANSFER);
        assert_eq!(convert_stage_mask(Flags2::RESOLVE), Flags::TRANSFER);
        assert_eq!(
            convert_stage_mask(Flags2::INDEX_INPUT | Flags2::VERTEX_ATTRIBUTE_INPUT),
            Flags::VERTEX_INPUT,
        );
        assert_eq!(
            convert_stage_mask(Flags2::COMPUTE_SHADER | Flags2::HOST),
            Flags::COMPUTE_SHADER | Flags::HOST,
        );
        assert_eq!(
            convert_stage_mask(Flags2::PRE_RASTERIZATION_SHADERS),
            Flags::VERTEX_SHADER
                | Flags::TESSELLATION_CONTROL_SHADER
                | Flags::TESSELLATION_EVALUATION_SHADER
                | Flags::GEOMETRY_SHADER,
        );
        assert_eq!(convert_stage_mask(Flags2::NONE), Flags::empty());
    }

    #[test]
    fn access_mask_conversion() {
        type Flags2 = vk::AccessFlags2;
        type Flags = vk::AccessFlags;

        assert_eq!(
            convert_access_mask(Flags2::SHADER_SAMPLED_READ),
            Flags::SHADER_READ,
        );
        assert_eq!(
            convert_access_mask(Flags2::SHADER_STORAGE_READ),
            Flags::SHADER_READ,
        );
        assert_eq!(
            convert_access_mask(Flags2::SHADER_STORAGE_WRITE),
            Flags::SHADER_WRITE,
        );
        assert_eq!(
            convert_access_mask(Flags2::TRANSFER_WRITE | Flags2::HOST_READ),
            Flags::TRANSFER_WRITE | Flags::HOST_READ,
        );
    }

    #[test]
    fn empty_legacy_stage_masks_fall_back() {
        let legacy = LegacyDependency::default();

        assert_eq!(
            legacy.stage_masks(),
            (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ),
        );
    }

    #[test]
    fn legacy_stage_masks_are_merged() {
        let barriers = [
            MemoryBarrier2 {
                src_stage_mask: vk::PipelineStageFlags2::COPY,
                src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
                dst_access_mask: vk::AccessFlags2::SHADER_STORAGE_READ,
            },
            MemoryBarrier2 {
                src_stage_mask: vk::PipelineStageFlags2::VERTEX_SHADER,
                src_access_mask: vk::AccessFlags2::SHADER_STORAGE_WRITE,
                dst_stage_mask: vk::PipelineStageFlags2::HOST,
                dst_access_mask: vk::AccessFlags2::HOST_READ,
            },
        ];
        let mut legacy = LegacyDependency::default();
        legacy.add(&DependencyInfo {
            memory_barriers: &barriers,
            ..Default::default()
        });

        assert_eq!(
            legacy.stage_masks(),
            (
                vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::VERTEX_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::HOST,
            ),
        );
        assert_eq!(legacy.memory_barriers[0].dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(legacy.memory_barriers[1].src_access_mask, vk::AccessFlags::SHADER_WRITE);
    }
}
