//! Commands as they're stored in a command buffer.

use ash::vk;
use smallvec::SmallVec;
use vksync::provider::{
    BufferMemoryBarrier, BufferMemoryBarrier2, DependencyInfo, ImageMemoryBarrier,
    ImageMemoryBarrier2,
};

#[derive(Clone, Debug)]
pub(crate) enum Command {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: SmallVec<[vk::BufferCopy; 1]>,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: SmallVec<[vk::ImageCopy; 1]>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: SmallVec<[vk::BufferImageCopy; 1]>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: SmallVec<[vk::BufferImageCopy; 1]>,
    },
    BlitImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: SmallVec<[vk::ImageBlit; 1]>,
    },
    FillBuffer {
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    },
    UpdateBuffer {
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        data: Vec<u8>,
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [u32; 4],
    },
    Launch {
        pipeline: vk::Pipeline,
        launch: Launch,
    },
    Barrier(Barriers),
    SetEvent(vk::Event),
    ResetEvent(vk::Event),
    WaitEvents {
        events: SmallVec<[vk::Event; 1]>,
        barriers: Barriers,
    },
}

impl Command {
    /// Returns the name of the Vulkan command, for logging.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::CopyBuffer { .. } => "vkCmdCopyBuffer",
            Command::CopyImage { .. } => "vkCmdCopyImage",
            Command::CopyBufferToImage { .. } => "vkCmdCopyBufferToImage",
            Command::CopyImageToBuffer { .. } => "vkCmdCopyImageToBuffer",
            Command::BlitImage { .. } => "vkCmdBlitImage",
            Command::FillBuffer { .. } => "vkCmdFillBuffer",
            Command::UpdateBuffer { .. } => "vkCmdUpdateBuffer",
            Command::ClearColorImage { .. } => "vkCmdClearColorImage",
            Command::Launch { launch, .. } => launch.name(),
            Command::Barrier(_) => "vkCmdPipelineBarrier",
            Command::SetEvent(_) => "vkCmdSetEvent",
            Command::ResetEvent(_) => "vkCmdResetEvent",
            Command::WaitEvents { .. } => "vkCmdWaitEvents",
        }
    }
}

/// How a pipeline is launched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Launch {
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    DrawIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    DrawIndexedIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
}

impl Launch {
    #[inline]
    pub(crate) fn is_dispatch(self) -> bool {
        matches!(self, Launch::Dispatch { .. } | Launch::DispatchIndirect { .. })
    }

    /// Returns the buffer the launch parameters are read from, if any.
    #[inline]
    pub(crate) fn indirect_buffer(self) -> Option<vk::Buffer> {
        match self {
            Launch::DispatchIndirect { buffer, .. }
            | Launch::DrawIndirect { buffer, .. }
            | Launch::DrawIndexedIndirect { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Launch::Dispatch { .. } => "vkCmdDispatch",
            Launch::DispatchIndirect { .. } => "vkCmdDispatchIndirect",
            Launch::Draw { .. } => "vkCmdDraw",
            Launch::DrawIndexed { .. } => "vkCmdDrawIndexed",
            Launch::DrawIndirect { .. } => "vkCmdDrawIndirect",
            Launch::DrawIndexedIndirect { .. } => "vkCmdDrawIndexedIndirect",
        }
    }
}

/// The parts of a dependency that change the state of a resource: queue family ownership and
/// image layouts. Execution and memory dependencies are implied, since commands execute one at
/// a time.
#[derive(Clone, Debug, Default)]
pub(crate) struct Barriers {
    pub(crate) buffers: SmallVec<[BufferBarrier; 1]>,
    pub(crate) images: SmallVec<[ImageBarrier; 1]>,
}

impl Barriers {
    pub(crate) fn from_legacy(
        buffer_memory_barriers: &[BufferMemoryBarrier],
        image_memory_barriers: &[ImageMemoryBarrier],
    ) -> Self {
        Barriers {
            buffers: buffer_memory_barriers
                .iter()
                .map(|barrier| BufferBarrier {
                    buffer: barrier.buffer,
                    transfer: QueueFamilyTransfer::new(
                        barrier.src_queue_family_index,
                        barrier.dst_queue_family_index,
                    ),
                })
                .collect(),
            images: image_memory_barriers
                .iter()
                .map(|barrier| ImageBarrier {
                    image: barrier.image,
                    old_layout: barrier.old_layout,
                    new_layout: barrier.new_layout,
                    transfer: QueueFamilyTransfer::new(
                        barrier.src_queue_family_index,
                        barrier.dst_queue_family_index,
                    ),
                })
                .collect(),
        }
    }

    pub(crate) fn from_dependency_infos(dependency_infos: &[DependencyInfo<'_>]) -> Self {
        let mut barriers = Barriers::default();

        for dependency_info in dependency_infos {
            barriers
                .buffers
                .extend(dependency_info.buffer_memory_barriers.iter().map(
                    |barrier: &BufferMemoryBarrier2| BufferBarrier {
                        buffer: barrier.buffer,
                        transfer: QueueFamilyTransfer::new(
                            barrier.src_queue_family_index,
                            barrier.dst_queue_family_index,
                        ),
                    },
                ));
            barriers
                .images
                .extend(dependency_info.image_memory_barriers.iter().map(
                    |barrier: &ImageMemoryBarrier2| ImageBarrier {
                        image: barrier.image,
                        old_layout: barrier.old_layout,
                        new_layout: barrier.new_layout,
                        transfer: QueueFamilyTransfer::new(
                            barrier.src_queue_family_index,
                            barrier.dst_queue_family_index,
                        ),
                    },
                ));
        }

        barriers
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BufferBarrier {
    pub(crate) buffer: vk::Buffer,
    pub(crate) transfer: Option<QueueFamilyTransfer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ImageBarrier {
    pub(crate) image: vk::Image,
    pub(crate) old_layout: vk::ImageLayout,
    pub(crate) new_layout: vk::ImageLayout,
    pub(crate) transfer: Option<QueueFamilyTransfer>,
}

/// The two halves of a queue family ownership transfer share one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueFamilyTransfer {
    pub(crate) src: u32,
    pub(crate) dst: u32,
}

impl QueueFamilyTransfer {
    /// Returns `None` if the indices don't describe a transfer.
    pub(crate) fn new(src: u32, dst: u32) -> Option<Self> {
        (src != dst && src != vk::QUEUE_FAMILY_IGNORED && dst != vk::QUEUE_FAMILY_IGNORED)
            .then_some(QueueFamilyTransfer { src, dst })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfers_need_two_families() {
        assert_eq!(
            QueueFamilyTransfer::new(0, 1),
            Some(QueueFamilyTransfer { src: 0, dst: 1 }),
        );
        assert_eq!(QueueFamilyTransfer::new(1, 1), None);
        assert_eq!(QueueFamilyTransfer::new(vk::QUEUE_FAMILY_IGNORED, 1), None);
        assert_eq!(QueueFamilyTransfer::new(0, vk::QUEUE_FAMILY_IGNORED), None);
    }

    #[test]
    fn unified_barriers_are_flattened() {
        let image = ImageMemoryBarrier2 {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::GENERAL,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            ..Default::default()
        };
        let buffer = BufferMemoryBarrier2 {
            src_queue_family_index: 0,
            dst_queue_family_index: 2,
            ..Default::default()
        };
        let infos = [
            DependencyInfo {
                image_memory_barriers: &[image],
                ..Default::default()
            },
            DependencyInfo {
                buffer_memory_barriers: &[buffer],
                ..Default::default()
            },
        ];

        let barriers = Barriers::from_dependency_infos(&infos);

        assert_eq!(barriers.images.len(), 1);
        assert_eq!(barriers.images[0].transfer, None);
        assert_eq!(barriers.images[0].new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(
            barriers.buffers[0].transfer,
            Some(QueueFamilyTransfer { src: 0, dst: 2 }),
        );
    }
}
