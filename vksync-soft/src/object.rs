use crate::{command::Command, program::Program};
use ash::vk;
use smallvec::SmallVec;
use std::sync::Arc;
use vksync::provider::PipelineBinding;

/// Which queue family may access an exclusive resource.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Ownership {
    exclusive: bool,
    owner: Option<u32>,
}

impl Ownership {
    pub(crate) fn new(sharing_mode: vk::SharingMode) -> Self {
        Ownership {
            exclusive: sharing_mode == vk::SharingMode::EXCLUSIVE,
            owner: None,
        }
    }

    /// Records an access from `family`. Returns the owning family if it's another one.
    pub(crate) fn access(&mut self, family: u32) -> Result<(), u32> {
        if !self.exclusive {
            return Ok(());
        }

        match self.owner {
            Some(owner) if owner != family => Err(owner),
            _ => {
                self.owner = Some(family);
                Ok(())
            }
        }
    }

    /// Hands the resource to `family`, on a queue family ownership transfer or when its
    /// contents are discarded.
    pub(crate) fn transfer(&mut self, family: u32) {
        if self.exclusive {
            self.owner = Some(family);
        }
    }
}

#[derive(Debug)]
pub(crate) struct Buffer {
    pub(crate) usage: vk::BufferUsageFlags,
    pub(crate) host_visible: bool,
    pub(crate) ownership: Ownership,
    pub(crate) data: Vec<u8>,
}

impl Buffer {
    /// Returns the bytes in `offset..offset + size`, if they're all inside the buffer.
    pub(crate) fn range(&self, offset: u64, size: u64) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;

        (end <= self.data.len()).then_some(start..end)
    }
}

#[derive(Debug)]
pub(crate) struct Image {
    pub(crate) format: vk::Format,
    pub(crate) extent: vk::Extent3D,
    pub(crate) texel_size: u32,
    pub(crate) usage: vk::ImageUsageFlags,
    pub(crate) layout: vk::ImageLayout,
    pub(crate) ownership: Ownership,
    pub(crate) data: Vec<u8>,
}

impl Image {
    /// Returns the byte offset of the texel at `(x, y, z)`, or `None` if it's outside the
    /// image.
    pub(crate) fn texel_offset(&self, x: i64, y: i64, z: i64) -> Option<usize> {
        let vk::Extent3D {
            width,
            height,
            depth,
        } = self.extent;

        if x < 0 || y < 0 || z < 0 {
            return None;
        }

        let (x, y, z) = (x as u64, y as u64, z as u64);

        if x >= u64::from(width) || y >= u64::from(height) || z >= u64::from(depth) {
            return None;
        }

        let index = (z * u64::from(height) + y) * u64::from(width) + x;

        usize::try_from(index * u64::from(self.texel_size)).ok()
    }
}

#[derive(Debug)]
pub(crate) struct Semaphore {
    pub(crate) semaphore_type: vk::SemaphoreType,
    /// The counter of a timeline semaphore.
    pub(crate) value: u64,
    /// The payload of a binary semaphore.
    pub(crate) signaled: bool,
    /// Binary signals that were submitted and that no submitted wait has claimed yet.
    pub(crate) unclaimed_signals: u32,
}

impl Semaphore {
    #[inline]
    pub(crate) fn is_timeline(&self) -> bool {
        self.semaphore_type == vk::SemaphoreType::TIMELINE
    }
}

#[derive(Debug)]
pub(crate) struct Fence {
    pub(crate) signaled: bool,
}

#[derive(Debug)]
pub(crate) struct Event {
    pub(crate) set: bool,
}

#[derive(Debug)]
pub(crate) struct ShaderModule {
    pub(crate) program: Program,
    pub(crate) stage: vk::ShaderStageFlags,
}

#[derive(Debug)]
pub(crate) struct Pipeline {
    pub(crate) program: Program,
    pub(crate) stage: vk::ShaderStageFlags,
    pub(crate) bindings: SmallVec<[PipelineBinding; 2]>,
}

impl Pipeline {
    #[inline]
    pub(crate) fn is_compute(&self) -> bool {
        self.stage == vk::ShaderStageFlags::COMPUTE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
pub(crate) struct CommandBuffer {
    pub(crate) queue_family_index: u32,
    pub(crate) queue_flags: vk::QueueFlags,
    pub(crate) state: CommandBufferState,
    pub(crate) commands: Vec<Command>,
    /// What the last `end_command_buffer` froze, shared with the batches that execute it.
    pub(crate) recorded: Arc<[Command]>,
    pub(crate) bound_pipeline: Option<vk::Pipeline>,
    /// The number of batches that still have to execute the command buffer.
    pub(crate) pending: u32,
}

impl CommandBuffer {
    pub(crate) fn new(queue_family_index: u32, queue_flags: vk::QueueFlags) -> Self {
        CommandBuffer {
            queue_family_index,
            queue_flags,
            state: CommandBufferState::Initial,
            commands: Vec::new(),
            recorded: Arc::from([]),
            bound_pipeline: None,
            pending: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_ownership() {
        let mut ownership = Ownership::new(vk::SharingMode::EXCLUSIVE);

        assert_eq!(ownership.access(1), Ok(()));
        assert_eq!(ownership.access(1), Ok(()));
        assert_eq!(ownership.access(0), Err(1));

        ownership.transfer(0);
        assert_eq!(ownership.access(0), Ok(()));
        assert_eq!(ownership.access(2), Err(0));
    }

    #[test]
    fn concurrent_resources_have_no_owner() {
        let mut ownership = Ownership::new(vk::SharingMode::CONCURRENT);

        assert_eq!(ownership.access(1), Ok(()));
        assert_eq!(ownership.access(0), Ok(()));
    }

    #[test]
    fn texel_offsets() {
        let image = Image {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 4,
                height: 2,
                depth: 3,
            },
            texel_size: 4,
            usage: vk::ImageUsageFlags::TRANSFER_DST,
            layout: vk::ImageLayout::UNDEFINED,
            ownership: Ownership::default(),
            data: vec![0; 4 * 2 * 3 * 4],
        };

        assert_eq!(image.texel_offset(0, 0, 0), Some(0));
        assert_eq!(image.texel_offset(1, 0, 0), Some(4));
        assert_eq!(image.texel_offset(0, 1, 0), Some(16));
        assert_eq!(image.texel_offset(3, 1, 2), Some(((2 * 2 + 1) * 4 + 3) * 4));
        assert_eq!(image.texel_offset(4, 0, 0), None);
        assert_eq!(image.texel_offset(-1, 0, 0), None);
    }
}
