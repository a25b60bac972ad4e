//! Operations built from transfer commands.

use super::{check_data_size, no_payload, AccessMode, OperationContext, OperationName, Recorder};
use crate::{
    resource::{
        clear_color_texel, image_extent_for_size, BufferResource, HostBuffer, ImageResource,
        Resource, ResourceDescription, ResourceUsage,
    },
    sync::SyncInfo,
    Result, TestError,
};
use ash::vk;
use parking_lot::Mutex;

type Stage = vk::PipelineStageFlags2;
type Access = vk::AccessFlags2;
type Layout = vk::ImageLayout;

const FILL_VALUE: u32 = 0x13;

const COPY_WRITE: SyncInfo =
    SyncInfo::new(Stage::COPY, Access::TRANSFER_WRITE, Layout::UNDEFINED);
const COPY_SRC_LAYOUT: SyncInfo = SyncInfo::new(
    Stage::COPY,
    Access::TRANSFER_READ,
    Layout::TRANSFER_SRC_OPTIMAL,
);
const COPY_DST_LAYOUT: SyncInfo = SyncInfo::new(
    Stage::COPY,
    Access::TRANSFER_WRITE,
    Layout::TRANSFER_DST_OPTIMAL,
);
const BLIT_SRC_LAYOUT: SyncInfo = SyncInfo::new(
    Stage::BLIT,
    Access::TRANSFER_READ,
    Layout::TRANSFER_SRC_OPTIMAL,
);
const BLIT_DST_LAYOUT: SyncInfo = SyncInfo::new(
    Stage::BLIT,
    Access::TRANSFER_WRITE,
    Layout::TRANSFER_DST_OPTIMAL,
);

const UNDEFINED: SyncInfo = SyncInfo::EMPTY;

fn staging_usage() -> ResourceUsage {
    ResourceUsage::image(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FillUpdateMode {
    Fill,
    Update,
}

/// `vkCmdFillBuffer` and `vkCmdUpdateBuffer` writes.
#[derive(Debug)]
pub struct FillUpdateBuffer {
    pub(super) name: OperationName,
    recorder: Recorder,
    mode: FillUpdateMode,
    buffer: BufferResource,
    data: Mutex<Vec<u8>>,
}

impl FillUpdateBuffer {
    pub(super) fn fill(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;
        let words = vec![FILL_VALUE; (buffer.size / 4) as usize];

        Ok(FillUpdateBuffer {
            name: OperationName::WriteFillBuffer,
            recorder: context.recorder(),
            mode: FillUpdateMode::Fill,
            buffer,
            data: Mutex::new(bytemuck::cast_slice(&words).to_vec()),
        })
    }

    pub(super) fn update(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;
        let data = context.random_data(resource.description(), buffer.size as usize);

        Ok(FillUpdateBuffer {
            name: OperationName::WriteUpdateBuffer,
            recorder: context.recorder(),
            mode: FillUpdateMode::Update,
            buffer,
            data: Mutex::new(data),
        })
    }

    pub(super) fn update_index(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;
        let indices: Vec<u32> = (0..(buffer.size / 4) as u32).collect();

        Ok(FillUpdateBuffer {
            name: OperationName::WriteUpdateIndexBuffer,
            recorder: context.recorder(),
            mode: FillUpdateMode::Update,
            buffer,
            data: Mutex::new(bytemuck::cast_slice(&indices).to_vec()),
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        let provider = &self.recorder.provider;

        match self.mode {
            FillUpdateMode::Fill => provider.cmd_fill_buffer(
                command_buffer,
                self.buffer.handle,
                self.buffer.offset,
                self.buffer.size,
                FILL_VALUE,
            ),
            FillUpdateMode::Update => provider.cmd_update_buffer(
                command_buffer,
                self.buffer.handle,
                self.buffer.offset,
                &self.data.lock(),
            ),
        }

        Ok(())
    }

    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        Ok(self.data.lock().clone())
    }

    /// The new payload is only used if the commands haven't been recorded yet.
    pub(super) fn set_data(&self, data: &[u8]) -> Result {
        if self.mode == FillUpdateMode::Fill {
            return Err(no_payload(self.name));
        }

        let mut current = self.data.lock();
        check_data_size(self.name, current.len(), data.len())?;
        current.copy_from_slice(data);

        Ok(())
    }
}

/// `vkCmdCopyBuffer` between a resource and host memory, or between two resources.
#[derive(Debug)]
pub struct CopyBuffer {
    pub(super) name: OperationName,
    recorder: Recorder,
    src: BufferResource,
    dst: BufferResource,
    host: Option<HostBuffer>,
}

impl CopyBuffer {
    pub(super) fn write(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;
        let data = context.random_data(resource.description(), buffer.size as usize);
        let host = HostBuffer::with_data(
            context.provider(),
            &data,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;

        Ok(CopyBuffer {
            name: OperationName::WriteCopyBuffer,
            recorder: context.recorder(),
            src: host.region(),
            dst: buffer,
            host: Some(host),
        })
    }

    pub(super) fn read(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;
        let host = HostBuffer::new(
            context.provider(),
            buffer.size,
            vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        Ok(CopyBuffer {
            name: OperationName::ReadCopyBuffer,
            recorder: context.recorder(),
            src: buffer,
            dst: host.region(),
            host: Some(host),
        })
    }

    pub(super) fn copy(
        context: &OperationContext,
        in_resource: &Resource,
        out_resource: &Resource,
    ) -> Result<Self> {
        let src = *in_resource.buffer()?;
        let dst = *out_resource.buffer()?;

        if src.size != dst.size {
            return Err(TestError::harness(format!(
                "can't copy a buffer of {} bytes into a buffer of {} bytes",
                src.size, dst.size,
            )));
        }

        Ok(CopyBuffer {
            name: OperationName::CopyBuffer,
            recorder: context.recorder(),
            src,
            dst,
            host: None,
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        let region = vk::BufferCopy {
            src_offset: self.src.offset,
            dst_offset: self.dst.offset,
            size: self.src.size,
        };

        self.recorder.provider.cmd_copy_buffer(
            command_buffer,
            self.src.handle,
            self.dst.handle,
            &[region],
        );

        if self.name.access_mode() == AccessMode::Read {
            self.recorder
                .host_read_barrier(command_buffer, &self.dst, &COPY_WRITE);
        }

        Ok(())
    }

    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        match &self.host {
            Some(host) => host.read(),
            None => Ok(Vec::new()),
        }
    }

    pub(super) fn set_data(&self, data: &[u8]) -> Result {
        match &self.host {
            Some(host) if self.name.access_mode() == AccessMode::Write => {
                check_data_size(self.name, host.size() as usize, data.len())?;
                host.write(data)
            }
            _ => Err(no_payload(self.name)),
        }
    }
}

/// An image that stages data between host memory and an image resource.
#[derive(Debug)]
struct StagingImage {
    image: Resource,
    host: HostBuffer,
}

impl StagingImage {
    fn new(
        context: &OperationContext,
        desc: &ResourceDescription,
        host_usage: vk::BufferUsageFlags,
        data: Option<&[u8]>,
    ) -> Result<Self> {
        let image = Resource::new(context.provider(), desc, staging_usage(), &[])?;
        let host = match data {
            Some(data) => HostBuffer::with_data(context.provider(), data, host_usage)?,
            None => HostBuffer::new(context.provider(), desc.byte_size(), host_usage)?,
        };

        Ok(StagingImage { image, host })
    }

    fn image(&self) -> Result<ImageResource> {
        self.image.image().copied()
    }
}

/// Copies and blits between whole images of the same size.
#[derive(Debug)]
pub struct CopyImage {
    pub(super) name: OperationName,
    recorder: Recorder,
    blit: bool,
    src: ImageResource,
    dst: ImageResource,
    staging: Option<StagingImage>,
}

impl CopyImage {
    pub(super) fn write(
        context: &OperationContext,
        resource: &Resource,
        blit: bool,
    ) -> Result<Self> {
        let dst = *resource.image()?;
        let desc = resource.description();
        let data = context.random_data(desc, desc.byte_size() as usize);
        let staging = StagingImage::new(
            context,
            desc,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Some(&data),
        )?;

        Ok(CopyImage {
            name: if blit {
                OperationName::WriteBlitImage
            } else {
                OperationName::WriteCopyImage
            },
            recorder: context.recorder(),
            blit,
            src: staging.image()?,
            dst,
            staging: Some(staging),
        })
    }

    pub(super) fn read(context: &OperationContext, resource: &Resource, blit: bool) -> Result<Self> {
        let src = *resource.image()?;
        let staging = StagingImage::new(
            context,
            resource.description(),
            vk::BufferUsageFlags::TRANSFER_DST,
            None,
        )?;

        Ok(CopyImage {
            name: if blit {
                OperationName::ReadBlitImage
            } else {
                OperationName::ReadCopyImage
            },
            recorder: context.recorder(),
            blit,
            src,
            dst: staging.image()?,
            staging: Some(staging),
        })
    }

    pub(super) fn copy(
        context: &OperationContext,
        in_resource: &Resource,
        out_resource: &Resource,
        blit: bool,
    ) -> Result<Self> {
        let src = *in_resource.image()?;
        let dst = *out_resource.image()?;

        if src.extent != dst.extent || src.format != dst.format {
            return Err(TestError::harness(format!(
                "can't copy `{}` into `{}`",
                in_resource.description().name(),
                out_resource.description().name(),
            )));
        }

        Ok(CopyImage {
            name: if blit {
                OperationName::CopyBlitImage
            } else {
                OperationName::CopyImage
            },
            recorder: context.recorder(),
            blit,
            src,
            dst,
            staging: None,
        })
    }

    fn src_layout(&self) -> SyncInfo {
        if self.blit {
            BLIT_SRC_LAYOUT
        } else {
            COPY_SRC_LAYOUT
        }
    }

    fn dst_layout(&self) -> SyncInfo {
        if self.blit {
            BLIT_DST_LAYOUT
        } else {
            COPY_DST_LAYOUT
        }
    }

    fn record_transfer(&self, command_buffer: vk::CommandBuffer) {
        let provider = &self.recorder.provider;
        let extent = self.src.extent;

        if self.blit {
            let corner = vk::Offset3D {
                x: extent.width as i32,
                y: extent.height as i32,
                z: extent.depth as i32,
            };
            let region = vk::ImageBlit {
                src_subresource: self.src.subresource_layers,
                src_offsets: [vk::Offset3D::default(), corner],
                dst_subresource: self.dst.subresource_layers,
                dst_offsets: [vk::Offset3D::default(), corner],
            };

            provider.cmd_blit_image(
                command_buffer,
                self.src.handle,
                Layout::TRANSFER_SRC_OPTIMAL,
                self.dst.handle,
                Layout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::NEAREST,
            );
        } else {
            let region = vk::ImageCopy {
                src_subresource: self.src.subresource_layers,
                src_offset: vk::Offset3D::default(),
                dst_subresource: self.dst.subresource_layers,
                dst_offset: vk::Offset3D::default(),
                extent,
            };

            provider.cmd_copy_image(
                command_buffer,
                self.src.handle,
                Layout::TRANSFER_SRC_OPTIMAL,
                self.dst.handle,
                Layout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        let provider = &self.recorder.provider;

        match (self.name.access_mode(), &self.staging) {
            (AccessMode::Write, Some(staging)) => {
                let image = staging.image()?;

                self.recorder
                    .image_barrier(command_buffer, &image, &UNDEFINED, &COPY_DST_LAYOUT);
                provider.cmd_copy_buffer_to_image(
                    command_buffer,
                    staging.host.handle(),
                    image.handle,
                    Layout::TRANSFER_DST_OPTIMAL,
                    &[image.buffer_image_copy()],
                );
                self.recorder.image_barrier(
                    command_buffer,
                    &image,
                    &COPY_DST_LAYOUT,
                    &self.src_layout(),
                );
                self.recorder.image_barrier(
                    command_buffer,
                    &self.dst,
                    &UNDEFINED,
                    &self.dst_layout(),
                );
                self.record_transfer(command_buffer);
            }
            (AccessMode::Read, Some(staging)) => {
                let image = staging.image()?;

                self.recorder
                    .image_barrier(command_buffer, &image, &UNDEFINED, &self.dst_layout());
                self.record_transfer(command_buffer);
                self.recorder.image_barrier(
                    command_buffer,
                    &image,
                    &self.dst_layout(),
                    &COPY_SRC_LAYOUT,
                );
                provider.cmd_copy_image_to_buffer(
                    command_buffer,
                    image.handle,
                    Layout::TRANSFER_SRC_OPTIMAL,
                    staging.host.handle(),
                    &[image.buffer_image_copy()],
                );
                self.recorder.host_read_barrier(
                    command_buffer,
                    &staging.host.region(),
                    &COPY_WRITE,
                );
            }
            _ => {
                self.recorder.image_barrier(
                    command_buffer,
                    &self.dst,
                    &UNDEFINED,
                    &self.dst_layout(),
                );
                self.record_transfer(command_buffer);
            }
        }

        Ok(())
    }

    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        match &self.staging {
            Some(staging) => staging.host.read(),
            None => Ok(Vec::new()),
        }
    }

    pub(super) fn set_data(&self, data: &[u8]) -> Result {
        match &self.staging {
            Some(staging) if self.name.access_mode() == AccessMode::Write => {
                check_data_size(self.name, staging.host.size() as usize, data.len())?;
                staging.host.write(data)
            }
            _ => Err(no_payload(self.name)),
        }
    }
}

/// `vkCmdCopyBufferToImage` and `vkCmdCopyImageToBuffer`, with either side being the
/// resource.
///
/// When the resource is a buffer, the data goes through a 2D RGBA8 image sized to hold the
/// whole buffer.
#[derive(Debug)]
pub struct BufferImageCopy {
    pub(super) name: OperationName,
    recorder: Recorder,
    host: HostBuffer,
    buffer: Option<BufferResource>,
    image: ImageResource,
    staging: Option<Resource>,
}

impl BufferImageCopy {
    /// Host memory into an image resource.
    pub(super) fn write_image(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let image = *resource.image()?;
        let desc = resource.description();
        let data = context.random_data(desc, desc.byte_size() as usize);
        let host = HostBuffer::with_data(
            context.provider(),
            &data,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;

        Ok(BufferImageCopy {
            name: OperationName::WriteCopyBufferToImage,
            recorder: context.recorder(),
            host,
            buffer: None,
            image,
            staging: None,
        })
    }

    /// An image resource into host memory.
    pub(super) fn read_image(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let image = *resource.image()?;
        let host = HostBuffer::new(
            context.provider(),
            resource.description().byte_size(),
            vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        Ok(BufferImageCopy {
            name: OperationName::ReadCopyImageToBuffer,
            recorder: context.recorder(),
            host,
            buffer: None,
            image,
            staging: None,
        })
    }

    /// Host memory into a buffer resource, through an image.
    pub(super) fn write_buffer(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;
        let staging = staging_image_for(context, buffer.size)?;
        let data = context.random_data(resource.description(), buffer.size as usize);
        let host = HostBuffer::with_data(
            context.provider(),
            &data,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;

        Ok(BufferImageCopy {
            name: OperationName::WriteCopyImageToBuffer,
            recorder: context.recorder(),
            host,
            buffer: Some(buffer),
            image: *staging.image()?,
            staging: Some(staging),
        })
    }

    /// A buffer resource into host memory, through an image.
    pub(super) fn read_buffer(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;
        let staging = staging_image_for(context, buffer.size)?;
        let host = HostBuffer::new(
            context.provider(),
            buffer.size,
            vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        Ok(BufferImageCopy {
            name: OperationName::ReadCopyBufferToImage,
            recorder: context.recorder(),
            host,
            buffer: Some(buffer),
            image: *staging.image()?,
            staging: Some(staging),
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        let provider = &self.recorder.provider;
        let region = self.image.buffer_image_copy();
        let host = self.host.handle();

        match (self.name, self.buffer) {
            (OperationName::WriteCopyBufferToImage, _) => {
                self.recorder.image_barrier(
                    command_buffer,
                    &self.image,
                    &UNDEFINED,
                    &COPY_DST_LAYOUT,
                );
                provider.cmd_copy_buffer_to_image(
                    command_buffer,
                    host,
                    self.image.handle,
                    Layout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            (OperationName::ReadCopyImageToBuffer, _) => {
                provider.cmd_copy_image_to_buffer(
                    command_buffer,
                    self.image.handle,
                    Layout::TRANSFER_SRC_OPTIMAL,
                    host,
                    &[region],
                );
                self.recorder
                    .host_read_barrier(command_buffer, &self.host.region(), &COPY_WRITE);
            }
            (OperationName::WriteCopyImageToBuffer, Some(buffer)) => {
                self.recorder.image_barrier(
                    command_buffer,
                    &self.image,
                    &UNDEFINED,
                    &COPY_DST_LAYOUT,
                );
                provider.cmd_copy_buffer_to_image(
                    command_buffer,
                    host,
                    self.image.handle,
                    Layout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                self.recorder.image_barrier(
                    command_buffer,
                    &self.image,
                    &COPY_DST_LAYOUT,
                    &COPY_SRC_LAYOUT,
                );
                provider.cmd_copy_image_to_buffer(
                    command_buffer,
                    self.image.handle,
                    Layout::TRANSFER_SRC_OPTIMAL,
                    buffer.handle,
                    &[region],
                );
            }
            (OperationName::ReadCopyBufferToImage, Some(buffer)) => {
                self.recorder.image_barrier(
                    command_buffer,
                    &self.image,
                    &UNDEFINED,
                    &COPY_DST_LAYOUT,
                );
                provider.cmd_copy_buffer_to_image(
                    command_buffer,
                    buffer.handle,
                    self.image.handle,
                    Layout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                self.recorder.image_barrier(
                    command_buffer,
                    &self.image,
                    &COPY_DST_LAYOUT,
                    &COPY_SRC_LAYOUT,
                );
                provider.cmd_copy_image_to_buffer(
                    command_buffer,
                    self.image.handle,
                    Layout::TRANSFER_SRC_OPTIMAL,
                    host,
                    &[region],
                );
                self.recorder
                    .host_read_barrier(command_buffer, &self.host.region(), &COPY_WRITE);
            }
            _ => {
                return Err(TestError::harness(format!(
                    "`{}` has no buffer to copy through",
                    self.name,
                )));
            }
        }

        Ok(())
    }

    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        self.host.read()
    }

    pub(super) fn set_data(&self, data: &[u8]) -> Result {
        if self.name.access_mode() != AccessMode::Write {
            return Err(no_payload(self.name));
        }

        check_data_size(self.name, self.host.size() as usize, data.len())?;

        self.host.write(data)
    }
}

fn staging_image_for(context: &OperationContext, size: vk::DeviceSize) -> Result<Resource> {
    let extent = image_extent_for_size(size, 4);
    let texels = vk::DeviceSize::from(extent.width) * vk::DeviceSize::from(extent.height);

    if texels * 4 != size {
        return Err(TestError::not_supported(format!(
            "a buffer of {size} bytes can't be copied through a 2D image",
        )));
    }

    let desc = ResourceDescription::image(
        vk::ImageType::TYPE_2D,
        [extent.width, extent.height, 1],
        vk::Format::R8G8B8A8_UNORM,
    );

    Resource::new(context.provider(), &desc, staging_usage(), &[])
}

/// `vkCmdClearColorImage` with a random color.
#[derive(Debug)]
pub struct ClearColorImage {
    pub(super) name: OperationName,
    recorder: Recorder,
    image: ImageResource,
    color: [u32; 4],
    expected: Vec<u8>,
}

impl ClearColorImage {
    pub(super) fn new(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let image = *resource.image()?;
        let desc = resource.description();
        let color = random_clear_color(context, desc.image_format);
        let texel = clear_color_texel(desc.image_format, color).ok_or_else(|| {
            TestError::harness(format!(
                "format {:?} can't be cleared to a known value",
                desc.image_format,
            ))
        })?;
        let texel_count = desc.byte_size() as usize / texel.len();

        Ok(ClearColorImage {
            name: OperationName::WriteClearColorImage,
            recorder: context.recorder(),
            image,
            color,
            expected: texel.repeat(texel_count),
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        let clear = SyncInfo::new(
            Stage::CLEAR,
            Access::TRANSFER_WRITE,
            Layout::TRANSFER_DST_OPTIMAL,
        );

        self.recorder
            .image_barrier(command_buffer, &self.image, &UNDEFINED, &clear);
        self.recorder.provider.cmd_clear_color_image(
            command_buffer,
            self.image.handle,
            Layout::TRANSFER_DST_OPTIMAL,
            self.color,
        );

        Ok(())
    }

    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        Ok(self.expected.clone())
    }

    pub(super) fn set_data(&self, _data: &[u8]) -> Result {
        Err(no_payload(self.name))
    }
}

// Components are picked so that they convert to the texel format exactly.
fn random_clear_color(context: &OperationContext, format: vk::Format) -> [u32; 4] {
    let mut color = [0; 4];

    for component in &mut color {
        let random = context.random_u32();

        *component = match format {
            vk::Format::R8_UNORM
            | vk::Format::R8G8_UNORM
            | vk::Format::R8G8B8A8_UNORM
            | vk::Format::B8G8R8A8_UNORM => (f32::from((random % 256) as u8) / 255.0).to_bits(),
            vk::Format::R32_SFLOAT | vk::Format::R32G32_SFLOAT | vk::Format::R32G32B32A32_SFLOAT => {
                ((random >> 8) as f32 / (1u32 << 24) as f32).to_bits()
            }
            _ => random % 256,
        };
    }

    color
}
