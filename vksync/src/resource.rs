//! Abstract descriptions of test resources, and the live objects built from them.
//!
//! A [`ResourceDescription`] is a plain value: it names the kind of resource, its size and, for
//! images, its type, format, aspect and sample count. A [`Resource`] is created from a
//! description plus the union of the usage flags of every operation that will touch it, and is
//! destroyed when dropped.

use crate::{
    provider::{BufferCreateInfo, ImageCreateInfo, Provider},
    ProviderResultExt, Result, TestError,
};
use ash::vk;
use std::{fmt, ops::BitOr, sync::Arc};

/// The largest buffer that can be written with `vkCmdUpdateBuffer`.
pub const MAX_UPDATE_BUFFER_SIZE: u32 = 0x10000;

/// The largest buffer that can be bound as a uniform buffer.
pub const MAX_UBO_RANGE: u32 = 0x10000;

/// The widest 2D image used as an intermediate for buffer transfers.
pub const MAX_IMAGE_DIMENSION_2D: u32 = 0x1000;

/// The kind of a test resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    /// A buffer holding one `VkDrawIndirectCommand`.
    IndirectBufferDraw,
    /// A buffer holding one `VkDrawIndexedIndirectCommand`.
    IndirectBufferDrawIndexed,
    /// A buffer holding one `VkDispatchIndirectCommand`.
    IndirectBufferDispatch,
    IndexBuffer,
}

impl ResourceKind {
    /// Returns whether resources of this kind are backed by a buffer.
    #[inline]
    pub const fn is_buffer(self) -> bool {
        !matches!(self, ResourceKind::Image)
    }

    /// Returns whether resources of this kind carry an indirect command, whose effect is
    /// verified through a counter rather than byte for byte.
    #[inline]
    pub const fn is_indirect(self) -> bool {
        matches!(
            self,
            ResourceKind::IndirectBufferDraw
                | ResourceKind::IndirectBufferDrawIndexed
                | ResourceKind::IndirectBufferDispatch
        )
    }
}

/// An immutable description of a test resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceDescription {
    pub kind: ResourceKind,

    /// `[x, y, z, element count]`. Buffers use `x` as their size in bytes, images use `x`, `y`
    /// and `z` as their extent.
    pub size: [u32; 4],

    pub image_type: vk::ImageType,
    pub image_format: vk::Format,
    pub image_aspect: vk::ImageAspectFlags,
    pub image_samples: vk::SampleCountFlags,
}

impl ResourceDescription {
    /// Describes a buffer of `size` bytes.
    pub const fn buffer(size: u32) -> Self {
        ResourceDescription {
            kind: ResourceKind::Buffer,
            size: [size, 0, 0, 0],
            image_type: vk::ImageType::TYPE_1D,
            image_format: vk::Format::UNDEFINED,
            image_aspect: vk::ImageAspectFlags::empty(),
            image_samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    /// Describes a single-sampled color image.
    pub const fn image(image_type: vk::ImageType, extent: [u32; 3], format: vk::Format) -> Self {
        ResourceDescription {
            kind: ResourceKind::Image,
            size: [extent[0], extent[1], extent[2], 0],
            image_type,
            image_format: format,
            image_aspect: vk::ImageAspectFlags::COLOR,
            image_samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    /// Describes a buffer that holds one indirect command of the given kind.
    pub const fn indirect(kind: ResourceKind) -> Self {
        let mut desc = ResourceDescription::buffer(0);
        desc.kind = kind;

        desc
    }

    /// Describes an index buffer of `size` bytes.
    pub const fn index_buffer(size: u32) -> Self {
        let mut desc = ResourceDescription::buffer(size);
        desc.kind = ResourceKind::IndexBuffer;

        desc
    }

    /// Returns the extent of an image resource.
    #[inline]
    pub const fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.size[0],
            height: self.size[1],
            depth: self.size[2],
        }
    }

    /// Returns the size in bytes of the data a resource of this description holds.
    pub fn byte_size(&self) -> vk::DeviceSize {
        match self.kind {
            ResourceKind::Buffer | ResourceKind::IndexBuffer => self.size[0].into(),
            ResourceKind::Image => {
                let texel_size = texel_block_size(self.image_format).unwrap_or(0);

                vk::DeviceSize::from(self.size[0])
                    * vk::DeviceSize::from(self.size[1].max(1))
                    * vk::DeviceSize::from(self.size[2].max(1))
                    * vk::DeviceSize::from(texel_size)
            }
            ResourceKind::IndirectBufferDraw => size_of::<DrawIndirectCommand>() as _,
            ResourceKind::IndirectBufferDrawIndexed => {
                size_of::<DrawIndexedIndirectCommand>() as _
            }
            ResourceKind::IndirectBufferDispatch => size_of::<DispatchIndirectCommand>() as _,
        }
    }

    /// Returns the name used for the description in test case names.
    pub fn name(&self) -> String {
        match self.kind {
            ResourceKind::Buffer => format!("buffer_{}", self.size[0]),
            ResourceKind::IndexBuffer => "index_buffer".to_owned(),
            ResourceKind::IndirectBufferDraw => "indirect_buffer_draw".to_owned(),
            ResourceKind::IndirectBufferDrawIndexed => "indirect_buffer_draw_indexed".to_owned(),
            ResourceKind::IndirectBufferDispatch => "indirect_buffer_dispatch".to_owned(),
            ResourceKind::Image => {
                let dimensions = match self.image_type {
                    vk::ImageType::TYPE_1D => format!("image_1d_{}", self.size[0]),
                    vk::ImageType::TYPE_2D => format!("image_{}x{}", self.size[0], self.size[1]),
                    _ => format!(
                        "image_3d_{}x{}x{}",
                        self.size[0], self.size[1], self.size[2],
                    ),
                };

                format!(
                    "{dimensions}_{}",
                    format!("{:?}", self.image_format).to_lowercase(),
                )
            }
        }
    }
}

/// The resources every test family is instantiated with.
pub const RESOURCES: &[ResourceDescription] = &[
    ResourceDescription::buffer(0x4000),
    ResourceDescription::buffer(0x40000),
    ResourceDescription::image(
        vk::ImageType::TYPE_2D,
        [128, 128, 1],
        vk::Format::R8G8B8A8_UNORM,
    ),
    ResourceDescription::image(
        vk::ImageType::TYPE_2D,
        [128, 128, 1],
        vk::Format::R32G32B32A32_SFLOAT,
    ),
    ResourceDescription::image(vk::ImageType::TYPE_3D, [64, 64, 8], vk::Format::R32_SFLOAT),
    ResourceDescription::indirect(ResourceKind::IndirectBufferDraw),
    ResourceDescription::indirect(ResourceKind::IndirectBufferDrawIndexed),
    ResourceDescription::indirect(ResourceKind::IndirectBufferDispatch),
    ResourceDescription::index_buffer(0x20),
];

/// Usage flags of a resource, for both of the object kinds a resource can be.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceUsage {
    pub buffer: vk::BufferUsageFlags,
    pub image: vk::ImageUsageFlags,
}

impl ResourceUsage {
    #[inline]
    pub const fn empty() -> Self {
        ResourceUsage {
            buffer: vk::BufferUsageFlags::empty(),
            image: vk::ImageUsageFlags::empty(),
        }
    }

    #[inline]
    pub const fn buffer(usage: vk::BufferUsageFlags) -> Self {
        ResourceUsage {
            buffer: usage,
            image: vk::ImageUsageFlags::empty(),
        }
    }

    #[inline]
    pub const fn image(usage: vk::ImageUsageFlags) -> Self {
        ResourceUsage {
            buffer: vk::BufferUsageFlags::empty(),
            image: usage,
        }
    }

    /// Returns whether `self` contains every flag of `other`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.buffer.contains(other.buffer) && self.image.contains(other.image)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.buffer.is_empty() && self.image.is_empty()
    }
}

impl BitOr for ResourceUsage {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        ResourceUsage {
            buffer: self.buffer | rhs.buffer,
            image: self.image | rhs.image,
        }
    }
}

/// A buffer region owned by a [`Resource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferResource {
    pub handle: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// An image owned by a [`Resource`].
#[derive(Clone, Copy, Debug)]
pub struct ImageResource {
    pub handle: vk::Image,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub subresource_range: vk::ImageSubresourceRange,
    pub subresource_layers: vk::ImageSubresourceLayers,
}

impl ImageResource {
    /// Returns a region covering the whole image, tightly packed in a buffer.
    pub fn buffer_image_copy(&self) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: self.subresource_layers,
            image_offset: vk::Offset3D::default(),
            image_extent: self.extent,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ResourceHandle {
    Buffer(BufferResource),
    Image(ImageResource),
}

/// A live buffer or image, destroyed when dropped.
pub struct Resource {
    provider: Arc<dyn Provider>,
    description: ResourceDescription,
    usage: ResourceUsage,
    handle: ResourceHandle,
}

impl Resource {
    /// Creates a resource with exactly the given usage flags.
    ///
    /// The usage must be the union of the requirements of every operation that will use the
    /// resource; an empty usage is a harness bug. A description the device can't create is
    /// reported as not supported.
    pub fn new(
        provider: &Arc<dyn Provider>,
        description: &ResourceDescription,
        usage: ResourceUsage,
        queue_family_indices: &[u32],
    ) -> Result<Self> {
        let sharing_mode = if queue_family_indices.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let handle = if description.kind.is_buffer() {
            if usage.buffer.is_empty() {
                return Err(TestError::harness(format!(
                    "no buffer usage flags were requested for `{}`",
                    description.name(),
                )));
            }

            let size = description.byte_size();
            let handle = provider
                .create_buffer(&BufferCreateInfo {
                    size,
                    usage: usage.buffer,
                    sharing_mode,
                    host_visible: false,
                })
                .checked("vkCreateBuffer")?;

            ResourceHandle::Buffer(BufferResource {
                handle,
                offset: 0,
                size,
            })
        } else {
            if usage.image.is_empty() {
                return Err(TestError::harness(format!(
                    "no image usage flags were requested for `{}`",
                    description.name(),
                )));
            }

            let create_info = ImageCreateInfo {
                image_type: description.image_type,
                format: description.image_format,
                extent: description.extent(),
                samples: description.image_samples,
                usage: usage.image,
                sharing_mode,
            };

            match provider.image_format_supported(&create_info) {
                Ok(()) => {}
                Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => {
                    return Err(TestError::not_supported(format!(
                        "image format {:?} with usage {:?} is not supported",
                        description.image_format, usage.image,
                    )));
                }
                Err(result) => {
                    return Err(TestError::Provider {
                        call: "vkGetPhysicalDeviceImageFormatProperties",
                        result,
                    });
                }
            }

            let handle = provider
                .create_image(&create_info)
                .checked("vkCreateImage")?;

            let subresource_range = vk::ImageSubresourceRange {
                aspect_mask: description.image_aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };
            let subresource_layers = vk::ImageSubresourceLayers {
                aspect_mask: description.image_aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            };

            ResourceHandle::Image(ImageResource {
                handle,
                image_type: description.image_type,
                format: description.image_format,
                extent: description.extent(),
                subresource_range,
                subresource_layers,
            })
        };

        Ok(Resource {
            provider: provider.clone(),
            description: *description,
            usage,
            handle,
        })
    }

    #[inline]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    #[inline]
    pub fn description(&self) -> &ResourceDescription {
        &self.description
    }

    #[inline]
    pub fn kind(&self) -> ResourceKind {
        self.description.kind
    }

    /// Returns the usage flags the resource was created with.
    #[inline]
    pub fn usage(&self) -> ResourceUsage {
        self.usage
    }

    #[inline]
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// Returns the buffer backing the resource, or a harness error if it's an image.
    pub fn buffer(&self) -> Result<&BufferResource> {
        match &self.handle {
            ResourceHandle::Buffer(buffer) => Ok(buffer),
            ResourceHandle::Image(_) => Err(TestError::harness(format!(
                "`{}` was used as a buffer",
                self.description.name(),
            ))),
        }
    }

    /// Returns the image backing the resource, or a harness error if it's a buffer.
    pub fn image(&self) -> Result<&ImageResource> {
        match &self.handle {
            ResourceHandle::Image(image) => Ok(image),
            ResourceHandle::Buffer(_) => Err(TestError::harness(format!(
                "`{}` was used as an image",
                self.description.name(),
            ))),
        }
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        match self.handle {
            ResourceHandle::Buffer(buffer) => self.provider.destroy_buffer(buffer.handle),
            ResourceHandle::Image(image) => self.provider.destroy_image(image.handle),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("description", &self.description)
            .field("usage", &self.usage)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// A host-visible buffer used to stage data in and out of the device.
pub struct HostBuffer {
    provider: Arc<dyn Provider>,
    handle: vk::Buffer,
    size: vk::DeviceSize,
}

impl HostBuffer {
    pub fn new(
        provider: &Arc<dyn Provider>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let handle = provider
            .create_buffer(&BufferCreateInfo {
                size,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                host_visible: true,
            })
            .checked("vkCreateBuffer")?;

        Ok(HostBuffer {
            provider: provider.clone(),
            handle,
            size,
        })
    }

    /// Creates a host buffer and fills it with `data`.
    pub fn with_data(
        provider: &Arc<dyn Provider>,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let buffer = HostBuffer::new(provider, data.len() as vk::DeviceSize, usage)?;
        buffer.write(data)?;

        Ok(buffer)
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Returns the whole buffer as a region, for barriers and bindings.
    #[inline]
    pub fn region(&self) -> BufferResource {
        BufferResource {
            handle: self.handle,
            offset: 0,
            size: self.size,
        }
    }

    /// Overwrites the start of the buffer with `data`.
    pub fn write(&self, data: &[u8]) -> Result {
        if data.len() as vk::DeviceSize > self.size {
            return Err(TestError::harness(format!(
                "{} bytes don't fit in a host buffer of {} bytes",
                data.len(),
                self.size,
            )));
        }

        self.provider
            .write_buffer(self.handle, 0, data)
            .checked("vkFlushMappedMemoryRanges")
    }

    /// Reads back the whole buffer.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.provider
            .read_buffer(self.handle, 0, self.size)
            .checked("vkInvalidateMappedMemoryRanges")
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.provider.destroy_buffer(self.handle);
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// `VkDrawIndirectCommand`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct DrawIndirectCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// `VkDrawIndexedIndirectCommand`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct DrawIndexedIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// `VkDispatchIndirectCommand`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct DispatchIndirectCommand {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Returns the size in bytes of one texel of an uncompressed color format.
pub fn texel_block_size(format: vk::Format) -> Option<u32> {
    Some(match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_UINT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::R32_UINT
        | vk::Format::R32_SFLOAT => 4,
        vk::Format::R16G16B16A16_UINT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    })
}

/// Returns the bytes of one texel of `format` cleared to `color`.
///
/// `color` is the `uint32` view of a `VkClearColorValue`: for normalized and floating-point
/// formats each component holds the bits of an `f32`.
pub fn clear_color_texel(format: vk::Format, color: [u32; 4]) -> Option<Vec<u8>> {
    let unorm8 = |bits: u32| (f32::from_bits(bits).clamp(0.0, 1.0) * 255.0).round() as u8;

    let texel = match format {
        vk::Format::R8_UNORM => vec![unorm8(color[0])],
        vk::Format::R8_UINT => vec![color[0] as u8],
        vk::Format::R8G8_UNORM => vec![unorm8(color[0]), unorm8(color[1])],
        vk::Format::R8G8B8A8_UNORM => color.iter().map(|&c| unorm8(c)).collect(),
        vk::Format::B8G8R8A8_UNORM => [color[2], color[1], color[0], color[3]]
            .iter()
            .map(|&c| unorm8(c))
            .collect(),
        vk::Format::R8G8B8A8_UINT => color.iter().map(|&c| c as u8).collect(),
        vk::Format::R16_UINT => (color[0] as u16).to_ne_bytes().to_vec(),
        vk::Format::R16G16B16A16_UINT => color
            .iter()
            .flat_map(|&c| (c as u16).to_ne_bytes())
            .collect(),
        vk::Format::R32_UINT | vk::Format::R32_SFLOAT => color[0].to_ne_bytes().to_vec(),
        vk::Format::R32G32_SFLOAT => bytemuck::cast_slice(&color[..2]).to_vec(),
        vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SFLOAT => {
            bytemuck::cast_slice(&color).to_vec()
        }
        _ => return None,
    };

    Some(texel)
}

/// Returns the extent of a 2D image that holds `size` bytes of texels of `texel_size` bytes.
pub fn image_extent_for_size(size: vk::DeviceSize, texel_size: u32) -> vk::Extent3D {
    let texels = (size / vk::DeviceSize::from(texel_size)) as u32;

    vk::Extent3D {
        width: texels.clamp(1, MAX_IMAGE_DIMENSION_2D),
        height: texels.div_ceil(MAX_IMAGE_DIMENSION_2D).max(1),
        depth: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_are_unique() {
        let mut names: Vec<_> = RESOURCES.iter().map(ResourceDescription::name).collect();
        names.sort();
        names.dedup();

        assert_eq!(names.len(), RESOURCES.len());
        assert!(names.contains(&"image_128x128_r8g8b8a8_unorm".to_owned()));
        assert!(names.contains(&"image_3d_64x64x8_r32_sfloat".to_owned()));
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(ResourceDescription::buffer(0x4000).byte_size(), 0x4000);
        assert_eq!(RESOURCES[2].byte_size(), 128 * 128 * 4);
        assert_eq!(RESOURCES[3].byte_size(), 128 * 128 * 16);
        assert_eq!(RESOURCES[4].byte_size(), 64 * 64 * 8 * 4);
        assert_eq!(
            ResourceDescription::indirect(ResourceKind::IndirectBufferDraw).byte_size(),
            16,
        );
        assert_eq!(
            ResourceDescription::indirect(ResourceKind::IndirectBufferDrawIndexed).byte_size(),
            20,
        );
        assert_eq!(
            ResourceDescription::indirect(ResourceKind::IndirectBufferDispatch).byte_size(),
            12,
        );
    }

    #[test]
    fn clear_color_packing() {
        let half = 0.5f32.to_bits();
        let one = 1.0f32.to_bits();

        assert_eq!(
            clear_color_texel(vk::Format::R8G8B8A8_UNORM, [0, half, one, one]),
            Some(vec![0, 128, 255, 255]),
        );
        assert_eq!(
            clear_color_texel(vk::Format::R32_SFLOAT, [half, 0, 0, 0]),
            Some(half.to_ne_bytes().to_vec()),
        );
        assert_eq!(clear_color_texel(vk::Format::D32_SFLOAT, [0; 4]), None);
    }

    #[test]
    fn intermediate_image_extent() {
        let extent = image_extent_for_size(0x40000, 4);
        assert_eq!((extent.width, extent.height), (0x1000, 0x10));

        let extent = image_extent_for_size(4, 4);
        assert_eq!((extent.width, extent.height), (1, 1));
    }
}
