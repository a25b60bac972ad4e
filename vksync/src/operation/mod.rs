//! The catalog of operations that write, read or copy a resource.
//!
//! Every catalog entry is a variant of [`OperationName`]. [`OperationName::support`] looks an
//! entry up for a resource description and returns an [`OperationSupport`], which knows the
//! queue capabilities and usage flags the operation needs and can build the operation against
//! live resources. A built [`Operation`] records its commands into a command buffer, reports
//! the state it needs the resource in before it runs and the state it leaves the resource in
//! afterwards, and exposes the data payload that's compared after execution.
//!
//! Write operations own a payload that they put into their resource. Read operations copy their
//! resource out to host-visible memory, and their payload is what they observed. Copy
//! operations move data from one resource into another and carry no payload.

pub use self::{
    indirect::{IndexInputRead, IndirectRead, IndirectWrite, VertexInputRead},
    shader::{ShaderBufferOperation, ShaderImageOperation},
    transfer::{BufferImageCopy, ClearColorImage, CopyBuffer, CopyImage, FillUpdateBuffer},
};
use crate::{
    provider::{BufferMemoryBarrier2, DependencyInfo, Features, ImageMemoryBarrier2, Provider},
    resource::{
        texel_block_size, BufferResource, ImageResource, Resource, ResourceDescription,
        ResourceKind, ResourceUsage, MAX_UBO_RANGE, MAX_UPDATE_BUFFER_SIZE,
    },
    sync::{self, SyncInfo, SynchronizationType},
    Result, SkipReason, TestError,
};
use ash::vk;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{fmt, sync::Arc};

mod indirect;
mod shader;
mod transfer;

type Stage = vk::PipelineStageFlags2;
type Access = vk::AccessFlags2;
type Layout = vk::ImageLayout;

/// The shader stage a shader operation runs its program in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
    /// A compute shader launched with `vkCmdDispatchIndirect`.
    ComputeIndirect,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 7] = [
        ShaderStage::Vertex,
        ShaderStage::TessellationControl,
        ShaderStage::TessellationEvaluation,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
        ShaderStage::Compute,
        ShaderStage::ComputeIndirect,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::TessellationControl => "tess_control",
            ShaderStage::TessellationEvaluation => "tess_eval",
            ShaderStage::Geometry => "geometry",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
            ShaderStage::ComputeIndirect => "compute_indirect",
        }
    }

    #[inline]
    pub const fn is_compute(self) -> bool {
        matches!(self, ShaderStage::Compute | ShaderStage::ComputeIndirect)
    }

    pub const fn shader_stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute | ShaderStage::ComputeIndirect => vk::ShaderStageFlags::COMPUTE,
        }
    }

    pub const fn pipeline_stage(self) -> vk::PipelineStageFlags2 {
        match self {
            ShaderStage::Vertex => Stage::VERTEX_SHADER,
            ShaderStage::TessellationControl => Stage::TESSELLATION_CONTROL_SHADER,
            ShaderStage::TessellationEvaluation => Stage::TESSELLATION_EVALUATION_SHADER,
            ShaderStage::Geometry => Stage::GEOMETRY_SHADER,
            ShaderStage::Fragment => Stage::FRAGMENT_SHADER,
            ShaderStage::Compute | ShaderStage::ComputeIndirect => Stage::COMPUTE_SHADER,
        }
    }

    #[inline]
    pub const fn queue_flags(self) -> vk::QueueFlags {
        if self.is_compute() {
            vk::QueueFlags::COMPUTE
        } else {
            vk::QueueFlags::GRAPHICS
        }
    }

    /// Checks that programs in this stage can be created and can store to memory.
    pub fn check_features(self, features: &Features) -> Result<(), SkipReason> {
        match self {
            ShaderStage::TessellationControl | ShaderStage::TessellationEvaluation
                if !features.tessellation_shader =>
            {
                return Err(SkipReason::new("the `tessellation_shader` feature is not supported"));
            }
            ShaderStage::Geometry if !features.geometry_shader => {
                return Err(SkipReason::new("the `geometry_shader` feature is not supported"));
            }
            _ => {}
        }

        match self {
            ShaderStage::Vertex
            | ShaderStage::TessellationControl
            | ShaderStage::TessellationEvaluation
            | ShaderStage::Geometry
                if !features.vertex_pipeline_stores_and_atomics =>
            {
                Err(SkipReason::new(
                    "the `vertex_pipeline_stores_and_atomics` feature is not supported",
                ))
            }
            ShaderStage::Fragment if !features.fragment_stores_and_atomics => Err(
                SkipReason::new("the `fragment_stores_and_atomics` feature is not supported"),
            ),
            _ => Ok(()),
        }
    }
}

/// An entry of the operation catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationName {
    WriteFillBuffer,
    WriteUpdateBuffer,
    WriteCopyBuffer,
    WriteCopyBufferToImage,
    WriteCopyImageToBuffer,
    WriteCopyImage,
    WriteBlitImage,
    WriteClearColorImage,
    WriteSsbo(ShaderStage),
    WriteImage(ShaderStage),
    WriteIndirectBufferDraw,
    WriteIndirectBufferDrawIndexed,
    WriteIndirectBufferDispatch,
    WriteUpdateIndexBuffer,

    ReadCopyBuffer,
    ReadCopyBufferToImage,
    ReadCopyImageToBuffer,
    ReadCopyImage,
    ReadBlitImage,
    ReadSsbo(ShaderStage),
    ReadUbo(ShaderStage),
    ReadImage(ShaderStage),
    ReadIndirectBufferDraw,
    ReadIndirectBufferDrawIndexed,
    ReadIndirectBufferDispatch,
    ReadVertexInput,
    ReadIndexInput,

    CopyBuffer,
    CopyImage,
    CopyBlitImage,
    CopySsbo(ShaderStage),
    CopyStorageImage(ShaderStage),
}

/// Whether an operation writes, reads or copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Write,
    Read,
    Copy,
}

/// Copy operations used to move data between queues in chains and fan-outs.
pub const COPY_OPERATIONS: &[OperationName] = &[
    OperationName::CopyBuffer,
    OperationName::CopyImage,
    OperationName::CopyBlitImage,
    OperationName::CopySsbo(ShaderStage::Vertex),
    OperationName::CopySsbo(ShaderStage::TessellationControl),
    OperationName::CopySsbo(ShaderStage::TessellationEvaluation),
    OperationName::CopySsbo(ShaderStage::Geometry),
    OperationName::CopySsbo(ShaderStage::Fragment),
    OperationName::CopySsbo(ShaderStage::Compute),
    OperationName::CopySsbo(ShaderStage::ComputeIndirect),
    OperationName::CopyStorageImage(ShaderStage::Vertex),
    OperationName::CopyStorageImage(ShaderStage::TessellationControl),
    OperationName::CopyStorageImage(ShaderStage::TessellationEvaluation),
    OperationName::CopyStorageImage(ShaderStage::Geometry),
    OperationName::CopyStorageImage(ShaderStage::Fragment),
    OperationName::CopyStorageImage(ShaderStage::Compute),
    OperationName::CopyStorageImage(ShaderStage::ComputeIndirect),
];

impl OperationName {
    /// Returns every entry of the catalog.
    pub fn all() -> Vec<OperationName> {
        use OperationName::*;

        let mut all = vec![
            WriteFillBuffer,
            WriteUpdateBuffer,
            WriteCopyBuffer,
            WriteCopyBufferToImage,
            WriteCopyImageToBuffer,
            WriteCopyImage,
            WriteBlitImage,
            WriteClearColorImage,
            WriteIndirectBufferDraw,
            WriteIndirectBufferDrawIndexed,
            WriteIndirectBufferDispatch,
            WriteUpdateIndexBuffer,
            ReadCopyBuffer,
            ReadCopyBufferToImage,
            ReadCopyImageToBuffer,
            ReadCopyImage,
            ReadBlitImage,
            ReadIndirectBufferDraw,
            ReadIndirectBufferDrawIndexed,
            ReadIndirectBufferDispatch,
            ReadVertexInput,
            ReadIndexInput,
        ];

        for stage in ShaderStage::ALL {
            all.extend([
                WriteSsbo(stage),
                WriteImage(stage),
                ReadSsbo(stage),
                ReadUbo(stage),
                ReadImage(stage),
            ]);
        }

        all.extend_from_slice(COPY_OPERATIONS);

        all
    }

    pub fn name(self) -> String {
        use OperationName::*;

        match self {
            WriteFillBuffer => "write_fill_buffer".to_owned(),
            WriteUpdateBuffer => "write_update_buffer".to_owned(),
            WriteCopyBuffer => "write_copy_buffer".to_owned(),
            WriteCopyBufferToImage => "write_copy_buffer_to_image".to_owned(),
            WriteCopyImageToBuffer => "write_copy_image_to_buffer".to_owned(),
            WriteCopyImage => "write_copy_image".to_owned(),
            WriteBlitImage => "write_blit_image".to_owned(),
            WriteClearColorImage => "write_clear_color_image".to_owned(),
            WriteSsbo(stage) => format!("write_ssbo_{}", stage.name()),
            WriteImage(stage) => format!("write_image_{}", stage.name()),
            WriteIndirectBufferDraw => "write_indirect_buffer_draw".to_owned(),
            WriteIndirectBufferDrawIndexed => "write_indirect_buffer_draw_indexed".to_owned(),
            WriteIndirectBufferDispatch => "write_indirect_buffer_dispatch".to_owned(),
            WriteUpdateIndexBuffer => "write_update_index_buffer".to_owned(),
            ReadCopyBuffer => "read_copy_buffer".to_owned(),
            ReadCopyBufferToImage => "read_copy_buffer_to_image".to_owned(),
            ReadCopyImageToBuffer => "read_copy_image_to_buffer".to_owned(),
            ReadCopyImage => "read_copy_image".to_owned(),
            ReadBlitImage => "read_blit_image".to_owned(),
            ReadSsbo(stage) => format!("read_ssbo_{}", stage.name()),
            ReadUbo(stage) => format!("read_ubo_{}", stage.name()),
            ReadImage(stage) => format!("read_image_{}", stage.name()),
            ReadIndirectBufferDraw => "read_indirect_buffer_draw".to_owned(),
            ReadIndirectBufferDrawIndexed => "read_indirect_buffer_draw_indexed".to_owned(),
            ReadIndirectBufferDispatch => "read_indirect_buffer_dispatch".to_owned(),
            ReadVertexInput => "read_vertex_input".to_owned(),
            ReadIndexInput => "read_index_input".to_owned(),
            CopyBuffer => "copy_buffer".to_owned(),
            CopyImage => "copy_image".to_owned(),
            CopyBlitImage => "copy_blit_image".to_owned(),
            CopySsbo(stage) => format!("copy_ssbo_{}", stage.name()),
            CopyStorageImage(stage) => format!("copy_storage_image_{}", stage.name()),
        }
    }

    pub const fn access_mode(self) -> AccessMode {
        use OperationName::*;

        match self {
            WriteFillBuffer
            | WriteUpdateBuffer
            | WriteCopyBuffer
            | WriteCopyBufferToImage
            | WriteCopyImageToBuffer
            | WriteCopyImage
            | WriteBlitImage
            | WriteClearColorImage
            | WriteSsbo(_)
            | WriteImage(_)
            | WriteIndirectBufferDraw
            | WriteIndirectBufferDrawIndexed
            | WriteIndirectBufferDispatch
            | WriteUpdateIndexBuffer => AccessMode::Write,
            ReadCopyBuffer
            | ReadCopyBufferToImage
            | ReadCopyImageToBuffer
            | ReadCopyImage
            | ReadBlitImage
            | ReadSsbo(_)
            | ReadUbo(_)
            | ReadImage(_)
            | ReadIndirectBufferDraw
            | ReadIndirectBufferDrawIndexed
            | ReadIndirectBufferDispatch
            | ReadVertexInput
            | ReadIndexInput => AccessMode::Read,
            CopyBuffer | CopyImage | CopyBlitImage | CopySsbo(_) | CopyStorageImage(_) => {
                AccessMode::Copy
            }
        }
    }

    /// Returns the shader stage of a shader operation.
    pub const fn shader_stage(self) -> Option<ShaderStage> {
        use OperationName::*;

        match self {
            WriteSsbo(stage) | WriteImage(stage) | ReadSsbo(stage) | ReadUbo(stage)
            | ReadImage(stage) | CopySsbo(stage) | CopyStorageImage(stage) => Some(stage),
            ReadIndirectBufferDraw
            | ReadIndirectBufferDrawIndexed
            | ReadVertexInput
            | ReadIndexInput => Some(ShaderStage::Vertex),
            ReadIndirectBufferDispatch => Some(ShaderStage::Compute),
            _ => None,
        }
    }

    /// Returns whether the operation can be used with resources of the given description.
    pub fn is_resource_supported(self, desc: &ResourceDescription) -> bool {
        use OperationName::*;

        let color_image = desc.kind == ResourceKind::Image
            && desc.image_aspect == vk::ImageAspectFlags::COLOR
            && desc.image_samples == vk::SampleCountFlags::TYPE_1
            && texel_block_size(desc.image_format).is_some();

        match self {
            WriteFillBuffer
            | WriteCopyBuffer
            | WriteCopyImageToBuffer
            | WriteSsbo(_)
            | ReadCopyBuffer
            | ReadCopyBufferToImage
            | ReadSsbo(_)
            | ReadVertexInput
            | CopyBuffer
            | CopySsbo(_) => desc.kind == ResourceKind::Buffer,
            WriteUpdateBuffer => {
                desc.kind == ResourceKind::Buffer && desc.size[0] <= MAX_UPDATE_BUFFER_SIZE
            }
            ReadUbo(_) => desc.kind == ResourceKind::Buffer && desc.size[0] <= MAX_UBO_RANGE,
            WriteIndirectBufferDraw | ReadIndirectBufferDraw => {
                desc.kind == ResourceKind::IndirectBufferDraw
            }
            WriteIndirectBufferDrawIndexed | ReadIndirectBufferDrawIndexed => {
                desc.kind == ResourceKind::IndirectBufferDrawIndexed
            }
            WriteIndirectBufferDispatch | ReadIndirectBufferDispatch => {
                desc.kind == ResourceKind::IndirectBufferDispatch
            }
            WriteUpdateIndexBuffer | ReadIndexInput => desc.kind == ResourceKind::IndexBuffer,
            WriteCopyBufferToImage
            | WriteCopyImage
            | WriteBlitImage
            | WriteClearColorImage
            | WriteImage(_)
            | ReadCopyImageToBuffer
            | ReadCopyImage
            | ReadBlitImage
            | ReadImage(_)
            | CopyImage
            | CopyBlitImage
            | CopyStorageImage(_) => color_image,
        }
    }

    /// Looks the operation up for a resource description.
    pub fn support(self, desc: &ResourceDescription) -> Result<OperationSupport, SkipReason> {
        if !self.is_resource_supported(desc) {
            return Err(SkipReason::new(format!(
                "`{}` doesn't support resource `{}`",
                self.name(),
                desc.name(),
            )));
        }

        Ok(OperationSupport {
            name: self,
            resource: *desc,
        })
    }

    /// Returns the usage flags the operation needs on the resource it reads from.
    pub fn in_usage(self) -> ResourceUsage {
        use OperationName::*;
        type B = vk::BufferUsageFlags;
        type I = vk::ImageUsageFlags;

        match self {
            ReadCopyBuffer | ReadCopyBufferToImage | CopyBuffer => {
                ResourceUsage::buffer(B::TRANSFER_SRC)
            }
            ReadCopyImageToBuffer | ReadCopyImage | ReadBlitImage | CopyImage | CopyBlitImage => {
                ResourceUsage::image(I::TRANSFER_SRC)
            }
            ReadSsbo(_) | CopySsbo(_) => ResourceUsage::buffer(B::STORAGE_BUFFER),
            ReadUbo(_) => ResourceUsage::buffer(B::UNIFORM_BUFFER),
            ReadImage(_) | CopyStorageImage(_) => ResourceUsage::image(I::STORAGE),
            ReadIndirectBufferDraw | ReadIndirectBufferDrawIndexed | ReadIndirectBufferDispatch => {
                ResourceUsage::buffer(B::INDIRECT_BUFFER)
            }
            ReadVertexInput => ResourceUsage::buffer(B::VERTEX_BUFFER),
            ReadIndexInput => ResourceUsage::buffer(B::INDEX_BUFFER),
            _ => ResourceUsage::empty(),
        }
    }

    /// Returns the usage flags the operation needs on the resource it writes to.
    pub fn out_usage(self) -> ResourceUsage {
        use OperationName::*;
        type B = vk::BufferUsageFlags;
        type I = vk::ImageUsageFlags;

        match self {
            WriteFillBuffer
            | WriteUpdateBuffer
            | WriteCopyBuffer
            | WriteCopyImageToBuffer
            | WriteIndirectBufferDraw
            | WriteIndirectBufferDrawIndexed
            | WriteIndirectBufferDispatch
            | WriteUpdateIndexBuffer
            | CopyBuffer => ResourceUsage::buffer(B::TRANSFER_DST),
            WriteCopyBufferToImage
            | WriteCopyImage
            | WriteBlitImage
            | WriteClearColorImage
            | CopyImage
            | CopyBlitImage => ResourceUsage::image(I::TRANSFER_DST),
            WriteSsbo(_) | CopySsbo(_) => ResourceUsage::buffer(B::STORAGE_BUFFER),
            WriteImage(_) | CopyStorageImage(_) => ResourceUsage::image(I::STORAGE),
            _ => ResourceUsage::empty(),
        }
    }

    /// Returns the queue capabilities the operation needs.
    pub fn queue_flags(self) -> vk::QueueFlags {
        use OperationName::*;

        match self {
            WriteBlitImage | ReadBlitImage | CopyBlitImage | WriteClearColorImage => {
                vk::QueueFlags::GRAPHICS
            }
            _ => match self.shader_stage() {
                Some(stage) => stage.queue_flags(),
                None => vk::QueueFlags::TRANSFER,
            },
        }
    }

    /// Returns the state the operation needs its input resource in.
    pub fn in_sync_info(self) -> SyncInfo {
        use OperationName::*;

        match self {
            ReadCopyBuffer | ReadCopyBufferToImage | CopyBuffer => {
                SyncInfo::new(Stage::COPY, Access::TRANSFER_READ, Layout::UNDEFINED)
            }
            ReadCopyImageToBuffer | ReadCopyImage | CopyImage => SyncInfo::new(
                Stage::COPY,
                Access::TRANSFER_READ,
                Layout::TRANSFER_SRC_OPTIMAL,
            ),
            ReadBlitImage | CopyBlitImage => SyncInfo::new(
                Stage::BLIT,
                Access::TRANSFER_READ,
                Layout::TRANSFER_SRC_OPTIMAL,
            ),
            ReadSsbo(stage) | CopySsbo(stage) => SyncInfo::new(
                stage.pipeline_stage(),
                Access::SHADER_STORAGE_READ,
                Layout::UNDEFINED,
            ),
            ReadUbo(stage) => SyncInfo::new(
                stage.pipeline_stage(),
                Access::UNIFORM_READ,
                Layout::UNDEFINED,
            ),
            ReadImage(stage) | CopyStorageImage(stage) => SyncInfo::new(
                stage.pipeline_stage(),
                Access::SHADER_STORAGE_READ,
                Layout::GENERAL,
            ),
            ReadIndirectBufferDraw | ReadIndirectBufferDrawIndexed | ReadIndirectBufferDispatch => {
                SyncInfo::new(
                    Stage::DRAW_INDIRECT,
                    Access::INDIRECT_COMMAND_READ,
                    Layout::UNDEFINED,
                )
            }
            ReadVertexInput => SyncInfo::new(
                Stage::VERTEX_ATTRIBUTE_INPUT,
                Access::VERTEX_ATTRIBUTE_READ,
                Layout::UNDEFINED,
            ),
            ReadIndexInput => {
                SyncInfo::new(Stage::INDEX_INPUT, Access::INDEX_READ, Layout::UNDEFINED)
            }
            _ => SyncInfo::EMPTY,
        }
    }

    /// Returns the state the operation leaves its output resource in.
    pub fn out_sync_info(self) -> SyncInfo {
        use OperationName::*;

        match self {
            WriteFillBuffer
            | WriteUpdateBuffer
            | WriteIndirectBufferDraw
            | WriteIndirectBufferDrawIndexed
            | WriteIndirectBufferDispatch
            | WriteUpdateIndexBuffer => {
                SyncInfo::new(Stage::CLEAR, Access::TRANSFER_WRITE, Layout::UNDEFINED)
            }
            WriteCopyBuffer | WriteCopyImageToBuffer | CopyBuffer => {
                SyncInfo::new(Stage::COPY, Access::TRANSFER_WRITE, Layout::UNDEFINED)
            }
            WriteCopyBufferToImage | WriteCopyImage | CopyImage => SyncInfo::new(
                Stage::COPY,
                Access::TRANSFER_WRITE,
                Layout::TRANSFER_DST_OPTIMAL,
            ),
            WriteBlitImage | CopyBlitImage => SyncInfo::new(
                Stage::BLIT,
                Access::TRANSFER_WRITE,
                Layout::TRANSFER_DST_OPTIMAL,
            ),
            WriteClearColorImage => SyncInfo::new(
                Stage::CLEAR,
                Access::TRANSFER_WRITE,
                Layout::TRANSFER_DST_OPTIMAL,
            ),
            WriteSsbo(stage) | CopySsbo(stage) => SyncInfo::new(
                stage.pipeline_stage(),
                Access::SHADER_STORAGE_WRITE,
                Layout::UNDEFINED,
            ),
            WriteImage(stage) | CopyStorageImage(stage) => SyncInfo::new(
                stage.pipeline_stage(),
                Access::SHADER_STORAGE_WRITE,
                Layout::GENERAL,
            ),
            _ => SyncInfo::EMPTY,
        }
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// An operation looked up for a resource description, ready to be built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationSupport {
    name: OperationName,
    resource: ResourceDescription,
}

impl OperationSupport {
    #[inline]
    pub fn name(&self) -> OperationName {
        self.name
    }

    #[inline]
    pub fn resource(&self) -> &ResourceDescription {
        &self.resource
    }

    #[inline]
    pub fn access_mode(&self) -> AccessMode {
        self.name.access_mode()
    }

    #[inline]
    pub fn queue_flags(&self) -> vk::QueueFlags {
        self.name.queue_flags()
    }

    #[inline]
    pub fn in_usage(&self) -> ResourceUsage {
        self.name.in_usage()
    }

    #[inline]
    pub fn out_usage(&self) -> ResourceUsage {
        self.name.out_usage()
    }

    /// Checks the device features the operation needs. This must be called before any resource
    /// is allocated for the operation.
    pub fn check_support(&self, provider: &dyn Provider) -> Result<(), SkipReason> {
        match self.name.shader_stage() {
            Some(stage) => stage.check_features(provider.enabled_features()),
            None => Ok(()),
        }
    }

    /// Builds a write or read operation against `resource`.
    pub fn build(&self, context: &OperationContext, resource: &Resource) -> Result<Operation> {
        use OperationName::*;

        self.check_resource(resource)?;
        self.check_support(&**context.provider())?;

        let operation = match self.name {
            WriteFillBuffer => {
                Operation::FillUpdateBuffer(FillUpdateBuffer::fill(context, resource)?)
            }
            WriteUpdateBuffer => {
                Operation::FillUpdateBuffer(FillUpdateBuffer::update(context, resource)?)
            }
            WriteUpdateIndexBuffer => {
                Operation::FillUpdateBuffer(FillUpdateBuffer::update_index(context, resource)?)
            }
            WriteCopyBuffer => Operation::CopyBuffer(transfer::CopyBuffer::write(context, resource)?),
            ReadCopyBuffer => Operation::CopyBuffer(transfer::CopyBuffer::read(context, resource)?),
            WriteCopyImage => Operation::CopyImage(transfer::CopyImage::write(context, resource, false)?),
            WriteBlitImage => Operation::CopyImage(transfer::CopyImage::write(context, resource, true)?),
            ReadCopyImage => Operation::CopyImage(transfer::CopyImage::read(context, resource, false)?),
            ReadBlitImage => Operation::CopyImage(transfer::CopyImage::read(context, resource, true)?),
            WriteCopyBufferToImage => {
                Operation::BufferImageCopy(BufferImageCopy::write_image(context, resource)?)
            }
            WriteCopyImageToBuffer => {
                Operation::BufferImageCopy(BufferImageCopy::write_buffer(context, resource)?)
            }
            ReadCopyImageToBuffer => {
                Operation::BufferImageCopy(BufferImageCopy::read_image(context, resource)?)
            }
            ReadCopyBufferToImage => {
                Operation::BufferImageCopy(BufferImageCopy::read_buffer(context, resource)?)
            }
            WriteClearColorImage => {
                Operation::ClearColorImage(ClearColorImage::new(context, resource)?)
            }
            WriteSsbo(stage) => Operation::ShaderBuffer(ShaderBufferOperation::write(
                context, resource, stage,
            )?),
            ReadSsbo(stage) => Operation::ShaderBuffer(ShaderBufferOperation::read(
                context, resource, stage, false,
            )?),
            ReadUbo(stage) => Operation::ShaderBuffer(ShaderBufferOperation::read(
                context, resource, stage, true,
            )?),
            WriteImage(stage) => {
                Operation::ShaderImage(ShaderImageOperation::write(context, resource, stage)?)
            }
            ReadImage(stage) => {
                Operation::ShaderImage(ShaderImageOperation::read(context, resource, stage)?)
            }
            WriteIndirectBufferDraw
            | WriteIndirectBufferDrawIndexed
            | WriteIndirectBufferDispatch => {
                Operation::IndirectWrite(IndirectWrite::new(context, resource)?)
            }
            ReadIndirectBufferDraw | ReadIndirectBufferDrawIndexed | ReadIndirectBufferDispatch => {
                Operation::IndirectRead(IndirectRead::new(context, resource)?)
            }
            ReadVertexInput => Operation::VertexInput(VertexInputRead::new(context, resource)?),
            ReadIndexInput => Operation::IndexInput(IndexInputRead::new(context, resource)?),
            CopyBuffer | CopyImage | CopyBlitImage | CopySsbo(_) | CopyStorageImage(_) => {
                return Err(TestError::harness(format!(
                    "copy operation `{}` was built against a single resource",
                    self.name,
                )));
            }
        };

        Ok(operation)
    }

    /// Builds a copy operation from `in_resource` into `out_resource`.
    pub fn build_copy(
        &self,
        context: &OperationContext,
        in_resource: &Resource,
        out_resource: &Resource,
    ) -> Result<Operation> {
        use OperationName::*;

        self.check_resource(in_resource)?;
        self.check_resource(out_resource)?;
        self.check_support(&**context.provider())?;

        let operation = match self.name {
            CopyBuffer => {
                Operation::CopyBuffer(transfer::CopyBuffer::copy(context, in_resource, out_resource)?)
            }
            CopyImage => Operation::CopyImage(transfer::CopyImage::copy(
                context,
                in_resource,
                out_resource,
                false,
            )?),
            CopyBlitImage => {
                Operation::CopyImage(transfer::CopyImage::copy(context, in_resource, out_resource, true)?)
            }
            CopySsbo(stage) => Operation::ShaderBuffer(ShaderBufferOperation::copy(
                context,
                in_resource,
                out_resource,
                stage,
            )?),
            CopyStorageImage(stage) => Operation::ShaderImage(ShaderImageOperation::copy(
                context,
                in_resource,
                out_resource,
                stage,
            )?),
            _ => {
                return Err(TestError::harness(format!(
                    "`{}` was built as a copy operation",
                    self.name,
                )));
            }
        };

        Ok(operation)
    }

    fn check_resource(&self, resource: &Resource) -> Result {
        if resource.description() != &self.resource {
            return Err(TestError::harness(format!(
                "`{}` was looked up for `{}` but built against `{}`",
                self.name,
                self.resource.name(),
                resource.description().name(),
            )));
        }

        let required = match self.access_mode() {
            AccessMode::Write => self.out_usage(),
            AccessMode::Read => self.in_usage(),
            AccessMode::Copy => ResourceUsage::empty(),
        };

        if !resource.usage().contains(required) {
            return Err(TestError::harness(format!(
                "`{}` needs usage {:?} but the resource was created with {:?}",
                self.name,
                required,
                resource.usage(),
            )));
        }

        Ok(())
    }
}

/// State shared by the operations of one test iteration.
pub struct OperationContext {
    recorder: Recorder,
    rng: Mutex<StdRng>,
}

impl OperationContext {
    pub fn new(provider: &Arc<dyn Provider>, sync_type: SynchronizationType, seed: u64) -> Self {
        OperationContext {
            recorder: Recorder {
                provider: provider.clone(),
                sync_type,
            },
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    #[inline]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.recorder.provider
    }

    #[inline]
    pub fn sync_type(&self) -> SynchronizationType {
        self.recorder.sync_type
    }

    /// Returns `size` bytes of random data valid for resources of the given description.
    pub fn random_data(&self, desc: &ResourceDescription, size: usize) -> Vec<u8> {
        randomize_data(&mut *self.rng.lock(), desc, size)
    }

    pub(crate) fn random_u32(&self) -> u32 {
        self.rng.lock().gen()
    }

    fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("sync_type", &self.recorder.sync_type)
            .finish_non_exhaustive()
    }
}

/// What an operation needs to record barriers after it was built.
#[derive(Clone)]
struct Recorder {
    provider: Arc<dyn Provider>,
    sync_type: SynchronizationType,
}

impl Recorder {
    fn pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &DependencyInfo<'_>,
    ) {
        sync::cmd_pipeline_barrier(
            &*self.provider,
            self.sync_type,
            command_buffer,
            dependency_info,
        );
    }

    fn buffer_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: &BufferResource,
        src: &SyncInfo,
        dst: &SyncInfo,
    ) {
        let barriers: [BufferMemoryBarrier2; 1] = [sync::buffer_barrier(src, dst, buffer)];

        self.pipeline_barrier(
            command_buffer,
            &DependencyInfo {
                buffer_memory_barriers: &barriers,
                ..Default::default()
            },
        );
    }

    fn image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image: &ImageResource,
        src: &SyncInfo,
        dst: &SyncInfo,
    ) {
        let barriers: [ImageMemoryBarrier2; 1] = [sync::image_barrier(src, dst, image)];

        self.pipeline_barrier(
            command_buffer,
            &DependencyInfo {
                image_memory_barriers: &barriers,
                ..Default::default()
            },
        );
    }

    /// Makes device writes to a host buffer visible to host reads.
    fn host_read_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: &BufferResource,
        src: &SyncInfo,
    ) {
        self.buffer_barrier(command_buffer, buffer, src, &HOST_READ);
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("sync_type", &self.sync_type)
            .finish_non_exhaustive()
    }
}

const HOST_READ: SyncInfo = SyncInfo::new(Stage::HOST, Access::HOST_READ, Layout::UNDEFINED);

/// Returns `size` bytes of random data for a resource of the given description.
///
/// Floating-point images get values in `[0, 1)` so that every byte pattern survives a
/// format-aware copy unchanged.
pub fn randomize_data(rng: &mut impl Rng, desc: &ResourceDescription, size: usize) -> Vec<u8> {
    let float_image = desc.kind == ResourceKind::Image
        && matches!(
            desc.image_format,
            vk::Format::R32_SFLOAT | vk::Format::R32G32_SFLOAT | vk::Format::R32G32B32A32_SFLOAT
        );

    if float_image {
        let mut data = Vec::with_capacity(size);

        while data.len() < size {
            data.extend_from_slice(&rng.gen::<f32>().to_ne_bytes());
        }

        data.truncate(size);

        data
    } else {
        let mut data = vec![0; size];
        rng.fill(data.as_mut_slice());

        data
    }
}

/// A write, read or copy operation built against live resources.
///
/// Operations keep copies of the handles of their resources, so the resources must outlive
/// them.
#[derive(Debug)]
pub enum Operation {
    FillUpdateBuffer(FillUpdateBuffer),
    CopyBuffer(CopyBuffer),
    CopyImage(CopyImage),
    BufferImageCopy(BufferImageCopy),
    ClearColorImage(ClearColorImage),
    ShaderBuffer(ShaderBufferOperation),
    ShaderImage(ShaderImageOperation),
    IndirectWrite(IndirectWrite),
    IndirectRead(IndirectRead),
    VertexInput(VertexInputRead),
    IndexInput(IndexInputRead),
}

macro_rules! dispatch {
    ($self:ident, $op:ident => $expr:expr) => {
        match $self {
            Operation::FillUpdateBuffer($op) => $expr,
            Operation::CopyBuffer($op) => $expr,
            Operation::CopyImage($op) => $expr,
            Operation::BufferImageCopy($op) => $expr,
            Operation::ClearColorImage($op) => $expr,
            Operation::ShaderBuffer($op) => $expr,
            Operation::ShaderImage($op) => $expr,
            Operation::IndirectWrite($op) => $expr,
            Operation::IndirectRead($op) => $expr,
            Operation::VertexInput($op) => $expr,
            Operation::IndexInput($op) => $expr,
        }
    };
}

impl Operation {
    #[inline]
    pub fn name(&self) -> OperationName {
        dispatch!(self, op => op.name)
    }

    /// Records the commands that perform the operation.
    pub fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        dispatch!(self, op => op.record_commands(command_buffer))
    }

    /// Returns the state the operation needs its input resource in.
    #[inline]
    pub fn in_sync_info(&self) -> SyncInfo {
        self.name().in_sync_info()
    }

    /// Returns the state the operation leaves its output resource in.
    #[inline]
    pub fn out_sync_info(&self) -> SyncInfo {
        self.name().out_sync_info()
    }

    /// Returns the payload of the operation.
    ///
    /// For write operations this is the data they write, for read operations the data they
    /// observed (only meaningful once the operation has executed). Copy operations return an
    /// empty payload.
    pub fn get_data(&self) -> Result<Vec<u8>> {
        dispatch!(self, op => op.get_data())
    }

    /// Replaces the payload of a write operation.
    ///
    /// Operations that stage their payload in host-visible memory pick up the new payload
    /// even after their commands were recorded, as long as the commands haven't executed.
    pub fn set_data(&self, data: &[u8]) -> Result {
        dispatch!(self, op => op.set_data(data))
    }
}

fn check_data_size(name: OperationName, expected: usize, actual: usize) -> Result {
    if expected != actual {
        return Err(TestError::harness(format!(
            "`{name}` holds {expected} bytes but was given {actual} bytes",
        )));
    }

    Ok(())
}

fn no_payload(name: OperationName) -> TestError {
    TestError::harness(format!("`{name}` doesn't accept a payload"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::RESOURCES;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = OperationName::all()
            .into_iter()
            .map(OperationName::name)
            .collect();
        let count = names.len();
        names.sort();
        names.dedup();

        assert_eq!(names.len(), count);
    }

    #[test]
    fn every_operation_supports_some_resource() {
        for name in OperationName::all() {
            assert!(
                RESOURCES.iter().any(|desc| name.is_resource_supported(desc)),
                "`{name}` supports none of the preset resources",
            );
        }
    }

    #[test]
    fn usage_flags_match_access_mode() {
        for name in OperationName::all() {
            let (needs_in, needs_out) = match name.access_mode() {
                AccessMode::Write => (false, true),
                AccessMode::Read => (true, false),
                AccessMode::Copy => (true, true),
            };

            assert_eq!(!name.in_usage().is_empty(), needs_in, "`{name}`");
            assert_eq!(!name.out_usage().is_empty(), needs_out, "`{name}`");
        }
    }

    #[test]
    fn image_operations_declare_layouts() {
        for name in OperationName::all() {
            let Some(desc) = RESOURCES
                .iter()
                .find(|desc| name.is_resource_supported(desc))
            else {
                continue;
            };

            if desc.kind != ResourceKind::Image {
                continue;
            }

            if name.access_mode() != AccessMode::Write {
                assert_ne!(name.in_sync_info().image_layout, Layout::UNDEFINED, "`{name}`");
            }

            if name.access_mode() != AccessMode::Read {
                assert_ne!(name.out_sync_info().image_layout, Layout::UNDEFINED, "`{name}`");
            }
        }
    }

    #[test]
    fn resource_support_follows_kinds() {
        let buffer = ResourceDescription::buffer(0x40000);
        let image = RESOURCES[2];

        assert!(OperationName::WriteCopyBuffer.is_resource_supported(&buffer));
        assert!(!OperationName::WriteCopyBuffer.is_resource_supported(&image));
        assert!(!OperationName::WriteUpdateBuffer.is_resource_supported(&buffer));
        assert!(!OperationName::ReadUbo(ShaderStage::Compute).is_resource_supported(&buffer));
        assert!(OperationName::CopyBlitImage.is_resource_supported(&image));
        assert_eq!(
            OperationName::ReadCopyImage.support(&buffer).map(|_| ()),
            Err(SkipReason::new(
                "`read_copy_image` doesn't support resource `buffer_262144`",
            )),
        );
    }

    #[test]
    fn stage_features() {
        let mut features = Features::all();
        assert_eq!(ShaderStage::Geometry.check_features(&features), Ok(()));

        features.geometry_shader = false;
        assert!(ShaderStage::Geometry.check_features(&features).is_err());
        assert_eq!(ShaderStage::Compute.check_features(&features), Ok(()));

        features.fragment_stores_and_atomics = false;
        assert!(ShaderStage::Fragment.check_features(&features).is_err());
    }

    #[test]
    fn float_image_data_is_normalized() {
        let mut rng = StdRng::seed_from_u64(7);
        let data = randomize_data(&mut rng, &RESOURCES[3], 64);

        for texel in data.chunks_exact(4).map(bytemuck::pod_read_unaligned::<f32>) {
            assert!((0.0..1.0).contains(&texel));
        }
    }
}
