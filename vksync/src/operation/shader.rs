//! Operations that run a program in one shader stage.
//!
//! The programs are named, and the provider is expected to know them:
//!
//! - `copy_buffer` copies binding 0 (a storage or uniform buffer) into binding 1.
//! - `copy_buffer_to_image` copies binding 0 into the storage image at binding 1, texels
//!   tightly packed.
//! - `copy_image_to_buffer` is the reverse.
//! - `copy_image` copies the storage image at binding 0 into the one at binding 1.
//!
//! Every program runs a single invocation group: one point for graphics stages, one workgroup
//! for compute.

use super::{
    check_data_size, no_payload, AccessMode, OperationContext, OperationName, Recorder,
    ShaderStage,
};
use crate::{
    provider::{PipelineBinding, PipelineCreateInfo, Provider},
    resource::{DispatchIndirectCommand, HostBuffer, ImageResource, Resource},
    sync::SyncInfo,
    ProviderResultExt, Result, TestError,
};
use ash::vk;
use std::{fmt, sync::Arc};

/// A compiled program bound to its resources, destroyed when dropped.
pub(super) struct Pipeline {
    provider: Arc<dyn Provider>,
    stage: ShaderStage,
    module: vk::ShaderModule,
    pipeline: vk::Pipeline,
    dispatch_buffer: Option<HostBuffer>,
}

impl Pipeline {
    pub(super) fn new(
        context: &OperationContext,
        program: &str,
        stage: ShaderStage,
        bindings: &[PipelineBinding],
    ) -> Result<Self> {
        let provider = context.provider();

        let dispatch_buffer = if stage == ShaderStage::ComputeIndirect {
            let command = DispatchIndirectCommand { x: 1, y: 1, z: 1 };

            Some(HostBuffer::with_data(
                provider,
                bytemuck::bytes_of(&command),
                vk::BufferUsageFlags::INDIRECT_BUFFER,
            )?)
        } else {
            None
        };

        let module = provider
            .create_shader_module(program, stage.shader_stage_flags())
            .checked("vkCreateShaderModule")?;

        let pipeline = match provider.create_pipeline(&PipelineCreateInfo {
            stage: stage.shader_stage_flags(),
            module,
            bindings,
        }) {
            Ok(pipeline) => pipeline,
            Err(result) => {
                provider.destroy_shader_module(module);

                return Err(TestError::Provider {
                    call: if stage.is_compute() {
                        "vkCreateComputePipelines"
                    } else {
                        "vkCreateGraphicsPipelines"
                    },
                    result,
                });
            }
        };

        Ok(Pipeline {
            provider: provider.clone(),
            stage,
            module,
            pipeline,
            dispatch_buffer,
        })
    }

    #[inline]
    pub(super) fn bind(&self, command_buffer: vk::CommandBuffer) {
        self.provider.cmd_bind_pipeline(command_buffer, self.pipeline);
    }

    /// Binds the pipeline and launches one invocation group.
    pub(super) fn record(&self, command_buffer: vk::CommandBuffer) {
        self.bind(command_buffer);

        match (self.stage, &self.dispatch_buffer) {
            (ShaderStage::Compute, _) => self.provider.cmd_dispatch(command_buffer, 1, 1, 1),
            (ShaderStage::ComputeIndirect, Some(dispatch_buffer)) => self
                .provider
                .cmd_dispatch_indirect(command_buffer, dispatch_buffer.handle(), 0),
            _ => self.provider.cmd_draw(command_buffer, 1, 1),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.provider.destroy_pipeline(self.pipeline);
        self.provider.destroy_shader_module(self.module);
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stage", &self.stage)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

fn shader_write(stage: ShaderStage) -> SyncInfo {
    SyncInfo::new(
        stage.pipeline_stage(),
        vk::AccessFlags2::SHADER_STORAGE_WRITE,
        vk::ImageLayout::UNDEFINED,
    )
}

/// Storage and uniform buffer accesses from a shader.
#[derive(Debug)]
pub struct ShaderBufferOperation {
    pub(super) name: OperationName,
    recorder: Recorder,
    stage: ShaderStage,
    pipeline: Pipeline,
    host: Option<HostBuffer>,
}

impl ShaderBufferOperation {
    pub(super) fn write(
        context: &OperationContext,
        resource: &Resource,
        stage: ShaderStage,
    ) -> Result<Self> {
        let buffer = resource.buffer()?;
        let data = context.random_data(resource.description(), buffer.size as usize);
        let host = HostBuffer::with_data(
            context.provider(),
            &data,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let pipeline = Pipeline::new(
            context,
            "copy_buffer",
            stage,
            &[
                PipelineBinding::StorageBuffer(host.handle()),
                PipelineBinding::StorageBuffer(buffer.handle),
            ],
        )?;

        Ok(ShaderBufferOperation {
            name: OperationName::WriteSsbo(stage),
            recorder: context.recorder(),
            stage,
            pipeline,
            host: Some(host),
        })
    }

    pub(super) fn read(
        context: &OperationContext,
        resource: &Resource,
        stage: ShaderStage,
        uniform: bool,
    ) -> Result<Self> {
        let buffer = resource.buffer()?;
        let host = HostBuffer::new(
            context.provider(),
            buffer.size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let (name, binding) = if uniform {
            (
                OperationName::ReadUbo(stage),
                PipelineBinding::UniformBuffer(buffer.handle),
            )
        } else {
            (
                OperationName::ReadSsbo(stage),
                PipelineBinding::StorageBuffer(buffer.handle),
            )
        };
        let pipeline = Pipeline::new(
            context,
            "copy_buffer",
            stage,
            &[binding, PipelineBinding::StorageBuffer(host.handle())],
        )?;

        Ok(ShaderBufferOperation {
            name,
            recorder: context.recorder(),
            stage,
            pipeline,
            host: Some(host),
        })
    }

    pub(super) fn copy(
        context: &OperationContext,
        in_resource: &Resource,
        out_resource: &Resource,
        stage: ShaderStage,
    ) -> Result<Self> {
        let src = in_resource.buffer()?;
        let dst = out_resource.buffer()?;

        if src.size != dst.size {
            return Err(TestError::harness(format!(
                "can't copy a buffer of {} bytes into a buffer of {} bytes",
                src.size, dst.size,
            )));
        }

        let pipeline = Pipeline::new(
            context,
            "copy_buffer",
            stage,
            &[
                PipelineBinding::StorageBuffer(src.handle),
                PipelineBinding::StorageBuffer(dst.handle),
            ],
        )?;

        Ok(ShaderBufferOperation {
            name: OperationName::CopySsbo(stage),
            recorder: context.recorder(),
            stage,
            pipeline,
            host: None,
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        self.pipeline.record(command_buffer);

        if let (AccessMode::Read, Some(host)) = (self.name.access_mode(), &self.host) {
            self.recorder.host_read_barrier(
                command_buffer,
                &host.region(),
                &shader_write(self.stage),
            );
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

/// Storage image accesses from a shader.
#[derive(Debug)]
pub struct ShaderImageOperation {
    pub(super) name: OperationName,
    recorder: Recorder,
    stage: ShaderStage,
    pipeline: Pipeline,
    // The image the operation writes to, which it moves out of `UNDEFINED` first.
    written_image: Option<ImageResource>,
    host: Option<HostBuffer>,
}

impl ShaderImageOperation {
    pub(super) fn write(
        context: &OperationContext,
        resource: &Resource,
        stage: ShaderStage,
    ) -> Result<Self> {
        let image = *resource.image()?;
        let desc = resource.description();
        let data = context.random_data(desc, desc.byte_size() as usize);
        let host = HostBuffer::with_data(
            context.provider(),
            &data,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let pipeline = Pipeline::new(
            context,
            "copy_buffer_to_image",
            stage,
            &[
                PipelineBinding::StorageBuffer(host.handle()),
                PipelineBinding::StorageImage(image.handle),
            ],
        )?;

        Ok(ShaderImageOperation {
            name: OperationName::WriteImage(stage),
            recorder: context.recorder(),
            stage,
            pipeline,
            written_image: Some(image),
            host: Some(host),
        })
    }

    pub(super) fn read(
        context: &OperationContext,
        resource: &Resource,
        stage: ShaderStage,
    ) -> Result<Self> {
        let image = resource.image()?;
        let host = HostBuffer::new(
            context.provider(),
            resource.description().byte_size(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let pipeline = Pipeline::new(
            context,
            "copy_image_to_buffer",
            stage,
            &[
                PipelineBinding::StorageImage(image.handle),
                PipelineBinding::StorageBuffer(host.handle()),
            ],
        )?;

        Ok(ShaderImageOperation {
            name: OperationName::ReadImage(stage),
            recorder: context.recorder(),
            stage,
            pipeline,
            written_image: None,
            host: Some(host),
        })
    }

    pub(super) fn copy(
        context: &OperationContext,
        in_resource: &Resource,
        out_resource: &Resource,
        stage: ShaderStage,
    ) -> Result<Self> {
        let src = in_resource.image()?;
        let dst = *out_resource.image()?;

        if src.extent != dst.extent || src.format != dst.format {
            return Err(TestError::harness(format!(
                "can't copy `{}` into `{}`",
                in_resource.description().name(),
                out_resource.description().name(),
            )));
        }

        let pipeline = Pipeline::new(
            context,
            "copy_image",
            stage,
            &[
                PipelineBinding::StorageImage(src.handle),
                PipelineBinding::StorageImage(dst.handle),
            ],
        )?;

        Ok(ShaderImageOperation {
            name: OperationName::CopyStorageImage(stage),
            recorder: context.recorder(),
            stage,
            pipeline,
            written_image: Some(dst),
            host: None,
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        if let Some(image) = &self.written_image {
            self.recorder.image_barrier(
                command_buffer,
                image,
                &SyncInfo::EMPTY,
                &self.name.out_sync_info(),
            );
        }

        self.pipeline.record(command_buffer);

        if let (AccessMode::Read, Some(host)) = (self.name.access_mode(), &self.host) {
            self.recorder.host_read_barrier(
                command_buffer,
                &host.region(),
                &shader_write(self.stage),
            );
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
