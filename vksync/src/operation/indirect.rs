//! Operations on indirect command buffers and vertex input.
//!
//! An indirect command can't be compared byte for byte once it has been consumed, so the read
//! side executes it against an atomic counter instead. Every invocation the command launches
//! adds one to the counter, and the counter must reach at least the number of invocations the
//! written command describes.
//!
//! The programs used here:
//!
//! - `atomic_counter` adds one per invocation to the first `u32` of binding 0.
//! - `vertex_fetch` stores every fetched vertex (one `uvec4` each) from the vertex buffer at
//!   binding 0 into binding 1.
//! - `index_fetch` stores every fetched index (one `u32` each) from the index buffer at
//!   binding 0 into binding 1.

use super::{
    no_payload, shader::Pipeline, OperationContext, OperationName, Recorder, ShaderStage,
};
use crate::{
    provider::PipelineBinding,
    resource::{
        BufferResource, DispatchIndirectCommand, DrawIndexedIndirectCommand, DrawIndirectCommand,
        HostBuffer, Resource, ResourceKind,
    },
    sync::SyncInfo,
    Result, TestError,
};
use ash::vk;

const VERTEX_SIZE: u32 = 16;
const INDEX_SIZE: u32 = 4;

fn shader_write(stage: ShaderStage) -> SyncInfo {
    SyncInfo::new(
        stage.pipeline_stage(),
        vk::AccessFlags2::SHADER_STORAGE_WRITE,
        vk::ImageLayout::UNDEFINED,
    )
}

/// Writes an indirect command with `vkCmdUpdateBuffer`.
#[derive(Debug)]
pub struct IndirectWrite {
    pub(super) name: OperationName,
    recorder: Recorder,
    buffer: BufferResource,
    command: Vec<u8>,
    expected_invocations: u32,
}

impl IndirectWrite {
    pub(super) fn new(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;

        let (name, command, expected_invocations) = match resource.kind() {
            ResourceKind::IndirectBufferDraw => {
                let command = DrawIndirectCommand {
                    vertex_count: 6,
                    instance_count: 1,
                    first_vertex: 0,
                    first_instance: 0,
                };

                (
                    OperationName::WriteIndirectBufferDraw,
                    bytemuck::bytes_of(&command).to_vec(),
                    command.vertex_count * command.instance_count,
                )
            }
            ResourceKind::IndirectBufferDrawIndexed => {
                let command = DrawIndexedIndirectCommand {
                    index_count: 6,
                    instance_count: 1,
                    first_index: 0,
                    vertex_offset: 0,
                    first_instance: 0,
                };

                (
                    OperationName::WriteIndirectBufferDrawIndexed,
                    bytemuck::bytes_of(&command).to_vec(),
                    command.index_count * command.instance_count,
                )
            }
            ResourceKind::IndirectBufferDispatch => {
                let command = DispatchIndirectCommand { x: 7, y: 2, z: 1 };

                (
                    OperationName::WriteIndirectBufferDispatch,
                    bytemuck::bytes_of(&command).to_vec(),
                    command.x * command.y * command.z,
                )
            }
            kind => {
                return Err(TestError::harness(format!(
                    "a {kind:?} resource can't hold an indirect command",
                )));
            }
        };

        Ok(IndirectWrite {
            name,
            recorder: context.recorder(),
            buffer,
            command,
            expected_invocations,
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        self.recorder.provider.cmd_update_buffer(
            command_buffer,
            self.buffer.handle,
            self.buffer.offset,
            &self.command,
        );

        Ok(())
    }

    /// Returns the invocation count the command launches, as a native-endian `u32`.
    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        Ok(self.expected_invocations.to_ne_bytes().to_vec())
    }

    pub(super) fn set_data(&self, _data: &[u8]) -> Result {
        Err(no_payload(self.name))
    }
}

/// Executes an indirect command and counts the invocations it launches.
#[derive(Debug)]
pub struct IndirectRead {
    pub(super) name: OperationName,
    recorder: Recorder,
    kind: ResourceKind,
    buffer: BufferResource,
    stage: ShaderStage,
    pipeline: Pipeline,
    counter: HostBuffer,
    // Keeps the index buffer of indexed draws alive.
    _index_buffer: Option<HostBuffer>,
}

impl IndirectRead {
    pub(super) fn new(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = *resource.buffer()?;
        let provider = context.provider();
        let counter = HostBuffer::with_data(
            provider,
            &0u32.to_ne_bytes(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;

        let (name, stage, index_buffer) = match resource.kind() {
            ResourceKind::IndirectBufferDraw => (
                OperationName::ReadIndirectBufferDraw,
                ShaderStage::Vertex,
                None,
            ),
            ResourceKind::IndirectBufferDrawIndexed => {
                let indices: Vec<u32> = (0..6).collect();
                let index_buffer = HostBuffer::with_data(
                    provider,
                    bytemuck::cast_slice(&indices),
                    vk::BufferUsageFlags::INDEX_BUFFER,
                )?;

                (
                    OperationName::ReadIndirectBufferDrawIndexed,
                    ShaderStage::Vertex,
                    Some(index_buffer),
                )
            }
            ResourceKind::IndirectBufferDispatch => (
                OperationName::ReadIndirectBufferDispatch,
                ShaderStage::Compute,
                None,
            ),
            kind => {
                return Err(TestError::harness(format!(
                    "a {kind:?} resource doesn't hold an indirect command",
                )));
            }
        };

        let mut bindings = vec![PipelineBinding::StorageBuffer(counter.handle())];
        bindings.extend(
            index_buffer
                .as_ref()
                .map(|index_buffer| PipelineBinding::IndexBuffer(index_buffer.handle())),
        );
        let pipeline = Pipeline::new(context, "atomic_counter", stage, &bindings)?;

        Ok(IndirectRead {
            name,
            recorder: context.recorder(),
            kind: resource.kind(),
            buffer,
            stage,
            pipeline,
            counter,
            _index_buffer: index_buffer,
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        let provider = &self.recorder.provider;

        self.pipeline.bind(command_buffer);

        match self.kind {
            ResourceKind::IndirectBufferDraw => {
                provider.cmd_draw_indirect(command_buffer, self.buffer.handle, self.buffer.offset);
            }
            ResourceKind::IndirectBufferDrawIndexed => provider.cmd_draw_indexed_indirect(
                command_buffer,
                self.buffer.handle,
                self.buffer.offset,
            ),
            _ => provider.cmd_dispatch_indirect(
                command_buffer,
                self.buffer.handle,
                self.buffer.offset,
            ),
        }

        self.recorder.host_read_barrier(
            command_buffer,
            &self.counter.region(),
            &shader_write(self.stage),
        );

        Ok(())
    }

    /// Returns the counter, as a native-endian `u32`.
    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        self.counter.read()
    }

    pub(super) fn set_data(&self, _data: &[u8]) -> Result {
        Err(no_payload(self.name))
    }
}

/// Fetches a buffer as vertices and stores them back out.
#[derive(Debug)]
pub struct VertexInputRead {
    pub(super) name: OperationName,
    recorder: Recorder,
    vertex_count: u32,
    pipeline: Pipeline,
    host: HostBuffer,
}

impl VertexInputRead {
    pub(super) fn new(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = resource.buffer()?;
        let host = HostBuffer::new(
            context.provider(),
            buffer.size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let pipeline = Pipeline::new(
            context,
            "vertex_fetch",
            ShaderStage::Vertex,
            &[
                PipelineBinding::VertexBuffer(buffer.handle),
                PipelineBinding::StorageBuffer(host.handle()),
            ],
        )?;

        Ok(VertexInputRead {
            name: OperationName::ReadVertexInput,
            recorder: context.recorder(),
            vertex_count: (buffer.size / vk::DeviceSize::from(VERTEX_SIZE)) as u32,
            pipeline,
            host,
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        self.pipeline.bind(command_buffer);
        self.recorder
            .provider
            .cmd_draw(command_buffer, self.vertex_count, 1);
        self.recorder.host_read_barrier(
            command_buffer,
            &self.host.region(),
            &shader_write(ShaderStage::Vertex),
        );

        Ok(())
    }

    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        self.host.read()
    }

    pub(super) fn set_data(&self, _data: &[u8]) -> Result {
        Err(no_payload(self.name))
    }
}

/// Fetches a buffer as indices and stores them back out.
#[derive(Debug)]
pub struct IndexInputRead {
    pub(super) name: OperationName,
    recorder: Recorder,
    index_count: u32,
    pipeline: Pipeline,
    host: HostBuffer,
}

impl IndexInputRead {
    pub(super) fn new(context: &OperationContext, resource: &Resource) -> Result<Self> {
        let buffer = resource.buffer()?;
        let host = HostBuffer::new(
            context.provider(),
            buffer.size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let pipeline = Pipeline::new(
            context,
            "index_fetch",
            ShaderStage::Vertex,
            &[
                PipelineBinding::IndexBuffer(buffer.handle),
                PipelineBinding::StorageBuffer(host.handle()),
            ],
        )?;

        Ok(IndexInputRead {
            name: OperationName::ReadIndexInput,
            recorder: context.recorder(),
            index_count: (buffer.size / vk::DeviceSize::from(INDEX_SIZE)) as u32,
            pipeline,
            host,
        })
    }

    pub(super) fn record_commands(&self, command_buffer: vk::CommandBuffer) -> Result {
        self.pipeline.bind(command_buffer);
        self.recorder
            .provider
            .cmd_draw_indexed(command_buffer, self.index_count, 1);
        self.recorder.host_read_barrier(
            command_buffer,
            &self.host.region(),
            &shader_write(ShaderStage::Vertex),
        );

        Ok(())
    }

    pub(super) fn get_data(&self) -> Result<Vec<u8>> {
        self.host.read()
    }

    pub(super) fn set_data(&self, _data: &[u8]) -> Result {
        Err(no_payload(self.name))
    }
}
