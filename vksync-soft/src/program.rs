//! The shader programs the soft device knows by name.
//!
//! There is no shader compiler: a shader module is a name, and a pipeline is that name bound to
//! resources. Each program is a fixed data movement between its bindings, which the device
//! carries out when the pipeline is launched.

use ash::vk;
use std::fmt;
use vksync::provider::PipelineBinding;

/// A named program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Program {
    /// Copies binding 0 (a storage or uniform buffer) into the storage buffer at binding 1.
    CopyBuffer,
    /// Copies the storage buffer at binding 0 into the storage image at binding 1, texels
    /// tightly packed.
    CopyBufferToImage,
    /// Copies the storage image at binding 0 into the storage buffer at binding 1.
    CopyImageToBuffer,
    /// Copies the storage image at binding 0 into the one at binding 1.
    CopyImage,
    /// Adds one per invocation to the first `u32` of the storage buffer at binding 0. An
    /// optional index buffer at binding 1 only feeds indexed draws.
    AtomicCounter,
    /// Stores every fetched vertex (16 bytes each) of the vertex buffer at binding 0 into the
    /// storage buffer at binding 1.
    VertexFetch,
    /// Stores every fetched index (4 bytes each) of the index buffer at binding 0 into the
    /// storage buffer at binding 1.
    IndexFetch,
}

/// The size of one vertex fetched by [`Program::VertexFetch`].
pub const VERTEX_SIZE: u64 = 16;

/// The size of one index fetched by [`Program::IndexFetch`].
pub const INDEX_SIZE: u64 = 4;

impl Program {
    pub const ALL: [Program; 7] = [
        Program::CopyBuffer,
        Program::CopyBufferToImage,
        Program::CopyImageToBuffer,
        Program::CopyImage,
        Program::AtomicCounter,
        Program::VertexFetch,
        Program::IndexFetch,
    ];

    /// Looks a program up by the name shader modules are created with.
    pub fn from_name(name: &str) -> Option<Self> {
        Program::ALL
            .into_iter()
            .find(|program| program.name() == name)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Program::CopyBuffer => "copy_buffer",
            Program::CopyBufferToImage => "copy_buffer_to_image",
            Program::CopyImageToBuffer => "copy_image_to_buffer",
            Program::CopyImage => "copy_image",
            Program::AtomicCounter => "atomic_counter",
            Program::VertexFetch => "vertex_fetch",
            Program::IndexFetch => "index_fetch",
        }
    }

    /// Returns whether the program can be compiled for `stage`.
    pub fn supports_stage(self, stage: vk::ShaderStageFlags) -> bool {
        type S = vk::ShaderStageFlags;

        let single_stage = [
            S::VERTEX,
            S::TESSELLATION_CONTROL,
            S::TESSELLATION_EVALUATION,
            S::GEOMETRY,
            S::FRAGMENT,
            S::COMPUTE,
        ]
        .contains(&stage);

        match self {
            Program::VertexFetch | Program::IndexFetch => stage == S::VERTEX,
            _ => single_stage,
        }
    }

    /// Checks that `bindings` has the shape the program expects.
    pub fn check_bindings(self, bindings: &[PipelineBinding]) -> Result<(), BindingMismatch> {
        use PipelineBinding as B;

        let matches = match (self, bindings) {
            (
                Program::CopyBuffer,
                [B::StorageBuffer(_) | B::UniformBuffer(_), B::StorageBuffer(_)],
            )
            | (Program::CopyBufferToImage, [B::StorageBuffer(_), B::StorageImage(_)])
            | (Program::CopyImageToBuffer, [B::StorageImage(_), B::StorageBuffer(_)])
            | (Program::CopyImage, [B::StorageImage(_), B::StorageImage(_)])
            | (Program::AtomicCounter, [B::StorageBuffer(_)])
            | (Program::AtomicCounter, [B::StorageBuffer(_), B::IndexBuffer(_)])
            | (Program::VertexFetch, [B::VertexBuffer(_), B::StorageBuffer(_)])
            | (Program::IndexFetch, [B::IndexBuffer(_), B::StorageBuffer(_)]) => true,
            _ => false,
        };

        if matches {
            Ok(())
        } else {
            Err(BindingMismatch {
                program: self,
                bindings: bindings.len(),
            })
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The bindings of a pipeline don't fit its program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingMismatch {
    pub program: Program,
    pub bindings: usize,
}

impl fmt::Display for BindingMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the {} binding(s) don't match the interface of `{}`",
            self.bindings, self.program,
        )
    }
}

impl std::error::Error for BindingMismatch {}

/// Returns the usage flag a buffer bound as `binding` needs.
pub(crate) fn required_buffer_usage(binding: &PipelineBinding) -> vk::BufferUsageFlags {
    match binding {
        PipelineBinding::StorageBuffer(_) => vk::BufferUsageFlags::STORAGE_BUFFER,
        PipelineBinding::UniformBuffer(_) => vk::BufferUsageFlags::UNIFORM_BUFFER,
        PipelineBinding::VertexBuffer(_) => vk::BufferUsageFlags::VERTEX_BUFFER,
        PipelineBinding::IndexBuffer(_) => vk::BufferUsageFlags::INDEX_BUFFER,
        PipelineBinding::StorageImage(_) => vk::BufferUsageFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for program in Program::ALL {
            assert_eq!(Program::from_name(program.name()), Some(program));
        }

        assert_eq!(Program::from_name("copy_everything"), None);
    }

    #[test]
    fn fetches_only_run_in_vertex_shaders() {
        assert!(Program::VertexFetch.supports_stage(vk::ShaderStageFlags::VERTEX));
        assert!(!Program::IndexFetch.supports_stage(vk::ShaderStageFlags::COMPUTE));
        assert!(Program::CopyBuffer.supports_stage(vk::ShaderStageFlags::GEOMETRY));
        assert!(!Program::CopyBuffer.supports_stage(vk::ShaderStageFlags::ALL_GRAPHICS));
    }

    #[test]
    fn binding_shapes() {
        let buffer = vk::Buffer::null();
        let image = vk::Image::null();

        assert!(Program::CopyBuffer
            .check_bindings(&[
                PipelineBinding::UniformBuffer(buffer),
                PipelineBinding::StorageBuffer(buffer),
            ])
            .is_ok());
        assert!(Program::CopyBuffer
            .check_bindings(&[
                PipelineBinding::StorageBuffer(buffer),
                PipelineBinding::UniformBuffer(buffer),
            ])
            .is_err());
        assert!(Program::AtomicCounter
            .check_bindings(&[PipelineBinding::StorageBuffer(buffer)])
            .is_ok());
        assert_eq!(
            Program::CopyImage.check_bindings(&[PipelineBinding::StorageImage(image)]),
            Err(BindingMismatch {
                program: Program::CopyImage,
                bindings: 1,
            }),
        );
    }
}
