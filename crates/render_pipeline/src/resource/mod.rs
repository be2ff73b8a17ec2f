//! GPU resources owned by the pipeline
//!
//! Buffers, meshes, render targets and descriptor tables. Nothing here is
//! destroyed directly while frames are in flight; it goes through the
//! [`RetireQueue`].

pub mod attachment;
pub mod buffer;
pub mod descriptor;
pub mod mesh;
pub mod retire;
pub mod shader;

pub use attachment::{
    Attachment, AttachmentKind, AttachmentRegistry, AttachmentSet, AttachmentSpec, AttachmentUsage, ExtentPolicy,
    Multisampler, PassTarget,
};
pub use buffer::{Buffer, BufferUsage, IndexBuffer, MappedBuffer, VertexBuffer};
pub use descriptor::{BindingTarget, DescriptorBinding, DescriptorTable, LinkSources};
pub use mesh::{Mesh, MeshKey, MeshRegistry};
pub use retire::{RetireQueue, Retired};
pub use shader::ShaderCode;
