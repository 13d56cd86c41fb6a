//! Ray tracing: acceleration structures, instance descriptors and shader tables

pub mod acceleration;
pub mod geometry;
pub mod instance;
pub mod shader_table;

pub use acceleration::{Blas, MappedInstances, Tlas};
pub use geometry::{
    AabbsDesc, BuildFlags, BuildInputs, GeometryDesc, GeometryFlags, GeometryKind, IndexFormat, TrianglesDesc,
    VertexFormat,
};
pub use instance::{InstanceDescriptor, InstanceFlags};
pub use shader_table::{ShaderRecord, ShaderTable};
