//! # render_core
//!
//! GPU resource lifetime and ray tracing build support for a Vulkan renderer.
//!
//! ## Features
//!
//! - **Acceleration Structures**: bottom- and top-level builds recorded into
//!   caller-owned command lists, with optional in-place updates
//! - **Shader Tables**: identifier and local-argument records packed at driver alignment
//! - **Staged Uploads**: buffer and texture uploads recorded once per frame
//! - **Deferred Disposal**: resources, descriptors and pipelines released only after
//!   the GPU can no longer reference them
//! - **Headless Backend**: a CPU-side device for tests and tooling without a GPU
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = HeadlessDevice::new();
//!     let ctx = DeviceContext::new(device.clone(), DeviceConfig::new("demo"))?;
//!
//!     let vertices = Arc::new(ctx.allocator().create_device_buffer(
//!         1024,
//!         BufferUsage::VERTEX | BufferUsage::ACCELERATION_STRUCTURE_INPUT,
//!         false,
//!         "vertices",
//!     )?);
//!     ctx.push_to_uploader(BufferUpload::new(ctx.allocator(), vertices.clone(), 0, &[0; 1024])?, None);
//!
//!     let geometry = GeometryDesc::triangles(TrianglesDesc::new(vertices.address(), 12, 84));
//!     let blas = Blas::new(ctx.allocator(), &[geometry], BuildFlags::PREFER_FAST_TRACE)?;
//!
//!     let mut cmd = device.command_list(QueueKind::Graphics);
//!     ctx.set_upload_command(&mut cmd);
//!     blas.build(&mut cmd);
//!     device.execute(cmd)?;
//!
//!     ctx.frame_sync();
//!     blas.retire(&ctx);
//!     ctx.wait_idle()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod gpu;
pub mod raytracing;
pub mod resources;

mod context;

pub use context::{DeviceContext, Retired};

/// Common imports for crate users
pub mod prelude {
    pub use crate::{
        DeviceContext, Retired,
        core::{DeviceConfig, DescriptorCapacities, Config, ConfigError},
        foundation::math::{Mat4, Transform3x4, Vec3},
        gpu::{
            BufferDesc, BufferUsage, CommandList, DescriptorHandle, DescriptorKind, DeviceCapabilities,
            GpuAllocator, GpuBackend, GpuBuffer, GpuError, GpuResource, GpuResult, GpuTexture,
            HeadlessDevice, MemoryPool, PipelineHandle, QueueKind, ResourceState, TextureDesc,
            TextureFormat, VulkanDevice,
        },
        raytracing::{
            Blas, BuildFlags, GeometryDesc, GeometryFlags, InstanceDescriptor, InstanceFlags,
            ShaderRecord, ShaderTable, Tlas, TrianglesDesc,
        },
        resources::{BufferUpload, TextureUpload, UploadResource},
    };
}
