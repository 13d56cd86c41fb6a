//! GPU abstraction: backend trait, RAII object handles, allocator and command recording

pub mod allocator;
pub mod backend;
pub mod command;
pub mod descriptor;
pub mod error;
pub mod handles;
pub mod headless;
pub mod types;
pub mod vulkan;

pub use allocator::GpuAllocator;
pub use backend::{BufferKey, GpuBackend, PipelineKey, PrebuildInfo, TextureKey};
pub use command::{BuildDesc, CommandList, ResourceBarrier, TextureFootprint};
pub use descriptor::{DescriptorHandle, DescriptorHeap};
pub use error::{GpuError, GpuResult};
pub use handles::{GpuBuffer, GpuResource, GpuTexture, MappedBuffer, PipelineHandle};
pub use headless::{HeadlessConfig, HeadlessDevice, HeadlessStats, RecordedCommandList};
pub use types::*;
pub use vulkan::VulkanDevice;
