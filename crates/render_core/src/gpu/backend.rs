//! The seam between the lifetime/build core and a concrete GPU API
//!
//! Everything above this trait (allocator, acceleration structures, queues,
//! the device context) is written against [`GpuBackend`]. The Vulkan
//! implementation lives in [`crate::gpu::vulkan`]; [`crate::gpu::headless`]
//! provides a CPU-side device for tests and GPU-less tooling.

use std::ptr::NonNull;

use crate::gpu::error::GpuResult;
use crate::gpu::types::{BufferDesc, DeviceAddress, DeviceCapabilities, QueueKind, TextureDesc};
use crate::raytracing::{BuildFlags, BuildInputs};

slotmap::new_key_type! {
    /// Backend buffer slot
    pub struct BufferKey;
    /// Backend texture slot
    pub struct TextureKey;
    /// Backend pipeline slot
    pub struct PipelineKey;
}

/// Conservative memory requirements of an acceleration structure build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    /// Size of the result (the structure itself)
    pub result_size: u64,
    /// Scratch needed for a full build
    pub build_scratch_size: u64,
    /// Scratch needed for an in-place update
    pub update_scratch_size: u64,
}

impl PrebuildInfo {
    /// Scratch size covering every build mode `flags` allows
    pub fn scratch_size(&self, flags: BuildFlags) -> u64 {
        if flags.contains(BuildFlags::ALLOW_UPDATE) {
            self.build_scratch_size.max(self.update_scratch_size)
        } else {
            self.build_scratch_size
        }
    }
}

/// Low-level GPU device operations
///
/// Object lifetime is owned by the RAII wrappers in [`crate::gpu::handles`];
/// backends only create and destroy by key.
pub trait GpuBackend: Send + Sync {
    /// Device limits and features
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Create a buffer and bind memory for it
    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferKey>;

    /// Release a buffer and its memory
    fn destroy_buffer(&self, key: BufferKey);

    /// GPU address of a buffer, or of the acceleration structure it backs
    fn buffer_device_address(&self, key: BufferKey) -> DeviceAddress;

    /// Map a host-visible buffer for CPU access
    fn map_buffer(&self, key: BufferKey) -> GpuResult<NonNull<u8>>;

    /// Unmap a previously mapped buffer
    fn unmap_buffer(&self, key: BufferKey);

    /// Create a texture and bind memory for it
    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<TextureKey>;

    /// Release a texture and its memory
    fn destroy_texture(&self, key: TextureKey);

    /// Release an adopted pipeline object
    fn destroy_pipeline(&self, key: PipelineKey);

    /// Size requirements for building `inputs` with `flags`
    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &BuildInputs,
        flags: BuildFlags,
    ) -> PrebuildInfo;

    /// Enqueue a fence signal on `queue` and return the value it will reach
    fn signal(&self, queue: QueueKind) -> GpuResult<u64>;

    /// Last fence value `queue` has completed
    fn completed_value(&self, queue: QueueKind) -> u64;

    /// Block until `queue` completes `value`
    fn wait_for_value(&self, queue: QueueKind, value: u64) -> GpuResult<()>;

    /// Whether `queue` has completed `value`
    fn is_complete(&self, queue: QueueKind, value: u64) -> bool {
        self.completed_value(queue) >= value
    }
}
