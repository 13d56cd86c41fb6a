//! Buffer and texture factory
//!
//! The allocator only creates objects; lifetime belongs to the returned RAII
//! wrapper and, when release must wait for the GPU, to a disposal queue.

use std::sync::Arc;

use crate::foundation::align::round_up;
use crate::gpu::backend::GpuBackend;
use crate::gpu::error::GpuResult;
use crate::gpu::handles::{GpuBuffer, GpuTexture};
use crate::gpu::types::{
    AccelerationStructureKind, BufferDesc, BufferUsage, DeviceCapabilities, MemoryPool,
    ResourceState, TextureDesc,
};

/// Creates raw GPU buffers and textures in a requested pool
#[derive(Clone)]
pub struct GpuAllocator {
    backend: Arc<dyn GpuBackend>,
}

impl GpuAllocator {
    /// Create an allocator over `backend`
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self { backend }
    }

    /// Backend the allocator creates objects on
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Device limits
    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.backend.capabilities()
    }

    /// Create a buffer from a full description
    pub fn create_buffer(&self, desc: BufferDesc) -> GpuResult<GpuBuffer> {
        log::debug!(
            "Creating buffer '{}' ({} bytes, {:?}, {:?})",
            desc.label, desc.size, desc.pool, desc.usage
        );
        let key = self.backend.create_buffer(&desc).map_err(|e| {
            log::error!("Failed to create buffer '{}': {}", desc.label, e);
            e
        })?;
        Ok(GpuBuffer::new(Arc::clone(&self.backend), key, desc))
    }

    /// Host-visible buffer used as a copy source or CPU-written input
    pub fn create_upload_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        label: impl Into<String>,
    ) -> GpuResult<GpuBuffer> {
        self.create_buffer(BufferDesc::new(
            size,
            MemoryPool::Upload,
            usage | BufferUsage::COPY_SRC,
            label,
        ))
    }

    /// Device-local buffer, optionally with unordered access
    pub fn create_device_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        unordered_access: bool,
        label: impl Into<String>,
    ) -> GpuResult<GpuBuffer> {
        let (pool, usage) = if unordered_access {
            (MemoryPool::DeviceLocalUnordered, usage | BufferUsage::STORAGE)
        } else {
            (MemoryPool::DeviceLocal, usage)
        };
        self.create_buffer(BufferDesc::new(size, pool, usage | BufferUsage::COPY_DST, label))
    }

    /// Scratch memory for acceleration structure builds, in unordered-access state
    pub fn create_scratch_buffer(&self, size: u64, label: impl Into<String>) -> GpuResult<GpuBuffer> {
        let size = round_up(size.max(1), self.capabilities().scratch_alignment);
        self.create_buffer(
            BufferDesc::new(size, MemoryPool::DeviceLocalUnordered, BufferUsage::STORAGE, label)
                .with_initial_state(ResourceState::UnorderedAccess),
        )
    }

    /// Result storage for an acceleration structure of `kind`
    pub fn create_acceleration_structure_buffer(
        &self,
        kind: AccelerationStructureKind,
        size: u64,
        label: impl Into<String>,
    ) -> GpuResult<GpuBuffer> {
        let mut desc = BufferDesc::new(
            size,
            MemoryPool::DeviceLocalUnordered,
            BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            label,
        )
        .with_initial_state(ResourceState::AccelerationStructure);
        desc.acceleration_structure = Some(kind);
        self.create_buffer(desc)
    }

    /// Create a texture; clear value and initial state come from `desc`
    pub fn create_texture(&self, desc: TextureDesc) -> GpuResult<GpuTexture> {
        log::debug!(
            "Creating texture '{}' ({}x{}, {} mips, {} layers, {:?})",
            desc.label, desc.width, desc.height, desc.mip_levels, desc.array_layers, desc.format
        );
        let key = self.backend.create_texture(&desc).map_err(|e| {
            log::error!("Failed to create texture '{}': {}", desc.label, e);
            e
        })?;
        Ok(GpuTexture::new(Arc::clone(&self.backend), key, desc))
    }
}
