//! RAII wrappers over backend objects
//!
//! Dropping a wrapper releases the object immediately. To delay release until
//! the GPU has stopped reading it, move the wrapper into a disposal queue via
//! [`crate::DeviceContext::push_to_disposer`].

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::gpu::backend::{BufferKey, GpuBackend, PipelineKey, TextureKey};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::types::{BufferDesc, DeviceAddress, MemoryPool, TextureDesc};

/// Buffer with backend memory, released on drop
pub struct GpuBuffer {
    backend: Arc<dyn GpuBackend>,
    key: BufferKey,
    desc: BufferDesc,
    address: DeviceAddress,
    mapped: AtomicBool,
}

impl GpuBuffer {
    pub(crate) fn new(backend: Arc<dyn GpuBackend>, key: BufferKey, desc: BufferDesc) -> Self {
        let address = backend.buffer_device_address(key);
        Self {
            backend,
            key,
            desc,
            address,
            mapped: AtomicBool::new(false),
        }
    }

    /// Backend key
    pub fn key(&self) -> BufferKey {
        self.key
    }

    /// Creation parameters
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Memory pool
    pub fn pool(&self) -> MemoryPool {
        self.desc.pool
    }

    /// GPU address, fixed for the buffer's lifetime
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Map the whole buffer; unmapped when the guard drops
    ///
    /// Only one mapping may be alive at a time; a second `map` fails with
    /// [`GpuError::MapFailed`] until the first guard drops.
    pub fn map(&self) -> GpuResult<MappedBuffer<'_>> {
        if !self.desc.pool.is_host_visible() {
            log::warn!("Refusing to map device-local buffer '{}'", self.desc.label);
            return Err(GpuError::MapFailed);
        }
        if self.mapped.swap(true, Ordering::Acquire) {
            log::warn!("Buffer '{}' is already mapped", self.desc.label);
            return Err(GpuError::MapFailed);
        }
        match self.backend.map_buffer(self.key) {
            Ok(ptr) => Ok(MappedBuffer { buffer: self, ptr }),
            Err(e) => {
                self.mapped.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Whether a [`MappedBuffer`] guard is currently alive
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Copy `data` into the buffer at `offset` through a temporary mapping
    pub fn write(&self, offset: u64, data: &[u8]) -> GpuResult<()> {
        let size = data.len() as u64;
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.desc.size)
            .ok_or(GpuError::UploadOutOfRange {
                offset,
                size,
                capacity: self.desc.size,
            })?;
        let mut mapped = self.map()?;
        mapped.as_mut_slice()[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("label", &self.desc.label)
            .field("size", &self.desc.size)
            .field("pool", &self.desc.pool)
            .field("address", &format_args!("0x{:016X}", self.address))
            .finish()
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        log::trace!("Releasing buffer '{}' ({} bytes)", self.desc.label, self.desc.size);
        self.backend.destroy_buffer(self.key);
    }
}

/// Host mapping of a [`GpuBuffer`]
pub struct MappedBuffer<'a> {
    buffer: &'a GpuBuffer,
    ptr: NonNull<u8>,
}

impl MappedBuffer<'_> {
    /// Mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the backend maps the full buffer size, the mapping lives
        // until this guard drops and `mapped` keeps it the only guard
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.buffer.size() as usize) }
    }

    /// Mapped bytes, writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` makes the slice unique
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.buffer.size() as usize) }
    }

    /// Raw pointer to the first byte
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        self.buffer.backend.unmap_buffer(self.buffer.key);
        self.buffer.mapped.store(false, Ordering::Release);
    }
}

/// Texture with backend memory, released on drop
pub struct GpuTexture {
    backend: Arc<dyn GpuBackend>,
    key: TextureKey,
    desc: TextureDesc,
}

impl GpuTexture {
    pub(crate) fn new(backend: Arc<dyn GpuBackend>, key: TextureKey, desc: TextureDesc) -> Self {
        Self { backend, key, desc }
    }

    /// Backend key
    pub fn key(&self) -> TextureKey {
        self.key
    }

    /// Creation parameters
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

impl fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTexture")
            .field("label", &self.desc.label)
            .field("width", &self.desc.width)
            .field("height", &self.desc.height)
            .field("format", &self.desc.format)
            .finish()
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        log::trace!("Releasing texture '{}'", self.desc.label);
        self.backend.destroy_texture(self.key);
    }
}

/// Pipeline object adopted from the pipeline builder, released on drop
pub struct PipelineHandle {
    backend: Arc<dyn GpuBackend>,
    key: PipelineKey,
    label: String,
}

impl PipelineHandle {
    pub(crate) fn new(backend: Arc<dyn GpuBackend>, key: PipelineKey, label: impl Into<String>) -> Self {
        Self {
            backend,
            key,
            label: label.into(),
        }
    }

    /// Backend key
    pub fn key(&self) -> PipelineKey {
        self.key
    }

    /// Debug name
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle").field("label", &self.label).finish()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        log::trace!("Releasing pipeline '{}'", self.label);
        self.backend.destroy_pipeline(self.key);
    }
}

/// Buffer or texture awaiting deferred release
#[derive(Debug, Clone)]
pub enum GpuResource {
    /// A buffer
    Buffer(Arc<GpuBuffer>),
    /// A texture
    Texture(Arc<GpuTexture>),
}

impl From<GpuBuffer> for GpuResource {
    fn from(buffer: GpuBuffer) -> Self {
        GpuResource::Buffer(Arc::new(buffer))
    }
}

impl From<Arc<GpuBuffer>> for GpuResource {
    fn from(buffer: Arc<GpuBuffer>) -> Self {
        GpuResource::Buffer(buffer)
    }
}

impl From<GpuTexture> for GpuResource {
    fn from(texture: GpuTexture) -> Self {
        GpuResource::Texture(Arc::new(texture))
    }
}

impl From<Arc<GpuTexture>> for GpuResource {
    fn from(texture: Arc<GpuTexture>) -> Self {
        GpuResource::Texture(texture)
    }
}

#[cfg(test)]
mod tests {
    use crate::gpu::allocator::GpuAllocator;
    use crate::gpu::error::GpuError;
    use crate::gpu::headless::HeadlessDevice;
    use crate::gpu::types::BufferUsage;

    #[test]
    fn test_second_map_is_rejected() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let buffer = allocator.create_upload_buffer(16, BufferUsage::empty(), "staging").unwrap();

        let mut first = buffer.map().unwrap();
        assert!(buffer.is_mapped());
        assert!(matches!(buffer.map(), Err(GpuError::MapFailed)));
        assert!(matches!(buffer.write(0, &[1; 4]), Err(GpuError::MapFailed)));
        first.as_mut_slice()[0] = 9;
        drop(first);

        assert!(!buffer.is_mapped());
        buffer.write(1, &[7]).unwrap();
        assert_eq!(&device.read_buffer(&buffer)[..2], &[9, 7]);
    }

    #[test]
    fn test_write_rejects_overflowing_offset() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let buffer = allocator.create_upload_buffer(16, BufferUsage::empty(), "staging").unwrap();
        assert!(matches!(
            buffer.write(u64::MAX, &[1; 4]),
            Err(GpuError::UploadOutOfRange { offset: u64::MAX, size: 4, capacity: 16 })
        ));
        assert!(!buffer.is_mapped());
    }
}
