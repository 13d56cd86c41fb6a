//! Staged CPU to GPU uploads
//!
//! Each entry owns a host-visible staging buffer filled at construction and
//! records its own copy when the queue is drained into a command list. The
//! drained entries must outlive the GPU copy, which is why [`UploadQueue::upload`]
//! hands them back instead of dropping them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::foundation::align::{is_aligned, round_up};
use crate::gpu::allocator::GpuAllocator;
use crate::gpu::command::{CommandList, ResourceBarrier, TextureFootprint};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::handles::{GpuBuffer, GpuTexture};
use crate::gpu::types::{BufferUsage, ResourceState};

/// A pending upload that knows how to record its own copy
pub trait UploadResource: Send + Sync {
    /// Record the copy into `cmd`; called exactly once
    fn upload(&self, cmd: &mut dyn CommandList);

    /// Name for logs
    fn label(&self) -> &str {
        "upload"
    }
}

/// An entry drained from the queue, with the life time it was pushed with
pub struct CompletedUpload {
    /// The entry
    pub entry: Arc<dyn UploadResource>,
    /// Frames to keep it alive; `None` for the context default
    pub life_time: Option<u32>,
}

impl fmt::Debug for CompletedUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedUpload")
            .field("entry", &self.entry.label())
            .field("life_time", &self.life_time)
            .finish()
    }
}

/// Ordered collection of pending uploads
#[derive(Default)]
pub struct UploadQueue {
    pending: Mutex<VecDeque<CompletedUpload>>,
}

impl UploadQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<CompletedUpload>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry; the queue holds a strong reference until drained
    pub fn push(&self, entry: Arc<dyn UploadResource>, life_time: Option<u32>) {
        log::trace!("Queued upload '{}'", entry.label());
        self.pending().push_back(CompletedUpload { entry, life_time });
    }

    /// Record every pending copy into `cmd` in push order and empty the queue
    ///
    /// Entries pushed while recording wait for the next call.
    pub fn upload(&self, cmd: &mut dyn CommandList) -> Vec<CompletedUpload> {
        let drained: Vec<CompletedUpload> = self.pending().drain(..).collect();
        for completed in &drained {
            completed.entry.upload(cmd);
        }
        if !drained.is_empty() {
            log::debug!("Recorded {} uploads on {:?}", drained.len(), cmd.queue());
        }
        drained
    }

    /// Pending entries
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

/// Bytes staged for a range of a destination buffer
pub struct BufferUpload {
    staging: GpuBuffer,
    destination: Arc<GpuBuffer>,
    offset: u64,
}

impl BufferUpload {
    /// Stage `data` for `destination` at `offset`
    pub fn new(
        allocator: &GpuAllocator,
        destination: Arc<GpuBuffer>,
        offset: u64,
        data: &[u8],
    ) -> GpuResult<Arc<Self>> {
        let size = data.len() as u64;
        if offset.checked_add(size).map_or(true, |end| end > destination.size()) {
            return Err(GpuError::UploadOutOfRange {
                offset,
                size,
                capacity: destination.size(),
            });
        }

        let staging = allocator.create_upload_buffer(
            size,
            BufferUsage::empty(),
            format!("{} staging", destination.desc().label),
        )?;
        staging.write(0, data)?;

        Ok(Arc::new(Self {
            staging,
            destination,
            offset,
        }))
    }

    /// Buffer being written
    pub fn destination(&self) -> &Arc<GpuBuffer> {
        &self.destination
    }

    /// Destination offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes staged
    pub fn size(&self) -> u64 {
        self.staging.size()
    }
}

impl UploadResource for BufferUpload {
    fn upload(&self, cmd: &mut dyn CommandList) {
        if self.staging.size() == 0 {
            return;
        }
        cmd.copy_buffer(&self.staging, 0, &self.destination, self.offset, self.staging.size());
        cmd.barrier(&ResourceBarrier::CopyToRead(&self.destination));
    }

    fn label(&self) -> &str {
        &self.destination.desc().label
    }
}

/// Every subresource of a texture staged at the device's copy alignments
pub struct TextureUpload {
    staging: GpuBuffer,
    destination: Arc<GpuTexture>,
    footprints: Vec<TextureFootprint>,
}

impl TextureUpload {
    /// Stage tightly packed rows for each subresource, ordered `mip + layer * mip_levels`
    pub fn new(
        allocator: &GpuAllocator,
        destination: Arc<GpuTexture>,
        subresources: &[&[u8]],
    ) -> GpuResult<Arc<Self>> {
        let desc = destination.desc();
        let expected = desc.subresource_count();
        if subresources.len() != expected as usize {
            return Err(GpuError::SubresourceMismatch {
                expected,
                actual: subresources.len(),
            });
        }

        let caps = allocator.capabilities();
        let bytes_per_texel = u64::from(desc.format.bytes_per_texel());
        let mut footprints = Vec::with_capacity(subresources.len());
        let mut cursor = 0u64;
        for (index, data) in subresources.iter().enumerate() {
            let index = index as u32;
            let mip_level = index % desc.mip_levels;
            let array_layer = index / desc.mip_levels;
            let (width, height) = desc.mip_extent(mip_level);
            let row_bytes = u64::from(width) * bytes_per_texel;
            let packed_size = row_bytes * u64::from(height);
            if data.len() as u64 != packed_size {
                return Err(GpuError::UploadOutOfRange {
                    offset: 0,
                    size: data.len() as u64,
                    capacity: packed_size,
                });
            }

            let row_pitch = round_up(row_bytes, caps.texture_row_pitch_alignment);
            let offset = round_up(cursor, caps.texture_placement_alignment);
            debug_assert!(is_aligned(row_pitch, caps.texture_row_pitch_alignment));
            footprints.push(TextureFootprint {
                offset,
                row_pitch,
                width,
                height,
                mip_level,
                array_layer,
            });
            cursor = offset + row_pitch * u64::from(height);
        }

        let staging = allocator.create_upload_buffer(cursor, BufferUsage::empty(), format!("{} staging", desc.label))?;
        {
            let mut mapped = staging.map()?;
            let bytes = mapped.as_mut_slice();
            for (footprint, data) in footprints.iter().zip(subresources) {
                let row_bytes = data.len() / footprint.height as usize;
                for (row, source) in data.chunks_exact(row_bytes).enumerate() {
                    let start = (footprint.offset + row as u64 * footprint.row_pitch) as usize;
                    bytes[start..start + row_bytes].copy_from_slice(source);
                }
            }
        }

        Ok(Arc::new(Self {
            staging,
            destination,
            footprints,
        }))
    }

    /// Texture being written
    pub fn destination(&self) -> &Arc<GpuTexture> {
        &self.destination
    }

    /// Placement of each subresource in the staging buffer
    pub fn footprints(&self) -> &[TextureFootprint] {
        &self.footprints
    }
}

impl UploadResource for TextureUpload {
    fn upload(&self, cmd: &mut dyn CommandList) {
        let initial = self.destination.desc().initial_state;
        if initial != ResourceState::CopyDest {
            cmd.barrier(&ResourceBarrier::Transition {
                texture: &self.destination,
                before: initial,
                after: ResourceState::CopyDest,
            });
        }
        for footprint in &self.footprints {
            cmd.copy_buffer_to_texture(&self.staging, &self.destination, footprint);
        }
        cmd.barrier(&ResourceBarrier::Transition {
            texture: &self.destination,
            before: ResourceState::CopyDest,
            after: ResourceState::ShaderResource,
        });
    }

    fn label(&self) -> &str {
        &self.destination.desc().label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessCommand, HeadlessDevice};
    use crate::gpu::types::{QueueKind, TextureDesc, TextureFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingUpload {
        calls: AtomicUsize,
    }

    impl UploadResource for CountingUpload {
        fn upload(&self, _cmd: &mut dyn CommandList) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_upload_drains_once() {
        let device = HeadlessDevice::new();
        let queue = UploadQueue::new();
        let entry = Arc::new(CountingUpload {
            calls: AtomicUsize::new(0),
        });
        queue.push(entry.clone(), None);
        assert_eq!(queue.len(), 1);

        let mut list = device.command_list(QueueKind::Copy);
        let drained = queue.upload(&mut list);
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());

        let mut second = device.command_list(QueueKind::Copy);
        assert!(queue.upload(&mut second).is_empty());
        assert_eq!(entry.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffer_upload_lands_at_offset() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let destination = Arc::new(
            allocator
                .create_device_buffer(64, BufferUsage::VERTEX, false, "vertices")
                .unwrap(),
        );
        let staged: Vec<u8> = (0..16).collect();

        let queue = UploadQueue::new();
        queue.push(BufferUpload::new(&allocator, destination.clone(), 32, &staged).unwrap(), Some(2));

        let mut list = device.command_list(QueueKind::Copy);
        let drained = queue.upload(&mut list);
        assert!(queue.is_empty());
        assert_eq!(drained[0].life_time, Some(2));
        device.execute(list).unwrap();

        let contents = device.read_buffer(&destination);
        assert_eq!(&contents[32..48], staged.as_slice());
        assert!(contents[..32].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_uploads_apply_in_push_order() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let destination = Arc::new(
            allocator
                .create_device_buffer(8, BufferUsage::CONSTANT, false, "constants")
                .unwrap(),
        );

        let queue = UploadQueue::new();
        queue.push(BufferUpload::new(&allocator, destination.clone(), 0, &[1; 8]).unwrap(), None);
        queue.push(BufferUpload::new(&allocator, destination.clone(), 4, &[2; 4]).unwrap(), None);

        let mut list = device.command_list(QueueKind::Copy);
        let _drained = queue.upload(&mut list);
        device.execute(list).unwrap();
        assert_eq!(device.read_buffer(&destination), vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_out_of_range_upload_is_not_scheduled() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let destination = Arc::new(
            allocator
                .create_device_buffer(8, BufferUsage::empty(), false, "small")
                .unwrap(),
        );
        let result = BufferUpload::new(&allocator, destination, 4, &[0; 8]);
        assert!(matches!(
            result,
            Err(GpuError::UploadOutOfRange { offset: 4, size: 8, capacity: 8 })
        ));
        assert_eq!(device.stats().buffers_created, 1);
    }

    #[test]
    fn test_overflowing_offset_is_out_of_range() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let destination = Arc::new(
            allocator
                .create_device_buffer(8, BufferUsage::empty(), false, "small")
                .unwrap(),
        );
        let result = BufferUpload::new(&allocator, destination, u64::MAX, &[1; 4]);
        assert!(matches!(
            result,
            Err(GpuError::UploadOutOfRange { offset: u64::MAX, size: 4, capacity: 8 })
        ));
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn test_buffer_copy_is_followed_by_read_barrier() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let destination = Arc::new(
            allocator
                .create_device_buffer(16, BufferUsage::VERTEX, false, "vertices")
                .unwrap(),
        );
        let upload = BufferUpload::new(&allocator, destination.clone(), 0, &[3; 16]).unwrap();

        let mut list = device.command_list(QueueKind::Copy);
        upload.upload(&mut list);
        assert!(matches!(list.commands()[0], HeadlessCommand::CopyBuffer { dst, .. } if dst == destination.key()));
        assert_eq!(list.commands()[1], HeadlessCommand::CopyToReadBarrier(destination.key()));
    }

    #[test]
    fn test_texture_upload_with_mips() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let texture = Arc::new(
            allocator
                .create_texture(TextureDesc::new_2d(4, 4, TextureFormat::Rgba8Unorm, "albedo").with_mip_levels(2))
                .unwrap(),
        );
        let mip0: Vec<u8> = (0..64).collect();
        let mip1: Vec<u8> = (100..116).collect();

        let upload = TextureUpload::new(&allocator, texture.clone(), &[mip0.as_slice(), mip1.as_slice()]).unwrap();
        let footprints = upload.footprints();
        assert_eq!(footprints[0].row_pitch, 256);
        assert_eq!(footprints[1].offset % 512, 0);
        assert!(footprints[1].offset >= 256 * 4);

        let queue = UploadQueue::new();
        queue.push(upload, None);
        let mut list = device.command_list(QueueKind::Graphics);
        let _drained = queue.upload(&mut list);
        device.execute(list).unwrap();

        assert_eq!(device.read_texture(&texture, 0), mip0);
        assert_eq!(device.read_texture(&texture, 1), mip1);
        assert_eq!(device.texture_state(&texture), Some(ResourceState::ShaderResource));
    }

    #[test]
    fn test_texture_upload_requires_every_subresource() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let texture = Arc::new(
            allocator
                .create_texture(TextureDesc::new_2d(2, 2, TextureFormat::R8Unorm, "mask").with_array_layers(2))
                .unwrap(),
        );
        let layer = [0u8; 4];
        let result = TextureUpload::new(&allocator, texture, &[&layer[..]]);
        assert!(matches!(
            result,
            Err(GpuError::SubresourceMismatch { expected: 2, actual: 1 })
        ));
        assert_eq!(device.live_buffers(), 0);
    }
}
