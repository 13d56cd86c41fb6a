//! CPU-side device
//!
//! `HeadlessDevice` implements [`GpuBackend`] with host memory. Command lists
//! are recorded into [`RecordedCommandList`] and applied synchronously by
//! [`HeadlessDevice::execute`], which also completes the queue fence. Object
//! creation and release are counted so lifetime behavior can be checked
//! without a GPU.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use slotmap::SlotMap;

use crate::foundation::align::round_up;
use crate::gpu::backend::{BufferKey, GpuBackend, PipelineKey, PrebuildInfo, TextureKey};
use crate::gpu::command::{BuildDesc, CommandList, ResourceBarrier, TextureFootprint};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::handles::{GpuBuffer, GpuTexture, PipelineHandle};
use crate::gpu::types::{
    BufferDesc, DeviceAddress, DeviceCapabilities, QueueKind, ResourceState, TextureDesc,
};
use crate::raytracing::{BuildFlags, BuildInputs};

const BASE_ADDRESS: DeviceAddress = 0x0001_0000_0000;
const ADDRESS_ALIGNMENT: u64 = 256;

/// Behavior knobs for a [`HeadlessDevice`]
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Reported limits
    pub capabilities: DeviceCapabilities,
    /// Total bytes of buffer and texture memory before allocations fail
    pub memory_budget: Option<u64>,
    /// Fixed answer for every prebuild size query
    pub prebuild_override: Option<PrebuildInfo>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                device_name: "Headless Device".to_string(),
                ray_tracing: true,
                shader_identifier_size: 32,
                shader_record_alignment: 32,
                shader_table_alignment: 64,
                scratch_alignment: 256,
                texture_row_pitch_alignment: 256,
                texture_placement_alignment: 512,
                supported_queues: vec![QueueKind::Graphics, QueueKind::Compute, QueueKind::Copy],
            },
            memory_budget: None,
            prebuild_override: None,
        }
    }
}

impl HeadlessConfig {
    /// Limit total allocated bytes
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Answer every prebuild query with `info`
    pub fn with_prebuild_override(mut self, info: PrebuildInfo) -> Self {
        self.prebuild_override = Some(info);
        self
    }

    /// Report no ray tracing support
    pub fn without_ray_tracing(mut self) -> Self {
        self.capabilities.ray_tracing = false;
        self
    }
}

/// Creation and release counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Buffers created
    pub buffers_created: u64,
    /// Buffers released
    pub buffers_released: u64,
    /// Textures created
    pub textures_created: u64,
    /// Textures released
    pub textures_released: u64,
    /// Pipelines released
    pub pipelines_released: u64,
    /// Acceleration structure builds executed
    pub builds_executed: u64,
}

struct HeadlessBuffer {
    desc: BufferDesc,
    // u64 words keep mapped views 8-byte aligned
    memory: Box<[u64]>,
    address: DeviceAddress,
    build_count: u64,
}

impl HeadlessBuffer {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.memory)[..self.desc.size as usize]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.desc.size as usize;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.memory)[..size]
    }
}

struct HeadlessTexture {
    desc: TextureDesc,
    subresources: Vec<Vec<u8>>,
    state: ResourceState,
    size: u64,
}

#[derive(Default)]
struct HeadlessState {
    buffers: SlotMap<BufferKey, HeadlessBuffer>,
    textures: SlotMap<TextureKey, HeadlessTexture>,
    pipelines: SlotMap<PipelineKey, String>,
    next_address: DeviceAddress,
    allocated_bytes: u64,
    stats: HeadlessStats,
}

/// Device that keeps all memory on the host
pub struct HeadlessDevice {
    config: HeadlessConfig,
    state: Mutex<HeadlessState>,
    fences: Mutex<HashMap<QueueKind, u64>>,
}

impl HeadlessDevice {
    /// Device with default limits
    pub fn new() -> Arc<Self> {
        Self::with_config(HeadlessConfig::default())
    }

    /// Device with explicit limits
    pub fn with_config(config: HeadlessConfig) -> Arc<Self> {
        let fences = config
            .capabilities
            .supported_queues
            .iter()
            .map(|&queue| (queue, 0))
            .collect();
        Arc::new(Self {
            config,
            state: Mutex::new(HeadlessState {
                next_address: BASE_ADDRESS,
                ..HeadlessState::default()
            }),
            fences: Mutex::new(fences),
        })
    }

    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creation and release counters
    pub fn stats(&self) -> HeadlessStats {
        self.state().stats
    }

    /// Buffers currently alive
    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    /// Textures currently alive
    pub fn live_textures(&self) -> usize {
        self.state().textures.len()
    }

    /// Bytes of buffer and texture memory currently allocated
    pub fn allocated_bytes(&self) -> u64 {
        self.state().allocated_bytes
    }

    /// Copy of a buffer's contents
    pub fn read_buffer(&self, buffer: &GpuBuffer) -> Vec<u8> {
        self.state()
            .buffers
            .get(buffer.key())
            .map(|b| b.bytes().to_vec())
            .unwrap_or_default()
    }

    /// Tightly packed contents of one texture subresource (`mip + layer * mip_levels`)
    pub fn read_texture(&self, texture: &GpuTexture, subresource: u32) -> Vec<u8> {
        self.state()
            .textures
            .get(texture.key())
            .and_then(|t| t.subresources.get(subresource as usize).cloned())
            .unwrap_or_default()
    }

    /// Last state a texture was transitioned to
    pub fn texture_state(&self, texture: &GpuTexture) -> Option<ResourceState> {
        self.state().textures.get(texture.key()).map(|t| t.state)
    }

    /// Builds executed into an acceleration structure buffer
    pub fn build_count(&self, buffer: &GpuBuffer) -> u64 {
        self.state().buffers.get(buffer.key()).map_or(0, |b| b.build_count)
    }

    /// Register a pipeline object, standing in for the pipeline builder
    pub fn create_pipeline(self: &Arc<Self>, label: impl Into<String>) -> PipelineHandle {
        let label = label.into();
        let key = self.state().pipelines.insert(label.clone());
        let backend: Arc<dyn GpuBackend> = Arc::clone(self) as Arc<dyn GpuBackend>;
        PipelineHandle::new(backend, key, label)
    }

    /// Pipelines currently alive
    pub fn live_pipelines(&self) -> usize {
        self.state().pipelines.len()
    }

    /// Start recording a command list for `queue`
    pub fn command_list(&self, queue: QueueKind) -> RecordedCommandList {
        RecordedCommandList {
            queue,
            commands: Vec::new(),
        }
    }

    /// Apply every recorded command, then signal and complete the queue fence
    pub fn execute(&self, list: RecordedCommandList) -> GpuResult<u64> {
        {
            let mut state = self.state();
            for command in &list.commands {
                state.apply(command);
            }
        }
        self.signal(list.queue)
    }

    fn fences(&self) -> MutexGuard<'_, HashMap<QueueKind, u64>> {
        self.fences.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn estimate_prebuild(inputs: &BuildInputs) -> PrebuildInfo {
        let primitives = inputs.total_primitives();
        if primitives == 0 {
            return PrebuildInfo::default();
        }
        let (node_size, scratch_per_primitive) = match inputs {
            BuildInputs::BottomLevel { .. } => (64, 32),
            BuildInputs::TopLevel { .. } => (128, 64),
        };
        PrebuildInfo {
            result_size: round_up(primitives * node_size + 256, ADDRESS_ALIGNMENT),
            build_scratch_size: round_up(primitives * scratch_per_primitive + 128, ADDRESS_ALIGNMENT),
            update_scratch_size: round_up(primitives * 16 + 128, ADDRESS_ALIGNMENT),
        }
    }

    fn reserve(&self, state: &mut HeadlessState, size: u64) -> GpuResult<()> {
        if let Some(budget) = self.config.memory_budget {
            if state.allocated_bytes + size > budget {
                return Err(GpuError::OutOfMemory { requested: size });
            }
        }
        state.allocated_bytes += size;
        Ok(())
    }
}

impl HeadlessState {
    fn apply(&mut self, command: &HeadlessCommand) {
        match *command {
            HeadlessCommand::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                let Some(source) = self.buffers.get(src) else {
                    log::error!("Copy from released buffer");
                    return;
                };
                let (start, end) = (src_offset as usize, (src_offset + size) as usize);
                let bytes = source.bytes()[start..end].to_vec();
                match self.buffers.get_mut(dst) {
                    Some(target) => {
                        let start = dst_offset as usize;
                        target.bytes_mut()[start..start + bytes.len()].copy_from_slice(&bytes);
                    }
                    None => log::error!("Copy into released buffer"),
                }
            }
            HeadlessCommand::CopyBufferToTexture { src, dst, footprint } => {
                let Some(source) = self.buffers.get(src) else {
                    log::error!("Texture copy from released buffer");
                    return;
                };
                let Some(texture) = self.textures.get_mut(dst) else {
                    log::error!("Copy into released texture");
                    return;
                };
                if texture.state != ResourceState::CopyDest {
                    log::warn!(
                        "Texture '{}' written in state {:?}",
                        texture.desc.label, texture.state
                    );
                }
                let row_bytes = footprint.width as usize * texture.desc.format.bytes_per_texel() as usize;
                let index = (footprint.mip_level + footprint.array_layer * texture.desc.mip_levels) as usize;
                let target = &mut texture.subresources[index];
                for row in 0..footprint.height as usize {
                    let from = footprint.offset as usize + row * footprint.row_pitch as usize;
                    let to = row * row_bytes;
                    target[to..to + row_bytes].copy_from_slice(&source.bytes()[from..from + row_bytes]);
                }
            }
            HeadlessCommand::BuildAccelerationStructure { destination, .. } => {
                match self.buffers.get_mut(destination) {
                    Some(buffer) => {
                        buffer.build_count += 1;
                        self.stats.builds_executed += 1;
                    }
                    None => log::error!("Build into released acceleration structure"),
                }
            }
            HeadlessCommand::UnorderedAccessBarrier(_) | HeadlessCommand::CopyToReadBarrier(_) => {}
            HeadlessCommand::Transition { texture, before, after } => {
                if let Some(texture) = self.textures.get_mut(texture) {
                    if texture.state != before {
                        log::warn!(
                            "Transition of '{}' expected {:?} but texture is {:?}",
                            texture.desc.label, before, texture.state
                        );
                    }
                    texture.state = after;
                }
            }
        }
    }
}

impl GpuBackend for HeadlessDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.config.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferKey> {
        let mut state = self.state();
        self.reserve(&mut state, desc.size)?;
        let address = state.next_address;
        state.next_address += round_up(desc.size.max(1), ADDRESS_ALIGNMENT) + ADDRESS_ALIGNMENT;
        state.stats.buffers_created += 1;
        Ok(state.buffers.insert(HeadlessBuffer {
            desc: desc.clone(),
            memory: vec![0u64; desc.size.div_ceil(8) as usize].into_boxed_slice(),
            address,
            build_count: 0,
        }))
    }

    fn destroy_buffer(&self, key: BufferKey) {
        let mut state = self.state();
        if let Some(buffer) = state.buffers.remove(key) {
            state.allocated_bytes -= buffer.desc.size;
            state.stats.buffers_released += 1;
        }
    }

    fn buffer_device_address(&self, key: BufferKey) -> DeviceAddress {
        self.state().buffers.get(key).map_or(0, |b| b.address)
    }

    fn map_buffer(&self, key: BufferKey) -> GpuResult<NonNull<u8>> {
        let mut state = self.state();
        let buffer = state.buffers.get_mut(key).ok_or(GpuError::MapFailed)?;
        if !buffer.desc.pool.is_host_visible() {
            return Err(GpuError::MapFailed);
        }
        NonNull::new(buffer.memory.as_mut_ptr().cast::<u8>()).ok_or(GpuError::MapFailed)
    }

    fn unmap_buffer(&self, _key: BufferKey) {}

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<TextureKey> {
        let bytes_per_texel = desc.format.bytes_per_texel() as usize;
        let mut subresources = Vec::with_capacity(desc.subresource_count() as usize);
        for _layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                let (width, height) = desc.mip_extent(mip);
                subresources.push(vec![0u8; width as usize * height as usize * bytes_per_texel]);
            }
        }
        let size = subresources.iter().map(|s| s.len() as u64).sum();

        let mut state = self.state();
        self.reserve(&mut state, size)?;
        state.stats.textures_created += 1;
        Ok(state.textures.insert(HeadlessTexture {
            desc: desc.clone(),
            subresources,
            state: desc.initial_state,
            size,
        }))
    }

    fn destroy_texture(&self, key: TextureKey) {
        let mut state = self.state();
        if let Some(texture) = state.textures.remove(key) {
            state.allocated_bytes -= texture.size;
            state.stats.textures_released += 1;
        }
    }

    fn destroy_pipeline(&self, key: PipelineKey) {
        let mut state = self.state();
        if state.pipelines.remove(key).is_some() {
            state.stats.pipelines_released += 1;
        }
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &BuildInputs,
        _flags: BuildFlags,
    ) -> PrebuildInfo {
        self.config
            .prebuild_override
            .unwrap_or_else(|| Self::estimate_prebuild(inputs))
    }

    fn signal(&self, queue: QueueKind) -> GpuResult<u64> {
        let mut fences = self.fences();
        let value = fences.get_mut(&queue).ok_or(GpuError::QueueUnavailable(queue))?;
        *value += 1;
        Ok(*value)
    }

    fn completed_value(&self, queue: QueueKind) -> u64 {
        self.fences().get(&queue).copied().unwrap_or(0)
    }

    fn wait_for_value(&self, queue: QueueKind, value: u64) -> GpuResult<()> {
        let completed = self.completed_value(queue);
        if completed < value {
            log::warn!("Waiting on {:?} for value {} that was never signaled", queue, value);
        }
        Ok(())
    }
}

/// A command recorded by [`RecordedCommandList`]
#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessCommand {
    /// Buffer to buffer copy
    CopyBuffer {
        /// Source
        src: BufferKey,
        /// Source offset
        src_offset: u64,
        /// Destination
        dst: BufferKey,
        /// Destination offset
        dst_offset: u64,
        /// Bytes
        size: u64,
    },
    /// Staging buffer to texture subresource
    CopyBufferToTexture {
        /// Source
        src: BufferKey,
        /// Destination
        dst: TextureKey,
        /// Placement in the source
        footprint: TextureFootprint,
    },
    /// Acceleration structure build
    BuildAccelerationStructure {
        /// Result buffer
        destination: BufferKey,
        /// Update source
        source: Option<BufferKey>,
        /// Scratch buffer
        scratch: BufferKey,
        /// Flags
        flags: BuildFlags,
    },
    /// Unordered access barrier on a buffer
    UnorderedAccessBarrier(BufferKey),
    /// Copy-to-read barrier on a buffer
    CopyToReadBarrier(BufferKey),
    /// Texture state transition
    Transition {
        /// Texture
        texture: TextureKey,
        /// State before
        before: ResourceState,
        /// State after
        after: ResourceState,
    },
}

/// Command list for a [`HeadlessDevice`]
#[derive(Debug, Clone)]
pub struct RecordedCommandList {
    queue: QueueKind,
    commands: Vec<HeadlessCommand>,
}

impl RecordedCommandList {
    /// Commands recorded so far
    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandList for RecordedCommandList {
    fn queue(&self) -> QueueKind {
        self.queue
    }

    fn copy_buffer(
        &mut self,
        src: &GpuBuffer,
        src_offset: u64,
        dst: &GpuBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        self.commands.push(HeadlessCommand::CopyBuffer {
            src: src.key(),
            src_offset,
            dst: dst.key(),
            dst_offset,
            size,
        });
    }

    fn copy_buffer_to_texture(&mut self, src: &GpuBuffer, dst: &GpuTexture, footprint: &TextureFootprint) {
        self.commands.push(HeadlessCommand::CopyBufferToTexture {
            src: src.key(),
            dst: dst.key(),
            footprint: *footprint,
        });
    }

    fn build_acceleration_structure(&mut self, desc: &BuildDesc<'_>) {
        self.commands.push(HeadlessCommand::BuildAccelerationStructure {
            destination: desc.destination.key(),
            source: desc.source.map(GpuBuffer::key),
            scratch: desc.scratch.key(),
            flags: desc.flags,
        });
    }

    fn barrier(&mut self, barrier: &ResourceBarrier<'_>) {
        let command = match *barrier {
            ResourceBarrier::UnorderedAccess(buffer) => HeadlessCommand::UnorderedAccessBarrier(buffer.key()),
            ResourceBarrier::CopyToRead(buffer) => HeadlessCommand::CopyToReadBarrier(buffer.key()),
            ResourceBarrier::Transition { texture, before, after } => HeadlessCommand::Transition {
                texture: texture.key(),
                before,
                after,
            },
        };
        self.commands.push(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::allocator::GpuAllocator;
    use crate::gpu::types::BufferUsage;

    #[test]
    fn test_release_counting() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let buffer = allocator.create_upload_buffer(128, BufferUsage::empty(), "a").unwrap();
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(device.allocated_bytes(), 128);
        drop(buffer);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.stats().buffers_released, 1);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_memory_budget() {
        let device = HeadlessDevice::with_config(HeadlessConfig::default().with_memory_budget(100));
        let allocator = GpuAllocator::new(device.clone());
        let _kept = allocator.create_upload_buffer(60, BufferUsage::empty(), "a").unwrap();
        let result = allocator.create_upload_buffer(60, BufferUsage::empty(), "b");
        assert!(matches!(result, Err(GpuError::OutOfMemory { requested: 60 })));
    }

    #[test]
    fn test_device_local_buffers_cannot_be_mapped() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device);
        let buffer = allocator.create_device_buffer(64, BufferUsage::VERTEX, false, "vb").unwrap();
        assert!(matches!(buffer.map(), Err(GpuError::MapFailed)));
    }

    #[test]
    fn test_copy_execution() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device.clone());
        let src = allocator.create_upload_buffer(8, BufferUsage::empty(), "src").unwrap();
        let dst = allocator.create_device_buffer(16, BufferUsage::empty(), false, "dst").unwrap();
        src.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut list = device.command_list(QueueKind::Copy);
        list.copy_buffer(&src, 2, &dst, 10, 4);
        let value = device.execute(list).unwrap();

        assert_eq!(&device.read_buffer(&dst)[10..14], &[3, 4, 5, 6]);
        assert!(device.is_complete(QueueKind::Copy, value));
    }

    #[test]
    fn test_fences_are_per_queue() {
        let device = HeadlessDevice::new();
        assert_eq!(device.signal(QueueKind::Graphics).unwrap(), 1);
        assert_eq!(device.signal(QueueKind::Graphics).unwrap(), 2);
        assert_eq!(device.signal(QueueKind::Compute).unwrap(), 1);
        assert!(matches!(
            device.signal(QueueKind::VideoDecode),
            Err(GpuError::QueueUnavailable(QueueKind::VideoDecode))
        ));
    }

    #[test]
    fn test_addresses_are_distinct_and_aligned() {
        let device = HeadlessDevice::new();
        let allocator = GpuAllocator::new(device);
        let a = allocator.create_upload_buffer(1, BufferUsage::empty(), "a").unwrap();
        let b = allocator.create_upload_buffer(1, BufferUsage::empty(), "b").unwrap();
        assert_ne!(a.address(), b.address());
        assert_eq!(a.address() % ADDRESS_ALIGNMENT, 0);
        assert_eq!(b.address() % ADDRESS_ALIGNMENT, 0);
    }
}
