//! The device facade
//!
//! `DeviceContext` owns the allocator, the descriptor heaps, the upload queue
//! and one disposal queue per kind of retired object. It is constructed
//! explicitly and passed to whatever needs it; there is no global instance.
//!
//! Per frame, the owner calls [`DeviceContext::set_upload_command`] on the
//! frame's command list and [`DeviceContext::frame_sync`] once the frame has
//! been submitted.

use std::sync::Arc;

use crate::core::DeviceConfig;
use crate::gpu::allocator::GpuAllocator;
use crate::gpu::backend::GpuBackend;
use crate::gpu::command::CommandList;
use crate::gpu::descriptor::{DescriptorHandle, DescriptorHeap};
use crate::gpu::error::GpuResult;
use crate::gpu::handles::{GpuBuffer, GpuResource, GpuTexture, PipelineHandle};
use crate::gpu::types::{DescriptorKind, DeviceCapabilities};
use crate::gpu::vulkan::VulkanDevice;
use crate::resources::disposal::DisposalQueue;
use crate::resources::upload::{UploadQueue, UploadResource};

/// An object handed to the context for deferred release
#[derive(Debug)]
pub enum Retired {
    /// Buffer or texture
    Resource(GpuResource),
    /// Descriptor slot
    Descriptor(DescriptorHandle),
    /// Pipeline object
    Pipeline(PipelineHandle),
}

impl From<GpuResource> for Retired {
    fn from(resource: GpuResource) -> Self {
        Retired::Resource(resource)
    }
}

impl From<GpuBuffer> for Retired {
    fn from(buffer: GpuBuffer) -> Self {
        Retired::Resource(buffer.into())
    }
}

impl From<Arc<GpuBuffer>> for Retired {
    fn from(buffer: Arc<GpuBuffer>) -> Self {
        Retired::Resource(buffer.into())
    }
}

impl From<GpuTexture> for Retired {
    fn from(texture: GpuTexture) -> Self {
        Retired::Resource(texture.into())
    }
}

impl From<Arc<GpuTexture>> for Retired {
    fn from(texture: Arc<GpuTexture>) -> Self {
        Retired::Resource(texture.into())
    }
}

impl From<DescriptorHandle> for Retired {
    fn from(handle: DescriptorHandle) -> Self {
        Retired::Descriptor(handle)
    }
}

impl From<PipelineHandle> for Retired {
    fn from(pipeline: PipelineHandle) -> Self {
        Retired::Pipeline(pipeline)
    }
}

struct DescriptorHeaps {
    resource: Arc<DescriptorHeap>,
    sampler: Arc<DescriptorHeap>,
    render_target: Arc<DescriptorHeap>,
    depth_stencil: Arc<DescriptorHeap>,
}

impl DescriptorHeaps {
    fn get(&self, kind: DescriptorKind) -> &Arc<DescriptorHeap> {
        match kind {
            DescriptorKind::Resource => &self.resource,
            DescriptorKind::Sampler => &self.sampler,
            DescriptorKind::RenderTarget => &self.render_target,
            DescriptorKind::DepthStencil => &self.depth_stencil,
        }
    }
}

/// Device facade owning the upload and disposal queues
pub struct DeviceContext {
    config: DeviceConfig,
    allocator: GpuAllocator,
    heaps: DescriptorHeaps,
    uploader: UploadQueue,
    upload_disposer: DisposalQueue<Arc<dyn UploadResource>>,
    resource_disposer: DisposalQueue<GpuResource>,
    pipeline_disposer: DisposalQueue<PipelineHandle>,
    descriptor_disposer: DisposalQueue<DescriptorHandle>,
}

impl DeviceContext {
    /// Build a context over an existing backend
    pub fn new(backend: Arc<dyn GpuBackend>, config: DeviceConfig) -> GpuResult<Self> {
        config.validate()?;

        let caps = backend.capabilities();
        log::info!(
            "Device '{}': ray tracing {}, identifier {} bytes, record alignment {}, table alignment {}, queues {:?}",
            caps.device_name,
            caps.ray_tracing,
            caps.shader_identifier_size,
            caps.shader_record_alignment,
            caps.shader_table_alignment,
            caps.supported_queues
        );

        let capacities = config.descriptor_capacities;
        let heaps = DescriptorHeaps {
            resource: DescriptorHeap::new(DescriptorKind::Resource, capacities.resource),
            sampler: DescriptorHeap::new(DescriptorKind::Sampler, capacities.sampler),
            render_target: DescriptorHeap::new(DescriptorKind::RenderTarget, capacities.render_target),
            depth_stencil: DescriptorHeap::new(DescriptorKind::DepthStencil, capacities.depth_stencil),
        };

        let frames = config.frames_in_flight;
        Ok(Self {
            allocator: GpuAllocator::new(backend),
            heaps,
            uploader: UploadQueue::new(),
            upload_disposer: DisposalQueue::new("uploads", config.effective_upload_life_time()),
            resource_disposer: DisposalQueue::new("resources", frames),
            pipeline_disposer: DisposalQueue::new("pipelines", frames),
            descriptor_disposer: DisposalQueue::new("descriptors", frames),
            config,
        })
    }

    /// Bring up a Vulkan device and build a context over it
    pub fn vulkan(config: DeviceConfig) -> GpuResult<Self> {
        config.validate()?;
        let device = VulkanDevice::new(&config.application_name, config.validation_enabled())?;
        Self::new(device, config)
    }

    /// Resource factory
    pub fn allocator(&self) -> &GpuAllocator {
        &self.allocator
    }

    /// Backend the context drives
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        self.allocator.backend()
    }

    /// Device limits and features
    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.allocator.capabilities()
    }

    /// Whether acceleration structures and shader tables can be created
    pub fn supports_ray_tracing(&self) -> bool {
        self.capabilities().ray_tracing
    }

    /// Frames the CPU may run ahead of the GPU
    pub fn frames_in_flight(&self) -> u32 {
        self.config.frames_in_flight
    }

    /// Active configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Queue an upload for the next [`Self::set_upload_command`]
    ///
    /// After recording, the entry is kept alive for `life_time` frames
    /// (default: the configured upload life time).
    pub fn push_to_uploader(&self, entry: Arc<dyn UploadResource>, life_time: Option<u32>) {
        self.uploader.push(entry, life_time);
    }

    /// Release `item` after `life_time` frame syncs (default: frames in flight)
    pub fn push_to_disposer(&self, item: impl Into<Retired>, life_time: Option<u32>) {
        match item.into() {
            Retired::Resource(resource) => self.resource_disposer.push(resource, life_time),
            Retired::Descriptor(handle) => self.descriptor_disposer.push(handle, life_time),
            Retired::Pipeline(pipeline) => self.pipeline_disposer.push(pipeline, life_time),
        }
    }

    /// Allocate a descriptor from the heap of `kind`
    pub fn allocate_descriptor(&self, kind: DescriptorKind) -> GpuResult<DescriptorHandle> {
        self.heaps.get(kind).allocate()
    }

    /// Heap of `kind`
    pub fn descriptor_heap(&self, kind: DescriptorKind) -> &Arc<DescriptorHeap> {
        self.heaps.get(kind)
    }

    /// Record all pending uploads into `cmd`; returns how many were recorded
    pub fn set_upload_command(&self, cmd: &mut dyn CommandList) -> usize {
        let drained = self.uploader.upload(cmd);
        let count = drained.len();
        for completed in drained {
            self.upload_disposer.push(completed.entry, completed.life_time);
        }
        count
    }

    /// Pending uploads
    pub fn pending_uploads(&self) -> usize {
        self.uploader.len()
    }

    /// Objects waiting in any disposal queue
    pub fn pending_disposals(&self) -> usize {
        self.upload_disposer.len()
            + self.resource_disposer.len()
            + self.pipeline_disposer.len()
            + self.descriptor_disposer.len()
    }

    /// Age every disposal queue by one frame; returns how many objects were released
    pub fn frame_sync(&self) -> usize {
        self.upload_disposer.frame_sync()
            + self.resource_disposer.frame_sync()
            + self.pipeline_disposer.frame_sync()
            + self.descriptor_disposer.frame_sync()
    }

    /// Drain every queue's fence, then release everything awaiting disposal
    pub fn wait_idle(&self) -> GpuResult<()> {
        let backend = self.backend();
        for &queue in &backend.capabilities().supported_queues {
            let value = backend.signal(queue)?;
            backend.wait_for_value(queue, value)?;
        }

        let released = self.upload_disposer.flush()
            + self.resource_disposer.flush()
            + self.pipeline_disposer.flush()
            + self.descriptor_disposer.flush();
        log::debug!("Device idle; released {} deferred objects", released);
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if !self.uploader.is_empty() {
            log::warn!("{} uploads never recorded", self.uploader.len());
        }
        if let Err(e) = self.wait_idle() {
            log::error!("wait_idle failed during shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DescriptorCapacities;
    use crate::gpu::error::GpuError;
    use crate::gpu::headless::{HeadlessCommand, HeadlessConfig, HeadlessDevice};
    use crate::gpu::types::{BufferUsage, QueueKind};
    use crate::raytracing::{Blas, BuildFlags, GeometryDesc, InstanceDescriptor, Tlas, TrianglesDesc};
    use crate::resources::upload::BufferUpload;

    fn context(frames: u32) -> (Arc<HeadlessDevice>, DeviceContext) {
        let device = HeadlessDevice::new();
        let config = DeviceConfig::new("context-test").with_frames_in_flight(frames);
        let ctx = DeviceContext::new(device.clone(), config).unwrap();
        (device, ctx)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let device = HeadlessDevice::new();
        let result = DeviceContext::new(device, DeviceConfig::new("bad").with_frames_in_flight(0));
        assert!(matches!(result, Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn test_reports_capabilities() {
        let (_device, ctx) = context(2);
        assert!(ctx.supports_ray_tracing());
        assert_eq!(ctx.frames_in_flight(), 2);

        let device = HeadlessDevice::with_config(HeadlessConfig::default().without_ray_tracing());
        let plain = DeviceContext::new(device, DeviceConfig::new("plain")).unwrap();
        assert!(!plain.supports_ray_tracing());
    }

    #[test]
    fn test_disposed_buffer_released_after_frames_in_flight() {
        let (device, ctx) = context(3);
        let buffer = ctx
            .allocator()
            .create_device_buffer(256, BufferUsage::STORAGE, true, "particles")
            .unwrap();
        ctx.push_to_disposer(buffer, None);

        assert_eq!(ctx.frame_sync(), 0);
        assert_eq!(ctx.frame_sync(), 0);
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(ctx.frame_sync(), 1);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_upload_staging_outlives_recording() {
        let (device, ctx) = context(2);
        let destination = Arc::new(
            ctx.allocator()
                .create_device_buffer(16, BufferUsage::INDEX, false, "indices")
                .unwrap(),
        );
        let upload = BufferUpload::new(ctx.allocator(), destination.clone(), 0, &[7; 16]).unwrap();
        ctx.push_to_uploader(upload, None);
        assert_eq!(device.live_buffers(), 2);

        let mut list = device.command_list(QueueKind::Copy);
        assert_eq!(ctx.set_upload_command(&mut list), 1);
        assert_eq!(ctx.pending_uploads(), 0);
        device.execute(list).unwrap();
        assert_eq!(device.read_buffer(&destination), vec![7; 16]);

        // Staging stays alive for the upload life time
        assert_eq!(ctx.frame_sync(), 0);
        assert_eq!(device.live_buffers(), 2);
        assert_eq!(ctx.frame_sync(), 1);
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn test_descriptor_reuse_waits_for_disposal() {
        let device = HeadlessDevice::new();
        let config = DeviceConfig::new("descriptors").with_descriptor_capacities(DescriptorCapacities {
            resource: 1,
            ..DescriptorCapacities::default()
        });
        let ctx = DeviceContext::new(device, config).unwrap();

        let handle = ctx.allocate_descriptor(DescriptorKind::Resource).unwrap();
        ctx.push_to_disposer(handle, Some(1));
        assert!(matches!(
            ctx.allocate_descriptor(DescriptorKind::Resource),
            Err(GpuError::DescriptorHeapExhausted { capacity: 1, .. })
        ));

        ctx.frame_sync();
        assert!(ctx.allocate_descriptor(DescriptorKind::Resource).is_ok());
    }

    #[test]
    fn test_pipelines_are_deferred() {
        let (device, ctx) = context(2);
        let pipeline = device.create_pipeline("path tracer");
        ctx.push_to_disposer(pipeline, None);
        ctx.frame_sync();
        assert_eq!(device.live_pipelines(), 1);
        ctx.frame_sync();
        assert_eq!(device.live_pipelines(), 0);
        assert_eq!(device.stats().pipelines_released, 1);
    }

    #[test]
    fn test_retired_structures_release_after_countdown() {
        let (device, ctx) = context(2);
        let geometry = GeometryDesc::triangles(TrianglesDesc::new(0x1000, 12, 3));
        let blas = Blas::new(ctx.allocator(), &[geometry], BuildFlags::empty()).unwrap();
        let tlas = Tlas::new(
            ctx.allocator(),
            &[InstanceDescriptor::new(blas.address())],
            BuildFlags::empty(),
        )
        .unwrap();
        assert_eq!(device.live_buffers(), 5);

        tlas.retire(&ctx);
        blas.retire(&ctx);
        assert_eq!(device.live_buffers(), 5);
        assert_eq!(ctx.pending_disposals(), 5);

        ctx.frame_sync();
        assert_eq!(ctx.frame_sync(), 5);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_wait_idle_flushes_everything() {
        let (device, ctx) = context(4);
        let allocator = ctx.allocator().clone();
        for i in 0..3 {
            let buffer = allocator
                .create_upload_buffer(64, BufferUsage::CONSTANT, format!("constants {i}"))
                .unwrap();
            ctx.push_to_disposer(buffer, None);
        }
        ctx.push_to_disposer(device.create_pipeline("raster"), None);

        ctx.wait_idle().unwrap();
        assert_eq!(ctx.pending_disposals(), 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_pipelines(), 0);
        for queue in [QueueKind::Graphics, QueueKind::Compute, QueueKind::Copy] {
            assert_eq!(device.completed_value(queue), 1);
        }
    }

    #[test]
    fn test_drop_releases_pending_objects() {
        let (device, ctx) = context(8);
        let buffer = ctx
            .allocator()
            .create_upload_buffer(32, BufferUsage::empty(), "leftover")
            .unwrap();
        ctx.push_to_disposer(buffer, None);
        drop(ctx);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_uploaded_vertices_are_visible_to_the_build() {
        let (device, ctx) = context(2);
        let vertices = Arc::new(
            ctx.allocator()
                .create_device_buffer(108, BufferUsage::VERTEX | BufferUsage::ACCELERATION_STRUCTURE_INPUT, false, "vertices")
                .unwrap(),
        );
        ctx.push_to_uploader(BufferUpload::new(ctx.allocator(), vertices.clone(), 0, &[0; 108]).unwrap(), None);
        let geometry = GeometryDesc::triangles(TrianglesDesc::new(vertices.address(), 12, 9));
        let blas = Blas::new(ctx.allocator(), &[geometry], BuildFlags::empty()).unwrap();

        let mut list = device.command_list(QueueKind::Graphics);
        ctx.set_upload_command(&mut list);
        blas.build(&mut list);

        let commands = list.commands();
        assert_eq!(commands.len(), 4);
        assert!(matches!(commands[0], HeadlessCommand::CopyBuffer { dst, .. } if dst == vertices.key()));
        assert_eq!(commands[1], HeadlessCommand::CopyToReadBarrier(vertices.key()));
        assert!(matches!(commands[2], HeadlessCommand::BuildAccelerationStructure { .. }));
        assert_eq!(commands[3], HeadlessCommand::UnorderedAccessBarrier(blas.result_buffer().key()));
        blas.retire(&ctx);
    }

    #[test]
    fn test_context_leaves_logger_to_the_application() {
        let (_device, _ctx) = context(2);
        assert!(env_logger::builder().is_test(true).try_init().is_ok());
    }
}
