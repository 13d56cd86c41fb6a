//! Bottom- and top-level acceleration structures
//!
//! Construction queries the backend for conservative sizes and allocates
//! result and scratch memory once. `build` only records commands; the caller
//! submits and fences. Buffers allocated before a failure drop with the
//! error, so a failed `new` releases everything it created.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::context::DeviceContext;
use crate::gpu::allocator::GpuAllocator;
use crate::gpu::backend::PrebuildInfo;
use crate::gpu::command::{BuildDesc, CommandList, ResourceBarrier};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::handles::{GpuBuffer, MappedBuffer};
use crate::gpu::types::{AccelerationStructureKind, BufferUsage, DeviceAddress};
use crate::raytracing::geometry::{BuildFlags, BuildInputs, GeometryDesc};
use crate::raytracing::instance::InstanceDescriptor;

/// Storage and build state shared by [`Blas`] and [`Tlas`]
struct AccelerationStructure {
    inputs: BuildInputs,
    flags: BuildFlags,
    prebuild: PrebuildInfo,
    result: GpuBuffer,
    scratch: GpuBuffer,
    built: AtomicBool,
}

impl AccelerationStructure {
    fn new(
        allocator: &GpuAllocator,
        kind: AccelerationStructureKind,
        inputs: BuildInputs,
        flags: BuildFlags,
        label: &str,
    ) -> GpuResult<Self> {
        let prebuild = allocator
            .backend()
            .acceleration_structure_prebuild_info(&inputs, flags);
        if prebuild.result_size == 0 {
            log::warn!("Prebuild for '{}' reported a zero-sized result", label);
            return Err(GpuError::ZeroSizedBuild);
        }

        let scratch = allocator.create_scratch_buffer(prebuild.scratch_size(flags), format!("{label} scratch"))?;
        let result = allocator.create_acceleration_structure_buffer(kind, prebuild.result_size, label)?;

        log::debug!(
            "Allocated {:?} '{}': {} primitives, result {} bytes, scratch {} bytes",
            kind,
            label,
            inputs.total_primitives(),
            prebuild.result_size,
            scratch.size()
        );

        Ok(Self {
            inputs,
            flags,
            prebuild,
            result,
            scratch,
            built: AtomicBool::new(false),
        })
    }

    fn build(&self, cmd: &mut dyn CommandList) {
        let first_build = !self.built.swap(true, Ordering::AcqRel);
        let update = self.flags.performs_update() && !first_build;
        let flags = if update { self.flags } else { self.flags.without_update() };

        cmd.build_acceleration_structure(&BuildDesc {
            inputs: &self.inputs,
            flags,
            destination: &self.result,
            source: update.then_some(&self.result),
            scratch: &self.scratch,
        });
        cmd.barrier(&ResourceBarrier::UnorderedAccess(&self.result));
    }

    fn set_perform_update(&mut self, perform: bool) {
        self.flags.set(BuildFlags::PERFORM_UPDATE, perform);
    }

    fn retire(self, ctx: &DeviceContext) {
        ctx.push_to_disposer(self.scratch, None);
        ctx.push_to_disposer(self.result, None);
    }
}

/// Bottom-level acceleration structure over triangle or AABB geometry
pub struct Blas {
    inner: AccelerationStructure,
}

impl Blas {
    /// Size and allocate a structure for `geometries`
    ///
    /// The device must support ray tracing; see
    /// [`DeviceContext::supports_ray_tracing`].
    pub fn new(allocator: &GpuAllocator, geometries: &[GeometryDesc], flags: BuildFlags) -> GpuResult<Self> {
        if geometries.is_empty() {
            return Err(GpuError::EmptyBuild);
        }
        let inputs = BuildInputs::BottomLevel {
            geometries: geometries.to_vec(),
        };
        let inner = AccelerationStructure::new(
            allocator,
            AccelerationStructureKind::BottomLevel,
            inputs,
            flags,
            "blas",
        )?;
        Ok(Self { inner })
    }

    /// Record the build followed by an unordered-access barrier on the result
    ///
    /// The first build is always a full build. Later builds update in place
    /// when the flags contain both `ALLOW_UPDATE` and `PERFORM_UPDATE`.
    pub fn build(&self, cmd: &mut dyn CommandList) {
        self.inner.build(cmd);
    }

    /// Toggle in-place updates for subsequent builds
    pub fn set_perform_update(&mut self, perform: bool) {
        self.inner.set_perform_update(perform);
    }

    /// Geometry the structure was sized for
    pub fn geometries(&self) -> &[GeometryDesc] {
        match &self.inner.inputs {
            BuildInputs::BottomLevel { geometries } => geometries,
            BuildInputs::TopLevel { .. } => &[],
        }
    }

    /// Build flags
    pub fn flags(&self) -> BuildFlags {
        self.inner.flags
    }

    /// Sizes reported by the backend
    pub fn prebuild_info(&self) -> PrebuildInfo {
        self.inner.prebuild
    }

    /// GPU address referenced by instance descriptors
    pub fn address(&self) -> DeviceAddress {
        self.inner.result.address()
    }

    /// Result buffer
    pub fn result_buffer(&self) -> &GpuBuffer {
        &self.inner.result
    }

    /// Scratch buffer
    pub fn scratch_buffer(&self) -> &GpuBuffer {
        &self.inner.scratch
    }

    /// Hand the owned buffers to the context for deferred release
    pub fn retire(self, ctx: &DeviceContext) {
        self.inner.retire(ctx);
    }
}

/// Top-level acceleration structure over instances of [`Blas`]es
pub struct Tlas {
    inner: AccelerationStructure,
    instance_buffer: GpuBuffer,
    instance_count: u32,
}

impl Tlas {
    /// Write `instances` to a host-visible buffer, then size and allocate the structure
    pub fn new(allocator: &GpuAllocator, instances: &[InstanceDescriptor], flags: BuildFlags) -> GpuResult<Self> {
        if instances.is_empty() {
            return Err(GpuError::EmptyBuild);
        }
        let instance_count = instances.len() as u32;
        let instance_buffer = allocator.create_upload_buffer(
            (instances.len() * InstanceDescriptor::SIZE) as u64,
            BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            "tlas instances",
        )?;
        instance_buffer.write(0, bytemuck::cast_slice(instances))?;

        let inputs = BuildInputs::TopLevel {
            instance_count,
            instances: instance_buffer.address(),
        };
        let inner = AccelerationStructure::new(
            allocator,
            AccelerationStructureKind::TopLevel,
            inputs,
            flags,
            "tlas",
        )?;

        Ok(Self {
            inner,
            instance_buffer,
            instance_count,
        })
    }

    /// Record the build followed by an unordered-access barrier on the result
    pub fn build(&self, cmd: &mut dyn CommandList) {
        self.inner.build(cmd);
    }

    /// Toggle in-place updates for subsequent builds
    pub fn set_perform_update(&mut self, perform: bool) {
        self.inner.set_perform_update(perform);
    }

    /// Host view of the instance descriptors; unmapped on drop
    ///
    /// Fails with [`GpuError::MapFailed`] while another view is alive.
    pub fn map(&self) -> GpuResult<MappedInstances<'_>> {
        Ok(MappedInstances {
            mapped: self.instance_buffer.map()?,
            count: self.instance_count as usize,
        })
    }

    /// Number of instances
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Build flags
    pub fn flags(&self) -> BuildFlags {
        self.inner.flags
    }

    /// Sizes reported by the backend
    pub fn prebuild_info(&self) -> PrebuildInfo {
        self.inner.prebuild
    }

    /// GPU address bound for ray dispatch
    pub fn address(&self) -> DeviceAddress {
        self.inner.result.address()
    }

    /// Result buffer
    pub fn result_buffer(&self) -> &GpuBuffer {
        &self.inner.result
    }

    /// Scratch buffer
    pub fn scratch_buffer(&self) -> &GpuBuffer {
        &self.inner.scratch
    }

    /// Instance descriptor buffer
    pub fn instance_buffer(&self) -> &GpuBuffer {
        &self.instance_buffer
    }

    /// Hand the owned buffers to the context for deferred release
    pub fn retire(self, ctx: &DeviceContext) {
        ctx.push_to_disposer(self.instance_buffer, None);
        self.inner.retire(ctx);
    }
}

/// Mapped instance descriptors of a [`Tlas`]
pub struct MappedInstances<'a> {
    mapped: MappedBuffer<'a>,
    count: usize,
}

impl MappedInstances<'_> {
    /// Instances as written
    pub fn as_slice(&self) -> &[InstanceDescriptor] {
        let bytes = &self.mapped.as_slice()[..self.count * InstanceDescriptor::SIZE];
        bytemuck::cast_slice(bytes)
    }

    /// Instances, writable; rebuild or update the [`Tlas`] to apply changes
    pub fn as_mut_slice(&mut self) -> &mut [InstanceDescriptor] {
        let len = self.count * InstanceDescriptor::SIZE;
        bytemuck::cast_slice_mut(&mut self.mapped.as_mut_slice()[..len])
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether there are no instances
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// End host access
    pub fn unmap(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessCommand, HeadlessConfig, HeadlessDevice};
    use crate::gpu::types::QueueKind;
    use crate::raytracing::geometry::{AabbsDesc, TrianglesDesc};
    use std::sync::Arc;

    fn triangle_geometry() -> GeometryDesc {
        GeometryDesc::triangles(TrianglesDesc::new(0x1000, 12, 36))
    }

    fn setup(config: HeadlessConfig) -> (Arc<HeadlessDevice>, GpuAllocator) {
        let device = HeadlessDevice::with_config(config);
        let allocator = GpuAllocator::new(device.clone());
        (device, allocator)
    }

    #[test]
    fn test_blas_without_geometry_fails() {
        let (device, allocator) = setup(HeadlessConfig::default());
        let result = Blas::new(&allocator, &[], BuildFlags::PREFER_FAST_TRACE);
        assert!(matches!(result, Err(GpuError::EmptyBuild)));
        assert_eq!(device.stats().buffers_created, 0);
    }

    #[test]
    fn test_tlas_without_instances_fails() {
        let (device, allocator) = setup(HeadlessConfig::default());
        let result = Tlas::new(&allocator, &[], BuildFlags::empty());
        assert!(matches!(result, Err(GpuError::EmptyBuild)));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_zero_prebuild_leaks_nothing() {
        let (device, allocator) =
            setup(HeadlessConfig::default().with_prebuild_override(PrebuildInfo::default()));

        let blas = Blas::new(&allocator, &[triangle_geometry()], BuildFlags::empty());
        assert!(matches!(blas, Err(GpuError::ZeroSizedBuild)));

        let tlas = Tlas::new(&allocator, &[InstanceDescriptor::new(0x2000)], BuildFlags::empty());
        assert!(matches!(tlas, Err(GpuError::ZeroSizedBuild)));

        let stats = device.stats();
        assert_eq!(stats.buffers_created, 1);
        assert_eq!(stats.buffers_released, 1);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_allocation_failure_leaks_nothing() {
        let prebuild = PrebuildInfo {
            result_size: 4096,
            build_scratch_size: 4096,
            update_scratch_size: 0,
        };
        // Room for the instance buffer and scratch but not the result
        let (device, allocator) = setup(
            HeadlessConfig::default()
                .with_prebuild_override(prebuild)
                .with_memory_budget(64 + 4096 + 100),
        );

        let tlas = Tlas::new(&allocator, &[InstanceDescriptor::new(0x2000)], BuildFlags::empty());
        assert!(matches!(tlas, Err(GpuError::OutOfMemory { requested: 4096 })));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_scratch_covers_update_when_allowed() {
        let prebuild = PrebuildInfo {
            result_size: 1024,
            build_scratch_size: 512,
            update_scratch_size: 2048,
        };
        let (_device, allocator) = setup(HeadlessConfig::default().with_prebuild_override(prebuild));

        let static_blas = Blas::new(&allocator, &[triangle_geometry()], BuildFlags::empty()).unwrap();
        assert_eq!(static_blas.scratch_buffer().size(), 512);

        let dynamic_blas = Blas::new(&allocator, &[triangle_geometry()], BuildFlags::ALLOW_UPDATE).unwrap();
        assert_eq!(dynamic_blas.scratch_buffer().size(), 2048);
        assert_eq!(dynamic_blas.result_buffer().size(), 1024);
    }

    #[test]
    fn test_blas_copies_geometry() {
        let (_device, allocator) = setup(HeadlessConfig::default());
        let aabbs = GeometryDesc::aabbs(AabbsDesc {
            address: 0x4000,
            stride: 24,
            count: 8,
        });
        let blas = Blas::new(&allocator, &[triangle_geometry(), aabbs], BuildFlags::empty()).unwrap();
        assert_eq!(blas.geometries().len(), 2);
        assert_eq!(blas.geometries()[1].primitive_count(), 8);
        assert_ne!(blas.address(), 0);
    }

    #[test]
    fn test_tlas_rebuild_does_not_reallocate() {
        let (device, allocator) = setup(HeadlessConfig::default());
        let blas = Blas::new(&allocator, &[triangle_geometry()], BuildFlags::empty()).unwrap();
        let instances = [
            InstanceDescriptor::new(blas.address()),
            InstanceDescriptor::new(blas.address()).with_custom_index(1),
        ];
        let tlas = Tlas::new(&allocator, &instances, BuildFlags::PREFER_FAST_TRACE).unwrap();

        let created = device.stats().buffers_created;
        let address = tlas.address();
        let scratch_address = tlas.scratch_buffer().address();

        let mut list = device.command_list(QueueKind::Compute);
        tlas.build(&mut list);
        tlas.build(&mut list);
        assert_eq!(list.commands().len(), 4);
        assert!(matches!(list.commands()[1], HeadlessCommand::UnorderedAccessBarrier(key) if key == tlas.result_buffer().key()));
        device.execute(list).unwrap();

        assert_eq!(device.stats().buffers_created, created);
        assert_eq!(tlas.address(), address);
        assert_eq!(tlas.scratch_buffer().address(), scratch_address);
        assert_eq!(device.build_count(tlas.result_buffer()), 2);
    }

    #[test]
    fn test_update_follows_first_full_build() {
        let (device, allocator) = setup(HeadlessConfig::default());
        let mut blas = Blas::new(
            &allocator,
            &[triangle_geometry()],
            BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE,
        )
        .unwrap();
        let result_key = blas.result_buffer().key();

        let mut list = device.command_list(QueueKind::Compute);
        blas.build(&mut list);
        blas.build(&mut list);
        blas.set_perform_update(false);
        blas.build(&mut list);

        let sources: Vec<_> = list
            .commands()
            .iter()
            .filter_map(|command| match command {
                HeadlessCommand::BuildAccelerationStructure { source, flags, .. } => Some((*source, *flags)),
                _ => None,
            })
            .collect();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].0, None);
        assert!(!sources[0].1.contains(BuildFlags::PERFORM_UPDATE));
        assert_eq!(sources[1].0, Some(result_key));
        assert_eq!(sources[2].0, None);
    }

    #[test]
    fn test_tlas_map_exposes_instances() {
        let (device, allocator) = setup(HeadlessConfig::default());
        let instances = [
            InstanceDescriptor::new(0x8000).with_mask(0x0F),
            InstanceDescriptor::new(0x9000).with_hit_group_offset(3),
        ];
        let tlas = Tlas::new(&allocator, &instances, BuildFlags::empty()).unwrap();

        let mut mapped = tlas.map().unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped.as_slice(), &instances);
        let widened = mapped.as_slice()[0].with_mask(0xFF);
        mapped.as_mut_slice()[0] = widened;
        mapped.unmap();

        let bytes = device.read_buffer(tlas.instance_buffer());
        let first: InstanceDescriptor = bytemuck::pod_read_unaligned(&bytes[..InstanceDescriptor::SIZE]);
        let second: InstanceDescriptor = bytemuck::pod_read_unaligned(&bytes[InstanceDescriptor::SIZE..]);
        assert_eq!(first.mask(), 0xFF);
        assert_eq!(second.hit_group_offset(), 3);
    }

    #[test]
    fn test_tlas_allows_one_mapping_at_a_time() {
        let (_device, allocator) = setup(HeadlessConfig::default());
        let tlas = Tlas::new(&allocator, &[InstanceDescriptor::new(0x8000)], BuildFlags::empty()).unwrap();

        let mut first = tlas.map().unwrap();
        assert!(matches!(tlas.map(), Err(GpuError::MapFailed)));
        first.as_mut_slice()[0] = InstanceDescriptor::new(0x8000).with_mask(0x11);
        first.unmap();

        let second = tlas.map().unwrap();
        assert_eq!(second.as_slice()[0].mask(), 0x11);
    }
}
