//! Vulkan implementation of [`GpuBackend`]
//!
//! Owns the logical device, one timeline semaphore per queue kind (the
//! queue's completion fence) and a slot table of every buffer, image and
//! adopted pipeline created through it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::extensions::khr::{AccelerationStructure, DeferredHostOperations, RayTracingPipeline};
use ash::{vk, Device, Instance};
use slotmap::SlotMap;

use crate::gpu::backend::{BufferKey, GpuBackend, PipelineKey, PrebuildInfo, TextureKey};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::handles::PipelineHandle;
use crate::gpu::types::{BufferDesc, DeviceAddress, DeviceCapabilities, QueueKind, TextureDesc};
use crate::gpu::vulkan::commands::{build_geometries, VulkanCommandList};
use crate::gpu::vulkan::convert;
use crate::gpu::vulkan::instance::VulkanInstance;
use crate::raytracing::{BuildFlags, BuildInputs};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn map_allocation_error(result: vk::Result, requested: u64) -> GpuError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GpuError::OutOfMemory { requested }
        }
        other => GpuError::Api(other),
    }
}

struct BufferEntry {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    acceleration_structure: Option<vk::AccelerationStructureKHR>,
    address: DeviceAddress,
}

struct TextureEntry {
    image: vk::Image,
    memory: vk::DeviceMemory,
}

#[derive(Default)]
struct Objects {
    buffers: SlotMap<BufferKey, BufferEntry>,
    textures: SlotMap<TextureKey, TextureEntry>,
    pipelines: SlotMap<PipelineKey, vk::Pipeline>,
}

struct SubmissionState {
    command_pool: vk::CommandPool,
    last_value: u64,
    in_flight: VecDeque<(u64, vk::CommandBuffer)>,
}

struct QueueSlot {
    family: u32,
    queue: vk::Queue,
    timeline: vk::Semaphore,
    submission: Mutex<SubmissionState>,
}

/// Physical device chosen for rendering
struct PhysicalDeviceInfo {
    device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    families: HashMap<QueueKind, u32>,
    ray_tracing: bool,
}

impl PhysicalDeviceInfo {
    fn required_ray_tracing_extensions() -> [&'static CStr; 3] {
        [
            AccelerationStructure::name(),
            RayTracingPipeline::name(),
            DeferredHostOperations::name(),
        ]
    }

    fn select(instance: &Instance) -> GpuResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(GpuError::Api)? };

        let mut best: Option<(u32, Self)> = None;
        for device in devices {
            let Some(candidate) = Self::evaluate(instance, device)? else {
                continue;
            };
            let mut score = 0;
            if candidate.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                score += 2;
            }
            if candidate.ray_tracing {
                score += 4;
            }
            if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                best = Some((score, candidate));
            }
        }

        let (_, selected) =
            best.ok_or_else(|| GpuError::InitializationFailed("No suitable GPU found".to_string()))?;
        log::info!("Selected GPU: {}", unsafe {
            CStr::from_ptr(selected.properties.device_name.as_ptr()).to_string_lossy()
        });
        Ok(selected)
    }

    fn evaluate(instance: &Instance, device: vk::PhysicalDevice) -> GpuResult<Option<Self>> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_2 {
            return Ok(None);
        }

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features12);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
        }
        if features12.timeline_semaphore == vk::FALSE || features12.buffer_device_address == vk::FALSE {
            return Ok(None);
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
            queue_families
                .iter()
                .position(|family| family.queue_flags.contains(required) && !family.queue_flags.intersects(excluded))
                .map(|index| index as u32)
        };
        let Some(graphics) = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty()) else {
            return Ok(None);
        };
        let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(graphics);
        let copy = find(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            .unwrap_or(compute);

        let families = HashMap::from([
            (QueueKind::Graphics, graphics),
            (QueueKind::Compute, compute),
            (QueueKind::Copy, copy),
        ]);

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(GpuError::Api)?
        };
        let ray_tracing = Self::required_ray_tracing_extensions().iter().all(|required| {
            extensions.iter().any(|available| {
                let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                name == *required
            })
        });

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

        Ok(Some(Self {
            device,
            properties,
            memory_properties,
            families,
            ray_tracing,
        }))
    }
}

/// Vulkan device backing a [`crate::DeviceContext`]
pub struct VulkanDevice {
    objects: Mutex<Objects>,
    queues: HashMap<QueueKind, QueueSlot>,
    submit_lock: Mutex<()>,
    acceleration_structure: Option<AccelerationStructure>,
    capabilities: DeviceCapabilities,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: Device,
    instance: VulkanInstance,
}

impl VulkanDevice {
    /// Bring up an instance and logical device with graphics, compute and copy queues
    ///
    /// Ray tracing extensions are enabled when the selected GPU exposes them;
    /// [`DeviceCapabilities::ray_tracing`] reports the outcome.
    pub fn new(app_name: &str, enable_validation: bool) -> GpuResult<Arc<Self>> {
        let instance = VulkanInstance::new(app_name, enable_validation)?;
        let physical = PhysicalDeviceInfo::select(&instance.instance)?;

        let unique_families: HashSet<u32> = physical.families.values().copied().collect();
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extension_ptrs: Vec<*const c_char> = if physical.ray_tracing {
            PhysicalDeviceInfo::required_ray_tracing_extensions()
                .iter()
                .map(|name| name.as_ptr())
                .collect()
        } else {
            Vec::new()
        };

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .buffer_device_address(true);
        let mut as_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut rt_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features12);
        if physical.ray_tracing {
            create_info = create_info.push_next(&mut as_features).push_next(&mut rt_features);
        }

        let device = unsafe {
            instance
                .instance
                .create_device(physical.device, &create_info, None)
                .map_err(GpuError::Api)?
        };

        let capabilities = Self::query_capabilities(&instance.instance, &physical);
        let acceleration_structure = physical
            .ray_tracing
            .then(|| AccelerationStructure::new(&instance.instance, &device));

        let mut queues = HashMap::new();
        for (&kind, &family) in &physical.families {
            match Self::create_queue_slot(&device, family) {
                Ok(slot) => {
                    queues.insert(kind, slot);
                }
                Err(e) => {
                    unsafe {
                        for slot in queues.values() {
                            Self::destroy_queue_slot(&device, slot);
                        }
                        device.destroy_device(None);
                    }
                    return Err(e);
                }
            }
        }

        log::info!(
            "Vulkan device ready: ray tracing {}, queue families {:?}",
            capabilities.ray_tracing,
            physical.families
        );

        Ok(Arc::new(Self {
            objects: Mutex::new(Objects::default()),
            queues,
            submit_lock: Mutex::new(()),
            acceleration_structure,
            capabilities,
            memory_properties: physical.memory_properties,
            device,
            instance,
        }))
    }

    fn query_capabilities(instance: &Instance, physical: &PhysicalDeviceInfo) -> DeviceCapabilities {
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        if physical.ray_tracing {
            let mut properties2 = vk::PhysicalDeviceProperties2::builder()
                .push_next(&mut rt_properties)
                .push_next(&mut as_properties);
            unsafe { instance.get_physical_device_properties2(physical.device, &mut properties2) };
        }

        let limits = &physical.properties.limits;
        let device_name = unsafe { CStr::from_ptr(physical.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        DeviceCapabilities {
            device_name,
            ray_tracing: physical.ray_tracing,
            shader_identifier_size: rt_properties.shader_group_handle_size,
            shader_record_alignment: rt_properties.shader_group_handle_alignment.max(1),
            shader_table_alignment: rt_properties.shader_group_base_alignment.max(1),
            scratch_alignment: u64::from(as_properties.min_acceleration_structure_scratch_offset_alignment.max(1)),
            texture_row_pitch_alignment: limits.optimal_buffer_copy_row_pitch_alignment.max(1),
            texture_placement_alignment: limits.optimal_buffer_copy_offset_alignment.max(1),
            supported_queues: vec![QueueKind::Graphics, QueueKind::Compute, QueueKind::Copy],
        }
    }

    fn create_queue_slot(device: &Device, family: u32) -> GpuResult<QueueSlot> {
        let queue = unsafe { device.get_device_queue(family, 0) };

        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let timeline = unsafe { device.create_semaphore(&semaphore_info, None).map_err(GpuError::Api)? };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_semaphore(timeline, None) };
                return Err(GpuError::Api(e));
            }
        };

        Ok(QueueSlot {
            family,
            queue,
            timeline,
            submission: Mutex::new(SubmissionState {
                command_pool,
                last_value: 0,
                in_flight: VecDeque::new(),
            }),
        })
    }

    unsafe fn destroy_queue_slot(device: &Device, slot: &QueueSlot) {
        let submission = lock(&slot.submission);
        device.destroy_command_pool(submission.command_pool, None);
        device.destroy_semaphore(slot.timeline, None);
    }

    /// Logical device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Queue family used for `queue`
    pub fn queue_family(&self, queue: QueueKind) -> Option<u32> {
        self.queues.get(&queue).map(|slot| slot.family)
    }

    fn slot(&self, queue: QueueKind) -> GpuResult<&QueueSlot> {
        self.queues.get(&queue).ok_or(GpuError::QueueUnavailable(queue))
    }

    pub(crate) fn acceleration_structure_loader(&self) -> Option<&AccelerationStructure> {
        self.acceleration_structure.as_ref()
    }

    fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> GpuResult<u32> {
        let memory = &self.memory_properties;
        (0..memory.memory_type_count)
            .find(|&i| {
                type_filter & (1 << i) != 0
                    && memory.memory_types[i as usize].property_flags.contains(properties)
            })
            .ok_or(GpuError::NoSuitableMemoryType)
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        device_address: bool,
    ) -> GpuResult<vk::DeviceMemory> {
        let memory_type_index = self.find_memory_type(requirements.memory_type_bits, properties)?;
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if device_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }
        unsafe {
            self.device
                .allocate_memory(&alloc_info, None)
                .map_err(|e| map_allocation_error(e, requirements.size))
        }
    }

    /// Take ownership of a pipeline built elsewhere; destroyed when the handle drops
    pub fn adopt_pipeline(self: &Arc<Self>, pipeline: vk::Pipeline, label: impl Into<String>) -> PipelineHandle {
        let key = lock(&self.objects).pipelines.insert(pipeline);
        let backend: Arc<dyn GpuBackend> = Arc::clone(self) as Arc<dyn GpuBackend>;
        PipelineHandle::new(backend, key, label)
    }

    pub(crate) fn buffer_handle(&self, key: BufferKey) -> vk::Buffer {
        lock(&self.objects)
            .buffers
            .get(key)
            .map_or_else(vk::Buffer::null, |entry| entry.buffer)
    }

    pub(crate) fn acceleration_structure_handle(&self, key: BufferKey) -> vk::AccelerationStructureKHR {
        lock(&self.objects)
            .buffers
            .get(key)
            .and_then(|entry| entry.acceleration_structure)
            .unwrap_or_else(vk::AccelerationStructureKHR::null)
    }

    pub(crate) fn image_handle(&self, key: TextureKey) -> vk::Image {
        lock(&self.objects)
            .textures
            .get(key)
            .map_or_else(vk::Image::null, |entry| entry.image)
    }

    /// Allocate and begin a one-time command buffer for `queue`
    pub fn begin_command_list(&self, queue: QueueKind) -> GpuResult<VulkanCommandList<'_>> {
        let slot = self.slot(queue)?;
        let mut submission = lock(&slot.submission);
        self.reclaim(slot, &mut submission);

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(submission.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(GpuError::Api)?
                .into_iter()
                .next()
                .ok_or(GpuError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?
        };

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) } {
            unsafe {
                self.device
                    .free_command_buffers(submission.command_pool, &[command_buffer]);
            }
            return Err(GpuError::Api(e));
        }

        Ok(VulkanCommandList::new(self, queue, command_buffer))
    }

    /// End and submit a command list; returns the fence value that marks its completion
    pub fn submit(&self, mut list: VulkanCommandList<'_>) -> GpuResult<u64> {
        let queue = list.queue_kind();
        let Some(command_buffer) = list.take_command_buffer() else {
            return self.signal(queue);
        };
        if let Err(e) = unsafe { self.device.end_command_buffer(command_buffer) } {
            self.release_command_buffer(queue, command_buffer);
            return Err(GpuError::Api(e));
        }
        self.submit_to(queue, Some(command_buffer))
    }

    pub(crate) fn release_command_buffer(&self, queue: QueueKind, command_buffer: vk::CommandBuffer) {
        if let Ok(slot) = self.slot(queue) {
            let submission = lock(&slot.submission);
            unsafe {
                self.device
                    .free_command_buffers(submission.command_pool, &[command_buffer]);
            }
        }
    }

    fn submit_to(&self, queue: QueueKind, command_buffer: Option<vk::CommandBuffer>) -> GpuResult<u64> {
        let slot = self.slot(queue)?;
        let mut submission = lock(&slot.submission);
        let value = submission.last_value + 1;

        let command_buffers: Vec<vk::CommandBuffer> = command_buffer.into_iter().collect();
        let signal_values = [value];
        let signal_semaphores = [slot.timeline];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let result = {
            let _guard = lock(&self.submit_lock);
            unsafe {
                self.device
                    .queue_submit(slot.queue, &[submit_info.build()], vk::Fence::null())
            }
        };
        if let Err(e) = result {
            log::error!("Submission to {:?} failed: {:?}", queue, e);
            for &cmd in &command_buffers {
                unsafe { self.device.free_command_buffers(submission.command_pool, &[cmd]) };
            }
            return Err(GpuError::Api(e));
        }

        submission.last_value = value;
        if let Some(cmd) = command_buffer {
            submission.in_flight.push_back((value, cmd));
        }
        Ok(value)
    }

    fn reclaim(&self, slot: &QueueSlot, submission: &mut SubmissionState) {
        let completed = unsafe { self.device.get_semaphore_counter_value(slot.timeline) }.unwrap_or(0);
        while let Some(&(value, cmd)) = submission.in_flight.front() {
            if value > completed {
                break;
            }
            unsafe { self.device.free_command_buffers(submission.command_pool, &[cmd]) };
            submission.in_flight.pop_front();
        }
    }

    fn destroy_buffer_entry(&self, entry: BufferEntry) {
        unsafe {
            if let (Some(handle), Some(loader)) = (entry.acceleration_structure, &self.acceleration_structure) {
                loader.destroy_acceleration_structure(handle, None);
            }
            self.device.destroy_buffer(entry.buffer, None);
            self.device.free_memory(entry.memory, None);
        }
    }
}

impl GpuBackend for VulkanDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferKey> {
        let size = desc.size.max(1);
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(convert::buffer_usage(desc.usage, desc.pool))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(|e| map_allocation_error(e, size))?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory = match self.allocate_memory(requirements, convert::memory_properties(desc.pool), true) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut entry = BufferEntry {
            buffer,
            memory,
            acceleration_structure: None,
            address: 0,
        };

        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            self.destroy_buffer_entry(entry);
            return Err(GpuError::Api(e));
        }

        if let Some(kind) = desc.acceleration_structure {
            let Some(loader) = &self.acceleration_structure else {
                self.destroy_buffer_entry(entry);
                return Err(GpuError::Unsupported {
                    feature: "VK_KHR_acceleration_structure",
                });
            };
            let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
                .buffer(buffer)
                .size(size)
                .ty(convert::acceleration_structure_type(kind));
            match unsafe { loader.create_acceleration_structure(&create_info, None) } {
                Ok(handle) => {
                    entry.acceleration_structure = Some(handle);
                    let address_info =
                        vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
                    entry.address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };
                }
                Err(e) => {
                    self.destroy_buffer_entry(entry);
                    return Err(GpuError::Api(e));
                }
            }
        } else {
            let address_info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
            entry.address = unsafe { self.device.get_buffer_device_address(&address_info) };
        }

        Ok(lock(&self.objects).buffers.insert(entry))
    }

    fn destroy_buffer(&self, key: BufferKey) {
        let entry = lock(&self.objects).buffers.remove(key);
        if let Some(entry) = entry {
            self.destroy_buffer_entry(entry);
        }
    }

    fn buffer_device_address(&self, key: BufferKey) -> DeviceAddress {
        lock(&self.objects).buffers.get(key).map_or(0, |entry| entry.address)
    }

    fn map_buffer(&self, key: BufferKey) -> GpuResult<NonNull<u8>> {
        let memory = lock(&self.objects)
            .buffers
            .get(key)
            .map(|entry| entry.memory)
            .ok_or(GpuError::MapFailed)?;
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(|e| {
                    log::error!("vkMapMemory failed: {:?}", e);
                    GpuError::MapFailed
                })?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(GpuError::MapFailed)
    }

    fn unmap_buffer(&self, key: BufferKey) {
        if let Some(entry) = lock(&self.objects).buffers.get(key) {
            unsafe { self.device.unmap_memory(entry.memory) };
        }
    }

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<TextureKey> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::texture_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::texture_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None).map_err(GpuError::Api)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = match self.allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL, false) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
            }
            return Err(GpuError::Api(e));
        }

        Ok(lock(&self.objects).textures.insert(TextureEntry { image, memory }))
    }

    fn destroy_texture(&self, key: TextureKey) {
        let entry = lock(&self.objects).textures.remove(key);
        if let Some(entry) = entry {
            unsafe {
                self.device.destroy_image(entry.image, None);
                self.device.free_memory(entry.memory, None);
            }
        }
    }

    fn destroy_pipeline(&self, key: PipelineKey) {
        let pipeline = lock(&self.objects).pipelines.remove(key);
        if let Some(pipeline) = pipeline {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }

    fn acceleration_structure_prebuild_info(&self, inputs: &BuildInputs, flags: BuildFlags) -> PrebuildInfo {
        let Some(loader) = &self.acceleration_structure else {
            log::warn!("Prebuild query without VK_KHR_acceleration_structure");
            return PrebuildInfo::default();
        };
        let geometries = build_geometries(inputs);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(match inputs {
                BuildInputs::BottomLevel { .. } => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                BuildInputs::TopLevel { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            })
            .flags(convert::build_flags(flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &inputs.primitive_counts(),
            )
        };
        PrebuildInfo {
            result_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }

    fn signal(&self, queue: QueueKind) -> GpuResult<u64> {
        self.submit_to(queue, None)
    }

    fn completed_value(&self, queue: QueueKind) -> u64 {
        self.queues
            .get(&queue)
            .and_then(|slot| unsafe { self.device.get_semaphore_counter_value(slot.timeline) }.ok())
            .unwrap_or(0)
    }

    fn wait_for_value(&self, queue: QueueKind, value: u64) -> GpuResult<()> {
        let slot = self.slot(queue)?;
        let semaphores = [slot.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe {
            self.device
                .wait_semaphores(&wait_info, u64::MAX)
                .map_err(GpuError::Api)
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device_wait_idle failed during shutdown: {:?}", e);
            }
        }

        let objects = std::mem::take(&mut *lock(&self.objects));
        let leaked = objects.buffers.len() + objects.textures.len() + objects.pipelines.len();
        if leaked > 0 {
            log::warn!("{} GPU objects still alive at device shutdown", leaked);
        }
        for (_, entry) in objects.buffers {
            self.destroy_buffer_entry(entry);
        }
        unsafe {
            for (_, entry) in objects.textures {
                self.device.destroy_image(entry.image, None);
                self.device.free_memory(entry.memory, None);
            }
            for (_, pipeline) in objects.pipelines {
                self.device.destroy_pipeline(pipeline, None);
            }
            for slot in self.queues.values() {
                Self::destroy_queue_slot(&self.device, slot);
            }
            self.device.destroy_device(None);
        }
        log::debug!("Vulkan device destroyed");
    }
}
