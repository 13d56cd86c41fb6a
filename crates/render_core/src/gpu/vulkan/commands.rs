//! Command recording for the Vulkan backend

use ash::vk;

use crate::gpu::command::{BuildDesc, CommandList, ResourceBarrier, TextureFootprint};
use crate::gpu::handles::{GpuBuffer, GpuTexture};
use crate::gpu::types::QueueKind;
use crate::gpu::vulkan::convert;
use crate::gpu::vulkan::device::VulkanDevice;
use crate::raytracing::{BuildInputs, GeometryKind};

/// Vulkan geometry descriptions for `inputs`, one per primitive count
pub(crate) fn build_geometries(inputs: &BuildInputs) -> Vec<vk::AccelerationStructureGeometryKHR> {
    match inputs {
        BuildInputs::BottomLevel { geometries } => geometries
            .iter()
            .map(|geometry| {
                let (geometry_type, data) = match &geometry.kind {
                    GeometryKind::Triangles(triangles) => {
                        let data = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                            .vertex_format(convert::vertex_format(triangles.vertex_format))
                            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                                device_address: triangles.vertex_address,
                            })
                            .vertex_stride(triangles.vertex_stride)
                            .max_vertex(triangles.vertex_count.saturating_sub(1))
                            .index_type(match triangles.index_address {
                                Some(_) => convert::index_type(triangles.index_format),
                                None => vk::IndexType::NONE_KHR,
                            })
                            .index_data(vk::DeviceOrHostAddressConstKHR {
                                device_address: triangles.index_address.unwrap_or(0),
                            })
                            .transform_data(vk::DeviceOrHostAddressConstKHR {
                                device_address: triangles.transform_address.unwrap_or(0),
                            })
                            .build();
                        (
                            vk::GeometryTypeKHR::TRIANGLES,
                            vk::AccelerationStructureGeometryDataKHR { triangles: data },
                        )
                    }
                    GeometryKind::Aabbs(aabbs) => {
                        let data = vk::AccelerationStructureGeometryAabbsDataKHR::builder()
                            .data(vk::DeviceOrHostAddressConstKHR {
                                device_address: aabbs.address,
                            })
                            .stride(aabbs.stride)
                            .build();
                        (
                            vk::GeometryTypeKHR::AABBS,
                            vk::AccelerationStructureGeometryDataKHR { aabbs: data },
                        )
                    }
                };
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(geometry_type)
                    .geometry(data)
                    .flags(convert::geometry_flags(geometry.flags))
                    .build()
            })
            .collect(),
        BuildInputs::TopLevel { instances, .. } => {
            let data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: *instances,
                })
                .build();
            vec![vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances: data })
                .build()]
        }
    }
}

/// A command buffer being recorded against a [`VulkanDevice`]
///
/// Submit with [`VulkanDevice::submit`]; dropping an unsubmitted list frees
/// its command buffer.
pub struct VulkanCommandList<'a> {
    device: &'a VulkanDevice,
    queue: QueueKind,
    command_buffer: Option<vk::CommandBuffer>,
}

impl<'a> VulkanCommandList<'a> {
    pub(crate) fn new(device: &'a VulkanDevice, queue: QueueKind, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            queue,
            command_buffer: Some(command_buffer),
        }
    }

    /// Raw command buffer, for recording draws and dispatches alongside
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer.unwrap_or_else(vk::CommandBuffer::null)
    }

    pub(crate) fn queue_kind(&self) -> QueueKind {
        self.queue
    }

    pub(crate) fn take_command_buffer(&mut self) -> Option<vk::CommandBuffer> {
        self.command_buffer.take()
    }

    fn memory_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();
        unsafe {
            self.device.device().cmd_pipeline_barrier(
                self.handle(),
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }
}

impl Drop for VulkanCommandList<'_> {
    fn drop(&mut self) {
        if let Some(command_buffer) = self.command_buffer.take() {
            log::warn!("Command list for {:?} dropped without submission", self.queue);
            self.device.release_command_buffer(self.queue, command_buffer);
        }
    }
}

impl CommandList for VulkanCommandList<'_> {
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
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device.device().cmd_copy_buffer(
                self.handle(),
                self.device.buffer_handle(src.key()),
                self.device.buffer_handle(dst.key()),
                &[region],
            );
        }
    }

    fn copy_buffer_to_texture(&mut self, src: &GpuBuffer, dst: &GpuTexture, footprint: &TextureFootprint) {
        let format = dst.desc().format;
        let region = vk::BufferImageCopy {
            buffer_offset: footprint.offset,
            buffer_row_length: (footprint.row_pitch / u64::from(format.bytes_per_texel())) as u32,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: convert::aspect_mask(format),
                mip_level: footprint.mip_level,
                base_array_layer: footprint.array_layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: footprint.width,
                height: footprint.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.device().cmd_copy_buffer_to_image(
                self.handle(),
                self.device.buffer_handle(src.key()),
                self.device.image_handle(dst.key()),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn build_acceleration_structure(&mut self, desc: &BuildDesc<'_>) {
        let Some(loader) = self.device.acceleration_structure_loader() else {
            log::error!("Acceleration structure build recorded without ray tracing support");
            return;
        };

        let geometries = build_geometries(desc.inputs);
        let ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = desc
            .inputs
            .primitive_counts()
            .into_iter()
            .map(|count| {
                vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(count)
                    .build()
            })
            .collect();

        let mode = if desc.is_update() {
            vk::BuildAccelerationStructureModeKHR::UPDATE
        } else {
            vk::BuildAccelerationStructureModeKHR::BUILD
        };
        let source = desc
            .source
            .map_or_else(vk::AccelerationStructureKHR::null, |buffer| {
                self.device.acceleration_structure_handle(buffer.key())
            });

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(match desc.inputs {
                BuildInputs::BottomLevel { .. } => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                BuildInputs::TopLevel { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            })
            .flags(convert::build_flags(desc.flags))
            .mode(mode)
            .src_acceleration_structure(source)
            .dst_acceleration_structure(self.device.acceleration_structure_handle(desc.destination.key()))
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: desc.scratch.address(),
            })
            .build();

        unsafe {
            loader.cmd_build_acceleration_structures(self.handle(), &[build_info], &[ranges.as_slice()]);
        }
    }

    fn barrier(&mut self, barrier: &ResourceBarrier<'_>) {
        match *barrier {
            ResourceBarrier::UnorderedAccess(buffer) => {
                if buffer.desc().acceleration_structure.is_some() {
                    let access = vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                        | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR;
                    self.memory_barrier(
                        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                        access,
                        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                            | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                        access,
                    );
                } else {
                    let access = vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
                    self.memory_barrier(
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        access,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        access,
                    );
                }
            }
            ResourceBarrier::CopyToRead(_) => {
                self.memory_barrier(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::AccessFlags::SHADER_READ
                        | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                        | vk::AccessFlags::INDEX_READ
                        | vk::AccessFlags::UNIFORM_READ
                        | vk::AccessFlags::TRANSFER_READ,
                );
            }
            ResourceBarrier::Transition { texture, before, after } => {
                let desc = texture.desc();
                let (old_layout, src_access, src_stage) = convert::state_info(before);
                let (new_layout, dst_access, dst_stage) = convert::state_info(after);
                let image_barrier = vk::ImageMemoryBarrier::builder()
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(self.device.image_handle(texture.key()))
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: convert::aspect_mask(desc.format),
                        base_mip_level: 0,
                        level_count: desc.mip_levels,
                        base_array_layer: 0,
                        layer_count: desc.array_layers,
                    })
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .build();
                unsafe {
                    self.device.device().cmd_pipeline_barrier(
                        self.handle(),
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[image_barrier],
                    );
                }
            }
        }
    }
}
