//! Mapping from backend-neutral types to Vulkan enums and flags

use ash::vk;

use crate::gpu::types::{
    AccelerationStructureKind, BufferUsage, MemoryPool, ResourceState, TextureFormat, TextureUsage,
};
use crate::raytracing::{BuildFlags, GeometryFlags, IndexFormat, VertexFormat};

pub(crate) fn buffer_usage(usage: BufferUsage, pool: MemoryPool) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::CONSTANT) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) || pool == MemoryPool::DeviceLocalUnordered {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::SHADER_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    flags
}

pub(crate) fn memory_properties(pool: MemoryPool) -> vk::MemoryPropertyFlags {
    match pool {
        MemoryPool::DeviceLocal | MemoryPool::DeviceLocalUnordered => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        MemoryPool::Upload => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    }
}

pub(crate) fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    flags
}

pub(crate) fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
    }
}

pub(crate) fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    match format {
        TextureFormat::D32Float => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Image layout, access mask and pipeline stage a state corresponds to
pub(crate) fn state_info(state: ResourceState) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        ResourceState::Common => (
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        ResourceState::CopyDest => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ResourceState::CopySource => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ResourceState::ShaderResource => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ResourceState::UnorderedAccess => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ResourceState::RenderTarget => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ResourceState::DepthWrite => (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        ResourceState::GenericRead => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::MEMORY_READ,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ResourceState::AccelerationStructure => (
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        ),
    }
}

pub(crate) fn acceleration_structure_type(kind: AccelerationStructureKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

/// `PERFORM_UPDATE` selects the build mode and has no Vulkan flag
pub(crate) fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(BuildFlags::ALLOW_UPDATE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(BuildFlags::ALLOW_COMPACTION) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    if flags.contains(BuildFlags::PREFER_FAST_TRACE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(BuildFlags::PREFER_FAST_BUILD) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    if flags.contains(BuildFlags::MINIMIZE_MEMORY) {
        out |= vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY;
    }
    out
}

pub(crate) fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    let mut out = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::OPAQUE) {
        out |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::NO_DUPLICATE_ANY_HIT) {
        out |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    out
}

pub(crate) fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Half3 => vk::Format::R16G16B16_SFLOAT,
    }
}

pub(crate) fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::U16 => vk::IndexType::UINT16,
        IndexFormat::U32 => vk::IndexType::UINT32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perform_update_has_no_vulkan_flag() {
        let flags = build_flags(BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE);
        assert_eq!(flags, vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE);
    }

    #[test]
    fn test_every_buffer_is_addressable() {
        let flags = buffer_usage(BufferUsage::empty(), MemoryPool::Upload);
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        let unordered = buffer_usage(BufferUsage::empty(), MemoryPool::DeviceLocalUnordered);
        assert!(unordered.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn test_upload_memory_is_coherent() {
        let props = memory_properties(MemoryPool::Upload);
        assert!(props.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
    }
}
