//! Backend-neutral resource descriptions

use bitflags::bitflags;

/// GPU virtual address of a buffer or acceleration structure
pub type DeviceAddress = u64;

/// Hardware queue a command list is submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics, compute and copy work
    Graphics,
    /// Async compute
    Compute,
    /// Dedicated transfer
    Copy,
    /// Video decode
    VideoDecode,
    /// Video processing
    VideoProcess,
    /// Video encode
    VideoEncode,
}

impl QueueKind {
    /// Every queue kind, in fence-draining order
    pub const ALL: [QueueKind; 6] = [
        QueueKind::Graphics,
        QueueKind::Compute,
        QueueKind::Copy,
        QueueKind::VideoDecode,
        QueueKind::VideoProcess,
        QueueKind::VideoEncode,
    ];
}

/// Memory pool a buffer is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    /// Device-local, GPU read/write
    DeviceLocal,
    /// Device-local with unordered (storage) access
    DeviceLocalUnordered,
    /// Host-visible, written by the CPU and read by the GPU
    Upload,
}

impl MemoryPool {
    /// Whether the CPU can map buffers from this pool
    pub fn is_host_visible(self) -> bool {
        matches!(self, MemoryPool::Upload)
    }
}

bitflags! {
    /// How a buffer will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Source of copy commands
        const COPY_SRC = 1 << 0;
        /// Destination of copy commands
        const COPY_DST = 1 << 1;
        /// Vertex fetch
        const VERTEX = 1 << 2;
        /// Index fetch
        const INDEX = 1 << 3;
        /// Constant/uniform reads
        const CONSTANT = 1 << 4;
        /// Storage (unordered access)
        const STORAGE = 1 << 5;
        /// Backing storage of an acceleration structure
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 6;
        /// Read-only input to an acceleration structure build
        const ACCELERATION_STRUCTURE_INPUT = 1 << 7;
        /// Shader record table
        const SHADER_TABLE = 1 << 8;
    }
}

bitflags! {
    /// How a texture will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Destination of copy commands
        const COPY_DST = 1 << 0;
        /// Source of copy commands
        const COPY_SRC = 1 << 1;
        /// Sampled in shaders
        const SAMPLED = 1 << 2;
        /// Storage image
        const STORAGE = 1 << 3;
        /// Color attachment
        const RENDER_TARGET = 1 << 4;
        /// Depth/stencil attachment
        const DEPTH_STENCIL = 1 << 5;
    }
}

/// Usage state a resource is in between commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// No particular usage; freshly created
    Common,
    /// Written by copy commands
    CopyDest,
    /// Read by copy commands
    CopySource,
    /// Read by shaders
    ShaderResource,
    /// Read/written by shaders
    UnorderedAccess,
    /// Color attachment
    RenderTarget,
    /// Depth attachment
    DepthWrite,
    /// Any read-only usage; the state of upload memory
    GenericRead,
    /// Acceleration structure storage
    AccelerationStructure,
}

/// Texel formats supported for uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8-bit single channel
    R8Unorm,
    /// 8-bit RGBA
    Rgba8Unorm,
    /// 8-bit RGBA, sRGB encoded
    Rgba8Srgb,
    /// 16-bit float RGBA
    Rgba16Float,
    /// 32-bit float single channel
    R32Float,
    /// 32-bit float RGBA
    Rgba32Float,
    /// 32-bit float depth
    D32Float,
}

impl TextureFormat {
    /// Size of one texel in bytes
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8Srgb
            | TextureFormat::R32Float
            | TextureFormat::D32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Optimized clear value bound to a render target or depth texture
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// RGBA color
    Color([f32; 4]),
    /// Depth and stencil
    DepthStencil {
        /// Depth value
        depth: f32,
        /// Stencil value
        stencil: u8,
    },
}

/// Level of an acceleration structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    /// Indexes raw geometry
    BottomLevel,
    /// Indexes instances of bottom-level structures
    TopLevel,
}

/// Descriptor heap kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Constant/shader-resource/unordered-access views
    Resource,
    /// Samplers
    Sampler,
    /// Render target views
    RenderTarget,
    /// Depth stencil views
    DepthStencil,
}

impl DescriptorKind {
    /// Every heap kind
    pub const ALL: [DescriptorKind; 4] = [
        DescriptorKind::Resource,
        DescriptorKind::Sampler,
        DescriptorKind::RenderTarget,
        DescriptorKind::DepthStencil,
    ];
}

/// Creation parameters for a buffer
#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Memory pool
    pub pool: MemoryPool,
    /// Usage flags
    pub usage: BufferUsage,
    /// State the buffer starts in
    pub initial_state: ResourceState,
    /// Set when the buffer backs an acceleration structure
    pub acceleration_structure: Option<AccelerationStructureKind>,
    /// Debug name
    pub label: String,
}

impl BufferDesc {
    /// Describe a buffer in its pool's default initial state
    pub fn new(size: u64, pool: MemoryPool, usage: BufferUsage, label: impl Into<String>) -> Self {
        let initial_state = if pool.is_host_visible() {
            ResourceState::GenericRead
        } else {
            ResourceState::Common
        };
        Self {
            size,
            pool,
            usage,
            initial_state,
            acceleration_structure: None,
            label: label.into(),
        }
    }

    /// Override the initial state
    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}

/// Creation parameters for a 2D texture (optionally mipmapped or layered)
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    /// Width of mip 0
    pub width: u32,
    /// Height of mip 0
    pub height: u32,
    /// Mip levels
    pub mip_levels: u32,
    /// Array layers
    pub array_layers: u32,
    /// Texel format
    pub format: TextureFormat,
    /// Usage flags
    pub usage: TextureUsage,
    /// State the texture starts in
    pub initial_state: ResourceState,
    /// Optimized clear value
    pub clear_value: Option<ClearValue>,
    /// Debug name
    pub label: String,
}

impl TextureDesc {
    /// A sampled texture that can receive uploads
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, label: impl Into<String>) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            initial_state: ResourceState::Common,
            clear_value: None,
            label: label.into(),
        }
    }

    /// Set mip level count
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Set array layer count
    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    /// Bind a clear value
    pub fn with_clear_value(mut self, clear_value: ClearValue) -> Self {
        self.clear_value = Some(clear_value);
        self
    }

    /// Number of subresources (mips times layers)
    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }

    /// Width and height of a mip level, never below 1
    pub fn mip_extent(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }
}

/// Device limits and features the core depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Human readable adapter name
    pub device_name: String,
    /// Hardware ray tracing available
    pub ray_tracing: bool,
    /// Size of a shader identifier in bytes
    pub shader_identifier_size: u32,
    /// Alignment of each shader record
    pub shader_record_alignment: u32,
    /// Alignment of the start of a shader table
    pub shader_table_alignment: u32,
    /// Alignment of acceleration structure scratch memory
    pub scratch_alignment: u64,
    /// Row pitch alignment for buffer-to-texture copies
    pub texture_row_pitch_alignment: u64,
    /// Offset alignment of each subresource in a staging buffer
    pub texture_placement_alignment: u64,
    /// Queues the device exposes
    pub supported_queues: Vec<QueueKind>,
}

impl DeviceCapabilities {
    /// Whether `queue` is present
    pub fn supports_queue(&self, queue: QueueKind) -> bool {
        self.supported_queues.contains(&queue)
    }
}

/// Address and size of a GPU-visible range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuAddressRange {
    /// Start address
    pub address: DeviceAddress,
    /// Size in bytes
    pub size: u64,
}

/// Address, size and element stride of a GPU-visible range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuAddressRangeAndStride {
    /// Start address
    pub address: DeviceAddress,
    /// Size in bytes
    pub size: u64,
    /// Distance between elements in bytes
    pub stride: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_buffers_start_readable() {
        let desc = BufferDesc::new(64, MemoryPool::Upload, BufferUsage::COPY_SRC, "staging");
        assert_eq!(desc.initial_state, ResourceState::GenericRead);
        let desc = BufferDesc::new(64, MemoryPool::DeviceLocal, BufferUsage::VERTEX, "vb");
        assert_eq!(desc.initial_state, ResourceState::Common);
    }

    #[test]
    fn test_mip_extent_clamps() {
        let desc = TextureDesc::new_2d(16, 4, TextureFormat::Rgba8Unorm, "t").with_mip_levels(5);
        assert_eq!(desc.mip_extent(0), (16, 4));
        assert_eq!(desc.mip_extent(2), (4, 1));
        assert_eq!(desc.mip_extent(4), (1, 1));
        assert_eq!(desc.subresource_count(), 5);
    }
}
