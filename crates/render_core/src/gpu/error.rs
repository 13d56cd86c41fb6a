//! GPU error taxonomy

use ash::vk;
use thiserror::Error;

use crate::gpu::types::{DescriptorKind, QueueKind};

/// Errors raised by device, allocation and build operations
#[derive(Error, Debug)]
pub enum GpuError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The device lacks a feature the operation depends on
    #[error("Unsupported feature: {feature}")]
    Unsupported {
        /// Name of the missing feature
        feature: &'static str,
    },

    /// The requested hardware queue does not exist on this device
    #[error("Queue not available: {0:?}")]
    QueueUnavailable(QueueKind),

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Every descriptor of a heap is in use
    #[error("Descriptor heap {kind:?} exhausted ({capacity} descriptors)")]
    DescriptorHeapExhausted {
        /// Heap that ran out
        kind: DescriptorKind,
        /// Its capacity
        capacity: u32,
    },

    /// Host mapping of a buffer failed
    #[error("Failed to map buffer memory")]
    MapFailed,

    /// An acceleration structure build was requested with no geometry or instances
    #[error("Acceleration structure build has no inputs")]
    EmptyBuild,

    /// The driver reported a zero-sized result for the build inputs
    #[error("Acceleration structure prebuild reported a zero-sized result")]
    ZeroSizedBuild,

    /// A shader table needs at least one record
    #[error("Shader table has no records")]
    EmptyShaderTable,

    /// A shader identifier is shorter than the driver identifier size
    #[error("Shader identifier is {actual} bytes, expected {expected}")]
    InvalidShaderIdentifier {
        /// Driver identifier size
        expected: u32,
        /// Size supplied by the caller
        actual: usize,
    },

    /// Upload would write past the end of its destination
    #[error("Upload of {size} bytes at offset {offset} exceeds destination of {capacity} bytes")]
    UploadOutOfRange {
        /// Destination offset
        offset: u64,
        /// Bytes to write
        size: u64,
        /// Destination size
        capacity: u64,
    },

    /// Texture upload data does not match the texture's subresources
    #[error("Texture upload supplied {actual} subresources, texture has {expected}")]
    SubresourceMismatch {
        /// Subresources in the texture
        expected: u32,
        /// Subresources supplied
        actual: usize,
    },

    /// Device bring-up failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ConfigError),
}

/// Result type for GPU operations
pub type GpuResult<T> = Result<T, GpuError>;
