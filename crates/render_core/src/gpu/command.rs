//! Command recording interface
//!
//! Submission is owned by the caller; the core only records copies, builds
//! and barriers into whatever list is active for the frame.

use crate::gpu::handles::{GpuBuffer, GpuTexture};
use crate::gpu::types::{QueueKind, ResourceState};
use crate::raytracing::{BuildFlags, BuildInputs};

/// Everything a backend needs to record one acceleration structure build
#[derive(Debug, Clone, Copy)]
pub struct BuildDesc<'a> {
    /// Geometry or instances
    pub inputs: &'a BuildInputs,
    /// Build flags, verbatim
    pub flags: BuildFlags,
    /// Result storage
    pub destination: &'a GpuBuffer,
    /// Structure to update from; `None` for a full build
    pub source: Option<&'a GpuBuffer>,
    /// Scratch memory
    pub scratch: &'a GpuBuffer,
}

impl BuildDesc<'_> {
    /// Whether this records an in-place update rather than a full build
    pub fn is_update(&self) -> bool {
        self.source.is_some()
    }
}

/// Synchronization between recorded commands
#[derive(Debug, Clone, Copy)]
pub enum ResourceBarrier<'a> {
    /// Order all reads/writes of a buffer before later ones
    UnorderedAccess(&'a GpuBuffer),
    /// Make a copy into a buffer visible to later reads, including build inputs
    CopyToRead(&'a GpuBuffer),
    /// Change the usage state of a texture
    Transition {
        /// Texture to transition
        texture: &'a GpuTexture,
        /// Current state
        before: ResourceState,
        /// Target state
        after: ResourceState,
    },
}

/// Placement of one texture subresource inside a staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFootprint {
    /// Byte offset of the first row
    pub offset: u64,
    /// Distance between rows in bytes
    pub row_pitch: u64,
    /// Width in texels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Mip level
    pub mip_level: u32,
    /// Array layer
    pub array_layer: u32,
}

/// A command list being recorded for one queue
pub trait CommandList {
    /// Queue this list will be submitted to
    fn queue(&self) -> QueueKind;

    /// Copy a byte range between buffers
    fn copy_buffer(
        &mut self,
        src: &GpuBuffer,
        src_offset: u64,
        dst: &GpuBuffer,
        dst_offset: u64,
        size: u64,
    );

    /// Copy one subresource from a staging buffer into a texture in `CopyDest` state
    fn copy_buffer_to_texture(&mut self, src: &GpuBuffer, dst: &GpuTexture, footprint: &TextureFootprint);

    /// Record an acceleration structure build
    fn build_acceleration_structure(&mut self, desc: &BuildDesc<'_>);

    /// Record a barrier
    fn barrier(&mut self, barrier: &ResourceBarrier<'_>);
}
