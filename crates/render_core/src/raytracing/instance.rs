//! Top-level instance descriptors
//!
//! The layout matches `VkAccelerationStructureInstanceKHR` (and its D3D12
//! counterpart) bit for bit: 48 bytes of row-major 3x4 transform, two packed
//! 24/8-bit words and the 64-bit address of the referenced BLAS.

use bitflags::bitflags;

use crate::foundation::math::{Mat4, Transform3x4};
use crate::gpu::types::DeviceAddress;

bitflags! {
    /// Per-instance flags stored in the top 8 bits of the second packed word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        /// Disable back-face culling
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        /// Counter-clockwise triangles are front-facing
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        /// Treat all geometry as opaque
        const FORCE_OPAQUE = 1 << 2;
        /// Treat all geometry as non-opaque
        const FORCE_NON_OPAQUE = 1 << 3;
    }
}

const LOW_24_BITS: u32 = 0x00FF_FFFF;

/// One instance of a bottom-level structure inside a top-level build
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceDescriptor {
    /// Object-to-world transform
    pub transform: Transform3x4,
    /// Custom index (low 24 bits) and visibility mask (high 8 bits)
    pub instance_custom_index_and_mask: u32,
    /// Hit group contribution (low 24 bits) and [`InstanceFlags`] (high 8 bits)
    pub hit_group_offset_and_flags: u32,
    /// Device address of the referenced bottom-level structure
    pub acceleration_structure: DeviceAddress,
}

// SAFETY: repr(C), 48 + 4 + 4 + 8 bytes with no padding
unsafe impl bytemuck::Pod for InstanceDescriptor {}
unsafe impl bytemuck::Zeroable for InstanceDescriptor {}

impl InstanceDescriptor {
    /// Size of one descriptor as consumed by the driver
    pub const SIZE: usize = 64;

    /// Instance of `blas` with identity transform, full mask and no flags
    pub fn new(acceleration_structure: DeviceAddress) -> Self {
        Self {
            transform: Transform3x4::IDENTITY,
            instance_custom_index_and_mask: 0xFF << 24,
            hit_group_offset_and_flags: 0,
            acceleration_structure,
        }
    }

    /// Set the transform from an engine matrix
    pub fn with_matrix(mut self, matrix: &Mat4) -> Self {
        self.transform = Transform3x4::from_matrix(matrix);
        self
    }

    /// Set the transform
    pub fn with_transform(mut self, transform: Transform3x4) -> Self {
        self.transform = transform;
        self
    }

    /// Set the custom index; only the low 24 bits are kept
    pub fn with_custom_index(mut self, index: u32) -> Self {
        self.instance_custom_index_and_mask =
            (self.instance_custom_index_and_mask & !LOW_24_BITS) | (index & LOW_24_BITS);
        self
    }

    /// Set the visibility mask
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_custom_index_and_mask =
            (self.instance_custom_index_and_mask & LOW_24_BITS) | (u32::from(mask) << 24);
        self
    }

    /// Set the hit group contribution; only the low 24 bits are kept
    pub fn with_hit_group_offset(mut self, offset: u32) -> Self {
        self.hit_group_offset_and_flags =
            (self.hit_group_offset_and_flags & !LOW_24_BITS) | (offset & LOW_24_BITS);
        self
    }

    /// Set the instance flags
    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.hit_group_offset_and_flags =
            (self.hit_group_offset_and_flags & LOW_24_BITS) | (u32::from(flags.bits()) << 24);
        self
    }

    /// Custom index
    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & LOW_24_BITS
    }

    /// Visibility mask
    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    /// Hit group contribution
    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_offset_and_flags & LOW_24_BITS
    }

    /// Instance flags; unknown bits are dropped
    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.hit_group_offset_and_flags >> 24) as u8)
    }

    /// Transform as an engine matrix
    pub fn matrix(&self) -> Mat4 {
        self.transform.to_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;

    #[test]
    fn test_layout_is_driver_sized() {
        assert_eq!(std::mem::size_of::<InstanceDescriptor>(), InstanceDescriptor::SIZE);
        assert_eq!(std::mem::align_of::<InstanceDescriptor>(), 8);
    }

    #[test]
    fn test_packed_fields() {
        let instance = InstanceDescriptor::new(0xDEAD_BEEF_0000)
            .with_custom_index(0x0123_4567)
            .with_mask(0x0F)
            .with_hit_group_offset(3)
            .with_flags(InstanceFlags::TRIANGLE_CULL_DISABLE | InstanceFlags::FORCE_OPAQUE);

        assert_eq!(instance.custom_index(), 0x23_4567);
        assert_eq!(instance.mask(), 0x0F);
        assert_eq!(instance.hit_group_offset(), 3);
        assert_eq!(
            instance.flags(),
            InstanceFlags::TRIANGLE_CULL_DISABLE | InstanceFlags::FORCE_OPAQUE
        );
        assert_eq!(instance.instance_custom_index_and_mask, 0x0F23_4567);
        assert_eq!(instance.hit_group_offset_and_flags, 0x0500_0003);
    }

    #[test]
    fn test_byte_encoding() {
        let instance = InstanceDescriptor::new(0x1122_3344_5566_7788)
            .with_transform(Transform3x4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        let bytes = bytemuck::bytes_of(&instance);

        assert_eq!(&bytes[12..16], &1.0f32.to_ne_bytes());
        assert_eq!(&bytes[28..32], &2.0f32.to_ne_bytes());
        assert_eq!(&bytes[44..48], &3.0f32.to_ne_bytes());
        assert_eq!(&bytes[48..52], &(0xFFu32 << 24).to_ne_bytes());
        assert_eq!(&bytes[56..64], &0x1122_3344_5566_7788u64.to_ne_bytes());
    }

    #[test]
    fn test_matrix_round_trip() {
        let matrix = Mat4::new_translation(&Vec3::new(-1.0, 0.5, 8.0))
            * Mat4::new_scaling(3.0);
        let instance = InstanceDescriptor::new(0).with_matrix(&matrix);
        assert_eq!(instance.matrix(), matrix);
    }
}
