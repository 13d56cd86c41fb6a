//! Build inputs for acceleration structures

use bitflags::bitflags;

use crate::gpu::types::DeviceAddress;

bitflags! {
    /// Build-time trade-offs, passed to the driver verbatim
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        /// Structure may later be updated in place
        const ALLOW_UPDATE = 1 << 0;
        /// Structure may later be compacted
        const ALLOW_COMPACTION = 1 << 1;
        /// Favor trace performance
        const PREFER_FAST_TRACE = 1 << 2;
        /// Favor build performance
        const PREFER_FAST_BUILD = 1 << 3;
        /// Favor a small footprint
        const MINIMIZE_MEMORY = 1 << 4;
        /// Update from the previous build instead of rebuilding
        const PERFORM_UPDATE = 1 << 5;
    }
}

impl BuildFlags {
    /// Whether a build with these flags updates in place
    pub fn performs_update(self) -> bool {
        self.contains(BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE)
    }

    /// The flags with `PERFORM_UPDATE` removed, as used for sizing
    pub fn without_update(self) -> Self {
        self - BuildFlags::PERFORM_UPDATE
    }
}

bitflags! {
    /// Per-geometry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        /// Any-hit shaders are skipped
        const OPAQUE = 1 << 0;
        /// Any-hit is invoked at most once per primitive
        const NO_DUPLICATE_ANY_HIT = 1 << 1;
    }
}

/// Vertex position formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// Three 32-bit floats
    Float3,
    /// Two 32-bit floats, z = 0
    Float2,
    /// Three 16-bit floats (padded to four)
    Half3,
}

/// Index formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
}

/// Triangle geometry referenced by device address
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrianglesDesc {
    /// Address of the first vertex position
    pub vertex_address: DeviceAddress,
    /// Bytes between vertices
    pub vertex_stride: u64,
    /// Number of vertices
    pub vertex_count: u32,
    /// Position format
    pub vertex_format: VertexFormat,
    /// Index buffer, when indexed
    pub index_address: Option<DeviceAddress>,
    /// Number of indices; ignored when not indexed
    pub index_count: u32,
    /// Index format
    pub index_format: IndexFormat,
    /// Address of a row-major 3x4 transform applied during the build
    pub transform_address: Option<DeviceAddress>,
}

impl TrianglesDesc {
    /// Non-indexed float3 triangles
    pub fn new(vertex_address: DeviceAddress, vertex_stride: u64, vertex_count: u32) -> Self {
        Self {
            vertex_address,
            vertex_stride,
            vertex_count,
            vertex_format: VertexFormat::Float3,
            index_address: None,
            index_count: 0,
            index_format: IndexFormat::U32,
            transform_address: None,
        }
    }

    /// Attach an index buffer
    pub fn with_indices(mut self, index_address: DeviceAddress, index_count: u32, format: IndexFormat) -> Self {
        self.index_address = Some(index_address);
        self.index_count = index_count;
        self.index_format = format;
        self
    }

    /// Attach a build-time transform
    pub fn with_transform(mut self, transform_address: DeviceAddress) -> Self {
        self.transform_address = Some(transform_address);
        self
    }

    /// Number of triangles described
    pub fn triangle_count(&self) -> u32 {
        if self.index_address.is_some() {
            self.index_count / 3
        } else {
            self.vertex_count / 3
        }
    }
}

/// Procedural geometry: an array of axis-aligned boxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AabbsDesc {
    /// Address of the first box (six floats)
    pub address: DeviceAddress,
    /// Bytes between boxes
    pub stride: u64,
    /// Number of boxes
    pub count: u32,
}

/// Kind-specific geometry payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeometryKind {
    /// Indexed or non-indexed triangles
    Triangles(TrianglesDesc),
    /// Axis-aligned bounding boxes
    Aabbs(AabbsDesc),
}

/// One piece of geometry in a bottom-level build
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryDesc {
    /// Payload
    pub kind: GeometryKind,
    /// Flags
    pub flags: GeometryFlags,
}

impl GeometryDesc {
    /// Opaque triangles
    pub fn triangles(triangles: TrianglesDesc) -> Self {
        Self {
            kind: GeometryKind::Triangles(triangles),
            flags: GeometryFlags::OPAQUE,
        }
    }

    /// Opaque boxes
    pub fn aabbs(aabbs: AabbsDesc) -> Self {
        Self {
            kind: GeometryKind::Aabbs(aabbs),
            flags: GeometryFlags::OPAQUE,
        }
    }

    /// Replace the flags
    pub fn with_flags(mut self, flags: GeometryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Triangles or boxes in this geometry
    pub fn primitive_count(&self) -> u32 {
        match &self.kind {
            GeometryKind::Triangles(triangles) => triangles.triangle_count(),
            GeometryKind::Aabbs(aabbs) => aabbs.count,
        }
    }
}

/// Inputs of one build, tagged by level
#[derive(Debug, Clone, PartialEq)]
pub enum BuildInputs {
    /// Geometry for a bottom-level structure
    BottomLevel {
        /// Owned copy of the caller's geometry
        geometries: Vec<GeometryDesc>,
    },
    /// Instances for a top-level structure
    TopLevel {
        /// Number of instance descriptors
        instance_count: u32,
        /// Address of the instance descriptor array
        instances: DeviceAddress,
    },
}

impl BuildInputs {
    /// Primitive count per geometry (one entry for top-level builds)
    pub fn primitive_counts(&self) -> Vec<u32> {
        match self {
            BuildInputs::BottomLevel { geometries } => {
                geometries.iter().map(GeometryDesc::primitive_count).collect()
            }
            BuildInputs::TopLevel { instance_count, .. } => vec![*instance_count],
        }
    }

    /// Total primitives (or instances) across the build
    pub fn total_primitives(&self) -> u64 {
        self.primitive_counts().iter().map(|&count| u64::from(count)).sum()
    }

    /// Number of geometry entries
    pub fn geometry_count(&self) -> usize {
        match self {
            BuildInputs::BottomLevel { geometries } => geometries.len(),
            BuildInputs::TopLevel { .. } => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_counts() {
        let plain = TrianglesDesc::new(0x1000, 12, 9);
        assert_eq!(plain.triangle_count(), 3);
        let indexed = plain.with_indices(0x2000, 12, IndexFormat::U16);
        assert_eq!(indexed.triangle_count(), 4);
    }

    #[test]
    fn test_build_input_counts() {
        let inputs = BuildInputs::BottomLevel {
            geometries: vec![
                GeometryDesc::triangles(TrianglesDesc::new(0x1000, 12, 6)),
                GeometryDesc::aabbs(AabbsDesc { address: 0x3000, stride: 24, count: 5 }),
            ],
        };
        assert_eq!(inputs.primitive_counts(), vec![2, 5]);
        assert_eq!(inputs.total_primitives(), 7);

        let top = BuildInputs::TopLevel { instance_count: 4, instances: 0x4000 };
        assert_eq!(top.primitive_counts(), vec![4]);
    }

    #[test]
    fn test_update_requires_both_bits() {
        assert!(!BuildFlags::PERFORM_UPDATE.performs_update());
        assert!((BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE).performs_update());
        assert_eq!(
            (BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE).without_update(),
            BuildFlags::ALLOW_UPDATE
        );
    }
}
