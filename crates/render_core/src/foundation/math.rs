//! Math utilities and types
//!
//! The engine matrix type is nalgebra's [`Mat4`], which uses the column-vector
//! convention: translation lives in the last column and the bottom row of an
//! affine transform is `(0, 0, 0, 1)`. Ray-tracing instance descriptors store
//! only the upper three rows, row-major, as a [`Transform3x4`].

pub use nalgebra::{Matrix4, Vector3};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Row-major 3x4 affine transform with an implicit `(0, 0, 0, 1)` fourth row
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3x4 {
    /// Three rows of four floats
    pub rows: [[f32; 4]; 3],
}

// SAFETY: plain array of f32 with no padding
unsafe impl bytemuck::Pod for Transform3x4 {}
unsafe impl bytemuck::Zeroable for Transform3x4 {}

impl Transform3x4 {
    /// Identity transform
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Encode the upper 3x4 block of `matrix`.
    ///
    /// Any projective component in the bottom row is discarded.
    pub fn from_matrix(matrix: &Mat4) -> Self {
        let mut rows = [[0.0f32; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = matrix[(r, c)];
            }
        }
        Self { rows }
    }

    /// Expand back to a full matrix with the implicit `(0, 0, 0, 1)` bottom row
    pub fn to_matrix(&self) -> Mat4 {
        let mut matrix = Mat4::identity();
        for (r, row) in self.rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                matrix[(r, c)] = *value;
            }
        }
        matrix
    }

    /// Pure translation
    pub fn from_translation(translation: Vec3) -> Self {
        let mut transform = Self::IDENTITY;
        transform.rows[0][3] = translation.x;
        transform.rows[1][3] = translation.y;
        transform.rows[2][3] = translation.z;
        transform
    }

    /// Translation component
    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.rows[0][3], self.rows[1][3], self.rows[2][3])
    }

    /// Flattened row-major view, the order drivers expect
    pub fn as_array(&self) -> [f32; 12] {
        let mut out = [0.0f32; 12];
        for (r, row) in self.rows.iter().enumerate() {
            out[r * 4..r * 4 + 4].copy_from_slice(row);
        }
        out
    }
}

impl Default for Transform3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<&Mat4> for Transform3x4 {
    fn from(matrix: &Mat4) -> Self {
        Self::from_matrix(matrix)
    }
}

impl From<Transform3x4> for Mat4 {
    fn from(transform: Transform3x4) -> Self {
        transform.to_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Unit};

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_round_trip_affine() {
        let axis = Unit::new_normalize(Vec3::new(0.3, 1.0, -0.2));
        let rotation = Rotation3::from_axis_angle(&axis, 0.7).to_homogeneous();
        let matrix = Mat4::new_translation(&Vec3::new(4.0, -2.5, 9.0))
            * rotation
            * Mat4::new_nonuniform_scaling(&Vec3::new(2.0, 0.5, 1.5));

        let encoded = Transform3x4::from_matrix(&matrix);
        let decoded = encoded.to_matrix();

        assert_relative_eq!(decoded, matrix, epsilon = EPSILON);
        assert_eq!(encoded.translation(), Vec3::new(4.0, -2.5, 9.0));
    }

    #[test]
    fn test_projective_row_is_dropped() {
        let mut matrix = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0));
        matrix[(3, 0)] = 0.25;
        matrix[(3, 3)] = 2.0;

        let decoded = Transform3x4::from_matrix(&matrix).to_matrix();

        for r in 0..3 {
            for c in 0..4 {
                assert_eq!(decoded[(r, c)], matrix[(r, c)]);
            }
        }
        assert_eq!(decoded.row(3).into_owned(), Mat4::identity().row(3).into_owned());
    }

    #[test]
    fn test_identity_layout() {
        let flat = Transform3x4::IDENTITY.as_array();
        assert_eq!(flat, [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(std::mem::size_of::<Transform3x4>(), 48);
    }

    #[test]
    fn test_translation_constructor() {
        let transform = Transform3x4::from_translation(Vec3::new(5.0, 6.0, 7.0));
        assert_eq!(transform.to_matrix(), Mat4::new_translation(&Vec3::new(5.0, 6.0, 7.0)));
    }
}
