//! Surface triangles as fabric samples.
//!
//! Each triangle contributes `area * n ⊗ n` to the tensor of the element that
//! contains its centroid, in the phase the trabecular mask reports there.

use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;

use super::isosurface::SurfaceMesh;
use crate::image::Volume;

/// Centroid, outward unit normal and area of one surface triangle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceTriangle {
    pub centroid: Point3<f64>,
    pub normal: Vector3<f64>,
    pub area: f64,
}

impl SurfaceTriangle {
    /// `None` for zero-area triangles.
    pub fn from_vertices(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> Option<Self> {
        let cross = (b - a).cross(&(c - a));
        let twice_area = cross.norm();
        if twice_area <= f64::EPSILON {
            return None;
        }
        Some(Self {
            centroid: Point3::from((a.coords + b.coords + c.coords) / 3.0),
            normal: cross / twice_area,
            area: 0.5 * twice_area,
        })
    }

    /// Area-weighted normal dyadic `area * n nᵀ`
    pub fn dyadic(&self) -> Matrix3<f64> {
        self.normal * self.normal.transpose() * self.area
    }
}

/// Per-triangle data of a surface, in face order.
pub fn surface_triangles(mesh: &SurfaceMesh) -> Vec<SurfaceTriangle> {
    (0..mesh.faces.len())
        .into_par_iter()
        .filter_map(|f| {
            let [a, b, c] = mesh.triangle(f);
            SurfaceTriangle::from_vertices(&a, &b, &c)
        })
        .collect()
}

/// Bone phase a triangle is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrianglePhase {
    Cortical,
    Trabecular,
    /// Too close to the proximal or distal cut
    Excluded,
}

/// Voxel containing a physical point, clamped to the image.
fn voxel_of(point: &Point3<f64>, image: &Volume<u8>) -> [usize; 3] {
    let mut idx = [0usize; 3];
    for axis in 0..3 {
        let i = (point[axis] / image.spacing[axis]).floor();
        let max = image.dims[axis].saturating_sub(1) as f64;
        idx[axis] = i.clamp(0.0, max) as usize;
    }
    idx
}

/// Phase of a triangle from the trabecular mask at its centroid voxel.
///
/// Triangles outside the trabecular mask count as cortical. Triangles whose
/// centroid lies within `tolerance` of either z end of the image are
/// excluded from both phases.
pub fn classify_triangle(
    triangle: &SurfaceTriangle,
    trabecular_mask: &Volume<u8>,
    tolerance: f64,
) -> TrianglePhase {
    let z_extent = trabecular_mask.dims[2] as f64 * trabecular_mask.spacing.z;
    let z = triangle.centroid.z;
    if z < tolerance || z > z_extent - tolerance {
        return TrianglePhase::Excluded;
    }
    let [x, y, z] = voxel_of(&triangle.centroid, trabecular_mask);
    if trabecular_mask.get(x, y, z) != 0 {
        TrianglePhase::Trabecular
    } else {
        TrianglePhase::Cortical
    }
}

/// Linear index of the element containing `point`: `x + nx * (y + ny * z)`.
///
/// A coordinate exactly on the far face belongs to the last element; anything
/// else outside the grid has no element.
pub fn element_index(point: &Point3<f64>, grid: [usize; 3], element_size: &Vector3<f64>) -> Option<usize> {
    let mut idx = [0usize; 3];
    for axis in 0..3 {
        let f = (point[axis] / element_size[axis]).floor();
        if !f.is_finite() || f < 0.0 {
            return None;
        }
        let mut i = f as usize;
        if i == grid[axis] && i > 0 {
            i -= 1;
        }
        if i >= grid[axis] {
            return None;
        }
        idx[axis] = i;
    }
    Some(idx[0] + grid[0] * (idx[1] + grid[1] * idx[2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_triangle_data() {
        let t = SurfaceTriangle::from_vertices(
            &Point3::new(0.0, 0.0, 1.0),
            &Point3::new(2.0, 0.0, 1.0),
            &Point3::new(0.0, 2.0, 1.0),
        )
        .unwrap();
        assert_relative_eq!(t.area, 2.0);
        assert_relative_eq!(t.normal.z, 1.0);
        assert_relative_eq!(t.centroid.x, 2.0 / 3.0);
        let d = t.dyadic();
        assert_relative_eq!(d[(2, 2)], 2.0);
        assert_relative_eq!(d.trace(), 2.0);

        let degenerate = SurfaceTriangle::from_vertices(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 1.0, 1.0),
            &Point3::new(2.0, 2.0, 2.0),
        );
        assert!(degenerate.is_none());
    }

    #[test]
    fn test_classification() {
        let mut trab: Volume<u8> = Volume::new([4, 4, 10], Vector3::new(0.5, 0.5, 0.5));
        trab.set(1, 1, 4, 1);
        let at = |x: f64, y: f64, z: f64| SurfaceTriangle {
            centroid: Point3::new(x, y, z),
            normal: Vector3::z(),
            area: 1.0,
        };
        assert_eq!(classify_triangle(&at(0.6, 0.7, 2.2), &trab, 0.2), TrianglePhase::Trabecular);
        assert_eq!(classify_triangle(&at(1.6, 0.7, 2.2), &trab, 0.2), TrianglePhase::Cortical);
        assert_eq!(classify_triangle(&at(0.6, 0.7, 0.1), &trab, 0.2), TrianglePhase::Excluded);
        assert_eq!(classify_triangle(&at(0.6, 0.7, 4.9), &trab, 0.2), TrianglePhase::Excluded);
        // Outside the image in x: clamped to the last voxel
        assert_eq!(classify_triangle(&at(9.0, 0.7, 2.2), &trab, 0.2), TrianglePhase::Cortical);
    }

    #[test]
    fn test_element_index() {
        let size = Vector3::new(1.0, 1.0, 2.0);
        let grid = [3, 2, 2];
        assert_eq!(element_index(&Point3::new(0.5, 0.5, 0.5), grid, &size), Some(0));
        assert_eq!(element_index(&Point3::new(2.5, 1.5, 3.0), grid, &size), Some(2 + 3 * (1 + 2)));
        // Far face belongs to the last layer
        assert_eq!(element_index(&Point3::new(3.0, 0.0, 0.0), grid, &size), Some(2));
        assert_eq!(element_index(&Point3::new(3.5, 0.0, 0.0), grid, &size), None);
        assert_eq!(element_index(&Point3::new(-0.1, 0.0, 0.0), grid, &size), None);
    }
}
