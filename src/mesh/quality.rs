/// Hexahedral Mesh Quality Assessment
///
/// Provides tools to:
/// 1. Measure corner Jacobian determinants of C3D8 elements
/// 2. Detect inverted or degenerate elements before the deck is written
///
/// The external solver rejects inverted elements, and the per-element
/// orientation cards assume right-handed connectivity.

use crate::mesh::Mesh;
use crate::mesh::topology::Hex8Element;
use nalgebra::{Point3, Vector3};

/// Mesh quality statistics
#[derive(Debug, Clone)]
pub struct MeshQuality {
    /// Minimum scaled corner Jacobian (1 for a perfect box, should be > 0)
    pub min_jacobian: f64,
    /// Average of the per-element minimum scaled Jacobian
    pub avg_jacobian: f64,
    /// Maximum of the per-element minimum scaled Jacobian
    pub max_jacobian: f64,
    /// Number of inverted elements (any corner det(J) < 0)
    pub num_inverted: usize,
    /// Number of near-degenerate elements (scaled det(J) < 0.01)
    pub num_degenerate: usize,
    /// Total elements
    pub total_elements: usize,
}

impl MeshQuality {
    /// Check if mesh is acceptable for simulation
    pub fn is_acceptable(&self) -> bool {
        self.num_inverted == 0 && self.min_jacobian > 0.01
    }

    /// Human-readable quality report
    pub fn report(&self) -> String {
        format!(
            "Mesh Quality: min_J={:.3}, avg_J={:.3}, inverted={}/{}, degenerate={}/{}",
            self.min_jacobian,
            self.avg_jacobian,
            self.num_inverted,
            self.total_elements,
            self.num_degenerate,
            self.total_elements
        )
    }
}

/// Corner Jacobian determinants of a hexahedron
///
/// At each corner the three edges towards the local +ξ, +η, +ζ neighbours
/// form the columns of J. Each determinant is also returned scaled by the
/// edge lengths, so a rectangular box gives exactly 1 at every corner.
///
/// det(J) > 0 at all corners: valid, right-handed element
/// det(J) < 0 at any corner: inverted or wrongly ordered connectivity
pub fn compute_hex_jacobians(vertices: &[Point3<f64>; 8]) -> [(f64, f64); 8] {
    let mut out = [(0.0, 0.0); 8];
    for (corner, nbrs) in Hex8Element::corner_neighbors().iter().enumerate() {
        let v0 = vertices[corner];
        let e1: Vector3<f64> = vertices[nbrs[0]] - v0;
        let e2: Vector3<f64> = vertices[nbrs[1]] - v0;
        let e3: Vector3<f64> = vertices[nbrs[2]] - v0;

        // det(J) = e1 · (e2 × e3)
        let det = e1.dot(&e2.cross(&e3));
        let scale = e1.norm() * e2.norm() * e3.norm();
        let scaled = if scale > 0.0 { det / scale } else { 0.0 };
        out[corner] = (det, scaled);
    }
    out
}

/// Minimum scaled Jacobian and inversion flag for one element
fn element_quality(mesh: &Mesh, elem: &Hex8Element) -> (f64, bool) {
    let vertices = mesh.element_coords(elem);
    let jacobians = compute_hex_jacobians(&vertices);
    let min_scaled = jacobians
        .iter()
        .map(|&(_, s)| s)
        .fold(f64::INFINITY, f64::min);
    let inverted = jacobians.iter().any(|&(det, _)| det < 0.0);
    (min_scaled, inverted)
}

/// Assess mesh quality by computing corner Jacobians for all elements
///
/// Uses parallel computation for large meshes (>1000 elements)
pub fn assess_hex_quality(mesh: &Mesh) -> MeshQuality {
    let elements = &mesh.connectivity.hex8_elements;

    let results: Vec<(f64, bool)> = if elements.len() > 1000 {
        use rayon::prelude::*;
        elements
            .par_iter()
            .map(|elem| element_quality(mesh, elem))
            .collect()
    } else {
        elements
            .iter()
            .map(|elem| element_quality(mesh, elem))
            .collect()
    };

    let mut min_jacobian = f64::INFINITY;
    let mut max_jacobian = f64::NEG_INFINITY;
    let mut sum_jacobian = 0.0;
    let mut num_inverted = 0;
    let mut num_degenerate = 0;

    for &(scaled, inverted) in &results {
        if inverted {
            num_inverted += 1;
        } else if scaled < 0.01 {
            num_degenerate += 1;
        }
        min_jacobian = min_jacobian.min(scaled);
        max_jacobian = max_jacobian.max(scaled);
        sum_jacobian += scaled;
    }

    let total_elements = results.len();

    MeshQuality {
        min_jacobian,
        avg_jacobian: if total_elements > 0 {
            sum_jacobian / total_elements as f64
        } else {
            0.0
        },
        max_jacobian,
        num_inverted,
        num_degenerate,
        total_elements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> [Point3<f64>; 8] {
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(2.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 3.0),
            Point3::new(2.0, 0.0, 3.0),
            Point3::new(2.0, 1.0, 3.0),
            Point3::new(0.0, 1.0, 3.0),
        ]
    }

    #[test]
    fn test_jacobian_box() {
        for (det, scaled) in compute_hex_jacobians(&unit_box()) {
            assert!((det - 6.0).abs() < 1e-12, "Box corner det(J) should be its volume");
            assert!((scaled - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_jacobian_mirrored_box() {
        // Swapping top and bottom faces flips handedness
        let mut v = unit_box();
        v.swap(0, 4);
        v.swap(1, 5);
        v.swap(2, 6);
        v.swap(3, 7);
        for (det, _) in compute_hex_jacobians(&v) {
            assert!(det < 0.0, "Mirrored element should have negative Jacobian");
        }
    }
}
