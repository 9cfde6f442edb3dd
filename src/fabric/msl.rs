//! Mean-intercept-length (MSL) fabric.
//!
//! The per-element sum of normal dyadics `T` relates to the MSL tensor
//! through `H = 2 BV T⁻¹`, normalised to unit mean eigenvalue:
//! `MSL = 3 H / tr(H)`.

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use rayon::prelude::*;

/// Trace below which `H` is divided by this floor instead
const MIN_TRACE: f64 = 1e-3;

/// Eigenvalues at or below this are treated as a vanishing fabric
const MIN_EIGENVALUE: f64 = 1e-12;

/// One 3x3 tensor per mesh element, indexed by element id minus one.
#[derive(Debug, Clone, PartialEq)]
pub struct FabricField {
    pub grid: [usize; 3],
    pub tensors: Vec<Matrix3<f64>>,
}

impl FabricField {
    pub fn zeros(grid: [usize; 3]) -> Self {
        Self {
            grid,
            tensors: vec![Matrix3::zeros(); grid[0] * grid[1] * grid[2]],
        }
    }

    #[inline]
    pub fn add(&mut self, element: usize, tensor: &Matrix3<f64>) {
        self.tensors[element] += tensor;
    }

    #[inline]
    pub fn get(&self, element: usize) -> &Matrix3<f64> {
        &self.tensors[element]
    }

    /// Box-filtered copy: each tensor becomes the sum over the cube of
    /// `kernel_size` elements around it, with zeros beyond the grid.
    ///
    /// The filter is separable, so it runs as three one-dimensional passes.
    pub fn smoothed(&self, kernel_size: usize) -> Self {
        let half = kernel_size / 2;
        if half == 0 {
            return self.clone();
        }
        let [nx, ny, nz] = self.grid;
        let mut current = self.tensors.clone();
        for axis in 0..3 {
            let (stride, extent) = match axis {
                0 => (1, nx),
                1 => (nx, ny),
                _ => (nx * ny, nz),
            };
            let source = &current;
            let next: Vec<Matrix3<f64>> = (0..source.len())
                .into_par_iter()
                .map(|idx| {
                    let pos = (idx / stride) % extent;
                    let lo = pos.saturating_sub(half);
                    let hi = (pos + half).min(extent - 1);
                    let base = idx - pos * stride;
                    (lo..=hi).fold(Matrix3::zeros(), |acc, p| acc + source[base + p * stride])
                })
                .collect();
            current = next;
        }
        Self {
            grid: self.grid,
            tensors: current,
        }
    }
}

/// Orthotropic fabric: ascending eigenvalues, eigenvectors as columns
/// (min, mid, max) forming a right-handed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fabric {
    pub eigenvalues: Vector3<f64>,
    pub eigenvectors: Matrix3<f64>,
}

impl Fabric {
    pub fn isotropic() -> Self {
        Self {
            eigenvalues: Vector3::new(1.0, 1.0, 1.0),
            eigenvectors: Matrix3::identity(),
        }
    }

    /// Ascending eigen decomposition of a symmetric tensor; `None` when it
    /// contains non-finite values or its largest eigenvalue vanishes.
    pub fn from_tensor(tensor: &Matrix3<f64>) -> Option<Self> {
        if tensor.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let eigen = SymmetricEigen::new(*tensor);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[a]
                .partial_cmp(&eigen.eigenvalues[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let eigenvalues = Vector3::from_fn(|i, _| eigen.eigenvalues[order[i]]);
        let mut eigenvectors = Matrix3::from_fn(|r, c| eigen.eigenvectors[(r, order[c])]);

        if eigenvalues.iter().any(|v| !v.is_finite()) || eigenvalues[2] <= MIN_EIGENVALUE {
            return None;
        }
        if eigenvectors.determinant() < 0.0 {
            let flipped = -eigenvectors.column(0);
            eigenvectors.set_column(0, &flipped);
        }
        Some(Self {
            eigenvalues,
            eigenvectors,
        })
    }

    pub fn min_vector(&self) -> Vector3<f64> {
        self.eigenvectors.column(0).into_owned()
    }

    pub fn mid_vector(&self) -> Vector3<f64> {
        self.eigenvectors.column(1).into_owned()
    }

    pub fn max_vector(&self) -> Vector3<f64> {
        self.eigenvectors.column(2).into_owned()
    }

    /// Reassembled tensor `V diag(λ) Vᵀ`
    pub fn tensor(&self) -> Matrix3<f64> {
        self.eigenvectors * Matrix3::from_diagonal(&self.eigenvalues) * self.eigenvectors.transpose()
    }

    /// Degree of anisotropy `λmin / λmax`
    pub fn degree_of_anisotropy(&self) -> f64 {
        self.eigenvalues[0] / self.eigenvalues[2]
    }
}

/// Fabric of one element from its smoothed dyadic sum and bone volume.
///
/// Returns `None` when `dyadic_sum` cannot be inverted reliably or the
/// resulting MSL tensor is degenerate; callers fall back to
/// [`Fabric::isotropic`].
pub fn resolve_fabric(dyadic_sum: &Matrix3<f64>, bone_volume: f64) -> Option<Fabric> {
    let scale = dyadic_sum.norm();
    if scale == 0.0 || dyadic_sum.determinant().abs() <= 1e-12 * scale.powi(3) {
        return None;
    }
    let inverse = dyadic_sum.try_inverse()?;
    let h = inverse * (2.0 * bone_volume);
    let trace = h.trace();
    let msl = if trace > MIN_TRACE {
        h * (3.0 / trace)
    } else {
        h * (3.0 / MIN_TRACE)
    };
    Fabric::from_tensor(&msl)
}

/// Cortical fabric: keep only the orientation of `fabric` and replace its
/// eigenvalues.
///
/// The minimum axis becomes the normal of the (max, mid) plane, the maximum
/// axis is `reference` projected into that plane, and the mid axis completes
/// the frame. Degenerate projections yield the identity frame.
pub fn project_cortical(fabric: &Fabric, reference: &Vector3<f64>, eigenvalues: [f64; 3]) -> Fabric {
    let normal = fabric.max_vector().cross(&fabric.mid_vector());
    let max_proj = reference - normal * (reference.dot(&normal) / normal.norm_squared());
    let mid = max_proj.cross(&normal);

    let columns = [normal.normalize(), mid.normalize(), max_proj.normalize()];
    let eigenvectors = if columns.iter().any(|c| c.iter().any(|v| !v.is_finite())) {
        Matrix3::identity()
    } else {
        Matrix3::from_columns(&columns)
    };
    Fabric {
        eigenvalues: Vector3::from(eigenvalues),
        eigenvectors,
    }
}

/// Volume-weighted superposition for elements holding both phases; the
/// remaining fraction contributes an isotropic identity.
pub fn mix_phases(cortical: &Fabric, phi_cortical: f64, trabecular: &Fabric, phi_trabecular: f64) -> Option<Fabric> {
    let air = 1.0 - phi_cortical - phi_trabecular;
    let mixed = cortical.tensor() * phi_cortical + trabecular.tensor() * phi_trabecular + Matrix3::identity() * air;
    Fabric::from_tensor(&mixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_isotropic_sum_gives_unit_msl() {
        let fabric = resolve_fabric(&(Matrix3::identity() * 4.0), 2.0).unwrap();
        for v in fabric.eigenvalues.iter() {
            assert_relative_eq!(*v, 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(fabric.degree_of_anisotropy(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_anisotropic_order_and_handedness() {
        // Most surface normal along x: intercepts longest along x
        let t = Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 4.0));
        let fabric = resolve_fabric(&t, 1.0).unwrap();
        assert!(fabric.eigenvalues[0] < fabric.eigenvalues[1]);
        assert!(fabric.eigenvalues[1] < fabric.eigenvalues[2]);
        assert_relative_eq!(fabric.eigenvalues.sum(), 3.0, epsilon = 1e-12);
        assert_relative_eq!(fabric.max_vector().x.abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(fabric.min_vector().z.abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(fabric.eigenvectors.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_tensor_falls_back() {
        let t = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0));
        assert!(resolve_fabric(&t, 1.0).is_none());
        assert!(resolve_fabric(&Matrix3::zeros(), 1.0).is_none());
        assert!(resolve_fabric(&Matrix3::identity(), 0.0).is_none());
    }

    #[test]
    fn test_cortical_projection() {
        // Fabric whose minimum axis is x: cortical plane is y-z
        let fabric = Fabric {
            eigenvalues: Vector3::new(0.8, 1.0, 1.2),
            eigenvectors: Matrix3::from_columns(&[Vector3::x(), Vector3::y(), Vector3::z()]),
        };
        let reference = Vector3::new(0.0, 0.6, 0.8);
        let projected = project_cortical(&fabric, &reference, [0.915, 0.915, 1.17]);
        assert_relative_eq!(projected.max_vector().dot(&reference), 1.0, epsilon = 1e-12);
        assert_relative_eq!(projected.min_vector().x.abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(projected.eigenvectors.determinant(), 1.0, epsilon = 1e-12);
        assert_eq!(projected.eigenvalues, Vector3::new(0.915, 0.915, 1.17));

        // Reference along the plane normal has no projection
        let degenerate = project_cortical(&fabric, &Vector3::x(), [0.915, 0.915, 1.17]);
        assert_eq!(degenerate.eigenvectors, Matrix3::identity());
    }

    #[test]
    fn test_mixing_with_air() {
        let iso = Fabric::isotropic();
        let mixed = mix_phases(&iso, 0.3, &iso, 0.2).unwrap();
        for v in mixed.eigenvalues.iter() {
            assert_relative_eq!(*v, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_box_smoothing_sums_neighbourhood() {
        let mut field = FabricField::zeros([5, 1, 1]);
        field.add(0, &Matrix3::identity());
        field.add(4, &(Matrix3::identity() * 2.0));
        let smoothed = field.smoothed(3);
        let diag: Vec<f64> = smoothed.tensors.iter().map(|t| t[(0, 0)]).collect();
        assert_eq!(diag, vec![1.0, 1.0, 0.0, 2.0, 2.0]);

        let mut cube = FabricField::zeros([3, 3, 3]);
        cube.add(13, &Matrix3::identity());
        let spread = cube.smoothed(3);
        assert!(spread.tensors.iter().all(|t| t[(1, 1)] == 1.0));
        assert_eq!(field.smoothed(1), field);
    }
}
