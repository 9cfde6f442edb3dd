//! Region-of-interest sampling around element centroids.
//!
//! ROIs are cubes centred on the centroid (converted to voxel units), with
//! bounds rounded half-to-even and clamped to the image. Empty ROIs and empty
//! averages give zero.

use nalgebra::Point3;

use crate::image::Volume;

/// Half-open voxel box `[lo, hi)` per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiBounds {
    pub lo: [usize; 3],
    pub hi: [usize; 3],
}

impl RoiBounds {
    /// Cube of `roi_size_mm` around `center`, in the voxel grid of `image`.
    ///
    /// The edge is converted with the x spacing for all three axes.
    pub fn around<T>(center: &Point3<f64>, roi_size_mm: f64, image: &Volume<T>) -> Self {
        let half = roi_size_mm / image.spacing.x / 2.0;
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            let c = center[axis] / image.spacing[axis];
            let dim = image.dims[axis] as f64;
            let a = (c - half).max(0.0).round_ties_even();
            let b = (c + half).min(dim).round_ties_even();
            lo[axis] = a.min(dim) as usize;
            hi[axis] = b.max(a).min(dim) as usize;
        }
        Self { lo, hi }
    }

    pub fn len(&self) -> usize {
        (0..3).map(|a| self.hi[a] - self.lo[a]).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every voxel index in the box, x fastest.
    pub fn for_each(&self, mut f: impl FnMut(usize, usize, usize)) {
        for z in self.lo[2]..self.hi[2] {
            for y in self.lo[1]..self.hi[1] {
                for x in self.lo[0]..self.hi[0] {
                    f(x, y, z);
                }
            }
        }
    }
}

/// Partial volume of `mask` in a cube of `roi_size_mm` around `center`.
///
/// Returns the fraction of non-zero voxels, 0 for an empty ROI.
pub fn compute_phi(center: &Point3<f64>, roi_size_mm: f64, mask: &Volume<u8>) -> f64 {
    let roi = RoiBounds::around(center, roi_size_mm, mask);
    if roi.is_empty() {
        return 0.0;
    }
    let mut count = 0usize;
    roi.for_each(|x, y, z| {
        if mask.get(x, y, z) != 0 {
            count += 1;
        }
    });
    (count as f64 / roi.len() as f64).min(1.0)
}

/// Mean BV/TV of both phases around an element centroid
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseDensities {
    pub cortical: f64,
    pub trabecular: f64,
}

/// Phase sampling parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityRoi {
    pub cortical_mm: f64,
    pub trabecular_mm: f64,
}

/// Sample the BV/TV of each phase inside a sphere of the phase ROI diameter.
///
/// Only voxels inside both the sphere and the phase mask count. A phase with
/// zero partial volume is not sampled.
pub fn compute_phase_densities(
    center: &Point3<f64>,
    roi: DensityRoi,
    bvtv: &Volume<f64>,
    cortical_mask: &Volume<u8>,
    trabecular_mask: &Volume<u8>,
    phi_cortical: f64,
    phi_trabecular: f64,
) -> PhaseDensities {
    let bounds = RoiBounds::around(center, roi.cortical_mm.max(roi.trabecular_mm), bvtv);
    let c = [0usize, 1, 2].map(|a| center[a] / bvtv.spacing[a]);

    let sphere_mean = |roi_mm: f64, mask: &Volume<u8>| -> f64 {
        let radius = roi_mm / bvtv.spacing.x / 2.0;
        let mut sum = 0.0;
        let mut count = 0usize;
        bounds.for_each(|x, y, z| {
            if mask.get(x, y, z) == 0 {
                return;
            }
            let r2 = [x, y, z]
                .iter()
                .zip(c.iter())
                .map(|(&i, &ci)| ((i as f64 - ci) / radius).powi(2))
                .sum::<f64>();
            if r2 <= 1.0 {
                sum += bvtv.get(x, y, z);
                count += 1;
            }
        });
        let mean = if count == 0 { 0.0 } else { sum / count as f64 };
        if mean.is_nan() {
            0.0
        } else {
            mean.min(1.0)
        }
    };

    PhaseDensities {
        cortical: if phi_cortical > 0.0 {
            sphere_mean(roi.cortical_mm, cortical_mask)
        } else {
            0.0
        },
        trabecular: if phi_trabecular > 0.0 {
            sphere_mean(roi.trabecular_mm, trabecular_mask)
        } else {
            0.0
        },
    }
}
