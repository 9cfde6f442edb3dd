//! Coarsening-factor alignment and grid resampling.

use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::volume::Volume;
use crate::error::{HfeError, HfeResult};

/// Through-thickness handling in [`adjust_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ZPolicy {
    /// Leave z untouched; the partial last layer is ignored by the mesh.
    Crop,
    /// Replicate the last slice up to the next multiple.
    Expand,
    /// Expand when the remainder exceeds half the factor, otherwise crop.
    Variable,
}

/// Target of a [`resample`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResampleTarget {
    /// Divide the voxel count per axis by this factor
    Factor(f64),
    /// Explicit output extents
    Size([usize; 3]),
    /// Explicit output spacing (mm)
    Spacing(Vector3<f64>),
}

/// Voxels per element edge: `round(element_size / spacing_x)`.
pub fn coarsening_factor(element_size_mm: f64, spacing: &Vector3<f64>) -> HfeResult<usize> {
    if spacing.iter().any(|&s| s <= 0.0) {
        return Err(HfeError::InvalidConfig(format!(
            "voxel spacing must be positive, got {:?}",
            spacing.as_slice()
        )));
    }
    let factor = (element_size_mm / spacing.x).round();
    if factor < 1.0 {
        return Err(HfeError::InvalidConfig(format!(
            "element size {element_size_mm} mm is smaller than the voxel spacing {} mm",
            spacing.x
        )));
    }
    Ok(factor as usize)
}

fn padding_to_multiple(dim: usize, factor: usize) -> usize {
    (factor - dim % factor) % factor
}

/// Pad x and y with zeros to a multiple of `factor`; treat z per `policy`.
pub fn adjust_size<T: Copy + Default>(image: &Volume<T>, factor: usize, policy: ZPolicy) -> Volume<T> {
    let [nx, ny, nz] = image.dims;
    let pad_x = padding_to_multiple(nx, factor);
    let pad_y = padding_to_multiple(ny, factor);
    let remainder = nz % factor;
    let expand = match policy {
        ZPolicy::Crop => false,
        ZPolicy::Expand => true,
        ZPolicy::Variable => 2 * remainder > factor,
    };
    let pad_z = if expand { padding_to_multiple(nz, factor) } else { 0 };

    let dims = [nx + pad_x, ny + pad_y, nz + pad_z];
    let mut out = Volume::new(dims, image.spacing);
    out.origin = image.origin;
    for z in 0..dims[2] {
        // edge replication along z
        let src_z = z.min(nz.saturating_sub(1));
        for y in 0..ny {
            for x in 0..nx {
                out.set(x, y, z, image.get(x, y, src_z));
            }
        }
    }
    debug!(
        before = ?image.dims,
        after = ?dims,
        factor,
        ?policy,
        "Adjusted image size"
    );
    out
}

/// Crop or zero-pad to the given extents, anchored at voxel (0, 0, 0).
pub fn crop_or_pad<T: Copy + Default>(image: &Volume<T>, dims: [usize; 3]) -> Volume<T> {
    let mut out = Volume::new(dims, image.spacing);
    out.origin = image.origin;
    for z in 0..dims[2].min(image.dims[2]) {
        for y in 0..dims[1].min(image.dims[1]) {
            for x in 0..dims[0].min(image.dims[0]) {
                out.set(x, y, z, image.get(x, y, z));
            }
        }
    }
    out
}

/// Linear interpolation onto a new grid with the same origin.
///
/// Points outside the source buffer evaluate to zero.
pub fn resample(image: &Volume<f64>, target: ResampleTarget) -> HfeResult<Volume<f64>> {
    let physical = image.physical_size();
    let (dims, spacing) = match target {
        ResampleTarget::Factor(factor) => {
            if factor <= 0.0 {
                return Err(HfeError::InvalidConfig(format!(
                    "resampling factor must be positive, got {factor}"
                )));
            }
            let dims = image.dims.map(|d| ((d as f64 / factor).round() as usize).max(2));
            (dims, spacing_for(&physical, dims))
        }
        ResampleTarget::Size(dims) => {
            if dims.iter().any(|&d| d < 2) {
                return Err(HfeError::InvalidConfig(format!(
                    "resampled size must be at least 2 per axis, got {dims:?}"
                )));
            }
            (dims, spacing_for(&physical, dims))
        }
        ResampleTarget::Spacing(spacing) => {
            if spacing.iter().any(|&s| s <= 0.0) {
                return Err(HfeError::InvalidConfig(
                    "resampled spacing must be positive".to_string(),
                ));
            }
            let dims = [0usize, 1, 2].map(|i| (physical[i] / spacing[i]).round() as usize + 1);
            (dims, spacing)
        }
    };

    let mut out: Volume<f64> = Volume::new(dims, spacing);
    out.origin = image.origin;
    let slice = dims[0] * dims[1];
    out.data
        .par_chunks_mut(slice)
        .enumerate()
        .for_each(|(z, plane)| {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    let q = Vector3::new(
                        x as f64 * spacing.x / image.spacing.x,
                        y as f64 * spacing.y / image.spacing.y,
                        z as f64 * spacing.z / image.spacing.z,
                    );
                    plane[x + dims[0] * y] = trilinear(image, &q);
                }
            }
        });
    Ok(out)
}

fn spacing_for(physical: &Vector3<f64>, dims: [usize; 3]) -> Vector3<f64> {
    Vector3::new(
        physical.x / (dims[0] - 1) as f64,
        physical.y / (dims[1] - 1) as f64,
        physical.z / (dims[2] - 1) as f64,
    )
}

/// Sample at a continuous voxel index.
fn trilinear(image: &Volume<f64>, q: &Vector3<f64>) -> f64 {
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut t = [0.0; 3];
    for axis in 0..3 {
        let dim = image.dims[axis];
        if dim == 0 || q[axis] < -0.5 || q[axis] > dim as f64 - 0.5 {
            return 0.0;
        }
        let base = q[axis].floor();
        let i0 = base.max(0.0) as usize;
        lo[axis] = i0.min(dim - 1);
        hi[axis] = (i0 + 1).min(dim - 1);
        t[axis] = if base < 0.0 { 0.0 } else { q[axis] - base };
    }
    let mut value = 0.0;
    for corner in 0..8usize {
        let mut weight = 1.0;
        let mut idx = [0usize; 3];
        for axis in 0..3 {
            if corner >> axis & 1 == 1 {
                weight *= t[axis];
                idx[axis] = hi[axis];
            } else {
                weight *= 1.0 - t[axis];
                idx[axis] = lo[axis];
            }
        }
        if weight != 0.0 {
            value += weight * image.get(idx[0], idx[1], idx[2]);
        }
    }
    value
}

/// Bring a binary mask onto the reference grid.
///
/// Masks with a different spacing are resampled and thresholded at 0.5,
/// then cropped or zero-padded to the reference extents.
pub fn align_to(mask: &Volume<u8>, dims: [usize; 3], spacing: &Vector3<f64>) -> HfeResult<Volume<u8>> {
    let same_spacing = (mask.spacing - spacing).amax() < 1e-9;
    let on_spacing = if same_spacing {
        mask.clone()
    } else {
        let as_float = mask.map(|v| f64::from(u8::from(v != 0)));
        let resampled = resample(&as_float, ResampleTarget::Spacing(*spacing))?;
        debug!(from = ?mask.dims, to = ?resampled.dims, "Resampled mask onto reference spacing");
        resampled.map(|v| u8::from(v > 0.5))
    };
    if on_spacing.dims == dims {
        Ok(on_spacing)
    } else {
        Ok(crop_or_pad(&on_spacing, dims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(dims: [usize; 3]) -> Volume<f64> {
        let mut vol = Volume::new(dims, Vector3::new(1.0, 1.0, 1.0));
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    vol.set(x, y, z, x as f64 + 10.0 * y as f64 + 100.0 * z as f64);
                }
            }
        }
        vol
    }

    #[test]
    fn test_adjust_size_multiples() {
        for factor in 1..6 {
            for shape in [[7, 9, 11], [10, 10, 10], [1, 4, 3], [13, 2, 8]] {
                let image: Volume<u8> = Volume::filled(shape, Vector3::new(1.0, 1.0, 1.0), 1);
                let crop = adjust_size(&image, factor, ZPolicy::Crop);
                let expand = adjust_size(&image, factor, ZPolicy::Expand);
                let variable = adjust_size(&image, factor, ZPolicy::Variable);
                for out in [&crop, &expand, &variable] {
                    assert_eq!(out.dims[0] % factor, 0);
                    assert_eq!(out.dims[1] % factor, 0);
                    assert!(out.dims[0] >= shape[0] && out.dims[0] < shape[0] + factor);
                }
                assert_eq!(crop.dims[2], shape[2]);
                assert!(expand.dims[2] >= shape[2]);
                assert_eq!(expand.dims[2] % factor, 0);
            }
        }
    }

    #[test]
    fn test_adjust_size_pads_with_zero_and_replicates_z() {
        let image: Volume<u8> = Volume::filled([3, 3, 3], Vector3::new(1.0, 1.0, 1.0), 5);
        let out = adjust_size(&image, 2, ZPolicy::Expand);
        assert_eq!(out.dims, [4, 4, 4]);
        assert_eq!(out.get(3, 0, 0), 0);
        assert_eq!(out.get(0, 3, 0), 0);
        assert_eq!(out.get(0, 0, 3), 5);
    }

    #[test]
    fn test_variable_policy_threshold() {
        let image: Volume<u8> = Volume::new([4, 4, 7], Vector3::new(1.0, 1.0, 1.0));
        // remainder 3 of 4 exceeds half
        assert_eq!(adjust_size(&image, 4, ZPolicy::Variable).dims[2], 8);
        // remainder 2 of 4 does not
        let image: Volume<u8> = Volume::new([4, 4, 6], Vector3::new(1.0, 1.0, 1.0));
        assert_eq!(adjust_size(&image, 4, ZPolicy::Variable).dims[2], 6);
    }

    #[test]
    fn test_coarsening_factor() {
        let spacing = Vector3::new(0.0607, 0.0607, 0.0607);
        assert_eq!(coarsening_factor(1.2747, &spacing).unwrap(), 21);
        assert!(coarsening_factor(0.01, &spacing).is_err());
    }

    #[test]
    fn test_resample_linear_field_is_exact() {
        let image = ramp([5, 5, 5]);
        let out = resample(&image, ResampleTarget::Spacing(Vector3::new(0.5, 0.5, 0.5))).unwrap();
        assert_eq!(out.dims, [11, 11, 11]);
        // physical (1.5, 2.0, 0.5) lies inside the source grid
        assert_relative_eq!(out.get(3, 4, 1), 1.5 + 20.0 + 50.0, epsilon = 1e-12);
        // beyond the last voxel centre but within half a voxel: clamped
        assert_relative_eq!(out.get(9, 0, 0), 4.0, epsilon = 1e-12);
        // more than half a voxel outside
        assert_eq!(out.get(10, 0, 0), 0.0);
    }

    #[test]
    fn test_resample_by_factor_and_size() {
        let image = ramp([8, 8, 8]);
        let out = resample(&image, ResampleTarget::Factor(2.0)).unwrap();
        assert_eq!(out.dims, [4, 4, 4]);
        assert_relative_eq!(out.spacing.x, 8.0 / 3.0, epsilon = 1e-12);
        let out = resample(&image, ResampleTarget::Size([3, 3, 3])).unwrap();
        assert_relative_eq!(out.spacing.z, 4.0, epsilon = 1e-12);
        assert!(resample(&image, ResampleTarget::Size([1, 3, 3])).is_err());
    }

    #[test]
    fn test_align_to_finer_grid() {
        let mut mask: Volume<u8> = Volume::new([4, 4, 4], Vector3::new(1.0, 1.0, 1.0));
        mask.set(1, 1, 1, 1);
        let aligned = align_to(&mask, [8, 8, 8], &Vector3::new(0.5, 0.5, 0.5)).unwrap();
        assert_eq!(aligned.dims, [8, 8, 8]);
        assert_eq!(aligned.get(2, 2, 2), 1);
        assert_eq!(aligned.get(6, 6, 6), 0);
    }
}
