//! Mineral density and bone volume fraction maps.
//!
//! Native scanner values become density through the calibration found in the
//! image log, density becomes BV/TV through the full-bone reference density,
//! and a linear correction curve removes the resolution-dependent bias of the
//! BV/TV estimate.

use rayon::prelude::*;
use tracing::info;

use crate::config::{HfeConfig, ImageType};
use crate::error::{HfeError, HfeResult};
use crate::image::{Calibration, Volume};
use crate::utils::units::{bmd_to_bvtv, bvtv_to_bmd, mineral_content_mg};

/// Density-derived fields, all on the image grid.
#[derive(Debug, Clone)]
pub struct DensityMaps {
    /// Mineral density (mg HA / cm³), unmasked
    pub bmd: Volume<f64>,
    /// Uncorrected BV/TV, masked
    pub bvtv_raw: Volume<f64>,
    /// Corrected BV/TV, masked
    pub bvtv_scaled: Volume<f64>,
    /// Density equivalent of the corrected BV/TV, masked
    pub bmd_scaled: Volume<f64>,
    /// Union of cortical and trabecular masks
    pub bone_mask: Volume<u8>,
}

/// Converts grayscale voxels into density fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityMapper {
    pub image_type: ImageType,
    /// BV/TV correction slope
    pub slope: f64,
    /// BV/TV correction intercept
    pub intercept: f64,
}

impl DensityMapper {
    /// Pick the correction curve matching the voxel spacing.
    pub fn from_config(config: &HfeConfig, spacing_mm: f64) -> Self {
        let (slope, intercept) = config.bvtv_curve(spacing_mm);
        Self {
            image_type: config.density.image_type,
            slope,
            intercept,
        }
    }

    /// Grayscale to mineral density (mg HA / cm³).
    pub fn to_density(&self, raw: &Volume<i16>, calibration: &Calibration) -> HfeResult<Volume<f64>> {
        match self.image_type {
            ImageType::Bmd => Ok(raw.map(f64::from)),
            ImageType::Native => {
                let scaling = calibration
                    .scaling
                    .filter(|&s| s != 0.0)
                    .ok_or(HfeError::MissingCalibration("Scaled by factor"))?;
                let slope = calibration
                    .slope
                    .ok_or(HfeError::MissingCalibration("Density: slope"))?;
                let intercept = calibration
                    .intercept
                    .ok_or(HfeError::MissingCalibration("Density: intercept"))?;
                Ok(raw.map(|v| f64::from(v) / scaling * slope + intercept))
            }
        }
    }

    /// Full density conversion, masked by the union of the phase masks.
    pub fn map(
        &self,
        raw: &Volume<i16>,
        calibration: &Calibration,
        cortical_mask: &Volume<u8>,
        trabecular_mask: &Volume<u8>,
    ) -> HfeResult<DensityMaps> {
        let bmd = self.to_density(raw, calibration)?;
        let bone_mask = cortical_mask
            .zip_map(trabecular_mask, |c, t| u8::from(c != 0 || t != 0))
            .ok_or_else(|| {
                HfeError::ShapeMismatch(format!(
                    "cortical mask {:?} vs trabecular mask {:?}",
                    cortical_mask.dims, trabecular_mask.dims
                ))
            })?;
        if bone_mask.dims != bmd.dims {
            return Err(HfeError::ShapeMismatch(format!(
                "density image {:?} vs masks {:?}",
                bmd.dims, bone_mask.dims
            )));
        }

        let n = bmd.len();
        let mut bvtv_raw = vec![0.0; n];
        let mut bvtv_scaled = vec![0.0; n];
        let mut bmd_scaled = vec![0.0; n];
        bvtv_raw
            .par_iter_mut()
            .zip(bvtv_scaled.par_iter_mut())
            .zip(bmd_scaled.par_iter_mut())
            .enumerate()
            .for_each(|(i, ((raw_out, scaled_out), bmd_out))| {
                if bone_mask.data[i] == 0 {
                    return;
                }
                let raw = bmd_to_bvtv(bmd.data[i]);
                let scaled = self.slope * raw + self.intercept;
                *raw_out = raw;
                *scaled_out = scaled;
                *bmd_out = bvtv_to_bmd(scaled);
            });

        let wrap = |data: Vec<f64>| Volume {
            data,
            dims: bmd.dims,
            spacing: bmd.spacing,
            origin: bmd.origin,
        };
        let maps = DensityMaps {
            bvtv_raw: wrap(bvtv_raw),
            bvtv_scaled: wrap(bvtv_scaled),
            bmd_scaled: wrap(bmd_scaled),
            bmd,
            bone_mask,
        };
        info!(
            bone_voxels = maps.bone_mask.count_nonzero(),
            mean_bvtv = maps.mean_bone_bvtv(),
            "Density maps computed"
        );
        Ok(maps)
    }
}

impl DensityMaps {
    /// Mean corrected BV/TV over bone voxels
    pub fn mean_bone_bvtv(&self) -> f64 {
        let count = self.bone_mask.count_nonzero();
        if count == 0 {
            return 0.0;
        }
        self.bvtv_scaled.sum() / count as f64
    }
}

/// Bone mineral content (mg HA) of `density` over the voxels of `mask`.
pub fn reconstructed_bmc(density: &Volume<f64>, mask: &Volume<u8>) -> HfeResult<f64> {
    if density.dims != mask.dims {
        return Err(HfeError::ShapeMismatch(format!(
            "density {:?} vs mask {:?}",
            density.dims, mask.dims
        )));
    }
    let voxel_volume = density.voxel_volume();
    Ok(density
        .data
        .par_iter()
        .zip(mask.data.par_iter())
        .filter(|(_, m)| **m != 0)
        .map(|(&d, _)| mineral_content_mg(d, voxel_volume))
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn calibration() -> Calibration {
        Calibration {
            scaling: Some(8192.0),
            slope: Some(1600.0),
            intercept: Some(-400.0),
            ..Calibration::default()
        }
    }

    #[test]
    fn test_native_conversion() {
        let spacing = Vector3::new(0.1, 0.1, 0.1);
        let raw = Volume::from_vec(vec![8192i16, 4096], [2, 1, 1], spacing).unwrap();
        let mapper = DensityMapper {
            image_type: ImageType::Native,
            slope: 1.0,
            intercept: 0.0,
        };
        let bmd = mapper.to_density(&raw, &calibration()).unwrap();
        assert_relative_eq!(bmd.data[0], 1200.0, epsilon = 1e-12);
        assert_relative_eq!(bmd.data[1], 400.0, epsilon = 1e-12);
    }

    #[test]
    fn test_native_without_calibration_is_fatal() {
        let raw = Volume::from_vec(vec![1i16], [1, 1, 1], Vector3::new(0.1, 0.1, 0.1)).unwrap();
        let mapper = DensityMapper::from_config(&HfeConfig::default(), 0.1);
        assert!(matches!(
            mapper.to_density(&raw, &Calibration::default()),
            Err(HfeError::MissingCalibration("Scaled by factor"))
        ));
    }

    #[test]
    fn test_masking_and_scaling() {
        let spacing = Vector3::new(0.5, 0.5, 0.5);
        let raw = Volume::from_vec(vec![600i16, 600, 1200], [3, 1, 1], spacing).unwrap();
        let cort = Volume::from_vec(vec![1u8, 0, 0], [3, 1, 1], spacing).unwrap();
        let trab = Volume::from_vec(vec![0u8, 0, 1], [3, 1, 1], spacing).unwrap();
        let mapper = DensityMapper {
            image_type: ImageType::Bmd,
            slope: 0.963,
            intercept: 0.03814,
        };
        let maps = mapper.map(&raw, &Calibration::default(), &cort, &trab).unwrap();
        assert_relative_eq!(maps.bvtv_raw.data[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(maps.bvtv_scaled.data[0], 0.963 * 0.5 + 0.03814, epsilon = 1e-12);
        assert_eq!(maps.bvtv_scaled.data[1], 0.0);
        assert_relative_eq!(maps.bmd_scaled.data[2], (0.963 + 0.03814) * 1200.0, epsilon = 1e-9);
        // unmasked density is kept
        assert_eq!(maps.bmd.data[1], 600.0);

        // 1200 mg/cm³ in a 0.125 mm³ voxel
        let bmc = reconstructed_bmc(&maps.bmd, &trab).unwrap();
        assert_relative_eq!(bmc, 0.15, epsilon = 1e-12);
    }

    #[test]
    fn test_bmc_rejects_mismatched_mask() {
        let spacing = Vector3::new(0.5, 0.5, 0.5);
        let density = Volume::from_vec(vec![1200.0; 3], [3, 1, 1], spacing).unwrap();
        let mask = Volume::from_vec(vec![1u8; 2], [2, 1, 1], spacing).unwrap();
        assert!(matches!(
            reconstructed_bmc(&density, &mask),
            Err(HfeError::ShapeMismatch(_))
        ));
    }
}
