//! Configuration management for hFE preprocessing
//!
//! Reads TOML configuration files and provides structured data for image
//! coarsening, density calibration, fabric estimation, element sampling and
//! output deck generation. Every field has a default so partial files work.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{HfeError, HfeResult};
use crate::image::ZPolicy;

/// Main preprocessing configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HfeConfig {
    pub mesh: MeshConfig,
    pub density: DensityConfig,
    pub fabric: FabricConfig,
    pub homogenization: HomogenizationConfig,
    pub deck: DeckConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Target element edge length (mm)
    pub element_size_mm: f64,
    /// Through-thickness size adjustment
    pub z_policy: ZPolicy,
    /// Inclusive range of admissible material ids
    pub material_id_range: [u32; 2],
    /// Serialize the generated mesh and re-parse it before use
    pub round_trip: bool,
    /// Also emit arbitrary-point and corner-point node sets
    pub named_point_sets: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            element_size_mm: 1.2747,
            z_policy: ZPolicy::Crop,
            material_id_range: [1, 255],
            round_trip: true,
            named_point_sets: false,
        }
    }
}

/// Units of the grayscale image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ImageType {
    /// Scanner attenuation units, calibrated through the image log
    Native,
    /// Already mineral density (mg HA / cm³)
    Bmd,
}

/// BV/TV correction curve for one scanner resolution
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ResolutionOverride {
    /// Voxel spacing this curve applies to (mm)
    pub spacing_mm: f64,
    pub slope: f64,
    pub intercept: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DensityConfig {
    pub image_type: ImageType,
    /// Default BV/TV correction slope
    pub bvtv_slope: f64,
    /// Default BV/TV correction intercept
    pub bvtv_intercept: f64,
    /// Resolution-specific curves, matched on voxel spacing
    pub resolution_overrides: Vec<ResolutionOverride>,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            image_type: ImageType::Native,
            bvtv_slope: 0.963,
            bvtv_intercept: 0.03814,
            resolution_overrides: vec![ResolutionOverride {
                spacing_mm: 0.082,
                slope: 0.745745,
                intercept: -0.0209902,
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Triangles closer than this to the z extremes are ignored (mm)
    pub boundary_tolerance_mm: f64,
    /// Fraction of surface triangles removed by decimation
    pub decimation_reduction: f64,
    /// Box kernel edge (elements) for the cortical tensor field
    pub kernel_size_cortical: usize,
    /// Box kernel edge (elements) for the trabecular tensor field
    pub kernel_size_trabecular: usize,
    /// Replace cortical fabric by the identity
    pub isotropic_cortex: bool,
    /// Eigenvalues assigned to cortical bone (ascending)
    pub cortical_eigenvalues: [f64; 3],
    /// Long axis used to orient cortical fabric
    pub reference_direction: [f64; 3],
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            boundary_tolerance_mm: 0.2,
            decimation_reduction: 0.9,
            kernel_size_cortical: 5,
            kernel_size_trabecular: 5,
            isotropic_cortex: false,
            cortical_eigenvalues: [0.915, 0.915, 1.17],
            reference_direction: [0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HomogenizationConfig {
    /// Edge of the cortical sampling ROI (mm)
    pub roi_size_cortical_mm: f64,
    /// Edge of the trabecular sampling ROI (mm)
    pub roi_size_trabecular_mm: f64,
    /// Rescale densities so total mineral content is preserved
    pub mass_conservation: bool,
    /// Floor positive phase densities at `minimum_bvtv`
    pub floor_bvtv: bool,
    pub minimum_bvtv: f64,
}

impl Default for HomogenizationConfig {
    fn default() -> Self {
        Self {
            roi_size_cortical_mm: 1.2747,
            roi_size_trabecular_mm: 2.5,
            mass_conservation: true,
            floor_bvtv: true,
            minimum_bvtv: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeckConfig {
    /// Geometric nonlinearity in the loading step
    pub nlgeom: bool,
    pub max_increments: usize,
    /// Boundary condition file included by the loading step
    pub boundary_conditions_file: String,
    pub reference_node_id: usize,
    /// Axial displacement written to the boundary condition file, if any (mm)
    pub reference_displacement_mm: Option<f64>,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            nlgeom: true,
            max_increments: 1000,
            boundary_conditions_file: "boundary_conditions.inp".to_string(),
            reference_node_id: 10_000_000,
            reference_displacement_mm: None,
        }
    }
}

impl HfeConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> HfeResult<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> HfeResult<Self> {
        let config: HfeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter sets that cannot produce a valid model.
    pub fn validate(&self) -> HfeResult<()> {
        let invalid = |msg: String| Err(HfeError::InvalidConfig(msg));

        if !(self.mesh.element_size_mm > 0.0) {
            return invalid(format!(
                "mesh.element_size_mm must be positive, got {}",
                self.mesh.element_size_mm
            ));
        }
        let [lo, hi] = self.mesh.material_id_range;
        if lo < 1 || lo > hi {
            return invalid(format!(
                "mesh.material_id_range must satisfy 1 <= min <= max, got [{lo}, {hi}]"
            ));
        }
        if !(0.0..1.0).contains(&self.fabric.decimation_reduction) {
            return invalid(format!(
                "fabric.decimation_reduction must lie in [0, 1), got {}",
                self.fabric.decimation_reduction
            ));
        }
        for (name, k) in [
            ("kernel_size_cortical", self.fabric.kernel_size_cortical),
            ("kernel_size_trabecular", self.fabric.kernel_size_trabecular),
        ] {
            if k == 0 || k % 2 == 0 {
                return invalid(format!("fabric.{name} must be odd and positive, got {k}"));
            }
        }
        if self.fabric.boundary_tolerance_mm < 0.0 {
            return invalid("fabric.boundary_tolerance_mm must not be negative".to_string());
        }
        if self.fabric.cortical_eigenvalues.iter().any(|&v| !(v > 0.0)) {
            return invalid("fabric.cortical_eigenvalues must be positive".to_string());
        }
        let dir = self.fabric.reference_direction;
        if dir.iter().map(|v| v * v).sum::<f64>() < 1e-12 {
            return invalid("fabric.reference_direction must be non-zero".to_string());
        }
        for (name, size) in [
            ("roi_size_cortical_mm", self.homogenization.roi_size_cortical_mm),
            ("roi_size_trabecular_mm", self.homogenization.roi_size_trabecular_mm),
        ] {
            if !(size > 0.0) {
                return invalid(format!("homogenization.{name} must be positive, got {size}"));
            }
        }
        if self.homogenization.floor_bvtv && !(0.0..=1.0).contains(&self.homogenization.minimum_bvtv) {
            return invalid("homogenization.minimum_bvtv must lie in [0, 1]".to_string());
        }
        if self.deck.max_increments == 0 {
            return invalid("deck.max_increments must be positive".to_string());
        }
        if self.deck.boundary_conditions_file.trim().is_empty() {
            return invalid("deck.boundary_conditions_file must be set".to_string());
        }
        Ok(())
    }

    /// BV/TV correction curve for the given voxel spacing.
    pub fn bvtv_curve(&self, spacing_mm: f64) -> (f64, f64) {
        self.density
            .resolution_overrides
            .iter()
            .find(|o| (o.spacing_mm - spacing_mm).abs() < 1e-6)
            .map(|o| (o.slope, o.intercept))
            .unwrap_or((self.density.bvtv_slope, self.density.bvtv_intercept))
    }

    /// Configuration summary, one line per entry
    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            "═══════════════════════════════════════════════════════════════".to_string(),
            "  hFE Preprocessing Configuration".to_string(),
            "═══════════════════════════════════════════════════════════════".to_string(),
            format!(
                "Mesh: element {:.4} mm, z policy {:?}, materials {}..={}",
                self.mesh.element_size_mm,
                self.mesh.z_policy,
                self.mesh.material_id_range[0],
                self.mesh.material_id_range[1]
            ),
            format!(
                "Density: {:?} units, BV/TV = {} x + {}",
                self.density.image_type, self.density.bvtv_slope, self.density.bvtv_intercept
            ),
            format!(
                "Fabric: kernels {} (cort) / {} (trab), reduction {:.2}, tolerance {:.3} mm{}",
                self.fabric.kernel_size_cortical,
                self.fabric.kernel_size_trabecular,
                self.fabric.decimation_reduction,
                self.fabric.boundary_tolerance_mm,
                if self.fabric.isotropic_cortex { ", isotropic cortex" } else { "" }
            ),
            format!(
                "Sampling: ROI {:.3} mm (cort) / {:.3} mm (trab), BMC {}, floor {}",
                self.homogenization.roi_size_cortical_mm,
                self.homogenization.roi_size_trabecular_mm,
                if self.homogenization.mass_conservation { "on" } else { "off" },
                if self.homogenization.floor_bvtv {
                    format!("{}", self.homogenization.minimum_bvtv)
                } else {
                    "off".to_string()
                }
            ),
            format!(
                "Step: NLGEOM={}, INC={}, include {}",
                if self.deck.nlgeom { "YES" } else { "NO" },
                self.deck.max_increments,
                self.deck.boundary_conditions_file
            ),
            "═══════════════════════════════════════════════════════════════".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = HfeConfig::from_toml_str(
            r#"
            [mesh]
            element_size_mm = 0.6
            z_policy = "Expand"

            [fabric]
            isotropic_cortex = true
            "#,
        )
        .unwrap();
        assert_eq!(config.mesh.element_size_mm, 0.6);
        assert_eq!(config.mesh.z_policy, ZPolicy::Expand);
        assert!(config.fabric.isotropic_cortex);
        assert_eq!(config.fabric.kernel_size_trabecular, 5);
        assert_eq!(config.density.image_type, ImageType::Native);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut config = HfeConfig::default();
        assert!(config.validate().is_ok());

        config.fabric.kernel_size_cortical = 4;
        assert!(matches!(config.validate(), Err(HfeError::InvalidConfig(_))));

        let mut config = HfeConfig::default();
        config.homogenization.roi_size_trabecular_mm = 0.0;
        assert!(config.validate().is_err());

        let mut config = HfeConfig::default();
        config.mesh.material_id_range = [0, 10];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolution_override() {
        let config = HfeConfig::default();
        assert_eq!(config.bvtv_curve(0.082), (0.745745, -0.0209902));
        assert_eq!(config.bvtv_curve(0.0607), (0.963, 0.03814));
    }

    #[test]
    fn test_parse_error_surfaces() {
        assert!(matches!(
            HfeConfig::from_toml_str("[mesh]\nelement_size_mm = \"big\""),
            Err(HfeError::ConfigParse(_))
        ));
    }
}
