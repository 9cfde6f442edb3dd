//! Local fabric estimation from the bone surface.
//!
//! The binarized segmentation is triangulated and decimated, every triangle
//! is attributed to a bone phase and a mesh element, and the area-weighted
//! normal dyadics are summed per element and box-filtered. The resulting
//! fields feed [`resolve_fabric`] in the homogenization step.

pub mod isosurface;
pub mod quadric;
pub mod decimate;
pub mod triangle;
pub mod msl;

pub use isosurface::{extract_isosurface, SurfaceMesh};
pub use quadric::Quadric;
pub use decimate::{decimate, DecimationStats};
pub use triangle::{classify_triangle, element_index, surface_triangles, SurfaceTriangle, TrianglePhase};
pub use msl::{mix_phases, project_cortical, resolve_fabric, Fabric, FabricField};

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::FabricConfig;
use crate::error::{HfeError, HfeResult};
use crate::image::Volume;

/// Triangle counters of one fabric run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FabricStats {
    pub triangles_extracted: usize,
    pub triangles_decimated: usize,
    pub triangles_cortical: usize,
    pub triangles_trabecular: usize,
    /// Within the boundary tolerance of the z ends
    pub triangles_excluded: usize,
    /// Centroid outside the element grid
    pub triangles_dropped: usize,
}

/// Smoothed dyadic fields of both phases
#[derive(Debug, Clone)]
pub struct FabricFields {
    pub cortical: FabricField,
    pub trabecular: FabricField,
    pub stats: FabricStats,
}

/// Per-element fabric field builder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FabricEngine {
    pub boundary_tolerance_mm: f64,
    pub decimation_reduction: f64,
    pub kernel_size_cortical: usize,
    pub kernel_size_trabecular: usize,
}

impl Default for FabricEngine {
    fn default() -> Self {
        Self::from_config(&FabricConfig::default())
    }
}

enum Sample {
    Excluded,
    Dropped,
    Hit {
        phase: TrianglePhase,
        element: usize,
        dyadic: Matrix3<f64>,
    },
}

impl FabricEngine {
    pub fn from_config(config: &FabricConfig) -> Self {
        Self {
            boundary_tolerance_mm: config.boundary_tolerance_mm,
            decimation_reduction: config.decimation_reduction,
            kernel_size_cortical: config.kernel_size_cortical,
            kernel_size_trabecular: config.kernel_size_trabecular,
        }
    }

    /// Build the cortical and trabecular fields for an element grid.
    ///
    /// # Arguments
    /// * `segmentation` - Bone labels; any non-zero voxel is bone
    /// * `trabecular_mask` - Non-zero inside the trabecular compartment
    /// * `grid` - Element counts along x, y, z
    /// * `element_size` - Element edge lengths (mm)
    pub fn compute(
        &self,
        segmentation: &Volume<u8>,
        trabecular_mask: &Volume<u8>,
        grid: [usize; 3],
        element_size: &Vector3<f64>,
    ) -> HfeResult<FabricFields> {
        if segmentation.dims != trabecular_mask.dims {
            return Err(HfeError::ShapeMismatch(format!(
                "segmentation {:?} vs trabecular mask {:?}",
                segmentation.dims, trabecular_mask.dims
            )));
        }

        let binary = segmentation.map(|v| u8::from(v != 0));
        let surface = extract_isosurface(&binary);
        let (surface, decimation) = decimate(&surface, self.decimation_reduction);
        let triangles = surface_triangles(&surface);

        let tolerance = self.boundary_tolerance_mm;
        let samples: Vec<Sample> = triangles
            .par_iter()
            .map(|t| match classify_triangle(t, trabecular_mask, tolerance) {
                TrianglePhase::Excluded => Sample::Excluded,
                phase => match element_index(&t.centroid, grid, element_size) {
                    Some(element) => Sample::Hit {
                        phase,
                        element,
                        dyadic: t.dyadic(),
                    },
                    None => {
                        debug!(centroid = ?t.centroid, "Triangle outside element grid");
                        Sample::Dropped
                    }
                },
            })
            .collect();

        let mut stats = FabricStats {
            triangles_extracted: decimation.original_triangles,
            triangles_decimated: decimation.final_triangles,
            ..Default::default()
        };
        let mut cortical = FabricField::zeros(grid);
        let mut trabecular = FabricField::zeros(grid);
        for sample in &samples {
            match sample {
                Sample::Excluded => stats.triangles_excluded += 1,
                Sample::Dropped => stats.triangles_dropped += 1,
                Sample::Hit {
                    phase,
                    element,
                    dyadic,
                } => {
                    if *phase == TrianglePhase::Trabecular {
                        stats.triangles_trabecular += 1;
                        trabecular.add(*element, dyadic);
                    } else {
                        stats.triangles_cortical += 1;
                        cortical.add(*element, dyadic);
                    }
                }
            }
        }
        if stats.triangles_dropped > 0 {
            warn!(
                dropped = stats.triangles_dropped,
                "Triangles mapped outside the element grid were dropped"
            );
        }

        let fields = FabricFields {
            cortical: cortical.smoothed(self.kernel_size_cortical),
            trabecular: trabecular.smoothed(self.kernel_size_trabecular),
            stats,
        };
        info!(
            cortical = stats.triangles_cortical,
            trabecular = stats.triangles_trabecular,
            excluded = stats.triangles_excluded,
            "Fabric fields computed"
        );
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ball(radius: f64, dims: usize) -> Volume<u8> {
        let mut mask: Volume<u8> = Volume::new([dims; 3], Vector3::new(1.0, 1.0, 1.0));
        let c = (dims / 2) as f64;
        for z in 0..dims {
            for y in 0..dims {
                for x in 0..dims {
                    let d2 = (x as f64 - c).powi(2) + (y as f64 - c).powi(2) + (z as f64 - c).powi(2);
                    if d2 <= radius * radius {
                        mask.set(x, y, z, 1);
                    }
                }
            }
        }
        mask
    }

    fn single_element_fabric(reduction: f64) -> Fabric {
        let seg = ball(7.0, 21);
        let all_trabecular: Volume<u8> = Volume::filled(seg.dims, seg.spacing, 1);
        let engine = FabricEngine {
            boundary_tolerance_mm: 0.2,
            decimation_reduction: reduction,
            kernel_size_cortical: 1,
            kernel_size_trabecular: 1,
        };
        let fields = engine
            .compute(&seg, &all_trabecular, [1, 1, 1], &Vector3::new(21.0, 21.0, 21.0))
            .unwrap();
        assert_eq!(fields.stats.triangles_cortical, 0);
        assert_eq!(fields.stats.triangles_excluded, 0);
        assert_eq!(fields.stats.triangles_dropped, 0);
        let bone_volume = seg.count_nonzero() as f64;
        resolve_fabric(fields.trabecular.get(0), bone_volume).unwrap()
    }

    #[test]
    fn test_ball_fabric_is_isotropic() {
        let fabric = single_element_fabric(0.0);
        assert!(
            fabric.degree_of_anisotropy() > 0.95,
            "eigenvalues {:?}",
            fabric.eigenvalues
        );
    }

    #[test]
    fn test_decimated_ball_fabric_is_nearly_isotropic() {
        let fabric = single_element_fabric(0.9);
        assert!(
            fabric.degree_of_anisotropy() > 0.75,
            "eigenvalues {:?}",
            fabric.eigenvalues
        );
    }

    #[test]
    fn test_phase_split_and_boundary_exclusion() {
        // Slab through the full height: top and bottom caps are excluded
        let mut seg: Volume<u8> = Volume::new([8, 8, 6], Vector3::new(0.5, 0.5, 0.5));
        let mut trab = seg.clone();
        for z in 0..6 {
            for y in 2..6 {
                for x in 2..6 {
                    seg.set(x, y, z, 1);
                    if x < 4 {
                        trab.set(x, y, z, 1);
                    }
                }
            }
        }
        let engine = FabricEngine {
            decimation_reduction: 0.0,
            ..FabricEngine::default()
        };
        let fields = engine
            .compute(&seg, &trab, [2, 2, 1], &Vector3::new(2.0, 2.0, 3.0))
            .unwrap();
        let s = fields.stats;
        assert!(s.triangles_excluded > 0);
        assert!(s.triangles_cortical > 0 && s.triangles_trabecular > 0);
        assert!(
            s.triangles_excluded + s.triangles_cortical + s.triangles_trabecular + s.triangles_dropped
                <= s.triangles_decimated
        );
        assert!(fields.cortical.tensors.iter().any(|t| t.trace() > 0.0));
    }

    #[test]
    fn test_mismatched_masks() {
        let seg: Volume<u8> = Volume::new([4, 4, 4], Vector3::new(1.0, 1.0, 1.0));
        let trab: Volume<u8> = Volume::new([4, 4, 5], Vector3::new(1.0, 1.0, 1.0));
        let err = FabricEngine::default()
            .compute(&seg, &trab, [1, 1, 1], &Vector3::new(4.0, 4.0, 4.0))
            .unwrap_err();
        assert!(matches!(err, HfeError::ShapeMismatch(_)));
    }
}
