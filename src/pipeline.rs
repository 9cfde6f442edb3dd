//! End-to-end preprocessing of one specimen.
//!
//! [`SpecimenContext::prepare`] brings the density image and the masks onto
//! one padded grid, [`run_pipeline`] then builds the mesh, the fabric fields
//! and the element materials and assembles the output deck.

use std::path::PathBuf;

use nalgebra::Vector3;
use tracing::{info, warn};

use crate::config::HfeConfig;
use crate::density::{DensityMapper, DensityMaps};
use crate::error::{HfeError, HfeResult};
use crate::fabric::{FabricEngine, FabricStats};
use crate::homogenize::{HomogenizationResult, Homogenizer, MassBalance, OutputDeck, PhaseKind};
use crate::image::{adjust_size, align_to, coarsening_factor, load_aim, AimImage, SegmentationMask, Volume};
use crate::mesh::{assess_hex_quality, round_trip, HexMeshGenerator, Mesh, MeshQuality};

/// Receives coarse progress notifications from [`run_pipeline`].
pub trait ProgressReporter: Sync {
    /// `fraction` is the share of the run completed once `stage` starts
    fn stage(&self, stage: &str, fraction: f64);
}

/// Silent reporter
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn stage(&self, _stage: &str, _fraction: f64) {}
}

/// Forwards progress to the `tracing` subscriber
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn stage(&self, stage: &str, fraction: f64) {
        info!(percent = (fraction * 100.0).round() as u32, "{stage}");
    }
}

/// Locations of the images of one specimen
#[derive(Debug, Clone)]
pub struct SpecimenPaths {
    pub density: PathBuf,
    pub segmentation: PathBuf,
    pub cortical_mask: PathBuf,
    pub trabecular_mask: PathBuf,
    pub common_region: Option<PathBuf>,
}

/// Decoded images of one specimen
#[derive(Debug, Clone)]
pub struct SpecimenInputs {
    pub density: AimImage,
    pub segmentation: AimImage,
    pub cortical_mask: AimImage,
    pub trabecular_mask: AimImage,
    /// Region shared with a follow-up scan, applied to every image
    pub common_region: Option<AimImage>,
}

impl SpecimenInputs {
    /// Decode all images. Images without spacing tags inherit
    /// `fallback_spacing` (mm).
    pub fn load(paths: &SpecimenPaths, fallback_spacing: Vector3<f64>) -> HfeResult<Self> {
        let density = load_aim(&paths.density, fallback_spacing)?;
        let spacing = density.spacing();
        info!(dims = ?density.voxels.dims, spacing = ?spacing.as_slice(), "Density image decoded");
        Ok(Self {
            segmentation: load_aim(&paths.segmentation, spacing)?,
            cortical_mask: load_aim(&paths.cortical_mask, spacing)?,
            trabecular_mask: load_aim(&paths.trabecular_mask, spacing)?,
            common_region: paths
                .common_region
                .as_ref()
                .map(|p| load_aim(p, spacing))
                .transpose()?,
            density,
        })
    }
}

/// Specimen images on the padded grid shared by mesh and sampling
#[derive(Debug, Clone)]
pub struct SpecimenContext {
    /// Voxel spacing (mm)
    pub spacing: Vector3<f64>,
    /// Voxels per element edge
    pub factor: usize,
    /// Element edge lengths (mm)
    pub element_size: Vector3<f64>,
    /// Elements along x, y, z
    pub grid: [usize; 3],
    /// Extents of the density image before padding
    pub original_dims: [usize; 3],
    pub density: DensityMaps,
    pub segmentation: SegmentationMask,
    pub cortical_mask: Volume<u8>,
    pub trabecular_mask: Volume<u8>,
    /// Segmented bone inside the cortical mask
    pub cortical_bone: Volume<u8>,
    /// Segmented bone inside the trabecular mask
    pub trabecular_bone: Volume<u8>,
}

fn binary(image: &AimImage) -> Volume<u8> {
    image.voxels.map(|v| u8::from(v != 0))
}

fn mismatch<T, U>(what: &str, a: &Volume<T>, b: &Volume<U>) -> HfeError {
    HfeError::ShapeMismatch(format!("{what}: {:?} vs {:?}", a.dims, b.dims))
}

impl SpecimenContext {
    /// Align, mask and pad the specimen images and map the densities.
    pub fn prepare(inputs: &SpecimenInputs, config: &HfeConfig) -> HfeResult<Self> {
        let raw = &inputs.density.voxels;
        let spacing = raw.spacing;
        let dims = raw.dims;
        let factor = coarsening_factor(config.mesh.element_size_mm, &spacing)?;
        let element_size = spacing * factor as f64;

        let mut cortical = align_to(&binary(&inputs.cortical_mask), dims, &spacing)?;
        let mut trabecular = align_to(&binary(&inputs.trabecular_mask), dims, &spacing)?;
        let mut segmentation = align_to(
            &SegmentationMask::from_gray_values(&inputs.segmentation.voxels).labels,
            dims,
            &spacing,
        )?;
        let mut density = raw.clone();

        if let Some(region) = &inputs.common_region {
            let region = align_to(&binary(region), dims, &spacing)?;
            let keep = |v: &Volume<u8>| {
                v.zip_map(&region, |a, r| if r != 0 { a } else { 0 })
                    .ok_or_else(|| mismatch("common region", v, &region))
            };
            cortical = keep(&cortical)?;
            trabecular = keep(&trabecular)?;
            segmentation = keep(&segmentation)?;
            density = density
                .zip_map(&region, |d, r| if r != 0 { d } else { 0 })
                .ok_or_else(|| mismatch("common region", raw, &region))?;
            info!(voxels = region.count_nonzero(), "Common region applied");
        }

        let policy = config.mesh.z_policy;
        let density = adjust_size(&density, factor, policy);
        let cortical = adjust_size(&cortical, factor, policy);
        let trabecular = adjust_size(&trabecular, factor, policy);
        let segmentation = SegmentationMask::from_labels(adjust_size(&segmentation, factor, policy));

        let grid = HexMeshGenerator::grid_dims(density.dims, factor);
        if grid.contains(&0) {
            return Err(HfeError::InvalidConfig(format!(
                "image {dims:?} holds no complete element of {factor} voxels"
            )));
        }

        let mapper = DensityMapper::from_config(config, spacing.x);
        let maps = mapper.map(&density, &inputs.density.calibration, &cortical, &trabecular)?;
        let cortical_bone = segmentation
            .restricted_to(&cortical)
            .ok_or_else(|| mismatch("segmentation vs cortical mask", &segmentation.labels, &cortical))?;
        let trabecular_bone = segmentation
            .restricted_to(&trabecular)
            .ok_or_else(|| mismatch("segmentation vs trabecular mask", &segmentation.labels, &trabecular))?;

        info!(
            factor,
            element_size_mm = element_size.x,
            grid = ?grid,
            padded = ?density.dims,
            "Specimen prepared"
        );
        Ok(Self {
            spacing,
            factor,
            element_size,
            grid,
            original_dims: dims,
            density: maps,
            segmentation,
            cortical_mask: cortical,
            trabecular_mask: trabecular,
            cortical_bone,
            trabecular_bone,
        })
    }
}

/// Counters and balances of one run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub image_dims: [usize; 3],
    pub padded_dims: [usize; 3],
    pub coarsening_factor: usize,
    pub element_size_mm: f64,
    pub grid: [usize; 3],
    pub total_elements: usize,
    pub bone_elements: usize,
    pub void_elements: usize,
    pub cortical_elements: usize,
    pub trabecular_elements: usize,
    pub mixed_elements: usize,
    pub isotropic_fallbacks: usize,
    pub fabric: FabricStats,
    pub mass_balance: Option<MassBalance>,
    pub mean_doa: f64,
    pub mesh_quality: MeshQuality,
}

impl RunSummary {
    fn new(context: &SpecimenContext, result: &HomogenizationResult, fabric: FabricStats, quality: MeshQuality) -> Self {
        Self {
            image_dims: context.original_dims,
            padded_dims: context.density.bmd.dims,
            coarsening_factor: context.factor,
            element_size_mm: context.element_size.x,
            grid: context.grid,
            total_elements: result.materials.len() + result.void_elements,
            bone_elements: result.materials.len(),
            void_elements: result.void_elements,
            cortical_elements: result.count(PhaseKind::Cortical),
            trabecular_elements: result.count(PhaseKind::Trabecular),
            mixed_elements: result.count(PhaseKind::Mixed),
            isotropic_fallbacks: result.isotropic_fallbacks,
            fabric,
            mass_balance: result.mass_balance,
            mean_doa: result.mean_doa(),
            mesh_quality: quality,
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!(
                "Image: {:?} voxels, padded to {:?}, factor {}",
                self.image_dims, self.padded_dims, self.coarsening_factor
            ),
            format!("Elements: {:?} grid of {:.4} mm", self.grid, self.element_size_mm),
            format!(
                "  {} total, {} bone, {} void ({} cortical, {} trabecular, {} mixed)",
                self.total_elements,
                self.bone_elements,
                self.void_elements,
                self.cortical_elements,
                self.trabecular_elements,
                self.mixed_elements
            ),
            format!(
                "Triangles: {} extracted, {} after decimation, {} excluded, {} dropped",
                self.fabric.triangles_extracted,
                self.fabric.triangles_decimated,
                self.fabric.triangles_excluded,
                self.fabric.triangles_dropped
            ),
            format!(
                "Fabric: mean DOA {:.3}, {} isotropic fallbacks",
                self.mean_doa, self.isotropic_fallbacks
            ),
            self.mesh_quality.report(),
        ];
        match &self.mass_balance {
            Some(balance) => {
                for (name, phase) in [("cortical", &balance.cortical), ("trabecular", &balance.trabecular)] {
                    lines.push(format!(
                        "BMC {name}: image {:.2} mg, model {:.2} mg, factor {:.4}",
                        phase.reconstructed_mg, phase.simulated_mg, phase.factor
                    ));
                }
            }
            None => lines.push("BMC: mass conservation disabled".to_string()),
        }
        lines
    }
}

/// Everything a run produces
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub mesh: Mesh,
    pub homogenization: HomogenizationResult,
    pub deck: OutputDeck,
    pub summary: RunSummary,
}

/// Preprocess one specimen into a solver deck.
pub fn run_pipeline(
    inputs: &SpecimenInputs,
    config: &HfeConfig,
    progress: &dyn ProgressReporter,
) -> HfeResult<PipelineOutput> {
    config.validate()?;

    progress.stage("Preparing images", 0.0);
    let context = SpecimenContext::prepare(inputs, config)?;

    progress.stage("Generating mesh", 0.2);
    let mut mesh = HexMeshGenerator::full_block(
        context.grid,
        context.element_size,
        config.mesh.material_id_range,
        config.mesh.named_point_sets,
    )?;
    if config.mesh.round_trip {
        mesh = round_trip(&mesh)?;
    }
    let quality = assess_hex_quality(&mesh);
    if !quality.is_acceptable() {
        warn!(report = %quality.report(), "Mesh quality check failed");
    }

    progress.stage("Computing fabric", 0.3);
    let engine = FabricEngine::from_config(&config.fabric);
    let fabric = engine.compute(
        &context.segmentation.labels,
        &context.trabecular_mask,
        context.grid,
        &context.element_size,
    )?;

    progress.stage("Homogenizing elements", 0.7);
    let homogenization = Homogenizer::from_config(config).run(&mesh, &context, &fabric)?;

    progress.stage("Assembling deck", 0.9);
    let deck = OutputDeck::assemble(&mesh, &homogenization.materials, &config.deck)?;
    let summary = RunSummary::new(&context, &homogenization, fabric.stats, quality);
    progress.stage("Done", 1.0);

    Ok(PipelineOutput {
        mesh,
        homogenization,
        deck,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{scanner_log, PixelFormat};

    fn block_specimen() -> SpecimenInputs {
        let spacing = Vector3::new(0.25, 0.25, 0.25);
        let dims = [9, 9, 8];
        let log = scanner_log(dims, spacing, 8192.0, 1600.0, -400.0);
        let mut density: Volume<i16> = Volume::new(dims, spacing);
        let mut seg: Volume<i16> = Volume::new(dims, spacing);
        let mut cort: Volume<i16> = Volume::new(dims, spacing);
        let mut trab: Volume<i16> = Volume::new(dims, spacing);
        for z in 0..dims[2] {
            for y in 1..7 {
                for x in 1..7 {
                    density.set(x, y, z, 6000);
                    // Plates two voxels thick
                    if z % 3 != 2 {
                        seg.set(x, y, z, 127);
                    }
                    if x < 4 {
                        trab.set(x, y, z, 1);
                    } else {
                        cort.set(x, y, z, 1);
                    }
                }
            }
        }
        let image = |v: Volume<i16>| AimImage::new(v, PixelFormat::Short, log.clone());
        SpecimenInputs {
            density: image(density),
            segmentation: image(seg),
            cortical_mask: image(cort),
            trabecular_mask: image(trab),
            common_region: None,
        }
    }

    #[test]
    fn test_prepare_pads_to_element_multiple() {
        let mut config = HfeConfig::default();
        config.mesh.element_size_mm = 1.0;
        let context = SpecimenContext::prepare(&block_specimen(), &config).unwrap();
        assert_eq!(context.factor, 4);
        assert_eq!(context.original_dims, [9, 9, 8]);
        assert_eq!(context.density.bmd.dims, [12, 12, 8]);
        assert_eq!(context.grid, [3, 3, 2]);
        assert_eq!(context.cortical_mask.dims, context.trabecular_mask.dims);
        assert!(context.cortical_bone.count_nonzero() > 0);
    }

    #[test]
    fn test_too_small_image_is_rejected() {
        let mut config = HfeConfig::default();
        config.mesh.element_size_mm = 2.5;
        config.mesh.z_policy = crate::image::ZPolicy::Crop;
        let err = SpecimenContext::prepare(&block_specimen(), &config).unwrap_err();
        assert!(matches!(err, HfeError::InvalidConfig(_)));
    }

    #[test]
    fn test_run_pipeline_summary() {
        let mut config = HfeConfig::default();
        config.mesh.element_size_mm = 1.0;
        config.fabric.kernel_size_cortical = 1;
        config.fabric.kernel_size_trabecular = 1;
        let output = run_pipeline(&block_specimen(), &config, &NoProgress).unwrap();
        let s = &output.summary;
        assert_eq!(s.total_elements, 18);
        assert_eq!(s.bone_elements + s.void_elements, s.total_elements);
        assert!(s.bone_elements > 0);
        assert_eq!(
            s.cortical_elements + s.trabecular_elements + s.mixed_elements,
            s.bone_elements
        );
        assert!(s.mass_balance.is_some());
        assert_eq!(output.deck.elements.len(), s.bone_elements);
        assert!(s.lines().len() >= 7);
    }
}
