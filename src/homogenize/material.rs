//! Per-element material assignment.
//!
//! Two passes over the mesh: the first samples partial volumes, phase
//! densities and fabric for every element in parallel; the second rescales
//! the densities so the mineral content of the model matches the image.

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::sampling::{compute_phase_densities, compute_phi, DensityRoi};
use crate::config::HfeConfig;
use crate::density::reconstructed_bmc;
use crate::error::{HfeError, HfeResult};
use crate::fabric::{mix_phases, project_cortical, resolve_fabric, Fabric, FabricFields};
use crate::mesh::Mesh;
use crate::pipeline::SpecimenContext;
use crate::utils::units::{mineral_content_mg, FULL_BONE_DENSITY_MG_CM3};

/// Which phases an element holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Cortical,
    Trabecular,
    Mixed,
}

/// Homogenized material of one bone element
#[derive(Debug, Clone, PartialEq)]
pub struct ElementMaterial {
    pub element_id: usize,
    pub centroid: Point3<f64>,
    pub phi_cortical: f64,
    pub phi_trabecular: f64,
    pub rho_cortical: f64,
    pub rho_trabecular: f64,
    pub fabric: Fabric,
    pub kind: PhaseKind,
    /// The fabric of at least one phase could not be resolved and was
    /// replaced by the identity
    pub isotropic_fallback: bool,
}

impl ElementMaterial {
    pub fn doa(&self) -> f64 {
        self.fabric.degree_of_anisotropy()
    }
}

/// Mineral balance of one phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseBalance {
    /// Image mineral content over the phase mask (mg HA)
    pub reconstructed_mg: f64,
    /// Model mineral content before rescaling (mg HA)
    pub simulated_mg: f64,
    /// Applied density factor
    pub factor: f64,
}

impl PhaseBalance {
    fn new(reconstructed_mg: f64, simulated_mg: f64) -> Self {
        let factor = if simulated_mg > 0.0 {
            reconstructed_mg / simulated_mg
        } else {
            1.0
        };
        Self {
            reconstructed_mg,
            simulated_mg,
            factor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassBalance {
    pub cortical: PhaseBalance,
    pub trabecular: PhaseBalance,
}

/// Output of [`Homogenizer::run`]
#[derive(Debug, Clone)]
pub struct HomogenizationResult {
    /// Bone elements in element id order
    pub materials: Vec<ElementMaterial>,
    pub void_elements: usize,
    pub isotropic_fallbacks: usize,
    /// Set once [`apply_mass_conservation`] has run
    pub mass_balance: Option<MassBalance>,
}

impl HomogenizationResult {
    pub fn count(&self, kind: PhaseKind) -> usize {
        self.materials.iter().filter(|m| m.kind == kind).count()
    }

    pub fn mean_doa(&self) -> f64 {
        if self.materials.is_empty() {
            return 0.0;
        }
        self.materials.iter().map(ElementMaterial::doa).sum::<f64>() / self.materials.len() as f64
    }
}

/// Element sampler and fabric resolver
#[derive(Debug, Clone, PartialEq)]
pub struct Homogenizer {
    pub roi: DensityRoi,
    /// Floor positive densities at this value, if set
    pub minimum_bvtv: Option<f64>,
    pub isotropic_cortex: bool,
    pub cortical_eigenvalues: [f64; 3],
    pub reference_direction: Vector3<f64>,
    pub mass_conservation: bool,
}

impl Homogenizer {
    pub fn from_config(config: &HfeConfig) -> Self {
        let h = &config.homogenization;
        Self {
            roi: DensityRoi {
                cortical_mm: h.roi_size_cortical_mm,
                trabecular_mm: h.roi_size_trabecular_mm,
            },
            minimum_bvtv: h.floor_bvtv.then_some(h.minimum_bvtv),
            isotropic_cortex: config.fabric.isotropic_cortex,
            cortical_eigenvalues: config.fabric.cortical_eigenvalues,
            reference_direction: Vector3::from(config.fabric.reference_direction),
            mass_conservation: h.mass_conservation,
        }
    }

    /// Sample every element of `mesh` against the specimen images.
    ///
    /// Elements without any bone are skipped and counted as void. Mass
    /// conservation is applied at the end when enabled.
    pub fn run(&self, mesh: &Mesh, context: &SpecimenContext, fabric: &FabricFields) -> HfeResult<HomogenizationResult> {
        let expected = context.grid.iter().product::<usize>();
        if fabric.cortical.tensors.len() != expected || fabric.trabecular.tensors.len() != expected {
            return Err(HfeError::ShapeMismatch(format!(
                "fabric fields hold {} tensors for an element grid of {:?}",
                fabric.cortical.tensors.len(),
                context.grid
            )));
        }
        if let Some(element) = mesh.connectivity.hex8_elements.iter().find(|e| e.id == 0 || e.id > expected) {
            return Err(HfeError::ShapeMismatch(format!(
                "element {} lies outside the element grid {:?}",
                element.id, context.grid
            )));
        }

        let sampled: Vec<Option<ElementMaterial>> = mesh
            .connectivity
            .hex8_elements
            .par_iter()
            .map(|element| self.sample_element(element.id, mesh.element_centroid(element), context, fabric))
            .collect();

        let total = sampled.len();
        let mut materials: Vec<ElementMaterial> = sampled.into_iter().flatten().collect();
        materials.sort_by_key(|m| m.element_id);
        let isotropic_fallbacks = materials.iter().filter(|m| m.isotropic_fallback).count();
        if isotropic_fallbacks > 0 {
            warn!(
                elements = isotropic_fallbacks,
                "Fabric could not be resolved; isotropic material assigned"
            );
        }

        let mut result = HomogenizationResult {
            void_elements: total - materials.len(),
            materials,
            isotropic_fallbacks,
            mass_balance: None,
        };

        if self.mass_conservation {
            let density = &context.density;
            let reconstructed = [
                reconstructed_bmc(&density.bmd_scaled, &context.cortical_mask)?,
                reconstructed_bmc(&density.bmd_scaled, &context.trabecular_mask)?,
            ];
            let element_volume = context.element_size.x.powi(3);
            result.mass_balance = Some(apply_mass_conservation(
                &mut result.materials,
                reconstructed[0],
                reconstructed[1],
                element_volume,
            ));
        }

        info!(
            bone = result.materials.len(),
            void = result.void_elements,
            mixed = result.count(PhaseKind::Mixed),
            mean_doa = result.mean_doa(),
            "Element materials assigned"
        );
        Ok(result)
    }

    fn sample_element(
        &self,
        element_id: usize,
        centroid: Point3<f64>,
        context: &SpecimenContext,
        fields: &FabricFields,
    ) -> Option<ElementMaterial> {
        let element_edge = context.element_size.x;
        let phi_cortical = compute_phi(&centroid, element_edge, &context.cortical_mask);
        let phi_trabecular = compute_phi(&centroid, element_edge, &context.trabecular_mask);
        if phi_cortical <= 0.0 && phi_trabecular <= 0.0 {
            return None;
        }

        let mut rho = compute_phase_densities(
            &centroid,
            self.roi,
            &context.density.bvtv_scaled,
            &context.cortical_mask,
            &context.trabecular_mask,
            phi_cortical,
            phi_trabecular,
        );
        if let Some(floor) = self.minimum_bvtv {
            if phi_cortical > 0.0 && rho.cortical < floor {
                rho.cortical = floor;
            }
            if phi_trabecular > 0.0 && rho.trabecular < floor {
                rho.trabecular = floor;
            }
        }

        let index = element_id - 1;
        let element_volume = element_edge.powi(3);
        let cortical = || {
            let bone_volume = compute_phi(&centroid, self.roi.cortical_mm, &context.cortical_bone) * element_volume;
            resolve_fabric(fields.cortical.get(index), bone_volume).map(|f| self.cortical_fabric(&f))
        };
        let trabecular = || {
            let bone_volume =
                compute_phi(&centroid, self.roi.trabecular_mm, &context.trabecular_bone) * element_volume;
            resolve_fabric(fields.trabecular.get(index), bone_volume)
        };

        // Each phase falls back on its own; a mixed element still blends
        // whatever anisotropy the other phase carries.
        let mut fallback = false;
        let mut settle = |fabric: Option<Fabric>| {
            fabric.unwrap_or_else(|| {
                fallback = true;
                Fabric::isotropic()
            })
        };
        let (kind, fabric) = if phi_cortical <= 0.0 {
            (PhaseKind::Trabecular, settle(trabecular()))
        } else if phi_trabecular <= 0.0 {
            (PhaseKind::Cortical, settle(cortical()))
        } else {
            let c = settle(cortical());
            let t = settle(trabecular());
            let mixed = mix_phases(&c, phi_cortical, &t, phi_trabecular);
            (PhaseKind::Mixed, settle(mixed))
        };
        if fallback {
            debug!(element = element_id, kind = ?kind, "Isotropic fabric fallback");
        }

        Some(ElementMaterial {
            element_id,
            centroid,
            phi_cortical,
            phi_trabecular,
            rho_cortical: rho.cortical,
            rho_trabecular: rho.trabecular,
            isotropic_fallback: fallback,
            fabric,
            kind,
        })
    }

    fn cortical_fabric(&self, fabric: &Fabric) -> Fabric {
        if self.isotropic_cortex {
            Fabric::isotropic()
        } else {
            project_cortical(fabric, &self.reference_direction, self.cortical_eigenvalues)
        }
    }
}

/// Model mineral content of one phase: `Σ ρ Φ V * 1200 / 1000` (mg HA).
pub fn simulated_bmc(pairs: impl Iterator<Item = (f64, f64)>, element_volume: f64) -> f64 {
    pairs
        .map(|(rho, phi)| mineral_content_mg(rho * phi * FULL_BONE_DENSITY_MG_CM3, element_volume))
        .sum()
}

/// Rescale every phase density so the model mineral content matches the
/// image, clamping the result at 1.
///
/// A phase without simulated mineral keeps its densities.
pub fn apply_mass_conservation(
    materials: &mut [ElementMaterial],
    reconstructed_cortical_mg: f64,
    reconstructed_trabecular_mg: f64,
    element_volume: f64,
) -> MassBalance {
    let cortical = PhaseBalance::new(
        reconstructed_cortical_mg,
        simulated_bmc(
            materials.iter().map(|m| (m.rho_cortical, m.phi_cortical)),
            element_volume,
        ),
    );
    let trabecular = PhaseBalance::new(
        reconstructed_trabecular_mg,
        simulated_bmc(
            materials.iter().map(|m| (m.rho_trabecular, m.phi_trabecular)),
            element_volume,
        ),
    );
    for (name, balance) in [("cortical", &cortical), ("trabecular", &trabecular)] {
        if balance.simulated_mg <= 0.0 {
            warn!(phase = name, "No simulated mineral content; density factor set to 1");
        }
    }

    materials.par_iter_mut().for_each(|m| {
        m.rho_cortical = (m.rho_cortical * cortical.factor).min(1.0);
        m.rho_trabecular = (m.rho_trabecular * trabecular.factor).min(1.0);
    });

    info!(
        cortical_factor = cortical.factor,
        trabecular_factor = trabecular.factor,
        cortical_bmc_mg = cortical.reconstructed_mg,
        trabecular_bmc_mg = trabecular.reconstructed_mg,
        "Mass conservation applied"
    );
    MassBalance { cortical, trabecular }
}
