//! Element homogenization: partial volumes, phase densities, fabric and the
//! solver deck.

pub mod sampling;
pub mod material;
pub mod deck;

pub use sampling::{compute_phase_densities, compute_phi, DensityRoi, PhaseDensities, RoiBounds};
pub use material::{
    apply_mass_conservation, simulated_bmc, ElementMaterial, HomogenizationResult, Homogenizer, MassBalance,
    PhaseBalance, PhaseKind,
};
pub use deck::{write_boundary_conditions, DeckElement, OutputDeck, STATE_VARIABLES};
