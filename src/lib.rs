pub mod error;
pub mod config;
pub mod utils;
pub mod image;     // AIM codec, volumes, resampling
pub mod density;
pub mod mesh;
pub mod mesh_generator;
pub mod fabric;    // Surface fabric (MSL) estimation
pub mod homogenize;
pub mod pipeline;

pub use error::{HfeError, HfeResult};
pub use config::{HfeConfig, MeshConfig, DensityConfig, FabricConfig, HomogenizationConfig, DeckConfig, ImageType};
pub use image::{Volume, SegmentationMask, AimImage, AimVersion, PixelFormat, Calibration, ZPolicy, read_aim, write_aim, load_aim, save_aim};
pub use density::{DensityMapper, DensityMaps};
pub use mesh::{Mesh, Hex8Element, MeshQuality, assess_hex_quality, read_mesh, write_mesh, round_trip};
pub use mesh_generator::HexMeshGenerator;
pub use fabric::{FabricEngine, FabricFields, FabricStats, Fabric, resolve_fabric, project_cortical};
pub use homogenize::{Homogenizer, HomogenizationResult, ElementMaterial, PhaseKind, MassBalance, OutputDeck, compute_phi, compute_phase_densities, apply_mass_conservation, write_boundary_conditions};
pub use pipeline::{SpecimenPaths, SpecimenInputs, SpecimenContext, RunSummary, PipelineOutput, ProgressReporter, LogProgress, NoProgress, run_pipeline};
pub use utils::units;
