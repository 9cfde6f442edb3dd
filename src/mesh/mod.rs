pub mod topology;
pub mod geometry;
pub mod quality;
pub mod inp;

pub use topology::{Connectivity, Hex8Element};
pub use geometry::{Geometry, Mesh};
pub use quality::{assess_hex_quality, compute_hex_jacobians, MeshQuality};
pub use inp::{read_mesh, round_trip, write_mesh};
pub use crate::mesh_generator::HexMeshGenerator;
