//! Solver input deck for the homogenized model.
//!
//! Only bone elements and their nodes are written. Each element carries its
//! own element set, local orientation and user material with the seven
//! constants `ρc, ρt, Φc, Φt, λmin, λmid, λmax`. The top layer (minimum z)
//! is coupled to a reference node and the bottom layer (maximum z) is fixed.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use nalgebra::Point3;
use tracing::info;

use super::material::ElementMaterial;
use crate::config::DeckConfig;
use crate::error::{HfeError, HfeResult};
use crate::mesh::inp::write_id_block;
use crate::mesh::Mesh;
use crate::utils::round_to;

/// Number of solution-dependent state variables of the user material
pub const STATE_VARIABLES: usize = 31;

/// Decimals kept for densities and partial volumes
const MATERIAL_DECIMALS: i32 = 5;

/// Relative tolerance when collecting the extremal node layers
const LAYER_TOLERANCE: f64 = 1e-9;

/// Bone element ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct DeckElement {
    pub id: usize,
    pub nodes: [usize; 8],
    pub material: ElementMaterial,
}

/// Assembled output deck
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDeck {
    /// Nodes referenced by bone elements, ascending id
    pub nodes: Vec<(usize, Point3<f64>)>,
    /// Ascending element id
    pub elements: Vec<DeckElement>,
    /// Nodes of the minimum-z layer
    pub top_nodes: Vec<usize>,
    /// Nodes of the maximum-z layer
    pub bottom_nodes: Vec<usize>,
    pub reference_node: (usize, Point3<f64>),
    pub nlgeom: bool,
    pub max_increments: usize,
    pub boundary_conditions_file: String,
}

impl OutputDeck {
    /// Pair each material with its mesh element and collect the node layers.
    pub fn assemble(mesh: &Mesh, materials: &[ElementMaterial], config: &DeckConfig) -> HfeResult<Self> {
        if materials.is_empty() {
            return Err(HfeError::EmptyModel);
        }
        let by_id: BTreeMap<usize, &[usize; 8]> = mesh
            .connectivity
            .hex8_elements
            .iter()
            .map(|e| (e.id, &e.nodes))
            .collect();

        let mut elements = Vec::with_capacity(materials.len());
        let mut used = BTreeSet::new();
        for material in materials {
            let nodes = by_id.get(&material.element_id).ok_or_else(|| {
                HfeError::ShapeMismatch(format!("material for element {} which is not in the mesh", material.element_id))
            })?;
            used.extend(nodes.iter().copied());
            elements.push(DeckElement {
                id: material.element_id,
                nodes: **nodes,
                material: material.clone(),
            });
        }
        elements.sort_by_key(|e| e.id);

        let nodes = used
            .iter()
            .map(|&id| {
                mesh.geometry
                    .get_node(id)
                    .map(|p| (id, *p))
                    .ok_or_else(|| HfeError::ShapeMismatch(format!("element references missing node {id}")))
            })
            .collect::<HfeResult<Vec<_>>>()?;

        let (z_min, z_max) = nodes
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, p)| (lo.min(p.z), hi.max(p.z)));
        let tolerance = LAYER_TOLERANCE * (z_max - z_min).abs().max(1.0);
        let layer = |z: f64| -> Vec<usize> {
            nodes
                .iter()
                .filter(|(_, p)| (p.z - z).abs() <= tolerance)
                .map(|(id, _)| *id)
                .collect()
        };
        let top_nodes = layer(z_min);
        let bottom_nodes = layer(z_max);

        let n = nodes.len() as f64;
        let center_x = nodes.iter().map(|(_, p)| p.x).sum::<f64>() / n;
        let center_y = nodes.iter().map(|(_, p)| p.y).sum::<f64>() / n;
        let max_node = nodes.last().map_or(0, |(id, _)| *id);
        let reference_id = config.reference_node_id.max(max_node + 1);

        info!(
            elements = elements.len(),
            nodes = nodes.len(),
            top = top_nodes.len(),
            bottom = bottom_nodes.len(),
            "Output deck assembled"
        );
        Ok(Self {
            nodes,
            elements,
            top_nodes,
            bottom_nodes,
            reference_node: (reference_id, Point3::new(center_x, center_y, z_min)),
            nlgeom: config.nlgeom,
            max_increments: config.max_increments,
            boundary_conditions_file: config.boundary_conditions_file.clone(),
        })
    }

    /// Serialize the deck.
    pub fn write<W: Write>(&self, w: &mut W) -> HfeResult<()> {
        writeln!(w, "*HEADING")?;
        writeln!(
            w,
            "** homogenized finite element model: {} nodes, {} bone elements",
            self.nodes.len(),
            self.elements.len()
        )?;
        writeln!(w, "*NODE")?;
        for (id, p) in &self.nodes {
            writeln!(w, "{id}, {}, {}, {}", p.x, p.y, p.z)?;
        }
        writeln!(w, "*ELEMENT, TYPE=C3D8, ELSET=BONE")?;
        for e in &self.elements {
            let nodes: Vec<String> = e.nodes.iter().map(|n| n.to_string()).collect();
            writeln!(w, "{}, {}", e.id, nodes.join(", "))?;
        }
        writeln!(w, "***********************************************************")?;

        for e in &self.elements {
            self.write_element_material(w, e)?;
        }

        writeln!(w, "*NSET, NSET=TOPNODES")?;
        write_id_block(w, &self.top_nodes)?;
        writeln!(w, "*NSET, NSET=BOTNODES")?;
        write_id_block(w, &self.bottom_nodes)?;
        writeln!(w, "*BOUNDARY, TYPE=DISPLACEMENT")?;
        writeln!(w, "BOTNODES, 1, 3, 0")?;

        let (ref_id, ref_point) = &self.reference_node;
        writeln!(w, "*NODE")?;
        writeln!(w, "{ref_id}, {}, {}, {}", ref_point.x, ref_point.y, ref_point.z)?;
        writeln!(w, "*NSET, NSET=REF_NODE")?;
        writeln!(w, "{ref_id}")?;
        writeln!(w, "*KINEMATIC COUPLING, REF NODE=REF_NODE")?;
        writeln!(w, "TOPNODES, 1, 6")?;
        writeln!(w, "***********************************************************")?;

        writeln!(
            w,
            "*STEP,AMPLITUDE=RAMP,UNSYMM=YES,INC={},NLGEOM={}",
            self.max_increments,
            if self.nlgeom { "YES" } else { "NO" }
        )?;
        writeln!(w, "*STATIC")?;
        writeln!(w, "0.1, 1.0, 1e-05, 0.1")?;
        writeln!(w, "*INCLUDE, input={}", self.boundary_conditions_file)?;
        writeln!(w, "*OUTPUT,FIELD")?;
        writeln!(w, "*ELEMENT OUTPUT, POSITION=CENTROIDAL")?;
        writeln!(w, "SDV2, SDV15, SDV16, SDV17, SDV18, SDV22")?;
        writeln!(w, "SDV23, SDV24, SDV25, SDV26, SDV27, SDV28, SDV29, SDV30, SDV31")?;
        writeln!(w, "S, LE, COORD")?;
        writeln!(w, "*NODE OUTPUT")?;
        writeln!(w, "U, RF, CF")?;
        writeln!(w, "*OUTPUT, HISTORY")?;
        writeln!(w, "*NODE OUTPUT, NSET=REF_NODE")?;
        writeln!(w, "U, RF")?;
        writeln!(w, "*NODE PRINT, NSET=REF_NODE, FREQUENCY=1, SUMMARY=NO")?;
        writeln!(w, "U, RF, CF")?;
        writeln!(w, "*END STEP")?;
        Ok(())
    }

    fn write_element_material<W: Write>(&self, w: &mut W, e: &DeckElement) -> HfeResult<()> {
        let id = e.id;
        let m = &e.material;
        let c = &m.centroid;
        // Local 1 and 2 along the mid and max axes; local 3 is then the min axis
        let a = m.fabric.mid_vector();
        let b = m.fabric.max_vector();
        let ev = &m.fabric.eigenvalues;

        writeln!(w, "*ELSET, ELSET=Elset{id}")?;
        writeln!(w, "{id}")?;
        writeln!(w, "**POSITION: X = {} Y = {} Z = {}", c.x, c.y, c.z)?;
        writeln!(w, "*ORIENTATION, NAME=Orient{id}")?;
        writeln!(w, "{}, {}, {}, {}, {}, {}", a.x, a.y, a.z, b.x, b.y, b.z)?;
        writeln!(w, "1, 0.")?;
        writeln!(w, "*SOLID SECTION, ELSET=Elset{id}, MATERIAL=Mat{id}, ORIENTATION=Orient{id}")?;
        writeln!(w, "*MATERIAL, NAME=Mat{id}")?;
        writeln!(w, "*USER MATERIAL, CONSTANTS=7, UNSYMM, TYPE=MECHANICAL")?;
        writeln!(
            w,
            "**BVTVcort, BVTVtrab, BPVcort, BPVtrab, eigenvalue min, eigenvalue mid, eigenvalue max"
        )?;
        writeln!(
            w,
            "{}, {}, {}, {}, {}, {}, {}",
            round_to(m.rho_cortical, MATERIAL_DECIMALS),
            round_to(m.rho_trabecular, MATERIAL_DECIMALS),
            round_to(m.phi_cortical, MATERIAL_DECIMALS),
            round_to(m.phi_trabecular, MATERIAL_DECIMALS),
            ev[0],
            ev[1],
            ev[2]
        )?;
        writeln!(w, "*DEPVAR")?;
        writeln!(w, "{STATE_VARIABLES},")?;
        writeln!(w, "2, DMG, Damage")?;
        writeln!(w, "15, BVTVc, BVTVC")?;
        writeln!(w, "16, BVTVt, BVTVT")?;
        writeln!(w, "17, PBVc, PBVC")?;
        writeln!(w, "18, PBVt, PBVT")?;
        writeln!(w, "22, OFvalue, OF")?;
        for (k, name) in ["F11", "F12", "F13", "F21", "F22", "F23", "F31", "F32", "F33"].iter().enumerate() {
            writeln!(w, "{}, {name}, {name}", 23 + k)?;
        }
        Ok(())
    }
}

/// Companion include for the loading step: axial displacement of the
/// reference node, all other degrees of freedom held.
pub fn write_boundary_conditions<W: Write>(w: &mut W, displacement_mm: f64) -> HfeResult<()> {
    writeln!(w, "*BOUNDARY, TYPE=DISPLACEMENT")?;
    writeln!(w, "REF_NODE, 3, 3, {displacement_mm}")?;
    writeln!(w, "REF_NODE, 1, 2, 0.0")?;
    writeln!(w, "REF_NODE, 4, 6, 0.0")?;
    Ok(())
}
