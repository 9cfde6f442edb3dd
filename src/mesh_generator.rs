use nalgebra::Vector3;
use tracing::info;

use crate::error::{HfeError, HfeResult};
use crate::image::Volume;
use crate::mesh::{Hex8Element, Mesh};

/// Structured hexahedral mesh generator
///
/// Every element covers one coarsening-factor³ block of voxels. Node and
/// element ids follow the grid:
///
/// node(i, j, k)    = 1 + i + (nx + 1) * (j + (ny + 1) * k)
/// element(i, j, k) = 1 + i + nx * (j + ny * k)
///
/// so element id minus one is the linear index into per-element buffers.
pub struct HexMeshGenerator;

/// Outer faces of the block: (suffix, axis, use max side)
const FACES: [(&str, usize, bool); 6] = [
    ("S", 1, false),
    ("N", 1, true),
    ("E", 0, true),
    ("W", 0, false),
    ("T", 2, true),
    ("B", 2, false),
];

impl HexMeshGenerator {
    /// Element grid extents for an image: `floor(dims / factor)`
    pub fn grid_dims(image_dims: [usize; 3], factor: usize) -> [usize; 3] {
        image_dims.map(|d| d / factor.max(1))
    }

    /// Mesh every cell of the grid with material id 1
    ///
    /// # Arguments
    /// * `grid` - Number of elements along x, y, z
    /// * `element_size` - Element edge lengths (mm)
    /// * `material_range` - Admissible material ids
    /// * `named_point_sets` - Also emit arbitrary-point and corner sets
    pub fn full_block(
        grid: [usize; 3],
        element_size: Vector3<f64>,
        material_range: [u32; 2],
        named_point_sets: bool,
    ) -> HfeResult<Mesh> {
        let labels: Volume<u8> = Volume::filled(grid, element_size, 1);
        Self::from_labels(&labels, material_range, named_point_sets)
    }

    /// Mesh a coarse label volume; label 0 is void and gets no element
    ///
    /// Labels outside `material_range` are a configuration error.
    pub fn from_labels(
        labels: &Volume<u8>,
        material_range: [u32; 2],
        named_point_sets: bool,
    ) -> HfeResult<Mesh> {
        let [nx, ny, nz] = labels.dims;
        let size = labels.spacing;
        let [min_id, max_id] = material_range;

        for &label in &labels.data {
            let label = u32::from(label);
            if label != 0 && (label < min_id || label > max_id) {
                return Err(HfeError::MaterialIdOutOfRange {
                    label,
                    min: min_id,
                    max: max_id,
                });
            }
        }

        let mut mesh = Mesh::new();
        let node_id = |i: usize, j: usize, k: usize| 1 + i + (nx + 1) * (j + (ny + 1) * k);

        // Generate nodes for a structured grid
        for k in 0..=nz {
            for j in 0..=ny {
                for i in 0..=nx {
                    mesh.geometry.add_node(
                        i as f64 * size.x,
                        j as f64 * size.y,
                        k as f64 * size.z,
                    );
                }
            }
        }

        let mut face_elements: [Vec<usize>; 6] = Default::default();
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let material = u32::from(labels.get(i, j, k));
                    if material == 0 {
                        continue;
                    }
                    let id = 1 + i + nx * (j + ny * k);
                    let nodes = [
                        node_id(i, j, k),
                        node_id(i + 1, j, k),
                        node_id(i + 1, j + 1, k),
                        node_id(i, j + 1, k),
                        node_id(i, j, k + 1),
                        node_id(i + 1, j, k + 1),
                        node_id(i + 1, j + 1, k + 1),
                        node_id(i, j + 1, k + 1),
                    ];
                    mesh.connectivity
                        .add_element(Hex8Element::new(id, nodes, material));
                    mesh.connectivity.add_to_set(&format!("SET{material}"), id);

                    let idx = [i, j, k];
                    let last = [nx - 1, ny - 1, nz - 1];
                    for (f, &(_, axis, max_side)) in FACES.iter().enumerate() {
                        let on_face = if max_side {
                            idx[axis] == last[axis]
                        } else {
                            idx[axis] == 0
                        };
                        if on_face {
                            face_elements[f].push(id);
                        }
                    }
                }
            }
        }

        let extents = [nx, ny, nz];
        for (f, &(suffix, axis, max_side)) in FACES.iter().enumerate() {
            let layer = if max_side { extents[axis] } else { 0 };
            let mut nodes = Vec::new();
            for k in 0..=nz {
                for j in 0..=ny {
                    for i in 0..=nx {
                        if [i, j, k][axis] == layer {
                            nodes.push(node_id(i, j, k));
                        }
                    }
                }
            }
            if named_point_sets {
                if let Some(&first) = nodes.first() {
                    mesh.geometry
                        .add_node_set(&format!("ARB_NODE_{suffix}"), vec![first]);
                }
            }
            mesh.geometry
                .add_node_set(&format!("ALL_NODE_{suffix}"), nodes);
            let elements = std::mem::take(&mut face_elements[f]);
            if !elements.is_empty() {
                mesh.connectivity
                    .element_sets
                    .insert(format!("ALL_ELEM_{suffix}"), elements);
            }
        }

        if named_point_sets {
            for (k, tb) in [(0, "B"), (nz, "T")] {
                for (j, sn) in [(0, "S"), (ny, "N")] {
                    for (i, we) in [(0, "W"), (nx, "E")] {
                        mesh.geometry
                            .add_node_set(&format!("ACOR_NODE_{sn}{we}{tb}"), vec![node_id(i, j, k)]);
                    }
                }
            }
        }

        info!(
            nodes = mesh.num_nodes(),
            elements = mesh.num_elements(),
            grid = ?labels.dims,
            "Generated hexahedral mesh"
        );
        Ok(mesh)
    }
}
