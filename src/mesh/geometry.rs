use std::collections::BTreeMap;

use nalgebra::Point3;
use super::topology::{Connectivity, Hex8Element};

/// Geometric information for the mesh
///
/// Node ids are 1-based and dense: node `id` is stored at `nodes[id - 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geometry {
    /// Node coordinates (mm)
    pub nodes: Vec<Point3<f64>>,
    /// Named node sets (node ids, ascending)
    pub node_sets: BTreeMap<String, Vec<usize>>,
}

impl Geometry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its id
    pub fn add_node(&mut self, x: f64, y: f64, z: f64) -> usize {
        self.nodes.push(Point3::new(x, y, z));
        self.nodes.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_node(&self, id: usize) -> Option<&Point3<f64>> {
        id.checked_sub(1).and_then(|idx| self.nodes.get(idx))
    }

    pub fn add_node_set(&mut self, name: &str, mut ids: Vec<usize>) {
        ids.sort_unstable();
        ids.dedup();
        self.node_sets.insert(name.to_string(), ids);
    }
}

/// Complete mesh with geometry and topology
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub geometry: Geometry,
    pub connectivity: Connectivity,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_nodes(&self) -> usize {
        self.geometry.num_nodes()
    }

    pub fn num_elements(&self) -> usize {
        self.connectivity.num_elements()
    }

    /// Corner coordinates of an element, in connectivity order
    pub fn element_coords(&self, element: &Hex8Element) -> [Point3<f64>; 8] {
        element.nodes.map(|id| self.geometry.nodes[id - 1])
    }

    /// Mean of the eight corner coordinates
    pub fn element_centroid(&self, element: &Hex8Element) -> Point3<f64> {
        let coords = self.element_coords(element);
        let mut sum = nalgebra::Vector3::zeros();
        for p in &coords {
            sum += p.coords;
        }
        Point3::from(sum / 8.0)
    }

    /// True when every element references existing nodes only
    pub fn references_are_valid(&self) -> bool {
        let n = self.num_nodes();
        self.connectivity
            .hex8_elements
            .iter()
            .all(|e| e.nodes.iter().all(|&id| id >= 1 && id <= n))
    }
}
