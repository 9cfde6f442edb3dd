use std::collections::BTreeMap;

/// An 8-node linear hexahedral element (Abaqus C3D8)
///
/// Node numbering:
/// Bottom face (z-): 0, 1, 2, 3 counter-clockwise seen from +z
/// Top face (z+):    4, 5, 6, 7 directly above 0, 1, 2, 3
///
/// Node ids are 1-based as in the deck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hex8Element {
    /// Element id (1-based)
    pub id: usize,
    /// Node ids in C3D8 order
    pub nodes: [usize; 8],
    /// Material (gray value) id
    pub material_id: u32,
}

impl Hex8Element {
    pub fn new(id: usize, nodes: [usize; 8], material_id: u32) -> Self {
        Self {
            id,
            nodes,
            material_id,
        }
    }

    /// For each corner, the three neighbours along local +ξ, +η, +ζ.
    ///
    /// Edge vectors from a corner to these neighbours form a right-handed
    /// triad in an undistorted element.
    pub fn corner_neighbors() -> [[usize; 3]; 8] {
        [
            [1, 3, 4],
            [2, 0, 5],
            [3, 1, 6],
            [0, 2, 7],
            [7, 5, 0],
            [4, 6, 1],
            [5, 7, 2],
            [6, 4, 3],
        ]
    }

    /// True when no node id appears twice
    pub fn has_distinct_nodes(&self) -> bool {
        let mut sorted = self.nodes;
        sorted.sort_unstable();
        sorted.windows(2).all(|w| w[0] != w[1])
    }
}

/// Connectivity information for the mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Connectivity {
    pub hex8_elements: Vec<Hex8Element>,
    /// Named element sets (element ids, ascending)
    pub element_sets: BTreeMap<String, Vec<usize>>,
}

impl Connectivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_element(&mut self, element: Hex8Element) {
        self.hex8_elements.push(element);
    }

    pub fn num_elements(&self) -> usize {
        self.hex8_elements.len()
    }

    pub fn add_to_set(&mut self, name: &str, element_id: usize) {
        self.element_sets
            .entry(name.to_string())
            .or_default()
            .push(element_id);
    }

    /// Distinct material ids, ascending
    pub fn material_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.hex8_elements.iter().map(|e| e.material_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// All node ids referenced by elements, ascending and unique
    pub fn used_nodes(&self) -> Vec<usize> {
        let mut used: Vec<usize> = self
            .hex8_elements
            .iter()
            .flat_map(|e| e.nodes.iter().copied())
            .collect();
        used.sort_unstable();
        used.dedup();
        used
    }
}
