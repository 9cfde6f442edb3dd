//! Edge-collapse decimation with quadric error metrics.
//!
//! Collapses are taken cheapest first from a priority queue. A collapse is
//! rejected when it would change the surface topology (link condition), flip
//! a surviving triangle, or move a vertex on an open or non-manifold edge.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use nalgebra::{Point3, Vector3};
use tracing::{debug, info};

use super::isosurface::SurfaceMesh;
use super::quadric::Quadric;

/// Smallest closed surface kept by decimation
const MIN_TRIANGLES: usize = 4;

#[derive(Debug, Clone)]
struct EdgeCollapse {
    v1: u32,
    v2: u32,
    /// Versions of both endpoints when the candidate was queued
    stamp: (u32, u32),
    cost: f64,
    target: Point3<f64>,
}

impl PartialEq for EdgeCollapse {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EdgeCollapse {}

impl PartialOrd for EdgeCollapse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EdgeCollapse {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behaviour, ties broken by vertex ids
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| (other.v1, other.v2).cmp(&(self.v1, self.v2)))
    }
}

/// Decimation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecimationStats {
    pub original_triangles: usize,
    pub final_triangles: usize,
    pub collapses_performed: usize,
    pub collapses_rejected: usize,
}

struct Decimator {
    positions: Vec<Point3<f64>>,
    alive: Vec<bool>,
    locked: Vec<bool>,
    version: Vec<u32>,
    quadrics: Vec<Quadric>,
    faces: Vec<Option<[u32; 3]>>,
    vertex_faces: Vec<Vec<usize>>,
    active_faces: usize,
}

impl Decimator {
    fn new(mesh: &SurfaceMesh) -> Self {
        let n = mesh.vertices.len();
        let mut vertex_faces = vec![Vec::new(); n];
        let mut quadrics = vec![Quadric::default(); n];
        let mut edge_uses: HashMap<(u32, u32), usize> = HashMap::new();

        for (f, face) in mesh.faces.iter().enumerate() {
            let [p0, p1, p2] = face.map(|v| mesh.vertices[v as usize]);
            let plane = Quadric::from_triangle(&p0, &p1, &p2);
            for k in 0..3 {
                let v = face[k];
                vertex_faces[v as usize].push(f);
                if let Some(q) = &plane {
                    quadrics[v as usize].add(q);
                }
                let w = face[(k + 1) % 3];
                *edge_uses.entry((v.min(w), v.max(w))).or_insert(0) += 1;
            }
        }

        // Vertices on open or non-manifold edges never move
        let mut locked = vec![false; n];
        for (&(a, b), &uses) in &edge_uses {
            if uses != 2 {
                locked[a as usize] = true;
                locked[b as usize] = true;
            }
        }

        Self {
            positions: mesh.vertices.clone(),
            alive: vec![true; n],
            locked,
            version: vec![0; n],
            quadrics,
            faces: mesh.faces.iter().copied().map(Some).collect(),
            vertex_faces,
            active_faces: mesh.faces.len(),
        }
    }

    /// Live vertices sharing a live face with `v`, ascending
    fn neighbors(&self, v: u32) -> BTreeSet<u32> {
        let mut out = BTreeSet::new();
        for &f in &self.vertex_faces[v as usize] {
            if let Some(face) = self.faces[f] {
                out.extend(face.iter().copied().filter(|&w| w != v));
            }
        }
        out
    }

    fn candidate(&self, v1: u32, v2: u32) -> Option<EdgeCollapse> {
        if self.locked[v1 as usize] || self.locked[v2 as usize] {
            return None;
        }
        let mut combined = self.quadrics[v1 as usize];
        combined.add(&self.quadrics[v2 as usize]);
        let p1 = self.positions[v1 as usize];
        let p2 = self.positions[v2 as usize];
        let target = combined
            .optimal_point()
            .unwrap_or_else(|| Point3::from((p1.coords + p2.coords) * 0.5));
        Some(EdgeCollapse {
            v1,
            v2,
            stamp: (self.version[v1 as usize], self.version[v2 as usize]),
            cost: combined.evaluate(&target),
            target,
        })
    }

    fn is_stale(&self, c: &EdgeCollapse) -> bool {
        !self.alive[c.v1 as usize]
            || !self.alive[c.v2 as usize]
            || c.stamp != (self.version[c.v1 as usize], self.version[c.v2 as usize])
    }

    /// Link condition: the endpoints may share only the two opposite vertices.
    fn preserves_topology(&self, v1: u32, v2: u32) -> bool {
        let n1 = self.neighbors(v1);
        let n2 = self.neighbors(v2);
        n1.contains(&v2) && n1.intersection(&n2).count() <= 2
    }

    fn face_normal(p: [Point3<f64>; 3]) -> Vector3<f64> {
        (p[1] - p[0]).cross(&(p[2] - p[0]))
    }

    /// No surviving face around `v1` or `v2` may flip or collapse to zero area.
    fn preserves_orientation(&self, v1: u32, v2: u32, target: &Point3<f64>) -> bool {
        for &v in &[v1, v2] {
            for &f in &self.vertex_faces[v as usize] {
                let Some(face) = self.faces[f] else {
                    continue;
                };
                if face.contains(&v1) && face.contains(&v2) {
                    continue;
                }
                let before = face.map(|w| self.positions[w as usize]);
                let after = face.map(|w| {
                    if w == v1 || w == v2 {
                        *target
                    } else {
                        self.positions[w as usize]
                    }
                });
                let n_before = Self::face_normal(before);
                let n_after = Self::face_normal(after);
                if n_after.norm_squared() < 1e-24 || n_before.dot(&n_after) <= 0.0 {
                    return false;
                }
            }
        }
        true
    }

    /// Merge `v2` into `v1` at `target`.
    fn collapse(&mut self, v1: u32, v2: u32, target: Point3<f64>) {
        self.positions[v1 as usize] = target;
        let q2 = self.quadrics[v2 as usize];
        self.quadrics[v1 as usize].add(&q2);
        self.alive[v2 as usize] = false;

        let moved = std::mem::take(&mut self.vertex_faces[v2 as usize]);
        for f in moved {
            let Some(mut face) = self.faces[f] else {
                continue;
            };
            if face.contains(&v1) {
                self.faces[f] = None;
                self.active_faces -= 1;
                continue;
            }
            for w in face.iter_mut() {
                if *w == v2 {
                    *w = v1;
                }
            }
            self.faces[f] = Some(face);
            self.vertex_faces[v1 as usize].push(f);
        }

        let faces = &self.faces;
        self.vertex_faces[v1 as usize].retain(|&f| faces[f].is_some());
        self.vertex_faces[v1 as usize].sort_unstable();
        self.vertex_faces[v1 as usize].dedup();
        self.version[v1 as usize] += 1;
        self.version[v2 as usize] += 1;
    }

    fn into_mesh(self) -> SurfaceMesh {
        let mut remap = vec![u32::MAX; self.positions.len()];
        let mut out = SurfaceMesh::default();
        for face in self.faces.iter().flatten() {
            let mut new_face = [0u32; 3];
            for (k, &v) in face.iter().enumerate() {
                if remap[v as usize] == u32::MAX {
                    remap[v as usize] = out.vertices.len() as u32;
                    out.vertices.push(self.positions[v as usize]);
                }
                new_face[k] = remap[v as usize];
            }
            out.faces.push(new_face);
        }
        out
    }
}

/// Remove `reduction` (0..1) of the triangles of `mesh`.
///
/// The target count is `ceil(n * (1 - reduction))`; fewer collapses happen
/// when every remaining candidate is rejected.
pub fn decimate(mesh: &SurfaceMesh, reduction: f64) -> (SurfaceMesh, DecimationStats) {
    let original = mesh.faces.len();
    let target = ((original as f64) * (1.0 - reduction.clamp(0.0, 1.0))).ceil() as usize;
    let target = target.max(MIN_TRIANGLES);
    let mut stats = DecimationStats {
        original_triangles: original,
        final_triangles: original,
        ..Default::default()
    };
    if original <= target {
        return (mesh.clone(), stats);
    }

    info!(original, target, "Starting surface decimation");

    let mut state = Decimator::new(mesh);
    let mut heap = BinaryHeap::new();
    let mut seen = BTreeSet::new();
    for face in &mesh.faces {
        for k in 0..3 {
            let (a, b) = (face[k], face[(k + 1) % 3]);
            if seen.insert((a.min(b), a.max(b))) {
                if let Some(c) = state.candidate(a, b) {
                    heap.push(c);
                }
            }
        }
    }

    while state.active_faces > target {
        let Some(c) = heap.pop() else {
            break;
        };
        if state.is_stale(&c) {
            continue;
        }
        if !state.preserves_topology(c.v1, c.v2) || !state.preserves_orientation(c.v1, c.v2, &c.target) {
            stats.collapses_rejected += 1;
            continue;
        }

        state.collapse(c.v1, c.v2, c.target);
        stats.collapses_performed += 1;

        for w in state.neighbors(c.v1) {
            if let Some(next) = state.candidate(c.v1, w) {
                heap.push(next);
            }
        }
    }

    stats.final_triangles = state.active_faces;
    let out = state.into_mesh();
    debug!(vertices = out.vertices.len(), faces = out.faces.len(), "Built decimated surface");
    info!(
        final_triangles = stats.final_triangles,
        collapses = stats.collapses_performed,
        rejected = stats.collapses_rejected,
        "Decimation complete"
    );
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::extract_isosurface;
    use crate::image::Volume;
    use std::collections::BTreeMap;

    fn block(n: usize) -> SurfaceMesh {
        let mut mask: Volume<u8> = Volume::new([n + 2; 3], Vector3::new(1.0, 1.0, 1.0));
        for z in 1..=n {
            for y in 1..=n {
                for x in 1..=n {
                    mask.set(x, y, z, 1);
                }
            }
        }
        extract_isosurface(&mask)
    }

    #[test]
    fn test_reduces_and_stays_closed() {
        let mesh = block(6);
        let (out, stats) = decimate(&mesh, 0.9);
        assert_eq!(stats.original_triangles, mesh.num_triangles());
        assert_eq!(stats.final_triangles, out.num_triangles());
        assert!(out.num_triangles() < mesh.num_triangles() / 2);

        let mut uses = BTreeMap::new();
        for f in &out.faces {
            for k in 0..3 {
                let (a, b) = (f[k], f[(k + 1) % 3]);
                *uses.entry((a.min(b), a.max(b))).or_insert(0usize) += 1;
            }
        }
        assert!(uses.values().all(|&n| n == 2), "decimated surface must stay closed");
        assert!(out.enclosed_volume() > 0.0);
    }

    #[test]
    fn test_flat_regions_collapse_without_volume_loss() {
        let mesh = block(8);
        let before = mesh.enclosed_volume();
        let (out, _) = decimate(&mesh, 0.5);
        let after = out.enclosed_volume();
        assert!((after - before).abs() / before < 0.1, "{before} -> {after}");
    }

    #[test]
    fn test_zero_reduction_is_identity() {
        let mesh = block(2);
        let (out, stats) = decimate(&mesh, 0.0);
        assert_eq!(out, mesh);
        assert_eq!(stats.collapses_performed, 0);
    }

    #[test]
    fn test_open_surface_boundary_is_kept() {
        // Single square, both triangles on the rim
        let mesh = SurfaceMesh {
            vertices: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            faces: vec![[0, 1, 2], [0, 2, 3]],
        };
        let (out, stats) = decimate(&mesh, 0.9);
        assert_eq!(out.num_triangles(), 2);
        assert_eq!(stats.collapses_performed, 0);
    }
}
