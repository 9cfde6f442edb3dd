//! Bone surface extraction.
//!
//! Surface nets on the binarized segmentation: every grid cell whose corners
//! straddle the bone boundary gets one vertex (the mean of its crossing-edge
//! midpoints), and every sign-changing grid edge emits a quad joining the
//! four cells around it. The field is padded by one empty voxel on every
//! side, so the resulting surface is closed.

use std::collections::HashMap;

use nalgebra::{Point3, Vector3};
use tracing::info;

use crate::image::Volume;

/// Indexed triangle surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceMesh {
    /// Vertex positions (mm)
    pub vertices: Vec<Point3<f64>>,
    /// Triangles, counter-clockwise seen from outside the bone
    pub faces: Vec<[u32; 3]>,
}

impl SurfaceMesh {
    pub fn num_triangles(&self) -> usize {
        self.faces.len()
    }

    pub fn triangle(&self, face: usize) -> [Point3<f64>; 3] {
        self.faces[face].map(|v| self.vertices[v as usize])
    }

    pub fn area(&self) -> f64 {
        (0..self.faces.len())
            .map(|f| {
                let [a, b, c] = self.triangle(f);
                (b - a).cross(&(c - a)).norm() * 0.5
            })
            .sum()
    }

    /// Signed enclosed volume; positive when normals point outwards.
    pub fn enclosed_volume(&self) -> f64 {
        (0..self.faces.len())
            .map(|f| {
                let [a, b, c] = self.triangle(f);
                a.coords.dot(&b.coords.cross(&c.coords)) / 6.0
            })
            .sum()
    }
}

/// Axis-aligned unit offsets
const AXES: [[usize; 3]; 3] = [[1, 0, 0], [0, 1, 0], [0, 0, 1]];

/// Padded binary field: sample `p` is voxel `p - 1` of the mask, zero on the rim.
struct PaddedField<'a> {
    mask: &'a Volume<u8>,
    dims: [usize; 3],
}

impl<'a> PaddedField<'a> {
    fn new(mask: &'a Volume<u8>) -> Self {
        Self {
            mask,
            dims: mask.dims.map(|d| d + 2),
        }
    }

    #[inline]
    fn inside(&self, p: [usize; 3]) -> bool {
        let [x, y, z] = p;
        if x == 0 || y == 0 || z == 0 {
            return false;
        }
        let [nx, ny, nz] = self.mask.dims;
        if x > nx || y > ny || z > nz {
            return false;
        }
        self.mask.get(x - 1, y - 1, z - 1) != 0
    }

    fn cell_index(&self, c: [usize; 3]) -> usize {
        let [cx, cy, _] = self.dims.map(|d| d - 1);
        c[0] + cx * (c[1] + cy * c[2])
    }
}

/// Extract the closed boundary surface of all non-zero voxels.
///
/// Vertex positions are in physical units: padded sample `p` sits at
/// `(p - 1) * spacing`, i.e. voxel centres lie on integer multiples of the
/// spacing.
pub fn extract_isosurface(mask: &Volume<u8>) -> SurfaceMesh {
    let field = PaddedField::new(mask);
    let [px, py, pz] = field.dims;
    let spacing = mask.spacing;

    let mut surface = SurfaceMesh::default();
    let mut cell_vertex: HashMap<usize, u32> = HashMap::new();

    // One vertex per boundary cell
    for z in 0..pz - 1 {
        for y in 0..py - 1 {
            for x in 0..px - 1 {
                let mut corners = [false; 8];
                for (n, corner) in corners.iter_mut().enumerate() {
                    *corner = field.inside([x + (n & 1), y + ((n >> 1) & 1), z + ((n >> 2) & 1)]);
                }
                if corners.iter().all(|&c| c) || corners.iter().all(|&c| !c) {
                    continue;
                }

                let mut sum = Vector3::zeros();
                let mut crossings = 0.0;
                for a in 0..8usize {
                    for axis in 0..3 {
                        let b = a | (1 << axis);
                        if b == a || corners[a] == corners[b] {
                            continue;
                        }
                        let pa = Vector3::new(
                            (a & 1) as f64,
                            ((a >> 1) & 1) as f64,
                            ((a >> 2) & 1) as f64,
                        );
                        let mut mid = pa;
                        mid[axis] += 0.5;
                        sum += mid;
                        crossings += 1.0;
                    }
                }
                let local = sum / crossings;
                let position = Point3::new(
                    (x as f64 + local.x - 1.0) * spacing.x,
                    (y as f64 + local.y - 1.0) * spacing.y,
                    (z as f64 + local.z - 1.0) * spacing.z,
                );
                cell_vertex.insert(field.cell_index([x, y, z]), surface.vertices.len() as u32);
                surface.vertices.push(position);
            }
        }
    }

    // One quad per sign-changing grid edge
    for z in 0..pz - 1 {
        for y in 0..py - 1 {
            for x in 0..px - 1 {
                let p0 = [x, y, z];
                let inside0 = field.inside(p0);
                for (axis, step) in AXES.iter().enumerate() {
                    let p1 = [x + step[0], y + step[1], z + step[2]];
                    let inside1 = field.inside(p1);
                    // Sign changes never touch the empty rim, so both
                    // spanning coordinates are at least 1 here
                    if inside0 == inside1 {
                        continue;
                    }
                    // The two axes spanning the quad, in cyclic order after `axis`
                    let u = (axis + 1) % 3;
                    let v = (axis + 2) % 3;
                    let cell = |du: usize, dv: usize| {
                        let mut c = p0;
                        c[u] -= du;
                        c[v] -= dv;
                        cell_vertex[&field.cell_index(c)]
                    };
                    let mut quad = [cell(1, 1), cell(0, 1), cell(0, 0), cell(1, 0)];
                    if !inside0 {
                        quad.reverse();
                    }
                    surface.faces.push([quad[0], quad[1], quad[2]]);
                    surface.faces.push([quad[0], quad[2], quad[3]]);
                }
            }
        }
    }

    info!(
        vertices = surface.vertices.len(),
        triangles = surface.faces.len(),
        "Extracted bone isosurface"
    );
    surface
}
