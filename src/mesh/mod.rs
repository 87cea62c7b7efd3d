//! Minimal triangle mesh and horizontal slicing.
//!
//! The organic renderer extrudes branch tubes into one cumulative mesh
//! and re-slices it at the layer mid-planes. Only what that path needs
//! lives here: an indexed triangle soup, merging, and plane slicing with
//! loop stitching.

use crate::geometry::{Point, Polygon, Polygons};
use crate::{scale, CoordF};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A 3D vertex in millimeters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub x: CoordF,
    pub y: CoordF,
    pub z: CoordF,
}

impl Vertex {
    #[inline]
    pub const fn new(x: CoordF, y: CoordF, z: CoordF) -> Self {
        Self { x, y, z }
    }
}

/// An indexed triangle soup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriangleMesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<[u32; 3]>,
}

impl TriangleMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn add_vertex(&mut self, v: Vertex) -> u32 {
        self.vertices.push(v);
        (self.vertices.len() - 1) as u32
    }

    #[inline]
    pub fn add_triangle(&mut self, a: u32, b: u32, c: u32) {
        self.indices.push([a, b, c]);
    }

    /// Append another mesh, remapping its indices.
    pub fn merge(&mut self, other: &TriangleMesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.indices
            .extend(other.indices.iter().map(|t| [t[0] + base, t[1] + base, t[2] + base]));
    }

    /// Z range covered by the mesh, or None when empty.
    pub fn z_span(&self) -> Option<(CoordF, CoordF)> {
        if self.vertices.is_empty() {
            return None;
        }
        let mut min = CoordF::MAX;
        let mut max = CoordF::MIN;
        for v in &self.vertices {
            min = min.min(v.z);
            max = max.max(v.z);
        }
        Some((min, max))
    }
}

/// Quantization used to snap slice segment endpoints for stitching (mm).
const STITCH_EPS: CoordF = 1e-4;

#[inline]
fn quantize(v: CoordF) -> i64 {
    (v / STITCH_EPS).round() as i64
}

/// Slice a mesh at the given Z planes (mm), one polygon set per plane.
///
/// Each triangle crossing a plane contributes one segment; segments are
/// stitched into loops by snapping endpoints to a fine grid. Open chains
/// (from non-watertight regions) are closed directly, which is adequate
/// for the tube meshes this crate produces.
pub fn slice_mesh(mesh: &TriangleMesh, z_planes: &[CoordF]) -> Vec<Polygons> {
    z_planes.iter().map(|&z| slice_at(mesh, z)).collect()
}

fn slice_at(mesh: &TriangleMesh, z: CoordF) -> Polygons {
    let mut segments: Vec<(Vertex, Vertex)> = Vec::new();

    for tri in &mesh.indices {
        let a = mesh.vertices[tri[0] as usize];
        let b = mesh.vertices[tri[1] as usize];
        let c = mesh.vertices[tri[2] as usize];

        let mut crossings: Vec<Vertex> = Vec::with_capacity(2);
        for (p, q) in [(a, b), (b, c), (c, a)] {
            if (p.z > z) != (q.z > z) {
                let t = (z - p.z) / (q.z - p.z);
                crossings.push(Vertex::new(
                    p.x + (q.x - p.x) * t,
                    p.y + (q.y - p.y) * t,
                    z,
                ));
            }
        }
        if crossings.len() == 2 {
            segments.push((crossings[0], crossings[1]));
        }
    }

    stitch_loops(&segments)
}

fn stitch_loops(segments: &[(Vertex, Vertex)]) -> Polygons {
    // Adjacency over quantized endpoints.
    let mut adjacency: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (i, (a, b)) in segments.iter().enumerate() {
        adjacency
            .entry((quantize(a.x), quantize(a.y)))
            .or_default()
            .push(i);
        adjacency
            .entry((quantize(b.x), quantize(b.y)))
            .or_default()
            .push(i);
    }

    let mut used = vec![false; segments.len()];
    let mut loops: Polygons = Vec::new();

    for start in 0..segments.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let (first, mut tail) = segments[start];
        let mut chain: Vec<Vertex> = vec![first, tail];

        loop {
            let key = (quantize(tail.x), quantize(tail.y));
            let Some(candidates) = adjacency.get(&key) else {
                break;
            };
            let mut advanced = false;
            for &idx in candidates {
                if used[idx] {
                    continue;
                }
                let (a, b) = segments[idx];
                let next = if quantize(a.x) == key.0 && quantize(a.y) == key.1 {
                    b
                } else {
                    a
                };
                used[idx] = true;
                tail = next;
                chain.push(next);
                advanced = true;
                break;
            }
            if !advanced {
                break;
            }
            let head = (quantize(first.x), quantize(first.y));
            if (quantize(tail.x), quantize(tail.y)) == head {
                break;
            }
        }

        // Drop the duplicated closing vertex if the chain closed.
        if chain.len() > 2 {
            let head = chain[0];
            let last = *chain.last().unwrap();
            if quantize(head.x) == quantize(last.x) && quantize(head.y) == quantize(last.y) {
                chain.pop();
            }
        }
        if chain.len() >= 3 {
            let mut polygon = Polygon::from_points(
                chain
                    .iter()
                    .map(|v| Point::new(scale(v.x), scale(v.y)))
                    .collect(),
            );
            // Orient outer loops counter-clockwise; hole orientation is
            // recovered by the boolean ops downstream.
            if polygon.signed_area() < 0.0 {
                polygon.points_mut().reverse();
            }
            loops.push(polygon);
        }
    }

    loops
}
