//! Tube mesh extrusion for organic-style rendering.
//!
//! Unbranched chains of placed elements become tubes: a half-sphere cap
//! at the bottom, a discretized circle at every node (normal to the
//! averaged in/out tangents), zig-zag triangle strips between adjacent
//! circles, and a half-sphere cap at the top. All tubes are merged into
//! one cumulative mesh that is re-sliced at the layer mid-planes.

use super::element::{get_radius, SupportElements};
use super::settings::TreeSupportSettings;
use crate::clipper;
use crate::error::{CancelToken, TreeSupportResult};
use crate::geometry::Polygons;
use crate::mesh::{slice_mesh, TriangleMesh, Vertex};
use crate::volumes::VolumeOracle;
use crate::{CoordF, LayerIndex};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Discretization tolerance of circles and caps (mm).
const EPS: CoordF = 0.015;

#[derive(Debug, Clone, Copy)]
struct Vec3 {
    x: CoordF,
    y: CoordF,
    z: CoordF,
}

impl Vec3 {
    fn new(x: CoordF, y: CoordF, z: CoordF) -> Self {
        Self { x, y, z }
    }

    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }

    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }

    fn scaled(self, f: CoordF) -> Vec3 {
        Vec3::new(self.x * f, self.y * f, self.z * f)
    }

    fn cross(self, o: Vec3) -> Vec3 {
        Vec3::new(
            self.y * o.z - self.z * o.y,
            self.z * o.x - self.x * o.z,
            self.x * o.y - self.y * o.x,
        )
    }

    fn norm(self) -> CoordF {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn normalized(self) -> Vec3 {
        let n = self.norm();
        if n > 1e-12 {
            self.scaled(1.0 / n)
        } else {
            Vec3::new(0.0, 0.0, 1.0)
        }
    }

    fn to_vertex(self) -> Vertex {
        Vertex::new(self.x, self.y, self.z)
    }
}

/// Discretize a 3D circle; returns the [begin, end) vertex index range.
fn discretize_circle(
    mesh: &mut TriangleMesh,
    center: Vec3,
    normal: Vec3,
    radius: CoordF,
) -> (u32, u32) {
    let angle_step = 2.0 * (1.0 - (EPS / radius).min(1.0)).acos();
    let nsteps = ((2.0 * PI) / angle_step.max(1e-3)).ceil().max(3.0) as usize;
    let angle_step = 2.0 * PI / nsteps as f64;

    // Orthonormal basis of the circle plane.
    let x = normal.cross(Vec3::new(0.0, -1.0, 0.0));
    let x = if x.norm() < 1e-9 {
        normal.cross(Vec3::new(1.0, 0.0, 0.0)).normalized()
    } else {
        x.normalized()
    };
    let y = normal.cross(x).normalized();

    let begin = mesh.vertices.len() as u32;
    let mut angle: f64 = 0.0;
    let x = x.scaled(radius);
    let y = y.scaled(radius);
    for _ in 0..nsteps {
        let p = center.add(x.scaled(angle.cos())).add(y.scaled(angle.sin()));
        mesh.add_vertex(p.to_vertex());
        angle += angle_step;
    }
    (begin, mesh.vertices.len() as u32)
}

fn triangulate_fan(mesh: &mut TriangleMesh, flip: bool, ifan: u32, ibegin: u32, iend: u32) {
    for v in ibegin..iend {
        let u = if v == ibegin { iend - 1 } else { v - 1 };
        if flip {
            mesh.add_triangle(ifan, u, v);
        } else {
            mesh.add_triangle(ifan, v, u);
        }
    }
}

/// Stitch two vertex rings with a zig-zag strip, always taking the
/// shorter connection.
fn triangulate_strip(
    mesh: &mut TriangleMesh,
    ibegin1: u32,
    iend1: u32,
    ibegin2: u32,
    iend2: u32,
) {
    let mut n1 = iend1 - ibegin1;
    let mut n2 = iend2 - ibegin2;

    // Align the second ring: start at its vertex closest to the first
    // ring's first vertex.
    let mut istart2 = ibegin2;
    {
        let p1 = mesh.vertices[ibegin1 as usize];
        let mut d2min = CoordF::MAX;
        for i in ibegin2..iend2 {
            let p2 = mesh.vertices[i as usize];
            let d2 = (p2.x - p1.x).powi(2) + (p2.y - p1.y).powi(2) + (p2.z - p1.z).powi(2);
            if d2 < d2min {
                d2min = d2;
                istart2 = i;
            }
        }
    }

    let mut u = ibegin1;
    let mut v = istart2;
    while n1 > 0 || n2 > 0 {
        let next1 = |i: u32| if i + 1 == iend1 { ibegin1 } else { i + 1 };
        let next2 = |i: u32| if i + 1 == iend2 { ibegin2 } else { i + 1 };
        let take_first = if n1 == 0 {
            false
        } else if n2 == 0 {
            true
        } else {
            let u2 = next1(u);
            let v2 = next2(v);
            let a = mesh.vertices[u2 as usize];
            let b = mesh.vertices[v as usize];
            let c = mesh.vertices[v2 as usize];
            let d = mesh.vertices[u as usize];
            let l1 = (a.x - b.x).powi(2) + (a.y - b.y).powi(2) + (a.z - b.z).powi(2);
            let l2 = (c.x - d.x).powi(2) + (c.y - d.y).powi(2) + (c.z - d.z).powi(2);
            l1 < l2
        };
        if take_first {
            let u2 = next1(u);
            mesh.add_triangle(u, u2, v);
            n1 -= 1;
            u = u2;
        } else {
            let v2 = next2(v);
            mesh.add_triangle(u, v2, v);
            n2 -= 1;
            v = v2;
        }
    }
}

/// One node on a chain to be extruded.
#[derive(Debug, Clone, Copy)]
pub struct PathNode {
    pub position: Vec3f,
    pub radius: CoordF,
}

/// Public position alias to keep the path node plain-old-data.
pub type Vec3f = (CoordF, CoordF, CoordF);

/// Extrude one chain (bottom to top) into the mesh.
pub fn extrude_branch(path: &[PathNode], mesh: &mut TriangleMesh) {
    if path.len() < 2 {
        return;
    }
    let pos = |n: &PathNode| Vec3::new(n.position.0, n.position.1, n.position.2);
    let mut prev_strip: (u32, u32) = (0, 0);

    for ipath in 1..path.len() {
        let prev = &path[ipath - 1];
        let current = &path[ipath];
        let p1 = pos(prev);
        let p2 = pos(current);
        let v1 = p2.sub(p1).normalized();

        if ipath == 1 {
            // Bottom half-sphere cap.
            let radius = prev.radius;
            let angle_step = 2.0 * (1.0 - (EPS / radius).min(1.0)).acos();
            let nsteps = ((PI / 2.0) / angle_step.max(1e-3)).ceil().max(1.0) as usize;
            let angle_step = PI / (2.0 * nsteps as f64);
            let ifan = mesh.vertices.len() as u32;
            mesh.add_vertex(p1.sub(v1.scaled(radius)).to_vertex());
            let mut angle = angle_step;
            for i in 1..=nsteps {
                let ring_center = p1.sub(v1.scaled(radius * angle.cos()));
                let ring_radius = radius * angle.sin();
                let strip = discretize_circle(mesh, ring_center, v1, ring_radius.max(EPS));
                if i == 1 {
                    triangulate_fan(mesh, false, ifan, strip.0, strip.1);
                } else {
                    triangulate_strip(mesh, prev_strip.0, prev_strip.1, strip.0, strip.1);
                }
                prev_strip = strip;
                angle += angle_step;
            }
        }

        if ipath + 1 == path.len() {
            // Top half-sphere cap.
            let radius = current.radius;
            let angle_step = 2.0 * (1.0 - (EPS / radius).min(1.0)).acos();
            let nsteps = ((PI / 2.0) / angle_step.max(1e-3)).ceil().max(1.0) as usize;
            let angle_step = PI / (2.0 * nsteps as f64);
            let mut angle = PI / 2.0;
            for _ in 0..nsteps {
                let ring_center = p2.add(v1.scaled(radius * angle.cos()));
                let ring_radius = radius * angle.sin();
                if ring_radius > EPS {
                    let strip = discretize_circle(mesh, ring_center, v1, ring_radius);
                    triangulate_strip(mesh, prev_strip.0, prev_strip.1, strip.0, strip.1);
                    prev_strip = strip;
                }
                angle -= angle_step;
            }
            let ifan = mesh.vertices.len() as u32;
            mesh.add_vertex(p2.add(v1.scaled(radius)).to_vertex());
            triangulate_fan(mesh, true, ifan, prev_strip.0, prev_strip.1);
        } else {
            // Interior node: circle normal to the averaged tangents.
            let next = &path[ipath + 1];
            let p3 = pos(next);
            let v2 = p3.sub(p2).normalized();
            let ncurrent = v1.add(v2).normalized();
            let strip = discretize_circle(mesh, p2, ncurrent, current.radius);
            triangulate_strip(mesh, prev_strip.0, prev_strip.1, strip.0, strip.1);
            prev_strip = strip;
        }
    }
}

/// Build the cumulative tube mesh for the whole tree.
///
/// Chains are traversed from every unvisited element upward until the
/// next bifurcation, so every tube runs tip-to-anchor or tip-to-merge.
pub fn draw_branches(
    settings: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    cancel: &CancelToken,
) -> TreeSupportResult<TriangleMesh> {
    for layer in move_bounds.iter_mut() {
        for elem in layer.iter_mut() {
            elem.state.marked = false;
        }
    }

    let node_of = |move_bounds: &[SupportElements], layer: LayerIndex, idx: usize| -> PathNode {
        let elem = &move_bounds[layer][idx];
        let p = elem
            .state
            .result_on_layer
            .unwrap_or(elem.state.next_position)
            .to_f64();
        PathNode {
            position: (p.x, p.y, settings.layer_z(layer)),
            radius: crate::unscale(get_radius(settings, &elem.state)),
        }
    };

    let mut cumulative = TriangleMesh::new();
    let num_layers = move_bounds.len();
    for layer_idx in 0..num_layers.saturating_sub(1) {
        cancel.check()?;
        for start_idx in 0..move_bounds[layer_idx].len() {
            let start = &move_bounds[layer_idx][start_idx];
            if start.state.marked || start.parents.is_empty() {
                continue;
            }
            move_bounds[layer_idx][start_idx].state.marked = true;
            let parents = move_bounds[layer_idx][start_idx].parents.clone();
            for &first_parent_idx in &parents {
                let mut path: Vec<(LayerIndex, usize)> =
                    vec![(layer_idx, start_idx), (layer_idx + 1, first_parent_idx as usize)];
                {
                    let first_parent = &move_bounds[layer_idx + 1][first_parent_idx as usize];
                    if first_parent.parents.len() < 2 {
                        move_bounds[layer_idx + 1][first_parent_idx as usize].state.marked = true;
                    }
                }
                // Extend the chain while it neither branches nor ends.
                loop {
                    let &(l, i) = path.last().unwrap();
                    let elem = &move_bounds[l][i];
                    if elem.parents.len() != 1 || l + 1 >= num_layers {
                        break;
                    }
                    let next = (l + 1, elem.parents[0] as usize);
                    let next_parents = move_bounds[next.0][next.1].parents.len();
                    path.push(next);
                    if next_parents > 1 {
                        break;
                    }
                    move_bounds[next.0][next.1].state.marked = true;
                    if next_parents == 0 {
                        break;
                    }
                }
                let nodes: Vec<PathNode> = path
                    .iter()
                    .map(|&(l, i)| node_of(move_bounds, l, i))
                    .collect();
                let mut partial = TriangleMesh::new();
                extrude_branch(&nodes, &mut partial);
                cumulative.merge(&partial);
            }
        }
    }
    Ok(cumulative)
}

/// Slice the cumulative tube mesh at every layer's mid-plane and clip by
/// the model.
pub fn slice_branches(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    num_layers: usize,
    mesh: &TriangleMesh,
    cancel: &CancelToken,
) -> TreeSupportResult<Vec<Polygons>> {
    let layer_height = crate::unscale(settings.layer_height);
    let slice_z: Vec<CoordF> = (0..num_layers)
        .map(|layer_idx| settings.layer_z(layer_idx) - layer_height * 0.5)
        .collect();

    let raw_slices = slice_mesh(mesh, &slice_z);

    raw_slices
        .into_par_iter()
        .enumerate()
        .map(|(layer_idx, slice)| -> TreeSupportResult<Polygons> {
            cancel.check()?;
            if slice.is_empty() {
                return Ok(Vec::new());
            }
            Ok(clipper::diff_clipped(
                &slice,
                &volumes.collision(0, layer_idx, true),
            ))
        })
        .collect()
}
