//! Organic smoothing: nudge branch centers out of the model and smooth
//! the tree before tube extrusion.
//!
//! Every placed element becomes a collision sphere at its 3D position.
//! Per iteration, each sphere finds its deepest 2D penetration into the
//! layer outlines it vertically overlaps (via per-layer segment trees),
//! is pushed out along the outward normal, and is pulled toward the
//! radius-weighted average of its neighbors. Tips and roots stay locked.

use super::draw::DrawIndex;
use super::element::{get_radius, SupportElements};
use super::settings::TreeSupportSettings;
use crate::error::{CancelToken, TreeSupportResult};
use crate::geometry::{PointF, Segment, SegmentTree};
use crate::volumes::VolumeOracle;
use crate::{CoordF, LayerIndex};
use rayon::prelude::*;

/// Extra clearance kept after resolving a collision (mm).
const COLLISION_EXTRA_GAP: CoordF = 0.1;

/// Per-iteration cap on the collision-avoidance push (mm).
const MAX_NUDGE_COLLISION_AVOIDANCE: CoordF = 0.5;

/// Per-iteration cap on the smoothing pull (mm).
const MAX_NUDGE_SMOOTHING: CoordF = 0.2;

/// Laplacian smoothing blend factor.
const SMOOTHING_FACTOR: CoordF = 0.5;

/// Iteration budget; the loop usually converges much earlier.
const NUM_ITER: usize = 100;

/// Movement below this counts as converged (mm).
const CONVERGENCE_EPS: CoordF = 1e-4;

struct CollisionSphere {
    linear_idx: usize,
    layer_idx: LayerIndex,
    radius: CoordF,
    locked: bool,
    position: PointF,
    z: CoordF,
    layer_begin: LayerIndex,
    layer_end: LayerIndex,
}

/// Result of the smoothing pass.
#[derive(Debug, Clone, Copy)]
pub struct OrganicSmoothResult {
    pub iterations: usize,
    pub converged: bool,
}

/// Nudge and smooth all placed branch centers in `move_bounds`.
///
/// `linear` / `linear_layers` come from [`super::draw::linearize_tree`].
pub fn organic_smooth_branches_avoid_collisions(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    linear: &[DrawIndex],
    linear_layers: &[usize],
    cancel: &CancelToken,
) -> TreeSupportResult<OrganicSmoothResult> {
    if linear.is_empty() {
        return Ok(OrganicSmoothResult {
            iterations: 0,
            converged: true,
        });
    }

    // Per-layer segment trees over the zero-radius collision outline.
    // Built only for layers that actually hold elements.
    let max_layer = linear.iter().map(|d| d.layer_idx).max().unwrap_or(0);
    let mut layer_in_use = vec![false; max_layer + 1];
    for draw in linear {
        layer_in_use[draw.layer_idx] = true;
    }
    let layer_caches: Vec<Option<SegmentTree>> = (0..=max_layer)
        .into_par_iter()
        .map(|layer_idx| -> TreeSupportResult<Option<SegmentTree>> {
            cancel.check()?;
            if !layer_in_use[layer_idx] {
                return Ok(None);
            }
            let collision = volumes.collision(0, layer_idx, false);
            let mut segments = Vec::new();
            for ring in collision.iter() {
                let pts = ring.points();
                for i in 0..pts.len() {
                    let a = pts[i].to_f64();
                    let b = pts[(i + 1) % pts.len()].to_f64();
                    segments.push(Segment::new(a, b));
                }
            }
            if segments.is_empty() {
                Ok(None)
            } else {
                Ok(Some(SegmentTree::build(segments)))
            }
        })
        .collect::<TreeSupportResult<Vec<_>>>()?;

    let layer_height = settings.layer_z(1) - settings.layer_z(0);

    // Build the spheres; min/max Z limits come from the tree structure
    // (tip above, root below), then the sphere radius.
    let mut spheres: Vec<CollisionSphere> = Vec::with_capacity(linear.len());
    let mut min_z: Vec<CoordF> = Vec::with_capacity(linear.len());
    for (idx, draw) in linear.iter().enumerate() {
        let elem = &move_bounds[draw.layer_idx][draw.elem_idx];
        let position = elem
            .state
            .result_on_layer
            .map(|p| p.to_f64())
            .unwrap_or_else(|| elem.state.next_position.to_f64());
        let z = settings.layer_z(draw.layer_idx);
        let radius = crate::unscale(get_radius(settings, &elem.state));
        let locked = elem.parents.is_empty() || (draw.child.is_none() && draw.layer_idx > 0);
        let sphere_min_z = match draw.child {
            Some(child_idx) => min_z[linear_layers[draw.layer_idx - 1] + child_idx],
            None => z,
        };
        min_z.push(sphere_min_z);
        spheres.push(CollisionSphere {
            linear_idx: idx,
            layer_idx: draw.layer_idx,
            radius,
            locked,
            position,
            z,
            layer_begin: 0,
            layer_end: 0,
        });
    }
    // max_z propagates down from the tips.
    let mut max_z: Vec<CoordF> = vec![CoordF::MAX; spheres.len()];
    for idx in (0..spheres.len()).rev() {
        let draw = &linear[idx];
        let elem = &move_bounds[draw.layer_idx][draw.elem_idx];
        if elem.parents.is_empty() {
            max_z[idx] = spheres[idx].z;
        } else {
            let offset_above = linear_layers[draw.layer_idx + 1];
            for &parent_idx in &elem.parents {
                max_z[idx] = max_z[idx].min(max_z[offset_above + parent_idx as usize]);
            }
        }
    }
    for (idx, sphere) in spheres.iter_mut().enumerate() {
        let lo = min_z[idx].max(sphere.z - sphere.radius);
        let hi = max_z[idx].min(sphere.z + sphere.radius);
        let first_z = settings.layer_z(0);
        let layer_of = |z: CoordF| -> f64 { (z - first_z) / layer_height };
        sphere.layer_begin = sphere
            .layer_idx
            .min(layer_of(lo).ceil().max(0.0) as LayerIndex);
        sphere.layer_end = sphere
            .layer_idx
            .max(layer_of(hi).floor().max(0.0) as LayerIndex)
            .min(max_layer)
            + 1;
    }

    cancel.check()?;

    let mut iterations = 0;
    let mut converged = false;
    for iter in 0..NUM_ITER {
        iterations = iter + 1;
        let prev_positions: Vec<PointF> = spheres.iter().map(|s| s.position).collect();

        let updates: Vec<(PointF, bool)> = spheres
            .par_iter()
            .map(|sphere| -> TreeSupportResult<(PointF, bool)> {
                cancel.check()?;
                if sphere.locked {
                    return Ok((sphere.position, false));
                }
                let mut position = sphere.position;
                let mut moved = false;

                // Deepest penetration across the layers the sphere spans.
                let mut deepest: Option<(CoordF, PointF)> = None;
                for layer_id in sphere.layer_begin..sphere.layer_end {
                    let dz = (layer_id as f64 - sphere.layer_idx as f64) * layer_height;
                    let r2 = sphere.radius * sphere.radius - dz * dz;
                    if r2 <= 0.0 {
                        continue;
                    }
                    if let Some(Some(cache)) = layer_caches.get(layer_id) {
                        if let Some((dist, hit)) = cache.closest_point_within(position, r2) {
                            let depth = r2.sqrt() - dist;
                            if deepest.map_or(true, |(d, _)| depth > d) {
                                deepest = Some((depth, hit));
                            }
                        }
                    }
                }
                if let Some((depth, hit)) = deepest {
                    if depth > 0.0 {
                        if depth > CONVERGENCE_EPS {
                            moved = true;
                        }
                        let nudge_dist = (depth + COLLISION_EXTRA_GAP)
                            .max(0.0)
                            .min(MAX_NUDGE_COLLISION_AVOIDANCE);
                        let away = (position - hit).normalized();
                        position = position + away * nudge_dist;
                    }
                }

                // Laplacian pull toward the neighbors' previous positions.
                let draw = &linear[sphere.linear_idx];
                let elem = &move_bounds[draw.layer_idx][draw.elem_idx];
                let mut avg = PointF::new(0.0, 0.0);
                let mut weight = 0.0;
                let offset_above = linear_layers[draw.layer_idx + 1];
                for &parent_idx in &elem.parents {
                    let w = sphere.radius;
                    let p = prev_positions[offset_above + parent_idx as usize];
                    avg = avg + p * w;
                    weight += w;
                }
                if let Some(child_idx) = draw.child {
                    let w = if weight > 0.0 { weight } else { sphere.radius };
                    let p = prev_positions[linear_layers[draw.layer_idx - 1] + child_idx];
                    avg = avg + p * w;
                    weight += w;
                }
                if weight > 0.0 {
                    avg = PointF::new(avg.x / weight, avg.y / weight);
                    let old = position;
                    let target = PointF::new(
                        (1.0 - SMOOTHING_FACTOR) * old.x + SMOOTHING_FACTOR * avg.x,
                        (1.0 - SMOOTHING_FACTOR) * old.y + SMOOTHING_FACTOR * avg.y,
                    );
                    let shift = target - old;
                    let shift_len = shift.norm();
                    let nudge = shift_len.min(MAX_NUDGE_SMOOTHING);
                    if nudge > CONVERGENCE_EPS {
                        moved = true;
                    }
                    position = old + shift.normalized() * nudge;
                }

                Ok((position, moved))
            })
            .collect::<TreeSupportResult<Vec<_>>>()?;

        let mut num_moved = 0;
        for (sphere, (position, moved)) in spheres.iter_mut().zip(updates) {
            sphere.position = position;
            if moved {
                num_moved += 1;
            }
        }
        if num_moved == 0 {
            converged = true;
            break;
        }
    }

    // Write the final positions back.
    for sphere in &spheres {
        let draw = &linear[sphere.linear_idx];
        move_bounds[draw.layer_idx][draw.elem_idx].state.result_on_layer =
            Some(sphere.position.to_scaled());
    }

    Ok(OrganicSmoothResult {
        iterations,
        converged,
    })
}
