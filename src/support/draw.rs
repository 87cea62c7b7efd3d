//! Classic rendering: one ovalised polygon per element per layer.
//!
//! Each placed element becomes a set of ellipses stretched toward its
//! neighbors so consecutive layers overlap reliably, clipped against the
//! model. The resulting radius stack is then smoothed upward and
//! downward through the tree, and branches that end on nothing are
//! dropped to the build plate.

use super::element::{get_collision_radius, get_radius, move_inside_if_outside, SupportElements};
use super::settings::TreeSupportSettings;
use crate::clipper::{self, OffsetJoin};
use crate::error::{CancelToken, DiagnosticsContext, TreeSupportResult};
use crate::geometry::{area, make_circle, Point, Polygon, Polygons};
use crate::volumes::VolumeOracle;
use crate::{scale, Coord, LayerIndex, TINY_AREA_THRESHOLD};
use rayon::prelude::*;

/// Vertex count of the branch circle template.
const BRANCH_CIRCLE_RESOLUTION: usize = 25;

/// One element scheduled for drawing, with its down-link.
#[derive(Debug, Clone, Copy)]
pub struct DrawIndex {
    pub layer_idx: LayerIndex,
    pub elem_idx: usize,
    /// Index of the child element on `layer_idx - 1`, if any.
    pub child: Option<usize>,
}

/// Flatten the tree into a linear list with child links and per-layer
/// offsets (`linear_layers[l]..linear_layers[l + 1]` covers layer `l`).
pub fn linearize_tree(move_bounds: &[SupportElements]) -> (Vec<DrawIndex>, Vec<usize>) {
    let mut linear: Vec<DrawIndex> = Vec::new();
    let mut linear_layers: Vec<usize> = Vec::with_capacity(move_bounds.len() + 1);
    // parent element index (in layer above) -> child element index here.
    let mut map_downwards_old: Vec<(usize, usize)> = Vec::new();
    let mut map_downwards_new: Vec<(usize, usize)> = Vec::new();

    for (layer_idx, layer) in move_bounds.iter().enumerate() {
        linear_layers.push(linear.len());
        map_downwards_new.clear();
        map_downwards_old.sort_unstable();
        for (elem_idx, elem) in layer.iter().enumerate() {
            let child = if layer_idx > 0 {
                map_downwards_old
                    .binary_search_by_key(&elem_idx, |&(parent, _)| parent)
                    .ok()
                    .map(|pos| map_downwards_old[pos].1)
            } else {
                None
            };
            for &parent_idx in &elem.parents {
                // Only one link ever points at a given parent.
                map_downwards_new.push((parent_idx as usize, elem_idx));
            }
            linear.push(DrawIndex {
                layer_idx,
                elem_idx,
                child,
            });
        }
        std::mem::swap(&mut map_downwards_old, &mut map_downwards_new);
    }
    linear_layers.push(linear.len());
    (linear, linear_layers)
}

/// Generate the ovalised branch polygons for every element.
pub fn generate_branch_areas(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    move_bounds: &[SupportElements],
    linear: &[DrawIndex],
    cancel: &CancelToken,
) -> TreeSupportResult<Vec<Polygons>> {
    let branch_circle = make_circle(settings.branch_radius, BRANCH_CIRCLE_RESOLUTION);

    linear
        .par_iter()
        .map(|draw| -> TreeSupportResult<Polygons> {
            cancel.check()?;
            let elem = &move_bounds[draw.layer_idx][draw.elem_idx];
            let Some(center) = elem.state.result_on_layer else {
                return Ok(Vec::new());
            };
            let radius = get_radius(settings, &elem.state);

            // One disk for the element plus an ovalised disk toward every
            // neighbor (child below, parents above).
            let mut movement_directions: Vec<(Point, Coord)> = vec![(Point::zero(), radius)];
            let mut parent_uses_min = false;
            if !elem.state.skip_ovalisation {
                if let Some(child_idx) = draw.child {
                    let child = &move_bounds[draw.layer_idx - 1][child_idx];
                    if let Some(child_center) = child.state.result_on_layer {
                        movement_directions.push((child_center - center, radius));
                    }
                }
                if draw.layer_idx + 1 < move_bounds.len() {
                    for &parent_idx in &elem.parents {
                        let parent = &move_bounds[draw.layer_idx + 1][parent_idx as usize];
                        if let Some(parent_center) = parent.state.result_on_layer {
                            movement_directions.push((
                                parent_center - center,
                                get_radius(settings, &parent.state)
                                    .max(settings.support_line_width),
                            ));
                        }
                        parent_uses_min |= parent.state.use_min_xy_dist;
                    }
                }
            }

            let collision = volumes.collision(
                0,
                draw.layer_idx,
                parent_uses_min || elem.state.use_min_xy_dist,
            );

            let generate_area = |aoffset: Coord| -> (Polygons, f64) {
                let mut poly: Polygons = Vec::new();
                let mut max_speed: f64 = 0.0;
                for &(movement, move_radius) in &movement_directions {
                    max_speed = max_speed.max(movement.norm());
                    // Stretch the circle template into an ellipse that
                    // covers both the current center and the target.
                    let used_scale =
                        (move_radius + aoffset) as f64 / settings.branch_radius as f64;
                    let center_position = center + movement / 2;
                    let br = settings.branch_radius as f64;
                    let move_x = movement.x as f64 / (used_scale * br);
                    let move_y = movement.y as f64 / (used_scale * br);
                    let vsize_inv = 0.5 / (0.01 + (move_x * move_x + move_y * move_y).sqrt());
                    let matrix = [
                        used_scale * (1.0 + move_x * move_x * vsize_inv),
                        used_scale * (move_x * move_y * vsize_inv),
                        used_scale * (move_x * move_y * vsize_inv),
                        used_scale * (1.0 + move_y * move_y * vsize_inv),
                    ];
                    let mut ellipse = Polygon::new();
                    for vertex in branch_circle.points() {
                        let vx = vertex.x as f64;
                        let vy = vertex.y as f64;
                        ellipse.push(Point::new(
                            center_position.x + (matrix[0] * vx + matrix[1] * vy) as Coord,
                            center_position.y + (matrix[2] * vx + matrix[3] * vy) as Coord,
                        ));
                    }
                    poly.push(ellipse);
                }
                // A tiny outset absorbs rounding that would otherwise hold
                // the tip slightly away from the overhang.
                let poly = clipper::diff_clipped(
                    &clipper::offset(
                        &clipper::union_(&poly),
                        scale(0.05).min(settings.support_line_width / 4),
                        OffsetJoin::Miter,
                    ),
                    &collision,
                );
                (poly, max_speed)
            };

            let (mut polygons, max_speed) = generate_area(0);
            let fast_relative_movement = max_speed > radius as f64 * 0.75;

            if fast_relative_movement
                || get_radius(settings, &elem.state) - get_collision_radius(settings, &elem.state)
                    > settings.support_line_width
            {
                // Simulate the nozzle path on the outermost wall. If the
                // inset falls apart, the outer line would not surround the
                // whole part and material would print mid-air.
                let mut nozzle_path = clipper::offset(
                    &polygons,
                    -settings.support_line_width / 2,
                    OffsetJoin::Miter,
                );
                if count_outer_contours(&nozzle_path) > 1 {
                    let (bigger, _) = generate_area(settings.support_line_width / 2);
                    polygons = bigger;
                    nozzle_path = clipper::offset(
                        &polygons,
                        -settings.support_line_width / 2,
                        OffsetJoin::Miter,
                    );
                    if count_outer_contours(&nozzle_path) > 1 {
                        // Keep only the component the branch center is in.
                        let mut keep: Polygons = Vec::new();
                        for part in &nozzle_path {
                            if part.signed_area() < 0.0 {
                                keep.push(part.clone());
                                continue;
                            }
                            let mut drop = false;
                            if !part.contains_point(center) {
                                // Fuzzy: the center may sit exactly on the
                                // border after rounding.
                                let moved = move_inside_if_outside(
                                    std::slice::from_ref(part),
                                    center,
                                );
                                drop = center.distance(&moved) >= scale(0.025) as f64;
                            }
                            if !drop {
                                keep.push(part.clone());
                            }
                        }
                        polygons = clipper::diff_clipped(
                            &clipper::offset(
                                &keep,
                                settings.support_line_width / 2,
                                OffsetJoin::Miter,
                            ),
                            &collision,
                        );
                    }
                }
            }

            Ok(polygons)
        })
        .collect()
}

fn count_outer_contours(polygons: &Polygons) -> usize {
    polygons.iter().filter(|p| p.signed_area() >= 0.0).count()
}

/// Smooth the drawn areas through the tree so the outer wall never jumps
/// between layers (as it otherwise does when a branch squeezes through a
/// hole).
pub fn smooth_branch_areas(
    settings: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    linear: &[DrawIndex],
    linear_layers: &[usize],
    polygons: &mut [Polygons],
    cancel: &CancelToken,
) -> TreeSupportResult<()> {
    // Upper limit a radius may change per layer; +1 absorbs rounding.
    let max_radius_change_per_layer = 1 + settings.support_line_width / 2;

    // Upward: clip each parent's area to the child's area grown by the
    // allowed outer-wall travel.
    for layer_idx in 0..move_bounds.len().saturating_sub(1) {
        cancel.check()?;
        let base = linear_layers[layer_idx];
        let base_above = linear_layers[layer_idx + 1];
        // Collect the clips first; each parent has exactly one child, so
        // writes do not conflict, but the borrow is split manually.
        let clips: Vec<(usize, Polygons)> = (base..base_above)
            .into_par_iter()
            .flat_map_iter(|linear_idx| {
                let draw = linear[linear_idx];
                let elem = &move_bounds[draw.layer_idx][draw.elem_idx];
                let mut max_outer_wall_distance: f64 = 0.0;
                let mut do_something = false;
                let center = elem.state.result_on_layer;
                for &parent_idx in &elem.parents {
                    let parent = &move_bounds[layer_idx + 1][parent_idx as usize];
                    if get_radius(settings, &parent.state)
                        != get_collision_radius(settings, &parent.state)
                    {
                        do_something = true;
                        if let (Some(c), Some(p)) = (center, parent.state.result_on_layer) {
                            max_outer_wall_distance = max_outer_wall_distance.max(
                                c.distance(&p)
                                    - (get_radius(settings, &elem.state)
                                        - get_radius(settings, &parent.state))
                                        as f64,
                            );
                        }
                    }
                }
                max_outer_wall_distance += max_radius_change_per_layer as f64;
                let mut out = Vec::new();
                if do_something {
                    let max_allowed_area = clipper::offset(
                        &polygons[linear_idx],
                        max_outer_wall_distance as Coord,
                        OffsetJoin::Miter,
                    );
                    for &parent_idx in &elem.parents {
                        let parent = &move_bounds[layer_idx + 1][parent_idx as usize];
                        if get_radius(settings, &parent.state)
                            != get_collision_radius(settings, &parent.state)
                        {
                            out.push((base_above + parent_idx as usize, max_allowed_area.clone()));
                        }
                    }
                }
                out
            })
            .collect();
        for (target_idx, max_allowed_area) in clips {
            if !polygons[target_idx].is_empty() {
                polygons[target_idx] =
                    clipper::intersection(&polygons[target_idx], &max_allowed_area);
            }
        }
    }

    // Downward: an element may shrink to the union of its parents' areas,
    // translated along the branch and grown by the allowed change.
    // Marked elements propagate the shrinking further down.
    if let Some(top) = move_bounds.last_mut() {
        for elem in top.iter_mut() {
            elem.state.marked = false;
        }
    }
    for layer_idx in (0..move_bounds.len().saturating_sub(1)).rev() {
        cancel.check()?;
        let base = linear_layers[layer_idx];
        let base_above = linear_layers[layer_idx + 1];
        let updates: Vec<(usize, Polygons)> = (base..base_above)
            .into_par_iter()
            .filter_map(|linear_idx| {
                let draw = linear[linear_idx];
                let elem = &move_bounds[draw.layer_idx][draw.elem_idx];
                let mut do_something = false;
                let mut max_allowed_area: Polygons = Vec::new();
                for &parent_idx in &elem.parents {
                    let parent = &move_bounds[layer_idx + 1][parent_idx as usize];
                    let mut result = clipper::offset(
                        &polygons[base_above + parent_idx as usize],
                        max_radius_change_per_layer,
                        OffsetJoin::Miter,
                    );
                    if let (Some(c), Some(p)) =
                        (elem.state.result_on_layer, parent.state.result_on_layer)
                    {
                        let direction = c - p;
                        for ring in &mut result {
                            ring.translate(direction);
                        }
                    }
                    max_allowed_area.extend(result);
                    do_something = do_something
                        || parent.state.marked
                        || get_collision_radius(settings, &parent.state)
                            != get_radius(settings, &parent.state);
                }
                if !do_something {
                    return None;
                }
                let result = clipper::intersection(&max_allowed_area, &polygons[linear_idx]);
                if area(&result) < area(&polygons[linear_idx]) {
                    Some((linear_idx, result))
                } else {
                    None
                }
            })
            .collect();
        for (linear_idx, result) in updates {
            let draw = linear[linear_idx];
            move_bounds[draw.layer_idx][draw.elem_idx].state.marked = true;
            polygons[linear_idx] = result;
        }
    }
    Ok(())
}

/// Drop branches that end on nothing down to the build plate, layer by
/// layer, clipped against the model on the way.
pub fn drop_non_gracious_areas(
    volumes: &dyn VolumeOracle,
    move_bounds: &[SupportElements],
    linear: &[DrawIndex],
    polygons: &[Polygons],
    support_layer_storage: &mut [Polygons],
    diag: &DiagnosticsContext,
    cancel: &CancelToken,
) -> TreeSupportResult<()> {
    let dropped: Vec<Vec<(LayerIndex, Polygons)>> = linear
        .par_iter()
        .enumerate()
        .map(|(idx, draw)| -> TreeSupportResult<Vec<(LayerIndex, Polygons)>> {
            cancel.check()?;
            let elem = &move_bounds[draw.layer_idx][draw.elem_idx];
            // Only elements without a child end mid-air; everything else
            // continues downward anyway.
            if elem.state.to_model_gracious || draw.child.is_some() || draw.layer_idx == 0 {
                return Ok(Vec::new());
            }
            diag.count_non_gracious_drop();
            tracing::warn!(
                layer = draw.layer_idx,
                target = elem.state.target_height,
                "dropping a non-gracious branch to the plate; it may rest on thin air"
            );
            let mut out = Vec::new();
            let mut rest_support = polygons[idx].clone();
            let mut layer_idx = draw.layer_idx;
            while layer_idx > 0 && area(&rest_support) > TINY_AREA_THRESHOLD {
                layer_idx -= 1;
                rest_support = clipper::diff_clipped(
                    &rest_support,
                    &volumes.collision(0, layer_idx, false),
                );
                out.push((layer_idx, rest_support.clone()));
            }
            Ok(out)
        })
        .collect::<TreeSupportResult<Vec<_>>>()?;

    for per_element in dropped {
        for (layer_idx, areas) in per_element {
            support_layer_storage[layer_idx].extend(areas);
        }
    }
    Ok(())
}

/// Render all placed elements into per-layer base and roof polygons.
pub fn draw_areas(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    diag: &DiagnosticsContext,
    cancel: &CancelToken,
) -> TreeSupportResult<(Vec<Polygons>, Vec<Polygons>)> {
    let num_layers = move_bounds.len();
    let mut support_layer_storage: Vec<Polygons> = vec![Vec::new(); num_layers];
    let mut support_roof_storage: Vec<Polygons> = vec![Vec::new(); num_layers];

    let (linear, linear_layers) = linearize_tree(move_bounds);
    cancel.check()?;

    let mut polygons =
        generate_branch_areas(volumes, settings, move_bounds, &linear, cancel)?;
    smooth_branch_areas(
        settings,
        move_bounds,
        &linear,
        &linear_layers,
        &mut polygons,
        cancel,
    )?;
    drop_non_gracious_areas(
        volumes,
        move_bounds,
        &linear,
        &polygons,
        &mut support_layer_storage,
        diag,
        cancel,
    )?;

    // Route every drawn area into the base or roof channel.
    for (idx, draw) in linear.iter().enumerate() {
        let elem = &move_bounds[draw.layer_idx][draw.elem_idx];
        let target = if elem.state.missing_roof_layers > elem.state.distance_to_top {
            &mut support_roof_storage[draw.layer_idx]
        } else {
            &mut support_layer_storage[draw.layer_idx]
        };
        target.extend(polygons[idx].drain(..));
    }

    Ok((support_layer_storage, support_roof_storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{contains, ExPolygons};
    use crate::support::element::{LineStatus, SupportElement, SupportElementState};
    use crate::support::settings::TreeSupportMeshGroupSettings;
    use crate::volumes::{TreeModelVolumes, VolumeConfig};

    fn settings() -> TreeSupportSettings {
        TreeSupportSettings::new(&TreeSupportMeshGroupSettings::default()).unwrap()
    }

    fn empty_volumes(layers: usize) -> TreeModelVolumes {
        let outlines: Vec<ExPolygons> = vec![Vec::new(); layers];
        TreeModelVolumes::new(VolumeConfig::default(), &outlines)
    }

    fn placed_element(
        layer: usize,
        at: Point,
        dtt: u32,
        parents: Vec<i32>,
    ) -> SupportElement {
        let mut state = SupportElementState::new_tip(layer, at, LineStatus::ToBuildPlate);
        state.layer_idx = layer;
        state.distance_to_top = dtt;
        state.effective_radius_height = dtt;
        state.result_on_layer = Some(at);
        let mut circle = make_circle(scale(0.5), 25);
        circle.translate(at);
        SupportElement::new(state, parents, vec![circle])
    }

    fn simple_tree() -> Vec<SupportElements> {
        vec![
            vec![placed_element(0, Point::zero(), 2, vec![0])],
            vec![placed_element(1, Point::new(scale(0.2), 0), 1, vec![0])],
            vec![placed_element(2, Point::new(scale(0.4), 0), 0, vec![])],
        ]
    }

    #[test]
    fn linearize_links_children() {
        let tree = simple_tree();
        let (linear, linear_layers) = linearize_tree(&tree);
        assert_eq!(linear.len(), 3);
        assert_eq!(linear_layers, vec![0, 1, 2, 3]);
        assert_eq!(linear[0].child, None);
        assert_eq!(linear[1].child, Some(0));
        assert_eq!(linear[2].child, Some(0));
    }

    #[test]
    fn branch_areas_cover_the_centers() {
        let settings = settings();
        let volumes = empty_volumes(3);
        let tree = simple_tree();
        let (linear, _) = linearize_tree(&tree);
        let polygons =
            generate_branch_areas(&volumes, &settings, &tree, &linear, &CancelToken::new())
                .unwrap();
        for (idx, draw) in linear.iter().enumerate() {
            let center = tree[draw.layer_idx][draw.elem_idx]
                .state
                .result_on_layer
                .unwrap();
            assert!(
                contains(&polygons[idx], center),
                "polygon {idx} does not cover its branch center"
            );
            // The area at least covers the real-radius disk.
            let radius = get_radius(&settings, &tree[draw.layer_idx][draw.elem_idx].state);
            let disk_area = std::f64::consts::PI * (radius as f64) * (radius as f64);
            assert!(area(&polygons[idx]) > disk_area * 0.8);
        }
    }

    #[test]
    fn ovalisation_stretches_toward_parent() {
        let settings = settings();
        let volumes = empty_volumes(2);
        // Parent far to the side: the child's drawn area must extend
        // toward it.
        let tree = vec![
            vec![placed_element(0, Point::zero(), 1, vec![0])],
            vec![placed_element(1, Point::new(scale(2.0), 0), 0, vec![])],
        ];
        let (linear, _) = linearize_tree(&tree);
        let polygons =
            generate_branch_areas(&volumes, &settings, &tree, &linear, &CancelToken::new())
                .unwrap();
        // The midpoint between element and parent is covered by the oval.
        assert!(contains(&polygons[0], Point::new(scale(1.0), 0)));
    }

    #[test]
    fn skip_ovalisation_draws_plain_disk() {
        let settings = settings();
        let volumes = empty_volumes(2);
        let mut tree = vec![
            vec![placed_element(0, Point::zero(), 1, vec![0])],
            vec![placed_element(1, Point::new(scale(2.0), 0), 0, vec![])],
        ];
        tree[0][0].state.skip_ovalisation = true;
        let (linear, _) = linearize_tree(&tree);
        let polygons =
            generate_branch_areas(&volumes, &settings, &tree, &linear, &CancelToken::new())
                .unwrap();
        assert!(!contains(&polygons[0], Point::new(scale(1.5), 0)));
    }

    #[test]
    fn drawn_areas_avoid_model() {
        let settings = settings();
        let wall = Polygon::rectangle(
            Point::new(scale(0.5), -scale(3.0)),
            Point::new(scale(2.0), scale(3.0)),
        );
        let outlines: Vec<ExPolygons> =
            vec![vec![crate::geometry::ExPolygon::new(wall.clone())]; 3];
        let volumes = TreeModelVolumes::new(VolumeConfig::default(), &outlines);
        let tree = simple_tree();
        let (linear, _) = linearize_tree(&tree);
        let polygons =
            generate_branch_areas(&volumes, &settings, &tree, &linear, &CancelToken::new())
                .unwrap();
        for poly in &polygons {
            let overlap = clipper::intersection(poly, &[wall.clone()]);
            assert!(area(&overlap) <= TINY_AREA_THRESHOLD);
        }
    }

    #[test]
    fn non_gracious_branches_drop_to_plate() {
        let settings = settings();
        let volumes = empty_volumes(4);
        let diag = DiagnosticsContext::new();
        // An element at layer 3 with no child: non-gracious dead end.
        let mut elem = placed_element(3, Point::zero(), 0, vec![]);
        elem.state.to_model_gracious = false;
        elem.state.to_buildplate = false;
        let mut tree: Vec<SupportElements> = vec![Vec::new(), Vec::new(), Vec::new(), vec![elem]];
        let (support, _roof) =
            draw_areas(&volumes, &settings, &mut tree, &diag, &CancelToken::new()).unwrap();
        // Dropped areas appear on every layer below.
        for layer in 0..3 {
            assert!(
                area(&support[layer]) > TINY_AREA_THRESHOLD,
                "no dropped area on layer {layer}"
            );
        }
        assert!(diag.non_gracious_drops() > 0);
    }

    #[test]
    fn roof_tips_route_to_roof_channel() {
        let settings = settings();
        let volumes = empty_volumes(2);
        let diag = DiagnosticsContext::new();
        let mut elem = placed_element(1, Point::zero(), 0, vec![]);
        elem.state.missing_roof_layers = 2;
        let mut tree: Vec<SupportElements> = vec![Vec::new(), vec![elem]];
        let (support, roof) =
            draw_areas(&volumes, &settings, &mut tree, &diag, &CancelToken::new()).unwrap();
        assert!(area(&roof[1]) > TINY_AREA_THRESHOLD);
        assert!(area(&support[1]) <= TINY_AREA_THRESHOLD);
    }
}
