//! Node resolution: picking the branch center inside every influence
//! area, bottom up, and culling subtrees that cannot be placed.

use super::element::{get_collision_radius, move_inside_if_outside, SupportElements};
use super::settings::TreeSupportSettings;
use crate::clipper;
use crate::error::{CancelToken, DiagnosticsContext, TreeSupportResult};
use crate::volumes::VolumeOracle;
use crate::LayerIndex;

/// Propagate a placed element's position to its parents.
///
/// Based on the branch center on the current layer, the point on the next
/// layer up is the closest admissible point of each parent's influence
/// area. Parents already placed elsewhere keep their position; they are
/// only marked as reached.
fn set_points_on_areas(
    move_bounds: &mut [SupportElements],
    layer_idx: LayerIndex,
    elem_idx: usize,
    diag: &DiagnosticsContext,
) {
    let (result, parents) = {
        let elem = &move_bounds[layer_idx][elem_idx];
        debug_assert!(!elem.state.deleted);
        if !elem.state.result_on_layer_is_set() {
            tracing::error!(layer = layer_idx, "uninitialized support element");
            diag.report_critical();
            return;
        }
        (
            elem.state.result_on_layer.unwrap(),
            elem.parents.clone(),
        )
    };
    if layer_idx + 1 >= move_bounds.len() {
        return;
    }
    for parent_idx in parents {
        let parent = &mut move_bounds[layer_idx + 1][parent_idx as usize];
        if !parent.state.result_on_layer_is_set() {
            // A move this produces can exceed the per-layer movement
            // distance, e.g. after merges; the smoothing passes absorb it.
            parent.state.result_on_layer =
                Some(move_inside_if_outside(&parent.influence_area, result));
        }
        parent.state.marked = true;
    }
}

/// Emergency model contact: drop the branch where it stands.
fn set_to_model_contact_simple(move_bounds: &mut [SupportElements], layer_idx: LayerIndex, elem_idx: usize) {
    let elem = &mut move_bounds[layer_idx][elem_idx];
    let best = move_inside_if_outside(&elem.influence_area, elem.state.next_position);
    elem.state.result_on_layer = Some(best);
    tracing::debug!(layer = layer_idx, point = %best, "added non-gracious support-on-model point");
}

/// Walk up the single-parent chain as long as the influence area still
/// overlaps a placeable surface; anchor at the highest such layer and
/// delete everything below it.
fn set_to_model_contact_gracious(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    layer_idx: LayerIndex,
    elem_idx: usize,
    diag: &DiagnosticsContext,
) {
    let mut last_success: Option<(LayerIndex, usize)> = None;
    let mut current = (layer_idx, elem_idx);
    loop {
        let (layer, idx) = current;
        let elem = &move_bounds[layer][idx];
        debug_assert!(!elem.state.deleted);
        let radius = get_collision_radius(settings, &elem.state);
        let placeable = volumes.placeable_areas(radius, layer);
        if clipper::intersection(&elem.influence_area, &placeable).is_empty() {
            break;
        }
        last_success = Some(current);
        if elem.parents.len() != 1 || layer + 1 >= move_bounds.len() {
            // A merge point (or the top); stop walking.
            break;
        }
        let parent = elem.parents[0] as usize;
        current = (layer + 1, parent);
    }

    match last_success {
        None => {
            // Should exist for a gracious branch; place it down anyway.
            tracing::warn!(
                layer = layer_idx,
                "no valid placement found for gracious element; branch may float"
            );
            diag.report_critical();
            diag.count_non_gracious_drop();
            move_bounds[layer_idx][elem_idx].state.to_model_gracious = false;
            set_to_model_contact_simple(move_bounds, layer_idx, elem_idx);
        }
        Some((anchor_layer, anchor_idx)) => {
            // Remove the chain below the anchor.
            let mut walk = (layer_idx, elem_idx);
            while walk != (anchor_layer, anchor_idx) {
                let (layer, idx) = walk;
                let parent = move_bounds[layer][idx].parents[0] as usize;
                move_bounds[layer][idx].state.deleted = true;
                walk = (layer + 1, parent);
            }
            let elem = &mut move_bounds[anchor_layer][anchor_idx];
            let best = move_inside_if_outside(&elem.influence_area, elem.state.next_position);
            elem.state.result_on_layer = Some(best);
            tracing::debug!(
                layer = anchor_layer,
                point = %best,
                "added gracious support-on-model point"
            );
        }
    }
}

/// Remove elements marked deleted and remap parent indices, one downward
/// pass.
pub fn remove_deleted_elements(move_bounds: &mut [SupportElements]) {
    // The map of the layer processed in the previous iteration (the layer
    // above the current one): old index -> new index, -1 for removed.
    let mut map_parents: Vec<i32> = Vec::new();
    for layer_idx in (0..move_bounds.len()).rev() {
        let layer = &mut move_bounds[layer_idx];
        let mut map_current = vec![-1i32; layer.len()];
        let mut next = 0i32;
        for (i, elem) in layer.iter().enumerate() {
            if !elem.state.deleted {
                map_current[i] = next;
                next += 1;
            }
        }
        layer.retain(|e| !e.state.deleted);
        if !map_parents.is_empty() {
            for elem in layer.iter_mut() {
                elem.parents.retain_mut(|p| {
                    let np = map_parents[*p as usize];
                    if np < 0 {
                        false
                    } else {
                        *p = np;
                        true
                    }
                });
            }
        }
        map_parents = map_current;
    }
}

/// Resolve `result_on_layer` for every element, bottom up.
pub fn create_nodes_from_area(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    move_bounds: &mut Vec<SupportElements>,
    diag: &DiagnosticsContext,
    cancel: &CancelToken,
) -> TreeSupportResult<()> {
    if move_bounds.is_empty() {
        return Ok(());
    }

    // Layer 0: any point inside the influence area is a valid anchor on
    // the plate; the next_position hint biases toward upcoming splits.
    if move_bounds.len() > 1 {
        for elem in &mut move_bounds[1] {
            elem.state.marked = false;
        }
    }
    for elem_idx in 0..move_bounds[0].len() {
        {
            let elem = &mut move_bounds[0][elem_idx];
            elem.state.result_on_layer = Some(move_inside_if_outside(
                &elem.influence_area,
                elem.state.next_position,
            ));
        }
        set_points_on_areas(move_bounds, 0, elem_idx, diag);
    }
    cancel.check()?;

    for layer_idx in 1..move_bounds.len() {
        if layer_idx + 1 < move_bounds.len() {
            for elem in &mut move_bounds[layer_idx + 1] {
                elem.state.marked = false;
            }
        }
        for elem_idx in 0..move_bounds[layer_idx].len() {
            let (result_set, to_buildplate, dtt, supports_roof, gracious, target_height, marked) = {
                let elem = &move_bounds[layer_idx][elem_idx];
                debug_assert!(!elem.state.deleted);
                (
                    elem.state.result_on_layer_is_set(),
                    elem.state.to_buildplate,
                    elem.state.distance_to_top as usize,
                    elem.state.supports_roof,
                    elem.state.to_model_gracious,
                    elem.state.target_height,
                    elem.state.marked,
                )
            };

            if !result_set {
                if to_buildplate || (dtt < settings.min_dtt_to_model && !supports_roof) {
                    if to_buildplate {
                        let elem = &move_bounds[layer_idx][elem_idx];
                        tracing::error!(
                            layer = layer_idx,
                            target = elem.state.target_height,
                            target_position = %elem.state.target_position,
                            "uninitialized influence area; a branch could be missing"
                        );
                        diag.report_critical();
                    }
                    // Parents have a lower dtt and no result either; they
                    // will be culled when their layer is reached.
                    move_bounds[layer_idx][elem_idx].state.deleted = true;
                } else if gracious {
                    set_to_model_contact_gracious(
                        volumes, settings, move_bounds, layer_idx, elem_idx, diag,
                    );
                } else {
                    set_to_model_contact_simple(move_bounds, layer_idx, elem_idx);
                }
            }

            let deleted_now = move_bounds[layer_idx][elem_idx].state.deleted;
            if !deleted_now && !marked && target_height == layer_idx {
                // A tip no child ever reached: nothing below continues it.
                move_bounds[layer_idx][elem_idx].state.deleted = true;
            }
            if move_bounds[layer_idx][elem_idx].state.deleted {
                // All parent positions become invalid with this branch;
                // they may have been pre-set when a roof refused to move.
                let parents = move_bounds[layer_idx][elem_idx].parents.clone();
                if layer_idx + 1 < move_bounds.len() {
                    for parent_idx in parents {
                        move_bounds[layer_idx + 1][parent_idx as usize]
                            .state
                            .result_on_layer_reset();
                    }
                }
            } else {
                set_points_on_areas(move_bounds, layer_idx, elem_idx, diag);
            }
        }
        cancel.check()?;
    }

    remove_deleted_elements(move_bounds);
    Ok(())
}
