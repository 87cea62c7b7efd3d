//! Influence-area propagation: the top-down layer sweep.
//!
//! For every element the propagator computes the influence area one layer
//! below: the parent's area grown by the movement budget, minus the
//! avoidance for the element's radius. An ordered list of increasingly
//! permissive settings is tried; the first one that leaves a viable area
//! wins. An element for which nothing works loses its child and the
//! subtree is culled later by the node resolver.

use super::element::{
    get_collision_radius, get_radius, AreaIncreaseSettings, SupportElement, SupportElementState,
    SupportElements,
};
use super::merge;
use super::settings::TreeSupportSettings;
use crate::clipper::{self, OffsetJoin};
use crate::error::{CancelToken, DiagnosticsContext, TreeSupportResult};
use crate::geometry::{area, get_extents, BoundingBox, Polygons};
use crate::volumes::{AvoidanceKind, VolumeOracle};
use crate::{scale, Coord, LayerIndex, TINY_AREA_THRESHOLD};
use rayon::prelude::*;

/// The three polygon channels a pre-merge element carries.
#[derive(Debug, Default, Clone)]
pub struct InfluenceAreas {
    /// Largest admissible area, avoidance not yet subtracted.
    pub influence_areas: Polygons,
    /// Part of the area from which the build plate stays reachable.
    pub to_bp_areas: Polygons,
    /// Part of the area from which the model stays reachable.
    pub to_model_areas: Polygons,
}

impl InfluenceAreas {
    pub fn clear(&mut self) {
        self.influence_areas.clear();
        self.to_bp_areas.clear();
        self.to_model_areas.clear();
    }
}

/// An element in flight between propagation and merging.
#[derive(Debug, Clone)]
pub struct MergingElement {
    pub state: SupportElementState,
    /// Indices into the layer above.
    pub parents: Vec<i32>,
    pub areas: InfluenceAreas,
    pub bbox: BoundingBox,
    /// Do not consider this element for merging (it must keep its area).
    pub bypass_merge: bool,
}

impl MergingElement {
    pub fn set_bbox(&mut self, bbox: BoundingBox) {
        // Inflated slightly so grazing boxes still count as intersecting.
        self.bbox = bbox.inflated(scale(0.001));
    }
}

/// Outcome of one `increase_single_area` attempt.
struct SingleAreaResult {
    state: SupportElementState,
    to_bp_data: Polygons,
    to_model_data: Polygons,
    increased: Polygons,
}

#[allow(clippy::too_many_arguments)]
fn increase_single_area(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    area_settings: &AreaIncreaseSettings,
    layer_idx: LayerIndex,
    parent: &SupportElement,
    relevant_offset: &Polygons,
    overspeed: Coord,
    mergelayer: bool,
    diag: &DiagnosticsContext,
) -> Option<SingleAreaResult> {
    let mut current_elem = parent.state.propagate_down();
    if area_settings.increase_radius {
        current_elem.effective_radius_height += 1;
    }
    let mut radius = get_collision_radius(settings, &current_elem);

    let increased: Polygons = if area_settings.allow_move {
        let mut inc = relevant_offset.clone();
        if overspeed > 0 {
            let safe_movement_distance = (if current_elem.use_min_xy_dist {
                settings.xy_min_distance
            } else {
                settings.xy_distance
            }) + if settings.z_distance_top_layers.min(settings.z_distance_bottom_layers) > 0 {
                settings.min_feature_size
            } else {
                0
            };
            // Conformance to the wall restriction only; collision and
            // avoidance are subtracted afterwards.
            inc = clipper::safe_offset_inc(
                &inc,
                overspeed,
                &volumes.wall_restriction(
                    get_collision_radius(settings, &parent.state),
                    layer_idx,
                    parent.state.use_min_xy_dist,
                ),
                safe_movement_distance,
                safe_movement_distance + radius,
                1,
            );
        }
        if area_settings.no_error && area_settings.allow_move {
            // Rounded offsets explode the vertex count.
            inc = clipper::simplify(&inc, scale(0.025));
        }
        inc
    } else {
        parent.influence_area.clone()
    };

    let mut to_bp_data: Polygons = Vec::new();
    let mut to_model_data: Polygons = Vec::new();

    if mergelayer || current_elem.to_buildplate {
        to_bp_data = clipper::safe_union(
            &clipper::diff_clipped(
                &increased,
                &volumes.avoidance(
                    radius,
                    layer_idx - 1,
                    area_settings.kind,
                    false,
                    area_settings.use_min_distance,
                ),
            ),
            &[],
        );
        if !current_elem.to_buildplate && area(&to_bp_data) > TINY_AREA_THRESHOLD {
            // A tainted parent marked this subtree as model-bound even
            // though the plate is reachable. Repair it.
            current_elem.to_buildplate = true;
            tracing::debug!(
                layer = layer_idx - 1,
                target = current_elem.target_height,
                radius,
                "corrected taint leading to a wrong to-model value"
            );
        }
    }
    if settings.support_rests_on_model {
        if mergelayer || current_elem.to_model_gracious {
            to_model_data = clipper::safe_union(
                &clipper::diff_clipped(
                    &increased,
                    &volumes.avoidance(
                        radius,
                        layer_idx - 1,
                        area_settings.kind,
                        true,
                        area_settings.use_min_distance,
                    ),
                ),
                &[],
            );
        }
        if !current_elem.to_model_gracious {
            if mergelayer && area(&to_model_data) >= TINY_AREA_THRESHOLD {
                current_elem.to_model_gracious = true;
                tracing::debug!(
                    layer = layer_idx - 1,
                    target = current_elem.target_height,
                    radius,
                    "corrected taint leading to a wrong non-gracious value"
                );
            } else {
                to_model_data = clipper::safe_union(
                    &clipper::diff_clipped(
                        &increased,
                        &volumes.collision(radius, layer_idx - 1, area_settings.use_min_distance),
                    ),
                    &[],
                );
            }
        }
    }

    let current_check_area = |to_bp: &Polygons, to_model: &Polygons, to_buildplate: bool| -> f64 {
        if to_buildplate {
            area(to_bp)
        } else {
            area(to_model)
        }
    };

    if area_settings.increase_radius
        && current_check_area(&to_bp_data, &to_model_data, current_elem.to_buildplate)
            > TINY_AREA_THRESHOLD
    {
        let to_bp_flag = current_elem.to_buildplate;
        let gracious_flag = current_elem.to_model_gracious;
        let valid_with_radius = |current_radius: Coord, next_radius: Coord| -> bool {
            if volumes.ceil_radius(next_radius, area_settings.use_min_distance)
                <= volumes.ceil_radius(current_radius, area_settings.use_min_distance)
            {
                return true;
            }
            let check2 = if to_bp_flag {
                clipper::diff_clipped(
                    &increased,
                    &volumes.avoidance(
                        next_radius,
                        layer_idx - 1,
                        area_settings.kind,
                        false,
                        area_settings.use_min_distance,
                    ),
                )
            } else if settings.support_rests_on_model {
                clipper::diff_clipped(
                    &increased,
                    &if gracious_flag {
                        (*volumes.avoidance(
                            next_radius,
                            layer_idx - 1,
                            area_settings.kind,
                            true,
                            area_settings.use_min_distance,
                        ))
                        .clone()
                    } else {
                        (*volumes.collision(
                            next_radius,
                            layer_idx - 1,
                            area_settings.use_min_distance,
                        ))
                        .clone()
                    },
                )
            } else {
                Vec::new()
            };
            area(&check2) > TINY_AREA_THRESHOLD
        };

        let ceil_radius_before = volumes.ceil_radius(radius, area_settings.use_min_distance);

        if get_collision_radius(settings, &current_elem) < settings.increase_radius_until_radius
            && get_collision_radius(settings, &current_elem) < get_radius(settings, &current_elem)
        {
            // Climb the radius ladder toward the real radius while the
            // area stays viable.
            let target_radius =
                get_radius(settings, &current_elem).min(settings.increase_radius_until_radius);
            let mut current_ceil =
                volumes.ceil_radius_next(radius, area_settings.use_min_distance);
            while current_ceil < target_radius
                && valid_with_radius(
                    radius,
                    volumes.ceil_radius_next(current_ceil + 1, area_settings.use_min_distance),
                )
            {
                current_ceil =
                    volumes.ceil_radius_next(current_ceil + 1, area_settings.use_min_distance);
            }
            let mut resulting_eff_dtt = current_elem.effective_radius_height;
            while resulting_eff_dtt + 1 < current_elem.distance_to_top
                && settings.get_radius(
                    resulting_eff_dtt as usize + 1,
                    current_elem.elephant_foot_increases,
                ) <= current_ceil
                && settings.get_radius(
                    resulting_eff_dtt as usize + 1,
                    current_elem.elephant_foot_increases,
                ) <= get_radius(settings, &current_elem)
            {
                resulting_eff_dtt += 1;
            }
            current_elem.effective_radius_height = resulting_eff_dtt;
        }
        radius = get_collision_radius(settings, &current_elem);

        let foot_radius_increase = settings.branch_radius as f64
            * (settings.diameter_scale_bp_radius - settings.diameter_angle_scale_factor).max(0.0);
        if foot_radius_increase > 0.0 {
            // Mostly 1, but kept below the point where the foot would
            // outrun the precalculated recommended radius.
            let planned_foot_increase = (1.0_f64).min(
                (settings.recommended_min_radius(layer_idx - 1)
                    - get_radius(settings, &current_elem)) as f64
                    / foot_radius_increase,
            );
            let increase_bp_foot = planned_foot_increase > 0.0 && current_elem.to_buildplate;
            if increase_bp_foot
                && get_radius(settings, &current_elem) >= settings.branch_radius
                && get_radius(settings, &current_elem) >= settings.increase_radius_until_radius
                && valid_with_radius(
                    radius,
                    settings.get_radius(
                        current_elem.effective_radius_height as usize,
                        current_elem.elephant_foot_increases + planned_foot_increase,
                    ),
                )
            {
                current_elem.elephant_foot_increases += planned_foot_increase;
                radius = get_collision_radius(settings, &current_elem);
            }
        }

        if ceil_radius_before != volumes.ceil_radius(radius, area_settings.use_min_distance) {
            // The radius grew across a ladder entry; all clipped channels
            // have to be recomputed at the new radius.
            if current_elem.to_buildplate {
                to_bp_data = clipper::safe_union(
                    &clipper::diff_clipped(
                        &increased,
                        &volumes.avoidance(
                            radius,
                            layer_idx - 1,
                            area_settings.kind,
                            false,
                            area_settings.use_min_distance,
                        ),
                    ),
                    &[],
                );
            }
            if settings.support_rests_on_model && (!current_elem.to_buildplate || mergelayer) {
                to_model_data = clipper::safe_union(
                    &clipper::diff_clipped(
                        &increased,
                        &if current_elem.to_model_gracious {
                            (*volumes.avoidance(
                                radius,
                                layer_idx - 1,
                                area_settings.kind,
                                true,
                                area_settings.use_min_distance,
                            ))
                            .clone()
                        } else {
                            (*volumes.collision(
                                radius,
                                layer_idx - 1,
                                area_settings.use_min_distance,
                            ))
                            .clone()
                        },
                    ),
                    &[],
                );
            }
            if current_check_area(&to_bp_data, &to_model_data, current_elem.to_buildplate)
                < TINY_AREA_THRESHOLD
            {
                tracing::error!(
                    layer = layer_idx - 1,
                    target = current_elem.target_height,
                    radius,
                    "lost area catching the radius up to its ladder entry"
                );
                diag.report_critical();
            }
        }
    }

    let final_check = if current_elem.to_buildplate {
        area(&to_bp_data)
    } else {
        area(&to_model_data)
    };
    if final_check > TINY_AREA_THRESHOLD {
        Some(SingleAreaResult {
            state: current_elem,
            to_bp_data,
            to_model_data,
            increased,
        })
    } else {
        None
    }
}

/// Build the ordered list of settings to try for one element.
fn build_settings_order(
    settings: &TreeSupportSettings,
    volumes: &dyn VolumeOracle,
    elem: &SupportElementState,
    parent: &SupportElement,
    layer_idx: LayerIndex,
    mergelayer: bool,
    slow_speed: Coord,
    fast_speed: Coord,
) -> Vec<AreaIncreaseSettings> {
    let mut order: Vec<AreaIncreaseSettings> = Vec::new();
    let mut insert = |order: &mut Vec<AreaIncreaseSettings>, s: AreaIncreaseSettings, back: bool| {
        if !order.contains(&s) {
            if back {
                order.push(s);
            } else {
                order.insert(0, s);
            }
        }
    };

    let parent_moved_slow = elem.last_area_increase.increase_speed < settings.maximum_move_distance;
    let avoidance_speed_mismatch =
        parent_moved_slow && elem.last_area_increase.kind != AvoidanceKind::Slow;
    if elem.last_area_increase.allow_move
        && elem.last_area_increase.no_error
        && elem.can_use_safe_radius
        && !mergelayer
        && !avoidance_speed_mismatch
        && (elem.distance_to_top as usize >= settings.tip_layers || parent_moved_slow)
    {
        // The settings that worked for the parent usually work again.
        let speed = if parent_moved_slow { slow_speed } else { fast_speed };
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: elem.last_area_increase.kind,
                increase_speed: speed,
                increase_radius: true,
                no_error: elem.last_area_increase.no_error,
                use_min_distance: false,
                allow_move: elem.last_area_increase.allow_move,
            },
            true,
        );
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: elem.last_area_increase.kind,
                increase_speed: speed,
                increase_radius: false,
                no_error: elem.last_area_increase.no_error,
                use_min_distance: false,
                allow_move: elem.last_area_increase.allow_move,
            },
            true,
        );
    }

    if !elem.can_use_safe_radius {
        // The branch may still be inside a hole. Confirm the hole has
        // been passed with a no-move slow check, then prefer fast moves
        // with the safe avoidance so holes are avoided where possible.
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::Slow,
                increase_speed: slow_speed,
                increase_radius: true,
                no_error: true,
                use_min_distance: false,
                allow_move: false,
            },
            true,
        );
        if (elem.distance_to_top as usize) < settings.tip_layers.div_ceil(2) {
            // The hole definition is overly strict near the tip.
            insert(
                &mut order,
                AreaIncreaseSettings {
                    kind: AvoidanceKind::Fast,
                    increase_speed: slow_speed,
                    increase_radius: true,
                    no_error: true,
                    use_min_distance: false,
                    allow_move: false,
                },
                true,
            );
        }
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::FastSafe,
                increase_speed: fast_speed,
                increase_radius: true,
                no_error: true,
                use_min_distance: false,
                allow_move: false,
            },
            true,
        );
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::FastSafe,
                increase_speed: fast_speed,
                increase_radius: false,
                no_error: true,
                use_min_distance: false,
                allow_move: true,
            },
            true,
        );
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::Fast,
                increase_speed: fast_speed,
                increase_radius: false,
                no_error: true,
                use_min_distance: false,
                allow_move: true,
            },
            true,
        );
    } else {
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::Slow,
                increase_speed: slow_speed,
                increase_radius: true,
                no_error: true,
                use_min_distance: false,
                allow_move: true,
            },
            true,
        );
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::Slow,
                increase_speed: slow_speed,
                increase_radius: false,
                no_error: true,
                use_min_distance: false,
                allow_move: true,
            },
            true,
        );
        if (elem.distance_to_top as usize) < settings.tip_layers {
            insert(
                &mut order,
                AreaIncreaseSettings {
                    kind: AvoidanceKind::FastSafe,
                    increase_speed: slow_speed,
                    increase_radius: true,
                    no_error: true,
                    use_min_distance: false,
                    allow_move: true,
                },
                true,
            );
        }
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::FastSafe,
                increase_speed: fast_speed,
                increase_radius: true,
                no_error: true,
                use_min_distance: false,
                allow_move: true,
            },
            true,
        );
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::FastSafe,
                increase_speed: fast_speed,
                increase_radius: false,
                no_error: true,
                use_min_distance: false,
                allow_move: true,
            },
            true,
        );
    }

    if elem.use_min_xy_dist {
        // Interleave: each setting is also tried with the regular XY
        // distance first, so the branch escapes the tight regime as soon
        // as it can.
        let mut new_order = Vec::with_capacity(order.len() * 2);
        for s in &order {
            new_order.push(*s);
            new_order.push(AreaIncreaseSettings {
                use_min_distance: true,
                ..*s
            });
        }
        order = new_order;
    }

    let radius = get_collision_radius(settings, elem);
    if elem.to_buildplate
        || (elem.to_model_gracious
            && clipper::intersection(
                &parent.influence_area,
                &volumes.placeable_areas(radius, layer_idx),
            )
            .is_empty())
    {
        // Last resort: move too fast rather than lose the branch.
        order.push(AreaIncreaseSettings {
            kind: AvoidanceKind::Fast,
            increase_speed: fast_speed,
            increase_radius: false,
            no_error: false,
            use_min_distance: elem.use_min_xy_dist,
            allow_move: true,
        });
    }
    if (elem.distance_to_top) < elem.dont_move_until && elem.can_use_safe_radius {
        // Only stand still while hole avoidance is guaranteed.
        insert(
            &mut order,
            AreaIncreaseSettings {
                kind: AvoidanceKind::Slow,
                increase_speed: 0,
                increase_radius: true,
                no_error: true,
                use_min_distance: false,
                allow_move: false,
            },
            false,
        );
    }

    order
}

/// Propagate every element of `layer_elements` one layer down into
/// `merging_areas`. Elements whose propagation fails get their parent's
/// `result_on_layer` reset so the resolver can cull the subtree.
#[allow(clippy::too_many_arguments)]
fn increase_areas_one_layer(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    merging_areas: &mut Vec<MergingElement>,
    layer_idx: LayerIndex,
    layer_elements: &mut SupportElements,
    mergelayer: bool,
    diag: &DiagnosticsContext,
    cancel: &CancelToken,
) -> TreeSupportResult<()> {
    let elements: &SupportElements = layer_elements;
    let failures: Vec<Option<i32>> = merging_areas
        .par_iter_mut()
        .map(|merging_area| -> TreeSupportResult<Option<i32>> {
            cancel.check()?;
            let parent_idx = merging_area.parents[0];
            let parent = &elements[parent_idx as usize];
            let elem = parent.state.propagate_down();
            let wall_restriction = volumes.wall_restriction(
                get_collision_radius(settings, &parent.state),
                layer_idx,
                parent.state.use_min_xy_dist,
            );

            let radius = get_collision_radius(settings, &elem);

            // Faster-than-configured slack: the branch radius may grow
            // this layer, which moves the outer wall outward for free; add
            // that growth to the movement budget. 5 microns extra absorb
            // rounding.
            let mut extra_speed: Coord = 5;
            let mut extra_slow_speed: Coord = 0;
            let ceiled_parent_radius = volumes.ceil_radius(
                get_collision_radius(settings, &parent.state),
                parent.state.use_min_xy_dist,
            );
            let projected_radius_increased = settings.get_radius(
                parent.state.effective_radius_height as usize + 1,
                parent.state.elephant_foot_increases,
            );
            let projected_radius_delta =
                projected_radius_increased - get_collision_radius(settings, &parent.state);
            if ceiled_parent_radius
                == volumes.ceil_radius(projected_radius_increased, parent.state.use_min_xy_dist)
                || projected_radius_increased < settings.increase_radius_until_radius
            {
                extra_speed += projected_radius_delta;
            } else {
                extra_slow_speed += projected_radius_delta.min(
                    (settings.maximum_move_distance + extra_speed)
                        - (settings.maximum_move_distance_slow + extra_slow_speed),
                );
            }
            if settings.layer_start_bp_radius > layer_idx
                && settings.recommended_min_radius(layer_idx - 1)
                    < settings.get_radius(
                        elem.effective_radius_height as usize + 1,
                        elem.elephant_foot_increases,
                    )
            {
                // Guaranteed elephant-foot growth widens the budget too.
                let foot_speed = (settings.branch_radius as f64
                    * settings.diameter_scale_bp_radius) as Coord;
                if ceiled_parent_radius
                    == volumes.ceil_radius(
                        settings.get_radius(
                            parent.state.effective_radius_height as usize + 1,
                            parent.state.elephant_foot_increases + 1.0,
                        ),
                        parent.state.use_min_xy_dist,
                    )
                {
                    extra_speed += foot_speed;
                } else {
                    extra_slow_speed += foot_speed.min(
                        settings.maximum_move_distance
                            - (settings.maximum_move_distance_slow + extra_slow_speed),
                    );
                }
            }

            let fast_speed = settings.maximum_move_distance + extra_speed;
            let slow_speed = settings.maximum_move_distance_slow + extra_speed + extra_slow_speed;

            let safe_movement_distance = (if elem.use_min_xy_dist {
                settings.xy_min_distance
            } else {
                settings.xy_distance
            }) + if settings.z_distance_top_layers.min(settings.z_distance_bottom_layers) > 0 {
                settings.min_feature_size
            } else {
                0
            };

            let order = build_settings_order(
                settings, volumes, &elem, parent, layer_idx, mergelayer, slow_speed, fast_speed,
            );

            let mut offset_slow: Option<Polygons> = None;
            let mut offset_fast: Option<Polygons> = None;
            let mut result: Option<(AreaIncreaseSettings, SingleAreaResult)> = None;

            for area_settings in &order {
                if area_settings.allow_move {
                    if offset_slow.is_none()
                        && (area_settings.increase_speed == slow_speed
                            || area_settings.increase_speed == 0)
                    {
                        // Two offset steps keep the grown area round; the
                        // clipper was never meant for single-micron work.
                        offset_slow = Some(clipper::safe_offset_inc(
                            &parent.influence_area,
                            extra_speed + extra_slow_speed + settings.maximum_move_distance_slow,
                            &wall_restriction,
                            safe_movement_distance,
                            0,
                            2,
                        ));
                    }
                    if offset_fast.is_none() && area_settings.increase_speed != slow_speed {
                        offset_fast = Some(clipper::safe_offset_inc(
                            &parent.influence_area,
                            extra_speed + settings.maximum_move_distance,
                            &wall_restriction,
                            safe_movement_distance,
                            safe_movement_distance + radius,
                            1,
                        ));
                    }
                }

                let attempt = if !area_settings.no_error {
                    // Error case: the area may have degenerated to a line
                    // somewhere; revive it before the oversped offset.
                    let lines_offset = clipper::offset_polylines(
                        &crate::geometry::to_polylines(&parent.influence_area),
                        scale(0.005),
                        OffsetJoin::Miter,
                    );
                    let base_error_area = clipper::union(&parent.influence_area, &lines_offset);
                    let r = increase_single_area(
                        volumes,
                        settings,
                        area_settings,
                        layer_idx,
                        parent,
                        &base_error_area,
                        (settings.maximum_move_distance + extra_speed) * 3 / 2,
                        mergelayer,
                        diag,
                    );
                    tracing::warn!(
                        radius,
                        layer = layer_idx - 1,
                        target = elem.target_height,
                        dtt = elem.distance_to_top,
                        to_buildplate = elem.to_buildplate,
                        gracious = elem.to_model_gracious,
                        "influence area could not be increased within the movement budget"
                    );
                    diag.report_critical();
                    r
                } else {
                    let relevant = if area_settings.increase_speed == slow_speed
                        || area_settings.increase_speed == 0
                    {
                        offset_slow.as_ref()
                    } else {
                        offset_fast.as_ref()
                    }
                    .cloned()
                    .unwrap_or_else(|| parent.influence_area.clone());
                    increase_single_area(
                        volumes,
                        settings,
                        area_settings,
                        layer_idx,
                        parent,
                        &relevant,
                        0,
                        mergelayer,
                        diag,
                    )
                };

                if let Some(mut single) = attempt {
                    single.state.last_area_increase = *area_settings;
                    // No merging for elements that must not move or still
                    // sit in the tight-XY regime near the tip.
                    merging_area.bypass_merge = !area_settings.allow_move
                        || (area_settings.use_min_distance
                            && (single.state.distance_to_top as usize) < settings.tip_layers);
                    if area_settings.allow_move {
                        single.state.dont_move_until = 0;
                    } else {
                        single.state.result_on_layer = parent.state.result_on_layer;
                    }
                    single.state.can_use_safe_radius =
                        area_settings.kind != AvoidanceKind::Fast;
                    if !area_settings.use_min_distance {
                        single.state.use_min_xy_dist = false;
                    }
                    if !area_settings.no_error {
                        tracing::info!(
                            layer = layer_idx - 1,
                            "kept a branch alive by moving faster than intended"
                        );
                        diag.count_lost_branch();
                    }
                    result = Some((*area_settings, single));
                    break;
                }
            }

            match result {
                Some((_, single)) => {
                    let radius = get_collision_radius(settings, &single.state);
                    // A union catches rounding that makes to_bp slightly
                    // larger than the collision-free area.
                    let max_influence_area = clipper::safe_union(
                        &clipper::diff_clipped(
                            &single.increased,
                            &volumes.collision(radius, layer_idx - 1, single.state.use_min_xy_dist),
                        ),
                        &clipper::safe_union(&single.to_bp_data, &single.to_model_data),
                    );
                    merging_area.state = single.state;
                    merging_area.set_bbox(get_extents(&max_influence_area));
                    merging_area.areas.influence_areas = max_influence_area;
                    if !merging_area.bypass_merge {
                        if merging_area.state.to_buildplate {
                            merging_area.areas.to_bp_areas = single.to_bp_data;
                        }
                        if settings.support_rests_on_model {
                            merging_area.areas.to_model_areas = single.to_model_data;
                        }
                    }
                    Ok(None)
                }
                None => {
                    // The parent has no child now; without a child its
                    // position would be assumed valid, so unset it.
                    merging_area.areas.clear();
                    Ok(Some(parent_idx))
                }
            }
        })
        .collect::<TreeSupportResult<Vec<Option<i32>>>>()?;

    for parent_idx in failures.into_iter().flatten() {
        layer_elements[parent_idx as usize]
            .state
            .result_on_layer_reset();
        diag.count_lost_branch();
    }
    Ok(())
}

/// Top-down sweep: propagate every layer into the one below, merging
/// overlapping influence areas on the way.
pub fn create_layer_pathing(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    move_bounds: &mut Vec<SupportElements>,
    diag: &DiagnosticsContext,
    cancel: &CancelToken,
) -> TreeSupportResult<()> {
    if move_bounds.is_empty() {
        return Ok(());
    }

    // Merging is expensive and parallelizes poorly; skip layers where it
    // stopped paying off, but never skip too long. Bounds were tuned for
    // one merge per ~3 mm of height or ~1 mm of slow movement.
    let max_merge_every_x_layers = ((5000 / (settings.maximum_move_distance / 1000).max(100))
        .min(1000 / (settings.maximum_move_distance_slow / 1000).max(20))
        .min(3_000_000 / settings.layer_height) as usize)
        .max(1);
    let mut merge_every_x_layers = 1usize;
    let mut last_merge_layer_idx = move_bounds.len();
    let mut new_element = false;

    for layer_idx in (1..move_bounds.len()).rev() {
        if move_bounds[layer_idx].is_empty() {
            continue;
        }
        cancel.check()?;

        let had_new_element = new_element;
        let merge_this_layer =
            had_new_element || last_merge_layer_idx - layer_idx >= merge_every_x_layers;
        if had_new_element {
            merge_every_x_layers = 1;
        }

        let mut merging_areas: Vec<MergingElement> = (0..move_bounds[layer_idx].len() as i32)
            .map(|element_idx| MergingElement {
                state: move_bounds[layer_idx][element_idx as usize].state.clone(),
                parents: vec![element_idx],
                areas: InfluenceAreas::default(),
                bbox: BoundingBox::new(),
                bypass_merge: false,
            })
            .collect();

        {
            let (before, after) = move_bounds.split_at_mut(layer_idx);
            let this_layer = &mut before[layer_idx - 1];
            let layer_elements = &mut after[0];
            increase_areas_one_layer(
                volumes,
                settings,
                &mut merging_areas,
                layer_idx,
                layer_elements,
                merge_this_layer,
                diag,
                cancel,
            )?;

            // Elements that failed or that bypass merging leave the
            // working set now.
            merging_areas.retain_mut(|elem| {
                if elem.areas.influence_areas.is_empty() {
                    return false;
                }
                if elem.areas.to_bp_areas.is_empty() && elem.areas.to_model_areas.is_empty() {
                    if area(&elem.areas.influence_areas) < TINY_AREA_THRESHOLD {
                        tracing::error!(
                            layer = layer_idx - 1,
                            "insert error of influence area bypassing merge"
                        );
                        diag.report_critical();
                    }
                    this_layer.push(SupportElement::new(
                        elem.state.clone(),
                        std::mem::take(&mut elem.parents),
                        std::mem::take(&mut elem.areas.influence_areas),
                    ));
                    return false;
                }
                true
            });
        }

        new_element = !move_bounds[layer_idx - 1].is_empty();

        if merge_this_layer {
            let count_before_merge = merging_areas.len();
            if count_before_merge > 1 {
                merge::merge_influence_areas(
                    volumes,
                    settings,
                    layer_idx,
                    &mut merging_areas,
                    cancel,
                )?;
            }
            let reduced_by_merging = count_before_merge > merging_areas.len();
            last_merge_layer_idx = layer_idx;
            if !reduced_by_merging && !had_new_element {
                merge_every_x_layers = (merge_every_x_layers + 1).min(max_merge_every_x_layers);
            }
        }

        for elem in merging_areas {
            if elem.areas.influence_areas.is_empty() {
                continue;
            }
            let new_area = clipper::safe_union(&elem.areas.influence_areas, &[]);
            if area(&new_area) < TINY_AREA_THRESHOLD {
                tracing::error!(
                    layer = layer_idx - 1,
                    parents = elem.parents.len(),
                    to_buildplate = elem.state.to_buildplate,
                    "insert error of influence area after merge"
                );
                diag.report_critical();
            }
            move_bounds[layer_idx - 1].push(SupportElement::new(elem.state, elem.parents, new_area));
        }
        cancel.check()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticsContext;
    use crate::geometry::{make_circle, ExPolygons, Point, Polygon};
    use crate::support::element::LineStatus;
    use crate::support::settings::TreeSupportMeshGroupSettings;
    use crate::volumes::{TreeModelVolumes, VolumeConfig};

    fn settings() -> TreeSupportSettings {
        TreeSupportSettings::new(&TreeSupportMeshGroupSettings::default()).unwrap()
    }

    fn empty_volumes(layers: usize, settings: &TreeSupportSettings) -> TreeModelVolumes {
        let outlines: Vec<ExPolygons> = vec![Vec::new(); layers];
        TreeModelVolumes::new(
            VolumeConfig {
                xy_distance: settings.xy_distance,
                xy_min_distance: settings.xy_min_distance,
                max_move: settings.maximum_move_distance,
                max_move_slow: settings.maximum_move_distance_slow,
                min_radius: settings.min_radius,
                z_distance_top_layers: settings.z_distance_top_layers,
                z_distance_bottom_layers: settings.z_distance_bottom_layers,
                support_rests_on_model: settings.support_rests_on_model,
            },
            &outlines,
        )
    }

    fn tip_element(layer: LayerIndex, at: Point) -> SupportElement {
        let state = SupportElementState::new_tip(layer, at, LineStatus::ToBuildPlateSafe);
        let mut circle = make_circle(crate::scale(0.01), 25);
        circle.translate(at);
        SupportElement::new(state, Vec::new(), vec![circle])
    }

    #[test]
    fn single_tip_descends_to_the_plate() {
        let settings = settings();
        let volumes = empty_volumes(12, &settings);
        let diag = DiagnosticsContext::new();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 12];
        move_bounds[10].push(tip_element(10, Point::new(crate::scale(5.0), 0)));

        create_layer_pathing(&volumes, &settings, &mut move_bounds, &diag, &CancelToken::new())
            .unwrap();

        // One element per layer from the tip down to layer 0.
        for layer in 0..=10 {
            assert_eq!(move_bounds[layer].len(), 1, "layer {layer}");
        }
        // Radius (via effective dtt) never shrinks downward.
        let mut above = get_collision_radius(&settings, &move_bounds[10][0].state);
        for layer in (0..10).rev() {
            let r = get_collision_radius(&settings, &move_bounds[layer][0].state);
            assert!(r >= above, "radius shrank between layers {} and {layer}", layer + 1);
            above = r;
        }
        // Parent indices stay layer-monotone.
        for layer in 0..10 {
            for elem in &move_bounds[layer] {
                for &p in &elem.parents {
                    assert!((p as usize) < move_bounds[layer + 1].len());
                }
            }
        }
    }

    #[test]
    fn influence_area_avoids_collision() {
        let settings = settings();
        // A wall right next to the tip.
        let wall = Polygon::rectangle(
            Point::new(crate::scale(1.0), -crate::scale(5.0)),
            Point::new(crate::scale(3.0), crate::scale(5.0)),
        );
        let outlines: Vec<ExPolygons> =
            vec![vec![crate::geometry::ExPolygon::new(wall)]; 8];
        let volumes = TreeModelVolumes::new(
            VolumeConfig {
                support_rests_on_model: false,
                ..VolumeConfig::default()
            },
            &outlines,
        );
        let diag = DiagnosticsContext::new();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 8];
        move_bounds[6].push(tip_element(6, Point::new(-crate::scale(2.0), 0)));

        create_layer_pathing(&volumes, &settings, &mut move_bounds, &diag, &CancelToken::new())
            .unwrap();

        for layer in 0..=6 {
            for elem in &move_bounds[layer] {
                let radius = get_collision_radius(&settings, &elem.state);
                let collision = volumes.collision(radius, layer, elem.state.use_min_xy_dist);
                let overlap = clipper::intersection(&elem.influence_area, &collision);
                assert!(
                    area(&overlap) <= TINY_AREA_THRESHOLD,
                    "influence area intersects collision on layer {layer}"
                );
            }
        }
    }

    #[test]
    fn two_tips_merge_into_one_trunk() {
        let settings = settings();
        let volumes = empty_volumes(30, &settings);
        let diag = DiagnosticsContext::new();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 30];
        // 3 mm apart; influence areas grow by ~maximum_move_distance per
        // layer from a 0.01 mm seed, so they meet well above layer 0.
        move_bounds[25].push(tip_element(25, Point::new(-crate::scale(1.5), 0)));
        move_bounds[25].push(tip_element(25, Point::new(crate::scale(1.5), 0)));

        create_layer_pathing(&volumes, &settings, &mut move_bounds, &diag, &CancelToken::new())
            .unwrap();

        assert_eq!(move_bounds[0].len(), 1, "tips should merge into one trunk");
        // The merged element records both parents somewhere down the
        // chain.
        let merged_layer = (0..25)
            .rev()
            .find(|&l| move_bounds[l].iter().any(|e| e.parents.len() >= 2))
            .expect("a merge must have happened");
        assert!(merged_layer < 25);
    }

    #[test]
    fn dont_move_until_keeps_position() {
        let settings = settings();
        let volumes = empty_volumes(10, &settings);
        let diag = DiagnosticsContext::new();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 10];
        let mut tip = tip_element(8, Point::new(crate::scale(2.0), crate::scale(2.0)));
        tip.state.dont_move_until = 3;
        move_bounds[8].push(tip);

        create_layer_pathing(&volumes, &settings, &mut move_bounds, &diag, &CancelToken::new())
            .unwrap();

        // While dtt < dont_move_until the element keeps its parent's
        // position (result_on_layer stays pinned).
        for layer in [7usize, 6] {
            let elem = &move_bounds[layer][0];
            if (elem.state.distance_to_top) < elem.state.dont_move_until {
                assert!(elem.state.result_on_layer_is_set());
            }
        }
    }

    #[test]
    fn propagation_is_cancellable() {
        let settings = settings();
        let volumes = empty_volumes(10, &settings);
        let diag = DiagnosticsContext::new();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 10];
        move_bounds[8].push(tip_element(8, Point::zero()));
        let token = CancelToken::new();
        token.cancel();
        assert!(
            create_layer_pathing(&volumes, &settings, &mut move_bounds, &diag, &token).is_err()
        );
    }

    #[test]
    fn influence_area_stays_inside_avoidance_complement() {
        let settings = settings();
        let wall = Polygon::rectangle(
            Point::new(crate::scale(2.0), -crate::scale(8.0)),
            Point::new(crate::scale(4.0), crate::scale(8.0)),
        );
        let outlines: Vec<ExPolygons> =
            vec![vec![crate::geometry::ExPolygon::new(wall)]; 10];
        let volumes = TreeModelVolumes::new(VolumeConfig::default(), &outlines);
        let diag = DiagnosticsContext::new();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 10];
        move_bounds[8].push(tip_element(8, Point::new(-crate::scale(3.0), 0)));

        create_layer_pathing(&volumes, &settings, &mut move_bounds, &diag, &CancelToken::new())
            .unwrap();

        // For to-buildplate elements, the influence area must avoid the
        // recorded avoidance kind.
        for layer in 1..8 {
            for elem in &move_bounds[layer] {
                if !elem.state.to_buildplate {
                    continue;
                }
                let radius = get_collision_radius(&settings, &elem.state);
                let avoid = volumes.avoidance(
                    radius,
                    layer,
                    elem.state.last_area_increase.kind,
                    false,
                    elem.state.last_area_increase.use_min_distance,
                );
                let overlap = clipper::intersection(&elem.influence_area, &avoid);
                assert!(
                    area(&overlap) <= TINY_AREA_THRESHOLD * 4.0,
                    "to-bp influence area violates avoidance on layer {layer}"
                );
            }
        }
    }
}
