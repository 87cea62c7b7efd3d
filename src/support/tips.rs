//! Tip placement: turning overhang polygons into initial influence areas.
//!
//! Overhangs are filled with support lines, the lines are resampled into
//! evenly spaced points, every point is classified by which avoidance
//! zones it escapes, and each surviving point becomes a one-point
//! influence area (a tiny circle) on the layer `z_distance_top_layers + 1`
//! below the overhang. Large-enough overhangs get dense roof layers
//! instead of immediate tips, with the tips starting below the roof.

use super::element::{
    LineInformation, LineInformations, LineStatus, SupportElement, SupportElementState,
    SupportElements,
};
use super::settings::TreeSupportSettings;
use crate::clipper::{self, OffsetJoin};
use crate::error::{CancelToken, DiagnosticsContext, TreeSupportResult};
use crate::geometry::{
    contains, make_circle, to_polylines, total_length, Point, Polygon, Polygons, Polyline,
    Polylines,
};
use crate::infill::{FillPattern, InfillOracle};
use crate::volumes::{AvoidanceKind, VolumeOracle};
use crate::{scale, Coord, LayerIndex};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Mutex;

/// Vertex count of generated tip/roof circles.
pub const TREE_CIRCLE_RESOLUTION: usize = 25;

/// Radius of the seed circle placed at each tip sample.
const BASE_RADIUS: Coord = 10_000; // 0.01 mm

/// Result of the tip placement stage.
#[derive(Debug, Default)]
pub struct TipPlacement {
    /// Initial elements per layer.
    pub move_bounds: Vec<SupportElements>,
    /// Roof polygons per layer, fed to the finalizer's top contacts.
    pub roof_storage: Vec<Polygons>,
}

/// Classify each polyline point by the avoidance zones it escapes.
///
/// Points that sit inside everything are dropped; a drop splits the
/// current run and a new line starts at the next valid point.
pub fn convert_lines_to_internal(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    polylines: &Polylines,
    layer_idx: LayerIndex,
) -> LineInformations {
    let min_xy = settings.xy_distance > settings.xy_min_distance;
    let radius = settings.get_radius(0, 0.0);

    let mut result = Vec::new();
    for line in polylines {
        let mut current: LineInformation = Vec::new();
        for &p in line.points() {
            let status = if !contains(
                &volumes.avoidance(radius, layer_idx, AvoidanceKind::FastSafe, false, min_xy),
                p,
            ) {
                LineStatus::ToBuildPlateSafe
            } else if !contains(
                &volumes.avoidance(radius, layer_idx, AvoidanceKind::Fast, false, min_xy),
                p,
            ) {
                LineStatus::ToBuildPlate
            } else if settings.support_rests_on_model
                && !contains(
                    &volumes.avoidance(radius, layer_idx, AvoidanceKind::FastSafe, true, min_xy),
                    p,
                )
            {
                LineStatus::ToModelGraciousSafe
            } else if settings.support_rests_on_model
                && !contains(
                    &volumes.avoidance(radius, layer_idx, AvoidanceKind::Fast, true, min_xy),
                    p,
                )
            {
                LineStatus::ToModelGracious
            } else if settings.support_rests_on_model
                && !contains(&volumes.collision(radius, layer_idx, min_xy), p)
            {
                LineStatus::ToModel
            } else {
                LineStatus::Invalid
            };

            if status == LineStatus::Invalid {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
            } else {
                current.push((p, status));
            }
        }
        if !current.is_empty() {
            result.push(current);
        }
    }
    result
}

/// Strip classification, keeping only the points.
pub fn convert_internal_to_lines(lines: &LineInformations) -> Polylines {
    lines
        .iter()
        .map(|line| Polyline::from_points(line.iter().map(|(p, _)| *p).collect()))
        .collect()
}

/// Would this classified point still be valid one layer below?
pub fn evaluate_point_for_next_layer(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    current_layer: LayerIndex,
    point: &(Point, LineStatus),
) -> bool {
    if current_layer == 0 {
        return false;
    }
    let min_xy = settings.xy_distance > settings.xy_min_distance;
    let radius = settings.get_radius(0, 0.0);
    let (p, status) = *point;
    let below = current_layer - 1;

    let kind = if status == LineStatus::ToBuildPlateSafe {
        AvoidanceKind::FastSafe
    } else {
        AvoidanceKind::Fast
    };
    if !contains(&volumes.avoidance(radius, below, kind, false, min_xy), p) {
        return true;
    }
    if settings.support_rests_on_model && !status.to_buildplate() {
        return if status == LineStatus::ToModelGracious || status == LineStatus::ToModelGraciousSafe
        {
            let kind = if status == LineStatus::ToModelGraciousSafe {
                AvoidanceKind::FastSafe
            } else {
                AvoidanceKind::Fast
            };
            !contains(&volumes.avoidance(radius, below, kind, true, min_xy), p)
        } else {
            !contains(&volumes.collision(radius, below, min_xy), p)
        };
    }
    false
}

/// Split classified lines into runs that satisfy the predicate and runs
/// that do not, preserving point order.
pub fn split_lines(
    lines: &LineInformations,
    mut evaluate: impl FnMut(&(Point, LineStatus)) -> bool,
) -> (LineInformations, LineInformations) {
    let mut keep = Vec::new();
    let mut set_free = Vec::new();
    for line in lines {
        let mut current_keep = true;
        let mut run: LineInformation = Vec::new();
        for point in line {
            if evaluate(point) != current_keep {
                if !run.is_empty() {
                    if current_keep {
                        keep.push(std::mem::take(&mut run));
                    } else {
                        set_free.push(std::mem::take(&mut run));
                    }
                }
                current_keep = !current_keep;
            }
            run.push(*point);
        }
        if !run.is_empty() {
            if current_keep {
                keep.push(run);
            } else {
                set_free.push(run);
            }
        }
    }
    (keep, set_free)
}

/// Sample the next point at `dist` from `start` along the polyline,
/// beginning at segment `start_idx`.
fn polyline_sample_next_point_at_distance(
    points: &[Point],
    start: Point,
    start_idx: usize,
    dist: f64,
) -> Option<(Point, usize)> {
    let dist2 = dist * dist;
    for i in (start_idx + 1)..points.len() {
        let p1 = points[i];
        if (p1.distance_squared(&start) as f64) >= dist2 {
            let p0 = points[i - 1];
            let v = p1 - p0;
            let l2v = v.dot(&v) as f64;
            if l2v < 1.0 {
                let c = Point::new((p0.x + p1.x) / 2, (p0.y + p1.y) / 2);
                if (c.distance(&start) - dist).abs() < 2.0 {
                    return Some((c, i - 1));
                }
                continue;
            }
            let p0f = start - p0;
            let foot_t = p0f.dot(&v) as f64 / l2v;
            let foot = Point::new(
                p0.x + (v.x as f64 * foot_t) as Coord,
                p0.y + (v.y as f64 * foot_t) as Coord,
            );
            let l2_from_line = (start.distance_squared(&foot)) as f64;
            let l2_intersection = dist2 - l2_from_line;
            if l2_intersection > -1.0 {
                let l2_intersection = l2_intersection.max(0.0);
                let along = foot_t + (l2_intersection / l2v).sqrt();
                if (0.0..=1.0).contains(&along) {
                    let p = Point::new(
                        p0.x + (v.x as f64 * along) as Coord,
                        p0.y + (v.y as f64 * along) as Coord,
                    );
                    return Some((p, i - 1));
                }
            }
        }
    }
    None
}

/// Resample polylines so consecutive points are about `distance` apart,
/// with at least `min_points` per line (the spacing shrinks if needed).
///
/// Closed input lines are rotated so the two mutually most distant
/// vertices become the endpoints: thin closed overhang outlines get
/// their extremes supported first.
pub fn ensure_maximum_distance_polyline(
    input: &Polylines,
    distance: f64,
    min_points: usize,
) -> Polylines {
    let min_distance = scale(0.1) as f64;
    let mut result = Vec::new();

    for part in input {
        if part.is_empty() {
            continue;
        }
        let len = part.length();
        let mut line = Polyline::new();
        let mut current_distance = distance.max(min_distance);

        if len < 2.0 * distance && min_points <= 1 {
            // A short line gets one point in its middle.
            if let Some(mid) = part.point_at_distance(len / 2.0) {
                line.push(mid);
            }
            result.push(line);
            continue;
        }

        let mut points: Vec<Point> = part.points().to_vec();
        let mut optimal_end_index = points.len() - 1;
        if part.is_closed() {
            // Choose the two most distant vertices as endpoints.
            let mut optimal_start_index = 0;
            let mut max_dist2: i128 = 0;
            for idx in 0..points.len() - 1 {
                for inner in 0..points.len() - 1 {
                    let d2 = points[idx].distance_squared(&points[inner]);
                    if d2 > max_dist2 {
                        max_dist2 = d2;
                        optimal_start_index = idx;
                        optimal_end_index = inner;
                    }
                }
            }
            let n = points.len() - 1;
            points.truncate(n);
            points.rotate_left(optimal_start_index);
            points.push(points[0]);
            optimal_end_index = (n + optimal_end_index - optimal_start_index) % n;
        }

        while line.len() < min_points && current_distance >= min_distance {
            line = Polyline::new();
            let mut current_point = points[0];
            line.push(points[0]);
            if min_points > 1 || points[0].distance(&points[optimal_end_index]) > current_distance {
                line.push(points[optimal_end_index]);
            }
            let mut current_index = 0;
            let mut next_distance = current_distance;
            while let Some((candidate, seg_idx)) = polyline_sample_next_point_at_distance(
                &points,
                current_point,
                current_index,
                next_distance,
            ) {
                let min_to_existing = line
                    .points()
                    .iter()
                    .map(|p| p.distance(&candidate))
                    .fold(f64::MAX, f64::min);
                if min_to_existing >= current_distance {
                    line.push(candidate);
                    current_point = candidate;
                    current_index = seg_idx;
                    next_distance = current_distance;
                } else {
                    if current_point == candidate {
                        // Fixpoint; overcompensate so the walk cannot stall.
                        if next_distance > 2.0 * current_distance {
                            break;
                        }
                        next_distance += current_distance;
                        continue;
                    }
                    next_distance = (current_distance - min_to_existing).max(min_distance);
                    current_point = candidate;
                    current_index = seg_idx;
                }
            }
            current_distance *= 0.9;
        }
        result.push(line);
    }
    result
}

struct TipContext<'a> {
    settings: &'a TreeSupportSettings,
    volumes: &'a dyn VolumeOracle,
    infill: &'a dyn InfillOracle,
    diag: &'a DiagnosticsContext,
    base_circle: Polygon,
    min_xy: bool,
    force_tip_to_roof: bool,
    move_bounds: Mutex<Vec<SupportElements>>,
    roof_storage: Mutex<Vec<Polygons>>,
    already_inserted: Mutex<Vec<HashSet<(Coord, Coord)>>>,
}

impl TipContext<'_> {
    fn fill_lines(&self, area: &Polygons, roof: bool, layer_idx: LayerIndex) -> Polylines {
        let spacing = if roof {
            self.settings.support_roof_line_distance
        } else {
            self.settings.support_tree_branch_distance
        };
        let lines = self
            .infill
            .fill(area, FillPattern::Lines, spacing, 0.0, layer_idx);
        if lines.is_empty() && !area.is_empty() {
            // Pattern produced nothing (narrow area); fall back to the
            // outline itself so the tip is not silently lost.
            crate::infill::outline_fallback(area)
        } else {
            lines
        }
    }

    fn add_point_as_influence_area(
        &self,
        point: (Point, LineStatus),
        insert_layer: LayerIndex,
        dont_move_until: u32,
        roof: bool,
        skip_ovalisation: bool,
    ) {
        let (p, status) = point;
        let to_bp = status.to_buildplate();
        if !self.settings.support_rests_on_model && !to_bp {
            tracing::warn!(layer = insert_layer, point = %p, "tried to add an invalid support point");
            self.diag.report_critical();
            self.diag.count_dropped_tip();
            return;
        }

        let mut circle = self.base_circle.clone();
        circle.translate(p);

        let cell = (self.settings.min_radius + 1) / 10;
        let hash_pos = (p.x / cell.max(1), p.y / cell.max(1));

        let mut inserted = self.already_inserted.lock().unwrap();
        if !inserted[insert_layer].insert(hash_pos) {
            return;
        }
        drop(inserted);

        let mut state = SupportElementState::new_tip(insert_layer, p, status);
        state.dont_move_until = dont_move_until;
        state.supports_roof = roof;
        state.use_min_xy_dist = self.min_xy;
        state.missing_roof_layers = if self.force_tip_to_roof {
            dont_move_until
        } else {
            0
        };
        state.skip_ovalisation = skip_ovalisation;

        let mut move_bounds = self.move_bounds.lock().unwrap();
        move_bounds[insert_layer].push(SupportElement::new(state, Vec::new(), vec![circle]));
    }

    fn add_roof_polygons(&self, polygons: Polygons, layer_idx: LayerIndex) {
        if polygons.is_empty() {
            return;
        }
        let mut storage = self.roof_storage.lock().unwrap();
        storage[layer_idx].extend(polygons);
    }

    /// Turn classified lines into tips, first trying to carry them a few
    /// layers upward as roof circles.
    fn add_lines_as_influence_areas(
        &self,
        mut lines: LineInformations,
        roof_tip_layers: usize,
        insert_layer_idx: LayerIndex,
        supports_roof: bool,
        dont_move_until: usize,
    ) {
        // Carry tips upward as small roof circles while they stay valid.
        let mut dtt_roof_tip = 0usize;
        while dtt_roof_tip < roof_tip_layers && insert_layer_idx >= dtt_roof_tip + 1 {
            let (keep, set_free) = split_lines(&lines, |p| {
                evaluate_point_for_next_layer(
                    self.volumes,
                    self.settings,
                    insert_layer_idx - dtt_roof_tip,
                    p,
                )
            });
            // Points that become invalid one layer down are inserted here.
            for line in &set_free {
                for &point in line {
                    self.add_point_as_influence_area(
                        point,
                        insert_layer_idx - dtt_roof_tip,
                        (roof_tip_layers - dtt_roof_tip) as u32,
                        dtt_roof_tip != 0,
                        false,
                    );
                }
            }
            lines = keep;
            let mut added_roofs: Polygons = Vec::new();
            for line in &lines {
                for (p, _) in line {
                    let mut circle = make_circle(self.settings.min_radius, TREE_CIRCLE_RESOLUTION);
                    circle.translate(*p);
                    added_roofs.push(circle);
                }
            }
            self.add_roof_polygons(
                clipper::union_(&added_roofs),
                insert_layer_idx - dtt_roof_tip,
            );
            dtt_roof_tip += 1;
        }

        for line in &lines {
            // A long run of tips reads as a simulated support pattern, not
            // a lone tip; ovalisation would degrade those lines.
            let disable_ovalisation = self.settings.min_radius
                < 3 * self.settings.support_line_width
                && roof_tip_layers == 0
                && dtt_roof_tip == 0
                && line.len() > 5;
            for &point in line {
                self.add_point_as_influence_area(
                    point,
                    insert_layer_idx - dtt_roof_tip,
                    dont_move_until.saturating_sub(dtt_roof_tip) as u32,
                    dtt_roof_tip != 0 || supports_roof,
                    disable_ovalisation,
                );
            }
        }
    }
}

/// Place tips for every overhang layer.
pub fn generate_initial_areas(
    settings: &TreeSupportSettings,
    volumes: &dyn VolumeOracle,
    infill: &dyn InfillOracle,
    overhangs: &[Polygons],
    diag: &DiagnosticsContext,
    cancel: &CancelToken,
) -> TreeSupportResult<TipPlacement> {
    let num_layers = volumes.layer_count();
    let z_distance_delta = settings.z_distance_top_layers + 1;
    if num_layers <= z_distance_delta {
        return Ok(TipPlacement {
            move_bounds: vec![Vec::new(); num_layers],
            roof_storage: vec![Vec::new(); num_layers],
        });
    }

    let min_xy = settings.xy_distance > settings.xy_min_distance;
    let connect_length = settings.support_line_width as f64 * 100.0 / settings.support_tree_top_rate
        + (2 * settings.min_radius - settings.support_line_width).max(0) as f64;
    let roof_enabled = settings.support_roof_layers != 0;
    let force_tip_to_roof = roof_enabled
        && (settings.min_radius as f64 / crate::SCALING_FACTOR).powi(2) * std::f64::consts::PI
            > settings.minimum_roof_area;
    // How far below the overhang a lagging tip may still be inserted.
    let max_overhang_speed = settings.maximum_move_distance.max(1);
    let max_overhang_insert_lag = if settings.z_distance_top_layers > 0 {
        ((settings.xy_distance + max_overhang_speed / 2 - 1) / (max_overhang_speed / 2).max(1))
            .max(2 * settings.z_distance_top_layers as Coord) as usize
    } else {
        0
    };

    let ctx = TipContext {
        settings,
        volumes,
        infill,
        diag,
        base_circle: make_circle(BASE_RADIUS, TREE_CIRCLE_RESOLUTION),
        min_xy,
        force_tip_to_roof,
        move_bounds: Mutex::new(vec![Vec::new(); num_layers]),
        roof_storage: Mutex::new(vec![Vec::new(); num_layers]),
        already_inserted: Mutex::new(vec![HashSet::new(); num_layers]),
    };

    let top = (num_layers - z_distance_delta).min(overhangs.len().saturating_sub(z_distance_delta));
    (1..top)
        .into_par_iter()
        .try_for_each(|layer_idx| -> TreeSupportResult<()> {
            cancel.check()?;
            let overhang_raw = &overhangs[layer_idx + z_distance_delta];
            if overhang_raw.is_empty() {
                return Ok(());
            }

            // The least restrictive forbidden area a tip must clear,
            // slightly dilated so points exactly on its edge stay out.
            let relevant_forbidden_raw = if settings.support_rests_on_model {
                volumes.collision(settings.min_radius, layer_idx, min_xy)
            } else {
                volumes.avoidance(settings.min_radius, layer_idx, AvoidanceKind::Fast, false, min_xy)
            };
            let relevant_forbidden = clipper::offset(
                &clipper::union_(&relevant_forbidden_raw),
                scale(0.005),
                OffsetJoin::Miter,
            );

            let mut overhang_regular = clipper::safe_offset_inc(
                overhang_raw,
                0,
                &relevant_forbidden,
                settings.min_radius * 7 / 4 + settings.xy_min_distance,
                0,
                1,
            );

            // Lag insertion: when the XY distance does not override Z,
            // points blocked on this layer may fit a few layers further
            // down.
            if !min_xy && max_overhang_insert_lag > 0 {
                let remaining_overhang = clipper::intersection(
                    &clipper::diff(
                        overhang_raw,
                        &clipper::offset(
                            &clipper::union_(&overhang_regular),
                            settings.support_line_width / 2,
                            OffsetJoin::Miter,
                        ),
                    ),
                    &relevant_forbidden,
                );
                let mut overhang_lines: LineInformations = {
                    let mut polylines = ensure_maximum_distance_polyline(
                        &ctx.fill_lines(&remaining_overhang, false, layer_idx),
                        settings.min_radius as f64,
                        1,
                    );
                    if polylines.iter().map(|l| l.len()).sum::<usize>() <= 3 {
                        polylines = ensure_maximum_distance_polyline(
                            &to_polylines(&remaining_overhang),
                            connect_length,
                            3,
                        );
                    }
                    polylines
                        .iter()
                        .map(|line| {
                            line.points()
                                .iter()
                                .map(|&p| (p, LineStatus::Invalid))
                                .collect()
                        })
                        .collect()
                };
                let mut lag_ctr = 1usize;
                while lag_ctr <= max_overhang_insert_lag
                    && !overhang_lines.is_empty()
                    && layer_idx > lag_ctr
                {
                    let relevant_forbidden_below = if settings.support_rests_on_model {
                        volumes.collision(settings.min_radius, layer_idx - lag_ctr, min_xy)
                    } else {
                        volumes.avoidance(
                            settings.min_radius,
                            layer_idx - lag_ctr,
                            AvoidanceKind::Fast,
                            false,
                            min_xy,
                        )
                    };
                    let (still_invalid, now_valid) = split_lines(&overhang_lines, |(p, _)| {
                        contains(&relevant_forbidden_below, *p)
                    });
                    overhang_lines = still_invalid;
                    if !now_valid.is_empty() {
                        let fresh = convert_lines_to_internal(
                            volumes,
                            settings,
                            &convert_internal_to_lines(&now_valid),
                            layer_idx - lag_ctr,
                        );
                        ctx.add_lines_as_influence_areas(
                            fresh,
                            if force_tip_to_roof && lag_ctr <= settings.support_roof_layers {
                                settings.support_roof_layers
                            } else {
                                0
                            },
                            layer_idx - lag_ctr,
                            false,
                            if roof_enabled {
                                settings.support_roof_layers
                            } else {
                                0
                            },
                        );
                    }
                    lag_ctr += 1;
                }
            }

            cancel.check()?;

            // Split the overhang into roof-backed parts and regular parts.
            let mut overhang_processing: Vec<(Polygons, bool)> = Vec::new();
            if roof_enabled {
                let mut overhang_roofs = clipper::safe_offset_inc(
                    overhang_raw,
                    0,
                    &relevant_forbidden,
                    settings.min_radius * 2 + settings.xy_min_distance,
                    0,
                    1,
                );
                overhang_roofs = clipper::remove_small(
                    overhang_roofs,
                    settings.minimum_roof_area * crate::SCALING_FACTOR * crate::SCALING_FACTOR,
                );
                overhang_regular = clipper::diff(&overhang_regular, &overhang_roofs);
                for roof_part in overhang_roofs {
                    overhang_processing.push((vec![roof_part], true));
                }
            }
            overhang_regular = clipper::remove_small(
                overhang_regular,
                settings.minimum_support_area * crate::SCALING_FACTOR * crate::SCALING_FACTOR,
            );
            for part in clipper::union_(&overhang_regular) {
                overhang_processing.push((vec![part], false));
            }
            if overhang_processing.is_empty() {
                // The whole overhang lies inside the forbidden area, e.g.
                // hanging over an undercut with support restricted to the
                // build plate. Nothing can hold it up.
                tracing::warn!(
                    layer = layer_idx + z_distance_delta,
                    "overhang cannot be reached by any support; it will not be supported"
                );
                diag.report_critical();
                diag.count_dropped_tip();
                return Ok(());
            }

            for (mut overhang_outset, roof_allowed) in overhang_processing {
                let min_support_points = ((total_length(&overhang_outset) / connect_length)
                    as usize)
                    .clamp(1, 3);
                let mut overhang_lines: LineInformations = Vec::new();
                let mut last_overhang = overhang_outset.clone();
                let mut dtt_roof = 0usize;
                let mut added_roofs: Vec<Polygons> =
                    vec![Vec::new(); settings.support_roof_layers.max(1)];

                if roof_allowed {
                    // Walk the roof downward while it stays large enough.
                    while dtt_roof < settings.support_roof_layers && layer_idx > dtt_roof {
                        let forbidden_next_raw = if settings.support_rests_on_model {
                            volumes.collision(
                                settings.min_radius,
                                layer_idx - (dtt_roof + 1),
                                min_xy,
                            )
                        } else {
                            volumes.avoidance(
                                settings.min_radius,
                                layer_idx - (dtt_roof + 1),
                                AvoidanceKind::Fast,
                                false,
                                min_xy,
                            )
                        };
                        let forbidden_next = clipper::offset(
                            &clipper::union_(&forbidden_next_raw),
                            scale(0.005),
                            OffsetJoin::Miter,
                        );
                        let overhang_outset_next =
                            clipper::diff(&overhang_outset, &forbidden_next);
                        if crate::geometry::area(&overhang_outset_next)
                            < settings.minimum_roof_area
                                * crate::SCALING_FACTOR
                                * crate::SCALING_FACTOR
                        {
                            // The roof ends here; sample tips from the last
                            // roof outline.
                            if dtt_roof != 0 {
                                let dtt_before = dtt_roof - 1;
                                let lines = ensure_maximum_distance_polyline(
                                    &ctx.fill_lines(&last_overhang, true, layer_idx - dtt_before),
                                    connect_length,
                                    1,
                                );
                                overhang_lines = convert_lines_to_internal(
                                    volumes,
                                    settings,
                                    &lines,
                                    layer_idx - dtt_before,
                                );
                                overhang_lines = split_lines(&overhang_lines, |p| {
                                    evaluate_point_for_next_layer(
                                        volumes,
                                        settings,
                                        layer_idx - dtt_before,
                                        p,
                                    )
                                })
                                .0;
                            }
                            break;
                        }
                        added_roofs[dtt_roof] = overhang_outset.clone();
                        last_overhang = overhang_outset.clone();
                        overhang_outset = overhang_outset_next;
                        dtt_roof += 1;
                    }
                }

                for (idx, roof) in added_roofs.iter().enumerate().take(dtt_roof) {
                    ctx.add_roof_polygons(roof.clone(), layer_idx - idx);
                }

                if overhang_lines.is_empty() {
                    let layer_generation_dtt = dtt_roof.max(1) - 1;
                    let mut polylines = ensure_maximum_distance_polyline(
                        &ctx.fill_lines(
                            &overhang_outset,
                            dtt_roof != 0,
                            layer_idx - layer_generation_dtt,
                        ),
                        if dtt_roof == 0 {
                            (settings.min_radius / 2) as f64
                        } else {
                            connect_length
                        },
                        1,
                    );
                    let point_count: usize = polylines.iter().map(|l| l.len()).sum();
                    if point_count <= min_support_points {
                        // Too few samples to trust the pattern: support the
                        // outer wall of the overhang instead.
                        polylines = ensure_maximum_distance_polyline(
                            &to_polylines(&overhang_outset),
                            connect_length,
                            min_support_points,
                        );
                    }
                    if polylines.iter().all(|l| l.is_empty()) {
                        diag.count_dropped_tip();
                        continue;
                    }
                    let last_insert_layer = layer_idx - dtt_roof;
                    overhang_lines =
                        convert_lines_to_internal(volumes, settings, &polylines, last_insert_layer);
                    if overhang_lines.is_empty() {
                        // Every sampled point sits inside all forbidden
                        // zones; there is nothing this overhang part can
                        // be supported by.
                        tracing::warn!(
                            layer = layer_idx,
                            "overhang part has no valid support position; dropping its tips"
                        );
                        diag.report_critical();
                        diag.count_dropped_tip();
                        continue;
                    }
                }

                if dtt_roof >= layer_idx && roof_allowed && !overhang_outset.is_empty() {
                    // The roof walked all the way to the build plate.
                    ctx.add_roof_polygons(overhang_outset, 0);
                } else {
                    ctx.add_lines_as_influence_areas(
                        overhang_lines,
                        if force_tip_to_roof {
                            settings.support_roof_layers - dtt_roof
                        } else {
                            0
                        },
                        layer_idx - dtt_roof,
                        dtt_roof > 0,
                        if roof_enabled {
                            settings.support_roof_layers - dtt_roof
                        } else {
                            0
                        },
                    );
                }
            }
            cancel.check()
        })?;

    Ok(TipPlacement {
        move_bounds: ctx.move_bounds.into_inner().unwrap(),
        roof_storage: ctx.roof_storage.into_inner().unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ExPolygons;
    use crate::infill::SupportLineFiller;
    use crate::support::settings::TreeSupportMeshGroupSettings;
    use crate::volumes::{TreeModelVolumes, VolumeConfig};

    fn settings_with(f: impl FnOnce(&mut TreeSupportMeshGroupSettings)) -> TreeSupportSettings {
        let mut raw = TreeSupportMeshGroupSettings::default();
        f(&mut raw);
        TreeSupportSettings::new(&raw).unwrap()
    }

    /// A pedestal (small column) under a wide plate: classic overhang.
    fn pedestal_scene(layers: usize) -> (Vec<Polygons>, Vec<ExPolygons>) {
        let pedestal = Polygon::rectangle(
            Point::new(-scale(2.0), -scale(2.0)),
            Point::new(scale(2.0), scale(2.0)),
        );
        let plate = Polygon::rectangle(
            Point::new(-scale(10.0), -scale(10.0)),
            Point::new(scale(10.0), scale(10.0)),
        );
        let mut outlines: Vec<Polygons> = Vec::new();
        let mut expoly: Vec<ExPolygons> = Vec::new();
        for i in 0..layers {
            let poly = if i < layers / 2 {
                pedestal.clone()
            } else {
                plate.clone()
            };
            outlines.push(vec![poly.clone()]);
            expoly.push(vec![crate::geometry::ExPolygon::new(poly)]);
        }
        (outlines, expoly)
    }

    fn volumes_from(expoly: &[ExPolygons], settings: &TreeSupportSettings) -> TreeModelVolumes {
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
            expoly,
        )
    }

    #[test]
    fn resampling_keeps_minimum_points() {
        let line = Polyline::from_points(vec![Point::zero(), Point::new(scale(20.0), 0)]);
        let sampled = ensure_maximum_distance_polyline(&vec![line], scale(4.0) as f64, 3);
        assert_eq!(sampled.len(), 1);
        assert!(sampled[0].len() >= 3);
        // Points are spaced at least close to the requested distance.
        let pts = sampled[0].points();
        for i in 0..pts.len() {
            for j in (i + 1)..pts.len() {
                assert!(pts[i].distance(&pts[j]) > scale(1.0) as f64);
            }
        }
    }

    #[test]
    fn resampling_short_line_single_point() {
        let line = Polyline::from_points(vec![Point::zero(), Point::new(scale(1.0), 0)]);
        let sampled = ensure_maximum_distance_polyline(&vec![line], scale(4.0) as f64, 1);
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].len(), 1);
        assert_eq!(sampled[0].points()[0], Point::new(scale(0.5), 0));
    }

    #[test]
    fn closed_line_uses_far_vertices() {
        let mut pts = Polygon::rectangle(Point::zero(), Point::new(scale(10.0), scale(1.0)))
            .into_points();
        pts.push(pts[0]);
        let sampled =
            ensure_maximum_distance_polyline(&vec![Polyline::from_points(pts)], scale(3.0) as f64, 3);
        let line = &sampled[0];
        assert!(line.len() >= 2);
        // The two endpoints should be nearly the rectangle diagonal apart.
        let d = line.points()[0].distance(&line.points()[1]);
        assert!(d >= scale(9.0) as f64, "endpoints too close: {d}");
    }

    #[test]
    fn line_information_round_trip() {
        let lines: LineInformations = vec![vec![
            (Point::new(1, 2), LineStatus::ToBuildPlate),
            (Point::new(3, 4), LineStatus::ToBuildPlateSafe),
        ]];
        let polylines = convert_internal_to_lines(&lines);
        assert_eq!(polylines[0].points(), &[Point::new(1, 2), Point::new(3, 4)]);
    }

    #[test]
    fn split_lines_partitions_runs() {
        let lines: LineInformations = vec![(0..10)
            .map(|i| (Point::new(i, 0), LineStatus::ToBuildPlate))
            .collect()];
        let (keep, free) = split_lines(&lines, |(p, _)| p.x % 4 != 3);
        let kept: usize = keep.iter().map(|l| l.len()).sum();
        let freed: usize = free.iter().map(|l| l.len()).sum();
        assert_eq!(kept + freed, 10);
        assert_eq!(freed, 2);
        assert!(free.iter().all(|l| l.iter().all(|(p, _)| p.x % 4 == 3)));
    }

    #[test]
    fn tips_appear_under_overhang() {
        let settings = settings_with(|raw| {
            raw.support_roof_enable = false;
        });
        let (outlines, expoly) = pedestal_scene(12);
        let volumes = volumes_from(&expoly, &settings);
        let input = crate::support::overhang::OverhangInput {
            layer_outlines: &outlines,
            enforcers: &[],
            blockers: &[],
            enforce_layers: 0,
            auto_support: true,
            external_perimeter_width: scale(0.45),
            bridge_filter: None,
        };
        let overhangs =
            crate::support::overhang::generate_overhangs(&settings, &input, &CancelToken::new())
                .unwrap();
        let filler = SupportLineFiller::new();
        let diag = DiagnosticsContext::new();
        let placement = generate_initial_areas(
            &settings,
            &volumes,
            &filler,
            &overhangs,
            &diag,
            &CancelToken::new(),
        )
        .unwrap();

        let total: usize = placement.move_bounds.iter().map(|l| l.len()).sum();
        assert!(total >= 4, "expected several tips, got {total}");
        // Tips are inserted z_distance_top_layers + 1 below the overhang.
        let overhang_layer = (0..overhangs.len())
            .find(|&i| !overhangs[i].is_empty())
            .unwrap();
        let insert_layer = overhang_layer - settings.z_distance_top_layers - 1;
        assert!(!placement.move_bounds[insert_layer].is_empty());
        for element in &placement.move_bounds[insert_layer] {
            assert_eq!(element.state.distance_to_top, 0);
            assert!(element.state.to_buildplate);
            assert!(!element.influence_area.is_empty());
        }
    }

    #[test]
    fn roof_layers_are_emitted_for_large_overhangs() {
        let settings = settings_with(|raw| {
            raw.support_roof_enable = true;
            raw.minimum_roof_area = 1.0;
        });
        let (outlines, expoly) = pedestal_scene(12);
        let volumes = volumes_from(&expoly, &settings);
        let input = crate::support::overhang::OverhangInput {
            layer_outlines: &outlines,
            enforcers: &[],
            blockers: &[],
            enforce_layers: 0,
            auto_support: true,
            external_perimeter_width: scale(0.45),
            bridge_filter: None,
        };
        let overhangs =
            crate::support::overhang::generate_overhangs(&settings, &input, &CancelToken::new())
                .unwrap();
        let filler = SupportLineFiller::new();
        let diag = DiagnosticsContext::new();
        let placement = generate_initial_areas(
            &settings,
            &volumes,
            &filler,
            &overhangs,
            &diag,
            &CancelToken::new(),
        )
        .unwrap();
        let roof_area: f64 = placement
            .roof_storage
            .iter()
            .map(|l| crate::geometry::area(l))
            .sum();
        assert!(roof_area > crate::TINY_AREA_THRESHOLD);
    }

    #[test]
    fn duplicate_points_are_deduplicated() {
        let settings = settings_with(|raw| {
            raw.support_roof_enable = false;
        });
        let (_, expoly) = pedestal_scene(12);
        let volumes = volumes_from(&expoly, &settings);
        let diag = DiagnosticsContext::new();
        let filler = SupportLineFiller::new();
        let ctx = TipContext {
            settings: &settings,
            volumes: &volumes,
            infill: &filler,
            diag: &diag,
            base_circle: make_circle(BASE_RADIUS, TREE_CIRCLE_RESOLUTION),
            min_xy: true,
            force_tip_to_roof: false,
            move_bounds: Mutex::new(vec![Vec::new(); 12]),
            roof_storage: Mutex::new(vec![Vec::new(); 12]),
            already_inserted: Mutex::new(vec![HashSet::new(); 12]),
        };
        let p = (Point::new(scale(8.0), scale(8.0)), LineStatus::ToBuildPlate);
        ctx.add_point_as_influence_area(p, 3, 0, false, false);
        ctx.add_point_as_influence_area(p, 3, 0, false, false);
        assert_eq!(ctx.move_bounds.lock().unwrap()[3].len(), 1);
    }
}
