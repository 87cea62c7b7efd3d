//! Support elements: the per-influence-area state machine.

use super::settings::TreeSupportSettings;
use crate::geometry::{contains, Point, Polygon, Polygons};
use crate::volumes::AvoidanceKind;
use crate::{Coord, CoordF, LayerIndex};

/// Classification of a sampled tip point by which forbidden zones it
/// escapes. Higher is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LineStatus {
    /// Inside everything; the point cannot support anything.
    #[default]
    Invalid,
    /// Outside collision only: emergency rest on the model.
    ToModel,
    /// Can reach a placeable model surface.
    ToModelGracious,
    /// Can reach a placeable model surface avoiding all holes.
    ToModelGraciousSafe,
    /// Can reach the build plate.
    ToBuildPlate,
    /// Can reach the build plate avoiding all holes.
    ToBuildPlateSafe,
}

impl LineStatus {
    pub fn to_buildplate(self) -> bool {
        matches!(self, LineStatus::ToBuildPlate | LineStatus::ToBuildPlateSafe)
    }

    pub fn gracious(self) -> bool {
        self.to_buildplate()
            || matches!(
                self,
                LineStatus::ToModelGracious | LineStatus::ToModelGraciousSafe
            )
    }

    pub fn safe(self) -> bool {
        matches!(
            self,
            LineStatus::ToBuildPlateSafe | LineStatus::ToModelGraciousSafe
        )
    }
}

/// A point with its tip classification.
pub type LineInformation = Vec<(Point, LineStatus)>;
pub type LineInformations = Vec<LineInformation>;

/// The settings tuple one propagation attempt runs with. The propagator
/// tries an ordered list of these and takes the first that yields a
/// viable influence area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaIncreaseSettings {
    pub kind: AvoidanceKind,
    /// Offset distance this attempt may grow the area by, scaled.
    pub increase_speed: Coord,
    /// Climb the radius ladder this layer.
    pub increase_radius: bool,
    /// False marks the last-resort attempt that is allowed to overshoot
    /// the movement budget; its use is logged.
    pub no_error: bool,
    /// Query the volumes with the tighter XY clearance.
    pub use_min_distance: bool,
    /// Whether the area may move at all.
    pub allow_move: bool,
}

impl Default for AreaIncreaseSettings {
    fn default() -> Self {
        Self {
            kind: AvoidanceKind::Fast,
            increase_speed: 0,
            increase_radius: false,
            no_error: true,
            use_min_distance: false,
            allow_move: false,
        }
    }
}

/// Mutable state of one support element.
#[derive(Debug, Clone)]
pub struct SupportElementState {
    /// Layer this state is valid on.
    pub layer_idx: LayerIndex,
    /// Layer of the tip that spawned this chain.
    pub target_height: LayerIndex,
    /// Position of that tip.
    pub target_position: Point,
    /// Hint for picking `result_on_layer`; updated on merges.
    pub next_position: Point,
    /// The chosen branch center, set late by the node resolver.
    pub result_on_layer: Option<Point>,
    /// Layers below the tip.
    pub distance_to_top: u32,
    /// Distance-to-top equivalent the collision radius is computed from;
    /// lags behind `distance_to_top` when the radius could not grow.
    pub effective_radius_height: u32,
    /// Radius gained by merging a to-plate branch into a to-model branch.
    pub increased_to_model_radius: Coord,
    /// Elephant-foot widening accumulated at the base.
    pub elephant_foot_increases: CoordF,
    /// While `distance_to_top` is below this, the element must keep its
    /// parent's position.
    pub dont_move_until: u32,
    /// Roof layers this tip still owes because it moved instead.
    pub missing_roof_layers: u32,
    /// Settings that produced this element; the starting guess for the
    /// child's attempt order.
    pub last_area_increase: AreaIncreaseSettings,
    /// Subtree must reach the build plate.
    pub to_buildplate: bool,
    /// Subtree ends on a known-placeable surface (or the plate).
    pub to_model_gracious: bool,
    /// Queries use the tighter XY clearance.
    pub use_min_xy_dist: bool,
    /// Participates in a top interface.
    pub supports_roof: bool,
    /// Passed all holes; the loosest avoidance is usable.
    pub can_use_safe_radius: bool,
    /// Rendering hint: draw a plain circle, no ovalisation.
    pub skip_ovalisation: bool,
    /// Scheduled for removal by the resolver's compaction pass.
    pub deleted: bool,
    /// Transient visit flag, meaning varies per pass.
    pub marked: bool,
}

impl SupportElementState {
    /// Fresh tip state at a sampled overhang point.
    pub fn new_tip(layer_idx: LayerIndex, position: Point, status: LineStatus) -> Self {
        Self {
            layer_idx,
            target_height: layer_idx,
            target_position: position,
            next_position: position,
            result_on_layer: Some(position),
            distance_to_top: 0,
            effective_radius_height: 0,
            increased_to_model_radius: 0,
            elephant_foot_increases: 0.0,
            dont_move_until: 0,
            missing_roof_layers: 0,
            last_area_increase: AreaIncreaseSettings::default(),
            to_buildplate: status.to_buildplate(),
            to_model_gracious: status.gracious(),
            use_min_xy_dist: false,
            supports_roof: false,
            can_use_safe_radius: status.safe(),
            skip_ovalisation: false,
            deleted: false,
            marked: false,
        }
    }

    pub fn result_on_layer_is_set(&self) -> bool {
        self.result_on_layer.is_some()
    }

    pub fn result_on_layer_reset(&mut self) {
        self.result_on_layer = None;
    }

    /// State of the would-be child one layer below.
    pub fn propagate_down(&self) -> Self {
        let mut dst = self.clone();
        dst.distance_to_top += 1;
        dst.layer_idx = dst.layer_idx.saturating_sub(1);
        dst.result_on_layer_reset();
        dst.skip_ovalisation = false;
        dst
    }
}

/// One influence area with its state and parent links.
#[derive(Debug, Clone)]
pub struct SupportElement {
    pub state: SupportElementState,
    /// Indices of supported elements one layer above.
    pub parents: Vec<i32>,
    /// Admissible branch center positions on `state.layer_idx`.
    pub influence_area: Polygons,
}

impl SupportElement {
    pub fn new(state: SupportElementState, parents: Vec<i32>, influence_area: Polygons) -> Self {
        Self {
            state,
            parents,
            influence_area,
        }
    }
}

/// Elements of one layer.
pub type SupportElements = Vec<SupportElement>;

/// Radius accessors. Collision radius (used for oracle queries) lags the
/// real radius while the propagator has not caught up the ladder.
pub fn get_radius(settings: &TreeSupportSettings, state: &SupportElementState) -> Coord {
    settings.get_radius(state.distance_to_top as usize, state.elephant_foot_increases)
}

pub fn get_collision_radius(
    settings: &TreeSupportSettings,
    state: &SupportElementState,
) -> Coord {
    settings.get_radius(
        state.effective_radius_height as usize,
        state.elephant_foot_increases,
    )
}

/// Combine the states of two merged influence areas.
pub fn merge_states(
    first: &SupportElementState,
    second: &SupportElementState,
    next_position: Point,
    layer_idx: LayerIndex,
    settings: &TreeSupportSettings,
) -> SupportElementState {
    let mut out = SupportElementState {
        layer_idx,
        next_position,
        use_min_xy_dist: first.use_min_xy_dist || second.use_min_xy_dist,
        supports_roof: first.supports_roof || second.supports_roof,
        dont_move_until: first.dont_move_until.max(second.dont_move_until),
        can_use_safe_radius: first.can_use_safe_radius || second.can_use_safe_radius,
        missing_roof_layers: first.missing_roof_layers.min(second.missing_roof_layers),
        skip_ovalisation: false,
        result_on_layer: None,
        effective_radius_height: first
            .effective_radius_height
            .max(second.effective_radius_height),
        distance_to_top: first.distance_to_top.max(second.distance_to_top),
        to_buildplate: first.to_buildplate && second.to_buildplate,
        // Valid because gracious never merges with non-gracious.
        to_model_gracious: first.to_model_gracious && second.to_model_gracious,
        increased_to_model_radius: first
            .increased_to_model_radius
            .max(second.increased_to_model_radius),
        elephant_foot_increases: 0.0,
        deleted: false,
        marked: false,
        ..if first.target_height > second.target_height {
            first.clone()
        } else {
            second.clone()
        }
    };

    if settings.diameter_scale_bp_radius > 0.0 {
        let foot_increase_radius = (get_collision_radius(settings, first)
            .max(get_collision_radius(settings, second))
            - get_collision_radius(settings, &out))
        .abs();
        // Recomputed rather than maxed: a small tree with a large foot
        // merging into a thick branch must not bump the radius.
        let denom = settings.branch_radius as CoordF
            * (settings.diameter_scale_bp_radius - settings.diameter_angle_scale_factor);
        out.elephant_foot_increases = if denom > 0.0 {
            foot_increase_radius as CoordF / denom
        } else {
            0.0
        };
    }

    out.last_area_increase = AreaIncreaseSettings {
        kind: first.last_area_increase.kind.min(second.last_area_increase.kind),
        increase_speed: first
            .last_area_increase
            .increase_speed
            .min(second.last_area_increase.increase_speed),
        increase_radius: first.last_area_increase.increase_radius
            || second.last_area_increase.increase_radius,
        no_error: first.last_area_increase.no_error || second.last_area_increase.no_error,
        use_min_distance: first.last_area_increase.use_min_distance
            && second.last_area_increase.use_min_distance,
        allow_move: first.last_area_increase.allow_move || second.last_area_increase.allow_move,
    };

    out
}

/// Return `from` if it already lies inside `polygons`, else the closest
/// point on any of their contours.
pub fn move_inside_if_outside(polygons: &[Polygon], from: Point) -> Point {
    if polygons.is_empty() || contains(polygons, from) {
        return from;
    }
    let mut best = from;
    let mut best_dist = i128::MAX;
    for polygon in polygons {
        let pts = polygon.points();
        for i in 0..pts.len() {
            let candidate = crate::geometry::closest_point_on_segment(
                from,
                pts[i],
                pts[(i + 1) % pts.len()],
            );
            let d = from.distance_squared(&candidate);
            if d < best_dist {
                best_dist = d;
                best = candidate;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale;
    use crate::support::settings::TreeSupportMeshGroupSettings;

    fn settings() -> TreeSupportSettings {
        TreeSupportSettings::new(&TreeSupportMeshGroupSettings::default()).unwrap()
    }

    #[test]
    fn line_status_ordering() {
        assert!(LineStatus::ToBuildPlateSafe > LineStatus::ToBuildPlate);
        assert!(LineStatus::ToBuildPlate > LineStatus::ToModelGraciousSafe);
        assert!(LineStatus::ToModelGraciousSafe > LineStatus::ToModelGracious);
        assert!(LineStatus::ToModelGracious > LineStatus::ToModel);
        assert!(LineStatus::ToModel > LineStatus::Invalid);
    }

    #[test]
    fn tip_state_from_status() {
        let tip = SupportElementState::new_tip(7, Point::new(1, 2), LineStatus::ToBuildPlateSafe);
        assert!(tip.to_buildplate);
        assert!(tip.to_model_gracious);
        assert!(tip.can_use_safe_radius);
        assert_eq!(tip.distance_to_top, 0);
        assert!(tip.result_on_layer_is_set());

        let emergency = SupportElementState::new_tip(7, Point::new(1, 2), LineStatus::ToModel);
        assert!(!emergency.to_buildplate);
        assert!(!emergency.to_model_gracious);
        assert!(!emergency.can_use_safe_radius);
    }

    #[test]
    fn propagate_down_advances_the_state() {
        let tip = SupportElementState::new_tip(5, Point::zero(), LineStatus::ToBuildPlate);
        let below = tip.propagate_down();
        assert_eq!(below.layer_idx, 4);
        assert_eq!(below.distance_to_top, 1);
        assert!(!below.result_on_layer_is_set());
    }

    #[test]
    fn collision_radius_lags_real_radius() {
        let settings = settings();
        let mut state = SupportElementState::new_tip(50, Point::zero(), LineStatus::ToBuildPlate);
        state.distance_to_top = 20;
        state.effective_radius_height = 5;
        assert!(get_collision_radius(&settings, &state) < get_radius(&settings, &state));
    }

    #[test]
    fn merge_states_combines_flags() {
        let settings = settings();
        let mut a = SupportElementState::new_tip(9, Point::zero(), LineStatus::ToBuildPlate);
        a.distance_to_top = 4;
        a.dont_move_until = 2;
        let mut b =
            SupportElementState::new_tip(12, Point::new(10, 0), LineStatus::ToModelGraciousSafe);
        b.distance_to_top = 7;
        b.use_min_xy_dist = true;

        let merged = merge_states(&a, &b, Point::new(5, 0), 8, &settings);
        assert_eq!(merged.layer_idx, 8);
        assert_eq!(merged.distance_to_top, 7);
        assert_eq!(merged.dont_move_until, 2);
        assert!(!merged.to_buildplate); // AND
        assert!(merged.to_model_gracious); // AND of gracious flags
        assert!(merged.use_min_xy_dist); // OR
        assert!(merged.can_use_safe_radius); // OR
        assert_eq!(merged.target_height, 12); // higher target wins
        assert_eq!(merged.next_position, Point::new(5, 0));
    }

    #[test]
    fn move_inside_if_outside_behaviour() {
        let square = Polygon::rectangle(
            Point::zero(),
            Point::new(scale(10.0), scale(10.0)),
        );
        let inside = Point::new(scale(5.0), scale(5.0));
        assert_eq!(move_inside_if_outside(&[square.clone()], inside), inside);

        let outside = Point::new(scale(15.0), scale(5.0));
        let moved = move_inside_if_outside(&[square], outside);
        assert_eq!(moved, Point::new(scale(10.0), scale(5.0)));
    }
}
