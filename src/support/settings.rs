//! Tree support configuration: raw user-facing settings and the derived
//! values the pipeline actually runs on.

use crate::error::{TreeSupportError, TreeSupportResult};
use crate::{scale, unscale, Coord, CoordF, LayerIndex};
use serde::{Deserialize, Serialize};

/// Rendering style of the generated trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TreeSupportStyle {
    /// Per-layer ovalised polygons.
    #[default]
    Classic,
    /// A smoothed 3D tube mesh, re-sliced per layer.
    Organic,
}

/// How overlapping interface and base areas are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterfacePreference {
    /// Interface areas win; base is subtracted under roofs.
    #[default]
    InterfaceAreaOverwritesSupport,
    /// Base areas win; roofs are subtracted where branches run.
    SupportAreaOverwritesInterface,
    /// Reserved, not implemented.
    InterfaceLinesOverwriteSupport,
    /// Reserved, not implemented.
    SupportLinesOverwriteInterface,
    /// Keep both channels untouched.
    Nothing,
}

/// Raw per-run settings, in the units a user would configure them.
///
/// Everything the pipeline consumes is derived from this once, up front,
/// into [`TreeSupportSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSupportMeshGroupSettings {
    /// Layer height (mm).
    pub layer_height: CoordF,
    /// Height of the first layer (mm).
    pub first_layer_height: CoordF,
    /// Polygon simplification resolution (mm).
    pub resolution: CoordF,
    /// Smallest feature the printer can produce (mm).
    pub min_feature_size: CoordF,
    /// Overhang threshold angle from vertical (degrees). None selects the
    /// automatic half-perimeter-width rule.
    pub support_angle: Option<CoordF>,
    /// Support line width (mm).
    pub support_line_width: CoordF,
    /// Interface (roof) line width (mm).
    pub support_roof_line_width: CoordF,
    /// XY clearance between support and model (mm).
    pub support_xy_distance: CoordF,
    /// Tighter XY clearance when Z clearance takes priority (mm).
    pub support_xy_distance_overhang: CoordF,
    /// Z clearance above the model (mm).
    pub support_top_distance: CoordF,
    /// Z clearance below the model (mm).
    pub support_bottom_distance: CoordF,
    /// Vertical sampling stride for bottom interfaces (mm).
    pub support_interface_skip_height: CoordF,
    /// Whether dense roofs are generated.
    pub support_roof_enable: bool,
    /// Total roof thickness (mm).
    pub support_roof_height: CoordF,
    /// Whether dense floors are generated.
    pub support_bottom_enable: bool,
    /// Total floor thickness (mm).
    pub support_bottom_height: CoordF,
    /// Outward offset applied to floors before sampling (mm).
    pub support_bottom_offset: CoordF,
    /// Whether branches may rest on the model.
    pub support_rests_on_model: bool,
    /// Smallest overhang area that gets support (mm²).
    pub minimum_support_area: CoordF,
    /// Smallest area that gets a roof (mm²).
    pub minimum_roof_area: CoordF,
    /// Distance between support infill lines (mm).
    pub support_tree_branch_distance: CoordF,
    /// Distance between roof interface lines (mm).
    pub support_roof_line_distance: CoordF,
    /// Branch slope from vertical for fast moves (degrees).
    pub support_tree_angle: CoordF,
    /// Branch slope for slow (careful) moves (degrees).
    pub support_tree_angle_slow: CoordF,
    /// Nominal branch diameter (mm).
    pub support_tree_branch_diameter: CoordF,
    /// Diameter growth angle downward from the tip (degrees).
    pub support_tree_branch_diameter_angle: CoordF,
    /// Branch diameter where it meets the build plate (mm).
    pub support_tree_bp_diameter: CoordF,
    /// Tip diameter (mm).
    pub support_tree_tip_diameter: CoordF,
    /// Percentage controlling tip density along overhang contours.
    pub support_tree_top_rate: CoordF,
    /// Cap on radius gained by merging to-plate into to-model branches
    /// (mm, diameter-like units as configured).
    pub support_tree_max_diameter_increase_by_merges: CoordF,
    /// Minimum branch height before it may rest on the model (mm).
    pub support_tree_min_height_to_model: CoordF,
    /// Dilation applied around support enforcers (mm). Defaults to the
    /// tip diameter.
    pub enforcer_overhang_offset: Option<CoordF>,
    /// How interface and base areas are reconciled.
    pub interface_preference: InterfacePreference,
    /// Rendering style.
    pub style: TreeSupportStyle,
}

impl Default for TreeSupportMeshGroupSettings {
    fn default() -> Self {
        Self {
            layer_height: 0.2,
            first_layer_height: 0.2,
            resolution: 0.025,
            min_feature_size: 0.1,
            support_angle: Some(50.0),
            support_line_width: 0.4,
            support_roof_line_width: 0.4,
            support_xy_distance: 0.8,
            support_xy_distance_overhang: 0.4,
            support_top_distance: 0.2,
            support_bottom_distance: 0.2,
            support_interface_skip_height: 0.2,
            support_roof_enable: true,
            support_roof_height: 0.6,
            support_bottom_enable: false,
            support_bottom_height: 0.0,
            support_bottom_offset: 0.0,
            support_rests_on_model: false,
            minimum_support_area: 0.0,
            minimum_roof_area: 1.0,
            support_tree_branch_distance: 1.0,
            support_roof_line_distance: 0.4,
            support_tree_angle: 40.0,
            support_tree_angle_slow: 25.0,
            support_tree_branch_diameter: 2.0,
            support_tree_branch_diameter_angle: 5.0,
            support_tree_bp_diameter: 7.5,
            support_tree_tip_diameter: 0.8,
            support_tree_top_rate: 15.0,
            support_tree_max_diameter_increase_by_merges: 1.0,
            support_tree_min_height_to_model: 0.5,
            enforcer_overhang_offset: None,
            interface_preference: InterfacePreference::default(),
            style: TreeSupportStyle::default(),
        }
    }
}

fn round_up_divide(a: Coord, b: Coord) -> Coord {
    if b <= 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Derived settings the pipeline runs on, all distances in scaled units.
#[derive(Debug, Clone)]
pub struct TreeSupportSettings {
    /// Branch slope for fast moves, radians.
    pub angle: CoordF,
    /// Branch slope for slow moves, radians.
    pub angle_slow: CoordF,
    /// Known print Z per layer (mm). Empty means uniform layer heights.
    pub known_z: Vec<CoordF>,
    pub layer_height: Coord,
    pub first_layer_height: Coord,
    pub support_line_width: Coord,
    pub support_roof_line_width: Coord,
    /// Nominal branch radius.
    pub branch_radius: Coord,
    /// Tip radius.
    pub min_radius: Coord,
    /// Radius where a branch meets the build plate.
    pub bp_radius: Coord,
    /// Layers over which a tip widens to the nominal branch radius.
    pub tip_layers: usize,
    /// Per-layer fractional radius growth below the tip region.
    pub diameter_angle_scale_factor: CoordF,
    /// Per-layer fractional radius growth of the elephant foot.
    pub diameter_scale_bp_radius: CoordF,
    /// Layer below which build-plate branches start widening.
    pub layer_start_bp_radius: LayerIndex,
    /// Fast per-layer movement budget.
    pub maximum_move_distance: Coord,
    /// Slow per-layer movement budget.
    pub maximum_move_distance_slow: Coord,
    pub xy_distance: Coord,
    pub xy_min_distance: Coord,
    pub z_distance_top_layers: usize,
    pub z_distance_bottom_layers: usize,
    /// Cap on `increased_to_model_radius` accepted by merges.
    pub max_to_model_radius_increase: Coord,
    /// Minimum distance-to-top before resting on the model is allowed.
    pub min_dtt_to_model: usize,
    /// Radius up to which the propagator keeps climbing the ladder.
    pub increase_radius_until_radius: Coord,
    /// Distance-to-top equivalent of the above.
    pub increase_radius_until_layer: usize,
    pub support_rests_on_model: bool,
    pub support_roof_layers: usize,
    pub support_bottom_layers: usize,
    pub support_bottom_offset: Coord,
    /// Layer stride when sampling bottom interfaces.
    pub performance_interface_skip_layers: usize,
    pub minimum_support_area: CoordF,
    pub minimum_roof_area: CoordF,
    pub support_tree_branch_distance: Coord,
    pub support_roof_line_distance: Coord,
    pub support_tree_top_rate: CoordF,
    /// Overhang threshold angle, radians. None selects the automatic
    /// half-perimeter-width rule.
    pub support_angle: Option<CoordF>,
    pub enforcer_overhang_offset: Coord,
    pub min_feature_size: Coord,
    pub resolution: Coord,
    pub interface_preference: InterfacePreference,
    pub style: TreeSupportStyle,
}

impl TreeSupportSettings {
    /// Derive runtime settings, validating the configuration.
    pub fn new(raw: &TreeSupportMeshGroupSettings) -> TreeSupportResult<Self> {
        if matches!(
            raw.interface_preference,
            InterfacePreference::InterfaceLinesOverwriteSupport
                | InterfacePreference::SupportLinesOverwriteInterface
        ) {
            return Err(TreeSupportError::InvalidConfig(
                "line-based interface preferences are reserved and not implemented".into(),
            ));
        }
        if raw.layer_height <= 0.0 {
            return Err(TreeSupportError::InvalidConfig(
                "layer height must be positive".into(),
            ));
        }
        if raw.support_tree_tip_diameter <= 0.0
            || raw.support_tree_branch_diameter < raw.support_tree_tip_diameter
        {
            return Err(TreeSupportError::InvalidConfig(
                "branch diameter must be at least the tip diameter".into(),
            ));
        }
        if raw.support_xy_distance_overhang > raw.support_xy_distance {
            return Err(TreeSupportError::InvalidConfig(
                "minimum XY distance must not exceed the regular XY distance".into(),
            ));
        }
        if raw.support_tree_angle_slow > raw.support_tree_angle {
            return Err(TreeSupportError::InvalidConfig(
                "slow branch angle must not exceed the fast branch angle".into(),
            ));
        }

        let angle = raw.support_tree_angle.to_radians();
        let angle_slow = raw.support_tree_angle_slow.to_radians();
        let layer_height = scale(raw.layer_height);
        let branch_radius = scale(raw.support_tree_branch_diameter / 2.0);
        let min_radius = scale(raw.support_tree_tip_diameter / 2.0);
        let bp_radius = scale(raw.support_tree_bp_diameter / 2.0);
        let support_line_width = scale(raw.support_line_width);

        let maximum_move_distance = if angle < std::f64::consts::FRAC_PI_2 {
            scale(raw.layer_height * angle.tan())
        } else {
            Coord::MAX / 4
        };
        let maximum_move_distance_slow = scale(raw.layer_height * angle_slow.tan());

        // Tips widen over enough layers to both step the radius in
        // printable increments and honor the branch slope.
        let tip_layers = (((branch_radius - min_radius) / (support_line_width / 3).max(1))
            .max(branch_radius / layer_height)) as usize;

        let diameter_angle_scale_factor = (raw.support_tree_branch_diameter_angle.to_radians())
            .sin()
            * raw.layer_height
            / (raw.support_tree_branch_diameter / 2.0);
        let diameter_scale_bp_radius = if raw.support_tree_bp_diameter
            > raw.support_tree_branch_diameter
        {
            // Reaches the build-plate diameter over the widening ramp; a
            // gentle fixed fraction per layer keeps the foot printable.
            0.5_f64.to_radians().max(
                raw.layer_height / (raw.support_tree_bp_diameter / 2.0),
            )
        } else {
            0.0
        };

        let foot_growth_per_layer = diameter_scale_bp_radius - diameter_angle_scale_factor;
        let layer_start_bp_radius = if foot_growth_per_layer > 0.0 && bp_radius > branch_radius {
            ((bp_radius - branch_radius) as CoordF
                / (branch_radius as CoordF * foot_growth_per_layer))
                .ceil() as LayerIndex
        } else {
            0
        };

        let increase_radius_until_radius = branch_radius;
        let increase_radius_until_layer = tip_layers;

        let support_roof_layers = if raw.support_roof_enable {
            ((raw.support_roof_height + raw.layer_height / 2.0) / raw.layer_height) as usize
        } else {
            0
        };
        let support_bottom_layers = if raw.support_bottom_enable {
            ((raw.support_bottom_height + raw.layer_height / 2.0) / raw.layer_height) as usize
        } else {
            0
        };

        Ok(Self {
            angle,
            angle_slow,
            known_z: Vec::new(),
            layer_height,
            first_layer_height: scale(raw.first_layer_height),
            support_line_width,
            support_roof_line_width: scale(raw.support_roof_line_width),
            branch_radius,
            min_radius,
            bp_radius,
            tip_layers: tip_layers.max(1),
            diameter_angle_scale_factor,
            diameter_scale_bp_radius,
            layer_start_bp_radius,
            maximum_move_distance,
            maximum_move_distance_slow,
            xy_distance: scale(raw.support_xy_distance),
            xy_min_distance: scale(raw.support_xy_distance_overhang),
            z_distance_top_layers: round_up_divide(
                scale(raw.support_top_distance),
                layer_height,
            ) as usize,
            z_distance_bottom_layers: round_up_divide(
                scale(raw.support_bottom_distance),
                layer_height,
            ) as usize,
            max_to_model_radius_increase: scale(
                raw.support_tree_max_diameter_increase_by_merges / 2.0,
            ),
            min_dtt_to_model: round_up_divide(
                scale(raw.support_tree_min_height_to_model),
                layer_height,
            ) as usize,
            increase_radius_until_radius,
            increase_radius_until_layer,
            support_rests_on_model: raw.support_rests_on_model,
            support_roof_layers,
            support_bottom_layers,
            support_bottom_offset: scale(raw.support_bottom_offset),
            performance_interface_skip_layers: round_up_divide(
                scale(raw.support_interface_skip_height),
                layer_height,
            ) as usize
                + 1,
            minimum_support_area: raw.minimum_support_area,
            minimum_roof_area: raw.minimum_roof_area,
            support_tree_branch_distance: scale(raw.support_tree_branch_distance),
            support_roof_line_distance: scale(raw.support_roof_line_distance),
            support_tree_top_rate: raw.support_tree_top_rate,
            support_angle: raw.support_angle.map(|deg| deg.to_radians()),
            enforcer_overhang_offset: scale(
                raw.enforcer_overhang_offset
                    .unwrap_or(raw.support_tree_tip_diameter),
            ),
            min_feature_size: scale(raw.min_feature_size),
            resolution: scale(raw.resolution),
            interface_preference: raw.interface_preference,
            style: raw.style,
        })
    }

    /// Branch radius at `distance_to_top` layers below the tip, widened by
    /// `elephant_foot_increases`. Monotone non-decreasing in both.
    pub fn get_radius(&self, distance_to_top: usize, elephant_foot_increases: CoordF) -> Coord {
        let base = if distance_to_top <= self.tip_layers {
            self.min_radius
                + ((self.branch_radius - self.min_radius) as CoordF * distance_to_top as CoordF
                    / self.tip_layers as CoordF) as Coord
        } else {
            self.branch_radius
                + (self.branch_radius as CoordF
                    * (distance_to_top - self.tip_layers) as CoordF
                    * self.diameter_angle_scale_factor) as Coord
        };
        base + (self.branch_radius as CoordF
            * elephant_foot_increases
            * (self.diameter_scale_bp_radius - self.diameter_angle_scale_factor).max(0.0))
            as Coord
    }

    /// The radius a build-plate branch should have reached at `layer` for
    /// a stable foot. Zero above the widening ramp.
    pub fn recommended_min_radius(&self, layer: LayerIndex) -> Coord {
        if self.layer_start_bp_radius > layer {
            let widened = (self.layer_start_bp_radius - layer) as CoordF;
            self.branch_radius
                + (self.branch_radius as CoordF * widened * self.diameter_scale_bp_radius) as Coord
        } else {
            0
        }
    }

    /// Print Z of a layer's top surface (mm).
    pub fn layer_z(&self, layer: LayerIndex) -> CoordF {
        if let Some(&z) = self.known_z.get(layer) {
            return z;
        }
        unscale(self.first_layer_height) + layer as CoordF * unscale(self.layer_height)
    }

    /// Record actual per-layer print Z values.
    pub fn set_actual_z(&mut self, known_z: Vec<CoordF>) {
        self.known_z = known_z;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_from_defaults() {
        let raw = TreeSupportMeshGroupSettings::default();
        let settings = TreeSupportSettings::new(&raw).unwrap();
        assert_eq!(settings.min_radius, scale(0.4));
        assert_eq!(settings.branch_radius, scale(1.0));
        assert!(settings.maximum_move_distance > settings.maximum_move_distance_slow);
        assert!(settings.tip_layers >= 1);
        assert_eq!(settings.z_distance_top_layers, 1);
        assert_eq!(settings.support_roof_layers, 3);
        assert_eq!(settings.enforcer_overhang_offset, scale(0.8));
    }

    #[test]
    fn reserved_interface_preferences_rejected() {
        let raw = TreeSupportMeshGroupSettings {
            interface_preference: InterfacePreference::InterfaceLinesOverwriteSupport,
            ..Default::default()
        };
        assert!(matches!(
            TreeSupportSettings::new(&raw),
            Err(TreeSupportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn invalid_distances_rejected() {
        let raw = TreeSupportMeshGroupSettings {
            support_xy_distance: 0.2,
            support_xy_distance_overhang: 0.4,
            ..Default::default()
        };
        assert!(TreeSupportSettings::new(&raw).is_err());
    }

    #[test]
    fn radius_is_monotone() {
        let settings =
            TreeSupportSettings::new(&TreeSupportMeshGroupSettings::default()).unwrap();
        let mut last = 0;
        for dtt in 0..200 {
            let r = settings.get_radius(dtt, 0.0);
            assert!(r >= last, "radius shrank at dtt {dtt}");
            last = r;
        }
        assert_eq!(settings.get_radius(0, 0.0), settings.min_radius);
        assert_eq!(settings.get_radius(settings.tip_layers, 0.0), settings.branch_radius);
    }

    #[test]
    fn elephant_foot_widens() {
        let raw = TreeSupportMeshGroupSettings::default();
        let settings = TreeSupportSettings::new(&raw).unwrap();
        if settings.diameter_scale_bp_radius > settings.diameter_angle_scale_factor {
            assert!(settings.get_radius(10, 2.0) > settings.get_radius(10, 0.0));
        }
    }

    #[test]
    fn recommended_min_radius_ramp() {
        let settings =
            TreeSupportSettings::new(&TreeSupportMeshGroupSettings::default()).unwrap();
        if settings.layer_start_bp_radius > 2 {
            let low = settings.recommended_min_radius(0);
            let high = settings.recommended_min_radius(settings.layer_start_bp_radius - 1);
            assert!(low > high);
            assert_eq!(settings.recommended_min_radius(settings.layer_start_bp_radius), 0);
        }
    }

    #[test]
    fn layer_z_uniform_and_known() {
        let mut settings =
            TreeSupportSettings::new(&TreeSupportMeshGroupSettings::default()).unwrap();
        assert!((settings.layer_z(0) - 0.2).abs() < 1e-9);
        assert!((settings.layer_z(4) - 1.0).abs() < 1e-9);
        settings.set_actual_z(vec![0.3, 0.5]);
        assert!((settings.layer_z(1) - 0.5).abs() < 1e-9);
        // Past the table, falls back to the uniform estimate.
        assert!((settings.layer_z(9) - 2.0).abs() < 1e-9);
    }
}
