//! End-to-end tree support pipeline scenarios.
//!
//! Each test builds a small sliced object, runs the full pipeline (or
//! the relevant stages) and checks the structural expectations: where
//! tips appear, that branches merge, that unreachable branches are
//! culled, and that cancellation unwinds without output.

use canopy::error::{CancelToken, DiagnosticsContext, TreeSupportError};
use canopy::geometry::{area, ExPolygon, ExPolygons, Point, Polygon, Polygons};
use canopy::infill::SupportLineFiller;
use canopy::scale;
use canopy::support::overhang::{generate_overhangs, OverhangInput};
use canopy::support::propagate::create_layer_pathing;
use canopy::support::resolve::create_nodes_from_area;
use canopy::support::tips::generate_initial_areas;
use canopy::support::{
    element, TreeSupportGenerator, TreeSupportMeshGroupSettings, TreeSupportSettings,
    TreeSupportStyle,
};
use canopy::volumes::{TreeModelVolumes, VolumeConfig, VolumeOracle};

fn square(cx: f64, cy: f64, half: f64) -> Polygon {
    Polygon::rectangle(
        Point::new(scale(cx - half), scale(cy - half)),
        Point::new(scale(cx + half), scale(cy + half)),
    )
}

fn settings_with(f: impl FnOnce(&mut TreeSupportMeshGroupSettings)) -> TreeSupportSettings {
    let mut raw = TreeSupportMeshGroupSettings::default();
    raw.support_roof_enable = false;
    // Coarser tips keep the scenario element counts small.
    raw.support_tree_branch_distance = 3.0;
    raw.support_tree_tip_diameter = 1.6;
    f(&mut raw);
    TreeSupportSettings::new(&raw).unwrap()
}

fn volumes_for(outlines: &[ExPolygons], settings: &TreeSupportSettings) -> TreeModelVolumes {
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
        outlines,
    )
}

fn overhangs_for(
    outlines_rings: &[Polygons],
    settings: &TreeSupportSettings,
) -> Vec<Polygons> {
    let input = OverhangInput {
        layer_outlines: outlines_rings,
        enforcers: &[],
        blockers: &[],
        enforce_layers: 0,
        auto_support: true,
        external_perimeter_width: scale(0.45),
        bridge_filter: None,
    };
    generate_overhangs(settings, &input, &CancelToken::new()).unwrap()
}

fn to_rings(outlines: &[ExPolygons]) -> Vec<Polygons> {
    outlines
        .iter()
        .map(|layer| {
            layer
                .iter()
                .flat_map(|ex| ex.to_polygons())
                .collect::<Polygons>()
        })
        .collect()
}

/// Cube on a pedestal: wide plate overhanging a narrow column.
fn pedestal_scene(
    pedestal_half: f64,
    plate_half: f64,
    pedestal_layers: usize,
    total_layers: usize,
) -> Vec<ExPolygons> {
    (0..total_layers)
        .map(|i| {
            let poly = if i < pedestal_layers {
                square(0.0, 0.0, pedestal_half)
            } else {
                square(0.0, 0.0, plate_half)
            };
            vec![ExPolygon::new(poly)]
        })
        .collect()
}

#[test]
fn single_column_tip_scenario() {
    // A 10x10 mm plate on a 2x2 mm pedestal; overhang appears where the
    // plate starts.
    let settings = settings_with(|_| {});
    let outlines = pedestal_scene(1.0, 5.0, 10, 20);
    let rings = to_rings(&outlines);
    let volumes = volumes_for(&outlines, &settings);
    let overhangs = overhangs_for(&rings, &settings);

    let overhang_layer = (0..overhangs.len())
        .find(|&i| !overhangs[i].is_empty())
        .expect("the plate must overhang");
    assert_eq!(overhang_layer, 10);

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
    let mut move_bounds = placement.move_bounds;

    // Several tips under the overhang, all targeting the build plate.
    let insert_layer = overhang_layer - settings.z_distance_top_layers - 1;
    let tip_count = move_bounds[insert_layer].len();
    assert!(tip_count >= 4, "expected at least 4 tips, got {tip_count}");
    for elem in &move_bounds[insert_layer] {
        assert!(elem.state.to_buildplate);
        assert!(elem.state.can_use_safe_radius);
        assert_eq!(elem.state.distance_to_top, 0);
    }

    create_layer_pathing(
        &volumes,
        &settings,
        &mut move_bounds,
        &diag,
        &CancelToken::new(),
    )
    .unwrap();

    // Merging reduced the element count on the way down.
    assert!(!move_bounds[0].is_empty());
    assert!(
        move_bounds[0].len() < tip_count,
        "no merging happened: {} tips, {} trunks",
        tip_count,
        move_bounds[0].len()
    );

    create_nodes_from_area(
        &volumes,
        &settings,
        &mut move_bounds,
        &diag,
        &CancelToken::new(),
    )
    .unwrap();

    // Every surviving element is placed, and the branch slope invariant
    // holds: the outer wall never moves faster than radius growth plus
    // twice the slow distance.
    for layer in 0..move_bounds.len().saturating_sub(1) {
        for elem in &move_bounds[layer] {
            let own = elem.state.result_on_layer.expect("unplaced element");
            let own_radius = element::get_radius(&settings, &elem.state);
            for &parent_idx in &elem.parents {
                let parent = &move_bounds[layer + 1][parent_idx as usize];
                let parent_pos = parent.state.result_on_layer.expect("unplaced parent");
                let parent_radius = element::get_radius(&settings, &parent.state);
                let shift = own.distance(&parent_pos);
                let allowed = (own_radius - parent_radius).max(0) as f64
                    + 2.0 * settings.maximum_move_distance_slow as f64
                    + scale(0.1) as f64;
                assert!(
                    shift < allowed,
                    "outer wall jump on layer {layer}: {shift} > {allowed}"
                );
            }
        }
    }
}

#[test]
fn two_columns_merge_scenario() {
    // Two tips on a bridge 4 mm apart must join into one trunk well
    // before the plate, and the merged radius stays bounded.
    let settings = settings_with(|_| {});
    let layers = 30usize;
    let outlines: Vec<ExPolygons> = (0..layers)
        .map(|i| {
            if i >= 28 {
                vec![ExPolygon::new(square(0.0, 0.0, 5.0))]
            } else {
                vec![
                    ExPolygon::new(square(-2.0, -4.0, 1.0)),
                    ExPolygon::new(square(2.0, -4.0, 1.0)),
                ]
            }
        })
        .collect();
    let rings = to_rings(&outlines);
    let volumes = volumes_for(&outlines, &settings);
    let overhangs = overhangs_for(&rings, &settings);
    assert!(!overhangs[28].is_empty());

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
    let mut move_bounds = placement.move_bounds;
    let tip_layer = (0..move_bounds.len())
        .rev()
        .find(|&i| !move_bounds[i].is_empty())
        .unwrap();
    assert!(move_bounds[tip_layer].len() >= 2);

    create_layer_pathing(
        &volumes,
        &settings,
        &mut move_bounds,
        &diag,
        &CancelToken::new(),
    )
    .unwrap();

    // A merge recorded multiple parents somewhere.
    let merged = (0..tip_layer)
        .any(|l| move_bounds[l].iter().any(|e| e.parents.len() >= 2));
    assert!(merged, "the two subtrees never merged");

    // Merged radius stays within the configured branch radius plus the
    // elephant-foot allowance.
    let max_allowed = settings.bp_radius + settings.branch_radius;
    for layer in &move_bounds {
        for elem in layer {
            assert!(element::get_radius(&settings, &elem.state) <= max_allowed);
        }
    }
}

#[test]
fn enforced_overhang_scenario() {
    // Auto support off; a user enforcer covers a patch of the overhang.
    // Tips may only appear inside the dilated patch.
    let settings = settings_with(|_| {});
    let outlines = pedestal_scene(1.0, 5.0, 10, 20);
    let rings = to_rings(&outlines);
    let volumes = volumes_for(&outlines, &settings);

    let patch = square(3.5, 3.5, 1.25);
    let mut enforcers: Vec<Polygons> = vec![Vec::new(); 20];
    enforcers[10] = vec![patch.clone()];
    let input = OverhangInput {
        layer_outlines: &rings,
        enforcers: &enforcers,
        blockers: &[],
        enforce_layers: 0,
        auto_support: false,
        external_perimeter_width: scale(0.45),
        bridge_filter: None,
    };
    let overhangs = generate_overhangs(&settings, &input, &CancelToken::new()).unwrap();
    assert!(!overhangs[10].is_empty());
    // Layers without enforcers stay empty in the enforcer-only regime.
    for (i, layer) in overhangs.iter().enumerate() {
        if i != 10 {
            assert!(area(layer) <= canopy::TINY_AREA_THRESHOLD);
        }
    }

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

    let allowed = canopy::clipper::offset(
        &[patch],
        settings.enforcer_overhang_offset + scale(1.0),
        canopy::clipper::OffsetJoin::Round,
    );
    let mut any_tip = false;
    for layer in &placement.move_bounds {
        for elem in layer {
            any_tip = true;
            assert!(
                canopy::geometry::contains(&allowed, elem.state.target_position),
                "tip outside the enforced patch at {}",
                elem.state.target_position
            );
        }
    }
    assert!(any_tip, "enforcer produced no tips");
}

#[test]
fn unreachable_overhang_is_dropped() {
    // An overhang hanging directly over a wide slab. Branches may not
    // rest on the model and cannot reach the plate: nothing is emitted,
    // and the diagnostics record the dropped branches.
    let settings = settings_with(|raw| {
        raw.support_rests_on_model = false;
    });
    let layers = 16usize;
    let slab = square(0.0, 0.0, 8.0);
    let plate = square(0.0, 0.0, 3.0);
    let outlines: Vec<ExPolygons> = (0..layers)
        .map(|i| {
            if i < 8 {
                vec![ExPolygon::new(slab.clone())]
            } else if i >= 14 {
                vec![ExPolygon::new(plate.clone())]
            } else {
                Vec::new()
            }
        })
        .collect();
    let volumes = volumes_for(&outlines, &settings);
    let filler = SupportLineFiller::new();
    let generator = TreeSupportGenerator::new(settings, &volumes, &filler);

    let mut overhangs: Vec<Polygons> = vec![Vec::new(); layers];
    overhangs[14] = vec![plate];
    let output = generator.generate_from_overhangs(&overhangs).unwrap();

    assert!(output.is_empty(), "unreachable overhang produced output");
    assert!(
        generator.diagnostics().dropped_tips() > 0
            || generator.diagnostics().lost_branches() > 0,
        "nothing was recorded about the dropped branches"
    );
}

#[test]
fn organic_smoothing_scenario() {
    // Two adjacent tips on a flat overhang, organic style: the pipeline
    // produces a tube mesh whose slices stay near the object's bounds.
    let settings = settings_with(|raw| {
        raw.style = TreeSupportStyle::Organic;
    });
    let outlines = pedestal_scene(1.0, 5.0, 10, 20);
    let rings = to_rings(&outlines);
    let volumes = volumes_for(&outlines, &settings);
    let overhangs = overhangs_for(&rings, &settings);
    let filler = SupportLineFiller::new();
    let generator = TreeSupportGenerator::new(settings, &volumes, &filler);
    let output = generator.generate_from_overhangs(&overhangs).unwrap();

    let mesh = output.branch_mesh.as_ref().expect("organic mesh missing");
    assert!(!mesh.is_empty());
    // All support stays within the object's horizontal bounds plus 2 mm.
    let bound = scale(5.0 + 2.0);
    for layer in output
        .intermediate_layers
        .iter()
        .chain(output.top_contacts.iter())
        .flatten()
    {
        for ring in &layer.polygons {
            for p in ring.points() {
                assert!(
                    p.x.abs() <= bound && p.y.abs() <= bound,
                    "support outside bounds at {p:?} on layer {}",
                    layer.layer_idx
                );
            }
        }
    }
}

#[test]
fn classic_pipeline_produces_support_under_overhang() {
    let settings = settings_with(|_| {});
    let outlines = pedestal_scene(1.0, 5.0, 10, 20);
    let rings = to_rings(&outlines);
    let volumes = volumes_for(&outlines, &settings);
    let overhangs = overhangs_for(&rings, &settings);
    let filler = SupportLineFiller::new();
    let generator = TreeSupportGenerator::new(settings, &volumes, &filler);
    let output = generator.generate_from_overhangs(&overhangs).unwrap();

    assert!(!output.is_empty(), "no support generated");
    // Support exists on a low layer (the trunk reaches down).
    let low_support = output.intermediate_layers[..4]
        .iter()
        .flatten()
        .map(|l| area(&l.polygons))
        .sum::<f64>();
    assert!(low_support > canopy::TINY_AREA_THRESHOLD);
    // And no support area intersects the model itself (checked against
    // the tightest clearance regime).
    for layer in output.intermediate_layers.iter().flatten() {
        let collision = volumes.collision(0, layer.layer_idx, true);
        let overlap = canopy::clipper::intersection(&layer.polygons, &collision);
        assert!(
            area(&overlap) <= canopy::TINY_AREA_THRESHOLD * 16.0,
            "support intersects the model on layer {}",
            layer.layer_idx
        );
    }
}

#[test]
fn tip_count_scales_with_overhang_area() {
    // A flat overhang of twice the area gets roughly twice the tips.
    let settings = settings_with(|_| {});
    let mut counts = Vec::new();
    for plate_half in [3.0, 4.25] {
        let outlines = pedestal_scene(0.5, plate_half, 10, 16);
        let rings = to_rings(&outlines);
        let volumes = volumes_for(&outlines, &settings);
        let overhangs = overhangs_for(&rings, &settings);
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
        counts.push(
            placement
                .move_bounds
                .iter()
                .map(|l| l.len())
                .sum::<usize>() as f64,
        );
    }
    // Overhang areas are ~35 mm^2 and ~71 mm^2; the ratio of tip counts
    // must land within 50% of the area ratio.
    let ratio = counts[1] / counts[0].max(1.0);
    assert!(
        ratio > 1.0 && ratio < 4.0,
        "tip count does not track area: {counts:?}"
    );
}

#[test]
fn cancellation_after_overhangs_unwinds_cleanly() {
    let settings = settings_with(|_| {});
    let outlines = pedestal_scene(1.0, 5.0, 10, 20);
    let rings = to_rings(&outlines);
    let volumes = volumes_for(&outlines, &settings);
    let overhangs = overhangs_for(&rings, &settings);

    let filler = SupportLineFiller::new();
    let cancel = CancelToken::new();
    cancel.cancel();
    let generator = TreeSupportGenerator::new(settings, &volumes, &filler)
        .with_cancel(cancel);
    match generator.generate_from_overhangs(&overhangs) {
        Err(TreeSupportError::Cancelled) => {}
        other => panic!("expected a clean cancellation, got {other:?}"),
    }
}

#[test]
fn vertical_cylinder_produces_no_elements() {
    let settings = settings_with(|_| {});
    let circle = canopy::geometry::make_circle(scale(5.0), 64);
    let outlines: Vec<ExPolygons> = vec![vec![ExPolygon::new(circle)]; 15];
    let rings = to_rings(&outlines);
    let volumes = volumes_for(&outlines, &settings);
    let overhangs = overhangs_for(&rings, &settings);
    let filler = SupportLineFiller::new();
    let generator = TreeSupportGenerator::new(settings, &volumes, &filler);
    let output = generator.generate_from_overhangs(&overhangs).unwrap();
    assert!(output.is_empty());
}
