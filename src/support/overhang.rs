//! Overhang extraction: which regions of each layer need support.

use super::settings::TreeSupportSettings;
use crate::clipper::{self, OffsetJoin};
use crate::error::{CancelToken, TreeSupportResult};
use crate::geometry::Polygons;
use crate::{scale, Coord, LayerIndex};
use rayon::prelude::*;

/// Per-layer inputs of the overhang extractor.
pub struct OverhangInput<'a> {
    /// Flattened object outline rings per layer.
    pub layer_outlines: &'a [Polygons],
    /// User support-enforcer zones per layer (may be shorter than the
    /// layer count).
    pub enforcers: &'a [Polygons],
    /// User support-blocker zones per layer.
    pub blockers: &'a [Polygons],
    /// The first N layers get full support regardless of angle.
    pub enforce_layers: usize,
    /// Whether automatic (angle-driven) support is enabled at all.
    pub auto_support: bool,
    /// Average external perimeter width, scaled; drives the automatic
    /// threshold when no explicit angle is configured.
    pub external_perimeter_width: Coord,
    /// Optional hook that removes bridged regions from a layer's
    /// overhangs before tips are placed on them.
    #[allow(clippy::type_complexity)]
    pub bridge_filter: Option<&'a (dyn Fn(LayerIndex, Polygons) -> Polygons + Sync)>,
}

/// Compute the overhang polygons of every layer.
///
/// `overhangs[i]` is the part of layer `i` that layer `i - 1` does not
/// hold up; layer 0 is always empty. Layers are processed in parallel and
/// cancellation is polled once per layer.
pub fn generate_overhangs(
    settings: &TreeSupportSettings,
    input: &OverhangInput<'_>,
    cancel: &CancelToken,
) -> TreeSupportResult<Vec<Polygons>> {
    let layer_count = input.layer_outlines.len();
    if layer_count == 0 {
        return Ok(Vec::new());
    }

    // The threshold is made inclusive by adding one degree before taking
    // the tangent.
    let tan_threshold = settings
        .support_angle
        .map(|angle| (angle + 1.0_f64.to_radians()).tan());

    let num_overhang_layers = if input.auto_support {
        layer_count
    } else {
        input
            .enforce_layers
            .max(input.enforcers.len())
            .min(layer_count)
    };

    let mut overhangs: Vec<Polygons> = (1..num_overhang_layers)
        .into_par_iter()
        .map(|layer_idx| -> TreeSupportResult<Polygons> {
            cancel.check()?;
            let current = &input.layer_outlines[layer_idx];
            let lower = &input.layer_outlines[layer_idx - 1];
            let enforced_layer = layer_idx < input.enforce_layers;

            let mut raw_overhangs: Option<Polygons> = None;
            let mut overhang: Polygons = Vec::new();

            if input.auto_support || enforced_layer {
                let lower_layer_offset: Coord = if enforced_layer {
                    0
                } else if let Some(tan) = tan_threshold {
                    if tan > 0.0 {
                        (settings.layer_height as f64 / tan) as Coord
                    } else {
                        0
                    }
                } else {
                    input.external_perimeter_width / 2
                };

                overhang = if lower_layer_offset == 0 {
                    let diffed = clipper::diff(current, lower);
                    raw_overhangs = Some(diffed.clone());
                    diffed
                } else {
                    clipper::diff(
                        current,
                        &clipper::offset(lower, lower_layer_offset, OffsetJoin::Round),
                    )
                };

                if !enforced_layer {
                    if let Some(blockers) = input.blockers.get(layer_idx) {
                        if !blockers.is_empty() {
                            // Safety offset keeps grazing blockers effective.
                            let dilated =
                                clipper::offset(blockers, scale(0.01), OffsetJoin::Miter);
                            overhang = clipper::diff(&overhang, &dilated);
                        }
                    }
                }

                if let Some(filter) = input.bridge_filter {
                    overhang = filter(layer_idx, overhang);
                }
            }

            if let Some(enforcers) = input.enforcers.get(layer_idx) {
                if !enforcers.is_empty() {
                    // Enforcers bypass the angle threshold: they act on the
                    // raw zero-offset overhang.
                    let raw = raw_overhangs
                        .unwrap_or_else(|| clipper::diff(current, lower));
                    let enforced = clipper::intersection(&raw, enforcers);
                    if !enforced.is_empty() {
                        let enforced = clipper::diff(
                            &clipper::offset(
                                &clipper::union_(&enforced),
                                settings.enforcer_overhang_offset,
                                OffsetJoin::Round,
                            ),
                            lower,
                        );
                        overhang = if overhang.is_empty() {
                            enforced
                        } else {
                            clipper::union(&overhang, &enforced)
                        };
                    }
                }
            }

            Ok(overhang)
        })
        .collect::<TreeSupportResult<Vec<Polygons>>>()?;

    overhangs.insert(0, Vec::new());
    overhangs.resize(layer_count, Vec::new());
    Ok(overhangs)
}
