//! Finalization: reconciling the base, roof and floor polygon channels.

use super::settings::{InterfacePreference, TreeSupportSettings};
use crate::clipper::{self, OffsetJoin};
use crate::error::{CancelToken, TreeSupportResult};
use crate::geometry::Polygons;
use crate::volumes::VolumeOracle;
use crate::{scale, CoordF, LayerIndex};
use rayon::prelude::*;
use std::sync::Mutex;

/// Kind of a generated support layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportLayerKind {
    /// Dense interface between support and the model above (roof).
    TopContact,
    /// Dense interface between support and the model below (floor).
    BottomContact,
    /// Regular support body.
    Base,
}

/// One finished layer of one output channel.
#[derive(Debug, Clone)]
pub struct SupportGeneratorLayer {
    pub kind: SupportLayerKind,
    pub layer_idx: LayerIndex,
    /// Top print Z (mm).
    pub print_z: CoordF,
    /// Layer height (mm).
    pub height: CoordF,
    pub polygons: Polygons,
}

/// Append-only layer arena. Indices handed out stay stable.
#[derive(Debug, Default)]
pub struct LayerStoragePool {
    layers: Mutex<Vec<SupportGeneratorLayer>>,
}

impl LayerStoragePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(
        &self,
        settings: &TreeSupportSettings,
        kind: SupportLayerKind,
        layer_idx: LayerIndex,
        polygons: Polygons,
    ) -> usize {
        let height = if layer_idx == 0 {
            crate::unscale(settings.first_layer_height)
        } else {
            crate::unscale(settings.layer_height)
        };
        let mut layers = self.layers.lock().unwrap();
        layers.push(SupportGeneratorLayer {
            kind,
            layer_idx,
            print_z: settings.layer_z(layer_idx),
            height,
            polygons,
        });
        layers.len() - 1
    }

    fn into_layers(self) -> Vec<SupportGeneratorLayer> {
        self.layers.into_inner().unwrap()
    }
}

/// The three per-layer output channels.
#[derive(Debug, Default)]
pub struct SupportChannels {
    pub top_contacts: Vec<Option<SupportGeneratorLayer>>,
    pub bottom_contacts: Vec<Option<SupportGeneratorLayer>>,
    pub intermediate_layers: Vec<Option<SupportGeneratorLayer>>,
}

impl SupportChannels {
    /// True if no channel holds any polygons.
    pub fn is_empty(&self) -> bool {
        self.top_contacts.iter().all(Option::is_none)
            && self.bottom_contacts.iter().all(Option::is_none)
            && self.intermediate_layers.iter().all(Option::is_none)
    }
}

/// Closing-style outward smoothing of the base union.
fn smooth_outward(polygons: Polygons, distance: crate::Coord) -> Polygons {
    if polygons.is_empty() {
        return polygons;
    }
    let grown = clipper::offset(&polygons, distance, OffsetJoin::Round);
    clipper::offset(&grown, -distance, OffsetJoin::Round)
}

/// Reconcile rendered branch areas and roof areas into the final output
/// channels, generating bottom contacts along the way.
pub fn finalize_interface_and_support_areas(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    overhangs: &[Polygons],
    support_layer_storage: Vec<Polygons>,
    support_roof_storage: Vec<Polygons>,
    top_contact_seed: Vec<Polygons>,
    cancel: &CancelToken,
) -> TreeSupportResult<SupportChannels> {
    let num_layers = support_layer_storage.len();
    let pool = LayerStoragePool::new();
    // (kind, layer, pool index) assignments collected per layer.
    let assignments: Vec<Vec<(SupportLayerKind, LayerIndex, usize)>> = (0..num_layers)
        .into_par_iter()
        .map(|layer_idx| -> TreeSupportResult<Vec<(SupportLayerKind, LayerIndex, usize)>> {
            cancel.check()?;
            let mut out = Vec::new();

            // Roof: branch-fed roof areas unioned with the tip-placed
            // contact circles.
            let mut support_roof_polygons: Polygons = Vec::new();
            if let Some(src) = support_roof_storage.get(layer_idx) {
                support_roof_polygons.extend(src.iter().cloned());
            }
            if let Some(seed) = top_contact_seed.get(layer_idx) {
                support_roof_polygons.extend(seed.iter().cloned());
            }
            let mut support_roof_polygons = if support_roof_polygons.is_empty() {
                support_roof_polygons
            } else {
                clipper::union_(&support_roof_polygons)
            };

            let mut base_layer_polygons = support_layer_storage[layer_idx].clone();
            if !base_layer_polygons.is_empty() {
                // Most of this stage's time is this union.
                base_layer_polygons = smooth_outward(
                    clipper::union_(&base_layer_polygons),
                    settings.support_line_width,
                );
                base_layer_polygons = clipper::simplify(
                    &base_layer_polygons,
                    scale(0.03).min(settings.resolution),
                );
            }

            if !support_roof_polygons.is_empty() && !base_layer_polygons.is_empty() {
                match settings.interface_preference {
                    InterfacePreference::InterfaceAreaOverwritesSupport => {
                        base_layer_polygons =
                            clipper::diff(&base_layer_polygons, &support_roof_polygons);
                    }
                    InterfacePreference::SupportAreaOverwritesInterface => {
                        support_roof_polygons =
                            clipper::diff(&support_roof_polygons, &base_layer_polygons);
                    }
                    // Rejected by config validation.
                    InterfacePreference::InterfaceLinesOverwriteSupport
                    | InterfacePreference::SupportLinesOverwriteInterface
                    | InterfacePreference::Nothing => {}
                }
            }

            // Sample bottom contacts where the support body stands on the
            // model, every `performance_interface_skip_layers` below.
            if settings.support_bottom_layers > 0 && !base_layer_polygons.is_empty() {
                let layer_outset = clipper::diff_clipped(
                    &if settings.support_bottom_offset > 0 {
                        clipper::offset(
                            &base_layer_polygons,
                            settings.support_bottom_offset,
                            OffsetJoin::Miter,
                        )
                    } else {
                        base_layer_polygons.clone()
                    },
                    &volumes.collision(0, layer_idx, false),
                );
                let mut floor_layer: Polygons = Vec::new();
                let mut layers_below = 0;
                loop {
                    let sample_layer = layer_idx
                        .saturating_sub(layers_below + settings.z_distance_bottom_layers);
                    if let Some(overhang) = overhangs.get(sample_layer) {
                        floor_layer
                            .extend(clipper::intersection(&layer_outset, overhang));
                    }
                    if layers_below < settings.support_bottom_layers {
                        layers_below = (layers_below
                            + settings.performance_interface_skip_layers)
                            .min(settings.support_bottom_layers);
                    } else {
                        break;
                    }
                }
                if !floor_layer.is_empty() {
                    let floor_layer = clipper::union_(&floor_layer);
                    base_layer_polygons = clipper::diff_clipped(
                        &base_layer_polygons,
                        &clipper::offset(&floor_layer, scale(0.01), OffsetJoin::Miter),
                    );
                    let idx = pool.allocate(
                        settings,
                        SupportLayerKind::BottomContact,
                        layer_idx,
                        floor_layer,
                    );
                    out.push((SupportLayerKind::BottomContact, layer_idx, idx));
                }
            }

            if !support_roof_polygons.is_empty() {
                let idx = pool.allocate(
                    settings,
                    SupportLayerKind::TopContact,
                    layer_idx,
                    clipper::union_(&support_roof_polygons),
                );
                out.push((SupportLayerKind::TopContact, layer_idx, idx));
            }
            if !base_layer_polygons.is_empty() {
                let idx = pool.allocate(
                    settings,
                    SupportLayerKind::Base,
                    layer_idx,
                    clipper::union_(&base_layer_polygons),
                );
                out.push((SupportLayerKind::Base, layer_idx, idx));
            }
            Ok(out)
        })
        .collect::<TreeSupportResult<Vec<_>>>()?;

    let mut pool_layers: Vec<Option<SupportGeneratorLayer>> =
        pool.into_layers().into_iter().map(Some).collect();
    let mut channels = SupportChannels {
        top_contacts: (0..num_layers).map(|_| None).collect(),
        bottom_contacts: (0..num_layers).map(|_| None).collect(),
        intermediate_layers: (0..num_layers).map(|_| None).collect(),
    };
    for per_layer in assignments {
        for (kind, layer_idx, pool_idx) in per_layer {
            let layer = pool_layers[pool_idx].take();
            match kind {
                SupportLayerKind::TopContact => channels.top_contacts[layer_idx] = layer,
                SupportLayerKind::BottomContact => channels.bottom_contacts[layer_idx] = layer,
                SupportLayerKind::Base => channels.intermediate_layers[layer_idx] = layer,
            }
        }
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{area, ExPolygons, Point, Polygon};
    use crate::support::settings::TreeSupportMeshGroupSettings;
    use crate::volumes::{TreeModelVolumes, VolumeConfig};
    use crate::TINY_AREA_THRESHOLD;

    fn settings_with(
        f: impl FnOnce(&mut TreeSupportMeshGroupSettings),
    ) -> TreeSupportSettings {
        let mut raw = TreeSupportMeshGroupSettings::default();
        f(&mut raw);
        TreeSupportSettings::new(&raw).unwrap()
    }

    fn empty_volumes(layers: usize) -> TreeModelVolumes {
        let outlines: Vec<ExPolygons> = vec![Vec::new(); layers];
        TreeModelVolumes::new(VolumeConfig::default(), &outlines)
    }

    fn square_mm(half: f64) -> Polygons {
        vec![Polygon::rectangle(
            Point::new(-scale(half), -scale(half)),
            Point::new(scale(half), scale(half)),
        )]
    }

    #[test]
    fn interface_overwrites_base() {
        let settings = settings_with(|_| {});
        let volumes = empty_volumes(3);
        let mut base = vec![Vec::new(); 3];
        base[1] = square_mm(5.0);
        let mut roof = vec![Vec::new(); 3];
        roof[1] = square_mm(2.0);
        let channels = finalize_interface_and_support_areas(
            &volumes,
            &settings,
            &[Vec::new(), Vec::new(), Vec::new()],
            base,
            roof,
            vec![Vec::new(); 3],
            &CancelToken::new(),
        )
        .unwrap();
        let base_layer = channels.intermediate_layers[1].as_ref().unwrap();
        let roof_layer = channels.top_contacts[1].as_ref().unwrap();
        // The roof's footprint was removed from the base.
        let overlap = clipper::intersection(&base_layer.polygons, &roof_layer.polygons);
        assert!(area(&overlap) <= TINY_AREA_THRESHOLD);
    }

    #[test]
    fn base_overwrites_interface() {
        let settings = settings_with(|raw| {
            raw.interface_preference =
                crate::support::settings::InterfacePreference::SupportAreaOverwritesInterface;
        });
        let volumes = empty_volumes(3);
        let mut base = vec![Vec::new(); 3];
        base[1] = square_mm(2.0);
        let mut roof = vec![Vec::new(); 3];
        roof[1] = square_mm(5.0);
        let channels = finalize_interface_and_support_areas(
            &volumes,
            &settings,
            &[Vec::new(), Vec::new(), Vec::new()],
            base,
            roof,
            vec![Vec::new(); 3],
            &CancelToken::new(),
        )
        .unwrap();
        let base_layer = channels.intermediate_layers[1].as_ref().unwrap();
        let roof_layer = channels.top_contacts[1].as_ref().unwrap();
        let overlap = clipper::intersection(&base_layer.polygons, &roof_layer.polygons);
        assert!(area(&overlap) <= TINY_AREA_THRESHOLD * 100.0);
    }

    #[test]
    fn nothing_preference_keeps_both() {
        let settings = settings_with(|raw| {
            raw.interface_preference = crate::support::settings::InterfacePreference::Nothing;
        });
        let volumes = empty_volumes(2);
        let mut base = vec![Vec::new(); 2];
        base[1] = square_mm(5.0);
        let mut roof = vec![Vec::new(); 2];
        roof[1] = square_mm(5.0);
        let channels = finalize_interface_and_support_areas(
            &volumes,
            &settings,
            &[Vec::new(), Vec::new()],
            base,
            roof,
            vec![Vec::new(); 2],
            &CancelToken::new(),
        )
        .unwrap();
        assert!(channels.intermediate_layers[1].is_some());
        assert!(channels.top_contacts[1].is_some());
    }

    #[test]
    fn bottom_contacts_sampled_from_overhangs() {
        let settings = settings_with(|raw| {
            raw.support_bottom_enable = true;
            raw.support_bottom_height = 0.4;
        });
        let volumes = empty_volumes(6);
        // Base support on layer 4; an overhang (model top surface) right
        // under it in the sampling band.
        let mut base = vec![Vec::new(); 6];
        base[4] = square_mm(5.0);
        let mut overhangs = vec![Vec::new(); 6];
        overhangs[3] = square_mm(5.0);
        overhangs[2] = square_mm(5.0);
        let channels = finalize_interface_and_support_areas(
            &volumes,
            &settings,
            &overhangs,
            base,
            vec![Vec::new(); 6],
            vec![Vec::new(); 6],
            &CancelToken::new(),
        )
        .unwrap();
        let floor = channels.bottom_contacts[4].as_ref();
        assert!(floor.is_some(), "no bottom contact generated");
        assert_eq!(floor.unwrap().kind, SupportLayerKind::BottomContact);
        // The floor area was subtracted from the base.
        let base_layer = channels.intermediate_layers[4].as_ref();
        if let Some(base_layer) = base_layer {
            let overlap =
                clipper::intersection(&base_layer.polygons, &floor.unwrap().polygons);
            assert!(area(&overlap) <= TINY_AREA_THRESHOLD);
        }
    }

    #[test]
    fn empty_input_empty_channels() {
        let settings = settings_with(|_| {});
        let volumes = empty_volumes(4);
        let channels = finalize_interface_and_support_areas(
            &volumes,
            &settings,
            &vec![Vec::new(); 4],
            vec![Vec::new(); 4],
            vec![Vec::new(); 4],
            vec![Vec::new(); 4],
            &CancelToken::new(),
        )
        .unwrap();
        assert!(channels.is_empty());
    }
}
