//! The tree support pipeline.
//!
//! A serial chain of internally-parallel stages:
//! overhangs → tips → propagate (+merge) → resolve → render → finalize.
//! [`TreeSupportGenerator`] drives the chain and owns the per-run
//! diagnostics; geometry queries go through the caller-supplied
//! [`VolumeOracle`] and [`InfillOracle`].

pub mod branch_mesh;
pub mod draw;
pub mod element;
pub mod finalize;
pub mod merge;
pub mod organic;
pub mod overhang;
pub mod propagate;
pub mod resolve;
pub mod settings;
pub mod tips;

pub use element::{LineStatus, SupportElement, SupportElementState, SupportElements};
pub use finalize::{SupportChannels, SupportGeneratorLayer, SupportLayerKind};
pub use overhang::OverhangInput;
pub use settings::{
    InterfacePreference, TreeSupportMeshGroupSettings, TreeSupportSettings, TreeSupportStyle,
};

use crate::error::{CancelToken, DiagnosticsContext, TreeSupportResult};
use crate::geometry::Polygons;
use crate::infill::InfillOracle;
use crate::mesh::TriangleMesh;
use crate::volumes::VolumeOracle;

/// Everything a tree support run produces.
#[derive(Debug, Default)]
pub struct TreeSupportOutput {
    /// Dense top interfaces (roofs), per layer.
    pub top_contacts: Vec<Option<SupportGeneratorLayer>>,
    /// Dense bottom interfaces (floors), per layer.
    pub bottom_contacts: Vec<Option<SupportGeneratorLayer>>,
    /// Regular support body, per layer.
    pub intermediate_layers: Vec<Option<SupportGeneratorLayer>>,
    /// The cumulative branch tube mesh; organic style only.
    pub branch_mesh: Option<TriangleMesh>,
}

impl TreeSupportOutput {
    fn empty(num_layers: usize) -> Self {
        Self {
            top_contacts: (0..num_layers).map(|_| None).collect(),
            bottom_contacts: (0..num_layers).map(|_| None).collect(),
            intermediate_layers: (0..num_layers).map(|_| None).collect(),
            branch_mesh: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.top_contacts.iter().all(Option::is_none)
            && self.bottom_contacts.iter().all(Option::is_none)
            && self.intermediate_layers.iter().all(Option::is_none)
    }
}

/// Drives one tree support run.
pub struct TreeSupportGenerator<'a> {
    settings: TreeSupportSettings,
    volumes: &'a dyn VolumeOracle,
    infill: &'a dyn InfillOracle,
    diag: DiagnosticsContext,
    cancel: CancelToken,
}

impl<'a> TreeSupportGenerator<'a> {
    pub fn new(
        settings: TreeSupportSettings,
        volumes: &'a dyn VolumeOracle,
        infill: &'a dyn InfillOracle,
    ) -> Self {
        Self {
            settings,
            volumes,
            infill,
            diag: DiagnosticsContext::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Install a shared cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &TreeSupportSettings {
        &self.settings
    }

    /// Per-run diagnostics, valid after (or during) a run.
    pub fn diagnostics(&self) -> &DiagnosticsContext {
        &self.diag
    }

    /// Full run from raw layer data: extract overhangs, then generate.
    pub fn generate(&self, input: &OverhangInput<'_>) -> TreeSupportResult<TreeSupportOutput> {
        let overhangs =
            overhang::generate_overhangs(&self.settings, input, &self.cancel)?;
        self.generate_from_overhangs(&overhangs)
    }

    /// Run the pipeline on precomputed per-layer overhang polygons.
    pub fn generate_from_overhangs(
        &self,
        overhangs: &[Polygons],
    ) -> TreeSupportResult<TreeSupportOutput> {
        let num_layers = self.volumes.layer_count();
        let max_overhang_layer = (0..overhangs.len().min(num_layers))
            .rev()
            .find(|&i| !overhangs[i].is_empty());
        let Some(max_overhang_layer) = max_overhang_layer else {
            // Nothing overhangs; nothing to support.
            return Ok(TreeSupportOutput::empty(num_layers));
        };
        tracing::info!(
            layers = num_layers,
            top_overhang_layer = max_overhang_layer,
            style = ?self.settings.style,
            "generating tree supports"
        );

        // Warm the memoized volumes up front so the parallel propagation
        // mostly hits the caches.
        let max_layer =
            max_overhang_layer.saturating_sub(self.settings.z_distance_top_layers);
        self.volumes.precalculate(
            max_layer,
            &[self.settings.min_radius, self.settings.branch_radius],
            &self.cancel,
        )?;

        // Tips.
        let placement = tips::generate_initial_areas(
            &self.settings,
            self.volumes,
            self.infill,
            overhangs,
            &self.diag,
            &self.cancel,
        )?;
        let mut move_bounds = placement.move_bounds;
        let top_contact_seed = placement.roof_storage;
        let tip_count: usize = move_bounds.iter().map(|l| l.len()).sum();
        tracing::debug!(tips = tip_count, "tip placement finished");
        if tip_count == 0 {
            return Ok(TreeSupportOutput::empty(num_layers));
        }

        // Propagation and merging.
        propagate::create_layer_pathing(
            self.volumes,
            &self.settings,
            &mut move_bounds,
            &self.diag,
            &self.cancel,
        )?;

        // Node resolution.
        resolve::create_nodes_from_area(
            self.volumes,
            &self.settings,
            &mut move_bounds,
            &self.diag,
            &self.cancel,
        )?;

        // Rendering.
        let mut branch_mesh = None;
        let (support_layer_storage, support_roof_storage) = match self.settings.style {
            TreeSupportStyle::Classic => draw::draw_areas(
                self.volumes,
                &self.settings,
                &mut move_bounds,
                &self.diag,
                &self.cancel,
            )?,
            TreeSupportStyle::Organic => {
                let (linear, linear_layers) = draw::linearize_tree(&move_bounds);
                organic::organic_smooth_branches_avoid_collisions(
                    self.volumes,
                    &self.settings,
                    &mut move_bounds,
                    &linear,
                    &linear_layers,
                    &self.cancel,
                )?;
                let mesh =
                    branch_mesh::draw_branches(&self.settings, &mut move_bounds, &self.cancel)?;
                let slices = branch_mesh::slice_branches(
                    self.volumes,
                    &self.settings,
                    num_layers,
                    &mesh,
                    &self.cancel,
                )?;
                branch_mesh = Some(mesh);
                (slices, vec![Vec::new(); num_layers])
            }
        };

        // Finalization.
        let channels = finalize::finalize_interface_and_support_areas(
            self.volumes,
            &self.settings,
            overhangs,
            support_layer_storage,
            support_roof_storage,
            top_contact_seed,
            &self.cancel,
        )?;

        Ok(TreeSupportOutput {
            top_contacts: channels.top_contacts,
            bottom_contacts: channels.bottom_contacts,
            intermediate_layers: channels.intermediate_layers,
            branch_mesh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ExPolygon, ExPolygons, Point, Polygon};
    use crate::infill::SupportLineFiller;
    use crate::scale;
    use crate::volumes::{TreeModelVolumes, VolumeConfig};

    fn make_settings(style: TreeSupportStyle) -> TreeSupportSettings {
        let raw = TreeSupportMeshGroupSettings {
            style,
            support_roof_enable: false,
            ..Default::default()
        };
        TreeSupportSettings::new(&raw).unwrap()
    }

    fn volumes_for(
        outlines: &[ExPolygons],
        settings: &TreeSupportSettings,
    ) -> TreeModelVolumes {
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

    #[test]
    fn no_overhangs_produce_no_output() {
        let settings = make_settings(TreeSupportStyle::Classic);
        let square = Polygon::rectangle(
            Point::new(-scale(5.0), -scale(5.0)),
            Point::new(scale(5.0), scale(5.0)),
        );
        let outlines: Vec<ExPolygons> = vec![vec![ExPolygon::new(square)]; 10];
        let volumes = volumes_for(&outlines, &settings);
        let filler = SupportLineFiller::new();
        let generator = TreeSupportGenerator::new(settings, &volumes, &filler);
        let output = generator
            .generate_from_overhangs(&vec![Vec::new(); 10])
            .unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn cancellation_yields_no_partial_output() {
        let settings = make_settings(TreeSupportStyle::Classic);
        let square = Polygon::rectangle(
            Point::new(-scale(5.0), -scale(5.0)),
            Point::new(scale(5.0), scale(5.0)),
        );
        let outlines: Vec<ExPolygons> = vec![vec![ExPolygon::new(square.clone())]; 10];
        let volumes = volumes_for(&outlines, &settings);
        let filler = SupportLineFiller::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let generator =
            TreeSupportGenerator::new(settings, &volumes, &filler).with_cancel(cancel);
        let mut overhangs: Vec<Polygons> = vec![Vec::new(); 10];
        overhangs[6] = vec![square];
        let result = generator.generate_from_overhangs(&overhangs);
        assert!(matches!(
            result,
            Err(crate::error::TreeSupportError::Cancelled)
        ));
    }
}
