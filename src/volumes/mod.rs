//! Collision and avoidance volumes.
//!
//! The propagator asks, billions of times, "where may a branch of radius
//! r be at layer z?". [`TreeModelVolumes`] answers from per-layer object
//! outlines, memoizing every computed polygon set keyed by
//! `(radius-ladder entry, layer, flags)`. The [`VolumeOracle`] trait is
//! the seam an embedding slicer can implement differently.
//!
//! Radii are quantized to a ladder (linear steps below a threshold,
//! exponential above) so the caches stay small; queries round up, which
//! keeps every answer conservative.

use crate::clipper::{self, OffsetJoin};
use crate::error::{CancelToken, TreeSupportResult};
use crate::geometry::{expolygons_to_polygons, ExPolygons, Polygon, Polygons};
use crate::{scale, Coord, LayerIndex};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Avoidance flavors, trading computation speed against safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AvoidanceKind {
    /// Precise: propagated with the slow movement distance. A branch
    /// constrained to slow moves must honor this one.
    Slow,
    /// Propagated with the fast movement distance; may steer a branch
    /// into a hole it cannot escape.
    Fast,
    /// Like `Fast` but built on the hole-free collision, so a branch
    /// clear of it cannot be trapped inside a hole.
    FastSafe,
}

/// Queries the support pipeline makes about forbidden and usable space.
///
/// All returned polygon sets are flat ring lists (holes as clockwise
/// rings). Implementations must be thread safe: the propagator issues
/// concurrent reads.
pub trait VolumeOracle: Send + Sync {
    /// Zones where a branch of `radius` may not have its center at
    /// `layer` (object dilated by radius plus the XY clearance).
    fn collision(&self, radius: Coord, layer: LayerIndex, min_xy: bool) -> Arc<Polygons>;

    /// Collision with holes filled; clearing this means never entering a
    /// hole.
    fn collision_holefree(&self, radius: Coord, layer: LayerIndex) -> Arc<Polygons>;

    /// Zones from which a branch cannot legally reach the build plate
    /// (`to_model = false`) or any placeable model surface
    /// (`to_model = true`), given its per-layer movement budget.
    fn avoidance(
        &self,
        radius: Coord,
        layer: LayerIndex,
        kind: AvoidanceKind,
        to_model: bool,
        min_xy: bool,
    ) -> Arc<Polygons>;

    /// Model top surfaces where a branch of `radius` may rest at `layer`.
    fn placeable_areas(&self, radius: Coord, layer: LayerIndex) -> Arc<Polygons>;

    /// Object walls at `layer` a single-layer move below `layer` must not
    /// cross (anti-teleport restriction).
    fn wall_restriction(&self, radius: Coord, layer: LayerIndex, min_xy: bool) -> Arc<Polygons>;

    /// Round a radius up to its ladder entry.
    fn ceil_radius(&self, radius: Coord, min_xy: bool) -> Coord;

    /// The first ladder entry strictly above `radius`.
    fn ceil_radius_next(&self, radius: Coord, min_xy: bool) -> Coord;

    fn layer_count(&self) -> usize;

    /// Warm internal caches for the layers and radii a run will need.
    /// Implementations without caches can keep the no-op default.
    fn precalculate(
        &self,
        _max_layer: LayerIndex,
        _radii: &[Coord],
        _cancel: &CancelToken,
    ) -> TreeSupportResult<()> {
        Ok(())
    }
}

/// Linear ladder step below [`EXPONENTIAL_THRESHOLD`].
pub const COLLISION_RESOLUTION: Coord = 500_000; // 0.5 mm

/// Radius above which ladder steps grow exponentially.
pub const EXPONENTIAL_THRESHOLD: Coord = 3_000_000; // 3 mm

/// Growth factor of the exponential ladder region.
pub const EXPONENTIAL_FACTOR: f64 = 1.5;

/// Configuration of [`TreeModelVolumes`].
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Regular XY clearance between support and model, scaled.
    pub xy_distance: Coord,
    /// Tighter XY clearance used when Z distance overrides XY, scaled.
    pub xy_min_distance: Coord,
    /// Fast per-layer movement budget, scaled.
    pub max_move: Coord,
    /// Slow per-layer movement budget, scaled. `<= max_move`.
    pub max_move_slow: Coord,
    /// Tip radius; guaranteed to exist on the ladder.
    pub min_radius: Coord,
    /// Vertical clearance above the model, in layers.
    pub z_distance_top_layers: usize,
    /// Vertical clearance below the model, in layers.
    pub z_distance_bottom_layers: usize,
    /// Whether branches may rest on the model at all (enables the
    /// to-model avoidance family).
    pub support_rests_on_model: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            xy_distance: scale(0.8),
            xy_min_distance: scale(0.4),
            max_move: scale(0.4),
            max_move_slow: scale(0.2),
            min_radius: scale(0.4),
            z_distance_top_layers: 1,
            z_distance_bottom_layers: 1,
            support_rests_on_model: false,
        }
    }
}

type CacheKey = (Coord, LayerIndex);
type PolygonCache = RwLock<HashMap<CacheKey, Arc<Polygons>>>;

fn cache_get(cache: &PolygonCache, key: CacheKey) -> Option<Arc<Polygons>> {
    cache.read().unwrap().get(&key).cloned()
}

fn cache_put(cache: &PolygonCache, key: CacheKey, value: Polygons) -> Arc<Polygons> {
    let arc = Arc::new(value);
    cache.write().unwrap().insert(key, arc.clone());
    arc
}

/// Memoized volume oracle over per-layer object outlines.
pub struct TreeModelVolumes {
    config: VolumeConfig,
    /// Flattened object outline rings per layer.
    layer_outlines: Vec<Polygons>,
    /// User no-support zones per layer (already flattened).
    anti_overhang: Vec<Polygons>,
    /// Region outside the printable bed, as forbidden rings.
    machine_border: Polygons,

    collision_cache: PolygonCache,
    collision_cache_min: PolygonCache,
    collision_cache_holefree: PolygonCache,
    placeable_cache: PolygonCache,
    wall_restriction_cache: PolygonCache,
    wall_restriction_cache_min: PolygonCache,
    // One avoidance cache per (kind, to_model, min_xy) combination.
    avoidance_caches: HashMap<(AvoidanceKind, bool, bool), PolygonCache>,
}

impl std::fmt::Debug for TreeModelVolumes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeModelVolumes")
            .field("layers", &self.layer_outlines.len())
            .finish_non_exhaustive()
    }
}

impl TreeModelVolumes {
    /// Build from per-layer outlines (contours with holes).
    pub fn new(config: VolumeConfig, layer_outlines: &[ExPolygons]) -> Self {
        let outlines: Vec<Polygons> = layer_outlines
            .iter()
            .map(|ex| expolygons_to_polygons(ex))
            .collect();
        let mut avoidance_caches = HashMap::new();
        for kind in [AvoidanceKind::Slow, AvoidanceKind::Fast, AvoidanceKind::FastSafe] {
            for to_model in [false, true] {
                for min_xy in [false, true] {
                    avoidance_caches.insert((kind, to_model, min_xy), PolygonCache::default());
                }
            }
        }
        Self {
            config,
            anti_overhang: vec![Vec::new(); outlines.len()],
            machine_border: Vec::new(),
            layer_outlines: outlines,
            collision_cache: PolygonCache::default(),
            collision_cache_min: PolygonCache::default(),
            collision_cache_holefree: PolygonCache::default(),
            placeable_cache: PolygonCache::default(),
            wall_restriction_cache: PolygonCache::default(),
            wall_restriction_cache_min: PolygonCache::default(),
            avoidance_caches,
        }
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Set user no-support zones (support blockers) per layer.
    pub fn set_anti_overhang(&mut self, anti_overhang: Vec<Polygons>) {
        self.anti_overhang = anti_overhang;
        self.anti_overhang.resize(self.layer_outlines.len(), Vec::new());
    }

    /// Set the forbidden region outside the printable bed.
    pub fn set_machine_border(&mut self, border: Polygons) {
        self.machine_border = border;
    }

    /// Warm the caches for all layers up to `max_layer` and the radii the
    /// propagation is expected to need, in parallel.
    fn precalculate_impl(
        &self,
        max_layer: LayerIndex,
        radii: &[Coord],
        cancel: &CancelToken,
    ) -> TreeSupportResult<()> {
        let top = max_layer.min(self.layer_count().saturating_sub(1));
        // Collision warms in parallel per (radius, layer).
        let mut keys: Vec<(Coord, LayerIndex)> = Vec::new();
        for &r in radii {
            for layer in 0..=top {
                keys.push((self.ceil_radius(r, false), layer));
            }
        }
        keys.par_iter().try_for_each(|&(r, layer)| {
            cancel.check()?;
            self.collision(r, layer, false);
            Ok(())
        })?;
        // Avoidance is sequential per radius (layer recursion), parallel
        // across radii.
        radii.par_iter().try_for_each(|&r| {
            cancel.check()?;
            self.avoidance(r, top, AvoidanceKind::Fast, false, false);
            self.avoidance(r, top, AvoidanceKind::FastSafe, false, false);
            self.avoidance(r, top, AvoidanceKind::Slow, false, false);
            if self.config.support_rests_on_model {
                self.avoidance(r, top, AvoidanceKind::Fast, true, false);
                self.avoidance(r, top, AvoidanceKind::FastSafe, true, false);
                self.avoidance(r, top, AvoidanceKind::Slow, true, false);
            }
            Ok(())
        })
    }

    fn outline_at(&self, layer: LayerIndex) -> &Polygons {
        static EMPTY: Vec<Polygon> = Vec::new();
        self.layer_outlines.get(layer).unwrap_or(&EMPTY)
    }

    fn calculate_collision(&self, radius: Coord, layer: LayerIndex, min_xy: bool) -> Polygons {
        let xy = if min_xy {
            self.config.xy_min_distance
        } else {
            self.config.xy_distance
        };
        // The collision covers the whole vertical clearance band: a branch
        // at `layer` must clear the object a few layers above and below.
        let band_lo = layer.saturating_sub(self.config.z_distance_bottom_layers);
        let band_hi = (layer + self.config.z_distance_top_layers)
            .min(self.layer_outlines.len().saturating_sub(1));
        let mut forbidden: Polygons = Vec::new();
        for l in band_lo..=band_hi {
            let outline = self.outline_at(l);
            if outline.is_empty() {
                continue;
            }
            if radius + xy > 0 {
                forbidden.extend(clipper::offset(outline, radius + xy, OffsetJoin::Round));
            } else {
                forbidden.extend(outline.iter().cloned());
            }
        }
        if let Some(anti) = self.anti_overhang.get(layer) {
            if !anti.is_empty() {
                forbidden.extend(clipper::offset(anti, radius.max(0), OffsetJoin::Round));
            }
        }
        if !self.machine_border.is_empty() {
            forbidden.extend(clipper::offset(
                &self.machine_border,
                radius.max(0),
                OffsetJoin::Miter,
            ));
        }
        clipper::simplify(&clipper::union_(&forbidden), scale(0.005))
    }

    fn calculate_avoidance(
        &self,
        radius: Coord,
        layer: LayerIndex,
        kind: AvoidanceKind,
        to_model: bool,
        min_xy: bool,
    ) -> Polygons {
        let collision_at = |l: LayerIndex| -> Arc<Polygons> {
            if kind == AvoidanceKind::FastSafe {
                self.collision_holefree(radius, l)
            } else {
                self.collision(radius, l, min_xy)
            }
        };
        if layer == 0 {
            return (*collision_at(0)).clone();
        }
        let max_move = if kind == AvoidanceKind::Slow {
            self.config.max_move_slow
        } else {
            self.config.max_move
        };
        // A center is forbidden if it collides here, or if every position
        // reachable one layer down (within max_move) is itself forbidden:
        // erode the lower avoidance by the movement budget, then add this
        // layer's collision. A to-model branch may also stop on any
        // placeable surface, so those areas are carved out before the
        // propagation.
        let below = self.avoidance(radius, layer - 1, kind, to_model, min_xy);
        let mut propagated = clipper::offset(&below, -max_move, OffsetJoin::Round);
        if to_model {
            let placeable = self.placeable_areas(radius, layer);
            if !placeable.is_empty() {
                propagated = clipper::diff(&propagated, &placeable);
            }
        }
        clipper::simplify(
            &clipper::union(&propagated, &collision_at(layer)),
            scale(0.005),
        )
    }

    fn calculate_placeable(&self, radius: Coord, layer: LayerIndex) -> Polygons {
        // Top surfaces of the layer below: object there but not here.
        // Eroded so a disk of `radius` fits entirely on the surface.
        if layer == 0 {
            // Everything on the build plate is placeable; the bed border
            // (if set) is the only restriction.
            return Vec::new();
        }
        let below = self.outline_at(layer - 1);
        if below.is_empty() {
            return Vec::new();
        }
        let here = self.outline_at(layer);
        let top_surface = clipper::diff(below, here);
        clipper::offset(&top_surface, -radius, OffsetJoin::Miter)
    }

    fn calculate_wall_restriction(
        &self,
        radius: Coord,
        layer: LayerIndex,
        min_xy: bool,
    ) -> Polygons {
        // The object at the parent layer that is still forbidden one layer
        // down: an influence area stepped through it in one move would
        // have crossed a wall.
        if layer == 0 {
            return Vec::new();
        }
        let above = self.collision(0, layer, min_xy);
        let below = self.collision(radius, layer - 1, min_xy);
        clipper::intersection(&above, &below)
    }
}

impl VolumeOracle for TreeModelVolumes {
    fn collision(&self, radius: Coord, layer: LayerIndex, min_xy: bool) -> Arc<Polygons> {
        let radius = self.ceil_radius(radius, min_xy);
        let cache = if min_xy {
            &self.collision_cache_min
        } else {
            &self.collision_cache
        };
        if let Some(hit) = cache_get(cache, (radius, layer)) {
            return hit;
        }
        let result = self.calculate_collision(radius, layer, min_xy);
        cache_put(cache, (radius, layer), result)
    }

    fn collision_holefree(&self, radius: Coord, layer: LayerIndex) -> Arc<Polygons> {
        let radius = self.ceil_radius(radius, false);
        if let Some(hit) = cache_get(&self.collision_cache_holefree, (radius, layer)) {
            return hit;
        }
        // Keep only counter-clockwise rings: holes are filled.
        let collision = self.collision(radius, layer, false);
        let filled: Polygons = collision
            .iter()
            .filter(|p| p.signed_area() >= 0.0)
            .cloned()
            .collect();
        cache_put(&self.collision_cache_holefree, (radius, layer), filled)
    }

    fn avoidance(
        &self,
        radius: Coord,
        layer: LayerIndex,
        kind: AvoidanceKind,
        to_model: bool,
        min_xy: bool,
    ) -> Arc<Polygons> {
        let radius = self.ceil_radius(radius, min_xy);
        let cache = &self.avoidance_caches[&(kind, to_model, min_xy)];
        if let Some(hit) = cache_get(cache, (radius, layer)) {
            return hit;
        }
        // Fill the cache bottom-up instead of recursing; avoids a stack
        // proportional to the layer count on first access.
        let start = {
            let read = cache.read().unwrap();
            let mut first_missing = 0;
            for l in (0..=layer).rev() {
                if read.contains_key(&(radius, l)) {
                    first_missing = l + 1;
                    break;
                }
            }
            first_missing
        };
        for l in start..=layer {
            let result = self.calculate_avoidance(radius, l, kind, to_model, min_xy);
            cache_put(cache, (radius, l), result);
        }
        cache_get(cache, (radius, layer)).expect("avoidance was just inserted")
    }

    fn placeable_areas(&self, radius: Coord, layer: LayerIndex) -> Arc<Polygons> {
        let radius = self.ceil_radius(radius, false);
        if let Some(hit) = cache_get(&self.placeable_cache, (radius, layer)) {
            return hit;
        }
        let result = self.calculate_placeable(radius, layer);
        cache_put(&self.placeable_cache, (radius, layer), result)
    }

    fn wall_restriction(&self, radius: Coord, layer: LayerIndex, min_xy: bool) -> Arc<Polygons> {
        let radius = self.ceil_radius(radius, min_xy);
        let cache = if min_xy {
            &self.wall_restriction_cache_min
        } else {
            &self.wall_restriction_cache
        };
        if let Some(hit) = cache_get(cache, (radius, layer)) {
            return hit;
        }
        let result = self.calculate_wall_restriction(radius, layer, min_xy);
        cache_put(cache, (radius, layer), result)
    }

    fn ceil_radius(&self, radius: Coord, _min_xy: bool) -> Coord {
        if radius <= 0 {
            return 0;
        }
        if radius <= self.config.min_radius {
            // The tip radius always has its own ladder entry.
            return self.config.min_radius;
        }
        if radius <= EXPONENTIAL_THRESHOLD {
            let steps = (radius + COLLISION_RESOLUTION - 1) / COLLISION_RESOLUTION;
            return steps * COLLISION_RESOLUTION;
        }
        let mut entry = EXPONENTIAL_THRESHOLD as f64;
        while (entry as Coord) < radius {
            entry *= EXPONENTIAL_FACTOR;
        }
        entry as Coord
    }

    fn ceil_radius_next(&self, radius: Coord, min_xy: bool) -> Coord {
        let ceiled = self.ceil_radius(radius, min_xy);
        if ceiled < self.config.min_radius {
            self.config.min_radius
        } else if ceiled < EXPONENTIAL_THRESHOLD {
            ceiled + COLLISION_RESOLUTION
        } else {
            (ceiled as f64 * EXPONENTIAL_FACTOR) as Coord
        }
    }

    fn layer_count(&self) -> usize {
        self.layer_outlines.len()
    }

    fn precalculate(
        &self,
        max_layer: LayerIndex,
        radii: &[Coord],
        cancel: &CancelToken,
    ) -> TreeSupportResult<()> {
        self.precalculate_impl(max_layer, radii, cancel)
    }
}
