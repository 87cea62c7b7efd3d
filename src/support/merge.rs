//! Merging overlapping influence areas of one layer.
//!
//! After propagation the areas of a layer may overlap; overlapping areas
//! become one element with the union of parents. With thousands of
//! elements per layer the pairwise work is bucketed: an AABB tree build
//! reorders the elements so spatially-near ones are adjacent, the array
//! is cut into small buckets merged internally in parallel, then buckets
//! are folded pairwise until one remains. Bucketing order may change
//! which element survives a merge but not the covered area.

use super::element::{
    get_collision_radius, get_radius, merge_states, move_inside_if_outside,
};
use super::propagate::MergingElement;
use super::settings::TreeSupportSettings;
use crate::clipper;
use crate::error::{CancelToken, TreeSupportResult};
use crate::geometry::{area, get_extents, BoundingBox, BoxTree, Polygons};
use crate::volumes::VolumeOracle;
use crate::{scale, Coord, LayerIndex, TINY_AREA_THRESHOLD};
use rayon::prelude::*;

/// Attempt to merge `src` into `dst`. On success `dst` carries the
/// combined state and areas and `src` is emptied.
fn merge_two_elements(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    layer_idx: LayerIndex,
    dst: &mut MergingElement,
    src: &mut MergingElement,
) -> bool {
    // A bad placement would hurt the whole subtree: gracious and
    // non-gracious must not mix, and neither may the XY regimes, as the
    // engulfing assumption below would not hold across them.
    if dst.state.to_model_gracious != src.state.to_model_gracious
        || dst.state.use_min_xy_dist != src.state.use_min_xy_dist
    {
        return false;
    }

    let dst_radius_bigger =
        get_collision_radius(settings, &dst.state) > get_collision_radius(settings, &src.state);
    let (smaller, bigger) = if dst_radius_bigger {
        (&*src, &*dst)
    } else {
        (&*dst, &*src)
    };
    let real_radius_delta =
        (get_radius(settings, &bigger.state) - get_radius(settings, &smaller.state)).abs();

    // Cheap reject on bounding boxes, expanded the same way the offset
    // below will expand the smaller area.
    if !smaller
        .bbox
        .inflated(real_radius_delta)
        .intersects(&bigger.bbox)
    {
        return false;
    }

    let merging_to_bp = dst.state.to_buildplate && src.state.to_buildplate;
    let mut increased_to_model_radius: Coord = 0;
    if !merging_to_bp {
        if dst.state.to_buildplate != src.state.to_buildplate {
            // Merging a to-plate branch into a to-model branch grows the
            // to-model branch; cap the accumulated growth.
            let rdst = get_radius(settings, &dst.state);
            let rsrc = get_radius(settings, &src.state);
            increased_to_model_radius = if dst.state.to_buildplate {
                if rsrc < rdst {
                    src.state.increased_to_model_radius + rdst - rsrc
                } else {
                    0
                }
            } else if rsrc > rdst {
                dst.state.increased_to_model_radius + rsrc - rdst
            } else {
                0
            };
            if increased_to_model_radius > settings.max_to_model_radius_increase {
                return false;
            }
        }
        // A merge to model this close to the tip could put a stable
        // branch on unstable ground.
        if !dst.state.supports_roof
            && !src.state.supports_roof
            && (dst.state.distance_to_top.max(src.state.distance_to_top) as usize)
                < settings.min_dtt_to_model
        {
            return false;
        }
    }

    // The bigger area's avoidance guarantees placement; growing the safe
    // smaller area into an unsafe bigger one would void that guarantee.
    if !bigger.state.can_use_safe_radius && smaller.state.can_use_safe_radius {
        return false;
    }

    let use_min_radius = bigger.state.use_min_xy_dist && smaller.state.use_min_xy_dist;

    // If the smaller-radius influence area, grown by the radius
    // difference, overlaps the bigger one, then a branch of the bigger
    // radius placed in the overlap has already engulfed the smaller
    // branch. Collision radius <= real radius keeps this sound.
    let smaller_collision_radius = get_collision_radius(settings, &smaller.state);
    let collision = volumes.collision(smaller_collision_radius, layer_idx - 1, use_min_radius);
    let intersect_small_with_bigger = |small: &Polygons, bigger: &Polygons| -> Polygons {
        clipper::intersection(
            &clipper::safe_offset_inc(
                small,
                real_radius_delta,
                &collision,
                // -3 averts rounding errors.
                2 * (settings.xy_distance + smaller_collision_radius - 3),
                0,
                0,
            ),
            bigger,
        )
    };

    let intersect = intersect_small_with_bigger(
        if merging_to_bp {
            &smaller.areas.to_bp_areas
        } else {
            &smaller.areas.to_model_areas
        },
        if merging_to_bp {
            &bigger.areas.to_bp_areas
        } else {
            &bigger.areas.to_model_areas
        },
    );

    // Tiny overlaps attract rounding errors; they also may be lines,
    // which a union one layer down would not keep.
    if area(&intersect) <= TINY_AREA_THRESHOLD {
        return false;
    }
    if area(&clipper::offset(
        &intersect,
        -scale(0.025),
        clipper::OffsetJoin::Miter,
    )) <= TINY_AREA_THRESHOLD
    {
        return false;
    }

    // The point closest to the last merge (or the tip) estimates where
    // the branch will be placed on the bottom-most layer.
    let new_pos = move_inside_if_outside(&intersect, dst.state.next_position);

    let mut new_state = merge_states(&dst.state, &src.state, new_pos, layer_idx - 1, settings);
    new_state.increased_to_model_radius = if increased_to_model_radius == 0 {
        dst.state
            .increased_to_model_radius
            .max(src.state.increased_to_model_radius)
    } else {
        increased_to_model_radius
    };

    // Union with the intersect catches rounding losses.
    let influence_areas = clipper::safe_union(
        &intersect_small_with_bigger(
            &smaller.areas.influence_areas,
            &bigger.areas.influence_areas,
        ),
        &intersect,
    );

    let to_model_areas = if merging_to_bp && settings.support_rests_on_model {
        if new_state.to_model_gracious {
            clipper::safe_union(
                &intersect_small_with_bigger(
                    &smaller.areas.to_model_areas,
                    &bigger.areas.to_model_areas,
                ),
                &intersect,
            )
        } else {
            influence_areas.clone()
        }
    } else {
        Vec::new()
    };

    let src_parents = std::mem::take(&mut src.parents);
    dst.parents.extend(src_parents);
    dst.state = new_state;
    dst.areas.influence_areas = influence_areas;
    dst.areas.to_bp_areas.clear();
    dst.areas.to_model_areas.clear();
    if merging_to_bp {
        dst.areas.to_bp_areas = intersect;
        if settings.support_rests_on_model {
            dst.areas.to_model_areas = to_model_areas;
        }
    } else {
        dst.areas.to_model_areas = intersect;
    }

    let mut bbox = get_extents(&dst.areas.influence_areas);
    bbox.merge(&get_extents(&dst.areas.to_bp_areas));
    bbox.merge(&get_extents(&dst.areas.to_model_areas));
    dst.set_bbox(bbox);

    src.areas.clear();
    true
}

fn pair_mut<T>(v: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    debug_assert!(a != b);
    if a < b {
        let (left, right) = v.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = v.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// O(n²) merging within one bucket.
fn merge_leaves(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    layer_idx: LayerIndex,
    bucket: &mut Vec<MergingElement>,
) {
    let mut i = 0;
    while i + 1 < bucket.len() {
        let mut j = i + 1;
        while j < bucket.len() {
            let (dst, src) = pair_mut(bucket, i, j);
            if merge_two_elements(volumes, settings, layer_idx, dst, src) {
                bucket.swap_remove(j);
                // dst grew; rescan the remaining candidates against it.
                j = i + 1;
            } else {
                j += 1;
            }
        }
        i += 1;
    }
}

/// Merge `src` bucket into `dst` bucket. Elements of each bucket are
/// already mutually non-overlapping.
fn merge_two_sets(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    layer_idx: LayerIndex,
    dst: &mut Vec<MergingElement>,
    src: Vec<MergingElement>,
) {
    for mut s in src {
        let mut merged_into: Option<usize> = None;
        for k in 0..dst.len() {
            if merge_two_elements(volumes, settings, layer_idx, &mut dst[k], &mut s) {
                merged_into = Some(k);
                break;
            }
        }
        match merged_into {
            Some(mut k) => {
                // The merged element grew; it may now swallow others that
                // were previously disjoint from both halves.
                let mut j = 0;
                while j < dst.len() {
                    if j == k {
                        j += 1;
                        continue;
                    }
                    let (a, b) = pair_mut(dst, k, j);
                    if merge_two_elements(volumes, settings, layer_idx, a, b) {
                        let last = dst.len() - 1;
                        dst.swap_remove(j);
                        if k == last {
                            k = j;
                        }
                    } else {
                        j += 1;
                    }
                }
            }
            None => dst.push(s),
        }
    }
}

/// Merge all overlapping influence areas of one layer.
///
/// `layer_idx` is the layer the elements were propagated *from*; the
/// elements themselves live on `layer_idx - 1`.
pub fn merge_influence_areas(
    volumes: &dyn VolumeOracle,
    settings: &TreeSupportSettings,
    layer_idx: LayerIndex,
    influence_areas: &mut Vec<MergingElement>,
    cancel: &CancelToken,
) -> TreeSupportResult<()> {
    let input_size = influence_areas.len();
    if input_size < 2 {
        return Ok(());
    }

    // Sorting into an AABB tree makes most intersections happen in the
    // first (cheap, parallel) iterations, with little left for the
    // subtree folds.
    BoxTree::build_modify_input(influence_areas.as_mut_slice(), |e| e.bbox);
    cancel.check()?;

    let num_threads = rayon::current_num_threads().max(1);
    let bucket_size = if (input_size + 2) / 4 >= num_threads { 4 } else { 2 };

    let drained = std::mem::take(influence_areas);
    let mut buckets: Vec<Vec<MergingElement>> = Vec::with_capacity(input_size / bucket_size + 1);
    let mut iter = drained.into_iter();
    loop {
        let chunk: Vec<MergingElement> = iter.by_ref().take(bucket_size).collect();
        if chunk.is_empty() {
            break;
        }
        buckets.push(chunk);
    }

    // First round: everyone against everyone inside each bucket.
    buckets
        .par_iter_mut()
        .try_for_each(|bucket| -> TreeSupportResult<()> {
            cancel.check()?;
            merge_leaves(volumes, settings, layer_idx, bucket);
            Ok(())
        })?;

    // Fold rounds: halve the bucket count until one remains.
    while buckets.len() > 1 {
        let mut pairs: Vec<(Vec<MergingElement>, Option<Vec<MergingElement>>)> = Vec::new();
        let mut iter = buckets.into_iter();
        while let Some(first) = iter.next() {
            pairs.push((first, iter.next()));
        }
        buckets = pairs
            .into_par_iter()
            .map(|(mut dst, src)| -> TreeSupportResult<Vec<MergingElement>> {
                if let Some(src) = src {
                    cancel.check()?;
                    merge_two_sets(volumes, settings, layer_idx, &mut dst, src);
                }
                Ok(dst)
            })
            .collect::<TreeSupportResult<Vec<_>>>()?;
    }

    *influence_areas = buckets.pop().unwrap_or_default();
    Ok(())
}
