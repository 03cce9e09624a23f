//! Cross-target selection of merged correlations.
//!
//! Each target contributes an independent merged correlation list.
//! The selector streams through all of them in source offset order
//! and keeps the best non-overlapping pairing, preferring longer
//! source segments and splitting or truncating on partial overlap.
//! Split and truncated entries get their target ranges interpolated
//! proportionally; inexact interpolations are tracked in a separate
//! set so downstream consumers can treat them as approximate.

use crate::merge::{fill_source_holes, MergedCorrelations};
use crate::segment::Segment;
use std::collections::HashSet;
use tracing::debug;

/// Target matches annotated with the index of the target they came
/// from.
pub type TaggedMatches = Vec<(usize, Vec<Segment>)>;

/// `(source, tagged target matches)` entries sorted by source offset.
pub type TaggedCorrelations = Vec<(Segment, TaggedMatches)>;

/// Identifies one interpolated `(source, target index, target)` pair.
pub type InterpolatedKey = (Segment, usize, Segment);

/// Result of cross-target selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Combined correlations with pairwise non-overlapping source
    /// segments, jointly covering the union of the input coverage.
    pub correlations: TaggedCorrelations,
    /// Pairs whose target range was extrapolated rather than verified
    /// by byte-level search.
    pub interpolated: HashSet<InterpolatedKey>,
}

/// Select the best source-target pairs across targets.
///
/// `per_target[t]` is target `t`'s merged correlation list, sorted by
/// source offset; tags in the output refer to these indices. Entries
/// with empty match lists are ignored on input, and coverage holes
/// are re-filled with empty tag lists at the end.
pub fn select_correlations(per_target: &[MergedCorrelations]) -> Selection {
    let mut selected: TaggedCorrelations = Vec::new();
    let mut interpolated: HashSet<InterpolatedKey> = HashSet::new();

    let mut idxs = vec![0usize; per_target.len()];
    loop {
        // Pop the pending correlation with the lowest source offset;
        // ties go to the earliest target
        let mut next: Option<(usize, usize)> = None;
        for (t, correlations) in per_target.iter().enumerate() {
            let i = idxs[t];
            if i < correlations.len()
                && next.map_or(true, |(_, best)| correlations[i].0.offset < best)
            {
                next = Some((t, correlations[i].0.offset));
            }
        }
        let Some((tnext, _)) = next else {
            break;
        };
        let cnext = &per_target[tnext][idxs[tnext]];
        idxs[tnext] += 1;
        if cnext.1.is_empty() {
            continue;
        }

        let conflicts = selected
            .last()
            .map_or(false, |(prev, _)| prev.end() > cnext.0.offset);
        if !conflicts {
            selected.push((cnext.0, vec![(tnext, cnext.1.clone())]));
            continue;
        }
        let last = selected.len() - 1;
        let cprev_src = selected[last].0;

        // 1. Equal source segments: collect the tags together
        if cnext.0 == cprev_src {
            selected[last].1.push((tnext, cnext.1.clone()));
            continue;
        }

        // 2. Subset of the previous selection: drop
        if cnext.0.end() <= cprev_src.end() {
            continue;
        }

        // 3. Superset: replace the previous selection outright
        if cnext.0.offset <= cprev_src.offset && cnext.0.end() >= cprev_src.end() {
            for (tag, targets) in &selected[last].1 {
                for target in targets {
                    interpolated.remove(&(cprev_src, *tag, *target));
                }
            }
            selected[last] = (cnext.0, vec![(tnext, cnext.1.clone())]);
            continue;
        }

        // 4. Not longer and not a subset: keep only the tail past the
        // previous selection, interpolating the targets to match
        if cnext.0.length <= cprev_src.length {
            let split_start = cprev_src.end();
            let split_end = cnext.0.end();
            let split_src = Segment {
                offset: split_start,
                length: split_end - split_start,
            };
            let mut split_targets = Vec::new();
            for &target in &cnext.1 {
                let (interp, exact) = interpolate(target, cnext.0, split_start, split_end);
                if !exact {
                    interpolated.insert((split_src, tnext, interp));
                }
                split_targets.push(interp);
            }
            selected.push((split_src, vec![(tnext, split_targets)]));
            continue;
        }

        // 5. Longer but not a superset: truncate the previous
        // selection to the head before this one, then append
        let split_start = cprev_src.offset;
        let split_end = cnext.0.offset;
        let split_src = Segment {
            offset: split_start,
            length: split_end - split_start,
        };
        let mut split_tagged = Vec::new();
        for (tag, targets) in selected[last].1.clone() {
            let mut split_targets = Vec::new();
            for target in targets {
                let (interp, exact) = interpolate(target, cprev_src, split_start, split_end);
                // Retrack the truncated entries under the new source
                interpolated.remove(&(cprev_src, tag, target));
                if !exact {
                    interpolated.insert((split_src, tag, interp));
                }
                split_targets.push(interp);
            }
            split_tagged.push((tag, split_targets));
        }
        selected[last] = (split_src, split_tagged);
        selected.push((cnext.0, vec![(tnext, cnext.1.clone())]));
    }

    let start = per_target.iter().flatten().map(|(s, _)| s.offset).min();
    let end = per_target.iter().flatten().map(|(s, _)| s.end()).max();
    if let (Some(start), Some(end)) = (start, end) {
        let holes = fill_source_holes(&mut selected, start, end);
        debug!("selection holes: {holes:?}");
    }

    Selection {
        correlations: selected,
        interpolated,
    }
}

/// Scale a target segment to a source sub-range `[sub_start, sub_end)`
/// of its reference source segment. Returns the scaled segment and
/// whether the interpolation is exact (reference lengths equal, scale
/// one). Rounding is half away from zero.
fn interpolate(
    target: Segment,
    reference: Segment,
    sub_start: usize,
    sub_end: usize,
) -> (Segment, bool) {
    let scale = target.length as f64 / reference.length as f64;
    let d_start = sub_start as i64 - reference.offset as i64;
    let d_end = sub_end as i64 - reference.end() as i64;
    let new_start = target.offset as i64 + (scale * d_start as f64).round() as i64;
    let new_end = target.end() as i64 + (scale * d_end as f64).round() as i64;
    (
        Segment {
            offset: new_start.max(0) as usize,
            length: (new_end - new_start).max(1) as usize,
        },
        target.length == reference.length,
    )
}
