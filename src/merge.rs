//! Per-target merging of chunk matches into long contiguous runs.
//!
//! Chunk matches for one target are linked into an adjacency DAG:
//! an edge joins two matches when their source chunks and their
//! target positions are both near-adjacent (within the tolerance) in
//! the same direction. Longest paths through the DAG become merge
//! candidates, which are packed greedily into non-overlapping source
//! and target coverings. Candidates that conflict with the packing
//! get a second chance as partial fills: their paths are trimmed to
//! the uncovered gaps, possibly merging with neighboring accepted
//! runs. Any source bytes still uncovered afterwards are emitted as
//! holes with empty target lists, so the output always covers the
//! scanned range exactly.

use crate::arm::INSTRUCTION_SIZE;
use crate::segment::Segment;
use bit_vec::BitVec;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Merged correlations for one target: `(source, target matches)`
/// entries sorted by source offset, jointly covering the scan range.
/// Holes carry empty match lists.
pub type MergedCorrelations = Vec<(Segment, Vec<Segment>)>;

/// Node ids index the flattened `(segment, match)` grid.
type NodeId = usize;

/// A longest-path merge candidate: start and end nodes plus the
/// spanned target byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Candidate {
    start: NodeId,
    end: NodeId,
    length: usize,
}

/// Merge adjacent chunk matches for a single target.
///
/// `src_segments` are the source chunks in offset order;
/// `target_matches[i]` lists chunk `i`'s matches in this target,
/// sorted by offset. `tolerance` is the maximum merge gap in
/// instructions.
pub fn merge_correlations(
    src_segments: &[Segment],
    target_matches: &[Vec<Segment>],
    tolerance: usize,
) -> MergedCorrelations {
    debug_assert_eq!(src_segments.len(), target_matches.len());
    let merger = Merger::new(src_segments, target_matches, tolerance);
    let candidates = merger.candidates();
    debug!("{} merge candidates", candidates.len());

    // First pass: pack whole candidates greedily, longest first.
    // Subsets of already-accepted runs are dropped; other conflicts
    // are set aside for the partial pass.
    let mut ranges = RangeSet::default();
    let mut merged: BTreeMap<Segment, Vec<Segment>> = BTreeMap::new();
    let mut conflicting = Vec::new();
    for candidate in candidates {
        let pair = merger.candidate_segments(candidate);
        match ranges.add(pair) {
            AddOutcome::Added(pair) => merged.entry(pair.0).or_default().push(pair.1),
            AddOutcome::Subset => {}
            AddOutcome::Conflict => conflicting.push(candidate),
        }
    }

    // Second pass: let conflicting candidates fill gaps left by the
    // first pass. A single candidate can fill several separated gaps
    // via right truncation.
    for candidate in conflicting {
        let Some(mut path) = merger.find_node_path(candidate) else {
            continue;
        };
        let mut pair = merger.candidate_segments(candidate);
        loop {
            let Some(partial) = merger.add_with_path(&mut ranges, pair, &path) else {
                break;
            };
            // A merged neighbor's entry is superseded by the longer
            // combined segment
            if let Some(left) = partial.merged_left {
                merged.remove(&left);
            }
            if let Some(right) = partial.merged_right {
                merged.remove(&right);
            }
            merged.entry(partial.pair.0).or_default().push(partial.pair.1);
            match partial.rtrunc {
                Some((next_pair, next_path)) => {
                    pair = next_pair;
                    path = next_path;
                }
                None => break,
            }
        }
    }

    let mut result: MergedCorrelations = merged.into_iter().collect();
    if let (Some(first), Some(last)) = (src_segments.first(), src_segments.last()) {
        let holes = fill_source_holes(&mut result, first.offset, last.end());
        debug!("merge holes: {holes:?}");
    }
    result
}

/// Fill uncovered gaps of `[start, end)` with `T::default()` entries.
/// `entries` must be sorted by source offset; it is re-sorted after
/// the holes are appended. Returns the holes that were added.
pub(crate) fn fill_source_holes<T: Default>(
    entries: &mut Vec<(Segment, T)>,
    start: usize,
    end: usize,
) -> Vec<Segment> {
    let mut holes = Vec::new();
    let mut hole_start = start;
    for (seg, _) in entries.iter() {
        if seg.offset > hole_start {
            holes.push(Segment {
                offset: hole_start,
                length: seg.offset - hole_start,
            });
        }
        hole_start = seg.end();
    }
    if end > hole_start {
        holes.push(Segment {
            offset: hole_start,
            length: end - hole_start,
        });
    }
    entries.extend(holes.iter().map(|&hole| (hole, T::default())));
    entries.sort_by_key(|entry| entry.0);
    holes
}

/// Shared state for one target's merge run.
struct Merger<'a> {
    src: &'a [Segment],
    matches: &'a [Vec<Segment>],
    /// Merge tolerance in bytes.
    tol: usize,
    /// Flattened `(segment index, match index)` per node id. Node ids
    /// ascend in `(segment, match)` order, which the candidate sort
    /// relies on.
    nodes: Vec<(usize, usize)>,
    /// Successor edges per node id, ascending by match offset. Each
    /// node links only to its adjacencies at the nearest downstream
    /// source segment that has any.
    edges: Vec<Vec<NodeId>>,
    /// Nodes that are nobody's successor.
    start_nodes: Vec<NodeId>,
}

impl<'a> Merger<'a> {
    fn new(src: &'a [Segment], matches: &'a [Vec<Segment>], tolerance: usize) -> Self {
        let tol = tolerance * INSTRUCTION_SIZE;
        let total: usize = matches.iter().map(Vec::len).sum();
        let mut base = Vec::with_capacity(src.len());
        let mut nodes = Vec::with_capacity(total);
        for (i, segment_matches) in matches.iter().enumerate() {
            base.push(nodes.len());
            for j in 0..segment_matches.len() {
                nodes.push((i, j));
            }
        }

        let mut edges: Vec<Vec<NodeId>> = vec![Vec::new(); total];
        let mut downstream = BitVec::from_elem(total, false);
        let mut start_nodes = Vec::new();
        for i in 0..src.len() {
            let src_end = src[i].end();
            for j in 0..matches[i].len() {
                let node = base[i] + j;
                // Every parent of this node was processed earlier, so
                // an unset downstream bit means it starts a path
                if !downstream[node] {
                    start_nodes.push(node);
                }
                let match_end = matches[i][j].end();
                for i2 in i + 1..src.len() {
                    if src[i2].offset > src_end + tol {
                        break;
                    }
                    let adjacencies: Vec<NodeId> = matches[i2]
                        .iter()
                        .enumerate()
                        .filter(|&(_, m)| {
                            m.offset >= match_end && m.offset - match_end <= tol
                        })
                        .map(|(j2, _)| base[i2] + j2)
                        .collect();
                    if !adjacencies.is_empty() {
                        // Link only to the nearest downstream segment
                        // with adjacencies
                        for &a in &adjacencies {
                            downstream.set(a, true);
                        }
                        edges[node] = adjacencies;
                        break;
                    }
                }
            }
        }

        Merger {
            src,
            matches,
            tol,
            nodes,
            edges,
            start_nodes,
        }
    }

    fn node_segments(&self, node: NodeId) -> (Segment, Segment) {
        let (i, j) = self.nodes[node];
        (self.src[i], self.matches[i][j])
    }

    /// Longest path from each start node, following the highest-offset
    /// successor at every step. Ties on reached length keep every end
    /// node. Sorted longest-first with deterministic tie-breaks.
    fn candidates(&self) -> Vec<Candidate> {
        let mut set = HashSet::new();
        for &start in &self.start_nodes {
            let (_, start_match) = self.node_segments(start);
            let mut best_ends = vec![start];
            let mut max_length = start_match.length;
            let mut end = start;
            // Successors ascend by offset, and all matches of a chunk
            // share its length, so the last edge reaches furthest
            while let Some(&next) = self.edges[end].last() {
                end = next;
                let (_, end_match) = self.node_segments(end);
                let length = end_match.end() - start_match.offset;
                if length > max_length {
                    max_length = length;
                    best_ends.clear();
                    best_ends.push(end);
                } else if length == max_length {
                    best_ends.push(end);
                }
            }
            set.extend(best_ends.into_iter().map(|end| Candidate {
                start,
                end,
                length: max_length,
            }));
        }
        let mut candidates: Vec<Candidate> = set.into_iter().collect();
        candidates.sort_by(|a, b| {
            b.length
                .cmp(&a.length)
                .then(a.start.cmp(&b.start))
                .then(a.end.cmp(&b.end))
        });
        candidates
    }

    /// Source and target spans covered by a candidate, gaps included.
    fn candidate_segments(&self, candidate: Candidate) -> (Segment, Segment) {
        let (src_start, target_start) = self.node_segments(candidate.start);
        let (src_end, target_end) = self.node_segments(candidate.end);
        (
            Segment {
                offset: src_start.offset,
                length: src_end.end() - src_start.offset,
            },
            Segment {
                offset: target_start.offset,
                length: target_end.end() - target_start.offset,
            },
        )
    }

    /// Recover a full node path for a candidate, preferring leftmost
    /// successors. The leftmost path tends to be more granular than
    /// the rightmost one taken during candidate discovery, which
    /// matters when the path is split across gaps.
    fn find_node_path(&self, candidate: Candidate) -> Option<Vec<NodeId>> {
        if candidate.start == candidate.end {
            return Some(vec![candidate.start]);
        }
        let mut ancestors: HashMap<NodeId, NodeId> = HashMap::new();
        let mut stack = vec![candidate.start];
        while let Some(end) = stack.pop() {
            for &next in self.edges[end].iter().rev() {
                if next == candidate.end {
                    let mut path = vec![next, end];
                    let mut parent = end;
                    while let Some(&ancestor) = ancestors.get(&parent) {
                        path.push(ancestor);
                        parent = ancestor;
                    }
                    path.reverse();
                    return Some(path);
                }
                if ancestors.contains_key(&next) {
                    continue;
                }
                ancestors.insert(next, end);
                stack.push(next);
            }
        }
        None
    }

    /// Add a candidate with its node path, allowing partial fills.
    /// Returns `None` when nothing could be added (subset or no gap).
    fn add_with_path(
        &self,
        ranges: &mut RangeSet,
        pair: (Segment, Segment),
        path: &[NodeId],
    ) -> Option<PartialAdd> {
        debug_assert!(path
            .first()
            .map_or(false, |&node| self.node_segments(node).0.offset == pair.0.offset));
        debug_assert!(path
            .last()
            .map_or(false, |&node| self.node_segments(node).0.end() == pair.0.end()));

        let src_check = check_covering(&ranges.src, pair.0);
        let src_dup =
            src_check.insert_at < ranges.src.len() && ranges.src[src_check.insert_at] == pair.0;
        let target_check = check_covering(&ranges.target, pair.1);
        if (src_check.valid || src_dup) && target_check.valid {
            if !src_dup {
                ranges.src.insert(src_check.insert_at, pair.0);
            }
            ranges.target.insert(target_check.insert_at, pair.1);
            return Some(PartialAdd {
                pair,
                merged_left: None,
                merged_right: None,
                rtrunc: None,
            });
        }
        let is_subset = src_check.subset_left
            || src_check.subset_right
            || target_check.subset_left
            || target_check.subset_right;
        if is_subset {
            return None;
        }
        self.add_partial(ranges, path, src_check.insert_at, target_check.insert_at)
    }

    /// Trim a conflicting path to the gap at the insert points, expand
    /// it back over unmatched chunks, and splice it into the coverings,
    /// merging with near-adjacent neighbors where the tolerance allows.
    fn add_partial(
        &self,
        ranges: &mut RangeSet,
        path: &[NodeId],
        src_insert_at: usize,
        target_insert_at: usize,
    ) -> Option<PartialAdd> {
        let left_src = src_insert_at.checked_sub(1).map(|k| ranges.src[k]);
        let left_target = target_insert_at.checked_sub(1).map(|k| ranges.target[k]);
        let right_src = ranges.src.get(src_insert_at).copied();
        let right_target = ranges.target.get(target_insert_at).copied();

        // Trim from the left until both endpoints clear the neighbors
        let mut found = None;
        for (k, &node) in path.iter().enumerate() {
            let (src_seg, target_seg) = self.node_segments(node);
            if left_src.map_or(true, |ls| ls.end() <= src_seg.offset)
                && left_target.map_or(true, |lt| lt.end() <= target_seg.offset)
            {
                found = Some((k, src_seg, target_seg));
                break;
            }
        }
        let (kstart, src_start, target_start) = found?;
        let (mut istart, _) = self.nodes[path[kstart]];

        // Trim from the right
        let mut found = None;
        for (k, &node) in path.iter().enumerate().rev() {
            let (src_seg, target_seg) = self.node_segments(node);
            if right_src.map_or(true, |rs| src_seg.end() <= rs.offset)
                && right_target.map_or(true, |rt| target_seg.end() <= rt.offset)
            {
                found = Some((k, src_seg, target_seg));
                break;
            }
        }
        let (kend, src_end, target_end) = found?;
        let (iend, _) = self.nodes[path[kend]];

        let mut partial_src_start = src_start.offset as i64;
        let mut partial_target_start = target_start.offset as i64;
        let mut partial_src_end = src_end.end() as i64;
        let mut partial_target_end = target_end.end() as i64;

        // Expand back over unmatched chunks between the dropped and
        // kept keyframes, shifting the target bound by the same delta
        if kstart > 0 {
            let (prev_i, _) = self.nodes[path[kstart - 1]];
            for i in prev_i + 1..=istart {
                let src_seg = self.src[i];
                if left_src.map_or(true, |ls| ls.end() <= src_seg.offset) {
                    let delta = partial_src_start - src_seg.offset as i64;
                    partial_src_start = src_seg.offset as i64;
                    partial_target_start -= delta;
                    istart = i;
                    break;
                }
            }
        }
        if kend + 1 < path.len() {
            let (next_i, _) = self.nodes[path[kend + 1]];
            for i in iend.max(istart)..next_i {
                let src_seg = self.src[i];
                if right_src.map_or(true, |rs| src_seg.end() <= rs.offset) {
                    let delta = src_seg.end() as i64 - partial_src_end;
                    partial_src_end = src_seg.end() as i64;
                    partial_target_end += delta;
                    break;
                }
            }
        }

        if !(0 <= partial_src_start && partial_src_start < partial_src_end)
            || !(0 <= partial_target_start && partial_target_start < partial_target_end)
        {
            return None;
        }
        let mut partial_src = Segment {
            offset: partial_src_start as usize,
            length: (partial_src_end - partial_src_start) as usize,
        };
        let mut partial_target = Segment {
            offset: partial_target_start as usize,
            length: (partial_target_end - partial_target_start) as usize,
        };

        // The part of the path beyond the filled gap is retried by the
        // caller against the next gap
        let rtrunc_path = &path[kend + 1..];
        let rtrunc = match (rtrunc_path.first(), rtrunc_path.last()) {
            (Some(&first), Some(&last)) => {
                let (first_src, first_target) = self.node_segments(first);
                let (last_src, last_target) = self.node_segments(last);
                Some((
                    (
                        Segment {
                            offset: first_src.offset,
                            length: last_src.end() - first_src.offset,
                        },
                        Segment {
                            offset: first_target.offset,
                            length: last_target.end() - first_target.offset,
                        },
                    ),
                    rtrunc_path.to_vec(),
                ))
            }
            _ => None,
        };

        // Merge with neighbors where the gap is within tolerance. The
        // source gap is always bounded; the target gap only when a
        // target neighbor exists.
        let mut src_merge_left = None;
        let mut target_merge_left = None;
        let mut src_merge_right = None;
        let mut target_merge_right = None;
        if let Some(ls) = left_src {
            let src_ok =
                partial_src.offset >= ls.end() && partial_src.offset - ls.end() <= self.tol;
            let target_ok = left_target.map_or(true, |lt| {
                partial_target.offset >= lt.end() && partial_target.offset - lt.end() <= self.tol
            });
            if src_ok && target_ok {
                src_merge_left = Some(ls);
                partial_src = Segment {
                    offset: ls.offset,
                    length: partial_src.end() - ls.offset,
                };
                if let Some(lt) = left_target {
                    target_merge_left = Some(lt);
                    partial_target = Segment {
                        offset: lt.offset,
                        length: partial_target.end() - lt.offset,
                    };
                }
            }
        }
        if let Some(rs) = right_src {
            let src_ok =
                rs.offset >= partial_src.end() && rs.offset - partial_src.end() <= self.tol;
            let target_ok = right_target.map_or(true, |rt| {
                rt.offset >= partial_target.end() && rt.offset - partial_target.end() <= self.tol
            });
            if src_ok && target_ok {
                src_merge_right = Some(rs);
                partial_src = Segment {
                    offset: partial_src.offset,
                    length: rs.end() - partial_src.offset,
                };
                if let Some(rt) = right_target {
                    target_merge_right = Some(rt);
                    partial_target = Segment {
                        offset: partial_target.offset,
                        length: rt.end() - partial_target.offset,
                    };
                }
            }
        }

        // Splice into the coverings; they must stay in sync with the
        // correlation map maintained by the caller
        if src_merge_left.is_some() {
            ranges.src[src_insert_at - 1] = partial_src;
            if src_merge_right.is_some() {
                ranges.src.remove(src_insert_at);
            }
            if target_merge_left.is_some() {
                ranges.target[target_insert_at - 1] = partial_target;
                if target_merge_right.is_some() {
                    ranges.target.remove(target_insert_at);
                }
            } else {
                ranges.target.insert(target_insert_at, partial_target);
            }
        } else if src_merge_right.is_some() {
            ranges.src[src_insert_at] = partial_src;
            if target_merge_right.is_some() {
                ranges.target[target_insert_at] = partial_target;
            } else {
                ranges.target.insert(target_insert_at, partial_target);
            }
        } else {
            ranges.src.insert(src_insert_at, partial_src);
            ranges.target.insert(target_insert_at, partial_target);
        }

        Some(PartialAdd {
            pair: (partial_src, partial_target),
            merged_left: src_merge_left,
            merged_right: src_merge_right,
            rtrunc,
        })
    }
}

/// Result of a successful (possibly partial) add.
struct PartialAdd {
    pair: (Segment, Segment),
    /// Source neighbor consumed by a left merge; its correlation entry
    /// is superseded.
    merged_left: Option<Segment>,
    /// Source neighbor consumed by a right merge.
    merged_right: Option<Segment>,
    /// Remaining right part of the path, to retry on the next gap.
    rtrunc: Option<((Segment, Segment), Vec<NodeId>)>,
}

/// Accepted, non-overlapping source and target coverings, each sorted
/// by `(offset, length)`.
#[derive(Default)]
struct RangeSet {
    src: Vec<Segment>,
    target: Vec<Segment>,
}

enum AddOutcome {
    Added((Segment, Segment)),
    Subset,
    Conflict,
}

impl RangeSet {
    /// Add a whole candidate pair; both sides must be strictly
    /// non-overlapping with the current coverings. A source segment
    /// equal to an accepted one is allowed (its target is appended).
    fn add(&mut self, pair: (Segment, Segment)) -> AddOutcome {
        let src_check = check_covering(&self.src, pair.0);
        let src_dup =
            src_check.insert_at < self.src.len() && self.src[src_check.insert_at] == pair.0;
        let target_check = check_covering(&self.target, pair.1);
        if (src_check.valid || src_dup) && target_check.valid {
            if !src_dup {
                self.src.insert(src_check.insert_at, pair.0);
            }
            self.target.insert(target_check.insert_at, pair.1);
            return AddOutcome::Added(pair);
        }
        if src_check.subset_left
            || src_check.subset_right
            || target_check.subset_left
            || target_check.subset_right
        {
            AddOutcome::Subset
        } else {
            AddOutcome::Conflict
        }
    }
}

struct CoverCheck {
    valid: bool,
    subset_left: bool,
    subset_right: bool,
    insert_at: usize,
}

fn check_covering(covering: &[Segment], segment: Segment) -> CoverCheck {
    let insert_at = covering.partition_point(|s| *s < segment);
    let overlaps_right = insert_at < covering.len() && segment.end() > covering[insert_at].offset;
    let overlaps_left = insert_at >= 1 && covering[insert_at - 1].end() > segment.offset;
    if overlaps_right || overlaps_left {
        CoverCheck {
            valid: false,
            subset_left: overlaps_left && covering[insert_at - 1].end() >= segment.end(),
            subset_right: overlaps_right && segment.offset >= covering[insert_at].offset,
            insert_at,
        }
    } else {
        CoverCheck {
            valid: true,
            subset_left: false,
            subset_right: false,
            insert_at,
        }
    }
}
