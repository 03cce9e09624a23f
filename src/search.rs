//! Pattern search over target buffers with per-target result caching.
//!
//! A [`TargetSearcher`] wraps one target buffer for the duration of a
//! run. Results are cached by pattern content, so duplicated chunks
//! (common at small chunk sizes) are searched once per target. Caches
//! are never shared across targets.

use crate::pattern::Pattern;
use crate::segment::{Segment, SourceSegment};
use crate::types::MaskOptions;
use crate::Result;
use std::collections::HashMap;
use tracing::debug;

/// A target buffer plus its lazily populated search cache.
pub struct TargetSearcher<'a> {
    buffer: &'a [u8],
    cache: HashMap<Pattern, Vec<Segment>>,
}

impl<'a> TargetSearcher<'a> {
    /// Wraps a target buffer with an empty cache.
    pub fn new(buffer: &'a [u8]) -> Self {
        TargetSearcher {
            buffer,
            cache: HashMap::new(),
        }
    }

    /// The wrapped buffer.
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// All non-overlapping matches of `pattern` in this target, in
    /// order. Cached by pattern content; an empty result is not a
    /// failure and is cached like any other.
    pub fn find_all(&mut self, pattern: &Pattern) -> &[Segment] {
        if !self.cache.contains_key(pattern) {
            let matches = pattern.find_all(self.buffer);
            self.cache.insert(pattern.clone(), matches);
        }
        &self.cache[pattern]
    }
}

/// Search every target for every source segment.
///
/// Returns matches indexed `[segment][target][match]`, the layout the
/// search tool reports in. Patterns are compiled once per segment and
/// reused across targets.
pub fn search_segments<B: AsRef<[u8]>>(
    source: &[u8],
    segments: &[SourceSegment],
    targets: &[B],
    mask: MaskOptions,
) -> Result<Vec<Vec<Vec<Segment>>>> {
    let patterns = segments
        .iter()
        .map(|seg| seg.pattern(source, mask))
        .collect::<Result<Vec<_>>>()?;
    for (seg, pattern) in segments.iter().zip(&patterns) {
        debug!("{seg} pattern: {pattern}");
    }

    let mut results: Vec<Vec<Vec<Segment>>> = vec![Vec::new(); segments.len()];
    for target in targets {
        let mut searcher = TargetSearcher::new(target.as_ref());
        for (seg_matches, pattern) in results.iter_mut().zip(&patterns) {
            seg_matches.push(searcher.find_all(pattern).to_vec());
        }
    }
    Ok(results)
}
