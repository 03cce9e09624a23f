//! Report rendering for the correlation tools.
//!
//! Human output mirrors the interactive reports the tools print;
//! the `*Dump` types are the JSON-serializable equivalents.

use crate::correlate::ChunkGrid;
use crate::merge::MergedCorrelations;
use crate::segment::{Segment, SegmentKind, SourceSegment};
use crate::select::Selection;
use crate::symbols::CorrelatedSymbol;
use crate::xmap::MapSymbol;
use serde::Serialize;
use std::fmt::Write;

const GAP_SEPARATOR: &str = "********************************";

/// `[0x0..0x10, 0x20..0x30]`-style segment list.
pub fn segment_list(segments: &[Segment]) -> String {
    let items: Vec<String> = segments.iter().map(Segment::to_string).collect();
    format!("[{}]", items.join(", "))
}

/// Search-tool report: matches grouped by source segment and target.
pub fn search_report(
    source: &str,
    segments: &[SourceSegment],
    targets: &[String],
    results: &[Vec<Vec<Segment>>],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "*** SOURCE FILE: {source} ***");
    for (segment, segment_matches) in segments.iter().zip(results) {
        let _ = writeln!(out, "== Matches for {segment} ==");
        for (target, matches) in targets.iter().zip(segment_matches) {
            for found in matches {
                let _ = writeln!(out, "  - [{target}]: {found}");
            }
        }
    }
    out
}

/// Raw chunk-grid report. Below verbosity 3, uncorrelated stretches
/// collapse into a single separator line.
pub fn chunk_report(grid: &ChunkGrid, targets: &[String], verbosity: u8) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== Raw chunk correlations ==");
    let mut printed_separator = false;
    for (i, segment) in grid.segments.iter().enumerate() {
        let correlated = grid.matches.iter().any(|matches| !matches[i].is_empty());
        if verbosity >= 3 || correlated {
            let _ = writeln!(out, "{segment}");
            printed_separator = false;
            for (target, matches) in targets.iter().zip(&grid.matches) {
                if !matches[i].is_empty() {
                    let _ = writeln!(out, "  - {target}: {}", segment_list(&matches[i]));
                }
            }
        } else if !printed_separator {
            let _ = writeln!(out, "{GAP_SEPARATOR}");
            printed_separator = true;
        }
    }
    out
}

/// Per-target merged correlation report.
pub fn merged_report(target: &str, merged: &MergedCorrelations, verbosity: u8) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== Merged chunk correlations ({target}) ==");
    let mut printed_separator = false;
    for (source, matches) in merged {
        if verbosity >= 3 || !matches.is_empty() {
            let _ = writeln!(out, "{source} -> {}", segment_list(matches));
            printed_separator = false;
        } else if !printed_separator {
            let _ = writeln!(out, "{GAP_SEPARATOR}");
            printed_separator = true;
        }
    }
    out
}

/// Final cross-target report with interpolation annotations.
pub fn selection_report(selection: &Selection, targets: &[String], verbosity: u8) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== Inferred correlations ==");
    let mut printed_separator = false;
    for (source, tagged) in &selection.correlations {
        let correlated = tagged.iter().any(|(_, segments)| !segments.is_empty());
        if verbosity >= 3 || correlated {
            let _ = writeln!(out, "{source}");
            printed_separator = false;
            for (tag, segments) in tagged {
                if segments.is_empty() {
                    continue;
                }
                let rendered: Vec<String> = segments
                    .iter()
                    .map(|segment| {
                        if selection.interpolated.contains(&(*source, *tag, *segment)) {
                            format!("{segment} (interpolated)")
                        } else {
                            segment.to_string()
                        }
                    })
                    .collect();
                let _ = writeln!(out, "  - {}: [{}]", targets[*tag], rendered.join(", "));
            }
        } else if !printed_separator {
            let _ = writeln!(out, "{GAP_SEPARATOR}");
            printed_separator = true;
        }
    }
    out
}

/// Percentage of the scanned source covered by correlated segments.
pub fn coverage_percent(selection: &Selection, origin: usize) -> f64 {
    let mut min_offset = origin;
    let mut max_offset = origin;
    let mut covered = 0usize;
    for (source, tagged) in &selection.correlations {
        min_offset = min_offset.min(source.offset);
        max_offset = max_offset.max(source.end());
        if tagged.iter().any(|(_, segments)| !segments.is_empty()) {
            covered += source.length;
        }
    }
    if max_offset > min_offset {
        100.0 * covered as f64 / (max_offset - min_offset) as f64
    } else {
        0.0
    }
}

/// `name @ 0xADDR / N bytes [source]`.
pub fn symbol_with_length(symbol: &MapSymbol) -> String {
    let mut out = format!(
        "{} @ {:#X} / {} bytes",
        symbol.name,
        symbol.address(),
        symbol.length()
    );
    if !symbol.source.is_empty() {
        let _ = write!(out, " [{}]", symbol.source);
    }
    out
}

/// Symbol-correlation report: one line per source symbol.
pub fn symbol_report(correlations: &[(MapSymbol, Vec<CorrelatedSymbol>)]) -> String {
    let mut out = String::new();
    for (symbol, matches) in correlations {
        let rendered: Vec<String> = matches.iter().map(CorrelatedSymbol::to_string).collect();
        let mut target_str = rendered.join(", ");
        if matches.len() > 1 {
            target_str = format!("({}) {target_str}", matches.len());
        }
        let _ = writeln!(out, "{} -> {target_str}", symbol_with_length(symbol));
    }
    out
}

/// JSON form of the search report.
#[derive(Debug, Serialize)]
pub struct SearchDump {
    /// Source file name.
    pub source: String,
    /// One entry per requested segment.
    pub segments: Vec<SearchEntry>,
}

/// Matches for one searched segment.
#[derive(Debug, Serialize)]
pub struct SearchEntry {
    /// Segment interpretation.
    pub kind: SegmentKind,
    /// The searched source range.
    pub segment: Segment,
    /// Matches per target.
    pub matches: Vec<TargetSegments>,
}

/// Segments found in one target.
#[derive(Debug, Serialize)]
pub struct TargetSegments {
    /// Target file name.
    pub target: String,
    /// Match locations.
    pub segments: Vec<Segment>,
}

/// Build the JSON search report.
pub fn search_dump(
    source: &str,
    segments: &[SourceSegment],
    targets: &[String],
    results: &[Vec<Vec<Segment>>],
) -> SearchDump {
    SearchDump {
        source: source.to_string(),
        segments: segments
            .iter()
            .zip(results)
            .map(|(segment, segment_matches)| SearchEntry {
                kind: segment.kind,
                segment: segment.segment,
                matches: targets
                    .iter()
                    .zip(segment_matches)
                    .map(|(target, matches)| TargetSegments {
                        target: target.clone(),
                        segments: matches.clone(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// JSON form of the final correlation report.
#[derive(Debug, Serialize)]
pub struct CorrelationDump {
    /// Source file name.
    pub source: String,
    /// Source coverage percentage.
    pub coverage_percent: f64,
    /// Selected correlations in source order.
    pub correlations: Vec<CorrelationEntry>,
}

/// One selected source segment and its tagged matches.
#[derive(Debug, Serialize)]
pub struct CorrelationEntry {
    /// Source range.
    pub source: Segment,
    /// Matches grouped by target.
    pub matches: Vec<TaggedSegments>,
}

/// Matches for one target within a correlation entry.
#[derive(Debug, Serialize)]
pub struct TaggedSegments {
    /// Target file name.
    pub target: String,
    /// Match locations with interpolation flags.
    pub segments: Vec<MatchedSegment>,
}

/// A single matched target range.
#[derive(Debug, Serialize)]
pub struct MatchedSegment {
    /// Target range.
    pub segment: Segment,
    /// Whether the range was interpolated rather than verified.
    pub interpolated: bool,
}

/// Build the JSON correlation report.
pub fn correlation_dump(
    source: &str,
    targets: &[String],
    selection: &Selection,
    origin: usize,
) -> CorrelationDump {
    CorrelationDump {
        source: source.to_string(),
        coverage_percent: coverage_percent(selection, origin),
        correlations: selection
            .correlations
            .iter()
            .map(|(segment, tagged)| CorrelationEntry {
                source: *segment,
                matches: tagged
                    .iter()
                    .map(|(tag, segments)| TaggedSegments {
                        target: targets[*tag].clone(),
                        segments: segments
                            .iter()
                            .map(|found| MatchedSegment {
                                segment: *found,
                                interpolated: selection
                                    .interpolated
                                    .contains(&(*segment, *tag, *found)),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// JSON form of the symbol report.
#[derive(Debug, Serialize)]
pub struct SymbolDump {
    /// One entry per correlated source symbol.
    pub correlations: Vec<SymbolEntry>,
}

/// One source symbol and its target matches.
#[derive(Debug, Serialize)]
pub struct SymbolEntry {
    /// The source symbol.
    pub symbol: MapSymbol,
    /// Surviving target matches.
    pub matches: Vec<CorrelatedSymbol>,
}

/// Build the JSON symbol report.
pub fn symbol_dump(correlations: &[(MapSymbol, Vec<CorrelatedSymbol>)]) -> SymbolDump {
    SymbolDump {
        correlations: correlations
            .iter()
            .map(|(symbol, matches)| SymbolEntry {
                symbol: symbol.clone(),
                matches: matches.clone(),
            })
            .collect(),
    }
}
