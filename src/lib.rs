//! Cross-binary ARMv5 code correlation.
//!
//! This library locates equivalent-but-relocated code and data across
//! related ARMv5 binaries (typically regional releases of the same
//! program), tolerating the offset fields of position-dependent
//! instructions. Three services build on each other:
//!
//! - **Segment search** ([`search_segments`]): fuzzy byte-pattern
//!   search matching instruction sequences up to masked offsets.
//! - **Chunked correlation** ([`correlate`]): break a source region
//!   into fixed-size chunks, match them in every target, merge
//!   near-adjacent matches per target, and select the best coverage
//!   across targets.
//! - **Symbol correlation** ([`correlate_symbols`]): match whole
//!   symbols between xMAP-annotated binaries, segment by segment,
//!   with literal-pool tolerance.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use arm5_correlate::{correlate, CorrelateOptions};
//!
//! fn main() -> arm5_correlate::Result<()> {
//!     let source = std::fs::read("combined.bin")?;
//!     let targets = vec![std::fs::read("eu.bin")?, std::fs::read("na.bin")?];
//!     let outcome = correlate(&source, &targets, 0, None, &CorrelateOptions::new())?;
//!     for (src, tagged) in &outcome.selection.correlations {
//!         println!("{src}: {} target(s)", tagged.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Results are deterministic: they depend only on the input bytes,
//! the scan range, and the options. The engine is conservative by
//! design; it reports one match or none rather than guessing.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod arm;
pub mod correlate;
pub mod error;
pub mod formatter;
pub mod merge;
pub mod pattern;
pub mod search;
pub mod segment;
pub mod select;
pub mod symbols;
pub mod types;
pub mod xmap;

pub use correlate::{correlate_chunks, ChunkGrid};
pub use error::{CorrelateError, Result};
pub use pattern::{Pattern, PatternAtom};
pub use search::{search_segments, TargetSearcher};
pub use segment::{Segment, SegmentKind, SourceSegment};
pub use select::{select_correlations, Selection};
pub use symbols::{correlate_symbols, CorrelatedSymbol, MappedBinary};
pub use types::{CorrelateOptions, MaskOptions, SymbolMatchOptions, SymbolTypes};
pub use xmap::{MapSymbol, SymbolSegment, SymbolType, XmapSection};

use merge::{merge_correlations, MergedCorrelations};
use std::path::Path;

/// Everything a chunk-correlation run produces, phase by phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationOutcome {
    /// Raw per-chunk match grid.
    pub chunks: ChunkGrid,
    /// Merged correlations, one list per target.
    pub merged: Vec<MergedCorrelations>,
    /// Cross-target selection with interpolation tracking.
    pub selection: Selection,
}

/// Correlate a source region against in-memory target buffers.
///
/// Runs the full pipeline: chunking and search, per-target merging,
/// and cross-target selection. `offset`/`length` bound the source
/// scan range; `length` defaults to the rest of the buffer.
pub fn correlate<B: AsRef<[u8]>>(
    source: &[u8],
    targets: &[B],
    offset: usize,
    length: Option<usize>,
    options: &CorrelateOptions,
) -> Result<CorrelationOutcome> {
    let chunks = correlate_chunks(
        source,
        offset,
        length,
        options.chunk_size,
        targets,
        options.mask,
    )?;
    let merged: Vec<MergedCorrelations> = chunks
        .matches
        .iter()
        .map(|matches| merge_correlations(&chunks.segments, matches, options.tolerance))
        .collect();
    let selection = select_correlations(&merged);
    Ok(CorrelationOutcome {
        chunks,
        merged,
        selection,
    })
}

/// Correlate a source file against target files.
///
/// Every file is read fully into memory once; see [`correlate`].
pub fn correlate_files(
    source: impl AsRef<Path>,
    targets: &[impl AsRef<Path>],
    offset: usize,
    length: Option<usize>,
    options: &CorrelateOptions,
) -> Result<CorrelationOutcome> {
    let source = std::fs::read(source)?;
    let targets = targets
        .iter()
        .map(std::fs::read)
        .collect::<std::io::Result<Vec<_>>>()?;
    correlate(&source, &targets, offset, length, options)
}
