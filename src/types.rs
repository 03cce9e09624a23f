//! Option types shared across the correlation services.

use bitflags::bitflags;
use regex::Regex;

/// Controls which instruction offset fields are masked out when
/// compiling assembly search patterns.
///
/// `bl` offsets are always masked; these flags widen the masking to
/// plain branches and to load/store immediates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MaskOptions {
    /// Allow mismatching immediate offsets on `ldr`/`str` family
    /// instructions (addressing modes 2 and 3).
    pub ignore_ldr_str_offset: bool,
    /// Allow mismatching offsets on plain `b` instructions.
    pub ignore_b_offset: bool,
}

/// Options for the chunked correlator and merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelateOptions {
    /// Number of instructions per search chunk.
    pub chunk_size: usize,
    /// Maximum gap, in instructions, between the end of one matched
    /// region and the start of the next for them to be merged.
    pub tolerance: usize,
    /// Offset masking applied when compiling chunk patterns.
    pub mask: MaskOptions,
}

impl CorrelateOptions {
    /// Default options: 8-instruction chunks, 16-instruction
    /// tolerance, branch and load/store offsets masked.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for CorrelateOptions {
    fn default() -> Self {
        CorrelateOptions {
            chunk_size: 8,
            tolerance: 16,
            mask: MaskOptions {
                ignore_ldr_str_offset: true,
                ignore_b_offset: true,
            },
        }
    }
}

bitflags! {
    /// Set of symbol data types eligible as correlation sources.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolTypes: u8 {
        /// ARM code symbols.
        const ARM = 1 << 0;
        /// Thumb code symbols.
        const THUMB = 1 << 1;
        /// Data symbols.
        const DATA = 1 << 2;
    }
}

impl Default for SymbolTypes {
    fn default() -> Self {
        SymbolTypes::all()
    }
}

/// Options for the symbol correlator.
///
/// The regex filters are matched against entire symbol names; callers
/// are expected to anchor the expressions accordingly.
#[derive(Debug, Clone)]
pub struct SymbolMatchOptions {
    /// Skip veneer function symbols in the source.
    pub no_veneers: bool,
    /// Drop matches whose literal pools did not compare equal.
    pub match_data_pools: bool,
    /// Drop matches whose length differs from the occupying target
    /// symbol's length.
    pub match_length: bool,
    /// Offset masking applied to ARM segments.
    pub mask: MaskOptions,
    /// Skip source symbols shorter than this many bytes.
    pub min_length: u32,
    /// Source symbol types eligible for correlation.
    pub source_types: SymbolTypes,
    /// Source symbols whose names match are skipped.
    pub source_ignore: Option<Regex>,
    /// When set, a match that overrides a pre-existing, differently
    /// named target symbol is kept only if that symbol's name matches.
    pub target_filter: Option<Regex>,
}

impl SymbolMatchOptions {
    /// Default options: all types, strict data pools and lengths.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for SymbolMatchOptions {
    fn default() -> Self {
        SymbolMatchOptions {
            no_veneers: false,
            match_data_pools: true,
            match_length: true,
            mask: MaskOptions::default(),
            min_length: 0,
            source_types: SymbolTypes::all(),
            source_ignore: None,
            target_filter: None,
        }
    }
}
