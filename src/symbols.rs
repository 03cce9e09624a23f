//! Symbol-aware correlation between xMAP-annotated binaries.
//!
//! A [`MappedBinary`] couples a binary's bytes with the symbols parsed
//! from its xMAP section and an address index over them. The
//! correlator walks every eligible source symbol segment by segment:
//! the first segment seeds candidates from every match in the target,
//! and each later segment must match anchored at a candidate's cursor
//! to keep it alive. Literal pools following code are allowed to
//! mismatch, which is recorded on the candidate and filtered
//! afterwards per the options.

use crate::pattern::Pattern;
use crate::segment::SourceSegment;
use crate::types::{MaskOptions, SymbolMatchOptions, SymbolTypes};
use crate::xmap::{self, MapSymbol, SymbolSegment, SymbolType};
use crate::{CorrelateError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Veneer code bytes: `ldr r12, [pc, #0]` / `bx r12`. The loaded
/// target address sits in the 4-byte data segment that follows.
const VENEER_CODE: [u8; 8] = [0x00, 0xC0, 0x9F, 0xE5, 0x1C, 0xFF, 0x2F, 0xE1];

/// A binary annotated with symbols from an xMAP file.
pub struct MappedBinary {
    name: String,
    contents: Vec<u8>,
    xmap: Option<XmapInfo>,
    load_address: u32,
    symbols: Vec<MapSymbol>,
    /// Symbol addresses sorted ascending, with their symbol indices.
    sorted_addresses: Vec<(u32, usize)>,
    /// Exact-address lookup; on duplicates the later symbol wins.
    addr_index: HashMap<u32, usize>,
}

#[derive(Debug, Clone)]
struct XmapInfo {
    name: String,
    section: String,
}

impl MappedBinary {
    /// Load a bare binary with no symbol information.
    pub fn load<P: AsRef<Path>>(binary: P) -> Result<Self> {
        let binary = binary.as_ref();
        let contents = std::fs::read(binary)?;
        Ok(Self::from_parts(
            file_name(binary),
            contents,
            0,
            Vec::new(),
        ))
    }

    /// Load a binary along with one section of its xMAP file.
    pub fn load_with_xmap(
        binary: impl AsRef<Path>,
        map: impl AsRef<Path>,
        section: &str,
    ) -> Result<Self> {
        let binary = binary.as_ref();
        let map = map.as_ref();
        let contents = std::fs::read(binary)?;
        let parsed = xmap::parse_file(map, section)?;
        let mut mapped = Self::from_parts(
            file_name(binary),
            contents,
            parsed.load_address,
            parsed.symbols,
        );
        mapped.xmap = Some(XmapInfo {
            name: file_name(map),
            section: section.to_string(),
        });
        Ok(mapped)
    }

    /// Assemble a mapped binary from in-memory parts.
    pub fn from_parts(
        name: impl Into<String>,
        contents: Vec<u8>,
        load_address: u32,
        symbols: Vec<MapSymbol>,
    ) -> Self {
        let mut sorted_addresses: Vec<(u32, usize)> = symbols
            .iter()
            .enumerate()
            .map(|(i, sym)| (sym.address(), i))
            .collect();
        sorted_addresses.sort_by_key(|&(address, _)| address);
        let addr_index = symbols
            .iter()
            .enumerate()
            .map(|(i, sym)| (sym.address(), i))
            .collect();
        MappedBinary {
            name: name.into(),
            contents,
            xmap: None,
            load_address,
            symbols,
            sorted_addresses,
            addr_index,
        }
    }

    /// Binary bytes.
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Symbols in xMAP order.
    pub fn symbols(&self) -> &[MapSymbol] {
        &self.symbols
    }

    /// Section load address (zero without an xMAP).
    pub fn load_address(&self) -> u32 {
        self.load_address
    }

    /// File-relative offset of an absolute address, if the address is
    /// at or above the load address.
    pub fn to_relative(&self, address: u32) -> Option<usize> {
        address
            .checked_sub(self.load_address)
            .map(|offset| offset as usize)
    }

    /// Absolute address of a file-relative offset.
    pub fn to_absolute(&self, offset: usize) -> u32 {
        self.load_address + offset as u32
    }

    /// Bytes of a symbol segment.
    pub fn segment_bytes(&self, segment: &SymbolSegment) -> Result<&[u8]> {
        let offset = self
            .to_relative(segment.address)
            .ok_or(CorrelateError::SegmentOutOfBounds {
                offset: segment.address as usize,
                end: segment.end() as usize,
                size: self.contents.len(),
            })?;
        self.contents
            .get(offset..offset + segment.length as usize)
            .ok_or(CorrelateError::SegmentOutOfBounds {
                offset,
                end: offset + segment.length as usize,
                size: self.contents.len(),
            })
    }

    /// Search pattern for a symbol segment. ARM segments get offset
    /// masking; Thumb has no masking support yet and is matched
    /// byte-exact like data.
    pub fn segment_pattern(&self, segment: &SymbolSegment, mask: MaskOptions) -> Result<Pattern> {
        match segment.kind {
            SymbolType::Arm => {
                let offset =
                    self.to_relative(segment.address)
                        .ok_or(CorrelateError::SegmentOutOfBounds {
                            offset: segment.address as usize,
                            end: segment.end() as usize,
                            size: self.contents.len(),
                        })?;
                SourceSegment::asm(offset, segment.length as usize)?
                    .pattern(&self.contents, mask)
            }
            SymbolType::Thumb | SymbolType::Data => {
                Ok(Pattern::literal(self.segment_bytes(segment)?))
            }
        }
    }

    /// Whether a symbol is a veneer: an 8-byte ARM trampoline followed
    /// by a 4-byte address pool.
    pub fn is_veneer(&self, symbol: &MapSymbol) -> bool {
        let [code, pool] = symbol.segments.as_slice() else {
            return false;
        };
        pool.kind == SymbolType::Data
            && pool.length == 4
            && code.kind == SymbolType::Arm
            && code.length == 8
            && self.segment_bytes(code).map_or(false, |bytes| bytes == &VENEER_CODE[..])
    }

    /// The symbol starting exactly at `address`, if any.
    pub fn symbol_at(&self, address: u32) -> Option<&MapSymbol> {
        self.addr_index.get(&address).map(|&i| &self.symbols[i])
    }

    /// The symbol occupying `address`, if any. Zero-length symbols
    /// occupy exactly their own address.
    pub fn symbol_occupying(&self, address: u32) -> Option<&MapSymbol> {
        if let Some(symbol) = self.symbol_at(address) {
            return Some(symbol);
        }
        let right = self
            .sorted_addresses
            .partition_point(|&(addr, _)| addr <= address);
        let &(_, index) = self.sorted_addresses.get(right.checked_sub(1)?)?;
        let symbol = &self.symbols[index];
        if address < symbol.end() || address == symbol.address() {
            Some(symbol)
        } else {
            None
        }
    }
}

impl fmt::Display for MappedBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.contents.len())?;
        if let Some(xmap) = &self.xmap {
            write!(
                f,
                ", {}[{} @ {:#X}] ({} symbols)",
                xmap.name,
                xmap.section,
                self.load_address,
                self.symbols.len()
            )?;
        }
        Ok(())
    }
}

/// A target location correlated to a source symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelatedSymbol {
    /// Absolute start address in the target.
    pub address: u32,
    /// Matched length in bytes.
    pub length: u32,
    /// The pre-existing target symbol occupying the address, when the
    /// match does not land in unmapped space.
    pub symbol: Option<MapSymbol>,
    /// One or more literal pool segments were accepted without
    /// comparing equal.
    pub data_pool_mismatch: bool,
}

impl CorrelatedSymbol {
    /// Whether the match length disagrees with the occupying symbol.
    pub fn length_mismatch(&self) -> bool {
        self.symbol
            .as_ref()
            .map_or(false, |sym| self.length != sym.length())
    }
}

impl fmt::Display for CorrelatedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            None => write!(f, "address {:#X}", self.address)?,
            Some(sym) if self.address != sym.address() => {
                write!(f, "address {:#X} (in {}", self.address, sym.name)?;
                if !sym.source.is_empty() {
                    write!(f, " [{}]", sym.source)?;
                }
                write!(f, ")")?;
            }
            Some(sym) => write!(f, "{sym}")?,
        }
        let mut notes = Vec::new();
        if self.length_mismatch() {
            if let Some(sym) = &self.symbol {
                notes.push(format!("length mismatch: {} != {}", self.length, sym.length()));
            }
        }
        if self.data_pool_mismatch {
            notes.push("data pool mismatch".to_string());
        }
        if !notes.is_empty() {
            write!(f, " ({})", notes.join(", "))?;
        }
        Ok(())
    }
}

/// An open match being extended segment by segment.
#[derive(Debug, Clone, Copy)]
struct SearchCandidate {
    start: usize,
    end: usize,
    data_pool_mismatch: bool,
}

fn type_flag(kind: SymbolType) -> SymbolTypes {
    match kind {
        SymbolType::Arm => SymbolTypes::ARM,
        SymbolType::Thumb => SymbolTypes::THUMB,
        SymbolType::Data => SymbolTypes::DATA,
    }
}

/// Find target locations matching every eligible source symbol.
///
/// Returns `(source symbol, target matches)` entries in source symbol
/// order; symbols with no surviving matches are omitted.
pub fn correlate_symbols(
    source: &MappedBinary,
    target: &MappedBinary,
    options: &SymbolMatchOptions,
) -> Result<Vec<(MapSymbol, Vec<CorrelatedSymbol>)>> {
    let mut correlations = Vec::new();
    for symbol in &source.symbols {
        let Some(kind) = symbol.kind() else {
            continue;
        };
        if symbol.length() < options.min_length
            || options
                .source_ignore
                .as_ref()
                .map_or(false, |re| re.is_match(&symbol.name))
            || !options.source_types.contains(type_flag(kind))
        {
            debug!("ignored source symbol: {symbol}");
            continue;
        }
        if options.no_veneers && source.is_veneer(symbol) {
            debug!("ignored source veneer: {symbol}");
            continue;
        }

        let mut candidates: Option<Vec<SearchCandidate>> = None;
        for segment in &symbol.segments {
            let pattern = source.segment_pattern(segment, options.mask)?;
            match candidates.as_mut() {
                None => {
                    // First segment: every match opens a candidate
                    candidates = Some(
                        pattern
                            .find_all(&target.contents)
                            .iter()
                            .map(|m| SearchCandidate {
                                start: m.offset,
                                end: m.offset + segment.length as usize,
                                data_pool_mismatch: false,
                            })
                            .collect(),
                    );
                }
                Some(candidates) => {
                    candidates.retain_mut(|candidate| {
                        if pattern.matches_at(&target.contents, candidate.end) {
                            candidate.end += segment.length as usize;
                            true
                        } else if kind.is_asm() && segment.kind == SymbolType::Data {
                            // Mismatching literal pool: accept, flag
                            candidate.end += segment.length as usize;
                            candidate.data_pool_mismatch = true;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
            if candidates.as_ref().map_or(true, Vec::is_empty) {
                break;
            }
        }
        let Some(candidates) = candidates else {
            continue;
        };
        if candidates.is_empty() {
            continue;
        }
        debug!("{}: found {} match(es)", symbol.name, candidates.len());

        let mut matches = Vec::new();
        for candidate in candidates {
            let address = target.to_absolute(candidate.start);
            let correlated = CorrelatedSymbol {
                address,
                length: (candidate.end - candidate.start) as u32,
                symbol: target.symbol_occupying(address).cloned(),
                data_pool_mismatch: candidate.data_pool_mismatch,
            };
            if (options.match_data_pools && correlated.data_pool_mismatch)
                || (options.match_length && correlated.length_mismatch())
            {
                debug!("dropped match: {symbol} -> {correlated}");
                continue;
            }
            if let (Some(filter), Some(existing)) = (&options.target_filter, &correlated.symbol) {
                if correlated.address == existing.address()
                    && symbol.name != existing.name
                    && !filter.is_match(&existing.name)
                {
                    debug!(
                        "filtered match overriding target symbol {}: {symbol} -> {correlated}",
                        existing.name
                    );
                    continue;
                }
            }
            matches.push(correlated);
        }
        if matches.is_empty() {
            continue;
        }
        correlations.push((symbol.clone(), matches));
    }
    Ok(correlations)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use regex::Regex;

    const LOAD: u32 = 0x0200_0000;

    fn sym(name: &str, segments: Vec<SymbolSegment>) -> MapSymbol {
        MapSymbol {
            name: name.into(),
            source: "test.o".into(),
            segments,
        }
    }

    fn seg(kind: SymbolType, address: u32, length: u32) -> SymbolSegment {
        SymbolSegment {
            kind,
            address,
            length,
        }
    }

    fn veneer_symbol(address: u32) -> MapSymbol {
        sym(
            "veneer",
            vec![
                seg(SymbolType::Arm, address, 8),
                seg(SymbolType::Data, address + 8, 4),
            ],
        )
    }

    /// mov rN, rN filler word.
    fn mov(reg: u8) -> [u8; 4] {
        [0x00, reg, 0xA0, 0xE1]
    }

    fn full_match(pattern: &str) -> Option<Regex> {
        Some(Regex::new(&format!("^(?:{pattern})$")).unwrap())
    }

    #[test]
    fn test_veneer_detection() {
        let mut contents = VENEER_CODE.to_vec();
        contents.extend([0x78, 0x56, 0x34, 0x12]);
        let binary = MappedBinary::from_parts("bin", contents, LOAD, vec![]);
        assert!(binary.is_veneer(&veneer_symbol(LOAD)));

        // A single-segment symbol is not a veneer
        assert!(!binary.is_veneer(&sym("f", vec![seg(SymbolType::Arm, LOAD, 8)])));
        // Wrong segment sizes are not veneers
        let wrong = sym(
            "f",
            vec![
                seg(SymbolType::Arm, LOAD, 4),
                seg(SymbolType::Data, LOAD + 4, 4),
            ],
        );
        assert!(!binary.is_veneer(&wrong));
        // Right shape, wrong code bytes
        let other = MappedBinary::from_parts("bin", vec![0u8; 12], LOAD, vec![]);
        assert!(!other.is_veneer(&veneer_symbol(LOAD)));
    }

    #[test]
    fn test_symbol_occupying() {
        let symbols = vec![
            sym("a", vec![seg(SymbolType::Arm, LOAD, 8)]),
            sym("marker", vec![seg(SymbolType::Data, LOAD + 8, 0)]),
            sym("b", vec![seg(SymbolType::Arm, LOAD + 16, 8)]),
        ];
        let binary = MappedBinary::from_parts("bin", vec![0u8; 32], LOAD, symbols);
        assert_eq!(binary.symbol_occupying(LOAD).unwrap().name, "a");
        assert_eq!(binary.symbol_occupying(LOAD + 4).unwrap().name, "a");
        // Zero-length symbols match their exact address only
        assert_eq!(binary.symbol_occupying(LOAD + 8).unwrap().name, "marker");
        assert!(binary.symbol_occupying(LOAD + 12).is_none());
        assert_eq!(binary.symbol_occupying(LOAD + 17).unwrap().name, "b");
        assert!(binary.symbol_occupying(LOAD + 24).is_none());
        assert!(binary.symbol_occupying(LOAD - 1).is_none());
    }

    #[test]
    fn test_correlates_relocated_function() {
        // Source: a function with a bl whose offset differs between
        // the two binaries
        let mut src_bytes: Vec<u8> = Vec::new();
        src_bytes.extend(mov(1));
        src_bytes.extend([0x10, 0x00, 0x00, 0xEB]); // bl
        src_bytes.extend(mov(2));
        let source = MappedBinary::from_parts(
            "src",
            src_bytes,
            LOAD,
            vec![sym("func", vec![seg(SymbolType::Arm, LOAD, 12)])],
        );

        let mut tgt_bytes: Vec<u8> = mov(7).to_vec(); // shift by 4
        tgt_bytes.extend(mov(1));
        tgt_bytes.extend([0x99, 0x88, 0x77, 0xEB]); // bl, different offset
        tgt_bytes.extend(mov(2));
        let target = MappedBinary::from_parts("tgt", tgt_bytes, LOAD, vec![]);

        let results = correlate_symbols(&source, &target, &SymbolMatchOptions::new()).unwrap();
        assert_eq!(results.len(), 1);
        let (symbol, matches) = &results[0];
        assert_eq!(symbol.name, "func");
        assert_eq!(
            matches,
            &vec![CorrelatedSymbol {
                address: LOAD + 4,
                length: 12,
                symbol: None,
                data_pool_mismatch: false,
            }]
        );
    }

    #[test]
    fn test_data_pool_mismatch_flagging() {
        // func: 4 bytes of code then a 4-byte literal pool
        let mut src_bytes = mov(1).to_vec();
        src_bytes.extend([0xAA, 0xBB, 0xCC, 0xDD]);
        let source = MappedBinary::from_parts(
            "src",
            src_bytes,
            LOAD,
            vec![sym(
                "func",
                vec![
                    seg(SymbolType::Arm, LOAD, 4),
                    seg(SymbolType::Data, LOAD + 4, 4),
                ],
            )],
        );
        // Target has the code but a different pool value
        let mut tgt_bytes = mov(1).to_vec();
        tgt_bytes.extend([0x11, 0x22, 0x33, 0x44]);
        let target = MappedBinary::from_parts("tgt", tgt_bytes, LOAD, vec![]);

        // Strict data pools: the match is dropped
        let strict = correlate_symbols(&source, &target, &SymbolMatchOptions::new()).unwrap();
        assert!(strict.is_empty());

        // Relaxed: kept, flagged
        let options = SymbolMatchOptions {
            match_data_pools: false,
            match_length: false,
            ..SymbolMatchOptions::new()
        };
        let relaxed = correlate_symbols(&source, &target, &options).unwrap();
        assert_eq!(relaxed.len(), 1);
        assert!(relaxed[0].1[0].data_pool_mismatch);
        assert_eq!(relaxed[0].1[0].length, 8);
    }

    #[test]
    fn test_pure_data_symbol_mismatch_drops_candidate() {
        // For a DATA symbol, a mismatching second segment kills the
        // candidate instead of flagging it
        let src_bytes = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let source = MappedBinary::from_parts(
            "src",
            src_bytes,
            LOAD,
            vec![sym(
                "table",
                vec![
                    seg(SymbolType::Data, LOAD, 4),
                    seg(SymbolType::Data, LOAD + 4, 4),
                ],
            )],
        );
        let target = MappedBinary::from_parts("tgt", vec![1, 2, 3, 4, 9, 9, 9, 9], LOAD, vec![]);
        let options = SymbolMatchOptions {
            match_data_pools: false,
            match_length: false,
            ..SymbolMatchOptions::new()
        };
        let results = correlate_symbols(&source, &target, &options).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_match_length_against_occupying_symbol() {
        let src_bytes = mov(1).to_vec();
        let source = MappedBinary::from_parts(
            "src",
            src_bytes,
            LOAD,
            vec![sym("f", vec![seg(SymbolType::Arm, LOAD, 4)])],
        );
        // Target has the same bytes, occupied by a symbol of length 8
        let mut tgt_bytes = mov(1).to_vec();
        tgt_bytes.extend(mov(2));
        let target = MappedBinary::from_parts(
            "tgt",
            tgt_bytes,
            LOAD,
            vec![sym("g", vec![seg(SymbolType::Arm, LOAD, 8)])],
        );

        let strict = correlate_symbols(&source, &target, &SymbolMatchOptions::new()).unwrap();
        assert!(strict.is_empty());

        let options = SymbolMatchOptions {
            match_length: false,
            ..SymbolMatchOptions::new()
        };
        let relaxed = correlate_symbols(&source, &target, &options).unwrap();
        assert_eq!(relaxed.len(), 1);
        assert!(relaxed[0].1[0].length_mismatch());
    }

    #[test]
    fn test_target_filter_blocks_override() {
        let src_bytes = mov(1).to_vec();
        let source = MappedBinary::from_parts(
            "src",
            src_bytes.clone(),
            LOAD,
            vec![sym("new_name", vec![seg(SymbolType::Arm, LOAD, 4)])],
        );
        let target = MappedBinary::from_parts(
            "tgt",
            src_bytes,
            LOAD,
            vec![sym("established", vec![seg(SymbolType::Arm, LOAD, 4)])],
        );

        // The existing name doesn't satisfy the filter: dropped
        let blocked = SymbolMatchOptions {
            target_filter: full_match("sub_[0-9A-F]+"),
            ..SymbolMatchOptions::new()
        };
        assert!(correlate_symbols(&source, &target, &blocked).unwrap().is_empty());

        // A permissive filter lets the override through
        let allowed = SymbolMatchOptions {
            target_filter: full_match(".*"),
            ..SymbolMatchOptions::new()
        };
        let results = correlate_symbols(&source, &target, &allowed).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_source_filters() {
        let mut contents = mov(1).to_vec();
        contents.extend(mov(2));
        contents.extend([0xAA, 0xBB, 0xCC, 0xDD]);
        let symbols = vec![
            sym("short", vec![seg(SymbolType::Arm, LOAD, 4)]),
            sym("ignored_name", vec![seg(SymbolType::Arm, LOAD, 8)]),
            sym("data_table", vec![seg(SymbolType::Data, LOAD + 8, 4)]),
        ];
        let source = MappedBinary::from_parts("src", contents.clone(), LOAD, symbols);
        let target = MappedBinary::from_parts("tgt", contents, 0, vec![]);

        let options = SymbolMatchOptions {
            min_length: 8,
            source_ignore: full_match("ignored_.*"),
            source_types: SymbolTypes::ARM | SymbolTypes::THUMB,
            match_length: false,
            ..SymbolMatchOptions::new()
        };
        // short fails min_length, ignored_name the regex, data_table
        // the type set
        assert!(correlate_symbols(&source, &target, &options).unwrap().is_empty());
    }

    #[test]
    fn test_no_veneers_excludes_veneer() {
        let mut contents = VENEER_CODE.to_vec();
        contents.extend([0x78, 0x56, 0x34, 0x12]);
        let source =
            MappedBinary::from_parts("src", contents.clone(), LOAD, vec![veneer_symbol(LOAD)]);
        let target = MappedBinary::from_parts("tgt", contents, 0, vec![]);

        let options = SymbolMatchOptions {
            no_veneers: true,
            match_length: false,
            ..SymbolMatchOptions::new()
        };
        assert!(correlate_symbols(&source, &target, &options).unwrap().is_empty());

        let kept = SymbolMatchOptions {
            match_length: false,
            ..SymbolMatchOptions::new()
        };
        assert_eq!(correlate_symbols(&source, &target, &kept).unwrap().len(), 1);
    }

    #[test]
    fn test_display_formats() {
        let plain = CorrelatedSymbol {
            address: 0x0200_1000,
            length: 16,
            symbol: None,
            data_pool_mismatch: false,
        };
        assert_eq!(plain.to_string(), "address 0x2001000");

        let inside = CorrelatedSymbol {
            address: 0x0200_1004,
            length: 16,
            symbol: Some(sym("holder", vec![seg(SymbolType::Arm, 0x0200_1000, 32)])),
            data_pool_mismatch: true,
        };
        let rendered = inside.to_string();
        assert!(rendered.starts_with("address 0x2001004 (in holder [test.o])"));
        assert!(rendered.contains("length mismatch: 16 != 32"));
        assert!(rendered.contains("data pool mismatch"));
    }
}
