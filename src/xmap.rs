//! xMAP linker map parsing.
//!
//! An xMAP file is UTF-8 text made of sections separated by blank
//! lines, each opened by a `# <name>` header. Inside a section,
//! entry lines have the form
//!
//! ```text
//! <hex_addr> <hex_length> <section_type> <name> (<source>)
//! ```
//!
//! where the name may contain spaces and the source may contain
//! balanced parentheses. `$a`/`$t`/`$d` pseudo-entries switch the
//! data type for subsequent lines. A real entry opens a symbol
//! builder; later entries advance it segment by segment until the
//! declared length is consumed. The exception table region is
//! interleaved with entries in an unparseable header format and is
//! skipped wholesale.

use crate::error::{CorrelateError, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Data type of a symbol segment, switched by `$a`/`$t`/`$d` markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolType {
    /// ARM code.
    Arm,
    /// Thumb code.
    Thumb,
    /// Raw data.
    Data,
}

impl SymbolType {
    /// The pseudo-entry name that selects this type, if `name` is one.
    fn from_marker(name: &str) -> Option<Self> {
        match name {
            "$a" => Some(SymbolType::Arm),
            "$t" => Some(SymbolType::Thumb),
            "$d" => Some(SymbolType::Data),
            _ => None,
        }
    }

    /// True for code types (ARM or Thumb).
    pub fn is_asm(self) -> bool {
        matches!(self, SymbolType::Arm | SymbolType::Thumb)
    }
}

/// An address range covering a subset of a symbol's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SymbolSegment {
    /// Data type in effect for this range.
    pub kind: SymbolType,
    /// Absolute start address.
    pub address: u32,
    /// Length in bytes.
    pub length: u32,
}

impl SymbolSegment {
    /// One past the last address of the segment.
    pub fn end(&self) -> u32 {
        self.address + self.length
    }
}

/// A symbol parsed from an xMAP file.
///
/// A symbol may have more than one segment; functions commonly have
/// an ARM code segment followed by a literal pool segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapSymbol {
    /// Symbol name.
    pub name: String,
    /// Object file the symbol came from.
    pub source: String,
    /// Ordered, nonempty segment list.
    pub segments: Vec<SymbolSegment>,
}

impl MapSymbol {
    /// Absolute address of the first segment.
    pub fn address(&self) -> u32 {
        self.segments.first().map_or(0, |seg| seg.address)
    }

    /// Data type of the first segment.
    pub fn kind(&self) -> Option<SymbolType> {
        self.segments.first().map(|seg| seg.kind)
    }

    /// Total length over all segments.
    pub fn length(&self) -> u32 {
        self.segments.iter().map(|seg| seg.length).sum()
    }

    /// One past the symbol's last address.
    pub fn end(&self) -> u32 {
        self.address() + self.length()
    }
}

impl fmt::Display for MapSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:#X}", self.name, self.address())?;
        if !self.source.is_empty() {
            write!(f, " [{}]", self.source)?;
        }
        Ok(())
    }
}

/// One parsed xMAP section: its load address and symbols in file
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XmapSection {
    /// Load address from the `START (linker command file)` directive.
    pub load_address: u32,
    /// Symbols in the order they were finalized.
    pub symbols: Vec<MapSymbol>,
}

/// Parse the named section of an xMAP file.
pub fn parse_file<P: AsRef<Path>>(path: P, section: &str) -> Result<XmapSection> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::InvalidData {
            CorrelateError::Encoding {
                path: path.display().to_string(),
            }
        } else {
            CorrelateError::Io(err)
        }
    })?;
    parse_str(&text, section)
}

/// Parse the named section out of xMAP text.
pub fn parse_str(text: &str, section: &str) -> Result<XmapSection> {
    let section = section.trim();
    let mut load_address = 0u32;
    let mut symbols: Vec<MapSymbol> = Vec::new();
    let mut current_section: Option<&str> = None;
    let mut current_type = SymbolType::Data;
    let mut builder: Option<SymbolBuilder> = None;
    let mut found_section = false;
    let mut found_load_addr = false;
    let mut in_exception_table = false;

    for (i, raw) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = raw.trim();

        if let Some(open) = builder.as_mut() {
            if open.tick() > 1 {
                // A full line passed without advancing the symbol
                debug!(line = lineno, "discarding incomplete symbol {}", open.symbol.name);
                builder = None;
            }
        }

        let Some(current) = current_section else {
            if line.is_empty() {
                continue;
            }
            let Some(rest) = line.strip_prefix('#') else {
                return Err(parse_err(lineno, "unexpected content without parent section"));
            };
            let name = rest.trim();
            if name.is_empty() {
                continue;
            }
            debug!(line = lineno, "start section: {name}");
            current_section = Some(name);
            continue;
        };

        if line.is_empty() {
            if found_section {
                // The requested section is done; no need to go further
                break;
            }
            current_section = None;
            continue;
        }
        if current != section {
            continue;
        }
        found_section = true;

        if !found_load_addr && line.ends_with("START (linker command file)") {
            let token = line.split_whitespace().next().unwrap_or("");
            let hex = token
                .strip_prefix("#>")
                .ok_or_else(|| parse_err(lineno, "malformed load address directive"))?;
            load_address = u32::from_str_radix(hex, 16)
                .map_err(|_| parse_err(lineno, "malformed load address directive"))?;
            found_load_addr = true;
            debug!(line = lineno, "load address: {load_address:#X}");
        }
        if line.starts_with('#') || in_exception_table {
            // The exception table is interleaved with entries but uses
            // a header format that isn't parseable the same way
            if line.ends_with("_ETABLE_START (linker command file)") {
                in_exception_table = true;
            } else if in_exception_table && line.ends_with("_ETABLE_END (linker command file)") {
                in_exception_table = false;
            }
            continue;
        }

        // Address map entry
        let (address_tok, length_tok, section_type, name_and_source) =
            split_entry(line).ok_or_else(|| parse_err(lineno, "unexpected line format"))?;
        let address = u32::from_str_radix(address_tok, 16)
            .map_err(|_| parse_err(lineno, "unexpected line format"))?;
        let length = u32::from_str_radix(length_tok, 16)
            .map_err(|_| parse_err(lineno, "unexpected line format"))?;
        let (name, source) = split_name_source(name_and_source)
            .ok_or_else(|| parse_err(lineno, "unexpected line format"))?;

        // Defer switching the data type so the previous type still
        // applies to the gap closed by this line
        let new_type = SymbolType::from_marker(name);

        if let Some(open) = builder.as_mut() {
            match open.add(address, current_type) {
                Err(reason) => {
                    debug!(
                        line = lineno,
                        "ignoring symbol {}: failed to add address {address:#X}: {reason}",
                        open.symbol.name
                    );
                    builder = None;
                }
                Ok(Some(finalized)) => {
                    if finalized.segments.is_empty() {
                        debug!(line = lineno, "empty symbol: {}", finalized.name);
                    } else {
                        symbols.push(finalized);
                    }
                    builder = None;
                }
                Ok(None) => {
                    if source != open.symbol.source {
                        return Err(parse_err(
                            lineno,
                            &format!(
                                "{}: segment source mismatch: \"{source}\"",
                                open.symbol.name
                            ),
                        ));
                    }
                }
            }
        }
        // Don't open builders for zero-width symbols or
        // start-of-binary-section markers
        if builder.is_none() && new_type.is_none() && length != 0 && name != section_type {
            builder = Some(SymbolBuilder::new(
                name.to_string(),
                source.to_string(),
                address,
                length,
            ));
        }
        if let Some(new_type) = new_type {
            current_type = new_type;
        }
    }

    if !found_section {
        return Err(CorrelateError::SectionNotFound {
            section: section.to_string(),
        });
    }
    Ok(XmapSection {
        load_address,
        symbols,
    })
}

fn parse_err(line: usize, message: &str) -> CorrelateError {
    CorrelateError::XmapParse {
        line,
        message: message.to_string(),
    }
}

/// Split an entry line into address, length, section type, and the
/// name-plus-source remainder. The first three fields are single
/// tokens; the remainder keeps internal spacing.
fn split_entry(line: &str) -> Option<(&str, &str, &str, &str)> {
    let mut rest = line;
    let mut tokens = [""; 3];
    for token in tokens.iter_mut() {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        *token = &rest[..end];
        rest = &rest[end..];
    }
    let remainder = rest.trim();
    if remainder.is_empty() {
        return None;
    }
    Some((tokens[0], tokens[1], tokens[2], remainder))
}

/// Split `<name> (<source>)` by finding the open parenthesis that
/// matches the final closing one, counting nesting.
fn split_name_source(name_and_source: &str) -> Option<(&str, &str)> {
    if !name_and_source.ends_with(')') {
        return None;
    }
    let mut search_end = name_and_source.len() - 1;
    let mut count = 1usize;
    let mut open = 0;
    while count > 0 {
        open = name_and_source[..search_end].rfind('(')?;
        count -= 1;
        count += name_and_source[open + 1..search_end].matches(')').count();
        search_end = open;
    }
    Some((
        name_and_source[..open].trim(),
        name_and_source[open + 1..name_and_source.len() - 1].trim(),
    ))
}

/// Accumulates one symbol's segments until its declared length is
/// consumed.
struct SymbolBuilder {
    symbol: MapSymbol,
    address: u32,
    length: u32,
    max_alignment: u32,
    cursor: u32,
    ticks_since_add: u32,
}

enum SegmentRejected {
    AddressDecreased,
    OutOfBounds,
}

impl fmt::Display for SegmentRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentRejected::AddressDecreased => {
                write!(f, "symbol segment addresses cannot decrease")
            }
            SegmentRejected::OutOfBounds => write!(f, "symbol segment out of symbol bounds"),
        }
    }
}

impl SymbolBuilder {
    fn new(name: String, source: String, address: u32, length: u32) -> Self {
        SymbolBuilder {
            symbol: MapSymbol {
                name,
                source,
                segments: Vec::new(),
            },
            address,
            length,
            max_alignment: 4,
            cursor: address,
            ticks_since_add: 0,
        }
    }

    fn tick(&mut self) -> u32 {
        self.ticks_since_add += 1;
        self.ticks_since_add
    }

    fn max_align(&self, value: u32) -> u32 {
        (value + self.max_alignment - 1) / self.max_alignment * self.max_alignment
    }

    /// Advance the cursor to `address`, closing the gap as a segment
    /// of the current data type. Returns the finalized symbol once the
    /// cursor reaches the declared end.
    fn add(
        &mut self,
        address: u32,
        kind: SymbolType,
    ) -> std::result::Result<Option<MapSymbol>, SegmentRejected> {
        if address < self.cursor {
            return Err(SegmentRejected::AddressDecreased);
        }
        // Addresses may overshoot the declared end by linker alignment
        // padding only
        if address > self.max_align(self.address + self.length) {
            return Err(SegmentRejected::OutOfBounds);
        }
        self.ticks_since_add = 0;
        let declared_end = self.address + self.length;
        if address != self.cursor {
            // Truncate to the declared end; a truncating add finalizes
            // the symbol immediately, so the resulting gap is harmless
            self.symbol.segments.push(SymbolSegment {
                kind,
                address: self.cursor,
                length: address.min(declared_end) - self.cursor,
            });
            self.cursor = address;
        }
        if self.cursor >= declared_end {
            return Ok(Some(std::mem::replace(
                &mut self.symbol,
                MapSymbol {
                    name: String::new(),
                    source: String::new(),
                    segments: Vec::new(),
                },
            )));
        }
        Ok(None)
    }
}
