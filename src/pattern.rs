//! Fuzzy byte patterns for position-tolerant instruction search.
//!
//! A pattern is a flat sequence of byte matchers compiled from a
//! source segment. Data segments compile to pure literals; assembly
//! segments mask the offset fields of position-dependent instructions
//! per [`MaskOptions`]:
//!
//! - `bl` always masks its 24-bit offset (the three low bytes);
//!   plain `b` masks it only when `ignore_b_offset` is set.
//! - Addressing-mode-2 loads/stores mask the 12-bit immediate (the
//!   low byte entirely, plus the low nibble of the second byte).
//! - Addressing-mode-3 loads/stores mask the split immediate (the low
//!   nibbles of the first two bytes).
//!
//! Matching is a linear scan over every byte position; matches are
//! not word-aligned and the haystack may contain any byte values.
//! Patterns with identical atoms compare and hash identically, which
//! is what the per-target result cache keys on.

use crate::arm::{self, INSTRUCTION_SIZE};
use crate::segment::{Segment, SegmentKind, SourceSegment};
use crate::types::MaskOptions;
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// A single-byte matcher within a [`Pattern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternAtom {
    /// Matches exactly one byte value.
    Literal(u8),
    /// Matches any byte.
    Any,
    /// Matches any byte whose upper four bits equal the given nibble,
    /// i.e. the byte class `[X0-XF]`.
    UpperNibble(u8),
}

impl PatternAtom {
    fn matches(self, byte: u8) -> bool {
        match self {
            PatternAtom::Literal(b) => byte == b,
            PatternAtom::Any => true,
            PatternAtom::UpperNibble(n) => byte >> 4 == n,
        }
    }
}

/// A compiled byte pattern.
///
/// Identity is the exact atom sequence: two patterns compiled from
/// equal bytes with equal options are interchangeable as cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    atoms: Vec<PatternAtom>,
}

impl Pattern {
    /// A pattern matching `bytes` exactly.
    pub fn literal(bytes: &[u8]) -> Self {
        Pattern {
            atoms: bytes.iter().map(|&b| PatternAtom::Literal(b)).collect(),
        }
    }

    /// Pattern length in bytes; every match has this length.
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    /// True for the empty pattern.
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Anchored test: does the pattern match `haystack` at `at`?
    pub fn matches_at(&self, haystack: &[u8], at: usize) -> bool {
        match haystack.get(at..at + self.atoms.len()) {
            Some(window) => self
                .atoms
                .iter()
                .zip(window)
                .all(|(atom, &byte)| atom.matches(byte)),
            None => false,
        }
    }

    /// All non-overlapping matches in `haystack`, in order.
    pub fn find_all(&self, haystack: &[u8]) -> Vec<Segment> {
        let mut matches = Vec::new();
        if self.atoms.is_empty() {
            return matches;
        }
        let mut at = 0;
        while let Some(pos) = self.next_match(haystack, at) {
            matches.push(Segment {
                offset: pos,
                length: self.atoms.len(),
            });
            at = pos + self.atoms.len();
        }
        matches
    }

    /// First match at or after `at`, scanning every byte position.
    fn next_match(&self, haystack: &[u8], at: usize) -> Option<usize> {
        let n = self.atoms.len();
        if n == 0 || haystack.len() < n || at > haystack.len() - n {
            return None;
        }
        let last = haystack.len() - n;
        match self.leading_literal() {
            Some((k, byte)) => {
                let mut at = at;
                while at <= last {
                    // Candidate starts are those where the k-th pattern
                    // byte lines up with an occurrence of `byte`
                    let found = memchr::memchr(byte, &haystack[at + k..=last + k])?;
                    let pos = at + found;
                    if self.matches_at(haystack, pos) {
                        return Some(pos);
                    }
                    at = pos + 1;
                }
                None
            }
            None => (at..=last).find(|&pos| self.matches_at(haystack, pos)),
        }
    }

    /// Position and value of the first literal atom, used to skip
    /// ahead with memchr.
    fn leading_literal(&self) -> Option<(usize, u8)> {
        self.atoms.iter().enumerate().find_map(|(i, atom)| match atom {
            PatternAtom::Literal(b) => Some((i, *b)),
            _ => None,
        })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, atom) in self.atoms.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match atom {
                PatternAtom::Literal(b) => write!(f, "{b:02x}")?,
                PatternAtom::Any => write!(f, "??")?,
                PatternAtom::UpperNibble(n) => write!(f, "{n:x}?")?,
            }
        }
        Ok(())
    }
}

impl SourceSegment {
    /// Compiles the search pattern for this segment's bytes in
    /// `buffer`, applying offset masking for assembly segments.
    pub fn pattern(&self, buffer: &[u8], mask: MaskOptions) -> Result<Pattern> {
        let bytes = self.segment.read(buffer)?;
        match self.kind {
            SegmentKind::Data => Ok(Pattern::literal(bytes)),
            SegmentKind::Asm => Ok(compile_asm(bytes, mask)),
        }
    }
}

fn compile_asm(bytes: &[u8], mask: MaskOptions) -> Pattern {
    let mut atoms = Vec::with_capacity(bytes.len());
    for instr in bytes.chunks_exact(INSTRUCTION_SIZE) {
        let word = LittleEndian::read_u32(instr);
        if arm::is_bl(word) || (mask.ignore_b_offset && arm::is_b(word)) {
            // 24-bit branch offset in the three low bytes
            atoms.extend([PatternAtom::Any, PatternAtom::Any, PatternAtom::Any]);
            atoms.push(PatternAtom::Literal(instr[3]));
        } else if mask.ignore_ldr_str_offset && arm::is_addr_mode_2(word) {
            // 12-bit immediate: low byte plus the low nibble under Rd
            atoms.push(PatternAtom::Any);
            atoms.push(PatternAtom::UpperNibble(instr[1] >> 4));
            atoms.push(PatternAtom::Literal(instr[2]));
            atoms.push(PatternAtom::Literal(instr[3]));
        } else if mask.ignore_ldr_str_offset && arm::is_addr_mode_3(word) {
            // Split immediate: the low nibbles of the first two bytes
            atoms.push(PatternAtom::UpperNibble(instr[0] >> 4));
            atoms.push(PatternAtom::UpperNibble(instr[1] >> 4));
            atoms.push(PatternAtom::Literal(instr[2]));
            atoms.push(PatternAtom::Literal(instr[3]));
        } else {
            atoms.extend(instr.iter().map(|&b| PatternAtom::Literal(b)));
        }
    }
    Pattern { atoms }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn asm_pattern(bytes: &[u8], mask: MaskOptions) -> Pattern {
        SourceSegment::asm(0, bytes.len())
            .unwrap()
            .pattern(bytes, mask)
            .unwrap()
    }

    #[test]
    fn test_bl_offset_always_masked() {
        // bl with one offset in the source...
        let src = [0x34, 0x12, 0x00, 0xEB];
        let pattern = asm_pattern(&src, MaskOptions::default());
        // ...matches a bl with a completely different offset
        let target = [0xAA, 0xAA, 0xAA, 0xEB];
        assert_eq!(pattern.find_all(&target), vec![Segment { offset: 0, length: 4 }]);
        // but not a different high byte
        assert!(pattern.find_all(&[0xAA, 0xAA, 0xAA, 0xEA]).is_empty());
    }

    #[test]
    fn test_b_offset_masked_only_on_request() {
        let src = [0x05, 0x00, 0x00, 0xEA]; // b <offset>
        let strict = asm_pattern(&src, MaskOptions::default());
        let target = [0x09, 0x00, 0x00, 0xEA];
        assert!(strict.find_all(&target).is_empty());

        let relaxed = asm_pattern(
            &src,
            MaskOptions {
                ignore_b_offset: true,
                ..MaskOptions::default()
            },
        );
        assert_eq!(relaxed.find_all(&target).len(), 1);
    }

    #[test]
    fn test_ldr_offset_masked() {
        // ldr r1, [pc, #4]
        let src = [0x04, 0x10, 0x9F, 0xE5];
        let mask = MaskOptions {
            ignore_ldr_str_offset: true,
            ..MaskOptions::default()
        };
        let pattern = asm_pattern(&src, mask);
        // Same instruction with offset #8 still matches
        assert_eq!(pattern.find_all(&[0x08, 0x10, 0x9F, 0xE5]).len(), 1);
        // A different destination register does not
        assert!(pattern.find_all(&[0x08, 0x20, 0x9F, 0xE5]).is_empty());
        // Neither does a changed opcode byte
        assert!(pattern.find_all(&[0x08, 0x10, 0x9F, 0xE4]).is_empty());
    }

    #[test]
    fn test_ldrh_split_offset_masked() {
        // ldrh r1, [r2, #4]: immL in the low nibble of b0, immH in the
        // low nibble of b1
        let src = [0xB4, 0x10, 0xD2, 0xE1];
        let mask = MaskOptions {
            ignore_ldr_str_offset: true,
            ..MaskOptions::default()
        };
        let pattern = asm_pattern(&src, mask);
        assert_eq!(pattern.find_all(&[0xB8, 0x11, 0xD2, 0xE1]).len(), 1);
        // Flipping the 1SH1 nibble kills the match
        assert!(pattern.find_all(&[0xD8, 0x10, 0xD2, 0xE1]).is_empty());
    }

    #[test]
    fn test_strict_mask_is_literal() {
        let src = [0x04, 0x10, 0x9F, 0xE5];
        let pattern = asm_pattern(&src, MaskOptions::default());
        assert_eq!(pattern, Pattern::literal(&src));
        assert!(pattern.find_all(&[0x08, 0x10, 0x9F, 0xE5]).is_empty());
    }

    #[test]
    fn test_unaligned_matches_found() {
        let needle = [0xDE, 0xAD, 0xBE, 0xEF];
        let pattern = Pattern::literal(&needle);
        let mut haystack = vec![0u8; 11];
        haystack[3..7].copy_from_slice(&needle);
        assert_eq!(
            pattern.find_all(&haystack),
            vec![Segment { offset: 3, length: 4 }]
        );
    }

    #[test]
    fn test_non_overlapping_matches() {
        let pattern = Pattern::literal(&[0xAA, 0xAA]);
        let haystack = [0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        // Greedy left-to-right: 0..2 and 2..4, not the overlap at 1
        assert_eq!(
            pattern.find_all(&haystack),
            vec![
                Segment { offset: 0, length: 2 },
                Segment { offset: 2, length: 2 }
            ]
        );
    }

    #[test]
    fn test_matches_at_bounds() {
        let pattern = Pattern::literal(&[0x01, 0x02]);
        let haystack = [0x00, 0x01, 0x02];
        assert!(pattern.matches_at(&haystack, 1));
        assert!(!pattern.matches_at(&haystack, 2));
        assert!(!pattern.matches_at(&haystack, 3));
    }

    #[test]
    fn test_wildcard_prefix_anchors_on_literal() {
        // bl chunks lead with three wildcards; the scan anchors on the
        // trailing literal byte instead
        let pattern = compile_asm(&[0x00, 0x00, 0x00, 0xEB], MaskOptions::default());
        let haystack = [0xFF, 0x01, 0x02, 0x03, 0xEB, 0x00];
        assert_eq!(
            pattern.find_all(&haystack),
            vec![Segment { offset: 1, length: 4 }]
        );
    }

    #[test]
    fn test_pattern_identity() {
        let mask = MaskOptions {
            ignore_ldr_str_offset: true,
            ignore_b_offset: true,
        };
        let a = compile_asm(&[0x04, 0x10, 0x9F, 0xE5], mask);
        let b = compile_asm(&[0x04, 0x10, 0x9F, 0xE5], mask);
        assert_eq!(a, b);
        let c = compile_asm(&[0x04, 0x10, 0x9F, 0xE5], MaskOptions::default());
        assert_ne!(a, c);
    }

    #[test]
    fn test_display() {
        let mask = MaskOptions {
            ignore_ldr_str_offset: true,
            ..MaskOptions::default()
        };
        let pattern = compile_asm(&[0x04, 0x10, 0x9F, 0xE5], mask);
        assert_eq!(pattern.to_string(), "?? 1? 9f e5");
    }
}
