//! Byte-range segments within an unnamed buffer.
//!
//! A [`Segment`] is the unit every other component trades in: chunk
//! boundaries, search matches, merged correlations and coverage holes
//! are all plain segments. The data-vs-assembly distinction only
//! matters when a segment is compiled into a search pattern, so it
//! lives in a separate tag carried by [`SourceSegment`].

use crate::arm::INSTRUCTION_SIZE;
use crate::error::{CorrelateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A contiguous byte range: nonnegative offset, positive length.
///
/// Equality, ordering and hashing are by `(offset, length)`, offset
/// first. The derives rely on the field order below.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Segment {
    /// Start of the range.
    pub offset: usize,
    /// Number of bytes covered; always positive.
    pub length: usize,
}

impl Segment {
    /// Creates a segment, rejecting zero lengths.
    pub fn new(offset: usize, length: usize) -> Result<Self> {
        if length == 0 {
            return Err(CorrelateError::InvalidSegment {
                message: "segment length must be positive".into(),
            });
        }
        Ok(Segment { offset, length })
    }

    /// One past the last byte of the range.
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Reads this range out of `buffer`.
    pub fn read<'a>(&self, buffer: &'a [u8]) -> Result<&'a [u8]> {
        buffer
            .get(self.offset..self.end())
            .ok_or(CorrelateError::SegmentOutOfBounds {
                offset: self.offset,
                end: self.end(),
                size: buffer.len(),
            })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.offset, self.end())
    }
}

/// Distinguishes how a source segment is turned into a search pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Opaque bytes, matched exactly.
    Data,
    /// ARMv5 instructions; length is a whole number of 4-byte words.
    Asm,
}

/// A segment to search for, tagged with its interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSegment {
    /// How the bytes are interpreted when compiling a pattern.
    pub kind: SegmentKind,
    /// The underlying byte range.
    pub segment: Segment,
}

impl SourceSegment {
    /// A raw-data segment.
    pub fn data(offset: usize, length: usize) -> Result<Self> {
        Ok(SourceSegment {
            kind: SegmentKind::Data,
            segment: Segment::new(offset, length)?,
        })
    }

    /// An assembly segment; the length must be a multiple of the
    /// 4-byte instruction size.
    pub fn asm(offset: usize, length: usize) -> Result<Self> {
        if length % INSTRUCTION_SIZE != 0 {
            return Err(CorrelateError::InvalidSegment {
                message: format!(
                    "assembly segment length {length} is not a multiple of {INSTRUCTION_SIZE}"
                ),
            });
        }
        Ok(SourceSegment {
            kind: SegmentKind::Asm,
            segment: Segment::new(offset, length)?,
        })
    }
}

impl fmt::Display for SourceSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SegmentKind::Data => write!(f, "data: {}", self.segment),
            SegmentKind::Asm => write!(f, "asm: {}", self.segment),
        }
    }
}
