//! Chunked correlation: slice a source region into fixed-size
//! instruction chunks and find each chunk's matches in every target.

use crate::search::TargetSearcher;
use crate::segment::{Segment, SourceSegment};
use crate::types::MaskOptions;
use crate::{arm, CorrelateError, Result};
use tracing::debug;

/// Raw per-chunk match grid for a set of targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGrid {
    /// Source chunks, in offset order, jointly covering the scan range.
    pub segments: Vec<Segment>,
    /// Matches indexed `[target][segment][match]`; match lists are in
    /// target offset order.
    pub matches: Vec<Vec<Vec<Segment>>>,
}

/// Slice `[offset, offset + length)` of the source into chunks of
/// `chunk_size` instructions (the final chunk may be shorter) and
/// search every target for every chunk.
///
/// `length` defaults to the rest of the source. The scan range must
/// lie within the source and cover a whole number of instructions.
pub fn correlate_chunks<B: AsRef<[u8]>>(
    source: &[u8],
    offset: usize,
    length: Option<usize>,
    chunk_size: usize,
    targets: &[B],
    mask: MaskOptions,
) -> Result<ChunkGrid> {
    if chunk_size == 0 {
        return Err(CorrelateError::InvalidChunkSize { value: chunk_size });
    }
    if offset > source.len() {
        return Err(CorrelateError::InvalidScanRange {
            offset,
            length: length.unwrap_or(0),
            size: source.len(),
        });
    }
    let scan_end = match length {
        Some(length) => {
            if offset + length > source.len() {
                return Err(CorrelateError::InvalidScanRange {
                    offset,
                    length,
                    size: source.len(),
                });
            }
            offset + length
        }
        None => source.len(),
    };
    if (scan_end - offset) % arm::INSTRUCTION_SIZE != 0 {
        return Err(CorrelateError::InvalidSegment {
            message: format!(
                "scan length {} is not a whole number of instructions",
                scan_end - offset
            ),
        });
    }
    debug!("scanning source {offset:#x}..{scan_end:#x}");

    let chunk_len = chunk_size * arm::INSTRUCTION_SIZE;
    let mut chunks = Vec::new();
    let mut at = offset;
    while at < scan_end {
        let len = (at + chunk_len).min(scan_end) - at;
        chunks.push(SourceSegment::asm(at, len)?);
        at += chunk_len;
    }

    // Compile each chunk's pattern once, shared across all targets
    let patterns = chunks
        .iter()
        .map(|chunk| chunk.pattern(source, mask))
        .collect::<Result<Vec<_>>>()?;

    let mut matches = Vec::with_capacity(targets.len());
    for target in targets {
        let mut searcher = TargetSearcher::new(target.as_ref());
        matches.push(
            patterns
                .iter()
                .map(|pattern| searcher.find_all(pattern).to_vec())
                .collect(),
        );
    }

    Ok(ChunkGrid {
        segments: chunks.iter().map(|chunk| chunk.segment).collect(),
        matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // mov rN, rN words are distinct, relocation-insensitive filler
    fn mov(reg: u8) -> [u8; 4] {
        [0x00, reg, 0xA0, 0xE1]
    }

    fn words(regs: &[u8]) -> Vec<u8> {
        regs.iter().flat_map(|&r| mov(r)).collect()
    }

    #[test]
    fn test_chunk_slicing_covers_range() {
        let source = words(&[0, 1, 2, 3, 4]);
        let grid = correlate_chunks(
            &source,
            0,
            None,
            2,
            &[&source],
            MaskOptions::default(),
        )
        .unwrap();
        assert_eq!(
            grid.segments,
            vec![
                Segment { offset: 0, length: 8 },
                Segment { offset: 8, length: 8 },
                Segment { offset: 16, length: 4 },
            ]
        );
    }

    #[test]
    fn test_grid_layout_and_lengths() {
        let source = words(&[1, 2, 3, 4]);
        let target = words(&[9, 1, 2, 3, 4]);
        let grid =
            correlate_chunks(&source, 0, None, 2, &[&target], MaskOptions::default()).unwrap();
        assert_eq!(grid.matches.len(), 1);
        assert_eq!(grid.matches[0].len(), grid.segments.len());
        assert_eq!(
            grid.matches[0][0],
            vec![Segment { offset: 4, length: 8 }]
        );
        assert_eq!(
            grid.matches[0][1],
            vec![Segment { offset: 12, length: 8 }]
        );
    }

    #[test]
    fn test_range_validation() {
        let source = words(&[0, 1]);
        assert!(matches!(
            correlate_chunks(&source, 12, None, 2, &[&source], MaskOptions::default()),
            Err(CorrelateError::InvalidScanRange { .. })
        ));
        assert!(matches!(
            correlate_chunks(&source, 0, Some(12), 2, &[&source], MaskOptions::default()),
            Err(CorrelateError::InvalidScanRange { .. })
        ));
        assert!(matches!(
            correlate_chunks(&source, 0, None, 0, &[&source], MaskOptions::default()),
            Err(CorrelateError::InvalidChunkSize { .. })
        ));
        assert!(matches!(
            correlate_chunks(&source, 0, Some(6), 2, &[&source], MaskOptions::default()),
            Err(CorrelateError::InvalidSegment { .. })
        ));
    }

    #[test]
    fn test_empty_scan_range() {
        let source = words(&[0, 1]);
        let grid =
            correlate_chunks(&source, 8, None, 2, &[&source], MaskOptions::default()).unwrap();
        assert!(grid.segments.is_empty());
        assert_eq!(grid.matches, vec![Vec::<Vec<Segment>>::new()]);
    }
}
