//! Error types for the correlation engine.
//!
//! All failures are fatal: they bubble up to the tool boundary and
//! terminate the run. Nothing is retried and partial results are not
//! reported.

use thiserror::Error;

/// Primary error type for the correlation engine.
#[derive(Debug, Error)]
pub enum CorrelateError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A segment was constructed with invalid bounds.
    #[error("invalid segment: {message}")]
    InvalidSegment { message: String },

    /// A segment falls outside the buffer it is read from.
    #[error("segment {offset:#x}..{end:#x} out of bounds for buffer of {size:#x} bytes")]
    SegmentOutOfBounds { offset: usize, end: usize, size: usize },

    /// The requested scan range does not fit the source buffer.
    #[error("scan range {offset:#x}+{length:#x} exceeds source size {size:#x}")]
    InvalidScanRange {
        offset: usize,
        length: usize,
        size: usize,
    },

    /// Invalid chunk size for the chunked correlator.
    #[error("invalid chunk size {value}, must be positive")]
    InvalidChunkSize { value: usize },

    /// The requested xMAP section never appeared in the file.
    #[error("section '{section}' not found in xMAP file")]
    SectionNotFound { section: String },

    /// Structurally malformed xMAP line.
    #[error("xMAP parse error at line {line}: {message}")]
    XmapParse { line: usize, message: String },

    /// Text input that is not valid UTF-8.
    #[error("not valid UTF-8: {path}")]
    Encoding { path: String },
}

/// Result type alias for correlation operations.
pub type Result<T> = std::result::Result<T, CorrelateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CorrelateError::InvalidScanRange {
            offset: 0x100,
            length: 0x40,
            size: 0x80,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x100"));
        assert!(msg.contains("0x80"));
    }

    #[test]
    fn test_xmap_parse_line_number() {
        let err = CorrelateError::XmapParse {
            line: 12,
            message: "unexpected line format".into(),
        };
        assert!(err.to_string().contains("line 12"));
    }
}
