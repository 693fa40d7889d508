//! Error taxonomy for the diagnosis core
//!
//! Every failure is surfaced to the immediate caller; this crate performs no
//! internal recovery or retry.

use thiserror::Error;

/// Errors raised by the mask builder, scan extractor and cohort aggregator.
#[derive(Debug, Error)]
pub enum DiagnosisError {
    /// Fatal configuration problem: missing atlas files, malformed masks,
    /// mismatched geometry between reference images.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cohort too small for group statistics. The caller may still keep the
    /// per-scan outputs; no dataset-level file is written.
    #[error("cannot run statistics on a sample size smaller than 3 (got {n} scans)")]
    InsufficientSample { n: usize },

    /// Per-scan feature vectors disagree on voxel count. Aggregation fails
    /// rather than truncating or padding.
    #[error("shape mismatch in {context}: expected {expected} values, got {got}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    /// NIfTI read/decode/write failure.
    #[error("NIfTI error: {0}")]
    Nifti(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// PNG figure rendering/encoding failure.
    #[error("figure error: {0}")]
    Figure(String),
}

impl DiagnosisError {
    /// Shorthand for a shape-mismatch error with a named context.
    pub fn shape(context: impl Into<String>, expected: usize, got: usize) -> Self {
        DiagnosisError::ShapeMismatch {
            context: context.into(),
            expected,
            got,
        }
    }
}

pub type Result<T> = std::result::Result<T, DiagnosisError>;
