//! Error types for the quantization and export pipeline.
//!
//! Structural errors (shape, range) are fatal and abort the run before any
//! artifact is written; numeric-tolerance findings are recorded in the export
//! report instead and only surface here through the strict verification entry
//! point.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, QuantError>;

#[derive(Error, Debug)]
pub enum QuantError {
    /// Calibration range collapsed to zero; a derived scale of 0 would divide
    /// by zero downstream. Recoverable only by the caller substituting a
    /// fallback scale.
    #[error("degenerate calibration range for '{tensor}': max |value| is zero or not finite")]
    DegenerateRange { tensor: String },

    /// A quantized value fell outside the signed 8-bit range. Silently
    /// clamping would corrupt exported weights, so this is fatal.
    #[error("quantized value {value} outside int8 range [-128, 127] in '{tensor}'")]
    OutOfRange { tensor: String, value: i32 },

    /// A layer output deviated from the fixed topology's expected shape.
    /// Treated as topology corruption; the pipeline halts with no partial
    /// export.
    #[error("shape mismatch at layer '{layer}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The integer MAC recomputation disagreed with the reference output
    /// beyond tolerance. Only raised by strict verification; the export path
    /// records the finding in the report and proceeds.
    #[error(
        "layer '{layer}' verification exceeded tolerance: max |error| {max_abs_error} \
         ({mismatches}/{total} elements beyond {tolerance})"
    )]
    ToleranceExceeded {
        layer: String,
        max_abs_error: f64,
        tolerance: f64,
        mismatches: usize,
        total: usize,
    },

    /// Artifact write failure with path context.
    #[error("failed to write artifact {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl QuantError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Structural errors must abort before any file is written; tolerance
    /// findings are diagnostics and may be reported instead.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DegenerateRange { .. } | Self::OutOfRange { .. } | Self::ShapeMismatch { .. }
        )
    }
}
