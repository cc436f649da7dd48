//! Error type for localizer construction and input validation.

use thiserror::Error;

/// Errors reported by the localizers.
///
/// Configuration variants are only produced by constructors; a localizer
/// that was built successfully never reports them. Non-finite pixel data is
/// not an error: it surfaces as [`StopReason::NonFiniteLoss`](crate::StopReason)
/// on the affected patch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocalizeError {
    #[error("PSF sigma must be finite and > 0, got {0}")]
    InvalidSigma(f64),
    #[error("patch size must be > 0")]
    InvalidPatchSize,
    #[error("min_improvement must be finite and >= 0, got {0}")]
    InvalidMinImprovement(f64),
    #[error("boundary margin {margin} leaves no interior in a {patch_size}px patch")]
    InvalidBoundaryMargin { margin: f64, patch_size: usize },
    #[error("candidate grid oversampling must be >= 1")]
    InvalidGridOversample,
    #[error("invalid refinement configuration: {0}")]
    InvalidRefineConfig(&'static str),
    #[error("tile overlap {overlap} must be smaller than the patch size {patch_size}")]
    InvalidOverlap { overlap: usize, patch_size: usize },
    #[error("dedup distance must be finite and >= 0, got {0}")]
    InvalidDedupDistance(f64),
    #[error("expected source density must be finite and > 0, got {0}")]
    InvalidDensity(f64),
    #[error("image of {rows}x{cols} px is smaller than the {patch_size}px patch size")]
    ImageTooSmall {
        rows: usize,
        cols: usize,
        patch_size: usize,
    },
    #[error("patch is {rows}x{cols} px, expected {patch_size}x{patch_size}")]
    PatchShapeMismatch {
        rows: usize,
        cols: usize,
        patch_size: usize,
    },
    #[error("pixel data length ({len}) does not match width*height ({width}x{height})")]
    PixelCountMismatch {
        len: usize,
        width: usize,
        height: usize,
    },
}

pub type Result<T> = std::result::Result<T, LocalizeError>;
