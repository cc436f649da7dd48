//! Single-patch greedy localization.
//!
//! A [`PatchLocalizer`] estimates how many emitters a small patch contains,
//! and where, by alternating two steps:
//!
//! 1. **Insert**: add the source that best explains the current residual
//!    (see [`InsertionStep`]).
//! 2. **Refine**: jointly re-fit every source found so far
//!    (see [`LocalRefinement`]).
//!
//! After each insert/refine pair the loss decrease is checked against
//! `min_improvement`; an insertion that does not pay for itself is rolled
//! back and the search stops. The search is fully deterministic.

mod search;

use ndarray::{Array2, ArrayView2};

use crate::error::{LocalizeError, Result};
use crate::forward::ForwardModel;
use crate::insertion::InsertionStep;
use crate::point_source::PointSource;
use crate::refine::{LocalRefinement, PositionBounds, RefineConfig};

/// Configuration for [`PatchLocalizer`].
#[derive(Debug, Clone)]
pub struct PatchConfig {
    /// Standard deviation of the Gaussian PSF, in pixels. Must be > 0.
    /// Default: 1.5
    pub sigma: f64,

    /// Width and height of the square patch, in pixels. Must be > 0.
    /// Default: 16
    pub patch_size: usize,

    /// Maximum number of sources the search may return.
    /// Default: 10
    pub max_sources: usize,

    /// Minimum loss decrease an insertion (after refinement) must achieve
    /// to be kept. Must be >= 0.
    /// Default: 1e-3
    pub min_improvement: f64,

    /// Number of candidate positions per pixel along each axis in the
    /// insertion search. 2 gives a half-pixel grid.
    /// Default: 2
    pub grid_oversample: usize,

    /// Distance in pixels kept between source positions and the outermost
    /// pixel centers, for both candidates and refined estimates.
    /// Default: 0.0
    pub boundary_margin: f64,

    /// Settings for the joint refinement step.
    pub refine: RefineConfig,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            sigma: 1.5,
            patch_size: 16,
            max_sources: 10,
            min_improvement: 1e-3,
            grid_oversample: 2,
            boundary_margin: 0.0,
            refine: RefineConfig::default(),
        }
    }
}

impl PatchConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        // sigma / patch_size checks live in ForwardModel::new
        if !(self.min_improvement.is_finite() && self.min_improvement >= 0.0) {
            return Err(LocalizeError::InvalidMinImprovement(self.min_improvement));
        }
        if self.grid_oversample == 0 {
            return Err(LocalizeError::InvalidGridOversample);
        }
        let bounds = PositionBounds::for_patch(self.patch_size, self.boundary_margin);
        if !(self.boundary_margin.is_finite() && self.boundary_margin >= 0.0 && bounds.max >= bounds.min) {
            return Err(LocalizeError::InvalidBoundaryMargin {
                margin: self.boundary_margin,
                patch_size: self.patch_size,
            });
        }
        self.refine.validate()
    }
}

/// A block of observed pixels together with its position in the full image.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// Observed intensities, indexed `[[row, col]]`.
    pub pixels: Array2<f64>,
    /// Row of the full image holding `pixels[[0, _]]`.
    pub origin_row: usize,
    /// Column of the full image holding `pixels[[_, 0]]`.
    pub origin_col: usize,
}

impl Patch {
    pub fn new(pixels: Array2<f64>, origin_row: usize, origin_col: usize) -> Self {
        Self {
            pixels,
            origin_row,
            origin_col,
        }
    }

    /// Copy a `size × size` block out of `image` starting at `(row, col)`.
    pub fn extract(image: ArrayView2<f64>, row: usize, col: usize, size: usize) -> Self {
        let pixels = image.slice(ndarray::s![row..row + size, col..col + size]).to_owned();
        Self::new(pixels, row, col)
    }
}

/// Why a patch search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The active set reached `max_sources`.
    MaxSources,
    /// The last insertion improved the loss by less than `min_improvement`
    /// and was rolled back.
    InsufficientImprovement,
    /// No candidate position could lower the loss with a non-negative intensity.
    NoCandidate,
    /// A non-finite loss was encountered; the last finite-loss set was returned.
    NonFiniteLoss,
}

/// Result of localizing one patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchFit {
    /// Accepted sources, in insertion order.
    pub sources: Vec<PointSource>,
    /// Loss of `sources` against the patch.
    pub loss: f64,
    /// Loss of the empty hypothesis (`Σ observed²`).
    pub initial_loss: f64,
    /// Loss of every accepted state, starting with `initial_loss`.
    /// Non-increasing.
    pub loss_history: Vec<f64>,
    pub stop_reason: StopReason,
}

/// Greedy insert/refine search over one square patch.
///
/// Immutable after construction and safe to share between threads; each
/// call to [`localize`](Self::localize) owns its own working buffers.
#[derive(Debug, Clone)]
pub struct PatchLocalizer {
    config: PatchConfig,
    model: ForwardModel,
    insertion: InsertionStep,
    refinement: LocalRefinement,
}

impl PatchLocalizer {
    /// Validate `config` and precompute the candidate templates.
    pub fn new(config: PatchConfig) -> Result<Self> {
        let model = ForwardModel::new(config.sigma, config.patch_size)?;
        config.validate()?;
        let bounds = PositionBounds::for_patch(config.patch_size, config.boundary_margin);
        let insertion = InsertionStep::new(&model, bounds, config.grid_oversample);
        let refinement = LocalRefinement::new(config.refine.clone(), bounds);
        Ok(Self {
            config,
            model,
            insertion,
            refinement,
        })
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    pub fn model(&self) -> &ForwardModel {
        &self.model
    }

    /// Same localizer with a different source cap.
    pub(crate) fn with_max_sources(&self, max_sources: usize) -> Self {
        let mut out = self.clone();
        out.config.max_sources = max_sources;
        out
    }

    fn check_shape(&self, pixels: &ArrayView2<f64>) -> Result<()> {
        let (rows, cols) = pixels.dim();
        let n = self.config.patch_size;
        if rows != n || cols != n {
            return Err(LocalizeError::PatchShapeMismatch {
                rows,
                cols,
                patch_size: n,
            });
        }
        Ok(())
    }
}
