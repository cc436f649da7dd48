//! # pointpursuit
//!
//! Greedy sparse recovery of point emitters (single molecules) in noisy 2D
//! microscope images.
//!
//! Given a background-subtracted image, a known isotropic Gaussian PSF and a
//! squared-error noise model, `pointpursuit` estimates how many emitters are
//! present and where, returning a list of [`PointSource`]s with sub-pixel
//! positions and intensities.
//!
//! ## Example
//!
//! ```no_run
//! use ndarray::Array2;
//! use pointpursuit::{ImageConfig, ImageLocalizer, PatchConfig};
//!
//! let config = ImageConfig {
//!     patch: PatchConfig {
//!         sigma: 1.3,
//!         max_sources: 6,
//!         ..Default::default()
//!     },
//!     overlap: 4,
//!     ..Default::default()
//! };
//! let localizer = ImageLocalizer::new(config).unwrap();
//!
//! let image: Array2<f32> = Array2::zeros((256, 256)); // background-subtracted frame
//! let fit = localizer.localize(image.view()).unwrap();
//! for s in &fit.sources {
//!     println!("x={:.2} y={:.2} I={:.1}", s.x, s.y, s.intensity);
//! }
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Forward model**: sources are rendered with a pixel-integrated Gaussian
//!    PSF (separable, one error-function integral per axis).
//! 2. **Insertion**: the residual is correlated with the PSF on a sub-pixel
//!    grid (matching pursuit) and the best candidate is added with its
//!    least-squares intensity.
//! 3. **Refinement**: all sources are re-fit jointly by bounded, monotone
//!    Levenberg–Marquardt.
//! 4. **Check**: insertions that do not lower the loss by `min_improvement`
//!    are rolled back and the search stops; the search also stops at
//!    `max_sources`.
//! 5. **Tiling**: large images are split into overlapping patch-sized tiles
//!    processed in parallel, then merged with cross-tile deduplication.
//!
//! Coordinates use the pixel-center convention: pixel `[[row, col]]` is
//! centered at `x = col`, `y = row`.

pub mod error;
pub mod forward;
pub mod insertion;
pub mod patch;
mod point_source;
pub mod psf;
pub mod refine;
pub mod residual;
pub mod tiled;

pub use error::{LocalizeError, Result};
pub use forward::ForwardModel;
pub use insertion::InsertionStep;
pub use patch::{Patch, PatchConfig, PatchFit, PatchLocalizer, StopReason};
pub use point_source::*;
pub use psf::GaussianPsf;
pub use refine::{LocalRefinement, PositionBounds, RefineConfig, RefineOutcome, RefineStatus};
pub use residual::{ResidualEngine, SourceGradient};
pub use tiled::{ImageConfig, ImageFit, ImageLocalizer, TileCap, TileReport};
