//! Localization over images larger than one patch.
//!
//! The image is cut into overlapping `patch_size × patch_size` tiles
//! ([`tiling`]), every tile is localized independently and in parallel by a
//! shared [`PatchLocalizer`], and the per-tile results are translated to
//! global coordinates and deduplicated across tile seams ([`merge`]).
//!
//! Tiles only read the input image. Each returns its own detections, and the
//! merge runs on the calling thread once every tile has finished.

#[cfg(feature = "image")]
pub mod loader;
pub mod merge;
pub mod tiling;

use std::time::Instant;

use ndarray::{s, Array2, ArrayView2};
use num_traits::Float;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{LocalizeError, Result};
use crate::patch::{PatchConfig, PatchLocalizer, StopReason};
use crate::point_source::PointSource;
use crate::refine::PositionBounds;

use merge::{deduplicate, drop_edge_ghosts, Detection};
use tiling::Tile;

/// How far, in sigmas, a PSF tail from outside a tile can pull an edge fit.
const TAIL_REACH_SIGMAS: f64 = 4.0;

/// How many sources each tile may hold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TileCap {
    /// Use `patch.max_sources` for every tile.
    Fixed,
    /// Expected emitters per pixel; the cap is `ceil(density · patch_size²)`,
    /// never more than `patch.max_sources`.
    Density(f64),
}

/// Configuration for [`ImageLocalizer`].
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Per-tile search settings. `patch.patch_size` is the tile size.
    pub patch: PatchConfig,

    /// Pixels shared by neighboring tiles. Must be smaller than the tile size.
    /// Default: 4
    pub overlap: usize,

    /// Detections from different tiles closer than this (pixels) are merged,
    /// keeping the brighter one.
    /// Default: 1.5 (one default sigma)
    pub dedup_distance: f64,

    /// Per-tile source cap policy.
    /// Default: [`TileCap::Fixed`]
    pub tile_cap: TileCap,
}

impl Default for ImageConfig {
    fn default() -> Self {
        let patch = PatchConfig::default();
        let dedup_distance = patch.sigma;
        Self {
            patch,
            overlap: 4,
            dedup_distance,
            tile_cap: TileCap::Fixed,
        }
    }
}

/// Outcome of one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileReport {
    pub origin_row: usize,
    pub origin_col: usize,
    /// Sources found in this tile before deduplication.
    pub num_sources: usize,
    pub loss: f64,
    pub stop_reason: StopReason,
}

/// Result of localizing a full image.
#[derive(Debug, Clone)]
pub struct ImageFit {
    /// Deduplicated sources in global image coordinates. Order is tile-major
    /// and carries no further meaning.
    pub sources: Vec<PointSource>,
    /// One report per tile, row-major.
    pub tiles: Vec<TileReport>,
    /// Detections removed by the merge: cross-tile duplicates and edge fits
    /// of emitters that belong to a neighboring tile.
    pub duplicates_removed: usize,
    /// Wall-clock time, in milliseconds.
    pub elapsed_ms: f32,
}

/// Tiled, parallel localization of a large image.
#[derive(Debug, Clone)]
pub struct ImageLocalizer {
    config: ImageConfig,
    tile_localizer: PatchLocalizer,
}

impl ImageLocalizer {
    /// Validate `config` and build the per-tile localizer.
    pub fn new(config: ImageConfig) -> Result<Self> {
        let base = PatchLocalizer::new(config.patch.clone())?;
        let n = config.patch.patch_size;
        if config.overlap >= n {
            return Err(LocalizeError::InvalidOverlap {
                overlap: config.overlap,
                patch_size: n,
            });
        }
        if !(config.dedup_distance.is_finite() && config.dedup_distance >= 0.0) {
            return Err(LocalizeError::InvalidDedupDistance(config.dedup_distance));
        }
        let tile_localizer = match config.tile_cap {
            TileCap::Fixed => base,
            TileCap::Density(d) => {
                if !(d.is_finite() && d > 0.0) {
                    return Err(LocalizeError::InvalidDensity(d));
                }
                let cap = (d * (n * n) as f64).ceil() as usize;
                base.with_max_sources(cap.min(config.patch.max_sources))
            }
        };
        Ok(Self {
            config,
            tile_localizer,
        })
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Source cap actually applied to each tile.
    pub fn tile_max_sources(&self) -> usize {
        self.tile_localizer.config().max_sources
    }

    /// Localize every source in `image` (indexed `[[row, col]]`).
    ///
    /// Pixels are converted to `f64` once; values that cannot be represented
    /// become NaN and only affect the tiles containing them.
    pub fn localize<T: Float>(&self, image: ArrayView2<T>) -> Result<ImageFit> {
        let image: Array2<f64> = image.mapv(|v| v.to_f64().unwrap_or(f64::NAN));
        self.localize_f64(image.view())
    }

    /// Localize a row-major buffer of `width × height` pixels.
    pub fn localize_raw(&self, pixels: &[f32], width: usize, height: usize) -> Result<ImageFit> {
        let mismatch = || LocalizeError::PixelCountMismatch {
            len: pixels.len(),
            width,
            height,
        };
        if pixels.len() != width * height {
            return Err(mismatch());
        }
        let view = ArrayView2::from_shape((height, width), pixels).map_err(|_| mismatch())?;
        self.localize(view)
    }

    fn localize_f64(&self, image: ArrayView2<f64>) -> Result<ImageFit> {
        let t0 = Instant::now();
        let (rows, cols) = image.dim();
        let n = self.config.patch.patch_size;
        if rows < n || cols < n {
            return Err(LocalizeError::ImageTooSmall {
                rows,
                cols,
                patch_size: n,
            });
        }

        let tiles = tiling::layout(rows, cols, n, self.config.overlap);
        let fits = tiles
            .par_iter()
            .map(|t: &Tile| {
                let view = image.slice(s![t.origin_row..t.origin_row + n, t.origin_col..t.origin_col + n]);
                self.tile_localizer.localize(view).map(|fit| (*t, fit))
            })
            .collect::<Result<Vec<_>>>()?;

        // ── Merge (single writer) ──
        let bounds = PositionBounds::for_patch(n, self.config.patch.boundary_margin);
        let mut detections = Vec::new();
        let mut reports = Vec::with_capacity(fits.len());
        for (tile, fit) in &fits {
            if fit.stop_reason == StopReason::NonFiniteLoss {
                warn!(
                    "Tile at ({}, {}) hit a non-finite loss; kept {} sources",
                    tile.origin_row,
                    tile.origin_col,
                    fit.sources.len()
                );
            }
            let (dx, dy) = (tile.origin_col as f64, tile.origin_row as f64);
            detections.extend(fit.sources.iter().map(|s| Detection {
                source: s.translated(dx, dy),
                tile: tile.index,
                pinned: pinned_edge(s, tile, &bounds, rows, cols, n),
            }));
            reports.push(TileReport {
                origin_row: tile.origin_row,
                origin_col: tile.origin_col,
                num_sources: fit.sources.len(),
                loss: fit.loss,
                stop_reason: fit.stop_reason,
            });
        }
        let reach = TAIL_REACH_SIGMAS * self.config.patch.sigma;
        let candidates = drop_edge_ghosts(&detections, reach);
        let (sources, _) = deduplicate(&candidates, self.config.dedup_distance);
        let duplicates_removed = detections.len() - sources.len();
        let elapsed_ms = t0.elapsed().as_secs_f32() * 1000.0;

        info!(
            "Localized {}x{} image in {} tiles: {} detections, {} duplicates removed, {} sources ({:.1} ms)",
            rows,
            cols,
            reports.len(),
            detections.len(),
            duplicates_removed,
            sources.len(),
            elapsed_ms
        );

        Ok(ImageFit {
            sources,
            tiles: reports,
            duplicates_removed,
            elapsed_ms,
        })
    }
}

/// Outward normal of the interior tile edges `s` (tile-local) is clamped to.
fn pinned_edge(
    s: &PointSource,
    tile: &Tile,
    bounds: &PositionBounds,
    rows: usize,
    cols: usize,
    n: usize,
) -> Option<(f64, f64)> {
    let side = |v: f64, origin: usize, len: usize| {
        if v <= bounds.min && origin > 0 {
            -1.0
        } else if v >= bounds.max && origin + n < len {
            1.0
        } else {
            0.0
        }
    };
    let nx = side(s.x, tile.origin_col, cols);
    let ny = side(s.y, tile.origin_row, rows);
    (nx != 0.0 || ny != 0.0).then_some((nx, ny))
}
