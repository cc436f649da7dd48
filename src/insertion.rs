//! Greedy insertion: propose the next emitter by matching pursuit.
//!
//! For every position on a sub-pixel candidate grid the residual image is
//! correlated with the unit-intensity PSF template centered there. The
//! correlation is, up to a factor of −2, the derivative of the loss with
//! respect to the intensity of a new source at that position, so its maximum
//! marks the steepest available loss decrease. The winning candidate's
//! intensity is seeded with the least-squares single-source fit
//! `⟨residual, T⟩ / ‖T‖²`.
//!
//! The template is separable, so the whole correlation map is two small
//! matrix products: `C = Ty · R · Txᵀ`, where each row of `Ty`/`Tx` is the 1D
//! pixel-integral profile of one candidate coordinate.

use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::forward::ForwardModel;
use crate::point_source::PointSource;
use crate::refine::PositionBounds;

/// Intermediate and output arrays of one correlation pass, reused across
/// insertions on the same patch.
#[derive(Debug, Clone)]
pub struct CorrelationBuffers {
    /// `Ty · R`, candidates × patch columns.
    partial: Array2<f64>,
    /// `Ty · R · Txᵀ`, candidates × candidates.
    map: Array2<f64>,
}

impl CorrelationBuffers {
    /// Correlation map from the last pass.
    pub fn map(&self) -> ArrayView2<'_, f64> {
        self.map.view()
    }
}

/// Candidate search for one patch geometry.
///
/// Templates are computed once at construction and shared by every search
/// on patches of that size.
#[derive(Debug, Clone)]
pub struct InsertionStep {
    /// Candidate coordinates along each axis (the grid is square).
    positions: Vec<f64>,
    /// `profiles[[k, i]]` = pixel integral of pixel `i` for a unit source at `positions[k]`.
    profiles: Array2<f64>,
    /// Squared L2 norm of each row of `profiles`.
    norms2: Array1<f64>,
}

impl InsertionStep {
    /// Build the candidate grid: `oversample` candidates per pixel, spanning
    /// `bounds` inclusive of both ends.
    pub fn new(model: &ForwardModel, bounds: PositionBounds, oversample: usize) -> Self {
        let step = 1.0 / oversample.max(1) as f64;
        let span = (bounds.max - bounds.min).max(0.0);
        let count = (span / step + 1e-9).floor() as usize + 1;
        let positions: Vec<f64> = (0..count).map(|k| bounds.min + k as f64 * step).collect();

        let n = model.patch_size();
        let mut profiles = Array2::<f64>::zeros((count, n));
        let mut line = vec![0.0; n];
        for (mut row, &p) in profiles.rows_mut().into_iter().zip(&positions) {
            model.psf().axis_profile(p, &mut line);
            row.assign(&ArrayView1::from(&line[..]));
        }
        let norms2 = profiles.map_axis(ndarray::Axis(1), |r| r.dot(&r));

        Self {
            positions,
            profiles,
            norms2,
        }
    }

    /// Candidate coordinates along one axis.
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    /// Buffers sized for this grid and patch.
    pub fn buffers(&self) -> CorrelationBuffers {
        let (count, n) = self.profiles.dim();
        CorrelationBuffers {
            partial: Array2::zeros((count, n)),
            map: Array2::zeros((count, count)),
        }
    }

    /// Correlation of `residual` with the unit template at every candidate.
    ///
    /// Entry `[[j, i]]` is the candidate at `(x = positions[i], y = positions[j])`.
    pub fn correlation_map(&self, residual: ArrayView2<f64>) -> Array2<f64> {
        let mut buf = self.buffers();
        self.correlate_into(residual, &mut buf);
        buf.map
    }

    /// Fill `buf.map` with the correlation map of `residual`.
    pub fn correlate_into(&self, residual: ArrayView2<f64>, buf: &mut CorrelationBuffers) {
        general_mat_mul(1.0, &self.profiles, &residual, 0.0, &mut buf.partial);
        general_mat_mul(1.0, &buf.partial, &self.profiles.t(), 0.0, &mut buf.map);
    }

    /// Propose the next source for `residual`.
    ///
    /// Returns `None` when no candidate has a positive correlation, i.e. no
    /// non-negative intensity at any grid position would reduce the loss.
    /// Ties are broken by the lowest `(row, column)` index.
    pub fn propose(&self, residual: ArrayView2<f64>) -> Option<PointSource> {
        self.propose_with(residual, &mut self.buffers())
    }

    /// [`propose`](Self::propose) using caller-owned buffers.
    pub fn propose_with(&self, residual: ArrayView2<f64>, buf: &mut CorrelationBuffers) -> Option<PointSource> {
        self.correlate_into(residual, buf);
        let mut best: Option<(usize, usize, f64)> = None;
        for ((j, i), &c) in buf.map.indexed_iter() {
            let better = match best {
                None => c > 0.0,
                Some((_, _, b)) => c > b,
            };
            if better && c.is_finite() {
                best = Some((j, i, c));
            }
        }

        let (j, i, c) = best?;
        let norm2 = self.norms2[i] * self.norms2[j];
        if norm2 <= 0.0 {
            return None;
        }
        Some(PointSource::new(self.positions[i], self.positions[j], c / norm2))
    }
}
