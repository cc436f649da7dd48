//! Squared-error loss between an observed patch and a rendered hypothesis,
//! with analytic derivatives for refinement.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2, Zip};

use crate::forward::{AxisBuffers, ForwardModel};
use crate::point_source::PointSource;

/// Parameters per source in the refinement vector: `[x, y, intensity]`.
pub const PARAMS_PER_SOURCE: usize = 3;

/// Gradient of the loss with respect to one source's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SourceGradient {
    pub dx: f64,
    pub dy: f64,
    pub dintensity: f64,
}

/// Sum of squared differences between two equally shaped images.
pub fn squared_loss(observed: ArrayView2<f64>, rendered: ArrayView2<f64>) -> f64 {
    Zip::from(observed)
        .and(rendered)
        .fold(0.0, |acc, &o, &m| acc + (o - m) * (o - m))
}

/// Evaluates loss, residual image, gradient and model Jacobian for one patch.
///
/// Holds the render and residual buffers for the patch so repeated evaluations
/// during a search do not allocate.
#[derive(Debug, Clone)]
pub struct ResidualEngine {
    model: ForwardModel,
    rendered: Array2<f64>,
    residual: Array2<f64>,
    buf: AxisBuffers,
}

impl ResidualEngine {
    pub fn new(model: ForwardModel) -> Self {
        let n = model.patch_size();
        Self {
            model,
            rendered: Array2::zeros((n, n)),
            residual: Array2::zeros((n, n)),
            buf: AxisBuffers::new(n),
        }
    }

    pub fn model(&self) -> &ForwardModel {
        &self.model
    }

    /// Compute `Σ (observed − render(sources))²` and keep the residual image
    /// available through [`residual`](Self::residual).
    ///
    /// A non-finite pixel anywhere in `observed` yields a non-finite loss.
    pub fn evaluate(&mut self, observed: ArrayView2<f64>, sources: &[PointSource]) -> f64 {
        debug_assert_eq!(observed.dim(), self.rendered.dim());
        self.model.render_into(sources, &mut self.rendered, &mut self.buf);
        Zip::from(&mut self.residual)
            .and(observed)
            .and(&self.rendered)
            .for_each(|r, &o, &m| *r = o - m);
        self.residual.iter().map(|r| r * r).sum()
    }

    /// Residual image `observed − render(sources)` from the last
    /// [`evaluate`](Self::evaluate) call.
    pub fn residual(&self) -> ArrayView2<'_, f64> {
        self.residual.view()
    }

    /// Loss and its gradient with respect to every source's `(x, y, intensity)`.
    pub fn gradient(&mut self, observed: ArrayView2<f64>, sources: &[PointSource]) -> (f64, Vec<SourceGradient>) {
        let loss = self.evaluate(observed, sources);
        let psf = *self.model.psf();
        let mut grads = Vec::with_capacity(sources.len());
        for s in sources {
            let AxisBuffers { ex, ey, dex, dey } = &mut self.buf;
            psf.axis_profile_with_derivative(s.x, ex, dex);
            psf.axis_profile_with_derivative(s.y, ey, dey);

            // dL/dθ = -2 Σ r · ∂m/∂θ, with m = I · ex[col] · ey[row]
            let mut g_x = 0.0;
            let mut g_y = 0.0;
            let mut g_i = 0.0;
            for (r, row) in self.residual.rows().into_iter().enumerate() {
                let mut r_ex = 0.0;
                let mut r_dex = 0.0;
                for (c, &res) in row.iter().enumerate() {
                    r_ex += res * ex[c];
                    r_dex += res * dex[c];
                }
                g_x += r_dex * ey[r];
                g_y += r_ex * dey[r];
                g_i += r_ex * ey[r];
            }
            grads.push(SourceGradient {
                dx: -2.0 * s.intensity * g_x,
                dy: -2.0 * s.intensity * g_y,
                dintensity: -2.0 * g_i,
            });
        }
        (loss, grads)
    }

    /// Fill `jac` with `∂render/∂θ`, one row per pixel (row-major) and
    /// [`PARAMS_PER_SOURCE`] columns per source.
    pub(crate) fn model_jacobian(&mut self, sources: &[PointSource], jac: &mut DMatrix<f64>) {
        let n = self.model.patch_size();
        debug_assert_eq!(jac.nrows(), n * n);
        debug_assert_eq!(jac.ncols(), sources.len() * PARAMS_PER_SOURCE);
        let psf = *self.model.psf();
        for (k, s) in sources.iter().enumerate() {
            let AxisBuffers { ex, ey, dex, dey } = &mut self.buf;
            psf.axis_profile_with_derivative(s.x, ex, dex);
            psf.axis_profile_with_derivative(s.y, ey, dey);
            let col = k * PARAMS_PER_SOURCE;
            for r in 0..n {
                for c in 0..n {
                    let p = r * n + c;
                    jac[(p, col)] = s.intensity * dex[c] * ey[r];
                    jac[(p, col + 1)] = s.intensity * ex[c] * dey[r];
                    jac[(p, col + 2)] = ex[c] * ey[r];
                }
            }
        }
    }
}
