//! Pixel-integrated isotropic Gaussian point-spread function.
//!
//! A point emitter at `(x, y)` with unit intensity deposits into pixel
//! `(row, col)` the integral of a normalized 2D Gaussian over that pixel's
//! footprint `[col - ½, col + ½] × [row - ½, row + ½]`. Because the Gaussian is
//! separable, the integral factors into two 1D integrals,
//!
//! ```text
//! E(i; c) = Φ((i + ½ - c) / σ) - Φ((i - ½ - c) / σ)
//! ```
//!
//! where `Φ` is the standard normal CDF (computed with the error function).
//! The pixel value is `intensity · E(col; x) · E(row; y)`.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use ndarray::{Array2, ArrayViewMut2};
use statrs::function::erf::erf;

use crate::point_source::PointSource;

/// Standard normal CDF.
#[inline]
fn normal_cdf(u: f64) -> f64 {
    0.5 * (1.0 + erf(u * FRAC_1_SQRT_2))
}

/// Standard normal PDF.
#[inline]
fn normal_pdf(u: f64) -> f64 {
    (-0.5 * u * u).exp() / (2.0 * PI).sqrt()
}

/// Isotropic Gaussian PSF integrated over square pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianPsf {
    sigma: f64,
}

impl GaussianPsf {
    /// Create a PSF with standard deviation `sigma` (pixels).
    ///
    /// `sigma` is not validated here; the localizers validate it at construction.
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Fraction of a unit emitter centered at `center` that falls in pixel `index`
    /// along one axis.
    #[inline]
    pub fn pixel_integral(&self, index: usize, center: f64) -> f64 {
        let lo = (index as f64 - 0.5 - center) / self.sigma;
        let hi = (index as f64 + 0.5 - center) / self.sigma;
        normal_cdf(hi) - normal_cdf(lo)
    }

    /// Fill `values[i]` with the 1D pixel integral for every pixel along one axis.
    pub fn axis_profile(&self, center: f64, values: &mut [f64]) {
        for (i, v) in values.iter_mut().enumerate() {
            *v = self.pixel_integral(i, center);
        }
    }

    /// Like [`axis_profile`](Self::axis_profile), also filling `derivs[i]` with
    /// the derivative of each pixel integral with respect to `center`.
    pub fn axis_profile_with_derivative(&self, center: f64, values: &mut [f64], derivs: &mut [f64]) {
        debug_assert_eq!(values.len(), derivs.len());
        let inv_sigma = 1.0 / self.sigma;
        for (i, (v, d)) in values.iter_mut().zip(derivs.iter_mut()).enumerate() {
            let lo = (i as f64 - 0.5 - center) * inv_sigma;
            let hi = (i as f64 + 0.5 - center) * inv_sigma;
            *v = normal_cdf(hi) - normal_cdf(lo);
            // d/dc Φ((i ± ½ - c)/σ) = -φ(·)/σ
            *d = (normal_pdf(lo) - normal_pdf(hi)) * inv_sigma;
        }
    }

    /// Add `source` into `image`, using `col_buf`/`row_buf` as scratch space.
    ///
    /// The scratch slices must be at least as long as the image has columns
    /// and rows respectively.
    pub fn accumulate(
        &self,
        image: &mut ArrayViewMut2<f64>,
        source: &PointSource,
        col_buf: &mut [f64],
        row_buf: &mut [f64],
    ) {
        let (rows, cols) = image.dim();
        let ex = &mut col_buf[..cols];
        let ey = &mut row_buf[..rows];
        self.axis_profile(source.x, ex);
        self.axis_profile(source.y, ey);
        for (r, mut row) in image.rows_mut().into_iter().enumerate() {
            let wy = source.intensity * ey[r];
            if wy == 0.0 {
                continue;
            }
            for (px, &wx) in row.iter_mut().zip(ex.iter()) {
                *px += wy * wx;
            }
        }
    }

    /// Render `sources` into a fresh `rows × cols` image.
    ///
    /// Unlike [`ForwardModel`](crate::ForwardModel) this is not tied to a patch
    /// size and is suitable for building whole synthetic scenes.
    pub fn render_image(&self, rows: usize, cols: usize, sources: &[PointSource]) -> Array2<f64> {
        let mut image = Array2::<f64>::zeros((rows, cols));
        let mut col_buf = vec![0.0; cols];
        let mut row_buf = vec![0.0; rows];
        let mut view = image.view_mut();
        for s in sources {
            self.accumulate(&mut view, s, &mut col_buf, &mut row_buf);
        }
        image
    }
}
