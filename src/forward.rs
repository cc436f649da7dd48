//! Forward model: render a set of point sources into a square patch.

use ndarray::Array2;
use num_traits::Float;

use crate::error::{LocalizeError, Result};
use crate::point_source::PointSource;
use crate::psf::GaussianPsf;

/// Per-axis scratch buffers reused across renders of one patch.
#[derive(Debug, Clone)]
pub(crate) struct AxisBuffers {
    pub ex: Vec<f64>,
    pub ey: Vec<f64>,
    pub dex: Vec<f64>,
    pub dey: Vec<f64>,
}

impl AxisBuffers {
    pub fn new(patch_size: usize) -> Self {
        Self {
            ex: vec![0.0; patch_size],
            ey: vec![0.0; patch_size],
            dex: vec![0.0; patch_size],
            dey: vec![0.0; patch_size],
        }
    }
}

/// Renders point sources into a `patch_size × patch_size` image under a fixed
/// pixel-integrated Gaussian PSF.
///
/// The model is intended for small patches (up to roughly 20×20); larger
/// images should go through [`ImageLocalizer`](crate::ImageLocalizer), which
/// tiles them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardModel {
    psf: GaussianPsf,
    patch_size: usize,
}

impl ForwardModel {
    /// Create a forward model. Fails if `sigma` is not a positive finite number
    /// or `patch_size` is zero.
    pub fn new(sigma: f64, patch_size: usize) -> Result<Self> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(LocalizeError::InvalidSigma(sigma));
        }
        if patch_size == 0 {
            return Err(LocalizeError::InvalidPatchSize);
        }
        Ok(Self {
            psf: GaussianPsf::new(sigma),
            patch_size,
        })
    }

    pub fn sigma(&self) -> f64 {
        self.psf.sigma()
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    pub fn psf(&self) -> &GaussianPsf {
        &self.psf
    }

    /// Render `sources` into a new patch. An empty slice yields the all-zero image.
    pub fn render(&self, sources: &[PointSource]) -> Array2<f64> {
        let mut out = Array2::zeros((self.patch_size, self.patch_size));
        let mut buf = AxisBuffers::new(self.patch_size);
        self.render_into(sources, &mut out, &mut buf);
        out
    }

    /// Render at a caller-chosen precision. Internally computed in `f64` and
    /// converted per pixel.
    pub fn render_as<T: Float>(&self, sources: &[PointSource]) -> Array2<T> {
        self.render(sources)
            .mapv(|v| num_traits::cast::<f64, T>(v).unwrap_or_else(T::nan))
    }

    /// Overwrite `out` with the rendering of `sources`, reusing `buf`.
    pub(crate) fn render_into(&self, sources: &[PointSource], out: &mut Array2<f64>, buf: &mut AxisBuffers) {
        debug_assert_eq!(out.dim(), (self.patch_size, self.patch_size));
        out.fill(0.0);
        let mut view = out.view_mut();
        for s in sources {
            self.psf.accumulate(&mut view, s, &mut buf.ex, &mut buf.ey);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_config() {
        assert_eq!(ForwardModel::new(0.0, 16), Err(LocalizeError::InvalidSigma(0.0)));
        assert!(matches!(ForwardModel::new(f64::NAN, 16), Err(LocalizeError::InvalidSigma(_))));
        assert_eq!(ForwardModel::new(1.5, 0), Err(LocalizeError::InvalidPatchSize));
    }

    #[test]
    fn test_render_empty_is_zero() {
        let model = ForwardModel::new(1.5, 16).unwrap();
        let img = model.render(&[]);
        assert_eq!(img.dim(), (16, 16));
        assert!(img.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_render_conserves_energy_for_centered_source() {
        let model = ForwardModel::new(1.5, 16).unwrap();
        let img = model.render(&[PointSource::new(7.5, 7.5, 10.0)]);
        let total: f64 = img.sum();
        // ±8 px = 5.3 sigma on each side; truncation is negligible
        assert!((total - 10.0).abs() < 1e-4, "total = {total}");
    }

    #[test]
    fn test_render_is_additive() {
        let model = ForwardModel::new(1.2, 12).unwrap();
        let a = PointSource::new(3.0, 4.0, 5.0);
        let b = PointSource::new(8.3, 6.6, 2.0);
        let both = model.render(&[a, b]);
        let sum = model.render(&[a]) + model.render(&[b]);
        for (x, y) in both.iter().zip(sum.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_render_as_f32_matches_f64() {
        let model = ForwardModel::new(1.5, 8).unwrap();
        let src = [PointSource::new(3.5, 3.5, 100.0)];
        let f64_img = model.render(&src);
        let f32_img = model.render_as::<f32>(&src);
        for (a, b) in f64_img.iter().zip(f32_img.iter()) {
            assert!((*a as f32 - b).abs() < 1e-4);
        }
    }
}
