//! Shared helpers for building synthetic scenes.

#![allow(dead_code)]

use ndarray::Array2;
use pointpursuit::{GaussianPsf, PointSource};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Render `sources` with a Gaussian PSF and add seeded white noise.
pub fn noisy_scene(
    rows: usize,
    cols: usize,
    sigma: f64,
    sources: &[PointSource],
    noise_std: f64,
    seed: u64,
) -> Array2<f64> {
    let mut img = GaussianPsf::new(sigma).render_image(rows, cols, sources);
    if noise_std > 0.0 {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, noise_std).unwrap();
        img.mapv_inplace(|v| v + normal.sample(&mut rng));
    }
    img
}

/// Index of the returned source closest to `target`, and its distance.
pub fn closest(sources: &[PointSource], target: &PointSource) -> Option<(usize, f64)> {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| (i, s.distance_to(target)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
}
