//! Tiled localization over full images.

mod common;

use ndarray::{s, Array2};
use pointpursuit::{
    ForwardModel, ImageConfig, ImageLocalizer, LocalizeError, PatchConfig, PointSource, StopReason,
    TileCap,
};

use common::{closest, noisy_scene};

fn image_localizer(overlap: usize, max_sources: usize, min_improvement: f64) -> ImageLocalizer {
    ImageLocalizer::new(ImageConfig {
        patch: PatchConfig {
            sigma: 1.5,
            patch_size: 16,
            max_sources,
            min_improvement,
            ..Default::default()
        },
        overlap,
        dedup_distance: 1.5,
        tile_cap: TileCap::Fixed,
    })
    .expect("valid config")
}

#[test]
fn test_two_disjoint_tiles_offset_correctly() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    // Each quadrant is rendered as its own 16x16 patch
    let model = ForwardModel::new(1.5, 16).unwrap();
    let mut img = Array2::<f64>::zeros((32, 32));
    img.slice_mut(s![0..16, 0..16])
        .assign(&model.render(&[PointSource::new(5.0, 6.0, 80.0)]));
    img.slice_mut(s![16..32, 16..32])
        .assign(&model.render(&[PointSource::new(9.0, 10.0, 120.0)]));

    let fit = image_localizer(0, 3, 1e-3).localize(img.view()).unwrap();

    assert_eq!(fit.tiles.len(), 4);
    assert_eq!(fit.duplicates_removed, 0);
    assert_eq!(fit.sources.len(), 2, "{:?}", fit.sources);
    let expected = [PointSource::new(5.0, 6.0, 80.0), PointSource::new(25.0, 26.0, 120.0)];
    for e in &expected {
        let (i, d) = closest(&fit.sources, e).unwrap();
        assert!(d < 0.05, "expected {e:?}, got {:?}", fit.sources[i]);
        assert!((fit.sources[i].intensity - e.intensity).abs() / e.intensity < 0.02);
    }
}

#[test]
fn test_overlapping_tiles_do_not_double_count() {
    let truth = [
        PointSource::new(13.5, 13.0, 300.0), // inside the overlap of all four tiles
        PointSource::new(4.0, 22.0, 250.0),
        PointSource::new(22.0, 5.0, 200.0),
    ];
    let img = noisy_scene(28, 28, 1.5, &truth, 0.5, 5);
    let fit = image_localizer(4, 4, 30.0).localize(img.view()).unwrap();

    assert_eq!(fit.sources.len(), truth.len(), "{:?}", fit.sources);
    assert!(fit.duplicates_removed >= 3);
    for t in &truth {
        let (_, d) = closest(&fit.sources, t).unwrap();
        assert!(d < 0.2, "no estimate near {t:?}: {:?}", fit.sources);
    }
}

#[test]
fn test_single_tile_image() {
    let truth = PointSource::new(7.0, 8.0, 60.0);
    let img = noisy_scene(16, 16, 1.5, &[truth], 0.0, 0);
    let fit = image_localizer(4, 2, 1e-3).localize(img.view()).unwrap();
    assert_eq!(fit.tiles.len(), 1);
    assert_eq!(fit.sources.len(), 1);
    assert!(fit.sources[0].distance_to(&truth) < 0.05);
}

#[test]
fn test_f32_input() {
    let truth = PointSource::new(20.0, 9.0, 150.0);
    let img = noisy_scene(20, 30, 1.5, &[truth], 0.0, 0).mapv(|v| v as f32);
    // One source per tile: f32 rounding leaves a residual that a second
    // insertion would otherwise be allowed to fit once it fills the cap.
    let fit = image_localizer(4, 1, 1.0).localize(img.view()).unwrap();
    assert_eq!(fit.sources.len(), 1, "{:?}", fit.sources);
    assert!(fit.sources[0].distance_to(&truth) < 0.05);
}

#[test]
fn test_emitter_just_past_a_seam_is_counted_once() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();

    // Disjoint tiles: the emitter is 2 px past the right edge of tile 0
    let truth = PointSource::new(17.5, 8.0, 2000.0);
    let img = noisy_scene(16, 32, 1.5, &[truth], 0.0, 0);
    let fit = image_localizer(0, 3, 1.0).localize(img.view()).unwrap();

    assert_eq!(fit.tiles.len(), 2);
    assert!(fit.tiles[0].num_sources >= 1, "tail fit expected in tile 0");
    assert_eq!(fit.sources.len(), 1, "{:?}", fit.sources);
    assert!(fit.sources[0].distance_to(&truth) < 0.05, "{:?}", fit.sources[0]);
    assert!((fit.sources[0].intensity - 2000.0).abs() / 2000.0 < 0.01);
}

#[test]
fn test_non_finite_tile_does_not_abort_siblings() {
    let truth = PointSource::new(24.0, 24.0, 100.0);
    let mut img = noisy_scene(32, 32, 1.5, &[truth], 0.0, 0);
    img[[2, 2]] = f64::NAN;

    let fit = image_localizer(0, 2, 1e-3).localize(img.view()).unwrap();

    let bad = fit
        .tiles
        .iter()
        .find(|t| t.origin_row == 0 && t.origin_col == 0)
        .unwrap();
    assert_eq!(bad.stop_reason, StopReason::NonFiniteLoss);
    assert_eq!(bad.num_sources, 0);
    assert_eq!(fit.sources.len(), 1);
    assert!(fit.sources[0].distance_to(&truth) < 0.05);
}

#[test]
fn test_too_small_image_fails_before_processing() {
    let loc = image_localizer(0, 2, 1e-3);
    let img = Array2::<f64>::zeros((16, 10));
    assert_eq!(
        loc.localize(img.view()).unwrap_err(),
        LocalizeError::ImageTooSmall {
            rows: 16,
            cols: 10,
            patch_size: 16
        }
    );
}

#[test]
fn test_parallel_runs_are_identical() {
    let truth: Vec<PointSource> = (0..12)
        .map(|i| {
            let i = i as f64;
            PointSource::new(3.0 + 5.1 * i, 4.0 + 3.7 * ((i * 1.7) % 13.0), 100.0 + 20.0 * i)
        })
        .collect();
    let img = noisy_scene(40, 64, 1.5, &truth, 1.0, 17);
    let loc = image_localizer(4, 5, 25.0);

    let a = loc.localize(img.view()).unwrap();
    let b = loc.localize(img.view()).unwrap();
    assert_eq!(a.sources, b.sources);
    assert_eq!(a.tiles, b.tiles);
}
