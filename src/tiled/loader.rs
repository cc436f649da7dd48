//! Run the image localizer directly on image files.
//!
//! Requires the `image` feature to be enabled. Pixel values are used as-is,
//! so the image is expected to be background-subtracted already.
//!
//! # Example
//!
//! ```no_run
//! use pointpursuit::{ImageConfig, ImageLocalizer};
//! use pointpursuit::tiled::loader::localize_image_file;
//!
//! let localizer = ImageLocalizer::new(ImageConfig::default()).unwrap();
//! let fit = localize_image_file("frame_0001.tiff", &localizer).unwrap();
//! println!("Found {} emitters", fit.sources.len());
//! ```

use anyhow::{Context, Result};
use image::GenericImageView;

use super::{ImageFit, ImageLocalizer};

/// Load the image at `path` and localize it.
pub fn localize_image_file(
    path: impl AsRef<std::path::Path>,
    localizer: &ImageLocalizer,
) -> Result<ImageFit> {
    let img = image::open(path.as_ref())
        .with_context(|| format!("Failed to open image: {}", path.as_ref().display()))?;
    localize_dynamic_image(&img, localizer)
}

/// Localize an already-loaded [`image::DynamicImage`].
pub fn localize_dynamic_image(img: &image::DynamicImage, localizer: &ImageLocalizer) -> Result<ImageFit> {
    let (width, height) = img.dimensions();
    let gray = to_grayscale_f32(img);
    localizer
        .localize_raw(&gray, width as usize, height as usize)
        .context("Localization failed")
}

/// Convert a DynamicImage to row-major grayscale `f32` values.
fn to_grayscale_f32(img: &image::DynamicImage) -> Vec<f32> {
    use image::DynamicImage;
    // Rec. 709 luma
    let luma = |r: f32, g: f32, b: f32| 0.2126 * r + 0.7152 * g + 0.0722 * b;
    match img {
        DynamicImage::ImageLuma16(g) => g.as_raw().iter().map(|&v| v as f32).collect(),
        DynamicImage::ImageLumaA16(g) => g.pixels().map(|p| p.0[0] as f32).collect(),
        DynamicImage::ImageRgb16(rgb) => rgb
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                luma(r as f32, g as f32, b as f32)
            })
            .collect(),
        DynamicImage::ImageRgba16(rgba) => rgba
            .pixels()
            .map(|p| {
                let [r, g, b, _] = p.0;
                luma(r as f32, g as f32, b as f32)
            })
            .collect(),
        DynamicImage::ImageRgb32F(rgb) => rgb
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                luma(r, g, b)
            })
            .collect(),
        DynamicImage::ImageRgba32F(rgba) => rgba
            .pixels()
            .map(|p| {
                let [r, g, b, _] = p.0;
                luma(r, g, b)
            })
            .collect(),
        // 8-bit and other formats: convert via luma8
        _ => img.to_luma8().as_raw().iter().map(|&v| v as f32).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageConfig, PatchConfig, PointSource};

    fn single_source_localizer() -> ImageLocalizer {
        ImageLocalizer::new(ImageConfig {
            patch: PatchConfig {
                max_sources: 1,
                ..Default::default()
            },
            overlap: 0,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_localize_luma16_image() {
        let psf = crate::GaussianPsf::new(1.5);
        let truth = PointSource::new(9.0, 7.0, 20000.0);
        let rendered = psf.render_image(16, 16, &[truth]);
        let buf = image::ImageBuffer::from_fn(16, 16, |x, y| {
            image::Luma([rendered[[y as usize, x as usize]].round() as u16])
        });
        let img = image::DynamicImage::ImageLuma16(buf);

        let fit = localize_dynamic_image(&img, &single_source_localizer()).unwrap();
        assert_eq!(fit.sources.len(), 1);
        assert!(fit.sources[0].distance_to(&truth) < 0.05, "{:?}", fit.sources[0]);
    }

    #[test]
    fn test_rgba16_keeps_full_bit_depth() {
        let psf = crate::GaussianPsf::new(1.5);
        let truth = PointSource::new(6.0, 10.0, 20000.0);
        let rendered = psf.render_image(16, 16, &[truth]);
        let buf = image::ImageBuffer::from_fn(16, 16, |x, y| {
            let v = rendered[[y as usize, x as usize]].round() as u16;
            image::Rgba([v, v, v, u16::MAX])
        });
        let img = image::DynamicImage::ImageRgba16(buf);

        let gray = to_grayscale_f32(&img);
        let peak = gray.iter().cloned().fold(f32::MIN, f32::max);
        let expected = rendered.iter().cloned().fold(f64::MIN, f64::max).round() as f32;
        assert!((peak - expected).abs() < 1.0, "peak {peak} vs {expected}");

        let fit = localize_dynamic_image(&img, &single_source_localizer()).unwrap();
        assert_eq!(fit.sources.len(), 1);
        assert!(fit.sources[0].distance_to(&truth) < 0.05, "{:?}", fit.sources[0]);
        assert!((fit.sources[0].intensity - 20000.0).abs() / 20000.0 < 0.01);
    }
}
