//! Define a point source: a single emitter hypothesis with a sub-pixel
//! position and a non-negative brightness.
//!
//! Point sources are the output of the localization process. Coordinates use
//! the pixel-center convention: pixel index `i` has its center at coordinate `i`.
//!

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSource {
    /// Position in pixels along columns (image x-axis).
    /// +X points right in the image.
    pub x: f64,
    /// Position in pixels along rows (image y-axis).
    /// +Y points down in the image.
    pub y: f64,
    /// Integrated brightness of the emitter, in image intensity units.
    /// Never negative.
    pub intensity: f64,
}

impl PointSource {
    pub fn new(x: f64, y: f64, intensity: f64) -> Self {
        Self { x, y, intensity }
    }

    /// Euclidean distance between the positions of two sources, in pixels.
    pub fn distance_to(&self, other: &PointSource) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Copy of this source shifted by `(dx, dy)` pixels.
    ///
    /// Used to move tile-local detections into global image coordinates.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            intensity: self.intensity,
        }
    }

    /// `true` if position and intensity are all finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.intensity.is_finite()
    }
}
