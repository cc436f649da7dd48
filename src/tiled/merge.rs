//! Merge per-tile detections into one global list.
//!
//! Neighboring tiles overlap, so an emitter near a seam may be found by more
//! than one tile. Detections from *different* tiles that lie within the
//! dedup distance of each other are treated as the same emitter and only the
//! brightest is kept. Detections from the same tile are never merged: the
//! patch search already decided they are distinct emitters.
//!
//! An emitter just outside a tile still leaks its PSF tail into that tile,
//! and the bounded refinement pins the resulting fit to the tile edge. Such
//! edge-pinned detections sit too far from the real emitter for the distance
//! test, so they are removed first: a detection clamped against an interior
//! tile edge is dropped when a brighter, unpinned detection from another tile
//! lies beyond that edge within the tail reach.

use crate::point_source::PointSource;

/// A globally positioned source together with the tile that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub source: PointSource,
    pub tile: usize,
    /// Outward normal `(dx, dy)` of the tile edges this source was clamped
    /// against, counting only edges that are not image borders. Each
    /// component is −1, 0 or 1.
    pub pinned: Option<(f64, f64)>,
}

impl Detection {
    /// True when `other` is a brighter, unpinned detection from another tile
    /// lying outside this detection's pinned edge and within `reach`.
    fn explained_by(&self, other: &Detection, reach: f64) -> bool {
        let Some((nx, ny)) = self.pinned else {
            return false;
        };
        if other.tile == self.tile || other.pinned.is_some() {
            return false;
        }
        if other.source.intensity <= self.source.intensity {
            return false;
        }
        let (dx, dy) = (other.source.x - self.source.x, other.source.y - self.source.y);
        dx * nx + dy * ny > 0.0 && dx.hypot(dy) <= reach
    }
}

/// Drop edge-pinned detections explained by an emitter in a neighboring tile.
///
/// Returns the surviving detections in input order.
pub fn drop_edge_ghosts(detections: &[Detection], reach: f64) -> Vec<Detection> {
    detections
        .iter()
        .filter(|d| !detections.iter().any(|other| d.explained_by(other, reach)))
        .copied()
        .collect()
}

/// Remove cross-tile duplicates.
///
/// Candidates are visited brightest first (ties by input order), and a
/// detection survives unless a surviving detection from another tile lies
/// within `dedup_distance`. Survivors are returned in input order, together
/// with the number of removed duplicates.
pub fn deduplicate(detections: &[Detection], dedup_distance: f64) -> (Vec<PointSource>, usize) {
    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| {
        detections[b]
            .source
            .intensity
            .partial_cmp(&detections[a].source.intensity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = vec![false; detections.len()];
    let mut kept: Vec<usize> = Vec::with_capacity(detections.len());
    for &i in &order {
        let d = &detections[i];
        let duplicate = kept.iter().any(|&k| {
            let other = &detections[k];
            other.tile != d.tile && other.source.distance_to(&d.source) <= dedup_distance
        });
        if !duplicate {
            keep[i] = true;
            kept.push(i);
        }
    }

    let survivors: Vec<PointSource> = detections
        .iter()
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|(d, _)| d.source)
        .collect();
    let removed = detections.len() - survivors.len();
    (survivors, removed)
}
