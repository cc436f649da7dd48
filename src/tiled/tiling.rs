//! Tile layout for large images.

/// One patch-sized window of the full image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Position of this tile in the layout (row-major).
    pub index: usize,
    pub origin_row: usize,
    pub origin_col: usize,
}

/// Tile origins along one axis of length `len`.
///
/// Origins advance by `patch_size - overlap`; the last tile is aligned with
/// the far edge so the whole axis is covered. Requires `len >= patch_size`
/// and `overlap < patch_size`.
pub fn axis_origins(len: usize, patch_size: usize, overlap: usize) -> Vec<usize> {
    debug_assert!(len >= patch_size && overlap < patch_size);
    let stride = patch_size - overlap;
    let last = len - patch_size;
    let mut origins: Vec<usize> = (0..last).step_by(stride).collect();
    origins.push(last);
    origins
}

/// Row-major tile layout covering a `rows × cols` image.
pub fn layout(rows: usize, cols: usize, patch_size: usize, overlap: usize) -> Vec<Tile> {
    let row_origins = axis_origins(rows, patch_size, overlap);
    let col_origins = axis_origins(cols, patch_size, overlap);
    let mut tiles = Vec::with_capacity(row_origins.len() * col_origins.len());
    for &origin_row in &row_origins {
        for &origin_col in &col_origins {
            tiles.push(Tile {
                index: tiles.len(),
                origin_row,
                origin_col,
            });
        }
    }
    tiles
}
