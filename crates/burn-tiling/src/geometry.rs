//! Tile geometry: grid position to pixel and latent coordinates
//!
//! Tiles are laid out on a regular grid. Tile `(row, col)` starts at
//! `row * (tile_height - row_overlap)` pixels down and
//! `col * (tile_width - col_overlap)` pixels across, and every tile has the
//! same size. Latent coordinates are pixel coordinates divided by
//! [`LATENT_SCALE`].

use std::fmt;
use std::ops::Range;

use crate::error::{Result, TilingError};
use crate::interval::{Interval, IntervalSet};

/// Spatial downscale factor between pixel space and latent space
pub const LATENT_SCALE: usize = 8;

/// Spatial axis of the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Rows,
    Cols,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Rows => write!(f, "rows"),
            Axis::Cols => write!(f, "cols"),
        }
    }
}

/// Rectangular region `[row_start, row_end) x [col_start, col_end)`
///
/// The same type is used for pixel and latent coordinates; which one a value
/// holds is determined by the function that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRegion {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl TileRegion {
    pub fn new(row_start: usize, row_end: usize, col_start: usize, col_end: usize) -> Self {
        Self {
            row_start,
            row_end,
            col_start,
            col_end,
        }
    }

    pub fn from_intervals(rows: Interval, cols: Interval) -> Self {
        Self::new(rows.start, rows.end, cols.start, cols.end)
    }

    pub fn height(&self) -> usize {
        self.row_end.saturating_sub(self.row_start)
    }

    pub fn width(&self) -> usize {
        self.col_end.saturating_sub(self.col_start)
    }

    pub fn is_empty(&self) -> bool {
        self.height() == 0 || self.width() == 0
    }

    pub fn rows(&self) -> Interval {
        Interval::new(self.row_start, self.row_end)
    }

    pub fn cols(&self) -> Interval {
        Interval::new(self.col_start, self.col_end)
    }

    pub fn row_range(&self) -> Range<usize> {
        self.row_start..self.row_end
    }

    pub fn col_range(&self) -> Range<usize> {
        self.col_start..self.col_end
    }

    /// Full 4D slice over `[batch, channels, rows, cols]`
    pub fn slice_ranges(&self, batch: usize, channels: usize) -> [Range<usize>; 4] {
        [0..batch, 0..channels, self.row_range(), self.col_range()]
    }

    /// True when `other` lies entirely inside this region
    pub fn contains_region(&self, other: &TileRegion) -> bool {
        other.row_start >= self.row_start
            && other.row_end <= self.row_end
            && other.col_start >= self.col_start
            && other.col_end <= self.col_end
    }

    /// Overlap of two regions, or `None` if they are disjoint
    pub fn intersection(&self, other: &TileRegion) -> Option<TileRegion> {
        let region = TileRegion::new(
            self.row_start.max(other.row_start),
            self.row_end.min(other.row_end),
            self.col_start.max(other.col_start),
            self.col_end.min(other.col_end),
        );
        if region.row_start < region.row_end && region.col_start < region.col_end {
            Some(region)
        } else {
            None
        }
    }
}

impl fmt::Display for TileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows {}..{} cols {}..{}",
            self.row_start, self.row_end, self.col_start, self.col_end
        )
    }
}

/// Pixel region covered by tile `(tile_row, tile_col)`
///
/// No clamping is applied, callers are responsible for keeping the tile
/// inside the canvas.
pub fn tile_to_pixel(
    tile_row: usize,
    tile_col: usize,
    tile_width: usize,
    tile_height: usize,
    row_overlap: usize,
    col_overlap: usize,
) -> TileRegion {
    let row_start = if tile_row == 0 {
        0
    } else {
        tile_row * (tile_height - row_overlap)
    };
    let col_start = if tile_col == 0 {
        0
    } else {
        tile_col * (tile_width - col_overlap)
    };
    TileRegion::new(
        row_start,
        row_start + tile_height,
        col_start,
        col_start + tile_width,
    )
}

/// Convert a pixel region to latent coordinates (truncating division)
pub fn pixel_to_latent(region: TileRegion) -> TileRegion {
    TileRegion::new(
        region.row_start / LATENT_SCALE,
        region.row_end / LATENT_SCALE,
        region.col_start / LATENT_SCALE,
        region.col_end / LATENT_SCALE,
    )
}

/// Canvas size along one axis: `tile + (count - 1) * (tile - overlap)`
pub fn canvas_extent(tile_size: usize, overlap: usize, count: usize) -> usize {
    tile_size + count.saturating_sub(1) * (tile_size - overlap)
}

/// Grid layout shared by every stage of a tiled run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub grid_rows: usize,
    pub grid_cols: usize,
    pub tile_width: usize,
    pub tile_height: usize,
    pub row_overlap: usize,
    pub col_overlap: usize,
}

impl TileGeometry {
    /// Create a validated geometry
    ///
    /// Tile sizes and overlaps must be multiples of [`LATENT_SCALE`] so that
    /// latent coordinates are exact, and each overlap must be smaller than
    /// the tile on that axis.
    pub fn new(
        grid_rows: usize,
        grid_cols: usize,
        tile_width: usize,
        tile_height: usize,
        row_overlap: usize,
        col_overlap: usize,
    ) -> Result<Self> {
        let geometry = Self {
            grid_rows,
            grid_cols,
            tile_width,
            tile_height,
            row_overlap,
            col_overlap,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(TilingError::InvalidGeometry(msg)) };

        if self.grid_rows == 0 || self.grid_cols == 0 {
            return invalid(format!(
                "grid must have at least one tile, got {}x{}",
                self.grid_rows, self.grid_cols
            ));
        }
        for (name, value) in [
            ("tile_width", self.tile_width),
            ("tile_height", self.tile_height),
        ] {
            if value == 0 || value % LATENT_SCALE != 0 {
                return invalid(format!(
                    "{name} must be a positive multiple of {LATENT_SCALE}, got {value}"
                ));
            }
        }
        for (name, value) in [
            ("tile_row_overlap", self.row_overlap),
            ("tile_col_overlap", self.col_overlap),
        ] {
            if value % LATENT_SCALE != 0 {
                return invalid(format!(
                    "{name} must be a multiple of {LATENT_SCALE}, got {value}"
                ));
            }
        }
        if self.row_overlap >= self.tile_height {
            return invalid(format!(
                "tile_row_overlap ({}) must be smaller than tile_height ({})",
                self.row_overlap, self.tile_height
            ));
        }
        if self.col_overlap >= self.tile_width {
            return invalid(format!(
                "tile_col_overlap ({}) must be smaller than tile_width ({})",
                self.col_overlap, self.tile_width
            ));
        }
        Ok(())
    }

    /// Canvas height in pixels
    pub fn height(&self) -> usize {
        canvas_extent(self.tile_height, self.row_overlap, self.grid_rows)
    }

    /// Canvas width in pixels
    pub fn width(&self) -> usize {
        canvas_extent(self.tile_width, self.col_overlap, self.grid_cols)
    }

    pub fn latent_height(&self) -> usize {
        self.height() / LATENT_SCALE
    }

    pub fn latent_width(&self) -> usize {
        self.width() / LATENT_SCALE
    }

    pub fn latent_tile_height(&self) -> usize {
        self.tile_height / LATENT_SCALE
    }

    pub fn latent_tile_width(&self) -> usize {
        self.tile_width / LATENT_SCALE
    }

    /// Whole canvas as a latent region
    pub fn latent_canvas(&self) -> TileRegion {
        TileRegion::new(0, self.latent_height(), 0, self.latent_width())
    }

    pub fn num_tiles(&self) -> usize {
        self.grid_rows * self.grid_cols
    }

    /// All tile positions in row-major order
    pub fn tiles(&self) -> impl Iterator<Item = (usize, usize)> {
        let cols = self.grid_cols;
        (0..self.num_tiles()).map(move |i| (i / cols, i % cols))
    }

    pub fn tile_to_pixel(&self, row: usize, col: usize) -> TileRegion {
        tile_to_pixel(
            row,
            col,
            self.tile_width,
            self.tile_height,
            self.row_overlap,
            self.col_overlap,
        )
    }

    /// Inclusive latent region of a tile, overlapping its neighbours
    pub fn tile_to_latent(&self, row: usize, col: usize) -> TileRegion {
        pixel_to_latent(self.tile_to_pixel(row, col))
    }

    /// Latent region claimed by this tile alone
    ///
    /// Computed per axis: the row extents of tiles in other grid rows are
    /// subtracted from this tile's row extent, and the column extents of
    /// tiles in other grid columns from its column extent. Tiles sharing a
    /// grid row share the exact row extent, so they take no part in the row
    /// subtraction. In a 1xN or Nx1 grid the overlapping axis is therefore
    /// still trimmed, so the exclusive region is smaller than the inclusive
    /// one whenever neighbours overlap.
    ///
    /// The result is the separable residual, not a true 2D set difference.
    /// A residual that splits into several intervals is reported as
    /// [`TilingError::FragmentedExclusiveRegion`], and one that vanishes as
    /// [`TilingError::EmptyExclusiveRegion`].
    pub fn tile_to_latent_exclusive(&self, tile_row: usize, tile_col: usize) -> Result<TileRegion> {
        let own = self.tile_to_latent(tile_row, tile_col);
        let mut rows = IntervalSet::from_interval(own.rows());
        let mut cols = IntervalSet::from_interval(own.cols());

        for (row, col) in self.tiles() {
            if (row, col) == (tile_row, tile_col) {
                continue;
            }
            let other = self.tile_to_latent(row, col);
            if row != tile_row {
                rows.subtract(other.rows());
            }
            if col != tile_col {
                cols.subtract(other.cols());
            }
        }

        let rows = Self::collapse(rows, tile_row, tile_col, Axis::Rows)?;
        let cols = Self::collapse(cols, tile_row, tile_col, Axis::Cols)?;
        Ok(TileRegion::from_intervals(rows, cols))
    }

    fn collapse(set: IntervalSet, row: usize, col: usize, axis: Axis) -> Result<Interval> {
        match set.single() {
            Ok(Some(interval)) => Ok(interval),
            Ok(None) => Err(TilingError::EmptyExclusiveRegion { row, col, axis }),
            Err(_) => Err(TilingError::FragmentedExclusiveRegion { row, col, axis }),
        }
    }

    /// Verify that the union of all inclusive latent tiles is the canvas
    ///
    /// The grid is separable, so full 2D coverage holds exactly when the row
    /// extents cover the canvas height and the column extents cover its width.
    pub fn check_coverage(&self) -> Result<()> {
        let mut rows = IntervalSet::new();
        for row in 0..self.grid_rows {
            rows.insert(self.tile_to_latent(row, 0).rows());
        }
        let mut cols = IntervalSet::new();
        for col in 0..self.grid_cols {
            cols.insert(self.tile_to_latent(0, col).cols());
        }

        let first_gap = |set: &IntervalSet, extent: usize| -> Option<usize> {
            (0..extent).find(|&p| !set.intervals().iter().any(|i| i.contains(p)))
        };
        if let Some(row) = first_gap(&rows, self.latent_height()) {
            return Err(TilingError::UncoveredCanvas { row, col: 0 });
        }
        if let Some(col) = first_gap(&cols, self.latent_width()) {
            return Err(TilingError::UncoveredCanvas { row: 0, col });
        }
        Ok(())
    }
}
