//! Gaussian blend weights for overlapping tiles
//!
//! Every tile contributes to the canvas through the same separable Gaussian
//! mask, highest at the tile centre and decaying towards the edges. Where
//! tiles overlap, each position ends up as the weighted average of all
//! contributors, so the tile whose centre is closest dominates and seams
//! disappear.

use burn::prelude::*;

use crate::error::{Result, TilingError};
use crate::geometry::TileGeometry;
use crate::grid::Grid;

/// Variance of the Gaussian profile, relative to the squared tile length
pub const BLEND_VARIANCE: f64 = 0.01;

/// Unnormalized Gaussian density over `len` positions, centred on the tile
///
/// `exp(-(x - m)^2 / len^2 / (2 var)) / sqrt(2 pi var)` with `m = (len - 1) / 2`.
/// Values are absolute densities, not rescaled to sum to 1.
pub fn gaussian_profile(len: usize) -> Vec<f32> {
    let midpoint = (len as f64 - 1.0) / 2.0;
    let len_sq = (len * len) as f64;
    let norm = (2.0 * std::f64::consts::PI * BLEND_VARIANCE).sqrt();
    (0..len)
        .map(|x| {
            let d = x as f64 - midpoint;
            ((-(d * d) / len_sq / (2.0 * BLEND_VARIANCE)).exp() / norm) as f32
        })
        .collect()
}

/// Row-major `[height, width]` outer product of the two axis profiles
pub fn gaussian_weights(latent_width: usize, latent_height: usize) -> Vec<f32> {
    let x_probs = gaussian_profile(latent_width);
    let y_probs = gaussian_profile(latent_height);
    y_probs
        .iter()
        .flat_map(|&y| x_probs.iter().map(move |&x| y * x))
        .collect()
}

/// Blend mask for one tile size, cached for a whole run
#[derive(Debug, Clone)]
pub struct BlendMask {
    pub height: usize,
    pub width: usize,
    values: Vec<f32>,
}

impl BlendMask {
    /// Mask for a tile of the given latent size
    pub fn new(latent_tile_width: usize, latent_tile_height: usize) -> Self {
        Self {
            height: latent_tile_height,
            width: latent_tile_width,
            values: gaussian_weights(latent_tile_width, latent_tile_height),
        }
    }

    pub fn for_geometry(geometry: &TileGeometry) -> Self {
        Self::new(geometry.latent_tile_width(), geometry.latent_tile_height())
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.values[row * self.width + col]
    }

    /// Mask as a `[1, 1, height, width]` tensor
    ///
    /// The leading unit dimensions broadcast over batch and channels.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::from_data(
            TensorData::new(self.values.clone(), [1, 1, self.height, self.width]),
            device,
        )
    }
}

/// Precomputed blending for every tile of a geometry
///
/// The weight sum at a canvas position depends only on the geometry, so it
/// is accumulated once here instead of at every step. Each tile then carries
/// its mask divided by the weight sum over its region, and summing
/// `prediction * normalized_mask` over all tiles gives exactly the
/// normalized average `sum(prediction * mask) / sum(mask)`.
pub struct BlendPlan<B: Backend> {
    mask: BlendMask,
    weight_sum: Vec<f32>,
    latent_height: usize,
    latent_width: usize,
    tile_weights: Grid<Tensor<B, 4>>,
}

impl<B: Backend> BlendPlan<B> {
    /// Build the plan, failing if any canvas position has no weight
    pub fn new(geometry: &TileGeometry, device: &B::Device) -> Result<Self> {
        let mask = BlendMask::for_geometry(geometry);
        let latent_height = geometry.latent_height();
        let latent_width = geometry.latent_width();

        let mut weight_sum = vec![0.0f32; latent_height * latent_width];
        for (row, col) in geometry.tiles() {
            let region = geometry.tile_to_latent(row, col);
            for (ty, cy) in region.row_range().enumerate() {
                for (tx, cx) in region.col_range().enumerate() {
                    weight_sum[cy * latent_width + cx] += mask.at(ty, tx);
                }
            }
        }

        if let Some(idx) = weight_sum.iter().position(|w| !(*w > 0.0 && w.is_finite())) {
            return Err(TilingError::UncoveredCanvas {
                row: idx / latent_width,
                col: idx % latent_width,
            });
        }

        let tile_weights = Grid::from_fn(geometry.grid_rows, geometry.grid_cols, |row, col| {
            let region = geometry.tile_to_latent(row, col);
            let mut normalized = Vec::with_capacity(mask.height * mask.width);
            for (ty, cy) in region.row_range().enumerate() {
                for (tx, cx) in region.col_range().enumerate() {
                    normalized.push(mask.at(ty, tx) / weight_sum[cy * latent_width + cx]);
                }
            }
            Tensor::from_data(
                TensorData::new(normalized, [1, 1, region.height(), region.width()]),
                device,
            )
        });

        Ok(Self {
            mask,
            weight_sum,
            latent_height,
            latent_width,
            tile_weights,
        })
    }

    /// Raw Gaussian mask shared by all tiles
    pub fn mask(&self) -> &BlendMask {
        &self.mask
    }

    /// Per-position sum of all tile masks, row-major over the latent canvas
    pub fn weight_sum(&self) -> &[f32] {
        &self.weight_sum
    }

    pub fn latent_size(&self) -> (usize, usize) {
        (self.latent_height, self.latent_width)
    }

    /// Mask of tile `(row, col)` divided by the canvas weight sum
    pub fn tile_weights(&self, row: usize, col: usize) -> Tensor<B, 4> {
        self.tile_weights[(row, col)].clone()
    }
}
