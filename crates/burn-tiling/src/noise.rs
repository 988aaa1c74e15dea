//! Initial canvas noise with per-tile and per-region reseeding
//!
//! The canvas starts from one seeded normal draw. Tiles with a seed
//! directive then overwrite their region with an independent draw, in
//! row-major order, and reroll regions overwrite again in listed order.
//! Later writes win wherever regions overlap.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TilingError};
use crate::geometry::{pixel_to_latent, TileGeometry, TileRegion};
use crate::grid::Grid;

/// Draw a standard normal tensor from an independent stream seeded by `seed`
///
/// Values are generated in row-major order, so the same seed and shape
/// always produce the same tensor regardless of backend.
pub fn seeded_normal<B: Backend>(shape: [usize; 4], seed: u64, device: &B::Device) -> Tensor<B, 4> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Optional seed of every tile, `None` keeping the canvas noise
pub type TileSeeds = Grid<Option<u64>>;

/// Which part of a tile a seed directive rewrites
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedTilesMode {
    /// The whole tile, overlaps included
    #[default]
    Full,
    /// Only the part of the tile no other tile touches
    Exclusive,
}

impl SeedTilesMode {
    pub const ALL: [SeedTilesMode; 2] = [SeedTilesMode::Full, SeedTilesMode::Exclusive];

    pub fn as_str(&self) -> &'static str {
        match self {
            SeedTilesMode::Full => "full",
            SeedTilesMode::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for SeedTilesMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeedTilesMode {
    type Err = TilingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| TilingError::UnknownSeedMode(s.to_string()))
    }
}

/// Pixel-space rectangle whose noise is redrawn from its own seed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerollRegion {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
    pub seed: u64,
}

impl RerollRegion {
    pub fn new(row_start: usize, row_end: usize, col_start: usize, col_end: usize, seed: u64) -> Self {
        Self {
            row_start,
            row_end,
            col_start,
            col_end,
            seed,
        }
    }

    pub fn pixel_region(&self) -> TileRegion {
        TileRegion::new(self.row_start, self.row_end, self.col_start, self.col_end)
    }

    pub fn latent_region(&self) -> TileRegion {
        pixel_to_latent(self.pixel_region())
    }

    fn validate(&self, index: usize, geometry: &TileGeometry) -> Result<()> {
        let fail = |reason: String| -> Result<()> {
            Err(TilingError::InvalidRerollRegion { index, reason })
        };

        if self.row_start >= self.row_end || self.col_start >= self.col_end {
            return fail(format!("empty rectangle {}", self.pixel_region()));
        }
        let canvas = TileRegion::new(0, geometry.height(), 0, geometry.width());
        if !canvas.contains_region(&self.pixel_region()) {
            return fail(format!(
                "{} exceeds the {}x{} canvas",
                self.pixel_region(),
                geometry.width(),
                geometry.height()
            ));
        }
        if self.latent_region().is_empty() {
            return fail(format!(
                "{} is smaller than one latent cell",
                self.pixel_region()
            ));
        }
        Ok(())
    }
}

/// Origin of a noise overwrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseSource {
    Tile {
        row: usize,
        col: usize,
        mode: SeedTilesMode,
    },
    Reroll {
        index: usize,
    },
}

/// A latent region to refill from its own seed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoiseOverwrite {
    pub source: NoiseSource,
    pub region: TileRegion,
    pub seed: u64,
}

/// Validated description of the initial canvas noise
///
/// Building the plan resolves every tile and reroll region up front, so bad
/// input fails before any tensor work or network call.
#[derive(Debug, Clone, PartialEq)]
pub struct NoisePlan {
    pub seed: u64,
    pub overwrites: Vec<NoiseOverwrite>,
}

impl NoisePlan {
    /// Plan with no overwrites
    pub fn uniform(seed: u64) -> Self {
        Self {
            seed,
            overwrites: Vec::new(),
        }
    }

    pub fn new(
        geometry: &TileGeometry,
        seed: u64,
        tile_seeds: Option<&TileSeeds>,
        modes: &Grid<SeedTilesMode>,
        rerolls: &[RerollRegion],
    ) -> Result<Self> {
        let grid_shape = (geometry.grid_rows, geometry.grid_cols);
        modes.expect_shape("seed_tiles_mode", grid_shape)?;

        let mut overwrites = Vec::new();
        if let Some(tile_seeds) = tile_seeds {
            tile_seeds.expect_shape("seed_tiles", grid_shape)?;
            for ((row, col), tile_seed) in tile_seeds.iter() {
                let Some(tile_seed) = *tile_seed else {
                    continue;
                };
                let mode = modes[(row, col)];
                let region = match mode {
                    SeedTilesMode::Full => geometry.tile_to_latent(row, col),
                    SeedTilesMode::Exclusive => geometry.tile_to_latent_exclusive(row, col)?,
                };
                overwrites.push(NoiseOverwrite {
                    source: NoiseSource::Tile { row, col, mode },
                    region,
                    seed: tile_seed,
                });
            }
        }

        for (index, reroll) in rerolls.iter().enumerate() {
            reroll.validate(index, geometry)?;
            overwrites.push(NoiseOverwrite {
                source: NoiseSource::Reroll { index },
                region: reroll.latent_region(),
                seed: reroll.seed,
            });
        }

        Ok(Self { seed, overwrites })
    }
}

/// Build the initial canvas latent for `plan`
///
/// `shape` is `[batch, channels, latent_height, latent_width]`. When the
/// scheduler expects latents at its initial noise level, `init_noise_sigma`
/// scales the canvas once after all overwrites.
pub fn init_canvas_latent<B: Backend>(
    plan: &NoisePlan,
    shape: [usize; 4],
    init_noise_sigma: Option<f32>,
    device: &B::Device,
) -> Tensor<B, 4> {
    let [batch, channels, _, _] = shape;
    let mut latent = seeded_normal::<B>(shape, plan.seed, device);

    for overwrite in &plan.overwrites {
        let region = overwrite.region;
        tracing::debug!(
            source = ?overwrite.source,
            seed = overwrite.seed,
            "reseeding latent {}",
            region
        );
        let noise = seeded_normal::<B>(
            [batch, channels, region.height(), region.width()],
            overwrite.seed,
            device,
        );
        latent = latent.slice_assign(region.slice_ranges(batch, channels), noise);
    }

    match init_noise_sigma {
        Some(sigma) => latent * sigma,
        None => latent,
    }
}
