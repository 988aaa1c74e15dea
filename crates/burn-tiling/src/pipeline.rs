//! Pipeline facade: configuration, validation, conditioning and decoding
//!
//! [`TilingPipeline::generate`] turns a [`TilingConfig`] into an image. All
//! input validation happens in [`TilePlan::new`] and [`BlendPlan::new`],
//! before the text encoder or the denoiser is called even once.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::Int;
use serde::{Deserialize, Serialize};

use crate::blend::BlendPlan;
use crate::debug::{tensor_stats, tensor_values, DebugConfig};
use crate::error::{Result, TilingError};
use crate::geometry::TileGeometry;
use crate::grid::Grid;
use crate::models::{Autoencoder, Denoiser, Scheduler, TextEncoder, Tokenizer};
use crate::noise::{init_canvas_latent, NoisePlan, RerollRegion, SeedTilesMode};
use crate::sampler::{GuidancePlan, StepInfo, StepOutput, TileConditioning, TiledSampler};

/// Seed mode for all tiles or one per tile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedModeSpec {
    Uniform(SeedTilesMode),
    PerTile(Vec<Vec<SeedTilesMode>>),
}

impl Default for SeedModeSpec {
    fn default() -> Self {
        SeedModeSpec::Uniform(SeedTilesMode::Full)
    }
}

impl SeedModeSpec {
    fn to_grid(&self, shape: (usize, usize)) -> Result<Grid<SeedTilesMode>> {
        match self {
            SeedModeSpec::Uniform(mode) => Ok(Grid::from_fn(shape.0, shape.1, |_, _| *mode)),
            SeedModeSpec::PerTile(rows) => {
                let grid = Grid::from_rows("seed_tiles_mode", rows.clone())?;
                grid.expect_shape("seed_tiles_mode", shape)?;
                Ok(grid)
            }
        }
    }
}

/// Representation returned by [`TilingPipeline::generate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// Final canvas latent, not decoded
    Latent,
    /// Decoded image tensor [batch, 3, height, width] in [0, 255]
    #[default]
    Image,
    /// Decoded image as interleaved RGB bytes
    Rgb,
}

/// Result of a tiled run
#[derive(Debug, Clone)]
pub enum TilingOutput<B: Backend> {
    Latent(Tensor<B, 4>),
    Image(Tensor<B, 4>),
    Rgb {
        width: usize,
        height: usize,
        /// One buffer of `width * height * 3` bytes per batch item
        images: Vec<Vec<u8>>,
    },
}

/// Configuration for a tiled generation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Prompt of every tile, as rows of the grid
    pub prompts: Vec<Vec<String>>,
    /// Negative prompts with the prompt grid's shape (default: empty strings)
    pub negative_prompts: Option<Vec<Vec<String>>>,
    pub steps: usize,
    pub guidance_scale: f64,
    /// Per-tile guidance scale overrides
    pub guidance_scale_tiles: Option<Vec<Vec<Option<f64>>>>,
    /// Noise factor forwarded to the scheduler at every step
    pub eta: f64,
    pub tile_width: usize,
    pub tile_height: usize,
    pub tile_row_overlap: usize,
    pub tile_col_overlap: usize,
    /// Canvas seed; a random one is drawn and logged when absent
    pub seed: Option<u64>,
    /// Per-tile seeds applied over the canvas noise
    pub seed_tiles: Option<Vec<Vec<Option<u64>>>>,
    pub seed_tiles_mode: SeedModeSpec,
    pub seed_reroll_regions: Vec<RerollRegion>,
    pub batch_size: usize,
    pub output: OutputType,
    pub debug: DebugConfig,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            prompts: Vec::new(),
            negative_prompts: None,
            steps: 50,
            guidance_scale: 7.5,
            guidance_scale_tiles: None,
            eta: 0.0,
            tile_width: 512,
            tile_height: 512,
            tile_row_overlap: 256,
            tile_col_overlap: 256,
            seed: None,
            seed_tiles: None,
            seed_tiles_mode: SeedModeSpec::default(),
            seed_reroll_regions: Vec::new(),
            batch_size: 1,
            output: OutputType::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl TilingConfig {
    /// Config with the given prompt grid and defaults for everything else
    pub fn with_prompts(prompts: Vec<Vec<String>>) -> Self {
        Self {
            prompts,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| TilingError::Config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| TilingError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Grid dimensions (rows, cols) of the prompt grid, without validation
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.prompts.len(), self.prompts.first().map_or(0, Vec::len))
    }
}

/// A validated run: geometry, per-tile inputs and the noise plan
///
/// Building a plan touches no model, so every input error surfaces here.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePlan {
    pub geometry: TileGeometry,
    pub prompts: Grid<String>,
    pub negative_prompts: Grid<String>,
    pub guidance: GuidancePlan,
    pub noise: NoisePlan,
    pub steps: usize,
    pub batch_size: usize,
}

impl TilePlan {
    pub fn new(config: &TilingConfig) -> Result<Self> {
        let prompts = Grid::from_rows("prompt", config.prompts.clone())?;
        let shape = prompts.shape();

        if config.steps == 0 {
            return Err(TilingError::InvalidStepCount);
        }
        if config.batch_size == 0 {
            return Err(TilingError::InvalidBatchSize);
        }

        let geometry = TileGeometry::new(
            shape.0,
            shape.1,
            config.tile_width,
            config.tile_height,
            config.tile_row_overlap,
            config.tile_col_overlap,
        )?;
        warn_on_narrow_overlap(&geometry);

        let negative_prompts = match &config.negative_prompts {
            Some(rows) => {
                let grid = Grid::from_rows("negative_prompt", rows.clone())?;
                grid.expect_shape("negative_prompt", shape)?;
                grid
            }
            None => Grid::from_fn(shape.0, shape.1, |_, _| String::new()),
        };

        let guidance_overrides = config
            .guidance_scale_tiles
            .clone()
            .map(|rows| Grid::from_rows("guidance_scale_tiles", rows))
            .transpose()?;
        let guidance = GuidancePlan::new(shape, config.guidance_scale, guidance_overrides.as_ref())?;

        let tile_seeds = config
            .seed_tiles
            .clone()
            .map(|rows| Grid::from_rows("seed_tiles", rows))
            .transpose()?;
        let modes = config.seed_tiles_mode.to_grid(shape)?;
        let seed = config.seed.unwrap_or_else(|| {
            let seed = rand::random::<u64>();
            tracing::info!(seed, "no seed given, drew a random one");
            seed
        });
        let noise = NoisePlan::new(
            &geometry,
            seed,
            tile_seeds.as_ref(),
            &modes,
            &config.seed_reroll_regions,
        )?;

        Ok(Self {
            geometry,
            prompts,
            negative_prompts,
            guidance,
            noise,
            steps: config.steps,
            batch_size: config.batch_size,
        })
    }
}

fn warn_on_narrow_overlap(geometry: &TileGeometry) {
    if geometry.grid_rows > 1 && geometry.row_overlap < geometry.tile_height / 8 {
        tracing::warn!(
            overlap = geometry.row_overlap,
            tile_height = geometry.tile_height,
            "row overlap is under 1/8 of the tile height, seams may show"
        );
    }
    if geometry.grid_cols > 1 && geometry.col_overlap < geometry.tile_width / 8 {
        tracing::warn!(
            overlap = geometry.col_overlap,
            tile_width = geometry.tile_width,
            "column overlap is under 1/8 of the tile width, seams may show"
        );
    }
}

/// Multi-prompt tiled diffusion over one latent canvas
pub struct TilingPipeline<B: Backend, T, E, D, V, S> {
    pub tokenizer: T,
    pub text_encoder: E,
    pub denoiser: D,
    pub autoencoder: V,
    pub scheduler: S,
    device: B::Device,
}

impl<B, T, E, D, V, S> TilingPipeline<B, T, E, D, V, S>
where
    B: Backend,
    T: Tokenizer,
    E: TextEncoder<B>,
    D: Denoiser<B>,
    V: Autoencoder<B>,
    S: Scheduler<B>,
{
    pub fn new(
        tokenizer: T,
        text_encoder: E,
        denoiser: D,
        autoencoder: V,
        scheduler: S,
        device: &B::Device,
    ) -> Self {
        Self {
            tokenizer,
            text_encoder,
            denoiser,
            autoencoder,
            scheduler,
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Encode a single text prompt to embeddings [1, seq_len, embed_dim]
    fn encode_text(&self, text: &str) -> Tensor<B, 3> {
        let max_length = self.tokenizer.model_max_length();
        let tokens = self.tokenizer.encode_padded(text, max_length);
        let len = tokens.len();
        let token_tensor: Tensor<B, 1, Int> = Tensor::from_data(
            TensorData::new(tokens.iter().map(|&t| t as i32).collect::<Vec<_>>(), [len]),
            &self.device,
        );
        let token_tensor = token_tensor.unsqueeze::<2>(); // [1, seq_len]

        self.text_encoder.encode(token_tensor)
    }

    /// Conditioning of every tile, repeated to the batch size
    ///
    /// Each distinct prompt string is encoded once. Negative prompts are only
    /// encoded when the run uses classifier-free guidance, and then for every
    /// tile.
    pub fn encode_prompts(&self, plan: &TilePlan) -> Grid<TileConditioning<B>> {
        let mut cache: HashMap<String, Tensor<B, 3>> = HashMap::new();
        let mut embed = |text: &str| -> Tensor<B, 3> {
            let embedding = match cache.get(text) {
                Some(embedding) => embedding.clone(),
                None => {
                    let embedding = self.encode_text(text);
                    cache.insert(text.to_string(), embedding.clone());
                    embedding
                }
            };
            embedding.repeat_dim(0, plan.batch_size)
        };

        let (rows, cols) = plan.prompts.shape();
        let cfg = plan.guidance.cfg_enabled();
        let conditioning = Grid::from_fn(rows, cols, |row, col| {
            let cond = embed(&plan.prompts[(row, col)]);
            if cfg {
                TileConditioning::new(cond, embed(&plan.negative_prompts[(row, col)]))
            } else {
                TileConditioning::unguided(cond)
            }
        });
        tracing::debug!(tiles = rows * cols, distinct = cache.len(), "encoded prompts");

        conditioning
    }

    /// Generate an image for `config`
    pub fn generate(&mut self, config: &TilingConfig) -> Result<TilingOutput<B>> {
        self.generate_with_callback(config, StepOutput::None, |_| ControlFlow::Continue(()))
    }

    /// Generate with a callback after every denoising step
    ///
    /// Returning [`ControlFlow::Break`] from the callback cancels the run
    /// with [`TilingError::Cancelled`].
    pub fn generate_with_callback<F>(
        &mut self,
        config: &TilingConfig,
        step_output: StepOutput,
        callback: F,
    ) -> Result<TilingOutput<B>>
    where
        F: FnMut(StepInfo<B>) -> ControlFlow<()>,
    {
        let plan = TilePlan::new(config)?;
        let geometry = plan.geometry;
        let blend = BlendPlan::new(&geometry, &self.device)?;
        geometry.check_coverage()?;

        self.scheduler.set_timesteps(plan.steps);
        if self.scheduler.timesteps().is_empty() {
            return Err(TilingError::InvalidStepCount);
        }

        tracing::info!(
            width = geometry.width(),
            height = geometry.height(),
            grid_rows = geometry.grid_rows,
            grid_cols = geometry.grid_cols,
            seed = plan.noise.seed,
            steps = plan.steps,
            cfg = plan.guidance.cfg_enabled(),
            "starting tiled generation"
        );

        let conditioning = self.encode_prompts(&plan);
        let sampler = TiledSampler::new(geometry, blend, conditioning, plan.guidance.clone(), config.debug)?;

        let shape = [
            plan.batch_size,
            self.denoiser.in_channels(),
            geometry.latent_height(),
            geometry.latent_width(),
        ];
        let latent = init_canvas_latent::<B>(
            &plan.noise,
            shape,
            self.scheduler.init_noise_sigma(),
            &self.device,
        );

        let latent = sampler.sample(
            &self.denoiser,
            &mut self.scheduler,
            latent,
            config.eta,
            step_output,
            callback,
        )?;

        if config.debug.sampler {
            tracing::debug!("final latent: {}", tensor_stats(&latent));
        }

        match config.output {
            OutputType::Latent => Ok(TilingOutput::Latent(latent)),
            OutputType::Image => Ok(TilingOutput::Image(self.autoencoder.decode(latent))),
            OutputType::Rgb => {
                let image = self.autoencoder.decode(latent);
                let [_, _, height, width] = image.dims();
                Ok(TilingOutput::Rgb {
                    width,
                    height,
                    images: tensor_to_rgb(image)?,
                })
            }
        }
    }
}

/// Convert a [batch, 3, H, W] image in [0, 255] to interleaved RGB bytes
pub fn tensor_to_rgb<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<Vec<u8>>> {
    let [batch, _, h, w] = tensor.dims();

    // Clamp to [0, 255] and convert
    let tensor = tensor.clamp(0.0, 255.0);
    let floats = tensor_values(&tensor)?;

    let plane = h * w;
    let mut images = Vec::with_capacity(batch);
    for b in 0..batch {
        let offset = b * 3 * plane;
        let mut rgb = Vec::with_capacity(plane * 3);
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    let idx = offset + c * plane + y * w + x;
                    rgb.push(floats[idx] as u8);
                }
            }
        }
        images.push(rgb);
    }

    Ok(images)
}
