//! burn-tiling: multi-prompt tiled diffusion in pure Rust
//!
//! Large images are generated from a grid of prompts by denoising
//! overlapping tiles of one shared latent canvas. At every step each tile's
//! noise prediction is blended into a canvas-wide estimate with Gaussian
//! weights, so tiles agree along their overlaps and no seams appear.
//!
//! # Layout
//!
//! - [`geometry`] maps grid positions to pixel and latent regions
//! - [`blend`] builds the Gaussian blend weights
//! - [`noise`] seeds the initial canvas, per tile and per reroll region
//! - [`sampler`] runs the tiled denoising loop
//! - [`pipeline`] validates a [`TilingConfig`] and drives the models
//!
//! The networks themselves are supplied through the traits in [`models`].
//!
//! # Example
//!
//! ```ignore
//! use burn_tiling::{TilingConfig, TilingOutput, TilingPipeline};
//!
//! let mut config = TilingConfig::with_prompts(vec![
//!     vec!["a castle on a hill".into(), "a dragon in the sky".into()],
//! ]);
//! config.seed = Some(42);
//!
//! let mut pipeline = TilingPipeline::new(tokenizer, text_encoder, unet, vae, scheduler, &device);
//! let TilingOutput::Image(image) = pipeline.generate(&config)? else { unreachable!() };
//! ```

pub mod backends;
pub mod blend;
pub mod debug;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod interval;
pub mod models;
pub mod noise;
pub mod pipeline;
pub mod sampler;

pub use blend::{BlendMask, BlendPlan};
pub use debug::{check_finite, tensor_stats, DebugConfig};
pub use error::{Result, TilingError};
pub use geometry::{pixel_to_latent, tile_to_pixel, Axis, TileGeometry, TileRegion, LATENT_SCALE};
pub use grid::Grid;
pub use interval::{Interval, IntervalSet};
pub use models::{Autoencoder, Denoiser, Scheduler, TextEncoder, Tokenizer};
pub use noise::{init_canvas_latent, seeded_normal, NoisePlan, RerollRegion, SeedTilesMode, TileSeeds};
pub use pipeline::{
    tensor_to_rgb, OutputType, SeedModeSpec, TilePlan, TilingConfig, TilingOutput, TilingPipeline,
};
pub use sampler::{
    apply_guidance, GuidancePlan, StepInfo, StepOutput, TileConditioning, TiledSampler,
};
