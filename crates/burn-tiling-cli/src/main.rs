//! burn-tiling CLI
//!
//! Inspect tile layouts and initial noise for multi-prompt tiled diffusion.

use anyhow::{Context, Result};
use burn_tiling::backends::{default_device, enabled_backends, DefaultBackend};
use burn_tiling::{init_canvas_latent, BlendPlan, SeedModeSpec, SeedTilesMode, TilePlan, TilingConfig};
use clap::{Args, Parser, Subcommand};
use image::{imageops, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "burn-tiling")]
#[command(about = "Tiled multi-prompt diffusion layouts in pure Rust")]
#[command(version)]
struct Cli {
    /// Log debug output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canvas size and every tile's regions
    Layout {
        #[command(flatten)]
        grid: GridArgs,

        /// Write the blend weight sum as a grayscale PNG
        #[arg(long, value_name = "FILE")]
        weights: Option<PathBuf>,
    },

    /// Render the initial canvas noise as an RGB preview
    Noise {
        #[command(flatten)]
        grid: GridArgs,

        /// Output image path
        #[arg(short, long, default_value = "noise.png")]
        output: PathBuf,

        /// Scale the preview from latent to pixel resolution
        #[arg(long)]
        upscale: bool,
    },

    /// Show build information
    Info,
}

/// Grid settings, from a JSON config and/or flags (flags win)
#[derive(Args)]
struct GridArgs {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Grid rows when no config is given
    #[arg(long, default_value = "1")]
    rows: usize,

    /// Grid columns when no config is given
    #[arg(long, default_value = "2")]
    cols: usize,

    #[arg(long)]
    tile_width: Option<usize>,

    #[arg(long)]
    tile_height: Option<usize>,

    #[arg(long)]
    row_overlap: Option<usize>,

    #[arg(long)]
    col_overlap: Option<usize>,

    /// Canvas seed
    #[arg(long)]
    seed: Option<u64>,

    /// Seed mode for every tile (full or exclusive)
    #[arg(long)]
    seed_tiles_mode: Option<String>,
}

impl GridArgs {
    fn load(&self) -> Result<TilingConfig> {
        let mut config = match &self.config {
            Some(path) => TilingConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => TilingConfig::with_prompts(vec![vec![String::new(); self.cols]; self.rows]),
        };

        if let Some(v) = self.tile_width {
            config.tile_width = v;
        }
        if let Some(v) = self.tile_height {
            config.tile_height = v;
        }
        if let Some(v) = self.row_overlap {
            config.tile_row_overlap = v;
        }
        if let Some(v) = self.col_overlap {
            config.tile_col_overlap = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(mode) = &self.seed_tiles_mode {
            let mode: SeedTilesMode = mode.parse()?;
            config.seed_tiles_mode = SeedModeSpec::Uniform(mode);
        }
        tracing::debug!(grid = ?config.grid_shape(), "loaded tiling config");
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = fmt()
        .with_target(false)
        .with_env_filter(filter)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Layout { grid, weights } => {
            let config = grid.load()?;
            let plan = TilePlan::new(&config).context("Invalid tile configuration")?;
            let geometry = plan.geometry;

            println!(
                "Canvas: {}x{} px, latent {}x{}",
                geometry.width(),
                geometry.height(),
                geometry.latent_width(),
                geometry.latent_height()
            );
            println!(
                "Grid:   {}x{} tiles of {}x{} px, overlap rows {} / cols {}",
                geometry.grid_rows,
                geometry.grid_cols,
                geometry.tile_width,
                geometry.tile_height,
                geometry.row_overlap,
                geometry.col_overlap
            );
            println!("Seed:   {}\n", plan.noise.seed);

            for (row, col) in geometry.tiles() {
                let exclusive = match geometry.tile_to_latent_exclusive(row, col) {
                    Ok(region) => region.to_string(),
                    Err(err) => format!("none ({err})"),
                };
                println!("Tile ({row}, {col}): {:?}", plan.prompts[(row, col)]);
                println!("  pixel:     {}", geometry.tile_to_pixel(row, col));
                println!("  latent:    {}", geometry.tile_to_latent(row, col));
                println!("  exclusive: {exclusive}");
                println!("  guidance:  {}", plan.guidance.scale(row, col));
            }

            if !plan.noise.overwrites.is_empty() {
                println!("\nNoise overwrites (in order):");
                for overwrite in &plan.noise.overwrites {
                    println!(
                        "  {:?} seed {} at {}",
                        overwrite.source, overwrite.seed, overwrite.region
                    );
                }
            }

            if let Some(path) = weights {
                let device = default_device();
                let blend = BlendPlan::<DefaultBackend>::new(&geometry, &device)
                    .context("Tiles do not cover the canvas")?;
                let (h, w) = blend.latent_size();
                let max = blend.weight_sum().iter().cloned().fold(f32::MIN, f32::max);
                let img: GrayImage = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
                    let v = blend.weight_sum()[y as usize * w + x as usize] / max;
                    Luma([(v * 255.0).clamp(0.0, 255.0) as u8])
                });
                img.save(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("\nWeight sum saved to: {}", path.display());
            }

            Ok(())
        }

        Commands::Noise {
            grid,
            output,
            upscale,
        } => {
            let config = grid.load()?;
            let plan = TilePlan::new(&config).context("Invalid tile configuration")?;
            let geometry = plan.geometry;
            let (h, w) = (geometry.latent_height(), geometry.latent_width());

            let pb = ProgressBar::new_spinner();
            pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
            pb.set_message(format!(
                "Drawing {}x{} latent noise with {} overwrites...",
                w,
                h,
                plan.noise.overwrites.len()
            ));

            let device = default_device();
            let latent = init_canvas_latent::<DefaultBackend>(&plan.noise, [1, 4, h, w], None, &device);
            let preview = latent.slice([0..1, 0..3, 0..h, 0..w]);
            let floats: Vec<f32> = preview
                .into_data()
                .convert::<f32>()
                .to_vec()
                .map_err(|e| anyhow::anyhow!("Failed to read latent data: {e:?}"))?;

            pb.finish_with_message("Done!");

            // Map [-3, 3] standard deviations onto [0, 255]
            let plane = h * w;
            let mut img: RgbImage = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
                let idx = y as usize * w + x as usize;
                let px = |c: usize| ((floats[c * plane + idx] + 3.0) / 6.0 * 255.0).clamp(0.0, 255.0) as u8;
                Rgb([px(0), px(1), px(2)])
            });
            if upscale {
                img = imageops::resize(
                    &img,
                    geometry.width() as u32,
                    geometry.height() as u32,
                    imageops::FilterType::Nearest,
                );
            }
            img.save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Noise preview (seed {}) saved to: {}", plan.noise.seed, output.display());

            Ok(())
        }

        Commands::Info => {
            println!("burn-tiling: tiled multi-prompt diffusion in pure Rust\n");
            println!("Available backends:");
            let enabled = enabled_backends();
            for (name, desc) in [
                ("ndarray", "CPU"),
                ("tch", "libtorch CPU/CUDA/MPS"),
                ("wgpu", "WebGPU"),
                ("cuda", "NVIDIA CUDA"),
            ] {
                let state = if enabled.contains(&name) {
                    "enabled"
                } else {
                    "not enabled"
                };
                println!("  - {name} ({desc}, {state})");
            }

            println!("\nSeed tile modes:");
            for mode in SeedTilesMode::ALL {
                println!("  - {mode}");
            }

            println!("\nCommands:");
            println!("  - layout: tile regions and blend weight coverage");
            println!("  - noise:  initial canvas noise preview");

            Ok(())
        }
    }
}
