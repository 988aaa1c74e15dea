//! Tiled denoising loop
//!
//! Each step runs the denoiser once per tile on that tile's slice of the
//! canvas latent, applies the tile's own classifier-free guidance, and blends
//! the predictions into one canvas-wide noise estimate through the
//! precomputed [`BlendPlan`]. The scheduler then advances the whole canvas
//! once. A step is the unit of atomicity: cancellation is only observed
//! between steps.

use std::ops::ControlFlow;

use burn::prelude::*;

use crate::blend::BlendPlan;
use crate::debug::{check_finite_if, tensor_stats, DebugConfig};
use crate::error::{Result, TilingError};
use crate::geometry::TileGeometry;
use crate::grid::Grid;
use crate::models::{Denoiser, Scheduler};

/// Text conditioning of one tile
#[derive(Debug, Clone)]
pub struct TileConditioning<B: Backend> {
    /// Prompt embedding [batch, seq_len, embed_dim]
    pub cond: Tensor<B, 3>,
    /// Negative prompt embedding, required when the run uses guidance
    pub uncond: Option<Tensor<B, 3>>,
}

impl<B: Backend> TileConditioning<B> {
    pub fn new(cond: Tensor<B, 3>, uncond: Tensor<B, 3>) -> Self {
        Self {
            cond,
            uncond: Some(uncond),
        }
    }

    /// Conditioning for a run without guidance
    pub fn unguided(cond: Tensor<B, 3>) -> Self {
        Self { cond, uncond: None }
    }
}

/// Effective guidance scale of every tile
#[derive(Debug, Clone, PartialEq)]
pub struct GuidancePlan {
    scales: Grid<f64>,
}

impl GuidancePlan {
    /// Same scale for every tile
    pub fn uniform(shape: (usize, usize), scale: f64) -> Self {
        Self {
            scales: Grid::from_fn(shape.0, shape.1, |_, _| scale),
        }
    }

    /// Global scale with optional per-tile overrides
    pub fn new(
        shape: (usize, usize),
        guidance_scale: f64,
        overrides: Option<&Grid<Option<f64>>>,
    ) -> Result<Self> {
        let Some(overrides) = overrides else {
            return Ok(Self::uniform(shape, guidance_scale));
        };
        overrides.expect_shape("guidance_scale_tiles", shape)?;
        Ok(Self {
            scales: overrides.map(|scale| scale.unwrap_or(guidance_scale)),
        })
    }

    pub fn scale(&self, row: usize, col: usize) -> f64 {
        self.scales[(row, col)]
    }

    /// Whether the run uses classifier-free guidance
    ///
    /// True when the global scale or any override exceeds 1.0. Every tile
    /// is then guided with its own scale, whatever its value.
    pub fn cfg_enabled(&self) -> bool {
        self.scales.iter().any(|(_, &scale)| scale > 1.0)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.scales.shape()
    }
}

/// Combine unconditional and conditional predictions
pub fn apply_guidance<B: Backend>(
    noise_pred_uncond: Tensor<B, 4>,
    noise_pred_cond: Tensor<B, 4>,
    guidance_scale: f64,
) -> Tensor<B, 4> {
    noise_pred_uncond.clone() + (noise_pred_cond - noise_pred_uncond) * guidance_scale
}

/// What to hand to the step callback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepOutput {
    /// No output, minimal overhead
    #[default]
    None,
    /// Canvas latent after the step
    Latent,
}

/// Information passed to the step callback
pub struct StepInfo<B: Backend> {
    /// Current step (0-indexed)
    pub step: usize,
    /// Total number of steps
    pub total_steps: usize,
    /// Current timestep value
    pub timestep: usize,
    /// Canvas latent, present with [`StepOutput::Latent`]
    pub latent: Option<Tensor<B, 4>>,
}

/// Orchestrates per-tile denoising over a shared canvas latent
pub struct TiledSampler<B: Backend> {
    geometry: TileGeometry,
    blend: BlendPlan<B>,
    conditioning: Grid<TileConditioning<B>>,
    guidance: GuidancePlan,
    cfg: bool,
    debug: DebugConfig,
}

impl<B: Backend> TiledSampler<B> {
    /// Create a sampler, checking that every tile can be guided when CFG is on
    pub fn new(
        geometry: TileGeometry,
        blend: BlendPlan<B>,
        conditioning: Grid<TileConditioning<B>>,
        guidance: GuidancePlan,
        debug: DebugConfig,
    ) -> Result<Self> {
        let shape = (geometry.grid_rows, geometry.grid_cols);
        conditioning.expect_shape("conditioning", shape)?;
        guidance.scales.expect_shape("guidance", shape)?;
        let cfg = guidance.cfg_enabled();
        if cfg {
            if let Some(((row, col), _)) = conditioning.iter().find(|(_, tile)| tile.uncond.is_none()) {
                return Err(TilingError::MissingUnconditional { row, col });
            }
        }

        Ok(Self {
            geometry,
            blend,
            conditioning,
            guidance,
            cfg,
            debug,
        })
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    pub fn guidance(&self) -> &GuidancePlan {
        &self.guidance
    }

    /// Guided noise prediction of one tile
    fn predict_tile<D: Denoiser<B>>(
        &self,
        denoiser: &D,
        row: usize,
        col: usize,
        latent_input: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
    ) -> Result<Tensor<B, 4>> {
        let tile = &self.conditioning[(row, col)];
        let scale = self.guidance.scale(row, col);

        if !self.cfg {
            return Ok(denoiser.predict_noise(latent_input, timestep, tile.cond.clone()));
        }
        let uncond = tile
            .uncond
            .clone()
            .ok_or(TilingError::MissingUnconditional { row, col })?;

        let latent_input = Tensor::cat(vec![latent_input.clone(), latent_input], 0);
        let context = Tensor::cat(vec![uncond, tile.cond.clone()], 0);
        let noise_pred = denoiser.predict_noise(latent_input, timestep, context);

        let mut halves = noise_pred.chunk(2, 0).into_iter();
        match (halves.next(), halves.next()) {
            (Some(noise_uncond), Some(noise_cond)) => Ok(apply_guidance(noise_uncond, noise_cond, scale)),
            _ => Err(TilingError::TensorData(format!(
                "guided prediction of tile ({row}, {col}) cannot be split into two halves"
            ))),
        }
    }

    /// Blended noise prediction for the whole canvas at one step
    ///
    /// The accumulator is fresh for every call. Each tile adds its guided
    /// prediction times its normalized blend weights at its inclusive region.
    pub fn predict_noise<D, S>(
        &self,
        denoiser: &D,
        scheduler: &S,
        latent: &Tensor<B, 4>,
        step_index: usize,
        timestep: Tensor<B, 1>,
    ) -> Result<Tensor<B, 4>>
    where
        D: Denoiser<B>,
        S: Scheduler<B>,
    {
        let [batch, channels, _, _] = latent.dims();
        let mut noise_pred = latent.zeros_like();

        for (row, col) in self.geometry.tiles() {
            let ranges = self.geometry.tile_to_latent(row, col).slice_ranges(batch, channels);
            let tile_latent = latent.clone().slice(ranges.clone());
            let tile_input = scheduler.scale_model_input(tile_latent, step_index);

            let tile_pred = self.predict_tile(denoiser, row, col, tile_input, timestep.clone())?;
            let weighted = tile_pred * self.blend.tile_weights(row, col);

            let current = noise_pred.clone().slice(ranges.clone());
            noise_pred = noise_pred.slice_assign(ranges, current + weighted);
        }

        check_finite_if(
            &noise_pred,
            &format!("step_{}_noise_pred", step_index),
            self.debug.nan,
        )?;
        Ok(noise_pred)
    }

    /// Run one full denoising step and return the advanced canvas latent
    pub fn step<D, S>(
        &self,
        denoiser: &D,
        scheduler: &mut S,
        latent: Tensor<B, 4>,
        step_index: usize,
        timestep: Tensor<B, 1>,
        eta: f64,
    ) -> Result<Tensor<B, 4>>
    where
        D: Denoiser<B>,
        S: Scheduler<B>,
    {
        let noise_pred = self.predict_noise(denoiser, scheduler, &latent, step_index, timestep)?;

        if self.debug.sampler {
            tracing::debug!(step = step_index, "noise_pred: {}", tensor_stats(&noise_pred));
        }

        let latent = scheduler.step(noise_pred, step_index, latent, eta);
        check_finite_if(&latent, &format!("step_{}_latent", step_index), self.debug.nan)?;
        Ok(latent)
    }

    /// Run every timestep of the scheduler's prepared schedule
    ///
    /// The callback runs after each completed step. Returning
    /// [`ControlFlow::Break`] stops the loop before the next step with
    /// [`TilingError::Cancelled`].
    pub fn sample<D, S, F>(
        &self,
        denoiser: &D,
        scheduler: &mut S,
        mut latent: Tensor<B, 4>,
        eta: f64,
        step_output: StepOutput,
        mut callback: F,
    ) -> Result<Tensor<B, 4>>
    where
        D: Denoiser<B>,
        S: Scheduler<B>,
        F: FnMut(StepInfo<B>) -> ControlFlow<()>,
    {
        let timesteps = scheduler.timesteps().to_vec();
        let total_steps = timesteps.len();
        if total_steps == 0 {
            return Err(TilingError::InvalidStepCount);
        }

        let device = latent.device();
        let timestep_tensors: Vec<Tensor<B, 1>> = timesteps
            .iter()
            .map(|&t| Tensor::<B, 1>::from_data(TensorData::new(vec![t as f32], [1]), &device))
            .collect();

        if self.debug.sampler {
            tracing::debug!("initial latent: {}", tensor_stats(&latent));
        }

        for (step_idx, t) in timestep_tensors.into_iter().enumerate() {
            tracing::debug!(
                step = step_idx,
                timestep = timesteps[step_idx],
                tiles = self.geometry.num_tiles(),
                "denoising step"
            );
            latent = self.step(denoiser, scheduler, latent, step_idx, t, eta)?;

            if self.debug.sampler {
                tracing::debug!(step = step_idx, "latent: {}", tensor_stats(&latent));
            }

            let output = match step_output {
                StepOutput::None => None,
                StepOutput::Latent => Some(latent.clone()),
            };
            let flow = callback(StepInfo {
                step: step_idx,
                total_steps,
                timestep: timesteps[step_idx],
                latent: output,
            });
            if flow.is_break() {
                tracing::info!(step = step_idx + 1, "sampling cancelled");
                return Err(TilingError::Cancelled { step: step_idx + 1 });
            }
        }

        Ok(latent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    use crate::noise::seeded_normal;

    type TestBackend = NdArray<f32>;

    /// Prediction is the latent times the mean of the context
    struct ScaleByContext;

    impl Denoiser<TestBackend> for ScaleByContext {
        fn in_channels(&self) -> usize {
            4
        }

        fn predict_noise(
            &self,
            latent: Tensor<TestBackend, 4>,
            _timestep: Tensor<TestBackend, 1>,
            context: Tensor<TestBackend, 3>,
        ) -> Tensor<TestBackend, 4> {
            let [n, _, _] = context.dims();
            let factor = context.mean_dim(2).mean_dim(1).reshape([n, 1, 1, 1]);
            latent * factor
        }
    }

    /// Prediction is the mean of the context, independent of the latent
    struct ContextValue;

    impl Denoiser<TestBackend> for ContextValue {
        fn in_channels(&self) -> usize {
            4
        }

        fn predict_noise(
            &self,
            latent: Tensor<TestBackend, 4>,
            _timestep: Tensor<TestBackend, 1>,
            context: Tensor<TestBackend, 3>,
        ) -> Tensor<TestBackend, 4> {
            let [n, _, _] = context.dims();
            latent.zeros_like() + context.mean_dim(2).mean_dim(1).reshape([n, 1, 1, 1])
        }
    }

    /// `latent - prediction` with a fixed schedule
    struct Subtract {
        timesteps: Vec<usize>,
    }

    impl Scheduler<TestBackend> for Subtract {
        fn set_timesteps(&mut self, num_inference_steps: usize) {
            self.timesteps = (0..num_inference_steps).rev().collect();
        }

        fn timesteps(&self) -> &[usize] {
            &self.timesteps
        }

        fn step(
            &mut self,
            model_output: Tensor<TestBackend, 4>,
            _step_index: usize,
            latent: Tensor<TestBackend, 4>,
            _eta: f64,
        ) -> Tensor<TestBackend, 4> {
            latent - model_output
        }
    }

    fn embedding(value: f32) -> Tensor<TestBackend, 3> {
        Tensor::full([1, 2, 3], value, &Default::default())
    }

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().convert::<f32>().to_vec().unwrap()
    }

    fn sampler(
        geometry: TileGeometry,
        conditioning: Grid<TileConditioning<TestBackend>>,
        guidance: GuidancePlan,
    ) -> TiledSampler<TestBackend> {
        let blend = BlendPlan::new(&geometry, &Default::default()).unwrap();
        TiledSampler::new(geometry, blend, conditioning, guidance, DebugConfig::default()).unwrap()
    }

    #[test]
    fn test_guidance_plan_overrides() {
        let overrides = Grid::from_rows("guidance_scale_tiles", vec![vec![None, Some(1.0)]]).unwrap();
        let plan = GuidancePlan::new((1, 2), 7.5, Some(&overrides)).unwrap();
        assert_eq!(plan.scale(0, 0), 7.5);
        assert_eq!(plan.scale(0, 1), 1.0);
        assert!(plan.cfg_enabled());

        assert!(!GuidancePlan::uniform((2, 2), 1.0).cfg_enabled());
        let weak = Grid::from_rows("guidance_scale_tiles", vec![vec![Some(0.5), None]]).unwrap();
        assert!(!GuidancePlan::new((1, 2), 1.0, Some(&weak)).unwrap().cfg_enabled());

        let err = GuidancePlan::new((2, 2), 7.5, Some(&overrides)).unwrap_err();
        assert!(matches!(err, TilingError::GridShapeMismatch { .. }));
    }

    #[test]
    fn test_apply_guidance() {
        let device = Default::default();
        let uncond = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 1.0, &device);
        let cond = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 3.0, &device);
        assert!(values(apply_guidance(uncond, cond, 2.0)).iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_guided_tile_requires_uncond() {
        let geometry = TileGeometry::new(1, 1, 64, 64, 0, 0).unwrap();
        let blend = BlendPlan::new(&geometry, &Default::default()).unwrap();
        let conditioning = Grid::from_fn(1, 1, |_, _| TileConditioning::unguided(embedding(1.0)));
        let result = TiledSampler::new(
            geometry,
            blend,
            conditioning,
            GuidancePlan::uniform((1, 1), 7.5),
            DebugConfig::default(),
        );
        assert!(matches!(
            result,
            Err(TilingError::MissingUnconditional { row: 0, col: 0 })
        ));
    }

    #[test]
    fn test_every_tile_requires_uncond_when_cfg_enabled() {
        let geometry = TileGeometry::new(1, 2, 64, 64, 0, 32).unwrap();
        let blend = BlendPlan::new(&geometry, &Default::default()).unwrap();
        // Only the tile with the raised scale carries an unconditional embedding
        let conditioning = Grid::from_fn(1, 2, |_, col| {
            if col == 0 {
                TileConditioning::new(embedding(3.0), embedding(1.0))
            } else {
                TileConditioning::unguided(embedding(3.0))
            }
        });
        let overrides = Grid::from_rows("guidance_scale_tiles", vec![vec![Some(5.0), None]]).unwrap();
        let guidance = GuidancePlan::new((1, 2), 1.0, Some(&overrides)).unwrap();
        let result = TiledSampler::new(geometry, blend, conditioning, guidance, DebugConfig::default());
        assert!(matches!(
            result,
            Err(TilingError::MissingUnconditional { row: 0, col: 1 })
        ));
    }

    #[test]
    fn test_pointwise_prediction_is_preserved_by_blending() {
        let device = Default::default();
        let geometry = TileGeometry::new(2, 3, 128, 96, 64, 32).unwrap();
        let conditioning = Grid::from_fn(2, 3, |_, _| TileConditioning::unguided(embedding(0.5)));
        let sampler = sampler(geometry, conditioning, GuidancePlan::uniform((2, 3), 1.0));
        let scheduler = Subtract { timesteps: vec![0] };

        let shape = [1, 4, geometry.latent_height(), geometry.latent_width()];
        let latent = seeded_normal::<TestBackend>(shape, 11, &device);
        let t = Tensor::<TestBackend, 1>::from_floats([0.0], &device);

        let blended = values(sampler.predict_noise(&ScaleByContext, &scheduler, &latent, 0, t).unwrap());
        let expected = values(latent * 0.5);
        for (b, e) in blended.iter().zip(&expected) {
            assert!((b - e).abs() < 1e-5, "{b} vs {e}");
        }
    }

    /// Prediction along the first row of a 1x2 grid with per-tile overrides
    ///
    /// Latent tiles are 8x8 overlapping by 4 columns, so columns 0..4 belong
    /// to tile (0, 0) alone and 8..12 to tile (0, 1) alone.
    fn predict_row(global: f64, overrides: Vec<Option<f64>>) -> Vec<f32> {
        let device = Default::default();
        let geometry = TileGeometry::new(1, 2, 64, 64, 0, 32).unwrap();
        let conditioning = Grid::from_fn(1, 2, |_, _| TileConditioning::new(embedding(3.0), embedding(1.0)));
        let overrides = Grid::from_rows("guidance_scale_tiles", vec![overrides]).unwrap();
        let guidance = GuidancePlan::new((1, 2), global, Some(&overrides)).unwrap();
        let sampler = sampler(geometry, conditioning, guidance);
        let scheduler = Subtract { timesteps: vec![0] };

        let latent = Tensor::<TestBackend, 4>::zeros([1, 4, 8, 12], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([0.0], &device);
        let pred = sampler.predict_noise(&ContextValue, &scheduler, &latent, 0, t).unwrap();
        values(pred.slice([0..1, 0..1, 0..1, 0..12]))
    }

    fn assert_columns(pred: &[f32], cols: std::ops::Range<usize>, expected: f32) {
        for col in cols {
            assert!((pred[col] - expected).abs() < 1e-5, "col {col}: {} != {expected}", pred[col]);
        }
    }

    #[test]
    fn test_guidance_scale_is_applied_per_tile() {
        // uncond 1, cond 3: uncond + scale * (cond - uncond)
        let pred = predict_row(1.0, vec![Some(2.0), None]);
        assert_columns(&pred, 0..4, 5.0);
        assert_columns(&pred, 8..12, 3.0);
        for col in 4..8 {
            assert!(pred[col] > 3.0 && pred[col] < 5.0, "col {col}: {}", pred[col]);
        }
    }

    #[test]
    fn test_low_overrides_still_guided_when_cfg_enabled() {
        let pred = predict_row(7.5, vec![Some(0.0), Some(0.5)]);
        // Scale 0 leaves the unconditional prediction
        assert_columns(&pred, 0..4, 1.0);
        // Scale 0.5 weakens guidance: 1 + 0.5 * (3 - 1)
        assert_columns(&pred, 8..12, 2.0);
    }

    #[test]
    fn test_no_cfg_uses_conditional_prediction() {
        let pred = predict_row(1.0, vec![Some(0.5), None]);
        assert_columns(&pred, 0..12, 3.0);
    }

    #[test]
    fn test_sample_stops_on_break() {
        let device = Default::default();
        let geometry = TileGeometry::new(1, 1, 64, 64, 0, 0).unwrap();
        let conditioning = Grid::from_fn(1, 1, |_, _| TileConditioning::unguided(embedding(1.0)));
        let sampler = sampler(geometry, conditioning, GuidancePlan::uniform((1, 1), 1.0));
        let mut scheduler = Subtract { timesteps: vec![] };
        scheduler.set_timesteps(5);

        let latent = Tensor::<TestBackend, 4>::zeros([1, 4, 8, 8], &device);
        let mut seen = Vec::new();
        let result = sampler.sample(&ContextValue, &mut scheduler, latent, 0.0, StepOutput::Latent, |info| {
            assert!(info.latent.is_some());
            seen.push(info.timestep);
            if info.step == 1 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        assert!(matches!(result, Err(TilingError::Cancelled { step: 2 })));
        assert_eq!(seen, vec![4, 3]);
    }

    #[test]
    fn test_sample_rejects_empty_schedule() {
        let device = Default::default();
        let geometry = TileGeometry::new(1, 1, 64, 64, 0, 0).unwrap();
        let conditioning = Grid::from_fn(1, 1, |_, _| TileConditioning::unguided(embedding(1.0)));
        let sampler = sampler(geometry, conditioning, GuidancePlan::uniform((1, 1), 1.0));
        let mut scheduler = Subtract { timesteps: vec![] };
        let latent = Tensor::<TestBackend, 4>::zeros([1, 4, 8, 8], &device);
        let result = sampler.sample(&ContextValue, &mut scheduler, latent, 0.0, StepOutput::None, |_| {
            ControlFlow::Continue(())
        });
        assert!(matches!(result, Err(TilingError::InvalidStepCount)));
    }
}
