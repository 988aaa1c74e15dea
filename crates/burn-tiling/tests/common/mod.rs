//! Deterministic stand-ins for the networks and the scheduler

#![allow(dead_code)]

use std::cell::{Cell, RefCell};

use burn::prelude::*;
use burn::tensor::Int;
use burn_ndarray::NdArray;
use burn_tiling::{Autoencoder, Denoiser, Scheduler, TextEncoder, TilingPipeline, Tokenizer};

pub type TestBackend = NdArray<f32>;

pub type MockPipeline =
    TilingPipeline<TestBackend, MockTokenizer, MockTextEncoder, MockDenoiser, MockAutoencoder, MockScheduler>;

pub const MAX_TOKENS: usize = 8;
pub const EMBED_DIM: usize = 4;

/// Byte-level tokenizer padded with zeros
pub struct MockTokenizer;

impl Tokenizer for MockTokenizer {
    fn model_max_length(&self) -> usize {
        MAX_TOKENS
    }

    fn encode_padded(&self, text: &str, max_length: usize) -> Vec<u32> {
        let mut tokens: Vec<u32> = text.bytes().take(max_length).map(u32::from).collect();
        tokens.resize(max_length, 0);
        tokens
    }
}

/// Embeds each token id as a constant vector of `id / 255`
#[derive(Default)]
pub struct MockTextEncoder {
    pub calls: Cell<usize>,
}

impl TextEncoder<TestBackend> for MockTextEncoder {
    fn encode(&self, token_ids: Tensor<TestBackend, 2, Int>) -> Tensor<TestBackend, 3> {
        self.calls.set(self.calls.get() + 1);
        let ids = token_ids.float() / 255.0;
        ids.unsqueeze_dim::<3>(2).repeat_dim(2, EMBED_DIM)
    }
}

/// Smooth function of latent, timestep and context
#[derive(Default)]
pub struct MockDenoiser {
    pub calls: Cell<usize>,
    /// Batch sizes seen by each call
    pub batches: RefCell<Vec<usize>>,
}

impl Denoiser<TestBackend> for MockDenoiser {
    fn in_channels(&self) -> usize {
        4
    }

    fn predict_noise(
        &self,
        latent: Tensor<TestBackend, 4>,
        timestep: Tensor<TestBackend, 1>,
        context: Tensor<TestBackend, 3>,
    ) -> Tensor<TestBackend, 4> {
        self.calls.set(self.calls.get() + 1);
        let [n, _, _, _] = latent.dims();
        self.batches.borrow_mut().push(n);

        let context = context.mean_dim(2).mean_dim(1).reshape([n, 1, 1, 1]);
        let timestep = timestep.reshape([1, 1, 1, 1]) / 1000.0;
        latent.clone() * 0.2 + latent.tanh() * context + timestep
    }
}

/// Shifts the first three latent channels into [0, 255]
#[derive(Default)]
pub struct MockAutoencoder {
    pub calls: Cell<usize>,
}

impl Autoencoder<TestBackend> for MockAutoencoder {
    fn decode(&self, latent: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
        self.calls.set(self.calls.get() + 1);
        let [b, _, h, w] = latent.dims();
        latent.slice([0..b, 0..3, 0..h, 0..w]) * 64.0 + 127.5
    }
}

/// Deterministic DDIM-like update with evenly spaced timesteps
#[derive(Default)]
pub struct MockScheduler {
    timesteps: Vec<usize>,
    pub steps_taken: usize,
    pub etas: Vec<f64>,
    pub init_noise_sigma: Option<f32>,
}

impl Scheduler<TestBackend> for MockScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        let stride = 1000 / num_inference_steps.max(1);
        self.timesteps = (0..num_inference_steps).rev().map(|i| i * stride + 1).collect();
        self.steps_taken = 0;
        self.etas.clear();
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> Option<f32> {
        self.init_noise_sigma
    }

    fn step(
        &mut self,
        model_output: Tensor<TestBackend, 4>,
        step_index: usize,
        latent: Tensor<TestBackend, 4>,
        eta: f64,
    ) -> Tensor<TestBackend, 4> {
        assert_eq!(step_index, self.steps_taken, "steps must run in order");
        self.steps_taken += 1;
        self.etas.push(eta);
        latent - model_output * 0.1
    }
}

pub fn mock_pipeline() -> MockPipeline {
    TilingPipeline::new(
        MockTokenizer,
        MockTextEncoder::default(),
        MockDenoiser::default(),
        MockAutoencoder::default(),
        MockScheduler::default(),
        &Default::default(),
    )
}

pub fn prompt_grid(rows: usize, cols: usize) -> Vec<Vec<String>> {
    (0..rows)
        .map(|r| (0..cols).map(|c| format!("tile {r},{c}")).collect())
        .collect()
}

pub fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec().unwrap()
}
