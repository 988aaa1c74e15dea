//! Interfaces of the models a tiled run drives
//!
//! The tiling core never looks inside the networks. Anything that can
//! predict noise, embed tokens, decode latents and step a noise schedule can
//! be plugged in through these traits.

use burn::prelude::*;
use burn::tensor::Int;

/// Noise prediction network (a UNet or DiT)
pub trait Denoiser<B: Backend> {
    /// Number of latent channels the network consumes
    fn in_channels(&self) -> usize;

    /// Predict the noise residual of `latent`
    ///
    /// * `latent` - Noisy latents [batch, channels, height, width]
    /// * `timestep` - Current timestep [1]
    /// * `context` - Text embeddings [batch, seq_len, embed_dim]
    ///
    /// Returns a tensor with the same shape as `latent`.
    fn predict_noise(
        &self,
        latent: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        context: Tensor<B, 3>,
    ) -> Tensor<B, 4>;
}

/// Text to token ids
pub trait Tokenizer {
    /// Maximum sequence length the text encoder accepts
    fn model_max_length(&self) -> usize {
        77
    }

    /// Tokenize, truncate and pad to exactly `max_length` ids
    fn encode_padded(&self, text: &str, max_length: usize) -> Vec<u32>;
}

/// Token ids to embedding sequence
pub trait TextEncoder<B: Backend> {
    /// Encode [batch, seq_len] token ids into [batch, seq_len, embed_dim]
    fn encode(&self, token_ids: Tensor<B, 2, Int>) -> Tensor<B, 3>;
}

/// Latent to image decoder
pub trait Autoencoder<B: Backend> {
    /// Decode latents [batch, channels, h, w] into images
    /// [batch, 3, h * 8, w * 8] with values in [0, 255]
    ///
    /// Implementations apply their own latent scaling factor.
    fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Noise schedule stepping
///
/// Timesteps are an ordered, finite sequence fixed by [`set_timesteps`];
/// [`step`] is called exactly once per entry, in order, and may update
/// internal state such as multistep history.
///
/// [`set_timesteps`]: Scheduler::set_timesteps
/// [`step`]: Scheduler::step
pub trait Scheduler<B: Backend> {
    /// Prepare a schedule of `num_inference_steps` steps
    fn set_timesteps(&mut self, num_inference_steps: usize);

    /// Timesteps of the prepared schedule, highest noise first
    fn timesteps(&self) -> &[usize];

    /// Scale applied to the initial latent, if the scheduler expects one
    ///
    /// Sigma-based schedulers (Euler, LMS) start from noise at `sigma_max`
    /// rather than unit variance.
    fn init_noise_sigma(&self) -> Option<f32> {
        None
    }

    /// Scale the network input for the given step
    fn scale_model_input(&self, latent: Tensor<B, 4>, _step_index: usize) -> Tensor<B, 4> {
        latent
    }

    /// Advance `latent` by one step given the model output
    ///
    /// `eta` controls injected noise for schedulers that support it and is
    /// ignored by the rest.
    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        step_index: usize,
        latent: Tensor<B, 4>,
        eta: f64,
    ) -> Tensor<B, 4>;
}
