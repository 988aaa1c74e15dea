//! Diagnostics for sampling runs

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TilingError};

/// Debug flags for sampler diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Log latent and prediction statistics at every step
    pub sampler: bool,
    /// Fail on NaN/Inf in predictions and latents
    pub nan: bool,
}

pub(crate) fn tensor_values<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| TilingError::TensorData(format!("{e:?}")))
}

/// Summary statistics of a tensor for log output
pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let floats = match tensor_values(tensor) {
        Ok(values) => values,
        Err(err) => return err.to_string(),
    };

    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let min = floats.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = floats.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = floats.iter().sum::<f32>() / floats.len() as f32;
    let var = floats.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / floats.len() as f32;

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4} [NaN={}, Inf={}]",
            min,
            max,
            mean,
            var.sqrt(),
            nan_count,
            inf_count
        )
    } else {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            min,
            max,
            mean,
            var.sqrt()
        )
    }
}

/// Fail with [`TilingError::NonFinite`] if the tensor holds NaN or Inf
pub fn check_finite<B: Backend, const D: usize>(tensor: &Tensor<B, D>, name: &str) -> Result<()> {
    let floats = tensor_values(tensor)?;
    let nan = floats.iter().filter(|x| x.is_nan()).count();
    let inf = floats.iter().filter(|x| x.is_infinite()).count();
    if nan > 0 || inf > 0 {
        return Err(TilingError::NonFinite {
            name: name.to_string(),
            nan,
            inf,
        });
    }
    Ok(())
}

/// [`check_finite`] gated on a debug flag
#[inline]
pub(crate) fn check_finite_if<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: &str,
    enabled: bool,
) -> Result<()> {
    if enabled {
        check_finite(tensor, name)
    } else {
        Ok(())
    }
}
