//! Step previews, NaN scans and latent diagnostics

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SamplerError;

/// When the state machine decodes a preview for the feedback callback
///
/// A preview is produced on step `i` when `i % interval == interval - 1` or
/// once `i` is past `max(start, steps / 2)`. Previews on steps where
/// `i % nan_check_interval == nan_check_interval - 1` are scanned for NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewPolicy {
    pub interval: usize,
    pub nan_check_interval: usize,
}

impl PreviewPolicy {
    pub const fn new(interval: usize, nan_check_interval: usize) -> Self {
        Self {
            interval,
            nan_check_interval,
        }
    }

    /// Whether step `index` gets a preview
    pub fn should_preview(&self, index: usize, start: usize, steps: usize) -> bool {
        let interval = self.interval.max(1);
        index > start.max(steps / 2) || index % interval == interval - 1
    }

    /// Whether the preview at step `index` is scanned for NaN
    pub fn is_nan_check(&self, index: usize) -> bool {
        let interval = self.nan_check_interval.max(1);
        index % interval == interval - 1
    }
}

impl Default for PreviewPolicy {
    fn default() -> Self {
        Self::new(2, 5)
    }
}

/// Debug flags for sampler diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Log latent statistics after every step
    pub stats: bool,
}

/// Latent space format for RGB preview projection
///
/// Coefficients from ComfyUI's latent_formats.py:
/// https://github.com/comfyanonymous/ComfyUI/blob/master/comfy/latent_formats.py
/// Licensed under GPL-3.0
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatentFormat {
    /// Stable Diffusion 1.x
    #[default]
    SD15,
    /// Stable Diffusion XL
    SDXL,
    /// Stable Diffusion 3
    SD3,
    /// Flux.1
    Flux,
}

impl LatentFormat {
    /// Number of latent channels for this format
    pub fn channels(&self) -> usize {
        match self {
            Self::SD15 | Self::SDXL => 4,
            Self::SD3 | Self::Flux => 16,
        }
    }

    /// Guess a format from the latent channel count
    pub fn for_channels(channels: usize) -> Option<Self> {
        match channels {
            4 => Some(Self::SD15),
            16 => Some(Self::SD3),
            _ => None,
        }
    }

    /// RGB projection coefficients (channels x 3) and bias
    #[rustfmt::skip]
    fn rgb_coefs(&self) -> (Vec<f32>, [f32; 3]) {
        match self {
            Self::SD15 => (vec![
                 0.3512,  0.2297,  0.3227,
                 0.3250,  0.4974,  0.2350,
                -0.2829,  0.1762,  0.2721,
                -0.2120, -0.2616, -0.7177,
            ], [0.0, 0.0, 0.0]),

            Self::SDXL => (vec![
                 0.3651,  0.4232,  0.4341,
                -0.2533, -0.0042,  0.1068,
                 0.1076,  0.1111, -0.0362,
                -0.3165, -0.2492, -0.2188,
            ], [0.1084, -0.0175, -0.0011]),

            Self::SD3 => (vec![
                -0.0645,  0.0177,  0.1052,
                 0.0028,  0.0312,  0.0650,
                 0.1848,  0.0762,  0.0360,
                 0.0944,  0.0360,  0.0889,
                 0.0897,  0.0506, -0.0364,
                -0.0020,  0.1203,  0.0284,
                 0.0855,  0.0118,  0.0283,
                -0.0539,  0.1160,  0.1077,
                -0.0057,  0.0116,  0.0700,
                -0.0412,  0.0281, -0.0039,
                 0.1106,  0.1171,  0.1220,
                -0.0248,  0.0682, -0.0481,
                 0.0815,  0.0846,  0.1207,
                -0.0120, -0.0055, -0.1463,
                 0.0020,  0.0523,  0.1994,
                 0.0339,  0.0254,  0.0459,
            ], [0.2394, 0.2135, 0.1925]),

            Self::Flux => (vec![
                -0.0346,  0.0244,  0.0681,
                 0.0034,  0.0210,  0.0687,
                 0.0437,  0.0689,  0.0471,
                 0.0440,  0.0967,  0.0728,
                 0.0386,  0.0445, -0.0601,
                 0.0444,  0.0921,  0.0335,
                 0.0986,  0.0331,  0.0743,
                -0.0279,  0.0553,  0.0452,
                -0.0060,  0.0298,  0.0636,
                 0.0349,  0.0784,  0.0276,
                 0.0732,  0.0735,  0.0148,
                 0.0091,  0.0420,  0.0073,
                 0.0719,  0.0669,  0.0757,
                 0.0270,  0.0658,  0.0031,
                -0.0156,  0.0353,  0.0604,
                 0.0472,  0.0316,  0.0701,
            ], [-0.0329, -0.0718, -0.0851]),
        }
    }
}

/// Project an NHWC latent to an NHWC RGB preview in [0, 255]
///
/// Falls back to the channel-count default when `format` does not match the
/// latent. Latents with no known projection are returned unchanged.
pub fn latent_to_preview<B: Backend>(latent: Tensor<B, 4>, format: LatentFormat) -> Tensor<B, 4> {
    let [b, h, w, c] = latent.dims();
    let device = latent.device();

    let effective_format = if format.channels() == c {
        format
    } else {
        match LatentFormat::for_channels(c) {
            Some(format) => format,
            None => return latent,
        }
    };

    let (coefs_vec, bias) = effective_format.rgb_coefs();
    let coefs: Tensor<B, 2> = Tensor::from_data(TensorData::new(coefs_vec, [c, 3]), &device);

    // einsum "bxyc,cr -> bxyr"
    let flat = latent.reshape([b, h * w, c]);
    let coefs_3d = coefs.unsqueeze::<3>().repeat_dim(0, b);
    let rgb = flat.matmul(coefs_3d).reshape([b, h, w, 3]);

    let bias_tensor: Tensor<B, 1> = Tensor::from_data(TensorData::new(bias.to_vec(), [3]), &device);
    let bias = bias_tensor
        .reshape([1, 1, 1, 3])
        .repeat_dim(0, b)
        .repeat_dim(1, h)
        .repeat_dim(2, w);
    let rgb = rgb + bias;
    ((rgb + 0.5) * 255.0).clamp(0.0, 255.0)
}

/// Copy a tensor back to host memory
pub fn read_back<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> TensorData {
    tensor.into_data()
}

/// Host values as f32
pub fn host_values(data: &TensorData) -> Result<Vec<f32>, SamplerError> {
    data.clone()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| SamplerError::TensorData(format!("{err:?}")))
}

/// Whether host data contains a NaN
pub fn contains_nan(data: &TensorData) -> Result<bool, SamplerError> {
    Ok(host_values(data)?.iter().any(|v| v.is_nan()))
}

/// Whether a device tensor contains a NaN
pub fn tensor_has_nan<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
) -> Result<bool, SamplerError> {
    contains_nan(&read_back(tensor.clone()))
}

/// Summary statistics for debug logging
pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let floats = match host_values(&read_back(tensor.clone())) {
        Ok(floats) => floats,
        Err(err) => return err.to_string(),
    };

    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let min = floats.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = floats.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = floats.iter().sum();
    let mean = sum / floats.len() as f32;
    let var: f32 = floats.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / floats.len() as f32;
    let std = var.sqrt();

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4} [NaN={}, Inf={}]",
            min, max, mean, std, nan_count, inf_count
        )
    } else {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            min, max, mean, std
        )
    }
}
