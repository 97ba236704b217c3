//! Depthwise Gaussian blur used by the sharpness term

use burn::prelude::*;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;

/// Gaussian standard deviation in latent pixels
pub const BLUR_SIGMA: f64 = 3.0;
/// Kernel taps per axis
pub const BLUR_SIZE: usize = 13;

/// Separable Gaussian blur applied per channel to NHWC latents
///
/// Borders are zero padded, matching a "same" convolution.
#[derive(Debug, Clone)]
pub struct GaussianBlur<B: Backend> {
    /// [C, 1, size, 1]
    vertical: Tensor<B, 4>,
    /// [C, 1, 1, size]
    horizontal: Tensor<B, 4>,
    channels: usize,
}

impl<B: Backend> GaussianBlur<B> {
    pub fn new(channels: usize, sigma: f64, size: usize, device: &B::Device) -> Self {
        let taps = gaussian_taps(sigma, size);
        let kernel: Vec<f32> = (0..channels).flat_map(|_| taps.iter().copied()).collect();
        let vertical =
            Tensor::from_data(TensorData::new(kernel.clone(), [channels, 1, size, 1]), device);
        let horizontal = Tensor::from_data(TensorData::new(kernel, [channels, 1, 1, size]), device);
        Self {
            vertical,
            horizontal,
            channels,
        }
    }

    /// Blur with the sharpness defaults (sigma 3, 13 taps)
    pub fn sharpness(channels: usize, device: &B::Device) -> Self {
        Self::new(channels, BLUR_SIGMA, BLUR_SIZE, device)
    }

    /// Blur an NHWC tensor
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, size, _] = self.vertical.dims();
        let pad = size / 2;
        let x = input.permute([0, 3, 1, 2]);
        let x = conv2d(
            x,
            self.vertical.clone(),
            None,
            ConvOptions::new([1, 1], [pad, 0], [1, 1], self.channels),
        );
        let x = conv2d(
            x,
            self.horizontal.clone(),
            None,
            ConvOptions::new([1, 1], [0, pad], [1, 1], self.channels),
        );
        x.permute([0, 2, 3, 1])
    }
}

/// Normalized 1-D Gaussian kernel
fn gaussian_taps(sigma: f64, size: usize) -> Vec<f32> {
    let center = (size / 2) as f64;
    let weights: Vec<f64> = (0..size)
        .map(|k| {
            let d = k as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| (w / sum) as f32).collect()
}
