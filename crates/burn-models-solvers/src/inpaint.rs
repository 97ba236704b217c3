//! Known-region re-blending for masked sampling

use burn::prelude::*;

use crate::error::{invalid, SamplerError};
use crate::guidance::fit_side_input;
use crate::noise::NoiseSource;

/// Re-noises a known sample to the next noise level and pastes it back
/// outside the mask
///
/// `mask` selects the generated region and `neg_mask` the known region, so a
/// step computes `q * neg_mask + x * mask` with
/// `q = sqrt(a_next) * known + sqrt(1 - a_next) * eps`.
#[derive(Debug, Clone)]
pub struct InpaintCompositor<B: Backend> {
    known: Tensor<B, 4>,
    mask: Tensor<B, 4>,
    neg_mask: Tensor<B, 4>,
}

impl<B: Backend> InpaintCompositor<B> {
    /// Fit the known sample and both masks to a latent shaped `shape`
    ///
    /// Masks may have one channel or one per latent channel, and a batch of
    /// one or of the latent's batch.
    pub fn new(
        known: Tensor<B, 4>,
        mask: Tensor<B, 4>,
        neg_mask: Tensor<B, 4>,
        shape: [usize; 4],
    ) -> Result<Self, SamplerError> {
        Ok(Self {
            known: fit_side_input(known, "known_sample", shape)?,
            mask: fit_mask(mask, "mask", shape)?,
            neg_mask: fit_mask(neg_mask, "neg_mask", shape)?,
        })
    }

    /// Blend the known region back into `latent`
    pub fn apply(
        &self,
        latent: Tensor<B, 4>,
        next_alpha_cumprod: f64,
        noise: &mut dyn NoiseSource<B>,
    ) -> Tensor<B, 4> {
        let eps = noise.randn(self.known.dims(), 1.0, 0.0, &self.known.device());
        let q_sample = self.known.clone() * next_alpha_cumprod.sqrt()
            + eps * (1.0 - next_alpha_cumprod).sqrt();
        q_sample * self.neg_mask.clone() + latent * self.mask.clone()
    }
}

fn fit_mask<B: Backend>(
    mask: Tensor<B, 4>,
    name: &str,
    [batch, height, width, channels]: [usize; 4],
) -> Result<Tensor<B, 4>, SamplerError> {
    let [_, _, _, c] = mask.dims();
    let mask = match c {
        c if c == channels => mask,
        1 => mask.repeat_dim(3, channels),
        c => {
            return Err(invalid(format!(
                "{name} has {c} channels, expected 1 or {channels}"
            )))
        }
    };
    fit_side_input(mask, name, [batch, height, width, channels])
}
