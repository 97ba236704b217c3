//! Classifier-free guidance batching and composition
//!
//! The compositor lays out one model batch per step (unconditional,
//! conditional and, for editing, an all-unconditional branch stacked along
//! the batch axis, with modifier side channels appended along the channel
//! axis) and folds the model's output back into a single prediction.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::blur::GaussianBlur;
use crate::error::{invalid, SamplerError};

/// Extra inputs the model expects beside the latent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerModifier {
    /// Latent only
    #[default]
    None,
    /// `[latent | mask | masked image]`
    Inpainting,
    /// `[latent | depth]`
    Depth,
    /// `[latent | reference image]`, guided with three branches
    Editing,
}

impl SamplerModifier {
    /// Model input channels for a latent with `channels` channels
    pub fn input_channels(&self, channels: usize) -> usize {
        match self {
            SamplerModifier::None => channels,
            SamplerModifier::Inpainting => channels * 2 + 1,
            SamplerModifier::Depth => channels + 1,
            SamplerModifier::Editing => channels * 2,
        }
    }
}

/// Guidance strengths for one sampling call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuidanceScales {
    /// Text guidance scale `g`
    pub text: f32,
    /// Image guidance scale `gi` (editing only)
    pub image: f32,
    /// Scale for the first batch row; rows interpolate linearly up to `text`
    pub start_frame: Option<f32>,
}

impl Default for GuidanceScales {
    fn default() -> Self {
        Self {
            text: 7.5,
            image: 1.5,
            start_frame: None,
        }
    }
}

impl GuidanceScales {
    pub fn text(text: f32) -> Self {
        Self {
            text,
            ..Default::default()
        }
    }

    /// Whether guidance would leave the conditional prediction unchanged
    pub fn is_unit(&self) -> bool {
        self.text == 1.0 && self.start_frame.map_or(true, |s| s == 1.0)
    }

    /// Per-row scale for frame-varying guidance
    pub fn frame_scale(&self, row: usize, batch: usize) -> f32 {
        let start = self.start_frame.unwrap_or(self.text);
        if batch < 2 {
            return start;
        }
        start + row as f32 * (self.text - start) / (batch - 1) as f32
    }
}

/// `uncond + scale * (cond - uncond)`
pub fn apply_guidance<B: Backend>(
    uncond: Tensor<B, 4>,
    cond: Tensor<B, 4>,
    scale: f32,
) -> Tensor<B, 4> {
    uncond.clone() + (cond - uncond) * scale
}

/// Weight of the blurred prediction for a step at `timestep`
///
/// Proportional to the remaining noise, so it vanishes at the clean end.
pub fn sharpness_weight(sharpness: f32, timestep: f64, training_timesteps: f64) -> f64 {
    0.001 * sharpness as f64 * (timestep / training_timesteps).clamp(0.0, 1.0)
}

/// Shape of the model batch for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuidanceLayout {
    pub modifier: SamplerModifier,
    pub cfg_enabled: bool,
    /// Number of stacked branches (1, 2 or 3)
    pub cfg_channels: usize,
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    /// Latent channels
    pub channels: usize,
    /// Model input channels
    pub in_channels: usize,
}

impl GuidanceLayout {
    /// Decide the branch layout for a latent shaped `[batch, height, width, channels]`
    ///
    /// `classifier_free_guidance` is the sampler's switch and `batches_branches`
    /// whether the update rule stacks guidance branches at all. Editing always
    /// runs three branches when the rule batches them.
    pub fn new(
        modifier: SamplerModifier,
        classifier_free_guidance: bool,
        batches_branches: bool,
        scales: &GuidanceScales,
        [batch_size, height, width, channels]: [usize; 4],
    ) -> Self {
        let cfg_enabled = batches_branches
            && (modifier == SamplerModifier::Editing
                || (classifier_free_guidance && !scales.is_unit()));
        let cfg_channels = match (cfg_enabled, modifier) {
            (false, _) => 1,
            (true, SamplerModifier::Editing) => 3,
            (true, _) => 2,
        };
        Self {
            modifier,
            cfg_enabled,
            cfg_channels,
            batch_size,
            height,
            width,
            channels,
            in_channels: modifier.input_channels(channels),
        }
    }

    /// Leading dimension of the model batch
    pub fn model_batch(&self) -> usize {
        self.cfg_channels * self.batch_size
    }
}

/// Batched model input for one step
#[derive(Debug, Clone)]
pub struct GuidanceBatch<B: Backend> {
    /// [cfg_channels * batch, H, W, in_channels]
    pub input: Tensor<B, 4>,
    pub cfg_channels: usize,
    pub batch_size: usize,
}

/// Modifier side inputs, each `[1 | batch, H, W, _]`
#[derive(Debug, Clone)]
pub struct SideInputs<B: Backend> {
    pub mask: Option<Tensor<B, 4>>,
    pub masked_image: Option<Tensor<B, 4>>,
    pub depth_image: Option<Tensor<B, 4>>,
}

impl<B: Backend> Default for SideInputs<B> {
    fn default() -> Self {
        Self {
            mask: None,
            masked_image: None,
            depth_image: None,
        }
    }
}

/// Builds the per-step guidance batch and composes the model output
#[derive(Debug, Clone)]
pub struct GuidanceCompositor<B: Backend> {
    layout: GuidanceLayout,
    scales: GuidanceScales,
    /// Side channels for every branch, fixed for the run
    side: Option<Tensor<B, 4>>,
    /// [batch, H, W, C] per-row guidance scale
    frame_scales: Option<Tensor<B, 4>>,
    blur: Option<GaussianBlur<B>>,
    sharpness: f32,
    training_timesteps: f64,
}

impl<B: Backend> GuidanceCompositor<B> {
    pub fn new(
        layout: GuidanceLayout,
        side: SideInputs<B>,
        scales: GuidanceScales,
        sharpness: f32,
        training_timesteps: f64,
        device: &B::Device,
    ) -> Result<Self, SamplerError> {
        let GuidanceLayout {
            batch_size: b,
            height: h,
            width: w,
            channels: c,
            cfg_channels,
            ..
        } = layout;
        let fit = |tensor: Option<Tensor<B, 4>>, name: &str, channels: usize| {
            let tensor = tensor.ok_or_else(|| {
                invalid(format!("{:?} modifier requires {name}", layout.modifier))
            })?;
            fit_side_input(tensor, name, [b, h, w, channels])
        };

        let side = match layout.modifier {
            SamplerModifier::None => None,
            SamplerModifier::Inpainting => {
                let mask = fit(side.mask, "mask", 1)?;
                let masked = fit(side.masked_image, "masked_image", c)?;
                let block = Tensor::cat(vec![mask, masked], 3);
                Some(Tensor::cat(vec![block; cfg_channels], 0))
            }
            SamplerModifier::Depth => {
                let depth = fit(side.depth_image, "depth_image", 1)?;
                Some(Tensor::cat(vec![depth; cfg_channels], 0))
            }
            SamplerModifier::Editing => {
                let reference = fit(side.masked_image, "masked_image", c)?;
                if cfg_channels == 3 {
                    let zeros = Tensor::zeros([b, h, w, c], device);
                    Some(Tensor::cat(vec![reference.clone(), reference, zeros], 0))
                } else {
                    Some(Tensor::cat(vec![reference; cfg_channels], 0))
                }
            }
        };

        let frame_scales = match scales.start_frame {
            Some(_) if layout.cfg_enabled && layout.modifier != SamplerModifier::Editing => {
                let rows: Vec<f32> = (0..b).map(|row| scales.frame_scale(row, b)).collect();
                let column: Tensor<B, 4> =
                    Tensor::from_data(TensorData::new(rows, [b, 1, 1, 1]), device);
                Some(column.repeat_dim(1, h).repeat_dim(2, w).repeat_dim(3, c))
            }
            _ => None,
        };

        let blur = (sharpness > 0.0).then(|| GaussianBlur::sharpness(c, device));

        Ok(Self {
            layout,
            scales,
            side,
            frame_scales,
            blur,
            sharpness,
            training_timesteps,
        })
    }

    pub fn layout(&self) -> &GuidanceLayout {
        &self.layout
    }

    /// Stack the latent once per branch and append side channels
    pub fn build(&self, latent: &Tensor<B, 4>) -> GuidanceBatch<B> {
        let stacked = if self.layout.cfg_channels == 1 {
            latent.clone()
        } else {
            Tensor::cat(vec![latent.clone(); self.layout.cfg_channels], 0)
        };
        let input = match &self.side {
            Some(side) => Tensor::cat(vec![stacked, side.clone()], 3),
            None => stacked,
        };
        GuidanceBatch {
            input,
            cfg_channels: self.layout.cfg_channels,
            batch_size: self.layout.batch_size,
        }
    }

    /// Fold the model output for the whole batch into one prediction
    pub fn compose(&self, output: Tensor<B, 4>, timestep: f64) -> Tensor<B, 4> {
        let [rows, h, w, out_channels] = output.dims();
        let b = self.layout.batch_size;
        let c = self.layout.channels;
        let output = if out_channels > c {
            output.slice([0..rows, 0..h, 0..w, 0..c])
        } else {
            output
        };
        let weight = sharpness_weight(self.sharpness, timestep, self.training_timesteps);

        if !self.layout.cfg_enabled {
            return self.sharpen(output, weight);
        }

        let branch = |k: usize| output.clone().slice([k * b..(k + 1) * b, 0..h, 0..w, 0..c]);
        let uncond = branch(0);
        let cond = self.sharpen(branch(1), weight);

        if self.layout.cfg_channels == 3 {
            let all_uncond = branch(2);
            return all_uncond.clone()
                + (cond - uncond.clone()) * self.scales.text
                + (uncond - all_uncond) * self.scales.image;
        }
        match &self.frame_scales {
            Some(scales) => uncond.clone() + (cond - uncond) * scales.clone(),
            None => apply_guidance(uncond, cond, self.scales.text),
        }
    }

    /// `w * blur(p) + (1 - w) * p`
    fn sharpen(&self, prediction: Tensor<B, 4>, weight: f64) -> Tensor<B, 4> {
        match &self.blur {
            Some(blur) if weight > 0.0 => {
                blur.forward(prediction.clone()) * weight + prediction * (1.0 - weight)
            }
            _ => prediction,
        }
    }
}

/// Check a side input against the latent geometry and broadcast its batch
pub(crate) fn fit_side_input<B: Backend>(
    tensor: Tensor<B, 4>,
    name: &str,
    [batch, height, width, channels]: [usize; 4],
) -> Result<Tensor<B, 4>, SamplerError> {
    let [b, h, w, c] = tensor.dims();
    if h != height || w != width {
        return Err(invalid(format!(
            "{name} is {h}x{w} but the latent is {height}x{width}"
        )));
    }
    if c != channels {
        return Err(invalid(format!(
            "{name} has {c} channels, expected {channels}"
        )));
    }
    if b == batch {
        Ok(tensor)
    } else if b == 1 {
        Ok(tensor.repeat_dim(0, batch))
    } else {
        Err(invalid(format!(
            "{name} has batch {b} but the latent has batch {batch}"
        )))
    }
}
