//! Update-rule strategy shared by the step state machine

use burn::prelude::*;

use crate::error::SamplerError;
use crate::history::OutputHistory;
use crate::model::WeightStore;
use crate::noise::NoiseSource;
use crate::preview::PreviewPolicy;
use crate::schedule::{Discretization, SamplingConfig, StepBoundary};

/// Per-step coefficients for one run
///
/// `timesteps[i]` is the discrete timestep of sampling step `i`;
/// `alphas_cumprod` has one extra terminal entry so that step `i` always has
/// a next value.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub timesteps: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub noise_levels: Vec<f64>,
    pub steps: usize,
}

impl Timeline {
    /// Timeline over explicit per-step timesteps and alphas
    pub fn new<D: Discretization + ?Sized>(
        discretization: &D,
        timesteps: Vec<f64>,
        alphas_cumprod: Vec<f64>,
    ) -> Self {
        let steps = timesteps.len();
        let noise_levels = alphas_cumprod
            .iter()
            .map(|&alpha| discretization.noise(alpha))
            .collect();
        Self {
            timesteps,
            alphas_cumprod,
            noise_levels,
            steps,
        }
    }

    /// Context for step `index` of a call ending before step `end`
    pub fn context(&self, index: usize, end: usize) -> StepContext {
        StepContext {
            index,
            timestep: self.timesteps[index],
            noise_level: self.noise_levels[index],
            alpha_cumprod: self.alphas_cumprod[index],
            next_alpha_cumprod: self.alphas_cumprod[index + 1],
            schedule_end: self.steps,
            last: index + 1 == end,
        }
    }
}

/// What the model and the update rule need to know about one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    /// Absolute sampling step
    pub index: usize,
    /// Discrete timestep for model conditioning
    pub timestep: f64,
    /// Continuous noise level sigma
    pub noise_level: f64,
    pub alpha_cumprod: f64,
    /// Alpha of the point this step advances to
    pub next_alpha_cumprod: f64,
    /// Configured step count
    pub schedule_end: usize,
    /// Last step of this call
    pub last: bool,
}

impl StepContext {
    /// Whether this is the final step of the whole schedule
    pub fn is_final(&self) -> bool {
        self.index + 1 >= self.schedule_end
    }
}

/// One solver family's per-step update
///
/// The sampler clones the configured rule at the start of every call, so
/// implementations keep per-run state in `self` without leaking it across
/// calls.
pub trait UpdateRule<B: Backend>: Clone {
    /// Short solver name for logs and errors
    fn name(&self) -> &'static str;

    /// Whether the rule batches classifier-free guidance branches
    fn uses_guidance(&self) -> bool;

    /// Preview cadence used when the sampler config does not set one
    fn preview_policy(&self) -> PreviewPolicy;

    /// Whether previews go through the model's preview decoder
    fn decodes_preview(&self) -> bool {
        false
    }

    /// Build the run's timeline
    fn plan(
        &mut self,
        discretization: &dyn Discretization,
        sampling: &SamplingConfig,
        start: &StepBoundary,
        end: &StepBoundary,
    ) -> Timeline;

    /// Load rule-specific tensors before the first step
    fn prepare(
        &mut self,
        _weights: &dyn WeightStore,
        _guidance_scale: f32,
        _batch: usize,
        _device: &B::Device,
    ) -> Result<(), SamplerError> {
        Ok(())
    }

    /// Add rule-specific terms to the model's time embedding
    fn adjust_time_embedding(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        embedding
    }

    /// Called after a refiner handoff replaced the model
    fn on_model_swap(&mut self, _is_consistency_model: bool) {}

    /// Advance the latent by one step
    ///
    /// `denoised` is the model's prediction already converted to a clean
    /// sample. The rule records what it wants previewed in `history`.
    fn advance(
        &mut self,
        denoised: Tensor<B, 4>,
        latent: Tensor<B, 4>,
        ctx: &StepContext,
        history: &mut OutputHistory<Tensor<B, 4>>,
        noise: &mut dyn NoiseSource<B>,
    ) -> Tensor<B, 4>;
}
