//! LCM (Latent Consistency Model) solver
//!
//! A distillation-based solver that jumps straight to a boundary-conditioned
//! clean estimate each step and re-noises it to the next grid point, which
//! gives usable samples in 1-8 steps. Guidance is baked into the model
//! through a guidance-scale embedding instead of batched branches.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SamplerError;
use crate::history::OutputHistory;
use crate::model::{Codec, WeightStore};
use crate::noise::NoiseSource;
use crate::preview::PreviewPolicy;
use crate::rule::{StepContext, Timeline, UpdateRule};
use crate::schedule::{shift_alpha, Discretization, NoiseSchedule, SamplingConfig, StepBoundary};

/// Lowest timestep on the consistency grid
const LCM_MIN_TIMESTEP: f64 = 20.0;

/// Configuration for the LCM solver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcmConfig {
    /// Weight-store key of the guidance projection, [width, embedding_dim]
    pub guidance_projection_key: String,
    /// Size of the sinusoidal guidance-scale embedding
    pub guidance_embedding_dim: usize,
    /// Preview cadence
    pub preview: PreviewPolicy,
}

impl Default for LcmConfig {
    fn default() -> Self {
        Self {
            guidance_projection_key: "w_cond_proj".to_string(),
            guidance_embedding_dim: 256,
            preview: PreviewPolicy::new(5, 5),
        }
    }
}

/// LCM update rule
#[derive(Debug, Clone)]
pub struct Lcm<B: Backend> {
    config: LcmConfig,
    /// Projected guidance embedding added to the time embedding, [batch, width]
    guidance_term: Option<Tensor<B, 2>>,
}

impl<B: Backend> Default for Lcm<B> {
    fn default() -> Self {
        Self::new(LcmConfig::default())
    }
}

impl<B: Backend> Lcm<B> {
    pub fn new(config: LcmConfig) -> Self {
        Self {
            config,
            guidance_term: None,
        }
    }

    pub fn config(&self) -> &LcmConfig {
        &self.config
    }

    /// The active guidance term, if any
    pub fn guidance_term(&self) -> Option<&Tensor<B, 2>> {
        self.guidance_term.as_ref()
    }
}

/// Discrete consistency grid: `min(round((T - 1 - 20) * (steps - i) / steps) + 20, T - 1)`
pub fn lcm_timesteps(steps: usize, training_timesteps: f64) -> Vec<f64> {
    let last = training_timesteps - 1.0;
    (0..steps)
        .map(|i| {
            let t = ((last - LCM_MIN_TIMESTEP) * (steps - i) as f64 / steps as f64).round()
                + LCM_MIN_TIMESTEP;
            t.min(last)
        })
        .collect()
}

/// Boundary-condition scalings `(c_skip, c_out)` at a discrete timestep
///
/// Uses sigma_data = 0.5 and a timestep scaling of 10, so `t = 0` gives
/// exactly `(1, 0)`.
pub fn boundary_scalings(timestep: f64) -> (f64, f64) {
    let scaled = timestep * 10.0;
    let c_skip = 0.25 / (scaled * scaled + 0.25);
    let c_out = scaled / (scaled * scaled + 0.25).sqrt();
    (c_skip, c_out)
}

/// Sinusoidal embedding of a guidance scale
pub fn guidance_scale_embedding(guidance: f32, dim: usize) -> Vec<f32> {
    let w = guidance as f64 * 1000.0;
    let half = dim / 2;
    let scale = 10000f64.ln() / (half.max(2) - 1) as f64;
    let mut emb = vec![0.0f32; dim];
    for i in 0..half {
        let v = w * (-(i as f64) * scale).exp();
        emb[i] = v.sin() as f32;
        emb[i + half] = v.cos() as f32;
    }
    emb
}

impl<B: Backend> UpdateRule<B> for Lcm<B> {
    fn name(&self) -> &'static str {
        "lcm"
    }

    fn uses_guidance(&self) -> bool {
        false
    }

    fn preview_policy(&self) -> PreviewPolicy {
        self.config.preview
    }

    fn decodes_preview(&self) -> bool {
        true
    }

    fn plan(
        &mut self,
        discretization: &dyn Discretization,
        sampling: &SamplingConfig,
        start: &StepBoundary,
        end: &StepBoundary,
    ) -> Timeline {
        let steps = sampling.steps;
        let schedule = NoiseSchedule::new(discretization, sampling);
        let mut timesteps = lcm_timesteps(steps, discretization.timesteps());
        for boundary in [start, end] {
            if boundary.is_fractional() && boundary.step < steps {
                let grid = timesteps[boundary.step];
                timesteps[boundary.step] = schedule.boundary_timestep(boundary, grid);
            }
        }

        let alpha = |t: f64| shift_alpha(discretization.alpha_cumprod(t), sampling.shift);
        let mut alphas_cumprod: Vec<f64> = timesteps.iter().map(|&t| alpha(t)).collect();
        alphas_cumprod.push(alpha(0.0));

        Timeline::new(discretization, timesteps, alphas_cumprod)
    }

    fn prepare(
        &mut self,
        weights: &dyn WeightStore,
        guidance_scale: f32,
        batch: usize,
        device: &B::Device,
    ) -> Result<(), SamplerError> {
        let dim = self.config.guidance_embedding_dim;
        let key = self.config.guidance_projection_key.as_str();
        self.guidance_term = None;

        let Some(data) = weights.read(key, Codec::Plain) else {
            debug!(key, "no guidance projection, skipping guidance embedding");
            return Ok(());
        };
        let shape = data.shape.clone();
        if shape.len() != 2 || shape[1] != dim {
            warn!(key, ?shape, dim, "guidance projection has an unexpected shape");
            return Ok(());
        }

        let projection: Tensor<B, 2> = Tensor::from_data(data, device);
        let embedding: Tensor<B, 2> = Tensor::from_data(
            TensorData::new(guidance_scale_embedding(guidance_scale - 1.0, dim), [dim, 1]),
            device,
        );
        let width = shape[0];
        let term = projection.matmul(embedding).reshape([1, width]).repeat_dim(0, batch);
        debug!(width, guidance_scale, "guidance embedding ready");
        self.guidance_term = Some(term);
        Ok(())
    }

    fn adjust_time_embedding(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        match &self.guidance_term {
            Some(term) if term.dims() == embedding.dims() => embedding + term.clone(),
            _ => embedding,
        }
    }

    fn on_model_swap(&mut self, is_consistency_model: bool) {
        if !is_consistency_model && self.guidance_term.take().is_some() {
            debug!("refiner is not a consistency model, dropping guidance embedding");
        }
    }

    fn advance(
        &mut self,
        denoised: Tensor<B, 4>,
        latent: Tensor<B, 4>,
        ctx: &StepContext,
        history: &mut OutputHistory<Tensor<B, 4>>,
        noise: &mut dyn NoiseSource<B>,
    ) -> Tensor<B, 4> {
        let (c_skip, c_out) = boundary_scalings(ctx.timestep);
        let denoised = denoised * c_out + latent * c_skip;
        history.push(ctx.index, denoised.clone());

        if ctx.is_final() {
            return denoised;
        }
        let next = ctx.next_alpha_cumprod;
        let eps = noise.randn(denoised.dims(), 1.0, 0.0, &denoised.device());
        denoised * next.sqrt() + eps * (1.0 - next).sqrt()
    }
}
