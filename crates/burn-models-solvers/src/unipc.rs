//! UniPC (Unified Predictor-Corrector) solver
//!
//! A multistep exponential integrator in log-SNR time. Each step first
//! corrects the previous predictor output with the fresh model prediction
//! (UniC), then predicts the next grid point (UniP). The two-slot output
//! history caps both phases at second order.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::history::OutputHistory;
use crate::noise::NoiseSource;
use crate::preview::PreviewPolicy;
use crate::rule::{StepContext, Timeline, UpdateRule};
use crate::schedule::{Discretization, NoiseSchedule, SamplingConfig, StepBoundary};

/// Configuration for the UniPC solver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniPcConfig {
    /// Apply the corrector (false = predictor only)
    pub use_corrector: bool,
    /// Preview cadence
    pub preview: PreviewPolicy,
}

impl Default for UniPcConfig {
    fn default() -> Self {
        Self {
            use_corrector: true,
            preview: PreviewPolicy::new(2, 5),
        }
    }
}

/// UniPC update rule
///
/// Coefficients are indexed by sampling step; index `steps` is the clean
/// end of the grid.
#[derive(Debug, Clone)]
pub struct UniPc<B: Backend> {
    config: UniPcConfig,
    /// sqrt(alpha_cumprod)
    alphas: Vec<f64>,
    /// sqrt(1 - alpha_cumprod)
    sigmas: Vec<f64>,
    /// ln(alpha) - ln(sigma)
    lambdas: Vec<f64>,
    /// Latent the last predictor started from
    last_sample: Option<Tensor<B, 4>>,
}

impl<B: Backend> Default for UniPc<B> {
    fn default() -> Self {
        Self::new(UniPcConfig::default())
    }
}

impl<B: Backend> UniPc<B> {
    pub fn new(config: UniPcConfig) -> Self {
        Self {
            config,
            alphas: Vec::new(),
            sigmas: Vec::new(),
            lambdas: Vec::new(),
            last_sample: None,
        }
    }

    pub fn config(&self) -> &UniPcConfig {
        &self.config
    }

    /// Log-SNR per sampling step
    pub fn lambdas(&self) -> &[f64] {
        &self.lambdas
    }

    /// UniP-bh: advance `sample` to step `t` from the newest history entry
    fn predict(
        &self,
        t: usize,
        sample: Tensor<B, 4>,
        history: &OutputHistory<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let Some((s0, m0)) = history.newest() else {
            return sample;
        };
        let h = self.lambdas[t] - self.lambdas[s0];
        let h_phi_1 = (-h).exp() - 1.0;
        let b_h = h_phi_1;

        let xt = sample * (self.sigmas[t] / self.sigmas[s0])
            - m0.clone() * (self.alphas[t] * h_phi_1);
        match history.previous() {
            Some((si, mi)) => {
                let rk = (self.lambdas[si] - self.lambdas[s0]) / h;
                let d1 = (mi.clone() - m0.clone()) * (1.0 / rk);
                xt - d1 * (self.alphas[t] * b_h * 0.5)
            }
            None => xt,
        }
    }

    /// UniC-bh: redo the step into `t` from `last_sample` using the new prediction `mt`
    fn correct(
        &self,
        mt: Tensor<B, 4>,
        t: usize,
        last_sample: Tensor<B, 4>,
        history: &OutputHistory<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let Some((s0, m0)) = history.newest() else {
            return last_sample;
        };
        let h = self.lambdas[t] - self.lambdas[s0];
        let hh = -h;
        let h_phi_1 = hh.exp() - 1.0;
        let h_phi_k = h_phi_1 / hh - 1.0;
        let b_h = h_phi_1;

        let xt = last_sample * (self.sigmas[t] / self.sigmas[s0])
            - m0.clone() * (self.alphas[t] * h_phi_1);
        let d1_t = mt - m0.clone();
        let d1_s = match history.previous() {
            Some((si, mi)) => {
                let rk = (self.lambdas[si] - self.lambdas[s0]) / h;
                let d1 = (mi.clone() - m0.clone()) * (1.0 / rk);
                let b0 = h_phi_k / b_h;
                let b1 = (h_phi_k / hh - 0.5) * 2.0 / b_h;
                let rho_c0 = (b0 - b1) / (1.0 - rk);
                let rho_c1 = b0 - rho_c0;
                d1 * rho_c0 + d1_t * rho_c1
            }
            None => d1_t * 0.5,
        };
        xt - d1_s * (self.alphas[t] * b_h)
    }
}

impl<B: Backend> UpdateRule<B> for UniPc<B> {
    fn name(&self) -> &'static str {
        "unipc"
    }

    fn uses_guidance(&self) -> bool {
        true
    }

    fn preview_policy(&self) -> PreviewPolicy {
        self.config.preview
    }

    fn plan(
        &mut self,
        discretization: &dyn Discretization,
        sampling: &SamplingConfig,
        _start: &StepBoundary,
        _end: &StepBoundary,
    ) -> Timeline {
        let schedule = NoiseSchedule::new(discretization, sampling);
        let alphas_cumprod: Vec<f64> = (0..=sampling.steps)
            .map(|step| schedule.step_alpha_cumprod(step))
            .collect();
        let timesteps = alphas_cumprod[..sampling.steps]
            .iter()
            .map(|&alpha| discretization.timestep(alpha))
            .collect();

        self.alphas = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        self.sigmas = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        self.lambdas = self
            .alphas
            .iter()
            .zip(&self.sigmas)
            .map(|(a, s)| a.ln() - s.ln())
            .collect();
        self.last_sample = None;

        Timeline::new(discretization, timesteps, alphas_cumprod)
    }

    fn advance(
        &mut self,
        denoised: Tensor<B, 4>,
        latent: Tensor<B, 4>,
        ctx: &StepContext,
        history: &mut OutputHistory<Tensor<B, 4>>,
        _noise: &mut dyn NoiseSource<B>,
    ) -> Tensor<B, 4> {
        let i = ctx.index;
        let mut latent = latent;
        if let Some(last_sample) = self.last_sample.take() {
            if self.config.use_corrector {
                latent = self.correct(denoised.clone(), i, last_sample, history);
            }
        }
        history.push(i, denoised.clone());

        if ctx.is_final() {
            return denoised;
        }
        self.last_sample = Some(latent.clone());
        self.predict(i + 1, latent, history)
    }
}
