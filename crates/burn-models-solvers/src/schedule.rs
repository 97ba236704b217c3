//! Noise schedules for diffusion solvers
//!
//! A [`Discretization`] describes the training-time noise process as a
//! table of cumulative alphas over `T` discrete timesteps. A
//! [`NoiseSchedule`] samples that process at `steps + 1` grid points for one
//! inference configuration.
//!
//! Grid positions run from the clean end of the schedule (position 0) to the
//! noisiest point (position `steps`), so alpha strictly decreases with
//! position. Sampling walks the grid backwards: step `i` starts at position
//! `steps - i`.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{invalid, SamplerError};

// ============================================================================
// Model Objective (epsilon vs v-prediction vs EDM)
// ============================================================================

/// What the noise-prediction model was trained to output
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Model predicts the noise added to the sample (SD 1.x, SDXL)
    #[default]
    Epsilon,
    /// Model predicts the velocity v = sqrt(alpha) * eps - sqrt(1 - alpha) * x0 (SD 2.x)
    V,
    /// EDM preconditioned output with the given data standard deviation
    Edm { sigma_data: f64 },
    /// u-parameterized output. The conversion to a clean sample has not been
    /// verified, so solvers refuse it instead of guessing.
    U,
}

impl Objective {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Objective::Epsilon => "epsilon",
            Objective::V => "v",
            Objective::Edm { .. } => "edm",
            Objective::U => "u",
        }
    }

    /// Whether solvers have a verified conversion for this objective
    pub fn is_supported(&self) -> bool {
        !matches!(self, Objective::U)
    }

    /// Convert raw model output to the predicted fully-denoised sample
    ///
    /// - epsilon: x0 = (x - sqrt(1 - a) * eps) / sqrt(a)
    /// - v:       x0 = sqrt(a) * x - sqrt(1 - a) * v
    /// - edm:     x0 = sd^2 / sqrt(s^2 + sd^2) * x + s * sd / sqrt(s^2 + sd^2) * out
    ///
    /// Returns `None` for [`Objective::U`].
    pub fn predicted_original<B: Backend>(
        &self,
        sample: Tensor<B, 4>,
        model_output: Tensor<B, 4>,
        alpha_cumprod: f64,
    ) -> Option<Tensor<B, 4>> {
        let sqrt_alpha = alpha_cumprod.sqrt();
        let sqrt_one_minus_alpha = (1.0 - alpha_cumprod).sqrt();
        match *self {
            Objective::Epsilon => Some(
                sample * (1.0 / sqrt_alpha) - model_output * (sqrt_one_minus_alpha / sqrt_alpha),
            ),
            Objective::V => Some(sample * sqrt_alpha - model_output * sqrt_one_minus_alpha),
            Objective::Edm { sigma_data } => {
                let sigma = sigma_from_alpha(alpha_cumprod);
                let sigma_data2 = sigma_data * sigma_data;
                let norm = (sigma * sigma + sigma_data2).sqrt();
                Some(sample * (sigma_data2 / norm) + model_output * (sigma * sigma_data / norm))
            }
            Objective::U => None,
        }
    }
}

/// Which scalar the model is conditioned on each step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditioningMode {
    /// Discretized training timestep (0..T-1)
    #[default]
    Timestep,
    /// Continuous noise level derived from alpha
    Noise,
}

/// sigma = sqrt((1 - alpha) / alpha)
pub fn sigma_from_alpha(alpha_cumprod: f64) -> f64 {
    ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
}

/// Time-dilate a cumulative alpha by scaling its sigma by `shift`
///
/// sigma' = shift * sigma, i.e. a' = a / (a + shift^2 * (1 - a)).
/// `shift == 1` is the identity.
pub fn shift_alpha(alpha_cumprod: f64, shift: f64) -> f64 {
    if shift == 1.0 {
        return alpha_cumprod;
    }
    alpha_cumprod / (alpha_cumprod + shift * shift * (1.0 - alpha_cumprod))
}

// ============================================================================
// Discretization
// ============================================================================

/// Training-time noise process
pub trait Discretization {
    /// Number of training timesteps `T`
    fn timesteps(&self) -> f64;

    /// What the model trained on this process outputs
    fn objective(&self) -> Objective;

    /// Cumulative alpha at a continuous timestep in `[0, T - 1]`
    fn alpha_cumprod(&self, timestep: f64) -> f64;

    /// Continuous timestep for a cumulative alpha; inverse of [`Self::alpha_cumprod`]
    fn timestep(&self, alpha_cumprod: f64) -> f64;

    /// Continuous noise level for a cumulative alpha
    fn noise(&self, alpha_cumprod: f64) -> f64 {
        sigma_from_alpha(alpha_cumprod)
    }

    /// Cumulative alphas at the `steps + 1` inference grid points
    ///
    /// Grid point `k` sits at timestep `(T - 1) * k / steps`, then `shift` is
    /// applied. Index 0 is the clean end.
    fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
        let last = self.timesteps() - 1.0;
        (0..=steps)
            .map(|k| {
                let t = last * k as f64 / steps.max(1) as f64;
                shift_alpha(self.alpha_cumprod(t), shift)
            })
            .collect()
    }
}

/// Offset cosine schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Number of training timesteps
    pub num_train_steps: usize,
    /// Signal angle fraction at t = 0
    pub min_signal_rate: f64,
    /// Signal angle fraction at t = T
    pub max_signal_rate: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_steps: 1000,
            min_signal_rate: 0.02,
            max_signal_rate: 0.95,
        }
    }
}

/// Table-backed discretization over the training timesteps
///
/// Lookups between integer timesteps interpolate linearly in log-alpha, which
/// makes [`Discretization::timestep`] an exact inverse of
/// [`Discretization::alpha_cumprod`] inside the table range.
#[derive(Debug, Clone)]
pub struct TrainingSchedule {
    /// Cumulative product of alphas, strictly decreasing in t
    alphas_cumprod: Vec<f64>,
    objective: Objective,
}

impl TrainingSchedule {
    /// Linear beta schedule
    pub fn linear(
        num_steps: usize,
        beta_start: f64,
        beta_end: f64,
        objective: Objective,
    ) -> Result<Self, SamplerError> {
        check_training_steps(num_steps)?;
        let betas = (0..num_steps).map(|i| {
            let t = i as f64 / (num_steps - 1).max(1) as f64;
            beta_start + t * (beta_end - beta_start)
        });
        Ok(Self::from_betas(betas, objective))
    }

    /// Scaled linear schedule: betas linear in sqrt space (Stable Diffusion)
    pub fn scaled_linear(
        num_steps: usize,
        beta_start: f64,
        beta_end: f64,
        objective: Objective,
    ) -> Result<Self, SamplerError> {
        check_training_steps(num_steps)?;
        Ok(Self::scaled_linear_table(num_steps, beta_start, beta_end, objective))
    }

    fn scaled_linear_table(
        num_steps: usize,
        beta_start: f64,
        beta_end: f64,
        objective: Objective,
    ) -> Self {
        let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
        let betas = (0..num_steps).map(|i| {
            let t = i as f64 / (num_steps - 1).max(1) as f64;
            (start + t * (end - start)).powi(2)
        });
        Self::from_betas(betas, objective)
    }

    /// Offset cosine schedule
    pub fn cosine(config: &ScheduleConfig, objective: Objective) -> Result<Self, SamplerError> {
        let n = config.num_train_steps;
        check_training_steps(n)?;
        let alphas_cumprod = (0..n)
            .map(|i| {
                let t = (i + 1) as f64 / n as f64;
                let signal_rate =
                    (1.0 - t) * config.min_signal_rate + t * config.max_signal_rate;
                let angle = signal_rate * std::f64::consts::FRAC_PI_2;
                angle.cos().powi(2)
            })
            .collect();
        Ok(Self {
            alphas_cumprod,
            objective,
        })
    }

    fn from_betas(betas: impl Iterator<Item = f64>, objective: Objective) -> Self {
        let mut cumprod = 1.0f64;
        let alphas_cumprod = betas
            .map(|beta| {
                cumprod *= 1.0 - beta;
                cumprod
            })
            .collect();
        Self {
            alphas_cumprod,
            objective,
        }
    }

    /// SD 1.x: scaled linear betas, epsilon objective
    pub fn sd1x() -> Self {
        Self::scaled_linear_table(1000, 0.00085, 0.012, Objective::Epsilon)
    }

    /// SD 2.x: same betas as SD 1.x, v objective
    pub fn sd2x() -> Self {
        Self::scaled_linear_table(1000, 0.00085, 0.012, Objective::V)
    }

    /// SDXL: same betas as SD 1.x, epsilon objective
    pub fn sdxl() -> Self {
        Self::scaled_linear_table(1000, 0.00085, 0.012, Objective::Epsilon)
    }

    /// Replace the objective, keeping the table
    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    /// The raw training table
    pub fn table(&self) -> &[f64] {
        &self.alphas_cumprod
    }
}

/// Every table needs at least one training timestep
fn check_training_steps(num_steps: usize) -> Result<(), SamplerError> {
    if num_steps == 0 {
        return Err(invalid("training schedule needs at least one timestep"));
    }
    Ok(())
}

impl Discretization for TrainingSchedule {
    fn timesteps(&self) -> f64 {
        self.alphas_cumprod.len() as f64
    }

    fn objective(&self) -> Objective {
        self.objective
    }

    fn alpha_cumprod(&self, timestep: f64) -> f64 {
        let table = &self.alphas_cumprod;
        let last = table.len() - 1;
        let t = timestep.clamp(0.0, last as f64);
        let lo = t.floor() as usize;
        let hi = (lo + 1).min(last);
        let frac = t - lo as f64;
        (table[lo].ln() * (1.0 - frac) + table[hi].ln() * frac).exp()
    }

    fn timestep(&self, alpha_cumprod: f64) -> f64 {
        let table = &self.alphas_cumprod;
        let last = table.len() - 1;
        if alpha_cumprod >= table[0] {
            return 0.0;
        }
        if alpha_cumprod <= table[last] {
            return last as f64;
        }
        // Table is decreasing: first index with alpha below the target
        let hi = table.partition_point(|&a| a >= alpha_cumprod);
        let lo = hi - 1;
        let (log_lo, log_hi) = (table[lo].ln(), table[hi].ln());
        lo as f64 + (log_lo - alpha_cumprod.ln()) / (log_lo - log_hi)
    }
}

// ============================================================================
// Inference Schedule
// ============================================================================

/// Inference configuration shared by every solver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of inference steps
    pub steps: usize,
    /// Time dilation applied to the grid (1.0 = none)
    pub shift: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            steps: 20,
            shift: 1.0,
        }
    }
}

/// A possibly fractional sampling step used as a start or end bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepBoundary {
    /// Integral step (rounded down)
    pub step: usize,
    /// Exact, possibly fractional, step
    pub exact: f64,
}

impl StepBoundary {
    /// A whole-step boundary
    pub fn whole(step: usize) -> Self {
        Self {
            step,
            exact: step as f64,
        }
    }

    /// A boundary at a fractional step
    pub fn fractional(exact: f64) -> Self {
        let exact = exact.max(0.0);
        Self {
            step: exact.floor() as usize,
            exact,
        }
    }

    /// Whether this boundary falls between two grid points
    pub fn is_fractional(&self) -> bool {
        (self.step as f64 - self.exact).abs() >= 1e-4
    }
}

/// Where a denoising strength lands on the schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrengthPosition {
    /// Timestep at which sampling starts
    pub timestep: f64,
    /// Fractional grid position (0 = clean end, `steps` = noisiest)
    pub position: f64,
    /// First sampling step (rounded down) and its exact value
    pub start_step: StepBoundary,
    /// First sampling step rounded up
    pub rounded_up_start_step: usize,
}

/// Cumulative alphas at the inference grid for one configuration
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Indexed by grid position; strictly decreasing
    alphas_cumprod: Vec<f64>,
    steps: usize,
    timesteps: f64,
}

impl NoiseSchedule {
    /// Build the grid for `config` from a discretization
    pub fn new<D: Discretization + ?Sized>(discretization: &D, config: &SamplingConfig) -> Self {
        Self {
            alphas_cumprod: discretization.alphas_cumprod(config.steps, config.shift),
            steps: config.steps,
            timesteps: discretization.timesteps(),
        }
    }

    /// Number of inference steps
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Number of grid points (`steps + 1`)
    pub fn len(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Whether the schedule has no grid points
    pub fn is_empty(&self) -> bool {
        self.alphas_cumprod.is_empty()
    }

    /// Number of training timesteps of the underlying discretization
    pub fn training_timesteps(&self) -> f64 {
        self.timesteps
    }

    /// Cumulative alphas by grid position
    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Cumulative alpha at a grid position
    pub fn alpha_cumprod(&self, position: usize) -> f64 {
        self.alphas_cumprod[position.min(self.steps)]
    }

    /// Cumulative alpha at the start of sampling step `step`
    ///
    /// `step == steps` is the terminal clean point.
    pub fn step_alpha_cumprod(&self, step: usize) -> f64 {
        self.alpha_cumprod(self.steps - step.min(self.steps))
    }

    /// Noise level sigma at a grid position
    pub fn noise_level(&self, position: usize) -> f64 {
        sigma_from_alpha(self.alpha_cumprod(position))
    }

    /// Log signal-to-noise ratio ln(sqrt(a)) - ln(sqrt(1 - a)) at a grid position
    pub fn log_snr(&self, position: usize) -> f64 {
        let alpha = self.alpha_cumprod(position);
        0.5 * (alpha.ln() - (1.0 - alpha).ln())
    }

    /// Map a denoising strength in `[0, 1]` to a schedule position
    ///
    /// Strength 0 lands on the clean end (position 0) and strength 1 on the
    /// noisiest grid point. Strengths that fall between grid points produce a
    /// fractional start step.
    pub fn timestep_for_strength<D: Discretization + ?Sized>(
        &self,
        discretization: &D,
        strength: f64,
    ) -> StrengthPosition {
        let target = strength.clamp(0.0, 1.0) * discretization.timesteps();
        let mut previous = discretization.timesteps();
        for step in 0..=self.steps {
            let timestep = discretization.timestep(self.step_alpha_cumprod(step));
            if target >= timestep {
                if step == 0 {
                    return self.position_at(timestep, StepBoundary::whole(0), 0);
                }
                if target <= timestep + 1e-3 {
                    return self.position_at(target, StepBoundary::whole(step), step);
                }
                let exact = (step - 1) as f64 + (target - previous) / (timestep - previous);
                return self.position_at(
                    target,
                    StepBoundary {
                        step: step - 1,
                        exact,
                    },
                    step,
                );
            }
            previous = timestep;
        }
        let clean = discretization.timestep(self.step_alpha_cumprod(self.steps));
        self.position_at(clean, StepBoundary::whole(self.steps), self.steps)
    }

    fn position_at(
        &self,
        timestep: f64,
        start_step: StepBoundary,
        rounded_up_start_step: usize,
    ) -> StrengthPosition {
        StrengthPosition {
            timestep,
            position: self.steps as f64 - start_step.exact,
            start_step,
            rounded_up_start_step,
        }
    }

    /// sqrt(alpha) at a possibly fractional sampling step
    ///
    /// Used by callers to mix externally supplied noise into a known sample.
    pub fn sample_scale_factor(&self, step: f64) -> f64 {
        self.rounded_step_alpha(step).sqrt()
    }

    /// sqrt(1 - alpha) at a possibly fractional sampling step
    pub fn noise_scale_factor(&self, step: f64) -> f64 {
        (1.0 - self.rounded_step_alpha(step)).sqrt()
    }

    fn rounded_step_alpha(&self, step: f64) -> f64 {
        let step = step.round().clamp(0.0, self.steps as f64) as usize;
        self.step_alpha_cumprod(step)
    }

    /// Timestep for a boundary step under the partial-step policy
    ///
    /// Whole boundaries keep the grid timestep; fractional ones are
    /// interpolated as `T - exact * T / steps`, clamped to `T - 1`.
    pub fn boundary_timestep(&self, boundary: &StepBoundary, grid_timestep: f64) -> f64 {
        if !boundary.is_fractional() {
            return grid_timestep;
        }
        let t = self.timesteps;
        (t - boundary.exact * t / self.steps as f64)
            .floor()
            .min(t - 1.0)
    }
}
