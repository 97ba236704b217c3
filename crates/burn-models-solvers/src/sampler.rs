//! Step state machine shared by every update rule
//!
//! A [`Sampler`] owns a discretization and an update-rule template. Each
//! [`Sampler::sample`] call clones the rule, plans a timeline and walks the
//! steps `[start, end)`: preview and feedback, refiner handoff, one guided
//! model call, guidance composition, the rule's update and, for masked
//! sampling, the known-region blend.

use std::marker::PhantomData;
use std::sync::Arc;

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, trace, warn};

use crate::conditioning::{validate_tensors, ConditioningState, TextConditioning};
use crate::error::{invalid, NanStage, SamplerError};
use crate::guidance::{
    GuidanceCompositor, GuidanceLayout, GuidanceScales, SamplerModifier, SideInputs,
};
use crate::history::OutputHistory;
use crate::inpaint::InpaintCompositor;
use crate::lcm::Lcm;
use crate::model::{
    ActiveModel, ControlInjection, DenoisingModel, ModelInput, Refiner, SizeConditioning,
    WeightStore,
};
use crate::noise::NoiseSource;
use crate::preview::{
    contains_nan, latent_to_preview, read_back, tensor_has_nan, tensor_stats, DebugConfig,
    LatentFormat, PreviewPolicy,
};
use crate::rule::{StepContext, Timeline, UpdateRule};
use crate::schedule::{
    ConditioningMode, Discretization, NoiseSchedule, Objective, SamplingConfig, StepBoundary,
    StrengthPosition,
};
use crate::unipc::UniPc;

/// Sampler configuration fixed at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Side inputs the model expects
    pub modifier: SamplerModifier,
    /// Batch guidance branches when the scales call for it
    pub classifier_free_guidance: bool,
    /// Scalar the model is conditioned on
    pub conditioning: ConditioningMode,
    /// Preview cadence; `None` uses the update rule's default
    pub preview: Option<PreviewPolicy>,
    /// Project previews to RGB instead of handing back raw latents
    pub preview_format: Option<LatentFormat>,
    pub debug: DebugConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            modifier: SamplerModifier::None,
            classifier_free_guidance: true,
            conditioning: ConditioningMode::Timestep,
            preview: None,
            preview_format: None,
            debug: DebugConfig::default(),
        }
    }
}

/// Lifecycle of one sampling call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Initialized,
    Running { step: usize },
    Completed,
    Cancelled { step: usize },
    Failed { step: usize },
}

impl SamplerState {
    fn advance(&mut self, next: SamplerState) {
        match next {
            SamplerState::Running { .. } => trace!(from = ?*self, to = ?next, "sampler state"),
            _ => debug!(from = ?*self, to = ?next, "sampler state"),
        }
        *self = next;
    }
}

/// Joins the device stream when the sampling call returns
struct StreamJoin<B: Backend> {
    device: B::Device,
}

impl<B: Backend> Drop for StreamJoin<B> {
    fn drop(&mut self) {
        B::sync(&self.device);
    }
}

/// Everything one sampling call consumes
pub struct SampleRequest<B: Backend, M> {
    /// Initial latent, NHWC
    pub latent: Tensor<B, 4>,
    pub model: M,
    pub weights: Arc<dyn WeightStore>,
    /// Clean latent of the known region for masked sampling
    pub known_sample: Option<Tensor<B, 4>>,
    /// Masked image (inpainting) or reference image (editing)
    pub masked_image: Option<Tensor<B, 4>>,
    pub depth_image: Option<Tensor<B, 4>>,
    /// 1 where the latent is generated
    pub mask: Option<Tensor<B, 4>>,
    /// 1 where the known sample is kept
    pub neg_mask: Option<Tensor<B, 4>>,
    pub conditioning: TextConditioning<B>,
    pub controls: Vec<ControlInjection<B>>,
    pub guidance: GuidanceScales,
    pub start_step: StepBoundary,
    pub end_step: StepBoundary,
    pub size: SizeConditioning,
    pub refiner: Option<Refiner<B, M>>,
    pub sharpness: f32,
    pub sampling: SamplingConfig,
}

impl<B: Backend, M> SampleRequest<B, M> {
    /// A full-schedule request with default guidance and no side inputs
    pub fn new(
        latent: Tensor<B, 4>,
        model: M,
        weights: Arc<dyn WeightStore>,
        conditioning: TextConditioning<B>,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            latent,
            model,
            weights,
            known_sample: None,
            masked_image: None,
            depth_image: None,
            mask: None,
            neg_mask: None,
            conditioning,
            controls: Vec::new(),
            guidance: GuidanceScales::default(),
            start_step: StepBoundary::whole(0),
            end_step: StepBoundary::whole(sampling.steps),
            size: SizeConditioning::default(),
            refiner: None,
            sharpness: 0.0,
            sampling,
        }
    }

    pub fn with_guidance(mut self, guidance: GuidanceScales) -> Self {
        self.guidance = guidance;
        self
    }

    /// Restrict the call to `[start, end)`
    pub fn with_steps(mut self, start: StepBoundary, end: StepBoundary) -> Self {
        self.start_step = start;
        self.end_step = end;
        self
    }

    /// Keep `known` where `neg_mask` is set
    pub fn with_known_sample(
        mut self,
        known: Tensor<B, 4>,
        mask: Tensor<B, 4>,
        neg_mask: Tensor<B, 4>,
    ) -> Self {
        self.known_sample = Some(known);
        self.mask = Some(mask);
        self.neg_mask = Some(neg_mask);
        self
    }

    pub fn with_mask(mut self, mask: Tensor<B, 4>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_masked_image(mut self, image: Tensor<B, 4>) -> Self {
        self.masked_image = Some(image);
        self
    }

    pub fn with_depth_image(mut self, depth: Tensor<B, 4>) -> Self {
        self.depth_image = Some(depth);
        self
    }

    pub fn with_control(mut self, control: ControlInjection<B>) -> Self {
        self.controls.push(control);
        self
    }

    pub fn with_size(mut self, size: SizeConditioning) -> Self {
        self.size = size;
        self
    }

    pub fn with_refiner(mut self, refiner: Refiner<B, M>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn with_sharpness(mut self, sharpness: f32) -> Self {
        self.sharpness = sharpness;
        self
    }
}

/// Result of a completed sampling call
#[derive(Debug)]
pub struct SamplerOutput<B: Backend, M> {
    pub latent: Tensor<B, 4>,
    /// Every model that was active, base model first
    pub models: Vec<M>,
}

/// Diffusion sampler over a discretization `D` with update rule `R`
#[derive(Debug, Clone)]
pub struct Sampler<B: Backend, D, R> {
    discretization: D,
    rule: R,
    config: SamplerConfig,
    _backend: PhantomData<B>,
}

/// Multistep predictor-corrector sampler
pub type UniPcSampler<B, D> = Sampler<B, D, UniPc<B>>;

/// Consistency-model sampler
pub type LcmSampler<B, D> = Sampler<B, D, Lcm<B>>;

impl<B: Backend, D: Discretization> Sampler<B, D, UniPc<B>> {
    pub fn unipc(discretization: D, config: SamplerConfig) -> Self {
        Self::new(discretization, UniPc::default(), config)
    }
}

impl<B: Backend, D: Discretization> Sampler<B, D, Lcm<B>> {
    pub fn lcm(discretization: D, config: SamplerConfig) -> Self {
        Self::new(discretization, Lcm::default(), config)
    }
}

impl<B: Backend, D: Discretization, R: UpdateRule<B>> Sampler<B, D, R> {
    pub fn new(discretization: D, rule: R, config: SamplerConfig) -> Self {
        Self {
            discretization,
            rule,
            config,
            _backend: PhantomData,
        }
    }

    pub fn discretization(&self) -> &D {
        &self.discretization
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Where a denoising strength starts on the schedule
    pub fn timestep_for_strength(
        &self,
        strength: f64,
        sampling: &SamplingConfig,
    ) -> StrengthPosition {
        NoiseSchedule::new(&self.discretization, sampling)
            .timestep_for_strength(&self.discretization, strength)
    }

    /// sqrt(alpha) at a possibly fractional step
    pub fn sample_scale_factor(&self, step: f64, sampling: &SamplingConfig) -> f64 {
        NoiseSchedule::new(&self.discretization, sampling).sample_scale_factor(step)
    }

    /// sqrt(1 - alpha) at a possibly fractional step
    pub fn noise_scale_factor(&self, step: f64, sampling: &SamplingConfig) -> f64 {
        NoiseSchedule::new(&self.discretization, sampling).noise_scale_factor(step)
    }

    /// Run one sampling call
    ///
    /// `feedback` receives the step offset from the start step and, on
    /// preview steps, the host copy of the preview. Returning `false` cancels
    /// the call before the next model evaluation.
    pub fn sample<M, F>(
        &self,
        request: SampleRequest<B, M>,
        noise: &mut dyn NoiseSource<B>,
        mut feedback: F,
    ) -> Result<SamplerOutput<B, M>, SamplerError>
    where
        M: DenoisingModel<B>,
        F: FnMut(usize, Option<&TensorData>) -> bool,
    {
        let span = debug_span!(
            "sample",
            solver = self.rule.name(),
            steps = request.sampling.steps
        );
        let _enter = span.enter();
        let _join = StreamJoin::<B> {
            device: request.latent.device(),
        };

        let objective = self.discretization.objective();
        if !objective.is_supported() {
            return Err(SamplerError::UnsupportedObjective {
                objective: objective.name(),
                solver: self.rule.name(),
            });
        }

        let SampleRequest {
            latent,
            model,
            weights,
            known_sample,
            masked_image,
            depth_image,
            mask,
            neg_mask,
            conditioning,
            controls,
            guidance,
            start_step,
            end_step,
            size,
            refiner,
            sharpness,
            sampling,
        } = request;

        let steps = sampling.steps;
        if steps == 0 {
            return Err(invalid("steps must be at least 1"));
        }
        if end_step.step > steps || start_step.step > end_step.step {
            return Err(invalid(format!(
                "step range [{}, {}) does not fit {steps} steps",
                start_step.exact, end_step.exact
            )));
        }
        let shape = latent.dims();
        let [batch, ..] = shape;
        conditioning.validate(batch)?;
        if let Some(tensors) = refiner.as_ref().and_then(|r| r.conditioning.as_ref()) {
            validate_tensors(tensors, batch)?;
        }

        let device = latent.device();
        let modifier = self.config.modifier;
        let mut rule = self.rule.clone();
        let layout = GuidanceLayout::new(
            modifier,
            self.config.classifier_free_guidance,
            rule.uses_guidance(),
            &guidance,
            shape,
        );

        let side_mask = match (modifier, &mask) {
            (SamplerModifier::Inpainting, Some(mask)) => {
                let [b, h, w, _] = mask.dims();
                Some(mask.clone().slice([0..b, 0..h, 0..w, 0..1]))
            }
            _ => None,
        };
        let compositor = GuidanceCompositor::new(
            layout,
            SideInputs {
                mask: side_mask,
                masked_image,
                depth_image,
            },
            guidance,
            sharpness,
            self.discretization.timesteps(),
            &device,
        )?;

        let inpaint = match (known_sample, mask, neg_mask) {
            (Some(known), Some(mask), Some(neg_mask)) => {
                Some(InpaintCompositor::new(known, mask, neg_mask, shape)?)
            }
            (None, _, Some(_)) => {
                return Err(invalid("neg_mask given without a known sample"));
            }
            (None, Some(_), None) if modifier != SamplerModifier::Inpainting => {
                return Err(invalid("mask given without a known sample"));
            }
            (Some(_), Some(_), None) | (Some(_), None, Some(_)) => {
                return Err(invalid("mask and neg_mask must be given together"));
            }
            _ => None,
        };

        let start = start_step.step;
        let end = end_step.step;
        if start == end {
            debug!(step = start, "empty step range");
            return Ok(SamplerOutput {
                latent,
                models: vec![model],
            });
        }

        let timeline = rule.plan(&self.discretization, &sampling, &start_step, &end_step);
        let scalars: Vec<f64> = (start..end)
            .map(|i| conditioning_scalar(self.config.conditioning, &timeline.context(i, end)))
            .collect();
        let text = conditioning.for_layout(&layout);
        let conditions = ConditioningState::new(text, &model, &size, &scalars, start, batch);
        rule.prepare(weights.as_ref(), guidance.text, layout.model_batch(), &device)?;

        let kick_in = refiner
            .as_ref()
            .map_or(-1.0, |r| r.kick_in(self.discretization.timesteps()));
        let policy = self.config.preview.unwrap_or_else(|| rule.preview_policy());
        let size_embedding = size_embedding(&size, false, &layout, &device);

        let mut run = StepLoop {
            objective,
            rule,
            timeline,
            layout,
            compositor,
            inpaint,
            conditions,
            scalars,
            size,
            size_embedding,
            controls,
            active: ActiveModel::new(model),
            weights,
            refiner,
            kick_in,
            history: OutputHistory::new(),
            policy,
            conditioning_mode: self.config.conditioning,
            preview_format: self.config.preview_format,
            debug: self.config.debug,
            start,
            end,
            steps,
        };

        let mut state = SamplerState::Initialized;
        let outcome = run.execute(latent, noise, &mut feedback, &mut state);
        match &outcome {
            Ok(_) => state.advance(SamplerState::Completed),
            Err(SamplerError::Cancelled { step }) => {
                state.advance(SamplerState::Cancelled { step: *step })
            }
            Err(err) => {
                let step = match state {
                    SamplerState::Running { step } => step,
                    _ => start,
                };
                warn!(step, error = %err, "sampling failed");
                state.advance(SamplerState::Failed { step });
            }
        }

        let latent = outcome?;
        Ok(SamplerOutput {
            latent,
            models: run.active.into_models(),
        })
    }
}

fn conditioning_scalar(mode: ConditioningMode, ctx: &StepContext) -> f64 {
    match mode {
        ConditioningMode::Timestep => ctx.timestep,
        ConditioningMode::Noise => ctx.noise_level,
    }
}

/// Size vectors stacked per guidance branch, unconditional rows negative
///
/// Base models take the 6 x 256 geometry vector, refiners the 5 x 256 vector
/// with the aesthetic score.
fn size_embedding<B: Backend>(
    size: &SizeConditioning,
    refiner: bool,
    layout: &GuidanceLayout,
    device: &B::Device,
) -> Tensor<B, 2> {
    let branch = |negative: bool| {
        let vector = if refiner {
            size.refiner_embedding::<B>(negative, device)
        } else {
            size.embedding::<B>(negative, device)
        };
        vector.unsqueeze::<2>().repeat_dim(0, layout.batch_size)
    };
    let branches = match layout.cfg_channels {
        1 => vec![branch(false)],
        2 => vec![branch(true), branch(false)],
        _ => vec![branch(true), branch(false), branch(true)],
    };
    Tensor::cat(branches, 0)
}

/// Mutable state of one call's step loop
struct StepLoop<B: Backend, M, R> {
    objective: Objective,
    rule: R,
    timeline: Timeline,
    layout: GuidanceLayout,
    compositor: GuidanceCompositor<B>,
    inpaint: Option<InpaintCompositor<B>>,
    conditions: ConditioningState<B>,
    /// Model conditioning scalar per step of the call
    scalars: Vec<f64>,
    size: SizeConditioning,
    /// Per-row size vectors for the active model
    size_embedding: Tensor<B, 2>,
    controls: Vec<ControlInjection<B>>,
    active: ActiveModel<M>,
    weights: Arc<dyn WeightStore>,
    refiner: Option<Refiner<B, M>>,
    kick_in: f64,
    history: OutputHistory<Tensor<B, 4>>,
    policy: PreviewPolicy,
    conditioning_mode: ConditioningMode,
    preview_format: Option<LatentFormat>,
    debug: DebugConfig,
    start: usize,
    end: usize,
    steps: usize,
}

impl<B: Backend, M: DenoisingModel<B>, R: UpdateRule<B>> StepLoop<B, M, R> {
    fn execute<F>(
        &mut self,
        mut x: Tensor<B, 4>,
        noise: &mut dyn NoiseSource<B>,
        feedback: &mut F,
        state: &mut SamplerState,
    ) -> Result<Tensor<B, 4>, SamplerError>
    where
        F: FnMut(usize, Option<&TensorData>) -> bool,
    {
        let device = x.device();
        for i in self.start..self.end {
            state.advance(SamplerState::Running { step: i });

            let preview = if self.policy.should_preview(i, self.start, self.steps) {
                self.history.newest().map(|(_, p)| self.preview(p.clone()))
            } else {
                None
            };
            if self.policy.is_nan_check(i) {
                if let Some(data) = &preview {
                    if contains_nan(data)? {
                        warn!(step = i, "NaN in preview");
                        return Err(SamplerError::NaN {
                            step: i,
                            stage: NanStage::Preview,
                        });
                    }
                }
            }
            if !feedback(i - self.start, preview.as_ref()) {
                debug!(step = i, "cancelled by feedback");
                return Err(SamplerError::Cancelled { step: i });
            }

            let ctx = self.timeline.context(i, self.end);
            if ctx.timestep < self.kick_in {
                self.hand_off(i, ctx.timestep, self.layout.batch_size, &device);
                self.kick_in = -1.0;
            }

            let scalar = conditioning_scalar(self.conditioning_mode, &ctx);
            let rows = self.layout.model_batch();
            let batch = self.compositor.build(&x);
            let time_embedding = self
                .rule
                .adjust_time_embedding(self.active.get().time_embed(scalar, rows, &device));
            let conditions = self.conditions.for_step(self.active.get(), i, rows);
            let controls = self
                .controls
                .iter_mut()
                .map(|control| {
                    control.model.residuals(
                        i,
                        &batch.input,
                        &time_embedding,
                        &conditions,
                        &control.hints,
                        control.strength,
                    )
                })
                .collect();
            let text = self.conditions.text();
            let input = ModelInput {
                latent: batch.input,
                timestep: scalar,
                time_embedding,
                conditions,
                size_embedding: self.size_embedding.clone(),
                extra_projection: text.extra_projection.clone(),
                controls,
                token_length_uncond: text.token_length_uncond,
                token_length_cond: text.token_length_cond,
            };

            let model = self.active.get_mut();
            if !model.is_compiled() {
                debug!(step = i, "compiling model");
                model.compile(self.weights.as_ref(), &input)?;
            }
            let output = model.forward(input);

            let guided = self.compositor.compose(output, ctx.timestep);
            let denoised = self
                .objective
                .predicted_original(x.clone(), guided, ctx.alpha_cumprod)
                .ok_or(SamplerError::UnsupportedObjective {
                    objective: self.objective.name(),
                    solver: self.rule.name(),
                })?;
            x = self.rule.advance(denoised, x, &ctx, &mut self.history, noise);

            if !ctx.last {
                if let Some(inpaint) = &self.inpaint {
                    x = inpaint.apply(x, ctx.next_alpha_cumprod, noise);
                }
            }
            if self.debug.stats {
                debug!(step = i, timestep = ctx.timestep, stats = %tensor_stats(&x), "latent");
            }
            if ctx.last && tensor_has_nan(&x)? {
                warn!(step = i, "NaN in final latent");
                return Err(SamplerError::NaN {
                    step: i,
                    stage: NanStage::FinalLatent,
                });
            }
        }
        Ok(x)
    }

    /// Swap in the refiner for the rest of the schedule
    fn hand_off(&mut self, step: usize, timestep: f64, batch: usize, device: &B::Device) {
        let Some(refiner) = self.refiner.take() else {
            return;
        };
        let Refiner {
            model,
            weights,
            start: refiner_start,
            conditioning,
            is_consistency_model,
        } = refiner;

        self.active.replace(model);
        debug!(
            step,
            timestep,
            start = refiner_start,
            swaps = self.active.swaps(),
            "refiner takes over"
        );
        self.weights = weights;
        self.size_embedding = size_embedding(&self.size, true, &self.layout, device);
        let replacement = conditioning.map(|tensors| {
            let text = self.conditions.text();
            TextConditioning {
                tensors,
                token_length_uncond: text.token_length_uncond,
                token_length_cond: text.token_length_cond,
                extra_projection: None,
            }
            .for_layout(&self.layout)
            .tensors
        });
        let remaining = &self.scalars[step - self.start..];
        self.conditions
            .rebase(self.active.get(), replacement, &self.size, remaining, step, batch);
        self.rule.on_model_swap(is_consistency_model);
    }

    /// Host copy of a prediction, decoded for display
    fn preview(&self, prediction: Tensor<B, 4>) -> TensorData {
        let decoded = if self.rule.decodes_preview() {
            self.active.get().decode_preview(prediction)
        } else {
            prediction
        };
        match self.preview_format {
            Some(format) => read_back(latent_to_preview(decoded, format)),
            None => read_back(decoded),
        }
    }
}
