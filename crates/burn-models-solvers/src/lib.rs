pub mod error;
pub mod schedule;
pub mod noise;
pub mod model;
pub mod conditioning;
pub mod guidance;
pub mod blur;
pub mod history;
pub mod rule;
pub mod unipc;
pub mod lcm;
pub mod inpaint;
pub mod preview;
pub mod sampler;

pub use error::{NanStage, SamplerError};
pub use schedule::{
    Discretization, NoiseSchedule, ScheduleConfig, TrainingSchedule, Objective, ConditioningMode,
    SamplingConfig, StepBoundary, StrengthPosition, shift_alpha, sigma_from_alpha,
};
pub use noise::{NoiseSource, SeededNoise};
pub use model::{
    Codec, WeightStore, MemoryWeightStore, ModelInput, DenoisingModel, ControlModel,
    ControlInjection, Refiner, ActiveModel, SizeConditioning,
};
pub use conditioning::{TextConditioning, ConditioningState};
pub use guidance::{
    GuidanceCompositor, GuidanceLayout, GuidanceBatch, GuidanceScales, SamplerModifier,
    SideInputs, apply_guidance, sharpness_weight,
};
pub use blur::GaussianBlur;
pub use history::{OutputHistory, HISTORY_CAPACITY};
pub use rule::{UpdateRule, Timeline, StepContext};
pub use unipc::{UniPc, UniPcConfig};
pub use lcm::{Lcm, LcmConfig, boundary_scalings, guidance_scale_embedding, lcm_timesteps};
pub use inpaint::InpaintCompositor;
pub use preview::{PreviewPolicy, DebugConfig, LatentFormat, latent_to_preview, tensor_stats};
pub use sampler::{
    Sampler, SamplerConfig, SamplerState, SampleRequest, SamplerOutput, UniPcSampler, LcmSampler,
};
