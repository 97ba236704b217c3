//! Sampler error taxonomy

use thiserror::Error;

/// Where a NaN was observed during sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NanStage {
    /// The host-side preview of the previous step's prediction
    Preview,
    /// The finished latent after the last step
    FinalLatent,
}

impl std::fmt::Display for NanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NanStage::Preview => write!(f, "preview"),
            NanStage::FinalLatent => write!(f, "final latent"),
        }
    }
}

/// Errors returned by a sampling call
///
/// `Cancelled` is user-driven and expected. `NaN` is a terminal numerical
/// divergence. `InvalidRequest` means the caller assembled an inconsistent
/// request; retrying the same request will fail the same way.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampling cancelled at step {step}")]
    Cancelled { step: usize },

    #[error("NaN detected in {stage} at step {step}")]
    NaN { step: usize, stage: NanStage },

    #[error("invalid sampling request: {0}")]
    InvalidRequest(String),

    #[error("model objective `{objective}` is not supported by the {solver} solver")]
    UnsupportedObjective {
        objective: &'static str,
        solver: &'static str,
    },

    #[error("model compilation failed: {0}")]
    Compile(String),

    #[error("tensor readback failed: {0}")]
    TensorData(String),
}

impl SamplerError {
    /// Whether the error came from the feedback callback declining to continue
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SamplerError::Cancelled { .. })
    }

    /// Whether the error is a numerical divergence
    pub fn is_nan(&self) -> bool {
        matches!(self, SamplerError::NaN { .. })
    }
}

/// Shorthand for precondition failures
pub(crate) fn invalid(message: impl Into<String>) -> SamplerError {
    SamplerError::InvalidRequest(message.into())
}
