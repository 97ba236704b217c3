//! Collaborator interfaces consumed by the samplers
//!
//! The noise-prediction network, its weight store and any control networks
//! are opaque to the solvers. This module defines the seams they are called
//! through, plus the refiner descriptor and the active-model slot the step
//! loop swaps during a refiner handoff.

use std::collections::HashMap;
use std::sync::Arc;

use burn::prelude::*;
use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::SamplerError;

// ============================================================================
// Weight Store
// ============================================================================

/// Storage codec requested when reading a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Codec {
    /// Values as stored
    #[default]
    Plain,
    /// Values rounded through IEEE half precision
    Half,
}

/// Read-only tensor store shared by every step of a sampling call
pub trait WeightStore: Send + Sync {
    /// Names of all stored tensors
    fn keys(&self) -> Vec<String>;

    /// Read a tensor, or `None` when it is absent
    fn read(&self, name: &str, codec: Codec) -> Option<TensorData>;
}

/// In-memory [`WeightStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryWeightStore {
    tensors: HashMap<String, TensorData>,
}

impl MemoryWeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor, replacing any previous value under the same name
    pub fn insert(&mut self, name: impl Into<String>, data: TensorData) {
        self.tensors.insert(name.into(), data);
    }

    /// Builder form of [`Self::insert`]
    pub fn with(mut self, name: impl Into<String>, data: TensorData) -> Self {
        self.insert(name, data);
        self
    }

    /// Share the store
    pub fn shared(self) -> Arc<dyn WeightStore> {
        Arc::new(self)
    }
}

impl WeightStore for MemoryWeightStore {
    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tensors.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn read(&self, name: &str, codec: Codec) -> Option<TensorData> {
        let data = self.tensors.get(name)?;
        match codec {
            Codec::Plain => Some(data.clone()),
            Codec::Half => Some(data.clone().convert::<f16>()),
        }
    }
}

// ============================================================================
// Denoising Model
// ============================================================================

/// Everything the network sees for one forward call
#[derive(Debug, Clone)]
pub struct ModelInput<B: Backend> {
    /// Guidance batch, NHWC with `cfg_channels * batch` rows
    pub latent: Tensor<B, 4>,
    /// Conditioning scalar: discrete timestep or continuous noise level
    pub timestep: f64,
    /// [rows, width]
    pub time_embedding: Tensor<B, 2>,
    /// Per-step conditioning tensors, leading dimension = rows
    pub conditions: Vec<Tensor<B, 3>>,
    /// [rows, 6 * 256] geometry vector, [rows, 5 * 256] once a refiner is active
    pub size_embedding: Tensor<B, 2>,
    pub extra_projection: Option<Tensor<B, 3>>,
    /// Residuals from each injected control model
    pub controls: Vec<Vec<Tensor<B, 4>>>,
    pub token_length_uncond: usize,
    pub token_length_cond: usize,
}

/// Opaque noise-prediction network
///
/// Implementations own their compiled state. The sampler compiles a model
/// lazily before its first forward call.
pub trait DenoisingModel<B: Backend> {
    /// Whether [`Self::compile`] already ran
    fn is_compiled(&self) -> bool;

    /// Load weights and prepare for inputs shaped like `input`
    fn compile(&mut self, weights: &dyn WeightStore, input: &ModelInput<B>)
        -> Result<(), SamplerError>;

    /// Time embedding for a conditioning scalar, [batch, width]
    fn time_embed(&self, timestep: f64, batch: usize, device: &B::Device) -> Tensor<B, 2>;

    /// Conditioning precomputed once per run by a fixed encoder
    ///
    /// Returns `None` when the model has no fixed encoder, in which case the
    /// text conditioning is used as is.
    fn fixed_conditions(
        &self,
        _text: &[Tensor<B, 3>],
        _size: &SizeConditioning,
        _timesteps: &[f64],
        _batch: usize,
    ) -> Option<Vec<Tensor<B, 3>>> {
        None
    }

    /// Select the conditioning for the `index`-th step since the last
    /// fixed-encoder pass
    fn extract_conditions(
        &self,
        _index: usize,
        _batch: usize,
        conditions: &[Tensor<B, 3>],
    ) -> Vec<Tensor<B, 3>> {
        conditions.to_vec()
    }

    /// Predict for the whole guidance batch
    fn forward(&mut self, input: ModelInput<B>) -> Tensor<B, 4>;

    /// Turn a latent into something worth showing in a preview
    fn decode_preview(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        latent
    }
}

/// Auxiliary network producing residuals for the denoising model
pub trait ControlModel<B: Backend> {
    #[allow(clippy::too_many_arguments)]
    fn residuals(
        &mut self,
        step: usize,
        input: &Tensor<B, 4>,
        time_embedding: &Tensor<B, 2>,
        conditions: &[Tensor<B, 3>],
        hints: &[Tensor<B, 4>],
        strength: f32,
    ) -> Vec<Tensor<B, 4>>;
}

/// A control model with its hint images and strength
pub struct ControlInjection<B: Backend> {
    pub model: Box<dyn ControlModel<B>>,
    pub hints: Vec<Tensor<B, 4>>,
    pub strength: f32,
}

impl<B: Backend> ControlInjection<B> {
    pub fn new(model: Box<dyn ControlModel<B>>, hints: Vec<Tensor<B, 4>>, strength: f32) -> Self {
        Self {
            model,
            hints,
            strength,
        }
    }
}

// ============================================================================
// Refiner
// ============================================================================

/// Secondary model that takes over for the low-noise tail of the schedule
pub struct Refiner<B: Backend, M> {
    pub model: M,
    pub weights: Arc<dyn WeightStore>,
    /// Fraction of the schedule at which the refiner takes over (0..1)
    ///
    /// The handoff fires on the first step whose timestep is below
    /// `(1 - start) * T`.
    pub start: f64,
    /// Text conditioning replacing the base model's, in the 2xbatch layout
    pub conditioning: Option<Vec<Tensor<B, 3>>>,
    /// Whether the refiner is itself a consistency-distilled model
    pub is_consistency_model: bool,
}

impl<B: Backend, M> Refiner<B, M> {
    pub fn new(model: M, weights: Arc<dyn WeightStore>, start: f64) -> Self {
        Self {
            model,
            weights,
            start,
            conditioning: None,
            is_consistency_model: false,
        }
    }

    /// Timestep below which the handoff fires
    pub fn kick_in(&self, timesteps: f64) -> f64 {
        (1.0 - self.start) * timesteps
    }
}

/// The model currently driving the step loop
///
/// Owned by one sampling call. A swap retires the current model instead of
/// dropping it, so the call can hand every model it used back to the caller.
#[derive(Debug)]
pub struct ActiveModel<M> {
    current: M,
    retired: Vec<M>,
}

impl<M> ActiveModel<M> {
    pub fn new(model: M) -> Self {
        Self {
            current: model,
            retired: Vec::new(),
        }
    }

    pub fn get(&self) -> &M {
        &self.current
    }

    pub fn get_mut(&mut self) -> &mut M {
        &mut self.current
    }

    /// Make `next` the active model
    pub fn replace(&mut self, next: M) {
        let previous = std::mem::replace(&mut self.current, next);
        self.retired.push(previous);
    }

    /// Number of swaps so far
    pub fn swaps(&self) -> usize {
        self.retired.len()
    }

    /// All models in the order they became active
    pub fn into_models(self) -> Vec<M> {
        let mut models = self.retired;
        models.push(self.current);
        models
    }
}

// ============================================================================
// Size Conditioning
// ============================================================================

/// SDXL micro-conditioning on image geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeConditioning {
    /// (width, height)
    pub original_size: (usize, usize),
    /// (top, left)
    pub crop_top_left: (usize, usize),
    /// (width, height)
    pub target_size: (usize, usize),
    pub aesthetic_score: f32,
    pub negative_original_size: (usize, usize),
    pub negative_aesthetic_score: f32,
    /// Zero the unconditional branch instead of encoding a negative prompt
    pub zero_negative_prompt: bool,
}

impl Default for SizeConditioning {
    fn default() -> Self {
        Self {
            original_size: (1024, 1024),
            crop_top_left: (0, 0),
            target_size: (1024, 1024),
            aesthetic_score: 6.0,
            negative_original_size: (1024, 1024),
            negative_aesthetic_score: 2.5,
            zero_negative_prompt: false,
        }
    }
}

impl SizeConditioning {
    /// Same geometry for original and target
    pub fn square(size: usize) -> Self {
        Self {
            original_size: (size, size),
            target_size: (size, size),
            negative_original_size: (size, size),
            ..Default::default()
        }
    }

    /// Base-model vector: original (h, w), crop (top, left), target (h, w)
    ///
    /// 6 x 256 values.
    pub fn embedding<B: Backend>(&self, negative: bool, device: &B::Device) -> Tensor<B, 1> {
        let (ow, oh) = if negative {
            self.negative_original_size
        } else {
            self.original_size
        };
        let (tw, th) = self.target_size;
        let (top, left) = self.crop_top_left;
        let parts = [oh, ow, top, left, th, tw]
            .into_iter()
            .map(|v| compute_size_embedding::<B>(v as f32, device))
            .collect();
        Tensor::cat(parts, 0)
    }

    /// Refiner vector: original (h, w), crop (top, left), aesthetic score
    ///
    /// 5 x 256 values.
    pub fn refiner_embedding<B: Backend>(
        &self,
        negative: bool,
        device: &B::Device,
    ) -> Tensor<B, 1> {
        let (ow, oh) = if negative {
            self.negative_original_size
        } else {
            self.original_size
        };
        let score = if negative {
            self.negative_aesthetic_score
        } else {
            self.aesthetic_score
        };
        let (top, left) = self.crop_top_left;
        let parts = [oh as f32, ow as f32, top as f32, left as f32, score]
            .into_iter()
            .map(|v| compute_size_embedding::<B>(v, device))
            .collect();
        Tensor::cat(parts, 0)
    }
}

/// Sinusoidal 256-dim embedding of a scalar
pub(crate) fn compute_size_embedding<B: Backend>(value: f32, device: &B::Device) -> Tensor<B, 1> {
    let half_dim = 128;
    let mut emb = vec![0.0f32; 256];
    for i in 0..half_dim {
        let freq = (-((i as f32) / half_dim as f32) * (10000.0f32).ln()).exp();
        emb[i] = (value * freq).sin();
        emb[i + half_dim] = (value * freq).cos();
    }
    Tensor::from_data(TensorData::new(emb, [256]), device)
}
