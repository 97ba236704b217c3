//! Text conditioning layout and per-step conditioning state

use burn::prelude::*;

use crate::error::{invalid, SamplerError};
use crate::guidance::{GuidanceLayout, SamplerModifier};
use crate::model::{DenoisingModel, SizeConditioning};

/// Encoded prompt conditioning
///
/// Every tensor is laid out `[2 * batch, tokens, width]` with the
/// unconditional rows first.
#[derive(Debug, Clone)]
pub struct TextConditioning<B: Backend> {
    pub tensors: Vec<Tensor<B, 3>>,
    pub token_length_uncond: usize,
    pub token_length_cond: usize,
    pub extra_projection: Option<Tensor<B, 3>>,
}

impl<B: Backend> TextConditioning<B> {
    pub fn new(
        tensors: Vec<Tensor<B, 3>>,
        token_length_uncond: usize,
        token_length_cond: usize,
    ) -> Self {
        Self {
            tensors,
            token_length_uncond,
            token_length_cond,
            extra_projection: None,
        }
    }

    pub fn with_extra_projection(mut self, projection: Tensor<B, 3>) -> Self {
        self.extra_projection = Some(projection);
        self
    }

    /// Check the 2 x batch layout
    pub fn validate(&self, batch: usize) -> Result<(), SamplerError> {
        validate_tensors(&self.tensors, batch)?;
        if let Some(projection) = &self.extra_projection {
            validate_tensors(std::slice::from_ref(projection), batch)?;
        }
        Ok(())
    }

    /// Rearrange for the run's guidance layout
    ///
    /// Without guidance only the conditional rows (and tokens) are kept. With
    /// three editing branches the unconditional rows are repeated for the
    /// all-unconditional branch.
    pub fn for_layout(self, layout: &GuidanceLayout) -> Self {
        let b = layout.batch_size;
        if !layout.cfg_enabled {
            let tokens = self.token_length_cond;
            return Self {
                tensors: self
                    .tensors
                    .into_iter()
                    .map(|t| conditional_rows(t, b, Some(tokens)))
                    .collect(),
                token_length_uncond: tokens,
                token_length_cond: tokens,
                extra_projection: self.extra_projection.map(|p| conditional_rows(p, b, None)),
            };
        }
        if layout.modifier == SamplerModifier::Editing && layout.cfg_channels == 3 {
            return Self {
                tensors: self
                    .tensors
                    .into_iter()
                    .map(|t| with_unconditional_branch(t, b))
                    .collect(),
                ..self
            };
        }
        self
    }
}

pub(crate) fn validate_tensors<B: Backend>(
    tensors: &[Tensor<B, 3>],
    batch: usize,
) -> Result<(), SamplerError> {
    for (index, tensor) in tensors.iter().enumerate() {
        let [rows, _, _] = tensor.dims();
        if rows != 2 * batch {
            return Err(invalid(format!(
                "conditioning tensor {index} has {rows} rows, expected 2 x batch = {}",
                2 * batch
            )));
        }
    }
    Ok(())
}

/// Rows `[b, 2b)`, optionally cut to the first `tokens` tokens
fn conditional_rows<B: Backend>(
    tensor: Tensor<B, 3>,
    b: usize,
    tokens: Option<usize>,
) -> Tensor<B, 3> {
    let [_, length, width] = tensor.dims();
    let length = tokens.map_or(length, |t| t.min(length));
    tensor.slice([b..2 * b, 0..length, 0..width])
}

/// `[uncond; cond]` to `[uncond; cond; uncond]`
fn with_unconditional_branch<B: Backend>(tensor: Tensor<B, 3>, b: usize) -> Tensor<B, 3> {
    let [_, length, width] = tensor.dims();
    let uncond = tensor.clone().slice([0..b, 0..length, 0..width]);
    Tensor::cat(vec![tensor, uncond], 0)
}

/// Conditioning handed to the model step by step
///
/// Holds the laid-out text conditioning and whatever the active model's
/// fixed encoder derived from it. The index offset is the step at which the
/// fixed encoder last ran, so models index their precomputed conditioning
/// relative to it.
#[derive(Debug, Clone)]
pub struct ConditioningState<B: Backend> {
    text: TextConditioning<B>,
    active: Vec<Tensor<B, 3>>,
    index_offset: usize,
}

impl<B: Backend> ConditioningState<B> {
    /// Run the model's fixed encoder over `timesteps`, which start at step `start`
    pub fn new<M: DenoisingModel<B>>(
        text: TextConditioning<B>,
        model: &M,
        size: &SizeConditioning,
        timesteps: &[f64],
        start: usize,
        batch: usize,
    ) -> Self {
        let active = model
            .fixed_conditions(&text.tensors, size, timesteps, batch)
            .unwrap_or_else(|| text.tensors.clone());
        Self {
            text,
            active,
            index_offset: start,
        }
    }

    pub fn text(&self) -> &TextConditioning<B> {
        &self.text
    }

    pub fn index_offset(&self) -> usize {
        self.index_offset
    }

    /// Conditioning for step `step`
    pub fn for_step<M: DenoisingModel<B>>(
        &self,
        model: &M,
        step: usize,
        rows: usize,
    ) -> Vec<Tensor<B, 3>> {
        model.extract_conditions(step.saturating_sub(self.index_offset), rows, &self.active)
    }

    /// Recompute for a newly active model from step `step` onward
    ///
    /// `replacement` swaps in new text tensors, already laid out for the run.
    pub fn rebase<M: DenoisingModel<B>>(
        &mut self,
        model: &M,
        replacement: Option<Vec<Tensor<B, 3>>>,
        size: &SizeConditioning,
        timesteps: &[f64],
        step: usize,
        batch: usize,
    ) {
        if let Some(tensors) = replacement {
            self.text.tensors = tensors;
        }
        self.active = model
            .fixed_conditions(&self.text.tensors, size, timesteps, batch)
            .unwrap_or_else(|| self.text.tensors.clone());
        self.index_offset = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guidance::GuidanceScales;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn rows(tensor: &Tensor<TestBackend, 3>) -> Vec<f32> {
        let [_, length, width] = tensor.dims();
        let values: Vec<f32> = tensor.clone().into_data().to_vec().unwrap();
        values.chunks(length * width).map(|row| row[0]).collect()
    }

    /// Row r is filled with r
    fn conditioning(batch: usize, tokens: usize) -> TextConditioning<TestBackend> {
        let width = 3;
        let data: Vec<f32> = (0..2 * batch)
            .flat_map(|r| std::iter::repeat(r as f32).take(tokens * width))
            .collect();
        let tensor = Tensor::from_data(
            TensorData::new(data, [2 * batch, tokens, width]),
            &Default::default(),
        );
        TextConditioning::new(vec![tensor], tokens, 5)
    }

    #[test]
    fn test_validate_layout() {
        assert!(conditioning(2, 7).validate(2).is_ok());
        assert!(conditioning(2, 7).validate(1).is_err());
    }

    #[test]
    fn test_without_guidance_keeps_conditional_rows() {
        let scales = GuidanceScales::text(1.0);
        let layout =
            GuidanceLayout::new(SamplerModifier::None, true, true, &scales, [2, 4, 4, 4]);
        let text = conditioning(2, 7).for_layout(&layout);
        assert_eq!(text.tensors[0].dims(), [2, 5, 3]);
        assert_eq!(rows(&text.tensors[0]), vec![2.0, 3.0]);
        assert_eq!(text.token_length_uncond, 5);
    }

    #[test]
    fn test_with_guidance_is_unchanged() {
        let scales = GuidanceScales::text(6.0);
        let layout =
            GuidanceLayout::new(SamplerModifier::None, true, true, &scales, [2, 4, 4, 4]);
        let text = conditioning(2, 7).for_layout(&layout);
        assert_eq!(text.tensors[0].dims(), [4, 7, 3]);
    }

    #[test]
    fn test_editing_repeats_unconditional_rows() {
        let scales = GuidanceScales::text(6.0);
        let layout =
            GuidanceLayout::new(SamplerModifier::Editing, true, true, &scales, [2, 4, 4, 4]);
        let text = conditioning(2, 7).for_layout(&layout);
        assert_eq!(rows(&text.tensors[0]), vec![0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);
    }
}
