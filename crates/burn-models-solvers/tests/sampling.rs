//! End-to-end sampling with scripted models.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use burn::prelude::*;
use burn_ndarray::NdArray;
use burn_models_solvers::{
    DenoisingModel, GuidanceScales, LcmSampler, MemoryWeightStore, ModelInput, NoiseSchedule,
    Objective, PreviewPolicy, Refiner, SampleRequest, Sampler, SamplerConfig, SamplerError,
    SamplerModifier, SamplingConfig, SeededNoise, StepBoundary, TextConditioning,
    TrainingSchedule, UniPcSampler, WeightStore,
};

type TestBackend = NdArray<f32>;

const SHAPE: [usize; 4] = [1, 8, 8, 4];
const EMBED_WIDTH: usize = 8;

/// What a scripted model records about its calls
#[derive(Debug, Default)]
struct Probe {
    calls: AtomicUsize,
    compiles: AtomicUsize,
    timesteps: Mutex<Vec<f64>>,
    rows: Mutex<Vec<usize>>,
    embedding: Mutex<Vec<f32>>,
    size_embedding: Mutex<Vec<[usize; 2]>>,
}

#[derive(Clone, Copy, Debug)]
enum Behavior {
    /// Predict a constant epsilon
    Epsilon(f32),
    /// Predict a multiple of the input latent
    ScaleLatent(f32),
    /// Zero epsilon for the unconditional half of the batch, `value` for the rest
    Branches(f32),
    Nan,
}

#[derive(Debug)]
struct ScriptedModel {
    probe: Arc<Probe>,
    behavior: Behavior,
    compiled: bool,
}

impl ScriptedModel {
    fn new(behavior: Behavior) -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let model = Self {
            probe: probe.clone(),
            behavior,
            compiled: false,
        };
        (model, probe)
    }
}

impl DenoisingModel<TestBackend> for ScriptedModel {
    fn is_compiled(&self) -> bool {
        self.compiled
    }

    fn compile(
        &mut self,
        _weights: &dyn WeightStore,
        _input: &ModelInput<TestBackend>,
    ) -> Result<(), SamplerError> {
        self.compiled = true;
        self.probe.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn time_embed(
        &self,
        _timestep: f64,
        batch: usize,
        device: &<TestBackend as Backend>::Device,
    ) -> Tensor<TestBackend, 2> {
        Tensor::zeros([batch, EMBED_WIDTH], device)
    }

    fn forward(&mut self, input: ModelInput<TestBackend>) -> Tensor<TestBackend, 4> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        self.probe.timesteps.lock().unwrap().push(input.timestep);
        let [rows, h, w, _] = input.latent.dims();
        self.probe.rows.lock().unwrap().push(rows);
        let embedding: Vec<f32> = input.time_embedding.into_data().to_vec().unwrap();
        self.probe.embedding.lock().unwrap().push(embedding[0]);
        self.probe
            .size_embedding
            .lock()
            .unwrap()
            .push(input.size_embedding.dims());

        let device = input.latent.device();
        match self.behavior {
            Behavior::Epsilon(value) => Tensor::ones([rows, h, w, SHAPE[3]], &device) * value,
            Behavior::ScaleLatent(scale) => input.latent * scale,
            Behavior::Branches(value) => {
                let half = rows / 2;
                Tensor::cat(
                    vec![
                        Tensor::zeros([half, h, w, SHAPE[3]], &device),
                        Tensor::ones([rows - half, h, w, SHAPE[3]], &device) * value,
                    ],
                    0,
                )
            }
            Behavior::Nan => Tensor::ones([rows, h, w, SHAPE[3]], &device) * f32::NAN,
        }
    }
}

fn latent(seed: u64) -> Tensor<TestBackend, 4> {
    let mut noise = SeededNoise::new(seed);
    burn_models_solvers::NoiseSource::<TestBackend>::randn(
        &mut noise,
        SHAPE,
        1.0,
        0.0,
        &Default::default(),
    )
}

fn conditioning() -> TextConditioning<TestBackend> {
    let tensor = Tensor::zeros([2 * SHAPE[0], 7, 16], &Default::default());
    TextConditioning::new(vec![tensor], 7, 7)
}

fn request(
    model: ScriptedModel,
    steps: usize,
) -> SampleRequest<TestBackend, ScriptedModel> {
    SampleRequest::new(
        latent(42),
        model,
        MemoryWeightStore::new().shared(),
        conditioning(),
        SamplingConfig { steps, shift: 1.0 },
    )
}

fn unipc(config: SamplerConfig) -> UniPcSampler<TestBackend, TrainingSchedule> {
    Sampler::unipc(TrainingSchedule::sd1x(), config)
}

fn lcm(config: SamplerConfig) -> LcmSampler<TestBackend, TrainingSchedule> {
    Sampler::lcm(TrainingSchedule::sd1x(), config)
}

fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
    tensor.into_data().to_vec().unwrap()
}

#[test]
fn test_cancellation_stops_model_calls() {
    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let result = unipc(SamplerConfig::default()).sample(
        request(model, 10),
        &mut SeededNoise::new(0),
        |offset, _| offset < 3,
    );

    match result {
        Err(SamplerError::Cancelled { step }) => assert_eq!(step, 3),
        other => panic!("expected cancellation, got {:?}", other.map(|o| o.latent.dims())),
    }
    assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_cancellation_offset_is_relative_to_start() {
    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let request = request(model, 10).with_steps(StepBoundary::whole(4), StepBoundary::whole(10));
    let mut offsets = Vec::new();
    let result = unipc(SamplerConfig::default()).sample(
        request,
        &mut SeededNoise::new(0),
        |offset, _| {
            offsets.push(offset);
            offset < 2
        },
    );

    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(offsets, vec![0, 1, 2]);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_nan_in_final_latent_fails() {
    let (model, _) = ScriptedModel::new(Behavior::Nan);
    let err = unipc(SamplerConfig::default())
        .sample(request(model, 1), &mut SeededNoise::new(0), |_, _| true)
        .unwrap_err();
    assert!(err.is_nan());
    assert!(matches!(err, SamplerError::NaN { step: 0, .. }));
}

#[test]
fn test_nan_in_preview_fails_before_next_call() {
    let config = SamplerConfig {
        preview: Some(PreviewPolicy::new(1, 1)),
        ..SamplerConfig::default()
    };
    let (model, probe) = ScriptedModel::new(Behavior::Nan);
    let err = unipc(config)
        .sample(request(model, 4), &mut SeededNoise::new(0), |_, _| true)
        .unwrap_err();
    assert!(matches!(
        err,
        SamplerError::NaN {
            step: 1,
            stage: burn_models_solvers::NanStage::Preview
        }
    ));
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_previews_follow_default_cadence() {
    let (model, _) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let mut previews = Vec::new();
    unipc(SamplerConfig::default())
        .sample(request(model, 4), &mut SeededNoise::new(0), |offset, preview| {
            if let Some(data) = preview {
                assert_eq!(data.shape, SHAPE.to_vec());
                previews.push(offset);
            }
            true
        })
        .unwrap();
    assert_eq!(previews, vec![1, 3]);
}

#[test]
fn test_refiner_fires_once_at_kick_in() {
    let (base, base_probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let (refiner, refiner_probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let request = request(base, 10).with_refiner(Refiner::new(
        refiner,
        MemoryWeightStore::new().shared(),
        0.5,
    ));

    let output = unipc(SamplerConfig::default())
        .sample(request, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();

    assert_eq!(output.models.len(), 2);
    assert_eq!(base_probe.calls.load(Ordering::SeqCst), 5);
    assert_eq!(refiner_probe.calls.load(Ordering::SeqCst), 5);
    assert_eq!(refiner_probe.compiles.load(Ordering::SeqCst), 1);
    let first_refined = refiner_probe.timesteps.lock().unwrap()[0];
    assert!(first_refined < 500.0);
    assert!(base_probe.timesteps.lock().unwrap().iter().all(|t| *t >= 500.0));
}

#[test]
fn test_refiner_outside_range_never_fires() {
    let (base, base_probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let (refiner, refiner_probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let request = request(base, 10)
        .with_steps(StepBoundary::whole(0), StepBoundary::whole(3))
        .with_refiner(Refiner::new(refiner, MemoryWeightStore::new().shared(), 0.5));

    let output = unipc(SamplerConfig::default())
        .sample(request, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();

    assert_eq!(output.models.len(), 1);
    assert_eq!(base_probe.calls.load(Ordering::SeqCst), 3);
    assert_eq!(refiner_probe.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_refiner_handoff_keeps_history() {
    let run = |with_refiner: bool| {
        let (base, _) = ScriptedModel::new(Behavior::ScaleLatent(0.5));
        let mut request = request(base, 8);
        if with_refiner {
            let (refiner, _) = ScriptedModel::new(Behavior::ScaleLatent(0.5));
            request = request.with_refiner(Refiner::new(
                refiner,
                MemoryWeightStore::new().shared(),
                0.4,
            ));
        }
        let output = unipc(SamplerConfig::default())
            .sample(request, &mut SeededNoise::new(0), |_, _| true)
            .unwrap();
        (values(output.latent), output.models.len())
    };

    let (plain, plain_models) = run(false);
    let (refined, refined_models) = run(true);
    assert_eq!(plain_models, 1);
    assert_eq!(refined_models, 2);
    assert_eq!(plain, refined);
}

#[test]
fn test_unit_mask_inpainting_is_a_no_op() {
    let device = Default::default();
    let run = |masked: bool| {
        let (model, _) = ScriptedModel::new(Behavior::ScaleLatent(0.3));
        let mut request = request(model, 6);
        if masked {
            request = request.with_known_sample(
                Tensor::ones(SHAPE, &device),
                Tensor::ones([1, 8, 8, 1], &device),
                Tensor::zeros([1, 8, 8, 1], &device),
            );
        }
        let output = unipc(SamplerConfig::default())
            .sample(request, &mut SeededNoise::new(9), |_, _| true)
            .unwrap();
        values(output.latent)
    };
    assert_eq!(run(false), run(true));
}

#[test]
fn test_lcm_is_deterministic_for_a_seed() {
    let run = |seed: u64| {
        let (model, _) = ScriptedModel::new(Behavior::ScaleLatent(0.1));
        let output = lcm(SamplerConfig::default())
            .sample(request(model, 4), &mut SeededNoise::new(seed), |_, _| true)
            .unwrap();
        values(output.latent)
    };
    assert_eq!(run(11), run(11));
    assert_ne!(run(11), run(12));
}

#[test]
fn test_first_step_is_first_order() {
    let (model, _) = ScriptedModel::new(Behavior::Epsilon(0.3));
    let steps = 10;
    let request = request(model, steps).with_steps(StepBoundary::whole(0), StepBoundary::whole(1));
    let input = values(request.latent.clone());
    let output = unipc(SamplerConfig::default())
        .sample(request, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();

    // Exponential Euler in data prediction is the deterministic DDIM step
    let schedule = NoiseSchedule::new(
        &TrainingSchedule::sd1x(),
        &SamplingConfig { steps, shift: 1.0 },
    );
    let a0 = schedule.step_alpha_cumprod(0);
    let a1 = schedule.step_alpha_cumprod(1);
    let eps = 0.3f64;
    for (x, out) in input.iter().zip(values(output.latent)) {
        let x0 = (*x as f64 - (1.0 - a0).sqrt() * eps) / a0.sqrt();
        let expected = a1.sqrt() * x0 + (1.0 - a1).sqrt() * eps;
        assert!(
            (expected - out as f64).abs() < 1e-4,
            "expected {expected}, got {out}"
        );
    }
}

#[test]
fn test_guidance_batches_branches() {
    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    unipc(SamplerConfig::default())
        .sample(request(model, 2), &mut SeededNoise::new(0), |_, _| true)
        .unwrap();
    assert_eq!(*probe.rows.lock().unwrap(), vec![2, 2]);

    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let req = request(model, 2).with_guidance(GuidanceScales::text(1.0));
    unipc(SamplerConfig::default())
        .sample(req, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();
    assert_eq!(*probe.rows.lock().unwrap(), vec![1, 1]);

    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    lcm(SamplerConfig::default())
        .sample(request(model, 2), &mut SeededNoise::new(0), |_, _| true)
        .unwrap();
    assert_eq!(*probe.rows.lock().unwrap(), vec![1, 1]);
}

#[test]
fn test_editing_uses_three_branches() {
    let config = SamplerConfig {
        modifier: SamplerModifier::Editing,
        ..SamplerConfig::default()
    };
    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let request = request(model, 2).with_masked_image(Tensor::zeros(SHAPE, &Default::default()));
    unipc(config)
        .sample(request, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();
    assert_eq!(*probe.rows.lock().unwrap(), vec![3, 3]);
}

#[test]
fn test_editing_ignores_guidance_switch() {
    let config = SamplerConfig {
        modifier: SamplerModifier::Editing,
        classifier_free_guidance: false,
        ..SamplerConfig::default()
    };
    let reference = || Tensor::zeros(SHAPE, &Default::default());

    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let req = request(model, 2).with_masked_image(reference());
    unipc(config.clone())
        .sample(req, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();
    assert_eq!(*probe.rows.lock().unwrap(), vec![3, 3]);

    // Consistency sampling never batches branches
    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let req = request(model, 2).with_masked_image(reference());
    lcm(config)
        .sample(req, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();
    assert_eq!(*probe.rows.lock().unwrap(), vec![1, 1]);
}

#[test]
fn test_size_vectors_follow_the_active_model() {
    let (base, base_probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let (refiner, refiner_probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let request = request(base, 10).with_refiner(Refiner::new(
        refiner,
        MemoryWeightStore::new().shared(),
        0.5,
    ));
    unipc(SamplerConfig::default())
        .sample(request, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();

    let base_sizes = base_probe.size_embedding.lock().unwrap().clone();
    let refiner_sizes = refiner_probe.size_embedding.lock().unwrap().clone();
    assert!(!base_sizes.is_empty() && !refiner_sizes.is_empty());
    assert!(base_sizes.iter().all(|dims| *dims == [2, 6 * 256]));
    assert!(refiner_sizes.iter().all(|dims| *dims == [2, 5 * 256]));
}

#[test]
fn test_sharpness_blends_blurred_prediction() {
    let run = |sharpness: Option<f32>| {
        let (model, _) = ScriptedModel::new(Behavior::ScaleLatent(0.3));
        let mut request = request(model, 4);
        if let Some(sharpness) = sharpness {
            request = request.with_sharpness(sharpness);
        }
        let output = unipc(SamplerConfig::default())
            .sample(request, &mut SeededNoise::new(0), |_, _| true)
            .unwrap();
        values(output.latent)
    };
    let plain = run(None);
    assert_eq!(plain, run(Some(0.0)));

    let sharpened = run(Some(200.0));
    assert!(sharpened.iter().all(|v| v.is_finite()));
    let diff: f32 = plain.iter().zip(&sharpened).map(|(a, b)| (a - b).abs()).sum();
    assert!(diff > 1e-3, "sharpness left the latent unchanged");
}

#[test]
fn test_frame_varying_guidance_scales_each_row() {
    let device = Default::default();
    let batch = 3;
    let sampling = SamplingConfig {
        steps: 1,
        shift: 1.0,
    };
    let (model, _) = ScriptedModel::new(Behavior::Branches(0.2));
    let conditioning =
        TextConditioning::new(vec![Tensor::zeros([2 * batch, 7, 16], &device)], 7, 7);
    let request = SampleRequest::new(
        Tensor::ones([batch, 8, 8, 4], &device),
        model,
        MemoryWeightStore::new().shared(),
        conditioning,
        sampling,
    )
    .with_guidance(GuidanceScales {
        text: 3.0,
        image: 1.5,
        start_frame: Some(1.0),
    });
    let output = unipc(SamplerConfig::default())
        .sample(request, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();
    let output = values(output.latent);

    // A single step returns the clean-sample estimate for each row's epsilon
    let alpha = NoiseSchedule::new(&TrainingSchedule::sd1x(), &sampling).step_alpha_cumprod(0);
    let per_row = 8 * 8 * 4;
    for (row, scale) in [1.0f64, 2.0, 3.0].iter().enumerate() {
        let eps = scale * 0.2;
        let expected = (1.0 - (1.0 - alpha).sqrt() * eps) / alpha.sqrt();
        for value in &output[row * per_row..(row + 1) * per_row] {
            assert!(
                (*value as f64 - expected).abs() < 1e-4 * expected.abs(),
                "row {row}: expected {expected}, got {value}"
            );
        }
    }
}

#[test]
fn test_lcm_guidance_embedding_is_dropped_for_plain_refiner() {
    let weights = MemoryWeightStore::new()
        .with(
            "w_cond_proj",
            TensorData::new(vec![0.01f32; EMBED_WIDTH * 256], [EMBED_WIDTH, 256]),
        )
        .shared();
    let (base, base_probe) = ScriptedModel::new(Behavior::ScaleLatent(0.1));
    let (refiner, refiner_probe) = ScriptedModel::new(Behavior::ScaleLatent(0.1));
    let mut request = request(base, 4).with_refiner(Refiner::new(
        refiner,
        MemoryWeightStore::new().shared(),
        0.5,
    ));
    request.weights = weights;

    lcm(SamplerConfig::default())
        .sample(request, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();

    let base_embedding = base_probe.embedding.lock().unwrap().clone();
    let refiner_embedding = refiner_probe.embedding.lock().unwrap().clone();
    assert!(!base_embedding.is_empty());
    assert!(base_embedding.iter().all(|v| v.abs() > 1e-6));
    assert!(!refiner_embedding.is_empty());
    assert!(refiner_embedding.iter().all(|v| *v == 0.0));
}

#[test]
fn test_empty_range_returns_latent() {
    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let request = request(model, 10).with_steps(StepBoundary::whole(4), StepBoundary::whole(4));
    let input = values(request.latent.clone());
    let output = unipc(SamplerConfig::default())
        .sample(request, &mut SeededNoise::new(0), |_, _| true)
        .unwrap();
    assert_eq!(values(output.latent), input);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_invalid_requests_are_rejected_up_front() {
    let device = Default::default();
    let sampler = unipc(SamplerConfig::default());
    let check = |request: SampleRequest<TestBackend, ScriptedModel>, probe: Arc<Probe>| {
        let err = sampler
            .sample(request, &mut SeededNoise::new(0), |_, _| true)
            .unwrap_err();
        assert!(matches!(err, SamplerError::InvalidRequest(_)), "{err}");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    };

    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let mut bad_rows = request(model, 4);
    bad_rows.conditioning =
        TextConditioning::new(vec![Tensor::zeros([1, 7, 16], &device)], 7, 7);
    check(bad_rows, probe);

    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    check(
        request(model, 4).with_steps(StepBoundary::whole(0), StepBoundary::whole(5)),
        probe,
    );

    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    check(request(model, 4).with_mask(Tensor::ones([1, 8, 8, 1], &device)), probe);

    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let inpainting = unipc(SamplerConfig {
        modifier: SamplerModifier::Inpainting,
        ..SamplerConfig::default()
    });
    let err = inpainting
        .sample(request(model, 4), &mut SeededNoise::new(0), |_, _| true)
        .unwrap_err();
    assert!(matches!(err, SamplerError::InvalidRequest(_)));
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

    // Inpainting side inputs are complete, but neg_mask has no known sample to blend
    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let mut stray_neg_mask = request(model, 4)
        .with_mask(Tensor::ones([1, 8, 8, 1], &device))
        .with_masked_image(Tensor::zeros(SHAPE, &device));
    stray_neg_mask.neg_mask = Some(Tensor::zeros([1, 8, 8, 1], &device));
    let err = inpainting
        .sample(stray_neg_mask, &mut SeededNoise::new(0), |_, _| true)
        .unwrap_err();
    assert!(matches!(err, SamplerError::InvalidRequest(_)), "{err}");
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_u_objective_is_rejected() {
    let sampler: UniPcSampler<TestBackend, _> = Sampler::unipc(
        TrainingSchedule::sd1x().with_objective(Objective::U),
        SamplerConfig::default(),
    );
    let (model, probe) = ScriptedModel::new(Behavior::Epsilon(0.1));
    let err = sampler
        .sample(request(model, 4), &mut SeededNoise::new(0), |_, _| true)
        .unwrap_err();
    assert!(matches!(err, SamplerError::UnsupportedObjective { .. }));
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}
