//! Gaussian noise sources
//!
//! Solvers never draw randomness themselves. Every draw goes through a
//! [`NoiseSource`] handed to the sampling call, so a seeded source makes a
//! run reproducible.

use burn::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Deterministic Gaussian noise provider
pub trait NoiseSource<B: Backend> {
    /// Draw a tensor of the given shape from N(mean, std^2)
    fn randn(&mut self, shape: [usize; 4], std: f64, mean: f64, device: &B::Device)
        -> Tensor<B, 4>;
}

/// ChaCha8-backed noise source
///
/// Values are drawn on the host in row-major order, so the same seed yields
/// the same tensor on every backend.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: ChaCha8Rng,
    seed: u64,
}

impl SeededNoise {
    /// Create a source seeded with `seed`
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// The seed this source was created with
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl<B: Backend> NoiseSource<B> for SeededNoise {
    fn randn(
        &mut self,
        shape: [usize; 4],
        std: f64,
        mean: f64,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let len = shape.iter().product();
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            let z: f64 = StandardNormal.sample(&mut self.rng);
            values.push((mean + std * z) as f32);
        }
        Tensor::from_data(TensorData::new(values, shape), device)
    }
}
