use ndarray::{Array1, ArrayD, ArrayViewD, Zip};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{MlErr, ModelConfig, Result, arch::activations::sigmoid};

/// The shape family of the batches a model consumes, fixed by its config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// `(b, c, h, w)` latent grids split into patches.
    Patch,
    /// `(b, tokens, features)` sequences.
    Sequence,
}

impl InputMode {
    pub fn from_config(config: &ModelConfig) -> Self {
        if config.patch {
            Self::Patch
        } else {
            Self::Sequence
        }
    }

    /// The rank of a batch in this mode, batch axis included.
    pub fn rank(&self) -> usize {
        match self {
            InputMode::Patch => 4,
            InputMode::Sequence => 3,
        }
    }
}

/// A noised batch together with its regression target.
#[derive(Debug, Clone)]
pub struct FlowSample {
    /// `x * (1 - t) + noise * t`.
    pub lerpd: ArrayD<f32>,
    /// `noise - x`.
    pub target: ArrayD<f32>,
    /// One timestep per example, in `(0, 1)`.
    pub t: Array1<f32>,
    pub noise: ArrayD<f32>,
}

/// Builds rectified flow training pairs from clean batches.
///
/// Holds no trainable state and records nothing for a backward pass.
#[derive(Debug, Clone, Copy)]
pub struct FlowTarget {
    mode: InputMode,
}

impl FlowTarget {
    pub fn new(mode: InputMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// Draws `t = sigmoid(n)` per example with `n ~ N(0, 1)` and gaussian noise
    /// shaped like `x`, then interpolates.
    ///
    /// # Arguments
    /// * `x` - The clean batch.
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// The flow sample, or an error if `x` doesn't have this mode's rank or is empty.
    pub fn sample<R: Rng + ?Sized>(&self, x: ArrayViewD<f32>, rng: &mut R) -> Result<FlowSample> {
        let batch = self.check(&x)?;

        let t = Array1::<f32>::random_using(batch, StandardNormal, rng).mapv_into(sigmoid);
        let noise = ArrayD::<f32>::random_using(x.raw_dim(), StandardNormal, rng);

        self.with_timesteps(x, t, noise)
    }

    /// Interpolates `x` towards the given `noise` at the given timesteps.
    pub fn with_timesteps(
        &self,
        x: ArrayViewD<f32>,
        t: Array1<f32>,
        noise: ArrayD<f32>,
    ) -> Result<FlowSample> {
        let batch = self.check(&x)?;

        if t.len() != batch {
            return Err(MlErr::SizeMismatch {
                what: "timesteps",
                got: t.len(),
                expected: batch,
            });
        }

        if noise.shape() != x.shape() {
            return Err(MlErr::SizeMismatch {
                what: "noise",
                got: noise.len(),
                expected: x.len(),
            });
        }

        let mut lerpd = ArrayD::zeros(x.raw_dim());

        Zip::from(lerpd.outer_iter_mut())
            .and(x.outer_iter())
            .and(noise.outer_iter())
            .and(&t)
            .for_each(|mut lerpd, x, z, &t| {
                Zip::from(&mut lerpd)
                    .and(&x)
                    .and(&z)
                    .for_each(|l, &x, &z| *l = x * (1. - t) + z * t);
            });

        let target = &noise - &x;

        Ok(FlowSample {
            lerpd,
            target,
            t,
            noise,
        })
    }

    fn check(&self, x: &ArrayViewD<f32>) -> Result<usize> {
        if x.ndim() != self.mode.rank() {
            return Err(MlErr::RankMismatch {
                what: "batch",
                got: x.ndim(),
                expected: self.mode.rank(),
            });
        }

        match x.shape()[0] {
            0 => Err(MlErr::EmptyBatch),
            batch => Ok(batch),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{IxDyn, array};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn sequence_batches_interpolate_per_example() {
        let target = FlowTarget::new(InputMode::Sequence);
        let x = ArrayD::from_elem(IxDyn(&[2, 1, 2]), 1.0);
        let z = ArrayD::from_elem(IxDyn(&[2, 1, 2]), 3.0);

        let sample = target
            .with_timesteps(x.view(), array![0.25, 0.5], z)
            .unwrap();

        assert_eq!(sample.lerpd.as_slice().unwrap(), [1.5, 1.5, 2.0, 2.0]);
        assert!(sample.target.iter().all(|v| *v == 2.0));
    }

    #[test]
    fn mismatched_noise_is_rejected() {
        let target = FlowTarget::new(InputMode::Patch);
        let x = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 2, 2]));
        let z = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 2, 3]));

        assert!(target.with_timesteps(x.view(), array![0.5], z).is_err());
    }

    #[test]
    fn sampling_consumes_the_rng_deterministically() {
        let target = FlowTarget::new(InputMode::Patch);
        let x = ArrayD::<f32>::ones(IxDyn(&[3, 2, 2, 2]));

        let a = target.sample(x.view(), &mut StdRng::seed_from_u64(9)).unwrap();
        let b = target.sample(x.view(), &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a.t, b.t);
        assert_eq!(a.noise, b.noise);
    }
}
