use ndarray::{Array1, ArrayD, ArrayView1, ArrayViewD, Axis};
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use rand::rngs::StdRng;
use rectified_flow::DenoiserCore;

use crate::{Result, TrainErr};

/// Predicts the flow velocity of noisy latents.
pub trait Denoiser {
    fn predict(&mut self, x: ArrayViewD<f32>, t: ArrayView1<f32>) -> Result<ArrayD<f32>>;
}

/// A denoiser running over a snapshot of the averaged weights.
pub struct EmaDenoiser<'a> {
    core: DenoiserCore,
    params: &'a [f32],
}

impl<'a> EmaDenoiser<'a> {
    /// # Arguments
    /// * `core` - The network, cloned so sampling never touches the training caches.
    /// * `params` - The EMA parameters.
    pub fn new(core: &DenoiserCore, params: &'a [f32]) -> Result<Self> {
        core.layout().check("ema parameters", params.len())?;

        Ok(Self {
            core: core.clone(),
            params,
        })
    }
}

impl Denoiser for EmaDenoiser<'_> {
    fn predict(&mut self, x: ArrayViewD<f32>, t: ArrayView1<f32>) -> Result<ArrayD<f32>> {
        Ok(self.core.forward(self.params, x, t)?)
    }
}

/// Maps latents back to data space.
pub type DecodeFn<'a> = dyn Fn(ArrayViewD<f32>) -> Result<ArrayD<f32>> + 'a;

/// Draws samples by integrating the learned flow from noise to data.
pub trait Sampler: Send {
    /// # Arguments
    /// * `denoiser` - The velocity model.
    /// * `latents` - A batch whose shape the samples take.
    /// * `decode` - The decoder applied to the final latents.
    /// * `scale` - The factor latents were divided by during training.
    /// * `rng` - The source of the starting noise.
    fn sample(
        &self,
        denoiser: &mut dyn Denoiser,
        latents: ArrayViewD<f32>,
        decode: &DecodeFn<'_>,
        scale: f32,
        rng: &mut StdRng,
    ) -> Result<ArrayD<f32>>;
}

/// First order integration over `steps` uniform steps.
#[derive(Debug, Clone, Copy)]
pub struct Euler {
    steps: usize,
}

impl Euler {
    pub fn new(steps: usize) -> Self {
        Self { steps: steps.max(1) }
    }
}

impl Sampler for Euler {
    fn sample(
        &self,
        denoiser: &mut dyn Denoiser,
        latents: ArrayViewD<f32>,
        decode: &DecodeFn<'_>,
        scale: f32,
        rng: &mut StdRng,
    ) -> Result<ArrayD<f32>> {
        let batch = latents.len_of(Axis(0));
        let mut x = ArrayD::<f32>::random_using(latents.raw_dim(), StandardNormal, rng);
        let dt = 1. / self.steps as f32;

        for i in 0..self.steps {
            let t = Array1::from_elem(batch, 1. - i as f32 * dt);
            let v = denoiser.predict(x.view(), t.view())?;
            x.scaled_add(-dt, &v);
        }

        x *= scale;
        decode(x.view())
    }
}

/// Builds the sampler named `id`.
pub fn build_sampler(id: &str, steps: usize) -> Result<Box<dyn Sampler>> {
    match id {
        "euler" => Ok(Box::new(Euler::new(steps))),
        _ => Err(TrainErr::Unknown {
            kind: "sampler",
            name: id.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::IxDyn;
    use rand::SeedableRng;

    use super::*;

    /// The exact velocity of a flow collapsing every sample onto `target`.
    struct Towards(f32);

    impl Denoiser for Towards {
        fn predict(&mut self, x: ArrayViewD<f32>, t: ArrayView1<f32>) -> Result<ArrayD<f32>> {
            let t = t[0];
            Ok(x.mapv(|v| (v - self.0) / t))
        }
    }

    #[test]
    fn euler_integrates_straight_paths_exactly() {
        let latents = ArrayD::zeros(IxDyn(&[2, 3]));
        let decode = |z: ArrayViewD<f32>| -> Result<ArrayD<f32>> { Ok(z.to_owned()) };
        let mut rng = StdRng::seed_from_u64(0);

        let out = Euler::new(8)
            .sample(&mut Towards(2.0), latents.view(), &decode, 0.5, &mut rng)
            .unwrap();

        assert_eq!(out.shape(), [2, 3]);
        assert!(out.iter().all(|v| (v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn unknown_samplers_fail() {
        assert!(build_sampler("euler", 4).is_ok());
        assert!(matches!(build_sampler("dpm", 4), Err(TrainErr::Unknown { .. })));
    }
}
