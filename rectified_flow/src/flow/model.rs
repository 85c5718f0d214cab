use ndarray::{Array1, ArrayD, ArrayViewD};
use rand::Rng;

use super::{FlowSample, FlowTarget, InputMode};
use crate::{
    DenoiserCore, MlErr, ModelConfig, Result,
    loss::{LossFn, Mse},
};

/// A rectified flow model: a `DenoiserCore` trained to regress the velocity
/// `noise - x` from randomly interpolated samples.
#[derive(Debug, Clone)]
pub struct FlowModel {
    core: DenoiserCore,
    target: FlowTarget,
    loss_fn: Mse,

    // Forward metadata
    cache: Option<(ArrayD<f32>, ArrayD<f32>)>,
}

impl FlowModel {
    /// Creates a new `FlowModel`, its input mode is fixed by `config.patch`.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            core: DenoiserCore::new(config)?,
            target: FlowTarget::new(InputMode::from_config(config)),
            loss_fn: Mse::new(),
            cache: None,
        })
    }

    pub fn mode(&self) -> InputMode {
        self.target.mode()
    }

    pub fn core(&self) -> &DenoiserCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut DenoiserCore {
        &mut self.core
    }

    pub fn num_params(&self) -> usize {
        self.core.num_params()
    }

    pub fn init_params<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f32>> {
        self.core.init_params(rng)
    }

    /// Computes the flow matching loss of a clean batch.
    ///
    /// # Arguments
    /// * `params` - The flat parameter buffer.
    /// * `x` - The clean batch, its rank must match the model's input mode.
    /// * `rng` - The source of the timesteps and the noise.
    ///
    /// # Returns
    /// The mean squared error between the predicted and the true velocity.
    pub fn forward<R: Rng + ?Sized>(
        &mut self,
        params: &[f32],
        x: ArrayViewD<f32>,
        rng: &mut R,
    ) -> Result<f32> {
        let sample = self.target.sample(x, rng)?;
        self.run(params, sample)
    }

    /// Computes the loss at fixed timesteps and noise.
    pub fn evaluate(
        &mut self,
        params: &[f32],
        x: ArrayViewD<f32>,
        t: Array1<f32>,
        noise: ArrayD<f32>,
    ) -> Result<f32> {
        let sample = self.target.with_timesteps(x, t, noise)?;
        self.run(params, sample)
    }

    /// Accumulates `seed * dL/dparams` into `grad`.
    ///
    /// # Arguments
    /// * `params` - The flat parameter buffer used in the forward pass.
    /// * `grad` - The flat gradient buffer.
    /// * `seed` - The factor applied to the loss before differentiating.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], seed: f32) -> Result<()> {
        let (pred, target) = self
            .cache
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "flow model" })?;

        let d = self.loss_fn.loss_prime(pred.view(), target.view()) * seed;
        self.core.backward(params, grad, d.view())
    }

    fn run(&mut self, params: &[f32], sample: FlowSample) -> Result<f32> {
        let FlowSample {
            lerpd, target, t, ..
        } = sample;

        let pred = self.core.forward(params, lerpd.view(), t.view())?;
        let loss = self.loss_fn.loss(pred.view(), target.view());

        self.cache = Some((pred, target));
        Ok(loss)
    }
}
