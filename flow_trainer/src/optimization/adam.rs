use rayon::prelude::*;

use super::{Optimizer, OptimizerState, optimizer::check_len};
use crate::Result;

/// Adam, with decoupled weight decay (AdamW) when `decoupled` is set and
/// L2-coupled weight decay otherwise.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    epsilon: f32,
    weight_decay: f32,
    decoupled: bool,
    m: Box<[f32]>,
    v: Box<[f32]>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `betas`, `epsilon` - Hyperparameters to the optimization algorithm.
    /// * `weight_decay` - The weight decay coefficient.
    /// * `decoupled` - Whether the decay is applied to the weights directly.
    pub fn new(
        len: usize,
        learning_rate: f32,
        betas: (f32, f32),
        epsilon: f32,
        weight_decay: f32,
        decoupled: bool,
    ) -> Self {
        Self {
            learning_rate,
            beta1: betas.0,
            beta2: betas.1,
            beta1_t: 1.,
            beta2_t: 1.,
            epsilon,
            weight_decay,
            decoupled,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
        }
    }

    /// Applies an update to a sub range of the parameters, `offset` being the
    /// position of `params` inside the full buffer.
    pub(super) fn step_range(&mut self, offset: usize, grad: &[f32], params: &mut [f32]) {
        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            decoupled,
            beta1_t,
            beta2_t,
            ..
        } = *self;

        let bc1 = 1. - beta1_t;
        let bc2 = 1. - beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);
        let range = offset..offset + params.len();

        params
            .par_iter_mut()
            .zip(grad)
            .zip(self.m[range.clone()].par_iter_mut())
            .zip(self.v[range].par_iter_mut())
            .for_each(|(((p, g), m), v)| {
                let g = if decoupled { *g } else { g + wd * *p };
                if decoupled {
                    *p -= lr * wd * *p;
                }

                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g.powi(2);
                *p -= step_size * *m / (v.sqrt() + eps * bc2.sqrt());
            });
    }

    /// Advances the bias correction terms by one step.
    pub(super) fn advance(&mut self) {
        self.beta1_t *= self.beta1;
        self.beta2_t *= self.beta2;
    }
}

impl Optimizer for Adam {
    fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad, params)?;
        self.advance();
        self.step_range(0, grad, params);
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> OptimizerState {
        let mut state = OptimizerState::default();
        state.tensors.insert("m".into(), self.m.to_vec());
        state.tensors.insert("v".into(), self.v.to_vec());
        state.scalars.insert("lr".into(), self.learning_rate as f64);
        state.scalars.insert("beta1_t".into(), self.beta1_t as f64);
        state.scalars.insert("beta2_t".into(), self.beta2_t as f64);
        state
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let m = state.tensor("m", self.m.len())?;
        let v = state.tensor("v", self.v.len())?;
        let lr = state.scalar("lr")?;
        let beta1_t = state.scalar("beta1_t")?;
        let beta2_t = state.scalar("beta2_t")?;

        self.m.copy_from_slice(m);
        self.v.copy_from_slice(v);
        self.learning_rate = lr as f32;
        self.beta1_t = beta1_t as f32;
        self.beta2_t = beta2_t as f32;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}
