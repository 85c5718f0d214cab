use rayon::prelude::*;

use super::{Optimizer, OptimizerState, optimizer::check_len};
use crate::Result;

/// Stochastic gradient descent, with momentum when `momentum > 0`.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Box<[f32]>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - The decay of the velocity buffer, `0` disables it.
    /// * `weight_decay` - The L2 penalty added to the gradient.
    pub fn new(len: usize, learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad, params)?;

        let Self {
            learning_rate: lr,
            momentum: mu,
            weight_decay: wd,
            ..
        } = *self;

        params
            .par_iter_mut()
            .zip(grad)
            .zip(self.velocity.par_iter_mut())
            .for_each(|((p, g), v)| {
                let g = g + wd * *p;
                *v = if mu > 0. { mu * *v + g } else { g };
                *p -= lr * *v;
            });

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
        state.tensors.insert("velocity".into(), self.velocity.to_vec());
        state.scalars.insert("lr".into(), self.learning_rate as f64);
        state
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let velocity = state.tensor("velocity", self.velocity.len())?;
        let lr = state.scalar("lr")?;

        self.velocity.copy_from_slice(velocity);
        self.learning_rate = lr as f32;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_descent_follows_the_gradient() {
        let mut sgd = Sgd::new(2, 0.5, 0., 0.);
        let mut params = [1.0, -1.0];
        sgd.step(&[2.0, -4.0], &mut params).unwrap();
        assert_eq!(params, [0.0, 1.0]);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut sgd = Sgd::new(1, 1.0, 0.5, 0.);
        let mut params = [0.0];
        sgd.step(&[1.0], &mut params).unwrap();
        sgd.step(&[1.0], &mut params).unwrap();
        assert_eq!(params, [-2.5]);
    }

    #[test]
    fn mismatched_lengths_fail() {
        let mut sgd = Sgd::new(2, 0.1, 0., 0.);
        assert!(sgd.step(&[1.0], &mut [0.0, 0.0]).is_err());
    }
}
