use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr, config::EmaConfig};

/// The scalar part of an `Ema`'s state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub step: u64,
    pub initted: bool,
}

/// An exponential moving average of the model's parameters.
///
/// The decay warms up following `1 - (1 + epoch / inv_gamma)^-power`, clamped
/// to `[min_value, beta]`. Until `update_after_step` the shadow copy just
/// tracks the live parameters.
#[derive(Debug, Clone)]
pub struct Ema {
    config: EmaConfig,
    shadow: Vec<f32>,
    state: EmaState,
}

impl Ema {
    /// Creates a new `Ema` starting at `params`.
    pub fn new(config: EmaConfig, params: &[f32]) -> Self {
        Self {
            config,
            shadow: params.to_vec(),
            state: EmaState::default(),
        }
    }

    /// The averaged parameters.
    pub fn shadow(&self) -> &[f32] {
        &self.shadow
    }

    pub fn state(&self) -> EmaState {
        self.state
    }

    /// The decay the next average would use.
    pub fn current_decay(&self) -> f32 {
        let EmaConfig {
            beta,
            update_after_step,
            inv_gamma,
            power,
            min_value,
            ..
        } = self.config;

        let epoch = self.state.step.saturating_sub(update_after_step + 1);
        if epoch == 0 {
            return 0.;
        }

        let value = 1. - (1. + epoch as f32 / inv_gamma).powf(-power);
        value.clamp(min_value, beta)
    }

    /// Folds the live parameters into the average.
    pub fn update(&mut self, params: &[f32]) -> Result<()> {
        if params.len() != self.shadow.len() {
            return Err(TrainErr::SizeMismatch {
                what: "ema parameters",
                got: params.len(),
                expected: self.shadow.len(),
            });
        }

        let step = self.state.step;
        self.state.step += 1;

        if step % self.config.update_every != 0 {
            return Ok(());
        }

        if step <= self.config.update_after_step || !self.state.initted {
            self.shadow.copy_from_slice(params);
            self.state.initted |= step > self.config.update_after_step;
            return Ok(());
        }

        let weight = 1. - self.current_decay();
        self.shadow
            .par_iter_mut()
            .zip(params)
            .for_each(|(s, p)| *s += weight * (p - *s));

        Ok(())
    }

    /// Replaces the shadow parameters and the counters.
    pub fn load(&mut self, shadow: &[f32], state: EmaState) -> Result<()> {
        if shadow.len() != self.shadow.len() {
            return Err(TrainErr::SizeMismatch {
                what: "ema shadow",
                got: shadow.len(),
                expected: self.shadow.len(),
            });
        }

        self.shadow.copy_from_slice(shadow);
        self.state = state;
        Ok(())
    }
}
