use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ScalerConfig;

/// The part of a `GradScaler` that changes while training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub growth_tracker: u32,
}

/// Dynamic loss scaling for reduced precision training.
///
/// Backward passes are seeded with `scale()`, gradients are divided back
/// before stepping. Non finite gradients skip the step and back the scale off,
/// `growth_interval` clean steps in a row grow it.
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: ScalerConfig,
    state: ScalerState,
}

impl GradScaler {
    pub fn new(config: ScalerConfig) -> Self {
        let scale = if config.enabled { config.init_scale } else { 1. };

        Self {
            config,
            state: ScalerState {
                scale,
                growth_tracker: 0,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The factor the loss is multiplied by before differentiating.
    pub fn scale(&self) -> f32 {
        self.state.scale
    }

    /// Divides `grad` by the current scale in place.
    ///
    /// # Returns
    /// Whether any of the gradients is infinite or NaN.
    pub fn unscale(&self, grad: &mut [f32]) -> bool {
        if !self.config.enabled {
            return false;
        }

        let inv = 1. / self.state.scale;
        grad.par_iter_mut()
            .map(|g| {
                *g *= inv;
                !g.is_finite()
            })
            .reduce(|| false, |a, b| a || b)
    }

    /// Adjusts the scale after an update window.
    ///
    /// # Arguments
    /// * `found_inf` - What the window's `unscale` returned.
    pub fn update(&mut self, found_inf: bool) {
        if !self.config.enabled {
            return;
        }

        let state = &mut self.state;
        if found_inf {
            state.scale *= self.config.backoff_factor;
            state.growth_tracker = 0;
            return;
        }

        state.growth_tracker += 1;
        if state.growth_tracker == self.config.growth_interval {
            state.scale *= self.config.growth_factor;
            state.growth_tracker = 0;
        }
    }

    pub fn state(&self) -> ScalerState {
        self.state
    }

    pub fn load_state(&mut self, state: ScalerState) {
        self.state = state;
    }
}
