use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

/// The serializable state of an optimizer: named flat buffers plus scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    #[serde(skip)]
    pub tensors: BTreeMap<String, Vec<f32>>,
    pub scalars: BTreeMap<String, f64>,
}

impl OptimizerState {
    /// Takes the tensor `name` checking it holds exactly `len` values.
    pub fn tensor(&self, name: &str, len: usize) -> Result<&[f32]> {
        let values = self.tensors.get(name).ok_or_else(|| TrainErr::InvalidKwargs {
            kind: "optimizer state",
            msg: format!("missing tensor `{name}`"),
        })?;

        if values.len() != len {
            return Err(TrainErr::SizeMismatch {
                what: "optimizer state tensor",
                got: values.len(),
                expected: len,
            });
        }

        Ok(values)
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        self.scalars
            .get(name)
            .copied()
            .ok_or_else(|| TrainErr::InvalidKwargs {
                kind: "optimizer state",
                msg: format!("missing scalar `{name}`"),
            })
    }
}

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer: Send {
    /// Updates the provided slice of parameters using the accumulated gradient.
    ///
    /// # Arguments
    /// * `grad` - The model's gradient.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;

    /// The current learning rate.
    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);

    /// Whether the updates are normalized by construction, which makes global
    /// norm clipping redundant.
    fn normalizes_updates(&self) -> bool {
        false
    }

    fn state_dict(&self) -> OptimizerState;

    /// Replaces the optimizer's state, leaving it untouched on error.
    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()>;

    fn boxed_clone(&self) -> Box<dyn Optimizer>;
}

pub(super) fn check_len(grad: &[f32], params: &[f32]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(TrainErr::SizeMismatch {
            what: "optimizer gradient",
            got: grad.len(),
            expected: params.len(),
        });
    }

    Ok(())
}
