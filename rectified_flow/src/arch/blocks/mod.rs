mod block;
mod dit;
mod uvit;

use ndarray::{Array2, ArrayView2};

pub use block::Block;
pub use dit::Dit;
pub use uvit::Uvit;

use crate::{ModelConfig, Result, arch::layout::ParamScope};

/// The transformer topology, fixed at construction.
#[derive(Debug, Clone)]
pub enum Backbone {
    Dit(Dit),
    Uvit(Uvit),
}

impl Backbone {
    pub fn new(scope: &mut ParamScope, config: &ModelConfig) -> Self {
        let (n_layers, d_model, n_heads) = (config.n_layers, config.d_model, config.n_heads);
        let (mlp_ratio, tokens) = (config.mlp_ratio, config.tokens());

        if config.uvit {
            Self::Uvit(Uvit::new(scope, n_layers, d_model, n_heads, mlp_ratio, tokens))
        } else {
            Self::Dit(Dit::new(scope, n_layers, d_model, n_heads, mlp_ratio, tokens))
        }
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        x: Array2<f32>,
        cond: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        match self {
            Backbone::Dit(dit) => dit.forward(params, x, cond),
            Backbone::Uvit(uvit) => uvit.forward(params, x, cond),
        }
    }

    /// Returns the token delta, adding the conditioning delta into `dcond`.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
        dcond: &mut Array2<f32>,
    ) -> Result<Array2<f32>> {
        match self {
            Backbone::Dit(dit) => dit.backward(params, grad, d, dcond),
            Backbone::Uvit(uvit) => uvit.backward(params, grad, d, dcond),
        }
    }
}
