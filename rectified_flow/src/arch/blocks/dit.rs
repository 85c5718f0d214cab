use ndarray::{Array2, ArrayView2};

use super::Block;
use crate::{Result, arch::layout::ParamScope};

/// A straight stack of conditioned blocks.
#[derive(Debug, Clone)]
pub struct Dit {
    blocks: Vec<Block>,
}

impl Dit {
    pub fn new(
        scope: &mut ParamScope,
        n_layers: usize,
        d_model: usize,
        n_heads: usize,
        mlp_ratio: usize,
        tokens: usize,
    ) -> Self {
        let blocks = (0..n_layers)
            .map(|i| {
                let mut scope = scope.scope(&i.to_string());
                Block::new(&mut scope, d_model, n_heads, mlp_ratio, tokens)
            })
            .collect();

        Self { blocks }
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        mut x: Array2<f32>,
        cond: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        for block in &mut self.blocks {
            x = block.forward(params, x, cond)?;
        }

        Ok(x)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
        dcond: &mut Array2<f32>,
    ) -> Result<Array2<f32>> {
        let mut dx = d.to_owned();

        for block in self.blocks.iter_mut().rev() {
            let (d, dc) = block.backward(params, grad, dx.view())?;
            *dcond += &dc;
            dx = d;
        }

        Ok(dx)
    }
}
