use ndarray::{Array2, ArrayView2, Axis, concatenate, s};

use super::Block;
use crate::{
    MlErr, Result,
    arch::{layers::Linear, layout::ParamScope},
};

/// A U-shaped stack: the outputs of the down blocks are fused back into the
/// up blocks of the same depth through a `Linear(2d, d)` over `[x | skip]`.
#[derive(Debug, Clone)]
pub struct Uvit {
    d_model: usize,
    down: Vec<Block>,
    mid: Option<Block>,
    up: Vec<(Linear, Block)>,
}

impl Uvit {
    pub fn new(
        scope: &mut ParamScope,
        n_layers: usize,
        d_model: usize,
        n_heads: usize,
        mlp_ratio: usize,
        tokens: usize,
    ) -> Self {
        let half = n_layers / 2;

        let down = (0..half)
            .map(|i| {
                let mut scope = scope.scope(&format!("down.{i}"));
                Block::new(&mut scope, d_model, n_heads, mlp_ratio, tokens)
            })
            .collect();

        let mid = (n_layers % 2 == 1).then(|| {
            let mut scope = scope.scope("mid");
            Block::new(&mut scope, d_model, n_heads, mlp_ratio, tokens)
        });

        let up = (0..half)
            .map(|i| {
                let mut scope = scope.scope(&format!("up.{i}"));
                let fuse = Linear::new(&mut scope.scope("fuse"), (2 * d_model, d_model), true);
                let block = Block::new(&mut scope, d_model, n_heads, mlp_ratio, tokens);
                (fuse, block)
            })
            .collect();

        Self {
            d_model,
            down,
            mid,
            up,
        }
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        mut x: Array2<f32>,
        cond: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let mut skips = Vec::with_capacity(self.down.len());

        for block in &mut self.down {
            x = block.forward(params, x, cond)?;
            skips.push(x.clone());
        }

        if let Some(mid) = &mut self.mid {
            x = mid.forward(params, x, cond)?;
        }

        for (fuse, block) in &mut self.up {
            let skip = skips.pop().ok_or(MlErr::SizeMismatch {
                what: "u-vit skip connections",
                got: 0,
                expected: 1,
            })?;
            let cat = concatenate(Axis(1), &[x.view(), skip.view()])?;
            x = fuse.forward(params, cat)?;
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
        let depth = self.down.len();
        let width = self.d_model;
        let mut dskips = vec![None; depth];
        let mut dx = d.to_owned();

        for (j, (fuse, block)) in self.up.iter_mut().enumerate().rev() {
            let (d, dc) = block.backward(params, grad, dx.view())?;
            *dcond += &dc;
            let dcat = fuse.backward(params, grad, d.view())?;
            dx = dcat.slice(s![.., ..width]).to_owned();
            dskips[depth - 1 - j] = Some(dcat.slice(s![.., width..]).to_owned());
        }

        if let Some(mid) = &mut self.mid {
            let (d, dc) = mid.backward(params, grad, dx.view())?;
            *dcond += &dc;
            dx = d;
        }

        for (block, dskip) in self.down.iter_mut().zip(dskips).rev() {
            if let Some(dskip) = dskip {
                dx += &dskip;
            }
            let (d, dc) = block.backward(params, grad, dx.view())?;
            *dcond += &dc;
            dx = d;
        }

        Ok(dx)
    }
}
