use ndarray::{Array2, ArrayView2, Axis, s};
use rayon::prelude::*;

use super::Linear;
use crate::{MlErr, Result, arch::layout::ParamScope};

/// Applies a numerically stable softmax to every row of `x` in place.
pub fn softmax_rows(x: &mut Array2<f32>) {
    for mut row in x.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}

/// Multi-head self attention over the tokens of every example.
///
/// Rows of the input are `tokens` consecutive tokens per example, the heads
/// of every example are computed in parallel.
#[derive(Debug, Clone)]
pub struct Attention {
    d_model: usize,
    n_heads: usize,
    tokens: usize,
    qkv: Linear,
    out: Linear,

    // Forward metadata
    cache: Option<(Array2<f32>, Vec<Array2<f32>>)>,
}

impl Attention {
    /// Creates a new `Attention`.
    ///
    /// # Arguments
    /// * `scope` - Where to reserve the projections.
    /// * `d_model` - The token width, must be divisible by `n_heads`.
    /// * `n_heads` - The amount of attention heads.
    /// * `tokens` - The amount of tokens per example.
    pub fn new(scope: &mut ParamScope, d_model: usize, n_heads: usize, tokens: usize) -> Self {
        Self {
            d_model,
            n_heads,
            tokens,
            qkv: Linear::new(&mut scope.scope("qkv"), (d_model, 3 * d_model), true),
            out: Linear::new(&mut scope.scope("out"), (d_model, d_model), true),
            cache: None,
        }
    }

    fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Result<Array2<f32>> {
        if x.nrows() % self.tokens != 0 {
            return Err(MlErr::SizeMismatch {
                what: "attention rows per example",
                got: x.nrows() % self.tokens,
                expected: 0,
            });
        }

        let qkv = self.qkv.forward(params, x)?;
        let (n, d, dh, heads) = (self.tokens, self.d_model, self.head_dim(), self.n_heads);
        let batch = qkv.nrows() / n;
        let scale = 1. / (dh as f32).sqrt();

        let results: Vec<_> = (0..batch * heads)
            .into_par_iter()
            .map(|i| {
                let (rows, c) = ((i / heads) * n..(i / heads + 1) * n, (i % heads) * dh);
                let q = qkv.slice(s![rows.clone(), c..c + dh]);
                let k = qkv.slice(s![rows.clone(), d + c..d + c + dh]);
                let v = qkv.slice(s![rows, 2 * d + c..2 * d + c + dh]);

                let mut p = q.dot(&k.t()) * scale;
                softmax_rows(&mut p);
                let o = p.dot(&v);
                (p, o)
            })
            .collect();

        let mut o = Array2::zeros((batch * n, d));
        let mut probs = Vec::with_capacity(results.len());

        for (i, (p, oh)) in results.into_iter().enumerate() {
            let (r, c) = ((i / heads) * n, (i % heads) * dh);
            o.slice_mut(s![r..r + n, c..c + dh]).assign(&oh);
            probs.push(p);
        }

        self.cache = Some((qkv, probs));
        self.out.forward(params, o)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let (qkv, probs) = self
            .cache
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "attention" })?;

        let d_o = self.out.backward(params, grad, d)?;
        let (n, d, dh, heads) = (self.tokens, self.d_model, self.head_dim(), self.n_heads);
        let scale = 1. / (dh as f32).sqrt();

        let deltas: Vec<_> = probs
            .par_iter()
            .enumerate()
            .map(|(i, p)| {
                let (rows, c) = ((i / heads) * n..(i / heads + 1) * n, (i % heads) * dh);
                let q = qkv.slice(s![rows.clone(), c..c + dh]);
                let k = qkv.slice(s![rows.clone(), d + c..d + c + dh]);
                let v = qkv.slice(s![rows.clone(), 2 * d + c..2 * d + c + dh]);
                let doh = d_o.slice(s![rows, c..c + dh]);

                let dv = p.t().dot(&doh);
                let dp = doh.dot(&v.t());
                let inner = (&dp * p).sum_axis(Axis(1)).insert_axis(Axis(1));
                let ds = (dp - &inner) * p * scale;
                let dq = ds.dot(&k);
                let dk = ds.t().dot(&q);
                (dq, dk, dv)
            })
            .collect();

        let mut dqkv = Array2::zeros(qkv.raw_dim());
        for (i, (dq, dk, dv)) in deltas.into_iter().enumerate() {
            let (r, c) = ((i / heads) * n, (i % heads) * dh);
            dqkv.slice_mut(s![r..r + n, c..c + dh]).assign(&dq);
            dqkv.slice_mut(s![r..r + n, d + c..d + c + dh]).assign(&dk);
            dqkv.slice_mut(s![r..r + n, 2 * d + c..2 * d + c + dh]).assign(&dv);
        }

        self.qkv.backward(params, grad, dqkv.view())
    }
}
