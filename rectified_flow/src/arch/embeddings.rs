use std::ops::Range;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};

use super::{
    activations::{ActFn, Activation},
    init::Init,
    layers::Linear,
    layout::{ParamScope, view2, view2_mut},
};
use crate::{MlErr, Result};

const MAX_PERIOD: f32 = 10_000.;
const TIME_SCALE: f32 = 1_000.;

/// Sinusoidal features of the scaled timesteps, `[cos | sin]` per row.
///
/// # Arguments
/// * `t` - One timestep per example, in `(0, 1)`.
/// * `dim` - The (even) width of the features.
pub fn timestep_features(t: ArrayView1<f32>, dim: usize) -> Array2<f32> {
    let half = dim / 2;
    let mut out = Array2::zeros((t.len(), dim));

    for (mut row, &t) in out.rows_mut().into_iter().zip(t) {
        for i in 0..half {
            let freq = (-MAX_PERIOD.ln() * i as f32 / half as f32).exp();
            let arg = TIME_SCALE * t * freq;
            row[i] = arg.cos();
            row[half + i] = arg.sin();
        }
    }

    out
}

/// Maps scalar timesteps to the conditioning vector of the backbone.
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    freq_dim: usize,
    fc1: Linear,
    act: Activation,
    fc2: Linear,
}

impl TimestepEmbedding {
    pub fn new(scope: &mut ParamScope, freq_dim: usize, d_model: usize) -> Self {
        Self {
            freq_dim,
            fc1: Linear::new(&mut scope.scope("fc1"), (freq_dim, d_model), true),
            act: Activation::new(ActFn::Silu),
            fc2: Linear::new(&mut scope.scope("fc2"), (d_model, d_model), true),
        }
    }

    /// Returns the `(b, d_model)` conditioning matrix.
    pub fn forward(&mut self, params: &[f32], t: ArrayView1<f32>) -> Result<Array2<f32>> {
        let feats = timestep_features(t, self.freq_dim);
        let h = self.fc1.forward(params, feats)?;
        let a = self.act.forward(h);
        self.fc2.forward(params, a)
    }

    /// Accumulates the embedding's gradients, timesteps receive none.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: ArrayView2<f32>) -> Result<()> {
        let da = self.fc2.backward(params, grad, d)?;
        let dh = self.act.backward(da.view())?;
        self.fc1.backward(params, grad, dh.view())?;
        Ok(())
    }
}

/// A learned additive positional table for sequence inputs.
#[derive(Debug, Clone)]
pub struct LearnedPosEnc {
    dim: (usize, usize),
    table: Range<usize>,
}

impl LearnedPosEnc {
    pub fn new(scope: &mut ParamScope, tokens: usize, d_model: usize) -> Self {
        let init = Init::Normal {
            mean: 0.,
            std_dev: 0.02,
        };
        let table = scope.alloc("table", &[tokens, d_model], init);

        Self {
            dim: (tokens, d_model),
            table,
        }
    }

    pub fn forward(&self, params: &[f32], mut x: Array2<f32>) -> Result<Array2<f32>> {
        let table = view2(params, &self.table, self.dim)?;

        if x.nrows() % self.dim.0 != 0 {
            return Err(MlErr::SizeMismatch {
                what: "positional rows per example",
                got: x.nrows() % self.dim.0,
                expected: 0,
            });
        }

        for mut example in x.axis_chunks_iter_mut(Axis(0), self.dim.0) {
            example += &table;
        }

        Ok(x)
    }

    /// Accumulates the table's gradient; the input delta is `d` itself.
    pub fn backward(&self, grad: &mut [f32], d: ArrayView2<f32>) -> Result<()> {
        let mut dtable = view2_mut(grad, &self.table, self.dim)?;

        for example in d.axis_chunks_iter(Axis(0), self.dim.0) {
            Zip::from(&mut dtable).and(&example).for_each(|g, &d| *g += d);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::arch::ParamLayout;

    #[test]
    fn features_start_at_cos_one_sin_zero() {
        let feats = timestep_features(array![0.0, 0.5].view(), 8);

        assert_eq!(feats.row(0).to_vec(), [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        assert!((feats[[1, 0]] - 500f32.cos()).abs() < 1e-4);
        assert!((feats[[1, 4]] - 500f32.sin()).abs() < 1e-4);
    }

    #[test]
    fn distinct_timesteps_give_distinct_embeddings() {
        let mut layout = ParamLayout::new();
        let mut embed = TimestepEmbedding::new(&mut layout.root(), 16, 8);
        let params = layout.init_params(&mut StdRng::seed_from_u64(1)).unwrap();

        let out = embed.forward(&params, array![0.1, 0.9].view()).unwrap();
        assert_eq!(out.dim(), (2, 8));
        assert_ne!(out.row(0), out.row(1));
    }

    #[test]
    fn pos_enc_gradient_sums_over_examples() {
        let mut layout = ParamLayout::new();
        let pos = LearnedPosEnc::new(&mut layout.root(), 2, 1);
        let params = vec![1.0, 2.0];
        let mut grad = vec![0.0; 2];

        let y = pos.forward(&params, array![[0.0], [0.0], [1.0], [1.0]]).unwrap();
        assert_eq!(y, array![[1.0], [2.0], [2.0], [3.0]]);

        pos.backward(&mut grad, array![[1.0], [2.0], [3.0], [4.0]].view())
            .unwrap();
        assert_eq!(grad, [4.0, 6.0]);
    }
}
