use ndarray::{Array2, ArrayView2, Axis, s};

use super::Linear;
use crate::{
    Result,
    arch::{
        activations::{ActFn, Activation},
        layout::ParamScope,
    },
};

/// The adaLN-Zero conditioning head: `Linear(SiLU(cond))` split in `chunks`
/// vectors of width `d_model` per example.
///
/// The projection starts at zero so every modulated block begins as the
/// identity map.
#[derive(Debug, Clone)]
pub struct AdaLn {
    d_model: usize,
    chunks: usize,
    act: Activation,
    proj: Linear,
}

impl AdaLn {
    /// Creates a new `AdaLn`.
    ///
    /// # Arguments
    /// * `scope` - Where to reserve the projection.
    /// * `d_model` - The width of the conditioning vector and of each chunk.
    /// * `chunks` - The amount of modulation vectors produced.
    pub fn new(scope: &mut ParamScope, d_model: usize, chunks: usize) -> Self {
        let proj = Linear::zeroed(&mut scope.scope("proj"), (d_model, chunks * d_model), true);

        Self {
            d_model,
            chunks,
            act: Activation::new(ActFn::Silu),
            proj,
        }
    }

    /// Computes the `(b, chunks * d_model)` modulation matrix.
    pub fn forward(&mut self, params: &[f32], cond: ArrayView2<f32>) -> Result<Array2<f32>> {
        let a = self.act.forward(cond.to_owned());
        self.proj.forward(params, a)
    }

    /// Returns the delta of the conditioning vector.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let da = self.proj.backward(params, grad, d)?;
        self.act.backward(da.view())
    }

    /// Views the `i`-th modulation vector of every example.
    pub fn chunk<'a>(&self, m: &'a Array2<f32>, i: usize) -> ArrayView2<'a, f32> {
        let d = self.d_model;
        m.slice(s![.., i * d..(i + 1) * d])
    }

    /// Builds an empty delta for the modulation matrix.
    pub fn zeros_like(&self, batch: usize) -> Array2<f32> {
        Array2::zeros((batch, self.chunks * self.d_model))
    }

    /// Adds `d` into the `i`-th chunk of a modulation delta.
    pub fn add_chunk(&self, dm: &mut Array2<f32>, i: usize, d: &Array2<f32>) {
        let w = self.d_model;
        let mut dst = dm.slice_mut(s![.., i * w..(i + 1) * w]);
        dst += d;
    }
}

/// Applies `x * (1 + scale) + shift` where the rows of `x` are the tokens of
/// `shift.nrows()` consecutive examples.
pub fn modulate(x: ArrayView2<f32>, shift: ArrayView2<f32>, scale: ArrayView2<f32>) -> Array2<f32> {
    let tokens = x.nrows() / shift.nrows();
    let mut y = x.to_owned();

    y.axis_chunks_iter_mut(Axis(0), tokens)
        .zip(shift.rows())
        .zip(scale.rows())
        .for_each(|((mut y, shift), scale)| {
            y *= &(&scale + 1.);
            y += &shift;
        });

    y
}

/// The backward pass of `modulate`.
///
/// # Returns
/// The deltas of `x`, `shift` and `scale`.
pub fn modulate_backward(
    d: ArrayView2<f32>,
    x: ArrayView2<f32>,
    scale: ArrayView2<f32>,
) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
    let batch = scale.nrows();
    let tokens = d.nrows() / batch;
    let mut dx = d.to_owned();
    let mut dshift = Array2::zeros(scale.raw_dim());
    let mut dscale = Array2::zeros(scale.raw_dim());

    dx.axis_chunks_iter_mut(Axis(0), tokens)
        .zip(x.axis_chunks_iter(Axis(0), tokens))
        .zip(scale.rows())
        .zip(dshift.rows_mut())
        .zip(dscale.rows_mut())
        .for_each(|((((mut dx, x), scale), mut dshift), mut dscale)| {
            dshift.assign(&dx.sum_axis(Axis(0)));
            dscale.assign(&(&dx * &x).sum_axis(Axis(0)));
            dx *= &(&scale + 1.);
        });

    (dx, dshift, dscale)
}

/// Applies the per-example residual gate `h * gate`.
pub fn gate(h: ArrayView2<f32>, gate: ArrayView2<f32>) -> Array2<f32> {
    let tokens = h.nrows() / gate.nrows();
    let mut y = h.to_owned();

    y.axis_chunks_iter_mut(Axis(0), tokens)
        .zip(gate.rows())
        .for_each(|(mut y, g)| y *= &g);

    y
}

/// The backward pass of `gate`.
///
/// # Returns
/// The deltas of `h` and `gate`.
pub fn gate_backward(
    d: ArrayView2<f32>,
    h: ArrayView2<f32>,
    gate: ArrayView2<f32>,
) -> (Array2<f32>, Array2<f32>) {
    let tokens = d.nrows() / gate.nrows();
    let mut dh = d.to_owned();
    let mut dgate = Array2::zeros(gate.raw_dim());

    dh.axis_chunks_iter_mut(Axis(0), tokens)
        .zip(h.axis_chunks_iter(Axis(0), tokens))
        .zip(gate.rows())
        .zip(dgate.rows_mut())
        .for_each(|(((mut dh, h), g), mut dg)| {
            dg.assign(&(&dh * &h).sum_axis(Axis(0)));
            dh *= &g;
        });

    (dh, dgate)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn modulation_is_applied_per_example() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]];
        let shift = array![[1.0, 0.0], [0.0, -1.0]];
        let scale = array![[0.0, 1.0], [-1.0, 0.0]];

        let y = modulate(x.view(), shift.view(), scale.view());
        assert_eq!(y, array![[2.0, 4.0], [4.0, 8.0], [0.0, 5.0], [0.0, 7.0]]);
    }

    #[test]
    fn modulate_backward_sums_over_tokens() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let scale = array![[0.5, -0.5]];
        let d = array![[1.0, 1.0], [2.0, 0.0]];

        let (dx, dshift, dscale) = modulate_backward(d.view(), x.view(), scale.view());
        assert_eq!(dx, array![[1.5, 0.5], [3.0, 0.0]]);
        assert_eq!(dshift, array![[3.0, 1.0]]);
        assert_eq!(dscale, array![[7.0, 2.0]]);
    }

    #[test]
    fn gate_backward_matches_hand_computation() {
        let h = array![[1.0, -2.0], [0.5, 3.0]];
        let g = array![[2.0, 0.0]];
        let d = array![[1.0, 1.0], [1.0, 2.0]];

        assert_eq!(gate(h.view(), g.view()), array![[2.0, 0.0], [1.0, 0.0]]);

        let (dh, dg) = gate_backward(d.view(), h.view(), g.view());
        assert_eq!(dh, array![[2.0, 0.0], [2.0, 0.0]]);
        assert_eq!(dg, array![[1.5, 4.0]]);
    }
}
