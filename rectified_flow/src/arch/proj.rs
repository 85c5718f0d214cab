use ndarray::{Array2, Array4, ArrayView2, ArrayView4, Axis};

use super::{
    layers::{AdaLn, LayerNorm, Linear, modulate, modulate_backward},
    layout::ParamScope,
};
use crate::{MlErr, Result};

/// Splits `(b, c, h, w)` into non-overlapping `p x p` tiles.
///
/// # Returns
/// A `(b * (h/p) * (w/p), c * p * p)` matrix, tiles in row-major grid order.
pub fn patchify(x: ArrayView4<f32>, p: usize) -> Result<Array2<f32>> {
    let (b, c, h, w) = x.dim();
    let (gh, gw) = (h / p, w / p);

    let tiles = x
        .to_shape((b, c, gh, p, gw, p))?
        .permuted_axes([0, 2, 4, 1, 3, 5])
        .as_standard_layout()
        .into_owned();

    Ok(tiles.into_shape_with_order((b * gh * gw, c * p * p))?)
}

/// The inverse of `patchify`.
pub fn unpatchify(
    tokens: Array2<f32>,
    batch: usize,
    channels: usize,
    side: usize,
    p: usize,
) -> Result<Array4<f32>> {
    let g = side / p;

    let grid = tokens
        .into_shape_with_order((batch, g, g, channels, p, p))?
        .permuted_axes([0, 3, 1, 4, 2, 5])
        .as_standard_layout()
        .into_owned();

    Ok(grid.into_shape_with_order((batch, channels, side, side))?)
}

/// The fixed 2D sin-cos positional code of a `grid x grid` patch layout.
///
/// The first half of each row encodes the column, the second half the row.
pub fn sincos_2d(grid: usize, d_model: usize) -> Array2<f32> {
    let quarter = d_model / 4;
    let mut out = Array2::zeros((grid * grid, d_model));

    for gy in 0..grid {
        for gx in 0..grid {
            let mut row = out.row_mut(gy * grid + gx);
            for i in 0..quarter {
                let omega = 1. / 10_000f32.powf(i as f32 / quarter as f32);
                let (ax, ay) = (gx as f32 * omega, gy as f32 * omega);
                row[i] = ax.sin();
                row[quarter + i] = ax.cos();
                row[2 * quarter + i] = ay.sin();
                row[3 * quarter + i] = ay.cos();
            }
        }
    }

    out
}

/// Tokenizes a latent grid and projects every tile to the model width.
#[derive(Debug, Clone)]
pub struct PatchProjIn {
    patch_size: usize,
    proj: Linear,
    pos: Array2<f32>,
}

impl PatchProjIn {
    /// Creates a new `PatchProjIn`.
    ///
    /// # Arguments
    /// * `scope` - Where to reserve the projection.
    /// * `d_model` - The model width, divisible by 4.
    /// * `channels` - The latent channels.
    /// * `sample_size` - The latent side length.
    /// * `patch_size` - The tile side length.
    pub fn new(
        scope: &mut ParamScope,
        d_model: usize,
        channels: usize,
        sample_size: usize,
        patch_size: usize,
    ) -> Self {
        let token_dim = channels * patch_size * patch_size;

        Self {
            patch_size,
            proj: Linear::new(&mut scope.scope("proj"), (token_dim, d_model), true),
            pos: sincos_2d(sample_size / patch_size, d_model),
        }
    }

    pub fn forward(&mut self, params: &[f32], x: ArrayView4<f32>) -> Result<Array2<f32>> {
        let tiles = patchify(x, self.patch_size)?;
        let mut tokens = self.proj.forward(params, tiles)?;
        let n = self.pos.nrows();

        for mut example in tokens.axis_chunks_iter_mut(Axis(0), n) {
            example += &self.pos;
        }

        Ok(tokens)
    }

    /// Accumulates the projection's gradient, inputs are data and get none.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: ArrayView2<f32>) -> Result<()> {
        self.proj.backward(params, grad, d)?;
        Ok(())
    }
}

/// The timestep-modulated final layer mapping tokens back to `out_dim`.
#[derive(Debug, Clone)]
pub struct ProjOut {
    ada: AdaLn,
    norm: LayerNorm,
    proj: Linear,

    // Forward metadata
    cache: Option<(Array2<f32>, Array2<f32>)>,
}

impl ProjOut {
    pub fn new(scope: &mut ParamScope, d_model: usize, out_dim: usize) -> Self {
        Self {
            ada: AdaLn::new(&mut scope.scope("ada"), d_model, 2),
            norm: LayerNorm::new(),
            proj: Linear::zeroed(&mut scope.scope("proj"), (d_model, out_dim), true),
            cache: None,
        }
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView2<f32>,
        cond: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let m = self.ada.forward(params, cond)?;
        let h = self.norm.forward(x);
        let y = modulate(h.view(), self.ada.chunk(&m, 0), self.ada.chunk(&m, 1));

        self.cache = Some((h, m));
        self.proj.forward(params, y)
    }

    /// Returns the deltas of the tokens and of the conditioning vector.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let (h, m) = self
            .cache
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "output projection" })?;

        let dy = self.proj.backward(params, grad, d)?;
        let (dh, dshift, dscale) = modulate_backward(dy.view(), h.view(), self.ada.chunk(&m, 1));

        let mut dm = self.ada.zeros_like(m.nrows());
        self.ada.add_chunk(&mut dm, 0, &dshift);
        self.ada.add_chunk(&mut dm, 1, &dscale);

        let dcond = self.ada.backward(params, grad, dm.view())?;
        let dx = self.norm.backward(dh.view())?;
        Ok((dx, dcond))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    #[test]
    fn unpatchify_inverts_patchify() {
        let x = Array::from_iter((0..2 * 3 * 4 * 4).map(|v| v as f32))
            .into_shape_with_order((2, 3, 4, 4))
            .unwrap();

        let tokens = patchify(x.view(), 2).unwrap();
        assert_eq!(tokens.dim(), (8, 12));

        let back = unpatchify(tokens, 2, 3, 4, 2).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn a_patch_holds_its_tile() {
        let x = Array::from_iter((0..16).map(|v| v as f32))
            .into_shape_with_order((1, 1, 4, 4))
            .unwrap();

        let tokens = patchify(x.view(), 2).unwrap();
        assert_eq!(tokens.row(1).to_vec(), [2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn sincos_rows_are_distinct() {
        let pos = sincos_2d(3, 8);
        assert_eq!(pos.dim(), (9, 8));

        for i in 0..9 {
            for j in i + 1..9 {
                assert_ne!(pos.row(i), pos.row(j));
            }
        }
    }
}
