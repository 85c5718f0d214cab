use ndarray::{Array2, ArrayView2};

use crate::{
    MlErr, Result,
    arch::{
        layers::{AdaLn, Attention, LayerNorm, Mlp, gate, gate_backward, modulate, modulate_backward},
        layout::ParamScope,
    },
};

const SHIFT_ATTN: usize = 0;
const SCALE_ATTN: usize = 1;
const GATE_ATTN: usize = 2;
const SHIFT_MLP: usize = 3;
const SCALE_MLP: usize = 4;
const GATE_MLP: usize = 5;

#[derive(Debug, Clone)]
struct Cache {
    m: Array2<f32>,
    h1: Array2<f32>,
    a: Array2<f32>,
    h2: Array2<f32>,
    f: Array2<f32>,
}

/// A transformer block with adaLN-Zero conditioning.
///
/// ```text
/// x = x + gate_attn * attn(modulate(norm(x), shift_attn, scale_attn))
/// x = x + gate_mlp  * mlp(modulate(norm(x), shift_mlp, scale_mlp))
/// ```
#[derive(Debug, Clone)]
pub struct Block {
    ada: AdaLn,
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,

    // Forward metadata
    cache: Option<Box<Cache>>,
}

impl Block {
    /// Creates a new `Block`.
    ///
    /// # Arguments
    /// * `scope` - Where to reserve the block's tensors.
    /// * `d_model` - The token width.
    /// * `n_heads` - The amount of attention heads.
    /// * `mlp_ratio` - The hidden width multiplier of the MLP.
    /// * `tokens` - The amount of tokens per example.
    pub fn new(
        scope: &mut ParamScope,
        d_model: usize,
        n_heads: usize,
        mlp_ratio: usize,
        tokens: usize,
    ) -> Self {
        Self {
            ada: AdaLn::new(&mut scope.scope("ada"), d_model, 6),
            norm1: LayerNorm::new(),
            attn: Attention::new(&mut scope.scope("attn"), d_model, n_heads, tokens),
            norm2: LayerNorm::new(),
            mlp: Mlp::new(&mut scope.scope("mlp"), d_model, mlp_ratio),
            cache: None,
        }
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        x: Array2<f32>,
        cond: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let m = self.ada.forward(params, cond)?;
        let chunk = |i| self.ada.chunk(&m, i);

        let h1 = self.norm1.forward(x.view());
        let y1 = modulate(h1.view(), chunk(SHIFT_ATTN), chunk(SCALE_ATTN));
        let a = self.attn.forward(params, y1)?;
        let x = x + gate(a.view(), chunk(GATE_ATTN));

        let h2 = self.norm2.forward(x.view());
        let y2 = modulate(h2.view(), chunk(SHIFT_MLP), chunk(SCALE_MLP));
        let f = self.mlp.forward(params, y2)?;
        let x = x + gate(f.view(), chunk(GATE_MLP));

        self.cache = Some(Box::new(Cache { m, h1, a, h2, f }));
        Ok(x)
    }

    /// Returns the deltas of the tokens and of the conditioning vector.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let Cache { m, h1, a, h2, f } = *self
            .cache
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "transformer block" })?;

        let mut dm = self.ada.zeros_like(m.nrows());
        let chunk = |i| self.ada.chunk(&m, i);

        let (df, dgate_mlp) = gate_backward(d, f.view(), chunk(GATE_MLP));
        let dy2 = self.mlp.backward(params, grad, df.view())?;
        let (dh2, dshift_mlp, dscale_mlp) = modulate_backward(dy2.view(), h2.view(), chunk(SCALE_MLP));
        let dx = &d + &self.norm2.backward(dh2.view())?;

        let (da, dgate_attn) = gate_backward(dx.view(), a.view(), chunk(GATE_ATTN));
        let dy1 = self.attn.backward(params, grad, da.view())?;
        let (dh1, dshift_attn, dscale_attn) =
            modulate_backward(dy1.view(), h1.view(), chunk(SCALE_ATTN));
        let dx = dx + self.norm1.backward(dh1.view())?;

        for (i, delta) in [
            (SHIFT_ATTN, dshift_attn),
            (SCALE_ATTN, dscale_attn),
            (GATE_ATTN, dgate_attn),
            (SHIFT_MLP, dshift_mlp),
            (SCALE_MLP, dscale_mlp),
            (GATE_MLP, dgate_mlp),
        ] {
            self.ada.add_chunk(&mut dm, i, &delta);
        }

        let dcond = self.ada.backward(params, grad, dm.view())?;
        Ok((dx, dcond))
    }
}
