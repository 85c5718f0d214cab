use log::debug;
use ndarray::{Array2, ArrayD, ArrayView1, ArrayViewD, Ix4};
use rand::Rng;

use super::{
    blocks::Backbone,
    embeddings::{LearnedPosEnc, TimestepEmbedding},
    layers::Linear,
    layout::ParamLayout,
    proj::{PatchProjIn, ProjOut, patchify, unpatchify},
};
use crate::{MlErr, ModelConfig, Result};

#[derive(Debug, Clone)]
enum ProjIn {
    Patch(PatchProjIn),
    Sequence { proj: Linear, pos: LearnedPosEnc },
}

/// The velocity predictor: maps a noisy sample and its timesteps to a
/// prediction of the same shape.
///
/// The core owns only its `ParamLayout`. Parameters and gradients are flat
/// buffers passed in on every call, so the same core serves the live weights
/// and any shadow copy of them.
#[derive(Debug, Clone)]
pub struct DenoiserCore {
    config: ModelConfig,
    layout: ParamLayout,
    t_embed: TimestepEmbedding,
    proj_in: ProjIn,
    backbone: Backbone,
    proj_out: ProjOut,

    // Forward metadata
    batch: Option<usize>,
}

impl DenoiserCore {
    /// Creates a new `DenoiserCore`.
    ///
    /// # Arguments
    /// * `config` - The model's description.
    ///
    /// # Returns
    /// An `InvalidConfig` error if the config's sizes are incoherent.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;

        let d_model = config.d_model;
        let mut layout = ParamLayout::new();
        let mut root = layout.root();

        let t_embed = TimestepEmbedding::new(&mut root.scope("t_embed"), config.t_freq_dim, d_model);

        let proj_in = if config.patch {
            ProjIn::Patch(PatchProjIn::new(
                &mut root.scope("proj_in"),
                d_model,
                config.channels,
                config.sample_size,
                config.patch_size,
            ))
        } else {
            let mut scope = root.scope("proj_in");
            let proj = Linear::new(&mut scope, (config.channels, d_model), false);
            let pos = LearnedPosEnc::new(&mut root.scope("pos_enc"), config.sample_size, d_model);
            ProjIn::Sequence { proj, pos }
        };

        let backbone = Backbone::new(&mut root.scope("blocks"), config);
        let proj_out = ProjOut::new(&mut root.scope("proj_out"), d_model, config.token_dim());

        debug!(
            params = layout.len(), tensors = layout.specs().len(), uvit = config.uvit;
            "built denoiser core"
        );

        Ok(Self {
            config: config.clone(),
            layout,
            t_embed,
            proj_in,
            backbone,
            proj_out,
            batch: None,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn num_params(&self) -> usize {
        self.layout.len()
    }

    /// Draws a fresh flat parameter buffer following every tensor's init.
    pub fn init_params<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f32>> {
        self.layout.init_params(rng)
    }

    /// Predicts the flow velocity of `x` at timesteps `t`.
    ///
    /// # Arguments
    /// * `params` - The flat parameter buffer.
    /// * `x` - A `(b, c, s, s)` batch in patch mode, `(b, s, c)` otherwise.
    /// * `t` - One timestep per example.
    ///
    /// # Returns
    /// The prediction, shaped like `x`.
    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayViewD<f32>,
        t: ArrayView1<f32>,
    ) -> Result<ArrayD<f32>> {
        self.layout.check("parameters", params.len())?;
        let batch = self.check_input("input", &x)?;

        if t.len() != batch {
            return Err(MlErr::SizeMismatch {
                what: "timesteps",
                got: t.len(),
                expected: batch,
            });
        }

        let cond = self.t_embed.forward(params, t)?;

        let tokens = match &mut self.proj_in {
            ProjIn::Patch(proj) => proj.forward(params, x.into_dimensionality::<Ix4>()?)?,
            ProjIn::Sequence { proj, pos } => {
                let rows = x.to_shape((batch * self.config.sample_size, self.config.channels))?;
                let h = proj.forward(params, rows.into_owned())?;
                pos.forward(params, h)?
            }
        };

        let h = self.backbone.forward(params, tokens, cond.view())?;
        let out = self.proj_out.forward(params, h.view(), cond.view())?;

        self.batch = Some(batch);
        self.to_sample(out, batch)
    }

    /// Accumulates the gradient of every parameter into `grad`.
    ///
    /// # Arguments
    /// * `params` - The flat parameter buffer used in the forward pass.
    /// * `grad` - The flat gradient buffer, added into and never overwritten.
    /// * `d` - The delta of the prediction.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: ArrayViewD<f32>) -> Result<()> {
        self.layout.check("gradients", grad.len())?;
        let batch = self
            .batch
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "denoiser" })?;

        let got = self.check_input("prediction delta", &d)?;
        if got != batch {
            return Err(MlErr::SizeMismatch {
                what: "prediction delta batch",
                got,
                expected: batch,
            });
        }

        let dtokens = self.to_tokens(d, batch)?;
        let (dh, mut dcond) = self.proj_out.backward(params, grad, dtokens.view())?;
        let dx = self.backbone.backward(params, grad, dh.view(), &mut dcond)?;

        match &mut self.proj_in {
            ProjIn::Patch(proj) => proj.backward(params, grad, dx.view())?,
            ProjIn::Sequence { proj, pos } => {
                pos.backward(grad, dx.view())?;
                proj.backward(params, grad, dx.view())?;
            }
        }

        self.t_embed.backward(params, grad, dcond.view())
    }

    fn check_input(&self, what: &'static str, x: &ArrayViewD<f32>) -> Result<usize> {
        let expected = self.config.sample_shape();

        if x.ndim() != expected.len() + 1 {
            return Err(MlErr::RankMismatch {
                what,
                got: x.ndim(),
                expected: expected.len() + 1,
            });
        }

        let batch = x.shape()[0];
        if batch == 0 {
            return Err(MlErr::EmptyBatch);
        }

        for (&got, &expected) in x.shape()[1..].iter().zip(&expected) {
            if got != expected {
                return Err(MlErr::SizeMismatch { what, got, expected });
            }
        }

        Ok(batch)
    }

    fn to_sample(&self, tokens: Array2<f32>, batch: usize) -> Result<ArrayD<f32>> {
        let cfg = &self.config;

        if cfg.patch {
            let grid = unpatchify(tokens, batch, cfg.channels, cfg.sample_size, cfg.patch_size)?;
            Ok(grid.into_dyn())
        } else {
            let seq = tokens.into_shape_with_order((batch, cfg.sample_size, cfg.channels))?;
            Ok(seq.into_dyn())
        }
    }

    fn to_tokens(&self, d: ArrayViewD<f32>, batch: usize) -> Result<Array2<f32>> {
        let cfg = &self.config;

        if cfg.patch {
            patchify(d.into_dimensionality::<Ix4>()?, cfg.patch_size)
        } else {
            let rows = d.to_shape((batch * cfg.sample_size, cfg.channels))?;
            Ok(rows.into_owned())
        }
    }
}
