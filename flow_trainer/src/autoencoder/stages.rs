use ndarray::{Array2, Array4, ArrayD, ArrayView2, ArrayView4, ArrayViewD, Ix3, Ix4};
use rectified_flow::arch::proj::{patchify, unpatchify};
use serde::{Deserialize, Serialize};

use super::Autoencoder;
use crate::{Result, TrainErr};

fn rank_err(stage: &str, expected: usize, got: &[usize]) -> TrainErr {
    TrainErr::Autoencoder(format!("the {stage} expects rank {expected} inputs, got shape {got:?}"))
}

/// Moves the channel axis of `(b, c, h, w)` last and flattens the rest.
fn channels_last(x: ArrayView4<f32>) -> Result<Array2<f32>> {
    let (b, c, h, w) = x.dim();
    let rows = x.permuted_axes([0, 2, 3, 1]).as_standard_layout().into_owned();
    Ok(rows.into_shape_with_order((b * h * w, c))?)
}

/// The inverse of `channels_last`.
fn channels_first(rows: Array2<f32>, b: usize, h: usize, w: usize) -> Result<Array4<f32>> {
    let c = rows.ncols();
    let grid = rows.into_shape_with_order((b, h, w, c))?;
    Ok(grid.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderStageConfig {
    pub in_channels: usize,
    pub hidden_channels: usize,
    pub patch_size: usize,
}

/// Folds `p x p` tiles of the image into hidden channels.
///
/// The `weight` is `(in_channels * p * p, hidden_channels)`, decoding goes
/// through its transpose.
#[derive(Debug, Clone)]
pub struct EncoderStage {
    config: EncoderStageConfig,
    weight: Array2<f32>,
}

impl EncoderStage {
    pub fn new(config: EncoderStageConfig, weight: Array2<f32>) -> Result<Self> {
        let expected = (config.in_channels * config.patch_size.pow(2), config.hidden_channels);
        if config.patch_size == 0 || weight.dim() != expected {
            return Err(TrainErr::Autoencoder(format!(
                "encoder stage weight is {:?}, expected {expected:?}",
                weight.dim()
            )));
        }

        Ok(Self { config, weight })
    }

    pub fn config(&self) -> &EncoderStageConfig {
        &self.config
    }

    pub fn encode(&self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (b, c, h, w) = x.dim();
        let p = self.config.patch_size;

        if c != self.config.in_channels || h % p != 0 || w % p != 0 || h != w {
            return Err(TrainErr::Autoencoder(format!(
                "the encoder stage can't take a {:?} batch",
                x.shape()
            )));
        }

        let hidden = patchify(x, p)?.dot(&self.weight);
        channels_first(hidden, b, h / p, w / p)
    }

    pub fn decode(&self, z: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (b, _, g, _) = z.dim();
        let p = self.config.patch_size;

        let tiles = channels_last(z)?.dot(&self.weight.t());
        Ok(unpatchify(tiles, b, self.config.in_channels, g * p, p)?)
    }
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentStageConfig {
    pub hidden_channels: usize,
    pub latent_channels: usize,
    /// The latent standard deviation the flow model is normalized by.
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Emit `(b, tokens, latent_channels)` sequences instead of grids.
    #[serde(default)]
    pub flatten: bool,
}

/// Mixes hidden channels into latent channels pixel by pixel.
///
/// The `weight` is `(latent_channels, hidden_channels)`.
#[derive(Debug, Clone)]
pub struct LatentStage {
    config: LatentStageConfig,
    weight: Array2<f32>,
}

impl LatentStage {
    pub fn new(config: LatentStageConfig, weight: Array2<f32>) -> Result<Self> {
        let expected = (config.latent_channels, config.hidden_channels);
        if weight.dim() != expected {
            return Err(TrainErr::Autoencoder(format!(
                "latent stage weight is {:?}, expected {expected:?}",
                weight.dim()
            )));
        }

        Ok(Self { config, weight })
    }

    pub fn config(&self) -> &LatentStageConfig {
        &self.config
    }

    pub fn encode(&self, h: ArrayView4<f32>) -> Result<ArrayD<f32>> {
        let (b, c, gh, gw) = h.dim();
        if c != self.config.hidden_channels {
            return Err(TrainErr::SizeMismatch {
                what: "latent stage channels",
                got: c,
                expected: self.config.hidden_channels,
            });
        }

        let latents = channels_last(h)?.dot(&self.weight.t());
        if self.config.flatten {
            let tokens = latents.into_shape_with_order((b, gh * gw, self.config.latent_channels))?;
            return Ok(tokens.into_dyn());
        }

        Ok(channels_first(latents, b, gh, gw)?.into_dyn())
    }

    /// # Arguments
    /// * `z` - The latents.
    /// * `side` - The side of the hidden grid, needed to unflatten sequences.
    pub fn decode(&self, z: ArrayViewD<f32>, side: usize) -> Result<Array4<f32>> {
        let shape = z.shape().to_vec();
        let grid = if self.config.flatten {
            let seq = z
                .into_dimensionality::<Ix3>()
                .map_err(|_| rank_err("latent stage", 3, &shape))?;
            let (b, n, c) = seq.dim();
            if n != side * side {
                return Err(TrainErr::SizeMismatch {
                    what: "latent tokens",
                    got: n,
                    expected: side * side,
                });
            }

            let rows = seq.as_standard_layout().into_owned().into_shape_with_order((b * n, c))?;
            channels_first(rows, b, side, side)?
        } else {
            z.into_dimensionality::<Ix4>()
                .map_err(|_| rank_err("latent stage", 4, &shape))?
                .to_owned()
        };

        let (b, _, gh, gw) = grid.dim();
        let hidden = channels_last(grid.view())?.dot(&self.weight);
        channels_first(hidden, b, gh, gw)
    }
}

/// An encoder stage followed by a latent stage.
#[derive(Debug, Clone)]
pub struct StagedAutoencoder {
    encoder: EncoderStage,
    latent: LatentStage,
    side: usize,
}

impl StagedAutoencoder {
    /// Chains two stages.
    ///
    /// # Arguments
    /// * `side` - The side of the raw images.
    pub fn new(encoder: EncoderStage, latent: LatentStage, side: usize) -> Result<Self> {
        if encoder.config().hidden_channels != latent.config().hidden_channels {
            return Err(TrainErr::Autoencoder(format!(
                "the encoder stage emits {} channels but the latent stage takes {}",
                encoder.config().hidden_channels,
                latent.config().hidden_channels
            )));
        }

        if side % encoder.config().patch_size != 0 {
            return Err(TrainErr::Autoencoder(format!(
                "images of side {side} can't be split into tiles of {}",
                encoder.config().patch_size
            )));
        }

        Ok(Self {
            encoder,
            latent,
            side,
        })
    }

    fn hidden_side(&self) -> usize {
        self.side / self.encoder.config().patch_size
    }
}

impl Autoencoder for StagedAutoencoder {
    fn encode(&self, x: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        let shape = x.shape().to_vec();
        let x = x
            .into_dimensionality::<Ix4>()
            .map_err(|_| rank_err("encoder stage", 4, &shape))?;

        let hidden = self.encoder.encode(x)?;
        self.latent.encode(hidden.view())
    }

    fn decode(&self, z: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        let hidden = self.latent.decode(z, self.hidden_side())?;
        Ok(self.encoder.decode(hidden.view())?.into_dyn())
    }

    fn scale(&self) -> f32 {
        self.latent.config().scale
    }
}

/// Views a flat `weight` of `shape` as a matrix.
pub(super) fn weight_matrix(shape: &[usize], values: Vec<f32>) -> Result<Array2<f32>> {
    let &[rows, cols] = shape else {
        return Err(TrainErr::Autoencoder(format!("stage weights must be matrices, got shape {shape:?}")));
    };

    Ok(ArrayView2::from_shape((rows, cols), &values)?.to_owned())
}
