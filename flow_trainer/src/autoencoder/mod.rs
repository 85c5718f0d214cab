//! The frozen encoder/decoder mapping raw data to the latents the flow
//! model is trained on.

mod builder;
mod stages;

pub use builder::AutoencoderBuilder;
pub use stages::{EncoderStage, EncoderStageConfig, LatentStage, LatentStageConfig, StagedAutoencoder};

use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD};

use crate::{Result, config::TrainConfig};

/// A pretrained, frozen autoencoder.
pub trait Autoencoder: Send + Sync {
    /// Maps a raw batch to its latents.
    fn encode(&self, x: ArrayViewD<f32>) -> Result<ArrayD<f32>>;

    /// Maps latents back to raw data.
    fn decode(&self, z: ArrayViewD<f32>) -> Result<ArrayD<f32>>;

    /// The factor latents are divided by before entering the flow model.
    fn scale(&self) -> f32;
}

/// Uses the raw data as latents.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    scale: f32,
}

impl Identity {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl Autoencoder for Identity {
    fn encode(&self, x: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        Ok(x.to_owned())
    }

    fn decode(&self, z: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        Ok(z.to_owned())
    }

    fn scale(&self) -> f32 {
        self.scale
    }
}

/// Builds the configured autoencoder, or an `Identity` when none is.
pub fn build_autoencoder(train: &TrainConfig) -> Result<Arc<dyn Autoencoder>> {
    match &train.autoencoder {
        Some(paths) => {
            let ae = AutoencoderBuilder::new()
                .encoder_stage(paths.encoder_stage.clone())
                .latent_stage(paths.latent_stage.clone())
                .image_side(train.data_shape.last().copied().unwrap_or(16))
                .build(train.vae_scale)?;

            Ok(Arc::new(ae))
        }
        None => Ok(Arc::new(Identity::new(train.vae_scale))),
    }
}
