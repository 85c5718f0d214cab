use std::{fs, path::Path};

use log::{debug, info};
use safetensors::SafeTensors;
use serde::de::DeserializeOwned;

use super::stages::{
    EncoderStage, EncoderStageConfig, LatentStage, LatentStageConfig, StagedAutoencoder, weight_matrix,
};
use crate::{Result, TrainErr, config::StagePaths, tensors};

const SCALE_TOLERANCE: f32 = 1e-6;

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn read_weight(path: &Path) -> Result<ndarray::Array2<f32>> {
    let bytes = fs::read(path)?;
    let file = SafeTensors::deserialize(&bytes)?;
    let (shape, values) = tensors::read_f32(&file, "weight")?.ok_or_else(|| {
        TrainErr::Autoencoder(format!("the weight of {} isn't a float tensor", path.display()))
    })?;

    weight_matrix(&shape, values)
}

/// Assembles a `StagedAutoencoder` from two config/checkpoint pairs.
#[derive(Debug, Clone, Default)]
pub struct AutoencoderBuilder {
    encoder_stage: Option<StagePaths>,
    latent_stage: Option<StagePaths>,
    side: Option<usize>,
}

impl AutoencoderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stage folding image tiles into hidden channels.
    pub fn encoder_stage(mut self, paths: StagePaths) -> Self {
        self.encoder_stage = Some(paths);
        self
    }

    /// The stage mixing hidden channels into latents.
    pub fn latent_stage(mut self, paths: StagePaths) -> Self {
        self.latent_stage = Some(paths);
        self
    }

    /// The side of the raw images, 16 if unset.
    pub fn image_side(mut self, side: usize) -> Self {
        self.side = Some(side);
        self
    }

    /// Loads both stages.
    ///
    /// # Arguments
    /// * `vae_scale` - The scale the run divides latents by, it must match
    ///   the one the latent stage was trained with.
    ///
    /// # Returns
    /// The autoencoder or an error if a stage is missing, can't be read or
    /// doesn't fit the other one.
    pub fn build(self, vae_scale: f32) -> Result<StagedAutoencoder> {
        let missing = |stage: &str| TrainErr::Autoencoder(format!("the {stage} wasn't set"));
        let encoder_paths = self.encoder_stage.ok_or_else(|| missing("encoder stage"))?;
        let latent_paths = self.latent_stage.ok_or_else(|| missing("latent stage"))?;

        let encoder_config: EncoderStageConfig = read_config(&encoder_paths.config)?;
        let latent_config: LatentStageConfig = read_config(&latent_paths.config)?;
        debug!("read autoencoder stage configs: {encoder_config:?} {latent_config:?}");

        if (latent_config.scale - vae_scale).abs() > SCALE_TOLERANCE * latent_config.scale.abs().max(1.) {
            return Err(TrainErr::Autoencoder(format!(
                "vae_scale is {vae_scale} but the latent stage was trained with {}",
                latent_config.scale
            )));
        }

        let encoder = EncoderStage::new(encoder_config, read_weight(&encoder_paths.checkpoint)?)?;
        let latent = LatentStage::new(latent_config, read_weight(&latent_paths.checkpoint)?)?;
        let ae = StagedAutoencoder::new(encoder, latent, self.side.unwrap_or(16))?;

        info!(scale = vae_scale; "loaded frozen autoencoder");
        Ok(ae)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf};

    use ndarray::{ArrayD, IxDyn};
    use serde_json::json;

    use super::*;
    use crate::autoencoder::Autoencoder;

    fn write_stage(dir: &Path, name: &str, config: serde_json::Value, shape: Vec<usize>) -> StagePaths {
        let values: Vec<f32> = (0..shape.iter().product::<usize>()).map(|v| (v % 3) as f32 - 1.).collect();
        let config_path = dir.join(format!("{name}.json"));
        let checkpoint = dir.join(format!("{name}.safetensors"));

        fs::write(&config_path, config.to_string()).unwrap();
        let view = tensors::f32_view(shape, &values).unwrap();
        safetensors::serialize_to_file([("weight", view)], &None::<HashMap<String, String>>, &checkpoint).unwrap();

        StagePaths {
            config: config_path,
            checkpoint,
        }
    }

    fn stages(dir: &PathBuf) -> AutoencoderBuilder {
        fs::create_dir_all(dir).unwrap();
        let encoder = write_stage(
            dir,
            "encoder",
            json!({"in_channels": 3, "hidden_channels": 8, "patch_size": 2}),
            vec![12, 8],
        );
        let latent = write_stage(
            dir,
            "latent",
            json!({"hidden_channels": 8, "latent_channels": 4, "scale": 0.25}),
            vec![4, 8],
        );

        AutoencoderBuilder::new()
            .encoder_stage(encoder)
            .latent_stage(latent)
            .image_side(8)
    }

    #[test]
    fn builds_from_both_stages() {
        let dir = std::env::temp_dir().join(format!("flow_trainer_ae_{}", std::process::id()));
        let ae = stages(&dir).build(0.25).unwrap();

        let z = ae.encode(ArrayD::ones(IxDyn(&[2, 3, 8, 8])).view()).unwrap();
        assert_eq!(z.shape(), [2, 4, 4, 4]);
        assert_eq!(ae.decode(z.view()).unwrap().shape(), [2, 3, 8, 8]);
        assert_eq!(ae.scale(), 0.25);
    }

    #[test]
    fn scale_mismatch_fails() {
        let dir = std::env::temp_dir().join(format!("flow_trainer_ae_scale_{}", std::process::id()));
        assert!(matches!(stages(&dir).build(0.18215), Err(TrainErr::Autoencoder(_))));
    }

    #[test]
    fn missing_stages_fail() {
        assert!(AutoencoderBuilder::new().build(1.).is_err());
    }
}
