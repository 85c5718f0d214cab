use std::{fs, path::Path, path::PathBuf};

use rectified_flow::{ModelConfig, Precision};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{Result, TrainErr};

/// Returns the amount of micro-steps summed into each optimizer update.
///
/// # Arguments
/// * `target_batch_size` - The effective batch size of an update.
/// * `batch_size` - The batch size of a single micro-step.
pub fn accumulation_steps(target_batch_size: usize, batch_size: usize) -> usize {
    (target_batch_size / batch_size.max(1)).max(1)
}

/// Reads a keyword map into the typed arguments of a `kind` of component.
pub(crate) fn parse_kwargs<T: DeserializeOwned>(
    kind: &'static str,
    kwargs: &Map<String, Value>,
) -> Result<T> {
    serde_json::from_value(Value::Object(kwargs.clone())).map_err(|e| TrainErr::InvalidKwargs {
        kind,
        msg: e.to_string(),
    })
}

/// When the global gradient norm is clipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipPolicy {
    /// Clip unless the optimizer already normalizes its updates.
    #[default]
    Auto,
    Always,
    Never,
}

/// Where the leader's metric records go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    pub beta: f32,
    pub update_after_step: u64,
    pub update_every: u64,
    pub inv_gamma: f32,
    pub power: f32,
    pub min_value: f32,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            beta: 0.999,
            update_after_step: 0,
            update_every: 1,
            inv_gamma: 1.,
            power: 2. / 3.,
            min_value: 0.,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub enabled: bool,
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: u32,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_scale: 65_536.,
            growth_factor: 2.,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

/// A frozen autoencoder stage: its JSON config and its safetensors weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePaths {
    pub config: PathBuf,
    pub checkpoint: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoencoderPaths {
    pub encoder_stage: StagePaths,
    pub latent_stage: StagePaths,
}

fn default_epochs() -> usize {
    1
}

fn default_opt() -> String {
    "adamw".into()
}

fn default_max_grad_norm() -> f32 {
    1.0
}

fn default_vae_scale() -> f32 {
    1.0
}

fn default_sampler_id() -> String {
    "euler".into()
}

fn default_sample_steps() -> usize {
    16
}

fn default_interval() -> u64 {
    1000
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_data_shape() -> Vec<usize> {
    vec![3, 16, 16]
}

fn default_data_len() -> usize {
    256
}

/// Everything the training loop needs besides the model itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// The effective batch size of an update, `0` disables accumulation.
    #[serde(default)]
    pub target_batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub max_steps: Option<u64>,

    #[serde(default = "default_opt")]
    pub opt: String,
    #[serde(default)]
    pub opt_kwargs: Map<String, Value>,
    #[serde(default)]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub scheduler_kwargs: Map<String, Value>,

    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f32,
    #[serde(default)]
    pub clip_policy: ClipPolicy,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub ema: EmaConfig,
    #[serde(default)]
    pub scaler: ScalerConfig,

    pub data_id: String,
    /// Per-sample shape of the synthetic sources.
    #[serde(default = "default_data_shape")]
    pub data_shape: Vec<usize>,
    /// Amount of samples of the synthetic sources.
    #[serde(default = "default_data_len")]
    pub data_len: usize,

    #[serde(default)]
    pub autoencoder: Option<AutoencoderPaths>,
    #[serde(default = "default_vae_scale")]
    pub vae_scale: f32,

    #[serde(default = "default_sampler_id")]
    pub sampler_id: String,
    #[serde(default = "default_sample_steps")]
    pub sample_steps: usize,
    #[serde(default = "default_interval")]
    pub sample_interval: u64,
    #[serde(default = "default_interval")]
    pub save_interval: u64,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub resume_ckpt: Option<PathBuf>,

    #[serde(default)]
    pub seed: u64,
}

impl TrainConfig {
    pub fn accumulation_steps(&self) -> usize {
        accumulation_steps(self.target_batch_size, self.batch_size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub sink: SinkKind,
    /// The JSON-lines file, required by the `jsonl` sink.
    pub path: Option<PathBuf>,
    pub run_name: Option<String>,
}

/// The whole description of a run, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub train: TrainConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(TrainErr::InvalidConfig(msg.into()))
}

impl RunConfig {
    /// Reads and validates a run config.
    ///
    /// # Arguments
    /// * `path` - The JSON file's path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the config before anything gets built from it.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        let train = &self.train;

        if train.batch_size == 0 {
            return invalid("batch_size must be greater than 0");
        }

        if train.epochs == 0 {
            return invalid("epochs must be greater than 0");
        }

        if train.sample_interval == 0 || train.save_interval == 0 {
            return invalid("sample_interval and save_interval must be greater than 0");
        }

        if train.sample_steps == 0 {
            return invalid("sample_steps must be greater than 0");
        }

        if !train.vae_scale.is_finite() || train.vae_scale == 0. {
            return invalid(format!("vae_scale must be finite and non zero, got {}", train.vae_scale));
        }

        if !(train.max_grad_norm > 0.) {
            return invalid("max_grad_norm must be positive");
        }

        let ema = &train.ema;
        if !(0. ..=1.).contains(&ema.beta) || ema.update_every == 0 || ema.inv_gamma <= 0. {
            return invalid("ema needs beta in [0, 1], update_every > 0 and inv_gamma > 0");
        }

        let scaler = &train.scaler;
        if scaler.init_scale <= 0. || scaler.growth_factor <= 1. || !(0. ..1.).contains(&scaler.backoff_factor) {
            return invalid("scaler needs init_scale > 0, growth_factor > 1 and backoff_factor in [0, 1)");
        }

        if scaler.growth_interval == 0 {
            return invalid("scaler growth_interval must be greater than 0");
        }

        let synthetic = train.data_id.starts_with("synthetic_");
        if synthetic && train.autoencoder.is_none() && train.data_shape != self.model.sample_shape() {
            return invalid(format!(
                "without an autoencoder the synthetic samples must have the model's shape {:?}, got {:?}",
                self.model.sample_shape(),
                train.data_shape
            ));
        }

        if self.logging.sink == SinkKind::Jsonl && self.logging.path.is_none() {
            return invalid("the jsonl sink needs a path");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "model": {"channels": 4, "d_model": 32, "n_heads": 4, "n_layers": 2, "sample_size": 8, "patch": true, "patch_size": 2},
        "train": {"batch_size": 8, "target_batch_size": 64, "data_id": "synthetic_image", "data_shape": [4, 8, 8]}
    }"#;

    #[test]
    fn accumulation_is_at_least_one() {
        assert_eq!(accumulation_steps(64, 8), 8);
        assert_eq!(accumulation_steps(4, 8), 1);
        assert_eq!(accumulation_steps(0, 8), 1);
        assert_eq!(accumulation_steps(70, 8), 8);
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: RunConfig = serde_json::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        let train = &config.train;
        assert_eq!(train.accumulation_steps(), 8);
        assert_eq!(train.opt, "adamw");
        assert_eq!(train.clip_policy, ClipPolicy::Auto);
        assert_eq!(train.precision, Precision::Bf16);
        assert_eq!(train.ema.beta, 0.999);
        assert_eq!(train.scaler.init_scale, 65_536.);
        assert_eq!(config.logging.sink, SinkKind::Log);
    }

    #[test]
    fn jsonl_sink_needs_a_path() {
        let mut config: RunConfig = serde_json::from_str(MINIMAL).unwrap();
        config.logging.sink = SinkKind::Jsonl;
        assert!(matches!(config.validate(), Err(TrainErr::InvalidConfig(_))));
    }

    #[test]
    fn zero_vae_scale_is_rejected() {
        let mut config: RunConfig = serde_json::from_str(MINIMAL).unwrap();
        config.train.vae_scale = 0.;
        assert!(config.validate().is_err());
    }

    #[test]
    fn synthetic_data_must_fit_the_model() {
        let mut config: RunConfig = serde_json::from_str(MINIMAL).unwrap();
        config.train.data_shape = vec![3, 16, 16];
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_model_is_rejected() {
        let mut config: RunConfig = serde_json::from_str(MINIMAL).unwrap();
        config.model.n_heads = 5;
        assert!(matches!(config.validate(), Err(TrainErr::Model(_))));
    }
}
