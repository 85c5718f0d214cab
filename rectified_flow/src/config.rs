use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

fn default_mlp_ratio() -> usize {
    4
}

fn default_patch_size() -> usize {
    1
}

fn default_t_freq_dim() -> usize {
    256
}

/// The immutable description of a denoiser.
///
/// `sample_size` is the latent side length when `patch` is set (inputs are
/// `(b, channels, sample_size, sample_size)`) and the sequence length otherwise
/// (inputs are `(b, sample_size, channels)`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub channels: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub sample_size: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: usize,
    #[serde(default)]
    pub patch: bool,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default)]
    pub uvit: bool,
    #[serde(default = "default_t_freq_dim")]
    pub t_freq_dim: usize,
}

impl ModelConfig {
    /// Checks that every size in the config is coherent with the others.
    ///
    /// # Returns
    /// An `InvalidConfig` error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("channels", self.channels),
            ("d_model", self.d_model),
            ("n_heads", self.n_heads),
            ("n_layers", self.n_layers),
            ("sample_size", self.sample_size),
            ("mlp_ratio", self.mlp_ratio),
            ("patch_size", self.patch_size),
            ("t_freq_dim", self.t_freq_dim),
        ];

        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(MlErr::InvalidConfig(format!("{name} must be greater than 0")));
        }

        if self.d_model % self.n_heads != 0 {
            return Err(MlErr::InvalidConfig(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }

        if self.t_freq_dim % 2 != 0 {
            return Err(MlErr::InvalidConfig(format!(
                "t_freq_dim ({}) must be even",
                self.t_freq_dim
            )));
        }

        if self.patch {
            if self.sample_size % self.patch_size != 0 {
                return Err(MlErr::InvalidConfig(format!(
                    "sample_size ({}) must be divisible by patch_size ({})",
                    self.sample_size, self.patch_size
                )));
            }

            if self.d_model % 4 != 0 {
                return Err(MlErr::InvalidConfig(format!(
                    "d_model ({}) must be divisible by 4 in patch mode",
                    self.d_model
                )));
            }
        }

        Ok(())
    }

    /// The amount of tokens the backbone sees per example.
    pub fn tokens(&self) -> usize {
        if self.patch {
            let grid = self.sample_size / self.patch_size;
            grid * grid
        } else {
            self.sample_size
        }
    }

    /// The width of a single input token before projection.
    pub fn token_dim(&self) -> usize {
        if self.patch {
            self.channels * self.patch_size * self.patch_size
        } else {
            self.channels
        }
    }

    /// The expected per-example shape of the input, excluding the batch axis.
    pub fn sample_shape(&self) -> Vec<usize> {
        if self.patch {
            vec![self.channels, self.sample_size, self.sample_size]
        } else {
            vec![self.sample_size, self.channels]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ModelConfig {
        ModelConfig {
            channels: 4,
            d_model: 32,
            n_heads: 4,
            n_layers: 2,
            sample_size: 8,
            mlp_ratio: 4,
            patch: true,
            patch_size: 2,
            uvit: false,
            t_freq_dim: 16,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
        assert_eq!(base().tokens(), 16);
        assert_eq!(base().token_dim(), 16);
    }

    #[test]
    fn heads_must_divide_width() {
        let cfg = ModelConfig {
            n_heads: 3,
            ..base()
        };
        assert!(matches!(cfg.validate(), Err(MlErr::InvalidConfig(_))));
    }

    #[test]
    fn patch_must_divide_sample_size() {
        let cfg = ModelConfig {
            patch_size: 3,
            ..base()
        };
        assert!(cfg.validate().is_err());

        let cfg = ModelConfig {
            patch: false,
            patch_size: 3,
            ..base()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.tokens(), 8);
        assert_eq!(cfg.token_dim(), 4);
    }

    #[test]
    fn defaults_are_filled_from_json() {
        let cfg: ModelConfig = serde_json::from_str(
            r#"{"channels": 4, "d_model": 32, "n_heads": 4, "n_layers": 2, "sample_size": 8}"#,
        )
        .unwrap();

        assert_eq!(cfg.mlp_ratio, 4);
        assert_eq!(cfg.patch_size, 1);
        assert_eq!(cfg.t_freq_dim, 256);
        assert!(!cfg.patch);
        assert!(!cfg.uvit);
    }
}
