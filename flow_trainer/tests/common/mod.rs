#![allow(dead_code)]

use std::{fs, path::Path, path::PathBuf, sync::Arc};

use flow_trainer::{
    RunConfig, Trainer,
    collective::SingleProcess,
    data::{self, DataSource, ShardSpec},
};
use ndarray::ArrayD;
use serde_json::json;

/// A fresh directory under the system's temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("flow_trainer_{name}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// A tiny patch model over 2x4x4 synthetic images, two micro-steps per update.
pub fn small_config(checkpoint_dir: &Path) -> RunConfig {
    serde_json::from_value(json!({
        "model": {
            "channels": 2, "d_model": 16, "n_heads": 2, "n_layers": 1, "sample_size": 4,
            "mlp_ratio": 2, "patch": true, "patch_size": 2, "t_freq_dim": 16
        },
        "train": {
            "batch_size": 2, "target_batch_size": 4, "data_id": "synthetic_image",
            "data_shape": [2, 4, 4], "data_len": 16, "sample_steps": 2,
            "checkpoint_dir": checkpoint_dir, "seed": 7
        }
    }))
    .unwrap()
}

pub fn prepared_trainer(config: RunConfig) -> Trainer {
    let mut trainer = Trainer::new(config, Arc::new(SingleProcess)).unwrap();
    trainer.prepare().unwrap();
    trainer
}

pub fn source(config: &RunConfig) -> Box<dyn DataSource> {
    data::build_source(&config.train, ShardSpec::whole()).unwrap()
}

pub fn next(source: &mut dyn DataSource) -> ArrayD<f32> {
    if let Some(batch) = source.next_batch() {
        return batch.unwrap();
    }

    source.reset();
    source.next_batch().unwrap().unwrap()
}
