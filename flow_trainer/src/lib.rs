pub mod autoencoder;
pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod data;
pub mod ema;
pub mod error;
pub mod metrics;
pub mod optimization;
pub mod sampler;
pub mod scaler;
pub mod scheduler;
pub mod tensors;
pub mod trainer;

pub use config::RunConfig;
pub use error::{Result, TrainErr};
pub use trainer::Trainer;

use std::sync::Arc;

use log::info;

use crate::{
    collective::{Collective, SingleProcess},
    data::ShardSpec,
};

/// Trains a single worker of the group `collective` belongs to.
///
/// # Returns
/// The amount of completed updates.
pub fn train_worker(config: RunConfig, collective: Arc<dyn Collective>) -> Result<u64> {
    let shard = ShardSpec::new(collective.rank(), collective.world_size())?;
    let mut source = data::build_source(&config.train, shard)?;

    let mut trainer = Trainer::new(config, collective)?;
    trainer.prepare()?;
    trainer.train(source.as_mut())
}

/// Runs a whole training run on `world_size` in-process workers.
///
/// # Returns
/// The amount of completed updates, equal across workers.
pub fn run(config: RunConfig, world_size: usize) -> Result<u64> {
    config.validate()?;
    info!(world_size = world_size, data = config.train.data_id.as_str(); "starting run");

    if world_size <= 1 {
        return train_worker(config, Arc::new(SingleProcess));
    }

    let steps = collective::launch(world_size, |member| {
        train_worker(config.clone(), Arc::new(member))
    })?;

    Ok(steps.into_iter().next().unwrap_or_default())
}
