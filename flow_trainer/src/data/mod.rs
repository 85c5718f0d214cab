mod dataloader;
mod dataset;
mod shard;

pub use dataloader::DataLoader;
pub use dataset::TensorDataset;
pub use shard::{ShardSpec, shard_range};

use std::path::Path;

use ndarray::ArrayD;

use crate::{Result, TrainErr, config::TrainConfig};

/// A stream of raw training batches, restarted at every epoch.
pub trait DataSource: Send {
    /// Returns the next batch, or `None` once the epoch is exhausted.
    fn next_batch(&mut self) -> Option<Result<ArrayD<f32>>>;

    /// Rewinds to the start of the epoch.
    fn reset(&mut self);

    /// The shape of a single sample.
    fn sample_shape(&self) -> Vec<usize>;
}

/// Splits `safetensors:<path>[:key]` into its path and tensor key.
fn parse_safetensors_id(rest: &str) -> (&str, &str) {
    match rest.rsplit_once(':') {
        Some((path, key)) if !key.is_empty() && !key.contains(['/', '\\']) => (path, key),
        _ => (rest, "data"),
    }
}

/// Builds the data source a `data_id` names.
///
/// # Arguments
/// * `train` - The training config, holding the id, the batch size and the synthetic shapes.
/// * `shard` - This worker's shard.
///
/// # Returns
/// The loader, or an error if the id is unknown or the data can't be read.
pub fn build_source(train: &TrainConfig, shard: ShardSpec) -> Result<Box<dyn DataSource>> {
    let id = train.data_id.as_str();

    let dataset = match id {
        "synthetic_image" => TensorDataset::synthetic_image(train.data_len, &train.data_shape, train.seed)?,
        "synthetic_sequence" => {
            TensorDataset::synthetic_sequence(train.data_len, &train.data_shape, train.seed)?
        }
        _ => match id.strip_prefix("safetensors:") {
            Some(rest) => {
                let (path, key) = parse_safetensors_id(rest);
                TensorDataset::from_safetensors(Path::new(path), key)?
            }
            None => {
                return Err(TrainErr::Unknown {
                    kind: "data source",
                    name: id.to_string(),
                });
            }
        },
    };

    Ok(Box::new(DataLoader::new(dataset, shard, train.batch_size)?))
}
