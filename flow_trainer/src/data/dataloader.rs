use std::ops::Range;

use ndarray::ArrayD;

use super::{DataSource, ShardSpec, TensorDataset};
use crate::{Result, TrainErr};

/// Shard-aware DataLoader producing owned batches.
///
/// Every batch holds exactly `batch_size` samples, a short tail of the shard
/// is skipped.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: TensorDataset,
    shard: ShardSpec,
    shard_range: Range<usize>,
    batch_size: usize,
    cursor: usize, // absolute index in dataset
}

impl DataLoader {
    /// Creates a new `DataLoader`.
    ///
    /// # Returns
    /// An error if the batch size is zero or the shard can't fill a batch.
    pub fn new(dataset: TensorDataset, shard: ShardSpec, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainErr::InvalidConfig("batch_size must be greater than 0".into()));
        }

        let shard_range = shard.range(dataset.len());
        if shard_range.len() < batch_size {
            return Err(TrainErr::InvalidConfig(format!(
                "{} samples split across {} workers can't fill a batch of {batch_size}",
                dataset.len(),
                shard.num_workers
            )));
        }

        let cursor = shard_range.start;

        Ok(Self {
            dataset,
            shard,
            shard_range,
            batch_size,
            cursor,
        })
    }

    #[inline]
    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    #[inline]
    pub fn shard_range(&self) -> Range<usize> {
        self.shard_range.clone()
    }

    /// The amount of batches in an epoch.
    pub fn batches(&self) -> usize {
        self.shard_range.len() / self.batch_size
    }
}

impl DataSource for DataLoader {
    fn next_batch(&mut self) -> Option<Result<ArrayD<f32>>> {
        let end = self.cursor + self.batch_size;
        if end > self.shard_range.end {
            return None;
        }

        let batch = self.dataset.slice(self.cursor, end).to_owned();

        self.cursor = end;
        Some(Ok(batch))
    }

    fn reset(&mut self) {
        self.cursor = self.shard_range.start;
    }

    fn sample_shape(&self) -> Vec<usize> {
        self.dataset.sample_shape().to_vec()
    }
}
