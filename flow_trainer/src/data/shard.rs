use std::{num::NonZeroUsize, ops::Range};

use crate::{Result, TrainErr};

/// Splits `total` samples among `num_workers` and returns the shard for `worker_id`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and of equal size.
/// - The `total % num_workers` trailing samples belong to no shard, so every
///   worker runs the same number of steps.
pub fn shard_range(total: usize, worker_id: usize, num_workers: NonZeroUsize) -> Range<usize> {
    let size = total / num_workers.get();
    let start = worker_id * size;
    start..start + size
}

/// Shard specification for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub worker_id: usize,
    pub num_workers: NonZeroUsize,
}

impl ShardSpec {
    pub fn new(worker_id: usize, num_workers: usize) -> Result<Self> {
        match NonZeroUsize::new(num_workers) {
            Some(num_workers) if worker_id < num_workers.get() => Ok(Self {
                worker_id,
                num_workers,
            }),
            _ => Err(TrainErr::InvalidConfig(format!(
                "worker {worker_id} doesn't belong to a group of {num_workers}"
            ))),
        }
    }

    /// The shard of the only worker.
    pub fn whole() -> Self {
        Self {
            worker_id: 0,
            num_workers: NonZeroUsize::MIN,
        }
    }

    #[inline]
    pub fn range(self, total: usize) -> Range<usize> {
        shard_range(total, self.worker_id, self.num_workers)
    }
}
