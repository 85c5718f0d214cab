use std::{f32::consts::TAU, fs, path::Path};

use ndarray::{Array1, ArrayD, ArrayViewD, Axis, Ix4, IxDyn, Slice};
use ndarray_rand::RandomExt;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Normal, Uniform};
use safetensors::SafeTensors;

use crate::{Result, TrainErr, tensors};

/// An in-memory dataset, samples stacked along the first axis.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    data: ArrayD<f32>,
}

impl TensorDataset {
    /// Creates a new dataset from stacked samples.
    ///
    /// # Returns
    /// An error if `data` is a scalar or holds no samples.
    pub fn new(data: ArrayD<f32>) -> Result<Self> {
        if data.ndim() < 2 || data.len_of(Axis(0)) == 0 {
            return Err(TrainErr::InvalidConfig(format!(
                "a dataset needs at least one sample of rank >= 1, got shape {:?}",
                data.shape()
            )));
        }

        Ok(Self { data })
    }

    /// Reads the float tensor `key` of a safetensors file.
    pub fn from_safetensors(path: &Path, key: &str) -> Result<Self> {
        let bytes = fs::read(path)?;
        let file = SafeTensors::deserialize(&bytes)?;
        let (shape, values) = tensors::read_f32(&file, key)?.ok_or_else(|| {
            TrainErr::InvalidConfig(format!("tensor `{key}` of {} isn't a float tensor", path.display()))
        })?;

        Self::new(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
    }

    /// Images made of a few random plane waves per channel.
    ///
    /// # Arguments
    /// * `len` - The amount of samples.
    /// * `shape` - The `(channels, height, width)` of a sample.
    /// * `seed` - The generator's seed.
    pub fn synthetic_image(len: usize, shape: &[usize], seed: u64) -> Result<Self> {
        let &[channels, height, width] = shape else {
            return Err(TrainErr::InvalidConfig(format!(
                "synthetic images need a (channels, height, width) shape, got {shape:?}"
            )));
        };

        let mut rng = StdRng::seed_from_u64(seed);
        let waves = Array1::random_using(len * channels * 4, Uniform::new(0f32, 1.)?, &mut rng);
        let mut data = ArrayD::zeros(IxDyn(&[len, channels, height, width]));

        for ((i, c, y, x), v) in data.view_mut().into_dimensionality::<Ix4>()?.indexed_iter_mut() {
            let k = (i * channels + c) * 4;
            let amp = 0.5 + waves[k];
            let (fx, fy) = (1. + 2. * waves[k + 1], 1. + 2. * waves[k + 2]);
            let phase = TAU * waves[k + 3];

            let arg = TAU * (fx * x as f32 / width as f32 + fy * y as f32 / height as f32) + phase;
            *v = amp * arg.sin();
        }

        Self::new(data)
    }

    /// Random walks, one per feature.
    ///
    /// # Arguments
    /// * `len` - The amount of samples.
    /// * `shape` - The `(tokens, features)` of a sample.
    /// * `seed` - The generator's seed.
    pub fn synthetic_sequence(len: usize, shape: &[usize], seed: u64) -> Result<Self> {
        let &[tokens, features] = shape else {
            return Err(TrainErr::InvalidConfig(format!(
                "synthetic sequences need a (tokens, features) shape, got {shape:?}"
            )));
        };

        let mut rng = StdRng::seed_from_u64(seed);
        let steps = Normal::new(0f32, 0.3)?;
        let mut data = ArrayD::random_using(IxDyn(&[len, tokens, features]), steps, &mut rng);
        data.accumulate_axis_inplace(Axis(1), |prev, cur| *cur += *prev);

        Self::new(data)
    }

    pub fn len(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shape of a single sample.
    pub fn sample_shape(&self) -> &[usize] {
        &self.data.shape()[1..]
    }

    /// Views the samples in `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> ArrayViewD<'_, f32> {
        self.data.slice_axis(Axis(0), Slice::from(start..end))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn synthetic_sources_are_seeded() {
        let a = TensorDataset::synthetic_image(4, &[3, 8, 8], 7).unwrap();
        let b = TensorDataset::synthetic_image(4, &[3, 8, 8], 7).unwrap();
        assert_eq!(a.slice(0, 4), b.slice(0, 4));
        assert_eq!(a.sample_shape(), [3, 8, 8]);

        let s = TensorDataset::synthetic_sequence(2, &[5, 3], 1).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.sample_shape(), [5, 3]);
    }

    #[test]
    fn synthetic_shapes_are_checked() {
        assert!(TensorDataset::synthetic_image(4, &[8, 8], 7).is_err());
        assert!(TensorDataset::synthetic_sequence(4, &[8, 8, 8], 7).is_err());
    }

    #[test]
    fn reads_a_safetensors_file() {
        let path = std::env::temp_dir().join(format!("flow_trainer_dataset_{}.safetensors", std::process::id()));
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let view = tensors::f32_view(vec![3, 2, 2], &values).unwrap();
        safetensors::serialize_to_file([("latents", view)], &None::<HashMap<String, String>>, &path).unwrap();

        let dataset = TensorDataset::from_safetensors(&path, "latents").unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.slice(1, 2).iter().copied().collect::<Vec<_>>(), [4.0, 5.0, 6.0, 7.0]);
        assert!(TensorDataset::from_safetensors(&path, "missing").is_err());
    }
}
