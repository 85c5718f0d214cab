use std::sync::Arc;

use ndarray::ArrayViewD;
use rand::Rng;
use rayon::prelude::*;
use rectified_flow::FlowModel;

use crate::{Result, collective::Collective};

/// The model as seen by the training loop.
///
/// A `Replicated` model averages every backward pass's gradient across the
/// group before adding it to the caller's accumulation buffer.
pub enum ModelHandle {
    Local(FlowModel),
    Replicated {
        model: FlowModel,
        collective: Arc<dyn Collective>,
        scratch: Vec<f32>,
    },
}

impl ModelHandle {
    /// Wraps `model` for the given group, replicating it only when the
    /// group has more than one member.
    pub fn new(model: FlowModel, collective: Arc<dyn Collective>) -> Self {
        if collective.world_size() == 1 {
            return Self::Local(model);
        }

        let scratch = vec![0.; model.num_params()];
        Self::Replicated {
            model,
            collective,
            scratch,
        }
    }

    /// The wrapped model, for the parts of training that run outside the
    /// replication (EMA, sampling, checkpoints).
    pub fn unwrapped_model(&self) -> &FlowModel {
        match self {
            Self::Local(model) | Self::Replicated { model, .. } => model,
        }
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, Self::Replicated { .. })
    }

    pub fn forward<R: Rng + ?Sized>(
        &mut self,
        params: &[f32],
        x: ArrayViewD<f32>,
        rng: &mut R,
    ) -> Result<f32> {
        let model = match self {
            Self::Local(model) | Self::Replicated { model, .. } => model,
        };

        Ok(model.forward(params, x, rng)?)
    }

    /// Accumulates `seed * dL/dparams` into `grad`, averaged across the group
    /// when replicated.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], seed: f32) -> Result<()> {
        match self {
            Self::Local(model) => model.backward(params, grad, seed)?,
            Self::Replicated {
                model,
                collective,
                scratch,
            } => {
                scratch.fill(0.);
                model.backward(params, scratch, seed)?;
                collective.all_reduce_mean(scratch)?;

                grad.par_iter_mut().zip(scratch.par_iter()).for_each(|(g, s)| *g += s);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};
    use rand::{SeedableRng, rngs::StdRng};
    use rectified_flow::ModelConfig;

    use super::*;
    use crate::collective::{SingleProcess, launch};

    fn config() -> ModelConfig {
        ModelConfig {
            channels: 2,
            d_model: 8,
            n_heads: 2,
            n_layers: 1,
            sample_size: 3,
            mlp_ratio: 2,
            patch: false,
            patch_size: 1,
            uvit: false,
            t_freq_dim: 8,
        }
    }

    #[test]
    fn single_workers_stay_local() {
        let model = FlowModel::new(&config()).unwrap();
        let handle = ModelHandle::new(model, Arc::new(SingleProcess));
        assert!(!handle.is_replicated());
    }

    #[test]
    fn replicated_gradients_are_the_group_mean() {
        let grads = launch(2, |member| {
            let mut handle = ModelHandle::new(FlowModel::new(&config())?, Arc::new(member.clone()));
            let params = handle.unwrapped_model().init_params(&mut StdRng::seed_from_u64(0))?;
            let mut rng = StdRng::seed_from_u64(10 + member.rank() as u64);

            let x = ArrayD::from_elem(IxDyn(&[2, 3, 2]), member.rank() as f32);
            let mut grad = vec![1.0; params.len()];
            handle.forward(&params, x.view(), &mut rng)?;
            handle.backward(&params, &mut grad, 1.0)?;
            Ok(grad)
        })
        .unwrap();

        assert_eq!(grads[0], grads[1]);
        assert!(grads[0].iter().any(|g| *g != 1.0));
    }
}
