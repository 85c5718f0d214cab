use ndarray::{Array2, ArrayView2};

use super::Linear;
use crate::{
    Result,
    arch::{
        activations::{ActFn, Activation},
        layout::ParamScope,
    },
};

/// The position-wise feed forward network `Linear -> GELU -> Linear`.
#[derive(Debug, Clone)]
pub struct Mlp {
    fc1: Linear,
    act: Activation,
    fc2: Linear,
}

impl Mlp {
    pub fn new(scope: &mut ParamScope, d_model: usize, ratio: usize) -> Self {
        let hidden = d_model * ratio;

        Self {
            fc1: Linear::new(&mut scope.scope("fc1"), (d_model, hidden), true),
            act: Activation::new(ActFn::Gelu),
            fc2: Linear::new(&mut scope.scope("fc2"), (hidden, d_model), true),
        }
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Result<Array2<f32>> {
        let h = self.fc1.forward(params, x)?;
        let a = self.act.forward(h);
        self.fc2.forward(params, a)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let da = self.fc2.backward(params, grad, d)?;
        let dh = self.act.backward(da.view())?;
        self.fc1.backward(params, grad, dh.view())
    }
}

#[cfg(test)]
mod tests {
    use ndarray_rand::RandomExt;
    use rand::{SeedableRng, rngs::StdRng};
    use rand_distr::StandardNormal;

    use super::*;
    use crate::arch::ParamLayout;

    #[test]
    fn parameter_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut layout = ParamLayout::new();
        let mut mlp = Mlp::new(&mut layout.root(), 3, 2);
        let params = layout.init_params(&mut rng).unwrap();

        let x = Array2::<f32>::random_using((4, 3), StandardNormal, &mut rng);
        let w = Array2::<f32>::random_using((4, 3), StandardNormal, &mut rng);

        let probe = mlp.clone();
        let loss = |params: &[f32]| {
            let mut mlp = probe.clone();
            (mlp.forward(params, x.clone()).unwrap() * &w).sum()
        };

        let mut grad = vec![0.0; layout.len()];
        mlp.forward(&params, x.clone()).unwrap();
        mlp.backward(&params, &mut grad, w.view()).unwrap();

        let h = 1e-2;
        for i in (0..params.len()).step_by(3) {
            let mut pp = params.clone();
            let mut pm = params.clone();
            pp[i] += h;
            pm[i] -= h;
            let numeric = (loss(&pp) - loss(&pm)) / (2. * h);
            assert!((grad[i] - numeric).abs() < 2e-2, "param {i}: {} vs {numeric}", grad[i]);
        }
    }
}
