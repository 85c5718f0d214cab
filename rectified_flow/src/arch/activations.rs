use ndarray::{Array2, ArrayView2};

use crate::{MlErr, Result};

const GELU_C: f32 = 0.797_884_6; // sqrt(2 / pi)
const GELU_K: f32 = 0.044_715;

/// Logistic sigmoid.
#[inline]
pub fn sigmoid(z: f32) -> f32 {
    1. / (1. + (-z).exp())
}

/// Element-wise activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActFn {
    /// `x * sigmoid(x)`.
    Silu,
    /// Tanh approximation of the gaussian error linear unit.
    Gelu,
}

impl ActFn {
    pub fn f(&self, x: f32) -> f32 {
        match self {
            ActFn::Silu => x * sigmoid(x),
            ActFn::Gelu => {
                let u = GELU_C * (x + GELU_K * x.powi(3));
                0.5 * x * (1. + u.tanh())
            }
        }
    }

    pub fn df(&self, x: f32) -> f32 {
        match self {
            ActFn::Silu => {
                let s = sigmoid(x);
                s * (1. + x * (1. - s))
            }
            ActFn::Gelu => {
                let u = GELU_C * (x + GELU_K * x.powi(3));
                let th = u.tanh();
                let du = GELU_C * (1. + 3. * GELU_K * x.powi(2));
                0.5 * (1. + th) + 0.5 * x * (1. - th * th) * du
            }
        }
    }
}

/// A parameterless layer applying an `ActFn`, keeping its input for the backward pass.
#[derive(Debug, Clone)]
pub struct Activation {
    act_fn: ActFn,
    z: Option<Array2<f32>>,
}

impl Activation {
    pub fn new(act_fn: ActFn) -> Self {
        Self { act_fn, z: None }
    }

    pub fn forward(&mut self, z: Array2<f32>) -> Array2<f32> {
        let act_fn = self.act_fn;
        let a = z.mapv(|z| act_fn.f(z));
        self.z = Some(z);
        a
    }

    pub fn backward(&mut self, d: ArrayView2<f32>) -> Result<Array2<f32>> {
        let z = self.z.take().ok_or(MlErr::BackwardBeforeForward {
            layer: "activation",
        })?;

        let act_fn = self.act_fn;
        let mut dz = d.to_owned();
        dz.zip_mut_with(&z, |d, &z| *d *= act_fn.df(z));
        Ok(dz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_df(act_fn: ActFn, x: f32) -> f32 {
        let h = 1e-3;
        (act_fn.f(x + h) - act_fn.f(x - h)) / (2. * h)
    }

    #[test]
    fn derivatives_match_finite_differences() {
        for act_fn in [ActFn::Silu, ActFn::Gelu] {
            for x in [-3.0, -0.5, 0.0, 0.7, 2.5] {
                let expected = numeric_df(act_fn, x);
                assert!(
                    (act_fn.df(x) - expected).abs() < 1e-3,
                    "{act_fn:?} at {x}: {} vs {expected}",
                    act_fn.df(x)
                );
            }
        }
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut act = Activation::new(ActFn::Silu);
        let d = Array2::<f32>::zeros((1, 1));
        assert!(act.backward(d.view()).is_err());
    }
}
