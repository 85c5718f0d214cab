use std::ops::Range;

use ndarray::{Array2, ArrayView2, Axis, linalg};

use crate::{
    MlErr, Result,
    arch::{
        init::Init,
        layout::{ParamScope, view1, view1_mut, view2, view2_mut},
    },
};

/// A fully connected layer `y = x W + b` over the rows of `x`.
///
/// `W` is stored row-major as `(in, out)` in the flat parameter buffer.
#[derive(Debug, Clone)]
pub struct Linear {
    dim: (usize, usize),
    w: Range<usize>,
    b: Option<Range<usize>>,

    // Forward metadata
    x: Option<Array2<f32>>,
}

impl Linear {
    /// Creates a new Xavier-initialized `Linear`.
    ///
    /// # Arguments
    /// * `scope` - Where to reserve the layer's tensors.
    /// * `dim` - The `(in, out)` dimensions.
    /// * `bias` - Whether the layer has a bias term.
    pub fn new(scope: &mut ParamScope, dim: (usize, usize), bias: bool) -> Self {
        let init = Init::XavierUniform {
            fan_in: dim.0,
            fan_out: dim.1,
        };
        Self::with_init(scope, dim, bias, init)
    }

    /// Creates a new `Linear` whose weights start at zero.
    pub fn zeroed(scope: &mut ParamScope, dim: (usize, usize), bias: bool) -> Self {
        Self::with_init(scope, dim, bias, Init::Zeros)
    }

    fn with_init(scope: &mut ParamScope, dim: (usize, usize), bias: bool, init: Init) -> Self {
        let w = scope.alloc("weight", &[dim.0, dim.1], init);
        let b = bias.then(|| scope.alloc("bias", &[dim.1], Init::Zeros));

        Self { dim, w, b, x: None }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                what: "linear input features",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let w = view2(params, &self.w, self.dim)?;
        let mut z = x.dot(&w);

        if let Some(b) = &self.b {
            z += &view1(params, b);
        }

        self.x = Some(x);
        Ok(z)
    }

    /// Accumulates the layer's gradient into `grad` and returns the input delta.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let x = self
            .x
            .take()
            .ok_or(MlErr::BackwardBeforeForward { layer: "linear" })?;

        let mut dw = view2_mut(grad, &self.w, self.dim)?;
        linalg::general_mat_mul(1.0, &x.t(), &d, 1.0, &mut dw);

        if let Some(b) = &self.b {
            let mut db = view1_mut(grad, b);
            db += &d.sum_axis(Axis(0));
        }

        let w = view2(params, &self.w, self.dim)?;
        Ok(d.dot(&w.t()))
    }
}
