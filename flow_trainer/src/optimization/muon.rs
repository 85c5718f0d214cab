use std::ops::Range;

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use rectified_flow::ParamLayout;

use super::{Adam, Optimizer, OptimizerState, optimizer::check_len};
use crate::Result;

const NS_COEFFS: (f32, f32, f32) = (3.4445, -4.7750, 2.0315);
const NS_STEPS: usize = 5;

/// Approximates the orthogonal factor of `g` with a quintic Newton-Schulz
/// iteration.
pub fn orthogonalize(g: ArrayView2<f32>) -> Array2<f32> {
    let (a, b, c) = NS_COEFFS;
    let norm = g.iter().map(|v| v * v).sum::<f32>().sqrt() + 1e-7;
    let tall = g.nrows() > g.ncols();

    let mut x = if tall { g.t().to_owned() } else { g.to_owned() } / norm;

    for _ in 0..NS_STEPS {
        let gram = x.dot(&x.t());
        let poly = &gram * b + gram.dot(&gram) * c;
        x = &x * a + poly.dot(&x);
    }

    if tall { x.reversed_axes() } else { x }
}

#[derive(Debug, Clone)]
struct Matrix {
    range: Range<usize>,
    dim: (usize, usize),
}

/// Momentum orthogonalized by Newton-Schulz for the hidden matrices of the
/// backbone, AdamW for every other tensor.
#[derive(Debug, Clone)]
pub struct Muon {
    learning_rate: f32,
    momentum: f32,
    nesterov: bool,
    weight_decay: f32,
    matrices: Vec<Matrix>,
    rest: Vec<Range<usize>>,
    buf: Box<[f32]>,
    adamw: Adam,
}

impl Muon {
    /// Creates a new `Muon` optimizer.
    ///
    /// # Arguments
    /// * `layout` - The model's parameter layout, matrices under `blocks.` are orthogonalized.
    /// * `learning_rate` - The learning rate of the orthogonalized updates.
    /// * `momentum` - The decay of the momentum buffer.
    /// * `nesterov` - Whether to use the Nesterov look ahead.
    /// * `weight_decay` - The decoupled weight decay of every tensor.
    /// * `adamw` - The optimizer of the remaining tensors.
    pub fn new(
        layout: &ParamLayout,
        learning_rate: f32,
        momentum: f32,
        nesterov: bool,
        weight_decay: f32,
        adamw: Adam,
    ) -> Self {
        let (matrices, rest): (Vec<_>, Vec<_>) = layout
            .specs()
            .iter()
            .partition(|spec| spec.is_matrix() && spec.name.starts_with("blocks."));

        Self {
            learning_rate,
            momentum,
            nesterov,
            weight_decay,
            matrices: matrices
                .into_iter()
                .map(|spec| Matrix {
                    range: spec.range.clone(),
                    dim: (spec.shape[0], spec.shape[1]),
                })
                .collect(),
            rest: rest.into_iter().map(|spec| spec.range.clone()).collect(),
            buf: vec![0.; layout.len()].into_boxed_slice(),
            adamw,
        }
    }
}

impl Optimizer for Muon {
    fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad, params)?;
        check_len(&self.buf, params)?;

        let Self {
            learning_rate: lr,
            momentum: mu,
            nesterov,
            weight_decay: wd,
            ..
        } = *self;

        for Matrix { range, dim } in &self.matrices {
            let buf = &mut self.buf[range.clone()];
            let g = &grad[range.clone()];

            let mut update: Vec<f32> = buf
                .par_iter_mut()
                .zip(g)
                .map(|(b, g)| {
                    *b = mu * *b + g;
                    if nesterov { g + mu * *b } else { *b }
                })
                .collect();

            let view = ArrayView2::from_shape(*dim, &update)?;
            let ortho = orthogonalize(view);
            let ratio = (dim.0 as f32 / dim.1 as f32).max(1.).sqrt();
            update.iter_mut().zip(ortho.iter()).for_each(|(u, o)| *u = *o);

            params[range.clone()]
                .par_iter_mut()
                .zip(update)
                .for_each(|(p, u)| *p -= lr * (wd * *p + ratio * u));
        }

        self.adamw.advance();
        for range in &self.rest {
            self.adamw
                .step_range(range.start, &grad[range.clone()], &mut params[range.clone()]);
        }

        Ok(())
    }

    fn lr(&self) -> f32 {
        self.learning_rate
    }

    /// Sets the learning rate of both parts keeping their ratio.
    fn set_lr(&mut self, lr: f32) {
        if self.learning_rate > 0. {
            let ratio = self.adamw.lr() / self.learning_rate;
            self.adamw.set_lr(lr * ratio);
        }

        self.learning_rate = lr;
    }

    fn normalizes_updates(&self) -> bool {
        true
    }

    fn state_dict(&self) -> OptimizerState {
        let adamw = self.adamw.state_dict();
        let mut state = OptimizerState::default();

        state.tensors.insert("momentum".into(), self.buf.to_vec());
        state.scalars.insert("lr".into(), self.learning_rate as f64);
        for (name, values) in adamw.tensors {
            state.tensors.insert(format!("adamw.{name}"), values);
        }
        for (name, value) in adamw.scalars {
            state.scalars.insert(format!("adamw.{name}"), value);
        }

        state
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let buf = state.tensor("momentum", self.buf.len())?;
        let lr = state.scalar("lr")?;

        let strip = |name: &String| name.strip_prefix("adamw.").map(str::to_string);
        let adamw_state = OptimizerState {
            tensors: state
                .tensors
                .iter()
                .filter_map(|(name, values)| Some((strip(name)?, values.clone())))
                .collect(),
            scalars: state
                .scalars
                .iter()
                .filter_map(|(name, value)| Some((strip(name)?, *value)))
                .collect(),
        };

        let mut adamw = self.adamw.clone();
        adamw.load_state_dict(&adamw_state)?;

        self.buf.copy_from_slice(buf);
        self.learning_rate = lr as f32;
        self.adamw = adamw;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}
