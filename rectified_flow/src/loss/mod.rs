mod mse;

pub use mse::Mse;

use ndarray::{Array, ArrayView, Dimension};

/// A scalar objective and its derivative with respect to the prediction.
pub trait LossFn {
    fn loss<D: Dimension>(&self, y_pred: ArrayView<f32, D>, y: ArrayView<f32, D>) -> f32;

    fn loss_prime<D: Dimension>(&self, y_pred: ArrayView<f32, D>, y: ArrayView<f32, D>) -> Array<f32, D>;
}
