use ndarray::{Array1, Array2, ArrayView2, Zip};

use crate::{MlErr, Result};

const EPS: f32 = 1e-6;

/// Row-wise layer normalization without learned affine parameters.
///
/// The affine part is supplied by the adaLN modulation that follows it.
#[derive(Debug, Clone, Default)]
pub struct LayerNorm {
    // Forward metadata
    xhat: Option<Array2<f32>>,
    inv_std: Option<Array1<f32>>,
}

impl LayerNorm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&mut self, x: ArrayView2<f32>) -> Array2<f32> {
        let d = x.ncols() as f32;
        let mut xhat = x.to_owned();
        let mut inv_std = Array1::zeros(x.nrows());

        Zip::from(xhat.rows_mut())
            .and(&mut inv_std)
            .par_for_each(|mut row, inv| {
                let mean = row.sum() / d;
                row -= mean;
                let var = row.fold(0., |acc, v| acc + v * v) / d;
                *inv = 1. / (var + EPS).sqrt();
                row *= *inv;
            });

        self.inv_std = Some(inv_std);
        self.xhat = Some(xhat.clone());
        xhat
    }

    /// Returns the input delta, the layer has no parameters.
    pub fn backward(&mut self, d: ArrayView2<f32>) -> Result<Array2<f32>> {
        let (Some(xhat), Some(inv_std)) = (self.xhat.take(), self.inv_std.take()) else {
            return Err(MlErr::BackwardBeforeForward { layer: "layer norm" });
        };

        let n = d.ncols() as f32;
        let mut dx = d.to_owned();

        Zip::from(dx.rows_mut())
            .and(xhat.rows())
            .and(&inv_std)
            .par_for_each(|mut dx, xhat, &inv| {
                let mean_d = dx.sum() / n;
                let mean_dx = dx.dot(&xhat) / n;
                Zip::from(&mut dx).and(&xhat).for_each(|d, &xh| {
                    *d = inv * (*d - mean_d - xh * mean_dx);
                });
            });

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn rows_come_out_standardized() {
        let mut norm = LayerNorm::new();
        let x = array![[1.0, 2.0, 3.0, 4.0], [10.0, 10.0, 10.0, 14.0]];
        let y = norm.forward(x.view());

        for row in y.rows() {
            let mean = row.sum() / 4.0;
            let var = row.mapv(|v| (v - mean).powi(2)).sum() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let x = array![[0.3, -1.2, 2.0], [1.5, 0.1, -0.4]];
        let w = array![[0.7, -0.2, 1.1], [0.4, 0.9, -1.3]];

        let loss = |x: &Array2<f32>| {
            let mut norm = LayerNorm::new();
            (norm.forward(x.view()) * &w).sum()
        };

        let mut norm = LayerNorm::new();
        norm.forward(x.view());
        let dx = norm.backward(w.view()).unwrap();

        let h = 1e-2;
        for i in 0..2 {
            for j in 0..3 {
                let mut xp = x.clone();
                let mut xm = x.clone();
                xp[[i, j]] += h;
                xm[[i, j]] -= h;
                let numeric = (loss(&xp) - loss(&xm)) / (2. * h);
                assert!((dx[[i, j]] - numeric).abs() < 1e-2, "{} vs {numeric}", dx[[i, j]]);
            }
        }
    }
}
