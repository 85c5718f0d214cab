use half::{bf16, f16};
use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};

/// The floating point format inputs are rounded to before entering the model.
///
/// This is input rounding only. Weights, activations and gradients stay in
/// `f32`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    #[default]
    Bf16,
    F16,
}

impl Precision {
    #[inline]
    pub fn round(&self, x: f32) -> f32 {
        match self {
            Precision::F32 => x,
            Precision::Bf16 => bf16::from_f32(x).to_f32(),
            Precision::F16 => f16::from_f32(x).to_f32(),
        }
    }

    /// Rounds every element of `x` in place.
    pub fn round_array<D: Dimension>(&self, x: &mut Array<f32, D>) {
        if *self == Precision::F32 {
            return;
        }

        let this = *self;
        x.par_mapv_inplace(|v| this.round(v));
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn bf16_drops_low_mantissa_bits() {
        let x = 1.0 + 1.0 / 512.0;
        assert_eq!(Precision::Bf16.round(x), 1.0);
        assert_eq!(Precision::F16.round(x), x);
        assert_eq!(Precision::F32.round(x), x);
    }

    #[test]
    fn f16_overflows_to_infinity() {
        let mut x = array![1.0e6, -2.0];
        Precision::F16.round_array(&mut x);
        assert!(x[0].is_infinite());
        assert_eq!(x[1], -2.0);
    }

    #[test]
    fn names_deserialize_lowercase() {
        let p: Precision = serde_json::from_str(r#""f16""#).unwrap();
        assert_eq!(p, Precision::F16);
        assert_eq!(Precision::default(), Precision::Bf16);
    }
}
