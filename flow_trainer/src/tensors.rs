//! Conversions between flat `f32` buffers and safetensors views.

use half::{bf16, f16};
use safetensors::{Dtype, SafeTensorError, SafeTensors, tensor::TensorView};

/// Views `data` as a little-endian `f32` tensor.
pub fn f32_view<'a>(shape: Vec<usize>, data: &'a [f32]) -> Result<TensorView<'a>, SafeTensorError> {
    TensorView::new(Dtype::F32, shape, bytemuck::cast_slice(data))
}

/// Decodes a floating point tensor into `f32` values.
///
/// # Returns
/// The tensor's shape and values, `None` if its dtype isn't a float format.
pub fn to_f32(view: &TensorView<'_>) -> Option<(Vec<usize>, Vec<f32>)> {
    let bytes = view.data();

    let values = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        _ => return None,
    };

    Some((view.shape().to_vec(), values))
}

/// Reads the tensor `name` of a deserialized file as `f32` values.
pub fn read_f32(
    tensors: &SafeTensors<'_>,
    name: &str,
) -> Result<Option<(Vec<usize>, Vec<f32>)>, SafeTensorError> {
    let view = tensors.tensor(name)?;
    Ok(to_f32(&view))
}
