//! Conversion helpers between ndarray (f64) and burn tensors (f32).

use burn::prelude::*;
use ndarray::{Array1, Array2};

use crate::core::{ParagonError, ParagonResult};

/// Convert an ndarray `Array2<f64>` to a burn `Tensor<B, 2>`.
#[allow(clippy::cast_possible_truncation)]
pub fn ndarray2_to_tensor<B: Backend>(arr: &Array2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = arr.dim();
    let data: Vec<f32> = arr.iter().map(|&v| v as f32).collect();
    Tensor::from_data(TensorData::new(data, [rows, cols]), device)
}

/// Convert an ndarray `Array1<f64>` to a burn `Tensor<B, 1>`.
#[allow(clippy::cast_possible_truncation)]
pub fn ndarray1_to_tensor<B: Backend>(arr: &Array1<f64>, device: &B::Device) -> Tensor<B, 1> {
    let len = arr.len();
    let data: Vec<f32> = arr.iter().map(|&v| v as f32).collect();
    Tensor::from_data(TensorData::new(data, [len]), device)
}

/// Convert a burn `Tensor<B, 2>` back to an ndarray `Array2<f64>`.
pub fn tensor_to_ndarray2<B: Backend>(tensor: Tensor<B, 2>) -> ParagonResult<Array2<f64>> {
    let shape = tensor.shape();
    let rows = shape.dims[0];
    let cols = shape.dims[1];
    let data: Vec<f32> = tensor
        .into_data()
        .to_vec()
        .map_err(|e| ParagonError::Numeric(format!("reading tensor: {e:?}")))?;
    Array2::from_shape_vec((rows, cols), data.into_iter().map(f64::from).collect())
        .map_err(|e| ParagonError::Numeric(format!("reshaping tensor: {e}")))
}

