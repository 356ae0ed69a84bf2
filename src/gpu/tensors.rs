//! Batched dense forward pass using burn tensors.
//!
//! All operations work on batched tensors where the first dimension is the batch.

use burn::prelude::*;
use burn::tensor::activation;

use crate::utils::{Activation, LEAKY_SLOPE};

/// Apply a layer activation element-wise (softmax across each row).
#[allow(clippy::cast_possible_truncation)]
pub fn apply_activation<B: Backend>(x: Tensor<B, 2>, act: Activation) -> Tensor<B, 2> {
    match act {
        Activation::Linear => x,
        Activation::Relu => activation::relu(x),
        // max(x, 0) + slope · min(x, 0)
        Activation::LeakyRelu => x.clone().clamp_min(0.0) + x.clamp_max(0.0).mul_scalar(LEAKY_SLOPE as f32),
        // max(x, 0) + exp(min(x, 0)) - 1
        Activation::Elu => x.clone().clamp_min(0.0) + x.clamp_max(0.0).exp().sub_scalar(1.0),
        Activation::Tanh => activation::tanh(x),
        Activation::Sigmoid => activation::sigmoid(x),
        Activation::Softmax => activation::softmax(x, 1),
    }
}

/// Dense forward over a batch.
///
/// x[0] = input_batch
/// for l in 1..L:
///     x[l] = f_l(x[l-1] @ w[l] + b[l])
///
/// `w[l-1]` has shape (d_{l-1}, d_l) and `b[l-1]` shape (d_l).
pub fn dense_forward<B: Backend>(
    input_batch: Tensor<B, 2>,
    w: &[Tensor<B, 2>],
    b: &[Tensor<B, 1>],
    activations: &[Activation],
) -> Tensor<B, 2> {
    let mut x = input_batch;
    for ((w_l, b_l), &act) in w.iter().zip(b).zip(activations) {
        // (batch, d_{l-1}) @ (d_{l-1}, d_l) = (batch, d_l)
        let z = x.matmul(w_l.clone()) + b_l.clone().unsqueeze::<2>();
        x = apply_activation(z, act);
    }
    x
}
