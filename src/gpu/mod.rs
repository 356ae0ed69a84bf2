//! Batched inference on GPU using the burn framework.
//!
//! Networks whose every connection runs between adjacent layers and which
//! carry no sub-networks are equivalent to a stack of dense matrices. Such a
//! network can be baked into [`DenseNetwork`] and evaluated a whole batch at
//! a time on the wgpu backend (Vulkan, Metal, DX12) or any other burn
//! backend. Training stays on the CPU path.

pub mod convert;
pub mod tensors;

use burn::backend::wgpu::WgpuDevice;
use burn::prelude::*;
use ndarray::{Array1, Array2};

use crate::core::{Network, ParagonError, ParagonResult};
use crate::utils::Activation;

use convert::{ndarray1_to_tensor, ndarray2_to_tensor, tensor_to_ndarray2};
use tensors::dense_forward;

/// Dense weight matrices and bias vectors of a network, on the CPU.
///
/// `weights[l-1]` has shape (d_{l-1}, d_l) where `d` counts neurons in
/// row-major order.
#[derive(Debug, Clone)]
pub struct DenseWeights {
    pub dims: Vec<usize>,
    pub weights: Vec<Array2<f64>>,
    pub biases: Vec<Array1<f64>>,
    pub activations: Vec<Activation>,
}

/// Bake `net` into dense matrices.
///
/// # Errors
/// `InvalidArgument` if a neuron has a sub-network, a connection skips a
/// layer, or a neuron's activation differs from its layer's.
pub fn bake_dense(net: &Network) -> ParagonResult<DenseWeights> {
    let dims: Vec<usize> = net.layers.iter().map(|g| g.len()).collect();
    let mut weights = Vec::with_capacity(dims.len().saturating_sub(1));
    let mut biases = Vec::with_capacity(dims.len().saturating_sub(1));
    let mut activations = Vec::with_capacity(dims.len().saturating_sub(1));

    for l in 1..net.layers.len() {
        let grid = &net.layers[l];
        if let Some((j, neuron)) = grid
            .neurons
            .iter()
            .enumerate()
            .find(|(_, n)| n.activation != grid.activation)
        {
            return Err(ParagonError::InvalidArgument(format!(
                "neuron {j} of layer {l} uses {} in a {} layer",
                neuron.activation, grid.activation
            )));
        }
        let (w, b) = net.dense_layer(l)?;
        weights.push(w.t().to_owned());
        biases.push(b);
        activations.push(grid.activation);
    }
    Ok(DenseWeights {
        dims,
        weights,
        biases,
        activations,
    })
}

/// Dense network holding burn tensors on device.
pub struct DenseNetwork<B: Backend> {
    pub dims: Vec<usize>,
    /// w[l-1]: shape (d_{l-1}, d_l)
    pub w: Vec<Tensor<B, 2>>,
    /// b[l-1]: shape (d_l)
    pub b: Vec<Tensor<B, 1>>,
    pub activations: Vec<Activation>,
    pub device: B::Device,
}

impl<B: Backend> DenseNetwork<B> {
    /// Bake `net` and copy the matrices to `device`.
    pub fn from_network(net: &Network, device: &B::Device) -> ParagonResult<Self> {
        let baked = bake_dense(net)?;
        Ok(Self {
            w: baked.weights.iter().map(|w| ndarray2_to_tensor(w, device)).collect(),
            b: baked.biases.iter().map(|b| ndarray1_to_tensor(b, device)).collect(),
            dims: baked.dims,
            activations: baked.activations,
            device: device.clone(),
        })
    }

    /// Forward a batch: one flattened (row-major) input grid per row.
    ///
    /// Returns one output row per input row.
    pub fn forward_batch(&self, inputs: &Array2<f64>) -> ParagonResult<Array2<f64>> {
        if inputs.ncols() != self.dims[0] {
            return Err(ParagonError::InvalidArgument(format!(
                "batch rows have {} values, the input layer has {}",
                inputs.ncols(),
                self.dims[0]
            )));
        }
        let x: Tensor<B, 2> = ndarray2_to_tensor(inputs, &self.device);
        tensor_to_ndarray2(dense_forward(x, &self.w, &self.b, &self.activations))
    }
}

/// Initialize the wgpu device (auto-detect best GPU).
pub fn init_device() -> WgpuDevice {
    WgpuDevice::default()
}
