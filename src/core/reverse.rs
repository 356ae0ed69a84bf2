//! Reverse inference: reconstruct an input the network maps to a given output.
//!
//! Layers are inverted one at a time from the output down. Each step undoes
//! the activation ([`Activation::inverse`], or [`inverse_softmax`] for a
//! softmax layer), removes the bias, and solves the weight system for the
//! values of the layer below:
//!
//! ```text
//! r = f⁻¹(y) - b
//! x = Wᵀ (W Wᵀ + λI)⁻¹ r      layer no wider than its source (minimum-norm preimage)
//! x = (Wᵀ W + λI)⁻¹ Wᵀ r      wider layer (least-squares fit)
//! ```
//!
//! Only plain stacks qualify: every connection must come from the layer
//! directly below and no neuron may carry a sub-network. Replay passes and
//! partitions are not modelled.

use ndarray::{Array1, Array2};

use super::{Network, ParagonError, ParagonResult};
use crate::utils::{inverse_softmax, Activation};

/// Ridge term added to the diagonal of the normal equations.
pub const REVERSE_RIDGE: f64 = 1e-12;

impl Network {
    /// Weights (one row per neuron, one column per neuron of the layer below)
    /// and biases of `layer`.
    ///
    /// # Errors
    /// `InvalidArgument` for the input layer or a missing one, a neuron with a
    /// sub-network, or a connection that skips a layer.
    pub fn dense_layer(&self, layer: usize) -> ParagonResult<(Array2<f64>, Array1<f64>)> {
        if layer == 0 || layer >= self.layers.len() {
            return Err(ParagonError::InvalidArgument(format!(
                "layer {layer} has no incoming weights"
            )));
        }
        let grid = &self.layers[layer];
        let src = &self.layers[layer - 1];
        let mut w = Array2::zeros((grid.len(), src.len()));
        let mut b = Array1::zeros(grid.len());
        for (j, neuron) in grid.neurons.iter().enumerate() {
            if neuron.dimension.is_some() {
                return Err(ParagonError::InvalidArgument(format!(
                    "neuron {j} of layer {l} has a sub-network",
                    l = layer
                )));
            }
            b[j] = neuron.bias;
            for c in &neuron.connections {
                if c.source.layer != layer - 1 {
                    return Err(ParagonError::InvalidArgument(format!(
                        "layer {layer} reads from layer {}; only adjacent connections can be inverted",
                        c.source.layer
                    )));
                }
                w[[j, src.index(c.source.x, c.source.y)]] += c.weight;
            }
        }
        Ok((w, b))
    }

    /// Input grid whose forward pass reproduces `output` as closely as the
    /// weights allow.
    ///
    /// A one-hot `output` on a softmax head yields a prototype input for that
    /// class.
    ///
    /// # Errors
    /// `InvalidArgument` for a mismatched output shape or a network that is
    /// not a plain stack (see [`Network::dense_layer`]); `Numeric` when a
    /// layer's system cannot be solved.
    pub fn reverse_infer_from_output(&self, output: &Array2<f64>) -> ParagonResult<Array2<f64>> {
        self.check_target(output)?;
        let mut values: Vec<f64> = output.iter().copied().collect();

        for l in (1..=self.output_layer).rev() {
            let grid = &self.layers[l];
            let (w, b) = self.dense_layer(l)?;
            let pre: Vec<f64> = if grid.activation == Activation::Softmax {
                inverse_softmax(&values)
            } else {
                grid.neurons
                    .iter()
                    .zip(&values)
                    .map(|(n, &y)| n.activation.inverse(y))
                    .collect()
            };
            let residual = Array1::from(pre) - &b;
            values = solve_layer(&w, &residual)
                .map_err(|e| match e {
                    ParagonError::Numeric(reason) => {
                        ParagonError::Numeric(format!("inverting layer {l}: {reason}"))
                    }
                    other => other,
                })?
                .to_vec();
        }

        let (w, h) = self.input_dims();
        Array2::from_shape_vec((h, w), values)
            .map_err(|e| ParagonError::InvalidArgument(format!("reshaping reconstructed input: {e}")))
    }
}

fn solve_layer(w: &Array2<f64>, residual: &Array1<f64>) -> ParagonResult<Array1<f64>> {
    let (rows, cols) = w.dim();
    if rows <= cols {
        let mut gram = w.dot(&w.t());
        gram.diag_mut().mapv_inplace(|d| d + REVERSE_RIDGE);
        let y = solve(gram, residual.clone())?;
        Ok(w.t().dot(&y))
    } else {
        let mut gram = w.t().dot(w);
        gram.diag_mut().mapv_inplace(|d| d + REVERSE_RIDGE);
        solve(gram, w.t().dot(residual))
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> ParagonResult<Array1<f64>> {
    let n = b.len();
    for k in 0..n {
        let pivot = (k..n)
            .max_by(|&i, &j| a[[i, k]].abs().total_cmp(&a[[j, k]].abs()))
            .unwrap_or(k);
        if !(a[[pivot, k]].abs() > 0.0) {
            return Err(ParagonError::Numeric("singular system".to_string()));
        }
        if pivot != k {
            for c in 0..n {
                a.swap([k, c], [pivot, c]);
            }
            b.swap(k, pivot);
        }
        for i in k + 1..n {
            let f = a[[i, k]] / a[[k, k]];
            if f == 0.0 {
                continue;
            }
            for c in k..n {
                a[[i, c]] -= f * a[[k, c]];
            }
            b[i] -= f * b[k];
        }
    }

    let mut x = Array1::zeros(n);
    for k in (0..n).rev() {
        let mut s = b[k];
        for c in k + 1..n {
            s -= a[[k, c]] * x[c];
        }
        x[k] = s / a[[k, k]];
    }
    if x.iter().all(|v: &f64| v.is_finite()) {
        Ok(x)
    } else {
        Err(ParagonError::Numeric("non-finite solution".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::one_hot;
    use crate::utils::argmax;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_square_network_recovers_input() {
        let mut net = Network::new(
            &[(4, 1), (4, 1), (4, 1)],
            &[Activation::Linear, Activation::LeakyRelu, Activation::Linear],
            &[true, true, true],
            13,
        )
        .unwrap();
        let input = array![[0.5, -0.3, 0.8, 0.2]];
        net.forward(&input).unwrap();
        let output = net.extract_output().insert_axis(ndarray::Axis(0));

        let rebuilt = net.reverse_infer_from_output(&output).unwrap();
        assert_eq!(rebuilt.dim(), (1, 4));
        for (a, b) in rebuilt.iter().zip(input.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_one_hot_prototype_is_classified() {
        let mut net = Network::new(
            &[(4, 1), (3, 1), (2, 1)],
            &[Activation::Linear, Activation::LeakyRelu, Activation::Softmax],
            &[true, true, true],
            29,
        )
        .unwrap();
        for label in 0..2 {
            let target = one_hot(label, 2).unwrap();
            let prototype = net.reverse_infer_from_output(&target).unwrap();
            net.forward(&prototype).unwrap();
            let out = net.extract_output();
            assert_eq!(argmax(out.as_slice().unwrap()), label);
            assert!(out[label] > 0.999, "class {label} probability {}", out[label]);
        }
    }

    #[test]
    fn test_rejects_sub_networks_and_bad_shapes() {
        let mut net = Network::new(
            &[(2, 1), (2, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            3,
        )
        .unwrap();
        assert!(net.reverse_infer_from_output(&array![[0.1, 0.2]]).is_err());

        let sub = Network::new(
            &[(1, 1), (1, 1)],
            &[Activation::Linear, Activation::Linear],
            &[true, true],
            4,
        )
        .unwrap();
        net.attach_dimension(1, 0, 0, sub).unwrap();
        assert!(matches!(
            net.reverse_infer_from_output(&array![[0.1]]),
            Err(ParagonError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_solve_small_system() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let x = solve(a, array![3.0, 5.0]).unwrap();
        assert_abs_diff_eq!(x[0], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.4, epsilon = 1e-12);
        assert!(solve(array![[0.0, 0.0], [0.0, 0.0]], array![1.0, 1.0]).is_err());
    }
}
