//! Backward pass: gradient computation and parameter update.
//!
//! The update is split in two phases so a sample with a non-finite gradient
//! can be rejected before any parameter changes:
//!
//! 1. [`Network::compute_gradients`] walks layers from the output down,
//!    turning accumulated errors into local errors and pushing them through
//!    the pre-update weights.
//! 2. [`Network::apply_gradients`] checks that every updated bias and weight
//!    stays finite, then moves them along the recorded errors.

use ndarray::Array2;

use super::{Dimension, Network, ParagonError, ParagonResult, Partition};
use crate::replay::ReplayUpdate;
use crate::utils::{clip, Activation, ClipBounds};

/// Gradient record for one sample.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// Effective local error per neuron; layer 0 holds the error reaching the input.
    pub(crate) deltas: Vec<Vec<f64>>,
    /// Source values at the time the gradients were computed
    pub(crate) values: Vec<Vec<f64>>,
    pub(crate) widths: Vec<usize>,
    pub(crate) subs: Vec<SubGradient>,
    /// Mean absolute local error per layer
    pub(crate) magnitudes: Vec<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct SubGradient {
    layer: usize,
    index: usize,
    grads: Gradients,
}

impl Gradients {
    /// Error reaching each input neuron, row-major.
    pub fn input_errors(&self) -> &[f64] {
        &self.deltas[0]
    }

    /// Effective local error of every neuron in `layer`.
    pub fn layer_deltas(&self, layer: usize) -> &[f64] {
        &self.deltas[layer]
    }

    pub fn is_finite(&self) -> bool {
        self.deltas.iter().flatten().all(|d| d.is_finite())
            && self.values.iter().flatten().all(|v| v.is_finite())
            && self.subs.iter().all(|s| s.grads.is_finite())
    }

    #[inline]
    fn source_value(&self, layer: usize, x: usize, y: usize) -> f64 {
        self.values[layer][y * self.widths[layer] + x]
    }
}

impl Network {
    /// Move parameters toward `target` after a forward pass.
    ///
    /// # Errors
    /// `InvalidArgument` for a negative learning rate or mismatched target;
    /// `Numeric` if any gradient or updated parameter is non-finite, in which
    /// case nothing changes.
    pub fn backward(&mut self, target: &Array2<f64>, lr: f64) -> ParagonResult<()> {
        self.backward_clipped(target, lr, None)
    }

    /// [`Network::backward`] with per-weight gradient clipping.
    pub fn backward_clipped(
        &mut self,
        target: &Array2<f64>,
        lr: f64,
        bounds: Option<&ClipBounds>,
    ) -> ParagonResult<()> {
        self.step(target, lr, bounds, None)
    }

    /// Backward restricted to hidden neurons of partition `tag`.
    ///
    /// Output neurons always update; hidden neurons of other partitions keep
    /// their parameters.
    pub fn backward_tagged(
        &mut self,
        target: &Array2<f64>,
        lr: f64,
        num_tags: usize,
        tag: usize,
        bounds: Option<&ClipBounds>,
    ) -> ParagonResult<()> {
        let partition = Partition::new(num_tags, tag)?;
        self.step(target, lr, bounds, Some(partition))
    }

    /// Backward driven by caller-supplied output errors (`target - output` form).
    ///
    /// Returns the error reaching each input neuron, so the network can sit
    /// inside a larger model.
    pub fn backward_external(
        &mut self,
        output_errors: &[f64],
        lr: f64,
        bounds: Option<&ClipBounds>,
    ) -> ParagonResult<Vec<f64>> {
        check_learning_rate(lr)?;
        let expected = self.output().len();
        if output_errors.len() != expected {
            return Err(ParagonError::InvalidArgument(format!(
                "{} output errors for {expected} output neurons",
                output_errors.len()
            )));
        }
        let grads = self.compute_gradients(output_errors, None);
        if !grads.is_finite() {
            return Err(ParagonError::Numeric("non-finite gradient".to_string()));
        }
        self.apply_gradients(&grads, lr, bounds, None)?;
        Ok(grads.deltas[0].clone())
    }

    fn step(
        &mut self,
        target: &Array2<f64>,
        lr: f64,
        bounds: Option<&ClipBounds>,
        mask: Option<Partition>,
    ) -> ParagonResult<()> {
        check_learning_rate(lr)?;
        self.check_target(target)?;
        let errors: Vec<f64> = target
            .iter()
            .zip(self.output().neurons.iter())
            .map(|(t, n)| t - n.value)
            .collect();
        let grads = self.compute_gradients(&errors, mask);
        if !grads.is_finite() {
            return Err(ParagonError::Numeric("non-finite gradient".to_string()));
        }
        self.apply_gradients(&grads, lr, bounds, mask)
    }

    /// Phase one: local errors for every neuron, without touching parameters.
    ///
    /// # Algorithm
    ///
    /// For `l` from the output down to 1:
    /// - `local = acc · f'(value)`; a softmax output uses `f' = 1` so the
    ///   raw error acts on the logits. Backward-inclusive replay sums `f'` over
    ///   every recorded pass.
    /// - A neuron with a sub-network backpropagates `local` through it and uses
    ///   the error reaching the sub-network's input.
    /// - `acc[source] += effective · weight` for every incoming connection.
    ///
    /// Shared sub-networks are re-run on the neuron's own input first so their
    /// cached state belongs to that neuron.
    pub fn compute_gradients(&mut self, output_errors: &[f64], mask: Option<Partition>) -> Gradients {
        let n = self.layers.len();
        let out = self.output_layer;
        let widths: Vec<usize> = self.layers.iter().map(|g| g.width).collect();
        let values: Vec<Vec<f64>> = self.layers.iter().map(|g| g.values()).collect();

        let mut acc: Vec<Vec<f64>> = self.layers.iter().map(|g| vec![0.0; g.len()]).collect();
        for (a, e) in acc[out].iter_mut().zip(output_errors) {
            *a = *e;
        }
        let mut deltas: Vec<Vec<f64>> = acc.iter().map(|a| vec![0.0; a.len()]).collect();
        let mut magnitudes = vec![0.0; n];
        let mut subs = Vec::new();

        for l in (1..n).rev() {
            let is_output = l == out;
            let masked = if is_output { None } else { mask };
            let factors = self.layers[l].derivative_factors(is_output);
            let (lower_acc, upper_acc) = acc.split_at_mut(l);
            let layer_acc = &upper_acc[0];
            let grid = &mut self.layers[l];
            let mut total = 0.0;

            for (i, neuron) in grid.neurons.iter_mut().enumerate() {
                if masked.is_some_and(|p| !p.owns(i)) {
                    continue;
                }
                let local = layer_acc[i] * factors[i];
                total += local.abs();
                let effective = match neuron.dimension.as_mut() {
                    Some(dim) => {
                        let grads = dim.gradients(neuron.input_sum, local);
                        let e = grads.deltas[0].first().copied().unwrap_or(0.0);
                        subs.push(SubGradient { layer: l, index: i, grads });
                        e
                    }
                    None => local,
                };
                deltas[l][i] = effective;
                for c in &neuron.connections {
                    let src = c.source;
                    lower_acc[src.layer][src.y * widths[src.layer] + src.x] += effective * c.weight;
                }
            }
            magnitudes[l] = if grid.is_empty() { 0.0 } else { total / grid.len() as f64 };
        }
        deltas[0] = std::mem::take(&mut acc[0]);

        Gradients {
            deltas,
            values,
            widths,
            subs,
            magnitudes,
        }
    }

    /// Phase two: `bias += lr·e`, `w += lr·clip(e·source)`.
    ///
    /// Sub-network updates follow in the order their neurons were visited;
    /// a shared sub-network therefore accumulates one update per neuron.
    ///
    /// # Errors
    /// `Numeric` if any updated bias or weight would be non-finite. The
    /// network is left untouched in that case.
    pub fn apply_gradients(
        &mut self,
        grads: &Gradients,
        lr: f64,
        bounds: Option<&ClipBounds>,
        mask: Option<Partition>,
    ) -> ParagonResult<()> {
        self.check_update(grads, lr, bounds, mask)?;
        self.write_update(grads, lr, bounds, mask);
        Ok(())
    }

    fn check_update(
        &self,
        grads: &Gradients,
        lr: f64,
        bounds: Option<&ClipBounds>,
        mask: Option<Partition>,
    ) -> ParagonResult<()> {
        let out = self.output_layer;
        for (l, grid) in self.layers.iter().enumerate().skip(1) {
            let masked = if l == out { None } else { mask };
            for (i, neuron) in grid.neurons.iter().enumerate() {
                if masked.is_some_and(|p| !p.owns(i)) {
                    continue;
                }
                let delta = grads.deltas[l][i];
                let bias = neuron.bias + lr * delta;
                if !bias.is_finite() {
                    return Err(ParagonError::Numeric(format!(
                        "bias of neuron {i} in layer {l} would become {bias}"
                    )));
                }
                for c in &neuron.connections {
                    let s = grads.source_value(c.source.layer, c.source.x, c.source.y);
                    let weight = c.weight + lr * clip(delta * s, bounds);
                    if !weight.is_finite() {
                        return Err(ParagonError::Numeric(format!(
                            "weight from {:?} into neuron {i} of layer {l} would become {weight}",
                            c.source
                        )));
                    }
                }
            }
        }

        for sub in &grads.subs {
            match &self.layers[sub.layer].neurons[sub.index].dimension {
                Some(Dimension::Owned(net)) => net.check_update(&sub.grads, lr, bounds, None)?,
                Some(Dimension::Shared(net)) => net.lock().check_update(&sub.grads, lr, bounds, None)?,
                None => {}
            }
        }
        Ok(())
    }

    fn write_update(&mut self, grads: &Gradients, lr: f64, bounds: Option<&ClipBounds>, mask: Option<Partition>) {
        let out = self.output_layer;
        for l in 1..self.layers.len() {
            let masked = if l == out { None } else { mask };
            let grid = &mut self.layers[l];
            for (i, neuron) in grid.neurons.iter_mut().enumerate() {
                if masked.is_some_and(|p| !p.owns(i)) {
                    continue;
                }
                let delta = grads.deltas[l][i];
                neuron.bias += lr * delta;
                for c in neuron.connections.iter_mut() {
                    let s = grads.source_value(c.source.layer, c.source.x, c.source.y);
                    c.weight += lr * clip(delta * s, bounds);
                }
            }
            grid.last_error = grads.magnitudes[l];
        }

        for sub in &grads.subs {
            match &mut self.layers[sub.layer].neurons[sub.index].dimension {
                Some(Dimension::Owned(net)) => net.write_update(&sub.grads, lr, bounds, None),
                Some(Dimension::Shared(net)) => net.lock().write_update(&sub.grads, lr, bounds, None),
                None => {}
            }
        }
    }
}

impl super::Grid {
    /// `f'` per neuron for the last forward pass.
    fn derivative_factors(&self, is_output: bool) -> Vec<f64> {
        let softmax_head = is_output && self.activation == Activation::Softmax;
        let derivative = |act: Activation, v: f64| if softmax_head { 1.0 } else { act.derivative(v) };

        let inclusive = self.replay.enabled
            && self.replay.update == ReplayUpdate::BackwardInclusive
            && !self.replay_trace.is_empty();
        if inclusive {
            self.neurons
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    self.replay_trace
                        .iter()
                        .filter_map(|pass| pass.get(i))
                        .map(|&v| derivative(n.activation, v))
                        .sum()
                })
                .collect()
        } else {
            self.neurons
                .iter()
                .map(|n| derivative(n.activation, n.value))
                .collect()
        }
    }
}

impl Dimension {
    /// Backpropagate `upstream` (error at the sub-network output) through the sub-network.
    fn gradients(&mut self, input_sum: f64, upstream: f64) -> Gradients {
        match self {
            Dimension::Owned(net) => sub_gradients(net, upstream),
            Dimension::Shared(shared) => {
                let mut net = shared.lock();
                net.forward_scalar(input_sum);
                sub_gradients(&mut net, upstream)
            }
        }
    }
}

fn sub_gradients(net: &mut Network, upstream: f64) -> Gradients {
    let mut errors = vec![0.0; net.output().len()];
    if let Some(first) = errors.first_mut() {
        *first = upstream;
    }
    net.compute_gradients(&errors, None)
}

fn check_learning_rate(lr: f64) -> ParagonResult<()> {
    if !(lr >= 0.0) || !lr.is_finite() {
        return Err(ParagonError::InvalidArgument(format!(
            "learning rate must be finite and non-negative, got {lr}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn tiny() -> Network {
        Network::new(
            &[(2, 1), (3, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            9,
        )
        .unwrap()
    }

    #[test]
    fn test_backward_reduces_loss() {
        let mut net = tiny();
        let input = array![[0.4, -0.2]];
        let target = array![[0.8]];
        net.forward(&input).unwrap();
        let before = net.compute_loss(&target).unwrap();
        for _ in 0..20 {
            net.forward(&input).unwrap();
            net.backward(&target, 0.05).unwrap();
        }
        net.forward(&input).unwrap();
        assert!(net.compute_loss(&target).unwrap() < before);
    }

    #[test]
    fn test_zero_learning_rate_changes_nothing() {
        let mut net = tiny();
        net.forward(&array![[1.0, 1.0]]).unwrap();
        let before: Vec<f64> = net.layers[1].neurons.iter().map(|n| n.connections[0].weight).collect();
        net.backward(&array![[0.0]], 0.0).unwrap();
        let after: Vec<f64> = net.layers[1].neurons.iter().map(|n| n.connections[0].weight).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_negative_learning_rate_rejected() {
        let mut net = tiny();
        net.forward(&array![[1.0, 1.0]]).unwrap();
        assert!(matches!(
            net.backward(&array![[0.0]], -0.1),
            Err(ParagonError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_non_finite_gradient_leaves_parameters() {
        let mut net = tiny();
        net.forward(&array![[1.0, 1.0]]).unwrap();
        let bias = net.layers[2].neurons[0].bias;
        let res = net.backward(&array![[f64::NAN]], 0.1);
        assert!(matches!(res, Err(ParagonError::Numeric(_))));
        assert_eq!(net.layers[2].neurons[0].bias, bias);
    }

    #[test]
    fn test_overflowing_update_rejected() {
        let mut net = Network::new(&[(1, 1), (1, 1)], &[Activation::Linear, Activation::Linear], &[true, true], 3).unwrap();
        net.layers[1].neurons[0].connections[0].weight = 0.0;
        net.layers[1].neurons[0].bias = 0.0;
        net.forward(&array![[1e200]]).unwrap();
        let res = net.backward(&array![[1e154]], 1.0);
        assert!(matches!(res, Err(ParagonError::Numeric(_))));
        assert_eq!(net.layers[1].neurons[0].connections[0].weight, 0.0);
        assert_eq!(net.layers[1].neurons[0].bias, 0.0);
    }

    #[test]
    fn test_output_bias_update_matches_rule() {
        let mut net = tiny();
        net.forward(&array![[0.5, 0.5]]).unwrap();
        let out = net.extract_output()[0];
        let bias = net.layers[2].neurons[0].bias;
        net.backward(&array![[1.0]], 0.1).unwrap();
        // linear output: derivative 1
        assert_abs_diff_eq!(net.layers[2].neurons[0].bias, bias + 0.1 * (1.0 - out), epsilon = 1e-12);
    }

    #[test]
    fn test_backward_external_returns_input_errors() {
        let mut net = tiny();
        net.forward(&array![[0.5, -0.5]]).unwrap();
        let errs = net.backward_external(&[0.3], 0.0, None).unwrap();
        assert_eq!(errs.len(), 2);
        assert!(errs.iter().all(|e| e.is_finite()));
        assert!(net.backward_external(&[0.3, 0.1], 0.0, None).is_err());
    }

    #[test]
    fn test_clipping_bounds_weight_step() {
        let mut net = tiny();
        net.forward(&array![[10.0, 10.0]]).unwrap();
        let before: Vec<f64> = net.layers[1].neurons.iter().map(|n| n.connections[0].weight).collect();
        let bounds = ClipBounds::new(0.01, -0.01).unwrap();
        net.backward_clipped(&array![[50.0]], 1.0, Some(&bounds)).unwrap();
        for (n, b) in net.layers[1].neurons.iter().zip(before) {
            assert!((n.connections[0].weight - b).abs() <= 0.01 + 1e-12);
        }
    }
}
