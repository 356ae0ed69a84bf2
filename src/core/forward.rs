//! Forward propagation with replay and partition masking.

use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;

use super::{Grid, Network, Neuron, ParagonError, ParagonResult, Partition};
use crate::replay::{ReplayPhase, ReplayUpdate};
use crate::utils::{cross_entropy, mean_squared_error, softmax_in_place, Activation};

/// Layers at least this wide are computed with rayon when `parallel` is set.
pub const PARALLEL_MIN_NEURONS: usize = 256;

impl Neuron {
    /// Recompute `value` from the current values of lower layers.
    fn fire(&mut self, lower: &[Grid]) {
        let mut sum = self.bias;
        for c in &self.connections {
            sum += lower[c.source.layer].value_at(c.source.x, c.source.y) * c.weight;
        }
        self.input_sum = sum;
        if let Some(dim) = self.dimension.as_mut() {
            sum = dim.transform(sum);
        }
        self.sum = sum;
        self.value = self.activation.apply(sum);
    }
}

impl Network {
    /// Forward pass for training: replay is active wherever it is configured.
    ///
    /// # Errors
    /// `InvalidArgument` if the input is not `(height, width)` of layer 0.
    pub fn forward(&mut self, input: &Array2<f64>) -> ParagonResult<()> {
        self.check_input(input)?;
        self.propagate(input.view(), None, true);
        Ok(())
    }

    /// Forward pass where hidden neurons outside partition `tag` output zero.
    pub fn forward_tagged(&mut self, input: &Array2<f64>, num_tags: usize, tag: usize) -> ParagonResult<()> {
        let partition = Partition::new(num_tags, tag)?;
        self.check_input(input)?;
        self.propagate(input.view(), Some(partition), true);
        Ok(())
    }

    /// Evaluation forward returning the output layer.
    ///
    /// Replay is skipped unless `replay_in_eval` is set.
    pub fn predict(&mut self, input: &Array2<f64>) -> ParagonResult<Array1<f64>> {
        self.check_input(input)?;
        let replay = self.replay_in_eval;
        self.propagate(input.view(), None, replay);
        Ok(self.extract_output())
    }

    /// Load `state` into hidden `layer` and recompute only the layers above it.
    ///
    /// Replay windows stop at `layer`, so the injected state is never
    /// overwritten. Returns the output layer.
    ///
    /// # Errors
    /// `InvalidArgument` if `layer` is not a hidden layer or `state` does not
    /// have one value per neuron.
    pub fn forward_from_layer(&mut self, layer: usize, state: &[f64]) -> ParagonResult<Array1<f64>> {
        if layer == 0 || layer >= self.output_layer {
            return Err(ParagonError::InvalidArgument(format!(
                "layer {layer} is not a hidden layer (output is {})",
                self.output_layer
            )));
        }
        let grid = &mut self.layers[layer];
        if state.len() != grid.len() {
            return Err(ParagonError::InvalidArgument(format!(
                "{} state values for {} neurons in layer {layer}",
                state.len(),
                grid.len()
            )));
        }
        for (neuron, &v) in grid.neurons.iter_mut().zip(state) {
            neuron.value = v;
        }
        grid.cached_outputs = state.to_vec();
        self.propagate_from(layer + 1, None, true);
        Ok(self.extract_output())
    }

    /// Values of every neuron in `layer` from the last forward, row-major.
    pub fn layer_state(&self, layer: usize) -> ParagonResult<Vec<f64>> {
        self.layers
            .get(layer)
            .map(Grid::values)
            .ok_or_else(|| ParagonError::InvalidArgument(format!("no layer {layer}")))
    }

    /// Output layer values in row-major order.
    pub fn extract_output(&self) -> Array1<f64> {
        self.output().neurons.iter().map(|n| n.value).collect()
    }

    /// Replace the output values by the softmax of the layer's cached outputs.
    ///
    /// Idempotent: repeated calls give the same values.
    pub fn apply_softmax(&mut self) {
        let grid = &mut self.layers[self.output_layer];
        if grid.cached_outputs.len() != grid.neurons.len() {
            grid.cached_outputs = grid.values();
        }
        let mut probs = grid.cached_outputs.clone();
        softmax_in_place(&mut probs);
        for (neuron, p) in grid.neurons.iter_mut().zip(probs) {
            neuron.value = p;
        }
    }

    /// Loss of the current output against `target`.
    ///
    /// Cross-entropy when the output layer is softmax, mean squared error otherwise.
    pub fn compute_loss(&self, target: &Array2<f64>) -> ParagonResult<f64> {
        self.check_target(target)?;
        let predicted = self.output().values();
        let target: Vec<f64> = target.iter().copied().collect();
        Ok(match self.output().activation {
            Activation::Softmax => cross_entropy(&target, &predicted),
            _ => mean_squared_error(&target, &predicted),
        })
    }

    pub(crate) fn check_input(&self, input: &Array2<f64>) -> ParagonResult<()> {
        let (w, h) = self.input_dims();
        if input.dim() != (h, w) {
            return Err(ParagonError::InvalidArgument(format!(
                "input shape {:?} does not match input layer {h}x{w} (rows x cols)",
                input.dim()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_target(&self, target: &Array2<f64>) -> ParagonResult<()> {
        let (w, h) = self.output_dims();
        if target.dim() != (h, w) {
            return Err(ParagonError::InvalidArgument(format!(
                "target shape {:?} does not match output layer {h}x{w} (rows x cols)",
                target.dim()
            )));
        }
        Ok(())
    }

    /// Run the network on a scalar placed at input (0, 0) and return output (0, 0).
    pub(crate) fn forward_scalar(&mut self, x: f64) -> f64 {
        let input = &mut self.layers[0];
        for neuron in &mut input.neurons {
            neuron.value = 0.0;
            neuron.sum = 0.0;
        }
        if let Some(first) = input.neurons.first_mut() {
            first.value = x;
            first.sum = x;
        }
        input.cached_outputs = input.values();
        self.propagate_layers(None, true);
        self.output().neurons.first().map_or(0.0, |n| n.value)
    }

    pub(crate) fn propagate(&mut self, input: ArrayView2<f64>, mask: Option<Partition>, replay: bool) {
        let grid = &mut self.layers[0];
        for (neuron, &v) in grid.neurons.iter_mut().zip(input.iter()) {
            neuron.value = v;
            neuron.sum = v;
            neuron.input_sum = v;
        }
        grid.cached_outputs = grid.values();
        self.propagate_layers(mask, replay);
    }

    fn propagate_layers(&mut self, mask: Option<Partition>, replay: bool) {
        self.propagate_from(1, mask, replay);
    }

    /// Compute layers `first..` in order, running replay passes around each.
    fn propagate_from(&mut self, first: usize, mask: Option<Partition>, replay: bool) {
        for l in first..self.layers.len() {
            self.layers[l].replay_trace.clear();
            let policy_phase = self.layers[l].replay.phase;

            if replay && policy_phase == ReplayPhase::Before {
                for _ in 0..self.layers[l].replay_repetitions() {
                    self.replay_pass(l, first, mask);
                }
            }

            self.run_layer(l, mask);
            self.layers[l].record_pass();

            if replay && policy_phase == ReplayPhase::After {
                for _ in 0..self.layers[l].replay_repetitions() {
                    self.replay_pass(l, first, mask);
                }
            }

            self.layers[l].remember_outputs();
        }
    }

    /// Recompute the replay window ending at `l` (never below `floor`), then `l` itself.
    fn replay_pass(&mut self, l: usize, floor: usize, mask: Option<Partition>) {
        let back = self.layers[l].replay.offset.unsigned_abs() as usize;
        let start = l.saturating_sub(back).max(floor);
        for k in start..l {
            self.run_layer(k, mask);
        }
        self.run_layer(l, mask);
        self.layers[l].record_pass();
    }

    /// Compute every neuron of layer `l`, then softmax and masking.
    fn run_layer(&mut self, l: usize, mask: Option<Partition>) {
        let parallel = self.parallel;
        let hidden = l != self.output_layer;
        let (lower, upper) = self.layers.split_at_mut(l);
        let lower: &[Grid] = lower;
        let grid = &mut upper[0];

        if parallel && grid.neurons.len() >= PARALLEL_MIN_NEURONS {
            grid.neurons.par_iter_mut().for_each(|n| n.fire(lower));
        } else {
            for neuron in grid.neurons.iter_mut() {
                neuron.fire(lower);
            }
        }

        grid.cached_outputs.clear();
        grid.cached_outputs.extend(grid.neurons.iter().map(|n| n.value));

        if grid.activation == Activation::Softmax {
            let mut probs = grid.cached_outputs.clone();
            softmax_in_place(&mut probs);
            for (neuron, p) in grid.neurons.iter_mut().zip(probs) {
                neuron.value = p;
            }
        }

        if let (true, Some(partition)) = (hidden, mask) {
            for (i, neuron) in grid.neurons.iter_mut().enumerate() {
                if !partition.owns(i) {
                    neuron.value = 0.0;
                }
            }
        }
    }
}

impl Grid {
    /// Snapshot values for backward-inclusive replay.
    fn record_pass(&mut self) {
        if self.replay.enabled && self.replay.update == ReplayUpdate::BackwardInclusive {
            self.replay_trace.push(self.values());
        }
    }

    fn remember_outputs(&mut self) {
        if !self.replay.keeps_history() {
            return;
        }
        self.history.push_back(self.cached_outputs.clone());
        while self.history.len() > self.replay.history_len {
            self.history.pop_front();
        }
    }

    fn replay_repetitions(&self) -> usize {
        self.replay
            .repetitions(&self.cached_outputs, &self.history, self.last_error)
    }
}
