//! Micro networks: a host cut down to its input, one checkpoint layer and
//! every layer above it.
//!
//! Fed the host's checkpoint state, the micro network reproduces the host's
//! output exactly, so the upper layers can be checked, trained or swapped in
//! isolation and written back with [`MicroNetwork::reattach`]. Run from its
//! own input, the micro network takes a shortcut: the checkpoint layer is
//! wired straight from the input with fresh weights (unless the checkpoint
//! already sits on the input).

use ndarray::{Array1, Array2};
use tracing::{debug, info};

use crate::core::{Grid, Network, ParagonError, ParagonResult};

/// Layers `[input, checkpoint, checkpoint + 1, ..., output]` of a host network.
#[derive(Debug, Clone)]
pub struct MicroNetwork {
    pub network: Network,
    /// Host layer behind each micro layer
    pub source_layers: Vec<usize>,
    /// Host layer the micro network starts from
    pub checkpoint: usize,
}

impl Network {
    /// Cut out a [`MicroNetwork`] at hidden layer `checkpoint`.
    ///
    /// Sub-networks and replay settings of the copied layers come along as
    /// independent copies.
    ///
    /// # Errors
    /// `InvalidArgument` if `checkpoint` is not a hidden layer or a layer
    /// above it reads from below the checkpoint.
    pub fn extract_micro_network(&self, checkpoint: usize) -> ParagonResult<MicroNetwork> {
        if checkpoint == 0 || checkpoint >= self.output_layer {
            return Err(ParagonError::InvalidArgument(format!(
                "checkpoint must be a hidden layer (1..{}), got {checkpoint}",
                self.output_layer
            )));
        }
        for l in checkpoint + 1..=self.output_layer {
            if let Some(c) = self.layers[l]
                .neurons
                .iter()
                .flat_map(|n| n.connections.iter())
                .find(|c| c.source.layer < checkpoint)
            {
                return Err(ParagonError::InvalidArgument(format!(
                    "layer {l} reads from layer {} below checkpoint {checkpoint}",
                    c.source.layer
                )));
            }
        }

        let shift = checkpoint - 1;
        let input = &self.layers[0];
        let mut layers = vec![Grid::new(input.width, input.height, input.activation, input.fully_connected)];
        layers.extend((checkpoint..=self.output_layer).map(|l| {
            let mut grid = self.layers[l].deep_clone();
            if l > checkpoint {
                shift_sources(&mut grid, |layer| layer - shift);
            }
            grid
        }));

        let mut net = Network::empty(layers, self.seed, self.init);
        net.max_depth = self.max_depth;
        net.parallel = self.parallel;
        net.debug = self.debug;
        net.replay_in_eval = self.replay_in_eval;
        if checkpoint > 1 {
            net.connect_from(1, 0);
        }
        net.set_depth(self.depth);
        net.validate()?;

        let mut source_layers = vec![0];
        source_layers.extend(checkpoint..=self.output_layer);
        debug!(checkpoint, layers = net.layers.len(), "extracted micro network");
        Ok(MicroNetwork {
            network: net,
            source_layers,
            checkpoint,
        })
    }

    /// Extract a micro network at `checkpoint` and prove it equivalent.
    ///
    /// For every input the host's full output, the host's output recomputed
    /// from its checkpoint state, and the micro network's output from that
    /// state must agree within `tolerance`.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty input set, a negative tolerance or an
    /// unusable checkpoint; `Numeric` if the outputs disagree.
    pub fn network_surgery(
        &mut self,
        checkpoint: usize,
        inputs: &[Array2<f64>],
        tolerance: f64,
    ) -> ParagonResult<MicroNetwork> {
        if !(tolerance >= 0.0) {
            return Err(ParagonError::InvalidArgument(format!(
                "tolerance must be non-negative, got {tolerance}"
            )));
        }
        let mut micro = self.extract_micro_network(checkpoint)?;
        let divergence = micro.max_divergence(self, inputs)?;
        if divergence > tolerance {
            return Err(ParagonError::Numeric(format!(
                "micro network diverges from the host by {divergence:e} (tolerance {tolerance:e})"
            )));
        }
        info!(checkpoint, divergence, samples = inputs.len(), "surgery verified");
        Ok(micro)
    }
}

impl MicroNetwork {
    /// Run the layers above the checkpoint on a host checkpoint state.
    pub fn forward_from_checkpoint(&mut self, state: &[f64]) -> ParagonResult<Array1<f64>> {
        self.network.forward_from_layer(1, state)
    }

    /// Largest absolute output difference between the three paths (host full
    /// forward, host from checkpoint, micro from checkpoint) over `inputs`.
    pub fn max_divergence(&mut self, host: &mut Network, inputs: &[Array2<f64>]) -> ParagonResult<f64> {
        if inputs.is_empty() {
            return Err(ParagonError::InvalidArgument("no inputs to compare".to_string()));
        }
        self.check_host(host)?;
        let mut worst = 0.0f64;
        for input in inputs {
            host.forward(input)?;
            let full = host.extract_output();
            let state = host.layer_state(self.checkpoint)?;
            let resumed = host.forward_from_layer(self.checkpoint, &state)?;
            let micro = self.forward_from_checkpoint(&state)?;
            for ((a, b), c) in full.iter().zip(&resumed).zip(&micro) {
                let d = (a - b).abs().max((b - c).abs()).max((a - c).abs());
                worst = if d.is_nan() { f64::INFINITY } else { worst.max(d) };
            }
        }
        Ok(worst)
    }

    /// Whether every path agrees within `tolerance` on every input.
    pub fn verify_equivalence(&mut self, host: &mut Network, inputs: &[Array2<f64>], tolerance: f64) -> ParagonResult<bool> {
        Ok(self.max_divergence(host, inputs)? <= tolerance)
    }

    /// Write the layers above the checkpoint back into `host`.
    ///
    /// # Errors
    /// `InvalidArgument` if `host` no longer has the shape the micro network
    /// was cut from.
    pub fn reattach(&self, host: &mut Network) -> ParagonResult<()> {
        self.check_host(host)?;
        let shift = self.checkpoint - 1;
        for (k, &l) in self.source_layers.iter().enumerate().skip(2) {
            let mut grid = self.network.layers[k].deep_clone();
            shift_sources(&mut grid, |layer| layer + shift);
            grid.reset_caches();
            host.layers[l] = grid;
        }
        host.set_depth(host.depth);
        host.validate()?;
        debug!(checkpoint = self.checkpoint, "reattached micro network");
        Ok(())
    }

    fn check_host(&self, host: &Network) -> ParagonResult<()> {
        let matches = host.output_layer + 1 == self.checkpoint + self.network.layers.len() - 1
            && self.source_layers.iter().enumerate().skip(1).all(|(k, &l)| {
                let (a, b) = (&self.network.layers[k], &host.layers[l]);
                a.width == b.width && a.height == b.height
            });
        if matches {
            Ok(())
        } else {
            Err(ParagonError::InvalidArgument(format!(
                "host no longer matches the micro network cut at layer {}",
                self.checkpoint
            )))
        }
    }
}

fn shift_sources(grid: &mut Grid, map: impl Fn(usize) -> usize) {
    for neuron in &mut grid.neurons {
        for c in &mut neuron.connections {
            c.source.layer = map(c.source.layer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Connection, Coord};
    use crate::utils::Activation;
    use ndarray::array;

    fn host() -> Network {
        Network::new(
            &[(3, 1), (8, 1), (6, 1), (2, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Tanh, Activation::Softmax],
            &[false, true, true, true],
            42,
        )
        .unwrap()
    }

    fn inputs() -> Vec<Array2<f64>> {
        vec![array![[0.1, 0.5, 0.9]], array![[0.3, 0.7, 0.2]], array![[0.8, 0.1, 0.6]]]
    }

    #[test]
    fn test_extract_layout() {
        let net = host();
        let micro = net.extract_micro_network(2).unwrap();
        assert_eq!(micro.source_layers, vec![0, 2, 3]);
        assert_eq!(micro.network.num_layers(), 3);
        assert_eq!(micro.network.layers[1].len(), 6);
        assert_eq!(micro.network.layers[1].neurons[0].connections.len(), 3);
        assert!(micro.network.layers[2].neurons[0].connections.iter().all(|c| c.source.layer == 1));
    }

    #[test]
    fn test_checkpoint_paths_agree() {
        let mut net = host();
        let mut micro = net.extract_micro_network(2).unwrap();
        assert!(micro.verify_equivalence(&mut net, &inputs(), 1e-10).unwrap());
        assert_eq!(micro.max_divergence(&mut net, &inputs()).unwrap(), 0.0);

        // the shortcut from the input is a different path
        let input = &inputs()[0];
        net.forward(input).unwrap();
        let state = net.layer_state(2).unwrap();
        let from_checkpoint = micro.forward_from_checkpoint(&state).unwrap();
        micro.network.forward(input).unwrap();
        assert_ne!(micro.network.extract_output(), from_checkpoint);
    }

    #[test]
    fn test_first_layer_checkpoint_keeps_input_path() {
        let mut net = host();
        let mut micro = net.extract_micro_network(1).unwrap();
        for input in inputs() {
            net.forward(&input).unwrap();
            micro.network.forward(&input).unwrap();
            assert_eq!(net.extract_output(), micro.network.extract_output());
        }
    }

    #[test]
    fn test_extract_rejects_bad_checkpoints() {
        let mut net = host();
        assert!(net.extract_micro_network(0).is_err());
        assert!(net.extract_micro_network(3).is_err());
        net.layers[3].neurons[0].connections.push(Connection {
            source: Coord::new(1, 0, 0),
            weight: 0.5,
        });
        assert!(matches!(
            net.extract_micro_network(2),
            Err(ParagonError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_surgery_verifies_and_reattach_transplants() {
        let mut net = host();
        let mut micro = net.network_surgery(2, &inputs(), 1e-10).unwrap();
        assert!(net.network_surgery(2, &[], 1e-10).is_err());
        assert!(net.network_surgery(2, &inputs(), -1.0).is_err());

        micro.network.layers[2].neurons[0].bias += 0.25;
        assert!(micro.max_divergence(&mut net, &inputs()).unwrap() > 1e-6);

        micro.reattach(&mut net).unwrap();
        assert_eq!(net.layers[3].neurons[0].bias, micro.network.layers[2].neurons[0].bias);
        assert!(net.layers[3].neurons[0].connections.iter().all(|c| c.source.layer == 2));
        assert_eq!(micro.max_divergence(&mut net, &inputs()).unwrap(), 0.0);
    }

    #[test]
    fn test_reattach_rejects_reshaped_host() {
        let mut net = host();
        let micro = net.extract_micro_network(2).unwrap();
        net.add_neurons_to_layer(2, 2).unwrap();
        assert!(micro.reattach(&mut net).is_err());
    }
}
