//! Attaching nested sub-networks ("dimensions") to neurons.
//!
//! A sub-network takes a single scalar at input `(0, 0)` and its output
//! neuron `(0, 0)` replaces the host neuron's pre-activation sum. Nesting is
//! bounded: `depth(host) + 1 + height(sub) ≤ max_depth`.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tracing::debug;

use crate::core::{Dimension, Network, ParagonError, ParagonResult, SharedNetwork};
use crate::utils::{Activation, WeightInit};

/// How [`Network::set_layer_dimension`] builds sub-networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionOptions {
    /// One sub-network for the whole layer instead of one per neuron
    pub shared: bool,
    pub init: WeightInit,
}

impl Network {
    /// Give every neuron of `layer` a sub-network of the given shape.
    ///
    /// Sub-network seeds are drawn from this network's RNG, so the result is
    /// reproducible from the parent seed.
    ///
    /// # Errors
    /// `Construction` for an invalid shape, `Attachment` if the input is not
    /// 1×1 or the nesting bound would be exceeded, `InvalidArgument` for a
    /// missing layer.
    pub fn set_layer_dimension(
        &mut self,
        layer: usize,
        sizes: &[(usize, usize)],
        activations: &[Activation],
        fully_connected: &[bool],
        options: DimensionOptions,
    ) -> ParagonResult<()> {
        self.check_host_layer(layer)?;
        let seed = self.rng.next_u64();
        let proto = Network::with_init(sizes, activations, fully_connected, seed, options.init)?;
        self.check_attachable(&proto)?;

        if options.shared {
            self.attach_shared_dimension(layer, proto)?;
        } else {
            let count = self.layers[layer].len();
            let mut subs = Vec::with_capacity(count);
            subs.push(proto);
            for _ in 1..count {
                let seed = self.rng.next_u64();
                subs.push(Network::with_init(sizes, activations, fully_connected, seed, options.init)?);
            }
            let (depth, max_depth) = (self.depth, self.max_depth);
            let grid = &mut self.layers[layer];
            grid.shared_dimension = None;
            for (neuron, mut sub) in grid.neurons.iter_mut().zip(subs) {
                sub.max_depth = max_depth;
                sub.set_depth(depth + 1);
                neuron.dimension = Some(Dimension::Owned(Box::new(sub)));
            }
        }
        debug!(layer, shared = options.shared, "attached layer sub-networks");
        Ok(())
    }

    /// Attach `sub` to the single neuron at `(x, y)` of `layer`.
    pub fn attach_dimension(&mut self, layer: usize, x: usize, y: usize, mut sub: Network) -> ParagonResult<()> {
        self.check_host_layer(layer)?;
        if !self.layers[layer].contains(x, y) {
            return Err(ParagonError::InvalidArgument(format!(
                "no neuron at ({x}, {y}) in layer {layer}"
            )));
        }
        self.check_attachable(&sub)?;
        sub.max_depth = self.max_depth;
        sub.set_depth(self.depth + 1);
        self.layers[layer].neuron_mut(x, y).dimension = Some(Dimension::Owned(Box::new(sub)));
        Ok(())
    }

    /// Attach one sub-network shared by every neuron of `layer`.
    ///
    /// Returns the handle so callers can inspect the shared parameters.
    pub fn attach_shared_dimension(&mut self, layer: usize, mut sub: Network) -> ParagonResult<SharedNetwork> {
        self.check_host_layer(layer)?;
        self.check_attachable(&sub)?;
        sub.max_depth = self.max_depth;
        sub.set_depth(self.depth + 1);
        let shared = Arc::new(Mutex::new(sub));
        self.install_shared(layer, Arc::clone(&shared));
        Ok(shared)
    }

    /// Point every neuron of `layer` at an existing shared sub-network.
    pub(crate) fn install_shared(&mut self, layer: usize, shared: SharedNetwork) {
        let grid = &mut self.layers[layer];
        for neuron in &mut grid.neurons {
            neuron.dimension = Some(Dimension::Shared(Arc::clone(&shared)));
        }
        grid.shared_dimension = Some(shared);
    }

    /// Remove every sub-network from `layer`.
    pub fn detach_layer_dimension(&mut self, layer: usize) -> ParagonResult<()> {
        self.check_host_layer(layer)?;
        let grid = &mut self.layers[layer];
        grid.shared_dimension = None;
        for neuron in &mut grid.neurons {
            neuron.dimension = None;
        }
        Ok(())
    }

    /// Whether any neuron of any layer has a sub-network.
    pub fn has_dimensions(&self) -> bool {
        self.layers
            .iter()
            .flat_map(|g| g.neurons.iter())
            .any(|n| n.dimension.is_some())
    }

    fn check_host_layer(&self, layer: usize) -> ParagonResult<()> {
        if layer == 0 || layer >= self.layers.len() {
            return Err(ParagonError::InvalidArgument(format!(
                "layer {layer} cannot host sub-networks (layers 1..{} can)",
                self.layers.len()
            )));
        }
        Ok(())
    }

    fn check_attachable(&self, sub: &Network) -> ParagonResult<()> {
        if sub.input_dims() != (1, 1) {
            let (w, h) = sub.input_dims();
            return Err(ParagonError::Attachment(format!(
                "sub-network input must be 1x1, got {w}x{h}"
            )));
        }
        let needed = self.depth + 1 + sub.dimension_height();
        if needed > self.max_depth {
            return Err(ParagonError::Attachment(format!(
                "nesting depth {needed} exceeds max depth {}",
                self.max_depth
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn host() -> Network {
        Network::new(
            &[(2, 1), (3, 1), (1, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Sigmoid],
            &[true, true, true],
            21,
        )
        .unwrap()
    }

    fn sub(seed: u64) -> Network {
        Network::new(
            &[(1, 1), (2, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            seed,
        )
        .unwrap()
    }

    #[test]
    fn test_layer_dimension_owned_per_neuron() {
        let mut net = host();
        net.set_layer_dimension(
            1,
            &[(1, 1), (2, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            DimensionOptions::default(),
        )
        .unwrap();
        assert!(net.layers[1].neurons.iter().all(|n| matches!(n.dimension, Some(Dimension::Owned(_)))));
        assert_eq!(net.dimension_height(), 1);
        net.forward(&array![[0.2, 0.9]]).unwrap();
        assert!(net.extract_output()[0].is_finite());
    }

    #[test]
    fn test_shared_dimension_is_one_network() {
        let mut net = host();
        let handle = net.attach_shared_dimension(1, sub(3)).unwrap();
        for neuron in &net.layers[1].neurons {
            match &neuron.dimension {
                Some(Dimension::Shared(s)) => assert!(Arc::ptr_eq(s, &handle)),
                _ => panic!("expected shared sub-network"),
            }
        }
        assert_eq!(handle.lock().depth(), 1);
    }

    #[test]
    fn test_rejects_wide_input() {
        let mut net = host();
        let wide = Network::new(
            &[(2, 1), (1, 1)],
            &[Activation::Linear, Activation::Linear],
            &[true, true],
            1,
        )
        .unwrap();
        assert!(matches!(net.attach_dimension(1, 0, 0, wide), Err(ParagonError::Attachment(_))));
    }

    #[test]
    fn test_depth_bound() {
        let mut net = host();
        net.max_depth = 1;
        let mut nested = sub(4);
        nested.attach_dimension(1, 0, 0, sub(5)).unwrap();
        assert!(matches!(net.attach_dimension(1, 0, 0, nested), Err(ParagonError::Attachment(_))));
        assert!(net.attach_dimension(1, 0, 0, sub(6)).is_ok());
    }

    #[test]
    fn test_detach_removes_everything() {
        let mut net = host();
        net.attach_shared_dimension(2, sub(8)).unwrap();
        assert!(net.has_dimensions());
        net.detach_layer_dimension(2).unwrap();
        assert!(!net.has_dimensions());
        assert!(net.layers[2].shared_dimension().is_none());
        assert!(net.detach_layer_dimension(0).is_err());
    }
}
