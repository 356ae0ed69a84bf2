//! Partition tags over hidden neurons.
//!
//! With `num_tags = k`, the neuron at row-major index `i` of a hidden layer
//! belongs to partition `i mod k`. The output layer is never masked.

use super::{Network, ParagonError, ParagonResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    pub num_tags: usize,
    pub tag: usize,
}

impl Partition {
    /// # Errors
    /// `InvalidArgument` unless `num_tags ≥ 1` and `tag < num_tags`.
    pub fn new(num_tags: usize, tag: usize) -> ParagonResult<Self> {
        if num_tags == 0 || tag >= num_tags {
            return Err(ParagonError::InvalidArgument(format!(
                "partition tag {tag} out of range for {num_tags} tags"
            )));
        }
        Ok(Self { num_tags, tag })
    }

    #[inline]
    pub fn owns(&self, index: usize) -> bool {
        index % self.num_tags == self.tag
    }
}

impl Network {
    /// Partition of the neuron at `(x, y)` in `layer` under `num_tags` tags.
    pub fn partition_of(&self, layer: usize, x: usize, y: usize, num_tags: usize) -> usize {
        self.layers[layer].index(x, y) % num_tags.max(1)
    }

    /// Row-major indices of the hidden neurons in `layer` owned by `partition`.
    pub fn partition_members(&self, layer: usize, partition: Partition) -> Vec<usize> {
        (0..self.layers[layer].len())
            .filter(|&i| partition.owns(i))
            .collect()
    }

    /// Zero the bias, fan-in and outgoing weights of every hidden neuron in `partition`.
    pub fn silence_partition(&mut self, partition: Partition) {
        let out = self.output_layer;
        for l in 1..out {
            for (i, neuron) in self.layers[l].neurons.iter_mut().enumerate() {
                if partition.owns(i) {
                    neuron.bias = 0.0;
                    for c in &mut neuron.connections {
                        c.weight = 0.0;
                    }
                }
            }
        }
        let widths: Vec<usize> = self.layers.iter().map(|g| g.width).collect();
        for l in 2..self.layers.len() {
            for neuron in &mut self.layers[l].neurons {
                for c in &mut neuron.connections {
                    let src = c.source;
                    let hidden = src.layer >= 1 && src.layer < out;
                    if hidden && partition.owns(src.y * widths[src.layer] + src.x) {
                        c.weight = 0.0;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Activation;

    #[test]
    fn test_partition_owns_modulo() {
        let p = Partition::new(3, 1).unwrap();
        assert!(p.owns(1));
        assert!(p.owns(4));
        assert!(!p.owns(0));
        assert!(Partition::new(0, 0).is_err());
        assert!(Partition::new(2, 2).is_err());
    }

    #[test]
    fn test_partitions_cover_layer_disjointly() {
        let net = Network::new(
            &[(2, 1), (5, 2), (1, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Linear],
            &[true, true, true],
            1,
        )
        .unwrap();
        let a = net.partition_members(1, Partition::new(2, 0).unwrap());
        let b = net.partition_members(1, Partition::new(2, 1).unwrap());
        assert_eq!(a.len() + b.len(), 10);
        assert!(a.iter().all(|i| !b.contains(i)));
        assert_eq!(net.partition_of(1, 1, 1, 2), 0);
    }
}
