//! Structural growth: widening hidden layers, inserting layers, and the
//! candidate search that decides whether a new layer helps.
//!
//! Growth never disturbs existing parameters. New neurons get fresh
//! incoming weights; a fully connected downstream layer gets new
//! connections appended after its existing fan-in, so zeroing the new
//! parameters reproduces the old outputs exactly.

pub mod evolve;
pub mod micro;

pub use micro::MicroNetwork;
pub use evolve::{
    search_dimension_shapes, Candidate, Evolution, EvolutionConfig, EvolutionReport,
    GenerationSummary, Mutation, SubNetworkShape,
};

use ndarray::Array2;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::core::{Connection, Coord, Dimension, Grid, Network, Neuron, ParagonError, ParagonResult};
use crate::pool::TrainingPool;
use crate::training::{predicted_labels, target_labels, train};
use crate::utils::{Activation, ClipBounds};
use crate::TrainConfig;

impl Network {
    /// Append `count` neurons to hidden layer `layer`, as whole new columns.
    ///
    /// New neurons take the layer's activation and shared sub-network (if
    /// any) and receive fresh fan-in from the layer below. A fully connected
    /// next layer gets one new connection per new neuron, appended in
    /// row-major order of the new neurons.
    ///
    /// # Errors
    /// `InvalidArgument` for the input or output layer, or when `count` is
    /// not a multiple of the layer height.
    pub fn add_neurons_to_layer(&mut self, layer: usize, count: usize) -> ParagonResult<()> {
        if layer == 0 || layer >= self.output_layer {
            return Err(ParagonError::InvalidArgument(format!(
                "can only grow hidden layers (1..{}), got {layer}",
                self.output_layer
            )));
        }
        if count == 0 {
            return Ok(());
        }
        let height = self.layers[layer].height;
        if count % height != 0 {
            return Err(ParagonError::InvalidArgument(format!(
                "{count} neurons do not fill whole columns of height {height}"
            )));
        }

        let grid = &mut self.layers[layer];
        let old_w = grid.width;
        let new_w = old_w + count / height;
        let activation = grid.activation;
        let shared = grid.shared_dimension.clone();
        let mut old = std::mem::take(&mut grid.neurons);
        let mut rebuilt = Vec::with_capacity(new_w * height);
        for _ in 0..height {
            rebuilt.extend(old.drain(..old_w));
            for _ in old_w..new_w {
                let mut neuron = Neuron::new(activation);
                neuron.dimension = shared.as_ref().map(|s| Dimension::Shared(s.clone()));
                rebuilt.push(neuron);
            }
        }
        grid.neurons = rebuilt;
        grid.width = new_w;
        grid.reset_caches();

        // fan-in of the new neurons
        let init = self.init;
        for y in 0..height {
            for x in old_w..new_w {
                let sources = self.sources_for(layer, layer - 1, x, y);
                let fan_in = sources.len();
                let connections: Vec<Connection> = sources
                    .into_iter()
                    .map(|(sx, sy)| Connection {
                        source: Coord::new(layer - 1, sx, sy),
                        weight: init.sample(&mut self.rng, fan_in),
                    })
                    .collect();
                self.layers[layer].neuron_mut(x, y).connections = connections;
            }
        }

        // existing coordinates are unchanged, only the downstream fan-in grows
        let next = layer + 1;
        if self.layers[next].fully_connected {
            let new_coords: Vec<Coord> = (0..height)
                .flat_map(|y| (old_w..new_w).map(move |x| Coord::new(layer, x, y)))
                .collect();
            let next_grid = &mut self.layers[next];
            for neuron in &mut next_grid.neurons {
                let fan_in = neuron.connections.len() + new_coords.len();
                for &source in &new_coords {
                    neuron.connections.push(Connection {
                        source,
                        weight: init.sample(&mut self.rng, fan_in),
                    });
                }
            }
        }
        debug!(layer, added = count, width = new_w, "grew layer");
        Ok(())
    }

    /// Insert a new layer directly after layer `after`.
    ///
    /// The new layer is wired from `after`, and the layer that used to follow
    /// `after` is rewired from the new layer with fresh weights (its biases and
    /// sub-networks are kept). Every other connection keeps its weight, with
    /// source indices shifted past the insertion point.
    pub fn add_layer(
        &mut self,
        after: usize,
        width: usize,
        height: usize,
        activation: Activation,
        fully_connected: bool,
    ) -> ParagonResult<()> {
        if after >= self.output_layer {
            return Err(ParagonError::InvalidArgument(format!(
                "cannot insert after layer {after}; the output layer is {}",
                self.output_layer
            )));
        }
        if width == 0 || height == 0 {
            return Err(ParagonError::Construction(format!(
                "new layer has a zero dimension ({width}x{height})"
            )));
        }
        let at = after + 1;
        for grid in &mut self.layers[at..] {
            for neuron in &mut grid.neurons {
                for c in &mut neuron.connections {
                    if c.source.layer >= at {
                        c.source.layer += 1;
                    }
                }
            }
        }
        self.layers.insert(at, Grid::new(width, height, activation, fully_connected));
        self.output_layer += 1;
        self.connect_from(at, after);
        self.connect_from(at + 1, at);
        self.layers[at + 1].reset_caches();
        debug!(at, width, height, %activation, "inserted layer");
        Ok(())
    }

    /// Try `num_candidates` random layers after `checkpoint_layer`, keep the best.
    ///
    /// Each candidate is a copy of this network with one extra layer, trained
    /// for a few epochs and scored with ADHD on `(inputs, targets)`. The
    /// network is replaced only if the best score beats the current score by
    /// more than `tolerance`. Candidates train in parallel, bounded by `pool`.
    ///
    /// Returns whether the network changed.
    pub fn grow(
        &mut self,
        config: &GrowConfig,
        inputs: &[Array2<f64>],
        targets: &[Array2<f64>],
        pool: &TrainingPool,
    ) -> ParagonResult<bool> {
        config.validate(self)?;
        let labels = target_labels(targets);
        let predicted = predicted_labels(self, inputs)?;
        let baseline = self.evaluate_model(&labels, &predicted)?;

        let seeds: Vec<u64> = (0..config.num_candidates).map(|_| self.rng.next_u64()).collect();
        let parent: &Network = self;
        let results = seeds
            .par_iter()
            .map(|&seed| {
                let _permit = pool.acquire();
                grow_candidate(parent, config, inputs, targets, &labels, seed)
            })
            .collect::<ParagonResult<Vec<_>>>()?;

        let best = results
            .into_iter()
            .enumerate()
            .max_by(|(ia, (a, _)), (ib, (b, _))| a.total_cmp(b).then(ib.cmp(ia)));
        match best {
            Some((index, (score, candidate))) if score > baseline + config.tolerance => {
                info!(baseline, score, candidate = index, "growth accepted");
                *self = candidate;
                Ok(true)
            }
            Some((_, (score, _))) => {
                info!(baseline, best = score, "growth rejected");
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

fn grow_candidate(
    parent: &Network,
    config: &GrowConfig,
    inputs: &[Array2<f64>],
    targets: &[Array2<f64>],
    labels: &[f64],
    seed: u64,
) -> ParagonResult<(f64, Network)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut candidate = parent.deep_clone();
    candidate.reseed(rng.next_u64());
    let width = rng.gen_range(config.width_range.0..=config.width_range.1);
    let height = rng.gen_range(config.height_range.0..=config.height_range.1);
    let activation = config.activations[rng.gen_range(0..config.activations.len())];
    candidate.add_layer(config.checkpoint_layer, width, height, activation, true)?;
    train(&mut candidate, inputs, targets, &config.train)?;
    let predicted = predicted_labels(&mut candidate, inputs)?;
    let score = candidate.evaluate_model(labels, &predicted)?;
    debug!(width, height, %activation, score, "growth candidate");
    Ok((score, candidate))
}

/// Settings for [`Network::grow`].
#[derive(Debug, Clone)]
pub struct GrowConfig {
    /// New layers are inserted right after this layer
    pub checkpoint_layer: usize,
    pub num_candidates: usize,
    /// Training applied to every candidate
    pub train: TrainConfig,
    /// Required ADHD improvement
    pub tolerance: f64,
    /// Inclusive range for the new layer's width
    pub width_range: (usize, usize),
    pub height_range: (usize, usize),
    pub activations: Vec<Activation>,
}

impl Default for GrowConfig {
    fn default() -> Self {
        Self {
            checkpoint_layer: 1,
            num_candidates: 8,
            train: TrainConfig {
                epochs: 5,
                learning_rate: 0.05,
                shuffle: false,
                clip: Some(ClipBounds {
                    upper: 1.0,
                    lower: -1.0,
                }),
                ..TrainConfig::default()
            },
            tolerance: 1e-6,
            width_range: (2, 8),
            height_range: (1, 4),
            activations: vec![Activation::Relu, Activation::Sigmoid, Activation::Tanh],
        }
    }
}

impl GrowConfig {
    fn validate(&self, net: &Network) -> ParagonResult<()> {
        if self.checkpoint_layer >= net.output_layer {
            return Err(ParagonError::InvalidArgument(format!(
                "checkpoint layer {} must be below the output layer {}",
                self.checkpoint_layer, net.output_layer
            )));
        }
        let (wmin, wmax) = self.width_range;
        let (hmin, hmax) = self.height_range;
        if wmin == 0 || hmin == 0 || wmin > wmax || hmin > hmax {
            return Err(ParagonError::InvalidArgument(format!(
                "bad layer size ranges: width {wmin}..={wmax}, height {hmin}..={hmax}"
            )));
        }
        if self.activations.is_empty() || self.num_candidates == 0 {
            return Err(ParagonError::InvalidArgument(
                "growth needs at least one candidate and one activation".to_string(),
            ));
        }
        Ok(())
    }
}
