//! Network core: grids of neurons, construction and structural invariants.
//!
//! A [`Network`] is an ordered list of [`Grid`]s. Layer 0 is the input and the
//! last layer is the output. Every neuron owns its fan-in as a list of
//! [`Connection`]s pointing at strictly lower layers, and may own (or share
//! with its layer) a nested sub-network that transforms its pre-activation sum.
//!
//! ```text
//! sum   = bias + Σ source.value · weight
//! sum'  = sub(sum)            (only when a sub-network is attached)
//! value = f(sum')
//! ```
//!
//! The forward and backward passes live in the `forward` and `backward`
//! submodules, reverse inference in `reverse`; partition tags in [`partition`].

mod backward;
mod forward;
pub mod partition;
mod reverse;

pub use backward::Gradients;
pub use partition::Partition;
pub use reverse::REVERSE_RIDGE;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adhd::Performance;
use crate::replay::ReplayPolicy;
use crate::utils::{parse_activations, Activation, WeightInit};

/// Default bound on sub-network nesting.
pub const DEFAULT_MAX_DEPTH: usize = 4;

/// Error type for all paragon operations.
#[derive(Debug, Error)]
pub enum ParagonError {
    /// Bad shapes, labels or connectivity while building a network
    #[error("construction error: {0}")]
    Construction(String),
    /// Sub-network could not be attached
    #[error("attachment error: {0}")]
    Attachment(String),
    /// Argument rejected by an operation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Non-finite loss or gradient for a sample
    #[error("numeric error: {0}")]
    Numeric(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("operation cancelled")]
    Cancelled,
}

pub type ParagonResult<T> = Result<T, ParagonError>;

/// Position of a neuron: layer index and grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub layer: usize,
    pub x: usize,
    pub y: usize,
}

impl Coord {
    pub fn new(layer: usize, x: usize, y: usize) -> Self {
        Self { layer, x, y }
    }
}

/// Directed weighted edge from `source` into the owning neuron.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connection {
    pub source: Coord,
    pub weight: f64,
}

/// A sub-network shared by every neuron of one layer.
pub type SharedNetwork = Arc<Mutex<Network>>;

/// Nested network attached to a neuron.
#[derive(Debug)]
pub enum Dimension {
    Owned(Box<Network>),
    Shared(SharedNetwork),
}

impl Dimension {
    pub fn is_shared(&self) -> bool {
        matches!(self, Dimension::Shared(_))
    }

    /// Nesting height contributed by this sub-network (1 + its own height).
    pub fn height(&self) -> usize {
        match self {
            Dimension::Owned(net) => 1 + net.dimension_height(),
            Dimension::Shared(net) => 1 + net.lock().dimension_height(),
        }
    }

    /// Run the sub-network on a scalar and return its scalar output.
    pub(crate) fn transform(&mut self, x: f64) -> f64 {
        match self {
            Dimension::Owned(net) => net.forward_scalar(x),
            Dimension::Shared(net) => net.lock().forward_scalar(x),
        }
    }
}

/// A single unit of a grid.
#[derive(Debug)]
pub struct Neuron {
    pub bias: f64,
    /// Output from the most recent forward pass
    pub value: f64,
    pub activation: Activation,
    /// Fan-in, in evaluation order
    pub connections: Vec<Connection>,
    pub dimension: Option<Dimension>,
    /// Weighted sum before any sub-network
    pub(crate) input_sum: f64,
    /// Pre-activation value after the sub-network
    pub(crate) sum: f64,
}

impl Neuron {
    pub fn new(activation: Activation) -> Self {
        Self {
            bias: 0.0,
            value: 0.0,
            activation,
            connections: Vec::new(),
            dimension: None,
            input_sum: 0.0,
            sum: 0.0,
        }
    }

    /// Pre-activation value seen by the activation function on the last forward.
    pub fn pre_activation(&self) -> f64 {
        self.sum
    }
}

/// One layer: a `width × height` arrangement of neurons stored row-major.
#[derive(Debug)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    pub activation: Activation,
    pub fully_connected: bool,
    pub neurons: Vec<Neuron>,
    pub replay: ReplayPolicy,
    /// Pre-softmax outputs from the last computation of this layer
    pub cached_outputs: Vec<f64>,
    /// Recent cached outputs, kept for temporal gates
    pub history: VecDeque<Vec<f64>>,
    /// Values after every pass of the last forward (backward-inclusive replay only)
    pub(crate) replay_trace: Vec<Vec<f64>>,
    /// Mean absolute local error from the last backward
    pub(crate) last_error: f64,
    pub(crate) shared_dimension: Option<SharedNetwork>,
}

impl Grid {
    pub fn new(width: usize, height: usize, activation: Activation, fully_connected: bool) -> Self {
        Self {
            width,
            height,
            activation,
            fully_connected,
            neurons: (0..width * height).map(|_| Neuron::new(activation)).collect(),
            replay: ReplayPolicy::default(),
            cached_outputs: Vec::new(),
            history: VecDeque::new(),
            replay_trace: Vec::new(),
            last_error: 0.0,
            shared_dimension: None,
        }
    }

    pub fn len(&self) -> usize {
        self.neurons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neurons.is_empty()
    }

    /// Row-major index of `(x, y)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    /// Grid coordinates of a row-major index.
    #[inline]
    pub fn coord(&self, index: usize) -> (usize, usize) {
        (index % self.width, index / self.width)
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }

    pub fn neuron(&self, x: usize, y: usize) -> &Neuron {
        &self.neurons[self.index(x, y)]
    }

    pub fn neuron_mut(&mut self, x: usize, y: usize) -> &mut Neuron {
        let idx = self.index(x, y);
        &mut self.neurons[idx]
    }

    #[inline]
    pub fn value_at(&self, x: usize, y: usize) -> f64 {
        self.neurons[y * self.width + x].value
    }

    pub fn values(&self) -> Vec<f64> {
        self.neurons.iter().map(|n| n.value).collect()
    }

    /// Sub-network shared by this layer, if any.
    pub fn shared_dimension(&self) -> Option<&SharedNetwork> {
        self.shared_dimension.as_ref()
    }

    /// Mean absolute local error recorded by the last backward pass.
    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    /// Forget transient state that no longer matches the layer's shape.
    pub(crate) fn reset_caches(&mut self) {
        self.cached_outputs.clear();
        self.history.clear();
        self.replay_trace.clear();
    }
}

/// A layered feed-forward network of grids.
///
/// # Construction
///
/// Layer `l ≥ 1` receives connections from layer `l-1`: every neuron when the
/// layer is fully connected, otherwise a 3×3 receptive field centred on the
/// proportionally scaled coordinate. Weights are drawn from `N(0, scale²)`
/// using the network's seeded RNG; biases start at zero.
pub struct Network {
    pub layers: Vec<Grid>,
    pub output_layer: usize,
    pub seed: u64,
    pub init: WeightInit,
    /// ADHD performance record from the last evaluation
    pub performance: Performance,
    /// Promote per-epoch training logs to `info`
    pub debug: bool,
    /// Compute wide layers with rayon
    pub parallel: bool,
    /// Keep replay active for evaluation forwards
    pub replay_in_eval: bool,
    pub max_depth: usize,
    pub(crate) depth: usize,
    pub(crate) rng: ChaCha8Rng,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape: Vec<String> = self
            .layers
            .iter()
            .map(|g| format!("{}x{}:{}", g.width, g.height, g.activation))
            .collect();
        f.debug_struct("Network")
            .field("layers", &shape)
            .field("seed", &self.seed)
            .field("init", &self.init)
            .field("depth", &self.depth)
            .field("sub_networks", &self.dimension_height())
            .finish()
    }
}

impl Network {
    /// Build a network with Xavier initialization.
    ///
    /// # Errors
    /// `Construction` if the lists disagree in length, there are fewer than two
    /// layers, or any layer has a zero dimension.
    pub fn new(
        sizes: &[(usize, usize)],
        activations: &[Activation],
        fully_connected: &[bool],
        seed: u64,
    ) -> ParagonResult<Self> {
        Self::with_init(sizes, activations, fully_connected, seed, WeightInit::Xavier)
    }

    /// Build a network from activation labels such as `"relu"`.
    pub fn from_labels(
        sizes: &[(usize, usize)],
        activations: &[&str],
        fully_connected: &[bool],
        seed: u64,
    ) -> ParagonResult<Self> {
        let acts = parse_activations(activations)?;
        Self::new(sizes, &acts, fully_connected, seed)
    }

    /// Build a network with an explicit initialization scheme.
    pub fn with_init(
        sizes: &[(usize, usize)],
        activations: &[Activation],
        fully_connected: &[bool],
        seed: u64,
        init: WeightInit,
    ) -> ParagonResult<Self> {
        if sizes.len() < 2 {
            return Err(ParagonError::Construction(
                "need at least 2 layers (input and output)".to_string(),
            ));
        }
        if activations.len() != sizes.len() || fully_connected.len() != sizes.len() {
            return Err(ParagonError::Construction(format!(
                "{} layer sizes but {} activations and {} connectivity flags",
                sizes.len(),
                activations.len(),
                fully_connected.len()
            )));
        }
        if let Some((i, _)) = sizes.iter().enumerate().find(|(_, (w, h))| *w == 0 || *h == 0) {
            return Err(ParagonError::Construction(format!(
                "layer {i} has a zero dimension"
            )));
        }

        let layers = sizes
            .iter()
            .zip(activations)
            .zip(fully_connected)
            .map(|((&(w, h), &act), &fc)| Grid::new(w, h, act, fc))
            .collect::<Vec<_>>();

        let mut net = Self::empty(layers, seed, init);
        for l in 1..net.layers.len() {
            net.connect_from(l, l - 1);
        }
        Ok(net)
    }

    /// Assemble a network around existing layers without wiring them.
    pub(crate) fn empty(layers: Vec<Grid>, seed: u64, init: WeightInit) -> Self {
        let output_layer = layers.len().saturating_sub(1);
        Self {
            layers,
            output_layer,
            seed,
            init,
            performance: Performance::default(),
            debug: false,
            parallel: false,
            replay_in_eval: false,
            max_depth: DEFAULT_MAX_DEPTH,
            depth: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Replace every neuron's fan-in in layer `l` with fresh connections from `from`.
    ///
    /// Biases are left untouched.
    pub(crate) fn connect_from(&mut self, l: usize, from: usize) {
        let (src_w, src_h) = (self.layers[from].width, self.layers[from].height);
        let init = self.init;
        let grid = &self.layers[l];
        let (w, h, fc) = (grid.width, grid.height, grid.fully_connected);

        let mut fan_ins = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                let sources = if fc {
                    all_coords(src_w, src_h)
                } else {
                    receptive_field(src_w, src_h, w, h, x, y)
                };
                let fan_in = sources.len();
                let conns: Vec<Connection> = sources
                    .into_iter()
                    .map(|(sx, sy)| Connection {
                        source: Coord::new(from, sx, sy),
                        weight: init.sample(&mut self.rng, fan_in),
                    })
                    .collect();
                fan_ins.push(conns);
            }
        }
        for (neuron, conns) in self.layers[l].neurons.iter_mut().zip(fan_ins) {
            neuron.connections = conns;
        }
    }

    /// Sources a new neuron at `(x, y)` of layer `l` would receive from `from`.
    pub(crate) fn sources_for(&self, l: usize, from: usize, x: usize, y: usize) -> Vec<(usize, usize)> {
        let src = &self.layers[from];
        let grid = &self.layers[l];
        if grid.fully_connected {
            all_coords(src.width, src.height)
        } else {
            receptive_field(src.width, src.height, grid.width, grid.height, x, y)
        }
    }

    /// Reset the RNG (and recorded seed) without touching parameters.
    pub fn reseed(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn input(&self) -> &Grid {
        &self.layers[0]
    }

    pub fn output(&self) -> &Grid {
        &self.layers[self.output_layer]
    }

    /// `(width, height)` of the input layer.
    pub fn input_dims(&self) -> (usize, usize) {
        (self.layers[0].width, self.layers[0].height)
    }

    /// `(width, height)` of the output layer.
    pub fn output_dims(&self) -> (usize, usize) {
        let out = self.output();
        (out.width, out.height)
    }

    /// Nesting depth of this network (0 for a top-level network).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Longest chain of nested sub-networks below this network.
    pub fn dimension_height(&self) -> usize {
        let mut height = 0;
        for grid in &self.layers {
            if let Some(shared) = &grid.shared_dimension {
                height = height.max(1 + shared.lock().dimension_height());
            }
            for neuron in &grid.neurons {
                if let Some(Dimension::Owned(net)) = &neuron.dimension {
                    height = height.max(1 + net.dimension_height());
                }
            }
        }
        height
    }

    /// Total neurons across all layers (sub-networks excluded).
    pub fn neuron_count(&self) -> usize {
        self.layers.iter().map(Grid::len).sum()
    }

    /// Number of weights and biases (sub-networks excluded; input biases are not counted).
    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .skip(1)
            .flat_map(|g| g.neurons.iter())
            .map(|n| 1 + n.connections.len())
            .sum()
    }

    /// Set nesting depth here and on every sub-network below.
    pub(crate) fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
        let max_depth = self.max_depth;
        for grid in &mut self.layers {
            if let Some(shared) = &grid.shared_dimension {
                let mut sub = shared.lock();
                sub.max_depth = max_depth;
                sub.set_depth(depth + 1);
            }
            for neuron in &mut grid.neurons {
                if let Some(Dimension::Owned(net)) = &mut neuron.dimension {
                    net.max_depth = max_depth;
                    net.set_depth(depth + 1);
                }
            }
        }
    }

    /// Check the structural invariants: at least two layers, output index at the
    /// end, neuron counts matching dimensions, and every connection pointing at
    /// an existing neuron of a strictly lower layer.
    pub fn validate(&self) -> ParagonResult<()> {
        if self.layers.len() < 2 {
            return Err(ParagonError::Construction(
                "need at least 2 layers (input and output)".to_string(),
            ));
        }
        if self.output_layer != self.layers.len() - 1 {
            return Err(ParagonError::Construction(format!(
                "output layer index {} does not match {} layers",
                self.output_layer,
                self.layers.len()
            )));
        }
        for (l, grid) in self.layers.iter().enumerate() {
            if grid.width == 0 || grid.height == 0 || grid.neurons.len() != grid.width * grid.height {
                return Err(ParagonError::Construction(format!(
                    "layer {l} holds {} neurons for a {}x{} grid",
                    grid.neurons.len(),
                    grid.width,
                    grid.height
                )));
            }
            for neuron in &grid.neurons {
                for c in &neuron.connections {
                    if c.source.layer >= l {
                        return Err(ParagonError::Construction(format!(
                            "connection into layer {l} from layer {} does not point backwards",
                            c.source.layer
                        )));
                    }
                    if !self.layers[c.source.layer].contains(c.source.x, c.source.y) {
                        return Err(ParagonError::Construction(format!(
                            "connection into layer {l} from missing neuron {:?}",
                            c.source
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Every coordinate of a `w × h` grid in row-major order.
fn all_coords(w: usize, h: usize) -> Vec<(usize, usize)> {
    (0..h).flat_map(|y| (0..w).map(move |x| (x, y))).collect()
}

/// 3×3 window of the source grid centred on the scaled position of `(x, y)`.
fn receptive_field(
    src_w: usize,
    src_h: usize,
    w: usize,
    h: usize,
    x: usize,
    y: usize,
) -> Vec<(usize, usize)> {
    let cx = (x * src_w / w.max(1)).min(src_w - 1);
    let cy = (y * src_h / h.max(1)).min(src_h - 1);
    let mut coords = Vec::with_capacity(9);
    for sy in cy.saturating_sub(1)..=(cy + 1).min(src_h - 1) {
        for sx in cx.saturating_sub(1)..=(cx + 1).min(src_w - 1) {
            coords.push((sx, sy));
        }
    }
    coords
}
