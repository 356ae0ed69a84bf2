//! Save, load and copy whole networks.
//!
//! A network is stored as a JSON [`NetworkRecord`]: metadata, then every
//! layer with its replay settings, an optional shared sub-network, and every
//! neuron with bias, activation, fan-in and sub-network. Floats are written
//! with shortest round-trip formatting, so a saved and reloaded network
//! produces bit-identical outputs.
//!
//! Replay gates are stored by name. Built-in gates are re-bound on load;
//! custom gates must be re-attached by the caller.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::core::{
    Connection, Coord, Dimension, Grid, Network, Neuron, ParagonError, ParagonResult,
    DEFAULT_MAX_DEPTH,
};
use crate::replay::{ReplayPolicy, ReplayRecord};
use crate::utils::{Activation, WeightInit};

/// Version written into new records; older versions load unchanged.
pub const FORMAT_VERSION: u32 = 1;

/// Crate name and version recorded in every save.
pub const BUILD: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub format_version: u32,
    pub seed: u64,
    pub build: String,
    #[serde(default)]
    pub init: WeightInit,
}

/// Serializable network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub metadata: Metadata,
    pub output_layer: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub replay_in_eval: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub debug: bool,
    pub layers: Vec<LayerRecord>,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub width: usize,
    pub height: usize,
    pub activation: Activation,
    pub fully_connected: bool,
    #[serde(default)]
    pub replay: ReplayRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_dimension: Option<Box<NetworkRecord>>,
    pub neurons: Vec<NeuronRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronRecord {
    pub bias: f64,
    pub activation: Activation,
    pub connections: Vec<ConnectionRecord>,
    #[serde(default)]
    pub dimension: DimensionRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub layer: usize,
    pub x: usize,
    pub y: usize,
    pub weight: f64,
}

/// Sub-network of a neuron. `Shared` refers to the layer's `shared_dimension`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DimensionRecord {
    #[default]
    None,
    Owned {
        network: Box<NetworkRecord>,
    },
    Shared,
}

impl Network {
    /// Structural record of this network and every sub-network.
    pub fn to_record(&self) -> NetworkRecord {
        NetworkRecord {
            metadata: Metadata {
                format_version: FORMAT_VERSION,
                seed: self.seed,
                build: BUILD.to_string(),
                init: self.init,
            },
            output_layer: self.output_layer,
            max_depth: self.max_depth,
            replay_in_eval: self.replay_in_eval,
            parallel: self.parallel,
            debug: self.debug,
            layers: self.layers.iter().map(layer_record).collect(),
        }
    }

    /// Rebuild a network from a record, checking every structural invariant.
    ///
    /// # Errors
    /// `Construction` for inconsistent shapes or connections pointing at
    /// missing or non-lower neurons, `Attachment` for sub-networks that are
    /// not 1×1-input or nest too deep.
    pub fn from_record(record: &NetworkRecord) -> ParagonResult<Self> {
        let mut net = network_from_record(record)?;
        net.set_depth(0);
        let height = net.dimension_height();
        if height > net.max_depth {
            return Err(ParagonError::Attachment(format!(
                "stored sub-networks nest {height} deep, max depth is {}",
                net.max_depth
            )));
        }
        Ok(net)
    }

    pub fn to_json_string(&self) -> ParagonResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    pub fn from_json_str(json: &str) -> ParagonResult<Self> {
        let record: NetworkRecord = serde_json::from_str(json)?;
        Self::from_record(&record)
    }

    /// Write the network as JSON, creating parent directories.
    ///
    /// The file is written to a uniquely named temporary file in the same
    /// directory and renamed into place, so an existing file is never left
    /// half-written and concurrent saves never share a temporary file.
    pub fn save_json(&self, path: &Path) -> ParagonResult<()> {
        save_checkpoint(self, path)
    }

    pub fn load_json(path: &Path) -> ParagonResult<Self> {
        load_checkpoint(path)
    }

    /// Independent copy: sub-networks are duplicated, layers that shared one
    /// sub-network share one new copy, and replay gates are carried over.
    pub fn deep_clone(&self) -> Self {
        Self {
            layers: self.layers.iter().map(Grid::deep_clone).collect(),
            output_layer: self.output_layer,
            seed: self.seed,
            init: self.init,
            performance: self.performance.clone(),
            debug: self.debug,
            parallel: self.parallel,
            replay_in_eval: self.replay_in_eval,
            max_depth: self.max_depth,
            depth: self.depth,
            rng: self.rng.clone(),
        }
    }
}

impl Clone for Network {
    fn clone(&self) -> Self {
        self.deep_clone()
    }
}

impl Grid {
    pub(crate) fn deep_clone(&self) -> Self {
        let shared = self
            .shared_dimension
            .as_ref()
            .map(|s| Arc::new(Mutex::new(s.lock().deep_clone())));
        let neurons = self
            .neurons
            .iter()
            .map(|n| {
                let dimension = n.dimension.as_ref().map(|d| match d {
                    Dimension::Owned(net) => Dimension::Owned(Box::new(net.deep_clone())),
                    Dimension::Shared(arc) => match (&self.shared_dimension, &shared) {
                        (Some(old), Some(new)) if Arc::ptr_eq(old, arc) => Dimension::Shared(Arc::clone(new)),
                        _ => Dimension::Shared(Arc::new(Mutex::new(arc.lock().deep_clone()))),
                    },
                });
                Neuron {
                    bias: n.bias,
                    value: n.value,
                    activation: n.activation,
                    connections: n.connections.clone(),
                    dimension,
                    input_sum: n.input_sum,
                    sum: n.sum,
                }
            })
            .collect();
        Self {
            width: self.width,
            height: self.height,
            activation: self.activation,
            fully_connected: self.fully_connected,
            neurons,
            replay: self.replay.clone(),
            cached_outputs: self.cached_outputs.clone(),
            history: self.history.clone(),
            replay_trace: self.replay_trace.clone(),
            last_error: self.last_error,
            shared_dimension: shared,
        }
    }
}

fn layer_record(grid: &Grid) -> LayerRecord {
    let uses_shared = grid
        .neurons
        .iter()
        .any(|n| matches!(n.dimension, Some(Dimension::Shared(_))));
    let shared_dimension = grid
        .shared_dimension
        .as_ref()
        .filter(|_| uses_shared)
        .map(|s| Box::new(s.lock().to_record()));
    LayerRecord {
        width: grid.width,
        height: grid.height,
        activation: grid.activation,
        fully_connected: grid.fully_connected,
        replay: grid.replay.to_record(),
        shared_dimension,
        neurons: grid
            .neurons
            .iter()
            .map(|n| NeuronRecord {
                bias: n.bias,
                activation: n.activation,
                connections: n
                    .connections
                    .iter()
                    .map(|c| ConnectionRecord {
                        layer: c.source.layer,
                        x: c.source.x,
                        y: c.source.y,
                        weight: c.weight,
                    })
                    .collect(),
                dimension: match &n.dimension {
                    None => DimensionRecord::None,
                    Some(Dimension::Owned(net)) => DimensionRecord::Owned {
                        network: Box::new(net.to_record()),
                    },
                    Some(Dimension::Shared(_)) => DimensionRecord::Shared,
                },
            })
            .collect(),
    }
}

fn network_from_record(record: &NetworkRecord) -> ParagonResult<Network> {
    if record.metadata.format_version > FORMAT_VERSION {
        return Err(ParagonError::Construction(format!(
            "record format {} is newer than supported format {FORMAT_VERSION}",
            record.metadata.format_version
        )));
    }
    let mut layers = Vec::with_capacity(record.layers.len());
    for (l, lr) in record.layers.iter().enumerate() {
        if lr.width == 0 || lr.height == 0 || lr.neurons.len() != lr.width * lr.height {
            return Err(ParagonError::Construction(format!(
                "layer {l} stores {} neurons for a {}x{} grid",
                lr.neurons.len(),
                lr.width,
                lr.height
            )));
        }
        let mut grid = Grid::new(lr.width, lr.height, lr.activation, lr.fully_connected);
        grid.replay = ReplayPolicy::from_record(&lr.replay)?;
        let shared = match &lr.shared_dimension {
            Some(sub) => Some(Arc::new(Mutex::new(sub_network(sub)?))),
            None => None,
        };
        for (neuron, nr) in grid.neurons.iter_mut().zip(&lr.neurons) {
            neuron.bias = nr.bias;
            neuron.activation = nr.activation;
            neuron.connections = nr
                .connections
                .iter()
                .map(|c| Connection {
                    source: Coord::new(c.layer, c.x, c.y),
                    weight: c.weight,
                })
                .collect();
            neuron.dimension = match &nr.dimension {
                DimensionRecord::None => None,
                DimensionRecord::Owned { network } => Some(Dimension::Owned(Box::new(sub_network(network)?))),
                DimensionRecord::Shared => match &shared {
                    Some(s) => Some(Dimension::Shared(Arc::clone(s))),
                    None => {
                        return Err(ParagonError::Construction(format!(
                            "neuron in layer {l} refers to a shared sub-network the layer does not have"
                        )))
                    }
                },
            };
        }
        grid.shared_dimension = shared;
        layers.push(grid);
    }

    let mut net = Network::empty(layers, record.metadata.seed, record.metadata.init);
    net.output_layer = record.output_layer;
    net.max_depth = record.max_depth;
    net.replay_in_eval = record.replay_in_eval;
    net.parallel = record.parallel;
    net.debug = record.debug;
    net.validate()?;
    Ok(net)
}

fn sub_network(record: &NetworkRecord) -> ParagonResult<Network> {
    let net = network_from_record(record)?;
    if net.input_dims() != (1, 1) {
        let (w, h) = net.input_dims();
        return Err(ParagonError::Attachment(format!(
            "stored sub-network input is {w}x{h}, expected 1x1"
        )));
    }
    Ok(net)
}

/// Save a network to a JSON file.
///
/// # Errors
///
/// `Io` if the directory or file cannot be written, `Serialization` if
/// encoding fails.
pub fn save_checkpoint(net: &Network, path: &Path) -> ParagonResult<()> {
    let json = net.to_json_string()?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            parent.to_path_buf()
        }
        _ => PathBuf::from("."),
    };

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), bytes = json.len(), "saved network");
    Ok(())
}

/// Load a network from a JSON file.
///
/// # Errors
///
/// `Io` if the file cannot be read, `Serialization` for malformed JSON, and
/// the structural errors of [`Network::from_record`].
pub fn load_checkpoint(path: &Path) -> ParagonResult<Network> {
    let json = fs::read_to_string(path)?;
    let record: NetworkRecord = serde_json::from_str(&json)?;
    if record.metadata.build != BUILD {
        debug!(stored = %record.metadata.build, current = BUILD, "loading network saved by another build");
    }
    Network::from_record(&record)
}
