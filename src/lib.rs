//! # Paragon
//!
//! Layered grid networks whose neurons can carry nested sub-networks.
//!
//! ## Overview
//!
//! A [`Network`] is a stack of 2-D [`Grid`]s. Each neuron sums weighted
//! values from lower layers, optionally passes that sum through its own (or
//! its layer's shared) sub-network, and applies an activation. On top of
//! plain backpropagation the crate offers:
//!
//! - partition tags that train disjoint slices of hidden neurons,
//! - per-layer replay, fixed or gated by a scoring function,
//! - structural growth and an evolutionary search over architectures,
//! - reverse inference and micro-network surgery at a checkpoint layer,
//! - ADHD scoring: a histogram of relative deviations,
//! - JSON persistence that round-trips parameters bit-for-bit.
//!
//! ## Structure
//!
//! - [`core`] — grids, neurons, construction, forward, backward and reverse passes
//! - [`replay`] — replay policies and gates
//! - [`dimension`] — attaching sub-networks
//! - [`training`] — training loops, schedules, accuracy
//! - [`growth`] — adding neurons and layers, evolution, micro networks
//! - [`adhd`] — deviation buckets and scores
//! - [`checkpoint`] — JSON records, save and load
//! - [`pool`] — bounded permits for concurrent training jobs
//! - [`data`] — dataset splitting and encoding
//! - [`utils`] — activations, softmax, initialization, clipping
//! - `gpu` — dense batch inference with burn (feature `gpu`)

pub mod adhd;
pub mod checkpoint;
pub mod core;
pub mod data;
pub mod dimension;
pub mod growth;
pub mod pool;
pub mod replay;
pub mod training;
pub mod utils;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use adhd::{Performance, SamplePerformance};
pub use crate::core::{
    Connection, Coord, Dimension, Gradients, Grid, Network, Neuron, ParagonError, ParagonResult,
    Partition, SharedNetwork,
};
pub use dimension::DimensionOptions;
pub use growth::{GrowConfig, MicroNetwork, Mutation};
pub use pool::TrainingPool;
pub use replay::{ReplayGate, ReplayMode, ReplayPhase, ReplayPolicy, ReplayUpdate, RepsMapping};
pub use training::{
    compute_accuracy, train, train_sample, CancelToken, EpochMetrics, LrSchedule, TrainOutcome,
    TrainReport, Trainer,
};
pub use utils::{Activation, ClipBounds, WeightInit};

/// Training configuration.
///
/// Used by [`train`], [`Trainer`] and the growth routines.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Reshuffle sample order every epoch with the network's RNG
    pub shuffle: bool,
    pub clip: Option<ClipBounds>,
    pub schedule: LrSchedule,
    /// Stop once validation accuracy reaches this fraction
    pub early_stop_accuracy: Option<f64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            learning_rate: 0.01,
            shuffle: true,
            clip: None,
            schedule: LrSchedule::Constant,
            early_stop_accuracy: None,
        }
    }
}
