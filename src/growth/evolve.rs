//! Evolutionary architecture search.
//!
//! Every generation clones each surviving candidate several times, applies
//! random structural mutations (sub-networks on hidden layers, extra
//! columns, occasionally an extra layer), trains the mutants briefly and
//! keeps the fittest. Fitness blends validation accuracy with the ADHD score:
//!
//! ```text
//! fitness = 0.7 · accuracy + 0.3 · adhd / 100
//! ```
//!
//! Mutants are trained on rayon with at most `pool.capacity()` at a time.
//! Each mutant draws from its own RNG seeded by `(seed, generation, index)`,
//! so a run is reproducible regardless of thread count.

use ndarray::Array2;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::core::{Network, ParagonError, ParagonResult};
use crate::dimension::DimensionOptions;
use crate::pool::TrainingPool;
use crate::training::{compute_accuracy, predicted_labels, target_labels, CancelToken, Trainer};
use crate::utils::{Activation, WeightInit};
use crate::TrainConfig;

const ACCURACY_WEIGHT: f64 = 0.7;
const ADHD_WEIGHT: f64 = 0.3;

/// Borrowed dataset: inputs and targets of equal length.
pub type Dataset<'a> = (&'a [Array2<f64>], &'a [Array2<f64>]);

/// Shape of a randomly generated sub-network, with optional shared
/// sub-networks on its own hidden layers.
#[derive(Debug, Clone, PartialEq)]
pub struct SubNetworkShape {
    pub sizes: Vec<(usize, usize)>,
    pub activations: Vec<Activation>,
    pub fully_connected: Vec<bool>,
    /// `(hidden layer, shape)` pairs attached as shared sub-networks
    pub nested: Vec<(usize, SubNetworkShape)>,
}

impl SubNetworkShape {
    /// 2–4 layers: a 1×1 input, hidden layers 4–16 wide with random
    /// activation and connectivity, and a 1×1 linear output.
    ///
    /// Each hidden layer gets a nested shape with probability
    /// `nest_probability` (decaying by 0.8 per level) while `depth_budget`
    /// allows it.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, activations: &[Activation], depth_budget: usize, nest_probability: f64) -> Self {
        let num_layers = rng.gen_range(2..=4);
        let mut sizes = vec![(1, 1)];
        let mut acts = vec![Activation::Linear];
        let mut fc = vec![true];
        for _ in 1..num_layers - 1 {
            sizes.push((rng.gen_range(4..=16), 1));
            acts.push(pick(rng, activations));
            fc.push(rng.gen_bool(0.5));
        }
        sizes.push((1, 1));
        acts.push(Activation::Linear);
        fc.push(true);

        let mut nested = Vec::new();
        if depth_budget > 0 {
            for layer in 1..num_layers - 1 {
                if rng.gen_bool(nest_probability.clamp(0.0, 1.0)) {
                    let inner = Self::random(rng, activations, depth_budget - 1, nest_probability * 0.8);
                    nested.push((layer, inner));
                }
            }
        }
        Self {
            sizes,
            activations: acts,
            fully_connected: fc,
            nested,
        }
    }

    /// Levels of sub-networks below this one.
    pub fn nesting(&self) -> usize {
        self.nested
            .iter()
            .map(|(_, s)| 1 + s.nesting())
            .max()
            .unwrap_or(0)
    }

    pub fn build(&self, seed: u64, init: WeightInit) -> ParagonResult<Network> {
        let mut net = Network::with_init(&self.sizes, &self.activations, &self.fully_connected, seed, init)?;
        for (layer, shape) in &self.nested {
            let sub = shape.build(net.rng.next_u64(), init)?;
            net.attach_shared_dimension(*layer, sub)?;
        }
        Ok(net)
    }
}

/// One structural change to a network.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    AddNeurons {
        layer: usize,
        count: usize,
    },
    AddLayer {
        after: usize,
        width: usize,
        height: usize,
        activation: Activation,
    },
    AttachDimension {
        layer: usize,
        shape: SubNetworkShape,
        shared: bool,
    },
}

impl Mutation {
    pub fn apply(&self, net: &mut Network) -> ParagonResult<()> {
        match self {
            Mutation::AddNeurons { layer, count } => net.add_neurons_to_layer(*layer, *count),
            Mutation::AddLayer {
                after,
                width,
                height,
                activation,
            } => net.add_layer(*after, *width, *height, *activation, true),
            Mutation::AttachDimension { layer, shape, shared } => {
                if *shared {
                    let sub = shape.build(net.rng.next_u64(), net.init)?;
                    net.attach_shared_dimension(*layer, sub).map(|_| ())
                } else {
                    let count = net.layers[*layer].len();
                    for i in 0..count {
                        let (x, y) = net.layers[*layer].coord(i);
                        let sub = shape.build(net.rng.next_u64(), net.init)?;
                        net.attach_dimension(*layer, x, y, sub)?;
                    }
                    Ok(())
                }
            }
        }
    }
}

/// A scored network and the mutations that produced it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub network: Network,
    pub accuracy: f64,
    pub adhd_score: f64,
    pub fitness: f64,
    pub lineage: Vec<Mutation>,
}

impl Candidate {
    pub fn new(network: Network, accuracy: f64, adhd_score: f64, lineage: Vec<Mutation>) -> Self {
        Self {
            network,
            accuracy,
            adhd_score,
            fitness: fitness(accuracy, adhd_score),
            lineage,
        }
    }
}

pub fn fitness(accuracy: f64, adhd_score: f64) -> f64 {
    ACCURACY_WEIGHT * accuracy + ADHD_WEIGHT * adhd_score / 100.0
}

#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    pub generations: usize,
    /// Mutants bred from each survivor per generation
    pub offspring: usize,
    /// Survivors kept after each generation
    pub population: usize,
    pub train: TrainConfig,
    /// Chance per hidden layer of attaching a random sub-network
    pub attach_probability: f64,
    /// Chance per hidden layer of adding columns
    pub add_neuron_probability: f64,
    /// Chance per mutant of inserting a layer
    pub add_layer_probability: f64,
    /// Upper bound on columns added at once
    pub max_new_columns: usize,
    /// Sub-networks are shared by the whole layer
    pub shared_dimensions: bool,
    pub activations: Vec<Activation>,
    pub seed: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            generations: 3,
            offspring: 4,
            population: 4,
            train: TrainConfig {
                epochs: 5,
                learning_rate: 0.01,
                shuffle: true,
                ..TrainConfig::default()
            },
            attach_probability: 0.7,
            add_neuron_probability: 0.2,
            add_layer_probability: 0.1,
            max_new_columns: 3,
            shared_dimensions: true,
            activations: vec![
                Activation::Relu,
                Activation::LeakyRelu,
                Activation::Tanh,
                Activation::Sigmoid,
                Activation::Elu,
            ],
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub generation: usize,
    pub best_fitness: f64,
    pub best_accuracy: f64,
    pub best_adhd: f64,
    pub evaluated: usize,
}

#[derive(Debug, Clone)]
pub struct EvolutionReport {
    /// Survivors, fittest first
    pub population: Vec<Candidate>,
    pub generations_completed: usize,
    pub cancelled: bool,
    pub history: Vec<GenerationSummary>,
}

impl EvolutionReport {
    pub fn best(&self) -> Option<&Candidate> {
        self.population.first()
    }
}

pub struct Evolution<'a> {
    config: EvolutionConfig,
    pool: &'a TrainingPool,
    cancel: Option<CancelToken>,
}

impl<'a> Evolution<'a> {
    pub fn new(config: EvolutionConfig, pool: &'a TrainingPool) -> Self {
        Self {
            config,
            pool,
            cancel: None,
        }
    }

    /// Stop between mutants once `token` is cancelled; finished mutants are kept.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Evolve from `seed` for the configured generations.
    pub fn run(&self, seed: &Network, train: Dataset<'_>, validation: Dataset<'_>) -> ParagonResult<EvolutionReport> {
        if self.config.population == 0 {
            return Err(ParagonError::InvalidArgument(
                "population must keep at least one candidate".to_string(),
            ));
        }
        let mut start = seed.deep_clone();
        let (accuracy, adhd) = score(&mut start, validation)?;
        let mut population = vec![Candidate::new(start, accuracy, adhd, Vec::new())];
        let mut report = EvolutionReport {
            population: Vec::new(),
            generations_completed: 0,
            cancelled: false,
            history: Vec::new(),
        };

        for generation in 0..self.config.generations {
            let jobs: Vec<usize> = (0..population.len())
                .flat_map(|p| std::iter::repeat(p).take(self.config.offspring))
                .collect();
            let parents = &population;
            let results: Vec<ParagonResult<Candidate>> = jobs
                .par_iter()
                .enumerate()
                .map(|(job, &p)| {
                    let _permit = self.pool.acquire_cancellable(self.cancel.as_ref())?;
                    let seed = job_seed(self.config.seed, generation, job);
                    self.breed(&parents[p], seed, train, validation)
                })
                .collect();

            let mut evaluated = 0;
            for result in results {
                match result {
                    Ok(candidate) => {
                        evaluated += 1;
                        population.push(candidate);
                    }
                    Err(ParagonError::Cancelled) => report.cancelled = true,
                    Err(e) => return Err(e),
                }
            }
            population.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
            population.truncate(self.config.population);

            if let Some(best) = population.first() {
                info!(
                    generation,
                    fitness = best.fitness,
                    accuracy = best.accuracy,
                    adhd = best.adhd_score,
                    evaluated,
                    "generation complete"
                );
                report.history.push(GenerationSummary {
                    generation,
                    best_fitness: best.fitness,
                    best_accuracy: best.accuracy,
                    best_adhd: best.adhd_score,
                    evaluated,
                });
            }
            if report.cancelled {
                break;
            }
            report.generations_completed = generation + 1;
        }
        report.population = population;
        Ok(report)
    }

    fn breed(&self, parent: &Candidate, seed: u64, train: Dataset<'_>, validation: Dataset<'_>) -> ParagonResult<Candidate> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut network = parent.network.deep_clone();
        network.reseed(rng.next_u64());

        let mut lineage = parent.lineage.clone();
        for mutation in self.propose(&network, &mut rng) {
            match mutation.apply(&mut network) {
                Ok(()) => lineage.push(mutation),
                Err(ParagonError::Attachment(reason)) => debug!(%reason, "mutation skipped"),
                Err(e) => return Err(e),
            }
        }

        Trainer::new(self.config.train.clone()).run(&mut network, train.0, train.1)?;
        let (accuracy, adhd) = score(&mut network, validation)?;
        Ok(Candidate::new(network, accuracy, adhd, lineage))
    }

    /// Random mutations for `net`. Layer insertion comes last so earlier
    /// mutations still refer to valid layer indices.
    fn propose(&self, net: &Network, rng: &mut ChaCha8Rng) -> Vec<Mutation> {
        let cfg = &self.config;
        let mut mutations = Vec::new();
        let budget = net.max_depth.saturating_sub(net.depth() + 1);
        for layer in 1..net.output_layer {
            if rng.gen_bool(cfg.attach_probability.clamp(0.0, 1.0)) && net.depth() < net.max_depth {
                let shape = SubNetworkShape::random(rng, &cfg.activations, budget, cfg.attach_probability * 0.8);
                mutations.push(Mutation::AttachDimension {
                    layer,
                    shape,
                    shared: cfg.shared_dimensions,
                });
            }
            if rng.gen_bool(cfg.add_neuron_probability.clamp(0.0, 1.0)) {
                let columns = rng.gen_range(1..=cfg.max_new_columns.max(1));
                mutations.push(Mutation::AddNeurons {
                    layer,
                    count: columns * net.layers[layer].height,
                });
            }
        }
        if rng.gen_bool(cfg.add_layer_probability.clamp(0.0, 1.0)) {
            mutations.push(Mutation::AddLayer {
                after: rng.gen_range(0..net.output_layer),
                width: rng.gen_range(2..=8),
                height: 1,
                activation: pick(rng, &cfg.activations),
            });
        }
        mutations
    }
}

/// Train and score one sub-network shape per candidate on `layer` of `base`.
///
/// Returns the candidates fittest first.
#[allow(clippy::too_many_arguments)]
pub fn search_dimension_shapes(
    base: &Network,
    layer: usize,
    shapes: &[SubNetworkShape],
    options: DimensionOptions,
    config: &TrainConfig,
    train: Dataset<'_>,
    validation: Dataset<'_>,
    pool: &TrainingPool,
) -> ParagonResult<Vec<Candidate>> {
    let mut candidates = shapes
        .par_iter()
        .enumerate()
        .map(|(i, shape)| {
            let _permit = pool.acquire();
            let mut network = base.deep_clone();
            network.reseed(job_seed(base.seed, 0, i));
            network.init = options.init;
            let mutation = Mutation::AttachDimension {
                layer,
                shape: shape.clone(),
                shared: options.shared,
            };
            mutation.apply(&mut network)?;
            Trainer::new(config.clone()).run(&mut network, train.0, train.1)?;
            let (accuracy, adhd) = score(&mut network, validation)?;
            Ok(Candidate::new(network, accuracy, adhd, vec![mutation]))
        })
        .collect::<ParagonResult<Vec<_>>>()?;
    candidates.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
    Ok(candidates)
}

/// Accuracy and ADHD score on a validation set.
fn score(net: &mut Network, validation: Dataset<'_>) -> ParagonResult<(f64, f64)> {
    let accuracy = compute_accuracy(net, validation.0, validation.1)?;
    let expected = target_labels(validation.1);
    let actual = predicted_labels(net, validation.0)?;
    let adhd = net.evaluate_model(&expected, &actual)?;
    Ok((accuracy, adhd))
}

fn job_seed(seed: u64, generation: usize, job: usize) -> u64 {
    seed ^ (generation as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (job as u64 + 1).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

fn pick<R: Rng + ?Sized>(rng: &mut R, activations: &[Activation]) -> Activation {
    if activations.is_empty() {
        return Activation::Relu;
    }
    activations[rng.gen_range(0..activations.len())]
}
