//! Training loops, schedules, cancellation and metrics.
//!
//! Each epoch runs `forward → loss → backward` per sample. A sample whose
//! loss, gradient or updated parameters would be non-finite is skipped
//! (parameters untouched) and counted; the epoch carries on with the remaining samples.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array2;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{Network, ParagonError, ParagonResult, Partition};
use crate::utils::{argmax, ClipBounds};
use crate::TrainConfig;

/// Learning-rate schedule over the epochs of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    /// `lr · (1 - epoch / epochs)`
    Linear,
    /// `lr · (1 + cos(π · epoch / epochs)) / 2`
    Cosine,
}

impl LrSchedule {
    pub fn rate(self, base: f64, epoch: usize, epochs: usize) -> f64 {
        if epochs == 0 {
            return base;
        }
        let t = epoch as f64 / epochs as f64;
        match self {
            LrSchedule::Constant => base,
            LrSchedule::Linear => base * (1.0 - t),
            LrSchedule::Cosine => base * (1.0 + (PI * t).cos()) / 2.0,
        }
    }
}

/// Cooperative cancellation flag shared between a caller and a running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Metrics for one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    /// Mean loss over the samples that trained
    pub avg_loss: f64,
    pub samples: usize,
    /// Samples skipped for non-finite loss or gradient
    pub skipped: usize,
    /// Validation accuracy, when a validation set was given
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Completed,
    EarlyStopped,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub outcome: TrainOutcome,
    pub epochs_completed: usize,
    pub numeric_skips: usize,
    pub epochs: Vec<EpochMetrics>,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|m| m.avg_loss)
    }
}

/// Configurable training run.
///
/// ```no_run
/// # use paragon::{Network, TrainConfig, Activation};
/// # use paragon::training::Trainer;
/// # fn demo(net: &mut Network, x: &[ndarray::Array2<f64>], y: &[ndarray::Array2<f64>]) -> paragon::ParagonResult<()> {
/// let report = Trainer::new(TrainConfig::default())
///     .with_validation(x, y)
///     .run(net, x, y)?;
/// println!("{:?}", report.outcome);
/// # Ok(()) }
/// ```
pub struct Trainer<'a> {
    config: TrainConfig,
    validation: Option<(&'a [Array2<f64>], &'a [Array2<f64>])>,
    cancel: Option<CancelToken>,
    partition: Option<Partition>,
}

impl<'a> Trainer<'a> {
    pub fn new(config: TrainConfig) -> Self {
        Self {
            config,
            validation: None,
            cancel: None,
            partition: None,
        }
    }

    /// Evaluate accuracy after every epoch (enables early stopping).
    pub fn with_validation(mut self, inputs: &'a [Array2<f64>], targets: &'a [Array2<f64>]) -> Self {
        self.validation = Some((inputs, targets));
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Train only the hidden neurons of one partition.
    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Run the configured epochs over `(inputs, targets)`.
    ///
    /// # Errors
    /// `InvalidArgument` for empty or mismatched data, bad shapes or a
    /// negative learning rate. Numeric failures are skipped, not returned.
    pub fn run(&self, net: &mut Network, inputs: &[Array2<f64>], targets: &[Array2<f64>]) -> ParagonResult<TrainReport> {
        check_dataset(inputs, targets)?;
        if !(self.config.learning_rate >= 0.0) {
            return Err(ParagonError::InvalidArgument(format!(
                "learning rate must be non-negative, got {}",
                self.config.learning_rate
            )));
        }
        if let Some((vi, vt)) = self.validation {
            check_dataset(vi, vt)?;
        }

        let clip = self.config.clip;
        let total_epochs = self.config.epochs;
        let mut order: Vec<usize> = (0..inputs.len()).collect();
        let mut report = TrainReport {
            outcome: TrainOutcome::Completed,
            epochs_completed: 0,
            numeric_skips: 0,
            epochs: Vec::with_capacity(total_epochs),
        };

        'epochs: for epoch in 0..total_epochs {
            if self.cancelled() {
                report.outcome = TrainOutcome::Cancelled;
                break;
            }
            let start = Instant::now();
            let lr = self.config.schedule.rate(self.config.learning_rate, epoch, total_epochs);
            if self.config.shuffle {
                order.shuffle(&mut net.rng);
            }

            let mut loss_sum = 0.0;
            let mut trained = 0;
            let mut skipped = 0;
            for &i in &order {
                if self.cancelled() {
                    report.outcome = TrainOutcome::Cancelled;
                    net.performance.numeric_failures += skipped;
                    report.numeric_skips += skipped;
                    break 'epochs;
                }
                match train_sample(net, &inputs[i], &targets[i], lr, clip.as_ref(), self.partition) {
                    Ok(loss) => {
                        loss_sum += loss;
                        trained += 1;
                    }
                    Err(ParagonError::Numeric(reason)) => {
                        skipped += 1;
                        warn!(epoch, sample = i, %reason, "skipping sample");
                    }
                    Err(e) => return Err(e),
                }
            }
            net.performance.numeric_failures += skipped;
            report.numeric_skips += skipped;

            let accuracy = match self.validation {
                Some((vi, vt)) => Some(compute_accuracy(net, vi, vt)?),
                None => None,
            };
            let metrics = EpochMetrics {
                epoch,
                learning_rate: lr,
                avg_loss: if trained == 0 { f64::NAN } else { loss_sum / trained as f64 },
                samples: trained,
                skipped,
                accuracy,
            };
            if net.debug {
                info!(
                    epoch,
                    loss = metrics.avg_loss,
                    lr,
                    skipped,
                    accuracy = ?metrics.accuracy,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "epoch complete"
                );
            } else {
                debug!(epoch, loss = metrics.avg_loss, lr, skipped, "epoch complete");
            }
            report.epochs.push(metrics);
            report.epochs_completed = epoch + 1;

            if let (Some(threshold), Some(acc)) = (self.config.early_stop_accuracy, accuracy) {
                if acc >= threshold {
                    report.outcome = TrainOutcome::EarlyStopped;
                    break;
                }
            }
        }
        Ok(report)
    }
}

/// Train with a plain configuration.
pub fn train(net: &mut Network, inputs: &[Array2<f64>], targets: &[Array2<f64>], config: &TrainConfig) -> ParagonResult<TrainReport> {
    Trainer::new(config.clone()).run(net, inputs, targets)
}

/// One forward/backward step; returns the sample's loss before the update.
///
/// # Errors
/// `Numeric` when the loss, a gradient or an updated parameter is
/// non-finite (nothing changes).
pub fn train_sample(
    net: &mut Network,
    input: &Array2<f64>,
    target: &Array2<f64>,
    lr: f64,
    clip: Option<&ClipBounds>,
    partition: Option<Partition>,
) -> ParagonResult<f64> {
    match partition {
        Some(p) => net.forward_tagged(input, p.num_tags, p.tag)?,
        None => net.forward(input)?,
    }
    let loss = net.compute_loss(target)?;
    if !loss.is_finite() {
        return Err(ParagonError::Numeric(format!("loss is {loss}")));
    }
    match partition {
        Some(p) => net.backward_tagged(target, lr, p.num_tags, p.tag, clip)?,
        None => net.backward_clipped(target, lr, clip)?,
    }
    Ok(loss)
}

/// Fraction of samples classified correctly.
///
/// Multi-output networks compare argmax indices; a single output is
/// thresholded at 0.5.
pub fn compute_accuracy(net: &mut Network, inputs: &[Array2<f64>], targets: &[Array2<f64>]) -> ParagonResult<f64> {
    check_dataset(inputs, targets)?;
    let mut correct = 0usize;
    for (input, target) in inputs.iter().zip(targets) {
        let out = net.predict(input)?;
        let target: Vec<f64> = target.iter().copied().collect();
        let hit = if out.len() == 1 {
            (out[0] >= 0.5) == (target.first().copied().unwrap_or(0.0) >= 0.5)
        } else {
            out.as_slice().map_or(false, |o| argmax(o) == argmax(&target))
        };
        if hit {
            correct += 1;
        }
    }
    Ok(correct as f64 / inputs.len() as f64)
}

/// Predicted class per sample (argmax, or the raw value for single outputs).
pub fn predicted_labels(net: &mut Network, inputs: &[Array2<f64>]) -> ParagonResult<Vec<f64>> {
    inputs
        .iter()
        .map(|input| {
            let out = net.predict(input)?;
            Ok(if out.len() == 1 {
                out[0]
            } else {
                out.as_slice().map_or(0, argmax) as f64
            })
        })
        .collect()
}

/// Class per target (argmax, or the raw value for single outputs).
pub fn target_labels(targets: &[Array2<f64>]) -> Vec<f64> {
    targets
        .iter()
        .map(|t| {
            if t.len() == 1 {
                t.iter().next().copied().unwrap_or(0.0)
            } else {
                let flat: Vec<f64> = t.iter().copied().collect();
                argmax(&flat) as f64
            }
        })
        .collect()
}

fn check_dataset(inputs: &[Array2<f64>], targets: &[Array2<f64>]) -> ParagonResult<()> {
    if inputs.is_empty() {
        return Err(ParagonError::InvalidArgument("empty dataset".to_string()));
    }
    if inputs.len() != targets.len() {
        return Err(ParagonError::InvalidArgument(format!(
            "{} inputs but {} targets",
            inputs.len(),
            targets.len()
        )));
    }
    Ok(())
}

impl Network {
    /// Train for `epochs` with a constant learning rate.
    pub fn train(
        &mut self,
        inputs: &[Array2<f64>],
        targets: &[Array2<f64>],
        epochs: usize,
        learning_rate: f64,
        shuffle: bool,
        clip: Option<ClipBounds>,
    ) -> ParagonResult<TrainReport> {
        let config = TrainConfig {
            epochs,
            learning_rate,
            shuffle,
            clip,
            ..TrainConfig::default()
        };
        train(self, inputs, targets, &config)
    }
}
