//! Built-in replay gates.
//!
//! Every gate maps a layer's recent state to a score in `[0, 1]`; higher
//! scores ask for more replay. A gate without enough data returns 0.5.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::{ParagonError, ParagonResult};
use crate::utils::{clamp01, softmax};

/// Score returned when a gate has too little data to judge.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Variance that maps to a full score.
const VARIANCE_SCALE: f64 = 0.1;

/// What a gate may look at.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    /// Pre-softmax outputs of the layer from its last computation
    pub cached: &'a [f64],
    /// Previous cached outputs, oldest first
    pub history: &'a VecDeque<Vec<f64>>,
    /// Mean absolute local error from the last backward
    pub last_error: f64,
}

/// Scores a layer's state for gated replay.
pub trait ReplayGate: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, input: &GateInput<'_>) -> f64;
}

/// Normalized Shannon entropy of the softmaxed outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntropyGate;

impl ReplayGate for EntropyGate {
    fn name(&self) -> &str {
        "entropy"
    }

    fn score(&self, input: &GateInput<'_>) -> f64 {
        let n = input.cached.len();
        if n < 2 {
            return NEUTRAL_SCORE;
        }
        let entropy: f64 = softmax(input.cached)
            .iter()
            .filter(|p| **p > 0.0)
            .map(|p| -p * p.ln())
            .sum();
        clamp01(entropy / (n as f64).ln())
    }
}

/// Population variance of the outputs, scaled by 1/0.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarianceGate;

impl ReplayGate for VarianceGate {
    fn name(&self) -> &str {
        "variance"
    }

    fn score(&self, input: &GateInput<'_>) -> f64 {
        if input.cached.is_empty() {
            return NEUTRAL_SCORE;
        }
        clamp01(variance(input.cached) / VARIANCE_SCALE)
    }
}

/// One minus the largest softmax probability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceGate;

impl ReplayGate for ConfidenceGate {
    fn name(&self) -> &str {
        "confidence"
    }

    fn score(&self, input: &GateInput<'_>) -> f64 {
        if input.cached.is_empty() {
            return NEUTRAL_SCORE;
        }
        let max = softmax(input.cached)
            .into_iter()
            .fold(f64::NEG_INFINITY, f64::max);
        clamp01(1.0 - max)
    }
}

/// Mean squared difference between neighbouring outputs, scaled by 1/0.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientGate;

impl ReplayGate for GradientGate {
    fn name(&self) -> &str {
        "gradient"
    }

    fn score(&self, input: &GateInput<'_>) -> f64 {
        let v = input.cached;
        if v.len() < 2 {
            return NEUTRAL_SCORE;
        }
        let total: f64 = v.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
        clamp01(total / (v.len() - 1) as f64 / VARIANCE_SCALE)
    }
}

/// Mean absolute local error of the last backward pass.
///
/// Reads 0 before the layer has been trained.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossGate;

impl ReplayGate for LossGate {
    fn name(&self) -> &str {
        "loss"
    }

    fn score(&self, input: &GateInput<'_>) -> f64 {
        clamp01(input.last_error)
    }
}

/// Average per-neuron variance across the output history.
#[derive(Debug, Clone, Copy)]
pub struct TemporalGate {
    pub min_history: usize,
}

impl Default for TemporalGate {
    fn default() -> Self {
        Self { min_history: 5 }
    }
}

impl ReplayGate for TemporalGate {
    fn name(&self) -> &str {
        "temporal"
    }

    fn score(&self, input: &GateInput<'_>) -> f64 {
        temporal_score(input.history, self.min_history).unwrap_or(NEUTRAL_SCORE)
    }
}

/// Weighted blend of the temporal and variance scores.
#[derive(Debug, Clone, Copy)]
pub struct HybridGate {
    pub temporal_weight: f64,
    pub min_history: usize,
}

impl Default for HybridGate {
    fn default() -> Self {
        Self {
            temporal_weight: 0.6,
            min_history: 5,
        }
    }
}

impl ReplayGate for HybridGate {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn score(&self, input: &GateInput<'_>) -> f64 {
        let Some(temporal) = temporal_score(input.history, self.min_history) else {
            return NEUTRAL_SCORE;
        };
        if input.cached.is_empty() {
            return NEUTRAL_SCORE;
        }
        let spatial = clamp01(variance(input.cached) / VARIANCE_SCALE);
        clamp01(self.temporal_weight * temporal + (1.0 - self.temporal_weight) * spatial)
    }
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let mean_sq = values.iter().map(|v| v * v).sum::<f64>() / n;
    (mean_sq - mean * mean).max(0.0)
}

fn temporal_score(history: &VecDeque<Vec<f64>>, min_history: usize) -> Option<f64> {
    if history.len() < min_history.max(1) {
        return None;
    }
    // grown layers leave shorter entries behind
    let width = history.iter().map(Vec::len).min().unwrap_or(0);
    if width == 0 {
        return None;
    }
    let mut column = Vec::with_capacity(history.len());
    let mut total = 0.0;
    for i in 0..width {
        column.clear();
        column.extend(history.iter().map(|h| h[i]));
        total += variance(&column);
    }
    Some(clamp01(total / width as f64 / VARIANCE_SCALE))
}

/// Built-in gate by name: entropy, variance, confidence, gradient, loss, temporal, hybrid.
pub fn gate_from_name(name: &str) -> ParagonResult<Arc<dyn ReplayGate>> {
    let gate: Arc<dyn ReplayGate> = match name.trim().to_ascii_lowercase().as_str() {
        "entropy" => Arc::new(EntropyGate),
        "variance" => Arc::new(VarianceGate),
        "confidence" => Arc::new(ConfidenceGate),
        "gradient" => Arc::new(GradientGate),
        "loss" => Arc::new(LossGate),
        "temporal" => Arc::new(TemporalGate::default()),
        "hybrid" => Arc::new(HybridGate::default()),
        other => {
            return Err(ParagonError::InvalidArgument(format!(
                "unknown replay gate: {other}"
            )))
        }
    };
    Ok(gate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn input<'a>(cached: &'a [f64], history: &'a VecDeque<Vec<f64>>) -> GateInput<'a> {
        GateInput {
            cached,
            history,
            last_error: 0.0,
        }
    }

    #[test]
    fn test_entropy_uniform_is_one() {
        let h = VecDeque::new();
        let s = EntropyGate.score(&input(&[0.3, 0.3, 0.3, 0.3], &h));
        assert_abs_diff_eq!(s, 1.0, epsilon = 1e-12);
        assert!(EntropyGate.score(&input(&[50.0, 0.0, 0.0], &h)) < 0.01);
    }

    #[test]
    fn test_neutral_without_data() {
        let h = VecDeque::new();
        assert_eq!(EntropyGate.score(&input(&[1.0], &h)), NEUTRAL_SCORE);
        assert_eq!(GradientGate.score(&input(&[1.0], &h)), NEUTRAL_SCORE);
        assert_eq!(TemporalGate::default().score(&input(&[1.0], &h)), NEUTRAL_SCORE);
        assert_eq!(HybridGate::default().score(&input(&[1.0], &h)), NEUTRAL_SCORE);
    }

    #[test]
    fn test_variance_gate_scaled_and_clamped() {
        let h = VecDeque::new();
        // variance 0.01 -> 0.1
        let s = VarianceGate.score(&input(&[0.4, 0.6], &h));
        assert_abs_diff_eq!(s, 0.1, epsilon = 1e-9);
        assert_eq!(VarianceGate.score(&input(&[-5.0, 5.0], &h)), 1.0);
    }

    #[test]
    fn test_confidence_gate() {
        let h = VecDeque::new();
        let s = ConfidenceGate.score(&input(&[0.0, 0.0], &h));
        assert_abs_diff_eq!(s, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_temporal_gate_constant_history_is_zero() {
        let h: VecDeque<Vec<f64>> = (0..5).map(|_| vec![0.2, 0.7]).collect();
        assert_abs_diff_eq!(TemporalGate::default().score(&input(&[0.2, 0.7], &h)), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_loss_gate_clamps() {
        let h = VecDeque::new();
        let mut i = input(&[], &h);
        i.last_error = 3.0;
        assert_eq!(LossGate.score(&i), 1.0);
    }

    #[test]
    fn test_gate_from_name() {
        for name in ["entropy", "variance", "confidence", "gradient", "loss", "temporal", "hybrid"] {
            assert_eq!(gate_from_name(name).unwrap().name(), name);
        }
        assert!(gate_from_name("nope").is_err());
    }
}
