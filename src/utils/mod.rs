//! Numeric kernel: activations, softmax, argmax, weight initialization, clipping.
//!
//! Everything here is a pure function of its arguments. Randomness is always
//! supplied by the caller so that networks stay reproducible from their seed.

use std::fmt;
use std::str::FromStr;

use ndarray_rand::rand_distr::StandardNormal;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{ParagonError, ParagonResult};

/// Slope used by [`Activation::LeakyRelu`] for negative inputs.
pub const LEAKY_SLOPE: f64 = 0.01;

/// Floor applied to probabilities before taking logarithms.
pub const LOG_FLOOR: f64 = 1e-10;

/// Distance kept from the open ends of bounded activation ranges when inverting.
pub const INVERSE_MARGIN: f64 = 1e-12;

/// Activation kinds a neuron can carry.
///
/// `apply` maps a pre-activation sum to an output; `derivative` is expressed
/// in terms of that output, which is what the backward pass has cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    LeakyRelu,
    Tanh,
    Sigmoid,
    Elu,
    /// Per-neuron identity; the layer normalizes afterwards.
    Softmax,
}

impl Activation {
    pub const ALL: [Activation; 7] = [
        Activation::Linear,
        Activation::Relu,
        Activation::LeakyRelu,
        Activation::Tanh,
        Activation::Sigmoid,
        Activation::Elu,
        Activation::Softmax,
    ];

    /// f(x)
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Linear | Activation::Softmax => x,
            Activation::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    LEAKY_SLOPE * x
                }
            }
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp() - 1.0
                }
            }
        }
    }

    /// f'(x) written in terms of `y = f(x)`.
    ///
    /// Softmax uses the diagonal term `y(1 - y)`; output layers that pair
    /// softmax with cross-entropy bypass this (see the backward pass).
    #[inline]
    pub fn derivative(self, y: f64) -> f64 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if y > 0.0 {
                    1.0
                } else {
                    LEAKY_SLOPE
                }
            }
            Activation::Tanh => 1.0 - y * y,
            Activation::Sigmoid | Activation::Softmax => y * (1.0 - y),
            Activation::Elu => {
                if y > 0.0 {
                    1.0
                } else {
                    y + 1.0
                }
            }
        }
    }

    /// A pre-activation `x` with `f(x) = y`.
    ///
    /// Outputs outside the activation's range are first clamped into it
    /// (`INVERSE_MARGIN` away from open ends). ReLU returns `y` itself, a
    /// preimage whenever `y ≥ 0`. Softmax is handled per layer with
    /// [`inverse_softmax`].
    pub fn inverse(self, y: f64) -> f64 {
        match self {
            Activation::Linear | Activation::Relu | Activation::Softmax => y,
            Activation::LeakyRelu => {
                if y > 0.0 {
                    y
                } else {
                    y / LEAKY_SLOPE
                }
            }
            Activation::Tanh => y.clamp(-1.0 + INVERSE_MARGIN, 1.0 - INVERSE_MARGIN).atanh(),
            Activation::Sigmoid => {
                let p = y.clamp(INVERSE_MARGIN, 1.0 - INVERSE_MARGIN);
                (p / (1.0 - p)).ln()
            }
            Activation::Elu => {
                if y > 0.0 {
                    y
                } else {
                    (y + 1.0).max(INVERSE_MARGIN).ln()
                }
            }
        }
    }

    /// Label used in persisted documents and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::LeakyRelu => "leaky_relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Elu => "elu",
            Activation::Softmax => "softmax",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = ParagonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Activation::ALL
            .iter()
            .copied()
            .find(|a| a.name() == s)
            .ok_or_else(|| ParagonError::Construction(format!("unknown activation: {s}")))
    }
}

/// Parse a list of activation labels.
pub fn parse_activations(labels: &[&str]) -> ParagonResult<Vec<Activation>> {
    labels.iter().map(|l| l.parse()).collect()
}

/// Weight initialization scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    /// std = sqrt(1 / fan_in)
    #[default]
    Xavier,
    /// std = sqrt(2 / fan_in)
    He,
}

impl WeightInit {
    /// Standard deviation for a neuron with `fan_in` inputs.
    pub fn scale(self, fan_in: usize) -> f64 {
        let fan_in = fan_in.max(1) as f64;
        match self {
            WeightInit::Xavier => (1.0 / fan_in).sqrt(),
            WeightInit::He => (2.0 / fan_in).sqrt(),
        }
    }

    /// Draw one weight from N(0, scale²).
    pub fn sample<R: Rng + ?Sized>(self, rng: &mut R, fan_in: usize) -> f64 {
        let z: f64 = rng.sample(StandardNormal);
        z * self.scale(fan_in)
    }

    pub fn name(self) -> &'static str {
        match self {
            WeightInit::Xavier => "xavier",
            WeightInit::He => "he",
        }
    }
}

impl FromStr for WeightInit {
    type Err = ParagonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xavier" => Ok(WeightInit::Xavier),
            "he" => Ok(WeightInit::He),
            _ => Err(ParagonError::Construction(format!(
                "unknown init method: {s}"
            ))),
        }
    }
}

/// Clamp range applied to every weight delta before it is scaled by the learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipBounds {
    pub upper: f64,
    pub lower: f64,
}

impl ClipBounds {
    pub fn new(upper: f64, lower: f64) -> ParagonResult<Self> {
        if !(upper >= lower) {
            return Err(ParagonError::InvalidArgument(format!(
                "clip upper bound {upper} is below lower bound {lower}"
            )));
        }
        Ok(Self { upper, lower })
    }

    #[inline]
    pub fn clip(&self, x: f64) -> f64 {
        x.max(self.lower).min(self.upper)
    }
}

/// Apply optional clipping.
#[inline]
pub fn clip(x: f64, bounds: Option<&ClipBounds>) -> f64 {
    match bounds {
        Some(b) => b.clip(x),
        None => x,
    }
}

/// Clamp to [0, 1]; NaN maps to 0.
#[inline]
pub fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Numerically stable softmax.
pub fn softmax(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    softmax_in_place(&mut out);
    out
}

/// Softmax over a mutable slice, subtracting the max first.
pub fn softmax_in_place(values: &mut [f64]) {
    if values.is_empty() {
        return;
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut total = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        total += *v;
    }
    for v in values.iter_mut() {
        *v /= total;
    }
}

/// Logits whose softmax is `probs` (up to an additive constant).
pub fn inverse_softmax(probs: &[f64]) -> Vec<f64> {
    probs.iter().map(|p| p.max(LOG_FLOOR).ln()).collect()
}

/// Index of the largest value; ties go to the lowest index and NaN never wins.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

/// Cross-entropy `-Σ t·ln(max(p, 1e-10))`.
pub fn cross_entropy(target: &[f64], predicted: &[f64]) -> f64 {
    target
        .iter()
        .zip(predicted)
        .map(|(t, p)| -t * p.max(LOG_FLOOR).ln())
        .sum()
}

/// Mean squared error.
pub fn mean_squared_error(target: &[f64], predicted: &[f64]) -> f64 {
    if target.is_empty() {
        return 0.0;
    }
    let total: f64 = target
        .iter()
        .zip(predicted)
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    total / target.len() as f64
}
