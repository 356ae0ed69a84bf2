//! Accuracy Deviation Heatmap Distribution (ADHD) scoring.
//!
//! Each (expected, actual) pair gets a relative deviation
//! `|e - a| / max(|e|, ε)` that falls into one of seven half-open buckets.
//! The score is the bucket-weighted mean:
//!
//! | bucket  | weight |
//! |---------|--------|
//! | 0-10%   | 100    |
//! | 10-20%  | 80     |
//! | 20-30%  | 60     |
//! | 30-40%  | 40     |
//! | 40-50%  | 20     |
//! | 50-100% | 10     |
//! | 100%+   | 0      |
//!
//! A zero expected value deviates by 0 only when the actual value is also
//! zero; non-finite actual values count as failures (100%+).

use std::fmt::Write as _;

use tracing::info;

use crate::core::{Network, ParagonError, ParagonResult};

pub const BUCKET_LABELS: [&str; 7] = [
    "0-10%", "10-20%", "20-30%", "30-40%", "40-50%", "50-100%", "100%+",
];

pub const BUCKET_WEIGHTS: [f64; 7] = [100.0, 80.0, 60.0, 40.0, 20.0, 10.0, 0.0];

/// Default ε in the deviation denominator.
pub const DEVIATION_EPSILON: f64 = 1e-9;

/// Relative deviation of `actual` from `expected`.
pub fn deviation(expected: f64, actual: f64) -> f64 {
    deviation_with_epsilon(expected, actual, DEVIATION_EPSILON)
}

/// [`deviation`] with an explicit ε: `|expected| < ε` counts as zero.
pub fn deviation_with_epsilon(expected: f64, actual: f64, epsilon: f64) -> f64 {
    if !actual.is_finite() || !expected.is_finite() {
        return f64::INFINITY;
    }
    if expected.abs() < epsilon {
        return if actual.abs() < epsilon { 0.0 } else { f64::INFINITY };
    }
    (expected - actual).abs() / expected.abs().max(epsilon)
}

/// Bucket index for a deviation; NaN lands in the failure bucket.
pub fn bucket_index(deviation: f64) -> usize {
    match deviation {
        d if d < 0.1 => 0,
        d if d < 0.2 => 1,
        d if d < 0.3 => 2,
        d if d < 0.4 => 3,
        d if d < 0.5 => 4,
        d if d < 1.0 => 5,
        _ => 6,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketStats {
    pub count: usize,
    /// Sample indices that fell in this bucket
    pub samples: Vec<usize>,
}

/// One sample's deviation, kept for the worst-samples report.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDeviation {
    pub index: usize,
    pub expected: f64,
    pub actual: f64,
    pub deviation: f64,
}

/// Result of an ADHD evaluation.
#[derive(Debug, Clone, Default)]
pub struct Performance {
    pub buckets: [BucketStats; 7],
    /// Weighted score in `[0, 100]`
    pub score: f64,
    pub total: usize,
    /// Samples in the 100%+ bucket
    pub failures: usize,
    /// Training samples skipped for non-finite loss or gradient
    pub numeric_failures: usize,
    /// Largest deviations, worst first (filled by [`Performance::evaluate_full`])
    pub worst: Vec<SampleDeviation>,
}

impl Performance {
    /// Bucket every pair and compute the score.
    ///
    /// # Errors
    /// `InvalidArgument` if the slices differ in length.
    pub fn evaluate(expected: &[f64], actual: &[f64]) -> ParagonResult<Self> {
        Self::evaluate_full(expected, actual, 0)
    }

    /// [`Performance::evaluate`] plus the `top_n` largest deviations.
    pub fn evaluate_full(expected: &[f64], actual: &[f64], top_n: usize) -> ParagonResult<Self> {
        if expected.len() != actual.len() {
            return Err(ParagonError::InvalidArgument(format!(
                "{} expected values but {} actual values",
                expected.len(),
                actual.len()
            )));
        }
        let mut perf = Performance::default();
        let mut deviations = Vec::with_capacity(if top_n > 0 { expected.len() } else { 0 });
        for (index, (&e, &a)) in expected.iter().zip(actual).enumerate() {
            let dev = deviation(e, a);
            let bucket = &mut perf.buckets[bucket_index(dev)];
            bucket.count += 1;
            bucket.samples.push(index);
            if top_n > 0 {
                deviations.push(SampleDeviation {
                    index,
                    expected: e,
                    actual: a,
                    deviation: dev,
                });
            }
        }
        perf.total = expected.len();
        perf.failures = perf.buckets[6].count;
        perf.compute_final_score();

        if top_n > 0 {
            deviations.sort_by(|a, b| {
                b.deviation
                    .total_cmp(&a.deviation)
                    .then(a.index.cmp(&b.index))
            });
            deviations.truncate(top_n);
            perf.worst = deviations;
        }
        Ok(perf)
    }

    /// Recompute `score` from bucket counts; 0 when nothing was evaluated.
    pub fn compute_final_score(&mut self) -> f64 {
        let total: usize = self.buckets.iter().map(|b| b.count).sum();
        self.score = if total == 0 {
            0.0
        } else {
            self.buckets
                .iter()
                .zip(BUCKET_WEIGHTS)
                .map(|(b, w)| b.count as f64 * w)
                .sum::<f64>()
                / total as f64
        };
        self.score
    }

    pub fn bucket(&self, label: &str) -> Option<&BucketStats> {
        BUCKET_LABELS
            .iter()
            .position(|l| *l == label)
            .map(|i| &self.buckets[i])
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failures as f64 / self.total as f64
        }
    }

    /// Human-readable summary, one bucket per line.
    pub fn diagnostics_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "ADHD score: {:.2} over {} samples", self.score, self.total);
        for (label, bucket) in BUCKET_LABELS.iter().zip(&self.buckets) {
            let pct = if self.total == 0 {
                0.0
            } else {
                100.0 * bucket.count as f64 / self.total as f64
            };
            let _ = writeln!(out, "  {label:>8}: {:>6} ({pct:5.1}%)", bucket.count);
        }
        let _ = writeln!(
            out,
            "  failures: {} ({:.1}%), numeric skips: {}",
            self.failures,
            100.0 * self.failure_rate(),
            self.numeric_failures
        );
        if !self.worst.is_empty() {
            let _ = writeln!(out, "  worst samples:");
            for s in &self.worst {
                let _ = writeln!(
                    out,
                    "    #{:<5} expected {:>10.4} actual {:>10.4} deviation {:.4}",
                    s.index, s.expected, s.actual, s.deviation
                );
            }
        }
        out
    }
}

/// ADHD breakdown of a single output vector.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePerformance {
    pub index: usize,
    pub score: f64,
    pub counts: [usize; 7],
    pub failures: usize,
}

/// Score each sample's output vector separately.
///
/// `epsilon` is the magnitude below which an expected component counts as zero.
pub fn compute_per_sample_performance(
    expected: &[Vec<f64>],
    actual: &[Vec<f64>],
    epsilon: f64,
) -> ParagonResult<Vec<SamplePerformance>> {
    if expected.len() != actual.len() {
        return Err(ParagonError::InvalidArgument(format!(
            "{} expected vectors but {} actual vectors",
            expected.len(),
            actual.len()
        )));
    }
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .map(|(index, (e, a))| {
            if e.len() != a.len() {
                return Err(ParagonError::InvalidArgument(format!(
                    "sample {index}: {} expected components but {} actual",
                    e.len(),
                    a.len()
                )));
            }
            let mut counts = [0usize; 7];
            for (&ev, &av) in e.iter().zip(a) {
                counts[bucket_index(deviation_with_epsilon(ev, av, epsilon))] += 1;
            }
            let n: usize = counts.iter().sum();
            let score = if n == 0 {
                0.0
            } else {
                counts
                    .iter()
                    .zip(BUCKET_WEIGHTS)
                    .map(|(&c, w)| c as f64 * w)
                    .sum::<f64>()
                    / n as f64
            };
            Ok(SamplePerformance {
                index,
                score,
                counts,
                failures: counts[6],
            })
        })
        .collect()
}

impl Network {
    /// Score `actual` against `expected` and store the result in `performance`.
    ///
    /// The running count of numeric training skips is preserved.
    pub fn evaluate_model(&mut self, expected: &[f64], actual: &[f64]) -> ParagonResult<f64> {
        self.evaluate_full(expected, actual, 0)
    }

    /// [`Network::evaluate_model`] keeping the `top_n` worst samples.
    pub fn evaluate_full(&mut self, expected: &[f64], actual: &[f64], top_n: usize) -> ParagonResult<f64> {
        let numeric = self.performance.numeric_failures;
        self.performance = Performance::evaluate_full(expected, actual, top_n)?;
        self.performance.numeric_failures = numeric;
        Ok(self.performance.score)
    }

    pub fn compute_final_score(&mut self) -> f64 {
        self.performance.compute_final_score()
    }

    /// Log the diagnostics report at `info`.
    pub fn print_full_diagnostics(&self) {
        for line in self.performance.diagnostics_report().lines() {
            info!("{line}");
        }
    }
}
