//! Per-layer replay: re-running a window of layers before or after a layer's
//! normal computation.
//!
//! A replay pass for layer `l` with offset `o` (≤ -1) recomputes layers
//! `max(1, l + o) ..= l`. Static replay runs `max_replay` passes; gated
//! replay asks a [`ReplayGate`] for a score in `[0, 1]` and maps it to a
//! repetition count bounded by `budget`.

pub mod gates;

pub use gates::{
    gate_from_name, ConfidenceGate, EntropyGate, GateInput, GradientGate, HybridGate, LossGate,
    ReplayGate, TemporalGate, VarianceGate,
};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{ParagonError, ParagonResult};
use crate::utils::clamp01;

/// Default number of cached outputs kept for temporal gates.
pub const DEFAULT_HISTORY_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    #[default]
    Static,
    Gated,
}

/// Whether replay passes contribute to the backward derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayUpdate {
    #[default]
    ForwardOnly,
    /// Derivatives are summed over every pass of the layer
    BackwardInclusive,
}

/// Maps a gate score to a repetition count.
#[derive(Clone)]
pub enum RepsMapping {
    /// `budget` when `score > threshold`, else 0
    Threshold { threshold: f64 },
    /// `ceil(score · budget)` when `score > threshold`, else 0
    Proportional { threshold: f64 },
    Custom(Arc<dyn Fn(f64) -> usize + Send + Sync>),
}

impl Default for RepsMapping {
    fn default() -> Self {
        RepsMapping::Threshold { threshold: 0.5 }
    }
}

impl fmt::Debug for RepsMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepsMapping::Threshold { threshold } => write!(f, "Threshold({threshold})"),
            RepsMapping::Proportional { threshold } => write!(f, "Proportional({threshold})"),
            RepsMapping::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl RepsMapping {
    /// Repetitions for `score`, never above `budget`.
    pub fn repetitions(&self, score: f64, budget: usize) -> usize {
        let reps = match self {
            RepsMapping::Threshold { threshold } => {
                if score > *threshold {
                    budget
                } else {
                    0
                }
            }
            RepsMapping::Proportional { threshold } => {
                if score > *threshold {
                    (score * budget as f64).ceil() as usize
                } else {
                    0
                }
            }
            RepsMapping::Custom(f) => f(score),
        };
        reps.min(budget)
    }
}

/// Replay configuration of one layer.
#[derive(Clone)]
pub struct ReplayPolicy {
    pub enabled: bool,
    pub phase: ReplayPhase,
    pub mode: ReplayMode,
    pub update: ReplayUpdate,
    /// How many layers back a pass starts, as a negative count
    pub offset: i32,
    /// Passes per forward in static mode
    pub max_replay: usize,
    /// Upper bound on passes in gated mode
    pub budget: usize,
    pub history_len: usize,
    pub reps: RepsMapping,
    gate: Option<Arc<dyn ReplayGate>>,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            phase: ReplayPhase::After,
            mode: ReplayMode::Static,
            update: ReplayUpdate::ForwardOnly,
            offset: -1,
            max_replay: 0,
            budget: 0,
            history_len: DEFAULT_HISTORY_LEN,
            reps: RepsMapping::default(),
            gate: None,
        }
    }
}

impl fmt::Debug for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayPolicy")
            .field("enabled", &self.enabled)
            .field("phase", &self.phase)
            .field("mode", &self.mode)
            .field("update", &self.update)
            .field("offset", &self.offset)
            .field("max_replay", &self.max_replay)
            .field("budget", &self.budget)
            .field("gate", &self.gate_name())
            .field("reps", &self.reps)
            .finish()
    }
}

impl ReplayPolicy {
    /// Fixed number of passes per forward.
    pub fn fixed(max_replay: usize, phase: ReplayPhase, offset: i32) -> ParagonResult<Self> {
        let policy = Self {
            enabled: true,
            phase,
            mode: ReplayMode::Static,
            offset,
            max_replay,
            ..Self::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Gate-driven passes, at most `budget` per forward.
    pub fn gated(
        gate: Arc<dyn ReplayGate>,
        budget: usize,
        reps: RepsMapping,
        phase: ReplayPhase,
        offset: i32,
    ) -> ParagonResult<Self> {
        let policy = Self {
            enabled: true,
            phase,
            mode: ReplayMode::Gated,
            offset,
            budget,
            reps,
            gate: Some(gate),
            ..Self::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn with_update(mut self, update: ReplayUpdate) -> Self {
        self.update = update;
        self
    }

    pub fn with_history_len(mut self, history_len: usize) -> Self {
        self.history_len = history_len;
        self
    }

    pub fn gate(&self) -> Option<&Arc<dyn ReplayGate>> {
        self.gate.as_ref()
    }

    pub fn set_gate(&mut self, gate: Arc<dyn ReplayGate>) {
        self.gate = Some(gate);
    }

    pub fn gate_name(&self) -> Option<&str> {
        self.gate.as_ref().map(|g| g.name())
    }

    pub fn validate(&self) -> ParagonResult<()> {
        if self.offset > -1 {
            return Err(ParagonError::InvalidArgument(format!(
                "replay offset must be -1 or lower, got {}",
                self.offset
            )));
        }
        Ok(())
    }

    /// Gated layers keep a window of past outputs.
    pub(crate) fn keeps_history(&self) -> bool {
        self.enabled && self.mode == ReplayMode::Gated && self.history_len > 0
    }

    /// Passes to run for the current state of a layer.
    pub fn repetitions(&self, cached: &[f64], history: &VecDeque<Vec<f64>>, last_error: f64) -> usize {
        if !self.enabled {
            return 0;
        }
        match self.mode {
            ReplayMode::Static => self.max_replay,
            ReplayMode::Gated => match &self.gate {
                Some(gate) => {
                    let input = GateInput {
                        cached,
                        history,
                        last_error,
                    };
                    let score = clamp01(gate.score(&input));
                    self.reps.repetitions(score, self.budget)
                }
                None => 0,
            },
        }
    }

    pub fn to_record(&self) -> ReplayRecord {
        let reps = match &self.reps {
            RepsMapping::Threshold { threshold } => RepsRecord::Threshold { threshold: *threshold },
            RepsMapping::Proportional { threshold } => RepsRecord::Proportional {
                threshold: *threshold,
            },
            RepsMapping::Custom(_) => RepsRecord::Custom,
        };
        ReplayRecord {
            enabled: self.enabled,
            phase: self.phase,
            mode: self.mode,
            update: self.update,
            offset: self.offset,
            max_replay: self.max_replay,
            budget: self.budget,
            history_len: self.history_len,
            gate: self.gate_name().map(str::to_string),
            reps,
        }
    }

    /// Rebuild a policy from its stored form.
    ///
    /// Built-in gates are re-bound by name. Custom gates and custom mappings
    /// cannot be stored; they come back unset (and threshold 0.5) and must be
    /// re-attached by the caller.
    pub fn from_record(record: &ReplayRecord) -> ParagonResult<Self> {
        let gate = match record.gate.as_deref() {
            Some(name) => match gate_from_name(name) {
                Ok(gate) => Some(gate),
                Err(_) => {
                    warn!(gate = name, "replay gate is not built in; re-attach it after loading");
                    None
                }
            },
            None => None,
        };
        let reps = match record.reps {
            RepsRecord::Threshold { threshold } => RepsMapping::Threshold { threshold },
            RepsRecord::Proportional { threshold } => RepsMapping::Proportional { threshold },
            RepsRecord::Custom => RepsMapping::default(),
        };
        let policy = Self {
            enabled: record.enabled,
            phase: record.phase,
            mode: record.mode,
            update: record.update,
            offset: record.offset,
            max_replay: record.max_replay,
            budget: record.budget,
            history_len: record.history_len,
            reps,
            gate,
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Serializable replay configuration. Gates are kept by name only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub enabled: bool,
    pub phase: ReplayPhase,
    pub mode: ReplayMode,
    pub update: ReplayUpdate,
    pub offset: i32,
    pub max_replay: usize,
    pub budget: usize,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(default)]
    pub reps: RepsRecord,
}

fn default_history_len() -> usize {
    DEFAULT_HISTORY_LEN
}

impl Default for ReplayRecord {
    fn default() -> Self {
        ReplayPolicy::default().to_record()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepsRecord {
    Threshold { threshold: f64 },
    Proportional { threshold: f64 },
    Custom,
}

impl Default for RepsRecord {
    fn default() -> Self {
        RepsRecord::Threshold { threshold: 0.5 }
    }
}
