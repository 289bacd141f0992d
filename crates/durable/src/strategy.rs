//! Claim strategies
//!
//! A strategy decides *which* eligible task a claim picks, never *how* the
//! claim is made atomic. SQL stores splice [`ClaimStrategy::order_by_sql`]
//! into their claim statement; the in-memory store sorts with
//! [`ClaimStrategy::compare`]. Weighted-random claims first read a window of
//! candidates in priority order and sample one with [`ClaimStrategy::pick`];
//! the sampled row then goes through the same guarded update as every other
//! claim.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Default window for weighted-random sampling
pub const DEFAULT_TOP_K: usize = 10;

/// Ordering / sampling policy used by `try_claim`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimStrategy {
    /// Oldest first
    #[default]
    Fifo,
    /// Newest first
    Lifo,
    /// Highest priority first, oldest first among equals
    Priority,
    /// Weighted sample among the top-K by priority
    WeightedRandom(WeightedRandom),
}

/// Parameters of the weighted-random strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedRandom {
    /// Number of highest-priority candidates considered per claim
    pub top_k: usize,
    /// Maps a candidate's priority to a sampling weight
    pub weight: WeightFunction,
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            weight: WeightFunction::default(),
        }
    }
}

impl WeightedRandom {
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_weight(mut self, weight: WeightFunction) -> Self {
        self.weight = weight;
        self
    }
}

/// Weight assigned to a candidate, relative to the window it was sampled from
///
/// Weights are computed against the window's lowest (`Linear`) or highest
/// (`Exponential`) priority so arbitrary priority ranges never overflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightFunction {
    /// Every candidate equally likely
    Uniform,
    /// `priority - min_priority + offset`
    Linear { offset: f64 },
    /// `base ^ (priority - max_priority)`
    Exponential { base: f64 },
}

impl Default for WeightFunction {
    fn default() -> Self {
        Self::Linear { offset: 1.0 }
    }
}

impl WeightFunction {
    /// Compute sampling weights for a window of priorities
    ///
    /// Non-finite and negative weights become zero. When every weight is
    /// zero the result is uniform.
    pub fn weights(&self, priorities: &[i32]) -> Vec<f64> {
        let (Some(min), Some(max)) = (priorities.iter().min(), priorities.iter().max()) else {
            return Vec::new();
        };

        let mut weights: Vec<f64> = priorities
            .iter()
            .map(|&p| match self {
                Self::Uniform => 1.0,
                Self::Linear { offset } => (i64::from(p) - i64::from(*min)) as f64 + offset,
                Self::Exponential { base } => base.powf((i64::from(p) - i64::from(*max)) as f64),
            })
            .map(|w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
            .collect();

        if weights.iter().all(|w| *w == 0.0) {
            weights.iter_mut().for_each(|w| *w = 1.0);
        }
        weights
    }
}

/// The fields a strategy looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: TaskId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ClaimStrategy {
    /// Weighted-random with default parameters
    pub fn weighted() -> Self {
        Self::WeightedRandom(WeightedRandom::default())
    }

    /// ORDER BY clause (without the keyword) for candidate selection
    ///
    /// Always ends in an `id` tie-break so ordering is deterministic.
    pub fn order_by_sql(&self) -> &'static str {
        match self {
            Self::Fifo => "created_at ASC, id ASC",
            Self::Lifo => "created_at DESC, id DESC",
            Self::Priority | Self::WeightedRandom(_) => "priority DESC, created_at ASC, id ASC",
        }
    }

    /// How many candidates a claim needs to look at
    pub fn window(&self) -> usize {
        match self {
            Self::WeightedRandom(w) => w.top_k.max(1),
            _ => 1,
        }
    }

    /// Whether the claim samples from a window instead of taking the first row
    pub fn is_sampling(&self) -> bool {
        matches!(self, Self::WeightedRandom(_))
    }

    /// Total order matching [`order_by_sql`](Self::order_by_sql)
    pub fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        match self {
            Self::Fifo => a
                .created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id)),
            Self::Lifo => b
                .created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id)),
            Self::Priority | Self::WeightedRandom(_) => b
                .priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id)),
        }
    }

    /// Pick one candidate out of a window already sorted by this strategy
    ///
    /// Deterministic strategies always pick the head of the window.
    pub fn pick<R: Rng + ?Sized>(&self, candidates: &[Candidate], rng: &mut R) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self {
            Self::WeightedRandom(config) => {
                let window = &candidates[..candidates.len().min(config.top_k.max(1))];
                let priorities: Vec<i32> = window.iter().map(|c| c.priority).collect();
                let weights = config.weight.weights(&priorities);
                match WeightedIndex::new(&weights) {
                    Ok(dist) => Some(dist.sample(rng)),
                    Err(_) => Some(0),
                }
            }
            _ => Some(0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Lifo => "lifo",
            Self::Priority => "priority",
            Self::WeightedRandom(_) => "weighted",
        }
    }
}

impl fmt::Display for ClaimStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ClaimStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            "priority" => Ok(Self::Priority),
            "weighted" | "weighted_random" | "weighted-random" => Ok(Self::weighted()),
            other => Err(format!(
                "unknown strategy '{other}' (expected fifo, lifo, priority or weighted)"
            )),
        }
    }
}

/// Which tasks a claim may pick, and in what order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CandidateFilter {
    /// Allowed task types; empty means any type
    pub task_types: Vec<String>,
    pub strategy: ClaimStrategy,
}

impl CandidateFilter {
    pub fn new(strategy: ClaimStrategy) -> Self {
        Self {
            task_types: Vec::new(),
            strategy,
        }
    }

    /// Restrict to one task type
    pub fn for_type(task_type: impl Into<String>, strategy: ClaimStrategy) -> Self {
        Self {
            task_types: vec![task_type.into()],
            strategy,
        }
    }

    pub fn with_task_types(mut self, task_types: Vec<String>) -> Self {
        self.task_types = task_types;
        self
    }

    pub fn matches_type(&self, task_type: &str) -> bool {
        self.task_types.is_empty() || self.task_types.iter().any(|t| t == task_type)
    }
}
