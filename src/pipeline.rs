//! Composed progress over ordered pipeline stages
//!
//! **Why**: Real jobs run in phases (load, process, encode, write) and each
//! phase has its own coordinator, but displays want one number for the
//! whole pipeline.
//!
//! A [`Pipeline`] holds weighted clones of per-stage [`Progress`] handles
//! and reads them as one fraction: with equal weights and N stages, stage
//! `i` at inner fraction `f` reads `(i + f) / N` overall once the stages
//! before it are complete. It never mutates the stages it watches.

use crate::progress::Progress;

#[derive(Debug, Clone)]
struct Stage {
    weight: f64,
    progress: Progress,
}

/// Ordered, weighted read-only view over several coordinators.
///
/// Build it up front with [`push`](Self::push) /
/// [`push_weighted`](Self::push_weighted), then share clones with display
/// or control threads. An empty pipeline reads 1.0 (nothing pending).
///
/// # Examples
///
/// ```
/// use espera::{Pipeline, Progress};
///
/// let load = Progress::with_total(4);
/// let encode = Progress::with_total(8);
///
/// let mut pipeline = Pipeline::new();
/// pipeline.push(&load);
/// pipeline.push(&encode);
///
/// load.increment();
/// load.increment();
/// assert_eq!(pipeline.fraction(), 0.25);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Empty pipeline, reads as already finished.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage with weight 1.0.
    pub fn push(&mut self, progress: &Progress) {
        self.push_weighted(1.0, progress);
    }

    /// Append a stage whose share of the whole is `weight` relative to the
    /// other stages. Weights must be positive and finite.
    pub fn push_weighted(&mut self, weight: f64, progress: &Progress) {
        debug_assert!(
            weight.is_finite() && weight > 0.0,
            "stage weight must be positive and finite"
        );
        self.stages.push(Stage {
            weight: weight.max(0.0),
            progress: progress.clone(),
        });
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sum of all stage weights.
    pub fn total_weight(&self) -> f64 {
        self.stages.iter().map(|stage| stage.weight).sum()
    }

    /// Weighted completion fraction over all stages, in [0, 1].
    pub fn fraction(&self) -> f64 {
        if self.stages.is_empty() {
            return 1.0;
        }
        let total = self.total_weight();
        if total <= 0.0 {
            return 1.0;
        }
        let reached: f64 = self
            .stages
            .iter()
            .map(|stage| stage.weight * stage.progress.fraction())
            .sum();
        (reached / total).min(1.0)
    }

    /// Whether every stage has completed.
    pub fn is_finished(&self) -> bool {
        self.fraction() >= 1.0
    }

    /// Block until the composed fraction reaches `fraction`.
    ///
    /// Walks the stages in order, waiting each to completion until the
    /// remaining target falls inside one stage, then waits on that stage's
    /// residual milestone. Exact for stages that complete in sequence, an
    /// upper bound (never early) when they overlap.
    pub fn wait(&self, fraction: f64) {
        let target = fraction.clamp(0.0, 1.0);
        let total = self.total_weight();
        if self.stages.is_empty() || total <= 0.0 {
            return;
        }
        if target >= 1.0 {
            for stage in &self.stages {
                stage.progress.wait(1.0);
            }
            return;
        }

        let mut reached = 0.0;
        for stage in &self.stages {
            let share = stage.weight / total;
            if reached + share <= target {
                stage.progress.wait(1.0);
                reached += share;
            } else {
                let residual = ((target - reached) / share).clamp(0.0, 1.0);
                stage.progress.wait(residual);
                return;
            }
        }
    }
}
