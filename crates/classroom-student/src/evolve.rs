//! Push → mutate → study → keep-or-pop hill climbing.

use anyhow::Result;
use rand::Rng;
use tracing::info;

use classroom_core::{Dataset, Model};

use crate::metrics::Metrics;
use crate::optimizer::Optimizer;
use crate::student::{Mutation, Student};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HillClimber {
    /// Study steps run after each mutation.
    pub steps_per_trial: usize,
    /// A trial is kept when its mean relative grade reaches this.
    pub threshold: f64,
}

impl Default for HillClimber {
    fn default() -> Self {
        Self { steps_per_trial: 32, threshold: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialOutcome {
    pub kept: bool,
    pub mean_relative_grade: f64,
    pub mutation: Mutation,
}

impl HillClimber {
    pub fn new(steps_per_trial: usize) -> Self {
        Self { steps_per_trial, ..Self::default() }
    }

    /// One generation: snapshot, mutate, study, then roll back unless the
    /// mutated student beat its own snapshot on average.
    pub fn trial<M, O, D, R>(&self, student: &mut Student<M, O, D>, rng: &mut R) -> Result<TrialOutcome>
    where
        M: Model,
        O: Optimizer + Clone,
        D: Dataset,
        R: Rng + ?Sized,
    {
        student.push()?;
        let mutation = student.mutate_with(rng)?;
        for _ in 0..self.steps_per_trial {
            student.study()?;
        }

        let mean_relative_grade =
            Metrics::tail_mean(student.metrics().relative_grades(), self.steps_per_trial)
                .unwrap_or(1.0);
        let kept = mean_relative_grade >= self.threshold;
        if !kept {
            student.pop()?;
        }

        info!(
            kept,
            mean_relative_grade,
            batch_size = student.batch_size(),
            lr = student.learning_rate().unwrap_or_default(),
            "Hill-climbing trial finished"
        );
        Ok(TrialOutcome { kept, mean_relative_grade, mutation })
    }
}
