//! Per-step training history.

use serde::{Deserialize, Serialize};

/// Parallel metric sequences, one entry per `study()` call.
///
/// `time` is always the sum of `times`; the four sequences always have the
/// same length.  Both hold because [`Metrics::record`] is the only mutator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    time: f64,
    times: Vec<f64>,
    grades: Vec<f64>,
    baseline_grades: Vec<f64>,
    relative_grades: Vec<f64>,
}

/// One `study()` call's contribution to [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    /// Wall-clock seconds spent in the step.
    pub elapsed: f64,
    pub grade: f64,
    pub baseline_grade: f64,
    pub relative_grade: f64,
}

impl Metrics {
    pub fn record(&mut self, step: StudyRecord) {
        self.time += step.elapsed;
        self.times.push(step.elapsed);
        self.grades.push(step.grade);
        self.baseline_grades.push(step.baseline_grade);
        self.relative_grades.push(step.relative_grade);
    }

    /// Cumulative seconds across all recorded steps.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn grades(&self) -> &[f64] {
        &self.grades
    }

    pub fn baseline_grades(&self) -> &[f64] {
        &self.baseline_grades
    }

    pub fn relative_grades(&self) -> &[f64] {
        &self.relative_grades
    }

    pub fn len(&self) -> usize {
        self.grades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grades.is_empty()
    }

    /// Mean of the last `n` entries of `values` (all of them if fewer).
    pub fn tail_mean(values: &[f64], n: usize) -> Option<f64> {
        let tail = &values[values.len().saturating_sub(n)..];
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().sum::<f64>() / tail.len() as f64)
        }
    }
}
