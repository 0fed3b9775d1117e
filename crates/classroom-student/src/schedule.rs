//! Learning-rate schedules.
//!
//! A schedule maps the optimiser's global step count to a learning rate.
//! Schedules are plain data so they can be checkpointed, inspected and
//! replaced by [`Student::mutate`](crate::Student::mutate).

use std::f64::consts::PI;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    /// The same rate at every step.
    Constant { lr: f64 },
    /// Piecewise constant: each `(step, lr)` point applies from `step`
    /// onward.  Steps before the first point use the first point's rate.
    Table { points: Vec<(u64, f64)> },
    /// `lr * min(1, step / warmup_steps)`.
    LinearWarmup { lr: f64, warmup_steps: u64 },
    /// Linear warmup to `lr`, then half a cosine down to `min_lr` over
    /// `decay_steps`, then flat at `min_lr`.
    WarmupCosine {
        lr: f64,
        min_lr: f64,
        warmup_steps: u64,
        decay_steps: u64,
    },
}

impl LrSchedule {
    pub fn constant(lr: f64) -> Self {
        Self::Constant { lr }
    }

    /// Build a table schedule; points are sorted by step.
    pub fn table(mut points: Vec<(u64, f64)>) -> Result<Self> {
        ensure!(!points.is_empty(), "a learning-rate table needs at least one point");
        points.sort_by_key(|&(step, _)| step);
        Ok(Self::Table { points })
    }

    /// Learning rate at global step `step`.
    pub fn at(&self, step: u64) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::Table { points } => points
                .iter()
                .take_while(|&&(from, _)| from <= step)
                .last()
                .or_else(|| points.first())
                .map(|&(_, lr)| lr)
                .unwrap_or(0.0),
            Self::LinearWarmup { lr, warmup_steps } => lr * warmup_fraction(step, *warmup_steps),
            Self::WarmupCosine { lr, min_lr, warmup_steps, decay_steps } => {
                if step < *warmup_steps {
                    return lr * warmup_fraction(step, *warmup_steps);
                }
                let progress = if *decay_steps == 0 {
                    1.0
                } else {
                    ((step - warmup_steps) as f64 / *decay_steps as f64).min(1.0)
                };
                min_lr + (lr - min_lr) * 0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant { .. })
    }
}

fn warmup_fraction(step: u64, warmup_steps: u64) -> f64 {
    if warmup_steps == 0 {
        1.0
    } else {
        (step as f64 / warmup_steps as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn constant_ignores_step() {
        let s = LrSchedule::constant(3e-4);
        assert!(close(s.at(0), 3e-4));
        assert!(close(s.at(1_000_000), 3e-4));
    }

    #[test]
    fn warmup_starts_at_zero_and_saturates() {
        let s = LrSchedule::LinearWarmup { lr: 1e-3, warmup_steps: 100 };
        assert_eq!(s.at(0), 0.0);
        assert!(close(s.at(50), 5e-4));
        assert!(close(s.at(100), 1e-3));
        assert!(close(s.at(5000), 1e-3));
    }

    #[test]
    fn zero_warmup_is_immediately_full() {
        let s = LrSchedule::LinearWarmup { lr: 0.1, warmup_steps: 0 };
        assert!(close(s.at(0), 0.1));
    }

    #[test]
    fn table_is_piecewise_constant() {
        let s = LrSchedule::table(vec![(100, 0.01), (0, 0.1), (200, 0.001)]).unwrap();
        assert!(close(s.at(0), 0.1));
        assert!(close(s.at(99), 0.1));
        assert!(close(s.at(100), 0.01));
        assert!(close(s.at(250), 0.001));
    }

    #[test]
    fn table_before_first_point_uses_first_rate() {
        let s = LrSchedule::table(vec![(10, 0.5)]).unwrap();
        assert!(close(s.at(3), 0.5));
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(LrSchedule::table(vec![]).is_err());
    }

    #[test]
    fn warmup_cosine_reaches_min_lr() {
        let s = LrSchedule::WarmupCosine { lr: 1.0, min_lr: 0.1, warmup_steps: 10, decay_steps: 100 };
        assert!(close(s.at(5), 0.5));
        assert!(close(s.at(10), 1.0));
        assert!(close(s.at(60), 0.55));
        assert!(close(s.at(110), 0.1));
        assert!(close(s.at(10_000), 0.1));
    }

    #[test]
    fn serde_uses_kind_tag() {
        let json = serde_json::to_string(&LrSchedule::constant(0.25)).unwrap();
        assert_eq!(json, r#"{"kind":"constant","lr":0.25}"#);
        let back: LrSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LrSchedule::constant(0.25));
    }
}
