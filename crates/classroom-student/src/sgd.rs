//! Stochastic gradient descent with optional heavy-ball momentum.

use std::collections::BTreeMap;

use anyhow::{ensure, Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::trace;

use classroom_core::TensorRecord;

use crate::optimizer::{
    from_records, to_records, AccumulatorRecord, Evaluation, GradientAccumulator, Optimizer,
    ParamGroup, StepContext, Update,
};

#[derive(Debug, Clone)]
pub struct Sgd {
    groups: Vec<ParamGroup>,
    momentum: f64,
    steps: u64,
    /// Velocity per parameter name; empty when `momentum == 0`.
    velocity: BTreeMap<String, Tensor>,
    accumulator: GradientAccumulator,
}

impl Sgd {
    pub fn new(groups: Vec<ParamGroup>, momentum: f64) -> Result<Self> {
        ensure!(!groups.is_empty(), "SGD needs at least one parameter group");
        ensure!((0.0..1.0).contains(&momentum), "SGD momentum must lie in [0, 1), got {momentum}");
        Ok(Self {
            groups,
            momentum,
            steps: 0,
            velocity: BTreeMap::new(),
            accumulator: GradientAccumulator::default(),
        })
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    fn apply(&mut self, update: Update, step: u64) -> Result<()> {
        let Update { group, name, var, grad } = update;
        let group = &self.groups[group];
        let lr = group.lr.at(step);

        let grad = if group.weight_decay > 0.0 {
            (&grad + (var.as_tensor() * group.weight_decay)?)?
        } else {
            grad
        };

        let direction = if self.momentum > 0.0 {
            let v = match self.velocity.remove(&name) {
                Some(prev) => ((prev.to_device(grad.device())? * self.momentum)? + &grad)?,
                None => grad,
            };
            self.velocity.insert(name.clone(), v.clone());
            v
        } else {
            grad
        };

        let next = (var.as_tensor() - (direction * lr)?)?;
        var.set(&next).with_context(|| format!("SGD update of {name}"))?;
        trace!(param = %name, lr, "SGD update");
        Ok(())
    }
}

impl Optimizer for Sgd {
    fn step<C: StepContext>(&mut self, ctx: &mut C) -> Result<C::Output> {
        let params = ctx.parameters()?;
        let Evaluation { gradients, examples, output } = ctx.evaluate()?;

        let step = self.steps;
        for update in self.accumulator.accumulate(&self.groups, &params, &gradients, examples)? {
            self.apply(update, step)?;
        }
        self.steps += 1;
        Ok(output)
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step_count(&self) -> u64 {
        self.steps
    }
}

#[derive(Serialize, Deserialize)]
struct SgdRecord {
    groups: Vec<ParamGroup>,
    momentum: f64,
    steps: u64,
    velocity: BTreeMap<String, TensorRecord>,
    #[serde(default)]
    accumulator: AccumulatorRecord,
}

impl Serialize for Sgd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let record = SgdRecord {
            groups: self.groups.clone(),
            momentum: self.momentum,
            steps: self.steps,
            velocity: to_records(&self.velocity).map_err(serde::ser::Error::custom)?,
            accumulator: self.accumulator.to_record().map_err(serde::ser::Error::custom)?,
        };
        record.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Sgd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = SgdRecord::deserialize(deserializer)?;
        let restore = || -> Result<Self> {
            let mut sgd = Sgd::new(record.groups, record.momentum)?;
            sgd.steps = record.steps;
            sgd.velocity = from_records(&record.velocity)?;
            sgd.accumulator = GradientAccumulator::from_record(record.accumulator)?;
            Ok(sgd)
        };
        restore().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::testing::Quadratic;
    use crate::schedule::LrSchedule;

    fn sgd(lr: f64, momentum: f64) -> Sgd {
        Sgd::new(vec![ParamGroup::new(LrSchedule::constant(lr))], momentum).unwrap()
    }

    #[test]
    fn plain_step_follows_the_gradient() {
        let mut opt = sgd(0.1, 0.0);
        let mut ctx = Quadratic::new(2.0, 0.0);
        opt.step(&mut ctx).unwrap();
        // grad = 2 * w = 4; w = 2 - 0.1 * 4
        assert!((ctx.value() - 1.6).abs() < 1e-6);
    }

    #[test]
    fn momentum_accelerates_repeated_gradients() {
        let mut plain = sgd(0.01, 0.0);
        let mut heavy = sgd(0.01, 0.9);
        let mut a = Quadratic::new(5.0, 0.0);
        let mut b = Quadratic::new(5.0, 0.0);
        for _ in 0..10 {
            plain.step(&mut a).unwrap();
            heavy.step(&mut b).unwrap();
        }
        assert!(b.value() < a.value(), "momentum {} vs plain {}", b.value(), a.value());
    }

    #[test]
    fn weight_decay_shrinks_without_gradient_pull() {
        let groups = vec![ParamGroup::new(LrSchedule::constant(0.1)).with_weight_decay(0.5)];
        let mut opt = Sgd::new(groups, 0.0).unwrap();
        let mut ctx = Quadratic::new(1.0, 1.0);
        opt.step(&mut ctx).unwrap();
        assert!((ctx.value() - 0.95).abs() < 1e-6);
    }

    #[test]
    fn invalid_momentum_is_rejected() {
        let groups = vec![ParamGroup::new(LrSchedule::constant(0.1))];
        assert!(Sgd::new(groups, 1.0).is_err());
    }

    #[test]
    fn serde_round_trip_keeps_velocity() {
        let mut opt = sgd(0.05, 0.5);
        let mut ctx = Quadratic::new(1.0, 0.0);
        opt.step(&mut ctx).unwrap();

        let json = serde_json::to_string(&opt).unwrap();
        let restored: Sgd = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.step_count(), 1);
        assert_eq!(restored.momentum(), 0.5);
        assert_eq!(serde_json::to_string(&restored).unwrap(), json);
    }
}
