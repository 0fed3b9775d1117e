//! AdamW: Adam with decoupled weight decay.
//!
//! Moments are kept per parameter name (not per `Var`), so a deep copy of the
//! optimiser pairs naturally with a deep copy of the model: the clone's
//! parameters carry the same names and pick up the same state.

use std::collections::BTreeMap;

use anyhow::{ensure, Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::trace;

use classroom_core::TensorRecord;

use crate::optimizer::{
    AccumulatorRecord, Evaluation, GradientAccumulator, Optimizer, ParamGroup, StepContext, Update,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWParams {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self { beta1: 0.9, beta2: 0.999, eps: 1e-8 }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: Tensor,
    v: Tensor,
    /// Updates applied to this parameter, for bias correction.
    t: u64,
}

#[derive(Debug, Clone)]
pub struct AdamW {
    groups: Vec<ParamGroup>,
    params: AdamWParams,
    steps: u64,
    moments: BTreeMap<String, Moments>,
    accumulator: GradientAccumulator,
}

impl AdamW {
    pub fn new(groups: Vec<ParamGroup>, params: AdamWParams) -> Result<Self> {
        ensure!(!groups.is_empty(), "AdamW needs at least one parameter group");
        Ok(Self {
            groups,
            params,
            steps: 0,
            moments: BTreeMap::new(),
            accumulator: GradientAccumulator::default(),
        })
    }

    pub fn params(&self) -> &AdamWParams {
        &self.params
    }

    fn apply(&mut self, update: Update, step: u64) -> Result<()> {
        let Update { group, name, var, grad } = update;
        let group = &self.groups[group];
        let lr = group.lr.at(step);
        let AdamWParams { beta1, beta2, eps } = self.params;

        let (m, v, t) = match self.moments.remove(&name) {
            Some(prev) => (
                prev.m.to_device(grad.device())?,
                prev.v.to_device(grad.device())?,
                prev.t,
            ),
            None => (grad.zeros_like()?, grad.zeros_like()?, 0),
        };
        let t = t + 1;

        let m = ((m * beta1)? + (&grad * (1.0 - beta1))?)?;
        let v = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
        let m_hat = (&m / (1.0 - beta1.powi(t as i32)))?;
        let v_hat = (&v / (1.0 - beta2.powi(t as i32)))?;

        let theta = var.as_tensor();
        let decayed = (theta * (1.0 - lr * group.weight_decay))?;
        let adjusted = (m_hat / (v_hat.sqrt()? + eps)?)?;
        let next = (decayed - (adjusted * lr)?)?;
        var.set(&next).with_context(|| format!("AdamW update of {name}"))?;

        trace!(param = %name, lr, t, "AdamW update");
        self.moments.insert(name, Moments { m, v, t });
        Ok(())
    }
}

impl Optimizer for AdamW {
    fn step<C: StepContext>(&mut self, ctx: &mut C) -> Result<C::Output> {
        let params = ctx.parameters()?;
        let Evaluation { gradients, examples, output } = ctx.evaluate()?;

        let updates = self.accumulator.accumulate(&self.groups, &params, &gradients, examples)?;
        let step = self.steps;
        for update in updates {
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

// ── Serialization ─────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct MomentsRecord {
    m: TensorRecord,
    v: TensorRecord,
    t: u64,
}

#[derive(Serialize, Deserialize)]
struct AdamWRecord {
    groups: Vec<ParamGroup>,
    params: AdamWParams,
    steps: u64,
    moments: BTreeMap<String, MomentsRecord>,
    #[serde(default)]
    accumulator: AccumulatorRecord,
}

impl AdamW {
    fn to_record(&self) -> Result<AdamWRecord> {
        let moments = self
            .moments
            .iter()
            .map(|(name, s)| {
                let record = MomentsRecord {
                    m: TensorRecord::from_tensor(&s.m)?,
                    v: TensorRecord::from_tensor(&s.v)?,
                    t: s.t,
                };
                Ok((name.clone(), record))
            })
            .collect::<Result<_>>()?;

        Ok(AdamWRecord {
            groups: self.groups.clone(),
            params: self.params,
            steps: self.steps,
            moments,
            accumulator: self.accumulator.to_record()?,
        })
    }

    fn from_record(record: AdamWRecord) -> Result<Self> {
        ensure!(!record.groups.is_empty(), "AdamW checkpoint has no parameter groups");
        let moments = record
            .moments
            .into_iter()
            .map(|(name, rec)| {
                let m = rec.m.to_tensor(&Device::Cpu)?;
                let v = rec.v.to_tensor(&Device::Cpu)?;
                Ok((name, Moments { m, v, t: rec.t }))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            groups: record.groups,
            params: record.params,
            steps: record.steps,
            moments,
            accumulator: GradientAccumulator::from_record(record.accumulator)?,
        })
    }
}

impl Serialize for AdamW {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_record()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AdamW {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::from_record(AdamWRecord::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::testing::Quadratic;
    use crate::schedule::LrSchedule;

    fn adamw(lr: f64) -> AdamW {
        AdamW::new(vec![ParamGroup::new(LrSchedule::constant(lr))], AdamWParams::default()).unwrap()
    }

    #[test]
    fn converges_on_a_quadratic() {
        let mut opt = adamw(0.1);
        let mut ctx = Quadratic::new(0.0, 3.0);
        for _ in 0..300 {
            opt.step(&mut ctx).unwrap();
        }
        assert!((ctx.value() - 3.0).abs() < 0.05, "w = {}", ctx.value());
        assert_eq!(opt.step_count(), 300);
    }

    #[test]
    fn evaluates_the_context_once_per_step() {
        let mut opt = adamw(0.01);
        let mut ctx = Quadratic::new(1.0, 0.0);
        for _ in 0..5 {
            opt.step(&mut ctx).unwrap();
        }
        assert_eq!(ctx.evaluations, 5);
    }

    #[test]
    fn first_update_moves_by_lr() {
        // Bias-corrected Adam's first step is lr * sign(grad).
        let mut opt = adamw(0.5);
        let mut ctx = Quadratic::new(2.0, 0.0);
        let loss = opt.step(&mut ctx).unwrap();
        assert!((loss - 4.0).abs() < 1e-6, "output is the pre-update loss");
        assert!((ctx.value() - 1.5).abs() < 1e-5, "w = {}", ctx.value());
    }

    #[test]
    fn zero_learning_rate_freezes_parameters() {
        let mut opt = adamw(0.0);
        let mut ctx = Quadratic::new(2.0, 0.0);
        opt.step(&mut ctx).unwrap();
        assert_eq!(ctx.value(), 2.0);
    }

    #[test]
    fn learning_rate_follows_schedule() {
        let schedule = LrSchedule::LinearWarmup { lr: 1.0, warmup_steps: 4 };
        let mut opt = AdamW::new(vec![ParamGroup::new(schedule)], AdamWParams::default()).unwrap();
        assert_eq!(opt.learning_rate(), Some(0.0));
        let mut ctx = Quadratic::new(1.0, 0.0);
        opt.step(&mut ctx).unwrap();
        opt.step(&mut ctx).unwrap();
        assert_eq!(opt.learning_rate(), Some(0.5));
    }

    #[test]
    fn empty_groups_are_rejected() {
        assert!(AdamW::new(vec![], AdamWParams::default()).is_err());
    }

    #[test]
    fn serde_round_trip_keeps_moments() {
        let mut opt = adamw(0.1);
        let mut ctx = Quadratic::new(1.0, 0.0);
        opt.step(&mut ctx).unwrap();

        let json = serde_json::to_value(&opt).unwrap();
        let restored: AdamW = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(serde_json::to_value(&restored).unwrap(), json);
        assert_eq!(restored.step_count(), 1);

        // Both continue identically from the restored state.
        let mut a = Quadratic::new(0.5, 0.0);
        let mut b = Quadratic::new(0.5, 0.0);
        let mut original = opt.clone();
        let mut restored = restored;
        original.step(&mut a).unwrap();
        restored.step(&mut b).unwrap();
        assert!((a.value() - b.value()).abs() < 1e-7);
    }
}
