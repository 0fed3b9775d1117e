//! Optimiser protocol.
//!
//! Instead of handing the optimiser a closure, the student hands it a
//! [`StepContext`]: an object that knows which parameters may move and how to
//! evaluate the loss.  An optimiser's [`Optimizer::step`] evaluates the
//! context **exactly once**, folds the gradients into its per-group
//! accumulators, applies an update to every group whose example target has
//! been reached, and returns the context's output unchanged.
//!
//! ## Parameter groups
//!
//! Each [`ParamGroup`] owns a learning-rate schedule, a weight decay and an
//! optional `batch_size` target.  A parameter belongs to the first group whose
//! `prefix` matches its name (a group without a prefix matches everything);
//! parameters matched by no group are frozen.  With a target of `N` examples
//! the group's gradients are averaged over successive steps until at least
//! `N` examples have been seen, then applied as a single update.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use candle_core::{backprop::GradStore, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use classroom_core::TensorRecord;

use crate::schedule::LrSchedule;

/// What one evaluation of a [`StepContext`] produced.
pub struct Evaluation<T> {
    pub gradients: GradStore,
    /// Number of examples the loss was averaged over.
    pub examples: usize,
    pub output: T,
}

/// One unit of training work handed to an optimiser.
pub trait StepContext {
    type Output;

    /// Parameters the optimiser may update, by name.
    fn parameters(&self) -> Result<Vec<(String, Var)>>;

    /// Compute the loss and its gradients.  Called once per optimiser step.
    fn evaluate(&mut self) -> Result<Evaluation<Self::Output>>;
}

pub trait Optimizer {
    /// Evaluate `ctx` once, update parameters, return the context's output.
    fn step<C: StepContext>(&mut self, ctx: &mut C) -> Result<C::Output>;

    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Number of completed `step` calls; the schedules' time axis.
    fn step_count(&self) -> u64;

    /// Current learning rate of the first group.
    fn learning_rate(&self) -> Option<f64> {
        self.param_groups().first().map(|g| g.lr.at(self.step_count()))
    }
}

// ── ParamGroup ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    /// Parameter-name prefix this group claims; `None` claims everything.
    #[serde(default)]
    pub prefix: Option<String>,
    pub lr: LrSchedule,
    #[serde(default)]
    pub weight_decay: f64,
    /// Examples to accumulate before an update; `None` updates every step.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl ParamGroup {
    pub fn new(lr: LrSchedule) -> Self {
        Self { prefix: None, lr, weight_decay: 0.0, batch_size: None }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn matches(&self, name: &str) -> bool {
        self.prefix.as_deref().map_or(true, |p| name.starts_with(p))
    }
}

fn group_for(groups: &[ParamGroup], name: &str) -> Option<usize> {
    groups.iter().position(|g| g.matches(name))
}

// ── Gradient accumulation ─────────────────────────────────────────────────────

/// An averaged gradient ready to be applied to `var`.
pub(crate) struct Update {
    pub group: usize,
    pub name: String,
    pub var: Var,
    pub grad: Tensor,
}

/// Example-weighted gradient sums, per parameter, plus the number of
/// examples each group has seen since its last update.
#[derive(Debug, Clone, Default)]
pub(crate) struct GradientAccumulator {
    sums: BTreeMap<String, Tensor>,
    pending: Vec<usize>,
}

impl GradientAccumulator {
    /// Fold one evaluation in and drain every group that reached its target.
    pub fn accumulate(
        &mut self,
        groups: &[ParamGroup],
        params: &[(String, Var)],
        gradients: &GradStore,
        examples: usize,
    ) -> Result<Vec<Update>> {
        self.pending.resize(groups.len(), 0);

        for (name, var) in params {
            if group_for(groups, name).is_none() {
                continue;
            }
            let Some(grad) = gradients.get(var.as_tensor()) else {
                continue;
            };
            let weighted = (grad * examples as f64)?;
            let sum = match self.sums.remove(name) {
                Some(prev) => (prev.to_device(weighted.device())? + weighted)?,
                None => weighted,
            };
            self.sums.insert(name.clone(), sum);
        }
        for pending in self.pending.iter_mut() {
            *pending += examples;
        }

        let ready: Vec<bool> = groups
            .iter()
            .zip(&self.pending)
            .map(|(g, &seen)| seen > 0 && g.batch_size.map_or(true, |target| seen >= target))
            .collect();

        let mut updates = Vec::new();
        for (name, var) in params {
            let Some(group) = group_for(groups, name) else {
                continue;
            };
            if !ready[group] {
                continue;
            }
            if let Some(sum) = self.sums.remove(name) {
                let grad = (sum / self.pending[group] as f64)
                    .with_context(|| format!("averaging accumulated gradient of {name}"))?;
                updates.push(Update { group, name: name.clone(), var: var.clone(), grad });
            }
        }
        for (pending, ready) in self.pending.iter_mut().zip(ready) {
            if ready {
                *pending = 0;
            }
        }
        Ok(updates)
    }

    /// Examples seen per group since its last update.
    pub fn pending(&self) -> &[usize] {
        &self.pending
    }

    pub fn to_record(&self) -> Result<AccumulatorRecord> {
        Ok(AccumulatorRecord { sums: to_records(&self.sums)?, pending: self.pending.clone() })
    }

    pub fn from_record(record: AccumulatorRecord) -> Result<Self> {
        Ok(Self { sums: from_records(&record.sums)?, pending: record.pending })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AccumulatorRecord {
    sums: BTreeMap<String, TensorRecord>,
    pending: Vec<usize>,
}

pub(crate) fn to_records(tensors: &BTreeMap<String, Tensor>) -> Result<BTreeMap<String, TensorRecord>> {
    tensors
        .iter()
        .map(|(name, t)| Ok((name.clone(), TensorRecord::from_tensor(t)?)))
        .collect()
}

/// Optimiser state is restored on the CPU and follows the gradients to their
/// device on the next step.
pub(crate) fn from_records(records: &BTreeMap<String, TensorRecord>) -> Result<BTreeMap<String, Tensor>> {
    records
        .iter()
        .map(|(name, r)| Ok((name.clone(), r.to_tensor(&Device::Cpu)?)))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// `loss = (w - target)²` over a single scalar parameter.
    pub struct Quadratic {
        pub w: Var,
        pub target: f64,
        pub evaluations: usize,
    }

    impl Quadratic {
        pub fn new(start: f32, target: f64) -> Self {
            Self { w: Var::new(&[start], &Device::Cpu).unwrap(), target, evaluations: 0 }
        }

        pub fn value(&self) -> f32 {
            self.w.as_tensor().to_vec1::<f32>().unwrap()[0]
        }
    }

    impl StepContext for Quadratic {
        type Output = f32;

        fn parameters(&self) -> Result<Vec<(String, Var)>> {
            Ok(vec![("w".to_string(), self.w.clone())])
        }

        fn evaluate(&mut self) -> Result<Evaluation<f32>> {
            self.evaluations += 1;
            let loss = (self.w.as_tensor() - self.target)?.sqr()?.sum_all()?;
            let gradients = loss.backward()?;
            Ok(Evaluation { gradients, examples: 1, output: loss.to_scalar::<f32>()? })
        }
    }
}
