//! The student: a model, its optimiser and its training history.
//!
//! A [`Student`] owns a model and an optimiser, shares a read-only dataset,
//! and records one [`StudyRecord`] per [`Student::study`] call.  It also
//! keeps a bounded stack of frozen [`Snapshot`]s so an outer search loop can
//! try a change and roll it back:
//!
//! ```text
//! push ─▶ mutate ─▶ study × K ─▶ relative grades < 1 ? pop : keep
//! ```
//!
//! After a `push()` the snapshot's model becomes the *baseline*: every later
//! study step also scores the frozen baseline on the same batch, and the
//! ratio of the two grades is the relative grade.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Tensor, Var};
use rand::Rng;
use tracing::{debug, info, warn};

use classroom_core::{Dataset, Model};

use crate::metrics::{Metrics, StudyRecord};
use crate::optimizer::{Evaluation, Optimizer, StepContext};
use crate::schedule::LrSchedule;
use crate::snapshot::{Snapshot, SnapshotStack};

/// Factors `mutate()` draws from, for batch size and learning rate alike.
pub const MUTATION_FACTORS: [f64; 4] = [0.5, 0.75, 4.0 / 3.0, 2.0];

/// Learning rate used when a mutation would otherwise freeze the optimiser.
pub const MIN_MUTATED_LR: f64 = 1e-6;

/// Keeps `grade / baseline_grade` finite when the baseline grade is zero.
const RELATIVE_GRADE_EPS: f64 = 1e-8;

pub struct Student<M, O, D> {
    pub(crate) model: M,
    pub(crate) optimizer: O,
    pub(crate) dataset: Arc<D>,
    pub(crate) batch_size: usize,
    pub(crate) example_length: usize,
    pub(crate) metrics: Metrics,
    pub(crate) history: SnapshotStack<Snapshot<M, O, D>>,
    pub(crate) baseline: Option<Arc<M>>,
}

/// What a call to [`Student::mutate`] changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mutation {
    pub batch_size: (usize, usize),
    pub learning_rate: (f64, f64),
}

impl<M, O, D> Student<M, O, D>
where
    M: Model,
    O: Optimizer + Clone,
    D: Dataset,
{
    pub fn new(
        model: M,
        optimizer: O,
        dataset: Arc<D>,
        batch_size: usize,
        example_length: usize,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(example_length > 0, "example_length must be positive");
        Ok(Self {
            model,
            optimizer,
            dataset,
            batch_size,
            example_length,
            metrics: Metrics::default(),
            history: SnapshotStack::default(),
            baseline: None,
        })
    }

    /// Keep up to `depth` snapshots instead of one.
    pub fn with_history_depth(mut self, depth: usize) -> Self {
        self.history.set_depth(depth);
        self
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    /// Study from `dataset` from now on.  Snapshots keep the dataset they
    /// were pushed with, and `pop()` brings it back.
    pub fn set_dataset(&mut self, dataset: Arc<D>) {
        self.dataset = dataset;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    pub fn example_length(&self) -> usize {
        self.example_length
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn history(&self) -> &SnapshotStack<Snapshot<M, O, D>> {
        &self.history
    }

    pub fn baseline(&self) -> Option<&Arc<M>> {
        self.baseline.as_ref()
    }

    /// Learning rate of the first parameter group at the current step.
    pub fn learning_rate(&self) -> Option<f64> {
        self.optimizer.learning_rate()
    }

    // ── Study ─────────────────────────────────────────────────────────────────

    /// One optimisation step; appends exactly one entry to every metric.
    ///
    /// Grades come from the forward pass the optimiser differentiates, so
    /// they describe the weights *before* this step's update.
    ///
    /// Non-finite per-example losses count as `0.0`, for the baseline as well
    /// as the live model.  The baseline's are only read, never differentiated;
    /// zeroing them keeps `baseline_grade` and `relative_grade` finite, which
    /// JSON checkpoints need.
    pub fn study(&mut self) -> Result<StudyRecord> {
        let start = Instant::now();

        let mut step = StudyStep {
            model: &self.model,
            baseline: self.baseline.as_deref(),
            dataset: &*self.dataset,
            batch_size: self.batch_size,
            example_length: self.example_length,
        };
        let StepLosses { losses, baseline_losses } =
            self.optimizer.step(&mut step).context("optimiser step failed")?;

        let elapsed = start.elapsed().as_secs_f64();
        let grade = 1.0 - mean(&losses);
        let (baseline_grade, relative_grade) = match baseline_losses {
            Some(baseline_losses) => {
                let baseline_grade = 1.0 - mean(&baseline_losses);
                (baseline_grade, grade / (RELATIVE_GRADE_EPS + baseline_grade))
            }
            None => (grade, 1.0),
        };

        let record = StudyRecord { elapsed, grade, baseline_grade, relative_grade };
        self.metrics.record(record);
        debug!(
            step = self.metrics.len(),
            grade,
            baseline_grade,
            relative_grade,
            elapsed_ms = elapsed * 1e3,
            "Study step"
        );
        Ok(record)
    }

    // ── Clone / push / pop ────────────────────────────────────────────────────

    /// Deep copy of model, optimiser and metrics.  History and baseline are
    /// shared with `self`: the copy's snapshots are the same `Arc`s.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            model: self.model.try_clone().context("cloning student model")?,
            optimizer: self.optimizer.clone(),
            dataset: Arc::clone(&self.dataset),
            batch_size: self.batch_size,
            example_length: self.example_length,
            metrics: self.metrics.clone(),
            history: self.history.clone(),
            baseline: self.baseline.clone(),
        })
    }

    /// Snapshot the current state and make its model the new baseline.
    ///
    /// On a full stack the oldest snapshot is dropped; with the default depth
    /// of one, a second `push()` loses the first.
    pub fn push(&mut self) -> Result<()> {
        let snapshot = Arc::new(Snapshot {
            model: Arc::new(self.model.try_clone().context("snapshotting student model")?),
            optimizer: self.optimizer.clone(),
            dataset: Arc::clone(&self.dataset),
            batch_size: self.batch_size,
            example_length: self.example_length,
            metrics: self.metrics.clone(),
            baseline: self.baseline.clone(),
        });
        self.baseline = Some(Arc::clone(&snapshot.model));
        self.history.push(snapshot);
        info!(steps = self.metrics.len(), depth = self.history.len(), "Pushed student snapshot");
        Ok(())
    }

    /// Restore the newest snapshot, discarding everything since its `push()`.
    /// Returns `false` (and changes nothing) when there is no snapshot.
    pub fn pop(&mut self) -> Result<bool> {
        let Some(snapshot) = self.history.newest().cloned() else {
            debug!("pop() with no snapshot; nothing to restore");
            return Ok(false);
        };
        // Copy before removing so a failed copy leaves the stack intact.  The
        // copy lands where the live model runs; loaded snapshots sit on the CPU.
        let model = snapshot
            .model
            .to_device(self.model.device())
            .context("restoring student model")?;
        self.history.pop();

        self.model = model;
        self.optimizer = snapshot.optimizer.clone();
        self.dataset = Arc::clone(&snapshot.dataset);
        self.batch_size = snapshot.batch_size;
        self.example_length = snapshot.example_length;
        self.metrics.clone_from(&snapshot.metrics);
        self.baseline = snapshot.baseline.clone();

        info!(steps = self.metrics.len(), depth = self.history.len(), "Popped student snapshot");
        Ok(true)
    }

    // ── Mutate ────────────────────────────────────────────────────────────────

    pub fn mutate(&mut self) -> Result<Mutation> {
        self.mutate_with(&mut rand::rng())
    }

    /// Rescale `batch_size` and the first group's learning rate by factors
    /// drawn from [`MUTATION_FACTORS`].  The learning rate becomes a constant
    /// schedule, whatever shape it had before.
    pub fn mutate_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Mutation> {
        let batch_factor = MUTATION_FACTORS[rng.random_range(0..MUTATION_FACTORS.len())];
        let lr_factor = MUTATION_FACTORS[rng.random_range(0..MUTATION_FACTORS.len())];

        let Some(group) = self.optimizer.param_groups_mut().first_mut() else {
            bail!("optimiser has no parameter groups to mutate");
        };
        let old_lr = group.lr.at(0);
        let mut lr = old_lr * lr_factor;
        // Zero (or a garbage schedule) would freeze training for good.
        if lr <= 0.0 || lr.is_nan() {
            warn!(lr, floor = MIN_MUTATED_LR, "Mutated learning rate floored");
            lr = MIN_MUTATED_LR;
        }
        group.lr = LrSchedule::constant(lr);

        let old_batch = self.batch_size;
        self.batch_size = ((old_batch as f64 * batch_factor).floor() as usize).max(1);

        let mutation = Mutation { batch_size: (old_batch, self.batch_size), learning_rate: (old_lr, lr) };
        info!(
            batch_size = self.batch_size,
            from_batch_size = old_batch,
            lr,
            from_lr = old_lr,
            "Mutated student"
        );
        Ok(mutation)
    }
}

fn mean(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64
}

// ── Step context ──────────────────────────────────────────────────────────────

/// Per-example losses of the live model and, if set, of the baseline.
struct StepLosses {
    losses: Vec<f32>,
    baseline_losses: Option<Vec<f32>>,
}

struct StudyStep<'a, M, D> {
    model: &'a M,
    baseline: Option<&'a M>,
    dataset: &'a D,
    batch_size: usize,
    example_length: usize,
}

impl<M: Model, D: Dataset> StepContext for StudyStep<'_, M, D> {
    type Output = StepLosses;

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        Ok(self.model.named_parameters()?)
    }

    fn evaluate(&mut self) -> Result<Evaluation<StepLosses>> {
        let batch = self
            .dataset
            .batch(self.batch_size, self.example_length)
            .context("drawing a training batch")?;

        let losses = self
            .model
            .losses(&batch.to_device(self.model.device())?)?
            .to_dtype(DType::F32)?;
        let losses = zero_non_finite(&losses)?;
        let gradients = losses.mean_all()?.backward()?;

        let baseline_losses = match self.baseline {
            Some(baseline) => {
                let raw = baseline.losses(&batch.to_device(baseline.device())?)?.detach();
                Some(finite_values(&raw.to_dtype(DType::F32)?)?)
            }
            None => None,
        };

        Ok(Evaluation {
            gradients,
            examples: losses.dim(0)?,
            output: StepLosses { losses: losses.detach().to_vec1()?, baseline_losses },
        })
    }
}

/// Replace NaN and ±Inf entries with `0.0`, keeping the graph intact for the
/// finite ones.
fn zero_non_finite(losses: &Tensor) -> Result<Tensor> {
    let values = losses.to_vec1::<f32>()?;
    let bad = values.iter().filter(|v| !v.is_finite()).count();
    if bad == 0 {
        return Ok(losses.clone());
    }
    warn!(count = bad, of = values.len(), "Zeroed non-finite per-example losses");
    let mask: Vec<u8> = values.iter().map(|v| u8::from(v.is_finite())).collect();
    let mask = Tensor::from_vec(mask, losses.dims(), losses.device())?;
    Ok(mask.where_cond(losses, &losses.zeros_like()?)?)
}

/// Host copy of baseline losses with NaN and ±Inf read as `0.0`.
fn finite_values(losses: &Tensor) -> Result<Vec<f32>> {
    Ok(losses
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| if v.is_finite() { v } else { 0.0 })
        .collect())
}
