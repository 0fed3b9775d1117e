//! Whole-student checkpoints.
//!
//! A checkpoint is one JSON document holding the live state, every snapshot
//! on the history stack and the baseline.  Shared objects are written once:
//!
//! * a baseline that is some snapshot's model is stored as that snapshot's
//!   index, so `Arc` identity survives a save/load cycle;
//! * a snapshot whose dataset is the student's own is stored as `shared`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use classroom_core::{Dataset, Model};

use crate::metrics::Metrics;
use crate::optimizer::Optimizer;
use crate::snapshot::{Snapshot, SnapshotStack};
use crate::student::Student;

/// Bumped whenever the layout below changes incompatibly.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BaselineRecord<M> {
    None,
    /// The model of the snapshot at this index (oldest is 0).
    Snapshot(usize),
    Standalone(M),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DatasetRecord<D> {
    Shared,
    Owned(D),
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord<M, O, D> {
    model: M,
    optimizer: O,
    dataset: DatasetRecord<D>,
    batch_size: usize,
    example_length: usize,
    metrics: Metrics,
    baseline: BaselineRecord<M>,
}

/// `M`, `O` and `D` are references when saving and owned values when loading.
#[derive(Serialize, Deserialize)]
struct CheckpointRecord<M, O, D> {
    version: u32,
    model: M,
    optimizer: O,
    dataset: D,
    batch_size: usize,
    example_length: usize,
    metrics: Metrics,
    history_depth: usize,
    /// Oldest first.
    history: Vec<SnapshotRecord<M, O, D>>,
    baseline: BaselineRecord<M>,
}

fn baseline_record<'a, M, O, D>(
    baseline: Option<&'a Arc<M>>,
    older: &[Arc<Snapshot<M, O, D>>],
) -> BaselineRecord<&'a M> {
    match baseline {
        None => BaselineRecord::None,
        Some(model) => match older.iter().position(|s| Arc::ptr_eq(&s.model, model)) {
            Some(index) => BaselineRecord::Snapshot(index),
            None => BaselineRecord::Standalone(&**model),
        },
    }
}

fn resolve_baseline<M, O, D>(
    record: BaselineRecord<M>,
    older: &[Arc<Snapshot<M, O, D>>],
) -> Result<Option<Arc<M>>> {
    Ok(match record {
        BaselineRecord::None => None,
        BaselineRecord::Standalone(model) => Some(Arc::new(model)),
        BaselineRecord::Snapshot(index) => match older.get(index) {
            Some(snapshot) => Some(Arc::clone(&snapshot.model)),
            None => bail!(
                "checkpoint baseline refers to snapshot {index}, but only {} precede it",
                older.len()
            ),
        },
    })
}

impl<M, O, D> Student<M, O, D>
where
    M: Model + Serialize + DeserializeOwned,
    O: Optimizer + Clone + Serialize + DeserializeOwned,
    D: Dataset + Serialize + DeserializeOwned,
{
    /// Write the full state to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let entries: Vec<_> = self.history.iter().cloned().collect();

        let history = entries
            .iter()
            .enumerate()
            .map(|(i, s)| SnapshotRecord {
                model: &*s.model,
                optimizer: &s.optimizer,
                dataset: if Arc::ptr_eq(&s.dataset, &self.dataset) {
                    DatasetRecord::Shared
                } else {
                    DatasetRecord::Owned(&*s.dataset)
                },
                batch_size: s.batch_size,
                example_length: s.example_length,
                metrics: s.metrics.clone(),
                baseline: baseline_record(s.baseline.as_ref(), &entries[..i]),
            })
            .collect();

        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            model: &self.model,
            optimizer: &self.optimizer,
            dataset: &*self.dataset,
            batch_size: self.batch_size,
            example_length: self.example_length,
            metrics: self.metrics.clone(),
            history_depth: self.history.depth(),
            history,
            baseline: baseline_record(self.baseline.as_ref(), &entries),
        };

        let file = File::create(path)
            .with_context(|| format!("Cannot create checkpoint {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &record)
            .with_context(|| format!("Failed to serialise checkpoint {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;

        info!(
            path = %path.display(),
            steps = self.metrics.len(),
            snapshots = entries.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Replace every field of `self` with the checkpoint at `path`.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        *self = Self::load_from_path(path)?;
        Ok(())
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Cannot open checkpoint {}", path.display()))?;
        let record: CheckpointRecord<M, O, D> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))?;
        ensure!(
            record.version == CHECKPOINT_VERSION,
            "checkpoint {} has format version {}, expected {CHECKPOINT_VERSION}",
            path.display(),
            record.version
        );

        let dataset = Arc::new(record.dataset);
        let mut entries: Vec<Arc<Snapshot<M, O, D>>> = Vec::with_capacity(record.history.len());
        for snapshot in record.history {
            let baseline = resolve_baseline(snapshot.baseline, &entries)?;
            let snapshot_dataset = match snapshot.dataset {
                DatasetRecord::Shared => Arc::clone(&dataset),
                DatasetRecord::Owned(d) => Arc::new(d),
            };
            entries.push(Arc::new(Snapshot {
                model: Arc::new(snapshot.model),
                optimizer: snapshot.optimizer,
                dataset: snapshot_dataset,
                batch_size: snapshot.batch_size,
                example_length: snapshot.example_length,
                metrics: snapshot.metrics,
                baseline,
            }));
        }
        let baseline = resolve_baseline(record.baseline, &entries)?;

        info!(
            path = %path.display(),
            steps = record.metrics.len(),
            snapshots = entries.len(),
            "Checkpoint loaded"
        );
        Ok(Self {
            model: record.model,
            optimizer: record.optimizer,
            dataset,
            batch_size: record.batch_size,
            example_length: record.example_length,
            metrics: record.metrics,
            history: SnapshotStack::from_entries(record.history_depth, entries),
            baseline,
        })
    }
}
