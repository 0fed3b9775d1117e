pub mod evolve;
pub mod inspect;
pub mod sample;
pub mod train;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use classroom_core::{device_name, ByteModel, BytesDataset, Model};
use classroom_student::{AdamW, Student};

use crate::config::AppConfig;

/// The concrete student every subcommand works with.
pub type ByteStudent = Student<ByteModel, AdamW, BytesDataset>;

/// Resume from `checkpoint` when asked to and it exists; otherwise build a
/// fresh student over the corpus at `data`.
pub fn open_student(
    data: Option<&Path>,
    checkpoint: &Path,
    resume: bool,
    config: &AppConfig,
    device: &Device,
) -> Result<ByteStudent> {
    if resume && checkpoint.exists() {
        if data.is_some() {
            warn!("--data is ignored when resuming; the checkpoint carries its own corpus");
        }
        return load_student(checkpoint, device);
    }
    if resume {
        warn!(path = %checkpoint.display(), "No checkpoint to resume from; starting fresh");
    }

    let Some(data) = data else {
        bail!("--data is required unless resuming from an existing checkpoint");
    };
    let dataset = BytesDataset::from_path(data)
        .with_context(|| format!("Failed to read corpus {}", data.display()))?;

    let model = ByteModel::new(config.model.byte_model(), device)
        .context("Failed to build byte model")?;
    let optimizer = AdamW::new(config.optimizer.param_groups(), config.optimizer.adamw_params())?;
    info!(
        params = model.parameter_count()?,
        corpus_bytes = dataset.len(),
        device = device_name(device),
        "Initialised fresh student"
    );

    Ok(Student::new(
        model,
        optimizer,
        Arc::new(dataset),
        config.training.batch_size,
        config.training.example_length,
    )?
    .with_history_depth(config.training.history_depth))
}

/// Load a checkpoint and move the live model to `device`.  Snapshots and the
/// baseline stay on the CPU; `pop()` restores onto the live model's device.
pub fn load_student(checkpoint: &Path, device: &Device) -> Result<ByteStudent> {
    let mut student = ByteStudent::load_from_path(checkpoint)?;
    if !matches!(device, Device::Cpu) {
        let model = student.model().to_device(device)?;
        *student.model_mut() = model;
        info!(device = device_name(device), "Moved resumed model");
    }
    Ok(student)
}

pub fn progress_bar(total: u64, label: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        )?
        .progress_chars("█▓░"),
    );
    pb.set_message(label.to_string());
    Ok(pb)
}

pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.model.max_ctx = 8;
        cfg.model.d_model = 8;
        cfg.model.d_ff = 16;
        cfg.training.batch_size = 2;
        cfg.training.example_length = 9;
        cfg
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 05s");
        assert_eq!(format_duration(3725), "1h 02m 05s");
    }

    #[test]
    fn test_fresh_student_requires_data() {
        let dir = TempDir::new().unwrap();
        let result = open_student(None, &dir.path().join("s.json"), false, &small_config(), &Device::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn test_open_then_resume() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("corpus.txt");
        std::fs::write(&data, "a small corpus of bytes for the classroom cli").unwrap();
        let checkpoint = dir.path().join("student.json");
        let cfg = small_config();

        let mut student = open_student(Some(&data), &checkpoint, true, &cfg, &Device::Cpu).unwrap();
        assert_eq!(student.batch_size(), 2);
        student.study().unwrap();
        student.save(&checkpoint).unwrap();

        let resumed = open_student(None, &checkpoint, true, &cfg, &Device::Cpu).unwrap();
        assert_eq!(resumed.metrics().len(), 1);
        assert_eq!(resumed.model().n_ctx(), 8);
    }
}
