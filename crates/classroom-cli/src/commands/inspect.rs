//! `classroom inspect` — summarise a checkpoint without training it.

use std::path::Path;

use anyhow::Result;
use candle_core::Device;

use classroom_core::Model;
use classroom_student::{Metrics, Optimizer};

use crate::commands::{format_duration, load_student, ByteStudent};

pub fn run(checkpoint: &Path) -> Result<()> {
    let student = load_student(checkpoint, &Device::Cpu)?;
    print!("{}", summary(&student)?);
    Ok(())
}

fn summary(student: &ByteStudent) -> Result<String> {
    let metrics = student.metrics();
    let model = student.model();
    let config = model.config();
    let optimizer = student.optimizer();

    let mut lines = vec![
        format!(
            "model        d_model={} d_ff={} max_ctx={} vocab={} params={}",
            config.d_model,
            config.d_ff,
            config.max_ctx,
            model.n_vocab_out(),
            model.parameter_count()?
        ),
        format!("batch        {} x {}", student.batch_size(), student.example_length()),
        format!(
            "optimizer    step {} | lr {:.3e} | schedule {:?}",
            optimizer.step_count(),
            student.learning_rate().unwrap_or_default(),
            optimizer.param_groups().first().map(|g| &g.lr)
        ),
        format!("corpus       {} bytes", student.dataset().len()),
        format!(
            "history      {}/{} snapshot(s) | baseline {}",
            student.history().len(),
            student.history().depth(),
            if student.baseline().is_some() { "set" } else { "none" }
        ),
        format!(
            "studied      {} step(s) in {}",
            metrics.len(),
            format_duration(metrics.time() as u64)
        ),
    ];

    let mean = |values: &[f64]| Metrics::tail_mean(values, 100);
    if let (Some(grade), Some(relative)) = (mean(metrics.grades()), mean(metrics.relative_grades())) {
        lines.push(format!("last 100     grade {grade:.4} | relative {relative:.4}"));
    }
    Ok(lines.join("\n") + "\n")
}
