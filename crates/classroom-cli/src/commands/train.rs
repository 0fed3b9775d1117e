//! `classroom train` — run study steps and checkpoint periodically.
//!
//! ```text
//! classroom train --data ./corpus.txt --checkpoint ./student.json --steps 5000
//! classroom train --checkpoint ./student.json --resume --steps 1000
//! ```

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use tracing::info;

use classroom_student::Metrics;

use crate::commands::{format_duration, open_student, progress_bar};
use crate::config::AppConfig;

pub struct TrainArgs<'a> {
    pub data: Option<&'a Path>,
    pub checkpoint: &'a Path,
    pub resume: bool,
    pub steps: Option<usize>,
    pub save_every: Option<usize>,
    pub gpu: bool,
}

pub fn run(args: TrainArgs<'_>, config: &AppConfig) -> Result<()> {
    let device = config.device.request(args.gpu).resolve()?;
    let mut student = open_student(args.data, args.checkpoint, args.resume, config, &device)?;

    let steps = args.steps.unwrap_or(config.training.steps);
    let save_every = args.save_every.unwrap_or(config.training.save_every);
    info!(
        steps,
        save_every,
        batch_size = student.batch_size(),
        example_length = student.example_length(),
        checkpoint = %args.checkpoint.display(),
        "Starting training"
    );

    let start = Instant::now();
    let pb = progress_bar(steps as u64, "studying")?;
    for step in 1..=steps {
        let record = student.study()?;
        pb.set_message(format!(
            "grade {:.4} | relative {:.4} | lr {:.2e}",
            record.grade,
            record.relative_grade,
            student.learning_rate().unwrap_or_default()
        ));
        pb.inc(1);

        if save_every > 0 && step % save_every == 0 && step < steps {
            student.save(args.checkpoint)?;
        }
    }
    student.save(args.checkpoint)?;

    let recent = Metrics::tail_mean(student.metrics().grades(), 100).unwrap_or_default();
    pb.finish_with_message(format!("Training complete — mean grade (last 100) {recent:.4}"));
    info!(
        steps,
        total_steps = student.metrics().len(),
        mean_grade = recent,
        elapsed = %format_duration(start.elapsed().as_secs()),
        "Training finished"
    );
    Ok(())
}
