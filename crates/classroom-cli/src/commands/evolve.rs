//! `classroom evolve` — hill-climb batch size and learning rate.
//!
//! Each generation pushes a snapshot, mutates, studies for `--steps` steps
//! and pops the snapshot again unless the mutated student out-graded it.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use classroom_student::HillClimber;

use crate::commands::{format_duration, open_student, progress_bar};
use crate::config::AppConfig;

pub struct EvolveArgs<'a> {
    pub data: Option<&'a Path>,
    pub checkpoint: &'a Path,
    pub resume: bool,
    pub generations: usize,
    pub steps: usize,
    pub seed: Option<u64>,
    pub gpu: bool,
}

pub fn run(args: EvolveArgs<'_>, config: &AppConfig) -> Result<()> {
    let device = config.device.request(args.gpu).resolve()?;
    let mut student = open_student(args.data, args.checkpoint, args.resume, config, &device)?;
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let climber = HillClimber::new(args.steps);
    let start = Instant::now();
    let pb = progress_bar(args.generations as u64, "evolving")?;
    let mut kept = 0usize;

    for generation in 1..=args.generations {
        let outcome = climber.trial(&mut student, &mut rng)?;
        if outcome.kept {
            kept += 1;
        }
        info!(
            generation,
            kept = outcome.kept,
            mean_relative_grade = outcome.mean_relative_grade,
            tried_batch_size = outcome.mutation.batch_size.1,
            tried_lr = outcome.mutation.learning_rate.1,
            "Generation finished"
        );
        pb.set_message(format!(
            "kept {kept}/{generation} | batch {} | lr {:.2e}",
            student.batch_size(),
            student.learning_rate().unwrap_or_default()
        ));
        pb.inc(1);
        student.save(args.checkpoint)?;
    }

    pb.finish_with_message(format!("Evolution complete — kept {kept}/{}", args.generations));
    info!(
        generations = args.generations,
        kept,
        batch_size = student.batch_size(),
        lr = student.learning_rate().unwrap_or_default(),
        elapsed = %format_duration(start.elapsed().as_secs()),
        "Evolution finished"
    );
    Ok(())
}
