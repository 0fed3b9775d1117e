use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use commands::{evolve::EvolveArgs, sample::SampleArgs, train::TrainArgs};
use config::load_config;

/// classroom — train, evolve and sample byte-level students
#[derive(Debug, Parser)]
#[command(name = "classroom", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    /// Prefer GPU acceleration (CUDA/Metal).
    #[arg(long, global = true)]
    gpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train a student on a byte corpus, checkpointing as it goes.
    Train {
        /// Corpus file (any bytes).  Required unless resuming.
        #[arg(long, value_name = "FILE")]
        data: Option<PathBuf>,

        /// Checkpoint path (written on save, read with --resume).
        #[arg(long, value_name = "PATH")]
        checkpoint: PathBuf,

        /// Continue from --checkpoint if it exists.
        #[arg(long)]
        resume: bool,

        /// Study steps to run (default from config).
        #[arg(long)]
        steps: Option<usize>,

        /// Save every N steps; 0 saves only at the end (default from config).
        #[arg(long)]
        save_every: Option<usize>,
    },

    /// Hill-climb batch size and learning rate: push, mutate, study, keep or pop.
    Evolve {
        /// Corpus file.  Required unless resuming.
        #[arg(long, value_name = "FILE")]
        data: Option<PathBuf>,

        /// Checkpoint path, saved after every generation.
        #[arg(long, value_name = "PATH")]
        checkpoint: PathBuf,

        /// Continue from --checkpoint if it exists.
        #[arg(long)]
        resume: bool,

        /// Number of mutate-and-compare generations.
        #[arg(long, default_value_t = 10)]
        generations: usize,

        /// Study steps per generation.
        #[arg(long, default_value_t = 32)]
        steps: usize,

        /// Random seed for reproducible mutations.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Autocomplete text with a trained student and stream it to stdout.
    Sample {
        #[arg(long, value_name = "PATH")]
        checkpoint: PathBuf,

        /// Text to continue.  Omit to seed from a random slice of the corpus.
        #[arg(long)]
        prompt: Option<String>,

        /// Number of bytes to generate (default from config).
        #[arg(long)]
        n_generate: Option<usize>,

        /// Context window (default: the model's maximum).
        #[arg(long)]
        n_ctx: Option<usize>,

        /// Always pick the most likely byte instead of sampling.
        #[arg(long)]
        greedy: bool,

        /// Random seed for reproducible sampling.
        #[arg(long)]
        seed: Option<u64>,

        /// Print timing and throughput stats after generation.
        #[arg(long)]
        stats: bool,
    },

    /// Print a summary of a checkpoint.
    Inspect {
        #[arg(long, value_name = "PATH")]
        checkpoint: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    init_tracing(&cli.log_format);

    // Load configuration
    let cfg = load_config(cli.config.as_ref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Train { data, checkpoint, resume, steps, save_every } => {
            let args = TrainArgs {
                data: data.as_deref(),
                checkpoint: &checkpoint,
                resume,
                steps,
                save_every,
                gpu: cli.gpu,
            };
            commands::train::run(args, &cfg)?;
        }
        Commands::Evolve { data, checkpoint, resume, generations, steps, seed } => {
            let args = EvolveArgs {
                data: data.as_deref(),
                checkpoint: &checkpoint,
                resume,
                generations,
                steps,
                seed,
                gpu: cli.gpu,
            };
            commands::evolve::run(args, &cfg)?;
        }
        Commands::Sample { checkpoint, prompt, n_generate, n_ctx, greedy, seed, stats } => {
            let args = SampleArgs {
                checkpoint: &checkpoint,
                prompt,
                n_generate,
                n_ctx,
                greedy,
                seed,
                gpu: cli.gpu,
                stats,
            };
            commands::sample::run(args, &cfg)?;
        }
        Commands::Inspect { checkpoint } => {
            commands::inspect::run(&checkpoint)?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Logs go to stderr so `sample` output can be piped.
    if log_format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "classroom", "train", "--checkpoint", "s.json", "--steps", "5", "--gpu", "--log-format", "json",
        ])
        .unwrap();
        assert!(cli.gpu);
        assert_eq!(cli.log_format, "json");
        match cli.command {
            Commands::Train { steps, resume, data, .. } => {
                assert_eq!(steps, Some(5));
                assert!(!resume);
                assert!(data.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_evolve_defaults() {
        let cli = Cli::try_parse_from(["classroom", "evolve", "--checkpoint", "s.json", "--data", "c.txt"]).unwrap();
        match cli.command {
            Commands::Evolve { generations, steps, seed, .. } => {
                assert_eq!(generations, 10);
                assert_eq!(steps, 32);
                assert_eq!(seed, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
