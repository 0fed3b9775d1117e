//! `classroom sample` — stream an autocompletion from a checkpoint.

use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use classroom_core::{Codec, Utf8Codec};
use classroom_student::AutocompleteOptions;

use crate::commands::load_student;
use crate::config::AppConfig;

pub struct SampleArgs<'a> {
    pub checkpoint: &'a Path,
    pub prompt: Option<String>,
    pub n_generate: Option<usize>,
    pub n_ctx: Option<usize>,
    pub greedy: bool,
    pub seed: Option<u64>,
    pub gpu: bool,
    pub stats: bool,
}

pub fn run(args: SampleArgs<'_>, config: &AppConfig) -> Result<()> {
    let device = config.device.request(args.gpu).resolve()?;
    let student = load_student(args.checkpoint, &device)?;
    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let options = AutocompleteOptions {
        prompt: args.prompt,
        n_generate: args.n_generate.unwrap_or(config.sampling.n_generate),
        n_ctx: args.n_ctx,
        greedy: args.greedy || config.sampling.greedy,
    };
    if let Some(prompt) = &options.prompt {
        print!("{prompt}");
    }

    let codec = Utf8Codec;
    let start = Instant::now();
    let mut tokens = Vec::with_capacity(options.n_generate);
    // Bytes of a multi-byte character arrive one at a time; print only once
    // the pending bytes decode cleanly.
    let mut pending: Vec<u32> = Vec::new();
    let mut stdout = std::io::stdout();
    for token in student.generate(&options, &codec, rng)? {
        let token = token?;
        tokens.push(token);
        pending.push(token);
        let text = codec.decode(&pending);
        if !text.ends_with(char::REPLACEMENT_CHARACTER) || pending.len() >= 4 {
            print!("{text}");
            stdout.flush()?;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        print!("{}", codec.decode(&pending));
    }
    println!();

    let elapsed = start.elapsed().as_secs_f64();
    info!(tokens = tokens.len(), elapsed_s = elapsed, "Sampling finished");
    if args.stats {
        eprintln!(
            "\n[{} tokens in {:.2}s — {:.1} tok/s]",
            tokens.len(),
            elapsed,
            tokens.len() as f64 / elapsed.max(1e-9)
        );
    }
    Ok(())
}
