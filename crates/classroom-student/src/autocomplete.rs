//! Sampling text from a student's model.

use std::collections::VecDeque;

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Tensor};
use rand::Rng;
use tracing::debug;

use classroom_core::sampling::{argmax, sample_categorical};
use classroom_core::{Codec, Dataset, Model};

use crate::optimizer::Optimizer;
use crate::student::Student;

pub const DEFAULT_N_GENERATE: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct AutocompleteOptions {
    /// Text to continue.  Without one, a random window of the dataset
    /// (twice the context length) seeds the generation.
    pub prompt: Option<String>,
    pub n_generate: usize,
    /// Context window; the model's maximum when unset.
    pub n_ctx: Option<usize>,
    /// Take the most likely token instead of sampling.
    pub greedy: bool,
}

impl Default for AutocompleteOptions {
    fn default() -> Self {
        Self { prompt: None, n_generate: DEFAULT_N_GENERATE, n_ctx: None, greedy: false }
    }
}

impl AutocompleteOptions {
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_n_generate(mut self, n_generate: usize) -> Self {
        self.n_generate = n_generate;
        self
    }
}

/// Lazily generated token ids.  Each `next()` runs one inference pass.
///
/// The sequence is finite and cannot be restarted; after the first error it
/// yields nothing more.
pub struct Generation<'a, M, R> {
    model: &'a M,
    window: VecDeque<u32>,
    n_ctx: usize,
    remaining: usize,
    greedy: bool,
    rng: R,
}

impl<M: Model, R: Rng> Generation<'_, M, R> {
    fn next_token(&mut self) -> Result<u32> {
        let context: Vec<u32> = self.window.iter().copied().collect();
        let context = Tensor::from_vec(context, self.window.len(), self.model.device())?;
        let probs = self.model.inference(&context)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let token = if self.greedy {
            argmax(&probs).context("model returned an empty distribution")?
        } else {
            sample_categorical(&probs, &mut self.rng)?
        };

        if self.window.len() == self.n_ctx {
            self.window.pop_front();
        }
        self.window.push_back(token);
        Ok(token)
    }
}

impl<M: Model, R: Rng> Iterator for Generation<'_, M, R> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let token = self.next_token();
        if token.is_err() {
            self.remaining = 0;
        }
        Some(token)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl<M, O, D> Student<M, O, D>
where
    M: Model,
    O: Optimizer + Clone,
    D: Dataset,
{
    /// Start a lazy generation.  The prompt (or dataset seed) is encoded
    /// with `codec` and only its last `n_ctx` tokens are kept.
    pub fn generate<C: Codec, R: Rng>(
        &self,
        options: &AutocompleteOptions,
        codec: &C,
        rng: R,
    ) -> Result<Generation<'_, M, R>> {
        let n_ctx = options.n_ctx.unwrap_or_else(|| self.model.n_ctx());
        ensure!(n_ctx > 0, "autocomplete context window must be positive");

        let prompt = match &options.prompt {
            Some(prompt) => prompt.clone(),
            None => {
                let seed = self
                    .dataset
                    .batch(1, 2 * n_ctx)
                    .context("drawing an autocomplete seed from the dataset")?
                    .squeeze(0)?
                    .to_vec1::<u32>()?;
                codec.decode(&seed)
            }
        };

        let tokens = codec.encode(&prompt);
        let window: VecDeque<u32> = tokens[tokens.len().saturating_sub(n_ctx)..].iter().copied().collect();
        ensure!(!window.is_empty(), "autocomplete prompt encodes to no tokens");
        debug!(n_ctx, prompt_tokens = window.len(), n_generate = options.n_generate, "Autocomplete");

        Ok(Generation {
            model: &self.model,
            window,
            n_ctx,
            remaining: options.n_generate,
            greedy: options.greedy,
            rng,
        })
    }

    /// Generate `n_generate` tokens and decode them.  Every sampled id is
    /// also appended to `output` when given.
    pub fn autocomplete<C: Codec, R: Rng>(
        &self,
        options: &AutocompleteOptions,
        codec: &C,
        rng: R,
        mut output: Option<&mut Vec<u32>>,
    ) -> Result<String> {
        let mut generated = Vec::with_capacity(options.n_generate);
        for token in self.generate(options, codec, rng)? {
            let token = token?;
            if let Some(out) = output.as_deref_mut() {
                out.push(token);
            }
            generated.push(token);
        }
        Ok(codec.decode(&generated))
    }
}
