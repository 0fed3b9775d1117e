use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use classroom_core::{ByteModelConfig, DeviceRequest};
use classroom_student::{AdamWParams, LrSchedule, ParamGroup};

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub optimizer: OptimizerConfig,
    pub sampling: SamplingConfig,
    pub device: DeviceConfig,
}

/// Shape of freshly initialised byte models.  Resumed students keep the
/// shape stored in their checkpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub max_ctx: usize,
    pub d_model: usize,
    pub d_ff: usize,
    pub p_dropout: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub example_length: usize,
    pub steps: usize,
    /// Checkpoint every N steps; 0 saves only at the end.
    pub save_every: usize,
    pub history_depth: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub warmup_steps: u64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Examples to accumulate per update; 0 updates on every step.
    pub accumulate_examples: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SamplingConfig {
    pub n_generate: usize,
    pub greedy: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
    pub cuda_device_id: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let model = ByteModelConfig::default();
        let adam = AdamWParams::default();
        Self {
            model: ModelConfig {
                max_ctx: model.max_ctx,
                d_model: model.d_model,
                d_ff: model.d_ff,
                p_dropout: model.p_dropout,
            },
            training: TrainingConfig {
                batch_size: 16,
                example_length: 129,
                steps: 1000,
                save_every: 100,
                history_depth: 1,
            },
            optimizer: OptimizerConfig {
                learning_rate: 1e-3,
                warmup_steps: 0,
                weight_decay: 0.0,
                beta1: adam.beta1,
                beta2: adam.beta2,
                eps: adam.eps,
                accumulate_examples: 0,
            },
            sampling: SamplingConfig { n_generate: 128, greedy: false },
            device: DeviceConfig { prefer_gpu: false, cuda_device_id: 0 },
        }
    }
}

impl ModelConfig {
    pub fn byte_model(&self) -> ByteModelConfig {
        ByteModelConfig {
            max_ctx: self.max_ctx,
            d_model: self.d_model,
            d_ff: self.d_ff,
            p_dropout: self.p_dropout,
            ..ByteModelConfig::default()
        }
    }
}

impl OptimizerConfig {
    pub fn schedule(&self) -> LrSchedule {
        if self.warmup_steps == 0 {
            LrSchedule::constant(self.learning_rate)
        } else {
            LrSchedule::LinearWarmup { lr: self.learning_rate, warmup_steps: self.warmup_steps }
        }
    }

    pub fn param_groups(&self) -> Vec<ParamGroup> {
        let group = ParamGroup::new(self.schedule()).with_weight_decay(self.weight_decay);
        let group = match self.accumulate_examples {
            0 => group,
            n => group.with_batch_size(n),
        };
        vec![group]
    }

    pub fn adamw_params(&self) -> AdamWParams {
        AdamWParams { beta1: self.beta1, beta2: self.beta2, eps: self.eps }
    }
}

impl DeviceConfig {
    /// `--gpu` on the command line wins over `prefer_gpu = false`.
    pub fn request(&self, gpu_flag: bool) -> DeviceRequest {
        DeviceRequest::from_flags(gpu_flag || self.prefer_gpu, self.cuda_device_id)
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `CLASSROOM_`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let d = AppConfig::default();
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("model.max_ctx", d.model.max_ctx as i64)?
        .set_default("model.d_model", d.model.d_model as i64)?
        .set_default("model.d_ff", d.model.d_ff as i64)?
        .set_default("model.p_dropout", f64::from(d.model.p_dropout))?
        .set_default("training.batch_size", d.training.batch_size as i64)?
        .set_default("training.example_length", d.training.example_length as i64)?
        .set_default("training.steps", d.training.steps as i64)?
        .set_default("training.save_every", d.training.save_every as i64)?
        .set_default("training.history_depth", d.training.history_depth as i64)?
        .set_default("optimizer.learning_rate", d.optimizer.learning_rate)?
        .set_default("optimizer.warmup_steps", d.optimizer.warmup_steps as i64)?
        .set_default("optimizer.weight_decay", d.optimizer.weight_decay)?
        .set_default("optimizer.beta1", d.optimizer.beta1)?
        .set_default("optimizer.beta2", d.optimizer.beta2)?
        .set_default("optimizer.eps", d.optimizer.eps)?
        .set_default("optimizer.accumulate_examples", d.optimizer.accumulate_examples as i64)?
        .set_default("sampling.n_generate", d.sampling.n_generate as i64)?
        .set_default("sampling.greedy", d.sampling.greedy)?
        .set_default("device.prefer_gpu", d.device.prefer_gpu)?
        .set_default("device.cuda_device_id", d.device.cuda_device_id as i64)?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (CLASSROOM_TRAINING__BATCH_SIZE, etc.).
    // Field names contain underscores, so sections are split on "__".
    builder = builder.add_source(
        Environment::with_prefix("CLASSROOM")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults_match_app_config_default() {
        let cfg = load_config(None).unwrap();
        let d = AppConfig::default();
        assert_eq!(cfg.training.batch_size, d.training.batch_size);
        assert_eq!(cfg.training.example_length, 129);
        assert_eq!(cfg.model.max_ctx, 128);
        assert_eq!(cfg.sampling.n_generate, 128);
        assert!((cfg.optimizer.learning_rate - 1e-3).abs() < f64::EPSILON);
        assert!(!cfg.device.prefer_gpu);
    }

    #[test]
    fn test_custom_config_file_overrides_defaults() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[training]\nbatch_size = 3\nhistory_depth = 4\n\n[optimizer]\nwarmup_steps = 50").unwrap();

        let cfg = load_config(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.training.batch_size, 3);
        assert_eq!(cfg.training.history_depth, 4);
        assert_eq!(cfg.training.steps, 1000, "untouched keys keep their defaults");
        assert_eq!(
            cfg.optimizer.schedule(),
            LrSchedule::LinearWarmup { lr: 1e-3, warmup_steps: 50 }
        );
    }

    #[test]
    fn test_missing_custom_file_is_an_error() {
        let path = PathBuf::from("/definitely/not/here.toml");
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_accumulation_sets_group_target() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.optimizer.param_groups()[0].batch_size, None);
        cfg.optimizer.accumulate_examples = 64;
        assert_eq!(cfg.optimizer.param_groups()[0].batch_size, Some(64));
    }

    #[test]
    fn test_model_section_maps_onto_byte_model() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.model.byte_model(), ByteModelConfig::default());
    }

    #[test]
    fn test_gpu_flag_overrides_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.device.request(false), DeviceRequest::Cpu);
        assert_eq!(cfg.device.request(true), DeviceRequest::Gpu { ordinal: 0 });
    }
}
