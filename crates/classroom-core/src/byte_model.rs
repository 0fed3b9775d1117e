//! Compact byte-level language model.
//!
//! The harness treats the model as an opaque collaborator, but it still needs
//! one concrete implementation to train and sample from.  [`ByteModel`] keeps
//! every parameter in a [`VarMap`] so optimisers can update them in place:
//!
//! ```text
//! tokens ─▶ embedding ─▶ dropout ─▶ + positional[-n:] ─▶ h
//! h ─▶ norm(h + dropout(W₂·gelu(W₁·h))) ─▶ head ─▶ logits
//! ```
//!
//! ## Loss convention
//!
//! A training example of length `L` is split into inputs `x = e[..L-1]` and
//! next-byte targets `y = e[1..]`.  Only the second half of the positions is
//! scored, so every scored prediction has seen at least half a window of
//! context.  Cross-entropy is divided by `ln(n_vocab_out)`, which puts a
//! uniform guess at exactly `1.0`.

use std::collections::BTreeMap;

use candle_core::{DType, Device, IndexOp, Tensor, Var, D};
use candle_nn::{ops, Embedding, Init, LayerNorm, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::model::Model;
use crate::tensor_record::TensorRecord;

/// Architecture hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByteModelConfig {
    pub n_vocab_in: usize,
    pub n_vocab_out: usize,
    /// Longest context (and number of positional rows).
    pub max_ctx: usize,
    pub d_model: usize,
    pub d_ff: usize,
    pub p_dropout: f32,
}

impl Default for ByteModelConfig {
    fn default() -> Self {
        Self {
            n_vocab_in: 256,
            n_vocab_out: 256,
            max_ctx: 128,
            d_model: 128,
            d_ff: 512,
            p_dropout: 0.1,
        }
    }
}

impl ByteModelConfig {
    fn validate(&self) -> CoreResult<()> {
        let checks: [(&str, bool, &str); 5] = [
            ("n_vocab_in", self.n_vocab_in > 0, "must be positive"),
            ("n_vocab_out", self.n_vocab_out > 1, "must be at least 2"),
            ("max_ctx", self.max_ctx > 0, "must be positive"),
            ("d_model", self.d_model > 0 && self.d_ff > 0, "layer widths must be positive"),
            ("p_dropout", (0.0..1.0).contains(&self.p_dropout), "must lie in [0, 1)"),
        ];
        match checks.iter().find(|(_, ok, _)| !ok) {
            Some((field, _, reason)) => Err(CoreError::Config {
                field: field.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

pub struct ByteModel {
    config: ByteModelConfig,
    varmap: VarMap,
    embedding: Embedding,
    positional: Tensor,
    ff_in: Linear,
    ff_out: Linear,
    norm: LayerNorm,
    head: Linear,
    device: Device,
}

impl std::fmt::Debug for ByteModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteModel")
            .field("config", &self.config)
            .field("device", &crate::device::device_name(&self.device))
            .finish()
    }
}

impl ByteModel {
    /// Fresh model with random weights on `device`.
    pub fn new(config: ByteModelConfig, device: &Device) -> CoreResult<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embedding = candle_nn::embedding(config.n_vocab_in, config.d_model, vb.pp("embedding"))?;
        let positional = vb.get_with_hints(
            (config.max_ctx, config.d_model),
            "positional",
            Init::Randn { mean: 0.0, stdev: 0.02 },
        )?;
        let ff_in = candle_nn::linear(config.d_model, config.d_ff, vb.pp("ff_in"))?;
        let ff_out = candle_nn::linear(config.d_ff, config.d_model, vb.pp("ff_out"))?;
        let norm = candle_nn::layer_norm(config.d_model, 1e-5, vb.pp("norm"))?;
        let head = candle_nn::linear(config.d_model, config.n_vocab_out, vb.pp("head"))?;

        Ok(Self {
            config,
            varmap,
            embedding,
            positional,
            ff_in,
            ff_out,
            norm,
            head,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ByteModelConfig {
        &self.config
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> CoreResult<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum())
    }

    fn copy_weights_into(&self, target: &ByteModel) -> CoreResult<()> {
        let source: BTreeMap<String, Var> = self.named_parameters()?.into_iter().collect();
        for (name, var) in target.named_parameters()? {
            let src = source.get(&name).ok_or_else(|| missing_parameter(&name))?;
            var.set(&src.as_tensor().to_device(&target.device)?)?;
        }
        Ok(())
    }

    fn to_record(&self) -> CoreResult<ByteModelRecord> {
        let tensors = self
            .named_parameters()?
            .into_iter()
            .map(|(name, var)| Ok((name, TensorRecord::from_tensor(var.as_tensor())?)))
            .collect::<CoreResult<BTreeMap<_, _>>>()?;
        Ok(ByteModelRecord { config: self.config.clone(), tensors })
    }

    fn from_record(record: &ByteModelRecord, device: &Device) -> CoreResult<Self> {
        let model = Self::new(record.config.clone(), device)?;
        for (name, var) in model.named_parameters()? {
            let stored = record.tensors.get(&name).ok_or_else(|| missing_parameter(&name))?;
            var.set(&stored.to_tensor(device)?)?;
        }
        debug!(tensors = record.tensors.len(), "ByteModel restored from record");
        Ok(model)
    }

    /// Logits for every position of `x` (`[batch, n]` token ids).
    fn logits(&self, x: &Tensor, train: bool) -> CoreResult<Tensor> {
        let (_batch, n) = x.dims2()?;
        if n > self.config.max_ctx {
            return Err(CoreError::SequenceTooLong { got: n, max: self.config.max_ctx });
        }
        if n == 0 {
            return Err(CoreError::Config {
                field: "context".to_string(),
                reason: "at least one token is required".to_string(),
            });
        }

        let mut h = self.embedding.forward(x)?;
        if train {
            h = self.dropout(&h)?;
        }
        let pos = self.positional.narrow(0, self.config.max_ctx - n, n)?;
        h = h.broadcast_add(&pos)?;

        let mut ff = self.ff_out.forward(&self.ff_in.forward(&h)?.gelu()?)?;
        if train {
            ff = self.dropout(&ff)?;
        }
        let h = self.norm.forward(&(h + ff)?)?;
        Ok(self.head.forward(&h)?)
    }

    fn dropout(&self, xs: &Tensor) -> CoreResult<Tensor> {
        if self.config.p_dropout > 0.0 {
            Ok(ops::dropout(xs, self.config.p_dropout)?)
        } else {
            Ok(xs.clone())
        }
    }

    fn prepare(&self, tokens: &Tensor) -> CoreResult<Tensor> {
        Ok(tokens.to_device(&self.device)?.to_dtype(DType::U32)?)
    }
}

impl Model for ByteModel {
    fn losses(&self, batch: &Tensor) -> CoreResult<Tensor> {
        let batch = self.prepare(batch)?;
        let (_b, len) = batch.dims2()?;
        if len < 2 {
            return Err(CoreError::Config {
                field: "example_length".to_string(),
                reason: format!("need at least 2 tokens per example, got {len}"),
            });
        }
        let n = len - 1;
        let x = batch.narrow(1, 0, n)?;
        let y = batch.narrow(1, 1, n)?;

        let log_probs = ops::log_softmax(&self.logits(&x, true)?, D::Minus1)?;
        let start = n / 2;
        let scored = n - start;
        let targets = y.narrow(1, start, scored)?.contiguous()?.unsqueeze(D::Minus1)?;
        let nll = log_probs
            .narrow(1, start, scored)?
            .contiguous()?
            .gather(&targets, D::Minus1)?
            .squeeze(D::Minus1)?
            .neg()?;

        let per_example = nll.mean(D::Minus1)?;
        Ok((per_example / (self.config.n_vocab_out as f64).ln())?)
    }

    fn inference(&self, context: &Tensor) -> CoreResult<Tensor> {
        let context = self.prepare(context)?;
        let context = match context.rank() {
            1 => context.unsqueeze(0)?,
            _ => context,
        };
        let (_b, n) = context.dims2()?;
        let logits = self.logits(&context, false)?;
        Ok(ops::softmax_last_dim(&logits.i((0, n - 1))?)?)
    }

    fn n_ctx(&self) -> usize {
        self.config.max_ctx
    }

    fn n_vocab_out(&self) -> usize {
        self.config.n_vocab_out
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn named_parameters(&self) -> CoreResult<Vec<(String, Var)>> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::Poisoned)?;
        let mut params: Vec<(String, Var)> =
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn to_device(&self, device: &Device) -> CoreResult<Self> {
        let target = Self::new(self.config.clone(), device)?;
        self.copy_weights_into(&target)?;
        Ok(target)
    }
}

// ── Serialization ─────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ByteModelRecord {
    config: ByteModelConfig,
    tensors: BTreeMap<String, TensorRecord>,
}

impl Serialize for ByteModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_record()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

/// Deserialized models land on the CPU; use [`Model::to_device`] to move
/// them.
impl<'de> Deserialize<'de> for ByteModel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = ByteModelRecord::deserialize(deserializer)?;
        Self::from_record(&record, &Device::Cpu).map_err(serde::de::Error::custom)
    }
}

fn missing_parameter(name: &str) -> CoreError {
    CoreError::Config { field: name.to_string(), reason: "parameter missing".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ByteModel {
        let config = ByteModelConfig {
            max_ctx: 16,
            d_model: 8,
            d_ff: 16,
            p_dropout: 0.0,
            ..Default::default()
        };
        ByteModel::new(config, &Device::Cpu).unwrap()
    }

    fn batch(rows: usize, len: usize) -> Tensor {
        let data: Vec<u32> = (0..rows * len).map(|i| (i * 7 % 256) as u32).collect();
        Tensor::from_vec(data, (rows, len), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_losses_are_per_example() {
        let model = tiny();
        let losses = model.losses(&batch(3, 9)).unwrap();
        assert_eq!(losses.dims(), &[3]);
        for l in losses.to_vec1::<f32>().unwrap() {
            assert!(l.is_finite() && l > 0.0, "loss must be a positive finite value, got {l}");
        }
    }

    #[test]
    fn test_losses_backpropagate_to_every_parameter() {
        let model = tiny();
        let grads = model.losses(&batch(2, 9)).unwrap().mean_all().unwrap().backward().unwrap();
        for (name, var) in model.named_parameters().unwrap() {
            assert!(grads.get(var.as_tensor()).is_some(), "{name} received no gradient");
        }
    }

    #[test]
    fn test_inference_is_a_distribution() {
        let model = tiny();
        let ctx = Tensor::new(&[72u32, 105, 33], &Device::Cpu).unwrap();
        let probs = model.inference(&ctx).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(probs.len(), 256);
        let total: f32 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-4, "probabilities must sum to 1, got {total}");
    }

    #[test]
    fn test_context_longer_than_max_ctx_is_rejected() {
        let model = tiny();
        let result = model.losses(&batch(1, 18));
        assert!(matches!(result, Err(CoreError::SequenceTooLong { got: 17, max: 16 })));
    }

    #[test]
    fn test_single_token_examples_are_rejected() {
        let model = tiny();
        assert!(matches!(model.losses(&batch(2, 1)), Err(CoreError::Config { .. })));
    }

    #[test]
    fn test_try_clone_copies_values_not_storage() {
        let model = tiny();
        let clone = model.try_clone().unwrap();

        let (name, var) = clone.named_parameters().unwrap().remove(0);
        var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();

        let original = model
            .named_parameters()
            .unwrap()
            .into_iter()
            .find(|(n, _)| *n == name)
            .unwrap()
            .1;
        let sum: f32 = original.as_tensor().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(sum > 0.0, "zeroing the clone's {name} must not touch the original");
    }

    #[test]
    fn test_serde_round_trip_preserves_weights() {
        let model = tiny();
        let json = serde_json::to_string(&model).unwrap();
        let restored: ByteModel = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.config(), model.config());
        let a = model.to_record().unwrap();
        let b = restored.to_record().unwrap();
        assert_eq!(a.tensors, b.tensors);
    }

    #[test]
    fn test_named_parameters_cover_every_layer() {
        let names: Vec<String> = tiny().named_parameters().unwrap().into_iter().map(|(n, _)| n).collect();
        for expected in ["embedding.weight", "positional", "ff_in.weight", "head.bias", "norm.weight"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected} in {names:?}");
        }
    }

    #[test]
    fn test_invalid_dropout_is_a_config_error() {
        let config = ByteModelConfig { p_dropout: 1.5, ..Default::default() };
        assert!(matches!(ByteModel::new(config, &Device::Cpu), Err(CoreError::Config { .. })));
    }
}
