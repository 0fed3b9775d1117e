//! Serde form of a tensor: shape plus row-major `f32` data.
//!
//! Checkpoints are plain JSON, so every tensor that has to outlive the
//! process (model weights, optimiser moments, accumulated gradients) passes
//! through this type.  Values are widened/narrowed to `F32` on the way in and
//! out; the harness trains in `F32` only.  The data is written as IEEE-754 bit
//! patterns: JSON has no spelling for NaN or ±Inf, and a diverged model must
//! still reload.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    #[serde(with = "f32_bits")]
    pub data: Vec<f32>,
}

mod f32_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data.iter().map(|v| v.to_bits()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        Ok(Vec::<u32>::deserialize(deserializer)?.into_iter().map(f32::from_bits).collect())
    }
}

impl TensorRecord {
    /// Copy `tensor` to host memory.
    pub fn from_tensor(tensor: &Tensor) -> CoreResult<Self> {
        let shape = tensor.dims().to_vec();
        let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { shape, data })
    }

    /// Rebuild the tensor on `device`.
    pub fn to_tensor(&self, device: &Device) -> CoreResult<Tensor> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(CoreError::Config {
                field: "tensor".to_string(),
                reason: format!(
                    "shape {:?} needs {expected} values, record holds {}",
                    self.shape,
                    self.data.len()
                ),
            });
        }
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_shape_and_values() {
        let t = Tensor::new(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &Device::Cpu).unwrap();
        let rec = TensorRecord::from_tensor(&t).unwrap();
        assert_eq!(rec.shape, vec![2, 3]);
        assert_eq!(rec.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let back = rec.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(back.dims(), &[2, 3]);
        assert_eq!(back.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_non_finite_values_survive_json() {
        let t = Tensor::new(&[f32::NAN, f32::INFINITY, f32::NEG_INFINITY, -0.5], &Device::Cpu).unwrap();
        let json = serde_json::to_string(&TensorRecord::from_tensor(&t).unwrap()).unwrap();
        assert!(!json.contains("null"), "{json}");

        let back: TensorRecord = serde_json::from_str(&json).unwrap();
        let values = back.to_tensor(&Device::Cpu).unwrap().to_vec1::<f32>().unwrap();
        assert!(values[0].is_nan());
        assert_eq!(values[1], f32::INFINITY);
        assert_eq!(values[2], f32::NEG_INFINITY);
        assert_eq!(values[3], -0.5);
    }

    #[test]
    fn test_mismatched_record_is_rejected() {
        let rec = TensorRecord { shape: vec![2, 2], data: vec![1.0, 2.0, 3.0] };
        assert!(matches!(rec.to_tensor(&Device::Cpu), Err(CoreError::Config { .. })));
    }
}
