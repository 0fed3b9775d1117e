//! # classroom-core
//!
//! Numeric collaborators for the classroom training harness: the model and
//! dataset traits, a compact byte-level model, byte codecs, categorical
//! sampling and device selection.
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod byte_model;
pub mod codec;
pub mod dataset;
pub mod device;
pub mod error;
pub mod model;
pub mod sampling;
pub mod tensor_record;

pub use byte_model::{ByteModel, ByteModelConfig};
pub use codec::{Codec, Utf8Codec};
pub use dataset::{BytesDataset, Dataset};
pub use device::{device_name, DeviceRequest};
pub use error::{CoreError, CoreResult};
pub use model::Model;
pub use tensor_record::TensorRecord;
