//! Byte-level training data.
//!
//! A [`BytesDataset`] holds a corpus in memory and serves random contiguous
//! windows of it as `[batch, example_length]` tensors of `u32` token ids.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};

/// A source of fixed-shape token batches.
///
/// Students only ever read from a dataset, so implementations are shared
/// behind an `Arc` between a student, its clones and its snapshots.
pub trait Dataset {
    /// `batch_size` rows of `example_length` token ids each, on the CPU.
    fn batch(&self, batch_size: usize, example_length: usize) -> CoreResult<Tensor>;
}

/// An in-memory byte corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytesDataset {
    /// Where the bytes came from, for logs only.
    source: Option<PathBuf>,
    bytes: Vec<u8>,
}

impl BytesDataset {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { source: None, bytes: bytes.into() }
    }

    /// Read a whole file as the corpus.
    pub fn from_path(path: &Path) -> CoreResult<Self> {
        let bytes = fs::read(path)?;
        info!(path = %path.display(), bytes = bytes.len(), "Loaded byte corpus");
        Ok(Self { source: Some(path.to_path_buf()), bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Windows starting at caller-chosen offsets.  `batch` draws the offsets
    /// at random; tests and evaluation use this directly.
    pub fn windows_at(&self, offsets: &[usize], example_length: usize) -> CoreResult<Tensor> {
        let last_start = self.last_start(example_length)?;
        let mut data = Vec::with_capacity(offsets.len() * example_length);
        for &offset in offsets {
            if offset > last_start {
                return Err(CoreError::EmptyDataset {
                    len: self.bytes.len(),
                    needed: offset + example_length,
                });
            }
            data.extend(self.bytes[offset..offset + example_length].iter().map(|&b| u32::from(b)));
        }
        Ok(Tensor::from_vec(data, (offsets.len(), example_length), &Device::Cpu)?)
    }

    fn last_start(&self, example_length: usize) -> CoreResult<usize> {
        if example_length == 0 || self.bytes.len() < example_length {
            return Err(CoreError::EmptyDataset { len: self.bytes.len(), needed: example_length.max(1) });
        }
        Ok(self.bytes.len() - example_length)
    }
}

impl Dataset for BytesDataset {
    fn batch(&self, batch_size: usize, example_length: usize) -> CoreResult<Tensor> {
        let last_start = self.last_start(example_length)?;
        let mut rng = rand::rng();
        let offsets: Vec<usize> = (0..batch_size).map(|_| rng.random_range(0..=last_start)).collect();
        self.windows_at(&offsets, example_length)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn batch_has_requested_shape() {
        let ds = BytesDataset::from_bytes(b"the quick brown fox jumps over the lazy dog".to_vec());
        let batch = ds.batch(4, 8).unwrap();
        assert_eq!(batch.dims(), &[4, 8]);
        assert_eq!(batch.dtype(), candle_core::DType::U32);
    }

    #[test]
    fn batch_rows_are_contiguous_slices_of_the_corpus() {
        let text = b"abcdefghijklmnopqrstuvwxyz";
        let ds = BytesDataset::from_bytes(text.to_vec());
        let rows = ds.batch(16, 5).unwrap().to_vec2::<u32>().unwrap();
        for row in rows {
            let start = (row[0] - u32::from(b'a')) as usize;
            let expected: Vec<u32> = text[start..start + 5].iter().map(|&b| u32::from(b)).collect();
            assert_eq!(row, expected);
        }
    }

    #[test]
    fn windows_at_uses_given_offsets() {
        let ds = BytesDataset::from_bytes(b"0123456789".to_vec());
        let rows = ds.windows_at(&[0, 6], 4).unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(rows[0], vec![48, 49, 50, 51]);
        assert_eq!(rows[1], vec![54, 55, 56, 57]);
    }

    #[test]
    fn whole_corpus_fits_exactly_once() {
        let ds = BytesDataset::from_bytes(b"abcd".to_vec());
        let rows = ds.batch(3, 4).unwrap().to_vec2::<u32>().unwrap();
        assert!(rows.iter().all(|r| r == &vec![97, 98, 99, 100]));
    }

    #[test]
    fn too_short_corpus_errors() {
        let ds = BytesDataset::from_bytes(b"abc".to_vec());
        assert!(matches!(ds.batch(1, 4), Err(CoreError::EmptyDataset { len: 3, needed: 4 })));
    }

    #[test]
    fn loads_file_contents() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "hello corpus").unwrap();
        let ds = BytesDataset::from_path(file.path()).unwrap();
        assert_eq!(ds.len(), 12);
        assert_eq!(ds.source(), Some(file.path()));
    }

    #[test]
    fn missing_file_errors() {
        let result = BytesDataset::from_path(Path::new("/definitely/not/here.txt"));
        assert!(matches!(result, Err(CoreError::Io(_))));
    }
}
