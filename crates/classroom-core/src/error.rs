use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model config error: {field} — {reason}")]
    Config { field: String, reason: String },

    #[error("Sequence too long: {got} tokens, max {max}")]
    SequenceTooLong { got: usize, max: usize },

    #[error("Dataset too small: {len} bytes, need at least {needed} per example")]
    EmptyDataset { len: usize, needed: usize },

    #[error("Sampling error: {0}")]
    Sampling(String),

    #[error("Parameter state lock poisoned")]
    Poisoned,
}

pub type CoreResult<T> = Result<T, CoreError>;
