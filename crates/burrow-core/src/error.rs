use thiserror::Error;

pub type BurrowResult<T> = Result<T, BurrowError>;

/// Error taxonomy for the whole workspace.
///
/// Kinds, not call sites: `Storage` always carries the object key it was
/// touching, `Crypto` messages include the chunk index where one applies,
/// and `Integrity` is reserved for digest mismatches so callers can never
/// confuse a transport failure with tampering.
#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error for {key}: {message}")]
    Storage { key: String, message: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("unsupported format: {0}")]
    Format(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BurrowError {
    /// Storage error constructor used by every backend call site.
    pub fn storage(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Storage {
            key: key.into(),
            message: message.to_string(),
        }
    }
}
