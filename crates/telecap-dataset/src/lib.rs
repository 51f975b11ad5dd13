#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod buffer;
pub mod columnar;
pub mod encoder;
pub mod image_writer;
pub mod layout;
pub mod meta;
pub mod saver;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    /// Schema mismatch or an empty episode; never retried.
    #[error("episode validation failed: {0}")]
    Validation(String),
    #[error("episode {episode}: image flush timed out after {waited_s}s")]
    ImageFlushTimeout { episode: u64, waited_s: u64 },
    #[error("episode {episode}: {failed} image writes failed")]
    ImagesMissing { episode: u64, failed: u64 },
    #[error("episode {episode}: expected file missing after save: {path}")]
    FileMissing { episode: u64, path: std::path::PathBuf },
    #[error("encoder error: {0}")]
    Encoder(#[from] encoder::EncoderError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("metadata serialization error: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("saver is shut down")]
    SaverClosed,
}

impl DatasetError {
    /// Transient failures are retried from the untouched copy; validation
    /// failures and missing frames are final for that episode.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DatasetError::Encoder(_)
                | DatasetError::Arrow(_)
                | DatasetError::Parquet(_)
                | DatasetError::Meta(_)
                | DatasetError::Io(_)
        )
    }
}
