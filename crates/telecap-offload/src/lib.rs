#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod api;
pub mod download;
pub mod edge;
pub mod orchestrator;
pub mod poll;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OffloadError {
    /// Quick probe missed its deadline. Fatal before recording in offload
    /// modes; the local modes never probe.
    #[error("connection probe failed: {0}")]
    ConnectionProbeFailed(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("training service error: {0}")]
    Api(String),
    #[error("training failed with status {status}: {detail}")]
    TrainingFailed { status: String, detail: String },
    #[error("training did not complete within {0:?}")]
    TrainingTimeout(Duration),
    #[error("model download failed: {0}")]
    DownloadFailed(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("offload cancelled")]
    Cancelled,
}
