//! Error types for dataset and artifact loading.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading frames, labels or flow artifacts.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Flow artifact not found: {}", path.display())]
    FlowNotFound { path: PathBuf },

    #[error("Malformed flow artifact {}: {reason}", path.display())]
    MalformedFlow { path: PathBuf, reason: String },

    #[error("Cannot parse frame index from '{0}'")]
    BadFrameName(String),

    #[error("Frame '{0}' has no preceding key frame")]
    NoKeyFrame(String),

    #[error("Image decoding error for {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Dataset list is empty: {}", path.display())]
    EmptyList { path: PathBuf },

    #[error("Index {index} out of range for dataset of length {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
