//! Error types for training and evaluation

use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;
use vidda_data::DataError;

/// Errors raised while building, training or evaluating models
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not implemented: {what}")]
    NotImplemented { what: String },

    #[error("Invalid training phase: {0}")]
    Phase(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Checkpoint not found: {}", path.display())]
    CheckpointNotFound { path: PathBuf },

    #[error("Parameter store lock is poisoned")]
    Poisoned,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TrainResult<T> = Result<T, TrainError>;
