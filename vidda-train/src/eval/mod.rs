//! Evaluation on labelled target frames
//!
//! - [`metrics`]: confusion histogram and mIoU
//! - [`cache`]: persisted per-checkpoint scores
//! - [`strategy`]: single-checkpoint and best-of-series evaluation

pub mod cache;
pub mod metrics;
pub mod strategy;

pub use cache::{CACHE_FILE, EvalCache};
pub use metrics::{ConfusionMatrix, mean_iou};
pub use strategy::{
    BestCheckpoint, CheckpointScore, CheckpointWait, EvalMode, EvalStrategy, EvalSummary,
    Evaluator, SingleCheckpoint,
};
