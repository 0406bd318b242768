//! Vidda Training Crate
//!
//! Unsupervised domain adaptation for video semantic segmentation. A
//! segmentation network trained on labelled synthetic sequences is adapted
//! to unlabelled real sequences by fusing predictions across frames with
//! optical flow, regularising them for temporal consistency, and aligning
//! their temporal and spatial statistics with adversarial discriminators.
//!
//! ## Modules
//!
//! - [`config`]: experiment configuration and override merging
//! - [`tensor`]: conversions and tensor helpers shared by the modules below
//! - [`warp`]: flow-guided forward/backward warping
//! - [`model`]: backbone, classifier heads and temporal fusion
//! - [`adapt`]: consistency regularisation and adversarial alignment
//! - [`train`]: losses, optimizers, schedules, checkpoints and the training loop
//! - [`eval`]: mIoU evaluation over checkpoints
//! - [`datasets`]: dataset construction from a [`Config`]
//! - [`method`]: adaptation method and device selection

pub mod adapt;
pub mod config;
pub mod datasets;
pub mod error;
pub mod eval;
pub mod method;
pub mod model;
pub mod tensor;
pub mod train;
pub mod warp;

pub use config::{Config, ConfigError};
pub use error::{TrainError, TrainResult};
pub use method::{AdaptationMethod, select_device};
pub use model::TemporalFusionModel;
pub use train::{TrainingOrchestrator, TrainingStrategy};
pub use warp::{FeatureWarper, WarpDirection};
