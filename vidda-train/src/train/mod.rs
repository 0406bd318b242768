//! Training infrastructure
//!
//! - [`losses`]: segmentation cross-entropy, BCE with logits, weighted L1
//! - [`optim`]: gradient buffers, SGD with momentum, Adam
//! - [`schedule`]: polynomial learning-rate decay
//! - [`checkpoint`]: snapshot naming and persistence
//! - [`orchestrator`]: the per-iteration state machine

pub mod checkpoint;
pub mod losses;
pub mod optim;
pub mod orchestrator;
pub mod schedule;

pub use checkpoint::{checkpoint_iteration, checkpoint_path, save_checkpoint};
pub use optim::{Adam, GradientBuffer, Optimizer, Param, SgdMomentum};
pub use orchestrator::{
    Phase, RunSummary, StepLosses, StepOutcome, TrainingOrchestrator, TrainingStrategy,
};
pub use schedule::{PolySchedule, lr_poly};
