//! Adaptation method selection

use crate::config::Config;
use crate::error::{TrainError, TrainResult};
use crate::train::{TrainingOrchestrator, TrainingStrategy};
use candle_core::Device;
use tracing::{info, warn};

/// Domain adaptation methods that can be trained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationMethod {
    /// Temporal and spatial adversarial alignment with consistency regularisation
    Davsn,
}

impl AdaptationMethod {
    pub fn parse(name: &str) -> TrainResult<Self> {
        match name {
            "DAVSN" => Ok(AdaptationMethod::Davsn),
            other => Err(TrainError::NotImplemented {
                what: format!("adaptation method '{other}'"),
            }),
        }
    }

    /// Training loop for this method
    pub fn build(self, config: &Config, device: &Device) -> TrainResult<Box<dyn TrainingStrategy>> {
        match self {
            AdaptationMethod::Davsn => Ok(Box::new(TrainingOrchestrator::new(config, device)?)),
        }
    }
}

/// CUDA device `gpu_id` when available, otherwise the CPU
pub fn select_device(gpu_id: usize) -> Device {
    match Device::cuda_if_available(gpu_id) {
        Ok(device) => {
            info!("Using device {:?}", device);
            device
        }
        Err(e) => {
            warn!("Falling back to CPU: {}", e);
            Device::Cpu
        }
    }
}
