//! Checkpoint naming and persistence

use crate::error::TrainResult;
use crate::model::TemporalFusionModel;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Path of the checkpoint taken at `iteration`
pub fn checkpoint_path(dir: &Path, iteration: usize) -> PathBuf {
    dir.join(format!("model_{iteration}.safetensors"))
}

/// Iteration encoded in a checkpoint file name
pub fn checkpoint_iteration(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("model_")?
        .strip_suffix(".safetensors")?
        .parse()
        .ok()
}

/// Whether a snapshot is due at `iteration`
pub fn is_snapshot_iteration(iteration: usize, every: usize) -> bool {
    every > 0 && iteration != 0 && iteration % every == 0
}

/// Write the generator weights for `iteration` under `dir`
#[tracing::instrument(skip_all, fields(iteration = iteration))]
pub fn save_checkpoint(model: &TemporalFusionModel, dir: &Path, iteration: usize) -> TrainResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = checkpoint_path(dir, iteration);
    model.save(&path)?;
    info!("Taking snapshot: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_names() {
        let path = checkpoint_path(Path::new("snap"), 1200);
        assert_eq!(path, PathBuf::from("snap/model_1200.safetensors"));
        assert_eq!(checkpoint_iteration(&path), Some(1200));
        assert_eq!(checkpoint_iteration(Path::new("snap/other.bin")), None);
    }

    #[test]
    fn test_snapshot_schedule() {
        assert!(!is_snapshot_iteration(0, 1000));
        assert!(is_snapshot_iteration(2000, 1000));
        assert!(!is_snapshot_iteration(2001, 1000));
    }
}
