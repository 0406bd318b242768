//! Persistent per-checkpoint evaluation results

use crate::error::TrainResult;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the cache inside the snapshot directory
pub const CACHE_FILE: &str = "all_res.json";

/// Iteration → per-class IoU, stored as JSON with NaN as `null`
#[derive(Debug, Clone)]
pub struct EvalCache {
    path: PathBuf,
    results: BTreeMap<usize, Vec<Option<f64>>>,
}

impl EvalCache {
    /// Open the cache at `path`; a missing file is an empty cache
    pub fn open(path: &Path) -> TrainResult<Self> {
        let results = if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        } else {
            BTreeMap::new()
        };
        debug!("Evaluation cache {} has {} entries", path.display(), results.len());
        Ok(Self {
            path: path.to_path_buf(),
            results,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, iteration: usize) -> Option<Vec<f64>> {
        self.results
            .get(&iteration)
            .map(|ious| ious.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }

    /// Record and persist the IoUs of `iteration`
    pub fn insert(&mut self, iteration: usize, ious: &[f64]) -> TrainResult<()> {
        let stored = ious.iter().map(|v| (!v.is_nan()).then_some(*v)).collect();
        self.results.insert(iteration, stored);
        self.save()
    }

    fn save(&self) -> TrainResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.results)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);
        let mut cache = EvalCache::open(&path).unwrap();
        assert!(cache.is_empty());
        cache.insert(200, &[0.5, f64::NAN]).unwrap();

        let reopened = EvalCache::open(&path).unwrap();
        let ious = reopened.get(200).unwrap();
        assert_eq!(ious[0], 0.5);
        assert!(ious[1].is_nan());
        assert!(reopened.get(400).is_none());
    }

    #[test]
    fn test_cached_scores_are_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);
        let ious: Vec<f64> = (1..2000).map(|i| (i as f64).sqrt() / 97.0).collect();
        EvalCache::open(&path).unwrap().insert(1000, &ious).unwrap();

        let cached = EvalCache::open(&path).unwrap().get(1000).unwrap();
        let mismatched = ious
            .iter()
            .zip(&cached)
            .filter(|(a, b)| a.to_bits() != b.to_bits())
            .count();
        assert_eq!(mismatched, 0);
    }
}
