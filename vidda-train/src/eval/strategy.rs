//! Evaluation modes
//!
//! [`EvalMode`] is parsed once from the configuration and turned into a
//! boxed [`EvalStrategy`]. Single mode scores one checkpoint; best mode
//! walks the snapshot series, reusing cached scores and waiting for
//! checkpoints that training has not written yet.

use super::cache::{CACHE_FILE, EvalCache};
use super::metrics::{ConfusionMatrix, mean_iou};
use crate::config::Config;
use crate::error::{TrainError, TrainResult};
use crate::model::TemporalFusionModel;
use crate::tensor::{argmax_classes, image_to_tensor, resize_bilinear};
use crate::train::checkpoint_path;
use candle_core::Device;
use ordered_float::OrderedFloat;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use vidda_data::palette::{colorize, palette_for};
use vidda_data::{DataError, DatasetKind, LabelImage, SequenceDataset};

/// How evaluation selects checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// One configured checkpoint
    Single,
    /// Every snapshot in a range, keeping the best
    Best,
}

impl EvalMode {
    pub fn parse(name: &str) -> TrainResult<Self> {
        match name {
            "video_single" => Ok(EvalMode::Single),
            "video_best" => Ok(EvalMode::Best),
            other => Err(TrainError::NotImplemented {
                what: format!("evaluation mode '{other}'"),
            }),
        }
    }

    /// Concrete strategy for this mode
    pub fn build(self, config: &Config, device: &Device) -> TrainResult<Box<dyn EvalStrategy>> {
        let evaluator = Evaluator::new(config, device)?;
        Ok(match self {
            EvalMode::Single => Box::new(SingleCheckpoint::new(config, evaluator)),
            EvalMode::Best => Box::new(BestCheckpoint::new(config, evaluator)),
        })
    }
}

/// What to do when an expected checkpoint is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointWait {
    Skip,
    Poll {
        interval: Duration,
        max_attempts: usize,
    },
}

impl CheckpointWait {
    pub fn from_config(config: &Config) -> Self {
        if config.test.wait_model {
            CheckpointWait::Poll {
                interval: Duration::from_secs(config.test.wait_interval_secs),
                max_attempts: config.test.wait_max_attempts,
            }
        } else {
            CheckpointWait::Skip
        }
    }

    /// Whether `path` exists, polling if configured
    pub fn wait_for(&self, path: &Path) -> bool {
        if path.exists() {
            return true;
        }
        match *self {
            CheckpointWait::Skip => false,
            CheckpointWait::Poll {
                interval,
                max_attempts,
            } => {
                info!("Waiting for model {}", path.display());
                for _ in 0..max_attempts {
                    thread::sleep(interval);
                    if path.exists() {
                        return true;
                    }
                }
                warn!("Gave up waiting for {}", path.display());
                false
            }
        }
    }
}

/// Score of one checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointScore {
    pub iteration: Option<usize>,
    pub path: PathBuf,
    pub ious: Vec<f64>,
    pub miou: f64,
}

/// Scores of an evaluation run
#[derive(Debug, Clone, Default)]
pub struct EvalSummary {
    pub scores: Vec<CheckpointScore>,
    pub best: Option<CheckpointScore>,
}

/// Scores checkpoints on a labelled dataset
pub trait EvalStrategy {
    fn run(&mut self, dataset: &dyn SequenceDataset) -> TrainResult<EvalSummary>;
}

/// Runs the model over a dataset and accumulates the confusion histogram
pub struct Evaluator {
    model: TemporalFusionModel,
    /// (width, height)
    output_size: (usize, usize),
}

impl Evaluator {
    pub fn new(config: &Config, device: &Device) -> TrainResult<Self> {
        let model = TemporalFusionModel::new(&config.model, config.num_classes, device)?;
        let [w, h] = config.test.output_size_target;
        Ok(Self::from_model(model, (w as usize, h as usize)))
    }

    pub fn from_model(model: TemporalFusionModel, output_size: (usize, usize)) -> Self {
        Self { model, output_size }
    }

    pub fn model(&self) -> &TemporalFusionModel {
        &self.model
    }

    /// Load checkpoint weights
    pub fn load(&mut self, path: &Path) -> TrainResult<()> {
        info!("Loading checkpoint {}", path.display());
        self.model.load(path)
    }

    /// Predicted class map of every sample, passed to `on_prediction`
    pub fn evaluate(
        &self,
        dataset: &dyn SequenceDataset,
        mut on_prediction: impl FnMut(&str, &LabelImage) -> TrainResult<()>,
    ) -> TrainResult<ConfusionMatrix> {
        let (width, height) = self.output_size;
        let device = self.model.device();
        let mut hist = ConfusionMatrix::new(self.model.num_classes());
        for index in 0..dataset.len() {
            let sample = dataset.get(index)?;
            let label = sample.label.as_ref().ok_or_else(|| {
                DataError::InvalidData(format!("evaluation sample {} has no label", sample.name))
            })?;
            if (label.width, label.height) != (width, height) {
                return Err(TrainError::Shape(format!(
                    "label of {} is {}x{}, expected {}x{}",
                    sample.name, label.width, label.height, width, height
                )));
            }
            let current = image_to_tensor(&sample.current, device)?;
            let key = image_to_tensor(&sample.key, device)?;
            let output = self.model.forward(&current, &key, &sample.flow)?;
            let main = resize_bilinear(&output.fused.main.detach(), height, width)?;
            let prediction = LabelImage::new(height, width, argmax_classes(&main)?)?;
            hist.update(&label.data, &prediction.data);
            on_prediction(&sample.name, &prediction)?;
            if index % 100 == 0 {
                info!("{}/{} frames evaluated", index, dataset.len());
            }
        }
        Ok(hist)
    }
}

fn log_ious(ious: &[f64], names: Option<&[String]>) {
    if let Some(names) = names {
        for (name, iou) in names.iter().zip(ious) {
            info!("{}\t{:.2}", name, iou * 100.0);
        }
    }
}

/// Scores the checkpoint named in `test.restore_from`
pub struct SingleCheckpoint {
    evaluator: Evaluator,
    checkpoint: PathBuf,
    /// Where colourised predictions go, when enabled
    predictions_dir: Option<PathBuf>,
    source: DatasetKind,
}

impl SingleCheckpoint {
    pub fn new(config: &Config, evaluator: Evaluator) -> Self {
        let predictions_dir = config
            .test
            .save_predictions
            .then(|| config.test_snapshot_dir().join("best_results"));
        Self {
            evaluator,
            checkpoint: config.test.restore_from.clone(),
            predictions_dir,
            source: config.source,
        }
    }
}

impl EvalStrategy for SingleCheckpoint {
    fn run(&mut self, dataset: &dyn SequenceDataset) -> TrainResult<EvalSummary> {
        self.evaluator.load(&self.checkpoint)?;
        if let Some(dir) = &self.predictions_dir {
            std::fs::create_dir_all(dir)?;
        }
        let palette = palette_for(self.source);
        let dir = self.predictions_dir.clone();
        let hist = self.evaluator.evaluate(dataset, |name, prediction| {
            if let Some(dir) = &dir {
                let stem = Path::new(name)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(name);
                colorize(prediction, palette).save(dir.join(format!("{stem}_color.png")))?;
            }
            Ok(())
        })?;
        let ious = hist.per_class_iou();
        let miou = mean_iou(&ious);
        log_ious(&ious, dataset.class_names());
        info!("mIoU = {}", miou);
        let score = CheckpointScore {
            iteration: crate::train::checkpoint_iteration(&self.checkpoint),
            path: self.checkpoint.clone(),
            ious,
            miou,
        };
        Ok(EvalSummary {
            scores: vec![score.clone()],
            best: Some(score),
        })
    }
}

/// Walks `start..=max` by `step` over the snapshot directory
pub struct BestCheckpoint {
    evaluator: Evaluator,
    snapshot_dir: PathBuf,
    start: usize,
    step: usize,
    max: usize,
    wait: CheckpointWait,
}

impl BestCheckpoint {
    pub fn new(config: &Config, evaluator: Evaluator) -> Self {
        Self {
            evaluator,
            snapshot_dir: config.test_snapshot_dir(),
            start: config.test.snapshot_start_iter,
            step: config.test.snapshot_step.max(1),
            max: config.test.snapshot_maxiter,
            wait: CheckpointWait::from_config(config),
        }
    }

    pub fn with_wait(mut self, wait: CheckpointWait) -> Self {
        self.wait = wait;
        self
    }
}

impl EvalStrategy for BestCheckpoint {
    fn run(&mut self, dataset: &dyn SequenceDataset) -> TrainResult<EvalSummary> {
        let mut cache = EvalCache::open(&self.snapshot_dir.join(CACHE_FILE))?;
        let mut summary = EvalSummary::default();
        let mut best: Option<(OrderedFloat<f64>, usize)> = None;

        for iteration in (self.start..=self.max).step_by(self.step) {
            let path = checkpoint_path(&self.snapshot_dir, iteration);
            let ious = match cache.get(iteration) {
                Some(ious) => ious,
                None => {
                    if !self.wait.wait_for(&path) {
                        continue;
                    }
                    self.evaluator.load(&path)?;
                    let ious = self.evaluator.evaluate(dataset, |_, _| Ok(()))?.per_class_iou();
                    cache.insert(iteration, &ious)?;
                    ious
                }
            };
            let miou = mean_iou(&ious);
            if !miou.is_nan() && best.is_none_or(|(b, _)| OrderedFloat(miou) > b) {
                best = Some((OrderedFloat(miou), summary.scores.len()));
            }
            summary.scores.push(CheckpointScore {
                iteration: Some(iteration),
                path,
                ious,
                miou,
            });
            if let Some((b, i)) = best {
                info!(
                    "Current mIoU: {} (iter {}), best mIoU: {} (iter {:?})",
                    miou, iteration, b.0, summary.scores[i].iteration
                );
            }
        }

        summary.best = best.map(|(_, i)| summary.scores[i].clone());
        if let Some(best) = &summary.best {
            log_ious(&best.ious, dataset.class_names());
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names() {
        assert_eq!(EvalMode::parse("video_single").unwrap(), EvalMode::Single);
        assert_eq!(EvalMode::parse("video_best").unwrap(), EvalMode::Best);
        match EvalMode::parse("video_gt") {
            Err(TrainError::NotImplemented { what }) => assert!(what.contains("video_gt")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_skip_does_not_wait() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!CheckpointWait::Skip.wait_for(&dir.path().join("model_1.safetensors")));
    }

    #[test]
    fn test_poll_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let wait = CheckpointWait::Poll {
            interval: Duration::ZERO,
            max_attempts: 3,
        };
        assert!(!wait.wait_for(&dir.path().join("model_1.safetensors")));
        let present = dir.path().join("model_2.safetensors");
        std::fs::write(&present, b"").unwrap();
        assert!(wait.wait_for(&present));
    }
}
