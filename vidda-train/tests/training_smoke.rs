//! End-to-end training and evaluation on synthetic sequences

use serde_json::json;
use std::path::Path;
use vidda_data::{SampleLoader, SequenceDataset, SyntheticConfig, SyntheticSequence};
use vidda_train::eval::{BestCheckpoint, CACHE_FILE, CheckpointWait, EvalStrategy, Evaluator};
use vidda_train::train::Phase;
use vidda_train::{AdaptationMethod, Config, TemporalFusionModel, TrainingOrchestrator};
use candle_core::Device;

fn synthetic(seed: u64) -> SyntheticSequence {
    SyntheticSequence::new(SyntheticConfig {
        width: 64,
        height: 32,
        num_classes: 3,
        len: 4,
        seed,
        ..SyntheticConfig::default()
    })
}

fn tiny_config(snapshot_dir: &Path) -> Config {
    Config::from_overrides(&json!({
        "num_classes": 3,
        "model": {
            "stem_channels": 4,
            "planes": [2, 2, 4, 4],
            "blocks": [1, 1, 1, 1],
            "head_dilations": [1, 2, 3, 4]
        },
        "train": {
            "discriminator_ndf": 4,
            "max_iters": 10,
            "early_stop": 3,
            "save_pred_every": 2,
            "snapshot_dir": snapshot_dir.to_str().unwrap()
        },
        "test": {
            "snapshot_start_iter": 2,
            "snapshot_step": 2,
            "snapshot_maxiter": 4,
            "output_size_target": [64, 32],
            "wait_model": false
        }
    }))
    .unwrap()
}

#[test]
fn test_training_snapshots_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let mut orchestrator = TrainingOrchestrator::new(&config, &Device::Cpu).unwrap();
    let mut source = SampleLoader::new(synthetic(1), true, 7).unwrap();
    let mut target = SampleLoader::new(synthetic(2), true, 8).unwrap();

    let summary = orchestrator.run(&mut source, &mut target).unwrap();

    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.checkpoints, vec![dir.path().join("model_2.safetensors")]);
    assert!(summary.checkpoints[0].exists());
    let losses = summary.last.unwrap();
    assert!(losses.entries().iter().all(|(_, v)| v.is_finite()));
    assert!(losses.seg_main > 0.0);

    assert_eq!(orchestrator.phase(), Phase::Idle);
    assert_eq!(
        orchestrator.last_phases(),
        &[
            Phase::DiscriminatorFreeze,
            Phase::SegmentationStep,
            Phase::AdversarialStep,
            Phase::DiscriminatorUnfreeze,
            Phase::DiscriminatorStep,
            Phase::OrthogonalityStep,
            Phase::OptimizerApply,
            Phase::CheckpointOrContinue,
            Phase::Idle,
        ]
    );
}

#[test]
fn test_method_builds_boxed_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let method = AdaptationMethod::parse(&config.train.da_method).unwrap();
    let mut strategy = method.build(&config, &Device::Cpu).unwrap();
    let source: Box<dyn SequenceDataset> = Box::new(synthetic(3));
    let target: Box<dyn SequenceDataset> = Box::new(synthetic(4));
    let mut source = SampleLoader::new(source, false, 0).unwrap();
    let mut target = SampleLoader::new(target, false, 0).unwrap();
    let summary = strategy.run(&mut source, &mut target).unwrap();
    assert_eq!(summary.checkpoints.len(), 1);
}

#[test]
fn test_best_checkpoint_uses_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let model = TemporalFusionModel::new(&config.model, 3, &Device::Cpu).unwrap();
    model.save(&dir.path().join("model_2.safetensors")).unwrap();

    let evaluator = |config: &Config| {
        let model = TemporalFusionModel::new(&config.model, 3, &Device::Cpu).unwrap();
        Evaluator::from_model(model, (64, 32))
    };
    let dataset = synthetic(5);

    let mut best = BestCheckpoint::new(&config, evaluator(&config)).with_wait(CheckpointWait::Skip);
    let summary = best.run(&dataset).unwrap();
    assert_eq!(summary.scores.len(), 1);
    assert_eq!(summary.scores[0].iteration, Some(2));
    assert!(dir.path().join(CACHE_FILE).exists());
    let first = summary.best.unwrap();

    // The checkpoint is gone but its score is cached
    std::fs::remove_file(dir.path().join("model_2.safetensors")).unwrap();
    let mut again = BestCheckpoint::new(&config, evaluator(&config)).with_wait(CheckpointWait::Skip);
    let cached = again.run(&dataset).unwrap();
    let second = cached.best.unwrap();
    assert_eq!(second.ious.len(), first.ious.len());
    for (a, b) in first.ious.iter().zip(&second.ious) {
        assert!(a == b || (a.is_nan() && b.is_nan()));
    }
}
