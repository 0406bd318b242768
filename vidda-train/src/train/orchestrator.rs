//! Per-iteration training control flow
//!
//! One iteration walks the phases of [`Phase`] in order. Gradients of every
//! backward pass go to each unfrozen [`GradientBuffer`]; the discriminator
//! buffers are frozen for the supervised and adversarial passes and
//! unfrozen for the discriminator and orthogonality passes.

use super::checkpoint::{is_snapshot_iteration, save_checkpoint};
use super::losses::cross_entropy_2d;
use super::optim::{Adam, GradientBuffer, Optimizer, SgdMomentum};
use super::schedule::PolySchedule;
use crate::adapt::{
    AlignmentPairs, ConsistencyRegularizer, DiscriminatorId, DomainAligner, DomainLabel,
};
use crate::config::Config;
use crate::error::{TrainError, TrainResult};
use crate::model::{ModelOutput, ParamGroup, TemporalFusionModel};
use crate::tensor::{image_to_tensor, labels_to_tensor, resize_bilinear};
use candle_core::{DType, Device, Tensor};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, trace};
use vidda_data::{DataError, FrameSample, SampleLoader, SequenceDataset};

/// Phases of one training iteration, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Between iterations
    Idle,
    DiscriminatorFreeze,
    SegmentationStep,
    AdversarialStep,
    DiscriminatorUnfreeze,
    DiscriminatorStep,
    OrthogonalityStep,
    OptimizerApply,
    CheckpointOrContinue,
}

impl Phase {
    /// The phase that must follow this one
    pub fn next(self) -> Phase {
        match self {
            Phase::Idle => Phase::DiscriminatorFreeze,
            Phase::DiscriminatorFreeze => Phase::SegmentationStep,
            Phase::SegmentationStep => Phase::AdversarialStep,
            Phase::AdversarialStep => Phase::DiscriminatorUnfreeze,
            Phase::DiscriminatorUnfreeze => Phase::DiscriminatorStep,
            Phase::DiscriminatorStep => Phase::OrthogonalityStep,
            Phase::OrthogonalityStep => Phase::OptimizerApply,
            Phase::OptimizerApply => Phase::CheckpointOrContinue,
            Phase::CheckpointOrContinue => Phase::Idle,
        }
    }
}

/// Scalar loss values of one iteration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepLosses {
    pub seg_main: f32,
    pub seg_aux: f32,
    pub tcr_main: f32,
    pub tcr_aux: f32,
    pub adv_temporal_main: f32,
    pub adv_temporal_aux: f32,
    pub adv_spatial_main: f32,
    pub adv_spatial_aux: f32,
    pub d_source: f32,
    pub d_target: f32,
    pub wd_main: f32,
    pub wd_aux: f32,
    /// Generator gradient norm before clipping
    pub grad_norm: f64,
}

impl StepLosses {
    /// Named values in report order
    pub fn entries(&self) -> [(&'static str, f32); 12] {
        [
            ("loss_seg_main", self.seg_main),
            ("loss_seg_aux", self.seg_aux),
            ("loss_tcr_main", self.tcr_main),
            ("loss_tcr_aux", self.tcr_aux),
            ("loss_adv_t_main", self.adv_temporal_main),
            ("loss_adv_t_aux", self.adv_temporal_aux),
            ("loss_adv_s_main", self.adv_spatial_main),
            ("loss_adv_s_aux", self.adv_spatial_aux),
            ("loss_d_src", self.d_source),
            ("loss_d_trg", self.d_target),
            ("loss_wd_main", self.wd_main),
            ("loss_wd_aux", self.wd_aux),
        ]
    }
}

impl fmt::Display for StepLosses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{name} = {value:.3}")?;
        }
        Ok(())
    }
}

/// Result of one iteration
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub losses: StepLosses,
    /// Snapshot written at the end of the iteration
    pub checkpoint: Option<PathBuf>,
    /// The early-stop bound was reached
    pub stop: bool,
}

/// Outcome of a training run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub iterations: usize,
    pub checkpoints: Vec<PathBuf>,
    pub last: Option<StepLosses>,
}

/// A training loop over two datasets
pub trait TrainingStrategy {
    fn run(
        &mut self,
        source: &mut SampleLoader<Box<dyn SequenceDataset>>,
        target: &mut SampleLoader<Box<dyn SequenceDataset>>,
    ) -> TrainResult<RunSummary>;
}

struct DiscriminatorSlot {
    id: DiscriminatorId,
    buffer: GradientBuffer,
    optimizer: Adam,
}

fn scalar(t: &Tensor) -> TrainResult<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// `Σ wᵢ·tᵢ` over scalar tensors
fn weighted_sum(terms: &[(f64, &Tensor)], device: &Device) -> TrainResult<Tensor> {
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for (weight, term) in terms {
        total = (total + term.affine(*weight, 0.0)?)?;
    }
    Ok(total)
}

/// Runs the alternating generator/discriminator updates
pub struct TrainingOrchestrator {
    config: Config,
    device: Device,
    model: TemporalFusionModel,
    aligner: DomainAligner,
    consistency: ConsistencyRegularizer,
    generator: GradientBuffer,
    generator_opt: SgdMomentum,
    discriminators: Vec<DiscriminatorSlot>,
    generator_schedule: PolySchedule,
    discriminator_schedule: PolySchedule,
    snapshot_dir: PathBuf,
    phase: Phase,
    history: Vec<Phase>,
}

impl TrainingOrchestrator {
    pub fn new(config: &Config, device: &Device) -> TrainResult<Self> {
        let train = &config.train;
        let mut model = TemporalFusionModel::new(&config.model, config.num_classes, device)?;
        if !train.restore_from.as_os_str().is_empty() {
            info!("Restoring weights from {}", train.restore_from.display());
            model.load(&train.restore_from)?;
        }
        let aligner = DomainAligner::new(
            config.num_classes,
            train.discriminator_ndf,
            model.multi_level(),
            device,
        )?;
        let generator = GradientBuffer::from_named("generator", model.named_parameters()?, |name| {
            ParamGroup::of(name).lr_multiplier()
        });
        let mut discriminators = Vec::new();
        for (id, d) in aligner.discriminators() {
            let buffer = GradientBuffer::from_named(id.name(), d.named_parameters()?, |_| 1.0);
            let optimizer = Adam::new(&buffer, train.learning_rate_d, 0.9, 0.99)?;
            discriminators.push(DiscriminatorSlot {
                id: *id,
                buffer,
                optimizer,
            });
        }
        info!(
            "Training {} with {} generator tensors and {} discriminators",
            config.exp_name,
            generator.len(),
            discriminators.len()
        );
        Ok(Self {
            device: device.clone(),
            model,
            aligner,
            consistency: ConsistencyRegularizer::default(),
            generator,
            generator_opt: SgdMomentum::new(train.learning_rate, train.momentum, train.weight_decay),
            discriminators,
            generator_schedule: PolySchedule::new(train.learning_rate, train.max_iters, train.power),
            discriminator_schedule: PolySchedule::new(train.learning_rate_d, train.max_iters, train.power),
            snapshot_dir: config.snapshot_dir(),
            phase: Phase::Idle,
            history: Vec::new(),
            config: config.clone(),
        })
    }

    pub fn model(&self) -> &TemporalFusionModel {
        &self.model
    }

    pub fn aligner(&self) -> &DomainAligner {
        &self.aligner
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phases entered during the most recent iteration
    pub fn last_phases(&self) -> &[Phase] {
        &self.history
    }

    pub fn generator_learning_rate(&self) -> f64 {
        self.generator_opt.learning_rate()
    }

    fn enter(&mut self, phase: Phase) -> TrainResult<()> {
        let expected = self.phase.next();
        if phase != expected {
            return Err(TrainError::Phase(format!(
                "{phase:?} entered after {:?}, expected {expected:?}",
                self.phase
            )));
        }
        trace!("phase {:?}", phase);
        self.phase = phase;
        self.history.push(phase);
        Ok(())
    }

    fn set_discriminators_frozen(&mut self, frozen: bool) {
        for slot in &mut self.discriminators {
            if frozen {
                slot.buffer.freeze();
            } else {
                slot.buffer.unfreeze();
            }
        }
    }

    /// Back-propagate `loss` into every unfrozen buffer
    fn backward(&mut self, loss: &Tensor) -> TrainResult<()> {
        let grads = loss.backward()?;
        self.generator.accumulate(&grads)?;
        for slot in &mut self.discriminators {
            slot.buffer.accumulate(&grads)?;
        }
        Ok(())
    }

    fn zero(&self) -> TrainResult<Tensor> {
        Ok(Tensor::zeros((), DType::F32, &self.device)?)
    }

    fn forward(&self, sample: &FrameSample) -> TrainResult<ModelOutput> {
        let current = image_to_tensor(&sample.current, &self.device)?;
        let key = image_to_tensor(&sample.key, &self.device)?;
        self.model.forward(&current, &key, &sample.flow)
    }

    /// Supervised loss on a labelled source sample
    fn segmentation_loss(&self, output: &ModelOutput, sample: &FrameSample) -> TrainResult<(Tensor, Tensor)> {
        let label = sample.label.as_ref().ok_or_else(|| {
            DataError::InvalidData(format!("source sample {} has no label", sample.name))
        })?;
        let labels = labels_to_tensor(label, &self.device)?;
        let ignore = self.config.train.ignore_label;
        let main = resize_bilinear(&output.fused.main, label.height, label.width)?;
        let main = cross_entropy_2d(&main, &labels, ignore)?;
        let aux = match &output.fused.aux {
            Some(aux) => {
                let aux = resize_bilinear(aux, label.height, label.width)?;
                cross_entropy_2d(&aux, &labels, ignore)?
            }
            None => self.zero()?,
        };
        Ok((main, aux))
    }

    /// One full iteration on a source and a target sample
    #[tracing::instrument(skip_all, fields(iteration = iteration))]
    pub fn step(&mut self, iteration: usize, source: &FrameSample, target: &FrameSample) -> TrainResult<StepOutcome> {
        let train = self.config.train.clone();
        let mut losses = StepLosses::default();
        self.history.clear();
        if self.phase != Phase::Idle {
            return Err(TrainError::Phase(format!("iteration started in {:?}", self.phase)));
        }

        // Fresh gradients and scheduled learning rates
        self.generator.zero_grad();
        self.generator_opt.set_learning_rate(self.generator_schedule.at(iteration));
        let lr_d = self.discriminator_schedule.at(iteration);
        for slot in &mut self.discriminators {
            slot.buffer.zero_grad();
            slot.optimizer.set_learning_rate(lr_d);
        }

        self.enter(Phase::DiscriminatorFreeze)?;
        self.set_discriminators_frozen(true);

        self.enter(Phase::SegmentationStep)?;
        let source_out = self.forward(source)?;
        let (seg_main, seg_aux) = self.segmentation_loss(&source_out, source)?;
        let loss = weighted_sum(
            &[(train.lambda_seg_main, &seg_main), (train.lambda_seg_aux, &seg_aux)],
            &self.device,
        )?;
        self.backward(&loss)?;
        losses.seg_main = scalar(&seg_main)?;
        losses.seg_aux = scalar(&seg_aux)?;

        self.enter(Phase::AdversarialStep)?;
        let target_out = self.forward(target)?;
        let tcr = self
            .consistency
            .compute(&target_out.current, &target_out.key, &target.flow)?;
        let source_pairs =
            AlignmentPairs::from_output(&source_out, (source.current.height, source.current.width))?;
        let target_pairs =
            AlignmentPairs::from_output(&target_out, (target.current.height, target.current.width))?;
        let adv = self.aligner.adversarial_losses(&target_pairs)?;
        let f = train.adv_aux_factor();
        let (u, sa) = (train.lambda_u, train.lambda_u * train.lambda_sa);
        let loss = weighted_sum(
            &[
                (u, &tcr.main),
                (u, &tcr.aux),
                (u, &adv.temporal_main),
                (u * f, &adv.temporal_aux),
                (sa, &adv.spatial_main),
                (sa * f, &adv.spatial_aux),
            ],
            &self.device,
        )?;
        self.backward(&loss)?;
        losses.tcr_main = scalar(&tcr.main)?;
        losses.tcr_aux = scalar(&tcr.aux)?;
        losses.adv_temporal_main = scalar(&adv.temporal_main)?;
        losses.adv_temporal_aux = scalar(&adv.temporal_aux)?;
        losses.adv_spatial_main = scalar(&adv.spatial_main)?;
        losses.adv_spatial_aux = scalar(&adv.spatial_aux)?;

        self.enter(Phase::DiscriminatorUnfreeze)?;
        self.set_discriminators_frozen(false);

        self.enter(Phase::DiscriminatorStep)?;
        let terms = self
            .aligner
            .discriminator_losses(&source_pairs.detach(), &target_pairs.detach())?;
        for term in &terms {
            self.backward(&term.loss)?;
            let value = scalar(&term.loss)?;
            match term.domain {
                DomainLabel::Source => losses.d_source += value,
                DomainLabel::Target => losses.d_target += value,
            }
        }

        self.enter(Phase::OrthogonalityStep)?;
        let wd = self.aligner.orthogonality()?;
        let weight = train.lambda_u * train.lambda_wd;
        let loss = weighted_sum(&[(weight, &wd.main), (weight, &wd.aux)], &self.device)?;
        self.backward(&loss)?;
        losses.wd_main = scalar(&wd.main)?;
        losses.wd_aux = scalar(&wd.aux)?;

        self.enter(Phase::OptimizerApply)?;
        losses.grad_norm = self.generator.clip_global_norm(train.max_grad_norm)?;
        for slot in &mut self.discriminators {
            let norm = slot.buffer.clip_global_norm(train.max_grad_norm)?;
            trace!("{} grad norm {:.4}", slot.id.name(), norm);
        }
        self.generator_opt.step(&self.generator)?;
        for slot in &mut self.discriminators {
            slot.optimizer.step(&slot.buffer)?;
        }

        self.enter(Phase::CheckpointOrContinue)?;
        let mut checkpoint = None;
        let mut stop = false;
        if is_snapshot_iteration(iteration, train.save_pred_every) {
            checkpoint = Some(save_checkpoint(&self.model, &self.snapshot_dir, iteration)?);
            stop = iteration + 1 >= train.early_stop;
        }
        self.enter(Phase::Idle)?;
        Ok(StepOutcome {
            losses,
            checkpoint,
            stop,
        })
    }

    /// Train until the early-stop bound
    pub fn run<S: SequenceDataset, T: SequenceDataset>(
        &mut self,
        source: &mut SampleLoader<S>,
        target: &mut SampleLoader<T>,
    ) -> TrainResult<RunSummary> {
        let early_stop = self.config.train.early_stop;
        info!(
            "Starting training for up to {} iterations, snapshots in {}",
            early_stop,
            self.snapshot_dir.display()
        );
        let mut summary = RunSummary::default();
        for iteration in 0..=early_stop {
            let source_sample = source.next_sample()?;
            let target_sample = target.next_sample()?;
            let outcome = self.step(iteration, &source_sample, &target_sample)?;
            info!("iter = {:>8}/{:>8} {}", iteration, early_stop, outcome.losses);
            summary.iterations = iteration + 1;
            summary.last = Some(outcome.losses);
            summary.checkpoints.extend(outcome.checkpoint);
            if outcome.stop {
                break;
            }
        }
        info!("Training finished after {} iterations", summary.iterations);
        Ok(summary)
    }
}

impl TrainingStrategy for TrainingOrchestrator {
    fn run(
        &mut self,
        source: &mut SampleLoader<Box<dyn SequenceDataset>>,
        target: &mut SampleLoader<Box<dyn SequenceDataset>>,
    ) -> TrainResult<RunSummary> {
        TrainingOrchestrator::run(self, source, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_cycle_in_order() {
        let mut phase = Phase::Idle;
        let mut seen = Vec::new();
        for _ in 0..9 {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(seen.last(), Some(&Phase::Idle));
        let freeze = seen.iter().position(|p| *p == Phase::DiscriminatorFreeze).unwrap();
        let adversarial = seen.iter().position(|p| *p == Phase::AdversarialStep).unwrap();
        let unfreeze = seen.iter().position(|p| *p == Phase::DiscriminatorUnfreeze).unwrap();
        let disc = seen.iter().position(|p| *p == Phase::DiscriminatorStep).unwrap();
        assert!(freeze < adversarial && adversarial < unfreeze && unfreeze < disc);
    }

    #[test]
    fn test_loss_line_format() {
        let losses = StepLosses {
            seg_main: 1.23456,
            ..Default::default()
        };
        let line = losses.to_string();
        assert!(line.starts_with("loss_seg_main = 1.235 loss_seg_aux = 0.000"));
        assert!(line.ends_with("loss_wd_aux = 0.000"));
    }

    #[test]
    fn test_weighted_sum() {
        let device = Device::Cpu;
        let a = Tensor::new(2.0f32, &device).unwrap();
        let b = Tensor::new(3.0f32, &device).unwrap();
        let total = weighted_sum(&[(0.5, &a), (2.0, &b)], &device).unwrap();
        assert_eq!(total.to_scalar::<f32>().unwrap(), 7.0);
    }
}
