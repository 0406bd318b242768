//! Cross-domain adversarial alignment with two discriminator families
//!
//! The temporal family sees `[current | key]` prediction pairs, the spatial
//! family sees `[current | current]`. Each family has a main and, with
//! multi-level supervision, an aux discriminator. An orthogonality term
//! keeps the two families from learning the same decision function.

use super::discriminator::Discriminator;
use crate::error::{TrainError, TrainResult};
use crate::model::ModelOutput;
use crate::tensor::{class_softmax, resize_bilinear};
use crate::train::losses::bce_with_logits;
use candle_core::{DType, Device, Tensor};
use tracing::trace;

/// Which prediction pair a discriminator classifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Current-frame and key-frame predictions
    Temporal,
    /// Current-frame prediction paired with itself
    Spatial,
}

/// Resolution level of the prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Main,
    Aux,
}

/// Identifies one of the (up to) four discriminators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscriminatorId {
    pub axis: Axis,
    pub level: Level,
}

impl DiscriminatorId {
    pub const fn new(axis: Axis, level: Level) -> Self {
        Self { axis, level }
    }

    pub fn name(&self) -> &'static str {
        match (self.axis, self.level) {
            (Axis::Temporal, Level::Main) => "d_temporal_main",
            (Axis::Temporal, Level::Aux) => "d_temporal_aux",
            (Axis::Spatial, Level::Main) => "d_spatial_main",
            (Axis::Spatial, Level::Aux) => "d_spatial_aux",
        }
    }
}

/// Domain label used as the BCE target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainLabel {
    Source,
    Target,
}

impl DomainLabel {
    pub fn value(&self) -> f32 {
        match self {
            DomainLabel::Source => 0.0,
            DomainLabel::Target => 1.0,
        }
    }
}

/// Discriminator inputs of one domain: concatenated class scores upsampled
/// to the frame resolution, before softmax
#[derive(Debug, Clone)]
pub struct AlignmentPairs {
    pairs: Vec<(DiscriminatorId, Tensor)>,
}

impl AlignmentPairs {
    /// Build temporal and spatial pairs from a forward pass. `size` is the
    /// frame's `(height, width)`.
    pub fn from_output(output: &ModelOutput, size: (usize, usize)) -> TrainResult<Self> {
        let (h, w) = size;
        let mut pairs = Vec::with_capacity(4);
        let mut push = |level: Level, current: &Tensor, key: &Tensor| -> TrainResult<()> {
            let current = resize_bilinear(current, h, w)?;
            let key = resize_bilinear(key, h, w)?;
            let temporal = Tensor::cat(&[&current, &key], 1)?;
            let spatial = Tensor::cat(&[&current, &current], 1)?;
            pairs.push((DiscriminatorId::new(Axis::Temporal, level), temporal));
            pairs.push((DiscriminatorId::new(Axis::Spatial, level), spatial));
            Ok(())
        };
        push(Level::Main, &output.current.main, &output.key.main)?;
        if let (Some(current), Some(key)) = (&output.current.aux, &output.key.aux) {
            push(Level::Aux, current, key)?;
        }
        Ok(Self { pairs })
    }

    pub fn get(&self, id: DiscriminatorId) -> Option<&Tensor> {
        self.pairs.iter().find(|(i, _)| *i == id).map(|(_, t)| t)
    }

    /// Same pairs, cut from the graph
    pub fn detach(&self) -> Self {
        Self {
            pairs: self.pairs.iter().map(|(id, t)| (*id, t.detach())).collect(),
        }
    }
}

/// Generator-side adversarial losses (target inputs labelled as source)
#[derive(Debug, Clone)]
pub struct AdversarialLosses {
    pub temporal_main: Tensor,
    pub temporal_aux: Tensor,
    pub spatial_main: Tensor,
    pub spatial_aux: Tensor,
}

/// One discriminator sub-step: the loss and the label it was trained toward
#[derive(Debug, Clone)]
pub struct DiscriminatorTerm {
    pub id: DiscriminatorId,
    pub domain: DomainLabel,
    /// BCE target value this term was computed against
    pub target: f32,
    /// Already halved
    pub loss: Tensor,
}

/// Orthogonality penalties of the main and aux discriminator pairs
#[derive(Debug, Clone)]
pub struct OrthogonalityLosses {
    pub main: Tensor,
    pub aux: Tensor,
}

/// Everything one alignment step produces
#[derive(Debug, Clone)]
pub struct AlignmentStep {
    pub adversarial: AdversarialLosses,
    pub discriminator: Vec<DiscriminatorTerm>,
    pub orthogonality: OrthogonalityLosses,
}

/// Mean over corresponding parameter tensors of `cos(flat(a), flat(b)) + 1`.
///
/// Parameters are matched by sorted name.
pub fn orthogonality_loss(a: &Discriminator, b: &Discriminator) -> TrainResult<Tensor> {
    let pa = a.named_parameters()?;
    let pb = b.named_parameters()?;
    if pa.len() != pb.len() || pa.is_empty() {
        return Err(TrainError::Shape(format!(
            "cannot pair {} and {} discriminator parameters",
            pa.len(),
            pb.len()
        )));
    }
    let mut terms = Vec::with_capacity(pa.len());
    for ((na, va), (nb, vb)) in pa.iter().zip(&pb) {
        if na != nb || va.dims() != vb.dims() {
            return Err(TrainError::Shape(format!("parameter {na} does not match {nb}")));
        }
        let x = va.as_tensor().flatten_all()?;
        let y = vb.as_tensor().flatten_all()?;
        terms.push(cosine_similarity(&x, &y)?.affine(1.0, 1.0)?);
    }
    let count = terms.len() as f64;
    Ok(Tensor::stack(&terms, 0)?.sum_all()?.affine(1.0 / count, 0.0)?)
}

/// Cosine similarity of two vectors, with norms clamped below by 1e-8
fn cosine_similarity(x: &Tensor, y: &Tensor) -> TrainResult<Tensor> {
    let dot = (x * y)?.sum_all()?;
    let nx = x.sqr()?.sum_all()?.sqrt()?.maximum(1e-8f32)?;
    let ny = y.sqr()?.sum_all()?.sqrt()?.maximum(1e-8f32)?;
    Ok((dot / (nx * ny)?)?)
}

/// The four discriminators and the losses computed with them
pub struct DomainAligner {
    discriminators: Vec<(DiscriminatorId, Discriminator)>,
}

impl DomainAligner {
    /// Discriminators for `num_classes`-channel predictions; aux ones only
    /// when `multi_level`
    pub fn new(num_classes: usize, ndf: usize, multi_level: bool, device: &Device) -> TrainResult<Self> {
        let mut levels = vec![Level::Main];
        if multi_level {
            levels.push(Level::Aux);
        }
        let mut discriminators = Vec::new();
        for level in levels {
            for axis in [Axis::Temporal, Axis::Spatial] {
                let id = DiscriminatorId::new(axis, level);
                discriminators.push((id, Discriminator::new(2 * num_classes, ndf, device)?));
            }
        }
        Ok(Self { discriminators })
    }

    pub fn ids(&self) -> impl Iterator<Item = DiscriminatorId> + '_ {
        self.discriminators.iter().map(|(id, _)| *id)
    }

    pub fn discriminators(&self) -> &[(DiscriminatorId, Discriminator)] {
        &self.discriminators
    }

    pub fn get(&self, id: DiscriminatorId) -> Option<&Discriminator> {
        self.discriminators.iter().find(|(i, _)| *i == id).map(|(_, d)| d)
    }

    fn classify(&self, id: DiscriminatorId, pair: &Tensor) -> TrainResult<Tensor> {
        let d = self.get(id).ok_or_else(|| TrainError::Shape(format!("no discriminator {}", id.name())))?;
        d.forward(&class_softmax(pair)?)
    }

    fn zero(device: &Device) -> TrainResult<Tensor> {
        Ok(Tensor::zeros((), DType::F32, device)?)
    }

    /// Adversarial losses on target pairs: BCE against the source label
    #[tracing::instrument(skip_all)]
    pub fn adversarial_losses(&self, target: &AlignmentPairs) -> TrainResult<AdversarialLosses> {
        let label = DomainLabel::Source.value();
        let mut out = [None, None, None, None];
        for (slot, (axis, level)) in [
            (Axis::Temporal, Level::Main),
            (Axis::Temporal, Level::Aux),
            (Axis::Spatial, Level::Main),
            (Axis::Spatial, Level::Aux),
        ]
        .into_iter()
        .enumerate()
        {
            let id = DiscriminatorId::new(axis, level);
            if let (Some(pair), Some(_)) = (target.get(id), self.get(id)) {
                out[slot] = Some(bce_with_logits(&self.classify(id, pair)?, label)?);
            }
        }
        let [temporal_main, temporal_aux, spatial_main, spatial_aux] = out;
        let device = match target.pairs.first() {
            Some((_, t)) => t.device().clone(),
            None => Device::Cpu,
        };
        let or_zero = |t: Option<Tensor>| t.map_or_else(|| Self::zero(&device), Ok);
        Ok(AdversarialLosses {
            temporal_main: or_zero(temporal_main)?,
            temporal_aux: or_zero(temporal_aux)?,
            spatial_main: or_zero(spatial_main)?,
            spatial_aux: or_zero(spatial_aux)?,
        })
    }

    /// Discriminator sub-steps on detached pairs of both domains, each
    /// trained toward its true domain label and halved
    #[tracing::instrument(skip_all)]
    pub fn discriminator_losses(
        &self,
        source: &AlignmentPairs,
        target: &AlignmentPairs,
    ) -> TrainResult<Vec<DiscriminatorTerm>> {
        let mut terms = Vec::with_capacity(2 * self.discriminators.len());
        for id in self.ids() {
            for (domain, pairs) in [(DomainLabel::Source, source), (DomainLabel::Target, target)] {
                let Some(pair) = pairs.get(id) else {
                    continue;
                };
                let target_value = domain.value();
                let logits = self.classify(id, &pair.detach())?;
                let loss = bce_with_logits(&logits, target_value)?.affine(0.5, 0.0)?;
                trace!("{} {:?} term", id.name(), domain);
                terms.push(DiscriminatorTerm {
                    id,
                    domain,
                    target: target_value,
                    loss,
                });
            }
        }
        Ok(terms)
    }

    /// Orthogonality between the temporal and spatial discriminators of
    /// each level; zero for a missing level
    pub fn orthogonality(&self) -> TrainResult<OrthogonalityLosses> {
        let mut losses = [None, None];
        for (slot, level) in [Level::Main, Level::Aux].into_iter().enumerate() {
            let temporal = self.get(DiscriminatorId::new(Axis::Temporal, level));
            let spatial = self.get(DiscriminatorId::new(Axis::Spatial, level));
            if let (Some(t), Some(s)) = (temporal, spatial) {
                losses[slot] = Some(orthogonality_loss(t, s)?);
            }
        }
        let [main, aux] = losses;
        let main = main.ok_or_else(|| TrainError::Shape("main discriminators are missing".to_string()))?;
        let aux = match aux {
            Some(aux) => aux,
            None => Self::zero(main.device())?,
        };
        Ok(OrthogonalityLosses { main, aux })
    }

    /// Adversarial, discriminator and orthogonality losses of one iteration
    pub fn step(&self, source: &AlignmentPairs, target: &AlignmentPairs) -> TrainResult<AlignmentStep> {
        Ok(AlignmentStep {
            adversarial: self.adversarial_losses(target)?,
            discriminator: self.discriminator_losses(source, target)?,
            orthogonality: self.orthogonality()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Predictions;
    use candle_nn::VarMap;

    fn output(classes: usize, aux: bool, seed: f32) -> ModelOutput {
        let device = Device::Cpu;
        let map = || Tensor::randn(seed, 1.0, (1, classes, 4, 8), &device).unwrap();
        let preds = || Predictions {
            main: map(),
            aux: aux.then(map),
        };
        ModelOutput {
            fused: preds(),
            current: preds(),
            key: preds(),
        }
    }

    fn copy_weights(from: &VarMap, to: &VarMap) {
        let src = from.data().lock().unwrap();
        for (name, var) in to.data().lock().unwrap().iter() {
            var.set(&src[name].as_tensor().copy().unwrap()).unwrap();
        }
    }

    #[test]
    fn test_identical_discriminators_give_two() {
        let device = Device::Cpu;
        let a = Discriminator::new(4, 2, &device).unwrap();
        let b = Discriminator::new(4, 2, &device).unwrap();
        copy_weights(a.var_map(), b.var_map());
        let loss = orthogonality_loss(&a, &b).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 2.0).abs() < 1e-5, "{loss}");
    }

    #[test]
    fn test_orthogonality_of_independent_weights_is_below_two() {
        let device = Device::Cpu;
        let a = Discriminator::new(4, 2, &device).unwrap();
        let b = Discriminator::new(4, 2, &device).unwrap();
        let loss = orthogonality_loss(&a, &b).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss < 2.0 && loss >= 0.0);
    }

    #[test]
    fn test_pairs_cover_both_axes() {
        let pairs = AlignmentPairs::from_output(&output(3, true, 0.0), (32, 32)).unwrap();
        let temporal = pairs.get(DiscriminatorId::new(Axis::Temporal, Level::Main)).unwrap();
        assert_eq!(temporal.dims4().unwrap(), (1, 6, 32, 32));
        let spatial = pairs.get(DiscriminatorId::new(Axis::Spatial, Level::Aux)).unwrap();
        // Spatial pairs repeat the current prediction
        let halves = spatial.chunk(2, 1).unwrap();
        let diff = (&halves[0] - &halves[1]).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_discriminator_terms_use_domain_labels() {
        let device = Device::Cpu;
        let aligner = DomainAligner::new(3, 2, true, &device).unwrap();
        let source = AlignmentPairs::from_output(&output(3, true, 0.0), (32, 32)).unwrap();
        let target = AlignmentPairs::from_output(&output(3, true, 1.0), (32, 32)).unwrap();
        let terms = aligner.discriminator_losses(&source, &target).unwrap();
        assert_eq!(terms.len(), 8);
        for term in &terms {
            match term.domain {
                DomainLabel::Source => assert_eq!(term.target, 0.0),
                DomainLabel::Target => assert_eq!(term.target, 1.0),
            }
        }
        let ids: std::collections::HashSet<_> = terms.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_discriminator_terms_do_not_reach_predictions() {
        let device = Device::Cpu;
        let aligner = DomainAligner::new(2, 2, false, &device).unwrap();
        let current = candle_core::Var::randn(0f32, 1.0, (1, 2, 4, 4), &device).unwrap();
        let preds = Predictions {
            main: current.as_tensor().clone(),
            aux: None,
        };
        let out = ModelOutput {
            fused: preds.clone(),
            current: preds.clone(),
            key: preds,
        };
        let pairs = AlignmentPairs::from_output(&out, (32, 32)).unwrap();
        let terms = aligner.discriminator_losses(&pairs, &pairs).unwrap();
        let grads = terms[0].loss.backward().unwrap();
        assert!(grads.get(current.as_tensor()).is_none());

        // The adversarial term does reach them
        let adv = aligner.adversarial_losses(&pairs).unwrap();
        let grads = adv.temporal_main.backward().unwrap();
        assert!(grads.get(current.as_tensor()).is_some());
    }

    #[test]
    fn test_single_level_aux_terms_are_zero() {
        let device = Device::Cpu;
        let aligner = DomainAligner::new(3, 2, false, &device).unwrap();
        assert_eq!(aligner.ids().count(), 2);
        let target = AlignmentPairs::from_output(&output(3, false, 0.0), (32, 32)).unwrap();
        let step = aligner.step(&target, &target).unwrap();
        assert_eq!(step.adversarial.temporal_aux.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(step.orthogonality.aux.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(step.discriminator.len(), 4);
    }
}
