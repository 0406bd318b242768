//! Entropy-gated temporal consistency on target predictions
//!
//! The key frame's prediction is propagated into the current frame's grid.
//! Where the propagated prediction is valid and more confident (lower
//! entropy) than the live one, the live probabilities are pulled toward it
//! with a weighted L1 loss.

use crate::error::TrainResult;
use crate::model::Predictions;
use crate::tensor::{class_softmax, entropy};
use crate::train::losses::weighted_l1;
use crate::warp::{FeatureWarper, WarpDirection};
use candle_core::{DType, Tensor};
use vidda_data::FlowField;

/// `validity AND (reconstructed_entropy < live_entropy)` as a float mask
pub fn trust_mask(
    validity: &Tensor,
    reconstructed_entropy: &Tensor,
    live_entropy: &Tensor,
) -> TrainResult<Tensor> {
    let more_confident = reconstructed_entropy.lt(live_entropy)?.to_dtype(DType::F32)?;
    let valid = validity.to_dtype(DType::F32)?.ne(0f32)?.to_dtype(DType::F32)?;
    Ok((more_confident * valid)?)
}

/// Loss and mask of one resolution level
#[derive(Debug, Clone)]
pub struct LevelConsistency {
    pub loss: Tensor,
    pub trust: Tensor,
    pub reconstructed: Tensor,
}

/// Main and aux consistency losses; aux is zero when single-level
#[derive(Debug, Clone)]
pub struct ConsistencyLosses {
    pub main: Tensor,
    pub aux: Tensor,
}

/// Computes the intra-domain consistency loss for target frames
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyRegularizer {
    warper: FeatureWarper,
}

impl Default for ConsistencyRegularizer {
    fn default() -> Self {
        Self::new(WarpDirection::Backward)
    }
}

impl ConsistencyRegularizer {
    pub fn new(direction: WarpDirection) -> Self {
        Self {
            warper: FeatureWarper::new(direction),
        }
    }

    /// One level: `live` carries gradients, `key` is treated as a constant
    pub fn level(&self, live: &Tensor, key: &Tensor, flow: &FlowField) -> TrainResult<LevelConsistency> {
        let (_, _, h, w) = live.dims4()?;
        let live_probs = class_softmax(live)?;
        let live_entropy = entropy(&live_probs.detach())?;
        let key_probs = class_softmax(&key.detach())?;
        let key_entropy = entropy(&key_probs)?;

        let plan = self.warper.plan(flow, w, h);
        let reconstructed = plan.warp_tensor(&key_probs)?;
        let reconstructed_entropy = plan.warp_tensor(&key_entropy)?;
        let validity = plan.validity_tensor(&key_entropy)?;

        let trust = trust_mask(&validity, &reconstructed_entropy, &live_entropy)?;
        let loss = weighted_l1(&live_probs, &reconstructed, &trust)?;
        Ok(LevelConsistency {
            loss,
            trust,
            reconstructed,
        })
    }

    /// Consistency between live current-frame predictions and propagated
    /// key-frame predictions, for both levels
    #[tracing::instrument(skip_all)]
    pub fn compute(
        &self,
        live: &Predictions,
        key: &Predictions,
        flow: &FlowField,
    ) -> TrainResult<ConsistencyLosses> {
        let main = self.level(&live.main, &key.main, flow)?.loss;
        let aux = match (&live.aux, &key.aux) {
            (Some(l), Some(k)) => self.level(l, k, flow)?.loss,
            _ => Tensor::zeros((), DType::F32, live.main.device())?,
        };
        Ok(ConsistencyLosses { main, aux })
    }
}
