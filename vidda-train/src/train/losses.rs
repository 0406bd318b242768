//! Loss functions

use crate::error::TrainResult;
use candle_core::{DType, Tensor};

/// Pixel-wise cross-entropy of `[N, C, H, W]` logits against `[N, H, W]`
/// `u32` labels, averaged over pixels whose label is a valid class and not
/// `ignore_label`. Zero when no pixel is valid.
pub fn cross_entropy_2d(logits: &Tensor, labels: &Tensor, ignore_label: u32) -> TrainResult<Tensor> {
    let (n, c, h, w) = logits.dims4()?;
    let log_probs = candle_nn::ops::log_softmax(logits, 1)?
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((n * h * w, c))?;
    let labels = labels.to_dtype(DType::U32)?.flatten_all()?;
    let valid = (labels.lt(c as u32)? * labels.ne(ignore_label)?)?;
    let count = valid.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(Tensor::zeros((), DType::F32, logits.device())?);
    }
    let safe = valid.where_cond(&labels, &labels.zeros_like()?)?;
    let picked = log_probs.gather(&safe.unsqueeze(1)?, 1)?.squeeze(1)?;
    let picked = (picked * valid.to_dtype(DType::F32)?)?;
    Ok(picked.sum_all()?.affine(-1.0 / count as f64, 0.0)?)
}

/// Binary cross-entropy of logits against a constant label, averaged.
///
/// Uses `max(x, 0) - x·t + ln(1 + e^-|x|)`.
pub fn bce_with_logits(logits: &Tensor, label: f32) -> TrainResult<Tensor> {
    let positive = logits.relu()?;
    let target_term = logits.affine(label as f64, 0.0)?;
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(((positive - target_term)? + softplus)?.mean_all()?)
}

/// `mean(weight · |input − target|)`; `weight` broadcasts over classes
pub fn weighted_l1(input: &Tensor, target: &Tensor, weight: &Tensor) -> TrainResult<Tensor> {
    let diff = (input - target)?.abs()?;
    Ok(diff.broadcast_mul(weight)?.mean_all()?)
}
