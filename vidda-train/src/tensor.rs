//! Conversions between vidda-data buffers and candle tensors, plus the
//! small set of map operations shared by the model, losses and alignment.

use crate::error::{TrainError, TrainResult};
use candle_core::{DType, Device, Tensor};
use vidda_data::{ImageTensor, LabelImage};

/// Floor added inside the logarithm of the entropy
pub const ENTROPY_EPS: f64 = 1e-30;

/// `[1, C, H, W]` tensor from a planar image
pub fn image_to_tensor(image: &ImageTensor, device: &Device) -> TrainResult<Tensor> {
    Ok(Tensor::from_vec(
        image.data.clone(),
        (1, image.channels, image.height, image.width),
        device,
    )?)
}

/// `[1, H, W]` `u32` tensor from a label image
pub fn labels_to_tensor(labels: &LabelImage, device: &Device) -> TrainResult<Tensor> {
    Ok(Tensor::from_vec(
        labels.data.clone(),
        (1, labels.height, labels.width),
        device,
    )?)
}

/// Copy a tensor to host memory as a flat `f32` buffer
pub fn to_host(t: &Tensor) -> TrainResult<Vec<f32>> {
    Ok(t.to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?)
}

/// Align-corners bilinear weights as a row-major `[output, input]` matrix
pub fn interpolation_matrix(input: usize, output: usize) -> Vec<f32> {
    let mut m = vec![0.0f32; output * input];
    if input == 0 {
        return m;
    }
    let scale = if output > 1 {
        (input - 1) as f32 / (output - 1) as f32
    } else {
        0.0
    };
    for o in 0..output {
        let pos = o as f32 * scale;
        let i0 = (pos.floor() as usize).min(input - 1);
        let i1 = (i0 + 1).min(input - 1);
        let t = pos - i0 as f32;
        m[o * input + i0] += 1.0 - t;
        m[o * input + i1] += t;
    }
    m
}

/// Bilinear (align-corners) resize of a `[N, C, H, W]` map.
///
/// Expressed as two matrix products so gradients flow through it.
pub fn resize_bilinear(x: &Tensor, height: usize, width: usize) -> TrainResult<Tensor> {
    let (n, c, h, w) = x.dims4()?;
    if (h, w) == (height, width) {
        return Ok(x.clone());
    }
    let device = x.device();
    // [N, C, H, W] x [W, width] -> [N, C, H, width]
    let cols = Tensor::from_vec(interpolation_matrix(w, width), (width, w), device)?
        .to_dtype(x.dtype())?
        .t()?
        .broadcast_as((n, c, w, width))?
        .contiguous()?;
    let x = x.contiguous()?.matmul(&cols)?;
    // [H', H] x [N, C, H, width] -> [N, C, H', width]
    let rows = Tensor::from_vec(interpolation_matrix(h, height), (height, h), device)?
        .to_dtype(x.dtype())?
        .broadcast_as((n, c, height, h))?
        .contiguous()?;
    Ok(rows.matmul(&x)?)
}

/// Softmax over the class axis
pub fn class_softmax(x: &Tensor) -> TrainResult<Tensor> {
    Ok(candle_nn::ops::softmax(x, 1)?)
}

/// Per-pixel entropy `-Σ p ln(p + ε)` of a `[N, C, H, W]` probability map,
/// returned as `[N, 1, H, W]`
pub fn entropy(probs: &Tensor) -> TrainResult<Tensor> {
    let logp = probs.affine(1.0, ENTROPY_EPS)?.log()?;
    Ok((probs * logp)?.sum_keepdim(1)?.neg()?)
}

/// Per-pixel argmax over classes as a flat `u32` buffer
pub fn argmax_classes(logits: &Tensor) -> TrainResult<Vec<u32>> {
    let (n, _, _, _) = logits.dims4()?;
    if n != 1 {
        return Err(TrainError::Shape(format!(
            "argmax expects a single map, got batch of {n}"
        )));
    }
    Ok(logits
        .argmax(1)?
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<u32>()?)
}
