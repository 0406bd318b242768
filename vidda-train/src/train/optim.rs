//! Gradient accumulation buffers and optimizers
//!
//! Every parameter set (the generator and each discriminator) owns one
//! [`GradientBuffer`]. Backward passes are accumulated into every buffer
//! that is not frozen; optimizers then read from the buffer. Freezing a
//! buffer is how a parameter set is kept out of a loss term.

use crate::error::TrainResult;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer as CandleOptimizer, ParamsAdamW};
use tracing::trace;

/// A trainable tensor and its learning-rate multiplier
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub var: Var,
    pub lr_multiplier: f64,
}

/// Accumulated gradients of one parameter set
pub struct GradientBuffer {
    name: String,
    params: Vec<Param>,
    grads: Vec<Option<Tensor>>,
    frozen: bool,
}

impl GradientBuffer {
    pub fn new(name: impl Into<String>, params: Vec<Param>) -> Self {
        let grads = vec![None; params.len()];
        Self {
            name: name.into(),
            params,
            grads,
            frozen: false,
        }
    }

    /// Buffer over named variables, each group scaled by `lr_multiplier(name)`
    pub fn from_named(
        name: impl Into<String>,
        vars: Vec<(String, Var)>,
        lr_multiplier: impl Fn(&str) -> f64,
    ) -> Self {
        let params = vars
            .into_iter()
            .map(|(name, var)| Param {
                lr_multiplier: lr_multiplier(&name),
                name,
                var,
            })
            .collect();
        Self::new(name, params)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn freeze(&mut self) {
        trace!("freeze {}", self.name);
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        trace!("unfreeze {}", self.name);
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn zero_grad(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = None);
    }

    /// Add the gradients of this set found in `grads`. Frozen buffers
    /// ignore them. Returns how many parameters received a gradient.
    pub fn accumulate(&mut self, grads: &GradStore) -> TrainResult<usize> {
        if self.frozen {
            return Ok(0);
        }
        let mut touched = 0;
        for (param, slot) in self.params.iter().zip(self.grads.iter_mut()) {
            let Some(g) = grads.get(param.var.as_tensor()) else {
                continue;
            };
            let g = g.detach();
            *slot = Some(match slot.take() {
                Some(prev) => (prev + g)?,
                None => g,
            });
            touched += 1;
        }
        Ok(touched)
    }

    pub fn grad(&self, index: usize) -> Option<&Tensor> {
        self.grads.get(index).and_then(Option::as_ref)
    }

    pub fn grad_by_name(&self, name: &str) -> Option<&Tensor> {
        let index = self.params.iter().position(|p| p.name == name)?;
        self.grad(index)
    }

    /// The accumulated gradients keyed by parameter, as candle optimizers
    /// expect them
    pub fn to_grad_store(&self) -> TrainResult<GradStore> {
        let device = self
            .params
            .first()
            .map(|p| p.var.device().clone())
            .unwrap_or(Device::Cpu);
        // A constant's backward pass yields a store without any parameter
        let mut store = Tensor::zeros((), DType::F32, &device)?.backward()?;
        for (param, grad) in self.params.iter().zip(&self.grads) {
            if let Some(grad) = grad {
                store.insert(param.var.as_tensor(), grad.clone());
            }
        }
        Ok(store)
    }

    /// L2 norm over all accumulated gradients
    pub fn global_norm(&self) -> TrainResult<f64> {
        let mut total = 0.0f64;
        for g in self.grads.iter().flatten() {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(total.sqrt())
    }

    /// Scale gradients so their global norm is at most `max_norm`.
    /// Returns the norm before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f64) -> TrainResult<f64> {
        let norm = self.global_norm()?;
        if norm > max_norm {
            let coef = max_norm / (norm + 1e-6);
            for slot in self.grads.iter_mut() {
                if let Some(g) = slot.take() {
                    *slot = Some(g.affine(coef, 0.0)?);
                }
            }
        }
        Ok(norm)
    }
}

/// Applies accumulated gradients to the parameters of a buffer
pub trait Optimizer {
    fn step(&mut self, buffer: &GradientBuffer) -> TrainResult<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// SGD with momentum and L2 weight decay
pub struct SgdMomentum {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: Vec<Option<Tensor>>,
}

impl SgdMomentum {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for SgdMomentum {
    fn step(&mut self, buffer: &GradientBuffer) -> TrainResult<()> {
        if self.velocity.len() != buffer.len() {
            self.velocity = vec![None; buffer.len()];
        }
        for (i, param) in buffer.params().iter().enumerate() {
            let Some(grad) = buffer.grad(i) else {
                continue;
            };
            let w = param.var.as_tensor().detach();
            let mut d = grad.clone();
            if self.weight_decay != 0.0 {
                d = (d + w.affine(self.weight_decay, 0.0)?)?;
            }
            let v = match self.velocity[i].take() {
                Some(v) => (v.affine(self.momentum, 0.0)? + d)?,
                None => d,
            };
            let lr = self.lr * param.lr_multiplier;
            param.var.set(&(w - v.affine(lr, 0.0)?)?)?;
            self.velocity[i] = Some(v);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Adam without weight decay, on top of [`candle_nn::AdamW`].
///
/// Every parameter moves at the same rate; learning-rate multipliers of the
/// buffer are not applied.
pub struct Adam {
    inner: AdamW,
}

impl Adam {
    pub fn new(buffer: &GradientBuffer, lr: f64, beta1: f64, beta2: f64) -> TrainResult<Self> {
        let vars = buffer.params().iter().map(|p| p.var.clone()).collect();
        let inner = AdamW::new(
            vars,
            ParamsAdamW {
                lr,
                beta1,
                beta2,
                eps: 1e-8,
                weight_decay: 0.0,
            },
        )?;
        Ok(Self { inner })
    }
}

impl Optimizer for Adam {
    fn step(&mut self, buffer: &GradientBuffer) -> TrainResult<()> {
        let grads = buffer.to_grad_store()?;
        CandleOptimizer::step(&mut self.inner, &grads)?;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        CandleOptimizer::learning_rate(&self.inner)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        CandleOptimizer::set_learning_rate(&mut self.inner, lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::to_host;
    use candle_core::Device;

    fn buffer_with(values: &[f32], mult: f64) -> (GradientBuffer, Var) {
        let var = Var::from_vec(values.to_vec(), values.len(), &Device::Cpu).unwrap();
        let buffer = GradientBuffer::from_named("p", vec![("w".to_string(), var.clone())], |_| mult);
        (buffer, var)
    }

    #[test]
    fn test_accumulate_adds_backward_passes() {
        let (mut buffer, var) = buffer_with(&[1.0, 2.0], 1.0);
        for _ in 0..2 {
            let grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
            assert_eq!(buffer.accumulate(&grads).unwrap(), 1);
        }
        assert_eq!(to_host(buffer.grad(0).unwrap()).unwrap(), vec![2.0, 2.0]);
        buffer.zero_grad();
        assert!(buffer.grad_by_name("w").is_none());
    }

    #[test]
    fn test_frozen_buffer_ignores_gradients() {
        let (mut buffer, var) = buffer_with(&[1.0], 1.0);
        buffer.freeze();
        let grads = var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(buffer.accumulate(&grads).unwrap(), 0);
        assert!(buffer.grad(0).is_none());
        buffer.unfreeze();
        assert_eq!(buffer.accumulate(&grads).unwrap(), 1);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let (mut buffer, var) = buffer_with(&[3.0, 4.0], 1.0);
        // d/dw of w.w / 2 is w, norm 5
        let grads = var.as_tensor().sqr().unwrap().sum_all().unwrap().affine(0.5, 0.0).unwrap().backward().unwrap();
        buffer.accumulate(&grads).unwrap();
        let before = buffer.clip_global_norm(1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-6);
        assert!((buffer.global_norm().unwrap() - 1.0).abs() < 1e-5);
        // Below the threshold nothing changes
        assert!((buffer.clip_global_norm(10.0).unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sgd_momentum_and_group_multiplier() {
        let (mut buffer, var) = buffer_with(&[1.0], 10.0);
        let mut sgd = SgdMomentum::new(0.01, 0.9, 0.0);
        for _ in 0..2 {
            buffer.zero_grad();
            let grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
            buffer.accumulate(&grads).unwrap();
            sgd.step(&buffer).unwrap();
        }
        // v1 = 1, v2 = 1.9; lr 0.1 with the multiplier
        let w = to_host(var.as_tensor()).unwrap()[0];
        assert!((w - (1.0 - 0.1 - 0.19)).abs() < 1e-6, "{w}");
    }

    #[test]
    fn test_sgd_weight_decay() {
        let (mut buffer, var) = buffer_with(&[2.0], 1.0);
        let mut sgd = SgdMomentum::new(0.5, 0.0, 0.1);
        let w = var.as_tensor();
        let grads = (w * w.zeros_like().unwrap()).unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(buffer.accumulate(&grads).unwrap(), 1);
        assert_eq!(to_host(buffer.grad(0).unwrap()).unwrap(), vec![0.0]);
        sgd.step(&buffer).unwrap();
        // Zero gradient, decay only: 2 - 0.5 * 0.2
        assert!((to_host(var.as_tensor()).unwrap()[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let (mut buffer, var) = buffer_with(&[1.0, -1.0], 1.0);
        let mut adam = Adam::new(&buffer, 1e-2, 0.9, 0.99).unwrap();
        let grads = var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        buffer.accumulate(&grads).unwrap();
        adam.step(&buffer).unwrap();
        let w = to_host(var.as_tensor()).unwrap();
        assert!((w[0] - 0.99).abs() < 1e-5);
        assert!((w[1] + 0.99).abs() < 1e-5);
        adam.set_learning_rate(5e-3);
        assert_eq!(adam.learning_rate(), 5e-3);
    }

    #[test]
    fn test_grad_store_carries_accumulated_gradients() {
        let (mut buffer, var) = buffer_with(&[1.0, 2.0], 1.0);
        let other = Var::from_vec(vec![5.0f32], 1, &Device::Cpu).unwrap();
        for _ in 0..2 {
            let grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
            buffer.accumulate(&grads).unwrap();
        }
        let store = buffer.to_grad_store().unwrap();
        assert_eq!(to_host(store.get(var.as_tensor()).unwrap()).unwrap(), vec![2.0, 2.0]);
        assert!(store.get(other.as_tensor()).is_none());
    }

    #[test]
    fn test_adam_skips_params_without_gradient() {
        let (buffer, var) = buffer_with(&[1.0], 1.0);
        let mut adam = Adam::new(&buffer, 1e-2, 0.9, 0.99).unwrap();
        adam.step(&buffer).unwrap();
        assert_eq!(to_host(var.as_tensor()).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_params_without_gradient_are_untouched() {
        let (buffer, var) = buffer_with(&[1.0], 1.0);
        let mut sgd = SgdMomentum::new(1.0, 0.9, 0.5);
        sgd.step(&buffer).unwrap();
        assert_eq!(to_host(var.as_tensor()).unwrap(), vec![1.0]);
    }
}
