//! 1x1 fusion of live and warped class scores

use crate::error::{TrainError, TrainResult};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};

/// Parameter name of the fusion weight
pub const FUSION_WEIGHT: &str = "fusion.weight";

/// Projects `[live | warped]` (2C channels) back to C channels.
///
/// Starts as the identity on the live half and zero on the warped half.
pub struct FusionLayer {
    weight: Tensor,
}

impl FusionLayer {
    pub fn new(var_map: &VarMap, num_classes: usize, device: &Device) -> TrainResult<Self> {
        let vb = VarBuilder::from_varmap(var_map, DType::F32, device);
        let weight = vb.get_with_hints(
            (num_classes, 2 * num_classes, 1, 1),
            FUSION_WEIGHT,
            Init::Const(0.0),
        )?;
        let data = var_map.data().lock().map_err(|_| TrainError::Poisoned)?;
        if let Some(var) = data.get(FUSION_WEIGHT) {
            var.set(&Self::identity(num_classes, device)?)?;
        }
        Ok(Self { weight })
    }

    fn identity(num_classes: usize, device: &Device) -> TrainResult<Tensor> {
        let mut w = vec![0.0f32; num_classes * 2 * num_classes];
        for c in 0..num_classes {
            w[c * 2 * num_classes + c] = 1.0;
        }
        Ok(Tensor::from_vec(w, (num_classes, 2 * num_classes, 1, 1), device)?)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Fuse `live` with `warped`; both are `[N, C, H, W]`
    pub fn forward(&self, live: &Tensor, warped: &Tensor) -> TrainResult<Tensor> {
        let x = Tensor::cat(&[live, warped], 1)?;
        Ok(x.conv2d(&self.weight, 0, 1, 1, 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::to_host;

    #[test]
    fn test_initial_fusion_reproduces_live() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let fusion = FusionLayer::new(&var_map, 3, &device).unwrap();
        let live = Tensor::randn(0f32, 1.0, (2, 3, 4, 5), &device).unwrap();
        let warped = Tensor::randn(0f32, 5.0, (2, 3, 4, 5), &device).unwrap();
        let fused = fusion.forward(&live, &warped).unwrap();
        let (a, b) = (to_host(&fused).unwrap(), to_host(&live).unwrap());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fusion_weight_is_registered() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let _fusion = FusionLayer::new(&var_map, 2, &device).unwrap();
        let vars = var_map.data().lock().unwrap();
        let w = to_host(vars[FUSION_WEIGHT].as_tensor()).unwrap();
        assert_eq!(w, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }
}
