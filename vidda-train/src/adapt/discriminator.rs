//! Fully-convolutional domain discriminator

use crate::error::{TrainError, TrainResult};
use crate::model::named_vars;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder, VarMap};

const LEAKY_SLOPE: f64 = 0.2;
/// Number of stride-2 convolutions, including the classifier
const DEPTH: u32 = 5;

fn leaky_relu(x: &Tensor) -> TrainResult<Tensor> {
    Ok(x.maximum(&x.affine(LEAKY_SLOPE, 0.0)?)?)
}

/// Four 4x4 stride-2 convolutions (`ndf`, `2ndf`, `4ndf`, `8ndf`) with
/// leaky ReLU, then a 1-channel 4x4 stride-2 classifier. Owns its weights.
pub struct Discriminator {
    var_map: VarMap,
    convs: Vec<Conv2d>,
    classifier: Conv2d,
    in_channels: usize,
}

impl Discriminator {
    pub fn new(in_channels: usize, ndf: usize, device: &Device) -> TrainResult<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let widths = [in_channels, ndf, ndf * 2, ndf * 4, ndf * 8];
        let convs = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| candle_nn::conv2d(w[0], w[1], 4, cfg, vb.pp(format!("conv{}", i + 1))))
            .collect::<Result<Vec<_>, _>>()?;
        let classifier = candle_nn::conv2d(ndf * 8, 1, 4, cfg, vb.pp("classifier"))?;
        Ok(Self {
            var_map,
            convs,
            classifier,
            in_channels,
        })
    }

    /// Smallest input side the stack of stride-2 convolutions accepts
    pub fn min_input_size() -> usize {
        1 << DEPTH
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Weight tensors sorted by name
    pub fn named_parameters(&self) -> TrainResult<Vec<(String, Var)>> {
        named_vars(&self.var_map)
    }

    /// Domain logits for a `[N, in_channels, H, W]` input
    pub fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        let (_, c, h, w) = x.dims4()?;
        let min = Self::min_input_size();
        if c != self.in_channels || h < min || w < min {
            return Err(TrainError::Shape(format!(
                "discriminator expects {} channels and at least {min}x{min}, got {c}x{h}x{w}",
                self.in_channels
            )));
        }
        let mut x = x.clone();
        for conv in &self.convs {
            x = leaky_relu(&conv.forward(&x)?)?;
        }
        Ok(self.classifier.forward(&x)?)
    }
}
