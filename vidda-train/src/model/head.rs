//! Atrous classifier head: a sum of parallel dilated 3x3 convolutions

use super::backbone::conv2d;
use crate::error::TrainResult;
use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Init, Module, VarBuilder};

pub struct ClassifierHead {
    branches: Vec<Conv2d>,
}

impl ClassifierHead {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        num_classes: usize,
        dilations: &[usize],
    ) -> TrainResult<Self> {
        let branches = dilations
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                let cfg = Conv2dConfig {
                    padding: d,
                    dilation: d,
                    ..Default::default()
                };
                conv2d(
                    vb.pp(format!("branch{i}")),
                    in_channels,
                    num_classes,
                    3,
                    cfg,
                    Init::Randn {
                        mean: 0.0,
                        stdev: 0.01,
                    },
                    true,
                )
            })
            .collect::<TrainResult<Vec<_>>>()?;
        Ok(Self { branches })
    }

    pub fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        let mut out = self.branches[0].forward(x)?;
        for branch in &self.branches[1..] {
            out = (out + branch.forward(x)?)?;
        }
        Ok(out)
    }
}
