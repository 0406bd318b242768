//! Dilated residual backbone
//!
//! Bottleneck ResNet with output stride 8: the last two stages keep their
//! resolution and dilate instead. Returns the third-stage features (for the
//! aux head) and the fourth-stage features (for the main head).
//!
//! Every convolution is followed by a frozen batch norm: running statistics
//! and affine terms are loaded with the weights but never trained.

use crate::config::ModelConfig;
use crate::error::TrainResult;
use candle_core::Tensor;
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Init, Module, ModuleT, VarBuilder};

/// Output channels of a bottleneck relative to its width
pub const EXPANSION: usize = 4;

/// Convolution with explicit initialisation; `bias` adds a zero-initialised bias
pub(crate) fn conv2d(
    vb: VarBuilder,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    cfg: Conv2dConfig,
    init: Init,
    bias: bool,
) -> TrainResult<Conv2d> {
    let weight = vb.get_with_hints(
        (out_channels, in_channels / cfg.groups, kernel, kernel),
        "weight",
        init,
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Conv2d::new(weight, bias, cfg))
}

fn plain(
    vb: VarBuilder,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
) -> TrainResult<Conv2d> {
    let cfg = Conv2dConfig {
        padding: dilation * (kernel / 2),
        stride,
        dilation,
        ..Default::default()
    };
    conv2d(
        vb,
        in_channels,
        out_channels,
        kernel,
        cfg,
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
        false,
    )
}

/// Whether a parameter name belongs to a frozen batch norm
pub fn is_frozen_norm(name: &str) -> bool {
    name.split('.').any(|part| part.starts_with("bn"))
}

/// Batch norm evaluated with its running statistics only
struct FrozenNorm(BatchNorm);

impl FrozenNorm {
    fn new(vb: VarBuilder, channels: usize) -> TrainResult<Self> {
        let cfg = BatchNormConfig {
            eps: 1e-5,
            ..Default::default()
        };
        Ok(Self(candle_nn::batch_norm(channels, cfg, vb)?))
    }

    fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        Ok(self.0.forward_t(x, false)?)
    }
}

/// Convolution followed by a frozen batch norm
struct ConvNorm {
    conv: Conv2d,
    bn: FrozenNorm,
}

impl ConvNorm {
    fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        dilation: usize,
    ) -> TrainResult<Self> {
        Ok(Self {
            conv: plain(vb.pp("conv"), in_channels, out_channels, kernel, stride, dilation)?,
            bn: FrozenNorm::new(vb.pp("bn"), out_channels)?,
        })
    }

    fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        self.bn.forward(&self.conv.forward(x)?)
    }
}

struct Bottleneck {
    conv1: ConvNorm,
    conv2: ConvNorm,
    conv3: ConvNorm,
    downsample: Option<ConvNorm>,
}

impl Bottleneck {
    fn new(
        vb: VarBuilder,
        in_channels: usize,
        planes: usize,
        stride: usize,
        dilation: usize,
    ) -> TrainResult<Self> {
        let out_channels = planes * EXPANSION;
        let downsample = if stride != 1 || in_channels != out_channels {
            Some(ConvNorm::new(vb.pp("downsample"), in_channels, out_channels, 1, stride, 1)?)
        } else {
            None
        };
        Ok(Self {
            conv1: ConvNorm::new(vb.pp("conv1"), in_channels, planes, 1, stride, 1)?,
            conv2: ConvNorm::new(vb.pp("conv2"), planes, planes, 3, 1, dilation)?,
            conv3: ConvNorm::new(vb.pp("conv3"), planes, out_channels, 1, 1, 1)?,
            downsample,
        })
    }

    fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        let out = self.conv1.forward(x)?.relu()?;
        let out = self.conv2.forward(&out)?.relu()?;
        let out = self.conv3.forward(&out)?;
        let residual = match &self.downsample {
            Some(ds) => ds.forward(x)?,
            None => x.clone(),
        };
        Ok((out + residual)?.relu()?)
    }
}

struct Stage {
    blocks: Vec<Bottleneck>,
}

impl Stage {
    fn new(
        vb: VarBuilder,
        in_channels: usize,
        planes: usize,
        blocks: usize,
        stride: usize,
        dilation: usize,
    ) -> TrainResult<Self> {
        let mut layers = Vec::with_capacity(blocks.max(1));
        layers.push(Bottleneck::new(vb.pp("0"), in_channels, planes, stride, dilation)?);
        for i in 1..blocks.max(1) {
            layers.push(Bottleneck::new(
                vb.pp(i.to_string()),
                planes * EXPANSION,
                planes,
                1,
                dilation,
            )?);
        }
        Ok(Self { blocks: layers })
    }

    fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        let mut x = x.clone();
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }
}

/// Features of one frame
pub struct BackboneFeatures {
    /// Third stage, feeds the aux head
    pub intermediate: Tensor,
    /// Fourth stage, feeds the main head
    pub high: Tensor,
}

/// Residual feature extractor shared by the current and key frames
pub struct Backbone {
    stem: ConvNorm,
    stages: Vec<Stage>,
    intermediate_channels: usize,
    out_channels: usize,
}

impl Backbone {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> TrainResult<Self> {
        let stem = ConvNorm::new(vb.pp("stem"), 3, config.stem_channels, 7, 2, 1)?;
        // (stride, dilation) per stage
        let layout = [(1, 1), (2, 1), (1, 2), (1, 4)];
        let mut in_channels = config.stem_channels;
        let mut stages = Vec::with_capacity(4);
        for (i, (stride, dilation)) in layout.into_iter().enumerate() {
            stages.push(Stage::new(
                vb.pp(format!("layer{}", i + 1)),
                in_channels,
                config.planes[i],
                config.blocks[i],
                stride,
                dilation,
            )?);
            in_channels = config.planes[i] * EXPANSION;
        }
        Ok(Self {
            stem,
            stages,
            intermediate_channels: config.planes[2] * EXPANSION,
            out_channels: config.planes[3] * EXPANSION,
        })
    }

    pub fn intermediate_channels(&self) -> usize {
        self.intermediate_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&self, x: &Tensor) -> TrainResult<BackboneFeatures> {
        let x = self.stem.forward(x)?.relu()?.max_pool2d(2)?;
        let mut x = x;
        for stage in &self.stages[..2] {
            x = stage.forward(&x)?;
        }
        let intermediate = self.stages[2].forward(&x)?;
        let high = self.stages[3].forward(&intermediate)?;
        Ok(BackboneFeatures { intermediate, high })
    }
}
