//! Temporal fusion segmentation model
//!
//! The current frame runs through the backbone with gradients; the key frame
//! runs through the same weights and is detached. Key-frame class scores are
//! warped into the current frame's grid, masked by validity, and fused with
//! the live scores by a learned 1x1 projection.
//!
//! ## Modules
//!
//! - [`backbone`]: dilated residual feature extractor
//! - [`head`]: atrous classifier heads
//! - [`fusion`]: live/warped fusion layer

pub mod backbone;
pub mod fusion;
pub mod head;

pub use backbone::{Backbone, BackboneFeatures, is_frozen_norm};
pub use fusion::{FUSION_WEIGHT, FusionLayer};
pub use head::ClassifierHead;

use crate::config::ModelConfig;
use crate::error::{TrainError, TrainResult};
use crate::warp::{FeatureWarper, WarpDirection, mask_invalid};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use tracing::{debug, info};
use vidda_data::FlowField;

/// Optimizer group a generator parameter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    Backbone,
    Fusion,
    Heads,
}

impl ParamGroup {
    /// Group of a parameter from its name
    pub fn of(name: &str) -> Self {
        if name.starts_with("fusion.") {
            ParamGroup::Fusion
        } else if name.starts_with("head_") {
            ParamGroup::Heads
        } else {
            ParamGroup::Backbone
        }
    }

    /// Learning-rate multiplier of the group
    pub fn lr_multiplier(&self) -> f64 {
        match self {
            ParamGroup::Heads => 10.0,
            ParamGroup::Backbone | ParamGroup::Fusion => 1.0,
        }
    }
}

/// Main and (optional) aux class scores of one frame
#[derive(Debug, Clone)]
pub struct Predictions {
    pub main: Tensor,
    pub aux: Option<Tensor>,
}

impl Predictions {
    fn detach(&self) -> Self {
        Self {
            main: self.main.detach(),
            aux: self.aux.as_ref().map(Tensor::detach),
        }
    }
}

/// The six maps produced per forward pass
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Fused prediction
    pub fused: Predictions,
    /// Current frame only, before fusion
    pub current: Predictions,
    /// Key frame only, before fusion (detached)
    pub key: Predictions,
}

/// Segmentation network with flow-guided temporal fusion
pub struct TemporalFusionModel {
    var_map: VarMap,
    backbone: Backbone,
    head_main: ClassifierHead,
    head_aux: Option<ClassifierHead>,
    fusion: FusionLayer,
    warper: FeatureWarper,
    num_classes: usize,
    device: Device,
}

impl TemporalFusionModel {
    pub fn new(config: &ModelConfig, num_classes: usize, device: &Device) -> TrainResult<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let backbone = Backbone::new(vb.pp("backbone"), config)?;
        let head_main = ClassifierHead::new(
            vb.pp("head_main"),
            backbone.out_channels(),
            num_classes,
            &config.head_dilations,
        )?;
        let head_aux = if config.multi_level {
            Some(ClassifierHead::new(
                vb.pp("head_aux"),
                backbone.intermediate_channels(),
                num_classes,
                &config.head_dilations,
            )?)
        } else {
            None
        };
        let fusion = FusionLayer::new(&var_map, num_classes, device)?;
        let model = Self {
            var_map,
            backbone,
            head_main,
            head_aux,
            fusion,
            warper: FeatureWarper::new(WarpDirection::Forward),
            num_classes,
            device: device.clone(),
        };
        info!(
            "Built fusion model: {} classes, {} parameter tensors, multi-level {}",
            num_classes,
            model.var_map.all_vars().len(),
            config.multi_level
        );
        Ok(model)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn multi_level(&self) -> bool {
        self.head_aux.is_some()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Named trainable tensors sorted by name; frozen batch norms are left out
    pub fn named_parameters(&self) -> TrainResult<Vec<(String, Var)>> {
        let mut vars = named_vars(&self.var_map)?;
        vars.retain(|(name, _)| !is_frozen_norm(name));
        Ok(vars)
    }

    /// Class scores of a single frame, at backbone resolution
    pub fn predict(&self, frame: &Tensor) -> TrainResult<Predictions> {
        let features = self.backbone.forward(frame)?;
        let main = self.head_main.forward(&features.high)?;
        let aux = match &self.head_aux {
            Some(head) => Some(head.forward(&features.intermediate)?),
            None => None,
        };
        Ok(Predictions { main, aux })
    }

    /// Warp `key` into the grid of `live` and fuse the two
    pub fn fuse(&self, live: &Tensor, key: &Tensor, flow: &FlowField) -> TrainResult<Tensor> {
        if live.dims() != key.dims() {
            return Err(TrainError::Shape(format!(
                "live map {:?} and key map {:?} differ",
                live.dims(),
                key.dims()
            )));
        }
        let warped = self.warper.warp(key, flow)?;
        let warped = mask_invalid(&warped.reconstructed, &warped.validity)?;
        self.fusion.forward(live, &warped)
    }

    /// Full forward pass over a frame pair; `flow` is at native resolution
    #[tracing::instrument(skip_all)]
    pub fn forward(&self, current: &Tensor, key: &Tensor, flow: &FlowField) -> TrainResult<ModelOutput> {
        let live = self.predict(current)?;
        let key = self.predict(key)?.detach();
        let main = self.fuse(&live.main, &key.main, flow)?;
        let aux = match (&live.aux, &key.aux) {
            (Some(l), Some(k)) => Some(self.fuse(l, k, flow)?),
            _ => None,
        };
        debug!("Forward pass: main {:?}", main.dims());
        Ok(ModelOutput {
            fused: Predictions { main, aux },
            current: live,
            key,
        })
    }

    /// Save all weights as safetensors
    pub fn save(&self, path: &Path) -> TrainResult<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Load weights saved by [`TemporalFusionModel::save`]
    pub fn load(&mut self, path: &Path) -> TrainResult<()> {
        if !path.exists() {
            return Err(TrainError::CheckpointNotFound {
                path: path.to_path_buf(),
            });
        }
        self.var_map.load(path)?;
        Ok(())
    }
}

/// Variables of a map, sorted by name
pub fn named_vars(var_map: &VarMap) -> TrainResult<Vec<(String, Var)>> {
    let data = var_map.data().lock().map_err(|_| TrainError::Poisoned)?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tensor::to_host;
    use glam::Vec2;

    pub(crate) fn tiny_config(multi_level: bool) -> ModelConfig {
        ModelConfig {
            stem_channels: 4,
            planes: [2, 2, 4, 4],
            blocks: [1, 1, 1, 1],
            head_dilations: [1, 2, 3, 4],
            multi_level,
        }
    }

    fn frame(seed: f32) -> Tensor {
        Tensor::randn(seed, 10.0, (1, 3, 32, 64), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let model = TemporalFusionModel::new(&tiny_config(true), 5, &Device::Cpu).unwrap();
        let flow = FlowField::uniform(64, 32, Vec2::new(2.0, 0.0));
        let out = model.forward(&frame(0.0), &frame(1.0), &flow).unwrap();
        // Output stride 8
        assert_eq!(out.fused.main.dims4().unwrap(), (1, 5, 4, 8));
        assert_eq!(out.fused.aux.unwrap().dims4().unwrap(), (1, 5, 4, 8));
        assert_eq!(out.current.main.dims4().unwrap(), (1, 5, 4, 8));
        assert!(out.key.aux.is_some());
    }

    #[test]
    fn test_initial_fused_equals_current() {
        let model = TemporalFusionModel::new(&tiny_config(true), 3, &Device::Cpu).unwrap();
        let flow = FlowField::uniform(64, 32, Vec2::new(-8.0, 0.0));
        let out = model.forward(&frame(0.0), &frame(3.0), &flow).unwrap();
        let fused = to_host(&out.fused.main).unwrap();
        let current = to_host(&out.current.main).unwrap();
        for (a, b) in fused.iter().zip(&current) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_single_level_has_no_aux() {
        let model = TemporalFusionModel::new(&tiny_config(false), 3, &Device::Cpu).unwrap();
        assert!(!model.multi_level());
        let out = model
            .forward(&frame(0.0), &frame(0.0), &FlowField::zeros(64, 32))
            .unwrap();
        assert!(out.fused.aux.is_none() && out.current.aux.is_none() && out.key.aux.is_none());
        let names: Vec<String> = model.named_parameters().unwrap().into_iter().map(|(n, _)| n).collect();
        assert!(!names.iter().any(|n| n.starts_with("head_aux")));
    }

    #[test]
    fn test_key_pass_receives_no_gradient() {
        let model = TemporalFusionModel::new(&tiny_config(false), 3, &Device::Cpu).unwrap();
        let out = model
            .forward(&frame(0.0), &frame(1.0), &FlowField::zeros(64, 32))
            .unwrap();
        // Only the key prediction: nothing to differentiate
        let grads = out.key.main.sum_all().unwrap().backward().unwrap();
        for (_, var) in model.named_parameters().unwrap() {
            assert!(grads.get(var.as_tensor()).is_none());
        }
        // The live path reaches the heads and the fusion layer
        let grads = out.fused.main.sum_all().unwrap().backward().unwrap();
        let fusion = model.named_parameters().unwrap().into_iter().find(|(n, _)| n == FUSION_WEIGHT);
        assert!(grads.get(fusion.unwrap().1.as_tensor()).is_some());
    }

    #[test]
    fn test_batch_norms_are_saved_but_not_trained() {
        let model = TemporalFusionModel::new(&tiny_config(true), 3, &Device::Cpu).unwrap();
        let all = named_vars(model.var_map()).unwrap();
        let trainable = model.named_parameters().unwrap();
        assert!(all.iter().any(|(n, _)| n == "backbone.stem.bn.running_var"));
        assert!(all.len() > trainable.len());
        assert!(trainable.iter().all(|(n, _)| !is_frozen_norm(n)));
        assert!(trainable.iter().any(|(n, _)| n == "backbone.stem.conv.weight"));
    }

    #[test]
    fn test_param_groups() {
        assert_eq!(ParamGroup::of("backbone.layer1.0.conv1.conv.weight"), ParamGroup::Backbone);
        assert_eq!(ParamGroup::of("head_aux.branch0.bias"), ParamGroup::Heads);
        assert_eq!(ParamGroup::of(FUSION_WEIGHT), ParamGroup::Fusion);
        assert_eq!(ParamGroup::Heads.lr_multiplier(), 10.0);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_1.safetensors");
        let device = Device::Cpu;
        let a = TemporalFusionModel::new(&tiny_config(true), 3, &device).unwrap();
        a.save(&path).unwrap();
        let mut b = TemporalFusionModel::new(&tiny_config(true), 3, &device).unwrap();
        b.load(&path).unwrap();
        let x = frame(0.0);
        let pa = to_host(&a.predict(&x).unwrap().main).unwrap();
        let pb = to_host(&b.predict(&x).unwrap().main).unwrap();
        assert_eq!(pa, pb);
        assert!(matches!(
            b.load(&dir.path().join("missing.safetensors")),
            Err(TrainError::CheckpointNotFound { .. })
        ));
    }
}
