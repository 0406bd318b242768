//! Experiment configuration
//!
//! A [`Config`] is built once at startup from the defaults plus a JSON
//! override document and is then passed around by reference. Overrides are
//! checked against the defaults' shape by [`merge`]: unknown keys and type
//! changes are errors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use vidda_data::{DatasetKind, IGNORE_LABEL};

/// Errors raised while merging or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown configuration key '{path}'")]
    UnknownKey { path: String },

    #[error("Type mismatch for '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Shape mismatch for '{path}': expected {expected} elements, found {found}")]
    ShapeMismatch {
        path: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Backbone and head shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Output channels of the stem convolution
    pub stem_channels: usize,
    /// Bottleneck widths of the four residual stages
    pub planes: [usize; 4],
    /// Residual blocks per stage
    pub blocks: [usize; 4],
    /// Dilations of the summed classifier branches
    pub head_dilations: [usize; 4],
    /// Supervise and align the intermediate (aux) stage as well
    pub multi_level: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        // ResNet-101 layout
        Self {
            stem_channels: 64,
            planes: [64, 128, 256, 512],
            blocks: [3, 4, 23, 3],
            head_dilations: [6, 12, 18, 24],
            multi_level: true,
        }
    }
}

/// Training hyperparameters and inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    pub da_method: String,
    pub set_source: String,
    pub set_target: String,
    /// (width, height)
    pub input_size_source: [u32; 2],
    /// (width, height)
    pub input_size_target: [u32; 2],
    pub flow_path_source: PathBuf,
    pub flow_path_target: PathBuf,
    /// BGR mean subtracted from every frame
    pub img_mean: [f32; 3],
    pub ignore_label: u32,
    /// Generator weights loaded before training, if not empty
    pub restore_from: PathBuf,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub power: f64,
    pub learning_rate_d: f64,
    pub lambda_seg_main: f64,
    pub lambda_seg_aux: f64,
    pub lambda_adv_main: f64,
    pub lambda_adv_aux: f64,
    /// Weight of every unsupervised target term
    pub lambda_u: f64,
    /// Relative weight of the spatial adversarial terms
    pub lambda_sa: f64,
    /// Relative weight of the discriminator orthogonality term
    pub lambda_wd: f64,
    pub max_grad_norm: f64,
    pub discriminator_ndf: usize,
    pub max_iters: usize,
    pub early_stop: usize,
    pub save_pred_every: usize,
    /// Defaults to `<exp_root>/snapshots/<exp_name>` when empty
    pub snapshot_dir: PathBuf,
    pub random_seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            da_method: "DAVSN".to_string(),
            set_source: "train".to_string(),
            set_target: "train".to_string(),
            input_size_source: [1280, 720],
            input_size_target: [1024, 512],
            flow_path_source: PathBuf::from("data/estimated_optical_flow_viper_train"),
            flow_path_target: PathBuf::from("data/estimated_optical_flow_cityscapes_seq_train"),
            img_mean: [104.00698793, 116.66876762, 122.67891434],
            ignore_label: IGNORE_LABEL,
            restore_from: PathBuf::new(),
            learning_rate: 2.5e-4,
            momentum: 0.9,
            weight_decay: 5e-4,
            power: 0.9,
            learning_rate_d: 1e-4,
            lambda_seg_main: 1.0,
            lambda_seg_aux: 0.1,
            lambda_adv_main: 0.001,
            lambda_adv_aux: 0.0002,
            lambda_u: 0.001,
            lambda_sa: 1.0,
            lambda_wd: 1.0,
            max_grad_norm: 1.0,
            discriminator_ndf: 64,
            max_iters: 250_000,
            early_stop: 120_000,
            save_pred_every: 1000,
            snapshot_dir: PathBuf::new(),
            random_seed: 1234,
        }
    }
}

impl TrainConfig {
    /// Ratio between the aux and main adversarial weights
    pub fn adv_aux_factor(&self) -> f64 {
        if self.lambda_adv_main == 0.0 {
            0.0
        } else {
            self.lambda_adv_aux / self.lambda_adv_main
        }
    }
}

/// Evaluation inputs and checkpoint walking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfig {
    /// `video_single` or `video_best`
    pub mode: String,
    /// Checkpoint evaluated in single mode
    pub restore_from: PathBuf,
    /// Where checkpoints are looked up; defaults to the training snapshot dir
    pub snapshot_dir: PathBuf,
    pub snapshot_step: usize,
    pub snapshot_start_iter: usize,
    pub snapshot_maxiter: usize,
    pub set_target: String,
    /// (width, height)
    pub input_size_target: [u32; 2],
    /// (width, height) of the labels predictions are scored at
    pub output_size_target: [u32; 2],
    /// `info.json` with the target class names and label remapping
    pub info_target: PathBuf,
    pub flow_path_target: PathBuf,
    pub img_mean: [f32; 3],
    /// Poll for checkpoints that do not exist yet
    pub wait_model: bool,
    pub wait_interval_secs: u64,
    pub wait_max_attempts: usize,
    /// Write colourised predictions in single mode
    pub save_predictions: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            mode: "video_best".to_string(),
            restore_from: PathBuf::new(),
            snapshot_dir: PathBuf::new(),
            snapshot_step: 200,
            snapshot_start_iter: 200,
            snapshot_maxiter: 120_000,
            set_target: "val".to_string(),
            input_size_target: [1024, 512],
            output_size_target: [2048, 1024],
            info_target: PathBuf::from("data/cityscapes_list/info.json"),
            flow_path_target: PathBuf::from("data/estimated_optical_flow_cityscapes_seq_val"),
            img_mean: [104.00698793, 116.66876762, 122.67891434],
            wait_model: true,
            wait_interval_secs: 5,
            wait_max_attempts: 720,
            save_predictions: false,
        }
    }
}

/// Complete experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Derived from the datasets and method when empty
    pub exp_name: String,
    pub exp_root: PathBuf,
    pub num_classes: usize,
    pub gpu_id: usize,
    pub source: DatasetKind,
    pub target: DatasetKind,
    /// List file path; `{}` is replaced by the set name
    pub data_list_source: String,
    pub data_list_target: String,
    pub data_directory_source: PathBuf,
    pub data_directory_target: PathBuf,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub test: TestConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exp_name: String::new(),
            exp_root: PathBuf::from("experiments"),
            num_classes: 15,
            gpu_id: 0,
            source: DatasetKind::Viper,
            target: DatasetKind::CityscapesSeq,
            data_list_source: "data/viper_list/{}.txt".to_string(),
            data_list_target: "data/cityscapes_list/{}.txt".to_string(),
            data_directory_source: PathBuf::from("data/Viper"),
            data_directory_target: PathBuf::from("data/Cityscapes"),
            model: ModelConfig::default(),
            train: TrainConfig::default(),
            test: TestConfig::default(),
        }
    }
}

impl Config {
    /// Defaults merged with `overrides`, then validated
    pub fn from_overrides(overrides: &Value) -> Result<Self, ConfigError> {
        let base = serde_json::to_value(Config::default())?;
        let merged = merge(&base, overrides)?;
        let mut config: Config = serde_json::from_value(merged)?;
        if config.exp_name.is_empty() {
            config.exp_name = config.default_exp_name();
        }
        config.validate()?;
        Ok(config)
    }

    /// Read overrides from a JSON file
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let overrides: Value = serde_json::from_str(&text)?;
        Self::from_overrides(&overrides)
    }

    /// Append `_<suffix>` to the experiment name
    pub fn with_exp_suffix(mut self, suffix: &str) -> Self {
        if !suffix.is_empty() {
            self.exp_name = format!("{}_{}", self.exp_name, suffix);
        }
        self
    }

    fn default_exp_name(&self) -> String {
        format!(
            "{:?}2{:?}_DeepLabv2_{}",
            self.source, self.target, self.train.da_method
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("num_classes", self.num_classes),
            ("train.max_iters", self.train.max_iters),
            ("train.early_stop", self.train.early_stop),
            ("train.save_pred_every", self.train.save_pred_every),
            ("test.snapshot_step", self.test.snapshot_step),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.num_classes as u32 > self.train.ignore_label {
            return Err(ConfigError::InvalidValue {
                key: "num_classes",
                reason: format!("exceeds the ignore label {}", self.train.ignore_label),
            });
        }
        Ok(())
    }

    /// Snapshot directory used while training
    pub fn snapshot_dir(&self) -> PathBuf {
        if self.train.snapshot_dir.as_os_str().is_empty() {
            self.exp_root.join("snapshots").join(&self.exp_name)
        } else {
            self.train.snapshot_dir.clone()
        }
    }

    /// Directory evaluation reads checkpoints from
    pub fn test_snapshot_dir(&self) -> PathBuf {
        if self.test.snapshot_dir.as_os_str().is_empty() {
            self.snapshot_dir()
        } else {
            self.test.snapshot_dir.clone()
        }
    }

    /// List file for a set of the source dataset
    pub fn source_list(&self, set: &str) -> PathBuf {
        PathBuf::from(self.data_list_source.replace("{}", set))
    }

    /// List file for a set of the target dataset
    pub fn target_list(&self, set: &str) -> PathBuf {
        PathBuf::from(self.data_list_target.replace("{}", set))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Merge `overrides` into `base`.
///
/// Every key in `overrides` must exist in `base`. Objects merge
/// recursively, scalars must keep their type (an integer may replace a
/// float), and arrays must keep their length with each element coerced to
/// the kind of the default element.
pub fn merge(base: &Value, overrides: &Value) -> Result<Value, ConfigError> {
    merge_at(base, overrides, "")
}

fn merge_at(base: &Value, over: &Value, path: &str) -> Result<Value, ConfigError> {
    match (base, over) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out: Map<String, Value> = b.clone();
            for (key, value) in o {
                let key_path = join_path(path, key);
                let default = b
                    .get(key)
                    .ok_or_else(|| ConfigError::UnknownKey {
                        path: key_path.clone(),
                    })?;
                out.insert(key.clone(), merge_at(default, value, &key_path)?);
            }
            Ok(Value::Object(out))
        }
        (Value::Array(b), Value::Array(o)) => {
            if b.len() != o.len() {
                return Err(ConfigError::ShapeMismatch {
                    path: path.to_string(),
                    expected: b.len(),
                    found: o.len(),
                });
            }
            b.iter()
                .zip(o)
                .enumerate()
                .map(|(i, (d, v))| coerce_element(d, v, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        (Value::Number(b), Value::Number(o)) => {
            if !b.is_f64() && o.is_f64() {
                return Err(mismatch(path, base, over));
            }
            Ok(over.clone())
        }
        (Value::Bool(_), Value::Bool(_)) | (Value::String(_), Value::String(_)) => Ok(over.clone()),
        _ => Err(mismatch(path, base, over)),
    }
}

fn coerce_element(default: &Value, value: &Value, path: &str) -> Result<Value, ConfigError> {
    match (default, value) {
        (Value::Number(d), Value::Number(v)) if !d.is_f64() && v.is_f64() => {
            // Whole floats become integers
            match v.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 => {
                    Ok(Value::from(f as u64))
                }
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < 0.0 => {
                    Ok(Value::from(f as i64))
                }
                _ => Err(mismatch(path, default, value)),
            }
        }
        _ => merge_at(default, value, path),
    }
}

fn mismatch(path: &str, base: &Value, over: &Value) -> ConfigError {
    ConfigError::TypeMismatch {
        path: path.to_string(),
        expected: kind_of(base),
        found: kind_of(over),
    }
}
