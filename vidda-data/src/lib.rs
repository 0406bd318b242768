//! Vidda Data Crate
//!
//! Data loading and preprocessing for video domain adaptation: frame pairs,
//! dense optical-flow artifacts, segmentation labels and class remapping.
//! This crate is tensor-library agnostic; everything here is plain `Vec<f32>`
//! or `Vec<u32>` in channel-planar layout.

pub mod dataset;
pub mod error;
pub mod flow;
pub mod naming;
pub mod palette;
pub mod synthetic;
pub mod types;

pub use dataset::{FrameSample, ListDataset, ListDatasetConfig, SampleLoader, SequenceDataset};
pub use error::DataError;
pub use flow::FlowField;
pub use naming::DatasetKind;
pub use synthetic::{SyntheticConfig, SyntheticSequence};
pub use types::{IGNORE_LABEL, ImageTensor, LabelImage, LabelMap};
