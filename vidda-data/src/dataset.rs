//! Frame-pair datasets and the cycling sample loader

use crate::error::DataError;
use crate::flow::FlowField;
use crate::naming::DatasetKind;
use crate::types::{ImageTensor, LabelImage, LabelMap};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One training/evaluation item: current frame, key frame, flow and label
#[derive(Debug, Clone)]
pub struct FrameSample {
    /// Frame name relative to the dataset root
    pub name: String,
    pub current: ImageTensor,
    pub key: ImageTensor,
    /// Flow from the key frame to the current frame, at native resolution
    pub flow: FlowField,
    pub label: Option<LabelImage>,
}

/// Random-access source of frame samples
pub trait SequenceDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<FrameSample, DataError>;

    /// Class names, when the dataset provides them
    fn class_names(&self) -> Option<&[String]> {
        None
    }
}

impl<D: SequenceDataset + ?Sized> SequenceDataset for Box<D> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<FrameSample, DataError> {
        (**self).get(index)
    }

    fn class_names(&self) -> Option<&[String]> {
        (**self).class_names()
    }
}

/// Configuration of a list-file backed dataset
#[derive(Debug, Clone)]
pub struct ListDatasetConfig {
    pub kind: DatasetKind,
    pub root: PathBuf,
    pub list_path: PathBuf,
    pub set: String,
    /// Repeat the list so that it covers at least this many items
    pub max_iters: Option<usize>,
    /// Frame size (width, height)
    pub image_size: (u32, u32),
    /// Label size (width, height); defaults to `image_size`
    pub labels_size: Option<(u32, u32)>,
    /// BGR mean
    pub mean: [f32; 3],
    pub flow_dir: PathBuf,
    pub load_labels: bool,
}

/// Dataset backed by a list file of frame names
pub struct ListDataset {
    config: ListDatasetConfig,
    names: Vec<String>,
    label_map: LabelMap,
    class_names: Option<Vec<String>>,
}

impl ListDataset {
    /// Read the list file; `label_map` remaps raw label ids
    pub fn new(config: ListDatasetConfig, label_map: LabelMap) -> Result<Self, DataError> {
        let text = fs::read_to_string(&config.list_path)?;
        let mut names: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(DataError::EmptyList {
                path: config.list_path.clone(),
            });
        }
        if let Some(max_iters) = config.max_iters {
            let repeats = max_iters.div_ceil(names.len()).max(1);
            names = vec![names; repeats].concat();
        }
        info!(
            "Dataset {:?}/{}: {} items from {}",
            config.kind,
            config.set,
            names.len(),
            config.list_path.display()
        );
        Ok(Self {
            config,
            names,
            label_map,
            class_names: None,
        })
    }

    /// Attach class names (e.g. read from an `info.json`)
    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.class_names = Some(names);
        self
    }

    pub fn config(&self) -> &ListDatasetConfig {
        &self.config
    }

    fn flow_path(&self, name: &str) -> Result<PathBuf, DataError> {
        Ok(self
            .config
            .flow_dir
            .join(self.config.kind.flow_artifact_name(name)?))
    }

    fn image_path(&self, name: &str) -> PathBuf {
        self.config
            .kind
            .image_path(&self.config.root, &self.config.set, name)
    }
}

impl SequenceDataset for ListDataset {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn get(&self, index: usize) -> Result<FrameSample, DataError> {
        let name = self.names.get(index).ok_or(DataError::OutOfRange {
            index,
            len: self.names.len(),
        })?;
        let kind = self.config.kind;
        let crop = kind.crop_bottom();
        let mean = self.config.mean;
        let size = self.config.image_size;

        let current = ImageTensor::load_frame(&self.image_path(name), size, crop, mean)?;
        let key_name = kind.key_frame_name(name)?;
        let key = ImageTensor::load_frame(&self.image_path(&key_name), size, crop, mean)?;
        let flow = FlowField::load_npy(&self.flow_path(name)?)?;

        let label = if self.config.load_labels {
            let path = kind.label_path(&self.config.root, &self.config.set, name);
            let mut raw = LabelImage::load_raw(&path, self.config.labels_size.unwrap_or(size), crop)?;
            if let Some(car) = kind.ego_vehicle_id() {
                let masked = raw.mask_ego_vehicle(car);
                debug!("Masked {} ego-vehicle pixels in {}", masked, name);
            }
            Some(self.label_map.apply(&raw))
        } else {
            None
        };
        debug!("Loaded sample {} (key frame {})", name, key_name);

        Ok(FrameSample {
            name: name.clone(),
            current,
            key,
            flow,
            label,
        })
    }

    fn class_names(&self) -> Option<&[String]> {
        self.class_names.as_deref()
    }
}

/// Endless, shuffled iteration over a dataset
pub struct SampleLoader<D: SequenceDataset> {
    dataset: D,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    rng: StdRng,
}

impl<D: SequenceDataset> SampleLoader<D> {
    pub fn new(dataset: D, shuffle: bool, seed: u64) -> Result<Self, DataError> {
        if dataset.is_empty() {
            return Err(DataError::InvalidData("cannot load from an empty dataset".to_string()));
        }
        let mut loader = Self {
            order: (0..dataset.len()).collect(),
            dataset,
            cursor: 0,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        };
        loader.reshuffle();
        Ok(loader)
    }

    fn reshuffle(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
    }

    /// Next sample; starts a new epoch when the current one is exhausted
    pub fn next_sample(&mut self) -> Result<FrameSample, DataError> {
        if self.cursor >= self.order.len() {
            self.reshuffle();
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        self.dataset.get(index)
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }
}

/// Write `names` as a list file, one per line
pub fn write_list(path: &Path, names: &[String]) -> Result<(), DataError> {
    fs::write(path, names.join("\n"))?;
    Ok(())
}
