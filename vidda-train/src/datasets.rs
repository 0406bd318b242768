//! Dataset construction from the experiment configuration

use crate::config::Config;
use crate::error::TrainResult;
use std::path::Path;
use vidda_data::{DatasetKind, LabelMap, ListDataset, ListDatasetConfig};

/// Label remapping for a dataset kind; CityscapesSeq reads `info_path`
pub fn label_map_for(kind: DatasetKind, info_path: &Path) -> TrainResult<(LabelMap, Option<Vec<String>>)> {
    Ok(match kind {
        DatasetKind::Viper => (LabelMap::viper(), None),
        DatasetKind::SynthiaSeq => (LabelMap::synthia_seq(), None),
        DatasetKind::CityscapesSeq => {
            let (map, names) = LabelMap::from_info_json(info_path)?;
            (map, Some(names))
        }
    })
}

/// Labelled source-domain training frames
pub fn source_train(config: &Config) -> TrainResult<ListDataset> {
    let train = &config.train;
    let [w, h] = train.input_size_source;
    let (label_map, _) = label_map_for(config.source, &config.test.info_target)?;
    let dataset = ListDataset::new(
        ListDatasetConfig {
            kind: config.source,
            root: config.data_directory_source.clone(),
            list_path: config.source_list(&train.set_source),
            set: train.set_source.clone(),
            max_iters: Some(train.max_iters),
            image_size: (w, h),
            labels_size: None,
            mean: train.img_mean,
            flow_dir: train.flow_path_source.clone(),
            load_labels: true,
        },
        label_map,
    )?;
    Ok(dataset)
}

/// Unlabelled target-domain training frames
pub fn target_train(config: &Config) -> TrainResult<ListDataset> {
    let train = &config.train;
    let [w, h] = train.input_size_target;
    let dataset = ListDataset::new(
        ListDatasetConfig {
            kind: config.target,
            root: config.data_directory_target.clone(),
            list_path: config.target_list(&train.set_target),
            set: train.set_target.clone(),
            max_iters: Some(train.max_iters),
            image_size: (w, h),
            labels_size: None,
            mean: train.img_mean,
            flow_dir: train.flow_path_target.clone(),
            load_labels: false,
        },
        LabelMap::default(),
    )?;
    Ok(dataset)
}

/// Labelled target-domain evaluation frames; labels at the output size
pub fn target_eval(config: &Config) -> TrainResult<ListDataset> {
    let test = &config.test;
    let [w, h] = test.input_size_target;
    let [ow, oh] = test.output_size_target;
    let (label_map, names) = label_map_for(config.target, &test.info_target)?;
    let dataset = ListDataset::new(
        ListDatasetConfig {
            kind: config.target,
            root: config.data_directory_target.clone(),
            list_path: config.target_list(&test.set_target),
            set: test.set_target.clone(),
            max_iters: None,
            image_size: (w, h),
            labels_size: Some((ow, oh)),
            mean: test.img_mean,
            flow_dir: test.flow_path_target.clone(),
            load_labels: true,
        },
        label_map,
    )?;
    Ok(match names {
        Some(names) => dataset.with_class_names(names),
        None => dataset,
    })
}
