//! Frame and flow artifact naming for the supported video datasets
//!
//! Every dataset encodes the frame index in the file name. The key frame is
//! the frame one index back, and the pre-computed flow between the two is
//! stored in a side directory under a name derived from both indices.

use crate::error::DataError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Suffix marking flow artifacts stored as int16 scaled by ten.
pub const FLOW_MARKER: &str = "_int16_x10";

/// Supported video datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    /// Synthetic driving sequences (source domain)
    Viper,
    /// Synthetic driving sequences (source domain)
    SynthiaSeq,
    /// Real driving sequences (target domain)
    CityscapesSeq,
}

impl DatasetKind {
    /// Number of digits used for the frame index in file names
    pub fn index_width(&self) -> usize {
        match self {
            DatasetKind::Viper => 5,
            DatasetKind::SynthiaSeq | DatasetKind::CityscapesSeq => 6,
        }
    }

    /// File name suffix that follows the frame index
    pub fn frame_suffix(&self) -> &'static str {
        match self {
            DatasetKind::Viper => ".jpg",
            DatasetKind::SynthiaSeq => ".png",
            DatasetKind::CityscapesSeq => "_leftImg8bit.png",
        }
    }

    /// Rows removed from the bottom of every frame after resizing
    pub fn crop_bottom(&self) -> u32 {
        match self {
            DatasetKind::SynthiaSeq => 120,
            _ => 0,
        }
    }

    /// Raw label id of the ego vehicle, whose hood is masked out of labels
    pub fn ego_vehicle_id(&self) -> Option<u32> {
        match self {
            DatasetKind::Viper => Some(24),
            _ => None,
        }
    }

    /// Split `name` into (prefix, index) where prefix is everything before the
    /// zero-padded frame index. `name` may contain directories.
    fn split_index<'a>(&self, name: &'a str) -> Result<(&'a str, u32), DataError> {
        let suffix = self.frame_suffix();
        let width = self.index_width();
        let stem = name
            .strip_suffix(suffix)
            .ok_or_else(|| DataError::BadFrameName(name.to_string()))?;
        if stem.len() < width || !stem.is_char_boundary(stem.len() - width) {
            return Err(DataError::BadFrameName(name.to_string()));
        }
        let (prefix, digits) = stem.split_at(stem.len() - width);
        let index = digits
            .parse::<u32>()
            .map_err(|_| DataError::BadFrameName(name.to_string()))?;
        Ok((prefix, index))
    }

    /// Parse the frame index encoded in a frame name
    pub fn frame_index(&self, name: &str) -> Result<u32, DataError> {
        self.split_index(file_name(name)).map(|(_, index)| index)
    }

    fn key_index(&self, name: &str) -> Result<u32, DataError> {
        let index = self.frame_index(name)?;
        index
            .checked_sub(1)
            .ok_or_else(|| DataError::NoKeyFrame(name.to_string()))
    }

    /// Name of the key frame (one index back), keeping any directory part
    pub fn key_frame_name(&self, name: &str) -> Result<String, DataError> {
        let (prefix, index) = self.split_index(name)?;
        let key = index
            .checked_sub(1)
            .ok_or_else(|| DataError::NoKeyFrame(name.to_string()))?;
        Ok(format!(
            "{prefix}{key:0width$}{suffix}",
            width = self.index_width(),
            suffix = self.frame_suffix()
        ))
    }

    /// File name of the flow artifact for the pair (frame, key frame)
    pub fn flow_artifact_name(&self, name: &str) -> Result<String, DataError> {
        let file = file_name(name);
        let key = self.key_index(file)?;
        let width = self.index_width();
        let artifact = match self {
            DatasetKind::Viper => {
                let stem = file.trim_end_matches(".jpg");
                format!("{stem}{key:0width$}{FLOW_MARKER}")
            }
            DatasetKind::SynthiaSeq => {
                let stem = file.trim_end_matches(".png");
                format!("{stem}{FLOW_MARKER}")
            }
            DatasetKind::CityscapesSeq => {
                let stem = file.trim_end_matches("leftImg8bit.png");
                format!("{stem}{key:0width$}{FLOW_MARKER}")
            }
        };
        Ok(format!("{artifact}.npy"))
    }

    /// Path of the RGB frame inside the dataset root
    pub fn image_path(&self, root: &Path, set: &str, name: &str) -> PathBuf {
        match self {
            DatasetKind::Viper => root.join("train_images_seq").join(name),
            DatasetKind::SynthiaSeq => root.join("rgb").join(name),
            DatasetKind::CityscapesSeq => root.join("leftImg8bit_sequence").join(set).join(name),
        }
    }

    /// Path of the label map inside the dataset root
    pub fn label_path(&self, root: &Path, set: &str, name: &str) -> PathBuf {
        match self {
            DatasetKind::Viper => root
                .join("train_labels_seq")
                .join(name.replace("jpg", "png")),
            DatasetKind::SynthiaSeq => root.join("label").join(name),
            DatasetKind::CityscapesSeq => root
                .join("gtFine")
                .join(set)
                .join(name.replace("leftImg8bit", "gtFine_labelIds")),
        }
    }
}

fn file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viper_names() {
        let kind = DatasetKind::Viper;
        let name = "001/001_00120.jpg";
        assert_eq!(kind.frame_index(name).unwrap(), 120);
        assert_eq!(kind.key_frame_name(name).unwrap(), "001/001_00119.jpg");
        assert_eq!(
            kind.flow_artifact_name(name).unwrap(),
            "001_0012000119_int16_x10.npy"
        );
        assert_eq!(
            kind.label_path(Path::new("/data"), "train", name),
            PathBuf::from("/data/train_labels_seq/001/001_00120.png")
        );
    }

    #[test]
    fn test_cityscapes_names() {
        let kind = DatasetKind::CityscapesSeq;
        let name = "aachen/aachen_000000_000019_leftImg8bit.png";
        assert_eq!(kind.frame_index(name).unwrap(), 19);
        assert_eq!(
            kind.key_frame_name(name).unwrap(),
            "aachen/aachen_000000_000018_leftImg8bit.png"
        );
        assert_eq!(
            kind.flow_artifact_name(name).unwrap(),
            "aachen_000000_000019_000018_int16_x10.npy"
        );
        assert_eq!(
            kind.label_path(Path::new("/c"), "val", name),
            PathBuf::from("/c/gtFine/val/aachen/aachen_000000_000019_gtFine_labelIds.png")
        );
    }

    #[test]
    fn test_synthia_names() {
        let kind = DatasetKind::SynthiaSeq;
        let name = "000042.png";
        assert_eq!(kind.key_frame_name(name).unwrap(), "000041.png");
        assert_eq!(kind.flow_artifact_name(name).unwrap(), "000042_int16_x10.npy");
        assert_eq!(kind.crop_bottom(), 120);
    }

    #[test]
    fn test_first_frame_has_no_key_frame() {
        let err = DatasetKind::SynthiaSeq.key_frame_name("000000.png").unwrap_err();
        assert!(matches!(err, DataError::NoKeyFrame(_)));
    }

    #[test]
    fn test_bad_frame_name() {
        assert!(DatasetKind::Viper.frame_index("frame.png").is_err());
        assert!(DatasetKind::Viper.frame_index("ab.jpg").is_err());
        assert!(DatasetKind::CityscapesSeq.frame_index("x_abcdef_leftImg8bit.png").is_err());
    }
}
