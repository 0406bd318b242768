//! Core data types for frames and labels.
//!
//! These are CPU-side, channel-planar representations. Tensor conversion
//! lives in vidda-train.

use crate::error::DataError;
use image::DynamicImage;
use image::imageops::FilterType;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Label value excluded from losses and metrics.
pub const IGNORE_LABEL: u32 = 255;

/// A `[C, H, W]` float image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImageTensor {
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self, DataError> {
        if data.len() != channels * height * width {
            return Err(DataError::InvalidData(format!(
                "image {}x{}x{} needs {} values, got {}",
                channels,
                height,
                width,
                channels * height * width,
                data.len()
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    /// Load an RGB frame, resize it (bicubic) to `size = (width, height)`,
    /// crop `crop_bottom` rows, reorder to BGR and subtract `mean` (BGR).
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load_frame(
        path: &Path,
        size: (u32, u32),
        crop_bottom: u32,
        mean: [f32; 3],
    ) -> Result<Self, DataError> {
        let img = open(path)?;
        let rgb = img.resize_exact(size.0, size.1, FilterType::CatmullRom).to_rgb8();
        Ok(Self::from_rgb(&rgb, crop_bottom, mean))
    }

    /// Convert an RGB buffer to a mean-subtracted BGR tensor
    pub fn from_rgb(rgb: &image::RgbImage, crop_bottom: u32, mean: [f32; 3]) -> Self {
        let width = rgb.width() as usize;
        let height = rgb.height().saturating_sub(crop_bottom) as usize;
        let plane = width * height;
        let mut data = vec![0.0; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if y >= height {
                continue;
            }
            for c in 0..3 {
                // BGR channel c reads RGB channel 2 - c
                data[c * plane + y * width + x] = pixel.0[2 - c] as f32 - mean[c];
            }
        }
        Self {
            channels: 3,
            height,
            width,
            data,
        }
    }
}

/// A `[H, W]` map of train ids
#[derive(Debug, Clone, PartialEq)]
pub struct LabelImage {
    pub height: usize,
    pub width: usize,
    pub data: Vec<u32>,
}

impl LabelImage {
    pub fn new(height: usize, width: usize, data: Vec<u32>) -> Result<Self, DataError> {
        if data.len() != height * width {
            return Err(DataError::InvalidData(format!(
                "label {}x{} needs {} values, got {}",
                height,
                width,
                height * width,
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    /// Load raw label ids (first channel), resized with nearest neighbour
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load_raw(path: &Path, size: (u32, u32), crop_bottom: u32) -> Result<Self, DataError> {
        let img = open(path)?.resize_exact(size.0, size.1, FilterType::Nearest);
        let (width, full_height) = (img.width() as usize, img.height() as usize);
        let ids: Vec<u32> = match &img {
            DynamicImage::ImageLuma8(buf) => buf.pixels().map(|p| p.0[0] as u32).collect(),
            DynamicImage::ImageLuma16(buf) => buf.pixels().map(|p| p.0[0] as u32).collect(),
            DynamicImage::ImageRgb16(buf) => buf.pixels().map(|p| p.0[0] as u32).collect(),
            DynamicImage::ImageRgba16(buf) => buf.pixels().map(|p| p.0[0] as u32).collect(),
            other => other.to_rgb8().pixels().map(|p| p.0[0] as u32).collect(),
        };
        let height = full_height.saturating_sub(crop_bottom as usize);
        let mut data = ids;
        data.truncate(height * width);
        Self::new(height, width, data)
    }
}

impl LabelImage {
    /// Set the 8-connected region of `id` containing the bottom-centre pixel
    /// to [`IGNORE_LABEL`]. Returns the number of pixels changed.
    pub fn mask_ego_vehicle(&mut self, id: u32) -> usize {
        if self.width == 0 || self.height == 0 {
            return 0;
        }
        let seed = (self.height - 1) * self.width + self.width / 2;
        if self.data[seed] != id {
            return 0;
        }
        let mut stack = vec![seed];
        self.data[seed] = IGNORE_LABEL;
        let mut count = 0;
        while let Some(i) = stack.pop() {
            count += 1;
            let (x, y) = ((i % self.width) as i64, (i / self.width) as i64);
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                        continue;
                    }
                    let n = ny as usize * self.width + nx as usize;
                    if self.data[n] == id {
                        self.data[n] = IGNORE_LABEL;
                        stack.push(n);
                    }
                }
            }
        }
        count
    }
}

fn open(path: &Path) -> Result<DynamicImage, DataError> {
    image::open(path).map_err(|source| DataError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Mapping from dataset label ids to training ids
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    mapping: HashMap<u32, u32>,
}

#[derive(Deserialize)]
struct DatasetInfo {
    label: Vec<String>,
    label2train: Vec<[u32; 2]>,
}

impl LabelMap {
    pub fn new(pairs: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            mapping: pairs.into_iter().collect(),
        }
    }

    /// Viper ids mapped onto the 15 shared classes
    pub fn viper() -> Self {
        Self::new([
            (3, 0),
            (4, 1),
            (9, 2),
            (11, 3),
            (13, 4),
            (14, 5),
            (7, 6),
            (8, 6),
            (6, 7),
            (2, 8),
            (20, 9),
            (24, 10),
            (27, 11),
            (26, 12),
            (23, 13),
            (22, 14),
        ])
    }

    /// SynthiaSeq ids mapped onto the 12 shared classes
    pub fn synthia_seq() -> Self {
        Self::new([
            (3, 0),
            (4, 1),
            (2, 2),
            (5, 3),
            (7, 4),
            (15, 5),
            (9, 6),
            (6, 7),
            (1, 8),
            (10, 9),
            (11, 10),
            (8, 11),
        ])
    }

    /// Read `label2train` and class names from a dataset `info.json`
    pub fn from_info_json(path: &Path) -> Result<(Self, Vec<String>), DataError> {
        let text = std::fs::read_to_string(path)?;
        let info: DatasetInfo = serde_json::from_str(&text)?;
        let map = Self::new(info.label2train.into_iter().map(|[from, to]| (from, to)));
        Ok((map, info.label))
    }

    /// Map a single id; unknown ids become [`IGNORE_LABEL`]
    pub fn map(&self, id: u32) -> u32 {
        self.mapping.get(&id).copied().unwrap_or(IGNORE_LABEL)
    }

    /// Remap every pixel of a raw label image
    pub fn apply(&self, raw: &LabelImage) -> LabelImage {
        LabelImage {
            height: raw.height,
            width: raw.width,
            data: raw.data.iter().map(|&id| self.map(id)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_is_bgr_and_mean_subtracted() {
        let mut rgb = image::RgbImage::new(2, 1);
        rgb.put_pixel(0, 0, image::Rgb([10, 20, 30]));
        rgb.put_pixel(1, 0, image::Rgb([1, 2, 3]));
        let t = ImageTensor::from_rgb(&rgb, 0, [1.0, 2.0, 3.0]);
        assert_eq!((t.channels, t.height, t.width), (3, 1, 2));
        // B plane
        assert_eq!(t.data[0], 29.0);
        assert_eq!(t.data[1], 2.0);
        // G plane
        assert_eq!(t.data[2], 18.0);
        // R plane
        assert_eq!(t.data[4], 7.0);
    }

    #[test]
    fn test_from_rgb_crops_bottom_rows() {
        let rgb = image::RgbImage::new(4, 5);
        let t = ImageTensor::from_rgb(&rgb, 2, [0.0; 3]);
        assert_eq!(t.height, 3);
        assert_eq!(t.data.len(), 3 * 4 * 3);
    }

    #[test]
    fn test_label_map_unknown_is_ignored() {
        let map = LabelMap::viper();
        assert_eq!(map.map(3), 0);
        assert_eq!(map.map(8), 6);
        assert_eq!(map.map(1000), IGNORE_LABEL);
        let raw = LabelImage::new(1, 3, vec![3, 24, 99]).unwrap();
        assert_eq!(map.apply(&raw).data, vec![0, 10, IGNORE_LABEL]);
    }

    #[test]
    fn test_label_map_from_info_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.json");
        std::fs::write(
            &path,
            r#"{"label": ["road", "sidewalk"], "label2train": [[7, 0], [8, 1], [0, 255]]}"#,
        )
        .unwrap();
        let (map, names) = LabelMap::from_info_json(&path).unwrap();
        assert_eq!(names, vec!["road", "sidewalk"]);
        assert_eq!(map.map(7), 0);
        assert_eq!(map.map(8), 1);
        assert_eq!(map.map(0), IGNORE_LABEL);
    }

    #[test]
    fn test_load_raw_labels_nearest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("label.png");
        let mut img = image::GrayImage::new(4, 4);
        for (x, _, p) in img.enumerate_pixels_mut() {
            p.0[0] = if x < 2 { 7 } else { 8 };
        }
        img.save(&path).unwrap();
        let labels = LabelImage::load_raw(&path, (2, 2), 0).unwrap();
        assert_eq!(labels.data, vec![7, 8, 7, 8]);
    }

    #[test]
    fn test_ego_vehicle_component_is_ignored() {
        // Car (24) touching the bottom centre, plus a separate car top-left
        #[rustfmt::skip]
        let mut labels = LabelImage::new(4, 5, vec![
            24, 3,  3,  3,  3,
            3,  3,  3,  3,  3,
            3,  3,  3,  24, 3,
            24, 24, 24, 3,  3,
        ]).unwrap();
        assert_eq!(labels.mask_ego_vehicle(24), 4);
        assert_eq!(labels.data[0], 24);
        assert_eq!(labels.data[13], IGNORE_LABEL);
        assert_eq!(labels.data[15..18], [IGNORE_LABEL; 3]);
        assert_eq!(LabelMap::viper().apply(&labels).data[17], IGNORE_LABEL);
    }

    #[test]
    fn test_ego_vehicle_mask_needs_car_at_bottom_centre() {
        let mut labels = LabelImage::new(2, 3, vec![24, 24, 24, 3, 3, 3]).unwrap();
        assert_eq!(labels.mask_ego_vehicle(24), 0);
        assert_eq!(labels.data, vec![24, 24, 24, 3, 3, 3]);
    }

    #[test]
    fn test_image_tensor_rejects_wrong_length() {
        assert!(ImageTensor::new(3, 2, 2, vec![0.0; 11]).is_err());
    }
}
