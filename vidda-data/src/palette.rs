//! Colour palettes for visualising segmentation maps

use crate::naming::DatasetKind;
use crate::types::LabelImage;
use image::{Rgb, RgbImage};

/// Cityscapes-style colours for the 15 Viper classes
pub const VIPER_PALETTE: [[u8; 3]; 15] = [
    [128, 64, 128],
    [244, 35, 232],
    [70, 70, 70],
    [190, 153, 153],
    [250, 170, 30],
    [220, 220, 0],
    [107, 142, 35],
    [152, 251, 152],
    [70, 130, 180],
    [220, 20, 60],
    [0, 0, 142],
    [0, 0, 70],
    [0, 60, 100],
    [0, 0, 230],
    [119, 11, 32],
];

/// Cityscapes-style colours for the 12 SynthiaSeq classes
pub const SYNTHIA_PALETTE: [[u8; 3]; 12] = [
    [128, 64, 128],
    [244, 35, 232],
    [70, 70, 70],
    [190, 153, 153],
    [153, 153, 153],
    [250, 170, 30],
    [220, 220, 0],
    [107, 142, 35],
    [70, 130, 180],
    [220, 20, 60],
    [255, 0, 0],
    [0, 0, 142],
];

/// Palette matching the class set of a source dataset
pub fn palette_for(source: DatasetKind) -> &'static [[u8; 3]] {
    match source {
        DatasetKind::SynthiaSeq => &SYNTHIA_PALETTE,
        _ => &VIPER_PALETTE,
    }
}

/// Render a class map; ids without a colour are black
pub fn colorize(labels: &LabelImage, palette: &[[u8; 3]]) -> RgbImage {
    RgbImage::from_fn(labels.width as u32, labels.height as u32, |x, y| {
        let id = labels.data[y as usize * labels.width + x as usize] as usize;
        Rgb(palette.get(id).copied().unwrap_or([0, 0, 0]))
    })
}
