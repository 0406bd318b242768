//! Deterministic synthetic frame pairs
//!
//! Frames are vertical class bands translated by a fixed shift between the
//! key frame and the current frame, with the matching flow. Used for smoke
//! runs and tests where no real dataset is available.

use crate::dataset::{FrameSample, SequenceDataset};
use crate::error::DataError;
use crate::flow::FlowField;
use crate::types::{ImageTensor, LabelImage};
use glam::IVec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Parameters of a synthetic sequence
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub width: usize,
    pub height: usize,
    pub num_classes: usize,
    /// Width of each class band in pixels
    pub band_width: usize,
    /// Content motion from the key frame to the current frame
    pub shift: IVec2,
    /// Flow is stored at `scale` times the frame resolution
    pub flow_scale: usize,
    /// Uniform pixel noise amplitude
    pub noise: f32,
    pub len: usize,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 32,
            height: 16,
            num_classes: 4,
            band_width: 4,
            shift: IVec2::new(1, 0),
            flow_scale: 1,
            noise: 4.0,
            len: 8,
            seed: 0,
        }
    }
}

/// A synthetic dataset of translated band patterns
#[derive(Debug, Clone)]
pub struct SyntheticSequence {
    config: SyntheticConfig,
}

impl SyntheticSequence {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn class_at(&self, x: i64, y: i64, phase: i64) -> u32 {
        let c = &self.config;
        let band = (x + phase + y / 4).div_euclid(c.band_width.max(1) as i64);
        band.rem_euclid(c.num_classes.max(1) as i64) as u32
    }

    fn class_color(class: u32) -> [f32; 3] {
        let k = class as f32;
        [
            (37.0 * k) % 255.0 - 128.0,
            (91.0 * k + 40.0) % 255.0 - 128.0,
            (53.0 * k + 90.0) % 255.0 - 128.0,
        ]
    }

    fn render(&self, classes: &[u32], rng: &mut StdRng) -> ImageTensor {
        let plane = self.config.width * self.config.height;
        let mut data = vec![0.0; 3 * plane];
        for (i, &class) in classes.iter().enumerate() {
            let color = Self::class_color(class);
            for c in 0..3 {
                let jitter = if self.config.noise > 0.0 {
                    rng.gen_range(-self.config.noise..self.config.noise)
                } else {
                    0.0
                };
                data[c * plane + i] = color[c] + jitter;
            }
        }
        ImageTensor {
            channels: 3,
            height: self.config.height,
            width: self.config.width,
            data,
        }
    }

    /// Class map of the current frame for item `index`
    pub fn current_classes(&self, index: usize) -> Vec<u32> {
        let c = &self.config;
        let phase = index as i64;
        let mut classes = Vec::with_capacity(c.width * c.height);
        for y in 0..c.height as i64 {
            for x in 0..c.width as i64 {
                classes.push(self.class_at(x - c.shift.x as i64, y - c.shift.y as i64, phase));
            }
        }
        classes
    }

    /// Class map of the key frame for item `index`
    pub fn key_classes(&self, index: usize) -> Vec<u32> {
        let c = &self.config;
        let phase = index as i64;
        let mut classes = Vec::with_capacity(c.width * c.height);
        for y in 0..c.height as i64 {
            for x in 0..c.width as i64 {
                classes.push(self.class_at(x, y, phase));
            }
        }
        classes
    }
}

impl SequenceDataset for SyntheticSequence {
    fn len(&self) -> usize {
        self.config.len
    }

    fn get(&self, index: usize) -> Result<FrameSample, DataError> {
        if index >= self.config.len {
            return Err(DataError::OutOfRange {
                index,
                len: self.config.len,
            });
        }
        let c = &self.config;
        let mut rng = StdRng::seed_from_u64(c.seed.wrapping_mul(1_000_003).wrapping_add(index as u64));
        let current_classes = self.current_classes(index);
        let current = self.render(&current_classes, &mut rng);
        let key = self.render(&self.key_classes(index), &mut rng);

        // Key pixel (x, y) lands at (x - dx, y - dy), so flow is the negated shift
        let scale = c.flow_scale.max(1);
        let displacement = -c.shift.as_vec2() * scale as f32;
        let flow = FlowField::uniform(c.width * scale, c.height * scale, displacement);

        Ok(FrameSample {
            name: format!("synthetic_{index:06}.png"),
            current,
            key,
            flow,
            label: Some(LabelImage::new(c.height, c.width, current_classes)?),
        })
    }
}
