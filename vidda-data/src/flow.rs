//! Dense optical-flow fields
//!
//! Flow is stored channel-planar: the `dx` plane followed by the `dy` plane,
//! each `height * width` values in row-major order. A flow value `(dx, dy)` at
//! key-frame pixel `(x, y)` means the pixel appears at `(x - dx, y - dy)` in
//! the current frame.

use crate::error::DataError;
use glam::Vec2;
use ndarray::Array3;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Stored flow values are fixed-point with this scale.
pub const FLOW_STORAGE_SCALE: f32 = 10.0;

/// A dense 2-channel displacement field
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl FlowField {
    /// Create a flow field from planar `[dx..., dy...]` data
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self, DataError> {
        if data.len() != 2 * width * height {
            return Err(DataError::InvalidData(format!(
                "flow of {}x{} needs {} values, got {}",
                width,
                height,
                2 * width * height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// An all-zero (identity) flow
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; 2 * width * height],
        }
    }

    /// The same displacement at every pixel
    pub fn uniform(width: usize, height: usize, displacement: Vec2) -> Self {
        Self::from_fn(width, height, |_, _| displacement)
    }

    /// Build a flow by evaluating `f(x, y)` at every pixel
    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> Vec2) -> Self {
        let plane = width * height;
        let mut data = vec![0.0; 2 * plane];
        for y in 0..height {
            for x in 0..width {
                let d = f(x, y);
                data[y * width + x] = d.x;
                data[plane + y * width + x] = d.y;
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Horizontal displacement plane
    pub fn dx(&self) -> &[f32] {
        &self.data[..self.width * self.height]
    }

    /// Vertical displacement plane
    pub fn dy(&self) -> &[f32] {
        &self.data[self.width * self.height..]
    }

    /// Planar `[dx..., dy...]` data
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Displacement at pixel `(x, y)`
    pub fn at(&self, x: usize, y: usize) -> Vec2 {
        let i = y * self.width + x;
        Vec2::new(self.data[i], self.data[self.width * self.height + i])
    }

    /// Bilinearly resample (corner-aligned) to `width x height`.
    ///
    /// Flow magnitudes are in native pixel units, so both components are
    /// multiplied by `height / native_height`.
    pub fn resample(&self, width: usize, height: usize) -> FlowField {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let ratio = height as f32 / self.height as f32;
        let xs = axis_taps(self.width, width);
        let ys = axis_taps(self.height, height);
        let mut data = vec![0.0; 2 * width * height];
        for (channel, plane) in [self.dx(), self.dy()].into_iter().enumerate() {
            let out = &mut data[channel * width * height..(channel + 1) * width * height];
            for (oy, &(y0, y1, wy)) in ys.iter().enumerate() {
                for (ox, &(x0, x1, wx)) in xs.iter().enumerate() {
                    let top = plane[y0 * self.width + x0] * (1.0 - wx) + plane[y0 * self.width + x1] * wx;
                    let bottom =
                        plane[y1 * self.width + x0] * (1.0 - wx) + plane[y1 * self.width + x1] * wx;
                    out[oy * width + ox] = (top * (1.0 - wy) + bottom * wy) * ratio;
                }
            }
        }
        FlowField {
            width,
            height,
            data,
        }
    }

    /// Load a `(H, W, 2)` int16 `.npy` artifact, dividing by ten.
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load_npy(path: &Path) -> Result<Self, DataError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DataError::FlowNotFound {
                path: path.to_path_buf(),
            },
            _ => DataError::Io(e),
        })?;
        let malformed = |reason: String| DataError::MalformedFlow {
            path: path.to_path_buf(),
            reason,
        };
        let array = Array3::<i16>::read_npy(BufReader::new(file)).map_err(|e| malformed(e.to_string()))?;
        let flow = Self::from_array(&array).map_err(malformed)?;
        debug!("Loaded flow {}x{}", flow.width, flow.height);
        Ok(flow)
    }

    /// Convert a stored `(H, W, 2)` fixed-point array
    pub fn from_array(array: &Array3<i16>) -> Result<Self, String> {
        let &[height, width, channels] = array.shape() else {
            return Err(format!("expected (H, W, 2), got {:?}", array.shape()));
        };
        if channels != 2 {
            return Err(format!("expected 2 channels, got {channels}"));
        }
        let plane = height * width;
        let mut data = vec![0.0; 2 * plane];
        for ((y, x, c), &v) in array.indexed_iter() {
            data[c * plane + y * width + x] = v as f32 / FLOW_STORAGE_SCALE;
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// The `(H, W, 2)` fixed-point array this field is stored as
    pub fn to_array(&self) -> Array3<i16> {
        let plane = self.width * self.height;
        Array3::from_shape_fn((self.height, self.width, 2), |(y, x, c)| {
            (self.data[c * plane + y * self.width + x] * FLOW_STORAGE_SCALE).round() as i16
        })
    }

    /// Write as an int16 `.npy` artifact
    pub fn save_npy(&self, path: &Path) -> Result<(), DataError> {
        let mut file = BufWriter::new(File::create(path)?);
        self.to_array()
            .write_npy(&mut file)
            .map_err(|e| DataError::MalformedFlow {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        file.flush()?;
        Ok(())
    }
}

/// Per output index: (low source index, high source index, weight of high)
fn axis_taps(input: usize, output: usize) -> Vec<(usize, usize, f32)> {
    let scale = if output > 1 {
        (input as f32 - 1.0) / (output as f32 - 1.0)
    } else {
        0.0
    };
    (0..output)
        .map(|o| {
            let src = o as f32 * scale;
            let lo = (src.floor() as usize).min(input - 1);
            let hi = (lo + 1).min(input - 1);
            (lo, hi, src - lo as f32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npy_decode_scales_and_planarizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_int16_x10.npy");
        // Stored as (H, W, 2) fixed point: pixel (x, y) holds (10x + 5, -10y)
        let stored = Array3::<i16>::from_shape_fn((2, 3, 2), |(y, x, c)| {
            if c == 0 { 10 * x as i16 + 5 } else { -10 * y as i16 }
        });
        stored.write_npy(File::create(&path).unwrap()).unwrap();

        let decoded = FlowField::load_npy(&path).unwrap();
        assert_eq!(decoded.width(), 3);
        assert_eq!(decoded.height(), 2);
        assert_eq!(decoded.at(2, 1), Vec2::new(2.5, -1.0));
        assert_eq!(decoded.at(0, 0), Vec2::new(0.5, 0.0));
    }

    #[test]
    fn test_npy_rejects_wrong_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f32_int16_x10.npy");
        Array3::<f32>::zeros((2, 2, 2))
            .write_npy(File::create(&path).unwrap())
            .unwrap();
        assert!(matches!(
            FlowField::load_npy(&path).unwrap_err(),
            DataError::MalformedFlow { .. }
        ));
    }

    #[test]
    fn test_npy_rejects_wrong_channel_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb_int16_x10.npy");
        Array3::<i16>::zeros((2, 2, 3))
            .write_npy(File::create(&path).unwrap())
            .unwrap();
        match FlowField::load_npy(&path).unwrap_err() {
            DataError::MalformedFlow { reason, .. } => assert!(reason.contains("channels")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_npy_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage_int16_x10.npy");
        std::fs::write(&path, b"not a numpy file").unwrap();
        assert!(matches!(
            FlowField::load_npy(&path).unwrap_err(),
            DataError::MalformedFlow { .. }
        ));
    }

    #[test]
    fn test_load_missing_flow_is_not_found() {
        let err = FlowField::load_npy(Path::new("/nonexistent/flow_int16_x10.npy")).unwrap_err();
        assert!(matches!(err, DataError::FlowNotFound { .. }));
    }

    #[test]
    fn test_save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_int16_x10.npy");
        let flow = FlowField::uniform(4, 3, Vec2::new(1.5, -2.0));
        flow.save_npy(&path).unwrap();
        let loaded = FlowField::load_npy(&path).unwrap();
        assert_eq!(loaded, flow);
    }

    #[test]
    fn test_resample_scales_magnitude_by_height_ratio() {
        let flow = FlowField::uniform(8, 4, Vec2::new(2.0, 4.0));
        let small = flow.resample(4, 2);
        assert_eq!(small.width(), 4);
        assert_eq!(small.height(), 2);
        for y in 0..2 {
            for x in 0..4 {
                let d = small.at(x, y);
                assert!((d.x - 1.0).abs() < 1e-6);
                assert!((d.y - 2.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_resample_align_corners_keeps_endpoints() {
        let flow = FlowField::from_fn(3, 3, |x, _| Vec2::new(x as f32, 0.0));
        let up = flow.resample(5, 3);
        assert!((up.at(0, 0).x - 0.0).abs() < 1e-6);
        assert!((up.at(4, 0).x - 2.0).abs() < 1e-6);
        assert!((up.at(1, 0).x - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(FlowField::new(2, 2, vec![0.0; 7]).is_err());
    }
}
