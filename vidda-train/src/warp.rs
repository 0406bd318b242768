//! Flow-guided warping of per-pixel maps
//!
//! A [`WarpPlan`] turns a flow field into a per-destination source index
//! once, so the same mapping can be applied to any number of maps (class
//! scores, probabilities, entropies) sharing the grid. Collisions resolve
//! last-writer-wins in raster order, `y` outer and `x` inner.

use crate::error::{TrainError, TrainResult};
use crate::tensor::to_host;
use candle_core::Tensor;
use vidda_data::FlowField;

/// Which way the flow displacement is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarpDirection {
    /// Key-frame values move to `(x - dx, y - dy)`
    #[default]
    Forward,
    /// Values move to `(x + dx, y + dy)`
    Backward,
}

impl WarpDirection {
    fn sign(self) -> f32 {
        match self {
            WarpDirection::Forward => -1.0,
            WarpDirection::Backward => 1.0,
        }
    }
}

/// Destination cell of every source pixel, `None` when it leaves the grid
fn destinations(flow: &FlowField, direction: WarpDirection) -> Vec<Option<usize>> {
    let (w, h) = (flow.width() as i64, flow.height() as i64);
    let sign = direction.sign();
    flow.dx()
        .iter()
        .zip(flow.dy())
        .enumerate()
        .map(|(i, (&dx, &dy))| {
            let x = (i as i64 % w) as f32;
            let y = (i as i64 / w) as f32;
            let tx = (x + sign * dx).round_ties_even();
            let ty = (y + sign * dy).round_ties_even();
            if !(tx.is_finite() && ty.is_finite()) {
                return None;
            }
            let (tx, ty) = (tx as i64, ty as i64);
            ((0..w).contains(&tx) && (0..h).contains(&ty)).then(|| (ty * w + tx) as usize)
        })
        .collect()
}

/// Source pixel selected for every destination of a flow-induced mapping
#[derive(Debug, Clone)]
pub struct WarpPlan {
    width: usize,
    height: usize,
    sources: Vec<Option<usize>>,
}

impl WarpPlan {
    /// Build the mapping for a flow already at the working resolution
    pub fn new(flow: &FlowField, direction: WarpDirection) -> Self {
        let mut sources = vec![None; flow.width() * flow.height()];
        // Raster-order overwrite keeps the last writer
        for (src, dst) in destinations(flow, direction).into_iter().enumerate() {
            if let Some(dst) = dst {
                sources[dst] = Some(src);
            }
        }
        Self {
            width: flow.width(),
            height: flow.height(),
            sources,
        }
    }

    /// Resample a native-resolution flow to `(width, height)` and plan on it
    pub fn at_resolution(
        flow: &FlowField,
        width: usize,
        height: usize,
        direction: WarpDirection,
    ) -> Self {
        Self::new(&flow.resample(width, height), direction)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Source index for destination `(x, y)`
    pub fn source_of(&self, x: usize, y: usize) -> Option<usize> {
        self.sources[y * self.width + x]
    }

    /// Number of destinations that received a value
    pub fn valid_count(&self) -> usize {
        self.sources.iter().filter(|s| s.is_some()).count()
    }

    /// 1.0 where a destination received a value
    pub fn validity(&self) -> Vec<f32> {
        self.sources
            .iter()
            .map(|s| if s.is_some() { 1.0 } else { 0.0 })
            .collect()
    }

    /// Gather every plane of a planar buffer; unmapped cells are zero
    pub fn apply(&self, planes: &[f32]) -> Vec<f32> {
        let plane = self.width * self.height;
        let mut out = vec![0.0; planes.len()];
        for (src_plane, dst_plane) in planes.chunks(plane).zip(out.chunks_mut(plane)) {
            for (dst, src) in dst_plane.iter_mut().zip(&self.sources) {
                if let Some(src) = *src {
                    *dst = src_plane[src];
                }
            }
        }
        out
    }

    fn check_grid(&self, t: &Tensor) -> TrainResult<usize> {
        let (n, _, h, w) = t.dims4()?;
        if (h, w) != (self.height, self.width) {
            return Err(TrainError::Shape(format!(
                "warp plan is {}x{} but map is {}x{}",
                self.width, self.height, w, h
            )));
        }
        Ok(n)
    }

    /// Warp a `[N, C, H, W]` tensor. The result is detached from the graph.
    pub fn warp_tensor(&self, source: &Tensor) -> TrainResult<Tensor> {
        self.check_grid(source)?;
        let host = to_host(source)?;
        let out = Tensor::from_vec(self.apply(&host), source.shape(), source.device())?;
        Ok(out.to_dtype(source.dtype())?)
    }

    /// `[N, 1, H, W]` validity mask on the device of `like`
    pub fn validity_tensor(&self, like: &Tensor) -> TrainResult<Tensor> {
        let n = self.check_grid(like)?;
        let mask = self.validity().repeat(n);
        Ok(Tensor::from_vec(mask, (n, 1, self.height, self.width), like.device())?
            .to_dtype(like.dtype())?)
    }
}

/// A warped map and the cells that received a value
#[derive(Debug, Clone)]
pub struct WarpResult {
    pub reconstructed: Tensor,
    pub validity: Tensor,
}

/// Projects maps through dense flow into another frame's grid
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureWarper {
    direction: WarpDirection,
}

impl FeatureWarper {
    pub fn new(direction: WarpDirection) -> Self {
        Self { direction }
    }

    pub fn direction(&self) -> WarpDirection {
        self.direction
    }

    /// Plan for a map of the given resolution from a native-resolution flow
    pub fn plan(&self, flow: &FlowField, width: usize, height: usize) -> WarpPlan {
        WarpPlan::at_resolution(flow, width, height, self.direction)
    }

    /// Warp `source` (`[N, C, H, W]`) with `flow` resampled to its resolution
    #[tracing::instrument(skip_all, fields(direction = ?self.direction))]
    pub fn warp(&self, source: &Tensor, flow: &FlowField) -> TrainResult<WarpResult> {
        let (_, _, h, w) = source.dims4()?;
        let plan = self.plan(flow, w, h);
        tracing::trace!("warp {}x{}: {} valid cells", w, h, plan.valid_count());
        Ok(WarpResult {
            reconstructed: plan.warp_tensor(source)?,
            validity: plan.validity_tensor(source)?,
        })
    }
}

/// Mask a tensor by validity, broadcasting over classes
pub fn mask_invalid(map: &Tensor, validity: &Tensor) -> TrainResult<Tensor> {
    Ok(map.broadcast_mul(&validity.to_dtype(map.dtype())?)?)
}
