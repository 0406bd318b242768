//! Learning-rate schedules

/// Polynomial decay: `base · (1 − iter / max_iters)^power`, zero past the end
pub fn lr_poly(base_lr: f64, iter: usize, max_iters: usize, power: f64) -> f64 {
    if max_iters == 0 {
        return base_lr;
    }
    let remaining = (1.0 - iter as f64 / max_iters as f64).max(0.0);
    base_lr * remaining.powf(power)
}

/// A polynomial schedule with fixed parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolySchedule {
    pub base_lr: f64,
    pub max_iters: usize,
    pub power: f64,
}

impl PolySchedule {
    pub fn new(base_lr: f64, max_iters: usize, power: f64) -> Self {
        Self {
            base_lr,
            max_iters,
            power,
        }
    }

    pub fn at(&self, iter: usize) -> f64 {
        lr_poly(self.base_lr, iter, self.max_iters, self.power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poly_endpoints() {
        let s = PolySchedule::new(2.5e-4, 100, 0.9);
        assert_eq!(s.at(0), 2.5e-4);
        assert_eq!(s.at(100), 0.0);
        assert_eq!(s.at(150), 0.0);
        let mid = s.at(50);
        assert!((mid - 2.5e-4 * 0.5f64.powf(0.9)).abs() < 1e-12);
    }

    #[test]
    fn test_poly_is_monotonic() {
        let s = PolySchedule::new(1.0, 10, 0.9);
        let lrs: Vec<f64> = (0..=10).map(|i| s.at(i)).collect();
        assert!(lrs.windows(2).all(|w| w[1] <= w[0]));
    }
}
