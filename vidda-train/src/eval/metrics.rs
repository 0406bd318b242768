//! Confusion histogram and IoU

/// Label-by-prediction counts over `num_classes` classes
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Count `(label, prediction)` pairs; labels outside `[0, C)` are skipped
    pub fn update(&mut self, labels: &[u32], predictions: &[u32]) {
        let n = self.num_classes;
        for (&label, &pred) in labels.iter().zip(predictions) {
            let (label, pred) = (label as usize, pred as usize);
            if label < n && pred < n {
                self.counts[label * n + pred] += 1;
            }
        }
    }

    /// Count for ground truth `label` predicted as `prediction`
    pub fn count(&self, label: usize, prediction: usize) -> u64 {
        self.counts[label * self.num_classes + prediction]
    }

    /// `diag / (row + col − diag)` per class; NaN for classes never seen
    pub fn per_class_iou(&self) -> Vec<f64> {
        let n = self.num_classes;
        (0..n)
            .map(|c| {
                let tp = self.count(c, c) as f64;
                let row: u64 = (0..n).map(|p| self.count(c, p)).sum();
                let col: u64 = (0..n).map(|l| self.count(l, c)).sum();
                let union = row as f64 + col as f64 - tp;
                if union == 0.0 { f64::NAN } else { tp / union }
            })
            .collect()
    }
}

/// Mean of the non-NaN IoUs in percent, rounded to two decimals
pub fn mean_iou(ious: &[f64]) -> f64 {
    let valid: Vec<f64> = ious.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return f64::NAN;
    }
    let mean = valid.iter().sum::<f64>() / valid.len() as f64;
    (mean * 100.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_prediction() {
        let mut hist = ConfusionMatrix::new(3);
        hist.update(&[0, 1, 2, 2], &[0, 1, 2, 2]);
        assert_eq!(hist.per_class_iou(), vec![1.0, 1.0, 1.0]);
        assert_eq!(mean_iou(&hist.per_class_iou()), 100.0);
    }

    #[test]
    fn test_iou_and_ignored_labels() {
        let mut hist = ConfusionMatrix::new(2);
        // class 0: tp 1, fn 1, fp 0 -> 0.5; class 1: tp 1, fp 1 -> 0.5
        hist.update(&[0, 0, 1, 255], &[0, 1, 1, 0]);
        assert_eq!(hist.count(0, 1), 1);
        let ious = hist.per_class_iou();
        assert_eq!(ious, vec![0.5, 0.5]);
        assert_eq!(mean_iou(&ious), 50.0);
    }

    #[test]
    fn test_unseen_class_is_nan_and_skipped() {
        let mut hist = ConfusionMatrix::new(3);
        hist.update(&[0, 1], &[0, 0]);
        let ious = hist.per_class_iou();
        assert!(ious[2].is_nan());
        // class 0: 1 / 2, class 1: 0
        assert_eq!(mean_iou(&ious), 25.0);
        assert!(mean_iou(&[f64::NAN]).is_nan());
    }

    #[test]
    fn test_mean_iou_rounds_to_two_decimals() {
        assert_eq!(mean_iou(&[1.0 / 3.0]), 33.33);
    }
}
