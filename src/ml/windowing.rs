use anyhow::{anyhow, Result};
use ndarray::{s, Array2, Array3, Axis};

use super::scaler::ScalerState;
use crate::types::Series;

/// Model-ready samples: scaled input windows and their horizon-shifted targets
#[derive(Debug, Clone)]
pub struct WindowedDataset {
    /// (samples, seq_len, features)
    pub x: Array3<f64>,
    /// (samples, targets)
    pub y: Array2<f64>,
}

impl WindowedDataset {
    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gather the samples at `indices` into a mini-batch
    pub fn batch(&self, indices: &[usize]) -> (Array3<f64>, Array2<f64>) {
        (self.x.select(Axis(0), indices), self.y.select(Axis(0), indices))
    }
}

/// Build windows of `seq_len` scaled feature rows, each paired with the targets
/// observed `horizon` steps after the window's last row
///
/// Rows without a shifted target (the last `horizon`) and rows with missing
/// values are dropped first. A series with `n` clean rows yields
/// `n - seq_len - horizon` windows, or none when it is too short.
pub fn window(
    series: &Series,
    feature_order: &[String],
    target_order: &[String],
    horizon: usize,
    seq_len: usize,
    scaler: &ScalerState,
) -> Result<WindowedDataset> {
    if seq_len == 0 {
        return Err(anyhow!("seq_len must be > 0"));
    }

    let features = series.select(feature_order)?;
    let targets = series.select(target_order)?;
    let n = series.len();

    let kept: Vec<usize> = (0..n.saturating_sub(horizon))
        .filter(|&i| {
            features.row(i).iter().all(|v| v.is_finite())
                && targets.row(i + horizon).iter().all(|v| v.is_finite())
        })
        .collect();

    let shifted_indices: Vec<usize> = kept.iter().map(|&i| i + horizon).collect();
    let kept_features = scaler.transform(&features.select(Axis(0), &kept))?;
    let kept_targets = targets.select(Axis(0), &shifted_indices);

    let n_windows = kept.len().saturating_sub(seq_len);
    let mut x = Array3::<f64>::zeros((n_windows, seq_len, feature_order.len()));
    let mut y = Array2::<f64>::zeros((n_windows, target_order.len()));

    for j in 0..n_windows {
        x.slice_mut(s![j, .., ..])
            .assign(&kept_features.slice(s![j..j + seq_len, ..]));
        y.row_mut(j).assign(&kept_targets.row(j + seq_len - 1));
    }

    Ok(WindowedDataset { x, y })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_series(rows: usize) -> (Series, Vec<String>) {
        let names = vec!["temperature".to_string(), "humidity".to_string()];
        let values = Array2::from_shape_fn((rows, 2), |(i, j)| (i * 10 + j) as f64);
        (Series::new(names.clone(), values).unwrap(), names)
    }

    #[test]
    fn test_window_count_matches_length() {
        let (series, names) = ramp_series(40);
        let scaler = ScalerState::identity(2);
        let data = window(&series, &names, &names, 6, 24, &scaler).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(data.x.dim(), (10, 24, 2));
        assert_eq!(data.y.dim(), (10, 2));
    }

    #[test]
    fn test_exact_fit_yields_no_windows() {
        let (series, names) = ramp_series(30);
        let scaler = ScalerState::identity(2);
        let data = window(&series, &names, &names, 6, 24, &scaler).unwrap();
        assert!(data.is_empty());

        let (short, _) = ramp_series(5);
        assert!(window(&short, &names, &names, 6, 24, &scaler).unwrap().is_empty());
    }

    #[test]
    fn test_target_is_shifted_from_last_window_row() {
        let (series, names) = ramp_series(12);
        let scaler = ScalerState::identity(2);
        let data = window(&series, &names, &names, 2, 3, &scaler).unwrap();
        assert_eq!(data.len(), 7);

        // window 0 covers rows 0..3, target comes from row 2 + 2
        assert_eq!(data.x[[0, 2, 0]], 20.0);
        assert_eq!(data.y[[0, 0]], 40.0);
        assert_eq!(data.y[[0, 1]], 41.0);
        assert_eq!(data.x[[6, 0, 0]], 60.0);
        assert_eq!(data.y[[6, 0]], 100.0);
    }

    #[test]
    fn test_scaler_applied_to_features_only() {
        let (series, names) = ramp_series(10);
        let scaler = ScalerState { mean: vec![10.0, 0.0], scale: vec![2.0, 1.0] };
        let data = window(&series, &names, &names, 1, 2, &scaler).unwrap();
        assert_eq!(data.x[[0, 0, 0]], -5.0);
        assert_eq!(data.x[[0, 1, 0]], 0.0);
        assert_eq!(data.y[[0, 0]], 20.0);
    }

    #[test]
    fn test_rows_with_gaps_are_dropped() {
        let (series, names) = ramp_series(12);
        let mut values = series.select(&names).unwrap();
        values[[3, 1]] = f64::NAN;
        let series = Series::new(names.clone(), values).unwrap();

        let scaler = ScalerState::identity(2);
        let data = window(&series, &names, &names, 2, 3, &scaler).unwrap();
        // row 3 lacks a feature and row 1 loses its shifted target
        assert_eq!(data.len(), 5);
        assert!(data.x.iter().all(|v| v.is_finite()));
        assert!(data.y.iter().all(|v| v.is_finite()));
    }
}
