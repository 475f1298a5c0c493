use anyhow::{anyhow, Result};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Per-feature standardisation statistics, fit once per lineage
///
/// Incremental training and evaluation only ever call `transform`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl ScalerState {
    /// Fit on the rows of `data` (population std; zero spread maps to 1)
    pub fn fit(data: &Array2<f64>) -> Result<Self> {
        if data.nrows() == 0 {
            return Err(anyhow!("Cannot fit scaler on an empty matrix"));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("Cannot fit scaler on non-finite values"));
        }

        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow!("Cannot fit scaler on an empty matrix"))?;
        let std = data.std_axis(Axis(0), 0.0);
        let scale = std.iter().map(|&s| if s > 1e-12 { s } else { 1.0 }).collect();

        Ok(Self { mean: mean.to_vec(), scale })
    }

    /// Scaler that leaves data unchanged
    pub fn identity(n_features: usize) -> Self {
        Self {
            mean: vec![0.0; n_features],
            scale: vec![1.0; n_features],
        }
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn validate(&self, n_features: usize) -> Result<()> {
        if self.mean.len() != n_features || self.scale.len() != n_features {
            return Err(anyhow!(
                "Scaler dimensioned for {} means / {} scales, expected {} features",
                self.mean.len(),
                self.scale.len(),
                n_features
            ));
        }
        if self.mean.iter().any(|m| !m.is_finite()) {
            return Err(anyhow!("Scaler mean contains non-finite values"));
        }
        if self.scale.iter().any(|&s| !s.is_finite() || s <= 0.0) {
            return Err(anyhow!("Scaler scale must be positive and finite"));
        }
        Ok(())
    }

    /// Apply `(x - mean) / scale` column-wise
    pub fn transform(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
        if data.ncols() != self.n_features() {
            return Err(anyhow!(
                "Scaler expects {} features, data has {}",
                self.n_features(),
                data.ncols()
            ));
        }

        let mut out = data.clone();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (mean, scale) = (self.mean[j], self.scale[j]);
            column.mapv_inplace(|x| (x - mean) / scale);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_fit_and_transform() {
        let data = array![[1.0, 10.0], [3.0, 10.0]];
        let scaler = ScalerState::fit(&data).unwrap();
        assert_eq!(scaler.mean, vec![2.0, 10.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);

        let scaled = scaler.transform(&data).unwrap();
        assert_eq!(scaled, array![[-1.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn test_identity_transform_is_noop() {
        let data = array![[0.5, -1.25], [2.0, 3.0]];
        let scaler = ScalerState::identity(2);
        let once = scaler.transform(&data).unwrap();
        let twice = scaler.transform(&once).unwrap();
        assert_eq!(once, data);
        assert_eq!(twice, data);
    }

    #[test]
    fn test_validate_rejects_bad_dimensions() {
        let scaler = ScalerState { mean: vec![0.0; 3], scale: vec![1.0; 2] };
        assert!(scaler.validate(3).is_err());

        let scaler = ScalerState { mean: vec![0.0; 2], scale: vec![1.0, 0.0] };
        assert!(scaler.validate(2).is_err());

        assert!(ScalerState::identity(4).validate(4).is_ok());
        assert!(ScalerState::identity(4).transform(&Array2::zeros((1, 3))).is_err());
    }
}
