use anyhow::{anyhow, Result};
use ndarray::Array2;

/// Mean absolute error over every element of the prediction matrix
pub fn mae(y_true: &Array2<f64>, y_pred: &Array2<f64>) -> Result<f64> {
    check_shapes(y_true, y_pred)?;
    let total: f64 = y_true.iter().zip(y_pred.iter()).map(|(t, p)| (t - p).abs()).sum();
    Ok(total / y_true.len() as f64)
}

/// Root mean squared error over every element of the prediction matrix
pub fn rmse(y_true: &Array2<f64>, y_pred: &Array2<f64>) -> Result<f64> {
    check_shapes(y_true, y_pred)?;
    let total: f64 = y_true.iter().zip(y_pred.iter()).map(|(t, p)| (t - p).powi(2)).sum();
    Ok((total / y_true.len() as f64).sqrt())
}

fn check_shapes(y_true: &Array2<f64>, y_pred: &Array2<f64>) -> Result<()> {
    if y_true.dim() != y_pred.dim() {
        return Err(anyhow!(
            "Prediction shape {:?} does not match targets {:?}",
            y_pred.dim(),
            y_true.dim()
        ));
    }
    if y_true.is_empty() {
        return Err(anyhow!("Cannot score an empty prediction matrix"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_flattened_errors() {
        let y_true = array![[1.0, 2.0], [3.0, 4.0]];
        let y_pred = array![[2.0, 2.0], [3.0, 1.0]];
        assert!((mae(&y_true, &y_pred).unwrap() - 1.0).abs() < 1e-12);
        assert!((rmse(&y_true, &y_pred).unwrap() - (10.0f64 / 4.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch_and_empty() {
        let y_true = array![[1.0, 2.0]];
        assert!(mae(&y_true, &array![[1.0]]).is_err());
        assert!(rmse(&Array2::zeros((0, 2)), &Array2::zeros((0, 2))).is_err());
    }
}
