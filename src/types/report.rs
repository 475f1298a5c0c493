use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metrics of one model on one test case, with the per-sample predictions behind them
#[derive(Debug, Clone)]
pub struct MetricRow {
    pub model: String,
    pub case: String,
    pub horizon: usize,
    pub mae: f64,
    pub rmse: f64,
    pub targets: Vec<String>,
    /// (samples, targets) in the order of `targets`
    pub y_true: Array2<f64>,
    pub y_pred: Array2<f64>,
}

impl MetricRow {
    pub fn samples(&self) -> usize {
        self.y_true.nrows()
    }
}

/// Per-model mean error across all evaluated cases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub model: String,
    pub mae: f64,
    pub rmse: f64,
}

/// The selected model and the score it was selected on
#[derive(Debug, Clone, PartialEq)]
pub struct ChampionManifest {
    pub model: String,
    pub rmse: f64,
}

impl fmt::Display for ChampionManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Best Model: {}\nRMSE: {:.4}", self.model, self.rmse)
    }
}
