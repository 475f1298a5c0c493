use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::GridSettings;

/// One point of the hyperparameter grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HyperParams {
    pub seq_len: usize,
    pub horizon: usize,
    pub epochs: usize,
    pub batch_size: usize,
}

impl HyperParams {
    pub fn new(seq_len: usize, horizon: usize, epochs: usize, batch_size: usize) -> Self {
        Self { seq_len, horizon, epochs, batch_size }
    }

    /// Stable name used as the checkpoint identity, e.g. `s24_h6_ep30_bs8`
    pub fn name(&self) -> String {
        format!(
            "s{}_h{}_ep{}_bs{}",
            self.seq_len, self.horizon, self.epochs, self.batch_size
        )
    }

    /// Checkpoint file name for this configuration
    pub fn file_name(&self) -> String {
        format!("{}.json", self.name())
    }

    /// Key/value view for experiment tracking
    pub fn as_params(&self) -> Vec<(String, String)> {
        vec![
            ("seq_len".to_string(), self.seq_len.to_string()),
            ("horizon".to_string(), self.horizon.to_string()),
            ("epochs".to_string(), self.epochs.to_string()),
            ("batch_size".to_string(), self.batch_size.to_string()),
        ]
    }
}

impl fmt::Display for HyperParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq_len={}, horizon={}, epochs={}, batch_size={}",
            self.seq_len, self.horizon, self.epochs, self.batch_size
        )
    }
}

/// Cartesian product of the grid in seq_len, horizon, epochs, batch_size order
pub fn expand_grid(grid: &GridSettings) -> Vec<HyperParams> {
    let mut configs = Vec::with_capacity(
        grid.seq_lens.len() * grid.horizons.len() * grid.epochs.len() * grid.batch_sizes.len(),
    );
    for &seq_len in &grid.seq_lens {
        for &horizon in &grid.horizons {
            for &epochs in &grid.epochs {
                for &batch_size in &grid.batch_sizes {
                    configs.push(HyperParams::new(seq_len, horizon, epochs, batch_size));
                }
            }
        }
    }
    configs
}
