use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::scaler::ScalerState;
use super::tcn::{Tcn, TcnParams};
use crate::config::CollisionPolicy;
use crate::error::{CheckpointError, PipelineError};
use crate::types::HyperParams;

/// Everything needed to reproduce inference from one trained model
///
/// Feature and target order are part of the record: the scaler statistics and
/// the network's input/output channels are indexed by them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub params: TcnParams,
    pub features: Vec<String>,
    pub targets: Vec<String>,
    pub seq_len: usize,
    pub horizon: usize,
    pub scaler: ScalerState,
    pub config: HyperParams,
}

impl Checkpoint {
    pub fn model(&self) -> Tcn {
        Tcn::new(self.params.clone())
    }

    pub fn validate(&self) -> Result<(), CheckpointError> {
        let invalid = |msg: String| Err(CheckpointError::Invalid(msg));

        if self.features.is_empty() {
            return invalid("feature list is empty".to_string());
        }
        if self.targets.is_empty() {
            return invalid("target list is empty".to_string());
        }
        if self.seq_len == 0 {
            return invalid("seq_len must be > 0".to_string());
        }
        if self.config.seq_len != self.seq_len || self.config.horizon != self.horizon {
            return invalid(format!(
                "config (seq_len={}, horizon={}) disagrees with record (seq_len={}, horizon={})",
                self.config.seq_len, self.config.horizon, self.seq_len, self.horizon
            ));
        }
        if let Err(e) = self.scaler.validate(self.features.len()) {
            return invalid(e.to_string());
        }
        if let Err(e) = self.params.validate(self.features.len(), self.targets.len()) {
            return invalid(e.to_string());
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        debug!("Saved checkpoint to {}", path.display());
        Ok(())
    }

    /// Read and validate a checkpoint; every field is mandatory
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let bytes = fs::read(path).map_err(|source| CheckpointError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }
}

/// Where the checkpoint for `config` is written under `dir`
///
/// `Overwrite` always returns `<name>.json`; `Version` picks the first free
/// `<name>.vN.json` (N >= 2) when `<name>.json` already exists.
pub fn output_path(dir: &Path, config: &HyperParams, policy: CollisionPolicy) -> PathBuf {
    let primary = dir.join(config.file_name());
    match policy {
        CollisionPolicy::Overwrite => primary,
        CollisionPolicy::Version => {
            if !primary.exists() {
                return primary;
            }
            (2..)
                .map(|n| dir.join(format!("{}.v{}.json", config.name(), n)))
                .find(|candidate| !candidate.exists())
                .unwrap_or(primary)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn sample_checkpoint(names: &[&str], config: HyperParams, seed: u64) -> Checkpoint {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        Checkpoint {
            params: TcnParams::init(names.len(), names.len(), &mut rng),
            features: names.clone(),
            targets: names.clone(),
            seq_len: config.seq_len,
            horizon: config.horizon,
            scaler: ScalerState {
                mean: (0..names.len()).map(|i| i as f64 * 0.5).collect(),
                scale: (0..names.len()).map(|i| 1.0 + i as f64 * 0.25).collect(),
            },
            config,
        }
    }

    #[test]
    fn test_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/model.json");
        let checkpoint = sample_checkpoint(&["temperature", "humidity", "cloud"], HyperParams::new(4, 2, 3, 2), 11);

        checkpoint.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);

        let x = Array3::from_shape_fn((3, 4, 3), |(i, t, f)| (i + t + f) as f64 / 7.0);
        let before = checkpoint.model().predict(&x).unwrap();
        let after = loaded.model().predict(&x).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Checkpoint::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let checkpoint = sample_checkpoint(&["cloud"], HyperParams::new(4, 2, 3, 2), 1);
        let mut value = serde_json::to_value(&checkpoint).unwrap();
        value.as_object_mut().unwrap().remove("scaler");
        fs::write(&path, value.to_string()).unwrap();

        let err = Checkpoint::load(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed { .. }));
    }

    #[test]
    fn test_scaler_length_mismatch_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let mut checkpoint = sample_checkpoint(&["cloud", "uv_index"], HyperParams::new(4, 2, 3, 2), 1);
        checkpoint.scaler.mean.pop();
        checkpoint.save(&path).unwrap();

        let err = Checkpoint::load(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
    }

    #[test]
    fn test_feature_count_mismatch_is_invalid() {
        let mut checkpoint = sample_checkpoint(&["cloud", "uv_index"], HyperParams::new(4, 2, 3, 2), 1);
        checkpoint.features.push("pressure".to_string());
        checkpoint.scaler = ScalerState::identity(3);
        assert!(checkpoint.validate().is_err());
    }

    #[test]
    fn test_output_path_policies() {
        let dir = tempfile::tempdir().unwrap();
        let config = HyperParams::new(24, 6, 30, 8);

        let first = output_path(dir.path(), &config, CollisionPolicy::Version);
        assert_eq!(first, dir.path().join("s24_h6_ep30_bs8.json"));
        fs::write(&first, "{}").unwrap();

        assert_eq!(output_path(dir.path(), &config, CollisionPolicy::Overwrite), first);
        let second = output_path(dir.path(), &config, CollisionPolicy::Version);
        assert_eq!(second, dir.path().join("s24_h6_ep30_bs8.v2.json"));
    }
}
