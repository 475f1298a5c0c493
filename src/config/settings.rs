use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::CANONICAL_FIELDS;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub grid: GridSettings,
    pub training: TrainingSettings,
    pub paths: PathSettings,
    pub storage: StorageSettings,
    pub tracking: TrackingSettings,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Grid validation
        let dims = [
            ("grid.seq_lens", &self.grid.seq_lens),
            ("grid.horizons", &self.grid.horizons),
            ("grid.epochs", &self.grid.epochs),
            ("grid.batch_sizes", &self.grid.batch_sizes),
        ];
        for (name, values) in dims {
            if values.is_empty() {
                errors.push(format!("{} must not be empty", name));
            }
            if values.iter().any(|&v| v == 0) {
                errors.push(format!("{} values must be > 0", name));
            }
        }

        // Training validation
        if !self.training.learning_rate.is_finite() || self.training.learning_rate <= 0.0 {
            errors.push("training.learning_rate must be a positive number".to_string());
        }
        if self.training.top_k == 0 {
            errors.push("training.top_k must be > 0".to_string());
        }
        if self.training.max_parallel == 0 {
            errors.push("training.max_parallel must be > 0".to_string());
        }
        if self.training.features.is_empty() {
            errors.push("training.features must not be empty".to_string());
        }
        if self.training.targets.is_empty() {
            errors.push("training.targets must not be empty".to_string());
        }
        if has_duplicates(&self.training.features) {
            errors.push("training.features contains duplicate names".to_string());
        }
        if has_duplicates(&self.training.targets) {
            errors.push("training.targets contains duplicate names".to_string());
        }

        // Storage validation
        if self.storage.bucket.is_empty() {
            errors.push("storage.bucket must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn has_duplicates(names: &[String]) -> bool {
    let mut seen = std::collections::HashSet::new();
    names.iter().any(|n| !seen.insert(n.as_str()))
}

/// Hyperparameter value sets; the grid is their cartesian product
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    pub seq_lens: Vec<usize>,
    pub horizons: Vec<usize>,
    pub epochs: Vec<usize>,
    pub batch_sizes: Vec<usize>,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            seq_lens: vec![24],
            horizons: vec![6, 12],
            epochs: vec![30, 50],
            batch_sizes: vec![8, 16, 32],
        }
    }
}

/// What to do when an output checkpoint name already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Replace the existing file
    #[default]
    Overwrite,
    /// Keep the existing file and write `<name>.vN.json`
    Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub features: Vec<String>,
    pub targets: Vec<String>,
    pub learning_rate: f64,
    pub top_k: usize,
    pub seed: u64,
    pub max_parallel: usize,
    pub collision_policy: CollisionPolicy,
    /// Stop a configuration after the running epoch once this many seconds elapsed
    pub max_wall_clock_secs: Option<u64>,
    pub log_every: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        let fields: Vec<String> = CANONICAL_FIELDS.iter().map(|s| s.to_string()).collect();
        Self {
            features: fields.clone(),
            targets: fields,
            learning_rate: 1e-4,
            top_k: 3,
            seed: 42,
            max_parallel: 1,
            collision_policy: CollisionPolicy::Overwrite,
            max_wall_clock_secs: None,
            log_every: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub daily_dir: PathBuf,
    pub base_checkpoint: PathBuf,
    pub models_dir: PathBuf,
    pub candidates_dir: PathBuf,
    pub training_log_dir: PathBuf,
    pub test_data_dir: PathBuf,
    pub case_log_dir: PathBuf,
    pub eval_log_dir: PathBuf,
    pub champion_dir: PathBuf,
    pub local_runs_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            daily_dir: PathBuf::from("dataset_daily"),
            base_checkpoint: PathBuf::from("current_model/model.json"),
            models_dir: PathBuf::from("models_incremental"),
            candidates_dir: PathBuf::from("top3_models_incremental"),
            training_log_dir: PathBuf::from("training_logs"),
            test_data_dir: PathBuf::from("dataset_test"),
            case_log_dir: PathBuf::from("test_logs"),
            eval_log_dir: PathBuf::from("evaluation_logs"),
            champion_dir: PathBuf::from("best_model_final"),
            local_runs_dir: PathBuf::from("mlruns"),
        }
    }
}

impl PathSettings {
    pub fn training_log(&self) -> PathBuf {
        self.training_log_dir.join("incremental_results.log")
    }

    pub fn summary_table(&self) -> PathBuf {
        self.eval_log_dir.join("evaluation_summary.csv")
    }

    pub fn case_table(&self, case_name: &str) -> PathBuf {
        self.case_log_dir.join(format!("{}_result.csv", case_name))
    }

    pub fn production_checkpoint(&self) -> PathBuf {
        self.champion_dir.join("weather_model_production.json")
    }

    pub fn champion_manifest(&self) -> PathBuf {
        self.champion_dir.join("model_info.txt")
    }

    /// Local file the fetched daily dataset is stored under
    pub fn fetched_dataset(&self) -> PathBuf {
        self.daily_dir.join("dataset.csv")
    }

    /// Directories uploaded by the publish stage
    pub fn artifact_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.candidates_dir.clone(),
            self.models_dir.clone(),
            self.champion_dir.clone(),
            self.eval_log_dir.clone(),
            self.test_data_dir.clone(),
            self.case_log_dir.clone(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub data_prefix: String,
    pub model_prefix: String,
    pub test_prefix: String,
    pub archive_prefix: String,
    pub production_key: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "devopsproject".to_string(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            data_prefix: "dataset_daily/".to_string(),
            model_prefix: "current_model/".to_string(),
            test_prefix: "dataset_test/".to_string(),
            archive_prefix: "data_all_train".to_string(),
            production_key: "current_model/model.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// MLflow server; runs are written to local JSONL files when unset
    pub uri: Option<String>,
    pub training_experiment: String,
    pub evaluation_experiment: String,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            uri: None,
            training_experiment: "weather_incremental_training".to_string(),
            evaluation_experiment: "weather_evaluation".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.training.features.len(), 13);
        assert_eq!(config.training.features, config.training.targets);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = PipelineConfig::default();
        config.grid.horizons.clear();
        config.grid.batch_sizes = vec![8, 0];
        config.training.top_k = 0;
        config.training.targets = vec!["cloud".into(), "cloud".into()];

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("grid.horizons")));
        assert!(errors.iter().any(|e| e.contains("grid.batch_sizes")));
        assert!(errors.iter().any(|e| e.contains("top_k")));
        assert!(errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn test_fixed_artifact_paths() {
        let paths = PathSettings::default();
        assert_eq!(
            paths.production_checkpoint(),
            PathBuf::from("best_model_final/weather_model_production.json")
        );
        assert_eq!(paths.case_table("case_2"), PathBuf::from("test_logs/case_2_result.csv"));
        assert_eq!(paths.artifact_dirs().len(), 6);
    }
}
