use anyhow::{Context, Result};
use chrono::Local;
use std::path::Path;
use tracing::{info, warn};

use super::WorkOutcome;
use crate::config::PipelineConfig;
use crate::ml::evaluator::{evaluate_case, list_checkpoints, run_batch};
use crate::ml::selection::{select_champion, select_from_summary, Selection};
use crate::ml::trainer::{bootstrap, latest_daily_csv, run_grid, GridReport, TrainedModel};
use crate::storage::{fetch_latest_artifacts, publish_artifacts, FetchReport, ObjectStore, PublishReport, S3Client};
use crate::tracking::{self, Metric, RunRecord, Tracker};
use crate::types::{ChampionManifest, HyperParams, MetricRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Train,
    Evaluate,
    Select,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetch => write!(f, "Fetch"),
            Stage::Train => write!(f, "Train"),
            Stage::Evaluate => write!(f, "Evaluate"),
            Stage::Select => write!(f, "Select"),
            Stage::Publish => write!(f, "Publish"),
        }
    }
}

/// Wires configuration, object storage and experiment tracking into the stages
pub struct Pipeline {
    config: PipelineConfig,
    store: Box<dyn ObjectStore>,
    tracker: Box<dyn Tracker>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let store = S3Client::new(&config.storage).context("Failed to create storage client")?;
        let tracker = tracking::from_settings(&config.tracking, &config.paths);
        Ok(Self::with_collaborators(config, Box::new(store), tracker))
    }

    pub fn with_collaborators(config: PipelineConfig, store: Box<dyn ObjectStore>, tracker: Box<dyn Tracker>) -> Self {
        Self { config, store, tracker }
    }

    pub async fn fetch(&self) -> Result<FetchReport> {
        banner(Stage::Fetch);
        fetch_latest_artifacts(self.store.as_ref(), &self.config.storage, &self.config.paths).await
    }

    /// Train a fresh base checkpoint from `data`
    pub fn bootstrap(&self, data: &Path, config: HyperParams) -> Result<TrainedModel> {
        let series = crate::types::Series::from_csv_path(data)
            .with_context(|| format!("Failed to read {}", data.display()))?;
        bootstrap(&series, config, &self.config.training, &self.config.paths.base_checkpoint)
    }

    /// Fine-tune the grid on the newest daily dataset
    pub async fn train(&self) -> Result<GridReport> {
        banner(Stage::Train);
        let data_path = latest_daily_csv(&self.config.paths.daily_dir)?;
        let report = run_grid(&self.config, &data_path).await?;

        for (hp, outcome) in &report.outcomes {
            let (metrics, succeeded) = match outcome {
                WorkOutcome::Done(model) => (epoch_metrics(model), true),
                WorkOutcome::Failed(_) => (Vec::new(), false),
                WorkOutcome::Skipped(_) => continue,
            };
            let run = RunRecord {
                experiment: self.config.tracking.training_experiment.clone(),
                name: format!("Inc_{}", hp.name()),
                params: hp.as_params(),
                metrics,
                succeeded,
            };
            tracking::record(self.tracker.as_ref(), &run).await;
        }

        Ok(report)
    }

    /// Score one test file against every candidate (`test --data --out-name`)
    pub fn test_case(&self, data: &Path, case: &str) -> Result<Vec<MetricRow>> {
        let paths = &self.config.paths;
        let models = list_checkpoints(&paths.candidates_dir)?;
        fs_create(&paths.case_log_dir)?;
        evaluate_case(&models, data, case, &paths.case_table(case))
    }

    /// Score all candidates on all cases, then select the champion
    pub async fn evaluate(&self) -> Result<Option<Selection>> {
        banner(Stage::Evaluate);
        let batch_name = format!("Eval_Batch_{}", Local::now().format("%Y%m%d_%H%M"));
        let rows = run_batch(&self.config.paths, self.config.training.max_parallel).await?;

        banner(Stage::Select);
        let selection = select_champion(&rows, &self.config.paths)?;
        let Some(selection) = selection else {
            return Ok(None);
        };

        let global = selection.global_avg_rmse();
        info!("Global average RMSE across {} models: {:.4}", selection.summary.len(), global);
        let run = RunRecord {
            experiment: self.config.tracking.evaluation_experiment.clone(),
            name: batch_name,
            metrics: vec![Metric::new("global_avg_rmse", global)],
            succeeded: true,
            ..RunRecord::default()
        };
        tracking::record(self.tracker.as_ref(), &run).await;
        self.track_champion(&selection.champion).await;

        Ok(Some(selection))
    }

    /// Promote the best row of an existing summary table
    pub async fn select(&self) -> Result<Option<ChampionManifest>> {
        banner(Stage::Select);
        let manifest = select_from_summary(&self.config.paths)?;
        if let Some(champion) = &manifest {
            self.track_champion(champion).await;
        }
        Ok(manifest)
    }

    pub async fn publish(&self) -> Result<PublishReport> {
        banner(Stage::Publish);
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        publish_artifacts(self.store.as_ref(), &self.config.storage, &self.config.paths, &timestamp).await
    }

    /// fetch -> train -> evaluate/select -> publish
    pub async fn run(&self) -> Result<()> {
        self.fetch().await?;
        let grid = self.train().await?;
        if grid.top.is_empty() {
            warn!("No configuration produced a checkpoint; evaluating existing candidates");
        }
        if self.evaluate().await?.is_none() {
            warn!("No champion selected; production model left unchanged");
        }
        self.publish().await?;
        info!("Pipeline completed");
        Ok(())
    }

    async fn track_champion(&self, champion: &ChampionManifest) {
        let run = RunRecord {
            experiment: self.config.tracking.evaluation_experiment.clone(),
            name: "Champion_Final".to_string(),
            params: vec![("champion_model".to_string(), champion.model.clone())],
            metrics: vec![Metric::new("best_rmse", champion.rmse)],
            succeeded: true,
        };
        tracking::record(self.tracker.as_ref(), &run).await;
    }
}

fn banner(stage: Stage) {
    info!("=== {} ===", stage);
}

fn epoch_metrics(model: &TrainedModel) -> Vec<Metric> {
    model
        .epoch_losses
        .iter()
        .enumerate()
        .map(|(epoch, &loss)| Metric::at_step("mse_inc", loss, epoch as i64 + 1))
        .collect()
}

fn fs_create(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridSettings;
    use crate::ml::checkpoint::tests::sample_checkpoint;
    use crate::storage::MockObjectStore;
    use crate::tracking::MockTracker;
    use std::fs;
    use std::sync::{Arc, Mutex};

    const NAMES: [&str; 2] = ["temperature", "humidity"];

    fn config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.grid = GridSettings { seq_lens: vec![4], horizons: vec![1], epochs: vec![2, 3], batch_sizes: vec![8] };
        config.training.features = NAMES.iter().map(|s| s.to_string()).collect();
        config.training.targets = config.training.features.clone();
        config.training.top_k = 1;
        let paths = &mut config.paths;
        paths.daily_dir = root.join("dataset_daily");
        paths.base_checkpoint = root.join("current_model/model.json");
        paths.models_dir = root.join("models_incremental");
        paths.candidates_dir = root.join("top3_models_incremental");
        paths.training_log_dir = root.join("training_logs");
        paths.test_data_dir = root.join("dataset_test");
        paths.case_log_dir = root.join("test_logs");
        paths.eval_log_dir = root.join("evaluation_logs");
        paths.champion_dir = root.join("best_model_final");
        config
    }

    fn write_csv(path: &Path, rows: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut text = format!("{}\n", NAMES.join(","));
        for i in 0..rows {
            let t = i as f64 * 0.4;
            text.push_str(&format!("{},{}\n", 15.0 + t.sin(), 70.0 + t.cos()));
        }
        fs::write(path, text).unwrap();
    }

    fn recording_tracker(names: Arc<Mutex<Vec<String>>>) -> MockTracker {
        let mut tracker = MockTracker::new();
        tracker.expect_start_run().returning(move |_, name| {
            names.lock().unwrap().push(name.to_string());
            Ok(format!("run-{}", name))
        });
        tracker.expect_log_params().returning(|_, _| Ok(()));
        tracker.expect_log_metrics().returning(|_, _| Ok(()));
        tracker.expect_end_run().returning(|_, _| Ok(()));
        tracker
    }

    #[tokio::test]
    async fn test_train_evaluate_select_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        sample_checkpoint(&NAMES, HyperParams::new(4, 1, 1, 8), 4)
            .save(&config.paths.base_checkpoint)
            .unwrap();
        write_csv(&config.paths.daily_dir.join("2024-01-01.csv"), 40);
        write_csv(&config.paths.test_data_dir.join("a.csv"), 20);
        write_csv(&config.paths.test_data_dir.join("b.csv"), 25);

        let runs = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::with_collaborators(
            config.clone(),
            Box::new(MockObjectStore::new()),
            Box::new(recording_tracker(Arc::clone(&runs))),
        );

        let grid = pipeline.train().await.unwrap();
        assert_eq!(grid.top.len(), 1);

        let selection = pipeline.evaluate().await.unwrap().unwrap();
        assert_eq!(selection.summary.len(), 1);
        assert_eq!(selection.champion.model, grid.top[0].model_id());
        assert!(config.paths.case_table("case_1").exists());
        assert!(config.paths.case_table("case_2").exists());
        assert!(config.paths.production_checkpoint().exists());

        let names = runs.lock().unwrap().clone();
        assert_eq!(names[0], "Inc_s4_h1_ep2_bs8");
        assert_eq!(names[1], "Inc_s4_h1_ep3_bs8");
        assert!(names[2].starts_with("Eval_Batch_"));
        assert_eq!(names[3], "Champion_Final");
    }

    #[tokio::test]
    async fn test_evaluate_without_candidates_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::create_dir_all(&config.paths.test_data_dir).unwrap();

        let mut tracker = MockTracker::new();
        tracker.expect_start_run().times(0);
        let pipeline = Pipeline::with_collaborators(config.clone(), Box::new(MockObjectStore::new()), Box::new(tracker));

        assert!(pipeline.evaluate().await.unwrap().is_none());
        assert!(!config.paths.summary_table().exists());
    }

    #[tokio::test]
    async fn test_train_requires_daily_data() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::with_collaborators(
            config(dir.path()),
            Box::new(MockObjectStore::new()),
            Box::new(MockTracker::new()),
        );
        assert!(pipeline.train().await.is_err());
    }
}
