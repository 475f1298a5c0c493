pub mod local;
pub mod mlflow;

pub use local::LocalTracker;
pub use mlflow::MlflowTracker;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{PathSettings, TrackingSettings};
use crate::error::Result;

/// One scalar observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    pub step: i64,
}

impl Metric {
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self { key: key.into(), value, step: 0 }
    }

    pub fn at_step(key: impl Into<String>, value: f64, step: i64) -> Self {
        Self { key: key.into(), value, step }
    }
}

/// Experiment tracking backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Open a run and return its id
    async fn start_run(&self, experiment: &str, run_name: &str) -> Result<String>;
    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()>;
    async fn log_metrics(&self, run_id: &str, metrics: &[Metric]) -> Result<()>;
    async fn end_run(&self, run_id: &str, succeeded: bool) -> Result<()>;
}

/// A complete run, recorded after the work it describes has finished
#[derive(Debug, Clone, Default)]
pub struct RunRecord {
    pub experiment: String,
    pub name: String,
    pub params: Vec<(String, String)>,
    pub metrics: Vec<Metric>,
    pub succeeded: bool,
}

/// Send `run` to the tracker. Failures are logged and otherwise ignored.
pub async fn record(tracker: &dyn Tracker, run: &RunRecord) -> Option<String> {
    match try_record(tracker, run).await {
        Ok(run_id) => {
            debug!("Tracked run {} ({}) in '{}'", run.name, run_id, run.experiment);
            Some(run_id)
        }
        Err(e) => {
            warn!("Experiment tracking failed for run {}: {}", run.name, e);
            None
        }
    }
}

async fn try_record(tracker: &dyn Tracker, run: &RunRecord) -> Result<String> {
    let run_id = tracker.start_run(&run.experiment, &run.name).await?;
    if !run.params.is_empty() {
        tracker.log_params(&run_id, &run.params).await?;
    }
    if !run.metrics.is_empty() {
        tracker.log_metrics(&run_id, &run.metrics).await?;
    }
    tracker.end_run(&run_id, run.succeeded).await?;
    Ok(run_id)
}

/// MLflow when a tracking URI is configured, local JSONL files otherwise
pub fn from_settings(tracking: &TrackingSettings, paths: &PathSettings) -> Box<dyn Tracker> {
    match tracking.uri.as_deref().filter(|uri| !uri.trim().is_empty()) {
        Some(uri) => Box::new(MlflowTracker::new(uri)),
        None => Box::new(LocalTracker::new(paths.local_runs_dir.clone())),
    }
}
