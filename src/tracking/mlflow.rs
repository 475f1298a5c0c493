use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{Metric, Tracker};
use crate::error::{PipelineError, Result};

/// MLflow tracking server client (REST API 2.0)
#[derive(Debug, Clone)]
pub struct MlflowTracker {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ExperimentResponse {
    experiment: ExperimentInfo,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunResponse {
    run: RunBody,
}

#[derive(Deserialize)]
struct RunBody {
    info: RunInfo,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
}

impl MlflowTracker {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, path)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let url = self.endpoint(path);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Tracking(e.to_string()))?;
        read_json(response, path).await
    }

    /// Look the experiment up by name, creating it when it does not exist
    async fn experiment_id(&self, name: &str) -> Result<String> {
        let url = format!(
            "{}?experiment_name={}",
            self.endpoint("experiments/get-by-name"),
            urlencoding::encode(name)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Tracking(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            let created: CreateExperimentResponse =
                self.post("experiments/create", json!({ "name": name })).await?;
            return Ok(created.experiment_id);
        }
        let found: ExperimentResponse = read_json(response, "experiments/get-by-name").await?;
        Ok(found.experiment.experiment_id)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PipelineError::Tracking(format!("{} returned {}: {}", path, status, body)));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| PipelineError::Tracking(format!("{}: {}", path, e)))
}

#[async_trait]
impl Tracker for MlflowTracker {
    async fn start_run(&self, experiment: &str, run_name: &str) -> Result<String> {
        let experiment_id = self.experiment_id(experiment).await?;
        let body = json!({
            "experiment_id": experiment_id,
            "run_name": run_name,
            "start_time": Utc::now().timestamp_millis(),
            "tags": [{ "key": "mlflow.runName", "value": run_name }],
        });
        let created: RunResponse = self.post("runs/create", body).await?;
        Ok(created.run.info.run_id)
    }

    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()> {
        let params: Vec<Value> = params
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        let _: Value = self.post("runs/log-batch", json!({ "run_id": run_id, "params": params })).await?;
        Ok(())
    }

    async fn log_metrics(&self, run_id: &str, metrics: &[Metric]) -> Result<()> {
        let timestamp = Utc::now().timestamp_millis();
        let metrics: Vec<Value> = metrics
            .iter()
            .map(|m| json!({ "key": m.key, "value": m.value, "timestamp": timestamp, "step": m.step }))
            .collect();
        let _: Value = self.post("runs/log-batch", json!({ "run_id": run_id, "metrics": metrics })).await?;
        Ok(())
    }

    async fn end_run(&self, run_id: &str, succeeded: bool) -> Result<()> {
        let status = if succeeded { "FINISHED" } else { "FAILED" };
        let body = json!({
            "run_id": run_id,
            "status": status,
            "end_time": Utc::now().timestamp_millis(),
        });
        let _: Value = self.post("runs/update", body).await?;
        Ok(())
    }
}
