use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{Metric, Tracker};
use crate::error::Result;

/// Appends each run as a JSON-lines file under `<root>/<run_id>.jsonl`
#[derive(Debug, Clone)]
pub struct LocalTracker {
    root: PathBuf,
}

impl LocalTracker {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", run_id))
    }

    async fn append(&self, run_id: &str, event: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_path(run_id))
            .await?;
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Tracker for LocalTracker {
    async fn start_run(&self, experiment: &str, run_name: &str) -> Result<String> {
        let run_id = Uuid::new_v4().simple().to_string();
        self.append(
            &run_id,
            json!({
                "event": "start",
                "experiment": experiment,
                "run_name": run_name,
                "time": Utc::now().to_rfc3339(),
            }),
        )
        .await?;
        Ok(run_id)
    }

    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()> {
        for (key, value) in params {
            self.append(run_id, json!({ "event": "param", "key": key, "value": value })).await?;
        }
        Ok(())
    }

    async fn log_metrics(&self, run_id: &str, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            self.append(
                run_id,
                json!({ "event": "metric", "key": metric.key, "value": metric.value, "step": metric.step }),
            )
            .await?;
        }
        Ok(())
    }

    async fn end_run(&self, run_id: &str, succeeded: bool) -> Result<()> {
        let status = if succeeded { "FINISHED" } else { "FAILED" };
        self.append(
            run_id,
            json!({ "event": "end", "status": status, "time": Utc::now().to_rfc3339() }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{record, RunRecord};

    #[tokio::test]
    async fn test_run_is_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = LocalTracker::new(dir.path().join("mlruns"));

        let run = RunRecord {
            experiment: "weather_incremental_training".into(),
            name: "Inc_s24_h6_ep30_bs8".into(),
            params: vec![("seq_len".into(), "24".into()), ("horizon".into(), "6".into())],
            metrics: vec![Metric::at_step("mse_inc", 0.5, 1), Metric::at_step("mse_inc", 0.25, 2)],
            succeeded: true,
        };
        let run_id = record(&tracker, &run).await.unwrap();

        let text = std::fs::read_to_string(tracker.run_path(&run_id)).unwrap();
        let events: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(events.len(), 6);
        assert_eq!(events[0]["run_name"], "Inc_s24_h6_ep30_bs8");
        assert_eq!(events[1]["key"], "seq_len");
        assert_eq!(events[4]["value"], 0.25);
        assert_eq!(events[5]["status"], "FINISHED");
    }
}
