use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::checkpoint::Checkpoint;
use super::metrics::{mae, rmse};
use super::windowing::window;
use crate::config::PathSettings;
use crate::engine::{dispatch, OutcomeTally, WorkOutcome};
use crate::error::SkipReason;
use crate::types::{MetricRow, Series};

/// Score one checkpoint on one test series
///
/// Everything needed for inference comes from the checkpoint itself; the
/// scaler is only ever applied, never refit.
pub fn evaluate(checkpoint: &Checkpoint, model_id: &str, test: &Series, case: &str) -> WorkOutcome<MetricRow> {
    let mut wanted = checkpoint.features.clone();
    wanted.extend(checkpoint.targets.iter().cloned());
    let missing = test.missing_columns(&wanted);
    if !missing.is_empty() {
        warn!("[{} / {}] Test data lacks columns {:?}. Skipping.", model_id, case, missing);
        return WorkOutcome::Skipped(SkipReason::MissingColumns(missing));
    }

    let data = match window(
        test,
        &checkpoint.features,
        &checkpoint.targets,
        checkpoint.horizon,
        checkpoint.seq_len,
        &checkpoint.scaler,
    ) {
        Ok(data) => data,
        Err(e) => return WorkOutcome::Failed(format!("windowing failed: {:#}", e)),
    };
    if data.is_empty() {
        let reason = SkipReason::NoWindows {
            rows: test.len(),
            seq_len: checkpoint.seq_len,
            horizon: checkpoint.horizon,
        };
        debug!("[{} / {}] {}", model_id, case, reason);
        return WorkOutcome::Skipped(reason);
    }

    let scored = checkpoint.model().predict(&data.x).and_then(|y_pred| {
        let mae = mae(&data.y, &y_pred)?;
        let rmse = rmse(&data.y, &y_pred)?;
        Ok((y_pred, mae, rmse))
    });
    match scored {
        Ok((y_pred, mae, rmse)) => {
            debug!("[{} / {}] {} samples, MAE {:.4}, RMSE {:.4}", model_id, case, data.len(), mae, rmse);
            WorkOutcome::Done(MetricRow {
                model: model_id.to_string(),
                case: case.to_string(),
                horizon: checkpoint.horizon,
                mae,
                rmse,
                targets: checkpoint.targets.clone(),
                y_true: data.y,
                y_pred,
            })
        }
        Err(e) => WorkOutcome::Failed(format!("inference failed: {:#}", e)),
    }
}

/// Load the checkpoint at `path` and score it; a bad checkpoint skips this model only
pub fn evaluate_path(path: &Path, test: &Series, case: &str) -> WorkOutcome<MetricRow> {
    let model_id = file_name(path);
    match Checkpoint::load(path) {
        Ok(checkpoint) => evaluate(&checkpoint, &model_id, test, case),
        Err(e) => {
            error!("[{} / {}] {}", model_id, case, e);
            WorkOutcome::Skipped(SkipReason::BadCheckpoint(e.to_string()))
        }
    }
}

/// Score every model on one test file and write that case's detail table
pub fn evaluate_case(models: &[PathBuf], test_path: &Path, case: &str, out_path: &Path) -> Result<Vec<MetricRow>> {
    let test = Series::from_csv_path(test_path)
        .with_context(|| format!("Failed to read test data {}", test_path.display()))?;

    let rows: Vec<MetricRow> = models
        .iter()
        .filter_map(|path| evaluate_path(path, &test, case).into_done())
        .collect();

    if rows.is_empty() {
        warn!("[{}] No model produced results", case);
    } else {
        write_case_table(out_path, &rows)?;
        info!("Testing completed for {} models. Results saved at: {}", models.len(), out_path.display());
    }
    Ok(rows)
}

/// Score every candidate on every test case
///
/// Clears the per-case log directory first. Cases are the test CSVs in name
/// order, called `case_1`, `case_2`, ... Pairs that produce no result are
/// left out rather than padded.
pub async fn run_batch(paths: &PathSettings, max_parallel: usize) -> Result<Vec<MetricRow>> {
    if !paths.test_data_dir.is_dir() {
        return Err(anyhow!("Test data directory {} does not exist", paths.test_data_dir.display()));
    }

    if paths.case_log_dir.exists() {
        fs::remove_dir_all(&paths.case_log_dir)
            .with_context(|| format!("Failed to clear {}", paths.case_log_dir.display()))?;
    }
    fs::create_dir_all(&paths.case_log_dir)?;
    fs::create_dir_all(&paths.eval_log_dir)?;

    let cases = list_test_cases(&paths.test_data_dir)?;
    let models = list_checkpoints(&paths.candidates_dir)?;
    info!("Evaluating {} models on {} test cases", models.len(), cases.len());

    let mut loaded = Vec::with_capacity(cases.len());
    for (case, path) in &cases {
        match Series::from_csv_path(path) {
            Ok(series) => loaded.push((case.clone(), Arc::new(series))),
            Err(e) => warn!("[{}] Cannot read {}: {}. Skipping case.", case, path.display(), e),
        }
    }

    let items: Vec<(usize, usize)> = (0..loaded.len())
        .flat_map(|c| (0..models.len()).map(move |m| (c, m)))
        .collect();

    let shared_cases = Arc::new(loaded.clone());
    let shared_models = Arc::new(models.clone());
    let outcomes = dispatch(items, max_parallel, move |(c, m)| {
        let (case, series) = &shared_cases[c];
        evaluate_path(&shared_models[m], series, case)
    })
    .await;

    let tally = OutcomeTally::of(outcomes.iter().map(|(_, o)| o));
    info!(
        "Evaluation finished: {} scored, {} skipped, {} failed",
        tally.done, tally.skipped, tally.failed
    );
    for ((c, m), outcome) in &outcomes {
        if let WorkOutcome::Failed(msg) = outcome {
            error!("[{} / {}] {}", file_name(&models[*m]), loaded[*c].0, msg);
        }
    }

    let rows: Vec<MetricRow> = outcomes.into_iter().filter_map(|(_, o)| o.into_done()).collect();
    for (case, _) in &loaded {
        let case_rows: Vec<MetricRow> = rows.iter().filter(|r| &r.case == case).cloned().collect();
        if !case_rows.is_empty() {
            write_case_table(&paths.case_table(case), &case_rows)?;
        }
    }

    Ok(rows)
}

/// Checkpoint files in `dir`, sorted by name
pub fn list_checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
    list_files(dir, "json")
}

/// Test CSVs in `dir` sorted by name and labelled `case_1`, `case_2`, ...
pub fn list_test_cases(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    Ok(list_files(dir, "csv")?
        .into_iter()
        .enumerate()
        .map(|(i, path)| (format!("case_{}", i + 1), path))
        .collect())
}

fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        warn!("Directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == extension))
        .collect();
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Write one line per evaluated sample:
/// `model, horizon, mae, rmse, <t>_true, <t>_pred, ...`
///
/// Target columns are the union of all rows' targets in first-seen order;
/// a model without a given target leaves those cells empty.
pub fn write_case_table(path: &Path, rows: &[MetricRow]) -> Result<()> {
    let mut targets: Vec<&str> = Vec::new();
    for row in rows {
        for t in &row.targets {
            if !targets.contains(&t.as_str()) {
                targets.push(t);
            }
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec!["model".to_string(), "horizon".to_string(), "mae".to_string(), "rmse".to_string()];
    for t in &targets {
        header.push(format!("{}_true", t));
        header.push(format!("{}_pred", t));
    }
    writer.write_record(&header)?;

    for row in rows {
        let columns: Vec<Option<usize>> = targets
            .iter()
            .map(|t| row.targets.iter().position(|name| name == t))
            .collect();
        for i in 0..row.samples() {
            let mut record = vec![
                row.model.clone(),
                row.horizon.to_string(),
                row.mae.to_string(),
                row.rmse.to_string(),
            ];
            for column in &columns {
                match column {
                    Some(j) => {
                        record.push(row.y_true[[i, *j]].to_string());
                        record.push(row.y_pred[[i, *j]].to_string());
                    }
                    None => {
                        record.push(String::new());
                        record.push(String::new());
                    }
                }
            }
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    Ok(())
}
