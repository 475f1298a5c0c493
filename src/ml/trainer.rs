use anyhow::{anyhow, Context, Result};
use chrono::Local;
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::checkpoint::{output_path, Checkpoint};
use super::scaler::ScalerState;
use super::tcn::{Tcn, TcnParams};
use super::windowing::{window, WindowedDataset};
use crate::config::{PipelineConfig, TrainingSettings};
use crate::engine::{dispatch, OutcomeTally, WorkOutcome};
use crate::error::{CheckpointError, PipelineError, SkipReason};
use crate::types::{expand_grid, HyperParams, Series};

/// Number of trailing epochs averaged into the ranking loss
const SUMMARY_EPOCHS: usize = 5;

/// Settings of one optimisation run
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub label: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub log_every: usize,
    pub time_limit: Option<Duration>,
}

impl FitOptions {
    pub fn new(label: String, config: &HyperParams, settings: &TrainingSettings) -> Self {
        Self {
            label,
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: settings.learning_rate,
            seed: settings.seed,
            log_every: settings.log_every,
            time_limit: settings.max_wall_clock_secs.map(Duration::from_secs),
        }
    }
}

/// Per-epoch mean losses of one optimisation run
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub epoch_losses: Vec<f64>,
    /// Stopped early because the wall-clock limit was reached
    pub truncated: bool,
}

impl FitReport {
    /// Mean of the last five epoch losses, or of all of them when fewer ran
    pub fn summary_loss(&self) -> f64 {
        let tail = &self.epoch_losses[self.epoch_losses.len().saturating_sub(SUMMARY_EPOCHS)..];
        if tail.is_empty() {
            return f64::NAN;
        }
        tail.iter().sum::<f64>() / tail.len() as f64
    }
}

/// A fine-tuned checkpoint written to disk
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub config: HyperParams,
    pub path: PathBuf,
    pub loss: f64,
    pub epoch_losses: Vec<f64>,
    pub truncated: bool,
}

impl TrainedModel {
    /// Model identifier used downstream: the checkpoint file name
    pub fn model_id(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.file_name())
    }
}

/// Minimise MSE with Adam over shuffled mini-batches, updating `model` in place
pub fn fit(model: &mut Tcn, data: &WindowedDataset, opts: &FitOptions) -> Result<FitReport> {
    if data.is_empty() {
        return Err(anyhow!("Cannot train on an empty dataset"));
    }
    if opts.batch_size == 0 {
        return Err(anyhow!("batch_size must be > 0"));
    }

    let started = Instant::now();
    let log_every = opts.log_every.max(1);
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut adam = super::optim::Adam::new(opts.learning_rate);
    let mut indices: Vec<usize> = (0..data.len()).collect();
    let mut epoch_losses = Vec::with_capacity(opts.epochs);
    let mut truncated = false;

    for epoch in 0..opts.epochs {
        indices.shuffle(&mut rng);

        let mut batch_losses = Vec::with_capacity(indices.len() / opts.batch_size + 1);
        for chunk in indices.chunks(opts.batch_size) {
            let (x, y) = data.batch(chunk);
            let (loss, grads) = model.loss_and_grads(&x, &y)?;
            if !loss.is_finite() {
                return Err(anyhow!("[{}] Loss diverged at epoch {}", opts.label, epoch + 1));
            }
            adam.step(model.params_mut(), &grads);
            batch_losses.push(loss);
        }

        let epoch_loss = batch_losses.iter().sum::<f64>() / batch_losses.len() as f64;
        epoch_losses.push(epoch_loss);

        if (epoch + 1) % log_every == 0 {
            info!("[{}] Epoch {}/{} | Loss: {:.4}", opts.label, epoch + 1, opts.epochs, epoch_loss);
        }

        if let Some(limit) = opts.time_limit {
            if epoch + 1 < opts.epochs && started.elapsed() >= limit {
                warn!(
                    "[{}] Wall-clock limit of {:?} reached after epoch {}/{}",
                    opts.label,
                    limit,
                    epoch + 1,
                    opts.epochs
                );
                truncated = true;
                break;
            }
        }
    }

    debug!("[{}] {} Adam steps taken", opts.label, adam.steps_taken());
    Ok(FitReport { epoch_losses, truncated })
}

/// Fine-tune the base checkpoint on `series` with one grid configuration
///
/// Scaler state, feature order and target order come from the base checkpoint
/// and are copied verbatim into the new one. Missing inputs are skips.
pub fn train_incremental(
    base_path: &Path,
    series: &Series,
    config: HyperParams,
    settings: &TrainingSettings,
    out_dir: &Path,
) -> WorkOutcome<TrainedModel> {
    let name = config.name();
    info!("Fine-tuning case: {}", name);

    let base = match Checkpoint::load(base_path) {
        Ok(base) => base,
        Err(CheckpointError::NotFound(path)) => {
            warn!("[{}] The original model could not be found at {}. Skipping.", name, path.display());
            return WorkOutcome::Skipped(SkipReason::MissingBaseCheckpoint(path));
        }
        Err(e) => {
            warn!("[{}] Base checkpoint rejected: {}", name, e);
            return WorkOutcome::Skipped(SkipReason::BadCheckpoint(e.to_string()));
        }
    };

    let mut wanted = base.features.clone();
    wanted.extend(base.targets.iter().cloned());
    let missing = series.missing_columns(&wanted);
    if !missing.is_empty() {
        warn!("[{}] Training data lacks columns {:?}. Skipping.", name, missing);
        return WorkOutcome::Skipped(SkipReason::MissingColumns(missing));
    }

    let data = match window(series, &base.features, &base.targets, config.horizon, config.seq_len, &base.scaler) {
        Ok(data) => data,
        Err(e) => return WorkOutcome::Failed(format!("windowing failed: {:#}", e)),
    };
    if data.is_empty() {
        let reason = SkipReason::NoWindows {
            rows: series.len(),
            seq_len: config.seq_len,
            horizon: config.horizon,
        };
        warn!("[{}] {}. Skipping.", name, reason);
        return WorkOutcome::Skipped(reason);
    }
    debug!("[{}] {} training windows", name, data.len());

    let mut model = base.model();
    let report = match fit(&mut model, &data, &FitOptions::new(name.clone(), &config, settings)) {
        Ok(report) => report,
        Err(e) => return WorkOutcome::Failed(format!("{:#}", e)),
    };

    let checkpoint = Checkpoint {
        params: model.into_params(),
        features: base.features,
        targets: base.targets,
        seq_len: config.seq_len,
        horizon: config.horizon,
        scaler: base.scaler,
        config,
    };
    let path = output_path(out_dir, &config, settings.collision_policy);
    if let Err(e) = checkpoint.save(&path) {
        return WorkOutcome::Failed(format!("cannot save {}: {}", path.display(), e));
    }

    let loss = report.summary_loss();
    info!("[{}] Saved {} (loss {:.4})", name, path.display(), loss);
    WorkOutcome::Done(TrainedModel {
        config,
        path,
        loss,
        epoch_losses: report.epoch_losses,
        truncated: report.truncated,
    })
}

/// Start a lineage: fit the scaler on `series`, train fresh weights and write
/// the base checkpoint to `out_path`
pub fn bootstrap(
    series: &Series,
    config: HyperParams,
    settings: &TrainingSettings,
    out_path: &Path,
) -> Result<TrainedModel> {
    let mut wanted = settings.features.clone();
    wanted.extend(settings.targets.iter().cloned());
    let missing = series.missing_columns(&wanted);
    if !missing.is_empty() {
        return Err(anyhow!("Dataset lacks columns: {}", missing.join(", ")));
    }

    let features = series.select(&settings.features)?;
    let complete: Vec<usize> = (0..features.nrows())
        .filter(|&i| features.row(i).iter().all(|v| v.is_finite()))
        .collect();
    let scaler = ScalerState::fit(&features.select(Axis(0), &complete)).context("Failed to fit scaler")?;
    info!("Fitted scaler on {} of {} rows", complete.len(), series.len());

    let data = window(series, &settings.features, &settings.targets, config.horizon, config.seq_len, &scaler)?;
    if data.is_empty() {
        return Err(anyhow!(
            "{}",
            SkipReason::NoWindows { rows: series.len(), seq_len: config.seq_len, horizon: config.horizon }
        ));
    }

    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut model = Tcn::new(TcnParams::init(settings.features.len(), settings.targets.len(), &mut rng));
    info!("Training fresh model with {} parameters on {} windows", model.params().num_parameters(), data.len());

    let report = fit(&mut model, &data, &FitOptions::new("bootstrap".to_string(), &config, settings))?;

    let checkpoint = Checkpoint {
        params: model.into_params(),
        features: settings.features.clone(),
        targets: settings.targets.clone(),
        seq_len: config.seq_len,
        horizon: config.horizon,
        scaler,
        config,
    };
    checkpoint.validate()?;
    checkpoint.save(out_path)?;

    let loss = report.summary_loss();
    info!("Base checkpoint written to {} (loss {:.4})", out_path.display(), loss);
    Ok(TrainedModel {
        config,
        path: out_path.to_path_buf(),
        loss,
        epoch_losses: report.epoch_losses,
        truncated: report.truncated,
    })
}

/// Outcome of a full grid run
#[derive(Debug)]
pub struct GridReport {
    pub data_source: PathBuf,
    pub outcomes: Vec<(HyperParams, WorkOutcome<TrainedModel>)>,
    /// Best configurations by summary loss, copied to the candidate directory
    pub top: Vec<TrainedModel>,
}

/// Lexicographically last CSV in `dir`
pub fn latest_daily_csv(dir: &Path) -> std::result::Result<PathBuf, PipelineError> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "csv"))
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files.pop().ok_or_else(|| PipelineError::NoDataFiles(dir.to_path_buf()))
}

/// Lowest loss first; ties go to the lexicographically smaller model id
pub fn rank_by_loss(mut models: Vec<TrainedModel>, k: usize) -> Vec<TrainedModel> {
    models.sort_by(|a, b| a.loss.total_cmp(&b.loss).then_with(|| a.model_id().cmp(&b.model_id())));
    models.truncate(k);
    models
}

/// Fine-tune every grid configuration from the base checkpoint, then record
/// the results log and copy the top-K checkpoints to the candidate directory
pub async fn run_grid(config: &PipelineConfig, data_path: &Path) -> Result<GridReport> {
    info!("Using new data from: {}", data_path.display());
    let series = Arc::new(
        Series::from_csv_path(data_path)
            .with_context(|| format!("Failed to read {}", data_path.display()))?,
    );

    let configs = expand_grid(&config.grid);
    info!("Training {} grid configurations", configs.len());

    let settings = Arc::new(config.training.clone());
    let base_path = config.paths.base_checkpoint.clone();
    let out_dir = config.paths.models_dir.clone();
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let outcomes = dispatch(configs, config.training.max_parallel, move |hp| {
        train_incremental(&base_path, &series, hp, &settings, &out_dir)
    })
    .await;

    let tally = OutcomeTally::of(outcomes.iter().map(|(_, o)| o));
    info!(
        "Grid finished: {} trained, {} skipped, {} failed",
        tally.done, tally.skipped, tally.failed
    );

    let trained: Vec<TrainedModel> = outcomes.iter().filter_map(|(_, o)| o.done().cloned()).collect();
    let top = rank_by_loss(trained, config.training.top_k);

    let report = GridReport { data_source: data_path.to_path_buf(), outcomes, top };
    write_training_log(&config.paths.training_log(), &report)?;
    copy_candidates(&config.paths.candidates_dir, &report.top)?;

    Ok(report)
}

fn write_training_log(path: &Path, report: &GridReport) -> Result<()> {
    let mut lines = vec![
        format!("Incremental Training Log - {}", Local::now().format("%a %b %e %H:%M:%S %Y")),
        format!("Data source: {}", report.data_source.display()),
        String::new(),
    ];

    for (hp, outcome) in &report.outcomes {
        let line = match outcome {
            WorkOutcome::Done(model) if model.truncated => {
                format!("{}, final_loss={:.4}, truncated", hp, model.loss)
            }
            WorkOutcome::Done(model) => format!("{}, final_loss={:.4}", hp, model.loss),
            other => format!("{}, {}", hp, other.status()),
        };
        lines.push(line);
    }

    if !report.top.is_empty() {
        lines.push(String::new());
        lines.push(format!("TOP {} INCREMENTAL MODELS", report.top.len()));
        for (i, model) in report.top.iter().enumerate() {
            let line = format!("{}. {} | loss={:.4}", i + 1, model.model_id(), model.loss);
            info!("{}", line);
            lines.push(line);
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Training log written to {}", path.display());
    Ok(())
}

/// Replace the candidate directory's contents with the selected checkpoints
fn copy_candidates(dir: &Path, top: &[TrainedModel]) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir)?;
    for model in top {
        let target = dir.join(model.model_id());
        fs::copy(&model.path, &target)
            .with_context(|| format!("Failed to copy {} to {}", model.path.display(), target.display()))?;
    }
    if !top.is_empty() {
        info!("Top {} checkpoints copied to {}", top.len(), dir.display());
    }
    Ok(())
}
