use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::PathSettings;
use crate::types::{ChampionManifest, MetricRow, SummaryRow};

/// Ranked summary plus the model promoted from it
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub summary: Vec<SummaryRow>,
    pub champion: ChampionManifest,
}

impl Selection {
    /// Mean of the summary's RMSE column
    pub fn global_avg_rmse(&self) -> f64 {
        global_avg_rmse(&self.summary)
    }
}

pub fn global_avg_rmse(summary: &[SummaryRow]) -> f64 {
    if summary.is_empty() {
        return f64::NAN;
    }
    summary.iter().map(|r| r.rmse).sum::<f64>() / summary.len() as f64
}

/// Per-model mean MAE and RMSE over the model's case rows, best RMSE first
///
/// Equal RMSE is ordered by model identifier so the ranking never depends on
/// the order rows arrived in.
pub fn summarize(rows: &[MetricRow]) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<&str, (f64, f64, usize)> = BTreeMap::new();
    for row in rows {
        let entry = groups.entry(row.model.as_str()).or_insert((0.0, 0.0, 0));
        entry.0 += row.mae;
        entry.1 += row.rmse;
        entry.2 += 1;
    }

    let mut summary: Vec<SummaryRow> = groups
        .into_iter()
        .map(|(model, (mae, rmse, n))| SummaryRow {
            model: model.to_string(),
            mae: mae / n as f64,
            rmse: rmse / n as f64,
        })
        .collect();
    summary.sort_by(|a, b| a.rmse.total_cmp(&b.rmse).then_with(|| a.model.cmp(&b.model)));
    summary
}

/// Rank `rows`, persist the summary table and promote the best model
///
/// Returns `None` without writing anything when there is nothing to rank.
pub fn select_champion(rows: &[MetricRow], paths: &PathSettings) -> Result<Option<Selection>> {
    let summary = summarize(rows);
    let Some(best) = summary.first() else {
        info!("There are no results to summarize.");
        return Ok(None);
    };

    write_summary(&paths.summary_table(), &summary)?;
    info!("Summary of {} models written to {}", summary.len(), paths.summary_table().display());

    let champion = promote(best, paths)?;
    Ok(Some(Selection { summary, champion }))
}

/// Promote the first row of an existing summary table
///
/// An absent or empty table is a no-op.
pub fn select_from_summary(paths: &PathSettings) -> Result<Option<ChampionManifest>> {
    let path = paths.summary_table();
    if !path.exists() {
        info!("No summary table at {}; nothing to select", path.display());
        return Ok(None);
    }
    let summary = read_summary(&path)?;
    match summary.first() {
        Some(best) => promote(best, paths).map(Some),
        None => {
            info!("Summary table {} is empty; nothing to select", path.display());
            Ok(None)
        }
    }
}

pub fn write_summary(path: &Path, summary: &[SummaryRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in summary {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_summary(path: &Path) -> Result<Vec<SummaryRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let rows = reader
        .deserialize()
        .collect::<std::result::Result<Vec<SummaryRow>, _>>()
        .with_context(|| format!("Malformed summary table {}", path.display()))?;
    Ok(rows)
}

/// Copy the model's checkpoint to the production path and rewrite the manifest
fn promote(best: &SummaryRow, paths: &PathSettings) -> Result<ChampionManifest> {
    let source = paths.candidates_dir.join(&best.model);
    if !source.exists() {
        return Err(anyhow!("Champion checkpoint {} does not exist", source.display()));
    }

    fs::create_dir_all(&paths.champion_dir)?;
    fs::copy(&source, paths.production_checkpoint()).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            source.display(),
            paths.production_checkpoint().display()
        )
    })?;
    let manifest = ChampionManifest { model: best.model.clone(), rmse: best.rmse };
    fs::write(paths.champion_manifest(), manifest.to_string())
        .with_context(|| format!("Failed to write {}", paths.champion_manifest().display()))?;

    info!("Champion selected: {} with RMSE: {:.4}", manifest.model, manifest.rmse);
    Ok(manifest)
}
