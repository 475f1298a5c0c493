use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{error, info, warn};

use super::ObjectStore;
use crate::config::{PathSettings, StorageSettings};

/// What the fetch stage found and pulled
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub data_key: String,
    pub model_key: String,
    /// False when both local files already existed
    pub downloaded: bool,
    pub test_files: usize,
}

/// What the publish stage pushed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    pub uploaded: usize,
    pub failed: usize,
    pub production_updated: bool,
}

/// Lexicographically last object directly under `prefix`
pub async fn latest_key(store: &dyn ObjectStore, prefix: &str) -> Result<Option<String>> {
    let entries = store.list(prefix, false).await?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.is_prefix && !e.key.ends_with('/'))
        .map(|e| e.key)
        .max())
}

/// Pull the newest daily dataset and model, then every test file
///
/// Fails when either latest object is missing; test files are best effort.
pub async fn fetch_latest_artifacts(
    store: &dyn ObjectStore,
    storage: &StorageSettings,
    paths: &PathSettings,
) -> Result<FetchReport> {
    info!("Searching for latest files");
    let data_key = latest_key(store, &storage.data_prefix).await?;
    let model_key = latest_key(store, &storage.model_prefix).await?;

    let (data_key, model_key) = match (data_key, model_key) {
        (Some(data), Some(model)) => (data, model),
        _ => {
            error!("Cannot find the latest data or model in bucket '{}'", storage.bucket);
            match store.list("", false).await {
                Ok(entries) => entries.iter().for_each(|e| info!("Found: {}", e.key)),
                Err(e) => warn!("Cannot list bucket root: {}", e),
            }
            return Err(anyhow!(
                "No objects under '{}' or '{}'",
                storage.data_prefix,
                storage.model_prefix
            ));
        }
    };
    info!("Found data: [{}]", data_key);
    info!("Found model: [{}]", model_key);

    let local_data = paths.fetched_dataset();
    let local_model = paths.base_checkpoint.clone();
    let downloaded = if local_data.exists() && local_model.exists() {
        info!(
            "{} and {} already exist. Skipping download.",
            local_data.display(),
            local_model.display()
        );
        false
    } else {
        download(store, &data_key, &local_data).await?;
        download(store, &model_key, &local_model).await?;
        true
    };

    let test_files = download_prefix(store, &storage.test_prefix, &paths.test_data_dir).await;

    for path in [&local_data, &local_model] {
        if let Ok(meta) = fs::metadata(path) {
            info!("{}: {:.2} KB", path.display(), meta.len() as f64 / 1024.0);
        }
    }
    info!("Files in {}: {} found", paths.test_data_dir.display(), count_files(&paths.test_data_dir));

    Ok(FetchReport { data_key, model_key, downloaded, test_files })
}

async fn download(store: &dyn ObjectStore, key: &str, local: &Path) -> Result<()> {
    info!("Downloading {} to {}", key, local.display());
    let bytes = store
        .get(key)
        .await
        .with_context(|| format!("Failed to download {}", key))?;
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(local, bytes)
        .await
        .with_context(|| format!("Failed to write {}", local.display()))?;
    Ok(())
}

/// Mirror every object under `prefix` into `local_dir`; returns the number fetched
async fn download_prefix(store: &dyn ObjectStore, prefix: &str, local_dir: &Path) -> usize {
    info!("Downloading entire directory: {}", prefix);
    let entries = match store.list(prefix, true).await {
        Ok(entries) => entries,
        Err(e) => {
            error!("Error listing {}: {}", prefix, e);
            return 0;
        }
    };

    let mut count = 0;
    for entry in entries.iter().filter(|e| !e.is_prefix && !e.key.ends_with('/')) {
        let relative = Path::new(entry.key.strip_prefix(prefix).unwrap_or(&entry.key));
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            warn!("Skipping {}: key does not map inside {}", entry.key, local_dir.display());
            continue;
        }
        let local = local_dir.join(relative);
        match download(store, &entry.key, &local).await {
            Ok(()) => count += 1,
            Err(e) => error!("{:#}", e),
        }
    }
    info!("Successfully downloaded {} files from {}", count, prefix);
    count
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

/// Archive every artifact directory under `<archive_prefix>/<timestamp>/` and
/// overwrite the production model key with the champion checkpoint
pub async fn publish_artifacts(
    store: &dyn ObjectStore,
    storage: &StorageSettings,
    paths: &PathSettings,
    timestamp: &str,
) -> Result<PublishReport> {
    let root = format!("{}/{}", storage.archive_prefix.trim_end_matches('/'), timestamp);
    info!("Uploading artifacts to {}", root);

    let mut report = PublishReport::default();
    for dir in paths.artifact_dirs() {
        if !dir.is_dir() {
            warn!("Folder {} not found, skipping", dir.display());
            continue;
        }
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        for file in walk_files(&dir)? {
            let relative = file.strip_prefix(&dir).unwrap_or(&file);
            let key = object_key(&root, &dir_name, relative);
            match upload(store, &file, &key).await {
                Ok(()) => {
                    info!("Uploaded: {} -> {}", file.display(), key);
                    report.uploaded += 1;
                }
                Err(e) => {
                    error!("Upload of {} failed: {:#}", file.display(), e);
                    report.failed += 1;
                }
            }
        }
    }

    let production = paths.production_checkpoint();
    if production.exists() {
        info!("Updating the production model: {}", storage.production_key);
        match upload(store, &production, &storage.production_key).await {
            Ok(()) => {
                info!("Overwritten {} -> {}", production.display(), storage.production_key);
                report.production_updated = true;
            }
            Err(e) => error!("Error overwriting current model: {:#}", e),
        }
    } else {
        warn!("{} not found; production model left unchanged", production.display());
    }

    info!(
        "Upload finished: {} uploaded, {} failed",
        report.uploaded, report.failed
    );
    Ok(report)
}

async fn upload(store: &dyn ObjectStore, local: &Path, key: &str) -> Result<()> {
    let bytes = tokio::fs::read(local)
        .await
        .with_context(|| format!("Failed to read {}", local.display()))?;
    store.put(key, bytes).await?;
    Ok(())
}

fn object_key(root: &str, dir_name: &str, relative: &Path) -> String {
    let mut parts = vec![root.to_string()];
    if !dir_name.is_empty() {
        parts.push(dir_name.to_string());
    }
    parts.extend(relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()));
    parts.join("/")
}

/// All files below `dir`, sorted
fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::{MockObjectStore, ObjectInfo};
    use mockall::predicate::eq;
    use std::sync::{Arc, Mutex};

    fn paths(root: &Path) -> PathSettings {
        PathSettings {
            daily_dir: root.join("dataset_daily"),
            base_checkpoint: root.join("current_model/model.json"),
            models_dir: root.join("models_incremental"),
            candidates_dir: root.join("top3_models_incremental"),
            test_data_dir: root.join("dataset_test"),
            case_log_dir: root.join("test_logs"),
            eval_log_dir: root.join("evaluation_logs"),
            champion_dir: root.join("best_model_final"),
            ..PathSettings::default()
        }
    }

    fn listing_store() -> MockObjectStore {
        let mut store = MockObjectStore::new();
        store.expect_list().returning(|prefix, recursive| {
            Ok(match (prefix, recursive) {
                ("dataset_daily/", false) => vec![
                    ObjectInfo::object("dataset_daily/2024-01-01.csv", 10),
                    ObjectInfo::object("dataset_daily/2024-01-09.csv", 10),
                    ObjectInfo::prefix("dataset_daily/old/"),
                ],
                ("current_model/", false) => vec![ObjectInfo::object("current_model/model.json", 10)],
                ("dataset_test/", true) => vec![
                    ObjectInfo::object("dataset_test/", 0),
                    ObjectInfo::object("dataset_test/a.csv", 5),
                    ObjectInfo::object("dataset_test/nested/b.csv", 5),
                ],
                _ => Vec::new(),
            })
        });
        store
    }

    #[tokio::test]
    async fn test_fetch_downloads_latest_objects() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        let mut store = listing_store();
        store.expect_get().returning(|key| Ok(key.as_bytes().to_vec()));

        let report = fetch_latest_artifacts(&store, &StorageSettings::default(), &paths).await.unwrap();
        assert_eq!(report.data_key, "dataset_daily/2024-01-09.csv");
        assert!(report.downloaded);
        assert_eq!(report.test_files, 2);

        assert_eq!(fs::read_to_string(paths.fetched_dataset()).unwrap(), "dataset_daily/2024-01-09.csv");
        assert_eq!(fs::read_to_string(&paths.base_checkpoint).unwrap(), "current_model/model.json");
        assert!(paths.test_data_dir.join("nested/b.csv").exists());
    }

    #[tokio::test]
    async fn test_fetch_keeps_test_files_inside_test_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        let mut store = MockObjectStore::new();
        store.expect_list().returning(|prefix, recursive| {
            Ok(match (prefix, recursive) {
                ("dataset_daily/", false) => vec![ObjectInfo::object("dataset_daily/2024-01-09.csv", 10)],
                ("current_model/", false) => vec![ObjectInfo::object("current_model/model.json", 10)],
                ("dataset_test/", true) => vec![
                    ObjectInfo::object("dataset_test/a.csv", 5),
                    ObjectInfo::object("dataset_test/../current_model/model.json", 5),
                    ObjectInfo::object("dataset_test//etc/passwd", 5),
                ],
                _ => Vec::new(),
            })
        });
        store
            .expect_get()
            .with(eq("dataset_test/../current_model/model.json"))
            .times(0)
            .returning(|_| Ok(Vec::new()));
        store
            .expect_get()
            .with(eq("dataset_test//etc/passwd"))
            .times(0)
            .returning(|_| Ok(Vec::new()));
        store.expect_get().returning(|key| Ok(key.as_bytes().to_vec()));

        let report = fetch_latest_artifacts(&store, &StorageSettings::default(), &paths).await.unwrap();
        assert_eq!(report.test_files, 1);
        assert_eq!(fs::read_to_string(&paths.base_checkpoint).unwrap(), "current_model/model.json");
        assert_eq!(fs::read_dir(&paths.test_data_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_skips_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        fs::create_dir_all(&paths.daily_dir).unwrap();
        fs::create_dir_all(paths.base_checkpoint.parent().unwrap()).unwrap();
        fs::write(paths.fetched_dataset(), "local").unwrap();
        fs::write(&paths.base_checkpoint, "local").unwrap();

        let mut store = listing_store();
        store
            .expect_get()
            .with(eq("dataset_daily/2024-01-09.csv"))
            .times(0)
            .returning(|_| Ok(Vec::new()));
        store.expect_get().returning(|_| Ok(b"test".to_vec()));

        let report = fetch_latest_artifacts(&store, &StorageSettings::default(), &paths).await.unwrap();
        assert!(!report.downloaded);
        assert_eq!(fs::read_to_string(paths.fetched_dataset()).unwrap(), "local");
    }

    #[tokio::test]
    async fn test_fetch_fails_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store.expect_list().returning(|prefix, _| {
            Ok(if prefix == "dataset_daily/" {
                vec![ObjectInfo::object("dataset_daily/a.csv", 1)]
            } else {
                Vec::new()
            })
        });
        store.expect_get().times(0);

        let result = fetch_latest_artifacts(&store, &StorageSettings::default(), &paths(dir.path())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publish_archives_then_promotes_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        fs::create_dir_all(paths.candidates_dir.join("sub")).unwrap();
        fs::write(paths.candidates_dir.join("a.json"), "a").unwrap();
        fs::write(paths.candidates_dir.join("sub/b.json"), "b").unwrap();
        fs::create_dir_all(&paths.champion_dir).unwrap();
        fs::write(paths.production_checkpoint(), "champion").unwrap();
        fs::write(paths.champion_manifest(), "Best Model: a.json\nRMSE: 1.0000").unwrap();

        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&uploaded);
        let mut store = MockObjectStore::new();
        store.expect_put().returning(move |key, body| {
            if key.ends_with("sub/b.json") {
                return Err(StorageError::Status { key: key.to_string(), status: 500, body: String::new() });
            }
            seen.lock().unwrap().push((key.to_string(), body));
            Ok(())
        });

        let report = publish_artifacts(&store, &StorageSettings::default(), &paths, "20240101_120000")
            .await
            .unwrap();
        assert_eq!(report, PublishReport { uploaded: 3, failed: 1, production_updated: true });

        let keys: Vec<String> = uploaded.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                "data_all_train/20240101_120000/top3_models_incremental/a.json".to_string(),
                "data_all_train/20240101_120000/best_model_final/model_info.txt".to_string(),
                "data_all_train/20240101_120000/best_model_final/weather_model_production.json".to_string(),
                "current_model/model.json".to_string(),
            ]
        );
        assert_eq!(uploaded.lock().unwrap()[3].1, b"champion".to_vec());
    }
}
