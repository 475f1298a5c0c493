use config::{Config, Environment, File};
use std::path::Path;
use tracing::{debug, info};

use super::settings::PipelineConfig;
use crate::error::{PipelineError, Result};

const ENV_PREFIX: &str = "WEATHER";

/// Load configuration from defaults, an optional TOML file and the environment
///
/// Environment overrides use `WEATHER__<SECTION>__<KEY>`, e.g.
/// `WEATHER__TRAINING__TOP_K=5` or `WEATHER__GRID__HORIZONS=6,12,24`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let defaults = Config::try_from(&PipelineConfig::default())?;

    let builder = Config::builder()
        .add_source(defaults)
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("grid.seq_lens")
                .with_list_parse_key("grid.horizons")
                .with_list_parse_key("grid.epochs")
                .with_list_parse_key("grid.batch_sizes")
                .with_list_parse_key("training.features")
                .with_list_parse_key("training.targets")
                .try_parsing(true),
        );

    let mut config: PipelineConfig = builder.build()?.try_deserialize()?;
    apply_standard_env(&mut config);

    if let Err(errors) = config.validate() {
        return Err(PipelineError::InvalidConfig(errors.join(", ")));
    }

    if path.exists() {
        info!("Loaded configuration from {}", path.display());
    } else {
        debug!("No config file at {}, using defaults and environment", path.display());
    }
    Ok(config)
}

/// Fill storage settings from the conventional S3 variables when not set explicitly
fn apply_standard_env(config: &mut PipelineConfig) {
    let storage = &mut config.storage;
    if storage.access_key.is_empty() {
        if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
            storage.access_key = key;
        }
    }
    if storage.secret_key.is_empty() {
        if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            storage.secret_key = secret;
        }
    }
    if let Ok(endpoint) = std::env::var("S3_ENDPOINT_URL") {
        if !endpoint.is_empty() {
            storage.endpoint = endpoint;
        }
    }
}

/// Render the effective configuration as TOML
pub fn render_config(config: &PipelineConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
}
