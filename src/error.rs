use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Data errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Series is missing column '{0}'")]
    MissingColumn(String),

    #[error("No data files found in {0}")]
    NoDataFiles(PathBuf),

    // Model errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    // Collaborator errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tracking error: {0}")]
    Tracking(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Reasons a checkpoint is rejected on load
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(PathBuf),

    #[error("Cannot read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed checkpoint {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid checkpoint: {0}")]
    Invalid(String),
}

/// Object storage failures, reported per object
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage request for {key} failed with status {status}: {body}")]
    Status {
        key: String,
        status: u16,
        body: String,
    },

    #[error("Cannot parse listing: {0}")]
    Listing(String),

    #[error("Invalid endpoint: {0}")]
    Endpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a unit of work produced no result. Skips never abort a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Base checkpoint was not found on disk
    MissingBaseCheckpoint(PathBuf),
    /// Windowing produced no samples
    NoWindows { rows: usize, seq_len: usize, horizon: usize },
    /// Test series lacks fields the checkpoint needs
    MissingColumns(Vec<String>),
    /// Checkpoint could not be loaded or failed validation
    BadCheckpoint(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingBaseCheckpoint(path) => write!(
                f,
                "the original model could not be found at {}",
                path.display()
            ),
            SkipReason::NoWindows { rows, seq_len, horizon } => write!(
                f,
                "no windows from {} rows (seq_len={}, horizon={})",
                rows, seq_len, horizon
            ),
            SkipReason::MissingColumns(cols) => {
                write!(f, "series is missing columns: {}", cols.join(", "))
            }
            SkipReason::BadCheckpoint(msg) => write!(f, "unusable checkpoint: {}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_display() {
        let reason = SkipReason::NoWindows { rows: 30, seq_len: 24, horizon: 6 };
        assert_eq!(reason.to_string(), "no windows from 30 rows (seq_len=24, horizon=6)");

        let reason = SkipReason::MissingColumns(vec!["cloud".into(), "uv_index".into()]);
        assert!(reason.to_string().ends_with("cloud, uv_index"));
    }
}
