use ndarray::{Array2, Axis};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{PipelineError, Result};

/// The 13 weather variables every observation carries
pub const CANONICAL_FIELDS: [&str; 13] = [
    "temperature",
    "feels_like",
    "humidity",
    "wind_speed",
    "gust_speed",
    "pressure",
    "precipitation",
    "rain_probability",
    "snow_probability",
    "uv_index",
    "dewpoint",
    "visibility",
    "cloud",
];

/// Ordered multivariate observations loaded from a CSV table
///
/// Every column is kept; cells that are empty or not numeric become NaN so
/// windowing can drop the affected rows.
#[derive(Debug, Clone)]
pub struct Series {
    columns: Vec<String>,
    values: Array2<f64>,
}

impl Series {
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if columns.len() != values.ncols() {
            return Err(PipelineError::Shape(format!(
                "{} column names for {} value columns",
                columns.len(),
                values.ncols()
            )));
        }
        Ok(Self { columns, values })
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let mut flat = Vec::new();
        let mut rows = 0;
        for record in reader.records() {
            let record = record?;
            for i in 0..columns.len() {
                let value = record
                    .get(i)
                    .and_then(|field| field.trim().parse::<f64>().ok())
                    .unwrap_or(f64::NAN);
                flat.push(value);
            }
            rows += 1;
        }

        let values = Array2::from_shape_vec((rows, columns.len()), flat)
            .map_err(|e| PipelineError::Shape(e.to_string()))?;

        Ok(Self { columns, values })
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Names from `wanted` that this series does not carry, each reported once
    pub fn missing_columns(&self, wanted: &[String]) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for name in wanted {
            if self.column_index(name).is_none() && !missing.contains(name) {
                missing.push(name.clone());
            }
        }
        missing
    }

    /// Matrix of the named columns, in the order given
    pub fn select(&self, names: &[String]) -> Result<Array2<f64>> {
        let indices = names
            .iter()
            .map(|name| {
                self.column_index(name)
                    .ok_or_else(|| PipelineError::MissingColumn(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(self.values.select(Axis(1), &indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_csv_with_gaps() {
        let csv = "time,temperature,humidity\n\
                   2024-01-01 00:00,1.5,80\n\
                   2024-01-01 01:00,,81\n\
                   2024-01-01 02:00,2.5,n/a\n";
        let series = Series::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(series.len(), 3);
        assert_eq!(series.columns(), &["time", "temperature", "humidity"]);

        let selected = series.select(&["humidity".into(), "temperature".into()]).unwrap();
        assert_eq!(selected[[0, 0]], 80.0);
        assert_eq!(selected[[0, 1]], 1.5);
        assert!(selected[[1, 1]].is_nan());
        assert!(selected[[2, 0]].is_nan());
    }

    #[test]
    fn test_missing_columns() {
        let series = Series::new(vec!["cloud".into()], Array2::zeros((2, 1))).unwrap();
        let wanted = vec!["cloud".to_string(), "uv_index".to_string()];
        assert_eq!(series.missing_columns(&wanted), vec!["uv_index".to_string()]);
        assert!(matches!(series.select(&wanted), Err(PipelineError::MissingColumn(c)) if c == "uv_index"));
    }

    #[test]
    fn test_missing_columns_reported_once() {
        let series = Series::new(vec!["cloud".into()], Array2::zeros((2, 1))).unwrap();
        let features_then_targets: Vec<String> = ["uv_index", "cloud", "dewpoint", "uv_index", "cloud", "dewpoint"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            series.missing_columns(&features_then_targets),
            vec!["uv_index".to_string(), "dewpoint".to_string()]
        );
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(Series::new(vec!["a".into()], Array2::zeros((2, 2))).is_err());
    }
}
