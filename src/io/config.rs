use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::io::{open_reader, read_json, write_json};
use crate::parameters::ParameterDefinition;

/// Model configuration file: parameter definitions and likelihood layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub parameter_definition: ParameterDefinition,
    #[serde(default)]
    pub likelihood_config: Option<serde_json::Value>,
}

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = open_reader(path)?;
    serde_yaml::from_reader(reader).with_context(|| format!("failed to parse {path:?}"))
}

pub fn load_model_config(path: &Path) -> Result<ModelConfig> {
    load_yaml(path)
}

/// Histogram stored as a JSON array of expected counts.
pub fn load_template(path: &Path) -> Result<Vec<f64>> {
    read_json(path).with_context(|| format!("failed to load template {path:?}"))
}

/// Critical values of the test statistic as a function of the poi.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTable {
    pub poi: String,
    pub confidence_level: f64,
    pub poi_values: Vec<f64>,
    pub critical_values: Vec<f64>,
}

impl ThresholdTable {
    pub fn validate(&self) -> Result<()> {
        if self.poi_values.is_empty() {
            bail!("threshold table for {} is empty", self.poi);
        }
        if self.poi_values.len() != self.critical_values.len() {
            bail!(
                "threshold table has {} poi values but {} critical values",
                self.poi_values.len(),
                self.critical_values.len()
            );
        }
        if self.poi_values.windows(2).any(|w| w[1] <= w[0]) {
            bail!("threshold poi values must be strictly increasing");
        }
        if self.critical_values.iter().any(|v| !v.is_finite()) {
            bail!("threshold critical values must be finite");
        }
        Ok(())
    }

    /// Linear interpolation, constant beyond the tabulated range.
    pub fn interpolate(&self, x: f64) -> f64 {
        let xs = &self.poi_values;
        let ys = &self.critical_values;
        let pos = xs.partition_point(|v| *v <= x);
        if pos == 0 {
            return ys[0];
        }
        if pos == xs.len() {
            return ys[xs.len() - 1];
        }
        let (x0, x1) = (xs[pos - 1], xs[pos]);
        let w = (x - x0) / (x1 - x0);
        ys[pos - 1] * (1.0 - w) + ys[pos] * w
    }
}

pub fn save_threshold(path: &Path, table: &ThresholdTable) -> Result<()> {
    table.validate()?;
    write_json(path, table)
}

pub fn load_threshold(path: &Path) -> Result<ThresholdTable> {
    let table: ThresholdTable = read_json(path)?;
    table.validate()?;
    Ok(table)
}
