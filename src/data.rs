use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named table of float columns, one per likelihood term or auxiliary record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl Dataset {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: BTreeMap::new(),
        }
    }

    pub fn with_column(mut self, column: &str, values: Vec<f64>) -> Self {
        self.columns.insert(column.to_string(), values);
        self
    }

    pub fn column(&self, column: &str) -> Result<&[f64]> {
        self.columns
            .get(column)
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow!("dataset {} has no column {column}", self.name))
    }

    /// First entry of a column, for single-row records.
    pub fn scalar(&self, column: &str) -> Result<f64> {
        self.column(column)?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("column {column} of dataset {} is empty", self.name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToyData {
    pub datasets: Vec<Dataset>,
}

impl ToyData {
    pub fn new(datasets: Vec<Dataset>) -> Self {
        Self { datasets }
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&Dataset> {
        self.get(name).ok_or_else(|| {
            anyhow!(
                "data has no dataset {name}, available: {:?}",
                self.names()
            )
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.iter().map(|d| d.name.clone()).collect()
    }
}
