use anyhow::{Result, anyhow, bail};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::io::{read_json, write_json};
use crate::parameters::ParameterValues;

/// Fit results of one hypothesis: one row per toy.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    pub name: String,
    pub hypothesis_values: ParameterValues,
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl ResultTable {
    pub fn new(name: &str, hypothesis_values: ParameterValues, columns: Vec<String>, n_rows: usize) -> Self {
        let n_cols = columns.len();
        Self {
            name: name.to_string(),
            hypothesis_values,
            columns,
            values: Array2::from_elem((n_rows, n_cols), f64::NAN),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| anyhow!("result table {} has no column {name}", self.name))?;
        Ok(self.values.column(idx))
    }

    pub fn set_row(&mut self, row: usize, values: &[f64]) -> Result<()> {
        if values.len() != self.columns.len() {
            bail!(
                "row has {} values, table {} has {} columns",
                values.len(),
                self.name,
                self.columns.len()
            );
        }
        if row >= self.n_rows() {
            bail!("row {row} out of range for table {}", self.name);
        }
        for (j, v) in values.iter().enumerate() {
            self.values[(row, j)] = *v;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerOutput {
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub results: Vec<ResultTable>,
}

impl RunnerOutput {
    pub fn table(&self, name: &str) -> Result<&ResultTable> {
        self.results.iter().find(|t| t.name == name).ok_or_else(|| {
            anyhow!(
                "output has no result table {name}, available: {:?}",
                self.results.iter().map(|t| &t.name).collect::<Vec<_>>()
            )
        })
    }
}

// JSON has no NaN or infinities, so those are written as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Number {
    Finite(f64),
    Special(String),
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        if v.is_finite() {
            Number::Finite(v)
        } else if v.is_nan() {
            Number::Special("nan".to_string())
        } else if v > 0.0 {
            Number::Special("inf".to_string())
        } else {
            Number::Special("-inf".to_string())
        }
    }
}

impl TryFrom<Number> for f64 {
    type Error = anyhow::Error;

    fn try_from(n: Number) -> Result<f64> {
        match n {
            Number::Finite(v) => Ok(v),
            Number::Special(s) => match s.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => bail!("invalid number {other:?}"),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TableRecord {
    name: String,
    hypothesis_values: ParameterValues,
    columns: Vec<String>,
    rows: Vec<Vec<Number>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputRecord {
    metadata: serde_json::Map<String, serde_json::Value>,
    results: Vec<TableRecord>,
}

pub fn write_output(path: &Path, output: &RunnerOutput) -> Result<()> {
    let results = output
        .results
        .iter()
        .map(|t| TableRecord {
            name: t.name.clone(),
            hypothesis_values: t.hypothesis_values.clone(),
            columns: t.columns.clone(),
            rows: t
                .values
                .rows()
                .into_iter()
                .map(|r| r.iter().map(|v| Number::from(*v)).collect())
                .collect(),
        })
        .collect();
    write_json(
        path,
        &OutputRecord {
            metadata: output.metadata.clone(),
            results,
        },
    )
}

pub fn read_output(path: &Path) -> Result<RunnerOutput> {
    let record: OutputRecord = read_json(path)?;
    let mut results = Vec::with_capacity(record.results.len());
    for t in record.results {
        let n_cols = t.columns.len();
        let n_rows = t.rows.len();
        let mut flat = Vec::with_capacity(n_rows * n_cols);
        for (i, row) in t.rows.into_iter().enumerate() {
            if row.len() != n_cols {
                bail!("row {i} of table {} has {} values, expected {n_cols}", t.name, row.len());
            }
            for v in row {
                flat.push(f64::try_from(v)?);
            }
        }
        let values = Array2::from_shape_vec((n_rows, n_cols), flat)?;
        results.push(ResultTable {
            name: t.name,
            hypothesis_values: t.hypothesis_values,
            columns: t.columns,
            values,
        });
    }
    Ok(RunnerOutput {
        metadata: record.metadata,
        results,
    })
}
