use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::ToyData;
use crate::io::{read_json, write_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToydataFile {
    pub dataset_names: Vec<String>,
    pub toys: Vec<ToyData>,
}

#[derive(Serialize)]
struct ToydataFileRef<'a> {
    dataset_names: &'a [String],
    toys: &'a [ToyData],
}

/// Store toys; `names` defaults to the dataset names of the first toy.
pub fn write_toydata(path: &Path, toys: &[ToyData], names: Option<&[String]>) -> Result<()> {
    let dataset_names = match names {
        Some(n) => n.to_vec(),
        None => toys.first().map(ToyData::names).unwrap_or_default(),
    };
    for (i, toy) in toys.iter().enumerate() {
        if toy.datasets.len() != dataset_names.len() {
            bail!(
                "toy {i} has {} datasets, expected {}",
                toy.datasets.len(),
                dataset_names.len()
            );
        }
    }
    write_json(
        path,
        &ToydataFileRef {
            dataset_names: &dataset_names,
            toys,
        },
    )
}

pub fn read_toydata(path: &Path) -> Result<(Vec<ToyData>, Vec<String>)> {
    let file: ToydataFile = read_json(path)?;
    Ok((file.toys, file.dataset_names))
}
