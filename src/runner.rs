use anyhow::{Context, Result, anyhow, bail};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::data::ToyData;
use crate::fit::fit;
use crate::interval::{CriticalValue, IntervalKind, IntervalRequest, confidence_interval};
use crate::io::config::load_model_config;
use crate::io::results::{ResultTable, RunnerOutput, write_output};
use crate::io::toydata::{read_toydata, write_toydata};
use crate::model::StatisticalModel;
use crate::models::{ModelSpec, build_model};
use crate::opt::MinimizerConfig;
use crate::parameters::{ParameterDefinition, ParameterValues};
use crate::progress;

pub const POI_EXPECTATION: &str = "poi_expectation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHypothesis", into = "RawHypothesis")]
pub enum Hypothesis {
    Free,
    Null,
    True,
    Values(ParameterValues),
}

impl Hypothesis {
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Hypothesis::Free => Some("free"),
            Hypothesis::Null => Some("null"),
            Hypothesis::True => Some("true"),
            Hypothesis::Values(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawHypothesis {
    Name(String),
    Values(ParameterValues),
}

impl TryFrom<RawHypothesis> for Hypothesis {
    type Error = String;

    fn try_from(raw: RawHypothesis) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawHypothesis::Name(n) => match n.as_str() {
                "free" => Ok(Hypothesis::Free),
                "null" => Ok(Hypothesis::Null),
                "true" => Ok(Hypothesis::True),
                other => Err(format!(
                    "unknown hypothesis {other:?}, expected free, null, true or a value map"
                )),
            },
            RawHypothesis::Values(v) => Ok(Hypothesis::Values(v)),
        }
    }
}

impl From<Hypothesis> for RawHypothesis {
    fn from(h: Hypothesis) -> Self {
        match h {
            Hypothesis::Values(v) => RawHypothesis::Values(v),
            named => RawHypothesis::Name(named.label().unwrap_or_default().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToydataMode {
    Read,
    Generate,
    #[default]
    GenerateAndWrite,
    NoToydata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatisticalModelArgs {
    pub template_path: Option<PathBuf>,
    /// Threshold file replacing the asymptotic critical value.
    pub limit_threshold: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    pub statistical_model: String,
    pub poi: String,
    pub hypotheses: Vec<Hypothesis>,
    pub n_mc: usize,
    pub common_hypothesis: ParameterValues,
    pub generate_values: ParameterValues,
    pub nominal_values: ParameterValues,
    pub statistical_model_config: Option<PathBuf>,
    pub parameter_definition: Option<ParameterDefinition>,
    pub statistical_model_args: StatisticalModelArgs,
    pub likelihood_config: Option<Value>,
    pub compute_confidence_interval: bool,
    pub confidence_level: f64,
    pub confidence_interval_kind: IntervalKind,
    pub toydata_mode: ToydataMode,
    pub toydata_filename: Option<PathBuf>,
    pub only_toydata: bool,
    pub output_filename: Option<PathBuf>,
    pub seed: Option<u64>,
    pub metadata: Map<String, Value>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            statistical_model: "GaussianModel".to_string(),
            poi: "mu".to_string(),
            hypotheses: vec![Hypothesis::Free],
            n_mc: 3,
            common_hypothesis: ParameterValues::new(),
            generate_values: ParameterValues::new(),
            nominal_values: ParameterValues::new(),
            statistical_model_config: None,
            parameter_definition: None,
            statistical_model_args: StatisticalModelArgs::default(),
            likelihood_config: None,
            compute_confidence_interval: false,
            confidence_level: 0.9,
            confidence_interval_kind: IntervalKind::Central,
            toydata_mode: ToydataMode::GenerateAndWrite,
            toydata_filename: Some(PathBuf::from("test_toydata_file.json")),
            only_toydata: false,
            output_filename: Some(PathBuf::from("test_output_file.json")),
            seed: None,
            metadata: Map::new(),
        }
    }
}

pub const RUNNER_ARGUMENTS: &[&str] = &[
    "statistical_model",
    "poi",
    "hypotheses",
    "n_mc",
    "common_hypothesis",
    "generate_values",
    "nominal_values",
    "statistical_model_config",
    "parameter_definition",
    "statistical_model_args",
    "likelihood_config",
    "compute_confidence_interval",
    "confidence_level",
    "confidence_interval_kind",
    "toydata_mode",
    "toydata_filename",
    "only_toydata",
    "output_filename",
    "seed",
    "metadata",
];

impl RunnerConfig {
    /// Default arguments as a JSON object, keyed like [`RUNNER_ARGUMENTS`].
    pub fn defaults_map() -> Result<Map<String, Value>> {
        match serde_json::to_value(RunnerConfig::default())? {
            Value::Object(map) => Ok(map),
            _ => bail!("runner defaults did not serialize to an object"),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map)).context("invalid runner arguments")
    }
}

/// Convert a requested `poi_expectation` into a value of the poi.
///
/// The poi must be a `<source>_rate_multiplier`; its value becomes the ratio
/// of the requested to the unit-multiplier expectation of that source,
/// evaluated under the generate and nominal values.
pub fn update_poi(
    model: &dyn StatisticalModel,
    poi: &str,
    generate_values: &ParameterValues,
    nominal_values: &ParameterValues,
) -> Result<ParameterValues> {
    let Some(poi_expectation) = generate_values.get(POI_EXPECTATION).copied() else {
        return Ok(generate_values.clone());
    };
    if generate_values.contains_key(poi) {
        bail!(
            "you can not specify both {poi} and {POI_EXPECTATION}, {poi} is derived from {POI_EXPECTATION}"
        );
    }
    let Some(component) = poi.strip_suffix("_rate_multiplier") else {
        bail!("poi {poi} must end with _rate_multiplier when {POI_EXPECTATION} is provided");
    };
    let mut values = generate_values.clone();
    values.remove(POI_EXPECTATION);
    let mut at_unit = values.clone();
    at_unit.extend(nominal_values.iter().map(|(k, v)| (k.clone(), *v)));
    at_unit.insert(poi.to_string(), 1.0);
    let expectations = model.expectation_values(&at_unit)?;
    let unit = expectations
        .get(component)
        .copied()
        .ok_or_else(|| anyhow!("model has no expectation value for source {component}"))?;
    if !(unit > 0.0) {
        bail!("expectation of {component} at unit rate multiplier is {unit}, cannot scale it");
    }
    values.insert(poi.to_string(), poi_expectation / unit);
    Ok(values)
}

pub struct Runner {
    config: RunnerConfig,
    model: Box<dyn StatisticalModel>,
    generate_values: ParameterValues,
    hypotheses_values: Vec<ParameterValues>,
    result_names: Vec<String>,
    critical_value: CriticalValue,
    minimizer: MinimizerConfig,
    observed: Option<ToyData>,
    progress: bool,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let mut parameter_definition = config.parameter_definition.clone();
        let mut likelihood_config = config.likelihood_config.clone();
        if let Some(path) = &config.statistical_model_config {
            let model_config = load_model_config(path)
                .with_context(|| format!("failed to load statistical model config {path:?}"))?;
            if parameter_definition.is_some() {
                warn!("parameter_definition is overwritten, because statistical_model_config is provided");
            }
            if likelihood_config.is_some() {
                warn!("likelihood_config is overwritten, because statistical_model_config is provided");
            }
            parameter_definition = Some(model_config.parameter_definition);
            likelihood_config = model_config.likelihood_config;
        }
        let spec = ModelSpec {
            parameter_definition,
            likelihood_config,
            nominal_values: config.nominal_values.clone(),
            template_path: config.statistical_model_args.template_path.clone(),
        };
        let model = build_model(&config.statistical_model, &spec)?;

        if !model.parameters().contains(&config.poi) {
            bail!("poi {} is not a parameter of {}", config.poi, model.name());
        }
        let generate_values = update_poi(
            model.as_ref(),
            &config.poi,
            &config.generate_values,
            &config.nominal_values,
        )?;

        let mut result_names = model.parameter_list();
        result_names.extend(["ll", "dl", "ul"].map(String::from));

        let hypotheses_values = hypotheses_values(&config, &generate_values)?;
        let fittable = model.parameters().fittable();
        for hv in &hypotheses_values {
            let extra: Vec<&String> = hv.keys().filter(|k| !fittable.contains(k)).collect();
            if !extra.is_empty() {
                bail!(
                    "the hypothesis {hv:?} should be a subset of the fittable parameters {fittable:?}, got {extra:?}"
                );
            }
        }

        let critical_value = match &config.statistical_model_args.limit_threshold {
            Some(path) => CriticalValue::from_file(path)?,
            None => CriticalValue::asymptotic(config.confidence_interval_kind, config.confidence_level)?,
        };

        Ok(Self {
            config,
            model,
            generate_values,
            hypotheses_values,
            result_names,
            critical_value,
            minimizer: MinimizerConfig::default(),
            observed: None,
            progress: false,
        })
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn with_minimizer(mut self, minimizer: MinimizerConfig) -> Self {
        self.minimizer = minimizer;
        self
    }

    /// Data fitted in `no_toydata` mode.
    pub fn set_data(&mut self, data: ToyData) {
        self.observed = Some(data);
    }

    pub fn model(&self) -> &dyn StatisticalModel {
        self.model.as_ref()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn generate_values(&self) -> &ParameterValues {
        &self.generate_values
    }

    pub fn hypotheses_values(&self) -> &[ParameterValues] {
        &self.hypotheses_values
    }

    pub fn result_names(&self) -> &[String] {
        &self.result_names
    }

    fn toydata_path(&self) -> Result<&Path> {
        self.config
            .toydata_filename
            .as_deref()
            .ok_or_else(|| anyhow!("toydata_filename is needed in {:?} mode", self.config.toydata_mode))
    }

    fn toy_seeds(&self) -> Vec<u64> {
        let master = self.config.seed.unwrap_or_else(rand::random);
        info!(seed = master, n_mc = self.config.n_mc, "generating toys");
        let mut rng = SmallRng::seed_from_u64(master);
        (0..self.config.n_mc).map(|_| rng.r#gen::<u64>()).collect()
    }

    pub fn toydata(&self) -> Result<Vec<ToyData>> {
        let mode = self.config.toydata_mode;
        let n_mc = self.config.n_mc;
        if self.config.only_toydata && mode != ToydataMode::GenerateAndWrite {
            bail!("only_toydata is true, toydata_mode must be generate_and_write but is {mode:?}");
        }
        match mode {
            ToydataMode::Read => {
                let path = self.toydata_path()?;
                let (mut toys, _) = read_toydata(path)?;
                if toys.len() < n_mc {
                    bail!(
                        "number of stored toydata {} is less than number of Monte Carlo {n_mc}",
                        toys.len()
                    );
                }
                if toys.len() > n_mc {
                    warn!(
                        "number of stored toydata {} is larger than number of Monte Carlo {n_mc}",
                        toys.len()
                    );
                    toys.truncate(n_mc);
                }
                Ok(toys)
            }
            ToydataMode::Generate | ToydataMode::GenerateAndWrite => {
                let seeds = self.toy_seeds();
                let toys = seeds
                    .par_iter()
                    .map(|seed| {
                        let mut rng = SmallRng::seed_from_u64(*seed);
                        self.model.generate_data(&self.generate_values, &mut rng)
                    })
                    .collect::<Result<Vec<_>>>()?;
                if mode == ToydataMode::GenerateAndWrite {
                    let path = self.toydata_path()?;
                    println!("Saving {}", path.display());
                    let names = self.model.likelihood_names();
                    write_toydata(path, &toys, Some(names.as_slice()))?;
                }
                Ok(toys)
            }
            ToydataMode::NoToydata => {
                let data = self
                    .observed
                    .as_ref()
                    .ok_or_else(|| anyhow!("toydata_mode no_toydata needs data attached with set_data"))?;
                Ok(vec![data.clone(); n_mc])
            }
        }
    }

    pub fn simulate(&self) -> Result<()> {
        let pb = progress::spinner("Toy MC", "generating toydata", self.progress);
        self.toydata()?;
        pb.finish_with_message("generating toydata done");
        Ok(())
    }

    fn fit_toy(&self, data: &ToyData) -> Result<Vec<Vec<f64>>> {
        let poi = self.config.poi.as_str();
        let mut rows = Vec::with_capacity(self.hypotheses_values.len());
        for hv in &self.hypotheses_values {
            let result = fit(self.model.as_ref(), data, hv, &self.minimizer)?;
            let (dl, ul) = if self.config.compute_confidence_interval && !hv.contains_key(poi) {
                let request = IntervalRequest {
                    poi,
                    parameter_interval_bounds: None,
                    kind: self.config.confidence_interval_kind,
                    critical_value: &self.critical_value,
                    best_fit_args: &self.hypotheses_values[0],
                    interval_args: hv,
                };
                confidence_interval(self.model.as_ref(), data, &request, &self.minimizer)?
            } else {
                (f64::NAN, f64::NAN)
            };
            let mut row = Vec::with_capacity(self.result_names.len());
            for name in &self.result_names {
                let v = match name.as_str() {
                    "ll" => result.max_ll,
                    "dl" => dl,
                    "ul" => ul,
                    p => result.values[p],
                };
                row.push(v);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn simulate_and_fit(&self) -> Result<Vec<ResultTable>> {
        let toys = self.toydata()?;
        let n_mc = toys.len();
        let pb = progress::bar(n_mc as u64, "Toy MC", "fitting", self.progress);
        let per_toy = toys
            .par_iter()
            .enumerate()
            .map(|(i_mc, data)| {
                let rows = self
                    .fit_toy(data)
                    .with_context(|| format!("fitting toy {i_mc} failed"));
                pb.inc(1);
                rows
            })
            .collect::<Result<Vec<_>>>()?;
        pb.finish_with_message("fitting done");

        let mut tables: Vec<ResultTable> = self
            .hypotheses_values
            .iter()
            .enumerate()
            .map(|(i, hv)| {
                let name = self.config.hypotheses[i]
                    .label()
                    .map(str::to_string)
                    .unwrap_or_else(|| i.to_string());
                ResultTable::new(&name, hv.clone(), self.result_names.clone(), n_mc)
            })
            .collect();
        for (i_mc, rows) in per_toy.iter().enumerate() {
            for (table, row) in tables.iter_mut().zip(rows.iter()) {
                table.set_row(i_mc, row)?;
            }
        }
        Ok(tables)
    }

    pub fn write_output(&self, results: Vec<ResultTable>) -> Result<RunnerOutput> {
        let path = self
            .config
            .output_filename
            .as_deref()
            .ok_or_else(|| anyhow!("output_filename is not set"))?;
        let mut metadata = self.config.metadata.clone();
        metadata.insert(
            "date".to_string(),
            json!(chrono::Local::now().format("%Y%m%d_%H:%M:%S").to_string()),
        );
        metadata.insert("poi".to_string(), json!(self.config.poi));
        metadata.insert("statistical_model".to_string(), json!(self.model.name()));
        metadata.insert(
            "common_hypothesis".to_string(),
            json!(self.config.common_hypothesis),
        );
        metadata.insert("generate_values".to_string(), json!(self.generate_values));
        metadata.insert(
            "nominal_values".to_string(),
            json!(self.model.parameters().nominal_values()),
        );
        let output = RunnerOutput { metadata, results };
        println!("Saving {}", path.display());
        write_output(path, &output)?;
        Ok(output)
    }

    pub fn run(&self) -> Result<Option<RunnerOutput>> {
        if self.config.only_toydata {
            self.simulate()?;
            Ok(None)
        } else {
            let results = self.simulate_and_fit()?;
            Ok(Some(self.write_output(results)?))
        }
    }
}

fn hypotheses_values(config: &RunnerConfig, generate_values: &ParameterValues) -> Result<Vec<ParameterValues>> {
    let hypotheses = &config.hypotheses;
    if hypotheses.is_empty() {
        bail!("hypotheses should not be empty");
    }
    let free_pos = hypotheses.iter().position(|h| *h == Hypothesis::Free);
    if free_pos.is_none() && config.compute_confidence_interval {
        bail!("free hypothesis is needed for confidence interval calculation");
    }
    if let Some(pos) = free_pos
        && pos != 0
    {
        bail!("free hypothesis should be the first hypothesis");
    }

    let mut out = Vec::with_capacity(hypotheses.len());
    for h in hypotheses {
        let specific = match h {
            Hypothesis::Free => ParameterValues::new(),
            Hypothesis::Null => ParameterValues::from([(config.poi.clone(), 0.0)]),
            Hypothesis::True => {
                let v = generate_values.get(&config.poi).copied().ok_or_else(|| {
                    anyhow!("{} should be provided in generate_values for the true hypothesis", config.poi)
                })?;
                ParameterValues::from([(config.poi.clone(), v)])
            }
            Hypothesis::Values(v) => v.clone(),
        };
        let mut values = config.common_hypothesis.clone();
        values.extend(specific);
        if values.values().any(|v| !v.is_finite()) {
            bail!("hypothesis values must be finite, got {values:?}");
        }
        out.push(values);
    }
    Ok(out)
}
