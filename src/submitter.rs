use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::io::config::{load_model_config, load_yaml};
use crate::models::{ModelSpec, build_model};
use crate::parameters::ParameterValues;
use crate::progress;
use crate::runner::{POI_EXPECTATION, RUNNER_ARGUMENTS, Runner, RunnerConfig};
use crate::utils::{add_i_batch, format_template, resolve_relative, shell_quote};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Computation {
    #[serde(default)]
    pub to_zip: Map<String, Value>,
    #[serde(default)]
    pub to_vary: Map<String, Value>,
    #[serde(default)]
    pub in_common: Map<String, Value>,
}

fn default_computation() -> String {
    "discovery_power".to_string()
}

fn default_loglevel() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitterConfig {
    pub statistical_model: String,
    pub statistical_model_config: PathBuf,
    pub poi: String,
    pub computation_options: BTreeMap<String, Value>,
    #[serde(default = "default_computation")]
    pub computation: String,
    #[serde(default)]
    pub outputfolder: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default)]
    pub template_path: Option<PathBuf>,
    /// Back-end specific settings.
    #[serde(flatten)]
    pub backend: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub config: RunnerConfig,
    pub args: Vec<String>,
    pub script: String,
    pub output_filename: Option<PathBuf>,
}

fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Expand the computation grid.
///
/// `to_zip` lists are zipped element-wise, `to_vary` lists are combined as a
/// cartesian product, both are then combined as a product and every
/// combination receives the `in_common` values.
pub fn compute_variations(
    to_zip: &Map<String, Value>,
    to_vary: &Map<String, Value>,
    in_common: &Map<String, Value>,
) -> Result<Vec<Map<String, Value>>> {
    let mut seen = BTreeSet::new();
    for key in to_zip.keys().chain(to_vary.keys()).chain(in_common.keys()) {
        if !seen.insert(key.as_str()) {
            bail!("argument {key} appears in more than one of to_zip, to_vary and in_common");
        }
    }

    let mut zipped = vec![Map::new()];
    if !to_zip.is_empty() {
        let lists: Vec<(&String, Vec<Value>)> = to_zip.iter().map(|(k, v)| (k, as_list(v))).collect();
        let n = lists[0].1.len();
        if let Some((k, l)) = lists.iter().find(|(_, l)| l.len() != n) {
            bail!("to_zip lists must have the same length, {k} has {} instead of {n}", l.len());
        }
        zipped = (0..n)
            .map(|i| {
                lists
                    .iter()
                    .map(|(k, l)| ((*k).clone(), l[i].clone()))
                    .collect::<Map<String, Value>>()
            })
            .collect();
    }

    let mut varied = vec![Map::new()];
    for (key, value) in to_vary {
        let options = as_list(value);
        let mut next = Vec::with_capacity(varied.len() * options.len());
        for base in &varied {
            for opt in &options {
                let mut m = base.clone();
                m.insert(key.clone(), opt.clone());
                next.push(m);
            }
        }
        varied = next;
    }

    let mut out = Vec::with_capacity(zipped.len() * varied.len());
    for z in &zipped {
        for v in &varied {
            let mut m = z.clone();
            m.extend(v.clone());
            m.extend(in_common.clone());
            out.push(m);
        }
    }
    Ok(out)
}

pub fn arg_to_str(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // serde_json writes compact JSON without spaces
        other => other.to_string(),
    }
}

const STRING_ARGUMENTS: &[&str] = &[
    "statistical_model",
    "poi",
    "statistical_model_config",
    "confidence_interval_kind",
    "toydata_mode",
    "toydata_filename",
    "output_filename",
];

pub fn str_to_arg(name: &str, value: &str) -> Result<Value> {
    if !RUNNER_ARGUMENTS.contains(&name) {
        bail!("unknown runner argument {name}");
    }
    if value == "null" {
        return Ok(Value::Null);
    }
    if STRING_ARGUMENTS.contains(&name) {
        return Ok(Value::String(value.to_string()));
    }
    serde_json::from_str(value).with_context(|| format!("invalid value {value:?} for {name}"))
}

pub fn update_n_batch(args: &mut Map<String, Value>) -> Result<()> {
    let Some(n_batch) = args.get("n_batch") else {
        return Ok(());
    };
    let n_batch = n_batch
        .as_u64()
        .filter(|n| *n > 0)
        .ok_or_else(|| anyhow!("n_batch must be a positive integer, got {n_batch}"))?;
    let Some(n_mc) = args.get("n_mc") else {
        warn!("n_mc is not provided, it will be set to the default value of Runner");
        return Ok(());
    };
    let n_mc = n_mc
        .as_u64()
        .ok_or_else(|| anyhow!("n_mc must be a non-negative integer, got {n_mc}"))?;
    if n_mc % n_batch != 0 {
        bail!("n_mc {n_mc} must be divisible by n_batch {n_batch}");
    }
    args.insert("n_mc".to_string(), Value::from(n_mc / n_batch));
    Ok(())
}

fn join_str(folder: &Path, name: &str) -> Value {
    Value::String(folder.join(name).to_string_lossy().into_owned())
}

pub fn update_output_toydata(args: &mut Map<String, Value>, outputfolder: &Path) -> Result<()> {
    let batched = args.contains_key("n_batch");
    for key in ["output_filename", "toydata_filename"] {
        if let Some(Value::String(name)) = args.get(key) {
            let name = if batched { add_i_batch(name)? } else { name.clone() };
            args.insert(key.to_string(), join_str(outputfolder, &name));
        }
    }
    Ok(())
}

fn take_values(args: &mut Map<String, Value>, key: &str) -> Result<Map<String, Value>> {
    match args.remove(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(m)) => Ok(m),
        Some(other) => bail!("{key} must be a map, got {other}"),
    }
}

/// Move arguments naming model parameters into generate_values (fittable)
/// or nominal_values (not fittable).
pub fn update_runner_args(
    args: &mut Map<String, Value>,
    parameters_fittable: &[String],
    parameters_not_fittable: &[String],
) -> Result<()> {
    let mut generate_values = take_values(args, "generate_values")?;
    let mut nominal_values = take_values(args, "nominal_values")?;
    let keys: Vec<String> = args.keys().cloned().collect();
    for k in keys {
        if parameters_fittable.contains(&k) {
            if let Some(v) = args.remove(&k) {
                generate_values.insert(k, v);
            }
        } else if parameters_not_fittable.contains(&k)
            && let Some(v) = args.remove(&k)
        {
            nominal_values.insert(k, v);
        }
    }
    let unknown: Vec<&String> = generate_values
        .keys()
        .filter(|k| !parameters_fittable.contains(k))
        .collect();
    if !unknown.is_empty() {
        bail!(
            "generate_values {unknown:?} should be a subset of the fittable parameters {parameters_fittable:?}"
        );
    }
    for (label, values) in [("generate_values", &generate_values), ("nominal_values", &nominal_values)] {
        if let Some((k, v)) = values.iter().find(|(_, v)| !v.is_number()) {
            bail!("{label} must be numeric, {k} is {v}");
        }
    }
    args.insert("generate_values".to_string(), Value::Object(generate_values));
    args.insert("nominal_values".to_string(), Value::Object(nominal_values));
    Ok(())
}

/// Place the threshold file into the output folder and hand it to the model arguments.
pub fn update_limit_threshold(
    args: &mut Map<String, Value>,
    outputfolder: &Path,
    template_path: Option<&Path>,
) -> Result<()> {
    let mut model_args = take_values(args, "statistical_model_args")?;
    if let Some(tp) = template_path {
        model_args.insert(
            "template_path".to_string(),
            Value::String(tp.to_string_lossy().into_owned()),
        );
    }
    match args.remove("limit_threshold") {
        None | Some(Value::Null) => {}
        Some(Value::String(name)) => {
            model_args.insert("limit_threshold".to_string(), join_str(outputfolder, &name));
        }
        Some(other) => bail!("limit_threshold must be a file name, got {other}"),
    }
    args.insert("statistical_model_args".to_string(), Value::Object(model_args));
    Ok(())
}

pub fn check_redundant_arguments(args: &Map<String, Value>) -> Result<()> {
    let unknown: Vec<&String> = args
        .keys()
        .filter(|k| !RUNNER_ARGUMENTS.contains(&k.as_str()) && k.as_str() != "n_batch")
        .collect();
    if !unknown.is_empty() {
        bail!(
            "not all arguments are supported, acceptable are {RUNNER_ARGUMENTS:?} and n_batch, unknown: {unknown:?}"
        );
    }
    Ok(())
}

fn numeric_map(args: &Map<String, Value>, key: &str) -> ParameterValues {
    args.get(key)
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct Submitter {
    pub config: SubmitterConfig,
    pub computation: Computation,
    pub outputfolder: PathBuf,
    pub statistical_model_config: PathBuf,
    pub parameters_fittable: Vec<String>,
    pub parameters_not_fittable: Vec<String>,
    pub executable: String,
}

impl Submitter {
    /// `config_path` anchors a relative `statistical_model_config`.
    pub fn new(config: SubmitterConfig, config_path: Option<&Path>) -> Result<Self> {
        let raw = config
            .computation_options
            .get(&config.computation)
            .ok_or_else(|| {
                anyhow!(
                    "computation {} is not in computation_options {:?}",
                    config.computation,
                    config.computation_options.keys().collect::<Vec<_>>()
                )
            })?;
        let computation: Computation = serde_json::from_value(raw.clone()).with_context(|| {
            format!(
                "keys in computation_options.{} should be to_zip, to_vary or in_common",
                config.computation
            )
        })?;

        let outputfolder = config
            .outputfolder
            .clone()
            .ok_or_else(|| anyhow!("outputfolder is not provided"))?;
        fs::create_dir_all(&outputfolder)
            .with_context(|| format!("failed to create outputfolder {outputfolder:?}"))?;
        let outputfolder = std::path::absolute(&outputfolder)?;

        let statistical_model_config = match config_path {
            Some(anchor) => resolve_relative(&config.statistical_model_config, anchor),
            None => config.statistical_model_config.clone(),
        };
        if !statistical_model_config.is_file() {
            bail!(
                "statistical_model_config {statistical_model_config:?} is not a valid filename or does not exist, \
                 presumably it should be in the same folder as the submitter config"
            );
        }

        let model_config = load_model_config(&statistical_model_config)?;
        let model = build_model(
            &config.statistical_model,
            &ModelSpec {
                parameter_definition: Some(model_config.parameter_definition),
                likelihood_config: model_config.likelihood_config,
                nominal_values: ParameterValues::new(),
                template_path: config.template_path.clone(),
            },
        )?;
        let mut parameters_fittable = model.parameters().fittable();
        parameters_fittable.push(POI_EXPECTATION.to_string());
        let parameters_not_fittable = model.parameters().not_fittable();

        Ok(Self {
            config,
            computation,
            outputfolder,
            statistical_model_config,
            parameters_fittable,
            parameters_not_fittable,
            executable: "alea".to_string(),
        })
    }

    pub fn from_config(path: &Path) -> Result<Self> {
        let config: SubmitterConfig = load_yaml(path)?;
        Self::new(config, Some(path))
    }

    pub fn merged_arguments(&self) -> Result<Vec<Map<String, Value>>> {
        let defaults = RunnerConfig::defaults_map()?;
        let variations = compute_variations(
            &self.computation.to_zip,
            &self.computation.to_vary,
            &self.computation.in_common,
        )?;

        let mut common = Map::new();
        common.insert(
            "statistical_model".to_string(),
            Value::String(self.config.statistical_model.clone()),
        );
        common.insert(
            "statistical_model_config".to_string(),
            Value::String(self.statistical_model_config.to_string_lossy().into_owned()),
        );
        common.insert("poi".to_string(), Value::String(self.config.poi.clone()));
        if let Some(first) = variations.first() {
            let clash: Vec<&String> = first.keys().filter(|k| common.contains_key(*k)).collect();
            if !clash.is_empty() {
                bail!(
                    "arguments {clash:?} are specified in computation_options, but they are already specified in the submitter"
                );
            }
        }

        let mut out = Vec::with_capacity(variations.len());
        for merged in variations {
            let mut args = defaults.clone();
            args.extend(merged);
            args.extend(common.clone());
            update_n_batch(&mut args)?;
            update_output_toydata(&mut args, &self.outputfolder)?;
            update_runner_args(&mut args, &self.parameters_fittable, &self.parameters_not_fittable)?;
            update_limit_threshold(&mut args, &self.outputfolder, self.config.template_path.as_deref())?;
            check_redundant_arguments(&args)?;
            out.push(args);
        }
        Ok(out)
    }

    pub fn computation_tickets(&self) -> Result<Vec<Ticket>> {
        let mut tickets = Vec::new();
        for args in self.merged_arguments()? {
            let n_batch = args.get("n_batch").and_then(Value::as_u64).unwrap_or(1);
            for i_batch in 0..n_batch {
                let mut a = args.clone();
                a.remove("n_batch");

                // generate values win over nominal values
                let mut needed = ParameterValues::from([("i_batch".to_string(), i_batch as f64)]);
                needed.extend(numeric_map(&a, "nominal_values"));
                needed.extend(numeric_map(&a, "generate_values"));
                for key in ["output_filename", "toydata_filename"] {
                    if let Some(Value::String(name)) = a.get(key).cloned() {
                        let formatted = format_template(&name, &needed)
                            .with_context(|| format!("please check the {key}"))?;
                        a.insert(key.to_string(), Value::String(formatted));
                    }
                }
                if let Some(Value::Object(model_args)) = a.get_mut("statistical_model_args")
                    && let Some(Value::String(name)) = model_args.get("limit_threshold").cloned()
                {
                    let formatted = format_template(&name, &needed)
                        .context("please check the limit_threshold")?;
                    model_args.insert("limit_threshold".to_string(), Value::String(formatted));
                }
                if let Some(seed) = a.get("seed").and_then(Value::as_u64) {
                    a.insert("seed".to_string(), Value::from(seed.wrapping_add(i_batch)));
                }

                let mut cli_args = vec!["run-toymc".to_string()];
                for name in RUNNER_ARGUMENTS {
                    match a.get(*name) {
                        None | Some(Value::Null) => {}
                        Some(v) => {
                            cli_args.push(format!("--{name}"));
                            cli_args.push(arg_to_str(v));
                        }
                    }
                }
                let script = std::iter::once(self.executable.clone())
                    .chain(cli_args.iter().map(|s| shell_quote(s)))
                    .collect::<Vec<_>>()
                    .join(" ");
                let config = RunnerConfig::from_map(a)?;
                tickets.push(Ticket {
                    output_filename: config.output_filename.clone(),
                    config,
                    args: cli_args,
                    script,
                });
            }
        }
        Ok(tickets)
    }
}

pub trait Submit {
    fn submit(&self, submitter: &Submitter) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct LocalSubmitter {
    pub progress: bool,
}

impl Submit for LocalSubmitter {
    fn submit(&self, submitter: &Submitter) -> Result<()> {
        let tickets = submitter.computation_tickets()?;
        info!(n_jobs = tickets.len(), "submitting locally");
        for (i, ticket) in tickets.iter().enumerate() {
            if submitter.config.debug {
                println!("{}", ticket.script);
            }
            let pb = progress::spinner("Job", &format!("{}/{}", i + 1, tickets.len()), self.progress);
            Runner::new(ticket.config.clone())
                .and_then(|r| r.with_progress(false).run())
                .with_context(|| format!("job {i} failed: {}", ticket.script))?;
            pb.finish_and_clear();
            if let Some(out) = &ticket.output_filename {
                info!("job {i} wrote {}", out.display());
            }
            if submitter.config.debug {
                info!("debug mode: only the first job is run");
                break;
            }
        }
        Ok(())
    }
}
