use anyhow::{Result, bail};
use clap::Args;
use serde_json::Map;

use crate::runner::{RUNNER_ARGUMENTS, RunnerConfig};
use crate::submitter::str_to_arg;

/// Runner arguments as passed on the command line; maps and lists are JSON.
#[derive(Args, Debug, Clone, Default)]
pub struct RunToymcArgs {
    #[arg(long = "statistical_model")]
    pub statistical_model: Option<String>,
    #[arg(long = "poi")]
    pub poi: Option<String>,
    #[arg(long = "hypotheses", help = "JSON list, e.g. [\"free\",\"null\"]")]
    pub hypotheses: Option<String>,
    #[arg(long = "n_mc")]
    pub n_mc: Option<String>,
    #[arg(long = "common_hypothesis", allow_hyphen_values = true)]
    pub common_hypothesis: Option<String>,
    #[arg(long = "generate_values", allow_hyphen_values = true)]
    pub generate_values: Option<String>,
    #[arg(long = "nominal_values", allow_hyphen_values = true)]
    pub nominal_values: Option<String>,
    #[arg(long = "statistical_model_config")]
    pub statistical_model_config: Option<String>,
    #[arg(long = "parameter_definition", allow_hyphen_values = true)]
    pub parameter_definition: Option<String>,
    #[arg(long = "statistical_model_args")]
    pub statistical_model_args: Option<String>,
    #[arg(long = "likelihood_config", allow_hyphen_values = true)]
    pub likelihood_config: Option<String>,
    #[arg(long = "compute_confidence_interval")]
    pub compute_confidence_interval: Option<String>,
    #[arg(long = "confidence_level")]
    pub confidence_level: Option<String>,
    #[arg(long = "confidence_interval_kind")]
    pub confidence_interval_kind: Option<String>,
    #[arg(long = "toydata_mode")]
    pub toydata_mode: Option<String>,
    #[arg(long = "toydata_filename")]
    pub toydata_filename: Option<String>,
    #[arg(long = "only_toydata")]
    pub only_toydata: Option<String>,
    #[arg(long = "output_filename")]
    pub output_filename: Option<String>,
    #[arg(long = "seed")]
    pub seed: Option<String>,
    #[arg(long = "metadata")]
    pub metadata: Option<String>,
}

impl RunToymcArgs {
    fn value_of(&self, name: &str) -> Option<&String> {
        match name {
            "statistical_model" => self.statistical_model.as_ref(),
            "poi" => self.poi.as_ref(),
            "hypotheses" => self.hypotheses.as_ref(),
            "n_mc" => self.n_mc.as_ref(),
            "common_hypothesis" => self.common_hypothesis.as_ref(),
            "generate_values" => self.generate_values.as_ref(),
            "nominal_values" => self.nominal_values.as_ref(),
            "statistical_model_config" => self.statistical_model_config.as_ref(),
            "parameter_definition" => self.parameter_definition.as_ref(),
            "statistical_model_args" => self.statistical_model_args.as_ref(),
            "likelihood_config" => self.likelihood_config.as_ref(),
            "compute_confidence_interval" => self.compute_confidence_interval.as_ref(),
            "confidence_level" => self.confidence_level.as_ref(),
            "confidence_interval_kind" => self.confidence_interval_kind.as_ref(),
            "toydata_mode" => self.toydata_mode.as_ref(),
            "toydata_filename" => self.toydata_filename.as_ref(),
            "only_toydata" => self.only_toydata.as_ref(),
            "output_filename" => self.output_filename.as_ref(),
            "seed" => self.seed.as_ref(),
            "metadata" => self.metadata.as_ref(),
            _ => None,
        }
    }

    /// Runner defaults overridden by every flag given.
    pub fn to_config(&self) -> Result<RunnerConfig> {
        let mut map = RunnerConfig::defaults_map()?;
        for name in RUNNER_ARGUMENTS {
            if let Some(raw) = self.value_of(name) {
                map.insert(name.to_string(), str_to_arg(name, raw)?);
            }
        }
        RunnerConfig::from_map(map)
    }
}

/// Parse `--name value` pairs, as written into tickets, into a runner config.
pub fn runner_config_from_args<S: AsRef<str>>(args: &[S]) -> Result<RunnerConfig> {
    let mut map = RunnerConfig::defaults_map()?;
    let mut given = Map::new();
    let mut it = args.iter().map(AsRef::as_ref);
    while let Some(flag) = it.next() {
        let Some(name) = flag.strip_prefix("--") else {
            bail!("expected --<argument>, got {flag:?}");
        };
        let Some(raw) = it.next() else {
            bail!("argument --{name} has no value");
        };
        if given.contains_key(name) {
            bail!("argument --{name} given twice");
        }
        given.insert(name.to_string(), str_to_arg(name, raw)?);
    }
    map.extend(given);
    RunnerConfig::from_map(map)
}
