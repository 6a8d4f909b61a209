use anyhow::{Context, Result, anyhow, bail};
use ndarray::{Array1, Array2};
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Normal, Poisson};
use serde::Deserialize;
use statrs::function::gamma::ln_gamma;
use std::collections::BTreeMap;
use std::path::Path;

use crate::data::{Dataset, ToyData};
use crate::io::config::load_template;
use crate::model::StatisticalModel;
use crate::parameters::{ParameterDefinition, ParameterValues, Parameters};

pub const ANCILLARY: &str = "ancillary_likelihood";
pub const GENERATE_VALUES: &str = "generate_values";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub histogram: Option<Vec<f64>>,
    /// JSON file holding the histogram, relative to the template path.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub rate_parameter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TermConfig {
    pub name: String,
    pub bin_edges: Vec<f64>,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub livetime_parameter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinnedConfig {
    pub likelihood_terms: Vec<TermConfig>,
}

#[derive(Debug, Clone)]
struct Term {
    name: String,
    bin_edges: Vec<f64>,
    source_names: Vec<String>,
    rate_parameters: Vec<String>,
    livetime_parameter: Option<String>,
    // sources x bins
    templates: Array2<f64>,
}

impl Term {
    fn expected(&self, values: &ParameterValues) -> Result<Array1<f64>> {
        let mut multipliers = Array1::zeros(self.rate_parameters.len());
        for (i, p) in self.rate_parameters.iter().enumerate() {
            multipliers[i] = lookup(values, p)?;
        }
        let livetime = match &self.livetime_parameter {
            Some(p) => lookup(values, p)?,
            None => 1.0,
        };
        Ok(self.templates.t().dot(&multipliers) * livetime)
    }
}

fn lookup(values: &ParameterValues, name: &str) -> Result<f64> {
    values
        .get(name)
        .copied()
        .ok_or_else(|| anyhow!("value of {name} is missing"))
}

fn poisson_ln_pmf(n: f64, mu: f64) -> f64 {
    if mu <= 0.0 {
        return if n == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    n * mu.ln() - mu - ln_gamma(n + 1.0)
}

/// Extended binned likelihood: Poisson counts from a sum of scaled templates,
/// plus Gaussian ancillary constraints for parameters with an uncertainty.
#[derive(Debug, Clone)]
pub struct BinnedExtendedModel {
    parameters: Parameters,
    terms: Vec<Term>,
}

impl BinnedExtendedModel {
    pub fn new(
        definition: &ParameterDefinition,
        likelihood_config: &serde_json::Value,
        template_path: Option<&Path>,
    ) -> Result<Self> {
        let parameters = Parameters::from_definition(definition)?;
        let config: BinnedConfig = serde_json::from_value(likelihood_config.clone())
            .context("invalid likelihood_config for BinnedExtendedModel")?;
        if config.likelihood_terms.is_empty() {
            bail!("likelihood_config defines no likelihood terms");
        }
        let mut terms = Vec::with_capacity(config.likelihood_terms.len());
        for tc in &config.likelihood_terms {
            terms.push(build_term(tc, &parameters, template_path)?);
        }
        let mut seen = Vec::new();
        for t in &terms {
            if seen.contains(&t.name) || t.name == ANCILLARY || t.name == GENERATE_VALUES {
                bail!("likelihood term name {} is duplicated or reserved", t.name);
            }
            seen.push(t.name.clone());
        }
        Ok(Self { parameters, terms })
    }

    pub fn bin_edges(&self, term: &str) -> Option<&[f64]> {
        self.terms
            .iter()
            .find(|t| t.name == term)
            .map(|t| t.bin_edges.as_slice())
    }

    /// Expected counts per bin of one likelihood term.
    pub fn expected_counts(&self, term: &str, values: &ParameterValues) -> Result<Vec<f64>> {
        let t = self
            .terms
            .iter()
            .find(|t| t.name == term)
            .ok_or_else(|| anyhow!("unknown likelihood term {term}"))?;
        Ok(t.expected(values)?.to_vec())
    }

    /// Asimov data set: expected counts and nominal ancillary measurements.
    pub fn asimov_data(&self, overrides: &ParameterValues) -> Result<ToyData> {
        let values = self.parameters.resolve(overrides)?;
        let mut datasets = Vec::with_capacity(self.terms.len() + 1);
        for t in &self.terms {
            datasets.push(Dataset::new(&t.name).with_column("counts", t.expected(&values)?.to_vec()));
        }
        let mut anc = Dataset::new(ANCILLARY);
        for p in self.parameters.with_uncertainty().iter() {
            anc.columns.insert(p.name.clone(), vec![lookup(&values, &p.name)?]);
        }
        datasets.push(anc);
        Ok(ToyData::new(datasets))
    }

    fn ancillary_ll(&self, data: &ToyData, values: &ParameterValues) -> Result<f64> {
        let measured = data.get(ANCILLARY);
        let mut ll = 0.0;
        for p in self.parameters.with_uncertainty().iter() {
            let sigma = p
                .absolute_uncertainty()
                .ok_or_else(|| anyhow!("relative uncertainty of {} needs a nominal value", p.name))?;
            let center = match measured.and_then(|d| d.columns.get(&p.name)) {
                Some(col) => col
                    .first()
                    .copied()
                    .ok_or_else(|| anyhow!("ancillary measurement of {} is empty", p.name))?,
                None => p
                    .nominal_value
                    .ok_or_else(|| anyhow!("no ancillary measurement or nominal value for {}", p.name))?,
            };
            let z = (lookup(values, &p.name)? - center) / sigma;
            ll += -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln();
        }
        Ok(ll)
    }
}

fn build_term(tc: &TermConfig, parameters: &Parameters, template_path: Option<&Path>) -> Result<Term> {
    if tc.bin_edges.len() < 2 {
        bail!("term {} needs at least two bin edges", tc.name);
    }
    if tc.bin_edges.windows(2).any(|w| w[1] <= w[0]) {
        bail!("bin edges of term {} must be strictly increasing", tc.name);
    }
    if tc.sources.is_empty() {
        bail!("term {} has no sources", tc.name);
    }
    let n_bins = tc.bin_edges.len() - 1;
    let mut templates = Array2::zeros((tc.sources.len(), n_bins));
    let mut rate_parameters = Vec::with_capacity(tc.sources.len());
    for (s, source) in tc.sources.iter().enumerate() {
        let hist = match (&source.histogram, &source.template) {
            (Some(h), None) => h.clone(),
            (None, Some(file)) => {
                let path = match template_path {
                    Some(dir) => dir.join(file),
                    None => Path::new(file).to_path_buf(),
                };
                load_template(&path)?
            }
            _ => bail!(
                "source {} of term {} needs exactly one of histogram or template",
                source.name,
                tc.name
            ),
        };
        if hist.len() != n_bins {
            bail!(
                "histogram of source {} has {} bins, term {} has {}",
                source.name,
                hist.len(),
                tc.name,
                n_bins
            );
        }
        if hist.iter().any(|v| !v.is_finite() || *v < 0.0) {
            bail!("histogram of source {} has negative or non-finite entries", source.name);
        }
        for (b, v) in hist.iter().enumerate() {
            templates[(s, b)] = *v;
        }
        let rate = source
            .rate_parameter
            .clone()
            .unwrap_or_else(|| format!("{}_rate_multiplier", source.name));
        if !parameters.contains(&rate) {
            bail!("rate parameter {rate} of source {} is not defined", source.name);
        }
        rate_parameters.push(rate);
    }
    if let Some(lt) = &tc.livetime_parameter
        && !parameters.contains(lt)
    {
        bail!("livetime parameter {lt} of term {} is not defined", tc.name);
    }
    Ok(Term {
        name: tc.name.clone(),
        bin_edges: tc.bin_edges.clone(),
        source_names: tc.sources.iter().map(|s| s.name.clone()).collect(),
        rate_parameters,
        livetime_parameter: tc.livetime_parameter.clone(),
        templates,
    })
}

impl StatisticalModel for BinnedExtendedModel {
    fn name(&self) -> &str {
        "BinnedExtendedModel"
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.parameters
    }

    fn likelihood_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.terms.iter().map(|t| t.name.clone()).collect();
        names.push(ANCILLARY.to_string());
        names.push(GENERATE_VALUES.to_string());
        names
    }

    fn log_likelihood(&self, data: &ToyData, values: &ParameterValues) -> Result<f64> {
        let mut ll = 0.0;
        for t in &self.terms {
            let counts = data.require(&t.name)?.column("counts")?;
            if counts.len() != t.bin_edges.len() - 1 {
                bail!(
                    "term {} expects {} bins, data has {}",
                    t.name,
                    t.bin_edges.len() - 1,
                    counts.len()
                );
            }
            let mu = t.expected(values)?;
            for (n, m) in counts.iter().zip(mu.iter()) {
                ll += poisson_ln_pmf(*n, *m);
            }
        }
        Ok(ll + self.ancillary_ll(data, values)?)
    }

    fn simulate(&self, values: &ParameterValues, rng: &mut SmallRng) -> Result<ToyData> {
        let mut datasets = Vec::with_capacity(self.terms.len() + 2);
        for t in &self.terms {
            let mu = t.expected(values)?;
            let mut counts = Vec::with_capacity(mu.len());
            for m in mu.iter() {
                let n = if *m > 0.0 {
                    Poisson::new(*m)
                        .map_err(|e| anyhow!("cannot sample Poisson({m}): {e}"))?
                        .sample(rng)
                } else {
                    0.0
                };
                counts.push(n);
            }
            datasets.push(Dataset::new(&t.name).with_column("counts", counts));
        }

        let mut anc = Dataset::new(ANCILLARY);
        for p in self.parameters.with_uncertainty().iter() {
            let sigma = p
                .absolute_uncertainty()
                .ok_or_else(|| anyhow!("relative uncertainty of {} needs a nominal value", p.name))?;
            let truth = lookup(values, &p.name)?;
            let meas = Normal::new(truth, sigma)
                .map_err(|e| anyhow!("cannot sample N({truth}, {sigma}): {e}"))?
                .sample(rng);
            anc.columns
                .insert(p.name.clone(), vec![p.clip_to_fit_limits(meas)]);
        }
        datasets.push(anc);

        let mut truth = Dataset::new(GENERATE_VALUES);
        for (k, v) in values {
            truth.columns.insert(k.clone(), vec![*v]);
        }
        datasets.push(truth);
        Ok(ToyData::new(datasets))
    }

    fn expectation_values(&self, overrides: &ParameterValues) -> Result<BTreeMap<String, f64>> {
        let values = self.parameters.resolve(overrides)?;
        let mut out = BTreeMap::new();
        for t in &self.terms {
            let livetime = match &t.livetime_parameter {
                Some(p) => lookup(&values, p)?,
                None => 1.0,
            };
            for (s, source) in t.source_names.iter().enumerate() {
                let multiplier = lookup(&values, &t.rate_parameters[s])?;
                let total = t.templates.row(s).sum() * multiplier * livetime;
                *out.entry(source.clone()).or_insert(0.0) += total;
            }
        }
        Ok(out)
    }
}
