use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Values keyed by parameter name.
pub type ParameterValues = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Rate,
    Shape,
    Livetime,
    Index,
    Other,
}

/// One model parameter and how it is treated by fits and simulations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Parameter {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub nominal_value: Option<f64>,
    #[serde(default = "default_true")]
    pub fittable: bool,
    #[serde(default)]
    pub ptype: Option<ParameterType>,
    #[serde(default)]
    pub uncertainty: Option<f64>,
    #[serde(default)]
    pub relative_uncertainty: bool,
    #[serde(default)]
    pub fit_limits: Option<[Option<f64>; 2]>,
    #[serde(default)]
    pub parameter_interval_bounds: Option<[f64; 2]>,
    #[serde(default)]
    pub fit_guess: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Parameter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nominal_value: None,
            fittable: true,
            ptype: None,
            uncertainty: None,
            relative_uncertainty: false,
            fit_limits: None,
            parameter_interval_bounds: None,
            fit_guess: None,
            description: None,
        }
    }

    pub fn lower_limit(&self) -> Option<f64> {
        self.fit_limits.and_then(|[lo, _]| lo)
    }

    pub fn upper_limit(&self) -> Option<f64> {
        self.fit_limits.and_then(|[_, hi]| hi)
    }

    /// Fit guess, falling back to the nominal value.
    pub fn guess(&self) -> Option<f64> {
        self.fit_guess.or(self.nominal_value)
    }

    /// Absolute uncertainty; relative ones scale with the nominal value.
    pub fn absolute_uncertainty(&self) -> Option<f64> {
        let u = self.uncertainty?;
        if self.relative_uncertainty {
            self.nominal_value.map(|n| u * n)
        } else {
            Some(u)
        }
    }

    pub fn value_in_fit_limits(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let above = self.lower_limit().is_none_or(|lo| value >= lo);
        let below = self.upper_limit().is_none_or(|hi| value <= hi);
        above && below
    }

    /// Clamp `value` into the fit limits.
    pub fn clip_to_fit_limits(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(lo) = self.lower_limit()
            && v < lo
        {
            v = lo;
        }
        if let Some(hi) = self.upper_limit()
            && v > hi
        {
            v = hi;
        }
        v
    }

    fn validate(&self) -> Result<()> {
        if let (Some(lo), Some(hi)) = (self.lower_limit(), self.upper_limit())
            && lo >= hi
        {
            bail!(
                "fit_limits of {} must be increasing, got [{lo}, {hi}]",
                self.name
            );
        }
        if let Some([lo, hi]) = self.parameter_interval_bounds {
            if lo >= hi {
                bail!(
                    "parameter_interval_bounds of {} must be increasing, got [{lo}, {hi}]",
                    self.name
                );
            }
            if !self.value_in_fit_limits(lo) || !self.value_in_fit_limits(hi) {
                bail!(
                    "parameter_interval_bounds [{lo}, {hi}] of {} exceed its fit_limits",
                    self.name
                );
            }
        }
        if self.ptype == Some(ParameterType::Rate) && !self.name.ends_with("_rate_multiplier") {
            bail!(
                "rate parameter {} must be named <source>_rate_multiplier",
                self.name
            );
        }
        if let Some(u) = self.uncertainty
            && !(u.is_finite() && u > 0.0)
        {
            bail!("uncertainty of {} must be positive, got {u}", self.name);
        }
        Ok(())
    }
}

/// Either a plain list of names or a full definition per name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterDefinition {
    Names(Vec<String>),
    Definitions(BTreeMap<String, Parameter>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    parameters: BTreeMap<String, Parameter>,
}

impl Parameters {
    pub fn from_definition(def: &ParameterDefinition) -> Result<Self> {
        match def {
            ParameterDefinition::Names(names) => Self::from_names(names),
            ParameterDefinition::Definitions(map) => {
                let mut out = Self::default();
                for (name, p) in map {
                    let mut p = p.clone();
                    p.name = name.clone();
                    out.add(p)?;
                }
                Ok(out)
            }
        }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut out = Self::default();
        for name in names {
            out.add(Parameter::new(name.as_ref()))?;
        }
        Ok(out)
    }

    pub fn add(&mut self, parameter: Parameter) -> Result<()> {
        if parameter.name.is_empty() {
            bail!("parameter name must not be empty");
        }
        if self.parameters.contains_key(&parameter.name) {
            bail!("parameter {} is defined twice", parameter.name);
        }
        parameter.validate()?;
        self.parameters.insert(parameter.name.clone(), parameter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }

    pub fn fittable(&self) -> Vec<String> {
        self.iter()
            .filter(|p| p.fittable)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn not_fittable(&self) -> Vec<String> {
        self.iter()
            .filter(|p| !p.fittable)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn nominal_values(&self) -> ParameterValues {
        self.iter()
            .filter_map(|p| p.nominal_value.map(|v| (p.name.clone(), v)))
            .collect()
    }

    pub fn fit_guesses(&self) -> ParameterValues {
        self.iter()
            .filter_map(|p| p.guess().map(|v| (p.name.clone(), v)))
            .collect()
    }

    pub fn uncertainties(&self) -> ParameterValues {
        self.iter()
            .filter_map(|p| p.absolute_uncertainty().map(|u| (p.name.clone(), u)))
            .collect()
    }

    pub fn with_uncertainty(&self) -> Parameters {
        Parameters {
            parameters: self
                .parameters
                .iter()
                .filter(|(_, p)| p.uncertainty.is_some())
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    fn check_known(&self, values: &ParameterValues) -> Result<()> {
        let unknown: Vec<&str> = values
            .keys()
            .filter(|k| !self.contains(k))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            bail!(
                "unknown parameters {:?}, known parameters are {:?}",
                unknown,
                self.names()
            );
        }
        Ok(())
    }

    /// Complete value map: `overrides` win over nominal values.
    pub fn resolve(&self, overrides: &ParameterValues) -> Result<ParameterValues> {
        self.resolve_filtered(overrides, false)
    }

    /// Like [`Parameters::resolve`] but only returns fittable parameters.
    pub fn resolve_fittable(&self, overrides: &ParameterValues) -> Result<ParameterValues> {
        self.resolve_filtered(overrides, true)
    }

    fn resolve_filtered(
        &self,
        overrides: &ParameterValues,
        fittable_only: bool,
    ) -> Result<ParameterValues> {
        self.check_known(overrides)?;
        let mut values = ParameterValues::new();
        let mut missing = Vec::new();
        for p in self.iter() {
            if fittable_only && !p.fittable {
                continue;
            }
            match overrides.get(&p.name).copied().or(p.nominal_value) {
                Some(v) => {
                    values.insert(p.name.clone(), v);
                }
                None => missing.push(p.name.clone()),
            }
        }
        if !missing.is_empty() {
            bail!("missing values for parameters {missing:?}");
        }
        Ok(values)
    }

    pub fn set_nominal_values(&mut self, values: &ParameterValues) -> Result<()> {
        self.check_known(values)?;
        for (name, v) in values {
            if let Some(p) = self.parameters.get_mut(name) {
                p.nominal_value = Some(*v);
            }
        }
        Ok(())
    }

    pub fn set_fit_guesses(&mut self, values: &ParameterValues) -> Result<()> {
        self.check_known(values)?;
        for (name, v) in values {
            if let Some(p) = self.parameters.get_mut(name) {
                p.fit_guess = Some(*v);
            }
        }
        Ok(())
    }

    pub fn value_in_fit_limits(&self, name: &str, value: f64) -> Result<bool> {
        match self.get(name) {
            Some(p) => Ok(p.value_in_fit_limits(value)),
            None => bail!("unknown parameter {name}"),
        }
    }

    pub fn values_in_fit_limits(&self, values: &ParameterValues) -> Result<bool> {
        for (name, v) in values {
            if !self.value_in_fit_limits(name, *v)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
