use anyhow::{Result, bail};
use rand::rngs::SmallRng;
use std::collections::BTreeMap;

use crate::data::ToyData;
use crate::parameters::{ParameterValues, Parameters};

/// A likelihood over named parameters that can also simulate its own data.
///
/// Implementors only evaluate complete value maps; resolving user overrides
/// against nominal values and fit limits happens in the provided methods.
pub trait StatisticalModel: Send + Sync {
    fn name(&self) -> &str;

    fn parameters(&self) -> &Parameters;

    fn parameters_mut(&mut self) -> &mut Parameters;

    /// Names of the likelihood terms, in the order datasets are produced.
    fn likelihood_names(&self) -> Vec<String> {
        vec!["0".to_string()]
    }

    fn log_likelihood(&self, data: &ToyData, values: &ParameterValues) -> Result<f64>;

    fn simulate(&self, values: &ParameterValues, rng: &mut SmallRng) -> Result<ToyData>;

    /// Expected number of events per source.
    fn expectation_values(&self, _values: &ParameterValues) -> Result<BTreeMap<String, f64>> {
        bail!("model {} does not provide expectation values", self.name())
    }

    fn ll(&self, data: &ToyData, overrides: &ParameterValues) -> Result<f64> {
        let values = self.parameters().resolve(overrides)?;
        self.log_likelihood(data, &values)
    }

    fn generate_data(&self, overrides: &ParameterValues, rng: &mut SmallRng) -> Result<ToyData> {
        if !self.parameters().values_in_fit_limits(overrides)? {
            bail!("generate values {overrides:?} are not within fit limits");
        }
        let values = self.parameters().resolve(overrides)?;
        self.simulate(&values, rng)
    }

    fn parameter_list(&self) -> Vec<String> {
        let mut names = self.parameters().names();
        names.sort();
        names
    }
}
