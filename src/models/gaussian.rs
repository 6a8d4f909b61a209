use anyhow::{Result, anyhow, bail};
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Normal};
use statrs::distribution::{Continuous, Normal as NormalPdf};

use crate::data::{Dataset, ToyData};
use crate::model::StatisticalModel;
use crate::parameters::{ParameterDefinition, ParameterValues, Parameters};

const TERM: &str = "gaussian";

/// A single Gaussian measurement `hat_mu` of a mean `mu` with width `sigma`.
#[derive(Debug, Clone)]
pub struct GaussianModel {
    parameters: Parameters,
}

impl GaussianModel {
    pub fn new(definition: Option<&ParameterDefinition>) -> Result<Self> {
        let parameters = match definition {
            Some(def) => Parameters::from_definition(def)?,
            None => Parameters::from_names(&["mu", "sigma"])?,
        };
        for required in ["mu", "sigma"] {
            if !parameters.contains(required) {
                bail!("GaussianModel needs a {required} parameter");
            }
        }
        Ok(Self { parameters })
    }

    /// Observed-data helper: a single measurement.
    pub fn data_from_measurement(hat_mu: f64) -> ToyData {
        ToyData::new(vec![Dataset::new(TERM).with_column("hat_mu", vec![hat_mu])])
    }
}

fn mu_sigma(values: &ParameterValues) -> Result<(f64, f64)> {
    let mu = values.get("mu").copied().ok_or_else(|| anyhow!("mu is missing"))?;
    let sigma = values
        .get("sigma")
        .copied()
        .ok_or_else(|| anyhow!("sigma is missing"))?;
    Ok((mu, sigma))
}

impl StatisticalModel for GaussianModel {
    fn name(&self) -> &str {
        "GaussianModel"
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.parameters
    }

    fn likelihood_names(&self) -> Vec<String> {
        vec![TERM.to_string()]
    }

    fn log_likelihood(&self, data: &ToyData, values: &ParameterValues) -> Result<f64> {
        let (mu, sigma) = mu_sigma(values)?;
        let hat_mu = data.require(TERM)?.scalar("hat_mu")?;
        if !(sigma > 0.0) || !mu.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        let dist = NormalPdf::new(mu, sigma).map_err(|e| anyhow!("invalid normal: {e}"))?;
        Ok(dist.ln_pdf(hat_mu))
    }

    fn simulate(&self, values: &ParameterValues, rng: &mut SmallRng) -> Result<ToyData> {
        let (mu, sigma) = mu_sigma(values)?;
        let dist = Normal::new(mu, sigma)
            .map_err(|e| anyhow!("cannot sample N({mu}, {sigma}): {e}"))?;
        Ok(Self::data_from_measurement(dist.sample(rng)))
    }
}
