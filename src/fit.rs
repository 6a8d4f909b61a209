use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use tracing::{debug, warn};

use crate::data::ToyData;
use crate::model::StatisticalModel;
use crate::opt::{Bounds, MinimizerConfig, minimize};
use crate::parameters::ParameterValues;

#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    pub values: ParameterValues,
    pub max_ll: f64,
    pub n_iter: usize,
    pub converged: bool,
}

/// Maximise the likelihood over the fittable parameters not listed in `fixed`.
///
/// Fixed parameters keep the given value, non-fittable ones their nominal
/// value, and free ones start from their fit guess.
pub fn fit(
    model: &dyn StatisticalModel,
    data: &ToyData,
    fixed: &ParameterValues,
    config: &MinimizerConfig,
) -> Result<FitResult> {
    let parameters = model.parameters();
    let mut overrides = fixed.clone();
    let mut free = Vec::new();
    let mut x0 = Vec::new();
    let mut bounds = Vec::new();
    for p in parameters.iter() {
        if !p.fittable || fixed.contains_key(&p.name) {
            continue;
        }
        let guess = p
            .guess()
            .ok_or_else(|| anyhow!("parameter {} has neither fit_guess nor nominal_value", p.name))?;
        overrides.insert(p.name.clone(), guess);
        free.push(p.name.clone());
        x0.push(guess);
        bounds.push(Bounds {
            lo: p.lower_limit(),
            hi: p.upper_limit(),
        });
    }
    if !parameters.values_in_fit_limits(&overrides)? {
        bail!("fit guesses {overrides:?} are not within fit limits");
    }
    let base = parameters.resolve(&overrides)?;

    let objective = |x: &[f64]| -> Result<f64> {
        let mut values = base.clone();
        for (name, v) in free.iter().zip(x.iter()) {
            values.insert(name.clone(), *v);
        }
        Ok(-model.log_likelihood(data, &values)?)
    };
    let minimum = minimize(&objective, &x0, &bounds, config)?;

    let mut values = base;
    for (name, v) in free.iter().zip(minimum.x.iter()) {
        values.insert(name.clone(), *v);
    }
    if !minimum.converged {
        warn!(
            model = model.name(),
            n_iter = minimum.n_iter,
            "fit did not converge, fixed: {fixed:?}"
        );
    } else {
        debug!(model = model.name(), n_iter = minimum.n_iter, max_ll = -minimum.f, "fit converged");
    }
    Ok(FitResult {
        values,
        max_ll: -minimum.f,
        n_iter: minimum.n_iter,
        converged: minimum.converged,
    })
}
