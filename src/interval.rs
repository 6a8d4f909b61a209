use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::fmt;
use std::path::Path;

use crate::data::ToyData;
use crate::fit::fit;
use crate::io::config::{ThresholdTable, load_threshold};
use crate::model::StatisticalModel;
use crate::opt::{MinimizerConfig, brentq};
use crate::parameters::ParameterValues;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    #[default]
    Central,
    Upper,
    Lower,
}

impl IntervalKind {
    fn wants_upper(self) -> bool {
        matches!(self, IntervalKind::Central | IntervalKind::Upper)
    }

    fn wants_lower(self) -> bool {
        matches!(self, IntervalKind::Central | IntervalKind::Lower)
    }
}

impl fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntervalKind::Central => "central",
            IntervalKind::Upper => "upper",
            IntervalKind::Lower => "lower",
        };
        f.write_str(s)
    }
}

fn check_confidence_level(confidence_level: f64) -> Result<()> {
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        bail!("confidence_level must be in (0, 1), got {confidence_level}");
    }
    Ok(())
}

/// Wilks critical value of 2 * delta log-likelihood for one parameter.
pub fn asymptotic_critical_value(kind: IntervalKind, confidence_level: f64) -> Result<f64> {
    check_confidence_level(confidence_level)?;
    let chi2 = ChiSquared::new(1.0).map_err(|e| anyhow!("chi2 distribution: {e}"))?;
    let tail = match kind {
        IntervalKind::Central => 1.0 - confidence_level,
        IntervalKind::Upper | IntervalKind::Lower => 2.0 * (1.0 - confidence_level),
    };
    if tail >= 1.0 {
        bail!("confidence_level {confidence_level} is too low for a one-sided {kind} interval");
    }
    Ok(chi2.inverse_cdf(1.0 - tail))
}

/// Threshold that the profile test statistic is compared with.
#[derive(Debug, Clone)]
pub enum CriticalValue {
    Constant(f64),
    Interpolated(ThresholdTable),
}

impl CriticalValue {
    pub fn asymptotic(kind: IntervalKind, confidence_level: f64) -> Result<Self> {
        Ok(Self::Constant(asymptotic_critical_value(kind, confidence_level)?))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let table = load_threshold(path)
            .with_context(|| format!("failed to load limit threshold {path:?}"))?;
        Ok(Self::Interpolated(table))
    }

    pub fn at(&self, poi_value: f64) -> f64 {
        match self {
            CriticalValue::Constant(v) => *v,
            CriticalValue::Interpolated(table) => table.interpolate(poi_value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntervalRequest<'a> {
    pub poi: &'a str,
    /// Search range; defaults to the poi's parameter_interval_bounds.
    pub parameter_interval_bounds: Option<[f64; 2]>,
    pub kind: IntervalKind,
    pub critical_value: &'a CriticalValue,
    pub best_fit_args: &'a ParameterValues,
    pub interval_args: &'a ParameterValues,
}

/// Profile-likelihood interval `(lower, upper)` of the poi.
///
/// Limits not requested by the kind are NaN; a requested limit whose
/// threshold is never crossed inside the search range is infinite.
pub fn confidence_interval(
    model: &dyn StatisticalModel,
    data: &ToyData,
    request: &IntervalRequest<'_>,
    config: &MinimizerConfig,
) -> Result<(f64, f64)> {
    let poi = model
        .parameters()
        .get(request.poi)
        .ok_or_else(|| anyhow!("poi {} is not a parameter of {}", request.poi, model.name()))?;
    let [lo, hi] = match request.parameter_interval_bounds {
        Some(b) => b,
        None => poi.parameter_interval_bounds.ok_or_else(|| {
            anyhow!(
                "no parameter_interval_bounds given and none defined for {}",
                request.poi
            )
        })?,
    };
    if lo >= hi {
        bail!("parameter_interval_bounds must be increasing, got [{lo}, {hi}]");
    }
    if !poi.value_in_fit_limits(lo) || !poi.value_in_fit_limits(hi) {
        bail!(
            "parameter_interval_bounds [{lo}, {hi}] exceed the fit limits of {}",
            request.poi
        );
    }
    if request.interval_args.contains_key(request.poi) {
        bail!("interval_args must not fix the poi {}", request.poi);
    }

    let best = fit(model, data, request.best_fit_args, config)?;
    let best_poi = best.values[request.poi].clamp(lo, hi);

    let statistic = |x: f64| -> Result<f64> {
        let mut fixed = request.interval_args.clone();
        fixed.insert(request.poi.to_string(), x);
        let profile = fit(model, data, &fixed, config)?;
        Ok(2.0 * (best.max_ll - profile.max_ll) - request.critical_value.at(x))
    };

    let xtol = 1e-8 * (hi - lo);
    let upper = if !request.kind.wants_upper() {
        f64::NAN
    } else if best_poi < hi && statistic(hi)? > 0.0 {
        brentq(&statistic, best_poi, hi, xtol, 200)?
    } else {
        f64::INFINITY
    };
    let lower = if !request.kind.wants_lower() {
        f64::NAN
    } else if best_poi > lo && statistic(lo)? > 0.0 {
        brentq(&statistic, lo, best_poi, xtol, 200)?
    } else {
        f64::NEG_INFINITY
    };
    Ok((lower, upper))
}
