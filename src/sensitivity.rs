use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::io::config::ThresholdTable;
use crate::io::results::RunnerOutput;
use crate::utils::quantile;

/// Per-toy `2 (ll_free - ll_hypothesis)`, clipped at zero.
pub fn test_statistic(ll_free: &[f64], ll_hypothesis: &[f64]) -> Result<Vec<f64>> {
    if ll_free.len() != ll_hypothesis.len() {
        bail!(
            "free has {} toys but the hypothesis has {}",
            ll_free.len(),
            ll_hypothesis.len()
        );
    }
    Ok(ll_free
        .iter()
        .zip(ll_hypothesis)
        .map(|(f, h)| {
            let t = 2.0 * (f - h);
            if t.is_nan() { t } else { t.max(0.0) }
        })
        .collect())
}

/// Test statistic of `hypothesis` against the `free` table of a runner output.
pub fn output_test_statistic(output: &RunnerOutput, hypothesis: &str) -> Result<Vec<f64>> {
    let free = output.table("free")?.column("ll")?.to_vec();
    let hyp = output.table(hypothesis)?.column("ll")?.to_vec();
    test_statistic(&free, &hyp)
}

fn standard_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| anyhow!("normal distribution: {e}"))
}

/// Median and the quantiles at -2, -1, +1 and +2 sigma of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensitivityBands {
    pub n: usize,
    pub minus_2sigma: f64,
    pub minus_1sigma: f64,
    pub median: f64,
    pub plus_1sigma: f64,
    pub plus_2sigma: f64,
}

impl SensitivityBands {
    /// NaN entries are ignored; infinite ones count.
    pub fn from_sample(values: &[f64]) -> Result<Self> {
        let mut vals: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if vals.is_empty() {
            bail!("no valid values to compute sensitivity bands from");
        }
        let norm = standard_normal()?;
        let mut at = |z: f64| quantile(&mut vals, norm.cdf(z));
        Ok(Self {
            n: values.iter().filter(|v| !v.is_nan()).count(),
            minus_2sigma: at(-2.0),
            minus_1sigma: at(-1.0),
            median: at(0.0),
            plus_1sigma: at(1.0),
            plus_2sigma: at(2.0),
        })
    }
}

/// Fraction of toys whose discovery statistic reaches `significance` sigma.
pub fn discovery_power(q0: &[f64], significance: f64) -> Result<f64> {
    if !(significance > 0.0) {
        bail!("significance must be > 0, got {significance}");
    }
    let valid: Vec<f64> = q0.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        bail!("no valid test statistics");
    }
    let critical = significance * significance;
    let n_pass = valid.iter().filter(|v| **v >= critical).count();
    Ok(n_pass as f64 / valid.len() as f64)
}

fn generate_value(output: &RunnerOutput, poi: &str) -> Result<f64> {
    output
        .metadata
        .get("generate_values")
        .and_then(|g| g.get(poi))
        .and_then(|v| v.as_f64())
        .ok_or_else(|| anyhow!("output metadata has no generate value of {poi}"))
}

/// Group outputs by the generate value of the poi, merging batches.
fn group_by_generate_value<'a>(
    outputs: &'a [RunnerOutput],
    poi: &str,
) -> Result<Vec<(f64, Vec<&'a RunnerOutput>)>> {
    let mut groups: Vec<(f64, Vec<&RunnerOutput>)> = Vec::new();
    for output in outputs {
        let x = generate_value(output, poi)?;
        match groups.iter_mut().find(|(v, _)| *v == x) {
            Some((_, members)) => members.push(output),
            None => groups.push((x, vec![output])),
        }
    }
    groups.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(groups)
}

/// Toy-based critical values: per generated poi value, the
/// `confidence_level` quantile of the `true` test statistic.
pub fn neyman_threshold(outputs: &[RunnerOutput], poi: &str, confidence_level: f64) -> Result<ThresholdTable> {
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        bail!("confidence_level must be in (0, 1), got {confidence_level}");
    }
    if outputs.is_empty() {
        bail!("no runner outputs given");
    }
    let mut poi_values = Vec::new();
    let mut critical_values = Vec::new();
    for (x, members) in group_by_generate_value(outputs, poi)? {
        let mut ts = Vec::new();
        for output in members {
            ts.extend(output_test_statistic(output, "true")?);
        }
        ts.retain(|v| v.is_finite());
        if ts.is_empty() {
            bail!("no finite test statistics at {poi} = {x}");
        }
        poi_values.push(x);
        critical_values.push(quantile(&mut ts, confidence_level));
    }
    let table = ThresholdTable {
        poi: poi.to_string(),
        confidence_level,
        poi_values,
        critical_values,
    };
    table.validate()?;
    Ok(table)
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub generate_value: f64,
    pub n_toys: usize,
    pub upper_limit: Option<SensitivityBands>,
    pub lower_limit: Option<SensitivityBands>,
    pub discovery_power_3sigma: Option<f64>,
}

fn column_bands(outputs: &[&RunnerOutput], column: &str) -> Result<Option<SensitivityBands>> {
    let mut vals = Vec::new();
    for output in outputs {
        vals.extend(output.table("free")?.column(column)?.iter().copied());
    }
    if vals.iter().all(|v| v.is_nan()) {
        return Ok(None);
    }
    SensitivityBands::from_sample(&vals).map(Some)
}

/// Limit bands and discovery power per generated poi value.
pub fn summarize(outputs: &[RunnerOutput], poi: &str) -> Result<Vec<SummaryRow>> {
    let mut rows = Vec::new();
    for (x, members) in group_by_generate_value(outputs, poi)? {
        let n_toys = members
            .iter()
            .map(|o| o.table("free").map(|t| t.n_rows()))
            .sum::<Result<usize>>()?;
        let discovery_power_3sigma = if members.iter().all(|o| o.table("null").is_ok()) {
            let mut q0 = Vec::new();
            for output in &members {
                q0.extend(output_test_statistic(output, "null")?);
            }
            Some(discovery_power(&q0, 3.0)?)
        } else {
            None
        };
        rows.push(SummaryRow {
            generate_value: x,
            n_toys,
            upper_limit: column_bands(&members, "ul")?,
            lower_limit: column_bands(&members, "dl")?,
            discovery_power_3sigma,
        });
    }
    Ok(rows)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("failed to create summary dir {parent:?}"))?;
    }
    Ok(())
}

pub fn write_summary_tsv(path: &Path, poi: &str, rows: &[SummaryRow]) -> Result<()> {
    create_parent(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let mut w = BufWriter::new(file);
    writeln!(
        w,
        "{poi}\tn_toys\tul_m2\tul_m1\tul_median\tul_p1\tul_p2\tdiscovery_power_3sigma"
    )?;
    for r in rows {
        let ul = r.upper_limit.unwrap_or(SensitivityBands {
            n: 0,
            minus_2sigma: f64::NAN,
            minus_1sigma: f64::NAN,
            median: f64::NAN,
            plus_1sigma: f64::NAN,
            plus_2sigma: f64::NAN,
        });
        writeln!(
            w,
            "{:.6e}\t{}\t{:.6e}\t{:.6e}\t{:.6e}\t{:.6e}\t{:.6e}\t{:.4}",
            r.generate_value,
            r.n_toys,
            ul.minus_2sigma,
            ul.minus_1sigma,
            ul.median,
            ul.plus_1sigma,
            ul.plus_2sigma,
            r.discovery_power_3sigma.unwrap_or(f64::NAN)
        )?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_summary_json(path: &Path, rows: &[SummaryRow]) -> Result<()> {
    create_parent(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, rows).with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}
