use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn logit(x: f64) -> f64 {
    (x / (1.0 - x)).ln()
}

/// Linear-interpolated quantile of `vals` (sorted in place); NaN for empty input.
pub fn quantile(vals: &mut [f64], q: f64) -> f64 {
    if vals.is_empty() {
        return f64::NAN;
    }
    vals.sort_by(|a, b| a.total_cmp(b));
    let qq = q.clamp(0.0, 1.0);
    let n = vals.len();
    if n == 1 {
        return vals[0];
    }
    let pos = qq * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        vals[lo]
    } else {
        let w = pos - lo as f64;
        vals[lo] * (1.0 - w) + vals[hi] * w
    }
}

/// Insert a `_{i_batch:d}` placeholder before the file extension.
pub fn add_i_batch(filename: &str) -> Result<String> {
    if filename.contains("i_batch") {
        bail!("i_batch already in filename {filename}");
    }
    let path = Path::new(filename);
    let stem_len = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => filename.len() - ext.len() - 1,
        _ => filename.len(),
    };
    Ok(format!(
        "{}_{{i_batch:d}}{}",
        &filename[..stem_len],
        &filename[stem_len..]
    ))
}

/// Substitute `{name}` / `{name:fmt}` placeholders from `values`.
///
/// Supported formats are `d` (integer), `.Nf` (fixed precision) and `.Ne`
/// (scientific); an empty format uses the shortest round-trip form. `{{` and
/// `}}` escape literal braces.
pub fn format_template(template: &str, values: &BTreeMap<String, f64>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    field.push(c);
                }
                if !closed {
                    bail!("unterminated placeholder in {template:?}");
                }
                let (name, fmt) = match field.split_once(':') {
                    Some((n, f)) => (n, f),
                    None => (field.as_str(), ""),
                };
                let Some(value) = values.get(name) else {
                    bail!("key {name:?} of {template:?} is not in the provided values");
                };
                out.push_str(&format_value(*value, fmt)?);
            }
            '}' => bail!("single '}}' in {template:?}"),
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn format_value(value: f64, fmt: &str) -> Result<String> {
    if fmt.is_empty() {
        return Ok(format!("{value}"));
    }
    if fmt == "d" {
        if value.fract() != 0.0 {
            bail!("cannot format non-integer {value} with 'd'");
        }
        return Ok(format!("{}", value as i64));
    }
    if let Some(spec) = fmt.strip_prefix('.') {
        let (digits, kind) = spec.split_at(spec.len().saturating_sub(1));
        let precision: usize = digits
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid format spec {fmt:?}"))?;
        return match kind {
            "f" => Ok(format!("{value:.precision$}")),
            "e" => Ok(format!("{value:.precision$e}")),
            _ => bail!("unsupported format spec {fmt:?}"),
        };
    }
    bail!("unsupported format spec {fmt:?}")
}

/// Resolve `path` relative to the folder of `anchor` unless it exists as given.
pub fn resolve_relative(path: &Path, anchor: &Path) -> PathBuf {
    if path.exists() || path.is_absolute() {
        return path.to_path_buf();
    }
    match anchor.parent() {
        Some(dir) => dir.join(path),
        None => path.to_path_buf(),
    }
}

/// Quote an argument for a POSIX shell when needed.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
