use anyhow::{Result, bail};

use crate::utils::{logit, sigmoid};

/// Box constraint of one coordinate; either side may be open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub lo: Option<f64>,
    pub hi: Option<f64>,
}

impl Bounds {
    pub const OPEN: Bounds = Bounds { lo: None, hi: None };

    /// Start points on a limit are moved inward; the transforms are flat there.
    pub fn interior(&self, x: f64) -> f64 {
        const INSET: f64 = 1e-3;
        match (self.lo, self.hi) {
            (Some(lo), Some(hi)) => {
                let d = INSET * (hi - lo);
                x.clamp(lo + d, hi - d)
            }
            (Some(lo), None) => x.max(lo + INSET * lo.abs().max(1.0)),
            (None, Some(hi)) => x.min(hi - INSET * hi.abs().max(1.0)),
            (None, None) => x,
        }
    }

    fn to_unconstrained(&self, x: f64) -> f64 {
        let x = self.interior(x);
        match (self.lo, self.hi) {
            (Some(lo), Some(hi)) => {
                let z = ((x - lo) / (hi - lo)).clamp(1e-12, 1.0 - 1e-12);
                logit(z)
            }
            (Some(lo), None) => (x - lo).max(1e-12).ln(),
            (None, Some(hi)) => (hi - x).max(1e-12).ln(),
            (None, None) => x,
        }
    }

    fn from_unconstrained(&self, z: f64) -> f64 {
        match (self.lo, self.hi) {
            (Some(lo), Some(hi)) => lo + (hi - lo) * sigmoid(z),
            (Some(lo), None) => lo + z.exp(),
            (None, Some(hi)) => hi - z.exp(),
            (None, None) => z,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MinimizerConfig {
    pub max_iters: usize,
    pub lbfgs_m: usize,
    pub grad_eps: f64,
    pub line_search_c1: f64,
    pub max_ls_steps: usize,
    pub tol_grad: f64,
    pub tol_f: f64,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            max_iters: 500,
            lbfgs_m: 7,
            grad_eps: 1e-6,
            line_search_c1: 1e-4,
            max_ls_steps: 40,
            tol_grad: 1e-7,
            tol_f: 1e-13,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Minimum {
    pub x: Vec<f64>,
    pub f: f64,
    pub n_iter: usize,
    pub converged: bool,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

struct Transformed<'a, F> {
    f: &'a F,
    bounds: &'a [Bounds],
}

impl<F> Transformed<'_, F>
where
    F: Fn(&[f64]) -> Result<f64>,
{
    fn constrained(&self, z: &[f64]) -> Vec<f64> {
        z.iter()
            .zip(self.bounds.iter())
            .map(|(v, b)| b.from_unconstrained(*v))
            .collect()
    }

    fn eval(&self, z: &[f64]) -> Result<f64> {
        (self.f)(&self.constrained(z))
    }

    fn grad(&self, z: &[f64], f0: f64, eps: f64) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; z.len()];
        for i in 0..z.len() {
            let step = eps * z[i].abs().max(1.0);
            let mut p1 = z.to_vec();
            let mut p2 = z.to_vec();
            p1[i] += step;
            p2[i] -= step;
            let f1 = self.eval(&p1)?;
            let f2 = self.eval(&p2)?;
            grad[i] = match (f1.is_finite(), f2.is_finite()) {
                (true, true) => (f1 - f2) / (2.0 * step),
                (true, false) => (f1 - f0) / step,
                (false, true) => (f0 - f2) / step,
                (false, false) => bail!("objective is not finite around coordinate {i}"),
            };
        }
        Ok(grad)
    }
}

/// Minimise `f` inside `bounds` starting from `x0`.
///
/// Bounded coordinates are mapped to the real line (logistic for two-sided,
/// exponential for one-sided boxes) and L-BFGS with Armijo backtracking runs
/// on the unconstrained problem using central-difference gradients.
pub fn minimize<F>(f: &F, x0: &[f64], bounds: &[Bounds], config: &MinimizerConfig) -> Result<Minimum>
where
    F: Fn(&[f64]) -> Result<f64>,
{
    if x0.len() != bounds.len() {
        bail!("bounds length mismatch");
    }
    let problem = Transformed { f, bounds };
    let mut xk: Vec<f64> = x0
        .iter()
        .zip(bounds.iter())
        .map(|(x, b)| b.to_unconstrained(*x))
        .collect();
    let mut fk = problem.eval(&xk)?;
    if !fk.is_finite() {
        bail!("objective is not finite at the initial point {x0:?}");
    }
    if xk.is_empty() {
        return Ok(Minimum {
            x: Vec::new(),
            f: fk,
            n_iter: 0,
            converged: true,
        });
    }
    let mut gk = problem.grad(&xk, fk, config.grad_eps)?;

    let mut s_hist: Vec<Vec<f64>> = Vec::new();
    let mut y_hist: Vec<Vec<f64>> = Vec::new();
    let mut rho_hist: Vec<f64> = Vec::new();
    let mut converged = false;
    let mut n_iter = 0;

    while n_iter < config.max_iters {
        n_iter += 1;
        if norm(&gk) < config.tol_grad {
            converged = true;
            break;
        }
        let mut q = gk.clone();
        let mut alpha = vec![0.0; s_hist.len()];
        for i in (0..s_hist.len()).rev() {
            let a = rho_hist[i] * dot(&s_hist[i], &q);
            alpha[i] = a;
            for j in 0..q.len() {
                q[j] -= a * y_hist[i][j];
            }
        }
        let mut r = match (s_hist.last(), y_hist.last()) {
            (Some(s_last), Some(y_last)) => {
                let ys = dot(y_last, s_last);
                let yy = dot(y_last, y_last);
                let h0 = if yy > 0.0 { ys / yy } else { 1.0 };
                q.iter().map(|v| v * h0).collect::<Vec<f64>>()
            }
            _ => q.clone(),
        };
        for i in 0..s_hist.len() {
            let beta = rho_hist[i] * dot(&y_hist[i], &r);
            for j in 0..r.len() {
                r[j] += s_hist[i][j] * (alpha[i] - beta);
            }
        }
        for v in r.iter_mut() {
            *v = -*v;
        }
        let mut gdotp = dot(&gk, &r);
        if gdotp >= 0.0 {
            // not a descent direction: fall back to steepest descent
            s_hist.clear();
            y_hist.clear();
            rho_hist.clear();
            r = gk.iter().map(|v| -v).collect();
            gdotp = dot(&gk, &r);
        }

        let mut step = if s_hist.is_empty() {
            (1.0 / norm(&r)).min(1.0)
        } else {
            1.0
        };
        let mut x_new = xk.clone();
        let mut f_new = fk;
        let mut ls_ok = false;
        for _ in 0..config.max_ls_steps {
            for i in 0..xk.len() {
                x_new[i] = xk[i] + step * r[i];
            }
            f_new = problem.eval(&x_new)?;
            if f_new.is_finite() && f_new <= fk + config.line_search_c1 * step * gdotp {
                ls_ok = true;
                break;
            }
            step *= 0.5;
        }
        if !ls_ok {
            // no further decrease representable; accept when the gradient is small
            converged = norm(&gk) < 1e-4 * (1.0 + fk.abs());
            break;
        }

        let g_new = problem.grad(&x_new, f_new, config.grad_eps)?;
        let mut s = vec![0.0; xk.len()];
        let mut y = vec![0.0; xk.len()];
        for i in 0..xk.len() {
            s[i] = x_new[i] - xk[i];
            y[i] = g_new[i] - gk[i];
        }
        let ys = dot(&y, &s);
        if ys > 1e-12 {
            if s_hist.len() == config.lbfgs_m {
                s_hist.remove(0);
                y_hist.remove(0);
                rho_hist.remove(0);
            }
            s_hist.push(s);
            y_hist.push(y);
            rho_hist.push(1.0 / ys);
        }
        let f_change = (fk - f_new).abs();
        xk = x_new;
        fk = f_new;
        gk = g_new;
        if f_change <= config.tol_f * (1.0 + fk.abs()) {
            converged = true;
            break;
        }
    }

    Ok(Minimum {
        x: problem.constrained(&xk),
        f: fk,
        n_iter,
        converged,
    })
}

/// Brent's root finder on a bracketing interval `[a, b]`.
pub fn brentq<F>(mut f: F, a: f64, b: f64, xtol: f64, max_iter: usize) -> Result<f64>
where
    F: FnMut(f64) -> Result<f64>,
{
    let (mut a, mut b) = (a, b);
    let mut fa = f(a)?;
    let mut fb = f(b)?;
    if fa == 0.0 {
        return Ok(a);
    }
    if fb == 0.0 {
        return Ok(b);
    }
    if fa.signum() == fb.signum() {
        bail!("root is not bracketed: f({a})={fa}, f({b})={fb}");
    }
    let mut c = b;
    let mut fc = fb;
    let mut d = b - a;
    let mut e = d;
    for _ in 0..max_iter {
        if fb.signum() == fc.signum() {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }
        let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * xtol;
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return Ok(b);
        }
        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            let s = fb / fa;
            let mut p;
            let mut q;
            if a == c {
                p = 2.0 * xm * s;
                q = 1.0 - s;
            } else {
                let qq = fa / fc;
                let r = fb / fc;
                p = s * (2.0 * xm * qq * (qq - r) - (b - a) * (r - 1.0));
                q = (qq - 1.0) * (r - 1.0) * (s - 1.0);
            }
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }
        a = b;
        fa = fb;
        if d.abs() > tol1 {
            b += d;
        } else {
            b += tol1.copysign(xm);
        }
        fb = f(b)?;
    }
    bail!("root finding did not converge within {max_iter} iterations")
}
