use alea::opt::{Bounds, MinimizerConfig, brentq, minimize};
use anyhow::Result;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

#[test]
fn minimize_finds_quadratic_minimum() {
    let f = |x: &[f64]| -> Result<f64> { Ok((x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2)) };
    let m = minimize(&f, &[0.0, 0.0], &[Bounds::OPEN; 2], &MinimizerConfig::default()).expect("minimize failed");
    assert!(m.converged);
    approx_eq(m.x[0], 3.0, 1e-5);
    approx_eq(m.x[1], -1.0, 1e-5);
    approx_eq(m.f, 0.0, 1e-9);
}

#[test]
fn minimize_handles_rosenbrock() {
    let f = |x: &[f64]| -> Result<f64> { Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2)) };
    let m = minimize(&f, &[-1.2, 1.0], &[Bounds::OPEN; 2], &MinimizerConfig::default()).expect("minimize failed");
    approx_eq(m.x[0], 1.0, 1e-3);
    approx_eq(m.x[1], 1.0, 2e-3);
}

#[test]
fn minimize_respects_bounds() {
    let f = |x: &[f64]| -> Result<f64> { Ok((x[0] - 3.0).powi(2)) };
    let bounds = [Bounds {
        lo: Some(0.0),
        hi: Some(2.0),
    }];
    let m = minimize(&f, &[1.0], &bounds, &MinimizerConfig::default()).expect("minimize failed");
    assert!(m.x[0] <= 2.0 && m.x[0] > 1.99, "x={} should approach the upper bound", m.x[0]);

    let half_open = [Bounds { lo: Some(1.0), hi: None }];
    let g = |x: &[f64]| -> Result<f64> { Ok((x[0] - 4.0).powi(2)) };
    let m = minimize(&g, &[2.0], &half_open, &MinimizerConfig::default()).expect("minimize failed");
    approx_eq(m.x[0], 4.0, 1e-4);
}

#[test]
fn minimize_without_free_coordinates_evaluates_once() {
    let f = |_: &[f64]| -> Result<f64> { Ok(1.5) };
    let m = minimize(&f, &[], &[], &MinimizerConfig::default()).expect("minimize failed");
    assert!(m.converged);
    assert_eq!(m.n_iter, 0);
    assert_eq!(m.f, 1.5);
}

#[test]
fn minimize_rejects_bad_input() {
    let f = |x: &[f64]| -> Result<f64> { Ok(x[0]) };
    let err = minimize(&f, &[0.0], &[], &MinimizerConfig::default()).expect_err("expected length mismatch");
    assert!(err.to_string().contains("bounds length mismatch"));

    let g = |_: &[f64]| -> Result<f64> { Ok(f64::NAN) };
    let err = minimize(&g, &[0.0], &[Bounds::OPEN], &MinimizerConfig::default()).expect_err("expected non-finite error");
    assert!(err.to_string().contains("not finite"));
}

#[test]
fn brentq_finds_bracketed_root() {
    let root = brentq(|x| Ok(x * x - 2.0), 0.0, 2.0, 1e-12, 100).expect("brentq failed");
    approx_eq(root, 2f64.sqrt(), 1e-10);

    let root = brentq(|x| Ok(x.cos() - x), 0.0, 1.0, 1e-12, 100).expect("brentq failed");
    approx_eq(root, 0.739_085_133_215_160_6, 1e-10);
}

#[test]
fn brentq_requires_sign_change() {
    let err = brentq(|x| Ok(x * x + 1.0), -1.0, 1.0, 1e-12, 100).expect_err("expected bracketing error");
    assert!(err.to_string().contains("not bracketed"));
}

#[test]
fn minimize_leaves_start_point_on_a_limit() {
    let f = |x: &[f64]| -> Result<f64> { Ok((x[0] - 3.0).powi(2)) };
    let config = MinimizerConfig::default();

    let two_sided = [Bounds {
        lo: Some(0.0),
        hi: Some(10.0),
    }];
    let m = minimize(&f, &[0.0], &two_sided, &config).expect("minimize failed");
    assert!(m.converged);
    approx_eq(m.x[0], 3.0, 1e-4);
    let m = minimize(&f, &[10.0], &two_sided, &config).expect("minimize failed");
    approx_eq(m.x[0], 3.0, 1e-4);

    let lower = [Bounds { lo: Some(0.0), hi: None }];
    let m = minimize(&f, &[0.0], &lower, &config).expect("minimize failed");
    approx_eq(m.x[0], 3.0, 1e-4);

    let upper = [Bounds { lo: None, hi: Some(5.0) }];
    let m = minimize(&f, &[5.0], &upper, &config).expect("minimize failed");
    approx_eq(m.x[0], 3.0, 1e-4);
}

#[test]
fn interior_moves_only_points_on_a_limit() {
    let b = Bounds {
        lo: Some(0.0),
        hi: Some(10.0),
    };
    approx_eq(b.interior(0.0), 0.01, 1e-12);
    approx_eq(b.interior(10.0), 9.99, 1e-12);
    assert_eq!(b.interior(4.0), 4.0);
    let lower = Bounds { lo: Some(-200.0), hi: None };
    approx_eq(lower.interior(-200.0), -199.8, 1e-9);
    assert_eq!(Bounds::OPEN.interior(-1e9), -1e9);
}
