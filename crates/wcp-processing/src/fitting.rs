//! Nonlinear least-squares curve fitting
//!
//! A bounded Levenberg-Marquardt solver shared by the single-exponential
//! charging-curve fit and the double-exponential mini decay fit. Bounds are
//! enforced by projecting every trial step onto the feasible box.

use crate::params::Polarity;
use serde::{Deserialize, Serialize};
use tracing::trace;
use wcp_core::{fit_input_error, WcpError, WcpResult};

/// Parametric model with analytic partial derivatives
pub trait Model {
    /// Number of parameters
    fn param_count(&self) -> usize;

    /// Model value at `t`
    fn eval(&self, t: f64, params: &[f64]) -> f64;

    /// Partial derivatives with respect to each parameter at `t`
    fn gradient(&self, t: f64, params: &[f64], grad: &mut [f64]);

    /// Lower bound of each parameter
    fn lower_bounds(&self) -> Vec<f64> {
        vec![f64::NEG_INFINITY; self.param_count()]
    }
}

/// Solver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    /// Maximum number of accepted or rejected iterations
    pub max_iterations: usize,
    /// Relative cost reduction and relative step size treated as converged
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-10,
        }
    }
}

/// Outcome of a converged fit
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub params: Vec<f64>,
    /// Square root of the residual sum of squares
    pub residual: f64,
    pub iterations: usize,
}

fn sum_of_squares<M: Model>(model: &M, t: &[f64], y: &[f64], params: &[f64]) -> f64 {
    t.iter()
        .zip(y)
        .map(|(&ti, &yi)| (yi - model.eval(ti, params)).powi(2))
        .sum()
}

/// Solve `a * x = b` for a dense row-major `m x m` system by Gaussian
/// elimination with partial pivoting. `None` when singular.
fn solve(mut a: Vec<f64>, mut b: Vec<f64>, m: usize) -> Option<Vec<f64>> {
    for col in 0..m {
        let pivot = (col..m).max_by(|&i, &j| a[i * m + col].abs().total_cmp(&a[j * m + col].abs()))?;
        if a[pivot * m + col].abs() < 1e-300 {
            return None;
        }
        if pivot != col {
            for k in 0..m {
                a.swap(pivot * m + k, col * m + k);
            }
            b.swap(pivot, col);
        }
        for row in col + 1..m {
            let factor = a[row * m + col] / a[col * m + col];
            if factor == 0.0 {
                continue;
            }
            for k in col..m {
                a[row * m + k] -= factor * a[col * m + k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; m];
    for row in (0..m).rev() {
        let tail: f64 = (row + 1..m).map(|k| a[row * m + k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row * m + row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Fit `model` to `(t, y)` starting from `initial`
pub fn levenberg_marquardt<M: Model>(
    model: &M,
    t: &[f64],
    y: &[f64],
    initial: &[f64],
    options: &FitOptions,
) -> WcpResult<FitResult> {
    let m = model.param_count();
    if initial.len() != m {
        return Err(fit_input_error!("expected {} initial parameters, got {}", m, initial.len()));
    }
    if t.len() != y.len() {
        return Err(fit_input_error!("{} time points for {} samples", t.len(), y.len()));
    }
    if y.len() < m {
        return Err(fit_input_error!("{} samples cannot determine {} parameters", y.len(), m));
    }
    if let Some(bad) = initial.iter().find(|p| !p.is_finite()) {
        return Err(fit_input_error!("initial guess {} is not finite", bad));
    }
    let lower = model.lower_bounds();
    for (i, (p, lo)) in initial.iter().zip(&lower).enumerate() {
        if p < lo {
            return Err(fit_input_error!("initial parameter {} = {} below bound {}", i, p, lo));
        }
    }

    let mut params = initial.to_vec();
    let mut cost = sum_of_squares(model, t, y, &params);
    if !cost.is_finite() {
        return Err(fit_input_error!("initial guess gives a non-finite residual"));
    }

    let mut lambda = 1e-3;
    let mut grad = vec![0.0; m];
    for iteration in 1..=options.max_iterations {
        if cost == 0.0 {
            return Ok(FitResult { params, residual: 0.0, iterations: iteration });
        }

        let mut jtj = vec![0.0; m * m];
        let mut jtr = vec![0.0; m];
        for (&ti, &yi) in t.iter().zip(y) {
            model.gradient(ti, &params, &mut grad);
            let r = yi - model.eval(ti, &params);
            for a in 0..m {
                jtr[a] += grad[a] * r;
                for b in 0..m {
                    jtj[a * m + b] += grad[a] * grad[b];
                }
            }
        }
        if jtj.iter().chain(&jtr).any(|v| !v.is_finite()) {
            return Err(WcpError::FitConvergence {
                reason: "non-finite Jacobian".to_string(),
                iterations: iteration,
            });
        }

        loop {
            let mut damped = jtj.clone();
            for k in 0..m {
                damped[k * m + k] += lambda * jtj[k * m + k].max(1e-12);
            }

            if let Some(step) = solve(damped, jtr.clone(), m) {
                let candidate: Vec<f64> = params
                    .iter()
                    .zip(&step)
                    .zip(&lower)
                    .map(|((p, s), lo)| (p + s).max(*lo))
                    .collect();
                let new_cost = sum_of_squares(model, t, y, &candidate);

                if new_cost.is_finite() && new_cost < cost {
                    let step_norm = params
                        .iter()
                        .zip(&candidate)
                        .map(|(a, b)| (a - b).powi(2))
                        .sum::<f64>()
                        .sqrt();
                    let param_norm = params.iter().map(|p| p * p).sum::<f64>().sqrt();
                    let reduction = (cost - new_cost) / cost;

                    params = candidate;
                    cost = new_cost;
                    lambda = (lambda / 10.0).max(1e-12);

                    if reduction <= options.tolerance
                        || step_norm <= options.tolerance * (param_norm + options.tolerance)
                    {
                        trace!(iteration, cost, "fit converged");
                        return Ok(FitResult { params, residual: cost.sqrt(), iterations: iteration });
                    }
                    break;
                }
            }

            lambda *= 10.0;
            if lambda > 1e16 {
                // No descent direction left: stationary point
                trace!(iteration, cost, "fit stalled at a stationary point");
                return Ok(FitResult { params, residual: cost.sqrt(), iterations: iteration });
            }
        }
    }

    Err(WcpError::FitConvergence {
        reason: format!("residual norm {} after iteration limit", cost.sqrt()),
        iterations: options.max_iterations,
    })
}

/// `xs + (x0 - xs) * exp(-t / tau)`, parameters `[x0, tau, xs]`, tau in samples
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpDecay;

impl Model for ExpDecay {
    fn param_count(&self) -> usize {
        3
    }

    fn eval(&self, t: f64, p: &[f64]) -> f64 {
        p[2] + (p[0] - p[2]) * (-t / p[1]).exp()
    }

    fn gradient(&self, t: f64, p: &[f64], grad: &mut [f64]) {
        let e = (-t / p[1]).exp();
        grad[0] = e;
        grad[1] = (p[0] - p[2]) * e * t / (p[1] * p[1]);
        grad[2] = 1.0 - e;
    }

    fn lower_bounds(&self) -> Vec<f64> {
        vec![f64::NEG_INFINITY, 1e-6, f64::NEG_INFINITY]
    }
}

/// `a * exp(-t / t_decay) - b * exp(-t / t_rise) + c`,
/// parameters `[t_decay, t_rise, a, b, c]`, time constants in samples
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleExponential;

impl Model for DoubleExponential {
    fn param_count(&self) -> usize {
        5
    }

    fn eval(&self, t: f64, p: &[f64]) -> f64 {
        p[2] * (-t / p[0]).exp() - p[3] * (-t / p[1]).exp() + p[4]
    }

    fn gradient(&self, t: f64, p: &[f64], grad: &mut [f64]) {
        let decay = (-t / p[0]).exp();
        let rise = (-t / p[1]).exp();
        grad[0] = p[2] * decay * t / (p[0] * p[0]);
        grad[1] = -p[3] * rise * t / (p[1] * p[1]);
        grad[2] = decay;
        grad[3] = -rise;
        grad[4] = 1.0;
    }

    fn lower_bounds(&self) -> Vec<f64> {
        vec![1e-6, 1e-6, 0.0, 0.0, f64::NEG_INFINITY]
    }
}

/// Exponential decay fit result in physical units
#[derive(Debug, Clone, PartialEq)]
pub struct DecayFit {
    /// Fitted value at the fit start
    pub x0: f64,
    /// Fitted steady state
    pub x_steady: f64,
    /// Time constant in seconds
    pub tau: f64,
    /// Residual norm in scaled units
    pub residual: f64,
    pub iterations: usize,
}

/// Fit `xs + (x0 - xs) * exp(-t / tau)` over samples `[start, end)`.
///
/// The segment is multiplied by `scale` before fitting. Without a guess, the
/// last sample seeds `xs`, the first seeds `x0` and the first sample past the
/// 1/e point of the step (in direction `sign`) seeds `tau`. Guesses are
/// `[x0, tau, xs]` in scaled units and samples.
pub fn fit_exponential_decay(
    x: &[f64],
    sample_rate: f64,
    scale: f64,
    start: usize,
    end: usize,
    sign: Polarity,
    guess: Option<[f64; 3]>,
) -> WcpResult<DecayFit> {
    if start >= end || end > x.len() {
        return Err(fit_input_error!(
            "fit range [{}, {}) invalid for {} samples",
            start, end, x.len()
        ));
    }
    if end - start < 3 {
        return Err(fit_input_error!("fit range of {} samples is too short", end - start));
    }
    if !scale.is_finite() || scale == 0.0 {
        return Err(fit_input_error!("scale {} must be finite and non-zero", scale));
    }

    let segment: Vec<f64> = x[start..end].iter().map(|v| v * scale).collect();
    let time: Vec<f64> = (0..segment.len()).map(|i| i as f64).collect();

    let initial = match guess {
        Some(g) => {
            if g.iter().any(|v| !v.is_finite()) || g[1] <= 0.0 {
                return Err(fit_input_error!("malformed initial guess {:?}", g));
            }
            g
        }
        None => {
            let s = sign.factor();
            let xs = segment[segment.len() - 1];
            let x0 = segment[0];
            let target = s * (x0 - xs) / std::f64::consts::E;
            let crossing = segment
                .iter()
                .position(|v| s * (v - xs) < target)
                .ok_or_else(|| fit_input_error!("trace never crosses 1/e of the step"))?;
            [x0, (crossing as f64).max(1.0), xs]
        }
    };

    let fit = levenberg_marquardt(&ExpDecay, &time, &segment, &initial, &FitOptions::default())?;
    Ok(DecayFit {
        x0: fit.params[0] / scale,
        x_steady: fit.params[2] / scale,
        tau: fit.params[1] / sample_rate,
        residual: fit.residual,
        iterations: fit.iterations,
    })
}
