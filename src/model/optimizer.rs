//! Bounded maximization of the log marginal likelihood.
//!
//! Both methods work on log-hyperparameters, so positivity holds for free and bounds
//! become box constraints. The model is always left at the best point seen, which is
//! never worse than the starting point.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ModelError;
use crate::model::SurrogateModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerMethod {
    /// Projected gradient ascent with backtracking; stands in for L-BFGS-B.
    #[default]
    ProjectedGradient,
    NelderMead,
}

impl FromStr for OptimizerMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "projected-gradient" | "pg" | "l-bfgs-b" | "lbfgsb" => Ok(Self::ProjectedGradient),
            "nelder-mead" | "nm" => Ok(Self::NelderMead),
            other => Err(format!("unknown optimizer method '{}'", other)),
        }
    }
}

impl fmt::Display for OptimizerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProjectedGradient => write!(f, "projected-gradient"),
            Self::NelderMead => write!(f, "nelder-mead"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub method: OptimizerMethod,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Inclusive `(low, high)` per hyperparameter.
    pub bounds: Option<Vec<(f64, f64)>>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            method: OptimizerMethod::ProjectedGradient,
            max_iterations: 50,
            tolerance: 1e-6,
            bounds: None,
        }
    }
}

impl OptimizerSettings {
    /// Checks the bounds against a hyperparameter count.
    pub fn validate(&self, n_hyps: usize) -> Result<(), ModelError> {
        if let Some(bounds) = &self.bounds {
            if bounds.len() != n_hyps {
                return Err(ModelError::Hyperparameters(format!(
                    "{} bounds for {} hyperparameters",
                    bounds.len(),
                    n_hyps
                )));
            }
            for (i, &(lo, hi)) in bounds.iter().enumerate() {
                if !(lo.is_finite() && hi.is_finite() && lo > 0.0 && lo <= hi) {
                    return Err(ModelError::Hyperparameters(format!(
                        "bound {} = ({}, {}) must satisfy 0 < low <= high",
                        i, lo, hi
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationReport {
    pub likelihood_before: f64,
    pub likelihood_after: f64,
    pub gradient: Vec<f64>,
    pub hyperparameters: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Box constraints in log space.
struct LogBox {
    lo: Vec<f64>,
    hi: Vec<f64>,
}

impl LogBox {
    fn new(bounds: Option<&[(f64, f64)]>, n: usize) -> Self {
        match bounds {
            Some(b) => Self {
                lo: b.iter().map(|(l, _)| l.ln()).collect(),
                hi: b.iter().map(|(_, h)| h.ln()).collect(),
            },
            None => Self {
                lo: vec![f64::NEG_INFINITY; n],
                hi: vec![f64::INFINITY; n],
            },
        }
    }

    fn project(&self, z: &mut [f64]) {
        for ((v, lo), hi) in z.iter_mut().zip(&self.lo).zip(&self.hi) {
            *v = v.clamp(*lo, *hi);
        }
    }
}

/// Objective bookkeeping: evaluates the model at a point and remembers the best one.
struct Tracker<'a, M: SurrogateModel + ?Sized> {
    model: &'a mut M,
    best_z: Vec<f64>,
    best_value: f64,
}

impl<'a, M: SurrogateModel + ?Sized> Tracker<'a, M> {
    /// Log likelihood and its log-space gradient; `None` when the point cannot be fitted.
    fn eval(&mut self, z: &[f64]) -> Option<(f64, Vec<f64>)> {
        let x: Vec<f64> = z.iter().map(|v| v.exp()).collect();
        self.model.set_hyperparameters(&x).ok()?;
        let lml = self.model.likelihood().ok()?;
        if !lml.value.is_finite() {
            return None;
        }
        if lml.value > self.best_value {
            self.best_value = lml.value;
            self.best_z = z.to_vec();
        }
        let grad = lml.gradient.iter().zip(&x).map(|(g, xi)| g * xi).collect();
        Some((lml.value, grad))
    }
}

pub fn optimize_hyperparameters<M: SurrogateModel + ?Sized>(
    model: &mut M,
    settings: &OptimizerSettings,
) -> Result<OptimizationReport, ModelError> {
    let n = model.hyperparameters().len();
    settings.validate(n)?;
    if !model.is_fitted() {
        model.refit()?;
    }

    let bounds = LogBox::new(settings.bounds.as_deref(), n);
    let start = model.hyperparameters();
    let mut z0: Vec<f64> = start.iter().map(|v| v.ln()).collect();
    bounds.project(&mut z0);
    let projected: Vec<f64> = z0.iter().map(|v| v.exp()).collect();
    if projected != start {
        model.set_hyperparameters(&projected)?;
    }
    let likelihood_before = model.likelihood()?.value;

    let mut tracker = Tracker {
        model,
        best_z: z0.clone(),
        best_value: likelihood_before,
    };

    let (iterations, converged) = match settings.method {
        OptimizerMethod::ProjectedGradient => projected_gradient(&mut tracker, &bounds, z0, settings),
        OptimizerMethod::NelderMead => nelder_mead(&mut tracker, &bounds, z0, settings),
    };

    let best: Vec<f64> = tracker.best_z.iter().map(|v| v.exp()).collect();
    let model = tracker.model;
    model.set_hyperparameters(&best)?;
    let final_lml = model.likelihood()?;

    Ok(OptimizationReport {
        likelihood_before,
        likelihood_after: final_lml.value,
        gradient: final_lml.gradient,
        hyperparameters: best,
        iterations,
        converged,
    })
}

fn projected_gradient<M: SurrogateModel + ?Sized>(
    tracker: &mut Tracker<'_, M>,
    bounds: &LogBox,
    mut z: Vec<f64>,
    settings: &OptimizerSettings,
) -> (usize, bool) {
    let Some((mut value, mut grad)) = tracker.eval(&z) else {
        return (0, false);
    };
    let mut step = 0.1;

    for iter in 1..=settings.max_iterations {
        let gnorm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if gnorm < settings.tolerance {
            return (iter - 1, true);
        }

        let mut accepted = false;
        while step > 1e-12 {
            let mut trial: Vec<f64> = z.iter().zip(&grad).map(|(zi, gi)| zi + step * gi / gnorm).collect();
            bounds.project(&mut trial);
            let moved = trial.iter().zip(&z).map(|(a, b)| (a - b).abs()).fold(0.0, f64::max);
            if moved < settings.tolerance {
                // the projected direction is blocked by the bounds
                return (iter, true);
            }
            match tracker.eval(&trial) {
                Some((v, g)) if v > value => {
                    let gain = v - value;
                    z = trial;
                    value = v;
                    grad = g;
                    step *= 1.5;
                    accepted = true;
                    if gain < settings.tolerance * (1.0 + value.abs()) {
                        return (iter, true);
                    }
                    break;
                }
                _ => step *= 0.5,
            }
        }
        if !accepted {
            return (iter, true);
        }
    }
    (settings.max_iterations, false)
}

fn nelder_mead<M: SurrogateModel + ?Sized>(
    tracker: &mut Tracker<'_, M>,
    bounds: &LogBox,
    z0: Vec<f64>,
    settings: &OptimizerSettings,
) -> (usize, bool) {
    let n = z0.len();
    let cost = |z: &[f64], tracker: &mut Tracker<'_, M>| -> f64 {
        tracker.eval(z).map_or(f64::INFINITY, |(v, _)| -v)
    };

    let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
    let c0 = cost(&z0, tracker);
    simplex.push((z0.clone(), c0));
    for i in 0..n {
        let mut z = z0.clone();
        z[i] += 0.25;
        bounds.project(&mut z);
        if z == z0 {
            z[i] -= 0.25;
            bounds.project(&mut z);
        }
        let c = cost(&z, tracker);
        simplex.push((z, c));
    }

    for iter in 1..=settings.max_iterations {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let spread = simplex[n].1 - simplex[0].1;
        if spread.is_finite() && spread.abs() < settings.tolerance {
            return (iter - 1, true);
        }

        let centroid: Vec<f64> = (0..n)
            .map(|d| simplex[..n].iter().map(|(z, _)| z[d]).sum::<f64>() / n as f64)
            .collect();
        let along = |t: f64, worst: &[f64]| -> Vec<f64> {
            let mut z: Vec<f64> = centroid.iter().zip(worst).map(|(c, w)| c + t * (c - w)).collect();
            bounds.project(&mut z);
            z
        };

        let worst = simplex[n].0.clone();
        let reflected = along(1.0, &worst);
        let c_r = cost(&reflected, tracker);

        if c_r < simplex[0].1 {
            let expanded = along(2.0, &worst);
            let c_e = cost(&expanded, tracker);
            simplex[n] = if c_e < c_r { (expanded, c_e) } else { (reflected, c_r) };
        } else if c_r < simplex[n - 1].1 {
            simplex[n] = (reflected, c_r);
        } else {
            let contracted = along(-0.5, &worst);
            let c_c = cost(&contracted, tracker);
            if c_c < simplex[n].1 {
                simplex[n] = (contracted, c_c);
            } else {
                let best = simplex[0].0.clone();
                for vertex in simplex.iter_mut().skip(1) {
                    let mut z: Vec<f64> = best.iter().zip(&vertex.0).map(|(b, v)| b + 0.5 * (v - b)).collect();
                    bounds.project(&mut z);
                    let c = cost(&z, tracker);
                    *vertex = (z, c);
                }
            }
        }
    }
    (settings.max_iterations, false)
}
