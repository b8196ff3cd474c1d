//! Closed-form pharmacokinetic models and an event-table predictor.
//!
//! These analytic concentration curves back the test suite and serve as
//! production predictors for models with closed-form solutions; anything
//! needing numerical integration plugs in its own [`Predictor`]
//! implementation instead.
//!
//! Event-table convention used by [`ClosedFormPredictor`], column order:
//! `id` (0-based individual index), `time`, `evid` (0 = observation,
//! anything else skipped), and optionally `cens` and `limit`.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use pmx_core::{Error, Result};

use crate::predictor::{Predictor, PredictorOutput};

/// 1-compartment oral concentration (first-order absorption).
///
/// `ke = cl / v`; near `ka == ke` the two-exponential form degenerates and
/// the limit expression is used.
pub fn conc_oral_1cpt(dose: f64, bioav: f64, cl: f64, v: f64, ka: f64, t: f64) -> f64 {
    let ke = cl / v;
    if (ka - ke).abs() < 1e-12 {
        let k = 0.5 * (ka + ke);
        return dose * bioav / v * k * t * (-k * t).exp();
    }
    dose * bioav * ka / (v * (ka - ke)) * ((-ke * t).exp() - (-ka * t).exp())
}

/// 2-compartment IV bolus concentration in macro-constant form.
pub fn conc_iv_2cpt(dose: f64, cl: f64, v1: f64, v2: f64, q: f64, t: f64) -> f64 {
    let k10 = cl / v1;
    let k12 = q / v1;
    let k21 = q / v2;
    let s = k10 + k12 + k21;
    let beta = 0.5 * (s - (s * s - 4.0 * k10 * k21).sqrt());
    let alpha = k10 * k21 / beta;
    let a = (alpha - k21) / (alpha - beta) / v1;
    let b = (k21 - beta) / (alpha - beta) / v1;
    dose * (a * (-alpha * t).exp() + b * (-beta * t).exp())
}

/// 2-compartment oral concentration (first-order absorption, macro form).
pub fn conc_oral_2cpt(dose: f64, bioav: f64, cl: f64, v1: f64, v2: f64, q: f64, ka: f64, t: f64) -> f64 {
    let k10 = cl / v1;
    let k12 = q / v1;
    let k21 = q / v2;
    let s = k10 + k12 + k21;
    let beta = 0.5 * (s - (s * s - 4.0 * k10 * k21).sqrt());
    let alpha = k10 * k21 / beta;
    let pref = dose * bioav * ka / v1;
    let a = (k21 - alpha) / ((ka - alpha) * (beta - alpha));
    let b = (k21 - beta) / ((ka - beta) * (alpha - beta));
    let c = (k21 - ka) / ((alpha - ka) * (beta - ka));
    pref * (a * (-alpha * t).exp() + b * (-beta * t).exp() + c * (-ka * t).exp())
}

/// [`Predictor`] over an event table, evaluating a closed-form model
/// `(phi_row, time) -> prediction` for every observation row. Individuals
/// are independent, so rows evaluate in parallel.
pub struct ClosedFormPredictor<F>
where
    F: Fn(&[f64], f64) -> f64 + Sync,
{
    model: F,
}

impl<F> ClosedFormPredictor<F>
where
    F: Fn(&[f64], f64) -> f64 + Sync,
{
    pub fn new(model: F) -> Self {
        Self { model }
    }
}

impl<F> Predictor for ClosedFormPredictor<F>
where
    F: Fn(&[f64], f64) -> f64 + Sync,
{
    fn solve(&mut self, phi: &DMatrix<f64>, evt: &DMatrix<f64>) -> Result<PredictorOutput> {
        if evt.ncols() < 3 {
            return Err(Error::Config(format!(
                "event table needs at least [id, time, evid] columns, got {}",
                evt.ncols()
            )));
        }
        let has_cens = evt.ncols() >= 5;
        let obs_rows: Vec<usize> = (0..evt.nrows()).filter(|&r| evt[(r, 2)] == 0.0).collect();
        for &r in &obs_rows {
            let id = evt[(r, 0)];
            if id < 0.0 || id as usize >= phi.nrows() {
                return Err(Error::Config(format!(
                    "event row {r} references individual {id} outside phi ({} rows)",
                    phi.nrows()
                )));
            }
        }

        let model = &self.model;
        let f: Vec<f64> = obs_rows
            .par_iter()
            .map(|&r| {
                let id = evt[(r, 0)] as usize;
                let t = evt[(r, 1)];
                let row: Vec<f64> = phi.row(id).iter().copied().collect();
                model(&row, t)
            })
            .collect();

        let n = obs_rows.len();
        let mut cens = DVector::zeros(n);
        let mut limit = DVector::from_element(n, f64::NEG_INFINITY);
        if has_cens {
            for (k, &r) in obs_rows.iter().enumerate() {
                cens[k] = evt[(r, 3)];
                limit[k] = evt[(r, 4)];
            }
        }

        Ok(PredictorOutput { f: DVector::from_vec(f), cens, limit, bad_solve: false })
    }
}
