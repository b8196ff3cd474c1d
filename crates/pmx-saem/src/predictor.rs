//! The boundary between the estimator and the structural-model solver.
//!
//! The estimator never integrates a model itself: it hands the current block
//! of individual parameters and the event table to a [`Predictor`] and gets
//! back one row per observation: the prediction, the censoring flag, and the
//! Tobit limit. [`PredictorAdapter`] wraps any predictor with the recovery
//! policy: a reported bad solve relaxes the solver tolerances by a
//! multiplicative factor and retries (restoring them afterwards), and NaN
//! predictions are replaced by a large sentinel with a single warning per fit.

use nalgebra::{DMatrix, DVector};
use pmx_core::Result;

/// Sentinel replacing NaN predictions; large enough to reject any proposal
/// that produced it.
pub const NAN_PREDICTION: f64 = 1.0e99;

/// One solve over the full replicated individual block.
#[derive(Debug, Clone)]
pub struct PredictorOutput {
    /// Prediction per observation row, in event-table order.
    pub f: DVector<f64>,
    /// Censoring flag per observation: -1, 0, +1.
    pub cens: DVector<f64>,
    /// Tobit limit per observation; negative infinity when absent.
    pub limit: DVector<f64>,
    /// Whether the solver reports this solve as unreliable.
    pub bad_solve: bool,
}

/// Structural-model solver interface.
///
/// `phi` has one row per replicated individual; `evt` is the replicated event
/// table whose first column is the 0-based individual id. Implementations
/// must preserve observation count and ordering across calls.
pub trait Predictor {
    fn solve(&mut self, phi: &DMatrix<f64>, evt: &DMatrix<f64>) -> Result<PredictorOutput>;

    /// Scale the solver's absolute and relative tolerances by `factor`.
    /// Solvers without tolerances ignore this.
    fn scale_tolerances(&mut self, _factor: f64) {}
}

/// Retry-and-guard wrapper around a [`Predictor`].
pub struct PredictorAdapter<'a> {
    inner: &'a mut dyn Predictor,
    max_recalc: usize,
    recalc_factor: f64,
    warned_nan: bool,
}

impl<'a> PredictorAdapter<'a> {
    pub fn new(inner: &'a mut dyn Predictor, max_recalc: usize, recalc_factor: f64) -> Self {
        Self { inner, max_recalc, recalc_factor, warned_nan: false }
    }

    /// Solve with bad-solve recovery and the NaN guard.
    pub fn predict(&mut self, phi: &DMatrix<f64>, evt: &DMatrix<f64>) -> Result<PredictorOutput> {
        let mut out = self.inner.solve(phi, evt)?;
        let mut relaxed = 0u32;
        while out.bad_solve && (relaxed as usize) < self.max_recalc {
            self.inner.scale_tolerances(self.recalc_factor);
            relaxed += 1;
            out = self.inner.solve(phi, evt)?;
        }
        if relaxed != 0 {
            self.inner.scale_tolerances(self.recalc_factor.powi(-(relaxed as i32)));
        }

        let mut has_nan = false;
        for v in out.f.iter_mut() {
            if v.is_nan() {
                *v = NAN_PREDICTION;
                has_nan = true;
            }
        }
        if has_nan && !self.warned_nan {
            log::warn!(
                "NaN in prediction; consider relaxing atol/rtol, changing initials, seed, or the structural model (warning issued once per fit)"
            );
            self.warned_nan = true;
        }
        Ok(out)
    }
}
