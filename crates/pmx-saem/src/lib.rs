//! # pmx-saem
//!
//! Stochastic Approximation Expectation-Maximization (SAEM) for nonlinear
//! mixed-effects models, the estimator family behind population PK/PD
//! analysis.
//!
//! Given a population of subjects with observations generated by a nonlinear
//! structural model under individual parameters drawn from a multivariate
//! normal prior, the estimator jointly recovers the population regression
//! coefficients, the random-effect covariance, and the residual-error
//! parameters of every endpoint. The E-step samples individual parameters
//! with Metropolis kernels, the stochastic-approximation step smooths the
//! sufficient statistics, and the M-step updates the population parameters in
//! closed form with a nested derivative-free optimizer for the residual
//! models.
//!
//! ## Architecture
//!
//! The structural model stays behind the [`predictor::Predictor`] trait: the
//! estimator only ever sees a matrix of predictions. Closed-form PK curves in
//! [`pk`] cover analytic models and the test suite; ODE-based models plug in
//! their own solver.

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

/// Censored-likelihood corrections and the normal CDF.
pub mod censoring;
/// Typed configuration intake and validation.
pub mod config;
/// Metropolis kernels over the replicated individual block.
pub(crate) mod mcmc;
/// Nelder-Mead simplex and golden-section line search.
pub mod optim;
/// Closed-form PK models and the event-table predictor.
pub mod pk;
/// Structural-model interface and the tolerance-relaxing adapter.
pub mod predictor;
/// Residual-error models and their M-step.
pub mod residual;
/// The SAEM driver and result bundle.
pub mod saem;
/// Observation/prediction power transforms and optimizer bijections.
pub mod transform;

pub use config::{
    DataLayout, IterSchedule, OptimKind, OptimSettings, ParamModel, Reporting, ResidualConfig,
    SaemConfig,
};
pub use predictor::{Predictor, PredictorAdapter, PredictorOutput};
pub use residual::{CombineKind, ResModel, ResidualParams};
pub use saem::{ResInfo, SaemEstimator, SaemResult};
pub use transform::{BoundedBijection, TransformKind, TransformSpec};

use nalgebra::{DMatrix, DVector};
use pmx_core::Result;

/// Solve the structural model once for a given individual-parameter block and
/// event table, with the same recovery policy the estimator uses, and return
/// the prediction column.
pub fn predict_only(
    predictor: &mut dyn Predictor,
    phi: &DMatrix<f64>,
    evt: &DMatrix<f64>,
    optim: &OptimSettings,
) -> Result<DVector<f64>> {
    let mut adapter = PredictorAdapter::new(predictor, optim.max_ode_recalc, optim.ode_recalc_factor);
    Ok(adapter.predict(phi, evt)?.f)
}
