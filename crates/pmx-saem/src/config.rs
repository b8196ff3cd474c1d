//! Typed configuration for a SAEM fit.
//!
//! The configuration is an immutable snapshot of everything one estimation
//! needs: iteration schedule, the regression/covariate topology of the
//! individual-parameter model, the replicated data layout, per-endpoint
//! residual specifications, optimizer tuning, and reporting options. The
//! caller (model compiler / data reshaper) assembles it; `validate` fails
//! fast on shape mismatches before any iteration runs.
//!
//! Matrix-heavy fields keep the conventions of the data layout they are
//! produced by: individual ids are 0-based, index vectors are 0-based, and
//! linear matrix indices are column-major.

use std::path::PathBuf;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use pmx_core::{Error, Result};

use crate::residual::{CombineKind, ResModel, ResidualParams};
use crate::transform::TransformSpec;

/// Which optimizer drives the residual M-step for >= 2 free parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimKind {
    /// Plain Nelder-Mead with the classic coefficients.
    NelderMead,
    /// Wider-budget pass with Nelder-Mead fallback on failure.
    Alternative,
}

impl OptimKind {
    pub fn from_tag(tag: i64) -> Result<Self> {
        match tag {
            1 => Ok(OptimKind::NelderMead),
            2 => Ok(OptimKind::Alternative),
            _ => Err(Error::Config(format!("unknown optimizer tag {tag}"))),
        }
    }
}

/// Residual-optimizer and predictor-recovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimSettings {
    /// Per-coordinate evaluation budget factor for Nelder-Mead.
    pub itmax: usize,
    /// Relative tolerance for the simplex / line search.
    pub tol: f64,
    pub kind: OptimKind,
    /// Half-width of the admissible Box-Cox lambda interval.
    pub lambda_range: f64,
    /// Half-width of the admissible power-exponent interval.
    pub pow_range: f64,
    /// Bad-solve retries before giving up on tolerance relaxation.
    pub max_ode_recalc: usize,
    /// Multiplicative tolerance relaxation per retry.
    pub ode_recalc_factor: f64,
}

impl Default for OptimSettings {
    fn default() -> Self {
        Self {
            itmax: 100,
            tol: 1e-4,
            kind: OptimKind::NelderMead,
            lambda_range: 3.0,
            pow_range: 10.0,
            max_ode_recalc: 5,
            ode_recalc_factor: 2.0,
        }
    }
}

/// Iteration counts, burn-in thresholds, and step-size sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterSchedule {
    /// Total SAEM iterations.
    pub niter: usize,
    /// MCMC chains (replicates of the population per iteration).
    pub nmc: usize,
    /// Sweeps per kernel; twenty-fold at iteration zero.
    pub nu: [usize; 3],
    /// Simulated-annealing horizon for the covariance update (inclusive).
    pub nb_sa: usize,
    /// Iterations with the covariance forced diagonal (inclusive).
    pub nb_correl: usize,
    /// Iteration after which frozen covariance entries pin (strict).
    pub nb_fix_omega: usize,
    /// Iteration after which frozen residual scalars pin (strict).
    pub nb_fix_resid: usize,
    /// Estimation horizon for the fixed-mean block covariance (inclusive).
    pub niter_phi0: usize,
    /// Annealing expansion coefficient.
    pub coef_sa: f64,
    /// Geometric decay of the fixed-mean block variance after its horizon.
    pub coef_phi0: f64,
    /// Random-walk proposal scale relative to the prior SD.
    pub rmcmc: f64,
    /// Stochastic-approximation step per iteration (`len == niter`).
    pub pas: Vec<f64>,
    /// Step sequence for the Fisher / posterior accumulators (`len == niter`).
    pub pash: Vec<f64>,
    /// Variance floor per individual parameter (`len == nphi`).
    pub minv: Vec<f64>,
}

/// Regression/covariate topology of the individual-parameter model.
///
/// Block 1 collects the parameters with a covariate-informed mean, block 0
/// those with a fixed mean. `cov*` are the per-coefficient covariate columns,
/// `mcov*` the coefficient placement matrices (`mprior = cov * mcov`),
/// `jcov*` the column-major linear indices of the estimated coefficients
/// inside `mcov*`, and `lcov*`/`cov2*` the fixed derived matrices the M-step
/// formulas consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamModel {
    /// Number of subjects.
    pub n: usize,
    pub nphi1: usize,
    /// Columns of the full phi matrix forming block 1.
    pub i1: Vec<usize>,
    pub nphi0: usize,
    /// Columns of the full phi matrix forming block 0 (may be empty).
    pub i0: Vec<usize>,
    pub nlambda1: usize,
    pub nlambda0: usize,
    /// Positions of block-1 coefficients inside the full coefficient vector.
    pub ilambda1: Vec<usize>,
    /// Positions of block-0 coefficients inside the full coefficient vector.
    pub ilambda0: Vec<usize>,
    pub cov1: DMatrix<f64>,
    pub cov0: DMatrix<f64>,
    pub lcov1: DMatrix<f64>,
    pub lcov0: DMatrix<f64>,
    pub cov21: DMatrix<f64>,
    pub cov20: DMatrix<f64>,
    pub mcov1: DMatrix<f64>,
    pub mcov0: DMatrix<f64>,
    pub jcov1: Vec<usize>,
    pub jcov0: Vec<usize>,
    /// Column-major indices picking the score entries for each coefficient.
    pub ind_cov1: Vec<usize>,
    pub ind_cov0: Vec<usize>,
    /// Covariates per block-1 parameter (`sum == nlambda1`).
    pub pc1: Vec<usize>,
    /// Structural mask over the block-1 covariance; zeros stay zero.
    pub covstruct1: DMatrix<f64>,
    /// Covariate matrix for the Fisher score (`n` rows).
    pub mcovariables: DMatrix<f64>,
    /// Coefficients of block 1 held at initialization.
    pub fixed_ix1: Vec<usize>,
    /// Coefficients of block 0 held at initialization.
    pub fixed_ix0: Vec<usize>,
    /// Initial block-1 random-effect covariance.
    pub gamma2_phi1: DMatrix<f64>,
    /// Initial block-0 covariance (diagonal by construction).
    pub gamma2_phi0: DMatrix<f64>,
    pub mprior_phi1: DMatrix<f64>,
    pub mprior_phi0: DMatrix<f64>,
    /// Initial sufficient statistics (usually zeros).
    pub statphi11: DMatrix<f64>,
    pub statphi12: DMatrix<f64>,
    pub statphi01: DMatrix<f64>,
    pub statphi02: DMatrix<f64>,
    /// Whether selected covariance entries pin after the freeze horizon.
    pub gamma2_phi1_fixed: bool,
    /// {0,1} mask over pinned covariance entries.
    pub gamma2_phi1_fixed_ix: DMatrix<f64>,
    /// Values the pinned entries take.
    pub gamma2_phi1_fixed_values: DMatrix<f64>,
}

/// Observations and the replication-aware index plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLayout {
    /// Observations in the original (single-population) dataset.
    pub ntotal: usize,
    /// Original observation vector.
    pub y: DVector<f64>,
    /// Replicated observation vector, event-table order (`nmc * ntotal`).
    pub y_m: DVector<f64>,
    /// Event table of the original dataset.
    pub evt: DMatrix<f64>,
    /// Replicated event table consumed by the predictor.
    pub evt_m: DMatrix<f64>,
    /// Initial individual-parameter block (`n * nmc` rows).
    pub phi_m: DMatrix<f64>,
    /// Column-major linear position of each replicated observation inside
    /// the `mlen x (n*nmc)` likelihood workspace.
    pub indio_m: Vec<usize>,
    /// Rows of the likelihood workspace (max observations per individual).
    pub mlen: usize,
    /// Permutation sorting the original observations by endpoint.
    pub ix_sorting: Vec<usize>,
    /// Endpoint boundaries in the sorted layout (`len == nendpnt + 1`,
    /// last entry `ntotal`).
    pub y_offset: Vec<usize>,
    /// Endpoint tag per replicated observation, event-table order.
    pub ix_endpnt: Vec<usize>,
    /// Inclusive observation-row range per replicated individual.
    pub ix_id_m: Vec<(usize, usize)>,
    /// Replicated observations sorted by endpoint within each chain.
    pub ys_m: DVector<f64>,
    /// Number of endpoints.
    pub nendpnt: usize,
}

/// Per-endpoint residual-error specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualConfig {
    /// Residual model per endpoint.
    pub res_mod: Vec<ResModel>,
    /// Initial residual parameters per endpoint.
    pub params: Vec<ResidualParams>,
    /// Offsets of each endpoint's scalars inside `res_value`/`res_fixed`
    /// (`len == nendpnt + 1`, last entry the total scalar count).
    pub res_offset: Vec<usize>,
    /// Values frozen scalars take.
    pub res_value: Vec<f64>,
    /// Freeze flag per residual scalar.
    pub res_fixed: Vec<bool>,
    /// Observation transform per endpoint.
    pub transforms: Vec<TransformSpec>,
    /// Whether proportional error applies to the transformed prediction.
    pub prop_t: Vec<bool>,
    /// How additive and proportional components combine, per endpoint.
    pub add_prop: Vec<CombineKind>,
}

/// Progress reporting, history selection, and the chain dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reporting {
    /// Log the history row every `print` iterations (0 = never).
    pub print: usize,
    /// Coefficient indices kept in the parameter history.
    pub par_hist_theta_keep: Vec<usize>,
    /// Block-1 variance indices kept in the parameter history.
    pub par_hist_omega_keep: Vec<usize>,
    /// Observation distribution: 1 Gaussian, 2 Poisson, 3 Bernoulli.
    pub distribution: i64,
    /// Destination for the appended per-iteration `phiM` dump.
    pub phi_m_file: Option<PathBuf>,
}

/// Complete configuration of one SAEM estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaemConfig {
    pub schedule: IterSchedule,
    pub model: ParamModel,
    pub data: DataLayout,
    pub residual: ResidualConfig,
    pub optim: OptimSettings,
    pub reporting: Reporting,
    /// Per-subject, per-parameter mask: 0 pins the coordinate to its prior
    /// mean, 1 lets it vary (`n x nphi`; replicated internally).
    pub ue: DMatrix<f64>,
    /// RNG seed for the MCMC kernels.
    pub seed: u64,
}

impl SaemConfig {
    /// Total individual parameters.
    pub fn nphi(&self) -> usize {
        self.model.nphi1 + self.model.nphi0
    }

    /// Replicated individuals (`n * nmc`).
    pub fn n_m(&self) -> usize {
        self.model.n * self.schedule.nmc
    }

    /// Total regression coefficients.
    pub fn nlambda(&self) -> usize {
        self.model.nlambda1 + self.model.nlambda0
    }

    /// The mask replicated to the full individual block.
    pub(crate) fn expanded_ue(&self) -> DMatrix<f64> {
        let n = self.model.n;
        DMatrix::from_fn(self.n_m(), self.nphi(), |r, c| self.ue[(r % n, c)])
    }

    /// Fail fast on inconsistent shapes before the iteration loop starts.
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        let d = &self.data;
        let s = &self.schedule;
        let r = &self.residual;
        let nphi = self.nphi();
        let n_m = self.n_m();
        let n_obs_m = s.nmc * d.ntotal;

        let shape = |name: &'static str, got: (usize, usize), want: (usize, usize)| -> Result<()> {
            if got != want {
                return Err(Error::Shape {
                    name,
                    got_rows: got.0,
                    got_cols: got.1,
                    want_rows: want.0,
                    want_cols: want.1,
                });
            }
            Ok(())
        };
        let len = |name: &'static str, got: usize, want: usize| -> Result<()> {
            if got != want {
                return Err(Error::Length { name, got, want });
            }
            Ok(())
        };

        if s.niter == 0 {
            return Err(Error::Config("niter must be > 0".to_string()));
        }
        if s.nmc == 0 {
            return Err(Error::Config("nmc must be > 0".to_string()));
        }
        if d.nendpnt == 0 {
            return Err(Error::Config("at least one endpoint is required".to_string()));
        }
        len("pas", s.pas.len(), s.niter)?;
        len("pash", s.pash.len(), s.niter)?;
        len("minv", s.minv.len(), nphi)?;

        len("i1", m.i1.len(), m.nphi1)?;
        len("i0", m.i0.len(), m.nphi0)?;
        for &i in m.i1.iter().chain(m.i0.iter()) {
            if i >= nphi {
                return Err(Error::Index { name: "i1/i0", index: i, limit: nphi });
            }
        }
        len("ilambda1", m.ilambda1.len(), m.nlambda1)?;
        len("ilambda0", m.ilambda0.len(), m.nlambda0)?;
        shape("cov1", m.cov1.shape(), (m.n, m.nlambda1))?;
        shape("lcov1", m.lcov1.shape(), (m.nlambda1, m.nphi1))?;
        shape("cov21", m.cov21.shape(), (m.nlambda1, m.nlambda1))?;
        shape("mcov1", m.mcov1.shape(), (m.nlambda1, m.nphi1))?;
        len("jcov1", m.jcov1.len(), m.nlambda1)?;
        for &j in &m.jcov1 {
            if j >= m.mcov1.len() {
                return Err(Error::Index { name: "jcov1", index: j, limit: m.mcov1.len() });
            }
        }
        len("ind_cov1", m.ind_cov1.len(), m.nlambda1)?;
        for &j in &m.ind_cov1 {
            let limit = m.mcovariables.ncols() * m.nphi1;
            if j >= limit {
                return Err(Error::Index { name: "ind_cov1", index: j, limit });
            }
        }
        for &i in &m.fixed_ix1 {
            if i >= m.nlambda1 {
                return Err(Error::Index { name: "fixed_ix1", index: i, limit: m.nlambda1 });
            }
        }
        for &i in &m.fixed_ix0 {
            if i >= m.nlambda0 {
                return Err(Error::Index { name: "fixed_ix0", index: i, limit: m.nlambda0 });
            }
        }
        len("pc1", m.pc1.len(), m.nphi1)?;
        if m.pc1.iter().sum::<usize>() != m.nlambda1 {
            return Err(Error::Config("pc1 must sum to nlambda1".to_string()));
        }
        shape("covstruct1", m.covstruct1.shape(), (m.nphi1, m.nphi1))?;
        shape("gamma2_phi1", m.gamma2_phi1.shape(), (m.nphi1, m.nphi1))?;
        shape("mprior_phi1", m.mprior_phi1.shape(), (m.n, m.nphi1))?;
        shape("statphi11", m.statphi11.shape(), (m.n, m.nphi1))?;
        shape("statphi12", m.statphi12.shape(), (m.nphi1, m.nphi1))?;
        if m.mcovariables.nrows() != m.n {
            return Err(Error::Length {
                name: "mcovariables rows",
                got: m.mcovariables.nrows(),
                want: m.n,
            });
        }
        if m.gamma2_phi1_fixed {
            shape("gamma2_phi1_fixed_ix", m.gamma2_phi1_fixed_ix.shape(), (m.nphi1, m.nphi1))?;
            shape(
                "gamma2_phi1_fixed_values",
                m.gamma2_phi1_fixed_values.shape(),
                (m.nphi1, m.nphi1),
            )?;
        }
        if m.nphi0 > 0 {
            shape("cov0", m.cov0.shape(), (m.n, m.nlambda0))?;
            shape("lcov0", m.lcov0.shape(), (m.nlambda0, m.nphi0))?;
            shape("cov20", m.cov20.shape(), (m.nlambda0, m.nlambda0))?;
            shape("mcov0", m.mcov0.shape(), (m.nlambda0, m.nphi0))?;
            len("jcov0", m.jcov0.len(), m.nlambda0)?;
            len("ind_cov0", m.ind_cov0.len(), m.nlambda0)?;
            shape("gamma2_phi0", m.gamma2_phi0.shape(), (m.nphi0, m.nphi0))?;
            shape("mprior_phi0", m.mprior_phi0.shape(), (m.n, m.nphi0))?;
            shape("statphi01", m.statphi01.shape(), (m.n, m.nphi0))?;
            shape("statphi02", m.statphi02.shape(), (m.nphi0, m.nphi0))?;
        }

        shape("phi_m", d.phi_m.shape(), (n_m, nphi))?;
        shape("ue", self.ue.shape(), (m.n, nphi))?;
        len("y", d.y.len(), d.ntotal)?;
        len("y_m", d.y_m.len(), n_obs_m)?;
        len("ys_m", d.ys_m.len(), n_obs_m)?;
        len("indio_m", d.indio_m.len(), n_obs_m)?;
        len("ix_endpnt", d.ix_endpnt.len(), n_obs_m)?;
        len("ix_sorting", d.ix_sorting.len(), d.ntotal)?;
        for &i in &d.ix_sorting {
            if i >= d.ntotal {
                return Err(Error::Index { name: "ix_sorting", index: i, limit: d.ntotal });
            }
        }
        len("ix_id_m", d.ix_id_m.len(), n_m)?;
        for &p in &d.indio_m {
            if p >= d.mlen * n_m {
                return Err(Error::Index { name: "indio_m", index: p, limit: d.mlen * n_m });
            }
        }
        for &(a, b) in &d.ix_id_m {
            if a > b || b >= n_obs_m {
                return Err(Error::Config(format!(
                    "ix_id_m range {a}..={b} outside {n_obs_m} observations"
                )));
            }
        }
        for &e in &d.ix_endpnt {
            if e >= d.nendpnt {
                return Err(Error::Index { name: "ix_endpnt", index: e, limit: d.nendpnt });
            }
        }
        len("y_offset", d.y_offset.len(), d.nendpnt + 1)?;
        if d.y_offset.windows(2).any(|w| w[0] > w[1]) || *d.y_offset.last().unwrap_or(&0) != d.ntotal {
            return Err(Error::Config("y_offset must be non-decreasing and end at ntotal".to_string()));
        }

        len("res_mod", r.res_mod.len(), d.nendpnt)?;
        len("residual params", r.params.len(), d.nendpnt)?;
        len("transforms", r.transforms.len(), d.nendpnt)?;
        len("prop_t", r.prop_t.len(), d.nendpnt)?;
        len("add_prop", r.add_prop.len(), d.nendpnt)?;
        len("res_offset", r.res_offset.len(), d.nendpnt + 1)?;
        let nres = *r.res_offset.last().unwrap_or(&0);
        len("res_value", r.res_value.len(), nres)?;
        len("res_fixed", r.res_fixed.len(), nres)?;
        for (b, model) in r.res_mod.iter().enumerate() {
            let width = r.res_offset[b + 1] - r.res_offset[b];
            if width != model.n_packed() {
                return Err(Error::Config(format!(
                    "endpoint {b}: residual model {model:?} packs {} scalars, res_offset allots {width}",
                    model.n_packed()
                )));
            }
        }

        for &i in &self.reporting.par_hist_theta_keep {
            if i >= self.nlambda() {
                return Err(Error::Index { name: "par_hist_theta_keep", index: i, limit: self.nlambda() });
            }
        }
        for &i in &self.reporting.par_hist_omega_keep {
            if i >= m.nphi1 {
                return Err(Error::Index { name: "par_hist_omega_keep", index: i, limit: m.nphi1 });
            }
        }

        Ok(())
    }
}
