//! The SAEM driver: iteration loop, stochastic-approximation statistics,
//! M-steps, Fisher-information accumulation, and the result bundle.
//!
//! Per iteration the driver:
//!
//! 1. rebuilds the prior moments (covariance inverse and the derived
//!    regression matrices) from the current estimates;
//! 2. runs the three Metropolis kernels over the replicated individual block,
//!    with a twenty-fold burn-in sweep count at iteration zero;
//! 3. accumulates per-chain sufficient statistics and the score /
//!    observed-information surrogates;
//! 4. updates the regression coefficients and the random-effect covariance in
//!    closed form (annealing floor, structural mask, variance floors, frozen
//!    overlays, forced-diagonal phase, fixed-mean-block decay);
//! 5. re-estimates the residual-error parameters per endpoint through the
//!    nested optimizer;
//! 6. pushes the Fisher and posterior accumulators along the `pash` schedule
//!    and appends the parameter-history row.
//!
//! The chain block `phiM` is appended to the optional dump file after every
//! iteration. A cooperative interrupt flag is honored at iteration
//! boundaries: the fit stops and returns the partial state with the history
//! truncated to completed rows.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use pmx_core::{Error, Result};

use crate::config::SaemConfig;
use crate::mcmc::{run_kernel, KernelState, LikelihoodCtx, McmcBlock};
use crate::predictor::{Predictor, PredictorAdapter};
use crate::residual::{handle_f, update_endpoint, ResModel, ResidualParams, SIGMA_CAP, SIGMA_FLOOR};

/// Residual-parameter bundle of the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResInfo {
    /// Per-endpoint residual variance statistic at the last iteration.
    pub sigma2: Vec<f64>,
    pub ares: Vec<f64>,
    pub bres: Vec<f64>,
    pub cres: Vec<f64>,
    pub lres: Vec<f64>,
    pub res_mod: Vec<ResModel>,
}

/// Everything a SAEM fit returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaemResult {
    /// Residual parameters per endpoint, columns `(a, b, c, lambda)`.
    pub res_mat: DMatrix<f64>,
    /// Transform table per endpoint, columns `(lambda, kind tag, low, hi)`.
    pub trans_mat: DMatrix<f64>,
    /// Posterior individual means with the regressed block replaced by the
    /// prior means.
    pub mprior_phi: DMatrix<f64>,
    /// Posterior mean of the individual parameters.
    pub mpost_phi: DMatrix<f64>,
    /// Posterior second moment of the individual parameters.
    pub cpost_phi: DMatrix<f64>,
    /// Random-effect covariance of the regressed block.
    pub gamma2_phi1: DMatrix<f64>,
    /// Regression coefficients.
    pub plambda: DVector<f64>,
    /// Score accumulator.
    pub l: DVector<f64>,
    /// First Hessian surrogate.
    pub ha: DMatrix<f64>,
    /// Second Hessian surrogate.
    pub hb: DMatrix<f64>,
    /// Packed residual parameters in result order.
    pub sig2: DVector<f64>,
    /// Posterior random effects, masked like the proposal noise.
    pub eta: DMatrix<f64>,
    /// Parameter trajectory, one row per completed iteration.
    pub par_hist: DMatrix<f64>,
    pub res_info: ResInfo,
    /// Completed iterations (shorter than the schedule after an interrupt).
    pub n_iterations: usize,
}

/// SAEM estimator over a validated configuration.
pub struct SaemEstimator {
    cfg: SaemConfig,
    interrupt: Option<Arc<AtomicBool>>,
}

impl SaemEstimator {
    /// Validate the configuration and build the estimator.
    pub fn new(cfg: SaemConfig) -> Result<Self> {
        cfg.validate()?;
        if cfg.model.nphi1 == 0 {
            return Err(Error::Config("at least one regressed individual parameter is required".to_string()));
        }
        Ok(Self { cfg, interrupt: None })
    }

    /// Attach a cooperative interrupt flag, checked after each iteration.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn config(&self) -> &SaemConfig {
        &self.cfg
    }

    /// Run the fit against the given structural-model predictor.
    pub fn fit(&self, predictor: &mut dyn Predictor) -> Result<SaemResult> {
        let cfg = &self.cfg;
        match cfg.reporting.distribution {
            1 | 2 | 3 => {}
            d => {
                log::error!("unknown distribution (id={d})");
                return Ok(self.empty_result());
            }
        }

        let n = cfg.model.n;
        let nmc = cfg.schedule.nmc;
        let nmc_f = nmc as f64;
        let n_m = cfg.n_m();
        let nphi = cfg.nphi();
        let nphi1 = cfg.model.nphi1;
        let nphi0 = cfg.model.nphi0;
        let nlambda1 = cfg.model.nlambda1;
        let nlambda = cfg.nlambda();
        let nb_param = nphi1 + nlambda + 1;
        let ntotal = cfg.data.ntotal;
        let nendpnt = cfg.data.nendpnt;
        let niter = cfg.schedule.niter;

        let mut dump = PhiDump::create(cfg.reporting.phi_m_file.as_deref())?;
        let mut adapter =
            PredictorAdapter::new(predictor, cfg.optim.max_ode_recalc, cfg.optim.ode_recalc_factor);
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let ue = cfg.expanded_ue();

        // Mutable estimator state, seeded from the configuration snapshot.
        let mut phi_m = cfg.data.phi_m.clone();
        let mut gamma2_phi1 = cfg.model.gamma2_phi1.clone();
        let mut gamma2_phi0 = cfg.model.gamma2_phi0.clone();
        let mut d_gamma2_phi0 = gamma2_phi0.diagonal();
        let mut mprior_phi1 = cfg.model.mprior_phi1.clone();
        let mut mprior_phi0 = cfg.model.mprior_phi0.clone();
        let mut mcov1 = cfg.model.mcov1.clone();
        let mut mcov0 = cfg.model.mcov0.clone();
        let mut statphi11 = cfg.model.statphi11.clone();
        let mut statphi12 = cfg.model.statphi12.clone();
        let mut statphi01 = cfg.model.statphi01.clone();
        let mut statphi02 = cfg.model.statphi02.clone();
        let mut statrese = vec![0.0; nendpnt];
        let mut res_params: Vec<ResidualParams> = cfg.residual.params.clone();
        let mut plambda = DVector::zeros(nlambda);
        let mut plambda0 = DVector::zeros(cfg.model.nlambda0);

        let mut sigma2 = vec![10.0_f64; nendpnt];
        for b in 0..nendpnt {
            match cfg.residual.res_mod[b] {
                ResModel::Add => sigma2[b] = (res_params[b].a * res_params[b].a).max(10.0),
                ResModel::Prop => sigma2[b] = (res_params[b].b * res_params[b].b).max(1.0),
                _ => {}
            }
        }

        let mut l_acc: DVector<f64> = DVector::zeros(nb_param);
        let mut ha: DMatrix<f64> = DMatrix::zeros(nb_param, nb_param);
        let mut hb: DMatrix<f64> = DMatrix::zeros(nb_param, nb_param);
        let mut mpost_phi: DMatrix<f64> = DMatrix::zeros(n, nphi);
        let mut cpost_phi: DMatrix<f64> = DMatrix::zeros(n, nphi);

        let nres = *cfg.residual.res_offset.last().unwrap_or(&0);
        let mut vcsig2: DVector<f64> = DVector::zeros(nres);
        let res_keep: Vec<usize> =
            (0..nres).filter(|&i| !cfg.residual.res_fixed[i]).collect();
        let hist_cols = cfg.reporting.par_hist_theta_keep.len()
            + cfg.reporting.par_hist_omega_keep.len()
            + res_keep.len();
        let mut par_hist: DMatrix<f64> = DMatrix::zeros(niter, hist_cols);

        // Observations sorted by endpoint, single population.
        let ys: Vec<f64> = cfg.data.ix_sorting.iter().map(|&i| cfg.data.y[i]).collect();

        let n_obs_m = nmc * ntotal;
        let mut vec_ares =
            DVector::from_fn(n_obs_m, |i, _| res_params[cfg.data.ix_endpnt[i]].a);
        let mut vec_bres =
            DVector::from_fn(n_obs_m, |i, _| res_params[cfg.data.ix_endpnt[i]].b);

        let init = adapter.predict(&phi_m, &cfg.data.evt_m)?;
        let mut fsave = init.f;
        let mut cens = init.cens;
        let mut limit = init.limit;
        let mut limit_t = limit.clone();
        let mut dyf: DMatrix<f64> = DMatrix::zeros(cfg.data.mlen, n_m);

        let mut completed = 0usize;

        for kiter in 0..niter {
            let pas_k = cfg.schedule.pas[kiter];
            let pash_k = cfg.schedule.pash[kiter];

            // Prior moments of the regressed block.
            let igamma1 = inv_sympd(&gamma2_phi1)?;
            let gamma2_diag1 = gamma2_phi1.diagonal();
            let d1gamma21 = &cfg.model.lcov1 * &igamma1;
            let d2gamma21 = &d1gamma21 * cfg.model.lcov1.transpose();
            let cgamma21 = cfg.model.cov21.component_mul(&d2gamma21);

            // Fixed-mean block moments (empty matrices when absent).
            let (igamma0, cgamma20) = if nphi0 > 0 {
                let ig = inv_sympd(&gamma2_phi0)?;
                let d1 = &cfg.model.lcov0 * &ig;
                let d2 = &d1 * cfg.model.lcov0.transpose();
                (ig, cfg.model.cov20.component_mul(&d2))
            } else {
                (DMatrix::zeros(0, 0), DMatrix::zeros(0, 0))
            };

            let block1 = McmcBlock::new(
                &cfg.model.i1,
                &gamma2_phi1,
                &igamma1,
                &mprior_phi1,
                nmc,
                cfg.schedule.rmcmc,
            )?;
            let block0 = if nphi0 > 0 {
                Some(McmcBlock::new(
                    &cfg.model.i0,
                    &gamma2_phi0,
                    &igamma0,
                    &mprior_phi0,
                    nmc,
                    cfg.schedule.rmcmc,
                )?)
            } else {
                None
            };

            // Twenty-fold sweep expansion on the very first iteration.
            let expand = if kiter == 0 { 20 } else { 1 };
            let nu = [
                expand * cfg.schedule.nu[0],
                expand * cfg.schedule.nu[1],
                expand * cfg.schedule.nu[2],
            ];

            {
                let ctx = LikelihoodCtx {
                    y_m: &cfg.data.y_m,
                    indio_m: &cfg.data.indio_m,
                    ix_endpnt: &cfg.data.ix_endpnt,
                    transforms: &cfg.residual.transforms,
                    prop_t: &cfg.residual.prop_t,
                    distribution: cfg.reporting.distribution,
                    vec_ares: &vec_ares,
                    vec_bres: &vec_bres,
                };
                ctx.fill_dyf(
                    &fsave,
                    &cens,
                    &limit,
                    &mut limit_t,
                    &mut dyf,
                    cfg.reporting.distribution == 1,
                );
                let mut u_y: DVector<f64> = dyf.row_sum().transpose();
                let mut u_phi: DVector<f64> = DVector::zeros(n_m);

                let mut state = KernelState {
                    phi_m: &mut phi_m,
                    dyf: &mut dyf,
                    u_y: &mut u_y,
                    u_phi: &mut u_phi,
                    fsave: &mut fsave,
                    cens: &mut cens,
                    limit: &mut limit,
                    limit_t: &mut limit_t,
                };

                run_kernel(1, nu[0], &block1, &ue, &ctx, &mut adapter, cfg, &mut state, &mut rng)?;
                *state.u_phi = block1.prior_quadratic(state.phi_m);
                run_kernel(2, nu[1], &block1, &ue, &ctx, &mut adapter, cfg, &mut state, &mut rng)?;
                run_kernel(3, nu[2], &block1, &ue, &ctx, &mut adapter, cfg, &mut state, &mut rng)?;

                if let Some(ref b0) = block0 {
                    run_kernel(1, nu[0], b0, &ue, &ctx, &mut adapter, cfg, &mut state, &mut rng)?;
                    *state.u_phi = b0.prior_quadratic(state.phi_m);
                    run_kernel(2, nu[1], b0, &ue, &ctx, &mut adapter, cfg, &mut state, &mut rng)?;
                    run_kernel(3, nu[2], b0, &ue, &ctx, &mut adapter, cfg, &mut state, &mut rng)?;
                }
            }

            dump.append(&phi_m)?;

            // Per-chain sufficient statistics and Fisher surrogates.
            let mut stat_phi11: DMatrix<f64> = DMatrix::zeros(n, nphi1);
            let mut stat_phi01: DMatrix<f64> = DMatrix::zeros(n, nphi0);
            let mut stat_phi12: DMatrix<f64> = DMatrix::zeros(nphi1, nphi1);
            let mut stat_phi02: DMatrix<f64> = DMatrix::zeros(nphi0, nphi0);
            let mut statr = vec![0.0; nendpnt];
            let mut d1: DVector<f64> = DVector::zeros(nb_param);
            let mut d11: DMatrix<f64> = DMatrix::zeros(nb_param, nb_param);
            let mut d2: DMatrix<f64> = DMatrix::zeros(nb_param, nb_param);
            let mut resy = vec![0.0; nmc];
            let mut sphi1: DMatrix<f64> = DMatrix::zeros(n, nphi);
            let mut sphi2: DMatrix<f64> = DMatrix::zeros(n, nphi);
            let mut fs_m: Vec<f64> = Vec::with_capacity(n_obs_m);

            let mut d2logk: DMatrix<f64> = DMatrix::zeros(nb_param, nb_param);
            for i in 0..nlambda1 {
                for j in 0..nlambda1 {
                    d2logk[(i, j)] = -cgamma21[(i, j)];
                }
            }
            if nphi0 > 0 {
                for i in 0..cfg.model.nlambda0 {
                    for j in 0..cfg.model.nlambda0 {
                        d2logk[(nlambda1 + i, nlambda1 + j)] = -cgamma20[(i, j)];
                    }
                }
            }

            for k in 0..nmc {
                let phik = phi_m.rows(k * n, n).into_owned();
                sphi1 += &phik;
                sphi2 += phik.component_mul(&phik);
                let phi1k = select_columns(&phik, &cfg.model.i1);
                let phi0k = select_columns(&phik, &cfg.model.i0);
                stat_phi11 += &phi1k;
                stat_phi01 += &phi0k;
                stat_phi12 += phi1k.transpose() * &phi1k;
                stat_phi02 += phi0k.transpose() * &phi0k;

                // Chain predictions sorted by endpoint.
                let fk: Vec<f64> =
                    (0..ntotal).map(|i| fsave[k * ntotal + cfg.data.ix_sorting[i]]).collect();
                fs_m.extend_from_slice(&fk);

                for b in 0..nendpnt {
                    let spec = &cfg.residual.transforms[b];
                    let lo = cfg.data.y_offset[b];
                    let hi = cfg.data.y_offset[b + 1];
                    let model = cfg.residual.res_mod[b];
                    let mut acc = 0.0;
                    for i in lo..hi {
                        let yt = spec.forward(ys[i]);
                        if yt.is_nan() {
                            return Err(Error::Numerics(
                                "NaN in data or transformed data; please check transformation/data"
                                    .to_string(),
                            ));
                        }
                        let ft = spec.forward(fk[i]);
                        let mut resid = yt - ft;
                        if model == ResModel::Prop {
                            let mut fa = handle_f(cfg.residual.prop_t[b], ft, fk[i], true, true);
                            if fa <= SIGMA_FLOOR {
                                fa = 1.0;
                            }
                            resid /= fa;
                        }
                        acc += resid * resid;
                    }
                    let resk = match model {
                        ResModel::Add | ResModel::Prop => acc.clamp(SIGMA_FLOOR, SIGMA_CAP),
                        _ => residual_stat_placeholder(),
                    };
                    statr[b] += resk;
                    // single-variance score: the last endpoint's statistic
                    // feeds the sigma2 entries of the Fisher surrogates
                    resy[k] = resk;
                }

                let dphi1k = &phi1k - &mprior_phi1;
                let dphi0k = &phi0k - &mprior_phi0;
                let sdg1: DVector<f64> = dphi1k
                    .component_mul(&dphi1k)
                    .row_sum()
                    .transpose()
                    .component_div(&gamma2_diag1);

                let md1 = (&igamma1 * (dphi1k.transpose() * &cfg.model.mcovariables)).transpose();
                let mut d1logk: DVector<f64> = DVector::zeros(nb_param);
                for (i, &ix) in cfg.model.ind_cov1.iter().enumerate() {
                    d1logk[i] = md1[ix];
                }
                if nphi0 > 0 {
                    let md0 =
                        (&igamma0 * (dphi0k.transpose() * &cfg.model.mcovariables)).transpose();
                    for (i, &ix) in cfg.model.ind_cov0.iter().enumerate() {
                        d1logk[nlambda1 + i] = md0[ix];
                    }
                }
                for j in 0..nphi1 {
                    d1logk[nlambda + j] = 0.5 * sdg1[j] - 0.5 * n as f64;
                }
                d1logk[nb_param - 1] = 0.5 * resy[k] / sigma2[0] - 0.5 * ntotal as f64;

                d1 += &d1logk;
                d11 += &d1logk * d1logk.transpose();

                let mut l = 0usize;
                for j in 0..nphi1 {
                    for _ in 0..cfg.model.pc1[j] {
                        let temp =
                            -cfg.model.cov1.column(l).dot(&dphi1k.column(j)) / gamma2_diag1[j];
                        d2logk[(l, nlambda + j)] = temp;
                        d2logk[(nlambda + j, l)] = temp;
                        l += 1;
                    }
                    d2logk[(nlambda + j, nlambda + j)] = -0.5 * sdg1[j];
                }
                d2logk[(nb_param - 1, nb_param - 1)] = -0.5 * resy[k] / sigma2[0];
                d2 += &d2logk;
            }

            // Stochastic approximation of the sufficient statistics.
            let delta11 = (&stat_phi11 / nmc_f - &statphi11) * pas_k;
            statphi11 += delta11;
            let delta12 = (&stat_phi12 / nmc_f - &statphi12) * pas_k;
            statphi12 += delta12;
            let delta01 = (&stat_phi01 / nmc_f - &statphi01) * pas_k;
            statphi01 += delta01;
            let delta02 = (&stat_phi02 / nmc_f - &statphi02) * pas_k;
            statphi02 += delta02;
            for b in 0..nendpnt {
                statrese[b] += pas_k * (statr[b] / nmc_f - statrese[b]);
            }

            // M-step: regression coefficients and prior means.
            let mut plambda1 = inv_sympd(&cgamma21)?
                * d1gamma21
                    .component_mul(&(cfg.model.cov1.transpose() * &statphi11))
                    .column_sum();
            for &ix in &cfg.model.fixed_ix1 {
                plambda1[ix] = mcov1[cfg.model.jcov1[ix]];
            }
            for (i, &j) in cfg.model.jcov1.iter().enumerate() {
                mcov1[j] = plambda1[i];
            }
            if nphi0 > 0 {
                plambda0 = inv_sympd(&cgamma20)?
                    * (&cfg.model.lcov0 * &igamma0)
                        .component_mul(&(cfg.model.cov0.transpose() * &statphi01))
                        .column_sum();
                for &ix in &cfg.model.fixed_ix0 {
                    plambda0[ix] = mcov0[cfg.model.jcov0[ix]];
                }
                for (i, &j) in cfg.model.jcov0.iter().enumerate() {
                    mcov0[j] = plambda0[i];
                }
                mprior_phi0 = &cfg.model.cov0 * &mcov0;
            }
            mprior_phi1 = &cfg.model.cov1 * &mcov1;

            // M-step: random-effect covariance of the regressed block.
            let g1 = (&statphi12 + mprior_phi1.transpose() * &mprior_phi1
                - statphi11.transpose() * &mprior_phi1
                - mprior_phi1.transpose() * &statphi11)
                / n as f64;
            if kiter <= cfg.schedule.nb_sa {
                let coef = cfg.schedule.coef_sa;
                gamma2_phi1 = DMatrix::from_fn(nphi1, nphi1, |i, j| {
                    let annealed = coef * gamma2_phi1[(i, j)];
                    let floor = if i == j { g1[(i, i)] } else { 0.0 };
                    annealed.max(floor)
                });
            } else {
                gamma2_phi1 = g1;
            }
            gamma2_phi1 = gamma2_phi1.component_mul(&cfg.model.covstruct1);
            for j in 0..nphi1 {
                let floor = cfg.schedule.minv[cfg.model.i1[j]];
                if gamma2_phi1[(j, j)] < floor {
                    gamma2_phi1[(j, j)] = floor;
                }
            }
            if cfg.model.gamma2_phi1_fixed && kiter > cfg.schedule.nb_fix_omega {
                for i in 0..nphi1 {
                    for j in 0..nphi1 {
                        if cfg.model.gamma2_phi1_fixed_ix[(i, j)] != 0.0 {
                            gamma2_phi1[(i, j)] = cfg.model.gamma2_phi1_fixed_values[(i, j)];
                        }
                    }
                }
            }
            if kiter <= cfg.schedule.nb_correl {
                gamma2_phi1 = DMatrix::from_diagonal(&gamma2_phi1.diagonal());
            }

            // M-step: fixed-mean block covariance (diagonal, then decaying).
            if nphi0 > 0 {
                if kiter <= cfg.schedule.niter_phi0 {
                    let g0 = (&statphi02 + mprior_phi0.transpose() * &mprior_phi0
                        - statphi01.transpose() * &mprior_phi0
                        - mprior_phi0.transpose() * &statphi01)
                        / n as f64;
                    d_gamma2_phi0 = g0.diagonal();
                    for j in 0..nphi0 {
                        let floor = cfg.schedule.minv[cfg.model.i0[j]];
                        if d_gamma2_phi0[j] < floor {
                            d_gamma2_phi0[j] = floor;
                        }
                    }
                } else {
                    d_gamma2_phi0 *= cfg.schedule.coef_phi0;
                }
                gamma2_phi0 = DMatrix::from_diagonal(&d_gamma2_phi0);
            }

            // M-step: residual-error parameters per endpoint.
            let freeze_active = kiter > cfg.schedule.nb_fix_resid;
            for b in 0..nendpnt {
                let lo = cfg.data.y_offset[b];
                let hi = cfg.data.y_offset[b + 1];
                let n_obs_b = hi - lo;
                let mut sig2 = statrese[b] / n_obs_b as f64;
                let mut ysb = Vec::with_capacity(nmc * n_obs_b);
                let mut fsb = Vec::with_capacity(nmc * n_obs_b);
                for k in 0..nmc {
                    for i in lo..hi {
                        ysb.push(cfg.data.ys_m[k * ntotal + i]);
                        fsb.push(fs_m[k * ntotal + i]);
                    }
                }
                update_endpoint(
                    cfg.residual.res_mod[b],
                    &mut res_params[b],
                    &cfg.residual.transforms[b],
                    cfg.residual.prop_t[b],
                    cfg.residual.add_prop[b],
                    &ysb,
                    &fsb,
                    sig2,
                    &cfg.residual.res_fixed,
                    &cfg.residual.res_value,
                    cfg.residual.res_offset[b],
                    freeze_active,
                    pas_k,
                    &cfg.optim,
                );
                if sig2.is_nan() || sig2 > 1.0e99 {
                    sig2 = 1.0e99;
                }
                sigma2[b] = sig2;
            }
            for i in 0..n_obs_m {
                vec_ares[i] = res_params[cfg.data.ix_endpnt[i]].a;
                vec_bres[i] = res_params[cfg.data.ix_endpnt[i]].b;
            }

            // Fisher-information accumulators.
            let d1_mean = &d1 / nmc_f;
            let dda = &d1_mean * d1_mean.transpose() - &d11 / nmc_f - &d2 / nmc_f;
            let ddb = -(&d11 / nmc_f) - &d2 / nmc_f;
            let delta_l = (&d1_mean - &l_acc) * pash_k;
            l_acc += delta_l;
            let delta_ha = (dda - &ha) * pash_k;
            ha += delta_ha;
            let delta_hb = (ddb - &hb) * pash_k;
            hb += delta_hb;

            let delta_mpost = (&sphi1 / nmc_f - &mpost_phi) * pash_k;
            mpost_phi += delta_mpost;
            let delta_cpost = (&sphi2 / nmc_f - &cpost_phi) * pash_k;
            cpost_phi += delta_cpost;
            for (j, &col) in cfg.model.i0.iter().enumerate() {
                mpost_phi.set_column(col, &mprior_phi0.column(j));
            }

            // Packed residual vector and the history row.
            for b in 0..nendpnt {
                let off = cfg.residual.res_offset[b];
                for (i, v) in cfg.residual.res_mod[b].packed(&res_params[b]).into_iter().enumerate()
                {
                    vcsig2[off + i] = v;
                }
            }
            for (i, &ix) in cfg.model.ilambda1.iter().enumerate() {
                plambda[ix] = plambda1[i];
            }
            for (i, &ix) in cfg.model.ilambda0.iter().enumerate() {
                plambda[ix] = plambda0[i];
            }

            let mut col = 0usize;
            for &i in &cfg.reporting.par_hist_theta_keep {
                par_hist[(kiter, col)] = plambda[i];
                col += 1;
            }
            for &i in &cfg.reporting.par_hist_omega_keep {
                par_hist[(kiter, col)] = gamma2_phi1[(i, i)];
                col += 1;
            }
            for &i in &res_keep {
                par_hist[(kiter, col)] = vcsig2[i];
                col += 1;
            }

            let print = cfg.reporting.print;
            if print != 0 && (kiter == 0 || (kiter + 1) % print == 0) {
                let row: Vec<String> =
                    (0..hist_cols).map(|c| format!("{:.6}", par_hist[(kiter, c)])).collect();
                log::info!("{:03}: {}", kiter + 1, row.join("\t"));
            }

            completed = kiter + 1;
            if let Some(flag) = &self.interrupt {
                if flag.load(Ordering::Relaxed) {
                    log::warn!("interrupt requested; stopping after iteration {completed}");
                    break;
                }
            }
        }

        dump.finish()?;

        // Result bundle.
        let mut res_mat = DMatrix::zeros(nendpnt, 4);
        for b in 0..nendpnt {
            res_mat[(b, 0)] = res_params[b].a;
            res_mat[(b, 1)] = res_params[b].b;
            res_mat[(b, 2)] = res_params[b].c;
            res_mat[(b, 3)] = res_params[b].l;
        }
        let mut trans_mat = DMatrix::zeros(nendpnt, 4);
        for b in 0..nendpnt {
            let t = &cfg.residual.transforms[b];
            trans_mat[(b, 0)] = t.lambda;
            trans_mat[(b, 1)] = t.kind.tag() as f64;
            trans_mat[(b, 2)] = t.low;
            trans_mat[(b, 3)] = t.hi;
        }

        let mut mprior_phi = mpost_phi.clone();
        for (j, &col) in cfg.model.i1.iter().enumerate() {
            mprior_phi.set_column(col, &mprior_phi1.column(j));
        }

        let mut eta = DMatrix::zeros(n, nphi1);
        for (j, &col) in cfg.model.i1.iter().enumerate() {
            for r in 0..n {
                eta[(r, j)] = (mpost_phi[(r, col)] - mprior_phi1[(r, j)]) * cfg.ue[(r, col)];
            }
        }

        let res_info = ResInfo {
            sigma2: sigma2.clone(),
            ares: res_params.iter().map(|p| p.a).collect(),
            bres: res_params.iter().map(|p| p.b).collect(),
            cres: res_params.iter().map(|p| p.c).collect(),
            lres: res_params.iter().map(|p| p.l).collect(),
            res_mod: cfg.residual.res_mod.clone(),
        };

        Ok(SaemResult {
            res_mat,
            trans_mat,
            mprior_phi,
            mpost_phi,
            cpost_phi,
            gamma2_phi1,
            plambda,
            l: l_acc,
            ha,
            hb,
            sig2: vcsig2,
            eta,
            par_hist: par_hist.rows(0, completed).into_owned(),
            res_info,
            n_iterations: completed,
        })
    }

    /// The shell returned when the distribution tag is unknown: correct
    /// shapes, zero content, no iterations.
    fn empty_result(&self) -> SaemResult {
        let cfg = &self.cfg;
        let n = cfg.model.n;
        let nphi = cfg.nphi();
        let nphi1 = cfg.model.nphi1;
        let nendpnt = cfg.data.nendpnt;
        let nb_param = nphi1 + cfg.nlambda() + 1;
        let nres = *cfg.residual.res_offset.last().unwrap_or(&0);
        let hist_cols = cfg.reporting.par_hist_theta_keep.len()
            + cfg.reporting.par_hist_omega_keep.len()
            + cfg.residual.res_fixed.iter().filter(|f| !**f).count();
        SaemResult {
            res_mat: DMatrix::zeros(nendpnt, 4),
            trans_mat: DMatrix::zeros(nendpnt, 4),
            mprior_phi: DMatrix::zeros(n, nphi),
            mpost_phi: DMatrix::zeros(n, nphi),
            cpost_phi: DMatrix::zeros(n, nphi),
            gamma2_phi1: DMatrix::zeros(nphi1, nphi1),
            plambda: DVector::zeros(cfg.nlambda()),
            l: DVector::zeros(nb_param),
            ha: DMatrix::zeros(nb_param, nb_param),
            hb: DMatrix::zeros(nb_param, nb_param),
            sig2: DVector::zeros(nres),
            eta: DMatrix::zeros(n, nphi1),
            par_hist: DMatrix::zeros(0, hist_cols),
            res_info: ResInfo {
                sigma2: vec![0.0; nendpnt],
                ares: vec![0.0; nendpnt],
                bres: vec![0.0; nendpnt],
                cres: vec![0.0; nendpnt],
                lres: vec![0.0; nendpnt],
                res_mod: cfg.residual.res_mod.clone(),
            },
            n_iterations: 0,
        }
    }
}

/// Symmetric positive-definite inverse through the Cholesky factorization.
fn inv_sympd(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if m.nrows() == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    nalgebra::Cholesky::new(m.clone())
        .map(|c| c.inverse())
        .ok_or_else(|| Error::Numerics("matrix is not symmetric positive definite".to_string()))
}

/// Residual statistic for models whose variance is estimated by the nested
/// optimizer rather than the moment accumulator: a deliberate constant.
#[inline]
fn residual_stat_placeholder() -> f64 {
    1.0
}

fn select_columns(m: &DMatrix<f64>, idx: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), idx.len(), |r, c| m[(r, idx[c])])
}

/// Append-only whitespace dump of the chain block, one row per replicated
/// individual per iteration. Flushed and closed on every exit path.
struct PhiDump {
    w: Option<BufWriter<File>>,
}

impl PhiDump {
    fn create(path: Option<&Path>) -> Result<Self> {
        let w = match path {
            Some(p) => Some(BufWriter::new(File::create(p)?)),
            None => None,
        };
        Ok(Self { w })
    }

    fn append(&mut self, m: &DMatrix<f64>) -> Result<()> {
        if let Some(w) = self.w.as_mut() {
            for r in 0..m.nrows() {
                let mut line = String::with_capacity(m.ncols() * 16);
                for c in 0..m.ncols() {
                    if c > 0 {
                        line.push(' ');
                    }
                    line.push_str(&format!("{:.10e}", m[(r, c)]));
                }
                writeln!(w, "{line}")?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(w) = self.w.as_mut() {
            w.flush()?;
        }
        Ok(())
    }
}
