//! Metropolis kernels over the replicated individual-parameter block.
//!
//! Three proposal mechanisms share one accept/reject step and one data
//! likelihood evaluator:
//!
//! 1. prior draws `N(mprior, Gamma)` per individual, accepted on the data
//!    likelihood alone (the prior terms cancel exactly);
//! 2. a full random walk scaled by the prior standard deviations, accepted on
//!    data likelihood plus the prior quadratic form;
//! 3. a one-coordinate-at-a-time random walk with the same acceptance rule.
//!
//! Coordinates masked out by `ue` receive no noise: kernel 1 pins them at the
//! prior mean and the random walks leave them untouched. Every accepted
//! proposal writes its untransformed predictions back into the shared `fsave`
//! cache so the statistics phase never re-solves the model.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use pmx_core::{Error, Result};

use crate::censoring::cens_normal;
use crate::config::SaemConfig;
use crate::predictor::PredictorAdapter;
use crate::residual::{handle_f, SIGMA_CAP, SIGMA_FLOOR};
use crate::transform::TransformSpec;

/// Immutable per-iteration inputs of the data-likelihood evaluator.
pub(crate) struct LikelihoodCtx<'a> {
    pub y_m: &'a DVector<f64>,
    pub indio_m: &'a [usize],
    pub ix_endpnt: &'a [usize],
    pub transforms: &'a [TransformSpec],
    pub prop_t: &'a [bool],
    pub distribution: i64,
    /// Additive residual sd expanded to one entry per replicated observation.
    pub vec_ares: &'a DVector<f64>,
    /// Proportional residual sd expanded likewise.
    pub vec_bres: &'a DVector<f64>,
}

impl<'a> LikelihoodCtx<'a> {
    /// Fill the likelihood workspace from untransformed predictions `f`.
    ///
    /// Gaussian observations contribute `0.5*((yt-ft)/g)^2 + ln g` with the
    /// working sigma `g = ares + bres*|F(ft)|`; censored entries are replaced
    /// when `apply_cens` is set. Count outcomes use their own deviance terms
    /// on the raw prediction scale.
    pub fn fill_dyf(
        &self,
        f: &DVector<f64>,
        cens: &DVector<f64>,
        limit: &DVector<f64>,
        limit_t: &mut DVector<f64>,
        dyf: &mut DMatrix<f64>,
        apply_cens: bool,
    ) {
        for i in 0..f.len() {
            let cur = self.ix_endpnt[i];
            let spec = &self.transforms[cur];
            let fi = f[i];
            let ft = spec.forward(fi);
            let yt = spec.forward(self.y_m[i]);
            limit_t[i] = spec.forward(limit[i]);
            let fa = handle_f(self.prop_t[cur], ft, fi, false, true);
            let mut g = self.vec_ares[i] + self.vec_bres[i] * fa.abs();
            if g == 0.0 {
                g = 1.0;
            }
            g = g.clamp(SIGMA_FLOOR, SIGMA_CAP);

            let mut v = match self.distribution {
                2 => -self.y_m[i] * fi.ln() + fi,
                3 => -self.y_m[i] * fi.ln() - (1.0 - self.y_m[i]) * (1.0 - fi).ln(),
                _ => {
                    let z = (yt - ft) / g;
                    0.5 * z * z + g.ln()
                }
            };
            if apply_cens {
                v = cens_normal(cens[i], yt, limit_t[i], v, ft, g);
            }
            dyf[self.indio_m[i]] = v;
        }
    }
}

/// Per-block sampling constants rebuilt at the top of every SAEM iteration.
pub(crate) struct McmcBlock {
    /// Columns of the full phi matrix this block owns.
    pub idx: Vec<usize>,
    /// Lower Cholesky factor of the block covariance.
    pub chol_l: DMatrix<f64>,
    /// Inverse of the block covariance.
    pub igamma: DMatrix<f64>,
    /// Random-walk scale per coordinate: `sqrt(diag Gamma) * rmcmc`.
    pub gdiag: DVector<f64>,
    /// Prior means replicated across chains (`n*nmc` rows).
    pub mprior_rep: DMatrix<f64>,
}

impl McmcBlock {
    pub fn new(
        idx: &[usize],
        gamma: &DMatrix<f64>,
        igamma: &DMatrix<f64>,
        mprior: &DMatrix<f64>,
        nmc: usize,
        rmcmc: f64,
    ) -> Result<Self> {
        let chol = nalgebra::Cholesky::new(gamma.clone())
            .ok_or_else(|| Error::Numerics("random-effect covariance is not positive definite".to_string()))?;
        let gdiag = gamma.diagonal().map(|v| v.sqrt() * rmcmc);
        let n = mprior.nrows();
        let nb = idx.len();
        let mprior_rep = DMatrix::from_fn(n * nmc, nb, |r, c| mprior[(r % n, c)]);
        Ok(Self { idx: idx.to_vec(), chol_l: chol.l(), igamma: igamma.clone(), gdiag, mprior_rep })
    }

    /// `0.5 * sum(dphi .* (dphi * IGamma), rows)` for the block columns of
    /// `phi`: the prior quadratic form per replicated individual.
    pub fn prior_quadratic(&self, phi: &DMatrix<f64>) -> DVector<f64> {
        let dphi = self.gather(phi) - &self.mprior_rep;
        let prod = &dphi * &self.igamma;
        let mut u = DVector::zeros(dphi.nrows());
        for r in 0..dphi.nrows() {
            let mut s = 0.0;
            for c in 0..dphi.ncols() {
                s += dphi[(r, c)] * prod[(r, c)];
            }
            u[r] = 0.5 * s;
        }
        u
    }

    fn gather(&self, phi: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(phi.nrows(), self.idx.len(), |r, c| phi[(r, self.idx[c])])
    }
}

/// Mutable state threaded through the kernels within one SAEM iteration.
pub(crate) struct KernelState<'a> {
    pub phi_m: &'a mut DMatrix<f64>,
    pub dyf: &'a mut DMatrix<f64>,
    pub u_y: &'a mut DVector<f64>,
    pub u_phi: &'a mut DVector<f64>,
    pub fsave: &'a mut DVector<f64>,
    pub cens: &'a mut DVector<f64>,
    pub limit: &'a mut DVector<f64>,
    pub limit_t: &'a mut DVector<f64>,
}

/// Run one Metropolis kernel for `nu` sweeps.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_kernel(
    method: u8,
    nu: usize,
    block: &McmcBlock,
    ue: &DMatrix<f64>,
    ctx: &LikelihoodCtx<'_>,
    adapter: &mut PredictorAdapter<'_>,
    cfg: &SaemConfig,
    state: &mut KernelState<'_>,
    rng: &mut StdRng,
) -> Result<()> {
    let nb = block.idx.len();
    if nb == 0 {
        return Ok(());
    }
    let n_m = state.phi_m.nrows();
    let evt_m = &cfg.data.evt_m;
    let ix_id_m = &cfg.data.ix_id_m;

    // Each sweep makes one Metropolis step per block coordinate. Kernel 3
    // perturbs coordinate k1 on its pass; kernels 1 and 2 redraw the whole
    // block every pass, so a sweep gives them nphi independent accept/reject
    // steps on the full proposal.
    for _ in 0..nu {
        for k1 in 0..nb {
            let mut phi_c = state.phi_m.clone();
            match method {
                1 => {
                    let z: DMatrix<f64> = DMatrix::from_fn(n_m, nb, |_, _| rng.sample(StandardNormal));
                    let prop = z * block.chol_l.transpose();
                    for (j, &col) in block.idx.iter().enumerate() {
                        for r in 0..n_m {
                            phi_c[(r, col)] = prop[(r, j)] * ue[(r, col)] + block.mprior_rep[(r, j)];
                        }
                    }
                }
                2 => {
                    for (j, &col) in block.idx.iter().enumerate() {
                        for r in 0..n_m {
                            let z: f64 = rng.sample(StandardNormal);
                            phi_c[(r, col)] += z * block.gdiag[j] * ue[(r, col)];
                        }
                    }
                }
                _ => {
                    let col = block.idx[k1];
                    for r in 0..n_m {
                        let z: f64 = rng.sample(StandardNormal);
                        phi_c[(r, col)] += z * block.gdiag[k1] * ue[(r, col)];
                    }
                }
            }

            let out = adapter.predict(&phi_c, evt_m)?;
            *state.cens = out.cens;
            *state.limit = out.limit;
            let fs = out.f;
            ctx.fill_dyf(&fs, state.cens, state.limit, state.limit_t, state.dyf, true);
            let uc_y: DVector<f64> = state.dyf.row_sum().transpose();

            let (deltu, uc_phi) = if method == 1 {
                (&uc_y - &*state.u_y, None)
            } else {
                let uc_phi = block.prior_quadratic(&phi_c);
                (&uc_y - &*state.u_y + &uc_phi - &*state.u_phi, Some(uc_phi))
            };

            for r in 0..n_m {
                let u: f64 = rng.random();
                if deltu[r] < -u.ln() {
                    for &col in &block.idx {
                        state.phi_m[(r, col)] = phi_c[(r, col)];
                    }
                    state.u_y[r] = uc_y[r];
                    if let Some(ref uc) = uc_phi {
                        state.u_phi[r] = uc[r];
                    }
                    let (a, b) = ix_id_m[r];
                    for o in a..=b {
                        state.fsave[o] = fs[o];
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pk::ClosedFormPredictor;
    use rand::SeedableRng;

    fn simple_setup() -> (DMatrix<f64>, DMatrix<f64>, DVector<f64>, Vec<usize>, Vec<(usize, usize)>) {
        // 3 individuals, 2 observations each, one chain
        let n_m = 3;
        let mut evt = DMatrix::zeros(n_m * 2, 3);
        for id in 0..n_m {
            for j in 0..2 {
                let r = id * 2 + j;
                evt[(r, 0)] = id as f64;
                evt[(r, 1)] = (j + 1) as f64;
                evt[(r, 2)] = 0.0;
            }
        }
        let phi = DMatrix::from_element(n_m, 1, 0.5);
        let y = DVector::from_vec(vec![0.6, 1.1, 0.4, 0.9, 0.5, 1.0]);
        let indio: Vec<usize> = (0..n_m).flat_map(|i| [i * 2, i * 2 + 1]).collect();
        let ranges: Vec<(usize, usize)> = (0..n_m).map(|i| (i * 2, i * 2 + 1)).collect();
        (evt, phi, y, indio, ranges)
    }

    fn test_config(evt: DMatrix<f64>, phi: DMatrix<f64>, y: DVector<f64>, indio: Vec<usize>, ranges: Vec<(usize, usize)>) -> SaemConfig {
        use crate::config::*;
        use crate::residual::{CombineKind, ResModel, ResidualParams};
        let n = phi.nrows();
        let ntotal = y.len();
        SaemConfig {
            schedule: IterSchedule {
                niter: 1,
                nmc: 1,
                nu: [1, 1, 1],
                nb_sa: 0,
                nb_correl: 0,
                nb_fix_omega: 0,
                nb_fix_resid: 0,
                niter_phi0: 0,
                coef_sa: 0.95,
                coef_phi0: 0.9,
                rmcmc: 0.5,
                pas: vec![1.0],
                pash: vec![1.0],
                minv: vec![1e-10],
            },
            model: ParamModel {
                n,
                nphi1: 1,
                i1: vec![0],
                nphi0: 0,
                i0: vec![],
                nlambda1: 1,
                nlambda0: 0,
                ilambda1: vec![0],
                ilambda0: vec![],
                cov1: DMatrix::from_element(n, 1, 1.0),
                cov0: DMatrix::zeros(n, 0),
                lcov1: DMatrix::identity(1, 1),
                lcov0: DMatrix::zeros(0, 0),
                cov21: DMatrix::from_element(1, 1, n as f64),
                cov20: DMatrix::zeros(0, 0),
                mcov1: DMatrix::from_element(1, 1, 0.5),
                mcov0: DMatrix::zeros(0, 0),
                jcov1: vec![0],
                jcov0: vec![],
                ind_cov1: vec![0],
                ind_cov0: vec![],
                pc1: vec![1],
                covstruct1: DMatrix::from_element(1, 1, 1.0),
                mcovariables: DMatrix::from_element(n, 1, 1.0),
                fixed_ix1: vec![],
                fixed_ix0: vec![],
                gamma2_phi1: DMatrix::from_element(1, 1, 0.09),
                gamma2_phi0: DMatrix::zeros(0, 0),
                mprior_phi1: DMatrix::from_element(n, 1, 0.5),
                mprior_phi0: DMatrix::zeros(n, 0),
                statphi11: DMatrix::zeros(n, 1),
                statphi12: DMatrix::zeros(1, 1),
                statphi01: DMatrix::zeros(n, 0),
                statphi02: DMatrix::zeros(0, 0),
                gamma2_phi1_fixed: false,
                gamma2_phi1_fixed_ix: DMatrix::zeros(1, 1),
                gamma2_phi1_fixed_values: DMatrix::zeros(1, 1),
            },
            data: DataLayout {
                ntotal,
                y: y.clone(),
                y_m: y,
                evt: evt.clone(),
                evt_m: evt,
                phi_m: phi,
                indio_m: indio,
                mlen: 2,
                ix_sorting: (0..ntotal).collect(),
                y_offset: vec![0, ntotal],
                ix_endpnt: vec![0; ntotal],
                ix_id_m: ranges,
                ys_m: DVector::zeros(ntotal),
                nendpnt: 1,
            },
            residual: ResidualConfig {
                res_mod: vec![ResModel::Add],
                params: vec![ResidualParams { a: 0.2, ..Default::default() }],
                res_offset: vec![0, 1],
                res_value: vec![0.0],
                res_fixed: vec![false],
                transforms: vec![TransformSpec::identity()],
                prop_t: vec![false],
                add_prop: vec![CombineKind::Sum],
            },
            optim: OptimSettings::default(),
            reporting: Reporting {
                print: 0,
                par_hist_theta_keep: vec![0],
                par_hist_omega_keep: vec![0],
                distribution: 1,
                phi_m_file: None,
            },
            ue: DMatrix::from_element(3, 1, 1.0),
            seed: 7,
        }
    }

    #[test]
    fn masked_coordinates_pin_to_prior_mean() {
        let (evt, phi, y, indio, ranges) = simple_setup();
        let mut cfg = test_config(evt, phi, y, indio, ranges);
        cfg.ue = DMatrix::from_element(3, 1, 0.0); // everything pinned

        let n_m = 3;
        let n_obs = 6;
        let gamma = cfg.model.gamma2_phi1.clone();
        let igamma = gamma.clone().try_inverse().unwrap();
        let block = McmcBlock::new(&[0], &gamma, &igamma, &cfg.model.mprior_phi1, 1, 0.5).unwrap();
        let ue = cfg.expanded_ue();

        let vec_a = DVector::from_element(n_obs, 0.2);
        let vec_b = DVector::zeros(n_obs);
        let ctx = LikelihoodCtx {
            y_m: &cfg.data.y_m,
            indio_m: &cfg.data.indio_m,
            ix_endpnt: &cfg.data.ix_endpnt,
            transforms: &cfg.residual.transforms,
            prop_t: &cfg.residual.prop_t,
            distribution: 1,
            vec_ares: &vec_a,
            vec_bres: &vec_b,
        };

        let mut predictor = ClosedFormPredictor::new(|p: &[f64], t: f64| p[0] * t);
        let mut adapter = PredictorAdapter::new(&mut predictor, 0, 2.0);

        let mut phi_m = cfg.data.phi_m.clone();
        let mut dyf = DMatrix::zeros(2, n_m);
        let mut cens = DVector::zeros(n_obs);
        let mut limit = DVector::from_element(n_obs, f64::NEG_INFINITY);
        let mut limit_t = DVector::from_element(n_obs, f64::NEG_INFINITY);
        let init = adapter.predict(&phi_m, &cfg.data.evt_m).unwrap();
        let mut fsave = init.f;
        ctx.fill_dyf(&fsave, &cens, &limit, &mut limit_t, &mut dyf, true);
        let mut u_y: DVector<f64> = dyf.row_sum().transpose();
        let mut u_phi = block.prior_quadratic(&phi_m);

        let mut rng = StdRng::seed_from_u64(42);
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
        for method in [1u8, 2, 3] {
            run_kernel(method, 3, &block, &ue, &ctx, &mut adapter, &cfg, &mut state, &mut rng).unwrap();
        }
        for r in 0..n_m {
            assert!(
                (state.phi_m[(r, 0)] - 0.5).abs() < 1e-14,
                "pinned coordinate moved: {}",
                state.phi_m[(r, 0)]
            );
        }
    }

    /// Counts solver calls while delegating to a closed-form model.
    struct CountingPredictor<F>
    where
        F: Fn(&[f64], f64) -> f64 + Sync,
    {
        inner: ClosedFormPredictor<F>,
        calls: usize,
    }

    impl<F> crate::predictor::Predictor for CountingPredictor<F>
    where
        F: Fn(&[f64], f64) -> f64 + Sync,
    {
        fn solve(
            &mut self,
            phi: &DMatrix<f64>,
            evt: &DMatrix<f64>,
        ) -> Result<crate::predictor::PredictorOutput> {
            self.calls += 1;
            self.inner.solve(phi, evt)
        }
    }

    #[test]
    fn every_kernel_proposes_once_per_coordinate_per_sweep() {
        // Two parameters in one block: each sweep must cost nphi solves for
        // all three kernels, not just the coordinate-wise one.
        let (evt, _phi, y, indio, ranges) = simple_setup();
        let mut cfg = test_config(evt, DMatrix::from_element(3, 1, 0.5), y, indio, ranges);
        cfg.model.nphi1 = 2;
        cfg.model.i1 = vec![0, 1];
        cfg.ue = DMatrix::from_element(3, 2, 1.0);
        cfg.data.phi_m = DMatrix::from_fn(3, 2, |_, c| if c == 0 { 0.5 } else { 0.0 });

        let n_m = 3;
        let n_obs = 6;
        let gamma = DMatrix::from_diagonal(&DVector::from_element(2, 0.09));
        let igamma = gamma.clone().try_inverse().unwrap();
        let mprior = DMatrix::from_fn(n_m, 2, |_, c| if c == 0 { 0.5 } else { 0.0 });
        let block = McmcBlock::new(&[0, 1], &gamma, &igamma, &mprior, 1, 0.5).unwrap();
        let ue = cfg.expanded_ue();

        let vec_a = DVector::from_element(n_obs, 0.2);
        let vec_b = DVector::zeros(n_obs);
        let ctx = LikelihoodCtx {
            y_m: &cfg.data.y_m,
            indio_m: &cfg.data.indio_m,
            ix_endpnt: &cfg.data.ix_endpnt,
            transforms: &cfg.residual.transforms,
            prop_t: &cfg.residual.prop_t,
            distribution: 1,
            vec_ares: &vec_a,
            vec_bres: &vec_b,
        };

        let mut predictor = CountingPredictor {
            inner: ClosedFormPredictor::new(|p: &[f64], t: f64| p[0] * t + p[1]),
            calls: 0,
        };
        let mut adapter = PredictorAdapter::new(&mut predictor, 0, 2.0);

        let mut phi_m = cfg.data.phi_m.clone();
        let mut dyf = DMatrix::zeros(2, n_m);
        let mut cens = DVector::zeros(n_obs);
        let mut limit = DVector::from_element(n_obs, f64::NEG_INFINITY);
        let mut limit_t = DVector::from_element(n_obs, f64::NEG_INFINITY);
        let init = adapter.predict(&phi_m, &cfg.data.evt_m).unwrap();
        let mut fsave = init.f;
        ctx.fill_dyf(&fsave, &cens, &limit, &mut limit_t, &mut dyf, true);
        let mut u_y: DVector<f64> = dyf.row_sum().transpose();
        let mut u_phi = block.prior_quadratic(&phi_m);

        let mut rng = StdRng::seed_from_u64(9);
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

        let nu = 2;
        let per_kernel = nu * 2; // nu sweeps, two coordinates
        run_kernel(1, nu, &block, &ue, &ctx, &mut adapter, &cfg, &mut state, &mut rng).unwrap();
        run_kernel(2, nu, &block, &ue, &ctx, &mut adapter, &cfg, &mut state, &mut rng).unwrap();
        run_kernel(3, nu, &block, &ue, &ctx, &mut adapter, &cfg, &mut state, &mut rng).unwrap();
        drop(state);
        drop(adapter);
        assert_eq!(predictor.calls, 1 + 3 * per_kernel);
    }

    #[test]
    fn kernels_move_unmasked_coordinates_and_cache_predictions() {
        let (evt, phi, y, indio, ranges) = simple_setup();
        let cfg = test_config(evt, phi, y, indio, ranges);

        let n_m = 3;
        let n_obs = 6;
        let gamma = cfg.model.gamma2_phi1.clone();
        let igamma = gamma.clone().try_inverse().unwrap();
        let block = McmcBlock::new(&[0], &gamma, &igamma, &cfg.model.mprior_phi1, 1, 0.5).unwrap();
        let ue = cfg.expanded_ue();
        let vec_a = DVector::from_element(n_obs, 0.2);
        let vec_b = DVector::zeros(n_obs);
        let ctx = LikelihoodCtx {
            y_m: &cfg.data.y_m,
            indio_m: &cfg.data.indio_m,
            ix_endpnt: &cfg.data.ix_endpnt,
            transforms: &cfg.residual.transforms,
            prop_t: &cfg.residual.prop_t,
            distribution: 1,
            vec_ares: &vec_a,
            vec_bres: &vec_b,
        };
        let mut predictor = ClosedFormPredictor::new(|p: &[f64], t: f64| p[0] * t);
        let mut adapter = PredictorAdapter::new(&mut predictor, 0, 2.0);

        let mut phi_m = cfg.data.phi_m.clone();
        let mut dyf = DMatrix::zeros(2, n_m);
        let mut cens = DVector::zeros(n_obs);
        let mut limit = DVector::from_element(n_obs, f64::NEG_INFINITY);
        let mut limit_t = DVector::from_element(n_obs, f64::NEG_INFINITY);
        let init = adapter.predict(&phi_m, &cfg.data.evt_m).unwrap();
        let mut fsave = init.f;
        ctx.fill_dyf(&fsave, &cens, &limit, &mut limit_t, &mut dyf, true);
        let mut u_y: DVector<f64> = dyf.row_sum().transpose();
        let mut u_phi = block.prior_quadratic(&phi_m);

        let mut rng = StdRng::seed_from_u64(1);
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
        run_kernel(1, 10, &block, &ue, &ctx, &mut adapter, &cfg, &mut state, &mut rng).unwrap();

        let moved = (0..n_m).any(|r| (state.phi_m[(r, 0)] - 0.5).abs() > 1e-12);
        assert!(moved, "prior kernel should accept at least one proposal in 10 sweeps");
        // the cache agrees with the current state wherever rows were accepted
        for r in 0..n_m {
            let slope = state.phi_m[(r, 0)];
            assert!((state.fsave[r * 2] - slope * 1.0).abs() < 1e-12);
            assert!((state.fsave[r * 2 + 1] - slope * 2.0).abs() < 1e-12);
        }
    }
}
