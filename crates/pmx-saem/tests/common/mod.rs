//! Shared scaffolding for the end-to-end estimation tests: an intercept-only
//! population-model configuration builder and synthetic-data helpers.

use nalgebra::{DMatrix, DVector};
use pmx_saem::{
    CombineKind, DataLayout, IterSchedule, OptimSettings, ParamModel, Reporting, ResModel,
    ResidualConfig, ResidualParams, SaemConfig, TransformSpec,
};

/// One endpoint's residual specification for the builder.
#[derive(Clone)]
pub struct EndpointSpec {
    pub res_mod: ResModel,
    pub params: ResidualParams,
    pub transform: TransformSpec,
    pub prop_t: bool,
    pub add_prop: CombineKind,
}

impl EndpointSpec {
    pub fn additive(a: f64) -> Self {
        Self {
            res_mod: ResModel::Add,
            params: ResidualParams { a, ..Default::default() },
            transform: TransformSpec::identity(),
            prop_t: false,
            add_prop: CombineKind::Sum,
        }
    }
}

/// Intercept-only population model: every individual parameter has its own
/// coefficient and no covariates. Observation grid is shared by all subjects;
/// each within-grid slot belongs to one endpoint.
pub struct PopBuilder {
    pub n: usize,
    pub nphi1: usize,
    pub nphi0: usize,
    pub times: Vec<f64>,
    pub obs_endpoint: Vec<usize>,
    pub endpoints: Vec<EndpointSpec>,
    pub y: Vec<f64>,
    pub cens: Option<Vec<f64>>,
    pub limit: Option<Vec<f64>>,
    pub niter: usize,
    pub nmc: usize,
    pub nu: [usize; 3],
    pub seed: u64,
    pub phi_init: Vec<f64>,
    pub omega_init: f64,
    pub distribution: i64,
    pub nb_sa: usize,
    pub nb_correl: usize,
    pub nb_fix_omega: usize,
    pub nb_fix_resid: usize,
    pub fixed_ix1: Vec<usize>,
    pub gamma_fixed: Option<(DMatrix<f64>, DMatrix<f64>)>,
    pub res_fixed: Option<(Vec<bool>, Vec<f64>)>,
    pub phi_m_file: Option<std::path::PathBuf>,
}

impl PopBuilder {
    /// Single-endpoint defaults: additive residual, identity transform.
    pub fn new(n: usize, times: Vec<f64>, y: Vec<f64>, nphi1: usize) -> Self {
        let nt = times.len();
        let niter = 120;
        Self {
            n,
            nphi1,
            nphi0: 0,
            obs_endpoint: vec![0; nt],
            endpoints: vec![EndpointSpec::additive(0.5)],
            times,
            y,
            cens: None,
            limit: None,
            niter,
            nmc: 2,
            nu: [2, 2, 2],
            seed: 1234,
            phi_init: vec![0.0; nphi1],
            omega_init: 0.25,
            distribution: 1,
            nb_sa: niter / 5,
            nb_correl: niter,
            nb_fix_omega: niter,
            nb_fix_resid: niter,
            fixed_ix1: vec![],
            gamma_fixed: None,
            res_fixed: None,
            phi_m_file: None,
        }
    }

    pub fn build(&self) -> SaemConfig {
        let n = self.n;
        let nt = self.times.len();
        let ntotal = n * nt;
        assert_eq!(self.y.len(), ntotal, "y must be subject-major over the time grid");
        let nphi1 = self.nphi1;
        let nphi0 = self.nphi0;
        let nphi = nphi1 + nphi0;
        assert_eq!(self.phi_init.len(), nphi);
        let nmc = self.nmc;
        let n_m = n * nmc;
        let n_obs_m = nmc * ntotal;
        let nendpnt = self.endpoints.len();

        let cens = self.cens.clone().unwrap_or_else(|| vec![0.0; ntotal]);
        let limit = self.limit.clone().unwrap_or_else(|| vec![f64::NEG_INFINITY; ntotal]);

        let mut evt = DMatrix::zeros(ntotal, 5);
        for i in 0..n {
            for j in 0..nt {
                let r = i * nt + j;
                evt[(r, 0)] = i as f64;
                evt[(r, 1)] = self.times[j];
                evt[(r, 2)] = 0.0;
                evt[(r, 3)] = cens[r];
                evt[(r, 4)] = limit[r];
            }
        }
        let mut evt_m = DMatrix::zeros(n_obs_m, 5);
        for k in 0..nmc {
            for i in 0..n {
                for j in 0..nt {
                    let r = k * ntotal + i * nt + j;
                    evt_m[(r, 0)] = (k * n + i) as f64;
                    evt_m[(r, 1)] = self.times[j];
                    evt_m[(r, 2)] = 0.0;
                    evt_m[(r, 3)] = cens[i * nt + j];
                    evt_m[(r, 4)] = limit[i * nt + j];
                }
            }
        }

        // Sorted-by-endpoint permutation and boundaries.
        let mut ix_sorting = Vec::with_capacity(ntotal);
        let mut y_offset = vec![0usize; nendpnt + 1];
        for b in 0..nendpnt {
            for i in 0..n {
                for j in 0..nt {
                    if self.obs_endpoint[j] == b {
                        ix_sorting.push(i * nt + j);
                    }
                }
            }
            y_offset[b + 1] = ix_sorting.len();
        }

        let y_v = DVector::from_vec(self.y.clone());
        let y_m = DVector::from_fn(n_obs_m, |r, _| self.y[r % ntotal]);
        let ys_m = DVector::from_fn(n_obs_m, |r, _| self.y[ix_sorting[r % ntotal]]);
        let ix_endpnt: Vec<usize> =
            (0..n_obs_m).map(|o| self.obs_endpoint[(o % ntotal) % nt]).collect();
        let indio_m: Vec<usize> = (0..n_obs_m)
            .map(|o| {
                let k = o / ntotal;
                let rem = o % ntotal;
                let i = rem / nt;
                let j = rem % nt;
                (k * n + i) * nt + j
            })
            .collect();
        let ix_id_m: Vec<(usize, usize)> = (0..n_m)
            .map(|s| {
                let k = s / n;
                let i = s % n;
                let start = k * ntotal + i * nt;
                (start, start + nt - 1)
            })
            .collect();

        let phi_m = DMatrix::from_fn(n_m, nphi, |_, c| self.phi_init[c]);

        // Intercept-only block 1.
        let init1: Vec<f64> = (0..nphi1).map(|j| self.phi_init[j]).collect();
        let cov1 = DMatrix::from_element(n, nphi1, 1.0);
        let lcov1 = DMatrix::identity(nphi1, nphi1);
        let cov21 = DMatrix::from_element(nphi1, nphi1, n as f64);
        let mcov1 = DMatrix::from_fn(nphi1, nphi1, |r, c| if r == c { init1[r] } else { 0.0 });
        let jcov1: Vec<usize> = (0..nphi1).map(|j| j * nphi1 + j).collect();
        let mprior_phi1 = DMatrix::from_fn(n, nphi1, |_, c| init1[c]);

        // Intercept-only block 0 (empty matrices when absent).
        let init0: Vec<f64> = (0..nphi0).map(|j| self.phi_init[nphi1 + j]).collect();
        let cov0 = DMatrix::from_element(n, nphi0, 1.0);
        let lcov0 = DMatrix::identity(nphi0, nphi0);
        let cov20 = DMatrix::from_element(nphi0, nphi0, n as f64);
        let mcov0 = DMatrix::from_fn(nphi0, nphi0, |r, c| if r == c { init0[r] } else { 0.0 });
        let jcov0: Vec<usize> = (0..nphi0).map(|j| j * nphi0 + j).collect();
        let mprior_phi0 = DMatrix::from_fn(n, nphi0, |_, c| init0[c]);

        let (gamma2_phi1_fixed, fixed_ix, fixed_values) = match &self.gamma_fixed {
            Some((mask, values)) => (true, mask.clone(), values.clone()),
            None => (false, DMatrix::zeros(nphi1, nphi1), DMatrix::zeros(nphi1, nphi1)),
        };

        let res_offset: Vec<usize> = {
            let mut v = vec![0usize];
            for e in &self.endpoints {
                v.push(v.last().unwrap() + e.res_mod.n_packed());
            }
            v
        };
        let nres = *res_offset.last().unwrap();
        let (res_fixed, res_value) = match &self.res_fixed {
            Some((f, v)) => (f.clone(), v.clone()),
            None => (vec![false; nres], vec![0.0; nres]),
        };

        let burn = self.niter / 2;
        let pas: Vec<f64> = (0..self.niter)
            .map(|k| if k < burn { 1.0 } else { 1.0 / (k - burn + 1) as f64 })
            .collect();
        let pash: Vec<f64> = pas.clone();

        SaemConfig {
            schedule: IterSchedule {
                niter: self.niter,
                nmc,
                nu: self.nu,
                nb_sa: self.nb_sa,
                nb_correl: self.nb_correl,
                nb_fix_omega: self.nb_fix_omega,
                nb_fix_resid: self.nb_fix_resid,
                niter_phi0: self.niter,
                coef_sa: 0.95,
                coef_phi0: 0.9,
                rmcmc: 0.5,
                pas,
                pash,
                minv: vec![1e-10; nphi],
            },
            model: ParamModel {
                n,
                nphi1,
                i1: (0..nphi1).collect(),
                nphi0,
                i0: (nphi1..nphi).collect(),
                nlambda1: nphi1,
                nlambda0: nphi0,
                ilambda1: (0..nphi1).collect(),
                ilambda0: (nphi1..nphi).collect(),
                cov1,
                cov0,
                lcov1,
                lcov0,
                cov21,
                cov20,
                mcov1,
                mcov0,
                jcov1,
                jcov0,
                ind_cov1: (0..nphi1).collect(),
                ind_cov0: (0..nphi0).collect(),
                pc1: vec![1; nphi1],
                covstruct1: DMatrix::from_element(nphi1, nphi1, 1.0),
                mcovariables: DMatrix::from_element(n, 1, 1.0),
                fixed_ix1: self.fixed_ix1.clone(),
                fixed_ix0: vec![],
                gamma2_phi1: DMatrix::from_diagonal(&DVector::from_element(nphi1, self.omega_init)),
                gamma2_phi0: DMatrix::from_diagonal(&DVector::from_element(nphi0, self.omega_init)),
                mprior_phi1,
                mprior_phi0,
                statphi11: DMatrix::zeros(n, nphi1),
                statphi12: DMatrix::zeros(nphi1, nphi1),
                statphi01: DMatrix::zeros(n, nphi0),
                statphi02: DMatrix::zeros(nphi0, nphi0),
                gamma2_phi1_fixed,
                gamma2_phi1_fixed_ix: fixed_ix,
                gamma2_phi1_fixed_values: fixed_values,
            },
            data: DataLayout {
                ntotal,
                y: y_v,
                y_m,
                evt,
                evt_m,
                phi_m,
                indio_m,
                mlen: nt,
                ix_sorting,
                y_offset,
                ix_endpnt,
                ix_id_m,
                ys_m,
                nendpnt,
            },
            residual: ResidualConfig {
                res_mod: self.endpoints.iter().map(|e| e.res_mod).collect(),
                params: self.endpoints.iter().map(|e| e.params).collect(),
                res_offset,
                res_value,
                res_fixed,
                transforms: self.endpoints.iter().map(|e| e.transform).collect(),
                prop_t: self.endpoints.iter().map(|e| e.prop_t).collect(),
                add_prop: self.endpoints.iter().map(|e| e.add_prop).collect(),
            },
            optim: OptimSettings::default(),
            reporting: Reporting {
                print: 0,
                par_hist_theta_keep: (0..nphi).collect(),
                par_hist_omega_keep: (0..nphi1).collect(),
                distribution: self.distribution,
                phi_m_file: self.phi_m_file.clone(),
            },
            ue: DMatrix::from_element(n, nphi, 1.0),
            seed: self.seed,
        }
    }
}
