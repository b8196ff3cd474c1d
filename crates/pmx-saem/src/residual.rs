//! Residual-error models and their per-endpoint M-step.
//!
//! Ten residual specifications share one driver: each model is described by a
//! list of parameter slots (additive sd, proportional sd, power exponent,
//! Box-Cox lambda), an encoding bijection per slot, and a sigma formula. The
//! M-step builds the free-coordinate vector (honoring per-component freezes),
//! minimizes the -2 log-likelihood of the transformed residuals with
//! Nelder-Mead (or a line search when one coordinate remains), and moves the
//! endpoint's parameters toward the optimum with the iteration step size.
//!
//! Pure additive and pure proportional models bypass the optimizer: their
//! update is the closed-form square root of the accumulated residual
//! statistic.

use serde::{Deserialize, Serialize};

use pmx_core::{Error, Result};

use crate::config::{OptimKind, OptimSettings};
use crate::optim::{minimize_scalar, NelderMead, OptimOutcome};
use crate::transform::{BoundedBijection, TransformSpec};

/// Lower clamp for any sigma entering a likelihood.
pub(crate) const SIGMA_FLOOR: f64 = 1.0e-200;
/// Upper clamp for any sigma entering a likelihood.
pub(crate) const SIGMA_CAP: f64 = 1.0e300;

/// Residual-error model selector (configuration tags 1-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResModel {
    Add,
    Prop,
    Pow,
    AddProp,
    AddPow,
    AddLam,
    PropLam,
    PowLam,
    AddPropLam,
    AddPowLam,
}

/// Which scalar a residual-model slot refers to, and thereby its encoding:
/// `Add`/`Prop` slots use the signed square root, `Power` and `Lambda` the
/// bounded bijections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Add,
    Prop,
    Power,
    Lambda,
}

impl ResModel {
    /// Decode the configuration tag.
    pub fn from_tag(tag: i64) -> Result<Self> {
        match tag {
            1 => Ok(ResModel::Add),
            2 => Ok(ResModel::Prop),
            3 => Ok(ResModel::Pow),
            4 => Ok(ResModel::AddProp),
            5 => Ok(ResModel::AddPow),
            6 => Ok(ResModel::AddLam),
            7 => Ok(ResModel::PropLam),
            8 => Ok(ResModel::PowLam),
            9 => Ok(ResModel::AddPropLam),
            10 => Ok(ResModel::AddPowLam),
            _ => Err(Error::Config(format!("unknown residual model tag {tag}"))),
        }
    }

    /// Configuration tag.
    pub fn tag(&self) -> i64 {
        match self {
            ResModel::Add => 1,
            ResModel::Prop => 2,
            ResModel::Pow => 3,
            ResModel::AddProp => 4,
            ResModel::AddPow => 5,
            ResModel::AddLam => 6,
            ResModel::PropLam => 7,
            ResModel::PowLam => 8,
            ResModel::AddPropLam => 9,
            ResModel::AddPowLam => 10,
        }
    }

    /// Optimizer slots for this model, in the order the freeze vector and the
    /// packed result use them. Empty for the closed-form models.
    pub fn slots(&self) -> &'static [Slot] {
        match self {
            ResModel::Add | ResModel::Prop => &[],
            ResModel::Pow => &[Slot::Prop, Slot::Power],
            ResModel::AddProp => &[Slot::Add, Slot::Prop],
            ResModel::AddPow => &[Slot::Add, Slot::Prop, Slot::Power],
            ResModel::AddLam => &[Slot::Add, Slot::Lambda],
            ResModel::PropLam => &[Slot::Prop, Slot::Lambda],
            ResModel::PowLam => &[Slot::Prop, Slot::Power, Slot::Lambda],
            ResModel::AddPropLam => &[Slot::Add, Slot::Prop, Slot::Lambda],
            ResModel::AddPowLam => &[Slot::Add, Slot::Prop, Slot::Power, Slot::Lambda],
        }
    }

    /// Number of scalars this model contributes to the packed residual
    /// vector (`sig2` in the result bundle).
    pub fn n_packed(&self) -> usize {
        match self {
            ResModel::Add | ResModel::Prop => 1,
            _ => self.slots().len(),
        }
    }

    /// Whether the model estimates the transform lambda jointly.
    pub fn estimates_lambda(&self) -> bool {
        matches!(
            self,
            ResModel::AddLam
                | ResModel::PropLam
                | ResModel::PowLam
                | ResModel::AddPropLam
                | ResModel::AddPowLam
        )
    }

    /// Pack the endpoint's parameters in result order.
    pub fn packed(&self, p: &ResidualParams) -> Vec<f64> {
        match self {
            ResModel::Add => vec![p.a],
            ResModel::Prop => vec![p.b],
            ResModel::Pow => vec![p.b, p.c],
            ResModel::AddProp => vec![p.a, p.b],
            ResModel::AddPow => vec![p.a, p.b, p.c],
            ResModel::AddLam => vec![p.a, p.l],
            ResModel::PropLam => vec![p.b, p.l],
            ResModel::PowLam => vec![p.b, p.c, p.l],
            ResModel::AddPropLam => vec![p.a, p.b, p.l],
            ResModel::AddPowLam => vec![p.a, p.b, p.c, p.l],
        }
    }
}

/// How additive and proportional components combine into one sigma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombineKind {
    /// `sigma = a + b·F^c`
    Sum,
    /// `sigma = sqrt(a^2 + b^2·F^{2c})`
    Quadrature,
}

impl CombineKind {
    pub fn from_tag(tag: i64) -> Result<Self> {
        match tag {
            1 => Ok(CombineKind::Sum),
            2 => Ok(CombineKind::Quadrature),
            _ => Err(Error::Config(format!("unknown add+prop combine tag {tag}"))),
        }
    }
}

/// Residual parameters of one endpoint: additive sd `a`, proportional sd `b`,
/// power exponent `c`, transform lambda `l`. Entries are meaningful only when
/// the endpoint's [`ResModel`] selects them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResidualParams {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub l: f64,
}

/// Proportionality base for the sigma formulas: the transformed prediction
/// when `prop_t` is set, the raw prediction otherwise; zero replaced by one
/// when `adjust_f` keeps proportional error defined at `f = 0`; optional
/// truncation to the sigma clamp range.
#[inline]
pub fn handle_f(prop_t: bool, ft: f64, f: f64, trunc: bool, adjust_f: bool) -> f64 {
    let mut fa = if prop_t { ft } else { f };
    if adjust_f && fa == 0.0 {
        fa = 1.0;
    }
    if trunc {
        fa = fa.clamp(SIGMA_FLOOR, SIGMA_CAP);
    }
    fa
}

/// Decoded slot values handed to the sigma formula.
struct DecodedSlots {
    a: f64,
    b: f64,
    pw: f64,
    lambda: Option<f64>,
}

/// The -2 log-likelihood objective over one endpoint's (observation,
/// prediction) pairs, parameterized on encoded optimizer coordinates.
pub struct EndpointObjective<'a> {
    pub model: ResModel,
    pub ys: &'a [f64],
    pub fs: &'a [f64],
    pub spec: TransformSpec,
    pub prop_t: bool,
    pub combine: CombineKind,
    /// Encoded value per slot; `Some` pins the slot, `None` reads it from the
    /// free-coordinate vector.
    pub pinned: Vec<Option<f64>>,
    pub pow_map: BoundedBijection,
    pub lambda_map: BoundedBijection,
}

impl<'a> EndpointObjective<'a> {
    fn decode(&self, free: &[f64]) -> DecodedSlots {
        let slots = self.model.slots();
        let mut d = DecodedSlots { a: 0.0, b: 0.0, pw: 1.0, lambda: None };
        let mut k = 0;
        for (i, slot) in slots.iter().enumerate() {
            let enc = match self.pinned[i] {
                Some(v) => v,
                None => {
                    let v = free[k];
                    k += 1;
                    v
                }
            };
            match slot {
                Slot::Add => d.a = enc * enc,
                Slot::Prop => d.b = enc * enc,
                Slot::Power => d.pw = self.pow_map.decode(enc),
                Slot::Lambda => d.lambda = Some(self.lambda_map.decode(enc)),
            }
        }
        d
    }

    /// Evaluate the objective at the free coordinates.
    pub fn eval(&self, free: &[f64]) -> f64 {
        let d = self.decode(free);
        let lambda = d.lambda.unwrap_or(self.spec.lambda);
        // Proportional-style models keep proportional error defined at f = 0.
        let adjust_f = matches!(self.model, ResModel::Pow | ResModel::PropLam | ResModel::PowLam);
        let zero_to_one = matches!(self.model, ResModel::PropLam | ResModel::PowLam);

        let mut sum = 0.0;
        for i in 0..self.ys.len() {
            let ft = self.spec.forward_with(self.fs[i], lambda);
            let yt = self.spec.forward_with(self.ys[i], lambda);
            let fa = handle_f(self.prop_t, ft, self.fs[i], false, adjust_f);
            let mut g = match self.model {
                ResModel::Pow => d.b * fa.powf(d.pw),
                ResModel::AddLam => d.a,
                ResModel::PropLam => d.b * fa,
                ResModel::PowLam => d.b * fa.powf(d.pw),
                ResModel::AddProp | ResModel::AddPropLam => match self.combine {
                    CombineKind::Sum => d.a + d.b * fa,
                    CombineKind::Quadrature => (d.a * d.a + d.b * d.b * fa * fa).sqrt(),
                },
                ResModel::AddPow | ResModel::AddPowLam => {
                    let fp = fa.powf(d.pw);
                    match self.combine {
                        CombineKind::Sum => d.a + d.b * fp,
                        CombineKind::Quadrature => (d.a * d.a + d.b * d.b * fp * fp).sqrt(),
                    }
                }
                ResModel::Add | ResModel::Prop => unreachable!("closed-form models never reach the optimizer"),
            };
            if zero_to_one && g == 0.0 {
                g = 1.0;
            }
            g = g.clamp(SIGMA_FLOOR, SIGMA_CAP);
            let cur = (yt - ft) / g;
            sum += cur * cur + 2.0 * g.ln();
        }
        sum
    }
}

fn encode_slot(slot: Slot, p: &ResidualParams, pow_map: &BoundedBijection, lambda_map: &BoundedBijection) -> f64 {
    match slot {
        Slot::Add => p.a.abs().sqrt(),
        Slot::Prop => p.b.abs().sqrt(),
        Slot::Power => pow_map.encode(p.c),
        Slot::Lambda => lambda_map.encode(p.l),
    }
}

fn apply_decoded(slot: Slot, enc: f64, p: &mut ResidualParams, pas_k: f64, pow_map: &BoundedBijection, lambda_map: &BoundedBijection) {
    match slot {
        Slot::Add => p.a += pas_k * (enc * enc - p.a),
        Slot::Prop => p.b += pas_k * (enc * enc - p.b),
        Slot::Power => p.c += pas_k * (pow_map.decode(enc) - p.c),
        Slot::Lambda => p.l += pas_k * (lambda_map.decode(enc) - p.l),
    }
}

/// One endpoint's residual M-step.
///
/// `sig2` is the accumulated residual statistic divided by the endpoint's
/// observation count; `ys`/`fs` are the endpoint's sorted observation and
/// cached-prediction slices over all chains. `freeze_active` is whether the
/// freeze threshold has passed; frozen components snap to their configured
/// values and leave the optimizer's search space.
#[allow(clippy::too_many_arguments)]
pub fn update_endpoint(
    model: ResModel,
    params: &mut ResidualParams,
    spec: &TransformSpec,
    prop_t: bool,
    combine: CombineKind,
    ys: &[f64],
    fs: &[f64],
    sig2: f64,
    res_fixed: &[bool],
    res_value: &[f64],
    offset: usize,
    freeze_active: bool,
    pas_k: f64,
    opt: &OptimSettings,
) {
    match model {
        ResModel::Add => {
            if freeze_active && res_fixed[offset] {
                params.a = res_value[offset];
            } else {
                params.a = sig2.sqrt();
            }
            return;
        }
        ResModel::Prop => {
            if freeze_active && res_fixed[offset] {
                params.b = res_value[offset];
            } else {
                let s = if sig2 == 0.0 { 1.0 } else { sig2 };
                params.b = s.sqrt();
            }
            return;
        }
        _ => {}
    }

    let pow_map = BoundedBijection::new(opt.pow_range);
    let lambda_map = BoundedBijection::new(opt.lambda_range);
    let slots = model.slots();

    let mut pinned: Vec<Option<f64>> = vec![None; slots.len()];
    let mut start: Vec<f64> = Vec::with_capacity(slots.len());
    for (i, &slot) in slots.iter().enumerate() {
        if freeze_active && res_fixed[offset + i] {
            let v = res_value[offset + i];
            match slot {
                Slot::Add => params.a = v,
                Slot::Prop => params.b = v,
                Slot::Power => params.c = v,
                Slot::Lambda => params.l = v,
            }
            pinned[i] = Some(encode_slot(slot, params, &pow_map, &lambda_map));
        } else {
            start.push(encode_slot(slot, params, &pow_map, &lambda_map));
        }
    }

    let n = start.len();
    if n == 0 {
        return;
    }

    let objective = EndpointObjective {
        model,
        ys,
        fs,
        spec: *spec,
        prop_t,
        combine,
        pinned,
        pow_map,
        lambda_map,
    };

    let outcome = run_optimizer(&objective, &start, opt);
    if !outcome.fmin.is_finite() {
        // No usable optimum this iteration; the parameters keep their
        // previous values and the next iteration retries.
        log::debug!("residual optimizer returned non-finite objective; skipping update");
        return;
    }

    let mut k = 0;
    for (i, &slot) in slots.iter().enumerate() {
        if objective.pinned[i].is_some() {
            continue;
        }
        apply_decoded(slot, outcome.x[k], params, pas_k, &pow_map, &lambda_map);
        k += 1;
    }
}

fn run_optimizer(objective: &EndpointObjective<'_>, start: &[f64], opt: &OptimSettings) -> OptimOutcome {
    let n = start.len();
    if n == 1 {
        return minimize_scalar(|x| objective.eval(&[x]), start[0], opt.tol);
    }
    let step = vec![-0.2; n];
    match opt.kind {
        OptimKind::NelderMead => {
            NelderMead::with_budget(opt.tol, opt.itmax * n).minimize(|x| objective.eval(x), start, &step)
        }
        OptimKind::Alternative => {
            // Wider-budget pass first; fall back to the plain simplex when it
            // produces a non-finite optimum.
            let wide = NelderMead::with_budget(opt.tol, opt.itmax * n * n)
                .minimize(|x| objective.eval(x), start, &step);
            if wide.fmin.is_finite() {
                wide
            } else {
                log::warn!("alternative residual optimizer failed, switching to Nelder-Mead");
                NelderMead::with_budget(opt.tol, opt.itmax * n).minimize(|x| objective.eval(x), start, &step)
            }
        }
    }
}
