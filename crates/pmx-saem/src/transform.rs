//! Monotone power transforms applied to observations and predictions before
//! residual computation.
//!
//! Each endpoint carries a [`TransformSpec`] selecting one of the transform
//! families below. Both the observation and the model prediction pass through
//! the same transform, so residuals are always formed on the transformed
//! scale. Domain violations (log of a non-positive value, Box-Cox of a
//! non-positive value) propagate as NaN; the estimator treats NaN in
//! transformed *data* as a hard error and NaN in transformed *predictions* as
//! a soft one.
//!
//! The module also provides [`BoundedBijection`], the logit-style map between
//! an unconstrained optimizer coordinate and a bounded interval `(-R, R)`.
//! The residual optimizer uses it to estimate the power exponent and the
//! Box-Cox lambda without constrained search.

use pmx_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Transform family selector.
///
/// The integer tags accepted by [`TransformKind::from_tag`] match the
/// configuration encoding consumed by [`crate::config::SaemConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformKind {
    /// Box-Cox: `(y^λ − 1)/λ`, natural log at `λ = 0`. Requires `y > 0`.
    BoxCox,
    /// Yeo-Johnson: total on the real line.
    YeoJohnson,
    /// Identity.
    Identity,
    /// Natural log. Requires `y > 0`.
    Log,
    /// Logit onto `(low, hi)` composed with Box-Cox on the logit scale.
    /// `λ = 1` short-circuits to the pure logit.
    BoundedBoxCox,
    /// Logit onto `(low, hi)` composed with Yeo-Johnson on the logit scale.
    BoundedYeoJohnson,
}

impl TransformKind {
    /// Decode the configuration tag.
    pub fn from_tag(tag: i64) -> Result<Self> {
        match tag {
            0 => Ok(TransformKind::BoxCox),
            1 => Ok(TransformKind::YeoJohnson),
            2 => Ok(TransformKind::Identity),
            3 => Ok(TransformKind::Log),
            4 => Ok(TransformKind::BoundedBoxCox),
            5 => Ok(TransformKind::BoundedYeoJohnson),
            _ => Err(Error::Config(format!("unknown transform tag {tag}"))),
        }
    }

    /// Configuration tag for this transform.
    pub fn tag(&self) -> i64 {
        match self {
            TransformKind::BoxCox => 0,
            TransformKind::YeoJohnson => 1,
            TransformKind::Identity => 2,
            TransformKind::Log => 3,
            TransformKind::BoundedBoxCox => 4,
            TransformKind::BoundedYeoJohnson => 5,
        }
    }
}

/// Per-endpoint transform: family plus its parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransformSpec {
    pub kind: TransformKind,
    /// Box-Cox / Yeo-Johnson lambda.
    pub lambda: f64,
    /// Lower bound for the bounded variants.
    pub low: f64,
    /// Upper bound for the bounded variants.
    pub hi: f64,
}

impl TransformSpec {
    /// Identity transform; the default for endpoints without a transform.
    pub fn identity() -> Self {
        Self { kind: TransformKind::Identity, lambda: 1.0, low: f64::NEG_INFINITY, hi: f64::INFINITY }
    }

    /// Forward transform with the spec's own lambda.
    #[inline]
    pub fn forward(&self, y: f64) -> f64 {
        self.forward_with(y, self.lambda)
    }

    /// Forward transform with an explicit lambda (used while lambda itself is
    /// being estimated by the residual optimizer).
    pub fn forward_with(&self, y: f64, lambda: f64) -> f64 {
        match self.kind {
            TransformKind::Identity => y,
            TransformKind::Log => y.ln(),
            TransformKind::BoxCox => box_cox(y, lambda),
            TransformKind::YeoJohnson => yeo_johnson(y, lambda),
            TransformKind::BoundedBoxCox => {
                let z = logit(y, self.low, self.hi);
                if lambda == 1.0 { z } else { box_cox(z, lambda) }
            }
            TransformKind::BoundedYeoJohnson => {
                let z = logit(y, self.low, self.hi);
                if lambda == 1.0 { z } else { yeo_johnson(z, lambda) }
            }
        }
    }

    /// Inverse transform with the spec's own lambda.
    #[inline]
    pub fn inverse(&self, z: f64) -> f64 {
        self.inverse_with(z, self.lambda)
    }

    /// Inverse transform with an explicit lambda.
    pub fn inverse_with(&self, z: f64, lambda: f64) -> f64 {
        match self.kind {
            TransformKind::Identity => z,
            TransformKind::Log => z.exp(),
            TransformKind::BoxCox => box_cox_inv(z, lambda),
            TransformKind::YeoJohnson => yeo_johnson_inv(z, lambda),
            TransformKind::BoundedBoxCox => {
                let w = if lambda == 1.0 { z } else { box_cox_inv(z, lambda) };
                expit(w, self.low, self.hi)
            }
            TransformKind::BoundedYeoJohnson => {
                let w = if lambda == 1.0 { z } else { yeo_johnson_inv(z, lambda) };
                expit(w, self.low, self.hi)
            }
        }
    }
}

/// Box-Cox transform. `y <= 0` yields NaN for non-integer powers / log.
#[inline]
pub fn box_cox(y: f64, lambda: f64) -> f64 {
    if lambda == 0.0 { y.ln() } else { (y.powf(lambda) - 1.0) / lambda }
}

/// Inverse Box-Cox transform.
#[inline]
pub fn box_cox_inv(z: f64, lambda: f64) -> f64 {
    if lambda == 0.0 { z.exp() } else { (lambda * z + 1.0).powf(1.0 / lambda) }
}

/// Yeo-Johnson transform.
pub fn yeo_johnson(y: f64, lambda: f64) -> f64 {
    if y >= 0.0 {
        if lambda == 0.0 { (y + 1.0).ln() } else { ((y + 1.0).powf(lambda) - 1.0) / lambda }
    } else if lambda == 2.0 {
        -(1.0 - y).ln()
    } else {
        -((1.0 - y).powf(2.0 - lambda) - 1.0) / (2.0 - lambda)
    }
}

/// Inverse Yeo-Johnson transform.
pub fn yeo_johnson_inv(z: f64, lambda: f64) -> f64 {
    if z >= 0.0 {
        if lambda == 0.0 { z.exp() - 1.0 } else { (lambda * z + 1.0).powf(1.0 / lambda) - 1.0 }
    } else if lambda == 2.0 {
        1.0 - (-z).exp()
    } else {
        1.0 - (1.0 - (2.0 - lambda) * z).powf(1.0 / (2.0 - lambda))
    }
}

#[inline]
fn logit(y: f64, low: f64, hi: f64) -> f64 {
    ((y - low) / (hi - y)).ln()
}

#[inline]
fn expit(z: f64, low: f64, hi: f64) -> f64 {
    low + (hi - low) / (1.0 + (-z).exp())
}

/// Bijection between an unconstrained optimizer coordinate and `(-R, R)`.
///
/// [`BoundedBijection::encode`] pins its input to `(-0.99R, 0.99R)` before the
/// logit so the map stays invertible at the edges of the range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundedBijection {
    r: f64,
}

impl BoundedBijection {
    pub fn new(range: f64) -> Self {
        Self { r: range.abs() }
    }

    /// Half-width of the target interval.
    pub fn range(&self) -> f64 {
        self.r
    }

    /// Unconstrained coordinate to a value in `(-R, R)`.
    #[inline]
    pub fn decode(&self, x: f64) -> f64 {
        expit(x, -self.r, self.r)
    }

    /// Value in `(-R, R)` (pinned to 99% of the range) to the unconstrained
    /// coordinate.
    #[inline]
    pub fn encode(&self, v: f64) -> f64 {
        let v = v.clamp(-0.99 * self.r, 0.99 * self.r);
        logit(v, -self.r, self.r)
    }
}
