//! Censored-observation corrections for the Gaussian data likelihood.
//!
//! An observation with a nonzero censoring flag contributes the negative log
//! probability of the censored region instead of the Gaussian density. The
//! flag follows the dataset convention: `+1` means the recorded value is an
//! upper bound on the latent observation (below the limit of quantification),
//! `-1` means it is a lower bound. When the Tobit `limit` is finite as well,
//! the latent value is confined between the limit and the recorded value and
//! the contribution is the interval probability.

use statrs::function::erf::erfc;

/// Standard normal CDF.
///
/// Uses erfc for better numerical behavior in the tails:
/// `Phi(x) = 0.5 * erfc(-x / sqrt(2))`.
#[inline]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

// Probabilities are floored before the log so a censored region far in a
// tail yields a large finite penalty instead of infinity.
const PROB_FLOOR: f64 = 1.0e-300;

/// Replacement for one Gaussian `DYF` entry under censoring.
///
/// `dyf` is the ordinary Gaussian contribution, returned unchanged when
/// `cens == 0`. `y_t`, `limit_t`, and `f_t` are on the transformed scale;
/// `sigma` is the observation's standard deviation.
pub fn cens_normal(cens: f64, y_t: f64, limit_t: f64, dyf: f64, f_t: f64, sigma: f64) -> f64 {
    if cens == 0.0 {
        return dyf;
    }
    if cens > 0.0 {
        // latent value below y (recorded bound), above limit when finite
        if limit_t.is_finite() {
            let b = normal_cdf((y_t - f_t) / sigma);
            let a = normal_cdf((limit_t - f_t) / sigma);
            -((b - a).max(PROB_FLOOR)).ln()
        } else {
            -normal_cdf((y_t - f_t) / sigma).max(PROB_FLOOR).ln() - sigma.ln()
        }
    } else {
        // latent value above y, below limit when finite
        if limit_t.is_finite() {
            let b = normal_cdf((limit_t - f_t) / sigma);
            let a = normal_cdf((y_t - f_t) / sigma);
            -((b - a).max(PROB_FLOOR)).ln()
        } else {
            -normal_cdf((f_t - y_t) / sigma).max(PROB_FLOOR).ln() - sigma.ln()
        }
    }
}
