//! Rate statistics for aggregated (n, k) counts
//!
//! The spread estimator for a conversion rate is a policy choice, not a
//! fixed formula, so it sits behind the [`RateVariance`] trait. The default
//! is the binomial standard error of the rate.

/// Pluggable spread estimator for a rate derived from (n, k) counts
pub trait RateVariance: Send + Sync {
    /// Standard deviation of the rate estimate `k / n`
    ///
    /// Must return 0.0 when `n` is 0.
    fn stdev(&self, n: u64, k: u64) -> f64;
}

/// Binomial standard error: `sqrt(p * (1 - p) / n)` with `p = k / n`
///
/// Treats each of the `n` trials as an independent Bernoulli draw. This is
/// the engine's default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinomialVariance;

impl RateVariance for BinomialVariance {
    fn stdev(&self, n: u64, k: u64) -> f64 {
        if n == 0 {
            return 0.0;
        }
        let n_f = n as f64;
        let p = (k as f64 / n_f).clamp(0.0, 1.0);
        (p * (1.0 - p) / n_f).sqrt()
    }
}

/// Mean rate `k / n`, 0.0 when `n` is 0
pub fn mean_rate(n: u64, k: u64) -> f64 {
    if n == 0 {
        0.0
    } else {
        k as f64 / n as f64
    }
}
