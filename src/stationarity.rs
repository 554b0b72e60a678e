//! Augmented Dickey-Fuller screening of pair spreads.
//!
//! The regression includes a constant and `p` lagged differences:
//! `dy_t = a + g * y_{t-1} + sum(d_i * dy_{t-i}) + e_t`, with `p` picked by AIC
//! on a common sample. The t-statistic of `g` is mapped to a p-value with
//! MacKinnon's (1994) approximation for the constant-only case.

use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::metrics::PairMetrics;

pub const DEFAULT_ADF_P_THRESHOLD: f64 = 0.05;
pub const DEFAULT_MIN_SAMPLES: usize = 120;

// MacKinnon (1994), regression "c", one series.
const TAU_MAX_C: f64 = 2.74;
const TAU_MIN_C: f64 = -18.83;
const TAU_STAR_C: f64 = -1.61;
const TAU_C_SMALLP: [f64; 3] = [2.1659, 1.4412, 0.038269];
const TAU_C_LARGEP: [f64; 4] = [1.7339, 0.93202, -0.12745, -0.010368];

// MacKinnon (2010) response surface for 1%, 5%, 10% critical values.
const TAU_C_CRIT: [[f64; 4]; 3] = [
    [-3.43035, -6.5393, -16.786, -79.433],
    [-2.86154, -2.8903, -4.234, -40.040],
    [-2.56677, -1.5384, -2.809, 0.0],
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CriticalValues {
    pub one_pct: f64,
    pub five_pct: f64,
    pub ten_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationarityReport {
    pub adf_statistic: f64,
    pub p_value: f64,
    pub used_lag: usize,
    pub n_obs: usize,
    pub critical_values: CriticalValues,
    /// Mean-reversion half-life in observations, from the zero-lag regression.
    pub half_life: f64,
    pub is_stationary: bool,
}

/// Verdict on whether a pair's spread mean-reverts.
pub trait StationarityScreen: Send + Sync {
    fn screen(&self, metrics: &PairMetrics) -> EngineResult<StationarityReport>;
}

#[derive(Debug, Clone)]
pub struct AdfScreener {
    pub p_threshold: f64,
    pub min_samples: usize,
    /// Upper bound for the lag search; `None` uses `ceil(12 * (n / 100)^0.25)`.
    pub max_lag: Option<usize>,
}

impl Default for AdfScreener {
    fn default() -> Self {
        Self {
            p_threshold: DEFAULT_ADF_P_THRESHOLD,
            min_samples: DEFAULT_MIN_SAMPLES,
            max_lag: None,
        }
    }
}

impl AdfScreener {
    pub fn new(p_threshold: f64, min_samples: usize, max_lag: Option<usize>) -> Self {
        Self {
            p_threshold,
            min_samples,
            max_lag,
        }
    }

    pub fn is_stationary(&self, spread: &[f64]) -> EngineResult<bool> {
        Ok(self.test(spread)?.is_stationary)
    }

    /// Runs the test on `spread` after dropping non-finite values.
    pub fn test(&self, spread: &[f64]) -> EngineResult<StationarityReport> {
        let y: Vec<f64> = spread.iter().copied().filter(|v| v.is_finite()).collect();
        let required = self.min_samples.max(8);
        if y.len() < required {
            return Err(EngineError::InsufficientHistory {
                required,
                available: y.len(),
            });
        }
        let n = y.len();
        // keep enough rows for the widest regression
        let lag_cap = (n / 2).saturating_sub(2);
        let max_lag = self
            .max_lag
            .unwrap_or_else(|| (12.0 * (n as f64 / 100.0).powf(0.25)).ceil() as usize)
            .min(lag_cap);

        let dy: Vec<f64> = y.windows(2).map(|w| w[1] - w[0]).collect();

        let mut best: Option<(f64, usize)> = None;
        for lag in 0..=max_lag {
            let (endog, exog) = design(&y, &dy, lag, max_lag);
            if let Some(fit) = ols(&endog, &exog) {
                let aic = fit.aic();
                // ties keep the shorter lag
                if best.map_or(true, |(best_aic, _)| aic < best_aic) {
                    best = Some((aic, lag));
                }
            }
        }
        let used_lag = best.map(|(_, lag)| lag).ok_or_else(degenerate)?;

        let (endog, exog) = design(&y, &dy, used_lag, used_lag);
        let fit = ols(&endog, &exog).ok_or_else(degenerate)?;
        let adf_statistic = fit.t_value(1);
        if !adf_statistic.is_finite() {
            return Err(degenerate());
        }
        let p_value = mackinnon_p(adf_statistic);
        let n_obs = endog.len();

        let (endog0, exog0) = design(&y, &dy, 0, 0);
        let half_life = ols(&endog0, &exog0)
            .map(|fit| half_life(fit.beta[1]))
            .unwrap_or(f64::INFINITY);

        let report = StationarityReport {
            adf_statistic,
            p_value,
            used_lag,
            n_obs,
            critical_values: mackinnon_crit(n_obs),
            half_life,
            is_stationary: p_value <= self.p_threshold,
        };
        log::debug!(
            "[ADF] stat={:.4} p={:.4} lag={} nobs={} half_life={:.2}",
            report.adf_statistic,
            report.p_value,
            report.used_lag,
            report.n_obs,
            report.half_life
        );
        Ok(report)
    }
}

impl StationarityScreen for AdfScreener {
    fn screen(&self, metrics: &PairMetrics) -> EngineResult<StationarityReport> {
        self.test(&metrics.spread())
    }
}

fn degenerate() -> EngineError {
    EngineError::data_unavailable("spread", "degenerate ADF regression")
}

/// Rows `j` in `start..dy.len()` regress `dy[j]` on `[1, y[j], dy[j-1], .., dy[j-lag]]`.
fn design(y: &[f64], dy: &[f64], lag: usize, start: usize) -> (Vec<f64>, Vec<Vec<f64>>) {
    let mut endog = Vec::with_capacity(dy.len().saturating_sub(start));
    let mut exog = Vec::with_capacity(dy.len().saturating_sub(start));
    for j in start..dy.len() {
        let mut row = Vec::with_capacity(lag + 2);
        row.push(1.0);
        row.push(y[j]);
        for i in 1..=lag {
            row.push(dy[j - i]);
        }
        endog.push(dy[j]);
        exog.push(row);
    }
    (endog, exog)
}

struct OlsFit {
    beta: Vec<f64>,
    std_err: Vec<f64>,
    ssr: f64,
    nobs: usize,
}

impl OlsFit {
    fn aic(&self) -> f64 {
        let n = self.nobs as f64;
        let llf = -n / 2.0 * ((2.0 * std::f64::consts::PI).ln() + (self.ssr / n).ln() + 1.0);
        -2.0 * llf + 2.0 * self.beta.len() as f64
    }

    fn t_value(&self, idx: usize) -> f64 {
        self.beta[idx] / self.std_err[idx]
    }
}

fn ols(endog: &[f64], exog: &[Vec<f64>]) -> Option<OlsFit> {
    let nobs = endog.len();
    let k = exog.first()?.len();
    if nobs <= k {
        return None;
    }
    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, &yv) in exog.iter().zip(endog) {
        for a in 0..k {
            xty[a] += row[a] * yv;
            for b in a..k {
                xtx[a][b] += row[a] * row[b];
            }
        }
    }
    for a in 0..k {
        for b in 0..a {
            xtx[a][b] = xtx[b][a];
        }
    }
    let inv = invert(xtx)?;
    let beta: Vec<f64> = (0..k)
        .map(|a| (0..k).map(|b| inv[a][b] * xty[b]).sum())
        .collect();
    let ssr: f64 = exog
        .iter()
        .zip(endog)
        .map(|(row, &yv)| {
            let fit: f64 = row.iter().zip(&beta).map(|(x, b)| x * b).sum();
            (yv - fit) * (yv - fit)
        })
        .sum();
    if ssr <= 0.0 || !ssr.is_finite() {
        return None;
    }
    let sigma2 = ssr / (nobs - k) as f64;
    let std_err = (0..k).map(|a| (sigma2 * inv[a][a]).sqrt()).collect();
    Some(OlsFit {
        beta,
        std_err,
        ssr,
        nobs,
    })
}

/// Gauss-Jordan inversion with partial pivoting.
fn invert(mut m: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let k = m.len();
    let scale = m
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 {
        return None;
    }
    let mut inv: Vec<Vec<f64>> = (0..k)
        .map(|i| (0..k).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    for col in 0..k {
        let pivot = (col..k).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() <= scale * 1e-13 {
            return None;
        }
        m.swap(col, pivot);
        inv.swap(col, pivot);
        let p = m[col][col];
        for j in 0..k {
            m[col][j] /= p;
            inv[col][j] /= p;
        }
        for row in 0..k {
            if row == col {
                continue;
            }
            let factor = m[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..k {
                m[row][j] -= factor * m[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    Some(inv)
}

fn half_life(gamma: f64) -> f64 {
    let ar_coef = 1.0 + gamma;
    if ar_coef <= 0.0 || ar_coef >= 1.0 {
        f64::INFINITY
    } else {
        -(2.0_f64.ln()) / ar_coef.ln()
    }
}

/// Approximate p-value of an ADF statistic (constant, no trend).
pub fn mackinnon_p(stat: f64) -> f64 {
    if stat > TAU_MAX_C {
        return 1.0;
    }
    if stat < TAU_MIN_C {
        return 0.0;
    }
    let poly = if stat <= TAU_STAR_C {
        polyval(&TAU_C_SMALLP, stat)
    } else {
        polyval(&TAU_C_LARGEP, stat)
    };
    norm_cdf(poly)
}

pub fn mackinnon_crit(nobs: usize) -> CriticalValues {
    let inv = 1.0 / nobs.max(1) as f64;
    let crit = |c: &[f64; 4]| polyval(c, inv);
    CriticalValues {
        one_pct: crit(&TAU_C_CRIT[0]),
        five_pct: crit(&TAU_C_CRIT[1]),
        ten_pct: crit(&TAU_C_CRIT[2]),
    }
}

/// `c[0] + c[1] x + c[2] x^2 + ...`
fn polyval(coef: &[f64], x: f64) -> f64 {
    coef.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

// Chebyshev fit, fractional error below 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let ans = t
        * (-z * z - 1.265_512_23
            + t * (1.000_023_68
                + t * (0.374_091_96
                    + t * (0.096_784_18
                        + t * (-0.186_288_06
                            + t * (0.278_868_07
                                + t * (-1.135_203_98
                                    + t * (1.488_515_87
                                        + t * (-0.822_152_23 + t * 0.170_872_77)))))))))
            .exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn ar1(phi: f64, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut y = Vec::with_capacity(n);
        let mut prev = 0.0;
        for _ in 0..n {
            prev = phi * prev + noise.sample(&mut rng);
            y.push(prev);
        }
        y
    }

    #[test]
    fn norm_cdf_matches_reference_points() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((norm_cdf(1.96) - 0.975_002).abs() < 1e-5);
        assert!((norm_cdf(-1.644_854) - 0.05).abs() < 1e-5);
    }

    #[test]
    fn mackinnon_p_at_five_pct_asymptotic_critical_value() {
        let p = mackinnon_p(-2.86154);
        assert!((p - 0.05).abs() < 0.002, "p={}", p);
        assert_eq!(mackinnon_p(3.0), 1.0);
        assert_eq!(mackinnon_p(-25.0), 0.0);
        assert!(mackinnon_p(-3.5) < mackinnon_p(-2.0));
    }

    #[test]
    fn critical_values_approach_asymptotic_limits() {
        let crit = mackinnon_crit(1_000_000);
        assert!((crit.one_pct + 3.43035).abs() < 1e-3);
        assert!((crit.five_pct + 2.86154).abs() < 1e-3);
        assert!((crit.ten_pct + 2.56677).abs() < 1e-3);
        let small = mackinnon_crit(100);
        assert!(small.five_pct < crit.five_pct);
    }

    #[test]
    fn ar1_process_is_stationary() {
        let screener = AdfScreener::default();
        let report = screener.test(&ar1(0.3, 400, 7)).unwrap();
        assert!(report.is_stationary, "{:?}", report);
        assert!(report.p_value < 0.01);
        assert!(report.adf_statistic < report.critical_values.one_pct);
        assert!(report.half_life.is_finite() && report.half_life < 2.0);
    }

    #[test]
    fn explosive_process_is_not_stationary() {
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut y = Vec::new();
        let mut prev = 10.0;
        for _ in 0..300 {
            prev = 1.02 * prev + noise.sample(&mut rng);
            y.push(prev);
        }
        let screener = AdfScreener::default();
        let report = screener.test(&y).unwrap();
        assert!(!report.is_stationary);
        assert!(report.p_value > 0.9);
        assert!(!screener.is_stationary(&y).unwrap());
    }

    #[test]
    fn screening_is_deterministic() {
        let spread = ar1(0.8, 250, 3);
        let screener = AdfScreener::default();
        let first = screener.test(&spread).unwrap();
        let second = screener.test(&spread).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn non_finite_values_are_dropped_before_counting() {
        let mut spread = ar1(0.3, 130, 5);
        for v in spread.iter_mut().take(20) {
            *v = f64::NAN;
        }
        let err = AdfScreener::default().test(&spread).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientHistory {
                required: 120,
                available: 110
            }
        );
    }

    #[test]
    fn fixed_max_lag_bounds_the_search() {
        let screener = AdfScreener::new(0.05, 50, Some(2));
        let report = screener.test(&ar1(0.5, 200, 9)).unwrap();
        assert!(report.used_lag <= 2);
        assert_eq!(report.n_obs, 199 - report.used_lag);
    }

    #[test]
    fn constant_spread_is_rejected_as_degenerate() {
        let err = AdfScreener::default().test(&vec![1.5; 200]).unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { .. }));
    }
}
